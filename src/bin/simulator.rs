use clap::{App, Arg};
use colored::*;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use stompsync::display::COLOR_DARK;
use stompsync::message::sysex_data;
use stompsync::{
    AnalogConfig, AnalogControl, BinaryActionConfig, BinaryParameterAction, Color,
    ComparisonMode, Controller, ControllerConfig, DisplaySink, DisableValue, Endpoint,
    LeaseProtocol, ListenerId, MessageTemplate, MidiMessage, MidiRouter, MidiTransport, Route,
};
use tracing::info;

const MANUFACTURER: [u8; 3] = [0x00, 0x20, 0x33];
const FN_REQUEST: u8 = 0x41;
const FN_RESPONSE: u8 = 0x01;
const FN_LEASE: [u8; 2] = [0x7e, 0x00];
const FN_SENSE: [u8; 2] = [0x7e, 0x01];

const BOOST_CONTROL: u8 = 16;
const VOLUME_CONTROL: u8 = 7;
const SENSE_INTERVAL_MS: u64 = 2000;

/// Device-side emulation: answers parameter requests, echoes sets and, while
/// a lease is active, streams sense beacons and unsolicited value pushes.
struct VirtualDevice {
    params: HashMap<u8, u16>,
    to_controller: VecDeque<MidiMessage>,
    lease_until: Option<u64>,
    next_sense_at: u64,
    now: u64,
}

impl VirtualDevice {
    fn new() -> Self {
        Self {
            params: HashMap::new(),
            to_controller: VecDeque::new(),
            lease_until: None,
            next_sense_at: 0,
            now: 0,
        }
    }

    fn leased(&self) -> bool {
        self.lease_until.is_some_and(|until| self.now < until)
    }

    fn tick(&mut self, now: u64) {
        self.now = now;
        if self.lease_until.is_some_and(|until| now >= until) {
            self.lease_until = None;
        }
        if self.leased() && now >= self.next_sense_at {
            self.to_controller.push_back(MidiMessage::SystemExclusive {
                manufacturer_id: MANUFACTURER,
                data: sysex_data(&[FN_SENSE[0], FN_SENSE[1], 0, 0]),
            });
            self.next_sense_at = now + SENSE_INTERVAL_MS;
        }
    }

    /// Simulates someone turning a knob on the device itself.
    fn external_change(&mut self, id: u8, value: u16) {
        self.params.insert(id, value);
        if self.leased() {
            let response = self.response(id);
            self.to_controller.push_back(response);
        }
    }

    fn handle(&mut self, message: &MidiMessage) {
        match message {
            MidiMessage::ControlChange {
                channel: 0,
                control,
                value,
            } => {
                self.params.insert(*control, u16::from(*value));
                if self.leased() {
                    let response = self.response(*control);
                    self.to_controller.push_back(response);
                }
            }
            MidiMessage::SystemExclusive {
                manufacturer_id,
                data,
            } if *manufacturer_id == MANUFACTURER => {
                if data.len() >= 4 && data[..2] == FN_LEASE {
                    let seconds = (u64::from(data[2]) << 7) | u64::from(data[3]);
                    self.lease_until = Some(self.now + seconds * 1000);
                    self.next_sense_at = self.now;
                } else if data.len() >= 2 && data[0] == FN_REQUEST {
                    let response = self.response(data[1]);
                    self.to_controller.push_back(response);
                }
            }
            _ => {}
        }
    }

    fn response(&self, id: u8) -> MidiMessage {
        let value = self.params.get(&id).copied().unwrap_or(0);
        MessageTemplate::SystemExclusive {
            manufacturer_id: MANUFACTURER,
            prefix: sysex_data(&[FN_RESPONSE, id]),
        }
        .render(value)
    }
}

struct DevicePort(Rc<RefCell<VirtualDevice>>);

impl MidiTransport for DevicePort {
    fn send(&mut self, message: &MidiMessage) {
        self.0.borrow_mut().handle(message);
    }

    fn receive(&mut self) -> Option<MidiMessage> {
        self.0.borrow_mut().to_controller.pop_front()
    }
}

/// Switch LED stand-in: remembers the last written state for the status line.
#[derive(Default)]
struct ConsoleLed {
    color: Color,
    brightness: f32,
    text: String,
}

impl DisplaySink for ConsoleLed {
    fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    fn set_brightness(&mut self, brightness: f32) {
        self.brightness = brightness;
    }

    fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }
}

fn request_message(id: u8) -> MidiMessage {
    MidiMessage::SystemExclusive {
        manufacturer_id: MANUFACTURER,
        data: sysex_data(&[FN_REQUEST, id]),
    }
}

fn response_template(id: u8) -> MessageTemplate {
    MessageTemplate::SystemExclusive {
        manufacturer_id: MANUFACTURER,
        prefix: sysex_data(&[FN_RESPONSE, id]),
    }
}

/// Triangle sweep over the raw analog domain, emulating a pedal rocking back
/// and forth.
fn pedal_sweep(tick: u64) -> u16 {
    let phase = (tick * 1200) % 131072;
    if phase < 65536 {
        phase as u16
    } else {
        (131071 - phase) as u16
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("stompsync-simulator")
        .version("0.1.0")
        .author("Stage Systems Engineering Team")
        .about("🎸 Foot controller synchronization core against a virtual MIDI device")
        .arg(
            Arg::with_name("ticks")
                .short("t")
                .long("ticks")
                .value_name("TICKS")
                .help("Number of simulation ticks to run")
                .takes_value(true)
                .default_value("400"),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Simulated milliseconds per tick")
                .takes_value(true)
                .default_value("20"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Controller configuration as JSON")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("no-lease")
                .long("no-lease")
                .help("Disable the bidirectional lease protocol (pure polling)"),
        )
        .get_matches();

    let ticks: u64 = matches.value_of("ticks").unwrap_or("400").parse()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or("20").parse()?;
    let config = match matches.value_of("config") {
        Some(path) => ControllerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ControllerConfig::default(),
    };

    println!("🎸 Foot Controller Simulator");
    println!("============================");

    let device = Rc::new(RefCell::new(VirtualDevice::new()));
    let router = MidiRouter::new(
        vec![Box::new(DevicePort(Rc::clone(&device)))],
        &[
            Route::new(Endpoint::Application, Endpoint::Port(0)),
            Route::new(Endpoint::Port(0), Endpoint::Application),
        ],
    )?;

    let mut controller = Controller::new(config, router);

    let boost = controller.client_mut().define(
        "Boost",
        &[MessageTemplate::ControlChange {
            channel: 0,
            control: BOOST_CONTROL,
        }],
        Some(request_message(BOOST_CONTROL)),
        Some(response_template(BOOST_CONTROL)),
    )?;
    let volume = controller.client_mut().define(
        "Volume",
        &[MessageTemplate::ControlChange {
            channel: 0,
            control: VOLUME_CONTROL,
        }],
        None,
        None,
    )?;
    controller.client_mut().register(boost, ListenerId(0))?;

    if !matches.is_present("no-lease") {
        let lease_seconds = controller.config().lease_seconds;
        controller.client_mut().set_protocol(Box::new(LeaseProtocol::new(
            MessageTemplate::SystemExclusive {
                manufacturer_id: MANUFACTURER,
                prefix: sysex_data(&FN_LEASE),
            },
            MessageTemplate::SystemExclusive {
                manufacturer_id: MANUFACTURER,
                prefix: sysex_data(&FN_SENSE),
            },
            lease_seconds,
        )));
    }

    let mut action_config = BinaryActionConfig::default();
    action_config.text = "BOOST".to_string();
    action_config.color = Color(0, 255, 0);
    action_config.value_enable.clear();
    action_config.value_enable.push(1).map_err(|_| "slot overflow")?;
    action_config.value_disable.clear();
    action_config
        .value_disable
        .push(DisableValue::Fixed(0))
        .map_err(|_| "slot overflow")?;
    action_config.reference_value = Some(1);
    action_config.comparison = ComparisonMode::GreaterEqual;
    let mut action = BinaryParameterAction::new(boost, action_config, controller.config());

    let mut pedal = AnalogControl::new(volume, controller.client(), &AnalogConfig::default());
    let mut led = ConsoleLed::default();

    controller.init();
    info!(ticks, tick_ms, "simulation starting");

    for tick in 0..ticks {
        let now = tick * tick_ms;
        device.borrow_mut().tick(now);

        // Scripted stomps every two seconds of simulated time.
        if tick % 100 == 40 {
            let (client, router) = controller.parts_mut();
            action.press(client, router, now);
        }
        if tick % 100 == 42 {
            let (client, router) = controller.parts_mut();
            action.release(client, router, now);
        }

        // Someone twists the knob on the device at the halfway point.
        if tick == ticks / 2 {
            device.borrow_mut().external_change(BOOST_CONTROL, 0);
        }

        {
            let (client, router) = controller.parts_mut();
            pedal.process(pedal_sweep(tick), client, router, None, now);
        }

        controller.tick(now, &mut [&mut action]);
        action.update_display(&mut led);

        if tick % 50 == 0 {
            print_status(&controller, &led, boost, volume, now);
        }

        thread::sleep(Duration::from_millis(2));
    }

    println!();
    println!("📊 Final engine statistics");
    println!(
        "{}",
        serde_json::to_string_pretty(controller.client().stats())?
    );

    Ok(())
}

fn print_status(
    controller: &Controller,
    led: &ConsoleLed,
    boost: stompsync::MappingId,
    volume: stompsync::MappingId,
    now: u64,
) {
    let indicator = controller.protocol_indicator().unwrap_or(COLOR_DARK);
    let link = "●".truecolor(indicator.0, indicator.1, indicator.2);
    let switch = "■".truecolor(led.color.0, led.color.1, led.color.2);
    let boost_value = controller.client().value(boost);
    let volume_value = controller.client().value(volume);

    println!(
        "{} {} t={:>6}ms  boost={:<10} volume={:<10} label={:<6} led={:.2}",
        link,
        switch,
        now,
        format!("{boost_value:?}"),
        format!("{volume_value:?}"),
        led.text,
        led.brightness,
    );
}
