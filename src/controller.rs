use crate::client::{ClientEventKind, MappingListener, SyncClient};
use crate::config::ControllerConfig;
use crate::display::Color;
use crate::routing::MidiRouter;
use crate::timing::{Millis, PeriodCounter};
use tracing::{info, warn};

/// Top-level orchestration: owns the synchronization engine and the routing
/// fabric, gates them to the configured tick period and dispatches engine
/// notifications to the caller's listener objects.
///
/// Listener objects stay with the caller; they are handed in on every tick,
/// indexed by the [`crate::client::ListenerId`] they were registered under.
/// This keeps listeners free to call back into the engine between ticks.
pub struct Controller {
    client: SyncClient,
    router: MidiRouter,
    tick: PeriodCounter,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(config: ControllerConfig, router: MidiRouter) -> Self {
        Self {
            client: SyncClient::new(&config),
            tick: PeriodCounter::new(config.tick_interval_ms),
            router,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut SyncClient {
        &mut self.client
    }

    /// Engine and fabric together, for call sites that need both mutably
    /// (user input paths like [`crate::action::BinaryParameterAction::press`]).
    pub fn parts_mut(&mut self) -> (&mut SyncClient, &mut MidiRouter) {
        (&mut self.client, &mut self.router)
    }

    /// Indicator color for the bidirectional link, if a protocol is installed.
    pub fn protocol_indicator(&self) -> Option<Color> {
        self.client.protocol_state().map(|s| s.indicator_color())
    }

    /// Closes registration. Call once after all mappings and listeners are
    /// wired up; the first subsequent [`Controller::tick`] runs immediately.
    pub fn init(&mut self) {
        self.client.start();
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "controller initialized"
        );
    }

    /// Runs one synchronization round if the tick period has elapsed and
    /// dispatches the resulting notifications. Returns whether a round ran.
    ///
    /// Call as often as convenient; the period gate makes over-calling cheap.
    pub fn tick(&mut self, now: Millis, listeners: &mut [&mut dyn MappingListener]) -> bool {
        if !self.tick.exceeded(now) {
            return false;
        }

        let events = self.client.update(&mut self.router, now);
        for event in &events {
            let Some(listener) = listeners.get_mut(event.listener.0) else {
                warn!(listener = event.listener.0, "no listener at dispatch index");
                continue;
            };
            let mapping = self.client.mapping(event.mapping);
            match event.kind {
                ClientEventKind::ParameterChanged => listener.parameter_changed(mapping),
                ClientEventKind::RequestTerminated => listener.request_terminated(mapping),
            }
        }
        true
    }
}

impl core::fmt::Debug for Controller {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Controller")
            .field("client", &self.client)
            .field("router", &self.router)
            .finish()
    }
}
