use crate::display::{Color, COLOR_DARK, COLOR_GREEN, COLOR_ORANGE};
use crate::mapping::ParameterMapping;
use crate::message::{MessageTemplate, MidiMessage};
use crate::routing::MidiRouter;
use crate::timing::Millis;
use serde::Serialize;
use tracing::{debug, trace};

/// Connectivity status of the bidirectional layer, also the indicator signal
/// for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolState {
    /// No handshake sent yet.
    Uninitialized,
    /// Handshake sent, no sense traffic from the device yet (or the lease
    /// silently lapsed). The engine polls normally in this state.
    Establishing,
    /// Device sense traffic observed within the lease window; the device
    /// streams changes unsolicited and covered mappings are not polled.
    Established,
}

impl ProtocolState {
    pub fn indicator_color(self) -> Color {
        match self {
            ProtocolState::Uninitialized => COLOR_DARK,
            ProtocolState::Establishing => COLOR_ORANGE,
            ProtocolState::Established => COLOR_GREEN,
        }
    }
}

/// Pluggable strategy that upgrades the engine from "poll every tick" to
/// "push-driven".
///
/// `tick` is invoked every engine tick regardless of traffic, so lease
/// renewal runs on time even on a silent wire. `notify_receive` sees every
/// inbound application message before request matching and returns `true`
/// for protocol-internal traffic that must not reach the mapping matcher.
pub trait SyncProtocol {
    fn tick(&mut self, now: Millis, router: &mut MidiRouter);
    fn notify_receive(&mut self, message: &MidiMessage, now: Millis) -> bool;
    fn state(&self) -> ProtocolState;
    /// Whether the device pushes this mapping unsolicited while the lease is
    /// established. Covered mappings are exempt from per-tick polling.
    fn covers(&self, mapping: &ParameterMapping) -> bool;
}

/// Lease-based bidirectional protocol.
///
/// The device is told via a handshake message that it may stream changes
/// unsolicited for `lease_seconds`. The handshake is re-issued at half the
/// lease so the lease never lapses while the controller is present; if the
/// link disappears, the device-side lease expires on its own and this side
/// falls back to `Establishing` (plain polling) once sense traffic stays
/// away for a full lease. Handshakes are fire-and-forget: a missing
/// acknowledgment just leaves the state at `Establishing` until the next
/// renewal attempt.
pub struct LeaseProtocol {
    handshake: MessageTemplate,
    sense: MessageTemplate,
    lease_ms: Millis,
    state: ProtocolState,
    next_renewal_at: Millis,
    last_sense_at: Option<Millis>,
}

impl LeaseProtocol {
    /// `handshake` is rendered with the lease duration in seconds as its
    /// value; `sense` matches the periodic device heartbeat that proves the
    /// push channel is alive.
    pub fn new(handshake: MessageTemplate, sense: MessageTemplate, lease_seconds: u16) -> Self {
        Self {
            handshake,
            sense,
            lease_ms: Millis::from(lease_seconds) * 1000,
            state: ProtocolState::Uninitialized,
            next_renewal_at: 0,
            last_sense_at: None,
        }
    }

    pub fn lease_ms(&self) -> Millis {
        self.lease_ms
    }
}

impl SyncProtocol for LeaseProtocol {
    fn tick(&mut self, now: Millis, router: &mut MidiRouter) {
        // Lease lapse detection before renewal, so a dead link degrades to
        // polling even while we keep beaconing.
        if self.state == ProtocolState::Established {
            let expired = self
                .last_sense_at
                .map_or(true, |last| now.saturating_sub(last) >= self.lease_ms);
            if expired {
                debug!("bidirectional lease lapsed, falling back to polling");
                self.state = ProtocolState::Establishing;
                self.last_sense_at = None;
            }
        }

        if now >= self.next_renewal_at {
            let lease_value = (self.lease_ms / 1000).min(Millis::from(u16::MAX)) as u16;
            router.send(&self.handshake.render(lease_value));
            self.next_renewal_at = now + self.lease_ms / 2;
            if self.state == ProtocolState::Uninitialized {
                self.state = ProtocolState::Establishing;
            }
            trace!(state = ?self.state, "bidirectional handshake sent");
        }
    }

    fn notify_receive(&mut self, message: &MidiMessage, now: Millis) -> bool {
        if self.sense.matches(message).is_none() {
            return false;
        }
        if self.state != ProtocolState::Established {
            debug!("bidirectional connection established");
        }
        self.state = ProtocolState::Established;
        self.last_sense_at = Some(now);
        true
    }

    fn state(&self) -> ProtocolState {
        self.state
    }

    fn covers(&self, mapping: &ParameterMapping) -> bool {
        // Anything the device can answer it also pushes once the lease is up.
        mapping.response().is_some()
    }
}

impl core::fmt::Debug for LeaseProtocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LeaseProtocol")
            .field("state", &self.state)
            .field("lease_ms", &self.lease_ms)
            .field("next_renewal_at", &self.next_renewal_at)
            .field("last_sense_at", &self.last_sense_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::sysex_data;
    use crate::routing::{Endpoint, MidiTransport, Route};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct OutPort {
        outbound: RefCell<VecDeque<MidiMessage>>,
    }

    struct PortHandle(Rc<OutPort>);

    impl MidiTransport for PortHandle {
        fn send(&mut self, message: &MidiMessage) {
            self.0.outbound.borrow_mut().push_back(message.clone());
        }
        fn receive(&mut self) -> Option<MidiMessage> {
            None
        }
    }

    fn handshake_template() -> MessageTemplate {
        MessageTemplate::SystemExclusive {
            manufacturer_id: [0x00, 0x20, 0x33],
            prefix: sysex_data(&[0x7e, 0x00]),
        }
    }

    fn sense_template() -> MessageTemplate {
        MessageTemplate::SystemExclusive {
            manufacturer_id: [0x00, 0x20, 0x33],
            prefix: sysex_data(&[0x7e, 0x01]),
        }
    }

    fn setup() -> (Rc<OutPort>, MidiRouter, LeaseProtocol) {
        let port = Rc::new(OutPort::default());
        let router = MidiRouter::new(
            vec![Box::new(PortHandle(Rc::clone(&port)))],
            &[Route::new(Endpoint::Application, Endpoint::Port(0))],
        )
        .unwrap();
        let protocol = LeaseProtocol::new(handshake_template(), sense_template(), 30);
        (port, router, protocol)
    }

    fn sense_message() -> MidiMessage {
        sense_template().render(0)
    }

    #[test]
    fn test_handshake_renewed_at_half_lease() {
        let (port, mut router, mut protocol) = setup();

        protocol.tick(0, &mut router);
        assert_eq!(protocol.state(), ProtocolState::Establishing);
        assert_eq!(port.outbound.borrow().len(), 1);

        // Within half the lease: no renewal.
        protocol.tick(10_000, &mut router);
        assert_eq!(port.outbound.borrow().len(), 1);

        // Half the 30 s lease has elapsed.
        protocol.tick(15_000, &mut router);
        assert_eq!(port.outbound.borrow().len(), 2);
    }

    #[test]
    fn test_sense_traffic_establishes() {
        let (_, mut router, mut protocol) = setup();
        protocol.tick(0, &mut router);

        assert!(protocol.notify_receive(&sense_message(), 100));
        assert_eq!(protocol.state(), ProtocolState::Established);

        // Non-sense traffic is not consumed.
        let other = MidiMessage::ControlChange {
            channel: 0,
            control: 7,
            value: 1,
        };
        assert!(!protocol.notify_receive(&other, 200));
    }

    #[test]
    fn test_lease_lapses_without_sense_traffic() {
        let (_, mut router, mut protocol) = setup();
        protocol.tick(0, &mut router);
        protocol.notify_receive(&sense_message(), 100);
        assert_eq!(protocol.state(), ProtocolState::Established);

        // Sense keeps arriving: stays established across lease boundaries.
        protocol.notify_receive(&sense_message(), 20_000);
        protocol.tick(40_000, &mut router);
        assert_eq!(protocol.state(), ProtocolState::Established);

        // Silence for a full lease: back to establishing.
        protocol.tick(50_100, &mut router);
        assert_eq!(protocol.state(), ProtocolState::Establishing);
    }

    #[test]
    fn test_indicator_colors_are_distinct() {
        let uninitialized = ProtocolState::Uninitialized.indicator_color();
        let establishing = ProtocolState::Establishing.indicator_color();
        let established = ProtocolState::Established.indicator_color();
        assert_ne!(uninitialized, establishing);
        assert_ne!(establishing, established);
        assert_ne!(uninitialized, established);
    }
}
