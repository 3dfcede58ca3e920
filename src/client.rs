use crate::config::ControllerConfig;
use crate::mapping::{MappingId, MappingRegistry, ParameterMapping, RegistryError, MAX_SET_SLOTS};
use crate::message::{MessageTemplate, MidiMessage};
use crate::protocol::{ProtocolState, SyncProtocol};
use crate::routing::MidiRouter;
use crate::timing::Millis;
use heapless::Vec;
use serde::Serialize;
use tracing::{debug, trace, warn};

pub const MAX_PENDING_REQUESTS: usize = 32;
pub const MAX_EVENTS_PER_TICK: usize = 32;

/// Consumer-side dispatch index, assigned by whoever owns the listener
/// objects (see [`crate::controller::Controller::dispatch`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerId(pub usize);

/// Capability interface exposed to consumers of synchronized parameters.
///
/// `parameter_changed` fires when a matched response (or an adopted set)
/// updated the stored value; `request_terminated` fires when a request timed
/// out and the value was cleared - the "device offline" signal path. A
/// listener never observes both for the same request in the same tick.
pub trait MappingListener {
    fn parameter_changed(&mut self, mapping: &ParameterMapping);
    fn request_terminated(&mut self, mapping: &ParameterMapping);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventKind {
    ParameterChanged,
    RequestTerminated,
}

/// Notification produced by [`SyncClient::update`], to be dispatched to the
/// listener registered under `listener`.
#[derive(Debug, Clone, Copy)]
pub struct ClientEvent {
    pub mapping: MappingId,
    pub listener: ListenerId,
    pub kind: ClientEventKind,
}

pub type ClientEvents = Vec<ClientEvent, MAX_EVENTS_PER_TICK>;

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    mapping: MappingId,
    issued_at: Millis,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClientStats {
    pub requests_sent: u32,
    pub responses_matched: u32,
    pub unsolicited_matched: u32,
    pub timeouts: u32,
    pub sets_sent: u32,
    pub discarded_inbound: u32,
    pub dropped_requests: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Wiring defect: mappings and listeners must be registered before the
    /// engine starts ticking.
    #[error("registration is closed once the engine has started")]
    RegistrationClosed,
    #[error("mapping definition rejected: {0}")]
    Definition(#[from] RegistryError),
    #[error("expected {expected} slot values, got {got}")]
    SlotCountMismatch { expected: usize, got: usize },
}

/// Request/response synchronization engine.
///
/// Owns the mapping registry (single writer for all stored values) and the
/// pending-request table. Driven once per tick via [`SyncClient::update`];
/// within a tick the order is: protocol hook, timeout sweep, bounded inbound
/// drain, request issuance - so a timeout is always observed before any late
/// match of the same cycle, and inbound processing cannot starve the loop.
pub struct SyncClient {
    registry: MappingRegistry,
    registrations: std::vec::Vec<(MappingId, ListenerId)>,
    pending: Vec<PendingRequest, MAX_PENDING_REQUESTS>,
    terminated_this_tick: Vec<MappingId, MAX_PENDING_REQUESTS>,
    protocol: Option<Box<dyn SyncProtocol>>,
    started: bool,
    request_lifetime_ms: Millis,
    max_inbound_per_tick: usize,
    stats: ClientStats,
}

impl SyncClient {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            registry: MappingRegistry::new(),
            registrations: std::vec::Vec::new(),
            pending: Vec::new(),
            terminated_this_tick: Vec::new(),
            protocol: None,
            started: false,
            request_lifetime_ms: config.request_lifetime_ms,
            max_inbound_per_tick: config.max_inbound_per_tick,
            stats: ClientStats::default(),
        }
    }

    /// Defines (or looks up) a parameter mapping. Identity is by name, so two
    /// independent consumers defining "Tempo" share one value and one stream
    /// of wire traffic.
    pub fn define(
        &mut self,
        name: &str,
        set: &[MessageTemplate],
        request: Option<MidiMessage>,
        response: Option<MessageTemplate>,
    ) -> Result<MappingId, ClientError> {
        if self.started {
            return Err(ClientError::RegistrationClosed);
        }
        Ok(self.registry.get_or_create(name, set, request, response)?)
    }

    pub fn mapping(&self, id: MappingId) -> &ParameterMapping {
        self.registry.get(id)
    }

    pub fn value(&self, id: MappingId) -> Option<u16> {
        self.registry.get(id).value()
    }

    /// Installs the bidirectional protocol strategy. Without one, every
    /// registered mapping is polled on every tick.
    pub fn set_protocol(&mut self, protocol: Box<dyn SyncProtocol>) {
        self.protocol = Some(protocol);
    }

    pub fn protocol_state(&self) -> Option<ProtocolState> {
        self.protocol.as_ref().map(|p| p.state())
    }

    /// Attaches a listener to a mapping. Duplicate pairs are ignored.
    /// Fails once the engine has started: late registration is a wiring
    /// defect, not a runtime condition.
    pub fn register(&mut self, id: MappingId, listener: ListenerId) -> Result<(), ClientError> {
        if self.started {
            return Err(ClientError::RegistrationClosed);
        }
        if !self.registrations.contains(&(id, listener)) {
            self.registrations.push((id, listener));
        }
        Ok(())
    }

    /// Closes registration and starts the tick-driven life of the engine.
    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Issues a request for `id` unless one is already outstanding, the
    /// mapping is set-only, or an established push protocol covers it.
    pub fn request(&mut self, id: MappingId, router: &mut MidiRouter, now: Millis) {
        if self.pending.iter().any(|p| p.mapping == id) {
            return;
        }

        let request = {
            let mapping = self.registry.get(id);
            let Some(request) = mapping.request() else {
                // Set-only mapping: nothing to poll.
                return;
            };
            if self.polling_suppressed(mapping) {
                return;
            }
            request.clone()
        };

        router.send(&request);
        if self
            .pending
            .push(PendingRequest {
                mapping: id,
                issued_at: now,
            })
            .is_err()
        {
            self.stats.dropped_requests = self.stats.dropped_requests.wrapping_add(1);
            warn!(mapping = self.registry.get(id).name(), "pending request table full");
            return;
        }
        self.stats.requests_sent = self.stats.requests_sent.wrapping_add(1);
        trace!(mapping = self.registry.get(id).name(), "request issued");
    }

    /// Sends the mapping's set messages immediately, one value broadcast to
    /// every slot. Not subject to the pending-request gate.
    ///
    /// The stored value is only adopted right away when the mapping has no
    /// response template; otherwise adoption waits for the device echo.
    pub fn set(&mut self, id: MappingId, value: u16, router: &mut MidiRouter) {
        let templates = self.set_templates(id);
        for template in &templates {
            router.send(&template.render(value));
        }
        self.adopt_if_unechoed(id, value);
        self.stats.sets_sent = self.stats.sets_sent.wrapping_add(1);
    }

    /// Like [`SyncClient::set`] but with one value per set slot, for
    /// multi-slot mappings driven by binary actions.
    pub fn set_slots(
        &mut self,
        id: MappingId,
        values: &[u16],
        router: &mut MidiRouter,
    ) -> Result<(), ClientError> {
        let templates = self.set_templates(id);
        if values.len() != templates.len() {
            return Err(ClientError::SlotCountMismatch {
                expected: templates.len(),
                got: values.len(),
            });
        }
        for (template, value) in templates.iter().zip(values) {
            router.send(&template.render(*value));
        }
        if let Some(first) = values.first() {
            self.adopt_if_unechoed(id, *first);
        }
        self.stats.sets_sent = self.stats.sets_sent.wrapping_add(1);
        Ok(())
    }

    /// One synchronization tick. Returns the notifications to dispatch; the
    /// caller delivers them after this borrow ends, which keeps listener code
    /// free to call back into the engine.
    pub fn update(&mut self, router: &mut MidiRouter, now: Millis) -> ClientEvents {
        let mut events = ClientEvents::new();
        self.terminated_this_tick.clear();

        if let Some(protocol) = self.protocol.as_mut() {
            protocol.tick(now, router);
        }

        self.sweep_timeouts(now, &mut events);

        for _ in 0..self.max_inbound_per_tick {
            let Some(message) = router.receive() else {
                break;
            };
            self.handle_inbound(&message, now, &mut events);
        }

        let registered: std::vec::Vec<MappingId> =
            self.registrations.iter().map(|&(id, _)| id).collect();
        for id in registered {
            self.request(id, router, now);
        }

        events
    }

    /// Treats every pending request older than the configured lifetime as
    /// failed: value cleared, pending record dropped, listeners notified.
    /// This fires even if no message ever arrives again.
    fn sweep_timeouts(&mut self, now: Millis, events: &mut ClientEvents) {
        let lifetime = self.request_lifetime_ms;
        let mut expired: Vec<MappingId, MAX_PENDING_REQUESTS> = Vec::new();
        for pending in &self.pending {
            if now.saturating_sub(pending.issued_at) >= lifetime {
                let _ = expired.push(pending.mapping);
            }
        }

        for id in &expired {
            self.pending.retain(|p| p.mapping != *id);
            self.registry.get_mut(*id).clear_value();
            let _ = self.terminated_this_tick.push(*id);
            self.stats.timeouts = self.stats.timeouts.wrapping_add(1);
            debug!(mapping = self.registry.get(*id).name(), "request timed out, parameter offline");
            self.push_events(events, *id, ClientEventKind::RequestTerminated);
        }
    }

    fn handle_inbound(&mut self, message: &MidiMessage, now: Millis, events: &mut ClientEvents) {
        if let Some(protocol) = self.protocol.as_mut() {
            if protocol.notify_receive(message, now) {
                return;
            }
        }

        // Match against outstanding requests first. A mapping terminated in
        // this tick is excluded: termination takes precedence.
        let hit = self.pending.iter().enumerate().find_map(|(index, pending)| {
            if self.terminated_this_tick.contains(&pending.mapping) {
                return None;
            }
            let value = self
                .registry
                .get(pending.mapping)
                .response()?
                .matches(message)?;
            Some((index, pending.mapping, value))
        });

        if let Some((index, id, value)) = hit {
            self.registry.get_mut(id).store_value(value);
            self.pending.remove(index);
            self.stats.responses_matched = self.stats.responses_matched.wrapping_add(1);
            trace!(mapping = self.registry.get(id).name(), value, "response matched");
            self.push_events(events, id, ClientEventKind::ParameterChanged);
            return;
        }

        // While the push lease is established the device streams changes
        // unsolicited; adopt them for covered registered mappings.
        if self.push_established() {
            for id in self.registry.ids() {
                if !self.is_registered(id) || self.terminated_this_tick.contains(&id) {
                    continue;
                }
                let mapping = self.registry.get(id);
                if !self
                    .protocol
                    .as_ref()
                    .is_some_and(|p| p.covers(mapping))
                {
                    continue;
                }
                let Some(value) = mapping.response().and_then(|t| t.matches(message)) else {
                    continue;
                };

                self.registry.get_mut(id).store_value(value);
                self.stats.unsolicited_matched = self.stats.unsolicited_matched.wrapping_add(1);
                self.push_events(events, id, ClientEventKind::ParameterChanged);
                return;
            }
        }

        self.stats.discarded_inbound = self.stats.discarded_inbound.wrapping_add(1);
        trace!(?message, "discarding inbound message matching no mapping");
    }

    fn push_events(&self, events: &mut ClientEvents, id: MappingId, kind: ClientEventKind) {
        for &(mapping, listener) in &self.registrations {
            if mapping != id {
                continue;
            }
            if events
                .push(ClientEvent {
                    mapping: id,
                    listener,
                    kind,
                })
                .is_err()
            {
                warn!("event buffer full, dropping listener notification");
            }
        }
    }

    fn polling_suppressed(&self, mapping: &ParameterMapping) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(|p| p.state() == ProtocolState::Established && p.covers(mapping))
    }

    fn push_established(&self) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(|p| p.state() == ProtocolState::Established)
    }

    fn is_registered(&self, id: MappingId) -> bool {
        self.registrations.iter().any(|&(m, _)| m == id)
    }

    fn set_templates(&self, id: MappingId) -> Vec<MessageTemplate, MAX_SET_SLOTS> {
        let mut templates = Vec::new();
        for template in self.registry.get(id).set_slots() {
            let _ = templates.push(template.clone());
        }
        templates
    }

    fn adopt_if_unechoed(&mut self, id: MappingId, value: u16) {
        if self.registry.get(id).response().is_none() {
            self.registry.get_mut(id).store_value(value);
        }
    }
}

impl core::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncClient")
            .field("mappings", &self.registry.len())
            .field("registrations", &self.registrations.len())
            .field("pending", &self.pending.len())
            .field("started", &self.started)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{Endpoint, MidiTransport, Route};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct DevicePort {
        inbound: RefCell<VecDeque<MidiMessage>>,
        outbound: RefCell<VecDeque<MidiMessage>>,
    }

    struct PortHandle(Rc<DevicePort>);

    impl MidiTransport for PortHandle {
        fn send(&mut self, message: &MidiMessage) {
            self.0.outbound.borrow_mut().push_back(message.clone());
        }
        fn receive(&mut self) -> Option<MidiMessage> {
            self.0.inbound.borrow_mut().pop_front()
        }
    }

    fn setup() -> (Rc<DevicePort>, MidiRouter, SyncClient) {
        let port = Rc::new(DevicePort::default());
        let router = MidiRouter::new(
            vec![Box::new(PortHandle(Rc::clone(&port)))],
            &[
                Route::new(Endpoint::Application, Endpoint::Port(0)),
                Route::new(Endpoint::Port(0), Endpoint::Application),
            ],
        )
        .unwrap();
        let client = SyncClient::new(&ControllerConfig::default());
        (port, router, client)
    }

    fn cc(control: u8) -> MessageTemplate {
        MessageTemplate::ControlChange {
            channel: 0,
            control,
        }
    }

    fn cc_msg(control: u8, value: u8) -> MidiMessage {
        MidiMessage::ControlChange {
            channel: 0,
            control,
            value,
        }
    }

    fn request_msg(control: u8) -> MidiMessage {
        cc_msg(control, 0)
    }

    #[test]
    fn test_request_suppressed_while_pending() {
        let (port, mut router, mut client) = setup();
        let id = client
            .define("Gain", &[cc(8)], Some(request_msg(8)), Some(cc(8)))
            .unwrap();
        client.register(id, ListenerId(0)).unwrap();
        client.start();

        client.request(id, &mut router, 0);
        client.request(id, &mut router, 50);
        assert_eq!(port.outbound.borrow().len(), 1);
        assert_eq!(client.stats().requests_sent, 1);
    }

    #[test]
    fn test_set_only_mapping_request_is_noop() {
        let (port, mut router, mut client) = setup();
        let id = client.define("OneShot", &[cc(40)], None, None).unwrap();
        client.start();

        client.request(id, &mut router, 0);
        assert_eq!(port.outbound.borrow().len(), 0);
    }

    #[test]
    fn test_register_after_start_is_rejected() {
        let (_, _, mut client) = setup();
        let id = client.define("Gain", &[cc(8)], None, None).unwrap();
        client.start();
        assert_eq!(
            client.register(id, ListenerId(0)),
            Err(ClientError::RegistrationClosed)
        );
        assert_eq!(
            client.define("Late", &[cc(9)], None, None),
            Err(ClientError::RegistrationClosed)
        );
    }

    #[test]
    fn test_response_matching_notifies_each_listener_once() {
        let (port, mut router, mut client) = setup();
        let id = client
            .define("Tempo", &[cc(30)], Some(request_msg(30)), Some(cc(30)))
            .unwrap();
        client.register(id, ListenerId(0)).unwrap();
        client.register(id, ListenerId(1)).unwrap();
        client.start();

        let events = client.update(&mut router, 0);
        assert!(events.is_empty());
        // Two listeners, one set of wire traffic.
        assert_eq!(port.outbound.borrow().len(), 1);

        port.inbound.borrow_mut().push_back(cc_msg(30, 96));
        let events = client.update(&mut router, 200);

        let changed: std::vec::Vec<_> = events
            .iter()
            .filter(|e| e.kind == ClientEventKind::ParameterChanged)
            .collect();
        assert_eq!(changed.len(), 2);
        assert_eq!(client.value(id), Some(96));
        assert_eq!(client.stats().responses_matched, 1);
    }

    #[test]
    fn test_timeout_terminates_request_and_clears_value() {
        let (port, mut router, mut client) = setup();
        let id = client
            .define("Tempo", &[cc(30)], Some(request_msg(30)), Some(cc(30)))
            .unwrap();
        client.register(id, ListenerId(0)).unwrap();
        client.start();

        // Answer the first request so a value is present.
        client.update(&mut router, 0);
        port.inbound.borrow_mut().push_back(cc_msg(30, 64));
        client.update(&mut router, 200);
        assert_eq!(client.value(id), Some(64));

        // The re-issued request at t=400 never gets answered.
        client.update(&mut router, 400);
        let events = client.update(&mut router, 2400);

        let terminated: std::vec::Vec<_> = events
            .iter()
            .filter(|e| e.kind == ClientEventKind::RequestTerminated)
            .collect();
        assert_eq!(terminated.len(), 1);
        assert_eq!(client.value(id), None);
        assert_eq!(client.stats().timeouts, 1);
    }

    #[test]
    fn test_unanswered_request_triggers_exactly_one_termination() {
        let (_, mut router, mut client) = setup();
        let id = client
            .define("Tempo", &[cc(30)], Some(request_msg(30)), Some(cc(30)))
            .unwrap();
        client.register(id, ListenerId(0)).unwrap();
        client.start();

        client.update(&mut router, 0);
        let mut terminations = 0;
        for tick in 1..30 {
            let events = client.update(&mut router, tick * 200);
            terminations += events
                .iter()
                .filter(|e| e.kind == ClientEventKind::RequestTerminated)
                .count();
        }
        // One per expired request; requests re-issue after each timeout, so
        // count timeouts per issued request instead of in total.
        assert_eq!(client.stats().requests_sent as usize, terminations + 1);
        assert_eq!(client.value(id), None);
    }

    #[test]
    fn test_answered_request_never_terminates() {
        let (port, mut router, mut client) = setup();
        let id = client
            .define("Tempo", &[cc(30)], Some(request_msg(30)), Some(cc(30)))
            .unwrap();
        client.register(id, ListenerId(0)).unwrap();
        client.start();

        client.update(&mut router, 0);
        port.inbound.borrow_mut().push_back(cc_msg(30, 12));
        let events = client.update(&mut router, 100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ClientEventKind::ParameterChanged);
        assert_eq!(client.value(id), Some(12));

        // The follow-up request from t=100 is still within its lifetime.
        let events = client.update(&mut router, 300);
        assert!(events.is_empty());
        assert_eq!(client.stats().timeouts, 0);
    }

    #[test]
    fn test_set_adopts_immediately_without_response_template() {
        let (port, mut router, mut client) = setup();
        let echoed = client
            .define("Echoed", &[cc(8)], None, Some(cc(8)))
            .unwrap();
        let fire_and_forget = client.define("Plain", &[cc(9)], None, None).unwrap();
        client.start();

        client.set(echoed, 100, &mut router);
        client.set(fire_and_forget, 101, &mut router);

        assert_eq!(client.value(echoed), None);
        assert_eq!(client.value(fire_and_forget), Some(101));
        assert_eq!(port.outbound.borrow().len(), 2);
    }

    #[test]
    fn test_set_slots_length_checked() {
        let (_, mut router, mut client) = setup();
        let id = client
            .define("Dual", &[cc(8), cc(9)], None, None)
            .unwrap();
        client.start();

        assert_eq!(
            client.set_slots(id, &[1], &mut router),
            Err(ClientError::SlotCountMismatch {
                expected: 2,
                got: 1
            })
        );
        assert!(client.set_slots(id, &[1, 2], &mut router).is_ok());
    }

    #[test]
    fn test_inbound_drain_is_bounded_per_tick() {
        let mut config = ControllerConfig::default();
        config.max_inbound_per_tick = 2;

        let port = Rc::new(DevicePort::default());
        let mut router = MidiRouter::new(
            vec![Box::new(PortHandle(Rc::clone(&port)))],
            &[
                Route::new(Endpoint::Application, Endpoint::Port(0)),
                Route::new(Endpoint::Port(0), Endpoint::Application),
            ],
        )
        .unwrap();
        let mut client = SyncClient::new(&config);
        client.start();

        for i in 0..5 {
            port.inbound.borrow_mut().push_back(cc_msg(1, i));
        }
        client.update(&mut router, 0);
        assert_eq!(port.inbound.borrow().len(), 3);
        assert_eq!(client.stats().discarded_inbound, 2);
    }

    #[test]
    fn test_unmatched_inbound_discarded_not_fatal() {
        let (port, mut router, mut client) = setup();
        let id = client
            .define("Tempo", &[cc(30)], Some(request_msg(30)), Some(cc(30)))
            .unwrap();
        client.register(id, ListenerId(0)).unwrap();
        client.start();

        client.update(&mut router, 0);
        port.inbound.borrow_mut().push_back(cc_msg(77, 1));
        let events = client.update(&mut router, 100);
        assert!(events.is_empty());
        assert_eq!(client.stats().discarded_inbound, 1);
        assert_eq!(client.value(id), None);
    }
}
