use crate::message::MidiMessage;
use heapless::Vec;
use serde::Serialize;
use tracing::trace;

pub const MAX_PORTS: usize = 8;

/// Non-blocking transport capability for one physical MIDI port.
///
/// `receive` returns at most one decoded message per call and must never
/// wait; delivery is best-effort in both directions.
pub trait MidiTransport {
    fn send(&mut self, message: &MidiMessage);
    fn receive(&mut self) -> Option<MidiMessage>;
}

/// Routing endpoint: a physical port (index into the router's port list) or
/// the application itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endpoint {
    Application,
    Port(usize),
}

/// One directed routing entry. Source and target must differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub source: Endpoint,
    pub target: Endpoint,
}

impl Route {
    pub fn new(source: Endpoint, target: Endpoint) -> Self {
        Self { source, target }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RouterStats {
    pub sent: u32,
    pub delivered_to_application: u32,
    pub forwarded_external: u32,
    pub dropped_unrecognized: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("route source and target must differ")]
    SelfRoute,
    #[error("route references port {0} but only {1} ports are registered")]
    UnknownPort(usize, usize),
}

/// MIDI communication fabric: distributes and merges messages between the
/// registered physical ports and the application, as defined by the routes.
///
/// Routes are partitioned once at construction into "from application",
/// "to application" and "external" sets; the partition is fixed for the
/// router's lifetime.
pub struct MidiRouter {
    ports: std::vec::Vec<Box<dyn MidiTransport>>,
    from_app: std::vec::Vec<usize>,
    to_app: std::vec::Vec<usize>,
    external: std::vec::Vec<(usize, usize)>,
    stats: RouterStats,
}

impl MidiRouter {
    pub fn new(
        ports: std::vec::Vec<Box<dyn MidiTransport>>,
        routes: &[Route],
    ) -> Result<Self, RoutingError> {
        let mut from_app = std::vec::Vec::new();
        let mut to_app = std::vec::Vec::new();
        let mut external = std::vec::Vec::new();

        let check = |endpoint: Endpoint| -> Result<(), RoutingError> {
            if let Endpoint::Port(index) = endpoint {
                if index >= ports.len() {
                    return Err(RoutingError::UnknownPort(index, ports.len()));
                }
            }
            Ok(())
        };

        for route in routes {
            if route.source == route.target {
                return Err(RoutingError::SelfRoute);
            }
            check(route.source)?;
            check(route.target)?;

            match (route.source, route.target) {
                (Endpoint::Application, Endpoint::Port(target)) => from_app.push(target),
                (Endpoint::Port(source), Endpoint::Application) => to_app.push(source),
                (Endpoint::Port(source), Endpoint::Port(target)) => {
                    external.push((source, target));
                }
                (Endpoint::Application, Endpoint::Application) => unreachable!(),
            }
        }

        Ok(Self {
            ports,
            from_app,
            to_app,
            external,
            stats: RouterStats::default(),
        })
    }

    /// Sends an application message to the target of every route whose source
    /// is the application.
    pub fn send(&mut self, message: &MidiMessage) {
        for &target in &self.from_app {
            self.ports[target].send(message);
            self.stats.sent = self.stats.sent.wrapping_add(1);
        }
    }

    /// Processes one routing round and returns the first message addressed to
    /// the application, if any.
    ///
    /// External (port-to-port) routes are serviced first, fetching at most one
    /// message per distinct source and fanning it out to every route sharing
    /// that source. Then the "to application" sources are polled in order; the
    /// first non-empty result is returned and the remaining sources are
    /// drained on subsequent ticks, delayed by at most one tick per extra
    /// source.
    pub fn receive(&mut self) -> Option<MidiMessage> {
        self.process_external_routes();

        for &source in &self.to_app {
            if let Some(message) = self.ports[source].receive() {
                self.stats.delivered_to_application =
                    self.stats.delivered_to_application.wrapping_add(1);
                return Some(message);
            }
        }
        None
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Fetches one message per distinct external source and distributes each
    /// to every external route using that source. Frames without a
    /// recognizable status are dropped here; the drop is deliberately silent
    /// apart from diagnostics (counter + trace event).
    fn process_external_routes(&mut self) {
        if self.external.is_empty() {
            return;
        }

        let mut sources: Vec<usize, MAX_PORTS> = Vec::new();
        let mut results: Vec<Option<MidiMessage>, MAX_PORTS> = Vec::new();

        for &(source, _) in &self.external {
            if sources.contains(&source) {
                continue;
            }
            let message = self.ports[source].receive();
            let _ = sources.push(source);
            let _ = results.push(message);
        }

        for &(source, target) in &self.external {
            let Some(slot) = sources.iter().position(|&s| s == source) else {
                continue;
            };

            let Some(message) = results[slot].clone() else {
                continue;
            };

            if !message.is_recognized() {
                self.stats.dropped_unrecognized = self.stats.dropped_unrecognized.wrapping_add(1);
                trace!(?message, "dropping unrecognized frame on external route");
                continue;
            }

            self.ports[target].send(&message);
            self.stats.forwarded_external = self.stats.forwarded_external.wrapping_add(1);
        }
    }
}

impl core::fmt::Debug for MidiRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MidiRouter")
            .field("ports", &self.ports.len())
            .field("from_app", &self.from_app)
            .field("to_app", &self.to_app)
            .field("external", &self.external)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Queue-backed transport shared between the test and the router.
    #[derive(Default)]
    struct SharedPort {
        inbound: RefCell<VecDeque<MidiMessage>>,
        outbound: RefCell<VecDeque<MidiMessage>>,
    }

    struct PortHandle(Rc<SharedPort>);

    impl MidiTransport for PortHandle {
        fn send(&mut self, message: &MidiMessage) {
            self.0.outbound.borrow_mut().push_back(message.clone());
        }

        fn receive(&mut self) -> Option<MidiMessage> {
            self.0.inbound.borrow_mut().pop_front()
        }
    }

    fn cc(control: u8, value: u8) -> MidiMessage {
        MidiMessage::ControlChange {
            channel: 0,
            control,
            value,
        }
    }

    fn make_ports(count: usize) -> (std::vec::Vec<Rc<SharedPort>>, std::vec::Vec<Box<dyn MidiTransport>>) {
        let shared: std::vec::Vec<Rc<SharedPort>> =
            (0..count).map(|_| Rc::new(SharedPort::default())).collect();
        let boxed = shared
            .iter()
            .map(|p| Box::new(PortHandle(Rc::clone(p))) as Box<dyn MidiTransport>)
            .collect();
        (shared, boxed)
    }

    #[test]
    fn test_self_route_rejected() {
        let (_, ports) = make_ports(1);
        let result = MidiRouter::new(
            ports,
            &[Route::new(Endpoint::Application, Endpoint::Application)],
        );
        assert_eq!(result.err(), Some(RoutingError::SelfRoute));
    }

    #[test]
    fn test_unknown_port_rejected() {
        let (_, ports) = make_ports(1);
        let result = MidiRouter::new(
            ports,
            &[Route::new(Endpoint::Port(3), Endpoint::Application)],
        );
        assert_eq!(result.err(), Some(RoutingError::UnknownPort(3, 1)));
    }

    #[test]
    fn test_send_fans_out_to_all_application_sources() {
        let (shared, ports) = make_ports(2);
        let mut router = MidiRouter::new(
            ports,
            &[
                Route::new(Endpoint::Application, Endpoint::Port(0)),
                Route::new(Endpoint::Application, Endpoint::Port(1)),
            ],
        )
        .unwrap();

        router.send(&cc(7, 100));

        assert_eq!(shared[0].outbound.borrow_mut().len(), 1);
        assert_eq!(shared[1].outbound.borrow_mut().len(), 1);
        assert_eq!(router.stats().sent, 2);
    }

    #[test]
    fn test_external_source_feeding_two_targets() {
        let (shared, ports) = make_ports(3);
        let mut router = MidiRouter::new(
            ports,
            &[
                Route::new(Endpoint::Port(0), Endpoint::Port(1)),
                Route::new(Endpoint::Port(0), Endpoint::Port(2)),
            ],
        )
        .unwrap();

        shared[0].inbound.borrow_mut().push_back(cc(1, 10));
        assert_eq!(router.receive(), None);

        // Delivered to both targets exactly once.
        assert_eq!(shared[1].outbound.borrow_mut().len(), 1);
        assert_eq!(shared[2].outbound.borrow_mut().len(), 1);

        // Nothing left: the source message was consumed this tick.
        assert_eq!(router.receive(), None);
        assert_eq!(shared[1].outbound.borrow_mut().len(), 1);
    }

    #[test]
    fn test_source_without_route_produces_no_delivery() {
        let (shared, ports) = make_ports(2);
        let mut router = MidiRouter::new(
            ports,
            &[Route::new(Endpoint::Port(0), Endpoint::Port(1))],
        )
        .unwrap();

        // Port 1 has traffic but no route uses it as a source.
        shared[1].inbound.borrow_mut().push_back(cc(1, 10));
        assert_eq!(router.receive(), None);
        assert_eq!(shared[0].outbound.borrow_mut().len(), 0);
        assert_eq!(shared[1].inbound.borrow_mut().len(), 1);
    }

    #[test]
    fn test_unrecognized_frames_dropped_on_external_routes() {
        let (shared, ports) = make_ports(2);
        let mut router = MidiRouter::new(
            ports,
            &[Route::new(Endpoint::Port(0), Endpoint::Port(1))],
        )
        .unwrap();

        shared[0]
            .inbound
            .borrow_mut()
            .push_back(MidiMessage::Unrecognized { status: 0xf8 });
        assert_eq!(router.receive(), None);
        assert_eq!(shared[1].outbound.borrow_mut().len(), 0);
        assert_eq!(router.stats().dropped_unrecognized, 1);
    }

    #[test]
    fn test_application_delivery_one_message_per_tick() {
        let (shared, ports) = make_ports(2);
        let mut router = MidiRouter::new(
            ports,
            &[
                Route::new(Endpoint::Port(0), Endpoint::Application),
                Route::new(Endpoint::Port(1), Endpoint::Application),
            ],
        )
        .unwrap();

        shared[0].inbound.borrow_mut().push_back(cc(1, 1));
        shared[1].inbound.borrow_mut().push_back(cc(2, 2));

        // First tick drains the first source, the second is delayed one tick.
        assert_eq!(router.receive(), Some(cc(1, 1)));
        assert_eq!(router.receive(), Some(cc(2, 2)));
        assert_eq!(router.receive(), None);
    }
}
