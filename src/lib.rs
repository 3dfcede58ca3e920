//! # MIDI Foot Controller Synchronization Core
//!
//! An embedded-style parameter synchronization library for foot controllers
//! talking to MIDI-addressable devices (amps, effect units). Parameters are
//! polled over the wire, replies are matched to outstanding requests under a
//! deadline, and consumers drive switches, LEDs and small displays from the
//! synchronized values.
//!
//! ## Features
//!
//! - **Request/response engine**: per-tick polling with pending-request
//!   suppression, bounded inbound draining and timeout-driven offline detection
//! - **Routing fabric**: fan-out/fan-in of raw MIDI traffic between physical
//!   ports and the application itself
//! - **Bidirectional upgrade**: optional lease-based push protocol with
//!   half-lease renewal and explicit polling suppression
//! - **Analog conditioning**: auto-calibration, quantization and frame-rate
//!   gating for expression pedals and similar inputs
//! - **Binary actions**: comparison-driven on/off state with cache-gated
//!   LED/label feedback and "remember last value" semantics
//! - **Embedded-friendly**: bounded buffers, no blocking calls, single-threaded
//!   cooperative ticking
//!
//! ## Quick Start
//!
//! ```rust
//! use stompsync::{ControllerConfig, MessageTemplate, MidiRouter, SyncClient};
//!
//! let config = ControllerConfig::default();
//! let mut router = MidiRouter::new(Vec::new(), &[]).unwrap();
//! let mut client = SyncClient::new(&config);
//!
//! let volume = client
//!     .define(
//!         "Volume",
//!         &[MessageTemplate::ControlChange { channel: 0, control: 7 }],
//!         None,
//!         Some(MessageTemplate::ControlChange { channel: 0, control: 7 }),
//!     )
//!     .unwrap();
//!
//! client.start();
//! let events = client.update(&mut router, 0);
//! assert!(events.is_empty());
//! assert_eq!(client.value(volume), None);
//! ```
//!
//! ## Architecture
//!
//! - [`message`] - Wire message model and value-carrying templates
//! - [`mapping`] - Parameter mapping registry with stable identities
//! - [`routing`] - MIDI routing fabric over pluggable transports
//! - [`client`] - Request/response synchronization engine
//! - [`protocol`] - Bidirectional lease protocol strategy
//! - [`analog`] - Analog input conditioning pipeline
//! - [`action`] - Binary parameter action state machine
//! - [`display`] - Display sink interface and value previews
//! - [`controller`] - Tick orchestration and event dispatch

#![deny(warnings)]

pub mod action;
pub mod analog;
pub mod client;
pub mod config;
pub mod controller;
pub mod display;
pub mod mapping;
pub mod message;
pub mod protocol;
pub mod routing;
pub mod timing;

// Re-export main public types for convenience
pub use action::{
    BinaryActionConfig, BinaryParameterAction, ButtonMode, ComparisonMode, DisableValue,
};
pub use analog::{AnalogConfig, AnalogControl};
pub use client::{ClientError, ClientEvent, ClientEventKind, ListenerId, MappingListener, SyncClient};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use display::{Color, DisplaySink};
pub use mapping::{MappingId, ParameterMapping};
pub use message::{MessageTemplate, MidiMessage};
pub use protocol::{LeaseProtocol, ProtocolState, SyncProtocol};
pub use routing::{Endpoint, MidiRouter, MidiTransport, Route};
