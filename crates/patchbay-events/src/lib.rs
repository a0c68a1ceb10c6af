//! # patchbay-events
//!
//! Typed, bounded multicast event channels and the session lifecycle events
//! that flow through them.
//!
//! - [`bus::EventBus`] — one bounded multicast channel per event kind;
//!   `fire` never blocks and reports delivery through [`bus::EmitResult`]
//! - [`lifecycle`] — `SessionConnectedEvent`, `ClientSessionClosedEvent`,
//!   `ServerSessionClosedEvent` and the [`lifecycle::SessionInfo`] payload
//! - [`hub::EventHub`] — the aggregate owning one bus per lifecycle kind,
//!   constructed explicitly by the composition root
//!
//! ## Crate Position
//!
//! Depends on `patchbay-core`. Depended on by `patchbay-server`.

#![deny(unsafe_code)]

pub mod bus;
pub mod hub;
pub mod lifecycle;

pub use bus::{EmitResult, EventBus, EventStream, EVENT_QUEUE_CAPACITY};
pub use hub::EventHub;
pub use lifecycle::{
    ClientSessionClosedEvent, ServerSessionClosedEvent, SessionConnectedEvent, SessionInfo,
    SocketEvent,
};
