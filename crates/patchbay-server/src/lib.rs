//! # patchbay-server
//!
//! The serving layer: handler registration, connection admission, parameter
//! binding, session tracking, and the axum WebSocket edge.
//!
//! - [`routes`] — [`routes::Registration`] descriptors, the
//!   [`routes::SocketHandlers`] chain, and the path-keyed
//!   [`routes::HandlerRegistry`]
//! - [`binding`] — the [`binding::BindingEngine`] evaluator table that
//!   resolves declared parameters from handshake metadata
//! - [`guard`] — the [`guard::DispatchGuard`] admission hook, consulted
//!   before any parameter binding happens
//! - [`session`] — live [`session::Session`]s, the [`session::SessionRegistry`],
//!   and the close-observer worker
//! - [`pipeline`] — the transport-agnostic [`pipeline::Dispatcher`] that
//!   admits connections and wires frames between transports and handlers
//! - [`server`] — [`server::Sockets`], the composition root that builds,
//!   starts, and shuts down the HTTP/WebSocket server
//!
//! ## Crate Position
//!
//! Top of the stack. Depends on `patchbay-core` and `patchbay-events`.

#![deny(unsafe_code)]

pub mod binding;
pub mod guard;
pub mod metrics;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod session;

pub use binding::{BindingEngine, HeaderEvaluator, ParamEvaluator, QueryEvaluator};
pub use guard::{AllowAll, DispatchGuard, DispatchVeto};
pub use pipeline::{AttachError, ConnectionRequest, Dispatcher, Transport};
pub use routes::{
    FrameStream, HandlerRegistry, PingPolicy, Registration, RouteHandler, SinkHandler,
    SocketContext, SocketHandlers, SocketMode, StreamHandler,
};
pub use server::{init_tracing, ServerConfig, ServerHandle, Sockets};
pub use session::{spawn_close_observer, SendOutcome, Session, SessionRegistry};
