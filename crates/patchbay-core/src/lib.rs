//! # patchbay-core
//!
//! Foundation types for the patchbay WebSocket routing layer.
//!
//! This crate provides the shared vocabulary the other patchbay crates depend
//! on:
//!
//! - **Branded IDs**: [`ids::SessionId`] as a prefixed newtype
//! - **Frames**: [`message::Message`] — the transport-agnostic frame enum
//! - **Close vocabulary**: [`close::SessionCloseInfo`], [`close::CloseSignal`]
//!   (a resolve-once latch), [`close::CloseInitiator`]
//! - **Parameter model**: [`params::ParamSpec`] descriptors,
//!   [`params::BoundValue`] results, [`params::RequestMeta`] lookup input
//! - **Conversion**: [`convert::convert`] and [`convert::zero_value`] — the
//!   string-to-target type-conversion service
//! - **Errors**: [`error::ConfigError`] and [`error::ValidationError`] via
//!   `thiserror`
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `patchbay-events` and `patchbay-server`.

#![deny(unsafe_code)]

pub mod close;
pub mod convert;
pub mod error;
pub mod ids;
pub mod message;
pub mod params;

pub use close::{CloseCode, CloseFrame, CloseInitiator, CloseSignal, SessionCloseInfo};
pub use error::{ConfigError, ConvertError, ValidationError};
pub use ids::SessionId;
pub use message::Message;
pub use params::{BoundParams, BoundValue, EnumSpec, ParamSource, ParamSpec, RequestMeta, TargetType};
