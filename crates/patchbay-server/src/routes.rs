//! Route registrations and the handler registry.
//!
//! A [`Registration`] pairs a path with a handler, a concurrency mode, a
//! ping policy, and the parameter descriptors the binding engine evaluates
//! at dispatch. Registrations are collected into a [`SocketHandlers`] chain
//! and frozen into a [`HandlerRegistry`] at startup; lookups after that are
//! lock-free and by exact path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use patchbay_core::{
    BoundParams, ConfigError, Message, ParamSpec, RequestMeta, SessionId,
};
use tokio::sync::OnceCell;

use crate::binding::BindingEngine;
use crate::pipeline::SharedPipeline;

/// Frames flowing through a handler, boxed for storage in the registry.
pub type FrameStream = BoxStream<'static, Message>;

/// How connections on one path share (or don't share) a handler pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SocketMode {
    /// One pipeline per path. Every connection feeds the same inbound
    /// stream and every output frame fans out to all connections.
    Shared,
    /// One pipeline per connection, with the connection's own bound
    /// parameters in scope.
    Session,
}

impl SocketMode {
    /// Stable label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for SocketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of missed ping intervals after which a session is stale.
pub const STALE_INTERVALS: u32 = 3;

/// Server-initiated keepalive configuration for one route.
///
/// Disabled by default: no pings are sent and sessions are never judged
/// stale.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PingPolicy {
    enabled: bool,
    interval: Duration,
}

impl PingPolicy {
    /// No keepalive traffic at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            interval: Duration::ZERO,
        }
    }

    /// Ping every `interval`, closing sessions that miss
    /// [`STALE_INTERVALS`] consecutive replies.
    pub fn every(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
        }
    }

    /// Whether pings are sent on this route.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Interval between pings. Zero when disabled.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence threshold after which the session is torn down.
    pub fn stale_after(&self) -> Duration {
        self.interval * STALE_INTERVALS
    }
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Per-invocation context handed to a handler.
///
/// Shared pipelines run with a route-scoped context: no session id, empty
/// metadata, empty parameters. Session pipelines see the connection's own
/// request metadata and bound parameters.
#[derive(Clone, Debug)]
pub struct SocketContext {
    path: String,
    session_id: Option<SessionId>,
    meta: Arc<RequestMeta>,
    params: BoundParams,
}

impl SocketContext {
    pub(crate) fn route_scope(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: None,
            meta: Arc::new(RequestMeta::new()),
            params: BoundParams::new(),
        }
    }

    pub(crate) fn for_session(
        path: impl Into<String>,
        session_id: SessionId,
        meta: Arc<RequestMeta>,
        params: BoundParams,
    ) -> Self {
        Self {
            path: path.into(),
            session_id: Some(session_id),
            meta,
            params,
        }
    }

    /// Path the handler was registered under.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Session this invocation serves. `None` in a shared pipeline.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Request metadata captured at the handshake.
    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    /// Parameters bound from the request metadata.
    pub fn params(&self) -> &BoundParams {
        &self.params
    }
}

/// Transforming handler: consumes the inbound frame stream and produces
/// the outbound one.
///
/// Any `Fn(SocketContext, FrameStream) -> FrameStream` closure qualifies.
pub trait StreamHandler: Send + Sync + 'static {
    /// Builds the outbound stream for one pipeline invocation.
    fn run(&self, ctx: SocketContext, inbound: FrameStream) -> FrameStream;
}

impl<F> StreamHandler for F
where
    F: Fn(SocketContext, FrameStream) -> FrameStream + Send + Sync + 'static,
{
    fn run(&self, ctx: SocketContext, inbound: FrameStream) -> FrameStream {
        self(ctx, inbound)
    }
}

/// Consuming handler: observes the inbound frame stream and produces no
/// reply frames of its own.
///
/// Any `Fn(SocketContext, FrameStream) -> Future<Output = ()>` closure
/// qualifies.
pub trait SinkHandler: Send + Sync + 'static {
    /// Runs the consuming side of one pipeline invocation.
    fn run(&self, ctx: SocketContext, inbound: FrameStream) -> BoxFuture<'static, ()>;
}

impl<F, Fut> SinkHandler for F
where
    F: Fn(SocketContext, FrameStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn run(&self, ctx: SocketContext, inbound: FrameStream) -> BoxFuture<'static, ()> {
        Box::pin(self(ctx, inbound))
    }
}

/// The two handler shapes a route can carry.
#[derive(Clone)]
pub enum RouteHandler {
    /// Transforming handler.
    Stream(Arc<dyn StreamHandler>),
    /// Consuming handler.
    Sink(Arc<dyn SinkHandler>),
}

impl RouteHandler {
    /// Stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stream(_) => "stream",
            Self::Sink(_) => "sink",
        }
    }
}

impl fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouteHandler").field(&self.kind()).finish()
    }
}

/// One path's worth of dispatch configuration.
#[derive(Clone, Debug)]
pub struct Registration {
    path: String,
    mode: SocketMode,
    ping: PingPolicy,
    handler: RouteHandler,
    params: Vec<ParamSpec>,
    name: String,
}

impl Registration {
    /// Registers a transforming handler on `path`.
    pub fn stream(
        path: impl Into<String>,
        mode: SocketMode,
        handler: impl StreamHandler,
    ) -> Self {
        Self::with_handler(path.into(), mode, RouteHandler::Stream(Arc::new(handler)))
    }

    /// Registers a consuming handler on `path`.
    pub fn sink(path: impl Into<String>, mode: SocketMode, handler: impl SinkHandler) -> Self {
        Self::with_handler(path.into(), mode, RouteHandler::Sink(Arc::new(handler)))
    }

    fn with_handler(path: String, mode: SocketMode, handler: RouteHandler) -> Self {
        Self {
            name: path.clone(),
            path,
            mode,
            ping: PingPolicy::default(),
            handler,
            params: Vec::new(),
        }
    }

    /// Sets the keepalive policy for this route.
    #[must_use]
    pub fn ping(mut self, policy: PingPolicy) -> Self {
        self.ping = policy;
        self
    }

    /// Declares the parameters bound before each session starts.
    #[must_use]
    pub fn params(mut self, specs: impl IntoIterator<Item = ParamSpec>) -> Self {
        self.params.extend(specs);
        self
    }

    /// Sets the handler name used in diagnostics. Defaults to the path.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registered path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Concurrency mode.
    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    /// Keepalive policy.
    pub fn ping_policy(&self) -> PingPolicy {
        self.ping
    }

    /// The handler itself.
    pub fn handler(&self) -> &RouteHandler {
        &self.handler
    }

    /// Declared parameter descriptors.
    pub fn param_specs(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Diagnostic name reported in binding errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered chain of registrations, built with a fluent API:
///
/// `SocketHandlers::handle(a).and(b).and(c)`
///
/// [`SocketHandlers::empty`] is a legal chain that registers nothing and
/// produces a server with no socket routes.
#[derive(Debug, Default)]
pub struct SocketHandlers {
    registrations: Vec<Registration>,
}

impl SocketHandlers {
    /// Chain with no registrations. Building from it is a no-op.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Starts a chain with one registration.
    pub fn handle(registration: Registration) -> Self {
        Self {
            registrations: vec![registration],
        }
    }

    /// Appends a registration to the chain.
    #[must_use]
    pub fn and(mut self, registration: Registration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// The registrations in declaration order.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Number of registrations in the chain.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether the chain is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }
}

/// A frozen registration plus the lazily-started shared pipeline for
/// `SocketMode::Shared` routes.
#[derive(Debug)]
pub struct RouteEntry {
    registration: Registration,
    pub(crate) shared: OnceCell<SharedPipeline>,
}

impl RouteEntry {
    fn new(registration: Registration) -> Self {
        Self {
            registration,
            shared: OnceCell::new(),
        }
    }

    /// The registration this entry was built from.
    pub fn registration(&self) -> &Registration {
        &self.registration
    }
}

/// Immutable path-to-handler table, validated once at startup.
#[derive(Debug)]
pub struct HandlerRegistry {
    routes: HashMap<String, Arc<RouteEntry>>,
}

impl HandlerRegistry {
    /// Freezes a chain into a registry.
    ///
    /// Fails on an empty path or when two registrations claim the same
    /// path; the duplicate is never silently shadowed.
    pub fn build(handlers: SocketHandlers) -> Result<Self, ConfigError> {
        let mut routes = HashMap::new();
        for registration in handlers.into_registrations() {
            if registration.path().is_empty() {
                return Err(ConfigError::EmptyPath);
            }
            let path = registration.path().to_owned();
            if routes.contains_key(&path) {
                return Err(ConfigError::DuplicateRoute { path });
            }
            let prior = routes.insert(path, Arc::new(RouteEntry::new(registration)));
            debug_assert!(prior.is_none());
        }
        Ok(Self { routes })
    }

    /// Checks every declared parameter against the evaluator table.
    ///
    /// Each descriptor must name exactly one source, and that source must
    /// have an evaluator registered.
    pub fn validate_sources(&self, engine: &BindingEngine) -> Result<(), ConfigError> {
        for entry in self.routes.values() {
            let registration = entry.registration();
            for spec in registration.param_specs() {
                match spec.sources() {
                    [] => {
                        return Err(ConfigError::MissingParamSource {
                            key: spec.key().to_owned(),
                            handler: registration.name().to_owned(),
                        });
                    }
                    [source] => {
                        if !engine.supports(*source) {
                            return Err(ConfigError::UnsupportedSource {
                                source: *source,
                                key: spec.key().to_owned(),
                                handler: registration.name().to_owned(),
                            });
                        }
                    }
                    _ => {
                        return Err(ConfigError::AmbiguousParamSource {
                            key: spec.key().to_owned(),
                            handler: registration.name().to_owned(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Exact-path lookup.
    pub fn resolve(&self, path: &str) -> Option<Arc<RouteEntry>> {
        self.routes.get(path).cloned()
    }

    /// Every registered path, in arbitrary order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Every route entry, in arbitrary order.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<RouteEntry>> {
        self.routes.values()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the registry holds no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
