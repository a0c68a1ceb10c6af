//! Connection dispatch and the per-session task set.
//!
//! The [`Dispatcher`] admits one connection at a time: resolve the route,
//! consult the guard, bind parameters, store the session, then wire the
//! tasks that move frames. The transport is a pair of bounded channels, so
//! everything here is testable without a socket and the axum edge stays a
//! thin pump.
//!
//! Per connection the dispatcher spawns a frame router (control frames
//! handled in place, data frames forwarded to the handler), a delivery
//! task (pipeline output into the session's outbound queue), and
//! optionally a keepalive task. Every task selects on the session's close
//! latch and stops without sending further frames once it resolves.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use patchbay_core::{
    CloseCode, CloseFrame, CloseInitiator, Message, RequestMeta, SessionCloseInfo, SessionId,
    ValidationError,
};
use patchbay_events::SessionInfo;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::BindingEngine;
use crate::guard::{DispatchGuard, DispatchVeto};
use crate::metrics::{
    BINDING_FAILURES_TOTAL, DISPATCH_VETOES_TOTAL, KEEPALIVE_TIMEOUTS_TOTAL, SEND_DROPS_TOTAL,
    SLOW_CLIENT_CLOSES_TOTAL,
};
use crate::routes::{
    FrameStream, HandlerRegistry, PingPolicy, Registration, RouteHandler, SocketContext,
    SocketMode,
};
use crate::session::{MAX_SEND_DROPS, SendOutcome, Session, SessionRegistry};

/// Capacity of the queue feeding a handler's inbound stream.
pub const HANDLER_QUEUE_CAPACITY: usize = 256;

/// Capacity of a shared pipeline's fan-out ring.
pub const FANOUT_CAPACITY: usize = 256;

/// Channel pair carrying frames between a transport and the dispatcher.
///
/// The transport edge owns the other half of each channel: it pushes peer
/// frames into `inbound` and drains `outbound` onto the wire.
#[derive(Debug)]
pub struct Transport {
    /// Frames arriving from the peer.
    pub inbound: mpsc::Receiver<Message>,
    /// Frames to deliver to the peer. Bounded; full means drop.
    pub outbound: mpsc::Sender<Message>,
}

/// Everything known about a connection at the end of its handshake.
#[derive(Debug)]
pub struct ConnectionRequest {
    /// Request path, matched exactly against registrations.
    pub path: String,
    /// Headers and query parameters captured from the handshake.
    pub meta: RequestMeta,
    /// The frame channels for this connection.
    pub transport: Transport,
}

/// Why a connection was not admitted.
#[derive(Debug, Error)]
pub enum AttachError {
    /// No registration matches the request path.
    #[error("no handler registered for path `{path}`")]
    RouteNotFound {
        /// The unmatched path.
        path: String,
    },
    /// The dispatch guard refused the connection.
    #[error(transparent)]
    Vetoed(#[from] DispatchVeto),
    /// A declared parameter failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Admission pipeline shared by every transport edge.
pub struct Dispatcher {
    routes: Arc<HandlerRegistry>,
    binder: Arc<BindingEngine>,
    guard: Arc<dyn DispatchGuard>,
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    /// Assembles a dispatcher from validated parts.
    pub fn new(
        routes: Arc<HandlerRegistry>,
        binder: Arc<BindingEngine>,
        guard: Arc<dyn DispatchGuard>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            routes,
            binder,
            guard,
            registry,
        }
    }

    /// The frozen route table.
    pub fn routes(&self) -> &Arc<HandlerRegistry> {
        &self.routes
    }

    /// The live session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Admits one connection and wires its tasks.
    ///
    /// Order is fixed: resolve, guard, bind, store, spawn. A guard veto or
    /// binding failure queues a policy-violation close frame onto the
    /// transport and leaves no session behind.
    pub async fn attach(&self, request: ConnectionRequest) -> Result<SessionId, AttachError> {
        let ConnectionRequest {
            path,
            meta,
            transport,
        } = request;
        let Transport { inbound, outbound } = transport;

        let Some(entry) = self.routes.resolve(&path) else {
            return Err(AttachError::RouteNotFound { path });
        };
        let registration = entry.registration();
        let meta = Arc::new(meta);

        if let Err(veto) = self.guard.authorize(registration, &meta).await {
            counter!(DISPATCH_VETOES_TOTAL).increment(1);
            warn!(path, reason = veto.reason(), "connection vetoed");
            let _ = outbound.try_send(Message::close(CloseCode::POLICY_VIOLATION, "unauthorized"));
            return Err(AttachError::Vetoed(veto));
        }

        let params = match self
            .binder
            .bind(&meta, registration.param_specs(), registration.name())
        {
            Ok(params) => params,
            Err(err) => {
                counter!(BINDING_FAILURES_TOTAL).increment(1);
                warn!(
                    path,
                    key = err.key(),
                    handler = err.handler(),
                    kind = err.error_kind(),
                    "parameter binding failed"
                );
                let _ = outbound.try_send(Message::close(
                    CloseCode::POLICY_VIOLATION,
                    "parameter binding failed",
                ));
                return Err(AttachError::Validation(err));
            }
        };

        let session_info = SessionInfo::new(SessionId::new(), path.clone());
        let session = Arc::new(Session::new(
            session_info,
            Arc::clone(&meta),
            params.clone(),
            outbound,
        ));
        let session_id = session.id().clone();
        let _ = self.registry.put(Arc::clone(&session));

        match registration.mode() {
            SocketMode::Shared => {
                let pipeline = entry
                    .shared
                    .get_or_init(|| async { SharedPipeline::start(registration) })
                    .await;
                // Subscribe before the router can feed the pipeline, so
                // this session never misses output it caused.
                let feed = pipeline.subscribe();
                let _ = spawn_shared_forwarder(Arc::clone(&session), feed, pipeline.done());
                let _ = spawn_frame_router(Arc::clone(&session), inbound, pipeline.inbound());
            }
            SocketMode::Session => {
                let (handler_tx, handler_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
                let ctx = SocketContext::for_session(
                    path.clone(),
                    session_id.clone(),
                    Arc::clone(&meta),
                    params,
                );
                let _ = spawn_frame_router(Arc::clone(&session), inbound, handler_tx);
                let _ = spawn_session_pipeline(
                    Arc::clone(&session),
                    registration.handler().clone(),
                    ctx,
                    handler_rx,
                );
            }
        }

        let policy = registration.ping_policy();
        if policy.is_enabled() && policy.interval() > Duration::ZERO {
            let _ = spawn_keepalive(Arc::clone(&session), policy);
        }

        info!(
            session_id = %session_id,
            path,
            mode = %registration.mode(),
            "session attached"
        );
        Ok(session_id)
    }

    /// Aborts every shared pipeline that was started. Used at shutdown.
    pub fn shutdown_pipelines(&self) {
        for entry in self.routes.entries() {
            if let Some(pipeline) = entry.shared.get() {
                pipeline.abort();
            }
        }
    }
}

/// One handler invocation serving every connection on a shared route.
///
/// Started lazily at the first attach. Inbound frames from all
/// connections merge into one queue; output frames fan out through a
/// broadcast ring, so a subscriber only sees frames produced after it
/// joined.
#[derive(Debug)]
pub struct SharedPipeline {
    inbound: mpsc::Sender<Message>,
    fanout: broadcast::Sender<Message>,
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl SharedPipeline {
    pub(crate) fn start(registration: &Registration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
        let (fanout_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let done = CancellationToken::new();
        let ctx = SocketContext::route_scope(registration.path());
        let frames: FrameStream = ReceiverStream::new(inbound_rx).boxed();

        let task = match registration.handler().clone() {
            RouteHandler::Stream(handler) => {
                let fanout = fanout_tx.clone();
                let completion = done.clone();
                tokio::spawn(async move {
                    let mut out = handler.run(ctx, frames);
                    while let Some(frame) = out.next().await {
                        // No subscribers means the frame is dropped, which
                        // is exactly the no-replay contract.
                        let _ = fanout.send(frame);
                    }
                    completion.cancel();
                })
            }
            RouteHandler::Sink(handler) => {
                let completion = done.clone();
                tokio::spawn(async move {
                    handler.run(ctx, frames).await;
                    completion.cancel();
                })
            }
        };

        debug!(
            path = registration.path(),
            kind = registration.handler().kind(),
            "shared pipeline started"
        );
        Self {
            inbound: inbound_tx,
            fanout: fanout_tx,
            done,
            task,
        }
    }

    pub(crate) fn inbound(&self) -> mpsc::Sender<Message> {
        self.inbound.clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.fanout.subscribe()
    }

    pub(crate) fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Routes raw transport frames: control frames are answered in place,
/// data frames forwarded to the handler, close frames echoed and turned
/// into the session's close record.
fn spawn_frame_router(
    session: Arc<Session>,
    mut inbound: mpsc::Receiver<Message>,
    to_handler: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut handler_gone = false;
        loop {
            tokio::select! {
                () = session.close_signal().cancelled() => break,
                maybe = inbound.recv() => match maybe {
                    None => {
                        // Transport vanished without a close frame.
                        let _ = session
                            .close_signal()
                            .resolve(SessionCloseInfo::abnormal());
                        break;
                    }
                    Some(Message::Close(frame)) => {
                        let record = close_record_from_frame(frame.clone());
                        let _ = session.send(Message::Close(frame));
                        let _ = session.close_signal().resolve(record);
                        break;
                    }
                    Some(Message::Ping(payload)) => {
                        let _ = session.send(Message::Pong(payload));
                    }
                    Some(Message::Pong(_)) => session.record_pong(),
                    Some(frame) => {
                        tokio::select! {
                            () = session.close_signal().cancelled() => break,
                            result = to_handler.send(frame) => {
                                if result.is_err() && !handler_gone {
                                    handler_gone = true;
                                    debug!(
                                        session_id = %session.id(),
                                        "handler input closed; data frames no longer forwarded"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

fn close_record_from_frame(frame: Option<CloseFrame>) -> SessionCloseInfo {
    match frame {
        Some(frame) => SessionCloseInfo::new(frame.code, frame.reason, CloseInitiator::Client),
        None => SessionCloseInfo::new(CloseCode::NO_STATUS, "", CloseInitiator::Client),
    }
}

/// Pushes one pipeline output frame at the session, enforcing the
/// slow-client limit. Returns `false` when delivery for this session is
/// over.
fn deliver(session: &Session, frame: Message) -> bool {
    match session.send(frame) {
        SendOutcome::Sent => true,
        SendOutcome::QueueFull => {
            if session.total_drops() >= MAX_SEND_DROPS {
                counter!(SLOW_CLIENT_CLOSES_TOTAL).increment(1);
                warn!(
                    session_id = %session.id(),
                    drops = session.total_drops(),
                    "closing session: too slow for its output stream"
                );
                let _ = session.close(SessionCloseInfo::new(
                    CloseCode::POLICY_VIOLATION,
                    "client too slow",
                    CloseInitiator::Server,
                ));
                return false;
            }
            true
        }
        SendOutcome::Closed => false,
    }
}

/// Forwards a shared pipeline's fan-out into one session's queue.
fn spawn_shared_forwarder(
    session: Arc<Session>,
    mut feed: broadcast::Receiver<Message>,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = session.close_signal().cancelled() => break,
                () = done.cancelled() => {
                    let _ = session.close(SessionCloseInfo::new(
                        CloseCode::NORMAL,
                        "pipeline complete",
                        CloseInitiator::Server,
                    ));
                    break;
                }
                result = feed.recv() => match result {
                    Ok(frame) => {
                        if !deliver(&session, frame) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        counter!(SEND_DROPS_TOTAL).increment(skipped);
                        warn!(
                            session_id = %session.id(),
                            skipped,
                            "session lagged behind shared fan-out"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

/// Runs a per-connection pipeline for a session-mode route.
///
/// A transforming handler that completes its output stream closes the
/// session normally, initiated by the server. A consuming handler runs
/// until the session closes.
fn spawn_session_pipeline(
    session: Arc<Session>,
    handler: RouteHandler,
    ctx: SocketContext,
    inbound: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    let frames: FrameStream = ReceiverStream::new(inbound).boxed();
    match handler {
        RouteHandler::Stream(handler) => tokio::spawn(async move {
            let mut out = handler.run(ctx, frames);
            loop {
                tokio::select! {
                    () = session.close_signal().cancelled() => break,
                    next = out.next() => match next {
                        Some(frame) => {
                            if !deliver(&session, frame) {
                                break;
                            }
                        }
                        None => {
                            let _ = session.close(SessionCloseInfo::new(
                                CloseCode::NORMAL,
                                "stream complete",
                                CloseInitiator::Server,
                            ));
                            break;
                        }
                    }
                }
            }
        }),
        RouteHandler::Sink(handler) => tokio::spawn(async move {
            tokio::select! {
                () = session.close_signal().cancelled() => {}
                () = handler.run(ctx, frames) => {}
            }
        }),
    }
}

/// Sends pings on the route's interval and tears the session down after
/// three unanswered intervals.
fn spawn_keepalive(session: Arc<Session>, policy: PingPolicy) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(policy.interval());
        // The first tick completes immediately; skip it so the first ping
        // goes out one interval after connect.
        let _ = ticks.tick().await;
        loop {
            tokio::select! {
                () = session.close_signal().cancelled() => break,
                _ = ticks.tick() => {
                    if session.last_pong_age() > policy.stale_after() {
                        counter!(KEEPALIVE_TIMEOUTS_TOTAL).increment(1);
                        warn!(
                            session_id = %session.id(),
                            age_ms = u64::try_from(session.last_pong_age().as_millis())
                                .unwrap_or(u64::MAX),
                            "keepalive timeout; closing stale session"
                        );
                        let _ = session.close(SessionCloseInfo::new(
                            CloseCode::ABNORMAL,
                            "keepalive timeout",
                            CloseInitiator::Client,
                        ));
                        break;
                    }
                    if session.send(Message::Ping(Bytes::new())) == SendOutcome::Closed {
                        break;
                    }
                }
            }
        }
    })
}
