//! Live session state and the session registry.
//!
//! A [`Session`] is the server-side handle for one connection: its
//! identity, its bound parameters, its outbound queue, and its close
//! latch. The [`SessionRegistry`] maps ids to sessions and owns the
//! lifecycle event wiring: `put` fires the connected event synchronously,
//! and a single background observer fires the client-close event and
//! evicts the entry once a session's latch resolves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use metrics::{counter, gauge};
use patchbay_core::{
    BoundParams, CloseInitiator, CloseSignal, Message, RequestMeta, SessionCloseInfo, SessionId,
};
use patchbay_events::{
    ClientSessionClosedEvent, EmitResult, EventHub, ServerSessionClosedEvent, SessionConnectedEvent,
    SessionInfo,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics::{
    SEND_DROPS_TOTAL, SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_CONNECTED_TOTAL,
};

/// Dropped outbound frames tolerated before a session is judged too slow
/// to keep.
pub const MAX_SEND_DROPS: u32 = 100;

/// Result of a non-blocking enqueue onto a session's outbound queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// Frame queued for the writer.
    Sent,
    /// Queue full; the frame was dropped and counted against the session.
    QueueFull,
    /// The transport side is gone.
    Closed,
}

/// Server-side handle for one live connection.
#[derive(Debug)]
pub struct Session {
    info: SessionInfo,
    meta: Arc<RequestMeta>,
    params: BoundParams,
    outbound: mpsc::Sender<Message>,
    connected_mark: tokio::time::Instant,
    last_pong_ms: AtomicU64,
    drops: AtomicU32,
}

impl Session {
    /// Builds a session around an outbound frame queue.
    pub fn new(
        info: SessionInfo,
        meta: Arc<RequestMeta>,
        params: BoundParams,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            info,
            meta,
            params,
            outbound,
            connected_mark: tokio::time::Instant::now(),
            last_pong_ms: AtomicU64::new(0),
            drops: AtomicU32::new(0),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        self.info.id()
    }

    /// Path the session connected on.
    pub fn path(&self) -> &str {
        self.info.path()
    }

    /// Identity snapshot shared with lifecycle events.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Request metadata captured at the handshake.
    pub fn meta(&self) -> &Arc<RequestMeta> {
        &self.meta
    }

    /// Parameters bound before the session started.
    pub fn params(&self) -> &BoundParams {
        &self.params
    }

    /// The close latch shared with every task serving this session.
    pub fn close_signal(&self) -> &CloseSignal {
        self.info.close_signal()
    }

    /// Enqueues a frame without blocking.
    pub fn send(&self, message: Message) -> SendOutcome {
        match self.outbound.try_send(message) {
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => {
                let _ = self.drops.fetch_add(1, Ordering::Relaxed);
                counter!(SEND_DROPS_TOTAL).increment(1);
                SendOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Frames dropped against this session so far.
    pub fn total_drops(&self) -> u32 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Marks a pong (or any other proof of liveness) as just received.
    pub fn record_pong(&self) {
        let elapsed = u64::try_from(self.connected_mark.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_pong_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last recorded pong, measured from connect when none
    /// arrived yet.
    pub fn last_pong_age(&self) -> Duration {
        let now = u64::try_from(self.connected_mark.elapsed().as_millis()).unwrap_or(u64::MAX);
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Closes the session: queues the close frame (when the code carries
    /// one) and resolves the latch.
    ///
    /// Returns `false` when another closer already won.
    pub fn close(&self, info: SessionCloseInfo) -> bool {
        if self.close_signal().is_resolved() {
            return false;
        }
        if let Some(frame) = info.to_frame() {
            let _ = self.outbound.try_send(Message::Close(Some(frame)));
        }
        self.close_signal().resolve(info)
    }
}

/// Concurrent map of live sessions plus the lifecycle event wiring.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    hub: Arc<EventHub>,
}

impl SessionRegistry {
    /// Registry publishing lifecycle events to `hub`.
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            sessions: DashMap::new(),
            hub,
        }
    }

    /// The event hub this registry publishes to.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Stores a session and fires the connected event before returning.
    ///
    /// The emit result is surfaced so callers can observe saturation; a
    /// non-delivered fire never rolls back the registration.
    pub fn put(&self, session: Arc<Session>) -> EmitResult {
        let info = session.info().clone();
        let prior = self.sessions.insert(session.id().clone(), session);
        debug_assert!(prior.is_none(), "session id registered twice");
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        counter!(SESSIONS_CONNECTED_TOTAL).increment(1);
        let result = self.hub.connected().fire(SessionConnectedEvent::new(info));
        if !result.is_delivered() {
            warn!(result = result.as_str(), "session connected event not delivered");
        }
        result
    }

    /// Looks up a live session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Evicts a session, decrementing the active gauge when it was
    /// present.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            gauge!(SESSIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session ids currently registered.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Server-initiated close of one session.
    ///
    /// The published event and the close record handed to the transport
    /// both carry `CloseInitiator::Server`, whatever the caller supplied;
    /// the caller's record itself is left untouched. Returns `None` for an
    /// unknown id.
    pub fn close_session(&self, id: &SessionId, info: SessionCloseInfo) -> Option<EmitResult> {
        let session = self.get(id)?;
        let event = ServerSessionClosedEvent::new(id.clone(), &info);
        let _ = session.close(info.with_initiator(CloseInitiator::Server));
        Some(self.hub.server_closed().fire(event))
    }

    /// Fires the client-close event for a finished session and evicts it.
    fn finish_close(&self, info: &SessionInfo, close: SessionCloseInfo) {
        let result = self
            .hub
            .client_closed()
            .fire(ClientSessionClosedEvent::new(info.id().clone(), close.clone()));
        if !result.is_delivered() {
            warn!(
                session_id = %info.id(),
                result = result.as_str(),
                "client close event not delivered"
            );
        }
        if self.remove(info.id()).is_some() {
            counter!(SESSIONS_CLOSED_TOTAL).increment(1);
        }
        debug!(
            session_id = %info.id(),
            code = close.code.as_u16(),
            initiator = %close.initiator,
            "session closed"
        );
    }
}

/// Spawns the single background worker that watches every session's close
/// latch.
///
/// The worker subscribes to connected events before returning, so a
/// session stored immediately after this call is already observed. For
/// each resolved latch it fires the client-close event with the close
/// record exactly as the latch captured it, then evicts the session. The
/// worker stops when the hub shuts down; latches resolving after that are
/// dropped.
pub fn spawn_close_observer(registry: Arc<SessionRegistry>) -> JoinHandle<()> {
    let mut connects = registry.hub().connected().subscribe();
    tokio::spawn(async move {
        let mut pending = FuturesUnordered::new();
        debug!("close observer running");
        loop {
            tokio::select! {
                maybe = connects.recv() => match maybe {
                    Some(event) => {
                        let info = event.session().clone();
                        pending.push(async move {
                            let close = info.close_signal().closed().await;
                            (info, close)
                        });
                    }
                    None => break,
                },
                Some((info, close)) = pending.next(), if !pending.is_empty() => {
                    registry.finish_close(&info, close);
                }
            }
        }
        debug!(pending = pending.len(), "close observer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use patchbay_core::CloseCode;
    use patchbay_events::SocketEvent;

    fn new_session(queue: usize) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue);
        let info = SessionInfo::new(SessionId::new(), "/ws/test");
        let session = Arc::new(Session::new(
            info,
            Arc::new(RequestMeta::new()),
            BoundParams::new(),
            tx,
        ));
        (session, rx)
    }

    #[tokio::test]
    async fn send_reports_queue_full_and_counts_drops() {
        let (session, _rx) = new_session(2);
        assert_eq!(session.send(Message::text("a")), SendOutcome::Sent);
        assert_eq!(session.send(Message::text("b")), SendOutcome::Sent);
        assert_eq!(session.send(Message::text("c")), SendOutcome::QueueFull);
        assert_eq!(session.total_drops(), 1);
    }

    #[tokio::test]
    async fn send_reports_closed_transport() {
        let (session, rx) = new_session(1);
        drop(rx);
        assert_eq!(session.send(Message::text("a")), SendOutcome::Closed);
        assert_eq!(session.total_drops(), 0);
    }

    #[tokio::test]
    async fn close_queues_frame_then_resolves_latch() {
        let (session, mut rx) = new_session(4);
        let info = SessionCloseInfo::new(CloseCode::NORMAL, "done", CloseInitiator::Server);
        assert!(session.close(info.clone()));
        assert!(session.close_signal().is_resolved());
        assert_eq!(session.close_signal().info(), Some(info));

        let frame = rx.try_recv().ok().and_then(|m| match m {
            Message::Close(frame) => frame,
            _ => None,
        });
        assert_eq!(frame.map(|f| f.code), Some(CloseCode::NORMAL));

        // Second close loses the race.
        assert!(!session.close(SessionCloseInfo::abnormal()));
    }

    #[tokio::test]
    async fn abnormal_close_sends_no_frame() {
        let (session, mut rx) = new_session(4);
        assert!(session.close(SessionCloseInfo::abnormal()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_age_tracks_the_latest_pong() {
        let (session, _rx) = new_session(1);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(session.last_pong_age() >= Duration::from_secs(10));
        session.record_pong();
        assert!(session.last_pong_age() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn put_fires_connected_synchronously() {
        let hub = Arc::new(EventHub::new());
        let registry = SessionRegistry::new(Arc::clone(&hub));
        let mut connected = hub.connected().subscribe();

        let (session, _rx) = new_session(1);
        let id = session.id().clone();
        let result = registry.put(session);
        assert_matches!(result, EmitResult::Delivered);

        // Fired before put returned, so the event is already queued.
        let event = connected.try_recv().expect("connected event queued");
        assert_eq!(event.session().id(), &id);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());
    }

    #[tokio::test]
    async fn put_without_subscribers_still_delivers() {
        let registry = SessionRegistry::new(Arc::new(EventHub::new()));
        let (session, _rx) = new_session(1);
        assert_matches!(registry.put(session), EmitResult::Delivered);
    }

    #[tokio::test]
    async fn close_session_stamps_server_initiator() {
        let hub = Arc::new(EventHub::new());
        let registry = SessionRegistry::new(Arc::clone(&hub));
        let mut closed = hub.server_closed().subscribe();

        let (session, _rx) = new_session(4);
        let id = session.id().clone();
        let _ = registry.put(session);

        // Caller claims the client initiated; the published event and the
        // latch both say otherwise.
        let supplied = SessionCloseInfo::new(CloseCode::GOING_AWAY, "restart", CloseInitiator::Client);
        let result = registry.close_session(&id, supplied.clone());
        assert_matches!(result, Some(EmitResult::Delivered));

        let event = closed.try_recv().expect("server close event queued");
        assert_eq!(event.payload().initiator, CloseInitiator::Server);
        assert_eq!(event.payload().code, CloseCode::GOING_AWAY);
        assert_eq!(supplied.initiator, CloseInitiator::Client);

        let latched = registry
            .get(&id)
            .and_then(|s| s.close_signal().info())
            .expect("latch resolved");
        assert_eq!(latched.initiator, CloseInitiator::Server);
    }

    #[tokio::test]
    async fn close_session_unknown_id_is_none() {
        let registry = SessionRegistry::new(Arc::new(EventHub::new()));
        let info = SessionCloseInfo::new(CloseCode::NORMAL, "", CloseInitiator::Server);
        assert!(registry.close_session(&SessionId::new(), info).is_none());
    }

    #[tokio::test]
    async fn observer_fires_client_close_and_evicts() {
        let hub = Arc::new(EventHub::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&hub)));
        let worker = spawn_close_observer(Arc::clone(&registry));
        let mut closed = hub.client_closed().subscribe();

        let (session, _rx) = new_session(4);
        let id = session.id().clone();
        let signal = session.close_signal().clone();
        let _ = registry.put(session);

        let close = SessionCloseInfo::new(CloseCode::NORMAL, "bye", CloseInitiator::Client);
        assert!(signal.resolve(close.clone()));

        let event = closed.recv().await.expect("client close event");
        assert_eq!(event.session_id(), &id);
        assert_eq!(event.payload(), &close);

        // Eviction follows the fire; give the worker a beat.
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registry.is_empty());

        hub.shutdown();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn observer_watches_sessions_stored_after_spawn() {
        let hub = Arc::new(EventHub::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&hub)));
        let worker = spawn_close_observer(Arc::clone(&registry));

        // Two sessions, closed in reverse order of connection.
        let (first, _rx1) = new_session(1);
        let (second, _rx2) = new_session(1);
        let first_signal = first.close_signal().clone();
        let second_signal = second.close_signal().clone();
        let mut closed = hub.client_closed().subscribe();
        let _ = registry.put(first);
        let _ = registry.put(second);

        assert!(second_signal.resolve(SessionCloseInfo::abnormal()));
        assert!(first_signal.resolve(SessionCloseInfo::abnormal()));

        let mut seen = 0;
        while seen < 2 {
            if closed.recv().await.is_some() {
                seen += 1;
            } else {
                break;
            }
        }
        assert_eq!(seen, 2);

        hub.shutdown();
        let _ = worker.await;
    }
}
