//! Session lifecycle events and the payloads they carry.
//!
//! Three kinds, each with exactly one immutable payload: a connect event
//! carrying the session info, and two close events — one for closes the
//! transport reported (typically client-driven) and one for closes this
//! server initiated. The server-close constructor re-stamps the initiator on
//! a defensive copy, so a reused client-supplied close record can never
//! claim the wrong side.

use chrono::{DateTime, Utc};
use patchbay_core::close::{CloseInitiator, CloseSignal, SessionCloseInfo};
use patchbay_core::ids::SessionId;

/// Common shape of every lifecycle event: one payload, read-only.
pub trait SocketEvent {
    /// The wrapped payload type.
    type Payload;

    /// Borrow the event payload.
    fn payload(&self) -> &Self::Payload;
}

/// Immutable snapshot of an admitted session, shared through connect events.
///
/// Clones share the close signal latch, so any holder can await the
/// session's termination.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    id: SessionId,
    path: String,
    connected_at: DateTime<Utc>,
    close: CloseSignal,
}

impl SessionInfo {
    /// Snapshot for a session admitted now.
    pub fn new(id: SessionId, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            connected_at: Utc::now(),
            close: CloseSignal::new(),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Route path the session attached to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Admission timestamp.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// The session's resolve-once close latch.
    pub fn close_signal(&self) -> &CloseSignal {
        &self.close
    }
}

/// Fired synchronously with registry insertion.
#[derive(Clone, Debug)]
pub struct SessionConnectedEvent {
    session: SessionInfo,
}

impl SessionConnectedEvent {
    /// Wrap a session snapshot.
    pub fn new(session: SessionInfo) -> Self {
        Self { session }
    }

    /// The connected session.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }
}

impl SocketEvent for SessionConnectedEvent {
    type Payload = SessionInfo;

    fn payload(&self) -> &SessionInfo {
        &self.session
    }
}

/// Fired by the close-observer worker when a session's close signal
/// resolves. Carries the close info exactly as the transport reported it —
/// the initiator is typically [`CloseInitiator::Client`] unless the server
/// closed first.
#[derive(Clone, Debug)]
pub struct ClientSessionClosedEvent {
    session_id: SessionId,
    info: SessionCloseInfo,
}

impl ClientSessionClosedEvent {
    /// Wrap the close record as received.
    pub fn new(session_id: SessionId, info: SessionCloseInfo) -> Self {
        Self { session_id, info }
    }

    /// The closed session's id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl SocketEvent for ClientSessionClosedEvent {
    type Payload = SessionCloseInfo;

    fn payload(&self) -> &SessionCloseInfo {
        &self.info
    }
}

/// Fired on the server-initiated close path.
///
/// The constructor copies the supplied close record and stamps the initiator
/// as [`CloseInitiator::Server`]; the caller's instance is left untouched.
#[derive(Clone, Debug)]
pub struct ServerSessionClosedEvent {
    session_id: SessionId,
    info: SessionCloseInfo,
}

impl ServerSessionClosedEvent {
    /// Defensive-copy constructor; always reports the server as initiator.
    pub fn new(session_id: SessionId, info: &SessionCloseInfo) -> Self {
        Self {
            session_id,
            info: info.with_initiator(CloseInitiator::Server),
        }
    }

    /// The closed session's id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl SocketEvent for ServerSessionClosedEvent {
    type Payload = SessionCloseInfo;

    fn payload(&self) -> &SessionCloseInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_core::close::CloseCode;

    #[test]
    fn connected_event_exposes_session_payload() {
        let info = SessionInfo::new(SessionId::new(), "/ws/chat");
        let event = SessionConnectedEvent::new(info.clone());
        assert_eq!(event.payload().id(), info.id());
        assert_eq!(event.payload().path(), "/ws/chat");
    }

    #[test]
    fn session_info_clones_share_the_close_latch() {
        let info = SessionInfo::new(SessionId::new(), "/ws/chat");
        let clone = info.clone();
        let _ = info
            .close_signal()
            .resolve(SessionCloseInfo::new(CloseCode::NORMAL, "", CloseInitiator::Client));
        assert!(clone.close_signal().is_resolved());
    }

    #[test]
    fn client_closed_event_keeps_info_as_received() {
        let info = SessionCloseInfo::new(CloseCode::GOING_AWAY, "shutdown", CloseInitiator::Server);
        let event = ClientSessionClosedEvent::new(SessionId::new(), info.clone());
        assert_eq!(event.payload(), &info);
    }

    #[test]
    fn server_closed_event_stamps_initiator() {
        let supplied = SessionCloseInfo::new(CloseCode::NORMAL, "done", CloseInitiator::Client);
        let event = ServerSessionClosedEvent::new(SessionId::new(), &supplied);

        assert_eq!(event.payload().initiator, CloseInitiator::Server);
        assert_eq!(event.payload().code, CloseCode::NORMAL);
        assert_eq!(event.payload().reason, "done");
        // Defensive copy: the supplied record is unchanged.
        assert_eq!(supplied.initiator, CloseInitiator::Client);
    }
}
