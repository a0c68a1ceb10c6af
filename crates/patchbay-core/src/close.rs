//! Close vocabulary: status codes, initiator tags, and the resolve-once
//! close signal every session carries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// WebSocket close status code (RFC 6455 section 7.4).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// 1000 — normal closure.
    pub const NORMAL: Self = Self(1000);
    /// 1001 — endpoint going away (server shutdown).
    pub const GOING_AWAY: Self = Self(1001);
    /// 1005 — peer closed without a status code; local-only.
    pub const NO_STATUS: Self = Self(1005);
    /// 1006 — abnormal closure; never sent on the wire, recorded locally.
    pub const ABNORMAL: Self = Self(1006);
    /// 1008 — policy violation (failed guard or binding).
    pub const POLICY_VIOLATION: Self = Self(1008);
    /// 1011 — unexpected server condition.
    pub const SERVER_ERROR: Self = Self(1011);

    /// Raw status code value.
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Code + reason pair carried by a close frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseFrame {
    /// Close status code.
    pub code: CloseCode,
    /// Human-readable reason, possibly empty.
    pub reason: String,
}

/// Which side drove the close.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseInitiator {
    /// The remote peer closed (or the connection dropped).
    Client,
    /// This server closed the session.
    Server,
}

impl fmt::Display for CloseInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("CLIENT"),
            Self::Server => f.write_str("SERVER"),
        }
    }
}

/// Immutable record of how a session ended.
///
/// Constructed once at close time. The server-close event type copies it and
/// re-stamps the initiator, so a client-supplied instance can never misreport
/// who closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCloseInfo {
    /// Close status code.
    pub code: CloseCode,
    /// Reason text, possibly empty.
    pub reason: String,
    /// Which side initiated the close.
    pub initiator: CloseInitiator,
}

impl SessionCloseInfo {
    /// Build a close record.
    pub fn new(code: CloseCode, reason: impl Into<String>, initiator: CloseInitiator) -> Self {
        Self { code, reason: reason.into(), initiator }
    }

    /// 1006 abnormal closure attributed to the client side.
    pub fn abnormal() -> Self {
        Self::new(CloseCode::ABNORMAL, "abnormal closure", CloseInitiator::Client)
    }

    /// Copy of this record with the initiator replaced.
    pub fn with_initiator(&self, initiator: CloseInitiator) -> Self {
        Self { code: self.code, reason: self.reason.clone(), initiator }
    }

    /// The wire frame for this close (1005 and 1006 are local-only and
    /// yield no frame).
    pub fn to_frame(&self) -> Option<CloseFrame> {
        if self.code == CloseCode::ABNORMAL || self.code == CloseCode::NO_STATUS {
            return None;
        }
        Some(CloseFrame { code: self.code, reason: self.reason.clone() })
    }
}

/// Latch that resolves exactly once with the session's [`SessionCloseInfo`].
///
/// Clones share the same latch. The first `resolve` wins; later calls are
/// discarded. `cancelled()` exposes the underlying token so per-session tasks
/// can select on it without consuming the info.
#[derive(Clone, Debug, Default)]
pub struct CloseSignal {
    inner: Arc<CloseSignalInner>,
}

#[derive(Debug, Default)]
struct CloseSignalInner {
    token: CancellationToken,
    info: OnceLock<SessionCloseInfo>,
}

impl CloseSignal {
    /// Fresh, unresolved signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the latch. Returns `true` if this call won the race.
    ///
    /// The info is stored before the token trips, so any task woken by
    /// `closed()` observes the winning record.
    pub fn resolve(&self, info: SessionCloseInfo) -> bool {
        let won = self.inner.info.set(info).is_ok();
        if won {
            self.inner.token.cancel();
        }
        won
    }

    /// Wait until the latch resolves and return the close record.
    pub async fn closed(&self) -> SessionCloseInfo {
        self.inner.token.cancelled().await;
        // The token only trips after the info is stored.
        self.inner.info.get().cloned().unwrap_or_else(SessionCloseInfo::abnormal)
    }

    /// Cancellation view for `tokio::select!` arms.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// True once resolved.
    pub fn is_resolved(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The close record, if already resolved.
    pub fn info(&self) -> Option<SessionCloseInfo> {
        self.inner.info.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_resolve_wins() {
        let signal = CloseSignal::new();
        let first = SessionCloseInfo::new(CloseCode::NORMAL, "first", CloseInitiator::Client);
        let second = SessionCloseInfo::new(CloseCode::GOING_AWAY, "second", CloseInitiator::Server);

        assert!(signal.resolve(first.clone()));
        assert!(!signal.resolve(second));
        assert_eq!(signal.info(), Some(first));
    }

    #[tokio::test]
    async fn closed_returns_winning_info() {
        let signal = CloseSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.closed().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let info = SessionCloseInfo::new(CloseCode::NORMAL, "bye", CloseInitiator::Server);
        assert!(signal.resolve(info.clone()));

        let observed = task.await.unwrap();
        assert_eq!(observed, info);
    }

    #[tokio::test]
    async fn clones_share_the_latch() {
        let signal = CloseSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_resolved());

        let _ = signal.resolve(SessionCloseInfo::abnormal());
        assert!(clone.is_resolved());
        let observed = clone.closed().await;
        assert_eq!(observed.code, CloseCode::ABNORMAL);
    }

    #[test]
    fn abnormal_close_has_no_wire_frame() {
        assert!(SessionCloseInfo::abnormal().to_frame().is_none());
        let normal = SessionCloseInfo::new(CloseCode::NORMAL, "", CloseInitiator::Server);
        assert_eq!(normal.to_frame().map(|f| f.code), Some(CloseCode::NORMAL));
    }

    #[test]
    fn with_initiator_copies() {
        let client = SessionCloseInfo::new(CloseCode::NORMAL, "x", CloseInitiator::Client);
        let stamped = client.with_initiator(CloseInitiator::Server);
        assert_eq!(stamped.initiator, CloseInitiator::Server);
        assert_eq!(client.initiator, CloseInitiator::Client);
        assert_eq!(stamped.code, client.code);
    }
}
