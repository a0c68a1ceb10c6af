//! The lifecycle event hub: one bus per event kind, owned by the
//! composition root and handed to the registry and dispatch layers
//! explicitly — there are no global channels.

use crate::bus::EventBus;
use crate::lifecycle::{ClientSessionClosedEvent, ServerSessionClosedEvent, SessionConnectedEvent};

/// Aggregate of the three lifecycle buses.
pub struct EventHub {
    connected: EventBus<SessionConnectedEvent>,
    client_closed: EventBus<ClientSessionClosedEvent>,
    server_closed: EventBus<ServerSessionClosedEvent>,
}

impl EventHub {
    /// Hub with default-capacity buses.
    pub fn new() -> Self {
        Self {
            connected: EventBus::new("session_connected"),
            client_closed: EventBus::new("client_session_closed"),
            server_closed: EventBus::new("server_session_closed"),
        }
    }

    /// Connect events, fired synchronously with registry insertion.
    pub fn connected(&self) -> &EventBus<SessionConnectedEvent> {
        &self.connected
    }

    /// Closes as reported by the transport.
    pub fn client_closed(&self) -> &EventBus<ClientSessionClosedEvent> {
        &self.client_closed
    }

    /// Server-initiated closes.
    pub fn server_closed(&self) -> &EventBus<ServerSessionClosedEvent> {
        &self.server_closed
    }

    /// Close every bus. Later fires return `Terminated`; live subscriber
    /// streams end once drained.
    pub fn shutdown(&self) {
        self.connected.close();
        self.client_closed.close();
        self.server_closed.close();
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EmitResult;
    use crate::lifecycle::SessionInfo;
    use patchbay_core::SessionId;

    #[tokio::test]
    async fn buses_are_independent() {
        let hub = EventHub::new();
        let mut connects = hub.connected().subscribe();

        let info = SessionInfo::new(SessionId::new(), "/ws/feed");
        assert_eq!(
            hub.connected().fire(SessionConnectedEvent::new(info.clone())),
            EmitResult::Delivered
        );
        // Nothing crossed onto the close channels.
        assert_eq!(hub.client_closed().subscriber_count(), 0);

        let observed = connects.recv().await.unwrap();
        assert_eq!(observed.session().id(), info.id());
    }

    #[test]
    fn shutdown_terminates_every_bus() {
        let hub = EventHub::new();
        hub.shutdown();

        let info = SessionInfo::new(SessionId::new(), "/ws/feed");
        assert_eq!(
            hub.connected().fire(SessionConnectedEvent::new(info)),
            EmitResult::Terminated
        );
    }
}
