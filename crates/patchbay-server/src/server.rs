//! The axum edge: HTTP router, WebSocket pump, and server lifecycle.
//!
//! [`Sockets`] is the composition root. `build` validates the handler
//! chain against the binding engine and assembles the dispatcher; `start`
//! binds a listener, spawns the close observer, and serves one GET route
//! per registered socket path plus `/health` and `/metrics`. The pump
//! between an upgraded socket and the dispatcher's channel transport is
//! the only code that touches axum's message type.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{
    CloseFrame as WsCloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade,
};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use patchbay_core::{
    CloseCode, CloseFrame, CloseInitiator, ConfigError, Message, RequestMeta, SessionCloseInfo,
    SessionId,
};
use patchbay_events::EventHub;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::binding::{self, BindingEngine};
use crate::guard::{AllowAll, DispatchGuard};
use crate::metrics;
use crate::pipeline::{
    AttachError, ConnectionRequest, Dispatcher, HANDLER_QUEUE_CAPACITY, Transport,
};
use crate::routes::{HandlerRegistry, SocketHandlers};
use crate::session::{self, SessionRegistry};

/// How long the writer gets to flush queued frames once the reader side
/// of a socket is gone.
const WRITER_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to bind. Zero picks an ephemeral port.
    pub port: u16,
    /// Capacity of each session's outbound frame queue.
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9098,
            max_send_queue: 256,
        }
    }
}

/// Composition root: configuration, event hub, and dispatcher.
pub struct Sockets {
    config: ServerConfig,
    hub: Arc<EventHub>,
    dispatcher: Arc<Dispatcher>,
}

impl Sockets {
    /// Builds a server with the default binding engine and a guard that
    /// admits everyone.
    pub fn build(config: ServerConfig, handlers: SocketHandlers) -> Result<Self, ConfigError> {
        Self::build_with(config, handlers, BindingEngine::new(), Arc::new(AllowAll))
    }

    /// Builds a server with a custom binding engine and dispatch guard.
    ///
    /// Fails fast on registration problems: duplicate or empty paths, and
    /// parameter descriptors whose source is ambiguous, missing, or
    /// lacking an evaluator.
    pub fn build_with(
        config: ServerConfig,
        handlers: SocketHandlers,
        binder: BindingEngine,
        guard: Arc<dyn DispatchGuard>,
    ) -> Result<Self, ConfigError> {
        let routes = Arc::new(HandlerRegistry::build(handlers)?);
        routes.validate_sources(&binder)?;
        let hub = Arc::new(EventHub::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&hub)));
        let dispatcher = Arc::new(Dispatcher::new(routes, Arc::new(binder), guard, registry));
        Ok(Self {
            config,
            hub,
            dispatcher,
        })
    }

    /// The lifecycle event hub.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// The live session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.dispatcher.registry()
    }

    /// The admission pipeline, for transports other than the built-in
    /// axum edge.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Admits one connection through the dispatcher.
    pub async fn attach(&self, request: ConnectionRequest) -> Result<SessionId, AttachError> {
        self.dispatcher.attach(request).await
    }

    /// Binds the listener and starts serving. Returns a handle that keeps
    /// the background tasks alive.
    pub async fn start(self) -> Result<ServerHandle, std::io::Error> {
        let sockets = Arc::new(self);
        let observer = session::spawn_close_observer(Arc::clone(sockets.registry()));
        let metrics_handle = metrics::try_install_recorder();

        let state = AppState {
            sockets: Arc::clone(&sockets),
            metrics: metrics_handle,
        };
        let router = build_router(state);

        let addr = format!("0.0.0.0:{}", sockets.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            port = local_addr.port(),
            routes = sockets.dispatcher.routes().len(),
            "patchbay server listening"
        );

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(ServerHandle {
            port: local_addr.port(),
            sockets,
            server,
            close_observer: observer,
        })
    }

    /// Stops event delivery, aborts shared pipelines, and closes every
    /// session with a going-away frame.
    pub fn shutdown(&self) {
        info!(sessions = self.registry().len(), "patchbay server shutting down");
        self.hub.shutdown();
        self.dispatcher.shutdown_pipelines();
        for id in self.registry().ids() {
            if let Some(live) = self.registry().get(&id) {
                let _ = live.close(SessionCloseInfo::new(
                    CloseCode::GOING_AWAY,
                    "server shutting down",
                    CloseInitiator::Server,
                ));
            }
            let _ = self.registry().remove(&id);
        }
    }
}

/// Handle returned by [`Sockets::start`] — keeps background tasks alive.
pub struct ServerHandle {
    port: u16,
    sockets: Arc<Sockets>,
    server: JoinHandle<()>,
    close_observer: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The running server's composition root.
    pub fn sockets(&self) -> &Arc<Sockets> {
        &self.sockets
    }

    /// The lifecycle event hub.
    pub fn hub(&self) -> &Arc<EventHub> {
        self.sockets.hub()
    }

    /// The live session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.sockets.registry()
    }

    /// Graceful shutdown: close sessions first so pumps can flush their
    /// going-away frames, then stop accepting and wait for the close
    /// observer to drain.
    pub async fn shutdown(self) {
        self.sockets.shutdown();
        let _ = self.close_observer.await;
        self.server.abort();
    }
}

/// Shared state for axum handlers.
#[derive(Clone)]
struct AppState {
    sockets: Arc<Sockets>,
    metrics: Option<PrometheusHandle>,
}

/// Builds the router: one GET upgrade route per socket path, plus health
/// and metrics.
fn build_router(state: AppState) -> Router {
    let paths: Vec<String> = state
        .sockets
        .dispatcher
        .routes()
        .paths()
        .map(str::to_owned)
        .collect();
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));
    for path in paths {
        router = router.route(&path, get(ws_handler));
    }
    router.with_state(state).layer(CorsLayer::permissive())
}

/// GET on a registered socket path: capture request metadata and upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let path = uri.path().to_owned();
    let meta = request_meta(&headers, uri.query());
    ws.on_upgrade(move |socket| pump_socket(socket, state.sockets, path, meta))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sockets.registry().len(),
        "routes": state.sockets.dispatcher.routes().len(),
    }))
}

/// Prometheus exposition endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder unavailable",
        )
            .into_response(),
    }
}

/// Captures handshake metadata for the binding engine.
///
/// Header names arrive lowercased by the HTTP layer; declared header keys
/// must match that casing. Every occurrence of a repeated header or query
/// key is kept, in arrival order.
fn request_meta(headers: &HeaderMap, query: Option<&str>) -> RequestMeta {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();
    RequestMeta::from_parts(headers, binding::parse_query(query.unwrap_or("")))
}

/// Bridges one upgraded socket to the dispatcher's channel transport.
async fn pump_socket(socket: WebSocket, sockets: Arc<Sockets>, path: String, meta: RequestMeta) {
    let (in_tx, in_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel(sockets.config.max_send_queue);

    let request = ConnectionRequest {
        path: path.clone(),
        meta,
        transport: Transport {
            inbound: in_rx,
            outbound: out_tx,
        },
    };

    let session_id = match sockets.attach(request).await {
        Ok(id) => id,
        Err(err) => {
            debug!(path, error = %err, "connection rejected");
            // Deliver the rejection close frame the dispatcher queued.
            let (mut ws_tx, _ws_rx) = socket.split();
            while let Ok(frame) = out_rx.try_recv() {
                if ws_tx.send(to_ws_message(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
            return;
        }
    };

    let Some(live) = sockets.registry().get(&session_id) else {
        return;
    };
    let signal = live.close_signal().clone();

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: session queue onto the wire. On close it drains what is
    // queued (the close frame rides the queue) and stops.
    let writer_signal = signal.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = out_rx.recv() => match maybe {
                    Some(frame) => {
                        let closing = frame.is_close();
                        if ws_tx.send(to_ws_message(frame)).await.is_err() || closing {
                            break;
                        }
                    }
                    None => break,
                },
                () = writer_signal.cancelled() => {
                    while let Ok(frame) = out_rx.try_recv() {
                        let closing = frame.is_close();
                        if ws_tx.send(to_ws_message(frame)).await.is_err() || closing {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    });

    // Reader: wire into the dispatcher. Dropping the sender on exit tells
    // the frame router the transport is gone.
    let reader_signal = signal.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = reader_signal.cancelled() => break,
                maybe = ws_rx.next() => match maybe {
                    // axum answers pings itself; don't surface them.
                    Some(Ok(WsMessage::Ping(_))) => {}
                    Some(Ok(frame)) => {
                        if in_tx.send(from_ws_message(frame)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_)) | None => break,
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {
            reader.abort();
        }
        _ = &mut reader => {
            let _ = tokio::time::timeout(WRITER_DRAIN_GRACE, &mut writer).await;
            writer.abort();
        }
    }
    debug!(session_id = %session_id, "socket pump finished");
}

fn to_ws_message(frame: Message) -> WsMessage {
    match frame {
        Message::Text(text) => WsMessage::Text(text.into()),
        Message::Binary(data) => WsMessage::Binary(data),
        Message::Ping(data) => WsMessage::Ping(data),
        Message::Pong(data) => WsMessage::Pong(data),
        Message::Close(frame) => WsMessage::Close(frame.map(|f| WsCloseFrame {
            code: f.code.as_u16(),
            reason: f.reason.into(),
        })),
    }
}

fn from_ws_message(frame: WsMessage) -> Message {
    match frame {
        WsMessage::Text(text) => Message::Text(text.as_str().to_owned()),
        WsMessage::Binary(data) => Message::Binary(data),
        WsMessage::Ping(data) => Message::Ping(data),
        WsMessage::Pong(data) => Message::Pong(data),
        WsMessage::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode(f.code),
            reason: f.reason.as_str().to_owned(),
        })),
    }
}

/// Initializes tracing with `RUST_LOG` or an `info` default. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
