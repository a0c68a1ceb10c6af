//! End-to-end integration tests using a real WebSocket client.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use patchbay_core::{CloseInitiator, Message as Frame, ParamSpec, TargetType};
use patchbay_events::SocketEvent;
use patchbay_server::{
    FrameStream, Registration, ServerConfig, ServerHandle, SocketContext, SocketHandlers,
    SocketMode, Sockets,
};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Boot a server on an ephemeral port.
async fn boot(handlers: SocketHandlers) -> ServerHandle {
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    Sockets::build(config, handlers)
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn connect(port: u16, path: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}{path}"))
        .await
        .unwrap();
    ws
}

/// Read the next text frame, skipping anything else.
async fn read_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return text.as_str().to_owned();
        }
    }
}

/// Read until the close frame arrives.
async fn read_close(ws: &mut WsStream) -> Option<CloseFrame> {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Close(frame) = msg {
            return frame;
        }
    }
}

fn upper(frame: Frame) -> Frame {
    match frame {
        Frame::Text(text) => Frame::Text(text.to_uppercase()),
        other => other,
    }
}

fn echo_route(path: &str) -> Registration {
    Registration::stream(path, SocketMode::Session, |_ctx, inbound: FrameStream| {
        inbound.boxed()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_health_endpoint() {
    let handle = boot(SocketHandlers::handle(echo_route("/ws/echo"))).await;

    let url = format!("http://127.0.0.1:{}/health", handle.port());
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_metrics_endpoint() {
    let handle = boot(SocketHandlers::handle(echo_route("/ws/echo"))).await;

    // The recorder is process-global; only the first server in the test
    // binary owns it, the rest serve 503.
    let url = format!("http://127.0.0.1:{}/metrics", handle.port());
    let resp = reqwest::get(&url).await.unwrap();
    assert!(resp.status() == 200 || resp.status() == 503);

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_session_echo_round_trip() {
    let handle = boot(SocketHandlers::handle(echo_route("/ws/echo"))).await;

    let mut ws = connect(handle.port(), "/ws/echo").await;
    ws.send(Message::text("hello")).await.unwrap();
    assert_eq!(read_text(&mut ws).await, "hello");
    ws.send(Message::text("again")).await.unwrap();
    assert_eq!(read_text(&mut ws).await, "again");

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_session_mode_isolates_connections() {
    let handle = boot(SocketHandlers::handle(echo_route("/ws/echo"))).await;

    let mut ws1 = connect(handle.port(), "/ws/echo").await;
    let mut ws2 = connect(handle.port(), "/ws/echo").await;

    ws1.send(Message::text("mine")).await.unwrap();
    assert_eq!(read_text(&mut ws1).await, "mine");

    // The second session never sees the first session's traffic.
    assert!(
        timeout(Duration::from_millis(300), ws2.next())
            .await
            .is_err()
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_shared_route_fans_out_without_replay() {
    let chain = SocketHandlers::handle(Registration::stream(
        "/ws/feed",
        SocketMode::Shared,
        |_ctx, inbound: FrameStream| inbound.map(upper).boxed(),
    ));
    let handle = boot(chain).await;
    let mut connected = handle.hub().connected().subscribe();

    let mut ws1 = connect(handle.port(), "/ws/feed").await;
    let _ = timeout(TIMEOUT, connected.recv()).await.unwrap().unwrap();
    let mut ws2 = connect(handle.port(), "/ws/feed").await;
    let _ = timeout(TIMEOUT, connected.recv()).await.unwrap().unwrap();

    ws1.send(Message::text("to everyone")).await.unwrap();
    assert_eq!(read_text(&mut ws1).await, "TO EVERYONE");
    assert_eq!(read_text(&mut ws2).await, "TO EVERYONE");

    // A late joiner sees nothing already published...
    let mut ws3 = connect(handle.port(), "/ws/feed").await;
    let _ = timeout(TIMEOUT, connected.recv()).await.unwrap().unwrap();
    assert!(
        timeout(Duration::from_millis(300), ws3.next())
            .await
            .is_err()
    );

    // ...but shares everything published afterwards.
    ws2.send(Message::text("round two")).await.unwrap();
    assert_eq!(read_text(&mut ws1).await, "ROUND TWO");
    assert_eq!(read_text(&mut ws2).await, "ROUND TWO");
    assert_eq!(read_text(&mut ws3).await, "ROUND TWO");

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_lifecycle_events() {
    let handle = boot(SocketHandlers::handle(echo_route("/ws/live"))).await;
    let mut connected = handle.hub().connected().subscribe();
    let mut closed = handle.hub().client_closed().subscribe();

    let mut ws = connect(handle.port(), "/ws/live").await;
    let event = timeout(TIMEOUT, connected.recv())
        .await
        .expect("timeout waiting for connect event")
        .expect("hub closed");
    assert_eq!(event.session().path(), "/ws/live");
    assert_eq!(handle.registry().len(), 1);

    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "done".into(),
    }))
    .await
    .unwrap();

    let event = timeout(TIMEOUT, closed.recv())
        .await
        .expect("timeout waiting for close event")
        .expect("hub closed");
    assert_eq!(event.payload().code, patchbay_core::CloseCode::NORMAL);
    assert_eq!(event.payload().reason, "done");
    assert_eq!(event.payload().initiator, CloseInitiator::Client);

    // The close observer evicts the session shortly after.
    let mut tries = 0;
    while !handle.registry().is_empty() && tries < 50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tries += 1;
    }
    assert!(handle.registry().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_required_header_gates_the_handshake() {
    let chain = SocketHandlers::handle(
        echo_route("/ws/secure")
            .params([ParamSpec::header("x-api-key", TargetType::Str).required()]),
    );
    let handle = boot(chain).await;

    // Without the header the upgrade succeeds but the server immediately
    // closes with a policy violation.
    let mut ws = connect(handle.port(), "/ws/secure").await;
    let frame = read_close(&mut ws).await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Policy);

    // With the header the session behaves normally.
    let mut request = format!("ws://127.0.0.1:{}/ws/secure", handle.port())
        .into_client_request()
        .unwrap();
    let _ = request
        .headers_mut()
        .insert("x-api-key", "sekrit".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();
    ws.send(Message::text("ping")).await.unwrap();
    assert_eq!(read_text(&mut ws).await, "ping");

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_query_params_reach_the_handler() {
    let chain = SocketHandlers::handle(
        Registration::stream(
            "/ws/greet",
            SocketMode::Session,
            |ctx: SocketContext, inbound: FrameStream| {
                let who = ctx
                    .params()
                    .str_value("who")
                    .unwrap_or("stranger")
                    .to_owned();
                inbound
                    .map(move |frame| match frame {
                        Frame::Text(text) => Frame::Text(format!("{text}, {who}")),
                        other => other,
                    })
                    .boxed()
            },
        )
        .params([ParamSpec::query("who", TargetType::Str)]),
    );
    let handle = boot(chain).await;

    let mut ws = connect(handle.port(), "/ws/greet?who=world").await;
    ws.send(Message::text("hello")).await.unwrap();
    assert_eq!(read_text(&mut ws).await, "hello, world");

    // An absent optional string binds as absent; the handler falls back.
    let mut ws = connect(handle.port(), "/ws/greet").await;
    ws.send(Message::text("hello")).await.unwrap();
    assert_eq!(read_text(&mut ws).await, "hello, stranger");

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_shutdown_sends_going_away() {
    let handle = boot(SocketHandlers::handle(echo_route("/ws/echo"))).await;

    let mut ws = connect(handle.port(), "/ws/echo").await;
    // Round trip to make sure the session is fully attached.
    ws.send(Message::text("ping")).await.unwrap();
    assert_eq!(read_text(&mut ws).await, "ping");

    handle.shutdown().await;
    let frame = read_close(&mut ws).await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Away);
}
