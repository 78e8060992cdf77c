//! Integration tests: WebSocketHandler against a tungstenite echo server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use xcomm_transport::{
    create_handler, CommError, ConnectionHandler, ConnectionState, Connector, CrossSystemMessage,
    HandlerOptions, MessageSender, MessageType, Protocol, SystemEndpoint,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn endpoint(port: u16) -> SystemEndpoint {
    SystemEndpoint::new("svc-ws", "WS Service", Protocol::WebSocket, "127.0.0.1", port)
        .with_path("/events")
        .with_timeout(Duration::from_secs(5))
}

/// Accept one client; answer each envelope with a RESPONSE, or with a raw
/// text frame that is not an envelope when the payload asks for garbage.
async fn echo_server(listener: TcpListener) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else { continue };
        let request = CrossSystemMessage::from_json(text.as_str()).unwrap();
        if request.payload.get("garbage").is_some() {
            ws.send(Message::text("definitely not an envelope")).await.unwrap();
            continue;
        }
        if request.payload.get("hangup").is_some() {
            ws.close(None).await.unwrap();
            break;
        }
        let reply = request.reply_to_message(serde_json::json!({"seen": request.message_id}));
        ws.send(Message::text(reply.to_json().unwrap())).await.unwrap();
    }
}

async fn start() -> (Arc<dyn ConnectionHandler>, mpsc::UnboundedReceiver<CrossSystemMessage>, mpsc::UnboundedReceiver<String>) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(echo_server(listener));

    let handler = create_handler(&endpoint(port), &HandlerOptions::new()).unwrap();
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    handler.on_message(Arc::new(move |msg: &CrossSystemMessage| {
        let _ = msg_tx.send(msg.clone());
    }));
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    handler.on_error(Arc::new(move |err: &CommError| {
        let _ = err_tx.send(err.to_string());
    }));
    handler.connect().await.unwrap();
    (handler, msg_rx, err_rx)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test]
async fn envelope_round_trip() {
    let (handler, mut messages, _errors) = start().await;
    assert_eq!(handler.state(), ConnectionState::Connected);

    let msg = CrossSystemMessage::new("ws-1", "svc-a", "svc-ws", MessageType::Command)
        .with_correlation_id("corr-1");
    handler.send_message(&msg).await.unwrap();

    let reply = recv(&mut messages).await;
    assert_eq!(reply.message_type, MessageType::Response);
    assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(reply.payload["seen"], "ws-1");
    assert_eq!(handler.metrics().total_messages_received, 1);

    handler.disconnect().await.unwrap();
    assert_eq!(handler.state(), ConnectionState::Disconnected);
    assert_eq!(handler.metrics().active_connections, 0);
}

#[tokio::test]
async fn malformed_text_frame_keeps_connection() {
    let (handler, mut messages, mut errors) = start().await;

    let bad = CrossSystemMessage::new("ws-bad", "svc-a", "svc-ws", MessageType::Event)
        .with_payload(serde_json::json!({"garbage": true}));
    handler.send_message(&bad).await.unwrap();
    let err = recv(&mut errors).await;
    assert!(err.contains("deserialization"), "unexpected error: {err}");

    let good = CrossSystemMessage::new("ws-good", "svc-a", "svc-ws", MessageType::Event);
    handler.send_message(&good).await.unwrap();
    assert_eq!(recv(&mut messages).await.payload["seen"], "ws-good");
    assert!(handler.is_connected());
    handler.disconnect().await.unwrap();
}

#[tokio::test]
async fn server_close_ends_connection() {
    let (handler, _messages, mut errors) = start().await;

    let bye = CrossSystemMessage::new("ws-bye", "svc-a", "svc-ws", MessageType::Event)
        .with_payload(serde_json::json!({"hangup": true}));
    handler.send_message(&bye).await.unwrap();

    for _ in 0..100 {
        if !handler.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handler.state(), ConnectionState::Error);
    assert_eq!(handler.metrics().active_connections, 0);
    // Loss is silent: no error report, no failure counted.
    assert!(errors.try_recv().is_err());
    assert_eq!(handler.metrics().failed_communications, 0);

    // Reconnect is not automatic.
    let late = CrossSystemMessage::new("ws-late", "svc-a", "svc-ws", MessageType::Event);
    assert!(handler.send_message(&late).await.is_err());
}
