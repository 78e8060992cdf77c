//! Integration tests: TcpHandler against a framed echo server on localhost.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use xcomm_transport::framing::{encode_frame, read_message, write_message};
use xcomm_transport::{
    create_handler, CommError, ConnectionHandler, ConnectionState, Connector, CrossSystemMessage,
    HandlerOptions, MessageReceiver, MessageSender, MessageType, Protocol, SystemEndpoint,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn endpoint(port: u16) -> SystemEndpoint {
    SystemEndpoint::new("svc-b", "Service B", Protocol::Tcp, "127.0.0.1", port)
        .with_timeout(Duration::from_secs(5))
}

fn message_channel(handler: &Arc<dyn ConnectionHandler>) -> mpsc::UnboundedReceiver<CrossSystemMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    handler.on_message(Arc::new(move |msg: &CrossSystemMessage| {
        let _ = tx.send(msg.clone());
    }));
    rx
}

fn error_channel(handler: &Arc<dyn ConnectionHandler>) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    handler.on_error(Arc::new(move |err: &CommError| {
        let _ = tx.send(err.to_string());
    }));
    rx
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

/// Send a request, get the server's framed reply back through the listener.
#[tokio::test]
async fn request_reply_over_tcp() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_message(&mut socket, 1 << 20, "client").await.unwrap();
        let reply = request.reply_to_message(serde_json::json!({"echo": request.payload["n"]}));
        write_message(&mut socket, &reply, 1 << 20, "client").await.unwrap();
        request
    });

    let handler = create_handler(&endpoint(port), &HandlerOptions::new()).unwrap();
    let mut messages = message_channel(&handler);
    handler.connect().await.unwrap();
    assert_eq!(handler.state(), ConnectionState::Connected);
    assert_eq!(handler.metrics().active_connections, 1);

    let request = CrossSystemMessage::new("req-1", "svc-a", "svc-b", MessageType::Request)
        .with_payload(serde_json::json!({"n": 41}));
    handler.send_message(&request).await.unwrap();

    let reply = recv(&mut messages).await;
    assert_eq!(reply.message_type, MessageType::Response);
    assert_eq!(reply.correlation_id.as_deref(), Some("req-1"));
    assert_eq!(reply.target_system, "svc-a");
    assert_eq!(reply.payload["echo"], 41);

    let seen = server.await.unwrap();
    assert_eq!(seen, request);

    let metrics = handler.metrics();
    assert_eq!(metrics.total_messages_sent, 1);
    assert_eq!(metrics.total_messages_received, 1);

    handler.disconnect().await.unwrap();
    assert_eq!(handler.state(), ConnectionState::Disconnected);
    assert_eq!(handler.metrics().active_connections, 0);
}

/// `receive_message` yields frames pushed by the server.
#[tokio::test]
async fn receive_message_waits_for_push() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        go_rx.await.unwrap();
        let push = CrossSystemMessage::new("evt-1", "svc-b", "svc-a", MessageType::Event);
        write_message(&mut socket, &push, 1 << 20, "client").await.unwrap();
        // Hold the socket open until the test is done.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let handler = create_handler(&endpoint(port), &HandlerOptions::new()).unwrap();
    handler.connect().await.unwrap();

    let waiter = tokio::spawn({
        let handler = handler.clone();
        async move { handler.receive_message().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    go_tx.send(()).unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got.message_id, "evt-1");
    handler.disconnect().await.unwrap();
}

/// A frame that is not an envelope is reported; the next frame still arrives.
#[tokio::test]
async fn malformed_frame_is_skipped() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(&encode_frame(b"{not json", 1024).unwrap())
            .await
            .unwrap();
        let good = CrossSystemMessage::new("ok-1", "svc-b", "svc-a", MessageType::Notification);
        write_message(&mut socket, &good, 1 << 20, "client").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let handler = create_handler(&endpoint(port), &HandlerOptions::new()).unwrap();
    let mut messages = message_channel(&handler);
    let mut errors = error_channel(&handler);
    handler.connect().await.unwrap();

    let err = recv(&mut errors).await;
    assert!(err.contains("deserialization"), "unexpected error: {err}");
    let msg = recv(&mut messages).await;
    assert_eq!(msg.message_id, "ok-1");
    assert!(handler.is_connected());
    handler.disconnect().await.unwrap();
}

/// Peer hang-up ends the connection and frees the connection slot.
#[tokio::test]
async fn peer_close_releases_connection() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let handler = create_handler(&endpoint(port), &HandlerOptions::new()).unwrap();
    let mut errors = error_channel(&handler);
    handler.connect().await.unwrap();

    let mut state = handler.state();
    for _ in 0..100 {
        state = handler.state();
        if state != ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, ConnectionState::Error);
    assert_eq!(handler.metrics().active_connections, 0);
    // Loss is silent: no error report, no failure counted.
    assert!(errors.try_recv().is_err());
    assert_eq!(handler.metrics().failed_communications, 0);

    let msg = CrossSystemMessage::new("late", "svc-a", "svc-b", MessageType::Event);
    assert!(matches!(
        handler.send_message(&msg).await,
        Err(CommError::NotConnected(_))
    ));
}

/// A length prefix above the configured cap drops the connection.
#[tokio::test]
async fn oversized_frame_drops_connection() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&4096u32.to_be_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let options = HandlerOptions::new().max_frame_size(1024);
    let handler = create_handler(&endpoint(port), &options).unwrap();
    let mut errors = error_channel(&handler);
    handler.connect().await.unwrap();

    let err = recv(&mut errors).await;
    assert!(err.contains("too large"), "unexpected error: {err}");
    assert!(!handler.is_connected());
    assert_eq!(handler.metrics().active_connections, 0);
}

/// A peer that never reads cannot wedge the writer: the send gives up after
/// the endpoint timeout and disconnect still completes.
#[tokio::test]
async fn stalled_peer_bounds_send_and_disconnect() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let ep = endpoint(port).with_timeout(Duration::from_millis(500));
    let handler = create_handler(&ep, &HandlerOptions::new()).unwrap();
    handler.connect().await.unwrap();

    let big = "x".repeat(12 * 1024 * 1024);
    let msg = CrossSystemMessage::new("big", "svc-a", "svc-b", MessageType::Event)
        .with_payload(serde_json::json!({ "blob": big }));
    let sent = tokio::time::timeout(Duration::from_secs(5), handler.send_message(&msg))
        .await
        .expect("send was not bounded");
    assert!(matches!(sent, Err(CommError::Send { .. })));
    assert!(!handler.is_connected());

    tokio::time::timeout(Duration::from_secs(3), handler.disconnect())
        .await
        .expect("disconnect hung")
        .unwrap();
    assert_eq!(handler.state(), ConnectionState::Disconnected);
    assert_eq!(handler.metrics().active_connections, 0);
}

/// Dropping a connected handler without disconnecting still closes the socket.
#[tokio::test]
async fn dropped_handler_closes_socket() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), socket.read_to_end(&mut buf))
            .await
            .is_ok()
    });

    let handler = create_handler(&endpoint(port), &HandlerOptions::new()).unwrap();
    handler.connect().await.unwrap();
    drop(handler);

    assert!(server.await.unwrap(), "peer never saw EOF");
}
