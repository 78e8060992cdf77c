use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use xcomm_transport::framing::{read_message, write_message};
use xcomm_transport::{CommError, MessageType};

/// Listen on `bind:port` until Ctrl+C.
pub async fn run(bind: &str, port: u16, max_frame_size: usize) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind, port)).await?;
    eprintln!("xcomm echo v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Listening on {}", listener.local_addr()?);
    eprintln!("Press Ctrl+C to stop.\n");

    tokio::select! {
        result = serve(listener, max_frame_size) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nCtrl+C received, shutting down...");
            Ok(())
        }
    }
}

/// Accept loop; one task per connection.
pub async fn serve(listener: TcpListener, max_frame_size: usize) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        info!("echo: connection from {peer}");
        tokio::spawn(async move {
            let answered = answer(socket, &peer.to_string(), max_frame_size).await;
            info!("echo: {peer} went away after {answered} replies");
        });
    }
}

/// Answer every inbound envelope with a RESPONSE echoing its payload.
/// Replies and errors are not answered, so two responders cannot ping-pong.
async fn answer(mut socket: TcpStream, peer: &str, max_frame_size: usize) -> u64 {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("echo: set_nodelay for {peer} failed: {e}");
    }
    let mut answered = 0;
    loop {
        let request = match read_message(&mut socket, max_frame_size, peer).await {
            Ok(msg) => msg,
            Err(CommError::Deserialization(e)) => {
                warn!("echo: undecodable frame from {peer}: {e}");
                continue;
            }
            Err(e) => {
                debug!("echo: read from {peer} stopped: {e}");
                return answered;
            }
        };
        if matches!(request.message_type, MessageType::Response | MessageType::Error) {
            continue;
        }

        let reply = request.reply_to_message(serde_json::json!({
            "echo": request.payload,
            "message_type": request.message_type,
        }));
        if let Err(e) = write_message(&mut socket, &reply, max_frame_size, peer).await {
            warn!("echo: reply to {peer} failed: {e}");
            return answered;
        }
        answered += 1;
    }
}
