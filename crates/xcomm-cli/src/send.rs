use std::time::Duration;

use anyhow::bail;
use xcomm_manager::{CommunicationManager, ManagerConfig};
use xcomm_transport::{CrossSystemMessage, MessagePriority, MessageType, SystemEndpoint};

use crate::output::emit;

pub struct SendConfig {
    pub target: String,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    pub source: String,
    pub wait_ms: u64,
}

/// Send one message with the endpoint's retry budget, then print whatever
/// comes back within the wait window.
pub async fn run(endpoints: Vec<SystemEndpoint>, config: SendConfig) -> anyhow::Result<()> {
    let manager = CommunicationManager::new(ManagerConfig::new());
    for endpoint in endpoints {
        manager.add_endpoint(endpoint);
    }
    if manager.endpoint(&config.target).is_none() {
        bail!("no endpoint registered as {:?}", config.target);
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.on_message(move |msg| {
        let _ = tx.send(msg.clone());
    });
    manager.on_error(|id, err| eprintln!("{id}: {err}"));
    manager.start();

    if !manager.connect_system(&config.target).await {
        manager.stop().await;
        bail!("could not connect to {}", config.target);
    }

    let mut msg = CrossSystemMessage::new(
        uuid::Uuid::new_v4().to_string(),
        config.source,
        config.target.as_str(),
        config.message_type,
    )
    .with_priority(config.priority)
    .with_payload(config.payload);
    let delivered = manager.send_with_retry(&mut msg).await;
    eprintln!(
        "message {} {} after {} retries",
        msg.message_id,
        if delivered { "delivered" } else { "failed" },
        msg.retry_count
    );

    let deadline = tokio::time::sleep(Duration::from_millis(config.wait_ms));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            reply = rx.recv() => match reply {
                Some(reply) => emit(&reply)?,
                None => break,
            },
        }
    }

    manager.stop().await;
    if !delivered {
        bail!("message to {} was not delivered", config.target);
    }
    Ok(())
}
