//! Drains the inbound queue into the manager's message listeners.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use xcomm_transport::{now_ms, CrossSystemMessage, Listeners};

use crate::manager::MessageListener;

/// Deliver queued messages in arrival order until cancelled. Expired
/// messages are dropped. Returns the receiver so a later start can reuse it.
pub(crate) async fn run(
    mut rx: mpsc::Receiver<CrossSystemMessage>,
    listeners: Arc<Listeners<MessageListener>>,
    cancel: CancellationToken,
) -> mpsc::Receiver<CrossSystemMessage> {
    tracing::debug!("message processor running");
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if msg.is_expired(now_ms()) {
            tracing::debug!("dropping expired {} from {}", msg.message_id, msg.source_system);
            continue;
        }
        tracing::debug!(
            "processing {} {} from {}",
            msg.message_type,
            msg.message_id,
            msg.source_system
        );
        listeners.notify_with("message", |cb| cb(&msg));
    }
    tracing::debug!("message processor stopped");
    rx
}
