//! Cross-system communication manager.
//!
//! Owns the endpoint registry, builds the protocol-appropriate handler per
//! endpoint, routes outbound messages, fans inbound messages into one queue,
//! probes endpoint health in the background, and aggregates metrics across
//! handlers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use xcomm_manager::{CommunicationManager, ManagerConfig};
//! use xcomm_transport::{CrossSystemMessage, MessageType, Protocol, SystemEndpoint};
//!
//! # async fn example() {
//! let manager = CommunicationManager::new(ManagerConfig::new());
//! manager.on_message(|msg| println!("{} from {}", msg.message_type, msg.source_system));
//! manager.start();
//!
//! manager.add_endpoint(SystemEndpoint::new("svc-a", "Service A", Protocol::Http, "localhost", 8001));
//! if manager.connect_system("svc-a").await {
//!     let msg = CrossSystemMessage::new("m-1", "me", "svc-a", MessageType::Request)
//!         .with_payload(serde_json::json!({"k": "v"}));
//!     let delivered = manager.send_message(&msg).await;
//!     println!("delivered: {delivered}");
//! }
//!
//! println!("{:?}", manager.get_metrics());
//! manager.stop().await;
//! # }
//! ```

mod config;
mod health;
mod manager;
mod processor;
mod status;

pub use config::{ManagerConfig, DEFAULT_HEALTH_CHECK_TICK};
pub use manager::CommunicationManager;
pub use status::{ManagerStatus, SystemStateChange, SystemStatus};
