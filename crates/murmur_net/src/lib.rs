//! Murmur Net: decentralized group messaging on the local network.
//!
//! Nodes find each other with UDP broadcast beacons, open a reliable link to
//! every peer they discover, and exchange membership and payloads without a
//! central server. The application sees one ordered stream of events.
//!
//! # Architecture
//!
//! - **Beacons**: 22-byte UDP broadcasts announcing a node's uuid and mailbox
//!   port.
//! - **Transport**: one WebSocket (via `tokio-tungstenite`) per direction
//!   between each pair of peers, carrying JSON envelopes.
//! - **Engine**: a pure state machine over peers and groups that turns
//!   beacons, frames, ticks and commands into actions.
//! - **Node**: the async event loop executing those actions, and the public
//!   API on top of it.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use murmur_net::{Event, Node, NodeConfig};
//!
//! # async fn example() -> Result<(), murmur_net::NetworkError> {
//! let mut node = Node::new(NodeConfig {
//!     name: Some("alice".into()),
//!     ..NodeConfig::default()
//! });
//! node.set_header("X-ROLE", "chat")?;
//! node.start().await?;
//! node.join("CHAT").await?;
//!
//! while let Some(event) = node.recv().await {
//!     if let Event::Shout { name, payload, .. } = &event {
//!         println!("{name}: {}", String::from_utf8_lossy(payload));
//!     }
//! }
//! node.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod beacon;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod group;
pub mod identity;
pub mod logging;
pub mod message;
pub mod node;
pub mod peer;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NodeConfig;
pub use error::NetworkError;
pub use event::{Event, EventKind};
pub use identity::{NodeIdentity, PeerId};
pub use message::{Envelope, Message};
pub use node::{Node, NodeHandle};
pub use peer::{PeerInfo, PeerStatus};
