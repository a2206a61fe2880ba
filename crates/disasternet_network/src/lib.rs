//! DisasterNet Network: infrastructure-free peer-to-peer messaging.
//!
//! Peers on the same LAN find each other, establish mutually authenticated
//! encrypted connections, and flood topic-scoped messages to one another
//! without any central server.
//!
//! # Architecture
//!
//! - **Identity**: Ed25519 keypair per process; the peer id is the SHA-256
//!   of the public key.
//! - **Link**: framed bytes over TCP or WebSocket (via `tokio-tungstenite`).
//! - **Secure channel**: X25519 handshake signed by both identities, then
//!   AES-256-GCM frames.
//! - **Multiplexer**: credit flow-controlled logical streams per connection.
//! - **Discovery**: UDP broadcast on the LAN, scoped by a service tag.
//! - **Router**: topic subscriptions and flood propagation with duplicate
//!   suppression.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use disasternet_network::{MeshNode, NetworkConfig, NodeIdentity};
//!
//! # async fn example() {
//! let mut node = MeshNode::new(NodeIdentity::generate(), NetworkConfig::default());
//!
//! node.start().await.unwrap();
//! let (_sub, mut rx) = node.router().subscribe_channel("news");
//! node.router().publish("news", b"hello".to_vec()).unwrap();
//! assert_eq!(rx.recv().await.unwrap().data, b"hello");
//! node.stop().await;
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod link;
pub mod message;
pub mod mux;
pub mod node;
pub mod peer;
pub mod router;
pub mod secure;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use error::{DecodeError, DialError, HandshakeError, MuxError, NetworkError, PublishError};
pub use identity::{NodeIdentity, PeerId};
pub use message::{GossipMessage, MessageId};
pub use node::MeshNode;
pub use peer::{PeerAddr, PeerRecord, PeerRegistry, PeerState};
pub use router::{GossipRouter, MessageHandler, SubscriptionId};
