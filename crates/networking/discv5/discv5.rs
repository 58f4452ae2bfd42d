//! Node Discovery v5 (discv5) protocol stack.
//!
//! The crate implements the discovery wire protocol over UDP: an
//! authenticated handshake yielding AES-128-GCM session keys, the encrypted
//! packet codec, per-peer session state machines, a request/response
//! dispatcher with correlated identifiers, a Kademlia routing table with its
//! maintenance services, and self-endpoint discovery via peer voting.
//!
//! The components run as `spawned_concurrency` GenServers wired into a DAG
//! of channels by [`net::Discv5Service::spawn`]:
//!
//! ```text
//! UDP socket ─> packet codec ─> packer supervisor ─> per-peer packers
//!                                                        │
//!                                  message dispatcher <──┘
//!                                    │           │
//!                  routing table manager ─> endpoint tracker
//! ```
//!
//! Outbound traffic traverses the reverse path, with the per-peer packer
//! synthesizing the packet variant appropriate for the peer's current
//! handshake state.

mod base64;
pub mod cipher;
pub mod codec;
pub mod dispatcher;
pub mod enr_store;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod messages;
pub mod net;
pub mod packer;
pub mod packet;
pub mod scheme;
pub mod sender;
pub mod supervisor;
pub mod table;
pub mod tracker;
pub mod types;

pub use error::DiscoveryError;
pub use net::{Discv5Config, Discv5Service};
pub use scheme::{IdentitySchemeRegistry, SessionKeys};
pub use types::{Endpoint, Enr};
