//! # courier-core
//!
//! Session handling and message routing for the Courier IM server.
//!
//! This crate provides:
//!
//! - **Session** - Reader and writer tasks around one connection
//! - **Client** - The shared handle the router hands out
//! - **Router** - Local sessions and remote peers by uid
//! - **Cluster** - Which users this node serves
//! - **Storage** - Offline message queues
//! - **Group** - Group membership
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│   Session   │────▶│   Router    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │         │              │
//!                       ▼         ▼              ▼
//!               ┌───────────┐ ┌─────────┐ ┌─────────────┐
//!               │  Offline  │ │ Cluster │ │ Client/Peer │
//!               │   Store   │ └─────────┘ │  mailboxes  │
//!               └───────────┘             └─────────────┘
//! ```

pub mod client;
pub mod cluster;
pub mod group;
pub mod router;
pub mod session;
pub mod storage;
pub mod unacked;

pub use client::{Client, Mailbox, SessionState};
pub use cluster::{Cluster, ClusterRegistry, PeerClient, PeerId};
pub use group::{Group, GroupDirectory, GroupManager};
pub use router::{Route, Router, RouterStats};
pub use session::{Session, SessionConfig, SessionContext, DEFAULT_IDLE_TIMEOUT};
pub use storage::{MemoryStore, OfflineStore, StoreError};
pub use unacked::UnackedList;
