//! # State Sync - Shared JSON State with Live Fan-out
//!
//! Lets independent front-end clients share a small set of named, opaque JSON
//! state blobs through an always-on server.
//!
//! ## Features
//!
//! - **Durable per-domain store**: one record per domain, replaced atomically (temp file + rename)
//! - **Broadcast hub**: every committed write is pushed to all connected WebSocket subscribers
//! - **Reconnecting client**: fixed-delay reconnect loop, refetch on connect, local fallback cache
//! - **Last-write-wins**: payloads are whole snapshots, never merged or interpreted
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use state_sync::{ClientConfig, SyncClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new("http://localhost:3000", ".state-cache")?
//!         .with_domains(["quantum"]);
//!     let client = SyncClient::new(config)?;
//!     client.start();
//!
//!     client.save("quantum", json!({ "level": 0.5 })).await?;
//!
//!     let mut updates = client.updates();
//!     while let Ok(event) = updates.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export main types for library consumers
pub use client::{ClientEvent, ConnectionState, Loaded, SaveOutcome, Source, SyncClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ErrorCategory, SyncError, SyncResult};
pub use storage::{StateRecord, StateStore};
pub use sync::{BroadcastHub, PushEvent, Subscription};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
