//! # peerwire
//!
//! Data-exchange core for the BitTorrent peer wire protocol. Given one
//! torrent's metadata, a piece store, and peer addresses, a [`Swarm`]
//! downloads missing pieces, verifies them against their expected
//! digests, and serves held pieces back to the swarm.
//!
//! Discovery is out of scope: trackers, DHT, and peer exchange are the
//! embedder's concern. Hand the swarm addresses (or accepted sockets)
//! and it does the rest.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::{FileStore, Swarm, SwarmConfig, SwarmEvent, TorrentInfo};
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let info: TorrentInfo = todo!("parse torrent metadata");
//!     let store = Arc::new(FileStore::new("download.bin", Arc::new(info.clone())));
//!     let swarm = Swarm::new(info, store, SwarmConfig::default())?;
//!
//!     // Pick up pieces left behind by an earlier run
//!     swarm.verify_existing().await?;
//!
//!     let mut events = swarm.subscribe();
//!     swarm.connect("198.51.100.7:6881".parse().unwrap())?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SwarmEvent::PieceCompleted { index } => println!("piece {} done", index),
//!             SwarmEvent::DownloadComplete => break,
//!             _ => {}
//!         }
//!     }
//!     swarm.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metainfo;
pub mod storage;
pub mod swarm;
pub mod wire;

// Core API
pub use config::SwarmConfig;
pub use error::{NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind, SwarmError};
pub use metainfo::{Sha1Hash, TorrentInfo};
pub use storage::{FileStore, MemoryStore, PieceStore};
pub use swarm::{SessionId, Swarm, SwarmEvent, SwarmStats};

// Wire types, for embedders speaking the protocol directly
pub use wire::{Frame, Handshake, Message, WireDecoder};
