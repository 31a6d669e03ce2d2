//! Swarm configuration
//!
//! This module contains all tunables for the exchange core. Reference
//! values follow the wire protocol conventions: 16 KiB request slices,
//! four outstanding requests per peer, 1400-byte upload chunks.

use crate::error::{Result, SwarmError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Swarm`](crate::Swarm)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Maximum concurrent peer sessions
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Request unit: bytes asked for per `request` message.
    /// 16 KiB is the de-facto protocol standard.
    #[serde(default = "default_slice_size")]
    pub slice_size: u32,

    /// Maximum slice requests kept in flight per connection
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,

    /// Deadline for the connect/handshake/bitfield phases, in seconds.
    /// Firing before the session reaches its steady state is fatal.
    #[serde(default = "default_establish_timeout_secs")]
    pub establish_timeout_secs: u64,

    /// Floor between keepalive frames on an idle connection, in seconds
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Upper bound on a non-piece frame's declared length, in bytes.
    /// Anything larger is a protocol error. Must leave room for the
    /// bitfield of the largest torrent the embedder expects to serve.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Largest `request` length honored from a peer, in bytes
    #[serde(default = "default_max_request_len")]
    pub max_request_len: u32,

    /// Bytes per write when streaming a piece payload to a peer
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,

    /// Unchoke peers as soon as they declare interest. Disable if the
    /// embedder drives choking itself.
    #[serde(default = "default_true")]
    pub auto_unchoke: bool,
}

fn default_max_peers() -> usize {
    50
}

fn default_slice_size() -> u32 {
    16 * 1024
}

fn default_pipeline_depth() -> usize {
    4
}

fn default_establish_timeout_secs() -> u64 {
    6
}

fn default_keepalive_interval_secs() -> u64 {
    60
}

fn default_max_frame_len() -> usize {
    256 * 1024
}

fn default_max_request_len() -> u32 {
    128 * 1024
}

fn default_upload_chunk_bytes() -> usize {
    1400
}

fn default_true() -> bool {
    true
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_peers: default_max_peers(),
            slice_size: default_slice_size(),
            pipeline_depth: default_pipeline_depth(),
            establish_timeout_secs: default_establish_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            max_frame_len: default_max_frame_len(),
            max_request_len: default_max_request_len(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            auto_unchoke: true,
        }
    }
}

impl SwarmConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request unit size
    pub fn slice_size(mut self, bytes: u32) -> Self {
        self.slice_size = bytes;
        self
    }

    /// Set the per-connection request pipeline depth
    pub fn pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Set the maximum concurrent peer sessions
    pub fn max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }

    /// Set the pre-steady-state deadline
    pub fn establish_timeout_secs(mut self, secs: u64) -> Self {
        self.establish_timeout_secs = secs;
        self
    }

    /// Set the keepalive floor
    pub fn keepalive_interval_secs(mut self, secs: u64) -> Self {
        self.keepalive_interval_secs = secs;
        self
    }

    /// Set the upload chunk size
    pub fn upload_chunk_bytes(mut self, bytes: usize) -> Self {
        self.upload_chunk_bytes = bytes;
        self
    }

    /// Set whether interested peers are unchoked automatically
    pub fn auto_unchoke(mut self, enabled: bool) -> Self {
        self.auto_unchoke = enabled;
        self
    }

    /// Deadline for the connect/handshake/bitfield phases
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_secs(self.establish_timeout_secs)
    }

    /// Floor between keepalive frames
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(SwarmError::invalid_input("max_peers", "Must be at least 1"));
        }

        if self.slice_size == 0 {
            return Err(SwarmError::invalid_input(
                "slice_size",
                "Must be at least 1 byte",
            ));
        }

        if self.slice_size > self.max_request_len {
            return Err(SwarmError::invalid_input(
                "slice_size",
                "Must not exceed max_request_len",
            ));
        }

        if self.pipeline_depth == 0 {
            return Err(SwarmError::invalid_input(
                "pipeline_depth",
                "Must be at least 1",
            ));
        }

        if self.establish_timeout_secs == 0 {
            return Err(SwarmError::invalid_input(
                "establish_timeout_secs",
                "Must be at least 1 second",
            ));
        }

        if self.keepalive_interval_secs == 0 {
            return Err(SwarmError::invalid_input(
                "keepalive_interval_secs",
                "Must be at least 1 second",
            ));
        }

        if self.upload_chunk_bytes == 0 {
            return Err(SwarmError::invalid_input(
                "upload_chunk_bytes",
                "Must be at least 1 byte",
            ));
        }

        Ok(())
    }
}
