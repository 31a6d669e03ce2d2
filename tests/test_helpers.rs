//! Test Helpers
//!
//! Builders and polling helpers shared by the integration tests.

use std::time::Duration;

use peerwire::{Sha1Hash, SwarmEvent, TorrentInfo};
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

/// Install a log subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Generate a random info hash for testing
pub fn random_info_hash() -> [u8; 20] {
    let mut hash = [0u8; 20];
    for byte in &mut hash {
        *byte = rand::random();
    }
    hash
}

/// Build a torrent of `total` bytes with a deterministic payload and
/// matching per-piece digests.
pub fn build_torrent(piece_length: u32, total: usize) -> (TorrentInfo, Vec<u8>) {
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let hashes: Vec<Sha1Hash> = payload
        .chunks(piece_length as usize)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect();
    let info = TorrentInfo::new(random_info_hash(), hashes, piece_length, total as u64)
        .expect("valid torrent geometry");
    (info, payload)
}

/// Poll `condition` every 25ms until it holds or `timeout` elapses
pub async fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// Wait for the first event matching `accept`, discarding others
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<SwarmEvent>,
    timeout: Duration,
    mut accept: impl FnMut(&SwarmEvent) -> bool,
) -> Option<SwarmEvent> {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if accept(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return std::future::pending().await;
                }
            }
        }
    })
    .await
    .ok()
}

/// Read one framed message from a raw stream, skipping keepalives.
/// Returns the message id and the payload after it.
pub async fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    loop {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.expect("message length");
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.expect("message body");
        return (body[0], body[1..].to_vec());
    }
}
