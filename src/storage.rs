//! Piece storage
//!
//! The disk boundary of the exchange core. Completed, verified pieces go
//! through [`PieceStore::write_piece`]; upload serving reads whole pieces
//! back through [`PieceStore::read_piece`]. Implementations must be safe
//! to call from concurrent peer tasks.

use crate::error::{Result, StorageErrorKind, SwarmError};
use crate::metainfo::TorrentInfo;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Storage trait for piece data
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Read one complete piece
    async fn read_piece(&self, index: u32) -> Result<Bytes>;

    /// Write one complete, verified piece
    async fn write_piece(&self, index: u32, data: Bytes) -> Result<()>;
}

/// In-memory piece store for tests and memory-backed seeding
#[derive(Debug)]
pub struct MemoryStore {
    pieces: parking_lot::Mutex<Vec<Option<Bytes>>>,
}

impl MemoryStore {
    /// Create an empty store for `piece_count` pieces
    pub fn new(piece_count: u32) -> Self {
        Self {
            pieces: parking_lot::Mutex::new(vec![None; piece_count as usize]),
        }
    }

    /// Create a store pre-filled from a flat payload, split per the
    /// torrent's piece geometry. Useful for seeding in tests.
    pub fn from_payload(info: &TorrentInfo, payload: &[u8]) -> Result<Self> {
        if payload.len() as u64 != info.total_size() {
            return Err(SwarmError::invalid_input(
                "payload",
                format!(
                    "Payload is {} bytes but torrent is {} bytes",
                    payload.len(),
                    info.total_size()
                ),
            ));
        }

        let pieces = (0..info.piece_count())
            .map(|index| {
                let start = info.piece_offset(index) as usize;
                let end = start + info.piece_len(index) as usize;
                Some(Bytes::copy_from_slice(&payload[start..end]))
            })
            .collect();

        Ok(Self {
            pieces: parking_lot::Mutex::new(pieces),
        })
    }

    /// Number of pieces currently held
    pub fn stored_count(&self) -> usize {
        self.pieces.lock().iter().filter(|p| p.is_some()).count()
    }
}

#[async_trait]
impl PieceStore for MemoryStore {
    async fn read_piece(&self, index: u32) -> Result<Bytes> {
        self.pieces
            .lock()
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                SwarmError::storage(
                    StorageErrorKind::NotFound,
                    format!("Piece {} not stored", index),
                )
            })
    }

    async fn write_piece(&self, index: u32, data: Bytes) -> Result<()> {
        let mut pieces = self.pieces.lock();
        let slot = pieces.get_mut(index as usize).ok_or_else(|| {
            SwarmError::storage(
                StorageErrorKind::NotFound,
                format!("Piece {} out of range", index),
            )
        })?;
        *slot = Some(data);
        Ok(())
    }
}

/// Flat-file piece store: one backing file, piece bytes at
/// `index * piece_length`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    info: Arc<TorrentInfo>,
}

impl FileStore {
    /// Create a store backed by `path`. The file is created lazily on
    /// the first write.
    pub fn new(path: impl Into<PathBuf>, info: Arc<TorrentInfo>) -> Self {
        Self {
            path: path.into(),
            info,
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn io_error(err: std::io::Error) -> SwarmError {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        SwarmError::storage(kind, err.to_string())
    }
}

#[async_trait]
impl PieceStore for FileStore {
    async fn read_piece(&self, index: u32) -> Result<Bytes> {
        if index >= self.info.piece_count() {
            return Err(SwarmError::storage(
                StorageErrorKind::NotFound,
                format!("Piece {} out of range", index),
            ));
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(Self::io_error)?;
        file.seek(std::io::SeekFrom::Start(self.info.piece_offset(index)))
            .await
            .map_err(Self::io_error)?;

        let mut buf = vec![0u8; self.info.piece_len(index) as usize];
        file.read_exact(&mut buf).await.map_err(Self::io_error)?;
        Ok(Bytes::from(buf))
    }

    async fn write_piece(&self, index: u32, data: Bytes) -> Result<()> {
        if index >= self.info.piece_count() {
            return Err(SwarmError::storage(
                StorageErrorKind::NotFound,
                format!("Piece {} out of range", index),
            ));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(Self::io_error)?;
        file.seek(std::io::SeekFrom::Start(self.info.piece_offset(index)))
            .await
            .map_err(Self::io_error)?;
        file.write_all(&data).await.map_err(Self::io_error)?;
        file.flush().await.map_err(Self::io_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(piece_length: u32, total: u64) -> TorrentInfo {
        let count = total.div_ceil(piece_length as u64) as usize;
        let hashes = (0..count).map(|i| [i as u8; 20]).collect();
        TorrentInfo::new([7u8; 20], hashes, piece_length, total).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new(4);
        store
            .write_piece(2, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let data = store.read_piece(2).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(store.stored_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_missing_piece() {
        let store = MemoryStore::new(4);
        let err = store.read_piece(0).await.unwrap_err();
        assert!(matches!(err, SwarmError::Storage { .. }));
    }

    #[tokio::test]
    async fn test_memory_store_from_payload() {
        let info = test_info(8, 20);
        let payload: Vec<u8> = (0..20).collect();
        let store = MemoryStore::from_payload(&info, &payload).unwrap();

        assert_eq!(store.stored_count(), 3);
        assert_eq!(&store.read_piece(0).await.unwrap()[..], &payload[0..8]);
        // short final piece
        assert_eq!(&store.read_piece(2).await.unwrap()[..], &payload[16..20]);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let info = Arc::new(test_info(8, 20));
        let store = FileStore::new(dir.path().join("payload.bin"), info);

        store
            .write_piece(1, Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .await
            .unwrap();
        store
            .write_piece(2, Bytes::from_static(&[9, 9, 9, 9]))
            .await
            .unwrap();

        assert_eq!(
            &store.read_piece(1).await.unwrap()[..],
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(&store.read_piece(2).await.unwrap()[..], &[9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let info = Arc::new(test_info(8, 20));
        let store = FileStore::new(dir.path().join("absent.bin"), info);

        let err = store.read_piece(0).await.unwrap_err();
        assert!(matches!(
            err,
            SwarmError::Storage {
                kind: StorageErrorKind::NotFound,
                ..
            }
        ));
    }
}
