//! Upload serving
//!
//! Granted `request` messages queue up FIFO per connection. Serving the
//! head lazily reads the whole piece from the store and keeps it cached
//! until a request for a different piece comes up, then writes the piece
//! frame header followed by the payload in MTU-sized chunks so no single
//! write monopolizes the connection.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::Result;
use crate::storage::PieceStore;
use crate::wire::piece_header;

use super::slices::Slice;

/// Outbound request queue and piece cache for one connection
#[derive(Debug)]
pub struct UploadPipeline {
    queue: VecDeque<Slice>,
    cached: Option<(u32, Bytes)>,
    chunk_bytes: usize,
}

impl UploadPipeline {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            cached: None,
            chunk_bytes,
        }
    }

    /// Queue a granted request
    pub fn enqueue(&mut self, slice: Slice) {
        self.queue.push_back(slice);
    }

    /// Drop a queued request matching the cancel message exactly. A
    /// request already served is gone from the queue, so the cancel is
    /// simply too late.
    pub fn cancel(&mut self, index: u32, begin: u32, length: u32) {
        self.queue.retain(|s| {
            !(s.index == index && s.begin == begin && s.length == length)
        });
    }

    /// Drop every queued request. Used when we choke the peer and on
    /// teardown.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.cached = None;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Serve the head of the queue: one piece frame, header first, then
    /// the payload chunk by chunk. Returns the payload bytes written, or
    /// `None` when the queue is empty. A request whose piece cannot be
    /// read is logged and dropped rather than failing the connection.
    pub async fn serve_next<W>(&mut self, writer: &mut W, store: &dyn PieceStore) -> Result<Option<u64>>
    where
        W: AsyncWrite + Unpin,
    {
        let (slice, piece) = loop {
            let Some(slice) = self.queue.pop_front() else {
                return Ok(None);
            };
            if let Some(piece) = self.piece_bytes(slice, store).await {
                break (slice, piece);
            }
        };

        let payload = piece.slice(slice.begin as usize..(slice.begin + slice.length) as usize);
        writer
            .write_all(&piece_header(slice.index, slice.begin, slice.length))
            .await?;
        for chunk in payload.chunks(self.chunk_bytes) {
            writer.write_all(chunk).await?;
        }

        Ok(Some(slice.length as u64))
    }

    /// Fetch the piece backing `slice`, reusing the cache when the index
    /// matches. Returns `None` if the request cannot be satisfied.
    async fn piece_bytes(&mut self, slice: Slice, store: &dyn PieceStore) -> Option<Bytes> {
        match &self.cached {
            Some((index, piece)) if *index == slice.index => {
                return Some(piece.clone());
            }
            _ => {}
        }

        let piece = match store.read_piece(slice.index).await {
            Ok(piece) => piece,
            Err(err) => {
                warn!(piece = slice.index, error = %err, "Dropping request; piece read failed");
                return None;
            }
        };
        if (slice.begin + slice.length) as usize > piece.len() {
            warn!(
                piece = slice.index,
                begin = slice.begin,
                length = slice.length,
                "Dropping request beyond piece end"
            );
            return None;
        }

        self.cached = Some((slice.index, piece.clone()));
        Some(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::TorrentInfo;
    use crate::storage::MemoryStore;
    use crate::wire::Message;
    use async_trait::async_trait;
    use sha1::{Digest, Sha1};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    /// AsyncWrite sink that records the size of every write call
    #[derive(Default)]
    struct RecordingWriter {
        data: Vec<u8>,
        writes: Vec<usize>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.data.extend_from_slice(buf);
            self.writes.push(buf.len());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct CountingStore {
        inner: MemoryStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl PieceStore for CountingStore {
        async fn read_piece(&self, index: u32) -> Result<Bytes> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.read_piece(index).await
        }

        async fn write_piece(&self, index: u32, data: Bytes) -> Result<()> {
            self.inner.write_piece(index, data).await
        }
    }

    fn store_with_piece(index: u32, data: &[u8]) -> MemoryStore {
        let hash: [u8; 20] = Sha1::digest(data).into();
        let info = TorrentInfo::new(
            [0u8; 20],
            vec![hash; (index + 1) as usize],
            data.len() as u32,
            (index as u64 + 1) * data.len() as u64,
        )
        .unwrap();
        let store = MemoryStore::new(info.piece_count());
        futures::executor::block_on(store.write_piece(index, Bytes::copy_from_slice(data)))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_serves_exact_piece_frame() {
        let data = vec![0x5a; 64];
        let store = store_with_piece(0, &data);
        let mut pipeline = UploadPipeline::new(1400);
        pipeline.enqueue(Slice { index: 0, begin: 16, length: 32 });

        let mut writer = RecordingWriter::default();
        let served = pipeline.serve_next(&mut writer, &store).await.unwrap();
        assert_eq!(served, Some(32));

        let expected = Message::Piece {
            index: 0,
            begin: 16,
            data: Bytes::copy_from_slice(&data[16..48]),
        }
        .encode();
        assert_eq!(writer.data, expected);
    }

    #[tokio::test]
    async fn test_payload_streams_in_mtu_chunks() {
        let data = vec![7u8; 4000];
        let store = store_with_piece(0, &data);
        let mut pipeline = UploadPipeline::new(1400);
        pipeline.enqueue(Slice { index: 0, begin: 0, length: 4000 });

        let mut writer = RecordingWriter::default();
        pipeline.serve_next(&mut writer, &store).await.unwrap();

        // 13-byte header, then 1400 + 1400 + 1200
        assert_eq!(writer.writes, vec![13, 1400, 1400, 1200]);
    }

    #[tokio::test]
    async fn test_piece_cache_spans_requests() {
        let data = vec![1u8; 64];
        let store = CountingStore {
            inner: store_with_piece(0, &data),
            reads: AtomicUsize::new(0),
        };
        let mut pipeline = UploadPipeline::new(1400);
        pipeline.enqueue(Slice { index: 0, begin: 0, length: 32 });
        pipeline.enqueue(Slice { index: 0, begin: 32, length: 32 });

        let mut writer = RecordingWriter::default();
        pipeline.serve_next(&mut writer, &store).await.unwrap();
        pipeline.serve_next(&mut writer, &store).await.unwrap();

        assert_eq!(store.reads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unreadable_piece_drops_request_and_continues() {
        let data = vec![2u8; 64];
        let store = store_with_piece(1, &data);
        let mut pipeline = UploadPipeline::new(1400);
        // Piece 0 was never written to the store
        pipeline.enqueue(Slice { index: 0, begin: 0, length: 16 });
        pipeline.enqueue(Slice { index: 1, begin: 0, length: 16 });

        let mut writer = RecordingWriter::default();
        let served = pipeline.serve_next(&mut writer, &store).await.unwrap();
        assert_eq!(served, Some(16));
        assert_eq!(writer.data[5..9], 1u32.to_be_bytes());
        assert!(pipeline.is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue_serves_nothing() {
        let store = MemoryStore::new(1);
        let mut pipeline = UploadPipeline::new(1400);
        let mut writer = RecordingWriter::default();
        assert_eq!(pipeline.serve_next(&mut writer, &store).await.unwrap(), None);
    }

    #[test]
    fn test_cancel_removes_exact_match_only() {
        let mut pipeline = UploadPipeline::new(1400);
        pipeline.enqueue(Slice { index: 0, begin: 0, length: 16 });
        pipeline.enqueue(Slice { index: 0, begin: 16, length: 16 });

        pipeline.cancel(0, 16, 16);
        assert!(!pipeline.is_empty());
        pipeline.cancel(0, 0, 8);
        assert!(!pipeline.is_empty());
        pipeline.cancel(0, 0, 16);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_clear_flushes_queue() {
        let mut pipeline = UploadPipeline::new(1400);
        pipeline.enqueue(Slice { index: 0, begin: 0, length: 16 });
        pipeline.clear();
        assert!(pipeline.is_empty());
    }
}
