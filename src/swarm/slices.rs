//! Slice scheduling and piece reassembly
//!
//! One [`SliceScheduler`] drives the download of a single piece over a
//! single connection. The piece is split into fixed-size request slices
//! (16 KiB reference unit, short final slice). Slices move from a wait
//! queue into a bounded in-flight pipeline, and their payload bytes are
//! appended to a gapless assembly buffer. Because an inbound piece frame
//! must match the in-flight head exactly, the buffer is contiguous from
//! offset 0 by construction.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{ProtocolErrorKind, Result, SwarmError};

/// One outstanding block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Gapless, slice-aligned prefix of a piece downloaded by a lost
/// connection, preserved so another session can resume instead of
/// starting over.
#[derive(Debug, Default)]
pub struct PieceAssembly {
    bytes: BytesMut,
}

impl PieceAssembly {
    pub(crate) fn from_bytes(bytes: BytesMut) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn into_inner(self) -> BytesMut {
        self.bytes
    }
}

/// Effect of one payload chunk on the download
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkProgress {
    /// The head slice is still incomplete
    Partial,

    /// The head slice finished; more slices remain
    SliceDone,

    /// Every slice arrived; the full piece is ready for verification
    PieceDone(Bytes),
}

/// What to do with the piece when its connection is lost
#[derive(Debug)]
pub enum LossOutcome {
    /// Slice-aligned prefix downloaded; park it for resumption
    Park(PieceAssembly),

    /// Nothing downloaded; return the index to idle
    Release,

    /// A slice was cut off mid-transfer. The buffers cannot be resumed
    /// and must be dropped; the index returns to idle.
    Discard,
}

/// Per-piece download driver: wait queue, bounded in-flight pipeline,
/// and the assembly buffer.
#[derive(Debug)]
pub struct SliceScheduler {
    index: u32,
    piece_len: u32,
    wait: VecDeque<Slice>,
    in_flight: VecDeque<Slice>,
    pipeline_depth: usize,
    assembled: BytesMut,
    head_received: u32,
    streaming: bool,
}

impl SliceScheduler {
    /// Start a fresh download of `index`
    pub fn new(index: u32, piece_len: u32, slice_size: u32, pipeline_depth: usize) -> Self {
        Self {
            index,
            piece_len,
            wait: build_wait_queue(index, piece_len, slice_size, 0),
            in_flight: VecDeque::new(),
            pipeline_depth,
            assembled: BytesMut::with_capacity(piece_len as usize),
            head_received: 0,
            streaming: false,
        }
    }

    /// Resume a parked download. The assembly is slice-aligned, so the
    /// wait queue picks up at its end.
    pub fn resume(
        index: u32,
        piece_len: u32,
        slice_size: u32,
        pipeline_depth: usize,
        assembly: PieceAssembly,
    ) -> Self {
        debug_assert!(assembly.len() < piece_len as usize);
        debug_assert_eq!(assembly.len() % slice_size as usize, 0);
        let from = assembly.len() as u32;
        let mut assembled = assembly.into_inner();
        assembled.reserve(piece_len as usize - assembled.len());
        Self {
            index,
            piece_len,
            wait: build_wait_queue(index, piece_len, slice_size, from),
            in_flight: VecDeque::new(),
            pipeline_depth,
            assembled,
            head_received: 0,
            streaming: false,
        }
    }

    /// Piece index this scheduler is downloading
    pub fn piece_index(&self) -> u32 {
        self.index
    }

    /// Number of requests awaiting a response
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Bytes assembled so far
    pub fn assembled_len(&self) -> usize {
        self.assembled.len()
    }

    /// Take the next slice to request, or `None` if the pipeline is full
    /// or the wait queue is drained.
    pub fn next_request(&mut self) -> Option<Slice> {
        if self.in_flight.len() >= self.pipeline_depth {
            return None;
        }
        let slice = self.wait.pop_front()?;
        self.in_flight.push_back(slice);
        Some(slice)
    }

    /// Validate an inbound piece header against the in-flight head. Any
    /// mismatch of index, offset, or declared payload length rejects the
    /// frame.
    pub fn on_piece_start(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let head = self.in_flight.front().ok_or_else(|| {
            SwarmError::protocol(
                ProtocolErrorKind::UnexpectedMessage,
                format!("Piece {} offset {} with no outstanding request", index, begin),
            )
        })?;
        if head.index != index || head.begin != begin || head.length != length {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::UnexpectedMessage,
                format!(
                    "Piece {} offset {} length {} does not match requested piece {} offset {} length {}",
                    index, begin, length, head.index, head.begin, head.length
                ),
            ));
        }
        self.streaming = true;
        Ok(())
    }

    /// Feed payload bytes for the slice announced by the last accepted
    /// piece header. `end` marks the final chunk of the frame and must
    /// land exactly where the requested slice ends.
    pub fn on_chunk(&mut self, bytes: &[u8], end: bool) -> Result<ChunkProgress> {
        if !self.streaming {
            return Err(SwarmError::invalid_state(
                "on_chunk",
                "No piece transfer in progress".to_string(),
            ));
        }
        self.assembled.extend_from_slice(bytes);
        self.head_received += bytes.len() as u32;

        let head_len = self.in_flight.front().map(|s| s.length).unwrap_or(0);
        if end != (self.head_received >= head_len) {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::LengthMismatch,
                format!(
                    "Frame boundary at {} of {} slice bytes",
                    self.head_received, head_len
                ),
            ));
        }
        if !end {
            return Ok(ChunkProgress::Partial);
        }

        self.in_flight.pop_front();
        self.head_received = 0;
        self.streaming = false;

        if self.wait.is_empty() && self.in_flight.is_empty() {
            debug_assert_eq!(self.assembled.len(), self.piece_len as usize);
            let piece = self.assembled.split().freeze();
            return Ok(ChunkProgress::PieceDone(piece));
        }
        Ok(ChunkProgress::SliceDone)
    }

    /// Move every in-flight slice back to the front of the wait queue,
    /// preserving order. Called when the peer chokes us; the assembled
    /// prefix stays valid and requests repeat after the next unchoke.
    pub fn requeue_in_flight(&mut self) {
        while let Some(slice) = self.in_flight.pop_back() {
            self.wait.push_front(slice);
        }
    }

    /// Decide the piece's fate when the connection is lost
    pub fn into_loss_outcome(self) -> LossOutcome {
        if self.head_received > 0 {
            return LossOutcome::Discard;
        }
        if self.assembled.is_empty() {
            return LossOutcome::Release;
        }
        LossOutcome::Park(PieceAssembly::from_bytes(self.assembled))
    }
}

/// Deterministic slice split: `ceil(len/unit)` slices starting at
/// `from`, the last one short when the length is not a multiple.
fn build_wait_queue(index: u32, piece_len: u32, slice_size: u32, from: u32) -> VecDeque<Slice> {
    let mut wait = VecDeque::new();
    let mut begin = from;
    while begin < piece_len {
        let length = slice_size.min(piece_len - begin);
        wait.push_back(Slice {
            index,
            begin,
            length,
        });
        begin += length;
    }
    wait
}
