//! Piece availability and download claims
//!
//! Tracks which pieces are held locally and which are being pulled from
//! the swarm. Every piece index is in exactly one of four states: have,
//! in-flight, parked, or idle. Claims are taken synchronously inside the
//! swarm lock, so two sessions can never walk away with the same idle
//! piece.

use bitvec::prelude::*;
use bytes::Bytes;

use crate::error::{Result, SwarmError};

use super::slices::PieceAssembly;

/// Claim state of one piece index
#[derive(Debug)]
enum PieceOwner {
    /// Not held, not being fetched
    Idle,

    /// Owned by one downloading session. `shares` counts additional
    /// sessions re-requesting the same piece as a fallback.
    InFlight { shares: u32 },

    /// Partially downloaded by a lost connection, buffered for resumption
    Parked(PieceAssembly),
}

/// Outcome of a selection walk over a session's candidate list
#[derive(Debug)]
pub enum Selection {
    /// Claimed an idle piece; the download starts from offset 0
    Fresh(u32),

    /// Claimed a parked piece; the download resumes after the buffered prefix
    Resumed(u32, PieceAssembly),

    /// Duplicating a piece another session already owns. The caller takes
    /// no ownership and must neither park nor release the index.
    Shared(u32),
}

impl Selection {
    /// Piece index this selection refers to
    pub fn index(&self) -> u32 {
        match self {
            Self::Fresh(index) => *index,
            Self::Resumed(index, _) => *index,
            Self::Shared(index) => *index,
        }
    }
}

/// Local piece bitmap plus the in-flight and parked claim sets
#[derive(Debug)]
pub struct PieceAvailability {
    have: BitVec<u8, Msb0>,
    owners: Vec<PieceOwner>,
    have_count: u32,
}

impl PieceAvailability {
    /// Create with all pieces idle
    pub fn new(piece_count: u32) -> Self {
        let mut owners = Vec::with_capacity(piece_count as usize);
        owners.resize_with(piece_count as usize, || PieceOwner::Idle);
        Self {
            have: bitvec![u8, Msb0; 0; piece_count as usize],
            owners,
            have_count: 0,
        }
    }

    /// Number of pieces in the torrent
    pub fn piece_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Number of pieces held locally
    pub fn have_count(&self) -> u32 {
        self.have_count
    }

    /// Whether every piece is held locally
    pub fn is_complete(&self) -> bool {
        self.have_count == self.piece_count()
    }

    /// Whether `index` is held locally. Panics if out of range.
    pub fn have(&self, index: u32) -> bool {
        self.have[index as usize]
    }

    /// Whether `index` is currently owned by a downloading session
    pub fn is_in_flight(&self, index: u32) -> bool {
        matches!(
            self.owners.get(index as usize),
            Some(PieceOwner::InFlight { .. })
        )
    }

    /// The local bitfield in wire layout: bit 7 of byte 0 is piece 0,
    /// spare bits in the trailing byte are zero.
    pub fn bitfield_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.have.as_raw_slice())
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index as usize >= self.owners.len() {
            return Err(SwarmError::invalid_input(
                "index",
                format!(
                    "Piece {} out of range ({} pieces)",
                    index,
                    self.owners.len()
                ),
            ));
        }
        Ok(())
    }

    /// Record a verified piece. Clears any in-flight or parked claim on
    /// the index first, then sets the bit. Fails if the bit is already
    /// set.
    pub fn mark_have(&mut self, index: u32) -> Result<()> {
        self.check_index(index)?;
        if self.have[index as usize] {
            return Err(SwarmError::invalid_state(
                "mark_have",
                format!("Piece {} already held", index),
            ));
        }
        self.owners[index as usize] = PieceOwner::Idle;
        self.have.set(index as usize, true);
        self.have_count += 1;
        Ok(())
    }

    /// Compute the pieces the peer has that we lack, in ascending index
    /// order. `peer` is the raw wire bitfield; bits at or beyond the
    /// piece count are ignored. A non-empty result means the peer is
    /// worth an `interested` message.
    pub fn diff_interest(&self, peer: &[u8]) -> Vec<u32> {
        let local = self.have.as_raw_slice();
        let piece_count = self.piece_count();
        let mut candidates = Vec::new();

        for (byte_idx, (&l, &p)) in local.iter().zip(peer.iter()).enumerate() {
            let wanted = (l | p) ^ l;
            if wanted == 0 {
                continue;
            }
            for bit in 0..8u32 {
                if wanted & (0x80 >> bit) != 0 {
                    let index = ((byte_idx as u32) << 3) + bit;
                    if index < piece_count {
                        candidates.push(index);
                    }
                }
            }
        }

        candidates
    }

    /// Walk a session's candidate list and claim a piece to download.
    ///
    /// Indices we already have are pruned from the list as stale. Idle
    /// indices are claimed fresh; parked indices are claimed with their
    /// buffered prefix. Indices owned by other sessions stay in the list
    /// and serve as a last-resort fallback: if the walk finds nothing
    /// else, the in-flight candidate with the fewest duplicate pullers is
    /// returned as [`Selection::Shared`].
    ///
    /// Callers must only invoke this while they have no active download,
    /// so a session never shares a piece with itself.
    pub fn select_piece(&mut self, candidates: &mut Vec<u32>) -> Option<Selection> {
        let mut fallback: Option<(u32, u32)> = None;

        let mut i = 0;
        while i < candidates.len() {
            let index = candidates[i];
            if index as usize >= self.owners.len() || self.have[index as usize] {
                candidates.remove(i);
                continue;
            }

            let slot = &mut self.owners[index as usize];
            match std::mem::replace(slot, PieceOwner::Idle) {
                PieceOwner::Idle => {
                    *slot = PieceOwner::InFlight { shares: 0 };
                    return Some(Selection::Fresh(index));
                }
                PieceOwner::Parked(assembly) => {
                    *slot = PieceOwner::InFlight { shares: 0 };
                    return Some(Selection::Resumed(index, assembly));
                }
                PieceOwner::InFlight { shares } => {
                    *slot = PieceOwner::InFlight { shares };
                    let rarer = match fallback {
                        Some((_, best)) => shares < best,
                        None => true,
                    };
                    if rarer {
                        fallback = Some((index, shares));
                    }
                    i += 1;
                }
            }
        }

        let (index, _) = fallback?;
        if let Some(PieceOwner::InFlight { shares }) = self.owners.get_mut(index as usize) {
            *shares += 1;
        }
        Some(Selection::Shared(index))
    }

    /// Park an in-flight piece for resumption by another session
    pub fn park(&mut self, index: u32, assembly: PieceAssembly) -> Result<()> {
        self.check_index(index)?;
        let slot = &mut self.owners[index as usize];
        if !matches!(slot, PieceOwner::InFlight { .. }) {
            return Err(SwarmError::invalid_state(
                "park",
                format!("Piece {} is not in flight", index),
            ));
        }
        *slot = PieceOwner::Parked(assembly);
        Ok(())
    }

    /// Return an in-flight piece to idle so any session may claim it again
    pub fn release(&mut self, index: u32) -> Result<()> {
        self.check_index(index)?;
        let slot = &mut self.owners[index as usize];
        if !matches!(slot, PieceOwner::InFlight { .. }) {
            return Err(SwarmError::invalid_state(
                "release",
                format!("Piece {} is not in flight", index),
            ));
        }
        *slot = PieceOwner::Idle;
        Ok(())
    }

    /// Drop one duplicate-puller count from an in-flight piece. The piece
    /// may have completed or moved since the share was taken, so this is
    /// best-effort.
    pub fn end_share(&mut self, index: u32) {
        if let Some(PieceOwner::InFlight { shares }) = self.owners.get_mut(index as usize) {
            *shares = shares.saturating_sub(1);
        }
    }
}
