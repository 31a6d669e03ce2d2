//! Torrent metadata
//!
//! The static facts the exchange core needs about one torrent: the info
//! hash, piece geometry, and the expected digest per piece. Producing
//! these from a `.torrent` file or magnet metadata is the embedder's
//! concern; this type only validates and serves them.

use crate::error::{Result, SwarmError};

/// 20-byte SHA1 digest
pub type Sha1Hash = [u8; 20];

/// Static description of one torrent
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    info_hash: Sha1Hash,
    piece_hashes: Vec<Sha1Hash>,
    piece_length: u32,
    total_size: u64,
}

impl TorrentInfo {
    /// Create a metadata record, validating that the hash list matches
    /// the piece geometry.
    pub fn new(
        info_hash: Sha1Hash,
        piece_hashes: Vec<Sha1Hash>,
        piece_length: u32,
        total_size: u64,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(SwarmError::invalid_input(
                "piece_length",
                "Must be at least 1 byte",
            ));
        }
        if total_size == 0 {
            return Err(SwarmError::invalid_input(
                "total_size",
                "Must be at least 1 byte",
            ));
        }

        let expected = total_size.div_ceil(piece_length as u64) as usize;
        if piece_hashes.len() != expected {
            return Err(SwarmError::invalid_input(
                "piece_hashes",
                format!(
                    "Expected {} piece hashes for {} bytes at {} per piece, got {}",
                    expected,
                    total_size,
                    piece_length,
                    piece_hashes.len()
                ),
            ));
        }

        Ok(Self {
            info_hash,
            piece_hashes,
            piece_length,
            total_size,
        })
    }

    /// The torrent's info hash
    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    /// Number of pieces
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Nominal piece length (every piece but possibly the last)
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Total payload size in bytes
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Actual length of one piece; the final piece may be short
    pub fn piece_len(&self, index: u32) -> u32 {
        if index + 1 == self.piece_count() {
            let remainder = self.total_size % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder as u32
            }
        } else {
            self.piece_length
        }
    }

    /// Byte offset of a piece within the flat payload
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Expected digest for one piece
    pub fn piece_hash(&self, index: u32) -> Option<&Sha1Hash> {
        self.piece_hashes.get(index as usize)
    }

    /// Byte length of this torrent's bitfield
    pub fn bitfield_len(&self) -> usize {
        (self.piece_count() as usize).div_ceil(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: usize) -> Vec<Sha1Hash> {
        (0..n).map(|i| [i as u8; 20]).collect()
    }

    #[test]
    fn test_piece_geometry() {
        // 3 pieces: 2 full, last one short
        let info = TorrentInfo::new([0; 20], hashes(3), 16384, 16384 * 2 + 100).unwrap();
        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.piece_len(0), 16384);
        assert_eq!(info.piece_len(1), 16384);
        assert_eq!(info.piece_len(2), 100);
        assert_eq!(info.piece_offset(2), 16384 * 2);
        assert_eq!(info.bitfield_len(), 1);
    }

    #[test]
    fn test_exact_multiple_keeps_full_last_piece() {
        let info = TorrentInfo::new([0; 20], hashes(4), 1024, 4096).unwrap();
        assert_eq!(info.piece_len(3), 1024);
    }

    #[test]
    fn test_hash_count_mismatch_rejected() {
        assert!(TorrentInfo::new([0; 20], hashes(2), 1024, 4096).is_err());
        assert!(TorrentInfo::new([0; 20], hashes(5), 1024, 4096).is_err());
    }

    #[test]
    fn test_bitfield_len_rounds_up() {
        let info = TorrentInfo::new([0; 20], hashes(9), 1024, 9 * 1024).unwrap();
        assert_eq!(info.bitfield_len(), 2);
    }

    #[test]
    fn test_piece_hash_lookup() {
        let info = TorrentInfo::new([0; 20], hashes(2), 1024, 2048).unwrap();
        assert_eq!(info.piece_hash(1), Some(&[1u8; 20]));
        assert_eq!(info.piece_hash(2), None);
    }
}
