//! Peer wire protocol codec
//!
//! This module implements the BitTorrent peer wire framing as defined in
//! BEP 3: the 68-byte handshake and the length-prefixed message catalogue.
//! Decoding is incremental. [`WireDecoder`] reports a complete frame, asks
//! for more bytes by returning `Ok(None)`, or fails the connection with a
//! protocol error. `piece` payloads are not buffered into whole frames:
//! once the 13-byte piece header is parsed, payload bytes stream through
//! as [`Frame::PieceChunk`]s, since 16 KiB payloads routinely span reads.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{ProtocolErrorKind, Result, SwarmError};
use crate::metainfo::Sha1Hash;

/// Protocol string for BitTorrent
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake message: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Bytes of a piece frame before its payload: length prefix, id, index, begin
const PIECE_HEADER_LEN: usize = 13;

/// The fixed-size handshake exchanged before any framed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a handshake with empty reserved bytes
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Encode to the 68-byte wire form
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a 68-byte handshake, validating the protocol tag.
    /// Info-hash equality is the caller's check.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if buf[0] as usize != PROTOCOL_STRING.len() || &buf[1..20] != PROTOCOL_STRING {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::Handshake,
                "Unrecognized protocol tag",
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// Peer wire protocol message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep connection alive (no id, no payload)
    KeepAlive,

    /// Stop serving the peer's requests
    Choke,

    /// Resume serving the peer's requests
    Unchoke,

    /// Interested in the peer's data
    Interested,

    /// Not interested in the peer's data
    NotInterested,

    /// Completed and verified one piece
    Have { index: u32 },

    /// Bitfield of pieces held; only valid immediately after the handshake
    Bitfield { bits: Bytes },

    /// Request one block
    Request { index: u32, begin: u32, length: u32 },

    /// Block data (response to a request)
    Piece { index: u32, begin: u32, data: Bytes },

    /// Cancel a pending request
    Cancel { index: u32, begin: u32, length: u32 },

    /// DHT port announcement; informational only
    Port { port: u16 },
}

impl Message {
    /// Get the message id
    pub fn id(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::NotInterested => Some(3),
            Self::Have { .. } => Some(4),
            Self::Bitfield { .. } => Some(5),
            Self::Request { .. } => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Cancel { .. } => Some(8),
            Self::Port { .. } => Some(9),
        }
    }

    /// Encode the message to bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => {
                vec![0, 0, 0, 0]
            }

            Self::Choke => {
                vec![0, 0, 0, 1, 0]
            }

            Self::Unchoke => {
                vec![0, 0, 0, 1, 1]
            }

            Self::Interested => {
                vec![0, 0, 0, 1, 2]
            }

            Self::NotInterested => {
                vec![0, 0, 0, 1, 3]
            }

            Self::Have { index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }

            Self::Bitfield { bits } => {
                let len = 1 + bits.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bits);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece { index, begin, data } => {
                let mut buf = piece_header(*index, *begin, data.len() as u32);
                buf.extend_from_slice(data);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
        }
    }
}

/// Build the 13-byte header of a piece frame whose payload will follow
/// separately. Used by the upload path to stream large payloads in
/// chunks instead of assembling one monolithic frame.
pub fn piece_header(index: u32, begin: u32, payload_len: u32) -> Vec<u8> {
    let len = 9 + payload_len;
    let mut buf = Vec::with_capacity(4 + PIECE_HEADER_LEN - 4 + payload_len as usize);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(7);
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&begin.to_be_bytes());
    buf
}

/// One decoded item from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete non-piece message
    Message(Message),

    /// Header of a piece frame; `length` payload bytes follow as chunks
    PieceStart { index: u32, begin: u32, length: u32 },

    /// Payload bytes for the piece announced by the last `PieceStart`.
    /// `end` marks the final chunk of that frame.
    PieceChunk { bytes: Bytes, end: bool },
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Expecting a length prefix
    Header,
    /// Inside a piece frame's payload
    PieceBody { remaining: u32 },
}

/// Incremental decoder for peer wire frames.
///
/// `decode` returns `Ok(Some(frame))` when a frame (or piece payload
/// chunk) is available, `Ok(None)` when the buffer holds a valid but
/// incomplete frame, and `Err` for malformed input, after which the
/// connection must be closed.
#[derive(Debug)]
pub struct WireDecoder {
    state: DecodeState,
    max_frame_len: usize,
}

impl WireDecoder {
    /// Create a decoder enforcing `max_frame_len` on declared lengths
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_frame_len,
        }
    }
}

impl Decoder for WireDecoder {
    type Item = Frame;
    type Error = SwarmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let DecodeState::PieceBody { remaining } = self.state {
            if src.is_empty() {
                return Ok(None);
            }
            let take = src.len().min(remaining as usize);
            let bytes = src.split_to(take).freeze();
            let remaining = remaining - take as u32;
            if remaining == 0 {
                self.state = DecodeState::Header;
                return Ok(Some(Frame::PieceChunk { bytes, end: true }));
            }
            self.state = DecodeState::PieceBody { remaining };
            return Ok(Some(Frame::PieceChunk { bytes, end: false }));
        }

        if src.len() < 4 {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if declared == 0 {
            src.advance(4);
            return Ok(Some(Frame::Message(Message::KeepAlive)));
        }

        if declared > self.max_frame_len {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::LengthMismatch,
                format!("Frame of {} bytes exceeds limit", declared),
            ));
        }

        if src.len() < 5 {
            return Ok(None);
        }
        let id = src[4];

        if id == 7 {
            // Piece frames stream: parse the header, then hand the payload
            // through chunk by chunk.
            if declared < 10 {
                return Err(SwarmError::protocol(
                    ProtocolErrorKind::LengthMismatch,
                    format!("Piece frame with {} byte payload", declared as i64 - 9),
                ));
            }
            if src.len() < PIECE_HEADER_LEN {
                return Ok(None);
            }
            src.advance(5);
            let index = src.get_u32();
            let begin = src.get_u32();
            let length = (declared - 9) as u32;
            self.state = DecodeState::PieceBody { remaining: length };
            return Ok(Some(Frame::PieceStart {
                index,
                begin,
                length,
            }));
        }

        if src.len() < 4 + declared {
            src.reserve(4 + declared - src.len());
            return Ok(None);
        }

        src.advance(5);
        let mut payload = src.split_to(declared - 1);

        let expect_len = |expected: usize| -> Result<()> {
            if declared != expected {
                return Err(SwarmError::protocol(
                    ProtocolErrorKind::LengthMismatch,
                    format!("Message id {} with length {}", id, declared),
                ));
            }
            Ok(())
        };

        let message = match id {
            0 => {
                expect_len(1)?;
                Message::Choke
            }
            1 => {
                expect_len(1)?;
                Message::Unchoke
            }
            2 => {
                expect_len(1)?;
                Message::Interested
            }
            3 => {
                expect_len(1)?;
                Message::NotInterested
            }
            4 => {
                expect_len(5)?;
                Message::Have {
                    index: payload.get_u32(),
                }
            }
            5 => Message::Bitfield {
                bits: payload.freeze(),
            },
            6 => {
                expect_len(13)?;
                Message::Request {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            8 => {
                expect_len(13)?;
                Message::Cancel {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            9 => {
                expect_len(3)?;
                Message::Port {
                    port: payload.get_u16(),
                }
            }
            other => {
                return Err(SwarmError::protocol(
                    ProtocolErrorKind::UnknownMessage,
                    format!("Unrecognized message id {}", other),
                ));
            }
        };

        Ok(Some(Frame::Message(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut WireDecoder, bytes: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_handshake_round_trip() {
        let hs = Handshake::new([3u8; 20], *b"-PW0001-abcdefghijkl");
        let wire = hs.encode();
        assert_eq!(wire.len(), HANDSHAKE_LEN);
        assert_eq!(Handshake::parse(&wire).unwrap(), hs);
    }

    #[test]
    fn test_handshake_rejects_bad_tag() {
        let mut wire = Handshake::new([3u8; 20], [1u8; 20]).encode();
        wire[3] ^= 0xff;
        assert!(Handshake::parse(&wire).is_err());

        let mut wire = Handshake::new([3u8; 20], [1u8; 20]).encode();
        wire[0] = 18;
        assert!(Handshake::parse(&wire).is_err());
    }

    #[test]
    fn test_simple_messages_round_trip() {
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { index: 42 },
            Message::Bitfield {
                bits: Bytes::from_static(&[0b1010_0000]),
            },
            Message::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            Message::Cancel {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            Message::Port { port: 6881 },
        ];

        let mut decoder = WireDecoder::new(1024);
        for msg in messages {
            let frames = decode_all(&mut decoder, &msg.encode());
            assert_eq!(frames, vec![Frame::Message(msg)]);
        }
    }

    #[test]
    fn test_piece_frame_streams() {
        let data = Bytes::from_static(&[0xab; 32]);
        let msg = Message::Piece {
            index: 3,
            begin: 16384,
            data: data.clone(),
        };

        let mut decoder = WireDecoder::new(1024);
        let frames = decode_all(&mut decoder, &msg.encode());
        assert_eq!(
            frames[0],
            Frame::PieceStart {
                index: 3,
                begin: 16384,
                length: 32
            }
        );
        assert_eq!(
            frames[1],
            Frame::PieceChunk {
                bytes: data,
                end: true
            }
        );
    }

    #[test]
    fn test_piece_payload_spanning_reads() {
        let msg = Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::from_static(&[7u8; 20]),
        };
        let wire = msg.encode();

        let mut decoder = WireDecoder::new(1024);
        let mut buf = BytesMut::new();

        // First read covers the header and 5 payload bytes
        buf.extend_from_slice(&wire[..18]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::PieceStart {
                index: 0,
                begin: 0,
                length: 20
            })
        );
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::PieceChunk {
                bytes: Bytes::from_static(&[7u8; 5]),
                end: false
            })
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        // Second read completes the payload
        buf.extend_from_slice(&wire[18..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::PieceChunk {
                bytes: Bytes::from_static(&[7u8; 15]),
                end: true
            })
        );
    }

    #[test]
    fn test_refeed_at_every_boundary() {
        // Splitting a frame at any point must yield NeedMoreBytes until the
        // full frame is present, then the identical parse.
        let msg = Message::Request {
            index: 9,
            begin: 32768,
            length: 16384,
        };
        let wire = msg.encode();

        for split in 0..wire.len() {
            let mut decoder = WireDecoder::new(1024);
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&wire[..split]);
            assert_eq!(decoder.decode(&mut buf).unwrap(), None, "split {}", split);

            buf.extend_from_slice(&wire[split..]);
            assert_eq!(
                decoder.decode(&mut buf).unwrap(),
                Some(Frame::Message(msg.clone())),
                "split {}",
                split
            );
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut wire = Message::Unchoke.encode();
        wire.extend_from_slice(&Message::Have { index: 5 }.encode());
        wire.extend_from_slice(&Message::KeepAlive.encode());

        let mut decoder = WireDecoder::new(1024);
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(
            frames,
            vec![
                Frame::Message(Message::Unchoke),
                Frame::Message(Message::Have { index: 5 }),
                Frame::Message(Message::KeepAlive),
            ]
        );
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut decoder = WireDecoder::new(1024);
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 14][..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        // have with a 6-byte declared length
        let mut decoder = WireDecoder::new(1024);
        let mut buf = BytesMut::from(&[0, 0, 0, 6, 4, 0, 0, 0, 1, 9][..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = WireDecoder::new(64);
        let mut buf = BytesMut::from(&[0, 0, 4, 0, 5][..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_empty_piece_payload_rejected() {
        let mut decoder = WireDecoder::new(1024);
        let mut buf = BytesMut::from(&[0, 0, 0, 9, 7, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_piece_header_matches_full_encode() {
        let data = Bytes::from_static(&[1, 2, 3, 4]);
        let full = Message::Piece {
            index: 8,
            begin: 100,
            data: data.clone(),
        }
        .encode();

        let mut streamed = piece_header(8, 100, 4);
        streamed.extend_from_slice(&data);
        assert_eq!(full, streamed);
    }
}
