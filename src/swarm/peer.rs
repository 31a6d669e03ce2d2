//! Peer session state machine
//!
//! One async task per remote peer drives the whole connection lifecycle:
//! connect, handshake, bitfield exchange, then the steady-state message
//! pump. The pre-Connected phases share a single bounded deadline; firing
//! it is fatal to the connection. In the steady state the task selects
//! pieces to pull, keeps the request pipeline full, reassembles inbound
//! piece payloads, serves the peer's own requests, relays completed-piece
//! notifications, and sends keepalives when the line goes quiet.
//!
//! Teardown is one owned drop: when the task exits for any reason it
//! routes its in-flight piece back to the shared availability table
//! (park, release, or discard) before the socket and buffers go away.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitvec::prelude::*;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkErrorKind, ProtocolErrorKind, Result, SwarmError};
use crate::wire::{Frame, Handshake, Message, WireDecoder, HANDSHAKE_LEN};

use super::availability::Selection;
use super::slices::{ChunkProgress, LossOutcome, PieceAssembly, Slice, SliceScheduler};
use super::upload::UploadPipeline;
use super::{SessionId, SwarmEvent, SwarmShared};

/// Active inbound transfer of one piece
enum Download {
    /// This session claimed the piece and answers for its fate
    Owned(SliceScheduler),

    /// Duplicate pull of a piece another session owns; never parked or
    /// released from here.
    Shared(SliceScheduler),
}

impl Download {
    fn scheduler_mut(&mut self) -> &mut SliceScheduler {
        match self {
            Self::Owned(scheduler) | Self::Shared(scheduler) => scheduler,
        }
    }

    fn piece_index(&self) -> u32 {
        match self {
            Self::Owned(scheduler) | Self::Shared(scheduler) => scheduler.piece_index(),
        }
    }

    fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

/// Per-connection protocol state
struct PeerSession {
    id: SessionId,
    addr: SocketAddr,
    shared: Arc<SwarmShared>,
    writer: OwnedWriteHalf,

    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,

    peer_bits: BitVec<u8, Msb0>,
    candidates: Vec<u32>,

    download: Option<Download>,
    upload: UploadPipeline,

    /// Frame received during establishment from a peer that skipped its
    /// bitfield, replayed once the pump starts.
    pending: Option<Frame>,

    /// Whether any frame went out since the last keepalive tick
    traffic: bool,
}

/// Drive one peer connection from establishment to teardown.
///
/// `inbound` carries the already-accepted socket for server-side
/// connections; outbound sessions dial `addr` themselves.
pub(crate) async fn run(
    shared: Arc<SwarmShared>,
    id: SessionId,
    addr: SocketAddr,
    inbound: Option<TcpStream>,
) -> Result<()> {
    // Subscribe to the have relay before establishment snapshots the
    // local bitfield. A piece completed while the exchange is in flight
    // then still reaches this peer as a Have; one duplicating a bitfield
    // bit is harmless.
    let have_rx = shared.have_tx.subscribe();

    let deadline = shared.config.establish_timeout();
    let (mut session, mut frames) = timeout(deadline, establish(shared.clone(), id, addr, inbound))
        .await
        .map_err(|_| SwarmError::timeout("session establishment"))??;

    info!(session = id, peer = %addr, "Peer session established");
    let _ = session
        .shared
        .event_tx
        .send(SwarmEvent::PeerConnected { session: id, addr });

    let result = session.pump(&mut frames, have_rx).await;
    session.teardown();
    result
}

/// Connect (if outbound), exchange handshakes, send the local bitfield,
/// and take in the remote one.
async fn establish(
    shared: Arc<SwarmShared>,
    id: SessionId,
    addr: SocketAddr,
    inbound: Option<TcpStream>,
) -> Result<(PeerSession, FramedRead<OwnedReadHalf, WireDecoder>)> {
    let mut stream = match inbound {
        Some(stream) => stream,
        None => TcpStream::connect(addr).await?,
    };

    // Both directions send their handshake eagerly, then validate the
    // remote's.
    let local = Handshake::new(*shared.info.info_hash(), shared.peer_id);
    stream.write_all(&local.encode()).await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let remote = Handshake::parse(&buf)?;
    if remote.info_hash != *shared.info.info_hash() {
        return Err(SwarmError::protocol(
            ProtocolErrorKind::Handshake,
            "Info hash mismatch",
        ));
    }
    debug!(session = id, peer = %addr, peer_id = ?remote.peer_id, "Handshake complete");

    let (read_half, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(read_half, WireDecoder::new(shared.config.max_frame_len));

    // The local bitfield goes out immediately after the handshake.
    let bits = shared.availability.lock().bitfield_bytes();
    writer.write_all(&Message::Bitfield { bits }.encode()).await?;

    let piece_count = shared.info.piece_count() as usize;
    let upload_chunk = shared.config.upload_chunk_bytes;
    let mut session = PeerSession {
        id,
        addr,
        shared,
        writer,
        am_choking: true,
        am_interested: false,
        peer_choking: true,
        peer_interested: false,
        peer_bits: bitvec![u8, Msb0; 0; piece_count],
        candidates: Vec::new(),
        download: None,
        upload: UploadPipeline::new(upload_chunk),
        pending: None,
        traffic: false,
    };

    // The remote bitfield is expected first. A peer with no pieces may
    // legally skip it; whatever arrived instead replays in the pump.
    match frames.next().await {
        None => {
            return Err(SwarmError::network(
                NetworkErrorKind::Closed,
                "Peer closed during bitfield exchange",
            ));
        }
        Some(Err(err)) => return Err(err),
        Some(Ok(Frame::Message(Message::Bitfield { bits }))) => {
            session.load_peer_bitfield(&bits)?;
        }
        Some(Ok(frame)) => {
            session.pending = Some(frame);
        }
    }

    if !session.candidates.is_empty() {
        session.am_interested = true;
        session.send(Message::Interested).await?;
    }

    Ok((session, frames))
}

impl PeerSession {
    /// Validate and record the remote bitfield, computing the candidate
    /// list it opens up.
    fn load_peer_bitfield(&mut self, bits: &[u8]) -> Result<()> {
        let expected = self.shared.info.bitfield_len();
        if bits.len() != expected {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::LengthMismatch,
                format!("Bitfield of {} bytes, expected {}", bits.len(), expected),
            ));
        }

        let mut peer_bits = BitVec::<u8, Msb0>::from_slice(bits);
        peer_bits.truncate(self.shared.info.piece_count() as usize);
        self.candidates = self.shared.availability.lock().diff_interest(bits);
        self.peer_bits = peer_bits;
        Ok(())
    }

    /// Steady-state message pump. Runs until the socket closes, a fatal
    /// error occurs, or the swarm shuts down.
    async fn pump(
        &mut self,
        frames: &mut FramedRead<OwnedReadHalf, WireDecoder>,
        mut have_rx: broadcast::Receiver<u32>,
    ) -> Result<()> {
        let shutdown = self.shared.shutdown.clone();
        let period = self.shared.config.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        if let Some(frame) = self.pending.take() {
            self.handle_frame(frame).await?;
        }

        loop {
            self.pump_download().await?;
            self.pump_upload().await?;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(session = self.id, "Session stopping for swarm shutdown");
                    return Ok(());
                }

                frame = frames.next() => match frame {
                    None => {
                        return Err(SwarmError::network(
                            NetworkErrorKind::Closed,
                            "Peer closed the connection",
                        ));
                    }
                    Some(frame) => self.handle_frame(frame?).await?,
                },

                notify = have_rx.recv() => match notify {
                    Ok(index) => self.send(Message::Have { index }).await?,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(session = self.id, missed, "Have relay lagged");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },

                _ = keepalive.tick() => {
                    if !std::mem::take(&mut self.traffic) {
                        self.send(Message::KeepAlive).await?;
                        self.traffic = false;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Message(message) => self.handle_message(message).await,
            Frame::PieceStart { index, begin, length } => {
                let download = self.download.as_mut().ok_or_else(|| {
                    SwarmError::protocol(
                        ProtocolErrorKind::UnexpectedMessage,
                        format!("Piece {} with no active download", index),
                    )
                })?;
                download.scheduler_mut().on_piece_start(index, begin, length)
            }
            Frame::PieceChunk { bytes, end } => self.handle_piece_chunk(bytes, end).await,
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::KeepAlive => {}

            Message::Choke => {
                debug!(session = self.id, "Choked by peer");
                self.peer_choking = true;
                // Outstanding requests will not be answered; line them up
                // again for after the next unchoke.
                if let Some(download) = self.download.as_mut() {
                    download.scheduler_mut().requeue_in_flight();
                }
            }

            Message::Unchoke => {
                debug!(session = self.id, "Unchoked by peer");
                self.peer_choking = false;
            }

            Message::Interested => {
                self.peer_interested = true;
                if self.shared.config.auto_unchoke && self.am_choking {
                    self.am_choking = false;
                    self.send(Message::Unchoke).await?;
                }
            }

            Message::NotInterested => {
                self.peer_interested = false;
            }

            Message::Have { index } => {
                if index >= self.shared.info.piece_count() {
                    return Err(SwarmError::protocol(
                        ProtocolErrorKind::OutOfRange,
                        format!("Have for piece {} of {}", index, self.shared.info.piece_count()),
                    ));
                }
                self.peer_bits.set(index as usize, true);
                if !self.shared.availability.lock().have(index)
                    && !self.candidates.contains(&index)
                {
                    self.candidates.push(index);
                }
                if !self.am_interested && !self.candidates.is_empty() {
                    self.am_interested = true;
                    self.send(Message::Interested).await?;
                }
            }

            Message::Bitfield { .. } => {
                return Err(SwarmError::protocol(
                    ProtocolErrorKind::UnexpectedMessage,
                    "Bitfield after the opening exchange",
                ));
            }

            Message::Request { index, begin, length } => {
                self.handle_request(index, begin, length).await?;
            }

            Message::Piece { .. } => {
                // The decoder streams piece frames as PieceStart/PieceChunk.
                return Err(SwarmError::invalid_state(
                    "message pump",
                    "Unstreamed piece frame",
                ));
            }

            Message::Cancel { index, begin, length } => {
                self.upload.cancel(index, begin, length);
            }

            Message::Port { port } => {
                trace!(session = self.id, port, "Peer announced a DHT port");
            }
        }
        Ok(())
    }

    async fn handle_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        if length == 0 || length > self.shared.config.max_request_len {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::LengthMismatch,
                format!("Request of {} bytes", length),
            ));
        }

        let info = &self.shared.info;
        let in_range = index < info.piece_count()
            && begin
                .checked_add(length)
                .is_some_and(|end| end <= info.piece_len(index));
        if !in_range {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::OutOfRange,
                format!("Request for piece {} offset {} length {}", index, begin, length),
            ));
        }

        if self.am_choking || !self.shared.availability.lock().have(index) {
            debug!(
                session = self.id,
                piece = index,
                "Rejecting request with a choke"
            );
            self.am_choking = true;
            self.upload.clear();
            self.send(Message::Choke).await?;
            return Ok(());
        }

        self.upload.enqueue(Slice { index, begin, length });
        Ok(())
    }

    async fn handle_piece_chunk(&mut self, bytes: Bytes, end: bool) -> Result<()> {
        self.shared
            .downloaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let Some(mut download) = self.download.take() else {
            return Err(SwarmError::invalid_state(
                "piece chunk",
                "No active download",
            ));
        };

        let progress = match download.scheduler_mut().on_chunk(&bytes, end) {
            Ok(progress) => progress,
            Err(err) => {
                self.download = Some(download);
                return Err(err);
            }
        };

        match progress {
            ChunkProgress::Partial | ChunkProgress::SliceDone => {
                self.download = Some(download);
                Ok(())
            }
            ChunkProgress::PieceDone(piece) => {
                let index = download.piece_index();
                let shared_pull = download.is_shared();

                let result = self
                    .shared
                    .complete_piece(index, piece, !shared_pull)
                    .await;
                if shared_pull {
                    self.shared.availability.lock().end_share(index);
                }

                match result {
                    Ok(true) => {
                        debug!(session = self.id, piece = index, "Piece verified");
                        Ok(())
                    }
                    Ok(false) => {
                        debug!(
                            session = self.id,
                            piece = index,
                            "Piece already completed elsewhere"
                        );
                        Ok(())
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(session = self.id, piece = index, error = %err, "Piece completion failed; will retry");
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    fn start_scheduler(&self, index: u32) -> SliceScheduler {
        SliceScheduler::new(
            index,
            self.shared.info.piece_len(index),
            self.shared.config.slice_size,
            self.shared.config.pipeline_depth,
        )
    }

    fn resume_scheduler(&self, index: u32, assembly: PieceAssembly) -> SliceScheduler {
        SliceScheduler::resume(
            index,
            self.shared.info.piece_len(index),
            self.shared.config.slice_size,
            self.shared.config.pipeline_depth,
            assembly,
        )
    }

    /// Select a piece if none is active, then keep the request pipeline
    /// full.
    async fn pump_download(&mut self) -> Result<()> {
        if self.peer_choking {
            return Ok(());
        }

        if self.download.is_none() {
            let selection = self
                .shared
                .availability
                .lock()
                .select_piece(&mut self.candidates);

            match selection {
                Some(Selection::Fresh(index)) => {
                    debug!(session = self.id, piece = index, "Starting piece download");
                    self.download = Some(Download::Owned(self.start_scheduler(index)));
                }
                Some(Selection::Resumed(index, assembly)) => {
                    debug!(
                        session = self.id,
                        piece = index,
                        resumed_bytes = assembly.len(),
                        "Resuming parked piece"
                    );
                    self.download = Some(Download::Owned(self.resume_scheduler(index, assembly)));
                }
                Some(Selection::Shared(index)) => {
                    debug!(
                        session = self.id,
                        piece = index,
                        "Re-requesting an in-flight piece"
                    );
                    self.download = Some(Download::Shared(self.start_scheduler(index)));
                }
                None => {
                    if self.am_interested && self.candidates.is_empty() {
                        self.am_interested = false;
                        self.send(Message::NotInterested).await?;
                    }
                    return Ok(());
                }
            }
        }

        let mut requests = Vec::new();
        if let Some(download) = self.download.as_mut() {
            while let Some(slice) = download.scheduler_mut().next_request() {
                requests.push(slice);
            }
        }
        for slice in requests {
            self.send(Message::Request {
                index: slice.index,
                begin: slice.begin,
                length: slice.length,
            })
            .await?;
        }
        Ok(())
    }

    /// Serve queued upload requests. New requests only arrive through the
    /// read path, so draining the queue here is bounded work.
    async fn pump_upload(&mut self) -> Result<()> {
        while !self.am_choking {
            let served = self
                .upload
                .serve_next(&mut self.writer, self.shared.store.as_ref())
                .await?;
            match served {
                Some(bytes) => {
                    self.traffic = true;
                    self.shared.uploaded.fetch_add(bytes, Ordering::Relaxed);
                    trace!(session = self.id, bytes, "Served block");
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.writer.write_all(&message.encode()).await?;
        self.traffic = true;
        Ok(())
    }

    /// Route the in-flight piece back to the shared table before the
    /// session's buffers go away.
    fn teardown(&mut self) {
        self.upload.clear();
        let Some(download) = self.download.take() else {
            debug!(
                session = self.id,
                peer = %self.addr,
                peer_interested = self.peer_interested,
                "Session closed"
            );
            return;
        };

        let index = download.piece_index();
        let mut availability = self.shared.availability.lock();
        match download {
            Download::Shared(_) => availability.end_share(index),
            Download::Owned(scheduler) => {
                if availability.have(index) {
                    // A duplicate puller finished the piece while we held
                    // the claim; nothing left to hand back.
                    return;
                }
                match scheduler.into_loss_outcome() {
                    LossOutcome::Park(assembly) => {
                        debug!(
                            session = self.id,
                            piece = index,
                            parked_bytes = assembly.len(),
                            "Parking piece for resumption"
                        );
                        if let Err(err) = availability.park(index, assembly) {
                            warn!(session = self.id, piece = index, error = %err, "Park failed");
                        }
                    }
                    LossOutcome::Release => {
                        if let Err(err) = availability.release(index) {
                            warn!(session = self.id, piece = index, error = %err, "Release failed");
                        }
                    }
                    LossOutcome::Discard => {
                        warn!(
                            session = self.id,
                            piece = index,
                            "Discarding mid-slice partial download"
                        );
                        if let Err(err) = availability.release(index) {
                            warn!(session = self.id, piece = index, error = %err, "Release failed");
                        }
                    }
                }
            }
        }
    }
}
