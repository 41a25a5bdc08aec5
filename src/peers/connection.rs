use super::progress::PieceDownload;
use super::{
    BlockLength, BlockOffset, ClosedConnection, PeerAlerts, PeerCommands, PeerStream, PieceIndex,
    BLOCK_SIZE,
};
use crate::config::Config;
use crate::peer_protocol::codec::{self, PeerFrames, PeerMessage};
use crate::peer_protocol::extension::{
    ExtensionRegistry, ExtensionTable, EXTENSION_HANDSHAKE_ID,
};
use crate::peer_protocol::handshake::{PeerHandshake, HANDSHAKE_LEN};
use crate::peer_protocol::PeerError;
use crate::piece_store::{PieceStore, StoreError};
use crate::prelude::*;
use crate::torrent::{Bitfield, PeerId};
use futures::SinkExt;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HandshakeSent,
    Connected,
    /// terminal.
    Closed,
}

/// everything a connection shares with the rest of the engine.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub store: Arc<PieceStore>,
    pub registry: Arc<ExtensionRegistry>,
    pub config: Arc<Config>,
    pub alerts_tx: mpsc::Sender<PeerAlerts>,
    /// signalled when another connection gives a piece back, so an idle connection selects again.
    pub piece_released: Arc<Notify>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRequest {
    index: PieceIndex,
    begin: BlockOffset,
    length: BlockLength,
}

/// one peer, from the handshake until the socket goes away.
///
/// downloads one block at a time from the piece it reserved in the store, and serves blocks of
/// verified pieces to the peer while it is interested.
#[derive(Debug)]
pub struct PeerConnection {
    peer_addr: SocketAddr,
    state: ConnectionState,
    peer_id: Option<PeerId>,
    peer_supports_extensions: bool,

    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,

    peer_has: Bitfield,
    download: Option<PieceDownload>,
    extensions: Option<ExtensionTable>,
    // requests accepted but not answered yet, a cancel removes them from here.
    uploads: VecDeque<BlockRequest>,
    cached_piece: Option<(PieceIndex, Bytes)>,
    last_sent: Instant,

    ctx: ConnectionContext,
    commands_rx: mpsc::Receiver<PeerCommands>,
}

impl PeerConnection {
    pub fn new(
        peer_addr: SocketAddr,
        ctx: ConnectionContext,
        commands_rx: mpsc::Receiver<PeerCommands>,
    ) -> Self {
        Self {
            peer_addr,
            state: ConnectionState::Connecting,
            peer_id: None,
            peer_supports_extensions: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_has: Bitfield::repeat(false, ctx.store.piece_count()),
            download: None,
            extensions: None,
            uploads: VecDeque::new(),
            cached_piece: None,
            last_sent: Instant::now(),
            ctx,
            commands_rx,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn extensions(&self) -> Option<&ExtensionTable> {
        self.extensions.as_ref()
    }

    /// drives the connection to completion. never fails, the outcome is in the returned value.
    #[instrument(name = "peer connection", level = "info", skip_all, fields(peer = %self.peer_addr))]
    pub async fn run<S: PeerStream>(mut self, mut stream: S) -> ClosedConnection {
        let result = match self.handshake(&mut stream).await {
            Ok(()) => {
                let mut frames = codec::upgrade_stream(stream);
                self.event_loop(&mut frames).await
            }
            Err(err) => Err(err),
        };
        self.state = ConnectionState::Closed;

        match &result {
            Ok(()) => info!("connection closed"),
            Err(err) => warn!(%err, "connection failed"),
        }

        // the partial piece is dropped here, only the reservation outlives the connection.
        ClosedConnection {
            peer_addr: self.peer_addr,
            peer_id: self.peer_id.take(),
            held_piece: self.download.take().map(|download| download.index()),
            error: result.err(),
        }
    }

    /// sends our handshake and checks the peer's. on failure the connection is closed and nothing
    /// from the peer's handshake is kept.
    #[instrument(name = "handshake", level = "debug", skip_all)]
    pub async fn handshake<T>(&mut self, stream: &mut T) -> Result<(), PeerError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match self.exchange_handshakes(stream).await {
            Ok(theirs) => {
                info!(peer_id = ?theirs.peer_id, "handshake complete");
                self.peer_supports_extensions = theirs.supports_extensions();
                self.peer_id = Some(theirs.peer_id);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                Err(err)
            }
        }
    }

    async fn exchange_handshakes<T>(&mut self, stream: &mut T) -> Result<PeerHandshake, PeerError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let metainfo = self.ctx.store.metainfo().clone();
        let ours = PeerHandshake::new(metainfo.info_hash, metainfo.peer_id.clone());

        debug!("sending handshake");
        stream.write_all(&ours.into_bytes()).await?;
        self.state = ConnectionState::HandshakeSent;

        let mut bytes = [0; HANDSHAKE_LEN];
        time::timeout(self.ctx.config.request_timeout, stream.read_exact(&mut bytes))
            .await
            .map_err(|_| PeerError::Timeout)??;

        let theirs = PeerHandshake::from_bytes(bytes);
        theirs.validate(&metainfo.info_hash, &metainfo.peer_id)?;
        Ok(theirs)
    }

    async fn event_loop<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
    ) -> Result<(), PeerError> {
        let mut bitfield = self.ctx.store.bitfield();
        bitfield.set_uninitialized(false);
        self.send(frames, PeerMessage::Bitfield(bitfield.into_vec()))
            .await?;
        self.send(frames, PeerMessage::Interested).await?;
        self.am_interested = true;

        if self.peer_supports_extensions {
            let payload = self.ctx.registry.handshake_payload();
            self.send(
                frames,
                PeerMessage::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload,
                },
            )
            .await?;
        }

        let cancel = self.ctx.cancel.clone();
        let piece_released = self.ctx.piece_released.clone();
        let request_timeout = self.ctx.config.request_timeout;
        let keep_alive_interval = self.ctx.config.keep_alive_interval;

        loop {
            let request_deadline = self
                .download
                .as_ref()
                .and_then(PieceDownload::requested_at)
                .map(|sent_at| sent_at + request_timeout);
            let keep_alive_at = self.last_sent + keep_alive_interval;
            let can_upload = !self.am_choking && !self.uploads.is_empty();

            // frames go before uploads so a cancel already in the buffer beats the upload.
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("connection cancelled");
                    return Ok(());
                }

                frame = frames.next() => match frame {
                    Some(Ok(Some(msg))) => self.handle_message(frames, msg).await?,
                    Some(Ok(None)) => trace!("received keep alive"),
                    Some(Err(err)) => return Err(err),
                    None => return Err(PeerError::ConnectionClosed),
                },

                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(frames, command).await?,
                    None => {
                        debug!("commands channel closed");
                        return Ok(());
                    }
                },

                _ = piece_released.notified() => self.request_next(frames).await?,

                _ = std::future::ready(()), if can_upload => self.serve_upload(frames).await?,

                _ = request_expiry(request_deadline) => {
                    warn!("block request timed out");
                    return Err(PeerError::Timeout);
                }

                _ = time::sleep_until(keep_alive_at) => {
                    trace!("sending keep alive");
                    frames.send(None::<PeerMessage>).await?;
                    self.last_sent = Instant::now();
                }
            }
        }
    }

    async fn send<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
        msg: PeerMessage,
    ) -> Result<(), PeerError> {
        trace!(tag = msg.tag(), "sending message");
        frames.send(msg).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn alert(&self, alert: PeerAlerts) {
        if self.ctx.alerts_tx.send(alert).await.is_err() {
            debug!("alerts receiver dropped");
        }
    }

    async fn handle_message<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
        msg: PeerMessage,
    ) -> Result<(), PeerError> {
        type PM = PeerMessage;

        match msg {
            PM::Choke => {
                debug!("peer choked us");
                self.peer_choking = true;
                self.give_back_piece().await;
            }
            PM::Unchoke => {
                debug!("peer unchoked us");
                self.peer_choking = false;
                self.request_next(frames).await?;
            }
            PM::Interested => {
                self.peer_interested = true;
                if self.am_choking {
                    debug!("peer is interested, unchoking");
                    self.send(frames, PM::Unchoke).await?;
                    self.am_choking = false;
                }
            }
            PM::NotInterested => {
                self.peer_interested = false;
                if !self.am_choking {
                    debug!("peer is not interested, choking");
                    self.send(frames, PM::Choke).await?;
                    self.am_choking = true;
                    self.uploads.clear();
                }
            }
            PM::Have(index) => {
                let index = self.checked_index(index)?;
                trace!(index, "peer has piece");
                self.peer_has.set(index, true);
                self.update_interest(frames).await?;
                self.request_next(frames).await?;
            }
            PM::Bitfield(bytes) => {
                self.peer_has = self.parse_bitfield(bytes)?;
                debug!(pieces = self.peer_has.count_ones(), "received bitfield");
                self.update_interest(frames).await?;
                self.request_next(frames).await?;
            }
            PM::Request {
                index,
                begin,
                length,
            } => {
                let index = self.checked_index(index)?;
                self.queue_upload(BlockRequest {
                    index,
                    begin,
                    length,
                });
            }
            PM::Piece {
                index,
                begin,
                block,
            } => self.on_block(frames, index, begin, block).await?,
            PM::Cancel {
                index,
                begin,
                length,
            } => {
                let cancelled = BlockRequest {
                    index: index as PieceIndex,
                    begin,
                    length,
                };
                self.uploads.retain(|request| *request != cancelled);
            }
            PM::Extended { id, payload } => self.on_extended(frames, id, payload).await?,
        }

        Ok(())
    }

    async fn handle_command<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
        command: PeerCommands,
    ) -> Result<(), PeerError> {
        match command {
            PeerCommands::Have(index) => {
                if !self.peer_has.get(index).is_some_and(|bit| *bit) {
                    self.send(frames, PeerMessage::Have(index as u32)).await?;
                }
            }
        }
        Ok(())
    }

    fn checked_index(&self, index: u32) -> Result<PieceIndex, PeerError> {
        let index = index as PieceIndex;
        if index >= self.peer_has.len() {
            return Err(PeerError::protocol(format!(
                "piece index {index} out of range"
            )));
        }
        Ok(index)
    }

    fn parse_bitfield(&self, bytes: Vec<u8>) -> Result<Bitfield, PeerError> {
        let piece_count = self.ctx.store.piece_count();
        if bytes.len() != piece_count.div_ceil(8) {
            return Err(PeerError::protocol(format!(
                "bitfield of {} bytes for {piece_count} pieces",
                bytes.len()
            )));
        }

        let mut bitfield = Bitfield::from_vec(bytes);
        if bitfield[piece_count..].any() {
            return Err(PeerError::protocol("bitfield has spare bits set"));
        }
        bitfield.truncate(piece_count);
        Ok(bitfield)
    }

    async fn update_interest<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
    ) -> Result<(), PeerError> {
        if self.am_interested {
            return Ok(());
        }

        let ours = self.ctx.store.bitfield();
        if self.peer_has.iter_ones().any(|index| !ours[index]) {
            debug!("peer has pieces we lack, sending interested");
            self.send(frames, PeerMessage::Interested).await?;
            self.am_interested = true;
        }
        Ok(())
    }

    /// requests the next block, reserving a new piece first if none is held.
    async fn request_next<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
    ) -> Result<(), PeerError> {
        if self.peer_choking {
            return Ok(());
        }

        if self.download.is_none() {
            match self.ctx.store.select_piece_for(&self.peer_has) {
                Some(index) => {
                    debug!(index, "reserved piece");
                    let length = self.ctx.store.length_of_piece(index);
                    self.download = Some(PieceDownload::new(index, length));
                }
                None => {
                    if self.am_interested && self.ctx.store.is_complete() {
                        info!("nothing left to download, sending not interested");
                        self.send(frames, PeerMessage::NotInterested).await?;
                        self.am_interested = false;
                    }
                    return Ok(());
                }
            }
        }

        let Some((index, (begin, length))) = self
            .download
            .as_mut()
            .and_then(|download| Some((download.index(), download.next_request()?)))
        else {
            return Ok(());
        };

        trace!(index, begin, length, "requesting block");
        self.send(
            frames,
            PeerMessage::Request {
                index: index as u32,
                begin,
                length,
            },
        )
        .await
    }

    /// a choked connection can't finish its piece, so the reservation and whatever was received
    /// of it are dropped for another connection to pick up.
    async fn give_back_piece(&mut self) {
        let Some(download) = self.download.take() else {
            return;
        };

        let index = download.index();
        debug!(index, "choked while holding a piece, releasing it");
        self.ctx.store.release(index);
        self.alert(PeerAlerts::PieceReleased {
            index,
            from: self.peer_addr,
        })
        .await;
    }

    async fn on_block<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
        index: u32,
        begin: BlockOffset,
        block: Bytes,
    ) -> Result<(), PeerError> {
        let Some(download) = self
            .download
            .as_mut()
            .filter(|download| download.expects(index, begin, block.len()))
        else {
            debug!(index, begin, "dropping unsolicited block");
            return Ok(());
        };

        download.append(&block);
        if download.is_done() {
            if let Some(download) = self.download.take() {
                self.store_piece(download).await?;
            }
        }

        self.request_next(frames).await
    }

    async fn store_piece(&mut self, download: PieceDownload) -> Result<(), PeerError> {
        let (index, piece) = download.into_piece();

        match self.ctx.store.write_piece(index, &piece).await {
            Ok(()) => {
                info!(index, "piece verified");
                self.alert(PeerAlerts::PieceVerified {
                    index,
                    from: self.peer_addr,
                })
                .await;
                Ok(())
            }
            Err(StoreError::Integrity(_)) => {
                warn!(index, "piece failed verification, releasing it");
                self.ctx.store.release(index);
                Ok(())
            }
            Err(err) => {
                self.ctx.store.release(index);
                Err(err.into())
            }
        }
    }

    fn queue_upload(&mut self, request: BlockRequest) {
        let store = &self.ctx.store;
        let end = request.begin as u64 + request.length as u64;

        if self.am_choking {
            debug!(?request, "ignoring request while choking");
        } else if request.length == 0
            || request.length > BLOCK_SIZE
            || end > store.length_of_piece(request.index) as u64
        {
            debug!(?request, "ignoring out of bounds request");
        } else if self.uploads.len() >= self.ctx.config.max_queued_uploads {
            debug!(?request, "upload queue full, ignoring request");
        } else if !store.is_verified(request.index) {
            debug!(?request, "ignoring request for a piece we don't have");
        } else {
            self.uploads.push_back(request);
        }
    }

    async fn serve_upload<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
    ) -> Result<(), PeerError> {
        let Some(request) = self.uploads.pop_front() else {
            return Ok(());
        };

        let cached = self
            .cached_piece
            .as_ref()
            .filter(|(index, _)| *index == request.index)
            .map(|(_, piece)| piece.clone());

        let piece = match cached {
            Some(piece) => piece,
            None => match self.ctx.store.read_piece(request.index).await {
                Ok(piece) => {
                    self.cached_piece = Some((request.index, piece.clone()));
                    piece
                }
                Err(StoreError::Integrity(index)) => {
                    warn!(index, "piece on disk is corrupt, dropping request");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            },
        };

        let start = request.begin as usize;
        let block = piece.slice(start..start + request.length as usize);
        trace!(?request, "serving block");
        self.send(
            frames,
            PeerMessage::Piece {
                index: request.index as u32,
                begin: request.begin,
                block,
            },
        )
        .await
    }

    async fn on_extended<S: PeerStream>(
        &mut self,
        frames: &mut PeerFrames<S>,
        id: u8,
        payload: Bytes,
    ) -> Result<(), PeerError> {
        if id == EXTENSION_HANDSHAKE_ID {
            match self.ctx.registry.negotiate(&payload) {
                Ok(table) => {
                    debug!(?table, "extension handshake received");
                    self.extensions = Some(table);
                }
                Err(err) => warn!(%err, "ignoring malformed extension handshake"),
            }
            return Ok(());
        }

        let Some(table) = &self.extensions else {
            debug!(id, "extension message before extension handshake");
            return Ok(());
        };

        match table.dispatch(self.peer_addr, id, &payload) {
            Some(Ok(Some((remote_id, reply)))) => {
                self.send(
                    frames,
                    PeerMessage::Extended {
                        id: remote_id,
                        payload: reply,
                    },
                )
                .await
            }
            Some(Ok(None)) => Ok(()),
            Some(Err(err)) => Err(err),
            None => {
                debug!(id, "message for an extension we didn't negotiate");
                Ok(())
            }
        }
    }
}

async fn request_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::test_support::single_file_torrent;
    use crate::metainfo::TorrentMetadata;
    use crate::peer_protocol::extension::ExtensionHandler;
    use crate::piece_store::{PieceState, Priority};
    use crate::torrent::InfoHash;
    use rstest::rstest;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::DuplexStream;
    use tokio_test::io::Builder;

    const PIECE_LENGTH: usize = 32768;

    fn content() -> Vec<u8> {
        (0..PIECE_LENGTH + 1000).map(|i| (i % 253) as u8).collect()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    async fn open_store(dir: &TempDir, seeded: bool) -> Arc<PieceStore> {
        let torrent = single_file_torrent("shared.bin", PIECE_LENGTH, &content());
        if seeded {
            tokio::fs::write(dir.path().join("shared.bin"), content())
                .await
                .unwrap();
        }
        let metainfo =
            TorrentMetadata::from_bytes(&torrent, dir.path(), PeerId::with_random_suffix())
                .unwrap();
        Arc::new(PieceStore::open_on_disk(Arc::new(metainfo)).await.unwrap())
    }

    struct Harness {
        connection: PeerConnection,
        alerts_rx: mpsc::Receiver<PeerAlerts>,
        commands_tx: mpsc::Sender<PeerCommands>,
        piece_released: Arc<Notify>,
        cancel: CancellationToken,
    }

    fn harness(store: Arc<PieceStore>, config: Config) -> Harness {
        harness_with(store, config, ExtensionRegistry::new())
    }

    fn harness_with(
        store: Arc<PieceStore>,
        config: Config,
        registry: ExtensionRegistry,
    ) -> Harness {
        let (alerts_tx, alerts_rx) = mpsc::channel(16);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let piece_released = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let ctx = ConnectionContext {
            store,
            registry: Arc::new(registry),
            config: Arc::new(config),
            alerts_tx,
            piece_released: piece_released.clone(),
            cancel: cancel.clone(),
        };

        Harness {
            connection: PeerConnection::new(addr(), ctx, commands_rx),
            alerts_rx,
            commands_tx,
            piece_released,
            cancel,
        }
    }

    /// answers every message with the same payload.
    struct Echo;

    impl ExtensionHandler for Echo {
        fn name(&self) -> &str {
            "sw_echo"
        }

        fn on_message(&self, _: SocketAddr, payload: &[u8]) -> Result<Option<Bytes>, PeerError> {
            Ok(Some(Bytes::copy_from_slice(payload)))
        }
    }

    /// the remote end of a connection, driven by hand.
    struct FakePeer {
        frames: PeerFrames<DuplexStream>,
    }

    impl FakePeer {
        async fn accept(mut stream: DuplexStream, info_hash: InfoHash) -> Self {
            let mut theirs = [0; HANDSHAKE_LEN];
            stream.read_exact(&mut theirs).await.unwrap();
            let ours = PeerHandshake::new(info_hash, PeerId::with_random_suffix());
            stream.write_all(&ours.into_bytes()).await.unwrap();

            let mut peer = Self {
                frames: codec::upgrade_stream(stream),
            };
            assert!(matches!(peer.recv().await, PeerMessage::Bitfield(_)));
            assert_eq!(peer.recv().await, PeerMessage::Interested);
            assert!(matches!(
                peer.recv().await,
                PeerMessage::Extended { id: 0, .. }
            ));
            peer
        }

        async fn recv(&mut self) -> PeerMessage {
            loop {
                match self.frames.next().await {
                    Some(Ok(Some(msg))) => return msg,
                    Some(Ok(None)) => continue,
                    other => panic!("expected a message, got {other:?}"),
                }
            }
        }

        async fn send(&mut self, msg: PeerMessage) {
            self.frames.send(msg).await.unwrap();
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_handshake_mismatch_leaves_no_state() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false).await;
        let metainfo = store.metainfo().clone();
        let Harness { mut connection, .. } = harness(store, Config::default());

        let ours = PeerHandshake::new(metainfo.info_hash, metainfo.peer_id.clone());
        let theirs = PeerHandshake::new(InfoHash::new([9; 20]), PeerId::with_random_suffix());
        let mut stream = Builder::new()
            .write(&ours.into_bytes())
            .read(&theirs.into_bytes())
            .build();

        let err = connection.handshake(&mut stream).await.unwrap_err();

        assert!(matches!(err, PeerError::InfoHashMismatch));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.peer_id().is_none());
        assert!(connection.extensions().is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_handshake_records_peer() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false).await;
        let metainfo = store.metainfo().clone();
        let Harness { mut connection, .. } = harness(store, Config::default());

        let remote_id = PeerId::with_random_suffix();
        let ours = PeerHandshake::new(metainfo.info_hash, metainfo.peer_id.clone());
        let theirs = PeerHandshake::new(metainfo.info_hash, remote_id.clone());
        let mut stream = Builder::new()
            .write(&ours.into_bytes())
            .read(&theirs.into_bytes())
            .build();

        connection.handshake(&mut stream).await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.peer_id(), Some(&remote_id));
    }

    #[rstest]
    #[tokio::test]
    async fn test_two_peers_exchange_a_torrent() {
        let (seeder_dir, leecher_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let seeder_store = open_store(&seeder_dir, true).await;
        let leecher_store = open_store(&leecher_dir, false).await;
        assert_eq!(seeder_store.bitfield().iter().by_vals().collect::<Vec<_>>(), [true, true]);
        assert_eq!(leecher_store.bitfield().iter().by_vals().collect::<Vec<_>>(), [false, false]);

        let seeder = harness(seeder_store, Config::default());
        let mut leecher = harness(leecher_store.clone(), Config::default());

        let (a, b) = tokio::io::duplex(1 << 16);
        let seeder_task = tokio::spawn(seeder.connection.run(a));
        let leecher_task = tokio::spawn(leecher.connection.run(b));

        let mut verified = Vec::new();
        while verified.len() < 2 {
            match time::timeout(Duration::from_secs(10), leecher.alerts_rx.recv()).await {
                Ok(Some(PeerAlerts::PieceVerified { index, .. })) => verified.push(index),
                other => panic!("expected a verified piece, got {other:?}"),
            }
        }
        seeder.cancel.cancel();
        leecher.cancel.cancel();

        let closed = leecher_task.await.unwrap();
        seeder_task.await.unwrap();

        verified.sort();
        assert_eq!(verified, vec![0, 1]);
        assert!(closed.held_piece.is_none());
        assert!(closed.peer_id.is_some());
        assert_eq!(leecher_store.bitfield().iter().by_vals().collect::<Vec<_>>(), [true, true]);
        assert_eq!(leecher_store.length_of_piece(1), 1000);

        let downloaded = tokio::fs::read(leecher_dir.path().join("shared.bin")).await.unwrap();
        let seeded = tokio::fs::read(seeder_dir.path().join("shared.bin")).await.unwrap();
        assert_eq!(downloaded, seeded);
        drop(leecher.commands_tx);
        drop(seeder.commands_tx);
    }

    #[rstest]
    #[tokio::test]
    async fn test_cancel_suppresses_pending_upload() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, true).await;
        let info_hash = store.metainfo().info_hash;
        let seeder = harness(store, Config::default());

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(seeder.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;

        peer.send(PeerMessage::Interested).await;
        assert_eq!(peer.recv().await, PeerMessage::Unchoke);

        let first = (0, 0, BLOCK_SIZE);
        peer.frames
            .feed(PeerMessage::Request {
                index: first.0,
                begin: first.1,
                length: first.2,
            })
            .await
            .unwrap();
        peer.frames
            .feed(PeerMessage::Cancel {
                index: first.0,
                begin: first.1,
                length: first.2,
            })
            .await
            .unwrap();
        peer.frames
            .feed(PeerMessage::Request {
                index: 0,
                begin: BLOCK_SIZE,
                length: BLOCK_SIZE,
            })
            .await
            .unwrap();
        SinkExt::<PeerMessage>::flush(&mut peer.frames).await.unwrap();

        match peer.recv().await {
            PeerMessage::Piece { index, begin, block } => {
                assert_eq!((index, begin), (0, BLOCK_SIZE));
                assert_eq!(block[..], content()[BLOCK_SIZE as usize..2 * BLOCK_SIZE as usize]);
            }
            other => panic!("expected a piece, got {other:?}"),
        }

        seeder.cancel.cancel();
        assert!(task.await.unwrap().error.is_none());
        drop(seeder.commands_tx);
    }

    #[rstest]
    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false).await;
        store.set_priority(1, Priority::High);
        let info_hash = store.metainfo().info_hash;
        let config = Config {
            request_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let leecher = harness(store.clone(), config);

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(leecher.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;

        // nothing was requested, so this block is dropped without consequence.
        peer.send(PeerMessage::Piece {
            index: 1,
            begin: 0,
            block: Bytes::from(vec![0; 1000]),
        })
        .await;
        peer.send(PeerMessage::Bitfield(vec![0b1100_0000])).await;
        peer.send(PeerMessage::Unchoke).await;

        let requested = PeerMessage::Request {
            index: 1,
            begin: 0,
            length: 1000,
        };
        assert_eq!(peer.recv().await, requested);

        // a choke gives the piece back, the next unchoke reserves it again.
        peer.send(PeerMessage::Choke).await;
        peer.send(PeerMessage::Unchoke).await;
        assert_eq!(peer.recv().await, requested);

        let closed = task.await.unwrap();
        assert!(matches!(closed.error, Some(PeerError::Timeout)));
        assert_eq!(closed.held_piece, Some(1));
        assert_eq!(
            store.state_of(1),
            Some(PieceState::InFlight {
                release_to: Priority::High
            })
        );

        store.release(1);
        assert_eq!(store.state_of(1), Some(PieceState::Queued(Priority::High)));
        drop(leecher.commands_tx);
    }

    #[rstest]
    #[tokio::test]
    async fn test_choke_gives_back_reserved_piece() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false).await;
        let info_hash = store.metainfo().info_hash;
        let config = Config {
            request_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let mut leecher = harness(store.clone(), config);

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(leecher.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;

        peer.send(PeerMessage::Bitfield(vec![0b1000_0000])).await;
        peer.send(PeerMessage::Unchoke).await;
        assert!(matches!(peer.recv().await, PeerMessage::Request { index: 0, .. }));
        assert!(matches!(store.state_of(0), Some(PieceState::InFlight { .. })));

        peer.send(PeerMessage::Choke).await;
        let released = time::timeout(Duration::from_secs(5), leecher.alerts_rx.recv()).await;
        assert_eq!(
            released.unwrap(),
            Some(PeerAlerts::PieceReleased {
                index: 0,
                from: addr()
            })
        );
        assert_eq!(store.state_of(0), Some(PieceState::Queued(Priority::Low)));

        // staying choked past the request timeout is not a failure, nothing is outstanding.
        time::sleep(Duration::from_millis(500)).await;
        assert!(!task.is_finished());

        leecher.cancel.cancel();
        let closed = task.await.unwrap();
        assert!(closed.error.is_none());
        assert!(closed.held_piece.is_none());
        drop(leecher.commands_tx);
    }

    #[rstest]
    #[tokio::test]
    async fn test_released_piece_wakes_idle_connection() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false).await;
        let info_hash = store.metainfo().info_hash;
        let leecher = harness(store.clone(), Config::default());

        // another connection holds the only piece this peer has.
        store.set_priority(0, Priority::High);
        assert_eq!(store.select_piece_for(&Bitfield::repeat(true, 2)), Some(0));

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(leecher.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;
        peer.send(PeerMessage::Bitfield(vec![0b1000_0000])).await;
        peer.send(PeerMessage::Unchoke).await;
        // answered only once the unchoke before it was handled.
        peer.send(PeerMessage::Interested).await;
        assert_eq!(peer.recv().await, PeerMessage::Unchoke);

        store.release(0);
        leecher.piece_released.notify_one();
        assert!(matches!(peer.recv().await, PeerMessage::Request { index: 0, .. }));

        leecher.cancel.cancel();
        assert_eq!(task.await.unwrap().held_piece, Some(0));
        drop(leecher.commands_tx);
    }

    #[rstest]
    #[tokio::test]
    async fn test_upload_queue_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, true).await;
        let info_hash = store.metainfo().info_hash;
        let config = Config {
            max_queued_uploads: 2,
            ..Config::default()
        };
        let seeder = harness(store, config);

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(seeder.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;

        peer.send(PeerMessage::Interested).await;
        assert_eq!(peer.recv().await, PeerMessage::Unchoke);

        // the empty request is ignored, then only the first two of the rest fit in the queue.
        for (index, begin, length) in [
            (0, 0, 0),
            (0, 0, BLOCK_SIZE),
            (0, BLOCK_SIZE, BLOCK_SIZE),
            (1, 0, 1000),
            (0, 0, 10),
        ] {
            peer.frames
                .feed(PeerMessage::Request {
                    index,
                    begin,
                    length,
                })
                .await
                .unwrap();
        }
        SinkExt::<PeerMessage>::flush(&mut peer.frames).await.unwrap();

        let mut served = Vec::new();
        for _ in 0..2 {
            match peer.recv().await {
                PeerMessage::Piece {
                    index,
                    begin,
                    block,
                } => served.push((index, begin, block.len())),
                other => panic!("expected a piece, got {other:?}"),
            }
        }
        assert_eq!(
            served,
            vec![(0, 0, BLOCK_SIZE as usize), (0, BLOCK_SIZE, BLOCK_SIZE as usize)]
        );

        // the queue drained, so a new request is served next.
        peer.send(PeerMessage::Request {
            index: 1,
            begin: 0,
            length: 500,
        })
        .await;
        match peer.recv().await {
            PeerMessage::Piece { index, begin, block } => {
                assert_eq!((index, begin), (1, 0));
                assert_eq!(block[..], content()[PIECE_LENGTH..PIECE_LENGTH + 500]);
            }
            other => panic!("expected a piece, got {other:?}"),
        }

        seeder.cancel.cancel();
        assert!(task.await.unwrap().error.is_none());
        drop(seeder.commands_tx);
    }

    #[rstest]
    #[tokio::test]
    async fn test_extension_messages_are_dispatched() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false).await;
        let info_hash = store.metainfo().info_hash;
        let mut registry = ExtensionRegistry::new();
        let local_id = registry.register(Arc::new(Echo)).unwrap();
        let leecher = harness_with(store, Config::default(), registry);

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(leecher.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;

        // a broken handshake is ignored, the connection stays up for the next one.
        peer.send(PeerMessage::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: Bytes::from_static(b"d1:m"),
        })
        .await;
        // keys out of order, as some clients send them.
        peer.send(PeerMessage::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: Bytes::from_static(b"d1:md11:ut_metadatai3e7:sw_echoi5eee"),
        })
        .await;
        peer.send(PeerMessage::Extended {
            id: local_id,
            payload: Bytes::from_static(b"ping"),
        })
        .await;

        assert_eq!(
            peer.recv().await,
            PeerMessage::Extended {
                id: 5,
                payload: Bytes::from_static(b"ping")
            }
        );

        leecher.cancel.cancel();
        assert!(task.await.unwrap().error.is_none());
        drop(leecher.commands_tx);
    }

    #[rstest]
    #[case::have_out_of_range(PeerMessage::Have(2))]
    #[case::bitfield_too_long(PeerMessage::Bitfield(vec![0xC0, 0]))]
    #[case::bitfield_spare_bits(PeerMessage::Bitfield(vec![0xE0]))]
    #[case::request_out_of_range(PeerMessage::Request { index: 7, begin: 0, length: 1 })]
    #[tokio::test]
    async fn test_protocol_violations_close_connection(#[case] msg: PeerMessage) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false).await;
        let info_hash = store.metainfo().info_hash;
        let leecher = harness(store, Config::default());

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(leecher.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;
        peer.send(msg).await;

        let closed = task.await.unwrap();
        assert!(matches!(closed.error, Some(PeerError::Protocol(_))));
        assert!(closed.held_piece.is_none());
        drop(leecher.commands_tx);
    }

    #[rstest]
    #[tokio::test]
    async fn test_have_command_is_forwarded() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, true).await;
        let info_hash = store.metainfo().info_hash;
        let seeder = harness(store, Config::default());

        let (a, b) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(seeder.connection.run(a));
        let mut peer = FakePeer::accept(b, info_hash).await;

        peer.send(PeerMessage::Bitfield(vec![0b0100_0000])).await;
        // the peer has piece 1 already, only piece 0 is announced.
        seeder.commands_tx.send(PeerCommands::Have(1)).await.unwrap();
        seeder.commands_tx.send(PeerCommands::Have(0)).await.unwrap();
        assert_eq!(peer.recv().await, PeerMessage::Have(0));

        drop(seeder.commands_tx);
        assert!(task.await.unwrap().error.is_none());
    }
}
