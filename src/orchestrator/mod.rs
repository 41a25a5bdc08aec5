use crate::config::Config;
use crate::peer_protocol::extension::ExtensionRegistry;
use crate::peer_protocol::PeerError;
use crate::peers::{
    ClosedConnection, ConnectionContext, PeerAlerts, PeerCommands, PeerConnection, PeerStream,
    PieceIndex,
};
use crate::piece_store::{PieceStore, StoreError};
use crate::prelude::*;
use anyhow::Context;
use crossbeam_skiplist::SkipMap;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("outbound connection limit reached ({0} open)")]
    CapacityReached(usize),

    #[error("download complete, no outbound connections needed")]
    NothingToDownload,

    #[error("orchestrator stopped")]
    Stopped,
}

#[derive(Debug)]
struct PeerEntry {
    commands_tx: mpsc::Sender<PeerCommands>,
    piece_released: Arc<Notify>,
    inbound: bool,
}

type Connections = Arc<SkipMap<SocketAddr, PeerEntry>>;

/// intake for candidate peer addresses, held by whatever discovers peers.
#[derive(Debug, Clone)]
pub struct DiscoveryFeed {
    tx: mpsc::Sender<SocketAddr>,
}

impl DiscoveryFeed {
    const BUFFER_SIZE: usize = 64;

    /// the feed and the receiving end to hand to `Orchestrator::start`.
    pub fn channel() -> (Self, mpsc::Receiver<SocketAddr>) {
        let (tx, rx) = mpsc::channel(Self::BUFFER_SIZE);
        (Self { tx }, rx)
    }

    pub async fn peer_discovered(&self, peer_addr: SocketAddr) -> Result<(), ConnectError> {
        self.tx
            .send(peer_addr)
            .await
            .map_err(|_| ConnectError::Stopped)
    }
}

/// owns the piece store and every live connection of one torrent.
pub struct Orchestrator {
    store: Arc<PieceStore>,
    config: Arc<Config>,
    registry: Arc<ExtensionRegistry>,
    connections: Connections,
    tasks: JoinSet<ClosedConnection>,
    // discovered while at the connection cap, tried as connections close.
    candidates: VecDeque<SocketAddr>,
    alerts_tx: mpsc::Sender<PeerAlerts>,
    alerts_rx: mpsc::Receiver<PeerAlerts>,
    cancel: CancellationToken,
}

impl Orchestrator {
    const ALERTS_BUFFER_SIZE: usize = 64;
    const COMMANDS_BUFFER_SIZE: usize = 32;

    pub fn new(store: Arc<PieceStore>, config: Config, registry: ExtensionRegistry) -> Self {
        let (alerts_tx, alerts_rx) = mpsc::channel(Self::ALERTS_BUFFER_SIZE);

        Self {
            store,
            config: Arc::new(config),
            registry: Arc::new(registry),
            connections: Arc::new(SkipMap::new()),
            tasks: JoinSet::new(),
            candidates: VecDeque::new(),
            alerts_tx,
            alerts_rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn progress(&self) -> f64 {
        self.store.progress()
    }

    fn outbound_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !entry.value().inbound)
            .count()
    }

    /// opens an outbound connection unless the peer is known, the cap is hit or there is nothing
    /// left to download.
    #[instrument(name = "connect to peer", level = "info", skip(self))]
    pub fn connect(&mut self, peer_addr: SocketAddr) -> Result<(), ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::Stopped);
        }
        if self.connections.contains_key(&peer_addr) {
            return Err(ConnectError::AlreadyConnected(peer_addr));
        }
        if self.store.is_complete() {
            return Err(ConnectError::NothingToDownload);
        }
        let outbound = self.outbound_count();
        if outbound >= self.config.max_outbound_connections {
            return Err(ConnectError::CapacityReached(outbound));
        }

        info!("connecting to peer");
        let connect_timeout = self.config.connect_timeout;
        self.spawn_connection(peer_addr, false, async move {
            let stream = time::timeout(connect_timeout, TcpStream::connect(peer_addr))
                .await
                .map_err(|_| PeerError::Timeout)??;
            Ok::<_, PeerError>(stream)
        });
        Ok(())
    }

    /// takes over a connection the peer opened to us. these don't count toward the cap.
    pub fn accept(&mut self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::Stopped);
        }
        if self.connections.contains_key(&peer_addr) {
            return Err(ConnectError::AlreadyConnected(peer_addr));
        }

        info!(%peer_addr, "accepted peer");
        self.spawn_connection(peer_addr, true, async move { Ok::<_, PeerError>(stream) });
        Ok(())
    }

    fn spawn_connection<F, S>(&mut self, peer_addr: SocketAddr, inbound: bool, stream: F)
    where
        F: Future<Output = Result<S, PeerError>> + Send + 'static,
        S: PeerStream,
    {
        let (commands_tx, commands_rx) = mpsc::channel(Self::COMMANDS_BUFFER_SIZE);
        let piece_released = Arc::new(Notify::new());
        self.connections.insert(
            peer_addr,
            PeerEntry {
                commands_tx,
                piece_released: piece_released.clone(),
                inbound,
            },
        );

        let ctx = ConnectionContext {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            alerts_tx: self.alerts_tx.clone(),
            piece_released,
            cancel: self.cancel.child_token(),
        };

        self.tasks.spawn(async move {
            match stream.await {
                Ok(stream) => {
                    PeerConnection::new(peer_addr, ctx, commands_rx)
                        .run(stream)
                        .await
                }
                Err(err) => {
                    warn!(%peer_addr, %err, "could not connect to peer");
                    ClosedConnection::failed(peer_addr, err)
                }
            }
        });
    }

    fn peer_discovered(&mut self, peer_addr: SocketAddr) {
        match self.connect(peer_addr) {
            Ok(()) => {}
            Err(ConnectError::CapacityReached(_)) => {
                if !self.candidates.contains(&peer_addr) {
                    debug!(%peer_addr, "at connection cap, keeping peer for later");
                    self.candidates.push_back(peer_addr);
                }
            }
            Err(err) => debug!(%peer_addr, %err, "discovered peer skipped"),
        }
    }

    /// forgets a finished connection and gives back the piece it was downloading.
    pub fn on_connection_closed(&mut self, closed: ClosedConnection) {
        let ClosedConnection {
            peer_addr,
            held_piece,
            error,
            ..
        } = closed;
        self.connections.remove(&peer_addr);
        debug!(%peer_addr, ?error, peers = self.connections.len(), "connection removed");

        if let Some(index) = held_piece {
            self.store.release(index);
            self.wake_all(None);
        }

        while let Some(candidate) = self.candidates.pop_front() {
            match self.connect(candidate) {
                Err(ConnectError::CapacityReached(_)) => {
                    self.candidates.push_front(candidate);
                    break;
                }
                Err(ConnectError::NothingToDownload | ConnectError::Stopped) => {
                    self.candidates.clear();
                }
                _ => {}
            }
        }
    }

    /// tells every connection except `except` that we now have `index`.
    pub fn broadcast_have(&self, index: PieceIndex, except: Option<SocketAddr>) {
        let command = PeerCommands::Have(index);
        for entry in self.connections.iter() {
            if Some(*entry.key()) == except {
                continue;
            }
            // a full queue means the connection is stuck on the socket, a missed have is fine.
            if let Err(mpsc::error::TrySendError::Full(command)) =
                entry.value().commands_tx.try_send(command.clone())
            {
                warn!(peer_addr = %entry.key(), ?command, "command queue full, dropping");
            }
        }
    }

    /// lets idle connections select again after a piece went back to the store. repeated
    /// wakeups before a connection gets to it collapse into one.
    fn wake_all(&self, except: Option<SocketAddr>) {
        self.connections
            .iter()
            .filter(|entry| Some(*entry.key()) != except)
            .for_each(|entry| entry.value().piece_released.notify_one());
    }

    fn on_alert(&mut self, alert: PeerAlerts) {
        match alert {
            PeerAlerts::PieceVerified { index, from } => {
                self.broadcast_have(index, Some(from));
                if self.store.is_complete() {
                    info!("download complete");
                }
            }
            PeerAlerts::PieceReleased { index, from } => {
                debug!(index, peer_addr = %from, "piece given back");
                self.wake_all(Some(from));
            }
        }
    }

    fn log_progress(&self) {
        info!(
            progress = %format!("{:.1}%", self.progress() * 100.0),
            downloaded = self.store.downloaded(),
            session = self.store.downloaded_session(),
            peers = self.connections.len(),
            "progress"
        );
    }

    /// runs the torrent in the background until the handle is stopped.
    pub fn start(
        self,
        discovery: mpsc::Receiver<SocketAddr>,
        listener: Option<TcpListener>,
    ) -> OrchestratorHandle {
        OrchestratorHandle {
            store: self.store.clone(),
            connections: self.connections.clone(),
            cancel: self.cancel.clone(),
            task: tokio::spawn(self.run(discovery, listener)),
        }
    }

    #[instrument(name = "orchestrator", skip_all, fields(torrent = %self.store.metainfo().name))]
    async fn run(
        mut self,
        mut discovery: mpsc::Receiver<SocketAddr>,
        listener: Option<TcpListener>,
    ) -> Result<(), StoreError> {
        let mut progress = time::interval(self.config.progress_interval);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discovery_open = true;
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                peer_addr = discovery.recv(), if discovery_open => match peer_addr {
                    Some(peer_addr) => self.peer_discovered(peer_addr),
                    None => {
                        debug!("discovery feed closed");
                        discovery_open = false;
                    }
                },

                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(err) = self.accept(stream, peer_addr) {
                            debug!(%peer_addr, %err, "rejected inbound peer");
                        }
                    }
                    Err(err) => warn!(%err, "failed to accept connection"),
                },

                Some(alert) = self.alerts_rx.recv() => self.on_alert(alert),

                Some(joined) = self.tasks.join_next() => match joined {
                    Ok(closed) => self.on_connection_closed(closed),
                    Err(err) => error!(%err, "connection task failed"),
                },

                _ = progress.tick() => self.log_progress(),
            }
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> Result<(), StoreError> {
        info!(peers = self.connections.len(), "stopping");
        self.cancel.cancel();

        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(closed) = joined {
                self.on_connection_closed(closed);
            }
        }

        self.store.close().await
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// control over a started orchestrator.
pub struct OrchestratorHandle {
    store: Arc<PieceStore>,
    connections: Connections,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), StoreError>>,
}

impl OrchestratorHandle {
    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    pub fn progress(&self) -> f64 {
        self.store.progress()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// closes every connection, waits for them to finish and closes the torrent's files.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .context("orchestrator task panicked")?
            .context("failed to close torrent files")
    }
}
