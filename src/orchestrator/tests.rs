use super::*;
use crate::metainfo::test_support::single_file_torrent;
use crate::metainfo::TorrentMetadata;
use crate::piece_store::{PieceState, Priority};
use crate::torrent::{Bitfield, PeerId};
use rstest::rstest;
use std::time::Duration;
use tempfile::TempDir;

const PIECE_LENGTH: usize = 32768;

fn content() -> Vec<u8> {
    (0..PIECE_LENGTH + 4321).map(|i| (i * 31 % 256) as u8).collect()
}

async fn open_store(dir: &TempDir, seeded: bool) -> Arc<PieceStore> {
    let torrent = single_file_torrent("payload.bin", PIECE_LENGTH, &content());
    if seeded {
        tokio::fs::write(dir.path().join("payload.bin"), content())
            .await
            .unwrap();
    }
    let metainfo =
        TorrentMetadata::from_bytes(&torrent, dir.path(), PeerId::with_random_suffix()).unwrap();
    Arc::new(PieceStore::open_on_disk(Arc::new(metainfo)).await.unwrap())
}

fn orchestrator(store: Arc<PieceStore>, max_outbound_connections: usize) -> Orchestrator {
    let config = Config {
        max_outbound_connections,
        ..Config::default()
    };
    Orchestrator::new(store, config, ExtensionRegistry::new())
}

fn closed(peer_addr: SocketAddr, held_piece: Option<PieceIndex>) -> ClosedConnection {
    ClosedConnection {
        peer_addr,
        peer_id: None,
        held_piece,
        error: Some(PeerError::ConnectionClosed),
    }
}

fn peer_entry(capacity: usize) -> (PeerEntry, mpsc::Receiver<PeerCommands>, Arc<Notify>) {
    let (commands_tx, commands_rx) = mpsc::channel(capacity);
    let piece_released = Arc::new(Notify::new());
    let entry = PeerEntry {
        commands_tx,
        piece_released: piece_released.clone(),
        inbound: false,
    };
    (entry, commands_rx, piece_released)
}

async fn woken(piece_released: &Notify) -> bool {
    time::timeout(Duration::from_millis(50), piece_released.notified())
        .await
        .is_ok()
}

/// a listener that accepts at the os level but never speaks, so connections stay pending.
async fn silent_peer() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[rstest]
#[tokio::test]
async fn test_connect_dedups_and_caps() {
    let dir = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(open_store(&dir, false).await, 1);
    let (_first, first_addr) = silent_peer().await;
    let (_second, second_addr) = silent_peer().await;

    assert_eq!(orchestrator.connect(first_addr), Ok(()));
    assert_eq!(
        orchestrator.connect(first_addr),
        Err(ConnectError::AlreadyConnected(first_addr))
    );
    assert_eq!(
        orchestrator.connect(second_addr),
        Err(ConnectError::CapacityReached(1))
    );
    assert_eq!(orchestrator.connections.len(), 1);
}

#[rstest]
#[tokio::test]
async fn test_no_outbound_connections_when_complete() {
    let dir = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(open_store(&dir, true).await, 4);
    let (_peer, addr) = silent_peer().await;

    assert_eq!(orchestrator.progress(), 1.0);
    assert_eq!(orchestrator.connect(addr), Err(ConnectError::NothingToDownload));
}

#[rstest]
#[tokio::test]
async fn test_closed_connection_releases_and_promotes_candidate() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, false).await;
    store.set_priority(0, Priority::Normal);
    let mut orchestrator = orchestrator(store.clone(), 1);
    let (_first, first_addr) = silent_peer().await;
    let (_second, second_addr) = silent_peer().await;

    orchestrator.peer_discovered(first_addr);
    orchestrator.peer_discovered(second_addr);
    orchestrator.peer_discovered(second_addr);
    assert_eq!(orchestrator.candidates, [second_addr]);

    // stand in for the first connection holding piece 0.
    let held = store.select_piece_for(&Bitfield::repeat(true, 2)).unwrap();
    assert_eq!(held, 0);

    orchestrator.on_connection_closed(closed(first_addr, Some(held)));

    assert_eq!(store.state_of(0), Some(PieceState::Queued(Priority::Normal)));
    assert!(orchestrator.candidates.is_empty());
    assert!(orchestrator.connections.contains_key(&second_addr));
    assert!(!orchestrator.connections.contains_key(&first_addr));
}

#[rstest]
#[tokio::test]
async fn test_broadcast_have_skips_origin() {
    let dir = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(open_store(&dir, false).await, 4);
    let origin: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    let other: SocketAddr = "10.0.0.2:6881".parse().unwrap();

    let mut receivers = Vec::new();
    for addr in [origin, other] {
        let (entry, commands_rx, _) = peer_entry(4);
        orchestrator.connections.insert(addr, entry);
        receivers.push(commands_rx);
    }

    orchestrator.on_alert(PeerAlerts::PieceVerified {
        index: 1,
        from: origin,
    });

    assert!(receivers[0].try_recv().is_err());
    assert_eq!(receivers[1].try_recv(), Ok(PeerCommands::Have(1)));
}

#[rstest]
#[tokio::test]
async fn test_seeder_and_leecher_over_tcp() {
    let (seeder_dir, leecher_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let seeder_store = open_store(&seeder_dir, true).await;
    let leecher_store = open_store(&leecher_dir, false).await;
    assert_eq!(leecher_store.piece_count(), 2);
    assert_eq!(leecher_store.length_of_piece(1), 4321);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = listener.local_addr().unwrap();
    let (_seeder_feed, seeder_discovery) = DiscoveryFeed::channel();
    let seeder = orchestrator(seeder_store, 4).start(seeder_discovery, Some(listener));

    let (leecher_feed, leecher_discovery) = DiscoveryFeed::channel();
    let leecher = orchestrator(leecher_store, 4).start(leecher_discovery, None);
    leecher_feed.peer_discovered(seeder_addr).await.unwrap();

    time::timeout(Duration::from_secs(20), async {
        while leecher.progress() < 1.0 {
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("leecher should finish downloading");

    let leecher_store = leecher.store().clone();
    assert_eq!(leecher.connection_count(), 1);
    leecher.stop().await.unwrap();
    seeder.stop().await.unwrap();

    assert!(leecher_store.is_complete());
    assert_eq!(leecher_store.downloaded_session(), content().len() as u64);
    assert!(matches!(
        leecher_store.read_piece(0).await,
        Err(StoreError::Closed)
    ));

    let downloaded = tokio::fs::read(leecher_dir.path().join("payload.bin"))
        .await
        .unwrap();
    let seeded = tokio::fs::read(seeder_dir.path().join("payload.bin"))
        .await
        .unwrap();
    assert_eq!(downloaded, seeded);
}

#[rstest]
#[tokio::test]
async fn test_released_piece_wakes_connections_with_full_queues() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, false).await;
    let mut orchestrator = orchestrator(store.clone(), 4);
    let stuck: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    let gone: SocketAddr = "10.0.0.2:6881".parse().unwrap();

    let (entry, _commands_rx, stuck_released) = peer_entry(1);
    entry.commands_tx.try_send(PeerCommands::Have(0)).unwrap();
    orchestrator.connections.insert(stuck, entry);

    let held = store.select_piece_for(&Bitfield::repeat(true, 2)).unwrap();
    orchestrator.on_connection_closed(closed(gone, Some(held)));
    // a second release before the connection wakes up is folded into the first.
    orchestrator.on_alert(PeerAlerts::PieceReleased {
        index: held,
        from: gone,
    });

    assert!(matches!(store.state_of(held), Some(PieceState::Queued(_))));
    assert!(woken(&stuck_released).await);
    assert!(!woken(&stuck_released).await);
}

#[rstest]
#[tokio::test]
async fn test_piece_released_alert_skips_origin() {
    let dir = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(open_store(&dir, false).await, 4);
    let origin: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    let other: SocketAddr = "10.0.0.2:6881".parse().unwrap();

    let (origin_entry, _origin_rx, origin_released) = peer_entry(4);
    let (other_entry, _other_rx, other_released) = peer_entry(4);
    orchestrator.connections.insert(origin, origin_entry);
    orchestrator.connections.insert(other, other_entry);

    orchestrator.on_alert(PeerAlerts::PieceReleased {
        index: 0,
        from: origin,
    });

    assert!(woken(&other_released).await);
    assert!(!woken(&origin_released).await);
}
