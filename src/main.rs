mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use swarmwire::metainfo::TorrentMetadata;
use swarmwire::orchestrator::{DiscoveryFeed, Orchestrator};
use swarmwire::peer_protocol::extension::ExtensionRegistry;
use swarmwire::piece_store::PieceStore;
use swarmwire::prelude::*;
use swarmwire::PeerId;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .init();

    let metainfo =
        TorrentMetadata::from_file(&cli.source, &cli.save_to, PeerId::with_random_suffix()).await?;

    if cli.list_files {
        for file in &metainfo.files {
            println!("{:>12}  {}", file.length, file.path.display());
        }
        return Ok(());
    }

    info!(
        name = %metainfo.name,
        info_hash = %metainfo.info_hash,
        pieces = metainfo.piece_count(),
        size = metainfo.total_size,
        private = metainfo.private,
        "loaded torrent"
    );
    debug!(
        announce = ?metainfo.announce,
        trackers = metainfo.announce_list.len(),
        comment = ?metainfo.comment,
        created_by = ?metainfo.created_by,
        creation_date = ?metainfo.creation_date,
        "torrent details"
    );

    let store = PieceStore::open_on_disk(Arc::new(metainfo))
        .await
        .context("failed to open the torrent's files")?;

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to listen on port {}", cli.port))?;

    let (feed, discovery) = DiscoveryFeed::channel();
    let handle = Orchestrator::new(Arc::new(store), cli.config(), ExtensionRegistry::new())
        .start(discovery, Some(listener));

    for peer in &cli.peers {
        feed.peer_discovered(*peer).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!(progress = handle.progress(), "shutting down");
    handle.stop().await
}
