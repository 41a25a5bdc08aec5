use clap::{self, ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use swarmwire::Config;
use tracing::Level;

pub mod metainfo_file_path;
use metainfo_file_path::MetainfoFilePath;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
/// a cli bittorrent (v1) client that exchanges pieces with the peers it is given.
pub struct Cli {
    #[arg(required = true)]
    /// the source for the torrent information, i.e a torrent file.
    /// torrent files must have the .torrent extention
    pub source: MetainfoFilePath,

    #[arg(default_value = ".")]
    /// directory the torrent's files are stored in.
    pub save_to: PathBuf,

    #[arg(short, long, default_value = "8860")]
    /// the port on which to listen to incoming connections.
    pub port: u16,

    #[arg(long = "peer", value_name = "ADDR")]
    /// a peer to connect to, can be given more than once.
    pub peers: Vec<SocketAddr>,

    #[arg(long, default_value_t = Config::default().max_outbound_connections)]
    /// maximum number of connections we open ourselves.
    pub max_connections: usize,

    #[arg(long, value_name = "SECS", default_value_t = Config::default().request_timeout.as_secs())]
    /// seconds to wait for a requested block before giving up on the peer.
    pub request_timeout: u64,

    #[arg(long)]
    /// print the files of the torrent and exit.
    pub list_files: bool,

    #[arg(short, long, action = ArgAction::Count)]
    /// log more, repeat for even more (-v info, -vv debug, -vvv trace).
    pub verbose: u8,
}

impl Cli {
    pub fn config(&self) -> Config {
        Config {
            max_outbound_connections: self.max_connections,
            request_timeout: Duration::from_secs(self.request_timeout),
            ..Config::default()
        }
    }

    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}
