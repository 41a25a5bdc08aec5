use std::time::Duration;

/// tunables of the engine. `Default` holds the values the binary starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// cap on connections we open ourselves, accepted connections don't count.
    pub max_outbound_connections: usize,
    /// an unanswered block request after this long fails the connection.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// a keep-alive is sent when nothing else was written for this long.
    pub keep_alive_interval: Duration,
    pub progress_interval: Duration,
    /// block requests from one peer waiting to be served, later ones are ignored.
    pub max_queued_uploads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_outbound_connections: 30,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(120),
            progress_interval: Duration::from_secs(2),
            max_queued_uploads: 250,
        }
    }
}
