use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{cli::ServeArgs, rooms::DEFAULT_ROOM, session::DEFAULT_QUEUE_CAPACITY};

/// Runtime settings for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Reassembled uploads land in `<uploads_dir>/<room>/`.
    pub uploads_dir: PathBuf,
    /// JSON history files go here; `None` keeps history in memory only.
    pub history_dir: Option<PathBuf>,
    pub queue_capacity: usize,
    /// A connection that sends nothing for this long is dropped.
    pub idle_timeout: Duration,
    /// How long a closing session's writer may keep flushing.
    pub writer_linger: Duration,
    pub default_rooms: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 8088).into(),
            uploads_dir: PathBuf::from("uploads"),
            history_dir: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: Duration::from_secs(5 * 60),
            writer_linger: Duration::from_secs(5),
            default_rooms: vec![DEFAULT_ROOM.to_string()],
        }
    }
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            uploads_dir: args.uploads_dir,
            history_dir: args.history_dir,
            queue_capacity: args.queue_capacity,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            ..Self::default()
        }
    }
}
