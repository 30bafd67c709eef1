use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "streamrelay", author, version, long_about = None)]
#[command(about = "Resilient HLS relay with segment prefetching and a persistent segment cache")]
pub struct Args {
    /// Configuration file (TOML). Defaults to ./streamrelay.toml when present
    #[arg(short, long, global = true, env = "STREAMRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of the persistent segment cache
    #[arg(long, global = true, env = "STREAMRELAY_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// JSON logs and JSON command output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server with the edge cache and background cache cleanup
    Serve {
        /// Address to bind
        #[arg(long, env = "STREAMRELAY_BIND_ADDRESS")]
        bind: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "STREAMRELAY_PORT")]
        port: Option<u16>,

        /// Origin written into rewritten playlists (e.g. https://relay.example.com)
        #[arg(long, env = "STREAMRELAY_PUBLIC_ORIGIN")]
        public_origin: Option<String>,

        /// Relay every request without the edge cache
        #[arg(long)]
        no_edge: bool,
    },

    /// Resolve a playlist to its segment timeline
    Resolve {
        /// Playlist URL (master or media)
        url: String,

        /// Relay endpoint to resolve through. An embedded relay is started when omitted
        #[arg(long, env = "STREAMRELAY_RELAY")]
        relay: Option<String>,
    },

    /// Prefetch segments for a playback position into the cache
    Prefetch {
        /// Playlist URL (master or media)
        url: String,

        /// Playback position in seconds
        #[arg(long, default_value_t = 0.0)]
        at: f64,

        /// Relay endpoint to resolve through. An embedded relay is started when omitted
        #[arg(long, env = "STREAMRELAY_RELAY")]
        relay: Option<String>,

        /// Concurrent segment downloads
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Inspect or maintain the segment cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Show entry count, size and capacity
    Stats,
    /// Delete every cached entry
    Clear,
    /// Remove expired entries and enforce the size cap
    Cleanup,
}
