use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use streamrelay_engine::{EngineConfig, ServerConfig};
use tracing::debug;

use crate::cli::{Args, Commands};
use crate::error::{AppError, Result};

const DEFAULT_CONFIG_FILE: &str = "streamrelay.toml";

/// Effective configuration: TOML file, then `STREAMRELAY_*` environment (through
/// clap's `env`), then command-line flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load `path`, or `./streamrelay.toml` if it exists, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    debug!("No config file, using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };

        let raw = std::fs::read_to_string(&path)?;
        let config = Self::parse(&raw).map_err(|source| AppError::Config {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply flags (and the environment variables clap read for them).
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(dir) = &args.cache_dir {
            self.engine.cache.directory = dir.clone();
        }

        match &args.command {
            Commands::Serve {
                bind,
                port,
                public_origin,
                no_edge,
            } => {
                if let Some(bind) = bind {
                    self.server.bind_address = bind.clone();
                }
                if let Some(port) = port {
                    self.server.port = *port;
                }
                if let Some(origin) = public_origin {
                    self.engine.relay.public_origin = Some(origin.clone());
                }
                if *no_edge {
                    self.engine.edge.enabled = false;
                }
            }
            Commands::Resolve { relay, .. } => self.set_relay(relay.as_deref()),
            Commands::Prefetch {
                relay, concurrency, ..
            } => {
                self.set_relay(relay.as_deref());
                if let Some(concurrency) = concurrency {
                    self.engine.queue.concurrency = (*concurrency).max(1);
                }
            }
            Commands::Cache { .. } => {}
        }
    }

    fn set_relay(&mut self, relay: Option<&str>) {
        if let Some(relay) = relay {
            self.engine.resolver.relay_endpoint = relay.to_string();
        }
    }
}
