use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::transport::framing::DEFAULT_MAX_FRAME_SIZE;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [service]
//                    request_timeout_secs = 10
//
//   env var:         COURIER_SERVICE__REQUEST_TIMEOUT_SECS=10   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub service: ServiceFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub http: HttpFileConfig,
}

/// Messaging tunables (lives under `[service]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceFileConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_idle_stream_timeout_secs")]
    pub idle_stream_timeout_secs: u64,
    /// Exchanges per outbound stream before it is recycled. 0 keeps streams
    /// open until they fail.
    #[serde(default = "default_stream_reuse_threshold")]
    pub stream_reuse_threshold: u32,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServiceFileConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            idle_stream_timeout_secs: default_idle_stream_timeout_secs(),
            stream_reuse_threshold: default_stream_reuse_threshold(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Transport tunables (lives under `[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    /// Custom relay server. Takes precedence over the public relays.
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Use iroh's public relay network for NAT traversal (default: true).
    #[serde(default = "default_use_public_relays")]
    pub use_public_relays: bool,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            use_public_relays: default_use_public_relays(),
        }
    }
}

/// Streaming HTTP endpoint (lives under `[http]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HttpFileConfig {
    /// Address to serve the streaming endpoint on. Disabled when unset.
    #[serde(default)]
    pub bind: Option<SocketAddr>,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_ping_timeout_secs() -> u64 {
    5
}

fn default_idle_stream_timeout_secs() -> u64 {
    600
}

fn default_stream_reuse_threshold() -> u32 {
    3
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_use_public_relays() -> bool {
    true
}

/// Build the figment: defaults, then `<data_dir>/config.toml`, then `COURIER_*` env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::Figment;
    use figment::providers::{Env, Format, Serialized, Toml};

    Figment::new()
        .merge(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("COURIER_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Messaging behavior (runtime view).
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Deadline for one message or request, from the wait for the peer's
    /// sender through opening the stream to the response.
    pub request_timeout: Duration,
    /// Deadline for a whole ping exchange.
    pub ping_timeout: Duration,
    /// Inbound streams silent for this long are reset.
    pub idle_stream_timeout: Duration,
    pub stream_reuse_threshold: u32,
    pub max_frame_size: usize,
}

impl ServiceConfig {
    pub fn from_file(fc: &ServiceFileConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
            ping_timeout: Duration::from_secs(fc.ping_timeout_secs),
            idle_stream_timeout: Duration::from_secs(fc.idle_stream_timeout_secs),
            stream_reuse_threshold: fc.stream_reuse_threshold,
            max_frame_size: fc.max_frame_size,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_file(&ServiceFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub relay_url: Option<String>,
    pub use_public_relays: bool,
    /// Upper bound on a single topic message.
    pub max_topic_message: usize,
}

impl TransportConfig {
    pub fn from_file(fc: &TransportFileConfig, service: &ServiceFileConfig) -> Self {
        Self {
            relay_url: fc.relay_url.clone(),
            use_public_relays: fc.use_public_relays,
            max_topic_message: service.max_frame_size,
        }
    }
}

// =============================================================================
// Directory layout + resolved settings
// =============================================================================

#[derive(Clone, Debug)]
pub struct CourierConfig {
    pub data_dir: PathBuf,
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub http_bind: Option<SocketAddr>,
}

impl CourierConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("could not find home directory")?
                .join(".courier"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {:?}", data_dir))?;

        let fc: FileConfig = load_config(&data_dir)
            .extract()
            .context("invalid configuration")?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            service: ServiceConfig::from_file(&fc.service),
            transport: TransportConfig::from_file(&fc.transport, &fc.service),
            http_bind: fc.http.bind,
            data_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
