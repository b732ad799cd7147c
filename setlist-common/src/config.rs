//! Configuration loading and resolution
//!
//! Resolution order for the config file:
//! 1. Command-line argument (highest priority)
//! 2. `SETLIST_CONFIG` environment variable
//! 3. `~/.config/setlist/setlist-import.toml`
//! 4. Compiled defaults (fallback, missing file is not an error)
//!
//! Upstream credentials are always overridable from the environment so that
//! secrets do not have to live in the TOML file.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SETLIST_CONFIG";

/// Top-level configuration for the import service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub credentials: Credentials,
    pub queues: QueuesConfig,
    pub breaker: BreakerConfig,
    pub rate_limits: RateLimitsConfig,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub import: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
    pub max_connections: u32,
    /// Upper bound on retrying writes that hit `database is locked`
    pub max_lock_wait_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("setlist.db"),
            max_connections: 8,
            max_lock_wait_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5731,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Upstream API credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub ticketmaster_api_key: Option<String>,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub setlistfm_api_key: Option<String>,
}

/// Retry backoff policy for queued jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffSettings {
    /// `delay_ms * 2^(attempt - 1)`
    Exponential { delay_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl BackoffSettings {
    /// Delay before the retry following attempt number `attempts_made` (1-based)
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffSettings::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffSettings::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(16);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Token bucket applied to job dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max: u32,
    pub duration_ms: u64,
}

/// Per-queue worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum simultaneously active handlers
    pub concurrency: usize,
    pub rate_limit: Option<RateLimitSettings>,
    /// Default `max_attempts` for jobs on this queue
    pub attempts: u32,
    pub backoff: BackoffSettings,
    /// Completed job records retained for inspection
    pub keep_completed: usize,
    /// Failed job records retained for inspection
    pub keep_failed: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            rate_limit: None,
            attempts: 3,
            backoff: BackoffSettings::Exponential { delay_ms: 2000 },
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub artist_import: QueueSettings,
    pub artist_sync: QueueSettings,
    pub catalog_sync: QueueSettings,
    pub venue_sync: QueueSettings,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            artist_import: QueueSettings {
                concurrency: 3,
                ..QueueSettings::default()
            },
            artist_sync: QueueSettings {
                concurrency: 2,
                rate_limit: Some(RateLimitSettings {
                    max: 10,
                    duration_ms: 60_000,
                }),
                ..QueueSettings::default()
            },
            catalog_sync: QueueSettings {
                concurrency: 2,
                backoff: BackoffSettings::Exponential { delay_ms: 30_000 },
                ..QueueSettings::default()
            },
            venue_sync: QueueSettings {
                concurrency: 4,
                attempts: 5,
                backoff: BackoffSettings::Fixed { delay_ms: 10_000 },
                ..QueueSettings::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a probe
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
        }
    }
}

/// Token bucket for one upstream dependency
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UpstreamLimit {
    pub max: u32,
    pub duration_ms: u64,
    /// Longest a caller queues for a token before giving up
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub ticketing: UpstreamLimit,
    pub catalog: UpstreamLimit,
    pub archive: UpstreamLimit,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            ticketing: UpstreamLimit {
                max: 5,
                duration_ms: 1000,
                max_wait_ms: 10_000,
            },
            catalog: UpstreamLimit {
                max: 10,
                duration_ms: 1000,
                max_wait_ms: 10_000,
            },
            archive: UpstreamLimit {
                max: 2,
                duration_ms: 1000,
                max_wait_ms: 15_000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// TTL for upstream responses (the sync window)
    pub response_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            response_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// TTL of the status mirror in the cache
    pub cache_ttl_secs: u64,
    /// Terminal records older than this are purged
    pub retention_hours: u64,
    pub sweep_interval_secs: u64,
    /// Capacity of each status broadcast channel
    pub channel_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            retention_hours: 24 * 7,
            sweep_interval_secs: 3600,
            channel_capacity: 256,
        }
    }
}

/// Tuning of the import phases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Budget for the whole synchronous identifier phase
    pub phase1_timeout_ms: u64,
    /// Timeout of each upstream call made during the identifier phase
    pub phase1_call_timeout_ms: u64,
    /// Timeout of each upstream call in background phases
    pub call_timeout_ms: u64,
    pub event_page_size: u32,
    pub max_event_pages: u32,
    pub event_batch_size: usize,
    pub batch_concurrency: usize,
    /// Above this many events venue resolution moves to a follow-up job
    pub venue_defer_threshold: usize,
    pub venue_sync_delay_ms: u64,
    pub archive_page_limit: u32,
    pub album_page_size: u32,
    pub track_page_size: u32,
    pub max_albums: usize,
    pub setlist_show_limit: u32,
    pub setlist_song_limit: u32,
    pub artist_lock_ttl_ms: u64,
    pub artist_lock_wait_ms: u64,
    /// Upper bound of the random stagger applied to bulk follow-up jobs
    pub bulk_jitter_ms: u64,
    pub locale: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            phase1_timeout_ms: 3000,
            phase1_call_timeout_ms: 1500,
            call_timeout_ms: 10_000,
            event_page_size: 200,
            max_event_pages: 5,
            event_batch_size: 25,
            batch_concurrency: 5,
            venue_defer_threshold: 250,
            venue_sync_delay_ms: 5000,
            archive_page_limit: 2,
            album_page_size: 50,
            track_page_size: 50,
            max_albums: 200,
            setlist_show_limit: 5,
            setlist_song_limit: 15,
            artist_lock_ttl_ms: 30_000,
            artist_lock_wait_ms: 5000,
            bulk_jitter_ms: 60_000,
            locale: "en-us".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn phase1_timeout(&self) -> Duration {
        Duration::from_millis(self.phase1_timeout_ms)
    }

    pub fn phase1_call_timeout(&self) -> Duration {
        Duration::from_millis(self.phase1_call_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl ImportConfig {
    /// Resolve and load configuration
    ///
    /// An explicit `cli_path` that does not exist is an error; a missing
    /// default file only logs a warning and falls back to defaults.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(cli_path)? {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                warn!("No configuration file found, using compiled defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Environment variables win over TOML for credentials
    pub fn apply_env_overrides(&mut self) {
        let creds = &mut self.credentials;
        override_from_env(&mut creds.ticketmaster_api_key, "TICKETMASTER_API_KEY");
        override_from_env(&mut creds.spotify_client_id, "SPOTIFY_CLIENT_ID");
        override_from_env(&mut creds.spotify_client_secret, "SPOTIFY_CLIENT_SECRET");
        override_from_env(&mut creds.setlistfm_api_key, "SETLISTFM_API_KEY");
    }

    pub fn validate(&self) -> Result<()> {
        let queues = [
            ("artist_import", &self.queues.artist_import),
            ("artist_sync", &self.queues.artist_sync),
            ("catalog_sync", &self.queues.catalog_sync),
            ("venue_sync", &self.queues.venue_sync),
        ];
        for (name, settings) in queues {
            if settings.concurrency == 0 {
                return Err(Error::Config(format!("queues.{name}.concurrency must be > 0")));
            }
            if settings.attempts == 0 {
                return Err(Error::Config(format!("queues.{name}.attempts must be > 0")));
            }
            if let Some(limit) = settings.rate_limit {
                if limit.max == 0 || limit.duration_ms == 0 {
                    return Err(Error::Config(format!(
                        "queues.{name}.rate_limit needs max > 0 and duration_ms > 0"
                    )));
                }
            }
        }
        for (name, limit) in [
            ("ticketing", &self.rate_limits.ticketing),
            ("catalog", &self.rate_limits.catalog),
            ("archive", &self.rate_limits.archive),
        ] {
            if limit.max == 0 || limit.duration_ms == 0 {
                return Err(Error::Config(format!(
                    "rate_limits.{name} needs max > 0 and duration_ms > 0"
                )));
            }
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker.failure_threshold must be > 0".to_string()));
        }
        if self.import.event_batch_size == 0 || self.import.batch_concurrency == 0 {
            return Err(Error::Config(
                "import.event_batch_size and import.batch_concurrency must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_from_env(slot: &mut Option<String>, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.trim().is_empty() {
            *slot = Some(value);
        }
    }
}

/// Pick the configuration file following the documented priority
pub fn resolve_config_path(cli_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = cli_path {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(Some(path));
        }
        warn!(
            "{} points to missing file {}, ignoring",
            CONFIG_ENV_VAR,
            path.display()
        );
    }

    let user_config = dirs::config_dir().map(|d| d.join("setlist").join("setlist-import.toml"));
    Ok(user_config.filter(|p| p.exists()))
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("setlist"))
        .unwrap_or_else(|| PathBuf::from("./setlist_data"))
}
