//! Configuration for the watcher
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/vinted-watcher/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! Runtime-mutable knobs (`query_refresh_delay`, `items_per_query`, proxy
//! lists, redeploy thresholds) live in the store's `parameters` table and are
//! re-read by their consumers each cycle; this struct only carries process
//! configuration that is fixed for the lifetime of the run.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the admin web surface to
    pub bind_addr: SocketAddr,

    /// Path to the embedded SQLite store
    pub database_path: PathBuf,

    /// Telegram bot token (env override for the `telegram_token` parameter)
    pub telegram_bot_token: Option<String>,

    /// Telegram chat id (env override for the `telegram_chat_id` parameter)
    pub telegram_chat_id: Option<String>,

    /// Hosting-provider control-plane token for the restart governor
    pub railway_token: Option<String>,

    /// Hosting-provider project id (used to discover the service id)
    pub railway_project_id: Option<String>,

    /// Hosting-provider service id (skips discovery when set)
    pub railway_service_id: Option<String>,

    /// HTTP webhook that triggers a redeploy (last resort before self-exit)
    pub railway_redeploy_webhook: Option<String>,

    /// Whether the governor may exit the process as a restart of last resort
    pub allow_emergency_exit: bool,

    /// Log level when RUST_LOG is not set
    pub log_level: String,

    /// Fixed operational thresholds
    pub tunables: Tunables,
}

/// Operational thresholds, promoted out of the code into one place.
///
/// Defaults reproduce the production values; the config file may override
/// individual fields for testing or tuning.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Errors before a token session is marked invalid
    pub max_session_errors: u32,
    /// Successful scans before a worker proactively rotates its pair
    pub rotation_scans: u32,
    /// Fresh-pair retries after a 401/403
    pub auth_retry_attempts: u32,
    /// Fixed scan cadence for priority queries (seconds)
    pub priority_refresh_secs: u64,
    /// Worker start offsets for the three priority workers (seconds)
    pub priority_stagger_secs: [u64; 3],
    /// Concurrent session creations during pool pre-warm
    pub prewarm_concurrency: usize,
    /// Concurrent proxy health checks
    pub proxy_check_concurrency: usize,
    /// Timeout for a single proxy health check
    pub proxy_check_timeout: Duration,
    /// Interval after which cached proxies are rechecked
    pub proxy_recheck_interval: Duration,
    /// Timeout for catalog API calls
    pub catalog_timeout: Duration,
    /// Timeout for the token-acquisition landing-page request
    pub token_timeout: Duration,
    /// Total error count that triggers an immediate restart, bypassing cooldown
    pub critical_total_errors: u32,
    /// Consecutive successes that reset the governor's error counters
    pub success_threshold: u32,
    /// Minimum time between governor-triggered restarts
    pub min_redeploy_interval: Duration,
    /// A counter silent for this long resets before the next error counts
    pub error_window: Duration,
    /// Stored items above this bound trigger pruning
    pub soft_item_cap: u64,
    /// Pruning deletes oldest items until the count is back at this floor
    pub item_prune_floor: u64,
    /// Ingestion consumer tick
    pub ingest_tick: Duration,
    /// Batches drained per ingestion tick
    pub max_batches_per_tick: usize,
    /// Bound for the items and notifier channels
    pub channel_capacity: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_session_errors: 5,
            rotation_scans: 5,
            auth_retry_attempts: 3,
            priority_refresh_secs: 20,
            priority_stagger_secs: [0, 7, 14],
            prewarm_concurrency: 10,
            proxy_check_concurrency: 10,
            proxy_check_timeout: Duration::from_secs(10),
            proxy_recheck_interval: Duration::from_secs(30 * 60),
            catalog_timeout: Duration::from_secs(30),
            token_timeout: Duration::from_secs(30),
            critical_total_errors: 100,
            success_threshold: 10,
            min_redeploy_interval: Duration::from_secs(3 * 60),
            error_window: Duration::from_secs(5 * 60),
            soft_item_cap: 50_000,
            item_prune_floor: 30_000,
            ingest_tick: Duration::from_millis(100),
            max_batches_per_tick: 100,
            channel_capacity: 1000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().unwrap(),
            database_path: PathBuf::from("./data/vinted-watcher.db"),
            telegram_bot_token: None,
            telegram_chat_id: None,
            railway_token: None,
            railway_project_id: None,
            railway_service_id: None,
            railway_redeploy_webhook: None,
            allow_emergency_exit: true,
            log_level: "info".to_string(),
            tunables: Tunables::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub database_path: Option<String>,
    pub log_level: Option<String>,

    /// Optional [tunables] section
    pub tunables: Option<FileTunables>,
}

/// Overridable subset of [`Tunables`]
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileTunables {
    pub max_session_errors: Option<u32>,
    pub rotation_scans: Option<u32>,
    pub priority_refresh_secs: Option<u64>,
    pub critical_total_errors: Option<u32>,
    pub success_threshold: Option<u32>,
    pub min_redeploy_interval_secs: Option<u64>,
    pub proxy_recheck_interval_secs: Option<u64>,
    pub soft_item_cap: Option<u64>,
    pub item_prune_floor: Option<u64>,
}

impl Tunables {
    fn from_file(file: Option<FileTunables>) -> Self {
        let mut tunables = Self::default();
        let Some(file) = file else {
            return tunables;
        };
        if let Some(v) = file.max_session_errors {
            tunables.max_session_errors = v;
        }
        if let Some(v) = file.rotation_scans {
            tunables.rotation_scans = v;
        }
        if let Some(v) = file.priority_refresh_secs {
            tunables.priority_refresh_secs = v;
        }
        if let Some(v) = file.critical_total_errors {
            tunables.critical_total_errors = v;
        }
        if let Some(v) = file.success_threshold {
            tunables.success_threshold = v;
        }
        if let Some(v) = file.min_redeploy_interval_secs {
            tunables.min_redeploy_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.proxy_recheck_interval_secs {
            tunables.proxy_recheck_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.soft_item_cap {
            tunables.soft_item_cap = v;
        }
        if let Some(v) = file.item_prune_floor {
            tunables.item_prune_floor = v;
        }
        tunables
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/vinted-watcher/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| {
            p.join(".config")
                .join("vinted-watcher")
                .join("config.toml")
        })
    }

    /// Load file config if it exists
    ///
    /// A broken config fails fast with a clear error rather than silently
    /// falling back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("CONFIG ERROR - failed to parse {}", path.display());
                    eprintln!("  {}", e);
                    eprintln!("  To reset, delete the file and restart.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("CONFIG ERROR - cannot read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        // Bind port: PORT env (platform-provided) > file > default 8000
        let bind_addr = match std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            Some(port) => SocketAddr::from(([0, 0, 0, 0], port)),
            None => file
                .bind_addr
                .and_then(|a| a.parse().ok())
                .unwrap_or_else(|| "0.0.0.0:8000".parse().unwrap()),
        };

        // Database path: DATABASE_URL env > file > embedded default
        let database_path = std::env::var("DATABASE_URL")
            .ok()
            .or(file.database_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/vinted-watcher.db"));

        // Log level: file > default ("info"); RUST_LOG still wins at init time
        let log_level = file.log_level.unwrap_or_else(|| "info".to_string());

        // Notifier credentials: env only here; the parameters table is the
        // fallback at the point of use
        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        let telegram_chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();

        // Restart governor credentials: env only
        let railway_token = std::env::var("RAILWAY_TOKEN").ok();
        let railway_project_id = std::env::var("RAILWAY_PROJECT_ID").ok();
        let railway_service_id = std::env::var("RAILWAY_SERVICE_ID").ok();
        let railway_redeploy_webhook = std::env::var("RAILWAY_REDEPLOY_WEBHOOK").ok();

        // Emergency exit gate: default on, explicit "0"/"false" disables
        let allow_emergency_exit = std::env::var("ALLOW_EMERGENCY_EXIT")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let tunables = Tunables::from_file(file.tunables);

        Self {
            bind_addr,
            database_path,
            telegram_bot_token,
            telegram_chat_id,
            railway_token,
            railway_project_id,
            railway_service_id,
            railway_redeploy_webhook,
            allow_emergency_exit,
            log_level,
            tunables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunables_match_production_values() {
        let t = Tunables::default();
        assert_eq!(t.max_session_errors, 5);
        assert_eq!(t.rotation_scans, 5);
        assert_eq!(t.critical_total_errors, 100);
        assert_eq!(t.success_threshold, 10);
        assert_eq!(t.min_redeploy_interval, Duration::from_secs(180));
        assert_eq!(t.proxy_recheck_interval, Duration::from_secs(1800));
        assert_eq!(t.priority_stagger_secs, [0, 7, 14]);
    }

    #[test]
    fn test_file_tunables_override_individual_fields() {
        let file = FileTunables {
            rotation_scans: Some(10),
            min_redeploy_interval_secs: Some(600),
            ..Default::default()
        };
        let t = Tunables::from_file(Some(file));
        assert_eq!(t.rotation_scans, 10);
        assert_eq!(t.min_redeploy_interval, Duration::from_secs(600));
        // Untouched fields keep their defaults
        assert_eq!(t.max_session_errors, 5);
    }
}
