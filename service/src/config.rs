use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use sse::enhanced_handler::HistorySettings;
use sse::handler::SweepThresholds;
use sse::lifecycle::LifecycleSettings;
use sse::offline::OfflineQueueSettings;
use sse::{BackendSettings, HandlerKind};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,

    /// Sets the Redis URL used for cross-instance fan-out, fleet connection
    /// counters and offline queues. When absent, the subsystem runs on the
    /// in-process backend only.
    #[arg(long, env)]
    redis_url: Option<String>,

    /// The preferred delivery backend to try first at startup.
    #[arg(
        long,
        env,
        default_value = "enhanced-shared-store",
        value_parser = clap::builder::PossibleValuesParser::new([
            "in-process", "shared-store", "enhanced-shared-store"
        ])
            .map(|s| s.parse::<HandlerKind>().unwrap()),
        )]
    pub preferred_handler: HandlerKind,

    /// Timeout in seconds for a delivery backend to initialize before the
    /// next one in the preference order is tried
    #[arg(long, env, default_value_t = 10)]
    pub handler_init_timeout_secs: u64,

    /// Seconds without activity before a connection is swept
    #[arg(long, env, default_value_t = 90)]
    pub inactivity_timeout_secs: u64,

    /// Maximum lifetime in seconds for any SSE connection
    #[arg(long, env, default_value_t = 3600)]
    pub max_connection_lifetime_secs: u64,

    /// Interval in seconds between server heartbeat frames on each stream
    #[arg(long, env, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Interval in seconds between connection-health sweeps
    #[arg(long, env, default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Chance per sweep tick of also running shared-store reconciliation
    #[arg(long, env, default_value_t = 0.1)]
    pub reconcile_probability: f64,

    /// Maximum offline-queue entries kept per user
    #[arg(long, env, default_value_t = 100)]
    pub offline_queue_max_len: usize,

    /// Hours an offline-queued event stays replayable
    #[arg(long, env, default_value_t = 24)]
    pub offline_retention_hours: i64,

    /// Events cached per type for priming newly connected clients
    #[arg(long, env, default_value_t = 10)]
    pub history_max_per_type: usize,

    /// Minutes a cached event stays usable for priming
    #[arg(long, env, default_value_t = 30)]
    pub history_expiry_minutes: i64,

    /// Seconds before the rolling metrics window resets
    #[arg(long, env, default_value_t = 3600)]
    pub metrics_reset_window_secs: u64,

    /// Suggested client reconnect delay in milliseconds, sent on the
    /// initial frame of every stream
    #[arg(long, env, default_value_t = 3000)]
    pub client_retry_ms: u64,

    /// The secret used to verify bearer tokens on the SSE and event
    /// endpoints.
    #[arg(long, env)]
    token_signing_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn redis_url(&self) -> Option<String> {
        self.redis_url.clone()
    }

    pub fn set_redis_url(mut self, redis_url: String) -> Self {
        self.redis_url = Some(redis_url);
        self
    }

    pub fn token_signing_secret(&self) -> Option<String> {
        self.token_signing_secret.clone()
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        // This could check an environment variable, or a config field
        self.runtime_env() == RustEnv::Production
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn metrics_reset_window(&self) -> Duration {
        Duration::from_secs(self.metrics_reset_window_secs)
    }

    /// Backend selection settings derived from the flat flag set.
    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            preferred: self.preferred_handler,
            redis_url: self.redis_url(),
            init_timeout: Duration::from_secs(self.handler_init_timeout_secs),
            offline: OfflineQueueSettings {
                max_len: self.offline_queue_max_len,
                retention: chrono::Duration::hours(self.offline_retention_hours),
            },
            history: HistorySettings {
                max_per_type: self.history_max_per_type,
                expiry: chrono::Duration::minutes(self.history_expiry_minutes),
            },
        }
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            thresholds: SweepThresholds {
                inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
                max_lifetime: Duration::from_secs(self.max_connection_lifetime_secs),
            },
            reconcile_probability: self.reconcile_probability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["pulse"];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    #[test]
    fn test_defaults_prefer_enhanced_backend() {
        let config = config(&[]);
        assert_eq!(config.preferred_handler, HandlerKind::EnhancedSharedStore);
        assert!(config.redis_url().is_none());
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn test_backend_settings_carry_flags_through() {
        let config = config(&[
            "--redis-url",
            "redis://127.0.0.1:6379",
            "--preferred-handler",
            "shared-store",
            "--offline-queue-max-len",
            "5",
            "--handler-init-timeout-secs",
            "3",
        ]);
        let settings = config.backend_settings();
        assert_eq!(settings.preferred, HandlerKind::SharedStore);
        assert_eq!(
            settings.redis_url.as_deref(),
            Some("redis://127.0.0.1:6379")
        );
        assert_eq!(settings.offline.max_len, 5);
        assert_eq!(settings.init_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_lifecycle_settings_carry_flags_through() {
        let config = config(&["--inactivity-timeout-secs", "45"]);
        let settings = config.lifecycle_settings();
        assert_eq!(
            settings.thresholds.inactivity_timeout,
            Duration::from_secs(45)
        );
    }

    #[test]
    fn test_runtime_env_parsing() {
        let config = config(&["--runtime-env", "production"]);
        assert!(config.is_production());
        let config = self::config(&[]);
        assert!(!config.is_production());
    }
}
