use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Which `PredictionStore` backs the hub.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// SQLite database in `data_dir`
    Sqlite,
    /// In-process demo data, lost on restart
    Memory,
}

/// Resolved hub configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub config: String,
    pub json_logs: bool,
    pub generate_config: bool,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub store_timeout_secs: u64,
    pub store: StoreBackend,
    pub data_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            bind_address: "0.0.0.0".to_string(),
            config: "./pickem-hub.toml".to_string(),
            json_logs: false,
            generate_config: false,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_frame_bytes: 16 * 1024,
            store_timeout_secs: 10,
            store: StoreBackend::Sqlite,
            data_dir: "./data".to_string(),
            jwt_secret_file: None,
        }
    }
}

/// Pick'em real-time hub
///
/// Flags left unset fall through to env vars, the TOML file, then defaults.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "pickem-hub", version, about = "Pick'em real-time prediction hub")]
pub struct Cli {
    /// Port to listen on
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file. Only this flag selects the file; the
    /// file itself and `PICKEM_*` env vars cannot move it.
    #[arg(long, default_value = "./pickem-hub.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Seconds between heartbeat sweeps
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Seconds of silence before a connection is evicted
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,

    /// Largest accepted inbound frame, in bytes
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_bytes: Option<usize>,

    /// Deadline for each store call, in seconds
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_timeout_secs: Option<u64>,

    /// Store backend
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreBackend>,

    /// Data directory for the SQLite database
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// File holding the HS256 secret for session-token credentials
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("heartbeat_interval_secs must be greater than zero")]
    ZeroHeartbeatInterval,
    #[error("heartbeat_timeout_secs ({timeout}) must exceed heartbeat_interval_secs ({interval})")]
    TimeoutNotAboveInterval { interval: u64, timeout: u64 },
    #[error("max_frame_bytes must be greater than zero")]
    ZeroFrameLimit,
    #[error("store_timeout_secs must be greater than zero")]
    ZeroStoreTimeout,
    #[error(
        "store_timeout_secs ({store}) must be below heartbeat_timeout_secs minus \
         heartbeat_interval_secs ({slack})"
    )]
    StoreTimeoutExceedsSlack { store: u64, slack: u64 },
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PICKEM_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Cli::parse()).extract()
    }

    pub fn figment(cli: Cli) -> Figment {
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("PICKEM_"))
            .merge(Serialized::defaults(cli))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::TimeoutNotAboveInterval {
                interval: self.heartbeat_interval_secs,
                timeout: self.heartbeat_timeout_secs,
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ZeroFrameLimit);
        }
        if self.store_timeout_secs == 0 {
            return Err(ConfigError::ZeroStoreTimeout);
        }
        // A reply stuck behind a store call must not outlast the eviction window
        let slack = self.heartbeat_timeout_secs - self.heartbeat_interval_secs;
        if self.store_timeout_secs >= slack {
            return Err(ConfigError::StoreTimeoutExceedsSlack {
                store: self.store_timeout_secs,
                slack,
            });
        }
        Ok(())
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Pick'em Hub Configuration
# Place this file at ./pickem-hub.toml or specify with --config <path>
# Only the --config flag selects this file; a `config` key here or a
# PICKEM_CONFIG env var has no effect on which file is read.
# All settings can be overridden via environment variables (PICKEM_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 3001)
# port = 3001

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# ---- Heartbeat ----
# Seconds between sweeps for silent connections (default: 30)
# heartbeat_interval_secs = 30

# Seconds without any inbound frame before a connection is closed (default: 60)
# Must be greater than heartbeat_interval_secs
# heartbeat_timeout_secs = 60

# ---- Protocol ----
# Largest accepted inbound frame in bytes (default: 16384)
# max_frame_bytes = 16384

# ---- Store ----
# "sqlite" (persistent, in data_dir) or "memory" (demo data)
# store = "sqlite"

# Deadline for each store call in seconds (default: 10)
# Must be below heartbeat_timeout_secs minus heartbeat_interval_secs
# store_timeout_secs = 10

# Data directory for the SQLite database
# data_dir = "./data"

# File holding the HS256 secret (32+ bytes) used to verify session tokens.
# Token credentials are refused when unset.
# jwt_secret_file = "./data/jwt.secret"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_heartbeat_settings() {
        let zero = Config {
            heartbeat_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroHeartbeatInterval));

        let inverted = Config {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 30,
            ..Config::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::TimeoutNotAboveInterval { .. })
        ));

        let no_frames = Config {
            max_frame_bytes: 0,
            ..Config::default()
        };
        assert_eq!(no_frames.validate(), Err(ConfigError::ZeroFrameLimit));
    }

    #[test]
    fn test_validate_rejects_store_timeout_past_heartbeat_slack() {
        let slow_store = Config {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            store_timeout_secs: 30,
            ..Config::default()
        };
        assert_eq!(
            slow_store.validate(),
            Err(ConfigError::StoreTimeoutExceedsSlack { store: 30, slack: 30 })
        );

        let within = Config {
            store_timeout_secs: 29,
            ..slow_store
        };
        assert_eq!(within.validate(), Ok(()));
    }

    #[test]
    fn test_config_path_comes_only_from_cli() {
        assert!(generate_config_template().contains("Only the --config flag selects this file"));

        let cli = Cli {
            config: "./custom.toml".to_string(),
            ..Cli::default()
        };
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(r#"config = "./elsewhere.toml""#))
            .merge(Serialized::defaults(cli))
            .extract()
            .unwrap();
        assert_eq!(config.config, "./custom.toml");
    }

    #[test]
    fn test_template_leaves_defaults_untouched() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_toml_overrides_defaults_and_cli_overrides_toml() {
        let toml = r#"
            port = 4000
            store = "memory"
            heartbeat_timeout_secs = 90
        "#;
        let cli = Cli {
            port: Some(5000),
            ..Cli::default()
        };
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .merge(Serialized::defaults(cli))
            .extract()
            .unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.heartbeat_timeout_secs, 90);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }
}
