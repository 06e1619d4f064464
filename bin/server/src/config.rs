//! Centralized server configuration.
//!
//! Loaded via the `config` crate from an optional file named by
//! `TRIGGER_RELAY_CONFIG`, overridden by environment variables using `__` as
//! the nesting separator (`SCHEDULER__ONE_TIME_GRACE_SECONDS=90`).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use trigger_relay_events::RetentionPolicy;
use trigger_relay_scheduler::SchedulerSettings;

/// Environment variable naming an optional configuration file.
pub const CONFIG_FILE_VAR: &str = "TRIGGER_RELAY_CONFIG";

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// PostgreSQL connection URL. Without one, state is kept in memory.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn environment() -> config::Environment {
    config::Environment::default()
        .separator("__")
        .try_parsing(true)
}

impl ServerConfig {
    /// Loads configuration from the optional file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value is invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let file = std::env::var_os(CONFIG_FILE_VAR).map(PathBuf::from);
        Self::load(file.as_deref(), environment())
    }

    fn load(file: Option<&Path>, env: config::Environment) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    fn validate(&self) -> Result<(), config::ConfigError> {
        if !self.retention.is_consistent() {
            return Err(config::ConfigError::Message(format!(
                "inconsistent retention policy: archive after {} minutes, expire after {} hours, \
                 sweeps every {}s and {}s",
                self.retention.archive_after_minutes,
                self.retention.expire_after_hours,
                self.retention.archive_sweep_seconds,
                self.retention.cleanup_sweep_seconds,
            )));
        }
        Ok(())
    }
}
