//! Bot configuration
//!
//! Read from a YAML file at startup. Every field has a default, so a missing
//! file or a partial one is fine. The Discord token never lives in the file;
//! it is read from `DISCORD_TOKEN`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::tickets::{QueueSettings, ServiceSettings};

/// Default location of the configuration file
pub const CONFIG_FILE: &str = "config/ticket_warden.yaml";
/// Environment variable overriding [`CONFIG_FILE`]
pub const CONFIG_ENV: &str = "TICKET_WARDEN_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Prefix for prefix commands
    pub prefix: String,
    /// Directory holding the YAML ticket database
    pub data_dir: PathBuf,
    /// Directory for rotated log files
    pub log_dir: PathBuf,
    pub prompt_timeout_secs: u64,
    pub reminder_interval_secs: u64,
    pub reminder_min_age_secs: u64,
    pub new_ticket_cooldown_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            prompt_timeout_secs: 300,
            reminder_interval_secs: 300,
            reminder_min_age_secs: 60,
            new_ticket_cooldown_secs: 300,
        }
    }
}

impl BotConfig {
    /// Path of the configuration file, honouring the override variable
    #[must_use]
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from)
    }

    /// Load the configuration, falling back to defaults when the file does not exist
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let config: Self = serde_yaml::from_str(&contents)?;
                info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Timing settings for the ticket service
    #[must_use]
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            queue: QueueSettings {
                prompt_timeout: Duration::from_secs(self.prompt_timeout_secs),
                reminder_min_age: Duration::from_secs(self.reminder_min_age_secs),
                new_ticket_cooldown: Duration::from_secs(self.new_ticket_cooldown_secs),
            },
            reminder_interval: Duration::from_secs(self.reminder_interval_secs.max(1)),
        }
    }
}
