use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::WebhookError;

pub const ENVIRONMENT_VARIABLE_PREFIX: &str = "VAULT_WEBHOOK";
pub const ENVIRONMENT_VARIABLE_SEPARATOR: &str = "__";

pub const DEFAULT_ISSUER: &str = "vault-webhook";

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Signing {
    /// `iss` claim placed on outbound envelopes.
    #[validate(length(min = 1, max = 256))]
    pub issuer: String,
    /// How far in the past an envelope `iat` may be.
    #[validate(range(min = 1, max = 86_400))]
    pub freshness_window_secs: u64,
    /// How far in the future an envelope `iat` may be.
    #[validate(range(max = 3_600))]
    pub clock_skew_secs: u64,
    /// Retained keys older than this are removed by the purge sweep.
    #[validate(range(min = 1))]
    pub key_retention_secs: u64,
}

impl Default for Signing {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            freshness_window_secs: 300,
            clock_skew_secs: 30,
            key_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl Signing {
    #[must_use]
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    #[must_use]
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    #[must_use]
    pub fn key_retention(&self) -> Duration {
        Duration::from_secs(self.key_retention_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Audit {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub retention_secs: u64,
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl Audit {
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Sweep {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub interval_secs: u64,
}

impl Default for Sweep {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 3_600,
        }
    }
}

impl Sweep {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[validate(nested)]
    pub signing: Signing,
    #[validate(nested)]
    pub audit: Audit,
    #[validate(nested)]
    pub sweep: Sweep,
}

impl Settings {
    /// Parses settings from TOML, applying `VAULT_WEBHOOK__*` environment overrides,
    /// and validates the result.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Configuration`] if the TOML is malformed or a value
    /// fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self, Report<WebhookError>> {
        let environment = Environment::default()
            .prefix(ENVIRONMENT_VARIABLE_PREFIX)
            .separator(ENVIRONMENT_VARIABLE_SEPARATOR);

        let toml = File::from_str(toml_str, FileFormat::Toml);
        let settings: Self = Config::builder()
            .add_source(toml)
            .add_source(environment)
            .build()
            .and_then(|config| config.try_deserialize::<Self>())
            .change_context(WebhookError::Configuration {
                message: "Failed to parse settings".to_string(),
            })?;

        settings
            .validate()
            .change_context(WebhookError::Configuration {
                message: "Settings validation failed".to_string(),
            })?;

        Ok(settings)
    }

    /// Serializes the effective settings back to TOML.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Configuration`] if serialization fails.
    pub fn to_canonical_toml(&self) -> Result<String, Report<WebhookError>> {
        toml::to_string(self).change_context(WebhookError::Configuration {
            message: "Failed to serialize settings".to_string(),
        })
    }
}
