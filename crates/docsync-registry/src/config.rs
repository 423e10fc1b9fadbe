//! Registry configuration

use std::time::Duration;

use docsync_service::SubscriptionId;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::scheduler::SchedulerConfig;

/// Default number of flushes per second
pub const DEFAULT_MAX_FLUSH_FREQUENCY: f64 = 10.0;

/// Default RPC timeout in milliseconds
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;

/// Registry configuration
///
/// ```toml
/// max_flush_frequency = 10.0
/// rpc_timeout_ms = 30000
/// subscription_id = "client-1"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum flushes per second
    pub max_flush_frequency: f64,
    /// Timeout applied to every RPC
    pub rpc_timeout_ms: u64,
    /// Fixed subscription ID; generated when absent
    pub subscription_id: Option<String>,
}

impl RegistryConfig {
    pub fn new(max_flush_frequency: f64, rpc_timeout: Duration) -> Self {
        Self {
            max_flush_frequency,
            rpc_timeout_ms: rpc_timeout.as_millis() as u64,
            subscription_id: None,
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_flush_frequency(mut self, max_flush_frequency: f64) -> Self {
        self.max_flush_frequency = max_flush_frequency;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_flush_frequency.is_finite() && self.max_flush_frequency > 0.0) {
            return Err(Error::Config(format!(
                "max_flush_frequency must be a positive number, got {}",
                self.max_flush_frequency
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(Error::Config("rpc_timeout_ms must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::from_frequency(self.max_flush_frequency)
    }

    pub(crate) fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
            .as_deref()
            .map(SubscriptionId::new)
            .unwrap_or_else(SubscriptionId::generate)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_flush_frequency: DEFAULT_MAX_FLUSH_FREQUENCY,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            subscription_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.scheduler().min_interval(),
            Duration::from_millis(100)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = RegistryConfig::from_toml_str(
            r#"
            max_flush_frequency = 2.0
            subscription_id = "client-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_flush_frequency, 2.0);
        assert_eq!(config.rpc_timeout_ms, DEFAULT_RPC_TIMEOUT_MS);
        assert_eq!(config.subscription_id().as_str(), "client-1");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RegistryConfig::from_toml_str("max_flush_frequency = 0.0").is_err());
        assert!(RegistryConfig::from_toml_str("rpc_timeout_ms = 0").is_err());
        assert!(RegistryConfig::from_toml_str("rpc_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_generated_subscription_ids_differ() {
        let config = RegistryConfig::default();
        assert_ne!(config.subscription_id(), config.subscription_id());
    }
}
