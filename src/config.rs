use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{CashierError, Result};
use crate::utils::get_env_with_prefix;

/// Configuration for cashier, passed explicitly to the gateway adapter,
/// the subscription manager and the webhook handler.
#[derive(Debug, Clone)]
pub struct CashierConfig {
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
    /// Default ISO currency code, lowercase (e.g. "usd").
    pub currency: String,
    pub active_policy: ActivePolicy,
    pub logging: LoggingConfig,
}

/// Settings for the live gateway adapter.
///
/// The API key is a [`SecretString`] and never appears in debug output.
#[derive(Debug)]
pub struct GatewayConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub timeout_seconds: u64,
    /// Retries for transient failures. Zero means every failure surfaces.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Settings for webhook verification.
#[derive(Debug)]
pub struct WebhookConfig {
    pub secret: SecretString,
    /// Maximum age of a signed webhook timestamp.
    pub tolerance_seconds: u64,
}

/// Which statuses still count as active.
///
/// By default `incomplete`, `incomplete_expired`, `past_due` and `unpaid`
/// subscriptions are inactive regardless of their dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActivePolicy {
    #[serde(default)]
    pub keep_incomplete_active: bool,
    #[serde(default)]
    pub keep_past_due_active: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for CashierConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            webhook: WebhookConfig::default(),
            currency: default_currency(),
            active_policy: ActivePolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: SecretString::from(String::new()),
            base_url: default_base_url(),
            timeout_seconds: 30,
            max_retries: 0,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Clone for GatewayConfig {
    fn clone(&self) -> Self {
        Self {
            api_key: SecretString::from(self.api_key.expose_secret().to_owned()),
            base_url: self.base_url.clone(),
            timeout_seconds: self.timeout_seconds,
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: SecretString::from(String::new()),
            tolerance_seconds: default_tolerance(),
        }
    }
}

impl Clone for WebhookConfig {
    fn clone(&self) -> Self {
        Self {
            secret: SecretString::from(self.secret.expose_secret().to_owned()),
            tolerance_seconds: self.tolerance_seconds,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_tolerance() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

/// Validate a secret API key format.
///
/// Accepts secret (`sk_`) and restricted (`rk_`) keys in test or live mode.
pub(crate) fn validate_api_key(key: &str) -> Result<()> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(CashierError::Config("API key cannot be empty".to_string()));
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(CashierError::Config(format!(
            "API key too short (minimum {} characters)",
            MIN_KEY_LENGTH
        )));
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(CashierError::Config(
            "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_".to_string(),
        ));
    }

    Ok(())
}

/// Builder for [`CashierConfig`] with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: CashierConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CashierConfig::default(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.gateway.api_key = SecretString::from(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway.base_url = url.into();
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.gateway.timeout_seconds = seconds;
        self
    }

    /// Retry transient gateway failures up to `retries` times.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.gateway.max_retries = retries;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.webhook.secret = SecretString::from(secret.into());
        self
    }

    pub fn with_webhook_tolerance(mut self, seconds: u64) -> Self {
        self.config.webhook.tolerance_seconds = seconds;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.config.currency = currency.into().to_lowercase();
        self
    }

    /// Treat `past_due` subscriptions as active.
    pub fn keep_past_due_subscriptions_active(mut self) -> Self {
        self.config.active_policy.keep_past_due_active = true;
        self
    }

    /// Treat `incomplete` subscriptions as active.
    pub fn keep_incomplete_subscriptions_active(mut self) -> Self {
        self.config.active_policy.keep_incomplete_active = true;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Load configuration from environment variables with CASHIER_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(key) = get_env_with_prefix("STRIPE_SECRET") {
            self.config.gateway.api_key = SecretString::from(key);
        }
        if let Some(url) = get_env_with_prefix("STRIPE_BASE_URL") {
            self.config.gateway.base_url = url;
        }
        if let Some(timeout) = get_env_with_prefix("STRIPE_TIMEOUT") {
            if let Ok(seconds) = timeout.parse() {
                self.config.gateway.timeout_seconds = seconds;
            }
        }
        if let Some(retries) = get_env_with_prefix("STRIPE_MAX_RETRIES") {
            if let Ok(retries) = retries.parse() {
                self.config.gateway.max_retries = retries;
            }
        }
        if let Some(secret) = get_env_with_prefix("STRIPE_WEBHOOK_SECRET") {
            self.config.webhook.secret = SecretString::from(secret);
        }
        if let Some(tolerance) = get_env_with_prefix("STRIPE_WEBHOOK_TOLERANCE") {
            if let Ok(seconds) = tolerance.parse() {
                self.config.webhook.tolerance_seconds = seconds;
            }
        }
        if let Some(currency) = get_env_with_prefix("CURRENCY") {
            self.config.currency = currency.to_lowercase();
        }
        if let Some(keep) = get_env_with_prefix("KEEP_PAST_DUE_ACTIVE") {
            self.config.active_policy.keep_past_due_active = keep.parse().unwrap_or(false);
        }
        if let Some(keep) = get_env_with_prefix("KEEP_INCOMPLETE_ACTIVE") {
            self.config.active_policy.keep_incomplete_active = keep.parse().unwrap_or(false);
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The API key is set but malformed
    /// - The currency is not a three-letter code
    /// - The webhook tolerance or gateway timeout is zero
    /// - The log level is unknown
    pub fn build(self) -> Result<CashierConfig> {
        let key = self.config.gateway.api_key.expose_secret();
        if !key.is_empty() {
            validate_api_key(key)?;
        }

        let currency = &self.config.currency;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(CashierError::Config(format!(
                "Invalid currency code: {}. Must be a three-letter ISO code",
                currency
            )));
        }

        if self.config.gateway.timeout_seconds == 0 {
            return Err(CashierError::Config(
                "Gateway timeout must be greater than 0".to_string(),
            ));
        }

        if self.config.webhook.tolerance_seconds == 0 {
            return Err(CashierError::Config(
                "Webhook tolerance must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(CashierError::Config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
