//! Ledger business-rule configuration.

use std::time::Duration;

use thiserror::Error;

use crate::Amount;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown config key '{0}'")]
    UnknownKey(String),
    #[error("invalid value '{value}' for config key '{key}'")]
    InvalidValue { key: String, value: String },
}

/// Immutable snapshot of the rules an operation runs under.
///
/// Each ledger operation captures one snapshot when it starts and logs its
/// `version`, so a config change never affects an operation already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub version: u32,
    pub welcome_bonus_coins: Amount,
    pub max_bill_age_days: u32,
    pub min_bill_amount: Amount,
    pub reject_duplicate_bills: bool,
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            version: 1,
            welcome_bonus_coins: Amount::whole(100),
            max_bill_age_days: 30,
            min_bill_amount: Amount::ZERO,
            reject_duplicate_bills: true,
            lock_timeout_ms: 5_000,
        }
    }
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Build a config from key/value rows, starting from the defaults.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Override a single key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();
        match key.trim() {
            "version" => self.version = value.parse().map_err(|_| invalid())?,
            "welcome_bonus_coins" => {
                let coins: Amount = value.parse().map_err(|_| invalid())?;
                if !coins.is_positive() {
                    return Err(invalid());
                }
                self.welcome_bonus_coins = coins;
            }
            "max_bill_age_days" => self.max_bill_age_days = value.parse().map_err(|_| invalid())?,
            "min_bill_amount" => {
                let minimum: Amount = value.parse().map_err(|_| invalid())?;
                if minimum.is_negative() {
                    return Err(invalid());
                }
                self.min_bill_amount = minimum;
            }
            "reject_duplicate_bills" => {
                self.reject_duplicate_bills = value.parse().map_err(|_| invalid())?
            }
            "lock_timeout_ms" => self.lock_timeout_ms = value.parse().map_err(|_| invalid())?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}
