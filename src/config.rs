//! Sync engine configuration.
//!
//! Values come from the `local_settings` table (category `sync`), then
//! `POS_SYNC_*` environment variables (a `.env` file is honoured) override
//! them.

use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::api::{
    extract_admin_url_from_connection_string, extract_api_key_from_connection_string,
    extract_terminal_id_from_connection_string,
};
use crate::db::{self, DbState};
use crate::error::ConfigError;
use crate::queue::MAX_RETRIES;

pub const SETTINGS_CATEGORY: &str = "sync";
const ENV_PREFIX: &str = "POS_SYNC_";

const ADMIN_URL: &str = "admin_url";
const API_KEY: &str = "api_key";
const TERMINAL_ID: &str = "terminal_id";
const BATCH_SIZE: &str = "batch_size";
const MAX_RETRIES_KEY: &str = "max_retries";
const REQUEST_TIMEOUT_MS: &str = "request_timeout_ms";
const SYNC_INTERVAL_SECS: &str = "sync_interval_secs";
const CATALOG_INTERVAL_SECS: &str = "catalog_interval_secs";
const RETRY_BASE_DELAY_MS: &str = "retry_base_delay_ms";
const RETRY_MAX_DELAY_MS: &str = "retry_max_delay_ms";

const ALL_KEYS: [&str; 10] = [
    ADMIN_URL,
    API_KEY,
    TERMINAL_ID,
    BATCH_SIZE,
    MAX_RETRIES_KEY,
    REQUEST_TIMEOUT_MS,
    SYNC_INTERVAL_SECS,
    CATALOG_INTERVAL_SECS,
    RETRY_BASE_DELAY_MS,
    RETRY_MAX_DELAY_MS,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub admin_url: String,
    pub api_key: String,
    pub terminal_id: String,
    /// Queue entries replayed per drain cycle.
    pub batch_size: usize,
    pub max_retries: i64,
    pub request_timeout: Duration,
    /// Period of the background drain tick.
    pub sync_interval: Duration,
    /// Period of catalog replication.
    pub catalog_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            admin_url: String::new(),
            api_key: String::new(),
            terminal_id: String::new(),
            batch_size: 10,
            max_retries: MAX_RETRIES,
            request_timeout: Duration::from_secs(30),
            sync_interval: Duration::from_secs(15),
            catalog_interval: Duration::from_secs(300),
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(300),
        }
    }
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

impl SyncConfig {
    /// Load from settings and the environment, then validate.
    pub fn load(db: &DbState) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        {
            let conn = db.lock()?;
            for key in ALL_KEYS {
                if let Some(value) = db::get_setting(&conn, SETTINGS_CATEGORY, key)? {
                    config.set(key, &value)?;
                }
            }
        }
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.expand_connection_string();
        config.validate()?;
        debug!(
            admin_url = %config.admin_url,
            batch_size = config.batch_size,
            sync_interval_secs = config.sync_interval.as_secs(),
            "Sync configuration loaded"
        );
        Ok(config)
    }

    /// Apply `POS_SYNC_<KEY>` overrides from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        for key in ALL_KEYS {
            let name = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Some(value) = lookup(&name).filter(|v| !v.trim().is_empty()) {
                self.set(key, &value)?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &'static str, value: &str) -> Result<(), ConfigError> {
        match key {
            ADMIN_URL => self.admin_url = value.trim().to_string(),
            API_KEY => self.api_key = value.trim().to_string(),
            TERMINAL_ID => self.terminal_id = value.trim().to_string(),
            BATCH_SIZE => self.batch_size = parse(key, value)?,
            MAX_RETRIES_KEY => self.max_retries = parse(key, value)?,
            REQUEST_TIMEOUT_MS => self.request_timeout = Duration::from_millis(parse(key, value)?),
            SYNC_INTERVAL_SECS => self.sync_interval = Duration::from_secs(parse(key, value)?),
            CATALOG_INTERVAL_SECS => {
                self.catalog_interval = Duration::from_secs(parse(key, value)?)
            }
            RETRY_BASE_DELAY_MS => self.retry_base_delay = Duration::from_millis(parse(key, value)?),
            RETRY_MAX_DELAY_MS => self.retry_max_delay = Duration::from_millis(parse(key, value)?),
            _ => {}
        }
        Ok(())
    }

    /// A terminal provisioned with a connection string carries the admin URL
    /// and terminal id inside its API key.
    fn expand_connection_string(&mut self) {
        let raw = self.api_key.clone();
        if let Some(key) = extract_api_key_from_connection_string(&raw) {
            self.api_key = key;
            if self.admin_url.is_empty() {
                if let Some(url) = extract_admin_url_from_connection_string(&raw) {
                    self.admin_url = url;
                }
            }
            if self.terminal_id.is_empty() {
                if let Some(tid) = extract_terminal_id_from_connection_string(&raw) {
                    self.terminal_id = tid;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_url.trim().is_empty() {
            return Err(ConfigError::Missing(ADMIN_URL));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing(API_KEY));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: BATCH_SIZE,
                value: "0".into(),
            });
        }
        if self.max_retries < 1 {
            return Err(ConfigError::Invalid {
                key: MAX_RETRIES_KEY,
                value: self.max_retries.to_string(),
            });
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: SYNC_INTERVAL_SECS,
                value: "0".into(),
            });
        }
        if self.catalog_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: CATALOG_INTERVAL_SECS,
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Persist to `local_settings` so the next boot loads the same values.
    pub fn save(&self, db: &DbState) -> Result<(), ConfigError> {
        let conn = db.lock()?;
        let values = [
            (ADMIN_URL, self.admin_url.clone()),
            (API_KEY, self.api_key.clone()),
            (TERMINAL_ID, self.terminal_id.clone()),
            (BATCH_SIZE, self.batch_size.to_string()),
            (MAX_RETRIES_KEY, self.max_retries.to_string()),
            (REQUEST_TIMEOUT_MS, self.request_timeout.as_millis().to_string()),
            (SYNC_INTERVAL_SECS, self.sync_interval.as_secs().to_string()),
            (CATALOG_INTERVAL_SECS, self.catalog_interval.as_secs().to_string()),
            (RETRY_BASE_DELAY_MS, self.retry_base_delay.as_millis().to_string()),
            (RETRY_MAX_DELAY_MS, self.retry_max_delay.as_millis().to_string()),
        ];
        for (key, value) in values {
            db::set_setting(&conn, SETTINGS_CATEGORY, key, &value)?;
        }
        info!("Sync configuration saved");
        Ok(())
    }
}
