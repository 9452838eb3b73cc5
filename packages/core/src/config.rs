//! Store configuration
use crate::db::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Upper bound on write-back pipeline width
const MAX_SUPPORTED_CONCURRENCY: usize = 64;

/// Environment variable overriding [`StoreConfig::max_concurrent_operations`]
pub const ENV_MAX_CONCURRENCY: &str = "MIRRORSTORE_MAX_CONCURRENCY";

/// Environment variable overriding [`StoreConfig::connection_mode`]
pub const ENV_CONNECTION_MODE: &str = "MIRRORSTORE_CONNECTION_MODE";

/// Environment variable overriding [`StoreConfig::entity_key`]
pub const ENV_ENTITY_KEY: &str = "MIRRORSTORE_ENTITY_KEY";

/// How `save` relates to the write-back pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// `save` waits for every operation of the batch to finish
    #[default]
    Synchronous,
    /// `save` hands the batch to a background task; `drain` waits for it
    Asynchronous,
}

impl FromStr for ConnectionMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(ConnectionMode::Synchronous),
            "asynchronous" | "async" => Ok(ConnectionMode::Asynchronous),
            other => Err(StoreError::invalid_config(format!(
                "unknown connection mode '{}'",
                other
            ))),
        }
    }
}

/// Configuration for a mirror store instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub connection_mode: ConnectionMode,

    /// Write-back pipeline width; 1 gives strict global ordering
    pub max_concurrent_operations: usize,

    /// Payload key carrying a record's concrete entity name
    pub entity_key: String,

    /// Capacity of the store event broadcast channel
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::Synchronous,
            max_concurrent_operations: 1,
            entity_key: "classname".to_string(),
            event_capacity: 256,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    pub fn with_max_concurrent_operations(mut self, max: usize) -> Self {
        self.max_concurrent_operations = max;
        self
    }

    pub fn with_entity_key(mut self, key: impl Into<String>) -> Self {
        self.entity_key = key.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Defaults overridden by `MIRRORSTORE_*` environment variables
    pub fn from_env() -> StoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StoreResult<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_CONCURRENCY) {
            config.max_concurrent_operations = raw.trim().parse().map_err(|_| {
                StoreError::invalid_config(format!("{} must be a number, got '{}'", ENV_MAX_CONCURRENCY, raw))
            })?;
        }
        if let Some(raw) = lookup(ENV_CONNECTION_MODE) {
            config.connection_mode = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_ENTITY_KEY) {
            config.entity_key = raw.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.max_concurrent_operations == 0 {
            return Err(StoreError::invalid_config(
                "max_concurrent_operations must be greater than 0",
            ));
        }

        if self.max_concurrent_operations > MAX_SUPPORTED_CONCURRENCY {
            return Err(StoreError::invalid_config(format!(
                "max_concurrent_operations cannot exceed {}",
                MAX_SUPPORTED_CONCURRENCY
            )));
        }

        if self.entity_key.is_empty() {
            return Err(StoreError::invalid_config("entity_key cannot be empty"));
        }

        if self.event_capacity == 0 {
            return Err(StoreError::invalid_config(
                "event_capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}
