//! Dispatcher configuration.
//!
//! This module defines the configuration for a dispatcher and the engine it
//! hosts, including memory limits, execution deadlines and conversion limits.

use crate::runtime::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum nesting depth for value conversion.
pub const MAX_JS_DEPTH: usize = 100;

/// Maximum total size of a converted value.
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024;

/// Configuration for a single dispatcher and its engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name of the worker thread
    pub thread_name: String,

    /// Engine memory limit in bytes (None = unlimited)
    pub memory_limit: Option<usize>,

    /// Deadline for a single work item, timer callback or job batch
    #[serde(with = "duration_ms")]
    pub execution_timeout: Option<Duration>,

    /// Maximum nesting depth when converting values
    pub max_conversion_depth: usize,

    /// Maximum bytes materialized when converting values
    pub max_conversion_bytes: usize,

    /// Log a warning when owned handles are still alive at shutdown
    pub warn_on_leaked_handles: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name: "jsrun-dispatch".to_string(),
            memory_limit: None,
            execution_timeout: None,
            max_conversion_depth: MAX_JS_DEPTH,
            max_conversion_bytes: MAX_JS_BYTES,
            warn_on_leaked_handles: true,
        }
    }
}

impl RuntimeConfig {
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_conversion_limits(mut self, max_depth: usize, max_bytes: usize) -> Self {
        self.max_conversion_depth = max_depth;
        self.max_conversion_bytes = max_bytes;
        self
    }

    pub fn with_leak_warnings(mut self, enabled: bool) -> Self {
        self.warn_on_leaked_handles = enabled;
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RuntimeConfig =
            serde_json::from_str(json).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_name.trim().is_empty() {
            return Err(RuntimeError::Config(
                "thread name cannot be empty".to_string(),
            ));
        }
        if self.memory_limit == Some(0) {
            return Err(RuntimeError::Config(
                "memory limit must be a positive number of bytes".to_string(),
            ));
        }
        if self.execution_timeout == Some(Duration::ZERO) {
            return Err(RuntimeError::Config(
                "execution timeout must be positive".to_string(),
            ));
        }
        if self.max_conversion_depth == 0 || self.max_conversion_bytes == 0 {
            return Err(RuntimeError::Config(
                "conversion limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
