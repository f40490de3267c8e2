// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! load_timeout_ms = 10000
//! call_timeout_ms = 30000
//! max_concurrent_calls = 20
//! enable_tracing = true
//! stale_queue_size = 1000
//!
//! [mix]
//! extra_concurrency = 30
//! includes = ["*.example.com"]
//! excludes = ["static.example.com"]
//! ```

use crate::tracker::stale::DEFAULT_STALE_QUEUE_SIZE;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the hook dispatcher and its tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Budget for compiling/loading one script, in milliseconds.
    #[serde(default = "default_load_timeout")]
    pub load_timeout_ms: u64,

    /// Budget for one hook invocation. `None` or `0` disables the deadline.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Shared execution budget. `None` runs callers inline.
    #[serde(default)]
    pub max_concurrent_calls: Option<usize>,

    /// Record an execution trace per invocation.
    #[serde(default)]
    pub enable_tracing: bool,

    /// Number of terminal traces kept for historical queries. `0` selects
    /// the default; larger values are clamped to the queue maximum.
    #[serde(default = "default_stale_queue_size")]
    pub stale_queue_size: usize,

    /// Abort the hook task when its deadline passes instead of only
    /// cancelling its context.
    #[serde(default)]
    pub abort_on_timeout: bool,

    /// Traffic fan-out settings.
    #[serde(default)]
    pub mix: MixCallerConfig,
}

fn default_load_timeout() -> u64 {
    10_000
}

fn default_stale_queue_size() -> usize {
    DEFAULT_STALE_QUEUE_SIZE
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout(),
            call_timeout_ms: None,
            max_concurrent_calls: None,
            enable_tracing: false,
            stale_queue_size: default_stale_queue_size(),
            abort_on_timeout: false,
            mix: MixCallerConfig::default(),
        }
    }
}

/// Settings for the traffic fan-out orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixCallerConfig {
    /// Size of the gate for asynchronous new-site work.
    #[serde(default = "default_extra_concurrency")]
    pub extra_concurrency: usize,

    /// Fingerprint and port-scan new sites.
    #[serde(default = "default_true")]
    pub scan_port: bool,

    /// Let the fingerprint matcher reuse cached results.
    #[serde(default)]
    pub fingerprint_cache: bool,

    #[serde(default = "default_request_cache_ttl")]
    pub request_cache_ttl_secs: u64,

    #[serde(default = "default_request_cache_capacity")]
    pub request_cache_capacity: u64,

    /// Target allow-list. Empty allows everything.
    #[serde(default)]
    pub includes: Vec<String>,

    /// Target deny-list, checked after `includes`.
    #[serde(default)]
    pub excludes: Vec<String>,
}

fn default_extra_concurrency() -> usize {
    30
}

fn default_true() -> bool {
    true
}

fn default_request_cache_ttl() -> u64 {
    30 * 60
}

fn default_request_cache_capacity() -> u64 {
    10_000
}

impl Default for MixCallerConfig {
    fn default() -> Self {
        Self {
            extra_concurrency: default_extra_concurrency(),
            scan_port: true,
            fingerprint_cache: false,
            request_cache_ttl_secs: default_request_cache_ttl(),
            request_cache_capacity: default_request_cache_capacity(),
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

impl MixCallerConfig {
    pub fn request_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.request_cache_ttl_secs)
    }
}

impl EngineConfig {
    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load configuration from a `.json` or `.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Build configuration from `SCANHOOK_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            load_timeout_ms: parse_env("SCANHOOK_LOAD_TIMEOUT_MS")
                .unwrap_or(defaults.load_timeout_ms),
            call_timeout_ms: parse_env("SCANHOOK_CALL_TIMEOUT_MS"),
            max_concurrent_calls: parse_env("SCANHOOK_MAX_CONCURRENT_CALLS"),
            enable_tracing: env::var("SCANHOOK_ENABLE_TRACING")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            stale_queue_size: parse_env("SCANHOOK_STALE_QUEUE_SIZE")
                .unwrap_or(defaults.stale_queue_size),
            abort_on_timeout: env::var("SCANHOOK_ABORT_ON_TIMEOUT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            mix: MixCallerConfig {
                extra_concurrency: parse_env("SCANHOOK_EXTRA_CONCURRENCY")
                    .unwrap_or(defaults.mix.extra_concurrency),
                ..defaults.mix
            },
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Per-call deadline. `0` disables it, like an unset value.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "load_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_concurrent_calls == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_calls",
                reason: "must be greater than zero when set".into(),
            });
        }
        if self.mix.extra_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mix.extra_concurrency",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Errors that can occur in configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to read configuration: {0}")]
    Io(String),

    #[error("Unsupported configuration format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
