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

//! Engine error types

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Registration-time errors surfaced by the dispatcher and the orchestrator.
///
/// Execution-time problems never show up here; they are recorded on traces.
#[derive(Debug, Error)]
pub enum EngineError {
    // Load errors
    #[error("Failed to load plugin {plugin_id}: {reason}")]
    LoadFailed { plugin_id: String, reason: String },

    #[error("Loading plugin {plugin_id} timed out after {timeout_ms}ms")]
    LoadTimeout { plugin_id: String, timeout_ms: u64 },

    #[error("No script loader configured")]
    LoaderNotConfigured,

    // Store errors
    #[error("No script store configured")]
    StoreNotConfigured,

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    #[error("No script loaded for query: {0}")]
    NoScriptLoaded(String),

    #[error("Script store error: {0}")]
    Store(String),

    // Concurrency errors
    #[error("Concurrency budget is already set")]
    ConcurrencyAlreadySet,

    #[error("Invalid concurrency budget: {0}")]
    InvalidConcurrency(usize),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Generic errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(err: crate::config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<crate::loader::StoreError> for EngineError {
    fn from(err: crate::loader::StoreError) -> Self {
        match err {
            crate::loader::StoreError::NotFound(name) => EngineError::ScriptNotFound(name),
            other => EngineError::Store(other.to_string()),
        }
    }
}
