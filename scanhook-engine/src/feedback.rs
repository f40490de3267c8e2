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

//! Execution feedback delivered to the host.
//!
//! Sinks are fire-and-forget: a failing sink is logged and never surfaces
//! to the hook that produced the feedback.

use crate::value::{HookCallback, HookValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const LEVEL_INFO: &str = "info";
pub const LEVEL_ERROR: &str = "error";
pub const LEVEL_STATUS_CARD: &str = "feature-status-card-data";

/// One feedback event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Whether `message` carries a serialized [`FeedbackLog`].
    pub is_message: bool,
    pub message: Vec<u8>,
    #[serde(default)]
    pub runtime_id: String,
}

/// Log line wrapped inside an [`ExecResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackLog {
    pub level: String,
    pub data: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin_id: String,
}

impl FeedbackLog {
    pub fn new(level: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            data: data.into(),
            timestamp: chrono::Utc::now().timestamp(),
            plugin_id: String::new(),
        }
    }

    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = plugin_id.into();
        self
    }

    /// Wrap the log into an [`ExecResult`].
    pub fn into_result(self, runtime_id: &str) -> Result<ExecResult, SinkError> {
        let message = serde_json::to_vec(&self).map_err(|e| SinkError(e.to_string()))?;
        Ok(ExecResult {
            is_message: true,
            message,
            runtime_id: runtime_id.to_string(),
        })
    }
}

/// Error reported by a sink.
#[derive(Debug, Error)]
#[error("Result sink error: {0}")]
pub struct SinkError(pub String);

/// Receiver of execution feedback.
pub trait ResultSink: Send + Sync {
    fn send(&self, result: ExecResult) -> Result<(), SinkError>;
}

impl<F> ResultSink for F
where
    F: Fn(ExecResult) -> Result<(), SinkError> + Send + Sync,
{
    fn send(&self, result: ExecResult) -> Result<(), SinkError> {
        self(result)
    }
}

/// Send one log line, logging instead of propagating failures.
pub fn send_log(sink: &dyn ResultSink, log: FeedbackLog, runtime_id: &str) {
    let level = log.level.clone();
    let outcome = log.into_result(runtime_id).and_then(|r| sink.send(r));
    if let Err(e) = outcome {
        tracing::warn!(level = %level, error = %e, "Failed to deliver feedback");
    }
}

/// Callable bound into a plugin so its body can emit info-level feedback.
pub fn feedback_callback(
    sink: Arc<dyn ResultSink>,
    plugin_id: impl Into<String>,
    runtime_id: impl Into<String>,
) -> HookCallback {
    let plugin_id = plugin_id.into();
    let runtime_id = runtime_id.into();
    HookCallback::new("feedback", move |args| {
        let text = args
            .iter()
            .map(HookValue::to_display_string)
            .collect::<Vec<_>>()
            .join(" ");
        send_log(
            sink.as_ref(),
            FeedbackLog::new(LEVEL_INFO, text).with_plugin(plugin_id.clone()),
            &runtime_id,
        );
        HookValue::Null
    })
}

/// Callable that publishes a status card: `status(id, data)`.
pub fn status_callback(
    sink: Arc<dyn ResultSink>,
    plugin_id: impl Into<String>,
    runtime_id: impl Into<String>,
) -> HookCallback {
    let plugin_id = plugin_id.into();
    let runtime_id = runtime_id.into();
    HookCallback::new("status", move |args| {
        let id = args.first().map(HookValue::to_display_string).unwrap_or_default();
        let data = args.get(1).map(HookValue::to_display_string).unwrap_or_default();
        let card = serde_json::json!({ "id": id, "data": data }).to_string();
        send_log(
            sink.as_ref(),
            FeedbackLog::new(LEVEL_STATUS_CARD, card).with_plugin(plugin_id.clone()),
            &runtime_id,
        );
        HookValue::Null
    })
}
