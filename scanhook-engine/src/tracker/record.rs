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

//! A single execution trace.

use super::state::{ExecutionEvent, ExecutionStatus, InvalidTransition};
use crate::value::HookValue;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Record of one invocation of one caller.
///
/// Identity fields never change after creation. The mutable part is guarded
/// by a per-trace lock, so traces of unrelated invocations never contend.
#[derive(Debug)]
pub struct PluginExecutionTrace {
    trace_id: String,
    plugin_id: String,
    hook_name: String,
    loaded_time: DateTime<Utc>,
    // Breaks ties between traces created within the same clock tick.
    seq: u64,
    token: CancellationToken,
    state: Mutex<TraceState>,
}

#[derive(Debug)]
struct TraceState {
    status: ExecutionStatus,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    args: Vec<HookValue>,
    result: Option<HookValue>,
    error: Option<String>,
}

/// Point-in-time copy of a trace, safe to hand out and serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSnapshot {
    pub trace_id: String,
    pub plugin_id: String,
    pub hook_name: String,
    pub status: ExecutionStatus,
    pub loaded_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Option<Duration>,
    pub args: Vec<HookValue>,
    pub result: Option<HookValue>,
    pub error: Option<String>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

fn serialize_duration_ms<S: serde::Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

impl TraceSnapshot {
    /// Ordering key for "most recently loaded".
    pub(crate) fn recency(&self) -> (DateTime<Utc>, u64) {
        (self.loaded_time, self.seq)
    }
}

impl PluginExecutionTrace {
    pub(crate) fn new(
        trace_id: String,
        plugin_id: &str,
        hook_name: &str,
        token: CancellationToken,
        seq: u64,
    ) -> Self {
        Self {
            trace_id,
            plugin_id: plugin_id.to_string(),
            hook_name: hook_name.to_string(),
            loaded_time: Utc::now(),
            seq,
            token,
            state: Mutex::new(TraceState {
                status: ExecutionStatus::Pending,
                start_time: None,
                end_time: None,
                duration: None,
                args: Vec::new(),
                result: None,
                error: None,
            }),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    pub fn loaded_time(&self) -> DateTime<Utc> {
        self.loaded_time
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status
    }

    /// Cancellation token scoped to this invocation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn recency(&self) -> (DateTime<Utc>, u64) {
        (self.loaded_time, self.seq)
    }

    pub fn snapshot(&self) -> TraceSnapshot {
        let state = self.state.lock();
        TraceSnapshot {
            trace_id: self.trace_id.clone(),
            plugin_id: self.plugin_id.clone(),
            hook_name: self.hook_name.clone(),
            status: state.status,
            loaded_time: self.loaded_time,
            start_time: state.start_time,
            end_time: state.end_time,
            duration: state.duration,
            args: state.args.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
            seq: self.seq,
        }
    }

    /// Pending -> Running, recording the concrete arguments.
    pub(crate) fn start(&self, args: Vec<HookValue>) -> Result<(), InvalidTransition> {
        let mut state = self.state.lock();
        state.status = state.status.transition(ExecutionEvent::Start)?;
        state.start_time = Some(Utc::now());
        state.args = args;
        Ok(())
    }

    /// Move into a terminal status and release the invocation context.
    pub(crate) fn finish(
        &self,
        status: ExecutionStatus,
        result: Option<HookValue>,
        error: Option<String>,
    ) -> Result<(), InvalidTransition> {
        let mut state = self.state.lock();
        let event = ExecutionEvent::for_terminal(status).ok_or(InvalidTransition {
            current: state.status,
            event: ExecutionEvent::Start,
        })?;
        state.status = state.status.transition(event)?;

        let end = Utc::now();
        state.end_time = Some(end);
        state.duration = state
            .start_time
            .map(|start| (end - start).to_std().unwrap_or_default());
        state.result = result;
        state.error = error;
        drop(state);

        self.token.cancel();
        Ok(())
    }

    pub(crate) fn cancel_context(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> PluginExecutionTrace {
        PluginExecutionTrace::new("t1".into(), "p", "h", CancellationToken::new(), 0)
    }

    #[test]
    fn test_lifecycle_records_times() {
        let t = trace();
        assert_eq!(t.status(), ExecutionStatus::Pending);

        t.start(vec![HookValue::Int(1)]).unwrap();
        let snap = t.snapshot();
        assert_eq!(snap.status, ExecutionStatus::Running);
        assert!(snap.start_time.is_some());
        assert_eq!(snap.args, vec![HookValue::Int(1)]);

        t.finish(ExecutionStatus::Completed, Some(HookValue::from("ok")), None)
            .unwrap();
        let snap = t.snapshot();
        assert_eq!(snap.status, ExecutionStatus::Completed);
        assert!(snap.end_time.is_some());
        assert!(snap.duration.is_some());
        assert!(t.token().is_cancelled());
    }

    #[test]
    fn test_finish_rejects_non_terminal_status() {
        let t = trace();
        t.start(vec![]).unwrap();
        assert!(t.finish(ExecutionStatus::Pending, None, None).is_err());
        assert_eq!(t.status(), ExecutionStatus::Running);
    }

    #[test]
    fn test_terminal_trace_is_immutable() {
        let t = trace();
        t.start(vec![]).unwrap();
        t.finish(ExecutionStatus::Failed, None, Some("boom".into()))
            .unwrap();
        assert!(t
            .finish(ExecutionStatus::Completed, Some(HookValue::Null), None)
            .is_err());

        let snap = t.snapshot();
        assert_eq!(snap.status, ExecutionStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_snapshot_serializes_duration_in_ms() {
        let t = trace();
        let json = serde_json::to_value(t.snapshot()).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json["duration_ms"].is_null());
        assert!(json.get("seq").is_none());
    }
}
