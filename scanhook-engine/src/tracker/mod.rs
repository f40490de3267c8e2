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

//! Execution tracker.
//!
//! Every invocation gets its own [`PluginExecutionTrace`]. Active traces are
//! indexed by trace id, plugin id and hook name. Once a trace reaches a
//! terminal status it migrates into the [`StaleTraceQueue`], where it stays
//! queryable until evicted.
//!
//! Observers registered with [`PluginExecutionTracker::add_callback`] are
//! notified of every status change off the calling path.

pub mod record;
pub mod stale;
pub mod state;

pub use record::{PluginExecutionTrace, TraceSnapshot};
pub use stale::{StaleTraceQueue, DEFAULT_STALE_QUEUE_SIZE, MAX_STALE_QUEUE_SIZE};
pub use state::{ExecutionEvent, ExecutionStatus, InvalidTransition};

use crate::value::HookValue;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Observer of trace changes.
pub type TraceCallback = Arc<dyn Fn(&TraceSnapshot) + Send + Sync>;

/// Occupancy of the stale queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StaleQueueInfo {
    pub size: usize,
    pub capacity: usize,
    /// Fraction of capacity in use, in `[0, 1]`.
    pub usage: f64,
}

/// Aggregate counters over active and stale traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStatistics {
    pub total_traces: usize,
    pub active_traces: usize,
    pub stale_traces: usize,
    pub status_count: HashMap<ExecutionStatus, usize>,
    pub plugin_count: HashMap<String, usize>,
    pub hook_count: HashMap<String, usize>,
    /// Mean duration of completed traces, in milliseconds.
    pub average_duration_ms: f64,
}

pub struct PluginExecutionTracker {
    traces: DashMap<String, Arc<PluginExecutionTrace>>,
    by_plugin: DashMap<String, Vec<String>>,
    by_hook: DashMap<String, Vec<String>>,
    stale: StaleTraceQueue,
    callbacks: RwLock<Vec<(String, TraceCallback)>>,
    next_seq: AtomicU64,
    next_callback_id: AtomicU64,
}

impl Default for PluginExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginExecutionTracker {
    pub fn new() -> Self {
        Self::with_stale_capacity(DEFAULT_STALE_QUEUE_SIZE)
    }

    pub fn with_stale_capacity(capacity: usize) -> Self {
        Self {
            traces: DashMap::new(),
            by_plugin: DashMap::new(),
            by_hook: DashMap::new(),
            stale: StaleTraceQueue::new(capacity),
            callbacks: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            next_callback_id: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Allocate a new Pending trace with a context derived from `parent`.
    pub fn create_trace(
        &self,
        plugin_id: &str,
        hook_name: &str,
        parent: &CancellationToken,
    ) -> Arc<PluginExecutionTrace> {
        let trace = Arc::new(PluginExecutionTrace::new(
            uuid::Uuid::new_v4().to_string(),
            plugin_id,
            hook_name,
            parent.child_token(),
            self.next_seq.fetch_add(1, Ordering::Relaxed),
        ));
        let trace_id = trace.trace_id().to_string();

        self.traces.insert(trace_id.clone(), trace.clone());
        self.by_plugin
            .entry(plugin_id.to_string())
            .or_default()
            .push(trace_id.clone());
        self.by_hook
            .entry(hook_name.to_string())
            .or_default()
            .push(trace_id);

        tracing::debug!(
            trace_id = %trace.trace_id(),
            plugin_id = %plugin_id,
            hook = %hook_name,
            "Execution trace created"
        );
        self.notify(trace.snapshot());
        trace
    }

    /// Pending -> Running. Returns false when the trace is unknown or not
    /// pending.
    pub fn start_execution(&self, trace_id: &str, args: Vec<HookValue>) -> bool {
        let Some(trace) = self.active(trace_id) else {
            return false;
        };
        match trace.start(args) {
            Ok(()) => {
                self.notify(trace.snapshot());
                true
            }
            Err(e) => {
                tracing::debug!(trace_id = %trace_id, error = %e, "Ignoring start of trace");
                false
            }
        }
    }

    /// Move a trace into a terminal status.
    ///
    /// Updates that are not legal from the current status are ignored and
    /// reported as `false`. A terminal trace migrates to the stale queue.
    pub fn update_trace_status(
        &self,
        trace_id: &str,
        status: ExecutionStatus,
        result: Option<HookValue>,
        error: Option<String>,
    ) -> bool {
        let Some(trace) = self.active(trace_id) else {
            return false;
        };
        if let Err(e) = trace.finish(status, result, error) {
            tracing::debug!(trace_id = %trace_id, error = %e, "Ignoring status update");
            return false;
        }

        let snapshot = trace.snapshot();
        self.move_to_stale(trace);
        self.notify(snapshot);
        true
    }

    /// Cancel one invocation. Other invocations are unaffected.
    pub fn cancel_trace(&self, trace_id: &str) -> bool {
        let Some(trace) = self.active(trace_id) else {
            return false;
        };
        trace.cancel_context();
        self.update_trace_status(
            trace_id,
            ExecutionStatus::Cancelled,
            None,
            Some("execution cancelled".to_string()),
        )
    }

    /// Cancel every active trace. Returns how many were cancelled.
    pub fn cancel_all_traces(&self) -> usize {
        let ids: Vec<String> = self.traces.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel_trace(id)).count()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Look up a trace, active first, then stale.
    pub fn get_trace(&self, trace_id: &str) -> Option<TraceSnapshot> {
        self.active(trace_id)
            .or_else(|| self.stale.get_by_trace_id(trace_id))
            .map(|t| t.snapshot())
    }

    pub fn get_active_traces(&self) -> Vec<TraceSnapshot> {
        self.traces.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Stale traces, newest first.
    pub fn get_stale_traces(&self) -> Vec<TraceSnapshot> {
        self.stale.get_all().iter().map(|t| t.snapshot()).collect()
    }

    /// Active and stale traces.
    pub fn get_all_traces(&self) -> Vec<TraceSnapshot> {
        self.collect(|_| true)
    }

    pub fn get_traces_by_plugin(&self, plugin_id: &str) -> Vec<TraceSnapshot> {
        self.collect_indexed(&self.by_plugin, plugin_id, |t| t.plugin_id() == plugin_id)
    }

    pub fn get_traces_by_hook(&self, hook_name: &str) -> Vec<TraceSnapshot> {
        self.collect_indexed(&self.by_hook, hook_name, |t| t.hook_name() == hook_name)
    }

    pub fn get_running_traces(&self) -> Vec<TraceSnapshot> {
        self.traces
            .iter()
            .map(|e| e.value().snapshot())
            .filter(|s| s.status == ExecutionStatus::Running)
            .collect()
    }

    /// Most recently loaded trace of a (plugin, hook) pair.
    pub fn find_trace_by_plugin_and_hook(
        &self,
        plugin_id: &str,
        hook_name: &str,
    ) -> Option<TraceSnapshot> {
        self.collect_indexed(&self.by_plugin, plugin_id, |t| {
            t.plugin_id() == plugin_id && t.hook_name() == hook_name
        })
            .into_iter()
            .max_by_key(|s| s.recency())
    }

    /// Most recently loaded running trace of a (plugin, hook) pair.
    pub fn find_latest_running_trace_by_plugin_and_hook(
        &self,
        plugin_id: &str,
        hook_name: &str,
    ) -> Option<TraceSnapshot> {
        self.active_ids(&self.by_plugin, plugin_id)
            .into_iter()
            .filter_map(|id| self.active(&id))
            .filter(|t| t.hook_name() == hook_name)
            .map(|t| t.snapshot())
            .filter(|s| s.status == ExecutionStatus::Running)
            .max_by_key(|s| s.recency())
    }

    pub fn stale_queue_info(&self) -> StaleQueueInfo {
        let size = self.stale.size();
        let capacity = self.stale.capacity();
        StaleQueueInfo {
            size,
            capacity,
            usage: size as f64 / capacity as f64,
        }
    }

    pub fn statistics(&self) -> ExecutionStatistics {
        let active = self.get_active_traces();
        let stale = self.get_stale_traces();
        let mut stats = ExecutionStatistics {
            total_traces: active.len() + stale.len(),
            active_traces: active.len(),
            stale_traces: stale.len(),
            ..Default::default()
        };

        let mut total_ms = 0f64;
        let mut timed = 0usize;
        for snap in active.iter().chain(stale.iter()) {
            *stats.status_count.entry(snap.status).or_default() += 1;
            *stats.plugin_count.entry(snap.plugin_id.clone()).or_default() += 1;
            *stats.hook_count.entry(snap.hook_name.clone()).or_default() += 1;
            if snap.status != ExecutionStatus::Completed {
                continue;
            }
            if let Some(d) = snap.duration.filter(|d| !d.is_zero()) {
                total_ms += d.as_secs_f64() * 1000.0;
                timed += 1;
            }
        }
        if timed > 0 {
            stats.average_duration_ms = total_ms / timed as f64;
        }
        stats
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Drop terminal traces that ended more than `older_than` ago.
    ///
    /// Active traces are never terminal, so this only prunes the stale
    /// queue. Returns the number of traces removed.
    pub fn cleanup_completed_traces(&self, older_than: Duration) -> usize {
        // A window beyond the representable range covers every trace.
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return 0;
        };
        let removed = self.stale.retain(|t| {
            let snap = t.snapshot();
            !(snap.status.is_terminal() && snap.end_time.map(|end| end < cutoff).unwrap_or(false))
        });
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "Cleaned up completed traces");
        }
        removed.len()
    }

    /// Remove an active trace without touching the stale history.
    pub fn remove_trace(&self, trace_id: &str) -> bool {
        match self.traces.remove(trace_id) {
            Some((_, trace)) => {
                self.unindex(&trace);
                trace.cancel_context();
                true
            }
            None => false,
        }
    }

    /// Remove every active trace of a (plugin, hook) pair.
    pub fn remove_traces_by_plugin_and_hook(&self, plugin_id: &str, hook_name: &str) -> usize {
        self.active_ids(&self.by_plugin, plugin_id)
            .into_iter()
            .filter(|id| {
                self.active(id)
                    .map(|t| t.hook_name() == hook_name)
                    .unwrap_or(false)
            })
            .filter(|id| self.remove_trace(id))
            .count()
    }

    /// Empty the stale history. Active traces are untouched.
    pub fn clear_stale_traces(&self) {
        self.stale.clear();
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register an observer. Returns its id for removal.
    pub fn add_callback(&self, callback: TraceCallback) -> String {
        let id = format!(
            "callback-{}",
            self.next_callback_id.fetch_add(1, Ordering::Relaxed)
        );
        self.callbacks.write().push((id.clone(), callback));
        id
    }

    pub fn remove_callback(&self, id: &str) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| cid != id);
        callbacks.len() != before
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn active(&self, trace_id: &str) -> Option<Arc<PluginExecutionTrace>> {
        self.traces.get(trace_id).map(|t| t.value().clone())
    }

    fn active_ids(&self, index: &DashMap<String, Vec<String>>, key: &str) -> Vec<String> {
        index.get(key).map(|ids| ids.clone()).unwrap_or_default()
    }

    /// Active plus stale traces matching the predicate, without duplicates.
    fn collect<F>(&self, matches: F) -> Vec<TraceSnapshot>
    where
        F: Fn(&PluginExecutionTrace) -> bool,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let active = self.traces.iter().map(|e| e.value().clone()).collect::<Vec<_>>();
        for trace in active.into_iter().chain(self.stale.get_all()) {
            if matches(&trace) && seen.insert(trace.trace_id().to_string()) {
                out.push(trace.snapshot());
            }
        }
        out
    }

    /// Active traces listed under `key` in `index`, then stale traces
    /// matching the predicate. Stale scans are bounded by the queue capacity.
    fn collect_indexed<F>(
        &self,
        index: &DashMap<String, Vec<String>>,
        key: &str,
        matches: F,
    ) -> Vec<TraceSnapshot>
    where
        F: Fn(&PluginExecutionTrace) -> bool,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let active = self
            .active_ids(index, key)
            .into_iter()
            .filter_map(|id| self.active(&id))
            .collect::<Vec<_>>();
        for trace in active {
            if matches(&trace) && seen.insert(trace.trace_id().to_string()) {
                out.push(trace.snapshot());
            }
        }
        for trace in self.stale.get_all() {
            if matches(&trace) && seen.insert(trace.trace_id().to_string()) {
                out.push(trace.snapshot());
            }
        }
        out
    }

    // The trace is pushed to the stale queue before it leaves the active
    // map, so concurrent readers always find it in at least one of them.
    fn move_to_stale(&self, trace: Arc<PluginExecutionTrace>) {
        if let Some(evicted) = self.stale.push(trace.clone()) {
            evicted.cancel_context();
            tracing::debug!(trace_id = %evicted.trace_id(), "Evicted stale trace");
        }
        self.traces.remove(trace.trace_id());
        self.unindex(&trace);
    }

    fn unindex(&self, trace: &PluginExecutionTrace) {
        remove_from_index(&self.by_plugin, trace.plugin_id(), trace.trace_id());
        remove_from_index(&self.by_hook, trace.hook_name(), trace.trace_id());
    }

    fn notify(&self, snapshot: TraceSnapshot) {
        let callbacks: Vec<TraceCallback> =
            self.callbacks.read().iter().map(|(_, cb)| cb.clone()).collect();
        if callbacks.is_empty() {
            return;
        }

        let deliver = move || {
            for callback in callbacks {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(&snapshot)));
                if outcome.is_err() {
                    tracing::error!(
                        trace_id = %snapshot.trace_id,
                        "Execution trace callback panicked"
                    );
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(deliver);
            }
            Err(_) => {
                std::thread::spawn(deliver);
            }
        }
    }
}

fn remove_from_index(index: &DashMap<String, Vec<String>>, key: &str, trace_id: &str) {
    if let Some(mut ids) = index.get_mut(key) {
        ids.retain(|id| id != trace_id);
    }
    index.remove_if(key, |_, ids| ids.is_empty());
}
