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

//! Bounded history of terminal traces.

use super::record::PluginExecutionTrace;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_STALE_QUEUE_SIZE: usize = 1000;
pub const MAX_STALE_QUEUE_SIZE: usize = 10_000;

/// Fixed-capacity ring of terminal traces, newest at the front.
#[derive(Debug)]
pub struct StaleTraceQueue {
    traces: RwLock<VecDeque<Arc<PluginExecutionTrace>>>,
    capacity: usize,
}

impl Default for StaleTraceQueue {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_QUEUE_SIZE)
    }
}

impl StaleTraceQueue {
    /// Create a queue. `0` selects the default capacity and anything above
    /// the maximum is clamped to it.
    pub fn new(capacity: usize) -> Self {
        let capacity = match capacity {
            0 => DEFAULT_STALE_QUEUE_SIZE,
            c if c > MAX_STALE_QUEUE_SIZE => MAX_STALE_QUEUE_SIZE,
            c => c,
        };
        Self {
            traces: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_STALE_QUEUE_SIZE))),
            capacity,
        }
    }

    /// Insert at the head. Returns the evicted oldest trace when full.
    pub fn push(&self, trace: Arc<PluginExecutionTrace>) -> Option<Arc<PluginExecutionTrace>> {
        let mut traces = self.traces.write();
        traces.push_front(trace);
        if traces.len() > self.capacity {
            traces.pop_back()
        } else {
            None
        }
    }

    /// All traces, newest first.
    pub fn get_all(&self) -> Vec<Arc<PluginExecutionTrace>> {
        self.traces.read().iter().cloned().collect()
    }

    pub fn get_by_trace_id(&self, trace_id: &str) -> Option<Arc<PluginExecutionTrace>> {
        self.traces
            .read()
            .iter()
            .find(|t| t.trace_id() == trace_id)
            .cloned()
    }

    /// Drop traces not matching the predicate. Returns them.
    pub fn retain<F>(&self, mut keep: F) -> Vec<Arc<PluginExecutionTrace>>
    where
        F: FnMut(&PluginExecutionTrace) -> bool,
    {
        let mut traces = self.traces.write();
        let mut removed = Vec::new();
        traces.retain(|t| {
            if keep(t) {
                true
            } else {
                removed.push(t.clone());
                false
            }
        });
        removed
    }

    pub fn size(&self) -> usize {
        self.traces.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.traces.read().is_empty()
    }

    pub fn clear(&self) {
        self.traces.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio_util::sync::CancellationToken;

    fn trace(id: usize) -> Arc<PluginExecutionTrace> {
        Arc::new(PluginExecutionTrace::new(
            format!("trace-{}", id),
            "plugin",
            "hook",
            CancellationToken::new(),
            id as u64,
        ))
    }

    #[test]
    fn test_capacity_clamping() {
        assert_eq!(StaleTraceQueue::new(0).capacity(), DEFAULT_STALE_QUEUE_SIZE);
        assert_eq!(StaleTraceQueue::new(usize::MAX).capacity(), MAX_STALE_QUEUE_SIZE);
        assert_eq!(StaleTraceQueue::new(MAX_STALE_QUEUE_SIZE + 1).capacity(), MAX_STALE_QUEUE_SIZE);
        assert_eq!(StaleTraceQueue::new(1).capacity(), 1);
        assert_eq!(StaleTraceQueue::default().capacity(), DEFAULT_STALE_QUEUE_SIZE);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let queue = StaleTraceQueue::new(2);
        assert!(queue.push(trace(1)).is_none());
        assert!(queue.push(trace(2)).is_none());

        let evicted = queue.push(trace(3)).unwrap();
        assert_eq!(evicted.trace_id(), "trace-1");

        let ids: Vec<_> = queue.get_all().iter().map(|t| t.trace_id().to_string()).collect();
        assert_eq!(ids, vec!["trace-3", "trace-2"]);
    }

    #[test]
    fn test_lookup_and_clear() {
        let queue = StaleTraceQueue::new(10);
        queue.push(trace(1));
        queue.push(trace(2));

        assert!(queue.get_by_trace_id("trace-1").is_some());
        assert!(queue.get_by_trace_id("trace-9").is_none());

        let removed = queue.retain(|t| t.trace_id() != "trace-1");
        assert_eq!(removed.len(), 1);
        assert_eq!(queue.size(), 1);

        queue.clear();
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_keeps_newest_k(capacity in 1usize..64, pushes in 0usize..200) {
            let queue = StaleTraceQueue::new(capacity);
            let mut evicted = 0;
            for i in 0..pushes {
                if queue.push(trace(i)).is_some() {
                    evicted += 1;
                }
            }

            let kept = pushes.min(capacity);
            prop_assert_eq!(queue.size(), kept);
            prop_assert_eq!(evicted, pushes - kept);

            let all = queue.get_all();
            for (pos, t) in all.iter().enumerate() {
                let expected = format!("trace-{}", pushes - 1 - pos);
                prop_assert_eq!(t.trace_id(), expected.as_str());
            }
        }
    }
}
