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

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use scanhook_engine::feedback::{ExecResult, FeedbackLog, SinkError};
use scanhook_engine::loader::ScriptBindings;
use scanhook_engine::{LoadError, LoadRequest, LoadedUnit, NativeUnit, ResultSink, ScriptLoader, WrapperKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Loader that maps source text to prebuilt native units.
#[derive(Default)]
pub struct StaticLoader {
    units: HashMap<String, NativeUnit>,
    wrappers: Vec<(WrapperKind, String)>,
    delay: Option<Duration>,
    loads: AtomicUsize,
    bindings: Mutex<Vec<ScriptBindings>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, source: &str, unit: NativeUnit) -> Self {
        self.units.insert(source.to_string(), unit);
        self
    }

    pub fn with_wrapper(mut self, kind: WrapperKind, source: &str) -> Self {
        self.wrappers.push((kind, source.to_string()));
        self
    }

    /// Make every load take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Bindings of every load, in order.
    pub fn bindings(&self) -> Vec<ScriptBindings> {
        self.bindings.lock().clone()
    }
}

#[async_trait]
impl ScriptLoader for StaticLoader {
    async fn load(&self, request: LoadRequest) -> Result<Box<dyn LoadedUnit>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.bindings.lock().push(request.bindings.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = request.context.cancelled() => return Err(LoadError::Cancelled),
            }
        }

        match self.units.get(&request.source) {
            Some(unit) => Ok(Box::new(unit.clone())),
            None => Err(LoadError::Syntax(format!("unknown source {:?}", request.source))),
        }
    }

    fn wrapper_source(&self, kind: WrapperKind) -> Option<String> {
        self.wrappers
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, source)| source.clone())
    }
}

/// Sink that keeps every feedback line.
pub fn collecting_sink() -> (Arc<dyn ResultSink>, Arc<Mutex<Vec<FeedbackLog>>>) {
    let logs = Arc::new(Mutex::new(Vec::new()));
    let captured = logs.clone();
    let sink: Arc<dyn ResultSink> = Arc::new(move |result: ExecResult| -> Result<(), SinkError> {
        let log: FeedbackLog =
            serde_json::from_slice(&result.message).map_err(|e| SinkError(e.to_string()))?;
        captured.lock().push(log);
        Ok(())
    });
    (sink, logs)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
