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

//! Hook dispatcher: loads plugins into the registry and invokes callers.
//!
//! # Concurrency Model
//!
//! Without a concurrency budget every caller of a hook runs inline on the
//! invoking task, in registration order. Once [`HookDispatcher::set_concurrent`]
//! has been called, each caller becomes its own tracked task; the submitter
//! suspends while the budget is exhausted. Forced-synchronous calls always
//! run inline.
//!
//! A call deadline cancels the invocation context and records the trace as
//! failed. The hook body keeps its permit until it returns unless
//! `abort_on_timeout` is set, in which case the task is aborted at its next
//! await point.

use super::caller::{Caller, HookError, InvocationContext, SharedHookFunction};
use super::names::HOOK_CLEAR;
use super::registry::{CallerInfo, HookRegistry};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::feedback::{feedback_callback, status_callback, ResultSink};
use crate::loader::{
    LoadRequest, Script, ScriptBindings, ScriptLoader, ScriptQuery, ScriptStore, ScriptType,
    FEEDBACK_BINDING, PARAMS_BINDING, PLUGIN_BINDING, PLUGIN_ID_BINDING, PROXY_BINDING,
    RUNTIME_ID_BINDING, STATUS_BINDING,
};
use crate::tracker::{
    ExecutionStatistics, ExecutionStatus, PluginExecutionTrace, PluginExecutionTracker,
    TraceCallback, TraceSnapshot,
};
use crate::value::{eager, ArgThunk, HookValue};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Plugin parameters, bound into the script as a map.
pub type PluginParams = BTreeMap<String, String>;

/// Hook run against the bindings before a script is loaded.
pub type BindingHook = Arc<dyn Fn(&mut ScriptBindings) + Send + Sync>;

/// Selector for [`HookDispatcher::remove`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveHookParams {
    /// Hook names to act on. Empty means every hook.
    pub hook_names: Vec<String>,
    /// Plugins whose callers are removed.
    pub remove_plugin_ids: Vec<String>,
    /// Drop whole hook names instead of single plugins.
    pub clear_all: bool,
}

pub struct HookDispatcher {
    registry: Arc<HookRegistry>,
    loader: Option<Arc<dyn ScriptLoader>>,
    store: Option<Arc<dyn ScriptStore>>,
    sink: Option<Arc<dyn ResultSink>>,
    tracker: Arc<PluginExecutionTracker>,
    tracing_enabled: AtomicBool,
    limiter: OnceLock<Arc<Semaphore>>,
    load_timeout: RwLock<Duration>,
    call_timeout: RwLock<Option<Duration>>,
    abort_on_timeout: bool,
    runtime_id: RwLock<String>,
    proxy: RwLock<String>,
    tasks: TaskTracker,
    root: CancellationToken,
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HookDispatcher {
    /// Dispatcher with default configuration and no loader.
    pub fn new() -> Self {
        Self::from_parts(
            &EngineConfig::default(),
            Arc::new(HookRegistry::new()),
            None,
            None,
            None,
            CancellationToken::new(),
        )
    }

    pub fn builder() -> HookDispatcherBuilder {
        HookDispatcherBuilder::new()
    }

    fn from_parts(
        config: &EngineConfig,
        registry: Arc<HookRegistry>,
        loader: Option<Arc<dyn ScriptLoader>>,
        store: Option<Arc<dyn ScriptStore>>,
        sink: Option<Arc<dyn ResultSink>>,
        root: CancellationToken,
    ) -> Self {
        Self {
            registry,
            loader,
            store,
            sink,
            tracker: Arc::new(PluginExecutionTracker::with_stale_capacity(
                config.stale_queue_size,
            )),
            tracing_enabled: AtomicBool::new(config.enable_tracing),
            limiter: OnceLock::new(),
            load_timeout: RwLock::new(config.load_timeout()),
            call_timeout: RwLock::new(config.call_timeout()),
            abort_on_timeout: config.abort_on_timeout,
            runtime_id: RwLock::new(String::new()),
            proxy: RwLock::new(String::new()),
            tasks: TaskTracker::new(),
            root,
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Configure the shared execution budget. Can only be done once.
    pub fn set_concurrent(&self, max: usize) -> EngineResult<()> {
        if max == 0 {
            return Err(EngineError::InvalidConcurrency(max));
        }
        self.limiter
            .set(Arc::new(Semaphore::new(max)))
            .map_err(|_| EngineError::ConcurrencyAlreadySet)?;
        tracing::debug!(max_concurrent = max, "Concurrency budget configured");
        Ok(())
    }

    pub fn is_concurrent(&self) -> bool {
        self.limiter.get().is_some()
    }

    pub fn set_load_plugin_timeout(&self, timeout: Duration) {
        *self.load_timeout.write() = timeout;
    }

    /// Set the per-call deadline. A zero duration disables it.
    pub fn set_call_plugin_timeout(&self, timeout: Duration) {
        *self.call_timeout.write() = (!timeout.is_zero()).then_some(timeout);
    }

    pub fn set_runtime_id(&self, runtime_id: impl Into<String>) {
        *self.runtime_id.write() = runtime_id.into();
    }

    pub fn runtime_id(&self) -> String {
        self.runtime_id.read().clone()
    }

    pub fn set_proxy(&self, proxy: impl Into<String>) {
        *self.proxy.write() = proxy.into();
    }

    pub fn proxy(&self) -> String {
        self.proxy.read().clone()
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn ScriptStore>> {
        self.store.as_ref()
    }

    pub fn loader(&self) -> Option<&Arc<dyn ScriptLoader>> {
        self.loader.as_ref()
    }

    /// Engine-wide context. Cancelling it cancels every in-flight invocation.
    pub fn context(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Load `source` once and register a caller per exported hook name.
    ///
    /// Callers are keyed by `plugin_id`, so reloading a plugin replaces its
    /// previous callers. Nothing is registered if loading fails.
    pub async fn add(
        &self,
        ctx: &CancellationToken,
        plugin_id: &str,
        params: &PluginParams,
        source: &str,
        side_effect: Option<BindingHook>,
        hook_names: &[&str],
    ) -> EngineResult<()> {
        let mut bindings = self.base_bindings(plugin_id, params);
        if let Some(hook) = side_effect {
            hook(&mut bindings);
        }

        let functions = self
            .load_unit(ctx, plugin_id, source, bindings, hook_names)
            .await?;

        let mut registered = Vec::with_capacity(functions.len());
        for (hook_name, function) in functions {
            let caller = Caller::new(plugin_id, &hook_name, source, function);
            if self.registry.insert(&hook_name, caller).is_some() {
                tracing::debug!(plugin_id = %plugin_id, hook = %hook_name, "Replaced existing caller");
            }
            registered.push(hook_name);
        }

        tracing::info!(
            plugin_id = %plugin_id,
            hooks = ?registered,
            "Plugin loaded"
        );
        Ok(())
    }

    /// Like [`add`](Self::add), binding feedback callables that report to `sink`.
    pub async fn add_with_sink(
        &self,
        ctx: &CancellationToken,
        plugin_id: &str,
        params: &PluginParams,
        source: &str,
        sink: Arc<dyn ResultSink>,
        hook_names: &[&str],
    ) -> EngineResult<()> {
        let runtime_id = self.runtime_id();
        let owner = plugin_id.to_string();
        let hook: BindingHook = Arc::new(move |bindings: &mut ScriptBindings| {
            bindings.insert(
                FEEDBACK_BINDING.to_string(),
                feedback_callback(sink.clone(), owner.clone(), runtime_id.clone()).into(),
            );
            bindings.insert(
                STATUS_BINDING.to_string(),
                status_callback(sink.clone(), owner.clone(), runtime_id.clone()).into(),
            );
            bindings.insert(PLUGIN_ID_BINDING.to_string(), owner.clone().into());
        });
        self.add(ctx, plugin_id, params, source, Some(hook), hook_names)
            .await
    }

    /// Hot patch: load anonymous `source` and make it the only caller of
    /// every hook name it exports.
    pub async fn set(
        &self,
        ctx: &CancellationToken,
        source: &str,
        side_effect: Option<BindingHook>,
        hook_names: &[&str],
    ) -> EngineResult<()> {
        let mut bindings = self.base_bindings("", &PluginParams::new());
        if let Some(hook) = side_effect {
            hook(&mut bindings);
        }

        let functions = self.load_unit(ctx, "", source, bindings, hook_names).await?;
        for (hook_name, function) in functions {
            let caller = Caller::new("", &hook_name, source, function);
            self.registry.replace_all(&hook_name, vec![caller]);
        }
        tracing::info!("Hot patch applied");
        Ok(())
    }

    /// Register an in-process hook function.
    pub fn add_native(&self, plugin_id: &str, hook_name: &str, function: SharedHookFunction) {
        let caller = Caller::new(plugin_id, hook_name, "", function);
        self.registry.insert(hook_name, caller);
    }

    /// Remove callers, invoking the `clear` hook of what goes away.
    pub async fn remove(&self, params: &RemoveHookParams) {
        if params.clear_all {
            if params.hook_names.is_empty() {
                self.call_by_name_sync(HOOK_CLEAR, vec![]).await;
                self.registry.clear();
                tracing::info!("All hooks cleared");
                return;
            }
            for hook_name in &params.hook_names {
                if hook_name == HOOK_CLEAR {
                    self.call_by_name_sync(HOOK_CLEAR, vec![]).await;
                }
                self.registry.remove_hook(hook_name);
            }
            return;
        }

        let ids: HashSet<String> = params.remove_plugin_ids.iter().cloned().collect();
        if ids.is_empty() {
            return;
        }

        let names = if params.hook_names.is_empty() {
            self.registry.hook_names()
        } else {
            params.hook_names.clone()
        };

        let clearing = params.hook_names.is_empty() || names.iter().any(|n| n == HOOK_CLEAR);
        if clearing {
            for id in &ids {
                if self.registry.plugin_caller(HOOK_CLEAR, id).is_some() {
                    self.call_plugin_key_by_name_ex(true, id, HOOK_CLEAR, vec![])
                        .await;
                }
            }
        }

        let mut removed = 0;
        for hook_name in &names {
            removed += self.registry.remove_plugins(hook_name, &ids).len();
        }
        tracing::info!(plugins = ?ids, removed, "Plugins removed");
    }

    pub async fn remove_plugins_by_name(&self, names: &[String]) {
        self.remove(&RemoveHookParams {
            remove_plugin_ids: names.to_vec(),
            ..Default::default()
        })
        .await
    }

    pub fn should_call_by_name(&self, hook_name: &str) -> bool {
        self.registry.has_callers(hook_name)
    }

    pub fn current_hooks(&self) -> Vec<(String, Vec<CallerInfo>)> {
        self.registry.snapshot()
    }

    // ------------------------------------------------------------------
    // Loading from the store
    // ------------------------------------------------------------------

    /// Load every stored script of a type. Returns how many loaded.
    pub async fn load_plugins_by_type(
        &self,
        ctx: &CancellationToken,
        script_type: ScriptType,
        hook_names: &[&str],
    ) -> EngineResult<usize> {
        self.load_query(ctx, ScriptQuery::ByType(script_type), hook_names)
            .await
    }

    /// Load the named stored scripts. Returns how many loaded.
    pub async fn load_plugins_by_names(
        &self,
        ctx: &CancellationToken,
        names: Vec<String>,
        hook_names: &[&str],
    ) -> EngineResult<usize> {
        self.load_query(ctx, ScriptQuery::ByNames(names), hook_names)
            .await
    }

    pub async fn load_plugin_by_name(
        &self,
        ctx: &CancellationToken,
        name: &str,
        hook_names: &[&str],
    ) -> EngineResult<()> {
        let store = self.store.as_ref().ok_or(EngineError::StoreNotConfigured)?;
        let script = store.get_by_name(name).await?;
        self.add_script(ctx, &script, hook_names).await
    }

    /// Register a stored script, binding the default sink if there is one.
    pub async fn add_script(
        &self,
        ctx: &CancellationToken,
        script: &Script,
        hook_names: &[&str],
    ) -> EngineResult<()> {
        match &self.sink {
            Some(sink) => {
                self.add_with_sink(
                    ctx,
                    &script.name,
                    &script.params,
                    &script.content,
                    sink.clone(),
                    hook_names,
                )
                .await
            }
            None => {
                self.add(ctx, &script.name, &script.params, &script.content, None, hook_names)
                    .await
            }
        }
    }

    async fn load_query(
        &self,
        ctx: &CancellationToken,
        query: ScriptQuery,
        hook_names: &[&str],
    ) -> EngineResult<usize> {
        let store = self.store.as_ref().ok_or(EngineError::StoreNotConfigured)?;
        let label = query.to_string();
        let mut scripts = store.yield_scripts(query);

        let mut loaded = 0;
        while let Some(script) = scripts.recv().await {
            match self.add_script(ctx, &script, hook_names).await {
                Ok(()) => loaded += 1,
                Err(e) => {
                    tracing::warn!(script = %script.name, error = %e, "Failed to load stored script")
                }
            }
        }

        if loaded == 0 {
            return Err(EngineError::NoScriptLoaded(label));
        }
        Ok(loaded)
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Invoke every caller of `hook_name`.
    pub async fn call_by_name(&self, hook_name: &str, args: Vec<HookValue>) {
        self.dispatch(false, "", hook_name, eager(args)).await
    }

    /// Invoke every caller of `hook_name` inline, waiting for all of them.
    pub async fn call_by_name_sync(&self, hook_name: &str, args: Vec<HookValue>) {
        self.dispatch(true, "", hook_name, eager(args)).await
    }

    /// Invoke with lazily built arguments.
    pub async fn call_by_name_ex(&self, hook_name: &str, args: Vec<ArgThunk>) {
        self.dispatch(false, "", hook_name, args).await
    }

    pub async fn call_by_name_ex_sync(&self, hook_name: &str, args: Vec<ArgThunk>) {
        self.dispatch(true, "", hook_name, args).await
    }

    /// Invoke only the caller owned by `plugin_id`.
    pub async fn call_plugin_key_by_name(
        &self,
        plugin_id: &str,
        hook_name: &str,
        args: Vec<HookValue>,
    ) {
        self.dispatch(false, plugin_id, hook_name, eager(args)).await
    }

    pub async fn call_plugin_key_by_name_ex(
        &self,
        force_sync: bool,
        plugin_id: &str,
        hook_name: &str,
        args: Vec<ArgThunk>,
    ) {
        self.dispatch(force_sync, plugin_id, hook_name, args).await
    }

    async fn dispatch(
        &self,
        force_sync: bool,
        plugin_id: &str,
        hook_name: &str,
        args: Vec<ArgThunk>,
    ) {
        let callers = self.registry.callers(hook_name);
        if callers.is_empty() {
            return;
        }

        // Inline work counts towards wait() as well.
        let _in_flight = self.tasks.token();

        for caller in callers {
            if !plugin_id.is_empty() && caller.plugin_id != plugin_id {
                continue;
            }
            if self.root.is_cancelled() {
                tracing::debug!(hook = %hook_name, "Engine shut down, skipping remaining callers");
                break;
            }

            let invocation = self.prepare(hook_name, caller, &args);
            match self.limiter.get() {
                Some(limiter) if !force_sync => {
                    let permit = tokio::select! {
                        permit = limiter.clone().acquire_owned() => permit.ok(),
                        _ = self.root.cancelled() => None,
                    };
                    match permit {
                        Some(permit) => {
                            self.tasks.spawn(invocation.run(Some(permit)));
                        }
                        None => {
                            invocation.abandon();
                            break;
                        }
                    }
                }
                _ => invocation.run(None).await,
            }
        }
    }

    fn prepare(&self, hook_name: &str, caller: Caller, args: &[ArgThunk]) -> Invocation {
        let args = args.iter().map(ArgThunk::evaluate).collect();
        let trace = self
            .is_tracing_enabled()
            .then(|| self.tracker.create_trace(&caller.plugin_id, hook_name, &self.root));
        let token = match &trace {
            Some(trace) => trace.token(),
            None => self.root.child_token(),
        };
        Invocation {
            hook_name: hook_name.to_string(),
            caller,
            args,
            trace,
            tracker: self.tracker.clone(),
            token,
            call_timeout: *self.call_timeout.read(),
            abort_on_timeout: self.abort_on_timeout,
        }
    }

    /// Wait for dispatched work to finish, or for the engine to shut down.
    pub async fn wait(&self) {
        self.tasks.close();
        tokio::select! {
            _ = self.tasks.wait() => {}
            _ = self.root.cancelled() => {
                tracing::debug!("Wait interrupted by shutdown");
            }
        }
        self.tasks.reopen();
    }

    // ------------------------------------------------------------------
    // Execution tracing
    // ------------------------------------------------------------------

    pub fn enable_execution_tracing(&self, enabled: bool) {
        self.tracing_enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!(enabled, "Execution tracing toggled");
    }

    pub fn is_tracing_enabled(&self) -> bool {
        self.tracing_enabled.load(Ordering::SeqCst)
    }

    pub fn tracker(&self) -> &Arc<PluginExecutionTracker> {
        &self.tracker
    }

    pub fn add_execution_trace_callback(&self, callback: TraceCallback) -> String {
        self.tracker.add_callback(callback)
    }

    pub fn remove_execution_trace_callback(&self, id: &str) -> bool {
        self.tracker.remove_callback(id)
    }

    pub fn get_all_execution_traces(&self) -> Vec<TraceSnapshot> {
        self.tracker.get_all_traces()
    }

    pub fn get_execution_trace(&self, trace_id: &str) -> Option<TraceSnapshot> {
        self.tracker.get_trace(trace_id)
    }

    pub fn get_execution_traces_by_plugin(&self, plugin_id: &str) -> Vec<TraceSnapshot> {
        self.tracker.get_traces_by_plugin(plugin_id)
    }

    pub fn get_execution_traces_by_hook(&self, hook_name: &str) -> Vec<TraceSnapshot> {
        self.tracker.get_traces_by_hook(hook_name)
    }

    pub fn get_running_execution_traces(&self) -> Vec<TraceSnapshot> {
        self.tracker.get_running_traces()
    }

    pub fn cancel_execution_trace(&self, trace_id: &str) -> bool {
        self.tracker.cancel_trace(trace_id)
    }

    pub fn cancel_all_execution_traces(&self) -> usize {
        self.tracker.cancel_all_traces()
    }

    pub fn cleanup_completed_execution_traces(&self, older_than: Duration) -> usize {
        self.tracker.cleanup_completed_traces(older_than)
    }

    pub fn get_execution_statistics(&self) -> ExecutionStatistics {
        self.tracker.statistics()
    }

    // ------------------------------------------------------------------
    // Loading internals
    // ------------------------------------------------------------------

    fn base_bindings(&self, plugin_id: &str, params: &PluginParams) -> ScriptBindings {
        let mut bindings = ScriptBindings::new();
        let params: BTreeMap<String, HookValue> = params
            .iter()
            .map(|(k, v)| (k.clone(), HookValue::Str(v.clone())))
            .collect();
        bindings.insert(PARAMS_BINDING.to_string(), params.into());
        bindings.insert(PLUGIN_BINDING.to_string(), plugin_id.into());
        bindings.insert(RUNTIME_ID_BINDING.to_string(), self.runtime_id().into());
        let proxy = self.proxy();
        if !proxy.is_empty() {
            bindings.insert(PROXY_BINDING.to_string(), proxy.into());
        }
        bindings
    }

    async fn load_unit(
        &self,
        ctx: &CancellationToken,
        plugin_id: &str,
        source: &str,
        bindings: ScriptBindings,
        hook_names: &[&str],
    ) -> EngineResult<Vec<(String, SharedHookFunction)>> {
        let loader = self.loader.clone().ok_or(EngineError::LoaderNotConfigured)?;
        let timeout = *self.load_timeout.read();
        let load_ctx = ctx.child_token();
        let request = LoadRequest {
            plugin_id: plugin_id.to_string(),
            source: source.to_string(),
            bindings,
            symbols: hook_names.iter().map(|s| s.to_string()).collect(),
            context: load_ctx.clone(),
        };

        let started = Instant::now();
        let mut handle = tokio::spawn(async move { loader.load(request).await });
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = tokio::time::sleep(timeout) => {
                load_ctx.cancel();
                handle.abort();
                tracing::warn!(plugin_id = %plugin_id, timeout_ms = timeout.as_millis() as u64, "Plugin load timed out");
                return Err(EngineError::LoadTimeout {
                    plugin_id: plugin_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            _ = ctx.cancelled() => {
                load_ctx.cancel();
                handle.abort();
                return Err(EngineError::LoadFailed {
                    plugin_id: plugin_id.to_string(),
                    reason: "load cancelled".to_string(),
                });
            }
        };

        let unit = match joined {
            Ok(Ok(unit)) => unit,
            Ok(Err(e)) => {
                return Err(EngineError::LoadFailed {
                    plugin_id: plugin_id.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    format!("loader panicked: {}", panic_message(e.into_panic()))
                } else {
                    "load task aborted".to_string()
                };
                tracing::error!(plugin_id = %plugin_id, reason = %reason, "Plugin load crashed");
                return Err(EngineError::LoadFailed {
                    plugin_id: plugin_id.to_string(),
                    reason,
                });
            }
        };

        tracing::debug!(
            plugin_id = %plugin_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Script loaded"
        );

        Ok(hook_names
            .iter()
            .filter_map(|name| unit.lookup(name).map(|f| (name.to_string(), f)))
            .collect())
    }
}

enum Outcome {
    Completed(HookValue),
    Failed(HookError),
    Cancelled,
}

/// One prepared call of one caller.
struct Invocation {
    hook_name: String,
    caller: Caller,
    args: Vec<HookValue>,
    trace: Option<Arc<PluginExecutionTrace>>,
    tracker: Arc<PluginExecutionTracker>,
    token: CancellationToken,
    call_timeout: Option<Duration>,
    abort_on_timeout: bool,
}

impl Invocation {
    async fn run(self, permit: Option<OwnedSemaphorePermit>) {
        let Invocation {
            hook_name,
            caller,
            args,
            trace,
            tracker,
            token,
            call_timeout,
            abort_on_timeout,
        } = self;
        let trace_id = trace.as_ref().map(|t| t.trace_id().to_string());

        if token.is_cancelled() {
            record(&tracker, trace_id.as_deref(), &caller, &hook_name, Outcome::Cancelled);
            return;
        }
        if let Some(id) = &trace_id {
            tracker.start_execution(id, args.clone());
        }

        let ctx = InvocationContext::new(
            token.clone(),
            caller.plugin_id.clone(),
            hook_name.clone(),
            trace_id.clone(),
        );
        let function = caller.function.clone();
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            function.invoke(ctx, args).await
        });

        let deadline = async move {
            match call_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(Ok(value)) => Outcome::Completed(value),
                Ok(Err(HookError::Cancelled)) => Outcome::Cancelled,
                Ok(Err(e)) => Outcome::Failed(e),
                Err(e) if e.is_panic() => {
                    Outcome::Failed(HookError::Panicked(panic_message(e.into_panic())))
                }
                Err(_) => Outcome::Cancelled,
            },
            _ = token.cancelled() => Outcome::Cancelled,
            _ = deadline => {
                token.cancel();
                if abort_on_timeout {
                    handle.abort();
                }
                Outcome::Failed(HookError::Timeout {
                    timeout_ms: call_timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                })
            }
        };

        record(&tracker, trace_id.as_deref(), &caller, &hook_name, outcome);
    }

    /// Drop an invocation that never got a slot.
    fn abandon(self) {
        let trace_id = self.trace.as_ref().map(|t| t.trace_id().to_string());
        record(
            &self.tracker,
            trace_id.as_deref(),
            &self.caller,
            &self.hook_name,
            Outcome::Cancelled,
        );
    }
}

fn record(
    tracker: &PluginExecutionTracker,
    trace_id: Option<&str>,
    caller: &Caller,
    hook_name: &str,
    outcome: Outcome,
) {
    let (status, result, error) = match outcome {
        Outcome::Completed(value) => (ExecutionStatus::Completed, Some(value), None),
        Outcome::Failed(e) => {
            match &e {
                HookError::Panicked(_) => tracing::error!(
                    plugin_id = %caller.plugin_id,
                    hook = %hook_name,
                    error = %e,
                    "Hook panicked"
                ),
                _ => tracing::warn!(
                    plugin_id = %caller.plugin_id,
                    hook = %hook_name,
                    error = %e,
                    "Hook execution failed"
                ),
            }
            (ExecutionStatus::Failed, None, Some(e.to_string()))
        }
        Outcome::Cancelled => {
            tracing::debug!(plugin_id = %caller.plugin_id, hook = %hook_name, "Hook cancelled");
            (
                ExecutionStatus::Cancelled,
                None,
                Some(HookError::Cancelled.to_string()),
            )
        }
    };

    if let Some(id) = trace_id {
        tracker.update_trace_status(id, status, result, error);
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for [`HookDispatcher`].
#[derive(Default)]
pub struct HookDispatcherBuilder {
    config: EngineConfig,
    registry: Option<Arc<HookRegistry>>,
    loader: Option<Arc<dyn ScriptLoader>>,
    store: Option<Arc<dyn ScriptStore>>,
    sink: Option<Arc<dyn ResultSink>>,
    parent: Option<CancellationToken>,
}

impl HookDispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<HookRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ScriptLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ScriptStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Default sink bound into scripts loaded from the store.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Derive the engine context from a host-owned token.
    pub fn with_context(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Per-call deadline. A zero duration disables it.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_ms = (!timeout.is_zero()).then(|| timeout.as_millis() as u64);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = Some(max);
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.config.enable_tracing = enabled;
        self
    }

    pub fn build(self) -> EngineResult<HookDispatcher> {
        self.config.validate()?;
        let root = self
            .parent
            .map(|p| p.child_token())
            .unwrap_or_default();
        let dispatcher = HookDispatcher::from_parts(
            &self.config,
            self.registry.unwrap_or_default(),
            self.loader,
            self.store,
            self.sink,
            root,
        );
        if let Some(max) = self.config.max_concurrent_calls {
            dispatcher.set_concurrent(max)?;
        }
        Ok(dispatcher)
    }
}
