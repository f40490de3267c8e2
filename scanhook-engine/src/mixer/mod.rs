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

//! Traffic fan-out.
//!
//! [`MixPluginCaller`] turns observed HTTP exchanges and scan results into
//! hook invocations on a [`HookDispatcher`]. Three seen-filters keep the
//! `mirrorNewWebsite*` hooks from firing twice for the same site, path or
//! parameter shape, and scanner hooks for new sites run in the background
//! behind their own concurrency gate.

pub mod filter;
pub mod matcher;
pub mod shape;

pub use filter::{IncludeExcludeChecker, SeenFilter, TargetFilter, WebsiteFilters};
pub use matcher::{FingerprintMatcher, MatchError, MatcherFactory, PortState, ServiceMatch};
pub use shape::{RequestShape, RequestShapeCache, SiteTarget};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::feedback::{feedback_callback, send_log, status_callback, FeedbackLog, ResultSink, LEVEL_INFO};
use crate::hooks::dispatcher::{BindingHook, HookDispatcher, PluginParams};
use crate::hooks::names::{
    EXEC_NASL, EXEC_NUCLEI, HIJACK_HTTP_REQUEST, HIJACK_HTTP_RESPONSE, HIJACK_HTTP_RESPONSE_EX,
    HIJACK_SAVE_HTTP_FLOW, MIRROR_FILTERED_HTTP_FLOW, MIRROR_HTTP_FLOW, MIRROR_NEW_WEBSITE,
    MIRROR_NEW_WEBSITE_PATH, MIRROR_NEW_WEBSITE_PATH_PARAMS, MITM_AND_PORT_SCAN_HOOKS,
    MITM_MIRROR_HOOKS, PORT_SCAN_HANDLE, PORT_SCAN_HOOKS,
};
use crate::loader::{
    ScriptBindings, ScriptLoader, ScriptStore, ScriptType, WrapperKind, FEEDBACK_BINDING,
    NASL_SCRIPT_PARAM, NASL_SCRIPT_PREFIX, NUCLEI_TEMPLATE_PARAM, STATUS_BINDING,
};
use crate::value::{ArgThunk, HookCallback, HookValue};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

/// Fingerprint matcher built on first use and shared afterwards.
struct LazyMatcher {
    cell: OnceCell<Arc<dyn FingerprintMatcher>>,
    factory: Option<MatcherFactory>,
}

impl LazyMatcher {
    async fn get(&self) -> Result<Arc<dyn FingerprintMatcher>, MatchError> {
        let factory = self
            .factory
            .clone()
            .ok_or_else(|| MatchError("no fingerprint matcher configured".to_string()))?;
        let matcher = self
            .cell
            .get_or_try_init(|| async move {
                tracing::debug!("Constructing fingerprint matcher");
                factory()
            })
            .await?;
        Ok(matcher.clone())
    }
}

/// One observed HTTP exchange, as passed to the mirror hooks.
struct Flow<'a> {
    is_https: bool,
    url: &'a str,
    request: &'a [u8],
    response: &'a [u8],
    body: &'a [u8],
}

impl Flow<'_> {
    fn args(&self) -> Vec<HookValue> {
        vec![
            self.is_https.into(),
            self.url.into(),
            self.request.into(),
            self.response.into(),
            self.body.into(),
        ]
    }
}

pub struct MixPluginCaller {
    dispatcher: RwLock<Arc<HookDispatcher>>,
    filters: RwLock<Arc<WebsiteFilters>>,
    matcher: Arc<LazyMatcher>,
    target_filter: Arc<dyn TargetFilter>,
    feedback: RwLock<Option<Arc<dyn ResultSink>>>,
    gate: Arc<Semaphore>,
    tasks: TaskTracker,
    root: CancellationToken,
    use_cache: AtomicBool,
    shapes: RequestShapeCache,
    config: EngineConfig,
}

impl MixPluginCaller {
    pub fn builder() -> MixPluginCallerBuilder {
        MixPluginCallerBuilder::new()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn dispatcher(&self) -> Arc<HookDispatcher> {
        self.dispatcher.read().clone()
    }

    /// Swap the underlying dispatcher. Work already running keeps the old one.
    pub fn replace_dispatcher(&self, dispatcher: Arc<HookDispatcher>) {
        *self.dispatcher.write() = dispatcher;
    }

    pub fn set_concurrent(&self, max: usize) -> EngineResult<()> {
        self.dispatcher().set_concurrent(max)
    }

    pub fn set_load_plugin_timeout(&self, timeout: Duration) {
        self.dispatcher().set_load_plugin_timeout(timeout);
    }

    pub fn set_call_plugin_timeout(&self, timeout: Duration) {
        self.dispatcher().set_call_plugin_timeout(timeout);
    }

    /// Let the fingerprint matcher reuse cached results.
    pub fn set_cache(&self, enabled: bool) {
        self.use_cache.store(enabled, Ordering::Relaxed);
    }

    pub fn set_feedback(&self, sink: Arc<dyn ResultSink>) {
        *self.feedback.write() = Some(sink);
    }

    /// Forget every seen site, path and parameter shape.
    pub fn reset_filter(&self) {
        *self.filters.write() = Arc::new(WebsiteFilters::default());
        tracing::debug!("Website filters reset");
    }

    /// Send an info line to the feedback sink, if one is set.
    pub fn feedback_ordinary(&self, message: &str) {
        tracing::info!(message = %message, "Mix caller feedback");
        let sink = self.feedback.read().clone();
        if let Some(sink) = sink {
            let runtime_id = self.dispatcher().runtime_id();
            send_log(sink.as_ref(), FeedbackLog::new(LEVEL_INFO, message), &runtime_id);
        }
    }

    /// Whether `target` passes the include/exclude lists.
    pub fn is_passed(&self, target: &str) -> bool {
        self.target_filter
            .is_allowed(&self.config.mix.includes, &self.config.mix.excludes, target)
    }

    pub fn context(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load a plugin by name.
    ///
    /// With `code`, the plugin is registered on every MITM and port-scan
    /// hook. Without it the script comes from the store and its type picks
    /// the hooks. `__NaslScript__`-prefixed names and nuclei templates are
    /// driven by a loader-provided wrapper; their failures are reported as
    /// feedback and not returned.
    pub async fn load_plugin_by_name(
        &self,
        ctx: &CancellationToken,
        name: &str,
        params: &PluginParams,
        code: Option<&str>,
    ) -> EngineResult<()> {
        self.feedback_ordinary(&format!("Initializing MITM plugin: {}", name));
        let dispatcher = self.dispatcher();

        if let Some(code) = code.filter(|c| !c.is_empty()) {
            return self
                .register(&dispatcher, ctx, name, params, code, MITM_AND_PORT_SCAN_HOOKS)
                .await;
        }

        if let Some(script_name) = name.strip_prefix(NASL_SCRIPT_PREFIX) {
            let mut params = params.clone();
            params.insert(NASL_SCRIPT_PARAM.to_string(), script_name.to_string());
            self.register_wrapped(&dispatcher, ctx, name, &params, WrapperKind::Nasl)
                .await;
            return Ok(());
        }

        let store = dispatcher.store().ok_or(EngineError::StoreNotConfigured)?;
        let script = store.get_by_name(name).await?;
        let mut merged = script.params.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let hooks = match script.script_type {
            ScriptType::Nuclei => {
                merged.insert(NUCLEI_TEMPLATE_PARAM.to_string(), script.name.clone());
                self.register_wrapped(&dispatcher, ctx, name, &merged, WrapperKind::Nuclei)
                    .await;
                return Ok(());
            }
            ScriptType::Mitm => MITM_MIRROR_HOOKS,
            ScriptType::PortScan => PORT_SCAN_HOOKS,
            _ => MITM_AND_PORT_SCAN_HOOKS,
        };
        self.register(&dispatcher, ctx, name, &merged, &script.content, hooks)
            .await
    }

    /// Reset the filters and make `code` the only caller of every MITM and
    /// port-scan hook it exports.
    pub async fn load_hot_patch(&self, ctx: &CancellationToken, code: &str) -> EngineResult<()> {
        self.reset_filter();
        self.feedback_ordinary("Initializing hot-patched MITM hooks");

        let dispatcher = self.dispatcher();
        let side_effect = self.feedback_bindings(&dispatcher, "");
        if let Err(e) = dispatcher
            .set(ctx, code, side_effect, MITM_AND_PORT_SCAN_HOOKS)
            .await
        {
            self.feedback_ordinary(&format!("Hot patch failed: {}", e));
            return Err(e);
        }
        Ok(())
    }

    async fn register(
        &self,
        dispatcher: &HookDispatcher,
        ctx: &CancellationToken,
        name: &str,
        params: &PluginParams,
        code: &str,
        hooks: &[&str],
    ) -> EngineResult<()> {
        let side_effect = self.feedback_bindings(dispatcher, name);
        let result = dispatcher
            .add(ctx, name, params, code, side_effect, hooks)
            .await;
        if let Err(e) = &result {
            self.feedback_ordinary(&format!("Initializing plugin [{}] failed: {}", name, e));
        }
        result
    }

    async fn register_wrapped(
        &self,
        dispatcher: &HookDispatcher,
        ctx: &CancellationToken,
        name: &str,
        params: &PluginParams,
        kind: WrapperKind,
    ) {
        let (hook, label) = match kind {
            WrapperKind::Nuclei => (EXEC_NUCLEI, "nuclei"),
            WrapperKind::Nasl => (EXEC_NASL, "nasl"),
        };

        let wrapper = dispatcher
            .loader()
            .ok_or(EngineError::LoaderNotConfigured)
            .and_then(|loader| {
                loader.wrapper_source(kind).ok_or_else(|| EngineError::LoadFailed {
                    plugin_id: name.to_string(),
                    reason: format!("loader has no {} wrapper", label),
                })
            });

        let outcome = match wrapper {
            Ok(source) => {
                let side_effect = self.feedback_bindings(dispatcher, name);
                dispatcher
                    .add(ctx, name, params, &source, side_effect, &[hook])
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            tracing::warn!(plugin_id = %name, kind = label, error = %e, "Wrapped plugin not loaded");
            self.feedback_ordinary(&format!("Initializing {} plugin [{}] failed: {}", label, name, e));
        }
    }

    fn feedback_bindings(&self, dispatcher: &HookDispatcher, plugin_id: &str) -> Option<BindingHook> {
        let sink = self.feedback.read().clone()?;
        let runtime_id = dispatcher.runtime_id();
        let owner = plugin_id.to_string();
        Some(Arc::new(move |bindings: &mut ScriptBindings| {
            bindings.insert(
                FEEDBACK_BINDING.to_string(),
                feedback_callback(sink.clone(), owner.clone(), runtime_id.clone()).into(),
            );
            bindings.insert(
                STATUS_BINDING.to_string(),
                status_callback(sink.clone(), owner.clone(), runtime_id.clone()).into(),
            );
        }))
    }

    // ------------------------------------------------------------------
    // Traffic
    // ------------------------------------------------------------------

    pub async fn mirror_http_flow(
        &self,
        is_https: bool,
        url: &str,
        request: &[u8],
        response: &[u8],
        body: &[u8],
        filters: &[bool],
    ) {
        self.mirror_http_flow_ex(self.config.mix.scan_port, is_https, url, request, response, body, filters)
            .await
    }

    /// Fan one observed exchange out to the mirror hooks.
    ///
    /// `mirrorFilteredHTTPFlow` only fires when every entry of `filters` is
    /// true.
    #[allow(clippy::too_many_arguments)]
    pub async fn mirror_http_flow_ex(
        &self,
        scan_port: bool,
        is_https: bool,
        url: &str,
        request: &[u8],
        response: &[u8],
        body: &[u8],
        filters: &[bool],
    ) {
        if !self.is_passed(url) {
            tracing::debug!(url = %url, "Target rejected by include/exclude lists");
            return;
        }

        let dispatcher = self.dispatcher();
        let flow = Flow {
            is_https,
            url,
            request,
            response,
            body,
        };

        self.fire(&dispatcher, MIRROR_HTTP_FLOW, &flow).await;

        match Url::parse(url) {
            Ok(parsed) => self.dedup(&dispatcher, scan_port, &parsed, &flow).await,
            Err(e) => tracing::warn!(url = %url, error = %e, "Cannot parse flow URL"),
        }

        if filters.iter().all(|passed| *passed) {
            self.fire(&dispatcher, MIRROR_FILTERED_HTTP_FLOW, &flow).await;
        }
    }

    async fn dedup(&self, dispatcher: &Arc<HookDispatcher>, scan_port: bool, url: &Url, flow: &Flow<'_>) {
        let site = match SiteTarget::from_url(url) {
            Ok(site) => site,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Flow URL has no site");
                return;
            }
        };

        let request = match self.shapes.get_or_parse(flow.request) {
            Ok(shape) => shape,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Unparsable request, using URL shape");
                Arc::new(RequestShape::from_url("GET", url))
            }
        };

        let filters = self.filters.read().clone();

        if filters
            .website
            .check_and_insert(shape::website_hash(&site, &request.method))
        {
            tracing::debug!(site = %site.host_port(), scheme = %site.scheme, "New website");
            self.fire(dispatcher, MIRROR_NEW_WEBSITE, flow).await;
            self.spawn_site_scans(dispatcher, scan_port, &site, url.as_str());
        }

        if filters.path.check_and_insert(shape::path_hash(&site, &request)) {
            self.fire(dispatcher, MIRROR_NEW_WEBSITE_PATH, flow).await;
        }

        if filters
            .path_params
            .check_and_insert(shape::path_params_hash(&site, &request))
        {
            self.fire(dispatcher, MIRROR_NEW_WEBSITE_PATH_PARAMS, flow).await;
        }
    }

    async fn fire(&self, dispatcher: &HookDispatcher, hook: &str, flow: &Flow<'_>) {
        if dispatcher.should_call_by_name(hook) {
            dispatcher.call_by_name(hook, flow.args()).await;
        }
    }

    fn spawn_site_scans(&self, dispatcher: &Arc<HookDispatcher>, scan_port: bool, site: &SiteTarget, url: &str) {
        if scan_port && !site.host.is_empty() && site.port > 0 && dispatcher.should_call_by_name(PORT_SCAN_HANDLE) {
            let dispatcher = dispatcher.clone();
            let matcher = self.matcher.clone();
            let use_cache = self.use_cache.load(Ordering::Relaxed);
            let host = site.host.clone();
            let port = site.port;
            self.spawn_gated(async move {
                tracing::info!(host = %host, port, "Matching service fingerprint");
                let result = match matcher.get().await {
                    Ok(matcher) => matcher.match_service(&host, port, use_cache).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(found) => match serde_json::to_value(&found) {
                        Ok(value) => dispatcher.call_by_name(PORT_SCAN_HANDLE, vec![value.into()]).await,
                        Err(e) => tracing::warn!(error = %e, "Cannot encode service match"),
                    },
                    Err(e) => tracing::debug!(host = %host, port, error = %e, "Fingerprint match failed"),
                }
            });
        }

        for hook in [EXEC_NUCLEI, EXEC_NASL] {
            if !dispatcher.should_call_by_name(hook) {
                continue;
            }
            let dispatcher = dispatcher.clone();
            let target = url.to_string();
            self.spawn_gated(async move {
                dispatcher.call_by_name(hook, vec![target.into()]).await;
            });
        }
    }

    /// Run `work` in the background behind the extra-concurrency gate.
    fn spawn_gated<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gate = self.gate.clone();
        let root = self.root.clone();
        self.tasks.spawn(async move {
            let _permit = tokio::select! {
                permit = gate.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = root.cancelled() => return,
            };
            work.await;
        });
    }

    /// Fire the port-scan and scanner hooks for one service and wait for
    /// all three.
    pub async fn handle_service_scan_result(&self, result: &ServiceMatch) {
        let dispatcher = self.dispatcher();
        let target = result.host_port();
        let found: HookValue = match serde_json::to_value(result) {
            Ok(value) => value.into(),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot encode service match");
                HookValue::Null
            }
        };

        tokio::join!(
            dispatcher.call_by_name(PORT_SCAN_HANDLE, vec![found]),
            dispatcher.call_by_name(EXEC_NUCLEI, vec![target.clone().into()]),
            dispatcher.call_by_name(EXEC_NASL, vec![target.into()]),
        );
    }

    // ------------------------------------------------------------------
    // Hijack
    // ------------------------------------------------------------------

    /// `hijackHTTPRequest(isHttps, url, request, forward, drop)`, inline.
    pub async fn call_hijack_request(
        &self,
        is_https: bool,
        url: &str,
        request: ArgThunk,
        forward: HookCallback,
        drop: HookCallback,
    ) {
        let args = vec![
            ArgThunk::value(is_https),
            ArgThunk::value(url),
            request,
            ArgThunk::value(forward),
            ArgThunk::value(drop),
        ];
        self.dispatcher()
            .call_by_name_ex_sync(HIJACK_HTTP_REQUEST, args)
            .await
    }

    /// `hijackHTTPResponse(isHttps, url, response, forward, drop)`, inline.
    pub async fn call_hijack_response(
        &self,
        is_https: bool,
        url: &str,
        response: ArgThunk,
        forward: HookCallback,
        drop: HookCallback,
    ) {
        let args = vec![
            ArgThunk::value(is_https),
            ArgThunk::value(url),
            response,
            ArgThunk::value(forward),
            ArgThunk::value(drop),
        ];
        self.dispatcher()
            .call_by_name_ex_sync(HIJACK_HTTP_RESPONSE, args)
            .await
    }

    /// `hijackHTTPResponseEx(isHttps, url, request, response, forward, drop)`, inline.
    pub async fn call_hijack_response_ex(
        &self,
        is_https: bool,
        url: &str,
        request: ArgThunk,
        response: ArgThunk,
        forward: HookCallback,
        drop: HookCallback,
    ) {
        let args = vec![
            ArgThunk::value(is_https),
            ArgThunk::value(url),
            request,
            response,
            ArgThunk::value(forward),
            ArgThunk::value(drop),
        ];
        self.dispatcher()
            .call_by_name_ex_sync(HIJACK_HTTP_RESPONSE_EX, args)
            .await
    }

    pub async fn hijack_save_http_flow(&self, flow: HookValue, forward: HookCallback, drop: HookCallback) {
        self.dispatcher()
            .call_by_name(HIJACK_SAVE_HTTP_FLOW, vec![flow, forward.into(), drop.into()])
            .await
    }

    /// Wait for background scans and then for the dispatcher, stopping
    /// early on shutdown.
    pub async fn wait(&self) {
        self.tasks.close();
        let dispatcher = self.dispatcher();
        tokio::select! {
            _ = async {
                self.tasks.wait().await;
                tracing::debug!("Mix caller tasks done");
                dispatcher.wait().await;
            } => {}
            _ = self.root.cancelled() => {
                tracing::debug!("Mix caller wait interrupted by shutdown");
            }
        }
        self.tasks.reopen();
    }
}

/// Builder for [`MixPluginCaller`].
#[derive(Default)]
pub struct MixPluginCallerBuilder {
    config: EngineConfig,
    dispatcher: Option<Arc<HookDispatcher>>,
    loader: Option<Arc<dyn ScriptLoader>>,
    store: Option<Arc<dyn ScriptStore>>,
    feedback: Option<Arc<dyn ResultSink>>,
    matcher_factory: Option<MatcherFactory>,
    target_filter: Option<Arc<dyn TargetFilter>>,
    parent: Option<CancellationToken>,
}

impl MixPluginCallerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing dispatcher. Loader and store settings are then ignored.
    pub fn with_dispatcher(mut self, dispatcher: Arc<HookDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
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

    pub fn with_feedback(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.feedback = Some(sink);
        self
    }

    pub fn with_matcher_factory(mut self, factory: MatcherFactory) -> Self {
        self.matcher_factory = Some(factory);
        self
    }

    pub fn with_target_filter(mut self, filter: Arc<dyn TargetFilter>) -> Self {
        self.target_filter = Some(filter);
        self
    }

    pub fn with_context(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(self) -> EngineResult<MixPluginCaller> {
        self.config.validate()?;
        let root = self
            .parent
            .map(|p| p.child_token())
            .unwrap_or_default();

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => {
                let mut builder = HookDispatcher::builder()
                    .with_config(self.config.clone())
                    .with_context(root.clone());
                if let Some(loader) = self.loader {
                    builder = builder.with_loader(loader);
                }
                if let Some(store) = self.store {
                    builder = builder.with_store(store);
                }
                if let Some(sink) = &self.feedback {
                    builder = builder.with_sink(sink.clone());
                }
                Arc::new(builder.build()?)
            }
        };

        let mix = &self.config.mix;
        Ok(MixPluginCaller {
            dispatcher: RwLock::new(dispatcher),
            filters: RwLock::new(Arc::new(WebsiteFilters::default())),
            matcher: Arc::new(LazyMatcher {
                cell: OnceCell::new(),
                factory: self.matcher_factory,
            }),
            target_filter: self
                .target_filter
                .unwrap_or_else(|| Arc::new(IncludeExcludeChecker::new())),
            feedback: RwLock::new(self.feedback),
            gate: Arc::new(Semaphore::new(mix.extra_concurrency)),
            tasks: TaskTracker::new(),
            root,
            use_cache: AtomicBool::new(mix.fingerprint_cache),
            shapes: RequestShapeCache::new(mix.request_cache_ttl(), mix.request_cache_capacity),
            config: self.config,
        })
    }
}
