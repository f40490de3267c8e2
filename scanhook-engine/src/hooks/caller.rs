// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Callable hook units and the errors they return.

use crate::value::HookValue;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during hook execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("Hook execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Hook timed out after {timeout_ms}ms (deadline exceeded)")]
    Timeout { timeout_ms: u64 },

    #[error("Hook execution cancelled")]
    Cancelled,

    #[error("Hook panicked: {0}")]
    Panicked(String),

    #[error("Invalid hook argument: {0}")]
    InvalidArgument(String),
}

/// Per-invocation context handed to a hook body.
///
/// The token is cancelled when the invocation is cancelled, times out, or
/// the engine shuts down. Hook bodies are expected to observe it.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    cancel: CancellationToken,
    plugin_id: String,
    hook_name: String,
    trace_id: Option<String>,
}

impl InvocationContext {
    pub fn new(
        cancel: CancellationToken,
        plugin_id: impl Into<String>,
        hook_name: impl Into<String>,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            cancel,
            plugin_id: plugin_id.into(),
            hook_name: hook_name.into(),
            trace_id,
        }
    }

    /// Context that is never cancelled. Useful for direct calls in tests.
    pub fn detached(plugin_id: impl Into<String>, hook_name: impl Into<String>) -> Self {
        Self::new(CancellationToken::new(), plugin_id, hook_name, None)
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the invocation is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// The narrow capability a loaded script exposes per exported symbol.
#[async_trait]
pub trait HookFunction: Send + Sync {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        args: Vec<HookValue>,
    ) -> Result<HookValue, HookError>;
}

/// Shared handle to a hook function.
pub type SharedHookFunction = Arc<dyn HookFunction>;

/// One loaded implementation of a hook, owned by a plugin.
#[derive(Clone)]
pub struct Caller {
    /// Fingerprint of (source, hook name, plugin id).
    pub hash: String,
    /// Owning plugin. Empty for anonymous hot patches.
    pub plugin_id: String,
    /// Display label, defaults to the plugin id.
    pub verbose: String,
    pub function: SharedHookFunction,
}

impl Caller {
    pub fn new(
        plugin_id: impl Into<String>,
        hook_name: &str,
        source: &str,
        function: SharedHookFunction,
    ) -> Self {
        let plugin_id = plugin_id.into();
        Self {
            hash: caller_hash(source, hook_name, &plugin_id),
            verbose: plugin_id.clone(),
            plugin_id,
            function,
        }
    }

    pub fn with_verbose(mut self, verbose: impl Into<String>) -> Self {
        self.verbose = verbose.into();
        self
    }
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("hash", &self.hash)
            .field("plugin_id", &self.plugin_id)
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// Content fingerprint of a caller.
pub fn caller_hash(source: &str, hook_name: &str, plugin_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [source, hook_name, plugin_id] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Hook backed by a synchronous closure.
pub struct FnHook<F>
where
    F: Fn(&InvocationContext, Vec<HookValue>) -> Result<HookValue, HookError> + Send + Sync,
{
    callback: F,
}

impl<F> FnHook<F>
where
    F: Fn(&InvocationContext, Vec<HookValue>) -> Result<HookValue, HookError> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> HookFunction for FnHook<F>
where
    F: Fn(&InvocationContext, Vec<HookValue>) -> Result<HookValue, HookError>
        + Send
        + Sync
        + 'static,
{
    async fn invoke(
        &self,
        ctx: InvocationContext,
        args: Vec<HookValue>,
    ) -> Result<HookValue, HookError> {
        (self.callback)(&ctx, args)
    }
}

/// Hook backed by an async closure.
pub struct AsyncFnHook<F, Fut>
where
    F: Fn(InvocationContext, Vec<HookValue>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HookValue, HookError>> + Send,
{
    callback: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnHook<F, Fut>
where
    F: Fn(InvocationContext, Vec<HookValue>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HookValue, HookError>> + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> HookFunction for AsyncFnHook<F, Fut>
where
    F: Fn(InvocationContext, Vec<HookValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookValue, HookError>> + Send + 'static,
{
    async fn invoke(
        &self,
        ctx: InvocationContext,
        args: Vec<HookValue>,
    ) -> Result<HookValue, HookError> {
        (self.callback)(ctx, args).await
    }
}

/// Hook that does nothing.
#[derive(Debug, Default)]
pub struct NoOpHook;

#[async_trait]
impl HookFunction for NoOpHook {
    async fn invoke(
        &self,
        _ctx: InvocationContext,
        _args: Vec<HookValue>,
    ) -> Result<HookValue, HookError> {
        Ok(HookValue::Null)
    }
}

/// Wrap a synchronous closure into a shared hook function.
pub fn hook_fn<F>(f: F) -> SharedHookFunction
where
    F: Fn(&InvocationContext, Vec<HookValue>) -> Result<HookValue, HookError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHook::new(f))
}

/// Wrap an async closure into a shared hook function.
pub fn async_hook_fn<F, Fut>(f: F) -> SharedHookFunction
where
    F: Fn(InvocationContext, Vec<HookValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookValue, HookError>> + Send + 'static,
{
    Arc::new(AsyncFnHook::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_noop_hook() {
        let result = NoOpHook
            .invoke(InvocationContext::detached("p", "h"), vec![])
            .await
            .unwrap();
        assert!(result.is_null());
    }

    #[tokio::test]
    async fn test_fn_hook_sees_context() {
        let hook = hook_fn(|ctx, args| {
            Ok(HookValue::from(format!(
                "{}:{}:{}",
                ctx.plugin_id(),
                ctx.hook_name(),
                args.len()
            )))
        });

        let out = hook
            .invoke(InvocationContext::detached("plugin", "mirrorHTTPFlow"), vec![HookValue::Null])
            .await
            .unwrap();
        assert_eq!(out, HookValue::from("plugin:mirrorHTTPFlow:1"));
    }

    #[tokio::test]
    async fn test_async_hook_observes_cancellation() {
        let hook = async_hook_fn(|ctx: InvocationContext, _args| async move {
            tokio::select! {
                _ = ctx.cancelled() => Err(HookError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(HookValue::Null),
            }
        });

        let token = CancellationToken::new();
        let ctx = InvocationContext::new(token.clone(), "p", "h", None);
        token.cancel();
        assert_eq!(hook.invoke(ctx, vec![]).await, Err(HookError::Cancelled));
    }

    #[test]
    fn test_caller_hash_depends_on_all_parts() {
        let base = caller_hash("code", "hook", "plugin");
        assert_eq!(base, caller_hash("code", "hook", "plugin"));
        assert_ne!(base, caller_hash("code2", "hook", "plugin"));
        assert_ne!(base, caller_hash("code", "hook2", "plugin"));
        assert_ne!(base, caller_hash("code", "hook", "plugin2"));
        assert_ne!(caller_hash("ab", "c", ""), caller_hash("a", "bc", ""));
    }

    #[test]
    fn test_caller_verbose_defaults_to_plugin_id() {
        let caller = Caller::new("plugin-x", "hook", "src", Arc::new(NoOpHook));
        assert_eq!(caller.verbose, "plugin-x");
        let caller = caller.with_verbose("Plugin X");
        assert_eq!(caller.verbose, "Plugin X");
    }
}
