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

//! Scanhook Engine
//!
//! Dynamic hook execution and tracing for scan plugins.
//!
//! # Architecture
//!
//! - **Registry & Dispatcher** ([`hooks`]): loads plugin source through a
//!   [`ScriptLoader`], registers one caller per exported hook name and
//!   invokes callers inline or on a bounded task pool, with load and call
//!   timeouts
//! - **Execution Tracker** ([`tracker`]): one trace per invocation, driven
//!   through `Pending -> Running -> Completed | Failed | Cancelled`, with
//!   terminal traces kept in a bounded stale queue
//! - **Traffic Fan-out** ([`mixer`]): deduplicates observed HTTP traffic by
//!   site, path and parameter shape and fans it out to the mirror, hijack
//!   and scanner hooks
//!
//! The engine never interprets plugin source. Hosts supply the loader,
//! script store, result sink and fingerprint matcher.
//!
//! # Example
//!
//! ```rust,ignore
//! use scanhook_engine::{EngineConfig, HookDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dispatcher = HookDispatcher::builder()
//!         .with_config(EngineConfig::from_env())
//!         .with_loader(my_loader())
//!         .with_tracing(true)
//!         .build()?;
//!
//!     let ctx = dispatcher.context();
//!     dispatcher
//!         .add(&ctx, "demo", &Default::default(), SOURCE, None, &["mirrorHTTPFlow"])
//!         .await?;
//!     dispatcher.call_by_name("mirrorHTTPFlow", vec![]).await;
//!     dispatcher.wait().await;
//!
//!     for trace in dispatcher.get_all_execution_traces() {
//!         println!("{} {} {}", trace.plugin_id, trace.hook_name, trace.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod feedback;
pub mod hooks;
pub mod loader;
pub mod mixer;
pub mod telemetry;
pub mod tracker;
pub mod value;

// Re-exports
pub use config::{ConfigError, EngineConfig, MixCallerConfig};
pub use error::{EngineError, EngineResult};
pub use feedback::{ExecResult, FeedbackLog, ResultSink, SinkError};
pub use hooks::{
    Caller, HookDispatcher, HookDispatcherBuilder, HookError, HookFunction, HookRegistry,
    InvocationContext, PluginParams, RemoveHookParams, SharedHookFunction,
};
pub use loader::{
    LoadError, LoadRequest, LoadedUnit, MemoryScriptStore, NativeUnit, Script, ScriptLoader,
    ScriptQuery, ScriptStore, ScriptType, StoreError, WrapperKind,
};
pub use mixer::{
    FingerprintMatcher, IncludeExcludeChecker, MatchError, MixPluginCaller,
    MixPluginCallerBuilder, ServiceMatch, TargetFilter,
};
pub use telemetry::{init_logging, LogFormat};
pub use tracker::{
    ExecutionStatistics, ExecutionStatus, PluginExecutionTrace, PluginExecutionTracker,
    StaleQueueInfo, StaleTraceQueue, TraceCallback, TraceSnapshot,
};
pub use value::{ArgThunk, HookCallback, HookValue};
