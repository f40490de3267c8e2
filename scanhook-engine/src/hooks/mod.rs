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

//! Hook registry and dispatch.
//!
//! Plugins are loaded once and export callables under well-known hook names
//! (see [`names`]). Each callable becomes a [`Caller`] in the
//! [`HookRegistry`], keyed by the owning plugin id. The [`HookDispatcher`]
//! invokes every caller of a hook name, either inline in registration order
//! or on a bounded pool of tasks.
//!
//! # Architecture
//!
//! - Registry lookups and existence checks: O(1) per hook name
//! - Dispatch: O(k) where k = callers registered for the hook
//! - Every invocation gets its own cancellation token and, when tracing is
//!   enabled, its own trace
//!
//! # Example
//!
//! ```rust,ignore
//! use scanhook_engine::hooks::{hook_fn, HookDispatcher};
//! use scanhook_engine::HookValue;
//!
//! let dispatcher = HookDispatcher::new();
//! dispatcher.add_native("logger", "mirrorHTTPFlow", hook_fn(|_ctx, args| {
//!     tracing::info!(url = %args[1].to_display_string(), "flow");
//!     Ok(HookValue::Null)
//! }));
//! dispatcher.call_by_name("mirrorHTTPFlow", vec![false.into(), "http://a/".into()]).await;
//! ```

pub mod caller;
pub mod dispatcher;
pub mod names;
pub mod registry;

pub use caller::{
    async_hook_fn, caller_hash, hook_fn, AsyncFnHook, Caller, FnHook, HookError, HookFunction,
    InvocationContext, NoOpHook, SharedHookFunction,
};
pub use dispatcher::{
    BindingHook, HookDispatcher, HookDispatcherBuilder, PluginParams, RemoveHookParams,
};
pub use registry::{CallerInfo, HookRegistry};
