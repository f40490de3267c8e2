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

//! Dynamic values passed into and returned from hooks.
//!
//! Hook bodies live in an external interpreter, so arguments cross the
//! boundary as a small tagged union instead of Rust generics. Callables
//! (for example the `forward`/`drop` continuations of hijack hooks) travel
//! as [`HookCallback`].

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Signature of a host-provided callable handed to a hook.
pub type CallbackFn = dyn Fn(Vec<HookValue>) -> HookValue + Send + Sync;

/// A named host callable that can be passed as a hook argument.
#[derive(Clone)]
pub struct HookCallback {
    name: String,
    func: Arc<CallbackFn>,
}

impl HookCallback {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<HookValue>) -> HookValue + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the callable with the given arguments.
    pub fn call(&self, args: Vec<HookValue>) -> HookValue {
        (self.func)(args)
    }
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookCallback").field("name", &self.name).finish()
    }
}

impl PartialEq for HookCallback {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.func, &other.func)
    }
}

impl Serialize for HookCallback {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("<callback {}>", self.name))
    }
}

/// A value crossing the host/hook boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(untagged)]
pub enum HookValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<HookValue>),
    Map(BTreeMap<String, HookValue>),
    Json(serde_json::Value),
    Callback(HookCallback),
}

impl HookValue {
    pub fn is_null(&self) -> bool {
        matches!(self, HookValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HookValue::Str(s) => Some(s),
            HookValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HookValue::Bytes(b) => Some(b),
            HookValue::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HookValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HookValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&HookCallback> {
        match self {
            HookValue::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    /// Render the value as feedback text. Byte payloads are decoded lossily.
    pub fn to_display_string(&self) -> String {
        match self {
            HookValue::Null => String::new(),
            HookValue::Bool(b) => b.to_string(),
            HookValue::Int(i) => i.to_string(),
            HookValue::Float(f) => f.to_string(),
            HookValue::Str(s) => s.clone(),
            HookValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            HookValue::Callback(cb) => format!("<callback {}>", cb.name()),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl From<bool> for HookValue {
    fn from(v: bool) -> Self {
        HookValue::Bool(v)
    }
}

impl From<i64> for HookValue {
    fn from(v: i64) -> Self {
        HookValue::Int(v)
    }
}

impl From<u16> for HookValue {
    fn from(v: u16) -> Self {
        HookValue::Int(i64::from(v))
    }
}

impl From<&str> for HookValue {
    fn from(v: &str) -> Self {
        HookValue::Str(v.to_string())
    }
}

impl From<String> for HookValue {
    fn from(v: String) -> Self {
        HookValue::Str(v)
    }
}

impl From<Vec<u8>> for HookValue {
    fn from(v: Vec<u8>) -> Self {
        HookValue::Bytes(v)
    }
}

impl From<&[u8]> for HookValue {
    fn from(v: &[u8]) -> Self {
        HookValue::Bytes(v.to_vec())
    }
}

impl From<serde_json::Value> for HookValue {
    fn from(v: serde_json::Value) -> Self {
        HookValue::Json(v)
    }
}

impl From<HookCallback> for HookValue {
    fn from(v: HookCallback) -> Self {
        HookValue::Callback(v)
    }
}

impl From<BTreeMap<String, HookValue>> for HookValue {
    fn from(v: BTreeMap<String, HookValue>) -> Self {
        HookValue::Map(v)
    }
}

impl From<Vec<HookValue>> for HookValue {
    fn from(v: Vec<HookValue>) -> Self {
        HookValue::List(v)
    }
}

/// A lazily evaluated hook argument.
///
/// Thunks are evaluated once per matching caller, and never when no caller
/// is registered for the hook.
#[derive(Clone)]
pub struct ArgThunk(Arc<dyn Fn() -> HookValue + Send + Sync>);

impl ArgThunk {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> HookValue + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap an already computed value.
    pub fn value(value: impl Into<HookValue>) -> Self {
        let value = value.into();
        Self::new(move || value.clone())
    }

    pub fn evaluate(&self) -> HookValue {
        (self.0)()
    }
}

impl fmt::Debug for ArgThunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArgThunk")
    }
}

/// Convert eager arguments into thunks.
pub fn eager(args: Vec<HookValue>) -> Vec<ArgThunk> {
    args.into_iter().map(ArgThunk::value).collect()
}
