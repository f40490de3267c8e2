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

//! Script loading and storage collaborators.
//!
//! The engine never interprets script source itself. A [`ScriptLoader`]
//! turns source text plus a set of bindings into a [`LoadedUnit`], from
//! which the dispatcher looks up one [`HookFunction`] per exported hook.

use crate::hooks::caller::SharedHookFunction;
use crate::value::HookValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Binding holding the plugin parameters as a map.
pub const PARAMS_BINDING: &str = "MITM_PARAMS";
/// Binding holding the plugin id.
pub const PLUGIN_BINDING: &str = "MITM_PLUGIN";
pub const PLUGIN_ID_BINDING: &str = "PLUGIN_ID";
pub const RUNTIME_ID_BINDING: &str = "RUNTIME_ID";
pub const PROXY_BINDING: &str = "PROXY";
pub const FEEDBACK_BINDING: &str = "feedback";
pub const STATUS_BINDING: &str = "status";

/// Parameter carrying the nuclei template name into the wrapper script.
pub const NUCLEI_TEMPLATE_PARAM: &str = "CURRENT_NUCLEI_PLUGIN_NAME";
/// Parameter carrying the NASL script name into the wrapper script.
pub const NASL_SCRIPT_PARAM: &str = "NASL_SCRIPT_NAME";
/// Name prefix identifying NASL scripts.
pub const NASL_SCRIPT_PREFIX: &str = "__NaslScript__";

/// Variables injected into a script before it is loaded.
pub type ScriptBindings = BTreeMap<String, HookValue>;

/// Errors reported by a loader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Runtime error during load: {0}")]
    Runtime(String),

    #[error("Load cancelled")]
    Cancelled,
}

/// Everything a loader needs to produce a unit.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub plugin_id: String,
    pub source: String,
    pub bindings: ScriptBindings,
    /// Hook names the caller intends to look up.
    pub symbols: Vec<String>,
    /// Cancelled when the load deadline passes.
    pub context: CancellationToken,
}

/// A compiled script exposing named callables.
pub trait LoadedUnit: Send + Sync {
    fn lookup(&self, symbol: &str) -> Option<SharedHookFunction>;

    fn symbols(&self) -> Vec<String>;
}

/// Wrapper scripts a loader can provide for template-driven plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperKind {
    Nuclei,
    Nasl,
}

/// Compiler/interpreter for plugin source.
#[async_trait]
pub trait ScriptLoader: Send + Sync {
    async fn load(&self, request: LoadRequest) -> Result<Box<dyn LoadedUnit>, LoadError>;

    /// Source of the wrapper that drives a nuclei template or NASL script.
    fn wrapper_source(&self, _kind: WrapperKind) -> Option<String> {
        None
    }
}

/// Loaded unit backed by native Rust hook functions.
#[derive(Default, Clone)]
pub struct NativeUnit {
    symbols: HashMap<String, SharedHookFunction>,
}

impl NativeUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, name: impl Into<String>, function: SharedHookFunction) -> Self {
        self.symbols.insert(name.into(), function);
        self
    }
}

impl fmt::Debug for NativeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.symbols.keys().collect();
        names.sort();
        f.debug_struct("NativeUnit").field("symbols", &names).finish()
    }
}

impl LoadedUnit for NativeUnit {
    fn lookup(&self, symbol: &str) -> Option<SharedHookFunction> {
        self.symbols.get(symbol).cloned()
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }
}

/// Kind of stored script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    Mitm,
    PortScan,
    Nuclei,
    Nasl,
    Codec,
    #[serde(untagged)]
    Other(String),
}

impl ScriptType {
    pub fn as_str(&self) -> &str {
        match self {
            ScriptType::Mitm => "mitm",
            ScriptType::PortScan => "port-scan",
            ScriptType::Nuclei => "nuclei",
            ScriptType::Nasl => "nasl",
            ScriptType::Codec => "codec",
            ScriptType::Other(s) => s,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A script as kept by the persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub content: String,
    pub script_type: ScriptType,
    /// Default parameter values, applied before explicit ones.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Script {
    pub fn new(name: impl Into<String>, script_type: ScriptType, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            script_type,
            params: BTreeMap::new(),
        }
    }
}

/// Selector for [`ScriptStore::yield_scripts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptQuery {
    ByType(ScriptType),
    ByNames(Vec<String>),
}

impl fmt::Display for ScriptQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptQuery::ByType(t) => write!(f, "type={}", t),
            ScriptQuery::ByNames(names) => write!(f, "names={}", names.join(",")),
        }
    }
}

/// Errors reported by a script store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Persistent script storage. Only used at load time.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Script, StoreError>;

    /// Stream scripts matching the query.
    fn yield_scripts(&self, query: ScriptQuery) -> mpsc::Receiver<Script>;
}

/// Script store held in memory.
#[derive(Debug, Default)]
pub struct MemoryScriptStore {
    scripts: parking_lot::RwLock<Vec<Script>>,
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, script: Script) {
        let mut scripts = self.scripts.write();
        scripts.retain(|s| s.name != script.name);
        scripts.push(script);
    }

    pub fn len(&self) -> usize {
        self.scripts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.read().is_empty()
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn get_by_name(&self, name: &str) -> Result<Script, StoreError> {
        self.scripts
            .read()
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn yield_scripts(&self, query: ScriptQuery) -> mpsc::Receiver<Script> {
        let matching: Vec<Script> = self
            .scripts
            .read()
            .iter()
            .filter(|s| match &query {
                ScriptQuery::ByType(t) => &s.script_type == t,
                ScriptQuery::ByNames(names) => names.contains(&s.name),
            })
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel(matching.len().max(1));
        for script in matching {
            // Capacity covers every item, so this cannot fail.
            let _ = tx.try_send(script);
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::caller::NoOpHook;
    use std::sync::Arc;

    #[test]
    fn test_native_unit_lookup() {
        let unit = NativeUnit::new().with_symbol("mirrorHTTPFlow", Arc::new(NoOpHook));
        assert!(unit.lookup("mirrorHTTPFlow").is_some());
        assert!(unit.lookup("hijackHTTPRequest").is_none());
        assert_eq!(unit.symbols(), vec!["mirrorHTTPFlow".to_string()]);
    }

    #[test]
    fn test_script_type_serde() {
        assert_eq!(serde_json::to_string(&ScriptType::PortScan).unwrap(), "\"port-scan\"");
        let t: ScriptType = serde_json::from_str("\"mitm\"").unwrap();
        assert_eq!(t, ScriptType::Mitm);
        let t: ScriptType = serde_json::from_str("\"yak\"").unwrap();
        assert_eq!(t, ScriptType::Other("yak".into()));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryScriptStore::new();
        store.insert(Script::new("a", ScriptType::Mitm, "code-a"));
        store.insert(Script::new("b", ScriptType::PortScan, "code-b"));
        store.insert(Script::new("a", ScriptType::Mitm, "code-a2"));
        assert_eq!(store.len(), 2);

        assert_eq!(store.get_by_name("a").await.unwrap().content, "code-a2");
        assert!(matches!(
            store.get_by_name("zzz").await,
            Err(StoreError::NotFound(_))
        ));

        let mut rx = store.yield_scripts(ScriptQuery::ByType(ScriptType::PortScan));
        assert_eq!(rx.recv().await.unwrap().name, "b");
        assert!(rx.recv().await.is_none());

        let mut rx = store.yield_scripts(ScriptQuery::ByNames(vec!["zzz".into()]));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_yield_is_filled_before_returning() {
        let store = MemoryScriptStore::new();
        store.insert(Script::new("a", ScriptType::Nuclei, "id: a"));
        store.insert(Script::new("b", ScriptType::Nuclei, "id: b"));

        let mut rx = store.yield_scripts(ScriptQuery::ByType(ScriptType::Nuclei));
        drop(store);
        let names = tokio_test::block_on(async {
            let mut names = Vec::new();
            while let Some(script) = rx.recv().await {
                names.push(script.name);
            }
            names
        });
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
