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

//! Hook table mapping hook names to their loaded callers.

use super::caller::Caller;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;

/// Summary of one registered caller, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerInfo {
    pub plugin_id: String,
    pub verbose: String,
    pub hash: String,
}

/// Registry of callers per hook name.
///
/// Entries are sharded by hook name, so loading a plugin into one hook never
/// blocks dispatch of another. Within a hook name, callers are keyed by
/// plugin id and kept in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: DashMap<String, Vec<Caller>>,
}

impl HookRegistry {
    /// Create a new empty hook registry.
    pub fn new() -> Self {
        Self {
            hooks: DashMap::new(),
        }
    }

    /// Insert a caller, replacing the existing caller of the same plugin
    /// in place. Returns the replaced caller.
    pub fn insert(&self, hook_name: &str, caller: Caller) -> Option<Caller> {
        let mut callers = self.hooks.entry(hook_name.to_string()).or_default();
        match callers.iter_mut().find(|c| c.plugin_id == caller.plugin_id) {
            Some(existing) => Some(std::mem::replace(existing, caller)),
            None => {
                callers.push(caller);
                None
            }
        }
    }

    /// Replace every caller of a hook name.
    pub fn replace_all(&self, hook_name: &str, callers: Vec<Caller>) {
        self.hooks.insert(hook_name.to_string(), callers);
    }

    /// Snapshot of the callers of a hook name, in registration order.
    pub fn callers(&self, hook_name: &str) -> Vec<Caller> {
        self.hooks
            .get(hook_name)
            .map(|callers| callers.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the callers of one plugin under a hook name.
    pub fn plugin_caller(&self, hook_name: &str, plugin_id: &str) -> Option<Caller> {
        self.hooks
            .get(hook_name)
            .and_then(|callers| callers.iter().find(|c| c.plugin_id == plugin_id).cloned())
    }

    /// Whether any caller is registered under the hook name.
    pub fn has_callers(&self, hook_name: &str) -> bool {
        self.hooks
            .get(hook_name)
            .map(|callers| !callers.is_empty())
            .unwrap_or(false)
    }

    /// Drop a hook name entirely.
    pub fn remove_hook(&self, hook_name: &str) -> Vec<Caller> {
        self.hooks
            .remove(hook_name)
            .map(|(_, callers)| callers)
            .unwrap_or_default()
    }

    /// Remove the callers of the given plugins from one hook name.
    pub fn remove_plugins(&self, hook_name: &str, plugin_ids: &HashSet<String>) -> Vec<Caller> {
        let mut removed = Vec::new();
        if let Some(mut callers) = self.hooks.get_mut(hook_name) {
            callers.retain(|c| {
                if plugin_ids.contains(&c.plugin_id) {
                    removed.push(c.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.hooks.remove_if(hook_name, |_, callers| callers.is_empty());
        removed
    }

    /// Names of all hooks with at least one caller.
    pub fn hook_names(&self) -> Vec<String> {
        self.hooks
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of hook name to caller summaries.
    pub fn snapshot(&self) -> Vec<(String, Vec<CallerInfo>)> {
        let mut out: Vec<_> = self
            .hooks
            .iter()
            .map(|entry| {
                let infos = entry
                    .value()
                    .iter()
                    .map(|c| CallerInfo {
                        plugin_id: c.plugin_id.clone(),
                        verbose: c.verbose.clone(),
                        hash: c.hash.clone(),
                    })
                    .collect();
                (entry.key().clone(), infos)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Total number of callers across all hooks.
    pub fn caller_count(&self) -> usize {
        self.hooks.iter().map(|entry| entry.value().len()).sum()
    }

    /// Clear all hooks.
    pub fn clear(&self) {
        self.hooks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::caller::NoOpHook;
    use super::*;
    use std::sync::Arc;

    fn caller(plugin_id: &str, source: &str) -> Caller {
        Caller::new(plugin_id, "mirrorHTTPFlow", source, Arc::new(NoOpHook))
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = HookRegistry::new();
        assert!(!registry.has_callers("mirrorHTTPFlow"));

        registry.insert("mirrorHTTPFlow", caller("a", "v1"));
        assert!(registry.has_callers("mirrorHTTPFlow"));
        assert_eq!(registry.callers("mirrorHTTPFlow").len(), 1);
        assert!(registry.callers("unknown").is_empty());
    }

    #[test]
    fn test_insert_replaces_same_plugin_in_place() {
        let registry = HookRegistry::new();
        registry.insert("mirrorHTTPFlow", caller("a", "v1"));
        registry.insert("mirrorHTTPFlow", caller("b", "v1"));

        let replaced = registry.insert("mirrorHTTPFlow", caller("a", "v2"));
        assert!(replaced.is_some());

        let callers = registry.callers("mirrorHTTPFlow");
        assert_eq!(callers.len(), 2);
        assert_eq!(callers[0].plugin_id, "a");
        assert_eq!(callers[0].hash, caller("a", "v2").hash);
        assert_eq!(callers[1].plugin_id, "b");
    }

    #[test]
    fn test_remove_plugins() {
        let registry = HookRegistry::new();
        registry.insert("mirrorHTTPFlow", caller("a", "v1"));
        registry.insert("mirrorHTTPFlow", caller("b", "v1"));

        let ids: HashSet<String> = ["a".to_string()].into_iter().collect();
        let removed = registry.remove_plugins("mirrorHTTPFlow", &ids);
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.callers("mirrorHTTPFlow")[0].plugin_id, "b");

        let ids: HashSet<String> = ["b".to_string()].into_iter().collect();
        registry.remove_plugins("mirrorHTTPFlow", &ids);
        assert!(!registry.has_callers("mirrorHTTPFlow"));
        assert!(registry.hook_names().is_empty());
    }

    #[test]
    fn test_replace_all_and_snapshot() {
        let registry = HookRegistry::new();
        registry.insert("b", caller("x", "v1"));
        registry.insert("a", caller("y", "v1"));
        registry.replace_all("b", vec![caller("", "patch")]);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "a");
        assert_eq!(snapshot[1].1.len(), 1);
        assert_eq!(snapshot[1].1[0].plugin_id, "");
        assert_eq!(registry.caller_count(), 2);

        registry.clear();
        assert_eq!(registry.caller_count(), 0);
    }
}
