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

//! Membership filters for deduplication and the target allow-list.

use dashmap::{DashMap, DashSet};
use regex::Regex;

/// Exact set of already seen hashes.
#[derive(Debug, Default)]
pub struct SeenFilter {
    seen: DashSet<String>,
}

impl SeenFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exist(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    pub fn insert(&self, hash: impl Into<String>) {
        self.seen.insert(hash.into());
    }

    /// Mark `hash` as seen. True if it was not seen before.
    pub fn check_and_insert(&self, hash: impl Into<String>) -> bool {
        self.seen.insert(hash.into())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// The three dedup filters of the traffic fan-out.
#[derive(Debug, Default)]
pub struct WebsiteFilters {
    pub website: SeenFilter,
    pub path: SeenFilter,
    pub path_params: SeenFilter,
}

/// Allow/deny decision for a scan target.
pub trait TargetFilter: Send + Sync {
    fn is_allowed(&self, includes: &[String], excludes: &[String], target: &str) -> bool;
}

/// Wildcard include/exclude matcher.
///
/// Patterns match the host, `host:port`, or the whole target, with `*`
/// matching any run of characters. An empty include list allows everything
/// that is not excluded.
///
/// Each distinct pattern is compiled once and kept for later checks.
/// Invalid patterns are remembered as non-matching.
#[derive(Debug, Default)]
pub struct IncludeExcludeChecker {
    compiled: DashMap<String, Option<Regex>>,
}

impl IncludeExcludeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct patterns compiled so far.
    pub fn compiled_len(&self) -> usize {
        self.compiled.len()
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        if let Some(entry) = self.compiled.get(pattern) {
            return entry.value().clone();
        }
        self.compiled
            .entry(pattern.to_string())
            .or_insert_with(|| wildcard(pattern))
            .value()
            .clone()
    }

    fn candidates(target: &str) -> Vec<String> {
        let mut out = vec![target.to_ascii_lowercase()];
        if let Ok(url) = url::Url::parse(target) {
            if let Some(host) = url.host_str() {
                out.push(host.to_ascii_lowercase());
                if let Some(port) = url.port_or_known_default() {
                    out.push(format!("{}:{}", host.to_ascii_lowercase(), port));
                }
            }
        } else if let Some((host, _)) = target.rsplit_once(':') {
            out.push(host.to_ascii_lowercase());
        }
        out
    }

    fn matches_any(&self, patterns: &[String], candidates: &[String]) -> bool {
        patterns.iter().any(|pattern| match self.compiled(pattern) {
            Some(re) => candidates.iter().any(|c| re.is_match(c)),
            None => false,
        })
    }
}

fn wildcard(pattern: &str) -> Option<Regex> {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern.is_empty() {
        return None;
    }
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("^{}$", escaped)) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Ignoring invalid target pattern");
            None
        }
    }
}

impl TargetFilter for IncludeExcludeChecker {
    fn is_allowed(&self, includes: &[String], excludes: &[String], target: &str) -> bool {
        let candidates = Self::candidates(target);
        if !includes.is_empty() && !self.matches_any(includes, &candidates) {
            return false;
        }
        !self.matches_any(excludes, &candidates)
    }
}
