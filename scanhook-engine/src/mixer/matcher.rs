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

//! Service fingerprint matcher collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Unknown,
}

/// Result of fingerprinting one host:port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMatch {
    pub host: String,
    pub port: u16,
    pub state: PortState,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub banner: String,
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

impl ServiceMatch {
    pub fn open(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            state: PortState::Open,
            protocol: "tcp".to_string(),
            service: String::new(),
            banner: String::new(),
            fingerprints: Vec::new(),
        }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
#[error("Fingerprint match failed: {0}")]
pub struct MatchError(pub String);

/// Fingerprints the service listening on a host and port.
#[async_trait]
pub trait FingerprintMatcher: Send + Sync {
    async fn match_service(
        &self,
        host: &str,
        port: u16,
        use_cache: bool,
    ) -> Result<ServiceMatch, MatchError>;
}

/// Builds the matcher on first use.
pub type MatcherFactory =
    Arc<dyn Fn() -> Result<Arc<dyn FingerprintMatcher>, MatchError> + Send + Sync>;
