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

//! Well-known hook names exported by scan plugins.

/// Lifecycle hook called when a plugin is unloaded.
pub const HOOK_CLEAR: &str = "clear";

pub const MIRROR_HTTP_FLOW: &str = "mirrorHTTPFlow";
pub const MIRROR_FILTERED_HTTP_FLOW: &str = "mirrorFilteredHTTPFlow";
pub const MIRROR_NEW_WEBSITE: &str = "mirrorNewWebsite";
pub const MIRROR_NEW_WEBSITE_PATH: &str = "mirrorNewWebsitePath";
pub const MIRROR_NEW_WEBSITE_PATH_PARAMS: &str = "mirrorNewWebsitePathParams";

pub const HIJACK_HTTP_REQUEST: &str = "hijackHTTPRequest";
pub const HIJACK_HTTP_RESPONSE: &str = "hijackHTTPResponse";
pub const HIJACK_HTTP_RESPONSE_EX: &str = "hijackHTTPResponseEx";
pub const HIJACK_SAVE_HTTP_FLOW: &str = "hijackSaveHTTPFlow";

/// Port-scan result handler.
pub const PORT_SCAN_HANDLE: &str = "handle";
pub const EXEC_NUCLEI: &str = "execNuclei";
pub const EXEC_NASL: &str = "execNasl";

/// Hooks bound for a stored script of type `mitm`.
pub const MITM_MIRROR_HOOKS: &[&str] = &[
    MIRROR_HTTP_FLOW,
    MIRROR_FILTERED_HTTP_FLOW,
    MIRROR_NEW_WEBSITE,
    MIRROR_NEW_WEBSITE_PATH,
    MIRROR_NEW_WEBSITE_PATH_PARAMS,
];

/// Hooks bound for a stored script of type `port-scan`.
pub const PORT_SCAN_HOOKS: &[&str] = &[PORT_SCAN_HANDLE];

/// Hooks a MITM or port-scan plugin may export.
pub const MITM_AND_PORT_SCAN_HOOKS: &[&str] = &[
    MIRROR_HTTP_FLOW,
    MIRROR_FILTERED_HTTP_FLOW,
    MIRROR_NEW_WEBSITE,
    MIRROR_NEW_WEBSITE_PATH,
    MIRROR_NEW_WEBSITE_PATH_PARAMS,
    HIJACK_HTTP_REQUEST,
    HIJACK_HTTP_RESPONSE,
    HIJACK_HTTP_RESPONSE_EX,
    HIJACK_SAVE_HTTP_FLOW,
    PORT_SCAN_HANDLE,
    HOOK_CLEAR,
];
