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

//! Request shapes and the content-addressed hashes used for deduplication.
//!
//! Three identities are derived from one observed exchange:
//! - site: scheme, host, port and method
//! - path: site plus the path with its query stripped
//! - path+params: path plus the sorted (position, name) parameter pairs

use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Empty request")]
    Empty,

    #[error("Malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error("Request head is not valid UTF-8")]
    NotUtf8,

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Where a parameter was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamPosition {
    Query,
    Body,
    Json,
}

impl ParamPosition {
    fn as_str(self) -> &'static str {
        match self {
            ParamPosition::Query => "query",
            ParamPosition::Body => "body",
            ParamPosition::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ParamShape {
    pub position: ParamPosition,
    pub name: String,
}

/// Method, path and parameter names of a request. Values are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestShape {
    pub method: String,
    pub path: String,
    /// Sorted and deduplicated.
    pub params: Vec<ParamShape>,
}

impl RequestShape {
    /// Shape derived from a URL alone, for requests that cannot be parsed.
    pub fn from_url(method: &str, url: &Url) -> Self {
        let mut params: Vec<ParamShape> = url
            .query_pairs()
            .map(|(name, _)| ParamShape {
                position: ParamPosition::Query,
                name: name.into_owned(),
            })
            .collect();
        params.sort();
        params.dedup();
        Self {
            method: method.to_ascii_uppercase(),
            path: normalize_path(url.path()),
            params,
        }
    }
}

/// Parse a raw HTTP/1.x request into its shape.
pub fn parse_request(raw: &[u8]) -> Result<RequestShape, ShapeError> {
    let (head, body) = split_head(raw);
    let head = std::str::from_utf8(head).map_err(|_| ShapeError::NotUtf8)?;
    let mut lines = head.lines();

    let request_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or(ShapeError::Empty)?;
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(m), Some(t)) => (m.to_ascii_uppercase(), t),
        _ => return Err(ShapeError::MalformedRequestLine(request_line.to_string())),
    };

    let mut content_type = String::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-type") {
                content_type = value.trim().to_ascii_lowercase();
            }
        }
    }

    let (path, query) = split_target(target)?;
    let mut params = Vec::new();
    if let Some(query) = query {
        params.extend(form_names(query.as_bytes(), ParamPosition::Query));
    }
    if !body.is_empty() {
        if content_type.contains("application/x-www-form-urlencoded") {
            params.extend(form_names(body, ParamPosition::Body));
        } else if content_type.contains("json") {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(body) {
                params.extend(map.keys().map(|k| ParamShape {
                    position: ParamPosition::Json,
                    name: k.clone(),
                }));
            }
        }
    }
    params.sort();
    params.dedup();

    Ok(RequestShape {
        method,
        path,
        params,
    })
}

fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return (&raw[..pos], &raw[pos + 4..]);
    }
    if let Some(pos) = find(raw, b"\n\n") {
        return (&raw[..pos], &raw[pos + 2..]);
    }
    (raw, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_target(target: &str) -> Result<(String, Option<String>), ShapeError> {
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let url = Url::parse(target).map_err(|e| ShapeError::InvalidUrl {
            url: target.to_string(),
            reason: e.to_string(),
        })?;
        return Ok((normalize_path(url.path()), url.query().map(str::to_string)));
    }
    match target.split_once('?') {
        Some((path, query)) => Ok((normalize_path(path), Some(query.to_string()))),
        None => Ok((normalize_path(target), None)),
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.split('#').next().unwrap_or_default();
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn form_names(input: &[u8], position: ParamPosition) -> impl Iterator<Item = ParamShape> + '_ {
    url::form_urlencoded::parse(input)
        .filter(|(name, _)| !name.is_empty())
        .map(move |(name, _)| ParamShape {
            position,
            name: name.into_owned(),
        })
}

/// Scheme, host and port of an observed URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl SiteTarget {
    pub fn from_url(url: &Url) -> Result<Self, ShapeError> {
        let host = url.host_str().ok_or_else(|| ShapeError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;
        Ok(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port: url.port_or_known_default().unwrap_or(80),
        })
    }

    /// `host:port` form passed to scanners.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host.trim_matches(|c| c == '[' || c == ']'), self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Site identity: scheme, host, port and method.
pub fn website_hash(site: &SiteTarget, method: &str) -> String {
    let port = site.port.to_string();
    digest(&[&site.scheme, &site.host, &port, method, "new-website"])
}

/// Path identity: site identity plus the query-less path.
pub fn path_hash(site: &SiteTarget, shape: &RequestShape) -> String {
    let port = site.port.to_string();
    digest(&[&site.scheme, &site.host, &port, &shape.method, &shape.path, "path"])
}

/// Path plus parameter-shape identity.
pub fn path_params_hash(site: &SiteTarget, shape: &RequestShape) -> String {
    let port = site.port.to_string();
    let params = shape
        .params
        .iter()
        .map(|p| format!("{}:{}", p.position.as_str(), p.name))
        .collect::<Vec<_>>()
        .join("&");
    digest(&[
        &site.scheme,
        &site.host,
        &port,
        &shape.method,
        &shape.path,
        &params,
        "path-params",
    ])
}

/// TTL cache of parsed request shapes keyed by request content.
pub struct RequestShapeCache {
    cache: Cache<String, Arc<RequestShape>>,
}

impl RequestShapeCache {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub fn get_or_parse(&self, raw: &[u8]) -> Result<Arc<RequestShape>, ShapeError> {
        let key = hex::encode(Sha256::digest(raw));
        if let Some(shape) = self.cache.get(&key) {
            return Ok(shape);
        }
        let shape = Arc::new(parse_request(raw)?);
        self.cache.insert(key, shape.clone());
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(url: &str) -> SiteTarget {
        SiteTarget::from_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_get_with_query() {
        let raw = b"GET /search?q=1&page=2&q=3 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let shape = parse_request(raw).unwrap();
        assert_eq!(shape.method, "GET");
        assert_eq!(shape.path, "/search");
        let names: Vec<_> = shape.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["page", "q"]);
    }

    #[test]
    fn test_parse_form_and_json_bodies() {
        let raw = b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nuser=a&pass=b";
        let shape = parse_request(raw).unwrap();
        assert!(shape.params.iter().all(|p| p.position == ParamPosition::Body));
        assert_eq!(shape.params.len(), 2);

        let raw = b"POST /api HTTP/1.1\nContent-Type: application/json\n\n{\"id\": 1, \"name\": \"x\"}";
        let shape = parse_request(raw).unwrap();
        assert_eq!(
            shape.params,
            vec![
                ParamShape { position: ParamPosition::Json, name: "id".into() },
                ParamShape { position: ParamPosition::Json, name: "name".into() },
            ]
        );
    }

    #[test]
    fn test_parse_absolute_form_target() {
        let raw = b"GET http://example.com:8080/a/b?x=1 HTTP/1.1\r\n\r\n";
        let shape = parse_request(raw).unwrap();
        assert_eq!(shape.path, "/a/b");
        assert_eq!(shape.params.len(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_request(b""), Err(ShapeError::Empty));
        assert!(matches!(
            parse_request(b"GARBAGE\r\n\r\n"),
            Err(ShapeError::MalformedRequestLine(_))
        ));
    }

    #[test]
    fn test_site_target_defaults_port() {
        assert_eq!(site("https://Example.com/x").port, 443);
        assert_eq!(site("http://example.com/x").host_port(), "example.com:80");
        assert_eq!(site("http://example.com:8080/").port, 8080);
    }

    #[test]
    fn test_hash_identities() {
        let s = site("http://example.com/");
        let a = parse_request(b"GET /a?x=1 HTTP/1.1\r\n\r\n").unwrap();
        let a2 = parse_request(b"GET /a?x=2 HTTP/1.1\r\n\r\n").unwrap();
        let a3 = parse_request(b"GET /a?y=2 HTTP/1.1\r\n\r\n").unwrap();
        let b = parse_request(b"GET /b HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!(website_hash(&s, "GET"), website_hash(&site("http://example.com/other"), "GET"));
        assert_ne!(website_hash(&s, "GET"), website_hash(&s, "POST"));
        assert_ne!(website_hash(&s, "GET"), website_hash(&site("https://example.com/"), "GET"));

        assert_eq!(path_hash(&s, &a), path_hash(&s, &a3));
        assert_ne!(path_hash(&s, &a), path_hash(&s, &b));

        assert_eq!(path_params_hash(&s, &a), path_params_hash(&s, &a2));
        assert_ne!(path_params_hash(&s, &a), path_params_hash(&s, &a3));
    }

    #[test]
    fn test_shape_from_url() {
        let url = Url::parse("http://example.com/p?b=1&a=2").unwrap();
        let shape = RequestShape::from_url("get", &url);
        assert_eq!(shape.method, "GET");
        assert_eq!(shape.params[0].name, "a");
    }

    #[test]
    fn test_cache_returns_same_shape() {
        let cache = RequestShapeCache::new(Duration::from_secs(60), 100);
        let raw = b"GET /x HTTP/1.1\r\n\r\n";
        let first = cache.get_or_parse(raw).unwrap();
        let second = cache.get_or_parse(raw).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.get_or_parse(b"").is_err());
    }
}
