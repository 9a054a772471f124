//! Typed async client for the GitHub REST API.
//!
//! Thin wrapper around `reqwest` that translates HTTP failures into
//! `GitHubError` variants (auth, rate-limit with reset time, not-found,
//! generic) and caches successful GET responses in memory for five
//! minutes, keyed by path+query.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tracing::debug;

use crate::errors::GitHubError;

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "storyteller";
const CACHE_TTL: Duration = Duration::from_secs(300);

// ── Response cache ───────────────────────────────────────────────────

struct CachedResponse {
    stored_at: Instant,
    body: Value,
}

/// In-memory TTL cache for successful GET responses.
struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl ResponseCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(key).and_then(|cached| {
            if cached.stored_at.elapsed() < self.ttl {
                Some(cached.body.clone())
            } else {
                None
            }
        })
    }

    fn put(&self, key: &str, body: Value) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        // Expired entries are overwritten on re-fetch and pruned here so
        // the map tracks the working set rather than history.
        let ttl = self.ttl;
        entries.retain(|_, cached| cached.stored_at.elapsed() < ttl);
        entries.insert(
            key.to_string(),
            CachedResponse {
                stored_at: Instant::now(),
                body,
            },
        );
    }
}

// ── Client ───────────────────────────────────────────────────────────

pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
    cache: ResponseCache,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, GITHUB_API_BASE)
    }

    /// Point the client at a different API root (used by tests).
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            base_url: base_url.into(),
            cache: ResponseCache::new(CACHE_TTL),
        }
    }

    /// GET a path (with query) and parse the JSON body, translating error
    /// statuses into typed errors. Successful responses are cached.
    async fn get_json(&self, path: &str) -> Result<Value, GitHubError> {
        if let Some(cached) = self.cache.get(path) {
            debug!("github cache hit for {}", path);
            return Ok(cached);
        }

        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            let remaining = header_value(&response, "x-ratelimit-remaining");
            if remaining.as_deref() == Some("0") {
                let reset_time = header_value(&response, "x-ratelimit-reset")
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                return Err(GitHubError::RateLimit {
                    reset_time,
                    status: status.as_u16(),
                });
            }
            let message = response.text().await.unwrap_or_default();
            return Err(GitHubError::Auth {
                message,
                status: status.as_u16(),
            });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            let message = response.text().await.unwrap_or_default();
            return Err(GitHubError::NotFound { message });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api {
                message,
                status: Some(status.as_u16()),
            });
        }

        let body: Value = response.json().await?;
        self.cache.put(path, body.clone());
        Ok(body)
    }

    /// Basic repository metadata: name, description, primary language,
    /// counts, topics.
    pub async fn repository_details(&self, owner: &str, repo: &str) -> Result<Value, GitHubError> {
        self.get_json(&format!("/repos/{}/{}", owner, repo)).await
    }

    /// Bytes-per-language statistics.
    pub async fn repository_languages(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<BTreeMap<String, i64>, GitHubError> {
        let body = self
            .get_json(&format!("/repos/{}/{}/languages", owner, repo))
            .await?;
        Ok(languages_from_value(&body))
    }

    pub async fn repository_issues(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<Value>, GitHubError> {
        let body = self
            .get_json(&format!("/repos/{}/{}/issues?state={}", owner, repo, state))
            .await?;
        Ok(as_array(body))
    }

    pub async fn repository_pulls(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<Value>, GitHubError> {
        let body = self
            .get_json(&format!("/repos/{}/{}/pulls?state={}", owner, repo, state))
            .await?;
        Ok(as_array(body))
    }

    pub async fn repository_contributors(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Value>, GitHubError> {
        let body = self
            .get_json(&format!("/repos/{}/{}/contributors", owner, repo))
            .await?;
        Ok(as_array(body))
    }

    /// One page of the commit list.
    pub async fn repository_commits(
        &self,
        owner: &str,
        repo: &str,
        per_page: u32,
        page: u32,
    ) -> Result<Vec<Value>, GitHubError> {
        let body = self
            .get_json(&format!(
                "/repos/{}/{}/commits?per_page={}&page={}",
                owner, repo, per_page, page
            ))
            .await?;
        Ok(as_array(body))
    }

    /// A single git commit object (carries the tree sha).
    pub async fn git_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Value, GitHubError> {
        self.get_json(&format!("/repos/{}/{}/git/commits/{}", owner, repo, sha))
            .await
    }

    /// The full tree for a sha, recursively.
    pub async fn git_tree(&self, owner: &str, repo: &str, sha: &str) -> Result<Value, GitHubError> {
        self.get_json(&format!(
            "/repos/{}/{}/git/trees/{}?recursive=1",
            owner, repo, sha
        ))
        .await
    }

    /// Content of a single file, decoded. `Ok(None)` when the file does
    /// not exist or the payload is not a decodable file blob.
    pub async fn file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>, GitHubError> {
        let body = match self
            .get_json(&format!("/repos/{}/{}/contents/{}", owner, repo, path))
            .await
        {
            Ok(body) => body,
            Err(GitHubError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(decode_content(&body))
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn as_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

fn languages_from_value(value: &Value) -> BTreeMap<String, i64> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_i64().map(|bytes| (k.clone(), bytes)))
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a contents-API payload. GitHub base64-encodes file bodies with
/// embedded newlines; anything else is passed through as-is.
fn decode_content(body: &Value) -> Option<String> {
    let content = body.get("content")?.as_str()?;
    match body.get("encoding").and_then(Value::as_str) {
        Some("base64") => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = BASE64.decode(compact).ok()?;
            String::from_utf8(bytes).ok()
        }
        _ => Some(content.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_returns_fresh_entry() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.put("/repos/a/b", serde_json::json!({"name": "b"}));
        let hit = cache.get("/repos/a/b").unwrap();
        assert_eq!(hit["name"], "b");
    }

    #[test]
    fn test_cache_misses_unknown_key() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        assert!(cache.get("/repos/a/b").is_none());
    }

    #[test]
    fn test_cache_expires_entries() {
        let cache = ResponseCache::new(Duration::ZERO);
        cache.put("/repos/a/b", serde_json::json!(1));
        assert!(cache.get("/repos/a/b").is_none());
    }

    #[test]
    fn test_cache_is_keyed_by_path_and_query() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.put("/repos/a/b/commits?per_page=100&page=1", serde_json::json!(1));
        assert!(cache.get("/repos/a/b/commits?per_page=100&page=2").is_none());
    }

    #[test]
    fn test_decode_base64_content_with_newlines() {
        // "hello world" split across lines the way GitHub serves blobs
        let body = serde_json::json!({
            "content": "aGVsbG8g\nd29ybGQ=\n",
            "encoding": "base64"
        });
        assert_eq!(decode_content(&body).unwrap(), "hello world");
    }

    #[test]
    fn test_decode_plain_content() {
        let body = serde_json::json!({"content": "raw text", "encoding": "utf-8"});
        assert_eq!(decode_content(&body).unwrap(), "raw text");
    }

    #[test]
    fn test_decode_content_missing_fields() {
        assert!(decode_content(&serde_json::json!({})).is_none());
        assert!(decode_content(&serde_json::json!({"encoding": "base64"})).is_none());
    }

    #[test]
    fn test_decode_content_invalid_base64() {
        let body = serde_json::json!({"content": "!!!not base64!!!", "encoding": "base64"});
        assert!(decode_content(&body).is_none());
    }

    #[test]
    fn test_languages_from_value() {
        let value = serde_json::json!({"Rust": 1200, "Python": 300});
        let languages = languages_from_value(&value);
        assert_eq!(languages.get("Rust"), Some(&1200));
        assert_eq!(languages.get("Python"), Some(&300));
    }

    #[test]
    fn test_languages_from_non_object() {
        assert!(languages_from_value(&serde_json::json!([1, 2])).is_empty());
    }

    #[test]
    fn test_as_array_passthrough_and_fallback() {
        assert_eq!(as_array(serde_json::json!([1, 2])).len(), 2);
        assert!(as_array(serde_json::json!({"not": "array"})).is_empty());
    }
}
