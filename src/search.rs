use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Duration;

pub const DEFAULT_GOOGLE_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search is not configured")]
    NotConfigured,
    #[error("search request failed: {0}")]
    Request(String),
    #[error("search returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode search response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoogleSearchConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Whole-request limit for one lookup, connect through body.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GoogleSearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            engine_id: None,
            endpoint: default_endpoint(),
            max_results: default_max_results(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_GOOGLE_ENDPOINT.to_string()
}

fn default_max_results() -> usize {
    5
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// Google Programmable Search (Custom Search JSON API).
pub struct GoogleSearch {
    client: reqwest::Client,
    config: GoogleSearchConfig,
}

impl GoogleSearch {
    pub fn new(client: reqwest::Client, config: GoogleSearchConfig) -> Self {
        Self { client, config }
    }
}

#[derive(Debug, Deserialize)]
struct CustomSearchResponse {
    #[serde(default)]
    items: Vec<CustomSearchItem>,
}

#[derive(Debug, Deserialize)]
struct CustomSearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

#[async_trait]
impl SearchClient for GoogleSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let (Some(key), Some(cx)) = (
            self.config.api_key.as_deref(),
            self.config.engine_id.as_deref(),
        ) else {
            return Err(SearchError::NotConfigured);
        };
        let num = self.config.max_results.clamp(1, 10).to_string();
        let resp = self
            .client
            .get(&self.config.endpoint)
            .query(&[("key", key), ("cx", cx), ("q", query), ("num", num.as_str())])
            .timeout(Duration::from_millis(self.config.timeout_ms.max(1)))
            .send()
            .await
            .map_err(|err| SearchError::Request(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SearchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: CustomSearchResponse = resp
            .json()
            .await
            .map_err(|err| SearchError::Decode(err.to_string()))?;
        Ok(parsed
            .items
            .into_iter()
            .map(|item| SearchResult {
                title: item.title,
                url: item.link,
                description: item.snippet,
            })
            .collect())
    }
}

/// Numbered `title - url - description` lines, at most `limit` of them.
pub fn format_results(results: &[SearchResult], limit: usize) -> String {
    let mut out = String::new();
    for (i, result) in results.iter().take(limit).enumerate() {
        let _ = writeln!(
            out,
            "{}. {} - {} - {}",
            i + 1,
            result.title,
            result.url,
            result.description
        );
    }
    out
}
