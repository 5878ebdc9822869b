use crate::config::{ProviderConfig, ProviderKind};
use crate::request::RequestKind;
use axum::http::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no upstream available")]
    NoUpstreamAvailable,
}

/// Static priority routing: the lowest priority number wins. Priorities
/// are unique by construction, so the result does not depend on the
/// iteration order of `providers`.
pub fn select<'a, I>(providers: I) -> Result<&'a ProviderConfig, SelectError>
where
    I: IntoIterator<Item = &'a ProviderConfig>,
{
    providers
        .into_iter()
        .min_by_key(|provider| provider.priority)
        .ok_or(SelectError::NoUpstreamAvailable)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderAuth {
    Bearer(String),
    Header { name: &'static str, value: String },
}

/// Fully resolved target for one streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub url: String,
    pub auth: ProviderAuth,
}

impl ProviderEndpoint {
    pub fn openai(base_url: &str, api_key: &str, kind: RequestKind) -> Self {
        Self {
            url: join_url(base_url, operation_path(kind)),
            auth: ProviderAuth::Bearer(api_key.to_string()),
        }
    }

    pub fn azure(
        endpoint: &str,
        model: &str,
        api_version: &str,
        api_key: &str,
        kind: RequestKind,
    ) -> Self {
        let path = format!(
            "/openai/deployments/{}{}",
            azure_deployment(model),
            operation_path(kind)
        );
        Self {
            url: format!("{}?api-version={}", join_url(endpoint, &path), api_version),
            auth: ProviderAuth::Header {
                name: "api-key",
                value: api_key.to_string(),
            },
        }
    }

    pub fn for_provider(
        provider: &ProviderConfig,
        openai_base_url: &str,
        kind: RequestKind,
    ) -> Result<Self, UpstreamCallError> {
        match provider.kind {
            ProviderKind::OpenAi => Ok(Self::openai(openai_base_url, &provider.api_key, kind)),
            ProviderKind::Azure => {
                let endpoint = provider.endpoint.as_deref().ok_or_else(|| {
                    UpstreamCallError::new(
                        UpstreamErrorKind::Http,
                        None,
                        "missing azure endpoint".to_string(),
                    )
                })?;
                Ok(Self::azure(
                    endpoint,
                    &provider.model,
                    &provider.api_version,
                    &provider.api_key,
                    kind,
                ))
            }
        }
    }
}

/// Posts `body` and returns the still-open response once the upstream has
/// answered with a success status.
pub async fn open_stream(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let req = apply_auth(client.post(&endpoint.url), &endpoint.auth)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(body);
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

fn apply_auth(req: reqwest::RequestBuilder, auth: &ProviderAuth) -> reqwest::RequestBuilder {
    match auth {
        ProviderAuth::Bearer(token) => req.bearer_auth(token),
        ProviderAuth::Header { name, value } => req.header(*name, value),
    }
}

fn operation_path(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Chat => "/chat/completions",
        RequestKind::Completion => "/completions",
    }
}

// Azure deployment names cannot contain '.' or ':'.
fn azure_deployment(model: &str) -> String {
    model.chars().filter(|c| *c != '.' && *c != ':').collect()
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, priority: u32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: ProviderKind::OpenAi,
            endpoint: None,
            model: "gpt-3.5-turbo".to_string(),
            api_key: "k".to_string(),
            priority,
            api_version: "2023-05-15".to_string(),
        }
    }

    #[test]
    fn select_picks_lowest_priority_in_any_order() {
        let a = provider("a", 7);
        let b = provider("b", 2);
        let c = provider("c", 11);
        let orders = [
            vec![&a, &b, &c],
            vec![&c, &b, &a],
            vec![&b, &a, &c],
            vec![&c, &a, &b],
        ];
        for order in orders {
            let selected = select(order).expect("non-empty");
            assert_eq!(selected.name, "b");
        }
    }

    #[test]
    fn select_on_empty_set_fails() {
        let none: Vec<ProviderConfig> = Vec::new();
        assert_eq!(select(&none).unwrap_err(), SelectError::NoUpstreamAvailable);
    }

    #[test]
    fn openai_endpoint_uses_bearer_auth() {
        let ep = ProviderEndpoint::openai("https://api.openai.com/v1/", "sk-1", RequestKind::Chat);
        assert_eq!(ep.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(ep.auth, ProviderAuth::Bearer("sk-1".to_string()));

        let ep = ProviderEndpoint::openai(
            "https://api.openai.com/v1",
            "sk-1",
            RequestKind::Completion,
        );
        assert_eq!(ep.url, "https://api.openai.com/v1/completions");
    }

    #[test]
    fn azure_endpoint_routes_by_deployment() {
        let mut p = provider("az", 1);
        p.kind = ProviderKind::Azure;
        p.endpoint = Some("https://example.openai.azure.com/".to_string());
        let ep = ProviderEndpoint::for_provider(&p, "unused", RequestKind::Chat).expect("azure");
        assert_eq!(
            ep.url,
            "https://example.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2023-05-15"
        );
        assert_eq!(
            ep.auth,
            ProviderAuth::Header {
                name: "api-key",
                value: "k".to_string()
            }
        );
    }

    #[test]
    fn extract_error_code_reads_openai_envelope() {
        assert_eq!(
            extract_error_code(r#"{"error":{"code":"invalid_api_key","message":"bad"}}"#),
            Some("invalid_api_key".to_string())
        );
        assert_eq!(extract_error_code("not json"), None);
    }
}
