use crate::interceptors::{
    Interceptor, InterceptorDeps, InterceptorEntry, InterceptorError, parse_config,
};
use crate::request::IncomingRequest;
use crate::search::{GoogleSearch, GoogleSearchConfig, SearchClient, format_results};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub const NAME: &str = "google_search";
pub const TRIGGER: &str = "search google for";

/// Answers `search google for "<query>"` by appending web results to the
/// newest message that asks for it. A failed lookup leaves the request as is.
pub struct GoogleSearchInterceptor {
    search: Arc<dyn SearchClient>,
    max_results: usize,
}

impl GoogleSearchInterceptor {
    pub fn new(search: Arc<dyn SearchClient>, max_results: usize) -> Self {
        Self {
            search,
            max_results,
        }
    }
}

/// The text between the first and last double quote after the trigger.
pub fn extract_query(content: &str) -> Option<&str> {
    let index = content.find(TRIGGER)?;
    let after = &content[index + TRIGGER.len()..];
    let start = after.find('"')?;
    let end = after.rfind('"')?;
    if start < end {
        Some(&after[start + 1..end])
    } else {
        None
    }
}

#[async_trait]
impl Interceptor for GoogleSearchInterceptor {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn intercept(&self, request: &mut IncomingRequest) -> Result<(), InterceptorError> {
        for message in request.messages.iter_mut().rev() {
            let Some(query) = extract_query(&message.content).map(str::to_string) else {
                continue;
            };
            match self.search.search(&query).await {
                Ok(results) => {
                    let block = format_results(&results, self.max_results);
                    tracing::info!(query = %query, result = %block, "search result found");
                    message.content.push_str(&format!(
                        "\n\nThe google search results are: ```{block}``` use them to answer the user's question."
                    ));
                }
                Err(err) => {
                    tracing::warn!(query = %query, error = %err, "search failed, continuing without results");
                }
            }
            break;
        }
        Ok(())
    }
}

fn build(deps: &InterceptorDeps, raw: Value) -> Result<Arc<dyn Interceptor>, InterceptorError> {
    let cfg: GoogleSearchConfig = parse_config(NAME, raw)?;
    let max_results = cfg.max_results;
    let search = GoogleSearch::new(deps.http.clone(), cfg);
    Ok(Arc::new(GoogleSearchInterceptor::new(
        Arc::new(search),
        max_results,
    )))
}

inventory::submit!(InterceptorEntry {
    name: NAME,
    factory: build,
});
