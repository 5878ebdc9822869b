use crate::interceptors::{
    Interceptor, InterceptorDeps, InterceptorEntry, InterceptorError, parse_config,
};
use crate::request::IncomingRequest;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub const NAME: &str = "cap_max_tokens";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    max: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self { max: 4096 }
    }
}

/// Clamps the token budget. An unset budget (0) is raised to the cap so the
/// upstream never falls back to its own, possibly larger, default.
pub struct CapMaxTokens {
    max: u32,
}

impl CapMaxTokens {
    pub fn new(max: u32) -> Self {
        Self { max }
    }
}

#[async_trait]
impl Interceptor for CapMaxTokens {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn intercept(&self, request: &mut IncomingRequest) -> Result<(), InterceptorError> {
        if request.max_tokens == 0 || request.max_tokens > self.max {
            request.max_tokens = self.max;
        }
        Ok(())
    }
}

fn build(_deps: &InterceptorDeps, raw: Value) -> Result<Arc<dyn Interceptor>, InterceptorError> {
    let cfg: Config = parse_config(NAME, raw)?;
    if cfg.max == 0 {
        return Err(InterceptorError::InvalidConfig {
            name: NAME.to_string(),
            reason: "max must be positive".to_string(),
        });
    }
    Ok(Arc::new(CapMaxTokens::new(cfg.max)))
}

inventory::submit!(InterceptorEntry {
    name: NAME,
    factory: build,
});
