//! Ordered request interceptors run before an upstream is contacted.
//!
//! Steps are registered by name through `inventory` and instantiated once at
//! startup from the configured rule list. Each step may rewrite the request
//! in place or reject it; the first rejection stops the chain.

use crate::request::IncomingRequest;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod cap_max_tokens;
pub mod google_search;
pub mod require_messages;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterceptorRuleConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

impl InterceptorRuleConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            config: Value::Null,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Chain used when the config file does not list interceptors.
pub fn default_rules() -> Vec<InterceptorRuleConfig> {
    vec![
        InterceptorRuleConfig::named(require_messages::NAME),
        InterceptorRuleConfig::named(google_search::NAME),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum InterceptorError {
    #[error("invalid config for interceptor {name}: {reason}")]
    InvalidConfig { name: String, reason: String },
    #[error("interceptor not found: {0}")]
    NotFound(String),
    #[error("request rejected by {step}: {reason}")]
    Rejected { step: &'static str, reason: String },
}

#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// `Err(Rejected)` aborts the request. Soft failures are the step's own
    /// business: log and return `Ok`.
    async fn intercept(&self, request: &mut IncomingRequest) -> Result<(), InterceptorError>;
}

/// Shared resources handed to interceptor factories.
#[derive(Clone)]
pub struct InterceptorDeps {
    pub http: reqwest::Client,
}

pub type InterceptorFactory =
    fn(&InterceptorDeps, Value) -> Result<Arc<dyn Interceptor>, InterceptorError>;

pub struct InterceptorEntry {
    pub name: &'static str,
    pub factory: InterceptorFactory,
}

inventory::collect!(InterceptorEntry);

pub type InterceptorRegistry = HashMap<&'static str, InterceptorFactory>;

pub fn registry() -> InterceptorRegistry {
    let mut map = HashMap::new();
    for entry in inventory::iter::<InterceptorEntry> {
        map.insert(entry.name, entry.factory);
    }
    map
}

/// Parses a step's `config` table, treating an absent table as defaults.
pub fn parse_config<T>(name: &str, raw: Value) -> Result<T, InterceptorError>
where
    T: DeserializeOwned + Default,
{
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw).map_err(|err| InterceptorError::InvalidConfig {
        name: name.to_string(),
        reason: err.to_string(),
    })
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    steps: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(steps: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { steps }
    }

    pub fn build(
        rules: &[InterceptorRuleConfig],
        deps: &InterceptorDeps,
    ) -> Result<Self, InterceptorError> {
        let registry = registry();
        let mut steps = Vec::with_capacity(rules.len());
        for rule in rules {
            let factory = registry
                .get(rule.name.as_str())
                .ok_or_else(|| InterceptorError::NotFound(rule.name.clone()))?;
            if !rule.enabled {
                continue;
            }
            steps.push(factory(deps, rule.config.clone())?);
        }
        Ok(Self { steps })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub async fn run(&self, request: &mut IncomingRequest) -> Result<(), InterceptorError> {
        for step in &self.steps {
            step.intercept(request).await?;
        }
        Ok(())
    }
}
