use crate::interceptors::{
    Interceptor, InterceptorDeps, InterceptorEntry, InterceptorError, parse_config,
};
use crate::request::{IncomingRequest, RequestKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub const NAME: &str = "require_messages";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {}

/// Rejects chat requests that carry no conversation.
pub struct RequireMessages;

#[async_trait]
impl Interceptor for RequireMessages {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn intercept(&self, request: &mut IncomingRequest) -> Result<(), InterceptorError> {
        if request.kind == RequestKind::Chat && request.messages.is_empty() {
            return Err(InterceptorError::Rejected {
                step: NAME,
                reason: "messages is empty".to_string(),
            });
        }
        Ok(())
    }
}

fn build(_deps: &InterceptorDeps, raw: Value) -> Result<Arc<dyn Interceptor>, InterceptorError> {
    let _: Config = parse_config(NAME, raw)?;
    Ok(Arc::new(RequireMessages))
}

inventory::submit!(InterceptorEntry {
    name: NAME,
    factory: build,
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ConversationMessage, Role};

    #[tokio::test]
    async fn empty_chat_is_rejected() {
        let mut req = IncomingRequest::chat(Vec::new(), 0);
        let err = RequireMessages.intercept(&mut req).await.unwrap_err();
        assert!(matches!(err, InterceptorError::Rejected { step: NAME, .. }));
    }

    #[tokio::test]
    async fn completion_and_non_empty_chat_pass() {
        let mut completion = IncomingRequest::completion("hi", 0);
        RequireMessages
            .intercept(&mut completion)
            .await
            .expect("completion passes");
        let mut chat = IncomingRequest::chat(vec![ConversationMessage::new(Role::User, "hi")], 0);
        RequireMessages.intercept(&mut chat).await.expect("chat passes");
    }
}
