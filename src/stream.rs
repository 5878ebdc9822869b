//! Provider stream adapter.
//!
//! Opening a stream spawns a producer task that talks to the upstream and
//! hands each text fragment to the consumer over a single-slot channel, so
//! at most one fragment per request is buffered. The terminal outcome is
//! latched on a oneshot before the fragment channel closes.

use crate::config::ProviderConfig;
use crate::request::{ConversationMessage, IncomingRequest, RequestKind};
use crate::upstream::{self, ProviderEndpoint, UpstreamCallError, UpstreamErrorKind};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("upstream request failed: {0}")]
    Network(String),
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("upstream sent an undecodable event: {0}")]
    Decode(String),
    #[error("upstream reported an error: {0}")]
    Provider(String),
    #[error("stream cancelled")]
    Cancelled,
    #[error("producer exited without reporting an outcome")]
    Abandoned,
}

impl From<UpstreamCallError> for StreamError {
    fn from(err: UpstreamCallError) -> Self {
        match (err.kind, err.status) {
            (UpstreamErrorKind::Http, Some(status)) => StreamError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            (UpstreamErrorKind::Http, None) => StreamError::Provider(err.to_string()),
            (UpstreamErrorKind::Network, _) => StreamError::Network(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(StreamError),
}

/// What every provider variant needs to start a completion stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub kind: RequestKind,
    pub messages: Vec<ConversationMessage>,
    pub prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl From<&IncomingRequest> for StreamRequest {
    fn from(req: &IncomingRequest) -> Self {
        Self {
            kind: req.kind,
            messages: req.messages.clone(),
            prompt: req.prompt.clone(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        }
    }
}

impl StreamRequest {
    /// Upstream JSON body. A zero token budget is left to the provider default.
    pub fn body(&self, model: &str) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        match self.kind {
            RequestKind::Chat => {
                body.insert(
                    "messages".to_string(),
                    serde_json::to_value(&self.messages).unwrap_or(Value::Array(Vec::new())),
                );
            }
            RequestKind::Completion => {
                body.insert(
                    "prompt".to_string(),
                    Value::String(self.prompt.clone().unwrap_or_default()),
                );
            }
        }
        body.insert("stream".to_string(), Value::Bool(true));
        if self.max_tokens > 0 {
            body.insert("max_tokens".to_string(), Value::from(self.max_tokens));
        }
        if let Some(temperature) = self.temperature {
            body.insert("temperature".to_string(), Value::from(temperature));
        }
        Value::Object(body)
    }
}

/// Producer half of a delta stream.
pub struct DeltaSender {
    deltas: mpsc::Sender<String>,
    outcome: oneshot::Sender<StreamOutcome>,
    cancel: CancellationToken,
}

impl DeltaSender {
    /// Waits for the consumer to take the previous delta. Fails once the
    /// consumer is gone.
    pub async fn send(&self, delta: String) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
            sent = self.deltas.send(delta) => sent.map_err(|_| StreamError::Cancelled),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn finish(self, outcome: StreamOutcome) {
        let DeltaSender {
            deltas, outcome: tx, ..
        } = self;
        let _ = tx.send(outcome);
        drop(deltas);
    }
}

/// Consumer half. Dropping it cancels the producer.
pub struct DeltaStream {
    deltas: mpsc::Receiver<String>,
    outcome: oneshot::Receiver<StreamOutcome>,
    cancel_on_drop: DropGuard,
}

impl DeltaStream {
    pub fn channel() -> (DeltaSender, DeltaStream) {
        let (deltas_tx, deltas_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let sender = DeltaSender {
            deltas: deltas_tx,
            outcome: outcome_tx,
            cancel: cancel.clone(),
        };
        let stream = DeltaStream {
            deltas: deltas_rx,
            outcome: outcome_rx,
            cancel_on_drop: cancel.drop_guard(),
        };
        (sender, stream)
    }

    /// Next fragment in provider order, or `None` once the producer is done.
    pub async fn next_delta(&mut self) -> Option<String> {
        self.deltas.recv().await
    }

    /// Terminal state. Call after `next_delta` has returned `None`.
    pub async fn outcome(self) -> StreamOutcome {
        let DeltaStream {
            deltas,
            outcome,
            cancel_on_drop,
        } = self;
        let result = outcome
            .await
            .unwrap_or(StreamOutcome::Failed(StreamError::Abandoned));
        drop(deltas);
        drop(cancel_on_drop);
        result
    }
}

/// The one capability the gateway needs from a provider.
pub trait CompletionStreamer: Send + Sync + 'static {
    fn open(&self, provider: &ProviderConfig, request: StreamRequest) -> DeltaStream;
}

/// OpenAI-compatible streaming over HTTP. Both provider kinds share this;
/// they differ only in how `ProviderEndpoint` is built.
#[derive(Clone)]
pub struct HttpStreamer {
    client: reqwest::Client,
    openai_base_url: String,
}

impl HttpStreamer {
    pub fn new(client: reqwest::Client, openai_base_url: impl Into<String>) -> Self {
        Self {
            client,
            openai_base_url: openai_base_url.into(),
        }
    }
}

impl CompletionStreamer for HttpStreamer {
    fn open(&self, provider: &ProviderConfig, request: StreamRequest) -> DeltaStream {
        let (sender, stream) = DeltaStream::channel();
        let client = self.client.clone();
        let endpoint =
            ProviderEndpoint::for_provider(provider, &self.openai_base_url, request.kind);
        let body = request.body(&provider.model);
        let upstream_name = provider.name.clone();
        let kind = request.kind;

        tokio::spawn(async move {
            let cancel = sender.cancellation();
            let result = match endpoint {
                Err(err) => Err(StreamError::from(err)),
                Ok(endpoint) => tokio::select! {
                    _ = cancel.cancelled() => Err(StreamError::Cancelled),
                    pumped = pump(&client, &endpoint, &body, kind, &sender) => pumped,
                },
            };
            match result {
                Ok(()) => {
                    tracing::debug!(upstream = %upstream_name, "upstream stream completed");
                    sender.finish(StreamOutcome::Completed);
                }
                Err(err) => {
                    tracing::debug!(upstream = %upstream_name, error = %err, "upstream stream ended with error");
                    sender.finish(StreamOutcome::Failed(err));
                }
            }
        });

        stream
    }
}

async fn pump(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    body: &Value,
    kind: RequestKind,
    sender: &DeltaSender,
) -> Result<(), StreamError> {
    let resp = upstream::open_stream(client, endpoint, body).await?;
    let mut events = resp.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.map_err(|err| match err {
            EventStreamError::Transport(err) => StreamError::Network(err.to_string()),
            other => StreamError::Decode(other.to_string()),
        })?;
        let data = event.data.trim();
        if data == "[DONE]" {
            return Ok(());
        }
        if data.is_empty() {
            continue;
        }
        if let Some(delta) = extract_delta(kind, data)? {
            sender.send(delta).await?;
        }
    }
    Ok(())
}

/// Pulls the first choice's incremental text out of one upstream chunk.
/// Chunks without choices carry no text and are skipped.
pub fn extract_delta(kind: RequestKind, data: &str) -> Result<Option<String>, StreamError> {
    let value: Value =
        serde_json::from_str(data).map_err(|err| StreamError::Decode(err.to_string()))?;
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(StreamError::Provider(message));
    }
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return Ok(None);
    };
    let content = match kind {
        RequestKind::Chat => choice.get("delta").and_then(|d| d.get("content")),
        RequestKind::Completion => choice.get("text"),
    };
    Ok(Some(
        content
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Role;
    use std::time::Duration;

    #[test]
    fn chat_body_carries_messages_and_stream_flag() {
        let req = StreamRequest::from(&IncomingRequest::chat(
            vec![ConversationMessage::new(Role::User, "hi")],
            0,
        ));
        let body = req.body("gpt-3.5-turbo");
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("prompt").is_none());
    }

    #[test]
    fn completion_body_carries_prompt_and_budget() {
        let req = StreamRequest::from(&IncomingRequest::completion("once", 32));
        let body = req.body("davinci");
        assert_eq!(body["prompt"], "once");
        assert_eq!(body["max_tokens"], 32);
        assert!(body.get("messages").is_none());
    }

    #[test]
    fn extract_delta_reads_first_choice() {
        let chat = r#"{"choices":[{"index":0,"delta":{"content":"Hel"}},{"index":1,"delta":{"content":"x"}}]}"#;
        assert_eq!(
            extract_delta(RequestKind::Chat, chat).unwrap(),
            Some("Hel".to_string())
        );
        let text = r#"{"choices":[{"index":0,"text":"lo","finish_reason":null}]}"#;
        assert_eq!(
            extract_delta(RequestKind::Completion, text).unwrap(),
            Some("lo".to_string())
        );
        let role_only = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(
            extract_delta(RequestKind::Chat, role_only).unwrap(),
            Some(String::new())
        );
        assert_eq!(
            extract_delta(RequestKind::Chat, r#"{"choices":[]}"#).unwrap(),
            None
        );
    }

    #[test]
    fn extract_delta_surfaces_errors() {
        assert!(matches!(
            extract_delta(RequestKind::Chat, "{oops"),
            Err(StreamError::Decode(_))
        ));
        assert_eq!(
            extract_delta(RequestKind::Chat, r#"{"error":{"message":"overloaded"}}"#),
            Err(StreamError::Provider("overloaded".to_string()))
        );
    }

    #[tokio::test]
    async fn outcome_is_latched_before_channel_closes() {
        let (sender, mut stream) = DeltaStream::channel();
        tokio::spawn(async move {
            sender.send("a".to_string()).await.expect("send a");
            sender.send("b".to_string()).await.expect("send b");
            sender.finish(StreamOutcome::Failed(StreamError::Network("reset".into())));
        });
        assert_eq!(stream.next_delta().await.as_deref(), Some("a"));
        assert_eq!(stream.next_delta().await.as_deref(), Some("b"));
        assert_eq!(stream.next_delta().await, None);
        assert_eq!(
            stream.outcome().await,
            StreamOutcome::Failed(StreamError::Network("reset".into()))
        );
    }

    #[tokio::test]
    async fn producer_blocks_until_previous_delta_is_taken() {
        let (sender, mut stream) = DeltaStream::channel();
        sender.send("first".to_string()).await.expect("slot free");
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sender.send("second".to_string()))
                .await;
        assert!(blocked.is_err());
        assert_eq!(stream.next_delta().await.as_deref(), Some("first"));
        sender.send("third".to_string()).await.expect("slot free again");
    }

    #[tokio::test]
    async fn dropping_consumer_cancels_producer() {
        let (sender, stream) = DeltaStream::channel();
        let token = sender.cancellation();
        drop(stream);
        assert!(token.is_cancelled());
        assert_eq!(
            sender.send("late".to_string()).await,
            Err(StreamError::Cancelled)
        );
    }

    #[tokio::test]
    async fn vanished_producer_reports_abandoned() {
        let (sender, mut stream) = DeltaStream::channel();
        drop(sender);
        assert_eq!(stream.next_delta().await, None);
        assert_eq!(
            stream.outcome().await,
            StreamOutcome::Failed(StreamError::Abandoned)
        );
    }
}
