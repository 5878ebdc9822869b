use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::request::{self, ConversationMessage, DecodeError, RequestKind};
use crate::sse::{ChunkHeader, FrameWriter, WriteError};
use crate::stream::{DeltaStream, StreamError, StreamOutcome, StreamRequest};
use crate::upstream;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tokio::time::{Instant, timeout_at};

pub async fn preflight() -> Response {
    (StatusCode::OK, [(CONTENT_TYPE, "application/json")], "OK").into_response()
}

pub async fn render_metrics(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// Single entry point for every path other than the metrics endpoint.
/// The endpoint is chosen by path suffix so any prefix (`/v1`, `/api`) works.
pub async fn gateway(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method == Method::OPTIONS {
        return preflight().await;
    }
    let Some(kind) = RequestKind::from_path(uri.path()) else {
        tracing::debug!(path = %uri.path(), "unknown endpoint");
        return (StatusCode::NOT_FOUND, "Unknown endpoint").into_response();
    };
    if method != Method::POST {
        return AppError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
    }

    metrics::counter!("relaygate_requests_total", "kind" => kind.as_str()).increment(1);
    match serve(state, kind, &headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve(
    state: AppState,
    kind: RequestKind,
    headers: &HeaderMap,
    body: Body,
) -> AppResult<Response> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let payload = request::decode(body, content_type, state.config.max_body_bytes)
        .await
        .map_err(|err| {
            match &err {
                DecodeError::BodyRead(reason) => {
                    tracing::error!(error = %reason, "error reading request body");
                }
                DecodeError::UnsupportedMediaType(found) => {
                    tracing::warn!(content_type = ?found, "rejected non-JSON request");
                }
                DecodeError::MalformedPayload { error, body } => {
                    tracing::error!(error = %error, body = %body, "error parsing JSON payload");
                }
            }
            record_failure("decode");
            AppError::from(err)
        })?;
    let mut incoming = payload.into_request(kind);
    let deadline = Instant::now() + state.config.connection_timeout;

    timeout_at(deadline, state.interceptors.run(&mut incoming))
        .await
        .map_err(|_| {
            tracing::error!("request deadline exceeded while running interceptors");
            record_failure("deadline");
            AppError::new(StatusCode::GATEWAY_TIMEOUT, "request deadline exceeded")
        })?
        .map_err(|err| {
            tracing::error!(error = %err, "error running interceptor");
            record_failure("interceptor");
            AppError::internal(err.to_string())
        })?;

    let provider = upstream::select(state.config.upstreams.values())
        .map_err(|err| {
            tracing::error!(error = %err, "upstream selection failed");
            record_failure("select");
            AppError::internal(err.to_string())
        })?
        .clone();

    let deltas = state.streamer.open(&provider, StreamRequest::from(&incoming));
    let opening = await_opening(deltas, deadline)
        .await
        .map_err(|err| opening_error(&provider.name, err))?;
    let (writer, body) = FrameWriter::channel(kind, ChunkHeader::new(kind, provider.model.clone()));

    tracing::debug!(
        upstream = %provider.name,
        kind = kind.as_str(),
        response_id = %writer.header().id,
        "streaming response"
    );

    tokio::spawn(async move {
        let upstream_name = provider.name;
        match relay(opening, &writer, deadline, &upstream_name).await {
            Ok(completed) => log_completion(
                &upstream_name,
                &completed,
                &incoming.messages,
                incoming.prompt.as_deref(),
            ),
            Err(err) => {
                record_failure(err.stage());
                tracing::error!(upstream = %upstream_name, error = %err, "stream aborted");
            }
        }
    });

    Ok((
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response())
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Upstream(#[from] StreamError),
    #[error("error writing to client: {0}")]
    Write(#[from] WriteError),
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl RelayError {
    fn stage(&self) -> &'static str {
        match self {
            RelayError::Upstream(_) => "upstream",
            RelayError::Write(_) => "client",
            RelayError::DeadlineExceeded => "deadline",
        }
    }
}

/// How an upstream stream began. Nothing has been sent to the client yet.
pub enum Opening {
    /// First fragment plus the rest of the stream.
    Delta(String, DeltaStream),
    /// The upstream finished cleanly without producing any text.
    Empty,
}

/// Waits for the first fragment so that an upstream failing up front
/// (bad key, 5xx, refused connection) can still get an error status.
pub async fn await_opening(mut deltas: DeltaStream, deadline: Instant) -> Result<Opening, RelayError> {
    let first = timeout_at(deadline, deltas.next_delta())
        .await
        .map_err(|_| RelayError::DeadlineExceeded)?;
    if let Some(delta) = first {
        return Ok(Opening::Delta(delta, deltas));
    }
    match timeout_at(deadline, deltas.outcome())
        .await
        .map_err(|_| RelayError::DeadlineExceeded)?
    {
        StreamOutcome::Completed => Ok(Opening::Empty),
        StreamOutcome::Failed(err) => Err(err.into()),
    }
}

fn opening_error(upstream: &str, err: RelayError) -> AppError {
    record_failure(err.stage());
    tracing::error!(upstream = %upstream, error = %err, "upstream failed before streaming");
    let status = match err {
        RelayError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    AppError::new(status, err.to_string())
}

/// Forwards deltas to the client one at a time until the provider finishes,
/// then writes the closing frames. A failed stream gets no closing frames so
/// the client sees it as truncated. Returns the accumulated text.
pub async fn relay(
    opening: Opening,
    writer: &FrameWriter,
    deadline: Instant,
    upstream: &str,
) -> Result<String, RelayError> {
    let Opening::Delta(first, mut deltas) = opening else {
        timeout_at(deadline, writer.write_closing())
            .await
            .map_err(|_| RelayError::DeadlineExceeded)??;
        return Ok(String::new());
    };

    let mut completed = String::new();
    let mut next = Some(first);
    while let Some(delta) = next {
        tracing::debug!(upstream = %upstream, content = %delta, "response segment");
        timeout_at(deadline, writer.write_delta(&delta))
            .await
            .map_err(|_| RelayError::DeadlineExceeded)??;
        metrics::counter!("relaygate_deltas_total", "upstream" => upstream.to_string()).increment(1);
        completed.push_str(&delta);
        next = timeout_at(deadline, deltas.next_delta())
            .await
            .map_err(|_| RelayError::DeadlineExceeded)?;
    }

    match timeout_at(deadline, deltas.outcome())
        .await
        .map_err(|_| RelayError::DeadlineExceeded)?
    {
        StreamOutcome::Completed => {
            timeout_at(deadline, writer.write_closing())
                .await
                .map_err(|_| RelayError::DeadlineExceeded)??;
            Ok(completed)
        }
        StreamOutcome::Failed(err) => Err(err.into()),
    }
}

fn log_completion(
    upstream: &str,
    completed: &str,
    messages: &[ConversationMessage],
    prompt: Option<&str>,
) {
    let request_messages = serde_json::to_string(messages).unwrap_or_default();
    tracing::info!(
        upstream = %upstream,
        completed_response = %completed,
        request_messages = %request_messages,
        prompt = ?prompt,
        "completed response"
    );
}

fn record_failure(stage: &'static str) {
    metrics::counter!("relaygate_request_failures_total", "stage" => stage).increment(1);
}
