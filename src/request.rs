use crate::error::AppError;
use axum::body::Body;
use serde::{Deserialize, Serialize};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Which endpoint a request arrived on. Derived from the URL path, never
/// from the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Chat,
    Completion,
}

impl RequestKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        if path.ends_with("/chat/completions") {
            Some(Self::Chat)
        } else if path.ends_with("/completions") {
            Some(Self::Completion)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// JSON body shape accepted on both endpoints. Unknown fields such as
/// `model` or `stream` are ignored; the upstream decides those.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestPayload {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default, rename = "maxTokens", alias = "max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl RequestPayload {
    pub fn into_request(self, kind: RequestKind) -> IncomingRequest {
        IncomingRequest {
            kind,
            prompt: self.prompt,
            messages: self.messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// One inbound call, owned by the task serving it.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub kind: RequestKind,
    pub prompt: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl IncomingRequest {
    pub fn chat(messages: Vec<ConversationMessage>, max_tokens: u32) -> Self {
        Self {
            kind: RequestKind::Chat,
            prompt: None,
            messages,
            max_tokens,
            temperature: None,
        }
    }

    pub fn completion(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            kind: RequestKind::Completion,
            prompt: Some(prompt.into()),
            messages: Vec::new(),
            max_tokens,
            temperature: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("error reading request body: {0}")]
    BodyRead(String),
    #[error("unsupported content type: {}", .0.as_deref().unwrap_or("<none>"))]
    UnsupportedMediaType(Option<String>),
    #[error("malformed payload: {error}")]
    MalformedPayload { error: String, body: String },
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::BodyRead(_) => AppError::internal("error reading request body"),
            DecodeError::UnsupportedMediaType(_) => {
                AppError::bad_request("Invalid request format. Please send a JSON payload.")
            }
            DecodeError::MalformedPayload { body, .. } => {
                AppError::bad_request("Error parsing JSON payload").with_body(body)
            }
        }
    }
}

/// Reads the whole body, then checks the content type, then parses.
pub async fn decode(
    body: Body,
    content_type: Option<&str>,
    limit: usize,
) -> Result<RequestPayload, DecodeError> {
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|err| DecodeError::BodyRead(err.to_string()))?;

    if content_type != Some(JSON_CONTENT_TYPE) {
        return Err(DecodeError::UnsupportedMediaType(
            content_type.map(str::to_string),
        ));
    }

    serde_json::from_slice(&bytes).map_err(|err| DecodeError::MalformedPayload {
        error: err.to_string(),
        body: String::from_utf8_lossy(&bytes).into_owned(),
    })
}
