//! Response framing for both endpoints.
//!
//! Chat streams are `data: <json>\r\n\r\n` frames ending with a closing chunk
//! and `data: [DONE]`. Completion streams are bare `<json>\r\n\r\n` frames
//! with no sentinel.

use crate::request::RequestKind;
use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\r\n\r\n";
const FRAME_END: &[u8] = b"\r\n\r\n";
const SSE_PREFIX: &[u8] = b"data: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Token accounting is not tracked; clients get fixed values.
    pub const PLACEHOLDER: Usage = Usage {
        prompt_tokens: 58,
        completion_tokens: 100,
        total_tokens: 1000,
    };
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub usage: Usage,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub finish_reason: Option<&'static str>,
    pub message: ChatDelta,
    pub delta: ChatDelta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatDelta {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub usage: Usage,
    pub choices: Vec<TextChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextChoice {
    pub index: u32,
    pub text: String,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: &'static str,
}

/// Fields shared by every chunk of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl ChunkHeader {
    pub fn new(kind: RequestKind, model: impl Into<String>) -> Self {
        let prefix = match kind {
            RequestKind::Chat => "chatcmpl",
            RequestKind::Completion => "cmpl",
        };
        Self {
            id: format!("{prefix}-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
        }
    }
}

pub fn chat_delta(header: &ChunkHeader, content: &str) -> ChatChunk {
    chat_chunk(header, content, None)
}

pub fn chat_closing(header: &ChunkHeader) -> ChatChunk {
    chat_chunk(header, "", Some("stop"))
}

fn chat_chunk(header: &ChunkHeader, content: &str, finish_reason: Option<&'static str>) -> ChatChunk {
    let delta = ChatDelta {
        role: "assistant",
        content: content.to_string(),
    };
    ChatChunk {
        id: header.id.clone(),
        object: "chat.completions.chunk",
        created: header.created,
        model: header.model.clone(),
        usage: Usage::PLACEHOLDER,
        choices: vec![ChatChoice {
            index: 0,
            finish_reason,
            message: delta.clone(),
            delta,
        }],
    }
}

pub fn text_delta(header: &ChunkHeader, content: &str) -> TextChunk {
    TextChunk {
        id: header.id.clone(),
        object: "text_completion",
        created: header.created,
        model: header.model.clone(),
        usage: Usage::PLACEHOLDER,
        choices: vec![TextChoice {
            index: 0,
            text: content.to_string(),
            logprobs: None,
            finish_reason: "length",
        }],
    }
}

pub fn sse_frame<T: Serialize>(payload: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(payload)?;
    let mut frame = Vec::with_capacity(SSE_PREFIX.len() + json.len() + FRAME_END.len());
    frame.extend_from_slice(SSE_PREFIX);
    frame.extend_from_slice(&json);
    frame.extend_from_slice(FRAME_END);
    Ok(Bytes::from(frame))
}

pub fn raw_frame<T: Serialize>(payload: &T) -> Result<Bytes, serde_json::Error> {
    let mut frame = serde_json::to_vec(payload)?;
    frame.extend_from_slice(FRAME_END);
    Ok(Bytes::from(frame))
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("client disconnected")]
    ClientGone,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writes frames into a response body. The body holds at most one pending
/// frame, so each write completes only once hyper has taken the previous one.
pub struct FrameWriter {
    tx: mpsc::Sender<Bytes>,
    kind: RequestKind,
    header: ChunkHeader,
}

impl FrameWriter {
    pub fn channel(kind: RequestKind, header: ChunkHeader) -> (FrameWriter, Body) {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>));
        (FrameWriter { tx, kind, header }, body)
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub async fn write_delta(&self, content: &str) -> Result<(), WriteError> {
        let frame = match self.kind {
            RequestKind::Chat => sse_frame(&chat_delta(&self.header, content))?,
            RequestKind::Completion => raw_frame(&text_delta(&self.header, content))?,
        };
        self.send(frame).await
    }

    /// Ends a successful chat stream. Completion streams have no sentinel.
    pub async fn write_closing(&self) -> Result<(), WriteError> {
        if self.kind != RequestKind::Chat {
            return Ok(());
        }
        self.send(sse_frame(&chat_closing(&self.header))?).await?;
        self.send(Bytes::from_static(DONE_FRAME)).await
    }

    async fn send(&self, frame: Bytes) -> Result<(), WriteError> {
        self.tx.send(frame).await.map_err(|_| WriteError::ClientGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    fn header() -> ChunkHeader {
        ChunkHeader {
            id: "chatcmpl-test".to_string(),
            created: 1_692_118_020,
            model: "gpt-3.5-turbo".to_string(),
        }
    }

    #[test]
    fn chat_frame_shape() {
        let frame = sse_frame(&chat_delta(&header(), "Hel")).expect("encode");
        let text = std::str::from_utf8(&frame).expect("utf8");
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("}\r\n\r\n"));
        let json: Value = serde_json::from_str(&text[6..text.len() - 4]).expect("json");
        assert_eq!(json["object"], "chat.completions.chunk");
        assert_eq!(json["id"], "chatcmpl-test");
        assert_eq!(json["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(json["choices"][0]["delta"]["role"], "assistant");
        assert!(json["choices"][0]["finish_reason"].is_null());
        assert_eq!(json["usage"]["total_tokens"], 1000);
    }

    #[test]
    fn closing_chunk_is_empty_with_stop() {
        let json = serde_json::to_value(chat_closing(&header())).expect("json");
        assert_eq!(json["choices"][0]["delta"]["content"], "");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn text_frame_has_no_prefix() {
        let frame = raw_frame(&text_delta(&header(), "lo")).expect("encode");
        let text = std::str::from_utf8(&frame).expect("utf8");
        assert!(text.starts_with('{'));
        let json: Value = serde_json::from_str(text.trim_end()).expect("json");
        assert_eq!(json["choices"][0]["text"], "lo");
        assert_eq!(json["choices"][0]["finish_reason"], "length");
    }

    #[tokio::test]
    async fn chat_writer_emits_closing_then_done() {
        let (writer, body) = FrameWriter::channel(RequestKind::Chat, header());
        let collect = tokio::spawn(async move { body.collect().await.map(|c| c.to_bytes()) });
        writer.write_delta("Hi").await.expect("write");
        writer.write_closing().await.expect("close");
        drop(writer);
        let bytes = collect.await.expect("join").expect("body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        let frames: Vec<&str> = text.split_terminator("\r\n\r\n").collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("\"content\":\"Hi\""));
        assert!(frames[1].contains("\"finish_reason\":\"stop\""));
        assert_eq!(frames[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn completion_writer_has_no_sentinel() {
        let (writer, body) = FrameWriter::channel(RequestKind::Completion, header());
        let collect = tokio::spawn(async move { body.collect().await.map(|c| c.to_bytes()) });
        writer.write_delta("a").await.expect("write");
        writer.write_closing().await.expect("no-op");
        drop(writer);
        let bytes = collect.await.expect("join").expect("body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert_eq!(text.split_terminator("\r\n\r\n").count(), 1);
        assert!(!text.contains("[DONE]"));
        assert!(!text.contains("data:"));
    }

    #[tokio::test]
    async fn dropped_body_reports_client_gone() {
        let (writer, body) = FrameWriter::channel(RequestKind::Chat, header());
        drop(body);
        assert!(matches!(
            writer.write_delta("x").await,
            Err(WriteError::ClientGone)
        ));
    }
}
