//! SSE response assembly: the producer side of a streamed completion
//! pushes typed payloads into a bounded channel, and this module frames
//! them as `data: <json>\n\n` events with a literal `[DONE]` sentinel at
//! the end of the stream.

use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use tokenflow_common::{ChatCompletionChunk, CompletionChunk, Error};
use tokio::sync::mpsc;
use tracing::error;

use crate::session::DisconnectWatch;

/// Maximum frames buffered towards a slow client.
pub const BUFFER_SIZE: usize = 32;

/// One frame of a streamed response.
#[derive(Debug, Clone)]
pub enum SsePayload {
    Chat(ChatCompletionChunk),
    Completion(CompletionChunk),
    /// Error shape sent as a data frame: `{"error": {...}}`
    Error(serde_json::Value),
    /// Terminal sentinel, framed as `data: [DONE]`
    Done,
}

impl SsePayload {
    pub fn error(err: &Error) -> Self {
        SsePayload::Error(json!({
            "error": tokenflow_common::ErrorResponse::from(err)
        }))
    }
}

/// Frame a payload as an SSE event. Serialization failures are logged and
/// skipped rather than breaking the stream.
pub fn payload_event(payload: &SsePayload) -> Option<Event> {
    match payload {
        SsePayload::Chat(chunk) => match serde_json::to_string(chunk) {
            Ok(json) => Some(Event::default().data(json)),
            Err(e) => {
                error!("failed to serialize chat chunk: {}", e);
                None
            }
        },
        SsePayload::Completion(chunk) => match serde_json::to_string(chunk) {
            Ok(json) => Some(Event::default().data(json)),
            Err(e) => {
                error!("failed to serialize completion chunk: {}", e);
                None
            }
        },
        SsePayload::Error(value) => Some(Event::default().data(value.to_string())),
        SsePayload::Done => Some(Event::default().data("[DONE]")),
    }
}

/// Consumer half: turn the payload channel into an SSE response.
pub fn sse_response(
    mut rx: mpsc::Receiver<SsePayload>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(payload) = rx.recv().await {
            if let Some(event) = payload_event(&payload) {
                yield Ok(event);
            }
        }
    };
    Sse::new(stream)
}

/// Disconnect probe backed by the response channel: once the client is
/// gone the consumer side is dropped and the channel closes.
pub struct SenderWatch(pub mpsc::Sender<SsePayload>);

impl DisconnectWatch for SenderWatch {
    fn is_disconnected(&self) -> bool {
        self.0.is_closed()
    }
}
