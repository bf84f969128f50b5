#[cfg(test)]
mod tests;

use futures::{Stream, StreamExt};
use serde_json::json;

/// Terminal frame written after every stream, clean or not
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One event of a generation stream.
///
/// A stream is zero or more `Content` events, at most one `Error`, and
/// exactly one final `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Content(String),
    /// User-legible failure message
    Error(String),
    Done,
}

impl GenerationEvent {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Server-sent event framing: `data: <payload>\n\n`
    pub fn to_sse_frame(&self) -> String {
        match self {
            Self::Content(text) => format!("data: {}\n\n", json!({ "content": text })),
            Self::Error(message) => format!("data: {}\n\n", json!({ "error": message })),
            Self::Done => DONE_FRAME.to_string(),
        }
    }
}

/// Map a generation stream onto its SSE frames
pub fn sse_frames<S>(events: S) -> impl Stream<Item = String>
where
    S: Stream<Item = GenerationEvent>,
{
    events.map(|event| event.to_sse_frame())
}
