//! SSE framing helpers shared by `pull`, `logs/stream`, and the streaming
//! inference endpoints (§4.G).

use axum::response::sse::Event;
use futures_util::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PullEvent {
    Progress { bytes_downloaded: u64, bytes_total: Option<u64> },
    Complete,
    Error { message: String },
}

impl PullEvent {
    pub fn into_sse(self) -> Event {
        let name = match &self {
            PullEvent::Progress { .. } => "progress",
            PullEvent::Complete => "complete",
            PullEvent::Error { .. } => "error",
        };
        Event::default().event(name).json_data(&self).unwrap_or_else(|_| Event::default().event("error"))
    }
}

/// Wraps a `mpsc::Receiver<PullEvent>` as an axum SSE body stream.
pub fn pull_stream(
    rx: mpsc::Receiver<PullEvent>,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(rx).map(|e| Ok(e.into_sse()))
}
