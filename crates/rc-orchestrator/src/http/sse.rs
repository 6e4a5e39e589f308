//! Deployment event stream as server-sent events

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;

use rc_protocol::DeployEvent;

/// Render one deployment event
pub fn to_sse(event: &DeployEvent) -> Event {
    match event.data() {
        Ok(data) => Event::default().event(event.name()).data(data),
        Err(e) => {
            tracing::error!("Failed to serialize {} event: {}", event.name(), e);
            Event::default().comment("failed to serialize event")
        }
    }
}

/// Stream events from `rx` up to and including the first terminal event
pub fn event_stream(
    rx: mpsc::UnboundedReceiver<DeployEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        let event = rx.recv().await?;
        let terminal = event.is_terminal();
        Some((Ok(to_sse(&event)), (rx, terminal)))
    })
}
