//! Server-Sent Events stream
//!
//! Each client receives a `snapshot` event with the current snapshot on
//! connect and after every publish, interleaved with tracking events named
//! by their type.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, warn};

use super::server::AppContext;

/// GET /events
pub async fn event_stream(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("New SSE client connected");

    let snapshots = WatchStream::new(ctx.engine.watch()).filter_map(|snapshot| async move {
        match serde_json::to_string(&*snapshot) {
            Ok(json) => Some(Ok(Event::default()
                .event("snapshot")
                .id(snapshot.revision.to_string())
                .data(json))),
            Err(e) => {
                warn!("Failed to serialize snapshot: {}", e);
                None
            }
        }
    });

    let events = BroadcastStream::new(ctx.engine.events()).filter_map(|result| async move {
        match result {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().event(event.event_type()).data(json))),
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    None
                }
            },
            Err(e) => {
                // Lagged receiver; the next snapshot event resynchronizes the client
                warn!("SSE stream error: {:?}", e);
                None
            }
        }
    });

    Sse::new(stream::select(snapshots, events)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
