//! The SSE progress gateway: one long-lived push stream per connection,
//! translating the store's per-id event stream into event-source frames.
//!
//! Frame ordering follows store commit order. The first frame is always the
//! current snapshot, so a client connecting after the terminal state still
//! receives exactly one (terminal) frame. A subscriber that falls behind its
//! buffer is disconnected with an overflow frame rather than being allowed
//! to back-pressure the store.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::Path;
use axum::extract::State;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use chrono::DateTime;
use chrono::Utc;
use futures::Stream;
use opthub_core::JobEvent;
use opthub_protocol::JobError;
use opthub_protocol::JobId;
use opthub_protocol::JobRecord;
use opthub_protocol::OptimizationResult;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::AppState;

/// Keep-alive comment cadence; well under the 30s intermediary ceiling.
const KEEP_ALIVE_SECS: u64 = 15;

#[derive(Debug, Serialize)]
struct StreamFrame {
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<OptimizationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
    timestamp: DateTime<Utc>,
}

impl StreamFrame {
    fn from_record(record: JobRecord) -> Self {
        Self {
            state: record.state.to_string(),
            result: record.result,
            error: record.error,
            timestamp: Utc::now(),
        }
    }

    fn unknown() -> Self {
        Self {
            state: "unknown".to_string(),
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn into_event(self) -> Event {
        match Event::default().json_data(&self) {
            Ok(event) => event,
            // Serialization of our own types cannot fail; emit an empty
            // frame rather than killing the connection if it ever does.
            Err(err) => {
                debug!("failed to encode stream frame: {err}");
                Event::default().data("{}")
            }
        }
    }
}

/// `GET /api/async/tasks/{id}/stream`
pub async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let Ok(id) = id.parse::<JobId>() else {
            yield Ok(StreamFrame::unknown().into_event());
            return;
        };
        let Some((snapshot, mut events)) = state.store.subscribe(id) else {
            yield Ok(StreamFrame::unknown().into_event());
            return;
        };

        let mut last_state = snapshot.state;
        let terminal = snapshot.state.is_terminal();
        yield Ok(StreamFrame::from_record(snapshot).into_event());
        if terminal {
            return;
        }

        loop {
            match events.recv().await {
                Ok(JobEvent::Updated(record)) => {
                    // Attempt-counter style updates re-publish the same
                    // state; clients only care about transitions.
                    if record.state == last_state {
                        continue;
                    }
                    last_state = record.state;
                    let terminal = record.state.is_terminal();
                    yield Ok(StreamFrame::from_record(record).into_event());
                    if terminal {
                        return;
                    }
                }
                Ok(JobEvent::Evicted) => {
                    yield Ok(StreamFrame::unknown().into_event());
                    return;
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("stream for {id} lagged by {skipped} events, disconnecting");
                    yield Ok(Event::default()
                        .event("overflow")
                        .data("subscriber buffer overflowed; reconnect to resynchronize"));
                    return;
                }
                Err(RecvError::Closed) => return,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keep-alive"),
    )
}
