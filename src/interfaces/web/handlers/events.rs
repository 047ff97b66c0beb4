use axum::{
    Json,
    extract::{Path, Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::HashSet;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use super::super::AppState;
use super::bad_request;
use crate::core::events::{ChannelMessage, Event, EventKind};

pub const LAGGED_EVENT: &str = "stream:lagged";

#[derive(Deserialize)]
pub struct EventsQuery {
    /// Comma separated event names, e.g. `job:completed,cron:run`.
    types: Option<String>,
}

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default()
        .event(event.name())
        .data(event.payload_json().to_string())
}

pub async fn events_endpoint(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let wanted: Option<HashSet<String>> = query.types.map(|types| {
        types
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    });
    let receiver = state.orchestrator.bus().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |msg| match msg {
        Ok(event) => {
            if wanted.as_ref().is_some_and(|w| !w.contains(event.name())) {
                return None;
            }
            Some(Ok(to_sse(&event)))
        }
        // The listener missed events; it has to re-fetch state.
        Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Ok(SseEvent::default()
            .event(LAGGED_EVENT)
            .data(serde_json::json!({ "skipped": skipped }).to_string()))),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(SseEvent::default().data(line)),
        Err(_) => Ok(SseEvent::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

#[derive(Deserialize)]
pub struct ChannelMessageRequest {
    text: String,
    #[serde(default)]
    chat_id: Option<String>,
}

pub async fn channel_message_endpoint(
    Path(channel): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ChannelMessageRequest>,
) -> Response {
    if payload.text.trim().is_empty() {
        return bad_request("text must not be empty");
    }
    let delivered = state
        .orchestrator
        .bus()
        .publish(EventKind::ChannelMessage(ChannelMessage {
            channel,
            text: payload.text,
            chat_id: payload.chat_id,
        }));
    Json(serde_json::json!({ "success": true, "delivered": delivered })).into_response()
}
