//! Broadcast endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures::stream::{self, Stream, StreamExt};
use herald_core::{BroadcastEvent, BroadcastStatus, StartBroadcast};
use tokio_stream::wrappers::ReceiverStream;

use crate::AppState;
use crate::response::ApiError;

const fn event_name(event: &BroadcastEvent) -> &'static str {
    match event {
        BroadcastEvent::Status(_) => "status",
        BroadcastEvent::Log(_) => "log",
        BroadcastEvent::Issue(_) => "issue",
    }
}

fn to_sse(event: &BroadcastEvent) -> Event {
    Event::default()
        .event(event_name(event))
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event("error").data("unserializable event"))
}

async fn start(
    State(state): State<AppState>,
    Json(input): Json<StartBroadcast>,
) -> Result<(StatusCode, Json<BroadcastStatus>), ApiError> {
    let status = state.broadcasts.start(input).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BroadcastStatus>, ApiError> {
    Ok(Json(state.broadcasts.status(&id).await?))
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BroadcastStatus>, ApiError> {
    Ok(Json(state.broadcasts.request_stop(&id).await?))
}

async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<BroadcastStatus>), ApiError> {
    let status = state.broadcasts.resume(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// Snapshot replay followed by live events.
async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let feed = state.broadcasts.subscribe(&id).await?;
    let replay = stream::iter(feed.replay());
    let live = ReceiverStream::new(feed.live);

    let stream = replay.chain(live).map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(start))
        .route("/{id}", get(show))
        .route("/{id}/stop", post(stop))
        .route("/{id}/resume", post(resume))
        .route("/{id}/events", get(events))
}
