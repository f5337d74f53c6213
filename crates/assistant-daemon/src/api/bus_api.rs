//! Bus methods and the signal stream.
//!
//! `POST /streaming/start` returns as soon as the generation has an id; all
//! progress after that is only observable on `GET /signals`.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::{Stream, StreamExt};
use tracing::{debug, error, info};

use crate::bus::http_client::{StartRequest, StopReply};
use crate::shared_state::AppState;

/// POST /streaming/start
pub async fn start_streaming(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Response {
    if req.text.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Message text cannot be empty").into_response();
    }
    info!("StartStreaming ({} chars)", req.text.len());
    let reply = state.service.start_streaming(&req.text);
    Json(reply).into_response()
}

/// POST /generation/stop
pub async fn stop_generation(State(state): State<AppState>) -> Json<StopReply> {
    let generation_id = state.service.manager.stop();
    Json(StopReply {
        acknowledged: true,
        generation_id,
    })
}

/// POST /history/clear
pub async fn clear_history(State(state): State<AppState>) -> Response {
    match state.service.clear_history() {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Failed to clear history: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to clear history: {}", e)).into_response()
        }
    }
}

/// GET /signals
pub async fn signals(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut receiver = state.service.bus.subscribe();
    let shutdown = state.service.shutdown_token();
    debug!("Signal subscriber connected");

    // On shutdown, events already queued are still sent before the stream ends.
    let events = async_stream::stream! {
        loop {
            let next = tokio::select! {
                biased;
                event = receiver.recv() => event,
                _ = shutdown.cancelled() => {
                    receiver.close();
                    receiver.recv().await
                }
            };
            match next {
                Some(event) => yield event,
                None => break,
            }
        }
    };

    let stream = events
        .filter_map(|event| async move {
            match serde_json::to_string(&event) {
                Ok(data) => Some(Ok(Event::default().event(event.signal_name()).data(data))),
                Err(e) => {
                    error!("Failed to encode signal: {}", e);
                    None
                }
            }
        });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}
