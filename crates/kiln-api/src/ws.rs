//! WebSocket stream of job updates.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use kiln_core::{JobId, JobUpdate};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Job-wide log offset to resume from.
    #[serde(default)]
    from: u64,
}

/// Upgrade to a WebSocket that replays the job's updates from `from` and
/// then follows it live. The server closes the socket after the terminal
/// phase.
pub async fn job_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let id = JobId::from(id);
    let updates = state.service.subscribe_logs(id, query.from).await?;
    Ok(ws.on_upgrade(move |socket| forward_updates(socket, id, updates)))
}

async fn forward_updates(socket: WebSocket, id: JobId, mut updates: BoxStream<'static, JobUpdate>) {
    info!(job_id = %id, "WebSocket subscriber connected");
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(update) = update else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&update) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Failed to encode update");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(job_id = %id, error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(job_id = %id, "WebSocket subscriber disconnected");
}
