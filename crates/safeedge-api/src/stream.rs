//! Device command stream over WebSocket.
//!
//! Text frames carry one JSON [`DeviceMessage`] inbound and one JSON
//! [`ControlMessage`] outbound. The socket is bridged onto a pair of
//! channels and handed to [`run_device_session`].

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use safeedge_registry::{ControlMessage, DeviceMessage, run_device_session};
use safeedge_state::DeviceStatus;

use crate::ApiState;
use crate::handlers::{error_response, state_error_response};

const INBOUND_BUFFER: usize = 32;
const OUTBOUND_BUFFER: usize = 32;

/// GET /api/v1/devices/{id}/stream
pub async fn device_stream(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Response {
    match state.store.get_device(&device_id) {
        Ok(Some(device)) if device.status == DeviceStatus::Active => {}
        Ok(Some(device)) => {
            warn!(%device_id, status = ?device.status, "stream refused for inactive device");
            return error_response("device is not active", StatusCode::FORBIDDEN);
        }
        Ok(None) => return error_response("device not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error_response(&e),
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state, device_id))
}

async fn serve_socket(socket: WebSocket, state: ApiState, device_id: String) {
    let (mut sink, mut frames) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<DeviceMessage>(INBOUND_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(OUTBOUND_BUFFER);

    let writer_device = device_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            let text = match serde_json::to_string(&command) {
                Ok(text) => text,
                Err(e) => {
                    warn!(device_id = %writer_device, error = %e, "failed to encode command");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(device_id = %writer_device, error = %e, "socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session = tokio::spawn(run_device_session(
        state.registry.clone(),
        state.dispatcher.clone(),
        device_id.clone(),
        in_rx,
        out_tx,
    ));

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<DeviceMessage>(text.as_str()) {
                Ok(message) => {
                    if in_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(%device_id, error = %e, "undecodable device frame dropped"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%device_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    drop(in_tx);
    if let Err(e) = session.await {
        warn!(%device_id, error = %e, "device session task failed");
    }
    writer.abort();
}
