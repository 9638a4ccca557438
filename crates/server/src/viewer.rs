use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};

use crate::broadcast::ViewerConnection;
use crate::session::SessionController;

/// Drain a viewer's queue into its WebSocket, one binary message per unit.
///
/// Ends when the viewer disconnects, when the broadcaster drops it for
/// falling behind, or when the session stops (the queue closes).
pub async fn handle_viewer_ws(
    mut socket: WebSocket,
    viewer: ViewerConnection,
    controller: Arc<SessionController>,
) {
    let ViewerConnection { id, mut rx } = viewer;
    tracing::info!(viewer_id = %id, "Viewer WebSocket connected");

    loop {
        tokio::select! {
            unit = rx.recv() => {
                let Some(unit) = unit else {
                    tracing::info!(viewer_id = %id, "Video stream closed for viewer");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if socket.send(Message::Binary(unit.payload)).await.is_err() {
                    tracing::debug!(viewer_id = %id, "Viewer WebSocket send failed");
                    break;
                }
            }
            // Viewers have nothing to say; only watch for them leaving.
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Close(_)) => {
                        tracing::info!(viewer_id = %id, "Viewer WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(viewer_id = %id, "Viewer WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    controller.broadcaster().unsubscribe(id);
    tracing::info!(viewer_id = %id, "Viewer WebSocket disconnected");
}
