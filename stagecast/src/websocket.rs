//! WebSocket control channel
//!
//! One task per connection: requests are handled strictly in order and each
//! response goes out before the next request is read. A writer task owns the
//! socket sink; responses and notifications reach it through a bounded
//! channel. When the socket goes away the connection is handed to the
//! disconnect reconciler.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use stagecast_core::MediaEvent;
use stagecast_sfu::{ConnectionId, SfuEvent};

use crate::server::AppState;
use crate::signaling::{ControlSession, Notification};

/// Outbound frames buffered per connection before notifications are dropped
const OUTBOUND_CAPACITY: usize = 256;

/// Close code sent when the media engine cannot serve the connection
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// WebSocket endpoint for the control channel
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_bytes = state.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::generate();

    // Resource allocation failure is the only fatal connection error
    if let Err(e) = state.sessions.open_connection(connection_id.clone()).await {
        error!(connection_id = %connection_id, error = %e, "Failed to open connection");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_INTERNAL_ERROR,
                reason: e.code().into(),
            })))
            .await;
        return;
    }
    info!(connection_id = %connection_id, "WebSocket connection established");

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let (mut sink, mut stream) = socket.split();

    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_connection, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let forwarder = tokio::spawn(forward_notifications(
        connection_id.clone(),
        state.sessions.subscribe_events(),
        state.media_events.subscribe(),
        tx.clone(),
    ));

    let session = ControlSession::new(connection_id.clone(), state.clone());
    loop {
        let message = tokio::select! {
            () = state.shutdown.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                let response = session.handle_text(text.as_str()).await;
                if send_json(&tx, &response).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(connection_id = %connection_id, "Ignoring binary frame");
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong are answered by axum
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    forwarder.abort();
    drop(tx);

    let report = state.sessions.disconnect(&connection_id).await;
    let _ = writer.await;
    info!(
        connection_id = %connection_id,
        closed_transports = report.closed_transports,
        closed_consumers = report.closed_consumers,
        pending_tracks = report.pending_tracks.len(),
        "WebSocket connection closed"
    );
}

/// Queue a response; waits for room so responses are never dropped
async fn send_json(tx: &mpsc::Sender<String>, value: &impl Serialize) -> Result<(), ()> {
    let text = serde_json::to_string(value).map_err(|e| {
        error!(error = %e, "Failed to encode control message");
    })?;
    tx.send(text).await.map_err(|_| ())
}

/// Relay room and media events to one connection until either side goes away
async fn forward_notifications(
    connection_id: ConnectionId,
    mut sfu_events: broadcast::Receiver<SfuEvent>,
    mut media_events: broadcast::Receiver<MediaEvent>,
    tx: mpsc::Sender<String>,
) {
    loop {
        let notification = tokio::select! {
            received = sfu_events.recv() => match received {
                Ok(event) if event.is_for(&connection_id) => Notification::from_event(&event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "Room notifications lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            received = media_events.recv() => match received {
                Ok(event) => Notification::from_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "Media notifications lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        let Some(notification) = notification else {
            continue;
        };
        let Ok(text) = serde_json::to_string(&notification) else {
            continue;
        };

        // Slow clients lose notifications, never responses
        match tx.try_send(text) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %connection_id, "Client too slow, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}
