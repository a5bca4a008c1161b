//! WebSocket endpoint at `/ws`
//!
//! Depending on the configured output mode the upgraded socket either
//! becomes a WebRTC signaling session or a NAL-mode feed where the server
//! pushes JSON-framed NAL units for client-side decoding.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::hub::Hub;
use crate::stream::OutputMode;
use crate::web::AppState;
use crate::webrtc::run_webrtc_session;

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    match state.output_mode {
        OutputMode::Webrtc => run_webrtc_session(socket, state.hub.clone()).await,
        OutputMode::Webcodecs => run_nal_session(socket, state.hub.clone()).await,
    }
}

/// NAL mode: register with the hub and stream envelopes until either side
/// goes away. Inbound traffic is only watched for closure.
async fn run_nal_session(socket: WebSocket, hub: Arc<Hub>) {
    let (handle, mut envelopes) = hub.register_nal_client().await;
    info!("nal-mode client connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            envelope = envelopes.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                if sender.send(Message::Text(envelope.to_json())).await.is_err() {
                    debug!("nal-mode client send failed, closing");
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("nal-mode client read error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.deregister_nal_client(handle).await;
    info!("nal-mode client disconnected");
}
