//! Per-connection WebRTC session
//!
//! One session per WebSocket: build the peer connection, register its
//! track with the hub, then process signaling messages in arrival order
//! until the socket closes. The offer/answer exchange is strictly
//! sequential; candidates arriving before the remote description is set
//! are queued and applied afterwards.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::webrtc::peer;
use crate::webrtc::signaling::{ClientMessage, IceCandidate, ServerMessage};

/// Run a signaling session to completion. Cleanup (track deregistration,
/// peer close) always runs when the socket ends.
pub async fn run_webrtc_session(socket: WebSocket, hub: Arc<Hub>) {
    let codec = hub.output_codec();
    let (pc, track) = match peer::create_peer(codec).await {
        Ok(created) => created,
        Err(e) => {
            warn!("failed to set up peer connection: {}", e);
            return;
        }
    };
    let track_handle = hub.register_track(track, codec).await;

    info!("signaling session started ({})", codec);

    let (mut sender, mut receiver) = socket.split();
    let mut remote_described = false;
    let mut pending_candidates: Vec<IceCandidate> = Vec::new();

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("websocket read error: {}", e);
                break;
            }
        };

        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("invalid signaling message: {}", e);
                continue;
            }
        };

        match parsed {
            ClientMessage::Offer { sdp } => {
                let answer = match peer::handle_offer(&pc, sdp).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!("offer handling failed: {}", e);
                        continue;
                    }
                };
                remote_described = true;

                let reply = match serde_json::to_string(&ServerMessage::Answer { sdp: answer }) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("failed to serialize answer: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(reply)).await.is_err() {
                    break;
                }

                for candidate in pending_candidates.drain(..) {
                    if let Err(e) = peer::add_candidate(&pc, candidate).await {
                        debug!("queued candidate rejected: {}", e);
                    }
                }
            }
            ClientMessage::Candidate { candidate } => {
                let candidate = candidate.into_candidate();
                if candidate.candidate.is_empty() {
                    continue;
                }
                if remote_described {
                    if let Err(e) = peer::add_candidate(&pc, candidate).await {
                        debug!("candidate rejected: {}", e);
                    }
                } else {
                    pending_candidates.push(candidate);
                }
            }
        }
    }

    hub.deregister_track(track_handle).await;
    if let Err(e) = pc.close().await {
        debug!("peer close failed: {}", e);
    }
    info!("signaling session ended");
}
