//! WebSocket signaling messages

use serde::{Deserialize, Serialize};

/// Inbound message from a browser client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// SDP offer opening the negotiation
    Offer { sdp: String },
    /// Trickle ICE candidate
    Candidate { candidate: CandidatePayload },
}

/// ICE candidate as exchanged with the browser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Candidate shapes on the wire: the structured object, or the legacy
/// bare candidate string some clients still send
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CandidatePayload {
    Structured(IceCandidate),
    Legacy(String),
}

impl CandidatePayload {
    pub fn into_candidate(self) -> IceCandidate {
        match self {
            CandidatePayload::Structured(candidate) => candidate,
            CandidatePayload::Legacy(candidate) => IceCandidate {
                candidate,
                sdp_mid: None,
                sdp_mline_index: None,
            },
        }
    }
}

/// Outbound message to a browser client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// SDP answer, sent after ICE gathering completes
    Answer { sdp: String },
}
