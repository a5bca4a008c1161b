//! Peer connection construction and SDP negotiation

use std::sync::Arc;

use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, Result};
use crate::nal::VideoCodec;
use crate::webrtc::signaling::IceCandidate;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const TRACK_ID: &str = "video0";
const STREAM_ID: &str = "rtc-relay";

/// RTP codec capability offered for the output codec
pub fn codec_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: codec.clock_rate(),
        channels: 0,
        sdp_fmtp_line: codec.sdp_fmtp().to_string(),
        rtcp_feedback: vec![],
    }
}

/// Create a peer connection offering exactly the hub's output codec, with
/// one outgoing video track already added.
///
/// The RTP sender is drained of RTCP by a background task; without that
/// read loop the interceptors never pump.
pub async fn create_peer(
    codec: VideoCodec,
) -> Result<(Arc<RTCPeerConnection>, Arc<TrackLocalStaticSample>)> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(codec),
                payload_type: codec.payload_type(),
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| AppError::WebRtc(format!("failed to register codec: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| AppError::WebRtc(format!("failed to register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| AppError::WebRtc(format!("failed to create peer connection: {}", e)))?,
    );

    let track = Arc::new(TrackLocalStaticSample::new(
        codec_capability(codec),
        TRACK_ID.to_string(),
        STREAM_ID.to_string(),
    ));

    let rtp_sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| AppError::WebRtc(format!("failed to add video track: {}", e)))?;

    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        debug!("rtcp drain ended");
    });

    info!("peer connection created ({} track)", codec);
    Ok((pc, track))
}

/// Apply a remote offer and produce the local answer, waiting for ICE
/// gathering to complete so the SDP carries all candidates.
pub async fn handle_offer(pc: &RTCPeerConnection, sdp: String) -> Result<String> {
    let offer = RTCSessionDescription::offer(sdp)
        .map_err(|e| AppError::WebRtc(format!("invalid SDP offer: {}", e)))?;
    pc.set_remote_description(offer)
        .await
        .map_err(|e| AppError::WebRtc(format!("failed to set remote description: {}", e)))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| AppError::WebRtc(format!("failed to create answer: {}", e)))?;

    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(|e| AppError::WebRtc(format!("failed to set local description: {}", e)))?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| AppError::WebRtc("no local description after gathering".to_string()))?;
    Ok(local.sdp)
}

/// Add a trickled ICE candidate to the connection.
pub async fn add_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) -> Result<()> {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    };
    pc.add_ice_candidate(init)
        .await
        .map_err(|e| AppError::WebRtc(format!("failed to add ICE candidate: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_matches_codec() {
        let capability = codec_capability(VideoCodec::H264);
        assert_eq!(capability.mime_type, "video/H264");
        assert_eq!(capability.clock_rate, 90_000);
        assert!(capability.sdp_fmtp_line.contains("profile-level-id=42e01f"));

        let capability = codec_capability(VideoCodec::H265);
        assert_eq!(capability.mime_type, "video/H265");
        assert_eq!(capability.sdp_fmtp_line, "profile-id=1");
    }

    #[tokio::test]
    async fn creates_peer_with_track() {
        let (pc, _track) = create_peer(VideoCodec::H264).await.unwrap();
        assert_eq!(pc.get_senders().await.len(), 1);
        let _ = pc.close().await;
    }
}
