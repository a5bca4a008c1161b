//! rtc-relay - low-latency camera-to-browser video relay
//!
//! Ingests a live H.264/H.265 stream (RTSP pull, RTSP push, raw RTP) and
//! fans coded NAL units out to browser clients over WebRTC, or over a
//! WebSocket carrying JSON-framed NAL units for client-side decoding.
//! H.265 sources can be transcoded to H.264 through an external encoder
//! subprocess.

pub mod error;
pub mod hub;
pub mod ingest;
pub mod nal;
pub mod rtp;
pub mod stream;
pub mod transcode;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
