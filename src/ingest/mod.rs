//! Stream ingesters
//!
//! Each submodule is one way of getting packets into the pipeline:
//! pulling from an RTSP camera, accepting an RTSP publisher, listening for
//! raw RTP, or delegating the protocol layer to an external ffmpeg process.

pub mod external;
pub mod rtp_listener;
pub mod rtsp_client;
pub mod rtsp_server;
pub(crate) mod sdp;
