//! Source selection: translate a configuration into a running pipeline
//!
//! [`plan_pipeline`] is a pure function from [`StreamConfig`] to a
//! [`PipelinePlan`]; invalid combinations are rejected before anything
//! binds or connects. [`spawn_pipeline`] materializes the plan as tasks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{AppError, Result};
use crate::hub::Hub;
use crate::ingest;
use crate::nal::{AccessUnit, VideoCodec};
use crate::transcode::{Processor, TranscodeBridge, TranscodeInput};

/// Where the stream comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    /// Pull from an RTSP camera URL
    Rtsp,
    /// Receive raw RTP addressed by URL or SDP file
    Rtp,
    /// Run an RTSP server and accept one publisher
    #[value(name = "server", alias = "rtsp-server")]
    Server,
    /// Listen for RTP on a fixed UDP port
    RtpServer,
}

impl InputType {
    pub fn is_server(&self) -> bool {
        matches!(self, InputType::Server | InputType::RtpServer)
    }
}

/// How clients receive video
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// WebRTC peer connection per client
    Webrtc,
    /// JSON-framed NAL units over the WebSocket, decoded client-side
    Webcodecs,
}

/// RTSP pull transport preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    /// TCP interleaved (reliable, default)
    Tcp,
    /// UDP unicast
    Udp,
}

/// Everything the source selector needs, straight from the CLI
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub input_url: Option<String>,
    pub input_type: InputType,
    pub codec: VideoCodec,
    pub output_codec: VideoCodec,
    pub processor: Processor,
    pub use_native: bool,
    pub rtp_server_addr: String,
    pub rtsp_transport: RtspTransport,
    pub output_mode: OutputMode,
}

/// The ingest component a plan selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestKind {
    RtspPull,
    RtspPush,
    RtpListener,
    /// ffmpeg as protocol handler and framer
    External,
}

/// A validated pipeline assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePlan {
    pub ingest: IngestKind,
    /// H.265 input re-encoded to H.264 before fan-out
    pub transcode: bool,
    /// Codec delivered to client tracks
    pub track_codec: VideoCodec,
}

/// Validate a configuration and decide the pipeline shape.
pub fn plan_pipeline(config: &StreamConfig) -> Result<PipelinePlan> {
    if config.codec == VideoCodec::H264 && config.output_codec == VideoCodec::H265 {
        return Err(AppError::Config(
            "unsupported codec combination: input h264 with output h265".to_string(),
        ));
    }

    if config.output_mode == OutputMode::Webcodecs && config.output_codec != VideoCodec::H264 {
        return Err(AppError::Config(
            "webcodecs output mode requires output codec h264".to_string(),
        ));
    }

    if !config.input_type.is_server() && config.input_url.as_deref().unwrap_or("").is_empty() {
        return Err(AppError::Config(format!(
            "input URL must be provided for input type '{:?}'",
            config.input_type
        )));
    }

    let transcode = config.codec == VideoCodec::H265 && config.output_codec == VideoCodec::H264;
    let passthrough_h265 = config.codec == VideoCodec::H265 && config.output_codec == VideoCodec::H265;

    let ingest = match config.input_type {
        InputType::Server => {
            if !config.use_native {
                return Err(AppError::Config(
                    "input type 'server' requires the native protocol stack (--use-native true)"
                        .to_string(),
                ));
            }
            IngestKind::RtspPush
        }
        InputType::RtpServer => IngestKind::RtpListener,
        InputType::Rtsp | InputType::Rtp => {
            if config.use_native {
                if config.input_type == InputType::Rtsp {
                    IngestKind::RtspPull
                } else {
                    IngestKind::RtpListener
                }
            } else {
                if passthrough_h265 {
                    return Err(AppError::Config(
                        "h265 pass-through requires the native protocol stack (--use-native true)"
                            .to_string(),
                    ));
                }
                IngestKind::External
            }
        }
    };

    Ok(PipelinePlan {
        ingest,
        transcode,
        track_codec: config.output_codec,
    })
}

/// Spawn the ingest task for a validated plan. Ingest failure terminates
/// the stream, not the process; restarts are the operator's concern.
pub fn spawn_pipeline(config: StreamConfig, plan: PipelinePlan, hub: Arc<Hub>) {
    info!(
        "pipeline: {:?} ingest, {} -> {}{}",
        plan.ingest,
        config.codec,
        plan.track_codec,
        if plan.transcode { " (transcoded)" } else { "" }
    );

    tokio::spawn(async move {
        let result = match plan.ingest {
            IngestKind::RtspPull => ingest::rtsp_client::run(&config, hub).await,
            IngestKind::RtspPush => ingest::rtsp_server::run(&config, hub).await,
            IngestKind::RtpListener => ingest::rtp_listener::run(&config, hub).await,
            IngestKind::External => ingest::external::run(&config, hub).await,
        };

        match result {
            Ok(()) => info!("ingest finished"),
            Err(e) => error!("ingest terminated: {}", e),
        }
    });
}

/// Destination of decoded access units: straight to the hub, or through
/// the transcoding bridge first.
#[derive(Clone)]
pub enum VideoSink {
    Broadcast { hub: Arc<Hub>, codec: VideoCodec },
    Transcode(TranscodeInput),
}

impl VideoSink {
    pub async fn deliver(&self, au: AccessUnit) {
        match self {
            VideoSink::Broadcast { hub, codec } => hub.publish(&au, *codec).await,
            VideoSink::Transcode(input) => input.deliver(au),
        }
    }
}

/// Build the sink an ingester feeds, spawning a transcoding bridge when the
/// input codec differs from the hub's output codec. `preamble` carries any
/// parameter sets already known (e.g. from SDP sprop attributes).
pub fn make_sink(
    config: &StreamConfig,
    hub: Arc<Hub>,
    preamble: Vec<Bytes>,
    duration: Duration,
) -> Result<(VideoSink, Option<Arc<TranscodeBridge>>)> {
    if config.codec == VideoCodec::H265 && config.output_codec == VideoCodec::H264 {
        let bridge = Arc::new(TranscodeBridge::spawn(
            config.processor,
            preamble,
            hub,
            duration,
        )?);
        Ok((VideoSink::Transcode(bridge.input()), Some(bridge)))
    } else {
        Ok((
            VideoSink::Broadcast {
                hub,
                codec: config.codec,
            },
            None,
        ))
    }
}
