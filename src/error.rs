use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RTSP error: {0}")]
    Rtsp(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("no compatible media (expected H.264 or H.265 video)")]
    NoCompatibleMedia,

    #[error("Transcoder error: {0}")]
    Transcode(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;
