use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtc_relay::hub::Hub;
use rtc_relay::nal::VideoCodec;
use rtc_relay::stream::{self, InputType, OutputMode, RtspTransport, StreamConfig};
use rtc_relay::transcode::Processor;
use rtc_relay::web::{self, AppState};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// rtc-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtc-relay")]
#[command(version, about = "Low-latency RTSP/RTP to WebRTC video relay", long_about = None)]
struct CliArgs {
    /// Camera RTSP URL, rtp:// URL or SDP file (not needed in server modes)
    #[arg(long, value_name = "URL")]
    input_url: Option<String>,

    /// HTTP/WebSocket server port
    #[arg(long, value_name = "PORT", default_value = "8080")]
    port: String,

    /// Codec of the input stream
    #[arg(long, value_enum, default_value = "h264")]
    codec: VideoCodec,

    /// Codec delivered to clients
    #[arg(long, value_enum, default_value = "h264")]
    output_codec: VideoCodec,

    /// Processor used for H.265 transcoding
    #[arg(long, value_enum, default_value = "cpu")]
    processor: Processor,

    /// Input type: rtsp, rtp, server (RTSP push) or rtp-server
    #[arg(long, value_enum, default_value = "rtsp")]
    input_type: InputType,

    /// Use the native protocol stack instead of the external framer
    #[arg(long, value_name = "true|false", default_value_t = false, action = clap::ArgAction::Set)]
    use_native: bool,

    /// Listen address for the rtp-server input type
    #[arg(long, value_name = "ADDR", default_value = ":5004")]
    rtp_server_addr: String,

    /// RTSP pull transport
    #[arg(long, value_enum, default_value = "tcp")]
    rtsp_transport: RtspTransport,

    /// Client delivery: webrtc or webcodecs (WebSocket NAL mode)
    #[arg(long, value_enum, default_value = "webrtc")]
    output_mode: OutputMode,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level);

    tracing::info!("starting rtc-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = StreamConfig {
        input_url: args.input_url,
        input_type: args.input_type,
        codec: args.codec,
        output_codec: args.output_codec,
        processor: args.processor,
        use_native: args.use_native,
        rtp_server_addr: args.rtp_server_addr,
        rtsp_transport: args.rtsp_transport,
        output_mode: args.output_mode,
    };

    // Invalid combinations are fatal before anything binds.
    let plan = stream::plan_pipeline(&config)?;

    let hub = Arc::new(Hub::new(config.output_codec));
    stream::spawn_pipeline(config.clone(), plan, hub.clone());

    let state = Arc::new(AppState {
        hub,
        output_mode: config.output_mode,
    });
    let app = web::create_router(state);

    let port: u16 = args
        .port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port '{}'", args.port))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Error => "rtc_relay=error,tower_http=error",
        LogLevel::Warn => "rtc_relay=warn,tower_http=warn",
        LogLevel::Info => "rtc_relay=info,tower_http=info",
        LogLevel::Debug => "rtc_relay=debug,tower_http=debug",
        LogLevel::Trace => "rtc_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority.
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
