//! External-framer mode: ffmpeg as protocol handler
//!
//! Instead of speaking RTSP/RTP natively, this mode hands the transport to
//! an ffmpeg subprocess configured to emit Annex-B H.264 on stdout; the
//! byte stream is framed into NAL units and published. For RTP inputs an
//! SDP document is generated from the URL and piped to ffmpeg stdin. The
//! H.265 paths re-encode inside the same process, so the separate
//! transcoding bridge is not used here.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};
use url::Url;

use crate::error::{AppError, Result};
use crate::hub::Hub;
use crate::nal::annexb::AnnexBSplitter;
use crate::nal::{AccessUnit, VideoCodec, DEFAULT_FRAME_DURATION};
use crate::stream::StreamConfig;
use crate::transcode::Processor;

/// Run ffmpeg-backed ingest until the subprocess exits.
pub async fn run(config: &StreamConfig, hub: Arc<Hub>) -> Result<()> {
    let input_url = config
        .input_url
        .as_deref()
        .ok_or_else(|| AppError::Config("external framer requires an input URL".to_string()))?;

    let (args, sdp_stdin) = build_command(config, input_url)?;
    info!("starting ffmpeg: ffmpeg {}", args.join(" "));

    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdin(if sdp_stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Transcode(format!("failed to start ffmpeg: {}", e)))?;

    if let Some(sdp) = sdp_stdin {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Transcode("ffmpeg stdin unavailable".to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(sdp.as_bytes()).await {
                error!("failed to feed SDP to ffmpeg: {}", e);
            }
            let _ = stdin.shutdown().await;
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("ffmpeg: {}", line);
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Transcode("ffmpeg stdout unavailable".to_string()))?;

    // All external-framer pipelines emit H.264 Annex-B; each NAL goes out
    // as its own access unit with the default duration hint.
    let mut reader = BufReader::new(stdout);
    let mut splitter = AnnexBSplitter::new();
    let mut chunk = [0u8; 4096];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                splitter.push(&chunk[..n]);
                while let Some(nal) = splitter.next_nal() {
                    hub.publish(
                        &AccessUnit::single(nal, DEFAULT_FRAME_DURATION),
                        VideoCodec::H264,
                    )
                    .await;
                }
            }
            Err(e) => {
                error!("ffmpeg stdout read failed: {}", e);
                break;
            }
        }
    }
    if let Some(nal) = splitter.finish() {
        hub.publish(
            &AccessUnit::single(nal, DEFAULT_FRAME_DURATION),
            VideoCodec::H264,
        )
        .await;
    }

    match child.wait().await {
        Ok(status) => info!("ffmpeg exited: {}", status),
        Err(e) => error!("failed to await ffmpeg: {}", e),
    }
    Ok(())
}

/// Build the ffmpeg invocation for the configured codec/processor/input.
/// Returns the argument list and, for RTP inputs, the SDP fed via stdin.
fn build_command(config: &StreamConfig, input_url: &str) -> Result<(Vec<String>, Option<String>)> {
    let is_rtp = input_url.starts_with("rtp://");

    if is_rtp {
        let sdp = generate_sdp(input_url, config.codec)?;
        let mut args: Vec<String> = vec![
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "sdp".into(),
            "-protocol_whitelist".into(),
            "file,udp,rtp,pipe".into(),
        ];
        args.extend(rtp_pre_input_args(config));
        args.push("-i".into());
        args.push("pipe:0".into());
        args.extend(output_args(config));
        Ok((args, Some(sdp)))
    } else {
        let mut args: Vec<String> = vec!["-loglevel".into(), "error".into()];
        args.extend(rtsp_pre_input_args(config));
        args.push("-i".into());
        args.push(input_url.to_string());
        args.extend(output_args(config));
        Ok((args, None))
    }
}

fn rtsp_pre_input_args(config: &StreamConfig) -> Vec<String> {
    let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match (config.codec, config.processor) {
        (VideoCodec::H264, _) => owned(&[
            "-rtsp_transport", "udp",
            "-max_delay", "0",
            "-analyzeduration", "0",
            "-avioflags", "direct",
            "-flags", "low_delay",
            "-fflags", "+igndts+nobuffer",
        ]),
        (VideoCodec::H265, Processor::Cpu) => owned(&[
            "-rtsp_transport", "udp",
            "-probesize", "250000",
            "-analyzeduration", "50000",
            "-fflags", "nobuffer+genpts",
            "-flags", "low_delay",
            "-max_delay", "500",
        ]),
        (VideoCodec::H265, Processor::Gpu) => owned(&[
            "-rtsp_transport", "tcp",
            "-probesize", "250000",
            "-analyzeduration", "0",
            "-fflags", "nobuffer+flush_packets+genpts",
            "-flags", "low_delay",
            "-max_delay", "0",
            "-hwaccel", "cuda",
            "-hwaccel_output_format", "cuda",
        ]),
    }
}

fn rtp_pre_input_args(config: &StreamConfig) -> Vec<String> {
    let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match (config.codec, config.processor) {
        (VideoCodec::H264, _) => Vec::new(),
        (VideoCodec::H265, Processor::Cpu) => owned(&["-fflags", "nobuffer+genpts"]),
        (VideoCodec::H265, Processor::Gpu) => owned(&[
            "-fflags", "genpts",
            "-hwaccel", "cuda",
            "-hwaccel_output_format", "cuda",
        ]),
    }
}

fn output_args(config: &StreamConfig) -> Vec<String> {
    let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match (config.codec, config.processor) {
        (VideoCodec::H264, _) => owned(&[
            "-c:v", "copy",
            "-an",
            "-fps_mode", "passthrough",
            "-flush_packets", "1",
            "-f", "h264",
            "pipe:1",
        ]),
        (VideoCodec::H265, Processor::Cpu) => owned(&[
            "-an",
            "-c:v", "libx264",
            "-preset", "ultrafast",
            "-tune", "zerolatency",
            "-x264-params", "nal-hrd=cbr",
            "-b:v", "6M",
            "-maxrate", "6M",
            "-bufsize", "6M",
            "-g", "30",
            "-bf", "0",
            "-fps_mode", "passthrough",
            "-map", "0:v:0",
            "-f", "h264",
            "pipe:1",
        ]),
        (VideoCodec::H265, Processor::Gpu) => owned(&[
            "-an",
            "-c:v", "h264_nvenc",
            "-preset", "p1",
            "-tune", "ll",
            "-delay", "0",
            "-rc:v", "cbr",
            "-b:v", "6M",
            "-g", "30",
            "-bf", "0",
            "-fps_mode", "passthrough",
            "-map", "0:v:0",
            "-f", "h264",
            "pipe:1",
        ]),
    }
}

/// Generate an SDP for an `rtp://host:port` source so ffmpeg can demux it.
fn generate_sdp(rtp_url: &str, codec: VideoCodec) -> Result<String> {
    let url = Url::parse(rtp_url)
        .map_err(|e| AppError::Config(format!("invalid RTP URL {}: {}", rtp_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Config("RTP URL must name a host".to_string()))?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| AppError::Config("RTP URL must name a port".to_string()))?;

    let ip_version = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "IP6",
        _ => "IP4",
    };

    let mut lines = vec![
        "v=0".to_string(),
        format!("o=- 0 0 IN {} {}", ip_version, host),
        "s=rtc-relay generated".to_string(),
        format!("c=IN {} {}", ip_version, host),
        "t=0 0".to_string(),
        format!("m=video {} RTP/AVP 96", port),
    ];
    match codec {
        VideoCodec::H264 => {
            lines.push("a=rtpmap:96 H264/90000".to_string());
            lines.push("a=fmtp:96 packetization-mode=1".to_string());
        }
        VideoCodec::H265 => {
            lines.push("a=rtpmap:96 H265/90000".to_string());
            lines.push("a=fmtp:96 profile-id=1;level-id=93;tier-flag=0".to_string());
        }
    }
    lines.push("a=recvonly".to_string());

    Ok(lines.join("\r\n") + "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{InputType, OutputMode, RtspTransport};

    fn config(codec: VideoCodec, processor: Processor, url: &str) -> StreamConfig {
        StreamConfig {
            input_url: Some(url.to_string()),
            input_type: if url.starts_with("rtp://") {
                InputType::Rtp
            } else {
                InputType::Rtsp
            },
            codec,
            output_codec: VideoCodec::H264,
            processor,
            use_native: false,
            rtp_server_addr: ":5004".to_string(),
            rtsp_transport: RtspTransport::Tcp,
            output_mode: OutputMode::Webrtc,
        }
    }

    #[test]
    fn rtsp_h264_passthrough_command() {
        let cfg = config(VideoCodec::H264, Processor::Cpu, "rtsp://cam/stream");
        let (args, sdp) = build_command(&cfg, "rtsp://cam/stream").unwrap();
        assert!(sdp.is_none());
        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-f", "h264"]));
        assert!(args.windows(2).any(|w| w == ["-i", "rtsp://cam/stream"]));
        assert!(!args.iter().any(|a| a == "libx264"));
    }

    #[test]
    fn rtsp_h265_cpu_transcode_command() {
        let cfg = config(VideoCodec::H265, Processor::Cpu, "rtsp://cam/stream");
        let (args, _) = build_command(&cfg, "rtsp://cam/stream").unwrap();
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-tune", "zerolatency"]));
        assert!(args.windows(2).any(|w| w == ["-g", "30"]));
    }

    #[test]
    fn rtsp_h265_gpu_transcode_command() {
        let cfg = config(VideoCodec::H265, Processor::Gpu, "rtsp://cam/stream");
        let (args, _) = build_command(&cfg, "rtsp://cam/stream").unwrap();
        assert!(args.windows(2).any(|w| w == ["-hwaccel", "cuda"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "h264_nvenc"]));
    }

    #[test]
    fn rtp_input_generates_sdp_and_reads_stdin() {
        let cfg = config(VideoCodec::H264, Processor::Cpu, "rtp://239.0.0.1:5004");
        let (args, sdp) = build_command(&cfg, "rtp://239.0.0.1:5004").unwrap();
        let sdp = sdp.unwrap();
        assert!(args.windows(2).any(|w| w == ["-f", "sdp"]));
        assert!(args.windows(2).any(|w| w == ["-i", "pipe:0"]));
        assert!(sdp.contains("m=video 5004 RTP/AVP 96"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000"));
        assert!(sdp.contains("c=IN IP4 239.0.0.1"));
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn rtp_h265_sdp_names_h265() {
        let sdp = generate_sdp("rtp://10.0.0.9:5004", VideoCodec::H265).unwrap();
        assert!(sdp.contains("a=rtpmap:96 H265/90000"));
        assert!(sdp.contains("profile-id=1"));
    }

    #[test]
    fn rtp_url_must_name_a_port() {
        assert!(generate_sdp("rtp://10.0.0.9", VideoCodec::H264).is_err());
    }

    #[test]
    fn ipv6_hosts_use_ip6_connection_lines() {
        let sdp = generate_sdp("rtp://[ff02::1]:5004", VideoCodec::H264).unwrap();
        assert!(sdp.contains("c=IN IP6 ff02::1"));
    }
}
