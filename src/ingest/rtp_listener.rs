//! UDP RTP listener
//!
//! Binds a UDP socket and feeds validated RTP into the depacketizer. Two
//! configuration modes: with an SDP (file path or inline document) the
//! codec and payload type are explicit; without one, the first valid
//! packet fixes the payload type, the sender address, and the codec
//! (inferred from the payload header). A 5 s receive deadline keeps idle
//! logging alive; 30 s without a packet flags a likely dead sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AppError, Result};
use crate::hub::Hub;
use crate::ingest::sdp;
use crate::nal::{VideoCodec, DEFAULT_FRAME_DURATION};
use crate::rtp::{is_valid_rtp, payload_type, Depacketizer};
use crate::stream::{self, InputType, StreamConfig, VideoSink};

const RECV_DEADLINE: Duration = Duration::from_secs(5);
const DEAD_SENDER_AFTER: Duration = Duration::from_secs(30);

/// Stream parameters either parsed from SDP or fixed by the first packet
#[derive(Debug, Clone)]
struct StreamParams {
    codec: VideoCodec,
    payload_type: u8,
    duration: Duration,
}

/// Listen for RTP until the socket fails or a fatal mismatch occurs.
pub async fn run(config: &StreamConfig, hub: Arc<Hub>) -> Result<()> {
    let (bind_addr, known) = resolve_listen_config(config).await?;

    let sock = UdpSocket::bind(bind_addr).await?;
    let local = sock.local_addr()?;
    match &known {
        Some(params) => info!(
            "RTP listener on {} ({}, payload type {})",
            local, params.codec, params.payload_type
        ),
        None => info!("RTP listener on {}, waiting for first packet to infer codec", local),
    }

    let mut buf = [0u8; 2048];
    let mut running: Option<RunningStream> = None;
    let mut last_packet = Instant::now();

    loop {
        let (n, from) = match timeout(RECV_DEADLINE, sock.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                let idle = last_packet.elapsed();
                if running.is_some() && idle >= DEAD_SENDER_AFTER {
                    warn!("no RTP for {:?}, sender likely gone", idle);
                } else {
                    debug!("receive deadline elapsed, still waiting for RTP");
                }
                continue;
            }
        };

        let datagram = &buf[..n];
        if !is_valid_rtp(datagram) {
            debug!("dropping non-RTP datagram from {} ({} bytes)", from, n);
            continue;
        }

        if running.is_none() {
            let params = match &known {
                Some(params) => params.clone(),
                None => infer_stream_params(datagram)?,
            };
            if params.codec != config.codec {
                return Err(AppError::Rtp(format!(
                    "first packet (payload type {}) carries {} but configured codec is {}",
                    params.payload_type, params.codec, config.codec
                )));
            }
            let first_pt = payload_type(datagram);
            if first_pt != params.payload_type {
                return Err(AppError::Rtp(format!(
                    "first packet payload type {} does not match configured type {}",
                    first_pt, params.payload_type
                )));
            }

            info!(
                "RTP stream fixed: {} payload type {} from {}",
                params.codec, params.payload_type, from
            );

            let (sink, bridge) = stream::make_sink(config, hub.clone(), vec![], params.duration)?;
            running = Some(RunningStream {
                depacketizer: Depacketizer::new(params.codec, params.duration),
                sink,
                _bridge: bridge,
                payload_type: params.payload_type,
                remote: from,
            });
        }
        let stream = running.as_mut().expect("stream initialized above");

        if from != stream.remote {
            debug!("dropping RTP from unexpected sender {}", from);
            continue;
        }
        let pt = payload_type(datagram);
        if pt != stream.payload_type {
            debug!(
                "dropping RTP with unexpected payload type {} (expected {})",
                pt, stream.payload_type
            );
            continue;
        }

        last_packet = Instant::now();
        for au in stream.depacketizer.push_datagram(datagram) {
            stream.sink.deliver(au).await;
        }
    }
}

struct RunningStream {
    depacketizer: Depacketizer,
    sink: VideoSink,
    /// Kept alive for the stream lifetime; killed on drop-driven teardown
    _bridge: Option<Arc<crate::transcode::TranscodeBridge>>,
    payload_type: u8,
    remote: SocketAddr,
}

/// Work out where to bind and whether the stream is pre-configured.
async fn resolve_listen_config(
    config: &StreamConfig,
) -> Result<(SocketAddr, Option<StreamParams>)> {
    if config.input_type == InputType::RtpServer {
        let addr = normalize_listen_addr(&config.rtp_server_addr)?;
        return Ok((addr, None));
    }

    let input = config
        .input_url
        .as_deref()
        .ok_or_else(|| AppError::Config("rtp input requires an input URL".to_string()))?;

    // SDP document: either a file path or pasted inline.
    if input.ends_with(".sdp") || input.trim_start().starts_with("v=0") {
        let content = if input.trim_start().starts_with("v=0") {
            input.to_string()
        } else {
            tokio::fs::read_to_string(input)
                .await
                .map_err(|e| AppError::Config(format!("cannot read SDP file {}: {}", input, e)))?
        };

        let session = sdp_types::Session::parse(normalize_sdp_line_endings(&content).as_bytes())
            .map_err(|e| AppError::Sdp(format!("{}", e)))?;
        let media = sdp::select_video_media(&session)?;
        let port = session
            .medias
            .iter()
            .find(|m| m.media == "video")
            .map(|m| m.port)
            .filter(|p| *p != 0)
            .ok_or_else(|| AppError::Sdp("SDP names no video port".to_string()))?;

        let addr: SocketAddr = format!("0.0.0.0:{}", port)
            .parse()
            .map_err(|e| AppError::Config(format!("invalid SDP port {}: {}", port, e)))?;
        return Ok((
            addr,
            Some(StreamParams {
                codec: media.codec,
                payload_type: media.payload_type,
                duration: media.frame_duration,
            }),
        ));
    }

    // rtp://host:port — bind the named port, codec from configuration.
    let url = Url::parse(input)
        .map_err(|e| AppError::Config(format!("invalid RTP URL {}: {}", input, e)))?;
    if url.scheme() != "rtp" {
        return Err(AppError::Config(format!(
            "unsupported scheme '{}', expected rtp://",
            url.scheme()
        )));
    }
    let port = url
        .port()
        .ok_or_else(|| AppError::Config("RTP URL must name a port".to_string()))?;
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .map_err(|e| AppError::Config(format!("invalid port: {}", e)))?;

    Ok((
        addr,
        Some(StreamParams {
            codec: config.codec,
            payload_type: config.codec.payload_type(),
            duration: DEFAULT_FRAME_DURATION,
        }),
    ))
}

/// Accept both `host:port` and the bare `:port` shorthand.
fn normalize_listen_addr(addr: &str) -> Result<SocketAddr> {
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    candidate
        .parse()
        .map_err(|e| AppError::Config(format!("invalid listen address '{}': {}", addr, e)))
}

fn normalize_sdp_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Fix codec, payload type and frame duration from the first valid packet.
///
/// Payload types 96/97 are inspected: an H.264 NAL type in 1..=23 wins,
/// otherwise a plausible 2-byte H.265 header (type <= 47) selects H.265.
/// 98/99 are assumed H.265; anything else H.264.
fn infer_stream_params(datagram: &[u8]) -> Result<StreamParams> {
    let pt = payload_type(datagram);
    let payload = rtp_payload(datagram)
        .ok_or_else(|| AppError::Rtp("first packet has no payload".to_string()))?;

    let codec = match pt {
        96 | 97 => {
            let h264_type = payload[0] & 0x1f;
            if (1..=23).contains(&h264_type) {
                VideoCodec::H264
            } else if payload.len() >= 2 && (payload[0] >> 1) & 0x3f <= 47 {
                VideoCodec::H265
            } else {
                VideoCodec::H264
            }
        }
        98 | 99 => VideoCodec::H265,
        _ => VideoCodec::H264,
    };

    Ok(StreamParams {
        codec,
        payload_type: pt,
        duration: DEFAULT_FRAME_DURATION,
    })
}

/// Payload of a raw RTP datagram, skipping CSRCs, the extension header and
/// padding. Returns `None` when truncated or empty.
fn rtp_payload(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < crate::rtp::RTP_HEADER_LEN {
        return None;
    }

    let csrc_count = (datagram[0] & 0x0f) as usize;
    let has_extension = datagram[0] & 0x10 != 0;
    let has_padding = datagram[0] & 0x20 != 0;

    let mut offset = crate::rtp::RTP_HEADER_LEN + csrc_count * 4;
    if has_extension {
        if datagram.len() < offset + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([datagram[offset + 2], datagram[offset + 3]]) as usize;
        offset += 4 + ext_words * 4;
    }

    let mut end = datagram.len();
    if has_padding && end > offset {
        let padding = datagram[end - 1] as usize;
        end = end.checked_sub(padding)?;
    }

    if offset >= end {
        return None;
    }
    Some(&datagram[offset..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(pt: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x80, pt, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1];
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn listen_addr_normalization() {
        assert_eq!(
            normalize_listen_addr(":5004").unwrap(),
            "0.0.0.0:5004".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            normalize_listen_addr("127.0.0.1:6000").unwrap(),
            "127.0.0.1:6000".parse::<SocketAddr>().unwrap()
        );
        assert!(normalize_listen_addr("nonsense").is_err());
    }

    #[test]
    fn infers_h264_from_slice_nal() {
        // Payload type 96, single NAL type 5 (IDR).
        let pkt = rtp_packet(96, &[0x65, 0x88]);
        let params = infer_stream_params(&pkt).unwrap();
        assert_eq!(params.codec, VideoCodec::H264);
        assert_eq!(params.payload_type, 96);
    }

    #[test]
    fn infers_h265_from_payload_header() {
        // Payload type 96 but the header byte is no valid H.264 type
        // (0x40 -> type 0) while reading as H.265 gives VPS (32).
        let pkt = rtp_packet(96, &[0x40, 0x01, 0x0c]);
        let params = infer_stream_params(&pkt).unwrap();
        assert_eq!(params.codec, VideoCodec::H265);
    }

    #[test]
    fn infers_h265_from_payload_type_98() {
        let pkt = rtp_packet(98, &[0x26, 0x01, 0xaa]);
        let params = infer_stream_params(&pkt).unwrap();
        assert_eq!(params.codec, VideoCodec::H265);
    }

    #[test]
    fn infers_h264_for_static_payload_types() {
        let pkt = rtp_packet(33, &[0x65, 0x88]);
        assert_eq!(infer_stream_params(&pkt).unwrap().codec, VideoCodec::H264);
    }

    #[test]
    fn payload_extraction_skips_csrc_and_extension() {
        // CSRC count 1, extension present.
        let mut pkt = vec![0x90 | 0x01, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        pkt.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // CSRC
        pkt.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01, 1, 2, 3, 4]); // ext, 1 word
        pkt.extend_from_slice(&[0x65, 0x77]);
        assert_eq!(rtp_payload(&pkt), Some(&[0x65, 0x77][..]));
    }

    #[test]
    fn payload_extraction_strips_padding() {
        let mut pkt = vec![0xa0, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        pkt.extend_from_slice(&[0x65, 0x77, 0x00, 0x00, 0x03]); // 3 bytes padding
        assert_eq!(rtp_payload(&pkt), Some(&[0x65, 0x77][..]));
    }

    #[tokio::test]
    async fn sdp_configured_listener() {
        use crate::stream::{OutputMode, RtspTransport};
        use crate::transcode::Processor;

        let sdp = "v=0
o=- 0 0 IN IP4 127.0.0.1
s=rtp
c=IN IP4 127.0.0.1
t=0 0
m=video 5006 RTP/AVP 96
a=rtpmap:96 H264/90000
a=fmtp:96 packetization-mode=1;framerate=50
";
        let config = StreamConfig {
            input_url: Some(sdp.to_string()),
            input_type: InputType::Rtp,
            codec: VideoCodec::H264,
            output_codec: VideoCodec::H264,
            processor: Processor::Cpu,
            use_native: true,
            rtp_server_addr: ":5004".to_string(),
            rtsp_transport: RtspTransport::Tcp,
            output_mode: OutputMode::Webrtc,
        };

        let (addr, params) = resolve_listen_config(&config).await.unwrap();
        assert_eq!(addr.port(), 5006);
        let params = params.unwrap();
        assert_eq!(params.codec, VideoCodec::H264);
        assert_eq!(params.payload_type, 96);
        assert_eq!(params.duration, Duration::from_secs_f64(1.0 / 50.0));
    }

    #[tokio::test]
    async fn url_configured_listener() {
        use crate::stream::{OutputMode, RtspTransport};
        use crate::transcode::Processor;

        let config = StreamConfig {
            input_url: Some("rtp://0.0.0.0:5008".to_string()),
            input_type: InputType::Rtp,
            codec: VideoCodec::H265,
            output_codec: VideoCodec::H264,
            processor: Processor::Cpu,
            use_native: true,
            rtp_server_addr: ":5004".to_string(),
            rtsp_transport: RtspTransport::Tcp,
            output_mode: OutputMode::Webrtc,
        };

        let (addr, params) = resolve_listen_config(&config).await.unwrap();
        assert_eq!(addr.port(), 5008);
        assert_eq!(params.unwrap().codec, VideoCodec::H265);
    }
}
