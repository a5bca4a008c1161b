//! Publish-only RTSP server
//!
//! Accepts one publisher at a time on `rtsp://0.0.0.0:554/stream` via
//! `ANNOUNCE -> SETUP -> RECORD`, with RTP either interleaved on the
//! control connection or on the fixed UDP port pair 8000/8001. Reader
//! sessions (SETUP without a prior ANNOUNCE) are rejected; RTCP sender
//! reports are drained, not relayed.
//!
//! When the announced codec is H.265 and the output codec is H.264, a
//! transcoding bridge is started at ANNOUNCE time and terminated when the
//! publisher session ends.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use rtsp_types as rtsp;

use crate::error::{AppError, Result};
use crate::hub::Hub;
use crate::ingest::sdp::{self, VideoMedia};
use crate::nal::AccessUnit;
use crate::rtp::Depacketizer;
use crate::stream::{self, StreamConfig, VideoSink};
use crate::transcode::TranscodeBridge;

const RTSP_BIND: &str = "0.0.0.0:554";
const UDP_RTP_BIND: &str = "0.0.0.0:8000";
const UDP_RTCP_BIND: &str = "0.0.0.0:8001";
const SERVER_PORTS: &str = "8000-8001";
const STREAM_PATH: &str = "stream";
const REQUEST_LIMIT: usize = 256 * 1024;

/// Depth of the channel routing UDP datagrams to the publisher session
const UDP_ROUTE_QUEUE: usize = 256;

struct UdpRoute {
    conn_id: u64,
    source_ip: IpAddr,
    tx: mpsc::Sender<Bytes>,
}

struct ServerShared {
    /// Connection id of the current publisher; 0 when the slot is free
    active_conn: AtomicU64,
    next_conn: AtomicU64,
    udp_route: Mutex<Option<UdpRoute>>,
}

/// Run the push server until the process ends. Publisher failures end the
/// session, not the server.
pub async fn run(config: &StreamConfig, hub: Arc<Hub>) -> Result<()> {
    let listener = TcpListener::bind(RTSP_BIND).await?;
    let rtp_sock = Arc::new(UdpSocket::bind(UDP_RTP_BIND).await?);
    let rtcp_sock = UdpSocket::bind(UDP_RTCP_BIND).await?;

    info!(
        "RTSP server listening on {} (publish to rtsp://<host>:554/{}, UDP ports {})",
        RTSP_BIND, STREAM_PATH, SERVER_PORTS
    );

    let shared = Arc::new(ServerShared {
        active_conn: AtomicU64::new(0),
        next_conn: AtomicU64::new(1),
        udp_route: Mutex::new(None),
    });

    tokio::spawn(drain_rtcp(rtcp_sock));
    tokio::spawn(route_udp_rtp(rtp_sock, shared.clone()));

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        info!("RTSP connection from {}", peer);

        let config = config.clone();
        let hub = hub.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, config, hub, shared).await {
                warn!("RTSP session {} ended with error: {}", peer, e);
            } else {
                info!("RTSP session {} closed", peer);
            }
        });
    }
}

/// Sender reports are consumed so the socket never backs up; nothing is
/// relayed downstream.
async fn drain_rtcp(sock: UdpSocket) {
    let mut buf = [0u8; 1500];
    loop {
        if sock.recv_from(&mut buf).await.is_err() {
            break;
        }
    }
}

/// Forward datagrams from the shared RTP socket to whichever session
/// currently publishes over UDP, filtered by sender address.
async fn route_udp_rtp(sock: Arc<UdpSocket>, shared: Arc<ServerShared>) {
    let mut buf = [0u8; 2048];
    loop {
        let Ok((n, from)) = sock.recv_from(&mut buf).await else {
            break;
        };

        let route = shared.udp_route.lock().await;
        let Some(route) = route.as_ref() else {
            continue;
        };
        if route.source_ip != from.ip() {
            debug!("ignoring RTP from unexpected sender {}", from);
            continue;
        }
        if route.tx.try_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
            debug!("publisher RTP queue full, dropping datagram");
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct PublisherSession {
    conn_id: u64,
    session_id: String,
    peer: SocketAddr,
    media: Option<VideoMedia>,
    sink: Option<VideoSink>,
    bridge: Option<Arc<TranscodeBridge>>,
    depacketizer: Option<Depacketizer>,
    /// RTP channel when the publisher chose TCP interleaving
    interleaved: Option<u8>,
    setup_done: bool,
    recording: bool,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: StreamConfig,
    hub: Arc<Hub>,
    shared: Arc<ServerShared>,
) -> Result<()> {
    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (reader, writer) = stream.into_split();

    let mut session = PublisherSession {
        conn_id,
        session_id: generate_session_id(),
        peer,
        media: None,
        sink: None,
        bridge: None,
        depacketizer: None,
        interleaved: None,
        setup_done: false,
        recording: false,
    };

    let result = connection_loop(reader, writer, &mut session, &config, &hub, &shared).await;

    // Session close: terminate the transcoder and free the slot.
    if let Some(bridge) = session.bridge.take() {
        bridge.shutdown().await;
    }
    let _ = shared
        .active_conn
        .compare_exchange(conn_id, 0, Ordering::AcqRel, Ordering::Relaxed);
    {
        let mut route = shared.udp_route.lock().await;
        if route.as_ref().is_some_and(|r| r.conn_id == conn_id) {
            *route = None;
        }
    }

    result
}

async fn connection_loop(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    session: &mut PublisherSession,
    config: &StreamConfig,
    hub: &Arc<Hub>,
    shared: &Arc<ServerShared>,
) -> Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut udp_rx: Option<mpsc::Receiver<Bytes>> = None;

    loop {
        while let Ok((message, consumed)) = rtsp::Message::<Vec<u8>>::parse(buf.as_slice()) {
            buf.drain(..consumed);
            match message {
                rtsp::Message::Request(request) => {
                    match handle_request(&mut writer, session, config, hub, shared, &request)
                        .await?
                    {
                        Flow::Stop => return Ok(()),
                        Flow::Continue => {}
                    }

                    // RECORD over UDP installs the datagram route.
                    if session.recording && session.interleaved.is_none() && udp_rx.is_none() {
                        let (tx, rx) = mpsc::channel(UDP_ROUTE_QUEUE);
                        *shared.udp_route.lock().await = Some(UdpRoute {
                            conn_id: session.conn_id,
                            source_ip: session.peer.ip(),
                            tx,
                        });
                        udp_rx = Some(rx);
                    }
                }
                rtsp::Message::Data(data) => {
                    if !session.recording {
                        continue;
                    }
                    if session.interleaved != Some(data.channel_id()) {
                        // RTCP channel or stray data.
                        continue;
                    }
                    let body = data.into_body();
                    feed_rtp(session, &body).await;
                }
                rtsp::Message::Response(_) => {}
            }
        }

        if buf.len() > REQUEST_LIMIT {
            return Err(AppError::Rtsp("request stream desynchronized".to_string()));
        }

        // A newer publisher replaced this one.
        if session.recording && shared.active_conn.load(Ordering::Acquire) != session.conn_id {
            info!("publisher {} replaced by a new ANNOUNCE", session.peer);
            return Ok(());
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
            }
            datagram = async { udp_rx.as_mut().unwrap().recv().await }, if udp_rx.is_some() => {
                match datagram {
                    Some(datagram) => feed_rtp(session, &datagram).await,
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn feed_rtp(session: &mut PublisherSession, datagram: &[u8]) {
    let (Some(depacketizer), Some(sink)) = (&mut session.depacketizer, &session.sink) else {
        return;
    };
    for au in depacketizer.push_datagram(datagram) {
        sink.deliver(au).await;
    }
}

async fn handle_request(
    writer: &mut OwnedWriteHalf,
    session: &mut PublisherSession,
    config: &StreamConfig,
    hub: &Arc<Hub>,
    shared: &Arc<ServerShared>,
    request: &rtsp::Request<Vec<u8>>,
) -> Result<Flow> {
    let cseq = request
        .header(&rtsp::headers::CSEQ)
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|| "1".to_string());

    match request.method() {
        rtsp::Method::Options => {
            send_response(
                writer,
                &cseq,
                rtsp::StatusCode::Ok,
                vec![(
                    rtsp::headers::PUBLIC,
                    "OPTIONS, ANNOUNCE, SETUP, RECORD, TEARDOWN".to_string(),
                )],
                &session.session_id,
            )
            .await?;
            Ok(Flow::Continue)
        }
        rtsp::Method::Announce => {
            let uri = request
                .request_uri()
                .map(|u| u.as_str().to_string())
                .unwrap_or_default();
            if !is_stream_path(&uri) {
                send_response(writer, &cseq, rtsp::StatusCode::NotFound, vec![], &session.session_id)
                    .await?;
                return Ok(Flow::Continue);
            }

            let announced = match parse_announce(request.body(), config) {
                Ok(media) => media,
                Err(e) => {
                    warn!("rejecting ANNOUNCE from {}: {}", session.peer, e);
                    send_response(
                        writer,
                        &cseq,
                        rtsp::StatusCode::BadRequest,
                        vec![],
                        &session.session_id,
                    )
                    .await?;
                    return Ok(Flow::Continue);
                }
            };

            info!(
                "publisher {} announced {} media (payload type {})",
                session.peer, announced.codec, announced.payload_type
            );

            // Claim the publisher slot; an existing publisher notices and
            // winds down.
            let previous = shared.active_conn.swap(session.conn_id, Ordering::AcqRel);
            if previous != 0 && previous != session.conn_id {
                info!("replacing active publisher (conn {})", previous);
            }

            let (sink, bridge) = stream::make_sink(
                config,
                hub.clone(),
                announced.parameter_sets.clone(),
                announced.frame_duration,
            )?;
            if bridge.is_none() && !announced.parameter_sets.is_empty() {
                sink.deliver(AccessUnit::new(
                    announced.parameter_sets.clone(),
                    announced.frame_duration,
                ))
                .await;
            }

            session.depacketizer = Some(Depacketizer::new(
                announced.codec,
                announced.frame_duration,
            ));
            session.sink = Some(sink);
            session.bridge = bridge;
            session.media = Some(announced);

            send_response(writer, &cseq, rtsp::StatusCode::Ok, vec![], &session.session_id).await?;
            Ok(Flow::Continue)
        }
        rtsp::Method::Setup => {
            // Publish-only: a SETUP without a prior ANNOUNCE is a reader.
            if session.media.is_none() {
                send_response(
                    writer,
                    &cseq,
                    rtsp::StatusCode::NotImplemented,
                    vec![],
                    &session.session_id,
                )
                .await?;
                return Ok(Flow::Continue);
            }

            let transport = request
                .header(&rtsp::headers::TRANSPORT)
                .map(|v| v.as_str().to_string())
                .unwrap_or_default();

            let transport_reply = if transport.to_ascii_lowercase().contains("interleaved") {
                let channel = parse_interleaved_channel(&transport).unwrap_or(0);
                session.interleaved = Some(channel);
                format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{}",
                    channel,
                    channel.saturating_add(1)
                )
            } else {
                session.interleaved = None;
                match parse_client_port(&transport) {
                    Some(port) => format!(
                        "RTP/AVP;unicast;client_port={}-{};server_port={}",
                        port,
                        port.saturating_add(1),
                        SERVER_PORTS
                    ),
                    None => format!("RTP/AVP;unicast;server_port={}", SERVER_PORTS),
                }
            };
            session.setup_done = true;

            send_response(
                writer,
                &cseq,
                rtsp::StatusCode::Ok,
                vec![(rtsp::headers::TRANSPORT, transport_reply)],
                &session.session_id,
            )
            .await?;
            Ok(Flow::Continue)
        }
        rtsp::Method::Record => {
            if !session.setup_done {
                send_response(
                    writer,
                    &cseq,
                    rtsp::StatusCode::MethodNotValidInThisState,
                    vec![],
                    &session.session_id,
                )
                .await?;
                return Ok(Flow::Continue);
            }

            session.recording = true;
            info!(
                "publisher {} recording ({})",
                session.peer,
                if session.interleaved.is_some() { "interleaved" } else { "UDP" }
            );
            send_response(writer, &cseq, rtsp::StatusCode::Ok, vec![], &session.session_id).await?;
            Ok(Flow::Continue)
        }
        rtsp::Method::Teardown => {
            send_response(writer, &cseq, rtsp::StatusCode::Ok, vec![], &session.session_id).await?;
            Ok(Flow::Stop)
        }
        rtsp::Method::GetParameter | rtsp::Method::SetParameter => {
            send_response(writer, &cseq, rtsp::StatusCode::Ok, vec![], &session.session_id).await?;
            Ok(Flow::Continue)
        }
        _ => {
            send_response(
                writer,
                &cseq,
                rtsp::StatusCode::MethodNotAllowed,
                vec![],
                &session.session_id,
            )
            .await?;
            Ok(Flow::Continue)
        }
    }
}

/// Parse an ANNOUNCE body and check the codec against the configuration.
fn parse_announce(body: &[u8], config: &StreamConfig) -> Result<VideoMedia> {
    let sdp_session = sdp_types::Session::parse(body)
        .map_err(|e| AppError::Sdp(format!("ANNOUNCE body: {}", e)))?;
    let media = sdp::select_video_media(&sdp_session)?;

    if media.codec != config.codec {
        return Err(AppError::Rtsp(format!(
            "announced {} media but configured codec is {}",
            media.codec, config.codec
        )));
    }

    Ok(media)
}

async fn send_response<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    cseq: &str,
    status: rtsp::StatusCode,
    extra_headers: Vec<(rtsp::HeaderName, String)>,
    session_id: &str,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut builder = rtsp::Response::builder(rtsp::Version::V1_0, status)
        .header(rtsp::headers::CSEQ, cseq);
    if !session_id.is_empty() {
        builder = builder.header(rtsp::headers::SESSION, session_id);
    }
    for (name, value) in extra_headers {
        builder = builder.header(name, value);
    }

    let response = builder.build(Vec::new());
    let mut wire = Vec::new();
    response
        .write(&mut wire)
        .map_err(|e| AppError::Rtsp(format!("failed to serialize response: {}", e)))?;
    writer.write_all(&wire).await?;
    Ok(())
}

fn is_stream_path(uri: &str) -> bool {
    extract_path(uri) == STREAM_PATH
}

fn extract_path(uri: &str) -> String {
    let raw_path = if let Some((_, remainder)) = uri.split_once("://") {
        match remainder.find('/') {
            Some(idx) => &remainder[idx..],
            None => "/",
        }
    } else {
        uri
    };

    raw_path
        .split('?')
        .next()
        .unwrap_or(raw_path)
        .trim_matches('/')
        .to_string()
}

fn parse_interleaved_channel(transport: &str) -> Option<u8> {
    let lower = transport.to_ascii_lowercase();
    let (_, v) = lower.split_once("interleaved=")?;
    let head = v.split(';').next().unwrap_or(v);
    let first = head.split('-').next().unwrap_or(head).trim();
    first.parse::<u8>().ok()
}

fn parse_client_port(transport: &str) -> Option<u16> {
    let lower = transport.to_ascii_lowercase();
    let (_, v) = lower.split_once("client_port=")?;
    let head = v.split(';').next().unwrap_or(v);
    let first = head.split('-').next().unwrap_or(head).trim();
    first.parse::<u16>().ok()
}

fn generate_session_id() -> String {
    let value: u64 = rand::rng().random();
    format!("{:016x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::VideoCodec;
    use crate::stream::{InputType, OutputMode, RtspTransport};
    use crate::transcode::Processor;

    fn config(codec: VideoCodec) -> StreamConfig {
        StreamConfig {
            input_url: None,
            input_type: InputType::Server,
            codec,
            output_codec: codec,
            processor: Processor::Cpu,
            use_native: true,
            rtp_server_addr: ":5004".to_string(),
            rtsp_transport: RtspTransport::Tcp,
            output_mode: OutputMode::Webrtc,
        }
    }

    const H264_ANNOUNCE: &str = "v=0\r
o=- 0 0 IN IP4 127.0.0.1\r
s=publish\r
c=IN IP4 127.0.0.1\r
t=0 0\r
m=video 0 RTP/AVP 96\r
a=rtpmap:96 H264/90000\r
a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0LgH9oBQBbpUA==,aM4xUg==\r
";

    #[test]
    fn announce_accepts_matching_codec() {
        let media = parse_announce(H264_ANNOUNCE.as_bytes(), &config(VideoCodec::H264)).unwrap();
        assert_eq!(media.codec, VideoCodec::H264);
        assert_eq!(media.parameter_sets.len(), 2);
    }

    #[test]
    fn announce_rejects_codec_mismatch() {
        assert!(parse_announce(H264_ANNOUNCE.as_bytes(), &config(VideoCodec::H265)).is_err());
    }

    #[test]
    fn announce_rejects_garbage() {
        assert!(parse_announce(b"not an sdp", &config(VideoCodec::H264)).is_err());
    }

    #[test]
    fn stream_path_matching() {
        assert!(is_stream_path("rtsp://10.0.0.1:554/stream"));
        assert!(is_stream_path("rtsp://10.0.0.1/stream/"));
        assert!(!is_stream_path("rtsp://10.0.0.1/other"));
        assert!(!is_stream_path("rtsp://10.0.0.1/"));
    }

    #[test]
    fn transport_header_parsing() {
        assert_eq!(
            parse_interleaved_channel("RTP/AVP/TCP;unicast;interleaved=2-3"),
            Some(2)
        );
        assert_eq!(parse_interleaved_channel("RTP/AVP;unicast"), None);
        assert_eq!(
            parse_client_port("RTP/AVP;unicast;client_port=49170-49171"),
            Some(49170)
        );
        assert_eq!(parse_client_port("RTP/AVP/TCP;interleaved=0-1"), None);
    }

    #[tokio::test]
    async fn response_serialization_over_duplex() {
        let (client, mut server) = tokio::io::duplex(4096);

        send_response(
            &mut server,
            "7",
            rtsp::StatusCode::Ok,
            vec![(rtsp::headers::PUBLIC, "OPTIONS, ANNOUNCE".to_string())],
            "abc123",
        )
        .await
        .unwrap();
        drop(server);

        let mut client = client;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf)
            .await
            .unwrap();

        let (message, consumed) = rtsp::Message::<Vec<u8>>::parse(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        let rtsp::Message::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(response.status(), rtsp::StatusCode::Ok);
        assert_eq!(
            response.header(&rtsp::headers::CSEQ).map(|v| v.as_str()),
            Some("7")
        );
        assert_eq!(
            response.header(&rtsp::headers::SESSION).map(|v| v.as_str()),
            Some("abc123")
        );
    }
}
