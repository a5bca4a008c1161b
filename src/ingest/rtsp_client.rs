//! RTSP pull client
//!
//! Drives the `OPTIONS -> DESCRIBE -> SETUP -> PLAY` sequence against a
//! camera, then consumes RTP either interleaved on the control connection
//! (default) or over a UDP port pair. Parameter sets advertised in the SDP
//! are pushed downstream before playback so subscribers joining ahead of
//! the first keyframe can initialize their decoders.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use rtsp_types as rtsp;

use crate::error::{AppError, Result};
use crate::hub::Hub;
use crate::ingest::sdp;
use crate::nal::AccessUnit;
use crate::rtp::Depacketizer;
use crate::stream::{self, RtspTransport, StreamConfig, VideoSink};

const RTSP_DEFAULT_PORT: u16 = 554;
const USER_AGENT: &str = "rtc-relay";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_WARN_AFTER: Duration = Duration::from_secs(30);
const RESPONSE_LIMIT: usize = 256 * 1024;

/// Interleaved channel carrying RTP (RTCP rides on channel 1, discarded)
const RTP_CHANNEL: u8 = 0;

/// Pull from the configured RTSP URL until the stream ends or fails.
pub async fn run(config: &StreamConfig, hub: Arc<Hub>) -> Result<()> {
    let input_url = config
        .input_url
        .as_deref()
        .ok_or_else(|| AppError::Config("rtsp input requires an input URL".to_string()))?;
    let url = parse_rtsp_url(input_url)?;

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Rtsp(format!("no host in URL {}", url)))?;
    let port = url.port().unwrap_or(RTSP_DEFAULT_PORT);

    info!("connecting to rtsp://{}:{}", host, port);
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true).ok();
    let (reader, writer) = tcp.into_split();

    let mut client = RtspClient {
        reader,
        writer,
        buf: Vec::with_capacity(8192),
        cseq: 0,
        session: None,
        content_base: url.clone(),
    };

    client.options().await?;
    let session = client.describe().await?;
    let media = sdp::select_video_media(&session)?;
    if media.codec != config.codec {
        return Err(AppError::Rtsp(format!(
            "source describes {} but configured codec is {}",
            media.codec, config.codec
        )));
    }
    info!(
        "selected {} media, payload type {}, frame duration {:?}",
        media.codec, media.payload_type, media.frame_duration
    );

    let (sink, bridge) =
        stream::make_sink(config, hub, media.parameter_sets.clone(), media.frame_duration)?;

    // On the pass-through path the SDP parameter sets go out as an initial
    // access unit; on the transcode path they were handed to the bridge as
    // its stdin preamble.
    if bridge.is_none() && !media.parameter_sets.is_empty() {
        sink.deliver(AccessUnit::new(
            media.parameter_sets.clone(),
            media.frame_duration,
        ))
        .await;
    }

    let setup_url = control_url(&client.content_base, media.control.as_deref());
    let depacketizer = Depacketizer::new(media.codec, media.frame_duration);

    let result = match config.rtsp_transport {
        RtspTransport::Tcp => {
            client.setup_interleaved(&setup_url).await?;
            client.play(&setup_url).await?;
            info!("playing (TCP interleaved)");
            client.consume_interleaved(depacketizer, &sink).await
        }
        RtspTransport::Udp => {
            let (rtp_sock, rtcp_sock, rtp_port) = bind_udp_pair().await?;
            client.setup_udp(&setup_url, rtp_port).await?;
            client.play(&setup_url).await?;
            info!("playing (UDP, local ports {}-{})", rtp_port, rtp_port + 1);
            client
                .consume_udp(rtp_sock, rtcp_sock, depacketizer, &sink)
                .await
        }
    };

    if let Some(bridge) = bridge {
        bridge.shutdown().await;
    }
    result
}

/// Parse and sanity-check an `rtsp://` input URL.
fn parse_rtsp_url(input: &str) -> Result<Url> {
    let url =
        Url::parse(input).map_err(|e| AppError::Rtsp(format!("invalid URL {}: {}", input, e)))?;
    if url.scheme() != "rtsp" {
        return Err(AppError::Rtsp(format!(
            "unsupported scheme '{}', expected rtsp://",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Normalize a `Content-Base` header value: strip surrounding brackets and
/// quotes, prepend the scheme when missing, and re-parse.
fn normalize_content_base(raw: &str) -> Option<Url> {
    let trimmed = raw.trim().trim_matches(|c| c == '[' || c == ']' || c == '"');
    let candidate = if trimmed.starts_with("rtsp://") {
        trimmed.to_string()
    } else {
        format!("rtsp://{}", trimmed)
    };
    Url::parse(&candidate).ok()
}

/// Resolve the SETUP URL from the content base and the media's control
/// attribute (absolute URL, relative token, `*`, or absent).
fn control_url(base: &Url, control: Option<&str>) -> Url {
    match control {
        None | Some("*") | Some("") => base.clone(),
        Some(c) if c.starts_with("rtsp://") => Url::parse(c).unwrap_or_else(|_| base.clone()),
        Some(c) => {
            let joined = format!(
                "{}/{}",
                base.as_str().trim_end_matches('/'),
                c.trim_start_matches('/')
            );
            Url::parse(&joined).unwrap_or_else(|_| base.clone())
        }
    }
}

struct RtspClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    buf: Vec<u8>,
    cseq: u32,
    session: Option<String>,
    content_base: Url,
}

impl RtspClient {
    async fn options(&mut self) -> Result<()> {
        let url = self.content_base.clone();
        self.request(rtsp::Method::Options, &url, &[]).await?;
        Ok(())
    }

    async fn describe(&mut self) -> Result<sdp_types::Session> {
        let url = self.content_base.clone();
        let response = self
            .request(
                rtsp::Method::Describe,
                &url,
                &[(rtsp::headers::ACCEPT, "application/sdp".to_string())],
            )
            .await?;

        if let Some(base) = response
            .header(&rtsp::headers::CONTENT_BASE)
            .and_then(|v| normalize_content_base(v.as_str()))
        {
            debug!("content base: {}", base);
            self.content_base = base;
        }

        sdp_types::Session::parse(response.body())
            .map_err(|e| AppError::Sdp(format!("DESCRIBE body: {}", e)))
    }

    async fn setup_interleaved(&mut self, setup_url: &Url) -> Result<()> {
        let transport = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}",
            RTP_CHANNEL,
            RTP_CHANNEL + 1
        );
        let response = self
            .request(
                rtsp::Method::Setup,
                setup_url,
                &[(rtsp::headers::TRANSPORT, transport)],
            )
            .await?;
        self.adopt_session(&response)
    }

    async fn setup_udp(&mut self, setup_url: &Url, rtp_port: u16) -> Result<()> {
        let transport = format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1);
        let response = self
            .request(
                rtsp::Method::Setup,
                setup_url,
                &[(rtsp::headers::TRANSPORT, transport)],
            )
            .await?;
        self.adopt_session(&response)
    }

    async fn play(&mut self, url: &Url) -> Result<()> {
        self.request(
            rtsp::Method::Play,
            url,
            &[(rtsp::headers::RANGE, "npt=0-".to_string())],
        )
        .await?;
        Ok(())
    }

    fn adopt_session(&mut self, response: &rtsp::Response<Vec<u8>>) -> Result<()> {
        let session = response
            .header(&rtsp::headers::SESSION)
            .map(|v| v.as_str().split(';').next().unwrap_or_default().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Rtsp("SETUP response carried no session".to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    async fn request(
        &mut self,
        method: rtsp::Method,
        url: &Url,
        extra: &[(rtsp::HeaderName, String)],
    ) -> Result<rtsp::Response<Vec<u8>>> {
        send_request(
            &mut self.writer,
            &mut self.cseq,
            method.clone(),
            url,
            self.session.as_deref(),
            extra,
        )
        .await?;

        let response = read_response(&mut self.reader, &mut self.buf).await?;
        if response.status() != rtsp::StatusCode::Ok {
            return Err(AppError::Rtsp(format!(
                "{:?} failed with status {:?}",
                method,
                response.status()
            )));
        }
        Ok(response)
    }

    /// Consume interleaved frames after PLAY. RTSP keepalives ride the same
    /// connection; their responses are parsed and discarded.
    async fn consume_interleaved(
        self,
        mut depacketizer: Depacketizer,
        sink: &VideoSink,
    ) -> Result<()> {
        let RtspClient {
            mut reader,
            mut writer,
            mut buf,
            mut cseq,
            session,
            content_base,
        } = self;

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            while let Ok((message, consumed)) = rtsp::Message::<Vec<u8>>::parse(buf.as_slice()) {
                buf.drain(..consumed);
                match message {
                    rtsp::Message::Data(data) => {
                        if data.channel_id() != RTP_CHANNEL {
                            continue;
                        }
                        let body = data.into_body();
                        handle_rtp_datagram(&body, &mut depacketizer, sink).await;
                    }
                    rtsp::Message::Response(_) => {}
                    rtsp::Message::Request(request) => {
                        debug!("ignoring server-initiated {:?}", request.method());
                    }
                }
            }

            if buf.len() > RESPONSE_LIMIT {
                return Err(AppError::Rtsp("interleaved stream desynchronized".to_string()));
            }

            tokio::select! {
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        info!("RTSP connection closed by server");
                        return Ok(());
                    }
                }
                _ = keepalive.tick() => {
                    send_request(
                        &mut writer,
                        &mut cseq,
                        rtsp::Method::Options,
                        &content_base,
                        session.as_deref(),
                        &[],
                    )
                    .await?;
                }
            }
        }
    }

    /// Consume RTP over the UDP port pair after PLAY.
    async fn consume_udp(
        self,
        rtp_sock: UdpSocket,
        rtcp_sock: UdpSocket,
        mut depacketizer: Depacketizer,
        sink: &VideoSink,
    ) -> Result<()> {
        let RtspClient {
            mut reader,
            mut writer,
            mut buf,
            mut cseq,
            session,
            content_base,
        } = self;

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;
        let mut idle_check = tokio::time::interval(Duration::from_secs(5));
        idle_check.tick().await;

        let mut rtp_buf = [0u8; 2048];
        let mut rtcp_buf = [0u8; 1500];
        let mut last_packet = Instant::now();

        loop {
            tokio::select! {
                recv = rtp_sock.recv(&mut rtp_buf) => {
                    let n = recv?;
                    last_packet = Instant::now();
                    handle_rtp_datagram(&rtp_buf[..n], &mut depacketizer, sink).await;
                }
                recv = rtcp_sock.recv(&mut rtcp_buf) => {
                    let _ = recv?;
                }
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        info!("RTSP control connection closed by server");
                        return Ok(());
                    }
                    // Keepalive responses; nothing to act on.
                    while let Ok((_, consumed)) = rtsp::Message::<Vec<u8>>::parse(buf.as_slice()) {
                        buf.drain(..consumed);
                    }
                }
                _ = keepalive.tick() => {
                    send_request(
                        &mut writer,
                        &mut cseq,
                        rtsp::Method::Options,
                        &content_base,
                        session.as_deref(),
                        &[],
                    )
                    .await?;
                }
                _ = idle_check.tick() => {
                    if last_packet.elapsed() >= IDLE_WARN_AFTER {
                        warn!(
                            "no RTP received for {:?}, sender may be gone",
                            last_packet.elapsed()
                        );
                    }
                }
            }
        }
    }
}

/// Parse one RTP datagram and deliver any completed access units.
async fn handle_rtp_datagram(datagram: &[u8], depacketizer: &mut Depacketizer, sink: &VideoSink) {
    for au in depacketizer.push_datagram(datagram) {
        sink.deliver(au).await;
    }
}

async fn send_request(
    writer: &mut OwnedWriteHalf,
    cseq: &mut u32,
    method: rtsp::Method,
    url: &Url,
    session: Option<&str>,
    extra: &[(rtsp::HeaderName, String)],
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    *cseq += 1;
    let mut builder = rtsp::Request::builder(method, rtsp::Version::V1_0)
        .request_uri(url.clone())
        .header(rtsp::headers::CSEQ, cseq.to_string())
        .header(rtsp::headers::USER_AGENT, USER_AGENT);

    if let Some(session) = session {
        builder = builder.header(rtsp::headers::SESSION, session);
    }
    for (name, value) in extra {
        builder = builder.header(name.clone(), value.as_str());
    }

    let request = builder.empty();
    let mut wire = Vec::new();
    request
        .write(&mut wire)
        .map_err(|e| AppError::Rtsp(format!("failed to serialize request: {}", e)))?;
    writer.write_all(&wire).await?;
    Ok(())
}

async fn read_response(
    reader: &mut OwnedReadHalf,
    buf: &mut Vec<u8>,
) -> Result<rtsp::Response<Vec<u8>>> {
    loop {
        match rtsp::Message::<Vec<u8>>::parse(buf.as_slice()) {
            Ok((message, consumed)) => {
                buf.drain(..consumed);
                match message {
                    rtsp::Message::Response(response) => return Ok(response),
                    // Early interleaved data or stray requests before our
                    // response: skip.
                    _ => continue,
                }
            }
            Err(_) if buf.len() > RESPONSE_LIMIT => {
                return Err(AppError::Rtsp("oversized RTSP response".to_string()));
            }
            Err(_) => {}
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(AppError::Rtsp(
                "connection closed while awaiting response".to_string(),
            ));
        }
    }
}

/// Bind an even/odd UDP port pair for RTP/RTCP reception.
async fn bind_udp_pair() -> Result<(UdpSocket, UdpSocket, u16)> {
    for _ in 0..16 {
        let rtp = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let port = rtp.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        match UdpSocket::bind(("0.0.0.0", port + 1)).await {
            Ok(rtcp) => return Ok((rtp, rtcp, port)),
            Err(_) => continue,
        }
    }
    Err(AppError::Rtsp("could not bind an RTP/RTCP port pair".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing_defaults_port() {
        let url = parse_rtsp_url("rtsp://camera.local/stream").unwrap();
        assert_eq!(url.host_str(), Some("camera.local"));
        assert_eq!(url.port().unwrap_or(RTSP_DEFAULT_PORT), 554);

        let url = parse_rtsp_url("rtsp://user:pw@10.0.0.5:8554/live").unwrap();
        assert_eq!(url.port(), Some(8554));

        assert!(parse_rtsp_url("http://not-rtsp/").is_err());
        assert!(parse_rtsp_url("garbage").is_err());
    }

    #[test]
    fn content_base_normalization() {
        // Already well-formed.
        assert_eq!(
            normalize_content_base("rtsp://10.0.0.1/live/").unwrap().as_str(),
            "rtsp://10.0.0.1/live/"
        );
        // Brackets and quotes stripped.
        assert_eq!(
            normalize_content_base("[rtsp://10.0.0.1/live/]").unwrap().as_str(),
            "rtsp://10.0.0.1/live/"
        );
        assert_eq!(
            normalize_content_base("\"rtsp://10.0.0.1/live/\"").unwrap().as_str(),
            "rtsp://10.0.0.1/live/"
        );
        // Missing scheme gets one.
        assert_eq!(
            normalize_content_base("10.0.0.1/live/").unwrap().as_str(),
            "rtsp://10.0.0.1/live/"
        );
    }

    #[test]
    fn control_url_resolution() {
        let base = Url::parse("rtsp://10.0.0.1/live/").unwrap();

        assert_eq!(control_url(&base, None), base);
        assert_eq!(control_url(&base, Some("*")), base);
        assert_eq!(
            control_url(&base, Some("trackID=0")).as_str(),
            "rtsp://10.0.0.1/live/trackID=0"
        );
        // Base without trailing slash still joins with exactly one.
        let bare = Url::parse("rtsp://10.0.0.1/live").unwrap();
        assert_eq!(
            control_url(&bare, Some("/trackID=1")).as_str(),
            "rtsp://10.0.0.1/live/trackID=1"
        );
        // Absolute control URL wins.
        assert_eq!(
            control_url(&base, Some("rtsp://10.0.0.2/other")).as_str(),
            "rtsp://10.0.0.2/other"
        );
    }
}
