//! SDP inspection shared by the RTSP client, RTSP server and RTP listener

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use sdp_types::{Media, Session};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::nal::{VideoCodec, DEFAULT_FRAME_DURATION};

/// The video media a session describes, reduced to what the pipeline needs
#[derive(Debug, Clone)]
pub struct VideoMedia {
    pub codec: VideoCodec,
    pub payload_type: u8,
    /// `a=control` attribute, used to build the SETUP URL
    pub control: Option<String>,
    /// VPS/SPS/PPS advertised via sprop attributes, decode order
    pub parameter_sets: Vec<Bytes>,
    /// Frame duration from `framerate`, or the 1/30 s default
    pub frame_duration: Duration,
}

/// Select the first H.264 or H.265 video media of a session.
pub fn select_video_media(session: &Session) -> Result<VideoMedia> {
    for media in &session.medias {
        if media.media != "video" {
            continue;
        }
        let Some((payload_type, codec)) = video_rtpmap(media) else {
            continue;
        };

        let fmtp = fmtp_params(media, payload_type);
        let control = attribute_value(media, "control").map(str::to_string);
        let parameter_sets = sprop_parameter_sets(&fmtp, codec);
        let frame_duration = frame_duration(media, &fmtp);

        return Ok(VideoMedia {
            codec,
            payload_type,
            control,
            parameter_sets,
            frame_duration,
        });
    }

    Err(AppError::NoCompatibleMedia)
}

/// First rtpmap of a media that names H264 or H265: `(payload_type, codec)`
fn video_rtpmap(media: &Media) -> Option<(u8, VideoCodec)> {
    for attr in &media.attributes {
        if attr.attribute != "rtpmap" {
            continue;
        }
        let value = attr.value.as_deref()?;
        let (pt, encoding) = value.split_once(' ')?;
        let name = encoding.split('/').next()?;
        let codec = if name.eq_ignore_ascii_case("H264") {
            VideoCodec::H264
        } else if name.eq_ignore_ascii_case("H265") {
            VideoCodec::H265
        } else {
            continue;
        };
        if let Ok(pt) = pt.trim().parse::<u8>() {
            return Some((pt, codec));
        }
    }
    None
}

/// Parse the fmtp attribute of `payload_type` into key/value pairs.
pub fn fmtp_params(media: &Media, payload_type: u8) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for attr in &media.attributes {
        if attr.attribute != "fmtp" {
            continue;
        }
        let Some(value) = attr.value.as_deref() else {
            continue;
        };
        let Some((pt, rest)) = value.split_once(' ') else {
            continue;
        };
        if pt.trim().parse::<u8>() != Ok(payload_type) {
            continue;
        }

        for pair in rest.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((k, v)) => params.insert(k.trim().to_string(), v.trim().to_string()),
                None => params.insert(pair.to_string(), String::new()),
            };
        }
    }

    params
}

fn attribute_value<'a>(media: &'a Media, name: &str) -> Option<&'a str> {
    media
        .attributes
        .iter()
        .find(|a| a.attribute == name)
        .and_then(|a| a.value.as_deref())
}

/// Decode the sprop parameter-set attributes into raw NALs, decode order.
fn sprop_parameter_sets(fmtp: &HashMap<String, String>, codec: VideoCodec) -> Vec<Bytes> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut nals = Vec::new();

    match codec {
        VideoCodec::H264 => {
            if let Some(sets) = fmtp.get("sprop-parameter-sets") {
                for part in sets.split(',') {
                    match b64.decode(part.trim()) {
                        Ok(nal) if !nal.is_empty() => nals.push(Bytes::from(nal)),
                        Ok(_) => {}
                        Err(e) => debug!("ignoring undecodable sprop-parameter-sets entry: {}", e),
                    }
                }
            }
        }
        VideoCodec::H265 => {
            for key in ["sprop-vps", "sprop-sps", "sprop-pps"] {
                if let Some(value) = fmtp.get(key) {
                    match b64.decode(value.trim()) {
                        Ok(nal) if !nal.is_empty() => nals.push(Bytes::from(nal)),
                        Ok(_) => {}
                        Err(e) => debug!("ignoring undecodable {} entry: {}", key, e),
                    }
                }
            }
        }
    }

    nals
}

/// Frame duration from the fmtp `framerate` parameter or a media-level
/// `a=framerate` attribute; 1/30 s when absent or unusable.
fn frame_duration(media: &Media, fmtp: &HashMap<String, String>) -> Duration {
    let framerate = fmtp
        .get("framerate")
        .map(String::as_str)
        .or_else(|| attribute_value(media, "framerate"));

    match framerate.and_then(|v| v.trim().parse::<f64>().ok()) {
        Some(fps) if fps > 0.0 => Duration::from_secs_f64(1.0 / fps),
        Some(fps) => {
            debug!("ignoring non-positive framerate {}", fps);
            DEFAULT_FRAME_DURATION
        }
        None => DEFAULT_FRAME_DURATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sdp: &str) -> Session {
        Session::parse(sdp.replace('\n', "\r\n").as_bytes()).expect("sdp parse failed")
    }

    const H264_SDP: &str = "v=0
o=- 0 0 IN IP4 192.168.1.10
s=cam
c=IN IP4 192.168.1.10
t=0 0
m=video 0 RTP/AVP 96
a=rtpmap:96 H264/90000
a=fmtp:96 packetization-mode=1;profile-level-id=42e01f;sprop-parameter-sets=Z0LgH9oBQBbpUA==,aM4xUg==;framerate=25
a=control:trackID=0
";

    const H265_SDP: &str = "v=0
o=- 0 0 IN IP4 192.168.1.10
s=cam
c=IN IP4 192.168.1.10
t=0 0
m=audio 0 RTP/AVP 0
a=rtpmap:0 PCMU/8000
m=video 0 RTP/AVP 98
a=rtpmap:98 H265/90000
a=fmtp:98 profile-id=1;sprop-vps=QAEMAf//AWAAAAMAkAAAAwAAAwB4mZgJ;sprop-sps=QgEBAWAAAAMAkAAAAwAAAwB4oAKAgC0WNrkkya5ZwCAAAH0gAA6pwQ==;sprop-pps=RAHgdrAmQA==
a=control:trackID=1
";

    #[test]
    fn selects_h264_media_with_sprops_and_framerate() {
        let media = select_video_media(&parse(H264_SDP)).unwrap();
        assert_eq!(media.codec, VideoCodec::H264);
        assert_eq!(media.payload_type, 96);
        assert_eq!(media.control.as_deref(), Some("trackID=0"));
        assert_eq!(media.parameter_sets.len(), 2);
        // SPS starts 0x67, PPS 0x68.
        assert_eq!(media.parameter_sets[0][0] & 0x1f, 7);
        assert_eq!(media.parameter_sets[1][0] & 0x1f, 8);
        assert_eq!(media.frame_duration, Duration::from_secs_f64(1.0 / 25.0));
    }

    #[test]
    fn skips_non_video_media_and_selects_h265() {
        let media = select_video_media(&parse(H265_SDP)).unwrap();
        assert_eq!(media.codec, VideoCodec::H265);
        assert_eq!(media.payload_type, 98);
        assert_eq!(media.parameter_sets.len(), 3);
        // VPS, SPS, PPS in decode order.
        assert_eq!((media.parameter_sets[0][0] >> 1) & 0x3f, 32);
        assert_eq!((media.parameter_sets[1][0] >> 1) & 0x3f, 33);
        assert_eq!((media.parameter_sets[2][0] >> 1) & 0x3f, 34);
        assert_eq!(media.frame_duration, DEFAULT_FRAME_DURATION);
    }

    #[test]
    fn no_compatible_media() {
        let sdp = "v=0
o=- 0 0 IN IP4 10.0.0.1
s=mic
t=0 0
m=audio 0 RTP/AVP 0
a=rtpmap:0 PCMU/8000
";
        assert!(matches!(
            select_video_media(&parse(sdp)),
            Err(AppError::NoCompatibleMedia)
        ));
    }

    #[test]
    fn fmtp_parsing_tolerates_flags_and_spacing() {
        let session = parse(
            "v=0
o=- 0 0 IN IP4 10.0.0.1
s=s
t=0 0
m=video 0 RTP/AVP 96
a=rtpmap:96 H264/90000
a=fmtp:96 packetization-mode=1; some-flag ;profile-level-id=42e01f
",
        );
        let params = fmtp_params(&session.medias[0], 96);
        assert_eq!(params.get("packetization-mode").map(String::as_str), Some("1"));
        assert_eq!(params.get("profile-level-id").map(String::as_str), Some("42e01f"));
        assert!(params.contains_key("some-flag"));
    }
}
