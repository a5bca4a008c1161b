//! The hub: central fan-out from one video source to every client
//!
//! Owns the per-codec WebRTC track sets, the cached parameter sets replayed
//! to late joiners, and the WebSocket NAL-mode client registry. All mutable
//! process-wide state lives here; one `Arc<Hub>` is handed to the ingesters
//! and the session layer.
//!
//! Publishing never blocks the ingest loop on a slow consumer: track sets
//! are snapshotted under the reader lock and written to outside it, and a
//! failed write to one track is logged at debug and swallowed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::nal::{
    annexb_prefixed, h264_nal_type, h265_nal_type, AccessUnit, NalKind, VideoCodec,
};

/// Per-client queue depth in the WebSocket NAL mode; overflow drops the
/// message rather than delaying the publisher.
const NAL_CLIENT_QUEUE: usize = 256;

/// Most recent decoder initialization NALs seen from the source
#[derive(Debug, Default, Clone)]
pub struct ParameterSets {
    pub h264_sps: Option<Bytes>,
    pub h264_pps: Option<Bytes>,
    pub h265_vps: Option<Bytes>,
    pub h265_sps: Option<Bytes>,
    pub h265_pps: Option<Bytes>,
}

impl ParameterSets {
    /// Parameter-set NALs for `codec` in decode order (VPS, SPS, PPS)
    pub fn nals_for(&self, codec: VideoCodec) -> Vec<Bytes> {
        let mut nals = Vec::new();
        match codec {
            VideoCodec::H264 => {
                nals.extend(self.h264_sps.clone());
                nals.extend(self.h264_pps.clone());
            }
            VideoCodec::H265 => {
                nals.extend(self.h265_vps.clone());
                nals.extend(self.h265_sps.clone());
                nals.extend(self.h265_pps.clone());
            }
        }
        nals
    }
}

struct TrackEntry {
    id: u64,
    track: Arc<TrackLocalStaticSample>,
}

/// Handle returned by [`Hub::register_track`]; passed back to deregister.
#[derive(Debug, Clone, Copy)]
pub struct TrackHandle {
    id: u64,
    codec: VideoCodec,
}

/// One JSON envelope of the WebSocket NAL mode
#[derive(Debug, Clone)]
pub struct NalEnvelope {
    pub kind: NalKind,
    pub timestamp_ms: u64,
    pub data: Bytes,
}

impl NalEnvelope {
    /// Serialize to the wire shape `{"type","timestamp","data"}` with the
    /// raw NAL bytes base64-encoded.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "type": self.kind.as_str(),
            "timestamp": self.timestamp_ms,
            "data": base64::engine::general_purpose::STANDARD.encode(&self.data),
        })
        .to_string()
    }
}

struct NalClientEntry {
    id: u64,
    tx: mpsc::Sender<NalEnvelope>,
    /// Cached SPS/PPS delivered to this client
    params_sent: AtomicBool,
    /// Receiver gone; entry removed on the next sweep
    stale: AtomicBool,
}

/// Handle returned by [`Hub::register_nal_client`].
#[derive(Debug, Clone, Copy)]
pub struct NalClientHandle {
    id: u64,
}

/// Central broadcaster; see module docs.
pub struct Hub {
    output_codec: VideoCodec,
    h264_tracks: RwLock<Vec<TrackEntry>>,
    h265_tracks: RwLock<Vec<TrackEntry>>,
    params: RwLock<ParameterSets>,
    nal_clients: RwLock<Vec<NalClientEntry>>,
    next_id: AtomicU64,
    nal_drops: AtomicU64,
}

impl Hub {
    /// Create a hub. `output_codec` is the codec clients receive; it is
    /// fixed for the process lifetime.
    pub fn new(output_codec: VideoCodec) -> Self {
        Self {
            output_codec,
            h264_tracks: RwLock::new(Vec::new()),
            h265_tracks: RwLock::new(Vec::new()),
            params: RwLock::new(ParameterSets::default()),
            nal_clients: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            nal_drops: AtomicU64::new(0),
        }
    }

    pub fn output_codec(&self) -> VideoCodec {
        self.output_codec
    }

    /// Snapshot of the cached parameter sets
    pub async fn parameter_sets(&self) -> ParameterSets {
        self.params.read().await.clone()
    }

    fn tracks_for(&self, codec: VideoCodec) -> &RwLock<Vec<TrackEntry>> {
        match codec {
            VideoCodec::H264 => &self.h264_tracks,
            VideoCodec::H265 => &self.h265_tracks,
        }
    }

    /// Register a client track. The most recent parameter sets are written
    /// to the track before it joins the set, so a late joiner always holds
    /// decoder init data before its first video NAL.
    pub async fn register_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
        codec: VideoCodec,
    ) -> TrackHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let primer = self.params.read().await.nals_for(codec);
        for nal in &primer {
            let sample = Sample {
                data: annexb_prefixed(nal),
                duration: crate::nal::DEFAULT_FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("parameter-set primer write failed for track {}: {}", id, e);
            }
        }

        let mut tracks = self.tracks_for(codec).write().await;
        tracks.push(TrackEntry { id, track });
        info!("track {} registered ({}), {} active", id, codec, tracks.len());

        TrackHandle { id, codec }
    }

    /// Remove a track registered earlier.
    pub async fn deregister_track(&self, handle: TrackHandle) {
        let mut tracks = self.tracks_for(handle.codec).write().await;
        tracks.retain(|entry| entry.id != handle.id);
        info!(
            "track {} deregistered ({}), {} active",
            handle.id,
            handle.codec,
            tracks.len()
        );
    }

    /// Number of registered tracks for `codec`.
    pub async fn track_count(&self, codec: VideoCodec) -> usize {
        self.tracks_for(codec).read().await.len()
    }

    /// Register a WebSocket NAL-mode client; envelopes arrive on the
    /// returned receiver.
    pub async fn register_nal_client(&self) -> (NalClientHandle, mpsc::Receiver<NalEnvelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(NAL_CLIENT_QUEUE);

        let mut clients = self.nal_clients.write().await;
        clients.push(NalClientEntry {
            id,
            tx,
            params_sent: AtomicBool::new(false),
            stale: AtomicBool::new(false),
        });
        info!("nal client {} registered, {} active", id, clients.len());

        (NalClientHandle { id }, rx)
    }

    pub async fn deregister_nal_client(&self, handle: NalClientHandle) {
        let mut clients = self.nal_clients.write().await;
        clients.retain(|c| c.id != handle.id);
        info!("nal client {} deregistered, {} active", handle.id, clients.len());
    }

    /// Distribute one access unit to every subscriber of `codec`.
    ///
    /// NAL order within the unit is preserved; per-track failures do not
    /// affect other tracks or delay the next unit.
    pub async fn publish(&self, au: &AccessUnit, codec: VideoCodec) {
        if au.is_empty() {
            return;
        }

        self.update_parameter_sets(au, codec).await;

        let tracks: Vec<Arc<TrackLocalStaticSample>> = {
            let guard = self.tracks_for(codec).read().await;
            guard.iter().map(|e| e.track.clone()).collect()
        };

        for nal in &au.nals {
            if nal.is_empty() {
                continue;
            }
            let sample = Sample {
                data: annexb_prefixed(nal),
                duration: au.duration,
                ..Default::default()
            };
            for track in &tracks {
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("track write_sample failed: {}", e);
                }
            }
        }

        if codec == VideoCodec::H264 {
            self.fan_out_nal_clients(au).await;
        }
    }

    /// Refresh the cached parameter sets from an access unit.
    async fn update_parameter_sets(&self, au: &AccessUnit, codec: VideoCodec) {
        if !au
            .nals
            .iter()
            .any(|nal| crate::nal::is_parameter_set_nal(nal, codec))
        {
            return;
        }

        let mut params = self.params.write().await;
        for nal in &au.nals {
            match codec {
                VideoCodec::H264 => match h264_nal_type(nal) {
                    Some(7) => update_if_changed(&mut params.h264_sps, nal, "SPS"),
                    Some(8) => update_if_changed(&mut params.h264_pps, nal, "PPS"),
                    _ => {}
                },
                VideoCodec::H265 => match h265_nal_type(nal) {
                    Some(32) => update_if_changed(&mut params.h265_vps, nal, "VPS"),
                    Some(33) => update_if_changed(&mut params.h265_sps, nal, "SPS"),
                    Some(34) => update_if_changed(&mut params.h265_pps, nal, "PPS"),
                    _ => {}
                },
            }
        }
    }

    async fn fan_out_nal_clients(&self, au: &AccessUnit) {
        let clients = self.nal_clients.read().await;
        if clients.is_empty() {
            return;
        }

        let params = self.params.read().await.clone();
        let timestamp_ms = unix_millis();
        let mut saw_stale = false;

        for client in clients.iter() {
            if client.stale.load(Ordering::Relaxed) {
                saw_stale = true;
                continue;
            }

            if !client.params_sent.load(Ordering::Relaxed) {
                let (Some(sps), Some(pps)) = (&params.h264_sps, &params.h264_pps) else {
                    // No decoder config to offer yet; hold back video.
                    continue;
                };
                let configured = send_envelope(client, NalEnvelope {
                    kind: NalKind::Sps,
                    timestamp_ms,
                    data: sps.clone(),
                }) && send_envelope(client, NalEnvelope {
                    kind: NalKind::Pps,
                    timestamp_ms,
                    data: pps.clone(),
                });
                if !configured {
                    saw_stale = true;
                    continue;
                }
                client.params_sent.store(true, Ordering::Relaxed);
            }

            for nal in &au.nals {
                if nal.is_empty() {
                    continue;
                }
                let env = NalEnvelope {
                    kind: NalKind::classify_h264(nal),
                    timestamp_ms,
                    data: nal.clone(),
                };
                match client.tx.try_send(env) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let dropped = self.nal_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(
                            "nal client {} queue full, dropping ({} total)",
                            client.id, dropped
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        client.stale.store(true, Ordering::Relaxed);
                        saw_stale = true;
                        break;
                    }
                }
            }
        }
        drop(clients);

        if saw_stale {
            let mut clients = self.nal_clients.write().await;
            clients.retain(|c| !c.stale.load(Ordering::Relaxed));
        }
    }
}

fn send_envelope(client: &NalClientEntry, env: NalEnvelope) -> bool {
    match client.tx.try_send(env) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("nal client {} queue full during decoder config", client.id);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            client.stale.store(true, Ordering::Relaxed);
            false
        }
    }
}

fn update_if_changed(slot: &mut Option<Bytes>, nal: &Bytes, label: &str) {
    if slot.as_ref() != Some(nal) {
        debug!("{} cached/updated ({} bytes)", label, nal.len());
        *slot = Some(nal.clone());
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::DEFAULT_FRAME_DURATION;

    fn au(nals: &[&[u8]]) -> AccessUnit {
        AccessUnit::new(
            nals.iter().map(|n| Bytes::copy_from_slice(n)).collect(),
            DEFAULT_FRAME_DURATION,
        )
    }

    #[tokio::test]
    async fn caches_parameter_sets_from_published_units() {
        let hub = Hub::new(VideoCodec::H264);
        hub.publish(&au(&[&[0x67, 0x42, 0xe0], &[0x68, 0xce], &[0x65, 0x11]]), VideoCodec::H264)
            .await;

        let params = hub.parameter_sets().await;
        assert_eq!(params.h264_sps.as_deref(), Some(&[0x67, 0x42, 0xe0][..]));
        assert_eq!(params.h264_pps.as_deref(), Some(&[0x68, 0xce][..]));
        assert!(params.h265_vps.is_none());
    }

    #[tokio::test]
    async fn caches_h265_parameter_sets() {
        let hub = Hub::new(VideoCodec::H265);
        hub.publish(
            &au(&[&[0x40, 0x01, 0x0c], &[0x42, 0x01, 0x01], &[0x44, 0x01, 0xc0]]),
            VideoCodec::H265,
        )
        .await;

        let params = hub.parameter_sets().await;
        assert!(params.h265_vps.is_some());
        assert!(params.h265_sps.is_some());
        assert!(params.h265_pps.is_some());
        assert_eq!(params.nals_for(VideoCodec::H265).len(), 3);
    }

    #[tokio::test]
    async fn nal_client_receives_config_once_then_video() {
        let hub = Hub::new(VideoCodec::H264);
        let (_handle, mut rx) = hub.register_nal_client().await;

        // First unit carries SPS/PPS inline plus an IDR.
        hub.publish(&au(&[&[0x67, 0x42], &[0x68, 0xce], &[0x65, 0x11]]), VideoCodec::H264)
            .await;
        // Second unit: delta only.
        hub.publish(&au(&[&[0x41, 0x22]]), VideoCodec::H264).await;

        let mut kinds = Vec::new();
        while let Ok(env) = rx.try_recv() {
            kinds.push(env.kind);
        }

        // Cached config first (sps, pps), then the inline unit (sps, pps,
        // key), then the delta. Config replay happens exactly once.
        assert_eq!(
            kinds,
            vec![
                NalKind::Sps,
                NalKind::Pps,
                NalKind::Sps,
                NalKind::Pps,
                NalKind::Key,
                NalKind::Delta
            ]
        );
    }

    #[tokio::test]
    async fn nal_client_joining_late_gets_cached_config_before_video() {
        let hub = Hub::new(VideoCodec::H264);
        // Parameter sets published before the client exists.
        hub.publish(&au(&[&[0x67, 0x42], &[0x68, 0xce]]), VideoCodec::H264)
            .await;

        let (_handle, mut rx) = hub.register_nal_client().await;
        hub.publish(&au(&[&[0x41, 0x22]]), VideoCodec::H264).await;

        assert_eq!(rx.try_recv().unwrap().kind, NalKind::Sps);
        assert_eq!(rx.try_recv().unwrap().kind, NalKind::Pps);
        assert_eq!(rx.try_recv().unwrap().kind, NalKind::Delta);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nal_client_without_config_receives_nothing() {
        let hub = Hub::new(VideoCodec::H264);
        let (_handle, mut rx) = hub.register_nal_client().await;

        hub.publish(&au(&[&[0x41, 0x22]]), VideoCodec::H264).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_nal_client_is_swept() {
        let hub = Hub::new(VideoCodec::H264);
        hub.publish(&au(&[&[0x67, 0x42], &[0x68, 0xce]]), VideoCodec::H264)
            .await;

        let (_handle, rx) = hub.register_nal_client().await;
        drop(rx);

        hub.publish(&au(&[&[0x41, 0x22]]), VideoCodec::H264).await;
        assert_eq!(hub.nal_clients.read().await.len(), 0);
    }

    #[tokio::test]
    async fn track_registry_add_remove() {
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

        let hub = Hub::new(VideoCodec::H264);
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: VideoCodec::H264.mime_type().to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video0".to_string(),
            "rtc-relay".to_string(),
        ));

        let handle = hub.register_track(track, VideoCodec::H264).await;
        assert_eq!(hub.track_count(VideoCodec::H264).await, 1);
        assert_eq!(hub.track_count(VideoCodec::H265).await, 0);

        // Publishing with an unbound track must not error or stall.
        hub.publish(&au(&[&[0x65, 0x11]]), VideoCodec::H264).await;

        hub.deregister_track(handle).await;
        assert_eq!(hub.track_count(VideoCodec::H264).await, 0);
    }

    #[test]
    fn envelope_wire_shape() {
        let env = NalEnvelope {
            kind: NalKind::Key,
            timestamp_ms: 1234,
            data: Bytes::from_static(&[0x65, 0x00]),
        };
        let value: serde_json::Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(value["type"], "key");
        assert_eq!(value["timestamp"], 1234);
        assert_eq!(value["data"], "ZQA=");
    }
}
