//! H.265 to H.264 transcoding bridge
//!
//! The encoder is an external subprocess treated as a byte-stream filter:
//! Annex-B H.265 in on stdin, Annex-B H.264 out on stdout. Two variants
//! exist, a software encoder (libx264) and a hardware decode+encode path
//! (NVDEC/NVENC), both tuned for CBR low-latency output with a 30-frame
//! GOP and no B-frames.
//!
//! The input channel is bounded; when the encoder falls behind, incoming
//! access units are dropped rather than queued — a stale frame hurts an
//! interactive viewer more than a skipped one.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::hub::Hub;
use crate::nal::annexb::AnnexBSplitter;
use crate::nal::{AccessUnit, VideoCodec, START_CODE};

/// Bounded depth of the channel between ingest and the encoder
const INPUT_QUEUE: usize = 100;

/// Flush the stdin batch after this many NAL units
const BATCH_MAX_NALS: usize = 3;

/// ... or after this many buffered bytes, whichever comes first
const BATCH_MAX_BYTES: usize = 64 * 1024;

/// Encoder hardware selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Processor {
    /// Software encode (libx264)
    Cpu,
    /// Hardware decode + encode (NVDEC/NVENC)
    Gpu,
}

impl std::fmt::Display for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Processor::Cpu => write!(f, "cpu"),
            Processor::Gpu => write!(f, "gpu"),
        }
    }
}

/// Encoder invocation for a pipe-to-pipe H.265 -> H.264 filter
pub fn transcoder_args(processor: Processor) -> Vec<&'static str> {
    match processor {
        Processor::Cpu => vec![
            "-hide_banner",
            "-loglevel", "error",
            "-probesize", "250000",
            "-analyzeduration", "50000",
            "-fflags", "nobuffer+genpts",
            "-flags", "low_delay",
            "-max_delay", "500",
            "-f", "hevc",
            "-i", "pipe:0",
            "-an",
            "-c:v", "libx264",
            "-preset", "ultrafast",
            "-tune", "zerolatency",
            "-x264-params", "nal-hrd=cbr",
            "-b:v", "3M",
            "-maxrate", "3M",
            "-bufsize", "5M",
            "-g", "30",
            "-bf", "0",
            "-fps_mode", "passthrough",
            "-map", "0:v:0",
            "-f", "h264",
            "pipe:1",
        ],
        Processor::Gpu => vec![
            "-hide_banner",
            "-loglevel", "error",
            "-f", "hevc",
            "-i", "pipe:0",
            "-an",
            "-c:v", "h264_nvenc",
            "-preset", "p1",
            "-tune", "ll",
            "-rc:v", "cbr",
            "-b:v", "2M",
            "-maxrate", "2M",
            "-bufsize", "4M",
            "-g", "30",
            "-keyint_min", "30",
            "-bf", "0",
            "-bsf:v", "h264_mp4toannexb",
            "-f", "h264",
            "pipe:1",
        ],
    }
}

/// Cloneable sender side of the bridge. Full queue drops the unit.
#[derive(Clone)]
pub struct TranscodeInput {
    tx: mpsc::Sender<AccessUnit>,
    dropped: Arc<AtomicU64>,
}

impl TranscodeInput {
    pub fn deliver(&self, au: AccessUnit) {
        match self.tx.try_send(au) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("transcoder input full, dropping access unit ({} dropped)", dropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("transcoder input closed, dropping access unit");
            }
        }
    }
}

/// Batches start-code framed NAL units before they hit the encoder pipe.
struct WriteBatch {
    buf: Vec<u8>,
    nals: usize,
}

impl WriteBatch {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(BATCH_MAX_BYTES),
            nals: 0,
        }
    }

    fn push(&mut self, nal: &[u8]) {
        self.buf.extend_from_slice(&START_CODE);
        self.buf.extend_from_slice(nal);
        self.nals += 1;
    }

    fn should_flush(&self) -> bool {
        self.nals >= BATCH_MAX_NALS || self.buf.len() >= BATCH_MAX_BYTES
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self) -> Vec<u8> {
        self.nals = 0;
        std::mem::take(&mut self.buf)
    }
}

/// A running encoder subprocess bridging H.265 input to H.264 output.
pub struct TranscodeBridge {
    input: TranscodeInput,
    child: Arc<Mutex<Child>>,
}

impl TranscodeBridge {
    /// Start the encoder and its pump tasks.
    ///
    /// `preamble` is the cached VPS/SPS/PPS written (start-code framed)
    /// before the first video NAL; decoded H.264 NALs are published to
    /// `hub` with `duration` as the presentation hint.
    pub fn spawn(
        processor: Processor,
        preamble: Vec<Bytes>,
        hub: Arc<Hub>,
        duration: Duration,
    ) -> Result<Self> {
        let args = transcoder_args(processor);
        info!("starting transcoder ({}): ffmpeg {}", processor, args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Transcode(format!("failed to start encoder: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Transcode("encoder stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Transcode("encoder stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        let (tx, rx) = mpsc::channel(INPUT_QUEUE);
        let input = TranscodeInput {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let child = Arc::new(Mutex::new(child));

        tokio::spawn(write_loop(rx, stdin, preamble, child.clone()));
        tokio::spawn(read_loop(stdout, hub, duration));

        Ok(Self { input, child })
    }

    /// Sender handle for the ingest side.
    pub fn input(&self) -> TranscodeInput {
        self.input.clone()
    }

    /// Terminate the encoder (kill + wait). Downstream readers observe EOF.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!("encoder already exited: {}", e);
        } else {
            info!("transcoder terminated");
        }
    }
}

/// Feed H.265 access units into the encoder stdin.
async fn write_loop(
    mut rx: mpsc::Receiver<AccessUnit>,
    mut stdin: tokio::process::ChildStdin,
    preamble: Vec<Bytes>,
    child: Arc<Mutex<Child>>,
) {
    let mut batch = WriteBatch::new();
    for nal in &preamble {
        batch.push(nal);
    }

    'feed: while let Some(au) = rx.recv().await {
        for nal in &au.nals {
            if nal.is_empty() {
                continue;
            }
            batch.push(nal);
            if batch.should_flush() {
                if let Err(e) = stdin.write_all(&batch.take()).await {
                    error!("encoder stdin write failed: {}", e);
                    break 'feed;
                }
            }
        }

        // Nothing immediately pending: push what we have through.
        if rx.is_empty() && !batch.is_empty() {
            if let Err(e) = stdin.write_all(&batch.take()).await {
                error!("encoder stdin write failed: {}", e);
                break 'feed;
            }
            if let Err(e) = stdin.flush().await {
                error!("encoder stdin flush failed: {}", e);
                break 'feed;
            }
        }
    }

    // Either the source ended or a write failed: close stdin so the
    // encoder drains, then make sure the process is gone.
    let _ = stdin.shutdown().await;
    drop(stdin);
    let mut child = child.lock().await;
    let _ = child.kill().await;
    info!("transcoder input closed");
}

/// Frame the encoder stdout and publish H.264 NALs to the hub.
async fn read_loop(stdout: tokio::process::ChildStdout, hub: Arc<Hub>, duration: Duration) {
    let mut reader = BufReader::new(stdout);
    let mut splitter = AnnexBSplitter::new();
    let mut chunk = [0u8; 4096];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                splitter.push(&chunk[..n]);
                while let Some(nal) = splitter.next_nal() {
                    hub.publish(&AccessUnit::single(nal, duration), VideoCodec::H264)
                        .await;
                }
            }
            Err(e) => {
                error!("encoder stdout read failed: {}", e);
                break;
            }
        }
    }

    if let Some(nal) = splitter.finish() {
        hub.publish(&AccessUnit::single(nal, duration), VideoCodec::H264)
            .await;
    }
    info!("transcoder output ended");
}

/// Drain stderr into logs so the encoder never blocks on a full pipe.
async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("ffmpeg: {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_args_select_software_encoder() {
        let args = transcoder_args(Processor::Cpu);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-preset", "ultrafast"]));
        assert!(args.windows(2).any(|w| w == ["-tune", "zerolatency"]));
        assert!(args.windows(2).any(|w| w == ["-g", "30"]));
        assert!(args.windows(2).any(|w| w == ["-bf", "0"]));
        assert!(args.windows(2).any(|w| w == ["-f", "hevc"]));
        assert_eq!(*args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn gpu_args_select_hardware_encoder() {
        let args = transcoder_args(Processor::Gpu);
        assert!(args.windows(2).any(|w| w == ["-c:v", "h264_nvenc"]));
        assert!(args.windows(2).any(|w| w == ["-preset", "p1"]));
        assert!(args.windows(2).any(|w| w == ["-rc:v", "cbr"]));
        assert!(args.windows(2).any(|w| w == ["-g", "30"]));
    }

    #[test]
    fn batch_flushes_on_nal_count() {
        let mut batch = WriteBatch::new();
        batch.push(&[0x40, 0x01]);
        batch.push(&[0x42, 0x01]);
        assert!(!batch.should_flush());
        batch.push(&[0x44, 0x01]);
        assert!(batch.should_flush());

        let out = batch.take();
        assert!(batch.is_empty());
        // Three units, each start-code framed.
        assert_eq!(out.len(), 3 * (4 + 2));
        assert_eq!(&out[..4], &START_CODE);
    }

    #[test]
    fn batch_flushes_on_byte_budget() {
        let mut batch = WriteBatch::new();
        batch.push(&vec![0u8; BATCH_MAX_BYTES]);
        assert!(batch.should_flush());
    }

    #[test]
    fn batch_frames_nals_with_start_codes() {
        let mut batch = WriteBatch::new();
        batch.push(&[0x26, 0x01, 0xaa]);
        let out = batch.take();
        assert_eq!(out, vec![0, 0, 0, 1, 0x26, 0x01, 0xaa]);
    }

    #[tokio::test]
    async fn input_drops_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let input = TranscodeInput {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };

        let au = AccessUnit::single(Bytes::from_static(&[0x26, 0x01]), Duration::from_millis(33));
        input.deliver(au.clone());
        input.deliver(au.clone());
        input.deliver(au);

        assert_eq!(input.dropped.load(Ordering::Relaxed), 2);
    }
}
