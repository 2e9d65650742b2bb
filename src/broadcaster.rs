//! Broadcaster: the per-device singleton that owns the Driver Adapter and
//! the Media Conditioner, and fans conditioned samples out to every
//! subscriber of that device, per §4.5.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rtp::header::Header;
use rtp::packet::Packet;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{info, warn};
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocalWriter;

use crate::bitstream::Codec;
use crate::conditioner::{apply_outcome, condition_audio, condition_video, ConditionerOutcome, ParameterSetCache};
use crate::control::ControlEvent;
use crate::driver::transport::DeviceTransport;
use crate::driver::ScrcpyDriver;
use crate::state::DeviceIdentifier;
use crate::utils::LogThrottler;
use crate::warn_throttled;
use crate::webrtc::H265Payloader;

/// Receipt numbers cycle through `0..MAX_CLIENTS_PER_DEVICE-1`, per §3/§8.
pub const MAX_CLIENTS_PER_DEVICE: u8 = 4;

/// At most one `RequestIDR` write per device per this interval, per §5/§8
/// (see DESIGN.md for why 1s rather than a longer window).
const PLI_DEDUP_WINDOW: Duration = Duration::from_secs(1);

const RTP_VIDEO_CLOCK_RATE: u32 = 90_000;
const RTP_MTU: usize = 1200;

/// Fallback sample duration used when there's no prior PTS to diff against
/// (first frame of a session) or the delta comes out non-positive (PTS
/// jitter, reorder) — `webrtc-rs`'s sample-based tracks reject a zero or
/// negative duration.
const DEFAULT_VIDEO_SAMPLE_DURATION: Duration = Duration::from_millis(16);
const DEFAULT_AUDIO_SAMPLE_DURATION: Duration = Duration::from_millis(20);

/// Duration since the last sample on this track, falling back to `default`
/// when there's no prior PTS or the delta isn't usable.
fn sample_duration(last_pts: &Mutex<Option<u64>>, pts_us: u64, default: Duration) -> Duration {
    let mut last = last_pts.lock();
    let duration = match *last {
        Some(prev) if pts_us > prev => Duration::from_micros(pts_us - prev),
        _ => default,
    };
    *last = Some(pts_us);
    duration
}

/// The two ways a video sample reaches the wire: the library's own
/// sample-based packetizer for codecs it understands natively, or a manual
/// RTP track fed by [`H265Payloader`] for H.265, which `webrtc-rs` does not
/// packetize itself.
enum VideoSink {
    Sample {
        track: Arc<TrackLocalStaticSample>,
        last_pts: Mutex<Option<u64>>,
    },
    Rtp {
        track: Arc<TrackLocalStaticRTP>,
        payloader: Mutex<H265Payloader>,
        payload_type: u8,
        ssrc: u32,
        sequence_number: AtomicU32,
    },
}

impl VideoSink {
    async fn write(&self, payload: Bytes, pts_us: u64, throttle: &LogThrottler) {
        match self {
            VideoSink::Sample { track, last_pts } => {
                let duration = sample_duration(last_pts, pts_us, DEFAULT_VIDEO_SAMPLE_DURATION);
                let sample = Sample {
                    data: payload,
                    duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    warn_throttled!(throttle, "video_write_sample", error = %e, "video track write_sample failed");
                }
            }
            VideoSink::Rtp {
                track,
                payloader,
                payload_type,
                ssrc,
                sequence_number,
            } => {
                let rtp_payloads = payloader.lock().payload(RTP_MTU, &payload);
                let timestamp = ((pts_us as u128) * RTP_VIDEO_CLOCK_RATE as u128 / 1_000_000) as u32;
                let last_index = rtp_payloads.len().saturating_sub(1);
                for (i, rtp_payload) in rtp_payloads.into_iter().enumerate() {
                    let seq = sequence_number.fetch_add(1, Ordering::Relaxed) as u16;
                    let packet = Packet {
                        header: Header {
                            version: 2,
                            marker: i == last_index,
                            payload_type: *payload_type,
                            sequence_number: seq,
                            timestamp,
                            ssrc: *ssrc,
                            ..Default::default()
                        },
                        payload: rtp_payload,
                    };
                    if let Err(e) = track.write_rtp(&packet).await {
                        warn_throttled!(throttle, "video_write_rtp", error = %e, "video track write_rtp failed");
                    }
                }
            }
        }
    }
}

pub struct Broadcaster {
    pub device: DeviceIdentifier,
    cache: ParameterSetCache,
    video_codec: Codec,
    video_sink: VideoSink,
    audio_track: Arc<TrackLocalStaticSample>,
    subscribers: RwLock<HashMap<u8, Arc<crate::subscriber::Subscriber>>>,
    control_tx: mpsc::Sender<Bytes>,
    last_idr_request: Mutex<Option<Instant>>,
    last_audio_pts: Mutex<Option<u64>>,
    log_throttle: LogThrottler,
    pub width: u16,
    pub height: u16,
    /// The serial and SCID this session's reverse tunnel was set up under;
    /// needed again by [`teardown`](Self::teardown) for `reverse_remove`.
    serial: String,
    scid: String,
    transport: Arc<dyn DeviceTransport>,
    /// Abort handles for every reader/writer/pump task spawned in `ensure`
    /// (the driver's four socket tasks plus the control-forward, video,
    /// audio, and feedback pumps). `Mutex` because the pump handles are
    /// pushed in after construction, once those tasks exist.
    task_handles: Mutex<Vec<AbortHandle>>,
    torn_down: AtomicBool,
}

impl Broadcaster {
    /// Starts the driver, spawns the media and event pumps, and returns the
    /// broadcaster plus the shared tracks callers attach to new peer
    /// connections. Idempotent creation is the caller's (Broker's)
    /// responsibility — `ensure` always starts a fresh driver session.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure(
        device: DeviceIdentifier,
        serial: &str,
        remote_jar_path: &str,
        local_jar_path: &str,
        server_args: &[String],
        transport: Arc<dyn DeviceTransport>,
        video_sink: VideoSinkConfig,
        audio_track: Arc<TrackLocalStaticSample>,
    ) -> crate::error::Result<Arc<Self>> {
        let handles = ScrcpyDriver::start(
            serial,
            remote_jar_path,
            local_jar_path,
            server_args,
            Arc::clone(&transport),
        )
        .await?;

        let video_sink = match video_sink {
            VideoSinkConfig::Sample(track) => VideoSink::Sample {
                track,
                last_pts: Mutex::new(None),
            },
            VideoSinkConfig::Rtp {
                track,
                payload_type,
                ssrc,
            } => VideoSink::Rtp {
                track,
                payloader: Mutex::new(H265Payloader::new()),
                payload_type,
                ssrc,
                sequence_number: AtomicU32::new(0),
            },
        };

        let (control_tx, mut control_rx) = mpsc::channel::<Bytes>(64);
        let device_control_tx = handles.control_tx.clone();
        let control_forward_task = tokio::spawn(async move {
            while let Some(bytes) = control_rx.recv().await {
                if device_control_tx.send(bytes).await.is_err() {
                    return;
                }
            }
        });

        let mut task_handles = handles.task_handles;
        task_handles.push(control_forward_task.abort_handle());

        let broadcaster = Arc::new(Self {
            device: device.clone(),
            cache: ParameterSetCache::new(),
            video_codec: handles.video_codec,
            video_sink,
            audio_track,
            subscribers: RwLock::new(HashMap::new()),
            control_tx,
            last_idr_request: Mutex::new(None),
            last_audio_pts: Mutex::new(None),
            log_throttle: LogThrottler::with_secs(5),
            width: handles.initial_width,
            height: handles.initial_height,
            serial: serial.to_string(),
            scid: handles.scid,
            transport,
            task_handles: Mutex::new(task_handles),
            torn_down: AtomicBool::new(false),
        });

        let video_codec = handles.video_codec;
        let pump_broadcaster = Arc::clone(&broadcaster);
        let mut video_rx = handles.video_rx;
        let video_task = tokio::spawn(async move {
            while let Some(frame) = video_rx.recv().await {
                let outcome = condition_video(&frame, video_codec, &pump_broadcaster.cache.snapshot());
                apply_outcome(&pump_broadcaster.cache, &outcome);
                if let ConditionerOutcome::EmitVideo { payload, .. } = outcome {
                    pump_broadcaster
                        .video_sink
                        .write(payload, frame.pts_us, &pump_broadcaster.log_throttle)
                        .await;
                }
            }
            info!(device = %pump_broadcaster.device, "video reader ended, broadcaster draining");
        });

        let audio_broadcaster = Arc::clone(&broadcaster);
        let mut audio_rx = handles.audio_rx;
        let audio_task = tokio::spawn(async move {
            while let Some(frame) = audio_rx.recv().await {
                if let ConditionerOutcome::EmitAudio { payload } = condition_audio(&frame) {
                    let duration = sample_duration(
                        &audio_broadcaster.last_audio_pts,
                        frame.pts_us,
                        DEFAULT_AUDIO_SAMPLE_DURATION,
                    );
                    let sample = Sample {
                        data: payload,
                        duration,
                        ..Default::default()
                    };
                    if let Err(e) = audio_broadcaster.audio_track.write_sample(&sample).await {
                        warn_throttled!(
                            audio_broadcaster.log_throttle,
                            "audio_write_sample",
                            device = %audio_broadcaster.device,
                            error = %e,
                            "audio track write failed"
                        );
                    }
                }
            }
        });

        let feedback_broadcaster = Arc::clone(&broadcaster);
        let mut feedback_rx = handles.feedback_rx;
        let feedback_task = tokio::spawn(async move {
            while let Some(msg) = feedback_rx.recv().await {
                feedback_broadcaster.fan_out_feedback(msg).await;
            }
        });

        {
            let mut handles = broadcaster.task_handles.lock();
            handles.push(video_task.abort_handle());
            handles.push(audio_task.abort_handle());
            handles.push(feedback_task.abort_handle());
        }

        Ok(broadcaster)
    }

    async fn fan_out_feedback(&self, message: crate::driver::DeviceControlMessage) {
        let event = match message {
            crate::driver::DeviceControlMessage::Clipboard(text) => {
                crate::control::FeedbackEvent::ClipboardContent(
                    String::from_utf8_lossy(&text).into_owned(),
                )
            }
            crate::driver::DeviceControlMessage::Unknown { .. } => return,
        };
        let payload = event.encode();
        let subscribers: Vec<_> = self.subscribers.read().values().cloned().collect();
        for subscriber in subscribers {
            subscriber.send_unordered(payload.clone()).await;
        }
    }

    /// Assigns the next receipt slot, evicting any prior occupant first.
    pub fn admit(self: &Arc<Self>, subscriber: Arc<crate::subscriber::Subscriber>) -> u8 {
        let receipt_no = subscriber.receipt_no;
        let mut subscribers = self.subscribers.write();
        if let Some(prior) = subscribers.remove(&receipt_no) {
            let prior = Arc::clone(&prior);
            tokio::spawn(async move { prior.close().await });
        }
        subscribers.insert(receipt_no, subscriber);
        receipt_no
    }

    pub fn evict(&self, receipt_no: u8) {
        self.subscribers.write().remove(&receipt_no);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Receipt numbers of subscribers whose peer connection has reached
    /// `Failed` without yet running through the state-change callback's own
    /// eviction path — the belt-and-suspenders sweep `run_housekeeping`
    /// drives every tick.
    pub fn failed_subscriber_receipts(&self) -> Vec<u8> {
        self.subscribers
            .read()
            .iter()
            .filter(|(_, s)| s.peer_connection.connection_state() == RTCPeerConnectionState::Failed)
            .map(|(receipt_no, _)| *receipt_no)
            .collect()
    }

    /// Aborts every driver/pump task and releases the device-side reverse
    /// tunnel. Idempotent — safe to call more than once (the last-subscriber
    /// path in `Broker::evict` and `Broker::shutdown` can both reach it).
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.task_handles.lock().iter() {
            handle.abort();
        }
        if let Err(e) = self.transport.reverse_remove(&self.serial, &self.scid).await {
            warn!(device = %self.device, error = %e, "reverse_remove failed during teardown");
        }
    }

    /// Closes every current subscriber's peer connection, then tears down
    /// the driver session. Used for process-wide shutdown, where there's no
    /// natural "last subscriber departs" moment to trigger `teardown` alone.
    pub async fn shutdown(&self) {
        let subscribers: Vec<_> = self.subscribers.write().drain().map(|(_, s)| s).collect();
        for subscriber in subscribers {
            subscriber.close().await;
        }
        self.teardown().await;
    }

    /// De-duplicated `RequestIDR`: at most one write to the device control
    /// socket per [`PLI_DEDUP_WINDOW`], regardless of how many subscribers
    /// report a PLI in that interval.
    pub async fn request_idr_deduped(&self) {
        let should_send = {
            let mut last = self.last_idr_request.lock();
            crate::utils::dedup_allows(&mut last, Instant::now(), PLI_DEDUP_WINDOW)
        };
        if !should_send {
            return;
        }
        if let Some(bytes) = ControlEvent::RequestIDR.encode() {
            if self.control_tx.send(bytes).await.is_err() {
                warn!(device = %self.device, "control socket closed, dropping RequestIDR");
            }
        }
    }

    pub fn control_sender(&self) -> mpsc::Sender<Bytes> {
        self.control_tx.clone()
    }

    pub fn video_codec(&self) -> Codec {
        self.video_codec
    }
}

/// How to wire the shared video track, chosen once per device from the
/// negotiated codec.
pub enum VideoSinkConfig {
    Sample(Arc<TrackLocalStaticSample>),
    Rtp {
        track: Arc<TrackLocalStaticRTP>,
        payload_type: u8,
        ssrc: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_clients_per_device_is_four() {
        assert_eq!(MAX_CLIENTS_PER_DEVICE, 4);
    }

    #[test]
    fn sample_duration_falls_back_on_first_frame() {
        let last_pts = Mutex::new(None);
        let duration = sample_duration(&last_pts, 5_000, DEFAULT_VIDEO_SAMPLE_DURATION);
        assert_eq!(duration, DEFAULT_VIDEO_SAMPLE_DURATION);
    }

    #[test]
    fn sample_duration_uses_pts_delta_when_positive() {
        let last_pts = Mutex::new(Some(1_000));
        let duration = sample_duration(&last_pts, 34_000, DEFAULT_VIDEO_SAMPLE_DURATION);
        assert_eq!(duration, Duration::from_micros(33_000));
    }

    #[test]
    fn sample_duration_falls_back_on_non_positive_delta() {
        let last_pts = Mutex::new(Some(10_000));
        let duration = sample_duration(&last_pts, 9_000, DEFAULT_AUDIO_SAMPLE_DURATION);
        assert_eq!(duration, DEFAULT_AUDIO_SAMPLE_DURATION);
    }
}
