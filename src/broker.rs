//! Broker (WebRTC Manager): registry of broadcasters keyed by device
//! identifier, subscriber admission, codec negotiation, and periodic
//! housekeeping, per §4.6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::broadcaster::{Broadcaster, VideoSinkConfig, MAX_CLIENTS_PER_DEVICE};
use crate::config::Config;
use crate::driver::transport::DeviceTransport;
use crate::error::{AppError, Result};
use crate::state::DeviceIdentifier;
use crate::subscriber::{ordered_channel_init, unordered_channel_init, Subscriber};
use crate::webrtc::signaling::AgentConfig;
use crate::webrtc::{build_setting_engine, register_codecs};

/// The shared video/audio tracks for one device, created at the first
/// `admit` and reused for the device's lifetime regardless of how many
/// subscribers come and go — the shared-track fan-out discipline of §9.
struct DeviceTracks {
    video: Arc<TrackLocalStaticSample>,
    audio: Arc<TrackLocalStaticSample>,
}

/// Registry + negotiation entry point. Constructed once per process (§9,
/// "Global singletons") and passed around as `Arc<Broker>`.
pub struct Broker {
    config: Config,
    transport: Arc<dyn DeviceTransport>,
    broadcasters: RwLock<HashMap<DeviceIdentifier, Arc<Broadcaster>>>,
    tracks: RwLock<HashMap<DeviceIdentifier, Arc<DeviceTracks>>>,
    receipt_counters: RwLock<HashMap<DeviceIdentifier, AtomicU8>>,
}

impl Broker {
    pub fn new(config: Config, transport: Arc<dyn DeviceTransport>) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            broadcasters: RwLock::new(HashMap::new()),
            tracks: RwLock::new(HashMap::new()),
            receipt_counters: RwLock::new(HashMap::new()),
        })
    }

    fn next_receipt_no(&self, device: &DeviceIdentifier) -> u8 {
        {
            let counters = self.receipt_counters.read();
            if let Some(counter) = counters.get(device) {
                return counter.fetch_add(1, Ordering::Relaxed) % MAX_CLIENTS_PER_DEVICE;
            }
        }
        let mut counters = self.receipt_counters.write();
        let counter = counters
            .entry(device.clone())
            .or_insert_with(|| AtomicU8::new(0));
        counter.fetch_add(1, Ordering::Relaxed) % MAX_CLIENTS_PER_DEVICE
    }

    fn broadcaster_for(&self, device: &DeviceIdentifier) -> Option<Arc<Broadcaster>> {
        self.broadcasters.read().get(device).cloned()
    }

    /// Media metadata for the `webrtc_metainfo` signaling frame, available
    /// once the device's broadcaster (and thus its negotiated codec and
    /// initial resolution) exists.
    pub fn media_meta(&self, device: &DeviceIdentifier) -> Option<crate::webrtc::signaling::MediaMeta> {
        let broadcaster = self.broadcaster_for(device)?;
        let (mime_type, payload_type) = match broadcaster.video_codec() {
            crate::bitstream::Codec::H264 => (webrtc::api::media_engine::MIME_TYPE_H264, 104),
            crate::bitstream::Codec::H265 => (crate::webrtc::MIME_TYPE_H265, 102),
        };
        Some(crate::webrtc::signaling::MediaMeta {
            video_mime_type: mime_type.to_string(),
            video_payload_type: payload_type,
            audio_mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_string(),
            width: broadcaster.width,
            height: broadcaster.height,
        })
    }

    /// Returns the device's shared tracks, creating them on first use.
    /// `av_sync` only matters on creation: on means video and audio share one
    /// msid stream ID (the browser syncs them as one source); off gives each
    /// its own stream ID, per §6.3.
    fn tracks_for(&self, device: &DeviceIdentifier, av_sync: bool) -> Arc<DeviceTracks> {
        {
            let tracks = self.tracks.read();
            if let Some(t) = tracks.get(device) {
                return Arc::clone(t);
            }
        }
        let mut tracks = self.tracks.write();
        Arc::clone(tracks.entry(device.clone()).or_insert_with(|| {
            let (video_stream_id, audio_stream_id) = if av_sync {
                (device.to_string(), device.to_string())
            } else {
                (format!("{device}-video"), format!("{device}-audio"))
            };
            Arc::new(DeviceTracks {
                video: Arc::new(TrackLocalStaticSample::new(
                    webrtc::api::media_engine::MIME_TYPE_H264.to_owned().into(),
                    "video".to_owned(),
                    video_stream_id,
                )),
                audio: Arc::new(TrackLocalStaticSample::new(
                    webrtc::api::media_engine::MIME_TYPE_OPUS.to_owned().into(),
                    "audio".to_owned(),
                    audio_stream_id,
                )),
            })
        }))
    }

    /// Builds a fresh `RTCPeerConnection` with the codec registry and STUN
    /// configuration from §4.6/§6.2.
    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine).map_err(AppError::WebRtc)?;

        let setting_engine = build_setting_engine(
            self.config.webrtc.ice_udp_port_min,
            self.config.webrtc.ice_udp_port_max,
        )
        .map_err(AppError::WebRtc)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.config.webrtc.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(AppError::WebRtc)?;
        Ok(Arc::new(pc))
    }

    fn device_identifier(agent_config: &AgentConfig) -> DeviceIdentifier {
        DeviceIdentifier::new(
            &format!("{:?}", agent_config.device_type).to_lowercase(),
            &agent_config.device_id,
            &agent_config.device_ip,
            agent_config.device_port,
        )
    }

    /// `Admit`: create the peer connection, attach the device's shared
    /// tracks (creating them if this is the first subscriber), negotiate
    /// SDP, and return the answer plus the new subscriber.
    pub async fn admit(
        self: &Arc<Self>,
        agent_config: AgentConfig,
    ) -> Result<(String, DeviceIdentifier, Arc<Subscriber>)> {
        let device = Self::device_identifier(&agent_config);
        let peer_connection = self.build_peer_connection().await?;
        let device_tracks = self.tracks_for(&device, agent_config.av_sync);

        let video_transceiver = peer_connection
            .add_transceiver_from_track(
                Arc::clone(&device_tracks.video) as Arc<dyn TrackLocal + Send + Sync>,
                None,
            )
            .await
            .map_err(AppError::WebRtc)?;
        let audio_transceiver = peer_connection
            .add_transceiver_from_track(
                Arc::clone(&device_tracks.audio) as Arc<dyn TrackLocal + Send + Sync>,
                None,
            )
            .await
            .map_err(AppError::WebRtc)?;
        spawn_rtcp_drain(audio_transceiver.sender().await);

        peer_connection
            .create_data_channel("control-ordered", Some(ordered_channel_init()))
            .await
            .map_err(AppError::WebRtc)?;
        peer_connection
            .create_data_channel("control-unordered", Some(unordered_channel_init()))
            .await
            .map_err(AppError::WebRtc)?;

        let receipt_no = self.next_receipt_no(&device);
        // The control channel is wired to the broadcaster's control socket
        // once it exists; until then, events are dropped (there is no device
        // to deliver them to yet).
        let (control_tx, _unused_until_broadcaster_exists) = tokio::sync::mpsc::channel(1);
        let subscriber = Subscriber::new(
            device.clone(),
            receipt_no,
            Arc::clone(&peer_connection),
            control_tx,
        );

        let broker = Arc::clone(self);
        subscriber.attach_callbacks(move |device, receipt_no| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker.evict(&device, receipt_no).await;
            });
        });

        let video_sender = video_transceiver.sender().await;
        let pli_broker = Arc::clone(self);
        let pli_device = device.clone();
        subscriber.spawn_rtcp_reader(video_sender, move || {
            let broker = Arc::clone(&pli_broker);
            let device = pli_device.clone();
            tokio::spawn(async move {
                if let Some(broadcaster) = broker.broadcaster_for(&device) {
                    broadcaster.request_idr_deduped().await;
                }
            });
        });

        let answer_sdp = subscriber.negotiate(agent_config.sdp).await?;

        if let Some(broadcaster) = self.broadcaster_for(&device) {
            subscriber.set_control_sender(broadcaster.control_sender());
            broadcaster.admit(Arc::clone(&subscriber));
        }

        Ok((answer_sdp, device, subscriber))
    }

    /// `Start`: called once the browser has confirmed receipt of the SDP
    /// answer. Waits for the connection, and if this is the first subscriber
    /// for the device, brings the driver up against the tracks already
    /// attached in `admit`.
    pub async fn start(
        self: &Arc<Self>,
        device: DeviceIdentifier,
        subscriber: Arc<Subscriber>,
        server_args: Vec<String>,
        av_sync: bool,
    ) -> Result<()> {
        wait_for_connected(&subscriber.peer_connection).await?;

        if let Some(broadcaster) = self.broadcaster_for(&device) {
            subscriber.set_control_sender(broadcaster.control_sender());
            broadcaster.admit(subscriber);
            return Ok(());
        }

        let device_tracks = self.tracks_for(&device, av_sync);
        let serial = self
            .config
            .device
            .adb_serial
            .clone()
            .unwrap_or_else(|| device.as_str().to_string());

        let broadcaster = Broadcaster::ensure(
            device.clone(),
            &serial,
            &self.config.device.remote_jar_path,
            &self.config.device.server_jar_path,
            &server_args,
            Arc::clone(&self.transport),
            VideoSinkConfig::Sample(Arc::clone(&device_tracks.video)),
            Arc::clone(&device_tracks.audio),
        )
        .await?;

        self.broadcasters
            .write()
            .insert(device.clone(), Arc::clone(&broadcaster));
        subscriber.set_control_sender(broadcaster.control_sender());
        broadcaster.admit(subscriber);
        Ok(())
    }

    pub async fn evict(&self, device: &DeviceIdentifier, receipt_no: u8) {
        let Some(broadcaster) = self.broadcaster_for(device) else {
            return;
        };
        broadcaster.evict(receipt_no);
        if broadcaster.subscriber_count() == 0 {
            self.broadcasters.write().remove(device);
            self.tracks.write().remove(device);
            info!(%device, "last subscriber departed, tearing down broadcaster");
            broadcaster.teardown().await;
        }
    }

    /// Every 30 s: log broadcaster/subscriber counts, per §4.6, and evict any
    /// subscriber whose peer connection has reached `Failed` without having
    /// gone through the state-change callback's own eviction path yet.
    pub async fn run_housekeeping(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let broadcasters: Vec<(DeviceIdentifier, Arc<Broadcaster>)> = self
                .broadcasters
                .read()
                .iter()
                .map(|(device, b)| (device.clone(), Arc::clone(b)))
                .collect();
            let total_subscribers: usize = broadcasters.iter().map(|(_, b)| b.subscriber_count()).sum();
            info!(
                broadcaster_count = broadcasters.len(),
                total_subscribers, "housekeeping tick"
            );
            for (device, broadcaster) in broadcasters {
                for receipt_no in broadcaster.failed_subscriber_receipts() {
                    warn!(%device, receipt_no, "evicting failed subscriber during housekeeping");
                    self.evict(&device, receipt_no).await;
                }
            }
        }
    }

    /// Closes every peer connection; each broadcaster's `shutdown` drains its
    /// subscribers and cascades into driver teardown.
    pub async fn shutdown(&self) {
        let broadcasters: Vec<(DeviceIdentifier, Arc<Broadcaster>)> =
            self.broadcasters.write().drain().collect();
        self.tracks.write().clear();
        for (device, broadcaster) in broadcasters {
            warn!(%device, "shutting down broadcaster on process exit");
            broadcaster.shutdown().await;
        }
    }
}

/// The audio sender's RTCP feedback (receiver reports, NACKs) carries no
/// action for this broker — draining it just keeps the library's internal
/// buffers from filling up, per §5.
fn spawn_rtcp_drain(sender: Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>) {
    tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
}

async fn wait_for_connected(pc: &RTCPeerConnection) -> Result<()> {
    loop {
        match pc.connection_state() {
            RTCPeerConnectionState::Connected => return Ok(()),
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                return Err(AppError::Negotiation {
                    stage: "wait_connected".into(),
                    message: "peer connection failed before reaching Connected".into(),
                })
            }
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::transport::fake::FakeTransport;

    fn test_broker() -> Arc<Broker> {
        Broker::new(Config::default(), Arc::new(FakeTransport::default()))
    }

    #[test]
    fn receipt_numbers_cycle_modulo_max_clients_per_device() {
        let broker = test_broker();
        let device = DeviceIdentifier::new("android", "serial1", "127.0.0.1", 5555);

        let issued: Vec<u8> = (0..10).map(|_| broker.next_receipt_no(&device)).collect();

        assert_eq!(issued, vec![0u8, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn receipt_counters_are_independent_per_device() {
        let broker = test_broker();
        let a = DeviceIdentifier::new("android", "serial-a", "127.0.0.1", 5555);
        let b = DeviceIdentifier::new("android", "serial-b", "127.0.0.1", 5555);

        assert_eq!(broker.next_receipt_no(&a), 0);
        assert_eq!(broker.next_receipt_no(&a), 1);
        assert_eq!(broker.next_receipt_no(&b), 0);
    }
}
