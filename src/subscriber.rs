//! Subscriber: one browser's WebRTC peer connection, per §4.4.
//!
//! State machine: `New -> Offered -> Answered -> Ready -> Streaming`, with
//! any of the last four states able to fall to `Terminated`. All terminal
//! transitions run the cleanup callback exactly once (`cleanup_fired`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::control::decode_control_event;
use crate::error::{AppError, Result};
use crate::state::DeviceIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    New,
    Offered,
    Answered,
    Ready,
    Streaming,
    Terminated,
}

pub struct Subscriber {
    pub device: DeviceIdentifier,
    pub receipt_no: u8,
    pub peer_connection: Arc<RTCPeerConnection>,
    state: RwLock<SubscriberState>,
    cleanup_fired: AtomicBool,
    last_pli_forwarded: Mutex<Option<Instant>>,
    /// Rebound once the device's broadcaster exists (see `Broker::start`);
    /// before that, events collected from the data channel are dropped —
    /// there is no device session to deliver them to yet.
    control_tx: RwLock<mpsc::Sender<Bytes>>,
    unordered_channel: RwLock<Option<Arc<RTCDataChannel>>>,
    ordered_channel: RwLock<Option<Arc<RTCDataChannel>>>,
}

impl Subscriber {
    /// `control_tx` forwards decoded `ControlEvent`-bearing bytes to the
    /// broadcaster's single device-control writer.
    pub fn new(
        device: DeviceIdentifier,
        receipt_no: u8,
        peer_connection: Arc<RTCPeerConnection>,
        control_tx: mpsc::Sender<Bytes>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            receipt_no,
            peer_connection,
            state: RwLock::new(SubscriberState::New),
            cleanup_fired: AtomicBool::new(false),
            last_pli_forwarded: Mutex::new(None),
            control_tx: RwLock::new(control_tx),
            unordered_channel: RwLock::new(None),
            ordered_channel: RwLock::new(None),
        })
    }

    /// Rebinds the control-event destination once the device's broadcaster
    /// (and its device-control socket) exists.
    pub fn set_control_sender(&self, control_tx: mpsc::Sender<Bytes>) {
        *self.control_tx.write() = control_tx;
    }

    /// Best-effort send of a feedback event over the unordered data channel,
    /// per §4.5's event fan-out discipline. A no-op if the channel hasn't
    /// opened yet or has since closed.
    pub async fn send_unordered(&self, payload: Bytes) {
        let channel = self.unordered_channel.read().clone();
        if let Some(channel) = channel {
            if let Err(e) = channel.send(&payload).await {
                debug!(device = %self.device, error = %e, "feedback send failed, dropping");
            }
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.read()
    }

    fn set_state(&self, new_state: SubscriberState) {
        *self.state.write() = new_state;
    }

    /// Sets the remote offer, creates an answer, waits for ICE gathering to
    /// complete, and returns the final local SDP.
    pub async fn negotiate(self: &Arc<Self>, offer_sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| AppError::Negotiation {
                stage: "set_remote".into(),
                message: e.to_string(),
            })?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::Negotiation {
                stage: "set_remote".into(),
                message: e.to_string(),
            })?;
        self.set_state(SubscriberState::Offered);

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation {
                stage: "create_answer".into(),
                message: e.to_string(),
            })?;

        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::Negotiation {
                stage: "set_local".into(),
                message: e.to_string(),
            })?;
        let _ = gather_complete.recv().await;
        self.set_state(SubscriberState::Answered);

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| AppError::Negotiation {
                stage: "set_local".into(),
                message: "no local description after gathering".into(),
            })?;
        self.set_state(SubscriberState::Ready);
        Ok(local_desc.sdp)
    }

    /// Wires the peer connection's state-change callback to `on_cleanup`, and
    /// both data channels' incoming-message callback to this subscriber's
    /// control dispatch.
    pub fn attach_callbacks<F>(self: &Arc<Self>, on_cleanup: F)
    where
        F: Fn(DeviceIdentifier, u8) + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        let on_cleanup = Arc::new(on_cleanup);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let this = Arc::clone(&this);
                let on_cleanup = Arc::clone(&on_cleanup);
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            this.set_state(SubscriberState::Streaming);
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            this.terminate(&on_cleanup);
                        }
                        _ => {}
                    }
                })
            }));

        let this = Arc::clone(self);
        self.peer_connection
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.wire_data_channel(dc);
                })
            }));
    }

    fn wire_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        match dc.label() {
            "control-unordered" => *self.unordered_channel.write() = Some(Arc::clone(&dc)),
            "control-ordered" => *self.ordered_channel.write() = Some(Arc::clone(&dc)),
            other => debug!(device = %self.device, label = other, "unrecognized data channel label"),
        }

        let this = Arc::clone(self);
        dc.on_message(Box::new(move |msg| {
            let this = Arc::clone(&this);
            let data = msg.data.clone();
            Box::pin(async move {
                match decode_control_event(data) {
                    Ok(event) => {
                        if let Some(bytes) = event.encode() {
                            let sender = this.control_tx.read().clone();
                            if sender.send(bytes).await.is_err() {
                                warn!(device = %this.device, "control channel closed, dropping event");
                            }
                        }
                    }
                    Err(e) => debug!(device = %this.device, error = %e, "dropped malformed control frame"),
                }
            })
        }));
    }

    fn terminate<F>(self: &Arc<Self>, on_cleanup: &F)
    where
        F: Fn(DeviceIdentifier, u8) + Send + Sync,
    {
        if self
            .cleanup_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.set_state(SubscriberState::Terminated);
            on_cleanup(self.device.clone(), self.receipt_no);
        }
    }

    pub async fn close(self: &Arc<Self>) {
        let _ = self.peer_connection.close().await;
        self.set_state(SubscriberState::Terminated);
    }

    /// Registers the RTCP reader on the video sender; every `PictureLossIndication`
    /// is relayed to `on_pli` (expected to be the broadcaster's de-duplicated
    /// `RequestIDR` path), at most once every second from this subscriber's
    /// own vantage point as a cheap local pre-filter — the authoritative
    /// de-dup lives in the broadcaster (§9).
    pub fn spawn_rtcp_reader<F>(self: &Arc<Self>, sender: Arc<RTCRtpSender>, on_pli: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let packets = match sender.read_rtcp().await {
                    Ok((packets, _attrs)) => packets,
                    Err(_) => return,
                };
                for packet in packets {
                    if packet
                        .as_any()
                        .downcast_ref::<PictureLossIndication>()
                        .is_some()
                    {
                        let should_forward = {
                            let mut last = this.last_pli_forwarded.lock();
                            crate::utils::dedup_allows(&mut last, Instant::now(), Duration::from_secs(1))
                        };
                        if should_forward {
                            on_pli();
                        }
                    }
                }
            }
        });
    }
}

/// The two control data channels' init parameters, per §4.4.
pub fn ordered_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    }
}

pub fn unordered_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(false),
        max_retransmits: Some(0),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unordered_channel_is_unordered_with_no_retransmits() {
        let init = unordered_channel_init();
        assert_eq!(init.ordered, Some(false));
        assert_eq!(init.max_retransmits, Some(0));
    }

    #[test]
    fn ordered_channel_is_ordered() {
        let init = ordered_channel_init();
        assert_eq!(init.ordered, Some(true));
    }
}
