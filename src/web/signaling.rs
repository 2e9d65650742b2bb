//! Signaling endpoint: the single WebSocket route that demultiplexes the
//! JSON/binary frame grammar of §4.7 into `Broker::admit`/`Broker::start`
//! calls.
//!
//! ```text
//! Browser --AgentConfig(json)--> handle_socket
//!        <--WebRtcInitFrame(json)--
//!        ...ICE/SDP settle on the peer connection itself...
//!        <--WebRtcMetaInfoFrame(json)--
//!        ...subsequent frames relayed by the data channels, not this loop...
//! ```

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::{info, warn};

use crate::state::AppState;
use crate::webrtc::signaling::{AgentConfig, Capabilities, MediaMeta, WebRtcInitFrame, WebRtcMetaInfoFrame};

pub async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let agent_config = match recv_agent_config(&mut socket).await {
        Some(config) => config,
        None => return,
    };

    let broker = Arc::clone(&state.broker);
    let (answer_sdp, device, subscriber) = match broker.admit(agent_config.clone()).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "admit failed");
            let _ = send_json(&mut socket, &e.to_signaling_envelope("webrtc_init")).await;
            return;
        }
    };

    let init_frame = WebRtcInitFrame::ok(answer_sdp);
    if send_json(&mut socket, &init_frame).await.is_err() {
        return;
    }

    let server_args = agent_config.server_args();
    if let Err(e) = broker
        .start(device.clone(), Arc::clone(&subscriber), server_args, agent_config.av_sync)
        .await
    {
        warn!(device = %device, error = %e, "start failed");
        let _ = send_json(&mut socket, &e.to_signaling_envelope("webrtc_metainfo")).await;
        return;
    }

    let media_meta = broker.media_meta(&device).unwrap_or(MediaMeta {
        video_mime_type: agent_config.driver_config.video_codec.clone(),
        video_payload_type: 0,
        audio_mime_type: agent_config.driver_config.audio_codec.clone(),
        width: 0,
        height: 0,
    });
    let meta_frame = WebRtcMetaInfoFrame::new(
        Capabilities {
            control_ordered: true,
            control_unordered: true,
            clipboard: true,
            uhid: true,
        },
        media_meta,
    );
    if send_json(&mut socket, &meta_frame).await.is_err() {
        return;
    }

    info!(device = %device, receipt_no = subscriber.receipt_no, "subscriber streaming");

    // The data channels carry every subsequent control/feedback frame; this
    // loop's only remaining job is noticing when the browser drops the
    // signaling connection, so we can evict promptly rather than waiting on
    // the peer connection's own (slower) failure detection.
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    broker.evict(&device, subscriber.receipt_no).await;
    info!(device = %device, "signaling connection closed, subscriber evicted");
}

async fn recv_agent_config(socket: &mut WebSocket) -> Option<AgentConfig> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str(&text) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        warn!(error = %e, "malformed AgentConfig frame");
                        None
                    }
                };
            }
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "signaling recv error before AgentConfig");
                return None;
            }
        }
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
