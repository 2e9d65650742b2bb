//! The scrcpy profile of the Driver Adapter: the three-socket handshake in
//! spec §4.2 and the per-stream reader tasks that turn it into channels the
//! Media Conditioner and Broadcaster can consume.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bitstream::Codec;
use crate::driver::transport::DeviceTransport;
use crate::driver::wire::{DeviceControlMessage, DeviceFrame};
use crate::error::{AppError, Result};

const DEVICE_NAME_LEN: usize = 64;
const CONTROL_CHANNEL_DEPTH: usize = 64;
const MEDIA_CHANNEL_DEPTH: usize = 128;

fn codec_from_fourcc(raw: [u8; 4]) -> Option<Codec> {
    match &raw {
        b"h264" => Some(Codec::H264),
        b"h265" | b"hevc" => Some(Codec::H265),
        _ => None,
    }
}

/// Everything the rest of the pipeline needs once the handshake completes.
pub struct DriverHandles {
    pub device_name: String,
    pub video_codec: Codec,
    pub initial_width: u16,
    pub initial_height: u16,
    pub video_rx: mpsc::Receiver<DeviceFrame>,
    pub audio_rx: mpsc::Receiver<DeviceFrame>,
    pub feedback_rx: mpsc::Receiver<DeviceControlMessage>,
    pub control_tx: mpsc::Sender<Bytes>,
    /// The reverse-tunnel SCID; needed again at teardown to call
    /// `reverse_remove`.
    pub scid: String,
    /// Abort handles for the four socket reader/writer tasks spawned here,
    /// so a caller tearing down the session can kill them without waiting
    /// on a TCP read to notice the device went away.
    pub task_handles: Vec<tokio::task::AbortHandle>,
}

/// Generates a fresh 31-bit SCID as lowercase hex, per §4.2 step 2.
fn generate_scid() -> String {
    let mut rng = rand::thread_rng();
    let value = rng.next_u32() & 0x7FFF_FFFF;
    format!("{value:08x}")
}

pub struct ScrcpyDriver;

impl ScrcpyDriver {
    /// Runs the full setup sequence: push, reverse tunnel, listener, server
    /// launch, three-connection accept, and spawns the reader/writer tasks.
    /// Any failure aborts the whole sequence and tears down what was already
    /// established.
    pub async fn start(
        serial: &str,
        remote_jar_path: &str,
        local_jar_path: &str,
        server_args: &[String],
        transport: Arc<dyn DeviceTransport>,
    ) -> Result<DriverHandles> {
        let scid = generate_scid();
        info!(serial, scid, "starting scrcpy driver adapter");

        transport
            .push(serial, local_jar_path, remote_jar_path)
            .await?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(AppError::Io)?;
        let host_port = listener.local_addr().map_err(AppError::Io)?.port();

        transport.reverse(serial, &scid, host_port).await?;

        if let Err(e) = transport
            .shell_start_server(serial, remote_jar_path, server_args)
            .await
        {
            let _ = transport.reverse_remove(serial, &scid).await;
            return Err(e);
        }

        let setup = Self::accept_three(&listener).await;
        if setup.is_err() {
            let _ = transport.reverse_remove(serial, &scid).await;
        }
        let (video_socket, device_name, video_codec, width, height, audio_socket, control_socket) =
            setup?;

        let (video_tx, video_rx) = mpsc::channel(MEDIA_CHANNEL_DEPTH);
        let (audio_tx, audio_rx) = mpsc::channel(MEDIA_CHANNEL_DEPTH);
        let (feedback_tx, feedback_rx) = mpsc::channel(CONTROL_CHANNEL_DEPTH);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_DEPTH);

        let video_task = tokio::spawn(read_media_stream(video_socket, video_tx, "video".to_string()));
        let audio_task = tokio::spawn(read_media_stream(audio_socket, audio_tx, "audio".to_string()));
        let (control_read_half, control_write_half) = control_socket.into_split();
        let control_read_task = tokio::spawn(read_control_stream(control_read_half, feedback_tx));
        let control_write_task = tokio::spawn(write_control_stream(control_write_half, control_rx));

        Ok(DriverHandles {
            device_name,
            video_codec,
            initial_width: width,
            initial_height: height,
            video_rx,
            audio_rx,
            feedback_rx,
            control_tx,
            scid,
            task_handles: vec![
                video_task.abort_handle(),
                audio_task.abort_handle(),
                control_read_task.abort_handle(),
                control_write_task.abort_handle(),
            ],
        })
    }

    #[allow(clippy::type_complexity)]
    async fn accept_three(
        listener: &TcpListener,
    ) -> Result<(TcpStream, String, Codec, u16, u16, TcpStream, TcpStream)> {
        let (mut video, _) = listener.accept().await.map_err(AppError::Io)?;
        let mut meta = [0u8; DEVICE_NAME_LEN + 4 + 8];
        video.read_exact(&mut meta).await.map_err(AppError::Io)?;
        let name_end = meta[..DEVICE_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DEVICE_NAME_LEN);
        let device_name = String::from_utf8_lossy(&meta[..name_end]).into_owned();
        let codec_bytes: [u8; 4] = meta[DEVICE_NAME_LEN..DEVICE_NAME_LEN + 4]
            .try_into()
            .expect("4 bytes");
        let video_codec = codec_from_fourcc(codec_bytes)
            .ok_or_else(|| AppError::Protocol("unrecognized video codec fourcc".into()))?;
        let width = u32::from_be_bytes(meta[68..72].try_into().expect("4 bytes")) as u16;
        let height = u32::from_be_bytes(meta[72..76].try_into().expect("4 bytes")) as u16;

        let (mut audio, _) = listener.accept().await.map_err(AppError::Io)?;
        let mut audio_codec_bytes = [0u8; 4];
        audio.read_exact(&mut audio_codec_bytes).await.map_err(AppError::Io)?;
        debug!(codec = ?audio_codec_bytes, "audio socket connected");

        let (control, _) = listener.accept().await.map_err(AppError::Io)?;

        Ok((video, device_name, video_codec, width, height, audio, control))
    }
}

async fn read_media_stream(mut socket: TcpStream, tx: mpsc::Sender<DeviceFrame>, label: String) {
    loop {
        let mut header = [0u8; 12];
        if let Err(e) = socket.read_exact(&mut header).await {
            warn!(stream = %label, error = %e, "media stream read failed, terminating");
            return;
        }
        let size = DeviceFrame::declared_size(&header) as usize;
        let mut payload = BytesMut::zeroed(size);
        if let Err(e) = socket.read_exact(&mut payload).await {
            warn!(stream = %label, error = %e, "media payload read failed, terminating");
            return;
        }
        let frame = DeviceFrame::from_header_and_payload(&header, payload.freeze());
        if tx.send(frame).await.is_err() {
            debug!(stream = %label, "receiver dropped, stopping reader");
            return;
        }
    }
}

async fn read_control_stream(
    mut socket: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::Sender<DeviceControlMessage>,
) {
    loop {
        let mut head = [0u8; 5];
        if let Err(e) = socket.read_exact(&mut head).await {
            warn!(error = %e, "control stream read failed, terminating");
            return;
        }
        let msg_type = head[0];
        let len = u32::from_be_bytes(head[1..5].try_into().expect("4 bytes")) as usize;
        let mut payload = BytesMut::zeroed(len);
        if let Err(e) = socket.read_exact(&mut payload).await {
            warn!(error = %e, "control payload read failed, terminating");
            return;
        }
        let message = DeviceControlMessage::from_type_and_payload(msg_type, payload.freeze());
        if tx.send(message).await.is_err() {
            return;
        }
    }
}

/// Single writer for the control socket, per the concurrency model's
/// serialization rule: all outbound control bytes pass through this one task.
async fn write_control_stream(
    mut socket: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = socket.write_all(&bytes).await {
            warn!(error = %e, "control write failed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scid_is_31_bit_hex() {
        for _ in 0..100 {
            let scid = generate_scid();
            assert_eq!(scid.len(), 8);
            let value = u32::from_str_radix(&scid, 16).unwrap();
            assert_eq!(value & 0x8000_0000, 0);
        }
    }

    #[test]
    fn recognizes_h264_and_h265_fourcc() {
        assert_eq!(codec_from_fourcc(*b"h264"), Some(Codec::H264));
        assert_eq!(codec_from_fourcc(*b"h265"), Some(Codec::H265));
        assert_eq!(codec_from_fourcc(*b"vp89"), None);
    }
}
