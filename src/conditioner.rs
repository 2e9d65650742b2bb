//! Media Conditioner: turns raw scrcpy `DeviceFrame`s into WebRTC-ready
//! samples, maintaining the parameter-set cache that lets a freshly-admitted
//! subscriber bootstrap off a synthesized keyframe.
//!
//! Modeled as a pure function `(DeviceFrame, &ParameterSetCache) ->
//! ConditionerOutcome` plus a driving loop: this keeps the branching logic
//! unit-testable without any socket or track machinery, the same separation
//! drawn elsewhere in this crate between the RTP packetizer
//! (`webrtc/h265_payloader.rs`) and the task that feeds it.

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use crate::bitstream::{classify, split, Codec, NalKind};
use crate::driver::wire::DeviceFrame;

const START_CODE: &[u8] = &[0, 0, 0, 1];

/// Cached parameter-set NALs (start-code-free) for one device's video stream.
/// The conditioner is the only writer; everyone else reads through
/// [`ParameterSetCache::snapshot`], which always copies.
#[derive(Debug, Default)]
pub struct ParameterSetCache {
    inner: RwLock<CacheInner>,
}

#[derive(Debug, Default, Clone)]
struct CacheInner {
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

/// A point-in-time copy of the cache, safe to hand to other tasks.
#[derive(Debug, Default, Clone)]
pub struct ParameterSetSnapshot {
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ParameterSetSnapshot {
        let guard = self.inner.read();
        ParameterSetSnapshot {
            vps: guard.vps.clone(),
            sps: guard.sps.clone(),
            pps: guard.pps.clone(),
        }
    }

    /// Updates whichever parameter-set slots are present in `update`, leaving
    /// the others untouched.
    fn update(&self, update: ParameterSetSnapshot) {
        let mut guard = self.inner.write();
        if update.vps.is_some() {
            guard.vps = update.vps;
        }
        if update.sps.is_some() {
            guard.sps = update.sps;
        }
        if update.pps.is_some() {
            guard.pps = update.pps;
        }
    }
}

/// What the driving loop should do with one incoming `DeviceFrame`.
#[derive(Debug, Clone)]
pub enum ConditionerOutcome {
    /// Emit this sample to the shared video track. `parameter_update` carries
    /// any parameter sets found in-band in this same access unit, so a
    /// keyframe that brings its own SPS/PPS still refreshes the cache for
    /// later IDRs that don't.
    EmitVideo {
        payload: Bytes,
        is_keyframe: bool,
        parameter_update: Option<ParameterSetSnapshot>,
    },
    /// Emit this sample to the shared audio track.
    EmitAudio { payload: Bytes },
    /// Refresh the parameter-set cache; nothing is written to a track.
    RefreshParameterSets(ParameterSetSnapshot),
    /// Drop the frame entirely (audio config frames).
    Drop,
}

/// Scans an access unit's NALs for parameter sets, returning a snapshot with
/// only the slots actually found set.
fn scan_parameter_sets(codec: Codec, nals: &[&[u8]]) -> ParameterSetSnapshot {
    let mut update = ParameterSetSnapshot::default();
    for nal in nals {
        match classify(codec, nal) {
            NalKind::Vps => update.vps = Some(Bytes::copy_from_slice(nal)),
            NalKind::Sps => update.sps = Some(Bytes::copy_from_slice(nal)),
            NalKind::Pps => update.pps = Some(Bytes::copy_from_slice(nal)),
            _ => {}
        }
    }
    update
}

/// Condition one video frame. Pure: takes a snapshot of the cache rather than
/// the cache itself, and never mutates anything — the driving loop applies
/// any parameter-set update (`RefreshParameterSets`, or `EmitVideo`'s
/// `parameter_update`) back onto the real cache via [`apply_outcome`].
pub fn condition_video(frame: &DeviceFrame, codec: Codec, cache: &ParameterSetSnapshot) -> ConditionerOutcome {
    let nals = split(&frame.payload);
    if nals.is_empty() {
        return ConditionerOutcome::Drop;
    }

    // NAL-type detection is authoritative over the wire `isKeyFrame` flag.
    // An access unit is a keyframe if ANY of its NALs is one, not just the
    // first — a combined unit commonly arrives as [SPS, PPS, IDR].
    let is_keyframe = nals.iter().any(|nal| classify(codec, nal).is_keyframe());

    if is_keyframe {
        let inline = scan_parameter_sets(codec, &nals);
        let pruned = crate::bitstream::prune_sei_aud(&frame.payload, codec);
        let mut out = BytesMut::new();
        if codec == Codec::H265 && inline.vps.is_none() {
            if let Some(vps) = &cache.vps {
                out.extend_from_slice(START_CODE);
                out.extend_from_slice(vps);
            }
        }
        if inline.sps.is_none() {
            if let Some(sps) = &cache.sps {
                out.extend_from_slice(START_CODE);
                out.extend_from_slice(sps);
            }
        }
        if inline.pps.is_none() {
            if let Some(pps) = &cache.pps {
                out.extend_from_slice(START_CODE);
                out.extend_from_slice(pps);
            }
        }
        out.extend_from_slice(&pruned);
        let parameter_update = (inline.vps.is_some() || inline.sps.is_some() || inline.pps.is_some())
            .then_some(inline);
        return ConditionerOutcome::EmitVideo {
            payload: out.freeze(),
            is_keyframe: true,
            parameter_update,
        };
    }

    if nals.iter().all(|nal| classify(codec, nal).is_parameter_set()) {
        return ConditionerOutcome::RefreshParameterSets(scan_parameter_sets(codec, &nals));
    }

    // Non-key frame: strip the leading start code so the media layer sees a
    // raw access unit.
    let stripped = strip_leading_start_code(&frame.payload);
    ConditionerOutcome::EmitVideo {
        payload: stripped,
        is_keyframe: false,
        parameter_update: None,
    }
}

/// Condition one audio frame: config frames are dropped, everything else is
/// forwarded as-is.
pub fn condition_audio(frame: &DeviceFrame) -> ConditionerOutcome {
    if frame.is_config {
        return ConditionerOutcome::Drop;
    }
    ConditionerOutcome::EmitAudio {
        payload: frame.payload.clone(),
    }
}

fn strip_leading_start_code(payload: &Bytes) -> Bytes {
    if payload.starts_with(&[0, 0, 0, 1]) {
        payload.slice(4..)
    } else if payload.starts_with(&[0, 0, 1]) {
        payload.slice(3..)
    } else {
        payload.clone()
    }
}

/// Applies a `ConditionerOutcome` to the real cache; call this from the
/// driving loop after every `condition_video` call.
pub fn apply_outcome(cache: &ParameterSetCache, outcome: &ConditionerOutcome) {
    match outcome {
        ConditionerOutcome::RefreshParameterSets(update) => cache.update(update.clone()),
        ConditionerOutcome::EmitVideo {
            parameter_update: Some(update),
            ..
        } => cache.update(update.clone()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal_with_start_code(bytes: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 1];
        v.extend_from_slice(bytes);
        v
    }

    fn frame(payload: Vec<u8>) -> DeviceFrame {
        DeviceFrame {
            pts_us: 1000,
            is_config: false,
            is_keyframe: false,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn h264_idr_prepends_cached_parameter_sets_and_sets_keyframe() {
        let cache = ParameterSetCache::new();
        cache.update(ParameterSetSnapshot {
            vps: None,
            sps: Some(Bytes::from_static(&[0x67, 1, 2])),
            pps: Some(Bytes::from_static(&[0x68, 3, 4])),
        });

        let idr_frame = frame(nal_with_start_code(&[0x65, 5, 6, 7]));
        let outcome = condition_video(&idr_frame, Codec::H264, &cache.snapshot());
        match outcome {
            ConditionerOutcome::EmitVideo {
                payload,
                is_keyframe,
                parameter_update,
            } => {
                assert!(is_keyframe);
                assert!(parameter_update.is_none());
                let nals = split(&payload);
                assert_eq!(nals, vec![&[0x67u8, 1, 2][..], &[0x68, 3, 4], &[0x65, 5, 6, 7]]);
            }
            other => panic!("expected EmitVideo, got {other:?}"),
        }
    }

    #[test]
    fn combined_access_unit_with_inline_sps_pps_idr_is_keyframe_in_order() {
        let mut payload = Vec::new();
        payload.extend(nal_with_start_code(&[0x67, 1, 2])); // SPS
        payload.extend(nal_with_start_code(&[0x68, 3, 4])); // PPS
        payload.extend(nal_with_start_code(&[0x65, 5, 6, 7])); // IDR

        let outcome = condition_video(&frame(payload), Codec::H264, &ParameterSetSnapshot::default());
        match outcome {
            ConditionerOutcome::EmitVideo {
                payload,
                is_keyframe,
                parameter_update,
            } => {
                assert!(is_keyframe);
                let update = parameter_update.expect("inline SPS/PPS should refresh the cache");
                assert!(update.sps.is_some());
                assert!(update.pps.is_some());
                let nals = split(&payload);
                assert_eq!(nals, vec![&[0x67u8, 1, 2][..], &[0x68, 3, 4], &[0x65, 5, 6, 7]]);
            }
            other => panic!("expected EmitVideo, got {other:?}"),
        }
    }

    #[test]
    fn parameter_set_only_frame_refreshes_cache_without_emitting() {
        let mut payload = Vec::new();
        payload.extend(nal_with_start_code(&[0x67, 1, 2]));
        payload.extend(nal_with_start_code(&[0x68, 3, 4]));

        let cache = ParameterSetCache::new();
        let outcome = condition_video(&frame(payload), Codec::H264, &cache.snapshot());
        match &outcome {
            ConditionerOutcome::RefreshParameterSets(update) => {
                assert!(update.sps.is_some());
                assert!(update.pps.is_some());
            }
            other => panic!("expected RefreshParameterSets, got {other:?}"),
        }
        apply_outcome(&cache, &outcome);
        let snap = cache.snapshot();
        assert!(snap.sps.is_some());
        assert!(snap.pps.is_some());
    }

    #[test]
    fn non_key_frame_strips_leading_start_code() {
        let payload = nal_with_start_code(&[0x41, 1, 2, 3]);
        let outcome = condition_video(&frame(payload), Codec::H264, &ParameterSetSnapshot::default());
        match outcome {
            ConditionerOutcome::EmitVideo {
                payload,
                is_keyframe,
                parameter_update,
            } => {
                assert!(!is_keyframe);
                assert!(parameter_update.is_none());
                assert_eq!(&payload[..], &[0x41, 1, 2, 3]);
            }
            other => panic!("expected EmitVideo, got {other:?}"),
        }
    }

    #[test]
    fn audio_config_frame_is_dropped() {
        let f = DeviceFrame {
            pts_us: 0,
            is_config: true,
            is_keyframe: false,
            payload: Bytes::from_static(b"opus-header"),
        };
        assert!(matches!(condition_audio(&f), ConditionerOutcome::Drop));
    }

    #[test]
    fn audio_normal_frame_is_forwarded() {
        let f = DeviceFrame {
            pts_us: 5000,
            is_config: false,
            is_keyframe: false,
            payload: Bytes::from_static(b"opus-packet"),
        };
        match condition_audio(&f) {
            ConditionerOutcome::EmitAudio { payload } => assert_eq!(&payload[..], b"opus-packet"),
            other => panic!("expected EmitAudio, got {other:?}"),
        }
    }
}
