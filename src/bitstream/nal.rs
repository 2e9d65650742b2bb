//! NAL unit splitting and classification for H.264 and H.265 Annex-B streams.

use bytes::Bytes;

/// Video codec carried by a device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
}

/// Classification of a single NAL unit, independent of codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    Vps,
    Sps,
    Pps,
    Idr,
    NonIdr,
    Sei,
    Aud,
    Other(u8),
}

impl NalKind {
    pub fn is_keyframe(self) -> bool {
        matches!(self, NalKind::Idr)
    }

    pub fn is_parameter_set(self) -> bool {
        matches!(self, NalKind::Vps | NalKind::Sps | NalKind::Pps)
    }

    pub fn is_sei_or_aud(self) -> bool {
        matches!(self, NalKind::Sei | NalKind::Aud)
    }
}

/// Classify a single NAL unit body (start code already stripped) per the codec's
/// type-byte mask in §4.1.
pub fn classify(codec: Codec, nal: &[u8]) -> NalKind {
    if nal.is_empty() {
        return NalKind::Other(0);
    }
    match codec {
        Codec::H264 => match nal[0] & 0x1F {
            7 => NalKind::Sps,
            8 => NalKind::Pps,
            5 => NalKind::Idr,
            1 => NalKind::NonIdr,
            6 => NalKind::Sei,
            9 => NalKind::Aud,
            other => NalKind::Other(other),
        },
        Codec::H265 => match (nal[0] >> 1) & 0x3F {
            32 => NalKind::Vps,
            33 => NalKind::Sps,
            34 => NalKind::Pps,
            19 | 20 | 21 => NalKind::Idr,
            39 | 40 => NalKind::Sei,
            35 => NalKind::Aud,
            other => NalKind::Other(other),
        },
    }
}

/// Find the index of the next 3-byte start code (`00 00 01`) at or after `from`,
/// returning the offset of the first `0x00` of the marker.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < from + 3 {
        return None;
    }
    data[from..]
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|p| from + p)
}

/// Split an Annex-B payload into an ordered list of NAL unit bodies (start codes
/// stripped). Concatenating `startcode ++ nal[i]` for each returned slice
/// reproduces the input modulo a possible leading start-code offset, per §4.1.
pub fn split(payload: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let Some(mut marker) = find_start_code(payload, 0) else {
        return nals;
    };
    loop {
        let body_start = marker + 3;
        let next_marker = find_start_code(payload, body_start);
        let body_end = next_marker.unwrap_or(payload.len());
        if body_end > body_start {
            nals.push(&payload[body_start..body_end]);
        }
        match next_marker {
            Some(m) => marker = m,
            None => break,
        }
    }
    nals
}

/// Remove any SEI or AUD NAL units from `payload`, preserving order of all other
/// NALs and their start codes. Operates in a single pass, reusing the input
/// buffer's storage (no per-frame heap allocation beyond the `Bytes` slice view).
/// Returns the input unchanged if no start code is found.
pub fn prune_sei_aud(payload: &Bytes, codec: Codec) -> Bytes {
    if find_start_code(payload, 0).is_none() {
        return payload.clone();
    }

    let mut out = Vec::with_capacity(payload.len());
    let mut marker = find_start_code(payload, 0);
    while let Some(m) = marker {
        let body_start = m + 3;
        let next_marker = find_start_code(payload, body_start);
        let body_end = next_marker.unwrap_or(payload.len());
        let nal = &payload[body_start..body_end];
        if !nal.is_empty() && !classify(codec, nal).is_sei_or_aud() {
            out.extend_from_slice(&[0, 0, 1]);
            out.extend_from_slice(nal);
        }
        marker = next_marker;
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_start_code(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn split_recovers_each_nal() {
        let sps: &[u8] = &[0x67, 1, 2, 3];
        let pps: &[u8] = &[0x68, 4, 5];
        let idr: &[u8] = &[0x65, 6, 7, 8, 9];
        let payload = with_start_code(&[sps, pps, idr]);

        let nals = split(&payload);
        assert_eq!(nals, vec![sps, pps, idr]);
    }

    #[test]
    fn classify_h264_types() {
        assert_eq!(classify(Codec::H264, &[0x67]), NalKind::Sps);
        assert_eq!(classify(Codec::H264, &[0x68]), NalKind::Pps);
        assert_eq!(classify(Codec::H264, &[0x65]), NalKind::Idr);
        assert_eq!(classify(Codec::H264, &[0x41]), NalKind::NonIdr);
        assert_eq!(classify(Codec::H264, &[0x06]), NalKind::Sei);
        assert_eq!(classify(Codec::H264, &[0x09]), NalKind::Aud);
    }

    #[test]
    fn classify_h265_types() {
        assert_eq!(classify(Codec::H265, &[32 << 1]), NalKind::Vps);
        assert_eq!(classify(Codec::H265, &[33 << 1]), NalKind::Sps);
        assert_eq!(classify(Codec::H265, &[34 << 1]), NalKind::Pps);
        assert_eq!(classify(Codec::H265, &[19 << 1]), NalKind::Idr);
        assert_eq!(classify(Codec::H265, &[39 << 1]), NalKind::Sei);
        assert_eq!(classify(Codec::H265, &[35 << 1]), NalKind::Aud);
    }

    #[test]
    fn prune_removes_sei_and_aud_in_order() {
        let aud: &[u8] = &[35 << 1, 1];
        let vps: &[u8] = &[32 << 1, 2];
        let sps: &[u8] = &[33 << 1, 3];
        let pps: &[u8] = &[34 << 1, 4];
        let sei: &[u8] = &[40 << 1, 5];
        let idr: &[u8] = &[19 << 1, 6];
        let payload = Bytes::from(with_start_code(&[aud, vps, sps, pps, sei, idr]));

        let pruned = prune_sei_aud(&payload, Codec::H265);
        let expected = Bytes::from(with_start_code(&[vps, sps, pps, idr]));
        assert_eq!(pruned, expected);
    }

    #[test]
    fn prune_is_idempotent() {
        let sei: &[u8] = &[0x06, 1];
        let idr: &[u8] = &[0x65, 2];
        let payload = Bytes::from(with_start_code(&[sei, idr]));

        let once = prune_sei_aud(&payload, Codec::H264);
        let twice = prune_sei_aud(&once, Codec::H264);
        assert_eq!(once, twice);
    }

    #[test]
    fn prune_returns_input_unchanged_without_start_code() {
        let payload = Bytes::from_static(&[1, 2, 3, 4]);
        let pruned = prune_sei_aud(&payload, Codec::H264);
        assert_eq!(pruned, payload);
    }
}
