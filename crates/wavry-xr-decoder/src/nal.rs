//! Annex-B bitstream inspection.

use wavry_xr::VideoCodec;

const H264_IDR: u8 = 5;
const H264_SPS: u8 = 7;
const H264_PPS: u8 = 8;

const HEVC_IDR_W_RADL: u8 = 19;
const HEVC_IDR_N_LP: u8 = 20;
const HEVC_VPS: u8 = 32;
const HEVC_SPS: u8 = 33;
const HEVC_PPS: u8 = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Parameter sets only.
    Config,
    /// Contains a keyframe slice, possibly after parameter sets.
    Idr,
    Delta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    /// Offset of the start code.
    pub offset: usize,
    pub start_code_len: usize,
    pub nal_type: u8,
}

/// Finds the next `00 00 01` or `00 00 00 01` at or after `from`.
fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

pub fn nal_type(codec: VideoCodec, header: u8) -> u8 {
    match codec {
        VideoCodec::H264 => header & 0x1F,
        VideoCodec::Hevc => (header >> 1) & 0x3F,
    }
}

pub fn is_config_type(codec: VideoCodec, nal_type: u8) -> bool {
    match codec {
        VideoCodec::H264 => matches!(nal_type, H264_SPS | H264_PPS),
        VideoCodec::Hevc => matches!(nal_type, HEVC_VPS | HEVC_SPS | HEVC_PPS),
    }
}

pub fn is_idr_type(codec: VideoCodec, nal_type: u8) -> bool {
    match codec {
        VideoCodec::H264 => nal_type == H264_IDR,
        VideoCodec::Hevc => matches!(nal_type, HEVC_IDR_W_RADL | HEVC_IDR_N_LP),
    }
}

pub struct NalUnits<'a> {
    data: &'a [u8],
    codec: VideoCodec,
    next: Option<(usize, usize)>,
}

impl Iterator for NalUnits<'_> {
    type Item = NalUnit;

    fn next(&mut self) -> Option<NalUnit> {
        loop {
            let (offset, start_code_len) = self.next.take()?;
            let header = offset + start_code_len;
            self.next = next_start_code(self.data, header);
            // A start code at the very end carries no header byte.
            if let Some(&byte) = self.data.get(header) {
                return Some(NalUnit {
                    offset,
                    start_code_len,
                    nal_type: nal_type(self.codec, byte),
                });
            }
        }
    }
}

pub fn nal_units(data: &[u8], codec: VideoCodec) -> NalUnits<'_> {
    NalUnits {
        data,
        codec,
        next: next_start_code(data, 0),
    }
}

/// Leading run of parameter set NAL units, used as codec specific data.
///
/// Empty unless the packet starts with a start code followed by a parameter set.
pub fn find_config_prefix(data: &[u8], codec: VideoCodec) -> &[u8] {
    let mut units = nal_units(data, codec);
    match units.next() {
        Some(first) if first.offset == 0 && is_config_type(codec, first.nal_type) => {}
        _ => return &[],
    }
    let end = units
        .find(|unit| !is_config_type(codec, unit.nal_type))
        .map_or(data.len(), |unit| unit.offset);
    &data[..end]
}

/// True when the first NAL unit is a parameter set.
pub fn is_config(data: &[u8], codec: VideoCodec) -> bool {
    nal_units(data, codec)
        .next()
        .is_some_and(|unit| is_config_type(codec, unit.nal_type))
}

pub fn is_idr(data: &[u8], codec: VideoCodec) -> bool {
    nal_units(data, codec).any(|unit| is_idr_type(codec, unit.nal_type))
}

pub fn classify(data: &[u8], codec: VideoCodec) -> PacketKind {
    let prefix = find_config_prefix(data, codec);
    if !prefix.is_empty() && prefix.len() == data.len() {
        PacketKind::Config
    } else if is_idr(&data[prefix.len()..], codec) {
        PacketKind::Idr
    } else {
        PacketKind::Delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H264_SPS_NAL: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F];
    const H264_PPS_NAL: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];
    const H264_IDR_NAL: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x00];
    const H264_P_NAL: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02];

    fn concat(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn test_h264_nal_types() {
        let data = concat(&[H264_SPS_NAL, H264_PPS_NAL, H264_IDR_NAL]);
        let types: Vec<u8> = nal_units(&data, VideoCodec::H264).map(|u| u.nal_type).collect();
        assert_eq!(types, vec![7, 8, 5]);
    }

    #[test]
    fn test_config_prefix_stops_at_slice() {
        let data = concat(&[H264_SPS_NAL, H264_PPS_NAL, H264_IDR_NAL]);
        let prefix = find_config_prefix(&data, VideoCodec::H264);
        assert_eq!(prefix.len(), H264_SPS_NAL.len() + H264_PPS_NAL.len());
        assert_eq!(classify(&data, VideoCodec::H264), PacketKind::Idr);
        assert!(is_idr(&data[prefix.len()..], VideoCodec::H264));
        assert!(!is_config(&data[prefix.len()..], VideoCodec::H264));
    }

    #[test]
    fn test_config_only_packet() {
        let data = concat(&[H264_SPS_NAL, H264_PPS_NAL]);
        assert_eq!(find_config_prefix(&data, VideoCodec::H264), &data[..]);
        assert_eq!(classify(&data, VideoCodec::H264), PacketKind::Config);
        assert!(is_config(&data, VideoCodec::H264));
    }

    #[test]
    fn test_delta_packet() {
        assert!(find_config_prefix(H264_P_NAL, VideoCodec::H264).is_empty());
        assert_eq!(classify(H264_P_NAL, VideoCodec::H264), PacketKind::Delta);
        assert!(!is_idr(H264_P_NAL, VideoCodec::H264));
    }

    #[test]
    fn test_hevc_types() {
        let vps = [0u8, 0, 0, 1, 0x40, 0x01, 0x0C];
        let sps = [0u8, 0, 0, 1, 0x42, 0x01, 0x01];
        let pps = [0u8, 0, 0, 1, 0x44, 0x01, 0xC1];
        let idr = [0u8, 0, 0, 1, 0x26, 0x01, 0xAF];
        let trail = [0u8, 0, 0, 1, 0x02, 0x01, 0xD0];

        let key = concat(&[&vps, &sps, &pps, &idr]);
        assert_eq!(find_config_prefix(&key, VideoCodec::Hevc).len(), 21);
        assert_eq!(classify(&key, VideoCodec::Hevc), PacketKind::Idr);
        assert_eq!(classify(&trail, VideoCodec::Hevc), PacketKind::Delta);
        // The same bytes read as H.264 are not parameter sets.
        assert!(find_config_prefix(&key, VideoCodec::H264).is_empty());
    }

    #[test]
    fn test_garbage_and_truncated_input() {
        assert!(find_config_prefix(&[], VideoCodec::H264).is_empty());
        assert_eq!(classify(&[0, 0, 1], VideoCodec::H264), PacketKind::Delta);
        assert_eq!(nal_units(&[0, 0, 0, 1], VideoCodec::Hevc).count(), 0);
        assert_eq!(classify(&[0xFF; 32], VideoCodec::H264), PacketKind::Delta);
    }

    #[test]
    fn test_config_must_lead() {
        let data = concat(&[&[0xAA, 0xBB], H264_SPS_NAL, H264_PPS_NAL]);
        assert!(find_config_prefix(&data, VideoCodec::H264).is_empty());
    }
}
