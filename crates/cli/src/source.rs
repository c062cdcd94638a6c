//! Annex-B file reader: splits a raw H.264/H.265 elementary stream into
//! access units that can be fed to the packetizer as frames.

use packetizer::FrameFormat;
use packetizer::Result;
use packetizer::media::nal;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Bytes scanned per pass; the scanner caps units per buffer.
const SCAN_WINDOW: usize = 1 << 20;

/// One picture's worth of NAL units, re-joined with 4-byte start codes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub key_frame: bool,
}

/// Split `data` into access units.
///
/// A new unit starts at a parameter set, SEI or delimiter following a coded
/// slice, or at a slice that begins a new picture. Trailing units with no
/// coded slice are discarded.
pub fn split_access_units(data: &[u8], format: FrameFormat) -> Result<Vec<AccessUnit>> {
    let mut out = Vec::new();
    let mut current = AccessUnit::default();
    let mut has_vcl = false;

    for unit in nal_units(data, SCAN_WINDOW)? {
        if unit.is_empty() {
            continue;
        }
        let kind = NalKind::classify(unit, format);
        if has_vcl && (kind.starts_access_unit || kind.first_slice) {
            out.push(std::mem::take(&mut current));
            has_vcl = false;
        }

        current.data.extend_from_slice(&START_CODE);
        current.data.extend_from_slice(unit);
        if kind.vcl {
            has_vcl = true;
            current.key_frame |= kind.key;
        }
    }
    if has_vcl {
        out.push(current);
    }

    tracing::debug!(
        access_units = out.len(),
        key_frames = out.iter().filter(|au| au.key_frame).count(),
        "input split"
    );
    Ok(out)
}

struct NalKind {
    vcl: bool,
    key: bool,
    /// First slice of a new picture.
    first_slice: bool,
    /// Non-VCL type that may only appear at the start of an access unit.
    starts_access_unit: bool,
}

impl NalKind {
    fn classify(unit: &[u8], format: FrameFormat) -> Self {
        match format {
            FrameFormat::H265 => {
                let vcl = nal::h265_is_vcl(unit);
                let nal_type = nal::h265_nal_type(unit).unwrap_or(0);
                Self {
                    vcl,
                    key: nal::h265_is_irap(unit),
                    // first_slice_segment_in_pic_flag
                    first_slice: vcl && unit.get(2).is_some_and(|b| b & 0x80 != 0),
                    starts_access_unit: matches!(nal_type, 32..=35 | 39 | 41..=44 | 48..=55),
                }
            }
            _ => {
                let vcl = nal::h264_is_vcl(unit);
                let nal_type = nal::h264_nal_type(unit).unwrap_or(0);
                Self {
                    vcl,
                    key: nal::h264_is_idr(unit),
                    // first_mb_in_slice == 0 is coded as a single `1` bit.
                    first_slice: vcl && unit.get(1).is_some_and(|b| b & 0x80 != 0),
                    starts_access_unit: matches!(nal_type, 6..=9 | 14..=18),
                }
            }
        }
    }
}

/// All NAL units of `data`, scanning `window` bytes at a time.
///
/// The last unit of each window may be cut short, so it is rescanned from
/// its start code in the next pass.
fn nal_units(data: &[u8], window: usize) -> Result<Vec<&[u8]>> {
    let mut units = Vec::new();
    let mut pos = 0usize;
    let mut size = window;

    while pos < data.len() {
        let end = (pos + size).min(data.len());
        let chunk = &data[pos..end];
        let map = nal::scan_annex_b(chunk)?;
        let fragments = map.fragments();

        if end == data.len() {
            units.extend(fragments.iter().map(|f| &chunk[f.offset..f.end()]));
            break;
        }
        if fragments.len() < 2 {
            size *= 2;
            continue;
        }

        let complete = &fragments[..fragments.len() - 1];
        units.extend(complete.iter().map(|f| &chunk[f.offset..f.end()]));
        if let Some(last) = complete.last() {
            pos += last.end();
        }
        size = window;
    }
    Ok(units)
}
