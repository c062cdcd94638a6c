//! H.265 (HEVC) RTP payloader (RFC 7798).
//!
//! Key differences from H.264 (RFC 6184):
//!
//! - **2-byte NAL unit header** (vs 1-byte in H.264).
//!   The NAL type is in bits 1..6 of the first byte.
//!
//! - **FU format** (§4.4.3): a 2-byte PayloadHdr with `Type=49` followed by
//!   a 1-byte FU header `[S|E|FuType]`, then the fragment data. The original
//!   2-byte NAL header is not repeated in the fragments.

use super::Payloader;
use super::nal::FragmentationMap;
use crate::error::{PacketizerError, Result};

/// Fragmentation unit NAL type (RFC 7798 §4.4.3).
const FU_TYPE: u8 = 49;
/// PayloadHdr (2 bytes) + FU header (1 byte).
const FU_OVERHEAD: usize = 3;
const NAL_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct H265Payloader;

impl H265Payloader {
    fn payload_nal(nal_unit: &[u8], max_payload: usize, out: &mut Vec<Vec<u8>>) {
        if nal_unit.is_empty() {
            return;
        }

        if nal_unit.len() <= max_payload || nal_unit.len() <= NAL_HEADER_LEN {
            out.push(nal_unit.to_vec());
            return;
        }

        let nal_type = (nal_unit[0] >> 1) & 0x3f;
        // Keep F and the high LayerId bit, replace Type with 49.
        let payload_hdr = [(nal_unit[0] & 0x81) | (FU_TYPE << 1), nal_unit[1]];
        let payload = &nal_unit[NAL_HEADER_LEN..];

        let max_fragment = max_payload - FU_OVERHEAD;
        let count = payload.len().div_ceil(max_fragment);

        for (idx, chunk) in super::chunks_within(payload, max_fragment).enumerate() {
            let start_bit = if idx == 0 { 0x80 } else { 0x00 };
            let end_bit = if idx + 1 == count { 0x40 } else { 0x00 };

            let mut fragment = Vec::with_capacity(FU_OVERHEAD + chunk.len());
            fragment.extend_from_slice(&payload_hdr);
            fragment.push(start_bit | end_bit | nal_type);
            fragment.extend_from_slice(chunk);
            out.push(fragment);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = count,
            "H.265 FU fragmented NAL unit"
        );
    }
}

impl Payloader for H265Payloader {
    fn codec_name(&self) -> &'static str {
        "H265"
    }

    fn payload(
        &self,
        frame: &[u8],
        fragmentation: Option<&FragmentationMap>,
        max_payload: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let map = fragmentation.ok_or(PacketizerError::MissingFragmentation("H265"))?;
        map.validate(frame.len())?;
        if max_payload <= FU_OVERHEAD {
            return Err(PacketizerError::EngineRejected(format!(
                "payload budget {max_payload} too small for H.265 FU"
            )));
        }

        let mut payloads = Vec::new();
        for nal in map.units(frame) {
            Self::payload_nal(nal, max_payload, &mut payloads);
        }
        Ok(payloads)
    }
}
