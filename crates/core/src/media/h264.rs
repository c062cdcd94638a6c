use super::Payloader;
use super::nal::FragmentationMap;
use crate::error::{PacketizerError, Result};

/// FU-A NAL unit type (RFC 6184 §5.8).
const FU_A: u8 = 28;
/// FU indicator + FU header.
const FU_A_OVERHEAD: usize = 2;

/// H.264 RTP payloader (RFC 6184, packetization-mode=1).
///
/// Works from the fragmentation map produced by
/// [`scan_annex_b`](super::nal::scan_annex_b):
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the payload budget are
///   sent as-is in a single RTP packet.
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the budget are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to max_payload - 2 bytes)
///   ```
///
///   - **S** (start): set on the first fragment
///   - **E** (end): set on the last fragment
///   - **NAL_Type**: the original NAL unit type from the first byte
///
/// Zero-length entries in the map produce no packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct H264Payloader;

impl H264Payloader {
    /// Payload a single NAL unit into one or more RTP payloads.
    fn payload_nal(nal_unit: &[u8], max_payload: usize, out: &mut Vec<Vec<u8>>) {
        if nal_unit.is_empty() {
            return;
        }

        if nal_unit.len() <= max_payload {
            out.push(nal_unit.to_vec());
            return;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        let fu_indicator = (nal_header & 0xe0) | FU_A;
        let payload = &nal_unit[1..];

        let max_fragment = max_payload - FU_A_OVERHEAD;
        let count = payload.len().div_ceil(max_fragment);

        for (idx, chunk) in super::chunks_within(payload, max_fragment).enumerate() {
            let start_bit = if idx == 0 { 0x80 } else { 0x00 };
            let end_bit = if idx + 1 == count { 0x40 } else { 0x00 };

            let mut fragment = Vec::with_capacity(FU_A_OVERHEAD + chunk.len());
            fragment.push(fu_indicator);
            fragment.push(start_bit | end_bit | nal_type);
            fragment.extend_from_slice(chunk);
            out.push(fragment);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = count,
            "FU-A fragmented NAL unit"
        );
    }
}

impl Payloader for H264Payloader {
    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn payload(
        &self,
        frame: &[u8],
        fragmentation: Option<&FragmentationMap>,
        max_payload: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let map = fragmentation.ok_or(PacketizerError::MissingFragmentation("H264"))?;
        map.validate(frame.len())?;
        if max_payload <= FU_A_OVERHEAD {
            return Err(PacketizerError::EngineRejected(format!(
                "payload budget {max_payload} too small for FU-A"
            )));
        }

        let mut payloads = Vec::new();
        for nal in map.units(frame) {
            Self::payload_nal(nal, max_payload, &mut payloads);
        }
        Ok(payloads)
    }
}
