use super::Payloader;
use super::nal::FragmentationMap;
use crate::error::{PacketizerError, Result};

/// VP9 codec header carried with each frame (non-flexible mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp9Header {
    /// Frame references an earlier picture (P bit).
    pub inter_pic_predicted: bool,
    /// 7- or 15-bit picture identifier.
    pub picture_id: Option<u16>,
    /// Temporal layer index (3 bits).
    pub temporal_idx: Option<u8>,
    /// Spatial layer index (3 bits).
    pub spatial_idx: Option<u8>,
    pub temporal_up_switch: bool,
    pub inter_layer_predicted: bool,
    pub tl0_pic_idx: Option<u8>,
    /// Not used as reference by upper spatial layers (Z bit).
    pub not_upper_layer_reference: bool,
}

impl Vp9Header {
    /// Serialize the payload descriptor (draft-ietf-payload-vp9 §4.2).
    ///
    /// ```text
    ///       0 1 2 3 4 5 6 7
    ///      +-+-+-+-+-+-+-+-+
    ///      |I|P|L|F|B|E|V|Z| (REQUIRED)
    ///      +-+-+-+-+-+-+-+-+
    /// I:   |M| PICTURE ID  | (OPTIONAL)
    ///      +-+-+-+-+-+-+-+-+
    /// L:   |  T  |U|  S  |D| (OPTIONAL)
    ///      +-+-+-+-+-+-+-+-+
    ///      |   TL0PICIDX   | (non-flexible mode only)
    ///      +-+-+-+-+-+-+-+-+
    /// ```
    fn descriptor(&self, beginning_of_frame: bool, end_of_frame: bool) -> Vec<u8> {
        let has_layers = self.temporal_idx.is_some() || self.spatial_idx.is_some();

        let mut first = 0u8;
        if self.picture_id.is_some() {
            first |= 0x80;
        }
        if self.inter_pic_predicted {
            first |= 0x40;
        }
        if has_layers {
            first |= 0x20;
        }
        if beginning_of_frame {
            first |= 0x08;
        }
        if end_of_frame {
            first |= 0x04;
        }
        if self.not_upper_layer_reference {
            first |= 0x01;
        }

        let mut out = vec![first];
        if let Some(pid) = self.picture_id {
            if pid > 0x7f {
                let pid = pid & 0x7fff;
                out.push(0x80 | (pid >> 8) as u8);
                out.push(pid as u8);
            } else {
                out.push(pid as u8);
            }
        }
        if has_layers {
            let t = self.temporal_idx.unwrap_or(0) & 0x07;
            let s = self.spatial_idx.unwrap_or(0) & 0x07;
            let u = if self.temporal_up_switch { 0x10 } else { 0x00 };
            let d = if self.inter_layer_predicted { 0x01 } else { 0x00 };
            out.push((t << 5) | u | (s << 1) | d);
            out.push(self.tl0_pic_idx.unwrap_or(0));
        }
        out
    }
}

impl Payloader for Vp9Header {
    fn codec_name(&self) -> &'static str {
        "VP9"
    }

    fn payload(
        &self,
        frame: &[u8],
        _fragmentation: Option<&FragmentationMap>,
        max_payload: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let descriptor_len = self.descriptor(true, true).len();
        if max_payload <= descriptor_len {
            return Err(PacketizerError::EngineRejected(format!(
                "payload budget {max_payload} too small for VP9 descriptor"
            )));
        }

        let max_chunk = max_payload - descriptor_len;
        let count = frame.len().div_ceil(max_chunk);
        Ok(super::chunks_within(frame, max_chunk)
            .enumerate()
            .map(|(idx, chunk)| {
                let mut payload = self.descriptor(idx == 0, idx + 1 == count);
                payload.extend_from_slice(chunk);
                payload
            })
            .collect())
    }
}
