use super::Payloader;
use super::nal::FragmentationMap;
use crate::error::{PacketizerError, Result};

/// VP8 codec header carried with each frame.
///
/// The default value mirrors an encoder that supplies no extra layering
/// information: no PictureID, no temporal layers, partition 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp8Header {
    /// Frame can be discarded without affecting later frames (N bit).
    pub non_reference: bool,
    /// 7- or 15-bit picture identifier.
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    /// Temporal layer index (2 bits).
    pub temporal_idx: Option<u8>,
    pub layer_sync: bool,
    /// Temporal key frame index (5 bits).
    pub key_idx: Option<u8>,
    /// Partition index (3 bits).
    pub partition_id: u8,
}

impl Vp8Header {
    /// Serialize the payload descriptor (RFC 7741 §4.2).
    ///
    /// ```text
    ///       0 1 2 3 4 5 6 7
    ///      +-+-+-+-+-+-+-+-+
    ///      |X|R|N|S|R| PID | (REQUIRED)
    ///      +-+-+-+-+-+-+-+-+
    /// X:   |I|L|T|K| RSV   | (OPTIONAL)
    ///      +-+-+-+-+-+-+-+-+
    /// I:   |M| PictureID   | (OPTIONAL)
    ///      +-+-+-+-+-+-+-+-+
    /// L:   |   TL0PICIDX   | (OPTIONAL)
    ///      +-+-+-+-+-+-+-+-+
    /// T/K: |TID|Y| KEYIDX  | (OPTIONAL)
    ///      +-+-+-+-+-+-+-+-+
    /// ```
    fn descriptor(&self, start_of_partition: bool) -> Vec<u8> {
        let has_tid = self.temporal_idx.is_some() || self.tl0_pic_idx.is_some();
        let extended = self.picture_id.is_some() || has_tid || self.key_idx.is_some();

        let mut first = self.partition_id & 0x07;
        if extended {
            first |= 0x80;
        }
        if self.non_reference {
            first |= 0x20;
        }
        if start_of_partition {
            first |= 0x10;
        }

        let mut out = vec![first];
        if !extended {
            return out;
        }

        let mut ext = 0u8;
        if self.picture_id.is_some() {
            ext |= 0x80;
        }
        if self.tl0_pic_idx.is_some() {
            ext |= 0x40;
        }
        if has_tid {
            ext |= 0x20;
        }
        if self.key_idx.is_some() {
            ext |= 0x10;
        }
        out.push(ext);

        if let Some(pid) = self.picture_id {
            if pid > 0x7f {
                let pid = pid & 0x7fff;
                out.push(0x80 | (pid >> 8) as u8);
                out.push(pid as u8);
            } else {
                out.push(pid as u8);
            }
        }
        if let Some(tl0) = self.tl0_pic_idx {
            out.push(tl0);
        }
        if has_tid || self.key_idx.is_some() {
            let tid = self.temporal_idx.unwrap_or(0) & 0x03;
            let y = if self.layer_sync { 0x20 } else { 0x00 };
            let key_idx = self.key_idx.unwrap_or(0) & 0x1f;
            out.push((tid << 6) | y | key_idx);
        }
        out
    }
}

impl Payloader for Vp8Header {
    fn codec_name(&self) -> &'static str {
        "VP8"
    }

    fn payload(
        &self,
        frame: &[u8],
        _fragmentation: Option<&FragmentationMap>,
        max_payload: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let descriptor_len = self.descriptor(true).len();
        if max_payload <= descriptor_len {
            return Err(PacketizerError::EngineRejected(format!(
                "payload budget {max_payload} too small for VP8 descriptor"
            )));
        }

        Ok(super::chunks_within(frame, max_payload - descriptor_len)
            .enumerate()
            .map(|(idx, chunk)| {
                let mut payload = self.descriptor(idx == 0);
                payload.extend_from_slice(chunk);
                payload
            })
            .collect())
    }
}
