//! Annex-B NAL unit scanner (ITU-T H.264 / H.265 Annex B).
//!
//! Byte streams delimit NAL units with start codes:
//! - 4-byte: `0x00 0x00 0x00 0x01`
//! - 3-byte: `0x00 0x00 0x01`
//!
//! [`scan_annex_b`] turns one access unit into a [`FragmentationMap`]: the
//! ordered `(offset, length)` extents of every NAL unit, start codes
//! excluded. Offsets index into the original buffer, so the RTP layer can
//! payload NAL units without copying.
//!
//! Every entry later serves as a slice bound, so the map is checked against
//! the buffer length ([`FragmentationMap::validate`]) before it is used.

use crate::error::ScanError;

/// Maximum number of entries a map can hold (16-bit fragment count).
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// Extent of one NAL unit within a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: usize,
    pub length: usize,
}

impl Fragment {
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Ordered NAL unit extents for a single frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentationMap {
    fragments: Vec<Fragment>,
}

impl FragmentationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: usize, length: usize) {
        self.fragments.push(Fragment { offset, length });
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    /// Check that every entry lies within `[0, buffer_len]`.
    pub fn validate(&self, buffer_len: usize) -> Result<(), ScanError> {
        if self.fragments.len() > MAX_FRAGMENTS {
            return Err(ScanError::TooManyUnits {
                count: self.fragments.len(),
            });
        }
        for f in &self.fragments {
            let in_bounds = f
                .offset
                .checked_add(f.length)
                .is_some_and(|end| end <= buffer_len);
            if !in_bounds {
                return Err(ScanError::OutOfBounds {
                    offset: f.offset,
                    length: f.length,
                    buffer_len,
                });
            }
        }
        Ok(())
    }

    /// NAL unit slices of `buf`, in order. Call [`validate`](Self::validate) first.
    pub fn units<'a>(&'a self, buf: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.fragments
            .iter()
            .map(move |f| &buf[f.offset..f.offset + f.length])
    }
}

/// Scan an Annex-B buffer into a [`FragmentationMap`].
///
/// Zero-length units (back-to-back start codes) are recorded. Zero bytes
/// before the first start code (`leading_zero_8bits`) are tolerated, any
/// other leading byte is an error. The last unit runs to the end of the
/// buffer.
pub fn scan_annex_b(data: &[u8]) -> Result<FragmentationMap, ScanError> {
    if data.is_empty() {
        return Err(ScanError::Empty);
    }

    // (nal_data_start_index, start_code_length)
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;

    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i + 3, 3));
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i + 4, 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let Some(&(first_start, first_sc_len)) = starts.first() else {
        return Err(ScanError::MissingStartCode);
    };

    let leading = first_start - first_sc_len;
    if data[..leading].iter().any(|&b| b != 0) {
        return Err(ScanError::LeadingGarbage { len: leading });
    }

    if starts.len() > MAX_FRAGMENTS {
        return Err(ScanError::TooManyUnits {
            count: starts.len(),
        });
    }

    let mut map = FragmentationMap {
        fragments: Vec::with_capacity(starts.len()),
    };
    for (idx, &(start, _)) in starts.iter().enumerate() {
        let end = match starts.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        map.push(start, end - start);
    }

    tracing::trace!(
        nal_count = map.len(),
        frame_bytes = data.len(),
        "scanned Annex-B frame"
    );

    Ok(map)
}

/// H.264 NAL unit type (`nal_unit_type`, 5 bits).
pub fn h264_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// H.265 NAL unit type (6 bits after the forbidden zero bit).
pub fn h265_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3f)
}

/// H.264 VCL units are types 1..=5.
pub fn h264_is_vcl(nal: &[u8]) -> bool {
    matches!(h264_nal_type(nal), Some(1..=5))
}

/// H.264 IDR slice (type 5).
pub fn h264_is_idr(nal: &[u8]) -> bool {
    h264_nal_type(nal) == Some(5)
}

/// H.265 VCL units are types 0..=31.
pub fn h265_is_vcl(nal: &[u8]) -> bool {
    matches!(h265_nal_type(nal), Some(0..=31))
}

/// H.265 IRAP pictures (BLA/IDR/CRA, types 16..=23).
pub fn h265_is_irap(nal: &[u8]) -> bool {
    matches!(h265_nal_type(nal), Some(16..=23))
}
