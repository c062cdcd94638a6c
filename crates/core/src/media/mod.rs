//! Codec payload formats and RTP/RTCP wire helpers.
//!
//! This module turns one encoded frame into a list of RTP payloads, one per
//! packet, and provides the wire-level pieces the reference
//! [`RtpRtcpSession`](crate::session::RtpRtcpSession) is built from.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC | Fragmentation |
//! |-------|--------|-----|---------------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | Single NAL / FU-A |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) | Single NAL / FU |
//! | VP8 | [`vp8`] | [RFC 7741](https://tools.ietf.org/html/rfc7741) | Descriptor + split |
//! | VP9 | [`vp9`] | [draft-ietf-payload-vp9](https://datatracker.ietf.org/doc/draft-ietf-payload-vp9/) | Descriptor + split |
//!
//! H.264 and H.265 payloaders work from the [`nal::FragmentationMap`]
//! produced by the Annex-B scanner; VP8 and VP9 carry the frame as one
//! opaque blob.

pub mod fec;
pub mod h264;
pub mod h265;
pub mod nal;
pub mod rtcp;
pub mod rtp;
pub mod vp8;
pub mod vp9;

use crate::error::Result;
use nal::FragmentationMap;

pub use vp8::Vp8Header;
pub use vp9::Vp9Header;

/// Codec-specific RTP payloader.
///
/// Each supported codec implements this trait, splitting one encoded frame
/// into payloads no larger than `max_payload` bytes. The generic RTP header
/// is added by the caller; the last returned payload carries the marker bit.
pub trait Payloader {
    /// Encoding name (e.g. `"H264"`, `"VP8"`).
    fn codec_name(&self) -> &'static str;

    /// Split `frame` into RTP payloads.
    ///
    /// `fragmentation` is required for NAL-based codecs and ignored by the
    /// others. An empty frame yields no payloads.
    fn payload(
        &self,
        frame: &[u8],
        fragmentation: Option<&FragmentationMap>,
        max_payload: usize,
    ) -> Result<Vec<Vec<u8>>>;
}

/// Codec-specific part of the RTP video header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecHeader {
    Vp8(Vp8Header),
    Vp9(Vp9Header),
    H264,
    H265,
}

impl CodecHeader {
    /// Payloader for this codec.
    pub fn payloader(&self) -> &dyn Payloader {
        match self {
            Self::Vp8(h) => h,
            Self::Vp9(h) => h,
            Self::H264 => &h264::H264Payloader,
            Self::H265 => &h265::H265Payloader,
        }
    }

    /// Whether the payloader needs a fragmentation map.
    pub fn is_nal_based(&self) -> bool {
        matches!(self, Self::H264 | Self::H265)
    }
}

/// Per-frame RTP video header handed to the engine alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpVideoHeader {
    pub width: u32,
    pub height: u32,
    pub codec: CodecHeader,
}

impl RtpVideoHeader {
    pub fn new(codec: CodecHeader) -> Self {
        Self {
            width: 0,
            height: 0,
            codec,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Split `data` into consecutive chunks of at most `max` bytes.
fn chunks_within(data: &[u8], max: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(max.max(1))
}
