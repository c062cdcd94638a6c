//! Encoded video frames as handed over by the upstream encoder.

/// Payload type for VP8 at 90 kHz.
pub const VP8_90000_PT: u8 = 100;
/// Payload type for VP9 at 90 kHz.
pub const VP9_90000_PT: u8 = 101;
/// Payload type for H.264 at 90 kHz.
pub const H264_90000_PT: u8 = 127;
/// Payload type for H.265 at 90 kHz.
pub const H265_90000_PT: u8 = 121;
/// RED (RFC 2198) payload type.
pub const RED_90000_PT: u8 = 116;
/// ULPFEC (RFC 5109) payload type.
pub const ULP_90000_PT: u8 = 117;

/// RTP clock rate shared by every video format (RFC 3551 §5).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Encoding of a frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// Nothing received yet.
    #[default]
    Unknown,
    /// Raw planar YUV. Never sent as RTP video.
    I420,
    Vp8,
    Vp9,
    H264,
    H265,
}

impl FrameFormat {
    /// Static RTP payload type mapping, `None` for formats that are never sent.
    pub fn payload_type(self) -> Option<u8> {
        match self {
            Self::Vp8 => Some(VP8_90000_PT),
            Self::Vp9 => Some(VP9_90000_PT),
            Self::H264 => Some(H264_90000_PT),
            Self::H265 => Some(H265_90000_PT),
            Self::I420 | Self::Unknown => None,
        }
    }

    /// Encoding name as it appears in `a=rtpmap`.
    pub fn codec_name(self) -> Option<&'static str> {
        match self {
            Self::Vp8 => Some("VP8"),
            Self::Vp9 => Some("VP9"),
            Self::H264 => Some("H264"),
            Self::H265 => Some("H265"),
            Self::I420 | Self::Unknown => None,
        }
    }
}

/// Per-frame video metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoFrameInfo {
    pub width: u32,
    pub height: u32,
    pub is_key_frame: bool,
}

/// One complete encoded frame. The payload is borrowed for the duration of
/// a single [`on_frame`](crate::VideoFramePacketizer::on_frame) call.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub format: FrameFormat,
    pub payload: &'a [u8],
    /// 90 kHz RTP timestamp, wrapping.
    pub timestamp: u32,
    pub info: VideoFrameInfo,
}

impl<'a> Frame<'a> {
    pub fn new(format: FrameFormat, payload: &'a [u8], timestamp: u32) -> Self {
        Self {
            format,
            payload,
            timestamp,
            info: VideoFrameInfo::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.info.width = width;
        self.info.height = height;
        self
    }

    pub fn key_frame(mut self, is_key_frame: bool) -> Self {
        self.info.is_key_frame = is_key_frame;
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Capture time in milliseconds derived from the 90 kHz timestamp.
    pub fn capture_time_ms(&self) -> i64 {
        i64::from(self.timestamp / 90)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_and_unknown_have_no_payload_type() {
        assert_eq!(FrameFormat::I420.payload_type(), None);
        assert_eq!(FrameFormat::Unknown.payload_type(), None);
        assert_eq!(FrameFormat::H264.payload_type(), Some(H264_90000_PT));
    }

    #[test]
    fn capture_time_scales_timestamp() {
        let frame = Frame::new(FrameFormat::Vp8, &[], 90_000);
        assert_eq!(frame.capture_time_ms(), 1000);
    }

    #[test]
    fn builder_sets_info() {
        let frame = Frame::new(FrameFormat::H264, &[1, 2], 0)
            .with_size(640, 480)
            .key_frame(true);
        assert_eq!(frame.info.width, 640);
        assert_eq!(frame.info.height, 480);
        assert!(frame.info.is_key_frame);
        assert_eq!(frame.len(), 2);
    }
}
