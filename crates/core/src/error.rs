//! Error types for the video packetizer library.

use std::fmt;

use crate::frame::FrameFormat;

/// Errors that can occur in the packetizer library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Configuration**: [`FormatMismatch`](Self::FormatMismatch),
///   [`UnsupportedFormat`](Self::UnsupportedFormat).
/// - **Bitstream**: [`Scan`](Self::Scan) for malformed Annex-B input,
///   [`MissingFragmentation`](Self::MissingFragmentation).
/// - **Engine**: [`EngineRejected`](Self::EngineRejected),
///   [`EngineUnavailable`](Self::EngineUnavailable),
///   [`UnregisteredPayloadType`](Self::UnregisteredPayloadType),
///   [`Rtcp`](Self::Rtcp).
/// - **Transport**: [`Io`](Self::Io).
#[derive(Debug, thiserror::Error)]
pub enum PacketizerError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested send format differs from the format of the incoming frames.
    /// The packetizer does not transcode.
    #[error("send format {requested:?} does not match input format {current:?}")]
    FormatMismatch {
        requested: FrameFormat,
        current: FrameFormat,
    },

    /// Format cannot be carried as RTP video (raw or unknown frames).
    #[error("format {0:?} cannot be sent as RTP video")]
    UnsupportedFormat(FrameFormat),

    /// The Annex-B scanner rejected the frame payload.
    #[error("NAL scan failed: {0}")]
    Scan(#[from] ScanError),

    /// H.264/H.265 payloads need a fragmentation map to be packetized.
    #[error("fragmentation map required for {0} payload")]
    MissingFragmentation(&'static str),

    /// The RTP engine refused a payload registration or an outgoing frame.
    #[error("RTP engine rejected request: {0}")]
    EngineRejected(String),

    /// The RTP engine handle has already been torn down.
    #[error("RTP engine not available")]
    EngineUnavailable,

    /// An outgoing frame referenced a payload type that was never registered.
    #[error("payload type {0} not registered")]
    UnregisteredPayloadType(u8),

    /// Failed to parse an inbound RTCP compound packet (RFC 3550 §6.1).
    #[error("RTCP parse error: {0}")]
    Rtcp(RtcpErrorKind),
}

/// Specific kind of Annex-B scan failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Input buffer was empty.
    Empty,
    /// No `00 00 01` / `00 00 00 01` start code anywhere in the buffer.
    MissingStartCode,
    /// Non-zero bytes precede the first start code.
    LeadingGarbage { len: usize },
    /// More NAL units than a fragmentation map can describe.
    TooManyUnits { count: usize },
    /// A fragmentation entry points outside the payload buffer.
    OutOfBounds {
        offset: usize,
        length: usize,
        buffer_len: usize,
    },
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty buffer"),
            Self::MissingStartCode => write!(f, "no start code found"),
            Self::LeadingGarbage { len } => {
                write!(f, "{len} bytes of garbage before first start code")
            }
            Self::TooManyUnits { count } => write!(f, "{count} NAL units exceed map capacity"),
            Self::OutOfBounds {
                offset,
                length,
                buffer_len,
            } => write!(
                f,
                "fragment {offset}+{length} exceeds buffer of {buffer_len} bytes"
            ),
        }
    }
}

impl std::error::Error for ScanError {}

/// Specific kind of RTCP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpErrorKind {
    /// Fewer than 4 bytes, or a compound packet with no complete packet in it.
    TooShort,
    /// Version field was not 2.
    InvalidVersion(u8),
    /// Length field points past the end of the buffer.
    LengthMismatch,
    /// Padding count is zero or larger than the packet body.
    InvalidPadding,
    /// A known packet type had a body too short for its fixed fields.
    Truncated(&'static str),
}

impl fmt::Display for RtcpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "packet too short"),
            Self::InvalidVersion(v) => write!(f, "invalid version {v}"),
            Self::LengthMismatch => write!(f, "length field exceeds buffer"),
            Self::InvalidPadding => write!(f, "invalid padding"),
            Self::Truncated(what) => write!(f, "truncated {what}"),
        }
    }
}

/// Convenience alias for `Result<T, PacketizerError>`.
pub type Result<T> = std::result::Result<T, PacketizerError>;
