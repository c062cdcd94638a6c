//! Encoded video frames in, RTP out.
//!
//! [`VideoFramePacketizer`] sits between an encoder and an RTP engine. It
//! holds frames back until the first key frame, keeps the engine's payload
//! registration and the send bitrate bounds matched to the incoming codec
//! and resolution, and forwards the engine's packets to a [`MediaSink`].
//!
//! The crate also ships reference collaborators:
//!
//! - [`RtpRtcpSession`]: an RTP/RTCP engine with H.264, H.265, VP8 and VP9
//!   payloading, RED/ULPFEC, NACK retransmission and sender reports.
//! - [`SendSideBitrateController`]: a REMB and loss-driven bitrate controller.
//! - [`TaskRunner`]: a single-thread scheduler for periodic engine work.
//! - [`UdpSink`]: a UDP sink that also listens for RTCP feedback.

pub mod bitrate;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod frame;
pub mod media;
pub mod packetizer;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod transport;

pub use bitrate::{BitrateBounds, BitrateController, SendSideBitrateController};
pub use engine::{RtpEngine, RtpEngineFactory};
pub use error::{PacketizerError, Result, ScanError};
pub use feedback::{FeedbackListener, FeedbackMsg};
pub use frame::{Frame, FrameFormat, VideoFrameInfo};
pub use packetizer::{
    DropReason, FrameOutcome, PacketizerConfig, PacketizerState, PacketizerStatsSnapshot,
    VideoFramePacketizer,
};
pub use scheduler::{Module, Scheduler, TaskRunner};
pub use session::{RtpRtcpSession, SessionConfig};
pub use sink::{MediaSink, RtcpFeedbackSink};
pub use transport::{UdpSink, UdpSinkConfig};
