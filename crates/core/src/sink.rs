//! Downstream media sink contract.
//!
//! A [`MediaSink`] receives finished RTP packets. A sink that can also hear
//! from the remote side exposes a [`FeedbackSource`], through which the
//! packetizer wires itself in as the [`RtcpFeedbackSink`].

use std::sync::Weak;

use crate::error::Result;

/// Consumer of raw RTCP coming back from the network.
pub trait RtcpFeedbackSink: Send + Sync {
    /// Hand over one compound RTCP packet. Returns the bytes consumed, or 0
    /// if the packet was rejected.
    fn deliver_feedback(&self, packet: &[u8]) -> usize;
}

pub trait FeedbackSource {
    fn set_feedback_sink(&self, sink: Option<Weak<dyn RtcpFeedbackSink>>);
}

pub trait MediaSink: Send + Sync {
    fn deliver_video_data(&self, packet: &[u8]) -> Result<()>;

    fn set_video_sink_ssrc(&self, ssrc: u32);

    fn feedback_source(&self) -> Option<&dyn FeedbackSource> {
        None
    }
}
