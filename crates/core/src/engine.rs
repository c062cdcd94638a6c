//! Contract between the packetizer and an RTP/RTCP engine.
//!
//! The engine owns sequence numbers, payloading, retransmission and RTCP. The
//! packetizer hands it whole frames via [`RtpEngine::send_outgoing_data`] and
//! receives the resulting packets back through the [`Transport`] it supplied
//! at construction.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::bitrate::RtcpBandwidthObserver;
use crate::error::Result;
use crate::media::RtpVideoHeader;
use crate::media::nal::FragmentationMap;
use crate::scheduler::Module;

/// Frame classification passed to the engine. Every frame is handed over
/// as a key frame; the engine does not distinguish further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Key,
}

/// One encoded frame handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingFrame<'a> {
    pub kind: FrameKind,
    pub payload_type: u8,
    pub timestamp: u32,
    pub capture_time_ms: i64,
    pub payload: &'a [u8],
    /// NAL unit boundaries. Present for H.264 and H.265 only.
    pub fragmentation: Option<&'a FragmentationMap>,
    pub header: &'a RtpVideoHeader,
}

/// Send-side payload registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    pub name: &'static str,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FecConfig {
    /// Wrap media in RED and emit ULPFEC for every frame.
    pub generic_fec: bool,
    pub red_payload_type: Option<u8>,
    pub ulpfec_payload_type: Option<u8>,
}

/// Kind of data an engine writes to its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Video,
    Audio,
}

/// Outgoing packet path of an engine.
pub trait Transport: Send + Sync {
    fn send_rtp(&self, packet: &[u8]) -> Result<usize>;

    fn send_rtcp(&self, packet: &[u8]) -> Result<usize>;
}

/// Notified when a remote peer asks for a key frame (PLI or FIR).
pub trait IntraFrameObserver: Send + Sync {
    fn on_received_intra_frame_request(&self, ssrc: u32);
}

pub trait RtpEngine: Module + Send + Sync {
    fn ssrc(&self) -> u32;

    fn register_send_payload(&self, codec: &CodecDescriptor) -> Result<()>;

    fn send_outgoing_data(&self, frame: OutgoingFrame<'_>) -> Result<()>;

    /// Process a compound RTCP packet. Returns the number of bytes consumed.
    fn incoming_rtcp_packet(&self, packet: &[u8]) -> Result<usize>;

    fn set_fec_status(&self, config: FecConfig);

    fn set_remb_status(&self, enabled: bool);

    /// Keep sent packets for `history` so they can be retransmitted on NACK.
    fn set_store_packets_status(&self, enabled: bool, history: Duration);
}

/// Collaborators an engine is built with.
pub struct RtpEngineConfig {
    pub outgoing_transport: Arc<dyn Transport>,
    pub intra_frame_observer: Option<Weak<dyn IntraFrameObserver>>,
    pub bandwidth_observer: Option<Arc<dyn RtcpBandwidthObserver>>,
}

pub trait RtpEngineFactory {
    fn create(&self, config: RtpEngineConfig) -> Result<Arc<dyn RtpEngine>>;
}

impl<F> RtpEngineFactory for F
where
    F: Fn(RtpEngineConfig) -> Result<Arc<dyn RtpEngine>>,
{
    fn create(&self, config: RtpEngineConfig) -> Result<Arc<dyn RtpEngine>> {
        self(config)
    }
}
