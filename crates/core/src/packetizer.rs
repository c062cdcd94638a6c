//! Frame-to-RTP packetizer.
//!
//! [`VideoFramePacketizer`] accepts complete encoded frames, gates them on
//! the first key frame, keeps the engine's payload registration and the send
//! bitrate bounds in step with the incoming codec and resolution, and hands
//! each frame to an [`RtpEngine`]. Packets the engine produces come back
//! through [`receive_rtp_data`](VideoFramePacketizer::receive_rtp_data) and
//! go out to the bound [`MediaSink`].
//!
//! ## Gate
//!
//! ```text
//! Uninitialized ──new()──► AwaitingKeyFrame ──key frame──► Streaming
//!                               │  ▲                          │  ▲
//!                   delta frame │  │ key-frame request        └──┘ codec / size change
//!                               └──┘
//! ```
//!
//! The gate opens once and never closes again, not even across
//! [`enable(false)`](VideoFramePacketizer::enable) / `enable(true)`.
//!
//! ## Locking
//!
//! The engine handle and the sink binding sit behind two independent
//! `RwLock`s. Sending holds the engine lock for reading, and the engine's
//! transport callback then takes the sink lock for reading. The order is
//! always engine → sink.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::bitrate::{BitrateBounds, BitrateController, DEFAULT_START_BITRATE_BPS, NetworkObserver};
use crate::engine::{
    CodecDescriptor, DataType, FecConfig, FrameKind, IntraFrameObserver, OutgoingFrame, RtpEngine,
    RtpEngineConfig, RtpEngineFactory, Transport,
};
use crate::error::{PacketizerError, Result, ScanError};
use crate::feedback::{FeedbackChannel, FeedbackListener};
use crate::frame::{
    Frame, FrameFormat, H264_90000_PT, H265_90000_PT, RED_90000_PT, ULP_90000_PT, VIDEO_CLOCK_RATE,
    VP8_90000_PT, VP9_90000_PT,
};
use crate::media::nal::{self, FragmentationMap};
use crate::media::{CodecHeader, RtpVideoHeader, Vp8Header, Vp9Header};
use crate::scheduler::{Module, Scheduler};
use crate::sink::{MediaSink, RtcpFeedbackSink};

/// How long sent packets stay available for NACK retransmission.
pub const DEFAULT_NACK_HISTORY: Duration = Duration::from_millis(600);

/// Packetizer construction options.
#[derive(Debug, Clone)]
pub struct PacketizerConfig {
    /// RED payload type handed to the engine. `None` disables RED.
    pub red_payload_type: Option<u8>,
    /// ULPFEC payload type handed to the engine. `None` disables ULPFEC.
    pub ulpfec_payload_type: Option<u8>,
    /// Minimum spacing between key-frame requests. `None` sends every one.
    pub key_frame_request_interval: Option<Duration>,
    pub nack_history: Duration,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            red_payload_type: Some(RED_90000_PT),
            ulpfec_payload_type: Some(ULP_90000_PT),
            key_frame_request_interval: None,
            nack_history: DEFAULT_NACK_HISTORY,
        }
    }
}

/// Where the packetizer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketizerState {
    /// Engine not installed yet.
    Uninitialized,
    /// Dropping frames until the first key frame.
    AwaitingKeyFrame,
    Streaming,
    /// Torn down by [`close`](VideoFramePacketizer::close).
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The Annex-B payload could not be split into NAL units.
    ScanFailed,
    /// The engine refused the frame or is gone.
    SendFailed,
    /// Raw or unknown format.
    Unsupported,
}

/// Result of [`VideoFramePacketizer::on_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent,
    Disabled,
    /// Non-key frame before the first key frame; a key frame was requested.
    AwaitingKeyFrame,
    Dropped(DropReason),
}

#[derive(Debug, Default)]
struct PacketizerStats {
    frames_sent: AtomicU64,
    frames_gated: AtomicU64,
    scan_failures: AtomicU64,
    send_failures: AtomicU64,
    unsupported_frames: AtomicU64,
    codec_registrations: AtomicU64,
}

/// Point-in-time copy of the packetizer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketizerStatsSnapshot {
    pub frames_sent: u64,
    pub frames_gated: u64,
    pub scan_failures: u64,
    pub send_failures: u64,
    pub unsupported_frames: u64,
    pub codec_registrations: u64,
    pub key_frame_requests: u64,
    pub key_frame_requests_suppressed: u64,
}

/// Codec and resolution of the most recent frame.
#[derive(Debug, Clone, Copy, Default)]
struct CodecState {
    format: FrameFormat,
    width: u32,
    height: u32,
}

/// Outgoing transport handed to the engine: loops packets back into the
/// packetizer, which forwards them to the bound sink.
struct LoopbackTransport {
    packetizer: Weak<VideoFramePacketizer>,
}

impl Transport for LoopbackTransport {
    fn send_rtp(&self, packet: &[u8]) -> Result<usize> {
        if let Some(packetizer) = self.packetizer.upgrade() {
            packetizer.receive_rtp_data(packet, DataType::Video, 0);
        }
        Ok(packet.len())
    }

    fn send_rtcp(&self, packet: &[u8]) -> Result<usize> {
        self.send_rtp(packet)
    }
}

/// Turns encoded video frames into RTP through an [`RtpEngine`].
///
/// See the [module docs](self) for the key-frame gate and lock ordering.
pub struct VideoFramePacketizer {
    config: PacketizerConfig,
    self_ref: Weak<VideoFramePacketizer>,
    rtp_rtcp: RwLock<Option<Arc<dyn RtpEngine>>>,
    /// Engine SSRC, cached so binding never touches the engine lock.
    ssrc: AtomicU32,
    sink: RwLock<Option<Box<dyn MediaSink>>>,
    codec: Mutex<CodecState>,
    enabled: AtomicBool,
    key_frame_arrived: AtomicBool,
    closed: AtomicBool,
    feedback: FeedbackChannel,
    bitrate_controller: Arc<dyn BitrateController>,
    scheduler: Arc<dyn Scheduler>,
    stats: PacketizerStats,
}

impl VideoFramePacketizer {
    /// Build a packetizer and its engine.
    ///
    /// The packetizer registers itself as the controller's network observer,
    /// resets the controller to a 300 kbps start rate with no bounds, creates
    /// the engine (FEC off, REMB on, NACK storage on) and registers it with
    /// `scheduler`.
    pub fn new(
        config: PacketizerConfig,
        engine_factory: &dyn RtpEngineFactory,
        bitrate_controller: Arc<dyn BitrateController>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>> {
        let this = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            feedback: FeedbackChannel::new(config.key_frame_request_interval),
            config: config.clone(),
            self_ref: weak.clone(),
            rtp_rtcp: RwLock::new(None),
            ssrc: AtomicU32::new(0),
            sink: RwLock::new(None),
            codec: Mutex::new(CodecState::default()),
            enabled: AtomicBool::new(true),
            key_frame_arrived: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            bitrate_controller,
            scheduler,
            stats: PacketizerStats::default(),
        });

        let network_observer: Weak<dyn NetworkObserver> = this.self_ref.clone();
        this.bitrate_controller
            .set_network_observer(Some(network_observer));
        this.bitrate_controller
            .set_start_bitrate(DEFAULT_START_BITRATE_BPS);
        this.bitrate_controller.set_min_max_bitrate(0, 0);

        let intra_frame_observer: Weak<dyn IntraFrameObserver> = this.self_ref.clone();
        let engine = engine_factory.create(RtpEngineConfig {
            outgoing_transport: Arc::new(LoopbackTransport {
                packetizer: this.self_ref.clone(),
            }),
            intra_frame_observer: Some(intra_frame_observer),
            bandwidth_observer: Some(this.bitrate_controller.create_rtcp_bandwidth_observer()),
        })?;

        engine.set_fec_status(FecConfig {
            generic_fec: false,
            red_payload_type: config.red_payload_type,
            ulpfec_payload_type: config.ulpfec_payload_type,
        });
        engine.set_remb_status(true);
        engine.set_store_packets_status(true, config.nack_history);

        let ssrc = engine.ssrc();
        this.ssrc.store(ssrc, Ordering::Release);
        this.scheduler.register_module(engine.clone());
        *this.rtp_rtcp.write() = Some(engine);

        tracing::info!(ssrc = format_args!("{:#010X}", ssrc), "video packetizer created");
        Ok(this)
    }

    /// Feed one encoded frame.
    ///
    /// Never fails: scan and send problems are logged, counted and reported
    /// through the returned [`FrameOutcome`].
    pub fn on_frame(&self, frame: &Frame<'_>) -> FrameOutcome {
        if !self.enabled.load(Ordering::Acquire) {
            return FrameOutcome::Disabled;
        }

        if !self.key_frame_arrived.load(Ordering::Acquire) {
            if !frame.info.is_key_frame {
                tracing::debug!("key frame has not arrived, requesting key frame");
                self.stats.frames_gated.fetch_add(1, Ordering::Relaxed);
                self.feedback.request_key_frame();
                return FrameOutcome::AwaitingKeyFrame;
            }
            self.key_frame_arrived.store(true, Ordering::Release);
            tracing::debug!(format = ?frame.format, "first key frame arrived");
        }

        self.update_send_codec(frame);

        let (codec, payload_type) = match frame.format {
            FrameFormat::Vp8 => (CodecHeader::Vp8(Vp8Header::default()), VP8_90000_PT),
            FrameFormat::Vp9 => (CodecHeader::Vp9(Vp9Header::default()), VP9_90000_PT),
            FrameFormat::H264 => (CodecHeader::H264, H264_90000_PT),
            FrameFormat::H265 => (CodecHeader::H265, H265_90000_PT),
            FrameFormat::I420 | FrameFormat::Unknown => {
                tracing::debug!(format = ?frame.format, "dropping frame that cannot be sent as RTP");
                self.stats.unsupported_frames.fetch_add(1, Ordering::Relaxed);
                return FrameOutcome::Dropped(DropReason::Unsupported);
            }
        };

        let fragmentation = if codec.is_nal_based() {
            match scan_frame(frame.payload) {
                Ok(map) => Some(map),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        format = ?frame.format,
                        len = frame.len(),
                        "dropping frame with malformed NAL stream"
                    );
                    self.stats.scan_failures.fetch_add(1, Ordering::Relaxed);
                    return FrameOutcome::Dropped(DropReason::ScanFailed);
                }
            }
        } else {
            None
        };

        let header = RtpVideoHeader::new(codec).with_size(frame.info.width, frame.info.height);
        let outgoing = OutgoingFrame {
            kind: FrameKind::Key,
            payload_type,
            timestamp: frame.timestamp,
            capture_time_ms: frame.capture_time_ms(),
            payload: frame.payload,
            fragmentation: fragmentation.as_ref(),
            header: &header,
        };

        let result = match self.rtp_rtcp.read().as_ref() {
            Some(engine) => engine.send_outgoing_data(outgoing),
            None => Err(PacketizerError::EngineUnavailable),
        };

        match result {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    pt = payload_type,
                    timestamp = frame.timestamp,
                    len = frame.len(),
                    "frame sent"
                );
                FrameOutcome::Sent
            }
            Err(e) => {
                tracing::warn!(error = %e, pt = payload_type, "RTP engine failed to send frame");
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Dropped(DropReason::SendFailed)
            }
        }
    }

    /// Re-register when the codec or resolution changed since the last frame.
    fn update_send_codec(&self, frame: &Frame<'_>) {
        let changed = {
            let mut codec = self.codec.lock();
            let changed = codec.format != frame.format
                || codec.width != frame.info.width
                || codec.height != frame.info.height;
            if changed {
                *codec = CodecState {
                    format: frame.format,
                    width: frame.info.width,
                    height: frame.info.height,
                };
            }
            changed
        };

        if changed
            && let Err(e) = self.set_send_codec(frame.format, frame.info.width, frame.info.height)
        {
            tracing::warn!(error = %e, "send codec update failed");
        }
    }

    /// Register `format` at `width`×`height` with the engine and push the
    /// matching bitrate bounds to the controller.
    ///
    /// `format` must equal the format of the frames being fed in; the
    /// packetizer does not transcode.
    pub fn set_send_codec(&self, format: FrameFormat, width: u32, height: u32) -> Result<()> {
        let current = self.codec.lock().format;
        if format != current {
            return Err(PacketizerError::FormatMismatch {
                requested: format,
                current,
            });
        }

        let (Some(payload_type), Some(name)) = (format.payload_type(), format.codec_name()) else {
            return Err(PacketizerError::UnsupportedFormat(format));
        };

        let bounds = BitrateBounds::for_codec(format, width, height);
        bounds.apply(self.bitrate_controller.as_ref());
        tracing::debug!(
            codec = name,
            width,
            height,
            target_bps = bounds.target_bps,
            min_bps = bounds.min_bps,
            max_bps = bounds.max_bps,
            "send codec set"
        );

        let descriptor = CodecDescriptor {
            name,
            payload_type,
            clock_rate: VIDEO_CLOCK_RATE,
            width,
            height,
        };
        let engine = self.rtp_rtcp.read();
        let engine = engine.as_ref().ok_or(PacketizerError::EngineUnavailable)?;
        engine
            .register_send_payload(&descriptor)
            .map_err(|e| match e {
                PacketizerError::EngineRejected(_) => e,
                other => PacketizerError::EngineRejected(other.to_string()),
            })?;
        self.stats
            .codec_registrations
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Attach a sink, replacing and returning the previous one.
    ///
    /// The sink learns the stream SSRC, and its feedback source (if any) is
    /// pointed back at this packetizer.
    pub fn bind(&self, sink: Box<dyn MediaSink>) -> Option<Box<dyn MediaSink>> {
        let mut slot = self.sink.write();
        let previous = slot.take();
        if let Some(previous) = previous.as_deref() {
            unwire(previous);
        }

        let ssrc = self.ssrc.load(Ordering::Acquire);
        sink.set_video_sink_ssrc(ssrc);
        if let Some(source) = sink.feedback_source() {
            let feedback_sink: Weak<dyn RtcpFeedbackSink> = self.self_ref.clone();
            source.set_feedback_sink(Some(feedback_sink));
        }
        *slot = Some(sink);

        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            replaced = previous.is_some(),
            "sink bound"
        );
        previous
    }

    /// Detach the current sink. Safe to call when nothing is bound.
    pub fn unbind(&self) -> Option<Box<dyn MediaSink>> {
        let previous = self.sink.write().take();
        if let Some(previous) = previous.as_deref() {
            unwire(previous);
            tracing::debug!("sink unbound");
        }
        previous
    }

    pub fn is_bound(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Enable or disable sending. Enabling always requests a key frame
    /// because the receiver may have nothing to decode from.
    pub fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        tracing::debug!(enabled, "packetizer enable changed");
        if enabled {
            self.feedback.request_key_frame();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Ask upstream for a key frame on behalf of the remote side.
    pub fn send_fir_packet(&self) {
        self.feedback.request_key_frame();
    }

    /// Forward engine output to the bound sink. Only video data is accepted.
    pub fn receive_rtp_data(&self, packet: &[u8], data_type: DataType, channel_id: u32) {
        if data_type != DataType::Video {
            tracing::warn!(?data_type, channel_id, "non-video data dropped");
            return;
        }

        let sink = self.sink.read();
        if let Some(sink) = sink.as_ref()
            && let Err(e) = sink.deliver_video_data(packet)
        {
            tracing::warn!(error = %e, len = packet.len(), "sink delivery failed");
        }
    }

    /// Connect the encoder that should receive key-frame requests.
    pub fn set_feedback_listener(&self, listener: Option<Arc<dyn FeedbackListener>>) {
        self.feedback.set_listener(listener);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PacketizerConfig {
        &self.config
    }

    pub fn state(&self) -> PacketizerState {
        if self.closed.load(Ordering::Acquire) {
            PacketizerState::Closed
        } else if self.rtp_rtcp.read().is_none() {
            PacketizerState::Uninitialized
        } else if self.key_frame_arrived.load(Ordering::Acquire) {
            PacketizerState::Streaming
        } else {
            PacketizerState::AwaitingKeyFrame
        }
    }

    pub fn stats(&self) -> PacketizerStatsSnapshot {
        PacketizerStatsSnapshot {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_gated: self.stats.frames_gated.load(Ordering::Relaxed),
            scan_failures: self.stats.scan_failures.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            unsupported_frames: self.stats.unsupported_frames.load(Ordering::Relaxed),
            codec_registrations: self.stats.codec_registrations.load(Ordering::Relaxed),
            key_frame_requests: self.feedback.emitted(),
            key_frame_requests_suppressed: self.feedback.suppressed(),
        }
    }

    /// Unbind the sink, stop periodic engine work and release the engine.
    /// Idempotent; also run on drop.
    pub fn close(&self) {
        self.unbind();

        let module = self
            .rtp_rtcp
            .read()
            .clone()
            .map(|engine| engine as Arc<dyn Module>);
        if let Some(module) = module {
            self.scheduler.deregister_module(&module);
        }

        if self.rtp_rtcp.write().take().is_some() {
            self.closed.store(true, Ordering::Release);
            tracing::debug!(ssrc = format_args!("{:#010X}", self.ssrc()), "video packetizer closed");
        }
    }
}

impl Drop for VideoFramePacketizer {
    fn drop(&mut self) {
        self.close();
    }
}

fn unwire(sink: &dyn MediaSink) {
    if let Some(source) = sink.feedback_source() {
        source.set_feedback_sink(None);
    }
}

/// Scan an Annex-B payload and check every unit lies inside it.
fn scan_frame(payload: &[u8]) -> std::result::Result<FragmentationMap, ScanError> {
    let map = nal::scan_annex_b(payload)?;
    map.validate(payload.len())?;
    Ok(map)
}

impl RtcpFeedbackSink for VideoFramePacketizer {
    fn deliver_feedback(&self, packet: &[u8]) -> usize {
        let engine = self.rtp_rtcp.read();
        let Some(engine) = engine.as_ref() else {
            return 0;
        };
        match engine.incoming_rtcp_packet(packet) {
            Ok(_) => packet.len(),
            Err(e) => {
                tracing::debug!(error = %e, len = packet.len(), "RTCP feedback rejected");
                0
            }
        }
    }
}

impl IntraFrameObserver for VideoFramePacketizer {
    fn on_received_intra_frame_request(&self, ssrc: u32) {
        tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "intra frame request received");
        self.feedback.request_key_frame();
    }
}

// Network changes are not forwarded to the encoder.
impl NetworkObserver for VideoFramePacketizer {}
