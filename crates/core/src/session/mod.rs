//! Reference RTP/RTCP engine.
//!
//! [`RtpRtcpSession`] implements [`RtpEngine`] for a single outbound video
//! stream:
//!
//! - One SSRC with a 16-bit wrapping sequence counter (RFC 3550 §5.1).
//! - Codec payloading through [`CodecHeader`](crate::media::CodecHeader),
//!   bounded by the configured MTU. The marker bit closes every frame.
//! - Optional RED + ULPFEC (RFC 2198, RFC 5109) when generic FEC is on.
//! - Packet history for NACK retransmission (RFC 4585 §6.2.1).
//! - RTCP handling: PLI/FIR notify the intra-frame observer, REMB and
//!   receiver reports feed the bandwidth observer.
//! - Periodic sender reports from [`Module::process`].
//!
//! ## Packet flow
//!
//! ```text
//! send_outgoing_data ──► payloader ──► RTP header ──► [RED] ──► Transport::send_rtp
//!                                           │                        ▲
//!                                           └──► history ── NACK ────┘
//! ```

mod history;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use history::PacketHistory;

use crate::bitrate::RtcpBandwidthObserver;
use crate::engine::{
    CodecDescriptor, FecConfig, IntraFrameObserver, OutgoingFrame, RtpEngine, RtpEngineConfig,
    RtpEngineFactory, Transport,
};
use crate::error::{PacketizerError, Result};
use crate::frame::VIDEO_CLOCK_RATE;
use crate::media::fec::{self, MAX_PROTECTED_PACKETS, ULPFEC_HEADER_LEN};
use crate::media::rtcp::{self, NtpTime, ReportBlock, RtcpPacket, SenderReport};
use crate::media::rtp::{RTP_HEADER_LEN, RtpHeader};
use crate::scheduler::Module;

/// Default maximum packet size, RTP header included.
pub const DEFAULT_MTU: usize = 1200;

/// Default interval between RTCP sender reports.
pub const DEFAULT_RTCP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for an [`RtpRtcpSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed SSRC. When `None`, a random one is chosen (RFC 3550 §8.1).
    pub ssrc: Option<u32>,
    /// Maximum RTP packet size in bytes, including the 12-byte header.
    pub mtu: usize,
    pub rtcp_interval: Duration,
    /// Canonical name sent in SDES alongside each sender report.
    pub cname: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssrc: None,
            mtu: DEFAULT_MTU,
            rtcp_interval: DEFAULT_RTCP_INTERVAL,
            cname: "video-packetizer".to_string(),
        }
    }
}

/// Snapshot of session counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub fec_packets_sent: u64,
    pub retransmitted: u64,
    pub sender_reports_sent: u64,
}

struct SendState {
    header: RtpHeader,
    payloads: HashMap<u8, CodecDescriptor>,
    fec: FecConfig,
    history: Option<PacketHistory>,
    /// RTP timestamp of the last frame and when it went out, for SR extrapolation.
    last_frame: Option<(u32, Instant)>,
    last_report: Option<Instant>,
}

/// Single-stream RTP/RTCP engine. See the [module docs](self).
pub struct RtpRtcpSession {
    ssrc: u32,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    intra_frame_observer: Option<Weak<dyn IntraFrameObserver>>,
    bandwidth_observer: Option<Arc<dyn RtcpBandwidthObserver>>,
    remb_enabled: AtomicBool,
    state: Mutex<SendState>,
    packets_sent: AtomicU64,
    octets_sent: AtomicU64,
    fec_packets_sent: AtomicU64,
    retransmitted: AtomicU64,
    sender_reports_sent: AtomicU64,
}

impl RtpRtcpSession {
    pub fn new(config: SessionConfig, engine: RtpEngineConfig) -> Self {
        let header = match config.ssrc {
            Some(ssrc) => RtpHeader::new(ssrc),
            None => RtpHeader::with_random_ssrc(),
        };
        let ssrc = header.ssrc;
        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            mtu = config.mtu,
            "RTP session created"
        );

        Self {
            ssrc,
            config,
            transport: engine.outgoing_transport,
            intra_frame_observer: engine.intra_frame_observer,
            bandwidth_observer: engine.bandwidth_observer,
            remb_enabled: AtomicBool::new(false),
            state: Mutex::new(SendState {
                header,
                payloads: HashMap::new(),
                fec: FecConfig::default(),
                history: None,
                last_frame: None,
                last_report: None,
            }),
            packets_sent: AtomicU64::new(0),
            octets_sent: AtomicU64::new(0),
            fec_packets_sent: AtomicU64::new(0),
            retransmitted: AtomicU64::new(0),
            sender_reports_sent: AtomicU64::new(0),
        }
    }

    /// Engine factory producing sessions with `config`.
    pub fn factory(config: SessionConfig) -> impl RtpEngineFactory {
        move |engine: RtpEngineConfig| -> Result<Arc<dyn RtpEngine>> {
            Ok(Arc::new(RtpRtcpSession::new(config.clone(), engine)))
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            octets_sent: self.octets_sent.load(Ordering::Relaxed),
            fec_packets_sent: self.fec_packets_sent.load(Ordering::Relaxed),
            retransmitted: self.retransmitted.load(Ordering::Relaxed),
            sender_reports_sent: self.sender_reports_sent.load(Ordering::Relaxed),
        }
    }

    /// Payload type currently registered under `payload_type`, if any.
    pub fn registered_payload(&self, payload_type: u8) -> Option<CodecDescriptor> {
        self.state.lock().payloads.get(&payload_type).cloned()
    }

    /// Media payload budget. A ULPFEC packet carries the longest protected
    /// payload plus its own header, so that header is reserved up front.
    fn max_payload(&self, fec: &FecConfig) -> usize {
        let red_overhead = usize::from(fec.generic_fec && fec.red_payload_type.is_some());
        let fec_overhead = if fec.generic_fec && fec.ulpfec_payload_type.is_some() {
            ULPFEC_HEADER_LEN
        } else {
            0
        };
        self.config
            .mtu
            .saturating_sub(RTP_HEADER_LEN + red_overhead + fec_overhead)
    }

    fn send_all(&self, packets: &[Vec<u8>]) -> Result<()> {
        for packet in packets {
            self.transport.send_rtp(packet)?;
        }
        Ok(())
    }

    fn notify_intra_frame_request(&self) {
        let observer = self.intra_frame_observer.as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.on_received_intra_frame_request(self.ssrc);
        }
    }

    fn retransmit(&self, lost: &[u16]) -> Result<()> {
        let packets: Vec<Vec<u8>> = {
            let state = self.state.lock();
            let Some(history) = state.history.as_ref() else {
                tracing::trace!("NACK ignored, packet storage disabled");
                return Ok(());
            };
            lost.iter()
                .filter_map(|seq| history.get(*seq).map(<[u8]>::to_vec))
                .collect()
        };

        tracing::debug!(
            requested = lost.len(),
            found = packets.len(),
            "retransmitting NACKed packets"
        );
        self.send_all(&packets)?;
        self.retransmitted
            .fetch_add(packets.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn on_report_blocks(&self, blocks: &[ReportBlock]) {
        let ours: Vec<ReportBlock> = blocks
            .iter()
            .filter(|b| b.ssrc == self.ssrc)
            .copied()
            .collect();
        if ours.is_empty() {
            return;
        }
        let rtt = ours
            .iter()
            .find_map(|b| rtcp::round_trip_time(b, NtpTime::now()));
        if let Some(observer) = &self.bandwidth_observer {
            observer.on_received_receiver_report(&ours, rtt);
        }
    }

    fn build_sender_report(&self, state: &SendState, now: Instant) -> Vec<u8> {
        let rtp_timestamp = match state.last_frame {
            Some((ts, at)) => {
                let elapsed = now.duration_since(at).as_millis() as u64;
                ts.wrapping_add((elapsed * u64::from(VIDEO_CLOCK_RATE) / 1000) as u32)
            }
            None => 0,
        };
        let sr = SenderReport {
            ssrc: self.ssrc,
            ntp_time: NtpTime::now(),
            rtp_timestamp,
            packet_count: self.packets_sent.load(Ordering::Relaxed) as u32,
            octet_count: self.octets_sent.load(Ordering::Relaxed) as u32,
            report_blocks: Vec::new(),
        };
        let mut compound = rtcp::build_sender_report(&sr);
        compound.extend_from_slice(&rtcp::build_sdes_cname(self.ssrc, &self.config.cname));
        compound
    }
}

impl RtpEngine for RtpRtcpSession {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn register_send_payload(&self, codec: &CodecDescriptor) -> Result<()> {
        if codec.payload_type > 0x7f {
            return Err(PacketizerError::EngineRejected(format!(
                "payload type {} out of range",
                codec.payload_type
            )));
        }
        let mut state = self.state.lock();
        let fec = state.fec;
        if [fec.red_payload_type, fec.ulpfec_payload_type].contains(&Some(codec.payload_type)) {
            return Err(PacketizerError::EngineRejected(format!(
                "payload type {} reserved for FEC",
                codec.payload_type
            )));
        }
        tracing::debug!(
            codec = codec.name,
            pt = codec.payload_type,
            width = codec.width,
            height = codec.height,
            "send payload registered"
        );
        state.payloads.insert(codec.payload_type, codec.clone());
        Ok(())
    }

    fn send_outgoing_data(&self, frame: OutgoingFrame<'_>) -> Result<()> {
        let packets = {
            let mut state = self.state.lock();
            if !state.payloads.contains_key(&frame.payload_type) {
                return Err(PacketizerError::UnregisteredPayloadType(frame.payload_type));
            }

            let fec = state.fec;
            let payloads = frame.header.codec.payloader().payload(
                frame.payload,
                frame.fragmentation,
                self.max_payload(&fec),
            )?;
            if payloads.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            let red_pt = fec.red_payload_type.filter(|_| fec.generic_fec);
            let ulpfec_pt = fec.ulpfec_payload_type.filter(|_| fec.generic_fec);
            let count = payloads.len();
            let mut media = Vec::with_capacity(count);
            let mut wire = Vec::with_capacity(count + 1);
            let mut octets = 0u64;

            for (idx, payload) in payloads.into_iter().enumerate() {
                let sequence = state.header.sequence();
                let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
                packet.extend_from_slice(&state.header.write(
                    idx + 1 == count,
                    frame.payload_type,
                    frame.timestamp,
                ));
                packet.extend_from_slice(&payload);
                octets += payload.len() as u64;

                let on_wire = match red_pt {
                    Some(pt) => fec::red_encapsulate(&packet, pt).unwrap_or_else(|| packet.clone()),
                    None => packet.clone(),
                };
                if let Some(history) = state.history.as_mut() {
                    history.insert(sequence, on_wire.clone(), now);
                }
                media.push(packet);
                wire.push(on_wire);
            }

            let mut fec_count = 0u64;
            if let Some(ulpfec_pt) = ulpfec_pt {
                for group in media.chunks(MAX_PROTECTED_PACKETS) {
                    let refs: Vec<&[u8]> = group.iter().map(Vec::as_slice).collect();
                    let Some(fec_payload) = fec::ulpfec_payload(&refs) else {
                        continue;
                    };
                    let mut packet = state
                        .header
                        .write(false, ulpfec_pt, frame.timestamp)
                        .to_vec();
                    packet.extend_from_slice(&fec_payload);
                    let packet = match red_pt {
                        Some(pt) => fec::red_encapsulate(&packet, pt).unwrap_or(packet),
                        None => packet,
                    };
                    wire.push(packet);
                    fec_count += 1;
                }
            }

            state.last_frame = Some((frame.timestamp, now));
            self.packets_sent
                .fetch_add(wire.len() as u64, Ordering::Relaxed);
            self.octets_sent.fetch_add(octets, Ordering::Relaxed);
            self.fec_packets_sent.fetch_add(fec_count, Ordering::Relaxed);
            wire
        };

        tracing::trace!(
            ssrc = format_args!("{:#010X}", self.ssrc),
            codec = frame.header.codec.payloader().codec_name(),
            kind = ?frame.kind,
            pt = frame.payload_type,
            timestamp = frame.timestamp,
            packets = packets.len(),
            "frame packetized"
        );
        self.send_all(&packets)
    }

    fn incoming_rtcp_packet(&self, packet: &[u8]) -> Result<usize> {
        for rtcp_packet in rtcp::parse_compound(packet)? {
            match rtcp_packet {
                RtcpPacket::PictureLossIndication { media_ssrc, .. } if media_ssrc == self.ssrc => {
                    tracing::debug!(ssrc = format_args!("{:#010X}", self.ssrc), "PLI received");
                    self.notify_intra_frame_request();
                }
                RtcpPacket::FullIntraRequest { entries, .. }
                    if entries.iter().any(|e| e.ssrc == self.ssrc) =>
                {
                    tracing::debug!(ssrc = format_args!("{:#010X}", self.ssrc), "FIR received");
                    self.notify_intra_frame_request();
                }
                RtcpPacket::GenericNack {
                    media_ssrc,
                    lost_packets,
                    ..
                } if media_ssrc == self.ssrc => {
                    self.retransmit(&lost_packets)?;
                }
                RtcpPacket::RemoteBitrateEstimate {
                    bitrate_bps, ssrcs, ..
                } if ssrcs.contains(&self.ssrc) => {
                    if !self.remb_enabled.load(Ordering::Relaxed) {
                        continue;
                    }
                    tracing::trace!(bitrate_bps, "REMB received");
                    if let Some(observer) = &self.bandwidth_observer {
                        observer.on_received_estimated_bitrate(bitrate_bps);
                    }
                }
                RtcpPacket::SenderReport(sr) => self.on_report_blocks(&sr.report_blocks),
                RtcpPacket::ReceiverReport(rr) => self.on_report_blocks(&rr.report_blocks),
                other => tracing::trace!(packet = ?other, "RTCP packet ignored"),
            }
        }
        Ok(packet.len())
    }

    fn set_fec_status(&self, config: FecConfig) {
        tracing::debug!(
            generic_fec = config.generic_fec,
            red_pt = ?config.red_payload_type,
            ulpfec_pt = ?config.ulpfec_payload_type,
            "FEC status set"
        );
        self.state.lock().fec = config;
    }

    fn set_remb_status(&self, enabled: bool) {
        self.remb_enabled.store(enabled, Ordering::Relaxed);
    }

    fn set_store_packets_status(&self, enabled: bool, history: Duration) {
        let mut state = self.state.lock();
        match (enabled, state.history.as_mut()) {
            (true, Some(existing)) => existing.set_max_age(history),
            (true, None) => state.history = Some(PacketHistory::new(history)),
            (false, _) => state.history = None,
        }
    }
}

impl Module for RtpRtcpSession {
    fn time_until_next_process(&self) -> Duration {
        let state = self.state.lock();
        if state.last_frame.is_none() {
            return self.config.rtcp_interval;
        }
        match state.last_report {
            Some(at) => self.config.rtcp_interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn process(&self) {
        let report = {
            let mut state = self.state.lock();
            if state.last_frame.is_none() {
                return;
            }
            let now = Instant::now();
            if state
                .last_report
                .is_some_and(|at| now.duration_since(at) < self.config.rtcp_interval)
            {
                return;
            }
            state.last_report = Some(now);
            self.build_sender_report(&state, now)
        };

        match self.transport.send_rtcp(&report) {
            Ok(_) => {
                self.sender_reports_sent.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(ssrc = format_args!("{:#010X}", self.ssrc), "sender report sent");
            }
            Err(e) => tracing::warn!(error = %e, "failed to send sender report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{H264_90000_PT, RED_90000_PT, ULP_90000_PT, VP8_90000_PT};
    use crate::media::nal::scan_annex_b;
    use crate::media::rtp::RtpPacketInfo;
    use crate::media::{CodecHeader, RtpVideoHeader, Vp8Header};
    use crate::engine::FrameKind;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Capture {
        rtp: Mutex<Vec<Vec<u8>>>,
        rtcp: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for Capture {
        fn send_rtp(&self, packet: &[u8]) -> Result<usize> {
            self.rtp.lock().push(packet.to_vec());
            Ok(packet.len())
        }

        fn send_rtcp(&self, packet: &[u8]) -> Result<usize> {
            self.rtcp.lock().push(packet.to_vec());
            Ok(packet.len())
        }
    }

    #[derive(Default)]
    struct IntraCounter(AtomicU32);

    impl IntraFrameObserver for IntraCounter {
        fn on_received_intra_frame_request(&self, _ssrc: u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Bandwidth {
        remb: Mutex<Vec<u64>>,
        reports: Mutex<Vec<(Vec<ReportBlock>, Option<Duration>)>>,
    }

    impl RtcpBandwidthObserver for Bandwidth {
        fn on_received_estimated_bitrate(&self, bitrate_bps: u64) {
            self.remb.lock().push(bitrate_bps);
        }

        fn on_received_receiver_report(&self, blocks: &[ReportBlock], rtt: Option<Duration>) {
            self.reports.lock().push((blocks.to_vec(), rtt));
        }
    }

    struct Fixture {
        session: RtpRtcpSession,
        capture: Arc<Capture>,
        intra: Arc<IntraCounter>,
        bandwidth: Arc<Bandwidth>,
    }

    const SSRC: u32 = 0x1122_3344;

    fn fixture(mtu: usize) -> Fixture {
        let capture = Arc::new(Capture::default());
        let intra = Arc::new(IntraCounter::default());
        let bandwidth = Arc::new(Bandwidth::default());
        let weak_intra: Weak<dyn IntraFrameObserver> =
            Arc::downgrade(&intra) as Weak<dyn IntraFrameObserver>;
        let session = RtpRtcpSession::new(
            SessionConfig {
                ssrc: Some(SSRC),
                mtu,
                ..Default::default()
            },
            RtpEngineConfig {
                outgoing_transport: capture.clone(),
                intra_frame_observer: Some(weak_intra),
                bandwidth_observer: Some(bandwidth.clone()),
            },
        );
        Fixture {
            session,
            capture,
            intra,
            bandwidth,
        }
    }

    fn descriptor(name: &'static str, pt: u8) -> CodecDescriptor {
        CodecDescriptor {
            name,
            payload_type: pt,
            clock_rate: VIDEO_CLOCK_RATE,
            width: 640,
            height: 480,
        }
    }

    fn send_vp8(session: &RtpRtcpSession, payload: &[u8], timestamp: u32) -> Result<()> {
        let header = RtpVideoHeader::new(CodecHeader::Vp8(Vp8Header::default()));
        session.send_outgoing_data(OutgoingFrame {
            kind: FrameKind::Key,
            payload_type: VP8_90000_PT,
            timestamp,
            capture_time_ms: i64::from(timestamp / 90),
            payload,
            fragmentation: None,
            header: &header,
        })
    }

    // --- sending ---

    #[test]
    fn unregistered_payload_type_rejected() {
        let f = fixture(DEFAULT_MTU);
        let err = send_vp8(&f.session, &[1, 2, 3], 0).unwrap_err();
        assert!(matches!(err, PacketizerError::UnregisteredPayloadType(VP8_90000_PT)));
        assert!(f.capture.rtp.lock().is_empty());
    }

    #[test]
    fn fec_payload_types_are_reserved() {
        let f = fixture(DEFAULT_MTU);
        f.session.set_fec_status(FecConfig {
            generic_fec: false,
            red_payload_type: Some(RED_90000_PT),
            ulpfec_payload_type: Some(ULP_90000_PT),
        });
        let err = f
            .session
            .register_send_payload(&descriptor("VP8", RED_90000_PT))
            .unwrap_err();
        assert!(matches!(err, PacketizerError::EngineRejected(_)));
    }

    #[test]
    fn packets_respect_mtu_and_marker() {
        let f = fixture(100);
        f.session.register_send_payload(&descriptor("VP8", VP8_90000_PT)).unwrap();
        let frame = vec![0x5A; 500];
        send_vp8(&f.session, &frame, 9000).unwrap();

        let packets = f.capture.rtp.lock();
        assert!(packets.len() > 1);
        let infos: Vec<RtpPacketInfo> = packets
            .iter()
            .map(|p| RtpPacketInfo::parse(p).unwrap())
            .collect();
        for (idx, (packet, info)) in packets.iter().zip(&infos).enumerate() {
            assert!(packet.len() <= 100);
            assert_eq!(info.ssrc, SSRC);
            assert_eq!(info.timestamp, 9000);
            assert_eq!(info.payload_type, VP8_90000_PT);
            assert_eq!(info.marker, idx + 1 == packets.len());
        }
        for pair in infos.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
        }
    }

    #[test]
    fn h264_without_map_rejected() {
        let f = fixture(DEFAULT_MTU);
        f.session.register_send_payload(&descriptor("H264", H264_90000_PT)).unwrap();
        let header = RtpVideoHeader::new(CodecHeader::H264);
        let err = f
            .session
            .send_outgoing_data(OutgoingFrame {
                kind: FrameKind::Key,
                payload_type: H264_90000_PT,
                timestamp: 0,
                capture_time_ms: 0,
                payload: &[0, 0, 0, 1, 0x65, 1],
                fragmentation: None,
                header: &header,
            })
            .unwrap_err();
        assert!(matches!(err, PacketizerError::MissingFragmentation(_)));
    }

    #[test]
    fn h264_single_nal_packets() {
        let f = fixture(DEFAULT_MTU);
        f.session.register_send_payload(&descriptor("H264", H264_90000_PT)).unwrap();
        let payload = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x65, 0x88, 0x99];
        let map = scan_annex_b(&payload).unwrap();
        let header = RtpVideoHeader::new(CodecHeader::H264);
        f.session
            .send_outgoing_data(OutgoingFrame {
                kind: FrameKind::Key,
                payload_type: H264_90000_PT,
                timestamp: 3000,
                capture_time_ms: 33,
                payload: &payload,
                fragmentation: Some(&map),
                header: &header,
            })
            .unwrap();

        let packets = f.capture.rtp.lock();
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][RTP_HEADER_LEN..], &[0x67, 0x42]);
        assert_eq!(&packets[1][RTP_HEADER_LEN..], &[0x65, 0x88, 0x99]);
        assert_eq!(packets[1][1] & 0x80, 0x80);
    }

    #[test]
    fn red_and_ulpfec_when_generic_fec_enabled() {
        let f = fixture(DEFAULT_MTU);
        f.session.register_send_payload(&descriptor("VP8", VP8_90000_PT)).unwrap();
        f.session.set_fec_status(FecConfig {
            generic_fec: true,
            red_payload_type: Some(RED_90000_PT),
            ulpfec_payload_type: Some(ULP_90000_PT),
        });
        send_vp8(&f.session, &[7; 40], 0).unwrap();

        let packets = f.capture.rtp.lock();
        assert_eq!(packets.len(), 2);
        let media = RtpPacketInfo::parse(&packets[0]).unwrap();
        assert_eq!(media.payload_type, RED_90000_PT);
        assert_eq!(packets[0][RTP_HEADER_LEN], VP8_90000_PT);
        let fec = RtpPacketInfo::parse(&packets[1]).unwrap();
        assert_eq!(fec.payload_type, RED_90000_PT);
        assert_eq!(packets[1][RTP_HEADER_LEN], ULP_90000_PT);
        assert_eq!(fec.sequence, media.sequence.wrapping_add(1));
        assert_eq!(f.session.stats().fec_packets_sent, 1);
    }

    #[test]
    fn fec_packets_fit_mtu() {
        let f = fixture(200);
        f.session.register_send_payload(&descriptor("VP8", VP8_90000_PT)).unwrap();
        f.session.set_fec_status(FecConfig {
            generic_fec: true,
            red_payload_type: Some(RED_90000_PT),
            ulpfec_payload_type: Some(ULP_90000_PT),
        });
        send_vp8(&f.session, &[0x3C; 4000], 0).unwrap();

        let packets = f.capture.rtp.lock();
        let fec: Vec<&Vec<u8>> = packets
            .iter()
            .filter(|p| p[RTP_HEADER_LEN] == ULP_90000_PT)
            .collect();
        assert!(!fec.is_empty());
        assert_eq!(fec.len(), f.session.stats().fec_packets_sent as usize);
        assert!(packets.iter().all(|p| p.len() <= 200));
    }

    // --- RTCP ---

    #[test]
    fn pli_and_fir_for_our_ssrc_request_key_frame() {
        let f = fixture(DEFAULT_MTU);
        f.session
            .incoming_rtcp_packet(&rtcp::build_pli(9, SSRC))
            .unwrap();
        f.session
            .incoming_rtcp_packet(&rtcp::build_pli(9, 0xBAD))
            .unwrap();
        f.session
            .incoming_rtcp_packet(&rtcp::build_fir(
                9,
                &[rtcp::FirEntry {
                    ssrc: SSRC,
                    sequence_number: 1,
                }],
            ))
            .unwrap();
        assert_eq!(f.intra.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nack_retransmits_stored_packets() {
        let f = fixture(DEFAULT_MTU);
        f.session.register_send_payload(&descriptor("VP8", VP8_90000_PT)).unwrap();
        f.session
            .set_store_packets_status(true, Duration::from_millis(600));
        send_vp8(&f.session, &[1; 10], 0).unwrap();
        send_vp8(&f.session, &[2; 10], 3000).unwrap();

        let sent = f.capture.rtp.lock().clone();
        let lost = RtpPacketInfo::parse(&sent[0]).unwrap().sequence;
        let consumed = f
            .session
            .incoming_rtcp_packet(&rtcp::build_nack(9, SSRC, &[lost]))
            .unwrap();
        assert_eq!(consumed, 16);

        let packets = f.capture.rtp.lock();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[2], sent[0]);
        assert_eq!(f.session.stats().retransmitted, 1);
    }

    #[test]
    fn nack_without_storage_is_ignored() {
        let f = fixture(DEFAULT_MTU);
        f.session.register_send_payload(&descriptor("VP8", VP8_90000_PT)).unwrap();
        send_vp8(&f.session, &[1; 10], 0).unwrap();
        let seq = RtpPacketInfo::parse(&f.capture.rtp.lock()[0]).unwrap().sequence;
        f.session
            .incoming_rtcp_packet(&rtcp::build_nack(9, SSRC, &[seq]))
            .unwrap();
        assert_eq!(f.capture.rtp.lock().len(), 1);
    }

    #[test]
    fn remb_forwarded_only_when_enabled() {
        let f = fixture(DEFAULT_MTU);
        let remb = rtcp::build_remb(9, 500_000, &[SSRC]);
        f.session.incoming_rtcp_packet(&remb).unwrap();
        assert!(f.bandwidth.remb.lock().is_empty());

        f.session.set_remb_status(true);
        f.session.incoming_rtcp_packet(&remb).unwrap();
        assert_eq!(f.bandwidth.remb.lock().len(), 1);
    }

    #[test]
    fn receiver_report_blocks_for_our_ssrc_forwarded() {
        let f = fixture(DEFAULT_MTU);
        let block = |ssrc| ReportBlock {
            ssrc,
            fraction_lost: 12,
            packets_lost: 1,
            highest_sequence: 100,
            jitter: 0,
            last_sender_report: 0,
            delay_since_last_sender_report: 0,
        };
        let rr = rtcp::build_receiver_report(&rtcp::ReceiverReport {
            ssrc: 9,
            report_blocks: vec![block(0xBAD), block(SSRC)],
        });
        f.session.incoming_rtcp_packet(&rr).unwrap();

        let reports = f.bandwidth.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, vec![block(SSRC)]);
        assert_eq!(reports[0].1, None);
    }

    #[test]
    fn malformed_rtcp_is_an_error() {
        let f = fixture(DEFAULT_MTU);
        assert!(f.session.incoming_rtcp_packet(&[0x80, 201]).is_err());
        assert!(f.session.incoming_rtcp_packet(&[0x40, 201, 0, 1, 0, 0, 0, 0]).is_err());
    }

    // --- periodic reports ---

    #[test]
    fn sender_report_after_media() {
        let f = fixture(DEFAULT_MTU);
        assert_eq!(f.session.time_until_next_process(), DEFAULT_RTCP_INTERVAL);
        f.session.process();
        assert!(f.capture.rtcp.lock().is_empty());

        f.session.register_send_payload(&descriptor("VP8", VP8_90000_PT)).unwrap();
        send_vp8(&f.session, &[1; 10], 0).unwrap();
        assert_eq!(f.session.time_until_next_process(), Duration::ZERO);
        f.session.process();
        f.session.process();

        let rtcp = f.capture.rtcp.lock();
        assert_eq!(rtcp.len(), 1);
        let parsed = rtcp::parse_compound(&rtcp[0]).unwrap();
        match &parsed[0] {
            RtcpPacket::SenderReport(sr) => {
                assert_eq!(sr.ssrc, SSRC);
                assert_eq!(sr.packet_count, 1);
                assert_eq!(sr.octet_count, 11);
            }
            other => panic!("expected SR, got {other:?}"),
        }
        assert_eq!(f.session.stats().sender_reports_sent, 1);
    }
}
