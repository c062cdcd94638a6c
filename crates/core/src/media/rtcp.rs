//! RTCP compound packet parsing and building (RFC 3550 §6, RFC 4585,
//! RFC 5104, draft-alvestrand-rmcat-remb).
//!
//! Only the packet kinds a video sender reacts to are decoded in full:
//! receiver reports (loss, RTT), picture loss / full intra requests (key
//! frame), generic NACK (retransmission) and REMB (bandwidth). Anything else
//! in a compound packet is skipped as [`RtcpPacket::Other`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{PacketizerError, Result, RtcpErrorKind};

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;
pub const RTCP_RTPFB: u8 = 205;
pub const RTCP_PSFB: u8 = 206;

pub const SDES_CNAME: u8 = 1;

pub const RTPFB_NACK: u8 = 1;
pub const PSFB_PLI: u8 = 1;
pub const PSFB_FIR: u8 = 4;
pub const PSFB_APP: u8 = 15;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    /// Fraction lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost (24-bit signed).
    pub packets_lost: i32,
    pub highest_sequence: u32,
    pub jitter: u32,
    /// Middle 32 bits of the NTP timestamp of the last SR received.
    pub last_sender_report: u32,
    /// Delay since that SR, in 1/65536 seconds.
    pub delay_since_last_sender_report: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: NtpTime,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub report_blocks: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub report_blocks: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: u32,
    pub sequence_number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    PictureLossIndication {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    FullIntraRequest {
        sender_ssrc: u32,
        entries: Vec<FirEntry>,
    },
    GenericNack {
        sender_ssrc: u32,
        media_ssrc: u32,
        lost_packets: Vec<u16>,
    },
    RemoteBitrateEstimate {
        sender_ssrc: u32,
        bitrate_bps: u64,
        ssrcs: Vec<u32>,
    },
    /// SDES, BYE, APP and feedback formats we do not act on.
    Other { packet_type: u8, fmt: u8 },
}

/// 64-bit NTP timestamp (RFC 3550 §4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTime {
    pub secs: u32,
    pub frac: u32,
}

impl NtpTime {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_unix(since_epoch)
    }

    pub fn from_unix(since_epoch: Duration) -> Self {
        let secs = since_epoch.as_secs() + NTP_UNIX_OFFSET;
        let frac = ((u64::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000) as u32;
        Self {
            secs: secs as u32,
            frac,
        }
    }

    /// Middle 32 bits, the format used by LSR/DLSR.
    pub fn compact(&self) -> u32 {
        (self.secs << 16) | (self.frac >> 16)
    }
}

/// Round-trip time from a report block, per RFC 3550 §6.4.1.
///
/// Returns `None` when the receiver has not seen a sender report yet.
pub fn round_trip_time(block: &ReportBlock, now: NtpTime) -> Option<Duration> {
    if block.last_sender_report == 0 {
        return None;
    }
    let rtt = now
        .compact()
        .wrapping_sub(block.last_sender_report)
        .wrapping_sub(block.delay_since_last_sender_report);
    // Negative results wrap to huge values; treat anything above a minute as bogus.
    if rtt > 60 << 16 {
        return None;
    }
    Some(Duration::from_micros((u64::from(rtt) * 1_000_000) >> 16))
}

fn rtcp_err(kind: RtcpErrorKind) -> PacketizerError {
    PacketizerError::Rtcp(kind)
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Parse a compound RTCP packet.
///
/// Returns an error on a version mismatch, a length field that runs past the
/// buffer, bad padding, or a truncated fixed part of a known packet type.
pub fn parse_compound(raw: &[u8]) -> Result<Vec<RtcpPacket>> {
    if raw.len() < 4 {
        return Err(rtcp_err(RtcpErrorKind::TooShort));
    }

    let mut packets = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= raw.len() {
        let vpc = raw[offset];
        let version = vpc >> 6;
        if version != 2 {
            return Err(rtcp_err(RtcpErrorKind::InvalidVersion(version)));
        }
        let padding = vpc & 0x20 != 0;
        let fmt = vpc & 0x1f;
        let packet_type = raw[offset + 1];
        let length_words = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
        let packet_len = (length_words + 1) * 4;
        if raw.len() < offset + packet_len {
            return Err(rtcp_err(RtcpErrorKind::LengthMismatch));
        }

        let body_len = packet_len - 4;
        let mut body_end = offset + packet_len;
        if padding {
            let pad = raw[body_end - 1] as usize;
            if pad == 0 || pad > body_len {
                return Err(rtcp_err(RtcpErrorKind::InvalidPadding));
            }
            body_end -= pad;
        }
        let body = &raw[offset + 4..body_end];

        let packet = match packet_type {
            RTCP_SR => RtcpPacket::SenderReport(parse_sender_report(fmt, body)?),
            RTCP_RR => RtcpPacket::ReceiverReport(parse_receiver_report(fmt, body)?),
            RTCP_RTPFB if fmt == RTPFB_NACK => parse_nack(body)?,
            RTCP_PSFB if fmt == PSFB_PLI => parse_pli(body)?,
            RTCP_PSFB if fmt == PSFB_FIR => parse_fir(body)?,
            RTCP_PSFB if fmt == PSFB_APP && is_remb(body) => parse_remb(body)?,
            _ => RtcpPacket::Other { packet_type, fmt },
        };
        packets.push(packet);
        offset += packet_len;
    }

    if offset != raw.len() {
        return Err(rtcp_err(RtcpErrorKind::LengthMismatch));
    }

    Ok(packets)
}

fn parse_report_blocks(count: u8, body: &[u8]) -> Result<Vec<ReportBlock>> {
    let count = count as usize;
    if body.len() < count * 24 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("report block")));
    }
    Ok((0..count)
        .map(|i| {
            let b = &body[i * 24..(i + 1) * 24];
            // Sign-extend the 24-bit cumulative loss.
            let packets_lost = ((u32::from(b[5]) << 24
                | u32::from(b[6]) << 16
                | u32::from(b[7]) << 8) as i32)
                >> 8;
            ReportBlock {
                ssrc: read_u32(b, 0),
                fraction_lost: b[4],
                packets_lost,
                highest_sequence: read_u32(b, 8),
                jitter: read_u32(b, 12),
                last_sender_report: read_u32(b, 16),
                delay_since_last_sender_report: read_u32(b, 20),
            }
        })
        .collect())
}

fn parse_sender_report(count: u8, body: &[u8]) -> Result<SenderReport> {
    if body.len() < 24 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("sender report")));
    }
    Ok(SenderReport {
        ssrc: read_u32(body, 0),
        ntp_time: NtpTime {
            secs: read_u32(body, 4),
            frac: read_u32(body, 8),
        },
        rtp_timestamp: read_u32(body, 12),
        packet_count: read_u32(body, 16),
        octet_count: read_u32(body, 20),
        report_blocks: parse_report_blocks(count, &body[24..])?,
    })
}

fn parse_receiver_report(count: u8, body: &[u8]) -> Result<ReceiverReport> {
    if body.len() < 4 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("receiver report")));
    }
    Ok(ReceiverReport {
        ssrc: read_u32(body, 0),
        report_blocks: parse_report_blocks(count, &body[4..])?,
    })
}

fn parse_pli(body: &[u8]) -> Result<RtcpPacket> {
    if body.len() < 8 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("PLI")));
    }
    Ok(RtcpPacket::PictureLossIndication {
        sender_ssrc: read_u32(body, 0),
        media_ssrc: read_u32(body, 4),
    })
}

fn parse_fir(body: &[u8]) -> Result<RtcpPacket> {
    if body.len() < 8 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("FIR")));
    }
    // Bytes 4..8 are the media source SSRC, unused for FIR (RFC 5104 §4.3.1).
    let entries = body[8..]
        .chunks_exact(8)
        .map(|fci| FirEntry {
            ssrc: read_u32(fci, 0),
            sequence_number: fci[4],
        })
        .collect();
    Ok(RtcpPacket::FullIntraRequest {
        sender_ssrc: read_u32(body, 0),
        entries,
    })
}

fn parse_nack(body: &[u8]) -> Result<RtcpPacket> {
    if body.len() < 8 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("NACK")));
    }
    let mut lost_packets = Vec::new();
    for fci in body[8..].chunks_exact(4) {
        let pid = u16::from_be_bytes([fci[0], fci[1]]);
        let blp = u16::from_be_bytes([fci[2], fci[3]]);
        lost_packets.push(pid);
        for bit in 0..16u16 {
            if (blp >> bit) & 1 == 1 {
                lost_packets.push(pid.wrapping_add(bit + 1));
            }
        }
    }
    Ok(RtcpPacket::GenericNack {
        sender_ssrc: read_u32(body, 0),
        media_ssrc: read_u32(body, 4),
        lost_packets,
    })
}

fn is_remb(body: &[u8]) -> bool {
    body.len() >= 12 && &body[8..12] == b"REMB"
}

fn parse_remb(body: &[u8]) -> Result<RtcpPacket> {
    if body.len() < 16 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("REMB")));
    }
    let num_ssrc = body[12] as usize;
    let exponent = body[13] >> 2;
    let mantissa = (u64::from(body[13] & 0x03) << 16)
        | (u64::from(body[14]) << 8)
        | u64::from(body[15]);
    if body.len() < 16 + num_ssrc * 4 {
        return Err(rtcp_err(RtcpErrorKind::Truncated("REMB SSRC list")));
    }
    let ssrcs = (0..num_ssrc).map(|i| read_u32(body, 16 + i * 4)).collect();
    Ok(RtcpPacket::RemoteBitrateEstimate {
        sender_ssrc: read_u32(body, 0),
        bitrate_bps: mantissa << exponent,
        ssrcs,
    })
}

fn write_header(out: &mut Vec<u8>, count_or_fmt: u8, packet_type: u8, body_len: usize) {
    debug_assert_eq!(body_len % 4, 0);
    let length_words = (body_len / 4) as u16;
    out.push(0x80 | (count_or_fmt & 0x1f));
    out.push(packet_type);
    out.extend_from_slice(&length_words.to_be_bytes());
}

fn write_report_block(out: &mut Vec<u8>, block: &ReportBlock) {
    out.extend_from_slice(&block.ssrc.to_be_bytes());
    out.push(block.fraction_lost);
    let lost = (block.packets_lost as u32) & 0x00ff_ffff;
    out.extend_from_slice(&lost.to_be_bytes()[1..]);
    out.extend_from_slice(&block.highest_sequence.to_be_bytes());
    out.extend_from_slice(&block.jitter.to_be_bytes());
    out.extend_from_slice(&block.last_sender_report.to_be_bytes());
    out.extend_from_slice(&block.delay_since_last_sender_report.to_be_bytes());
}

pub fn build_sender_report(sr: &SenderReport) -> Vec<u8> {
    let blocks = &sr.report_blocks[..sr.report_blocks.len().min(31)];
    let mut out = Vec::with_capacity(28 + blocks.len() * 24);
    write_header(&mut out, blocks.len() as u8, RTCP_SR, 24 + blocks.len() * 24);
    out.extend_from_slice(&sr.ssrc.to_be_bytes());
    out.extend_from_slice(&sr.ntp_time.secs.to_be_bytes());
    out.extend_from_slice(&sr.ntp_time.frac.to_be_bytes());
    out.extend_from_slice(&sr.rtp_timestamp.to_be_bytes());
    out.extend_from_slice(&sr.packet_count.to_be_bytes());
    out.extend_from_slice(&sr.octet_count.to_be_bytes());
    for block in blocks {
        write_report_block(&mut out, block);
    }
    out
}

pub fn build_receiver_report(rr: &ReceiverReport) -> Vec<u8> {
    let blocks = &rr.report_blocks[..rr.report_blocks.len().min(31)];
    let mut out = Vec::with_capacity(8 + blocks.len() * 24);
    write_header(&mut out, blocks.len() as u8, RTCP_RR, 4 + blocks.len() * 24);
    out.extend_from_slice(&rr.ssrc.to_be_bytes());
    for block in blocks {
        write_report_block(&mut out, block);
    }
    out
}

pub fn build_pli(sender_ssrc: u32, media_ssrc: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    write_header(&mut out, PSFB_PLI, RTCP_PSFB, 8);
    out.extend_from_slice(&sender_ssrc.to_be_bytes());
    out.extend_from_slice(&media_ssrc.to_be_bytes());
    out
}

pub fn build_fir(sender_ssrc: u32, entries: &[FirEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + entries.len() * 8);
    write_header(&mut out, PSFB_FIR, RTCP_PSFB, 8 + entries.len() * 8);
    out.extend_from_slice(&sender_ssrc.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.ssrc.to_be_bytes());
        out.push(entry.sequence_number);
        out.extend_from_slice(&[0, 0, 0]);
    }
    out
}

/// Build a generic NACK, packing `lost` into PID/BLP pairs.
pub fn build_nack(sender_ssrc: u32, media_ssrc: u32, lost: &[u16]) -> Vec<u8> {
    let mut pairs: Vec<(u16, u16)> = Vec::new();
    for &seq in lost {
        match pairs.last_mut() {
            Some((pid, blp)) if seq.wrapping_sub(*pid).wrapping_sub(1) < 16 => {
                *blp |= 1 << seq.wrapping_sub(*pid).wrapping_sub(1);
            }
            _ => pairs.push((seq, 0)),
        }
    }

    let mut out = Vec::with_capacity(12 + pairs.len() * 4);
    write_header(&mut out, RTPFB_NACK, RTCP_RTPFB, 8 + pairs.len() * 4);
    out.extend_from_slice(&sender_ssrc.to_be_bytes());
    out.extend_from_slice(&media_ssrc.to_be_bytes());
    for (pid, blp) in pairs {
        out.extend_from_slice(&pid.to_be_bytes());
        out.extend_from_slice(&blp.to_be_bytes());
    }
    out
}

pub fn build_remb(sender_ssrc: u32, bitrate_bps: u64, ssrcs: &[u32]) -> Vec<u8> {
    let mut exponent = 0u8;
    let mut mantissa = bitrate_bps;
    while mantissa > 0x3ffff {
        mantissa >>= 1;
        exponent += 1;
    }

    let mut out = Vec::with_capacity(20 + ssrcs.len() * 4);
    write_header(&mut out, PSFB_APP, RTCP_PSFB, 16 + ssrcs.len() * 4);
    out.extend_from_slice(&sender_ssrc.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(b"REMB");
    out.push(ssrcs.len() as u8);
    out.push((exponent << 2) | ((mantissa >> 16) as u8 & 0x03));
    out.push((mantissa >> 8) as u8);
    out.push(mantissa as u8);
    for ssrc in ssrcs {
        out.extend_from_slice(&ssrc.to_be_bytes());
    }
    out
}

/// SDES with a single CNAME item for `ssrc` (RFC 3550 §6.5.1).
pub fn build_sdes_cname(ssrc: u32, cname: &str) -> Vec<u8> {
    let cname = &cname.as_bytes()[..cname.len().min(255)];
    // SSRC + item header + text + at least one null terminator, padded to 32 bits.
    let chunk_len = (4 + 2 + cname.len() + 1).div_ceil(4) * 4;
    let mut out = Vec::with_capacity(4 + chunk_len);
    write_header(&mut out, 1, RTCP_SDES, chunk_len);
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.push(SDES_CNAME);
    out.push(cname.len() as u8);
    out.extend_from_slice(cname);
    out.resize(4 + chunk_len, 0);
    out
}
