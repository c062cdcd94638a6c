//! RED encapsulation (RFC 2198) and ULPFEC generation (RFC 5109).
//!
//! The engine wraps media packets in a single primary RED block and, once
//! per frame, emits one XOR parity packet that protects every media packet
//! of the frame (level 0 only, short mask, up to 16 packets).

use super::rtp::{RTP_HEADER_LEN, RtpPacketInfo};

/// Packets one short-mask FEC packet can protect.
pub const MAX_PROTECTED_PACKETS: usize = 16;

/// FEC header (10 bytes) + level 0 header with a 16-bit mask (4 bytes).
pub const ULPFEC_HEADER_LEN: usize = 14;

/// Rewrite a serialized RTP packet as RED with one primary block.
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |0|   Block PT  |
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// The RTP payload type becomes `red_pt`; marker, sequence, timestamp and
/// SSRC are kept. Returns `None` if `packet` is not valid RTP.
pub fn red_encapsulate(packet: &[u8], red_pt: u8) -> Option<Vec<u8>> {
    let info = RtpPacketInfo::parse(packet)?;
    let mut out = Vec::with_capacity(packet.len() + 1);
    out.extend_from_slice(&packet[..info.payload_offset]);
    out[1] = (packet[1] & 0x80) | (red_pt & 0x7f);
    out.push(info.payload_type & 0x7f);
    out.extend_from_slice(&packet[info.payload_offset..]);
    Some(out)
}

/// Build the ULPFEC payload protecting `media` (RFC 5109 §7.3).
///
/// `media` are complete RTP packets of one stream with sequence numbers
/// within 16 of the first one. The first packet's sequence number is the
/// SN base. Returns `None` for an empty or oversized group.
pub fn ulpfec_payload(media: &[&[u8]]) -> Option<Vec<u8>> {
    if media.is_empty() || media.len() > MAX_PROTECTED_PACKETS {
        return None;
    }

    let infos: Vec<RtpPacketInfo> = media
        .iter()
        .map(|p| RtpPacketInfo::parse(p))
        .collect::<Option<_>>()?;
    let sn_base = infos[0].sequence;

    let protection_len = media
        .iter()
        .map(|p| p.len() - RTP_HEADER_LEN)
        .max()
        .unwrap_or(0);

    let mut recovery_bits = [0u8; 2];
    let mut ts_recovery = [0u8; 4];
    let mut length_recovery = 0u16;
    let mut mask = 0u16;
    let mut parity = vec![0u8; protection_len];

    for (packet, info) in media.iter().zip(&infos) {
        let offset = info.sequence.wrapping_sub(sn_base) as usize;
        if offset >= MAX_PROTECTED_PACKETS {
            return None;
        }
        mask |= 1 << (15 - offset);

        // P, X and CC; E and L in the FEC header stay zero.
        recovery_bits[0] ^= packet[0] & 0x3f;
        recovery_bits[1] ^= packet[1];
        for (r, b) in ts_recovery.iter_mut().zip(&packet[4..8]) {
            *r ^= b;
        }
        length_recovery ^= (packet.len() - RTP_HEADER_LEN) as u16;
        for (p, b) in parity.iter_mut().zip(&packet[RTP_HEADER_LEN..]) {
            *p ^= b;
        }
    }

    let mut out = Vec::with_capacity(ULPFEC_HEADER_LEN + protection_len);
    out.extend_from_slice(&recovery_bits);
    out.extend_from_slice(&sn_base.to_be_bytes());
    out.extend_from_slice(&ts_recovery);
    out.extend_from_slice(&length_recovery.to_be_bytes());
    out.extend_from_slice(&(protection_len as u16).to_be_bytes());
    out.extend_from_slice(&mask.to_be_bytes());
    out.extend_from_slice(&parity);
    Some(out)
}
