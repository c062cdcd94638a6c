/// Size of the RTP fixed header without CSRCs or extensions.
pub const RTP_HEADER_LEN: usize = 12;

/// Generic RTP fixed header writer (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One writer exists per outbound stream. It owns the SSRC and the 16-bit
/// wrapping sequence counter. The payload type and timestamp come from the
/// frame being sent, since the engine carries several payload mappings
/// (media, RED, ULPFEC) on one SSRC.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC.
    pub fn new(ssrc: u32) -> Self {
        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self { ssrc, sequence: 0 }
    }

    /// Create with a random SSRC and a random initial sequence number.
    ///
    /// Per RFC 3550 §8.1 the SSRC should be chosen randomly to minimize
    /// the probability of collisions between independent sessions; §5.1
    /// asks for a random starting sequence number as well.
    pub fn with_random_ssrc() -> Self {
        let mut header = Self::new(rand::random::<u32>());
        header.sequence = rand::random::<u16>();
        header
    }

    /// Sequence number the next [`write`](Self::write) call will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of a video frame
    /// (RFC 6184 §5.1, RFC 7741 §4.1).
    pub fn write(&mut self, marker: bool, pt: u8, timestamp: u32) -> [u8; RTP_HEADER_LEN] {
        let header = encode(marker, pt, self.sequence, timestamp, self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

fn encode(marker: bool, pt: u8, sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = 2 << 6;
    header[1] = ((marker as u8) << 7) | (pt & 0x7f);
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Read-only view of the fixed header of a serialized RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacketInfo {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Offset of the payload within the packet (after CSRCs and extension).
    pub payload_offset: usize,
}

impl RtpPacketInfo {
    /// Parse the fixed header, skipping CSRCs and a header extension if present.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != 2 {
            return None;
        }
        let csrc_count = (packet[0] & 0x0f) as usize;
        let mut payload_offset = RTP_HEADER_LEN + csrc_count * 4;
        if packet[0] & 0x10 != 0 {
            let ext = packet.get(payload_offset + 2..payload_offset + 4)?;
            let words = u16::from_be_bytes([ext[0], ext[1]]) as usize;
            payload_offset += 4 + words * 4;
        }
        if payload_offset > packet.len() {
            return None;
        }
        Some(Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            payload_offset,
        })
    }
}

/// Whether a datagram is RTCP rather than RTP (RFC 5761 §4: PT 192..=223).
pub fn is_rtcp(packet: &[u8]) -> bool {
    packet.len() >= 2 && packet[0] >> 6 == 2 && (192..=223).contains(&packet[1])
}
