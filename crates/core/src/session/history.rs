use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hard cap on stored packets regardless of age.
const MAX_STORED_PACKETS: usize = 1024;

struct StoredPacket {
    sequence: u16,
    sent_at: Instant,
    data: Vec<u8>,
}

/// Recently sent RTP packets, kept for NACK retransmission.
///
/// Packets older than the configured window are pruned on insert. Lookup is
/// by sequence number; the newest matching packet wins after a wrap.
pub struct PacketHistory {
    packets: VecDeque<StoredPacket>,
    max_age: Duration,
}

impl PacketHistory {
    pub fn new(max_age: Duration) -> Self {
        Self {
            packets: VecDeque::new(),
            max_age,
        }
    }

    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    pub fn insert(&mut self, sequence: u16, data: Vec<u8>, now: Instant) {
        self.prune(now);
        if self.packets.len() == MAX_STORED_PACKETS {
            self.packets.pop_front();
        }
        self.packets.push_back(StoredPacket {
            sequence,
            sent_at: now,
            data,
        });
    }

    pub fn get(&self, sequence: u16) -> Option<&[u8]> {
        self.packets
            .iter()
            .rev()
            .find(|p| p.sequence == sequence)
            .map(|p| p.data.as_slice())
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.packets.front() {
            if now.duration_since(front.sent_at) <= self.max_age {
                break;
            }
            self.packets.pop_front();
        }
    }
}
