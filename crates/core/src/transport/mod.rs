//! Network sinks for packetized media.
//!
//! - **UDP** ([`udp`]): sends RTP/RTCP to a single remote address and reads
//!   RTCP feedback back from the same socket.

pub mod udp;

pub use udp::{UdpSink, UdpSinkConfig};
