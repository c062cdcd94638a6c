use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::Result;
use crate::media::rtp::is_rtcp;
use crate::sink::{FeedbackSource, MediaSink, RtcpFeedbackSink};

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 1500;

/// Options for [`UdpSink::connect`].
#[derive(Debug, Clone)]
pub struct UdpSinkConfig {
    /// Local address to bind. Defaults to an ephemeral port on all interfaces.
    pub bind_addr: SocketAddr,
    /// How often the receive loop checks whether it should stop.
    pub poll_interval: Duration,
}

impl Default for UdpSinkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            poll_interval: Duration::from_millis(50),
        }
    }
}

type SharedFeedbackSink = Arc<RwLock<Option<Weak<dyn RtcpFeedbackSink>>>>;

/// [`MediaSink`] that sends RTP/RTCP to one remote address over UDP.
///
/// A background thread reads datagrams arriving on the same socket and
/// hands RTCP (RFC 5761 §4) to the wired [`RtcpFeedbackSink`]. Anything
/// else is ignored. The thread stops when the sink is dropped.
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    ssrc: AtomicU32,
    feedback: SharedFeedbackSink,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl UdpSink {
    /// Bind a socket and start the RTCP receive loop.
    pub fn connect(remote: SocketAddr, config: UdpSinkConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)?;
        socket.set_read_timeout(Some(config.poll_interval))?;
        let socket = Arc::new(socket);

        let feedback: SharedFeedbackSink = Arc::new(RwLock::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let receiver = {
            let socket = socket.clone();
            let feedback = feedback.clone();
            let running = running.clone();
            thread::spawn(move || receive_loop(&socket, &feedback, &running))
        };

        tracing::info!(
            local = %socket.local_addr()?,
            remote = %remote,
            "UDP sink connected"
        );

        Ok(Self {
            socket,
            remote,
            ssrc: AtomicU32::new(0),
            feedback,
            running,
            receiver: Some(receiver),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// SSRC of the stream this sink carries, as set by the packetizer.
    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

/// Blocking receive loop; checks `running` every poll interval.
fn receive_loop(socket: &UdpSocket, feedback: &SharedFeedbackSink, running: &AtomicBool) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let packet = &buf[..len];
                if !is_rtcp(packet) {
                    tracing::trace!(%from, len, "non-RTCP datagram ignored");
                    continue;
                }
                let sink = feedback.read().as_ref().and_then(Weak::upgrade);
                match sink {
                    Some(sink) => {
                        let consumed = sink.deliver_feedback(packet);
                        tracing::trace!(%from, len, consumed, "RTCP feedback delivered");
                    }
                    None => tracing::trace!(%from, len, "RTCP dropped, no feedback sink"),
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "UDP receive error");
                }
            }
        }
    }
    tracing::debug!("UDP receive loop exited");
}

impl MediaSink for UdpSink {
    fn deliver_video_data(&self, packet: &[u8]) -> Result<()> {
        let sent = self.socket.send_to(packet, self.remote)?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(())
    }

    fn set_video_sink_ssrc(&self, ssrc: u32) {
        tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "UDP sink SSRC set");
        self.ssrc.store(ssrc, Ordering::Relaxed);
    }

    fn feedback_source(&self) -> Option<&dyn FeedbackSource> {
        Some(self)
    }
}

impl FeedbackSource for UdpSink {
    fn set_feedback_sink(&self, sink: Option<Weak<dyn RtcpFeedbackSink>>) {
        *self.feedback.write() = sink;
    }
}

impl Drop for UdpSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        // The last owner may be released from a feedback callback; the loop
        // sees `running == false` once the callback returns.
        if receiver.thread().id() == thread::current().id() {
            tracing::debug!("UDP sink dropped on its receive thread, detaching");
        } else if receiver.join().is_err() {
            tracing::warn!("UDP receive thread panicked");
        }
    }
}
