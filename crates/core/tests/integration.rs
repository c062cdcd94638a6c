//! Integration test: packetizer wired to the reference RTP/RTCP session,
//! bitrate controller and task runner, with a recording sink standing in
//! for the network.
//!
//! Feedback is injected the way a network sink would: through the
//! `RtcpFeedbackSink` the packetizer hands to the sink on bind.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use packetizer::media::rtcp::{self, RtcpPacket};
use packetizer::media::rtp::{RtpPacketInfo, is_rtcp};
use packetizer::sink::FeedbackSource;
use packetizer::{
    FeedbackMsg, Frame, FrameFormat, FrameOutcome, MediaSink, PacketizerConfig, PacketizerError,
    PacketizerState, RtcpFeedbackSink, RtpRtcpSession, SendSideBitrateController, SessionConfig,
    TaskRunner, UdpSink, UdpSinkConfig, VideoFramePacketizer,
};

const SSRC: u32 = 0x1234_5678;
const REMOTE_SSRC: u32 = 0xBEEF;

/// SPS followed by an IDR slice.
const H264_KEY: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x1F, 0, 0, 1, 0x65, 0x88, 0x84];
const H264_DELTA: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02];

#[derive(Default)]
struct Recorder {
    packets: Mutex<Vec<Vec<u8>>>,
    ssrc: Mutex<Option<u32>>,
    feedback: Mutex<Option<Weak<dyn RtcpFeedbackSink>>>,
}

impl Recorder {
    fn rtp(&self) -> Vec<Vec<u8>> {
        self.packets
            .lock()
            .iter()
            .filter(|p| !is_rtcp(p))
            .cloned()
            .collect()
    }

    fn rtcp(&self) -> Vec<Vec<u8>> {
        self.packets
            .lock()
            .iter()
            .filter(|p| is_rtcp(p))
            .cloned()
            .collect()
    }

    /// Play the remote side: hand RTCP to whatever the packetizer wired in.
    fn feedback(&self, packet: &[u8]) -> Option<usize> {
        let sink = self.feedback.lock().as_ref().and_then(Weak::upgrade)?;
        Some(sink.deliver_feedback(packet))
    }
}

/// Sink handed to the packetizer; the test keeps the other end.
struct SharedSink(Arc<Recorder>);

impl MediaSink for SharedSink {
    fn deliver_video_data(&self, packet: &[u8]) -> packetizer::Result<()> {
        self.0.packets.lock().push(packet.to_vec());
        Ok(())
    }

    fn set_video_sink_ssrc(&self, ssrc: u32) {
        *self.0.ssrc.lock() = Some(ssrc);
    }

    fn feedback_source(&self) -> Option<&dyn FeedbackSource> {
        Some(self)
    }
}

impl FeedbackSource for SharedSink {
    fn set_feedback_sink(&self, sink: Option<Weak<dyn RtcpFeedbackSink>>) {
        *self.0.feedback.lock() = sink;
    }
}

struct Harness {
    packetizer: Arc<VideoFramePacketizer>,
    controller: Arc<SendSideBitrateController>,
    runner: Arc<TaskRunner>,
    recorder: Arc<Recorder>,
    key_frame_requests: Arc<AtomicUsize>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let runner = Arc::new(TaskRunner::new());
    let controller = Arc::new(SendSideBitrateController::new());
    let session = RtpRtcpSession::factory(SessionConfig {
        ssrc: Some(SSRC),
        ..Default::default()
    });
    let packetizer = VideoFramePacketizer::new(
        PacketizerConfig::default(),
        &session,
        controller.clone(),
        runner.clone(),
    )
    .expect("packetizer");

    let key_frame_requests = Arc::new(AtomicUsize::new(0));
    let counter = key_frame_requests.clone();
    packetizer.set_feedback_listener(Some(Arc::new(move |msg: FeedbackMsg| {
        assert_eq!(msg, FeedbackMsg::request_key_frame());
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    let recorder = Arc::new(Recorder::default());
    packetizer.bind(Box::new(SharedSink(recorder.clone())));

    Harness {
        packetizer,
        controller,
        runner,
        recorder,
        key_frame_requests,
    }
}

fn h264(payload: &[u8], timestamp: u32, key: bool) -> Frame<'_> {
    Frame::new(FrameFormat::H264, payload, timestamp)
        .with_size(640, 480)
        .key_frame(key)
}

#[test]
fn h264_stream_gated_on_first_key_frame() {
    let h = harness();
    assert_eq!(h.packetizer.state(), PacketizerState::AwaitingKeyFrame);
    assert_eq!(*h.recorder.ssrc.lock(), Some(SSRC));
    assert_eq!(h.controller.start_bps(), 300_000);
    assert_eq!(h.controller.min_max_bps(), (0, 0));

    assert_eq!(
        h.packetizer.on_frame(&h264(H264_DELTA, 0, false)),
        FrameOutcome::AwaitingKeyFrame
    );
    assert_eq!(h.key_frame_requests.load(Ordering::SeqCst), 1);
    assert!(h.recorder.rtp().is_empty());

    assert_eq!(h.packetizer.on_frame(&h264(H264_KEY, 3000, true)), FrameOutcome::Sent);
    assert_eq!(h.packetizer.state(), PacketizerState::Streaming);

    let packets: Vec<RtpPacketInfo> = h
        .recorder
        .rtp()
        .iter()
        .map(|p| RtpPacketInfo::parse(p).expect("RTP packet"))
        .collect();
    // SPS and IDR each fit a single NAL unit packet.
    assert_eq!(packets.len(), 2);
    assert!(packets.iter().all(|p| p.ssrc == SSRC && p.payload_type == 127));
    assert!(packets.iter().all(|p| p.timestamp == 3000));
    assert_eq!(packets[1].sequence, packets[0].sequence.wrapping_add(1));
    assert!(!packets[0].marker);
    assert!(packets[1].marker);

    // 640×480 H.264: 645 kbps target, bounds at /4 and ×2.
    assert_eq!(h.controller.start_bps(), 645_000);
    assert_eq!(h.controller.min_max_bps(), (161_250, 1_290_000));

    // Delta frames flow once the gate is open.
    assert_eq!(h.packetizer.on_frame(&h264(H264_DELTA, 6000, false)), FrameOutcome::Sent);
    assert_eq!(h.recorder.rtp().len(), 3);
    assert_eq!(h.key_frame_requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.packetizer.stats().codec_registrations, 1);
}

#[test]
fn vp8_resolution_change_reregisters() {
    let h = harness();
    let payload = vec![0x10u8; 3000];

    let frame = Frame::new(FrameFormat::Vp8, &payload, 0)
        .with_size(640, 480)
        .key_frame(true);
    assert_eq!(h.packetizer.on_frame(&frame), FrameOutcome::Sent);
    assert_eq!(h.controller.min_max_bps(), (145_000, 1_160_000));

    let packets: Vec<RtpPacketInfo> = h
        .recorder
        .rtp()
        .iter()
        .map(|p| RtpPacketInfo::parse(p).expect("RTP packet"))
        .collect();
    assert!(packets.len() > 2, "3000-byte frame must span several packets");
    assert!(packets.iter().all(|p| p.payload_type == 100));
    let markers: Vec<bool> = packets.iter().map(|p| p.marker).collect();
    assert_eq!(markers.iter().filter(|m| **m).count(), 1);
    assert_eq!(markers.last(), Some(&true));
    assert!(h.recorder.rtp().iter().all(|p| p.len() <= 1200));

    let same = Frame::new(FrameFormat::Vp8, &payload, 3000).with_size(640, 480);
    assert_eq!(h.packetizer.on_frame(&same), FrameOutcome::Sent);
    assert_eq!(h.packetizer.stats().codec_registrations, 1);

    let bigger = Frame::new(FrameFormat::Vp8, &payload, 6000).with_size(1280, 720);
    assert_eq!(h.packetizer.on_frame(&bigger), FrameOutcome::Sent);
    assert_eq!(h.packetizer.stats().codec_registrations, 2);
    // 1935 kbps scaled by 0.9 and truncated.
    assert_eq!(h.controller.start_bps(), 1_741_000);
}

#[test]
fn send_codec_must_match_input() {
    let h = harness();
    assert!(matches!(
        h.packetizer.set_send_codec(FrameFormat::Unknown, 640, 480),
        Err(PacketizerError::UnsupportedFormat(FrameFormat::Unknown))
    ));

    h.packetizer.on_frame(&h264(H264_KEY, 0, true));
    assert!(matches!(
        h.packetizer.set_send_codec(FrameFormat::Vp8, 640, 480),
        Err(PacketizerError::FormatMismatch {
            requested: FrameFormat::Vp8,
            current: FrameFormat::H264,
        })
    ));

    h.packetizer
        .set_send_codec(FrameFormat::H264, 1280, 720)
        .expect("matching format");
    assert_eq!(h.controller.start_bps(), 1_935_000);
}

#[test]
fn rebind_moves_feedback_wiring() {
    let h = harness();
    let second = Arc::new(Recorder::default());

    let previous = h.packetizer.bind(Box::new(SharedSink(second.clone())));
    assert!(previous.is_some());
    assert!(h.recorder.feedback.lock().is_none());
    assert!(second.feedback.lock().is_some());
    assert_eq!(*second.ssrc.lock(), Some(SSRC));

    h.packetizer.on_frame(&h264(H264_KEY, 0, true));
    assert!(h.recorder.rtp().is_empty());
    assert_eq!(second.rtp().len(), 2);

    assert!(h.packetizer.unbind().is_some());
    assert!(h.packetizer.unbind().is_none());
    assert!(!h.packetizer.is_bound());
    assert!(second.feedback.lock().is_none());

    // The engine keeps sending with nothing bound.
    assert_eq!(h.packetizer.on_frame(&h264(H264_DELTA, 3000, false)), FrameOutcome::Sent);
    assert_eq!(second.rtp().len(), 2);
}

#[test]
fn pli_from_remote_requests_key_frame() {
    let h = harness();
    h.packetizer.on_frame(&h264(H264_KEY, 0, true));
    let before = h.key_frame_requests.load(Ordering::SeqCst);

    let pli = rtcp::build_pli(REMOTE_SSRC, SSRC);
    assert_eq!(h.recorder.feedback(&pli), Some(pli.len()));
    assert_eq!(h.key_frame_requests.load(Ordering::SeqCst), before + 1);

    // Addressed to another stream: parsed, but no request.
    let other = rtcp::build_pli(REMOTE_SSRC, SSRC + 1);
    assert_eq!(h.recorder.feedback(&other), Some(other.len()));
    assert_eq!(h.key_frame_requests.load(Ordering::SeqCst), before + 1);

    assert_eq!(h.recorder.feedback(&[0x80, 0xC9]), Some(0));
}

#[test]
fn nack_retransmits_to_sink() {
    let h = harness();
    h.packetizer.on_frame(&h264(H264_KEY, 0, true));
    let sent = h.recorder.rtp();
    let first = RtpPacketInfo::parse(&sent[0]).expect("RTP packet");

    let nack = rtcp::build_nack(REMOTE_SSRC, SSRC, &[first.sequence]);
    assert_eq!(h.recorder.feedback(&nack), Some(nack.len()));

    let after = h.recorder.rtp();
    assert_eq!(after.len(), sent.len() + 1);
    assert_eq!(after.last(), Some(&sent[0]));
}

#[test]
fn remb_caps_bandwidth_estimate() {
    let h = harness();
    h.packetizer.on_frame(&h264(H264_KEY, 0, true));
    assert_eq!(h.controller.estimate_bps(), 645_000);

    let remb = rtcp::build_remb(REMOTE_SSRC, 400_000, &[SSRC]);
    assert_eq!(h.recorder.feedback(&remb), Some(remb.len()));
    assert_eq!(h.controller.estimate_bps(), 400_000);
}

#[test]
fn task_runner_emits_sender_report() {
    let h = harness();
    h.runner.start();
    h.packetizer.on_frame(&h264(H264_KEY, 9000, true));

    let deadline = Instant::now() + Duration::from_secs(3);
    while h.recorder.rtcp().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    h.runner.stop();

    let reports = h.recorder.rtcp();
    assert!(!reports.is_empty(), "no sender report within 3 s");
    let parsed = rtcp::parse_compound(&reports[0]).expect("valid compound RTCP");
    match &parsed[0] {
        RtcpPacket::SenderReport(sr) => {
            assert_eq!(sr.ssrc, SSRC);
            assert_eq!(sr.packet_count, 2);
        }
        other => panic!("expected sender report, got {other:?}"),
    }
    assert!(matches!(
        parsed[1],
        RtcpPacket::Other {
            packet_type: rtcp::RTCP_SDES,
            ..
        }
    ));
}

#[test]
fn close_tears_down_engine() {
    let h = harness();
    assert_eq!(h.runner.module_count(), 1);
    h.packetizer.on_frame(&h264(H264_KEY, 0, true));

    h.packetizer.close();
    assert_eq!(h.packetizer.state(), PacketizerState::Closed);
    assert_eq!(h.runner.module_count(), 0);
    assert!(!h.packetizer.is_bound());
    assert!(h.recorder.feedback.lock().is_none());

    assert_eq!(
        h.packetizer.on_frame(&h264(H264_DELTA, 3000, false)),
        FrameOutcome::Dropped(packetizer::DropReason::SendFailed)
    );
    h.packetizer.close();
}

#[test]
fn concurrent_frames_feedback_and_rebinds() {
    let h = harness();
    h.runner.start();
    assert_eq!(h.packetizer.on_frame(&h264(H264_KEY, 0, true)), FrameOutcome::Sent);
    let before = h.key_frame_requests.load(Ordering::SeqCst);

    let pli = rtcp::build_pli(REMOTE_SSRC, SSRC);
    let nack = rtcp::build_nack(REMOTE_SSRC, SSRC, &[0, 1, 2]);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=200u32 {
                let outcome = h.packetizer.on_frame(&h264(H264_DELTA, i * 3000, false));
                assert_eq!(outcome, FrameOutcome::Sent);
            }
        });
        s.spawn(|| {
            for _ in 0..200 {
                assert_eq!(h.packetizer.deliver_feedback(&pli), pli.len());
                assert_eq!(h.packetizer.deliver_feedback(&nack), nack.len());
            }
        });
        s.spawn(|| {
            for _ in 0..100 {
                let recorder = Arc::new(Recorder::default());
                h.packetizer.bind(Box::new(SharedSink(recorder.clone())));
                assert_eq!(*recorder.ssrc.lock(), Some(SSRC));
                h.packetizer.unbind();
                assert!(recorder.feedback.lock().is_none());
            }
            h.packetizer.bind(Box::new(SharedSink(h.recorder.clone())));
        });
    });

    let stats = h.packetizer.stats();
    assert_eq!(stats.frames_sent, 201);
    assert_eq!(stats.key_frame_requests, before as u64 + 200);
    assert_eq!(h.key_frame_requests.load(Ordering::SeqCst), before + 200);
    assert!(h.packetizer.is_bound());

    h.packetizer.close();
    h.runner.stop();
    assert_eq!(h.runner.module_count(), 0);
    assert!(h.recorder.feedback.lock().is_none());
}

#[test]
fn packetizer_released_on_udp_receive_thread() {
    let runner = Arc::new(TaskRunner::new());
    let session = RtpRtcpSession::factory(SessionConfig {
        ssrc: Some(SSRC),
        ..Default::default()
    });
    let packetizer = VideoFramePacketizer::new(
        PacketizerConfig::default(),
        &session,
        Arc::new(SendSideBitrateController::new()),
        runner.clone(),
    )
    .expect("packetizer");

    // Hold the receive thread inside the callback while the test lets go.
    let (entered_tx, entered_rx) = mpsc::channel();
    packetizer.set_feedback_listener(Some(Arc::new(move |_msg: FeedbackMsg| {
        let _ = entered_tx.send(());
        thread::sleep(Duration::from_millis(200));
    })));

    let peer = UdpSocket::bind("127.0.0.1:0").expect("peer socket");
    let sink = UdpSink::connect(
        peer.local_addr().expect("peer address"),
        UdpSinkConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            poll_interval: Duration::from_millis(10),
        },
    )
    .expect("UDP sink");
    let target = sink.local_addr().expect("sink address");
    packetizer.bind(Box::new(sink));
    assert_eq!(packetizer.on_frame(&h264(H264_KEY, 0, true)), FrameOutcome::Sent);
    assert_eq!(runner.module_count(), 1);

    peer.send_to(&rtcp::build_pli(REMOTE_SSRC, SSRC), target)
        .expect("send PLI");
    entered_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("key frame request on the receive thread");
    let weak = Arc::downgrade(&packetizer);
    drop(packetizer);

    // Teardown finishes on the receive thread once the callback returns;
    // the engine is only deregistered after the sink is released.
    let deadline = Instant::now() + Duration::from_secs(3);
    while runner.module_count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(runner.module_count(), 0);
    assert!(weak.upgrade().is_none());
}
