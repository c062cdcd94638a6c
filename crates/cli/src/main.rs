mod source;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use packetizer::session::DEFAULT_MTU;
use packetizer::{
    FeedbackMsg, Frame, FrameFormat, FrameOutcome, PacketizerConfig, RtpRtcpSession,
    SendSideBitrateController, SessionConfig, TaskRunner, UdpSink, UdpSinkConfig,
    VideoFramePacketizer,
};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Codec {
    H264,
    H265,
}

impl From<Codec> for FrameFormat {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::H264 => FrameFormat::H264,
            Codec::H265 => FrameFormat::H265,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "rtp-send",
    about = "Stream an Annex-B H.264/H.265 file as RTP over UDP"
)]
struct Args {
    /// Annex-B elementary stream to send
    #[arg(long, short)]
    input: PathBuf,

    #[arg(long, value_enum, default_value_t = Codec::H264)]
    codec: Codec,

    /// Receiver address (host:port)
    #[arg(long, short)]
    dest: SocketAddr,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Restart from the beginning when the file ends
    #[arg(long = "loop")]
    repeat: bool,

    /// Maximum RTP packet size in bytes
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rtp-send: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> packetizer::Result<()> {
    let format = FrameFormat::from(args.codec);
    let data = std::fs::read(&args.input)?;
    let access_units = source::split_access_units(&data, format)?;
    tracing::info!(
        input = %args.input.display(),
        frames = access_units.len(),
        "input loaded"
    );

    let runner = Arc::new(TaskRunner::new());
    runner.start();
    let controller = Arc::new(SendSideBitrateController::new());

    let session = RtpRtcpSession::factory(SessionConfig {
        mtu: args.mtu,
        ..Default::default()
    });
    let packetizer = VideoFramePacketizer::new(
        PacketizerConfig::default(),
        &session,
        controller.clone(),
        runner.clone(),
    )?;
    // A file cannot produce key frames on demand; just surface the requests.
    packetizer.set_feedback_listener(Some(Arc::new(|msg: FeedbackMsg| {
        tracing::info!(?msg, "receiver requested a key frame");
    })));

    let sink = UdpSink::connect(args.dest, UdpSinkConfig::default())?;
    packetizer.bind(Box::new(sink));

    let fps = args.fps.max(1);
    let frame_interval = Duration::from_secs(1) / fps;
    let timestamp_step = 90_000 / fps;
    let mut timestamp = 0u32;
    let mut next_frame = Instant::now();

    loop {
        for au in &access_units {
            let frame = Frame::new(format, &au.data, timestamp)
                .with_size(args.width, args.height)
                .key_frame(au.key_frame);
            let outcome = packetizer.on_frame(&frame);
            if outcome != FrameOutcome::Sent {
                tracing::debug!(?outcome, timestamp, "frame not sent");
            }

            timestamp = timestamp.wrapping_add(timestamp_step);
            next_frame += frame_interval;
            if let Some(wait) = next_frame.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
        if !args.repeat {
            break;
        }
    }

    let stats = packetizer.stats();
    tracing::info!(
        frames_sent = stats.frames_sent,
        frames_gated = stats.frames_gated,
        scan_failures = stats.scan_failures,
        send_failures = stats.send_failures,
        key_frame_requests = stats.key_frame_requests,
        estimate_bps = controller.estimate_bps(),
        "stream finished"
    );

    packetizer.close();
    runner.stop();
    Ok(())
}
