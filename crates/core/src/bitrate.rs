//! Send bitrate policy and the bitrate controller contract.
//!
//! [`BitrateBounds::for_codec`] maps a codec and resolution to a target,
//! minimum and maximum send rate. The packetizer pushes the result into a
//! [`BitrateController`] whenever the codec or resolution changes.
//!
//! [`SendSideBitrateController`] is a reference controller: REMB caps the
//! estimate, receiver-report loss nudges it up or down, and changes are
//! reported to a [`NetworkObserver`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::frame::FrameFormat;
use crate::media::rtcp::ReportBlock;

/// Packets may go out at up to this multiple of the target bitrate when the
/// bandwidth estimate allows it.
pub const TRANSMISSION_MAXBITRATE_MULTIPLIER: u32 = 2;

/// Start bitrate before any codec is registered.
pub const DEFAULT_START_BITRATE_BPS: u32 = 300_000;

/// Bits per pixel per frame used by [`calc_bitrate_kbps`].
const BITS_PER_PIXEL: f64 = 0.07;
const REFERENCE_FRAMERATE: f64 = 30.0;
const VP8_EFFICIENCY: f64 = 0.9;

/// Target bitrate in kbps for a resolution at 30 fps.
pub fn calc_bitrate_kbps(width: u32, height: u32) -> u32 {
    let pixels = f64::from(width) * f64::from(height);
    (pixels * REFERENCE_FRAMERATE * BITS_PER_PIXEL / 1000.0) as u32
}

/// Send bitrate bounds for one codec/resolution pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitrateBounds {
    pub target_bps: u32,
    pub min_bps: u32,
    pub max_bps: u32,
}

impl BitrateBounds {
    /// Derive bounds from a target: `min = target / 4`, `max = 2 × target`.
    ///
    /// The target is clamped so that `max` still fits in a `u32`.
    pub fn from_target(target_bps: u32) -> Self {
        let target_bps = target_bps.min(u32::MAX / TRANSMISSION_MAXBITRATE_MULTIPLIER);
        Self {
            target_bps,
            min_bps: target_bps / 4,
            max_bps: target_bps * TRANSMISSION_MAXBITRATE_MULTIPLIER,
        }
    }

    /// Bounds for `format` at `width`×`height`. VP8 is scaled down to 90%.
    pub fn for_codec(format: FrameFormat, width: u32, height: u32) -> Self {
        let kbps = calc_bitrate_kbps(width, height);
        let target_kbps = match format {
            FrameFormat::Vp8 => (f64::from(kbps) * VP8_EFFICIENCY) as u32,
            _ => kbps,
        };
        Self::from_target(target_kbps.saturating_mul(1000))
    }

    /// Push start and min/max into a controller.
    pub fn apply(&self, controller: &dyn BitrateController) {
        controller.set_start_bitrate(self.target_bps);
        controller.set_min_max_bitrate(self.min_bps, self.max_bps);
    }
}

/// Receives bandwidth estimate changes from a [`BitrateController`].
///
/// The default implementation ignores the notification.
pub trait NetworkObserver: Send + Sync {
    fn on_network_changed(&self, _target_bitrate_bps: u32, _fraction_loss: u8, _rtt: Duration) {}
}

/// RTCP-derived bandwidth signals, fed by the RTP engine.
pub trait RtcpBandwidthObserver: Send + Sync {
    /// Receiver estimated maximum bitrate (REMB).
    fn on_received_estimated_bitrate(&self, bitrate_bps: u64);

    /// Report blocks about our stream, with the RTT derived from them.
    fn on_received_receiver_report(&self, blocks: &[ReportBlock], rtt: Option<Duration>);
}

/// Send-side bitrate controller contract.
pub trait BitrateController: Send + Sync {
    fn set_start_bitrate(&self, bps: u32);

    /// `max_bps == 0` means no upper bound.
    fn set_min_max_bitrate(&self, min_bps: u32, max_bps: u32);

    fn set_network_observer(&self, observer: Option<Weak<dyn NetworkObserver>>);

    fn create_rtcp_bandwidth_observer(&self) -> Arc<dyn RtcpBandwidthObserver>;
}

/// Loss above this (in 1/256) backs off the estimate.
const HIGH_LOSS: u8 = 26;
/// Loss below this (in 1/256) lets the estimate grow.
const LOW_LOSS: u8 = 5;

#[derive(Debug, Default)]
struct ControllerState {
    start_bps: u32,
    min_bps: u32,
    max_bps: u32,
    estimate_bps: u32,
    remb_cap_bps: Option<u32>,
    fraction_loss: u8,
    rtt: Duration,
}

impl ControllerState {
    fn clamp(&self, bps: u32) -> u32 {
        let mut bps = bps.max(self.min_bps);
        if self.max_bps > 0 {
            bps = bps.min(self.max_bps);
        }
        if let Some(cap) = self.remb_cap_bps {
            bps = bps.min(cap.max(self.min_bps));
        }
        bps
    }
}

/// Reference [`BitrateController`] combining REMB and loss-based control.
///
/// - REMB sets a ceiling on the estimate.
/// - Loss above 10% reduces the estimate by `loss / 2`.
/// - Loss below 2% grows it by 8%.
///
/// The estimate always stays within `[min, max]`.
#[derive(Clone)]
pub struct SendSideBitrateController {
    state: Arc<Mutex<ControllerState>>,
    observer: Arc<RwLock<Option<Weak<dyn NetworkObserver>>>>,
}

impl SendSideBitrateController {
    pub fn new() -> Self {
        let state = ControllerState {
            start_bps: DEFAULT_START_BITRATE_BPS,
            estimate_bps: DEFAULT_START_BITRATE_BPS,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            observer: Arc::new(RwLock::new(None)),
        }
    }

    /// Current bandwidth estimate in bps.
    pub fn estimate_bps(&self) -> u32 {
        self.state.lock().estimate_bps
    }

    /// Current `(min, max)` bounds.
    pub fn min_max_bps(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.min_bps, state.max_bps)
    }

    pub fn start_bps(&self) -> u32 {
        self.state.lock().start_bps
    }

    fn update_estimate(&self, f: impl FnOnce(&mut ControllerState) -> u32) {
        let (changed, estimate, loss, rtt) = {
            let mut state = self.state.lock();
            let proposed = f(&mut state);
            let next = state.clamp(proposed);
            let changed = next != state.estimate_bps;
            state.estimate_bps = next;
            (changed, next, state.fraction_loss, state.rtt)
        };

        if changed {
            tracing::debug!(estimate_bps = estimate, fraction_loss = loss, "bandwidth estimate changed");
            let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
            if let Some(observer) = observer {
                observer.on_network_changed(estimate, loss, rtt);
            }
        }
    }
}

impl Default for SendSideBitrateController {
    fn default() -> Self {
        Self::new()
    }
}

impl BitrateController for SendSideBitrateController {
    fn set_start_bitrate(&self, bps: u32) {
        self.update_estimate(|state| {
            state.start_bps = bps;
            bps
        });
    }

    fn set_min_max_bitrate(&self, min_bps: u32, max_bps: u32) {
        self.update_estimate(|state| {
            state.min_bps = min_bps;
            state.max_bps = max_bps;
            state.estimate_bps
        });
    }

    fn set_network_observer(&self, observer: Option<Weak<dyn NetworkObserver>>) {
        *self.observer.write() = observer;
    }

    fn create_rtcp_bandwidth_observer(&self) -> Arc<dyn RtcpBandwidthObserver> {
        Arc::new(self.clone())
    }
}

impl RtcpBandwidthObserver for SendSideBitrateController {
    fn on_received_estimated_bitrate(&self, bitrate_bps: u64) {
        let cap = u32::try_from(bitrate_bps).unwrap_or(u32::MAX);
        self.update_estimate(|state| {
            state.remb_cap_bps = Some(cap);
            state.estimate_bps
        });
    }

    fn on_received_receiver_report(&self, blocks: &[ReportBlock], rtt: Option<Duration>) {
        if blocks.is_empty() {
            return;
        }
        let loss = blocks.iter().map(|b| b.fraction_lost).max().unwrap_or(0);
        self.update_estimate(|state| {
            state.fraction_loss = loss;
            if let Some(rtt) = rtt {
                state.rtt = rtt;
            }
            let current = u64::from(state.estimate_bps);
            let next = if loss > HIGH_LOSS {
                current * (512 - u64::from(loss)) / 512
            } else if loss < LOW_LOSS {
                current + current * 8 / 100
            } else {
                current
            };
            u32::try_from(next).unwrap_or(u32::MAX)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        calls: AtomicU32,
        last_bps: AtomicU32,
    }

    impl NetworkObserver for CountingObserver {
        fn on_network_changed(&self, target: u32, _loss: u8, _rtt: Duration) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_bps.store(target, Ordering::SeqCst);
        }
    }

    fn block(fraction_lost: u8) -> ReportBlock {
        ReportBlock {
            ssrc: 1,
            fraction_lost,
            packets_lost: 0,
            highest_sequence: 0,
            jitter: 0,
            last_sender_report: 0,
            delay_since_last_sender_report: 0,
        }
    }

    #[test]
    fn bounds_relationships_hold() {
        for format in [FrameFormat::Vp8, FrameFormat::Vp9, FrameFormat::H264, FrameFormat::H265] {
            for (w, h) in [
                (0, 0),
                (176, 144),
                (640, 480),
                (1280, 720),
                (1920, 1080),
                (3840, 2160),
                (40_000, 40_000),
                (u32::MAX, u32::MAX),
            ] {
                let b = BitrateBounds::for_codec(format, w, h);
                assert_eq!(b.max_bps, 2 * b.target_bps);
                assert_eq!(b.min_bps, b.target_bps / 4);
            }
        }
    }

    #[test]
    fn oversized_frames_clamp_target() {
        let b = BitrateBounds::for_codec(FrameFormat::H264, 40_000, 40_000);
        assert_eq!(b.target_bps, u32::MAX / 2);
        assert_eq!(b.max_bps, u32::MAX - 1);
        assert_eq!(BitrateBounds::from_target(u32::MAX), b);
    }

    #[test]
    fn vp8_scaled_down() {
        let h264 = BitrateBounds::for_codec(FrameFormat::H264, 640, 480);
        let vp8 = BitrateBounds::for_codec(FrameFormat::Vp8, 640, 480);
        assert_eq!(h264.target_bps, 645_000);
        assert_eq!(vp8.target_bps, 580_000);
    }

    #[test]
    fn bounds_are_deterministic() {
        let a = BitrateBounds::for_codec(FrameFormat::Vp9, 1280, 720);
        let b = BitrateBounds::for_codec(FrameFormat::Vp9, 1280, 720);
        assert_eq!(a, b);
    }

    #[test]
    fn apply_is_idempotent() {
        let controller = SendSideBitrateController::new();
        let observer = Arc::new(CountingObserver::default());
        let weak: Weak<dyn NetworkObserver> = Arc::downgrade(&observer) as Weak<dyn NetworkObserver>;
        controller.set_network_observer(Some(weak));

        let bounds = BitrateBounds::for_codec(FrameFormat::H264, 640, 480);
        bounds.apply(&controller);
        let calls = observer.calls.load(Ordering::SeqCst);
        bounds.apply(&controller);
        bounds.apply(&controller);

        assert_eq!(observer.calls.load(Ordering::SeqCst), calls);
        assert_eq!(controller.estimate_bps(), bounds.target_bps);
        assert_eq!(controller.min_max_bps(), (bounds.min_bps, bounds.max_bps));
    }

    #[test]
    fn remb_caps_estimate() {
        let controller = SendSideBitrateController::new();
        BitrateBounds::from_target(1_000_000).apply(&controller);
        controller.on_received_estimated_bitrate(400_000);
        assert_eq!(controller.estimate_bps(), 400_000);
        // Never below min.
        controller.on_received_estimated_bitrate(10_000);
        assert_eq!(controller.estimate_bps(), 250_000);
    }

    #[test]
    fn loss_reduces_and_recovery_grows() {
        let controller = SendSideBitrateController::new();
        BitrateBounds::from_target(1_000_000).apply(&controller);

        controller.on_received_receiver_report(&[block(128)], None);
        assert_eq!(controller.estimate_bps(), 750_000);

        controller.on_received_receiver_report(&[block(0)], Some(Duration::from_millis(40)));
        assert_eq!(controller.estimate_bps(), 810_000);

        for _ in 0..20 {
            controller.on_received_receiver_report(&[block(0)], None);
        }
        assert_eq!(controller.estimate_bps(), 2_000_000);
    }

    #[test]
    fn observer_notified_on_change() {
        let controller = SendSideBitrateController::new();
        let observer = Arc::new(CountingObserver::default());
        let weak: Weak<dyn NetworkObserver> = Arc::downgrade(&observer) as Weak<dyn NetworkObserver>;
        controller.set_network_observer(Some(weak));

        controller.set_start_bitrate(500_000);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.last_bps.load(Ordering::SeqCst), 500_000);
    }
}
