//! Upstream feedback from the packetizer to the frame source.
//!
//! The only message today is a key-frame request. Delivery is
//! fire-and-forget: the packetizer never waits for the encoder to react.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackType {
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackCmd {
    RequestKeyFrame,
}

/// A control message sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackMsg {
    pub kind: FeedbackType,
    pub cmd: FeedbackCmd,
}

impl FeedbackMsg {
    pub const fn request_key_frame() -> Self {
        Self {
            kind: FeedbackType::Video,
            cmd: FeedbackCmd::RequestKeyFrame,
        }
    }
}

/// Receiver of upstream feedback, usually the encoder feeding the packetizer.
pub trait FeedbackListener: Send + Sync {
    fn on_feedback(&self, msg: FeedbackMsg);
}

impl<F> FeedbackListener for F
where
    F: Fn(FeedbackMsg) + Send + Sync,
{
    fn on_feedback(&self, msg: FeedbackMsg) {
        self(msg)
    }
}

/// Emits key-frame requests to the connected listener.
///
/// With a minimum interval set, requests arriving sooner than that after the
/// last emitted one are suppressed and counted.
pub struct FeedbackChannel {
    listener: RwLock<Option<Arc<dyn FeedbackListener>>>,
    min_interval: Option<Duration>,
    last_emitted: Mutex<Option<Instant>>,
    emitted: AtomicU64,
    suppressed: AtomicU64,
}

impl FeedbackChannel {
    pub fn new(min_interval: Option<Duration>) -> Self {
        Self {
            listener: RwLock::new(None),
            min_interval,
            last_emitted: Mutex::new(None),
            emitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Connect (or disconnect, with `None`) the upstream listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn FeedbackListener>>) {
        *self.listener.write() = listener;
    }

    /// Ask upstream for a key frame. Returns `false` if throttled.
    pub fn request_key_frame(&self) -> bool {
        if let Some(min_interval) = self.min_interval {
            let now = Instant::now();
            let mut last = self.last_emitted.lock();
            if last.is_some_and(|at| now.duration_since(at) < min_interval) {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("key frame request throttled");
                return false;
            }
            *last = Some(now);
        }

        self.emitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("requesting key frame");
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_feedback(FeedbackMsg::request_key_frame());
        }
        true
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl Default for FeedbackChannel {
    fn default() -> Self {
        Self::new(None)
    }
}
