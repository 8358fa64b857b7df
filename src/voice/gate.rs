//! One-shot audio unlock gate
//!
//! Output devices on kiosk hardware follow an autoplay policy: nothing may play
//! until a user gesture has resumed the device once. The gate tracks that
//! transition explicitly and notifies subscribers when it happens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};

use super::playback::AudioOutput;

/// Tracks whether audio output is permitted
pub struct AudioGate {
    output: Arc<dyn AudioOutput>,
    unlocked: watch::Sender<bool>,
    suspended: AtomicBool,
    unlocking: Mutex<()>,
}

impl AudioGate {
    /// Create a locked gate over an output device
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let (unlocked, _) = watch::channel(false);
        Self {
            output,
            unlocked,
            suspended: AtomicBool::new(false),
            unlocking: Mutex::new(()),
        }
    }

    /// Whether output has been unlocked
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        *self.unlocked.borrow()
    }

    /// Subscribe to the unlock flag
    ///
    /// The receiver observes exactly one change, from `false` to `true`.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.unlocked.subscribe()
    }

    fn is_settled(&self) -> bool {
        self.is_unlocked() && !self.suspended.load(Ordering::SeqCst)
    }

    /// Resume the output device and mark the gate unlocked
    ///
    /// Idempotent: concurrent callers wait for the first attempt, and once
    /// unlocked the device is only resumed again after
    /// [`AudioGate::suspend_if_running`]. A failed resume still unlocks the
    /// gate, since the call comes from a genuine user gesture.
    pub async fn unlock(&self) {
        if self.is_settled() {
            return;
        }

        let _unlocking = self.unlocking.lock().await;
        if self.is_settled() {
            return;
        }

        if let Err(e) = self.output.resume().await {
            tracing::warn!(error = %e, "audio resume failed, unlocking anyway");
        }
        self.suspended.store(false, Ordering::SeqCst);

        if !self.unlocked.send_replace(true) {
            tracing::info!("audio output unlocked");
        }
    }

    /// Wait until the gate has been unlocked
    pub async fn wait_unlocked(&self) {
        let mut rx = self.subscribe();
        // Sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|unlocked| *unlocked).await;
    }

    /// Pause the output device, ignoring failures
    ///
    /// The gate stays unlocked; the next [`AudioGate::unlock`] resumes the
    /// device.
    pub fn suspend_if_running(&self) {
        if !self.is_settled() {
            return;
        }
        match self.output.suspend() {
            Ok(()) => {
                self.suspended.store(true, Ordering::SeqCst);
                tracing::debug!("audio output suspended");
            }
            Err(e) => tracing::debug!(error = %e, "audio suspend failed"),
        }
    }
}
