//! # Pacemaker
//!
//! Owns the authoritative current view and the single view timer.
//!
//! ## Key Features
//!
//! - **Monotonic view**: the view only moves forward, to `v + 1` after a QC or
//!   TC for `v` or after the local timer for `v` expires; requests for the
//!   current or an older view are no-ops
//! - **Cancellable timer**: each view arms a tokio task that reports
//!   [`TimerExpired`] on a channel; the task is aborted on every view change
//!   and an expiry for a view that is no longer current is ignored
//! - **Adaptive timeout**: consecutive failed rounds grow the timeout
//!   exponentially, each certified round shrinks the failure count again

use crate::config::TimeoutConfig;
use crate::model::{QuorumCertificate, TimeoutCertificate};
use crate::ViewNumber;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Upper bound on the backoff exponent; the result is capped by the max timeout anyway.
const MAX_BACKOFF_EXPONENT: u32 = 64;

/// Emitted by the view timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    pub view: ViewNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChangeCause {
    Qc,
    Tc,
    LocalTimeout,
}

/// A completed transition `old_view -> new_view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewChange {
    pub old_view: ViewNumber,
    pub new_view: ViewNumber,
    pub cause: ViewChangeCause,
    /// Timer armed for `new_view`
    pub timeout: Duration,
}

/// Exponential backoff over consecutive failed rounds.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    config: TimeoutConfig,
}

impl TimeoutPolicy {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// `min * factor^(failures - happy_path_max)`, clamped to `[min, max]`.
    pub fn duration(&self, round_failures: u32) -> Duration {
        let exponent = round_failures
            .saturating_sub(self.config.happy_path_max_round_failures)
            .min(MAX_BACKOFF_EXPONENT);
        let min = self.config.min_timeout_ms as f64;
        let max = self.config.max_timeout_ms as f64;
        let millis = (min * self.config.increase_factor.powi(exponent as i32)).clamp(min, max);
        Duration::from_millis(millis.round() as u64)
    }
}

#[derive(Debug)]
struct PacemakerState {
    current_view: ViewNumber,
    newest_qc: Arc<QuorumCertificate>,
    last_view_tc: Option<Arc<TimeoutCertificate>>,
    round_failures: u32,
    timer: Option<JoinHandle<()>>,
}

pub struct Pacemaker {
    policy: TimeoutPolicy,
    state: Mutex<PacemakerState>,
    timer_tx: mpsc::UnboundedSender<TimerExpired>,
}

impl Pacemaker {
    /// Create a pacemaker at `start_view`. Expiries are delivered on the
    /// returned receiver once [`Self::start`] arms the first timer.
    pub fn new(
        config: TimeoutConfig,
        start_view: ViewNumber,
        newest_qc: QuorumCertificate,
    ) -> (Self, mpsc::UnboundedReceiver<TimerExpired>) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let pacemaker = Self {
            policy: TimeoutPolicy::new(config),
            state: Mutex::new(PacemakerState {
                current_view: start_view,
                newest_qc: Arc::new(newest_qc),
                last_view_tc: None,
                round_failures: 0,
                timer: None,
            }),
            timer_tx,
        };
        (pacemaker, timer_rx)
    }

    /// Arm the timer for the current view. Without a tokio runtime no timer
    /// is armed and views only advance on certificates.
    pub fn start(&self) {
        let mut state = self.state.lock();
        let duration = self.policy.duration(state.round_failures);
        let view = state.current_view;
        self.arm(&mut state, view, duration);
        info!(view, ?duration, "pacemaker started");
    }

    /// Cancel the running timer.
    pub fn stop(&self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }

    pub fn current_view(&self) -> ViewNumber {
        self.state.lock().current_view
    }

    pub fn newest_qc(&self) -> Arc<QuorumCertificate> {
        self.state.lock().newest_qc.clone()
    }

    pub fn last_view_tc(&self) -> Option<Arc<TimeoutCertificate>> {
        self.state.lock().last_view_tc.clone()
    }

    pub fn round_failures(&self) -> u32 {
        self.state.lock().round_failures
    }

    /// Timeout the current view's timer was (or will be) armed with.
    pub fn current_timeout(&self) -> Duration {
        self.policy.duration(self.state.lock().round_failures)
    }

    /// Observe a QC. Advances to `qc.view + 1` unless already past it.
    pub fn process_qc(&self, qc: Arc<QuorumCertificate>) -> Option<ViewChange> {
        let mut state = self.state.lock();
        if qc.view > state.newest_qc.view {
            state.newest_qc = qc.clone();
        }
        if qc.view < state.current_view {
            trace!(qc_view = qc.view, current = state.current_view, "QC does not advance view");
            return None;
        }
        state.round_failures = state.round_failures.saturating_sub(1);
        Some(self.advance(&mut state, qc.view + 1, ViewChangeCause::Qc))
    }

    /// Observe a TC. Advances to `tc.view + 1` unless already past it.
    pub fn process_tc(&self, tc: Arc<TimeoutCertificate>) -> Option<ViewChange> {
        let mut state = self.state.lock();
        if tc.newest_qc.view > state.newest_qc.view {
            state.newest_qc = Arc::new(tc.newest_qc.clone());
        }
        if state.last_view_tc.as_ref().map_or(true, |known| tc.view > known.view) {
            state.last_view_tc = Some(tc.clone());
        }
        if tc.view < state.current_view {
            trace!(tc_view = tc.view, current = state.current_view, "TC does not advance view");
            return None;
        }
        state.round_failures = state.round_failures.saturating_add(1);
        Some(self.advance(&mut state, tc.view + 1, ViewChangeCause::Tc))
    }

    /// Handle a timer expiry. Expiries for views other than the current one
    /// are stale and ignored.
    pub fn on_timer_expired(&self, expired: TimerExpired) -> Option<ViewChange> {
        let mut state = self.state.lock();
        if expired.view != state.current_view {
            debug!(
                expired = expired.view,
                current = state.current_view,
                "ignoring stale view timer"
            );
            return None;
        }
        state.round_failures = state.round_failures.saturating_add(1);
        Some(self.advance(&mut state, expired.view + 1, ViewChangeCause::LocalTimeout))
    }

    fn advance(
        &self,
        state: &mut PacemakerState,
        new_view: ViewNumber,
        cause: ViewChangeCause,
    ) -> ViewChange {
        let old_view = state.current_view;
        state.current_view = new_view;
        let timeout = self.policy.duration(state.round_failures);
        self.arm(state, new_view, timeout);
        info!(
            old_view,
            new_view,
            ?cause,
            ?timeout,
            round_failures = state.round_failures,
            "view changed"
        );
        ViewChange {
            old_view,
            new_view,
            cause,
            timeout,
        }
    }

    fn arm(&self, state: &mut PacemakerState, view: ViewNumber, duration: Duration) {
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        // Outside a runtime the view still advances; `start` arms the timer later
        let Ok(runtime) = Handle::try_current() else {
            debug!(view, "no tokio runtime, view timer not armed");
            return;
        };
        let timer_tx = self.timer_tx.clone();
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(view, "view timer fired");
            // Receiver gone means the engine stopped
            let _ = timer_tx.send(TimerExpired { view });
        }));
    }
}

impl Drop for Pacemaker {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for Pacemaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pacemaker")
            .field("current_view", &state.current_view)
            .field("round_failures", &state.round_failures)
            .finish()
    }
}
