//! Error classification and close-and-reopen recovery.
//!
//! Every recovery action goes back through the transition protocol: a fault
//! closes the handle and the reopen is run from the device-closed callback,
//! after the backoff the [`RecoveryPolicy`] prescribes.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::handle::{Collaborators, DeviceHandle, PendingCall};
use crate::traits::DeviceErrorKind;

/// What to do about a device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Close the device, then open it again.
    CloseAndReopen,
    /// Close the device and leave it closed.
    Close,
    /// Nothing; the condition is not ours to fix.
    Ignore,
}

/// Map a device error class to its recovery action.
#[must_use]
pub const fn action_for(kind: DeviceErrorKind) -> RecoveryAction {
    use DeviceErrorKind as Kind;

    match kind {
        Kind::MaxCamerasInUse | Kind::CameraDevice => RecoveryAction::CloseAndReopen,
        Kind::CameraInUse => RecoveryAction::Ignore,
        Kind::CameraDisabled | Kind::CameraService | Kind::Other(_) => RecoveryAction::Close,
    }
}

/// Limits on automatic reopening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Consecutive reopens allowed before giving up; `None` is unbounded.
    pub max_attempts: Option<u32>,
    /// Delay before the first reopen.
    pub base_backoff: Duration,
    /// Upper bound on any reopen delay.
    pub max_backoff: Duration,
}

impl RecoveryPolicy {
    /// Delay before reopen number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at [`Self::max_backoff`].
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Whether reopen number `attempt` may run.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

/// Per-handle recovery bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct RecoveryState {
    /// Reopens since the last healthy session.
    pub(crate) attempts: u32,
    /// A close is running on behalf of recovery; reopen once it completes.
    pub(crate) reopen_pending: bool,
    /// When the scheduled reopen is due.
    pub(crate) reopen_at: Option<Instant>,
    /// The attempt budget ran out.
    pub(crate) exhausted: bool,
    /// Shutting down; never reopen.
    pub(crate) disabled: bool,
}

impl RecoveryState {
    /// A session came up healthy.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        self.exhausted = false;
    }
}

impl DeviceHandle {
    pub(crate) fn on_device_error(&mut self, kind: DeviceErrorKind, collab: &Collaborators) {
        let action = action_for(kind);

        if self.guards.open_requested && !self.is_open {
            warn!(camera = %self.id(), ?kind, ?action, "camera failed to open");
            self.finish(PendingCall::OpenDevice);
            self.guards.open_requested = false;
            if self.guards.close_requested {
                self.guards.close_requested = false;
                if std::mem::take(&mut self.open_after_close) {
                    debug!(camera = %self.id(), "running open requested after the close");
                    self.open(collab);
                }
                return;
            }
            if action == RecoveryAction::CloseAndReopen {
                self.schedule_reopen(collab);
            }
            return;
        }

        if !self.is_open || self.guards.close_requested || self.guards.is_closing {
            debug!(camera = %self.id(), ?kind, "ignoring error on closing camera");
            return;
        }

        warn!(camera = %self.id(), ?kind, ?action, "camera error");
        match action {
            RecoveryAction::CloseAndReopen => self.recover(collab),
            RecoveryAction::Close => {
                self.close(collab);
            }
            RecoveryAction::Ignore => {}
        }
    }

    /// A capture or repeating request failed, or was refused synchronously.
    pub(crate) fn on_capture_rejected(&mut self, collab: &Collaborators) {
        if !self.is_open || self.guards.close_requested || self.guards.is_closing {
            debug!(camera = %self.id(), "ignoring capture failure on closing camera");
            return;
        }
        self.recover(collab);
    }

    /// Close the handle and reopen it once the close completes.
    fn recover(&mut self, collab: &Collaborators) {
        if !self.recovery.disabled {
            self.recovery.reopen_pending = true;
        }
        info!(camera = %self.id(), attempts = self.recovery.attempts, "restarting camera");
        self.close(collab);
    }

    /// Run or schedule the next recovery reopen.
    pub(crate) fn schedule_reopen(&mut self, collab: &Collaborators) {
        self.recovery.reopen_pending = false;
        if self.recovery.disabled {
            return;
        }

        let attempt = self.recovery.attempts.saturating_add(1);
        if !self.policy.allows(attempt) {
            self.recovery.exhausted = true;
            error!(
                camera = %self.id(),
                attempts = self.recovery.attempts,
                "giving up on camera after repeated failures"
            );
            return;
        }
        self.recovery.attempts = attempt;

        let delay = self.policy.backoff(attempt);
        if delay.is_zero() {
            self.open(collab);
        } else {
            debug!(camera = %self.id(), attempt, ?delay, "reopen scheduled");
            self.recovery.reopen_at = Some(Instant::now() + delay);
        }
    }

    /// When the worker must wake up to run a scheduled reopen.
    pub(crate) const fn next_deadline(&self) -> Option<Instant> {
        self.recovery.reopen_at
    }

    /// Run the scheduled reopen if it is due at `now`.
    pub(crate) fn on_timer(&mut self, now: Instant, collab: &Collaborators) {
        match self.recovery.reopen_at {
            Some(due) if now >= due => {
                self.recovery.reopen_at = None;
                self.open(collab);
            }
            _ => {}
        }
    }

    /// An external open: forget past failures and any pending reopen.
    pub(crate) fn reset_recovery(&mut self) {
        self.recovery = Default::default();
    }

    /// An external close: drop any reopen that has not run yet.
    pub(crate) fn cancel_reopen(&mut self) {
        self.recovery.reopen_pending = false;
        self.recovery.reopen_at = None;
    }

    /// Shutting down: no further reopens, ever.
    pub(crate) fn disable_recovery(&mut self) {
        self.cancel_reopen();
        self.recovery.disabled = true;
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::ControllerConfig;
    use crate::handle::Dispatch;
    use crate::mock::Harness;
    use crate::request::CaptureKind;
    use crate::traits::{CaptureFailureReason, DeviceEvent};

    fn policy(max_attempts: Option<u32>) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_error_table() {
        use super::RecoveryAction::{Close, CloseAndReopen, Ignore};
        use crate::traits::DeviceErrorKind as Kind;

        assert_eq!(action_for(Kind::MaxCamerasInUse), CloseAndReopen);
        assert_eq!(action_for(Kind::CameraDevice), CloseAndReopen);
        assert_eq!(action_for(Kind::CameraInUse), Ignore);
        assert_eq!(action_for(Kind::CameraDisabled), Close);
        assert_eq!(action_for(Kind::CameraService), Close);
        assert_eq!(action_for(Kind::Other(42)), Close);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(None);
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_attempt_cap() {
        assert!(policy(Some(2)).allows(2));
        assert!(!policy(Some(2)).allows(3));
        assert!(policy(None).allows(u32::MAX));
    }

    #[test]
    fn test_double_capture_failure_reopens_once() {
        let mut h = Harness::manual();
        h.bring_up();

        let failure = || DeviceEvent::CaptureFailed {
            kind: CaptureKind::Preview,
            reason: CaptureFailureReason::Error,
        };
        h.deliver(failure());
        h.deliver(failure());
        assert_eq!(h.provider.session_closes(), 1);

        h.deliver(DeviceEvent::SessionClosed);
        h.deliver(failure());
        h.deliver(DeviceEvent::Closed);
        h.deliver(failure());

        assert_eq!(h.provider.device_closes(), 1);
        assert_eq!(h.provider.opens(), 2);
        assert!(h.handle.guards().open_requested);
        assert_eq!(h.handle.status().recovery_attempts, 1);
    }

    #[test]
    fn test_flushed_capture_is_not_a_fault() {
        let mut h = Harness::manual();
        h.bring_up();
        h.deliver(DeviceEvent::CaptureFailed {
            kind: CaptureKind::Still,
            reason: CaptureFailureReason::Flushed,
        });
        assert!(h.handle.is_previewing());
        assert_eq!(h.provider.session_closes(), 0);
    }

    #[test]
    fn test_fatal_device_error_closes_and_reopens() {
        let mut h = Harness::manual();
        h.bring_up();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraDevice));
        h.deliver(DeviceEvent::SessionClosed);
        h.deliver(DeviceEvent::Closed);
        assert_eq!(h.provider.opens(), 2);
    }

    #[test]
    fn test_disabled_error_closes_only() {
        let mut h = Harness::manual();
        h.bring_up();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraDisabled));
        h.deliver(DeviceEvent::SessionClosed);
        h.deliver(DeviceEvent::Closed);
        assert_eq!(h.provider.opens(), 1);
        assert!(h.handle.status().is_idle());
    }

    #[test]
    fn test_in_use_error_is_ignored() {
        let mut h = Harness::manual();
        h.bring_up();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraInUse));
        assert!(h.handle.is_previewing());
        assert_eq!(h.handle.guards(), Default::default());
    }

    #[test]
    fn test_open_failure_clears_guard_and_reopens() {
        let mut h = Harness::manual();
        h.open();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::MaxCamerasInUse));
        assert_eq!(h.provider.opens(), 2);
        assert!(h.handle.guards().open_requested);

        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraInUse));
        assert!(!h.handle.guards().open_requested);
        assert_eq!(h.handle.status().in_flight, None);
        assert_eq!(h.provider.opens(), 2);
    }

    #[test]
    fn test_open_failure_with_chained_close_stays_closed() {
        let mut h = Harness::manual();
        h.open();
        assert_eq!(h.close(), Dispatch::Deferred);
        h.deliver(DeviceEvent::Error(DeviceErrorKind::MaxCamerasInUse));

        assert!(h.handle.status().is_idle());
        assert!(!h.handle.guards().close_requested);
        assert_eq!(h.provider.opens(), 1);
    }

    #[test]
    fn test_open_failure_runs_open_deferred_behind_close() {
        let mut h = Harness::manual();
        h.open();
        assert_eq!(h.close(), Dispatch::Deferred);
        assert_eq!(h.open(), Dispatch::Deferred);
        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraDisabled));

        assert_eq!(h.provider.opens(), 2);
        assert!(h.handle.guards().open_requested);
        assert!(!h.handle.guards().close_requested);

        h.deliver_opened();
        assert!(h.handle.is_open());
        assert_eq!(h.provider.device_closes(), 0);
    }

    #[test]
    fn test_retry_budget_exhausts() {
        let mut config = ControllerConfig::default();
        config.recovery.max_attempts = 2;
        config.recovery.base_backoff_ms = 0;
        let mut h = Harness::with_config(config);

        h.open();
        for _ in 0..3 {
            h.deliver(DeviceEvent::Error(DeviceErrorKind::MaxCamerasInUse));
        }
        let status = h.handle.status();
        assert_eq!(h.provider.opens(), 3);
        assert!(status.recovery_exhausted);
        assert!(status.is_idle());

        // An external open starts over.
        h.handle.reset_recovery();
        assert_eq!(h.open(), Dispatch::Issued);
        assert!(!h.handle.status().recovery_exhausted);
    }

    #[test]
    fn test_active_session_resets_attempts() {
        let mut h = Harness::manual();
        h.open();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraDevice));
        assert_eq!(h.handle.status().recovery_attempts, 1);

        h.deliver_opened();
        h.deliver_session_configured();
        h.deliver(DeviceEvent::SessionActive);
        assert_eq!(h.handle.status().recovery_attempts, 0);
    }

    #[test]
    fn test_backoff_timer_runs_reopen() {
        let mut config = ControllerConfig::default();
        config.recovery.base_backoff_ms = 10_000;
        let mut h = Harness::with_config(config);

        h.open();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::MaxCamerasInUse));
        assert_eq!(h.provider.opens(), 1);
        assert!(h.handle.status().reopen_scheduled);
        assert!(!h.handle.status().is_idle());

        let due = h.handle.next_deadline().expect("reopen not scheduled");
        h.handle.on_timer(Instant::now(), &h.collab);
        assert_eq!(h.provider.opens(), 1);

        h.handle.on_timer(due, &h.collab);
        assert_eq!(h.provider.opens(), 2);
        assert_eq!(h.handle.next_deadline(), None);
    }

    #[test]
    fn test_cancel_reopen_drops_schedule() {
        let mut config = ControllerConfig::default();
        config.recovery.base_backoff_ms = 10_000;
        let mut h = Harness::with_config(config);

        h.open();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraDevice));
        h.handle.cancel_reopen();
        assert!(h.handle.status().is_idle());
        assert_eq!(h.handle.next_deadline(), None);
    }

    #[test]
    fn test_disabled_recovery_never_reopens() {
        let mut h = Harness::manual();
        h.bring_up();
        h.handle.disable_recovery();
        h.deliver(DeviceEvent::Error(DeviceErrorKind::CameraDevice));
        h.deliver(DeviceEvent::SessionClosed);
        h.deliver(DeviceEvent::Closed);
        assert_eq!(h.provider.opens(), 1);
        assert!(h.handle.status().is_idle());
    }
}
