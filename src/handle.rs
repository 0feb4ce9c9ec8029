//! Per-device state: guard flags, observed session truth and the capture
//! sequence state.
//!
//! A [`DeviceHandle`] is only ever touched from its device's worker thread.
//! The transition protocol, capture sequencer and recovery policy are
//! implemented as further `impl DeviceHandle` blocks in their own modules.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::ControllerConfig;
use crate::descriptor::DeviceDescriptor;
use crate::recovery::{RecoveryPolicy, RecoveryState};
use crate::request::{CaptureRequest, SurfaceId};
use crate::traits::{
    CameraDevice, CameraProvider, CaptureSession, DisplayRotation, EventSink, PreviewOutput,
};

/// Stage of the still-capture sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceState {
    /// No session running.
    #[default]
    Uninitialized,
    /// Preview is streaming; ready for a still capture.
    PreviewRunning,
    /// Waiting for the AF scan to lock.
    WaitingFocusLock,
    /// Waiting for AE precapture metering.
    WaitingExposureLock,
    /// Still capture submitted.
    ImageRequested,
}

/// The focus mechanism to request for captures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusMode {
    /// Trigger-driven auto-focus before each still.
    #[default]
    Auto,
    /// Continuous auto-focus.
    Continuous,
    /// Fixed-focus lenses.
    Fixed,
}

/// In-flight request guards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Guards {
    /// An open call is outstanding.
    pub open_requested: bool,
    /// A session is being created and has not gone active yet.
    pub preview_start_requested: bool,
    /// A session close is outstanding.
    pub preview_stop_requested: bool,
    /// A device close is chained behind the outstanding call.
    pub close_requested: bool,
    /// A device close call is outstanding.
    pub is_closing: bool,
}

/// Device-API call currently awaiting its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCall {
    /// Open device.
    OpenDevice,
    /// Create capture session.
    CreateSession,
    /// Close capture session.
    CloseSession,
    /// Close device.
    CloseDevice,
}

/// Outcome of a transition or capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A call was issued to the device API.
    Issued,
    /// The request will run once the outstanding call completes.
    Deferred,
    /// Preconditions not met; nothing happened.
    Skipped,
    /// The device API refused the call synchronously; guards were rolled back.
    Rejected,
}

/// Point-in-time copy of a handle's state, safe to share across threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStatus {
    /// Capture sequence state.
    pub state: DeviceState,
    /// Guard flags.
    pub guards: Guards,
    /// Device is open.
    pub is_open: bool,
    /// Preview frames are flowing.
    pub is_previewing: bool,
    /// Call awaiting completion.
    pub in_flight: Option<PendingCall>,
    /// Current focus mode.
    pub focus_mode: FocusMode,
    /// Frames spent waiting on the current 3A lock.
    pub auto_focus_stuck_counter: u32,
    /// Consecutive recovery reopens since the last healthy session.
    pub recovery_attempts: u32,
    /// A recovery reopen is waiting on its backoff timer.
    pub reopen_scheduled: bool,
    /// Recovery gave up after exhausting its attempts.
    pub recovery_exhausted: bool,
    /// Still captures completed since the handle was created.
    pub stills_completed: u64,
}

impl HandleStatus {
    /// Closed with nothing pending.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        !self.is_open
            && !self.guards.open_requested
            && !self.guards.is_closing
            && !self.reopen_scheduled
    }
}

/// The collaborators a handle calls out to. Shared by every handle.
#[derive(Clone)]
pub struct Collaborators {
    /// Device API entry point.
    pub provider: Arc<dyn CameraProvider>,
    /// Preview output and processing sink host.
    pub output: Arc<dyn PreviewOutput>,
    /// Display rotation query.
    pub rotation: Arc<dyn DisplayRotation>,
}

/// One physical device and everything in flight on it.
pub struct DeviceHandle {
    pub(crate) descriptor: Arc<DeviceDescriptor>,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) policy: RecoveryPolicy,
    pub(crate) events: EventSink,
    pub(crate) device: Option<Box<dyn CameraDevice>>,
    pub(crate) session: Option<Box<dyn CaptureSession>>,
    pub(crate) processing_sink: Option<SurfaceId>,
    pub(crate) draft: Option<CaptureRequest>,
    pub(crate) state: DeviceState,
    pub(crate) guards: Guards,
    pub(crate) pending: Option<PendingCall>,
    pub(crate) is_open: bool,
    pub(crate) is_previewing: bool,
    pub(crate) focus_mode: FocusMode,
    pub(crate) auto_focus_stuck_counter: u32,
    pub(crate) awaiting_ack: bool,
    pub(crate) still_in_flight: bool,
    pub(crate) open_after_close: bool,
    pub(crate) recovery: RecoveryState,
    pub(crate) stills_completed: u64,
}

impl DeviceHandle {
    /// Create a closed handle bound to `events`.
    #[must_use]
    pub fn new(
        descriptor: Arc<DeviceDescriptor>,
        config: Arc<ControllerConfig>,
        events: EventSink,
    ) -> Self {
        Self {
            policy: config.recovery_policy(),
            focus_mode: config.focus_mode,
            descriptor,
            config,
            events,
            device: None,
            session: None,
            processing_sink: None,
            draft: None,
            state: DeviceState::Uninitialized,
            guards: Guards::default(),
            pending: None,
            is_open: false,
            is_previewing: false,
            auto_focus_stuck_counter: 0,
            awaiting_ack: false,
            still_in_flight: false,
            open_after_close: false,
            recovery: RecoveryState::default(),
            stills_completed: 0,
        }
    }

    /// Device id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Static capabilities.
    #[must_use]
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Capture sequence state.
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Guard flags.
    #[must_use]
    pub const fn guards(&self) -> Guards {
        self.guards
    }

    /// Whether the device is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.is_open
    }

    /// Whether preview frames are flowing.
    #[must_use]
    pub const fn is_previewing(&self) -> bool {
        self.is_previewing
    }

    /// Current focus mode.
    #[must_use]
    pub const fn focus_mode(&self) -> FocusMode {
        self.focus_mode
    }

    /// Change the focus mode. Applies from the next session configuration or
    /// still capture.
    pub fn set_focus_mode(&mut self, mode: FocusMode) {
        self.focus_mode = mode;
    }

    /// Snapshot for observers on other threads.
    #[must_use]
    pub const fn status(&self) -> HandleStatus {
        HandleStatus {
            state: self.state,
            guards: self.guards,
            is_open: self.is_open,
            is_previewing: self.is_previewing,
            in_flight: self.pending,
            focus_mode: self.focus_mode,
            auto_focus_stuck_counter: self.auto_focus_stuck_counter,
            recovery_attempts: self.recovery.attempts,
            reopen_scheduled: self.recovery.reopen_at.is_some(),
            recovery_exhausted: self.recovery.exhausted,
            stills_completed: self.stills_completed,
        }
    }

    /// Mark a call as outstanding. Fails if another call already is.
    pub(crate) fn begin(&mut self, call: PendingCall) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(call);
        true
    }

    /// Clear the outstanding call if it is `call`.
    pub(crate) fn finish(&mut self, call: PendingCall) {
        if self.pending == Some(call) {
            self.pending = None;
        }
    }
}
