//! Still-capture sequencing: focus lock, precapture metering and the still
//! itself, driven by capture-completed callbacks.

use tracing::{debug, info, warn};

use crate::descriptor::DeviceDescriptor;
use crate::handle::{Collaborators, DeviceHandle, DeviceState, Dispatch, FocusMode};
use crate::request::{
    AeMode, AePrecaptureTrigger, AeState, AfMode, AfState, AfTrigger, CaptureKind, CaptureRequest,
    CaptureResult, RequestTemplate, Rotation,
};
use crate::traits::CaptureFailureReason;

/// Orientation in degrees to record in a still, from the sensor orientation
/// and the current display rotation.
#[must_use]
pub const fn jpeg_orientation(sensor_orientation: u32, display: Rotation) -> u32 {
    let base = match display {
        Rotation::Deg0 => 90,
        Rotation::Deg90 => 0,
        Rotation::Deg180 => 270,
        Rotation::Deg270 => 180,
    };
    (base + sensor_orientation % 360 + 270) % 360
}

/// Rotation to apply to preview frames so they appear upright. User-facing
/// and external lenses are mirrored.
#[must_use]
pub fn preview_rotation(descriptor: &DeviceDescriptor, display: Rotation) -> Rotation {
    let sensor = descriptor.sensor_orientation % 360;
    let display = display.degrees();
    let degrees = if descriptor.is_front() || descriptor.is_external() {
        (360 - (sensor + display) % 360) % 360
    } else {
        (sensor + 360 - display) % 360
    };
    Rotation::from_degrees(degrees).unwrap_or(Rotation::Deg0)
}

impl DeviceHandle {
    /// Start a still capture from the running preview.
    ///
    /// Ignored unless the preview session is active and no capture is in
    /// progress.
    pub fn take_picture(&mut self, collab: &Collaborators) -> Dispatch {
        if !self.is_open || self.session.is_none() {
            debug!(camera = %self.id(), "no session, ignoring capture");
            return Dispatch::Skipped;
        }
        if self.guards.close_requested
            || self.guards.is_closing
            || self.guards.preview_stop_requested
        {
            return Dispatch::Skipped;
        }
        if !self.is_previewing {
            debug!(camera = %self.id(), "preview not active yet, ignoring capture");
            return Dispatch::Skipped;
        }
        if self.state != DeviceState::PreviewRunning {
            debug!(camera = %self.id(), state = ?self.state, "capture already in progress");
            return Dispatch::Skipped;
        }
        info!(camera = %self.id(), focus = ?self.focus_mode, "taking picture");
        self.lock_focus(collab)
    }

    fn lock_focus(&mut self, collab: &Collaborators) -> Dispatch {
        if !self.descriptor.has_auto_focus() || self.focus_mode != FocusMode::Auto {
            return self.capture_still(collab);
        }
        let Some(base) = self.draft.clone() else {
            return Dispatch::Skipped;
        };

        let mut cancel = base.tagged(CaptureKind::FocusCancel);
        cancel.af_mode = Some(AfMode::Auto);
        cancel.af_trigger = Some(AfTrigger::Cancel);
        self.apply_auto_flash(&mut cancel);

        let mut trigger = base.tagged(CaptureKind::FocusTrigger);
        trigger.af_mode = Some(AfMode::Auto);
        trigger.af_trigger = Some(AfTrigger::Start);
        self.apply_auto_flash(&mut trigger);

        self.state = DeviceState::WaitingFocusLock;
        self.auto_focus_stuck_counter = 0;
        self.awaiting_ack = true;
        for request in [cancel, trigger] {
            if self.submit(&request, collab) != Dispatch::Issued {
                return Dispatch::Rejected;
            }
        }
        Dispatch::Issued
    }

    fn run_precapture(&mut self, collab: &Collaborators) {
        let Some(base) = self.draft.as_ref() else {
            return;
        };
        let mut request = base.tagged(CaptureKind::Precapture);
        request.ae_precapture_trigger = Some(AePrecaptureTrigger::Start);
        self.apply_auto_flash(&mut request);

        self.state = DeviceState::WaitingExposureLock;
        self.auto_focus_stuck_counter = 0;
        self.awaiting_ack = true;
        self.submit(&request, collab);
    }

    fn capture_still(&mut self, collab: &Collaborators) -> Dispatch {
        let Some(sink) = self.processing_sink else {
            warn!(camera = %self.id(), "no processing sink, dropping capture");
            self.state = DeviceState::PreviewRunning;
            return Dispatch::Skipped;
        };

        let mut request = CaptureRequest::new(RequestTemplate::StillCapture).with_target(sink);
        match self.focus_mode {
            FocusMode::Continuous => request.af_mode = Some(AfMode::ContinuousPicture),
            FocusMode::Auto => request.af_trigger = Some(AfTrigger::Idle),
            FocusMode::Fixed => {}
        }
        request.jpeg_orientation = Some(jpeg_orientation(
            self.descriptor.sensor_orientation,
            collab.rotation.current(),
        ));
        self.apply_auto_flash(&mut request);

        self.state = DeviceState::ImageRequested;
        self.awaiting_ack = false;
        self.still_in_flight = true;
        self.submit(&request, collab)
    }

    /// Release the focus lock taken for the still.
    fn unlock_focus(&mut self, collab: &Collaborators) {
        if !self.descriptor.has_auto_focus() || self.focus_mode != FocusMode::Auto {
            return;
        }
        let Some(base) = self.draft.as_ref() else {
            return;
        };
        let mut request = base.tagged(CaptureKind::FocusCancel);
        request.af_mode = Some(AfMode::Auto);
        request.af_trigger = Some(AfTrigger::Cancel);
        self.apply_auto_flash(&mut request);
        self.submit(&request, collab);
    }

    pub(crate) fn apply_auto_flash(&self, request: &mut CaptureRequest) {
        if self.descriptor.has_flash {
            request.ae_mode = Some(AeMode::OnAutoFlash);
        }
    }

    fn submit(&mut self, request: &CaptureRequest, collab: &Collaborators) -> Dispatch {
        let Some(session) = self.session.as_mut() else {
            return Dispatch::Skipped;
        };
        match session.capture(request) {
            Ok(()) => Dispatch::Issued,
            Err(err) => {
                warn!(
                    camera = %self.descriptor.id,
                    kind = ?request.kind,
                    error = %err,
                    "capture rejected"
                );
                self.on_capture_rejected(collab);
                Dispatch::Rejected
            }
        }
    }

    /// Whether a completion of `kind` should be judged while waiting on
    /// `expected`. Until the trigger itself completes, only its completion
    /// counts; after that, every preview frame does.
    fn counts_toward(&mut self, kind: CaptureKind, expected: CaptureKind) -> bool {
        if self.awaiting_ack {
            if kind == expected {
                self.awaiting_ack = false;
                return true;
            }
            return false;
        }
        kind == expected || kind == CaptureKind::Preview
    }

    /// Count a frame spent waiting. Returns `true` once the wait has run
    /// long enough to proceed regardless.
    fn waited_too_long(&mut self, what: &str) -> bool {
        self.auto_focus_stuck_counter = self.auto_focus_stuck_counter.saturating_add(1);
        if self.auto_focus_stuck_counter < self.config.max_convergence_frames {
            return false;
        }
        warn!(
            camera = %self.id(),
            frames = self.auto_focus_stuck_counter,
            "{what} did not settle, capturing anyway"
        );
        true
    }

    pub(crate) fn on_capture_completed(
        &mut self,
        kind: CaptureKind,
        result: CaptureResult,
        collab: &Collaborators,
    ) {
        if !self.is_open || self.session.is_none() {
            return;
        }
        match self.state {
            DeviceState::Uninitialized | DeviceState::PreviewRunning => {}
            DeviceState::WaitingFocusLock => {
                if self.counts_toward(kind, CaptureKind::FocusTrigger) {
                    self.on_focus_result(result, collab);
                }
            }
            DeviceState::WaitingExposureLock => {
                if self.counts_toward(kind, CaptureKind::Precapture) {
                    self.on_exposure_result(result, collab);
                }
            }
            DeviceState::ImageRequested => {
                if kind == CaptureKind::Still && self.still_in_flight {
                    self.still_in_flight = false;
                    self.stills_completed += 1;
                    info!(camera = %self.id(), total = self.stills_completed, "picture taken");
                    self.unlock_focus(collab);
                } else if kind == CaptureKind::Preview && !self.still_in_flight {
                    self.state = DeviceState::PreviewRunning;
                }
            }
        }
    }

    fn on_focus_result(&mut self, result: CaptureResult, collab: &Collaborators) {
        let locked = result.af_state.is_none_or(AfState::is_locked);
        if locked || self.waited_too_long("focus") {
            self.run_precapture(collab);
        }
    }

    fn on_exposure_result(&mut self, result: CaptureResult, collab: &Collaborators) {
        let settled = result.ae_state.is_none_or(AeState::is_settled);
        if settled || self.waited_too_long("exposure") {
            self.capture_still(collab);
        }
    }

    pub(crate) fn on_capture_failed(
        &mut self,
        kind: CaptureKind,
        reason: CaptureFailureReason,
        collab: &Collaborators,
    ) {
        if reason == CaptureFailureReason::Flushed {
            debug!(camera = %self.id(), ?kind, "capture flushed");
            return;
        }
        warn!(camera = %self.id(), ?kind, "capture failed");
        self.on_capture_rejected(collab);
    }
}
