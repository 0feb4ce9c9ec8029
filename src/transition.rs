//! Guarded open / start-preview / stop-preview / close transitions and the
//! callbacks that complete them.
//!
//! Each transition checks its guards, issues at most one call to the device
//! API and returns. Only one device-API call is outstanding per handle at a
//! time; a close requested while another call is outstanding is chained
//! behind it through `close_requested`.

use tracing::{debug, info, warn};

use crate::capture::preview_rotation;
use crate::handle::{Collaborators, DeviceHandle, DeviceState, Dispatch, FocusMode, PendingCall};
use crate::request::{AfMode, CaptureKind, CaptureRequest, RequestTemplate, SurfaceId};
use crate::traits::{CameraDevice, CaptureSession, DeviceEvent};

impl DeviceHandle {
    /// Deliver a device-API callback.
    pub fn handle_event(&mut self, event: DeviceEvent, collab: &Collaborators) {
        debug!(camera = %self.id(), ?event, "device event");
        match event {
            DeviceEvent::Opened(device) => self.on_opened(device, collab),
            DeviceEvent::Disconnected => self.on_disconnected(collab),
            DeviceEvent::Error(kind) => self.on_device_error(kind, collab),
            DeviceEvent::Closed => self.on_device_closed(collab),
            DeviceEvent::SessionConfigured(session) => self.on_session_configured(session, collab),
            DeviceEvent::SessionConfigureFailed => self.on_session_configure_failed(collab),
            DeviceEvent::SessionActive => self.on_session_active(),
            DeviceEvent::SessionClosed => self.on_session_closed(collab),
            DeviceEvent::CaptureCompleted { kind, result } => {
                self.on_capture_completed(kind, result, collab);
            }
            DeviceEvent::CaptureFailed { kind, reason } => {
                self.on_capture_failed(kind, reason, collab);
            }
        }
        debug_assert!(!self.is_previewing || self.is_open, "preview while closed");
    }

    /// Open the device, or resume the preview if it is already open.
    pub fn open(&mut self, collab: &Collaborators) -> Dispatch {
        if self.guards.is_closing || self.guards.close_requested {
            if !self.open_after_close {
                debug!(camera = %self.id(), "open deferred until close completes");
            }
            self.open_after_close = true;
            return Dispatch::Deferred;
        }
        if self.is_previewing {
            return Dispatch::Skipped;
        }
        if self.is_open {
            return self.start_preview(collab);
        }
        if self.guards.open_requested || !self.begin(PendingCall::OpenDevice) {
            return Dispatch::Skipped;
        }

        self.guards.open_requested = true;
        self.recovery.reopen_at = None;
        info!(camera = %self.id(), "opening camera");
        match collab.provider.open_device(self.id(), self.events.clone()) {
            Ok(()) => Dispatch::Issued,
            Err(err) => {
                warn!(camera = %self.id(), error = %err, "open request rejected");
                self.guards.open_requested = false;
                self.finish(PendingCall::OpenDevice);
                Dispatch::Rejected
            }
        }
    }

    /// Create a capture session feeding the preview output and the
    /// processing sink.
    ///
    /// A no-op when either surface is unavailable; callers retry later.
    pub fn start_preview(&mut self, collab: &Collaborators) -> Dispatch {
        if !self.is_open || self.guards.is_closing || self.guards.close_requested {
            return Dispatch::Skipped;
        }
        if self.is_previewing || self.guards.preview_start_requested || self.pending.is_some() {
            return Dispatch::Skipped;
        }
        if self.device.is_none() {
            return Dispatch::Skipped;
        }

        let Some(preview) = collab.output.preview_surface() else {
            debug!(camera = %self.id(), "preview surface not ready, not starting preview");
            return Dispatch::Skipped;
        };
        let Some(sink) = self.ensure_processing_sink(collab) else {
            warn!(camera = %self.id(), "processing sink unavailable, not starting preview");
            return Dispatch::Skipped;
        };

        let rotation = preview_rotation(&self.descriptor, collab.rotation.current());
        let target = self.config.preview_target;
        collab.output.attach_preview(preview, rotation, target);

        self.draft = Some(
            CaptureRequest::new(RequestTemplate::Preview)
                .with_target(preview)
                .with_target(sink),
        );

        let Some(device) = self.device.as_mut() else {
            return Dispatch::Skipped;
        };
        self.pending = Some(PendingCall::CreateSession);
        self.guards.preview_start_requested = true;
        debug!(camera = %self.descriptor.id, "creating preview session");
        match device.create_session(&[preview, sink]) {
            Ok(()) => Dispatch::Issued,
            Err(err) => {
                warn!(camera = %self.descriptor.id, error = %err, "session request rejected");
                self.guards.preview_start_requested = false;
                self.finish(PendingCall::CreateSession);
                Dispatch::Rejected
            }
        }
    }

    /// Close the running preview session.
    pub fn stop_preview(&mut self) -> Dispatch {
        if !self.is_previewing || self.guards.preview_stop_requested || self.pending.is_some() {
            return Dispatch::Skipped;
        }
        self.close_session()
    }

    /// Close the device, stopping the preview first if it is running.
    pub fn close(&mut self, collab: &Collaborators) -> Dispatch {
        self.open_after_close = false;
        if self.guards.is_closing {
            return Dispatch::Skipped;
        }
        if !self.is_open && !self.guards.open_requested {
            return Dispatch::Skipped;
        }
        if self.pending.is_some() {
            if !self.guards.close_requested {
                debug!(camera = %self.id(), pending = ?self.pending, "close deferred");
            }
            self.guards.close_requested = true;
            return Dispatch::Deferred;
        }

        info!(camera = %self.id(), "closing camera");
        if self.session.is_some() {
            self.guards.close_requested = true;
            match self.close_session() {
                Dispatch::Rejected => {}
                dispatch => return dispatch,
            }
        }
        self.close_device(collab)
    }

    fn close_session(&mut self) -> Dispatch {
        if self.session.is_none() || !self.begin(PendingCall::CloseSession) {
            return Dispatch::Skipped;
        }
        self.guards.preview_stop_requested = true;
        debug!(camera = %self.descriptor.id, "closing preview session");

        let result = match self.session.as_mut() {
            Some(session) => session.close(),
            None => Ok(()),
        };
        match result {
            Ok(()) => Dispatch::Issued,
            Err(err) => {
                warn!(camera = %self.descriptor.id, error = %err, "session close rejected");
                self.guards.preview_stop_requested = false;
                self.finish(PendingCall::CloseSession);
                Dispatch::Rejected
            }
        }
    }

    fn close_device(&mut self, collab: &Collaborators) -> Dispatch {
        if self.device.is_none() || !self.begin(PendingCall::CloseDevice) {
            return Dispatch::Skipped;
        }
        self.guards.close_requested = false;
        self.guards.is_closing = true;

        let result = match self.device.as_mut() {
            Some(device) => device.close(),
            None => Ok(()),
        };
        match result {
            Ok(()) => Dispatch::Issued,
            Err(err) => {
                warn!(camera = %self.id(), error = %err, "device close rejected, releasing handle");
                self.finish(PendingCall::CloseDevice);
                self.on_device_closed(collab);
                Dispatch::Rejected
            }
        }
    }

    /// Run a close that was chained behind the call that just completed.
    fn resume_close(&mut self, collab: &Collaborators) {
        self.guards.close_requested = false;
        let reopen = self.open_after_close;
        self.close(collab);
        self.open_after_close = reopen;
    }

    fn ensure_processing_sink(&mut self, collab: &Collaborators) -> Option<SurfaceId> {
        if self.processing_sink.is_none() {
            let size = self
                .config
                .processing_sink_size
                .unwrap_or_else(|| self.descriptor.sink_size());
            self.processing_sink = collab.output.create_processing_sink(size);
        }
        self.processing_sink
    }

    fn release_processing_sink(&mut self, collab: &Collaborators) {
        if self.processing_sink.take().is_some() {
            collab.output.detach_processing_sink();
        }
    }

    fn on_opened(&mut self, device: Box<dyn CameraDevice>, collab: &Collaborators) {
        if self.device.is_some() {
            warn!(camera = %self.id(), "duplicate open callback, dropping device");
            return;
        }
        self.finish(PendingCall::OpenDevice);
        self.guards.open_requested = false;
        self.device = Some(device);
        self.is_open = true;
        info!(camera = %self.id(), "camera opened");

        if self.guards.close_requested {
            self.resume_close(collab);
            return;
        }
        self.start_preview(collab);
    }

    fn on_disconnected(&mut self, collab: &Collaborators) {
        if !self.is_open {
            return;
        }
        warn!(camera = %self.id(), "camera disconnected");
        self.close(collab);
    }

    pub(crate) fn on_device_closed(&mut self, collab: &Collaborators) {
        self.pending = None;
        self.guards = Default::default();
        self.is_open = false;
        self.is_previewing = false;
        self.session = None;
        self.device = None;
        self.draft = None;
        self.state = DeviceState::Uninitialized;
        self.auto_focus_stuck_counter = 0;
        self.awaiting_ack = false;
        self.still_in_flight = false;
        self.release_processing_sink(collab);
        info!(camera = %self.id(), "camera closed");

        if self.recovery.reopen_pending {
            self.open_after_close = false;
            self.schedule_reopen(collab);
        } else if self.open_after_close {
            self.open_after_close = false;
            self.open(collab);
        }
    }

    fn on_session_configured(&mut self, session: Box<dyn CaptureSession>, collab: &Collaborators) {
        self.finish(PendingCall::CreateSession);
        if !self.is_open {
            return;
        }
        self.session = Some(session);

        if self.guards.close_requested {
            self.resume_close(collab);
            return;
        }

        let Some(mut draft) = self.draft.take() else {
            warn!(camera = %self.id(), "session configured without a preview request");
            return;
        };
        draft.kind = CaptureKind::Preview;
        draft.af_mode = Some(match self.focus_mode {
            FocusMode::Auto | FocusMode::Fixed => AfMode::Auto,
            FocusMode::Continuous => AfMode::ContinuousPicture,
        });
        self.apply_auto_flash(&mut draft);
        self.state = DeviceState::PreviewRunning;

        let result = match self.session.as_mut() {
            Some(session) => session.set_repeating_request(&draft),
            None => Ok(()),
        };
        self.draft = Some(draft);
        if let Err(err) = result {
            warn!(camera = %self.id(), error = %err, "repeating request rejected");
            self.on_capture_rejected(collab);
        }
    }

    fn on_session_configure_failed(&mut self, collab: &Collaborators) {
        self.finish(PendingCall::CreateSession);
        self.guards.preview_start_requested = false;
        if !self.is_open {
            return;
        }
        if self.guards.close_requested {
            self.resume_close(collab);
            return;
        }
        warn!(camera = %self.id(), "preview session configuration failed, trying again");
        self.start_preview(collab);
    }

    fn on_session_active(&mut self) {
        if !self.is_open
            || self.state != DeviceState::PreviewRunning
            || self.guards.preview_stop_requested
        {
            return;
        }
        self.guards.preview_start_requested = false;
        self.is_previewing = true;
        self.recovery.reset();
        info!(camera = %self.id(), "preview running");
    }

    fn on_session_closed(&mut self, collab: &Collaborators) {
        self.finish(PendingCall::CloseSession);
        self.is_previewing = false;
        self.guards.preview_start_requested = false;
        self.guards.preview_stop_requested = false;
        self.session = None;
        self.draft = None;
        self.state = DeviceState::Uninitialized;
        self.awaiting_ack = false;
        self.still_in_flight = false;
        self.release_processing_sink(collab);
        debug!(camera = %self.id(), "preview session closed");

        if !self.is_open || self.guards.is_closing {
            return;
        }
        if self.guards.close_requested {
            self.close_device(collab);
        }
    }
}
