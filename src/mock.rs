//! Mock device API for testing without hardware.
//!
//! [`MockProvider`] records every call it receives. In manual mode it never
//! answers, and tests deliver callbacks by hand through a [`Harness`]. In
//! responsive mode each call posts its completion events immediately, the way
//! a well-behaved device would.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::ControllerConfig;
use crate::descriptor::{DeviceDescriptor, LensFacing};
use crate::handle::{Collaborators, DeviceHandle, Dispatch};
use crate::request::{CaptureKind, CaptureRequest, CaptureResult, Rotation, Size, SurfaceId};
use crate::traits::{
    CameraDevice, CameraError, CameraProvider, CaptureSession, DeviceErrorKind, DeviceEvent,
    EventSink, PreviewOutput, Result,
};
use crate::worker::WorkerMessage;

const PREVIEW_SURFACE: SurfaceId = SurfaceId(1);
const SINK_SURFACE: SurfaceId = SurfaceId(2);

/// Config used by tests: reopen without delay.
#[must_use]
pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.recovery.base_backoff_ms = 0;
    config
}

/// A call received by the mock device API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `open_device`.
    OpenDevice(String),
    /// `create_session` with its targets.
    CreateSession(Vec<SurfaceId>),
    /// `set_repeating_request`.
    SetRepeating(CaptureRequest),
    /// One-shot `capture`.
    Capture(CaptureRequest),
    /// Session `close`.
    CloseSession,
    /// Device `close`.
    CloseDevice,
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<Call>,
    outstanding: usize,
    respond: bool,
    reject_open: bool,
    open_error: Option<DeviceErrorKind>,
    reject_capture: bool,
    capture_result: CaptureResult,
    hold_close: bool,
    held_close: Option<EventSink>,
}

/// Recording device API.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    script: Arc<Mutex<Script>>,
}

impl MockProvider {
    /// A provider that never answers on its own.
    #[must_use]
    pub fn manual() -> Self {
        Self::default()
    }

    /// A provider that answers every call at once.
    #[must_use]
    pub fn responsive() -> Self {
        let provider = Self::default();
        provider.with_script(|script| script.respond = true);
        provider
    }

    fn with_script<R, F: FnOnce(&mut Script) -> R>(&self, f: F) -> R {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut script)
    }

    /// Record `call`; returns whether to answer it.
    fn record(&self, call: Call) -> bool {
        self.with_script(|script| {
            let answered = matches!(call, Call::OpenDevice(_) | Call::CreateSession(_))
                || matches!(call, Call::CloseSession | Call::CloseDevice);
            if answered {
                script.outstanding += 1;
            }
            script.calls.push(call);
            script.respond
        })
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.with_script(|script| script.calls.clone())
    }

    /// Number of calls matching `predicate`.
    pub fn count<P: Fn(&Call) -> bool>(&self, predicate: P) -> usize {
        let calls = self.calls();
        calls.iter().filter(|call| predicate(call)).count()
    }

    /// Number of `open_device` calls.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.count(|call| matches!(call, Call::OpenDevice(_)))
    }

    /// Number of `create_session` calls.
    #[must_use]
    pub fn session_creates(&self) -> usize {
        self.count(|call| matches!(call, Call::CreateSession(_)))
    }

    /// Number of repeating requests set.
    #[must_use]
    pub fn repeating_requests(&self) -> usize {
        self.count(|call| matches!(call, Call::SetRepeating(_)))
    }

    /// Number of session `close` calls.
    #[must_use]
    pub fn session_closes(&self) -> usize {
        self.count(|call| matches!(call, Call::CloseSession))
    }

    /// Number of device `close` calls.
    #[must_use]
    pub fn device_closes(&self) -> usize {
        self.count(|call| matches!(call, Call::CloseDevice))
    }

    /// Kinds of the one-shot captures submitted so far.
    #[must_use]
    pub fn captures(&self) -> Vec<CaptureKind> {
        self.with_script(|script| {
            script
                .calls
                .iter()
                .filter_map(|call| match call {
                    Call::Capture(request) => Some(request.kind),
                    _ => None,
                })
                .collect()
        })
    }

    /// Kind of the most recent one-shot capture.
    #[must_use]
    pub fn last_kind(&self) -> Option<CaptureKind> {
        self.captures().last().copied()
    }

    /// The most recent one-shot capture.
    #[must_use]
    pub fn last_capture(&self) -> Option<CaptureRequest> {
        self.with_script(|script| {
            script.calls.iter().rev().find_map(|call| match call {
                Call::Capture(request) => Some(request.clone()),
                _ => None,
            })
        })
    }

    /// Lifecycle calls issued whose completion has not been delivered.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.with_script(|script| script.outstanding)
    }

    fn completed(&self) {
        self.with_script(|script| {
            script.outstanding = script.outstanding.saturating_sub(1);
        });
    }

    /// Refuse `open_device` synchronously.
    pub fn reject_open(&self, reject: bool) {
        self.with_script(|script| script.reject_open = reject);
    }

    /// Answer opens with this error instead of a device.
    pub fn fail_open_with(&self, kind: Option<DeviceErrorKind>) {
        self.with_script(|script| script.open_error = kind);
    }

    /// Refuse `capture` synchronously.
    pub fn reject_capture(&self, reject: bool) {
        self.with_script(|script| script.reject_capture = reject);
    }

    /// Keep device closes pending until [`Self::release_close`].
    pub fn hold_close(&self, hold: bool) {
        self.with_script(|script| script.hold_close = hold);
    }

    /// Deliver the closed callback of a held device close.
    pub fn release_close(&self) {
        if let Some(events) = self.with_script(|script| script.held_close.take()) {
            events.post(DeviceEvent::Closed);
        }
    }

    /// Result reported with answered captures.
    pub fn set_capture_result(&self, result: CaptureResult) {
        self.with_script(|script| script.capture_result = result);
    }

    /// A device bound to `events`, as the opened callback would deliver.
    #[must_use]
    pub fn device(&self, events: EventSink) -> Box<dyn CameraDevice> {
        Box::new(MockDevice {
            provider: self.clone(),
            events,
        })
    }

    /// A session bound to `events`, as the configured callback would deliver.
    #[must_use]
    pub fn session(&self, events: EventSink) -> Box<dyn CaptureSession> {
        Box::new(MockSession {
            provider: self.clone(),
            events,
        })
    }
}

impl CameraProvider for MockProvider {
    fn open_device(&self, id: &str, events: EventSink) -> Result<()> {
        if self.with_script(|script| script.reject_open) {
            return Err(CameraError::Access(format!("camera {id} refused")));
        }
        if self.record(Call::OpenDevice(id.to_owned())) {
            match self.with_script(|script| script.open_error) {
                Some(kind) => events.post(DeviceEvent::Error(kind)),
                None => events.post(DeviceEvent::Opened(self.device(events.clone()))),
            };
        }
        Ok(())
    }
}

struct MockDevice {
    provider: MockProvider,
    events: EventSink,
}

impl CameraDevice for MockDevice {
    fn create_session(&mut self, targets: &[SurfaceId]) -> Result<()> {
        if self.provider.record(Call::CreateSession(targets.to_vec())) {
            let session = self.provider.session(self.events.clone());
            self.events.post(DeviceEvent::SessionConfigured(session));
            self.events.post(DeviceEvent::SessionActive);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.provider.record(Call::CloseDevice) {
            return Ok(());
        }
        let held = self.provider.with_script(|script| {
            if script.hold_close {
                script.held_close = Some(self.events.clone());
            }
            script.hold_close
        });
        if !held {
            self.events.post(DeviceEvent::Closed);
        }
        Ok(())
    }
}

struct MockSession {
    provider: MockProvider,
    events: EventSink,
}

impl CaptureSession for MockSession {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<()> {
        self.provider.record(Call::SetRepeating(request.clone()));
        Ok(())
    }

    fn capture(&mut self, request: &CaptureRequest) -> Result<()> {
        if self.provider.with_script(|script| script.reject_capture) {
            return Err(CameraError::IllegalState("session is closed".to_owned()));
        }
        if self.provider.record(Call::Capture(request.clone())) {
            let result = self.provider.with_script(|script| script.capture_result);
            self.events.post(DeviceEvent::CaptureCompleted {
                kind: request.kind,
                result,
            });
            // The repeating request resumes after every one-shot.
            self.events.post(DeviceEvent::CaptureCompleted {
                kind: CaptureKind::Preview,
                result,
            });
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.provider.record(Call::CloseSession) {
            self.events.post(DeviceEvent::SessionClosed);
        }
        Ok(())
    }
}

/// A call received by [`MockOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCommand {
    /// Processing sink created.
    CreateSink(Size),
    /// Preview attached.
    Attach {
        /// Preview surface.
        preview: SurfaceId,
        /// Image rotation.
        rotation: Rotation,
        /// Target size.
        target: Size,
    },
    /// Processing sink detached.
    DetachSink,
}

#[derive(Debug)]
struct OutputState {
    surface_ready: bool,
    sink_available: bool,
    commands: Vec<OutputCommand>,
}

/// Recording preview output with fixed surface ids.
#[derive(Debug)]
pub struct MockOutput {
    state: Mutex<OutputState>,
}

impl Default for MockOutput {
    fn default() -> Self {
        Self {
            state: Mutex::new(OutputState {
                surface_ready: true,
                sink_available: true,
                commands: Vec::new(),
            }),
        }
    }
}

impl MockOutput {
    fn with_state<R, F: FnOnce(&mut OutputState) -> R>(&self, f: F) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Make the preview surface available or not.
    pub fn set_surface_ready(&self, ready: bool) {
        self.with_state(|state| state.surface_ready = ready);
    }

    /// Make processing sink creation succeed or not.
    pub fn set_sink_available(&self, available: bool) {
        self.with_state(|state| state.sink_available = available);
    }

    /// Every command so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<OutputCommand> {
        self.with_state(|state| state.commands.clone())
    }

    /// Id of the preview surface.
    #[must_use]
    pub const fn preview_id(&self) -> SurfaceId {
        PREVIEW_SURFACE
    }

    /// Id of the processing sink.
    #[must_use]
    pub const fn sink_id(&self) -> SurfaceId {
        SINK_SURFACE
    }
}

impl PreviewOutput for MockOutput {
    fn preview_surface(&self) -> Option<SurfaceId> {
        self.with_state(|state| state.surface_ready.then_some(PREVIEW_SURFACE))
    }

    fn create_processing_sink(&self, size: Size) -> Option<SurfaceId> {
        self.with_state(|state| {
            state.commands.push(OutputCommand::CreateSink(size));
            state.sink_available.then_some(SINK_SURFACE)
        })
    }

    fn attach_preview(&self, preview: SurfaceId, rotation: Rotation, target: Size) {
        self.with_state(|state| {
            state.commands.push(OutputCommand::Attach {
                preview,
                rotation,
                target,
            });
        });
    }

    fn detach_processing_sink(&self) {
        self.with_state(|state| state.commands.push(OutputCommand::DetachSink));
    }
}

/// A handle driven directly on the test thread.
///
/// Events the mock posts land on `rx` and are only delivered by
/// [`Harness::pump_one`]; manual tests deliver events with
/// [`Harness::deliver`] instead.
pub struct Harness {
    /// Handle under test.
    pub handle: DeviceHandle,
    /// Device API.
    pub provider: MockProvider,
    /// Preview output.
    pub output: Arc<MockOutput>,
    /// Collaborators passed to the handle.
    pub collab: Collaborators,
    events: EventSink,
    rx: Receiver<WorkerMessage>,
}

impl Harness {
    /// Back-facing fixed-focus camera, manual provider.
    #[must_use]
    pub fn manual() -> Self {
        Self::with(DeviceDescriptor::new("0", LensFacing::Back), test_config())
    }

    /// Back-facing fixed-focus camera, responsive provider.
    #[must_use]
    pub fn responsive() -> Self {
        Self::build(
            DeviceDescriptor::new("0", LensFacing::Back),
            test_config(),
            MockProvider::responsive(),
        )
    }

    /// Manual provider with the given config.
    #[must_use]
    pub fn with_config(config: ControllerConfig) -> Self {
        Self::with(DeviceDescriptor::new("0", LensFacing::Back), config)
    }

    /// Manual provider with the given camera and config.
    #[must_use]
    pub fn with(descriptor: DeviceDescriptor, config: ControllerConfig) -> Self {
        Self::build(descriptor, config, MockProvider::manual())
    }

    fn build(
        descriptor: DeviceDescriptor,
        config: ControllerConfig,
        provider: MockProvider,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let events = EventSink::new(&descriptor.id, tx);
        let output = Arc::new(MockOutput::default());
        let collab = Collaborators {
            provider: Arc::new(provider.clone()),
            output: Arc::clone(&output) as Arc<dyn PreviewOutput>,
            rotation: Arc::new(Rotation::Deg0),
        };
        let handle = DeviceHandle::new(Arc::new(descriptor), Arc::new(config), events.clone());
        Self {
            handle,
            provider,
            output,
            collab,
            events,
            rx,
        }
    }

    /// Open the handle.
    pub fn open(&mut self) -> Dispatch {
        self.handle.open(&self.collab)
    }

    /// Start the preview.
    pub fn start_preview(&mut self) -> Dispatch {
        self.handle.start_preview(&self.collab)
    }

    /// Close the handle.
    pub fn close(&mut self) -> Dispatch {
        self.handle.close(&self.collab)
    }

    /// Take a picture.
    pub fn take_picture(&mut self) -> Dispatch {
        self.handle.take_picture(&self.collab)
    }

    /// Deliver one callback.
    pub fn deliver(&mut self, event: DeviceEvent) {
        if matches!(
            event,
            DeviceEvent::Opened(_)
                | DeviceEvent::Closed
                | DeviceEvent::SessionConfigured(_)
                | DeviceEvent::SessionConfigureFailed
                | DeviceEvent::SessionClosed
        ) {
            self.provider.completed();
        }
        self.handle.handle_event(event, &self.collab);
    }

    /// Deliver the opened callback with a fresh mock device.
    pub fn deliver_opened(&mut self) {
        let device = self.provider.device(self.events.clone());
        self.deliver(DeviceEvent::Opened(device));
    }

    /// Deliver the session-configured callback with a fresh mock session.
    pub fn deliver_session_configured(&mut self) {
        let session = self.provider.session(self.events.clone());
        self.deliver(DeviceEvent::SessionConfigured(session));
    }

    /// Deliver a capture completion carrying no 3A state.
    pub fn deliver_capture_completed(&mut self, kind: CaptureKind) {
        self.deliver_capture_result(kind, CaptureResult::default());
    }

    /// Deliver a capture completion.
    pub fn deliver_capture_result(&mut self, kind: CaptureKind, result: CaptureResult) {
        self.deliver(DeviceEvent::CaptureCompleted { kind, result });
    }

    /// Open and run the preview up to session-active, by hand.
    pub fn bring_up(&mut self) {
        self.open();
        self.deliver_opened();
        self.deliver_session_configured();
        self.deliver(DeviceEvent::SessionActive);
        assert!(self.handle.is_previewing(), "preview should be running");
    }

    /// Deliver the oldest queued event, if any.
    pub fn pump_one(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(WorkerMessage::Event(event)) => {
                self.deliver(event);
                true
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Deliver queued events until none are left.
    pub fn pump(&mut self) {
        while self.pump_one() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::DeviceState;

    #[test]
    fn test_manual_provider_only_records() {
        let mut h = Harness::manual();
        h.open();
        assert_eq!(h.provider.calls(), vec![Call::OpenDevice("0".to_owned())]);
        assert_eq!(h.provider.outstanding(), 1);
        assert!(!h.pump_one());
    }

    #[test]
    fn test_responsive_provider_answers() {
        let mut h = Harness::responsive();
        h.open();
        h.pump();
        assert!(h.handle.is_previewing());
        assert_eq!(h.handle.state(), DeviceState::PreviewRunning);
        assert_eq!(h.provider.outstanding(), 0);
    }

    #[test]
    fn test_open_error_is_posted() {
        let mut h = Harness::responsive();
        let in_use = Some(DeviceErrorKind::CameraInUse);
        h.provider.fail_open_with(in_use);
        h.open();
        h.pump();
        assert!(h.handle.status().is_idle());
    }

    #[test]
    fn test_capture_result_is_reported() {
        let mut h = Harness::responsive();
        h.provider.set_capture_result(CaptureResult {
            af_state: None,
            ae_state: Some(crate::request::AeState::Converged),
        });
        h.open();
        h.pump();
        h.take_picture();
        h.pump();
        assert_eq!(h.handle.status().stills_completed, 1);
        assert_eq!(h.handle.state(), DeviceState::PreviewRunning);
    }
}
