//! Core traits and types for the asynchronous camera device API.
//!
//! Every call on these traits returns immediately. Its outcome is delivered
//! later as a [`DeviceEvent`] posted through the [`EventSink`] bound to the
//! device handle, onto that handle's serialized worker queue.

use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use thiserror::Error;

use crate::descriptor::DeviceDescriptor;
use crate::request::{CaptureKind, CaptureRequest, CaptureResult, Rotation, Size, SurfaceId};
use crate::worker::WorkerMessage;

/// Error type for camera operations that fail synchronously.
#[derive(Debug, Error)]
pub enum CameraError {
    /// No device with the given id exists.
    #[error("device {0} not found")]
    DeviceNotFound(String),
    /// The enumeration listed the same id twice.
    #[error("duplicate device id {0}")]
    DuplicateDevice(String),
    /// The device API refused access to the device.
    #[error("camera access failed: {0}")]
    Access(String),
    /// A call was made in a state the device API does not accept.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Error during a streaming operation.
    #[error("stream error: {0}")]
    StreamError(String),
    /// The worker thread owning the device has exited.
    #[error("worker for device {0} is gone")]
    WorkerGone(String),
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Error classes reported by the device-level error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Too many devices are open system-wide.
    MaxCamerasInUse,
    /// Another owner already holds this device.
    CameraInUse,
    /// Device access is disabled by policy.
    CameraDisabled,
    /// Fatal error inside the device.
    CameraDevice,
    /// Fatal error inside the camera service.
    CameraService,
    /// Unrecognized error code.
    Other(i32),
}

/// Why a capture submission failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailureReason {
    /// The device could not produce the capture.
    Error,
    /// The capture was discarded because its session was closing.
    Flushed,
}

/// A callback from the device API, delivered as a message to the handle.
pub enum DeviceEvent {
    /// The device opened; ownership of the device passes to the handle.
    Opened(Box<dyn CameraDevice>),
    /// The device disappeared.
    Disconnected,
    /// The device reported an error, either while opening or while open.
    Error(DeviceErrorKind),
    /// The device finished closing.
    Closed,
    /// The capture session is configured; ownership passes to the handle.
    SessionConfigured(Box<dyn CaptureSession>),
    /// The capture session could not be configured.
    SessionConfigureFailed,
    /// The session is active and frames are flowing.
    SessionActive,
    /// The session finished closing.
    SessionClosed,
    /// A submitted capture completed.
    CaptureCompleted {
        /// Which submission completed.
        kind: CaptureKind,
        /// Metadata reported with the result.
        result: CaptureResult,
    },
    /// A submitted capture failed.
    CaptureFailed {
        /// Which submission failed.
        kind: CaptureKind,
        /// Failure reason.
        reason: CaptureFailureReason,
    },
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(_) => f.write_str("Opened"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Error(kind) => f.debug_tuple("Error").field(kind).finish(),
            Self::Closed => f.write_str("Closed"),
            Self::SessionConfigured(_) => f.write_str("SessionConfigured"),
            Self::SessionConfigureFailed => f.write_str("SessionConfigureFailed"),
            Self::SessionActive => f.write_str("SessionActive"),
            Self::SessionClosed => f.write_str("SessionClosed"),
            Self::CaptureCompleted { kind, result } => f
                .debug_struct("CaptureCompleted")
                .field("kind", kind)
                .field("result", result)
                .finish(),
            Self::CaptureFailed { kind, reason } => f
                .debug_struct("CaptureFailed")
                .field("kind", kind)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Sender half of a device handle's queue, handed to the device API so it
/// can deliver callbacks in submission order.
#[derive(Clone)]
pub struct EventSink {
    camera_id: Arc<str>,
    tx: Sender<WorkerMessage>,
}

impl EventSink {
    pub(crate) fn new(camera_id: &str, tx: Sender<WorkerMessage>) -> Self {
        Self {
            camera_id: Arc::from(camera_id),
            tx,
        }
    }

    /// Id of the device this sink delivers to.
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Deliver an event. Returns `false` once the owning worker has exited.
    pub fn post(&self, event: DeviceEvent) -> bool {
        self.tx.send(WorkerMessage::Event(event)).is_ok()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("camera_id", &self.camera_id)
            .finish_non_exhaustive()
    }
}

/// Entry point of the device API: opens devices by id.
pub trait CameraProvider: Send + Sync {
    /// Request that the device be opened. Completes with
    /// [`DeviceEvent::Opened`] or [`DeviceEvent::Error`] on `events`.
    fn open_device(&self, id: &str, events: EventSink) -> Result<()>;
}

/// An open device, exclusively owned by its handle.
pub trait CameraDevice: Send {
    /// Request a capture session with the given output targets. Completes
    /// with [`DeviceEvent::SessionConfigured`] or
    /// [`DeviceEvent::SessionConfigureFailed`].
    fn create_session(&mut self, targets: &[SurfaceId]) -> Result<()>;

    /// Request that the device close. Completes with [`DeviceEvent::Closed`].
    fn close(&mut self) -> Result<()>;
}

/// A configured capture session.
pub trait CaptureSession: Send {
    /// Start (or replace) the repeating preview request. The first frame is
    /// reported with [`DeviceEvent::SessionActive`].
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<()>;

    /// Submit a one-shot capture. Completes with
    /// [`DeviceEvent::CaptureCompleted`] or [`DeviceEvent::CaptureFailed`]
    /// tagged with `request.kind`.
    fn capture(&mut self, request: &CaptureRequest) -> Result<()>;

    /// Request that the session close. Completes with
    /// [`DeviceEvent::SessionClosed`].
    fn close(&mut self) -> Result<()>;
}

/// Source of the immutable device list, queried once at startup.
pub trait DeviceEnumerator {
    /// List the devices present on the system.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// The preview output collaborator and the processing sink it hosts.
pub trait PreviewOutput: Send + Sync {
    /// The drawable preview surface, `None` while it is not ready.
    fn preview_surface(&self) -> Option<SurfaceId>;

    /// Create the processing sink with the given dimensions.
    fn create_processing_sink(&self, size: Size) -> Option<SurfaceId>;

    /// Connect the preview output to the processing sink.
    fn attach_preview(&self, preview: SurfaceId, rotation: Rotation, target: Size);

    /// Tear down the processing sink.
    fn detach_processing_sink(&self);
}

/// Supplies the current display rotation on demand.
pub trait DisplayRotation: Send + Sync {
    /// Current rotation of the display.
    fn current(&self) -> Rotation;
}

impl DisplayRotation for Rotation {
    fn current(&self) -> Rotation {
        *self
    }
}
