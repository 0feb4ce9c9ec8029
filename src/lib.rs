//! Camera-Session: a concurrency-safe camera device lifecycle controller
//!
//! This library drives an asynchronous, callback-based camera device API:
//! opening devices, running a preview session, taking still pictures through
//! focus and exposure locking, and recovering from device faults. Each device
//! is owned by one worker thread; the device API itself is a set of traits,
//! with a V4L2 backend behind the `v4l2` feature and a mock for tests.

pub mod capture;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod handle;
pub mod output;
pub mod recovery;
pub mod request;
pub mod selection;
pub mod traits;
mod transition;
pub mod worker;

#[cfg(feature = "v4l2")]
pub mod device;

#[cfg(test)]
pub mod mock;

pub use config::{ControllerConfig, RecoveryConfig};
pub use controller::CameraController;
pub use descriptor::{DeviceDescriptor, LensFacing};
pub use handle::{DeviceState, FocusMode, HandleStatus};
pub use output::HeadlessOutput;
pub use selection::select_device;
pub use traits::{
    CameraDevice, CameraError, CameraProvider, CaptureSession, DeviceEnumerator, DeviceEvent,
    DisplayRotation, EventSink, PreviewOutput, Result,
};

#[cfg(feature = "v4l2")]
pub use device::V4l2Provider;
