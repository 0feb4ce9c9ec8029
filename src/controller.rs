//! Entry point owning one worker per enumerated device.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::descriptor::DeviceDescriptor;
use crate::handle::{Collaborators, FocusMode, HandleStatus};
use crate::selection::select_device;
use crate::traits::{CameraError, CameraProvider, DisplayRotation, PreviewOutput, Result};
use crate::worker::{Command, DeviceWorker};

/// Routes triggers to per-device workers.
///
/// Unknown device ids are ignored, matching the way a trigger on a device in
/// the wrong state is ignored.
pub struct CameraController {
    descriptors: Vec<DeviceDescriptor>,
    workers: BTreeMap<String, DeviceWorker>,
    config: Arc<ControllerConfig>,
}

impl CameraController {
    /// Spawn a worker for every enumerated device.
    ///
    /// # Errors
    ///
    /// Returns [`CameraError::DuplicateDevice`] if two descriptors share an id,
    /// or an I/O error if a worker thread cannot be spawned.
    pub fn new(
        descriptors: Vec<DeviceDescriptor>,
        provider: Arc<dyn CameraProvider>,
        output: Arc<dyn PreviewOutput>,
        rotation: Arc<dyn DisplayRotation>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let collab = Collaborators {
            provider,
            output,
            rotation,
        };

        let mut workers = BTreeMap::new();
        for descriptor in &descriptors {
            if workers.contains_key(&descriptor.id) {
                return Err(CameraError::DuplicateDevice(descriptor.id.clone()));
            }
            let shared = Arc::clone(&config);
            let worker = DeviceWorker::spawn(descriptor.clone(), shared, collab.clone())?;
            workers.insert(descriptor.id.clone(), worker);
        }
        info!(devices = workers.len(), "camera controller ready");

        Ok(Self {
            descriptors,
            workers,
            config,
        })
    }

    /// Descriptors in enumeration order.
    #[must_use]
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.descriptors
    }

    /// The device to use by default, if any.
    #[must_use]
    pub fn preferred_device(&self) -> Option<&DeviceDescriptor> {
        select_device(&self.descriptors)
    }

    /// Open a device and start its preview.
    ///
    /// If the device is still closing, waits for the close to finish (up to
    /// the configured close wait) before queueing the open.
    ///
    /// # Errors
    ///
    /// [`CameraError::Timeout`] if the device is still closing after the wait.
    pub fn open(&self, id: &str) -> Result<()> {
        let Some(worker) = self.worker(id) else {
            return Ok(());
        };
        if worker.status().guards.is_closing {
            debug!(camera = %id, "waiting for camera to finish closing");
            let timeout = self.config.close_wait_timeout();
            worker.wait_until(timeout, |status| !status.guards.is_closing)?;
        }
        worker.send(Command::Open)
    }

    /// Start the preview on an open device.
    ///
    /// # Errors
    ///
    /// [`CameraError::WorkerGone`] if the device's worker has exited.
    pub fn start_preview(&self, id: &str) -> Result<()> {
        self.send(id, Command::StartPreview)
    }

    /// Stop the preview, keeping the device open.
    ///
    /// # Errors
    ///
    /// [`CameraError::WorkerGone`] if the device's worker has exited.
    pub fn stop_preview(&self, id: &str) -> Result<()> {
        self.send(id, Command::StopPreview)
    }

    /// Close a device.
    ///
    /// # Errors
    ///
    /// [`CameraError::WorkerGone`] if the device's worker has exited.
    pub fn close(&self, id: &str) -> Result<()> {
        self.send(id, Command::Close)
    }

    /// Take a still picture.
    ///
    /// # Errors
    ///
    /// [`CameraError::WorkerGone`] if the device's worker has exited.
    pub fn take_picture(&self, id: &str) -> Result<()> {
        self.send(id, Command::TakePicture)
    }

    /// Change a device's focus mode.
    ///
    /// # Errors
    ///
    /// [`CameraError::WorkerGone`] if the device's worker has exited.
    pub fn set_focus_mode(&self, id: &str, mode: FocusMode) -> Result<()> {
        self.send(id, Command::SetFocusMode(mode))
    }

    /// Latest published status of a device.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<HandleStatus> {
        self.workers.get(id).map(DeviceWorker::status)
    }

    /// Block until `done` holds for a device's status.
    ///
    /// # Errors
    ///
    /// [`CameraError::DeviceNotFound`] for an unknown id,
    /// [`CameraError::Timeout`] if `timeout` passes first.
    pub fn wait_until<F>(&self, id: &str, timeout: Duration, done: F) -> Result<HandleStatus>
    where
        F: FnMut(&HandleStatus) -> bool,
    {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| CameraError::DeviceNotFound(id.to_owned()))?;
        worker.wait_until(timeout, done)
    }

    /// Close every device and stop the workers.
    pub fn shutdown(&mut self) {
        for worker in self.workers.values_mut() {
            worker.shutdown();
        }
        info!("camera controller stopped");
    }

    fn worker(&self, id: &str) -> Option<&DeviceWorker> {
        let worker = self.workers.get(id);
        if worker.is_none() {
            debug!(camera = %id, "unknown camera, ignoring");
        }
        worker
    }

    fn send(&self, id: &str, command: Command) -> Result<()> {
        let Some(worker) = self.worker(id) else {
            return Ok(());
        };
        worker.send(command)
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
