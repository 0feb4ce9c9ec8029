//! The per-device worker thread.
//!
//! Commands from callers and events from the device API share one FIFO
//! queue, so a handle sees every message in order and is only ever touched
//! from its own thread. After each message the worker publishes a
//! [`HandleStatus`] snapshot that other threads can read or wait on.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::descriptor::DeviceDescriptor;
use crate::handle::{Collaborators, DeviceHandle, FocusMode, HandleStatus};
use crate::traits::{CameraError, DeviceEvent, EventSink, Result};

/// A request from a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open the device and start the preview.
    Open,
    /// Start the preview on an open device.
    StartPreview,
    /// Stop the preview, keeping the device open.
    StopPreview,
    /// Close the device.
    Close,
    /// Take a still picture.
    TakePicture,
    /// Change the focus mode.
    SetFocusMode(FocusMode),
}

/// A message on a worker's queue.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Command(Command),
    Event(DeviceEvent),
    Shutdown,
}

/// The latest status of a handle plus a condition variable signalled on
/// every update.
#[derive(Debug, Default)]
pub(crate) struct StatusCell {
    status: Mutex<HandleStatus>,
    changed: Condvar,
}

impl StatusCell {
    fn publish(&self, status: HandleStatus) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != status {
            *current = status;
            self.changed.notify_all();
        }
    }

    pub(crate) fn get(&self) -> HandleStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `done` holds for the published status, or `timeout`
    /// passes.
    pub(crate) fn wait_until<F>(&self, timeout: Duration, mut done: F) -> Result<HandleStatus>
    where
        F: FnMut(&HandleStatus) -> bool,
    {
        let guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, result) = self
            .changed
            .wait_timeout_while(guard, timeout, |status| !done(status))
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && !done(&guard) {
            return Err(CameraError::Timeout);
        }
        Ok(*guard)
    }
}

/// Owner of one device's thread and queue.
pub(crate) struct DeviceWorker {
    id: String,
    tx: Sender<WorkerMessage>,
    status: Arc<StatusCell>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWorker {
    pub(crate) fn spawn(
        descriptor: DeviceDescriptor,
        config: Arc<ControllerConfig>,
        collab: Collaborators,
    ) -> Result<Self> {
        let id = descriptor.id.clone();
        let (tx, rx) = mpsc::channel();
        let status = Arc::new(StatusCell::default());

        let events = EventSink::new(&id, tx.clone());
        let shutdown_timeout = config.shutdown_timeout();
        let handle = DeviceHandle::new(Arc::new(descriptor), config, events);
        let cell = Arc::clone(&status);
        cell.publish(handle.status());

        let thread = thread::Builder::new()
            .name(format!("camera-{id}"))
            .spawn(move || run(handle, &rx, &collab, &cell, shutdown_timeout))?;

        Ok(Self {
            id,
            tx,
            status,
            thread: Some(thread),
        })
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(WorkerMessage::Command(command))
            .map_err(|_| CameraError::WorkerGone(self.id.clone()))
    }

    pub(crate) fn status(&self) -> HandleStatus {
        self.status.get()
    }

    pub(crate) fn wait_until<F>(&self, timeout: Duration, done: F) -> Result<HandleStatus>
    where
        F: FnMut(&HandleStatus) -> bool,
    {
        self.status.wait_until(timeout, done)
    }

    /// Close the device and join the thread.
    pub(crate) fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // A send error means the thread already exited.
        let _ = self.tx.send(WorkerMessage::Shutdown);
        if thread.join().is_err() {
            error!(camera = %self.id, "camera worker panicked");
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut handle: DeviceHandle,
    rx: &Receiver<WorkerMessage>,
    collab: &Collaborators,
    cell: &StatusCell,
    shutdown_timeout: Duration,
) {
    debug!(camera = %handle.id(), "camera worker started");
    loop {
        let message = match handle.next_deadline() {
            Some(due) => match rx.recv_timeout(due.saturating_duration_since(Instant::now())) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            },
        };

        match message {
            None => handle.on_timer(Instant::now(), collab),
            Some(WorkerMessage::Command(command)) => apply(&mut handle, command, collab),
            Some(WorkerMessage::Event(event)) => handle.handle_event(event, collab),
            Some(WorkerMessage::Shutdown) => {
                drain_on_shutdown(&mut handle, rx, collab, cell, shutdown_timeout);
                break;
            }
        }
        cell.publish(handle.status());
    }
    cell.publish(handle.status());
    debug!(camera = %handle.id(), "camera worker stopped");
}

fn apply(handle: &mut DeviceHandle, command: Command, collab: &Collaborators) {
    let outcome = match command {
        Command::Open => {
            handle.reset_recovery();
            handle.open(collab)
        }
        Command::StartPreview => handle.start_preview(collab),
        Command::StopPreview => handle.stop_preview(),
        Command::Close => {
            handle.cancel_reopen();
            handle.close(collab)
        }
        Command::TakePicture => handle.take_picture(collab),
        Command::SetFocusMode(mode) => {
            handle.set_focus_mode(mode);
            return;
        }
    };
    debug!(camera = %handle.id(), ?command, ?outcome, "command applied");
}

/// Close the handle and keep serving its events until the close completes
/// or `timeout` passes. Commands arriving meanwhile are dropped.
fn drain_on_shutdown(
    handle: &mut DeviceHandle,
    rx: &Receiver<WorkerMessage>,
    collab: &Collaborators,
    cell: &StatusCell,
    timeout: Duration,
) {
    handle.disable_recovery();
    handle.close(collab);
    cell.publish(handle.status());

    let deadline = Instant::now() + timeout;
    while !handle.status().is_idle() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(WorkerMessage::Event(event)) => handle.handle_event(event, collab),
            Ok(WorkerMessage::Command(command)) => {
                debug!(camera = %handle.id(), ?command, "dropping command during shutdown");
            }
            Ok(WorkerMessage::Shutdown) => {}
            Err(RecvTimeoutError::Timeout) => {
                warn!(camera = %handle.id(), "camera did not close before shutdown timeout");
                return;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
        cell.publish(handle.status());
    }
    info!(camera = %handle.id(), "camera shut down");
}
