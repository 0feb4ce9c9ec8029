//! V4L2 backend for the device API, using the v4l crate.
//!
//! Opening a camera queries its node and hands back a [`V4l2Camera`]. Each
//! capture session runs an mmap stream on its own thread; the first frame
//! after the repeating request is set reports the session active, and every
//! frame afterwards completes either the oldest queued one-shot capture or a
//! preview frame.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::descriptor::{DeviceDescriptor, LensFacing};
use crate::request::{CaptureKind, CaptureRequest, CaptureResult, Size, SurfaceId};
use crate::traits::{
    CameraDevice, CameraError, CameraProvider, CaptureFailureReason, CaptureSession,
    DeviceEnumerator, DeviceErrorKind, DeviceEvent, EventSink, Result,
};

const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Metadata associated with a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Timestamp when the frame was captured.
    pub timestamp: Duration,
    /// Number of bytes used in the buffer.
    pub bytes_used: u32,
}

/// A frame delivered to the frame consumer.
#[derive(Debug)]
pub struct PreviewFrame<'a> {
    /// Device id.
    pub camera_id: &'a str,
    /// Submission this frame completes.
    pub kind: CaptureKind,
    /// Raw frame data in the device's pixel format.
    pub data: &'a [u8],
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Callback receiving every streamed frame.
pub type FrameConsumer = Arc<dyn Fn(&PreviewFrame<'_>) + Send + Sync>;

/// Device API over V4L2 capture nodes. Device ids are node indices
/// (`"0"` for `/dev/video0`).
#[derive(Clone)]
pub struct V4l2Provider {
    buffer_count: u32,
    frame_size: Option<Size>,
    consumer: Option<FrameConsumer>,
}

impl Default for V4l2Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Provider {
    /// Provider with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            frame_size: None,
            consumer: None,
        }
    }

    /// Number of mmap buffers per stream.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Frame size to request when a session starts.
    #[must_use]
    pub const fn with_frame_size(mut self, size: Size) -> Self {
        self.frame_size = Some(size);
        self
    }

    /// Receive every streamed frame.
    #[must_use]
    pub fn with_frame_consumer(mut self, consumer: FrameConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }
}

impl DeviceEnumerator for V4l2Provider {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut nodes: Vec<usize> = v4l::context::enum_devices()
            .iter()
            .map(v4l::context::Node::index)
            .collect();
        nodes.sort_unstable();

        let mut descriptors = Vec::new();
        for index in nodes {
            match describe(index) {
                Ok(Some(descriptor)) => descriptors.push(descriptor),
                Ok(None) => debug!(index, "not a capture node, skipping"),
                Err(err) => debug!(index, error = %err, "cannot query node, skipping"),
            }
        }
        info!(count = descriptors.len(), "enumerated cameras");
        Ok(descriptors)
    }
}

/// Descriptor for a capture node, or `None` if the node cannot capture.
fn describe(index: usize) -> io::Result<Option<DeviceDescriptor>> {
    let device = Device::new(index)?;
    let caps = device.query_caps()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return Ok(None);
    }

    let mut descriptor = DeviceDescriptor::new(index.to_string(), facing_for_bus(&caps.bus));
    if let Some((min, max)) = frame_size_range(&device) {
        descriptor = descriptor.with_still_sizes(min, max);
    }
    debug!(index, card = %caps.card, driver = %caps.driver, "found camera");
    Ok(Some(descriptor))
}

/// USB cameras are external; everything else is assumed to be a built-in
/// rear module.
fn facing_for_bus(bus: &str) -> LensFacing {
    if bus.starts_with("usb") {
        LensFacing::External
    } else {
        LensFacing::Back
    }
}

/// Smallest and largest frame sizes for the node's current pixel format.
fn frame_size_range(device: &Device) -> Option<(Size, Size)> {
    let format = device.format().ok()?;
    let sizes = device.enum_framesizes(format.fourcc).ok()?;
    let candidates = sizes.into_iter().flat_map(|size| match size.size {
        FrameSizeEnum::Discrete(discrete) => vec![Size::new(discrete.width, discrete.height)],
        FrameSizeEnum::Stepwise(stepwise) => vec![
            Size::new(stepwise.min_width, stepwise.min_height),
            Size::new(stepwise.max_width, stepwise.max_height),
        ],
    });

    let mut range: Option<(Size, Size)> = None;
    for size in candidates {
        range = Some(match range {
            None => (size, size),
            Some((min, max)) => (
                if size.area() < min.area() { size } else { min },
                if size.area() > max.area() { size } else { max },
            ),
        });
    }
    range
}

/// Classify an errno from opening or streaming a node.
fn error_kind(err: &io::Error) -> DeviceErrorKind {
    match err.raw_os_error() {
        Some(16) => DeviceErrorKind::CameraInUse,
        Some(1 | 13) => DeviceErrorKind::CameraDisabled,
        Some(23 | 24) => DeviceErrorKind::MaxCamerasInUse,
        Some(5) => DeviceErrorKind::CameraDevice,
        Some(code) => DeviceErrorKind::Other(code),
        None => DeviceErrorKind::Other(0),
    }
}

impl CameraProvider for V4l2Provider {
    fn open_device(&self, id: &str, events: EventSink) -> Result<()> {
        let index: usize = id
            .parse()
            .map_err(|_| CameraError::DeviceNotFound(id.to_owned()))?;

        let opened = Device::new(index).and_then(|device| {
            let caps = device.query_caps()?;
            if caps.capabilities.contains(Flags::STREAMING) {
                Ok(device)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "node cannot stream",
                ))
            }
        });

        match opened {
            Ok(device) => {
                info!(camera = %id, "v4l2 device opened");
                let camera = V4l2Camera {
                    index,
                    provider: self.clone(),
                    events: events.clone(),
                    _device: device,
                    stream: None,
                    shared: None,
                };
                events.post(DeviceEvent::Opened(Box::new(camera)));
            }
            Err(err) => {
                warn!(camera = %id, error = %err, "v4l2 device failed to open");
                events.post(DeviceEvent::Error(error_kind(&err)));
            }
        }
        Ok(())
    }
}

/// Lifecycle of a stream thread, shared with its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Stopping,
    Finished,
}

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    repeating: bool,
    oneshots: VecDeque<CaptureKind>,
}

/// Session state plus a condvar signalled on every phase or request change.
#[derive(Debug)]
struct SessionShared {
    state: Mutex<SessionState>,
    changed: Condvar,
}

type Shared = Arc<SessionShared>;

impl SessionShared {
    fn new() -> Shared {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                phase: Phase::Running,
                repeating: false,
                oneshots: VecDeque::new(),
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` under the lock and wake the stream thread.
    fn update<R, F: FnOnce(&mut SessionState) -> R>(&self, f: F) -> R {
        let result = f(&mut self.lock());
        self.changed.notify_all();
        result
    }

    /// Block until the repeating request is set. Returns `false` once the
    /// session stops running.
    fn wait_for_repeating(&self) -> bool {
        let state = self
            .changed
            .wait_while(self.lock(), |state| {
                state.phase == Phase::Running && !state.repeating
            })
            .unwrap_or_else(PoisonError::into_inner);
        state.phase == Phase::Running
    }

    /// Refuse submissions once the session is no longer running.
    fn ensure_running(state: &SessionState) -> Result<()> {
        match state.phase {
            Phase::Running => Ok(()),
            Phase::Stopping => Err(CameraError::IllegalState("session is closed".to_owned())),
            Phase::Finished => Err(CameraError::StreamError("stream has stopped".to_owned())),
        }
    }
}

/// An open V4L2 capture node.
pub struct V4l2Camera {
    index: usize,
    provider: V4l2Provider,
    events: EventSink,
    // Held so the node stays open while the camera is.
    _device: Device,
    stream: Option<JoinHandle<()>>,
    shared: Option<Shared>,
}

impl V4l2Camera {
    fn join_stream(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.update(|state| {
                if state.phase == Phase::Running {
                    state.phase = Phase::Stopping;
                }
            });
        }
        if let Some(thread) = self.stream.take() {
            if thread.join().is_err() {
                error!(camera = %self.events.camera_id(), "stream thread panicked");
            }
        }
    }
}

impl CameraDevice for V4l2Camera {
    fn create_session(&mut self, targets: &[SurfaceId]) -> Result<()> {
        self.join_stream();
        debug!(camera = %self.events.camera_id(), ?targets, "starting v4l2 stream");

        let shared = SessionShared::new();
        let context = StreamContext {
            index: self.index,
            buffer_count: self.provider.buffer_count,
            frame_size: self.provider.frame_size,
            consumer: self.provider.consumer.clone(),
            events: self.events.clone(),
            shared: Arc::clone(&shared),
        };
        let thread = thread::Builder::new()
            .name(format!("v4l2-stream-{}", self.index))
            .spawn(move || context.run())?;

        self.stream = Some(thread);
        self.shared = Some(shared);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.join_stream();
        info!(camera = %self.events.camera_id(), "v4l2 device closed");
        self.events.post(DeviceEvent::Closed);
        Ok(())
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.join_stream();
    }
}

/// Handle to a running stream, owned by the device handle.
pub struct V4l2Session {
    shared: Shared,
    events: EventSink,
}

impl CaptureSession for V4l2Session {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<()> {
        self.shared.update(|state| {
            SessionShared::ensure_running(state)?;
            state.repeating = true;
            Ok(())
        })?;
        debug!(
            camera = %self.events.camera_id(),
            targets = request.targets.len(),
            "repeating request set"
        );
        Ok(())
    }

    fn capture(&mut self, request: &CaptureRequest) -> Result<()> {
        let mut state = self.shared.lock();
        SessionShared::ensure_running(&state)?;
        state.oneshots.push_back(request.kind);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let finished = self.shared.update(|state| match state.phase {
            Phase::Running => {
                state.phase = Phase::Stopping;
                false
            }
            Phase::Stopping => false,
            Phase::Finished => true,
        });
        if finished {
            self.events.post(DeviceEvent::SessionClosed);
        }
        Ok(())
    }
}

struct StreamContext {
    index: usize,
    buffer_count: u32,
    frame_size: Option<Size>,
    consumer: Option<FrameConsumer>,
    events: EventSink,
    shared: Shared,
}

impl StreamContext {
    fn run(self) {
        match Device::new(self.index) {
            Ok(device) => self.stream(&device),
            Err(err) => {
                warn!(camera = %self.events.camera_id(), error = %err, "cannot open stream device");
                self.shared.lock().phase = Phase::Finished;
                self.events.post(DeviceEvent::SessionConfigureFailed);
            }
        }
    }

    fn stream(&self, device: &Device) {
        if let Err(err) = self.apply_frame_size(device) {
            warn!(camera = %self.events.camera_id(), error = %err, "cannot set frame size");
        }
        let mut stream = match Stream::with_buffers(device, Type::VideoCapture, self.buffer_count) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(camera = %self.events.camera_id(), error = %err, "cannot map stream buffers");
                self.shared.lock().phase = Phase::Finished;
                self.events.post(DeviceEvent::SessionConfigureFailed);
                return;
            }
        };

        let session = V4l2Session {
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
        };
        let configured = DeviceEvent::SessionConfigured(Box::new(session));
        self.events.post(configured);

        let mut active = false;
        while self.shared.wait_for_repeating() {
            match V4lCaptureStream::next(&mut stream) {
                Ok((data, meta)) => {
                    if !active {
                        active = true;
                        self.events.post(DeviceEvent::SessionActive);
                    }
                    let kind = self
                        .shared
                        .lock()
                        .oneshots
                        .pop_front()
                        .unwrap_or(CaptureKind::Preview);

                    // V4L2 timestamps are always non-negative in practice
                    #[allow(clippy::cast_sign_loss)]
                    let secs = meta.timestamp.sec.max(0) as u64;
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                    let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

                    if let Some(consumer) = &self.consumer {
                        consumer(&PreviewFrame {
                            camera_id: self.events.camera_id(),
                            kind,
                            data,
                            metadata: FrameMetadata {
                                sequence: meta.sequence,
                                timestamp: Duration::new(secs, nanos),
                                bytes_used: meta.bytesused,
                            },
                        });
                    }
                    self.events.post(DeviceEvent::CaptureCompleted {
                        kind,
                        result: CaptureResult::default(),
                    });
                }
                Err(err) => {
                    warn!(camera = %self.events.camera_id(), error = %err, "stream failed");
                    self.events.post(DeviceEvent::CaptureFailed {
                        kind: CaptureKind::Preview,
                        reason: CaptureFailureReason::Error,
                    });
                    break;
                }
            }
        }

        drop(stream);
        self.finish();
    }

    fn apply_frame_size(&self, device: &Device) -> io::Result<()> {
        let Some(size) = self.frame_size else {
            return Ok(());
        };
        let mut format = device.format()?;
        format.width = size.width;
        format.height = size.height;
        let actual = device.set_format(&format)?;
        debug!(
            camera = %self.events.camera_id(),
            width = actual.width,
            height = actual.height,
            fourcc = %actual.fourcc,
            "stream format"
        );
        Ok(())
    }

    /// Flush queued one-shots and report the session closed if a close was
    /// requested; otherwise the next close call reports it.
    fn finish(&self) {
        let mut state = self.shared.lock();
        for kind in state.oneshots.drain(..) {
            self.events.post(DeviceEvent::CaptureFailed {
                kind,
                reason: CaptureFailureReason::Flushed,
            });
        }
        let stopping = state.phase == Phase::Stopping;
        state.phase = Phase::Finished;
        drop(state);
        if stopping {
            self.events.post(DeviceEvent::SessionClosed);
        }
        debug!(camera = %self.events.camera_id(), "stream stopped");
    }
}
