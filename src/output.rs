//! A preview output for running without a display.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::request::{Rotation, Size, SurfaceId};
use crate::traits::PreviewOutput;

const PREVIEW_SURFACE: SurfaceId = SurfaceId(0);
const PROCESSING_SINK: SurfaceId = SurfaceId(1);

/// Output with a permanently available preview surface and a single
/// processing sink. Frames reach the caller through the backend's frame
/// consumer rather than through a surface.
#[derive(Debug, Default)]
pub struct HeadlessOutput {
    sink_attached: AtomicBool,
}

impl HeadlessOutput {
    /// New output with no sink attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a processing sink is currently attached.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink_attached.load(Ordering::Acquire)
    }
}

impl PreviewOutput for HeadlessOutput {
    fn preview_surface(&self) -> Option<SurfaceId> {
        Some(PREVIEW_SURFACE)
    }

    fn create_processing_sink(&self, size: Size) -> Option<SurfaceId> {
        debug!(width = size.width, height = size.height, "processing sink created");
        self.sink_attached.store(true, Ordering::Release);
        Some(PROCESSING_SINK)
    }

    fn attach_preview(&self, preview: SurfaceId, rotation: Rotation, target: Size) {
        debug!(
            surface = preview.0,
            rotation = rotation.degrees(),
            width = target.width,
            height = target.height,
            "preview attached"
        );
    }

    fn detach_processing_sink(&self) {
        debug!("processing sink detached");
        self.sink_attached.store(false, Ordering::Release);
    }
}
