//! Static device capabilities, populated once at enumeration.

use serde::Deserialize;

use crate::request::Size;

/// Focal length treated as "normal" (neither wide nor tele), in millimetres.
pub const NORMAL_FOCAL_LENGTH: f32 = 50.0;

/// Minimum focus distance reported by fixed-focus lenses.
pub const FIXED_FOCUS_DISTANCE: f32 = 0.0;

/// Fallback processing sink size when a device reports no still sizes.
pub const FALLBACK_SINK_SIZE: Size = Size::new(640, 480);

/// Direction the lens faces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LensFacing {
    /// Rear-facing.
    #[default]
    Back,
    /// User-facing.
    Front,
    /// Externally attached (e.g. USB).
    External,
}

/// Immutable description of one enumerated device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceDescriptor {
    /// Device id used to open it.
    pub id: String,
    /// Lens facing.
    pub facing: LensFacing,
    /// Whether the device has a flash unit.
    pub has_flash: bool,
    /// Whether this is a logical multi-camera.
    pub has_multi_camera: bool,
    /// Whether manual sensor control is supported.
    pub has_manual_control: bool,
    /// Physical cameras behind a logical multi-camera.
    pub physical_ids: Vec<String>,
    /// Available focal lengths in millimetres.
    pub focal_lengths: Vec<f32>,
    /// Available apertures (f-numbers).
    pub apertures: Vec<f32>,
    /// Minimum focus distance in diopters; zero for fixed focus.
    pub min_focus_distance: f32,
    /// Whether the device only supports the legacy hardware level.
    pub is_legacy: bool,
    /// Clockwise sensor rotation relative to the device's natural orientation.
    pub sensor_orientation: u32,
    /// Largest supported still-capture resolution.
    pub max_still_size: Size,
    /// Smallest supported still-capture resolution.
    pub min_still_size: Size,
}

impl DeviceDescriptor {
    /// A back-facing, fixed-focus device with no flash.
    #[must_use]
    pub fn new<S: Into<String>>(id: S, facing: LensFacing) -> Self {
        Self {
            id: id.into(),
            facing,
            ..Self::default()
        }
    }

    /// Set the minimum focus distance.
    #[must_use]
    pub const fn with_min_focus_distance(mut self, distance: f32) -> Self {
        self.min_focus_distance = distance;
        self
    }

    /// Set flash availability.
    #[must_use]
    pub const fn with_flash(mut self, has_flash: bool) -> Self {
        self.has_flash = has_flash;
        self
    }

    /// Set the sensor orientation.
    #[must_use]
    pub const fn with_sensor_orientation(mut self, degrees: u32) -> Self {
        self.sensor_orientation = degrees;
        self
    }

    /// Set the supported still-capture size range.
    #[must_use]
    pub const fn with_still_sizes(mut self, min: Size, max: Size) -> Self {
        self.min_still_size = min;
        self.max_still_size = max;
        self
    }

    /// Whether the lens faces the user.
    #[must_use]
    pub fn is_front(&self) -> bool {
        self.facing == LensFacing::Front
    }

    /// Whether the device is externally attached.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.facing == LensFacing::External
    }

    /// Whether the lens can focus. Fixed-focus lenses report a minimum focus
    /// distance of zero.
    #[must_use]
    pub fn has_auto_focus(&self) -> bool {
        self.min_focus_distance > FIXED_FOCUS_DISTANCE
    }

    /// Smallest focal length, i.e. the widest angle.
    #[must_use]
    pub fn smallest_focal_length(&self) -> Option<f32> {
        self.focal_lengths.iter().copied().reduce(f32::min)
    }

    /// Largest aperture value listed.
    #[must_use]
    pub fn largest_aperture(&self) -> Option<f32> {
        self.apertures.iter().copied().reduce(f32::max)
    }

    /// Focal length closest to [`NORMAL_FOCAL_LENGTH`].
    #[must_use]
    pub fn normal_focal_length(&self) -> Option<f32> {
        let distance = |focal: &f32| (focal - NORMAL_FOCAL_LENGTH).abs();
        self.focal_lengths
            .iter()
            .copied()
            .min_by(|a, b| distance(a).total_cmp(&distance(b)))
    }

    /// Sensor resolution in whole megapixels.
    #[must_use]
    pub const fn megapixels(&self) -> u64 {
        self.max_still_size.area() / 1_000_000
    }

    /// Size for the processing sink: the largest still size, or a small
    /// fallback when the device reports none.
    #[must_use]
    pub const fn sink_size(&self) -> Size {
        if self.max_still_size.is_empty() {
            FALLBACK_SINK_SIZE
        } else {
            self.max_still_size
        }
    }
}
