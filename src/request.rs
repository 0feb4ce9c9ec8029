//! Capture request drafts and the value types they carry.

use serde::Deserialize;

/// Opaque identifier of an output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Dimensions in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Area in pixels.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether either dimension is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Display rotation in quarter turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    /// Natural orientation.
    #[default]
    Deg0,
    /// Rotated 90 degrees.
    Deg90,
    /// Rotated 180 degrees.
    Deg180,
    /// Rotated 270 degrees.
    Deg270,
}

impl Rotation {
    /// Rotation in degrees.
    #[must_use]
    pub const fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Parse a multiple of 90 degrees. Other values are rejected.
    #[must_use]
    pub const fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }
}

/// Baseline parameter set a request starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    /// Continuous preview.
    Preview,
    /// High-quality still capture.
    StillCapture,
}

/// Auto-focus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfMode {
    /// Single-shot auto-focus driven by triggers.
    Auto,
    /// Continuous focus tuned for still pictures.
    ContinuousPicture,
}

/// Auto-focus trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfTrigger {
    /// No trigger.
    Idle,
    /// Start a focus scan.
    Start,
    /// Cancel any running scan.
    Cancel,
}

/// Auto-exposure mode set on submitted requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeMode {
    /// Auto-exposure, flash fired when the scene needs it.
    OnAutoFlash,
}

/// Auto-exposure precapture trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AePrecaptureTrigger {
    /// Start the precapture metering sequence.
    Start,
}

/// Tag identifying which submission a capture callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// A frame of the repeating preview request.
    Preview,
    /// AF cancel submitted ahead of a focus scan.
    FocusCancel,
    /// AF start trigger.
    FocusTrigger,
    /// AE precapture trigger.
    Precapture,
    /// The still capture itself.
    Still,
}

/// Auto-focus state reported in a capture result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfState {
    /// A scan is in progress.
    Scanning,
    /// Focus locked on a sharp image.
    FocusedLocked,
    /// Focus locked but the image is not sharp.
    NotFocusedLocked,
}

impl AfState {
    /// Whether the scan has finished, successfully or not.
    #[must_use]
    pub const fn is_locked(self) -> bool {
        matches!(self, Self::FocusedLocked | Self::NotFocusedLocked)
    }
}

/// Auto-exposure state reported in a capture result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeState {
    /// Still metering.
    Searching,
    /// The precapture sequence is running.
    Precapture,
    /// Exposure is good.
    Converged,
    /// Exposure is good with flash.
    FlashRequired,
    /// Exposure is locked.
    Locked,
}

impl AeState {
    /// Whether exposure is ready for a still capture.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Converged | Self::FlashRequired | Self::Locked)
    }
}

/// Metadata returned with a completed capture. Absent fields mean the device
/// does not report that state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureResult {
    /// Auto-focus state, if reported.
    pub af_state: Option<AfState>,
    /// Auto-exposure state, if reported.
    pub ae_state: Option<AeState>,
}

/// The mutable parameter set built before each capture submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Baseline template.
    pub template: RequestTemplate,
    /// Tag echoed back by the completion callback.
    pub kind: CaptureKind,
    /// Output surfaces.
    pub targets: Vec<SurfaceId>,
    /// Auto-focus mode.
    pub af_mode: Option<AfMode>,
    /// Auto-focus trigger.
    pub af_trigger: Option<AfTrigger>,
    /// Auto-exposure mode set on submitted requests.
    pub ae_mode: Option<AeMode>,
    /// Auto-exposure precapture trigger.
    pub ae_precapture_trigger: Option<AePrecaptureTrigger>,
    /// Rotation in degrees to record in the encoded still.
    pub jpeg_orientation: Option<u32>,
}

impl CaptureRequest {
    /// Start a request from `template` with no fields set.
    #[must_use]
    pub const fn new(template: RequestTemplate) -> Self {
        let kind = match template {
            RequestTemplate::Preview => CaptureKind::Preview,
            RequestTemplate::StillCapture => CaptureKind::Still,
        };
        Self {
            template,
            kind,
            targets: Vec::new(),
            af_mode: None,
            af_trigger: None,
            ae_mode: None,
            ae_precapture_trigger: None,
            jpeg_orientation: None,
        }
    }

    /// Add an output target.
    #[must_use]
    pub fn with_target(mut self, target: SurfaceId) -> Self {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
        self
    }

    /// Copy of this request re-tagged as `kind`.
    #[must_use]
    pub fn tagged(&self, kind: CaptureKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}
