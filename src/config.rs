//! Controller configuration, loadable from TOML.
//!
//! Every field is optional in the file; missing fields take the defaults
//! below.
//!
//! ```toml
//! focus_mode = "continuous"
//! preview_target = { width = 960, height = 540 }
//! max_convergence_frames = 20
//!
//! [recovery]
//! max_attempts = 0          # 0 retries forever
//! base_backoff_ms = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::handle::FocusMode;
use crate::recovery::RecoveryPolicy;
use crate::request::Size;
use crate::traits::Result;

const DEFAULT_CLOSE_WAIT_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_MS: u64 = 2_000;
const DEFAULT_MAX_CONVERGENCE_FRAMES: u32 = 30;
const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF_MS: u64 = 50;
const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;

/// Tuning for the camera controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Focus mode handles start with.
    pub focus_mode: FocusMode,
    /// Processing sink size; defaults to the device's largest still size.
    pub processing_sink_size: Option<Size>,
    /// Render target size passed when attaching the preview; zero means the
    /// output's native size.
    pub preview_target: Size,
    /// How long `open` waits for a closing device before giving up.
    pub close_wait_timeout_ms: u64,
    /// How long shutdown waits for devices to close.
    pub shutdown_timeout_ms: u64,
    /// Frames to wait for AF or AE to settle before capturing anyway.
    pub max_convergence_frames: u32,
    /// Automatic reopen after failures.
    pub recovery: RecoveryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            focus_mode: FocusMode::default(),
            processing_sink_size: None,
            preview_target: Size::default(),
            close_wait_timeout_ms: DEFAULT_CLOSE_WAIT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_MS,
            max_convergence_frames: DEFAULT_MAX_CONVERGENCE_FRAMES,
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Retry settings for close-and-reopen recovery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Consecutive reopen attempts before giving up; 0 is unbounded.
    pub max_attempts: u32,
    /// Delay before the first reopen, doubled per further attempt.
    pub base_backoff_ms: u64,
    /// Upper bound on the reopen delay.
    pub max_backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl ControllerConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// [`Self::close_wait_timeout_ms`] as a duration.
    #[must_use]
    pub const fn close_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.close_wait_timeout_ms)
    }

    /// [`Self::shutdown_timeout_ms`] as a duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// The recovery policy described by [`Self::recovery`].
    #[must_use]
    pub const fn recovery_policy(&self) -> RecoveryPolicy {
        let max_attempts = if self.recovery.max_attempts == 0 {
            None
        } else {
            Some(self.recovery.max_attempts)
        };
        RecoveryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(self.recovery.base_backoff_ms),
            max_backoff: Duration::from_millis(self.recovery.max_backoff_ms),
        }
    }
}
