//! Deterministic choice of the device to use by default.

use crate::descriptor::DeviceDescriptor;

/// Pick the preferred device: the first external device, else the first
/// front-facing one, else the first in enumeration order.
///
/// Returns `None` (the "no device" sentinel) for an empty list.
#[must_use]
pub fn select_device(devices: &[DeviceDescriptor]) -> Option<&DeviceDescriptor> {
    devices
        .iter()
        .find(|device| device.is_external())
        .or_else(|| devices.iter().find(|device| device.is_front()))
        .or_else(|| devices.first())
}
