//! Capture Device Contract
//!
//! The bracket controller needs four things from a camera: confirm it is
//! there, accept an exposure-value setting, switch to still mode and write
//! one image, and say what it did. Anything beyond that (sensor modes,
//! encoders, ISP tuning) stays behind the implementation.

use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::CaptureError;

/// Device-reported auxiliary metadata for one still (e.g. `ExposureTime`,
/// `AnalogueGain`, `Lux`)
pub type DeviceMetadata = BTreeMap<String, serde_json::Value>;

/// Still camera with exposure control
pub trait CaptureDevice: Send {
    /// Check the device is present; called once before scheduling starts
    fn probe(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Apply an exposure-value compensation for subsequent stills
    fn set_exposure(&mut self, ev: f32) -> Result<(), CaptureError>;

    /// Switch to still mode, write one image to `path`, return its metadata
    fn capture_still(&mut self, path: &Path) -> Result<DeviceMetadata, CaptureError>;

    /// Release the device
    fn close(&mut self) {}
}
