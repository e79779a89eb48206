//! Bracketed Still Capture
//!
//! ## Overview
//!
//! A [`CaptureController`] owns one [`CaptureDevice`] and turns a bracket
//! request `(min, max, count)` into `count` stills at evenly spaced exposure
//! values, lowest first. For each step it sets the exposure, waits for the
//! sensor to settle, captures to `<location>_<timestamp>.jpg` in the image
//! directory and collects what the device reported.
//!
//! ## All or Nothing
//!
//! A bracket either returns exactly `count` [`CaptureMetadata`] entries in
//! exposure order or fails. A device failure part-way through, or a shutdown
//! request during a settle wait, abandons the bracket; the caller persists
//! nothing for it. Stills already written to disk are left in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};

use crate::errors::CaptureError;
use crate::schedule::Bracket;
use crate::stop::StopSignal;
use crate::time::{Clock, Timestamp};
use crate::traits::{CaptureDevice, DeviceMetadata};

/// Default exposure settle time between setting EV and capturing
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);

/// Metadata key carrying the sensor's analogue gain
pub const ANALOGUE_GAIN_KEY: &str = "AnalogueGain";

/// What one still in a bracket produced
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    /// File name inside the image directory
    pub filename: String,
    /// Full path of the still
    pub path: PathBuf,
    /// When the still was taken
    pub captured_at: Timestamp,
    /// Requested exposure value
    pub exposure_value: f32,
    /// Analogue gain reported by the device, if any
    pub analogue_gain: Option<f64>,
    /// Everything else the device reported
    pub auxiliary: DeviceMetadata,
}

/// `count` exposure values spread evenly over `[min, max]`, ascending
///
/// A single frame uses the midpoint of the range.
///
/// ```
/// use fieldfuse_core::capture::exposure_values;
///
/// assert_eq!(exposure_values(-2.0, 2.0, 5).unwrap(), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
/// assert_eq!(exposure_values(0.0, 0.0, 1).unwrap(), vec![0.0]);
/// ```
pub fn exposure_values(min: f32, max: f32, count: usize) -> Result<Vec<f32>, CaptureError> {
    match count {
        0 => Err(CaptureError::EmptyBracket(count)),
        1 => Ok(vec![min + (max - min) / 2.0]),
        _ => {
            let last = count - 1;
            let step = (max - min) / last as f32;
            Ok((0..count)
                .map(|i| if i == last { max } else { min + i as f32 * step })
                .collect())
        }
    }
}

/// Drives bracketed captures on one device
pub struct CaptureController<D: CaptureDevice> {
    device: D,
    image_dir: PathBuf,
    location: String,
    settle: Duration,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
}

impl<D: CaptureDevice> CaptureController<D> {
    pub fn new(
        device: D,
        image_dir: impl Into<PathBuf>,
        location: impl Into<String>,
        clock: Arc<dyn Clock>,
        stop: StopSignal,
    ) -> Self {
        Self {
            device,
            image_dir: image_dir.into(),
            location: location.into(),
            settle: DEFAULT_SETTLE,
            clock,
            stop,
        }
    }

    /// Override the settle time
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Check the device is present and answers
    pub fn probe(&mut self) -> Result<(), CaptureError> {
        self.device.probe()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Release the device
    pub fn close(&mut self) {
        self.device.close();
    }

    /// Capture the stills of `bracket`
    pub fn capture(&mut self, bracket: Bracket) -> Result<Vec<CaptureMetadata>, CaptureError> {
        self.bracketed_capture(bracket.min, bracket.max, bracket.count)
    }

    /// Capture `count` stills at exposures evenly spaced over `[min, max]`
    pub fn bracketed_capture(
        &mut self,
        min: f32,
        max: f32,
        count: usize,
    ) -> Result<Vec<CaptureMetadata>, CaptureError> {
        let values = exposure_values(min, max, count)?;
        if self.stop.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }

        info!("Capturing {} frame(s), EV {:?}", count, values);
        let mut used = HashSet::new();
        let mut shots = Vec::with_capacity(count);

        for ev in values {
            match self.capture_one(ev, &mut used) {
                Ok(shot) => shots.push(shot),
                Err(CaptureError::Cancelled) => return Err(CaptureError::Cancelled),
                Err(e) if shots.is_empty() => return Err(e),
                Err(e) => {
                    error!("Frame {} of {} failed: {}", shots.len() + 1, count, e);
                    return Err(CaptureError::Incomplete { expected: count, got: shots.len() });
                }
            }
        }

        Ok(shots)
    }

    fn capture_one(&mut self, ev: f32, used: &mut HashSet<String>) -> Result<CaptureMetadata, CaptureError> {
        self.device.set_exposure(ev)?;
        if self.stop.wait_for(self.settle) {
            return Err(CaptureError::Cancelled);
        }

        let captured_at = self.clock.now();
        let filename = self.unique_filename(captured_at, used)?;
        let path = self.image_dir.join(&filename);
        debug!("EV {:+.2} -> {}", ev, path.display());

        let mut auxiliary = self.device.capture_still(&path)?;
        let analogue_gain = auxiliary.remove(ANALOGUE_GAIN_KEY).and_then(|v| v.as_f64());
        used.insert(filename.clone());

        Ok(CaptureMetadata {
            filename,
            path,
            captured_at,
            exposure_value: ev,
            analogue_gain,
            auxiliary,
        })
    }

    fn unique_filename(&self, at: Timestamp, used: &HashSet<String>) -> Result<String, CaptureError> {
        let stem = format!("{}_{}", self.location, at);
        free_name(&stem, |name| used.contains(name) || self.image_dir.join(name).exists())
            .ok_or(CaptureError::NamesExhausted(stem))
    }
}

/// `{stem}.jpg`, else the first free `{stem}_{n}.jpg` with `n` in `1..=u16::MAX`
fn free_name(stem: &str, taken: impl Fn(&str) -> bool) -> Option<String> {
    let first = format!("{stem}.jpg");
    if !taken(&first) {
        return Some(first);
    }
    (1..=u16::MAX).map(|n| format!("{stem}_{n}.jpg")).find(|name| !taken(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use serde_json::json;

    #[derive(Default)]
    struct ScriptedCamera {
        exposures: Vec<f32>,
        fail_on_frame: Option<usize>,
        frames: usize,
    }

    impl CaptureDevice for ScriptedCamera {
        fn set_exposure(&mut self, ev: f32) -> Result<(), CaptureError> {
            self.exposures.push(ev);
            Ok(())
        }

        fn capture_still(&mut self, _path: &Path) -> Result<DeviceMetadata, CaptureError> {
            self.frames += 1;
            if self.fail_on_frame == Some(self.frames) {
                return Err(CaptureError::Device("sensor timeout".into()));
            }
            let mut meta = DeviceMetadata::new();
            meta.insert(ANALOGUE_GAIN_KEY.into(), json!(1.5));
            meta.insert("ExposureTime".into(), json!(12000));
            Ok(meta)
        }
    }

    fn controller(camera: ScriptedCamera, stop: StopSignal) -> (CaptureController<ScriptedCamera>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp::parse("20250601063000").unwrap()));
        let ctl = CaptureController::new(camera, dir.path(), "site7", clock, stop).with_settle(Duration::ZERO);
        (ctl, dir)
    }

    #[test]
    fn standard_bracket_values() {
        assert_eq!(exposure_values(-2.0, 2.0, 5).unwrap(), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
        assert_eq!(exposure_values(0.0, 0.0, 1).unwrap(), vec![0.0]);
        assert_eq!(exposure_values(-1.0, 3.0, 1).unwrap(), vec![1.0]);
        assert_eq!(exposure_values(-1.0, 1.0, 2).unwrap(), vec![-1.0, 1.0]);
        assert!(matches!(exposure_values(-2.0, 2.0, 0), Err(CaptureError::EmptyBracket(0))));
    }

    #[test]
    fn bracket_returns_one_entry_per_exposure() {
        let (mut ctl, _dir) = controller(ScriptedCamera::default(), StopSignal::new());
        let shots = ctl.bracketed_capture(-2.0, 2.0, 5).unwrap();

        assert_eq!(shots.len(), 5);
        assert_eq!(ctl.device().exposures, vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
        assert_eq!(
            shots.iter().map(|s| s.exposure_value).collect::<Vec<_>>(),
            vec![-2.0, -1.0, 0.0, 1.0, 2.0]
        );
        assert_eq!(shots[0].analogue_gain, Some(1.5));
        assert!(shots[0].auxiliary.contains_key("ExposureTime"));
        assert!(!shots[0].auxiliary.contains_key(ANALOGUE_GAIN_KEY));
    }

    #[test]
    fn same_second_filenames_are_suffixed() {
        let (mut ctl, _dir) = controller(ScriptedCamera::default(), StopSignal::new());
        let shots = ctl.bracketed_capture(-1.0, 1.0, 3).unwrap();
        let names: Vec<_> = shots.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(
            names,
            vec!["site7_20250601063000.jpg", "site7_20250601063000_1.jpg", "site7_20250601063000_2.jpg"]
        );
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let (mut ctl, dir) = controller(ScriptedCamera::default(), StopSignal::new());
        std::fs::write(dir.path().join("site7_20250601063000.jpg"), b"old").unwrap();
        let shots = ctl.bracketed_capture(0.0, 0.0, 1).unwrap();
        assert_eq!(shots[0].filename, "site7_20250601063000_1.jpg");
    }

    #[test]
    fn failure_mid_bracket_abandons_everything() {
        let camera = ScriptedCamera { fail_on_frame: Some(3), ..Default::default() };
        let (mut ctl, _dir) = controller(camera, StopSignal::new());
        match ctl.bracketed_capture(-2.0, 2.0, 5) {
            Err(CaptureError::Incomplete { expected: 5, got: 2 }) => {}
            other => panic!("expected incomplete bracket, got {other:?}"),
        }
    }

    #[test]
    fn failure_on_first_frame_keeps_device_error() {
        let camera = ScriptedCamera { fail_on_frame: Some(1), ..Default::default() };
        let (mut ctl, _dir) = controller(camera, StopSignal::new());
        assert!(matches!(ctl.bracketed_capture(-2.0, 2.0, 5), Err(CaptureError::Device(_))));
    }

    #[test]
    fn cancelled_before_start() {
        let stop = StopSignal::new();
        stop.cancel();
        let (mut ctl, _dir) = controller(ScriptedCamera::default(), stop);
        assert!(matches!(ctl.bracketed_capture(-2.0, 2.0, 5), Err(CaptureError::Cancelled)));
        assert!(ctl.device().exposures.is_empty());
    }

    #[test]
    fn name_search_is_bounded() {
        assert_eq!(free_name("site7_x", |_| false).as_deref(), Some("site7_x.jpg"));
        assert_eq!(
            free_name("site7_x", |name| name != "site7_x_65535.jpg").as_deref(),
            Some("site7_x_65535.jpg")
        );
        assert_eq!(free_name("site7_x", |_| true), None);
    }
}
