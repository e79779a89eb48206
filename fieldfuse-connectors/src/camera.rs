//! `rpicam-still` capture device
//!
//! Each still is one `rpicam-still` invocation:
//!
//! ```text
//! rpicam-still -n -t <settle ms> --width 1280 --height 1024 --ev <ev> \
//!     --metadata <path>.json --metadata-format json -o <path>
//! ```
//!
//! The camera is reconfigured per invocation, so switching between
//! exposure settings or modes never needs a restart. The metadata file is
//! parsed and removed; `AnalogueGain` from it becomes the row's gain level.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use log::{debug, info, warn};

use fieldfuse_core::errors::CaptureError;
use fieldfuse_core::traits::{CaptureDevice, DeviceMetadata};

/// Still camera settings
#[derive(Debug, Clone, PartialEq)]
pub struct RpicamConfig {
    /// Executable, `rpicam-still` unless overridden
    pub command: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Time the camera runs before the still is taken
    pub timeout: Duration,
}

impl Default for RpicamConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("rpicam-still"),
            width: 1280,
            height: 1024,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl RpicamConfig {
    pub fn command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Raspberry Pi camera driven through `rpicam-still`
#[derive(Debug)]
pub struct RpicamStill {
    config: RpicamConfig,
    ev: f32,
}

impl RpicamStill {
    pub fn new(config: RpicamConfig) -> Self {
        Self { config, ev: 0.0 }
    }

    pub fn config(&self) -> &RpicamConfig {
        &self.config
    }

    /// Arguments for one still written to `path`
    pub fn still_args(&self, path: &Path, metadata: &Path) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-t".to_string(),
            self.config.timeout.as_millis().to_string(),
            "--width".to_string(),
            self.config.width.to_string(),
            "--height".to_string(),
            self.config.height.to_string(),
            "--ev".to_string(),
            format!("{}", self.ev),
            "--metadata".to_string(),
            metadata.display().to_string(),
            "--metadata-format".to_string(),
            "json".to_string(),
            "-o".to_string(),
            path.display().to_string(),
        ]
    }

    fn execute(&self, args: &[String]) -> Result<Output, CaptureError> {
        Command::new(&self.config.command).args(args).output().map_err(|e| {
            CaptureError::Device(format!("cannot run {}: {e}", self.config.command.display()))
        })
    }
}

fn failure(output: &Output) -> CaptureError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let reason = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output");
    CaptureError::Device(format!("exited with {}: {}", output.status, reason.trim()))
}

impl CaptureDevice for RpicamStill {
    fn probe(&mut self) -> Result<(), CaptureError> {
        let output = self.execute(&["--list-cameras".to_string()])?;
        let listing = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || listing.contains("No cameras available") {
            return Err(CaptureError::Device("no camera detected".into()));
        }
        info!("Camera found: {}", listing.lines().nth(2).unwrap_or("").trim());
        Ok(())
    }

    fn set_exposure(&mut self, ev: f32) -> Result<(), CaptureError> {
        if !(-10.0..=10.0).contains(&ev) {
            return Err(CaptureError::Device(format!("EV {ev} outside -10..=10")));
        }
        self.ev = ev;
        Ok(())
    }

    fn capture_still(&mut self, path: &Path) -> Result<DeviceMetadata, CaptureError> {
        let metadata_path = path.with_extension("json");
        let args = self.still_args(path, &metadata_path);
        debug!("rpicam-still args: {:?}", args);

        let output = self.execute(&args)?;
        if !output.status.success() {
            return Err(failure(&output));
        }
        if !path.exists() {
            return Err(CaptureError::Device(format!("{} was not written", path.display())));
        }

        let metadata = match fs::read_to_string(&metadata_path) {
            Ok(text) => serde_json::from_str::<DeviceMetadata>(&text).unwrap_or_else(|e| {
                warn!("Unreadable metadata for {}: {}", path.display(), e);
                DeviceMetadata::new()
            }),
            Err(e) => {
                warn!("No metadata for {}: {}", path.display(), e);
                DeviceMetadata::new()
            }
        };
        if let Err(e) = fs::remove_file(&metadata_path) {
            debug!("Could not remove {}: {}", metadata_path.display(), e);
        }

        info!("Captured: {}", path.display());
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn still_arguments() {
        let mut cam = RpicamStill::new(RpicamConfig::default());
        cam.set_exposure(-2.0).unwrap();
        let args = cam.still_args(Path::new("/img/a.jpg"), Path::new("/img/a.json"));
        assert_eq!(
            args.join(" "),
            "-n -t 1000 --width 1280 --height 1024 --ev -2 --metadata /img/a.json --metadata-format json -o /img/a.jpg"
        );
    }

    #[test]
    fn rejects_out_of_range_ev() {
        let mut cam = RpicamStill::new(RpicamConfig::default());
        assert!(cam.set_exposure(12.0).is_err());
    }

    #[test]
    fn missing_binary_is_device_error() {
        let mut cam = RpicamStill::new(RpicamConfig::default().command("/nonexistent/rpicam-still"));
        assert!(matches!(cam.probe(), Err(CaptureError::Device(_))));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(cam.capture_still(&dir.path().join("x.jpg")), Err(CaptureError::Device(_))));
    }

    #[cfg(unix)]
    #[test]
    fn scripted_camera_writes_still_and_metadata() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-still");
        fs::write(
            &script,
            "#!/bin/sh\n\
             while [ $# -gt 0 ]; do\n\
               case \"$1\" in\n\
                 --metadata) meta=\"$2\"; shift ;;\n\
                 -o) out=\"$2\"; shift ;;\n\
               esac\n\
               shift\n\
             done\n\
             printf 'jpeg' > \"$out\"\n\
             printf '{\"AnalogueGain\": 1.25, \"ExposureTime\": 8000}' > \"$meta\"\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut cam = RpicamStill::new(RpicamConfig::default().command(&script));
        let still = dir.path().join("site_20250601120000.jpg");
        let meta = cam.capture_still(&still).unwrap();

        assert_eq!(meta.get("AnalogueGain").and_then(|v| v.as_f64()), Some(1.25));
        assert!(still.exists());
        assert!(!still.with_extension("json").exists());
    }
}
