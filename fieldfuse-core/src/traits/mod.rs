//! Core Traits and Extension Points
//!
//! The engine talks to the outside world through three narrow seams:
//!
//! - [`source`] - sensor subsystems that keep a private snapshot fresh
//! - [`capture`] - the still camera driven by the bracket controller
//! - [`sink`] - the append-only record log
//!
//! Concrete channels (MQTT, BLE, I2C, `rpicam-still`) live in the
//! `fieldfuse-connectors` crate; the engine and its tests only see these
//! traits.

pub mod capture;
pub mod sink;
pub mod source;

pub use capture::{CaptureDevice, DeviceMetadata};
pub use sink::RecordSink;
pub use source::SensorSource;
