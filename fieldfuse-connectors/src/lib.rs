//! Sensor Channel Connectors for the Field Station
//!
//! ## Overview
//!
//! Each module turns one physical channel into a
//! [`SensorSource`](fieldfuse_core::SensorSource) or a
//! [`CaptureDevice`](fieldfuse_core::CaptureDevice). The engine only sees
//! those traits; everything channel-specific (payload layouts, GATT
//! characteristics, bus registers, camera command lines) stays here.
//!
//! ## Channel Selection Guide
//!
//! ### MQTT push (`mqtt` feature, default)
//!
//! A remote camera node publishes frames and sensor readings to a broker.
//! Messages arrive whenever the node decides; the source keeps the latest.
//!
//! - Image messages: fixed-width header, base64 JPEG body
//! - Reading messages: `name:value` pairs
//! - Re-subscribes after every reconnect
//!
//! ### BLE GATT poll (`ble` feature for the btleplug backend)
//!
//! An environmental board is polled every few seconds. Scalars are read
//! directly, motion vectors are sampled by a short notification
//! subscription. A cycle is published only once every read has succeeded.
//!
//! ### I2C light sensor (`i2c` feature for the Linux backend)
//!
//! An APDS-9960 on the station's own bus, read on demand at merge time.
//! There is no background loop and no staleness beyond the bus transaction.
//!
//! ### Still camera
//!
//! `rpicam-still` driven as a subprocess, one invocation per frame.
//!
//! ## Retry Logic
//!
//! Every long-lived loop backs off exponentially on transient channel
//! failures:
//! ```text
//! retry_delay = min(base * 2^attempt, max_delay)
//! ```
//! and every backoff wait ends early when the station shuts down.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fieldfuse_connectors::mqtt::{MqttConfig, PushSource};
//! use fieldfuse_core::{StopSignal, SensorSource, SystemClock};
//!
//! let config = MqttConfig::new("192.168.0.117")
//!     .credentials("station", "secret")
//!     .topic("sensor/#");
//! let source = Arc::new(PushSource::new(config, "/data/images", Arc::new(SystemClock::default())));
//!
//! let stop = StopSignal::new();
//! let worker = {
//!     let source = Arc::clone(&source);
//!     let stop = stop.clone();
//!     std::thread::spawn(move || source.run(&stop))
//! };
//! stop.cancel();
//! worker.join().unwrap()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

pub mod ble;
pub mod bus;
pub mod camera;

#[cfg(feature = "mqtt")]
pub mod mqtt;

// Re-export common types
pub use ble::{GattConnector, GattLink, WirelessConfig, WirelessSource};
pub use bus::{Apds9960, BusSource, LightBus, LightChannels};
pub use camera::{RpicamConfig, RpicamStill};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConfig, PushError, PushSource};

/// Connection statistics common to all connectors
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages or poll cycles accepted
    pub messages_received: u64,
    /// Messages or cycles dropped as undecodable
    pub protocol_errors: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Number of reconnections
    pub reconnections: u32,
    /// Last error message
    pub last_error: Option<String>,
}

/// Exponential backoff for reconnect loops
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// First retry delay
    pub const DEFAULT_BASE: Duration = Duration::from_millis(100);
    /// Longest retry delay
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30);

    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Delay before the next attempt; grows until `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.base.saturating_mul(1 << self.attempt.min(16)).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the base delay after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_survives_many_attempts() {
        let mut backoff = Backoff::default();
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Backoff::DEFAULT_MAX);
        }
    }
}
