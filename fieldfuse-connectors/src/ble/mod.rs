//! BLE GATT poll source
//!
//! ## Overview
//!
//! An environmental sensor board is polled over GATT on a fixed cadence.
//! One poll cycle:
//!
//! 1. Note the cycle start time
//! 2. Read every scalar characteristic ([`codec::SCALARS`])
//! 3. For every vector characteristic ([`codec::VECTORS`]) subscribe, take
//!    the first notification, unsubscribe
//! 4. Derive the `euler` column from the quaternion
//! 5. Publish everything at once, stamped with the start time
//!
//! Nothing is published until step 5, so the coordinator never sees a
//! half-read cycle. A vector with no notification inside the wait window is
//! published as unknown for that cycle.
//!
//! ## Failure Handling
//!
//! | Failure                         | Effect                                   |
//! |---------------------------------|------------------------------------------|
//! | device not found, connect fails | back off, rescan                         |
//! | read fails mid-cycle            | cycle discarded, disconnect, reconnect   |
//! | value has the wrong length      | cycle discarded, link kept               |
//! | unavailable adapter             | source thread ends with the error        |
//!
//! The transport sits behind [`GattConnector`] / [`GattLink`]; the
//! `btleplug` backend is enabled with the `ble` feature.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use uuid::Uuid;

use fieldfuse_core::errors::{ChannelError, ProtocolError, SourceError};
use fieldfuse_core::snapshot::{MergeReport, SensorSnapshot, SnapshotBuffer, StalenessPolicy};
use fieldfuse_core::time::{Clock, Timestamp};
use fieldfuse_core::{Reading, SensorSource, StopSignal, UnifiedRecord};

use crate::{Backoff, ConnectionStats};

pub mod codec;

#[cfg(feature = "ble")]
pub mod btle;

#[cfg(feature = "ble")]
pub use btle::BtleplugConnector;

use codec::{quat_to_euler, EULER_FIELD, SCALARS, VECTORS};

/// An open connection to one peripheral
#[async_trait]
pub trait GattLink: Send {
    /// Read a characteristic's current value
    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, ChannelError>;

    /// Subscribe, wait up to `wait` for one notification, unsubscribe
    ///
    /// `Ok(None)` when nothing arrived in time.
    async fn next_notification(
        &mut self,
        characteristic: Uuid,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, ChannelError>;

    async fn disconnect(&mut self) -> Result<(), ChannelError>;
}

/// Finds a peripheral by advertised name and connects to it
#[async_trait]
pub trait GattConnector: Send + Sync {
    type Link: GattLink;

    /// Scan for up to `scan` and connect to `name`
    async fn connect(&self, name: &str, scan: Duration) -> Result<Self::Link, ChannelError>;
}

/// Wireless poll configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WirelessConfig {
    pub device_name: String,
    pub polling_interval: Duration,
    pub notification_wait: Duration,
    pub scan_window: Duration,
}

impl WirelessConfig {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            polling_interval: Duration::from_secs(10),
            notification_wait: Duration::from_secs(2),
            scan_window: Duration::from_secs(5),
        }
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn notification_wait(mut self, wait: Duration) -> Self {
        self.notification_wait = wait;
        self
    }

    pub fn scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self::new("NiclaSenseME-B806")
    }
}

#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Sensor source polling a GATT peripheral
pub struct WirelessSource<C: GattConnector> {
    config: WirelessConfig,
    connector: C,
    clock: Arc<dyn Clock>,
    buffer: SnapshotBuffer,
    stats: Mutex<ConnectionStats>,
    backoff: Backoff,
}

impl<C: GattConnector> WirelessSource<C> {
    pub fn new(config: WirelessConfig, connector: C, clock: Arc<dyn Clock>) -> Self {
        let fields = SCALARS
            .iter()
            .chain(VECTORS.iter())
            .map(|c| c.field)
            .chain(std::iter::once(EULER_FIELD));

        Self {
            config,
            connector,
            clock,
            buffer: SnapshotBuffer::new("wireless", fields),
            stats: Mutex::new(ConnectionStats::default()),
            backoff: Backoff::default(),
        }
    }

    /// Replace the reconnect backoff
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> SensorSnapshot {
        self.buffer.snapshot()
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.stats_lock().clone()
    }

    /// Read one full cycle over `link` and publish it
    pub async fn update(&self, link: &mut C::Link) -> Result<(), ChannelError> {
        match self.poll_cycle(link).await {
            Ok((started, readings)) => {
                self.buffer.publish(started, readings);
                self.stats_lock().messages_received += 1;
                info!("Received update from {}", self.config.device_name);
                Ok(())
            }
            Err(CycleError::Protocol(e)) => {
                error!("{}: cycle discarded: {}", self.config.device_name, e);
                let mut stats = self.stats_lock();
                stats.protocol_errors += 1;
                stats.last_error = Some(e.to_string());
                Ok(())
            }
            Err(CycleError::Channel(e)) => Err(e),
        }
    }

    async fn poll_cycle(
        &self,
        link: &mut C::Link,
    ) -> Result<(Timestamp, Vec<(&'static str, Option<Reading>)>), CycleError> {
        let started = self.clock.now();
        let mut readings = Vec::with_capacity(SCALARS.len() + VECTORS.len() + 1);

        for characteristic in &SCALARS {
            let bytes = link.read(characteristic.uuid()).await?;
            self.stats_lock().bytes_received += bytes.len() as u64;
            readings.push((characteristic.field, Some(characteristic.decode(&bytes)?)));
        }

        let mut euler = None;
        for characteristic in &VECTORS {
            let sample = link
                .next_notification(characteristic.uuid(), self.config.notification_wait)
                .await?;
            let reading = match sample {
                Some(bytes) => {
                    self.stats_lock().bytes_received += bytes.len() as u64;
                    Some(characteristic.decode(&bytes)?)
                }
                None => {
                    warn!("{}: no {} notification this cycle", self.config.device_name, characteristic.field);
                    None
                }
            };
            if let Some(Reading::Quat(q)) = &reading {
                euler = quat_to_euler(*q).map(Reading::Vec3);
            }
            readings.push((characteristic.field, reading));
        }
        readings.push((EULER_FIELD, euler));

        for (field, reading) in &readings {
            debug!("{}: {:?}", field, reading);
        }
        Ok((started, readings))
    }

    async fn poll_connected(&self, link: &mut C::Link, stop: &StopSignal) -> Result<(), ChannelError> {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                result = self.update(link) => result?,
            }
            if stop.sleep(self.config.polling_interval).await {
                return Ok(());
            }
        }
    }

    async fn listen(&self, stop: &StopSignal) -> Result<(), SourceError> {
        let mut backoff = self.backoff.clone();
        let name = &self.config.device_name;

        while !stop.is_cancelled() {
            debug!("Connecting to {}...", name);
            let connected = tokio::select! {
                _ = stop.cancelled() => break,
                link = self.connector.connect(name, self.config.scan_window) => link,
            };

            let error = match connected {
                Ok(mut link) => {
                    info!("Connected to {}", name);
                    backoff.reset();
                    let result = self.poll_connected(&mut link, stop).await;
                    if let Err(e) = link.disconnect().await {
                        debug!("Disconnect from {} failed: {}", name, e);
                    }
                    match result {
                        Ok(()) => break,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                error!("{}: giving up: {}", name, error);
                return Err(error.into());
            }

            let delay = backoff.next_delay();
            warn!("{}: {}; retrying in {:?}", name, error, delay);
            {
                let mut stats = self.stats_lock();
                stats.reconnections += 1;
                stats.last_error = Some(error.to_string());
            }
            if stop.sleep(delay).await {
                break;
            }
        }

        info!("Wireless source for {} stopped", name);
        Ok(())
    }

    fn stats_lock(&self) -> MutexGuard<'_, ConnectionStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: GattConnector> SensorSource for WirelessSource<C> {
    fn name(&self) -> &str {
        self.buffer.source()
    }

    fn merge(&self, target: &mut UnifiedRecord, policy: StalenessPolicy) -> MergeReport {
        self.buffer.merge_into(target, policy)
    }

    fn needs_thread(&self) -> bool {
        true
    }

    fn run(&self, stop: &StopSignal) -> Result<(), SourceError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ChannelError::Io)?;
        runtime.block_on(self.listen(stop))
    }
}
