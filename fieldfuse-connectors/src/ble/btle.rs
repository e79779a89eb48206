//! `btleplug` transport for the wireless source
//!
//! A fresh `Manager` is created on every connect so the adapter always
//! belongs to the runtime driving the source loop.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info};
use uuid::Uuid;

use fieldfuse_core::errors::ChannelError;

use super::{GattConnector, GattLink};

fn channel_error(err: btleplug::Error) -> ChannelError {
    match err {
        btleplug::Error::DeviceNotFound => ChannelError::DeviceNotFound("peripheral".into()),
        btleplug::Error::TimedOut(_) => ChannelError::Timeout,
        btleplug::Error::PermissionDenied => ChannelError::Unavailable("permission denied".into()),
        other => ChannelError::Connect(other.to_string()),
    }
}

/// Connects through the host's first Bluetooth adapter
#[derive(Debug, Clone, Default)]
pub struct BtleplugConnector {
    adapter_index: usize,
}

impl BtleplugConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the adapter at `index` instead of the first one
    pub fn adapter(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }
}

#[async_trait]
impl GattConnector for BtleplugConnector {
    type Link = BtleplugLink;

    async fn connect(&self, name: &str, scan: Duration) -> Result<Self::Link, ChannelError> {
        let manager = Manager::new().await.map_err(channel_error)?;
        let central = manager
            .adapters()
            .await
            .map_err(channel_error)?
            .into_iter()
            .nth(self.adapter_index)
            .ok_or_else(|| ChannelError::Unavailable(format!("no Bluetooth adapter #{}", self.adapter_index)))?;

        central.start_scan(ScanFilter::default()).await.map_err(channel_error)?;
        tokio::time::sleep(scan).await;

        let mut found = None;
        for peripheral in central.peripherals().await.map_err(channel_error)? {
            let properties = peripheral.properties().await.map_err(channel_error)?;
            if properties.and_then(|p| p.local_name).as_deref() == Some(name) {
                found = Some(peripheral);
                break;
            }
        }
        if let Err(e) = central.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }

        let peripheral = found.ok_or_else(|| ChannelError::DeviceNotFound(name.to_string()))?;
        peripheral.connect().await.map_err(channel_error)?;
        peripheral.discover_services().await.map_err(channel_error)?;
        info!("Device {} found and connected", name);

        let characteristics = peripheral.characteristics();
        Ok(BtleplugLink { peripheral, characteristics })
    }
}

/// Connected `btleplug` peripheral
pub struct BtleplugLink {
    peripheral: Peripheral,
    characteristics: BTreeSet<Characteristic>,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, ChannelError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| ChannelError::Connect(format!("characteristic {uuid} not offered")))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, ChannelError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.read(characteristic).await.map_err(channel_error)
    }

    async fn next_notification(
        &mut self,
        characteristic: Uuid,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        let target = self.characteristic(characteristic)?.clone();
        let mut notifications = self.peripheral.notifications().await.map_err(channel_error)?;
        self.peripheral.subscribe(&target).await.map_err(channel_error)?;

        let sample = tokio::time::timeout(wait, async {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic {
                    return Some(notification.value);
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        self.peripheral.unsubscribe(&target).await.map_err(channel_error)?;
        Ok(sample)
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.peripheral.disconnect().await.map_err(channel_error)
    }
}
