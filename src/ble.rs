//! BT-1 link over bluest.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use bt1bridge_lib::dispatcher::Transport;
use bt1bridge_lib::Error;
use futures_util::{Stream, StreamExt};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::timeout;

const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffd1_0000_1000_8000_00805f9b34fb);

/// Which advertising device to pick. An empty selector takes the first
/// device whose name starts with `BT-TH`.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    pub name: Option<String>,
    pub mac: Option<String>,
}

impl DeviceSelector {
    fn matches(&self, name: &str, id: &str) -> bool {
        let name_matches = match &self.name {
            Some(wanted) => wanted == name,
            None => self.mac.is_some() || name.starts_with("BT-TH"),
        };
        let mac_matches = match &self.mac {
            Some(mac) => hex_digits(id).contains(&hex_digits(mac)),
            None => true,
        };
        name_matches && mac_matches
    }
}

/// Uppercased alphanumerics, so `dc:0d:..` matches a `dev_DC_0D_..` path.
fn hex_digits(s: &str) -> String {
    s.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Write half handed to the dispatcher. Usable once the services are resolved.
#[derive(Default)]
pub struct BleTransport {
    write: OnceLock<Characteristic>,
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&self, frame: &[u8]) -> Result<(), Error> {
        let characteristic = self
            .write
            .get()
            .ok_or_else(|| Error::TransportWriteFailed("services not resolved".into()))?;
        characteristic
            .write(frame)
            .await
            .map_err(|err| Error::TransportWriteFailed(Box::new(err)))
    }
}

pub struct BleLink {
    adapter: Adapter,
    device: Device,
}

impl BleLink {
    /// Scans until a matching module shows up, then connects to it.
    pub async fn connect(selector: &DeviceSelector, scan_timeout: Duration) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;

        let device = timeout(scan_timeout, Self::discover_device(selector, &adapter))
            .await
            .map_err(|_| anyhow!("No device matching {selector:?} found within {scan_timeout:?}"))??;

        log::info!("Connecting to {:?}", device.id());
        adapter
            .connect_device(&device)
            .await
            .with_context(|| format!("Cannot connect to {:?}", device.id()))?;
        Ok(Self { adapter, device })
    }

    async fn discover_device(selector: &DeviceSelector, adapter: &Adapter) -> Result<Device> {
        let mut adapter_events = adapter.scan(&[]).await?;
        while let Some(advertising) = adapter_events.next().await {
            let name = advertising.device.name_async().await.unwrap_or_default();
            let id = format!("{:?}", advertising.device.id());
            log::debug!("Discovered '{name}' {id}");
            if selector.matches(&name, &id) {
                return Ok(advertising.device);
            }
        }
        bail!("Scan ended without finding a device")
    }

    /// Locates the notify and write characteristics. The write one is handed to `transport`.
    pub async fn resolve(&self, transport: &BleTransport) -> Result<Characteristic> {
        let mut notify = None;
        let mut write = None;
        for service in self.device.discover_services().await? {
            for characteristic in service.discover_characteristics().await? {
                match characteristic.uuid() {
                    NOTIFY_CHARACTERISTIC => notify = Some(characteristic),
                    WRITE_CHARACTERISTIC => write = Some(characteristic),
                    _ => {}
                }
            }
        }
        let notify = notify.ok_or(anyhow!("Device has no notify characteristic {NOTIFY_CHARACTERISTIC}"))?;
        let write = write.ok_or(anyhow!("Device has no write characteristic {WRITE_CHARACTERISTIC}"))?;
        if transport.write.set(write).is_err() {
            log::warn!("Transport already resolved, keeping the previous write characteristic");
        }
        Ok(notify)
    }

    pub async fn disconnect(self) -> Result<()> {
        self.adapter.disconnect_device(&self.device).await?;
        log::info!("Disconnected from {:?}", self.device.id());
        Ok(())
    }
}

/// Subscribes to notifications on the resolved notify characteristic.
pub async fn notifications(
    notify: &Characteristic,
) -> Result<impl Stream<Item = Result<Vec<u8>, bluest::Error>> + Unpin + '_> {
    notify
        .notify()
        .await
        .context("Cannot subscribe to notifications")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_defaults_to_bt_modules() {
        let selector = DeviceSelector::default();
        assert!(selector.matches("BT-TH-309C6414", "DeviceId(\"/org/bluez/hci0/dev_DC_0D_30_9C_64_14\")"));
        assert!(!selector.matches("Speaker", "DeviceId(\"x\")"));
    }

    #[test]
    fn selector_by_name_and_mac() {
        let by_name = DeviceSelector {
            name: Some("BT-TH-309C6414".into()),
            mac: None,
        };
        assert!(by_name.matches("BT-TH-309C6414", ""));
        assert!(!by_name.matches("BT-TH-00000000", ""));

        let by_mac = DeviceSelector {
            name: None,
            mac: Some("dc:0d:30:9c:64:14".into()),
        };
        assert!(by_mac.matches("", "DeviceId(\"/org/bluez/hci0/dev_DC_0D_30_9C_64_14\")"));
        assert!(!by_mac.matches("BT-TH-309C6414", "DeviceId(\"/org/bluez/hci0/dev_00_11\")"));
    }

    #[test]
    fn uuids_match_bt1_characteristics() {
        assert_eq!(
            NOTIFY_CHARACTERISTIC.to_string(),
            "0000fff1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            WRITE_CHARACTERISTIC.to_string(),
            "0000ffd1-0000-1000-8000-00805f9b34fb"
        );
    }
}
