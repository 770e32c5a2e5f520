//! BLE transport over btleplug.
//!
//! The controller is thread-based, so this adapter owns a small tokio runtime
//! and bridges each call with `block_on`. Notification streams run as runtime
//! tasks and hand every payload to the registered callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as BtlePeripheral};
use futures::StreamExt;
use pidose_traits::{BoxError, NotifyFn, Peripheral, Transport};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{HwError, Result};

const SCAN_POLL: Duration = Duration::from_millis(200);

fn map_btle(e: btleplug::Error) -> HwError {
    match e {
        btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => HwError::NotConnected,
        btleplug::Error::TimedOut(_) => HwError::Timeout,
        other => HwError::Transport(other.to_string()),
    }
}

fn parse_uuid(characteristic: &str) -> Result<Uuid> {
    Uuid::parse_str(characteristic)
        .map_err(|e| HwError::Transport(format!("bad characteristic id {characteristic}: {e}")))
}

pub struct BleTransport {
    rt: Arc<Runtime>,
    adapter: Adapter,
}

impl BleTransport {
    /// Open the first Bluetooth adapter on the host.
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ble-rt")
            .enable_all()
            .build()?;
        let adapter = rt.block_on(async {
            let manager = Manager::new().await.map_err(map_btle)?;
            manager
                .adapters()
                .await
                .map_err(map_btle)?
                .into_iter()
                .next()
                .ok_or_else(|| HwError::Transport("no bluetooth adapter found".into()))
        })?;
        Ok(Self {
            rt: Arc::new(rt),
            adapter,
        })
    }

    async fn find(&self, address: &str, timeout: Duration) -> Result<BtlePeripheral> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(map_btle)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let found = loop {
            let peripherals = self.adapter.peripherals().await.map_err(map_btle)?;
            if let Some(p) = peripherals
                .into_iter()
                .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            {
                break Some(p);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };
        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "stop_scan failed");
        }
        // An absent scale looks the same as a dropped link to the retry loop.
        found.ok_or(HwError::NotConnected)
    }
}

impl Transport for BleTransport {
    type Peripheral = BlePeripheral;

    fn connect(
        &self,
        address: &str,
        timeout: Duration,
        auto_reconnect: bool,
    ) -> std::result::Result<BlePeripheral, BoxError> {
        let peripheral = self.rt.block_on(async {
            let p = self.find(address, timeout).await?;
            if !p.is_connected().await.map_err(map_btle)? {
                match tokio::time::timeout(timeout, p.connect()).await {
                    Ok(res) => res.map_err(map_btle)?,
                    Err(_) => return Err(HwError::Timeout),
                }
            }
            p.discover_services().await.map_err(map_btle)?;
            Ok::<_, HwError>(p)
        })?;
        if auto_reconnect {
            // btleplug has no link supervision; the connection manager reconnects instead.
            debug!(address, "auto_reconnect handled by connection manager");
        }
        info!(address, "scale connected");
        Ok(BlePeripheral {
            rt: self.rt.clone(),
            peripheral,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    fn discover(&self, timeout: Duration) -> std::result::Result<Vec<String>, BoxError> {
        let found = self.rt.block_on(async {
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(map_btle)?;
            tokio::time::sleep(timeout).await;
            let mut out = Vec::new();
            for p in self.adapter.peripherals().await.map_err(map_btle)? {
                let named = p
                    .properties()
                    .await
                    .map_err(map_btle)?
                    .and_then(|props| props.local_name)
                    .is_some();
                if named {
                    out.push(p.address().to_string());
                }
            }
            if let Err(e) = self.adapter.stop_scan().await {
                debug!(error = %e, "stop_scan failed");
            }
            Ok::<_, HwError>(out)
        })?;
        Ok(found)
    }
}

pub struct BlePeripheral {
    rt: Arc<Runtime>,
    peripheral: BtlePeripheral,
    listeners: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl BlePeripheral {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| HwError::Transport(format!("characteristic {uuid} not found")))
    }
}

impl Peripheral for BlePeripheral {
    fn subscribe(
        &self,
        characteristic: &str,
        callback: NotifyFn,
        wait_for_response: bool,
    ) -> std::result::Result<(), BoxError> {
        let uuid = parse_uuid(characteristic)?;
        let ch = self.characteristic(uuid)?;
        // btleplug always writes the CCCD with response.
        trace!(%uuid, wait_for_response, "subscribe");
        let peripheral = self.peripheral.clone();
        let rt = self.rt.clone();
        let task = self.rt.block_on(async move {
            let mut stream = peripheral.notifications().await.map_err(map_btle)?;
            peripheral.subscribe(&ch).await.map_err(map_btle)?;
            Ok::<_, HwError>(rt.spawn(async move {
                while let Some(n) = stream.next().await {
                    if n.uuid == uuid {
                        callback(&n.value);
                    }
                }
                debug!(%uuid, "notification stream ended");
            }))
        })?;
        let previous = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid, task);
        if let Some(old) = previous {
            old.abort();
        }
        Ok(())
    }

    fn unsubscribe(
        &self,
        characteristic: &str,
        wait_for_response: bool,
    ) -> std::result::Result<(), BoxError> {
        let uuid = parse_uuid(characteristic)?;
        if let Some(task) = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&uuid)
        {
            task.abort();
        }
        let ch = self.characteristic(uuid)?;
        trace!(%uuid, wait_for_response, "unsubscribe");
        self.rt
            .block_on(self.peripheral.unsubscribe(&ch))
            .map_err(map_btle)?;
        Ok(())
    }
}

impl Drop for BlePeripheral {
    fn drop(&mut self) {
        for (_, task) in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            task.abort();
        }
        if let Err(e) = self.rt.block_on(self.peripheral.disconnect()) {
            warn!(error = %e, "failed to disconnect scale");
        }
    }
}
