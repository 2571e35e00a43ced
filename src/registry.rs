//! Time bounded cache of peripherals seen while scanning.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::Address;
use log::debug;
use parking_lot::Mutex;
use serde_json::json;
use smol_str::SmolStr;
use tokio::{
   task::JoinHandle,
   time::{self, Instant, MissedTickBehavior},
};

use crate::event::{EventSender, RelayEvent};

/// A named, connectable peripheral observed during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
   pub name: SmolStr,
   pub address: Address,
   pub last_seen: Instant,
}

impl DiscoveredDevice {
   pub fn to_json(&self, now: Instant) -> serde_json::Value {
      json!({
         "name": self.name.as_str(),
         "address": self.address.to_string(),
         "age_ms": now.saturating_duration_since(self.last_seen).as_millis() as u64,
      })
   }
}

/// Devices seen recently, keyed by address.
pub struct DeviceRegistry {
   timeout: Duration,
   devices: Mutex<HashMap<Address, DiscoveredDevice>>,
}

impl DeviceRegistry {
   pub fn new(timeout: Duration) -> Self {
      Self {
         timeout,
         devices: Mutex::new(HashMap::new()),
      }
   }

   /// Inserts or refreshes `device`. Returns `true` if it was not known.
   pub fn observe(&self, device: DiscoveredDevice) -> bool {
      self
         .devices
         .lock()
         .insert(device.address, device)
         .is_none()
   }

   /// Drops every device not seen for longer than the timeout.
   pub fn sweep(&self, now: Instant) -> Vec<Address> {
      let mut expired = Vec::new();
      self.devices.lock().retain(|addr, device| {
         let keep = now.saturating_duration_since(device.last_seen) <= self.timeout;
         if !keep {
            expired.push(*addr);
         }
         keep
      });
      expired
   }

   /// Currently known devices, ordered by name.
   pub fn active(&self) -> Vec<DiscoveredDevice> {
      let mut devices: Vec<_> = self.devices.lock().values().cloned().collect();
      devices.sort_by(|a, b| a.name.cmp(&b.name).then(a.address.cmp(&b.address)));
      devices
   }

   pub fn len(&self) -> usize {
      self.devices.lock().len()
   }

   pub fn to_json(&self) -> serde_json::Value {
      let now = Instant::now();
      serde_json::Value::Array(self.active().iter().map(|d| d.to_json(now)).collect())
   }
}

/// Periodically expires stale devices, reporting each as [`RelayEvent::DeviceExpired`].
pub fn spawn_sweeper(
   registry: Arc<DeviceRegistry>,
   period: Duration,
   events: EventSender,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut ticker = time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
         ticker.tick().await;
         for addr in registry.sweep(Instant::now()) {
            debug!("Device {addr} expired");
            events.emit(RelayEvent::DeviceExpired(addr));
         }
      }
   })
}
