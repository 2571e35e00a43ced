//! Advertisement scanning for peripherals to offer for selection.
//!
//! Raw advertisements are filtered on a forwarding task and handed to the
//! event bus, so consumers only ever see them on the dispatcher context.

use std::sync::Arc;

use log::{debug, info, warn};
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::{Mutex, mpsc},
   task::JoinHandle,
   time::Instant,
};

use crate::{
   bluetooth::transport::{Advertisement, Discovery, DiscoveryHandle},
   error::{RelayError, Result},
   event::{EventSender, RelayEvent},
   registry::DiscoveredDevice,
};

struct ScanSession {
   _discovery: DiscoveryHandle,
   forwarder: JoinHandle<()>,
}

impl Drop for ScanSession {
   fn drop(&mut self) {
      self.forwarder.abort();
   }
}

/// Toggleable BLE scanner.
pub struct Scanner {
   discovery: Arc<dyn Discovery>,
   events: EventSender,
   session: Mutex<Option<ScanSession>>,
}

impl Scanner {
   pub fn new(discovery: Arc<dyn Discovery>, events: EventSender) -> Self {
      Self {
         discovery,
         events,
         session: Mutex::new(None),
      }
   }

   /// Starts scanning, or stops a running scan.
   ///
   /// Returns `Ok(true)` when a scan was started and `Ok(false)` when a
   /// running scan was stopped instead.
   pub async fn start_scan(&self, permissions_granted: bool) -> Result<bool> {
      let mut session = self.session.lock().await;
      if session.take().is_some() {
         info!("Scan stopped");
         return Ok(false);
      }

      if !permissions_granted {
         self.notice("Missing required permissions");
         return Err(RelayError::PermissionDenied(
            "scanning requires Bluetooth access".into(),
         ));
      }

      let (tx, mut rx) = mpsc::unbounded_channel();
      let discovery = match self.discovery.start_discovery(tx).await {
         Ok(discovery) => discovery,
         Err(e) => {
            warn!("Failed to start scanning: {e}");
            self.notice(&format!("Failed to start scanning: {e}"));
            return Err(e);
         },
      };

      let events = self.events.clone();
      let forwarder = tokio::spawn(async move {
         while let Some(adv) = rx.recv().await {
            if let Some(device) = discovered_device(adv, Instant::now()) {
               events.emit(RelayEvent::DeviceDiscovered(device));
            }
         }
         debug!("Advertisement stream ended");
      });

      *session = Some(ScanSession {
         _discovery: discovery,
         forwarder,
      });
      info!("Scan started");
      Ok(true)
   }

   /// Checks permissions with the platform, then toggles scanning.
   pub async fn toggle(&self) -> Result<bool> {
      let granted = self.discovery.authorized().await;
      self.start_scan(granted).await
   }

   /// Stops scanning. Does nothing when no scan is running.
   pub async fn stop_scan(&self) {
      if self.session.lock().await.take().is_some() {
         info!("Scan stopped");
      }
   }

   pub async fn is_scanning(&self) -> bool {
      self.session.lock().await.is_some()
   }

   fn notice(&self, message: &str) {
      self.events.emit(RelayEvent::Notice(message.to_smolstr()));
   }
}

/// Keeps connectable advertisements that carry a name.
fn discovered_device(adv: Advertisement, now: Instant) -> Option<DiscoveredDevice> {
   if !adv.connectable {
      return None;
   }
   let name = adv.name.filter(|n| !n.trim().is_empty())?;
   Some(DiscoveredDevice {
      name: SmolStr::new(name),
      address: adv.address,
      last_seen: now,
   })
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use bluer::Address;

   use super::*;
   use crate::bluetooth::testing::{EventLog, MockTransport};

   const ADDR: Address = Address([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01]);

   fn adv(name: Option<&str>, connectable: bool) -> Advertisement {
      Advertisement {
         address: ADDR,
         name: name.map(str::to_string),
         connectable,
      }
   }

   #[test]
   fn test_filter_requires_name_and_connectable() {
      let now = Instant::now();

      assert!(discovered_device(adv(None, true), now).is_none());
      assert!(discovered_device(adv(Some(""), true), now).is_none());
      assert!(discovered_device(adv(Some("ESP32"), false), now).is_none());

      let device = discovered_device(adv(Some("ESP32"), true), now).unwrap();
      assert_eq!(device.name, "ESP32");
      assert_eq!(device.address, ADDR);
      assert_eq!(device.last_seen, now);
   }

   #[tokio::test]
   async fn test_scan_toggles() -> Result<()> {
      let transport = MockTransport::new();
      let log = EventLog::new();
      let scanner = Scanner::new(transport.clone(), log.clone());

      assert!(scanner.start_scan(true).await?);
      assert!(scanner.is_scanning().await);
      assert_eq!(transport.discovery_starts(), 1);

      assert!(!scanner.start_scan(true).await?);
      assert!(!scanner.is_scanning().await);

      scanner.stop_scan().await;
      scanner.stop_scan().await;
      assert!(!scanner.is_scanning().await);
      Ok(())
   }

   #[tokio::test]
   async fn test_missing_permissions_reports_notice() {
      let transport = MockTransport::new();
      let log = EventLog::new();
      let scanner = Scanner::new(transport.clone(), log.clone());

      let result = scanner.start_scan(false).await;
      assert!(matches!(result, Err(RelayError::PermissionDenied(_))));
      assert!(!scanner.is_scanning().await);
      assert_eq!(transport.discovery_starts(), 0);
      assert_eq!(log.notices(), vec!["Missing required permissions"]);
   }

   #[tokio::test]
   async fn test_platform_refusal_is_reported() {
      let transport = MockTransport::new();
      transport.refuse_discovery();
      let log = EventLog::new();
      let scanner = Scanner::new(transport.clone(), log.clone());

      assert!(matches!(
         scanner.start_scan(true).await,
         Err(RelayError::Link(_))
      ));
      assert!(!scanner.is_scanning().await);
      assert_eq!(log.notices().len(), 1);
   }

   #[tokio::test]
   async fn test_toggle_consults_platform() {
      let transport = MockTransport::new();
      transport.set_authorized(false);
      let scanner = Scanner::new(transport.clone(), EventLog::new());

      assert!(matches!(
         scanner.toggle().await,
         Err(RelayError::PermissionDenied(_))
      ));

      transport.set_authorized(true);
      assert!(matches!(scanner.toggle().await, Ok(true)));
   }

   #[tokio::test]
   async fn test_only_named_connectable_devices_are_emitted() -> Result<()> {
      let transport = MockTransport::new();
      let log = EventLog::new();
      let scanner = Scanner::new(transport.clone(), log.clone());
      scanner.start_scan(true).await?;

      transport.advertise(adv(None, true));
      transport.advertise(adv(Some("Beacon"), false));
      transport.advertise(adv(Some("ESP32 Display"), true));
      tokio::time::sleep(Duration::from_millis(10)).await;

      let names: Vec<_> = log
         .discovered()
         .into_iter()
         .map(|d| d.name.to_string())
         .collect();
      assert_eq!(names, vec!["ESP32 Display"]);
      Ok(())
   }
}
