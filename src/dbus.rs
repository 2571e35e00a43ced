use std::{
   str::FromStr,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use bluer::Address;
use log::{info, warn};
use parking_lot::Mutex;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{manager::ConnectionManager, scanner::Scanner},
   config::Config,
   error::{RelayError, Result},
   registry::DeviceRegistry,
};

pub const BUS_NAME: &str = "org.blerelay";
pub const OBJECT_PATH: &str = "/org/blerelay/manager";

pub struct RelayService {
   manager: ConnectionManager,
   scanner: Arc<Scanner>,
   registry: Arc<DeviceRegistry>,
   config: Arc<Mutex<Config>>,
   active: Arc<AtomicBool>,
}

impl RelayService {
   pub const fn new(
      manager: ConnectionManager,
      scanner: Arc<Scanner>,
      registry: Arc<DeviceRegistry>,
      config: Arc<Mutex<Config>>,
      active: Arc<AtomicBool>,
   ) -> Self {
      Self {
         manager,
         scanner,
         registry,
         config,
         active,
      }
   }

   async fn remember_device(&self, address: &str) {
      let snapshot = {
         let mut config = self.config.lock();
         if config.last_device.as_deref() == Some(address) {
            return;
         }
         config.last_device = Some(address.to_string());
         config.clone()
      };
      if let Err(e) = snapshot.persist().await {
         warn!("Failed to save last device: {e}");
      }
   }
}

/// Parses a `XX:XX:XX:XX:XX:XX` device address.
pub fn parse_address(address: &str) -> Result<Address> {
   Address::from_str(address).map_err(|_| RelayError::InvalidAddress(address.to_string()))
}

#[interface(name = "org.blerelay.Manager")]
impl RelayService {
   /// Toggles scanning; `false` means a running scan was stopped.
   async fn start_scan(&self) -> zbus::fdo::Result<bool> {
      self
         .scanner
         .toggle()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn stop_scan(&self) {
      self.scanner.stop_scan().await;
   }

   async fn get_devices(&self) -> String {
      self.registry.to_json().to_string()
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .manager
         .connect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      self.remember_device(&addr.to_string()).await;
      Ok(true)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self
         .manager
         .disconnect()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   /// Sends `text` as-is, bypassing the notification filters.
   async fn send_text(&self, text: String) -> bool {
      self.manager.payload_sender().send_text(&text)
   }

   async fn start_service(
      &self,
      #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
   ) -> zbus::fdo::Result<()> {
      if !self.active.swap(true, Ordering::AcqRel) {
         info!("Relay service started");
         self.service_active_changed(&emitter).await?;
      }
      Ok(())
   }

   async fn stop_service(
      &self,
      #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
   ) -> zbus::fdo::Result<()> {
      let was_active = self.active.swap(false, Ordering::AcqRel);
      self
         .manager
         .disconnect()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      if was_active {
         info!("Relay service stopped");
         self.service_active_changed(&emitter).await?;
      }
      Ok(())
   }

   // Signals
   #[zbus(signal, name = "StateChanged")]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      state: &str,
      detail: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_discovered(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_expired(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn notice(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self.manager.state().as_str().to_string()
   }

   #[zbus(property)]
   async fn scanning(&self) -> bool {
      self.scanner.is_scanning().await
   }

   #[zbus(property)]
   async fn service_active(&self) -> bool {
      self.active.load(Ordering::Acquire)
   }
}
