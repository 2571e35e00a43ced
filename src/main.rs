//! BLE notification relay daemon
//!
//! Relays desktop notifications to a BLE peripheral exposing a UART-style
//! GATT service, and exposes scanning and connection control over D-Bus.

use std::{
   sync::{Arc, atomic::AtomicBool},
   time::Duration,
};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{bluez::BluezTransport, manager::ConnectionManager, scanner::Scanner};
use dbus::RelayService;
use event::{EventBus, RelayEvent};
use notifications::NotificationRelay;
use registry::DeviceRegistry;

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod notifications;
mod payload;
mod registry;
mod state;

use crate::{dbus::RelayServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting BLE relay service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration (last device: {})",
      config.last_device.as_deref().unwrap_or("none")
   );

   // Create event channel
   let event_bus = EventProcessor::new();

   let transport = Arc::new(BluezTransport::new(config.adapter.as_deref()).await?);
   let registry = Arc::new(DeviceRegistry::new(config.device_timeout()));
   let scanner = Arc::new(Scanner::new(transport.clone(), event_bus.clone()));
   let manager = ConnectionManager::new(transport, scanner.clone(), &config);

   let active = Arc::new(AtomicBool::new(true));
   let shared_config = Arc::new(Mutex::new(config.clone()));

   // Create D-Bus service
   let service = RelayService::new(
      manager.clone(),
      scanner.clone(),
      registry.clone(),
      shared_config.clone(),
      active.clone(),
   );

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(dbus::BUS_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("BLE relay D-Bus service started at {}", dbus::BUS_NAME);

   // Start event processor
   event_bus
      .clone()
      .spawn_dispatcher(connection, registry.clone())
      .await?;

   let mut states = manager.subscribe();
   if let Some(state) = states.initial() {
      debug!("Initial connection state: {}", state.as_str());
   }
   let state_events = event_bus.clone();
   tokio::spawn(async move {
      while let Some(state) = states.recv().await {
         state_events.emit(RelayEvent::StateChanged(state));
      }
   });

   let _sweeper =
      registry::spawn_sweeper(registry, config.cleanup_interval(), event_bus.clone());

   let _monitor = match notifications::spawn_monitor(NotificationRelay::new(
      manager.payload_sender(),
      active,
      shared_config,
   ))
   .await
   {
      Ok(handle) => Some(handle),
      Err(e) => {
         warn!("Notification forwarding unavailable: {e}");
         None
      },
   };

   if config.auto_connect
      && let Some(last) = config.last_device.as_deref()
   {
      match dbus::parse_address(last) {
         Ok(addr) => {
            info!("Reconnecting to last device {addr}");
            if let Err(e) = manager.connect(addr).await {
               warn!("Failed to connect to {addr}: {e}");
            }
         },
         Err(e) => warn!("Ignoring last device: {e}"),
      }
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down BLE relay service...");
   scanner.stop_scan().await;
   manager.disconnect().await?;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<RelayEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<RelayEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<RelayService>,
      registry: &DeviceRegistry,
      event: RelayEvent,
   ) -> Result<()> {
      match event {
         RelayEvent::StateChanged(state) => {
            iface
               .connection_state_changed(state.as_str(), state.detail())
               .await?;
            iface
               .get()
               .await
               .state_changed(iface.signal_emitter())
               .await?;
         },
         RelayEvent::DeviceDiscovered(device) => {
            let address = device.address.to_string();
            let name = device.name.clone();
            if registry.observe(device) {
               info!("Discovered {name} ({address}), {} nearby", registry.len());
               iface.device_discovered(&address, &name).await?;
            }
         },
         RelayEvent::DeviceExpired(addr) => {
            iface.device_expired(&addr.to_string()).await?;
         },
         RelayEvent::Notice(message) => {
            warn!("{message}");
            iface.notice(&message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(
      self: Arc<Self>,
      connection: Connection,
      registry: Arc<DeviceRegistry>,
   ) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, RelayService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, &registry, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: RelayEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
