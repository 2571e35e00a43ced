//! BlueZ backend for the transport seam.
//!
//! Discovery runs an LE discovery session on the configured adapter. Links
//! are plain GATT client connections: a connect task, a property watcher and
//! a sequential writer, all owned by the link and aborted when it is closed.
//!
//! Peripherals that are not bonded are forgotten by BlueZ when it restarts,
//! so opening an address it does not know scans for it first.

use std::{
   sync::atomic::{AtomicBool, Ordering},
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, Session, gatt::remote::Characteristic,
};
use futures::{Stream, StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinSet, time};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{
      Advertisement, Discovery, DiscoveryHandle, Link, LinkEvent, LinkEvents, Transport,
      WriteQueue,
   },
   error::{RelayError, Result},
};

/// Timeout for a single connection attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Connection attempts made by the platform before reporting failure
const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_QUEUE_SIZE: usize = 32;
/// How long an uncached address is scanned for before giving up
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// AD flags: LE limited or general discoverable mode.
const FLAGS_DISCOVERABLE: u8 = 0x01 | 0x02;

pub struct BluezTransport {
   _session: Session,
   adapter: Adapter,
}

impl BluezTransport {
   /// Opens `adapter_name`, or the default adapter, and powers it on.
   pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session
            .default_adapter()
            .await
            .map_err(|_| RelayError::AdapterNotFound)?,
      };

      if !adapter.is_powered().await? {
         info!("Powering on adapter {}", adapter.name());
         adapter.set_powered(true).await?;
      }
      info!(
         "Using adapter {} ({})",
         adapter.name(),
         adapter.address().await?
      );

      Ok(Self {
         _session: session,
         adapter,
      })
   }
}

#[async_trait]
impl Discovery for BluezTransport {
   async fn authorized(&self) -> bool {
      is_authorized(&self.adapter.is_powered().await)
   }

   async fn start_discovery(
      &self,
      sink: mpsc::UnboundedSender<Advertisement>,
   ) -> Result<DiscoveryHandle> {
      require_powered(self.adapter.is_powered().await)?;
      self.adapter.set_discovery_filter(le_filter()).await?;
      let events = self.adapter.discover_devices().await?;
      let adapter = self.adapter.clone();

      Ok(DiscoveryHandle::new(tokio::spawn(async move {
         pin_mut!(events);
         let mut watchers = JoinSet::new();
         while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            let Ok(device) = adapter.device(addr) else {
               continue;
            };
            if !report(&device, &sink).await {
               break;
            }
            watchers.spawn(watch_advertiser(device, sink.clone()));
         }
         debug!("Discovery session ended");
      })))
   }
}

/// Only a refused read means bluetoothd is off limits; any other failure is
/// reported by the operation that runs into it.
fn is_authorized(powered: &bluer::Result<bool>) -> bool {
   match powered {
      Ok(_) => true,
      Err(e) => !matches!(RelayError::from(e.clone()), RelayError::PermissionDenied(_)),
   }
}

fn require_powered(powered: bluer::Result<bool>) -> Result<()> {
   if powered? {
      Ok(())
   } else {
      Err(RelayError::Link("adapter powered off".into()))
   }
}

fn le_filter() -> DiscoveryFilter {
   DiscoveryFilter {
      transport: DiscoveryTransport::Le,
      duplicate_data: true,
      ..Default::default()
   }
}

/// Waits until `address` is among the `added` devices.
async fn wait_for_device(
   added: impl Stream<Item = Address>,
   address: Address,
   timeout: Duration,
) -> bool {
   pin_mut!(added);
   let found = async {
      while let Some(addr) = added.next().await {
         if addr == address {
            return true;
         }
      }
      false
   };
   time::timeout(timeout, found).await.unwrap_or(false)
}

/// Re-reports a device whenever BlueZ sees a fresh advertisement from it.
async fn watch_advertiser(device: Device, sink: mpsc::UnboundedSender<Advertisement>) {
   let Ok(events) = device.events().await else {
      return;
   };
   pin_mut!(events);
   while let Some(event) = events.next().await {
      let DeviceEvent::PropertyChanged(prop) = event;
      if matches!(
         prop,
         DeviceProperty::Rssi(_) | DeviceProperty::Name(_) | DeviceProperty::ManufacturerData(_)
      ) && !report(&device, &sink).await
      {
         return;
      }
   }
}

/// Returns `false` once nobody listens anymore.
async fn report(device: &Device, sink: &mpsc::UnboundedSender<Advertisement>) -> bool {
   let adv = Advertisement {
      address: device.address(),
      name: device.name().await.ok().flatten(),
      connectable: is_connectable(device).await,
   };
   sink.send(adv).is_ok()
}

/// BlueZ does not expose the advertising PDU type, so discoverable AD flags
/// (or a bond) stand in for connectability.
async fn is_connectable(device: &Device) -> bool {
   let flags = device
      .advertising_flags()
      .await
      .ok()
      .flatten()
      .unwrap_or_default();
   match flags.first() {
      Some(flags) if flags & FLAGS_DISCOVERABLE != 0 => true,
      Some(_) => device.is_paired().await.unwrap_or(false),
      None => true,
   }
}

impl BluezTransport {
   /// Makes sure BlueZ has a device object for `address`, scanning for it
   /// if necessary.
   async fn resolve(&self, address: Address) -> Result<Device> {
      if !self.adapter.device_addresses().await?.contains(&address) {
         info!("{address} is not known yet, scanning for it");
         // Fails while another discovery session runs; its filter will do.
         if let Err(e) = self.adapter.set_discovery_filter(le_filter()).await {
            debug!("Keeping current discovery filter: {e}");
         }
         let added = self
            .adapter
            .discover_devices()
            .await?
            .filter_map(|event| async move {
               match event {
                  AdapterEvent::DeviceAdded(addr) => Some(addr),
                  _ => None,
               }
            });
         if !wait_for_device(added, address, RESOLVE_TIMEOUT).await {
            return Err(RelayError::DeviceNotFound(address));
         }
      }
      Ok(self.adapter.device(address)?)
   }
}

#[async_trait]
impl Transport for BluezTransport {
   type Link = BluezLink;

   async fn open(
      &self,
      address: Address,
      auto_reconnect: bool,
      events: LinkEvents,
   ) -> Result<BluezLink> {
      require_powered(self.adapter.is_powered().await)?;
      let device = self.resolve(address).await?;
      let properties = device.events().await?;

      let (writes, write_rx) = WriteQueue::new(WRITE_QUEUE_SIZE, events.clone());
      let mut tasks = JoinSet::new();
      tasks.spawn(watch_link(properties, events.clone()));
      tasks.spawn(connect_thread(device.clone(), auto_reconnect, events.clone()));
      tasks.spawn(write_thread(address, write_rx, events.clone()));

      debug!("Opened link {} to {address}", events.id());
      Ok(BluezLink {
         device,
         events,
         writes,
         tasks: Mutex::new(tasks),
         closed: AtomicBool::new(false),
      })
   }
}

async fn connect_thread(device: Device, auto_reconnect: bool, events: LinkEvents) {
   let tries = if auto_reconnect { CONNECT_RETRIES } else { 1 };
   let mut last_error = String::new();

   for attempt in 1..=tries {
      match time::timeout(CONNECT_TIMEOUT, device.connect()).await {
         Ok(Ok(())) => {
            events.emit(LinkEvent::Up);
            return;
         },
         Ok(Err(e)) => {
            debug!("Connect attempt {attempt}/{tries} failed: {e}");
            last_error = e.to_string();
         },
         Err(_) => {
            debug!("Connect attempt {attempt}/{tries} timed out");
            last_error = "connection timed out".to_string();
         },
      }
      if attempt < tries {
         time::sleep(CONNECT_RETRY_DELAY).await;
      }
   }

   events.emit(LinkEvent::Failed(last_error));
}

async fn watch_link(
   properties: impl futures::Stream<Item = DeviceEvent> + Send + 'static,
   events: LinkEvents,
) {
   pin_mut!(properties);
   while let Some(event) = properties.next().await {
      let DeviceEvent::PropertyChanged(prop) = event;
      let delivered = match prop {
         DeviceProperty::Connected(false) => events.emit(LinkEvent::Down),
         DeviceProperty::ServicesResolved(true) => events.emit(LinkEvent::ServicesResolved),
         _ => true,
      };
      if !delivered {
         return;
      }
   }
}

async fn write_thread(
   adr: Address,
   mut rx: mpsc::Receiver<(Characteristic, Vec<u8>)>,
   events: LinkEvents,
) {
   while let Some((characteristic, data)) = rx.recv().await {
      let result = match time::timeout(WRITE_TIMEOUT, characteristic.write(&data)).await {
         Ok(Ok(())) => Ok(()),
         Ok(Err(e)) => Err(RelayError::WriteFailed(e.to_string())),
         Err(_) => Err(RelayError::WriteFailed("timed out".into())),
      };
      if let Err(e) = &result {
         warn!("Write to {adr} failed: {e}");
      }
      events.emit(LinkEvent::WriteCompleted(result));
   }
}

/// GATT client link to one peripheral.
pub struct BluezLink {
   device: Device,
   events: LinkEvents,
   writes: WriteQueue<Characteristic>,
   tasks: Mutex<JoinSet<()>>,
   closed: AtomicBool,
}

#[async_trait]
impl Link for BluezLink {
   type Characteristic = Characteristic;

   async fn discover_services(&self) -> Result<()> {
      // BlueZ resolves services on its own after connecting; if that already
      // happened the watcher will not see the transition.
      if self.device.is_services_resolved().await? {
         self.events.emit(LinkEvent::ServicesResolved);
      }
      Ok(())
   }

   async fn find_characteristic(
      &self,
      service: Uuid,
      characteristic: Uuid,
   ) -> Result<Option<Characteristic>> {
      for candidate in self.device.services().await? {
         if candidate.uuid().await? != service {
            continue;
         }
         for ch in candidate.characteristics().await? {
            if ch.uuid().await? == characteristic {
               return Ok(Some(ch));
            }
         }
      }
      Ok(None)
   }

   fn write(&self, characteristic: &Characteristic, data: Vec<u8>) {
      if !self.writes.push(characteristic.clone(), data) {
         warn!("Dropped write to {}", self.device.address());
      }
   }

   async fn close(&self) {
      if self.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      self.tasks.lock().abort_all();
      if let Err(e) = self.device.disconnect().await {
         debug!("Disconnect from {} failed: {e}", self.device.address());
      }
   }
}
