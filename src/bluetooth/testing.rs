//! Scripted in-memory platform used by the unit tests.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use bluer::Address;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
   bluetooth::transport::{
      Advertisement, Discovery, DiscoveryHandle, Link, LinkEvent, LinkEvents, Transport,
      UART_RX_CHAR_UUID, UART_SERVICE_UUID, WriteQueue,
   },
   error::{RelayError, Result},
   event::{EventBus, RelayEvent},
   registry::DiscoveredDevice,
};

struct MockState {
   authorized: bool,
   refuse_discovery: bool,
   discovery_starts: usize,
   adv_sink: Option<mpsc::UnboundedSender<Advertisement>>,
   unknown: HashSet<Address>,
   uncached: HashSet<Address>,
   resolve_scans: usize,
   opens: Vec<Address>,
   events: Option<LinkEvents>,
   has_uart: bool,
   fail_writes: bool,
   stall_writes: bool,
   stalled: Vec<mpsc::Receiver<(Uuid, Vec<u8>)>>,
   writes: Vec<Vec<u8>>,
   closes: usize,
}

/// Platform double. Link events are injected by the test through [`MockTransport::emit`].
pub struct MockTransport {
   state: Arc<Mutex<MockState>>,
}

impl MockTransport {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         state: Arc::new(Mutex::new(MockState {
            authorized: true,
            refuse_discovery: false,
            discovery_starts: 0,
            adv_sink: None,
            unknown: HashSet::new(),
            uncached: HashSet::new(),
            resolve_scans: 0,
            opens: Vec::new(),
            events: None,
            has_uart: true,
            fail_writes: false,
            stall_writes: false,
            stalled: Vec::new(),
            writes: Vec::new(),
            closes: 0,
         })),
      })
   }

   pub fn set_authorized(&self, authorized: bool) {
      self.state.lock().authorized = authorized;
   }

   pub fn refuse_discovery(&self) {
      self.state.lock().refuse_discovery = true;
   }

   pub fn discovery_starts(&self) -> usize {
      self.state.lock().discovery_starts
   }

   pub fn advertise(&self, adv: Advertisement) {
      if let Some(sink) = &self.state.lock().adv_sink {
         let _ = sink.send(adv);
      }
   }

   /// Makes `address` unresolvable.
   pub fn forget(&self, address: Address) {
      self.state.lock().unknown.insert(address);
   }

   /// Makes `address` resolvable only by scanning for it.
   pub fn uncache(&self, address: Address) {
      self.state.lock().uncached.insert(address);
   }

   /// Scans run by `open` to find uncached addresses.
   pub fn resolve_scans(&self) -> usize {
      self.state.lock().resolve_scans
   }

   pub fn set_uart_service(&self, present: bool) {
      self.state.lock().has_uart = present;
   }

   pub fn fail_writes(&self) {
      self.state.lock().fail_writes = true;
   }

   /// Writes are queued but the peripheral never acknowledges them.
   pub fn stall_writes(&self) {
      self.state.lock().stall_writes = true;
   }

   pub fn opens(&self) -> Vec<Address> {
      self.state.lock().opens.clone()
   }

   pub fn writes(&self) -> Vec<Vec<u8>> {
      self.state.lock().writes.clone()
   }

   pub fn closes(&self) -> usize {
      self.state.lock().closes
   }

   /// Sink of the most recently opened link.
   pub fn link_events(&self) -> Option<LinkEvents> {
      self.state.lock().events.clone()
   }

   /// Reports `event` on the most recently opened link.
   pub fn emit(&self, event: LinkEvent) {
      let events = self.link_events().expect("no link opened");
      events.emit(event);
   }
}

#[async_trait]
impl Discovery for MockTransport {
   async fn authorized(&self) -> bool {
      self.state.lock().authorized
   }

   async fn start_discovery(
      &self,
      sink: mpsc::UnboundedSender<Advertisement>,
   ) -> Result<DiscoveryHandle> {
      let mut state = self.state.lock();
      if state.refuse_discovery {
         return Err(RelayError::Link("discovery refused".into()));
      }
      state.discovery_starts += 1;
      state.adv_sink = Some(sink);
      Ok(DiscoveryHandle::new(tokio::spawn(
         futures::future::pending::<()>(),
      )))
   }
}

#[async_trait]
impl Transport for MockTransport {
   type Link = MockLink;

   async fn open(
      &self,
      address: Address,
      _auto_reconnect: bool,
      events: LinkEvents,
   ) -> Result<MockLink> {
      let mut state = self.state.lock();
      state.opens.push(address);
      if state.uncached.remove(&address) {
         state.resolve_scans += 1;
      }
      if state.unknown.contains(&address) {
         return Err(RelayError::DeviceNotFound(address));
      }
      state.events = Some(events.clone());

      let (queue, rx) = WriteQueue::new(1, events.clone());
      state.stalled.push(rx);
      Ok(MockLink {
         events,
         queue,
         state: self.state.clone(),
      })
   }
}

pub struct MockLink {
   events: LinkEvents,
   /// Never drained; used while writes are stalled.
   queue: WriteQueue<Uuid>,
   state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Link for MockLink {
   type Characteristic = Uuid;

   async fn discover_services(&self) -> Result<()> {
      self.events.emit(LinkEvent::ServicesResolved);
      Ok(())
   }

   async fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Option<Uuid>> {
      let found = self.state.lock().has_uart
         && service == UART_SERVICE_UUID
         && characteristic == UART_RX_CHAR_UUID;
      Ok(found.then_some(characteristic))
   }

   fn write(&self, characteristic: &Uuid, data: Vec<u8>) {
      let result = {
         let mut state = self.state.lock();
         state.writes.push(data.clone());
         if state.stall_writes {
            drop(state);
            self.queue.push(*characteristic, data);
            return;
         }
         if state.fail_writes {
            Err(RelayError::WriteFailed("rejected".into()))
         } else {
            Ok(())
         }
      };
      self.events.emit(LinkEvent::WriteCompleted(result));
   }

   async fn close(&self) {
      self.state.lock().closes += 1;
   }
}

/// Event bus that records everything it is given.
#[derive(Default)]
pub struct EventLog {
   events: Mutex<Vec<RelayEvent>>,
}

impl EventLog {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn notices(&self) -> Vec<String> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            RelayEvent::Notice(msg) => Some(msg.to_string()),
            _ => None,
         })
         .collect()
   }

   pub fn discovered(&self) -> Vec<DiscoveredDevice> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            RelayEvent::DeviceDiscovered(device) => Some(device.clone()),
            _ => None,
         })
         .collect()
   }
}

impl EventBus for EventLog {
   fn emit(&self, event: RelayEvent) {
      self.events.lock().push(event);
   }
}
