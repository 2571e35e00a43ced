//! Platform seam between the relay core and the Bluetooth stack.
//!
//! The platform reports link activity asynchronously. Implementations push
//! [`LinkEvent`]s into the [`LinkEvents`] sink handed to [`Transport::open`]
//! instead of touching connection state themselves; the manager actor is the
//! only consumer.

use async_trait::async_trait;
use bluer::Address;
use tokio::{
   sync::mpsc::{self, error::TrySendError},
   task::JoinHandle,
};
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Nordic-style UART service exposed by the peripheral.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Write (RX from the peripheral's point of view) characteristic.
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Identifies one opened link; events from released links are stale.
pub type LinkId = u64;

/// Asynchronous notifications about an opened link.
#[derive(Debug)]
pub enum LinkEvent {
   /// The radio link is up, services are not yet known.
   Up,
   /// The link went away.
   Down,
   /// The link could not be established or broke with an error.
   Failed(String),
   /// GATT services are resolved and can be queried.
   ServicesResolved,
   /// Completion of a characteristic write.
   WriteCompleted(Result<()>),
}

/// Sink for [`LinkEvent`]s, tagged with the link they belong to.
#[derive(Debug, Clone)]
pub struct LinkEvents {
   id: LinkId,
   tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
}

impl LinkEvents {
   pub const fn new(id: LinkId, tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>) -> Self {
      Self { id, tx }
   }

   pub const fn id(&self) -> LinkId {
      self.id
   }

   /// Delivers `event`. Returns `false` once the manager is gone.
   pub fn emit(&self, event: LinkEvent) -> bool {
      self.tx.send((self.id, event)).is_ok()
   }
}

/// Bounded hand-off from the manager to a link's writer task.
///
/// Pushing never waits. A write that does not fit is failed on the spot and
/// reported as [`LinkEvent::WriteCompleted`] like any other write.
pub struct WriteQueue<C> {
   tx: mpsc::Sender<(C, Vec<u8>)>,
   events: LinkEvents,
}

impl<C> WriteQueue<C> {
   pub fn new(capacity: usize, events: LinkEvents) -> (Self, mpsc::Receiver<(C, Vec<u8>)>) {
      let (tx, rx) = mpsc::channel(capacity);
      (Self { tx, events }, rx)
   }

   /// Queues `data` for `characteristic`. Returns `false` if it was dropped.
   pub fn push(&self, characteristic: C, data: Vec<u8>) -> bool {
      let reason = match self.tx.try_send((characteristic, data)) {
         Ok(()) => return true,
         Err(TrySendError::Full(_)) => "write queue full",
         Err(TrySendError::Closed(_)) => "link closed",
      };
      self
         .events
         .emit(LinkEvent::WriteCompleted(Err(RelayError::WriteFailed(reason.into()))));
      false
   }
}

/// One advertisement report seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
   pub address: Address,
   pub name: Option<String>,
   pub connectable: bool,
}

/// Keeps a discovery session running; discovery stops when dropped.
#[derive(Debug)]
pub struct DiscoveryHandle {
   task: JoinHandle<()>,
}

impl DiscoveryHandle {
   pub const fn new(task: JoinHandle<()>) -> Self {
      Self { task }
   }
}

impl Drop for DiscoveryHandle {
   fn drop(&mut self) {
      self.task.abort();
   }
}

/// Advertisement scanning capability of the platform.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
   /// Whether this process is allowed to use the radio.
   async fn authorized(&self) -> bool;

   /// Starts reporting advertisements into `sink`.
   async fn start_discovery(
      &self,
      sink: mpsc::UnboundedSender<Advertisement>,
   ) -> Result<DiscoveryHandle>;
}

/// GATT client capability of the platform.
#[async_trait]
pub trait Transport: Discovery {
   type Link: Link;

   /// Resolves `address` and starts opening a link to it.
   ///
   /// An address the platform has not seen yet is looked for with a short
   /// discovery before [`RelayError::DeviceNotFound`] is returned.
   ///
   /// Returns as soon as the open is initiated; the outcome is reported
   /// through `events`. With `auto_reconnect` the platform retries the radio
   /// connection on its own before giving up.
   async fn open(
      &self,
      address: Address,
      auto_reconnect: bool,
      events: LinkEvents,
   ) -> Result<Self::Link>;
}

/// An opened GATT link.
#[async_trait]
pub trait Link: Send + Sync + 'static {
   type Characteristic: Clone + Send + Sync + 'static;

   /// Requests service discovery; completion arrives as
   /// [`LinkEvent::ServicesResolved`].
   async fn discover_services(&self) -> Result<()>;

   async fn find_characteristic(
      &self,
      service: Uuid,
      characteristic: Uuid,
   ) -> Result<Option<Self::Characteristic>>;

   /// Queues a write without waiting for the peripheral; completion arrives
   /// as [`LinkEvent::WriteCompleted`].
   fn write(&self, characteristic: &Self::Characteristic, data: Vec<u8>);

   /// Disconnects and releases the link. Safe to call more than once.
   async fn close(&self);
}
