//! Connection manager for the UART peripheral.
//!
//! All connection state lives in a single actor task. Callers talk to it
//! through [`ConnectionManager`], the platform through [`LinkEvents`], and the
//! reconnection timer through the loopback channel; the actor applies them one
//! at a time, which keeps state transitions totally ordered.

use std::sync::Arc;

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      reconnect::ReconnectPolicy,
      scanner::Scanner,
      transport::{
         Link, LinkEvent, LinkEvents, LinkId, Transport, UART_RX_CHAR_UUID, UART_SERVICE_UUID,
      },
   },
   config::Config,
   error::{RelayError, Result},
   payload,
   state::{ConnectionState, StatePublisher, StateSubscription},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Outbound payloads waiting for the actor
const PAYLOAD_BUFFER_SIZE: usize = 32;

#[derive(Debug)]
enum ManagerCommand {
   Connect(Address, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<()>),
   /// Fired by the reconnection timer of the given session epoch.
   Reconnect(u64),
   #[cfg(test)]
   Epoch(oneshot::Sender<u64>),
}

/// Handle to the connection actor.
///
/// This type is cheaply cloneable. The actor shuts down, releasing the link,
/// once every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   payloads: PayloadSender,
   state: Arc<StatePublisher>,
}

impl ConnectionManager {
   pub fn new<T: Transport>(transport: Arc<T>, scanner: Arc<Scanner>, config: &Config) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_BUFFER_SIZE);
      let state = Arc::new(StatePublisher::new());

      tokio::spawn(
         ManagerActor::new(
            transport,
            scanner,
            config,
            state.clone(),
            command_rx,
            payload_rx,
         )
         .run(),
      );

      Self {
         inbox: command_tx,
         payloads: PayloadSender {
            tx: payload_tx,
            max_chars: config.max_payload_chars,
         },
         state,
      }
   }

   /// Starts connecting to `address`.
   ///
   /// Returns once the link open has been initiated; the outcome is observed
   /// through the state stream.
   pub async fn connect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Connect(address, tx))
         .await
         .map_err(|_| RelayError::ManagerShutdown)?;
      rx.await.map_err(|_| RelayError::ManagerShutdown)?
   }

   /// Drops the link and cancels any pending reconnection.
   pub async fn disconnect(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Disconnect(tx))
         .await
         .map_err(|_| RelayError::ManagerShutdown)?;
      rx.await.map_err(|_| RelayError::ManagerShutdown)
   }

   /// Writes raw bytes if connected, otherwise does nothing.
   pub async fn send(&self, data: Vec<u8>) -> Result<()> {
      self
         .payloads
         .tx
         .send(data)
         .await
         .map_err(|_| RelayError::ManagerShutdown)
   }

   pub fn state(&self) -> ConnectionState {
      self.state.current()
   }

   pub fn subscribe(&self) -> StateSubscription {
      self.state.subscribe()
   }

   /// Narrow capability for producers that only need to push text.
   pub fn payload_sender(&self) -> PayloadSender {
      self.payloads.clone()
   }
}

/// Sends encoded text to the active connection, without access to anything else.
#[derive(Debug, Clone)]
pub struct PayloadSender {
   tx: mpsc::Sender<Vec<u8>>,
   max_chars: usize,
}

impl PayloadSender {
   #[cfg(test)]
   pub fn channel(buffer: usize, max_chars: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
      let (tx, rx) = mpsc::channel(buffer);
      (Self { tx, max_chars }, rx)
   }

   /// Encodes and queues `text`. Returns `false` if it had to be dropped.
   pub fn send_text(&self, text: &str) -> bool {
      let data = payload::encode(text, self.max_chars);
      match self.tx.try_send(data) {
         Ok(()) => true,
         Err(e) => {
            warn!("Dropping payload: {e}");
            false
         },
      }
   }
}

struct ActiveLink<L: Link> {
   id: LinkId,
   link: L,
   characteristic: Option<L::Characteristic>,
}

struct ManagerActor<T: Transport> {
   transport: Arc<T>,
   scanner: Arc<Scanner>,
   state: Arc<StatePublisher>,
   handshake: Vec<u8>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   payload_rx: mpsc::Receiver<Vec<u8>>,
   link_rx: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
   link_tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,

   // State
   target: Option<Address>,
   link: Option<ActiveLink<T::Link>>,
   next_link_id: LinkId,
   /// Bumped on explicit connect and teardown; timers from older epochs are
   /// void.
   epoch: u64,
   policy: ReconnectPolicy,
   reconnect_task: Option<JoinHandle<()>>,
}

impl<T: Transport> ManagerActor<T> {
   fn new(
      transport: Arc<T>,
      scanner: Arc<Scanner>,
      config: &Config,
      state: Arc<StatePublisher>,
      command_rx: mpsc::Receiver<ManagerCommand>,
      payload_rx: mpsc::Receiver<Vec<u8>>,
   ) -> Self {
      let (link_tx, link_rx) = mpsc::unbounded_channel();
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         transport,
         scanner,
         state,
         handshake: payload::encode(&config.handshake, config.max_payload_chars),
         command_rx,
         payload_rx,
         link_rx,
         link_tx,
         loopback_rx,
         loopback_tx,
         target: None,
         link: None,
         next_link_id: 0,
         epoch: 0,
         policy: ReconnectPolicy::from_config(config),
         reconnect_task: None,
      }
   }

   async fn run(mut self) {
      debug!("Connection manager starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Connection manager shutting down");
                  break;
               };
               self.handle_command(cmd).await;
            }
            Some(data) = self.payload_rx.recv() => {
               self.send(data);
            }
            Some((id, event)) = self.link_rx.recv() => {
               self.handle_link_event(id, event).await;
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            }
         }
      }

      self.teardown().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Connect(addr, reply) => {
            let result = self.connect(addr).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(reply) => {
            self.teardown().await;
            let _ = reply.send(());
         },
         ManagerCommand::Reconnect(epoch) => {
            self.handle_reconnect(epoch).await;
         },
         #[cfg(test)]
         ManagerCommand::Epoch(reply) => {
            let _ = reply.send(self.epoch);
         },
      }
   }

   fn publish(&self, state: ConnectionState) {
      if self.state.publish(state.clone()) {
         match &state {
            ConnectionState::Error(reason) => warn!("Connection state: error ({reason})"),
            other => info!("Connection state: {}", other.as_str()),
         }
      }
   }

   async fn connect(&mut self, addr: Address) -> Result<()> {
      match self.state.current() {
         ConnectionState::Connecting => return Err(RelayError::AlreadyConnecting),
         ConnectionState::Connected => return Err(RelayError::AlreadyConnected),
         ConnectionState::Disconnected | ConnectionState::Error(_) => {},
      }

      self.epoch += 1;
      self.cancel_reconnect();
      self.policy.reset();
      self.target = Some(addr);

      self.open(addr).await.inspect_err(|e| {
         self.publish(ConnectionState::Error(e.reason()));
      })
   }

   /// Opens a fresh link to `addr` and enters `Connecting`.
   async fn open(&mut self, addr: Address) -> Result<()> {
      // The radio is shared with the scanner.
      self.scanner.stop_scan().await;

      if !self.transport.authorized().await {
         return Err(RelayError::PermissionDenied(
            "Missing Bluetooth permissions".into(),
         ));
      }

      self.release_link().await;

      self.next_link_id += 1;
      let id = self.next_link_id;
      let events = LinkEvents::new(id, self.link_tx.clone());
      let link = self.transport.open(addr, true, events).await?;

      info!("Connecting to {addr}");
      self.link = Some(ActiveLink {
         id,
         link,
         characteristic: None,
      });
      self.publish(ConnectionState::Connecting);
      Ok(())
   }

   async fn handle_link_event(&mut self, id: LinkId, event: LinkEvent) {
      let Some(active) = self.link.as_ref().filter(|l| l.id == id) else {
         debug!("Ignoring {event:?} from released link {id}");
         return;
      };

      match event {
         LinkEvent::Up => {
            if self.state.current() != ConnectionState::Connecting {
               return;
            }
            debug!("Link up, discovering services");
            let requested = active.link.discover_services().await;
            if let Err(e) = requested {
               warn!("Service discovery failed: {e}");
               self.link_lost(Some(e.reason())).await;
            }
         },
         LinkEvent::ServicesResolved => {
            if active.characteristic.is_some() {
               return;
            }
            let found = active
               .link
               .find_characteristic(UART_SERVICE_UUID, UART_RX_CHAR_UUID)
               .await;
            match found {
               Ok(Some(characteristic)) => self.on_channel_ready(characteristic).await,
               Ok(None) => {
                  warn!("Peripheral does not expose the UART service");
                  self.release_link().await;
                  self.publish(ConnectionState::Error(RelayError::ServiceNotFound.reason()));
               },
               Err(e) => {
                  warn!("Failed to resolve UART characteristic: {e}");
                  self.link_lost(Some(e.reason())).await;
               },
            }
         },
         LinkEvent::Down => {
            if !self.state.current().is_disconnected() {
               self.link_lost(None).await;
            }
         },
         LinkEvent::Failed(reason) => {
            self.link_lost(Some(reason)).await;
         },
         LinkEvent::WriteCompleted(Ok(())) => {
            debug!("Write completed");
         },
         LinkEvent::WriteCompleted(Err(e)) => {
            warn!("{e}");
         },
      }
   }

   async fn on_channel_ready(&mut self, characteristic: <T::Link as Link>::Characteristic) {
      if let Some(active) = self.link.as_mut() {
         active.characteristic = Some(characteristic);
      }
      self.policy.reset();
      self.publish(ConnectionState::Connected);

      self.send(self.handshake.clone());
   }

   /// Unexpected loss of the link: release it and maybe schedule a retry.
   async fn link_lost(&mut self, reason: Option<String>) {
      self.release_link().await;
      self.publish(match reason {
         Some(reason) => ConnectionState::Error(reason),
         None => ConnectionState::Disconnected,
      });
      self.schedule_reconnect();
   }

   fn schedule_reconnect(&mut self) {
      if self.target.is_none() {
         return;
      }

      let Some(delay) = self.policy.next_attempt() else {
         warn!(
            "Giving up after {} reconnection attempts",
            self.policy.max_attempts()
         );
         return;
      };

      info!(
         "Reconnecting in {delay:?} (attempt {}/{})",
         self.policy.attempts(),
         self.policy.max_attempts()
      );
      let loopback = self.loopback_tx.clone();
      let epoch = self.epoch;
      self.cancel_reconnect();
      self.reconnect_task = Some(tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(ManagerCommand::Reconnect(epoch)).await;
      }));
   }

   fn cancel_reconnect(&mut self) {
      if let Some(task) = self.reconnect_task.take() {
         task.abort();
      }
   }

   async fn handle_reconnect(&mut self, epoch: u64) {
      if epoch != self.epoch {
         debug!("Ignoring reconnection from torn down session");
         return;
      }
      self.reconnect_task = None;

      if !self.state.current().is_disconnected() || self.link.is_some() {
         return;
      }
      let Some(addr) = self.target else {
         return;
      };

      if let Err(e) = self.open(addr).await {
         warn!("Reconnection to {addr} failed: {e}");
         self.publish(ConnectionState::Error(e.reason()));
         self.schedule_reconnect();
      }
   }

   /// Hands `data` to the link without waiting for the peripheral.
   fn send(&self, data: Vec<u8>) {
      let Some(active) = self.link.as_ref() else {
         debug!("Not connected, dropping {} byte payload", data.len());
         return;
      };
      let Some(characteristic) = active.characteristic.as_ref() else {
         debug!("Channel not ready, dropping {} byte payload", data.len());
         return;
      };
      if self.state.current() != ConnectionState::Connected {
         return;
      }

      debug!("→ {}", hex::encode(&data));
      active.link.write(characteristic, data);
   }

   async fn release_link(&mut self) {
      if let Some(active) = self.link.take() {
         debug!("Releasing link {}", active.id);
         active.link.close().await;
      }
   }

   /// Explicit shutdown of the session.
   async fn teardown(&mut self) {
      self.epoch += 1;
      self.cancel_reconnect();
      self.target = None;
      self.release_link().await;
      self.publish(ConnectionState::Disconnected);
   }
}
