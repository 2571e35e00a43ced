//! Connection state and its fan-out to listeners.

use parking_lot::Mutex;
use strum::IntoStaticStr;
use tokio::sync::mpsc;

/// State of the link to the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Default, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Error(String),
}

impl ConnectionState {
   pub fn as_str(&self) -> &'static str {
      self.into()
   }

   /// Error states count as disconnected for reconnection purposes.
   pub const fn is_disconnected(&self) -> bool {
      matches!(self, Self::Disconnected | Self::Error(_))
   }

   pub fn detail(&self) -> &str {
      match self {
         Self::Error(reason) => reason,
         _ => "",
      }
   }
}

struct Inner {
   current: ConnectionState,
   subscribers: Vec<mpsc::UnboundedSender<ConnectionState>>,
}

/// Broadcasts state transitions to any number of subscribers.
///
/// Each subscriber owns an unbounded queue, so a slow reader never loses or
/// merges transitions. Publishing happens under one lock, which keeps every
/// queue in the same order.
pub struct StatePublisher {
   inner: Mutex<Inner>,
}

/// Receiving end of a [`StatePublisher`] subscription.
#[derive(Debug)]
pub struct StateSubscription {
   initial: Option<ConnectionState>,
   rx: mpsc::UnboundedReceiver<ConnectionState>,
}

impl StateSubscription {
   /// State at the time of subscribing.
   pub fn initial(&self) -> Option<&ConnectionState> {
      self.initial.as_ref()
   }

   /// Next transition, `None` once the publisher is gone.
   pub async fn recv(&mut self) -> Option<ConnectionState> {
      self.rx.recv().await
   }

   pub fn try_recv(&mut self) -> Option<ConnectionState> {
      self.rx.try_recv().ok()
   }
}

impl Default for StatePublisher {
   fn default() -> Self {
      Self::new()
   }
}

impl StatePublisher {
   pub fn new() -> Self {
      Self {
         inner: Mutex::new(Inner {
            current: ConnectionState::Disconnected,
            subscribers: Vec::new(),
         }),
      }
   }

   pub fn current(&self) -> ConnectionState {
      self.inner.lock().current.clone()
   }

   pub fn subscribe(&self) -> StateSubscription {
      let (tx, rx) = mpsc::unbounded_channel();
      let mut inner = self.inner.lock();
      inner.subscribers.push(tx);
      StateSubscription {
         initial: Some(inner.current.clone()),
         rx,
      }
   }

   /// Records `state` and delivers it to every live subscriber.
   ///
   /// Returns `false` when `state` equals the current state, in which case
   /// nothing is published.
   pub(crate) fn publish(&self, state: ConnectionState) -> bool {
      let mut inner = self.inner.lock();
      if inner.current == state {
         return false;
      }
      inner.current = state.clone();
      inner
         .subscribers
         .retain(|tx| tx.send(state.clone()).is_ok());
      true
   }
}
