//! Event handling for relay status updates.
//!
//! Producers running on platform or timer contexts emit [`RelayEvent`]s; a
//! single consumer turns them into D-Bus signals in emission order.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::{registry::DiscoveredDevice, state::ConnectionState};

/// Events that can be emitted by the relay service.
#[derive(Debug, Clone)]
pub enum RelayEvent {
   StateChanged(ConnectionState),
   DeviceDiscovered(DiscoveredDevice),
   DeviceExpired(Address),
   /// User facing message, e.g. a scan that could not be started.
   Notice(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: RelayEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
