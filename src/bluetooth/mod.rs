//! Bluetooth side of the relay.
//!
//! The core (scanner, connection manager, reconnection policy) only talks to
//! the platform through the traits in [`transport`]; [`bluez`] is the
//! production backend.

pub mod bluez;
pub mod manager;
pub mod reconnect;
pub mod scanner;
pub mod transport;

#[cfg(test)]
mod testing;
