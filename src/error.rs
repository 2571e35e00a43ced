//! Error types for the relay service.
//!
//! Platform failures are converted into one of the relay error kinds at the
//! boundary so nothing below the D-Bus surface has to know about BlueZ error
//! codes.

use bluer::Address;
use thiserror::Error;

/// Main error type for the relay service.
#[derive(Error, Debug)]
pub enum RelayError {
   #[error("Bluetooth permission denied: {0}")]
   PermissionDenied(String),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("UART service not found")]
   ServiceNotFound,

   #[error("Link error: {0}")]
   Link(String),

   #[error("Write failed: {0}")]
   WriteFailed(String),

   #[error("Bluetooth error: {0}")]
   Bluetooth(bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Already connected to device")]
   AlreadyConnected,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Adapter not found")]
   AdapterNotFound,
}

/// Raised by the bus itself when its policy refuses access to bluetoothd.
const DBUS_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";

impl From<bluer::Error> for RelayError {
   fn from(err: bluer::Error) -> Self {
      use bluer::{ErrorKind, InternalErrorKind};

      match err.kind {
         ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
            Self::PermissionDenied(err.message)
         },
         ErrorKind::Internal(InternalErrorKind::DBus(ref name)) if name == DBUS_ACCESS_DENIED => {
            Self::PermissionDenied(err.message)
         },
         ErrorKind::NotReady | ErrorKind::NotAvailable => Self::Link(err.message),
         _ => Self::Bluetooth(err),
      }
   }
}

impl RelayError {
   /// Short human readable reason, used as the payload of an error state.
   pub fn reason(&self) -> String {
      match self {
         Self::ServiceNotFound => "service not found".to_string(),
         Self::Link(msg) => msg.clone(),
         other => other.to_string(),
      }
   }
}

/// Convenience type alias for Results with `RelayError`.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
   use bluer::{ErrorKind, InternalErrorKind};

   use super::*;

   fn bluez_error(kind: ErrorKind) -> bluer::Error {
      bluer::Error {
         kind,
         message: "denied".to_string(),
      }
   }

   #[test]
   fn test_refusals_are_permission_errors() {
      for kind in [
         ErrorKind::NotAuthorized,
         ErrorKind::NotPermitted,
         ErrorKind::Internal(InternalErrorKind::DBus(DBUS_ACCESS_DENIED.to_string())),
      ] {
         assert!(matches!(
            RelayError::from(bluez_error(kind)),
            RelayError::PermissionDenied(msg) if msg == "denied"
         ));
      }
   }

   #[test]
   fn test_other_bluez_errors() {
      assert!(matches!(
         RelayError::from(bluez_error(ErrorKind::NotReady)),
         RelayError::Link(_)
      ));
      assert!(matches!(
         RelayError::from(bluez_error(ErrorKind::Internal(InternalErrorKind::DBus(
            "org.freedesktop.DBus.Error.NoReply".to_string()
         )))),
         RelayError::Bluetooth(_)
      ));
   }

   #[test]
   fn test_reason() {
      assert_eq!(RelayError::ServiceNotFound.reason(), "service not found");
      assert_eq!(RelayError::Link("adapter powered off".into()).reason(), "adapter powered off");
      assert_eq!(
         RelayError::InvalidAddress("nope".into()).reason(),
         "Invalid address: nope"
      );
   }
}
