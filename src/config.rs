//! Configuration management for the relay service.
//!
//! This module handles loading and saving configuration from disk,
//! including the remembered peripheral and the link tuning parameters.

use std::{env, fs, io, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::task;

use crate::{
   error::{RelayError, Result},
   payload,
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// Adapter to use, e.g. `hci0`. The default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   /// Peripheral connected to last, reconnected at startup.
   #[serde(default)]
   pub last_device: Option<String>,

   #[serde(default = "default_true")]
   pub auto_connect: bool,

   #[serde(default = "default_reconnect_attempts")]
   pub reconnect_attempts: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_ms: u64,

   #[serde(default = "default_max_payload_chars")]
   pub max_payload_chars: usize,

   #[serde(default = "default_device_timeout")]
   pub device_timeout_ms: u64,

   #[serde(default = "default_cleanup_interval")]
   pub cleanup_interval_ms: u64,

   /// Sent once the write characteristic is resolved.
   #[serde(default = "default_handshake")]
   pub handshake: String,

   #[serde(default = "default_true")]
   pub forward_notifications: bool,

   /// Application names whose notifications are never relayed.
   #[serde(default)]
   pub ignored_apps: Vec<String>,
}

const fn default_true() -> bool {
   true
}

const fn default_reconnect_attempts() -> u32 {
   3
}

const fn default_reconnect_delay() -> u64 {
   1000
}

const fn default_max_payload_chars() -> usize {
   payload::MAX_PAYLOAD_CHARS
}

const fn default_device_timeout() -> u64 {
   3000
}

const fn default_cleanup_interval() -> u64 {
   2000
}

fn default_handshake() -> String {
   "Service Connected".to_string()
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         last_device: None,
         auto_connect: default_true(),
         reconnect_attempts: default_reconnect_attempts(),
         reconnect_delay_ms: default_reconnect_delay(),
         max_payload_chars: default_max_payload_chars(),
         device_timeout_ms: default_device_timeout(),
         cleanup_interval_ms: default_cleanup_interval(),
         handshake: default_handshake(),
         forward_notifications: default_true(),
         ignored_apps: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   fn load_from(config_path: PathBuf) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   /// Saves the configuration on the blocking pool.
   pub async fn persist(self) -> Result<()> {
      let config_path = Self::config_path()?;
      self.persist_to(config_path).await
   }

   async fn persist_to(self, config_path: PathBuf) -> Result<()> {
      task::spawn_blocking(move || self.save_to(config_path))
         .await
         .map_err(io::Error::other)?
   }

   fn save_to(&self, config_path: PathBuf) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(relay_home) = env::var("BLERELAY_HOME") {
         return Ok(PathBuf::from(relay_home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(RelayError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("blerelay").join("config.toml"))
   }

   pub const fn reconnect_delay(&self) -> Duration {
      Duration::from_millis(self.reconnect_delay_ms)
   }

   pub const fn device_timeout(&self) -> Duration {
      Duration::from_millis(self.device_timeout_ms)
   }

   pub const fn cleanup_interval(&self) -> Duration {
      Duration::from_millis(self.cleanup_interval_ms)
   }

   /// Whether notifications from `app` are skipped.
   pub fn is_app_ignored(&self, app: &str) -> bool {
      self
         .ignored_apps
         .iter()
         .any(|ignored| ignored.eq_ignore_ascii_case(app))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_missing_file_creates_defaults() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(path.clone())?;
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(config.reconnect_attempts, 3);
      assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
      assert_eq!(config.max_payload_chars, 150);

      Ok(())
   }

   #[test]
   fn test_partial_file_uses_defaults() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "last_device = \"AA:BB:CC:DD:EE:FF\"\nignored_apps = [\"Slack\"]\n",
      )?;

      let config = Config::load_from(path)?;
      assert_eq!(config.last_device.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
      assert!(config.auto_connect);
      assert_eq!(config.device_timeout(), Duration::from_secs(3));
      assert_eq!(config.cleanup_interval(), Duration::from_secs(2));
      assert!(config.is_app_ignored("slack"));
      assert!(!config.is_app_ignored("Firefox"));

      Ok(())
   }

   #[test]
   fn test_save_round_trip() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");

      let config = Config {
         last_device: Some("11:22:33:44:55:66".into()),
         handshake: "Hello".into(),
         ..Config::default()
      };
      config.save_to(path.clone())?;

      assert_eq!(Config::load_from(path)?, config);
      Ok(())
   }

   #[tokio::test]
   async fn test_persist_writes_from_async_context() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config {
         last_device: Some("24:0A:C4:12:34:56".into()),
         ..Config::default()
      };
      config.clone().persist_to(path.clone()).await?;

      assert_eq!(Config::load_from(path)?, config);
      Ok(())
   }

   #[test]
   fn test_invalid_toml_is_an_error() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "reconnect_attempts = \"many\"").unwrap();

      assert!(matches!(
         Config::load_from(path),
         Err(RelayError::TomlParse(_))
      ));
   }
}
