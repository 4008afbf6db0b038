//! Configuration management for the relay service.
//!
//! This module handles loading and saving configuration from disk. The
//! loaded [`Config`] is passed explicitly to every component that needs it.

use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

use bluer::Address;
use serde::{Deserialize, Serialize};
use uuid::{Uuid, uuid};

use crate::error::{RelayError, Result};

/// GATT service exposed by the board.
pub const BOARD_SERVICE_UUID: Uuid = uuid!("442f1570-8a00-9a28-cbe1-e1d4212d53eb");
/// Characteristic the board notifies on.
pub const BOARD_NOTIFY_UUID: Uuid = uuid!("442f1571-8a00-9a28-cbe1-e1d4212d53eb");
/// Characteristic the app writes to.
pub const BOARD_WRITE_UUID: Uuid = uuid!("442f1572-8a00-9a28-cbe1-e1d4212d53eb");

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
   #[serde(default)]
   pub board: BoardConfig,

   #[serde(default)]
   pub peripheral: PeripheralConfig,

   #[serde(default)]
   pub link: LinkConfig,

   #[serde(default)]
   pub relay: RelayConfig,

   #[serde(default)]
   pub journal: JournalConfig,
}

/// The real board we relay to.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BoardConfig {
   /// Last known address. Boards rotate random addresses across power
   /// cycles, so this is only a starting point for rediscovery.
   #[serde(default = "default_board_address")]
   pub address: String,

   /// Advertised name matched (case-insensitively, as substring) while
   /// rediscovering the board.
   #[serde(default = "default_board_name")]
   pub name: String,

   #[serde(default = "default_scan_window_sec")]
   pub scan_window_sec: u64,
}

/// The emulated board presented to the app.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeripheralConfig {
   /// Adapter to use; the first one with LE advertising support if unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default = "default_board_name")]
   pub local_name: String,

   #[serde(default = "default_service_uuid")]
   pub service_uuid: Uuid,

   #[serde(default = "default_notify_uuid")]
   pub notify_uuid: Uuid,

   #[serde(default = "default_write_uuid")]
   pub write_uuid: Uuid,
}

/// Upstream connection supervision.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LinkConfig {
   #[serde(default = "default_connect_timeout_sec")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_retry_delay_ms")]
   pub retry_delay_ms: u64,

   #[serde(default = "default_write_poll_ms")]
   pub write_poll_ms: u64,
}

/// Notification buffering between board and app.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RelayConfig {
   #[serde(default = "default_buffer_capacity")]
   pub buffer_capacity: usize,

   #[serde(default = "default_replay_pacing_ms")]
   pub replay_pacing_ms: u64,
}

/// Frame log persistence and live fanout.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JournalConfig {
   #[serde(default = "default_log_path")]
   pub path: PathBuf,

   #[serde(default = "default_log_capacity")]
   pub capacity: usize,

   #[serde(default = "default_history_limit")]
   pub history_limit: usize,

   #[serde(default = "default_mailbox_capacity")]
   pub mailbox_capacity: usize,
}

fn default_board_address() -> String {
   "C2:A4:CF:2B:5F:F6".to_string()
}

fn default_board_name() -> String {
   "GRANBOARD".to_string()
}

const fn default_scan_window_sec() -> u64 {
   6
}

const fn default_service_uuid() -> Uuid {
   BOARD_SERVICE_UUID
}

const fn default_notify_uuid() -> Uuid {
   BOARD_NOTIFY_UUID
}

const fn default_write_uuid() -> Uuid {
   BOARD_WRITE_UUID
}

const fn default_connect_timeout_sec() -> u64 {
   20
}

const fn default_retry_delay_ms() -> u64 {
   3000
}

const fn default_write_poll_ms() -> u64 {
   250
}

const fn default_buffer_capacity() -> usize {
   300
}

const fn default_replay_pacing_ms() -> u64 {
   20
}

fn default_log_path() -> PathBuf {
   dirs::data_local_dir()
      .or_else(dirs::home_dir)
      .unwrap_or_else(env::temp_dir)
      .join("gbmitmd")
      .join("mitm_log.json")
}

const fn default_log_capacity() -> usize {
   4000
}

const fn default_history_limit() -> usize {
   800
}

const fn default_mailbox_capacity() -> usize {
   300
}

impl Default for BoardConfig {
   fn default() -> Self {
      Self {
         address: default_board_address(),
         name: default_board_name(),
         scan_window_sec: default_scan_window_sec(),
      }
   }
}

impl Default for PeripheralConfig {
   fn default() -> Self {
      Self {
         adapter: None,
         local_name: default_board_name(),
         service_uuid: default_service_uuid(),
         notify_uuid: default_notify_uuid(),
         write_uuid: default_write_uuid(),
      }
   }
}

impl Default for LinkConfig {
   fn default() -> Self {
      Self {
         connect_timeout_sec: default_connect_timeout_sec(),
         retry_delay_ms: default_retry_delay_ms(),
         write_poll_ms: default_write_poll_ms(),
      }
   }
}

impl Default for RelayConfig {
   fn default() -> Self {
      Self {
         buffer_capacity: default_buffer_capacity(),
         replay_pacing_ms: default_replay_pacing_ms(),
      }
   }
}

impl Default for JournalConfig {
   fn default() -> Self {
      Self {
         path: default_log_path(),
         capacity: default_log_capacity(),
         history_limit: default_history_limit(),
         mailbox_capacity: default_mailbox_capacity(),
      }
   }
}

impl BoardConfig {
   /// Parses the configured board address.
   pub fn address(&self) -> Result<Address> {
      Address::from_str(self.address.trim())
         .map_err(|_| RelayError::InvalidAddress(self.address.clone()))
   }

   pub const fn scan_window(&self) -> Duration {
      Duration::from_secs(self.scan_window_sec)
   }
}

impl LinkConfig {
   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn retry_delay(&self) -> Duration {
      Duration::from_millis(self.retry_delay_ms)
   }

   pub const fn write_poll(&self) -> Duration {
      Duration::from_millis(self.write_poll_ms)
   }
}

impl RelayConfig {
   pub const fn replay_pacing(&self) -> Duration {
      Duration::from_millis(self.replay_pacing_ms)
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         let config: Self = toml::from_str(&contents)?;
         config.validate()?;
         Ok(config)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   /// Rejects values that would make the relay unusable.
   pub fn validate(&self) -> Result<()> {
      self.board.address()?;
      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("GB_MITM_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(RelayError::ConfigDirNotFound);
      };

      Ok(config_dir.join("gbmitmd").join("config.toml"))
   }
}
