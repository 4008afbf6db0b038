//! Error types for the relay service.
//!
//! This module defines all error types that can occur while emulating the
//! board, talking to the real board, persisting the frame log and serving
//! the D-Bus control surface.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the relay service.
#[derive(Error, Debug)]
pub enum RelayError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("No adapter with GATT and LE advertising support found")]
   AdapterNotFound,

   #[error("Characteristic {0} not found on board")]
   CharacteristicNotFound(Uuid),

   #[error("Invalid injection payload: {0}")]
   InvalidInjection(String),

   #[error("Notify session closed")]
   NotifySessionClosed,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `RelayError`.
pub type Result<T> = std::result::Result<T, RelayError>;
