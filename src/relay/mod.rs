//! The relay between the emulated board and the real one.
//!
//! The coordinator only sees the two roles through the narrow traits
//! below, which keeps it independent of BlueZ and testable in memory.

pub mod buffer;
pub mod coordinator;
pub mod inject;

pub use coordinator::RelayCoordinator;

use crate::error::Result;

/// The app-facing notify path.
pub trait AppNotifier: Send + Sync {
   /// Queues a notification for the app. When nobody is subscribed the
   /// payload is dropped and `Ok` is returned.
   fn send_notify(&self, payload: &[u8]) -> Result<()>;
}

/// The board-facing write path.
pub trait BoardWriter: Send + Sync {
   /// Queues a write for the board. Never blocks.
   fn write(&self, payload: &[u8]);
}
