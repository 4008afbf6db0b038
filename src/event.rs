//! Event handling between the Bluetooth roles and the relay.
//!
//! Both the emulated peripheral and the upstream link run on their own
//! tasks. Neither calls into the relay directly; they emit [`RelayEvent`]s
//! which a single dispatcher hands to the coordinator in arrival order.

use std::sync::Arc;

use smallvec::SmallVec;

/// One GATT payload. Board frames are short ASCII tokens, so they nearly
/// always stay inline.
pub type Packet = SmallVec<[u8; 32]>;

/// Events produced by the Bluetooth side of the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
   /// The real board notified a value.
   BoardNotified(Packet),
   /// The app wrote a value to the emulated write characteristic.
   AppWrote(Packet),
   /// The app enabled notifications on the emulated notify characteristic.
   AppSubscribed,
   /// The app disabled notifications or went away.
   AppUnsubscribed,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Queues an event for the relay. Must not block.
   fn emit(&self, event: RelayEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

#[cfg(test)]
pub(crate) mod tests {
   use parking_lot::Mutex;

   use super::*;

   /// Records every emitted event in order.
   #[derive(Default)]
   pub(crate) struct CollectingBus {
      pub events: Mutex<Vec<RelayEvent>>,
   }

   impl EventBus for CollectingBus {
      fn emit(&self, event: RelayEvent) {
         self.events.lock().push(event);
      }
   }
}
