//! Best-effort live fanout of journal events.

use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::journal::frame::FrameRecord;

/// Events delivered to live observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
   Log { entry: FrameRecord },
   Comment { id: SmolStr, comment: String },
}

/// A registered observer mailbox.
#[derive(Debug)]
pub struct Subscription {
   id: u64,
   rx: mpsc::Receiver<JournalEvent>,
}

impl Subscription {
   pub const fn id(&self) -> u64 {
      self.id
   }

   pub async fn recv(&mut self) -> Option<JournalEvent> {
      self.rx.recv().await
   }

   #[cfg(test)]
   pub fn try_recv(&mut self) -> Option<JournalEvent> {
      self.rx.try_recv().ok()
   }
}

pub struct EventHub {
   capacity: usize,
   next_id: AtomicU64,
   mailboxes: Mutex<Vec<(u64, mpsc::Sender<JournalEvent>)>>,
}

impl EventHub {
   pub fn new(capacity: usize) -> Self {
      Self {
         capacity: capacity.max(1),
         next_id: AtomicU64::new(0),
         mailboxes: Mutex::new(Vec::new()),
      }
   }

   pub fn subscribe(&self) -> Subscription {
      let (tx, rx) = mpsc::channel(self.capacity);
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self.mailboxes.lock().push((id, tx));
      Subscription { id, rx }
   }

   pub fn unsubscribe(&self, id: u64) {
      self.mailboxes.lock().retain(|(mid, _)| *mid != id);
   }

   #[cfg(test)]
   pub fn subscriber_count(&self) -> usize {
      self.mailboxes.lock().len()
   }

   /// Offers `event` to every mailbox without waiting. A full mailbox
   /// misses it; a mailbox whose receiver is gone is dropped.
   pub fn publish(&self, event: &JournalEvent) {
      self
         .mailboxes
         .lock()
         .retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
               trace!("Observer {id} mailbox full, event dropped");
               true
            },
            Err(TrySendError::Closed(_)) => {
               trace!("Observer {id} gone");
               false
            },
         });
   }
}
