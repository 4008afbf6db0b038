//! Observability sink for relayed frames.
//!
//! Every observed or injected frame is appended to a durable log and
//! offered to live observers. Nothing here ever blocks on an observer, and
//! a failed write to disk is reported but never interrupts the relay.

pub mod frame;
pub mod hub;
pub mod store;

use std::{
   process,
   sync::atomic::{AtomicU64, Ordering},
   time::{SystemTime, UNIX_EPOCH},
};

use log::warn;
use smol_str::{SmolStr, format_smolstr};

pub use frame::{Direction, FrameRecord, Origin};
pub use hub::{EventHub, JournalEvent, Subscription};
pub use store::FrameLog;

use crate::{config::JournalConfig, error::Result};

pub struct Journal {
   log: FrameLog,
   hub: EventHub,
   seq: AtomicU64,
}

impl Journal {
   pub fn open(config: &JournalConfig) -> Result<Self> {
      Ok(Self {
         log: FrameLog::open(&config.path, config.capacity)?,
         hub: EventHub::new(config.mailbox_capacity),
         seq: AtomicU64::new(0),
      })
   }

   pub const fn log(&self) -> &FrameLog {
      &self.log
   }

   fn next_id(&self, ms: u64) -> SmolStr {
      let seq = self.seq.fetch_add(1, Ordering::Relaxed);
      format_smolstr!("{ms}-{}-{seq}", process::id())
   }

   /// Creates, persists and publishes a frame.
   pub fn record(
      &self,
      direction: Direction,
      origin: Origin,
      payload: &[u8],
      comment: &str,
   ) -> FrameRecord {
      let ms = now_ms();
      let record = FrameRecord::new(self.next_id(ms), ms, direction, origin, payload, comment);
      if let Err(e) = self.log.append(record.clone()) {
         warn!("Failed to persist frame {}: {e}", record.id);
      }
      self.hub.publish(&JournalEvent::Log {
         entry: record.clone(),
      });
      record
   }

   pub fn history(&self, limit: usize) -> Vec<FrameRecord> {
      self.log.list(limit)
   }

   /// Edits a frame comment; observers see the change when it succeeds.
   pub fn set_comment(&self, id: &str, comment: &str) -> Result<bool> {
      let found = self.log.set_comment(id, comment)?;
      if found {
         self.hub.publish(&JournalEvent::Comment {
            id: id.into(),
            comment: comment.to_string(),
         });
      }
      Ok(found)
   }

   pub fn subscribe(&self) -> Subscription {
      self.hub.subscribe()
   }

   pub fn unsubscribe(&self, id: u64) {
      self.hub.unsubscribe(id);
   }
}

fn now_ms() -> u64 {
   SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_or(0, |d| d.as_millis().try_into().unwrap_or(u64::MAX))
}

#[cfg(test)]
pub(crate) mod tests {
   use tempfile::TempDir;

   use super::*;

   pub(crate) fn temp_journal() -> (Journal, TempDir) {
      let dir = TempDir::new().unwrap();
      let config = JournalConfig {
         path: dir.path().join("mitm_log.json"),
         capacity: 100,
         history_limit: 100,
         mailbox_capacity: 16,
      };
      (Journal::open(&config).unwrap(), dir)
   }

   #[test]
   fn test_record_persists_and_publishes() {
      let (journal, _dir) = temp_journal();
      let mut sub = journal.subscribe();

      let record = journal.record(Direction::AppToBoard, Origin::Injected, &[0x01, 0xff], "note");
      assert_eq!(record.hex, "01 FF");
      assert_eq!(record.comment, "note");
      assert_eq!(journal.history(10), vec![record.clone()]);
      assert_eq!(sub.try_recv(), Some(JournalEvent::Log { entry: record }));
   }

   #[test]
   fn test_ids_are_unique() {
      let (journal, _dir) = temp_journal();
      let a = journal.record(Direction::BoardToApp, Origin::Observed, b"a", "");
      let b = journal.record(Direction::BoardToApp, Origin::Observed, b"b", "");
      assert_ne!(a.id, b.id);
   }

   #[test]
   fn test_comment_edit_publishes() {
      let (journal, _dir) = temp_journal();
      let record = journal.record(Direction::BoardToApp, Origin::Observed, b"x", "");
      let mut sub = journal.subscribe();

      assert!(journal.set_comment(&record.id, "triple 20").unwrap());
      assert_eq!(
         sub.try_recv(),
         Some(JournalEvent::Comment {
            id: record.id.clone(),
            comment: "triple 20".to_string(),
         })
      );
      assert_eq!(journal.history(1)[0].comment, "triple 20");
   }

   #[tokio::test]
   async fn test_unsubscribed_observer_is_released() {
      let (journal, _dir) = temp_journal();
      let mut kept = journal.subscribe();
      let mut gone = journal.subscribe();

      journal.unsubscribe(gone.id());
      journal.record(Direction::BoardToApp, Origin::Observed, b"x", "");

      assert!(matches!(kept.try_recv(), Some(JournalEvent::Log { .. })));
      assert_eq!(gone.recv().await, None);
   }
}
