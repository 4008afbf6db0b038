//! Persistent frame log.
//!
//! The whole retained set is rewritten on every append: serialized to a
//! sibling `.tmp` file, synced, then renamed over the log so a crash never
//! leaves a truncated file behind.

use std::{
   collections::VecDeque,
   fs::{self, File},
   io::{BufWriter, Write},
   path::{Path, PathBuf},
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{error::Result, journal::frame::FrameRecord};

pub struct FrameLog {
   path: PathBuf,
   capacity: usize,
   items: Mutex<VecDeque<FrameRecord>>,
}

impl FrameLog {
   /// Opens the log at `path`, loading whatever a previous run left there.
   pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
      let path = path.into();
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let mut items = Self::load(&path);
      while items.len() > capacity {
         items.pop_front();
      }
      debug!("Loaded {} frames from {}", items.len(), path.display());

      Ok(Self {
         path,
         capacity,
         items: Mutex::new(items),
      })
   }

   fn load(path: &Path) -> VecDeque<FrameRecord> {
      if !path.exists() {
         return VecDeque::new();
      }
      let parsed = fs::read(path)
         .map_err(|e| e.to_string())
         .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()));
      match parsed {
         Ok(items) => items,
         Err(e) => {
            warn!("Ignoring unreadable frame log {}: {e}", path.display());
            VecDeque::new()
         },
      }
   }

   fn temp_path(&self) -> PathBuf {
      let mut tmp = self.path.clone().into_os_string();
      tmp.push(".tmp");
      PathBuf::from(tmp)
   }

   fn save(&self, items: &VecDeque<FrameRecord>) -> Result<()> {
      let tmp = self.temp_path();
      {
         let mut writer = BufWriter::new(File::create(&tmp)?);
         serde_json::to_writer_pretty(&mut writer, items)?;
         writer.flush()?;
         writer.get_ref().sync_all()?;
      }
      fs::rename(&tmp, &self.path)?;
      Ok(())
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn len(&self) -> usize {
      self.items.lock().len()
   }

   /// Appends a frame, evicting the oldest ones beyond capacity, and
   /// persists the result before returning.
   pub fn append(&self, record: FrameRecord) -> Result<()> {
      let mut items = self.items.lock();
      items.push_back(record);
      while items.len() > self.capacity {
         items.pop_front();
      }
      self.save(&items)
   }

   /// Returns the most recent `limit` frames, oldest first.
   pub fn list(&self, limit: usize) -> Vec<FrameRecord> {
      let items = self.items.lock();
      let skip = items.len().saturating_sub(limit);
      items.iter().skip(skip).cloned().collect()
   }

   /// Replaces the comment of frame `id`. Returns whether it was found.
   pub fn set_comment(&self, id: &str, comment: &str) -> Result<bool> {
      let mut items = self.items.lock();
      let Some(item) = items.iter_mut().find(|it| it.id == id) else {
         return Ok(false);
      };
      item.comment = comment.to_string();
      self.save(&items)?;
      Ok(true)
   }
}

#[cfg(test)]
mod tests {
   use smol_str::ToSmolStr;
   use tempfile::TempDir;

   use super::*;
   use crate::journal::frame::{Direction, Origin};

   fn record(n: u8) -> FrameRecord {
      FrameRecord::new(
         n.to_smolstr(),
         u64::from(n),
         Direction::BoardToApp,
         Origin::Observed,
         &[n],
         "",
      )
   }

   #[test]
   fn test_append_caps_and_persists() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("log.json");
      let log = FrameLog::open(&path, 3)?;

      for n in 1..=5 {
         log.append(record(n))?;
      }
      assert_eq!(log.len(), 3);
      let ids: Vec<_> = log.list(10).into_iter().map(|r| r.id).collect();
      assert_eq!(ids, ["3", "4", "5"]);

      // No leftover temp file, and the log reloads identically
      assert!(!dir.path().join("log.json.tmp").exists());
      let reopened = FrameLog::open(&path, 3)?;
      assert_eq!(reopened.list(10), log.list(10));
      Ok(())
   }

   #[test]
   fn test_list_limit_returns_newest() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let log = FrameLog::open(dir.path().join("log.json"), 10)?;
      for n in 1..=4 {
         log.append(record(n))?;
      }
      let ids: Vec<_> = log.list(2).into_iter().map(|r| r.id).collect();
      assert_eq!(ids, ["3", "4"]);
      Ok(())
   }

   #[test]
   fn test_set_comment_persists() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("log.json");
      let log = FrameLog::open(&path, 10)?;
      log.append(record(1))?;

      assert!(log.set_comment("1", "bullseye")?);
      assert!(!log.set_comment("missing", "nothing")?);

      let reopened = FrameLog::open(&path, 10)?;
      assert_eq!(reopened.list(1)[0].comment, "bullseye");
      Ok(())
   }

   #[test]
   fn test_corrupt_log_starts_empty() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("log.json");
      fs::write(&path, "{ not a list")?;
      let log = FrameLog::open(&path, 10)?;
      assert_eq!(log.len(), 0);
      Ok(())
   }

   #[test]
   fn test_reopen_with_smaller_capacity_trims_oldest() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("log.json");
      let log = FrameLog::open(&path, 10)?;
      for n in 1..=5 {
         log.append(record(n))?;
      }
      let reopened = FrameLog::open(&path, 2)?;
      let ids: Vec<_> = reopened.list(10).into_iter().map(|r| r.id).collect();
      assert_eq!(ids, ["4", "5"]);
      Ok(())
   }
}
