//! Local GATT tree of the emulated board.
//!
//! Services and characteristics are plain data held in a registry. The
//! peripheral turns the whole registry into one BlueZ application so the
//! stack can enumerate it in a single query.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use log::debug;
use parking_lot::Mutex;
use smallvec::SmallVec;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
   config::PeripheralConfig,
   error::{RelayError, Result},
   event::Packet,
   relay::AppNotifier,
};

/// GATT characteristic capability, spelled the way BlueZ spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum CharFlag {
   Read,
   Write,
   WriteWithoutResponse,
   Notify,
}

pub type CharFlags = SmallVec<[CharFlag; 4]>;

#[derive(Debug)]
struct NotifySession {
   id: u64,
   tx: mpsc::UnboundedSender<Packet>,
}

/// A characteristic of the emulated board with its current value and
/// notification session.
#[derive(Debug)]
pub struct LocalCharacteristic {
   uuid: Uuid,
   flags: CharFlags,
   value: Mutex<Packet>,
   session: Mutex<Option<NotifySession>>,
   next_session: AtomicU64,
}

impl LocalCharacteristic {
   pub fn new(uuid: Uuid, flags: &[CharFlag]) -> Arc<Self> {
      Arc::new(Self {
         uuid,
         flags: CharFlags::from_slice(flags),
         value: Mutex::new(Packet::new()),
         session: Mutex::new(None),
         next_session: AtomicU64::new(1),
      })
   }

   pub const fn uuid(&self) -> Uuid {
      self.uuid
   }

   pub fn flags(&self) -> &[CharFlag] {
      &self.flags
   }

   pub fn has_flag(&self, flag: CharFlag) -> bool {
      self.flags.contains(&flag)
   }

   /// Last value written by the app or notified to it. Never fails.
   pub fn read(&self) -> Packet {
      self.value.lock().clone()
   }

   /// Stores a value written by the app.
   pub fn write(&self, data: &[u8]) -> Packet {
      let packet = Packet::from_slice(data);
      *self.value.lock() = packet.clone();
      packet
   }

   #[cfg(test)]
   pub fn is_subscribed(&self) -> bool {
      self.session.lock().is_some()
   }

   /// Opens a notification session, replacing any stale one. Values passed
   /// to [`send_notify`](Self::send_notify) arrive on the returned receiver.
   pub fn start_notify(&self) -> (u64, mpsc::UnboundedReceiver<Packet>) {
      let id = self.next_session.fetch_add(1, Ordering::Relaxed);
      let (tx, rx) = mpsc::unbounded_channel();
      if self.session.lock().replace(NotifySession { id, tx }).is_some() {
         debug!("Notify session on {} replaced", self.uuid);
      }
      (id, rx)
   }

   /// Closes session `id`. A newer session is left alone. Returns whether
   /// the session was still current.
   pub fn stop_notify(&self, id: u64) -> bool {
      let mut session = self.session.lock();
      if session.as_ref().is_some_and(|s| s.id == id) {
         *session = None;
         true
      } else {
         false
      }
   }
}

impl AppNotifier for LocalCharacteristic {
   /// Sets the value and hands it to the notify session, which emits
   /// exactly one value-changed notification for it.
   fn send_notify(&self, payload: &[u8]) -> Result<()> {
      let session = self.session.lock();
      let Some(session) = session.as_ref() else {
         debug!(
            "No subscriber on {}, dropping notification {}",
            self.uuid,
            hex::encode(payload)
         );
         return Ok(());
      };

      let packet = Packet::from_slice(payload);
      *self.value.lock() = packet.clone();
      session
         .tx
         .send(packet)
         .map_err(|_| RelayError::NotifySessionClosed)
   }
}

#[derive(Debug)]
pub struct LocalService {
   pub uuid: Uuid,
   pub primary: bool,
   pub characteristics: Vec<Arc<LocalCharacteristic>>,
}

/// Summary of one exported object, as listed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
   pub path: String,
   pub uuid: Uuid,
   pub detail: String,
}

/// The full service tree of the emulated board.
#[derive(Debug)]
pub struct GattRegistry {
   services: Vec<LocalService>,
}

impl GattRegistry {
   pub const fn new(services: Vec<LocalService>) -> Self {
      Self { services }
   }

   /// The board's vendor service: one notify and one write characteristic.
   pub fn board_profile(config: &PeripheralConfig) -> Self {
      Self::new(vec![LocalService {
         uuid: config.service_uuid,
         primary: true,
         characteristics: vec![
            LocalCharacteristic::new(config.notify_uuid, &[CharFlag::Notify]),
            LocalCharacteristic::new(
               config.write_uuid,
               &[CharFlag::Write, CharFlag::WriteWithoutResponse],
            ),
         ],
      }])
   }

   pub fn services(&self) -> &[LocalService] {
      &self.services
   }

   pub fn characteristic(&self, uuid: Uuid) -> Result<Arc<LocalCharacteristic>> {
      self
         .services
         .iter()
         .flat_map(|s| &s.characteristics)
         .find(|c| c.uuid() == uuid)
         .cloned()
         .ok_or(RelayError::CharacteristicNotFound(uuid))
   }

   /// Lists every object of the tree in registration order.
   pub fn describe(&self) -> Vec<ObjectSummary> {
      let mut out = Vec::new();
      for (si, service) in self.services.iter().enumerate() {
         out.push(ObjectSummary {
            path: format!("service{si}"),
            uuid: service.uuid,
            detail: if service.primary { "primary" } else { "secondary" }.to_string(),
         });
         for (ci, chrc) in service.characteristics.iter().enumerate() {
            let flags: Vec<&str> = chrc.flags().iter().map(AsRef::as_ref).collect();
            out.push(ObjectSummary {
               path: format!("service{si}/char{ci}"),
               uuid: chrc.uuid(),
               detail: flags.join(","),
            });
         }
      }
      out
   }
}
