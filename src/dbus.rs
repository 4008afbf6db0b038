use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use zbus::{Connection, interface, object_server::SignalEmitter};

use crate::{
   bluetooth::upstream::UpstreamLink,
   error::{RelayError, Result},
   journal::{Journal, JournalEvent},
   relay::RelayCoordinator,
};

pub const RELAY_BUS_NAME: &str = "org.gbmitm";
pub const RELAY_OBJECT_PATH: &str = "/org/gbmitm/relay";

pub struct RelayService {
   relay: Arc<RelayCoordinator>,
   link: UpstreamLink,
   history_limit: usize,
}

impl RelayService {
   pub const fn new(relay: Arc<RelayCoordinator>, link: UpstreamLink, history_limit: usize) -> Self {
      Self {
         relay,
         link,
         history_limit,
      }
   }
}

fn to_fdo(e: RelayError) -> zbus::fdo::Error {
   match e {
      RelayError::InvalidInjection(msg) => zbus::fdo::Error::InvalidArgs(msg),
      e => zbus::fdo::Error::Failed(e.to_string()),
   }
}

#[interface(name = "org.gbmitm.Relay")]
impl RelayService {
   /// Parses hex and writes it to the board. Returns the frame id.
   async fn send_to_board(&self, hex: String, comment: String) -> zbus::fdo::Result<String> {
      let record = self
         .relay
         .inject_hex_to_board(&hex, &comment)
         .map_err(to_fdo)?;
      info!("Injected to board: {}", record.hex);
      Ok(record.id.to_string())
   }

   /// Sends a board token such as `OUT` to the app. Returns the frame id.
   async fn send_to_app(&self, raw: String, comment: String) -> zbus::fdo::Result<String> {
      let record = self
         .relay
         .inject_token_to_app(&raw, &comment)
         .map_err(to_fdo)?;
      info!("Injected to app: {}", record.ascii);
      Ok(record.id.to_string())
   }

   /// Newest `limit` frames, oldest first, as a JSON array.
   async fn get_log(&self, limit: u32) -> zbus::fdo::Result<String> {
      let limit = match limit {
         0 => self.history_limit,
         n => n as usize,
      };
      serde_json::to_string(&self.relay.journal().history(limit))
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn set_comment(&self, id: String, comment: String) -> zbus::fdo::Result<bool> {
      self
         .relay
         .journal()
         .set_comment(&id, &comment)
         .map_err(to_fdo)
   }

   #[zbus(signal)]
   pub async fn frame_recorded(emitter: &SignalEmitter<'_>, frame: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn comment_changed(
      emitter: &SignalEmitter<'_>,
      id: &str,
      comment: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn app_subscribed(&self) -> bool {
      self.relay.is_app_subscribed()
   }

   #[zbus(property(emits_changed_signal = "false"))]
   async fn link_state(&self) -> String {
      self.link.state().to_string()
   }

   #[zbus(property(emits_changed_signal = "false"))]
   async fn board_address(&self) -> String {
      self.link.address().to_string()
   }

   #[zbus(property(emits_changed_signal = "false"))]
   async fn buffered_frames(&self) -> u32 {
      self.relay.buffered_frames().try_into().unwrap_or(u32::MAX)
   }
}

/// Re-emits journal events as D-Bus signals until stopped.
pub struct SignalForwarder {
   task: JoinHandle<()>,
   subscription: u64,
   journal: Arc<Journal>,
}

impl SignalForwarder {
   pub async fn spawn(connection: &Connection, journal: Arc<Journal>) -> Result<Self> {
      let iface = connection
         .object_server()
         .interface::<_, RelayService>(RELAY_OBJECT_PATH)
         .await?;
      let mut subscription = journal.subscribe();
      let id = subscription.id();

      let task = tokio::spawn(async move {
         while let Some(event) = subscription.recv().await {
            let emitted = match &event {
               JournalEvent::Log { entry } => match serde_json::to_string(entry) {
                  Ok(json) => iface.frame_recorded(&json).await,
                  Err(e) => {
                     warn!("Failed to encode frame {}: {e}", entry.id);
                     continue;
                  },
               },
               JournalEvent::Comment { id, comment } => iface.comment_changed(id, comment).await,
            };
            if let Err(e) = emitted {
               warn!("Error emitting journal signal: {e}");
            }
         }
      });

      Ok(Self {
         task,
         subscription: id,
         journal,
      })
   }

   /// Stops forwarding and releases the journal mailbox.
   pub fn stop(self) {
      self.task.abort();
      self.journal.unsubscribe(self.subscription);
      debug!("Journal signal forwarder {} stopped", self.subscription);
   }
}
