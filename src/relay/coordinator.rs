//! Relay state machine coupling the emulated board and the real board.
//!
//! Board notifications are forwarded to the app once it has subscribed and
//! buffered before that. When the app subscribes the buffer is replayed in
//! arrival order with a short pause between frames, since phones drop
//! notification bursts. App writes go straight to the upstream queue.

use std::{
   collections::VecDeque,
   sync::Arc,
   time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};

use crate::{
   config::RelayConfig,
   error::{RelayError, Result},
   event::Packet,
   journal::{Direction, FrameRecord, Journal, Origin},
   relay::{AppNotifier, BoardWriter, buffer::NotifyBuffer, inject},
};

#[derive(Debug)]
struct RelayState {
   buffer: NotifyBuffer,
   subscribed: bool,
   /// A flush owns delivery to the app; new frames queue behind it.
   replaying: bool,
}

impl RelayState {
   /// Claims the replay for a new flush if there is anything to replay
   /// and no flush holds it already.
   fn claim_replay(&mut self) -> bool {
      if self.replaying || !self.subscribed || self.buffer.is_empty() {
         return false;
      }
      self.replaying = true;
      true
   }
}

pub struct RelayCoordinator {
   state: Mutex<RelayState>,
   /// Serializes the app direction so log order matches delivery order.
   app_lock: Mutex<()>,
   /// Serializes the board direction so log order matches queue order.
   board_lock: Mutex<()>,
   app: Arc<dyn AppNotifier>,
   board: Arc<dyn BoardWriter>,
   journal: Arc<Journal>,
   pacing: Duration,
}

impl RelayCoordinator {
   pub fn new(
      config: &RelayConfig,
      app: Arc<dyn AppNotifier>,
      board: Arc<dyn BoardWriter>,
      journal: Arc<Journal>,
   ) -> Arc<Self> {
      Arc::new(Self {
         state: Mutex::new(RelayState {
            buffer: NotifyBuffer::new(config.buffer_capacity),
            subscribed: false,
            replaying: false,
         }),
         app_lock: Mutex::new(()),
         board_lock: Mutex::new(()),
         app,
         board,
         journal,
         pacing: config.replay_pacing(),
      })
   }

   pub fn is_app_subscribed(&self) -> bool {
      self.state.lock().subscribed
   }

   pub fn buffered_frames(&self) -> usize {
      self.state.lock().buffer.len()
   }

   pub const fn journal(&self) -> &Arc<Journal> {
      &self.journal
   }

   // === Board → App ===

   /// Handles a notification from the real board.
   pub fn on_board_notify(&self, payload: &[u8]) {
      if let Err(e) = self.deliver_to_app(payload, Origin::Observed, "") {
         warn!("Failed to notify app: {e}");
      }
   }

   fn deliver_to_app(&self, payload: &[u8], origin: Origin, comment: &str) -> Result<FrameRecord> {
      let _order = self.app_lock.lock();
      let record = self
         .journal
         .record(Direction::BoardToApp, origin, payload, comment);
      debug!("board → app [{origin}]: {} {}", record.hex, record.ascii);

      let mut state = self.state.lock();
      if state.subscribed && !state.replaying {
         self.app.send_notify(payload)?;
      } else if let Some(evicted) = state.buffer.push(Packet::from_slice(payload)) {
         debug!(
            "Notify buffer full ({}), dropped oldest frame {}",
            state.buffer.capacity(),
            hex::encode(&evicted)
         );
      }
      Ok(record)
   }

   /// The app enabled notifications; replays whatever was buffered.
   ///
   /// The replay is claimed before returning, so frames relayed after this
   /// call queue behind the buffered ones. Resolves to the number of frames
   /// replayed, or 0 when a running flush already owns the buffer.
   pub fn on_app_subscribed(self: &Arc<Self>) -> JoinHandle<usize> {
      let claimed = {
         let mut state = self.state.lock();
         state.subscribed = true;
         info!(
            "App subscribed to notifications ({} buffered)",
            state.buffer.len()
         );
         state.claim_replay()
      };
      let this = self.clone();
      tokio::spawn(async move {
         if claimed {
            this.flush_buffer().await
         } else {
            0
         }
      })
   }

   /// The app disabled notifications. The buffer is kept and keeps filling.
   pub fn on_app_unsubscribed(&self) {
      let mut state = self.state.lock();
      if state.subscribed {
         info!("App unsubscribed from notifications");
      }
      state.subscribed = false;
   }

   /// Replays buffered notifications to the app in arrival order.
   ///
   /// Runs only while holding the replay claim, and gives it up in the same
   /// critical section that finds nothing left to send. Each round empties
   /// the buffer before delivery starts, so frames arriving meanwhile are
   /// replayed in a later round. A send error drops the rest of its round.
   /// Returns how many frames were delivered.
   async fn flush_buffer(&self) -> usize {
      let mut delivered = 0;

      loop {
         let batch = {
            let mut state = self.state.lock();
            if !state.subscribed || state.buffer.is_empty() {
               state.replaying = false;
               return delivered;
            }
            state.buffer.take()
         };

         info!("Replaying {} buffered frames to app", batch.len());
         match self.replay(batch).await {
            Ok(n) => delivered += n,
            Err(n) => return delivered + n,
         }
      }
   }

   /// Sends one round. `Err` carries the delivered count when the app
   /// unsubscribed midway; the claim is released by then.
   async fn replay(&self, mut batch: VecDeque<Packet>) -> std::result::Result<usize, usize> {
      let mut delivered = 0;
      while let Some(packet) = batch.pop_front() {
         {
            let mut state = self.state.lock();
            if !state.subscribed {
               batch.push_front(packet);
               let remaining = batch.len();
               let evicted = state.buffer.restore_front(batch);
               state.replaying = false;
               info!(
                  "App unsubscribed mid-replay, {remaining} frames returned to buffer ({evicted} evicted)"
               );
               return Err(delivered);
            }
            if let Err(e) = self.app.send_notify(&packet) {
               warn!(
                  "Replay failed: {e}; {} remaining frames of this round dropped",
                  batch.len()
               );
               return Ok(delivered);
            }
         }
         delivered += 1;

         if !batch.is_empty() && !self.pacing.is_zero() {
            time::sleep(self.pacing).await;
         }
      }
      Ok(delivered)
   }

   // === App → Board ===

   /// Handles a write from the app.
   pub fn on_app_write(&self, payload: &[u8]) {
      self.deliver_to_board(payload, Origin::Observed, "");
   }

   fn deliver_to_board(&self, payload: &[u8], origin: Origin, comment: &str) -> FrameRecord {
      let _order = self.board_lock.lock();
      let record = self
         .journal
         .record(Direction::AppToBoard, origin, payload, comment);
      debug!("app → board [{origin}]: {} {}", record.hex, record.ascii);
      self.board.write(payload);
      record
   }

   // === Manual injection ===

   /// Sends operator-supplied bytes to the board as if the app wrote them.
   pub fn inject_to_board(&self, payload: &[u8], note: &str) -> Result<FrameRecord> {
      if payload.is_empty() {
         return Err(RelayError::InvalidInjection("empty payload".into()));
      }
      Ok(self.deliver_to_board(payload, Origin::Injected, note))
   }

   /// Sends operator-supplied bytes to the app as if the board notified
   /// them. Buffered like any other notification while unsubscribed.
   pub fn inject_to_app(&self, payload: &[u8], note: &str) -> Result<FrameRecord> {
      if payload.is_empty() {
         return Err(RelayError::InvalidInjection("empty payload".into()));
      }
      self.deliver_to_app(payload, Origin::Injected, note)
   }

   /// Parses hex text and injects it toward the board.
   pub fn inject_hex_to_board(&self, text: &str, note: &str) -> Result<FrameRecord> {
      let payload = inject::parse_hex(text)?;
      self.inject_to_board(&payload, note)
   }

   /// Normalizes a board token (`OUT` → `OUT@`) and injects it toward the app.
   pub fn inject_token_to_app(&self, text: &str, note: &str) -> Result<FrameRecord> {
      let payload = inject::encode_token(text)?;
      self.inject_to_app(&payload, note)
   }
}
