//! Connection to the real board.
//!
//! A single supervisor task owns the central-role session. It connects,
//! subscribes to the board's notifications and pumps queued writes until
//! the link drops, then backs off and tries again. When the board cannot be
//! reached it is looked up again by name, because boards pick a new random
//! address on every power cycle.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use log::{debug, info, warn};
use parking_lot::Mutex;
use strum::Display;
use tokio::{
   select,
   sync::{Notify, mpsc},
   task::JoinHandle,
   time,
};

use crate::{
   config::{BoardConfig, Config, LinkConfig},
   error::{RelayError, Result},
   event::{EventSender, Packet, RelayEvent},
   relay::BoardWriter,
};

/// How long [`UpstreamLink::join`] waits for the supervisor to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkState {
   Disconnected,
   Connecting,
   Connected,
   Backoff,
   Shutdown,
}

/// Central-role access to the board.
pub trait BoardTransport: Send + Sync {
   /// Connects and resolves the board's GATT services.
   fn connect(&self, address: Address) -> BoxFuture<'_, Result<Box<dyn BoardSession>>>;

   /// Scans for `window` for a device whose name contains `name`,
   /// ignoring case.
   fn scan<'a>(&'a self, name: &'a str, window: Duration) -> BoxFuture<'a, Result<Option<Address>>>;
}

/// One established connection to the board.
pub trait BoardSession: Send + Sync {
   /// Subscribes to the board's notify characteristic.
   fn notifications(&self) -> BoxFuture<'_, Result<BoxStream<'_, Packet>>>;

   /// Writes without response.
   fn write<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<()>>;

   fn is_connected(&self) -> BoxFuture<'_, bool>;

   fn disconnect(&self) -> BoxFuture<'_, ()>;
}

struct LinkInner {
   board: BoardConfig,
   link: LinkConfig,
   transport: Arc<dyn BoardTransport>,
   events: EventSender,
   address: Mutex<Address>,
   state: AtomicCell<LinkState>,
   stopped: AtomicBool,
   stop_signal: Notify,
   write_tx: mpsc::UnboundedSender<Packet>,
   write_rx: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
   supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the board link. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamLink(Arc<LinkInner>);

impl UpstreamLink {
   pub fn new(
      config: &Config,
      transport: Arc<dyn BoardTransport>,
      events: EventSender,
   ) -> Result<Self> {
      let address = config.board.address()?;
      let (write_tx, write_rx) = mpsc::unbounded_channel();
      Ok(Self(Arc::new(LinkInner {
         board: config.board.clone(),
         link: config.link.clone(),
         transport,
         events,
         address: Mutex::new(address),
         state: AtomicCell::new(LinkState::Disconnected),
         stopped: AtomicBool::new(false),
         stop_signal: Notify::new(),
         write_tx,
         write_rx: Mutex::new(Some(write_rx)),
         supervisor: Mutex::new(None),
      })))
   }

   /// Spawns the supervisor. Later calls do nothing.
   pub fn start(&self) {
      let Some(write_rx) = self.0.write_rx.lock().take() else {
         debug!("Board link already started");
         return;
      };
      let inner = self.0.clone();
      let handle = tokio::spawn(async move { inner.supervise(write_rx).await });
      *self.0.supervisor.lock() = Some(handle);
   }

   /// Asks the supervisor to finish. An in-flight connect attempt runs to
   /// completion or timeout; a backoff sleep is cut short.
   pub fn stop(&self) {
      if !self.0.stopped.swap(true, Ordering::SeqCst) {
         info!("Stopping board link");
      }
      self.0.stop_signal.notify_one();
   }

   /// Waits for the supervisor to exit after [`stop`](Self::stop).
   pub async fn join(&self) {
      let Some(handle) = self.0.supervisor.lock().take() else {
         return;
      };
      match time::timeout(SHUTDOWN_GRACE, handle).await {
         Ok(Ok(())) => {},
         Ok(Err(e)) => warn!("Board link supervisor failed: {e}"),
         Err(_) => warn!("Board link supervisor did not stop in time"),
      }
   }

   /// Queues bytes for the board. Delivered in order once connected;
   /// dropped once the link is stopped.
   pub fn enqueue(&self, payload: &[u8]) {
      if self.0.is_stopped() {
         debug!("Board link stopped, dropping write {}", hex::encode(payload));
         return;
      }
      if self.0.write_tx.send(Packet::from_slice(payload)).is_err() {
         debug!("Board link gone, dropping write {}", hex::encode(payload));
      }
   }

   pub fn state(&self) -> LinkState {
      self.0.state.load()
   }

   pub fn address(&self) -> Address {
      *self.0.address.lock()
   }
}

impl BoardWriter for UpstreamLink {
   fn write(&self, payload: &[u8]) {
      self.enqueue(payload);
   }
}

impl LinkInner {
   fn is_stopped(&self) -> bool {
      self.stopped.load(Ordering::SeqCst)
   }

   fn set_state(&self, next: LinkState) {
      let prev = self.state.swap(next);
      if prev != next {
         info!("Board link: {prev} → {next}");
      }
   }

   async fn supervise(&self, mut write_rx: mpsc::UnboundedReceiver<Packet>) {
      info!("Board link supervisor starting");

      while !self.is_stopped() {
         let address = *self.address.lock();
         self.set_state(LinkState::Connecting);

         if let Err(e) = self.attempt(address, &mut write_rx).await {
            warn!("Board link to {address} failed: {e}");
            self.set_state(LinkState::Disconnected);
            if !self.is_stopped() {
               self.rediscover(address).await;
            }
         }

         if self.is_stopped() {
            break;
         }
         self.set_state(LinkState::Backoff);
         select! {
            () = time::sleep(self.link.retry_delay()) => {},
            () = self.stop_signal.notified() => {},
         }
      }

      self.set_state(LinkState::Shutdown);
      info!("Board link supervisor stopped");
   }

   /// One connect-subscribe-pump cycle. `Ok` means an established session
   /// ended; `Err` means it could not be established.
   async fn attempt(&self, address: Address, write_rx: &mut mpsc::UnboundedReceiver<Packet>) -> Result<()> {
      info!("Connecting to board at {address}");
      let session = time::timeout(self.link.connect_timeout(), self.transport.connect(address))
         .await
         .map_err(|_| RelayError::RequestTimeout)??;

      let result = self.pump(session.as_ref(), write_rx).await;
      session.disconnect().await;
      if result.is_ok() {
         self.set_state(LinkState::Disconnected);
      }
      result
   }

   async fn pump(
      &self,
      session: &dyn BoardSession,
      write_rx: &mut mpsc::UnboundedReceiver<Packet>,
   ) -> Result<()> {
      let mut notifications = session.notifications().await?;
      self.set_state(LinkState::Connected);

      loop {
         select! {
            biased;

            () = self.stop_signal.notified() => return Ok(()),

            notification = notifications.next() => match notification {
               Some(packet) => self.events.emit(RelayEvent::BoardNotified(packet)),
               None => {
                  info!("Board notification stream ended");
                  return Ok(());
               },
            },

            queued = time::timeout(self.link.write_poll(), write_rx.recv()) => match queued {
               Ok(Some(packet)) => {
                  if let Err(e) = session.write(&packet).await {
                     warn!("Write to board failed: {e}");
                     return Ok(());
                  }
                  debug!("→ board: {}", hex::encode(&packet));
               },
               Ok(None) => return Ok(()),
               Err(_) => {
                  if !session.is_connected().await {
                     info!("Board disconnected");
                     return Ok(());
                  }
               },
            },
         }
      }
   }

   async fn rediscover(&self, last: Address) {
      info!("Scanning for board '{}'", self.board.name);
      match self
         .transport
         .scan(&self.board.name, self.board.scan_window())
         .await
      {
         Ok(Some(found)) if found != last => {
            info!("Board '{}' now at {found} (was {last})", self.board.name);
            *self.address.lock() = found;
         },
         Ok(Some(_)) => debug!("Board still advertising at {last}"),
         Ok(None) => info!("Board '{}' not found, retrying {last}", self.board.name),
         Err(e) => warn!("Scan for board failed: {e}"),
      }
   }
}

#[cfg(test)]
mod tests {
   use std::{collections::VecDeque, str::FromStr};

   use futures::channel::mpsc as fmpsc;

   use super::*;
   use crate::event::tests::CollectingBus;

   const FIRST: &str = "C2:A4:CF:2B:5F:F6";
   const ROTATED: &str = "D1:11:22:33:44:55";

   struct BoardState {
      connected: AtomicBool,
      writes: Mutex<Vec<Packet>>,
      notify_rx: Mutex<Option<fmpsc::UnboundedReceiver<Packet>>>,
   }

   /// A fake board; `notify` feeds its notification stream.
   struct FakeBoard {
      state: Arc<BoardState>,
      notify: fmpsc::UnboundedSender<Packet>,
   }

   impl FakeBoard {
      fn new() -> Self {
         let (notify, rx) = fmpsc::unbounded();
         Self {
            state: Arc::new(BoardState {
               connected: AtomicBool::new(true),
               writes: Mutex::new(Vec::new()),
               notify_rx: Mutex::new(Some(rx)),
            }),
            notify,
         }
      }

      fn writes(&self) -> Vec<Vec<u8>> {
         self.state.writes.lock().iter().map(|p| p.to_vec()).collect()
      }
   }

   struct FakeSession(Arc<BoardState>);

   impl BoardSession for FakeSession {
      fn notifications(&self) -> BoxFuture<'_, Result<BoxStream<'_, Packet>>> {
         Box::pin(async move {
            let rx = self
               .0
               .notify_rx
               .lock()
               .take()
               .ok_or(RelayError::ConnectionClosed)?;
            Ok(rx.boxed())
         })
      }

      fn write<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<()>> {
         Box::pin(async move {
            if !self.0.connected.load(Ordering::SeqCst) {
               return Err(RelayError::ConnectionClosed);
            }
            self.0.writes.lock().push(Packet::from_slice(payload));
            Ok(())
         })
      }

      fn is_connected(&self) -> BoxFuture<'_, bool> {
         Box::pin(async move { self.0.connected.load(Ordering::SeqCst) })
      }

      fn disconnect(&self) -> BoxFuture<'_, ()> {
         Box::pin(async move { self.0.connected.store(false, Ordering::SeqCst) })
      }
   }

   /// Hands out queued outcomes: `None` fails the connect.
   #[derive(Default)]
   struct FakeTransport {
      outcomes: Mutex<VecDeque<Option<Arc<BoardState>>>>,
      connects: Mutex<Vec<Address>>,
      scans: Mutex<usize>,
      scan_result: Option<Address>,
   }

   impl FakeTransport {
      fn with(outcomes: Vec<Option<&FakeBoard>>, scan_result: Option<Address>) -> Arc<Self> {
         Arc::new(Self {
            outcomes: Mutex::new(
               outcomes
                  .into_iter()
                  .map(|o| o.map(|b| b.state.clone()))
                  .collect(),
            ),
            scan_result,
            ..Default::default()
         })
      }
   }

   impl BoardTransport for FakeTransport {
      fn connect(&self, address: Address) -> BoxFuture<'_, Result<Box<dyn BoardSession>>> {
         Box::pin(async move {
            self.connects.lock().push(address);
            match self.outcomes.lock().pop_front().flatten() {
               Some(state) => Ok(Box::new(FakeSession(state)) as Box<dyn BoardSession>),
               None => Err(RelayError::ConnectionClosed),
            }
         })
      }

      fn scan<'a>(&'a self, _name: &'a str, _window: Duration) -> BoxFuture<'a, Result<Option<Address>>> {
         Box::pin(async move {
            *self.scans.lock() += 1;
            Ok(self.scan_result)
         })
      }
   }

   fn config(retry_delay_ms: u64) -> Config {
      let mut config = Config::default();
      config.board.address = FIRST.into();
      config.link = LinkConfig {
         connect_timeout_sec: 1,
         retry_delay_ms,
         write_poll_ms: 10,
      };
      config
   }

   fn new_link(transport: Arc<FakeTransport>, retry_delay_ms: u64) -> (UpstreamLink, Arc<CollectingBus>) {
      let bus = Arc::new(CollectingBus::default());
      let link = UpstreamLink::new(&config(retry_delay_ms), transport, bus.clone()).unwrap();
      (link, bus)
   }

   async fn wait_for(what: &str, cond: impl Fn() -> bool) {
      for _ in 0..400 {
         if cond() {
            return;
         }
         time::sleep(Duration::from_millis(5)).await;
      }
      panic!("timed out waiting for {what}");
   }

   async fn shut_down(link: &UpstreamLink) {
      link.stop();
      link.join().await;
      assert_eq!(link.state(), LinkState::Shutdown);
   }

   #[tokio::test]
   async fn test_write_queued_during_backoff_is_sent_once_after_reconnect() {
      let board = FakeBoard::new();
      let transport = FakeTransport::with(vec![None, Some(&board)], None);
      let (link, _bus) = new_link(transport.clone(), 50);

      link.start();
      wait_for("backoff", || link.state() == LinkState::Backoff).await;
      link.enqueue(b"A");
      wait_for("first write", || board.writes().len() == 1).await;
      link.enqueue(b"B");
      wait_for("second write", || board.writes().len() == 2).await;

      time::sleep(Duration::from_millis(50)).await;
      assert_eq!(board.writes(), [b"A".to_vec(), b"B".to_vec()]);
      assert_eq!(*transport.scans.lock(), 1);
      shut_down(&link).await;
   }

   #[tokio::test]
   async fn test_rediscovery_adopts_rotated_address() {
      let rotated = Address::from_str(ROTATED).unwrap();
      let board = FakeBoard::new();
      let transport = FakeTransport::with(vec![None, Some(&board)], Some(rotated));
      let (link, _bus) = new_link(transport.clone(), 10);

      link.start();
      wait_for("connected", || link.state() == LinkState::Connected).await;

      assert_eq!(link.address(), rotated);
      assert_eq!(
         *transport.connects.lock(),
         [Address::from_str(FIRST).unwrap(), rotated]
      );
      shut_down(&link).await;
   }

   #[tokio::test]
   async fn test_notifications_forwarded_in_order() {
      let board = FakeBoard::new();
      let transport = FakeTransport::with(vec![Some(&board)], None);
      let (link, bus) = new_link(transport, 10);

      link.start();
      for token in [&b"S1@"[..], b"D3@", b"T20@"] {
         board.notify.unbounded_send(Packet::from_slice(token)).unwrap();
      }
      wait_for("notifications", || bus.events.lock().len() == 3).await;

      assert_eq!(
         *bus.events.lock(),
         [
            RelayEvent::BoardNotified(Packet::from_slice(b"S1@")),
            RelayEvent::BoardNotified(Packet::from_slice(b"D3@")),
            RelayEvent::BoardNotified(Packet::from_slice(b"T20@")),
         ]
      );
      shut_down(&link).await;
   }

   #[tokio::test]
   async fn test_lost_session_reconnects_without_scanning() {
      let first = FakeBoard::new();
      let second = FakeBoard::new();
      let transport = FakeTransport::with(vec![Some(&first), Some(&second)], None);
      let (link, _bus) = new_link(transport.clone(), 10);

      link.start();
      wait_for("connected", || link.state() == LinkState::Connected).await;
      first.notify.close_channel();

      wait_for("reconnect", || transport.connects.lock().len() == 2).await;
      wait_for("connected again", || link.state() == LinkState::Connected).await;
      assert_eq!(*transport.scans.lock(), 0);

      link.enqueue(&[0x01]);
      wait_for("write on new session", || second.writes().len() == 1).await;
      assert!(first.writes().is_empty());
      shut_down(&link).await;
   }

   #[tokio::test]
   async fn test_stop_cuts_backoff_short_and_drops_later_writes() {
      let transport = FakeTransport::with(vec![None], None);
      let (link, _bus) = new_link(transport.clone(), 60_000);

      link.start();
      wait_for("backoff", || link.state() == LinkState::Backoff).await;

      time::timeout(Duration::from_secs(2), shut_down(&link))
         .await
         .expect("stop should interrupt the backoff sleep");

      link.enqueue(b"late");
      assert_eq!(transport.connects.lock().len(), 1);
   }

   #[tokio::test]
   async fn test_start_is_idempotent() {
      let board = FakeBoard::new();
      let transport = FakeTransport::with(vec![Some(&board)], None);
      let (link, _bus) = new_link(transport.clone(), 10);

      link.start();
      link.start();
      wait_for("connected", || link.state() == LinkState::Connected).await;
      assert_eq!(transport.connects.lock().len(), 1);
      shut_down(&link).await;
   }
}
