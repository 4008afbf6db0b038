//! GranBoard man-in-the-middle relay daemon
//!
//! Impersonates the dartboard towards the companion app while holding a
//! central-role connection to the real board, relaying every frame in both
//! directions. Frames are journaled, and operators can inject frames and
//! read the log over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{
   gatt::GattRegistry,
   peripheral::{self, Peripheral},
   transport::BluerTransport,
   upstream::UpstreamLink,
};
use dbus::{RELAY_BUS_NAME, RELAY_OBJECT_PATH, RelayService, SignalForwarder};
use event::{EventBus, EventSender, RelayEvent};
use journal::Journal;
use relay::RelayCoordinator;

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod journal;
mod relay;

use crate::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting GranBoard relay...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration, board '{}' last seen at {}",
      config.board.name, config.board.address
   );

   let journal = Arc::new(Journal::open(&config.journal)?);
   info!(
      "Frame log at {} ({} frames)",
      journal.log().path().display(),
      journal.log().len()
   );

   let session = bluer::Session::new().await?;
   let adapter = peripheral::find_adapter(&session, config.peripheral.adapter.as_deref()).await?;

   // Create event channel
   let event_bus = EventProcessor::new();
   let events: EventSender = event_bus.clone();

   let registry = GattRegistry::board_profile(&config.peripheral);
   let app_notifier = registry.characteristic(config.peripheral.notify_uuid)?;

   let transport = Arc::new(BluerTransport::new(adapter.clone(), &config.peripheral));
   let upstream = UpstreamLink::new(&config, transport, events.clone())?;
   let relay = RelayCoordinator::new(
      &config.relay,
      app_notifier,
      Arc::new(upstream.clone()),
      journal.clone(),
   );

   // Build D-Bus connection
   let service = RelayService::new(relay.clone(), upstream.clone(), config.journal.history_limit);
   let connection = connection::Builder::session()?
      .name(RELAY_BUS_NAME)?
      .serve_at(RELAY_OBJECT_PATH, service)?
      .build()
      .await?;
   info!("Relay D-Bus service started at {RELAY_BUS_NAME}");

   // Start event processor before anything can emit
   event_bus.spawn_dispatcher(&connection, relay).await?;
   let forwarder = SignalForwarder::spawn(&connection, journal.clone()).await?;

   let peripheral = Peripheral::register(&adapter, &registry, &config.peripheral, events).await?;
   upstream.start();

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down relay...");

   upstream.stop();
   upstream.join().await;
   drop(peripheral);
   forwarder.stop();

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<RelayEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<RelayEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      relay: &Arc<RelayCoordinator>,
      iface: &InterfaceRef<RelayService>,
      event: RelayEvent,
   ) -> Result<()> {
      match event {
         RelayEvent::BoardNotified(packet) => {
            relay.on_board_notify(&packet);
         },
         RelayEvent::AppWrote(packet) => {
            relay.on_app_write(&packet);
         },
         RelayEvent::AppSubscribed => {
            // The flush runs on its own task so writes keep flowing
            drop(relay.on_app_subscribed());
            iface
               .get()
               .await
               .app_subscribed_changed(iface.signal_emitter())
               .await?;
         },
         RelayEvent::AppUnsubscribed => {
            relay.on_app_unsubscribed();
            iface
               .get()
               .await
               .app_subscribed_changed(iface.signal_emitter())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(
      self: &Arc<Self>,
      connection: &Connection,
      relay: Arc<RelayCoordinator>,
   ) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, RelayService>(RELAY_OBJECT_PATH)
         .await?;
      let this = self.clone();
      tokio::spawn(async move {
         while let Some(event) = this.recv().await {
            if let Err(e) = this.dispatch(&relay, &iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: RelayEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
