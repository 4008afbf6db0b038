//! The emulated board as seen by the app.
//!
//! Exports the [`GattRegistry`] as a BlueZ GATT application and advertises
//! it. Both registrations live as long as the returned [`Peripheral`].

use std::{sync::Arc, time::Duration};

use bluer::{
   Adapter, Session,
   adv::{Advertisement, AdvertisementHandle},
   gatt::local::{
      Application, ApplicationHandle, Characteristic, CharacteristicNotifier,
      CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
      CharacteristicWrite, CharacteristicWriteMethod, Service,
   },
};
use log::{debug, info, warn};
use tokio::time;

use crate::{
   bluetooth::gatt::{CharFlag, GattRegistry, LocalCharacteristic},
   config::PeripheralConfig,
   error::{RelayError, Result},
   event::{EventSender, Packet, RelayEvent},
};

/// How often an idle notify session checks whether the app went away.
const NOTIFY_STOP_POLL: Duration = Duration::from_millis(500);

/// Appearance advertised by the board (unknown / generic).
const BOARD_APPEARANCE: u16 = 0x0000;

/// Picks the adapter to serve on: the configured one, otherwise the first
/// adapter with an LE advertising manager. The adapter is powered on.
pub async fn find_adapter(session: &Session, preferred: Option<&str>) -> Result<Adapter> {
   let names = match preferred {
      Some(name) => vec![name.to_string()],
      None => session.adapter_names().await?,
   };

   for name in names {
      let adapter = match session.adapter(&name) {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("Skipping adapter {name}: {e}");
            continue;
         },
      };
      match adapter.supported_advertising_instances().await {
         Ok(instances) => {
            debug!("Adapter {name} supports {instances} advertising instances");
         },
         Err(e) => {
            warn!("Adapter {name} cannot advertise: {e}");
            continue;
         },
      }
      if !adapter.is_powered().await.unwrap_or(false) {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {name}");
      }
      info!("Using adapter {name} ({})", adapter.address().await?);
      return Ok(adapter);
   }

   Err(RelayError::AdapterNotFound)
}

/// Live registration of the emulated board. Dropping it unregisters the
/// advertisement and the GATT application.
pub struct Peripheral {
   _application: ApplicationHandle,
   _advertisement: AdvertisementHandle,
}

impl Peripheral {
   /// Registers the application, then starts advertising. Either failure
   /// leaves the relay without an identity and is returned to the caller.
   pub async fn register(
      adapter: &Adapter,
      registry: &GattRegistry,
      config: &PeripheralConfig,
      events: EventSender,
   ) -> Result<Self> {
      for object in registry.describe() {
         debug!("GATT {} {} [{}]", object.path, object.uuid, object.detail);
      }

      let application = adapter
         .serve_gatt_application(build_application(registry, &events))
         .await?;
      info!("GATT application registered");

      let advertisement = adapter.advertise(build_advertisement(config)).await?;
      info!(
         "Advertising as '{}' with service {}",
         config.local_name, config.service_uuid
      );

      Ok(Self {
         _application: application,
         _advertisement: advertisement,
      })
   }
}

fn build_advertisement(config: &PeripheralConfig) -> Advertisement {
   Advertisement {
      advertisement_type: bluer::adv::Type::Peripheral,
      service_uuids: [config.service_uuid].into_iter().collect(),
      local_name: Some(config.local_name.clone()),
      appearance: Some(BOARD_APPEARANCE),
      discoverable: Some(true),
      ..Default::default()
   }
}

fn build_application(registry: &GattRegistry, events: &EventSender) -> Application {
   Application {
      services: registry
         .services()
         .iter()
         .map(|service| Service {
            uuid: service.uuid,
            primary: service.primary,
            characteristics: service
               .characteristics
               .iter()
               .map(|chrc| build_characteristic(chrc, events))
               .collect(),
            ..Default::default()
         })
         .collect(),
      ..Default::default()
   }
}

fn build_characteristic(chrc: &Arc<LocalCharacteristic>, events: &EventSender) -> Characteristic {
   // Reads are always answered, the app queries values it never reads
   let read = {
      let chrc = chrc.clone();
      CharacteristicRead {
         read: chrc.has_flag(CharFlag::Read),
         fun: Box::new(move |_req| {
            let value = read_reply(&chrc);
            Box::pin(async move { Ok(value) })
         }),
         ..Default::default()
      }
   };

   let writable = chrc.has_flag(CharFlag::Write) || chrc.has_flag(CharFlag::WriteWithoutResponse);
   let write = writable.then(|| {
      let chrc = chrc.clone();
      let events = events.clone();
      CharacteristicWrite {
         write: chrc.has_flag(CharFlag::Write),
         write_without_response: chrc.has_flag(CharFlag::WriteWithoutResponse),
         method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
            let packet = chrc.write(&value);
            events.emit(RelayEvent::AppWrote(packet));
            Box::pin(async { Ok(()) })
         })),
         ..Default::default()
      }
   });

   let notify = chrc.has_flag(CharFlag::Notify).then(|| {
      let chrc = chrc.clone();
      let events = events.clone();
      CharacteristicNotify {
         notify: true,
         method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
            Box::pin(run_notify_session(chrc.clone(), events.clone(), notifier))
         })),
         ..Default::default()
      }
   });

   Characteristic {
      uuid: chrc.uuid(),
      read: Some(read),
      write,
      notify,
      ..Default::default()
   }
}

/// Answer to a ReadValue: the last value written or notified, empty before
/// either happened.
fn read_reply(chrc: &LocalCharacteristic) -> Vec<u8> {
   chrc.read().to_vec()
}

/// Lives from StartNotify to StopNotify. Every queued value becomes exactly
/// one notification.
async fn run_notify_session(
   chrc: Arc<LocalCharacteristic>,
   events: EventSender,
   mut notifier: CharacteristicNotifier,
) {
   let (session, mut rx) = chrc.start_notify();
   debug!("Notify session {session} started on {}", chrc.uuid());
   events.emit(RelayEvent::AppSubscribed);

   while !notifier.is_stopped() {
      match time::timeout(NOTIFY_STOP_POLL, rx.recv()).await {
         Ok(Some(packet)) => {
            if let Err(e) = notifier.notify(Packet::into_vec(packet)).await {
               warn!("Notification to app failed: {e}");
               break;
            }
         },
         // Replaced by a newer session
         Ok(None) => break,
         Err(_) => {},
      }
   }

   debug!("Notify session {session} ended on {}", chrc.uuid());
   if chrc.stop_notify(session) {
      events.emit(RelayEvent::AppUnsubscribed);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      config::{BOARD_NOTIFY_UUID, BOARD_SERVICE_UUID, BOARD_WRITE_UUID},
      event::tests::CollectingBus,
      relay::AppNotifier,
   };

   fn board_application() -> Application {
      let registry = GattRegistry::board_profile(&PeripheralConfig::default());
      let events: EventSender = Arc::new(CollectingBus::default());
      build_application(&registry, &events)
   }

   #[test]
   fn test_application_matches_board_layout() {
      let app = board_application();
      assert_eq!(app.services.len(), 1);

      let service = &app.services[0];
      assert_eq!(service.uuid, BOARD_SERVICE_UUID);
      assert!(service.primary);
      assert_eq!(service.characteristics.len(), 2);

      let notify = &service.characteristics[0];
      assert_eq!(notify.uuid, BOARD_NOTIFY_UUID);
      assert!(notify.notify.as_ref().is_some_and(|n| n.notify));
      assert!(notify.write.is_none());

      let write = &service.characteristics[1];
      assert_eq!(write.uuid, BOARD_WRITE_UUID);
      let flags = write.write.as_ref().unwrap();
      assert!(flags.write);
      assert!(flags.write_without_response);
      assert!(write.notify.is_none());
   }

   #[test]
   fn test_reads_answered_without_read_flag() {
      let app = board_application();
      for chrc in &app.services[0].characteristics {
         let read = chrc.read.as_ref().unwrap();
         assert!(!read.read);
      }
   }

   #[test]
   fn test_read_reply_tracks_last_value() {
      let registry = GattRegistry::board_profile(&PeripheralConfig::default());
      let notify = registry.characteristic(BOARD_NOTIFY_UUID).unwrap();
      let write = registry.characteristic(BOARD_WRITE_UUID).unwrap();
      assert!(read_reply(&notify).is_empty());
      assert!(read_reply(&write).is_empty());

      write.write(&[0xaa, 0x00, 0x40]);
      assert_eq!(read_reply(&write), [0xaa, 0x00, 0x40]);

      let (_session, mut rx) = notify.start_notify();
      notify.send_notify(b"S1@").unwrap();
      assert_eq!(rx.try_recv().unwrap().as_slice(), b"S1@");
      assert_eq!(read_reply(&notify), b"S1@");
      assert_eq!(read_reply(&write), [0xaa, 0x00, 0x40]);
   }

   #[test]
   fn test_advertisement_identity() {
      let config = PeripheralConfig::default();
      let adv = build_advertisement(&config);
      assert_eq!(adv.local_name.as_deref(), Some("GRANBOARD"));
      assert_eq!(adv.appearance, Some(0));
      assert_eq!(adv.service_uuids.len(), 1);
      assert!(adv.service_uuids.contains(&BOARD_SERVICE_UUID));
   }
}
