//! BlueZ central-role implementation of [`BoardTransport`].

use std::time::Duration;

use bluer::{
   Adapter, AdapterEvent, Address, Device,
   gatt::{
      WriteOp,
      remote::{Characteristic, CharacteristicWriteRequest},
   },
};
use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use log::{debug, info};
use tokio::time;
use uuid::Uuid;

use crate::{
   bluetooth::upstream::{BoardSession, BoardTransport},
   config::PeripheralConfig,
   error::{RelayError, Result},
   event::Packet,
};

/// Interval between checks for completed service discovery.
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

/// Reaches the board through a local adapter.
pub struct BluerTransport {
   adapter: Adapter,
   service_uuid: Uuid,
   notify_uuid: Uuid,
   write_uuid: Uuid,
}

impl BluerTransport {
   /// The board exposes the same UUIDs the emulated peripheral advertises.
   pub fn new(adapter: Adapter, profile: &PeripheralConfig) -> Self {
      Self {
         adapter,
         service_uuid: profile.service_uuid,
         notify_uuid: profile.notify_uuid,
         write_uuid: profile.write_uuid,
      }
   }

   async fn open(&self, address: Address) -> Result<BluerSession> {
      let device = self.adapter.device(address)?;
      if !device.is_connected().await? {
         device.connect().await?;
      }
      // Bounded by the caller's connect timeout
      while !device.is_services_resolved().await? {
         time::sleep(SERVICES_RESOLVED_POLL).await;
      }

      let mut notify = None;
      let mut write = None;
      for service in device.services().await? {
         if service.uuid().await? != self.service_uuid {
            continue;
         }
         for chrc in service.characteristics().await? {
            let uuid = chrc.uuid().await?;
            if uuid == self.notify_uuid {
               notify = Some(chrc);
            } else if uuid == self.write_uuid {
               write = Some(chrc);
            }
         }
      }

      let session = BluerSession {
         notify: notify.ok_or(RelayError::CharacteristicNotFound(self.notify_uuid))?,
         write: write.ok_or(RelayError::CharacteristicNotFound(self.write_uuid))?,
         device,
      };
      info!("Connected to board at {address}");
      Ok(session)
   }

   async fn find(&self, name: &str, window: Duration) -> Result<Option<Address>> {
      let wanted = name.to_uppercase();
      let discovery = self.adapter.discover_devices().await?;
      tokio::pin!(discovery);

      let search = async {
         while let Some(event) = discovery.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
               continue;
            };
            let Ok(device) = self.adapter.device(address) else {
               continue;
            };
            if let Ok(Some(found)) = device.name().await
               && found.to_uppercase().contains(&wanted)
            {
               debug!("Found '{found}' at {address}");
               return Some(address);
            }
         }
         None
      };

      Ok(time::timeout(window, search).await.unwrap_or(None))
   }
}

impl BoardTransport for BluerTransport {
   fn connect(&self, address: Address) -> BoxFuture<'_, Result<Box<dyn BoardSession>>> {
      Box::pin(async move {
         let session = self.open(address).await?;
         Ok(Box::new(session) as Box<dyn BoardSession>)
      })
   }

   fn scan<'a>(&'a self, name: &'a str, window: Duration) -> BoxFuture<'a, Result<Option<Address>>> {
      Box::pin(self.find(name, window))
   }
}

struct BluerSession {
   device: Device,
   notify: Characteristic,
   write: Characteristic,
}

impl BoardSession for BluerSession {
   fn notifications(&self) -> BoxFuture<'_, Result<BoxStream<'_, Packet>>> {
      Box::pin(async move {
         let stream = self.notify.notify().await?;
         Ok(stream.map(Packet::from_vec).boxed())
      })
   }

   fn write<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<()>> {
      Box::pin(async move {
         let mut request = CharacteristicWriteRequest::default();
         request.op_type = WriteOp::Command;
         self.write.write_ext(payload, &request).await?;
         Ok(())
      })
   }

   fn is_connected(&self) -> BoxFuture<'_, bool> {
      Box::pin(async move { self.device.is_connected().await.unwrap_or(false) })
   }

   fn disconnect(&self) -> BoxFuture<'_, ()> {
      Box::pin(async move {
         if let Err(e) = self.device.disconnect().await {
            debug!("Disconnect from board failed: {e}");
         }
      })
   }
}
