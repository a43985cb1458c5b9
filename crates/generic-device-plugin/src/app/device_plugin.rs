use crate::inventory::{Inventory, Revision};
use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use kubelet_deviceplugin_proto::{tonic::Status, v1beta1};
use std::pin::Pin;
use tracing::{event, Level};

pub type DevicePluginStream =
  Pin<Box<dyn Stream<Item = Result<v1beta1::ListAndWatchResponse, Status>> + Send + 'static>>;

/// Serves one resource's inventory to kubelet.
#[derive(Clone)]
pub struct DevicePlugin {
  inventory: Inventory,
}

impl DevicePlugin {
  pub fn new(inventory: Inventory) -> Self {
    Self { inventory }
  }
}

#[async_trait]
impl v1beta1::DevicePlugin for DevicePlugin {
  type ListAndWatchStream = DevicePluginStream;

  /// Sends the full device list now and again after every change. The stream
  /// ends once the inventory is closed.
  async fn list_and_watch(&self) -> Result<Self::ListAndWatchStream, Status> {
    let inventory = self.inventory.clone();
    let mut revisions = inventory.subscribe();

    Ok(Box::pin(stream! {
      loop {
        let revision = *revisions.borrow_and_update();
        match revision {
          Revision::Closed => break,
          Revision::Pending => {}
          Revision::Ready(revision) => {
            if let Some(snapshot) = inventory.snapshot() {
              event!(
                target: "generic-device-plugin",
                Level::DEBUG,
                resource = %inventory.resource(),
                revision,
                devices = snapshot.len(),
                "sending device list");
              yield Ok::<_, Status>(snapshot.to_response());
            }
          }
        }

        if revisions.changed().await.is_err() {
          break;
        }
      }
    }))
  }

  async fn allocate(
    &self,
    request: v1beta1::AllocateRequest,
  ) -> Result<v1beta1::AllocateResponse, Status> {
    self.inventory.allocate(&request).map_err(|error| {
      event!(
        target: "generic-device-plugin",
        Level::WARN,
        resource = %self.inventory.resource(),
        %error,
        "rejected allocation");
      Status::from(error)
    })
  }
}
