/// BlueZ-backed radio, via `bluer`
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::{AdapterEvent, AdapterProperty, DeviceEvent, DeviceProperty};
use futures_util::stream::{BoxStream, SelectAll};
use futures_util::{Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::radio::{
    AdapterState, CharProperties, CharacteristicInfo, DescriptorInfo, Notifications, Peripheral,
    Radio, RadioEvent, ServiceInfo,
};
use crate::error::RadioError;

const EVENT_CAPACITY: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BluezRadio {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    events_tx: Mutex<Option<mpsc::Sender<RadioEvent>>>,
    adapter_task: Mutex<Option<JoinHandle<()>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    link_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezRadio {
    /// Open a session on the default adapter and try to power it on
    pub async fn new() -> Result<Self, RadioError> {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        // Powered state is reported through the event stream either way
        if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter: {}", e);
        }

        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(BluezRadio {
            _session: session,
            adapter,
            events_tx: Mutex::new(None),
            adapter_task: Mutex::new(None),
            scan_task: Mutex::new(None),
            link_task: Mutex::new(None),
        })
    }

    fn sender(&self) -> Result<mpsc::Sender<RadioEvent>, RadioError> {
        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RadioError::Closed)
    }

    fn device(&self, peripheral: &Peripheral) -> Result<bluer::Device, RadioError> {
        let address: bluer::Address = peripheral
            .id
            .parse()
            .map_err(|_| RadioError::InvalidAddress(peripheral.id.clone()))?;
        Ok(self.adapter.device(address)?)
    }

    async fn characteristic(
        &self,
        peripheral: &Peripheral,
        service_id: u16,
        characteristic_id: u16,
    ) -> Result<bluer::gatt::remote::Characteristic, RadioError> {
        let service = self.device(peripheral)?.service(service_id).await?;
        Ok(service.characteristic(characteristic_id).await?)
    }
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    let previous = std::mem::replace(&mut *guard, task);
    drop(guard);
    if let Some(previous) = previous {
        previous.abort();
    }
}

/// The peripheral again, once BlueZ reports its local name
///
/// # Arguments
/// * `peripheral` - Peripheral as first discovered, without a name
/// * `event` - Property change of the same device
///
/// # Returns
/// The renamed peripheral, or None for any other event
fn renamed(peripheral: &Peripheral, event: DeviceEvent) -> Option<Peripheral> {
    match event {
        DeviceEvent::PropertyChanged(DeviceProperty::Name(name)) => Some(Peripheral {
            local_name: Some(name),
            ..peripheral.clone()
        }),
        _ => None,
    }
}

/// First name change of a device, as a one-shot stream
fn name_change<S>(peripheral: Peripheral, events: S) -> BoxStream<'static, Peripheral>
where
    S: Stream<Item = DeviceEvent> + Send + 'static,
{
    events
        .filter_map(move |event| {
            let found = renamed(&peripheral, event);
            async move { found }
        })
        .take(1)
        .boxed()
}

fn adapter_state(powered: bool) -> AdapterState {
    if powered {
        AdapterState::PoweredOn
    } else {
        AdapterState::PoweredOff
    }
}

impl Drop for BluezRadio {
    fn drop(&mut self) {
        replace_task(&self.adapter_task, None);
        replace_task(&self.scan_task, None);
        replace_task(&self.link_task, None);
    }
}

#[async_trait]
impl Radio for BluezRadio {
    async fn open(&self) -> Result<mpsc::Receiver<RadioEvent>, RadioError> {
        replace_task(&self.scan_task, None);
        replace_task(&self.link_task, None);

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let powered = self.adapter.is_powered().await?;
        let _ = tx
            .send(RadioEvent::AdapterStateChanged(adapter_state(powered)))
            .await;

        let events = self.adapter.events().await?;
        let state_tx = tx.clone();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    let state = RadioEvent::AdapterStateChanged(adapter_state(powered));
                    if state_tx.send(state).await.is_err() {
                        break;
                    }
                }
            }
        });

        replace_task(&self.adapter_task, Some(task));
        *self.events_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        // Low Energy devices only, no service filter
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let discovery = self.adapter.discover_devices().await?;
        let adapter = self.adapter.clone();
        let tx = self.sender()?;
        let task = tokio::spawn(async move {
            let mut discovery = Box::pin(discovery);
            // Devices added before their scan response carried a name
            let mut unnamed: SelectAll<BoxStream<'static, Peripheral>> = SelectAll::new();
            loop {
                let peripheral = tokio::select! {
                    event = discovery.next() => {
                        let Some(event) = event else {
                            break;
                        };
                        let AdapterEvent::DeviceAdded(address) = event else {
                            continue;
                        };
                        let device = match adapter.device(address) {
                            Ok(device) => device,
                            Err(e) => {
                                debug!("Failed to look up discovered device {}: {}", address, e);
                                continue;
                            }
                        };
                        let peripheral = Peripheral {
                            id: address.to_string(),
                            local_name: device.name().await.ok().flatten(),
                            rssi: device.rssi().await.ok().flatten(),
                        };
                        if peripheral.local_name.is_none() {
                            match device.events().await {
                                Ok(events) => unnamed.push(name_change(peripheral.clone(), events)),
                                Err(e) => debug!("Failed to watch device {}: {}", address, e),
                            }
                        }
                        peripheral
                    }
                    Some(peripheral) = unnamed.next(), if !unnamed.is_empty() => {
                        debug!("Device {} is now named", peripheral.id);
                        peripheral
                    }
                };
                if tx
                    .send(RadioEvent::PeripheralDiscovered(peripheral))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        replace_task(&self.scan_task, Some(task));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        // Dropping the discovery stream ends discovery
        replace_task(&self.scan_task, None);
        Ok(())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<(), RadioError> {
        let device = self.device(peripheral)?;
        let events = device.events().await?;
        match timeout(CONNECT_TIMEOUT, device.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(RadioError::Timeout("connect")),
        }

        let tx = self.sender()?;
        let id = peripheral.id.clone();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    let _ = tx
                        .send(RadioEvent::PeripheralDisconnected {
                            id: id.clone(),
                            reason: None,
                        })
                        .await;
                    return;
                }
            }
            let _ = tx
                .send(RadioEvent::PeripheralDisconnected {
                    id,
                    reason: Some(RadioError::Closed),
                })
                .await;
        });

        replace_task(&self.link_task, Some(task));
        Ok(())
    }

    async fn cancel_connection(&self, peripheral: &Peripheral) -> Result<(), RadioError> {
        Ok(self.device(peripheral)?.disconnect().await?)
    }

    async fn set_mtu(&self, _peripheral: &Peripheral, mtu: u16) -> Result<(), RadioError> {
        // BlueZ negotiates the ATT MTU itself during connection setup
        debug!("Requested MTU {} left to BlueZ", mtu);
        Err(RadioError::Unsupported("setting the ATT MTU"))
    }

    async fn discover_services(
        &self,
        peripheral: &Peripheral,
    ) -> Result<Vec<ServiceInfo>, RadioError> {
        let mut services = Vec::new();
        for service in self.device(peripheral)?.services().await? {
            services.push(ServiceInfo {
                id: service.id(),
                uuid: service.uuid().await?.to_string(),
            });
        }
        Ok(services)
    }

    async fn discover_characteristics(
        &self,
        peripheral: &Peripheral,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, RadioError> {
        let remote = self.device(peripheral)?.service(service.id).await?;
        let mut characteristics = Vec::new();
        for characteristic in remote.characteristics().await? {
            let flags = characteristic.flags().await?;
            characteristics.push(CharacteristicInfo {
                service_id: service.id,
                id: characteristic.id(),
                uuid: characteristic.uuid().await?.to_string(),
                properties: CharProperties {
                    read: flags.read,
                    write: flags.write || flags.write_without_response,
                    notify: flags.notify,
                    indicate: flags.indicate,
                },
            });
        }
        Ok(characteristics)
    }

    async fn read_characteristic(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<Vec<u8>, RadioError> {
        let remote = self
            .characteristic(peripheral, characteristic.service_id, characteristic.id)
            .await?;
        Ok(remote.read().await?)
    }

    async fn discover_descriptors(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<Vec<DescriptorInfo>, RadioError> {
        let remote = self
            .characteristic(peripheral, characteristic.service_id, characteristic.id)
            .await?;
        let mut descriptors = Vec::new();
        for descriptor in remote.descriptors().await? {
            descriptors.push(DescriptorInfo {
                service_id: characteristic.service_id,
                characteristic_id: characteristic.id,
                id: descriptor.id(),
                uuid: descriptor.uuid().await?.to_string(),
            });
        }
        Ok(descriptors)
    }

    async fn read_descriptor(
        &self,
        peripheral: &Peripheral,
        descriptor: &DescriptorInfo,
    ) -> Result<Vec<u8>, RadioError> {
        let remote = self
            .characteristic(peripheral, descriptor.service_id, descriptor.characteristic_id)
            .await?
            .descriptor(descriptor.id)
            .await?;
        Ok(remote.read().await?)
    }

    async fn subscribe(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<Notifications, RadioError> {
        let remote = self
            .characteristic(peripheral, characteristic.service_id, characteristic.id)
            .await?;
        let values = remote.notify().await?;
        Ok(values.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unnamed_peripheral() -> Peripheral {
        Peripheral {
            id: "AA:BB:CC:DD:EE:01".to_string(),
            local_name: None,
            rssi: Some(-70),
        }
    }

    #[test]
    fn test_name_change_renames_peripheral() {
        let event = DeviceEvent::PropertyChanged(DeviceProperty::Name("Thermo".to_string()));
        let peripheral = renamed(&unnamed_peripheral(), event).unwrap();
        assert_eq!(peripheral.local_name.as_deref(), Some("Thermo"));
        assert_eq!(peripheral.id, "AA:BB:CC:DD:EE:01");
        assert_eq!(peripheral.rssi, Some(-70));
    }

    #[test]
    fn test_other_property_changes_are_ignored() {
        let event = DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-40));
        assert!(renamed(&unnamed_peripheral(), event).is_none());
    }

    #[tokio::test]
    async fn test_name_change_stream_yields_once() {
        let events = futures_util::stream::iter(vec![
            DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-40)),
            DeviceEvent::PropertyChanged(DeviceProperty::Name("Thermo".to_string())),
            DeviceEvent::PropertyChanged(DeviceProperty::Name("Renamed".to_string())),
        ]);
        let found: Vec<Peripheral> = name_change(unnamed_peripheral(), events).collect().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].local_name.as_deref(), Some("Thermo"));
    }
}
