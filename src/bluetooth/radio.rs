/// Radio abstraction the peripheral session is written against
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::RadioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
}

/// A discovered peripheral: its address (the id) plus what it advertised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

/// Events the radio pushes to the session, in arrival order
#[derive(Debug)]
pub enum RadioEvent {
    AdapterStateChanged(AdapterState),
    PeripheralDiscovered(Peripheral),
    PeripheralDisconnected {
        id: String,
        reason: Option<RadioError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: u16,
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl fmt::Display for CharProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.read, "read"),
            (self.write, "write"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect();
        write!(f, "{}", names.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub service_id: u16,
    pub id: u16,
    pub uuid: String,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub service_id: u16,
    pub characteristic_id: u16,
    pub id: u16,
    pub uuid: String,
}

/// Values pushed by the peripheral after a successful subscribe
pub type Notifications = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Radio: Send + Sync {
    /// Start a fresh event stream. The current adapter state is the first event.
    async fn open(&self) -> Result<mpsc::Receiver<RadioEvent>, RadioError>;
    async fn start_scan(&self) -> Result<(), RadioError>;
    async fn stop_scan(&self) -> Result<(), RadioError>;
    async fn connect(&self, peripheral: &Peripheral) -> Result<(), RadioError>;
    async fn cancel_connection(&self, peripheral: &Peripheral) -> Result<(), RadioError>;
    async fn set_mtu(&self, peripheral: &Peripheral, mtu: u16) -> Result<(), RadioError>;
    async fn discover_services(&self, peripheral: &Peripheral)
        -> Result<Vec<ServiceInfo>, RadioError>;
    async fn discover_characteristics(
        &self,
        peripheral: &Peripheral,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, RadioError>;
    async fn read_characteristic(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<Vec<u8>, RadioError>;
    async fn discover_descriptors(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<Vec<DescriptorInfo>, RadioError>;
    async fn read_descriptor(
        &self,
        peripheral: &Peripheral,
        descriptor: &DescriptorInfo,
    ) -> Result<Vec<u8>, RadioError>;
    async fn subscribe(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<Notifications, RadioError>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// What the mock does when the session cancels its connection
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum OnCancel {
        /// Report the disconnect of the cancelled peripheral
        #[default]
        Disconnect,
        /// Report nothing
        Silent,
        /// Drop the event sender so the session sees a closed stream
        CloseStream,
    }

    /// Scripted radio: advertises `advertisements` when scanning starts and
    /// reports a disconnect when the session cancels the connection.
    #[derive(Default)]
    pub struct MockState {
        pub adapter_state: Option<AdapterState>,
        pub advertisements: Vec<Peripheral>,
        pub services: Vec<ServiceInfo>,
        pub characteristics: Vec<CharacteristicInfo>,
        pub descriptors: Vec<DescriptorInfo>,
        pub notifications: Vec<Vec<u8>>,
        pub fail_connect: bool,
        pub fail_mtu: bool,
        pub fail_services: bool,
        pub fail_characteristic_reads: bool,
        pub fail_descriptor_reads: Vec<u16>,
        /// Service ids whose characteristic discovery fails
        pub fail_characteristics: Vec<u16>,
        pub fail_descriptor_discovery: bool,
        pub fail_subscribe: bool,
        /// Disconnect of some other peripheral, reported right after connect
        pub foreign_disconnect: Option<String>,
        pub on_cancel: OnCancel,

        pub events_tx: Option<mpsc::Sender<RadioEvent>>,
        pub opens: Vec<Instant>,
        pub scans_started: usize,
        pub scans_stopped: usize,
        pub connects: Vec<(String, Instant)>,
        pub cancels: Vec<(String, Instant)>,
        pub characteristic_reads: Vec<u16>,
        pub characteristic_discoveries: Vec<u16>,
        pub descriptor_discoveries: Vec<u16>,
        pub descriptor_reads: Vec<u16>,
        pub subscribe_attempts: Vec<u16>,
        pub subscribed: Vec<u16>,
    }

    #[derive(Clone, Default)]
    pub struct MockRadio {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockRadio {
        pub fn new() -> Self {
            let radio = Self::default();
            radio.with(|s| s.adapter_state = Some(AdapterState::PoweredOn));
            radio
        }

        pub fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
            f(&mut self.state.lock().unwrap())
        }

        fn emit(state: &MockState, event: RadioEvent) {
            if let Some(tx) = &state.events_tx {
                let _ = tx.try_send(event);
            }
        }
    }

    pub fn peripheral(id: &str, name: Option<&str>) -> Peripheral {
        Peripheral {
            id: id.to_string(),
            local_name: name.map(str::to_string),
            rssi: Some(-60),
        }
    }

    fn step_error(what: &'static str) -> RadioError {
        RadioError::Timeout(what)
    }

    #[async_trait]
    impl Radio for MockRadio {
        async fn open(&self) -> Result<mpsc::Receiver<RadioEvent>, RadioError> {
            let (tx, rx) = mpsc::channel(64);
            self.with(|s| {
                s.opens.push(Instant::now());
                if let Some(state) = s.adapter_state {
                    let _ = tx.try_send(RadioEvent::AdapterStateChanged(state));
                }
                s.events_tx = Some(tx);
            });
            Ok(rx)
        }

        async fn start_scan(&self) -> Result<(), RadioError> {
            self.with(|s| {
                s.scans_started += 1;
                for p in s.advertisements.clone() {
                    Self::emit(s, RadioEvent::PeripheralDiscovered(p));
                }
            });
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), RadioError> {
            self.with(|s| s.scans_stopped += 1);
            Ok(())
        }

        async fn connect(&self, peripheral: &Peripheral) -> Result<(), RadioError> {
            self.with(|s| {
                s.connects.push((peripheral.id.clone(), Instant::now()));
                if s.fail_connect {
                    return Err(step_error("connect"));
                }
                if let Some(id) = s.foreign_disconnect.clone() {
                    Self::emit(s, RadioEvent::PeripheralDisconnected { id, reason: None });
                }
                Ok(())
            })
        }

        async fn cancel_connection(&self, peripheral: &Peripheral) -> Result<(), RadioError> {
            self.with(|s| {
                s.cancels.push((peripheral.id.clone(), Instant::now()));
                match s.on_cancel {
                    OnCancel::Disconnect => Self::emit(
                        s,
                        RadioEvent::PeripheralDisconnected {
                            id: peripheral.id.clone(),
                            reason: None,
                        },
                    ),
                    OnCancel::Silent => {}
                    OnCancel::CloseStream => s.events_tx = None,
                }
            });
            Ok(())
        }

        async fn set_mtu(&self, _peripheral: &Peripheral, _mtu: u16) -> Result<(), RadioError> {
            self.with(|s| if s.fail_mtu { Err(step_error("mtu")) } else { Ok(()) })
        }

        async fn discover_services(
            &self,
            _peripheral: &Peripheral,
        ) -> Result<Vec<ServiceInfo>, RadioError> {
            self.with(|s| {
                if s.fail_services {
                    Err(step_error("service discovery"))
                } else {
                    Ok(s.services.clone())
                }
            })
        }

        async fn discover_characteristics(
            &self,
            _peripheral: &Peripheral,
            service: &ServiceInfo,
        ) -> Result<Vec<CharacteristicInfo>, RadioError> {
            self.with(|s| {
                s.characteristic_discoveries.push(service.id);
                if s.fail_characteristics.contains(&service.id) {
                    return Err(step_error("characteristic discovery"));
                }
                Ok(s.characteristics
                    .iter()
                    .filter(|c| c.service_id == service.id)
                    .cloned()
                    .collect())
            })
        }

        async fn read_characteristic(
            &self,
            _peripheral: &Peripheral,
            characteristic: &CharacteristicInfo,
        ) -> Result<Vec<u8>, RadioError> {
            self.with(|s| {
                s.characteristic_reads.push(characteristic.id);
                if s.fail_characteristic_reads {
                    Err(step_error("characteristic read"))
                } else {
                    Ok(b"value".to_vec())
                }
            })
        }

        async fn discover_descriptors(
            &self,
            _peripheral: &Peripheral,
            characteristic: &CharacteristicInfo,
        ) -> Result<Vec<DescriptorInfo>, RadioError> {
            self.with(|s| {
                s.descriptor_discoveries.push(characteristic.id);
                if s.fail_descriptor_discovery {
                    return Err(step_error("descriptor discovery"));
                }
                Ok(s.descriptors
                    .iter()
                    .filter(|d| d.characteristic_id == characteristic.id)
                    .cloned()
                    .collect())
            })
        }

        async fn read_descriptor(
            &self,
            _peripheral: &Peripheral,
            descriptor: &DescriptorInfo,
        ) -> Result<Vec<u8>, RadioError> {
            self.with(|s| {
                s.descriptor_reads.push(descriptor.id);
                if s.fail_descriptor_reads.contains(&descriptor.id) {
                    Err(step_error("descriptor read"))
                } else {
                    Ok(vec![0x01, 0x00])
                }
            })
        }

        async fn subscribe(
            &self,
            _peripheral: &Peripheral,
            characteristic: &CharacteristicInfo,
        ) -> Result<Notifications, RadioError> {
            let values = self.with(|s| {
                s.subscribe_attempts.push(characteristic.id);
                if s.fail_subscribe {
                    return Err(step_error("subscribe"));
                }
                s.subscribed.push(characteristic.id);
                Ok(s.notifications.clone())
            })?;
            Ok(futures_util::stream::iter(values).boxed())
        }
    }
}
