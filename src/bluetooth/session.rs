/// Peripheral discovery/connection state machine and its retry loop
///
/// One cycle opens the radio's event stream and reacts to events until the
/// connected peripheral goes away:
///
/// - adapter powered on: scan; any other state: stop scanning
/// - peripheral discovered: if it passes the filter, stop scanning and connect
/// - connected: enumerate services, characteristics and descriptors, arm
///   notifications, hold the link for the dwell window, then cancel it
/// - disconnected: the cycle is complete
///
/// [`PeripheralSession::run`] repeats cycles forever with a fixed cooldown.
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::radio::{
    AdapterState, CharacteristicInfo, Notifications, Peripheral, Radio, RadioEvent,
};
use crate::codec;
use crate::error::RadioError;
use crate::models::Reading;
use crate::mqtt::{Publisher, QoS};
use crate::utils::{format_datetime, hex_bytes, render_bytes, spaced_hex};

pub const TEMPERATURE_PROPERTY: &str = "temp-data";
const MAX_MTU: u16 = 500;
const STATE_CAPACITY: usize = 32;

/// Where the current cycle is. Every cycle starts at `PoweredOff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    PoweredOff,
    Scanning,
    Discovered,
    Connecting,
    Connected,
    NotifyArmed,
    Disconnected,
}

/// Which peripheral to accept. Empty filters are ignored; with none set the
/// first peripheral discovered wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeripheralFilter {
    name: Option<String>,
    mac_address: Option<String>,
}

impl PeripheralFilter {
    pub fn new(name: &str, mac_address: &str) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        PeripheralFilter {
            name: non_empty(name),
            mac_address: non_empty(mac_address),
        }
    }

    pub fn matches(&self, peripheral: &Peripheral) -> bool {
        if let Some(name) = &self.name {
            if peripheral.local_name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(mac) = &self.mac_address {
            if !peripheral.id.eq_ignore_ascii_case(mac) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub topic: String,
    pub qos: QoS,
    pub dwell: Duration,
    pub cooldown: Duration,
}

/// Turns notified bytes into published readings
#[derive(Clone)]
pub struct NotificationHandler {
    publisher: Arc<dyn Publisher>,
    property_name: String,
    topic: String,
    qos: QoS,
}

impl NotificationHandler {
    pub fn new(publisher: Arc<dyn Publisher>, property_name: &str, topic: &str, qos: QoS) -> Self {
        NotificationHandler {
            publisher,
            property_name: property_name.to_string(),
            topic: topic.to_string(),
            qos,
        }
    }

    /// Publish one notification. Failures are logged and the value dropped.
    pub async fn handle(&self, value: &[u8]) {
        debug!("notified: {} | {}", spaced_hex(value), render_bytes(value));

        let reading = Reading::new(&self.property_name, render_bytes(value));
        let payload = match codec::encode(&reading) {
            Ok(payload) => payload,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        if let Err(e) = self.publisher.publish(&self.topic, self.qos, payload).await {
            error!("{}", e);
        }
    }

    fn spawn(&self, mut values: Notifications) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            while let Some(value) = values.next().await {
                handler.handle(&value).await;
            }
        })
    }
}

/// Per-cycle state, owned by the dispatch loop
struct Cycle {
    state: SessionState,
    states: broadcast::Sender<SessionState>,
    peripheral: Option<Peripheral>,
    notifiers: Vec<JoinHandle<()>>,
}

impl Cycle {
    fn new(states: broadcast::Sender<SessionState>) -> Self {
        let state = SessionState::PoweredOff;
        // No subscribers is fine
        let _ = states.send(state);
        Cycle {
            state,
            states,
            peripheral: None,
            notifiers: Vec::new(),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session state {:?} -> {:?}", self.state, next);
            self.state = next;
            let _ = self.states.send(next);
        }
    }

    fn stop_notifiers(&mut self) {
        for notifier in self.notifiers.drain(..) {
            notifier.abort();
        }
    }
}

impl Drop for Cycle {
    fn drop(&mut self) {
        self.stop_notifiers();
    }
}

pub struct PeripheralSession<R: Radio> {
    radio: Arc<R>,
    filter: PeripheralFilter,
    handler: NotificationHandler,
    options: SessionOptions,
    states: broadcast::Sender<SessionState>,
}

impl<R: Radio> PeripheralSession<R> {
    /// Create a session that publishes notified values through `publisher`
    ///
    /// # Arguments
    /// * `radio` - Radio the session scans and connects with
    /// * `publisher` - Outbound bus for readings
    /// * `filter` - Which peripheral to accept
    /// * `options` - Topic, QoS, dwell and cooldown
    ///
    /// # Returns
    /// An idle session; nothing happens until `run` or `run_cycle`
    pub fn new(
        radio: Arc<R>,
        publisher: Arc<dyn Publisher>,
        filter: PeripheralFilter,
        options: SessionOptions,
    ) -> Self {
        let handler =
            NotificationHandler::new(publisher, TEMPERATURE_PROPERTY, &options.topic, options.qos);
        let (states, _) = broadcast::channel(STATE_CAPACITY);
        PeripheralSession {
            radio,
            filter,
            handler,
            options,
            states,
        }
    }

    /// Follow the session's state
    ///
    /// # Returns
    /// Receiver of every state change from now on, in order. A new cycle
    /// announces itself with `PoweredOff`.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.states.subscribe()
    }

    /// Run discover -> connect -> enumerate -> disconnect cycles forever
    ///
    /// A failed cycle is logged; either way the next one starts after the
    /// cooldown.
    pub async fn run(&self) {
        loop {
            info!(
                "Starting scan cycle at: {}",
                format_datetime(&OffsetDateTime::now_utc())
            );

            if let Err(e) = self.run_cycle().await {
                error!("Scan cycle failed: {}", e);
            }

            info!("Done");
            info!("Sleep for {} seconds", self.options.cooldown.as_secs());
            sleep(self.options.cooldown).await;
        }
    }

    /// Run a single cycle
    ///
    /// # Returns
    /// Ok once the accepted peripheral has disconnected or could not be
    /// connected, `RadioError::Closed` if the radio's event stream ends first
    pub async fn run_cycle(&self) -> Result<(), RadioError> {
        let mut events = self.radio.open().await?;
        let mut cycle = Cycle::new(self.states.clone());

        while let Some(event) = events.recv().await {
            if self.dispatch(&mut cycle, event).await.is_break() {
                return Ok(());
            }
        }

        Err(RadioError::Closed)
    }

    async fn dispatch(&self, cycle: &mut Cycle, event: RadioEvent) -> ControlFlow<()> {
        match event {
            RadioEvent::AdapterStateChanged(state) => {
                self.on_adapter_state_changed(cycle, state).await;
                ControlFlow::Continue(())
            }
            RadioEvent::PeripheralDiscovered(peripheral) => {
                self.on_peripheral_discovered(cycle, peripheral).await
            }
            RadioEvent::PeripheralDisconnected { id, reason } => {
                self.on_peripheral_disconnected(cycle, &id, reason)
            }
        }
    }

    async fn on_adapter_state_changed(&self, cycle: &mut Cycle, state: AdapterState) {
        info!("State: {:?}", state);
        match state {
            AdapterState::PoweredOn => {
                info!("Scanning...");
                match self.radio.start_scan().await {
                    Ok(()) => cycle.transition(SessionState::Scanning),
                    Err(e) => error!("Failed to start scanning: {}", e),
                }
            }
            _ => {
                if let Err(e) = self.radio.stop_scan().await {
                    warn!("Failed to stop scanning: {}", e);
                }
                cycle.transition(SessionState::PoweredOff);
            }
        }
    }

    async fn on_peripheral_discovered(
        &self,
        cycle: &mut Cycle,
        peripheral: Peripheral,
    ) -> ControlFlow<()> {
        if cycle.peripheral.is_some() || !self.filter.matches(&peripheral) {
            return ControlFlow::Continue(());
        }

        info!(
            "Stop scanning and found device {}",
            peripheral.local_name.as_deref().unwrap_or("")
        );
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop scanning: {}", e);
        }
        info!(
            "Peripheral ID:{}, name:{}, rssi:{}",
            peripheral.id,
            peripheral.local_name.as_deref().unwrap_or(""),
            peripheral
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "n/a".to_string())
        );

        cycle.transition(SessionState::Discovered);
        cycle.peripheral = Some(peripheral.clone());
        cycle.transition(SessionState::Connecting);
        let result = self.radio.connect(&peripheral).await;
        self.on_peripheral_connected(cycle, &peripheral, result).await
    }

    async fn on_peripheral_connected(
        &self,
        cycle: &mut Cycle,
        peripheral: &Peripheral,
        result: Result<(), RadioError>,
    ) -> ControlFlow<()> {
        if let Err(e) = result {
            error!("Failed to connect to {}: {}", peripheral.id, e);
            cycle.transition(SessionState::Disconnected);
            return ControlFlow::Break(());
        }

        info!("Connected");
        cycle.transition(SessionState::Connected);

        let enumerated = self.enumerate(cycle, peripheral).await;
        if enumerated.is_ok() {
            info!(
                "Waiting for {} seconds to get some notifications, if any.",
                self.options.dwell.as_secs()
            );
            sleep(self.options.dwell).await;
        }

        cycle.stop_notifiers();
        if let Err(e) = self.radio.cancel_connection(peripheral).await {
            warn!("Failed to cancel connection to {}: {}", peripheral.id, e);
        }
        ControlFlow::Continue(())
    }

    fn on_peripheral_disconnected(
        &self,
        cycle: &mut Cycle,
        id: &str,
        reason: Option<RadioError>,
    ) -> ControlFlow<()> {
        let ours = cycle
            .peripheral
            .as_ref()
            .is_some_and(|p| p.id.eq_ignore_ascii_case(id));
        if !ours {
            debug!("Ignoring disconnect of {}", id);
            return ControlFlow::Continue(());
        }

        match reason {
            Some(e) => info!("Disconnected: {}", e),
            None => info!("Disconnected"),
        }
        cycle.stop_notifiers();
        cycle.transition(SessionState::Disconnected);
        ControlFlow::Break(())
    }

    /// Walk the GATT tree. Only a failed service discovery aborts the walk.
    async fn enumerate(
        &self,
        cycle: &mut Cycle,
        peripheral: &Peripheral,
    ) -> Result<(), RadioError> {
        if let Err(e) = self.radio.set_mtu(peripheral, MAX_MTU).await {
            warn!("Failed to set MTU, err: {}", e);
        }

        let services = match self.radio.discover_services(peripheral).await {
            Ok(services) => services,
            Err(e) => {
                error!("Failed to discover services, err: {}", e);
                return Err(e);
            }
        };

        for service in &services {
            info!("Service: {}", service.uuid);

            let characteristics = match self
                .radio
                .discover_characteristics(peripheral, service)
                .await
            {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    warn!("Failed to discover characteristics, err: {}", e);
                    continue;
                }
            };

            for characteristic in &characteristics {
                self.inspect_characteristic(cycle, peripheral, characteristic)
                    .await;
            }
        }

        cycle.transition(SessionState::NotifyArmed);
        Ok(())
    }

    async fn inspect_characteristic(
        &self,
        cycle: &mut Cycle,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) {
        info!(
            "  Characteristic  {}\n    properties    {}",
            characteristic.uuid, characteristic.properties
        );

        if characteristic.properties.read {
            match self.radio.read_characteristic(peripheral, characteristic).await {
                Ok(value) => log_value(&value),
                Err(e) => warn!("Failed to read characteristic, err: {}", e),
            }
        }

        match self.radio.discover_descriptors(peripheral, characteristic).await {
            Ok(descriptors) => {
                for descriptor in &descriptors {
                    info!("  Descriptor      {}", descriptor.uuid);
                    match self.radio.read_descriptor(peripheral, descriptor).await {
                        Ok(value) => log_value(&value),
                        Err(e) => warn!("Failed to read descriptor, err: {}", e),
                    }
                }
            }
            Err(e) => warn!("Failed to discover descriptors, err: {}", e),
        }

        if characteristic.properties.notify || characteristic.properties.indicate {
            match self.radio.subscribe(peripheral, characteristic).await {
                Ok(values) => cycle.notifiers.push(self.handler.spawn(values)),
                Err(e) => warn!("Failed to subscribe characteristic, err: {}", e),
            }
        }
    }
}

fn log_value(value: &[u8]) {
    info!("    value         {} | {}", hex_bytes(value), render_bytes(value));
}
