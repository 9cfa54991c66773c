/// Thin publish/subscribe bridge over `rumqttc`.
///
/// Each process opens exactly one `MqttBridge`. `connect` waits for the
/// broker's CONNACK before returning; afterwards a background task polls the
/// event loop, feeds incoming publishes to the registered handlers one at a
/// time, and restores subscriptions after an automatic reconnect.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::topic::{parse_server, topic_matches};
use crate::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 100;

/// Outbound half of the bridge, injected wherever readings are published.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>)
        -> Result<(), TransportError>;
}

/// Callback for messages on a subscribed filter.
///
/// Implementations deal with their own failures; nothing is returned to the
/// transport.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &[u8]);
}

/// Handler that only logs what it hears.
pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        info!(
            "Subscribed MQTT topic: {}, message: {}",
            topic,
            String::from_utf8_lossy(payload)
        );
    }
}

struct Subscription {
    filter: String,
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

type Subscriptions = Arc<Mutex<Vec<Subscription>>>;

/// The process's single MQTT connection
///
/// Publishing goes through the [`Publisher`] impl, subscriptions through
/// [`MqttBridge::subscribe`]. Handlers stay registered across reconnects.
pub struct MqttBridge {
    client: AsyncClient,
    subscriptions: Subscriptions,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBridge {
    /// Connect to the broker and wait for it to accept
    ///
    /// # Arguments
    /// * `client_id` - MQTT client identifier
    /// * `server` - Broker address as `host:port`, optionally with a
    ///   `tcp://` or `mqtt://` prefix
    ///
    /// # Returns
    /// A connected bridge with its event loop running, or an error if the
    /// broker is unreachable, refuses us or does not answer in time
    pub async fn connect(client_id: &str, server: &str) -> Result<Self, TransportError> {
        info!("connecting to the mqtt server: {}", server);
        let (host, port) =
            parse_server(server).ok_or_else(|| TransportError::InvalidServer(server.to_string()))?;

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        match timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => info!("connected to the mqtt server: {}", server),
            Ok(Err(e)) => {
                error!("{}", e);
                return Err(e);
            }
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "no CONNACK from {} within {}s",
                    server,
                    CONNECT_TIMEOUT.as_secs()
                )))
            }
        }

        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));
        let event_task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&subscriptions),
        ));

        Ok(MqttBridge {
            client,
            subscriptions,
            event_task: Mutex::new(Some(event_task)),
        })
    }

    /// Register `handler` for every message matching `filter`
    ///
    /// # Arguments
    /// * `filter` - MQTT topic filter, `+` and `#` allowed
    /// * `qos` - Requested QoS
    /// * `handler` - Called once per matching message, never concurrently
    ///
    /// # Returns
    /// Result indicating whether the SUBSCRIBE request was queued
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                filter: filter.to_string(),
                qos,
                handler,
            });

        if let Err(e) = self.client.subscribe(filter, qos).await {
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| s.filter != filter);
            return Err(TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            });
        }

        info!("subscribed to mqtt filter {}", filter);
        Ok(())
    }

    /// Send DISCONNECT and stop the event loop.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()));

        let task = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        result
    }
}

#[async_trait]
impl Publisher for MqttBridge {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        if let Some(outcome) = connect_outcome(eventloop.poll().await) {
            return outcome;
        }
    }
}

/// Classify one poll result while the connection is being set up
///
/// # Arguments
/// * `polled` - Result of `EventLoop::poll`
///
/// # Returns
/// None while still waiting, otherwise whether the broker accepted us
fn connect_outcome(
    polled: Result<Event, ConnectionError>,
) -> Option<Result<(), TransportError>> {
    match polled {
        // rumqttc only surfaces a successful CONNACK as an event
        Ok(Event::Incoming(Packet::ConnAck(_))) => Some(Ok(())),
        Ok(_) => None,
        Err(ConnectionError::ConnectionRefused(code)) => Some(Err(TransportError::Connect(
            format!("broker refused connection: {:?}", code),
        ))),
        Err(e) => Some(Err(TransportError::Connect(e.to_string()))),
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
) {
    let mut reconnecting = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatch(&subscriptions, &publish.topic, &publish.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) if reconnecting => {
                reconnecting = false;
                info!("MQTT reconnected, restoring subscriptions");
                let filters: Vec<(String, QoS)> = subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|s| (s.filter.clone(), s.qos))
                    .collect();
                for (filter, qos) in filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                        warn!("Failed to resubscribe to {}: {}", filter, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::PingResp)) => {
                debug!("MQTT ping response received");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}. Reconnecting...", e);
                reconnecting = true;
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Hand one message to every matching handler, in registration order.
///
/// Each invocation runs as its own task and is awaited before the next, so
/// delivery stays serial and a panicking handler cannot kill the event loop.
async fn dispatch(subscriptions: &Mutex<Vec<Subscription>>, topic: &str, payload: &[u8]) {
    let handlers: Vec<Arc<dyn MessageHandler>> = subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|s| topic_matches(topic, &s.filter))
        .map(|s| Arc::clone(&s.handler))
        .collect();

    if handlers.is_empty() {
        debug!("No handler for message on {}", topic);
        return;
    }

    for handler in handlers {
        let owned_topic = topic.to_string();
        let owned_payload = payload.to_vec();
        let invocation =
            tokio::spawn(async move { handler.handle(&owned_topic, &owned_payload).await });
        if let Err(e) = invocation.await {
            error!("Message handler for {} failed: {}", topic, e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, topic: &str, payload: &[u8]) {
            self.seen
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
        }
    }

    struct Panicker;

    #[async_trait]
    impl MessageHandler for Panicker {
        async fn handle(&self, _topic: &str, _payload: &[u8]) {
            panic!("handler blew up");
        }
    }

    fn subscription(filter: &str, handler: Arc<dyn MessageHandler>) -> Subscription {
        Subscription {
            filter: filter.to_string(),
            qos: QoS::AtMostOnce,
            handler,
        }
    }

    #[tokio::test]
    async fn test_dispatch_only_to_matching_filters() {
        let temp = Arc::new(Recorder::default());
        let other = Arc::new(Recorder::default());
        let subscriptions = Mutex::new(vec![
            subscription("devices/#", temp.clone()),
            subscription("other/+", other.clone()),
        ]);

        dispatch(&subscriptions, "devices/temp", b"one").await;
        dispatch(&subscriptions, "devices/temp", b"two").await;

        let seen = temp.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("devices/temp".to_string(), b"one".to_vec()),
                ("devices/temp".to_string(), b"two".to_vec()),
            ]
        );
        assert!(other.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_delivery() {
        let recorder = Arc::new(Recorder::default());
        let subscriptions = Mutex::new(vec![
            subscription("devices/#", Arc::new(Panicker)),
            subscription("devices/#", recorder.clone()),
        ]);

        dispatch(&subscriptions, "devices/temp", b"first").await;
        dispatch(&subscriptions, "devices/temp", b"second").await;

        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_connect_outcome_accepts_connack() {
        let ack = rumqttc::ConnAck::new(rumqttc::ConnectReturnCode::Success, false);
        let outcome = connect_outcome(Ok(Event::Incoming(Packet::ConnAck(ack))));
        assert!(matches!(outcome, Some(Ok(()))));
    }

    #[test]
    fn test_connect_outcome_keeps_waiting_on_other_events() {
        assert!(connect_outcome(Ok(Event::Outgoing(Outgoing::PingReq))).is_none());
    }

    #[test]
    fn test_connect_outcome_reports_refusal() {
        let refused = ConnectionError::ConnectionRefused(
            rumqttc::ConnectReturnCode::BadUserNamePassword,
        );
        match connect_outcome(Err(refused)) {
            Some(Err(TransportError::Connect(reason))) => {
                assert!(reason.contains("refused"), "{}", reason);
                assert!(reason.contains("BadUserNamePassword"), "{}", reason);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recording_publisher_failure() {
        let publisher = mocks::RecordingPublisher::new();
        publisher.set_fail(true);
        let err = publisher
            .publish("t", QoS::AtMostOnce, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Publish { .. }));
        assert!(publisher.get_published().is_empty());
    }
}
