//! MQTT bus client
//!
//! The rumqttc event loop runs in its own task and is translated into
//! [`BusEvent`]s. A dispatcher task reacts to those events; publisher tasks
//! drain the telemetry, response and raw frame channels.

use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::{CommandMessage, CommandResponse, ForwardedCommand, ResponseEnvelope};
use crate::topics::Topics;
use obd_protocol::{encode_frame, Command, RawFrame, TelemetryRecord};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, Outgoing, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel between the event loop and the dispatcher
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long `stop` waits for the disconnect to be flushed
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Connection events, in the order the event loop observed them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connected,
    Disconnected(String),
    MessageReceived { topic: String, payload: Vec<u8> },
}

/// Non-blocking publish/subscribe operations
pub trait BusTransport: Send + Sync + 'static {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError>;
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), BusError>;
}

impl BusTransport for AsyncClient {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError> {
        self.try_subscribe(topic, qos).map_err(|e| BusError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), BusError> {
        self.try_publish(topic, qos, false, payload)
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Channels connecting the client to the rest of the bridge
pub struct BusChannels {
    /// Records to publish
    pub telemetry_rx: mpsc::Receiver<TelemetryRecord>,
    /// Responses to publish
    pub responses_rx: mpsc::Receiver<ResponseEnvelope>,
    /// Frames that answered no bus command and carry no telemetry
    pub raw_rx: mpsc::Receiver<RawFrame>,
    /// Ticketed commands for the link's write loop
    pub commands_tx: mpsc::Sender<Command>,
    /// Every bus command, once it reached the link's queue
    pub forwarded_tx: mpsc::Sender<ForwardedCommand>,
}

/// Translate a rumqttc event. Returns the event and whether the loop should end.
fn translate(event: Event) -> (Option<BusEvent>, bool) {
    match event {
        Event::Incoming(Incoming::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                (Some(BusEvent::Connected), false)
            } else {
                (Some(BusEvent::Disconnected(format!("{:?}", ack.code))), false)
            }
        }
        Event::Incoming(Incoming::Publish(publish)) => (
            Some(BusEvent::MessageReceived {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            false,
        ),
        Event::Outgoing(Outgoing::Disconnect) => (
            Some(BusEvent::Disconnected("client disconnected".to_string())),
            true,
        ),
        _ => (None, false),
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events_tx: mpsc::Sender<BusEvent>,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(event) => {
                let (event, finished) = translate(event);
                if let Some(event) = event {
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                if finished {
                    break;
                }
            }
            Err(e) => {
                error!("MQTT connection error: {}", e);
                if events_tx.send(BusEvent::Disconnected(e.to_string())).await.is_err() {
                    break;
                }
                if !auto_reconnect {
                    warn!("MQTT auto-reconnect disabled, event loop stopping");
                    break;
                }
                info!("Reconnecting to MQTT broker in {:?}", reconnect_delay);
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = time::sleep(reconnect_delay) => {}
                }
            }
        }
    }
    debug!("MQTT event loop stopped");
}

/// Reacts to connection events and relays inbound commands
pub struct Dispatcher<T: BusTransport> {
    transport: Arc<T>,
    topics: Topics,
    qos: QoS,
    vehicle_id: String,
    forward_timeout: Duration,
    connected: Arc<AtomicBool>,
    next_ticket: AtomicU64,
    commands_tx: mpsc::Sender<Command>,
    forwarded_tx: mpsc::Sender<ForwardedCommand>,
}

impl<T: BusTransport> Dispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        config: &BusConfig,
        connected: Arc<AtomicBool>,
        commands_tx: mpsc::Sender<Command>,
        forwarded_tx: mpsc::Sender<ForwardedCommand>,
    ) -> Self {
        Self {
            transport,
            topics: Topics::new(&config.data_topic, &config.command_topic, config.flat_topics),
            qos: config.qos,
            vehicle_id: config.vehicle_id.clone(),
            forward_timeout: config.command_forward_timeout,
            connected,
            next_ticket: AtomicU64::new(1),
            commands_tx,
            forwarded_tx,
        }
    }

    pub async fn handle(&self, event: BusEvent) {
        match event {
            BusEvent::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                info!("MQTT connected");
                // Subscriptions do not survive a clean-session reconnect
                let filter = self.topics.command_subscription();
                match self.transport.subscribe(&filter, self.qos) {
                    Ok(()) => info!("Subscribed to {}", filter),
                    Err(e) => error!("{}", e),
                }
            }
            BusEvent::Disconnected(reason) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!("MQTT connection lost: {}", reason);
                } else {
                    debug!("MQTT still disconnected: {}", reason);
                }
            }
            BusEvent::MessageReceived { topic, payload } => {
                self.handle_message(&topic, &payload).await;
            }
        }
    }

    async fn handle_message(&self, topic: &str, payload: &[u8]) {
        if !self.topics.is_command_topic(topic) {
            debug!("Ignoring message on {}", topic);
            return;
        }

        let message = match CommandMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping command on {}: {}", topic, e);
                metrics::counter!("bus_commands_dropped_total").increment(1);
                return;
            }
        };

        let target = if !message.target.is_empty() {
            message.target.clone()
        } else {
            self.topics
                .target_from_topic(topic)
                .unwrap_or(&self.vehicle_id)
                .to_string()
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        info!(
            "Processing command: {} (correlation_id: {}, ticket: {})",
            message.command, message.correlation_id, ticket
        );

        let failure = match time::timeout(
            self.forward_timeout,
            self.commands_tx.send(Command::with_ticket(message.command.clone(), ticket)),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some("link command channel closed".to_string()),
            Err(_) => Some(format!(
                "link busy, command not forwarded within {}ms",
                self.forward_timeout.as_millis()
            )),
        };

        match failure {
            None => {
                metrics::counter!("bus_commands_forwarded_total").increment(1);
                debug!("Command forwarded to link: {}", message.command);
                let forwarded = ForwardedCommand {
                    ticket,
                    command: message.command,
                    correlation_id: message.correlation_id,
                    target,
                };
                if self.forwarded_tx.try_send(forwarded).is_err() {
                    warn!("Correlation queue full, response to ticket {} will not be tracked", ticket);
                }
            }
            Some(reason) => {
                metrics::counter!("bus_commands_dropped_total").increment(1);
                warn!("Dropping command {}: {}", message.command, reason);
                let envelope = ResponseEnvelope {
                    target,
                    response: CommandResponse::error(message.correlation_id, reason),
                };
                if let Err(e) = publish_response(self.transport.as_ref(), &self.topics, self.qos, &envelope) {
                    error!("{}", e);
                }
            }
        }
    }
}

fn publish_telemetry<T: BusTransport + ?Sized>(
    transport: &T,
    topics: &Topics,
    qos: QoS,
    record: &TelemetryRecord,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(record)?;
    transport.publish(&topics.telemetry(&record.metric), qos, payload)
}

fn publish_response<T: BusTransport + ?Sized>(
    transport: &T,
    topics: &Topics,
    qos: QoS,
    envelope: &ResponseEnvelope,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(&envelope.response)?;
    transport.publish(&topics.response(&envelope.target), qos, payload)
}

async fn run_telemetry_publisher<T: BusTransport>(
    transport: Arc<T>,
    topics: Topics,
    qos: QoS,
    connected: Arc<AtomicBool>,
    mut telemetry_rx: mpsc::Receiver<TelemetryRecord>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!("Starting telemetry publish loop");
    loop {
        let record = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            record = telemetry_rx.recv() => match record {
                Some(record) => record,
                None => {
                    info!("Telemetry channel closed");
                    break;
                }
            },
        };

        if !connected.load(Ordering::SeqCst) {
            metrics::counter!("bus_publish_failures_total").increment(1);
            debug!("{}: dropping {} sample", BusError::NotConnected, record.metric);
            continue;
        }

        match publish_telemetry(transport.as_ref(), &topics, qos, &record) {
            Ok(()) => metrics::counter!("bus_telemetry_published_total").increment(1),
            Err(e) => {
                metrics::counter!("bus_publish_failures_total").increment(1);
                warn!("Failed to publish telemetry: {}", e);
            }
        }
    }
    info!("Telemetry publish loop stopped");
}

async fn run_response_publisher<T: BusTransport>(
    transport: Arc<T>,
    topics: Topics,
    qos: QoS,
    connected: Arc<AtomicBool>,
    mut responses_rx: mpsc::Receiver<ResponseEnvelope>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!("Starting responses publish loop");
    loop {
        let envelope = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            envelope = responses_rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => {
                    info!("Command responses channel closed");
                    break;
                }
            },
        };

        if !connected.load(Ordering::SeqCst) {
            metrics::counter!("bus_publish_failures_total").increment(1);
            warn!(
                "{}: dropping response {}",
                BusError::NotConnected,
                envelope.response.correlation_id
            );
            continue;
        }

        if let Err(e) = publish_response(transport.as_ref(), &topics, qos, &envelope) {
            metrics::counter!("bus_publish_failures_total").increment(1);
            warn!("Failed to publish command response: {}", e);
        }
    }
    info!("Responses publish loop stopped");
}

async fn run_raw_publisher<T: BusTransport>(
    transport: Arc<T>,
    topics: Topics,
    qos: QoS,
    connected: Arc<AtomicBool>,
    mut raw_rx: mpsc::Receiver<RawFrame>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!("Starting raw frame publish loop");
    let topic = topics.raw();
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            frame = raw_rx.recv() => match frame {
                Some(frame) => frame,
                None => {
                    info!("Raw frame channel closed");
                    break;
                }
            },
        };

        if !connected.load(Ordering::SeqCst) {
            metrics::counter!("bus_publish_failures_total").increment(1);
            debug!("{}: dropping frame {:?}", BusError::NotConnected, frame.text());
            continue;
        }

        let payload = encode_frame(frame.as_bytes()).into_bytes();
        match transport.publish(&topic, qos, payload) {
            Ok(()) => metrics::counter!("bus_raw_frames_published_total").increment(1),
            Err(e) => {
                metrics::counter!("bus_publish_failures_total").increment(1);
                warn!("Failed to publish raw frame: {}", e);
            }
        }
    }
    info!("Raw frame publish loop stopped");
}

async fn run_dispatcher<T: BusTransport>(
    dispatcher: Dispatcher<T>,
    mut events_rx: mpsc::Receiver<BusEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        dispatcher.handle(event).await;
    }
    debug!("MQTT dispatcher stopped");
}

/// Publishes telemetry, responses and raw frames, relays inbound commands to the link
pub struct BusClient {
    config: BusConfig,
    client: Arc<AsyncClient>,
    eventloop: Option<EventLoop>,
    channels: Option<BusChannels>,
    connected: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    event_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusClient {
    /// Validate the configuration and prepare the connection. Nothing is
    /// sent until [`BusClient::start`].
    pub fn new(config: BusConfig, channels: BusChannels) -> Result<Self, BusError> {
        let options = config.mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            client: Arc::new(client),
            eventloop: Some(eventloop),
            channels: Some(channels),
            connected: Arc::new(AtomicBool::new(false)),
            stop_tx,
            event_task: None,
            tasks: Vec::new(),
        })
    }

    /// Spawn the event loop, dispatcher and publishers. Calling it twice has no effect.
    pub fn start(&mut self) {
        let (Some(eventloop), Some(channels)) = (self.eventloop.take(), self.channels.take()) else {
            warn!("MQTT client already started");
            return;
        };

        info!("Connecting to MQTT broker {}", self.config.broker);

        let topics = Topics::new(
            &self.config.data_topic,
            &self.config.command_topic,
            self.config.flat_topics,
        );
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        self.event_task = Some(tokio::spawn(run_event_loop(
            eventloop,
            events_tx,
            self.config.auto_reconnect,
            self.config.reconnect_delay,
            self.stop_tx.subscribe(),
        )));

        let dispatcher = Dispatcher::new(
            self.client.clone(),
            &self.config,
            self.connected.clone(),
            channels.commands_tx,
            channels.forwarded_tx,
        );
        self.tasks.push(tokio::spawn(run_dispatcher(
            dispatcher,
            events_rx,
            self.stop_tx.subscribe(),
        )));

        self.tasks.push(tokio::spawn(run_telemetry_publisher(
            self.client.clone(),
            topics.clone(),
            self.config.qos,
            self.connected.clone(),
            channels.telemetry_rx,
            self.stop_tx.subscribe(),
        )));

        self.tasks.push(tokio::spawn(run_response_publisher(
            self.client.clone(),
            topics.clone(),
            self.config.qos,
            self.connected.clone(),
            channels.responses_rx,
            self.stop_tx.subscribe(),
        )));

        self.tasks.push(tokio::spawn(run_raw_publisher(
            self.client.clone(),
            topics,
            self.config.qos,
            self.connected.clone(),
            channels.raw_rx,
            self.stop_tx.subscribe(),
        )));
    }

    /// Disconnect from the broker and join every task
    pub async fn stop(&mut self) {
        if let Some(mut event_task) = self.event_task.take() {
            let disconnecting = self.connected.load(Ordering::SeqCst)
                && match self.client.try_disconnect() {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("MQTT disconnect request failed: {}", e);
                        false
                    }
                };
            // The event loop exits on its own once the disconnect is flushed
            let flushed =
                disconnecting && time::timeout(DISCONNECT_GRACE, &mut event_task).await.is_ok();
            if !flushed {
                let _ = self.stop_tx.send(true);
                if let Err(e) = event_task.await {
                    error!("MQTT event loop task failed: {}", e);
                }
            }
        }

        let _ = self.stop_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("MQTT task failed: {}", e);
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("MQTT client stopped");
    }

    /// Whether the last connection event was a successful connect
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}
