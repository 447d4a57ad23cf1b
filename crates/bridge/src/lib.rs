//! OBD-II to MQTT Bridge
//!
//! Wires the link adapter, the response parser, the command scheduler and
//! the bus client together with bounded channels:
//!
//! ```text
//! device -> link (read) -> frames -> pipeline -> telemetry -> bus (publish)
//! bus (subscribe) -> commands -> link (write) -> device
//! scheduler -> commands
//! link (write) -> written reports -> pipeline
//! pipeline -> responses, raw frames -> bus (publish)
//! ```

mod correlator;
mod logging;
mod settings;

use correlator::{Answer, Correlator};
pub use logging::init_logging;
pub use settings::{
    BridgeConfig, ConfigError, LinkSettings, LogFormat, LoggingSettings, MqttSettings,
    PipelineSettings, SchedulerSettings, ENV_PREFIX,
};

use cloud_sync::{BusChannels, BusClient, BusError, ForwardedCommand, ResponseEnvelope};
use obd_protocol::{
    classify, parse_response, strip_searching, Command, Connector, ElmStatus, LinkAdapter,
    LinkState, LinkStats, RawFrame, TelemetryRecord,
};
use obd_scheduler::{CommandScheduler, SchedulerError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often pending commands are checked for a timeout
const WATCHDOG_TICK: Duration = Duration::from_millis(250);

/// Errors raised while starting the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Channels the pipeline reads from and feeds
pub struct PipelineChannels {
    /// Frames read from the device
    pub frames_rx: mpsc::Receiver<RawFrame>,
    /// Commands in the order the link wrote them
    pub written_rx: mpsc::Receiver<Command>,
    /// Bus commands waiting for an answer
    pub forwarded_rx: mpsc::Receiver<ForwardedCommand>,
    pub link_state_rx: watch::Receiver<LinkState>,
    pub telemetry_tx: mpsc::Sender<TelemetryRecord>,
    pub responses_tx: mpsc::Sender<ResponseEnvelope>,
    /// Frames that answered no bus command and carry no telemetry
    pub raw_tx: mpsc::Sender<RawFrame>,
}

/// Parses frames into telemetry, answers bus commands and relays the rest
pub struct Pipeline {
    channels: PipelineChannels,
    correlator: Correlator,
}

impl Pipeline {
    pub fn new(channels: PipelineChannels, response_timeout: Duration) -> Self {
        Self {
            channels,
            correlator: Correlator::new(response_timeout),
        }
    }

    /// Run until the stop signal is raised or the frame channel closes
    pub async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!("Starting parser pipeline");
        let mut watchdog = time::interval(WATCHDOG_TICK);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let channels = &mut self.channels;
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                Ok(()) = channels.link_state_rx.changed() => {
                    let state = *self.channels.link_state_rx.borrow_and_update();
                    if state != LinkState::Ready {
                        for envelope in self.correlator.reset() {
                            self.send_response(envelope);
                        }
                    }
                }
                Some(command) = channels.forwarded_rx.recv() => {
                    if let Some(envelope) = self.correlator.register(command) {
                        self.send_response(envelope);
                    }
                }
                // Reported before the frame that answers them arrives
                Some(command) = channels.written_rx.recv() => self.correlator.written(command),
                frame = channels.frames_rx.recv() => match frame {
                    Some(frame) => self.process_frame(frame),
                    None => {
                        info!("Frame channel closed");
                        break;
                    }
                },
                _ = watchdog.tick() => {
                    for envelope in self.correlator.expire(Instant::now()) {
                        self.send_response(envelope);
                    }
                }
            }
        }

        info!("Parser pipeline stopped");
    }

    fn process_frame(&mut self, frame: RawFrame) {
        let text = frame.text().into_owned();
        let body = strip_searching(&text);

        let mut records = Vec::new();
        let mut rejected = Vec::new();
        for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match parse_response(line) {
                Ok(record) => records.push(record),
                Err(e) => rejected.push((line, e)),
            }
        }

        let status = if records.is_empty() { classify(body) } else { ElmStatus::Other };
        match status {
            ElmStatus::Other => {
                for (line, e) in &rejected {
                    warn!("Failed to parse response {:?}: {}", line, e);
                }
            }
            status => debug!("Adapter status {:?}", status),
        }

        let relay = match self.correlator.on_frame(&frame, &records) {
            Answer::Claimed(Some(envelope)) => {
                self.send_response(envelope);
                false
            }
            Answer::Claimed(None) => false,
            Answer::Unclaimed => records.is_empty(),
        };

        for record in records {
            self.send_telemetry(record);
        }
        if relay {
            self.send_raw(frame);
        }
    }

    fn send_raw(&self, frame: RawFrame) {
        match self.channels.raw_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!("Raw frame channel is full, dropping frame: {:?}", frame.text());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn send_telemetry(&self, record: TelemetryRecord) {
        match self.channels.telemetry_tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                metrics::counter!("bridge_telemetry_dropped_total").increment(1);
                warn!("Telemetry channel is full, dropping {} sample", record.metric);
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                debug!("Telemetry channel closed, discarding {} sample", record.metric);
            }
        }
    }

    fn send_response(&self, envelope: ResponseEnvelope) {
        if let Err(e) = self.channels.responses_tx.try_send(envelope) {
            warn!(
                "Dropping response {}: response channel unavailable",
                match &e {
                    mpsc::error::TrySendError::Full(envelope)
                    | mpsc::error::TrySendError::Closed(envelope) => &envelope.response.correlation_id,
                }
            );
        }
    }
}

/// The running bridge
pub struct Bridge<C: Connector> {
    link: LinkAdapter<C>,
    bus: BusClient,
    stop_tx: watch::Sender<bool>,
    scheduler_task: Option<JoinHandle<()>>,
    pipeline_task: Option<JoinHandle<()>>,
}

impl<C: Connector> Bridge<C> {
    /// Wire the channels and start every component
    pub fn start(config: &BridgeConfig, connector: C) -> Result<Self, BridgeError> {
        let capacities = &config.bridge;
        let (frames_tx, frames_rx) = mpsc::channel(capacities.frame_channel);
        let (commands_tx, commands_rx) = mpsc::channel(capacities.command_channel);
        let (telemetry_tx, telemetry_rx) = mpsc::channel(capacities.telemetry_channel);
        let (responses_tx, responses_rx) = mpsc::channel(capacities.response_channel);
        let (forwarded_tx, forwarded_rx) = mpsc::channel(capacities.command_channel);
        let (written_tx, written_rx) = mpsc::channel(capacities.command_channel);
        let (raw_tx, raw_rx) = mpsc::channel(capacities.frame_channel);
        let (stop_tx, _) = watch::channel(false);

        // Everything that can fail is built before anything is spawned
        let scheduler = if config.scheduler.enabled {
            Some(CommandScheduler::new(
                config.scheduler_config()?,
                commands_tx.clone(),
            )?)
        } else {
            info!("Command scheduler disabled");
            None
        };

        let mut bus = BusClient::new(
            config.bus_config()?,
            BusChannels {
                telemetry_rx,
                responses_rx,
                raw_rx,
                commands_tx,
                forwarded_tx,
            },
        )?;

        let mut link = LinkAdapter::new(config.link_config(), connector, frames_tx, commands_rx)
            .with_write_reports(written_tx);

        let pipeline = Pipeline::new(
            PipelineChannels {
                frames_rx,
                written_rx,
                forwarded_rx,
                link_state_rx: link.subscribe_state(),
                telemetry_tx,
                responses_tx,
                raw_tx,
            },
            capacities.response_timeout(),
        );

        link.start();
        let pipeline_task = Some(tokio::spawn(pipeline.run(stop_tx.subscribe())));
        bus.start();
        let scheduler_task = scheduler.map(|s| tokio::spawn(s.run(stop_tx.subscribe())));

        info!("Bridge started");
        Ok(Self {
            link,
            bus,
            stop_tx,
            scheduler_task,
            pipeline_task,
        })
    }

    /// Stop the link, then the scheduler and pipeline, then the bus
    pub async fn shutdown(mut self) {
        info!("Shutting down bridge...");
        self.stop_tx.send_replace(true);

        self.link.stop().await;

        for task in [self.scheduler_task.take(), self.pipeline_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                error!("Bridge task ended abnormally: {}", e);
            }
        }

        self.bus.stop().await;
        info!("Bridge stopped");
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn subscribe_link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe_state()
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    pub fn is_bus_connected(&self) -> bool {
        self.bus.is_connected()
    }
}
