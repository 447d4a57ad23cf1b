//! Reconnecting Serial Link to an ELM327 Adapter
//!
//! Three loops share the current device handle:
//! - the read loop cuts the byte stream into frames at `>` and forwards them,
//! - the write loop writes queued commands terminated by `\r` and reports
//!   each written command, in write order,
//! - the reconnect loop opens, initialises, installs and tears down handles.
//!
//! Only the reconnect loop changes [`LinkState`]. The read and write loops
//! report faults to it and never touch the state themselves.

use crate::command::Command;
use crate::error::LinkError;
use crate::elm;
use crate::frame::{FrameAssembler, RawFrame};
use crate::transport::{Connector, DeviceStream};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default device path of an RFCOMM-bound adapter
pub const DEFAULT_DEVICE_PATH: &str = "/dev/rfcomm0";

const READ_BUFFER_SIZE: usize = 512;

/// Link configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Device path (e.g., "/dev/rfcomm0")
    pub device_path: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Pause between reconnect attempts
    pub reconnect_interval: Duration,
    /// Upper bound on opening the device
    pub connect_timeout: Duration,
    /// Read deadline; an idle read is not an error
    pub read_timeout: Duration,
    /// Write deadline; an overrun is a fault
    pub write_timeout: Duration,
    /// Pause after opening, before the first init command
    pub init_delay: Duration,
    /// Pause after each init command before reading its answer
    pub init_settle: Duration,
    /// Commands sent in order after every (re)connect
    pub init_commands: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            baud_rate: 38400,
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(1),
            init_delay: Duration::from_millis(500),
            init_settle: Duration::from_millis(200),
            init_commands: ["ATZ", "ATE0", "ATL0", "ATH0", "ATSP0"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

/// Connection lifecycle of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Faulted,
}

/// Snapshot of link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Successful connects (reached Ready)
    pub connects: u64,
    /// Failed open or init attempts
    pub connect_failures: u64,
    /// Read or write faults on a Ready handle
    pub faults: u64,
    /// Complete frames cut from the stream
    pub frames_read: u64,
    /// Frames dropped because the frame channel was full
    pub frames_dropped: u64,
    /// Commands written to the device
    pub commands_written: u64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    faults: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
    commands_written: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            commands_written: self.commands_written.load(Ordering::Relaxed),
        }
    }
}

type DeviceReader = ReadHalf<Box<dyn DeviceStream>>;
type DeviceWriter = WriteHalf<Box<dyn DeviceStream>>;

/// An open, initialised device. The id distinguishes successive handles.
struct DeviceHandle {
    id: u64,
    reader: Mutex<DeviceReader>,
    writer: Mutex<DeviceWriter>,
}

/// A read or write failure reported to the reconnect loop
struct Fault {
    handle_id: u64,
    error: LinkError,
}

struct Shared<C> {
    config: LinkConfig,
    connector: C,
    handle: RwLock<Option<Arc<DeviceHandle>>>,
    state: watch::Sender<LinkState>,
    counters: Counters,
    next_handle_id: AtomicU64,
}

impl<C: Connector> Shared<C> {
    async fn current_handle(&self) -> Option<Arc<DeviceHandle>> {
        self.handle.read().await.clone()
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Link state {:?} -> {:?}", previous, state);
        }
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Disconnected -> Connecting -> Initializing -> Ready
    async fn connect(&self) -> Result<(), LinkError> {
        let path = &self.config.device_path;
        self.set_state(LinkState::Connecting);
        info!("Attempting to connect to {}", path);

        let stream = match self.connector.open(path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };

        self.set_state(LinkState::Initializing);
        let (mut reader, mut writer) = tokio::io::split(stream);

        if let Err(e) = self.initialize(&mut reader, &mut writer).await {
            let _ = writer.shutdown().await;
            self.set_state(LinkState::Disconnected);
            return Err(e);
        }

        let handle = Arc::new(DeviceHandle {
            id: self.next_handle_id.fetch_add(1, Ordering::Relaxed),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        });
        *self.handle.write().await = Some(handle);

        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        self.set_state(LinkState::Ready);
        info!("Link ready on {}", path);
        Ok(())
    }

    /// Send every init command in order. Missing or unexpected answers are
    /// logged and never stop initialisation; only a failed write does.
    async fn initialize(
        &self,
        reader: &mut DeviceReader,
        writer: &mut DeviceWriter,
    ) -> Result<(), LinkError> {
        let cfg = &self.config;
        let total = cfg.init_commands.len();
        info!("Initializing ELM327 with {} commands", total);

        time::sleep(cfg.init_delay).await;

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut assembler = FrameAssembler::new();
        for (i, command) in cfg.init_commands.iter().enumerate() {
            debug!("Sending init command {}/{}: {}", i + 1, total, command);
            write_command(writer, command, cfg.write_timeout)
                .await
                .map_err(|source| LinkError::Write {
                    path: cfg.device_path.clone(),
                    source,
                })?;

            time::sleep(cfg.init_settle).await;

            match read_answer(reader, &mut assembler, &mut buf, cfg.read_timeout).await {
                Ok(Some(frame)) => {
                    let response = frame.text();
                    if elm::is_init_ack(&response) {
                        debug!("Response to {}: {:?}", command, response);
                    } else {
                        warn!("Unexpected response to {}: {:?}. Continuing...", command, response);
                    }
                }
                Ok(None) => warn!("No response to {} within {:?}. Continuing...", command, cfg.read_timeout),
                Err(e) => warn!("No response to {} (err: {}). Continuing...", command, e),
            }
            // A late or partial answer must not leak into the next command
            assembler.clear();
        }

        info!("ELM327 initialization completed");
        Ok(())
    }

    /// Ready -> Faulted -> Disconnected. Returns false for a stale fault on a
    /// handle that has already been replaced or cleared.
    async fn handle_fault(&self, fault: Fault) -> bool {
        let handle = {
            let mut slot = self.handle.write().await;
            match slot.as_ref() {
                Some(h) if h.id == fault.handle_id => slot.take(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            debug!("Ignoring stale fault on handle {}: {}", fault.handle_id, fault.error);
            return false;
        };

        self.set_state(LinkState::Faulted);
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("obd_link_faults_total").increment(1);
        error!("Link fault: {}", fault.error);

        let _ = handle.writer.lock().await.shutdown().await;
        drop(handle);
        info!("Connection to {} closed", self.config.device_path);

        self.set_state(LinkState::Disconnected);
        true
    }

    async fn close(&self) {
        if let Some(handle) = self.handle.write().await.take() {
            let _ = handle.writer.lock().await.shutdown().await;
            info!("Connection to {} closed", self.config.device_path);
        }
        self.set_state(LinkState::Disconnected);
    }
}

/// Read until one complete answer is cut at `>` or the deadline passes
async fn read_answer(
    reader: &mut DeviceReader,
    assembler: &mut FrameAssembler,
    buf: &mut [u8],
    deadline: Duration,
) -> std::io::Result<Option<RawFrame>> {
    let until = Instant::now() + deadline;
    loop {
        let n = match time::timeout_at(until, reader.read(buf)).await {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device closed the stream",
            ));
        }
        if let Some(frame) = assembler.push(&buf[..n]).into_iter().last() {
            return Ok(Some(frame));
        }
    }
}

async fn write_command(
    writer: &mut DeviceWriter,
    command: &str,
    deadline: Duration,
) -> std::io::Result<()> {
    let mut payload = Vec::with_capacity(command.len() + 1);
    payload.extend_from_slice(command.as_bytes());
    payload.push(b'\r');

    match time::timeout(deadline, async {
        writer.write_all(&payload).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("write not completed within {:?}", deadline),
        )),
    }
}

/// Serial link adapter
pub struct LinkAdapter<C: Connector> {
    shared: Arc<Shared<C>>,
    stop_tx: watch::Sender<bool>,
    channels: Option<(mpsc::Sender<RawFrame>, mpsc::Receiver<Command>)>,
    written_tx: Option<mpsc::Sender<Command>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: Connector> LinkAdapter<C> {
    /// Create a new link adapter
    ///
    /// # Arguments
    /// * `frames_tx` - receives every complete frame read from the device
    /// * `commands_rx` - commands to write to the device
    pub fn new(
        config: LinkConfig,
        connector: C,
        frames_tx: mpsc::Sender<RawFrame>,
        commands_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (stop_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                handle: RwLock::new(None),
                state,
                counters: Counters::default(),
                next_handle_id: AtomicU64::new(1),
            }),
            stop_tx,
            channels: Some((frames_tx, commands_rx)),
            written_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Report every command once it has been written to the device
    pub fn with_write_reports(mut self, written_tx: mpsc::Sender<Command>) -> Self {
        self.written_tx = Some(written_tx);
        self
    }

    /// Spawn the read, write and reconnect loops
    pub fn start(&mut self) {
        let Some((frames_tx, commands_rx)) = self.channels.take() else {
            warn!("Link adapter already started");
            return;
        };

        info!("Starting link adapter with device: {}", self.shared.config.device_path);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        self.tasks.push(tokio::spawn(read_loop(
            self.shared.clone(),
            self.stop_tx.subscribe(),
            frames_tx,
            fault_tx.clone(),
        )));
        self.tasks.push(tokio::spawn(write_loop(
            self.shared.clone(),
            self.stop_tx.subscribe(),
            commands_rx,
            self.written_tx.take(),
            fault_tx,
        )));
        self.tasks.push(tokio::spawn(reconnect_loop(
            self.shared.clone(),
            self.stop_tx.subscribe(),
            fault_rx,
        )));
    }

    /// Signal stop, join all loops, then close the handle if open
    pub async fn stop(&mut self) {
        info!("Stopping link adapter...");
        self.stop_tx.send_replace(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Link loop ended abnormally: {}", e);
            }
        }

        self.shared.close().await;
        info!("Link adapter stopped");
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Counter snapshot
    pub fn stats(&self) -> LinkStats {
        self.shared.counters.snapshot()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }
}

async fn reconnect_loop<C: Connector>(
    shared: Arc<Shared<C>>,
    mut stop_rx: watch::Receiver<bool>,
    mut fault_rx: mpsc::UnboundedReceiver<Fault>,
) {
    info!("Starting reconnect loop");
    let interval = shared.config.reconnect_interval;
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Explicit start counts as the first trigger
    let mut retry_at = Instant::now();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        if shared.state() == LinkState::Disconnected && Instant::now() >= retry_at {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                result = shared.connect() => {
                    if let Err(e) = result {
                        shared.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("Connection failed: {}. Retrying in {:?}", e, interval);
                        retry_at = Instant::now() + interval;
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            Some(fault) = fault_rx.recv() => {
                if shared.handle_fault(fault).await {
                    info!("Reconnecting in {:?}", interval);
                    retry_at = Instant::now() + interval;
                }
            }
            _ = ticker.tick() => {}
        }
    }

    info!("Reconnect loop stopped");
}

async fn read_loop<C: Connector>(
    shared: Arc<Shared<C>>,
    mut stop_rx: watch::Receiver<bool>,
    frames_tx: mpsc::Sender<RawFrame>,
    fault_tx: mpsc::UnboundedSender<Fault>,
) {
    info!("Starting read loop");
    let mut state_rx = shared.state.subscribe();
    let mut assembler = FrameAssembler::new();
    let mut current_id: Option<u64> = None;
    let mut faulted_id: Option<u64> = None;
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let handle = match shared.current_handle().await {
            Some(h) if Some(h.id) != faulted_id => h,
            _ => {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = state_rx.changed() => continue,
                }
            }
        };

        if current_id != Some(handle.id) {
            assembler.clear();
            current_id = Some(handle.id);
        }

        let read = {
            let mut reader = handle.reader.lock().await;
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                r = time::timeout(shared.config.read_timeout, reader.read(&mut buf)) => r,
            }
        };

        let error = match read {
            // Idle device
            Err(_) => continue,
            Ok(Ok(0)) => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "device closed the stream"),
            Ok(Err(e)) => e,
            Ok(Ok(n)) => {
                for frame in assembler.push(&buf[..n]) {
                    forward_frame(&shared, &frames_tx, frame);
                }
                continue;
            }
        };

        warn!("Read error on {}: {}", shared.config.device_path, error);
        assembler.clear();
        faulted_id = Some(handle.id);
        let _ = fault_tx.send(Fault {
            handle_id: handle.id,
            error: LinkError::Read {
                path: shared.config.device_path.clone(),
                source: error,
            },
        });
    }

    info!("Read loop stopped");
}

fn forward_frame<C>(shared: &Shared<C>, frames_tx: &mpsc::Sender<RawFrame>, frame: RawFrame) {
    shared.counters.frames_read.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("obd_frames_read_total").increment(1);
    debug!("Received from ELM327: {:?}", frame.text());

    match frames_tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("obd_frames_dropped_total").increment(1);
            warn!("Frame channel is full, dropping frame: {:?}", frame.text());
        }
        Err(mpsc::error::TrySendError::Closed(frame)) => {
            debug!("Frame channel closed, discarding frame: {:?}", frame.text());
        }
    }
}

async fn write_loop<C: Connector>(
    shared: Arc<Shared<C>>,
    mut stop_rx: watch::Receiver<bool>,
    mut commands_rx: mpsc::Receiver<Command>,
    written_tx: Option<mpsc::Sender<Command>>,
    fault_tx: mpsc::UnboundedSender<Fault>,
) {
    info!("Starting write loop");

    loop {
        let command = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            command = commands_rx.recv() => match command {
                Some(command) => command,
                None => {
                    info!("Commands channel closed");
                    break;
                }
            },
        };

        let Some(handle) = shared.current_handle().await else {
            warn!("Cannot send command {:?}: no connection", command.text);
            continue;
        };

        let result = {
            let mut writer = handle.writer.lock().await;
            write_command(&mut writer, &command.text, shared.config.write_timeout).await
        };

        match result {
            Ok(()) => {
                shared.counters.commands_written.fetch_add(1, Ordering::Relaxed);
                debug!("Command sent: {:?}", command.text);
                if let Some(tx) = &written_tx {
                    match tx.try_send(command) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(command)) => {
                            warn!("Write report channel is full, {:?} will go unmatched", command.text);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
            Err(e) => {
                warn!("Write error on {} for {:?}: {}", shared.config.device_path, command.text, e);
                let _ = fault_tx.send(Fault {
                    handle_id: handle.id,
                    error: LinkError::Write {
                        path: shared.config.device_path.clone(),
                        source: e,
                    },
                });
            }
        }
    }

    info!("Write loop stopped");
}
