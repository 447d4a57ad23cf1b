//! End-to-end tests against a simulated ELM327 adapter

use bridge::{Bridge, BridgeConfig, Pipeline, PipelineChannels};
use cloud_sync::{
    BusConfig, BusError, BusEvent, BusTransport, Dispatcher, ForwardedCommand, QoS,
    ResponseEnvelope, ResponseStatus,
};
use obd_protocol::{
    Command, Connector, DeviceStream, LinkAdapter, LinkConfig, LinkError, LinkState, Pid, RawFrame,
    TelemetryRecord,
};
use obd_scheduler::{CommandScheduler, SchedulerConfig};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::time;

/// Answers like an ELM327 with echo off
fn answer(command: &str) -> &'static str {
    match command {
        c if c.starts_with("AT") && c != "ATRV" => "OK",
        "ATRV" => "12.6V",
        "010C" => "41 0C 1A F0",
        "010D" => "41 0D 32",
        "0105" => "41 05 5A",
        _ => "NO DATA",
    }
}

async fn run_adapter(mut device: DuplexStream) {
    let mut buf = [0u8; 256];
    let mut pending = Vec::new();
    loop {
        let n = match device.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(end) = pending.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let command = String::from_utf8_lossy(&line).trim().to_string();
            if command.is_empty() {
                continue;
            }
            let reply = format!("{}\r\r>", answer(&command));
            if device.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Opens an in-memory device served by the simulated adapter
struct SimulatedAdapter;

impl Connector for SimulatedAdapter {
    fn open(
        &self,
        _path: &str,
    ) -> impl Future<Output = Result<Box<dyn DeviceStream>, LinkError>> + Send {
        let (ours, theirs) = tokio::io::duplex(1024);
        tokio::spawn(run_adapter(theirs));
        async move { Ok(Box::new(ours) as Box<dyn DeviceStream>) }
    }
}

fn fast_link() -> LinkConfig {
    LinkConfig {
        device_path: "/dev/rfcomm-test".to_string(),
        reconnect_interval: Duration::from_millis(200),
        read_timeout: Duration::from_millis(200),
        init_delay: Duration::ZERO,
        init_settle: Duration::ZERO,
        ..LinkConfig::default()
    }
}

/// A link on the simulated adapter feeding a running pipeline
struct Rig {
    link: LinkAdapter<SimulatedAdapter>,
    commands_tx: mpsc::Sender<Command>,
    forwarded_tx: mpsc::Sender<ForwardedCommand>,
    telemetry_rx: mpsc::Receiver<TelemetryRecord>,
    responses_rx: mpsc::Receiver<ResponseEnvelope>,
    raw_rx: mpsc::Receiver<RawFrame>,
    stop_tx: watch::Sender<bool>,
    pipeline_task: tokio::task::JoinHandle<()>,
}

impl Rig {
    async fn start() -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (written_tx, written_rx) = mpsc::channel(16);
        let (forwarded_tx, forwarded_rx) = mpsc::channel(16);
        let (telemetry_tx, telemetry_rx) = mpsc::channel(16);
        let (responses_tx, responses_rx) = mpsc::channel(16);
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut link = LinkAdapter::new(fast_link(), SimulatedAdapter, frames_tx, commands_rx)
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
            Duration::from_secs(5),
        );
        link.start();
        wait_for_state(link.subscribe_state(), LinkState::Ready).await;
        let pipeline_task = tokio::spawn(pipeline.run(stop_rx));

        Self {
            link,
            commands_tx,
            forwarded_tx,
            telemetry_rx,
            responses_rx,
            raw_rx,
            stop_tx,
            pipeline_task,
        }
    }

    async fn next_response(&mut self) -> ResponseEnvelope {
        time::timeout(Duration::from_secs(5), self.responses_rx.recv())
            .await
            .expect("no response")
            .unwrap()
    }

    async fn stop(mut self) {
        self.stop_tx.send_replace(true);
        self.link.stop().await;
        self.pipeline_task.await.unwrap();
    }
}

/// Records every publish
#[derive(Default)]
struct RecordingTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl BusTransport for RecordingTransport {
    fn subscribe(&self, _topic: &str, _qos: QoS) -> Result<(), BusError> {
        Ok(())
    }

    fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), BusError> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

async fn wait_for_state(mut state_rx: watch::Receiver<LinkState>, wanted: LinkState) {
    time::timeout(Duration::from_secs(5), async {
        while *state_rx.borrow_and_update() != wanted {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("link never reached the expected state");
}

#[tokio::test]
async fn test_polls_become_telemetry() {
    let mut rig = Rig::start().await;

    let scheduler = CommandScheduler::new(
        SchedulerConfig {
            interval: Duration::from_millis(100),
            command_gap: Duration::from_millis(10),
            pids: vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp],
        },
        rig.commands_tx.clone(),
    )
    .unwrap();
    let scheduler_task = tokio::spawn(scheduler.run(rig.stop_tx.subscribe()));

    let mut metrics = Vec::new();
    while metrics.len() < 3 {
        let record = time::timeout(Duration::from_secs(5), rig.telemetry_rx.recv())
            .await
            .expect("no telemetry")
            .unwrap();
        metrics.push((record.metric, record.value));
    }
    assert_eq!(
        metrics,
        vec![
            ("engine_rpm".to_string(), 1724.0),
            ("vehicle_speed".to_string(), 50.0),
            ("coolant_temperature".to_string(), 50.0),
        ]
    );

    rig.stop_tx.send(true).unwrap();
    scheduler_task.await.unwrap();
    let state_rx = rig.link.subscribe_state();
    rig.stop().await;
    assert_eq!(*state_rx.borrow(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_bus_command_gets_correlated_response() {
    let mut rig = Rig::start().await;

    // A poll nobody waits on is written ahead of the bus commands
    rig.commands_tx.send(Command::new("010A")).await.unwrap();
    for (ticket, command, id) in [(1, "ATRV", "volt"), (2, "0142", "module")] {
        rig.commands_tx
            .send(Command::with_ticket(command, ticket))
            .await
            .unwrap();
        rig.forwarded_tx
            .send(ForwardedCommand {
                ticket,
                command: command.to_string(),
                correlation_id: id.to_string(),
                target: "VIN42".to_string(),
            })
            .await
            .unwrap();
    }

    let volt = rig.next_response().await;
    assert_eq!(volt.target, "VIN42");
    assert_eq!(volt.response.correlation_id, "volt");
    assert_eq!(volt.response.status, ResponseStatus::Success);
    assert_eq!(volt.response.result, serde_json::json!("12.6V"));

    let module = rig.next_response().await;
    assert_eq!(module.response.correlation_id, "module");
    assert_eq!(module.response.status, ResponseStatus::Error);

    // The poll's NO DATA is relayed raw instead of answering ATRV
    let raw = time::timeout(Duration::from_secs(5), rig.raw_rx.recv())
        .await
        .expect("no raw frame")
        .unwrap();
    assert_eq!(raw.text(), "NO DATA");
    assert!(rig.raw_rx.try_recv().is_err());

    rig.stop().await;
}

#[tokio::test]
async fn test_plain_bus_command_answer_reaches_response_topic() {
    let mut rig = Rig::start().await;
    let transport = Arc::new(RecordingTransport::default());
    let config = BusConfig {
        client_id: "test".to_string(),
        ..BusConfig::default()
    };
    let dispatcher = Dispatcher::new(
        transport.clone(),
        &config,
        Arc::new(AtomicBool::new(true)),
        rig.commands_tx.clone(),
        rig.forwarded_tx.clone(),
    );

    // Base64 of "ATRV", no JSON envelope and so no correlation id
    dispatcher
        .handle(BusEvent::MessageReceived {
            topic: "car/command/VIN7/request".to_string(),
            payload: b"QVRSVg==".to_vec(),
        })
        .await;

    let envelope = rig.next_response().await;
    assert_eq!(envelope.target, "VIN7");
    assert_eq!(envelope.response.correlation_id, "");
    assert_eq!(envelope.response.status, ResponseStatus::Success);
    assert_eq!(envelope.response.result, serde_json::json!("12.6V"));
    assert!(rig.raw_rx.try_recv().is_err());
    // Only failures are published by the dispatcher itself
    assert!(transport.published.lock().unwrap().is_empty());

    rig.stop().await;
}

#[tokio::test]
async fn test_bridge_runs_without_broker() {
    let mut config = BridgeConfig::default();
    config.mqtt.broker = "127.0.0.1:1".to_string();
    config.mqtt.data_topic = "car/telemetry".to_string();
    config.mqtt.command_topic = "car/command".to_string();
    config.mqtt.reconnect_delay_ms = 100;
    config.link.reconnect_interval_ms = 200;
    config.link.read_timeout_ms = 200;
    config.link.init_delay_ms = 0;
    config.link.init_settle_ms = 0;
    config.scheduler.interval_ms = 100;
    let config = config.validated().unwrap();

    let bridge = Bridge::start(&config, SimulatedAdapter).unwrap();
    wait_for_state(bridge.subscribe_link_state(), LinkState::Ready).await;
    assert!(!bridge.is_bus_connected());

    // Polls keep reaching the device while the broker is unreachable
    time::sleep(Duration::from_millis(300)).await;
    assert!(bridge.link_stats().commands_written > 0);

    time::timeout(Duration::from_secs(5), bridge.shutdown())
        .await
        .expect("shutdown hung");
}
