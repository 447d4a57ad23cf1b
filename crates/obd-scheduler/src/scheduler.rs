//! Command Scheduler Implementation

use obd_protocol::{Command, Pid};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("no PIDs configured for polling")]
    EmptyPidList,

    #[error("PID {0:?} has no registered decoder")]
    InvalidPid(String),
}

/// Configuration for the command scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Time between polling rounds (default: 5s)
    pub interval: Duration,
    /// Pause between successive commands within a round
    pub command_gap: Duration,
    /// PIDs polled every round, in order
    pub pids: Vec<Pid>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            command_gap: Duration::from_millis(100),
            pids: vec![
                Pid::Rpm,
                Pid::Speed,
                Pid::CoolantTemp,
                Pid::IntakeAirTemp,
                Pid::ThrottlePosition,
                Pid::EngineLoad,
                Pid::FuelLevel,
                Pid::FuelPressure,
                Pid::IntakeManifoldPressure,
                Pid::BarometricPressure,
            ],
        }
    }
}

impl SchedulerConfig {
    /// Resolve two-hex-digit PID codes against the decoder table
    pub fn pids_from_codes<S: AsRef<str>>(codes: &[S]) -> Result<Vec<Pid>, SchedulerError> {
        if codes.is_empty() {
            return Err(SchedulerError::EmptyPidList);
        }
        codes
            .iter()
            .map(|code| {
                let code = code.as_ref();
                Pid::from_hex(code).ok_or_else(|| SchedulerError::InvalidPid(code.to_string()))
            })
            .collect()
    }
}

/// Outcome of one polling round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Commands placed on the channel
    pub sent: usize,
    /// Polls skipped because the channel was full or closed
    pub dropped: usize,
    /// The receiving side has gone away
    pub closed: bool,
}

/// Emits one polling command per configured PID on every tick
pub struct CommandScheduler {
    config: SchedulerConfig,
    commands_tx: mpsc::Sender<Command>,
}

impl CommandScheduler {
    pub fn new(
        config: SchedulerConfig,
        commands_tx: mpsc::Sender<Command>,
    ) -> Result<Self, SchedulerError> {
        if config.pids.is_empty() {
            return Err(SchedulerError::EmptyPidList);
        }
        info!("Command scheduler created with {} PIDs", config.pids.len());
        Ok(Self {
            config,
            commands_tx,
        })
    }

    /// Run one polling round. Never blocks on the channel; skipped polls are
    /// reported in a single warning for the whole round.
    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut skipped = Vec::new();

        for (i, pid) in self.config.pids.iter().enumerate() {
            if i > 0 && !self.config.command_gap.is_zero() {
                time::sleep(self.config.command_gap).await;
            }

            let command = Command::new(pid.poll_command());
            match self.commands_tx.try_send(command) {
                Ok(()) => {
                    report.sent += 1;
                    debug!("Queued poll for PID {}", pid.code());
                }
                Err(mpsc::error::TrySendError::Full(command)) => {
                    report.dropped += 1;
                    skipped.push(command.text);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.dropped += self.config.pids.len() - i;
                    report.closed = true;
                    break;
                }
            }
        }

        if report.closed {
            warn!("Commands channel closed, polling round abandoned");
        } else if !skipped.is_empty() {
            metrics::counter!("obd_polls_dropped_total").increment(skipped.len() as u64);
            warn!(
                "Commands channel is full, skipped {} of {} polls: {}",
                skipped.len(),
                self.config.pids.len(),
                skipped.join(" ")
            );
        }

        report
    }

    /// Run the scheduler loop until the stop signal is raised
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        info!(
            "Starting command scheduler, interval {:?}",
            self.config.interval
        );

        let mut ticker = time::interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            let report = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                report = self.run_tick() => report,
            };

            if report.closed {
                break;
            }
        }

        info!("Command scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Counts WARN events
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn config(pids: Vec<Pid>) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(5),
            command_gap: Duration::from_millis(100),
            pids,
        }
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.pids.len(), 10);
        assert_eq!(config.pids[0], Pid::Rpm);
    }

    #[test]
    fn test_pids_from_codes() {
        let pids = SchedulerConfig::pids_from_codes(&["0C", "0d"][..]).unwrap();
        assert_eq!(pids, vec![Pid::Rpm, Pid::Speed]);
        assert_eq!(
            SchedulerConfig::pids_from_codes(&["0C", "FF"][..]),
            Err(SchedulerError::InvalidPid("FF".to_string()))
        );
        assert_eq!(
            SchedulerConfig::pids_from_codes::<&str>(&[]),
            Err(SchedulerError::EmptyPidList)
        );
    }

    #[test]
    fn test_empty_pid_list_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            CommandScheduler::new(config(vec![]), tx),
            Err(SchedulerError::EmptyPidList)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_emits_commands_in_order_with_gap() {
        let (tx, mut rx) = mpsc::channel(16);
        let scheduler =
            CommandScheduler::new(config(vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp]), tx).unwrap();

        let started = Instant::now();
        let report = scheduler.run_tick().await;
        assert_eq!(report, TickReport { sent: 3, dropped: 0, closed: false });
        assert_eq!(started.elapsed(), Duration::from_millis(200));

        assert_eq!(rx.recv().await.unwrap().text, "010C");
        assert_eq!(rx.recv().await.unwrap().text, "010D");
        assert_eq!(rx.recv().await.unwrap().text, "0105");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_does_not_block_tick() {
        let (tx, mut rx) = mpsc::channel(1);
        let scheduler =
            CommandScheduler::new(config(vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp]), tx).unwrap();

        let report = time::timeout(Duration::from_secs(1), scheduler.run_tick())
            .await
            .expect("tick blocked on a full channel");
        assert_eq!(report, TickReport { sent: 1, dropped: 2, closed: false });
        assert_eq!(rx.recv().await.unwrap().text, "010C");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_warns_once_per_tick() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (tx, _rx) = mpsc::channel(1);
        let scheduler = CommandScheduler::new(
            config(vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp, Pid::EngineLoad]),
            tx,
        )
        .unwrap();

        assert_eq!(scheduler.run_tick().await.dropped, 3);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);

        // Channel still full: every poll skipped, still one warning
        assert_eq!(scheduler.run_tick().await.dropped, 4);
        assert_eq!(warnings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_abandons_round() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let scheduler = CommandScheduler::new(config(vec![Pid::Rpm, Pid::Speed]), tx).unwrap();
        let report = scheduler.run_tick().await;
        assert_eq!(report, TickReport { sent: 0, dropped: 2, closed: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_each_interval_until_stopped() {
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = CommandScheduler::new(config(vec![Pid::Rpm]), tx).unwrap();
        let task = tokio::spawn(scheduler.run(stop_rx));

        let started = Instant::now();
        assert_eq!(rx.recv().await.unwrap().text, "010C");
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(rx.recv().await.unwrap().text, "010C");
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
