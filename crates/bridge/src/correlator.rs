//! Command correlation
//!
//! The adapter answers one command at a time, in the order the commands were
//! written. The correlator mirrors that order: every written command is kept
//! in flight and each frame answers the oldest one. Bus commands carry a
//! ticket linking their slot to the waiting [`ForwardedCommand`]; scheduled
//! polls carry none.
//!
//! A frame lost on a full channel or a reconnect puts the queue out of step
//! with the device. A telemetry frame skips ahead to the oldest slot polling
//! its PID, slots older than the response timeout are dropped, and
//! [`Correlator::reset`] empties the queue when the link goes down.

use cloud_sync::{CommandResponse, ForwardedCommand, ResponseEnvelope};
use obd_protocol::{classify, mode, Command, RawFrame, TelemetryRecord};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a frame turned out to answer
#[derive(Debug, PartialEq)]
pub enum Answer {
    /// A bus command. No response yet when its registration has not arrived.
    Claimed(Option<ResponseEnvelope>),
    /// A scheduled poll, or nothing was in flight
    Unclaimed,
}

enum Outcome {
    Success(Value),
    Failed(String),
}

/// A written command awaiting its frame
struct InFlight {
    ticket: Option<u64>,
    /// PID whose telemetry answers this command
    expected_pid: Option<String>,
    written_at: Instant,
}

struct Waiting {
    command: ForwardedCommand,
    deadline: Instant,
}

/// Answer that arrived before the command's registration
struct Held {
    outcome: Outcome,
    at: Instant,
}

/// Pairs adapter frames with the commands they answer
pub struct Correlator {
    in_flight: VecDeque<InFlight>,
    waiting: HashMap<u64, Waiting>,
    held: HashMap<u64, Held>,
    timeout: Duration,
}

/// PID polled by a current-data command such as `010C` or `01 0c`
fn expected_pid(command: &str) -> Option<String> {
    let compact: String = command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    let pid = compact.strip_prefix(&format!("{:02X}", mode::CURRENT_DATA))?;
    if pid.len() == 2 && pid.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(pid.to_string())
    } else {
        None
    }
}

fn respond(command: ForwardedCommand, outcome: Outcome) -> ResponseEnvelope {
    let response = match outcome {
        Outcome::Success(result) => CommandResponse::success(command.correlation_id, result),
        Outcome::Failed(error) => CommandResponse::error(command.correlation_id, error),
    };
    ResponseEnvelope {
        target: command.target,
        response,
    }
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            in_flight: VecDeque::new(),
            waiting: HashMap::new(),
            held: HashMap::new(),
            timeout,
        }
    }

    /// Record a command the link has written
    pub fn written(&mut self, command: Command) {
        self.in_flight.push_back(InFlight {
            expected_pid: expected_pid(&command.text),
            ticket: command.ticket,
            written_at: Instant::now(),
        });
    }

    /// Start waiting for the answer to a bus command. Returns the response at
    /// once when the answer is already in.
    pub fn register(&mut self, command: ForwardedCommand) -> Option<ResponseEnvelope> {
        if let Some(held) = self.held.remove(&command.ticket) {
            return Some(respond(command, held.outcome));
        }
        debug!(
            "Awaiting response to {} (correlation_id: {}, ticket: {})",
            command.command, command.correlation_id, command.ticket
        );
        self.waiting.insert(
            command.ticket,
            Waiting {
                deadline: Instant::now() + self.timeout,
                command,
            },
        );
        None
    }

    /// Match a frame, already parsed into `records`, to the command it answers
    pub fn on_frame(&mut self, frame: &RawFrame, records: &[TelemetryRecord]) -> Answer {
        let slot = match records.first() {
            Some(record) => self.take_for_pid(&record.pid),
            None => self.in_flight.pop_front(),
        };
        let Some(InFlight {
            ticket: Some(ticket),
            expected_pid,
            ..
        }) = slot
        else {
            return Answer::Unclaimed;
        };

        let matching = expected_pid
            .as_deref()
            .and_then(|pid| records.iter().find(|record| record.pid == pid));
        let outcome = match matching {
            Some(record) => Outcome::Success(serde_json::to_value(record).unwrap_or_else(|e| {
                warn!("Failed to encode telemetry for response: {}", e);
                Value::String(record.raw.clone())
            })),
            None => {
                let status = classify(&frame.text());
                if status.is_error() {
                    Outcome::Failed(status.describe())
                } else {
                    Outcome::Success(Value::String(frame.to_bus_text().0))
                }
            }
        };

        Answer::Claimed(self.complete(ticket, outcome))
    }

    /// The oldest slot polling `pid`, skipping slots whose frames were lost.
    /// Falls back to the oldest slot when none polls it.
    fn take_for_pid(&mut self, pid: &str) -> Option<InFlight> {
        let index = self
            .in_flight
            .iter()
            .position(|slot| slot.expected_pid.as_deref() == Some(pid))
            .unwrap_or(0);
        if index > 0 {
            debug!("Skipping {} in-flight commands with no answer", index);
            self.in_flight.drain(..index);
        }
        self.in_flight.pop_front()
    }

    fn complete(&mut self, ticket: u64, outcome: Outcome) -> Option<ResponseEnvelope> {
        match self.waiting.remove(&ticket) {
            Some(waiting) => Some(respond(waiting.command, outcome)),
            None => {
                self.held.insert(
                    ticket,
                    Held {
                        outcome,
                        at: Instant::now(),
                    },
                );
                None
            }
        }
    }

    /// Forget every in-flight command after the link went down. Bus commands
    /// among them fail.
    pub fn reset(&mut self) -> Vec<ResponseEnvelope> {
        let tickets: Vec<u64> = self.in_flight.drain(..).filter_map(|slot| slot.ticket).collect();
        if !tickets.is_empty() {
            warn!("Link lost with {} bus commands unanswered", tickets.len());
        }
        tickets
            .into_iter()
            .filter_map(|ticket| {
                self.complete(
                    ticket,
                    Outcome::Failed("device connection lost before the answer".to_string()),
                )
            })
            .collect()
    }

    /// Time out every bus command whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<ResponseEnvelope> {
        let timeout = self.timeout;
        self.in_flight.retain(|slot| slot.written_at + timeout > now);
        self.held.retain(|_, held| held.at + timeout > now);

        let expired: Vec<u64> = self
            .waiting
            .iter()
            .filter(|(_, waiting)| waiting.deadline <= now)
            .map(|(ticket, _)| *ticket)
            .collect();

        let mut responses: Vec<(Instant, ResponseEnvelope)> = expired
            .into_iter()
            .filter_map(|ticket| self.waiting.remove(&ticket))
            .map(|Waiting { command, deadline }| {
                warn!(
                    "No response to {} within {:?} (correlation_id: {})",
                    command.command, timeout, command.correlation_id
                );
                let envelope = ResponseEnvelope {
                    target: command.target,
                    response: CommandResponse::timeout(
                        command.correlation_id,
                        format!("no response within {}ms", timeout.as_millis()),
                    ),
                };
                (deadline, envelope)
            })
            .collect();
        responses.sort_by_key(|(deadline, _)| *deadline);
        responses.into_iter().map(|(_, envelope)| envelope).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_sync::ResponseStatus;
    use obd_protocol::parse_response;

    fn forwarded(ticket: u64, command: &str, id: &str) -> ForwardedCommand {
        ForwardedCommand {
            ticket,
            command: command.to_string(),
            correlation_id: id.to_string(),
            target: "VIN1".to_string(),
        }
    }

    /// Write and register a bus command
    fn send(correlator: &mut Correlator, ticket: u64, command: &str, id: &str) {
        correlator.written(Command::with_ticket(command, ticket));
        assert!(correlator.register(forwarded(ticket, command, id)).is_none());
    }

    fn answer(correlator: &mut Correlator, text: &str) -> Answer {
        let records: Vec<TelemetryRecord> = parse_response(text).into_iter().collect();
        correlator.on_frame(&RawFrame::new(text), &records)
    }

    fn response(answer: Answer) -> ResponseEnvelope {
        match answer {
            Answer::Claimed(Some(envelope)) => envelope,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_expected_pid() {
        assert_eq!(expected_pid("010C").as_deref(), Some("0C"));
        assert_eq!(expected_pid("01 0d").as_deref(), Some("0D"));
        assert_eq!(expected_pid("ATZ"), None);
        assert_eq!(expected_pid("03"), None);
        assert_eq!(expected_pid("0902"), None);
        assert_eq!(expected_pid("010C1"), None);
    }

    #[tokio::test]
    async fn test_poll_answer_leaves_bus_command_waiting() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        correlator.written(Command::new("010A"));
        send(&mut correlator, 1, "ATRV", "volt");

        // NO DATA answers the poll written first
        assert_eq!(answer(&mut correlator, "NO DATA"), Answer::Unclaimed);

        let volt = response(answer(&mut correlator, "12.6V"));
        assert_eq!(volt.response.correlation_id, "volt");
        assert_eq!(volt.response.status, ResponseStatus::Success);
        assert_eq!(volt.response.result, serde_json::json!("12.6V"));
        assert!(correlator.in_flight.is_empty());
        assert!(correlator.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_frames_answer_commands_in_write_order() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        send(&mut correlator, 1, "010C", "rpm");
        send(&mut correlator, 2, "ATRV", "voltage");
        send(&mut correlator, 3, "ATDP", "protocol");

        let rpm = response(answer(&mut correlator, "41 0C 1A F0"));
        assert_eq!(rpm.target, "VIN1");
        assert_eq!(rpm.response.correlation_id, "rpm");
        assert_eq!(rpm.response.result["value"], 1724.0);

        let voltage = response(answer(&mut correlator, "12.6V"));
        assert_eq!(voltage.response.correlation_id, "voltage");

        let protocol = response(answer(&mut correlator, "NO DATA"));
        assert_eq!(protocol.response.correlation_id, "protocol");
        assert_eq!(protocol.response.status, ResponseStatus::Error);
        assert!(protocol.response.error.is_some());

        assert_eq!(answer(&mut correlator, "OK"), Answer::Unclaimed);
    }

    #[tokio::test]
    async fn test_mode_01_command_answered_by_no_data_fails() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        send(&mut correlator, 1, "0142", "module");

        let module = response(answer(&mut correlator, "SEARCHING...\rNO DATA"));
        assert_eq!(module.response.status, ResponseStatus::Error);
        assert_eq!(module.response.correlation_id, "module");
    }

    #[tokio::test]
    async fn test_telemetry_skips_slots_whose_frames_were_lost() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        correlator.written(Command::new("010D"));
        send(&mut correlator, 1, "010C", "rpm");
        correlator.written(Command::new("0105"));

        let rpm = response(answer(&mut correlator, "41 0C 1A F0"));
        assert_eq!(rpm.response.correlation_id, "rpm");
        assert_eq!(correlator.in_flight.len(), 1);
        assert_eq!(answer(&mut correlator, "41 05 5A"), Answer::Unclaimed);
    }

    #[tokio::test]
    async fn test_answer_held_until_registration() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        correlator.written(Command::with_ticket("ATI", 4));
        assert_eq!(answer(&mut correlator, "ELM327 v1.5"), Answer::Claimed(None));

        let envelope = correlator.register(forwarded(4, "ATI", "id")).unwrap();
        assert_eq!(envelope.response.result, serde_json::json!("ELM327 v1.5"));
        assert!(correlator.held.is_empty());
        assert!(correlator.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_binary_frame_result_is_base64() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        send(&mut correlator, 1, "STDI", "raw");
        let envelope = response(correlator.on_frame(&RawFrame::new(vec![0x01, 0xFF]), &[]));
        assert_eq!(envelope.response.result, serde_json::json!("Af8="));
    }

    #[tokio::test]
    async fn test_reset_fails_in_flight_bus_commands() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        correlator.written(Command::new("010C"));
        send(&mut correlator, 1, "ATRV", "volt");

        let failed = correlator.reset();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].response.correlation_id, "volt");
        assert_eq!(failed[0].response.status, ResponseStatus::Error);

        // Frames after the reconnect match nothing stale
        assert_eq!(answer(&mut correlator, "12.6V"), Answer::Unclaimed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_times_out_waiting_commands() {
        let mut correlator = Correlator::new(Duration::from_secs(5));
        send(&mut correlator, 1, "0142", "module");
        tokio::time::advance(Duration::from_secs(2)).await;
        send(&mut correlator, 2, "ATRV", "voltage");

        assert!(correlator.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        let expired = correlator.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].response.correlation_id, "module");
        assert_eq!(expired[0].response.status, ResponseStatus::Timeout);
        assert_eq!(expired[0].target, "VIN1");
        assert_eq!(correlator.in_flight.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(correlator.expire(Instant::now()).len(), 1);
        assert!(correlator.waiting.is_empty());
        assert!(correlator.in_flight.is_empty());
    }
}
