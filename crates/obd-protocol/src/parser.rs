//! ELM327 Response Parser
//!
//! Turns one delimited response such as `41 0C 1A F0` into a typed
//! [`TelemetryRecord`]. Parsing holds no state and may run concurrently.

use crate::error::ParseError;
use crate::pid::Pid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Mode response codes begin with this digit (0x40 + service)
const MODE_RESPONSE_PREFIX: char = '4';

/// Shortest acceptable response, e.g. `41 0C`
const MIN_RESPONSE_LEN: usize = 5;

/// One decoded telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Two uppercase hex digits, e.g. `0C`
    pub pid: String,
    /// Canonical metric name, e.g. `engine_rpm`
    pub metric: String,
    /// Decoded value
    pub value: f64,
    /// Unit string
    pub unit: String,
    /// When the frame was parsed
    pub timestamp: DateTime<Utc>,
    /// The response text the record was decoded from
    pub raw: String,
}

/// Parse a response, stamping it with the current time
pub fn parse_response(response: &str) -> Result<TelemetryRecord, ParseError> {
    parse_response_at(response, Utc::now())
}

/// Parse a response with an explicit timestamp
pub fn parse_response_at(
    response: &str,
    timestamp: DateTime<Utc>,
) -> Result<TelemetryRecord, ParseError> {
    let response = response.trim();

    if response.len() < MIN_RESPONSE_LEN || !response.starts_with(MODE_RESPONSE_PREFIX) {
        return Err(ParseError::InvalidFormat(response.to_string()));
    }

    let parts: Vec<&str> = response.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ParseError::TooShort(response.to_string()));
    }

    let echo = parts[0];
    let pid_code = parts[1];

    if !is_hex_pair(echo) || !echo.starts_with(MODE_RESPONSE_PREFIX) {
        return Err(ParseError::InvalidEcho(echo.to_string()));
    }

    if !is_hex_pair(pid_code) {
        return Err(ParseError::InvalidPid(pid_code.to_string()));
    }

    let data = parts[2..]
        .iter()
        .map(|part| parse_data_byte(part))
        .collect::<Result<Vec<u8>, ParseError>>()?;

    let pid = Pid::from_hex(pid_code)
        .ok_or_else(|| crate::error::DecodeError::UnsupportedPid(pid_code.to_uppercase()))?;
    let value = pid.decode(&data)?;

    debug!("Parsed telemetry: {} = {:.2} {}", pid.metric_name(), value, pid.unit());

    Ok(TelemetryRecord {
        pid: pid.code(),
        metric: pid.metric_name().to_string(),
        value,
        unit: pid.unit().to_string(),
        timestamp,
        raw: response.to_string(),
    })
}

fn is_hex_pair(token: &str) -> bool {
    token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_data_byte(token: &str) -> Result<u8, ParseError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidData(token.to_string()));
    }
    u8::from_str_radix(token, 16).map_err(|_| ParseError::InvalidData(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    #[test]
    fn test_parse_rpm() {
        let record = parse_response("41 0C 1A F0").unwrap();
        assert_eq!(record.pid, "0C");
        assert_eq!(record.metric, "engine_rpm");
        assert_eq!(record.value, 1724.0);
        assert_eq!(record.unit, "rpm");
        assert_eq!(record.raw, "41 0C 1A F0");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let record = parse_response("\r\n41 0D 32 \r\r").unwrap();
        assert_eq!(record.metric, "vehicle_speed");
        assert_eq!(record.value, 50.0);
        assert_eq!(record.raw, "41 0D 32");
    }

    #[test]
    fn test_parse_lowercase_hex() {
        let record = parse_response("41 0c 1a f0").unwrap();
        assert_eq!(record.pid, "0C");
        assert_eq!(record.value, 1724.0);
    }

    #[test]
    fn test_invalid_format() {
        assert_eq!(
            parse_response("INVALID"),
            Err(ParseError::InvalidFormat("INVALID".to_string()))
        );
        assert!(matches!(parse_response(""), Err(ParseError::InvalidFormat(_))));
        assert!(matches!(parse_response("NO DATA"), Err(ParseError::InvalidFormat(_))));
    }

    #[test]
    fn test_too_short() {
        assert_eq!(
            parse_response("41 0C"),
            Err(ParseError::TooShort("41 0C".to_string()))
        );
    }

    #[test]
    fn test_invalid_echo() {
        assert!(matches!(parse_response("410 0C 1A"), Err(ParseError::InvalidEcho(_))));
        assert!(matches!(parse_response("4G 0C 1A"), Err(ParseError::InvalidEcho(_))));
    }

    #[test]
    fn test_invalid_pid_token() {
        assert!(matches!(parse_response("41 0CC 1A"), Err(ParseError::InvalidPid(_))));
    }

    #[test]
    fn test_invalid_data() {
        assert_eq!(
            parse_response("41 0C 1A ZZ"),
            Err(ParseError::InvalidData("ZZ".to_string()))
        );
        assert!(matches!(parse_response("41 0C 1A 100"), Err(ParseError::InvalidData(_))));
    }

    #[test]
    fn test_unsupported_pid() {
        assert_eq!(
            parse_response("41 FF 12 34"),
            Err(ParseError::Decode(DecodeError::UnsupportedPid("FF".to_string())))
        );
    }

    #[test]
    fn test_wrong_payload_length() {
        assert!(matches!(
            parse_response("41 0C 1A"),
            Err(ParseError::Decode(DecodeError::PayloadLength { expected: 2, actual: 1, .. }))
        ));
    }

    #[test]
    fn test_explicit_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = parse_response_at("41 05 5A", ts).unwrap();
        assert_eq!(record.timestamp, ts);
        assert_eq!(record.value, 50.0);
    }

    #[test]
    fn test_record_serializes_wire_fields() {
        let record = parse_response("41 0C 1A F0").unwrap();
        let json = serde_json::to_value(&record).unwrap();
        for field in ["pid", "metric", "value", "unit", "timestamp", "raw"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }
}
