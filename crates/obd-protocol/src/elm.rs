//! ELM327 status lines
//!
//! Besides mode responses, the adapter answers with a small set of fixed
//! status strings. Classifying them lets callers tell a plain acknowledgement
//! from an adapter-side failure.

/// Prefix the adapter prints while auto-detecting the vehicle protocol
const SEARCHING_PREFIX: &str = "SEARCHING...";

/// Recognised adapter status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElmStatus {
    /// `OK`
    Ok,
    /// Identification banner, e.g. `ELM327 v1.5`
    Banner(String),
    /// `NO DATA`
    NoData,
    /// `?`, the adapter did not understand the command
    Unknown,
    /// `ERROR`, `CAN ERROR`, `BUS INIT: ...ERROR`, `UNABLE TO CONNECT`, `STOPPED`
    Error(String),
    /// Anything else
    Other,
}

impl ElmStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, ElmStatus::NoData | ElmStatus::Unknown | ElmStatus::Error(_))
    }

    pub fn describe(&self) -> String {
        match self {
            ElmStatus::Ok => "OK".to_string(),
            ElmStatus::Banner(b) => b.clone(),
            ElmStatus::NoData => "adapter returned NO DATA".to_string(),
            ElmStatus::Unknown => "adapter did not recognise the command".to_string(),
            ElmStatus::Error(e) => format!("adapter error: {}", e),
            ElmStatus::Other => "unrecognised response".to_string(),
        }
    }
}

/// Strip the `SEARCHING...` line the adapter emits before the first answer
pub fn strip_searching(response: &str) -> &str {
    let trimmed = response.trim();
    trimmed
        .strip_prefix(SEARCHING_PREFIX)
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

/// Classify a trimmed response
pub fn classify(response: &str) -> ElmStatus {
    let text = strip_searching(response);
    let upper = text.to_ascii_uppercase();

    match upper.as_str() {
        "OK" => ElmStatus::Ok,
        "NO DATA" => ElmStatus::NoData,
        "?" => ElmStatus::Unknown,
        _ if upper.starts_with("ELM327") => ElmStatus::Banner(text.to_string()),
        _ if upper == "ERROR"
            || upper == "CAN ERROR"
            || upper == "STOPPED"
            || upper == "UNABLE TO CONNECT"
            || (upper.starts_with("BUS INIT") && upper.ends_with("ERROR")) =>
        {
            ElmStatus::Error(text.to_string())
        }
        _ => ElmStatus::Other,
    }
}

/// Returns true when an init response looks like a healthy adapter.
/// Only the last non-empty line counts, so a command echo is ignored.
pub fn is_init_ack(response: &str) -> bool {
    let last = response
        .split(['\r', '\n', '>'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("");
    matches!(classify(last), ElmStatus::Ok | ElmStatus::Banner(_))
}
