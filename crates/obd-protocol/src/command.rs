//! Commands queued for the adapter

/// One command for the link's write loop.
///
/// The adapter answers commands strictly in the order they are written. A
/// sender that wants the answer sets a ticket and watches the write reports
/// to learn where its command sits in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command text without the trailing carriage return
    pub text: String,
    pub ticket: Option<u64>,
}

impl Command {
    /// A command nobody waits on, such as a scheduled poll
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ticket: None,
        }
    }

    pub fn with_ticket(text: impl Into<String>, ticket: u64) -> Self {
        Self {
            text: text.into(),
            ticket: Some(ticket),
        }
    }
}
