//! Topic layout

/// Derives every topic the client publishes or subscribes to from the two
/// configured base topics.
///
/// Nested layout (default):
/// - telemetry: `<data_topic>/<metric>`
/// - commands: `<command_topic>/+/request`
/// - responses: `<command_topic>/<target>/response`
///
/// Flat layout:
/// - telemetry: `<data_topic>`
/// - commands: `<command_topic>`
/// - responses: `<command_topic>/response`
///
/// Raw adapter frames go to `<data_topic>/raw` in both layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    data_topic: String,
    command_topic: String,
    flat: bool,
}

impl Topics {
    pub fn new(data_topic: &str, command_topic: &str, flat: bool) -> Self {
        Self {
            data_topic: data_topic.trim_end_matches('/').to_string(),
            command_topic: command_topic.trim_end_matches('/').to_string(),
            flat,
        }
    }

    /// Topic for one telemetry metric
    pub fn telemetry(&self, metric: &str) -> String {
        if self.flat {
            self.data_topic.clone()
        } else {
            format!("{}/{}", self.data_topic, metric)
        }
    }

    /// Topic for base64 frames that answered no bus command
    pub fn raw(&self) -> String {
        format!("{}/raw", self.data_topic)
    }

    /// Filter subscribed on every connect
    pub fn command_subscription(&self) -> String {
        if self.flat {
            self.command_topic.clone()
        } else {
            format!("{}/+/request", self.command_topic)
        }
    }

    /// Topic for responses addressed to a target
    pub fn response(&self, target: &str) -> String {
        if self.flat {
            format!("{}/response", self.command_topic)
        } else {
            format!("{}/{}/response", self.command_topic, target)
        }
    }

    /// Whether an inbound topic matches the command subscription
    pub fn is_command_topic(&self, topic: &str) -> bool {
        if self.flat {
            topic == self.command_topic
        } else {
            self.target_from_topic(topic).is_some()
        }
    }

    /// Target segment of a nested request topic
    pub fn target_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        if self.flat {
            return None;
        }
        let target = topic
            .strip_prefix(self.command_topic.as_str())?
            .strip_prefix('/')?
            .strip_suffix("/request")?;
        if target.is_empty() || target.contains('/') {
            None
        } else {
            Some(target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_nested_layout() {
        let topics = Topics::new("car/telemetry", "car/command", false);
        assert_eq!(topics.telemetry("engine_rpm"), "car/telemetry/engine_rpm");
        assert_eq!(topics.command_subscription(), "car/command/+/request");
        assert_eq!(topics.response("VIN123"), "car/command/VIN123/response");
        assert_eq!(topics.raw(), "car/telemetry/raw");
    }

    #[test]
    fn test_flat_layout() {
        let topics = Topics::new("obd/data", "obd/cmd/", true);
        assert_eq!(topics.telemetry("engine_rpm"), "obd/data");
        assert_eq!(topics.command_subscription(), "obd/cmd");
        assert_eq!(topics.response("VIN123"), "obd/cmd/response");
        assert_eq!(topics.raw(), "obd/data/raw");
        assert!(topics.is_command_topic("obd/cmd"));
        assert!(!topics.is_command_topic("obd/cmd/response"));
        assert_eq!(topics.target_from_topic("obd/cmd"), None);
    }

    #[test]
    fn test_target_from_request_topic() {
        let topics = Topics::new("car/telemetry", "car/command", false);
        assert_eq!(topics.target_from_topic("car/command/VIN123/request"), Some("VIN123"));
        assert_eq!(topics.target_from_topic("car/command//request"), None);
        assert_eq!(topics.target_from_topic("car/command/a/b/request"), None);
        assert_eq!(topics.target_from_topic("car/command/VIN123/response"), None);
        assert_eq!(topics.target_from_topic("car/commandX/VIN123/request"), None);
        assert!(topics.is_command_topic("car/command/VIN123/request"));
    }

    proptest! {
        #[test]
        fn request_target_is_recovered(target in "[A-Za-z0-9_-]{1,17}") {
            let topics = Topics::new("car/telemetry", "car/command", false);
            let topic = format!("car/command/{}/request", target);
            prop_assert_eq!(topics.target_from_topic(&topic), Some(target.as_str()));
            prop_assert_eq!(
                topics.response(&target),
                format!("car/command/{}/response", target)
            );
        }
    }
}
