use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::CoreError;

/// Output channel of a job or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub const BOTH: [Channel; 2] = [Channel::Stdout, Channel::Stderr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Channel::Stdout),
            "stderr" => Ok(Channel::Stderr),
            other => Err(CoreError::InvalidRequest(format!("unknown channel: {other}"))),
        }
    }
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

impl LogLine {
    /// Split a runtime line of the form `<rfc3339> <text>`. Lines without a
    /// parseable timestamp prefix are kept whole.
    pub fn from_timestamped(channel: Channel, raw: &str) -> Self {
        if let Some((head, rest)) = raw.split_once(' ') {
            if let Ok(ts) = DateTime::parse_from_rfc3339(head) {
                return Self {
                    channel,
                    timestamp: Some(ts.with_timezone(&Utc)),
                    text: rest.to_string(),
                };
            }
        }
        Self {
            channel,
            timestamp: None,
            text: raw.to_string(),
        }
    }
}
