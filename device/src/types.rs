use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// One reporting cycle's device count.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Epoch seconds.
    pub timestamp: i64,
    pub count: u64,
}

impl Measurement {
    pub fn new(timestamp: i64, count: u64) -> Self {
        Self { timestamp, count }
    }

    pub fn now(count: u64) -> Self {
        Self::new(Utc::now().timestamp(), count)
    }
}

/// A queued measurement together with its position in the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: i64,
    pub measurement: Measurement,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Wifi,
    Lora,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Lora => "lora",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Ok(Self::Wifi),
            "lora" => Ok(Self::Lora),
            other => Err(format!("unknown upload technology '{other}'")),
        }
    }
}

/// Last known reachability of both transports.
///
/// `connected` and `available` are written independently; nothing guarantees
/// `connected => available`, so readers must check both.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportState {
    pub wifi_available: bool,
    pub wifi_connected: bool,
    pub lora_available: bool,
    pub lora_connected: bool,
    pub last_update: Option<DateTime<Utc>>,
}

impl TransportState {
    pub fn wifi_usable(&self) -> bool {
        self.wifi_available && self.wifi_connected
    }

    pub fn lora_usable(&self) -> bool {
        self.lora_available && self.lora_connected
    }
}

// Published on the numdetections topic
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DetectionPayload {
    pub timestamp: i64,
    pub devices_detected: u64,
}

impl From<&Measurement> for DetectionPayload {
    fn from(m: &Measurement) -> Self {
        Self {
            timestamp: m.timestamp,
            devices_detected: m.count,
        }
    }
}

// Published on the sensorLocation topic
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
}

/// A decoded downlink command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reboot,
    Activate,
    Disable,
    UpdateConfig(String),
    UpdateDefaults(String),
    DeleteConfig(String),
    RebootTarget(String),
}
