//! Uplink delivery for a crowd-counting sensor.
//!
//! Each run reports one measurement over Wi-Fi/MQTT when the link is up,
//! falls back to a LoRaWAN modem, and otherwise parks the measurement in a
//! SQLite-backed retry queue that is drained after the next successful
//! publish. Downlinks received over LoRa are reassembled and dispatched as
//! sensor commands.

pub mod actions;
pub mod config;
pub mod downlink;
pub mod error;
pub mod logging;
pub mod modem;
pub mod net;
pub mod probe;
pub mod selector;
pub mod storage;
pub mod types;
pub mod uplink;
pub mod wifi;

pub use config::Config;
pub use downlink::{CommandHandler, DownlinkProtocol, SegmentStore};
pub use error::{Result, UplinkError};
pub use probe::TransportProbe;
pub use selector::{select_transport, HealthReport, TransportSelector};
pub use storage::{RetryQueueStore, SqliteStore, TransportStateStore};
pub use types::{Command, Measurement, Transport, TransportState};
pub use uplink::{CycleOutcome, UplinkPublisher};
