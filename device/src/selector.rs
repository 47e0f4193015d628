use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::probe::TransportProbe;
use crate::types::{Transport, TransportState};

/// Wi-Fi when usable, else LoRa when usable, else nothing.
pub fn select_transport(state: &TransportState) -> Option<Transport> {
    if state.wifi_usable() {
        Some(Transport::Wifi)
    } else if state.lora_usable() {
        Some(Transport::Lora)
    } else {
        None
    }
}

/// What a health check found and did.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct HealthReport {
    pub wifi_usable: bool,
    pub lora_usable: bool,
    /// `Some` when a reconnect was attempted, with its outcome.
    pub wifi_reestablished: Option<bool>,
    pub lora_reestablished: Option<bool>,
    pub technology: Option<Transport>,
}

/// Chooses the active transport and brings dropped links back.
///
/// Every reconnect is a single bounded attempt; retrying is left to the next
/// scheduled run.
pub struct TransportSelector<'a> {
    probe: TransportProbe<'a>,
}

impl<'a> TransportSelector<'a> {
    pub fn new(probe: TransportProbe<'a>) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &TransportProbe<'a> {
        &self.probe
    }

    pub fn current_state(&self) -> Result<TransportState> {
        self.probe.store.load_state()
    }

    pub fn active_transport(&self) -> Result<Option<Transport>> {
        Ok(select_transport(&self.current_state()?))
    }

    /// Re-derives the transport from the stored flags and persists it. When
    /// neither transport is usable the previous choice is kept.
    pub fn decide_upload_technology(&self) -> Result<Option<Transport>> {
        let chosen = self.active_transport()?;
        match chosen {
            Some(technology) => self.probe.store.set_upload_technology(technology)?,
            None => warn!("No usable transport; keeping previous upload technology"),
        }
        Ok(chosen)
    }

    pub async fn reestablish_wifi(&self) -> Result<bool> {
        let iface = &self.probe.upload_interface;
        info!(interface = %iface, "Restarting upload interface");
        if let Err(e) = self.probe.wifi.cycle_interface(iface).await {
            warn!(interface = %iface, error = %e, "Interface restart failed");
        }

        let connected = self.probe.probe_wifi_connection().await?;
        if connected {
            self.decide_upload_technology()?;
        }
        Ok(connected)
    }

    pub async fn reestablish_lora(&self) -> Result<bool> {
        info!("Rejoining LoRaWAN network");
        let joined = match self.probe.modem.join().await {
            Ok(joined) => joined,
            Err(e) => {
                warn!(error = %e, "LoRaWAN join attempt failed");
                false
            }
        };
        self.probe.store.set_lora_connected(joined)?;
        if joined {
            self.decide_upload_technology()?;
        }
        Ok(joined)
    }

    /// One pass of the periodic transport check: probe both links, try one
    /// reconnect for each that is present but down, then persist the choice.
    ///
    /// The modem probe is a hard reset, which ends any LoRaWAN session, so a
    /// present modem is always rejoined afterwards.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let mut report = HealthReport::default();

        report.wifi_usable = self.probe.probe_wifi().await?;
        if !report.wifi_usable && self.current_state()?.wifi_available {
            let ok = self.reestablish_wifi().await?;
            report.wifi_reestablished = Some(ok);
            report.wifi_usable = ok;
        }

        if self.probe.probe_lora().await? {
            let ok = self.reestablish_lora().await?;
            report.lora_reestablished = Some(ok);
            report.lora_usable = ok;
        }

        report.technology = self.decide_upload_technology()?;
        info!(?report, "Transport health check complete");
        Ok(report)
    }
}
