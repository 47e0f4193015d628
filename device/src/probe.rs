//! Best-effort reachability checks that keep the persisted transport state
//! current. A probe never fails because its driver misbehaves; it records the
//! transport as down instead. Only store errors are returned.

use tracing::{info, warn};

use crate::error::Result;
use crate::modem::LoraModem;
use crate::storage::TransportStateStore;
use crate::wifi::{has_address_lease, WifiDriver};

pub struct TransportProbe<'a> {
    pub(crate) store: &'a dyn TransportStateStore,
    pub(crate) wifi: &'a dyn WifiDriver,
    pub(crate) modem: &'a dyn LoraModem,
    pub(crate) upload_interface: String,
}

impl<'a> TransportProbe<'a> {
    pub fn new(
        store: &'a dyn TransportStateStore,
        wifi: &'a dyn WifiDriver,
        modem: &'a dyn LoraModem,
        upload_interface: impl Into<String>,
    ) -> Self {
        Self {
            store,
            wifi,
            modem,
            upload_interface: upload_interface.into(),
        }
    }

    /// Loopback check plus lease heuristic; both results are persisted.
    pub async fn probe_wifi(&self) -> Result<bool> {
        let available = match self.wifi.loopback_reachable().await {
            Ok(reachable) => reachable,
            Err(e) => {
                warn!(error = %e, "Wi-Fi driver unreachable");
                self.store.set_wifi_available(false)?;
                self.store.set_wifi_connected(false)?;
                return Ok(false);
            }
        };
        self.store.set_wifi_available(available)?;

        let connected = self.probe_wifi_connection().await?;
        info!(available, connected, "Wi-Fi probed");
        Ok(available && connected)
    }

    /// Lease heuristic only.
    pub async fn probe_wifi_connection(&self) -> Result<bool> {
        let connected = match self.wifi.interface_addresses().await {
            Ok(interfaces) => has_address_lease(&interfaces),
            Err(e) => {
                warn!(error = %e, "Could not list network interfaces");
                false
            }
        };
        self.store.set_wifi_connected(connected)?;
        Ok(connected)
    }

    /// Hardware reset of the modem. A confirmed reset marks LoRa available;
    /// the join state is left to [`Self::probe_lora_connection`].
    pub async fn probe_lora(&self) -> Result<bool> {
        match self.modem.hard_reset().await {
            Ok(available) => {
                self.store.set_lora_available(available)?;
                info!(available, "LoRa modem probed");
                Ok(available)
            }
            Err(e) => {
                warn!(error = %e, "LoRa modem unreachable");
                self.store.set_lora_available(false)?;
                self.store.set_lora_connected(false)?;
                Ok(false)
            }
        }
    }

    pub async fn probe_lora_connection(&self) -> Result<bool> {
        let connected = match self.modem.check_connection().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(error = %e, "LoRa connection check failed");
                false
            }
        };
        self.store.set_lora_connected(connected)?;
        Ok(connected)
    }
}
