//! Side effects of downlink commands on a real sensor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::downlink::CommandHandler;
use crate::error::{Result, UplinkError};

const DELTAS_FILE: &str = "config_deltas.jsonl";
const DETECTION_DISABLED_FLAG: &str = "detection_disabled";

/// One line of the delta spool, consumed by the configuration tool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpooledDelta {
    pub received_at: DateTime<Utc>,
    pub kind: String,
    pub body: String,
}

pub struct SystemCommandHandler {
    spool_dir: PathBuf,
    flag_dir: PathBuf,
    config_file: PathBuf,
}

impl SystemCommandHandler {
    pub fn new(
        spool_dir: impl Into<PathBuf>,
        flag_dir: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            flag_dir: flag_dir.into(),
            config_file: config_file.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.spool_dir(),
            config.data_dir.clone(),
            Config::get_config_file_path(),
        )
    }

    pub fn detection_enabled(&self) -> bool {
        !self.flag_path().exists()
    }

    fn flag_path(&self) -> PathBuf {
        self.flag_dir.join(DETECTION_DISABLED_FLAG)
    }

    fn spool(&self, kind: &str, body: &str) -> Result<()> {
        fs::create_dir_all(&self.spool_dir).map_err(|e| io_error(&self.spool_dir, e))?;
        let path = self.spool_dir.join(DELTAS_FILE);
        let delta = SpooledDelta {
            received_at: Utc::now(),
            kind: kind.to_string(),
            body: body.to_string(),
        };
        let mut line = serde_json::to_string(&delta)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        file.write_all(line.as_bytes()).map_err(|e| io_error(&path, e))?;
        info!(kind, path = %path.display(), "Configuration delta spooled");
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> UplinkError {
    UplinkError::Storage(format!("{}: {e}", path.display()))
}

#[async_trait]
impl CommandHandler for SystemCommandHandler {
    async fn trigger_reboot(&self) -> Result<()> {
        warn!("Rebooting on remote request");
        let status = Command::new("sudo")
            .arg("reboot")
            .status()
            .await
            .map_err(|e| UplinkError::Driver(format!("reboot: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(UplinkError::Driver(format!("reboot exited with {status}")))
        }
    }

    async fn set_detection_enabled(&self, enabled: bool) -> Result<()> {
        let flag = self.flag_path();
        if enabled {
            match fs::remove_file(&flag) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&flag, e)),
            }
        } else {
            fs::create_dir_all(&self.flag_dir).map_err(|e| io_error(&self.flag_dir, e))?;
            fs::write(&flag, Utc::now().to_rfc3339()).map_err(|e| io_error(&flag, e))?;
        }
        info!(enabled, "Detection state changed");
        Ok(())
    }

    async fn apply_config_delta(&self, body: &str) -> Result<()> {
        self.spool("config", body)
    }

    async fn apply_defaults_delta(&self, body: &str) -> Result<()> {
        self.spool("defaults", body)
    }

    async fn delete_local_config(&self) -> Result<()> {
        match fs::remove_file(&self.config_file) {
            Ok(()) => {
                warn!(path = %self.config_file.display(), "Local configuration deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.config_file, e)),
        }
    }
}
