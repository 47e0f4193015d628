//! RAK811 LoRa modem, driven through its command-line tool.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, UplinkError};

const HARD_RESET_OK: &str = "Hard reset complete";
const JOINED_OK: &str = "Joined in OTAA mode";
const MESSAGE_SENT: &str = "Message sent";
const MODEM_TIMEOUT: &str = "RAK811 timeout";
const NO_DOWNLINK: &str = "No downlink available";
const DOWNLINK_PREFIX: &str = "Data: ";

// RAK811 firmware v2 has no status query; a one-byte uplink is the only way
// to learn whether the network session is still alive.
const CONNECTION_PROBE: &str = "%";

// Reset and configuration commands answer immediately.
const SHORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// What the modem printed in reply to a `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemResponse {
    /// Uplink accepted; carries the hex downlink if the network had one queued.
    Sent { downlink: Option<String> },
    Timeout,
    Error(String),
}

impl ModemResponse {
    /// Only output carrying the send confirmation counts as sent; anything
    /// else is an error so the caller keeps the measurement.
    pub fn parse(output: &str) -> Self {
        if output.contains(MODEM_TIMEOUT) {
            return Self::Timeout;
        }
        if let Some(line) = output
            .lines()
            .find(|l| l.to_ascii_lowercase().contains("error"))
        {
            return Self::Error(line.trim().to_string());
        }
        if !output.contains(MESSAGE_SENT) {
            return Self::Error(format!("no send confirmation: {:?}", output.trim()));
        }
        if output.contains(NO_DOWNLINK) {
            return Self::Sent { downlink: None };
        }
        let downlink = output.split_once(DOWNLINK_PREFIX).and_then(|(_, rest)| {
            let hex = rest.lines().next().unwrap_or_default().trim();
            (!hex.is_empty()).then(|| hex.to_string())
        });
        Self::Sent { downlink }
    }
}

#[async_trait]
pub trait LoraModem: Send + Sync {
    /// Hardware reset; `true` when the modem confirms it.
    async fn hard_reset(&self) -> Result<bool>;

    /// Full network join: reset, credentials, data rate, OTAA join.
    async fn join(&self) -> Result<bool>;

    async fn send(&self, payload: &str) -> Result<ModemResponse>;

    /// Whether the network session still accepts uplinks.
    async fn check_connection(&self) -> Result<bool> {
        Ok(matches!(
            self.send(CONNECTION_PROBE).await?,
            ModemResponse::Sent { .. }
        ))
    }
}

pub struct Rak811Modem {
    binary: String,
    app_eui: String,
    app_key: String,
    data_rate: u8,
    send_timeout: Duration,
}

impl Rak811Modem {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.modem_binary.clone(),
            app_eui: config.lora_app_eui.clone(),
            app_key: config.lora_app_key.clone(),
            data_rate: config.lora_data_rate,
            send_timeout: Duration::from_secs(config.lora_command_timeout_secs),
        }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        debug!(binary = %self.binary, ?args, "Running modem command");
        let mut cmd = Command::new("sudo");
        cmd.arg(&self.binary).arg("-v").args(args).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                UplinkError::ModemTimeout(format!("no answer within {} seconds", timeout.as_secs()))
            })?
            .map_err(|e| UplinkError::ModemError(format!("failed to run {}: {e}", self.binary)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(UplinkError::ModemError(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                text.trim()
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl LoraModem for Rak811Modem {
    async fn hard_reset(&self) -> Result<bool> {
        let output = self.run(&["hard-reset"], SHORT_COMMAND_TIMEOUT).await?;
        Ok(output.contains(HARD_RESET_OK))
    }

    async fn join(&self) -> Result<bool> {
        if self.app_eui.is_empty() || self.app_key.is_empty() {
            return Err(UplinkError::NotConfigured(
                "LoRa app_eui/app_key are required to join".to_string(),
            ));
        }

        self.run(&["reset", "lora"], SHORT_COMMAND_TIMEOUT).await?;
        let eui = format!("app_eui={}", self.app_eui);
        let key = format!("app_key={}", self.app_key);
        self.run(&["set-config", &eui, &key], SHORT_COMMAND_TIMEOUT)
            .await?;
        self.run(&["dr", &self.data_rate.to_string()], SHORT_COMMAND_TIMEOUT)
            .await?;

        let output = self.run(&["join-otaa"], self.send_timeout).await?;
        let joined = output.contains(JOINED_OK);
        if joined {
            info!("Joined LoRaWAN network");
        } else {
            warn!(output = %output.trim(), "LoRaWAN join failed");
        }
        Ok(joined)
    }

    async fn send(&self, payload: &str) -> Result<ModemResponse> {
        let output = self.run(&["send", payload], self.send_timeout).await?;
        Ok(ModemResponse::parse(&output))
    }

    async fn check_connection(&self) -> Result<bool> {
        let output = self.run(&["send", CONNECTION_PROBE], self.send_timeout).await?;
        Ok(output.contains(MESSAGE_SENT))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted modem: replies are consumed in order.
    #[derive(Default)]
    pub(crate) struct FakeModem {
        pub reset_ok: Mutex<Option<bool>>,
        pub join_ok: Mutex<bool>,
        pub replies: Mutex<VecDeque<Result<ModemResponse>>>,
        pub sent: Mutex<Vec<String>>,
        pub joins: Mutex<u32>,
    }

    impl FakeModem {
        pub fn reply(&self, reply: Result<ModemResponse>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LoraModem for FakeModem {
        async fn hard_reset(&self) -> Result<bool> {
            let reset_ok = *self.reset_ok.lock().unwrap();
            reset_ok.ok_or_else(|| UplinkError::ModemError("no such device".into()))
        }

        async fn join(&self) -> Result<bool> {
            *self.joins.lock().unwrap() += 1;
            Ok(*self.join_ok.lock().unwrap())
        }

        async fn send(&self, payload: &str) -> Result<ModemResponse> {
            self.sent.lock().unwrap().push(payload.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ModemResponse::Sent { downlink: None }))
        }
    }

    #[test]
    fn test_parse_downlink() {
        let output = "Message sent\nDownlink received:\nPort: 1\nData: 632c312c312c4142\n";
        assert_eq!(
            ModemResponse::parse(output),
            ModemResponse::Sent {
                downlink: Some("632c312c312c4142".into())
            }
        );
    }

    #[test]
    fn test_parse_no_downlink() {
        assert_eq!(
            ModemResponse::parse("Message sent\nNo downlink available\n"),
            ModemResponse::Sent { downlink: None }
        );
        assert_eq!(
            ModemResponse::parse("Message sent\n"),
            ModemResponse::Sent { downlink: None }
        );
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(ModemResponse::parse("RAK811 timeout: no reply"), ModemResponse::Timeout);
        assert_eq!(
            ModemResponse::parse("rak811: error 80 busy\n"),
            ModemResponse::Error("rak811: error 80 busy".into())
        );
        assert_eq!(
            ModemResponse::parse("ERROR 80 busy\n"),
            ModemResponse::Error("ERROR 80 busy".into())
        );
    }

    #[test]
    fn test_parse_requires_send_confirmation() {
        for output in ["", "Sending...\n", "Joined in OTAA mode\n"] {
            assert!(
                matches!(ModemResponse::parse(output), ModemResponse::Error(_)),
                "{output:?} must not count as sent"
            );
        }
    }

    #[tokio::test]
    async fn test_default_connection_check_uses_probe_byte() {
        let modem = FakeModem::default();
        modem.reply(Ok(ModemResponse::Timeout));
        assert!(!modem.check_connection().await.unwrap());
        assert!(modem.check_connection().await.unwrap());
        assert_eq!(modem.sent(), vec!["%", "%"]);
    }
}
