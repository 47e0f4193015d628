use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, UplinkError};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Falls back to the upload interface's hardware identity when unset.
    pub sensor_uuid: Option<String>,
    pub sensor_name: String,
    pub bucket: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub topic_prefix: String,
    pub upload_interface: String,
    /// Used in topic paths; resolved from `upload_interface` when unset.
    pub ip_address: Option<String>,
    pub data_dir: PathBuf,
    pub mqtt_ack_timeout_secs: u64,
    pub lora_command_timeout_secs: u64,
    pub modem_binary: String,
    pub lora_app_eui: String,
    pub lora_app_key: String,
    pub lora_data_rate: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor_uuid: None,
            sensor_name: String::new(),
            bucket: String::new(),
            latitude: None,
            longitude: None,
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            topic_prefix: "sttoolkit-test/mqtt/wifi".to_string(),
            upload_interface: "wlan0".to_string(),
            ip_address: None,
            data_dir: PathBuf::from("."),
            mqtt_ack_timeout_secs: 10,
            lora_command_timeout_secs: 300,
            modem_binary: "rak811".to_string(),
            lora_app_eui: String::new(),
            lora_app_key: String::new(),
            lora_data_rate: 2,
        }
    }
}

impl Config {
    /// Reads the config file if present, applies environment overrides and
    /// validates the result.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_file_path();
        let config = if path.exists() {
            Self::load_from_file()?
        } else {
            Self::default()
        };
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Self {
        override_string(&mut self.sensor_name, "SENSOR_NAME");
        override_string(&mut self.bucket, "INFLUX_BUCKET");
        override_string(&mut self.mqtt_host, "MQTT_HOST");
        override_string(&mut self.topic_prefix, "MQTT_TOPIC_PREFIX");
        override_string(&mut self.upload_interface, "UPLOAD_INTERFACE");
        override_string(&mut self.modem_binary, "LORA_MODEM_BINARY");
        override_string(&mut self.lora_app_eui, "LORA_APP_EUI");
        override_string(&mut self.lora_app_key, "LORA_APP_KEY");

        if let Ok(uuid) = env::var("SENSOR_UUID") {
            self.sensor_uuid = Some(uuid);
        }
        if let Ok(user) = env::var("MQTT_USERNAME") {
            self.mqtt_username = Some(user);
        }
        if let Ok(password) = env::var("MQTT_PASSWORD") {
            self.mqtt_password = Some(password);
        }
        if let Ok(ip) = env::var("SENSOR_IP_ADDRESS") {
            self.ip_address = Some(ip);
        }
        if let Ok(dir) = env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        self.mqtt_port = get_env_var_u64("MQTT_PORT", self.mqtt_port.into())
            .try_into()
            .unwrap_or(self.mqtt_port);
        self.mqtt_ack_timeout_secs =
            get_env_var_u64("MQTT_ACK_TIMEOUT_SECS", self.mqtt_ack_timeout_secs);
        self.lora_command_timeout_secs =
            get_env_var_u64("LORA_COMMAND_TIMEOUT_SECS", self.lora_command_timeout_secs);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("sensor_name", self.sensor_name.is_empty()),
            ("bucket", self.bucket.is_empty()),
            ("mqtt_host", self.mqtt_host.is_empty()),
        ]
        .into_iter()
        .filter_map(|(field, empty)| empty.then_some(field))
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(UplinkError::NotConfigured(format!(
                "missing {}; run the sensor configuration tool first",
                missing.join(", ")
            )))
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sensor.db")
    }

    /// Directory where downlink configuration deltas are left for the
    /// configuration tool.
    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("spool")
    }

    pub fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("sensor_config.json")
    }

    pub fn load_from_file() -> Result<Self> {
        Self::load_from_path(&Self::get_config_file_path())
    }

    /// Writes the config where [`Config::load`] looks for it.
    pub fn save_to_file(&self) -> Result<()> {
        self.save_to_path(&Self::get_config_file_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let not_configured = |e: &dyn std::fmt::Display| {
            UplinkError::NotConfigured(format!("{}: {e}", path.display()))
        };
        let contents = fs::read_to_string(path).map_err(|e| not_configured(&e))?;
        serde_json::from_str(&contents).map_err(|e| not_configured(&e))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let storage = |e: std::io::Error| UplinkError::Storage(format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(storage)?;
        }
        let mut contents = serde_json::to_string_pretty(self)?;
        contents.push('\n');
        fs::write(path, contents).map_err(storage)
    }
}

fn override_string(field: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        *field = value;
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
