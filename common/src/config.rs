use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    topics::{DEFAULT_COMMAND_TOPIC, DEFAULT_EVENT_TOPIC},
};

pub const DEFAULT_MAX_RETRIES: u32 = 20;
pub const DEFAULT_OTA_PORT: u16 = 3232;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StripConfig {
    pub device_id: String,
    pub hostname: String,
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub command_topic: String,
    pub event_topic: String,
    pub max_retries: u32,
    pub ota_port: u16,
    pub ota_password: String,
    pub debug: bool,
}

impl Default for StripConfig {
    fn default() -> Self {
        Self {
            device_id: "powerstrip".to_string(),
            hostname: "powerstrip".to_string(),
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            broker_host: "192.168.81.10".to_string(),
            broker_port: 1883,
            username: "guest".to_string(),
            password: "guest".to_string(),
            command_topic: DEFAULT_COMMAND_TOPIC.to_string(),
            event_topic: DEFAULT_EVENT_TOPIC.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            ota_port: DEFAULT_OTA_PORT,
            ota_password: String::new(),
            debug: true,
        }
    }
}

impl StripConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Empty("deviceId"));
        }
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::Empty("brokerHost"));
        }
        if self.broker_port == 0 {
            return Err(ConfigError::InvalidPort("brokerPort"));
        }
        if self.command_topic.trim().is_empty() {
            return Err(ConfigError::Empty("commandTopic"));
        }
        if self.event_topic.trim().is_empty() {
            return Err(ConfigError::Empty("eventTopic"));
        }
        if self.ota_port == 0 {
            return Err(ConfigError::InvalidPort("otaPort"));
        }
        Ok(())
    }
}
