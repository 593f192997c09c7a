use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::protocol::{
    channel::{ChannelConfig, Credentials},
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial device; auto-selected among USB serial ports when absent
    pub port: Option<String>,
    pub baud: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
        }
    }
}

/// Open test access point brought up on the remote board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub country: String,
    /// First three octets; the board takes `.1`, DHCP hands out `.10`-`.200`
    pub subnet: String,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "PiRF-Test".to_string(),
            country: "GB".to_string(),
            subnet: "192.168.88".to_string(),
        }
    }
}

impl AccessPointConfig {
    pub fn board_address(&self) -> String {
        format!("{}.1", self.subnet)
    }

    pub fn default_peer(&self) -> String {
        format!("{}.10", self.subnet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub address_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address_timeout_secs: 60,
            poll_interval_secs: 2,
        }
    }
}

impl NetworkConfig {
    pub fn address_timeout(&self) -> Duration {
        Duration::from_secs(self.address_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Local iperf3 executable
    pub iperf3: String,
    /// UDP target bitrate passed to `iperf3 -b`
    pub bitrate: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            iperf3: "iperf3".to_string(),
            bitrate: "100M".to_string(),
        }
    }
}

/// Everything a run needs. Built from defaults, then the config file, then CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub serial: SerialSettings,
    pub login: Credentials,
    pub channel: ChannelConfig,
    pub access_point: AccessPointConfig,
    pub network: NetworkConfig,
    pub tools: ToolsConfig,
}

impl RunConfig {
    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_err = |detail: String| Error::Config {
            path: path.display().to_string(),
            detail,
        };
        let content = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        let config = Self::from_toml(&content).map_err(|e| config_err(e.to_string()))?;
        config.validate().map_err(|e| config_err(e.to_string()))?;
        Ok(config)
    }

    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<()> {
        let ap = &self.access_point;
        let octets: Vec<&str> = ap.subnet.split('.').collect();
        if octets.len() != 3 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
            return Err(Error::invalid(format!(
                "access_point.subnet must be three dotted octets, got {:?}",
                ap.subnet
            )));
        }
        for (field, value) in [("ssid", &ap.ssid), ("country", &ap.country)] {
            if value.is_empty() || value.contains(['\n', '\r']) {
                return Err(Error::invalid(format!(
                    "access_point.{field} must be a non-empty single line"
                )));
            }
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        if self.login.username.is_none() && self.login.password.is_none() {
            None
        } else {
            Some(&self.login)
        }
    }
}
