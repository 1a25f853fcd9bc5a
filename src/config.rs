//! Process configuration, read once at startup from a TOML file.
//!
//! ```toml
//! [port]
//! device = "/dev/ttyO2"
//! timeout_us = 100000
//!
//! [[device]]
//! address = 1
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use snafu::{ensure, ResultExt, Snafu};

use crate::link::LinkConfig;
use crate::master::PollConfig;
use crate::slave::Device;
use crate::types::{self, Address};

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    ReadConfig { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to parse configuration: {source}"))]
    ParseConfig { source: toml::de::Error },
    #[snafu(display("Config does not specify the device name"))]
    MissingPort,
    #[snafu(display("Invalid device address {address}"))]
    InvalidDevice { address: u16, source: types::Error },
    #[snafu(display("The broadcast address can't be polled"))]
    BroadcastDevice,
    #[snafu(display("Device address {address} configured twice"))]
    DuplicateDevice { address: Address },
    #[snafu(display("Invalid identifier for device {address}: {source}"))]
    InvalidIdentifier {
        address: Address,
        source: hex::FromHexError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: LinkConfig,
    pub poll: PollConfig,
    pub logging: LoggingConfig,
    pub device: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 errors only, 1 warnings, 2 information, 3 and up debug.
    pub level: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: 2 }
    }
}

impl LoggingConfig {
    pub fn filter(&self) -> LevelFilter {
        match self.level {
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    }
}

/// One statically configured peripheral.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct DeviceConfig {
    pub address: u16,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// 16 byte identifier as 32 hex digits.
    #[serde(default)]
    pub uid: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Config {
    /// Read and validate the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(text).context(ParseConfigSnafu)?;
        ensure!(!config.port.device.is_empty(), MissingPortSnafu);
        config.devices()?;
        Ok(config)
    }

    /// Build the device registry in configuration order.
    /// # Errors
    /// Addresses out of range, the broadcast address, duplicates and malformed identifiers.
    pub fn devices(&self) -> Result<Vec<Device>, Error> {
        let mut seen = HashSet::new();
        self.device
            .iter()
            .map(|entry| -> Result<Device, Error> {
                let address = Address::new(entry.address).context(InvalidDeviceSnafu {
                    address: entry.address,
                })?;
                ensure!(address != Address::BROADCAST, BroadcastDeviceSnafu);
                ensure!(seen.insert(address), DuplicateDeviceSnafu { address });

                let mut device = Device::new(address, &self.poll).with_enabled(entry.enabled);
                if let Some(uid) = &entry.uid {
                    let mut identifier = [0; 16];
                    hex::decode_to_slice(uid, &mut identifier)
                        .context(InvalidIdentifierSnafu { address })?;
                    device = device.with_identifier(identifier);
                }
                Ok(device)
            })
            .collect()
    }
}
