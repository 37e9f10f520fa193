//! Adapter construction from vehicle configuration.

use std::sync::Arc;

use agvlink_core::{ChannelType, DynTransport, EngineConfig, VehicleConfig};
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterContext, AdapterSettings, VehicleAdapter};

pub const MIN_PORT: u32 = 1024;
pub const MAX_PORT: u32 = 65535;

/// Invalid vehicle configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterConfigError {
    #[error("Vehicle {0} has no host configured")]
    MissingHost(String),

    #[error("Vehicle {0} has no port configured")]
    MissingPort(String),

    #[error("Vehicle {vehicle}: port {port} must be between 1024 and 65535")]
    PortOutOfRange { vehicle: String, port: u32 },

    #[error("Vehicle {vehicle}: invalid device address list: {reason}")]
    InvalidDeviceAddress { vehicle: String, reason: String },
}

impl From<AdapterConfigError> for agvlink_core::Error {
    fn from(err: AdapterConfigError) -> Self {
        agvlink_core::Error::Config(err.to_string())
    }
}

/// Extra device served through a vehicle's link, e.g. a station it docks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    pub device_id: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Validated link properties of a vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleProperties {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub device_addresses: Vec<DeviceAddress>,
}

impl VehicleProperties {
    /// Validate `config` for `channel`.
    pub fn from_config(
        config: &VehicleConfig,
        channel: ChannelType,
    ) -> Result<Self, AdapterConfigError> {
        let name = config.name.clone();
        let host = config.host.trim().to_string();

        let port = if channel.requires_address() {
            if host.is_empty() {
                return Err(AdapterConfigError::MissingHost(name));
            }
            if config.port == 0 {
                return Err(AdapterConfigError::MissingPort(name));
            }
            if !(MIN_PORT..=MAX_PORT).contains(&config.port) {
                return Err(AdapterConfigError::PortOutOfRange {
                    vehicle: name,
                    port: config.port,
                });
            }
            config.port as u16
        } else {
            u16::try_from(config.port).unwrap_or_default()
        };

        let device_addresses = parse_device_addresses(&name, config.device_address.as_deref())?;

        Ok(Self {
            name,
            host,
            port,
            device_addresses,
        })
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Every device id telegrams for this vehicle may carry.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str())
            .chain(self.device_addresses.iter().map(|d| d.device_id.as_str()))
    }
}

/// Parse the JSON device address list. Blank input means no extra devices.
pub fn parse_device_addresses(
    vehicle: &str,
    json: Option<&str>,
) -> Result<Vec<DeviceAddress>, AdapterConfigError> {
    match json.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(json) => serde_json::from_str::<Option<Vec<DeviceAddress>>>(json)
            .map(Option::unwrap_or_default)
            .map_err(|e| AdapterConfigError::InvalidDeviceAddress {
                vehicle: vehicle.to_string(),
                reason: e.to_string(),
            }),
    }
}

/// Builds vehicle adapters sharing one set of collaborators.
pub struct AdapterFactory {
    channel: ChannelType,
    settings: AdapterSettings,
    ctx: AdapterContext,
}

impl AdapterFactory {
    /// Create a new factory from engine configuration.
    pub fn new(config: &EngineConfig, ctx: AdapterContext) -> Self {
        Self {
            channel: config.channel,
            settings: AdapterSettings {
                move_flush_interval: config.move_flush_interval(),
                reconnect: config.reconnect.clone(),
                disconnect_on_idle: config.disconnect_on_idle,
            },
            ctx,
        }
    }

    /// Whether `config` describes a vehicle this factory can serve.
    pub fn provides_adapter_for(&self, config: &VehicleConfig) -> Result<(), AdapterConfigError> {
        VehicleProperties::from_config(config, self.channel).map(|_| ())
    }

    /// Validate `config` and build its adapter on `transport`.
    pub fn create(
        &self,
        config: &VehicleConfig,
        transport: DynTransport,
    ) -> Result<Arc<VehicleAdapter>, AdapterConfigError> {
        let properties = VehicleProperties::from_config(config, self.channel)?;
        tracing::info!(
            vehicle = %properties.name,
            address = %properties.address(),
            devices = properties.device_addresses.len(),
            "Creating vehicle adapter"
        );
        Ok(VehicleAdapter::new(
            properties,
            self.settings.clone(),
            transport,
            self.ctx.clone(),
        ))
    }
}
