//! Device identity and telemetry reporting.
//!
//! Each cycle sends exactly one message: the device identity is established
//! (provisioned or parsed from a connection string), a connection is opened,
//! the message is sent, the connection is given time to settle and is then
//! torn down again.

mod dps;
mod hub;
mod sas;

use crate::config::{SecurityType, TelemetryConfig};
use crate::error::{ProvisioningError, Result, TelemetryError};
use crate::inference::InferenceResult;
use crate::metadata::GpsFix;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use dps::DpsProvisioner;
pub use hub::IotHubHttpTransport;
pub use sas::{expiry_from_now, generate_sas_token};

/// Telemetry message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    #[serde(rename = "FileName")]
    pub file_name: String,
    /// Float when the location id parses as a number (`7` is sent as `7.0`)
    #[serde(rename = "LocationID")]
    pub location_id: serde_json::Value,
    #[serde(rename = "NumberOfPersons")]
    pub number_of_persons: u32,
    #[serde(rename = "NumberOfEmptySeats")]
    pub number_of_empty_seats: u32,
    #[serde(rename = "DateTime")]
    pub date_time: String,
    #[serde(rename = "GPS_Latitude")]
    pub gps_latitude: f64,
    #[serde(rename = "GPS_Longitude")]
    pub gps_longitude: f64,
    #[serde(rename = "GPS_Altitude")]
    pub gps_altitude: f64,
}

impl TelemetryEnvelope {
    pub fn new(
        file_name: impl Into<String>,
        location_id: &str,
        counts: &InferenceResult,
        date_time: impl Into<String>,
        gps: Option<GpsFix>,
    ) -> Self {
        let gps = gps.unwrap_or(GpsFix {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
        });
        Self {
            file_name: file_name.into(),
            location_id: location_value(location_id),
            number_of_persons: counts.person_count,
            number_of_empty_seats: counts.chair_count,
            date_time: date_time.into(),
            gps_latitude: gps.latitude,
            gps_longitude: gps.longitude,
            gps_altitude: gps.altitude,
        }
    }
}

fn location_value(location_id: &str) -> serde_json::Value {
    match location_id.trim().parse::<f64>() {
        Ok(number) if number.is_finite() => serde_json::Value::from(number),
        _ => serde_json::Value::from(location_id),
    }
}

/// Cloud identity of this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub hub_host: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl DeviceIdentity {
    /// Parse `HostName=...;DeviceId=...;SharedAccessKey=...`
    pub fn from_connection_string(
        connection_string: &str,
    ) -> std::result::Result<Self, ProvisioningError> {
        let mut hub_host = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for part in connection_string.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "HostName" => hub_host = Some(value.trim().to_string()),
                "DeviceId" => device_id = Some(value.trim().to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let missing = |field: &str| ProvisioningError::InvalidConnectionString {
            details: format!("{} is missing", field),
        };
        Ok(Self {
            hub_host: hub_host.filter(|v| !v.is_empty()).ok_or_else(|| missing("HostName"))?,
            device_id: device_id.filter(|v| !v.is_empty()).ok_or_else(|| missing("DeviceId"))?,
            shared_access_key: shared_access_key
                .filter(|v| !v.is_empty())
                .ok_or_else(|| missing("SharedAccessKey"))?,
        })
    }
}

/// Serialized message handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub body: String,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

impl TelemetryMessage {
    pub fn json(body: String) -> Self {
        Self {
            body,
            content_type: "application/json",
            content_encoding: "utf-8",
        }
    }
}

/// Registers the device with a provisioning service
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn register(&self) -> std::result::Result<DeviceIdentity, ProvisioningError>;
}

/// Connection to the device cloud
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn connect(&self, identity: &DeviceIdentity) -> std::result::Result<(), TelemetryError>;
    async fn send(&self, message: &TelemetryMessage) -> std::result::Result<(), TelemetryError>;
    async fn disconnect(&self) -> std::result::Result<(), TelemetryError>;
}

/// Where the device identity comes from
#[derive(Clone)]
pub enum IdentitySource {
    Provisioned(Arc<dyn Provisioner>),
    ConnectionString(String),
}

pub struct TelemetryReporter {
    identity: IdentitySource,
    transport: Arc<dyn TelemetryTransport>,
    settle_delay: Duration,
}

impl TelemetryReporter {
    pub fn new(
        identity: IdentitySource,
        transport: Arc<dyn TelemetryTransport>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            identity,
            transport,
            settle_delay,
        }
    }

    /// Reporter backed by the HTTPS provisioning and hub clients
    pub fn from_config(config: &TelemetryConfig) -> Result<Self> {
        let identity = match config.security_type {
            SecurityType::Dps => {
                IdentitySource::Provisioned(Arc::new(DpsProvisioner::from_config(config)?))
            }
            SecurityType::ConnectionString => {
                IdentitySource::ConnectionString(config.connection_string.clone())
            }
        };
        let transport = IotHubHttpTransport::new(Duration::from_secs(config.timeout_seconds))?;

        Ok(Self::new(
            identity,
            Arc::new(transport),
            Duration::from_secs(config.settle_seconds),
        ))
    }

    pub async fn provision(&self) -> std::result::Result<DeviceIdentity, ProvisioningError> {
        match &self.identity {
            IdentitySource::Provisioned(provisioner) => provisioner.register().await,
            IdentitySource::ConnectionString(connection_string) => {
                info!("Connecting using a device connection string");
                DeviceIdentity::from_connection_string(connection_string)
            }
        }
    }

    /// Provision, connect, send, settle and disconnect. The connection is torn
    /// down even when the send fails.
    pub async fn report(&self, envelope: &TelemetryEnvelope) -> std::result::Result<(), TelemetryError> {
        let identity = self.provision().await?;
        let message = TelemetryMessage::json(serde_json::to_string(envelope)?);

        self.transport.connect(&identity).await?;

        let sent = self.transport.send(&message).await;
        match &sent {
            Ok(()) => {
                info!("Sent telemetry for {}", envelope.file_name);
                debug!("Waiting {:?} before disconnecting", self.settle_delay);
                sleep(self.settle_delay).await;
            }
            Err(e) => warn!("Telemetry send failed: {}", e),
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to disconnect telemetry client: {}", e);
        }

        sent
    }
}
