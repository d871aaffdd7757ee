//! Identity of the emulated meter and the fixed set of bus paths it publishes.

use crate::bus::{BusError, BusValue, MetricPublisher, TextFormat};
use crate::config::{ConfigError, Role, Settings};
use crate::meter_client::{MeterError, MeterSource};
use thiserror::Error;
use tracing::info;

pub const PRODUCT_NAME: &str = "Smartgateway Energy P1";
pub const CONNECTION: &str = "Smartgateway Energy P1 HTTP JSON service";
/// ET340 energy meter.
pub const DEVICE_TYPE: i64 = 345;
pub const FIRMWARE_VERSION: f64 = 0.2;
pub const HARDWARE_VERSION: i64 = 0;

pub const UPDATE_INDEX: &str = "/UpdateIndex";
pub const AC_POWER: &str = "/Ac/Power";
pub const ENERGY_FORWARD: &str = "/Ac/Energy/Forward";
pub const ENERGY_REVERSE: &str = "/Ac/Energy/Reverse";

/// Metric paths, all writeable by other bus clients.
pub const METRIC_PATHS: [(&str, TextFormat); 14] = [
    (AC_POWER, TextFormat::Watt),
    ("/Ac/Voltage", TextFormat::Volt),
    ("/Ac/Current", TextFormat::Ampere),
    (ENERGY_FORWARD, TextFormat::KiloWattHour),
    (ENERGY_REVERSE, TextFormat::KiloWattHour),
    ("/Ac/L1/Voltage", TextFormat::Volt),
    ("/Ac/L2/Voltage", TextFormat::Volt),
    ("/Ac/L3/Voltage", TextFormat::Volt),
    ("/Ac/L1/Current", TextFormat::Ampere),
    ("/Ac/L2/Current", TextFormat::Ampere),
    ("/Ac/L3/Current", TextFormat::Ampere),
    ("/Ac/L1/Power", TextFormat::Watt),
    ("/Ac/L2/Power", TextFormat::Watt),
    ("/Ac/L3/Power", TextFormat::Watt),
];

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Cannot read the meter serial: {0}")]
    Serial(#[from] MeterError),
    #[error("Cannot register bus path: {0}")]
    Bus(#[from] BusError),
}

/// Who this service claims to be on the bus. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub role: Role,
    pub device_instance: u32,
    pub product_id: u16,
    pub custom_name: String,
    pub serial: String,
    pub position: i64,
}

impl DeviceIdentity {
    /// Validates the configured role, then asks the meter for its serial.
    /// The meter is not contacted when the role is unsupported.
    pub async fn establish(
        settings: &Settings,
        meter: &impl MeterSource,
    ) -> Result<Self, StartupError> {
        let role = settings.role()?;
        let serial = meter.fetch().await?.equipment_id()?;

        Ok(Self {
            role,
            device_instance: settings.device.device_instance,
            product_id: role.product_id(),
            custom_name: settings.device.custom_name.clone(),
            serial,
            position: settings.device.position,
        })
    }

    pub fn service_name(&self) -> String {
        format!(
            "com.victronenergy.{}.http_{:02}",
            self.role, self.device_instance
        )
    }

    /// Registers the management, identity and metric paths.
    pub fn register(&self, bus: &impl MetricPublisher) -> Result<(), BusError> {
        let fixed: [(&str, BusValue); 16] = [
            ("/Mgmt/ProcessName", env!("CARGO_PKG_NAME").into()),
            (
                "/Mgmt/ProcessVersion",
                format!("{} (Rust)", env!("CARGO_PKG_VERSION")).into(),
            ),
            ("/Mgmt/Connection", CONNECTION.into()),
            ("/DeviceInstance", i64::from(self.device_instance).into()),
            ("/ProductId", i64::from(self.product_id).into()),
            ("/DeviceType", DEVICE_TYPE.into()),
            ("/ProductName", PRODUCT_NAME.into()),
            ("/CustomName", self.custom_name.as_str().into()),
            ("/Latency", BusValue::Empty),
            ("/FirmwareVersion", FIRMWARE_VERSION.into()),
            ("/HardwareVersion", HARDWARE_VERSION.into()),
            ("/Connected", BusValue::Int(1)),
            ("/Role", self.role.as_str().into()),
            ("/Position", self.position.into()),
            ("/Serial", self.serial.as_str().into()),
            (UPDATE_INDEX, BusValue::Int(0)),
        ];
        for (path, value) in fixed {
            bus.register(path, value, TextFormat::Plain, false)?;
        }

        for (path, format) in METRIC_PATHS {
            bus.register(path, BusValue::Int(0), format, true)?;
        }
        Ok(())
    }
}

/// Establishes the identity, opens the bus service named after it and
/// registers every path. Any error here is fatal for the process; an
/// unsupported role fails before the bus service exists.
pub async fn bootstrap<B, F>(
    settings: &Settings,
    meter: &impl MeterSource,
    open_bus: F,
) -> Result<(DeviceIdentity, B), StartupError>
where
    B: MetricPublisher,
    F: FnOnce(String) -> B,
{
    let identity = DeviceIdentity::establish(settings, meter).await?;
    let bus = open_bus(identity.service_name());
    identity.register(&bus)?;
    info!(
        "Registered as {} (serial {})",
        identity.service_name(),
        identity.serial
    );
    Ok((identity, bus))
}
