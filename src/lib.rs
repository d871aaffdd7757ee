//! P1 Meter Bridge Library
//!
//! Polls a smart gateway's P1 JSON API and republishes grid power, current,
//! voltage and energy totals on an in-process data bus, laid out like a
//! Victron energy meter (`com.victronenergy.grid` / `com.victronenergy.pvinverter`).

pub mod bus;
pub mod config;
pub mod health;
pub mod meter_client;
pub mod phase;
pub mod service;
pub mod update_loop;

// Re-export commonly used types for easier access
pub use bus::{BusValue, LocalBus, MetricPublisher};
pub use config::{ConfigProvider, FileConfig, Settings};
pub use health::HealthReporter;
pub use meter_client::{MeterClient, MeterReading, MeterSource};
pub use phase::{Phase, PhaseMetrics};
pub use service::DeviceIdentity;
pub use update_loop::{LoopStatus, UpdateLoop};
