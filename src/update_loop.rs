use crate::bus::{BusError, BusValue, MetricPublisher};
use crate::config::{ConfigError, ConfigProvider, PhaseCount};
use crate::meter_client::{MeterError, MeterReading, MeterSource};
use crate::phase::{self, Phase, PhaseMetrics};
use crate::service::{AC_POWER, ENERGY_FORWARD, ENERGY_REVERSE, UPDATE_INDEX};
use chrono::{DateTime, Local};
use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, error, info};

/// Pause between the end of one cycle and the start of the next.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// The gateway reports energy totals in kWh, the bus expects them ×1000.
const ENERGY_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Fetching,
    Computing,
    Publishing,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CycleState::Idle => "idle",
            CycleState::Fetching => "fetch",
            CycleState::Computing => "compute",
            CycleState::Publishing => "publish",
        })
    }
}

#[derive(Debug, Error)]
pub enum TickFailure {
    #[error(transparent)]
    Meter(#[from] MeterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A cycle that did not complete, with the stage it failed in.
#[derive(Debug, Error)]
#[error("Error at {stage} stage: {failure}")]
pub struct TickError {
    pub stage: CycleState,
    #[source]
    pub failure: TickFailure,
}

/// What the loop reports about itself to observers such as the health reporter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStatus {
    pub last_update: Option<DateTime<Local>>,
    pub update_index: u8,
    pub completed_cycles: u64,
    pub failed_cycles: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub voltage: f64,
    pub metrics: PhaseMetrics,
}

/// Every value one cycle publishes, computed before the first bus write.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub net_power: f64,
    pub energy_forward: f64,
    pub energy_reverse: f64,
    pub phases: Vec<PhaseSnapshot>,
}

impl Snapshot {
    pub fn compute(reading: &MeterReading, phase_count: PhaseCount) -> Result<Self, MeterError> {
        let legs: &[Phase] = match phase_count {
            PhaseCount::Single => &[Phase::L1],
            PhaseCount::Three => &Phase::ALL,
        };
        let phases = legs
            .iter()
            .map(|&phase| {
                Ok(PhaseSnapshot {
                    phase,
                    voltage: reading.number_or_zero(&phase.field("Voltage"))?,
                    metrics: phase::derive(reading, phase)?,
                })
            })
            .collect::<Result<Vec<_>, MeterError>>()?;

        Ok(Self {
            net_power: reading.number_or_zero("PowerDeliveredNetto")?,
            energy_forward: reading.number_or_zero("PowerDelivered_total")? * ENERGY_SCALE,
            energy_reverse: reading.number_or_zero("PowerReturned_total")? * ENERGY_SCALE,
            phases,
        })
    }

    pub fn publish(&self, bus: &impl MetricPublisher) -> Result<(), BusError> {
        bus.write(AC_POWER, self.net_power.into())?;
        for leg in &self.phases {
            let prefix = format!("/Ac/{}", leg.phase);
            bus.write(&format!("{prefix}/Voltage"), leg.voltage.into())?;
            bus.write(&format!("{prefix}/Current"), leg.metrics.current.into())?;
            bus.write(&format!("{prefix}/Power"), leg.metrics.power.into())?;
        }
        bus.write(ENERGY_FORWARD, self.energy_forward.into())?;
        bus.write(ENERGY_REVERSE, self.energy_reverse.into())?;
        Ok(())
    }
}

/// Polls the meter and republishes its values, one cycle at a time.
pub struct UpdateLoop<M, C, B> {
    meter: M,
    config: C,
    bus: B,
    interval: Duration,
    state: CycleState,
    status: watch::Sender<LoopStatus>,
}

impl<M, C, B> UpdateLoop<M, C, B>
where
    M: MeterSource,
    C: ConfigProvider,
    B: MetricPublisher,
{
    pub fn new(
        meter: M,
        config: C,
        bus: B,
        interval: Duration,
    ) -> (Self, watch::Receiver<LoopStatus>) {
        let (status, status_rx) = watch::channel(LoopStatus::default());
        (
            Self {
                meter,
                config,
                bus,
                interval,
                state: CycleState::Idle,
                status,
            },
            status_rx,
        )
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn status(&self) -> LoopStatus {
        self.status.borrow().clone()
    }

    /// Runs until the task is dropped. A failed cycle is logged and the next
    /// one starts after the usual pause.
    pub async fn run(mut self) {
        info!("Starting update loop, one cycle every {:?}", self.interval);
        loop {
            if let Err(e) = self.tick().await {
                error!(stage = %e.stage, "Error at update cycle: {e}");
            }
            sleep(self.interval).await;
        }
    }

    /// One full fetch, compute and publish cycle. Returns the new update index.
    pub async fn tick(&mut self) -> Result<u8, TickError> {
        let result = self.run_cycle().await;
        self.state = CycleState::Idle;

        self.status.send_modify(|status| match &result {
            Ok(index) => {
                status.last_update = Some(Local::now());
                status.update_index = *index;
                status.completed_cycles += 1;
                status.last_error = None;
            }
            Err(e) => {
                status.failed_cycles += 1;
                status.last_error = Some(e.to_string());
            }
        });
        result
    }

    async fn run_cycle(&mut self) -> Result<u8, TickError> {
        self.state = CycleState::Fetching;
        let reading = self.meter.fetch().await.map_err(|e| self.fail(e))?;

        self.state = CycleState::Computing;
        let phase_count = self
            .config
            .settings()
            .and_then(|settings| settings.phase_count())
            .map_err(|e| self.fail(e))?;
        let snapshot = Snapshot::compute(&reading, phase_count).map_err(|e| self.fail(e))?;

        self.state = CycleState::Publishing;
        snapshot.publish(&self.bus).map_err(|e| self.fail(e))?;
        let index = self.advance_update_index().map_err(|e| self.fail(e))?;

        debug!(
            "House consumption (positive if consuming): {}W, update index {index}",
            snapshot.net_power
        );
        Ok(index)
    }

    /// Bumps `/UpdateIndex`, wrapping from 255 back to 0. The current value is
    /// read back from the bus since other clients may have written it.
    fn advance_update_index(&self) -> Result<u8, BusError> {
        let current = self
            .bus
            .read(UPDATE_INDEX)
            .and_then(|value| value.as_i64())
            .unwrap_or_default();
        let next = u8::try_from(current.saturating_add(1)).unwrap_or(0);
        self.bus.write(UPDATE_INDEX, BusValue::from(next))?;
        Ok(next)
    }

    fn fail(&self, failure: impl Into<TickFailure>) -> TickError {
        TickError {
            stage: self.state,
            failure: failure.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, TextFormat};
    use crate::config::{DeviceSettings, OnPremiseSettings, PhasesValue, Role, Settings};
    use crate::service::{DeviceIdentity, METRIC_PATHS};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Replays canned responses, then fails once the script runs out.
    #[derive(Clone, Default)]
    struct ScriptedMeter {
        responses: Arc<Mutex<VecDeque<Option<Value>>>>,
        fetches: Arc<AtomicU32>,
    }

    impl ScriptedMeter {
        fn push_ok(&self, body: Value) {
            self.responses.lock().unwrap().push_back(Some(body));
        }

        fn push_unreachable(&self) {
            self.responses.lock().unwrap().push_back(None);
        }

        fn fetch_count(&self) -> u32 {
            self.fetches.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl MeterSource for ScriptedMeter {
        async fn fetch(&self) -> Result<MeterReading, MeterError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            match self.responses.lock().unwrap().pop_front() {
                Some(Some(body)) => MeterReading::try_from(body),
                _ => Err(MeterError::ConnectionFailure {
                    url: "http://meter.test/smartmeter/api/read".to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }
    }

    fn settings(phases: PhasesValue) -> Settings {
        Settings {
            device: DeviceSettings {
                device_instance: 40,
                custom_name: String::new(),
                role: "grid".to_string(),
                phases,
                access_type: "OnPremise".to_string(),
                position: 0,
                sign_of_life_log: 0,
            },
            on_premise: Some(OnPremiseSettings {
                host: "meter.test".to_string(),
            }),
        }
    }

    fn registered_bus() -> LocalBus {
        let bus = LocalBus::new("com.victronenergy.grid.http_40");
        DeviceIdentity {
            role: Role::Grid,
            device_instance: 40,
            product_id: Role::Grid.product_id(),
            custom_name: String::new(),
            serial: "E001".to_string(),
            position: 0,
        }
        .register(&bus)
        .unwrap();
        bus
    }

    fn three_phase_reading() -> Value {
        json!({
            "Equipment_Id": "E001",
            "PowerDeliveredNetto": 420.0,
            "PowerDelivered_total": 3.2,
            "PowerReturned_total": 1.5,
            "Voltage_l1": 230.1,
            "Voltage_l2": 231.2,
            "Voltage_l3": 229.3,
            "PowerDelivered_l1": 900.0,
            "PowerReturned_l1": 0.0,
            "Current_l1": 4.0,
            "PowerDelivered_l2": 0.0,
            "PowerReturned_l2": 480.0,
            "Current_l2": 2.1,
            "PowerDelivered_l3": 50.0
        })
    }

    fn float(bus: &LocalBus, path: &str) -> f64 {
        bus.read(path).and_then(|v| v.as_f64()).unwrap()
    }

    #[tokio::test]
    async fn test_three_phase_cycle_publishes_all_paths() {
        let meter = ScriptedMeter::default();
        meter.push_ok(three_phase_reading());
        let bus = registered_bus();
        let (mut update_loop, status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Number(3)),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        assert_eq!(update_loop.tick().await.unwrap(), 1);

        assert_eq!(float(&bus, AC_POWER), 420.0);
        assert_eq!(float(&bus, ENERGY_FORWARD), 3200.0);
        assert_eq!(float(&bus, ENERGY_REVERSE), 1500.0);
        assert_eq!(float(&bus, "/Ac/L1/Voltage"), 230.1);
        assert_eq!(float(&bus, "/Ac/L2/Voltage"), 231.2);
        assert_eq!(float(&bus, "/Ac/L3/Voltage"), 229.3);
        assert_eq!(float(&bus, "/Ac/L1/Power"), 900.0);
        assert_eq!(float(&bus, "/Ac/L1/Current"), 4.0);
        assert_eq!(float(&bus, "/Ac/L2/Power"), -480.0);
        assert_eq!(float(&bus, "/Ac/L2/Current"), -2.1);
        assert_eq!(float(&bus, "/Ac/L3/Power"), 50.0);
        assert_eq!(float(&bus, "/Ac/L3/Current"), 0.0);
        assert_eq!(bus.read(UPDATE_INDEX), Some(BusValue::Int(1)));

        let status = status.borrow().clone();
        assert_eq!(status.update_index, 1);
        assert_eq!(status.completed_cycles, 1);
        assert!(status.last_update.is_some());
        assert_eq!(update_loop.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_single_phase_cycle_uses_l1_only() {
        let meter = ScriptedMeter::default();
        meter.push_ok(json!({
            "PowerDeliveredNetto": -300.0,
            "PowerDelivered_total": 12.5,
            "PowerReturned_total": 4.25,
            "Voltage_l1": "229.9",
            "PowerDelivered_l1": 0.0,
            "PowerReturned_l1": 300.0,
            "Current_l1": 1.3,
            "Voltage_l2": 231.0
        }));
        let bus = registered_bus();
        let (mut update_loop, _status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Text("1".to_string())),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        update_loop.tick().await.unwrap();

        assert_eq!(float(&bus, AC_POWER), -300.0);
        assert_eq!(float(&bus, "/Ac/L1/Voltage"), 229.9);
        assert_eq!(float(&bus, "/Ac/L1/Power"), -300.0);
        assert_eq!(float(&bus, "/Ac/L1/Current"), -1.3);
        assert_eq!(float(&bus, ENERGY_FORWARD), 12500.0);
        assert_eq!(float(&bus, ENERGY_REVERSE), 4250.0);
        assert_eq!(bus.read("/Ac/L2/Voltage"), Some(BusValue::Int(0)));
    }

    #[tokio::test]
    async fn test_update_index_wraps() {
        let meter = ScriptedMeter::default();
        meter.push_ok(three_phase_reading());
        meter.push_ok(three_phase_reading());
        let bus = registered_bus();
        bus.write(UPDATE_INDEX, BusValue::Int(254)).unwrap();
        let (mut update_loop, _status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Number(3)),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        assert_eq!(update_loop.tick().await.unwrap(), 255);
        assert_eq!(update_loop.tick().await.unwrap(), 0);
        assert_eq!(bus.read(UPDATE_INDEX), Some(BusValue::Int(0)));
    }

    #[tokio::test]
    async fn test_update_index_follows_external_writes() {
        let meter = ScriptedMeter::default();
        meter.push_ok(three_phase_reading());
        let bus = registered_bus();
        bus.write(UPDATE_INDEX, BusValue::Int(17)).unwrap();
        let (mut update_loop, _status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Number(3)),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        assert_eq!(update_loop.tick().await.unwrap(), 18);
    }

    #[tokio::test]
    async fn test_failed_fetch_changes_nothing() {
        let meter = ScriptedMeter::default();
        meter.push_ok(three_phase_reading());
        meter.push_unreachable();
        let bus = registered_bus();
        let (mut update_loop, status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Number(3)),
            bus.clone(),
            UPDATE_INTERVAL,
        );
        update_loop.tick().await.unwrap();
        let before = bus.dump();

        let err = update_loop.tick().await.unwrap_err();

        assert_eq!(err.stage, CycleState::Fetching);
        assert!(matches!(
            err.failure,
            TickFailure::Meter(MeterError::ConnectionFailure { .. })
        ));
        assert_eq!(bus.dump(), before);
        assert_eq!(bus.read(UPDATE_INDEX), Some(BusValue::Int(1)));

        let status = status.borrow().clone();
        assert_eq!(status.completed_cycles, 1);
        assert_eq!(status.failed_cycles, 1);
        assert_eq!(status.update_index, 1);
        assert!(status.last_error.unwrap().contains("fetch"));
    }

    #[tokio::test]
    async fn test_malformed_field_aborts_before_publishing() {
        let meter = ScriptedMeter::default();
        let mut reading = three_phase_reading();
        reading["Voltage_l3"] = json!("unavailable");
        meter.push_ok(reading);
        let bus = registered_bus();
        let before = bus.dump();
        let (mut update_loop, _status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Number(3)),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        let err = update_loop.tick().await.unwrap_err();

        assert_eq!(err.stage, CycleState::Computing);
        assert!(matches!(
            err.failure,
            TickFailure::Meter(MeterError::MalformedField { .. })
        ));
        assert_eq!(bus.dump(), before);
    }

    #[tokio::test]
    async fn test_unsupported_phase_count_aborts_cycle() {
        let meter = ScriptedMeter::default();
        meter.push_ok(three_phase_reading());
        let bus = registered_bus();
        let (mut update_loop, _status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Number(2)),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        let err = update_loop.tick().await.unwrap_err();

        assert_eq!(err.stage, CycleState::Computing);
        assert!(matches!(
            err.failure,
            TickFailure::Config(ConfigError::UnsupportedPhases(_))
        ));
        assert_eq!(bus.read(UPDATE_INDEX), Some(BusValue::Int(0)));
    }

    #[tokio::test]
    async fn test_partial_publish_keeps_index() {
        let meter = ScriptedMeter::default();
        meter.push_ok(three_phase_reading());
        // Only the first metric path exists, so the second write fails.
        let bus = LocalBus::new("partial");
        bus.register(AC_POWER, BusValue::Int(0), METRIC_PATHS[0].1, true)
            .unwrap();
        bus.register(UPDATE_INDEX, BusValue::Int(9), TextFormat::Plain, false)
            .unwrap();
        let (mut update_loop, _status) = UpdateLoop::new(
            meter,
            settings(PhasesValue::Number(3)),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        let err = update_loop.tick().await.unwrap_err();

        assert_eq!(err.stage, CycleState::Publishing);
        assert_eq!(float(&bus, AC_POWER), 420.0);
        assert_eq!(bus.read(UPDATE_INDEX), Some(BusValue::Int(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_going_after_failures() {
        let meter = ScriptedMeter::default();
        meter.push_ok(three_phase_reading());
        meter.push_unreachable();
        meter.push_ok(three_phase_reading());
        meter.push_ok(three_phase_reading());
        let bus = registered_bus();
        let (update_loop, status) = UpdateLoop::new(
            meter.clone(),
            settings(PhasesValue::Number(3)),
            bus.clone(),
            UPDATE_INTERVAL,
        );

        let handle = tokio::spawn(update_loop.run());
        // Cycles start at 0, 500, 1000 and 1500 ms.
        sleep(Duration::from_millis(1_600)).await;
        handle.abort();

        assert_eq!(meter.fetch_count(), 4);
        let status = status.borrow().clone();
        assert_eq!(status.completed_cycles, 3);
        assert_eq!(status.failed_cycles, 1);
        assert_eq!(bus.read(UPDATE_INDEX), Some(BusValue::Int(3)));
    }

    #[test]
    fn test_snapshot_energy_scale() {
        let reading = MeterReading::try_from(json!({ "PowerDelivered_total": 3.2 })).unwrap();

        let snapshot = Snapshot::compute(&reading, PhaseCount::Single).unwrap();

        assert_eq!(snapshot.energy_forward, 3200.0);
        assert_eq!(snapshot.energy_reverse, 0.0);
        assert_eq!(snapshot.net_power, 0.0);
        assert_eq!(snapshot.phases.len(), 1);
    }
}
