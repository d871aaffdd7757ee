use crate::bus::MetricPublisher;
use crate::service::AC_POWER;
use crate::update_loop::LoopStatus;
use std::{fmt, future, time::Duration};
use tokio::{sync::watch, time::sleep};
use tracing::info;

const UNKNOWN: &str = "unknown";

/// What one sign-of-life entry reports.
#[derive(Debug, Clone, PartialEq)]
pub struct SignOfLife {
    pub last_update: Option<String>,
    pub last_power: Option<String>,
    pub completed_cycles: u64,
    pub failed_cycles: u64,
}

impl fmt::Display for SignOfLife {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "last update {}, last '{AC_POWER}' {}, {} cycles ok, {} failed",
            self.last_update.as_deref().unwrap_or(UNKNOWN),
            self.last_power.as_deref().unwrap_or(UNKNOWN),
            self.completed_cycles,
            self.failed_cycles
        )
    }
}

/// Periodically logs that the service is still alive. Never writes anything.
pub struct HealthReporter<B> {
    bus: B,
    status: watch::Receiver<LoopStatus>,
    period: Option<Duration>,
}

impl<B: MetricPublisher> HealthReporter<B> {
    /// A `period` of `None` disables the reporter.
    pub fn new(bus: B, status: watch::Receiver<LoopStatus>, period: Option<Duration>) -> Self {
        Self {
            bus,
            status,
            period,
        }
    }

    pub fn sign_of_life(&self) -> SignOfLife {
        let status = self.status.borrow();
        SignOfLife {
            last_update: status
                .last_update
                .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
            last_power: self.bus.text(AC_POWER),
            completed_cycles: status.completed_cycles,
            failed_cycles: status.failed_cycles,
        }
    }

    pub async fn run(self) {
        let Some(period) = self.period else {
            info!("Sign of life logging disabled");
            return future::pending().await;
        };
        loop {
            sleep(period).await;
            info!("--- Start: sign of life ---");
            info!("{}", self.sign_of_life());
            info!("--- End: sign of life ---");
        }
    }
}
