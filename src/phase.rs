use crate::meter_client::{MeterError, MeterReading};
use std::fmt;

/// One leg of the supply as labelled in the gateway's field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    /// Suffix used by the gateway, e.g. `PowerDelivered_l1`.
    pub fn label(self) -> &'static str {
        match self {
            Phase::L1 => "l1",
            Phase::L2 => "l2",
            Phase::L3 => "l3",
        }
    }

    /// Path segment used on the bus, e.g. `/Ac/L1/Power`.
    pub fn bus_segment(self) -> &'static str {
        match self {
            Phase::L1 => "L1",
            Phase::L2 => "L2",
            Phase::L3 => "L3",
        }
    }

    pub fn field(self, quantity: &str) -> String {
        format!("{quantity}_{}", self.label())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.bus_segment())
    }
}

/// Signed power and current for one phase.
/// Positive values mean consumption from the grid, negative values export.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseMetrics {
    pub power: f64,
    pub current: f64,
}

/// Derives the signed power and current of `phase`.
///
/// While the phase draws from the grid (`PowerDelivered_<p>` > 0) the
/// delivered power and the reported current are used as they are. Otherwise
/// the returned power and the current are both forced negative. Missing
/// fields read as zero.
pub fn derive(reading: &MeterReading, phase: Phase) -> Result<PhaseMetrics, MeterError> {
    let delivered = reading.number_or_zero(&phase.field("PowerDelivered"))?;
    let current = reading.number_or_zero(&phase.field("Current"))?;

    if delivered > 0.0 {
        return Ok(PhaseMetrics {
            power: delivered,
            current,
        });
    }

    let returned = reading.number_or_zero(&phase.field("PowerReturned"))?;
    Ok(PhaseMetrics {
        power: -returned.abs(),
        current: -current.abs(),
    })
}
