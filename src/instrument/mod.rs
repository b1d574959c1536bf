//! Instrument slots, readings and the handle records owned by the command bridge.
//!
//! The bench has a fixed set of slots: one high-voltage source, four current meters
//! (cathode, gate, anode, backup collector), a vacuum gauge and a GPIB source-meter.
//! Every slot is described by an [`InstrumentHandle`]; the only writer of a handle is
//! the bridge owner task, and everybody else sees copies.

pub mod capabilities;
pub mod mock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DaqError;

pub use capabilities::{Instrument, InstrumentSet, Meter, SourceMeter, VoltageSource};

/// One physical instrument position on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentSlot {
    /// High-voltage supply driven by ramp tests.
    HvSource,
    /// Cathode current meter.
    Cathode,
    /// Gate current meter.
    Gate,
    /// Anode current meter.
    Anode,
    /// Backup collector current meter.
    Backup,
    /// Vacuum gauge.
    VacuumGauge,
    /// GPIB source-meter.
    SourceMeter,
}

impl InstrumentSlot {
    /// Every slot, in display order.
    pub const ALL: [InstrumentSlot; 7] = [
        InstrumentSlot::HvSource,
        InstrumentSlot::Cathode,
        InstrumentSlot::Gate,
        InstrumentSlot::Anode,
        InstrumentSlot::Backup,
        InstrumentSlot::VacuumGauge,
        InstrumentSlot::SourceMeter,
    ];

    /// The four current meter slots.
    pub const CURRENT_METERS: [InstrumentSlot; 4] = [
        InstrumentSlot::Cathode,
        InstrumentSlot::Gate,
        InstrumentSlot::Anode,
        InstrumentSlot::Backup,
    ];

    /// Stable lowercase name used in config files and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentSlot::HvSource => "hv_source",
            InstrumentSlot::Cathode => "cathode",
            InstrumentSlot::Gate => "gate",
            InstrumentSlot::Anode => "anode",
            InstrumentSlot::Backup => "backup",
            InstrumentSlot::VacuumGauge => "vacuum_gauge",
            InstrumentSlot::SourceMeter => "source_meter",
        }
    }

    /// True for slots served by the [`Meter`] capability.
    pub fn is_meter(&self) -> bool {
        Self::CURRENT_METERS.contains(self) || *self == InstrumentSlot::VacuumGauge
    }
}

impl fmt::Display for InstrumentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentSlot {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstrumentSlot::ALL
            .into_iter()
            .find(|slot| slot.as_str() == s)
            .ok_or_else(|| DaqError::ConfigInvalid(format!("Unknown instrument slot '{}'", s)))
    }
}

/// Outputs that a session can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    /// The high-voltage supply.
    HvSource,
    /// The source-meter's HV output.
    SourceMeter,
}

impl OutputChannel {
    /// Slot that owns this output.
    pub fn slot(&self) -> InstrumentSlot {
        match self {
            OutputChannel::HvSource => InstrumentSlot::HvSource,
            OutputChannel::SourceMeter => InstrumentSlot::SourceMeter,
        }
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slot().as_str())
    }
}

/// Where the stabilization loop takes its current reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentSource {
    /// Cathode meter.
    Cathode,
    /// Gate meter.
    Gate,
    /// Anode meter.
    Anode,
    /// Backup collector meter.
    Backup,
    /// The source-meter's own current measurement.
    SourceMeter,
}

impl CurrentSource {
    /// Slot that produces this reading.
    pub fn slot(&self) -> InstrumentSlot {
        match self {
            CurrentSource::Cathode => InstrumentSlot::Cathode,
            CurrentSource::Gate => InstrumentSlot::Gate,
            CurrentSource::Anode => InstrumentSlot::Anode,
            CurrentSource::Backup => InstrumentSlot::Backup,
            CurrentSource::SourceMeter => InstrumentSlot::SourceMeter,
        }
    }
}

/// Connection state of an instrument slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Connected and answering.
    Connected,
    /// The last operation failed; the message is the device error.
    Error(String),
}

/// A single value read from an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Measured value, already scaled by the slot coefficient once stored in a handle.
    pub value: f64,
    /// Physical unit ("V", "A", "mA", "uA", "nA", "Pa").
    pub unit: String,
    /// UTC time the value was taken.
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Creates a reading stamped with the current time.
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
        }
    }

    /// Returns a copy with the value multiplied by `coefficient`.
    pub fn scaled(&self, coefficient: f64) -> Self {
        Self {
            value: self.value * coefficient,
            unit: self.unit.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Current in microamps, or `None` when the unit is not a current unit.
    pub fn to_microamps(&self) -> Option<f64> {
        let factor = match self.unit.as_str() {
            "A" => 1e6,
            "mA" => 1e3,
            "uA" | "µA" | "μA" => 1.0,
            "nA" => 1e-3,
            _ => return None,
        };
        Some(self.value * factor)
    }
}

/// Owner-side record for one instrument slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentHandle {
    /// Slot this handle describes.
    pub slot: InstrumentSlot,
    /// Connection state.
    pub state: ConnectionState,
    /// Last value read, scaled by `coefficient`.
    pub last_reading: Option<Reading>,
    /// Last voltage commanded on this slot (output slots only).
    pub setpoint: Option<f64>,
    /// Scaling coefficient applied to raw readings.
    pub coefficient: f64,
    /// Port or VISA resource the instrument is bound to.
    pub port: Option<String>,
}

impl InstrumentHandle {
    /// A disconnected handle with unit coefficient.
    pub fn new(slot: InstrumentSlot) -> Self {
        Self {
            slot,
            state: ConnectionState::Disconnected,
            last_reading: None,
            setpoint: None,
            coefficient: 1.0,
            port: None,
        }
    }

    /// True when the slot is connected.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Value of the last reading, if any.
    pub fn value(&self) -> Option<f64> {
        self.last_reading.as_ref().map(|r| r.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_names_round_trip_through_from_str() {
        for slot in InstrumentSlot::ALL {
            assert_eq!(slot.as_str().parse::<InstrumentSlot>().unwrap(), slot);
        }
        assert!("keithley".parse::<InstrumentSlot>().is_err());
    }

    #[test]
    fn meter_slots() {
        assert!(InstrumentSlot::Anode.is_meter());
        assert!(InstrumentSlot::VacuumGauge.is_meter());
        assert!(!InstrumentSlot::HvSource.is_meter());
        assert!(!InstrumentSlot::SourceMeter.is_meter());
    }

    #[test]
    fn readings_normalise_to_microamps() {
        assert_eq!(Reading::new(1.5, "mA").to_microamps(), Some(1500.0));
        assert_eq!(Reading::new(2.0, "uA").to_microamps(), Some(2.0));
        assert!((Reading::new(2e-6, "A").to_microamps().unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(Reading::new(1e-4, "Pa").to_microamps(), None);
    }

    #[test]
    fn scaling_keeps_unit_and_timestamp() {
        let raw = Reading::new(2.0, "uA");
        let scaled = raw.scaled(1.5);
        assert_eq!(scaled.value, 3.0);
        assert_eq!(scaled.unit, raw.unit);
        assert_eq!(scaled.timestamp, raw.timestamp);
    }

    #[test]
    fn connection_state_serializes_tagged() {
        let json = serde_json::to_string(&ConnectionState::Error("timeout".into())).unwrap();
        assert_eq!(json, r#"{"status":"error","message":"timeout"}"#);
    }
}
