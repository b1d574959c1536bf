//! Capability traits implemented by bench instruments.
//!
//! Wire protocols live behind these traits; the bridge owner is the only caller, so
//! implementations may assume that no two operations on the same instrument overlap.
//! Every method returns `anyhow::Result` and the bridge converts failures into
//! [`DaqError::Device`](crate::error::DaqError::Device).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{InstrumentSlot, OutputChannel, Reading};

/// Connection lifecycle shared by every instrument.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Opens the transport bound to `port`.
    async fn connect(&self, port: &str) -> Result<()>;
    /// Closes the transport. Disconnecting an idle instrument is not an error.
    async fn disconnect(&self) -> Result<()>;
}

/// Capability for programmable voltage outputs.
#[async_trait]
pub trait VoltageSource: Instrument {
    /// Commands the output voltage.
    async fn set_voltage(&self, volts: f64) -> Result<()>;
    /// Reads back the voltage actually present at the output.
    async fn read_voltage(&self) -> Result<f64>;
}

/// Capability for instruments that report a single measured value.
#[async_trait]
pub trait Meter: Instrument {
    /// Takes one reading in the instrument's native unit.
    async fn read(&self) -> Result<Reading>;
}

/// Capability for a source-meter: a voltage output with its own current measurement.
#[async_trait]
pub trait SourceMeter: VoltageSource {
    /// Measures the current flowing through the output.
    async fn read_current(&self) -> Result<Reading>;
    /// Switches the HV output relay.
    async fn set_output_enabled(&self, enabled: bool) -> Result<()>;
}

/// The full instrument bench handed to the bridge owner at spawn time.
pub struct InstrumentSet {
    /// High-voltage supply.
    pub hv_source: Box<dyn VoltageSource>,
    /// Current meters and the vacuum gauge, keyed by slot.
    pub meters: BTreeMap<InstrumentSlot, Box<dyn Meter>>,
    /// GPIB source-meter.
    pub source_meter: Box<dyn SourceMeter>,
}

impl InstrumentSet {
    /// Meter installed in `slot`.
    pub fn meter(&self, slot: InstrumentSlot) -> Result<&dyn Meter> {
        self.meters
            .get(&slot)
            .map(|m| m.as_ref())
            .ok_or_else(|| anyhow!("no meter installed in slot {}", slot))
    }

    /// Opens the instrument in `slot`.
    pub async fn connect(&self, slot: InstrumentSlot, port: &str) -> Result<()> {
        match slot {
            InstrumentSlot::HvSource => self.hv_source.connect(port).await,
            InstrumentSlot::SourceMeter => self.source_meter.connect(port).await,
            meter => self.meter(meter)?.connect(port).await,
        }
    }

    /// Closes the instrument in `slot`.
    pub async fn disconnect(&self, slot: InstrumentSlot) -> Result<()> {
        match slot {
            InstrumentSlot::HvSource => self.hv_source.disconnect().await,
            InstrumentSlot::SourceMeter => self.source_meter.disconnect().await,
            meter => self.meter(meter)?.disconnect().await,
        }
    }

    /// Commands the voltage of an output.
    pub async fn set_voltage(&self, output: OutputChannel, volts: f64) -> Result<()> {
        match output {
            OutputChannel::HvSource => self.hv_source.set_voltage(volts).await,
            OutputChannel::SourceMeter => self.source_meter.set_voltage(volts).await,
        }
    }

    /// Reads back the voltage of an output.
    pub async fn read_voltage(&self, output: OutputChannel) -> Result<f64> {
        match output {
            OutputChannel::HvSource => self.hv_source.read_voltage().await,
            OutputChannel::SourceMeter => self.source_meter.read_voltage().await,
        }
    }
}
