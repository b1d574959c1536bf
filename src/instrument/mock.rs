//! Mock Instrument Implementations
//!
//! Simulated bench instruments for tests and for running the binary without hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockVoltageSource` - Simulated HV supply that records every commanded voltage
//! - `MockMeter` - Current meter or vacuum gauge, fixed or linked to an output voltage
//! - `MockSourceMeter` - Simulated GPIB source-meter
//! - `SimulatedBench` - A complete bench wired so that meter currents follow the HV output
//!
//! Mocks are cheap to clone and clones share state, so a test keeps one clone to inspect
//! while the bridge owns the other.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use super::capabilities::{Instrument, InstrumentSet, Meter, SourceMeter, VoltageSource};
use super::{InstrumentSlot, Reading};

// =============================================================================
// OverlapMonitor - detects concurrent hardware access
// =============================================================================

/// Shared detector that records whether two mock operations were ever in flight at once.
#[derive(Clone, Default)]
pub struct OverlapMonitor {
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    operations: Arc<AtomicUsize>,
}

impl OverlapMonitor {
    /// Creates a monitor with no recorded operations.
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) -> MonitorGuard<'_> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.operations.fetch_add(1, Ordering::SeqCst);
        MonitorGuard { monitor: self }
    }

    /// Number of operations that started while another was still running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Total operations observed.
    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }
}

struct MonitorGuard<'a> {
    monitor: &'a OverlapMonitor,
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.monitor.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Connection flag, fault injection and timing shared by all mocks.
struct DeviceCore {
    name: &'static str,
    connected: AtomicBool,
    failing: AtomicBool,
    latency: Duration,
    monitor: Option<OverlapMonitor>,
}

impl DeviceCore {
    fn new(name: &'static str, latency: Duration, monitor: Option<OverlapMonitor>) -> Self {
        Self {
            name,
            connected: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            latency,
            monitor,
        }
    }

    /// Runs the common preamble of an operation: monitor, latency, connection and fault checks.
    async fn operate(&self) -> Result<()> {
        let _guard = self.monitor.as_ref().map(OverlapMonitor::enter);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            bail!("{} is not connected", self.name);
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("{} reported a device fault", self.name);
        }
        Ok(())
    }

    fn connect(&self, port: &str) -> Result<()> {
        if port.trim().is_empty() {
            bail!("{}: no port bound", self.name);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockVoltageSource - Simulated HV Supply
// =============================================================================

/// Mock high-voltage supply.
///
/// Readback returns exactly the last commanded voltage. Every successful set is appended
/// to a history that tests inspect through a clone.
#[derive(Clone)]
pub struct MockVoltageSource {
    core: Arc<DeviceCore>,
    voltage: Arc<RwLock<f64>>,
    history: Arc<RwLock<Vec<f64>>>,
    fail_after_sets: Arc<AtomicUsize>,
}

impl MockVoltageSource {
    /// Create a mock supply at 0 V.
    pub fn new() -> Self {
        Self::build("hv_source", Duration::ZERO, None)
    }

    /// Create a mock supply whose operations take `latency` and report to `monitor`.
    pub fn with_timing(latency: Duration, monitor: Option<OverlapMonitor>) -> Self {
        Self::build("hv_source", latency, monitor)
    }

    fn build(name: &'static str, latency: Duration, monitor: Option<OverlapMonitor>) -> Self {
        Self {
            core: Arc::new(DeviceCore::new(name, latency, monitor)),
            voltage: Arc::new(RwLock::new(0.0)),
            history: Arc::new(RwLock::new(Vec::new())),
            fail_after_sets: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    /// Shared cell holding the output voltage, used to link simulated meters.
    pub fn voltage_cell(&self) -> Arc<RwLock<f64>> {
        Arc::clone(&self.voltage)
    }

    /// Every voltage successfully commanded so far.
    pub async fn history(&self) -> Vec<f64> {
        self.history.read().await.clone()
    }

    /// Current output voltage.
    pub async fn voltage(&self) -> f64 {
        *self.voltage.read().await
    }

    /// Make every operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.core.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail every set after `count` successful ones.
    pub fn fail_after_sets(&self, count: usize) {
        self.fail_after_sets.store(count, Ordering::SeqCst);
    }
}

impl Default for MockVoltageSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Instrument for MockVoltageSource {
    async fn connect(&self, port: &str) -> Result<()> {
        self.core.connect(port)
    }

    async fn disconnect(&self) -> Result<()> {
        self.core.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl VoltageSource for MockVoltageSource {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.core.operate().await?;
        let mut history = self.history.write().await;
        if history.len() >= self.fail_after_sets.load(Ordering::SeqCst) {
            bail!("{} rejected setpoint {:.1} V", self.core.name, volts);
        }
        history.push(volts);
        *self.voltage.write().await = volts;
        Ok(())
    }

    async fn read_voltage(&self) -> Result<f64> {
        self.core.operate().await?;
        Ok(*self.voltage.read().await)
    }
}

// =============================================================================
// MockMeter - Simulated Current Meter / Vacuum Gauge
// =============================================================================

/// How a mock meter derives its value.
#[derive(Clone)]
pub enum MeterModel {
    /// Always reads the same value.
    Fixed(f64),
    /// Reads `gain * voltage`, with relative jitter, from a linked output.
    Linked {
        /// Output voltage cell.
        voltage: Arc<RwLock<f64>>,
        /// Value per volt.
        gain: f64,
        /// Relative noise amplitude (0.01 = ±1%).
        jitter: f64,
    },
}

/// Mock meter.
#[derive(Clone)]
pub struct MockMeter {
    core: Arc<DeviceCore>,
    model: Arc<RwLock<MeterModel>>,
    unit: &'static str,
    reads: Arc<AtomicUsize>,
}

impl MockMeter {
    /// A meter that always reads `value` in `unit`.
    pub fn fixed(name: &'static str, value: f64, unit: &'static str) -> Self {
        Self::with_model(name, MeterModel::Fixed(value), unit, Duration::ZERO, None)
    }

    /// A meter with an explicit model, latency and monitor.
    pub fn with_model(
        name: &'static str,
        model: MeterModel,
        unit: &'static str,
        latency: Duration,
        monitor: Option<OverlapMonitor>,
    ) -> Self {
        Self {
            core: Arc::new(DeviceCore::new(name, latency, monitor)),
            model: Arc::new(RwLock::new(model)),
            unit,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pin the reading to `value`.
    pub async fn set_value(&self, value: f64) {
        *self.model.write().await = MeterModel::Fixed(value);
    }

    /// Make every operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.core.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful reads.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

fn jittered(value: f64, jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return value;
    }
    value * (1.0 + rand::thread_rng().gen_range(-jitter..=jitter))
}

#[async_trait]
impl Instrument for MockMeter {
    async fn connect(&self, port: &str) -> Result<()> {
        self.core.connect(port)
    }

    async fn disconnect(&self) -> Result<()> {
        self.core.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Meter for MockMeter {
    async fn read(&self) -> Result<Reading> {
        self.core.operate().await?;
        let model = self.model.read().await.clone();
        let value = match model {
            MeterModel::Fixed(value) => value,
            MeterModel::Linked {
                voltage,
                gain,
                jitter,
            } => {
                let volts = *voltage.read().await;
                jittered(volts * gain, jitter)
            }
        };
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Reading::new(value, self.unit))
    }
}

// =============================================================================
// MockSourceMeter - Simulated GPIB Source-Meter
// =============================================================================

/// Mock source-meter. Current follows the output voltage only while the output is enabled.
#[derive(Clone)]
pub struct MockSourceMeter {
    source: MockVoltageSource,
    output_enabled: Arc<AtomicBool>,
    current: Arc<RwLock<MeterModel>>,
}

impl MockSourceMeter {
    /// A source-meter whose current is `gain` amps per volt of output.
    pub fn new(gain: f64) -> Self {
        let source = MockVoltageSource::build("source_meter", Duration::ZERO, None);
        let current = MeterModel::Linked {
            voltage: source.voltage_cell(),
            gain,
            jitter: 0.0,
        };
        Self {
            source,
            output_enabled: Arc::new(AtomicBool::new(false)),
            current: Arc::new(RwLock::new(current)),
        }
    }

    /// Pin the current reading to `amps`.
    pub async fn set_current(&self, amps: f64) {
        *self.current.write().await = MeterModel::Fixed(amps);
    }

    /// Whether the HV output relay is on.
    pub fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    /// Every voltage successfully commanded so far.
    pub async fn history(&self) -> Vec<f64> {
        self.source.history().await
    }
}

#[async_trait]
impl Instrument for MockSourceMeter {
    async fn connect(&self, port: &str) -> Result<()> {
        self.source.connect(port).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.output_enabled.store(false, Ordering::SeqCst);
        self.source.disconnect().await
    }
}

#[async_trait]
impl VoltageSource for MockSourceMeter {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.source.set_voltage(volts).await
    }

    async fn read_voltage(&self) -> Result<f64> {
        self.source.read_voltage().await
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    async fn read_current(&self) -> Result<Reading> {
        self.source.core.operate().await?;
        let model = self.current.read().await.clone();
        let amps = match model {
            MeterModel::Fixed(amps) => amps,
            MeterModel::Linked { .. } if !self.output_enabled() => 0.0,
            MeterModel::Linked {
                voltage,
                gain,
                jitter,
            } => jittered(*voltage.read().await * gain, jitter),
        };
        Ok(Reading::new(amps, "A"))
    }

    async fn set_output_enabled(&self, enabled: bool) -> Result<()> {
        self.source.core.operate().await?;
        self.output_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// SimulatedBench - complete simulated test bench
// =============================================================================

/// A full simulated bench. Meter currents are proportional to the HV output.
#[derive(Clone)]
pub struct SimulatedBench {
    /// HV supply.
    pub hv_source: MockVoltageSource,
    /// Cathode meter, µA.
    pub cathode: MockMeter,
    /// Gate meter, µA.
    pub gate: MockMeter,
    /// Anode meter, µA.
    pub anode: MockMeter,
    /// Backup collector meter, µA.
    pub backup: MockMeter,
    /// Vacuum gauge, Pa.
    pub vacuum: MockMeter,
    /// Source-meter.
    pub source_meter: MockSourceMeter,
}

impl SimulatedBench {
    /// Bench whose meters follow the HV output with ±1% noise.
    pub fn new() -> Self {
        let hv_source = MockVoltageSource::new();
        let linked = |name, gain| {
            MockMeter::with_model(
                name,
                MeterModel::Linked {
                    voltage: hv_source.voltage_cell(),
                    gain,
                    jitter: 0.01,
                },
                "uA",
                Duration::ZERO,
                None,
            )
        };
        Self {
            cathode: linked("cathode", 0.010),
            gate: linked("gate", 0.002),
            anode: linked("anode", 0.007),
            backup: linked("backup", 0.001),
            vacuum: MockMeter::with_model(
                "vacuum_gauge",
                MeterModel::Fixed(2.0e-5),
                "Pa",
                Duration::ZERO,
                None,
            ),
            source_meter: MockSourceMeter::new(1.0e-8),
            hv_source,
        }
    }

    /// Bench of fixed-value meters whose every operation takes `latency` and reports to
    /// `monitor`.
    pub fn instrumented(latency: Duration, monitor: &OverlapMonitor) -> Self {
        let meter = |name, value| {
            MockMeter::with_model(
                name,
                MeterModel::Fixed(value),
                "uA",
                latency,
                Some(monitor.clone()),
            )
        };
        Self {
            hv_source: MockVoltageSource::with_timing(latency, Some(monitor.clone())),
            cathode: meter("cathode", 1.0),
            gate: meter("gate", 0.2),
            anode: meter("anode", 0.7),
            backup: meter("backup", 0.1),
            vacuum: MockMeter::with_model(
                "vacuum_gauge",
                MeterModel::Fixed(2.0e-5),
                "Pa",
                latency,
                Some(monitor.clone()),
            ),
            source_meter: MockSourceMeter::new(1.0e-8),
        }
    }

    /// Boxes clones of every instrument for the bridge owner.
    pub fn instruments(&self) -> InstrumentSet {
        let mut meters: BTreeMap<InstrumentSlot, Box<dyn Meter>> = BTreeMap::new();
        meters.insert(InstrumentSlot::Cathode, Box::new(self.cathode.clone()));
        meters.insert(InstrumentSlot::Gate, Box::new(self.gate.clone()));
        meters.insert(InstrumentSlot::Anode, Box::new(self.anode.clone()));
        meters.insert(InstrumentSlot::Backup, Box::new(self.backup.clone()));
        meters.insert(InstrumentSlot::VacuumGauge, Box::new(self.vacuum.clone()));
        InstrumentSet {
            hv_source: Box::new(self.hv_source.clone()),
            meters,
            source_meter: Box::new(self.source_meter.clone()),
        }
    }

    /// The mock meter behind a current-meter or vacuum slot.
    pub fn meter(&self, slot: InstrumentSlot) -> Result<&MockMeter> {
        match slot {
            InstrumentSlot::Cathode => Ok(&self.cathode),
            InstrumentSlot::Gate => Ok(&self.gate),
            InstrumentSlot::Anode => Ok(&self.anode),
            InstrumentSlot::Backup => Ok(&self.backup),
            InstrumentSlot::VacuumGauge => Ok(&self.vacuum),
            other => Err(anyhow!("{} is not a meter slot", other)),
        }
    }
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new()
    }
}
