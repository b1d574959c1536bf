//! The shipped configuration file loads and validates.

use hv_daq::config::Settings;
use hv_daq::instrument::{CurrentSource, InstrumentSlot, OutputChannel};
use hv_daq::params::CycleMode;
use std::path::Path;
use std::time::Duration;

#[test]
fn shipped_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/hv_daq.toml");
    let settings = Settings::load(Some(&path)).unwrap();

    assert_eq!(settings.instruments.len(), InstrumentSlot::ALL.len());
    assert_eq!(settings.instruments[&InstrumentSlot::HvSource].port, "COM1");
    assert_eq!(
        settings.instruments[&InstrumentSlot::VacuumGauge].baud_rate,
        Some(19200)
    );
    assert_eq!(settings.bridge.command_timeout, Duration::from_secs(5));
    assert_eq!(settings.telemetry.period, Duration::from_millis(500));
    assert!(settings.telemetry.journal.is_none());

    assert_eq!(settings.test.cycle_mode, CycleMode::Restart);
    assert!(settings.test.is_cyclic());
    assert_eq!(settings.test.rest_voltage, Some(100.0));
    assert_eq!(settings.stabilization.current_source, CurrentSource::Cathode);
    assert_eq!(settings.stabilization.output, OutputChannel::HvSource);
    assert_eq!(settings.stabilization.algorithm.name(), "pid");
}
