//! Helpers shared by the integration tests.
#![allow(dead_code)]

use hv_daq::bridge::{BridgeState, CommandBridge};
use hv_daq::config::BridgeConfig;
use hv_daq::instrument::mock::SimulatedBench;
use hv_daq::instrument::InstrumentSlot;
use std::time::Duration;

/// A bridge over a fresh simulated bench with the HV source and cathode connected.
pub async fn connected_bench() -> (SimulatedBench, CommandBridge) {
    let bench = SimulatedBench::new();
    let (bridge, _task) = CommandBridge::spawn(bench.instruments(), &BridgeConfig::default());
    bridge.connect(InstrumentSlot::HvSource, "COM1").await.unwrap();
    bridge.connect(InstrumentSlot::Cathode, "COM3").await.unwrap();
    (bench, bridge)
}

/// Waits until the bridge publishes a state matching `predicate`.
pub async fn wait_for<F>(bridge: &CommandBridge, what: &str, mut predicate: F) -> BridgeState
where
    F: FnMut(&BridgeState) -> bool,
{
    let mut states = bridge.watch();
    let waited = tokio::time::timeout(Duration::from_secs(60), states.wait_for(|s| predicate(s)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    let state = waited.expect("bridge stopped").clone();
    state
}
