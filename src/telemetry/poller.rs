//! Instrument poller: keeps cached readings fresh for telemetry.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bridge::CommandBridge;
use crate::error::AppResult;
use crate::instrument::{InstrumentSlot, OutputChannel};
use crate::session::StopSignal;

/// Reads every connected instrument once. Returns the number of successful reads.
///
/// Readings land in the bridge's published state; a failing instrument is marked
/// by the bridge and skipped on later passes until it is reconnected.
pub async fn poll_once(bridge: &CommandBridge) -> usize {
    let state = bridge.read();
    let mut refreshed = 0;
    for handle in state.instruments.iter().filter(|h| h.is_connected()) {
        match read(bridge, handle.slot).await {
            Ok(()) => refreshed += 1,
            Err(err) if err.is_retryable() => {
                debug!(slot = %handle.slot, error = %err, "Poll skipped");
            }
            Err(err) => warn!(slot = %handle.slot, error = %err, "Poll failed"),
        }
    }
    refreshed
}

async fn read(bridge: &CommandBridge, slot: InstrumentSlot) -> AppResult<()> {
    match slot {
        InstrumentSlot::HvSource => bridge.read_voltage(OutputChannel::HvSource).await.map(drop),
        InstrumentSlot::SourceMeter => bridge
            .read_voltage(OutputChannel::SourceMeter)
            .await
            .map(drop),
        meter => bridge.read_meter(meter).await.map(drop),
    }
}

/// Polls every `period` until stopped.
pub async fn run(bridge: CommandBridge, period: Duration, mut stop: StopSignal) {
    info!(?period, "Instrument poller started");
    while !stop.sleep(period).await {
        poll_once(&bridge).await;
    }
    info!("Instrument poller stopped");
}
