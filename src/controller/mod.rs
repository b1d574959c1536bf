//! Stabilization controller: closed-loop regulation of a measured current.
//!
//! ```text
//! Idle ──start──▶ Converging ──hold_ticks in band──▶ Holding
//!                     ▲                                 │
//!                     └──────────left the band──────────┘
//!
//! Converging | Holding ──device error / timeout──▶ Faulted ──stop──▶ Idle
//! Converging | Holding ──stop──▶ Idle
//! ```
//!
//! Each tick reads the configured current source in µA, asks the selected
//! [`ControlStrategy`] for a voltage delta, clamps it to `max_adjust_voltage` and
//! applies it to the controlled output. The loop works on the magnitude of the
//! voltage, so a negative start voltage keeps its polarity and a delta never drives
//! the output through zero.

pub mod algorithm;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bridge::{CommandBridge, SessionKind};
use crate::error::AppResult;
use crate::instrument::OutputChannel;
use crate::params::StabilizationParameters;
use crate::session::{SessionTask, StopSignal};

pub use algorithm::{build, ControlInput, ControlStrategy};

/// Controller lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    /// Not regulating
    #[default]
    Idle,
    /// Adjusting toward the band
    Converging,
    /// In band for `hold_ticks` consecutive ticks
    Holding,
    /// Halted by a device error or timeout
    Faulted,
}

/// Published controller state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControllerState {
    /// Lifecycle phase
    pub phase: ControllerPhase,
    /// Name of the running control algorithm
    pub algorithm: Option<String>,
    /// Output being driven
    pub output: Option<OutputChannel>,
    /// Target current, µA
    pub target: Option<f64>,
    /// Last commanded voltage
    pub setpoint: Option<f64>,
    /// Last measured current, µA
    pub last_measured: Option<f64>,
    /// Last `target - measured`, µA
    pub last_error: Option<f64>,
    /// Last applied voltage change
    pub last_adjustment: Option<f64>,
    /// Consecutive in-band ticks
    pub in_tolerance_count: u32,
    /// Ticks executed since start
    pub tick_count: u64,
    /// Voltage changes applied since start
    pub adjustment_count: u64,
    /// Fault description while Faulted
    pub fault: Option<String>,
}

impl ControllerState {
    /// True while Converging or Holding.
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            ControllerPhase::Converging | ControllerPhase::Holding
        )
    }
}

/// Clamps a strategy's delta to `±max_adjust`; a non-finite delta becomes zero.
pub fn clamp_delta(delta: f64, max_adjust: f64) -> f64 {
    if delta.is_finite() {
        delta.clamp(-max_adjust, max_adjust)
    } else {
        0.0
    }
}

/// Regulates a current by adjusting an output voltage
pub struct StabilizationController {
    bridge: CommandBridge,
    session: Mutex<Option<SessionTask>>,
}

impl StabilizationController {
    /// Creates an idle controller.
    pub fn new(bridge: CommandBridge) -> Self {
        Self {
            bridge,
            session: Mutex::new(None),
        }
    }

    /// Latest published state.
    pub fn state(&self) -> ControllerState {
        self.bridge.read().controller
    }

    /// Validates `params`, claims the output and starts regulating.
    ///
    /// Fails with `ConfigInvalid` before any command is issued, and with `Conflict`
    /// when stabilization is already running or the sequencer holds the output.
    pub async fn start(&self, params: StabilizationParameters) -> AppResult<()> {
        params.validate()?;

        let mut session = self.session.lock().await;
        self.bridge
            .claim_output(params.output, SessionKind::Controller)
            .await?;

        let state = ControllerState {
            phase: ControllerPhase::Converging,
            algorithm: Some(params.algorithm.name().to_string()),
            output: Some(params.output),
            target: Some(params.target_current),
            ..ControllerState::default()
        };
        if let Err(err) = self.bridge.publish_controller(state.clone()).await {
            let _ = self
                .bridge
                .release_output(params.output, SessionKind::Controller)
                .await;
            return Err(err);
        }

        info!(
            target_ua = params.target_current,
            tolerance = params.tolerance,
            start = params.start_voltage,
            output = %params.output,
            source = ?params.current_source,
            algorithm = params.algorithm.name(),
            "Stabilization started"
        );
        let stabilizer = Stabilizer {
            bridge: self.bridge.clone(),
            strategy: algorithm::build(&params.algorithm),
            polarity: if params.start_voltage < 0.0 { -1.0 } else { 1.0 },
            params,
            state,
        };
        *session = Some(SessionTask::spawn(move |stop| stabilizer.run(stop)));
        Ok(())
    }

    /// Stops regulation at the next tick boundary, leaving the output where it is.
    ///
    /// From Faulted this acknowledges the fault. Always ends in Idle.
    pub async fn stop(&self) -> AppResult<ControllerState> {
        let mut session = self.session.lock().await;
        if let Some(task) = session.take() {
            if !task.is_finished() && task.stop(self.bridge.command_timeout() * 3).await {
                return Ok(self.state());
            }
        }

        let mut state = self.state();
        if state.phase == ControllerPhase::Faulted {
            info!(fault = ?state.fault, "Stabilization fault acknowledged");
            state.fault = None;
        }
        state.phase = ControllerPhase::Idle;
        self.bridge.publish_controller(state.clone()).await?;
        for output in [OutputChannel::HvSource, OutputChannel::SourceMeter] {
            self.bridge
                .release_output(output, SessionKind::Controller)
                .await?;
        }
        Ok(state)
    }
}

/// One stabilization session, owned by its task.
struct Stabilizer {
    bridge: CommandBridge,
    params: StabilizationParameters,
    state: ControllerState,
    strategy: Box<dyn ControlStrategy>,
    polarity: f64,
}

impl Stabilizer {
    async fn run(mut self, mut stop: StopSignal) {
        match self.drive(&mut stop).await {
            Ok(()) => {
                self.state.phase = ControllerPhase::Idle;
                info!(
                    ticks = self.state.tick_count,
                    adjustments = self.state.adjustment_count,
                    "Stabilization stopped"
                );
            }
            Err(err) => {
                error!(error = %err, ticks = self.state.tick_count, "Stabilization faulted");
                self.state.phase = ControllerPhase::Faulted;
                self.state.fault = Some(err.to_string());
            }
        }

        if let Err(err) = self.bridge.publish_controller(self.state.clone()).await {
            warn!(error = %err, "Could not publish final stabilization state");
        }
        if let Err(err) = self
            .bridge
            .release_output(self.params.output, SessionKind::Controller)
            .await
        {
            warn!(error = %err, "Could not release output");
        }
    }

    async fn drive(&mut self, stop: &mut StopSignal) -> AppResult<()> {
        let output = self.params.output;
        let start = self.params.start_voltage;
        self.bridge.set_voltage(output, start).await?;
        if output == OutputChannel::SourceMeter {
            self.bridge.set_source_meter_output(true).await?;
        }
        self.state.setpoint = Some(start);
        self.strategy.applied(start.abs());
        self.bridge.publish_controller(self.state.clone()).await?;

        let period = Duration::from_secs_f64(self.params.adjust_period);
        loop {
            if stop.sleep(period).await {
                return Ok(());
            }
            let measured = self.bridge.read_current(self.params.current_source).await?;
            self.tick(measured).await?;
        }
    }

    async fn tick(&mut self, measured: f64) -> AppResult<()> {
        let params = &self.params;
        let error = params.target_current - measured;
        let input = ControlInput {
            target: params.target_current,
            measured,
            error,
            tolerance: params.tolerance,
            dt: params.adjust_period,
            max_step: params.max_adjust_voltage,
        };
        self.state.tick_count += 1;
        self.state.last_measured = Some(measured);
        self.state.last_error = Some(error);

        if error.abs() <= params.tolerance {
            self.state.in_tolerance_count = self.state.in_tolerance_count.saturating_add(1);
            self.strategy.observe_in_band(&input);
            if self.state.phase == ControllerPhase::Converging
                && self.state.in_tolerance_count >= params.hold_ticks
            {
                info!(measured, ticks = self.state.tick_count, "Current within tolerance, holding");
                self.state.phase = ControllerPhase::Holding;
            }
            return self.bridge.publish_controller(self.state.clone()).await;
        }

        self.state.in_tolerance_count = 0;
        if self.state.phase == ControllerPhase::Holding {
            info!(measured, error, "Current left the tolerance band");
            self.state.phase = ControllerPhase::Converging;
        }

        let delta = clamp_delta(
            self.strategy.next_delta(&input),
            params.max_adjust_voltage,
        );
        if delta != 0.0 {
            let previous = self.state.setpoint.unwrap_or(params.start_voltage);
            let control = (previous.abs() + delta).max(0.0);
            let setpoint = self.polarity * control;
            debug!(measured, error, delta, setpoint, "Adjusting output");

            self.bridge.set_voltage(params.output, setpoint).await?;
            self.strategy.applied(control);
            self.state.setpoint = Some(setpoint);
            self.state.last_adjustment = Some(setpoint - previous);
            self.state.adjustment_count += 1;
        }
        self.bridge.publish_controller(self.state.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_delta_limits_and_discards_nan() {
        assert_eq!(clamp_delta(12.0, 5.0), 5.0);
        assert_eq!(clamp_delta(-12.0, 5.0), -5.0);
        assert_eq!(clamp_delta(2.5, 5.0), 2.5);
        assert_eq!(clamp_delta(f64::NAN, 5.0), 0.0);
        assert_eq!(clamp_delta(f64::INFINITY, 5.0), 0.0);
    }

    #[test]
    fn default_state_is_idle() {
        let state = ControllerState::default();
        assert_eq!(state.phase, ControllerPhase::Idle);
        assert!(!state.is_active());
    }
}
