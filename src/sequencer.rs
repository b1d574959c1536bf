//! Test sequencer: single and cyclic voltage ramps on the HV source.
//!
//! ```text
//! Idle ──start──▶ Ramping ──target reached──▶ Stopped            (cycle_time = 0)
//!                    │  ▲
//!      target reached│  │cycle_time elapsed                      (cycle_time > 0)
//!                    ▼  │
//!                CyclePausing
//!
//! Ramping | CyclePausing ──device error / timeout──▶ Faulted ──stop──▶ Stopped
//! ```
//!
//! The ramp runs as its own task and touches the hardware only through the command
//! bridge. Its state is published through the bridge as well, so the owner stays the
//! only writer and every telemetry snapshot sees a consistent copy.

use serde::{Deserialize, Serialize};
use std::mem;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bridge::{CommandBridge, SessionKind};
use crate::error::AppResult;
use crate::instrument::OutputChannel;
use crate::params::{CycleMode, TestParameters};
use crate::session::{SessionTask, StopSignal};

const OUTPUT: OutputChannel = OutputChannel::HvSource;

/// Sequencer lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerPhase {
    /// Never started
    #[default]
    Idle,
    /// Stepping toward the pass target
    Ramping,
    /// Holding between passes of a cyclic test
    CyclePausing,
    /// Finished, stopped by the operator, or fault acknowledged
    Stopped,
    /// Halted by a device error or timeout
    Faulted,
}

/// Published sequencer state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SequencerState {
    /// Lifecycle phase
    pub phase: SequencerPhase,
    /// Last commanded HV voltage
    pub setpoint: Option<f64>,
    /// HV voltage read back at the last tick
    pub readback: Option<f64>,
    /// Target of the current pass
    pub pass_target: Option<f64>,
    /// Ticks executed since start
    pub step_count: u64,
    /// Pass number, starting at 1
    pub cycle: u32,
    /// Outcome of the last command
    pub last_result: Option<String>,
    /// Fault description while Faulted
    pub fault: Option<String>,
}

impl SequencerState {
    /// True while Ramping or CyclePausing.
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            SequencerPhase::Ramping | SequencerPhase::CyclePausing
        )
    }
}

/// Next setpoint of a ramp: one step further, never past `target`.
pub fn next_setpoint(current: f64, step: f64, target: f64) -> f64 {
    let next = current + step;
    let overshoot = if step > 0.0 {
        next >= target
    } else {
        next <= target
    };
    if overshoot || (target - next).abs() <= step.abs() * 1e-9 {
        target
    } else {
        next
    }
}

/// Runs ramp tests on the HV source
pub struct TestSequencer {
    bridge: CommandBridge,
    safe_voltage: f64,
    session: Mutex<Option<SessionTask>>,
}

enum RampEnd {
    Completed,
    Stopped,
}

impl TestSequencer {
    /// Creates an idle sequencer; `safe_voltage` is what [`reset_voltage`](Self::reset_voltage)
    /// applies.
    pub fn new(bridge: CommandBridge, safe_voltage: f64) -> Self {
        Self {
            bridge,
            safe_voltage,
            session: Mutex::new(None),
        }
    }

    /// Latest published state.
    pub fn state(&self) -> SequencerState {
        self.bridge.read().sequencer
    }

    /// Validates `params`, claims the HV output and starts ramping.
    ///
    /// Fails with `ConfigInvalid` before any command is issued, and with `Conflict`
    /// when a ramp is already running or the controller holds the HV output.
    pub async fn start(&self, params: TestParameters) -> AppResult<()> {
        params.validate()?;

        let mut session = self.session.lock().await;
        self.bridge.claim_output(OUTPUT, SessionKind::Sequencer).await?;

        let state = SequencerState {
            phase: SequencerPhase::Ramping,
            pass_target: Some(params.target_voltage),
            cycle: 1,
            last_result: Some("started".to_string()),
            ..SequencerState::default()
        };
        if let Err(err) = self.bridge.publish_sequencer(state.clone()).await {
            let _ = self.bridge.release_output(OUTPUT, SessionKind::Sequencer).await;
            return Err(err);
        }

        info!(
            start = params.start_voltage,
            target = params.target_voltage,
            step = params.voltage_step,
            cyclic = params.is_cyclic(),
            mode = ?params.cycle_mode,
            "Ramp test started"
        );
        let ramp = Ramp {
            bridge: self.bridge.clone(),
            params,
            state,
        };
        *session = Some(SessionTask::spawn(move |stop| ramp.run(stop)));
        Ok(())
    }

    /// Stops a running ramp at its next tick boundary, leaving the output where it is.
    ///
    /// From Faulted this acknowledges the fault. Always ends in Stopped.
    pub async fn stop(&self) -> AppResult<SequencerState> {
        let mut session = self.session.lock().await;
        if let Some(task) = session.take() {
            if !task.is_finished() && task.stop(self.stop_grace()).await {
                return Ok(self.state());
            }
        }

        let mut state = self.state();
        if state.phase == SequencerPhase::Faulted {
            info!(fault = ?state.fault, "Ramp test fault acknowledged");
            state.fault = None;
            state.last_result = Some("fault acknowledged".to_string());
        }
        state.phase = SequencerPhase::Stopped;
        self.bridge.publish_sequencer(state.clone()).await?;
        self.bridge
            .release_output(OUTPUT, SessionKind::Sequencer)
            .await?;
        Ok(state)
    }

    /// Sets the HV output to the configured safe voltage, whatever the state.
    pub async fn reset_voltage(&self) -> AppResult<()> {
        info!(volts = self.safe_voltage, "Resetting HV output to safe voltage");
        self.bridge.set_voltage(OUTPUT, self.safe_voltage).await
    }

    fn stop_grace(&self) -> Duration {
        self.bridge.command_timeout() * 3
    }
}

/// One ramp session, owned by its task.
struct Ramp {
    bridge: CommandBridge,
    params: TestParameters,
    state: SequencerState,
}

impl Ramp {
    async fn run(mut self, mut stop: StopSignal) {
        match self.drive(&mut stop).await {
            Ok(end) => {
                self.state.phase = SequencerPhase::Stopped;
                let outcome = match end {
                    RampEnd::Completed => "completed",
                    RampEnd::Stopped => "stopped",
                };
                self.state.last_result = Some(outcome.to_string());
                info!(
                    steps = self.state.step_count,
                    cycles = self.state.cycle,
                    outcome,
                    "Ramp test finished"
                );
            }
            Err(err) => {
                error!(error = %err, steps = self.state.step_count, "Ramp test faulted");
                self.state.phase = SequencerPhase::Faulted;
                self.state.last_result = Some(format!("failed: {}", err));
                self.state.fault = Some(err.to_string());
            }
        }

        if let Err(err) = self.bridge.publish_sequencer(self.state.clone()).await {
            warn!(error = %err, "Could not publish final ramp state");
        }
        if let Err(err) = self
            .bridge
            .release_output(OUTPUT, SessionKind::Sequencer)
            .await
        {
            warn!(error = %err, "Could not release HV output");
        }
    }

    async fn drive(&mut self, stop: &mut StopSignal) -> AppResult<RampEnd> {
        let delay = Duration::from_secs_f64(self.params.step_delay);
        let pause = Duration::from_secs_f64(self.params.cycle_time);
        let mut from = self.params.start_voltage;
        let mut to = self.params.target_voltage;
        let mut step = self.params.voltage_step;

        loop {
            self.state.pass_target = Some(to);
            self.command(from, "pass start").await?;
            if stop.sleep(delay).await {
                return Ok(RampEnd::Stopped);
            }

            let mut setpoint = from;
            loop {
                if stop.is_set() {
                    return Ok(RampEnd::Stopped);
                }
                self.state.readback = Some(self.bridge.read_voltage(OUTPUT).await?);
                setpoint = next_setpoint(setpoint, step, to);
                self.bridge.set_voltage(OUTPUT, setpoint).await?;
                self.state.setpoint = Some(setpoint);
                self.state.step_count += 1;
                self.state.last_result = Some(format!("set {:.1} V", setpoint));
                self.bridge.publish_sequencer(self.state.clone()).await?;

                if setpoint == to {
                    break;
                }
                if stop.sleep(delay).await {
                    return Ok(RampEnd::Stopped);
                }
            }

            if !self.params.is_cyclic() {
                if let Some(rest) = self.params.rest_voltage {
                    self.command(rest, "rest").await?;
                }
                return Ok(RampEnd::Completed);
            }

            info!(cycle = self.state.cycle, "Ramp pass complete, pausing");
            self.state.phase = SequencerPhase::CyclePausing;
            match self.params.rest_voltage {
                Some(rest) => self.command(rest, "rest").await?,
                None => self.bridge.publish_sequencer(self.state.clone()).await?,
            }
            if stop.sleep(pause).await {
                return Ok(RampEnd::Stopped);
            }

            self.state.cycle += 1;
            self.state.phase = SequencerPhase::Ramping;
            if self.params.cycle_mode == CycleMode::Reverse {
                mem::swap(&mut from, &mut to);
                step = -step;
            }
        }
    }

    /// Sets the output outside the stepping loop; not counted as a tick.
    async fn command(&mut self, volts: f64, what: &str) -> AppResult<()> {
        self.bridge.set_voltage(OUTPUT, volts).await?;
        self.state.setpoint = Some(volts);
        self.state.last_result = Some(format!("{}: set {:.1} V", what, volts));
        self.bridge.publish_sequencer(self.state.clone()).await
    }
}
