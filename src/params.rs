//! Session parameters for ramp tests and current stabilization.
//!
//! Both parameter sets are plain serde structs so they can live in the TOML config,
//! travel through the HTTP API and be stored by the config store. `validate()` is the
//! single place their invariants are checked.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::instrument::{CurrentSource, OutputChannel};

/// Output level a ramp parks at between passes unless configured otherwise.
pub const DEFAULT_REST_VOLTAGE: f64 = 100.0;

/// How a cyclic ramp test continues after each pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleMode {
    /// Every pass starts over from the start voltage.
    #[default]
    Restart,
    /// Passes alternate direction: start → target, target → start, ...
    Reverse,
}

/// Voltage ramp parameters. Voltages in volts, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestParameters {
    pub start_voltage: f64,
    pub target_voltage: f64,
    /// Signed increment per tick; its sign must point from start to target.
    pub voltage_step: f64,
    /// Seconds between ticks.
    pub step_delay: f64,
    /// Pause between passes. 0 runs a single pass.
    pub cycle_time: f64,
    pub cycle_mode: CycleMode,
    /// Voltage applied after a single pass completes and during cycle pauses.
    /// `None` leaves the output at the end of the pass.
    pub rest_voltage: Option<f64>,
}

impl Default for TestParameters {
    fn default() -> Self {
        Self {
            start_voltage: 0.0,
            target_voltage: 1000.0,
            voltage_step: 10.0,
            step_delay: 1.0,
            cycle_time: 10.0,
            cycle_mode: CycleMode::Restart,
            rest_voltage: Some(DEFAULT_REST_VOLTAGE),
        }
    }
}

impl TestParameters {
    /// Checks every invariant; the error names the first violation found.
    pub fn validate(&self) -> AppResult<()> {
        let finite = [
            ("start_voltage", self.start_voltage),
            ("target_voltage", self.target_voltage),
            ("voltage_step", self.voltage_step),
            ("step_delay", self.step_delay),
            ("cycle_time", self.cycle_time),
        ];
        for (name, value) in finite {
            ensure_finite(name, value)?;
        }
        if let Some(rest) = self.rest_voltage {
            ensure_finite("rest_voltage", rest)?;
        }
        if self.voltage_step == 0.0 {
            return invalid("voltage_step must not be zero");
        }
        if self.start_voltage == self.target_voltage {
            return invalid("start_voltage and target_voltage must differ");
        }
        if (self.target_voltage - self.start_voltage).signum() != self.voltage_step.signum() {
            return invalid(format!(
                "voltage_step {} moves away from target {} V (start {} V)",
                self.voltage_step, self.target_voltage, self.start_voltage
            ));
        }
        if self.step_delay < 0.0 {
            return invalid("step_delay must be >= 0");
        }
        if self.cycle_time < 0.0 {
            return invalid("cycle_time must be >= 0");
        }
        Ok(())
    }

    /// True when the test repeats.
    pub fn is_cyclic(&self) -> bool {
        self.cycle_time > 0.0
    }

    /// A copy that runs one pass only.
    pub fn single_pass(&self) -> Self {
        Self {
            cycle_time: 0.0,
            ..self.clone()
        }
    }
}

/// PID gains and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidTuning {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Bound on the accumulated integral. `None` derives it from the output limit.
    pub integral_limit: Option<f64>,
}

impl Default for PidTuning {
    fn default() -> Self {
        Self {
            kp: 0.05,
            ki: 0.01,
            kd: 0.0,
            integral_limit: None,
        }
    }
}

/// Tuning for the adaptive coarse/fine controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTuning {
    /// EMA weight of the newest current sample.
    pub filter_alpha: f64,
    /// EMA weight of the newest dI/dV estimate.
    pub slope_alpha: f64,
    /// Enter coarse mode above this multiple of the tolerance.
    pub coarse_enter: f64,
    /// Leave coarse mode below this multiple of the tolerance.
    pub coarse_exit: f64,
    /// Seconds to wait after a set before adjusting again.
    pub settle_time: f64,
    /// Seconds over which error sign flips count as oscillation.
    pub oscillation_window: f64,
    /// Smallest non-zero adjustment, in volts.
    pub min_step: f64,
    /// Gains used in fine mode.
    pub pid: PidTuning,
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            filter_alpha: 0.3,
            slope_alpha: 0.4,
            coarse_enter: 6.0,
            coarse_exit: 2.5,
            settle_time: 1.2,
            oscillation_window: 12.0,
            min_step: 1.0,
            pid: PidTuning::default(),
        }
    }
}

/// Stabilization algorithm with its tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlAlgorithm {
    /// Proportional-integral-derivative law.
    Pid(PidTuning),
    /// Fixed steps toward the band.
    Approach {
        /// Volts per adjustment.
        #[serde(default = "default_approach_step")]
        step: f64,
    },
    /// Slope-estimating coarse/fine controller.
    Adaptive(AdaptiveTuning),
}

fn default_approach_step() -> f64 {
    1.0
}

impl Default for ControlAlgorithm {
    fn default() -> Self {
        ControlAlgorithm::Pid(PidTuning::default())
    }
}

impl ControlAlgorithm {
    /// Short name used in logs and state.
    pub fn name(&self) -> &'static str {
        match self {
            ControlAlgorithm::Pid(_) => "pid",
            ControlAlgorithm::Approach { .. } => "approach",
            ControlAlgorithm::Adaptive(_) => "adaptive",
        }
    }

    fn validate(&self) -> AppResult<()> {
        let check_pid = |pid: &PidTuning| -> AppResult<()> {
            ensure_finite("kp", pid.kp)?;
            ensure_finite("ki", pid.ki)?;
            ensure_finite("kd", pid.kd)?;
            if let Some(limit) = pid.integral_limit {
                if !(limit.is_finite() && limit > 0.0) {
                    return invalid("integral_limit must be > 0");
                }
            }
            Ok(())
        };
        match self {
            ControlAlgorithm::Pid(pid) => check_pid(pid),
            ControlAlgorithm::Approach { step } => {
                if step.is_finite() && *step > 0.0 {
                    Ok(())
                } else {
                    invalid("approach step must be > 0")
                }
            }
            ControlAlgorithm::Adaptive(tuning) => {
                check_pid(&tuning.pid)?;
                for (name, alpha) in [
                    ("filter_alpha", tuning.filter_alpha),
                    ("slope_alpha", tuning.slope_alpha),
                ] {
                    if !(alpha > 0.0 && alpha <= 1.0) {
                        return invalid(format!("{} must be in (0, 1]", name));
                    }
                }
                if !(tuning.coarse_exit > 0.0 && tuning.coarse_enter > tuning.coarse_exit) {
                    return invalid("coarse_enter must exceed coarse_exit > 0");
                }
                ensure_non_negative("settle_time", tuning.settle_time)?;
                ensure_non_negative("oscillation_window", tuning.oscillation_window)?;
                ensure_non_negative("min_step", tuning.min_step)
            }
        }
    }
}

/// Current stabilization parameters. Currents in µA, voltages in volts, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationParameters {
    pub target_current: f64,
    /// Half-width of the acceptance band around the target.
    pub tolerance: f64,
    pub start_voltage: f64,
    /// Seconds between corrections.
    pub adjust_period: f64,
    /// Largest voltage change applied in one tick.
    pub max_adjust_voltage: f64,
    pub current_source: CurrentSource,
    pub output: OutputChannel,
    pub algorithm: ControlAlgorithm,
    /// Consecutive in-band ticks required before holding.
    pub hold_ticks: u32,
}

impl Default for StabilizationParameters {
    fn default() -> Self {
        Self {
            target_current: 1000.0,
            tolerance: 5.0,
            start_voltage: 100.0,
            adjust_period: 1.0,
            max_adjust_voltage: 50.0,
            current_source: CurrentSource::Cathode,
            output: OutputChannel::HvSource,
            algorithm: ControlAlgorithm::default(),
            hold_ticks: 3,
        }
    }
}

impl StabilizationParameters {
    /// Checks every invariant; the error names the first violation found.
    pub fn validate(&self) -> AppResult<()> {
        ensure_finite("target_current", self.target_current)?;
        ensure_finite("start_voltage", self.start_voltage)?;
        ensure_positive("tolerance", self.tolerance)?;
        ensure_positive("max_adjust_voltage", self.max_adjust_voltage)?;
        ensure_positive("adjust_period", self.adjust_period)?;
        if self.hold_ticks < 1 {
            return invalid("hold_ticks must be >= 1");
        }
        self.algorithm.validate()
    }
}

fn invalid<T>(message: impl Into<String>) -> AppResult<T> {
    Err(DaqError::ConfigInvalid(message.into()))
}

fn ensure_finite(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        invalid(format!("{} must be finite, got {}", name, value))
    }
}

fn ensure_positive(name: &str, value: f64) -> AppResult<()> {
    ensure_finite(name, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        invalid(format!("{} must be > 0, got {}", name, value))
    }
}

fn ensure_non_negative(name: &str, value: f64) -> AppResult<()> {
    ensure_finite(name, value)?;
    if value >= 0.0 {
        Ok(())
    } else {
        invalid(format!("{} must be >= 0, got {}", name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: f64, target: f64, step: f64) -> TestParameters {
        TestParameters {
            start_voltage: start,
            target_voltage: target,
            voltage_step: step,
            step_delay: 0.0,
            cycle_time: 0.0,
            ..TestParameters::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        TestParameters::default().validate().unwrap();
        StabilizationParameters::default().validate().unwrap();
    }

    #[test]
    fn ramp_invariants() {
        assert!(ramp(0.0, 100.0, 10.0).validate().is_ok());
        assert!(ramp(100.0, 0.0, -10.0).validate().is_ok());
        assert!(matches!(
            ramp(0.0, 100.0, 0.0).validate(),
            Err(DaqError::ConfigInvalid(_))
        ));
        assert!(ramp(50.0, 50.0, 1.0).validate().is_err());
        assert!(ramp(0.0, 100.0, -10.0).validate().is_err());
        assert!(ramp(0.0, f64::NAN, 10.0).validate().is_err());

        let mut negative_delay = ramp(0.0, 100.0, 10.0);
        negative_delay.step_delay = -1.0;
        assert!(negative_delay.validate().is_err());
    }

    #[test]
    fn stabilization_invariants() {
        let base = StabilizationParameters::default();
        for broken in [
            StabilizationParameters {
                tolerance: 0.0,
                ..base.clone()
            },
            StabilizationParameters {
                max_adjust_voltage: -1.0,
                ..base.clone()
            },
            StabilizationParameters {
                adjust_period: 0.0,
                ..base.clone()
            },
            StabilizationParameters {
                hold_ticks: 0,
                ..base.clone()
            },
            StabilizationParameters {
                algorithm: ControlAlgorithm::Approach { step: 0.0 },
                ..base.clone()
            },
        ] {
            assert!(matches!(broken.validate(), Err(DaqError::ConfigInvalid(_))));
        }
    }

    #[test]
    fn algorithm_is_internally_tagged() {
        let algorithm: ControlAlgorithm =
            toml::from_str("kind = \"pid\"\nkp = 0.2\n").unwrap();
        assert_eq!(
            algorithm,
            ControlAlgorithm::Pid(PidTuning {
                kp: 0.2,
                ..PidTuning::default()
            })
        );

        let approach: ControlAlgorithm = toml::from_str("kind = \"approach\"\n").unwrap();
        assert_eq!(approach, ControlAlgorithm::Approach { step: 1.0 });
    }
}
