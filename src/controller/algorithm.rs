//! Control strategies for the stabilization loop.
//!
//! Every strategy sees the same input each tick and answers with a voltage delta in
//! "effective" volts (the control value with the start voltage's polarity folded out,
//! so that a positive delta always means more current). The loop, not the strategy,
//! clamps the delta to the configured maximum and applies it.

use std::collections::VecDeque;

use crate::params::{AdaptiveTuning, ControlAlgorithm, PidTuning};

/// What a strategy sees on every out-of-band tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlInput {
    /// Target current, µA
    pub target: f64,
    /// Measured current, µA
    pub measured: f64,
    /// `target - measured`
    pub error: f64,
    /// Half-width of the acceptance band, µA
    pub tolerance: f64,
    /// Seconds since the previous tick
    pub dt: f64,
    /// Largest delta the loop will apply, volts
    pub max_step: f64,
}

/// The loop contract: error history in, voltage delta out.
pub trait ControlStrategy: Send {
    /// Delta to apply this tick; zero means hold.
    fn next_delta(&mut self, input: &ControlInput) -> f64;

    /// Called instead of `next_delta` while the measurement is inside the band.
    fn observe_in_band(&mut self, _input: &ControlInput) {}

    /// Called with the effective control value after every successful set, including
    /// the initial start voltage.
    fn applied(&mut self, _control: f64) {}
}

/// Builds the strategy selected by `algorithm`.
pub fn build(algorithm: &ControlAlgorithm) -> Box<dyn ControlStrategy> {
    match algorithm {
        ControlAlgorithm::Pid(tuning) => Box::new(PidController::new(tuning.clone())),
        ControlAlgorithm::Approach { step } => Box::new(Approach { step: *step }),
        ControlAlgorithm::Adaptive(tuning) => Box::new(Adaptive::new(tuning.clone())),
    }
}

// =============================================================================
// PID
// =============================================================================

/// PID law with integral clamp, sign-change integral reset, anti-windup and
/// in-band integral decay.
#[derive(Debug, Clone)]
pub struct PidController {
    tuning: PidTuning,
    integral: f64,
    previous_error: Option<f64>,
}

impl PidController {
    /// A controller with an empty integral.
    pub fn new(tuning: PidTuning) -> Self {
        Self {
            tuning,
            integral: 0.0,
            previous_error: None,
        }
    }

    /// Accumulated integral term.
    pub fn integral(&self) -> f64 {
        self.integral
    }

    fn integral_limit(&self, output_limit: f64) -> f64 {
        if let Some(limit) = self.tuning.integral_limit {
            return limit;
        }
        if self.tuning.ki != 0.0 {
            (2.0 * output_limit / self.tuning.ki).abs().max(1e6)
        } else {
            1e6
        }
    }

    /// One PID step on `error`, saturated at `output_limit`.
    pub fn update(&mut self, error: f64, dt: f64, output_limit: f64) -> f64 {
        let dt = if dt > 0.0 { dt } else { 1.0 };

        // Overshoot: the accumulated push points the wrong way now.
        if let Some(previous) = self.previous_error {
            if previous * error < 0.0 {
                self.integral = 0.0;
            }
        }

        let limit = self.integral_limit(output_limit);
        let candidate = (self.integral + error * dt).clamp(-limit, limit);
        let derivative = self
            .previous_error
            .map(|previous| (error - previous) / dt)
            .unwrap_or(0.0);

        let output = self.tuning.kp * error + self.tuning.ki * candidate + self.tuning.kd * derivative;
        let saturated = output.clamp(-output_limit, output_limit);

        let winding_up = (saturated >= output_limit && error > 0.0)
            || (saturated <= -output_limit && error < 0.0);
        if output == saturated || !winding_up {
            self.integral = candidate;
        }

        self.previous_error = Some(error);
        saturated
    }

    /// Inside the band: no output, integral bleeds off.
    pub fn decay(&mut self, error: f64) {
        self.integral *= 0.9;
        self.previous_error = Some(error);
    }
}

impl ControlStrategy for PidController {
    fn next_delta(&mut self, input: &ControlInput) -> f64 {
        self.update(input.error, input.dt, input.max_step)
    }

    fn observe_in_band(&mut self, input: &ControlInput) {
        self.decay(input.error);
    }
}

// =============================================================================
// Approach
// =============================================================================

/// Fixed-size steps toward the band.
#[derive(Debug, Clone)]
pub struct Approach {
    step: f64,
}

impl ControlStrategy for Approach {
    fn next_delta(&mut self, input: &ControlInput) -> f64 {
        if input.measured < input.target - input.tolerance {
            self.step
        } else if input.measured > input.target + input.tolerance {
            -self.step
        } else {
            0.0
        }
    }
}

// =============================================================================
// Adaptive
// =============================================================================

/// Coarse/fine controller for instruments with slow, noisy readback.
///
/// Far from the target it estimates dI/dV from its own adjustments and jumps by
/// `error / slope`; close to the target it hands over to the PID law. Error sign
/// flips shrink the usable step, and after each set it waits for the reading to
/// settle.
#[derive(Debug, Clone)]
pub struct Adaptive {
    tuning: AdaptiveTuning,
    pid: PidController,
    clock: f64,
    filtered: Option<f64>,
    slope: Option<f64>,
    control: f64,
    last_point: Option<(f64, f64)>,
    coarse: bool,
    flips: VecDeque<f64>,
    last_sign: i8,
    last_set_at: f64,
}

impl Adaptive {
    /// A controller with no history.
    pub fn new(tuning: AdaptiveTuning) -> Self {
        let pid = PidController::new(tuning.pid.clone());
        Self {
            tuning,
            pid,
            clock: 0.0,
            filtered: None,
            slope: None,
            control: 0.0,
            last_point: None,
            coarse: false,
            flips: VecDeque::new(),
            last_sign: 0,
            last_set_at: 0.0,
        }
    }

    /// Current dI/dV estimate, µA per volt.
    pub fn slope(&self) -> Option<f64> {
        self.slope
    }

    /// Whether the controller is in coarse mode.
    pub fn is_coarse(&self) -> bool {
        self.coarse
    }

    fn filter(&mut self, measured: f64) -> f64 {
        let alpha = self.tuning.filter_alpha;
        let filtered = match self.filtered {
            Some(previous) => alpha * measured + (1.0 - alpha) * previous,
            None => measured,
        };
        self.filtered = Some(filtered);
        filtered
    }

    fn update_slope(&mut self, filtered: f64) {
        let Some((last_u, last_i)) = self.last_point else {
            return;
        };
        let du = self.control - last_u;
        if du.abs() <= 1e-9 {
            return;
        }
        let slope = (filtered - last_i) / du;
        if slope > 1e-9 && slope < 1e6 {
            let alpha = self.tuning.slope_alpha;
            self.slope = Some(match self.slope {
                Some(estimate) => alpha * slope + (1.0 - alpha) * estimate,
                None => slope,
            });
        }
    }

    fn oscillation_decay(&mut self, error: f64, band: f64) -> f64 {
        let sign: i8 = if error > 0.0 {
            1
        } else if error < 0.0 {
            -1
        } else {
            0
        };
        if self.last_sign != 0 && sign != 0 && sign != self.last_sign && error.abs() > band {
            self.flips.push_back(self.clock);
        }
        self.last_sign = sign;
        while let Some(&t) = self.flips.front() {
            if self.clock - t > self.tuning.oscillation_window {
                self.flips.pop_front();
            } else {
                break;
            }
        }

        let flips = self.flips.len();
        if flips >= 3 {
            0.5_f64.powi(flips as i32 - 2).max(0.1)
        } else {
            1.0
        }
    }
}

impl ControlStrategy for Adaptive {
    fn next_delta(&mut self, input: &ControlInput) -> f64 {
        self.clock += input.dt;
        let error = input.error;
        let filtered = self.filter(input.measured);
        self.update_slope(filtered);

        let band = input.tolerance.max(1e-9);
        let enter = self.tuning.coarse_enter * band;
        let exit = self.tuning.coarse_exit * band;
        if self.coarse {
            if error.abs() < exit {
                self.coarse = false;
            }
        } else if error.abs() > enter {
            self.coarse = true;
        }

        let max_step = input.max_step * self.oscillation_decay(error, band);

        let mut delta = if self.clock - self.last_set_at < self.tuning.settle_time {
            0.0
        } else if self.coarse && max_step > 0.0 {
            let raw = match self.slope {
                Some(slope) => error / slope,
                None => error * max_step / enter.max(1e-9),
            };
            raw.clamp(-max_step, max_step)
        } else {
            self.pid.update(input.target - filtered, input.dt, input.max_step)
        };

        // Never push further in the direction that caused the error.
        if (error < 0.0 && delta > 0.0) || (error > 0.0 && delta < 0.0) {
            delta = 0.0;
        }

        if delta != 0.0 {
            let min_step = if max_step > 0.0 {
                self.tuning.min_step.min(max_step)
            } else {
                self.tuning.min_step
            };
            if delta.abs() < min_step {
                delta = min_step.copysign(delta);
            }
        }

        self.last_point = Some((self.control, filtered));
        delta
    }

    fn observe_in_band(&mut self, input: &ControlInput) {
        self.clock += input.dt;
        let filtered = self.filter(input.measured);
        self.pid.decay(input.target - filtered);
    }

    fn applied(&mut self, control: f64) {
        self.control = control;
        self.last_set_at = self.clock;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(measured: f64, target: f64, tolerance: f64, max_step: f64) -> ControlInput {
        ControlInput {
            target,
            measured,
            error: target - measured,
            tolerance,
            dt: 1.0,
            max_step,
        }
    }

    #[test]
    fn pid_output_follows_error_sign_and_saturates() {
        let mut pid = PidController::new(PidTuning::default());
        let down = pid.update(-0.2, 1.0, 5.0);
        assert!(down < 0.0 && down >= -5.0);

        let mut pid = PidController::new(PidTuning {
            kp: 10.0,
            ..PidTuning::default()
        });
        assert_eq!(pid.update(100.0, 1.0, 5.0), 5.0);
    }

    #[test]
    fn pid_resets_integral_on_sign_change() {
        let mut pid = PidController::new(PidTuning::default());
        pid.update(10.0, 1.0, 50.0);
        pid.update(10.0, 1.0, 50.0);
        assert_eq!(pid.integral(), 20.0);
        pid.update(-1.0, 1.0, 50.0);
        assert_eq!(pid.integral(), -1.0);
    }

    #[test]
    fn pid_does_not_wind_up_when_saturated() {
        let mut pid = PidController::new(PidTuning {
            kp: 1.0,
            ki: 1.0,
            kd: 0.0,
            integral_limit: None,
        });
        assert_eq!(pid.update(100.0, 1.0, 5.0), 5.0);
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn pid_integral_decays_in_band() {
        let mut pid = PidController::new(PidTuning::default());
        pid.update(10.0, 1.0, 50.0);
        pid.decay(0.5);
        assert!((pid.integral() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn approach_steps_toward_band() {
        let mut approach = Approach { step: 1.0 };
        assert_eq!(approach.next_delta(&input(80.0, 100.0, 5.0, 50.0)), 1.0);
        assert_eq!(approach.next_delta(&input(120.0, 100.0, 5.0, 50.0)), -1.0);
        assert_eq!(approach.next_delta(&input(103.0, 100.0, 5.0, 50.0)), 0.0);
    }

    #[test]
    fn adaptive_starts_coarse_and_respects_direction() {
        let mut adaptive = Adaptive::new(AdaptiveTuning {
            settle_time: 0.0,
            ..AdaptiveTuning::default()
        });
        adaptive.applied(100.0);

        // Far below target without a slope estimate: proportional coarse step up.
        let delta = adaptive.next_delta(&input(0.0, 100.0, 1.0, 10.0));
        assert!(adaptive.is_coarse());
        assert_eq!(delta, 10.0);

        // Far above target: never increases.
        let delta = adaptive.next_delta(&input(500.0, 100.0, 1.0, 10.0));
        assert!(delta <= 0.0);
    }

    #[test]
    fn adaptive_learns_slope_from_its_own_steps() {
        let mut adaptive = Adaptive::new(AdaptiveTuning {
            settle_time: 0.0,
            filter_alpha: 1.0,
            ..AdaptiveTuning::default()
        });
        // Plant: 0.5 µA per volt.
        let mut u = 100.0;
        adaptive.applied(u);
        for _ in 0..2 {
            let delta = adaptive.next_delta(&input(0.5 * u, 200.0, 1.0, 20.0));
            u += delta;
            adaptive.applied(u);
        }
        let slope = adaptive.slope().unwrap();
        assert!((slope - 0.5).abs() < 1e-9);
    }

    #[test]
    fn adaptive_waits_for_settle_time() {
        let mut adaptive = Adaptive::new(AdaptiveTuning::default());
        adaptive.applied(50.0);
        let mut early = input(0.0, 100.0, 1.0, 10.0);
        early.dt = 0.5;
        assert_eq!(adaptive.next_delta(&early), 0.0);
        early.dt = 1.0;
        assert_ne!(adaptive.next_delta(&early), 0.0);
    }

    #[test]
    fn adaptive_applies_minimum_step() {
        let mut adaptive = Adaptive::new(AdaptiveTuning {
            settle_time: 0.0,
            ..AdaptiveTuning::default()
        });
        adaptive.applied(100.0);
        // Small error in fine mode: PID output is tiny, bumped to the 1 V minimum.
        let delta = adaptive.next_delta(&input(98.0, 100.0, 1.0, 10.0));
        assert_eq!(delta, 1.0);
    }
}
