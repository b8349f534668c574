use crate::error::{Result, SimulationError};
use crate::rosenbrock::Rosenbrock;
use crate::traits::DerivativeSystem;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Floor added to `2ε` for the smallest usable relative tolerance.
pub(crate) const RELMIN: f64 = 1.0e-12;

/// Tolerances and step limits shared by all solvers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub h_min: f64,
    pub h_max: f64,
    /// Output stride of the simulation driver.
    pub step_size: f64,
    /// Clamp negative state values to zero after every output interval.
    pub nonnegative: bool,
    /// Append reaction velocities to every trajectory row.
    pub include_intermediates: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            abs_tol: 1.0e-10,
            rel_tol: 1.0e-7,
            h_min: 1.0e-12,
            h_max: 0.1,
            step_size: 0.1,
            nonnegative: false,
            include_intermediates: false,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("abs_tol", self.abs_tol),
            ("rel_tol", self.rel_tol),
            ("h_min", self.h_min),
            ("h_max", self.h_max),
            ("step_size", self.step_size),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value <= 0.0 {
                return Err(SimulationError::InvalidSettings(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
        }
        if self.h_min > self.h_max {
            return Err(SimulationError::InvalidSettings(format!(
                "h_min ({}) exceeds h_max ({})",
                self.h_min, self.h_max
            )));
        }
        Ok(())
    }

    /// Relative tolerance raised to what double precision can deliver.
    pub fn effective_rel_tol(&self) -> f64 {
        self.rel_tol.max(2.0 * f64::EPSILON + RELMIN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolverKind {
    #[default]
    Rosenbrock,
    Tsit5,
    Rk4,
}

impl SolverKind {
    pub fn name(self) -> &'static str {
        match self {
            SolverKind::Rosenbrock => "Rosenbrock",
            SolverKind::Tsit5 => "Tsit5",
            SolverKind::Rk4 => "RK4",
        }
    }
}

/// Counters of the adaptive step controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStatistics {
    pub accepted: usize,
    pub rejected: usize,
    accepted_span: f64,
    /// Weighted RMS error of the last attempted step.
    pub last_error: f64,
}

impl StepStatistics {
    pub fn record_accepted(&mut self, step: f64, error: f64) {
        self.accepted += 1;
        self.accepted_span += step;
        self.last_error = error;
    }

    pub fn record_rejected(&mut self, error: f64) {
        self.rejected += 1;
        self.last_error = error;
    }

    /// Mean length of accepted steps, 0 before the first one.
    pub fn mean_step(&self) -> f64 {
        if self.accepted == 0 {
            0.0
        } else {
            self.accepted_span / self.accepted as f64
        }
    }
}

/// Shared stop flag. Solvers check it once per step and end the current
/// solve with [`SimulationError::Stopped`].
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn check_dimensions<S: DerivativeSystem + ?Sized>(
    system: &S,
    y: &[f64],
    change: &[f64],
) -> Result<()> {
    let expected = system.dimension();
    if y.len() != expected {
        return Err(SimulationError::DimensionMismatch {
            expected,
            got: y.len(),
            what: "state vector",
        });
    }
    if change.len() != expected {
        return Err(SimulationError::DimensionMismatch {
            expected,
            got: change.len(),
            what: "change buffer",
        });
    }
    Ok(())
}

pub(crate) fn ensure_finite(values: &[f64], time: f64) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SimulationError::NonFiniteValue { time })
    }
}

/// Weighted RMS norm with `sk = abs + rel * max(|y|, |y_new|)`.
pub(crate) fn error_norm(err: &[f64], y: &[f64], y_new: &[f64], abs_tol: f64, rel_tol: f64) -> f64 {
    if err.is_empty() {
        return 0.0;
    }
    let sum: f64 = err
        .iter()
        .zip(y.iter().zip(y_new))
        .map(|(e, (a, b))| {
            let sk = abs_tol + rel_tol * a.abs().max(b.abs());
            (e / sk).powi(2)
        })
        .sum();
    (sum / err.len() as f64).sqrt()
}

/// Classic Runge-Kutta 4th order with fixed substeps of at most `h_max`.
pub struct Rk4 {
    settings: SolverSettings,
    stop: StopHandle,
    statistics: StepStatistics,
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            stop: StopHandle::new(),
            statistics: StepStatistics::default(),
            k1: Vec::new(),
            k2: Vec::new(),
            k3: Vec::new(),
            k4: Vec::new(),
            tmp: Vec::new(),
        }
    }

    fn resize(&mut self, dim: usize) {
        for buffer in [&mut self.k1, &mut self.k2, &mut self.k3, &mut self.k4, &mut self.tmp] {
            buffer.resize(dim, 0.0);
        }
    }

    fn step<S: DerivativeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<()> {
        let n = state.len();

        // k1 = f(t, y)
        system.evaluate(t, state, &mut self.k1)?;

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..n {
            self.tmp[i] = state[i] + dt * self.k1[i] * 0.5;
        }
        system.evaluate(t + dt * 0.5, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..n {
            self.tmp[i] = state[i] + dt * self.k2[i] * 0.5;
        }
        system.evaluate(t + dt * 0.5, &self.tmp, &mut self.k3)?;

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..n {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.evaluate(t + dt, &self.tmp, &mut self.k4)?;

        for i in 0..n {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }
        ensure_finite(state, t + dt)
    }

    pub fn compute_change<S: DerivativeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        y0: &[f64],
        t0: f64,
        interval: f64,
        change: &mut [f64],
    ) -> Result<()> {
        check_dimensions(system, y0, change)?;
        change.fill(0.0);
        if interval <= 0.0 {
            return Ok(());
        }
        self.resize(y0.len());

        let steps = (interval / self.settings.h_max).ceil().max(1.0) as usize;
        let dt = interval / steps as f64;
        let mut y = y0.to_vec();
        for n in 0..steps {
            if self.stop.is_stopped() {
                return Err(SimulationError::Stopped);
            }
            self.step(system, t0 + n as f64 * dt, &mut y, dt)?;
            let t = if n + 1 == steps {
                t0 + interval
            } else {
                t0 + (n + 1) as f64 * dt
            };
            system.accept_step(t, &y);
            self.statistics.record_accepted(dt, 0.0);
        }
        for ((c, new), old) in change.iter_mut().zip(&y).zip(y0) {
            *c = new - old;
        }
        Ok(())
    }
}

// Tsitouras 5(4) tableau.
const TSIT5_C: [f64; 6] = [0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0];
const TSIT5_A: [[f64; 6]; 6] = [
    [0.161, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0, 0.0],
    [2.898, -6.359447987781783, 4.361447987781783, 0.0, 0.0, 0.0],
    [
        5.325864858437957,
        -11.748883564062828,
        7.495539342889693,
        -0.09249506636030195,
        0.0,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.02826857949054663,
        0.0,
    ],
    [
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436099,
        2.324710524099774,
    ],
];
/// Difference between the 5th and embedded 4th order weights, FSAL stage last.
const TSIT5_BTILDE: [f64; 7] = [
    -0.00178001105222577714,
    -0.0008164344596567469,
    0.007880878010261995,
    -0.1447110071732629,
    0.5823571654525552,
    -0.45808210592918697,
    1.0 / 66.0,
];

/// Adaptive Tsitouras 5(4) with first-same-as-last stages.
pub struct Tsit5 {
    settings: SolverSettings,
    stop: StopHandle,
    statistics: StepStatistics,
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
    y_new: Vec<f64>,
    err: Vec<f64>,
}

impl Tsit5 {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            stop: StopHandle::new(),
            statistics: StepStatistics::default(),
            k: Default::default(),
            tmp: Vec::new(),
            y_new: Vec::new(),
            err: Vec::new(),
        }
    }

    fn resize(&mut self, dim: usize) {
        for buffer in self.k.iter_mut() {
            buffer.resize(dim, 0.0);
        }
        self.tmp.resize(dim, 0.0);
        self.y_new.resize(dim, 0.0);
        self.err.resize(dim, 0.0);
    }

    /// One trial step from (t, y) with `k[0] = f(t, y)` already in place.
    /// Leaves the candidate in `y_new` and `f(t + h, y_new)` in `k[6]`.
    fn attempt<S: DerivativeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        rel_tol: f64,
    ) -> Result<f64> {
        let n = y.len();
        for stage in 1..7 {
            let row = &TSIT5_A[stage - 1];
            for i in 0..n {
                let mut acc = 0.0;
                for (j, a) in row.iter().enumerate().take(stage) {
                    acc += a * self.k[j][i];
                }
                self.tmp[i] = y[i] + h * acc;
            }
            if stage == 6 {
                self.y_new.copy_from_slice(&self.tmp);
                ensure_finite(&self.y_new, t + h)?;
                system.evaluate(t + h, &self.y_new, &mut self.k[6])?;
            } else {
                system.evaluate(t + TSIT5_C[stage] * h, &self.tmp, &mut self.k[stage])?;
            }
        }
        for i in 0..n {
            let mut acc = 0.0;
            for (j, b) in TSIT5_BTILDE.iter().enumerate() {
                acc += b * self.k[j][i];
            }
            self.err[i] = h * acc;
        }
        Ok(error_norm(&self.err, y, &self.y_new, self.settings.abs_tol, rel_tol))
    }

    pub fn compute_change<S: DerivativeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        y0: &[f64],
        t0: f64,
        interval: f64,
        change: &mut [f64],
    ) -> Result<()> {
        check_dimensions(system, y0, change)?;
        change.fill(0.0);
        if interval <= 0.0 {
            return Ok(());
        }
        self.resize(y0.len());

        let rel_tol = self.settings.effective_rel_tol();
        let h_min = self.settings.h_min;
        let h_max = self.settings.h_max.min(interval);
        let t_end = t0 + interval;
        let mut t = t0;
        let mut y = y0.to_vec();
        let mut h = h_max;
        system.evaluate(t, &y, &mut self.k[0])?;

        while t < t_end {
            if self.stop.is_stopped() {
                return Err(SimulationError::Stopped);
            }
            let remaining = t_end - t;
            let step = if remaining - h < h_min { remaining } else { h };
            let error = self.attempt(system, t, &y, step, rel_tol)?;
            if !error.is_finite() {
                return Err(SimulationError::NonFiniteValue { time: t });
            }
            let factor = (error.powf(0.2) / 0.9).clamp(0.2, 10.0);
            if error <= 1.0 {
                t = if step == remaining { t_end } else { t + step };
                y.copy_from_slice(&self.y_new);
                let (first, rest) = self.k.split_at_mut(1);
                first[0].copy_from_slice(&rest[5]);
                system.accept_step(t, &y);
                self.statistics.record_accepted(step, error);
            } else {
                if h <= h_min {
                    return Err(SimulationError::ToleranceUnachievable { time: t, step });
                }
                self.statistics.record_rejected(error);
                debug!("Tsit5 rejected step {step:e} at t = {t} (error {error:.3e})");
            }
            h = (step / factor).clamp(h_min, h_max);
            if t < t_end && t + h == t {
                return Err(SimulationError::StepSizeUnderflow { time: t });
            }
        }
        for ((c, new), old) in change.iter_mut().zip(&y).zip(y0) {
            *c = new - old;
        }
        Ok(())
    }
}

/// Any of the available integrators, advancing a system over one interval.
pub enum Solver {
    Rosenbrock(Rosenbrock),
    Tsit5(Tsit5),
    Rk4(Rk4),
}

impl Solver {
    pub fn new(kind: SolverKind, settings: SolverSettings) -> Result<Self> {
        settings.validate()?;
        Ok(match kind {
            SolverKind::Rosenbrock => Solver::Rosenbrock(Rosenbrock::new(settings)),
            SolverKind::Tsit5 => Solver::Tsit5(Tsit5::new(settings)),
            SolverKind::Rk4 => Solver::Rk4(Rk4::new(settings)),
        })
    }

    pub fn kind(&self) -> SolverKind {
        match self {
            Solver::Rosenbrock(_) => SolverKind::Rosenbrock,
            Solver::Tsit5(_) => SolverKind::Tsit5,
            Solver::Rk4(_) => SolverKind::Rk4,
        }
    }

    pub fn settings(&self) -> &SolverSettings {
        match self {
            Solver::Rosenbrock(s) => s.settings(),
            Solver::Tsit5(s) => &s.settings,
            Solver::Rk4(s) => &s.settings,
        }
    }

    pub fn statistics(&self) -> StepStatistics {
        match self {
            Solver::Rosenbrock(s) => s.statistics(),
            Solver::Tsit5(s) => s.statistics,
            Solver::Rk4(s) => s.statistics,
        }
    }

    /// Handle that stops this solver from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        match self {
            Solver::Rosenbrock(s) => s.stop_handle(),
            Solver::Tsit5(s) => s.stop.clone(),
            Solver::Rk4(s) => s.stop.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_handle().is_stopped()
    }

    /// Advances `y0` from `t0` over `interval` and writes the net change.
    pub fn compute_change<S: DerivativeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        y0: &[f64],
        t0: f64,
        interval: f64,
        change: &mut [f64],
    ) -> Result<()> {
        match self {
            Solver::Rosenbrock(s) => s.compute_change(system, y0, t0, interval, change),
            Solver::Tsit5(s) => s.compute_change(system, y0, t0, interval, change),
            Solver::Rk4(s) => s.compute_change(system, y0, t0, interval, change),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// dy/dt = -k y
    pub(crate) struct Decay {
        pub k: f64,
    }

    impl DerivativeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn evaluate(&mut self, _t: f64, y: &[f64], out: &mut [f64]) -> Result<()> {
            out[0] = -self.k * y[0];
            Ok(())
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        match result {
            Ok(value) => panic!("expected error containing '{needle}', got {value:?}"),
            Err(err) => assert!(
                err.to_string().contains(needle),
                "error '{err}' does not contain '{needle}'"
            ),
        }
    }

    #[test]
    fn settings_validation() {
        assert!(SolverSettings::default().validate().is_ok());
        let bad = SolverSettings {
            abs_tol: 0.0,
            ..SolverSettings::default()
        };
        assert_err_contains(bad.validate(), "abs_tol");
        let inverted = SolverSettings {
            h_min: 1.0,
            h_max: 0.5,
            ..SolverSettings::default()
        };
        assert_err_contains(inverted.validate(), "exceeds h_max");
        let nan = SolverSettings {
            step_size: f64::NAN,
            ..SolverSettings::default()
        };
        assert!(Solver::new(SolverKind::Tsit5, nan).is_err());
    }

    #[test]
    fn relative_tolerance_is_floored() {
        let settings = SolverSettings {
            rel_tol: 1e-20,
            ..SolverSettings::default()
        };
        assert!(settings.effective_rel_tol() >= RELMIN);
    }

    #[test]
    fn every_solver_integrates_exponential_decay() {
        for kind in [SolverKind::Rosenbrock, SolverKind::Tsit5, SolverKind::Rk4] {
            let mut solver = Solver::new(kind, SolverSettings::default()).unwrap();
            let mut change = [0.0];
            solver
                .compute_change(&mut Decay { k: 1.0 }, &[1.0], 0.0, 1.0, &mut change)
                .unwrap();
            let expected = (-1.0f64).exp() - 1.0;
            assert!(
                (change[0] - expected).abs() < 1e-5,
                "{} gave {} instead of {expected}",
                kind.name(),
                change[0]
            );
        }
    }

    struct Recording {
        decay: Decay,
        accepted: Vec<f64>,
    }

    impl DerivativeSystem for Recording {
        fn dimension(&self) -> usize {
            1
        }

        fn evaluate(&mut self, t: f64, y: &[f64], out: &mut [f64]) -> Result<()> {
            self.decay.evaluate(t, y, out)
        }

        fn accept_step(&mut self, t: f64, _y: &[f64]) {
            self.accepted.push(t);
        }
    }

    #[test]
    fn accepted_substeps_are_reported_in_order() {
        for kind in [SolverKind::Rosenbrock, SolverKind::Tsit5, SolverKind::Rk4] {
            let mut solver = Solver::new(kind, SolverSettings::default()).unwrap();
            let mut system = Recording {
                decay: Decay { k: 1.0 },
                accepted: Vec::new(),
            };
            let mut change = [0.0];
            solver
                .compute_change(&mut system, &[1.0], 0.5, 0.35, &mut change)
                .unwrap();
            assert!(system.accepted.len() >= 4, "{} reported too few steps", kind.name());
            assert!(system.accepted.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(system.accepted.last(), Some(&(0.5 + 0.35)));
        }
    }

    #[test]
    fn zero_interval_changes_nothing() {
        let mut solver = Solver::new(SolverKind::Tsit5, SolverSettings::default()).unwrap();
        let mut change = [42.0];
        solver
            .compute_change(&mut Decay { k: 1.0 }, &[1.0], 3.0, 0.0, &mut change)
            .unwrap();
        assert_eq!(change, [0.0]);
        assert_eq!(solver.statistics().accepted, 0);
    }

    #[test]
    fn tsit5_adapts_step_to_tolerance() {
        let run = |rel_tol: f64| {
            let settings = SolverSettings {
                rel_tol,
                abs_tol: 1e-14,
                h_max: 1.0,
                ..SolverSettings::default()
            };
            let mut solver = Solver::new(SolverKind::Tsit5, settings).unwrap();
            let mut change = [0.0];
            solver
                .compute_change(&mut Decay { k: 1.0 }, &[1.0], 0.0, 5.0, &mut change)
                .unwrap();
            solver.statistics().mean_step()
        };
        assert!(run(1e-4) > run(1e-9));
    }

    #[test]
    fn stop_handle_ends_the_solve() {
        let mut solver = Solver::new(SolverKind::Rk4, SolverSettings::default()).unwrap();
        let handle = solver.stop_handle();
        handle.stop();
        assert!(solver.is_stopped());
        let mut change = [0.0];
        let result = solver.compute_change(&mut Decay { k: 1.0 }, &[1.0], 0.0, 1.0, &mut change);
        assert_eq!(result, Err(SimulationError::Stopped));
        handle.reset();
        assert!(solver
            .compute_change(&mut Decay { k: 1.0 }, &[1.0], 0.0, 1.0, &mut change)
            .is_ok());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut solver = Solver::new(SolverKind::Rk4, SolverSettings::default()).unwrap();
        let mut change = [0.0, 0.0];
        assert_err_contains(
            solver.compute_change(&mut Decay { k: 1.0 }, &[1.0, 2.0], 0.0, 1.0, &mut change),
            "state vector length 2",
        );
    }
}
