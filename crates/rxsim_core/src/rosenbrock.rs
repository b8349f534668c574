//! Linearly implicit Rosenbrock method of order 4 with an embedded error
//! estimate, for stiff reaction networks.
//!
//! Every step estimates the Jacobian and `∂f/∂t` by second-order one-sided
//! differences, factors `I/(γh) − J` once and reuses the factorization for
//! the five stages and the error stage.
use crate::error::{Result, SimulationError};
use crate::solvers::{
    check_dimensions, ensure_finite, error_norm, SolverSettings, StepStatistics, StopHandle,
};
use crate::traits::DerivativeSystem;
use log::debug;
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

const GAMMA: f64 = 0.25;
const SAFETY: f64 = 0.9;
const FAC_MIN: f64 = 1.0 / 6.0;
const FAC_MAX: f64 = 5.0;
const PWR: f64 = 0.25;

/// Time offsets of stages 1 to 5, as fractions of h.
const STAGE_TIME: [f64; 5] = [0.0, 0.386, 0.21, 0.63, 1.0];

const A: [[f64; 4]; 4] = [
    [1.544, 0.0, 0.0, 0.0],
    [0.9466785280815826, 0.2557011698983284, 0.0, 0.0],
    [3.314825187068521, 2.896124015972201, 0.9986419139977817, 0.0],
    [
        1.221224509226641,
        6.019134481288629,
        12.53708332932087,
        -0.6878860361058950,
    ],
];

/// Rows for stages 2 to 5 and the error stage.
const C: [[f64; 5]; 5] = [
    [-5.6688, 0.0, 0.0, 0.0, 0.0],
    [-2.430093356833875, -0.2063599157091915, 0.0, 0.0, 0.0],
    [
        -0.1073529058151375,
        -9.594562251023355,
        -20.47028614809616,
        0.0,
        0.0,
    ],
    [
        7.496443313967647,
        -10.24680431464352,
        -33.99990352819905,
        11.70890893206160,
        0.0,
    ],
    [
        8.083246795921522,
        -7.981132988064893,
        -31.52159432874371,
        16.31930543123136,
        -6.058818238834054,
    ],
];

/// Weights of `∂f/∂t` per stage.
const D: [f64; 5] = [0.25, -0.1043, 0.1035, -0.0362, 0.0];

pub struct Rosenbrock {
    settings: SolverSettings,
    stop: StopHandle,
    statistics: StepStatistics,
    jacobian: DMatrix<f64>,
    g0: Vec<f64>,
    g1: Vec<f64>,
    g2: Vec<f64>,
    dfdt: Vec<f64>,
    f: Vec<f64>,
    k: [Vec<f64>; 5],
    err: Vec<f64>,
    y_temp: Vec<f64>,
    y_new: Vec<f64>,
}

impl Rosenbrock {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            stop: StopHandle::new(),
            statistics: StepStatistics::default(),
            jacobian: DMatrix::zeros(0, 0),
            g0: Vec::new(),
            g1: Vec::new(),
            g2: Vec::new(),
            dfdt: Vec::new(),
            f: Vec::new(),
            k: Default::default(),
            err: Vec::new(),
            y_temp: Vec::new(),
            y_new: Vec::new(),
        }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn statistics(&self) -> StepStatistics {
        self.statistics
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn resize(&mut self, n: usize) {
        if self.jacobian.nrows() != n {
            self.jacobian = DMatrix::zeros(n, n);
        }
        for buffer in [
            &mut self.g0,
            &mut self.g1,
            &mut self.g2,
            &mut self.dfdt,
            &mut self.f,
            &mut self.err,
            &mut self.y_temp,
            &mut self.y_new,
        ] {
            buffer.resize(n, 0.0);
        }
        for k in self.k.iter_mut() {
            k.resize(n, 0.0);
        }
    }

    /// Fills `jacobian`, `dfdt` and `g0 = f(t, y)`.
    fn differentiate<S: DerivativeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
    ) -> Result<()> {
        let n = y.len();
        let scale = f64::EPSILON.cbrt();
        system.evaluate(t, y, &mut self.g0)?;

        for j in 0..n {
            let delta = scale * y[j].abs().max(1.0);
            self.y_temp.copy_from_slice(y);
            self.y_temp[j] = y[j] + delta;
            system.evaluate(t, &self.y_temp, &mut self.g1)?;
            self.y_temp[j] = y[j] + 2.0 * delta;
            system.evaluate(t, &self.y_temp, &mut self.g2)?;
            for q in 0..n {
                self.jacobian[(q, j)] =
                    (-3.0 * self.g0[q] + 4.0 * self.g1[q] - self.g2[q]) / (2.0 * delta);
            }
        }

        let delta = scale * t.abs().max(1.0);
        system.evaluate(t + delta, y, &mut self.g1)?;
        system.evaluate(t + 2.0 * delta, y, &mut self.g2)?;
        for i in 0..n {
            self.dfdt[i] = (-3.0 * self.g0[i] + 4.0 * self.g1[i] - self.g2[i]) / (2.0 * delta);
        }
        Ok(())
    }

    /// Attempts one step of size `h` from (t, y). Leaves the candidate state
    /// in `y_new` and returns its weighted RMS error.
    fn step<S: DerivativeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        rel_tol: f64,
    ) -> Result<f64> {
        let n = y.len();
        self.differentiate(system, t, y)?;

        let mut matrix = -&self.jacobian;
        for i in 0..n {
            matrix[(i, i)] += 1.0 / (GAMMA * h);
        }
        let lu = matrix.lu();
        if !lu.is_invertible() {
            return Err(SimulationError::SingularMatrix { time: t });
        }

        for stage in 0..5 {
            if stage == 0 {
                self.f.copy_from_slice(&self.g0);
            } else {
                let row = &A[stage - 1];
                for i in 0..n {
                    let mut acc = y[i];
                    for (j, a) in row.iter().enumerate().take(stage) {
                        acc += a * self.k[j][i];
                    }
                    self.y_temp[i] = acc;
                }
                system.evaluate(t + STAGE_TIME[stage] * h, &self.y_temp, &mut self.f)?;
            }
            for i in 0..n {
                let mut rhs = self.f[i] + self.dfdt[i] * h * D[stage];
                if stage > 0 {
                    for (j, c) in C[stage - 1].iter().enumerate().take(stage) {
                        rhs += c * self.k[j][i] / h;
                    }
                }
                self.k[stage][i] = rhs;
            }
            back_substitute(&lu, &mut self.k[stage], t)?;
        }

        for i in 0..n {
            self.y_temp[i] += self.k[4][i];
        }
        system.evaluate(t + h, &self.y_temp, &mut self.f)?;
        for i in 0..n {
            let mut rhs = self.f[i];
            for (j, c) in C[4].iter().enumerate() {
                rhs += c * self.k[j][i] / h;
            }
            self.err[i] = rhs;
        }
        back_substitute(&lu, &mut self.err, t)?;

        for i in 0..n {
            self.y_new[i] = self.y_temp[i] + self.err[i];
        }
        ensure_finite(&self.y_new, t + h)?;
        Ok(error_norm(&self.err, y, &self.y_new, self.settings.abs_tol, rel_tol))
    }

    /// Advances `y0` from `t0` over `interval` with adaptive substeps and
    /// writes the net change.
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

        while t < t_end {
            if self.stop.is_stopped() {
                return Err(SimulationError::Stopped);
            }
            let remaining = t_end - t;
            let step = if remaining - h < h_min { remaining } else { h };
            let error = self.step(system, t, &y, step, rel_tol)?;
            let factor = (error.powf(PWR) / SAFETY).clamp(FAC_MIN, FAC_MAX);

            if error <= 1.0 {
                t = if step == remaining { t_end } else { t + step };
                y.copy_from_slice(&self.y_new);
                system.accept_step(t, &y);
                self.statistics.record_accepted(step, error);
            } else {
                if h <= h_min {
                    return Err(SimulationError::ToleranceUnachievable { time: t, step });
                }
                self.statistics.record_rejected(error);
                debug!("Rosenbrock rejected step {step:e} at t = {t} (error {error:.3e})");
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

fn back_substitute(lu: &LU<f64, Dyn, Dyn>, rhs: &mut [f64], time: f64) -> Result<()> {
    let b = DVector::from_column_slice(rhs);
    let x = lu
        .solve(&b)
        .ok_or(SimulationError::SingularMatrix { time })?;
    rhs.copy_from_slice(x.as_slice());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::tests::Decay;

    /// dy/dt = ln(y - 2), undefined for the initial state.
    struct OutOfDomain;

    impl DerivativeSystem for OutOfDomain {
        fn dimension(&self) -> usize {
            1
        }

        fn evaluate(&mut self, _t: f64, y: &[f64], out: &mut [f64]) -> Result<()> {
            out[0] = (y[0] - 2.0).ln();
            Ok(())
        }
    }

    /// Stiff linear pair with eigenvalues -1 and -1000.
    struct Stiff;

    impl DerivativeSystem for Stiff {
        fn dimension(&self) -> usize {
            2
        }

        fn evaluate(&mut self, _t: f64, y: &[f64], out: &mut [f64]) -> Result<()> {
            out[0] = -y[0];
            out[1] = -1000.0 * (y[1] - y[0]);
            Ok(())
        }
    }

    fn settings(rel_tol: f64) -> SolverSettings {
        SolverSettings {
            rel_tol,
            abs_tol: 1e-12,
            h_max: 1.0,
            ..SolverSettings::default()
        }
    }

    #[test]
    fn linear_decay_matches_analytic_solution() {
        let mut solver = Rosenbrock::new(settings(1e-8));
        let mut change = [0.0];
        solver
            .compute_change(&mut Decay { k: 2.0 }, &[1.0], 0.0, 1.0, &mut change)
            .unwrap();
        let exact = (-2.0f64).exp() - 1.0;
        assert!((change[0] - exact).abs() < 1e-6);

        let stats = solver.statistics();
        assert!(stats.accepted > 0);
        assert!(stats.last_error <= 1.0);
    }

    #[test]
    fn tighter_tolerance_shrinks_accepted_steps() {
        let mean_step = |rel_tol: f64| {
            let mut solver = Rosenbrock::new(settings(rel_tol));
            let mut change = [0.0];
            solver
                .compute_change(&mut Decay { k: 1.0 }, &[1.0], 0.0, 5.0, &mut change)
                .unwrap();
            solver.statistics().mean_step()
        };
        let loose = mean_step(1e-4);
        let tight = mean_step(1e-6);
        let tighter = mean_step(1e-8);
        assert!(loose > tight, "{loose} vs {tight}");
        assert!(tight > tighter, "{tight} vs {tighter}");
    }

    #[test]
    fn stiff_system_takes_large_steps() {
        let mut solver = Rosenbrock::new(settings(1e-6));
        let mut change = [0.0, 0.0];
        solver
            .compute_change(&mut Stiff, &[1.0, 0.0], 0.0, 10.0, &mut change)
            .unwrap();
        let y0 = 1.0 + change[0];
        assert!((y0 - (-10.0f64).exp()).abs() < 1e-6);
        // An explicit method would need thousands of steps here.
        assert!(solver.statistics().accepted < 500);
    }

    #[test]
    fn nan_derivative_is_a_numerical_failure() {
        let mut solver = Rosenbrock::new(settings(1e-6));
        let mut change = [0.0];
        let err = solver
            .compute_change(&mut OutOfDomain, &[1.0], 0.5, 2.0, &mut change)
            .unwrap_err();
        assert!(err.is_numerical());
        assert_eq!(err, SimulationError::NonFiniteValue { time: 1.5 });
    }

    #[test]
    fn interval_end_is_hit_exactly() {
        let mut solver = Rosenbrock::new(SolverSettings::default());
        let mut change = [0.0];
        solver
            .compute_change(&mut Decay { k: 0.5 }, &[2.0], 0.3, 0.25, &mut change)
            .unwrap();
        assert!((2.0 + change[0] - 2.0 * (-0.125f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn stop_request_is_honoured() {
        let mut solver = Rosenbrock::new(SolverSettings::default());
        solver.stop_handle().stop();
        let mut change = [0.0];
        assert_eq!(
            solver.compute_change(&mut Decay { k: 1.0 }, &[1.0], 0.0, 1.0, &mut change),
            Err(SimulationError::Stopped)
        );
    }
}
