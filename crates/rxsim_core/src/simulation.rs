use crate::error::{Result, SimulationError};
use crate::model::Model;
use crate::solvers::{Solver, SolverKind, SolverSettings, StepStatistics};
use crate::system::ReactionSystem;
use crate::trajectory::Trajectory;
use crate::traits::EventSystem;
use anyhow::{bail, Context};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Pseudo-time span of one quasi-steady-state round over fast reactions.
const FAST_HORIZON: f64 = 1.0;
const MAX_FAST_ROUNDS: usize = 50;
/// Event executions allowed at a single instant before the cascade is cut.
const MAX_EVENTS_PER_INSTANT: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub solver: SolverKind,
    pub settings: SolverSettings,
    /// Seed of the tie-break between simultaneous events of equal priority.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredEvent {
    pub id: String,
    pub time: f64,
}

/// Result of a full-trajectory solve. A failed or stopped solve keeps every
/// sample recorded before it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub trajectory: Trajectory,
    pub failure: Option<SimulationError>,
    pub stopped: bool,
    pub fired_events: Vec<FiredEvent>,
    pub statistics: StepStatistics,
}

impl Solution {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && !self.stopped
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.trajectory.last_row()
    }
}

struct Driver<'a, S: EventSystem + ?Sized> {
    solver: &'a mut Solver,
    system: &'a mut S,
    settings: SolverSettings,
    hooks: bool,
    t: f64,
    y: Vec<f64>,
    change: Vec<f64>,
    fired_events: Vec<FiredEvent>,
}

impl<S: EventSystem + ?Sized> Driver<'_, S> {
    fn record(&mut self, trajectory: &mut Trajectory) -> Result<()> {
        let mut row = self.y.clone();
        if self.settings.include_intermediates {
            row.extend(self.system.auxiliary_values(self.t, &self.y)?);
        }
        trajectory.push(self.t, row);
        Ok(())
    }

    /// Integrates to `target`, stopping at every scheduled event execution
    /// on the way.
    fn advance_to(&mut self, target: f64) -> Result<()> {
        while self.t < target {
            let next = self
                .system
                .next_event_time(self.t)
                .filter(|time| *time < target)
                .unwrap_or(target);
            self.solver.compute_change(
                &mut *self.system,
                &self.y,
                self.t,
                next - self.t,
                &mut self.change,
            )?;
            for (y, dy) in self.y.iter_mut().zip(&self.change) {
                *y += dy;
            }
            let previous = self.t;
            self.t = next;
            self.settle(previous)?;
        }
        Ok(())
    }

    /// Post-interval processing: clamp, fast sub-pass, rules and events.
    fn settle(&mut self, previous_t: f64) -> Result<()> {
        if self.settings.nonnegative {
            self.y.iter_mut().filter(|v| **v < 0.0).for_each(|v| *v = 0.0);
        }
        if self.system.has_fast_processes() {
            self.system.set_fast_process_computation(true, self.t);
            let relaxed = self.relax_fast_processes();
            self.system.set_fast_process_computation(false, self.t);
            if !relaxed? {
                warn!(
                    "fast reactions did not reach a steady state at t = {} after {MAX_FAST_ROUNDS} rounds",
                    self.t
                );
            }
        }
        if self.hooks {
            self.run_events(previous_t)?;
        }
        self.system.record_sample(self.t, &self.y);
        Ok(())
    }

    /// Applies the rules, then executes events at `self.t` until none is
    /// ready.
    fn run_events(&mut self, previous_t: f64) -> Result<()> {
        self.apply_rules()?;
        let mut executed = 0;
        while let Some(batch) = self.system.event_assignments(self.t, previous_t, &self.y)? {
            for (index, value) in &batch.assignments {
                self.y[*index] = *value;
            }
            debug!(
                "event '{}' changed {} values at t = {}",
                batch.event_id,
                batch.assignments.len(),
                self.t
            );
            self.fired_events.push(FiredEvent {
                id: batch.event_id,
                time: self.t,
            });
            self.apply_rules()?;
            executed += 1;
            if executed >= MAX_EVENTS_PER_INSTANT {
                warn!("event cascade cut after {executed} executions at t = {}", self.t);
                break;
            }
        }
        Ok(())
    }

    fn apply_rules(&mut self) -> Result<()> {
        for (index, value) in self.system.assignment_rule_updates(self.t, &self.y)? {
            self.y[index] = value;
        }
        Ok(())
    }

    /// Integrates the fast subsystem in pseudo-time until it stops moving.
    fn relax_fast_processes(&mut self) -> Result<bool> {
        let abs_tol = self.settings.abs_tol;
        let rel_tol = self.settings.effective_rel_tol();
        for _ in 0..MAX_FAST_ROUNDS {
            self.solver.compute_change(
                &mut *self.system,
                &self.y,
                self.t,
                FAST_HORIZON,
                &mut self.change,
            )?;
            let mut converged = true;
            for (y, dy) in self.y.iter_mut().zip(&self.change) {
                if dy.abs() > abs_tol + rel_tol * y.abs() {
                    converged = false;
                }
                *y += dy;
            }
            if converged {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Solves from `t0` to `t1`, recording a row every `step_size` of the
/// solver settings. Numerical failures and stop requests end the solve early
/// and are reported on the returned [`Solution`].
pub fn solve<S: EventSystem + ?Sized>(
    solver: &mut Solver,
    system: &mut S,
    y0: &[f64],
    t0: f64,
    t1: f64,
) -> Result<Solution> {
    let dimension = system.dimension();
    if y0.len() != dimension {
        return Err(SimulationError::DimensionMismatch {
            expected: dimension,
            got: y0.len(),
            what: "initial state",
        });
    }
    if !(t0.is_finite() && t1.is_finite()) || t1 < t0 {
        return Err(SimulationError::InvalidSettings(format!(
            "cannot solve from t = {t0} to t = {t1}"
        )));
    }

    let settings = *solver.settings();
    let mut identifiers = system.identifiers();
    if settings.include_intermediates {
        identifiers.extend(system.auxiliary_ids());
    }
    let mut trajectory = Trajectory::new(identifiers);
    let hooks = system.has_events_or_rules();
    let mut driver = Driver {
        solver,
        system,
        settings,
        hooks,
        t: t0,
        y: y0.to_vec(),
        change: vec![0.0; dimension],
        fired_events: Vec::new(),
    };

    // Triggers already true at t0 are not rising edges.
    if driver.hooks {
        driver.run_events(t0)?;
    }
    driver.record(&mut trajectory)?;
    driver.system.record_sample(t0, &driver.y);

    let mut failure = None;
    let mut stopped = false;
    let mut n = 0usize;
    while driver.t < t1 {
        if driver.solver.is_stopped() {
            stopped = true;
            break;
        }
        n += 1;
        let target = (t0 + n as f64 * settings.step_size).min(t1);
        let outcome = driver
            .advance_to(target)
            .and_then(|()| driver.record(&mut trajectory));
        match outcome {
            Ok(()) => {}
            Err(SimulationError::Stopped) => {
                stopped = true;
                break;
            }
            Err(err) if err.is_numerical() => {
                warn!("solve ended at t = {}: {err}", driver.t);
                failure = Some(err);
                break;
            }
            Err(err) => return Err(err),
        }
    }

    info!(
        "solved to t = {} with {} samples and {} events",
        driver.t,
        trajectory.len(),
        driver.fired_events.len()
    );
    Ok(Solution {
        trajectory,
        failure,
        stopped,
        fired_events: driver.fired_events,
        statistics: driver.solver.statistics(),
    })
}

/// Initializes `model` and solves it over `[t0, t1]`.
pub fn simulate(
    model: Model,
    settings: &SimulationSettings,
    t0: f64,
    t1: f64,
) -> anyhow::Result<Solution> {
    if !(t0.is_finite() && t1.is_finite()) {
        bail!("simulation bounds must be finite, got [{t0}, {t1}]");
    }
    if t1 < t0 {
        bail!("end time {t1} precedes start time {t0}");
    }
    let mut solver =
        Solver::new(settings.solver, settings.settings).context("invalid solver settings")?;

    let id = model.id.clone();
    let mut system = ReactionSystem::with_seed(model, settings.seed)
        .with_context(|| format!("failed to initialize model '{id}'"))?;
    if system.uses_delays() {
        system.record_delay_history();
    }

    let y0 = system.initial_values().to_vec();
    solve(&mut solver, &mut system, &y0, t0, t1)
        .with_context(|| format!("failed to simulate model '{id}'"))
}
