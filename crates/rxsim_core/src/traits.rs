use crate::error::Result;
use crate::events::EventBatch;

/// A system of ordinary differential equations dy/dt = f(t, y).
pub trait DerivativeSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the derivative.
    /// t: current time
    /// y: current state
    /// out: buffer receiving dy/dt, same length as y
    fn evaluate(&mut self, t: f64, y: &[f64], out: &mut [f64]) -> Result<()>;

    /// Names of the state columns, in state-vector order.
    fn identifiers(&self) -> Vec<String> {
        (0..self.dimension()).map(|i| format!("y{i}")).collect()
    }

    /// Names of non-state quantities reported alongside the state.
    fn auxiliary_ids(&self) -> Vec<String> {
        Vec::new()
    }

    /// Values of the auxiliary quantities at (t, y).
    fn auxiliary_values(&mut self, _t: f64, _y: &[f64]) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }

    fn has_fast_processes(&self) -> bool {
        false
    }

    /// Switches between the slow pass and the quasi-steady-state pass over
    /// fast processes. While the fast pass is on, time is frozen at `t`.
    fn set_fast_process_computation(&mut self, _fast: bool, _t: f64) {}

    /// Called by the solvers with every accepted substep.
    fn accept_step(&mut self, _t: f64, _y: &[f64]) {}
}

/// Hooks the simulation driver calls between integration intervals.
pub trait EventSystem: DerivativeSystem {
    fn has_events_or_rules(&self) -> bool;

    /// Executes at most one ready event at time `t` and returns what it
    /// changed. The driver repeats the call until it returns `None`.
    fn event_assignments(&mut self, t: f64, previous_t: f64, y: &[f64])
        -> Result<Option<EventBatch>>;

    /// Current values of every assignment-rule target.
    fn assignment_rule_updates(&mut self, t: f64, y: &[f64]) -> Result<Vec<(usize, f64)>>;

    /// Next scheduled (delayed) event execution after `after`, if any.
    fn next_event_time(&self, _after: f64) -> Option<f64> {
        None
    }

    /// Called with every state the driver commits to the trajectory.
    fn record_sample(&mut self, _t: f64, _y: &[f64]) {}
}
