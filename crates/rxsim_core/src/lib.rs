pub mod algebraic;
pub mod compiler;
pub mod error;
pub mod events;
pub mod math;
pub mod model;
pub mod rosenbrock;
pub mod simulation;
pub mod solvers;
pub mod symbols;
pub mod system;
/// The `rxsim_core` crate is the numerical engine for simulating reaction-network models.
/// A structural [`model::Model`] is compiled into a differential-equation system whose
/// expressions live in one shared, hash-consed graph, then integrated with adaptive solvers.
///
/// Key components:
/// - **Traits**: `DerivativeSystem` (dy/dt = f(t, y)), `EventSystem` (rules and events between intervals).
/// - **Compiler**: Expression graph with DAG sharing, reaction-scoped local parameters and per-node caches.
/// - **System**: `ReactionSystem` (state layout, initialization, derivatives, events, constraints).
/// - **Solvers**: Rosenbrock (stiff, default), Tsit5 and RK4 over a single interval.
/// - **Simulation**: Output-stride driver producing a `Trajectory`, with event and rule hooks.
pub mod traits;
pub mod trajectory;

pub use error::{Result, SimulationError};
pub use model::Model;
pub use simulation::{simulate, solve, SimulationSettings, Solution};
pub use solvers::{Solver, SolverKind, SolverSettings};
pub use system::ReactionSystem;
