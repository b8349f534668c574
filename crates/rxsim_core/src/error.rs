use thiserror::Error;

/// Every failure the simulation core can report.
///
/// Structural variants are raised while a model is initialized and stop the
/// simulation before it starts. Numerical variants end the current solve; the
/// driver attaches them to the partial result instead of discarding it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("model is overdetermined: {0}")]
    ModelOverdetermined(String),

    #[error("malformed expression: {0}")]
    MalformedExpression(String),

    #[error("algebraic rule cannot be converted: {0}")]
    AlgebraicRule(String),

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("{what} length {got} does not match system dimension {expected}")]
    DimensionMismatch {
        expected: usize,
        got: usize,
        what: &'static str,
    },

    #[error("invalid solver settings: {0}")]
    InvalidSettings(String),

    #[error("model evaluation failed: {0}")]
    ModelEvaluation(String),

    #[error("infinity or NaN encountered at t = {time}")]
    NonFiniteValue { time: f64 },

    #[error("iteration matrix is singular at t = {time}")]
    SingularMatrix { time: f64 },

    #[error("step size underflow at t = {time}")]
    StepSizeUnderflow { time: f64 },

    #[error("requested tolerance could not be achieved at t = {time} even with the minimum step size {step}")]
    ToleranceUnachievable { time: f64, step: f64 },

    #[error("solver was stopped")]
    Stopped,
}

impl SimulationError {
    /// Failures that end an integration run but leave the model intact.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            SimulationError::NonFiniteValue { .. }
                | SimulationError::SingularMatrix { .. }
                | SimulationError::StepSizeUnderflow { .. }
                | SimulationError::ToleranceUnachievable { .. }
                | SimulationError::ModelEvaluation(_)
        )
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SimulationError::ModelOverdetermined(_)
                | SimulationError::MalformedExpression(_)
                | SimulationError::AlgebraicRule(_)
                | SimulationError::UnknownSymbol(_)
                | SimulationError::DimensionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SimulationError>;
