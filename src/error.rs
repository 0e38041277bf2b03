//! Error taxonomy of the adaptive engine.
use crate::multiindex::MultiIndex;
use std::fmt;

/// Errors that abort a run, or prevent one from starting.
///
/// PCG non-convergence is normally *not* an error: it is recorded in the diagnostics and the loop
/// continues with the best available iterate. Only under [`PcgPolicy::Abort`](crate::adaptive::PcgPolicy)
/// does it surface as [`SgfemError::PcgNonConvergence`].
#[derive(Debug)]
#[non_exhaustive]
pub enum SgfemError {
    InvalidConfiguration(String),
    NoRefinementStrategy,
    InadmissibleIndex(MultiIndex),
    AssemblyFailure { index: MultiIndex, source: eyre::Report },
    EstimationDegenerate(MultiIndex),
    PcgNonConvergence {
        iteration: usize,
        pcg_iterations: usize,
        relative_residual: f64,
    },
}

pub type Result<T> = std::result::Result<T, SgfemError>;

impl SgfemError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}

impl fmt::Display for SgfemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration(message) => write!(f, "invalid configuration: {}", message),
            Self::NoRefinementStrategy => write!(
                f,
                "no refinement strategy: at least one of refine_residual, refine_projection \
                 and refine_Lambda must be enabled"
            ),
            Self::InadmissibleIndex(index) => {
                write!(f, "admitting {} would break downward closure of the index set", index)
            }
            Self::AssemblyFailure { index, source } => {
                write!(f, "assembly failed for multi-index {}: {}", index, source)
            }
            Self::EstimationDegenerate(index) => {
                write!(f, "no usable solution for multi-index {}, cannot estimate", index)
            }
            Self::PcgNonConvergence {
                iteration,
                pcg_iterations,
                relative_residual,
            } => write!(
                f,
                "PCG did not converge in refinement iteration {} ({} iterations, relative residual {:.3e})",
                iteration, pcg_iterations, relative_residual
            ),
        }
    }
}

impl std::error::Error for SgfemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AssemblyFailure { source, .. } => Some(&**source),
            _ => None,
        }
    }
}
