//! Sparse linear algebra used by the stochastic Galerkin solver.
pub mod cg;
pub mod preconditioner;

pub use cg::{ConjugateGradient, LinearOperator, RelativeResidualCriterion};
pub use preconditioner::BlockDiagonalCholesky;
