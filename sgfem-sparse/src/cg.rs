//! Preconditioned Conjugate Gradient for symmetric positive definite operators.
use core::fmt;
use nalgebra::{ClosedAdd, ClosedMul, DMatrix, DVector, DVectorView, DVectorViewMut, RealField, Scalar};
use nalgebra_sparse::CsrMatrix;
use num::{One, Zero};
use rayon::prelude::*;
use std::error::Error;

/// Error type produced by operators applied inside the solver.
pub type OperatorError = Box<dyn Error + Send + Sync>;

/// A linear map `y = A x` on dynamically sized vectors.
///
/// Implementors must be `Sync` so that block operators can fan their work out over a thread pool.
pub trait LinearOperator<T: Scalar>: Sync {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

fn check_dimensions(nrows: usize, ncols: usize, y_len: usize, x_len: usize) -> Result<(), OperatorError> {
    if nrows != y_len || ncols != x_len {
        return Err(format!(
            "dimension mismatch: {}x{} operator applied to vector of length {} (output length {})",
            nrows, ncols, x_len, y_len
        )
        .into());
    }
    Ok(())
}

impl<T> LinearOperator<T> for DMatrix<T>
where
    T: Scalar + One + Zero + ClosedMul + ClosedAdd + Send + Sync,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        check_dimensions(self.nrows(), self.ncols(), y.len(), x.len())?;
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

/// Row-parallel sparse matrix-vector product.
impl<T> LinearOperator<T> for CsrMatrix<T>
where
    T: Scalar + Zero + ClosedMul + ClosedAdd + Send + Sync,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        check_dimensions(self.nrows(), self.ncols(), y.len(), x.len())?;
        let products: Vec<T> = (0..self.nrows())
            .into_par_iter()
            .map(|i| {
                let row = self.row(i);
                row.col_indices()
                    .iter()
                    .zip(row.values())
                    .fold(T::zero(), |sum, (&j, a_ij)| sum + a_ij.clone() * x[j].clone())
            })
            .collect();
        for (y_i, product) in y.iter_mut().zip(products) {
            *y_i = product;
        }
        Ok(())
    }
}

/// The identity map, used as the default (absent) preconditioner.
pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        y.copy_from(&x);
        Ok(())
    }
}

pub trait CgStoppingCriterion<T: Scalar> {
    fn has_converged(&self, b_norm: T, iteration: usize, approx_residual: DVectorView<T>) -> bool;
}

/// Relative residual tolerance ||r|| <= tol * ||b||.
///
/// The residual is the recursively updated one, not a freshly computed `b - Ax`.
#[derive(Debug, Clone, Copy)]
pub struct RelativeResidualCriterion<T: Scalar> {
    tol: T,
}

impl<T: Scalar> RelativeResidualCriterion<T> {
    pub fn new(tol: T) -> Self {
        Self { tol }
    }

    pub fn tolerance(&self) -> &T {
        &self.tol
    }
}

impl Default for RelativeResidualCriterion<f64> {
    fn default() -> Self {
        Self::new(1e-8)
    }
}

impl<T: RealField> CgStoppingCriterion<T> for RelativeResidualCriterion<T> {
    fn has_converged(&self, b_norm: T, _iteration: usize, approx_residual: DVectorView<T>) -> bool {
        approx_residual.norm() <= self.tol.clone() * b_norm
    }
}

/// Residual, preconditioned residual, search direction and its image under the operator.
#[derive(Debug, Clone)]
struct CgVectors<T: Scalar> {
    residual: DVector<T>,
    preconditioned: DVector<T>,
    direction: DVector<T>,
    image: DVector<T>,
}

impl<T: Scalar + Zero> CgVectors<T> {
    fn zeros(dim: usize) -> Self {
        Self {
            residual: DVector::zeros(dim),
            preconditioned: DVector::zeros(dim),
            direction: DVector::zeros(dim),
            image: DVector::zeros(dim),
        }
    }
}

/// Builder-style PCG solver.
///
/// ```ignore
/// let output = ConjugateGradient::new()
///     .with_operator(&a)
///     .with_preconditioner(&p)
///     .with_stopping_criterion(RelativeResidualCriterion::new(1e-8))
///     .with_max_iter(100)
///     .solve_with_guess(&b, &mut x)?;
/// ```
#[derive(Debug)]
pub struct ConjugateGradient<A, P, Criterion> {
    operator: A,
    preconditioner: P,
    stopping_criterion: Criterion,
    max_iter: Option<usize>,
}

impl ConjugateGradient<(), IdentityOperator, ()> {
    pub fn new() -> Self {
        Self {
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            max_iter: None,
        }
    }
}

impl Default for ConjugateGradient<(), IdentityOperator, ()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, P, Criterion> ConjugateGradient<A, P, Criterion> {
    pub fn with_operator<A2>(self, operator: A2) -> ConjugateGradient<A2, P, Criterion> {
        ConjugateGradient {
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> ConjugateGradient<A, P2, Criterion> {
        ConjugateGradient {
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    pub fn with_stopping_criterion<C2>(self, stopping_criterion: C2) -> ConjugateGradient<A, P, C2> {
        ConjugateGradient {
            operator: self.operator,
            preconditioner: self.preconditioner,
            stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self {
            max_iter: Some(max_iter),
            ..self
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolveErrorKind {
    OperatorError(OperatorError),
    PreconditionerError(OperatorError),
    IndefiniteOperator,
    IndefinitePreconditioner,
    MaxIterationsReached { max_iter: usize },
}

impl SolveErrorKind {
    /// Whether the iterate left behind by the solver is still usable.
    ///
    /// Only failures to apply the operator or the preconditioner are fatal. After a numerical
    /// breakdown or an exhausted budget, `x` holds the last completed update.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::OperatorError(_) | Self::PreconditionerError(_))
    }
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => write!(f, "Error applying operator: {}", err),
            Self::PreconditionerError(err) => write!(f, "Error applying preconditioner: {}", err),
            Self::IndefiniteOperator => write!(f, "Operator appears to be indefinite."),
            Self::IndefinitePreconditioner => write!(f, "Indefinite preconditioner."),
            Self::MaxIterationsReached { max_iter } => {
                write!(f, "Max iterations ({}) reached.", max_iter)
            }
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct SolveError<T> {
    pub output: CgOutput<T>,
    pub kind: SolveErrorKind,
}

impl<T> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CG solve failed after {} iterations. Error: {}",
            self.output.num_iterations, self.kind
        )
    }
}

impl<T: fmt::Debug> std::error::Error for SolveError<T> {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CgOutput<T> {
    /// Number of updates made to the initial guess.
    pub num_iterations: usize,
    /// `||r|| / ||b||` for the approximate residual at exit (zero for a zero right-hand side).
    pub relative_residual: T,
    /// `sqrt(rᵀ P r)` for the approximate residual at exit, where `P` is the preconditioner.
    ///
    /// When `P` approximates `A⁻¹` from below, this bounds the `A`-norm of the algebraic error.
    pub preconditioned_residual: T,
}

impl<A, P, Criterion> ConjugateGradient<A, P, Criterion> {
    /// Solves `Ax = b` starting from the guess stored in `x`.
    ///
    /// On failure, `x` holds the last iterate produced before the failure was detected.
    pub fn solve_with_guess<'b, T>(
        &self,
        b: impl Into<DVectorView<'b, T>>,
        x: impl Into<DVectorViewMut<'b, T>>,
    ) -> Result<CgOutput<T>, SolveError<T>>
    where
        T: RealField,
        A: LinearOperator<T>,
        P: LinearOperator<T>,
        Criterion: CgStoppingCriterion<T>,
    {
        let b = b.into();
        let mut x = x.into();
        assert_eq!(b.len(), x.len(), "right-hand side and solution lengths differ");

        let mut output = CgOutput {
            num_iterations: 0,
            relative_residual: T::zero(),
            preconditioned_residual: T::zero(),
        };
        let fail = |output: &CgOutput<T>, kind| {
            Err(SolveError {
                output: output.clone(),
                kind,
            })
        };

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        let CgVectors {
            mut residual,
            mut preconditioned,
            mut direction,
            mut image,
        } = CgVectors::zeros(x.len());

        // r = b - Ax
        if let Err(err) = self.operator.apply((&mut residual).into(), (&x).into()) {
            return fail(&output, SolveErrorKind::OperatorError(err));
        }
        residual.axpy(T::one(), &b, -T::one());
        output.relative_residual = residual.norm() / b_norm.clone();

        if let Err(err) = self
            .preconditioner
            .apply((&mut preconditioned).into(), (&residual).into())
        {
            return fail(&output, SolveErrorKind::PreconditionerError(err));
        }
        direction.copy_from(&preconditioned);
        let mut rho = preconditioned.dot(&residual);
        output.preconditioned_residual = rho.clone().max(T::zero()).sqrt();

        while !self
            .stopping_criterion
            .has_converged(b_norm.clone(), output.num_iterations, (&residual).into())
        {
            if let Some(max_iter) = self.max_iter.filter(|&max_iter| output.num_iterations >= max_iter) {
                return fail(&output, SolveErrorKind::MaxIterationsReached { max_iter });
            }

            if let Err(err) = self.operator.apply((&mut image).into(), (&direction).into()) {
                return fail(&output, SolveErrorKind::OperatorError(err));
            }
            let curvature = direction.dot(&image);
            if curvature <= T::zero() {
                return fail(&output, SolveErrorKind::IndefiniteOperator);
            }
            if rho <= T::zero() {
                return fail(&output, SolveErrorKind::IndefinitePreconditioner);
            }

            let alpha = rho.clone() / curvature;
            x.axpy(alpha.clone(), &direction, T::one());
            residual.axpy(-alpha, &image, T::one());
            output.num_iterations += 1;
            output.relative_residual = residual.norm() / b_norm.clone();

            if let Err(err) = self
                .preconditioner
                .apply((&mut preconditioned).into(), (&residual).into())
            {
                return fail(&output, SolveErrorKind::PreconditionerError(err));
            }
            let rho_next = preconditioned.dot(&residual);
            output.preconditioned_residual = rho_next.clone().max(T::zero()).sqrt();
            let beta = rho_next.clone() / rho;
            // p <- z + beta p
            direction.axpy(T::one(), &preconditioned, beta);
            rho = rho_next;
        }

        Ok(output)
    }
}
