//! Block-diagonal preconditioners for coupled systems.
use crate::cg::{LinearOperator, OperatorError};
use nalgebra::{DMatrix, DVectorView, DVectorViewMut, RealField};
use nalgebra_sparse::factorization::{CholeskyError, CscCholesky};
use nalgebra_sparse::{CscMatrix, CsrMatrix};
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Block<T: RealField> {
    offset: usize,
    len: usize,
    factor: Arc<CscCholesky<T>>,
}

/// Applies `diag(A_1^{-1}, ..., A_n^{-1})` to a block vector using sparse Cholesky factors.
///
/// Factors are reference counted so that blocks discretized on the same mesh can share one
/// factorization.
#[derive(Debug, Clone)]
pub struct BlockDiagonalCholesky<T: RealField> {
    blocks: Vec<Block<T>>,
    dim: usize,
}

#[derive(Debug)]
pub struct BlockFactorizationError {
    pub block: usize,
    pub source: CholeskyError,
}

impl fmt::Display for BlockFactorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cholesky factorization of block {} failed: {}", self.block, self.source)
    }
}

impl std::error::Error for BlockFactorizationError {}

/// Computes the sparse Cholesky factor of a symmetric positive definite CSR matrix.
pub fn factor_csr<T: RealField>(matrix: &CsrMatrix<T>) -> Result<CscCholesky<T>, CholeskyError> {
    let csc = CscMatrix::from(matrix);
    CscCholesky::factor(&csc)
}

impl<T: RealField> Default for BlockDiagonalCholesky<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RealField> BlockDiagonalCholesky<T> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            dim: 0,
        }
    }

    /// Factors every matrix independently and stacks the factors in order.
    pub fn factor_blocks<'a>(matrices: impl IntoIterator<Item = &'a CsrMatrix<T>>) -> Result<Self, BlockFactorizationError>
    where
        T: 'a,
    {
        let mut preconditioner = Self::new();
        for (block, matrix) in matrices.into_iter().enumerate() {
            let factor = factor_csr(matrix).map_err(|source| BlockFactorizationError { block, source })?;
            preconditioner.push_factor(Arc::new(factor));
        }
        Ok(preconditioner)
    }

    /// Appends a block whose inverse is given by the supplied factor.
    pub fn push_factor(&mut self, factor: Arc<CscCholesky<T>>) {
        let len = factor.l().nrows();
        self.blocks.push(Block {
            offset: self.dim,
            len,
            factor,
        });
        self.dim += len;
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl<T: RealField> LinearOperator<T> for BlockDiagonalCholesky<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        if x.len() != self.dim || y.len() != self.dim {
            return Err(format!(
                "block preconditioner of dimension {} applied to vector of length {}",
                self.dim,
                x.len()
            )
            .into());
        }

        let solutions: Vec<DMatrix<T>> = self
            .blocks
            .par_iter()
            .map(|block| {
                let rhs = DMatrix::from_iterator(block.len, 1, x.rows(block.offset, block.len).iter().cloned());
                block.factor.solve(&rhs)
            })
            .collect();

        for (block, solution) in self.blocks.iter().zip(solutions) {
            y.rows_mut(block.offset, block.len)
                .copy_from(&solution.column(0));
        }
        Ok(())
    }
}
