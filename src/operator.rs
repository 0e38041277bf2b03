//! The coupled stochastic Galerkin operator and its mean-based preconditioner.
//!
//! For Legendre chaos the Galerkin system reads
//!
//! ```text
//! (A w)_μ = A_0 w_μ + Σ_m ( β_{μ_m+1} A_m w_{μ+e_m} + β_{μ_m} A_m w_{μ-e_m} ),
//! ```
//!
//! where `A_0` is the stiffness matrix of the mean coefficient and `A_m` the one of mode `m`.
//! When `μ` and its neighbour live on different meshes, the coupling block is assembled on the
//! finer mesh (the *host*) and the coarser function is interpolated onto it. The transposed block
//! uses the transposed interpolation, so the operator stays symmetric.
use crate::assembly::{Assembler, CoefficientSelector};
use crate::error::{Result, SgfemError};
use crate::index_set::{MeshId, MultiIndexSet};
use crate::multiindex::MultiIndex;
use crate::polynomials::successor_coupling;
use log::debug;
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;
use serde::Serialize;
use sgfem_sparse::cg::{ConjugateGradient, LinearOperator, OperatorError, RelativeResidualCriterion};
use sgfem_sparse::preconditioner::{factor_csr, BlockDiagonalCholesky};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deterministic operators assembled on one mesh of the arena.
pub struct MeshSystem {
    pub mean: CsrMatrix<f64>,
    pub modes: Vec<CsrMatrix<f64>>,
    pub load: DVector<f64>,
    pub mean_factor: Arc<CscCholesky<f64>>,
}

/// Assembles the mean, mode and load operators of every mesh in use, in parallel over meshes.
///
/// Failures are attributed to the first multi-index discretized on the failing mesh.
pub fn assemble_systems<A: Assembler>(
    assembler: &A,
    set: &MultiIndexSet,
    num_modes: usize,
) -> Result<BTreeMap<MeshId, MeshSystem>> {
    let meshes: Vec<_> = set.meshes().map(|(id, space)| (id, space.clone())).collect();
    meshes
        .par_iter()
        .map(|(id, space)| {
            let owner = || set.users_of(*id).next().cloned().unwrap_or_default();
            let wrap = |source: eyre::Report| SgfemError::AssemblyFailure { index: owner(), source };

            let mean = assembler
                .assemble_stiffness(space, CoefficientSelector::Mean)
                .map_err(wrap)?;
            let modes = (0..num_modes)
                .map(|m| assembler.assemble_stiffness(space, CoefficientSelector::Mode(m)))
                .collect::<eyre::Result<Vec<_>>>()
                .map_err(wrap)?;
            let load = assembler.assemble_load(space).map_err(wrap)?;
            let mean_factor = factor_csr(&mean)
                .map_err(|err| wrap(eyre::eyre!("mean stiffness matrix is not positive definite: {}", err)))?;
            debug!(
                "Assembled mesh {}: {} dofs, {} modes, {} non-zeros in mean block",
                id,
                space.num_dofs(),
                num_modes,
                mean.nnz()
            );
            Ok((
                *id,
                MeshSystem {
                    mean,
                    modes,
                    load,
                    mean_factor: Arc::new(mean_factor),
                },
            ))
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Transfer {
    /// Both blocks share a space.
    Identity,
    /// This block is the host: `A_m^row P x_col`.
    Prolongate(Arc<CsrMatrix<f64>>),
    /// The column block is the host: `P^T A_m^col x_col`.
    Restrict(Arc<CsrMatrix<f64>>),
}

#[derive(Debug, Clone)]
struct Coupling {
    column: usize,
    mode: usize,
    weight: f64,
    transfer: Transfer,
}

/// Location of each multi-index block in the global block vector.
#[derive(Debug, Clone, Serialize)]
pub struct BlockLayout {
    pub indices: Vec<MultiIndex>,
    pub offsets: Vec<usize>,
    pub lengths: Vec<usize>,
}

impl BlockLayout {
    pub fn total_len(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0) + self.lengths.last().copied().unwrap_or(0)
    }

    pub fn block<'a>(&self, x: &'a DVector<f64>, i: usize) -> DVectorView<'a, f64> {
        x.rows(self.offsets[i], self.lengths[i])
    }
}

/// Matrix-free stochastic Galerkin operator over the block vector `(w_μ)_{μ ∈ Λ}`.
pub struct StochasticOperator<'a> {
    layout: BlockLayout,
    block_meshes: Vec<MeshId>,
    systems: &'a BTreeMap<MeshId, MeshSystem>,
    couplings: Vec<Vec<Coupling>>,
}

fn spmv(matrix: &CsrMatrix<f64>, x: DVectorView<f64>) -> std::result::Result<DVector<f64>, OperatorError> {
    let mut y = DVector::zeros(matrix.nrows());
    matrix.apply((&mut y).into(), x)?;
    Ok(y)
}

impl<'a> StochasticOperator<'a> {
    /// Sets up block layout and couplings. Interpolation matrices between distinct meshes are
    /// built here, once per solve.
    pub fn new(set: &MultiIndexSet, systems: &'a BTreeMap<MeshId, MeshSystem>) -> Result<Self> {
        let indices: Vec<MultiIndex> = set.indices().cloned().collect();
        let position: BTreeMap<&MultiIndex, usize> = indices.iter().enumerate().map(|(i, index)| (index, i)).collect();

        let mut offsets = Vec::with_capacity(indices.len());
        let mut lengths = Vec::with_capacity(indices.len());
        let mut block_meshes = Vec::with_capacity(indices.len());
        let mut offset = 0;
        for index in &indices {
            let mesh = set
                .mesh_id(index)
                .ok_or_else(|| SgfemError::InadmissibleIndex(index.clone()))?;
            let len = systems
                .get(&mesh)
                .map(|system| system.load.len())
                .ok_or_else(|| SgfemError::AssemblyFailure {
                    index: index.clone(),
                    source: eyre::eyre!("no assembled system for mesh {}", mesh),
                })?;
            offsets.push(offset);
            lengths.push(len);
            block_meshes.push(mesh);
            offset += len;
        }

        let num_modes = systems.values().map(|system| system.modes.len()).min().unwrap_or(0);
        let pairs: Vec<(usize, usize, usize, f64)> = indices
            .iter()
            .enumerate()
            .flat_map(|(i, index)| {
                let position = &position;
                (0..num_modes).filter_map(move |m| {
                    position
                        .get(&index.increment(m))
                        .map(|&j| (i, j, m, successor_coupling(index, m)))
                })
            })
            .collect();

        let transfers: Vec<(Transfer, Transfer)> = pairs
            .par_iter()
            .map(|&(i, j, _, _)| {
                let (a, b) = (&indices[i], &indices[j]);
                if set.shares_space(a, b) {
                    return Ok((Transfer::Identity, Transfer::Identity));
                }
                let space_a = set.space(a).ok_or_else(|| SgfemError::InadmissibleIndex(a.clone()))?;
                let space_b = set.space(b).ok_or_else(|| SgfemError::InadmissibleIndex(b.clone()))?;
                if space_a.num_cells() >= space_b.num_cells() {
                    let p = Arc::new(space_a.interpolation_matrix(space_b));
                    let pt = Arc::new(p.transpose());
                    Ok((Transfer::Prolongate(p), Transfer::Restrict(pt)))
                } else {
                    let p = Arc::new(space_b.interpolation_matrix(space_a));
                    let pt = Arc::new(p.transpose());
                    Ok((Transfer::Restrict(pt), Transfer::Prolongate(p)))
                }
            })
            .collect::<Result<_>>()?;

        let mut couplings = vec![Vec::new(); indices.len()];
        for (&(i, j, mode, weight), (forward, backward)) in pairs.iter().zip(transfers) {
            couplings[i].push(Coupling {
                column: j,
                mode,
                weight,
                transfer: forward,
            });
            couplings[j].push(Coupling {
                column: i,
                mode,
                weight,
                transfer: backward,
            });
        }

        Ok(Self {
            layout: BlockLayout {
                indices,
                offsets,
                lengths,
            },
            block_meshes,
            systems,
            couplings,
        })
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn dim(&self) -> usize {
        self.layout.total_len()
    }

    fn system(&self, block: usize) -> &MeshSystem {
        &self.systems[&self.block_meshes[block]]
    }

    /// Load vector: the deterministic load enters the block of the zero multi-index only.
    pub fn rhs(&self) -> DVector<f64> {
        let mut b = DVector::zeros(self.dim());
        for (i, index) in self.layout.indices.iter().enumerate() {
            if index.is_zero() {
                b.rows_mut(self.layout.offsets[i], self.layout.lengths[i])
                    .copy_from(&self.system(i).load);
            }
        }
        b
    }

    /// Block vector assembled from the stored solutions; missing ones start at zero.
    pub fn initial_guess(&self, set: &MultiIndexSet) -> DVector<f64> {
        let mut x = DVector::zeros(self.dim());
        for (i, index) in self.layout.indices.iter().enumerate() {
            if let Some(solution) = set.solution(index) {
                if solution.len() == self.layout.lengths[i] {
                    x.rows_mut(self.layout.offsets[i], self.layout.lengths[i])
                        .copy_from(solution);
                }
            }
        }
        x
    }

    /// Block-diagonal preconditioner with the exact inverse of each mean block.
    pub fn mean_preconditioner(&self) -> BlockDiagonalCholesky<f64> {
        let mut preconditioner = BlockDiagonalCholesky::new();
        for i in 0..self.layout.indices.len() {
            preconditioner.push_factor(self.system(i).mean_factor.clone());
        }
        preconditioner
    }

    /// Splits a block vector into per-multi-index solutions.
    pub fn split(&self, x: &DVector<f64>) -> Vec<(MultiIndex, DVector<f64>)> {
        self.layout
            .indices
            .iter()
            .enumerate()
            .map(|(i, index)| (index.clone(), self.layout.block(x, i).into_owned()))
            .collect()
    }

    fn apply_block(&self, i: usize, x: &DVectorView<f64>) -> std::result::Result<DVector<f64>, OperatorError> {
        let view = |j: usize| x.rows(self.layout.offsets[j], self.layout.lengths[j]);
        let system = self.system(i);
        let mut y = spmv(&system.mean, view(i))?;
        for coupling in &self.couplings[i] {
            let x_j = view(coupling.column);
            let contribution = match &coupling.transfer {
                Transfer::Identity => spmv(&system.modes[coupling.mode], x_j)?,
                Transfer::Prolongate(p) => {
                    let interpolated = spmv(p, x_j)?;
                    spmv(&system.modes[coupling.mode], interpolated.rows(0, interpolated.len()))?
                }
                Transfer::Restrict(pt) => {
                    let host = self.system(coupling.column);
                    let host_product = spmv(&host.modes[coupling.mode], x_j)?;
                    spmv(pt, host_product.rows(0, host_product.len()))?
                }
            };
            y.axpy(coupling.weight, &contribution, 1.0);
        }
        Ok(y)
    }
}

impl<'a> LinearOperator<f64> for StochasticOperator<'a> {
    fn apply(&self, mut y: DVectorViewMut<f64>, x: DVectorView<f64>) -> std::result::Result<(), OperatorError> {
        if x.len() != self.dim() || y.len() != self.dim() {
            return Err(format!(
                "stochastic operator of dimension {} applied to vector of length {}",
                self.dim(),
                x.len()
            )
            .into());
        }
        let blocks = (0..self.layout.indices.len())
            .into_par_iter()
            .map(|i| self.apply_block(i, &x))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (i, block) in blocks.into_iter().enumerate() {
            y.rows_mut(self.layout.offsets[i], self.layout.lengths[i])
                .copy_from(&block);
        }
        Ok(())
    }
}

/// Outcome of the coupled PCG solve.
#[derive(Debug, Clone, Serialize)]
pub struct PcgReport {
    pub converged: bool,
    pub iterations: usize,
    pub relative_residual: f64,
    /// `sqrt(rᵀ P⁻¹ r)` with `P` the block diagonal of mean stiffness matrices.
    pub preconditioned_residual: f64,
    pub failure: Option<String>,
}

/// Solves the coupled system with mean-based block preconditioning, starting from `x`.
///
/// Non-convergence is reported, not raised: `x` then holds the last iterate. Only failures to
/// apply the operator itself are errors.
pub fn solve_coupled(
    operator: &StochasticOperator,
    x: &mut DVector<f64>,
    tolerance: f64,
    max_iter: usize,
) -> std::result::Result<PcgReport, OperatorError> {
    let b = operator.rhs();
    let preconditioner = operator.mean_preconditioner();
    let result = ConjugateGradient::new()
        .with_operator(operator)
        .with_preconditioner(&preconditioner)
        .with_stopping_criterion(RelativeResidualCriterion::new(tolerance))
        .with_max_iter(max_iter)
        .solve_with_guess(&b, &mut *x);
    match result {
        Ok(output) => Ok(PcgReport {
            converged: true,
            iterations: output.num_iterations,
            relative_residual: output.relative_residual,
            preconditioned_residual: output.preconditioned_residual,
            failure: None,
        }),
        Err(err) if err.kind.is_recoverable() => Ok(PcgReport {
            converged: false,
            iterations: err.output.num_iterations,
            relative_residual: err.output.relative_residual,
            preconditioned_residual: err.output.preconditioned_residual,
            failure: Some(err.kind.to_string()),
        }),
        Err(err) => Err(err.to_string().into()),
    }
}
