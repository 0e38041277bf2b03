//! Assembly of stiffness matrices and load vectors on a single finite element space.
use crate::problem::{ProblemDefinition, ProblemKind, SegmentCondition};
use crate::quadrature::{segment_quadrature, triangle_quadrature};
use crate::space::{FiniteElementSpace, MAX_NODES_PER_CELL};
use eyre::{bail, eyre};
use itertools::izip;
use nalgebra::{DMatrix, DVector, Vector2};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

/// Which coefficient the stiffness matrix is assembled with.
#[derive(Debug, Clone, Copy)]
pub enum CoefficientSelector<'a> {
    /// The mean field `ā`. Dirichlet dofs get identity rows.
    Mean,
    /// The expansion mode `a_m`. Dirichlet rows and columns are zero.
    Mode(usize),
    /// A sampled realization `ā + Σ y_m a_m`. Dirichlet dofs get identity rows.
    Realization(&'a [f64]),
}

impl<'a> CoefficientSelector<'a> {
    fn has_identity_dirichlet_rows(&self) -> bool {
        !matches!(self, Self::Mode(_))
    }
}

/// Produces the deterministic discrete operators the stochastic Galerkin system is built from.
pub trait Assembler: Sync {
    fn assemble_stiffness(
        &self,
        space: &FiniteElementSpace,
        coefficient: CoefficientSelector,
    ) -> eyre::Result<CsrMatrix<f64>>;

    /// Volume and Neumann load. Dirichlet entries are zero.
    fn assemble_load(&self, space: &FiniteElementSpace) -> eyre::Result<DVector<f64>>;
}

/// Standard conforming Galerkin assembly for the problems of a [`ProblemDefinition`].
#[derive(Debug, Clone)]
pub struct GalerkinAssembler<'a> {
    problem: &'a ProblemDefinition,
    quadrature_degree: usize,
}

impl<'a> GalerkinAssembler<'a> {
    pub fn new(problem: &'a ProblemDefinition) -> Self {
        Self {
            problem,
            quadrature_degree: 2 * problem.degree() + 1,
        }
    }

    /// Overrides the quadrature degree. `None` keeps the automatic choice.
    pub fn with_quadrature_degree(self, degree: Option<usize>) -> Self {
        Self {
            quadrature_degree: degree.unwrap_or(self.quadrature_degree),
            ..self
        }
    }

    pub fn quadrature_degree(&self) -> usize {
        self.quadrature_degree
    }

    fn coefficient_value(&self, selector: &CoefficientSelector, x: &nalgebra::Point2<f64>) -> f64 {
        let field = self.problem.coefficient();
        match selector {
            CoefficientSelector::Mean => field.mean(),
            CoefficientSelector::Mode(m) => field.mode_value(*m, x),
            CoefficientSelector::Realization(y) => field.realization(x, y),
        }
    }
}

impl<'a> Assembler for GalerkinAssembler<'a> {
    #[allow(non_snake_case)]
    fn assemble_stiffness(
        &self,
        space: &FiniteElementSpace,
        coefficient: CoefficientSelector,
    ) -> eyre::Result<CsrMatrix<f64>> {
        if let CoefficientSelector::Mode(m) = coefficient {
            if m >= self.problem.coefficient().num_modes() {
                bail!(
                    "mode {} exceeds the {} modes of the coefficient expansion",
                    m,
                    self.problem.coefficient().num_modes()
                );
            }
        }
        let dim = space.solution_dim();
        let n_local = space.nodes_per_cell();
        let n_dofs = space.num_dofs();
        let quadrature = triangle_quadrature(self.quadrature_degree);

        let mut coo = CooMatrix::new(n_dofs, n_dofs);
        let mut A_local = DMatrix::zeros(dim * n_local, dim * n_local);
        let mut grad_phi = [Vector2::zeros(); MAX_NODES_PER_CELL];

        for cell in 0..space.num_cells() {
            let geometry = space
                .cell_geometry(cell)
                .ok_or_else(|| eyre!("cell {} is degenerate", cell))?;
            A_local.fill(0.0);
            for (w, lambda) in izip!(&quadrature.weights, &quadrature.points) {
                let x = geometry.map(lambda);
                let c = self.coefficient_value(&coefficient, &x);
                if !c.is_finite() {
                    bail!("non-finite coefficient value at ({}, {})", x.x, x.y);
                }
                let weight = w * geometry.area * c;
                space.basis_gradients(&geometry, lambda, &mut grad_phi);
                match self.problem.kind() {
                    ProblemKind::Poisson => {
                        for a in 0..n_local {
                            for b in 0..n_local {
                                A_local[(a, b)] += weight * grad_phi[a].dot(&grad_phi[b]);
                            }
                        }
                    }
                    ProblemKind::Elasticity { mu, lambda: lame_lambda } => {
                        for a in 0..n_local {
                            for b in 0..n_local {
                                let gradient_product = grad_phi[a].dot(&grad_phi[b]);
                                for s in 0..2 {
                                    for t in 0..2 {
                                        let delta = if s == t { gradient_product } else { 0.0 };
                                        let entry = mu * (delta + grad_phi[a][t] * grad_phi[b][s])
                                            + lame_lambda * grad_phi[a][s] * grad_phi[b][t];
                                        A_local[(2 * a + s, 2 * b + t)] += weight * entry;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            let nodes = space.cell_nodes(cell);
            for (a, &node_a) in nodes.iter().enumerate() {
                for s in 0..dim {
                    let row = dim * node_a + s;
                    if space.is_dirichlet_dof(row) {
                        continue;
                    }
                    for (b, &node_b) in nodes.iter().enumerate() {
                        for t in 0..dim {
                            let col = dim * node_b + t;
                            if !space.is_dirichlet_dof(col) {
                                coo.push(row, col, A_local[(dim * a + s, dim * b + t)]);
                            }
                        }
                    }
                }
            }
        }

        if coefficient.has_identity_dirichlet_rows() {
            for dof in (0..n_dofs).filter(|&dof| space.is_dirichlet_dof(dof)) {
                coo.push(dof, dof, 1.0);
            }
        }

        Ok(CsrMatrix::from(&coo))
    }

    fn assemble_load(&self, space: &FiniteElementSpace) -> eyre::Result<DVector<f64>> {
        let dim = space.solution_dim();
        let quadrature = triangle_quadrature(self.quadrature_degree);
        let source = self.problem.source();
        let mut load = DVector::zeros(space.num_dofs());
        let mut phi = [0.0; MAX_NODES_PER_CELL];

        for cell in 0..space.num_cells() {
            let area = space.mesh().cell_area(cell);
            if !(area > 0.0) {
                bail!("cell {} is degenerate", cell);
            }
            for (w, lambda) in izip!(&quadrature.weights, &quadrature.points) {
                space.basis_values(lambda, &mut phi);
                for (phi_a, &node) in phi.iter().zip(space.cell_nodes(cell)) {
                    for c in 0..dim {
                        load[dim * node + c] += w * area * phi_a * source[c];
                    }
                }
            }
        }

        let edge_quadrature = segment_quadrature(self.quadrature_degree);
        let g = self.problem.neumann_load();
        for info in &space.topology().edges {
            let Some(segment) = info.boundary_segment else {
                continue;
            };
            if self.problem.segment_condition(segment) != (SegmentCondition::Neumann { loaded: true }) {
                continue;
            }
            let (cell, k) = info.first;
            let [p, q] = edge_endpoints(space, cell, k);
            let length = (q - p).norm();
            for (w, t) in izip!(&edge_quadrature.weights, &edge_quadrature.points) {
                let mut lambda = [0.0; 3];
                lambda[k] = 1.0 - t;
                lambda[(k + 1) % 3] = *t;
                space.basis_values(&lambda, &mut phi);
                for (phi_a, &node) in phi.iter().zip(space.cell_nodes(cell)) {
                    for c in 0..dim {
                        load[dim * node + c] += w * length * phi_a * g[c];
                    }
                }
            }
        }

        for dof in 0..load.len() {
            if space.is_dirichlet_dof(dof) {
                load[dof] = 0.0;
            }
        }
        Ok(load)
    }
}

/// Physical endpoints of local edge `k` of `cell`, in local orientation.
pub(crate) fn edge_endpoints(space: &FiniteElementSpace, cell: usize, k: usize) -> [nalgebra::Point2<f64>; 2] {
    let points = space.mesh().cell_points(cell);
    [points[k], points[(k + 1) % 3]]
}
