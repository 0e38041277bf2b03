//! A posteriori error estimation for the stochastic Galerkin solution.
//!
//! Three indicator channels are produced per iteration:
//!
//! - residual indicators `η_{μ,T}` on every cell of every multi-index mesh,
//! - successor indicators `ζ_ν` for multi-indices that could be admitted next,
//! - mesh-projection indicators `δ_{μ,T}` measuring the interpolation error between
//!   neighbouring multi-indices discretized on distinct meshes.
//!
//! All local indicators are stored unsquared. Indicators are recomputed from scratch every
//! iteration.
use crate::error::{Result, SgfemError};
use crate::index_set::MultiIndexSet;
use crate::multiindex::MultiIndex;
use crate::polynomials::{predecessor_coupling, successor_coupling};
use crate::problem::{ProblemDefinition, SegmentCondition};
use crate::quadrature::{segment_quadrature, triangle_quadrature, SegmentQuadrature, TriangleQuadrature};
use crate::space::{CellGeometry, FiniteElementSpace};
use itertools::izip;
use log::debug;
use nalgebra::{DVector, Matrix2, Point2, Vector2};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Estimator constants and the channels to compute.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorSettings {
    pub c_q: f64,
    pub c_eta: f64,
    pub min_zeta: f64,
    /// Quadrature degree; `None` selects `2p + 1`.
    pub quadrature_degree: Option<usize>,
    pub projection_degree_increase: usize,
    pub compute_residual: bool,
    pub compute_successors: bool,
    pub compute_projection: bool,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            c_q: 1.0,
            c_eta: 6.0,
            min_zeta: 1e-8,
            quadrature_degree: None,
            projection_degree_increase: 1,
            compute_residual: true,
            compute_successors: true,
            compute_projection: true,
        }
    }
}

/// Cellwise indicators of one multi-index. Channels that were not computed are all zero.
#[derive(Debug, Clone, Serialize)]
pub struct ElementIndicators {
    pub eta: Vec<f64>,
    pub delta: Vec<f64>,
}

impl ElementIndicators {
    pub fn eta_norm(&self) -> f64 {
        self.eta.iter().map(|e| e * e).sum::<f64>().sqrt()
    }

    pub fn delta_norm(&self) -> f64 {
        self.delta.iter().map(|d| d * d).sum::<f64>().sqrt()
    }
}

/// Estimated benefit of admitting a successor `ν`.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessorIndicator {
    pub successor: MultiIndex,
    /// `ζ_ν = √(Σ_μ ζ_{ν,μ}²)`.
    pub value: f64,
    /// `(μ, ζ_{ν,μ})` for each active multi-index contributing to `ν`.
    pub contributions: Vec<(MultiIndex, f64)>,
}

/// Indicators and totals of one estimation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEstimate {
    pub elements: BTreeMap<MultiIndex, ElementIndicators>,
    /// Sorted by decreasing value.
    pub successors: Vec<SuccessorIndicator>,
    pub eta_total: f64,
    pub zeta_total: f64,
    pub delta_total: f64,
    /// Bound on the energy norm of the algebraic (PCG) error; zero until
    /// [`ErrorEstimate::include_algebraic_error`] is called.
    pub pcg_total: f64,
    /// `η_total + ζ_total + pcg_total`.
    pub global: f64,
}

impl ErrorEstimate {
    /// Adds the algebraic error of an inexact solve to the global estimate.
    ///
    /// `preconditioned_residual` is `sqrt(rᵀ P⁻¹ r)` of the final PCG residual, with `P` the
    /// block diagonal of mean stiffness matrices. The Galerkin operator dominates `(1 - γ) P`,
    /// so this divided by `√(1 - γ)` bounds `‖w - w_h‖_A`.
    pub fn include_algebraic_error(&mut self, preconditioned_residual: f64, gamma: f64) {
        self.global -= self.pcg_total;
        self.pcg_total = preconditioned_residual.max(0.0) / (1.0 - gamma).sqrt();
        self.global += self.pcg_total;
    }

    /// `(μ, cell, η_{μ,T})` sorted by decreasing indicator.
    pub fn ranked_elements(&self) -> Vec<(MultiIndex, usize, f64)> {
        let mut ranked: Vec<_> = self
            .elements
            .iter()
            .flat_map(|(index, indicators)| {
                indicators
                    .eta
                    .iter()
                    .enumerate()
                    .map(move |(cell, eta)| (index.clone(), cell, *eta))
            })
            .collect();
        ranked.sort_by_key(|(_, _, eta)| std::cmp::Reverse(OrderedFloat(*eta)));
        ranked
    }

    /// `(ν, μ, ζ_{ν,μ})` sorted by decreasing indicator.
    pub fn ranked_successor_pairs(&self) -> Vec<(MultiIndex, MultiIndex, f64)> {
        let mut ranked: Vec<_> = self
            .successors
            .iter()
            .flat_map(|s| {
                s.contributions
                    .iter()
                    .map(move |(index, zeta)| (s.successor.clone(), index.clone(), *zeta))
            })
            .collect();
        ranked.sort_by_key(|(_, _, zeta)| std::cmp::Reverse(OrderedFloat(*zeta)));
        ranked
    }

    pub fn max_zeta(&self) -> f64 {
        self.successors.first().map_or(0.0, |s| s.value)
    }
}

struct IndexEstimate {
    index: MultiIndex,
    eta_sq: Vec<f64>,
    delta_sq: Vec<f64>,
    successors_sq: Vec<(MultiIndex, f64)>,
}

/// Sum of the interpolated neighbour solutions `v_m = β⁺ Π w_{μ+e_m} + β⁻ Π w_{μ-e_m}` that
/// couple to `μ` through mode `m`.
struct CoupledFields<'a> {
    space: &'a FiniteElementSpace,
    solution: &'a DVector<f64>,
    neighbours: Vec<(usize, DVector<f64>)>,
}

/// Residual evaluator on the mesh of one multi-index.
struct LocalResidual<'a> {
    problem: &'a ProblemDefinition,
    fields: CoupledFields<'a>,
    is_mean: bool,
}

impl<'a> LocalResidual<'a> {
    fn flux(&self, cell: usize, geometry: &CellGeometry, lambda: &[f64; 3], x: &Point2<f64>) -> Matrix2<f64> {
        let field = self.problem.coefficient();
        let space = self.fields.space;
        let grad_w = space.gradient_in_cell(cell, geometry, lambda, self.fields.solution);
        let mut flux = self.problem.flux(&grad_w) * field.mean();
        for (m, v) in &self.fields.neighbours {
            let grad_v = space.gradient_in_cell(cell, geometry, lambda, v);
            flux += self.problem.flux(&grad_v) * field.mode_value(*m, x);
        }
        flux
    }

    fn volume_residual(
        &self,
        cell: usize,
        geometry: &CellGeometry,
        hessians: &HessianCache,
        x: &Point2<f64>,
        lambda: &[f64; 3],
    ) -> Vector2<f64> {
        let field = self.problem.coefficient();
        let space = self.fields.space;
        let mut residual = self.problem.flux_divergence(&hessians.solution) * field.mean();
        if self.is_mean {
            residual += self.problem.source();
        }
        for ((m, v), hessian) in self.fields.neighbours.iter().zip(&hessians.neighbours) {
            let (a_m, grad_a_m) = field.mode(*m, x);
            let grad_v = space.gradient_in_cell(cell, geometry, lambda, v);
            residual += self.problem.flux(&grad_v) * grad_a_m + self.problem.flux_divergence(hessian) * a_m;
        }
        residual
    }
}

struct HessianCache {
    solution: [Matrix2<f64>; 2],
    neighbours: Vec<[Matrix2<f64>; 2]>,
}

/// Outward unit normal of local edge `k` of a cell.
fn outward_normal(points: &[Point2<f64>; 3], k: usize) -> Vector2<f64> {
    let p = points[k];
    let d = points[(k + 1) % 3] - p;
    let n = Vector2::new(d.y, -d.x).normalize();
    if n.dot(&(points[(k + 2) % 3] - p)) > 0.0 {
        -n
    } else {
        n
    }
}

/// Barycentric coordinates of the point at parameter `t` along local edge `k`, oriented from
/// local vertex `k` to `k + 1` (or reversed).
fn edge_point(k: usize, t: f64, reversed: bool) -> [f64; 3] {
    let mut lambda = [0.0; 3];
    let t = if reversed { 1.0 - t } else { t };
    lambda[k] = 1.0 - t;
    lambda[(k + 1) % 3] = t;
    lambda
}

/// Computes residual, successor and mesh-projection indicators.
#[derive(Debug, Clone)]
pub struct ErrorEstimator<'a> {
    problem: &'a ProblemDefinition,
    settings: EstimatorSettings,
}

impl<'a> ErrorEstimator<'a> {
    pub fn new(problem: &'a ProblemDefinition, settings: EstimatorSettings) -> Self {
        Self { problem, settings }
    }

    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    fn quadrature_degree(&self) -> usize {
        self.settings
            .quadrature_degree
            .unwrap_or(2 * self.problem.degree() + 1)
    }

    fn volume_quadrature(&self) -> TriangleQuadrature {
        triangle_quadrature(self.quadrature_degree())
    }

    fn edge_quadrature(&self) -> SegmentQuadrature {
        segment_quadrature(self.quadrature_degree())
    }

    /// Estimates the error of the solutions currently stored in `set`.
    ///
    /// Fails with [`SgfemError::EstimationDegenerate`] if a multi-index has no usable solution
    /// or an indicator is not finite.
    pub fn estimate(&self, set: &MultiIndexSet) -> Result<ErrorEstimate> {
        for index in set.indices() {
            let usable = match (set.solution(index), set.space(index)) {
                (Some(solution), Some(space)) => {
                    solution.len() == space.num_dofs() && solution.iter().all(|v| v.is_finite())
                }
                _ => false,
            };
            if !usable {
                return Err(SgfemError::EstimationDegenerate(index.clone()));
            }
        }

        let indices: Vec<MultiIndex> = set.indices().cloned().collect();
        let per_index = indices
            .par_iter()
            .map(|index| self.estimate_index(set, index))
            .collect::<Result<Vec<_>>>()?;

        let mut elements = BTreeMap::new();
        let mut successors: BTreeMap<MultiIndex, Vec<(MultiIndex, f64)>> = BTreeMap::new();
        let (mut eta_sq, mut delta_sq) = (0.0, 0.0);
        for estimate in per_index {
            eta_sq += estimate.eta_sq.iter().sum::<f64>();
            delta_sq += estimate.delta_sq.iter().sum::<f64>();
            for (successor, zeta_sq) in estimate.successors_sq {
                successors
                    .entry(successor)
                    .or_default()
                    .push((estimate.index.clone(), zeta_sq.sqrt()));
            }
            elements.insert(
                estimate.index,
                ElementIndicators {
                    eta: estimate.eta_sq.into_iter().map(f64::sqrt).collect(),
                    delta: estimate.delta_sq.into_iter().map(f64::sqrt).collect(),
                },
            );
        }

        let mut successors: Vec<SuccessorIndicator> = successors
            .into_iter()
            .map(|(successor, contributions)| SuccessorIndicator {
                value: contributions.iter().map(|(_, z)| z * z).sum::<f64>().sqrt(),
                successor,
                contributions,
            })
            .collect();
        successors.sort_by_key(|s| std::cmp::Reverse(OrderedFloat(s.value)));

        let scale = 1.0 / (1.0 - self.problem.gamma()).sqrt();
        let zeta_sq: f64 = successors.iter().map(|s| s.value * s.value).sum();
        let eta_total = self.settings.c_eta * scale * eta_sq.sqrt();
        let delta_total = delta_sq.sqrt();
        let zeta_total = scale * (zeta_sq.sqrt() + self.settings.c_q * delta_total);

        Ok(ErrorEstimate {
            elements,
            successors,
            eta_total,
            zeta_total,
            delta_total,
            pcg_total: 0.0,
            global: eta_total + zeta_total,
        })
    }

    fn estimate_index(&self, set: &MultiIndexSet, index: &MultiIndex) -> Result<IndexEstimate> {
        let degenerate = || SgfemError::EstimationDegenerate(index.clone());
        let space: &Arc<FiniteElementSpace> = set.space(index).ok_or_else(degenerate)?;
        let solution = set.solution(index).ok_or_else(degenerate)?;
        let num_cells = space.num_cells();

        let eta_sq = if self.settings.compute_residual {
            self.residual_indicators(set, index, space, solution)?
        } else {
            vec![0.0; num_cells]
        };
        let delta_sq = if self.settings.compute_projection {
            self.projection_indicators(set, index, space)?
        } else {
            vec![0.0; num_cells]
        };
        let successors_sq = if self.settings.compute_successors {
            self.successor_indicators(set, index, space, solution)
        } else {
            Vec::new()
        };

        let finite = eta_sq.iter().chain(&delta_sq).all(|v| v.is_finite())
            && successors_sq.iter().all(|(_, v)| v.is_finite());
        if !finite {
            return Err(degenerate());
        }
        debug!(
            "Estimated multi-index {}: eta = {:.3e}, delta = {:.3e}, {} successor(s)",
            index,
            eta_sq.iter().sum::<f64>().sqrt(),
            delta_sq.iter().sum::<f64>().sqrt(),
            successors_sq.len()
        );
        Ok(IndexEstimate {
            index: index.clone(),
            eta_sq,
            delta_sq,
            successors_sq,
        })
    }

    fn num_coupled_modes(&self, set: &MultiIndexSet) -> usize {
        set.num_active_modes()
            .min(self.problem.coefficient().num_modes())
    }

    fn coupled_fields<'s>(
        &self,
        set: &'s MultiIndexSet,
        index: &MultiIndex,
        space: &'s FiniteElementSpace,
        solution: &'s DVector<f64>,
    ) -> Result<CoupledFields<'s>> {
        let mut neighbours = Vec::new();
        for m in 0..self.num_coupled_modes(set) {
            let mut v: Option<DVector<f64>> = None;
            let mut accumulate = |weight: f64, neighbour: &MultiIndex| -> Result<()> {
                if set.contains(neighbour) {
                    let projected = set.project(neighbour, space)?;
                    match v.as_mut() {
                        Some(v) => v.axpy(weight, &projected, 1.0),
                        None => v = Some(projected * weight),
                    }
                }
                Ok(())
            };
            accumulate(successor_coupling(index, m), &index.increment(m))?;
            if let Some(predecessor) = index.decrement(m) {
                accumulate(predecessor_coupling(index, m), &predecessor)?;
            }
            if let Some(v) = v {
                neighbours.push((m, v));
            }
        }
        Ok(CoupledFields {
            space,
            solution,
            neighbours,
        })
    }

    fn residual_indicators(
        &self,
        set: &MultiIndexSet,
        index: &MultiIndex,
        space: &FiniteElementSpace,
        solution: &DVector<f64>,
    ) -> Result<Vec<f64>> {
        let degenerate = || SgfemError::EstimationDegenerate(index.clone());
        let local = LocalResidual {
            problem: self.problem,
            fields: self.coupled_fields(set, index, space, solution)?,
            is_mean: index.is_zero(),
        };
        let mean = self.problem.coefficient().mean();
        let mesh = space.mesh();
        let quadrature = self.volume_quadrature();
        let mut eta_sq = vec![0.0; space.num_cells()];

        for cell in 0..space.num_cells() {
            let geometry = space.cell_geometry(cell).ok_or_else(degenerate)?;
            let hessians = HessianCache {
                solution: space.hessians_in_cell(cell, &geometry, solution),
                neighbours: local
                    .fields
                    .neighbours
                    .iter()
                    .map(|(_, v)| space.hessians_in_cell(cell, &geometry, v))
                    .collect(),
            };
            let mut integral = 0.0;
            for (w, lambda) in izip!(&quadrature.weights, &quadrature.points) {
                let x = geometry.map(lambda);
                let r = local.volume_residual(cell, &geometry, &hessians, &x, lambda);
                integral += w * geometry.area * r.norm_squared();
            }
            let h = mesh.cell_diameter(cell);
            eta_sq[cell] += h * h * integral / mean;
        }

        let edge_quadrature = self.edge_quadrature();
        let g = self.problem.neumann_load();
        let triangles = mesh.triangles();
        for info in &space.topology().edges {
            let (c1, k1) = info.first;
            let points1 = mesh.cell_points(c1);
            let geometry1 = space.cell_geometry(c1).ok_or_else(degenerate)?;
            let n1 = outward_normal(&points1, k1);
            let h_e = (points1[(k1 + 1) % 3] - points1[k1]).norm();

            match (info.second, info.boundary_segment) {
                (Some((c2, k2)), _) => {
                    let geometry2 = space.cell_geometry(c2).ok_or_else(degenerate)?;
                    let reversed = triangles[c2][k2] != triangles[c1][k1];
                    let mut integral = 0.0;
                    for (w, t) in izip!(&edge_quadrature.weights, &edge_quadrature.points) {
                        let lambda1 = edge_point(k1, *t, false);
                        let lambda2 = edge_point(k2, *t, reversed);
                        let x = geometry1.map(&lambda1);
                        let jump = (local.flux(c1, &geometry1, &lambda1, &x) - local.flux(c2, &geometry2, &lambda2, &x)) * n1;
                        integral += w * h_e * jump.norm_squared();
                    }
                    let contribution = 0.5 * h_e * integral / mean;
                    eta_sq[c1] += contribution;
                    eta_sq[c2] += contribution;
                }
                (None, Some(segment)) => {
                    let condition = self.problem.segment_condition(segment);
                    if condition == SegmentCondition::Dirichlet {
                        continue;
                    }
                    let load = match condition {
                        SegmentCondition::Neumann { loaded: true } if local.is_mean => g,
                        _ => Vector2::zeros(),
                    };
                    let mut integral = 0.0;
                    for (w, t) in izip!(&edge_quadrature.weights, &edge_quadrature.points) {
                        let lambda = edge_point(k1, *t, false);
                        let x = geometry1.map(&lambda);
                        let defect = load - local.flux(c1, &geometry1, &lambda, &x) * n1;
                        integral += w * h_e * defect.norm_squared();
                    }
                    eta_sq[c1] += h_e * integral / mean;
                }
                (None, None) => {}
            }
        }
        Ok(eta_sq)
    }

    /// `ζ_{μ+e_m,μ}² = β_{μ_m+1}² ∫ a_m²/ā e(w_μ)` for admissible successors.
    fn successor_indicators(
        &self,
        set: &MultiIndexSet,
        index: &MultiIndex,
        space: &FiniteElementSpace,
        solution: &DVector<f64>,
    ) -> Vec<(MultiIndex, f64)> {
        let field = self.problem.coefficient();
        let mean = field.mean();
        let quadrature = self.volume_quadrature();
        let modes: Vec<usize> = set
            .candidate_modes()
            .filter(|&m| m < field.num_modes() && set.is_admissible(&index.increment(m)))
            .collect();
        if modes.is_empty() {
            return Vec::new();
        }

        let mut integrals = vec![0.0; modes.len()];
        for cell in 0..space.num_cells() {
            let Some(geometry) = space.cell_geometry(cell) else {
                continue;
            };
            for (w, lambda) in izip!(&quadrature.weights, &quadrature.points) {
                let x = geometry.map(lambda);
                let grad = space.gradient_in_cell(cell, &geometry, lambda, solution);
                let energy = self.problem.energy_density(&grad);
                for (integral, &m) in integrals.iter_mut().zip(&modes) {
                    let a_m = field.mode_value(m, &x);
                    *integral += w * geometry.area * a_m * a_m / mean * energy;
                }
            }
        }

        modes
            .into_iter()
            .zip(integrals)
            .filter_map(|(m, integral)| {
                let beta = successor_coupling(index, m);
                let zeta_sq = beta * beta * integral;
                (zeta_sq.sqrt() >= self.settings.min_zeta).then(|| (index.increment(m), zeta_sq))
            })
            .collect()
    }

    /// `δ_{μ,T}² = Σ_ν (β ‖a_m/ā‖_∞)² ∫_T ā e(Π w_ν - w_ν)` over neighbours on distinct meshes.
    fn projection_indicators(
        &self,
        set: &MultiIndexSet,
        index: &MultiIndex,
        space: &FiniteElementSpace,
    ) -> Result<Vec<f64>> {
        let field = self.problem.coefficient();
        let mean = field.mean();
        let quadrature = triangle_quadrature(self.quadrature_degree() + self.settings.projection_degree_increase);
        let mut delta_sq = vec![0.0; space.num_cells()];

        for m in 0..self.num_coupled_modes(set) {
            let mut neighbours = vec![(index.increment(m), successor_coupling(index, m))];
            if let Some(predecessor) = index.decrement(m) {
                neighbours.push((predecessor, predecessor_coupling(index, m)));
            }
            for (neighbour, beta) in neighbours {
                if !set.contains(&neighbour) || set.shares_space(index, &neighbour) {
                    continue;
                }
                let (Some(neighbour_space), Some(neighbour_solution)) = (set.space(&neighbour), set.solution(&neighbour))
                else {
                    return Err(SgfemError::EstimationDegenerate(neighbour));
                };
                let projected = set.project(&neighbour, space)?;
                let weight = (beta * field.relative_sup_norm(m)).powi(2);
                for cell in 0..space.num_cells() {
                    let Some(geometry) = space.cell_geometry(cell) else {
                        continue;
                    };
                    let mut integral = 0.0;
                    for (w, lambda) in izip!(&quadrature.weights, &quadrature.points) {
                        let x = geometry.map(lambda);
                        let grad_projected = space.gradient_in_cell(cell, &geometry, lambda, &projected);
                        let grad_exact = neighbour_space
                            .gradient_at(neighbour_solution, &x)
                            .unwrap_or_else(Matrix2::zeros);
                        integral += w * geometry.area * mean * self.problem.energy_density(&(grad_projected - grad_exact));
                    }
                    delta_sq[cell] += weight * integral;
                }
            }
        }
        Ok(delta_sq)
    }
}
