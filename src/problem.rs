//! Immutable description of the parametric boundary value problem.
use crate::coefficient::{CoefficientFamily, CoefficientField, ExpansionParameters};
use crate::error::{Result, SgfemError};
use crate::mesh::procedural::create_domain_mesh;
use crate::mesh::TriangleMesh;
use crate::space::FiniteElementSpace;
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The PDE being solved. Lamé parameters only exist for the elasticity variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProblemKind {
    Poisson,
    Elasticity { mu: f64, lambda: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Square,
    LShape,
    Cooks,
}

impl FromStr for Domain {
    type Err = SgfemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "square" => Ok(Self::Square),
            "lshape" => Ok(Self::LShape),
            "cooks" => Ok(Self::Cooks),
            other => Err(SgfemError::invalid(format!("unknown domain \"{}\"", other))),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Square => "square",
            Self::LShape => "lshape",
            Self::Cooks => "cooks",
        };
        write!(f, "{}", name)
    }
}

impl Domain {
    /// Boundary polygon in counter-clockwise order. Segment `i` runs from corner `i` to corner `i + 1`.
    pub fn corners(&self) -> Vec<Point2<f64>> {
        match self {
            Self::Square => vec![
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 0.0),
                Point2::new(1.0, 1.0),
                Point2::new(0.0, 1.0),
            ],
            Self::LShape => vec![
                Point2::new(-1.0, -1.0),
                Point2::new(0.0, -1.0),
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 0.0),
                Point2::new(1.0, 1.0),
                Point2::new(-1.0, 1.0),
            ],
            Self::Cooks => vec![
                Point2::new(0.0, 0.0),
                Point2::new(48.0, 44.0),
                Point2::new(48.0, 60.0),
                Point2::new(0.0, 44.0),
            ],
        }
    }

    pub fn num_segments(&self) -> usize {
        self.corners().len()
    }

    /// Lower-left corner and extent of the bounding box.
    pub fn bounding_box(&self) -> (Point2<f64>, Vector2<f64>) {
        let corners = self.corners();
        let mut min = corners[0];
        let mut max = corners[0];
        for c in &corners {
            min = min.inf(c);
            max = max.sup(c);
        }
        (min, max - min)
    }

    /// Returns the boundary segment that contains the straight edge `a`-`b`, if any.
    pub fn segment_containing(&self, a: &Point2<f64>, b: &Point2<f64>) -> Option<usize> {
        let corners = self.corners();
        let (_, extent) = self.bounding_box();
        let tol = 1e-10 * extent.norm();
        let n = corners.len();
        (0..n).find(|&s| {
            let p = corners[s];
            let q = corners[(s + 1) % n];
            distance_to_segment(a, &p, &q) <= tol && distance_to_segment(b, &p, &q) <= tol
        })
    }
}

fn distance_to_segment(x: &Point2<f64>, p: &Point2<f64>, q: &Point2<f64>) -> f64 {
    let d = q - p;
    let t = ((x - p).dot(&d) / d.norm_squared()).clamp(0.0, 1.0);
    (x - (p + d * t)).norm()
}

/// Condition imposed on a boundary segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentCondition {
    Dirichlet,
    /// Natural boundary, with the problem's Neumann load if `loaded`, homogeneous otherwise.
    Neumann { loaded: bool },
}

/// Resolves a `boundary_type` tag against the number of boundary segments of a domain.
pub fn boundary_conditions(boundary_type: u32, num_segments: usize) -> Result<Vec<SegmentCondition>> {
    use SegmentCondition::*;
    let required = match boundary_type {
        0 => 1,
        1 => 2,
        2 | 3 => 4,
        4 => 6,
        other => return Err(SgfemError::invalid(format!("unknown boundary_type {}", other))),
    };
    if num_segments < required || (boundary_type == 4 && num_segments != 6) {
        return Err(SgfemError::invalid(format!(
            "boundary_type {} needs {} boundary segments, domain has {}",
            boundary_type, required, num_segments
        )));
    }
    let conditions = (0..num_segments)
        .map(|s| match (boundary_type, s) {
            (0, _) => Dirichlet,
            (1, 0) => Dirichlet,
            (1, _) => Neumann { loaded: false },
            (2, 0) | (2, 2) => Dirichlet,
            (2, 1) => Neumann { loaded: true },
            (3, 3) => Dirichlet,
            (3, 1) => Neumann { loaded: true },
            (4, 1) | (4, 2) => Dirichlet,
            (4, 4) => Neumann { loaded: true },
            _ => Neumann { loaded: false },
        })
        .collect();
    Ok(conditions)
}

/// Raw problem parameters, validated by [`ProblemDefinition::new`].
#[derive(Debug, Clone)]
pub struct ProblemParameters {
    pub kind: ProblemKind,
    pub domain: Domain,
    pub boundary_type: u32,
    pub fem_degree: usize,
    pub coeff_type: u32,
    pub coeff_scale: f64,
    pub decay_exp: f64,
    pub freq_scale: f64,
    pub freq_skip: u32,
    pub gamma: f64,
    pub initial_mesh_n: usize,
    pub initial_modes: usize,
    pub max_modes: usize,
}

impl Default for ProblemParameters {
    fn default() -> Self {
        Self {
            kind: ProblemKind::Poisson,
            domain: Domain::Square,
            boundary_type: 0,
            fem_degree: 1,
            coeff_type: 0,
            coeff_scale: 1.0,
            decay_exp: 2.0,
            freq_scale: 1.0,
            freq_skip: 0,
            gamma: 0.9,
            initial_mesh_n: 10,
            initial_modes: 1,
            max_modes: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProblemDefinition {
    kind: ProblemKind,
    domain: Domain,
    boundary_type: u32,
    conditions: Vec<SegmentCondition>,
    degree: usize,
    decay_exp: f64,
    gamma: f64,
    initial_mesh_n: usize,
    initial_modes: usize,
    coefficient: CoefficientField,
}

impl ProblemDefinition {
    pub fn new(parameters: ProblemParameters) -> Result<Self> {
        let p = &parameters;
        if p.fem_degree < 1 {
            return Err(SgfemError::invalid(format!("FEM_degree must be at least 1, got {}", p.fem_degree)));
        }
        if p.fem_degree > 2 {
            return Err(SgfemError::invalid(format!(
                "FEM_degree {} is not supported (1 or 2)",
                p.fem_degree
            )));
        }
        if !(p.decay_exp > 0.0) {
            return Err(SgfemError::invalid(format!("decay_exp must be positive, got {}", p.decay_exp)));
        }
        if !(p.coeff_scale > 0.0) {
            return Err(SgfemError::invalid(format!(
                "coeff_scale must be positive, got {}",
                p.coeff_scale
            )));
        }
        if !(p.gamma > 0.0 && p.gamma < 1.0) {
            return Err(SgfemError::invalid(format!("gamma must lie in (0, 1), got {}", p.gamma)));
        }
        if !(p.freq_scale > 0.0) {
            return Err(SgfemError::invalid(format!("freq_scale must be positive, got {}", p.freq_scale)));
        }
        if p.initial_mesh_n == 0 {
            return Err(SgfemError::invalid("initial_mesh_N must be positive"));
        }
        if p.max_modes == 0 || p.initial_modes > p.max_modes {
            return Err(SgfemError::invalid(format!(
                "initial_modes ({}) must not exceed max_modes ({}) and max_modes must be positive",
                p.initial_modes, p.max_modes
            )));
        }
        if let ProblemKind::Elasticity { mu, lambda } = p.kind {
            if !(mu > 0.0) || !(lambda >= 0.0) {
                return Err(SgfemError::invalid(format!(
                    "Lame parameters must satisfy mu > 0 and lambda >= 0, got mu = {}, lambda = {}",
                    mu, lambda
                )));
            }
        }
        let family = CoefficientFamily::from_coeff_type(p.coeff_type)
            .ok_or_else(|| SgfemError::invalid(format!("unknown coeff_type {}", p.coeff_type)))?;
        let conditions = boundary_conditions(p.boundary_type, p.domain.num_segments())?;

        let (origin, extent) = p.domain.bounding_box();
        let coefficient = CoefficientField::new(
            &ExpansionParameters {
                family,
                coeff_scale: p.coeff_scale,
                decay_exp: p.decay_exp,
                gamma: p.gamma,
                freq_scale: p.freq_scale,
                freq_skip: p.freq_skip,
                max_modes: p.max_modes,
            },
            origin,
            extent,
        );

        Ok(Self {
            kind: p.kind,
            domain: p.domain,
            boundary_type: p.boundary_type,
            conditions,
            degree: p.fem_degree,
            decay_exp: p.decay_exp,
            gamma: p.gamma,
            initial_mesh_n: p.initial_mesh_n,
            initial_modes: p.initial_modes,
            coefficient,
        })
    }

    pub fn kind(&self) -> ProblemKind {
        self.kind
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn boundary_type(&self) -> u32 {
        self.boundary_type
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn decay_exp(&self) -> f64 {
        self.decay_exp
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn initial_modes(&self) -> usize {
        self.initial_modes
    }

    pub fn max_modes(&self) -> usize {
        self.coefficient.num_modes()
    }

    pub fn coefficient(&self) -> &CoefficientField {
        &self.coefficient
    }

    pub fn segment_condition(&self, segment: usize) -> SegmentCondition {
        self.conditions
            .get(segment)
            .copied()
            .unwrap_or(SegmentCondition::Neumann { loaded: false })
    }

    pub fn is_dirichlet_segment(&self, segment: usize) -> bool {
        self.segment_condition(segment) == SegmentCondition::Dirichlet
    }

    /// Number of solution components (1 for Poisson, 2 for elasticity).
    pub fn solution_dim(&self) -> usize {
        match self.kind {
            ProblemKind::Poisson => 1,
            ProblemKind::Elasticity { .. } => 2,
        }
    }

    /// Volume source `f`. Scalar problems only use the first component.
    pub fn source(&self) -> Vector2<f64> {
        match self.kind {
            ProblemKind::Poisson => Vector2::new(1.0, 0.0),
            ProblemKind::Elasticity { .. } => Vector2::new(0.0, -1.0),
        }
    }

    /// Neumann load `g` on loaded segments.
    pub fn neumann_load(&self) -> Vector2<f64> {
        match self.kind {
            ProblemKind::Poisson => Vector2::new(1.0, 0.0),
            ProblemKind::Elasticity { .. } => Vector2::new(0.0, 1.0),
        }
    }

    /// Flux for unit coefficient, given the solution gradient (row `s` holds `∇u_s`).
    ///
    /// Poisson: `∇u` in row 0. Elasticity: `2μ ε(u) + λ tr ε(u) I`.
    pub fn flux(&self, grad: &Matrix2<f64>) -> Matrix2<f64> {
        match self.kind {
            ProblemKind::Poisson => {
                let mut flux = Matrix2::zeros();
                flux.set_row(0, &grad.row(0));
                flux
            }
            ProblemKind::Elasticity { mu, lambda } => {
                let strain = (grad + grad.transpose()) * 0.5;
                strain * (2.0 * mu) + Matrix2::identity() * (lambda * grad.trace())
            }
        }
    }

    /// Divergence of [`flux`](Self::flux) given the Hessians of each solution component.
    pub fn flux_divergence(&self, hessians: &[Matrix2<f64>; 2]) -> Vector2<f64> {
        match self.kind {
            ProblemKind::Poisson => Vector2::new(hessians[0].trace(), 0.0),
            ProblemKind::Elasticity { mu, lambda } => {
                let grad_div = Vector2::new(
                    hessians[0][(0, 0)] + hessians[1][(0, 1)],
                    hessians[0][(1, 0)] + hessians[1][(1, 1)],
                );
                Vector2::new(hessians[0].trace(), hessians[1].trace()) * mu + grad_div * (mu + lambda)
            }
        }
    }

    /// Energy density `flux(∇u) : ∇u` for unit coefficient.
    pub fn energy_density(&self, grad: &Matrix2<f64>) -> f64 {
        self.flux(grad).component_mul(grad).sum()
    }

    pub fn initial_mesh(&self) -> TriangleMesh {
        create_domain_mesh(self.domain, self.initial_mesh_n)
    }

    /// Per boundary segment, whether it carries a Dirichlet condition.
    pub fn dirichlet_segments(&self) -> Vec<bool> {
        (0..self.domain.num_segments())
            .map(|segment| self.is_dirichlet_segment(segment))
            .collect()
    }

    /// The finite element space on `mesh` matching this problem's degree, solution dimension and
    /// boundary conditions.
    pub fn space_on(&self, mesh: TriangleMesh) -> FiniteElementSpace {
        FiniteElementSpace::new(mesh, self.degree(), self.solution_dim(), self.dirichlet_segments())
    }

    pub fn initial_space(&self) -> FiniteElementSpace {
        self.space_on(self.initial_mesh())
    }
}
