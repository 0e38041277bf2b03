//! Conforming Lagrange finite element spaces on triangle meshes.
use crate::mesh::refinement::{refine_marked, refine_uniform};
use crate::mesh::{EdgeTopology, TriangleMesh};
use crate::quadrature::triangle_quadrature;
use itertools::izip;
use nalgebra::{DVector, Matrix2, Point2, Vector2};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use std::fmt;

/// Maximum number of local nodes (P2).
pub const MAX_NODES_PER_CELL: usize = 6;

type CellEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Affine geometry of a single triangle.
#[derive(Debug, Clone, Copy)]
pub struct CellGeometry {
    pub points: [Point2<f64>; 3],
    pub area: f64,
    /// Constant gradients of the barycentric coordinates.
    pub grad_lambda: [Vector2<f64>; 3],
}

impl CellGeometry {
    pub fn from_points(points: [Point2<f64>; 3]) -> Option<Self> {
        let j = Matrix2::from_columns(&[points[1] - points[0], points[2] - points[0]]);
        let det = j.determinant();
        if !det.is_finite() || det.abs() <= f64::EPSILON * j.norm_squared() {
            return None;
        }
        let inv = j.try_inverse()?;
        let g1 = Vector2::new(inv[(0, 0)], inv[(0, 1)]);
        let g2 = Vector2::new(inv[(1, 0)], inv[(1, 1)]);
        Some(Self {
            points,
            area: 0.5 * det.abs(),
            grad_lambda: [-(g1 + g2), g1, g2],
        })
    }

    pub fn barycentric(&self, x: &Point2<f64>) -> [f64; 3] {
        let d = x - self.points[0];
        let l1 = self.grad_lambda[1].dot(&d);
        let l2 = self.grad_lambda[2].dot(&d);
        [1.0 - l1 - l2, l1, l2]
    }

    pub fn map(&self, lambda: &[f64; 3]) -> Point2<f64> {
        Point2::from(
            self.points[0].coords * lambda[0] + self.points[1].coords * lambda[1] + self.points[2].coords * lambda[2],
        )
    }
}

/// A scalar or two-component Lagrange space of degree 1 or 2.
///
/// Nodes are the mesh vertices followed, for degree 2, by one node per mesh edge. The degree of
/// freedom of component `c` at node `n` is `solution_dim * n + c`. Homogeneous Dirichlet
/// conditions are encoded by flagging the nodes on Dirichlet boundary segments.
#[derive(Clone)]
pub struct FiniteElementSpace {
    mesh: TriangleMesh,
    topology: EdgeTopology,
    degree: usize,
    solution_dim: usize,
    dirichlet_segments: Vec<bool>,
    cell_nodes: Vec<[usize; MAX_NODES_PER_CELL]>,
    node_positions: Vec<Point2<f64>>,
    dirichlet_nodes: Vec<bool>,
    locator: RTree<CellEnvelope>,
}

impl fmt::Debug for FiniteElementSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiniteElementSpace")
            .field("degree", &self.degree)
            .field("solution_dim", &self.solution_dim)
            .field("num_cells", &self.mesh.num_cells())
            .field("num_dofs", &self.num_dofs())
            .finish()
    }
}

impl FiniteElementSpace {
    /// Builds the space on `mesh`. `dirichlet_segments[s]` tells whether boundary segment `s`
    /// carries a homogeneous Dirichlet condition.
    pub fn new(mesh: TriangleMesh, degree: usize, solution_dim: usize, dirichlet_segments: Vec<bool>) -> Self {
        assert!(degree == 1 || degree == 2, "only P1 and P2 spaces are supported");
        assert!(solution_dim == 1 || solution_dim == 2);
        let topology = mesh.edge_topology();
        let num_vertices = mesh.num_vertices();

        let mut node_positions = mesh.vertices().to_vec();
        if degree == 2 {
            for info in &topology.edges {
                let [a, b] = info.edge.vertices();
                node_positions.push(nalgebra::center(&mesh.vertices()[a], &mesh.vertices()[b]));
            }
        }

        let cell_nodes = mesh
            .triangles()
            .iter()
            .zip(&topology.cell_edges)
            .map(|(triangle, edges)| {
                let mut nodes = [0; MAX_NODES_PER_CELL];
                nodes[..3].copy_from_slice(triangle);
                if degree == 2 {
                    for k in 0..3 {
                        nodes[3 + k] = num_vertices + edges[k];
                    }
                }
                nodes
            })
            .collect();

        let is_dirichlet = |segment: usize| dirichlet_segments.get(segment).copied().unwrap_or(false);
        let mut dirichlet_nodes = vec![false; node_positions.len()];
        for (edge_index, info) in topology.edges.iter().enumerate() {
            if let Some(segment) = info.boundary_segment {
                if is_dirichlet(segment) {
                    for v in info.edge.vertices() {
                        dirichlet_nodes[v] = true;
                    }
                    if degree == 2 {
                        dirichlet_nodes[num_vertices + edge_index] = true;
                    }
                }
            }
        }

        let envelopes = (0..mesh.num_cells())
            .map(|cell| {
                let [a, b, c] = mesh.cell_points(cell);
                let min = a.inf(&b).inf(&c);
                let max = a.sup(&b).sup(&c);
                // Inflate to be robust against round-off at cell boundaries
                let pad = 1e-9 * (max - min).norm();
                let rect = Rectangle::from_corners([min.x - pad, min.y - pad], [max.x + pad, max.y + pad]);
                GeomWithData::new(rect, cell)
            })
            .collect();
        let locator = RTree::bulk_load(envelopes);

        Self {
            mesh,
            topology,
            degree,
            solution_dim,
            dirichlet_segments,
            cell_nodes,
            node_positions,
            dirichlet_nodes,
            locator,
        }
    }

    pub fn mesh(&self) -> &TriangleMesh {
        &self.mesh
    }

    pub fn topology(&self) -> &EdgeTopology {
        &self.topology
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn solution_dim(&self) -> usize {
        self.solution_dim
    }

    pub fn num_cells(&self) -> usize {
        self.mesh.num_cells()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_positions.len()
    }

    pub fn num_dofs(&self) -> usize {
        self.solution_dim * self.num_nodes()
    }

    pub fn nodes_per_cell(&self) -> usize {
        if self.degree == 1 {
            3
        } else {
            6
        }
    }

    pub fn cell_nodes(&self, cell: usize) -> &[usize] {
        &self.cell_nodes[cell][..self.nodes_per_cell()]
    }

    pub fn node_position(&self, node: usize) -> &Point2<f64> {
        &self.node_positions[node]
    }

    pub fn is_dirichlet_node(&self, node: usize) -> bool {
        self.dirichlet_nodes[node]
    }

    pub fn is_dirichlet_dof(&self, dof: usize) -> bool {
        self.dirichlet_nodes[dof / self.solution_dim]
    }

    pub fn cell_geometry(&self, cell: usize) -> Option<CellGeometry> {
        CellGeometry::from_points(self.mesh.cell_points(cell))
    }

    /// A space of the same kind on a refined mesh.
    pub fn refined(&self, marked: &[usize]) -> Self {
        Self::new(
            refine_marked(&self.mesh, marked),
            self.degree,
            self.solution_dim,
            self.dirichlet_segments.clone(),
        )
    }

    pub fn uniformly_refined(&self) -> Self {
        Self::new(
            refine_uniform(&self.mesh),
            self.degree,
            self.solution_dim,
            self.dirichlet_segments.clone(),
        )
    }

    /// Values of the local shape functions at barycentric coordinates `lambda`.
    pub fn basis_values(&self, lambda: &[f64; 3], values: &mut [f64; MAX_NODES_PER_CELL]) {
        let [l0, l1, l2] = *lambda;
        if self.degree == 1 {
            values[..3].copy_from_slice(lambda);
        } else {
            values[0] = l0 * (2.0 * l0 - 1.0);
            values[1] = l1 * (2.0 * l1 - 1.0);
            values[2] = l2 * (2.0 * l2 - 1.0);
            values[3] = 4.0 * l0 * l1;
            values[4] = 4.0 * l1 * l2;
            values[5] = 4.0 * l2 * l0;
        }
    }

    /// Physical gradients of the local shape functions.
    pub fn basis_gradients(
        &self,
        geometry: &CellGeometry,
        lambda: &[f64; 3],
        gradients: &mut [Vector2<f64>; MAX_NODES_PER_CELL],
    ) {
        let g = &geometry.grad_lambda;
        if self.degree == 1 {
            gradients[..3].copy_from_slice(g);
        } else {
            for i in 0..3 {
                gradients[i] = g[i] * (4.0 * lambda[i] - 1.0);
                let j = (i + 1) % 3;
                gradients[3 + i] = (g[i] * lambda[j] + g[j] * lambda[i]) * 4.0;
            }
        }
    }

    /// Hessians of the local shape functions (constant per cell).
    pub fn basis_hessians(&self, geometry: &CellGeometry, hessians: &mut [Matrix2<f64>; MAX_NODES_PER_CELL]) {
        if self.degree == 1 {
            hessians.iter_mut().for_each(|h| *h = Matrix2::zeros());
        } else {
            let g = &geometry.grad_lambda;
            for i in 0..3 {
                hessians[i] = g[i] * g[i].transpose() * 4.0;
                let j = (i + 1) % 3;
                hessians[3 + i] = (g[i] * g[j].transpose() + g[j] * g[i].transpose()) * 4.0;
            }
        }
    }

    /// Value of a discrete function at a point inside `cell` (components in order).
    pub fn value_in_cell(&self, cell: usize, lambda: &[f64; 3], coefficients: &DVector<f64>) -> Vector2<f64> {
        let mut phi = [0.0; MAX_NODES_PER_CELL];
        self.basis_values(lambda, &mut phi);
        let mut value = Vector2::zeros();
        for (phi_i, &node) in phi.iter().zip(self.cell_nodes(cell)) {
            for c in 0..self.solution_dim {
                value[c] += phi_i * coefficients[self.solution_dim * node + c];
            }
        }
        value
    }

    /// Gradient of a discrete function; row `c` holds the gradient of component `c`.
    pub fn gradient_in_cell(
        &self,
        cell: usize,
        geometry: &CellGeometry,
        lambda: &[f64; 3],
        coefficients: &DVector<f64>,
    ) -> Matrix2<f64> {
        let mut grad_phi = [Vector2::zeros(); MAX_NODES_PER_CELL];
        self.basis_gradients(geometry, lambda, &mut grad_phi);
        let mut grad = Matrix2::zeros();
        for (grad_i, &node) in grad_phi.iter().zip(self.cell_nodes(cell)) {
            for c in 0..self.solution_dim {
                let u = coefficients[self.solution_dim * node + c];
                grad[(c, 0)] += u * grad_i.x;
                grad[(c, 1)] += u * grad_i.y;
            }
        }
        grad
    }

    /// Hessian of each component of a discrete function on a cell.
    pub fn hessians_in_cell(
        &self,
        cell: usize,
        geometry: &CellGeometry,
        coefficients: &DVector<f64>,
    ) -> [Matrix2<f64>; 2] {
        let mut result = [Matrix2::zeros(); 2];
        if self.degree == 1 {
            return result;
        }
        let mut hessians = [Matrix2::zeros(); MAX_NODES_PER_CELL];
        self.basis_hessians(geometry, &mut hessians);
        for (h, &node) in hessians.iter().zip(self.cell_nodes(cell)) {
            for c in 0..self.solution_dim {
                result[c] += h * coefficients[self.solution_dim * node + c];
            }
        }
        result
    }

    /// Finds a cell containing `x` together with its barycentric coordinates.
    ///
    /// Points slightly outside the mesh are attributed to the closest candidate cell, in which
    /// case some barycentric coordinates are (slightly) negative.
    pub fn locate(&self, x: &Point2<f64>) -> Option<(usize, [f64; 3])> {
        let query = [x.x, x.y];
        let consider = |cell: usize, best: &mut Option<(usize, [f64; 3], f64)>| {
            if let Some(geometry) = self.cell_geometry(cell) {
                let lambda = geometry.barycentric(x);
                let score = lambda.iter().copied().fold(f64::INFINITY, f64::min);
                if best.as_ref().map_or(true, |(_, _, s)| score > *s) {
                    *best = Some((cell, lambda, score));
                }
            }
        };
        let mut best = None;
        for candidate in self.locator.locate_all_at_point(&query) {
            consider(candidate.data, &mut best);
        }
        if best.as_ref().map_or(true, |(_, _, score)| *score < -1e-10) {
            for candidate in self.locator.nearest_neighbor_iter(&query).take(16) {
                consider(candidate.data, &mut best);
            }
        }
        best.map(|(cell, lambda, _)| (cell, lambda))
    }

    /// Evaluates a discrete function at an arbitrary point of the domain.
    pub fn evaluate_at(&self, coefficients: &DVector<f64>, x: &Point2<f64>) -> Option<Vector2<f64>> {
        self.locate(x)
            .map(|(cell, lambda)| self.value_in_cell(cell, &lambda, coefficients))
    }

    /// Evaluates the gradient of a discrete function at an arbitrary point of the domain.
    pub fn gradient_at(&self, coefficients: &DVector<f64>, x: &Point2<f64>) -> Option<Matrix2<f64>> {
        let (cell, lambda) = self.locate(x)?;
        let geometry = self.cell_geometry(cell)?;
        Some(self.gradient_in_cell(cell, &geometry, &lambda, coefficients))
    }

    /// Nodal interpolation of a function from `source` into this space.
    ///
    /// Dirichlet dofs of this space are set to zero.
    pub fn interpolate_from(&self, source: &FiniteElementSpace, coefficients: &DVector<f64>) -> DVector<f64> {
        let dim = self.solution_dim;
        let mut result = DVector::zeros(self.num_dofs());
        for (node, x) in self.node_positions.iter().enumerate() {
            if self.dirichlet_nodes[node] {
                continue;
            }
            if let Some(value) = source.evaluate_at(coefficients, x) {
                for c in 0..dim {
                    result[dim * node + c] = value[c];
                }
            }
        }
        result
    }

    /// Matrix of [`interpolate_from`](Self::interpolate_from), mapping dofs of `source` to dofs
    /// of this space.
    pub fn interpolation_matrix(&self, source: &FiniteElementSpace) -> CsrMatrix<f64> {
        let dim = self.solution_dim;
        let mut coo = CooMatrix::new(self.num_dofs(), source.num_dofs());
        let mut phi = [0.0; MAX_NODES_PER_CELL];
        for (node, x) in self.node_positions.iter().enumerate() {
            if self.dirichlet_nodes[node] {
                continue;
            }
            if let Some((cell, lambda)) = source.locate(x) {
                source.basis_values(&lambda, &mut phi);
                for (phi_j, &source_node) in phi.iter().zip(source.cell_nodes(cell)) {
                    if phi_j.abs() > 1e-14 {
                        for c in 0..dim {
                            coo.push(dim * node + c, dim * source_node + c, *phi_j);
                        }
                    }
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    /// `L²` norm of a discrete function.
    pub fn l2_norm(&self, coefficients: &DVector<f64>) -> f64 {
        let quadrature = triangle_quadrature(2 * self.degree);
        let mut sum = 0.0;
        for cell in 0..self.num_cells() {
            let area = self.mesh.cell_area(cell);
            for (w, lambda) in izip!(&quadrature.weights, &quadrature.points) {
                sum += area * w * self.value_in_cell(cell, lambda, coefficients).norm_squared();
            }
        }
        sum.sqrt()
    }
}
