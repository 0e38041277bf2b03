//! Conforming triangle meshes with newest-vertex labelling.
use nalgebra::Point2;
use rustc_hash::FxHashMap;

pub mod procedural;
pub mod refinement;

/// An undirected edge, stored with sorted vertex indices.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge(usize, usize);

impl Edge {
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn vertices(&self) -> [usize; 2] {
        [self.0, self.1]
    }
}

/// Index-based triangle mesh without hanging nodes.
///
/// Every triangle `[v0, v1, v2]` carries its bisection labelling: `v0`-`v1` is the refinement
/// edge and `v2` is the newest vertex. Local edge `k` of a triangle joins `v_k` and `v_{k+1}`,
/// so local edge 0 is always the refinement edge.
#[derive(Debug, Clone)]
pub struct TriangleMesh {
    vertices: Vec<Point2<f64>>,
    triangles: Vec<[usize; 3]>,
    boundary: FxHashMap<Edge, usize>,
}

/// One edge of the mesh and the cells sharing it.
#[derive(Debug, Clone)]
pub struct EdgeInfo {
    pub edge: Edge,
    /// `(cell, local edge)` for each adjacent cell.
    pub first: (usize, usize),
    pub second: Option<(usize, usize)>,
    pub boundary_segment: Option<usize>,
}

/// Edge connectivity derived from a mesh.
#[derive(Debug, Clone)]
pub struct EdgeTopology {
    pub edges: Vec<EdgeInfo>,
    /// Global edge index of each local edge of each cell.
    pub cell_edges: Vec<[usize; 3]>,
}

impl TriangleMesh {
    /// Construct a mesh from vertices, labelled triangles and boundary edges tagged with their
    /// domain boundary segment.
    pub fn from_parts(
        vertices: Vec<Point2<f64>>,
        triangles: Vec<[usize; 3]>,
        boundary: FxHashMap<Edge, usize>,
    ) -> Self {
        Self {
            vertices,
            triangles,
            boundary,
        }
    }

    pub fn vertices(&self) -> &[Point2<f64>] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_cells(&self) -> usize {
        self.triangles.len()
    }

    pub fn boundary_segment(&self, edge: &Edge) -> Option<usize> {
        self.boundary.get(edge).copied()
    }

    pub fn boundary_edges(&self) -> impl Iterator<Item = (Edge, usize)> + '_ {
        self.boundary.iter().map(|(edge, segment)| (*edge, *segment))
    }

    pub(crate) fn boundary_map(&self) -> &FxHashMap<Edge, usize> {
        &self.boundary
    }

    pub fn cell_points(&self, cell: usize) -> [Point2<f64>; 3] {
        let [a, b, c] = self.triangles[cell];
        [self.vertices[a], self.vertices[b], self.vertices[c]]
    }

    pub fn cell_area(&self, cell: usize) -> f64 {
        let [a, b, c] = self.cell_points(cell);
        0.5 * (b - a).perp(&(c - a)).abs()
    }

    /// Length of the longest edge of the cell.
    pub fn cell_diameter(&self, cell: usize) -> f64 {
        let [a, b, c] = self.cell_points(cell);
        (b - a).norm().max((c - b).norm()).max((a - c).norm())
    }

    pub fn max_diameter(&self) -> f64 {
        (0..self.num_cells())
            .map(|cell| self.cell_diameter(cell))
            .fold(0.0, f64::max)
    }

    pub fn refinement_edge(&self, cell: usize) -> Edge {
        let [a, b, _] = self.triangles[cell];
        Edge::new(a, b)
    }

    pub fn edge_topology(&self) -> EdgeTopology {
        let mut index_of: FxHashMap<Edge, usize> = FxHashMap::default();
        let mut edges: Vec<EdgeInfo> = Vec::new();
        let mut cell_edges = Vec::with_capacity(self.triangles.len());
        for (cell, triangle) in self.triangles.iter().enumerate() {
            let mut local_edges = [0; 3];
            for k in 0..3 {
                let edge = Edge::new(triangle[k], triangle[(k + 1) % 3]);
                let idx = *index_of.entry(edge).or_insert_with(|| {
                    edges.push(EdgeInfo {
                        edge,
                        first: (cell, k),
                        second: None,
                        boundary_segment: self.boundary.get(&edge).copied(),
                    });
                    edges.len() - 1
                });
                if edges[idx].first.0 != cell {
                    edges[idx].second = Some((cell, k));
                }
                local_edges[k] = idx;
            }
            cell_edges.push(local_edges);
        }
        EdgeTopology { edges, cell_edges }
    }
}
