//! Initial meshes for the supported domains.
use crate::mesh::{Edge, TriangleMesh};
use crate::problem::Domain;
use nalgebra::Point2;
use rustc_hash::FxHashMap;

/// Creates a structured triangle mesh of the domain with `cells_per_dim` cells along each side of
/// its bounding box.
///
/// Each grid cell is split along its diagonal, which becomes the refinement edge of both halves.
/// For the L-shape, `cells_per_dim` is rounded up to an even number so that the re-entrant
/// corner is a grid vertex.
pub fn create_domain_mesh(domain: Domain, cells_per_dim: usize) -> TriangleMesh {
    let n = match domain {
        Domain::LShape => cells_per_dim + cells_per_dim % 2,
        _ => cells_per_dim.max(1),
    };
    let corners = domain.corners();
    let map = |i: usize, j: usize| -> Point2<f64> {
        let xi = i as f64 / n as f64;
        let eta = j as f64 / n as f64;
        match domain {
            Domain::Square => Point2::new(xi, eta),
            Domain::LShape => Point2::new(2.0 * xi - 1.0, 2.0 * eta - 1.0),
            Domain::Cooks => {
                let [p0, p1, p2, p3] = [corners[0], corners[1], corners[2], corners[3]];
                let x = p0.coords * ((1.0 - xi) * (1.0 - eta))
                    + p1.coords * (xi * (1.0 - eta))
                    + p2.coords * (xi * eta)
                    + p3.coords * ((1.0 - xi) * eta);
                Point2::from(x)
            }
        }
    };
    let keep_cell = |i: usize, j: usize| match domain {
        // Remove the quadrant (0, 1] x [-1, 0)
        Domain::LShape => !(2 * i >= n && 2 * j < n),
        _ => true,
    };

    let grid_index = |i: usize, j: usize| j * (n + 1) + i;
    let mut compact: FxHashMap<usize, usize> = FxHashMap::default();
    let mut vertices = Vec::new();
    let mut vertex = |i: usize, j: usize, vertices: &mut Vec<Point2<f64>>| -> usize {
        *compact.entry(grid_index(i, j)).or_insert_with(|| {
            vertices.push(map(i, j));
            vertices.len() - 1
        })
    };

    let mut triangles = Vec::new();
    for j in 0..n {
        for i in 0..n {
            if !keep_cell(i, j) {
                continue;
            }
            let a = vertex(i, j, &mut vertices);
            let b = vertex(i + 1, j, &mut vertices);
            let c = vertex(i + 1, j + 1, &mut vertices);
            let d = vertex(i, j + 1, &mut vertices);
            triangles.push([c, a, b]);
            triangles.push([a, c, d]);
        }
    }

    let mut edge_count: FxHashMap<Edge, usize> = FxHashMap::default();
    for triangle in &triangles {
        for k in 0..3 {
            *edge_count
                .entry(Edge::new(triangle[k], triangle[(k + 1) % 3]))
                .or_insert(0) += 1;
        }
    }
    let boundary = edge_count
        .into_iter()
        .filter(|(_, count)| *count == 1)
        .filter_map(|(edge, _)| {
            let [a, b] = edge.vertices();
            domain
                .segment_containing(&vertices[a], &vertices[b])
                .map(|segment| (edge, segment))
        })
        .collect();

    TriangleMesh::from_parts(vertices, triangles, boundary)
}
