//! Newest-vertex bisection with conforming closure.
use crate::mesh::{Edge, TriangleMesh};
use rustc_hash::{FxHashMap, FxHashSet};

/// Bisects the marked cells, together with as many neighbours as needed to keep the mesh
/// conforming.
///
/// Each marked cell is split at least once. Cells adjacent to a bisected edge which is not their
/// own refinement edge are split twice, so that no hanging node remains.
pub fn refine_marked(mesh: &TriangleMesh, marked: &[usize]) -> TriangleMesh {
    let mut bisected: FxHashSet<Edge> = marked
        .iter()
        .filter(|&&cell| cell < mesh.num_cells())
        .map(|&cell| mesh.refinement_edge(cell))
        .collect();
    if bisected.is_empty() {
        return mesh.clone();
    }

    // Closure: a cell with any bisected edge must also bisect its refinement edge
    loop {
        let mut changed = false;
        for triangle in mesh.triangles() {
            let [a, b, c] = *triangle;
            let refinement_edge = Edge::new(a, b);
            if !bisected.contains(&refinement_edge)
                && (bisected.contains(&Edge::new(b, c)) || bisected.contains(&Edge::new(c, a)))
            {
                bisected.insert(refinement_edge);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut vertices = mesh.vertices().to_vec();
    let mut midpoints: FxHashMap<Edge, usize> = FxHashMap::default();
    let mut triangles = Vec::with_capacity(mesh.num_cells() + 2 * bisected.len());
    for triangle in mesh.triangles() {
        bisect_recursively(*triangle, &bisected, &mut midpoints, &mut vertices, &mut triangles);
    }

    let mut boundary = FxHashMap::default();
    for (edge, segment) in mesh.boundary_edges() {
        match midpoints.get(&edge) {
            Some(&m) => {
                let [a, b] = edge.vertices();
                boundary.insert(Edge::new(a, m), segment);
                boundary.insert(Edge::new(m, b), segment);
            }
            None => {
                boundary.insert(edge, segment);
            }
        }
    }

    TriangleMesh::from_parts(vertices, triangles, boundary)
}

/// Bisects every cell of the mesh once.
pub fn refine_uniform(mesh: &TriangleMesh) -> TriangleMesh {
    let all: Vec<usize> = (0..mesh.num_cells()).collect();
    refine_marked(mesh, &all)
}

fn bisect_recursively(
    triangle: [usize; 3],
    bisected: &FxHashSet<Edge>,
    midpoints: &mut FxHashMap<Edge, usize>,
    vertices: &mut Vec<nalgebra::Point2<f64>>,
    output: &mut Vec<[usize; 3]>,
) {
    let [v0, v1, v2] = triangle;
    let edge = Edge::new(v0, v1);
    if !bisected.contains(&edge) {
        output.push(triangle);
        return;
    }
    let m = *midpoints.entry(edge).or_insert_with(|| {
        vertices.push(nalgebra::center(&vertices[v0], &vertices[v1]));
        vertices.len() - 1
    });
    // Both children keep the orientation of the parent, with `m` as newest vertex
    bisect_recursively([v2, v0, m], bisected, midpoints, vertices, output);
    bisect_recursively([v1, v2, m], bisected, midpoints, vertices, output);
}
