use matrixcompare::assert_matrix_eq;
use nalgebra::{DVector, Point2};
use sgfem::mesh::procedural::create_domain_mesh;
use sgfem::problem::Domain;
use sgfem::space::FiniteElementSpace;

fn interpolate(space: &FiniteElementSpace, f: impl Fn(&Point2<f64>) -> f64) -> DVector<f64> {
    DVector::from_iterator(
        space.num_nodes(),
        (0..space.num_nodes()).map(|node| f(space.node_position(node))),
    )
}

/// A scalar space without Dirichlet boundary.
fn free_space(domain: Domain, n: usize, degree: usize) -> FiniteElementSpace {
    FiniteElementSpace::new(create_domain_mesh(domain, n), degree, 1, Vec::new())
}

fn sample_points() -> Vec<Point2<f64>> {
    vec![
        Point2::new(0.1, 0.2),
        Point2::new(0.77, 0.31),
        Point2::new(0.5, 0.5),
        Point2::new(0.93, 0.05),
        Point2::new(0.0, 1.0),
    ]
}

#[test]
fn node_and_dof_counts() {
    let mesh = create_domain_mesh(Domain::Square, 3);
    let p1 = FiniteElementSpace::new(mesh.clone(), 1, 1, Vec::new());
    assert_eq!(p1.num_nodes(), 16);
    assert_eq!(p1.nodes_per_cell(), 3);

    let p2 = FiniteElementSpace::new(mesh.clone(), 2, 2, Vec::new());
    // 16 vertices and 33 edges
    assert_eq!(p2.num_nodes(), 16 + 33);
    assert_eq!(p2.num_dofs(), 2 * 49);
    assert_eq!(p2.nodes_per_cell(), 6);
}

#[test]
fn dirichlet_nodes_follow_boundary_segments() {
    let problem = crate::poisson_on(Domain::Square, 4);
    let space = problem.initial_space();
    let dirichlet = (0..space.num_nodes())
        .filter(|&node| space.is_dirichlet_node(node))
        .count();
    assert_eq!(dirichlet, 16);
    for node in 0..space.num_nodes() {
        let p = space.node_position(node);
        let on_boundary = p.x.abs() < 1e-12 || p.y.abs() < 1e-12 || (p.x - 1.0).abs() < 1e-12 || (p.y - 1.0).abs() < 1e-12;
        assert_eq!(space.is_dirichlet_node(node), on_boundary);
    }

    // Only the left side is clamped for boundary_type 3
    let mesh = create_domain_mesh(Domain::Square, 4);
    let space = FiniteElementSpace::new(mesh, 2, 1, vec![false, false, false, true]);
    for node in 0..space.num_nodes() {
        let p = space.node_position(node);
        assert_eq!(space.is_dirichlet_node(node), p.x.abs() < 1e-12);
    }
}

#[test]
fn p1_reproduces_linear_functions() {
    let f = |p: &Point2<f64>| 1.0 + 2.0 * p.x - 0.5 * p.y;
    let space = free_space(Domain::Square, 3, 1);
    let u = interpolate(&space, f);
    for x in sample_points() {
        let value = space.evaluate_at(&u, &x).unwrap();
        assert!((value.x - f(&x)).abs() < 1e-12);
        let gradient = space.gradient_at(&u, &x).unwrap();
        assert!((gradient[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((gradient[(0, 1)] + 0.5).abs() < 1e-12);
    }
}

#[test]
fn p2_reproduces_quadratic_functions() {
    let f = |p: &Point2<f64>| p.x * p.x - 3.0 * p.x * p.y + p.y + 0.25;
    let space = free_space(Domain::Square, 2, 2);
    let u = interpolate(&space, f);
    for x in sample_points() {
        let value = space.evaluate_at(&u, &x).unwrap();
        assert!((value.x - f(&x)).abs() < 1e-12, "at {:?}: {} vs {}", x, value.x, f(&x));
        let gradient = space.gradient_at(&u, &x).unwrap();
        assert!((gradient[(0, 0)] - (2.0 * x.x - 3.0 * x.y)).abs() < 1e-11);
        assert!((gradient[(0, 1)] - (-3.0 * x.x + 1.0)).abs() < 1e-11);
    }
}

#[test]
fn located_points_map_back_to_themselves() {
    let space = free_space(Domain::LShape, 4, 1);
    for x in [Point2::new(-0.5, -0.5), Point2::new(0.3, 0.8), Point2::new(-0.99, 0.99), Point2::new(0.0, 0.0)] {
        let (cell, lambda) = space.locate(&x).unwrap();
        assert!(lambda.iter().all(|&l| l >= -1e-12));
        let geometry = space.cell_geometry(cell).unwrap();
        assert!((geometry.map(&lambda) - x).norm() < 1e-12);
    }
}

#[test]
fn prolongation_to_refined_space_is_exact_for_linear_functions() {
    let f = |p: &Point2<f64>| 3.0 * p.x + p.y;
    let coarse = free_space(Domain::LShape, 2, 1);
    let fine = coarse.refined(&[0, 2, 3]).uniformly_refined();
    let u = interpolate(&coarse, f);

    let prolongated = fine.interpolate_from(&coarse, &u);
    let expected = interpolate(&fine, f);
    assert_matrix_eq!(prolongated, expected, comp = abs, tol = 1e-12);

    let matrix = fine.interpolation_matrix(&coarse);
    assert_eq!(matrix.nrows(), fine.num_dofs());
    assert_eq!(matrix.ncols(), coarse.num_dofs());
    let via_matrix = &matrix * &u;
    assert_matrix_eq!(via_matrix, expected, comp = abs, tol = 1e-12);
}

#[test]
fn interpolation_zeroes_dirichlet_dofs() {
    let problem = crate::poisson_on(Domain::Square, 2);
    let coarse = problem.initial_space();
    let fine = coarse.uniformly_refined();
    let u = DVector::repeat(coarse.num_dofs(), 1.0);
    let v = fine.interpolate_from(&coarse, &u);
    for dof in 0..fine.num_dofs() {
        let expected = if fine.is_dirichlet_dof(dof) { 0.0 } else { 1.0 };
        assert!((v[dof] - expected).abs() < 1e-12);
    }
}

#[test]
fn l2_norm_of_simple_functions() {
    let space = free_space(Domain::Square, 4, 1);
    let one = DVector::repeat(space.num_dofs(), 1.0);
    assert!((space.l2_norm(&one) - 1.0).abs() < 1e-12);

    // ‖x‖² = 1/3 on the unit square, reproduced exactly by P1
    let x = interpolate(&space, |p| p.x);
    assert!((space.l2_norm(&x) - (1.0 / 3.0_f64).sqrt()).abs() < 1e-12);

    let lshape = free_space(Domain::LShape, 2, 2);
    let one = DVector::repeat(lshape.num_dofs(), 1.0);
    assert!((lshape.l2_norm(&one) - 3.0_f64.sqrt()).abs() < 1e-12);
}
