use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sgfem::assembly::GalerkinAssembler;
use sgfem::index_set::{MeshSharing, MultiIndexSet};
use sgfem::multiindex::MultiIndex;
use sgfem::operator::{assemble_systems, solve_coupled, StochasticOperator};
use sgfem::polynomials::legendre_beta;
use sgfem::problem::{Domain, ProblemDefinition, ProblemParameters};
use sgfem_sparse::cg::LinearOperator;
use sgfem_sparse::preconditioner::factor_csr;
use std::collections::{BTreeMap, BTreeSet};

fn problem() -> ProblemDefinition {
    ProblemDefinition::new(ProblemParameters {
        domain: Domain::LShape,
        initial_mesh_n: 4,
        initial_modes: 2,
        max_modes: 10,
        ..ProblemParameters::default()
    })
    .unwrap()
}

fn random_vector(rng: &mut StdRng, len: usize) -> DVector<f64> {
    DVector::from_fn(len, |_, _| rng.gen_range(-1.0..1.0))
}

fn apply(operator: &StochasticOperator, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(x.len());
    operator.apply((&mut y).into(), x.into()).unwrap();
    y
}

/// Λ = {|μ| <= 2} in two modes, with the mean and e₁ on their own, locally refined meshes.
fn mixed_mesh_set(problem: &ProblemDefinition) -> MultiIndexSet {
    let mut set = MultiIndexSet::initialize(2, 2, 10, problem.initial_space(), MeshSharing::Independent);
    let zero = MultiIndex::zero();
    let e1 = MultiIndex::unit(1);
    let mut marks = BTreeMap::new();
    marks.insert(zero.clone(), (0..set.space(&zero).unwrap().num_cells()).step_by(2).collect::<BTreeSet<_>>());
    marks.insert(e1, [0, 1, 2, 3].into_iter().collect::<BTreeSet<_>>());
    set.refine(&marks);
    set
}

#[test]
fn operator_is_symmetric_positive_definite() {
    let problem = problem();
    let assembler = GalerkinAssembler::new(&problem);
    let mut rng = StdRng::seed_from_u64(42);
    let shared = MultiIndexSet::initialize(2, 2, 10, problem.initial_space(), MeshSharing::Global);
    for set in [shared, mixed_mesh_set(&problem)] {
        let systems = assemble_systems(&assembler, &set, set.num_active_modes()).unwrap();
        let operator = StochasticOperator::new(&set, &systems).unwrap();
        assert_eq!(operator.dim(), set.total_dofs());
        for _ in 0..3 {
            let x = random_vector(&mut rng, operator.dim());
            let y = random_vector(&mut rng, operator.dim());
            let ax = apply(&operator, &x);
            let ay = apply(&operator, &y);
            let (xay, yax) = (x.dot(&ay), y.dot(&ax));
            assert!((xay - yax).abs() <= 1e-10 * xay.abs().max(yax.abs()));
            assert!(x.dot(&ax) > 0.0);
        }
    }
}

#[test]
fn mean_only_operator_is_the_mean_stiffness() {
    let problem = problem();
    let assembler = GalerkinAssembler::new(&problem);
    let set = MultiIndexSet::initialize(0, 2, 10, problem.initial_space(), MeshSharing::Global);
    let systems = assemble_systems(&assembler, &set, set.num_active_modes()).unwrap();
    let operator = StochasticOperator::new(&set, &systems).unwrap();
    let system = systems.values().next().unwrap();

    let x = random_vector(&mut StdRng::seed_from_u64(3), operator.dim());
    let expected = &system.mean * &x;
    assert_matrix_eq!(apply(&operator, &x), expected, comp = abs, tol = 1e-12);

    // A single block is solved in one preconditioned step
    let mut w = DVector::zeros(operator.dim());
    let report = solve_coupled(&operator, &mut w, 1e-10, 10).unwrap();
    assert!(report.converged);
    assert!(report.iterations <= 1);

    let factor = factor_csr(&system.mean).unwrap();
    let rhs = DMatrix::from_column_slice(system.load.len(), 1, system.load.as_slice());
    let direct: DVector<f64> = factor.solve(&rhs).column(0).into_owned();
    assert_matrix_eq!(w, direct, comp = abs, tol = 1e-8 * direct.amax().max(1.0));
}

#[test]
fn neighbouring_blocks_are_coupled_by_legendre_weights() {
    let problem = problem();
    let assembler = GalerkinAssembler::new(&problem);
    let set = MultiIndexSet::initialize(1, 1, 10, problem.initial_space(), MeshSharing::Global);
    let systems = assemble_systems(&assembler, &set, 1).unwrap();
    let operator = StochasticOperator::new(&set, &systems).unwrap();
    let system = systems.values().next().unwrap();

    let layout = operator.layout();
    assert_eq!(layout.indices, vec![MultiIndex::zero(), MultiIndex::unit(0)]);
    let n = layout.lengths[0];

    let mut rng = StdRng::seed_from_u64(7);
    let x0 = random_vector(&mut rng, n);
    let x1 = random_vector(&mut rng, n);
    let mut x = DVector::zeros(2 * n);
    x.rows_mut(0, n).copy_from(&x0);
    x.rows_mut(n, n).copy_from(&x1);

    let y = apply(&operator, &x);
    let beta = legendre_beta(1);
    let expected0 = &system.mean * &x0 + (&system.modes[0] * &x1) * beta;
    let expected1 = &system.mean * &x1 + (&system.modes[0] * &x0) * beta;
    assert_matrix_eq!(y.rows(0, n).into_owned(), expected0, comp = abs, tol = 1e-10);
    assert_matrix_eq!(y.rows(n, n).into_owned(), expected1, comp = abs, tol = 1e-10);
}

#[test]
fn load_enters_the_mean_block_only() {
    let problem = problem();
    let assembler = GalerkinAssembler::new(&problem);
    let set = mixed_mesh_set(&problem);
    let systems = assemble_systems(&assembler, &set, set.num_active_modes()).unwrap();
    let operator = StochasticOperator::new(&set, &systems).unwrap();
    let rhs = operator.rhs();
    let layout = operator.layout();
    for (i, index) in layout.indices.iter().enumerate() {
        let block = layout.block(&rhs, i);
        if index.is_zero() {
            assert!(block.norm() > 0.0);
        } else {
            assert_eq!(block.norm(), 0.0);
        }
    }

    // Blocks split back onto their own meshes
    let parts = operator.split(&rhs);
    assert_eq!(parts.len(), set.len());
    for (index, part) in parts {
        assert_eq!(part.len(), set.space(&index).unwrap().num_dofs());
    }
}

#[test]
fn coupled_solve_converges_on_mixed_meshes() {
    let problem = problem();
    let assembler = GalerkinAssembler::new(&problem);
    let set = mixed_mesh_set(&problem);
    let systems = assemble_systems(&assembler, &set, set.num_active_modes()).unwrap();
    let operator = StochasticOperator::new(&set, &systems).unwrap();
    let mut w = operator.initial_guess(&set);
    assert_eq!(w.norm(), 0.0);
    let report = solve_coupled(&operator, &mut w, 1e-8, 200).unwrap();
    assert!(report.converged, "{:?}", report);
    assert!(report.relative_residual <= 1e-8);

    let residual = operator.rhs() - apply(&operator, &w);
    assert!(residual.norm() <= 1e-6 * operator.rhs().norm());
}
