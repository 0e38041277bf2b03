use sgfem::coefficient::mode_frequencies;
use sgfem::problem::{
    boundary_conditions, Domain, ProblemDefinition, ProblemKind, ProblemParameters, SegmentCondition,
};
use sgfem::SgfemError;
use std::collections::BTreeSet;

fn assert_invalid(parameters: ProblemParameters) {
    match ProblemDefinition::new(parameters) {
        Err(SgfemError::InvalidConfiguration(_)) => {}
        other => panic!("expected InvalidConfiguration, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn invalid_parameters_are_rejected() {
    assert_invalid(ProblemParameters {
        fem_degree: 0,
        ..ProblemParameters::default()
    });
    assert_invalid(ProblemParameters {
        fem_degree: 3,
        ..ProblemParameters::default()
    });
    assert_invalid(ProblemParameters {
        decay_exp: 0.0,
        ..ProblemParameters::default()
    });
    assert_invalid(ProblemParameters {
        decay_exp: -1.5,
        ..ProblemParameters::default()
    });
    assert_invalid(ProblemParameters {
        gamma: 1.0,
        ..ProblemParameters::default()
    });
    assert_invalid(ProblemParameters {
        coeff_type: 17,
        ..ProblemParameters::default()
    });
    assert_invalid(ProblemParameters {
        initial_modes: 5,
        max_modes: 4,
        ..ProblemParameters::default()
    });
    assert_invalid(ProblemParameters {
        kind: ProblemKind::Elasticity { mu: 0.0, lambda: 1.0 },
        ..ProblemParameters::default()
    });
    // boundary_type 4 requires the six segments of the L-shape
    assert_invalid(ProblemParameters {
        boundary_type: 4,
        ..ProblemParameters::default()
    });
}

#[test]
fn valid_parameters_build_a_problem() {
    let problem = ProblemDefinition::new(ProblemParameters {
        domain: Domain::LShape,
        boundary_type: 4,
        fem_degree: 2,
        max_modes: 7,
        ..ProblemParameters::default()
    })
    .unwrap();
    assert_eq!(problem.degree(), 2);
    assert_eq!(problem.max_modes(), 7);
    assert_eq!(problem.solution_dim(), 1);
    assert_eq!(problem.dirichlet_segments(), vec![false, true, true, false, false, false]);

    let elasticity = ProblemDefinition::new(ProblemParameters {
        kind: ProblemKind::Elasticity { mu: 1.0, lambda: 1.5 },
        domain: Domain::Cooks,
        boundary_type: 2,
        ..ProblemParameters::default()
    })
    .unwrap();
    assert_eq!(elasticity.solution_dim(), 2);
    assert_eq!(elasticity.initial_space().num_dofs(), 2 * elasticity.initial_space().num_nodes());
}

#[test]
fn boundary_types_assign_segment_conditions() {
    use SegmentCondition::*;
    assert_eq!(boundary_conditions(0, 4).unwrap(), vec![Dirichlet; 4]);
    assert_eq!(
        boundary_conditions(3, 4).unwrap(),
        vec![
            Neumann { loaded: false },
            Neumann { loaded: true },
            Neumann { loaded: false },
            Dirichlet
        ]
    );
    assert_eq!(
        boundary_conditions(2, 4).unwrap(),
        vec![Dirichlet, Neumann { loaded: true }, Dirichlet, Neumann { loaded: false }]
    );
    assert!(boundary_conditions(9, 4).is_err());
    assert!(boundary_conditions(4, 4).is_err());
}

#[test]
fn domains_parse_case_insensitively() {
    assert_eq!("square".parse::<Domain>().unwrap(), Domain::Square);
    assert_eq!(" LShape ".parse::<Domain>().unwrap(), Domain::LShape);
    assert_eq!("COOKS".parse::<Domain>().unwrap(), Domain::Cooks);
    assert!("hexagon".parse::<Domain>().is_err());
    assert_eq!(Domain::LShape.to_string(), "lshape");
}

#[test]
fn segment_lookup_on_the_lshape() {
    let domain = Domain::LShape;
    let a = nalgebra::Point2::new(0.0, -0.5);
    let b = nalgebra::Point2::new(0.0, -0.25);
    assert_eq!(domain.segment_containing(&a, &b), Some(1));
    let interior = nalgebra::Point2::new(-0.5, -0.5);
    assert_eq!(domain.segment_containing(&interior, &b), None);
}

#[test]
fn mode_frequencies_enumerate_diagonals() {
    assert_eq!(mode_frequencies(0), (0, 0));
    assert_eq!(mode_frequencies(1), (0, 1));
    assert_eq!(mode_frequencies(2), (1, 0));
    assert_eq!(mode_frequencies(3), (0, 2));
    assert_eq!(mode_frequencies(5), (2, 0));

    let pairs: BTreeSet<_> = (0..500).map(mode_frequencies).collect();
    assert_eq!(pairs.len(), 500);
    for m in 0..500u32 {
        let (b1, b2) = mode_frequencies(m);
        let k = b1 + b2;
        assert!(k * (k + 1) / 2 <= m && m < (k + 1) * (k + 2) / 2);
    }
}

#[test]
fn coefficient_amplitudes_decay() {
    let problem = ProblemDefinition::new(ProblemParameters {
        max_modes: 20,
        gamma: 0.8,
        ..ProblemParameters::default()
    })
    .unwrap();
    let coefficient = problem.coefficient();
    assert_eq!(coefficient.num_modes(), 20);
    let amplitudes: Vec<f64> = (0..20).map(|m| coefficient.amplitude(m)).collect();
    assert!(amplitudes.windows(2).all(|w| w[1] < w[0]));
    // The modes sum up to γ ā in sup norm, which keeps the field uniformly positive
    let total: f64 = (0..20).map(|m| coefficient.relative_sup_norm(m)).sum();
    assert!((total - 0.8).abs() < 1e-12);
    assert_eq!(coefficient.amplitude(20), 0.0);

    let x = nalgebra::Point2::new(0.3, 0.7);
    let y = vec![1.0; 20];
    assert!(coefficient.realization(&x, &y) >= coefficient.mean() * (1.0 - 0.8) - 1e-12);
}
