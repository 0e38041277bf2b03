use nalgebra::{DVector, Point2};
use proptest::prelude::*;
use sgfem::index_set::{MeshSharing, MultiIndexSet};
use sgfem::multiindex::MultiIndex;
use sgfem::problem::Domain;
use sgfem::space::FiniteElementSpace;
use sgfem::SgfemError;
use std::collections::{BTreeMap, BTreeSet};

fn mi(orders: &[u32]) -> MultiIndex {
    MultiIndex::from_orders(orders.to_vec())
}

fn base_space() -> FiniteElementSpace {
    crate::poisson_on(Domain::Square, 2).initial_space()
}

fn marks(entries: &[(MultiIndex, Vec<usize>)]) -> BTreeMap<MultiIndex, BTreeSet<usize>> {
    entries
        .iter()
        .map(|(index, cells)| (index.clone(), cells.iter().copied().collect()))
        .collect()
}

#[test]
fn initialization_enumerates_total_degree_sets() {
    let set = MultiIndexSet::initialize(2, 2, 10, base_space(), MeshSharing::Global);
    assert_eq!(set.len(), 6);
    let expected: BTreeSet<_> = [
        mi(&[]),
        mi(&[1]),
        mi(&[0, 1]),
        mi(&[2]),
        mi(&[1, 1]),
        mi(&[0, 2]),
    ]
    .into_iter()
    .collect();
    assert_eq!(set.indices().cloned().collect::<BTreeSet<_>>(), expected);
    assert!(set.is_downward_closed());

    let set = MultiIndexSet::initialize(1, 3, 10, base_space(), MeshSharing::Global);
    assert_eq!(set.len(), 4);
    assert_eq!(set.num_active_modes(), 3);

    // initial_modes is capped by the expansion length
    let set = MultiIndexSet::initialize(1, 5, 2, base_space(), MeshSharing::Global);
    assert_eq!(set.len(), 3);

    let set = MultiIndexSet::initialize(0, 3, 10, base_space(), MeshSharing::Global);
    assert_eq!(set.len(), 1);
    assert!(set.contains(&MultiIndex::zero()));
    assert_eq!(set.num_active_modes(), 0);
}

#[test]
fn candidate_modes_extend_active_modes_by_one() {
    let set = MultiIndexSet::initialize(1, 2, 10, base_space(), MeshSharing::Global);
    assert_eq!(set.candidate_modes(), 0..3);
    let capped = MultiIndexSet::initialize(1, 2, 2, base_space(), MeshSharing::Global);
    assert_eq!(capped.candidate_modes(), 0..2);

    let successors = set.all_candidate_successors();
    let expected: BTreeSet<_> = [mi(&[2]), mi(&[1, 1]), mi(&[0, 2]), mi(&[0, 0, 1])]
        .into_iter()
        .collect();
    assert_eq!(successors, expected);
}

#[test]
fn admissibility() {
    let mut set = MultiIndexSet::initialize(1, 2, 3, base_space(), MeshSharing::Global);
    assert!(set.is_admissible(&mi(&[1, 1])));
    assert!(set.is_admissible(&mi(&[0, 0, 1])));
    assert!(!set.is_admissible(&mi(&[1])));
    assert!(!set.is_admissible(&mi(&[2, 1])));
    assert!(!set.is_admissible(&MultiIndex::zero()));

    match set.admit(mi(&[2, 1])) {
        Err(SgfemError::InadmissibleIndex(index)) => assert_eq!(index, mi(&[2, 1])),
        other => panic!("expected InadmissibleIndex, got {:?}", other),
    }
    assert!(matches!(set.admit(mi(&[1])), Err(SgfemError::InadmissibleIndex(_))));
    // Mode 3 is beyond the expansion length
    set.admit(mi(&[0, 0, 1])).unwrap();
    assert!(matches!(set.admit(mi(&[0, 0, 0, 1])), Err(SgfemError::InadmissibleIndex(_))));

    set.admit(mi(&[1, 1])).unwrap();
    assert!(!set.is_admissible(&mi(&[2, 1])));
    set.admit(mi(&[2])).unwrap();
    set.admit(mi(&[2, 1])).unwrap();
    assert_eq!(set.len(), 7);
    assert!(set.is_downward_closed());
}

#[test]
fn admitted_indices_inherit_meshes_by_sharing_mode() {
    let mut global = MultiIndexSet::initialize(1, 1, 5, base_space(), MeshSharing::Global);
    let mesh = global.admit(mi(&[0, 1])).unwrap();
    assert_eq!(Some(mesh), global.mesh_id(&MultiIndex::zero()));
    assert_eq!(global.meshes().count(), 1);

    let mut independent = MultiIndexSet::initialize(1, 1, 5, base_space(), MeshSharing::Independent);
    assert_ne!(independent.mesh_id(&mi(&[])), independent.mesh_id(&mi(&[1])));
    let mesh = independent.admit(mi(&[2])).unwrap();
    assert_ne!(Some(mesh), independent.mesh_id(&mi(&[1])));
    assert_eq!(independent.meshes().count(), 3);
    assert_eq!(
        independent.space(&mi(&[2])).unwrap().num_cells(),
        independent.space(&mi(&[1])).unwrap().num_cells()
    );

    let mut diverging = MultiIndexSet::initialize(1, 1, 5, base_space(), MeshSharing::DivergeAfter(1));
    let mesh = diverging.admit(mi(&[2])).unwrap();
    assert_eq!(Some(mesh), diverging.mesh_id(&mi(&[1])));
}

#[test]
fn global_refinement_applies_to_every_index() {
    let mut set = MultiIndexSet::initialize(1, 2, 5, base_space(), MeshSharing::Global);
    let before = set.space(&MultiIndex::zero()).unwrap().num_cells();
    let summary = set.refine(&marks(&[(mi(&[1]), vec![0]), (mi(&[0, 1]), vec![3])]));
    assert_eq!(summary.refined_meshes, 1);
    let after = set.space(&MultiIndex::zero()).unwrap().num_cells();
    assert!(after > before);
    for index in set.indices() {
        assert_eq!(set.space(index).unwrap().num_cells(), after);
        assert!(set.shares_space(index, &MultiIndex::zero()));
    }
}

#[test]
fn independent_refinement_only_touches_marked_indices() {
    let mut set = MultiIndexSet::initialize(1, 1, 5, base_space(), MeshSharing::Independent);
    let before = set.space(&MultiIndex::zero()).unwrap().num_cells();
    let summary = set.refine(&marks(&[(mi(&[1]), vec![0, 1, 2])]));
    assert_eq!(summary.refined_meshes, 1);
    assert_eq!(set.space(&MultiIndex::zero()).unwrap().num_cells(), before);
    assert!(set.space(&mi(&[1])).unwrap().num_cells() > before);

    // Empty marks do nothing
    let summary = set.refine(&marks(&[(mi(&[]), vec![])]));
    assert_eq!(summary.refined_meshes, 0);
    assert_eq!(set.space(&MultiIndex::zero()).unwrap().num_cells(), before);
}

#[test]
fn shared_meshes_diverge_after_the_configured_rounds() {
    let mut set = MultiIndexSet::initialize(1, 1, 5, base_space(), MeshSharing::DivergeAfter(1));
    let zero = MultiIndex::zero();
    let e0 = mi(&[1]);
    assert!(set.shares_space(&zero, &e0));

    // First round: still shared, both indices see the refinement
    let summary = set.refine(&marks(&[(zero.clone(), vec![0])]));
    assert!(summary.detached.is_empty());
    assert!(set.shares_space(&zero, &e0));
    let shared_cells = set.space(&zero).unwrap().num_cells();

    // Second round: e0 has used up its shared rounds and is refined on a private copy
    let summary = set.refine(&marks(&[(e0.clone(), vec![0])]));
    assert_eq!(summary.detached, vec![e0.clone()]);
    assert!(!set.shares_space(&zero, &e0));
    assert_ne!(set.mesh_id(&zero), set.mesh_id(&e0));
    assert_eq!(set.space(&zero).unwrap().num_cells(), shared_cells);
    assert!(set.space(&e0).unwrap().num_cells() > shared_cells);
    assert_eq!(set.meshes().count(), 2);
}

#[test]
fn refinement_transfers_solutions() {
    let mut set = MultiIndexSet::initialize(0, 1, 5, base_space(), MeshSharing::Global);
    let zero = MultiIndex::zero();
    let f = |p: &Point2<f64>| p.x * (1.0 - p.x) + p.y * (1.0 - p.y);
    let solution = {
        let space = set.space(&zero).unwrap();
        // Zero on the (Dirichlet) boundary, P1-interpolated elsewhere
        DVector::from_iterator(
            space.num_dofs(),
            (0..space.num_nodes()).map(|node| {
                if space.is_dirichlet_node(node) {
                    0.0
                } else {
                    f(space.node_position(node))
                }
            }),
        )
    };
    set.set_solution(&zero, solution.clone()).unwrap();
    let coarse = set.space(&zero).unwrap().clone();

    set.refine(&marks(&[(zero.clone(), vec![0, 1, 2, 3, 4, 5, 6, 7])]));
    let fine = set.space(&zero).unwrap();
    let transferred = set.solution(&zero).unwrap();
    assert_eq!(transferred.len(), fine.num_dofs());
    let expected = fine.interpolate_from(&coarse, &solution);
    assert!((transferred - expected).norm() < 1e-12);

    assert!(matches!(
        set.set_solution(&mi(&[5]), DVector::zeros(1)),
        Err(SgfemError::InadmissibleIndex(_))
    ));
}

#[test]
fn total_counts_sum_over_indices() {
    let set = MultiIndexSet::initialize(1, 2, 5, base_space(), MeshSharing::Global);
    let space = base_space();
    assert_eq!(set.total_dofs(), 3 * space.num_dofs());
    assert_eq!(set.total_cells(), 3 * space.num_cells());
}

#[test]
fn mesh_sharing_codes() {
    assert_eq!(MeshSharing::from_refine_projection_mesh(0).unwrap(), MeshSharing::Global);
    assert_eq!(MeshSharing::from_refine_projection_mesh(2).unwrap(), MeshSharing::Independent);
    assert_eq!(
        MeshSharing::from_refine_projection_mesh(1).unwrap(),
        MeshSharing::DivergeAfter(1)
    );
    assert_eq!(
        MeshSharing::from_refine_projection_mesh(3).unwrap(),
        MeshSharing::DivergeAfter(3)
    );
    assert!(MeshSharing::from_refine_projection_mesh(-1).is_err());
    assert_eq!(
        MeshSharing::from_refine_projection_mesh(i64::from(u32::MAX)).unwrap(),
        MeshSharing::DivergeAfter(u32::MAX)
    );
    assert!(matches!(
        MeshSharing::from_refine_projection_mesh(1 << 32),
        Err(SgfemError::InvalidConfiguration(_))
    ));
}

#[derive(Debug, Clone)]
enum SetOperation {
    /// Admit the k-th admissible successor, modulo their number.
    AdmitSuccessor(usize),
    /// Mark cells (modulo the mesh size) of the k-th index and refine.
    Refine(usize, Vec<usize>),
    /// Try to admit arbitrary orders.
    TryAdmit(Vec<u32>),
}

fn set_operation() -> impl Strategy<Value = SetOperation> {
    prop_oneof![
        (0usize..16).prop_map(SetOperation::AdmitSuccessor),
        (0usize..16, prop::collection::vec(0usize..64, 1..4))
            .prop_map(|(index, cells)| SetOperation::Refine(index, cells)),
        prop::collection::vec(0u32..3, 0..5).prop_map(SetOperation::TryAdmit),
    ]
}

fn mesh_sharing() -> impl Strategy<Value = MeshSharing> {
    prop_oneof![
        Just(MeshSharing::Global),
        Just(MeshSharing::Independent),
        (1u32..3).prop_map(MeshSharing::DivergeAfter),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn index_set_stays_downward_closed(
        sharing in mesh_sharing(),
        operations in prop::collection::vec(set_operation(), 1..10),
    ) {
        let mut set = MultiIndexSet::initialize(1, 1, 3, base_space(), sharing);
        for operation in operations {
            let len_before = set.len();
            match operation {
                SetOperation::AdmitSuccessor(k) => {
                    let successors: Vec<_> = set.all_candidate_successors().into_iter().collect();
                    if !successors.is_empty() {
                        let successor = successors[k % successors.len()].clone();
                        prop_assert!(set.admit(successor.clone()).is_ok());
                        prop_assert!(set.contains(&successor));
                        prop_assert_eq!(set.len(), len_before + 1);
                    }
                }
                SetOperation::Refine(k, cells) => {
                    let index = set.indices().nth(k % set.len()).cloned().unwrap();
                    let num_cells = set.space(&index).unwrap().num_cells();
                    let marked = cells.into_iter().map(|cell| cell % num_cells).collect::<Vec<_>>();
                    set.refine(&marks(&[(index.clone(), marked)]));
                    prop_assert_eq!(set.len(), len_before);
                    prop_assert!(set.space(&index).unwrap().num_cells() > num_cells);
                }
                SetOperation::TryAdmit(orders) => {
                    let candidate = mi(&orders);
                    let admissible = set.is_admissible(&candidate) && candidate.support_len() <= 3;
                    prop_assert_eq!(set.admit(candidate).is_ok(), admissible);
                }
            }
            prop_assert!(set.is_downward_closed());
            prop_assert!(set.contains(&MultiIndex::zero()));
        }
    }
}
