use proptest::prelude::*;
use sgfem::estimate::{ElementIndicators, ErrorEstimate, SuccessorIndicator};
use sgfem::index_set::{MeshSharing, MultiIndexSet};
use sgfem::marking::{dorfler_mark, stochastic_cap, Marker, MarkingSettings, MarkingStrategy};
use sgfem::multiindex::MultiIndex;
use sgfem::problem::Domain;
use std::collections::{BTreeMap, BTreeSet};

/// Λ = {0, e₀} on a shared 8-cell mesh of the unit square.
fn small_set() -> MultiIndexSet {
    let space = crate::poisson_on(Domain::Square, 2).initial_space();
    MultiIndexSet::initialize(1, 1, 2, space, MeshSharing::Global)
}

fn successor(orders: &[u32], value: f64) -> SuccessorIndicator {
    SuccessorIndicator {
        successor: MultiIndex::from_orders(orders.to_vec()),
        value,
        contributions: vec![(MultiIndex::zero(), value)],
    }
}

/// One dominant residual cell on the zero index, a flat residual on e₀, no projection error,
/// and two successors of very different weight.
fn small_estimate() -> ErrorEstimate {
    let mut elements = BTreeMap::new();
    let mut eta = vec![0.0; 8];
    eta[0] = 1.0;
    elements.insert(
        MultiIndex::zero(),
        ElementIndicators {
            eta,
            delta: vec![0.0; 8],
        },
    );
    elements.insert(
        MultiIndex::unit(0),
        ElementIndicators {
            eta: vec![0.1; 8],
            delta: vec![0.0; 8],
        },
    );
    ErrorEstimate {
        elements,
        successors: vec![successor(&[2], 0.5), successor(&[0, 1], 0.01)],
        eta_total: 1.0,
        zeta_total: 0.5,
        delta_total: 0.0,
        pcg_total: 0.0,
        global: 1.5,
    }
}

fn marked(marking: &sgfem::marking::Marking, orders: &[u32]) -> BTreeSet<usize> {
    marking
        .cells
        .get(&MultiIndex::from_orders(orders.to_vec()))
        .cloned()
        .unwrap_or_default()
}

#[test]
fn dorfler_marks_the_minimal_set_of_largest_values() {
    assert_eq!(dorfler_mark(&[1.0, 4.0, 2.0, 3.0], 0.5), vec![1, 3]);
    assert_eq!(dorfler_mark(&[1.0, 4.0, 2.0, 3.0], 0.4), vec![1]);
    assert_eq!(dorfler_mark(&[1.0, 4.0, 2.0, 3.0], 1.0), vec![1, 3, 2, 0]);
    assert!(dorfler_mark(&[0.0, 0.0], 0.5).is_empty());
    assert!(dorfler_mark(&[], 0.5).is_empty());
}

#[test]
fn stochastic_cap_takes_the_smaller_bound() {
    assert_eq!(stochastic_cap(20, 0.1, 5), 1);
    assert_eq!(stochastic_cap(2, 1.0, 10), 2);
    assert_eq!(stochastic_cap(20, 0.25, 10), 3);
    assert_eq!(stochastic_cap(20, 0.0, 10), 0);
}

#[test]
fn marking_strategies_parse_case_insensitively() {
    assert_eq!(
        "SEPARATE with CELLPROJECTION".parse::<MarkingStrategy>().unwrap(),
        MarkingStrategy::SeparateWithCellProjection
    );
    assert_eq!(
        "separate with meshprojection".parse::<MarkingStrategy>().unwrap(),
        MarkingStrategy::SeparateWithMeshProjection
    );
    assert_eq!("RELATIVE".parse::<MarkingStrategy>().unwrap(), MarkingStrategy::Relative);
    assert_eq!(
        "RELATIVE with CELLPROJECTION".parse::<MarkingStrategy>().unwrap(),
        MarkingStrategy::Relative
    );
    assert!("SEPARATE".parse::<MarkingStrategy>().is_err());
    let strategy = MarkingStrategy::SeparateWithMeshProjection;
    assert_eq!(strategy.to_string().parse::<MarkingStrategy>().unwrap(), strategy);
}

#[test]
fn separate_marking_refines_dominant_cells_and_best_successor() {
    let set = small_set();
    let marking = Marker::new(MarkingSettings::default()).mark(&set, &small_estimate());
    assert_eq!(marked(&marking, &[]), [0].into_iter().collect());
    assert!(marked(&marking, &[1]).is_empty());
    assert_eq!(marking.residual_marked, 1);
    assert_eq!(marking.projection_marked, 0);
    // cap = min(20, ceil(0.1 * 2)) = 1, and [0, 1] is below θζ max ζ anyway
    assert_eq!(marking.admitted, vec![MultiIndex::from_orders(vec![2])]);
}

#[test]
fn successors_below_thresholds_are_not_admitted() {
    let set = small_set();
    let settings = MarkingSettings {
        max_lambda_frac: 1.0,
        theta_zeta: 0.01,
        min_zeta: 0.1,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &small_estimate());
    assert_eq!(marking.admitted, vec![MultiIndex::from_orders(vec![2])]);

    let settings = MarkingSettings {
        max_lambda_frac: 1.0,
        theta_zeta: 0.01,
        min_zeta: 0.0,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &small_estimate());
    assert_eq!(marking.admitted.len(), 2);

    let settings = MarkingSettings {
        refine_lambda: false,
        ..MarkingSettings::default()
    };
    assert!(Marker::new(settings).mark(&set, &small_estimate()).admitted.is_empty());
}

#[test]
fn cell_projection_marks_cells_with_large_projection_error() {
    let set = small_set();
    let mut estimate = small_estimate();
    if let Some(indicators) = estimate.elements.get_mut(&MultiIndex::unit(0)) {
        indicators.delta[3] = 100.0;
    }
    let marking = Marker::new(MarkingSettings::default()).mark(&set, &estimate);
    assert_eq!(marked(&marking, &[1]), [3].into_iter().collect());
    assert_eq!(marking.projection_marked, 1);

    let settings = MarkingSettings {
        refine_projection: false,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &estimate);
    assert!(marked(&marking, &[1]).is_empty());
    assert_eq!(marking.projection_marked, 0);
}

#[test]
fn mesh_projection_runs_dorfler_on_offending_indices() {
    let set = small_set();
    let mut estimate = small_estimate();
    if let Some(indicators) = estimate.elements.get_mut(&MultiIndex::unit(0)) {
        indicators.delta = vec![10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 100.0];
    }
    let settings = MarkingSettings {
        strategy: MarkingStrategy::SeparateWithMeshProjection,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &estimate);
    // 100² alone exceeds 40 % of the squared total
    assert_eq!(marked(&marking, &[1]), [7].into_iter().collect());
    assert_eq!(marking.projection_marked, 1);
}

#[test]
fn relative_marking_pools_residual_and_projection() {
    let set = small_set();
    let mut estimate = small_estimate();
    if let Some(indicators) = estimate.elements.get_mut(&MultiIndex::unit(0)) {
        indicators.delta[5] = 2.0;
    }
    let settings = MarkingSettings {
        strategy: MarkingStrategy::Relative,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &estimate);
    // Pooled: 2² + 0.1² for (e₀, 5) dominates the total 4.01 + 1 + 7 * 0.01
    assert_eq!(marked(&marking, &[1]), [5].into_iter().collect());
    assert!(marked(&marking, &[]).is_empty());
    assert_eq!(marking.projection_marked, 1);
    assert_eq!(marking.residual_marked, 0);
}

#[test]
fn size_floor_removes_small_cells() {
    let set = small_set();
    let settings = MarkingSettings {
        maxh: 1.0,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &small_estimate());
    assert_eq!(marking.num_marked_cells(), 0);
    assert_eq!(marking.residual_marked, 0);
    assert_eq!(marking.projection_marked, 0);
    assert!(!marking.is_empty());

    // Cells of the 2 x 2 square have diameter √2 / 2 and survive a smaller floor
    let settings = MarkingSettings {
        maxh: 0.5,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &small_estimate());
    assert_eq!(marking.num_marked_cells(), 1);
    assert_eq!(marking.residual_marked, 1);
}

#[test]
fn marked_counts_agree_with_marked_cells_under_size_floor() {
    let set = small_set();
    let mut estimate = small_estimate();
    if let Some(indicators) = estimate.elements.get_mut(&MultiIndex::unit(0)) {
        indicators.delta[3] = 100.0;
    }
    for strategy in [
        MarkingStrategy::SeparateWithCellProjection,
        MarkingStrategy::SeparateWithMeshProjection,
        MarkingStrategy::Relative,
    ] {
        for maxh in [0.0, 0.5, 1.0] {
            let settings = MarkingSettings {
                strategy,
                maxh,
                ..MarkingSettings::default()
            };
            let marking = Marker::new(settings).mark(&set, &estimate);
            assert_eq!(
                marking.residual_marked + marking.projection_marked,
                marking.num_marked_cells(),
                "{strategy} with maxh = {maxh}"
            );
        }
    }
}

#[test]
fn uniform_marking_takes_everything() {
    let set = small_set();
    let settings = MarkingSettings {
        uniform: true,
        ..MarkingSettings::default()
    };
    let marking = Marker::new(settings).mark(&set, &small_estimate());
    assert_eq!(marking.num_marked_cells(), 16);
    let admitted: BTreeSet<_> = marking.admitted.into_iter().collect();
    assert_eq!(admitted, set.all_candidate_successors());
    assert_eq!(admitted.len(), 2);
}

proptest! {
    #[test]
    fn dorfler_marking_is_minimal(
        values in prop::collection::vec(0.0f64..10.0, 1..40),
        theta in 0.05f64..=1.0,
    ) {
        let marked = dorfler_mark(&values, theta);
        let total: f64 = values.iter().sum();
        let target = theta * total;
        if target > 0.0 {
            prop_assert!(!marked.is_empty());
            let sums: Vec<f64> = marked
                .iter()
                .scan(0.0, |sum, &i| {
                    *sum += values[i];
                    Some(*sum)
                })
                .collect();
            prop_assert!(sums[sums.len() - 1] >= target * (1.0 - 1e-12));
            if sums.len() > 1 {
                prop_assert!(sums[sums.len() - 2] < target);
            }
            // Marked values dominate unmarked ones
            let chosen: BTreeSet<usize> = marked.iter().copied().collect();
            let smallest_marked = marked.iter().map(|&i| values[i]).fold(f64::INFINITY, f64::min);
            for (i, &v) in values.iter().enumerate() {
                if !chosen.contains(&i) {
                    prop_assert!(v <= smallest_marked);
                }
            }
        } else {
            prop_assert!(marked.is_empty());
        }
    }
}

proptest! {
    #[test]
    fn admitted_successors_respect_the_stochastic_cap(
        first in 0.0f64..1.0,
        second in 0.0f64..1.0,
        newmi_add_maxm in 0usize..5,
        max_lambda_frac in 0.0f64..=1.0,
    ) {
        let set = small_set();
        let mut estimate = small_estimate();
        estimate.successors = vec![successor(&[2], first), successor(&[0, 1], second)];
        let settings = MarkingSettings {
            newmi_add_maxm,
            max_lambda_frac,
            theta_zeta: 0.0,
            min_zeta: 0.0,
            ..MarkingSettings::default()
        };
        let marking = Marker::new(settings).mark(&set, &estimate);
        prop_assert!(marking.admitted.len() <= stochastic_cap(newmi_add_maxm, max_lambda_frac, set.len()));
        for index in &marking.admitted {
            prop_assert!(set.is_admissible(index));
        }
    }
}
