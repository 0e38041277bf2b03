//! Selection of cells and multi-indices to refine.
use crate::error::{Result, SgfemError};
use crate::estimate::ErrorEstimate;
use crate::index_set::MultiIndexSet;
use crate::multiindex::MultiIndex;
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// How residual and mesh-projection indicators are combined into spatial marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarkingStrategy {
    /// Separate residual Dörfler marking; cells whose projection indicator exceeds the
    /// reference scale are marked additionally.
    SeparateWithCellProjection,
    /// Separate residual Dörfler marking; every multi-index whose projection error exceeds the
    /// reference scale gets its own Dörfler marking of projection indicators.
    SeparateWithMeshProjection,
    /// Residual and projection indicators pooled into a single Dörfler marking.
    Relative,
}

impl FromStr for MarkingStrategy {
    type Err = SgfemError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "SEPARATE WITH CELLPROJECTION" => Ok(Self::SeparateWithCellProjection),
            "SEPARATE WITH MESHPROJECTION" => Ok(Self::SeparateWithMeshProjection),
            "RELATIVE" => Ok(Self::Relative),
            other if other.starts_with("RELATIVE WITH ") => Ok(Self::Relative),
            _ => Err(SgfemError::invalid(format!("unknown marking strategy \"{}\"", s))),
        }
    }
}

impl fmt::Display for MarkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SeparateWithCellProjection => write!(f, "SEPARATE with CELLPROJECTION"),
            Self::SeparateWithMeshProjection => write!(f, "SEPARATE with MESHPROJECTION"),
            Self::Relative => write!(f, "RELATIVE"),
        }
    }
}

/// Thresholds, caps and active channels of the marking step.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkingSettings {
    pub strategy: MarkingStrategy,
    pub theta_eta: f64,
    pub theta_zeta: f64,
    pub theta_delta: f64,
    pub min_zeta: f64,
    /// Cells with diameter at most `maxh` are not refined. Zero disables the floor.
    pub maxh: f64,
    pub max_lambda_frac: f64,
    pub newmi_add_maxm: usize,
    pub c_q: f64,
    pub refine_residual: bool,
    pub refine_projection: bool,
    pub refine_lambda: bool,
    pub uniform: bool,
}

impl Default for MarkingSettings {
    fn default() -> Self {
        Self {
            strategy: MarkingStrategy::SeparateWithCellProjection,
            theta_eta: 0.4,
            theta_zeta: 0.1,
            theta_delta: 10.0,
            min_zeta: 1e-8,
            maxh: 0.0,
            max_lambda_frac: 0.1,
            newmi_add_maxm: 20,
            c_q: 1.0,
            refine_residual: true,
            refine_projection: true,
            refine_lambda: true,
            uniform: false,
        }
    }
}

/// Result of one marking step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Marking {
    /// Marked cells per multi-index, in the numbering of that multi-index's current mesh.
    pub cells: BTreeMap<MultiIndex, BTreeSet<usize>>,
    pub residual_marked: usize,
    pub projection_marked: usize,
    /// Successors to admit, in decreasing order of their indicator.
    pub admitted: Vec<MultiIndex>,
}

impl Marking {
    pub fn num_marked_cells(&self) -> usize {
        self.cells.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_marked_cells() == 0 && self.admitted.is_empty()
    }

    fn insert(&mut self, index: &MultiIndex, cell: usize) -> bool {
        self.cells.entry(index.clone()).or_default().insert(cell)
    }
}

/// Dörfler (bulk chasing) marking: the indices of the minimal set of largest values whose sum
/// reaches `theta` times the total.
///
/// `values` are expected to be squared indicators. The result is ordered by decreasing value.
pub fn dorfler_mark(values: &[f64], theta: f64) -> Vec<usize> {
    let total: f64 = values.iter().sum();
    let target = theta * total;
    if !(target > 0.0) {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(values[i])));

    let mut sum = 0.0;
    let mut count = 0;
    for &i in &order {
        sum += values[i];
        count += 1;
        if sum >= target {
            break;
        }
    }
    order.truncate(count);
    order
}

/// Maximum number of multi-indices admitted in one iteration.
pub fn stochastic_cap(newmi_add_maxm: usize, max_lambda_frac: f64, lambda_len: usize) -> usize {
    let by_fraction = (max_lambda_frac * lambda_len as f64).ceil().max(0.0) as usize;
    newmi_add_maxm.min(by_fraction)
}

fn root_mean_square(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v * v, count + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

/// Applies [`MarkingSettings`] to an [`ErrorEstimate`].
#[derive(Debug, Clone)]
pub struct Marker {
    settings: MarkingSettings,
}

impl Marker {
    pub fn new(settings: MarkingSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MarkingSettings {
        &self.settings
    }

    pub fn mark(&self, set: &MultiIndexSet, estimate: &ErrorEstimate) -> Marking {
        if self.settings.uniform {
            return self.mark_uniform(set);
        }

        let mut marking = Marking::default();
        let pairs: Vec<(&MultiIndex, usize)> = estimate
            .elements
            .iter()
            .flat_map(|(index, indicators)| (0..indicators.eta.len()).map(move |cell| (index, cell)))
            .collect();
        let eta = |i: usize| estimate.elements[pairs[i].0].eta[pairs[i].1];
        let delta = |i: usize| estimate.elements[pairs[i].0].delta[pairs[i].1];

        match self.settings.strategy {
            MarkingStrategy::Relative => {
                let pooled: Vec<f64> = (0..pairs.len())
                    .map(|i| {
                        let residual = if self.settings.refine_residual { eta(i).powi(2) } else { 0.0 };
                        let projection = if self.settings.refine_projection {
                            (self.settings.c_q * delta(i)).powi(2)
                        } else {
                            0.0
                        };
                        residual + projection
                    })
                    .collect();
                for i in dorfler_mark(&pooled, self.settings.theta_eta) {
                    let (index, cell) = pairs[i];
                    if self.above_size_floor(set, index, cell) && marking.insert(index, cell) {
                        if eta(i) >= self.settings.c_q * delta(i) {
                            marking.residual_marked += 1;
                        } else {
                            marking.projection_marked += 1;
                        }
                    }
                }
            }
            strategy => {
                if self.settings.refine_residual {
                    let squared: Vec<f64> = (0..pairs.len()).map(|i| eta(i).powi(2)).collect();
                    for i in dorfler_mark(&squared, self.settings.theta_eta) {
                        let (index, cell) = pairs[i];
                        if self.above_size_floor(set, index, cell) && marking.insert(index, cell) {
                            marking.residual_marked += 1;
                        }
                    }
                }
                if self.settings.refine_projection {
                    let reference = match root_mean_square((0..pairs.len()).map(eta)) {
                        r if r > 0.0 => r,
                        _ => root_mean_square((0..pairs.len()).map(delta)),
                    };
                    let threshold = self.settings.theta_delta * reference;
                    for (index, indicators) in &estimate.elements {
                        let cells: Vec<usize> = match strategy {
                            MarkingStrategy::SeparateWithMeshProjection => {
                                if root_mean_square(indicators.delta.iter().copied()) > threshold {
                                    let squared: Vec<f64> = indicators.delta.iter().map(|d| d * d).collect();
                                    dorfler_mark(&squared, self.settings.theta_eta)
                                } else {
                                    Vec::new()
                                }
                            }
                            _ => (0..indicators.delta.len())
                                .filter(|&cell| {
                                    let d = indicators.delta[cell];
                                    d > 0.0 && d >= threshold
                                })
                                .collect(),
                        };
                        for cell in cells {
                            if self.above_size_floor(set, index, cell) && marking.insert(index, cell) {
                                marking.projection_marked += 1;
                            }
                        }
                    }
                }
            }
        }

        if self.settings.refine_lambda {
            marking.admitted = self.select_successors(set, estimate);
        }
        marking
    }

    fn mark_uniform(&self, set: &MultiIndexSet) -> Marking {
        let mut marking = Marking::default();
        for index in set.indices() {
            if let Some(space) = set.space(index) {
                marking
                    .cells
                    .insert(index.clone(), (0..space.num_cells()).collect());
                marking.residual_marked += space.num_cells();
            }
        }
        if self.settings.refine_lambda {
            marking.admitted = set.all_candidate_successors().into_iter().collect();
        }
        marking
    }

    /// Cells at or below `maxh` in diameter are never marked.
    fn above_size_floor(&self, set: &MultiIndexSet, index: &MultiIndex, cell: usize) -> bool {
        if !(self.settings.maxh > 0.0) {
            return true;
        }
        set.space(index)
            .map_or(true, |space| space.mesh().cell_diameter(cell) > self.settings.maxh)
    }

    fn select_successors(&self, set: &MultiIndexSet, estimate: &ErrorEstimate) -> Vec<MultiIndex> {
        let cap = stochastic_cap(self.settings.newmi_add_maxm, self.settings.max_lambda_frac, set.len());
        let threshold = self.settings.theta_zeta * estimate.max_zeta();
        estimate
            .successors
            .iter()
            .filter(|s| s.value >= self.settings.min_zeta && s.value > 0.0 && s.value >= threshold)
            .filter(|s| set.is_admissible(&s.successor) && s.successor.support_len() <= set.max_modes())
            .take(cap)
            .map(|s| s.successor.clone())
            .collect()
    }
}
