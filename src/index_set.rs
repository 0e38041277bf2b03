//! The active multi-index set Λ together with its arena of spatial discretizations.
use crate::error::{Result, SgfemError};
use crate::multiindex::MultiIndex;
use crate::space::FiniteElementSpace;
use log::debug;
use nalgebra::DVector;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Identifier of a discretization in the mesh arena.
pub type MeshId = usize;

/// How multi-indices share spatial meshes (`refine_projection_mesh`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeshSharing {
    /// One mesh for all multi-indices.
    Global,
    /// Every multi-index owns its mesh from admission on.
    Independent,
    /// A multi-index shares its ancestor's mesh until it has taken part in the given number of
    /// refinement rounds, then it is detached by copy.
    DivergeAfter(u32),
}

impl MeshSharing {
    pub fn from_refine_projection_mesh(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Global),
            2 => Ok(Self::Independent),
            k if k > 0 => u32::try_from(k).map(Self::DivergeAfter).map_err(|_| {
                SgfemError::invalid(format!("refine_projection_mesh {} is out of range", k))
            }),
            k => Err(SgfemError::invalid(format!(
                "refine_projection_mesh must be non-negative, got {}",
                k
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    mesh: MeshId,
    solution: Option<DVector<f64>>,
    refinement_rounds: u32,
}

/// Summary of one refinement round.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefinementSummary {
    pub refined_meshes: usize,
    pub detached: Vec<MultiIndex>,
}

/// Downward closed set of multi-indices, each with a spatial discretization and possibly a
/// current solution.
///
/// Discretizations live in an arena keyed by [`MeshId`]. Several multi-indices may refer to the same
/// arena entry; spaces are immutable and replaced as a whole on refinement, so aliasing never
/// exposes mutable state across multi-indices.
#[derive(Debug, Clone)]
pub struct MultiIndexSet {
    entries: BTreeMap<MultiIndex, IndexEntry>,
    meshes: BTreeMap<MeshId, Arc<FiniteElementSpace>>,
    next_mesh_id: MeshId,
    sharing: MeshSharing,
    max_modes: usize,
}

fn push_indices_up_to(order: u32, modes: usize, prefix: &mut Vec<u32>, out: &mut Vec<MultiIndex>) {
    if prefix.len() == modes {
        out.push(MultiIndex::from_orders(prefix.clone()));
        return;
    }
    let used: u32 = prefix.iter().sum();
    for k in 0..=(order - used) {
        prefix.push(k);
        push_indices_up_to(order, modes, prefix, out);
        prefix.pop();
    }
}

impl MultiIndexSet {
    /// Λ = { μ : |μ| <= `initial_lambda`, μ_m = 0 for m >= `initial_modes` }.
    pub fn initialize(
        initial_lambda: u32,
        initial_modes: usize,
        max_modes: usize,
        base: FiniteElementSpace,
        sharing: MeshSharing,
    ) -> Self {
        let mut indices = Vec::new();
        push_indices_up_to(initial_lambda, initial_modes.min(max_modes), &mut Vec::new(), &mut indices);

        let mut set = Self {
            entries: BTreeMap::new(),
            meshes: BTreeMap::new(),
            next_mesh_id: 0,
            sharing,
            max_modes,
        };
        let base = Arc::new(base);
        let shared = set.insert_mesh(base.clone());
        for (i, index) in indices.into_iter().enumerate() {
            let mesh = match sharing {
                MeshSharing::Independent if i > 0 => set.insert_mesh(base.clone()),
                _ => shared,
            };
            set.entries.insert(
                index,
                IndexEntry {
                    mesh,
                    solution: None,
                    refinement_rounds: 0,
                },
            );
        }
        set
    }

    fn insert_mesh(&mut self, space: Arc<FiniteElementSpace>) -> MeshId {
        let id = self.next_mesh_id;
        self.next_mesh_id += 1;
        self.meshes.insert(id, space);
        id
    }

    pub fn sharing(&self) -> MeshSharing {
        self.sharing
    }

    pub fn max_modes(&self) -> usize {
        self.max_modes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, index: &MultiIndex) -> bool {
        self.entries.contains_key(index)
    }

    /// Active multi-indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = &MultiIndex> {
        self.entries.keys()
    }

    pub fn mesh_id(&self, index: &MultiIndex) -> Option<MeshId> {
        self.entries.get(index).map(|entry| entry.mesh)
    }

    pub fn space(&self, index: &MultiIndex) -> Option<&Arc<FiniteElementSpace>> {
        self.entries
            .get(index)
            .and_then(|entry| self.meshes.get(&entry.mesh))
    }

    pub fn mesh_space(&self, mesh: MeshId) -> Option<&Arc<FiniteElementSpace>> {
        self.meshes.get(&mesh)
    }

    /// All discretizations currently referenced by some multi-index.
    pub fn meshes(&self) -> impl Iterator<Item = (MeshId, &Arc<FiniteElementSpace>)> {
        self.meshes.iter().map(|(id, space)| (*id, space))
    }

    /// Multi-indices using the given mesh.
    pub fn users_of(&self, mesh: MeshId) -> impl Iterator<Item = &MultiIndex> {
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.mesh == mesh)
            .map(|(index, _)| index)
    }

    pub fn solution(&self, index: &MultiIndex) -> Option<&DVector<f64>> {
        self.entries.get(index).and_then(|entry| entry.solution.as_ref())
    }

    pub fn set_solution(&mut self, index: &MultiIndex, solution: DVector<f64>) -> Result<()> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| SgfemError::InadmissibleIndex(index.clone()))?;
        entry.solution = Some(solution);
        Ok(())
    }

    /// Whether `a` and `b` are discretized on the very same space.
    pub fn shares_space(&self, a: &MultiIndex, b: &MultiIndex) -> bool {
        match (self.space(a), self.space(b)) {
            (Some(sa), Some(sb)) => Arc::ptr_eq(sa, sb),
            _ => false,
        }
    }

    /// One past the largest mode used by any active multi-index.
    pub fn num_active_modes(&self) -> usize {
        self.entries
            .keys()
            .map(MultiIndex::support_len)
            .max()
            .unwrap_or(0)
    }

    /// Modes in which successors are searched: every active mode plus the next inactive one,
    /// bounded by the length of the coefficient expansion.
    pub fn candidate_modes(&self) -> std::ops::Range<usize> {
        0..(self.num_active_modes() + 1).min(self.max_modes)
    }

    pub fn total_dofs(&self) -> usize {
        self.entries
            .keys()
            .filter_map(|index| self.space(index))
            .map(|space| space.num_dofs())
            .sum()
    }

    pub fn total_cells(&self) -> usize {
        self.entries
            .keys()
            .filter_map(|index| self.space(index))
            .map(|space| space.num_cells())
            .sum()
    }

    /// `ν ∉ Λ` and every `ν - e_k` is in Λ.
    pub fn is_admissible(&self, candidate: &MultiIndex) -> bool {
        if self.contains(candidate) {
            return false;
        }
        if candidate.is_zero() {
            return self.is_empty();
        }
        candidate
            .predecessors()
            .all(|predecessor| self.contains(&predecessor))
    }

    /// The admissible successors `μ + e_m` of `μ`.
    ///
    /// The sequence is computed lazily from the current state on every call.
    pub fn candidate_successors<'a>(&'a self, index: &'a MultiIndex) -> impl Iterator<Item = MultiIndex> + 'a {
        self.candidate_modes()
            .map(move |m| index.increment(m))
            .filter(move |successor| self.is_admissible(successor))
    }

    /// Admissible successors of all of Λ, without duplicates.
    pub fn all_candidate_successors(&self) -> BTreeSet<MultiIndex> {
        self.entries
            .keys()
            .flat_map(|index| self.candidate_successors(index))
            .collect()
    }

    pub fn is_downward_closed(&self) -> bool {
        self.entries.keys().all(|index| {
            index
                .predecessors()
                .all(|predecessor| self.contains(&predecessor))
        })
    }

    /// Adds `ν` to Λ and returns the mesh it is discretized on.
    ///
    /// The mesh is taken from the predecessor with the coarsest discretization, shared or copied
    /// according to the [`MeshSharing`] mode.
    pub fn admit(&mut self, candidate: MultiIndex) -> Result<MeshId> {
        if !self.is_admissible(&candidate) || candidate.support_len() > self.max_modes {
            return Err(SgfemError::InadmissibleIndex(candidate));
        }
        let parent_mesh = candidate
            .predecessors()
            .filter_map(|predecessor| self.mesh_id(&predecessor))
            .min_by_key(|mesh| self.meshes.get(mesh).map_or(usize::MAX, |space| space.num_cells()))
            .ok_or_else(|| SgfemError::InadmissibleIndex(candidate.clone()))?;

        let mesh = match self.sharing {
            MeshSharing::Independent => {
                let space = self.meshes[&parent_mesh].clone();
                self.insert_mesh(space)
            }
            MeshSharing::Global | MeshSharing::DivergeAfter(_) => parent_mesh,
        };
        debug!("Admitting multi-index {} on mesh {}", candidate, mesh);
        self.entries.insert(
            candidate,
            IndexEntry {
                mesh,
                solution: None,
                refinement_rounds: 0,
            },
        );
        Ok(mesh)
    }

    /// The solution of `index` interpolated onto `target`.
    pub fn project(&self, index: &MultiIndex, target: &FiniteElementSpace) -> Result<DVector<f64>> {
        let space = self
            .space(index)
            .ok_or_else(|| SgfemError::EstimationDegenerate(index.clone()))?;
        let solution = self
            .solution(index)
            .ok_or_else(|| SgfemError::EstimationDegenerate(index.clone()))?;
        if std::ptr::eq(space.as_ref(), target) {
            Ok(solution.clone())
        } else {
            Ok(target.interpolate_from(space, solution))
        }
    }

    /// Refines meshes in the given cells and transfers the stored solutions to the refined
    /// spaces.
    ///
    /// Marks are given per multi-index but apply to the mesh it currently uses, so marks from
    /// multi-indices sharing a mesh are merged. Under [`MeshSharing::DivergeAfter`], a marked
    /// multi-index that has reached its round budget is first detached onto a private copy.
    pub fn refine(&mut self, marks: &BTreeMap<MultiIndex, BTreeSet<usize>>) -> RefinementSummary {
        let mut summary = RefinementSummary::default();

        if let MeshSharing::DivergeAfter(rounds) = self.sharing {
            let to_detach: Vec<MultiIndex> = marks
                .iter()
                .filter(|(_, cells)| !cells.is_empty())
                .filter_map(|(index, _)| self.entries.get(index).map(|entry| (index, entry)))
                .filter(|(_, entry)| entry.refinement_rounds >= rounds)
                .filter(|(_, entry)| self.entries.values().filter(|e| e.mesh == entry.mesh).count() > 1)
                .map(|(index, _)| index.clone())
                .collect();
            for index in to_detach {
                let shared = self.entries[&index].mesh;
                let space = self.meshes[&shared].clone();
                let private = self.insert_mesh(space);
                if let Some(entry) = self.entries.get_mut(&index) {
                    entry.mesh = private;
                }
                debug!("Detached multi-index {} from mesh {} onto mesh {}", index, shared, private);
                summary.detached.push(index);
            }
        }

        let mut cells_by_mesh: BTreeMap<MeshId, BTreeSet<usize>> = BTreeMap::new();
        for (index, cells) in marks {
            if let Some(entry) = self.entries.get(index) {
                cells_by_mesh
                    .entry(entry.mesh)
                    .or_default()
                    .extend(cells.iter().copied());
            }
        }
        cells_by_mesh.retain(|_, cells| !cells.is_empty());

        let refined: FxHashMap<MeshId, (Arc<FiniteElementSpace>, Arc<FiniteElementSpace>)> = cells_by_mesh
            .par_iter()
            .map(|(mesh, cells)| {
                let old = self.meshes[mesh].clone();
                let cells: Vec<usize> = cells.iter().copied().collect();
                let new = Arc::new(old.refined(&cells));
                (*mesh, (old, new))
            })
            .collect();

        self.entries.par_iter_mut().for_each(|(_, entry)| {
            if let Some((old, new)) = refined.get(&entry.mesh) {
                entry.refinement_rounds += 1;
                if let Some(solution) = entry.solution.as_ref() {
                    entry.solution = Some(new.interpolate_from(old, solution));
                }
            }
        });
        summary.refined_meshes = refined.len();
        for (mesh, (_, new)) in refined {
            self.meshes.insert(mesh, new);
        }

        let referenced: BTreeSet<MeshId> = self.entries.values().map(|entry| entry.mesh).collect();
        self.meshes.retain(|id, _| referenced.contains(id));
        summary
    }
}
