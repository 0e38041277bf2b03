//! Sampling-based cross-check of the adaptive stochastic Galerkin result.
use crate::assembly::{Assembler, CoefficientSelector, GalerkinAssembler};
use crate::error::{Result, SgfemError};
use crate::index_set::MultiIndexSet;
use crate::multiindex::MultiIndex;
use crate::polynomials::tensor_legendre;
use crate::problem::ProblemDefinition;
use crate::space::FiniteElementSpace;
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use sgfem_sparse::cg::LinearOperator;
use sgfem_sparse::preconditioner::factor_csr;

/// Uniform refinement is stopped after this many bisection rounds even if `max_h` is not met.
const MAX_REFERENCE_REFINEMENTS: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct MonteCarloSettings {
    pub runs: usize,
    pub samples: usize,
    pub max_h: f64,
    pub seed: u64,
    /// Compare every adaptive iterate against the samples, not only the final one.
    pub compare_iterates: bool,
}

impl Default for MonteCarloSettings {
    fn default() -> Self {
        Self {
            runs: 0,
            samples: 1,
            max_h: 0.1,
            seed: 0,
            compare_iterates: false,
        }
    }
}

impl MonteCarloSettings {
    pub fn validate(&self) -> Result<()> {
        if self.runs > 0 && self.samples == 0 {
            return Err(SgfemError::invalid("MC.N must be at least one"));
        }
        if !(self.max_h > 0.0) {
            return Err(SgfemError::invalid(format!("MC.max_h must be positive, got {}", self.max_h)));
        }
        Ok(())
    }
}

/// Sample errors of one parametric solution, averaged over the samples of a run.
#[derive(Debug, Clone, Serialize)]
pub struct IterateErrors {
    /// Position of the compared solution in the list handed to the validator.
    pub iterate: usize,
    pub total_dofs: usize,
    pub lambda_size: usize,
    /// Mean L² error of `Σ_μ w_μ L_μ(y)`.
    pub l2_error: f64,
    /// Mean energy error of `Σ_μ w_μ L_μ(y)`.
    pub energy_error: f64,
    /// Mean L² error of the mean field `w_0` alone.
    pub mean_field_l2_error: f64,
    /// Mean energy error of the mean field `w_0` alone.
    pub mean_field_energy_error: f64,
}

/// Aggregate statistics of one independent run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub run: usize,
    pub samples: usize,
    pub energy_mean: f64,
    /// Unbiased sample variance; zero for a single sample.
    pub energy_variance: f64,
    #[serde(skip)]
    pub mean_solution: DVector<f64>,
    /// Errors of the last compared solution, if any.
    pub mean_l2_error: Option<f64>,
    pub mean_energy_error: Option<f64>,
    /// One entry per compared solution, in the order given.
    pub iterates: Vec<IterateErrors>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonteCarloReport {
    pub reference_dofs: usize,
    pub reference_cells: usize,
    pub reference_max_diameter: f64,
    pub runs: Vec<RunStatistics>,
}

/// Errors of one sample against one parametric solution: full expansion, then mean field.
#[derive(Debug, Clone, Copy, Default)]
struct SampleErrors {
    l2: f64,
    energy: f64,
    mean_field_l2: f64,
    mean_field_energy: f64,
}

struct SampleOutcome {
    energy: f64,
    solution: DVector<f64>,
    errors: Vec<SampleErrors>,
}

/// Coefficients of a parametric solution interpolated onto the reference space.
struct ProjectedSolution {
    total_dofs: usize,
    lambda_size: usize,
    blocks: Vec<(MultiIndex, DVector<f64>)>,
}

/// Solves the deterministic problem for sampled coefficients on a uniformly refined reference
/// mesh.
pub struct MonteCarloValidator<'a, A: Assembler = GalerkinAssembler<'a>> {
    problem: &'a ProblemDefinition,
    settings: MonteCarloSettings,
    assembler: A,
}

impl<'a> MonteCarloValidator<'a> {
    pub fn new(problem: &'a ProblemDefinition, settings: MonteCarloSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            problem,
            settings,
            assembler: GalerkinAssembler::new(problem),
        })
    }
}

fn sample_seed(seed: u64, run: usize, sample: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ ((run as u64) << 32 | sample as u64)
}

impl<'a, A: Assembler> MonteCarloValidator<'a, A> {
    pub fn with_assembler<B: Assembler>(self, assembler: B) -> MonteCarloValidator<'a, B> {
        MonteCarloValidator {
            problem: self.problem,
            settings: self.settings,
            assembler,
        }
    }

    pub fn settings(&self) -> &MonteCarloSettings {
        &self.settings
    }

    /// The initial mesh, uniformly bisected until every cell diameter is at most `max_h`.
    pub fn reference_space(&self) -> FiniteElementSpace {
        let mut space = self.problem.initial_space();
        let mut rounds = 0;
        while space.mesh().max_diameter() > self.settings.max_h && rounds < MAX_REFERENCE_REFINEMENTS {
            space = space.uniformly_refined();
            rounds += 1;
        }
        space
    }

    /// Runs all experiments. When `adaptive` is given, its parametric solution is compared
    /// against every sample solution.
    pub fn run(&self, adaptive: Option<&MultiIndexSet>) -> Result<MonteCarloReport> {
        let sets: Vec<&MultiIndexSet> = adaptive.into_iter().collect();
        self.run_history(&sets)
    }

    /// Runs all experiments and compares every given parametric solution (typically the
    /// snapshots of consecutive adaptive iterations) against the same samples.
    pub fn run_history(&self, sets: &[&MultiIndexSet]) -> Result<MonteCarloReport> {
        let reference = self.reference_space();
        info!(
            "Monte Carlo: {} run(s) of {} sample(s) on {} cells ({} dofs), {} solution(s) compared",
            self.settings.runs,
            self.settings.samples,
            reference.num_cells(),
            reference.num_dofs(),
            sets.len()
        );

        let num_modes = sets
            .iter()
            .map(|set| set.num_active_modes())
            .max()
            .unwrap_or_else(|| self.problem.initial_modes())
            .max(1)
            .min(self.problem.coefficient().num_modes().max(1));

        let projected = sets
            .iter()
            .map(|set| {
                let blocks = set
                    .indices()
                    .map(|index| Ok((index.clone(), set.project(index, &reference)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ProjectedSolution {
                    total_dofs: set.total_dofs(),
                    lambda_size: set.len(),
                    blocks,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let runs = (0..self.settings.runs)
            .into_par_iter()
            .map(|run| {
                let outcomes = (0..self.settings.samples)
                    .into_par_iter()
                    .map(|sample| {
                        let mut rng = StdRng::seed_from_u64(sample_seed(self.settings.seed, run, sample));
                        let y: Vec<f64> = (0..num_modes).map(|_| rng.gen_range(-1.0..=1.0)).collect();
                        self.solve_sample(&reference, &y, &projected)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::aggregate(run, &reference, &projected, outcomes))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(MonteCarloReport {
            reference_dofs: reference.num_dofs(),
            reference_cells: reference.num_cells(),
            reference_max_diameter: reference.mesh().max_diameter(),
            runs,
        })
    }

    fn solve_sample(&self, space: &FiniteElementSpace, y: &[f64], projected: &[ProjectedSolution]) -> Result<SampleOutcome> {
        let failure = |source: eyre::Report| SgfemError::AssemblyFailure {
            index: Default::default(),
            source,
        };
        let stiffness = self
            .assembler
            .assemble_stiffness(space, CoefficientSelector::Realization(y))
            .map_err(failure)?;
        let load = self.assembler.assemble_load(space).map_err(failure)?;
        let factor = factor_csr(&stiffness)
            .map_err(|err| failure(eyre::eyre!("sample stiffness matrix is not positive definite: {}", err)))?;
        let rhs = DMatrix::from_column_slice(load.len(), 1, load.as_slice());
        let solution: DVector<f64> = factor.solve(&rhs).column(0).into_owned();
        let energy = load.dot(&solution).max(0.0).sqrt();

        let norms = |error: &DVector<f64>| -> Result<(f64, f64)> {
            let energy = energy_norm(&stiffness, error).map_err(|err| failure(eyre::eyre!("{}", err)))?;
            Ok((space.l2_norm(error), energy))
        };
        let errors = projected
            .iter()
            .map(|solution_h| {
                let mut error = solution.clone();
                let mut mean_field_error = solution.clone();
                for (index, w) in &solution_h.blocks {
                    error.axpy(-tensor_legendre(index, y), w, 1.0);
                    if index.is_zero() {
                        mean_field_error -= w;
                    }
                }
                let (l2, energy) = norms(&error)?;
                let (mean_field_l2, mean_field_energy) = norms(&mean_field_error)?;
                Ok(SampleErrors {
                    l2,
                    energy,
                    mean_field_l2,
                    mean_field_energy,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Sample y = {:?}: energy norm {:.6e}", y, energy);
        Ok(SampleOutcome {
            energy,
            solution,
            errors,
        })
    }

    fn aggregate(
        run: usize,
        space: &FiniteElementSpace,
        projected: &[ProjectedSolution],
        outcomes: Vec<SampleOutcome>,
    ) -> RunStatistics {
        let n = outcomes.len();
        let weight = 1.0 / n.max(1) as f64;
        let energy_mean = outcomes.iter().map(|o| o.energy).sum::<f64>() * weight;
        let energy_variance = if n > 1 {
            outcomes
                .iter()
                .map(|o| (o.energy - energy_mean).powi(2))
                .sum::<f64>()
                / (n - 1) as f64
        } else {
            0.0
        };
        let mut mean_solution = DVector::zeros(space.num_dofs());
        for outcome in &outcomes {
            mean_solution.axpy(weight, &outcome.solution, 1.0);
        }

        let iterates: Vec<IterateErrors> = projected
            .iter()
            .enumerate()
            .map(|(i, solution_h)| {
                let mean = |select: fn(&SampleErrors) -> f64| {
                    outcomes.iter().map(|o| select(&o.errors[i])).sum::<f64>() * weight
                };
                IterateErrors {
                    iterate: i,
                    total_dofs: solution_h.total_dofs,
                    lambda_size: solution_h.lambda_size,
                    l2_error: mean(|e| e.l2),
                    energy_error: mean(|e| e.energy),
                    mean_field_l2_error: mean(|e| e.mean_field_l2),
                    mean_field_energy_error: mean(|e| e.mean_field_energy),
                }
            })
            .collect();

        RunStatistics {
            run,
            samples: n,
            energy_mean,
            energy_variance,
            mean_solution,
            mean_l2_error: iterates.last().map(|e| e.l2_error),
            mean_energy_error: iterates.last().map(|e| e.energy_error),
            iterates,
        }
    }
}

fn energy_norm(stiffness: &CsrMatrix<f64>, v: &DVector<f64>) -> std::result::Result<f64, sgfem_sparse::cg::OperatorError> {
    let mut product = DVector::zeros(v.len());
    stiffness.apply((&mut product).into(), v.into())?;
    Ok(v.dot(&product).max(0.0).sqrt())
}
