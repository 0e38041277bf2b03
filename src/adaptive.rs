//! The adaptive loop: assemble, solve, estimate, mark, refine, repeat.
use crate::assembly::{Assembler, GalerkinAssembler};
use crate::diagnostics::{DiagnosticsSink, IndexSummary, IterationDiagnostics, PhaseTimings};
use crate::error::{Result, SgfemError};
use crate::estimate::{ErrorEstimate, ErrorEstimator, EstimatorSettings};
use crate::index_set::{MeshSharing, MultiIndexSet};
use crate::marking::{Marker, MarkingSettings, MarkingStrategy};
use crate::multiindex::MultiIndex;
use crate::operator::{assemble_systems, solve_coupled, PcgReport, StochasticOperator};
use crate::problem::ProblemDefinition;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// What to do when PCG does not reach its tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PcgPolicy {
    /// Record the failure and continue with the last iterate.
    Continue,
    /// Abort the run with [`SgfemError::PcgNonConvergence`].
    Abort,
}

impl FromStr for PcgPolicy {
    type Err = SgfemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            _ => Err(SgfemError::invalid(format!("unknown PCG policy \"{}\"", s))),
        }
    }
}

/// Parameters of the adaptive algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSettings {
    pub initial_lambda: u32,
    pub iterations: usize,
    pub uniform_refinement: bool,
    pub refine_residual: bool,
    pub refine_projection: bool,
    pub refine_lambda: bool,
    pub c_q: f64,
    pub c_eta: f64,
    pub theta_eta: f64,
    pub theta_zeta: f64,
    pub min_zeta: f64,
    pub theta_delta: f64,
    pub maxh: f64,
    pub max_lambda_frac: f64,
    pub newmi_add_maxm: usize,
    pub quadrature_degree: Option<usize>,
    pub projection_degree_increase: usize,
    pub mesh_sharing: MeshSharing,
    pub pcg_eps: f64,
    pub pcg_maxiter: usize,
    pub error_eps: f64,
    pub marking_strategy: MarkingStrategy,
    pub max_dof: Option<usize>,
    pub pcg_policy: PcgPolicy,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            initial_lambda: 1,
            iterations: 5,
            uniform_refinement: false,
            refine_residual: true,
            refine_projection: true,
            refine_lambda: true,
            c_q: 1.0,
            c_eta: 6.0,
            theta_eta: 0.4,
            theta_zeta: 0.1,
            min_zeta: 1e-8,
            theta_delta: 10.0,
            maxh: 0.0,
            max_lambda_frac: 0.1,
            newmi_add_maxm: 20,
            quadrature_degree: None,
            projection_degree_increase: 1,
            mesh_sharing: MeshSharing::DivergeAfter(1),
            pcg_eps: 1e-6,
            pcg_maxiter: 100,
            error_eps: 1e-2,
            marking_strategy: MarkingStrategy::SeparateWithCellProjection,
            max_dof: None,
            pcg_policy: PcgPolicy::Continue,
        }
    }
}

impl AdaptiveSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.refine_residual || self.refine_projection || self.refine_lambda) {
            return Err(SgfemError::NoRefinementStrategy);
        }
        let fraction = |name: &str, value: f64| {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(SgfemError::invalid(format!("{} must lie in (0, 1], got {}", name, value)))
            }
        };
        fraction("theta_eta", self.theta_eta)?;
        fraction("theta_zeta", self.theta_zeta)?;
        let non_negative = [
            ("cQ", self.c_q),
            ("theta_delta", self.theta_delta),
            ("min_zeta", self.min_zeta),
            ("maxh", self.maxh),
            ("max_Lambda_frac", self.max_lambda_frac),
            ("error_eps", self.error_eps),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                return Err(SgfemError::invalid(format!("{} must be non-negative, got {}", name, value)));
            }
        }
        if !(self.c_eta > 0.0) {
            return Err(SgfemError::invalid(format!("ceta must be positive, got {}", self.c_eta)));
        }
        if !(self.pcg_eps > 0.0) || self.pcg_maxiter == 0 {
            return Err(SgfemError::invalid(
                "pcg_eps must be positive and pcg_maxiter at least one",
            ));
        }
        Ok(())
    }

    pub fn estimator_settings(&self) -> EstimatorSettings {
        EstimatorSettings {
            c_q: self.c_q,
            c_eta: self.c_eta,
            min_zeta: self.min_zeta,
            quadrature_degree: self.quadrature_degree,
            projection_degree_increase: self.projection_degree_increase,
            // The residual indicators also provide the reference scale of projection marking
            compute_residual: self.refine_residual || self.refine_projection,
            compute_successors: self.refine_lambda || self.refine_projection,
            compute_projection: self.refine_projection,
        }
    }

    pub fn marking_settings(&self) -> MarkingSettings {
        MarkingSettings {
            strategy: self.marking_strategy,
            theta_eta: self.theta_eta,
            theta_zeta: self.theta_zeta,
            theta_delta: self.theta_delta,
            min_zeta: self.min_zeta,
            maxh: self.maxh,
            max_lambda_frac: self.max_lambda_frac,
            newmi_add_maxm: self.newmi_add_maxm,
            c_q: self.c_q,
            refine_residual: self.refine_residual,
            refine_projection: self.refine_projection,
            refine_lambda: self.refine_lambda,
            uniform: self.uniform_refinement,
        }
    }
}

/// Phases of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Init,
    Assemble,
    Solve,
    Estimate,
    Mark,
    Refine,
    Converged,
    IterationBudgetExhausted,
    DofBudgetExhausted,
}

/// Successful ends of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    Converged,
    IterationBudgetExhausted,
    DofBudgetExhausted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::IterationBudgetExhausted => write!(f, "iteration budget exhausted"),
            Self::DofBudgetExhausted => write!(f, "DOF budget exhausted"),
        }
    }
}

/// Final status of a run, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunStatus {
    Finished(Termination),
    Aborted(String),
}

impl RunStatus {
    pub fn from_result(result: &Result<Termination>) -> Self {
        match result {
            Ok(termination) => Self::Finished(*termination),
            Err(err) => Self::Aborted(err.to_string()),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished(termination) => write!(f, "{}", termination),
            Self::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

/// Everything the loop mutates between iterations.
#[derive(Debug, Clone)]
pub struct AdaptiveState {
    pub iteration: usize,
    pub phase: LoopState,
    pub index_set: MultiIndexSet,
    pub eta_total: f64,
    pub zeta_total: f64,
    pub global_estimate: f64,
    pub converged: bool,
    pub last_estimate: Option<ErrorEstimate>,
    pub last_pcg: Option<PcgReport>,
    /// Λ with its solutions after every solve, when snapshots are enabled.
    pub snapshots: Vec<MultiIndexSet>,
}

/// Drives the adaptive stochastic Galerkin algorithm for one problem.
pub struct AdaptiveLoop<'a, A: Assembler = GalerkinAssembler<'a>> {
    problem: &'a ProblemDefinition,
    settings: AdaptiveSettings,
    assembler: A,
    estimator: ErrorEstimator<'a>,
    marker: Marker,
    state: AdaptiveState,
    keep_snapshots: bool,
}

impl<'a> AdaptiveLoop<'a> {
    /// Validates `settings` and sets up the initial index set on the initial mesh.
    ///
    /// Fails with [`SgfemError::NoRefinementStrategy`] when every refinement channel is off.
    pub fn new(problem: &'a ProblemDefinition, settings: AdaptiveSettings) -> Result<Self> {
        settings.validate()?;
        let assembler = GalerkinAssembler::new(problem).with_quadrature_degree(settings.quadrature_degree);
        let index_set = MultiIndexSet::initialize(
            settings.initial_lambda,
            problem.initial_modes(),
            problem.max_modes(),
            problem.initial_space(),
            settings.mesh_sharing,
        );
        info!(
            "Initialized index set with {} multi-indices and {} dofs",
            index_set.len(),
            index_set.total_dofs()
        );
        Ok(Self {
            problem,
            estimator: ErrorEstimator::new(problem, settings.estimator_settings()),
            marker: Marker::new(settings.marking_settings()),
            settings,
            assembler,
            state: AdaptiveState {
                iteration: 0,
                phase: LoopState::Init,
                index_set,
                eta_total: f64::INFINITY,
                zeta_total: f64::INFINITY,
                global_estimate: f64::INFINITY,
                converged: false,
                last_estimate: None,
                last_pcg: None,
                snapshots: Vec::new(),
            },
            keep_snapshots: false,
        })
    }
}

impl<'a, A: Assembler> AdaptiveLoop<'a, A> {
    /// Replaces the assembler, keeping all other state.
    pub fn with_assembler<B: Assembler>(self, assembler: B) -> AdaptiveLoop<'a, B> {
        AdaptiveLoop {
            problem: self.problem,
            settings: self.settings,
            assembler,
            estimator: self.estimator,
            marker: self.marker,
            state: self.state,
            keep_snapshots: self.keep_snapshots,
        }
    }

    /// Keeps a copy of Λ and its solutions after every solve in [`AdaptiveState::snapshots`].
    /// Meshes are shared with the live index set, so a snapshot costs one copy of the solution.
    pub fn with_snapshots(self, keep_snapshots: bool) -> Self {
        Self { keep_snapshots, ..self }
    }

    pub fn settings(&self) -> &AdaptiveSettings {
        &self.settings
    }

    pub fn state(&self) -> &AdaptiveState {
        &self.state
    }

    pub fn index_set(&self) -> &MultiIndexSet {
        &self.state.index_set
    }

    pub fn into_state(self) -> AdaptiveState {
        self.state
    }

    /// Runs until convergence or until a budget is exhausted, reporting every iteration to
    /// `sink`.
    pub fn run(&mut self, sink: &mut dyn DiagnosticsSink) -> Result<Termination> {
        loop {
            if let Some(termination) = self.step(sink)? {
                return Ok(termination);
            }
        }
    }

    /// Performs one iteration. Returns the termination reason once the loop has finished.
    pub fn step(&mut self, sink: &mut dyn DiagnosticsSink) -> Result<Option<Termination>> {
        let mut timings = PhaseTimings::default();
        let iteration = self.state.iteration;

        self.state.phase = LoopState::Assemble;
        let start = Instant::now();
        let num_modes = self
            .state
            .index_set
            .num_active_modes()
            .min(self.problem.coefficient().num_modes());
        let systems = assemble_systems(&self.assembler, &self.state.index_set, num_modes)?;
        let operator = StochasticOperator::new(&self.state.index_set, &systems)?;
        timings.assemble = start.elapsed().as_secs_f64();

        self.state.phase = LoopState::Solve;
        let start = Instant::now();
        let mut x = operator.initial_guess(&self.state.index_set);
        let pcg = solve_coupled(&operator, &mut x, self.settings.pcg_eps, self.settings.pcg_maxiter).map_err(
            |err| SgfemError::AssemblyFailure {
                index: MultiIndex::zero(),
                source: eyre::eyre!("failed to apply the stochastic Galerkin operator: {}", err),
            },
        )?;
        for (index, solution) in operator.split(&x) {
            self.state.index_set.set_solution(&index, solution)?;
        }
        if self.keep_snapshots {
            self.state.snapshots.push(self.state.index_set.clone());
        }
        timings.solve = start.elapsed().as_secs_f64();
        debug!(
            "Solved system with {} unknowns in {} PCG iterations",
            operator.dim(),
            pcg.iterations
        );
        drop(operator);
        drop(systems);
        if !pcg.converged && self.settings.pcg_policy == PcgPolicy::Abort {
            return Err(SgfemError::PcgNonConvergence {
                iteration,
                pcg_iterations: pcg.iterations,
                relative_residual: pcg.relative_residual,
            });
        }

        self.state.phase = LoopState::Estimate;
        let start = Instant::now();
        let mut estimate = self.estimator.estimate(&self.state.index_set)?;
        estimate.include_algebraic_error(pcg.preconditioned_residual, self.problem.gamma());
        timings.estimate = start.elapsed().as_secs_f64();
        self.state.eta_total = estimate.eta_total;
        self.state.zeta_total = estimate.zeta_total;
        self.state.global_estimate = estimate.global;

        let mut diagnostics = self.diagnostics(iteration, &estimate, &pcg);
        let pcg_converged = pcg.converged;
        self.state.last_pcg = Some(pcg);

        // An estimate below tolerance does not count while the algebraic system is unsolved
        let termination = if !self.settings.uniform_refinement
            && pcg_converged
            && estimate.global <= self.settings.error_eps
        {
            self.state.converged = true;
            Some((Termination::Converged, LoopState::Converged))
        } else if iteration >= self.settings.iterations {
            Some((Termination::IterationBudgetExhausted, LoopState::IterationBudgetExhausted))
        } else if self
            .settings
            .max_dof
            .map_or(false, |max_dof| self.state.index_set.total_dofs() >= max_dof)
        {
            Some((Termination::DofBudgetExhausted, LoopState::DofBudgetExhausted))
        } else {
            None
        };
        if let Some((termination, phase)) = termination {
            self.state.phase = phase;
            self.state.last_estimate = Some(estimate);
            diagnostics.timings = timings;
            sink.record(&diagnostics);
            info!("Adaptive loop finished after {} iteration(s): {}", iteration, termination);
            return Ok(Some(termination));
        }

        self.state.phase = LoopState::Mark;
        let start = Instant::now();
        let marking = self.marker.mark(&self.state.index_set, &estimate);
        timings.mark = start.elapsed().as_secs_f64();
        if marking.is_empty() {
            warn!("Nothing was marked for refinement in iteration {}", iteration);
        }

        self.state.phase = LoopState::Refine;
        let start = Instant::now();
        let summary = self.state.index_set.refine(&marking.cells);
        for candidate in &marking.admitted {
            self.state.index_set.admit(candidate.clone())?;
        }
        timings.refine = start.elapsed().as_secs_f64();
        debug!(
            "Refined {} mesh(es), detached {} multi-index(es), admitted {:?}",
            summary.refined_meshes,
            summary.detached.len(),
            marking.admitted.iter().map(ToString::to_string).collect::<Vec<_>>()
        );

        diagnostics.residual_marked = marking.residual_marked;
        diagnostics.projection_marked = marking.projection_marked;
        diagnostics.admitted = marking.admitted;
        diagnostics.refined_meshes = summary.refined_meshes;
        diagnostics.timings = timings;
        sink.record(&diagnostics);

        self.state.last_estimate = Some(estimate);
        self.state.iteration += 1;
        Ok(None)
    }

    fn diagnostics(&self, iteration: usize, estimate: &ErrorEstimate, pcg: &PcgReport) -> IterationDiagnostics {
        let set = &self.state.index_set;
        let indices = set
            .indices()
            .map(|index| {
                let space = set.space(index);
                let indicators = estimate.elements.get(index);
                IndexSummary {
                    index: index.clone(),
                    mesh: set.mesh_id(index).unwrap_or_default(),
                    dofs: space.map_or(0, |space| space.num_dofs()),
                    cells: space.map_or(0, |space| space.num_cells()),
                    eta: indicators.map_or(0.0, |i| i.eta_norm()),
                    delta: indicators.map_or(0.0, |i| i.delta_norm()),
                }
            })
            .collect();
        IterationDiagnostics {
            iteration,
            lambda_size: set.len(),
            indices,
            total_dofs: set.total_dofs(),
            total_cells: set.total_cells(),
            eta_total: estimate.eta_total,
            zeta_total: estimate.zeta_total,
            delta_total: estimate.delta_total,
            pcg_total: estimate.pcg_total,
            global_estimate: estimate.global,
            pcg: pcg.clone(),
            max_zeta: estimate.max_zeta(),
            residual_marked: 0,
            projection_marked: 0,
            admitted: Vec::new(),
            refined_meshes: 0,
            timings: PhaseTimings::default(),
        }
    }
}
