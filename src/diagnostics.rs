//! Per-iteration reporting of the adaptive loop.
use crate::index_set::MeshId;
use crate::multiindex::MultiIndex;
use crate::operator::PcgReport;
use log::{info, warn};
use serde::Serialize;

/// State of one active multi-index at the end of an iteration's estimate.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub index: MultiIndex,
    pub mesh: MeshId,
    pub dofs: usize,
    pub cells: usize,
    pub eta: f64,
    pub delta: f64,
}

/// Wall-clock seconds spent in each phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseTimings {
    pub assemble: f64,
    pub solve: f64,
    pub estimate: f64,
    pub mark: f64,
    pub refine: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationDiagnostics {
    pub iteration: usize,
    pub lambda_size: usize,
    pub indices: Vec<IndexSummary>,
    pub total_dofs: usize,
    pub total_cells: usize,
    pub eta_total: f64,
    pub zeta_total: f64,
    pub delta_total: f64,
    /// Algebraic error bound of the PCG iterate, included in `global_estimate`.
    pub pcg_total: f64,
    pub global_estimate: f64,
    pub pcg: PcgReport,
    pub max_zeta: f64,
    pub residual_marked: usize,
    pub projection_marked: usize,
    pub admitted: Vec<MultiIndex>,
    pub refined_meshes: usize,
    pub timings: PhaseTimings,
}

/// Receiver of per-iteration diagnostics.
pub trait DiagnosticsSink {
    fn record(&mut self, diagnostics: &IterationDiagnostics);
}

impl DiagnosticsSink for Vec<IterationDiagnostics> {
    fn record(&mut self, diagnostics: &IterationDiagnostics) {
        self.push(diagnostics.clone());
    }
}

/// Writes a one-line summary per iteration to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn record(&mut self, d: &IterationDiagnostics) {
        info!(
            "Iteration {}: |Λ| = {}, dofs = {}, cells = {}, eta = {:.4e}, zeta = {:.4e}, delta = {:.4e}, \
             pcg = {:.4e}, estimate = {:.4e}, PCG {} in {} iterations (residual {:.2e})",
            d.iteration,
            d.lambda_size,
            d.total_dofs,
            d.total_cells,
            d.eta_total,
            d.zeta_total,
            d.delta_total,
            d.pcg_total,
            d.global_estimate,
            if d.pcg.converged { "converged" } else { "did not converge" },
            d.pcg.iterations,
            d.pcg.relative_residual
        );
        if !d.pcg.converged {
            warn!(
                "PCG did not converge in iteration {}: {}",
                d.iteration,
                d.pcg.failure.as_deref().unwrap_or("unknown reason")
            );
        }
    }
}

/// Forwards diagnostics to two sinks.
pub struct Tee<'a, A: ?Sized, B: ?Sized>(pub &'a mut A, pub &'a mut B);

impl<'a, A, B> DiagnosticsSink for Tee<'a, A, B>
where
    A: DiagnosticsSink + ?Sized,
    B: DiagnosticsSink + ?Sized,
{
    fn record(&mut self, diagnostics: &IterationDiagnostics) {
        self.0.record(diagnostics);
        self.1.record(diagnostics);
    }
}
