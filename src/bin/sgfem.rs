//! Runs an adaptive stochastic Galerkin experiment described by a TOML configuration file.
//!
//! Usage:
//!     sgfem experiment.toml --output results/ --vtk
use clap::Parser;
use eyre::{eyre, WrapErr};
use log::{error, info};
use serde::Serialize;
use sgfem::adaptive::{AdaptiveLoop, RunStatus};
use sgfem::config::ExperimentConfig;
use sgfem::diagnostics::{IterationDiagnostics, LogSink, Tee};
use sgfem::io::vtk::FiniteElementSpaceDataSetBuilder;
use sgfem::montecarlo::{MonteCarloReport, MonteCarloValidator};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "sgfem")]
#[command(about = "Adaptive stochastic Galerkin FEM for parametric elliptic problems")]
struct Args {
    /// Experiment configuration (TOML)
    config: PathBuf,

    /// Directory receiving diagnostics and VTK files
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Write the mesh and solution of every multi-index as VTK
    #[arg(long)]
    vtk: bool,

    /// Skip the Monte Carlo validation even if configured
    #[arg(long)]
    no_mc: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    status: RunStatus,
    iterations: &'a [IterationDiagnostics],
    monte_carlo: Option<MonteCarloReport>,
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    let config = ExperimentConfig::from_path(&args.config)?;

    env_logger::Builder::new()
        .filter_level(config.log_level()?)
        .parse_default_env()
        .init();

    let problem = config.problem_definition()?;
    let settings = config.adaptive_settings()?;
    let mc_settings = config.monte_carlo_settings()?;
    fs::create_dir_all(&args.output)
        .wrap_err_with(|| format!("cannot create output directory {}", args.output.display()))?;

    let run_mc = mc_settings.runs > 0 && !args.no_mc;
    let mut adaptive = AdaptiveLoop::new(&problem, settings)?.with_snapshots(run_mc && mc_settings.compare_iterates);
    let mut history: Vec<IterationDiagnostics> = Vec::new();
    let mut log_sink = LogSink;
    let result = adaptive.run(&mut Tee(&mut history, &mut log_sink));
    let status = RunStatus::from_result(&result);
    match &result {
        Ok(termination) => info!("Adaptive run finished: {}", termination),
        Err(err) => error!("Adaptive run aborted: {}", err),
    }

    if args.vtk {
        write_vtk(&adaptive, &args.output)?;
    }

    let monte_carlo = if run_mc {
        let validator = MonteCarloValidator::new(&problem, mc_settings)?;
        let snapshots = &adaptive.state().snapshots;
        let report = if !snapshots.is_empty() {
            validator.run_history(&snapshots.iter().collect::<Vec<_>>())?
        } else {
            validator.run(result.is_ok().then(|| adaptive.index_set()))?
        };
        for statistics in &report.runs {
            for errors in &statistics.iterates {
                info!(
                    "MC run {}: iterate {} with {} dofs, L2 error {:.4e} (mean field {:.4e}), energy error {:.4e} (mean field {:.4e})",
                    statistics.run,
                    errors.iterate,
                    errors.total_dofs,
                    errors.l2_error,
                    errors.mean_field_l2_error,
                    errors.energy_error,
                    errors.mean_field_energy_error
                );
            }
        }
        Some(report)
    } else {
        None
    };

    let report_path = args.output.join("diagnostics.json");
    let writer = BufWriter::new(
        File::create(&report_path).wrap_err_with(|| format!("cannot create {}", report_path.display()))?,
    );
    serde_json::to_writer_pretty(
        writer,
        &Report {
            status,
            iterations: &history,
            monte_carlo,
        },
    )?;
    info!("Wrote diagnostics to {}", report_path.display());

    result.map(|_| ()).map_err(|err| eyre!(err))
}

fn write_vtk(adaptive: &AdaptiveLoop, output: &Path) -> eyre::Result<()> {
    let set = adaptive.index_set();
    let estimate = adaptive.state().last_estimate.as_ref();
    for index in set.indices() {
        let (Some(space), Some(solution)) = (set.space(index), set.solution(index)) else {
            continue;
        };
        let orders: Vec<String> = index.orders().iter().map(u32::to_string).collect();
        let name = if orders.is_empty() {
            "mi_0".to_string()
        } else {
            format!("mi_{}", orders.join("_"))
        };
        let mut builder = FiniteElementSpaceDataSetBuilder::from_space(space)
            .with_title(format!("multi-index {}", index))
            .with_solution("solution", solution)?;
        if let Some(indicators) = estimate.and_then(|e| e.elements.get(index)) {
            if indicators.eta.len() == space.num_cells() {
                builder = builder
                    .with_cell_scalars("eta", &indicators.eta)?
                    .with_cell_scalars("delta", &indicators.delta)?;
            }
        }
        builder.try_export(output.join(format!("{}.vtk", name)))?;
    }
    Ok(())
}
