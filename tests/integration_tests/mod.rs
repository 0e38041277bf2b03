use sgfem::config::ExperimentConfig;
use std::path::PathBuf;

mod operator;

fn data_output_path() -> PathBuf {
    PathBuf::from("data/integration_tests/")
}

/// Default experiment, but on a coarse mesh with a short expansion so that runs stay fast.
fn coarse_config() -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.sfem.initial_mesh_n = 4;
    config.sfem.max_modes = 10;
    config
}
