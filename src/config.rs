//! Experiment configuration files.
//!
//! A configuration is a TOML document with the tables `[SFEM]`, `["SFEM adaptive algorithm"]`,
//! `[LOGGING]` and `[MC]`. Every key is optional. The raw tables are converted once into the
//! typed settings used by the engine, and all validation happens during that conversion.
use crate::adaptive::{AdaptiveSettings, PcgPolicy};
use crate::error::{Result, SgfemError};
use crate::index_set::MeshSharing;
use crate::marking::MarkingStrategy;
use crate::montecarlo::MonteCarloSettings;
use crate::problem::{Domain, ProblemDefinition, ProblemKind, ProblemParameters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    #[serde(rename = "SFEM")]
    pub sfem: SfemSection,
    #[serde(rename = "SFEM adaptive algorithm")]
    pub adaptive: AdaptiveSection,
    #[serde(rename = "LOGGING")]
    pub logging: LoggingSection,
    #[serde(rename = "MC")]
    pub mc: MonteCarloSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfemSection {
    /// 0 = Poisson, 1 = Lamé.
    pub problem_type: u32,
    pub domain: String,
    pub boundary_type: u32,
    #[serde(rename = "FEM_degree")]
    pub fem_degree: usize,
    #[serde(rename = "initial_Lambda")]
    pub initial_lambda: u32,
    pub initial_modes: usize,
    pub max_modes: usize,
    pub decay_exp: f64,
    pub coeff_type: u32,
    pub coeff_scale: f64,
    pub freq_scale: f64,
    pub freq_skip: u32,
    pub gamma: f64,
    pub mu: Option<f64>,
    pub lambda: Option<f64>,
    #[serde(rename = "initial_mesh_N")]
    pub initial_mesh_n: usize,
}

impl Default for SfemSection {
    fn default() -> Self {
        Self {
            problem_type: 0,
            domain: "square".to_string(),
            boundary_type: 0,
            fem_degree: 1,
            initial_lambda: 1,
            initial_modes: 1,
            max_modes: 100,
            decay_exp: 2.0,
            coeff_type: 0,
            coeff_scale: 1.0,
            freq_scale: 1.0,
            freq_skip: 0,
            gamma: 0.9,
            mu: None,
            lambda: None,
            initial_mesh_n: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSection {
    pub iterations: usize,
    pub uniform_refinement: bool,
    pub refine_residual: bool,
    pub refine_projection: bool,
    #[serde(rename = "refine_Lambda")]
    pub refine_lambda: bool,
    #[serde(rename = "cQ")]
    pub c_q: f64,
    #[serde(rename = "ceta")]
    pub c_eta: f64,
    pub theta_eta: f64,
    pub theta_zeta: f64,
    pub min_zeta: f64,
    pub theta_delta: f64,
    pub maxh: f64,
    #[serde(rename = "max_Lambda_frac")]
    pub max_lambda_frac: f64,
    pub newmi_add_maxm: usize,
    /// Negative values select the degree automatically.
    pub quadrature_degree: i64,
    pub projection_degree_increase: usize,
    pub refine_projection_mesh: i64,
    pub pcg_eps: f64,
    pub pcg_maxiter: usize,
    pub error_eps: f64,
    pub marking_strategy: String,
    pub max_dof: Option<usize>,
    pub pcg_policy: String,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        Self {
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
            quadrature_degree: -1,
            projection_degree_increase: 1,
            refine_projection_mesh: 1,
            pcg_eps: 1e-6,
            pcg_maxiter: 100,
            error_eps: 1e-2,
            marking_strategy: "SEPARATE with CELLPROJECTION".to_string(),
            max_dof: None,
            pcg_policy: "continue".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloSection {
    pub runs: usize,
    #[serde(rename = "N")]
    pub samples: usize,
    pub max_h: f64,
    pub seed: u64,
    pub compare_iterates: bool,
}

impl Default for MonteCarloSection {
    fn default() -> Self {
        let defaults = MonteCarloSettings::default();
        Self {
            runs: defaults.runs,
            samples: defaults.samples,
            max_h: defaults.max_h,
            seed: defaults.seed,
            compare_iterates: defaults.compare_iterates,
        }
    }
}

impl ExperimentConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|err| SgfemError::invalid(format!("malformed configuration: {}", err)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| SgfemError::invalid(format!("cannot read {}: {}", path.display(), err)))?;
        Self::from_toml_str(&source)
    }

    pub fn problem_kind(&self) -> Result<ProblemKind> {
        match self.sfem.problem_type {
            0 => Ok(ProblemKind::Poisson),
            1 => {
                let mu = self
                    .sfem
                    .mu
                    .ok_or_else(|| SgfemError::invalid("the Lamé problem requires SFEM.mu"))?;
                Ok(ProblemKind::Elasticity {
                    mu,
                    lambda: self.sfem.lambda.unwrap_or(1.5 * mu),
                })
            }
            other => Err(SgfemError::invalid(format!("unknown problem_type {}", other))),
        }
    }

    /// The validated problem described by the `[SFEM]` table.
    pub fn problem_definition(&self) -> Result<ProblemDefinition> {
        let sfem = &self.sfem;
        ProblemDefinition::new(ProblemParameters {
            kind: self.problem_kind()?,
            domain: sfem.domain.parse::<Domain>()?,
            boundary_type: sfem.boundary_type,
            fem_degree: sfem.fem_degree,
            coeff_type: sfem.coeff_type,
            coeff_scale: sfem.coeff_scale,
            decay_exp: sfem.decay_exp,
            freq_scale: sfem.freq_scale,
            freq_skip: sfem.freq_skip,
            gamma: sfem.gamma,
            initial_mesh_n: sfem.initial_mesh_n,
            initial_modes: sfem.initial_modes,
            max_modes: sfem.max_modes,
        })
    }

    /// Settings of the adaptive loop. Strategy validation is left to
    /// [`AdaptiveLoop::new`](crate::adaptive::AdaptiveLoop::new).
    pub fn adaptive_settings(&self) -> Result<AdaptiveSettings> {
        let section = &self.adaptive;
        Ok(AdaptiveSettings {
            initial_lambda: self.sfem.initial_lambda,
            iterations: section.iterations,
            uniform_refinement: section.uniform_refinement,
            refine_residual: section.refine_residual,
            refine_projection: section.refine_projection,
            refine_lambda: section.refine_lambda,
            c_q: section.c_q,
            c_eta: section.c_eta,
            theta_eta: section.theta_eta,
            theta_zeta: section.theta_zeta,
            min_zeta: section.min_zeta,
            theta_delta: section.theta_delta,
            maxh: section.maxh,
            max_lambda_frac: section.max_lambda_frac,
            newmi_add_maxm: section.newmi_add_maxm,
            quadrature_degree: usize::try_from(section.quadrature_degree).ok(),
            projection_degree_increase: section.projection_degree_increase,
            mesh_sharing: MeshSharing::from_refine_projection_mesh(section.refine_projection_mesh)?,
            pcg_eps: section.pcg_eps,
            pcg_maxiter: section.pcg_maxiter,
            error_eps: section.error_eps,
            marking_strategy: section.marking_strategy.parse::<MarkingStrategy>()?,
            max_dof: section.max_dof,
            pcg_policy: section.pcg_policy.parse::<PcgPolicy>()?,
        })
    }

    pub fn monte_carlo_settings(&self) -> Result<MonteCarloSettings> {
        let settings = MonteCarloSettings {
            runs: self.mc.runs,
            samples: self.mc.samples,
            max_h: self.mc.max_h,
            seed: self.mc.seed,
            compare_iterates: self.mc.compare_iterates,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn log_level(&self) -> Result<LevelFilter> {
        self.logging
            .level
            .parse::<LevelFilter>()
            .map_err(|_| SgfemError::invalid(format!("unknown logging level \"{}\"", self.logging.level)))
    }
}
