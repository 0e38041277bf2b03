//! Adaptive stochastic Galerkin finite element engine.
//!
//! The solution of a parametric elliptic problem with affine coefficient
//! `a(x, y) = ā + Σ_m y_m a_m(x)` is sought as a Legendre chaos expansion
//! `w(x, y) = Σ_{μ ∈ Λ} w_μ(x) L_μ(y)`. The [`adaptive::AdaptiveLoop`] grows both the spatial
//! meshes of the coefficients `w_μ` and the index set `Λ`, driven by residual, successor and
//! mesh-projection error indicators.
pub mod adaptive;
pub mod assembly;
pub mod coefficient;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod estimate;
pub mod index_set;
pub mod io;
pub mod marking;
pub mod mesh;
pub mod montecarlo;
pub mod multiindex;
pub mod operator;
pub mod polynomials;
pub mod problem;
pub mod quadrature;
pub mod space;

pub use error::{Result, SgfemError};

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
pub extern crate vtkio;
