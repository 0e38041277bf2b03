//! Affine parametric coefficient fields `a(x, y) = ā + Σ_m y_m a_m(x)`.
use nalgebra::{Point2, Vector2};
use std::f64::consts::PI;

/// Spatial function family of the expansion modes (`coeff_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoefficientFamily {
    Cosine,
    Sine,
    Monomial,
    Constant,
}

impl CoefficientFamily {
    pub fn from_coeff_type(coeff_type: u32) -> Option<Self> {
        match coeff_type {
            0 => Some(Self::Cosine),
            1 => Some(Self::Sine),
            2 => Some(Self::Monomial),
            3 => Some(Self::Constant),
            _ => None,
        }
    }
}

/// Parameters of the decaying expansion.
#[derive(Debug, Clone)]
pub struct ExpansionParameters {
    pub family: CoefficientFamily,
    pub coeff_scale: f64,
    pub decay_exp: f64,
    pub gamma: f64,
    pub freq_scale: f64,
    pub freq_skip: u32,
    pub max_modes: usize,
}

#[derive(Debug, Clone)]
struct Mode {
    amplitude: f64,
    frequency: (u32, u32),
}

/// Truncated affine coefficient field.
///
/// Modes are indexed from zero; mode `m` is the expansion term `m + 1`. Spatial functions are
/// evaluated in coordinates scaled to the unit box spanned by the domain's bounding box, so mode
/// shapes do not depend on the physical size of the domain.
#[derive(Debug, Clone)]
pub struct CoefficientField {
    mean: f64,
    family: CoefficientFamily,
    freq_scale: f64,
    modes: Vec<Mode>,
    origin: Point2<f64>,
    extent: Vector2<f64>,
}

/// Maps the shifted term index `m̃ >= 1` to the pair of frequencies `(β₁, β₂)` by enumerating the
/// diagonals of the positive quadrant.
pub fn mode_frequencies(shifted_index: u32) -> (u32, u32) {
    let m = shifted_index as f64;
    let mut k = (-0.5 + (0.25 + 2.0 * m).sqrt()).floor() as u32;
    // Guard against rounding at triangular numbers
    while (k + 1) * (k + 2) / 2 <= shifted_index {
        k += 1;
    }
    while k > 0 && k * (k + 1) / 2 > shifted_index {
        k -= 1;
    }
    let beta1 = shifted_index - k * (k + 1) / 2;
    (beta1, k - beta1)
}

impl CoefficientField {
    pub fn new(parameters: &ExpansionParameters, origin: Point2<f64>, extent: Vector2<f64>) -> Self {
        let skip = parameters.freq_skip;
        let decay = |m: usize| ((m as u32 + skip) as f64).powf(-parameters.decay_exp);
        let normalization: f64 = (1..=parameters.max_modes).map(decay).sum();
        let modes = (1..=parameters.max_modes)
            .map(|m| Mode {
                amplitude: parameters.coeff_scale * parameters.gamma * decay(m) / normalization,
                frequency: mode_frequencies(m as u32 + skip),
            })
            .collect();
        Self {
            mean: parameters.coeff_scale,
            family: parameters.family,
            freq_scale: parameters.freq_scale,
            modes,
            origin,
            extent,
        }
    }

    /// The (constant) mean field `ā`.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    pub fn amplitude(&self, m: usize) -> f64 {
        self.modes.get(m).map(|mode| mode.amplitude).unwrap_or(0.0)
    }

    pub fn frequencies(&self, m: usize) -> Option<(u32, u32)> {
        self.modes.get(m).map(|mode| mode.frequency)
    }

    /// `‖a_m / ā‖_∞`; every spatial function is bounded by one on the scaled domain.
    pub fn relative_sup_norm(&self, m: usize) -> f64 {
        self.amplitude(m) / self.mean
    }

    fn scaled(&self, x: &Point2<f64>) -> Vector2<f64> {
        (x - self.origin).component_div(&self.extent)
    }

    /// Value and gradient of `a_m` at `x`.
    pub fn mode(&self, m: usize, x: &Point2<f64>) -> (f64, Vector2<f64>) {
        let Some(mode) = self.modes.get(m) else {
            return (0.0, Vector2::zeros());
        };
        let xs = self.scaled(x);
        let (b1, b2) = mode.frequency;
        let (value, grad_scaled) = match self.family {
            CoefficientFamily::Cosine => {
                let k1 = 2.0 * PI * b1 as f64 * self.freq_scale;
                let k2 = 2.0 * PI * b2 as f64 * self.freq_scale;
                let (s1, c1) = (k1 * xs.x).sin_cos();
                let (s2, c2) = (k2 * xs.y).sin_cos();
                (c1 * c2, Vector2::new(-k1 * s1 * c2, -k2 * c1 * s2))
            }
            CoefficientFamily::Sine => {
                let k1 = PI * (b1 + 1) as f64 * self.freq_scale;
                let k2 = PI * (b2 + 1) as f64 * self.freq_scale;
                let (s1, c1) = (k1 * xs.x).sin_cos();
                let (s2, c2) = (k2 * xs.y).sin_cos();
                (s1 * s2, Vector2::new(k1 * c1 * s2, k2 * s1 * c2))
            }
            CoefficientFamily::Monomial => {
                let monomial = |base: f64, power: u32| if power == 0 { 1.0 } else { base.powi(power as i32) };
                let derivative = |base: f64, power: u32| {
                    if power == 0 {
                        0.0
                    } else {
                        power as f64 * monomial(base, power - 1)
                    }
                };
                (
                    monomial(xs.x, b1) * monomial(xs.y, b2),
                    Vector2::new(
                        derivative(xs.x, b1) * monomial(xs.y, b2),
                        monomial(xs.x, b1) * derivative(xs.y, b2),
                    ),
                )
            }
            CoefficientFamily::Constant => (1.0, Vector2::zeros()),
        };
        (
            mode.amplitude * value,
            mode.amplitude * grad_scaled.component_div(&self.extent),
        )
    }

    pub fn mode_value(&self, m: usize, x: &Point2<f64>) -> f64 {
        self.mode(m, x).0
    }

    /// Evaluates the realization `ā + Σ_m y_m a_m(x)` for a sample `y`.
    pub fn realization(&self, x: &Point2<f64>, y: &[f64]) -> f64 {
        self.mean
            + y.iter()
                .enumerate()
                .take(self.modes.len())
                .map(|(m, y_m)| y_m * self.mode_value(m, x))
                .sum::<f64>()
    }
}
