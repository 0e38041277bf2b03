//! Orthonormal Legendre polynomials for the uniform measure `dy/2` on `[-1, 1]`.
use crate::multiindex::MultiIndex;

/// Recurrence coefficient `β_n = n / sqrt(4n² - 1)` of the three-term recurrence
/// `y L_n = β_{n+1} L_{n+1} + β_n L_{n-1}`.
///
/// `β_0 = 0`.
pub fn legendre_beta(n: u32) -> f64 {
    if n == 0 {
        0.0
    } else {
        let n = n as f64;
        n / (4.0 * n * n - 1.0).sqrt()
    }
}

/// Evaluates `L_n(y)`.
pub fn legendre(n: u32, y: f64) -> f64 {
    let mut previous = 0.0;
    let mut current = 1.0;
    for k in 0..n {
        let next = (y * current - legendre_beta(k) * previous) / legendre_beta(k + 1);
        previous = current;
        current = next;
    }
    current
}

/// Evaluates the tensor product `L_μ(y) = Π_m L_{μ_m}(y_m)`.
///
/// Modes beyond the length of `y` are treated as `y_m = 0`.
pub fn tensor_legendre(index: &MultiIndex, y: &[f64]) -> f64 {
    index
        .active_modes()
        .map(|(m, order)| legendre(order, y.get(m).copied().unwrap_or(0.0)))
        .product()
}

/// Galerkin coupling weight between `μ` and `μ + e_m`, i.e. `E[y_m L_μ L_{μ+e_m}] = β_{μ_m + 1}`.
pub fn successor_coupling(index: &MultiIndex, m: usize) -> f64 {
    legendre_beta(index.order(m) + 1)
}

/// Galerkin coupling weight between `μ` and `μ - e_m`, i.e. `β_{μ_m}` (zero when `μ_m = 0`).
pub fn predecessor_coupling(index: &MultiIndex, m: usize) -> f64 {
    legendre_beta(index.order(m))
}
