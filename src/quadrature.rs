//! Quadrature rules on the reference triangle and reference segment.
//!
//! Triangle rules are given in barycentric coordinates with weights summing to one, so that
//! integrals over a physical triangle are `area * Σ w_i f(x_i)`.

/// A quadrature rule on the triangle in barycentric coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleQuadrature {
    pub weights: Vec<f64>,
    pub points: Vec<[f64; 3]>,
}

/// A quadrature rule on `[0, 1]` with weights summing to one.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentQuadrature {
    pub weights: Vec<f64>,
    pub points: Vec<f64>,
}

fn permutations_of(a: f64, b: f64) -> [[f64; 3]; 3] {
    [[a, b, b], [b, a, b], [b, b, a]]
}

/// Returns a symmetric rule exact for polynomials of at least the given total degree.
///
/// Degrees above 5 fall back to the degree 5 rule.
pub fn triangle_quadrature(degree: usize) -> TriangleQuadrature {
    let third = 1.0 / 3.0;
    match degree {
        0 | 1 => TriangleQuadrature {
            weights: vec![1.0],
            points: vec![[third; 3]],
        },
        2 => TriangleQuadrature {
            weights: vec![third; 3],
            points: permutations_of(2.0 / 3.0, 1.0 / 6.0).to_vec(),
        },
        3 | 4 => {
            let (a, wa) = (0.445948490915965, 0.223381589678011);
            let (b, wb) = (0.091576213509771, 0.109951743655322);
            let mut points = permutations_of(1.0 - 2.0 * a, a).to_vec();
            points.extend_from_slice(&permutations_of(1.0 - 2.0 * b, b));
            TriangleQuadrature {
                weights: vec![wa, wa, wa, wb, wb, wb],
                points,
            }
        }
        _ => {
            let (a, wa) = (0.470142064105115, 0.132394152788506);
            let (b, wb) = (0.101286507323456, 0.125939180544827);
            let mut points = vec![[third; 3]];
            points.extend_from_slice(&permutations_of(1.0 - 2.0 * a, a));
            points.extend_from_slice(&permutations_of(1.0 - 2.0 * b, b));
            TriangleQuadrature {
                weights: vec![0.225, wa, wa, wa, wb, wb, wb],
                points,
            }
        }
    }
}

/// Gauss-Legendre rule on `[0, 1]` exact for at least the given degree (at most 5).
pub fn segment_quadrature(degree: usize) -> SegmentQuadrature {
    match degree {
        0 | 1 => SegmentQuadrature {
            weights: vec![1.0],
            points: vec![0.5],
        },
        2 | 3 => {
            let d = 0.5 / 3.0_f64.sqrt();
            SegmentQuadrature {
                weights: vec![0.5, 0.5],
                points: vec![0.5 - d, 0.5 + d],
            }
        }
        _ => {
            let d = 0.5 * 0.6_f64.sqrt();
            SegmentQuadrature {
                weights: vec![5.0 / 18.0, 8.0 / 18.0, 5.0 / 18.0],
                points: vec![0.5 - d, 0.5, 0.5 + d],
            }
        }
    }
}
