//! Gauss-Legendre quadrature for integrating over the cells of a patch.
//!
//! A rule with `n` points is exact for polynomials of degree `2n - 1` or less.
//! Mass assembly uses a tensor product of two 1D rules,
//! by default with `degree + 2` points per axis,
//! which integrates products of basis functions exactly on affine patches.

#[derive(Clone, Copy, Debug, PartialEq)]
struct GLPoint {
    weight: f64,
    abscissa: f64,
}

/// A Gauss-Legendre rule on the reference interval [-1, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct GaussLegendre {
    points: Vec<GLPoint>,
}

impl GaussLegendre {
    /// Compute the rule with `n` points.
    ///
    /// The abscissae are found with Newton iteration
    /// on the three-term recurrence of Legendre polynomials,
    /// which converges to machine precision in a handful of iterations.
    pub fn new(n: usize) -> Self {
        let n = n.max(1);
        let mut points = vec![
            GLPoint {
                weight: 0.,
                abscissa: 0.
            };
            n
        ];
        // roots are symmetric about zero so we only need to find half
        for i in 0..(n + 1) / 2 {
            let mut z = (std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
            let mut deriv = 1.;
            for _ in 0..100 {
                let (p_n, p_prev) = legendre(n, z);
                deriv = n as f64 * (z * p_n - p_prev) / (z * z - 1.);
                let step = p_n / deriv;
                z -= step;
                if step.abs() < 1e-16 {
                    break;
                }
            }
            // recompute the derivative at the converged root
            let (p_n, p_prev) = legendre(n, z);
            if z.abs() < 1. {
                deriv = n as f64 * (z * p_n - p_prev) / (z * z - 1.);
            }
            let weight = 2. / ((1. - z * z) * deriv * deriv);
            points[i] = GLPoint {
                weight,
                abscissa: -z,
            };
            points[n - 1 - i] = GLPoint {
                weight,
                abscissa: z,
            };
        }
        Self { points }
    }

    /// Number of points in the rule.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the rule is empty (never true for a constructed rule).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate over the points and weights of this rule mapped onto the interval [a, b].
    pub fn on_interval(&self, a: f64, b: f64) -> impl '_ + Iterator<Item = (f64, f64)> {
        let center = (a + b) / 2.;
        let half_len = (b - a) / 2.;
        self.points
            .iter()
            .map(move |p| (center + p.abscissa * half_len, p.weight * half_len))
    }

    /// Integrate a function over the interval [a, b].
    pub fn integrate(&self, a: f64, b: f64, f: impl Fn(f64) -> f64) -> f64 {
        self.on_interval(a, b).map(|(x, w)| w * f(x)).sum()
    }
}

/// Evaluate Legendre polynomials `P_n` and `P_{n-1}` at `x`.
fn legendre(n: usize, x: f64) -> (f64, f64) {
    let mut p_curr = 1.;
    let mut p_prev = 0.;
    for j in 0..n {
        let j = j as f64;
        let p_next = ((2. * j + 1.) * x * p_curr - j * p_prev) / (j + 1.);
        p_prev = p_curr;
        p_curr = p_next;
    }
    (p_curr, p_prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn weights_match_tabulated_values() {
        let gl3 = GaussLegendre::new(3);
        assert_eq!(gl3.len(), 3);
        assert_relative_eq!(gl3.points[1].abscissa, 0.0, epsilon = 1e-15);
        assert_relative_eq!(gl3.points[1].weight, 0.8888888888888888, epsilon = 1e-14);
        assert_relative_eq!(gl3.points[2].abscissa, 0.7745966692414834, epsilon = 1e-14);
        assert_relative_eq!(gl3.points[0].weight, 0.5555555555555556, epsilon = 1e-14);

        let gl6 = GaussLegendre::new(6);
        assert_relative_eq!(gl6.points[5].abscissa, 0.932469514203152, epsilon = 1e-14);
        assert_relative_eq!(gl6.points[5].weight, 0.1713244923791704, epsilon = 1e-14);
    }

    /// Check that the rules are exact for the degrees of polynomial they're supposed to be.
    #[test]
    fn polynomials_are_integrated_exactly() {
        let coefs = [
            -2., 1.1, 1.3, 0., -0.5, 6.8, -10., 2.25, -0.05, 1.44, 4.2, -6.7, 0., 1.15, -3.2, 5.55,
            1., -2.5,
        ];
        for n in 1..=9 {
            let degree = 2 * n - 1;
            let coefs = &coefs[..=degree];
            let polynomial = |x: f64| -> f64 {
                coefs
                    .iter()
                    .enumerate()
                    .map(|(i, c)| x.powi(i as i32) * c)
                    .sum()
            };
            let antiderivative = |x: f64| -> f64 {
                coefs
                    .iter()
                    .enumerate()
                    .map(|(i, c)| x.powi(i as i32 + 1) * c / (i + 1) as f64)
                    .sum()
            };
            let (a, b) = (0.25, 1.5);
            let rule = GaussLegendre::new(n);
            assert_relative_eq!(
                rule.integrate(a, b, polynomial),
                antiderivative(b) - antiderivative(a),
                epsilon = 1e-12,
                max_relative = 1e-12
            );
        }
    }
}
