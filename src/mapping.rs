//! Maps from the logical unit square of a patch to physical space.
//!
//! Geometry import is left to callers;
//! anything that can evaluate a point and a Jacobian can act as a patch mapping.

use nalgebra as na;

/// Smallest Jacobian determinant (in absolute value) accepted during assembly.
pub const DEGENERATE_JACOBIAN_TOL: f64 = 1e-12;

/// A smooth map from logical coordinates in [0, 1]² to physical coordinates.
pub trait Mapping: Send + Sync + std::fmt::Debug {
    /// Physical position of a logical point.
    fn eval(&self, logical: na::Vector2<f64>) -> na::Vector2<f64>;
    /// Jacobian matrix `∂x_i / ∂u_j` at a logical point.
    fn jacobian(&self, logical: na::Vector2<f64>) -> na::Matrix2<f64>;
}

/// The identity map.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IdentityMapping;

impl Mapping for IdentityMapping {
    fn eval(&self, logical: na::Vector2<f64>) -> na::Vector2<f64> {
        logical
    }

    fn jacobian(&self, _logical: na::Vector2<f64>) -> na::Matrix2<f64> {
        na::Matrix2::identity()
    }
}

/// Map onto an axis-aligned rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineMapping {
    /// Image of the logical origin.
    pub origin: na::Vector2<f64>,
    /// Side lengths of the rectangle.
    pub extent: na::Vector2<f64>,
}

impl AffineMapping {
    /// Map onto the rectangle `[x0, x1] × [y0, y1]`.
    pub fn rectangle(x_interval: (f64, f64), y_interval: (f64, f64)) -> Self {
        Self {
            origin: na::Vector2::new(x_interval.0, y_interval.0),
            extent: na::Vector2::new(x_interval.1 - x_interval.0, y_interval.1 - y_interval.0),
        }
    }
}

impl Mapping for AffineMapping {
    fn eval(&self, logical: na::Vector2<f64>) -> na::Vector2<f64> {
        self.origin + self.extent.component_mul(&logical)
    }

    fn jacobian(&self, _logical: na::Vector2<f64>) -> na::Matrix2<f64> {
        na::Matrix2::from_diagonal(&self.extent)
    }
}

/// Map onto a sector of an annulus.
/// Logical axis 0 is the radial direction and axis 1 the angular direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolarMapping {
    /// Center of the annulus.
    pub center: na::Vector2<f64>,
    /// Inner and outer radius.
    pub radii: (f64, f64),
    /// Start and end angle in radians.
    pub angles: (f64, f64),
}

impl PolarMapping {
    fn radius(&self, u: f64) -> f64 {
        self.radii.0 + u * (self.radii.1 - self.radii.0)
    }

    fn angle(&self, v: f64) -> f64 {
        self.angles.0 + v * (self.angles.1 - self.angles.0)
    }
}

impl Mapping for PolarMapping {
    fn eval(&self, logical: na::Vector2<f64>) -> na::Vector2<f64> {
        let r = self.radius(logical.x);
        let theta = self.angle(logical.y);
        self.center + r * na::Vector2::new(theta.cos(), theta.sin())
    }

    fn jacobian(&self, logical: na::Vector2<f64>) -> na::Matrix2<f64> {
        let r = self.radius(logical.x);
        let theta = self.angle(logical.y);
        let dr = self.radii.1 - self.radii.0;
        let dtheta = self.angles.1 - self.angles.0;
        let (sin, cos) = theta.sin_cos();
        na::Matrix2::new(
            dr * cos,
            -r * dtheta * sin,
            dr * sin,
            r * dtheta * cos,
        )
    }
}
