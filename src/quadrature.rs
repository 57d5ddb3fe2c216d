//! Quadrature rules on the unit reference triangle.
//!
//! Weights sum to the reference area 1/2. Rules are keyed by the polynomial
//! strength they integrate exactly.

use nalgebra::Point2;
use numeric_literals::replace_float_literals;

use crate::Real;

#[derive(Debug, Clone)]
pub struct QuadratureRule<T: Real> {
    points: Vec<Point2<T>>,
    weights: Vec<T>,
}

impl<T: Real> QuadratureRule<T> {
    /// A rule on the unit triangle that exactly integrates polynomials of
    /// total degree `strength`. Supported strengths are 1 through 3.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn triangle(strength: usize) -> eyre::Result<Self> {
        let (points, weights) = match strength {
            // Centroid rule.
            1 => (
                vec![Point2::new(1.0 / 3.0, 1.0 / 3.0)],
                vec![1.0 / 2.0],
            ),
            // Three interior points.
            2 => (
                vec![
                    Point2::new(1.0 / 6.0, 1.0 / 6.0),
                    Point2::new(2.0 / 3.0, 1.0 / 6.0),
                    Point2::new(1.0 / 6.0, 2.0 / 3.0),
                ],
                vec![1.0 / 6.0, 1.0 / 6.0, 1.0 / 6.0],
            ),
            // Four points with negative centroid weight.
            3 => (
                vec![
                    Point2::new(1.0 / 3.0, 1.0 / 3.0),
                    Point2::new(3.0 / 5.0, 1.0 / 5.0),
                    Point2::new(1.0 / 5.0, 3.0 / 5.0),
                    Point2::new(1.0 / 5.0, 1.0 / 5.0),
                ],
                vec![-27.0 / 96.0, 25.0 / 96.0, 25.0 / 96.0, 25.0 / 96.0],
            ),
            _ => eyre::bail!("no triangle quadrature rule of strength {}", strength),
        };
        Ok(Self { points, weights })
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[Point2<T>] {
        &self.points
    }

    pub fn weights(&self) -> &[T] {
        &self.weights
    }
}
