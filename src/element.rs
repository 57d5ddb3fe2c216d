//! Reference finite elements.

use nalgebra::{Matrix1x3, Matrix2, Matrix2x3, Point2, Vector2};
use numeric_literals::replace_float_literals;

use crate::Real;

/// A finite element with linear basis functions on a triangle.
///
/// The reference element is the unit triangle with corners (0, 0), (1, 0)
/// and (0, 1); the quadrature rules in [`crate::quadrature`] are stated on
/// the same domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tri3Element<T>
where
    T: Real,
{
    vertices: [Point2<T>; 3],
}

impl<T> Tri3Element<T>
where
    T: Real,
{
    pub fn from_vertices(vertices: [Point2<T>; 3]) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[Point2<T>; 3] {
        &self.vertices
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn reference() -> Self {
        Self::from_vertices([
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ])
    }

    #[rustfmt::skip]
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn evaluate_basis(&self, xi: &Point2<T>) -> Matrix1x3<T> {
        Matrix1x3::from_row_slice(&[
            1.0 - xi.x - xi.y,
            xi.x,
            xi.y,
        ])
    }

    /// Basis gradients with respect to reference coordinates, one column
    /// per node. Constant over the element for linear basis functions.
    #[rustfmt::skip]
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn reference_gradients(&self) -> Matrix2x3<T> {
        Matrix2x3::from_columns(&[
            Vector2::new(-1.0, -1.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, 1.0),
        ])
    }

    /// The Jacobian of the map from reference to physical coordinates.
    #[allow(non_snake_case)]
    pub fn reference_jacobian(&self) -> Matrix2<T> {
        let X = Matrix2x3::from_fn(|i, j| self.vertices[j][i]);
        X * self.reference_gradients().transpose()
    }

    pub fn map_reference_coords(&self, xi: &Point2<T>) -> Point2<T> {
        #[allow(non_snake_case)]
        let X = Matrix2x3::from_fn(|i, j| self.vertices[j][i]);
        let basis = self.evaluate_basis(xi);
        Point2::from(X * basis.transpose())
    }

    /// Signed area times two, i.e. the reference Jacobian determinant.
    pub fn jacobian_determinant(&self) -> T {
        self.reference_jacobian().determinant()
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn area(&self) -> T {
        self.jacobian_determinant().abs() * 0.5
    }

    /// Basis gradients with respect to physical coordinates, one column per
    /// node, or `None` for a degenerate element.
    pub fn physical_gradients(&self) -> Option<Matrix2x3<T>> {
        let j_inv_t = self.reference_jacobian().try_inverse()?.transpose();
        Some(j_inv_t * self.reference_gradients())
    }
}
