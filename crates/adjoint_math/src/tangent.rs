//! The friction tangent basis and its derivative with respect to the normal.
//!
//! The basis construction matches the branch used by the contact solver: the
//! normal is crossed with the world x-axis unless it lies too close to it, in
//! which case the z-axis is used instead. Differentiating the basis keeps the
//! branch fixed, which is exact away from the (measure-zero) branch boundary.

use nalgebra::{UnitVector3, Vector3, vector};

const INV_SQRT_THREE: f64 = 0.5773502691896258;

/// The unnormalized first tangent and the branch it came from.
fn first_tangent_raw(normal: &Vector3<f64>) -> Vector3<f64> {
    if normal.x.abs() < INV_SQRT_THREE {
        // n × x̂: safe because the normal is far enough from the x-axis.
        vector![0.0, normal.z, -normal.y]
    } else {
        // n × ẑ for normals close to the x-axis.
        vector![normal.y, -normal.x, 0.0]
    }
}

fn first_tangent_raw_gradient(normal: &Vector3<f64>, normal_gradient: &Vector3<f64>) -> Vector3<f64> {
    if normal.x.abs() < INV_SQRT_THREE {
        vector![0.0, normal_gradient.z, -normal_gradient.y]
    } else {
        vector![normal_gradient.y, -normal_gradient.x, 0.0]
    }
}

/// Constructs two orthonormal tangent directions completing a right-handed
/// frame with the given unit normal.
pub fn tangent_basis(normal: &UnitVector3<f64>) -> (UnitVector3<f64>, UnitVector3<f64>) {
    let tangent_1 = UnitVector3::new_normalize(first_tangent_raw(normal));
    let tangent_2 = UnitVector3::new_unchecked(normal.cross(&tangent_1));
    (tangent_1, tangent_2)
}

/// Differentiates [`tangent_basis`] with respect to a parameter along which
/// the normal moves with velocity `normal_gradient`. The gradient must be
/// orthogonal to the normal for the result to preserve unit norms to first
/// order.
pub fn tangent_basis_gradient(
    normal: &UnitVector3<f64>,
    normal_gradient: &Vector3<f64>,
) -> (Vector3<f64>, Vector3<f64>) {
    let raw = first_tangent_raw(normal);
    let raw_gradient = first_tangent_raw_gradient(normal, normal_gradient);

    let norm = raw.norm();
    let tangent_1 = raw / norm;
    let tangent_1_gradient =
        (raw_gradient - tangent_1 * tangent_1.dot(&raw_gradient)) / norm;

    let tangent_2_gradient =
        normal_gradient.cross(&tangent_1) + normal.cross(&tangent_1_gradient);

    (tangent_1_gradient, tangent_2_gradient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    prop_compose! {
        fn unit_normal_strategy()(
            x in -1.0..1.0f64,
            y in -1.0..1.0f64,
            z in -1.0..1.0f64,
        ) -> Option<UnitVector3<f64>> {
            UnitVector3::try_new(vector![x, y, z], 1e-3)
        }
    }

    proptest! {
        #[test]
        fn basis_is_orthonormal(normal in unit_normal_strategy()) {
            prop_assume!(normal.is_some());
            let normal = normal.unwrap();
            let (t1, t2) = tangent_basis(&normal);
            prop_assert!(t1.dot(&normal).abs() < 1e-12);
            prop_assert!(t2.dot(&normal).abs() < 1e-12);
            prop_assert!(t1.dot(&t2).abs() < 1e-12);
            prop_assert!((t1.norm() - 1.0).abs() < 1e-12);
            prop_assert!((t2.norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let normal = UnitVector3::new_normalize(vector![0.2, 0.7, -0.4]);
        // A normal velocity tangent to the unit sphere.
        let normal_gradient = {
            let raw = vector![0.5, -0.3, 0.8];
            raw - normal.as_ref() * normal.dot(&raw)
        };

        let (dt1, dt2) = tangent_basis_gradient(&normal, &normal_gradient);

        let eps = 1e-7;
        let moved_normal =
            UnitVector3::new_normalize(normal.as_ref() + normal_gradient * eps);
        let (t1, t2) = tangent_basis(&normal);
        let (t1_moved, t2_moved) = tangent_basis(&moved_normal);

        assert_abs_diff_eq!(
            (t1_moved.as_ref() - t1.as_ref()) / eps,
            dt1,
            epsilon = 1e-5
        );
        assert_abs_diff_eq!(
            (t2_moved.as_ref() - t2.as_ref()) / eps,
            dt2,
            epsilon = 1e-5
        );
    }

    #[test]
    fn gradient_keeps_tangents_unit_to_first_order() {
        let normal = UnitVector3::new_normalize(vector![0.9, 0.1, 0.3]);
        let normal_gradient = {
            let raw = vector![-0.2, 0.6, 0.1];
            raw - normal.as_ref() * normal.dot(&raw)
        };
        let (t1, t2) = tangent_basis(&normal);
        let (dt1, dt2) = tangent_basis_gradient(&normal, &normal_gradient);
        assert_abs_diff_eq!(t1.dot(&dt1), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t2.dot(&dt2), 0.0, epsilon = 1e-12);
    }
}
