//! Closest approach between skew lines and its analytical derivative.
//!
//! Edge-edge contacts place the contact point midway between the closest
//! points of the two contact edges. Differentiating that construction in
//! closed form is what lets edge-edge contact points be tracked exactly as
//! the edges move.

use nalgebra::{Point3, Vector3};

/// The closest-approach solution between two lines `a + s·da` and `b + t·db`.
/// Directions must be unit vectors.
#[derive(Copy, Clone, Debug)]
pub struct LineClosestApproach {
    pub s: f64,
    pub t: f64,
    pub point_on_a: Point3<f64>,
    pub point_on_b: Point3<f64>,
    /// Midpoint of the two closest points; the contact point convention for
    /// edge-edge contacts.
    pub midpoint: Point3<f64>,
}

/// First-order motion of a line: velocities of its fixed point and of its
/// (unit) direction.
#[derive(Copy, Clone, Debug, Default)]
pub struct LineMotion {
    pub point_velocity: Vector3<f64>,
    pub dir_velocity: Vector3<f64>,
}

impl LineMotion {
    pub fn stationary() -> Self {
        Self::default()
    }

    /// The motion of a line rigidly carried by a twist with the given angular
    /// and linear parts (at-origin convention).
    pub fn carried_by(angular: &Vector3<f64>, linear: &Vector3<f64>, point: &Point3<f64>, dir: &Vector3<f64>) -> Self {
        Self {
            point_velocity: angular.cross(&point.coords) + linear,
            dir_velocity: angular.cross(dir),
        }
    }
}

const PARALLEL_TOLERANCE: f64 = 1e-9;

/// Solves the closest approach between the lines `a + s·da` and `b + t·db`
/// (unit directions). Returns [`None`] when the lines are (near-)parallel and
/// the solution is degenerate.
pub fn line_closest_approach(
    a: &Point3<f64>,
    da: &Vector3<f64>,
    b: &Point3<f64>,
    db: &Vector3<f64>,
) -> Option<LineClosestApproach> {
    let r = b - a;
    let d1 = r.dot(da);
    let d2 = r.dot(db);
    let k = da.dot(db);
    let denom = 1.0 - k * k;

    if denom.abs() < PARALLEL_TOLERANCE {
        return None;
    }

    let s = (d1 - k * d2) / denom;
    let t = (k * d1 - d2) / denom;

    let point_on_a = a + da * s;
    let point_on_b = b + db * t;
    let midpoint = nalgebra::center(&point_on_a, &point_on_b);

    Some(LineClosestApproach {
        s,
        t,
        point_on_a,
        point_on_b,
        midpoint,
    })
}

/// Differentiates [`line_closest_approach`] with respect to a parameter along
/// which the two lines move with the given motions. Returns the velocity of
/// the contact midpoint.
///
/// The caller must have checked that the lines are non-parallel; this
/// recomputes the same intermediate quantities and differentiates them.
pub fn line_closest_approach_gradient(
    a: &Point3<f64>,
    da: &Vector3<f64>,
    b: &Point3<f64>,
    db: &Vector3<f64>,
    motion_a: &LineMotion,
    motion_b: &LineMotion,
) -> Vector3<f64> {
    let r = b - a;
    let d1 = r.dot(da);
    let d2 = r.dot(db);
    let k = da.dot(db);
    let denom = 1.0 - k * k;

    let s = (d1 - k * d2) / denom;
    let t = (k * d1 - d2) / denom;

    let r_dot = motion_b.point_velocity - motion_a.point_velocity;
    let k_dot = motion_a.dir_velocity.dot(db) + da.dot(&motion_b.dir_velocity);
    let d1_dot = r_dot.dot(da) + r.dot(&motion_a.dir_velocity);
    let d2_dot = r_dot.dot(db) + r.dot(&motion_b.dir_velocity);
    let denom_dot = -2.0 * k * k_dot;

    let s_dot = ((d1_dot - k_dot * d2 - k * d2_dot) - s * denom_dot) / denom;
    let t_dot = ((k_dot * d1 + k * d1_dot - d2_dot) - t * denom_dot) / denom;

    let point_on_a_dot = motion_a.point_velocity + da * s_dot + motion_a.dir_velocity * s;
    let point_on_b_dot = motion_b.point_velocity + db * t_dot + motion_b.dir_velocity * t;

    (point_on_a_dot + point_on_b_dot) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{UnitQuaternion, point, vector};

    #[test]
    fn crossing_axes_meet_at_origin() {
        let approach = line_closest_approach(
            &point![0.0, 0.0, 0.0],
            &Vector3::x(),
            &point![0.0, 0.0, 1.0],
            &Vector3::y(),
        )
        .unwrap();
        assert_abs_diff_eq!(approach.point_on_a, point![0.0, 0.0, 0.0], epsilon = 1e-12);
        assert_abs_diff_eq!(approach.point_on_b, point![0.0, 0.0, 1.0], epsilon = 1e-12);
        assert_abs_diff_eq!(approach.midpoint, point![0.0, 0.0, 0.5], epsilon = 1e-12);
    }

    #[test]
    fn offset_skew_lines_find_interior_points() {
        let approach = line_closest_approach(
            &point![1.0, 2.0, 0.0],
            &Vector3::x(),
            &point![3.0, 0.0, 1.0],
            &Vector3::y(),
        )
        .unwrap();
        // Closest points sit above each other at (3, 2).
        assert_abs_diff_eq!(approach.point_on_a, point![3.0, 2.0, 0.0], epsilon = 1e-12);
        assert_abs_diff_eq!(approach.point_on_b, point![3.0, 2.0, 1.0], epsilon = 1e-12);
    }

    #[test]
    fn parallel_lines_are_rejected() {
        assert!(
            line_closest_approach(
                &point![0.0, 0.0, 0.0],
                &Vector3::x(),
                &point![0.0, 1.0, 0.0],
                &Vector3::x(),
            )
            .is_none()
        );
    }

    #[test]
    fn gradient_matches_finite_difference_for_rotating_edge() {
        let a = point![0.1, -0.3, 0.2];
        let da = vector![1.0, 0.2, -0.1].normalize();
        let b = point![0.4, 0.5, 1.1];
        let db = vector![-0.3, 1.0, 0.2].normalize();

        // Edge A carried by a twist, edge B fixed.
        let angular = vector![0.3, -0.2, 0.7];
        let linear = vector![0.1, 0.4, -0.2];
        let motion_a = LineMotion::carried_by(&angular, &linear, &a, &da);

        let analytical = line_closest_approach_gradient(
            &a,
            &da,
            &b,
            &db,
            &motion_a,
            &LineMotion::stationary(),
        );

        let eps = 1e-7;
        let rotation = UnitQuaternion::from_scaled_axis(angular * eps);
        let a_moved = Point3::from(rotation * a.coords + linear * eps);
        let da_moved = rotation * da;
        let base = line_closest_approach(&a, &da, &b, &db).unwrap();
        let moved = line_closest_approach(&a_moved, &da_moved, &b, &db).unwrap();
        let fd = (moved.midpoint - base.midpoint) / eps;

        assert_abs_diff_eq!(analytical, fd, epsilon = 1e-5);
    }

    #[test]
    fn gradient_matches_finite_difference_with_both_edges_moving() {
        let a = point![0.0, 0.0, 0.0];
        let da = Vector3::x();
        let b = point![0.2, -0.1, 0.8];
        let db = vector![0.1, 1.0, 0.3].normalize();

        let motion_a = LineMotion {
            point_velocity: vector![0.0, 0.2, -0.4],
            dir_velocity: vector![0.0, 0.5, 0.1], // must stay orthogonal to da
        };
        let angular_b = vector![-0.2, 0.1, 0.3];
        let motion_b = LineMotion::carried_by(&angular_b, &Vector3::zeros(), &b, &db);

        let analytical = line_closest_approach_gradient(&a, &da, &b, &db, &motion_a, &motion_b);

        let eps = 1e-7;
        let a_moved = a + motion_a.point_velocity * eps;
        let da_moved = (da + motion_a.dir_velocity * eps).normalize();
        let rotation_b = UnitQuaternion::from_scaled_axis(angular_b * eps);
        let b_moved = Point3::from(rotation_b * b.coords);
        let db_moved = rotation_b * db;

        let base = line_closest_approach(&a, &da, &b, &db).unwrap();
        let moved = line_closest_approach(&a_moved, &da_moved, &b_moved, &db_moved).unwrap();
        let fd = (moved.midpoint - base.midpoint) / eps;

        assert_abs_diff_eq!(analytical, fd, epsilon = 1e-4);
    }
}
