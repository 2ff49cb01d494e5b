//! Screw algebra in world coordinates.
//!
//! A spatial vector is a pair `[angular; linear]` of 3-vectors. For a twist,
//! `linear` is the velocity of the body-fixed point currently coinciding with
//! the world origin, so the velocity of a world point `p` is `ω × p + v`. For
//! a wrench, `angular` is the torque about the world origin, so a pure force
//! `f` applied at `p` is `[p × f; f]`. Both kinds transform with the same
//! formula under a change of frame, and the power pairing between them is the
//! plain 6-dot-product.

use approx::AbsDiffEq;
use nalgebra::{Isometry3, Matrix3, Matrix6, Point3, Vector3, Vector6};
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// A 6-vector in world coordinates, used for twists (screw axes scaled by a
/// rate), wrenches, and spatial momenta alike.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SpatialVector {
    pub angular: Vector3<f64>,
    pub linear: Vector3<f64>,
}

impl SpatialVector {
    pub const fn new(angular: Vector3<f64>, linear: Vector3<f64>) -> Self {
        Self { angular, linear }
    }

    pub fn zeros() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    /// A pure rotation about the given world axis (through the world origin).
    pub fn rotation(axis: Vector3<f64>) -> Self {
        Self::new(axis, Vector3::zeros())
    }

    /// A pure translation along the given world direction.
    pub fn translation(direction: Vector3<f64>) -> Self {
        Self::new(Vector3::zeros(), direction)
    }

    /// The wrench of a pure force applied at a world point.
    pub fn force_at_point(force: Vector3<f64>, point: &Point3<f64>) -> Self {
        Self::new(point.coords.cross(&force), force)
    }

    /// Velocity of the world point `p` when it is rigidly carried by this
    /// twist.
    pub fn point_velocity(&self, p: &Point3<f64>) -> Vector3<f64> {
        self.angular.cross(&p.coords) + self.linear
    }

    /// The power pairing `ω·a + v·b`. Between a twist and a wrench this is
    /// mechanical power; between a twist and a momentum it is twice the
    /// kinetic energy.
    pub fn dot(&self, other: &Self) -> f64 {
        self.angular.dot(&other.angular) + self.linear.dot(&other.linear)
    }

    /// The Lie bracket `ad_self(other)` of two twists:
    /// `[ω₁ × ω₂; ω₁ × v₂ + v₁ × ω₂]`.
    ///
    /// This is the rate of change of `other` when its carrying frame moves
    /// with twist `self`.
    pub fn ad(&self, other: &Self) -> Self {
        Self::new(
            self.angular.cross(&other.angular),
            self.angular.cross(&other.linear) + self.linear.cross(&other.angular),
        )
    }

    /// Applies the transpose of `ad_self` to the given spatial vector:
    /// `ad_selfᵀ h = [−ω × h_ang − v × h_lin; −ω × h_lin]`.
    ///
    /// For a body moving with twist `self` and carrying momentum `h`, the
    /// gyroscopic wrench is `−ad_selfᵀ h`.
    pub fn ad_dual(&self, h: &Self) -> Self {
        Self::new(
            -self.angular.cross(&h.angular) - self.linear.cross(&h.linear),
            -self.angular.cross(&h.linear),
        )
    }

    /// Change of coordinates by the isometry `T` (the adjoint map `Ad_T`).
    /// Valid for twists and wrenches alike under this crate's at-origin
    /// conventions.
    pub fn transformed(&self, transform: &Isometry3<f64>) -> Self {
        let rotated_angular = transform.rotation * self.angular;
        let rotated_linear = transform.rotation * self.linear;
        let translation = transform.translation.vector;
        Self::new(
            rotated_angular,
            rotated_linear + translation.cross(&rotated_angular),
        )
    }

    pub fn to_vector6(self) -> Vector6<f64> {
        Vector6::new(
            self.angular.x,
            self.angular.y,
            self.angular.z,
            self.linear.x,
            self.linear.y,
            self.linear.z,
        )
    }

    pub fn from_vector6(v: &Vector6<f64>) -> Self {
        Self::new(Vector3::new(v[0], v[1], v[2]), Vector3::new(v[3], v[4], v[5]))
    }

    pub fn norm(&self) -> f64 {
        (self.angular.norm_squared() + self.linear.norm_squared()).sqrt()
    }
}

impl Add for SpatialVector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.angular + rhs.angular, self.linear + rhs.linear)
    }
}

impl AddAssign for SpatialVector {
    fn add_assign(&mut self, rhs: Self) {
        self.angular += rhs.angular;
        self.linear += rhs.linear;
    }
}

impl Sub for SpatialVector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.angular - rhs.angular, self.linear - rhs.linear)
    }
}

impl SubAssign for SpatialVector {
    fn sub_assign(&mut self, rhs: Self) {
        self.angular -= rhs.angular;
        self.linear -= rhs.linear;
    }
}

impl Neg for SpatialVector {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.angular, -self.linear)
    }
}

impl Mul<f64> for SpatialVector {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.angular * rhs, self.linear * rhs)
    }
}

impl AbsDiffEq for SpatialVector {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        Vector3::abs_diff_eq(&self.angular, &other.angular, epsilon)
            && Vector3::abs_diff_eq(&self.linear, &other.linear, epsilon)
    }
}

/// The 6×6 matrix of `ad_w` acting on spatial vectors, in block form
/// `[[ŵ, 0], [v̂, ŵ]]`.
pub fn ad_matrix(w: &SpatialVector) -> Matrix6<f64> {
    let omega_hat = skew(&w.angular);
    let v_hat = skew(&w.linear);
    let mut m = Matrix6::zeros();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&omega_hat);
    m.fixed_view_mut::<3, 3>(3, 0).copy_from(&v_hat);
    m.fixed_view_mut::<3, 3>(3, 3).copy_from(&omega_hat);
    m
}

/// The skew-symmetric cross-product matrix of `v`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// The spatial inertia of a rigid body, expressed about the world origin in
/// `[angular; linear]` block ordering. Applying it to a twist yields the
/// body's spatial momentum.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpatialInertia {
    matrix: Matrix6<f64>,
}

impl SpatialInertia {
    /// Builds the spatial inertia of a body with the given mass, rotational
    /// inertia about its center of mass (world-aligned axes), and world
    /// center-of-mass position.
    pub fn from_body(
        mass: f64,
        inertia_about_com: &Matrix3<f64>,
        com: &Point3<f64>,
    ) -> Self {
        let c_hat = skew(&com.coords);
        let mut matrix = Matrix6::zeros();
        matrix
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(inertia_about_com + (c_hat.transpose() * c_hat) * mass));
        matrix.fixed_view_mut::<3, 3>(0, 3).copy_from(&(c_hat * mass));
        matrix
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(c_hat.transpose() * mass));
        matrix
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(Matrix3::identity() * mass));
        Self { matrix }
    }

    pub fn zeros() -> Self {
        Self {
            matrix: Matrix6::zeros(),
        }
    }

    pub fn matrix(&self) -> &Matrix6<f64> {
        &self.matrix
    }

    /// The spatial momentum `I v` of a body with this inertia moving with the
    /// given twist.
    pub fn apply(&self, twist: &SpatialVector) -> SpatialVector {
        SpatialVector::from_vector6(&(self.matrix * twist.to_vector6()))
    }

    /// The rate of change of this inertia when the body is carried by the
    /// twist `w`: `İ = −(ad_wᵀ I + I ad_w)`.
    pub fn transport_derivative(&self, w: &SpatialVector) -> Matrix6<f64> {
        let ad = ad_matrix(w);
        -(ad.transpose() * self.matrix + self.matrix * ad)
    }

    pub fn add_assign(&mut self, other: &Self) {
        self.matrix += other.matrix;
    }
}
