//! The differentiable contact constraint: one (contact, basis direction)
//! pair and the analytical derivatives of everything it contributes to the
//! dynamics.
//!
//! A constraint is constructed with a value copy of its [`Contact`] record
//! and lives for exactly one step, owned by the step's backprop snapshot.
//! All queries are read-only; the world must not be mutated while gradients
//! are being evaluated against a [`WorldKinematics`] cache.
//!
//! Gradient dispatch is a flat match on the [`DofContactType`]. Unsupported
//! contact geometry yields zero gradients silently; the enclosing snapshot
//! surfaces the affected rows.

use crate::{
    collision::{Contact, ContactEdge, ContactKind},
    constraint::{DofContactType, dof_contact_type, force_multiple},
    fph,
    world::WorldKinematics,
};
use adjoint_math::{
    LineMotion, SpatialVector, line_closest_approach_gradient, tangent_basis,
    tangent_basis_gradient,
};
use nalgebra::{DMatrix, DVector, Point3, UnitVector3, Vector3};

/// Below this squared magnitude a normal gradient is treated as zero and not
/// propagated into the tangent basis, avoiding spurious tangent rotations
/// from numerical noise.
const NORMAL_GRADIENT_THRESHOLD_SQUARED: fph = 1e-12;

/// One row of the contact constraint system: the contact's normal direction
/// for basis index 0, or one of the friction tangent directions.
#[derive(Clone, Debug)]
pub struct DifferentiableContactConstraint {
    contact: Contact,
    basis_index: usize,
}

impl DifferentiableContactConstraint {
    /// Creates the constraint for the given basis direction, taking a value
    /// copy of the contact record.
    pub fn new(contact: Contact, basis_index: usize) -> Self {
        debug_assert!(basis_index < 3);
        Self {
            contact,
            basis_index,
        }
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn basis_index(&self) -> usize {
        self.basis_index
    }

    pub fn is_normal_row(&self) -> bool {
        self.basis_index == 0
    }

    /// The contact point in world coordinates.
    pub fn world_position(&self) -> Point3<fph> {
        self.contact.point
    }

    /// The contact normal, pointing from body B into body A.
    pub fn world_normal(&self) -> UnitVector3<fph> {
        self.contact.normal
    }

    /// The direction along which this row applies force to body A: the
    /// normal for basis index 0, otherwise the corresponding tangent-basis
    /// column for the current normal.
    pub fn force_direction(&self) -> Vector3<fph> {
        match self.basis_index {
            0 => self.contact.normal.into_inner(),
            index => {
                let (tangent, bitangent) = tangent_basis(&self.contact.normal);
                if index == 1 {
                    tangent.into_inner()
                } else {
                    bitangent.into_inner()
                }
            }
        }
    }

    /// The unit-magnitude wrench this row applies to body A: a pure force
    /// along the force direction acting at the contact point.
    pub fn world_force(&self) -> SpatialVector {
        SpatialVector::force_at_point(self.force_direction(), &self.contact.point)
    }

    /// The classification of the world-level coordinate against this
    /// constraint's contact.
    pub fn dof_contact_type(&self, kinematics: &WorldKinematics<'_>, flat: usize) -> DofContactType {
        dof_contact_type(kinematics.world(), &self.contact, flat)
    }

    /// The sign with which this row's force enters the generalized force on
    /// the given coordinate.
    pub fn force_multiple(&self, kinematics: &WorldKinematics<'_>, flat: usize) -> fph {
        force_multiple(kinematics.world(), &self.contact, flat)
    }

    /// The generalized force this row applies per unit impulse, across the
    /// whole world: the row of the contact Jacobian.
    pub fn generalized_force(&self, kinematics: &WorldKinematics<'_>) -> DVector<fph> {
        let force = self.world_force();
        let n = kinematics.dof_count();
        DVector::from_fn(n, |flat, _| {
            let multiple = self.force_multiple(kinematics, flat);
            if multiple == 0.0 {
                0.0
            } else {
                multiple * kinematics.world_screw(flat).dot(&force)
            }
        })
    }

    /// The generalized force restricted to one skeleton.
    pub fn generalized_force_on_skeleton(
        &self,
        kinematics: &WorldKinematics<'_>,
        skeleton: crate::skeleton::SkeletonID,
    ) -> DVector<fph> {
        let world = kinematics.world();
        let offset = world.dof_offset(skeleton);
        let count = world.skeleton(skeleton).dof_count();
        let full = self.generalized_force(kinematics);
        full.rows(offset, count).into_owned()
    }

    /// `∂(contact point)/∂q_wrt`.
    pub fn position_gradient(
        &self,
        kinematics: &WorldKinematics<'_>,
        wrt: usize,
    ) -> Vector3<fph> {
        let screw = kinematics.world_screw(wrt);
        match self.dof_contact_type(kinematics, wrt) {
            // The face plane moves tangentially under its own coordinates;
            // the contact point rides the vertex.
            DofContactType::None | DofContactType::Face | DofContactType::Unsupported => {
                Vector3::zeros()
            }
            DofContactType::Vertex
            | DofContactType::VertexFaceSelfCollision
            | DofContactType::EdgeEdgeSelfCollision => {
                screw.point_velocity(&self.contact.point)
            }
            DofContactType::EdgeA => {
                // Edge A is the far edge; edge B moves with the coordinate.
                let (edge_a, edge_b) = self.edges();
                let motion_b = edge_motion(screw, edge_b);
                line_closest_approach_gradient(
                    &edge_a.fixed_point,
                    edge_a.dir.as_ref(),
                    &edge_b.fixed_point,
                    edge_b.dir.as_ref(),
                    &LineMotion::stationary(),
                    &motion_b,
                )
            }
            DofContactType::EdgeB => {
                let (edge_a, edge_b) = self.edges();
                let motion_a = edge_motion(screw, edge_a);
                line_closest_approach_gradient(
                    &edge_a.fixed_point,
                    edge_a.dir.as_ref(),
                    &edge_b.fixed_point,
                    edge_b.dir.as_ref(),
                    &motion_a,
                    &LineMotion::stationary(),
                )
            }
        }
    }

    /// `∂(contact normal)/∂q_wrt`, projected to the normal's orthogonal
    /// complement so unit norm is preserved to first order.
    pub fn normal_gradient(&self, kinematics: &WorldKinematics<'_>, wrt: usize) -> Vector3<fph> {
        let screw = kinematics.world_screw(wrt);
        let normal = self.contact.normal.into_inner();
        match self.dof_contact_type(kinematics, wrt) {
            // The normal lives on the face side of a vertex-face pairing.
            DofContactType::None | DofContactType::Vertex | DofContactType::Unsupported => {
                Vector3::zeros()
            }
            DofContactType::Face
            | DofContactType::VertexFaceSelfCollision
            | DofContactType::EdgeEdgeSelfCollision => screw.angular.cross(&normal),
            DofContactType::EdgeA => {
                let (edge_a, edge_b) = self.edges();
                let cross_gradient = edge_a
                    .dir
                    .cross(&screw.angular.cross(&edge_b.dir));
                self.normalized_cross_gradient(edge_a, edge_b, &cross_gradient)
            }
            DofContactType::EdgeB => {
                let (edge_a, edge_b) = self.edges();
                let cross_gradient = screw
                    .angular
                    .cross(&edge_a.dir)
                    .cross(&edge_b.dir);
                self.normalized_cross_gradient(edge_a, edge_b, &cross_gradient)
            }
        }
    }

    /// `∂(force direction)/∂q_wrt`: the normal gradient for the normal row,
    /// otherwise propagated through the tangent basis.
    pub fn force_direction_gradient(
        &self,
        kinematics: &WorldKinematics<'_>,
        wrt: usize,
    ) -> Vector3<fph> {
        let normal_gradient = self.normal_gradient(kinematics, wrt);
        if self.basis_index == 0 {
            return normal_gradient;
        }
        if normal_gradient.norm_squared() < NORMAL_GRADIENT_THRESHOLD_SQUARED {
            return Vector3::zeros();
        }
        let (tangent_gradient, bitangent_gradient) =
            tangent_basis_gradient(&self.contact.normal, &normal_gradient);
        if self.basis_index == 1 {
            tangent_gradient
        } else {
            bitangent_gradient
        }
    }

    /// `∂(world force)/∂q_wrt`, by the product rule on
    /// `[point × dir; dir]`.
    pub fn world_force_gradient(
        &self,
        kinematics: &WorldKinematics<'_>,
        wrt: usize,
    ) -> SpatialVector {
        let position = self.contact.point;
        let direction = self.force_direction();
        let position_gradient = self.position_gradient(kinematics, wrt);
        let direction_gradient = self.force_direction_gradient(kinematics, wrt);
        SpatialVector::new(
            position_gradient.cross(&direction) + position.coords.cross(&direction_gradient),
            direction_gradient,
        )
    }

    /// `∂(generalized force)/∂q_wrt`: the column of this Jacobian row's
    /// derivative, with entry `d` given by
    /// `multiple(d) · (∂W_d/∂q_wrt · F + W_d · ∂F/∂q_wrt)`.
    pub fn generalized_force_gradient(
        &self,
        kinematics: &WorldKinematics<'_>,
        wrt: usize,
    ) -> DVector<fph> {
        let force = self.world_force();
        let force_gradient = self.world_force_gradient(kinematics, wrt);
        let n = kinematics.dof_count();
        DVector::from_fn(n, |flat, _| {
            let multiple = self.force_multiple(kinematics, flat);
            if multiple == 0.0 {
                0.0
            } else {
                let screw = kinematics.world_screw(flat);
                let screw_gradient = kinematics.screw_gradient(flat, wrt);
                multiple * (screw_gradient.dot(&force) + screw.dot(&force_gradient))
            }
        })
    }

    /// `∂(contact point)/∂q` over all world coordinates, as a 3×n matrix.
    pub fn position_jacobian(&self, kinematics: &WorldKinematics<'_>) -> DMatrix<fph> {
        self.stacked_columns(kinematics, |wrt| self.position_gradient(kinematics, wrt))
    }

    /// `∂(force direction)/∂q` over all world coordinates, as a 3×n matrix.
    pub fn force_direction_jacobian(&self, kinematics: &WorldKinematics<'_>) -> DMatrix<fph> {
        self.stacked_columns(kinematics, |wrt| {
            self.force_direction_gradient(kinematics, wrt)
        })
    }

    /// `∂(world force)/∂q` over all world coordinates, as a 6×n matrix in
    /// `[torque; force]` row order.
    pub fn world_force_jacobian(&self, kinematics: &WorldKinematics<'_>) -> DMatrix<fph> {
        let n = kinematics.dof_count();
        let mut jacobian = DMatrix::zeros(6, n);
        for wrt in 0..n {
            let gradient = self.world_force_gradient(kinematics, wrt);
            jacobian
                .view_mut((0, wrt), (6, 1))
                .copy_from(&gradient.to_vector6());
        }
        jacobian
    }

    /// `∂(generalized force)/∂q` as an n×n matrix whose column `wrt` is
    /// [`Self::generalized_force_gradient`].
    pub fn generalized_force_jacobian(&self, kinematics: &WorldKinematics<'_>) -> DMatrix<fph> {
        let n = kinematics.dof_count();
        let mut jacobian = DMatrix::zeros(n, n);
        for wrt in 0..n {
            jacobian.set_column(wrt, &self.generalized_force_gradient(kinematics, wrt));
        }
        jacobian
    }

    fn edges(&self) -> (&ContactEdge, &ContactEdge) {
        match &self.contact.kind {
            ContactKind::EdgeEdge { edge_a, edge_b } => (edge_a, edge_b),
            _ => unreachable!("Edge gradient dispatch requires an edge-edge contact"),
        }
    }

    /// Converts a gradient of the raw cross product `dA × dB` into the
    /// gradient of the stored unit normal, accounting for the orientation
    /// sign chosen at detection time.
    fn normalized_cross_gradient(
        &self,
        edge_a: &ContactEdge,
        edge_b: &ContactEdge,
        cross_gradient: &Vector3<fph>,
    ) -> Vector3<fph> {
        let raw = edge_a.dir.cross(&edge_b.dir);
        let norm = raw.norm();
        if norm < 1e-9 {
            return Vector3::zeros();
        }
        let normal = self.contact.normal.into_inner();
        let sign = if raw.dot(&normal) < 0.0 { -1.0 } else { 1.0 };
        let oriented = cross_gradient * sign;
        (oriented - normal * normal.dot(&oriented)) / norm
    }

    fn stacked_columns(
        &self,
        kinematics: &WorldKinematics<'_>,
        column: impl Fn(usize) -> Vector3<fph>,
    ) -> DMatrix<fph> {
        let n = kinematics.dof_count();
        let mut jacobian = DMatrix::zeros(3, n);
        for wrt in 0..n {
            jacobian.set_column(wrt, &column(wrt));
        }
        jacobian
    }
}

fn edge_motion(screw: &SpatialVector, edge: &ContactEdge) -> LineMotion {
    LineMotion::carried_by(
        &screw.angular,
        &screw.linear,
        &edge.fixed_point,
        edge.dir.as_ref(),
    )
}
