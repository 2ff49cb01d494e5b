//! Articulated skeletons: trees of rigid bodies connected by joints owning
//! degrees of freedom.
//!
//! Body frames are centered on the body's center of mass. A joint connects a
//! parent body (or the world) to its child body through a fixed transform to
//! the joint frame, a chain of one exponential factor per degree of freedom,
//! and a fixed transform to the child body frame. World velocity kinematics
//! are exact for this parameterization: the spatial velocity of a body is the
//! sum of its ancestor world screw axes scaled by their coordinate rates.

use crate::fph;
use adjoint_math::SpatialVector;
use anyhow::{Result, bail};
use nalgebra::{DVector, Isometry3, Matrix3, Translation3, Unit, UnitQuaternion, UnitVector3};

/// Identifier of a skeleton within a world, in registration order.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SkeletonID(pub u32);

/// Index of a body within its skeleton.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BodyIndex(pub u32);

/// Index of a joint within its skeleton.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JointIndex(pub u32);

/// Index of a degree of freedom within its skeleton, in registration order.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DofIndex(pub u32);

/// A tree of rigid bodies connected by joints.
#[derive(Clone, Debug)]
pub struct Skeleton {
    name: String,
    bodies: Vec<Body>,
    joints: Vec<Joint>,
    dofs: Vec<Dof>,
}

/// A rigid body in a skeleton. The body frame is centered on the center of
/// mass.
#[derive(Clone, Debug)]
pub struct Body {
    name: String,
    parent_joint: JointIndex,
    mass: fph,
    inertia_about_com: Matrix3<fph>,
}

/// A joint connecting a parent body (or the world) to a child body.
#[derive(Clone, Debug)]
pub struct Joint {
    name: String,
    parent_body: Option<BodyIndex>,
    child_body: BodyIndex,
    parent_transform: Isometry3<fph>,
    child_transform: Isometry3<fph>,
    kind: JointKind,
    first_dof: usize,
}

/// The motion subspace of a joint.
#[derive(Clone, Debug)]
pub enum JointKind {
    /// Rotation about an axis through the joint frame origin.
    Revolute { axis: UnitVector3<fph> },
    /// Translation along an axis of the joint frame.
    Prismatic { axis: UnitVector3<fph> },
    /// Six degrees of freedom: rotations about the joint frame x-, y- and
    /// z-axes followed by translations along them, each as one exponential
    /// factor.
    Free,
    /// A rigid weld owning no degrees of freedom.
    Fixed,
}

/// A single scalar degree of freedom with its constant joint-local screw axis
/// and its current state.
#[derive(Clone, Debug)]
pub struct Dof {
    joint: JointIndex,
    index_in_joint: usize,
    local_axis: SpatialVector,
    position: fph,
    velocity: fph,
    force: fph,
}

/// Mass and rotational inertia for a body, in the manner they are usually
/// specified when building models.
#[derive(Clone, Debug)]
pub struct InertialProperties {
    pub mass: fph,
    pub inertia_about_com: Matrix3<fph>,
}

impl InertialProperties {
    pub fn new(mass: fph, inertia_about_com: Matrix3<fph>) -> Self {
        Self {
            mass,
            inertia_about_com,
        }
    }

    /// Inertial properties of a homogeneous solid sphere.
    pub fn of_uniform_sphere(radius: fph, mass: fph) -> Self {
        let moment = 0.4 * mass * radius * radius;
        Self::new(mass, Matrix3::identity() * moment)
    }

    /// Inertial properties of a homogeneous box with the given full extents.
    pub fn of_uniform_box(extents: [fph; 3], mass: fph) -> Self {
        let [x, y, z] = extents;
        let factor = mass / 12.0;
        Self::new(
            mass,
            Matrix3::from_diagonal(&nalgebra::vector![
                factor * (y * y + z * z),
                factor * (x * x + z * z),
                factor * (x * x + y * y)
            ]),
        )
    }

    /// Inertial properties of a point mass (for test fixtures where rotational
    /// inertia should not matter).
    pub fn of_point_mass(mass: fph) -> Self {
        Self::new(mass, Matrix3::identity() * 1e-9)
    }
}

impl JointKind {
    pub fn dof_count(&self) -> usize {
        match self {
            Self::Revolute { .. } | Self::Prismatic { .. } => 1,
            Self::Free => 6,
            Self::Fixed => 0,
        }
    }

    fn local_axis(&self, index_in_joint: usize) -> SpatialVector {
        match self {
            Self::Revolute { axis } => SpatialVector::rotation(axis.into_inner()),
            Self::Prismatic { axis } => SpatialVector::translation(axis.into_inner()),
            Self::Fixed => unreachable!("Fixed joints own no degrees of freedom"),
            Self::Free => {
                let unit = |i: usize| match i {
                    0 => nalgebra::Vector3::x(),
                    1 => nalgebra::Vector3::y(),
                    _ => nalgebra::Vector3::z(),
                };
                if index_in_joint < 3 {
                    SpatialVector::rotation(unit(index_in_joint))
                } else {
                    SpatialVector::translation(unit(index_in_joint - 3))
                }
            }
        }
    }
}

impl Skeleton {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bodies: Vec::new(),
            joints: Vec::new(),
            dofs: Vec::new(),
        }
    }

    /// Attaches a new body to the skeleton through a new joint.
    ///
    /// `parent` is the body the joint hangs off, or [`None`] for a root joint
    /// attached to the world. `parent_transform` maps the parent body frame
    /// (or the world frame) to the joint frame at zero joint coordinates, and
    /// `child_transform` maps the moved joint frame to the child body frame.
    pub fn attach_body(
        &mut self,
        parent: Option<BodyIndex>,
        joint_name: impl Into<String>,
        kind: JointKind,
        parent_transform: Isometry3<fph>,
        child_transform: Isometry3<fph>,
        body_name: impl Into<String>,
        inertial_properties: InertialProperties,
    ) -> Result<BodyIndex> {
        if let Some(parent) = parent {
            if parent.0 as usize >= self.bodies.len() {
                bail!("Parent body {} does not exist", parent.0);
            }
        }
        if !(inertial_properties.mass.is_finite() && inertial_properties.mass > 0.0) {
            bail!("Body mass must be positive and finite");
        }

        let body_index = BodyIndex(self.bodies.len() as u32);
        let joint_index = JointIndex(self.joints.len() as u32);
        let first_dof = self.dofs.len();

        for index_in_joint in 0..kind.dof_count() {
            self.dofs.push(Dof {
                joint: joint_index,
                index_in_joint,
                local_axis: kind.local_axis(index_in_joint),
                position: 0.0,
                velocity: 0.0,
                force: 0.0,
            });
        }

        self.joints.push(Joint {
            name: joint_name.into(),
            parent_body: parent,
            child_body: body_index,
            parent_transform,
            child_transform,
            kind,
            first_dof,
        });

        self.bodies.push(Body {
            name: body_name.into(),
            parent_joint: joint_index,
            mass: inertial_properties.mass,
            inertia_about_com: inertial_properties.inertia_about_com,
        });

        Ok(body_index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn dof_count(&self) -> usize {
        self.dofs.len()
    }

    /// Returns the body with the given index.
    ///
    /// # Panics
    /// If the index is out of bounds.
    pub fn body(&self, index: BodyIndex) -> &Body {
        &self.bodies[index.0 as usize]
    }

    /// Returns the joint with the given index.
    ///
    /// # Panics
    /// If the index is out of bounds.
    pub fn joint(&self, index: JointIndex) -> &Joint {
        &self.joints[index.0 as usize]
    }

    /// Returns the degree of freedom with the given index.
    ///
    /// # Panics
    /// If the index is out of bounds.
    pub fn dof(&self, index: DofIndex) -> &Dof {
        &self.dofs[index.0 as usize]
    }

    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn dofs(&self) -> &[Dof] {
        &self.dofs
    }

    /// Whether the given degree of freedom supports the given body, that is,
    /// whether the walk from the body to the root passes through the degree
    /// of freedom's joint.
    pub fn dof_is_ancestor_of_body(&self, dof: DofIndex, body: BodyIndex) -> bool {
        let dof_joint = self.dofs[dof.0 as usize].joint;
        let mut current = Some(body);
        while let Some(body_index) = current {
            let joint_index = self.bodies[body_index.0 as usize].parent_joint;
            if joint_index == dof_joint {
                return true;
            }
            current = self.joints[joint_index.0 as usize].parent_body;
        }
        false
    }

    /// Whether perturbing `wrt` moves the world screw axis or frame of `dof`.
    /// Within a joint, a degree of freedom is influenced by the earlier ones
    /// in the exponential chain (and trivially by itself).
    pub fn dof_influences_dof(&self, wrt: DofIndex, dof: DofIndex) -> bool {
        let wrt_joint = self.dofs[wrt.0 as usize].joint;
        let dof_joint = self.dofs[dof.0 as usize].joint;
        if wrt_joint == dof_joint {
            return self.dofs[wrt.0 as usize].index_in_joint
                <= self.dofs[dof.0 as usize].index_in_joint;
        }
        let parent = self.joints[dof_joint.0 as usize].parent_body;
        match parent {
            Some(parent) => self.dof_is_ancestor_of_body(wrt, parent),
            None => false,
        }
    }

    /// The degrees of freedom of the given joint, in chain order.
    pub fn joint_dofs(&self, joint: JointIndex) -> impl Iterator<Item = DofIndex> + '_ {
        let joint_ref = &self.joints[joint.0 as usize];
        (joint_ref.first_dof..joint_ref.first_dof + joint_ref.kind.dof_count())
            .map(|i| DofIndex(i as u32))
    }

    pub fn positions(&self) -> DVector<fph> {
        DVector::from_iterator(self.dofs.len(), self.dofs.iter().map(|dof| dof.position))
    }

    pub fn velocities(&self) -> DVector<fph> {
        DVector::from_iterator(self.dofs.len(), self.dofs.iter().map(|dof| dof.velocity))
    }

    pub fn external_forces(&self) -> DVector<fph> {
        DVector::from_iterator(self.dofs.len(), self.dofs.iter().map(|dof| dof.force))
    }

    /// Sets all generalized positions.
    ///
    /// # Panics
    /// If the vector length does not match the number of degrees of freedom.
    pub fn set_positions(&mut self, positions: &DVector<fph>) {
        assert_eq!(positions.len(), self.dofs.len());
        for (dof, &position) in self.dofs.iter_mut().zip(positions.iter()) {
            dof.position = position;
        }
    }

    /// Sets all generalized velocities.
    ///
    /// # Panics
    /// If the vector length does not match the number of degrees of freedom.
    pub fn set_velocities(&mut self, velocities: &DVector<fph>) {
        assert_eq!(velocities.len(), self.dofs.len());
        for (dof, &velocity) in self.dofs.iter_mut().zip(velocities.iter()) {
            dof.velocity = velocity;
        }
    }

    /// Sets all generalized external forces. Forces persist until changed.
    ///
    /// # Panics
    /// If the vector length does not match the number of degrees of freedom.
    pub fn set_external_forces(&mut self, forces: &DVector<fph>) {
        assert_eq!(forces.len(), self.dofs.len());
        for (dof, &force) in self.dofs.iter_mut().zip(forces.iter()) {
            dof.force = force;
        }
    }

    pub fn set_position(&mut self, dof: DofIndex, position: fph) {
        self.dofs[dof.0 as usize].position = position;
    }

    pub fn set_velocity(&mut self, dof: DofIndex, velocity: fph) {
        self.dofs[dof.0 as usize].velocity = velocity;
    }

    pub fn set_external_force(&mut self, dof: DofIndex, force: fph) {
        self.dofs[dof.0 as usize].force = force;
    }
}

impl Body {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_joint(&self) -> JointIndex {
        self.parent_joint
    }

    pub fn mass(&self) -> fph {
        self.mass
    }

    pub fn inertia_about_com(&self) -> &Matrix3<fph> {
        &self.inertia_about_com
    }
}

impl Joint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_body(&self) -> Option<BodyIndex> {
        self.parent_body
    }

    pub fn child_body(&self) -> BodyIndex {
        self.child_body
    }

    pub fn parent_transform(&self) -> &Isometry3<fph> {
        &self.parent_transform
    }

    pub fn child_transform(&self) -> &Isometry3<fph> {
        &self.child_transform
    }

    pub fn kind(&self) -> &JointKind {
        &self.kind
    }

    pub fn first_dof(&self) -> usize {
        self.first_dof
    }
}

impl Dof {
    pub fn joint(&self) -> JointIndex {
        self.joint
    }

    pub fn index_in_joint(&self) -> usize {
        self.index_in_joint
    }

    pub fn local_axis(&self) -> &SpatialVector {
        &self.local_axis
    }

    pub fn position(&self) -> fph {
        self.position
    }

    pub fn velocity(&self) -> fph {
        self.velocity
    }

    pub fn force(&self) -> fph {
        self.force
    }

    /// The rigid motion contributed by this degree of freedom at its current
    /// position, in the frame the axis is expressed in.
    pub fn motion(&self) -> Isometry3<fph> {
        dof_motion(&self.local_axis, self.position)
    }
}

/// The exponential of a pure-rotation or pure-translation screw axis scaled by
/// the coordinate.
pub fn dof_motion(local_axis: &SpatialVector, position: fph) -> Isometry3<fph> {
    if local_axis.angular.norm_squared() > 0.0 {
        debug_assert!(local_axis.linear.norm_squared() == 0.0);
        Isometry3::from_parts(
            Translation3::identity(),
            UnitQuaternion::from_axis_angle(
                &Unit::new_unchecked(local_axis.angular),
                position,
            ),
        )
    } else {
        Isometry3::translation(
            local_axis.linear.x * position,
            local_axis.linear.y * position,
            local_axis.linear.z * position,
        )
    }
}
