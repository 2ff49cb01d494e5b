//! The articulated-body kinematics oracle.
//!
//! A [`Kinematics`] instance caches a forward pass over one skeleton at its
//! current generalized positions and velocities: body transforms, world screw
//! axes, spatial inertias, twists, and bias accelerations. From the cache it
//! answers for the mass matrix, the bias forces, and — the part the gradient
//! engine depends on — their analytical derivatives with respect to every
//! generalized coordinate and velocity.
//!
//! Everything is expressed in world coordinates with the at-origin screw
//! convention of [`adjoint_math::spatial`]. The key closed forms are
//! `∂W_row/∂q_wrt = ad(W_wrt, W_row)` for (inclusive) ancestor coordinates
//! and the inertia transport derivative `İ = −(ad_Wᵀ I + I ad_W)`.

use crate::{
    fph,
    skeleton::{BodyIndex, DofIndex, JointIndex, Skeleton},
};
use adjoint_math::{SpatialInertia, SpatialVector};
use nalgebra::{DMatrix, DVector, Isometry3, Matrix6, Point3, Vector3};

/// Cached forward kinematics for one skeleton at its current state.
#[derive(Debug)]
pub struct Kinematics<'a> {
    skeleton: &'a Skeleton,
    body_transforms: Vec<Isometry3<fph>>,
    body_twists: Vec<SpatialVector>,
    /// Per-body `Σ ad(V_pred, W) q̇` accumulated down the tree; the spatial
    /// acceleration of the body at zero generalized acceleration.
    body_bias_accelerations: Vec<SpatialVector>,
    body_inertias: Vec<SpatialInertia>,
    /// Composite spatial inertia of the subtree rooted at each body.
    composite_inertias: Vec<SpatialInertia>,
    world_screws: Vec<SpatialVector>,
    /// Twist of the chain prefix just before each degree of freedom.
    predecessor_twists: Vec<SpatialVector>,
}

impl<'a> Kinematics<'a> {
    /// Runs the forward pass over the skeleton at its current state.
    pub fn new(skeleton: &'a Skeleton) -> Self {
        let body_count = skeleton.body_count();
        let dof_count = skeleton.dof_count();

        let mut body_transforms = vec![Isometry3::identity(); body_count];
        let mut body_twists = vec![SpatialVector::zeros(); body_count];
        let mut body_bias_accelerations = vec![SpatialVector::zeros(); body_count];
        let mut body_inertias = vec![SpatialInertia::zeros(); body_count];
        let mut world_screws = vec![SpatialVector::zeros(); dof_count];
        let mut predecessor_twists = vec![SpatialVector::zeros(); dof_count];

        for (joint_idx, joint) in skeleton.joints().iter().enumerate() {
            let (mut transform, mut twist, mut bias_acceleration) = match joint.parent_body() {
                Some(parent) => {
                    let parent = parent.0 as usize;
                    (
                        body_transforms[parent],
                        body_twists[parent],
                        body_bias_accelerations[parent],
                    )
                }
                None => (
                    Isometry3::identity(),
                    SpatialVector::zeros(),
                    SpatialVector::zeros(),
                ),
            };
            transform *= *joint.parent_transform();

            for dof_index in skeleton.joint_dofs(JointIndex(joint_idx as u32)) {
                let dof = skeleton.dof(dof_index);
                let screw = dof.local_axis().transformed(&transform);

                predecessor_twists[dof_index.0 as usize] = twist;
                world_screws[dof_index.0 as usize] = screw;

                bias_acceleration += twist.ad(&screw) * dof.velocity();
                twist += screw * dof.velocity();
                transform *= dof.motion();
            }
            transform *= *joint.child_transform();

            let child = joint.child_body().0 as usize;
            let body = skeleton.body(joint.child_body());
            let rotation = *transform.rotation.to_rotation_matrix().matrix();
            body_inertias[child] = SpatialInertia::from_body(
                body.mass(),
                &(rotation * body.inertia_about_com() * rotation.transpose()),
                &Point3::from(transform.translation.vector),
            );
            body_transforms[child] = transform;
            body_twists[child] = twist;
            body_bias_accelerations[child] = bias_acceleration;
        }

        // Children have higher indices than their parents, so a reverse sweep
        // accumulates subtree composites.
        let mut composite_inertias = body_inertias.clone();
        for joint in skeleton.joints().iter().rev() {
            if let Some(parent) = joint.parent_body() {
                let child_composite = composite_inertias[joint.child_body().0 as usize];
                composite_inertias[parent.0 as usize].add_assign(&child_composite);
            }
        }

        Self {
            skeleton,
            body_transforms,
            body_twists,
            body_bias_accelerations,
            body_inertias,
            composite_inertias,
            world_screws,
            predecessor_twists,
        }
    }

    pub fn skeleton(&self) -> &Skeleton {
        self.skeleton
    }

    pub fn body_transform(&self, body: BodyIndex) -> &Isometry3<fph> {
        &self.body_transforms[body.0 as usize]
    }

    pub fn body_com(&self, body: BodyIndex) -> Point3<fph> {
        Point3::from(self.body_transforms[body.0 as usize].translation.vector)
    }

    pub fn body_twist(&self, body: BodyIndex) -> &SpatialVector {
        &self.body_twists[body.0 as usize]
    }

    /// The world screw axis of the given degree of freedom: the spatial
    /// velocity its child body gains per unit coordinate rate.
    pub fn world_screw(&self, dof: DofIndex) -> &SpatialVector {
        &self.world_screws[dof.0 as usize]
    }

    /// `∂W_row/∂q_wrt`: the Lie bracket `ad(W_wrt, W_row)` when `wrt`
    /// supports `row` in the kinematic chain, zero otherwise.
    pub fn screw_gradient(&self, row: DofIndex, wrt: DofIndex) -> SpatialVector {
        if self.skeleton.dof_influences_dof(wrt, row) {
            self.world_screws[wrt.0 as usize].ad(&self.world_screws[row.0 as usize])
        } else {
            SpatialVector::zeros()
        }
    }

    /// The mass matrix `M(q)`, assembled with the composite-rigid-body
    /// algorithm in world coordinates.
    pub fn mass_matrix(&self) -> DMatrix<fph> {
        let n = self.skeleton.dof_count();
        let mut m = DMatrix::zeros(n, n);
        for j in 0..n {
            let subtree = self.skeleton.joint(self.skeleton.dof(DofIndex(j as u32)).joint());
            let subtree_body = subtree.child_body();
            let f = self.composite_inertias[subtree_body.0 as usize]
                .apply(&self.world_screws[j]);
            for i in 0..n {
                if self
                    .skeleton
                    .dof_is_ancestor_of_body(DofIndex(i as u32), subtree_body)
                {
                    let value = self.world_screws[i].dot(&f);
                    m[(i, j)] = value;
                    m[(j, i)] = value;
                }
            }
        }
        m
    }

    /// The inverse mass matrix, via Cholesky factorization.
    ///
    /// # Panics
    /// If the mass matrix is not positive definite (degenerate inertial
    /// properties).
    pub fn inverse_mass_matrix(&self) -> DMatrix<fph> {
        self.mass_matrix()
            .cholesky()
            .expect("Mass matrix must be positive definite")
            .inverse()
    }

    /// The bias forces `C(q, q̇)` (Coriolis, centrifugal, and gravity), with
    /// the sign convention `M q̈ + C = τ`.
    pub fn bias_forces(&self, gravity: &Vector3<fph>) -> DVector<fph> {
        let subtree_wrenches = self.subtree_bias_wrenches(gravity);
        let n = self.skeleton.dof_count();
        DVector::from_fn(n, |i, _| {
            let subtree_body = self
                .skeleton
                .joint(self.skeleton.dof(DofIndex(i as u32)).joint())
                .child_body();
            self.world_screws[i].dot(&subtree_wrenches[subtree_body.0 as usize])
        })
    }

    /// Per-body bias wrenches accumulated over subtrees: entry `b` holds the
    /// total wrench the joint above `b` must transmit at zero generalized
    /// acceleration.
    fn subtree_bias_wrenches(&self, gravity: &Vector3<fph>) -> Vec<SpatialVector> {
        let mut wrenches: Vec<SpatialVector> = (0..self.skeleton.body_count())
            .map(|b| {
                let body = &self.skeleton.bodies()[b];
                let inertia = &self.body_inertias[b];
                let twist = &self.body_twists[b];
                let momentum = inertia.apply(twist);
                let momentum_rate = inertia.apply(&self.body_bias_accelerations[b])
                    - twist.ad_dual(&momentum);
                let gravity_wrench = SpatialVector::force_at_point(
                    gravity * body.mass(),
                    &Point3::from(self.body_transforms[b].translation.vector),
                );
                momentum_rate - gravity_wrench
            })
            .collect();

        for joint in self.skeleton.joints().iter().rev() {
            if let Some(parent) = joint.parent_body() {
                let child_wrench = wrenches[joint.child_body().0 as usize];
                wrenches[parent.0 as usize] += child_wrench;
            }
        }
        wrenches
    }

    /// `∂M/∂q_wrt`.
    pub fn mass_matrix_gradient(&self, wrt: DofIndex) -> DMatrix<fph> {
        let n = self.skeleton.dof_count();
        let w_wrt = self.world_screws[wrt.0 as usize];
        let wrt_child = self
            .skeleton
            .joint(self.skeleton.dof(wrt).joint())
            .child_body();

        // ∂I^C_b/∂q_wrt per body, in the three regimes: the whole subtree
        // moves, only the sub-subtree below `wrt` moves, or nothing moves.
        let transport = |inertia: &SpatialInertia| -> Matrix6<fph> {
            inertia.transport_derivative(&w_wrt)
        };
        let composite_gradients: Vec<Option<Matrix6<fph>>> = (0..self.skeleton.body_count())
            .map(|b| {
                let body = BodyIndex(b as u32);
                if self.skeleton.dof_is_ancestor_of_body(wrt, body) {
                    Some(transport(&self.composite_inertias[b]))
                } else if self.body_supports_body(body, wrt_child) {
                    Some(transport(&self.composite_inertias[wrt_child.0 as usize]))
                } else {
                    None
                }
            })
            .collect();

        let mut dm = DMatrix::zeros(n, n);
        for j in 0..n {
            let dof_j = DofIndex(j as u32);
            let subtree_body = self
                .skeleton
                .joint(self.skeleton.dof(dof_j).joint())
                .child_body();
            let composite = &self.composite_inertias[subtree_body.0 as usize];
            let w_j = self.world_screws[j];

            let mut df = match &composite_gradients[subtree_body.0 as usize] {
                Some(gradient) => SpatialVector::from_vector6(&(gradient * w_j.to_vector6())),
                None => SpatialVector::zeros(),
            };
            if self.skeleton.dof_influences_dof(wrt, dof_j) {
                df += composite.apply(&w_wrt.ad(&w_j));
            }
            let f = composite.apply(&w_j);

            for i in 0..n {
                let dof_i = DofIndex(i as u32);
                if !self.skeleton.dof_is_ancestor_of_body(dof_i, subtree_body) {
                    continue;
                }
                let mut value = self.world_screws[i].dot(&df);
                if self.skeleton.dof_influences_dof(wrt, dof_i) {
                    value += w_wrt.ad(&self.world_screws[i]).dot(&f);
                }
                dm[(i, j)] = value;
                dm[(j, i)] = value;
            }
        }
        dm
    }

    /// `∂M⁻¹/∂q_wrt = −M⁻¹ (∂M/∂q_wrt) M⁻¹`.
    pub fn inverse_mass_matrix_gradient(
        &self,
        wrt: DofIndex,
        inverse_mass_matrix: &DMatrix<fph>,
    ) -> DMatrix<fph> {
        -(inverse_mass_matrix * self.mass_matrix_gradient(wrt) * inverse_mass_matrix)
    }

    /// `∂C/∂q̇` as an `n × n` matrix (column `k` is the derivative with
    /// respect to `q̇_k`).
    pub fn bias_forces_velocity_gradient(&self) -> DMatrix<fph> {
        let n = self.skeleton.dof_count();
        let mut gradient = DMatrix::zeros(n, n);
        for k in 0..n {
            let column = self.bias_forces_velocity_gradient_column(DofIndex(k as u32));
            gradient.set_column(k, &column);
        }
        gradient
    }

    fn bias_forces_velocity_gradient_column(&self, wrt: DofIndex) -> DVector<fph> {
        let body_count = self.skeleton.body_count();

        // Differentiated forward sweep: d(V)/dq̇_wrt and d(A)/dq̇_wrt per
        // body, mirroring the accumulation in `new`.
        let mut twist_gradients = vec![SpatialVector::zeros(); body_count];
        let mut acceleration_gradients = vec![SpatialVector::zeros(); body_count];

        for (joint_idx, joint) in self.skeleton.joints().iter().enumerate() {
            let (mut twist_gradient, mut acceleration_gradient) = match joint.parent_body() {
                Some(parent) => (
                    twist_gradients[parent.0 as usize],
                    acceleration_gradients[parent.0 as usize],
                ),
                None => (SpatialVector::zeros(), SpatialVector::zeros()),
            };

            for dof_index in self.skeleton.joint_dofs(JointIndex(joint_idx as u32)) {
                let dof = self.skeleton.dof(dof_index);
                let screw = self.world_screws[dof_index.0 as usize];

                acceleration_gradient += twist_gradient.ad(&screw) * dof.velocity();
                if dof_index == wrt {
                    acceleration_gradient +=
                        self.predecessor_twists[dof_index.0 as usize].ad(&screw);
                    twist_gradient += screw;
                }
            }

            let child = joint.child_body().0 as usize;
            twist_gradients[child] = twist_gradient;
            acceleration_gradients[child] = acceleration_gradient;
        }

        let mut wrench_gradients: Vec<SpatialVector> = (0..body_count)
            .map(|b| {
                let inertia = &self.body_inertias[b];
                let twist = &self.body_twists[b];
                let momentum = inertia.apply(twist);
                let momentum_gradient = inertia.apply(&twist_gradients[b]);
                inertia.apply(&acceleration_gradients[b])
                    - twist_gradients[b].ad_dual(&momentum)
                    - twist.ad_dual(&momentum_gradient)
            })
            .collect();

        for joint in self.skeleton.joints().iter().rev() {
            if let Some(parent) = joint.parent_body() {
                let child_wrench = wrench_gradients[joint.child_body().0 as usize];
                wrench_gradients[parent.0 as usize] += child_wrench;
            }
        }

        let n = self.skeleton.dof_count();
        DVector::from_fn(n, |i, _| {
            let subtree_body = self
                .skeleton
                .joint(self.skeleton.dof(DofIndex(i as u32)).joint())
                .child_body();
            self.world_screws[i].dot(&wrench_gradients[subtree_body.0 as usize])
        })
    }

    /// `∂C/∂q` as an `n × n` matrix (column `k` is the derivative with
    /// respect to `q_k`).
    pub fn bias_forces_position_gradient(&self, gravity: &Vector3<fph>) -> DMatrix<fph> {
        let subtree_wrenches = self.subtree_bias_wrenches(gravity);
        let n = self.skeleton.dof_count();
        let mut gradient = DMatrix::zeros(n, n);
        for k in 0..n {
            let column = self.bias_forces_position_gradient_column(
                DofIndex(k as u32),
                gravity,
                &subtree_wrenches,
            );
            gradient.set_column(k, &column);
        }
        gradient
    }

    fn bias_forces_position_gradient_column(
        &self,
        wrt: DofIndex,
        gravity: &Vector3<fph>,
        subtree_wrenches: &[SpatialVector],
    ) -> DVector<fph> {
        let body_count = self.skeleton.body_count();
        let w_wrt = self.world_screws[wrt.0 as usize];

        // Differentiated forward sweep with respect to q_wrt.
        let mut twist_gradients = vec![SpatialVector::zeros(); body_count];
        let mut acceleration_gradients = vec![SpatialVector::zeros(); body_count];
        let mut screw_gradients = vec![SpatialVector::zeros(); self.skeleton.dof_count()];

        for (joint_idx, joint) in self.skeleton.joints().iter().enumerate() {
            let (mut twist_gradient, mut acceleration_gradient) = match joint.parent_body() {
                Some(parent) => (
                    twist_gradients[parent.0 as usize],
                    acceleration_gradients[parent.0 as usize],
                ),
                None => (SpatialVector::zeros(), SpatialVector::zeros()),
            };

            for dof_index in self.skeleton.joint_dofs(JointIndex(joint_idx as u32)) {
                let dof = self.skeleton.dof(dof_index);
                let screw = self.world_screws[dof_index.0 as usize];
                let screw_gradient = self.screw_gradient(dof_index, wrt);
                screw_gradients[dof_index.0 as usize] = screw_gradient;

                acceleration_gradient += twist_gradient.ad(&screw) * dof.velocity()
                    + self.predecessor_twists[dof_index.0 as usize].ad(&screw_gradient)
                        * dof.velocity();
                twist_gradient += screw_gradient * dof.velocity();
            }

            let child = joint.child_body().0 as usize;
            twist_gradients[child] = twist_gradient;
            acceleration_gradients[child] = acceleration_gradient;
        }

        let mut wrench_gradients: Vec<SpatialVector> = (0..body_count)
            .map(|b| {
                let body = &self.skeleton.bodies()[b];
                let inertia = &self.body_inertias[b];
                let twist = &self.body_twists[b];
                let moved = self.skeleton.dof_is_ancestor_of_body(wrt, BodyIndex(b as u32));

                // ∂I_b/∂q_wrt applied to a vector: the transport derivative
                // −(ad_wᵀ I x + I ad_w x) when the body moves with wrt.
                let inertia_gradient_apply = |x: &SpatialVector| -> SpatialVector {
                    if moved {
                        -(w_wrt.ad_dual(&inertia.apply(x)) + inertia.apply(&w_wrt.ad(x)))
                    } else {
                        SpatialVector::zeros()
                    }
                };

                let momentum = inertia.apply(twist);
                let momentum_gradient =
                    inertia_gradient_apply(twist) + inertia.apply(&twist_gradients[b]);

                let momentum_rate_gradient = inertia_gradient_apply(
                    &self.body_bias_accelerations[b],
                ) + inertia.apply(&acceleration_gradients[b])
                    - twist_gradients[b].ad_dual(&momentum)
                    - twist.ad_dual(&momentum_gradient);

                let gravity_wrench_gradient = if moved {
                    let com = Point3::from(self.body_transforms[b].translation.vector);
                    let com_velocity = w_wrt.point_velocity(&com);
                    SpatialVector::new(com_velocity.cross(&(gravity * body.mass())), Vector3::zeros())
                } else {
                    SpatialVector::zeros()
                };

                momentum_rate_gradient - gravity_wrench_gradient
            })
            .collect();

        for joint in self.skeleton.joints().iter().rev() {
            if let Some(parent) = joint.parent_body() {
                let child_wrench = wrench_gradients[joint.child_body().0 as usize];
                wrench_gradients[parent.0 as usize] += child_wrench;
            }
        }

        let n = self.skeleton.dof_count();
        DVector::from_fn(n, |i, _| {
            let subtree_body = self
                .skeleton
                .joint(self.skeleton.dof(DofIndex(i as u32)).joint())
                .child_body();
            let subtree_body = subtree_body.0 as usize;
            screw_gradients[i].dot(&subtree_wrenches[subtree_body])
                + self.world_screws[i].dot(&wrench_gradients[subtree_body])
        })
    }

    /// Whether `ancestor` lies on the walk from `descendant` to the root
    /// (inclusively).
    fn body_supports_body(&self, ancestor: BodyIndex, descendant: BodyIndex) -> bool {
        let mut current = Some(descendant);
        while let Some(body) = current {
            if body == ancestor {
                return true;
            }
            current = self
                .skeleton
                .joint(self.skeleton.body(body).parent_joint())
                .parent_body();
        }
        false
    }
}
