//! Backprop snapshots: the bundle of analytical Jacobians relating the state
//! after a step to the state before it.
//!
//! A snapshot is recorded by [`World::step_recorded`] at a step boundary and
//! is immutable afterwards. Jacobian queries restore the world to the
//! pre-step state (through a [`RestorableSnapshot`]), evaluate against the
//! frozen kinematics, and put the world back, so a snapshot can be queried at
//! any later time as long as the world's structure is unchanged.
//!
//! With `A_c` the clamping columns of `Jᵀ`, `A_ub` the upper-bounded
//! columns, `E` the friction-bound coupling, `Q = A_c + A_ub E`, and
//! `K = A_cᵀ M⁻¹ Q`, the semi-implicit step
//!
//! ```text
//! q̇⁺ = q̇* + M⁻¹ Q f_c,   q⁺ = q + Δt q̇⁺,   K f_c = −(A_cᵀ q̇* − r)
//! ```
//!
//! differentiates implicitly under the stable-active-set assumption; at
//! active-set boundaries the result is the one-sided derivative.

use crate::{
    constraint::differentiable::DifferentiableContactConstraint,
    fph,
    lcp::ConstraintRegime,
    skeleton::SkeletonID,
    snapshot::RestorableSnapshot,
    world::{PlannedStep, World, WorldKinematics},
};
use bitflags::bitflags;
use nalgebra::{DMatrix, DVector};

bitflags! {
    /// Conditions under which a snapshot's Jacobians are defined but not
    /// exact.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SnapshotFlags: u8 {
        /// The LCP solve failed and the step fell back to the previous
        /// step's impulses.
        const DEGRADED = 1 << 0;
        /// Some constraint rows have unsupported contact geometry; their
        /// contributions to ∂J/∂q are zero.
        const HAS_UNSUPPORTED_ROWS = 1 << 1;
    }
}

/// Everything captured at a step boundary that is needed to reconstruct the
/// step's Jacobians.
#[derive(Clone, Debug)]
pub struct BackpropSnapshot {
    time_step: fph,
    pre_positions: DVector<fph>,
    pre_velocities: DVector<fph>,
    pre_forces: DVector<fph>,
    pre_constraint_velocities: DVector<fph>,
    post_positions: DVector<fph>,
    post_velocities: DVector<fph>,
    mass_matrix: DMatrix<fph>,
    inverse_mass_matrix: DMatrix<fph>,
    constraints: Vec<DifferentiableContactConstraint>,
    jacobian: DMatrix<fph>,
    findex: Vec<Option<usize>>,
    restitution_targets: DVector<fph>,
    impulses: DVector<fph>,
    regimes: Vec<ConstraintRegime>,
    flags: SnapshotFlags,
    unsupported_rows: Vec<usize>,
}

impl BackpropSnapshot {
    pub(crate) fn from_planned_step(planned: PlannedStep) -> Self {
        Self {
            time_step: planned.time_step,
            pre_positions: planned.pre_positions,
            pre_velocities: planned.pre_velocities,
            pre_forces: planned.pre_forces,
            pre_constraint_velocities: planned.pre_constraint_velocities,
            post_positions: planned.post_positions,
            post_velocities: planned.post_velocities,
            mass_matrix: planned.mass_matrix,
            inverse_mass_matrix: planned.inverse_mass_matrix,
            constraints: planned.constraints,
            jacobian: planned.jacobian,
            findex: planned.findex,
            restitution_targets: planned.restitution_targets,
            impulses: planned.impulses,
            regimes: planned.regimes,
            flags: planned.flags,
            unsupported_rows: planned.unsupported_rows,
        }
    }

    pub fn time_step(&self) -> fph {
        self.time_step
    }

    pub fn flags(&self) -> SnapshotFlags {
        self.flags
    }

    pub fn is_degraded(&self) -> bool {
        self.flags.contains(SnapshotFlags::DEGRADED)
    }

    /// Constraint rows whose gradients are suppressed because their contact
    /// geometry is unsupported.
    pub fn unsupported_rows(&self) -> &[usize] {
        &self.unsupported_rows
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    pub fn constraints(&self) -> &[DifferentiableContactConstraint] {
        &self.constraints
    }

    pub fn constraint(&self, row: usize) -> &DifferentiableContactConstraint {
        &self.constraints[row]
    }

    pub fn regimes(&self) -> &[ConstraintRegime] {
        &self.regimes
    }

    pub fn impulses(&self) -> &DVector<fph> {
        &self.impulses
    }

    pub fn pre_positions(&self) -> &DVector<fph> {
        &self.pre_positions
    }

    pub fn pre_velocities(&self) -> &DVector<fph> {
        &self.pre_velocities
    }

    /// The unconstrained post-force velocity `q̇*`.
    pub fn pre_constraint_velocities(&self) -> &DVector<fph> {
        &self.pre_constraint_velocities
    }

    pub fn post_positions(&self) -> &DVector<fph> {
        &self.post_positions
    }

    pub fn post_velocities(&self) -> &DVector<fph> {
        &self.post_velocities
    }

    pub fn mass_matrix(&self) -> &DMatrix<fph> {
        &self.mass_matrix
    }

    pub fn inverse_mass_matrix(&self) -> &DMatrix<fph> {
        &self.inverse_mass_matrix
    }

    /// The contact Jacobian: one generalized-force row per constraint.
    pub fn contact_jacobian(&self) -> &DMatrix<fph> {
        &self.jacobian
    }

    /// The total generalized constraint force applied over the step
    /// (impulses divided by the step duration).
    pub fn constraint_forces(&self) -> DVector<fph> {
        (self.jacobian.transpose() * &self.impulses) / self.time_step
    }

    /// The generalized constraint force restricted to one skeleton.
    pub fn constraint_forces_for_skeleton(
        &self,
        world: &World,
        skeleton: SkeletonID,
    ) -> DVector<fph> {
        let offset = world.dof_offset(skeleton);
        let count = world.skeleton(skeleton).dof_count();
        self.constraint_forces().rows(offset, count).into_owned()
    }

    /// `∂q̇⁺/∂q̇`.
    pub fn vel_vel_jacobian(&self, world: &mut World) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            let context = snapshot.gradient_context(kinematics);
            let velocity_map = snapshot.unconstrained_velocity_map(kinematics);

            if context.clamping.is_empty() {
                return velocity_map;
            }

            // ∂b_c/∂q̇ through q̇* and the restitution targets.
            let mut offset_gradient = context.a_c.transpose() * &velocity_map;
            for (position, &row) in context.clamping.iter().enumerate() {
                if snapshot.restitution_targets[row] > 0.0 {
                    let restitution = snapshot.constraints[row]
                        .contact()
                        .response
                        .restitution_coef;
                    let mut current = offset_gradient.row(position).into_owned();
                    current += snapshot.jacobian.row(row) * restitution;
                    offset_gradient.row_mut(position).copy_from(&current);
                }
            }

            let impulse_gradient = -(&context.k_inverse * offset_gradient);
            velocity_map
                + &snapshot.inverse_mass_matrix * (&context.q * impulse_gradient)
        })
    }

    /// `∂q̇⁺/∂τ`.
    pub fn force_vel_jacobian(&self, world: &mut World) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            let context = snapshot.gradient_context(kinematics);
            let force_map = snapshot.time_step * &snapshot.inverse_mass_matrix;

            if context.clamping.is_empty() {
                return force_map;
            }

            let impulse_gradient =
                -(&context.k_inverse * (context.a_c.transpose() * &force_map));
            force_map + &snapshot.inverse_mass_matrix * (&context.q * impulse_gradient)
        })
    }

    /// `∂q̇⁺/∂q`, through the mass matrix, the bias forces, the contact
    /// Jacobian rows, and the implicitly differentiated clamping impulses.
    pub fn pos_vel_jacobian(&self, world: &mut World) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            let n = kinematics.dof_count();
            let context = snapshot.gradient_context(kinematics);

            let bias = kinematics.bias_forces();
            let bias_position_gradient = kinematics.bias_forces_position_gradient();
            let applied = &snapshot.pre_forces - &bias;

            let mut result = DMatrix::zeros(n, n);
            for wrt in 0..n {
                let inverse_mass_gradient = kinematics.inverse_mass_matrix_gradient(wrt);

                // ∂q̇*/∂q_wrt.
                let velocity_star_gradient = snapshot.time_step
                    * (&inverse_mass_gradient * &applied
                        - &snapshot.inverse_mass_matrix
                            * bias_position_gradient.column(wrt).into_owned());

                let mut column = velocity_star_gradient.clone();

                if !context.clamping.is_empty() {
                    let a_c_gradient =
                        snapshot.stacked_force_gradients(kinematics, &context.clamping, wrt);
                    let a_ub_gradient =
                        snapshot.stacked_force_gradients(kinematics, &context.upper_bound, wrt);
                    let q_gradient = &a_c_gradient + &a_ub_gradient * &context.e;

                    let k_gradient = a_c_gradient.transpose()
                        * &snapshot.inverse_mass_matrix
                        * &context.q
                        + context.a_c.transpose() * &inverse_mass_gradient * &context.q
                        + context.a_c.transpose()
                            * &snapshot.inverse_mass_matrix
                            * &q_gradient;

                    // ∂b_c/∂q_wrt; the restitution target depends on q only
                    // through the Jacobian row applied to the (fixed)
                    // pre-step velocities.
                    let mut offset_gradient = a_c_gradient.transpose()
                        * &snapshot.pre_constraint_velocities
                        + context.a_c.transpose() * &velocity_star_gradient;
                    for (position, &row) in context.clamping.iter().enumerate() {
                        if snapshot.restitution_targets[row] > 0.0 {
                            let restitution = snapshot.constraints[row]
                                .contact()
                                .response
                                .restitution_coef;
                            let row_gradient = snapshot.constraints[row]
                                .generalized_force_gradient(kinematics, wrt);
                            offset_gradient[position] +=
                                restitution * row_gradient.dot(&snapshot.pre_velocities);
                        }
                    }

                    let impulse_gradient = -(&context.k_inverse
                        * (&k_gradient * &context.f_c + offset_gradient));

                    column += &inverse_mass_gradient * (&context.q * &context.f_c)
                        + &snapshot.inverse_mass_matrix * (&q_gradient * &context.f_c)
                        + &snapshot.inverse_mass_matrix * (&context.q * impulse_gradient);
                }

                result.set_column(wrt, &column);
            }
            result
        })
    }

    /// `∂q⁺/∂q = I + Δt · ∂q̇⁺/∂q`.
    pub fn pos_pos_jacobian(&self, world: &mut World) -> DMatrix<fph> {
        let n = self.pre_positions.len();
        DMatrix::identity(n, n) + self.time_step * self.pos_vel_jacobian(world)
    }

    /// `∂q⁺/∂q̇ = Δt · ∂q̇⁺/∂q̇`.
    pub fn vel_pos_jacobian(&self, world: &mut World) -> DMatrix<fph> {
        self.time_step * self.vel_vel_jacobian(world)
    }

    /// The full-state transition Jacobian of this step: the `2n × 2n` matrix
    /// relating `[q⁺; q̇⁺]` to `[q; q̇]`, assembled from the four
    /// position/velocity blocks.
    pub fn state_transition_jacobian(&self, world: &mut World) -> DMatrix<fph> {
        let n = self.pre_positions.len();
        let mut matrix = DMatrix::zeros(2 * n, 2 * n);
        matrix
            .view_mut((0, 0), (n, n))
            .copy_from(&self.pos_pos_jacobian(world));
        matrix
            .view_mut((0, n), (n, n))
            .copy_from(&self.vel_pos_jacobian(world));
        matrix
            .view_mut((n, 0), (n, n))
            .copy_from(&self.pos_vel_jacobian(world));
        matrix
            .view_mut((n, n), (n, n))
            .copy_from(&self.vel_vel_jacobian(world));
        matrix
    }

    /// `∂f/∂q` for the full impulse vector: implicitly differentiated
    /// clamping impulses, coupled upper-bound impulses, zero rows elsewhere.
    pub fn constraint_impulses_position_jacobian(&self, world: &mut World) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            let n = kinematics.dof_count();
            let rows = snapshot.constraints.len();
            let context = snapshot.gradient_context(kinematics);
            let mut result = DMatrix::zeros(rows, n);

            if context.clamping.is_empty() {
                return result;
            }

            let bias = kinematics.bias_forces();
            let bias_position_gradient = kinematics.bias_forces_position_gradient();
            let applied = &snapshot.pre_forces - &bias;

            for wrt in 0..n {
                let inverse_mass_gradient = kinematics.inverse_mass_matrix_gradient(wrt);
                let velocity_star_gradient = snapshot.time_step
                    * (&inverse_mass_gradient * &applied
                        - &snapshot.inverse_mass_matrix
                            * bias_position_gradient.column(wrt).into_owned());

                let a_c_gradient =
                    snapshot.stacked_force_gradients(kinematics, &context.clamping, wrt);
                let a_ub_gradient =
                    snapshot.stacked_force_gradients(kinematics, &context.upper_bound, wrt);
                let q_gradient = &a_c_gradient + &a_ub_gradient * &context.e;

                let k_gradient = a_c_gradient.transpose()
                    * &snapshot.inverse_mass_matrix
                    * &context.q
                    + context.a_c.transpose() * &inverse_mass_gradient * &context.q
                    + context.a_c.transpose() * &snapshot.inverse_mass_matrix * &q_gradient;

                let mut offset_gradient = a_c_gradient.transpose()
                    * &snapshot.pre_constraint_velocities
                    + context.a_c.transpose() * &velocity_star_gradient;
                for (position, &row) in context.clamping.iter().enumerate() {
                    if snapshot.restitution_targets[row] > 0.0 {
                        let restitution = snapshot.constraints[row]
                            .contact()
                            .response
                            .restitution_coef;
                        let row_gradient = snapshot.constraints[row]
                            .generalized_force_gradient(kinematics, wrt);
                        offset_gradient[position] +=
                            restitution * row_gradient.dot(&snapshot.pre_velocities);
                    }
                }

                let clamping_impulse_gradient =
                    -(&context.k_inverse * (&k_gradient * &context.f_c + offset_gradient));
                let upper_bound_impulse_gradient = &context.e * &clamping_impulse_gradient;

                for (position, &row) in context.clamping.iter().enumerate() {
                    result[(row, wrt)] = clamping_impulse_gradient[position];
                }
                for (position, &row) in context.upper_bound.iter().enumerate() {
                    result[(row, wrt)] = upper_bound_impulse_gradient[position];
                }
            }
            result
        })
    }

    /// `∂(contact point)/∂q` for one constraint row, as a 3×n matrix.
    pub fn contact_position_jacobian(&self, world: &mut World, row: usize) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            snapshot.constraints[row].position_jacobian(kinematics)
        })
    }

    /// `∂(force direction)/∂q` for one constraint row, as a 3×n matrix.
    pub fn contact_force_direction_jacobian(
        &self,
        world: &mut World,
        row: usize,
    ) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            snapshot.constraints[row].force_direction_jacobian(kinematics)
        })
    }

    /// `∂(world force)/∂q` for one constraint row, as a 6×n matrix.
    pub fn contact_force_jacobian(&self, world: &mut World, row: usize) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            snapshot.constraints[row].world_force_jacobian(kinematics)
        })
    }

    /// `∂(generalized force direction)/∂q` for one constraint row, as an
    /// n×n matrix.
    pub fn constraint_force_direction_jacobian(
        &self,
        world: &mut World,
        row: usize,
    ) -> DMatrix<fph> {
        self.with_pre_step_world(world, |snapshot, kinematics| {
            snapshot.constraints[row].generalized_force_jacobian(kinematics)
        })
    }

    /// Restores the world to the snapshot's pre-step state, evaluates
    /// `operation` against the frozen kinematics, and puts the world back.
    ///
    /// # Panics
    /// If the world's degree-of-freedom count changed since the snapshot was
    /// recorded.
    fn with_pre_step_world<R>(
        &self,
        world: &mut World,
        operation: impl FnOnce(&Self, &WorldKinematics<'_>) -> R,
    ) -> R {
        assert_eq!(
            world.dof_count(),
            self.pre_positions.len(),
            "World structure changed since the snapshot was recorded"
        );
        let saved = RestorableSnapshot::capture(world);
        world.set_positions(&self.pre_positions);
        world.set_velocities(&self.pre_velocities);
        world.set_external_forces(&self.pre_forces);

        let result = {
            let kinematics = world.kinematics();
            operation(self, &kinematics)
        };

        saved.restore(world);
        result
    }

    /// `∂q̇*/∂q̇ = I − Δt M⁻¹ ∂C/∂q̇`.
    fn unconstrained_velocity_map(&self, kinematics: &WorldKinematics<'_>) -> DMatrix<fph> {
        let n = kinematics.dof_count();
        DMatrix::identity(n, n)
            - self.time_step
                * (&self.inverse_mass_matrix * kinematics.bias_forces_velocity_gradient())
    }

    fn gradient_context(&self, kinematics: &WorldKinematics<'_>) -> GradientContext {
        let n = kinematics.dof_count();

        let clamping: Vec<usize> = (0..self.constraints.len())
            .filter(|&row| self.regimes[row] == ConstraintRegime::Clamping)
            .collect();
        let upper_bound: Vec<usize> = (0..self.constraints.len())
            .filter(|&row| self.regimes[row] == ConstraintRegime::UpperBound)
            .collect();

        let gather = |rows: &[usize]| -> DMatrix<fph> {
            let mut matrix = DMatrix::zeros(n, rows.len());
            for (position, &row) in rows.iter().enumerate() {
                matrix.set_column(position, &self.jacobian.row(row).transpose());
            }
            matrix
        };

        let a_c = gather(&clamping);
        let a_ub = gather(&upper_bound);

        // E couples each saturated friction row to its clamping normal row:
        // the saturated impulse is ±µ times the normal impulse.
        let mut e = DMatrix::zeros(upper_bound.len(), clamping.len());
        for (position, &row) in upper_bound.iter().enumerate() {
            let normal_row = self.findex[row]
                .expect("Upper-bounded rows must be friction rows with a coupled normal");
            if let Some(normal_position) = clamping.iter().position(|&c| c == normal_row) {
                let friction_coef = self.constraints[row].contact().response.friction_coef;
                let sign = if self.impulses[row] < 0.0 { -1.0 } else { 1.0 };
                e[(position, normal_position)] = sign * friction_coef;
            }
        }

        let q = &a_c + &a_ub * &e;
        let k = a_c.transpose() * &self.inverse_mass_matrix * &q;
        let k_inverse = invert_active_set_matrix(k);

        let f_c = DVector::from_iterator(
            clamping.len(),
            clamping.iter().map(|&row| self.impulses[row]),
        );

        GradientContext {
            clamping,
            upper_bound,
            a_c,
            e,
            q,
            k_inverse,
            f_c,
        }
    }

    /// Stacks `∂(J row)/∂q_wrt` for the given rows into an n×|rows| matrix.
    /// Unsupported rows contribute zero columns.
    fn stacked_force_gradients(
        &self,
        kinematics: &WorldKinematics<'_>,
        rows: &[usize],
        wrt: usize,
    ) -> DMatrix<fph> {
        let n = kinematics.dof_count();
        let mut matrix = DMatrix::zeros(n, rows.len());
        for (position, &row) in rows.iter().enumerate() {
            matrix.set_column(
                position,
                &self.constraints[row].generalized_force_gradient(kinematics, wrt),
            );
        }
        matrix
    }
}

/// The active-set quantities shared by every Jacobian assembly.
struct GradientContext {
    clamping: Vec<usize>,
    upper_bound: Vec<usize>,
    a_c: DMatrix<fph>,
    e: DMatrix<fph>,
    q: DMatrix<fph>,
    k_inverse: DMatrix<fph>,
    f_c: DVector<fph>,
}

/// Chains the state-transition Jacobians of consecutive recorded steps into
/// the Jacobian of the rollout's final state with respect to its start state.
/// Snapshots must be ordered from the earliest step to the latest.
pub fn chained_state_jacobian(
    snapshots: &[BackpropSnapshot],
    world: &mut World,
) -> DMatrix<fph> {
    let n = world.dof_count();
    let mut chained = DMatrix::identity(2 * n, 2 * n);
    for snapshot in snapshots {
        chained = snapshot.state_transition_jacobian(world) * chained;
    }
    chained
}

/// Inverts `K = A_cᵀ M⁻¹ Q`. At active-set boundary configurations `K` can
/// be singular; the pseudo-inverse then yields the one-sided derivative on
/// the attainable subspace.
fn invert_active_set_matrix(k: DMatrix<fph>) -> DMatrix<fph> {
    let size = k.nrows();
    match k.clone().try_inverse() {
        Some(inverse) => inverse,
        None => k
            .pseudo_inverse(1e-12)
            .unwrap_or_else(|_| DMatrix::zeros(size, size)),
    }
}
