//! Worlds: ordered collections of skeletons advanced by a semi-implicit step
//! with LCP-resolved frictional contacts.

use crate::{
    backprop::{BackpropSnapshot, SnapshotFlags},
    collision::{CollisionOracle, ContactManifold},
    constraint::differentiable::DifferentiableContactConstraint,
    fph,
    kinematics::Kinematics,
    lcp::{BoxedLcpSolver, ConstraintRegime, PgsConfig, PgsSolver, classify_rows},
    skeleton::{BodyIndex, DofIndex, Skeleton, SkeletonID},
};
use adjoint_math::SpatialVector;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Isometry3, Vector3};

/// Tolerance used when classifying solved LCP rows against their bounds.
const REGIME_TOLERANCE: fph = 1e-9;

/// An ordered collection of skeletons with gravity, a time step, a collision
/// oracle, and a boxed LCP solver.
#[derive(Debug)]
pub struct World {
    skeletons: Vec<Skeleton>,
    dof_offsets: Vec<usize>,
    gravity: Vector3<fph>,
    time_step: fph,
    collision_oracle: Option<Box<dyn CollisionOracle>>,
    lcp_solver: Box<dyn BoxedLcpSolver>,
    /// Impulses from the previous step, used to warm-start the solver and as
    /// the fallback solution for degraded steps.
    warm_impulses: Option<DVector<fph>>,
}

/// What happened during a forward step, mirroring the flags a recorded
/// snapshot would carry.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub contact_count: usize,
    pub constraint_row_count: usize,
    /// The primary LCP solve failed and the fallback configuration was used.
    pub fallback_used: bool,
    /// Both solves failed; the previous step's impulses (or zero) were
    /// applied instead.
    pub degraded: bool,
    /// Constraint rows whose contacts have unsupported geometry; their
    /// gradients are suppressed.
    pub unsupported_rows: Vec<usize>,
}

impl World {
    pub fn new(gravity: Vector3<fph>, time_step: fph) -> Self {
        assert!(time_step > 0.0, "Time step must be positive");
        Self {
            skeletons: Vec::new(),
            dof_offsets: Vec::new(),
            gravity,
            time_step,
            collision_oracle: None,
            lcp_solver: Box::new(PgsSolver::default()),
            warm_impulses: None,
        }
    }

    pub fn gravity(&self) -> &Vector3<fph> {
        &self.gravity
    }

    pub fn time_step(&self) -> fph {
        self.time_step
    }

    /// Registers a skeleton; its degrees of freedom are appended to the
    /// world's flat coordinate vector in registration order.
    pub fn add_skeleton(&mut self, skeleton: Skeleton) -> SkeletonID {
        let id = SkeletonID(self.skeletons.len() as u32);
        let offset = self.dof_count();
        self.dof_offsets.push(offset);
        self.skeletons.push(skeleton);
        self.warm_impulses = None;
        id
    }

    pub fn set_collision_oracle(&mut self, oracle: Box<dyn CollisionOracle>) {
        self.collision_oracle = Some(oracle);
    }

    pub fn set_lcp_solver(&mut self, solver: Box<dyn BoxedLcpSolver>) {
        self.lcp_solver = solver;
    }

    pub fn skeleton_count(&self) -> usize {
        self.skeletons.len()
    }

    pub fn skeletons(&self) -> &[Skeleton] {
        &self.skeletons
    }

    /// Returns the skeleton with the given ID.
    ///
    /// # Panics
    /// If no skeleton with the ID exists.
    pub fn skeleton(&self, id: SkeletonID) -> &Skeleton {
        &self.skeletons[id.0 as usize]
    }

    /// Returns a mutable reference to the skeleton with the given ID.
    ///
    /// # Panics
    /// If no skeleton with the ID exists.
    pub fn skeleton_mut(&mut self, id: SkeletonID) -> &mut Skeleton {
        &mut self.skeletons[id.0 as usize]
    }

    pub fn skeleton_id_by_name(&self, name: &str) -> Option<SkeletonID> {
        self.skeletons
            .iter()
            .position(|skeleton| skeleton.name() == name)
            .map(|index| SkeletonID(index as u32))
    }

    /// Total number of degrees of freedom across all skeletons.
    pub fn dof_count(&self) -> usize {
        self.skeletons
            .iter()
            .map(|skeleton| skeleton.dof_count())
            .sum()
    }

    /// The world-level index of the first degree of freedom of the given
    /// skeleton.
    pub fn dof_offset(&self, id: SkeletonID) -> usize {
        self.dof_offsets[id.0 as usize]
    }

    /// Resolves a world-level coordinate index into its skeleton and local
    /// degree of freedom.
    ///
    /// # Panics
    /// If the index is out of bounds.
    pub fn dof_location(&self, flat: usize) -> (SkeletonID, DofIndex) {
        let mut remaining = flat;
        for (index, skeleton) in self.skeletons.iter().enumerate() {
            if remaining < skeleton.dof_count() {
                return (SkeletonID(index as u32), DofIndex(remaining as u32));
            }
            remaining -= skeleton.dof_count();
        }
        panic!("World coordinate index {flat} out of bounds");
    }

    pub fn positions(&self) -> DVector<fph> {
        self.concatenated(Skeleton::positions)
    }

    pub fn velocities(&self) -> DVector<fph> {
        self.concatenated(Skeleton::velocities)
    }

    pub fn external_forces(&self) -> DVector<fph> {
        self.concatenated(Skeleton::external_forces)
    }

    pub fn set_positions(&mut self, positions: &DVector<fph>) {
        self.scattered(positions, Skeleton::set_positions);
    }

    pub fn set_velocities(&mut self, velocities: &DVector<fph>) {
        self.scattered(velocities, Skeleton::set_velocities);
    }

    pub fn set_external_forces(&mut self, forces: &DVector<fph>) {
        self.scattered(forces, Skeleton::set_external_forces);
    }

    fn concatenated(&self, per_skeleton: impl Fn(&Skeleton) -> DVector<fph>) -> DVector<fph> {
        let mut result = DVector::zeros(self.dof_count());
        for (skeleton, &offset) in self.skeletons.iter().zip(&self.dof_offsets) {
            let values = per_skeleton(skeleton);
            result.rows_mut(offset, values.len()).copy_from(&values);
        }
        result
    }

    fn scattered(
        &mut self,
        values: &DVector<fph>,
        apply: impl Fn(&mut Skeleton, &DVector<fph>),
    ) {
        assert_eq!(values.len(), self.dof_count());
        for (skeleton, &offset) in self.skeletons.iter_mut().zip(&self.dof_offsets) {
            let slice = values.rows(offset, skeleton.dof_count()).into_owned();
            apply(skeleton, &slice);
        }
    }

    /// The world pose of the referenced body at the current generalized
    /// positions. Recomputes the skeleton's forward pass.
    pub fn body_pose(&self, body: crate::collision::BodyRef) -> Isometry3<fph> {
        let kinematics = Kinematics::new(self.skeleton(body.skeleton));
        *kinematics.body_transform(body.body)
    }

    /// Runs forward kinematics over every skeleton at the current state.
    pub fn kinematics(&self) -> WorldKinematics<'_> {
        WorldKinematics::new(self)
    }

    /// Advances the world one time step.
    pub fn step(&mut self) -> StepOutcome {
        let planned = self.plan_step();
        let outcome = planned.outcome();
        self.apply_planned_step(&planned);
        outcome
    }

    /// Advances the world one time step and records the data needed to
    /// compute the step's Jacobians.
    pub fn step_recorded(&mut self) -> BackpropSnapshot {
        let planned = self.plan_step();
        self.apply_planned_step(&planned);
        BackpropSnapshot::from_planned_step(planned)
    }

    fn apply_planned_step(&mut self, planned: &PlannedStep) {
        self.set_positions(&planned.post_positions);
        self.set_velocities(&planned.post_velocities);
        self.warm_impulses = Some(planned.impulses.clone());
    }

    /// Computes one semi-implicit step from the current state without
    /// mutating it: unconstrained velocities, collision detection, LCP
    /// assembly and solve, and integration.
    fn plan_step(&self) -> PlannedStep {
        let time_step = self.time_step;
        let n = self.dof_count();

        let pre_positions = self.positions();
        let pre_velocities = self.velocities();
        let pre_forces = self.external_forces();

        let kinematics = self.kinematics();
        let mass_matrix = kinematics.mass_matrix();
        let inverse_mass_matrix = kinematics.inverse_mass_matrix();
        let bias_forces = kinematics.bias_forces();

        // Unconstrained post-force velocity.
        let pre_constraint_velocities = &pre_velocities
            + time_step * (&inverse_mass_matrix * (&pre_forces - &bias_forces));

        let mut manifold = ContactManifold::new();
        if let Some(oracle) = &self.collision_oracle {
            oracle.detect_contacts(self, &mut manifold);
        }

        // Row 0 per contact is the normal; frictional contacts add the two
        // tangent-basis rows, bound-coupled to their normal row.
        let mut constraints = Vec::new();
        let mut findex = Vec::new();
        let mut lower_bounds = Vec::new();
        let mut upper_bounds = Vec::new();
        let mut unsupported_rows = Vec::new();

        for contact in manifold.contacts() {
            let friction_coef = contact.response.friction_coef;
            let normal_row = constraints.len();
            let basis_count = if friction_coef > 0.0 { 3 } else { 1 };

            for basis_index in 0..basis_count {
                if matches!(contact.kind, crate::collision::ContactKind::Unsupported) {
                    unsupported_rows.push(constraints.len());
                }
                constraints.push(DifferentiableContactConstraint::new(
                    contact.clone(),
                    basis_index,
                ));
                if basis_index == 0 {
                    findex.push(None);
                    lower_bounds.push(0.0);
                    upper_bounds.push(fph::INFINITY);
                } else {
                    findex.push(Some(normal_row));
                    lower_bounds.push(-friction_coef);
                    upper_bounds.push(friction_coef);
                }
            }
        }

        let row_count = constraints.len();
        let mut jacobian = DMatrix::zeros(row_count, n);
        for (row, constraint) in constraints.iter().enumerate() {
            jacobian
                .row_mut(row)
                .copy_from(&constraint.generalized_force(&kinematics).transpose());
        }

        // Restitution enters through the target relative velocity of the
        // normal rows, assembled from the pre-step approach speed.
        let mut restitution_targets = DVector::zeros(row_count);
        for (row, constraint) in constraints.iter().enumerate() {
            if constraint.basis_index() == 0 {
                let restitution = constraint.contact().response.restitution_coef;
                if restitution > 0.0 {
                    let approach = jacobian.row(row).transpose().dot(&pre_velocities);
                    if approach < 0.0 {
                        restitution_targets[row] = -restitution * approach;
                    }
                }
            }
        }

        let mut impulses = DVector::zeros(row_count);
        let mut fallback_used = false;
        let mut degraded = false;
        let mut regimes = vec![ConstraintRegime::NotClamping; row_count];

        if row_count > 0 {
            let lcp_matrix = &jacobian * &inverse_mass_matrix * jacobian.transpose();
            let lcp_offsets =
                &jacobian * &pre_constraint_velocities - &restitution_targets;
            let lower = DVector::from_vec(lower_bounds);
            let upper = DVector::from_vec(upper_bounds);

            if let Some(warm) = &self.warm_impulses {
                if warm.len() == row_count {
                    impulses.copy_from(warm);
                }
            }

            let mut solved = self.lcp_solver.solve(
                &lcp_matrix,
                &mut impulses,
                &lcp_offsets,
                &lower,
                &upper,
                &findex,
            );

            if !solved {
                debug!("Primary LCP solve failed; retrying with fallback configuration");
                fallback_used = true;
                impulses.fill(0.0);
                solved = PgsSolver::new(PgsConfig::fallback()).solve(
                    &lcp_matrix,
                    &mut impulses,
                    &lcp_offsets,
                    &lower,
                    &upper,
                    &findex,
                );
            }

            if !solved {
                // Degraded step: fall back to the previous step's impulses
                // when they are shaped like this step's rows.
                warn!("LCP solve failed; step degraded to previous impulses");
                degraded = true;
                match &self.warm_impulses {
                    Some(warm) if warm.len() == row_count => impulses.copy_from(warm),
                    _ => impulses.fill(0.0),
                }
            }

            regimes = classify_rows(&impulses, &lower, &upper, &findex, REGIME_TOLERANCE);
        }

        if !unsupported_rows.is_empty() {
            warn!(
                "{} constraint row(s) have unsupported contact geometry; their gradients are zero",
                unsupported_rows.len()
            );
        }

        let post_velocities = &pre_constraint_velocities
            + &inverse_mass_matrix * (jacobian.transpose() * &impulses);
        let post_positions = &pre_positions + time_step * &post_velocities;

        let mut flags = SnapshotFlags::empty();
        if degraded {
            flags |= SnapshotFlags::DEGRADED;
        }
        if !unsupported_rows.is_empty() {
            flags |= SnapshotFlags::HAS_UNSUPPORTED_ROWS;
        }

        PlannedStep {
            time_step,
            contact_count: manifold.len(),
            pre_positions,
            pre_velocities,
            pre_forces,
            pre_constraint_velocities,
            mass_matrix,
            inverse_mass_matrix,
            constraints,
            jacobian,
            findex,
            restitution_targets,
            impulses,
            regimes,
            fallback_used,
            flags,
            unsupported_rows,
            post_positions,
            post_velocities,
        }
    }
}

/// All quantities computed by one planned step, consumed either by
/// [`World::step`] (state only) or by [`BackpropSnapshot`].
#[derive(Clone, Debug)]
pub(crate) struct PlannedStep {
    pub time_step: fph,
    pub contact_count: usize,
    pub pre_positions: DVector<fph>,
    pub pre_velocities: DVector<fph>,
    pub pre_forces: DVector<fph>,
    pub pre_constraint_velocities: DVector<fph>,
    pub mass_matrix: DMatrix<fph>,
    pub inverse_mass_matrix: DMatrix<fph>,
    pub constraints: Vec<DifferentiableContactConstraint>,
    pub jacobian: DMatrix<fph>,
    pub findex: Vec<Option<usize>>,
    pub restitution_targets: DVector<fph>,
    pub impulses: DVector<fph>,
    pub regimes: Vec<ConstraintRegime>,
    pub fallback_used: bool,
    pub flags: SnapshotFlags,
    pub unsupported_rows: Vec<usize>,
    pub post_positions: DVector<fph>,
    pub post_velocities: DVector<fph>,
}

impl PlannedStep {
    fn outcome(&self) -> StepOutcome {
        StepOutcome {
            contact_count: self.contact_count,
            constraint_row_count: self.constraints.len(),
            fallback_used: self.fallback_used,
            degraded: self.flags.contains(SnapshotFlags::DEGRADED),
            unsupported_rows: self.unsupported_rows.clone(),
        }
    }
}

/// Forward kinematics of every skeleton in a world at its current state,
/// together with flat-index bookkeeping. Immutable while gradients are being
/// evaluated.
#[derive(Debug)]
pub struct WorldKinematics<'a> {
    world: &'a World,
    per_skeleton: Vec<Kinematics<'a>>,
}

impl<'a> WorldKinematics<'a> {
    pub fn new(world: &'a World) -> Self {
        let per_skeleton = world.skeletons.iter().map(Kinematics::new).collect();
        Self {
            world,
            per_skeleton,
        }
    }

    pub fn world(&self) -> &'a World {
        self.world
    }

    pub fn dof_count(&self) -> usize {
        self.world.dof_count()
    }

    pub fn skeleton_kinematics(&self, id: SkeletonID) -> &Kinematics<'a> {
        &self.per_skeleton[id.0 as usize]
    }

    pub fn body_transform(&self, skeleton: SkeletonID, body: BodyIndex) -> &Isometry3<fph> {
        self.per_skeleton[skeleton.0 as usize].body_transform(body)
    }

    /// The world screw axis of the world-level coordinate `flat`.
    pub fn world_screw(&self, flat: usize) -> &SpatialVector {
        let (skeleton, dof) = self.world.dof_location(flat);
        self.per_skeleton[skeleton.0 as usize].world_screw(dof)
    }

    /// `∂W_row/∂q_wrt` at world level; zero across skeletons.
    pub fn screw_gradient(&self, row: usize, wrt: usize) -> SpatialVector {
        let (row_skeleton, row_dof) = self.world.dof_location(row);
        let (wrt_skeleton, wrt_dof) = self.world.dof_location(wrt);
        if row_skeleton != wrt_skeleton {
            return SpatialVector::zeros();
        }
        self.per_skeleton[row_skeleton.0 as usize].screw_gradient(row_dof, wrt_dof)
    }

    /// The block-diagonal world mass matrix.
    pub fn mass_matrix(&self) -> DMatrix<fph> {
        self.block_diagonal(|kinematics| kinematics.mass_matrix())
    }

    /// The block-diagonal world inverse mass matrix.
    pub fn inverse_mass_matrix(&self) -> DMatrix<fph> {
        self.block_diagonal(|kinematics| kinematics.inverse_mass_matrix())
    }

    /// World-level `∂M/∂q_wrt`; nonzero only in the block of the skeleton
    /// owning `wrt`.
    pub fn mass_matrix_gradient(&self, wrt: usize) -> DMatrix<fph> {
        let (skeleton, dof) = self.world.dof_location(wrt);
        let mut gradient = DMatrix::zeros(self.dof_count(), self.dof_count());
        let offset = self.world.dof_offset(skeleton);
        let block = self.per_skeleton[skeleton.0 as usize].mass_matrix_gradient(dof);
        gradient
            .view_mut((offset, offset), (block.nrows(), block.ncols()))
            .copy_from(&block);
        gradient
    }

    /// World-level `∂M⁻¹/∂q_wrt`.
    pub fn inverse_mass_matrix_gradient(&self, wrt: usize) -> DMatrix<fph> {
        let (skeleton, dof) = self.world.dof_location(wrt);
        let mut gradient = DMatrix::zeros(self.dof_count(), self.dof_count());
        let offset = self.world.dof_offset(skeleton);
        let kinematics = &self.per_skeleton[skeleton.0 as usize];
        let block =
            kinematics.inverse_mass_matrix_gradient(dof, &kinematics.inverse_mass_matrix());
        gradient
            .view_mut((offset, offset), (block.nrows(), block.ncols()))
            .copy_from(&block);
        gradient
    }

    /// The concatenated bias forces `C(q, q̇)` including gravity.
    pub fn bias_forces(&self) -> DVector<fph> {
        let mut result = DVector::zeros(self.dof_count());
        for (kinematics, &offset) in self.per_skeleton.iter().zip(&self.world.dof_offsets) {
            let values = kinematics.bias_forces(&self.world.gravity);
            result.rows_mut(offset, values.len()).copy_from(&values);
        }
        result
    }

    /// World-level `∂C/∂q`.
    pub fn bias_forces_position_gradient(&self) -> DMatrix<fph> {
        self.block_diagonal(|kinematics| {
            kinematics.bias_forces_position_gradient(&self.world.gravity)
        })
    }

    /// World-level `∂C/∂q̇`.
    pub fn bias_forces_velocity_gradient(&self) -> DMatrix<fph> {
        self.block_diagonal(Kinematics::bias_forces_velocity_gradient)
    }

    fn block_diagonal(
        &self,
        per_skeleton: impl Fn(&Kinematics<'a>) -> DMatrix<fph>,
    ) -> DMatrix<fph> {
        let n = self.dof_count();
        let mut result = DMatrix::zeros(n, n);
        for (kinematics, &offset) in self.per_skeleton.iter().zip(&self.world.dof_offsets) {
            let block = per_skeleton(kinematics);
            result
                .view_mut((offset, offset), (block.nrows(), block.ncols()))
                .copy_from(&block);
        }
        result
    }
}
