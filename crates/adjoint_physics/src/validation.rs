//! Brute-force finite-difference counterparts of the analytical Jacobians.
//!
//! Every probe perturbs a single coordinate, re-runs the full forward path
//! (collision detection, LCP solve, integration) on a scoped copy of the
//! world state, and divides. This is the reference the analytical machinery
//! is tested against; it is not meant for production gradients (one probe
//! costs two forward simulations per coordinate).
//!
//! Contact-level probes must re-identify "the same" constraint in the
//! perturbed world. Peers are matched by (is-upper-bound, offset): the row at
//! the same offset in the new snapshot whose saturation state agrees.
//! Perturbations that change the active set invalidate the peer and the
//! affected column is reported as rejected rather than filled with garbage.

use crate::{
    backprop::BackpropSnapshot,
    fph,
    lcp::ConstraintRegime,
    snapshot::RestorableSnapshot,
    world::World,
};
use nalgebra::{DMatrix, DVector};

/// Default perturbation for position and velocity probes.
pub const DEFAULT_STATE_EPSILON: fph = 1e-6;

/// Default perturbation for constraint-force probes, which compose two
/// levels of differentiation and prefer a smaller step.
pub const DEFAULT_CONSTRAINT_FORCE_EPSILON: fph = 1e-7;

/// A finite-difference contact-level Jacobian with the columns whose peer
/// constraint could not be identified.
#[derive(Clone, Debug)]
pub struct FdContactJacobian {
    pub matrix: DMatrix<fph>,
    /// Columns invalidated by active-set or row-count changes under the
    /// perturbation; their entries are zero and must not be compared.
    pub rejected_columns: Vec<usize>,
}

/// `∂q̇⁺/∂q̇` by central differences over full forward steps.
pub fn fd_vel_vel_jacobian(world: &mut World, epsilon: fph) -> DMatrix<fph> {
    let base = world.velocities();
    fd_state_jacobian(world, epsilon, &base, World::set_velocities, |world| {
        world.step();
        world.velocities()
    })
}

/// `∂q⁺/∂q̇` by central differences.
pub fn fd_vel_pos_jacobian(world: &mut World, epsilon: fph) -> DMatrix<fph> {
    let base = world.velocities();
    fd_state_jacobian(world, epsilon, &base, World::set_velocities, |world| {
        world.step();
        world.positions()
    })
}

/// `∂q̇⁺/∂q` by central differences.
pub fn fd_pos_vel_jacobian(world: &mut World, epsilon: fph) -> DMatrix<fph> {
    let base = world.positions();
    fd_state_jacobian(world, epsilon, &base, World::set_positions, |world| {
        world.step();
        world.velocities()
    })
}

/// `∂q⁺/∂q` by central differences.
pub fn fd_pos_pos_jacobian(world: &mut World, epsilon: fph) -> DMatrix<fph> {
    let base = world.positions();
    fd_state_jacobian(world, epsilon, &base, World::set_positions, |world| {
        world.step();
        world.positions()
    })
}

/// `∂q̇⁺/∂τ` by central differences.
pub fn fd_force_vel_jacobian(world: &mut World, epsilon: fph) -> DMatrix<fph> {
    let base = world.external_forces();
    fd_state_jacobian(world, epsilon, &base, World::set_external_forces, |world| {
        world.step();
        world.velocities()
    })
}

fn fd_state_jacobian(
    world: &mut World,
    epsilon: fph,
    base: &DVector<fph>,
    set: impl Fn(&mut World, &DVector<fph>),
    observe: impl Fn(&mut World) -> DVector<fph>,
) -> DMatrix<fph> {
    let n = world.dof_count();
    let mut jacobian = DMatrix::zeros(n, n);

    for k in 0..n {
        let upper = probe(world, |world| {
            let mut perturbed = base.clone();
            perturbed[k] += epsilon;
            set(world, &perturbed);
            observe(world)
        });
        let lower = probe(world, |world| {
            let mut perturbed = base.clone();
            perturbed[k] -= epsilon;
            set(world, &perturbed);
            observe(world)
        });
        jacobian.set_column(k, &((upper - lower) / (2.0 * epsilon)));
    }
    jacobian
}

/// `∂(contact point)/∂q` for one constraint row of the reference snapshot,
/// with peer matching.
pub fn fd_contact_position_jacobian(
    world: &mut World,
    reference: &BackpropSnapshot,
    row: usize,
    epsilon: fph,
) -> FdContactJacobian {
    fd_contact_vector_jacobian(world, reference, row, epsilon, 3, |snapshot, peer| {
        snapshot.constraint(peer).world_position().coords
    })
}

/// `∂(force direction)/∂q` for one constraint row, with peer matching.
pub fn fd_contact_force_direction_jacobian(
    world: &mut World,
    reference: &BackpropSnapshot,
    row: usize,
    epsilon: fph,
) -> FdContactJacobian {
    fd_contact_vector_jacobian(world, reference, row, epsilon, 3, |snapshot, peer| {
        snapshot.constraint(peer).force_direction()
    })
}

/// `∂(world force)/∂q` for one constraint row, with peer matching.
pub fn fd_contact_force_jacobian(
    world: &mut World,
    reference: &BackpropSnapshot,
    row: usize,
    epsilon: fph,
) -> FdContactJacobian {
    let n = world.dof_count();
    let mut result = FdContactJacobian {
        matrix: DMatrix::zeros(6, n),
        rejected_columns: Vec::new(),
    };
    for k in 0..n {
        match central_contact_difference(world, reference, row, k, epsilon, |snapshot, peer| {
            snapshot.constraint(peer).world_force().to_vector6()
        }) {
            Some(column) => result.matrix.set_column(k, &column),
            None => result.rejected_columns.push(k),
        }
    }
    result
}

/// `∂(generalized force direction)/∂q` for one constraint row, with peer
/// matching: the finite-difference counterpart of the constraint-force
/// second derivative.
pub fn fd_constraint_force_direction_jacobian(
    world: &mut World,
    reference: &BackpropSnapshot,
    row: usize,
    epsilon: fph,
) -> FdContactJacobian {
    let n = world.dof_count();
    let mut result = FdContactJacobian {
        matrix: DMatrix::zeros(n, n),
        rejected_columns: Vec::new(),
    };
    for k in 0..n {
        match central_contact_difference(world, reference, row, k, epsilon, |snapshot, peer| {
            snapshot.contact_jacobian().row(peer).transpose()
        }) {
            Some(column) => result.matrix.set_column(k, &column),
            None => result.rejected_columns.push(k),
        }
    }
    result
}

fn fd_contact_vector_jacobian(
    world: &mut World,
    reference: &BackpropSnapshot,
    row: usize,
    epsilon: fph,
    dimension: usize,
    observe: impl Fn(&BackpropSnapshot, usize) -> nalgebra::Vector3<fph> + Copy,
) -> FdContactJacobian {
    let n = world.dof_count();
    let mut result = FdContactJacobian {
        matrix: DMatrix::zeros(dimension, n),
        rejected_columns: Vec::new(),
    };
    for k in 0..n {
        match central_contact_difference(world, reference, row, k, epsilon, observe) {
            Some(column) => result.matrix.set_column(k, &column),
            None => result.rejected_columns.push(k),
        }
    }
    result
}

/// Central difference of a per-constraint observation under a single
/// coordinate perturbation; [`None`] when either probe loses the peer.
fn central_contact_difference<V>(
    world: &mut World,
    reference: &BackpropSnapshot,
    row: usize,
    coordinate: usize,
    epsilon: fph,
    observe: impl Fn(&BackpropSnapshot, usize) -> V,
) -> Option<V>
where
    V: std::ops::Sub<Output = V> + std::ops::Div<fph, Output = V>,
{
    let base = world.positions();

    let mut observe_at = |offset: fph| -> Option<V> {
        probe(world, |world| {
            let mut perturbed = base.clone();
            perturbed[coordinate] += offset;
            world.set_positions(&perturbed);
            let snapshot = world.step_recorded();
            let peer = find_peer_constraint(reference, row, &snapshot)?;
            Some(observe(&snapshot, peer))
        })
    };

    let upper = observe_at(epsilon)?;
    let lower = observe_at(-epsilon)?;
    Some((upper - lower) / (2.0 * epsilon))
}

/// Identifies the constraint in `candidate` corresponding to `row` of
/// `reference`: same offset, same saturation state.
pub fn find_peer_constraint(
    reference: &BackpropSnapshot,
    row: usize,
    candidate: &BackpropSnapshot,
) -> Option<usize> {
    if row >= candidate.constraint_count() {
        return None;
    }
    let reference_saturated = reference.regimes()[row] == ConstraintRegime::UpperBound;
    let candidate_saturated = candidate.regimes()[row] == ConstraintRegime::UpperBound;
    (reference_saturated == candidate_saturated).then_some(row)
}

/// Runs `operation` and restores the world state afterwards.
fn probe<R>(world: &mut World, operation: impl FnOnce(&mut World) -> R) -> R {
    let saved = RestorableSnapshot::capture(world);
    let result = operation(world);
    saved.restore(world);
    result
}
