//! Scoped save and restore of world state.
//!
//! Gradient evaluation and finite-difference probing both need to perturb a
//! world and put it back exactly. A [`RestorableSnapshot`] captures the
//! generalized positions, velocities, and external forces of every skeleton;
//! restoration is explicit and may be invoked any number of times, so nested
//! perturbations compose. [`ScopedWorldState`] wraps a snapshot in a guard
//! that restores on drop for the exit paths explicit code cannot reach.

use crate::{fph, world::World};
use approx::AbsDiffEq;
use nalgebra::DVector;

/// A value snapshot of a world's generalized state.
#[derive(Clone, Debug, PartialEq)]
pub struct RestorableSnapshot {
    positions: DVector<fph>,
    velocities: DVector<fph>,
    external_forces: DVector<fph>,
}

impl RestorableSnapshot {
    /// Captures the current state of the world.
    pub fn capture(world: &World) -> Self {
        Self {
            positions: world.positions(),
            velocities: world.velocities(),
            external_forces: world.external_forces(),
        }
    }

    /// Writes the captured state back into the world.
    ///
    /// # Panics
    /// If the world's degree-of-freedom count changed since capture.
    pub fn restore(&self, world: &mut World) {
        world.set_positions(&self.positions);
        world.set_velocities(&self.velocities);
        world.set_external_forces(&self.external_forces);
    }

    pub fn positions(&self) -> &DVector<fph> {
        &self.positions
    }

    pub fn velocities(&self) -> &DVector<fph> {
        &self.velocities
    }

    pub fn external_forces(&self) -> &DVector<fph> {
        &self.external_forces
    }
}

impl AbsDiffEq for RestorableSnapshot {
    type Epsilon = <fph as AbsDiffEq>::Epsilon;

    fn default_epsilon() -> Self::Epsilon {
        fph::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: Self::Epsilon) -> bool {
        DVector::abs_diff_eq(&self.positions, &other.positions, epsilon)
            && DVector::abs_diff_eq(&self.velocities, &other.velocities, epsilon)
            && DVector::abs_diff_eq(&self.external_forces, &other.external_forces, epsilon)
    }
}

/// Runs `operation` with exclusive access to the world and restores the
/// captured state afterwards, whether the operation returns normally or
/// unwinds.
pub fn with_restored_state<R>(world: &mut World, operation: impl FnOnce(&mut World) -> R) -> R {
    let mut scope = ScopedWorldState::enter(world);
    operation(scope.world())
}

/// A guard holding a world borrowed together with the snapshot that will be
/// restored when the guard drops.
#[derive(Debug)]
pub struct ScopedWorldState<'a> {
    world: &'a mut World,
    snapshot: RestorableSnapshot,
}

impl<'a> ScopedWorldState<'a> {
    pub fn enter(world: &'a mut World) -> Self {
        let snapshot = RestorableSnapshot::capture(world);
        Self { world, snapshot }
    }

    pub fn world(&mut self) -> &mut World {
        self.world
    }
}

impl Drop for ScopedWorldState<'_> {
    fn drop(&mut self) {
        self.snapshot.restore(self.world);
    }
}
