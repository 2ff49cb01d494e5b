//! Contact response parameters.

use crate::fph;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Response parameters governing how a pair of surfaces interacts at a
/// contact.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContactResponseParameters {
    /// Coulomb friction coefficient.
    pub friction_coef: fph,
    /// Coefficient of restitution along the contact normal.
    pub restitution_coef: fph,
}

impl ContactResponseParameters {
    pub fn new(friction_coef: fph, restitution_coef: fph) -> Self {
        Self {
            friction_coef,
            restitution_coef,
        }
    }

    /// Parameters for a frictionless, perfectly inelastic contact.
    pub fn frictionless() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Combines the parameters of two surfaces into the parameters for a
    /// contact between them: geometric-mean friction, maximum restitution.
    pub fn combined(a: &Self, b: &Self) -> Self {
        Self {
            friction_coef: (a.friction_coef * b.friction_coef).sqrt(),
            restitution_coef: a.restitution_coef.max(b.restitution_coef),
        }
    }
}

impl Default for ContactResponseParameters {
    fn default() -> Self {
        Self {
            friction_coef: 0.5,
            restitution_coef: 0.0,
        }
    }
}
