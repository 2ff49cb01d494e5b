//! Mathematical support for the Adjoint simulator: screw (spatial vector)
//! algebra, spatial inertia, and the closed-form contact geometry used by the
//! differentiable constraint machinery.

pub mod line;
pub mod spatial;
pub mod tangent;

pub use line::{LineClosestApproach, LineMotion, line_closest_approach, line_closest_approach_gradient};
pub use spatial::{SpatialInertia, SpatialVector, ad_matrix};
pub use tangent::{tangent_basis, tangent_basis_gradient};
