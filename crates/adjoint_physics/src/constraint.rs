//! Contact constraints: classification of degrees of freedom against
//! contacts, and the differentiable constraint built on top of it.

pub mod differentiable;

use crate::{
    collision::{Contact, ContactKind},
    fph,
    world::World,
};

/// How a degree of freedom relates to a contact: which geometric feature of
/// the contact it rigidly carries, if any.
///
/// For edge-edge contacts the type names the *far* edge, the one held fixed
/// when the degree of freedom moves: a coordinate supporting only body A
/// carries edge A rigidly, so it classifies as [`Self::EdgeB`]. Gradient
/// dispatch differentiates the moving edge accordingly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DofContactType {
    /// The degree of freedom supports neither body.
    None,
    /// The degree of freedom carries the face side of a vertex-face pairing.
    Face,
    /// The degree of freedom carries the vertex side of a vertex-face
    /// pairing.
    Vertex,
    /// Edge-edge pairing with edge A held fixed (the coordinate supports
    /// body B).
    EdgeA,
    /// Edge-edge pairing with edge B held fixed (the coordinate supports
    /// body A).
    EdgeB,
    /// The coordinate supports both bodies of a vertex-face pairing.
    VertexFaceSelfCollision,
    /// The coordinate supports both bodies of an edge-edge pairing.
    EdgeEdgeSelfCollision,
    /// The contact's geometry is outside the differentiable set.
    Unsupported,
}

/// Classifies the world-level coordinate `flat` against the contact.
pub fn dof_contact_type(world: &World, contact: &Contact, flat: usize) -> DofContactType {
    let ancestor_of_a = dof_supports_body(world, contact, flat, true);
    let ancestor_of_b = dof_supports_body(world, contact, flat, false);

    match (ancestor_of_a, ancestor_of_b) {
        (false, false) => DofContactType::None,
        (true, true) => match &contact.kind {
            ContactKind::VertexFace | ContactKind::FaceVertex => {
                DofContactType::VertexFaceSelfCollision
            }
            ContactKind::EdgeEdge { .. } => DofContactType::EdgeEdgeSelfCollision,
            ContactKind::Unsupported => DofContactType::Unsupported,
        },
        (true, false) => match &contact.kind {
            ContactKind::VertexFace => DofContactType::Vertex,
            ContactKind::FaceVertex => DofContactType::Face,
            // The coordinate rigidly carries edge A; edge B is the far edge.
            ContactKind::EdgeEdge { .. } => DofContactType::EdgeB,
            ContactKind::Unsupported => DofContactType::Unsupported,
        },
        (false, true) => match &contact.kind {
            ContactKind::VertexFace => DofContactType::Face,
            ContactKind::FaceVertex => DofContactType::Vertex,
            ContactKind::EdgeEdge { .. } => DofContactType::EdgeA,
            ContactKind::Unsupported => DofContactType::Unsupported,
        },
    }
}

/// The sign with which the contact's force direction enters the generalized
/// force on the given coordinate: `+1` when it supports only body A, `-1`
/// when it supports only body B, `0` when it supports both (the internal
/// forces cancel through the tree) or neither.
pub fn force_multiple(world: &World, contact: &Contact, flat: usize) -> fph {
    let ancestor_of_a = dof_supports_body(world, contact, flat, true);
    let ancestor_of_b = dof_supports_body(world, contact, flat, false);
    match (ancestor_of_a, ancestor_of_b) {
        (true, false) => 1.0,
        (false, true) => -1.0,
        _ => 0.0,
    }
}

fn dof_supports_body(world: &World, contact: &Contact, flat: usize, side_a: bool) -> bool {
    let body_ref = if side_a {
        contact.body_a
    } else {
        contact.body_b
    };
    let (skeleton_id, dof) = world.dof_location(flat);
    skeleton_id == body_ref.skeleton
        && world
            .skeleton(skeleton_id)
            .dof_is_ancestor_of_body(dof, body_ref.body)
}
