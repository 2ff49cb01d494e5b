//! Contact records and collision oracles.
//!
//! Contacts are immutable snapshots captured at detection time; the
//! differentiable constraint machinery copies them by value so later world
//! mutation cannot alias them. Bodies are referenced by (skeleton, body)
//! index pairs rather than by handle for the same reason.

use crate::{
    fph,
    material::ContactResponseParameters,
    skeleton::{BodyIndex, SkeletonID},
    world::World,
};
use adjoint_math::line_closest_approach;
use nalgebra::{Point3, UnitVector3, Vector3};
use std::fmt;
use tinyvec::TinyVec;

/// Reference to a body in a world: the skeleton's registration ID plus the
/// body's index within it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BodyRef {
    pub skeleton: SkeletonID,
    pub body: BodyIndex,
}

impl BodyRef {
    pub fn new(skeleton: SkeletonID, body: BodyIndex) -> Self {
        Self { skeleton, body }
    }
}

impl Default for BodyRef {
    /// A sentinel reference used only by empty manifold slots.
    fn default() -> Self {
        Self {
            skeleton: SkeletonID(u32::MAX),
            body: BodyIndex(u32::MAX),
        }
    }
}

/// The set of contacts present in a world at one instant.
#[derive(Clone, Debug)]
pub struct ContactManifold {
    contacts: TinyVec<[Contact; 8]>,
}

impl ContactManifold {
    pub fn new() -> Self {
        Self {
            contacts: TinyVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn contacts(&self) -> &[Contact] {
        self.contacts.as_slice()
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
    }

    pub fn add_contact(&mut self, contact: Contact) {
        self.contacts.push(contact);
    }
}

impl Default for ContactManifold {
    fn default() -> Self {
        Self::new()
    }
}

/// A point of contact between two bodies, as reported by a collision oracle.
///
/// The normal is a unit vector pointing from body B into body A: a positive
/// normal impulse pushes A along it and B against it.
#[derive(Clone, Debug)]
pub struct Contact {
    pub point: Point3<fph>,
    pub normal: UnitVector3<fph>,
    pub kind: ContactKind,
    pub body_a: BodyRef,
    pub body_b: BodyRef,
    /// Non-negative when the bodies overlap; informational.
    pub penetration_depth: fph,
    /// Combined response parameters for this pair of surfaces.
    pub response: ContactResponseParameters,
}

impl Default for Contact {
    /// A placeholder record used only by empty manifold slots.
    fn default() -> Self {
        Self {
            point: Point3::origin(),
            normal: Vector3::z_axis(),
            kind: ContactKind::Unsupported,
            body_a: BodyRef::default(),
            body_b: BodyRef::default(),
            penetration_depth: 0.0,
            response: ContactResponseParameters::default(),
        }
    }
}

/// The geometric feature pairing that produced a contact.
#[derive(Clone, Debug)]
pub enum ContactKind {
    /// A vertex of body A against a face of body B.
    VertexFace,
    /// A face of body A against a vertex of body B.
    FaceVertex,
    /// An edge of body A against an edge of body B.
    EdgeEdge {
        edge_a: ContactEdge,
        edge_b: ContactEdge,
    },
    /// A feature pairing the gradient machinery does not cover. The forward
    /// simulation still resolves these contacts; their sensitivities are
    /// suppressed and surfaced through snapshot flags.
    Unsupported,
}

/// One edge of an edge-edge contact, in world coordinates at detection time.
#[derive(Copy, Clone, Debug)]
pub struct ContactEdge {
    pub fixed_point: Point3<fph>,
    pub dir: UnitVector3<fph>,
}

/// Produces the contacts present in a world at its current poses. Ordering
/// across steps is not guaranteed stable; consumers re-index every step.
pub trait CollisionOracle: fmt::Debug {
    fn detect_contacts(&self, world: &World, manifold: &mut ContactManifold);
}

/// A collision shape attached to a body, in body-local coordinates.
#[derive(Clone, Debug)]
pub enum Shape {
    /// A collision vertex.
    Point(Point3<fph>),
    /// The half-space `normal · x ≤ offset`; the face normal points out of
    /// the solid.
    HalfSpace {
        normal: UnitVector3<fph>,
        offset: fph,
    },
    /// A collision edge between two points.
    Segment {
        start: Point3<fph>,
        end: Point3<fph>,
    },
}

#[derive(Clone, Debug)]
struct Collider {
    body: BodyRef,
    shape: Shape,
    response: ContactResponseParameters,
}

/// A narrow phase over primitive shapes: vertices against half-space faces
/// and edges against edges. Feature pairings outside the supported set (for
/// example an edge resting on a face) are reported as
/// [`ContactKind::Unsupported`].
#[derive(Clone, Debug)]
pub struct PrimitiveOracle {
    colliders: Vec<Collider>,
    margin: fph,
}

impl PrimitiveOracle {
    pub fn new() -> Self {
        Self {
            colliders: Vec::new(),
            margin: 1e-4,
        }
    }

    /// Sets the separation below which features are considered in contact.
    pub fn with_margin(mut self, margin: fph) -> Self {
        self.margin = margin;
        self
    }

    pub fn add_collider(
        &mut self,
        body: BodyRef,
        shape: Shape,
        response: ContactResponseParameters,
    ) {
        self.colliders.push(Collider {
            body,
            shape,
            response,
        });
    }

    fn detect_pair(&self, world: &World, a: &Collider, b: &Collider) -> Option<Contact> {
        let response = ContactResponseParameters::combined(&a.response, &b.response);
        let pose_a = world.body_pose(a.body);
        let pose_b = world.body_pose(b.body);

        match (&a.shape, &b.shape) {
            (Shape::Point(local), Shape::HalfSpace { normal, offset }) => {
                let vertex = pose_a.transform_point(local);
                let face_normal = UnitVector3::new_unchecked(pose_b * normal.into_inner());
                let face_point = pose_b.transform_point(&Point3::from(normal.into_inner() * *offset));
                let separation = face_normal.dot(&(vertex - face_point));
                (separation < self.margin).then(|| Contact {
                    point: vertex,
                    normal: face_normal,
                    kind: ContactKind::VertexFace,
                    body_a: a.body,
                    body_b: b.body,
                    penetration_depth: (-separation).max(0.0),
                    response,
                })
            }
            (Shape::HalfSpace { .. }, Shape::Point(_)) => {
                // Canonicalize to vertex-on-A and swap back.
                let swapped = self.detect_pair(world, b, a)?;
                Some(Contact {
                    normal: UnitVector3::new_unchecked(-swapped.normal.into_inner()),
                    kind: ContactKind::FaceVertex,
                    body_a: swapped.body_b,
                    body_b: swapped.body_a,
                    ..swapped
                })
            }
            (
                Shape::Segment { start, end },
                Shape::Segment {
                    start: start_b,
                    end: end_b,
                },
            ) => {
                let (point_a, dir_a, length_a) = world_segment(&pose_a, start, end);
                let (point_b, dir_b, length_b) = world_segment(&pose_b, start_b, end_b);

                let approach = line_closest_approach(
                    &point_a,
                    dir_a.as_ref(),
                    &point_b,
                    dir_b.as_ref(),
                )?;
                if approach.s < 0.0
                    || approach.s > length_a
                    || approach.t < 0.0
                    || approach.t > length_b
                {
                    return None;
                }

                let gap = approach.point_on_a - approach.point_on_b;
                let distance = gap.norm();
                if distance >= self.margin {
                    return None;
                }

                let raw_normal = dir_a.cross(&dir_b);
                let mut normal = UnitVector3::new_normalize(raw_normal);
                // Point from B into A.
                if distance > 0.0 && normal.dot(&gap) < 0.0 {
                    normal = UnitVector3::new_unchecked(-normal.into_inner());
                }

                Some(Contact {
                    point: approach.midpoint,
                    normal,
                    kind: ContactKind::EdgeEdge {
                        edge_a: ContactEdge {
                            fixed_point: point_a,
                            dir: dir_a,
                        },
                        edge_b: ContactEdge {
                            fixed_point: point_b,
                            dir: dir_b,
                        },
                    },
                    body_a: a.body,
                    body_b: b.body,
                    penetration_depth: (self.margin - distance).max(0.0),
                    response,
                })
            }
            (Shape::Segment { start, end }, Shape::HalfSpace { normal, offset }) => {
                // Edge-face resting contact: not covered by the gradient
                // machinery, reported as unsupported.
                let (point_a, dir_a, length_a) = world_segment(&pose_a, start, end);
                let face_normal = UnitVector3::new_unchecked(pose_b * normal.into_inner());
                let face_point = pose_b.transform_point(&Point3::from(normal.into_inner() * *offset));

                let midpoint = point_a + dir_a.into_inner() * (0.5 * length_a);
                let separation = face_normal.dot(&(midpoint - face_point));
                (separation < self.margin).then(|| Contact {
                    point: midpoint,
                    normal: face_normal,
                    kind: ContactKind::Unsupported,
                    body_a: a.body,
                    body_b: b.body,
                    penetration_depth: (-separation).max(0.0),
                    response,
                })
            }
            (Shape::HalfSpace { .. }, Shape::Segment { .. }) => {
                let swapped = self.detect_pair(world, b, a)?;
                Some(Contact {
                    normal: UnitVector3::new_unchecked(-swapped.normal.into_inner()),
                    body_a: swapped.body_b,
                    body_b: swapped.body_a,
                    ..swapped
                })
            }
            _ => None,
        }
    }
}

impl Default for PrimitiveOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl CollisionOracle for PrimitiveOracle {
    fn detect_contacts(&self, world: &World, manifold: &mut ContactManifold) {
        for (i, a) in self.colliders.iter().enumerate() {
            for b in &self.colliders[i + 1..] {
                if a.body == b.body {
                    continue;
                }
                if let Some(contact) = self.detect_pair(world, a, b) {
                    manifold.add_contact(contact);
                }
            }
        }
    }
}

fn world_segment(
    pose: &nalgebra::Isometry3<fph>,
    start: &Point3<fph>,
    end: &Point3<fph>,
) -> (Point3<fph>, UnitVector3<fph>, fph) {
    let world_start = pose.transform_point(start);
    let world_end = pose.transform_point(end);
    let span = world_end - world_start;
    let length = span.norm();
    (world_start, UnitVector3::new_normalize(span), length)
}

/// A collision oracle replaying caller-provided contact generators; intended
/// for tests that need precise control over contact geometry.
pub struct ScriptedOracle {
    generators: Vec<Box<dyn Fn(&World) -> Vec<Contact> + Send + Sync>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            generators: Vec::new(),
        }
    }

    pub fn add_generator(
        &mut self,
        generator: impl Fn(&World) -> Vec<Contact> + Send + Sync + 'static,
    ) {
        self.generators.push(Box::new(generator));
    }
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScriptedOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedOracle")
            .field("generators", &self.generators.len())
            .finish()
    }
}

impl CollisionOracle for ScriptedOracle {
    fn detect_contacts(&self, world: &World, manifold: &mut ContactManifold) {
        for generator in &self.generators {
            for contact in generator(world) {
                manifold.add_contact(contact);
            }
        }
    }
}
