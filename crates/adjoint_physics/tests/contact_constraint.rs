//! Differentiable contact constraint tests: classification, force layout,
//! and analytical gradients against finite differences.

use adjoint_physics::{
    collision::{BodyRef, Contact, ContactEdge, ContactKind, PrimitiveOracle, Shape},
    constraint::{DofContactType, differentiable::DifferentiableContactConstraint, dof_contact_type},
    fph,
    material::ContactResponseParameters,
    skeleton::{BodyIndex, InertialProperties, JointKind, Skeleton, SkeletonID},
    validation::{
        DEFAULT_STATE_EPSILON, fd_contact_force_direction_jacobian, fd_contact_force_jacobian,
        fd_contact_position_jacobian,
    },
    world::World,
};
use approx::assert_abs_diff_eq;
use nalgebra::{Isometry3, Point3, UnitVector3, Vector3, point, vector};

const GRAVITY: Vector3<fph> = vector![0.0, -9.81, 0.0];
const TIME_STEP: fph = 1.0 / 2000.0;

fn fixed_plane_skeleton() -> Skeleton {
    let mut skeleton = Skeleton::new("ground");
    skeleton
        .attach_body(
            None,
            "anchor",
            JointKind::Fixed,
            Isometry3::identity(),
            Isometry3::identity(),
            "plane",
            InertialProperties::of_uniform_box([10.0, 0.1, 10.0], 1000.0),
        )
        .unwrap();
    skeleton
}

/// A pendulum rotating about the world z-axis with its collision vertex at
/// distance `length` from the pivot, plus a fixed ground plane through the
/// origin. At zero angle the vertex rests exactly on the plane.
fn pendulum_on_plane(length: fph, mass: fph) -> (World, SkeletonID, SkeletonID) {
    let mut pendulum = Skeleton::new("pendulum");
    pendulum
        .attach_body(
            None,
            "pivot",
            JointKind::Revolute {
                axis: Vector3::z_axis(),
            },
            Isometry3::identity(),
            Isometry3::translation(length, 0.1, 0.0),
            "bob",
            InertialProperties::of_point_mass(mass),
        )
        .unwrap();

    let mut world = World::new(GRAVITY, TIME_STEP);
    let pendulum_id = world.add_skeleton(pendulum);
    let ground_id = world.add_skeleton(fixed_plane_skeleton());

    let mut oracle = PrimitiveOracle::new();
    oracle.add_collider(
        BodyRef::new(pendulum_id, BodyIndex(0)),
        // The vertex sits 0.1 below the center of mass, on the plane.
        Shape::Point(point![0.0, -0.1, 0.0]),
        ContactResponseParameters::frictionless(),
    );
    oracle.add_collider(
        BodyRef::new(ground_id, BodyIndex(0)),
        Shape::HalfSpace {
            normal: Vector3::y_axis(),
            offset: 0.0,
        },
        ContactResponseParameters::frictionless(),
    );
    world.set_collision_oracle(Box::new(oracle));

    (world, pendulum_id, ground_id)
}

/// Two free bodies in edge-edge contact: body A carries an edge along x at a
/// tiny height above body B's edge along y. The contact normal is +z,
/// pointing from B up into A.
fn edge_edge_world(separation: fph) -> (World, SkeletonID, SkeletonID) {
    let mut body_a = Skeleton::new("body_a");
    body_a
        .attach_body(
            None,
            "root_a",
            JointKind::Free,
            Isometry3::translation(0.0, 0.0, separation),
            Isometry3::identity(),
            "a",
            InertialProperties::of_uniform_box([2.0, 0.05, 0.05], 1.0),
        )
        .unwrap();

    let mut body_b = Skeleton::new("body_b");
    body_b
        .attach_body(
            None,
            "root_b",
            JointKind::Free,
            Isometry3::identity(),
            Isometry3::identity(),
            "b",
            InertialProperties::of_uniform_box([0.05, 2.0, 0.05], 1.0),
        )
        .unwrap();

    let mut world = World::new(GRAVITY, TIME_STEP);
    let a_id = world.add_skeleton(body_a);
    let b_id = world.add_skeleton(body_b);

    let mut oracle = PrimitiveOracle::new();
    oracle.add_collider(
        BodyRef::new(a_id, BodyIndex(0)),
        Shape::Segment {
            start: point![-1.0, 0.0, 0.0],
            end: point![1.0, 0.0, 0.0],
        },
        ContactResponseParameters::frictionless(),
    );
    oracle.add_collider(
        BodyRef::new(b_id, BodyIndex(0)),
        Shape::Segment {
            start: point![0.0, -1.0, 0.0],
            end: point![0.0, 1.0, 0.0],
        },
        ContactResponseParameters::frictionless(),
    );
    world.set_collision_oracle(Box::new(oracle));

    (world, a_id, b_id)
}

/// A two-link arm whose hand can touch its own upper link.
fn two_link_arm() -> (World, SkeletonID) {
    let mut arm = Skeleton::new("arm");
    let upper = arm
        .attach_body(
            None,
            "shoulder",
            JointKind::Revolute {
                axis: Vector3::z_axis(),
            },
            Isometry3::identity(),
            Isometry3::translation(0.5, 0.0, 0.0),
            "upper",
            InertialProperties::of_uniform_box([1.0, 0.1, 0.1], 1.0),
        )
        .unwrap();
    arm.attach_body(
        Some(upper),
        "elbow",
        JointKind::Revolute {
            axis: Vector3::z_axis(),
        },
        Isometry3::translation(0.5, 0.0, 0.0),
        Isometry3::translation(0.4, 0.0, 0.0),
        "hand",
        InertialProperties::of_uniform_box([0.8, 0.1, 0.1], 0.6),
    )
    .unwrap();

    let mut world = World::new(GRAVITY, TIME_STEP);
    let arm_id = world.add_skeleton(arm);
    (world, arm_id)
}

fn vertex_face_contact(body_a: BodyRef, body_b: BodyRef) -> Contact {
    Contact {
        point: point![0.3, 0.0, 0.0],
        normal: Vector3::y_axis(),
        kind: ContactKind::VertexFace,
        body_a,
        body_b,
        penetration_depth: 0.0,
        response: ContactResponseParameters::frictionless(),
    }
}

fn edge_edge_contact(body_a: BodyRef, body_b: BodyRef) -> Contact {
    Contact {
        point: Point3::origin(),
        normal: Vector3::z_axis(),
        kind: ContactKind::EdgeEdge {
            edge_a: ContactEdge {
                fixed_point: point![0.0, 0.0, 0.0],
                dir: Vector3::x_axis(),
            },
            edge_b: ContactEdge {
                fixed_point: point![0.0, 0.0, 0.0],
                dir: Vector3::y_axis(),
            },
        },
        body_a,
        body_b,
        penetration_depth: 0.0,
        response: ContactResponseParameters::frictionless(),
    }
}

#[test]
fn classifier_truth_table_for_separate_skeletons() {
    let (world, a_id, b_id) = edge_edge_world(5e-5);
    let a = BodyRef::new(a_id, BodyIndex(0));
    let b = BodyRef::new(b_id, BodyIndex(0));

    let a_dof = world.dof_offset(a_id); // supports only body A
    let b_dof = world.dof_offset(b_id); // supports only body B

    let vf = vertex_face_contact(a, b);
    assert_eq!(dof_contact_type(&world, &vf, a_dof), DofContactType::Vertex);
    assert_eq!(dof_contact_type(&world, &vf, b_dof), DofContactType::Face);

    let fv = Contact {
        kind: ContactKind::FaceVertex,
        ..vertex_face_contact(a, b)
    };
    assert_eq!(dof_contact_type(&world, &fv, a_dof), DofContactType::Face);
    assert_eq!(dof_contact_type(&world, &fv, b_dof), DofContactType::Vertex);

    // The edge type names the far edge: a coordinate carrying body A (and
    // with it edge A) classifies as EdgeB, and vice versa.
    let ee = edge_edge_contact(a, b);
    assert_eq!(dof_contact_type(&world, &ee, a_dof), DofContactType::EdgeB);
    assert_eq!(dof_contact_type(&world, &ee, b_dof), DofContactType::EdgeA);

    let unsupported = Contact {
        kind: ContactKind::Unsupported,
        ..vertex_face_contact(a, b)
    };
    assert_eq!(
        dof_contact_type(&world, &unsupported, a_dof),
        DofContactType::Unsupported
    );
}

#[test]
fn classifier_truth_table_for_self_collision_and_outsiders() {
    let (mut world, arm_id) = two_link_arm();
    // A second skeleton whose coordinates are unrelated to the contact.
    let mut outsider = Skeleton::new("outsider");
    outsider
        .attach_body(
            None,
            "root",
            JointKind::Free,
            Isometry3::translation(5.0, 0.0, 0.0),
            Isometry3::identity(),
            "chunk",
            InertialProperties::of_point_mass(1.0),
        )
        .unwrap();
    let outsider_id = world.add_skeleton(outsider);

    let hand = BodyRef::new(arm_id, BodyIndex(1));
    let upper = BodyRef::new(arm_id, BodyIndex(0));
    let shoulder_dof = world.dof_offset(arm_id);
    let elbow_dof = shoulder_dof + 1;
    let outsider_dof = world.dof_offset(outsider_id);

    let vf = vertex_face_contact(hand, upper);
    // The shoulder supports both bodies.
    assert_eq!(
        dof_contact_type(&world, &vf, shoulder_dof),
        DofContactType::VertexFaceSelfCollision
    );
    // The elbow supports only the hand (body A here).
    assert_eq!(
        dof_contact_type(&world, &vf, elbow_dof),
        DofContactType::Vertex
    );
    assert_eq!(
        dof_contact_type(&world, &vf, outsider_dof),
        DofContactType::None
    );

    let ee = edge_edge_contact(hand, upper);
    assert_eq!(
        dof_contact_type(&world, &ee, shoulder_dof),
        DofContactType::EdgeEdgeSelfCollision
    );
    assert_eq!(dof_contact_type(&world, &ee, elbow_dof), DofContactType::EdgeB);
}

#[test]
fn force_direction_of_normal_row_is_the_normal() {
    let (_world, a_id, b_id) = edge_edge_world(5e-5);
    let contact = vertex_face_contact(
        BodyRef::new(a_id, BodyIndex(0)),
        BodyRef::new(b_id, BodyIndex(0)),
    );
    let constraint = DifferentiableContactConstraint::new(contact.clone(), 0);
    assert_eq!(constraint.force_direction(), contact.normal.into_inner());
}

#[test]
fn world_force_is_a_pure_force_wrench_at_the_contact_point() {
    let (_, a_id, b_id) = edge_edge_world(5e-5);
    let contact = Contact {
        point: point![0.4, -0.2, 0.7],
        normal: UnitVector3::new_normalize(vector![0.1, 0.9, 0.2]),
        ..vertex_face_contact(
            BodyRef::new(a_id, BodyIndex(0)),
            BodyRef::new(b_id, BodyIndex(0)),
        )
    };

    for basis_index in 0..3 {
        let constraint = DifferentiableContactConstraint::new(contact.clone(), basis_index);
        let direction = constraint.force_direction();
        let wrench = constraint.world_force();
        assert_abs_diff_eq!(wrench.linear, direction, epsilon = 1e-14);
        assert_abs_diff_eq!(
            wrench.angular,
            contact.point.coords.cross(&direction),
            epsilon = 1e-14
        );
    }
}

#[test]
fn tangent_rows_are_orthonormal_to_the_normal() {
    let (_, a_id, b_id) = edge_edge_world(5e-5);
    let contact = Contact {
        normal: UnitVector3::new_normalize(vector![0.3, 0.8, -0.1]),
        ..vertex_face_contact(
            BodyRef::new(a_id, BodyIndex(0)),
            BodyRef::new(b_id, BodyIndex(0)),
        )
    };
    let normal = contact.normal.into_inner();
    let t1 = DifferentiableContactConstraint::new(contact.clone(), 1).force_direction();
    let t2 = DifferentiableContactConstraint::new(contact, 2).force_direction();

    assert_abs_diff_eq!(t1.dot(&normal), 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(t2.dot(&normal), 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(t1.dot(&t2), 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(t1.norm(), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(t2.norm(), 1.0, epsilon = 1e-12);
}

#[test]
fn unrelated_dofs_get_zero_force_and_zero_gradients() {
    let (mut world, arm_id) = two_link_arm();
    let mut outsider = Skeleton::new("outsider");
    outsider
        .attach_body(
            None,
            "root",
            JointKind::Free,
            Isometry3::translation(5.0, 0.0, 0.0),
            Isometry3::identity(),
            "chunk",
            InertialProperties::of_point_mass(1.0),
        )
        .unwrap();
    let outsider_id = world.add_skeleton(outsider);

    let contact = vertex_face_contact(
        BodyRef::new(arm_id, BodyIndex(1)),
        BodyRef::new(arm_id, BodyIndex(0)),
    );
    let constraint = DifferentiableContactConstraint::new(contact, 0);
    let kinematics = world.kinematics();

    let outsider_dof = world.dof_offset(outsider_id);
    for dof in outsider_dof..outsider_dof + 6 {
        assert_eq!(constraint.force_multiple(&kinematics, dof), 0.0);
        assert_eq!(constraint.generalized_force(&kinematics)[dof], 0.0);
        assert_eq!(
            constraint.position_gradient(&kinematics, dof),
            Vector3::zeros()
        );
        assert_eq!(
            constraint.normal_gradient(&kinematics, dof),
            Vector3::zeros()
        );
        assert_eq!(
            constraint.force_direction_gradient(&kinematics, dof),
            Vector3::zeros()
        );
    }
}

#[test]
fn self_collision_cancels_forces_but_not_position_gradients() {
    // The elbow touches the hand: both bodies hang off the shoulder, so no
    // internal contact force can leak into the shoulder coordinate, yet the
    // contact point still moves when the shoulder moves.
    let (mut world, arm_id) = two_link_arm();
    world
        .skeleton_mut(arm_id)
        .set_positions(&nalgebra::dvector![0.3, -0.8]);

    let contact = vertex_face_contact(
        BodyRef::new(arm_id, BodyIndex(1)),
        BodyRef::new(arm_id, BodyIndex(0)),
    );
    let constraint = DifferentiableContactConstraint::new(contact, 0);
    let kinematics = world.kinematics();

    let shoulder_dof = world.dof_offset(arm_id);
    assert_eq!(constraint.force_multiple(&kinematics, shoulder_dof), 0.0);
    assert_eq!(constraint.generalized_force(&kinematics)[shoulder_dof], 0.0);

    let position_gradient = constraint.position_gradient(&kinematics, shoulder_dof);
    assert!(position_gradient.norm() > 1e-3);
}

#[test]
fn swapping_contact_bodies_negates_the_generalized_force() {
    let (mut world, arm_id) = two_link_arm();
    world
        .skeleton_mut(arm_id)
        .set_positions(&nalgebra::dvector![0.2, 0.5]);

    let contact = vertex_face_contact(
        BodyRef::new(arm_id, BodyIndex(1)),
        BodyRef::new(arm_id, BodyIndex(0)),
    );
    let swapped = Contact {
        body_a: contact.body_b,
        body_b: contact.body_a,
        kind: ContactKind::FaceVertex,
        ..contact.clone()
    };

    let kinematics = world.kinematics();
    let force = DifferentiableContactConstraint::new(contact, 0).generalized_force(&kinematics);
    let swapped_force =
        DifferentiableContactConstraint::new(swapped, 0).generalized_force(&kinematics);

    for dof in 0..world.dof_count() {
        assert_abs_diff_eq!(force[dof], -swapped_force[dof], epsilon = 1e-12);
    }
}

#[test]
fn edge_edge_yaw_of_body_a_leaves_the_normal_stationary() {
    // Both edges lie in planes orthogonal to the normal: rotating body A
    // about the normal axis itself gives (ẑ × x̂) × ŷ = ŷ × ŷ = 0.
    let (mut world, a_id, _) = edge_edge_world(5e-5);
    let snapshot = world.step_recorded();
    assert!(snapshot.constraint_count() > 0, "Contact was not detected");

    assert_abs_diff_eq!(
        snapshot.constraint(0).world_normal().into_inner(),
        vector![0.0, 0.0, 1.0],
        epsilon = 1e-9
    );

    // Force direction of the normal row is the normal; its Jacobian is
    // evaluated at the recorded pre-step state, where the yaw screw axis is
    // exactly the world z-axis.
    let direction_jacobian = snapshot.contact_force_direction_jacobian(&mut world, 0);
    let yaw_dof = world.dof_offset(a_id) + 2; // rotations are ordered x, y, z
    assert_abs_diff_eq!(
        direction_jacobian.column(yaw_dof).into_owned(),
        nalgebra::DVector::zeros(3),
        epsilon = 1e-12
    );
}

#[test]
fn normal_gradients_stay_orthogonal_to_the_normal() {
    let (mut world, _, _) = edge_edge_world(5e-5);
    let snapshot = world.step_recorded();
    assert!(snapshot.constraint_count() > 0);

    let kinematics = world.kinematics();
    let constraint = snapshot.constraint(0);
    let normal = constraint.world_normal().into_inner();
    for dof in 0..world.dof_count() {
        let gradient = constraint.normal_gradient(&kinematics, dof);
        assert_abs_diff_eq!(gradient.dot(&normal), 0.0, epsilon = 1e-10);
    }
}

#[test]
fn pendulum_contact_gradients_match_finite_differences() {
    let (mut world, _, _) = pendulum_on_plane(0.7, 1.2);
    let saved = adjoint_physics::snapshot::RestorableSnapshot::capture(&world);
    let reference = world.step_recorded();
    // Probe around the exact pre-step state the snapshot recorded.
    saved.restore(&mut world);
    assert_eq!(reference.constraint_count(), 1);

    let analytical_position = reference.contact_position_jacobian(&mut world, 0);
    let analytical_direction = reference.contact_force_direction_jacobian(&mut world, 0);
    let analytical_force = reference.contact_force_jacobian(&mut world, 0);

    let fd_position =
        fd_contact_position_jacobian(&mut world, &reference, 0, DEFAULT_STATE_EPSILON);
    let fd_direction =
        fd_contact_force_direction_jacobian(&mut world, &reference, 0, DEFAULT_STATE_EPSILON);
    let fd_force = fd_contact_force_jacobian(&mut world, &reference, 0, DEFAULT_STATE_EPSILON);

    assert!(fd_position.rejected_columns.is_empty());
    assert!(fd_direction.rejected_columns.is_empty());
    assert!(fd_force.rejected_columns.is_empty());

    assert!((analytical_position - fd_position.matrix).abs().max() < 1e-5);
    assert!((analytical_direction - fd_direction.matrix).abs().max() < 1e-5);
    assert!((analytical_force - fd_force.matrix).abs().max() < 1e-5);
}

#[test]
fn edge_edge_contact_gradients_match_finite_differences() {
    let (mut world, _, _) = edge_edge_world(5e-5);
    let saved = adjoint_physics::snapshot::RestorableSnapshot::capture(&world);
    let reference = world.step_recorded();
    saved.restore(&mut world);
    assert_eq!(reference.constraint_count(), 1);

    let analytical_position = reference.contact_position_jacobian(&mut world, 0);
    let analytical_direction = reference.contact_force_direction_jacobian(&mut world, 0);

    let fd_position =
        fd_contact_position_jacobian(&mut world, &reference, 0, DEFAULT_STATE_EPSILON);
    let fd_direction =
        fd_contact_force_direction_jacobian(&mut world, &reference, 0, DEFAULT_STATE_EPSILON);

    assert!(fd_position.rejected_columns.is_empty());
    assert!(fd_direction.rejected_columns.is_empty());

    assert!((analytical_position - fd_position.matrix).abs().max() < 1e-5);
    assert!((analytical_direction - fd_direction.matrix).abs().max() < 1e-5);
}

#[test]
fn unsupported_contacts_are_flagged_and_give_zero_gradients() {
    // An edge resting on a face is outside the differentiable feature set.
    let mut skeleton = Skeleton::new("bar");
    skeleton
        .attach_body(
            None,
            "root",
            JointKind::Free,
            Isometry3::identity(),
            Isometry3::identity(),
            "rod",
            InertialProperties::of_uniform_box([2.0, 0.05, 0.05], 1.0),
        )
        .unwrap();

    let mut world = World::new(GRAVITY, TIME_STEP);
    let rod_id = world.add_skeleton(skeleton);
    let ground_id = world.add_skeleton(fixed_plane_skeleton());

    let mut oracle = PrimitiveOracle::new();
    oracle.add_collider(
        BodyRef::new(rod_id, BodyIndex(0)),
        Shape::Segment {
            start: point![-1.0, 0.0, 0.0],
            end: point![1.0, 0.0, 0.0],
        },
        ContactResponseParameters::frictionless(),
    );
    oracle.add_collider(
        BodyRef::new(ground_id, BodyIndex(0)),
        Shape::HalfSpace {
            normal: Vector3::y_axis(),
            offset: 0.0,
        },
        ContactResponseParameters::frictionless(),
    );
    world.set_collision_oracle(Box::new(oracle));

    let snapshot = world.step_recorded();
    assert_eq!(snapshot.constraint_count(), 1);
    assert_eq!(snapshot.unsupported_rows(), &[0]);
    assert!(
        snapshot
            .flags()
            .contains(adjoint_physics::backprop::SnapshotFlags::HAS_UNSUPPORTED_ROWS)
    );

    // Gradients are suppressed, but the forward force path still works: the
    // rod must not fall through the plane.
    let kinematics = world.kinematics();
    let constraint = snapshot.constraint(0);
    for dof in 0..world.dof_count() {
        assert_eq!(
            constraint.position_gradient(&kinematics, dof),
            Vector3::zeros()
        );
        assert_eq!(
            constraint.normal_gradient(&kinematics, dof),
            Vector3::zeros()
        );
    }
    assert!(snapshot.impulses()[0] > 0.0);
}
