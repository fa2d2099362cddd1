//! Rigid-body solver wrapper.
//!
//! Everything rapier-specific lives here: body/collider bookkeeping keyed by
//! object name, joint creation with motor-state readout, transient force
//! handling, and the per-step pipeline call. The rest of the physics tier
//! talks to this wrapper only.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use nalgebra::{Isometry3, Rotation3, Unit, UnitQuaternion};
use rapier3d::prelude::{
    CCDSolver, ColliderBuilder, ColliderHandle, ColliderSet, DefaultBroadPhase,
    FixedJointBuilder, GenericJoint, GenericJointBuilder, ImpulseJointHandle, ImpulseJointSet,
    IntegrationParameters, IslandManager, JointAxesMask, MultibodyJointSet, NarrowPhase,
    PhysicsPipeline, PrismaticJointBuilder, QueryPipeline, RevoluteJointBuilder,
    RigidBodyBuilder, RigidBodyHandle, RigidBodySet, RigidBodyType, SharedShape,
    SphericalJointBuilder,
};
use thiserror::Error;
use tracing::debug;

use tactyl_core::math::{Mat3, Vec3};
use tactyl_world::scene::{Constraint, ConstraintKind, Object, Shape};

/// Iterations of the velocity solver, matching the fast iterative step of
/// the reference environment.
const SOLVER_ITERATIONS: usize = 5;
/// Contact friction coefficient; effectively rigid grip.
const CONTACT_FRICTION: f32 = 1.0e3;
/// Contact restitution.
const CONTACT_RESTITUTION: f32 = 0.1;

/// Errors from the solver wrapper.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The named object has no body in the solver
    #[error("No body for object: {0}")]
    NoBody(String),

    /// The named constraint has no joint in the solver
    #[error("No joint for constraint: {0}")]
    NoJoint(String),

    /// A triangle mesh was rejected by the collision backend
    #[error("Invalid triangle mesh for {name}: {reason}")]
    InvalidMesh {
        /// Object name
        name: String,
        /// Backend diagnostic
        reason: String,
    },
}

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// Joint angle/rate readout for motor torques.
#[derive(Clone, Copy, Debug, Default)]
pub struct MotorState {
    /// Rotation about the first axis.
    pub angle1: f32,
    /// Angular rate about the first axis.
    pub rate1: f32,
    /// Rotation about the second axis (zero for single-axis joints).
    pub angle2: f32,
    /// Angular rate about the second axis.
    pub rate2: f32,
}

struct JointRecord {
    handle: ImpulseJointHandle,
    body1: RigidBodyHandle,
    body2: RigidBodyHandle,
    /// Motor axes in body1's local frame at creation.
    axis1: Option<Unit<Vec3>>,
    axis2: Option<Unit<Vec3>>,
    /// Relative rotation of body2 w.r.t. body1 at creation.
    initial_rel: UnitQuaternion<f32>,
}

/// The rigid-body world, keyed by object and constraint name.
pub struct RigidSolver {
    bodies: RigidBodySet,
    colliders: ColliderSet,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd: CCDSolver,
    query_pipeline: QueryPipeline,
    gravity: Vec3,

    /// Fixed body backing constraints against the static world.
    world_anchor: RigidBodyHandle,

    body_of: HashMap<String, RigidBodyHandle>,
    collider_of: HashMap<String, ColliderHandle>,
    joint_of: HashMap<String, JointRecord>,
    /// Children whose body handle belongs to their composite.
    adopted: HashSet<String>,

    /// Bodies with transient forces to clear after the step.
    forced: Vec<RigidBodyHandle>,
}

impl RigidSolver {
    /// Create a solver with the given gravity and timestep.
    #[must_use]
    pub fn new(gravity: Vec3, dt: f32) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = dt;
        if let Some(iterations) = NonZeroUsize::new(SOLVER_ITERATIONS) {
            integration_parameters.num_solver_iterations = iterations;
        }

        let mut bodies = RigidBodySet::new();
        let world_anchor = bodies.insert(RigidBodyBuilder::fixed().build());

        Self {
            bodies,
            colliders: ColliderSet::new(),
            integration_parameters,
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            gravity,
            world_anchor,
            body_of: HashMap::new(),
            collider_of: HashMap::new(),
            joint_of: HashMap::new(),
            adopted: HashSet::new(),
            forced: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Add a body (and collider, for shaped objects) for a scene object.
    pub fn add_object(&mut self, object: &Object) -> SolverResult<()> {
        let body_type = if object.is_dynamic() {
            RigidBodyType::Dynamic
        } else {
            RigidBodyType::KinematicPositionBased
        };

        let body = RigidBodyBuilder::new(body_type)
            .translation(object.position)
            .additional_mass(object.mass)
            .build();
        let body_handle = self.bodies.insert(body);
        self.body_of.insert(object.name.clone(), body_handle);

        if let Some(shape) = self.shared_shape(object)? {
            // Unit density keeps a sane angular inertia; the requested mass
            // rides on top as additional mass.
            let collider = ColliderBuilder::new(shape)
                .friction(CONTACT_FRICTION)
                .restitution(CONTACT_RESTITUTION)
                .build();
            let collider_handle =
                self.colliders
                    .insert_with_parent(collider, body_handle, &mut self.bodies);
            self.collider_of.insert(object.name.clone(), collider_handle);
        }

        Ok(())
    }

    fn shared_shape(&self, object: &Object) -> SolverResult<Option<SharedShape>> {
        match &object.shape {
            Shape::Sphere { radius } | Shape::Cursor { radius } => {
                Ok(Some(SharedShape::ball(radius.max(1e-4))))
            }
            Shape::Prism { size } => Ok(Some(SharedShape::cuboid(
                (size.x / 2.0).max(1e-4),
                (size.y / 2.0).max(1e-4),
                (size.z / 2.0).max(1e-4),
            ))),
            Shape::Mesh { size, data, .. } => {
                let vertices = data
                    .scaled_vertices(*size)
                    .into_iter()
                    .map(nalgebra::Point3::from)
                    .collect();
                let shape = SharedShape::trimesh(vertices, data.indices.clone());
                Ok(Some(shape))
            }
            // A composite starts as an empty body; children bring geometry.
            Shape::Composite { .. } => Ok(None),
        }
    }

    /// Remove an object's body and collider. An adopted child only sheds
    /// its collider; the shared body stays with the composite.
    pub fn remove_object(&mut self, name: &str) {
        if let Some(collider) = self.collider_of.remove(name) {
            self.colliders
                .remove(collider, &mut self.islands, &mut self.bodies, true);
        }
        let shares_parent_body = self.adopted.remove(name);
        if let Some(body) = self.body_of.remove(name) {
            if !shares_parent_body {
                self.bodies.remove(
                    body,
                    &mut self.islands,
                    &mut self.colliders,
                    &mut self.impulse_joints,
                    &mut self.multibody_joints,
                    false,
                );
            }
        }
    }

    /// Re-parent a child's collider onto its composite's body, discarding
    /// the child's own body. The child keeps its world pose as a fixed
    /// offset from the composite.
    pub fn adopt_child(&mut self, parent: &str, child: &str) -> SolverResult<()> {
        let parent_body = *self
            .body_of
            .get(parent)
            .ok_or_else(|| SolverError::NoBody(parent.to_string()))?;
        let child_body = *self
            .body_of
            .get(child)
            .ok_or_else(|| SolverError::NoBody(child.to_string()))?;

        if let Some(&collider_handle) = self.collider_of.get(child) {
            let child_pose = *self
                .bodies
                .get(child_body)
                .ok_or_else(|| SolverError::NoBody(child.to_string()))?
                .position();
            let parent_pose = *self
                .bodies
                .get(parent_body)
                .ok_or_else(|| SolverError::NoBody(parent.to_string()))?
                .position();

            self.colliders
                .set_parent(collider_handle, Some(parent_body), &mut self.bodies);
            if let Some(collider) = self.colliders.get_mut(collider_handle) {
                collider.set_position_wrt_parent(parent_pose.inv_mul(&child_pose));
            }
        }

        self.bodies.remove(
            child_body,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            false,
        );
        self.body_of.insert(child.to_string(), parent_body);
        self.adopted.insert(child.to_string());

        debug!("{} collider re-parented onto {}", child, parent);
        Ok(())
    }

    // ------------------------------------------------------------------
    // State access
    // ------------------------------------------------------------------

    fn body(&self, name: &str) -> SolverResult<RigidBodyHandle> {
        self.body_of
            .get(name)
            .copied()
            .ok_or_else(|| SolverError::NoBody(name.to_string()))
    }

    /// World pose of an object. Composite children report their collider's
    /// world pose; everything else reports the body pose.
    #[must_use]
    pub fn pose(&self, name: &str) -> Option<(Vec3, Mat3)> {
        if let Some(&collider) = self.collider_of.get(name) {
            let iso = self.colliders.get(collider)?.position();
            return Some((iso.translation.vector, iso.rotation.to_rotation_matrix().into_inner()));
        }
        let body = self.bodies.get(*self.body_of.get(name)?)?;
        Some((
            *body.translation(),
            body.rotation().to_rotation_matrix().into_inner(),
        ))
    }

    /// Linear velocity of an object's body.
    #[must_use]
    pub fn velocity(&self, name: &str) -> Option<Vec3> {
        let body = self.bodies.get(*self.body_of.get(name)?)?;
        Some(*body.linvel())
    }

    /// Set an object's position (teleport).
    pub fn set_position(&mut self, name: &str, position: Vec3) -> SolverResult<()> {
        let handle = self.body(name)?;
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_translation(position, true);
            if body.is_kinematic() {
                body.set_next_kinematic_translation(position);
            }
        }
        Ok(())
    }

    /// Set an object's rotation.
    pub fn set_rotation(&mut self, name: &str, rotation: &Mat3) -> SolverResult<()> {
        let handle = self.body(name)?;
        if let Some(body) = self.bodies.get_mut(handle) {
            let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
                *rotation,
            ));
            body.set_rotation(q, true);
        }
        Ok(())
    }

    /// Set an object's linear velocity.
    pub fn set_velocity(&mut self, name: &str, velocity: Vec3) -> SolverResult<()> {
        let handle = self.body(name)?;
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_linvel(velocity, true);
        }
        Ok(())
    }

    /// Set an object's mass; zero switches the body to kinematic.
    pub fn set_mass(&mut self, name: &str, mass: f32) -> SolverResult<()> {
        let handle = self.body(name)?;
        if let Some(body) = self.bodies.get_mut(handle) {
            if mass > 0.0 {
                body.set_body_type(RigidBodyType::Dynamic, true);
                body.set_additional_mass(mass, true);
            } else {
                body.set_body_type(RigidBodyType::KinematicPositionBased, true);
            }
        }
        Ok(())
    }

    /// Replace an object's collider shape (radius/size change).
    pub fn set_shape(&mut self, object: &Object) -> SolverResult<()> {
        let Some(shape) = self.shared_shape(object)? else {
            return Ok(());
        };
        let collider_handle = self
            .collider_of
            .get(&object.name)
            .copied()
            .ok_or_else(|| SolverError::NoBody(object.name.clone()))?;
        if let Some(collider) = self.colliders.get_mut(collider_handle) {
            collider.set_shape(shape);
        }
        Ok(())
    }

    /// Apply a transient force at the body's center of mass.
    pub fn add_force(&mut self, name: &str, force: Vec3) -> SolverResult<()> {
        let handle = self.body(name)?;
        if let Some(body) = self.bodies.get_mut(handle) {
            body.add_force(force, true);
            self.forced.push(handle);
        }
        Ok(())
    }

    /// Apply a transient force at a world-space point.
    pub fn add_force_at_point(&mut self, name: &str, force: Vec3, point: Vec3) -> SolverResult<()> {
        let handle = self.body(name)?;
        if let Some(body) = self.bodies.get_mut(handle) {
            body.add_force_at_point(force, point.into(), true);
            self.forced.push(handle);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Joints
    // ------------------------------------------------------------------

    /// Create the joint backing a constraint.
    pub fn create_joint(&mut self, constraint: &Constraint) -> SolverResult<()> {
        let body1 = self.body(&constraint.object1)?;
        let body2 = match &constraint.object2 {
            Some(name) => self.body(name)?,
            None => self.world_anchor,
        };

        let pose1 = *self
            .bodies
            .get(body1)
            .ok_or_else(|| SolverError::NoBody(constraint.object1.clone()))?
            .position();
        let pose2 = *self
            .bodies
            .get(body2)
            .ok_or_else(|| SolverError::NoJoint(constraint.name.clone()))?
            .position();

        let local_anchor = |anchor: &Vec3, pose: &Isometry3<f32>| {
            pose.inverse_transform_point(&nalgebra::Point3::from(*anchor))
        };
        let unit = |v: &Vec3| Unit::new_normalize(if v.norm() > 1e-6 { *v } else { Vec3::x() });

        let (joint, axis1, axis2): (GenericJoint, Option<Unit<Vec3>>, Option<Unit<Vec3>>) =
            match &constraint.kind {
                ConstraintKind::Ball { anchor } => (
                    SphericalJointBuilder::new()
                        .local_anchor1(local_anchor(anchor, &pose1))
                        .local_anchor2(local_anchor(anchor, &pose2))
                        .build()
                        .into(),
                    None,
                    None,
                ),
                ConstraintKind::Hinge { anchor, axis } => (
                    RevoluteJointBuilder::new(unit(axis))
                        .local_anchor1(local_anchor(anchor, &pose1))
                        .local_anchor2(local_anchor(anchor, &pose2))
                        .build()
                        .into(),
                    Some(unit(axis)),
                    None,
                ),
                ConstraintKind::Hinge2 { anchor, axis1, axis2 }
                | ConstraintKind::Universal { anchor, axis1, axis2 } => {
                    // Two free rotational axes, translations locked.
                    let locked = JointAxesMask::LIN_X
                        | JointAxesMask::LIN_Y
                        | JointAxesMask::LIN_Z
                        | JointAxesMask::ANG_Z;
                    (
                        GenericJointBuilder::new(locked)
                            .local_anchor1(local_anchor(anchor, &pose1))
                            .local_anchor2(local_anchor(anchor, &pose2))
                            .local_axis1(unit(axis1))
                            .local_axis2(unit(axis2))
                            .build(),
                        Some(unit(axis1)),
                        Some(unit(axis2)),
                    )
                }
                ConstraintKind::Slider { axis } => (
                    PrismaticJointBuilder::new(unit(axis)).build().into(),
                    None,
                    None,
                ),
                ConstraintKind::Fixed => (FixedJointBuilder::new().build().into(), None, None),
            };

        let handle = self.impulse_joints.insert(body1, body2, joint, true);

        // Motor axes are kept in body1's local frame so angle readout
        // survives body motion.
        let to_local1 = |axis: Option<Unit<Vec3>>| {
            axis.map(|a| Unit::new_normalize(pose1.rotation.inverse_transform_vector(a.as_ref())))
        };
        let initial_rel = pose1.rotation.inverse() * pose2.rotation;

        self.joint_of.insert(
            constraint.name.clone(),
            JointRecord {
                handle,
                body1,
                body2,
                axis1: to_local1(axis1),
                axis2: to_local1(axis2),
                initial_rel,
            },
        );

        debug!(
            "joint {} created between {} and {}",
            constraint.name,
            constraint.object1,
            constraint.object2.as_deref().unwrap_or("world")
        );
        Ok(())
    }

    /// Remove the joint backing a constraint.
    pub fn remove_joint(&mut self, name: &str) {
        if let Some(record) = self.joint_of.remove(name) {
            self.impulse_joints.remove(record.handle, true);
        }
    }

    /// Angle and rate about each motor axis of a joint.
    #[must_use]
    pub fn motor_state(&self, name: &str) -> Option<MotorState> {
        let record = self.joint_of.get(name)?;
        let body1 = self.bodies.get(record.body1)?;
        let body2 = self.bodies.get(record.body2)?;

        let q1 = body1.rotation();
        let q2 = body2.rotation();
        let rel = q1.inverse() * q2;
        let disp = record.initial_rel.inverse() * rel;
        let omega = body2.angvel() - body1.angvel();

        let read_axis = |axis: &Option<Unit<Vec3>>| {
            axis.as_ref().map_or((0.0, 0.0), |a| {
                let world_axis = q1 * a.into_inner();
                (twist_angle(&disp, a), omega.dot(&world_axis))
            })
        };

        let (angle1, rate1) = read_axis(&record.axis1);
        let (angle2, rate2) = read_axis(&record.axis2);
        Some(MotorState {
            angle1,
            rate1,
            angle2,
            rate2,
        })
    }

    /// Apply a motor torque about one of a joint's axes.
    pub fn apply_joint_torque(&mut self, name: &str, axis_index: usize, torque: f32) {
        let Some(record) = self.joint_of.get(name) else {
            return;
        };
        let axis = match axis_index {
            0 => record.axis1,
            _ => record.axis2,
        };
        let Some(axis) = axis else {
            return;
        };
        let Some(q1) = self.bodies.get(record.body1).map(|b| *b.rotation()) else {
            return;
        };
        let world_axis = q1 * axis.into_inner();
        let (body1, body2) = (record.body1, record.body2);

        if let Some(body) = self.bodies.get_mut(body2) {
            if body.is_dynamic() {
                body.add_torque(world_axis * torque, true);
                self.forced.push(body2);
            }
        }
        if let Some(body) = self.bodies.get_mut(body1) {
            if body.is_dynamic() {
                body.add_torque(world_axis * -torque, true);
                self.forced.push(body1);
            }
        }
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Integrate one step, then clear transient forces.
    pub fn step(&mut self) {
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );

        for handle in self.forced.drain(..) {
            if let Some(body) = self.bodies.get_mut(handle) {
                body.reset_forces(true);
                body.reset_torques(true);
            }
        }
    }
}

/// Rotation of `disp` projected onto `axis` (swing-twist decomposition).
fn twist_angle(disp: &UnitQuaternion<f32>, axis: &Unit<Vec3>) -> f32 {
    let s = disp.imag().dot(axis.as_ref());
    2.0 * s.atan2(disp.w)
}
