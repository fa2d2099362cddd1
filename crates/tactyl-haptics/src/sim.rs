//! The haptics simulation loop.
//!
//! Each tick: read the device pose, fold it through the workspace
//! calibration, update the cursor, compute the interaction force (grab
//! spring, contact algorithms, cursor mass, extra-force overlay), send the
//! force to the device, report the contact to the physics loop as a push
//! message, and emit collision events for fresh contact episodes.

use std::time::Duration;

use tracing::{info, warn};

use tactyl_core::math::{sanitize, Vec3};
use tactyl_core::osc::{OscArg, OscMessage};
use tactyl_core::value::{PropertyKind, SimTag};
use tactyl_world::bus::Envelope;
use tactyl_world::scene::{Scene, SceneChange, Shape, CURSOR_RADIUS};
use tactyl_world::simulation::{route, SimContext, Simulation};

use crate::cursor::{grab_force, CursorDynamics, ExtraForce};
use crate::device::HapticDevice;
use crate::proxy::{ContactInfo, ForceAlgorithm, PotentialField, SurfaceProxy};
use crate::workspace::WorkspaceMap;

/// Name of the haptic tool cursor object.
pub const CURSOR_NAME: &str = "cursor";

/// Haptic ticks between `/force/magnitude` events (~30 Hz at 1 kHz).
const FORCE_EVENT_INTERVAL: u64 = 33;

fn default_algorithms() -> Vec<Box<dyn ForceAlgorithm>> {
    vec![
        Box::new(SurfaceProxy::new()),
        Box::new(PotentialField::new()),
    ]
}

/// The haptics simulation.
pub struct HapticsSim {
    scene: Scene,
    device: Box<dyn HapticDevice>,
    self_timed: bool,
    workspace: WorkspaceMap,
    dynamics: CursorDynamics,
    extra: ExtraForce,
    extra_ticks: u32,
    algorithms: Vec<Box<dyn ForceAlgorithm>>,
    grabbed: Option<String>,
    counter: u64,
    timestep: Duration,
    last_cursor_pos: Vec3,
    done: bool,
}

impl HapticsSim {
    /// Create the haptics simulation around a device.
    ///
    /// `extra_ticks` bounds the lifetime of an externally applied cursor
    /// force (see [`ExtraForce`]).
    #[must_use]
    pub fn new(timestep: Duration, extra_ticks: u32, device: Box<dyn HapticDevice>) -> Self {
        let self_timed = !device.self_paced();
        Self {
            scene: Scene::new(SimTag::Haptics),
            device,
            self_timed,
            workspace: WorkspaceMap::new(),
            dynamics: CursorDynamics::new(),
            extra: ExtraForce::new(),
            extra_ticks,
            algorithms: default_algorithms(),
            grabbed: None,
            counter: 0,
            timestep,
            last_cursor_pos: Vec3::zeros(),
            done: false,
        }
    }

    /// Read access to the scene, for tests and inspection.
    #[must_use]
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Currently grabbed object, if any.
    #[must_use]
    pub fn grabbed(&self) -> Option<&str> {
        self.grabbed.as_deref()
    }

    /// Create the local cursor object and request its visual counterpart.
    fn ensure_cursor(&mut self, ctx: &SimContext) {
        if self.scene.object(CURSOR_NAME).is_none() {
            let _ = self.scene.create_object(
                CURSOR_NAME,
                Shape::Cursor {
                    radius: CURSOR_RADIUS,
                },
                Vec3::zeros(),
            );
        }

        ctx.sendto(
            SimTag::Visual,
            false,
            OscMessage::new(
                "/world/sphere/create",
                vec![
                    OscArg::from(CURSOR_NAME),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                ],
            ),
        );
        ctx.sendto(
            SimTag::Visual,
            false,
            OscMessage::floats("/world/cursor/color", &[1.0, 1.0, 0.0]),
        );
    }

    /// Grab an object (releasing any previous grab) or release.
    fn set_grabbed(&mut self, ctx: &SimContext, name: Option<String>) {
        // Return the previous object to haptic contact.
        if let Some(prev) = self.grabbed.take() {
            if let Some(object) = self.scene.object_mut(&prev) {
                object.haptic_enabled = true;
            }
        }

        if let Some(name) = name {
            if let Some(object) = self.scene.object_mut(&name) {
                object.haptic_enabled = false;
                info!("grabbed {}", name);
                self.grabbed = Some(name);
            }
        }

        // The visual cursor hides while an object is held.
        let visible = i32::from(self.grabbed.is_none());
        ctx.sendto(
            SimTag::Visual,
            false,
            OscMessage::new("/world/cursor/visible", vec![OscArg::Int(visible)]),
        );
    }

    fn apply_change(&mut self, ctx: &SimContext, change: SceneChange) {
        match change {
            SceneChange::PropertyChanged { name, kind } if name == CURSOR_NAME => {
                match kind {
                    PropertyKind::Force => {
                        // An externally applied device force; kept alive for
                        // a bounded number of ticks.
                        let force = self
                            .scene
                            .object(CURSOR_NAME)
                            .map(|c| c.force)
                            .unwrap_or_else(Vec3::zeros);
                        let (force, clamped) = sanitize(force);
                        if clamped {
                            ctx.counters().count_nonfinite_force();
                        }
                        self.extra.set(force, self.extra_ticks);
                    }
                    PropertyKind::Mass => {
                        let mass = self
                            .scene
                            .object(CURSOR_NAME)
                            .map_or(0.0, |c| c.mass);
                        self.dynamics.set_mass(mass);
                    }
                    _ => {}
                }
            }
            SceneChange::GrabRequested { name } => {
                self.set_grabbed(ctx, name);
            }
            SceneChange::ObjectDestroyed { name } => {
                if self.grabbed.as_deref() == Some(name.as_str()) {
                    self.set_grabbed(ctx, None);
                }
                for algorithm in &mut self.algorithms {
                    algorithm.forget(&name);
                }
            }
            SceneChange::Cleared => {
                self.grabbed = None;
                self.algorithms = default_algorithms();
                self.ensure_cursor(ctx);
            }
            _ => {}
        }
    }

    fn tool_radius(&self) -> f32 {
        match self.scene.object(CURSOR_NAME).map(|c| &c.shape) {
            Some(Shape::Cursor { radius } | Shape::Sphere { radius }) => *radius,
            _ => CURSOR_RADIUS,
        }
    }

    fn report_contact(&mut self, ctx: &SimContext, contact: &ContactInfo, cursor_vel: Vec3) {
        // The physics loop applies the reaction force at the contact point.
        ctx.sendto(
            SimTag::Physics,
            false,
            OscMessage::floats(
                &format!("/world/{}/push", contact.object),
                &[
                    -contact.force.x,
                    -contact.force.y,
                    -contact.force.z,
                    contact.point.x,
                    contact.point.y,
                    contact.point.z,
                ],
            ),
        );

        let Some(object) = self.scene.object(&contact.object) else {
            return;
        };
        let relative_speed = (object.velocity - cursor_vel).norm();
        let object_collide = object.collide;
        let cursor_collide = self
            .scene
            .object(CURSOR_NAME)
            .is_some_and(|c| c.collide);

        let fresh_object = self
            .scene
            .object_mut(&contact.object)
            .is_some_and(|o| o.collided_with(CURSOR_NAME, self.counter));
        let fresh_cursor = self
            .scene
            .object_mut(CURSOR_NAME)
            .is_some_and(|c| c.collided_with(&contact.object, self.counter));

        if fresh_object && object_collide {
            ctx.emit(&OscMessage::new(
                format!("/world/{}/collide", contact.object),
                vec![OscArg::from(CURSOR_NAME), OscArg::Float(relative_speed)],
            ));
        }
        if fresh_cursor && cursor_collide {
            ctx.emit(&OscMessage::new(
                format!("/world/{CURSOR_NAME}/collide"),
                vec![
                    OscArg::from(contact.object.as_str()),
                    OscArg::Float(relative_speed),
                ],
            ));
        }
        if (fresh_object || fresh_cursor) && (object_collide || cursor_collide) {
            ctx.emit(&OscMessage::new(
                "/world/collide",
                vec![
                    OscArg::from(contact.object.as_str()),
                    OscArg::from(CURSOR_NAME),
                    OscArg::Float(relative_speed),
                ],
            ));
        }
    }
}

impl Simulation for HapticsSim {
    fn tag(&self) -> SimTag {
        SimTag::Haptics
    }

    fn timestep(&self) -> Duration {
        self.timestep
    }

    fn self_timed(&self) -> bool {
        self.self_timed
    }

    fn initialize(&mut self, ctx: &SimContext) -> bool {
        if let Err(e) = self.device.open() {
            warn!("haptics disabled: {}", e);
            return false;
        }
        info!("using {} haptic device", self.device.name());

        self.ensure_cursor(ctx);
        self.workspace.reset();
        self.counter = 0;
        self.grabbed = None;
        true
    }

    fn dispatch(&mut self, ctx: &SimContext, env: &Envelope) {
        let changes = route(&mut self.scene, ctx, env);
        for change in changes {
            self.apply_change(ctx, change);
        }
    }

    fn step(&mut self, ctx: &SimContext) {
        let dt = self.timestep.as_secs_f32();

        let raw = match self.device.read_pose() {
            Ok(pose) => pose,
            Err(e) => {
                warn!("haptic device lost: {}", e);
                self.done = true;
                return;
            }
        };
        let pos = self.workspace.map(raw);

        let cursor_vel = (pos - self.last_cursor_pos) / dt;
        self.last_cursor_pos = pos;
        if let Some(cursor) = self.scene.object_mut(CURSOR_NAME) {
            cursor.acceleration = cursor_vel - cursor.velocity;
            cursor.velocity = cursor_vel;
            cursor.position = pos;
        }

        // Interaction force: grab spring overrides the contact algorithms.
        let mut contact: Option<ContactInfo> = None;
        let grab_target = self
            .grabbed
            .as_ref()
            .and_then(|name| self.scene.object(name).map(|o| o.position));
        let mut force = if let Some(object_pos) = grab_target {
            grab_force(pos, cursor_vel, object_pos)
        } else {
            let tool_radius = self.tool_radius();
            let mut interaction = Vec3::zeros();
            for algorithm in &mut self.algorithms {
                if let Some(found) = algorithm.compute(&self.scene, pos, tool_radius) {
                    interaction = found.force;
                    contact = Some(found);
                    break;
                }
            }
            interaction + self.dynamics.force(pos, dt)
        };

        force += self.extra.take();

        let (force, clamped) = sanitize(force);
        if clamped {
            ctx.counters().count_nonfinite_force();
        }
        if self.device.write_force(force).is_err() {
            warn!("haptic device lost while writing force");
            self.done = true;
            return;
        }

        self.counter += 1;

        ctx.sendto(
            SimTag::Visual,
            false,
            OscMessage::floats("/world/cursor/position", &[pos.x, pos.y, pos.z]),
        );

        if let Some(contact) = contact.take() {
            self.report_contact(ctx, &contact, cursor_vel);
        }

        if self.counter % FORCE_EVENT_INTERVAL == 0 {
            let magnitude = force.norm();
            if magnitude > 0.0 {
                ctx.emit(&OscMessage::floats("/force/magnitude", &[magnitude]));
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}
