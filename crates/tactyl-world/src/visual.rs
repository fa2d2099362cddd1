//! The visual simulation: a render mirror.
//!
//! Maintains its replica of the scene at display rate and publishes a
//! [`RenderFrame`] snapshot for a renderer to consume. Windowing and GPU
//! work are out of scope; this simulation is the sink end of the pose
//! stream.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tactyl_core::math::{Color, Mat3, Vec3};
use tactyl_core::value::SimTag;

use crate::bus::Envelope;
use crate::scene::{Scene, Shape};
use crate::simulation::{route, SimContext, Simulation};

/// Renderable geometry of one instance.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderShape {
    /// Sphere with a radius.
    Sphere {
        /// Radius in meters.
        radius: f32,
    },
    /// Box with full extents.
    Box {
        /// Full extents.
        size: Vec3,
    },
    /// Mesh file scaled to full extents.
    Mesh {
        /// Full extents.
        size: Vec3,
        /// Source file path.
        filename: String,
    },
}

/// One object in a render frame.
#[derive(Clone, Debug)]
pub struct RenderInstance {
    /// Object name.
    pub name: String,
    /// Geometry.
    pub shape: RenderShape,
    /// World-space position.
    pub position: Vec3,
    /// Rotation matrix.
    pub rotation: Mat3,
    /// Display color.
    pub color: Color,
    /// Texture image path, if set.
    pub texture_image: Option<String>,
    /// Whether the instance should be drawn.
    pub visible: bool,
}

/// A snapshot of everything drawable.
#[derive(Clone, Debug, Default)]
pub struct RenderFrame {
    /// Frame number since the simulation started.
    pub tick: u64,
    /// Drawable instances.
    pub instances: Vec<RenderInstance>,
}

/// Shared handle to the most recent frame.
pub type FrameHandle = Arc<RwLock<RenderFrame>>;

/// The visual simulation.
pub struct VisualSim {
    scene: Scene,
    timestep: Duration,
    tick: u64,
    frame: FrameHandle,
}

impl VisualSim {
    /// Create the visual simulation.
    #[must_use]
    pub fn new(timestep: Duration) -> Self {
        Self {
            scene: Scene::new(SimTag::Visual),
            timestep,
            tick: 0,
            frame: Arc::new(RwLock::new(RenderFrame::default())),
        }
    }

    /// Handle to the most recent frame, for the renderer.
    #[must_use]
    pub fn frame_handle(&self) -> FrameHandle {
        Arc::clone(&self.frame)
    }

    fn build_frame(&self) -> RenderFrame {
        let mut instances = Vec::with_capacity(self.scene.object_count());

        for obj in self.scene.objects() {
            let shape = match &obj.shape {
                Shape::Sphere { radius } | Shape::Cursor { radius } => {
                    RenderShape::Sphere { radius: *radius }
                }
                Shape::Prism { size } => RenderShape::Box { size: *size },
                Shape::Mesh { size, filename, .. } => RenderShape::Mesh {
                    size: *size,
                    filename: filename.clone(),
                },
                // Composites have no geometry of their own.
                Shape::Composite { .. } => continue,
            };

            instances.push(RenderInstance {
                name: obj.name.clone(),
                shape,
                position: obj.position,
                rotation: obj.rotation,
                color: obj.color,
                texture_image: obj.texture_image.clone(),
                visible: obj.visible,
            });
        }

        RenderFrame {
            tick: self.tick,
            instances,
        }
    }
}

impl Simulation for VisualSim {
    fn tag(&self) -> SimTag {
        SimTag::Visual
    }

    fn timestep(&self) -> Duration {
        self.timestep
    }

    fn dispatch(&mut self, ctx: &SimContext, env: &Envelope) {
        // The mirror has no backend; storing the replica is the whole job.
        let _ = route(&mut self.scene, ctx, env);
    }

    fn step(&mut self, _ctx: &SimContext) {
        self.tick += 1;
        let frame = self.build_frame();
        if let Ok(mut slot) = self.frame.write() {
            *slot = frame;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Origin, Router};
    use tactyl_core::osc::{OscArg, OscMessage};

    fn ctx() -> SimContext {
        SimContext::new(SimTag::Visual, Router::new(None))
    }

    fn dispatch(sim: &mut VisualSim, ctx: &SimContext, msg: OscMessage) {
        sim.dispatch(ctx, &Envelope::new(msg, Origin::Bus));
    }

    #[test]
    fn test_frame_mirrors_scene() {
        let ctx = ctx();
        let mut sim = VisualSim::new(Duration::from_millis(33));
        let frame = sim.frame_handle();

        dispatch(
            &mut sim,
            &ctx,
            OscMessage::new(
                "/world/sphere/create",
                vec![
                    OscArg::from("s1"),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                    OscArg::Float(0.1),
                ],
            ),
        );
        dispatch(
            &mut sim,
            &ctx,
            OscMessage::floats("/world/s1/color", &[1.0, 0.0, 0.0]),
        );
        sim.step(&ctx);

        let frame = frame.read().unwrap();
        assert_eq!(frame.tick, 1);
        assert_eq!(frame.instances.len(), 1);
        let inst = &frame.instances[0];
        assert_eq!(inst.name, "s1");
        assert!((inst.position.z - 0.1).abs() < 1e-6);
        assert!((inst.color.r - 1.0).abs() < 1e-6);
        assert!(inst.visible);
    }

    #[test]
    fn test_visibility_toggle() {
        let ctx = ctx();
        let mut sim = VisualSim::new(Duration::from_millis(33));

        dispatch(
            &mut sim,
            &ctx,
            OscMessage::new(
                "/world/sphere/create",
                vec![
                    OscArg::from("cursor"),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                ],
            ),
        );
        dispatch(
            &mut sim,
            &ctx,
            OscMessage::new("/world/cursor/visible", vec![OscArg::Int(0)]),
        );
        sim.step(&ctx);

        let frame = sim.frame_handle();
        let frame = frame.read().unwrap();
        assert!(!frame.instances[0].visible);
    }

    #[test]
    fn test_destroy_removes_instance() {
        let ctx = ctx();
        let mut sim = VisualSim::new(Duration::from_millis(33));

        dispatch(
            &mut sim,
            &ctx,
            OscMessage::new(
                "/world/sphere/create",
                vec![
                    OscArg::from("s1"),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                ],
            ),
        );
        dispatch(&mut sim, &ctx, OscMessage::new("/world/s1/destroy", vec![]));
        sim.step(&ctx);

        let frame = sim.frame_handle();
        assert!(frame.read().unwrap().instances.is_empty());
    }
}
