//! Contact force algorithms.
//!
//! Two algorithms run per cursor: a surface proxy for sphere/box/mesh
//! geometry and a potential field for field-emitting objects. Each tick the
//! cursor scans them in order and the first one reporting a contact wins.
//!
//! The surface proxy is a massless point held on the outside of surfaces:
//! when the device penetrates an object, the proxy is the closest surface
//! point against the object's *current* pose (so moving obstacles are
//! handled), and the rendered force is the proxy-device spring.

use std::collections::HashMap;

use nalgebra::{Isometry3, Point3, Rotation3, Translation3, UnitQuaternion};
use rapier3d::parry::query::PointQuery;
use rapier3d::parry::shape::{Ball, Cuboid, TriMesh};

use tactyl_core::math::Vec3;
use tactyl_world::scene::{Object, Scene, Shape};

/// Spring stiffness between proxy and device.
const SURFACE_STIFFNESS: f32 = 300.0;

/// A contact reported by a force algorithm.
#[derive(Clone, Debug)]
pub struct ContactInfo {
    /// Name of the contacted object.
    pub object: String,
    /// World-space contact point (on the surface).
    pub point: Vec3,
    /// Force to render to the device.
    pub force: Vec3,
}

/// One interaction force algorithm.
pub trait ForceAlgorithm: Send {
    /// Compute the interaction force for the current device position, or
    /// `None` when nothing is contacted.
    fn compute(&mut self, scene: &Scene, device_pos: Vec3, tool_radius: f32)
        -> Option<ContactInfo>;

    /// Drop any cached state for an object that no longer exists.
    fn forget(&mut self, _name: &str) {}
}

fn object_pose(object: &Object) -> Isometry3<f32> {
    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(object.rotation));
    Isometry3::from_parts(Translation3::from(object.position), rotation)
}

// ============================================================================
// Surface Proxy
// ============================================================================

struct MeshEntry {
    size: Vec3,
    shape: TriMesh,
}

/// The surface-proxy algorithm.
pub struct SurfaceProxy {
    stiffness: f32,
    meshes: HashMap<String, MeshEntry>,
}

impl SurfaceProxy {
    /// Create the proxy algorithm with the default surface stiffness.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stiffness: SURFACE_STIFFNESS,
            meshes: HashMap::new(),
        }
    }

    /// Volumetric contact: project the device point on the boundary; a
    /// penetrating device is pushed back to the surface.
    fn solid_contact(
        &self,
        object: &Object,
        shape: &dyn PointQuery,
        device: &Point3<f32>,
    ) -> Option<ContactInfo> {
        let pose = object_pose(object);
        let projection = shape.project_point(&pose, device, false);
        if !projection.is_inside {
            return None;
        }

        let proxy: Vec3 = projection.point.coords;
        let force = (proxy - device.coords) * self.stiffness;
        Some(ContactInfo {
            object: object.name.clone(),
            point: proxy,
            force,
        })
    }

    /// Shell contact for meshes: the tool tip touches the surface when the
    /// closest surface point is within the tool radius.
    fn shell_contact(
        &self,
        object: &Object,
        shape: &TriMesh,
        device: &Point3<f32>,
        tool_radius: f32,
    ) -> Option<ContactInfo> {
        let pose = object_pose(object);
        let projection = shape.project_point(&pose, device, false);
        let to_device = device.coords - projection.point.coords;
        let dist = to_device.norm();
        if dist >= tool_radius || dist < 1e-6 {
            return None;
        }

        let direction = to_device / dist;
        let force = direction * ((tool_radius - dist) * self.stiffness);
        Some(ContactInfo {
            object: object.name.clone(),
            point: projection.point.coords,
            force,
        })
    }

    fn mesh_shape(&mut self, object: &Object, size: Vec3) -> bool {
        let cached = self
            .meshes
            .get(&object.name)
            .is_some_and(|entry| entry.size == size);
        if cached {
            return true;
        }

        let Shape::Mesh { data, .. } = &object.shape else {
            return false;
        };
        let vertices: Vec<Point3<f32>> = data
            .scaled_vertices(size)
            .into_iter()
            .map(Point3::from)
            .collect();
        let shape = TriMesh::new(vertices, data.indices.clone());
        self.meshes
            .insert(object.name.clone(), MeshEntry { size, shape });
        true
    }
}

impl Default for SurfaceProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ForceAlgorithm for SurfaceProxy {
    fn compute(
        &mut self,
        scene: &Scene,
        device_pos: Vec3,
        tool_radius: f32,
    ) -> Option<ContactInfo> {
        let device = Point3::from(device_pos);

        // Mesh shapes are cached; collect the rebuild set first.
        let mesh_jobs: Vec<(String, Vec3)> = scene
            .objects()
            .filter(|o| o.haptic_enabled)
            .filter_map(|o| match &o.shape {
                Shape::Mesh { size, .. } => Some((o.name.clone(), *size)),
                _ => None,
            })
            .collect();
        for (name, size) in mesh_jobs {
            if let Some(object) = scene.object(&name) {
                self.mesh_shape(object, size);
            }
        }

        for object in scene.objects() {
            if !object.haptic_enabled {
                continue;
            }
            let contact = match &object.shape {
                Shape::Sphere { radius } => {
                    self.solid_contact(object, &Ball::new(radius.max(1e-4)), &device)
                }
                Shape::Prism { size } => {
                    let half = Cuboid::new(size.map(|s| (s / 2.0).max(1e-4)));
                    self.solid_contact(object, &half, &device)
                }
                Shape::Mesh { .. } => self
                    .meshes
                    .get(&object.name)
                    .and_then(|entry| {
                        self.shell_contact(object, &entry.shape, &device, tool_radius)
                    }),
                // The cursor does not contact itself; composites have no
                // geometry of their own.
                Shape::Cursor { .. } | Shape::Composite { .. } => None,
            };
            if contact.is_some() {
                return contact;
            }
        }
        None
    }

    fn forget(&mut self, name: &str) {
        self.meshes.remove(name);
    }
}

// ============================================================================
// Potential Field
// ============================================================================

/// Parameters of a field-emitting object.
#[derive(Clone, Copy, Debug)]
pub struct FieldParams {
    /// Attraction stiffness.
    pub stiffness: f32,
    /// Radius of influence.
    pub range: f32,
}

/// The potential-field algorithm.
///
/// No objects emit fields by default; registered emitters attract the
/// cursor within their range.
pub struct PotentialField {
    fields: HashMap<String, FieldParams>,
}

impl PotentialField {
    /// Create a field algorithm with no emitters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    /// Register an object as a field emitter.
    pub fn register(&mut self, name: impl Into<String>, params: FieldParams) {
        self.fields.insert(name.into(), params);
    }
}

impl Default for PotentialField {
    fn default() -> Self {
        Self::new()
    }
}

impl ForceAlgorithm for PotentialField {
    fn compute(
        &mut self,
        scene: &Scene,
        device_pos: Vec3,
        _tool_radius: f32,
    ) -> Option<ContactInfo> {
        for (name, params) in &self.fields {
            let Some(object) = scene.object(name) else {
                continue;
            };
            if !object.haptic_enabled {
                continue;
            }
            let to_center = object.position - device_pos;
            if to_center.norm() < params.range {
                return Some(ContactInfo {
                    object: name.clone(),
                    point: device_pos,
                    force: to_center * params.stiffness,
                });
            }
        }
        None
    }

    fn forget(&mut self, name: &str) {
        self.fields.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tactyl_core::value::SimTag;

    fn scene_with_sphere(radius: f32) -> Scene {
        let mut scene = Scene::new(SimTag::Haptics);
        scene
            .create_object("s1", Shape::Sphere { radius }, Vec3::zeros())
            .unwrap();
        scene
    }

    #[test]
    fn test_no_contact_outside_sphere() {
        let scene = scene_with_sphere(0.1);
        let mut proxy = SurfaceProxy::new();
        assert!(proxy
            .compute(&scene, Vec3::new(0.5, 0.0, 0.0), 0.01)
            .is_none());
    }

    #[test]
    fn test_penetration_pushes_outward() {
        let scene = scene_with_sphere(0.1);
        let mut proxy = SurfaceProxy::new();

        let contact = proxy
            .compute(&scene, Vec3::new(0.05, 0.0, 0.0), 0.01)
            .expect("device is inside the sphere");
        assert_eq!(contact.object, "s1");
        // The force points outward along +x, back toward the surface.
        assert!(contact.force.x > 0.0);
        assert!(contact.force.y.abs() < 1e-4);
        // The contact point sits on the surface.
        assert!((contact.point.norm() - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_deeper_penetration_means_more_force() {
        let scene = scene_with_sphere(0.1);
        let mut proxy = SurfaceProxy::new();

        let shallow = proxy
            .compute(&scene, Vec3::new(0.08, 0.0, 0.0), 0.01)
            .unwrap();
        let deep = proxy.compute(&scene, Vec3::new(0.02, 0.0, 0.0), 0.01).unwrap();
        assert!(deep.force.norm() > shallow.force.norm());
    }

    #[test]
    fn test_box_contact() {
        let mut scene = Scene::new(SimTag::Haptics);
        scene
            .create_object(
                "b1",
                Shape::Prism {
                    size: Vec3::new(0.2, 0.2, 0.2),
                },
                Vec3::zeros(),
            )
            .unwrap();

        let mut proxy = SurfaceProxy::new();
        let contact = proxy
            .compute(&scene, Vec3::new(0.09, 0.0, 0.0), 0.01)
            .expect("device inside the box");
        assert!(contact.force.x > 0.0);
        assert!(proxy
            .compute(&scene, Vec3::new(0.2, 0.0, 0.0), 0.01)
            .is_none());
    }

    #[test]
    fn test_disabled_object_is_transparent() {
        let mut scene = scene_with_sphere(0.1);
        scene.object_mut("s1").unwrap().haptic_enabled = false;

        let mut proxy = SurfaceProxy::new();
        assert!(proxy
            .compute(&scene, Vec3::new(0.05, 0.0, 0.0), 0.01)
            .is_none());
    }

    #[test]
    fn test_moving_object_is_tracked() {
        let mut scene = scene_with_sphere(0.1);
        let mut proxy = SurfaceProxy::new();

        let device = Vec3::new(0.5, 0.0, 0.0);
        assert!(proxy.compute(&scene, device, 0.01).is_none());

        // The object moves onto the device: contact with no device motion.
        scene.object_mut("s1").unwrap().position = Vec3::new(0.48, 0.0, 0.0);
        assert!(proxy.compute(&scene, device, 0.01).is_some());
    }

    #[test]
    fn test_potential_field_attracts_within_range() {
        let scene = scene_with_sphere(0.1);
        let mut field = PotentialField::new();
        field.register(
            "s1",
            FieldParams {
                stiffness: 2.0,
                range: 1.0,
            },
        );

        let contact = field
            .compute(&scene, Vec3::new(0.5, 0.0, 0.0), 0.01)
            .expect("inside field range");
        // Attraction toward the center at the origin.
        assert!(contact.force.x < 0.0);

        assert!(field
            .compute(&scene, Vec3::new(2.0, 0.0, 0.0), 0.01)
            .is_none());
    }

    #[test]
    fn test_fieldless_by_default() {
        let scene = scene_with_sphere(0.1);
        let mut field = PotentialField::new();
        assert!(field.compute(&scene, Vec3::zeros(), 0.01).is_none());
    }
}
