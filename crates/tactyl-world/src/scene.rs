//! The object/constraint scene model.
//!
//! Every simulation owns one `Scene`: an independent replica of the world
//! keyed by object name. OSC verbs are routed here; routing mutates the
//! replica and returns [`SceneChange`] values that the owning simulation
//! applies to its backend (solver bodies, proxy shapes, render mirror).
//!
//! Constraint handles are name keys; objects keep non-owning lists of the
//! constraint names they participate in, so destroying an object cascades to
//! every constraint referencing it and a constraint is never left dangling.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use tactyl_core::error::{SceneError, SceneResult};
use tactyl_core::math::{mat3_from_row_major, Color, Mat3, Vec3};
use tactyl_core::osc::OscMessage;
use tactyl_core::value::{PropertyKind, PropertyValue, SimTag};

/// Default radius of a sphere created without one.
pub const DEFAULT_SPHERE_RADIUS: f32 = 0.05;
/// Default full extents of a prism.
pub const DEFAULT_PRISM_SIZE: f32 = 0.1;
/// Default overall size a loaded mesh is scaled to.
pub const DEFAULT_MESH_SIZE: f32 = 0.1;
/// Radius of the haptic tool cursor.
pub const CURSOR_RADIUS: f32 = 0.01;

// ============================================================================
// Shapes
// ============================================================================

/// Triangle mesh data shared by the physics and haptics backends.
#[derive(Clone, Debug, PartialEq)]
pub struct TriMeshData {
    /// Vertex positions.
    pub vertices: Vec<[f32; 3]>,
    /// Triangle vertex indices.
    pub indices: Vec<[u32; 3]>,
    /// Axis-aligned extents of the raw vertex data.
    pub extents: Vec3,
}

impl TriMeshData {
    /// Load a triangle mesh from a Wavefront OBJ file, merging all models.
    pub fn load(path: &str) -> SceneResult<Self> {
        if !Path::new(path).exists() {
            return Err(SceneError::MissingFile(path.to_string()));
        }

        let (models, _) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS).map_err(|e| {
            SceneError::UnreadableMesh {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        for model in models {
            let base = vertices.len() as u32;
            let mesh = model.mesh;
            for chunk in mesh.positions.chunks_exact(3) {
                vertices.push([chunk[0], chunk[1], chunk[2]]);
            }
            for tri in mesh.indices.chunks_exact(3) {
                indices.push([base + tri[0], base + tri[1], base + tri[2]]);
            }
        }

        if vertices.is_empty() || indices.is_empty() {
            return Err(SceneError::UnreadableMesh {
                path: path.to_string(),
                reason: "no triangles".to_string(),
            });
        }

        let mut min = Vec3::from(vertices[0]);
        let mut max = min;
        for v in &vertices {
            for i in 0..3 {
                min[i] = min[i].min(v[i]);
                max[i] = max[i].max(v[i]);
            }
        }
        let extents = (max - min).map(|d| d.max(1e-6));

        Ok(Self {
            vertices,
            indices,
            extents,
        })
    }

    /// Vertices scaled so the mesh fills `size` (full extents).
    #[must_use]
    pub fn scaled_vertices(&self, size: Vec3) -> Vec<[f32; 3]> {
        let scale = Vec3::new(
            size.x / self.extents.x,
            size.y / self.extents.y,
            size.z / self.extents.z,
        );
        self.vertices
            .iter()
            .map(|v| [v[0] * scale.x, v[1] * scale.y, v[2] * scale.z])
            .collect()
    }
}

/// Geometry variant of a scene object.
#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    /// Sphere with a radius.
    Sphere {
        /// Radius in meters.
        radius: f32,
    },
    /// Box; `size` is the full extents along each axis.
    Prism {
        /// Full extents.
        size: Vec3,
    },
    /// Triangle mesh loaded from a file, scaled to `size` full extents.
    Mesh {
        /// Target full extents.
        size: Vec3,
        /// Source file path.
        filename: String,
        /// Loaded triangle data.
        data: TriMeshData,
    },
    /// The haptic tool cursor.
    Cursor {
        /// Display/tool radius.
        radius: f32,
    },
    /// An aggregate body adopting the geometry of its children.
    Composite {
        /// Child object names.
        children: Vec<String>,
    },
}

impl Shape {
    /// Whether the shape is a composite aggregate.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, Shape::Composite { .. })
    }
}

// ============================================================================
// Objects
// ============================================================================

/// A scene entity: one object replica inside one simulation.
#[derive(Clone, Debug)]
pub struct Object {
    /// Unique name (may contain `/` for composite children).
    pub name: String,
    /// Geometry.
    pub shape: Shape,
    /// World-space position.
    pub position: Vec3,
    /// Rotation matrix.
    pub rotation: Mat3,
    /// Linear velocity.
    pub velocity: Vec3,
    /// Per-tick velocity delta.
    pub acceleration: Vec3,
    /// Transient external force.
    pub force: Vec3,
    /// Display color.
    pub color: Color,
    /// Static friction coefficient.
    pub friction_static: f32,
    /// Dynamic friction coefficient.
    pub friction_dynamic: f32,
    /// Texture image path, if set.
    pub texture_image: Option<String>,
    /// Whether collision events are emitted for this object.
    pub collide: bool,
    /// Whether the object is rendered.
    pub visible: bool,
    /// Mass; zero means kinematic.
    pub mass: f32,
    /// Whether the haptic loop may contact this object.
    pub haptic_enabled: bool,
    /// Name of the owning composite, if adopted.
    pub parent: Option<String>,
    /// Names of constraints referencing this object (non-owning).
    pub constraints: Vec<String>,
    /// Collision partner -> last seen step, for episode detection.
    collisions: HashMap<String, u64>,
}

impl Object {
    /// Create an object with default physical properties.
    #[must_use]
    pub fn new(name: impl Into<String>, shape: Shape, position: Vec3) -> Self {
        Self {
            name: name.into(),
            shape,
            position,
            rotation: Mat3::identity(),
            velocity: Vec3::zeros(),
            acceleration: Vec3::zeros(),
            force: Vec3::zeros(),
            color: Color::grey(),
            friction_static: 1.0,
            friction_dynamic: 0.5,
            texture_image: None,
            collide: false,
            visible: true,
            mass: 0.0,
            haptic_enabled: true,
            parent: None,
            constraints: Vec::new(),
            collisions: HashMap::new(),
        }
    }

    /// `mass > 0` means the object is integrated by the solver.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.mass > 0.0
    }

    /// Store a property value. The caller has already type-checked `value`
    /// against the property kind.
    fn store(&mut self, kind: PropertyKind, value: &PropertyValue) {
        match (kind, value) {
            (PropertyKind::Position, PropertyValue::Vec3(v)) => self.position = *v,
            (PropertyKind::Rotation, PropertyValue::Mat3(m)) => self.rotation = *m,
            (PropertyKind::Velocity, PropertyValue::Vec3(v)) => {
                self.acceleration = *v - self.velocity;
                self.velocity = *v;
            }
            (PropertyKind::Acceleration, PropertyValue::Vec3(v)) => self.acceleration = *v,
            (PropertyKind::Force, PropertyValue::Vec3(v)) => self.force = *v,
            (PropertyKind::Color, PropertyValue::Vec3(v)) => {
                self.color = Color::new(v.x, v.y, v.z);
            }
            (PropertyKind::FrictionStatic, PropertyValue::Scalar(v)) => self.friction_static = *v,
            (PropertyKind::FrictionDynamic, PropertyValue::Scalar(v)) => {
                self.friction_dynamic = *v;
            }
            (PropertyKind::TextureImage, PropertyValue::Text(s)) => {
                self.texture_image = Some(s.clone());
            }
            (PropertyKind::Collide, PropertyValue::Bool(b)) => self.collide = *b,
            (PropertyKind::Visible, PropertyValue::Bool(b)) => self.visible = *b,
            (PropertyKind::Mass, PropertyValue::Scalar(v)) => self.mass = v.max(0.0),
            (PropertyKind::Radius, PropertyValue::Scalar(v)) => {
                if let Shape::Sphere { radius } | Shape::Cursor { radius } = &mut self.shape {
                    *radius = *v;
                }
            }
            (PropertyKind::Size, PropertyValue::Vec3(v)) => match &mut self.shape {
                Shape::Prism { size } | Shape::Mesh { size, .. } => *size = *v,
                _ => {}
            },
            _ => {}
        }
    }

    /// Record a contact with `partner` at `step`.
    ///
    /// Returns true when this begins a new contact episode: the partner was
    /// not seen on the immediately preceding step.
    pub fn collided_with(&mut self, partner: &str, step: u64) -> bool {
        let fresh = self
            .collisions
            .get(partner)
            .is_none_or(|&last| last != step.wrapping_sub(1));
        self.collisions.insert(partner.to_string(), step);
        fresh
    }
}

// ============================================================================
// Constraints
// ============================================================================

/// Joint variant of a constraint.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstraintKind {
    /// Ball joint with a fixed anchor.
    Ball {
        /// World-space anchor.
        anchor: Vec3,
    },
    /// Hinge with an anchor and an axis.
    Hinge {
        /// World-space anchor.
        anchor: Vec3,
        /// Rotation axis.
        axis: Vec3,
    },
    /// Double hinge with an anchor and two axes.
    Hinge2 {
        /// World-space anchor.
        anchor: Vec3,
        /// First axis.
        axis1: Vec3,
        /// Second axis.
        axis2: Vec3,
    },
    /// Universal joint with an anchor and two axes.
    Universal {
        /// World-space anchor.
        anchor: Vec3,
        /// First axis.
        axis1: Vec3,
        /// Second axis.
        axis2: Vec3,
    },
    /// Slider along an axis.
    Slider {
        /// Sliding axis.
        axis: Vec3,
    },
    /// Rigid attachment.
    Fixed,
}

/// A joint between two objects (or one object and the static world).
#[derive(Clone, Debug)]
pub struct Constraint {
    /// Unique constraint name.
    pub name: String,
    /// First object name.
    pub object1: String,
    /// Second object name; `None` means the static world.
    pub object2: Option<String>,
    /// Joint variant.
    pub kind: ConstraintKind,
    /// Motor stiffness.
    pub stiffness: f32,
    /// Motor damping.
    pub damping: f32,
    /// Last computed motor torque (readout).
    pub torque: f32,
}

// ============================================================================
// Scene Changes
// ============================================================================

/// What a dispatched message changed, for the owning simulation's backend.
#[derive(Clone, Debug, PartialEq)]
pub enum SceneChange {
    /// An object was created.
    ObjectCreated {
        /// Object name.
        name: String,
    },
    /// An object (and every constraint referencing it) was destroyed.
    ObjectDestroyed {
        /// Object name.
        name: String,
    },
    /// A child was adopted by a composite.
    ChildAdopted {
        /// Composite name.
        parent: String,
        /// Child name.
        child: String,
    },
    /// A property value was stored; the side effect belongs to the
    /// property's target simulation.
    PropertyChanged {
        /// Object name.
        name: String,
        /// Which property changed.
        kind: PropertyKind,
    },
    /// A grab (`Some`) or release (`None`) was requested.
    GrabRequested {
        /// Object to grab.
        name: Option<String>,
    },
    /// A periodic oscillation was requested for an object.
    OscillateRequested {
        /// Object name.
        name: String,
        /// Oscillation frequency in Hz.
        hz: f32,
        /// Force amplitude.
        amplitude: f32,
    },
    /// A contact force should be applied at a point.
    PushApplied {
        /// Object name.
        name: String,
        /// Force vector.
        force: Vec3,
        /// World-space application point.
        point: Vec3,
    },
    /// A constraint was created.
    ConstraintCreated {
        /// Constraint name.
        name: String,
    },
    /// A constraint was destroyed.
    ConstraintDestroyed {
        /// Constraint name.
        name: String,
    },
    /// A constraint's motor response changed.
    ResponseChanged {
        /// Constraint name.
        name: String,
    },
    /// Everything was removed.
    Cleared,
}

// ============================================================================
// Scene
// ============================================================================

/// One simulation's replica of the world.
#[derive(Debug)]
pub struct Scene {
    tag: SimTag,
    objects: HashMap<String, Object>,
    constraints: HashMap<String, Constraint>,
}

impl Scene {
    /// Create an empty scene owned by the given simulation.
    #[must_use]
    pub fn new(tag: SimTag) -> Self {
        Self {
            tag,
            objects: HashMap::new(),
            constraints: HashMap::new(),
        }
    }

    /// Owning simulation.
    #[must_use]
    pub fn tag(&self) -> SimTag {
        self.tag
    }

    /// Look up an object.
    #[must_use]
    pub fn object(&self, name: &str) -> Option<&Object> {
        self.objects.get(name)
    }

    /// Look up an object mutably.
    pub fn object_mut(&mut self, name: &str) -> Option<&mut Object> {
        self.objects.get_mut(name)
    }

    /// Iterate all objects.
    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Look up a constraint.
    #[must_use]
    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.get(name)
    }

    /// Look up a constraint mutably.
    pub fn constraint_mut(&mut self, name: &str) -> Option<&mut Constraint> {
        self.constraints.get_mut(name)
    }

    /// Iterate all constraints.
    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.values()
    }

    /// Number of objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    // ------------------------------------------------------------------
    // Creation / destruction
    // ------------------------------------------------------------------

    /// Create an object, handling composite binding for `/`-containing
    /// names. On failure no state is modified.
    pub fn create_object(
        &mut self,
        name: &str,
        shape: Shape,
        position: Vec3,
    ) -> SceneResult<Vec<SceneChange>> {
        if self.objects.contains_key(name) {
            return Err(SceneError::DuplicateName(name.to_string()));
        }

        let mut changes = Vec::new();

        let parent_name = name.split_once('/').map(|(parent, _)| parent.to_string());
        if let Some(parent) = &parent_name {
            match self.objects.get(parent.as_str()) {
                Some(obj) if obj.shape.is_composite() => {}
                Some(_) => {
                    return Err(SceneError::ParentNotComposite {
                        parent: parent.clone(),
                        child: name.to_string(),
                    });
                }
                None => {
                    let composite = Object::new(
                        parent.clone(),
                        Shape::Composite {
                            children: Vec::new(),
                        },
                        Vec3::zeros(),
                    );
                    self.objects.insert(parent.clone(), composite);
                    changes.push(SceneChange::ObjectCreated {
                        name: parent.clone(),
                    });
                }
            }
        }

        let mut object = Object::new(name, shape, position);
        object.parent = parent_name.clone();
        self.objects.insert(name.to_string(), object);
        changes.push(SceneChange::ObjectCreated {
            name: name.to_string(),
        });

        if let Some(parent) = parent_name {
            if let Some(Shape::Composite { children }) =
                self.objects.get_mut(&parent).map(|o| &mut o.shape)
            {
                children.push(name.to_string());
            }
            debug!("[{}] {} added to {}", self.tag.as_str(), name, parent);
            changes.push(SceneChange::ChildAdopted {
                parent,
                child: name.to_string(),
            });
        }

        Ok(changes)
    }

    /// Destroy an object, its composite children, and every constraint
    /// referencing any of them.
    pub fn destroy_object(&mut self, name: &str) -> SceneResult<Vec<SceneChange>> {
        let object = self
            .objects
            .remove(name)
            .ok_or_else(|| SceneError::NoSuchObject(name.to_string()))?;

        let mut changes = Vec::new();

        // Composite children share the composite body; they go with it.
        if let Shape::Composite { children } = &object.shape {
            for child in children.clone() {
                if self.objects.contains_key(&child) {
                    changes.extend(self.destroy_object(&child)?);
                }
            }
        }

        if let Some(parent) = &object.parent {
            if let Some(Shape::Composite { children }) =
                self.objects.get_mut(parent).map(|o| &mut o.shape)
            {
                children.retain(|c| c != name);
            }
        }

        for constraint_name in object.constraints.clone() {
            if self.constraints.contains_key(&constraint_name) {
                changes.push(self.destroy_constraint(&constraint_name)?);
            }
        }

        changes.push(SceneChange::ObjectDestroyed {
            name: name.to_string(),
        });
        Ok(changes)
    }

    /// Create a constraint between two objects (or one object and the
    /// world).
    pub fn create_constraint(
        &mut self,
        name: &str,
        object1: &str,
        object2: Option<&str>,
        kind: ConstraintKind,
    ) -> SceneResult<SceneChange> {
        if self.constraints.contains_key(name) {
            return Err(SceneError::DuplicateName(name.to_string()));
        }
        if !self.objects.contains_key(object1) {
            return Err(SceneError::NoSuchObject(object1.to_string()));
        }
        if let Some(obj2) = object2 {
            if !self.objects.contains_key(obj2) {
                return Err(SceneError::NoSuchObject(obj2.to_string()));
            }
        }

        self.constraints.insert(
            name.to_string(),
            Constraint {
                name: name.to_string(),
                object1: object1.to_string(),
                object2: object2.map(str::to_string),
                kind,
                stiffness: 0.0,
                damping: 0.0,
                torque: 0.0,
            },
        );

        if let Some(obj) = self.objects.get_mut(object1) {
            obj.constraints.push(name.to_string());
        }
        if let Some(obj2) = object2 {
            if let Some(obj) = self.objects.get_mut(obj2) {
                obj.constraints.push(name.to_string());
            }
        }

        Ok(SceneChange::ConstraintCreated {
            name: name.to_string(),
        })
    }

    /// Destroy a constraint and unlink it from its objects.
    pub fn destroy_constraint(&mut self, name: &str) -> SceneResult<SceneChange> {
        let constraint = self
            .constraints
            .remove(name)
            .ok_or_else(|| SceneError::NoSuchConstraint(name.to_string()))?;

        for obj_name in std::iter::once(&constraint.object1).chain(constraint.object2.iter()) {
            if let Some(obj) = self.objects.get_mut(obj_name) {
                obj.constraints.retain(|c| c != name);
            }
        }

        Ok(SceneChange::ConstraintDestroyed {
            name: name.to_string(),
        })
    }

    /// Remove every object and constraint.
    pub fn clear(&mut self) -> Vec<SceneChange> {
        self.objects.clear();
        self.constraints.clear();
        vec![SceneChange::Cleared]
    }

    // ------------------------------------------------------------------
    // OSC dispatch
    // ------------------------------------------------------------------

    /// Route an OSC message into the scene.
    ///
    /// Returns the changes to apply to the backend, or an error describing
    /// why the request failed (state is untouched on failure).
    pub fn dispatch(&mut self, msg: &OscMessage) -> SceneResult<Vec<SceneChange>> {
        let address = msg.address.as_str();

        if let Some(rest) = address.strip_prefix("/world/") {
            return self.dispatch_world(rest, msg);
        }
        if let Some(rest) = address.strip_prefix("/constraint/") {
            return self.dispatch_constraint(rest, msg);
        }

        Err(SceneError::UnknownPath(address.to_string()))
    }

    fn dispatch_world(&mut self, rest: &str, msg: &OscMessage) -> SceneResult<Vec<SceneChange>> {
        let typetag = msg.typetag();

        match rest {
            "clear" => return Ok(self.clear()),
            "sphere/create" => return self.create_sphere(msg, &typetag),
            "prism/create" => return self.create_prism(msg, &typetag),
            "mesh/create" => return self.create_mesh(msg, &typetag),
            _ => {}
        }

        if let Some(name) = rest.strip_suffix("/destroy") {
            require_tag(msg, &typetag, &[""])?;
            return self.destroy_object(name);
        }

        if let Some(name) = rest.strip_suffix("/grab") {
            require_tag(msg, &typetag, &["", "i"])?;
            self.require_object(name)?;
            let grab = if typetag == "i" {
                msg.int(0).map_err(|_| bad_tag(msg, &typetag))? != 0
            } else {
                true
            };
            return Ok(vec![SceneChange::GrabRequested {
                name: grab.then(|| name.to_string()),
            }]);
        }

        if let Some(name) = rest.strip_suffix("/oscillate") {
            require_tag(msg, &typetag, &["ff"])?;
            self.require_object(name)?;
            return Ok(vec![SceneChange::OscillateRequested {
                name: name.to_string(),
                hz: msg.float(0).map_err(|_| bad_tag(msg, &typetag))?,
                amplitude: msg.float(1).map_err(|_| bad_tag(msg, &typetag))?,
            }]);
        }

        if let Some(name) = rest.strip_suffix("/push") {
            require_tag(msg, &typetag, &["ffffff"])?;
            self.require_object(name)?;
            let f = msg.vec3(0).map_err(|_| bad_tag(msg, &typetag))?;
            let p = msg.vec3(3).map_err(|_| bad_tag(msg, &typetag))?;
            return Ok(vec![SceneChange::PushApplied {
                name: name.to_string(),
                force: Vec3::from(f),
                point: Vec3::from(p),
            }]);
        }

        if let Some((name, kind)) = PropertyKind::split_path(rest) {
            let name = name.to_string();
            let value = self.parse_property(&name, kind, msg, &typetag)?;
            return self.set_property(&name, kind, &value).map(|c| vec![c]);
        }

        Err(SceneError::UnknownPath(msg.address.clone()))
    }

    fn create_sphere(&mut self, msg: &OscMessage, typetag: &str) -> SceneResult<Vec<SceneChange>> {
        require_tag(msg, typetag, &["sfff", "sffff"])?;
        let name = msg.string(0).map_err(|_| bad_tag(msg, typetag))?.to_string();
        let pos = msg.vec3(1).map_err(|_| bad_tag(msg, typetag))?;
        let radius = if typetag == "sffff" {
            msg.float(4).map_err(|_| bad_tag(msg, typetag))?
        } else {
            DEFAULT_SPHERE_RADIUS
        };
        self.create_object(&name, Shape::Sphere { radius }, Vec3::from(pos))
    }

    fn create_prism(&mut self, msg: &OscMessage, typetag: &str) -> SceneResult<Vec<SceneChange>> {
        require_tag(msg, typetag, &["sfff"])?;
        let name = msg.string(0).map_err(|_| bad_tag(msg, typetag))?.to_string();
        let pos = msg.vec3(1).map_err(|_| bad_tag(msg, typetag))?;
        let size = Vec3::new(DEFAULT_PRISM_SIZE, DEFAULT_PRISM_SIZE, DEFAULT_PRISM_SIZE);
        self.create_object(&name, Shape::Prism { size }, Vec3::from(pos))
    }

    fn create_mesh(&mut self, msg: &OscMessage, typetag: &str) -> SceneResult<Vec<SceneChange>> {
        require_tag(msg, typetag, &["sfffs"])?;
        let name = msg.string(0).map_err(|_| bad_tag(msg, typetag))?.to_string();
        let pos = msg.vec3(1).map_err(|_| bad_tag(msg, typetag))?;
        let filename = msg.string(4).map_err(|_| bad_tag(msg, typetag))?.to_string();

        let data = TriMeshData::load(&filename)?;
        // Scale the largest dimension to the default size, preserving
        // proportions.
        let max_extent = data.extents.x.max(data.extents.y).max(data.extents.z);
        let size = data.extents * (DEFAULT_MESH_SIZE / max_extent);

        self.create_object(
            &name,
            Shape::Mesh {
                size,
                filename,
                data,
            },
            Vec3::from(pos),
        )
    }

    fn parse_property(
        &self,
        name: &str,
        kind: PropertyKind,
        msg: &OscMessage,
        typetag: &str,
    ) -> SceneResult<PropertyValue> {
        let object = self.require_object(name)?;
        let bad = || bad_tag(msg, typetag);

        match kind {
            PropertyKind::Position
            | PropertyKind::Velocity
            | PropertyKind::Acceleration
            | PropertyKind::Force
            | PropertyKind::Color => {
                require_tag(msg, typetag, &["fff"])?;
                Ok(PropertyValue::Vec3(Vec3::from(msg.vec3(0).map_err(|_| bad())?)))
            }
            PropertyKind::Rotation => {
                require_tag(msg, typetag, &["fffffffff"])?;
                let mut m = [0.0f32; 9];
                for (i, slot) in m.iter_mut().enumerate() {
                    *slot = msg.float(i).map_err(|_| bad())?;
                }
                Ok(PropertyValue::Mat3(mat3_from_row_major(&m)))
            }
            PropertyKind::FrictionStatic
            | PropertyKind::FrictionDynamic
            | PropertyKind::Mass => {
                require_tag(msg, typetag, &["f"])?;
                Ok(PropertyValue::Scalar(msg.float(0).map_err(|_| bad())?))
            }
            PropertyKind::Radius => {
                if !matches!(object.shape, Shape::Sphere { .. } | Shape::Cursor { .. }) {
                    return Err(SceneError::UnknownPath(msg.address.clone()));
                }
                require_tag(msg, typetag, &["f"])?;
                Ok(PropertyValue::Scalar(msg.float(0).map_err(|_| bad())?))
            }
            PropertyKind::Size => match &object.shape {
                Shape::Prism { .. } => {
                    require_tag(msg, typetag, &["fff"])?;
                    Ok(PropertyValue::Vec3(Vec3::from(msg.vec3(0).map_err(|_| bad())?)))
                }
                Shape::Mesh { .. } => {
                    require_tag(msg, typetag, &["f", "fff"])?;
                    if typetag == "f" {
                        let s = msg.float(0).map_err(|_| bad())?;
                        Ok(PropertyValue::Vec3(Vec3::new(s, s, s)))
                    } else {
                        Ok(PropertyValue::Vec3(Vec3::from(msg.vec3(0).map_err(|_| bad())?)))
                    }
                }
                _ => Err(SceneError::UnknownPath(msg.address.clone())),
            },
            PropertyKind::TextureImage => {
                require_tag(msg, typetag, &["s"])?;
                let path = msg.string(0).map_err(|_| bad())?;
                if !Path::new(path).exists() {
                    return Err(SceneError::MissingFile(path.to_string()));
                }
                Ok(PropertyValue::Text(path.to_string()))
            }
            PropertyKind::Collide | PropertyKind::Visible => {
                require_tag(msg, typetag, &["i"])?;
                Ok(PropertyValue::Bool(msg.int(0).map_err(|_| bad())? != 0))
            }
        }
    }

    /// Store a property value on an object.
    pub fn set_property(
        &mut self,
        name: &str,
        kind: PropertyKind,
        value: &PropertyValue,
    ) -> SceneResult<SceneChange> {
        let object = self
            .objects
            .get_mut(name)
            .ok_or_else(|| SceneError::NoSuchObject(name.to_string()))?;
        object.store(kind, value);
        Ok(SceneChange::PropertyChanged {
            name: name.to_string(),
            kind,
        })
    }

    fn require_object(&self, name: &str) -> SceneResult<&Object> {
        self.objects
            .get(name)
            .ok_or_else(|| SceneError::NoSuchObject(name.to_string()))
    }

    // ------------------------------------------------------------------
    // Constraint dispatch
    // ------------------------------------------------------------------

    fn dispatch_constraint(
        &mut self,
        rest: &str,
        msg: &OscMessage,
    ) -> SceneResult<Vec<SceneChange>> {
        let typetag = msg.typetag();

        if let Some(kind) = rest.strip_suffix("/create") {
            return self.create_constraint_osc(kind, msg, &typetag);
        }

        if let Some(name) = rest.strip_suffix("/destroy") {
            require_tag(msg, &typetag, &[""])?;
            return self.destroy_constraint(name).map(|c| vec![c]);
        }

        if let Some((name, response)) = rest.split_once("/response/") {
            return self.set_response(name, response, msg, &typetag).map(|c| vec![c]);
        }

        Err(SceneError::UnknownPath(msg.address.clone()))
    }

    fn create_constraint_osc(
        &mut self,
        kind: &str,
        msg: &OscMessage,
        typetag: &str,
    ) -> SceneResult<Vec<SceneChange>> {
        let bad = || bad_tag(msg, typetag);
        let name = msg.string(0).map_err(|_| bad())?.to_string();
        let object1 = msg.string(1).map_err(|_| bad())?.to_string();
        let object2_raw = msg.string(2).map_err(|_| bad())?.to_string();
        // An empty name or "world" links the constraint to the static world.
        let object2 = match object2_raw.as_str() {
            "" | "world" => None,
            other => Some(other.to_string()),
        };

        let kind = match kind {
            "ball" => {
                require_tag(msg, typetag, &["sssfff"])?;
                ConstraintKind::Ball {
                    anchor: Vec3::from(msg.vec3(3).map_err(|_| bad())?),
                }
            }
            "hinge" => {
                require_tag(msg, typetag, &["sssffffff"])?;
                ConstraintKind::Hinge {
                    anchor: Vec3::from(msg.vec3(3).map_err(|_| bad())?),
                    axis: Vec3::from(msg.vec3(6).map_err(|_| bad())?),
                }
            }
            "hinge2" => {
                require_tag(msg, typetag, &["sssfffffffff"])?;
                ConstraintKind::Hinge2 {
                    anchor: Vec3::from(msg.vec3(3).map_err(|_| bad())?),
                    axis1: Vec3::from(msg.vec3(6).map_err(|_| bad())?),
                    axis2: Vec3::from(msg.vec3(9).map_err(|_| bad())?),
                }
            }
            "universal" => {
                require_tag(msg, typetag, &["sssfffffffff"])?;
                ConstraintKind::Universal {
                    anchor: Vec3::from(msg.vec3(3).map_err(|_| bad())?),
                    axis1: Vec3::from(msg.vec3(6).map_err(|_| bad())?),
                    axis2: Vec3::from(msg.vec3(9).map_err(|_| bad())?),
                }
            }
            "slider" => {
                require_tag(msg, typetag, &["sssfff"])?;
                ConstraintKind::Slider {
                    axis: Vec3::from(msg.vec3(3).map_err(|_| bad())?),
                }
            }
            "fixed" => {
                require_tag(msg, typetag, &["sss"])?;
                ConstraintKind::Fixed
            }
            _ => return Err(SceneError::UnknownPath(msg.address.clone())),
        };

        self.create_constraint(&name, &object1, object2.as_deref(), kind)
            .map(|c| vec![c])
    }

    fn set_response(
        &mut self,
        name: &str,
        response: &str,
        msg: &OscMessage,
        typetag: &str,
    ) -> SceneResult<SceneChange> {
        if !self.constraints.contains_key(name) {
            return Err(SceneError::NoSuchConstraint(name.to_string()));
        }

        match response {
            "linear" => {
                require_tag(msg, typetag, &["f"])?;
                let k = msg.float(0).map_err(|_| bad_tag(msg, typetag))?;
                let constraint = self
                    .constraints
                    .get_mut(name)
                    .ok_or_else(|| SceneError::NoSuchConstraint(name.to_string()))?;
                constraint.stiffness = k;
                constraint.damping = 0.0;
                Ok(SceneChange::ResponseChanged {
                    name: name.to_string(),
                })
            }
            "spring" => {
                require_tag(msg, typetag, &["ff"])?;
                let k = msg.float(0).map_err(|_| bad_tag(msg, typetag))?;
                let b = msg.float(1).map_err(|_| bad_tag(msg, typetag))?;
                let constraint = self
                    .constraints
                    .get_mut(name)
                    .ok_or_else(|| SceneError::NoSuchConstraint(name.to_string()))?;
                constraint.stiffness = k;
                constraint.damping = b;
                Ok(SceneChange::ResponseChanged {
                    name: name.to_string(),
                })
            }
            "center" | "constant" => {
                require_tag(msg, typetag, &["f"])?;
                Err(SceneError::UnimplementedResponse(msg.address.clone()))
            }
            "wall" => {
                require_tag(msg, typetag, &["ff", "ffi"])?;
                Err(SceneError::UnimplementedResponse(msg.address.clone()))
            }
            "pluck" => {
                require_tag(msg, typetag, &["ff"])?;
                Err(SceneError::UnimplementedResponse(msg.address.clone()))
            }
            _ => Err(SceneError::UnknownPath(msg.address.clone())),
        }
    }
}

fn require_tag(msg: &OscMessage, typetag: &str, allowed: &[&str]) -> SceneResult<()> {
    if allowed.contains(&typetag) {
        Ok(())
    } else {
        Err(bad_tag(msg, typetag))
    }
}

fn bad_tag(msg: &OscMessage, typetag: &str) -> SceneError {
    SceneError::BadTypeTag {
        path: msg.address.clone(),
        typetag: typetag.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tactyl_core::osc::OscArg;

    fn scene() -> Scene {
        Scene::new(SimTag::Physics)
    }

    fn sphere_create(name: &str, pos: [f32; 3]) -> OscMessage {
        OscMessage::new(
            "/world/sphere/create",
            vec![
                OscArg::from(name),
                OscArg::Float(pos[0]),
                OscArg::Float(pos[1]),
                OscArg::Float(pos[2]),
            ],
        )
    }

    #[test]
    fn test_create_sphere_with_default_radius() {
        let mut s = scene();
        let changes = s.dispatch(&sphere_create("s1", [0.0, 0.0, 0.1])).unwrap();
        assert_eq!(changes.len(), 1);

        let obj = s.object("s1").unwrap();
        assert!(matches!(obj.shape, Shape::Sphere { radius } if (radius - 0.05).abs() < 1e-6));
        assert!((obj.position.z - 0.1).abs() < 1e-6);
        assert!(!obj.is_dynamic());
    }

    #[test]
    fn test_duplicate_name_fails_second_create() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();
        let err = s.dispatch(&sphere_create("s1", [1.0, 0.0, 0.0])).unwrap_err();
        assert_eq!(err, SceneError::DuplicateName("s1".to_string()));
        // The original object is untouched.
        assert!(s.object("s1").unwrap().position.norm() < 1e-6);
    }

    #[test]
    fn test_property_set_and_store() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();

        let changes = s
            .dispatch(&OscMessage::floats("/world/s1/position", &[0.0, 0.0, 0.1]))
            .unwrap();
        assert_eq!(
            changes[0],
            SceneChange::PropertyChanged {
                name: "s1".to_string(),
                kind: PropertyKind::Position,
            }
        );
        assert!((s.object("s1").unwrap().position.z - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_velocity_store_tracks_acceleration() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();
        s.dispatch(&OscMessage::floats("/world/s1/velocity", &[1.0, 0.0, 0.0]))
            .unwrap();
        s.dispatch(&OscMessage::floats("/world/s1/velocity", &[3.0, 0.0, 0.0]))
            .unwrap();
        let obj = s.object("s1").unwrap();
        assert!((obj.acceleration.x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_path_and_bad_typetag() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();

        assert!(matches!(
            s.dispatch(&OscMessage::new("/world/s1/frobnicate", vec![])),
            Err(SceneError::UnknownPath(_))
        ));
        assert!(matches!(
            s.dispatch(&OscMessage::new(
                "/world/s1/position",
                vec![OscArg::Float(0.0)]
            )),
            Err(SceneError::BadTypeTag { .. })
        ));
    }

    #[test]
    fn test_composite_implicit_creation_and_adoption() {
        let mut s = scene();
        let changes = s
            .dispatch(&OscMessage::new(
                "/world/prism/create",
                vec![
                    OscArg::from("p/a"),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                ],
            ))
            .unwrap();

        assert!(changes.contains(&SceneChange::ObjectCreated {
            name: "p".to_string()
        }));
        assert!(changes.contains(&SceneChange::ChildAdopted {
            parent: "p".to_string(),
            child: "p/a".to_string()
        }));
        assert!(s.object("p").unwrap().shape.is_composite());
        assert_eq!(s.object("p/a").unwrap().parent.as_deref(), Some("p"));
    }

    #[test]
    fn test_composite_second_child_joins_existing() {
        let mut s = scene();
        s.create_object("p/a", Shape::Prism { size: Vec3::new(0.1, 0.1, 0.1) }, Vec3::zeros())
            .unwrap();
        s.create_object(
            "p/b",
            Shape::Prism { size: Vec3::new(0.1, 0.1, 0.1) },
            Vec3::new(0.1, 0.0, 0.0),
        )
        .unwrap();

        match &s.object("p").unwrap().shape {
            Shape::Composite { children } => assert_eq!(children.len(), 2),
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn test_child_of_non_composite_fails_cleanly() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();
        let err = s
            .create_object("s1/a", Shape::Sphere { radius: 0.05 }, Vec3::zeros())
            .unwrap_err();
        assert!(matches!(err, SceneError::ParentNotComposite { .. }));
        assert!(s.object("s1/a").is_none());
    }

    #[test]
    fn test_destroy_cascades_to_constraints() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();
        s.dispatch(&sphere_create("s2", [0.1, 0.0, 0.0])).unwrap();
        s.create_constraint(
            "c1",
            "s1",
            Some("s2"),
            ConstraintKind::Ball {
                anchor: Vec3::zeros(),
            },
        )
        .unwrap();

        let changes = s.destroy_object("s1").unwrap();
        assert!(changes.contains(&SceneChange::ConstraintDestroyed {
            name: "c1".to_string()
        }));
        assert!(s.constraint("c1").is_none());
        // The surviving object's back-list no longer references c1.
        assert!(s.object("s2").unwrap().constraints.is_empty());
    }

    #[test]
    fn test_destroy_missing_object_is_error() {
        let mut s = scene();
        assert!(matches!(
            s.dispatch(&OscMessage::new("/world/m/destroy", vec![])),
            Err(SceneError::NoSuchObject(_))
        ));
    }

    #[test]
    fn test_collision_episode_freshness() {
        let mut obj = Object::new("s1", Shape::Sphere { radius: 0.05 }, Vec3::zeros());

        assert!(obj.collided_with("cursor", 10));
        assert!(!obj.collided_with("cursor", 11));
        assert!(!obj.collided_with("cursor", 12));
        // Contact lapses for a step, then resumes: a fresh episode.
        assert!(obj.collided_with("cursor", 14));
    }

    #[test]
    fn test_constraint_response_spring() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();
        s.create_constraint("c1", "s1", None, ConstraintKind::Fixed)
            .unwrap();

        s.dispatch(&OscMessage::floats("/constraint/c1/response/spring", &[40.0, 0.5]))
            .unwrap();
        let c = s.constraint("c1").unwrap();
        assert!((c.stiffness - 40.0).abs() < 1e-6);
        assert!((c.damping - 0.5).abs() < 1e-6);

        s.dispatch(&OscMessage::floats("/constraint/c1/response/linear", &[25.0]))
            .unwrap();
        let c = s.constraint("c1").unwrap();
        assert!((c.stiffness - 25.0).abs() < 1e-6);
        assert!(c.damping.abs() < 1e-6);
    }

    #[test]
    fn test_unimplemented_response_is_reported() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();
        s.create_constraint("c1", "s1", None, ConstraintKind::Fixed)
            .unwrap();

        let err = s
            .dispatch(&OscMessage::floats("/constraint/c1/response/wall", &[1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, SceneError::UnimplementedResponse(_)));
    }

    #[test]
    fn test_missing_mesh_file_creates_nothing() {
        let mut s = scene();
        let err = s
            .dispatch(&OscMessage::new(
                "/world/mesh/create",
                vec![
                    OscArg::from("m"),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                    OscArg::Float(0.0),
                    OscArg::from("missing.obj"),
                ],
            ))
            .unwrap_err();
        assert!(matches!(err, SceneError::MissingFile(_)));
        assert!(s.object("m").is_none());
    }

    #[test]
    fn test_grab_verbs() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();

        let changes = s.dispatch(&OscMessage::new("/world/s1/grab", vec![])).unwrap();
        assert_eq!(
            changes[0],
            SceneChange::GrabRequested {
                name: Some("s1".to_string())
            }
        );

        let changes = s
            .dispatch(&OscMessage::new("/world/s1/grab", vec![OscArg::Int(0)]))
            .unwrap();
        assert_eq!(changes[0], SceneChange::GrabRequested { name: None });
    }

    #[test]
    fn test_push_parses_force_and_point() {
        let mut s = scene();
        s.dispatch(&sphere_create("s1", [0.0; 3])).unwrap();

        let changes = s
            .dispatch(&OscMessage::floats(
                "/world/s1/push",
                &[0.0, 0.0, -1.0, 0.0, 0.0, 0.05],
            ))
            .unwrap();
        match &changes[0] {
            SceneChange::PushApplied { name, force, point } => {
                assert_eq!(name, "s1");
                assert!((force.z + 1.0).abs() < 1e-6);
                assert!((point.z - 0.05).abs() < 1e-6);
            }
            other => panic!("expected push, got {other:?}"),
        }
    }
}
