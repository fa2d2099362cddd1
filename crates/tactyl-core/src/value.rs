//! The typed value & property layer.
//!
//! Every OSC-addressable property of a scene entity is described by a
//! [`PropertyKind`] carrying a declared *target simulation*. Setting a
//! property stores the value in every simulation's replica of the entity,
//! but the side effect of the change (moving a rigid body, rescaling a
//! collider, reloading a texture) runs in exactly the target simulation's
//! thread. This keeps all mutation of a simulation's backend on its own
//! worker without any shared locking.

use serde::{Deserialize, Serialize};

use crate::math::{Mat3, Vec3};

// ============================================================================
// Simulation Tags
// ============================================================================

/// Identifies one of the three simulation loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimTag {
    /// Rigid-body dynamics, ~100 Hz.
    Physics,
    /// Force-feedback loop, ~1 kHz.
    Haptics,
    /// Render mirror, ~30 Hz.
    Visual,
}

impl SimTag {
    /// All tags, in scheduling order.
    pub const ALL: [SimTag; 3] = [SimTag::Physics, SimTag::Haptics, SimTag::Visual];

    /// Bit used in a [`SimSet`].
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Physics => 0b001,
            Self::Haptics => 0b010,
            Self::Visual => 0b100,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Physics => "physics",
            Self::Haptics => "haptics",
            Self::Visual => "visual",
        }
    }
}

/// A set of simulation tags, used for broadcasts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimSet(u8);

impl SimSet {
    /// The empty set.
    pub const NONE: SimSet = SimSet(0);
    /// Every simulation.
    pub const ALL: SimSet = SimSet(0b111);

    /// Set containing a single simulation.
    #[must_use]
    pub const fn only(tag: SimTag) -> Self {
        Self(tag.bit())
    }

    /// Union with another tag.
    #[must_use]
    pub const fn with(self, tag: SimTag) -> Self {
        Self(self.0 | tag.bit())
    }

    /// Set of every simulation except the given one.
    #[must_use]
    pub const fn all_except(tag: SimTag) -> Self {
        Self(Self::ALL.0 & !tag.bit())
    }

    /// Membership test.
    #[must_use]
    pub const fn contains(self, tag: SimTag) -> bool {
        self.0 & tag.bit() != 0
    }

    /// Iterate the members in scheduling order.
    pub fn iter(self) -> impl Iterator<Item = SimTag> {
        SimTag::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

// ============================================================================
// Property Kinds
// ============================================================================

/// One OSC-addressable property of a scene entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    /// World-space position.
    Position,
    /// 3x3 rotation matrix.
    Rotation,
    /// Linear velocity.
    Velocity,
    /// Per-tick velocity delta, published outbound only.
    Acceleration,
    /// Transient external force.
    Force,
    /// Display color.
    Color,
    /// Static friction coefficient.
    FrictionStatic,
    /// Dynamic friction coefficient.
    FrictionDynamic,
    /// Texture image file path.
    TextureImage,
    /// Whether collision events are reported for this object.
    Collide,
    /// Whether the object is rendered.
    Visible,
    /// Mass; zero makes the object kinematic.
    Mass,
    /// Sphere radius.
    Radius,
    /// Prism full extents or mesh bounding size.
    Size,
}

/// Property kinds ordered longest-suffix-first so that paths with composite
/// child names (which contain `/`) resolve unambiguously.
const SUFFIX_TABLE: [(&str, PropertyKind); 14] = [
    ("friction/static", PropertyKind::FrictionStatic),
    ("friction/dynamic", PropertyKind::FrictionDynamic),
    ("texture/image", PropertyKind::TextureImage),
    ("acceleration", PropertyKind::Acceleration),
    ("position", PropertyKind::Position),
    ("rotation", PropertyKind::Rotation),
    ("velocity", PropertyKind::Velocity),
    ("visible", PropertyKind::Visible),
    ("collide", PropertyKind::Collide),
    ("radius", PropertyKind::Radius),
    ("force", PropertyKind::Force),
    ("color", PropertyKind::Color),
    ("mass", PropertyKind::Mass),
    ("size", PropertyKind::Size),
];

impl PropertyKind {
    /// The simulation on which this property's side effect runs.
    #[must_use]
    pub const fn target(self) -> SimTag {
        match self {
            Self::FrictionStatic | Self::FrictionDynamic | Self::TextureImage => SimTag::Haptics,
            _ => SimTag::Physics,
        }
    }

    /// OSC path suffix relative to the object.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Rotation => "rotation",
            Self::Velocity => "velocity",
            Self::Acceleration => "acceleration",
            Self::Force => "force",
            Self::Color => "color",
            Self::FrictionStatic => "friction/static",
            Self::FrictionDynamic => "friction/dynamic",
            Self::TextureImage => "texture/image",
            Self::Collide => "collide",
            Self::Visible => "visible",
            Self::Mass => "mass",
            Self::Radius => "radius",
            Self::Size => "size",
        }
    }

    /// Split `rest` (an address with the `/world/` prefix removed) into an
    /// object name and property kind, if the tail names a property.
    ///
    /// Object names may themselves contain `/` (composite children), so the
    /// match runs suffix-first.
    #[must_use]
    pub fn split_path(rest: &str) -> Option<(&str, PropertyKind)> {
        for (suffix, kind) in SUFFIX_TABLE {
            if let Some(name) = rest.strip_suffix(suffix) {
                if let Some(name) = name.strip_suffix('/') {
                    if !name.is_empty() {
                        return Some((name, kind));
                    }
                }
            }
        }
        None
    }
}

// ============================================================================
// Property Values
// ============================================================================

/// A typed property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// Scalar value.
    Scalar(f32),
    /// 3-vector value.
    Vec3(Vec3),
    /// 3x3 matrix value.
    Mat3(Mat3),
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i32),
    /// Short string value.
    Text(String),
}

impl PropertyValue {
    /// Scalar accessor.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Vector accessor.
    #[must_use]
    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Self::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    /// Matrix accessor.
    #[must_use]
    pub fn as_mat3(&self) -> Option<Mat3> {
        match self {
            Self::Mat3(m) => Some(*m),
            _ => None,
        }
    }

    /// Boolean accessor; integers are truthy when non-zero.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// String accessor.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simset_membership() {
        let set = SimSet::only(SimTag::Haptics).with(SimTag::Visual);
        assert!(set.contains(SimTag::Haptics));
        assert!(set.contains(SimTag::Visual));
        assert!(!set.contains(SimTag::Physics));
    }

    #[test]
    fn test_simset_all_except() {
        let set = SimSet::all_except(SimTag::Physics);
        assert_eq!(set.iter().count(), 2);
        assert!(!set.contains(SimTag::Physics));
    }

    #[test]
    fn test_split_simple_path() {
        let (name, kind) = PropertyKind::split_path("s1/position").unwrap();
        assert_eq!(name, "s1");
        assert_eq!(kind, PropertyKind::Position);
    }

    #[test]
    fn test_split_composite_child_path() {
        let (name, kind) = PropertyKind::split_path("p/a/friction/static").unwrap();
        assert_eq!(name, "p/a");
        assert_eq!(kind, PropertyKind::FrictionStatic);
    }

    #[test]
    fn test_split_rejects_bare_suffix() {
        assert!(PropertyKind::split_path("position").is_none());
        assert!(PropertyKind::split_path("s1/destroy").is_none());
    }

    #[test]
    fn test_property_targets() {
        assert_eq!(PropertyKind::Position.target(), SimTag::Physics);
        assert_eq!(PropertyKind::FrictionStatic.target(), SimTag::Haptics);
        assert_eq!(PropertyKind::TextureImage.target(), SimTag::Haptics);
        assert_eq!(PropertyKind::Mass.target(), SimTag::Physics);
    }

    #[test]
    fn test_value_accessors() {
        assert!((PropertyValue::Scalar(2.5).as_scalar().unwrap() - 2.5).abs() < 1e-6);
        assert_eq!(PropertyValue::Int(1).as_bool(), Some(true));
        assert_eq!(PropertyValue::Int(0).as_bool(), Some(false));
        assert!(PropertyValue::Text("tex.png".into()).as_vec3().is_none());
    }
}
