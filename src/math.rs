//! Math types for Sonara

pub use glam::{Quat, Vec3};

/// Listener orientation as a forward/up vector pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub forward: Vec3,
    pub up: Vec3,
}

impl Orientation {
    pub fn new(forward: Vec3, up: Vec3) -> Self {
        Self { forward, up }
    }

    pub fn identity() -> Self {
        Self {
            forward: -Vec3::Z,
            up: Vec3::Y,
        }
    }

    pub fn from_rotation(rotation: Quat) -> Self {
        Self {
            forward: rotation * (-Vec3::Z),
            up: rotation * Vec3::Y,
        }
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self::identity()
    }
}
