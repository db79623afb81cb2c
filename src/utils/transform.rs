bitflags::bitflags! {
    /// Reflection and rotation applied to a layer's content.
    ///
    /// An empty set is the identity transform. Exactly one rotation bit is
    /// expected at a time; reflections may combine with [`Transform::ROTATE_90`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Transform: u32 {
        /// Mirror horizontally
        const REFLECT_X = 1 << 0;
        /// Mirror vertically
        const REFLECT_Y = 1 << 1;
        /// Rotate by 90 degrees clockwise
        const ROTATE_90 = 1 << 2;
        /// Rotate by 180 degrees
        const ROTATE_180 = 1 << 3;
        /// Rotate by 270 degrees clockwise
        const ROTATE_270 = 1 << 4;
    }
}

/// Rotation of the whole display relative to its panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayRotation {
    /// Panel-native orientation
    #[default]
    None,
    /// Display rotated by 90 degrees
    Rotate90,
    /// Display rotated by 180 degrees
    Rotate180,
    /// Display rotated by 270 degrees
    Rotate270,
}

/// Composes a layer transform with the global display rotation into the
/// transform the plane has to apply.
///
/// Reflections survive the composition only for 90-degree layer rotations and
/// for untransformed layers on a 90-degree rotated display; the other branches
/// drop them. That asymmetry is part of the contract, not an oversight.
pub fn resolve_transform(transform: Transform, rotation: DisplayRotation) -> Transform {
    let mut plane_transform = Transform::empty();

    if transform.contains(Transform::ROTATE_90) {
        if transform.contains(Transform::REFLECT_X) {
            plane_transform |= Transform::REFLECT_X;
        }
        if transform.contains(Transform::REFLECT_Y) {
            plane_transform |= Transform::REFLECT_Y;
        }
        match rotation {
            DisplayRotation::Rotate90 => plane_transform |= Transform::ROTATE_180,
            DisplayRotation::Rotate180 => plane_transform |= Transform::ROTATE_270,
            DisplayRotation::None => plane_transform |= Transform::ROTATE_90,
            _ => {}
        }
    } else if transform.contains(Transform::ROTATE_180) {
        match rotation {
            DisplayRotation::Rotate90 => plane_transform |= Transform::ROTATE_270,
            DisplayRotation::Rotate270 => plane_transform |= Transform::ROTATE_90,
            DisplayRotation::None => plane_transform |= Transform::ROTATE_180,
            _ => {}
        }
    } else if transform.contains(Transform::ROTATE_270) {
        match rotation {
            DisplayRotation::Rotate270 => plane_transform |= Transform::ROTATE_180,
            DisplayRotation::Rotate180 => plane_transform |= Transform::ROTATE_90,
            DisplayRotation::None => plane_transform |= Transform::ROTATE_270,
            _ => {}
        }
    } else if rotation == DisplayRotation::Rotate90 {
        if transform.contains(Transform::REFLECT_X) {
            plane_transform |= Transform::REFLECT_X;
        }
        if transform.contains(Transform::REFLECT_Y) {
            plane_transform |= Transform::REFLECT_Y;
        }
        plane_transform |= Transform::ROTATE_90;
    } else {
        match rotation {
            DisplayRotation::Rotate270 => plane_transform |= Transform::ROTATE_270,
            DisplayRotation::Rotate180 => plane_transform |= Transform::REFLECT_Y,
            _ => {}
        }
    }

    plane_transform
}
