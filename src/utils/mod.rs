//! Geometry and transform primitives shared by the planner

mod geometry;
mod transform;

pub use self::geometry::{analyse_overlap, Overlap, Rect};
pub use self::transform::{resolve_transform, DisplayRotation, Transform};
