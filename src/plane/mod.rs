//! Hardware planes and the composition planner
//!
//! The planner talks to the display driver through two seams: the
//! [`DisplayPlaneHandler`], which discovers planes and answers atomic
//! test-commit queries, and the per-plane [`DisplayPlane`] capability set. A
//! composition plan is a [`DisplayPlaneStateList`] produced by the
//! [`DisplayPlaneManager`].

use std::fmt;
use std::io;

use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::layer::OverlayLayer;

mod manager;
mod state;

pub use self::manager::{DisplayPlaneManager, ReValidationResult, ValidationResult};
pub use self::state::{
    DisplayPlaneState, DisplayPlaneStateList, PlaneSource, ReValidation, RotationType,
};

/// One hardware overlay plane as exposed by the driver.
///
/// Planes are discovered in z-order through
/// [`DisplayPlaneHandler::populate_planes`] and owned by the manager for its
/// whole lifetime; plan entries refer to them by index.
pub trait DisplayPlane: fmt::Debug {
    /// Whether the plane can scan out arbitrary content, including cursors.
    ///
    /// A non-universal trailing plane is reserved for the cursor.
    fn is_universal(&self) -> bool;

    /// Whether the plane supports `format`
    fn is_supported_format(&self, format: DrmFourcc) -> bool;

    /// Whether the plane can scan out `layer` at all (format, scaling range,
    /// transform support). This is the cheap local check; the authoritative
    /// answer is the driver's test commit.
    fn validate_layer(&self, layer: &OverlayLayer) -> bool;

    /// Preferred format for off-screen targets feeding this plane
    fn preferred_format(&self) -> DrmFourcc;

    /// Preferred format for video content on this plane
    fn preferred_video_format(&self) -> DrmFourcc;

    /// Preferred format modifier for off-screen targets
    fn preferred_format_modifier(&self) -> DrmModifier;

    /// Feedback that the preferred modifier was honored by the allocator
    fn preferred_format_modifier_validated(&mut self);

    /// Feedback that the allocator rejected the preferred modifier; the plane
    /// must stop reporting it
    fn black_list_preferred_format_modifier(&mut self);

    /// Stages a disable of this plane into the driver's pending atomic
    /// request
    fn disable(&mut self);

    /// Marks the plane as claimed by the current plan
    fn set_in_use(&mut self, in_use: bool);

    /// Whether the plane is claimed by the current plan
    fn in_use(&self) -> bool;
}

/// One entry of a candidate atomic commit: a plane and the layer it would
/// scan out. The layer is either a frame layer or the bound layer of an
/// off-screen target.
#[derive(Debug, Clone, Copy)]
pub struct PlaneCommit<'a> {
    /// The plane receiving the layer
    pub plane: &'a dyn DisplayPlane,
    /// The layer the plane would scan out
    pub layer: &'a OverlayLayer,
}

/// Driver-side entry points consumed by the planner
pub trait DisplayPlaneHandler {
    /// Discovers the hardware planes in z-order, bottom first
    fn populate_planes(&mut self) -> io::Result<Vec<Box<dyn DisplayPlane>>>;

    /// Submits a test-only atomic commit for the candidate assignment.
    ///
    /// Returns whether the kernel would accept it. This is a synchronous
    /// round-trip and the single expensive call in the planning loop.
    fn test_commit(&self, commit: &[PlaneCommit<'_>]) -> bool;
}

/// Errors raised while bringing up the plane manager
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The driver failed to enumerate hardware planes
    #[error("failed to discover hardware planes")]
    PopulatePlanes(#[source] io::Error),
    /// The display exposes no usable hardware planes
    #[error("display has no usable hardware planes")]
    NoPlanes,
}
