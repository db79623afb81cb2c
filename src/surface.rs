//! Off-screen render targets
//!
//! When layers cannot be scanned out directly they are composited into an
//! off-screen surface that then becomes the source of its plane. Surfaces are
//! pooled by the [`DisplayPlaneManager`](crate::plane::DisplayPlaneManager)
//! and recycled across frames; the concrete surface (a GBM buffer, a gralloc
//! allocation, ...) lives behind the [`NativeSurface`] trait.

use std::fmt;

use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::buffer::BufferUsage;
use crate::layer::OverlayLayer;
use crate::utils::Rect;

/// Stable identity of a pooled surface.
///
/// Plane states refer to their off-screen targets by id rather than by
/// reference, so releasing pool entries never invalidates a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub(crate) u64);

/// How much of a surface must be repainted before its next use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearType {
    /// Contents are valid, nothing to clear
    #[default]
    None,
    /// Only the damaged region needs repainting
    PartialClear,
    /// The whole surface needs repainting
    FullClear,
}

/// One off-screen target as provided by the host's allocator.
///
/// The surface owns an [`OverlayLayer`] describing its contents; once bound to
/// a plane, that layer is what the driver scans out. Ageing is driven by the
/// host after present: `age == -1` marks a surface as eligible for recycling,
/// non-negative values count frames since it was last presented.
pub trait NativeSurface: fmt::Debug {
    /// Performs the actual buffer allocation.
    ///
    /// Returns whether `modifier` was honored; on `false` the surface is still
    /// usable with the allocator's default layout and the caller is expected
    /// to stop asking for that modifier.
    fn init(&mut self, format: DrmFourcc, usage: BufferUsage, modifier: DrmModifier) -> bool;

    /// Current age; `-1` means recyclable
    fn age(&self) -> i32;

    /// Updates the age
    fn set_age(&mut self, age: i32);

    /// Whether the driver currently scans this surface out
    fn is_on_screen(&self) -> bool;

    /// Format modifier the surface was allocated with
    fn modifier(&self) -> DrmModifier;

    /// The layer describing this surface's contents
    fn layer(&self) -> &OverlayLayer;

    /// Mutable access to the surface's layer
    fn layer_mut(&mut self) -> &mut OverlayLayer;

    /// Binds the surface to a plane covering `display_frame`.
    ///
    /// Implementations update their layer's geometry and damage to cover the
    /// given frame.
    fn set_plane_target(&mut self, display_frame: Rect<i32>);

    /// Records how much of the surface must be repainted
    fn set_clear_surface(&mut self, clear: ClearType);
}

/// Factory for off-screen targets.
///
/// Split by content type because video surfaces typically come from a
/// different allocator path (linear, VPP-compatible) than ordinary 3D render
/// targets.
pub trait SurfaceAllocator {
    /// Concrete surface type produced by this allocator
    type Surface: NativeSurface;

    /// Allocates a render target for GPU composition
    fn create_3d_surface(&mut self, width: u32, height: u32) -> Self::Surface;

    /// Allocates a target suitable for video post-processing output
    fn create_video_surface(&mut self, width: u32, height: u32) -> Self::Surface;
}
