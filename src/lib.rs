#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! **hwc-planner: plane composition planning for hardware compositors**
//!
//! Given the ordered stack of layers an application wants on screen this
//! cycle, the planner assigns each layer either to a dedicated hardware
//! overlay plane (direct scan-out) or to a grouped off-screen surface that a
//! GPU/VPP compositor renders before scan-out. Scan-out is cheaper than
//! composition, so the planner tries to occupy as many planes as the hardware
//! and the driver's atomic test commit allow, squashing plane entries together
//! only when planes run out or video constraints demand it.
//!
//! The crate contains no driver code. The KMS side is consumed through the
//! [`DisplayPlaneHandler`](plane::DisplayPlaneHandler) and
//! [`DisplayPlane`](plane::DisplayPlane) traits, buffer import through
//! [`NativeBufferHandler`](buffer::NativeBufferHandler), and off-screen
//! surface allocation through
//! [`SurfaceAllocator`](surface::SurfaceAllocator). A host drives the planner
//! once per frame:
//!
//! 1. Build one [`OverlayLayer`](layer::OverlayLayer) per visible
//!    [`HwcLayer`](layer::HwcLayer), diffing against the previous frame's
//!    layer so unchanged planes can be re-used cheaply.
//! 2. Call [`validate_layers`](plane::DisplayPlaneManager::validate_layers)
//!    to obtain the composition plan, an ordered list of
//!    [`DisplayPlaneState`](plane::DisplayPlaneState) entries.
//! 3. Submit one atomic commit built from the plan; on later frames where only
//!    small things changed, call
//!    [`re_validate_planes`](plane::DisplayPlaneManager::re_validate_planes)
//!    instead of a full pass.
//!
//! The planner is single-threaded cooperative: one manager per display, one
//! frame planned at a time. No plan survives past the frame it was built for
//! unless the host re-validates it.

pub mod buffer;
pub mod layer;
pub mod plane;
pub mod surface;
pub mod utils;
