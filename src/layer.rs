//! Per-frame layer descriptors
//!
//! [`HwcLayer`] is the app-facing description of one layer in the stack; it
//! accumulates change bits as the host updates it between frames. At
//! frame-begin the host turns each visible `HwcLayer` into an [`OverlayLayer`]
//! for the planner, diffing against the previous cycle's `OverlayLayer` so
//! that planes whose content did not meaningfully change can skip
//! re-validation and keep their cached composition.

use std::os::fd::{BorrowedFd, OwnedFd};

use tracing::warn;

use crate::buffer::{ImportedBuffer, NativeBufferHandler, NativeHandle, OverlayBuffer};
use crate::utils::{resolve_transform, DisplayRotation, Rect, Transform};

bitflags::bitflags! {
    /// What changed on a layer relative to the previous frame.
    ///
    /// Computed during [`OverlayLayer`] initialization; planes read these as
    /// OR-masks to decide how much of their cached state survives.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LayerState: u32 {
        /// The plane's off-screen surface must be fully repainted
        const CLEAR_SURFACE = 1 << 0;
        /// The display frame moved or resized
        const DIMENSIONS_CHANGED = 1 << 1;
        /// Transform, blending or similar attributes changed
        const ATTRIBUTES_CHANGED = 1 << 2;
        /// The visible content changed
        const CONTENT_CHANGED = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Change bits an [`HwcLayer`] accumulates as the host updates it
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LayerUpdate: u32 {
        /// `set_display_frame` stored a different rectangle
        const DISPLAY_RECT = 1 << 0;
        /// `set_source_crop` stored a different rectangle
        const SOURCE_RECT = 1 << 1;
        /// Alpha or blending changed
        const CONTENT_ATTRIBUTES = 1 << 2;
        /// Transform changed
        const LAYER_ATTRIBUTES = 1 << 3;
        /// The visible region changed
        const VISIBLE_REGION = 1 << 4;
        /// The reported surface damage changed
        const SURFACE_DAMAGE = 1 << 5;
        /// A new buffer was attached
        const CONTENT = 1 << 6;
    }
}

/// Blending mode requested for a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwcBlending {
    /// Source pixels replace destination pixels
    #[default]
    None,
    /// Source alpha is premultiplied
    Premult,
    /// Coverage blending
    Coverage,
}

/// Classification of a layer derived from its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerType {
    /// Ordinary colour content
    #[default]
    Normal,
    /// Cursor image
    Cursor,
    /// Decoded video
    Video,
}

/// How a layer ends up on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composition {
    /// Composited by the GPU into an off-screen target
    Gpu,
    /// Scanned out directly by the display hardware
    Display,
    /// Either path works (used for the supported set, never as the actual
    /// composition)
    All,
}

/// App-facing description of one layer in the stack.
///
/// Setters compare against the stored value and record the difference in the
/// update mask; the planner's previous-frame diff reads those bits. After a
/// present the host calls [`clear_update_state`](HwcLayer::clear_update_state)
/// so the next frame starts from a clean slate.
#[derive(Debug, Default)]
pub struct HwcLayer {
    display_frame: Rect<i32>,
    source_crop: Rect<f32>,
    surface_damage: Rect<i32>,
    visible_region: Rect<i32>,
    blending: HwcBlending,
    alpha: u8,
    transform: Transform,
    native_handle: Option<NativeHandle>,
    acquire_fence: Option<OwnedFd>,
    solid_color: Option<u32>,
    left_constraint: i32,
    right_constraint: i32,
    left_source_constraint: f32,
    right_source_constraint: f32,
    update: LayerUpdate,
}

impl HwcLayer {
    /// Creates an empty, fully opaque layer without constraints
    pub fn new() -> Self {
        HwcLayer {
            alpha: 0xff,
            left_constraint: -1,
            right_constraint: -1,
            left_source_constraint: -1.0,
            right_source_constraint: -1.0,
            ..Default::default()
        }
    }

    /// Sets the on-screen destination rectangle
    pub fn set_display_frame(&mut self, frame: Rect<i32>) {
        if frame != self.display_frame {
            self.update |= LayerUpdate::DISPLAY_RECT;
            self.display_frame = frame;
        }
    }

    /// Sets the sampled region of the buffer
    pub fn set_source_crop(&mut self, crop: Rect<f32>) {
        if crop != self.source_crop {
            self.update |= LayerUpdate::SOURCE_RECT;
            self.source_crop = crop;
        }
    }

    /// Sets the region the host reports as damaged since the last frame
    pub fn set_surface_damage(&mut self, damage: Rect<i32>) {
        if damage != self.surface_damage {
            self.update |= LayerUpdate::SURFACE_DAMAGE;
            self.surface_damage = damage;
        }
    }

    /// Sets the visible region of the layer
    pub fn set_visible_region(&mut self, region: Rect<i32>) {
        if region != self.visible_region {
            self.update |= LayerUpdate::VISIBLE_REGION;
            self.visible_region = region;
        }
    }

    /// Sets the layer's plane alpha
    pub fn set_alpha(&mut self, alpha: u8) {
        if alpha != self.alpha {
            self.update |= LayerUpdate::CONTENT_ATTRIBUTES;
            self.alpha = alpha;
        }
    }

    /// Sets the blending mode
    pub fn set_blending(&mut self, blending: HwcBlending) {
        if blending != self.blending {
            self.update |= LayerUpdate::CONTENT_ATTRIBUTES;
            self.blending = blending;
        }
    }

    /// Sets the layer transform
    pub fn set_transform(&mut self, transform: Transform) {
        if transform != self.transform {
            self.update |= LayerUpdate::LAYER_ATTRIBUTES;
            self.transform = transform;
        }
    }

    /// Attaches a buffer for the coming frame.
    ///
    /// A new buffer always counts as new content.
    pub fn set_native_handle(&mut self, handle: NativeHandle) {
        self.update |= LayerUpdate::CONTENT;
        self.native_handle = Some(handle);
        self.solid_color = None;
    }

    /// Turns the layer into a solid colour fill without a buffer
    pub fn set_solid_color(&mut self, argb: u32) {
        if self.solid_color != Some(argb) {
            self.update |= LayerUpdate::CONTENT;
        }
        self.solid_color = Some(argb);
        self.native_handle = None;
    }

    /// Stores the acquire fence the compositor must wait on before sampling
    /// the attached buffer. Any previously stored fence is closed.
    pub fn set_acquire_fence(&mut self, fence: OwnedFd) {
        self.acquire_fence = Some(fence);
    }

    /// Restricts the display frame horizontally (multi-pipe output split)
    pub fn set_display_constraints(&mut self, left: i32, right: i32) {
        self.left_constraint = left;
        self.right_constraint = right;
    }

    /// Restricts the source crop horizontally
    pub fn set_source_constraints(&mut self, left: f32, right: f32) {
        self.left_source_constraint = left;
        self.right_source_constraint = right;
    }

    /// Forgets all accumulated change bits
    pub fn clear_update_state(&mut self) {
        self.update = LayerUpdate::empty();
    }

    /// The on-screen destination rectangle
    pub fn display_frame(&self) -> &Rect<i32> {
        &self.display_frame
    }

    /// The sampled region of the buffer
    pub fn source_crop(&self) -> &Rect<f32> {
        &self.source_crop
    }

    /// The damage reported for this frame
    pub fn surface_damage(&self) -> &Rect<i32> {
        &self.surface_damage
    }

    /// Accumulated change bits since the last
    /// [`clear_update_state`](HwcLayer::clear_update_state)
    pub fn update_state(&self) -> LayerUpdate {
        self.update
    }

    fn has_display_rect_changed(&self) -> bool {
        self.update.contains(LayerUpdate::DISPLAY_RECT)
    }

    fn has_source_rect_changed(&self) -> bool {
        self.update.contains(LayerUpdate::SOURCE_RECT)
    }

    fn has_content_attributes_changed(&self) -> bool {
        self.update.contains(LayerUpdate::CONTENT_ATTRIBUTES)
    }

    fn has_layer_attributes_changed(&self) -> bool {
        self.update.contains(LayerUpdate::LAYER_ATTRIBUTES)
    }

    fn has_visible_region_changed(&self) -> bool {
        self.update.contains(LayerUpdate::VISIBLE_REGION)
    }

    fn has_surface_damage_changed(&self) -> bool {
        self.update.contains(LayerUpdate::SURFACE_DAMAGE)
    }

    fn has_content_changed(&self) -> bool {
        self.update.contains(LayerUpdate::CONTENT)
    }
}

/// The planner's per-cycle view of one layer.
///
/// Built once per frame from the [`HwcLayer`] and the previous cycle's
/// `OverlayLayer`, then only mutated by the planner while the plan is under
/// construction. Owns the layer's [`ImportedBuffer`] and with it the acquire
/// fence.
#[derive(Debug)]
pub struct OverlayLayer {
    transform: Transform,
    plane_transform: Transform,
    alpha: u8,
    blending: HwcBlending,
    z_order: usize,
    layer_index: usize,
    source_crop: Rect<f32>,
    display_frame: Rect<i32>,
    source_crop_width: i32,
    source_crop_height: i32,
    display_frame_width: i32,
    display_frame_height: i32,
    surface_damage: Rect<i32>,
    last_surface_damage: Rect<i32>,
    state: LayerState,
    layer_type: LayerType,
    gpu_rendered: bool,
    solid_color: bool,
    supported_composition: Composition,
    composition: Composition,
    imported: Option<ImportedBuffer>,
}

impl Default for OverlayLayer {
    fn default() -> Self {
        OverlayLayer::new()
    }
}

impl OverlayLayer {
    fn new() -> Self {
        OverlayLayer {
            transform: Transform::empty(),
            plane_transform: Transform::empty(),
            alpha: 0xff,
            blending: HwcBlending::None,
            z_order: 0,
            layer_index: 0,
            source_crop: Rect::default(),
            display_frame: Rect::default(),
            source_crop_width: 0,
            source_crop_height: 0,
            display_frame_width: 0,
            display_frame_height: 0,
            surface_damage: Rect::default(),
            last_surface_damage: Rect::default(),
            state: LayerState::DIMENSIONS_CHANGED
                | LayerState::ATTRIBUTES_CHANGED
                | LayerState::CONTENT_CHANGED,
            layer_type: LayerType::Normal,
            gpu_rendered: false,
            solid_color: false,
            supported_composition: Composition::Gpu,
            composition: Composition::Display,
            imported: None,
        }
    }

    /// Builds the planner's layer from an [`HwcLayer`], taking ownership of
    /// its acquire fence.
    ///
    /// `previous` is the same stack position's layer from the last cycle and
    /// drives the change diff; `rotation` is the global display rotation the
    /// plane transform has to fold in. With `handle_constraints` the display
    /// frame and source crop are clipped to the layer's constraints (and
    /// `max_height`).
    #[allow(clippy::too_many_arguments)]
    pub fn from_hwc_layer(
        layer: &mut HwcLayer,
        buffer_handler: &dyn NativeBufferHandler,
        previous: Option<&OverlayLayer>,
        z_order: usize,
        layer_index: usize,
        max_height: u32,
        rotation: DisplayRotation,
        handle_constraints: bool,
    ) -> Self {
        let mut overlay = OverlayLayer::new();
        overlay.display_frame = *layer.display_frame();
        overlay.display_frame_width = overlay.display_frame.width();
        overlay.display_frame_height = overlay.display_frame.height();
        overlay.initialize_state(
            layer,
            buffer_handler,
            previous,
            z_order,
            layer_index,
            max_height,
            rotation,
            handle_constraints,
        );
        overlay
    }

    /// Like [`from_hwc_layer`](OverlayLayer::from_hwc_layer) but with an
    /// explicit destination rectangle, used when the output is scaled.
    #[allow(clippy::too_many_arguments)]
    pub fn from_scaled_hwc_layer(
        layer: &mut HwcLayer,
        buffer_handler: &dyn NativeBufferHandler,
        previous: Option<&OverlayLayer>,
        z_order: usize,
        layer_index: usize,
        display_frame: Rect<i32>,
        max_height: u32,
        rotation: DisplayRotation,
        handle_constraints: bool,
    ) -> Self {
        let mut overlay = OverlayLayer::new();
        overlay.set_display_frame(display_frame);
        overlay.initialize_state(
            layer,
            buffer_handler,
            previous,
            z_order,
            layer_index,
            max_height,
            rotation,
            handle_constraints,
        );
        overlay
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_state(
        &mut self,
        layer: &mut HwcLayer,
        buffer_handler: &dyn NativeBufferHandler,
        previous: Option<&OverlayLayer>,
        z_order: usize,
        layer_index: usize,
        max_height: u32,
        rotation: DisplayRotation,
        handle_constraints: bool,
    ) {
        self.transform = layer.transform;
        if rotation != DisplayRotation::None {
            self.plane_transform = resolve_transform(layer.transform, rotation);
            // The display rotation is folded into the layer transform until
            // rotation at the pipe level is supported.
            self.transform = self.plane_transform;
        } else {
            self.plane_transform = self.transform;
        }

        self.alpha = layer.alpha;
        self.layer_index = layer_index;
        self.z_order = z_order;
        self.set_source_crop(*layer.source_crop());
        self.blending = layer.blending;
        self.solid_color = layer.solid_color.is_some();
        if let Some(handle) = layer.native_handle {
            let fence = layer.acquire_fence.take();
            self.set_buffer(buffer_handler, handle, fence);
        }
        self.validate_for_overlay_usage();
        if let Some(previous) = previous {
            self.validate_previous_frame_state(previous, layer);
        }

        if layer.has_content_attributes_changed()
            || layer.has_visible_region_changed()
            || layer.has_layer_attributes_changed()
        {
            self.state |= LayerState::CLEAR_SURFACE;
        }

        if !handle_constraints {
            self.update_surface_damage(layer, previous);
            return;
        }

        let left_constraint = layer.left_constraint;
        let right_constraint = layer.right_constraint;
        if left_constraint >= 0 && right_constraint >= 0 {
            if self.display_frame.right > right_constraint {
                self.display_frame.right = right_constraint;
            }

            if self.display_frame.left < left_constraint {
                self.display_frame.left = left_constraint;
            }

            if self.display_frame.right < right_constraint {
                self.display_frame.right = self.display_frame.left.max(self.display_frame.right);
            }

            if self.display_frame.left > left_constraint {
                self.display_frame.left = self.display_frame.left.min(self.display_frame.right);
            }

            if left_constraint > 0 {
                // Make the frame relative to this pipe's origin.
                self.display_frame.left -= left_constraint;
                self.display_frame.right = right_constraint - self.display_frame.right;
            }

            self.display_frame.bottom = self.display_frame.bottom.min(max_height as i32);
            self.display_frame_width = self.display_frame.width();
            self.display_frame_height = self.display_frame.height();
            self.update_surface_damage(layer, previous);
            if self.gpu_rendered {
                self.surface_damage.left = self.surface_damage.left.min(self.display_frame.left);
                self.surface_damage.right = self.surface_damage.right.min(self.display_frame.right);
                self.surface_damage.top = self.surface_damage.top.min(self.display_frame.top);
                self.surface_damage.bottom =
                    self.surface_damage.bottom.min(self.display_frame.bottom);
            }
        }

        let left_constraint = layer.left_source_constraint;
        let right_constraint = layer.right_source_constraint;
        if left_constraint >= 0.0 && right_constraint >= 0.0 {
            if self.source_crop.right > right_constraint {
                self.source_crop.right = right_constraint;
            }

            if self.source_crop.left < left_constraint {
                self.source_crop.left = left_constraint;
            }

            if self.source_crop.right < right_constraint {
                self.source_crop.right = self.source_crop.left.max(self.source_crop.right);
            }

            if self.source_crop.left > left_constraint {
                self.source_crop.left = self.source_crop.left.min(self.source_crop.right);
            }

            self.source_crop_width =
                self.source_crop.right.ceil() as i32 - self.source_crop.left as i32;
            self.source_crop_height =
                self.source_crop.bottom.ceil() as i32 - self.source_crop.top as i32;
        }
    }

    /// Decides how much of the previous cycle's validation survives.
    ///
    /// On any mismatch that could change the plane test outcome this returns
    /// with all change bits still set, forcing re-validation.
    fn validate_previous_frame_state(&mut self, previous: &OverlayLayer, layer: &HwcLayer) {
        let (Some(buffer), Some(previous_buffer)) = (self.buffer(), previous.buffer()) else {
            return;
        };
        if buffer.format() != previous_buffer.format() {
            return;
        }

        let mut content_changed = false;
        let rect_changed = layer.has_display_rect_changed();
        // The cursor plane is expected to support alpha always.
        if previous.gpu_rendered || self.layer_type == LayerType::Cursor {
            content_changed = rect_changed
                || layer.has_content_attributes_changed()
                || layer.has_layer_attributes_changed()
                || layer.has_source_rect_changed();
        } else {
            // If the previous frame was opaque and we have alpha now, the
            // plane might not support transparency even though it handled the
            // XRGB case; re-validate. A plane supporting ARGB is assumed to
            // support XRGB.
            if previous.alpha == 0xff && self.alpha != previous.alpha {
                return;
            }

            if self.blending != previous.blending {
                return;
            }

            if rect_changed || layer.has_layer_attributes_changed() {
                return;
            }

            if layer.has_source_rect_changed() {
                // An unchanged overall width and height cannot impact the
                // plane composition result.
                if self.source_crop_width != previous.source_crop_width
                    || self.source_crop_height != previous.source_crop_height
                {
                    return;
                }
            }
        }

        self.state.remove(LayerState::ATTRIBUTES_CHANGED);
        self.gpu_rendered = previous.gpu_rendered;

        if !rect_changed {
            self.state.remove(LayerState::DIMENSIONS_CHANGED);
        }

        if !layer.has_visible_region_changed()
            && !layer.has_surface_damage_changed()
            && !layer.has_content_changed()
            && !content_changed
        {
            self.state.remove(LayerState::CONTENT_CHANGED);
        }
    }

    fn update_surface_damage(&mut self, layer: &HwcLayer, previous: Option<&OverlayLayer>) {
        if !self.gpu_rendered {
            self.surface_damage = self.display_frame;
            self.last_surface_damage = self.surface_damage;
            return;
        }

        let full_damage = previous.is_none()
            || self.state.contains(LayerState::CLEAR_SURFACE)
            || self.state.contains(LayerState::DIMENSIONS_CHANGED)
            || !self.transform.is_empty();
        if full_damage {
            self.surface_damage = self.display_frame;
            self.last_surface_damage = self.surface_damage;
            return;
        }

        let previous_damage = previous.map(|p| p.last_surface_damage).unwrap_or_default();
        let current = *layer.surface_damage();
        self.surface_damage.left = current.left.min(previous_damage.left);
        self.surface_damage.right = current.right.max(previous_damage.right);
        self.surface_damage.top = current.top.min(previous_damage.top);
        self.surface_damage.bottom = current.bottom.max(previous_damage.bottom);

        self.last_surface_damage = current;
    }

    fn validate_for_overlay_usage(&mut self) {
        if let Some(buffer) = self.buffer() {
            if buffer.usage().contains(crate::buffer::BufferUsage::CURSOR) {
                self.layer_type = LayerType::Cursor;
            } else if buffer.is_video_buffer() {
                self.layer_type = LayerType::Video;
            }
        }
    }

    /// Imports `handle` through the buffer handler and takes ownership of the
    /// acquire fence. Import failure leaves the layer without a buffer, which
    /// routes it to GPU composition later on.
    pub fn set_buffer(
        &mut self,
        buffer_handler: &dyn NativeBufferHandler,
        handle: NativeHandle,
        acquire_fence: Option<OwnedFd>,
    ) {
        match buffer_handler.import_buffer(handle) {
            Ok(buffer) => self.imported = Some(ImportedBuffer::new(buffer, acquire_fence)),
            Err(err) => {
                warn!("failed to import buffer {:?}: {}", handle, err);
                self.imported = None;
            }
        }
    }

    /// Installs an already imported buffer, used by surface implementations
    /// that allocate their own backing storage
    pub fn set_buffer_object(
        &mut self,
        buffer: Box<dyn OverlayBuffer>,
        acquire_fence: Option<OwnedFd>,
    ) {
        self.imported = Some(ImportedBuffer::new(buffer, acquire_fence));
    }

    /// Drops the imported buffer, closing any held acquire fence
    pub fn reset_buffer(&mut self) {
        self.imported = None;
    }

    /// The layer's buffer, if one was imported
    pub fn buffer(&self) -> Option<&dyn OverlayBuffer> {
        self.imported.as_ref().map(|imported| imported.buffer())
    }

    /// Replaces the acquire fence, closing any fence currently held
    pub fn set_acquire_fence(&mut self, fence: OwnedFd) {
        if let Some(imported) = self.imported.as_mut() {
            imported.set_acquire_fence(Some(fence));
        }
    }

    /// Borrows the acquire fence, if present
    pub fn acquire_fence(&self) -> Option<BorrowedFd<'_>> {
        self.imported
            .as_ref()
            .and_then(|imported| imported.acquire_fence())
    }

    /// Hands the acquire fence to the caller; the layer keeps the buffer
    pub fn release_acquire_fence(&mut self) -> Option<OwnedFd> {
        self.imported
            .as_mut()
            .and_then(|imported| imported.release_acquire_fence())
    }

    /// Sets the destination rectangle, resetting the damage to cover it
    pub fn set_display_frame(&mut self, display_frame: Rect<i32>) {
        self.display_frame_width = display_frame.width();
        self.display_frame_height = display_frame.height();
        self.display_frame = display_frame;
        self.surface_damage = display_frame;
        self.last_surface_damage = self.surface_damage;
    }

    /// Sets the source crop; the integer width rounds the right edge up and
    /// the left edge down
    pub fn set_source_crop(&mut self, source_crop: Rect<f32>) {
        self.source_crop_width = source_crop.right.ceil() as i32 - source_crop.left as i32;
        self.source_crop_height = source_crop.bottom.ceil() as i32 - source_crop.top as i32;
        self.source_crop = source_crop;
    }

    /// Records how this layer will reach the screen
    pub fn set_layer_composition(&mut self, composition: Composition) {
        self.composition = composition;
        self.gpu_rendered = composition == Composition::Gpu;
    }

    /// The composition path chosen for this layer
    pub fn composition(&self) -> Composition {
        self.composition
    }

    pub(crate) fn set_supported_composition(&mut self, supported: Composition) {
        self.supported_composition = supported;
    }

    /// Which composition paths the last plane test found viable
    pub fn supported_composition(&self) -> Composition {
        self.supported_composition
    }

    /// Forces (or clears) the video classification, used for surfaces bound
    /// to video planes
    pub fn set_video_layer(&mut self, video: bool) {
        self.layer_type = if video {
            LayerType::Video
        } else {
            LayerType::Normal
        };
    }

    /// The destination rectangle on screen
    pub fn display_frame(&self) -> &Rect<i32> {
        &self.display_frame
    }

    /// Width of the destination rectangle
    pub fn display_frame_width(&self) -> i32 {
        self.display_frame_width
    }

    /// Height of the destination rectangle
    pub fn display_frame_height(&self) -> i32 {
        self.display_frame_height
    }

    /// The sampled buffer region
    pub fn source_crop(&self) -> &Rect<f32> {
        &self.source_crop
    }

    /// Integer width of the source crop
    pub fn source_crop_width(&self) -> i32 {
        self.source_crop_width
    }

    /// Integer height of the source crop
    pub fn source_crop_height(&self) -> i32 {
        self.source_crop_height
    }

    /// Damage accumulated for this cycle
    pub fn surface_damage(&self) -> &Rect<i32> {
        &self.surface_damage
    }

    /// The damage reported by the app this cycle, stored for the next union
    pub fn last_surface_damage(&self) -> &Rect<i32> {
        &self.last_surface_damage
    }

    /// Position in the layer stack, bottom is zero
    pub fn z_order(&self) -> usize {
        self.z_order
    }

    /// Index of the backing `HwcLayer` in the host's list
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// The transform the plane has to apply, display rotation folded in
    pub fn plane_transform(&self) -> Transform {
        self.plane_transform
    }

    /// The layer transform (equals [`plane_transform`](OverlayLayer::plane_transform)
    /// once a display rotation applies)
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Plane alpha
    pub fn alpha(&self) -> u8 {
        self.alpha
    }

    /// Blending mode
    pub fn blending(&self) -> HwcBlending {
        self.blending
    }

    /// Change bits against the previous cycle
    pub fn state(&self) -> LayerState {
        self.state
    }

    /// Classification derived from the buffer
    pub fn layer_type(&self) -> LayerType {
        self.layer_type
    }

    /// Whether this is a cursor layer
    pub fn is_cursor_layer(&self) -> bool {
        self.layer_type == LayerType::Cursor
    }

    /// Whether this layer carries video content
    pub fn is_video_layer(&self) -> bool {
        self.layer_type == LayerType::Video
    }

    /// Whether this is a bufferless solid colour fill
    pub fn is_solid_color(&self) -> bool {
        self.solid_color
    }

    /// Whether the layer is currently composited by the GPU
    pub fn gpu_rendered(&self) -> bool {
        self.gpu_rendered
    }

    /// Whether the layer wants a plane of its own; video layers do, because
    /// mixing them with other content forces everything through the GPU
    pub fn prefer_separate_plane(&self) -> bool {
        self.layer_type == LayerType::Video
    }
}

#[cfg(test)]
mod tests {
    use super::{Composition, HwcLayer, LayerState, LayerType, OverlayLayer};
    use crate::buffer::{BufferUsage, NativeBufferHandler, NativeHandle, OverlayBuffer};
    use crate::utils::{DisplayRotation, Rect, Transform};
    use drm_fourcc::DrmFourcc;
    use std::ffi::c_void;
    use std::fs::File;
    use std::io;
    use std::os::fd::OwnedFd;

    #[derive(Debug)]
    struct FakeBuffer {
        format: DrmFourcc,
        usage: BufferUsage,
        video: bool,
        fb: u32,
    }

    impl OverlayBuffer for FakeBuffer {
        fn format(&self) -> DrmFourcc {
            self.format
        }
        fn usage(&self) -> BufferUsage {
            self.usage
        }
        fn is_video_buffer(&self) -> bool {
            self.video
        }
        fn fb(&self) -> u32 {
            self.fb
        }
    }

    /// Decodes the buffer properties from the handle bits: 0x1 video, 0x2
    /// cursor, 0x4 missing framebuffer.
    struct FakeBufferHandler;

    impl NativeBufferHandler for FakeBufferHandler {
        fn create_buffer(
            &self,
            _width: u32,
            _height: u32,
            _format: DrmFourcc,
            _usage: BufferUsage,
        ) -> io::Result<NativeHandle> {
            Ok(NativeHandle(0))
        }

        fn import_buffer(&self, handle: NativeHandle) -> io::Result<Box<dyn OverlayBuffer>> {
            let mut usage = BufferUsage::empty();
            if handle.0 & 0x2 != 0 {
                usage |= BufferUsage::CURSOR;
            }
            Ok(Box::new(FakeBuffer {
                format: DrmFourcc::Argb8888,
                usage,
                video: handle.0 & 0x1 != 0,
                fb: if handle.0 & 0x4 != 0 { 0 } else { 1 },
            }))
        }

        fn release_buffer(&self, _handle: NativeHandle) -> io::Result<()> {
            Ok(())
        }

        fn destroy_handle(&self, _handle: NativeHandle) -> io::Result<()> {
            Ok(())
        }

        fn copy_handle(&self, source: NativeHandle) -> io::Result<NativeHandle> {
            Ok(source)
        }

        fn map(
            &self,
            _handle: NativeHandle,
            _x: u32,
            _y: u32,
            _width: u32,
            _height: u32,
            _plane: usize,
        ) -> io::Result<*mut c_void> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        fn unmap(&self, _handle: NativeHandle, _map_data: *mut c_void) -> io::Result<()> {
            Ok(())
        }

        fn total_planes(&self, _format: DrmFourcc) -> usize {
            1
        }
    }

    fn hwc_layer(frame: Rect<i32>) -> HwcLayer {
        let mut layer = HwcLayer::new();
        layer.set_display_frame(frame);
        layer.set_source_crop(Rect::new(0.0, 0.0, frame.width() as f32, frame.height() as f32));
        layer.set_native_handle(NativeHandle(0));
        layer
    }

    fn build(layer: &mut HwcLayer, previous: Option<&OverlayLayer>) -> OverlayLayer {
        OverlayLayer::from_hwc_layer(
            layer,
            &FakeBufferHandler,
            previous,
            0,
            0,
            2160,
            DisplayRotation::None,
            false,
        )
    }

    #[test]
    fn fresh_layer_has_all_change_bits() {
        let mut hwc = hwc_layer(Rect::new(0, 0, 1920, 1080));
        let overlay = build(&mut hwc, None);
        assert!(overlay.state().contains(LayerState::DIMENSIONS_CHANGED));
        assert!(overlay.state().contains(LayerState::CONTENT_CHANGED));
        assert_eq!(overlay.layer_type(), LayerType::Normal);
        // damage of a scanout layer covers the frame
        assert_eq!(*overlay.surface_damage(), Rect::new(0, 0, 1920, 1080));
    }

    #[test]
    fn cursor_classification_from_usage() {
        let mut hwc = hwc_layer(Rect::new(0, 0, 64, 64));
        hwc.set_native_handle(NativeHandle(0x2));
        let overlay = build(&mut hwc, None);
        assert!(overlay.is_cursor_layer());
    }

    #[test]
    fn display_rotation_overwrites_transform() {
        let mut hwc = hwc_layer(Rect::new(0, 0, 1920, 1080));
        hwc.clear_update_state();
        let overlay = OverlayLayer::from_hwc_layer(
            &mut hwc,
            &FakeBufferHandler,
            None,
            0,
            0,
            2160,
            DisplayRotation::Rotate90,
            false,
        );
        assert_eq!(overlay.plane_transform(), Transform::ROTATE_90);
        assert_eq!(overlay.transform(), Transform::ROTATE_90);
    }

    #[test]
    fn unchanged_layer_inherits_gpu_rendering() {
        let mut hwc = hwc_layer(Rect::new(0, 0, 800, 600));
        let mut previous = build(&mut hwc, None);
        previous.set_layer_composition(Composition::Gpu);
        hwc.clear_update_state();

        let overlay = build(&mut hwc, Some(&previous));
        assert!(overlay.gpu_rendered());
        assert!(!overlay.state().contains(LayerState::DIMENSIONS_CHANGED));
        assert!(!overlay.state().contains(LayerState::CONTENT_CHANGED));
        assert!(!overlay.state().contains(LayerState::ATTRIBUTES_CHANGED));
    }

    #[test]
    fn alpha_after_opaque_forces_revalidation() {
        let mut hwc = hwc_layer(Rect::new(0, 0, 800, 600));
        let previous = build(&mut hwc, None);
        hwc.clear_update_state();
        hwc.set_alpha(0x80);

        let overlay = build(&mut hwc, Some(&previous));
        // diff aborted, every bit still set
        assert!(overlay.state().contains(LayerState::ATTRIBUTES_CHANGED));
        assert!(overlay.state().contains(LayerState::DIMENSIONS_CHANGED));
        assert!(!overlay.gpu_rendered());
    }

    #[test]
    fn damage_is_union_with_previous_frame() {
        let mut hwc = hwc_layer(Rect::new(0, 0, 800, 600));
        hwc.set_surface_damage(Rect::new(10, 10, 100, 100));
        let mut previous = build(&mut hwc, None);
        previous.set_layer_composition(Composition::Gpu);

        // rebuild the previous cycle so last_surface_damage reflects the
        // reported damage instead of the full frame
        hwc.clear_update_state();
        let mut previous = build(&mut hwc, Some(&previous));
        assert!(previous.gpu_rendered());
        previous.set_layer_composition(Composition::Gpu);

        hwc.clear_update_state();
        hwc.set_surface_damage(Rect::new(50, 40, 200, 120));
        let overlay = build(&mut hwc, Some(&previous));
        assert!(overlay.gpu_rendered());
        assert_eq!(*overlay.surface_damage(), Rect::new(10, 10, 200, 120));
        assert_eq!(*overlay.last_surface_damage(), Rect::new(50, 40, 200, 120));
    }

    #[test]
    fn constraint_clipping_translates_to_pipe_origin() {
        let mut hwc = hwc_layer(Rect::new(800, 0, 2400, 1080));
        hwc.set_display_constraints(960, 1920);
        let overlay = OverlayLayer::from_hwc_layer(
            &mut hwc,
            &FakeBufferHandler,
            None,
            0,
            0,
            1080,
            DisplayRotation::None,
            true,
        );
        // clipped to [960, 1920], then shifted so the pipe starts at zero
        assert_eq!(overlay.display_frame().left, 0);
        assert_eq!(overlay.display_frame().right, 0);
        assert_eq!(overlay.display_frame().bottom, 1080);
        assert!(overlay.display_frame_width() >= 0);
    }

    #[test]
    fn fence_released_exactly_once() {
        let mut hwc = hwc_layer(Rect::new(0, 0, 64, 64));
        let fence: OwnedFd = File::open("/dev/null").unwrap().into();
        hwc.set_acquire_fence(fence);

        let mut overlay = build(&mut hwc, None);
        assert!(overlay.acquire_fence().is_some());
        let released = overlay.release_acquire_fence();
        assert!(released.is_some());
        assert!(overlay.acquire_fence().is_none());
        assert!(overlay.release_acquire_fence().is_none());
        drop(overlay); // closes nothing further
    }

    #[test]
    fn solid_color_layer_has_no_buffer() {
        let mut hwc = HwcLayer::new();
        hwc.set_display_frame(Rect::new(0, 0, 100, 100));
        hwc.set_solid_color(0xff00ff00);
        let overlay = build(&mut hwc, None);
        assert!(overlay.is_solid_color());
        assert!(overlay.buffer().is_none());
    }
}
