use smallvec::SmallVec;

use crate::layer::OverlayLayer;
use crate::surface::SurfaceId;
use crate::utils::{Rect, Transform};

/// The composition plan for one frame, ordered bottom plane first
pub type DisplayPlaneStateList = Vec<DisplayPlaneState>;

/// What a plane scans out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSource {
    /// A frame layer, addressed by its position in the layer stack
    Layer(usize),
    /// The bound layer of a pooled off-screen target
    Surface(SurfaceId),
}

/// Who applies the display rotation for a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationType {
    /// The display hardware rotates during scan-out
    Display,
    /// The GPU rotates while compositing the off-screen target
    Gpu,
}

bitflags::bitflags! {
    /// Checks a plane still owes after the plan was produced.
    ///
    /// Set while planning, processed (and cleared) either by the tail of the
    /// full validation or by a later cheap re-validation pass.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ReValidation: u32 {
        /// The plane might demote from GPU composition back to scan-out
        const SCANOUT = 1 << 0;
        /// Plane scalar usage might change
        const UP_SCALAR = 1 << 1;
        /// The rotation split (display vs GPU) might change
        const ROTATION = 1 << 2;
        /// Display down-scaling might apply
        const DOWN_SCALING = 1 << 3;
    }
}

/// Internal disposition of a plane entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Scanout,
    Render,
}

/// One entry of the composition plan: a hardware plane, the layers it covers
/// and how they get there.
///
/// The plane and any off-screen target are referenced by index into the
/// manager's pools, never owned. The invariant maintained by the planner: an
/// entry with more than one source layer always carries an off-screen target
/// and is either GPU-composited or a video plane routed to the VPP.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayPlaneState {
    plane: usize,
    disposition: Disposition,
    source_layers: SmallVec<[usize; 4]>,
    display_frame: Rect<i32>,
    overlay: PlaneSource,
    surfaces: SmallVec<[SurfaceId; 3]>,
    video: bool,
    cursor: bool,
    use_plane_scalar: bool,
    rotation_type: RotationType,
    down_scaling_factor: u32,
    revalidation: ReValidation,
    surface_recycled: bool,
}

impl DisplayPlaneState {
    /// Creates a direct scan-out entry for a single layer
    pub fn new(plane: usize, layer: &OverlayLayer, display_transform: Transform) -> Self {
        let mut source_layers = SmallVec::new();
        source_layers.push(layer.z_order());
        let revalidation = if display_transform.is_empty() {
            ReValidation::empty()
        } else {
            ReValidation::ROTATION
        };
        DisplayPlaneState {
            plane,
            disposition: Disposition::Scanout,
            source_layers,
            display_frame: *layer.display_frame(),
            overlay: PlaneSource::Layer(layer.z_order()),
            surfaces: SmallVec::new(),
            video: false,
            cursor: layer.is_cursor_layer(),
            use_plane_scalar: false,
            rotation_type: RotationType::Display,
            down_scaling_factor: 1,
            revalidation,
            surface_recycled: false,
        }
    }

    /// Merges another layer into this entry, growing the display frame.
    ///
    /// The caller is responsible for giving the entry an off-screen target
    /// afterwards; two layers cannot share a plane directly.
    pub fn add_layer(&mut self, layer: &OverlayLayer) {
        self.source_layers.push(layer.z_order());
        self.display_frame.union_with(layer.display_frame());
        self.cursor = self.cursor && layer.is_cursor_layer();
    }

    /// Stack positions of the layers this plane covers, in z-order
    pub fn source_layers(&self) -> &[usize] {
        &self.source_layers
    }

    /// Union of the covered layers' display frames
    pub fn display_frame(&self) -> &Rect<i32> {
        &self.display_frame
    }

    /// Index of the hardware plane in the manager's plane list
    pub fn plane(&self) -> usize {
        self.plane
    }

    /// Moves the entry to a different hardware plane (plane squashing)
    pub fn set_plane(&mut self, plane: usize) {
        self.plane = plane;
    }

    /// What the plane scans out right now
    pub fn overlay(&self) -> PlaneSource {
        self.overlay
    }

    /// Overrides the scan-out source
    pub fn set_overlay(&mut self, overlay: PlaneSource) {
        self.overlay = overlay;
    }

    /// Binds an off-screen target; the newest target is the scan-out source
    pub fn set_off_screen_target(&mut self, surface: SurfaceId) {
        self.surfaces.insert(0, surface);
        self.overlay = PlaneSource::Surface(surface);
    }

    /// The current off-screen target, if any
    pub fn off_screen_target(&self) -> Option<SurfaceId> {
        self.surfaces.first().copied()
    }

    /// All surfaces bound to this entry, newest first
    pub fn surfaces(&self) -> &[SurfaceId] {
        &self.surfaces
    }

    /// Detaches all surfaces (they stay in the manager's pool)
    pub fn release_surfaces(&mut self) {
        self.surfaces.clear();
    }

    /// Routes this entry through GPU (or VPP) composition
    pub fn force_gpu_rendering(&mut self) {
        self.disposition = Disposition::Render;
    }

    /// Returns the entry to direct scan-out
    pub fn disable_gpu_rendering(&mut self) {
        self.disposition = Disposition::Scanout;
    }

    /// Whether the entry is a plain direct scan-out
    pub fn scanout(&self) -> bool {
        self.disposition == Disposition::Scanout
    }

    /// Whether the entry's content has to be composited off screen before
    /// scan-out
    pub fn needs_off_screen_composition(&self) -> bool {
        self.disposition == Disposition::Render || self.source_layers.len() > 1
    }

    /// Whether an off-screen target still has to be allocated
    pub fn needs_surface_allocation(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// Marks the entry as carrying video content
    pub fn set_video_plane(&mut self, video: bool) {
        self.video = video;
    }

    /// Whether the entry carries video content
    pub fn is_video_plane(&self) -> bool {
        self.video
    }

    /// Whether the entry covers only cursor layers
    pub fn is_cursor_plane(&self) -> bool {
        self.cursor
    }

    /// Toggles use of the plane's hardware scaler
    pub fn use_plane_scalar(&mut self, enable: bool) {
        self.use_plane_scalar = enable;
    }

    /// Whether the plane's hardware scaler is in use
    pub fn uses_plane_scalar(&self) -> bool {
        self.use_plane_scalar
    }

    /// Who applies the display rotation for this entry
    pub fn rotation_type(&self) -> RotationType {
        self.rotation_type
    }

    /// Changes the rotation split; the caller clears surfaces on change
    pub fn set_rotation_type(&mut self, rotation_type: RotationType) {
        self.rotation_type = rotation_type;
    }

    /// Display down-scaling factor, 1 when inactive
    pub fn down_scaling_factor(&self) -> u32 {
        self.down_scaling_factor
    }

    /// Sets the down-scaling factor; the caller clears surfaces on change
    pub fn set_down_scaling_factor(&mut self, factor: u32) {
        self.down_scaling_factor = factor;
    }

    /// Whether the plane scaler could upscale this entry: a single non-cursor
    /// layer whose display frame is larger than its source crop
    pub fn can_use_display_up_scaling(&self, layers: &[OverlayLayer]) -> bool {
        if self.source_layers.len() != 1 {
            return false;
        }
        let layer = &layers[self.source_layers[0]];
        if layer.is_cursor_layer() {
            return false;
        }
        let dw = layer.display_frame_width();
        let dh = layer.display_frame_height();
        let sw = layer.source_crop_width();
        let sh = layer.source_crop_height();
        (dw > sw && dh >= sh) || (dh > sh && dw >= sw)
    }

    /// Whether GPU down-scaling applies: a single layer strictly smaller on
    /// screen than its source crop
    pub fn can_use_gpu_down_scaling(&self, layers: &[OverlayLayer]) -> bool {
        if self.source_layers.len() != 1 {
            return false;
        }
        let layer = &layers[self.source_layers[0]];
        layer.display_frame_width() < layer.source_crop_width()
            && layer.display_frame_height() < layer.source_crop_height()
    }

    /// Pending re-validation checks
    pub fn revalidation(&self) -> ReValidation {
        self.revalidation
    }

    /// Arms the re-validation checks this entry is still worth running
    pub fn validate_revalidation(&mut self, display_rotated: bool) {
        if !self.needs_off_screen_composition() {
            return;
        }
        self.revalidation |= ReValidation::UP_SCALAR | ReValidation::DOWN_SCALING;
        if self.source_layers.len() == 1 && !self.video && !self.cursor {
            self.revalidation |= ReValidation::SCANOUT;
        }
        if display_rotated {
            self.revalidation |= ReValidation::ROTATION;
        }
    }

    /// Clears the given checks after they ran
    pub fn revalidation_done(&mut self, done: ReValidation) {
        self.revalidation.remove(done);
    }

    /// Whether the current off-screen target was recycled with intact content
    pub fn surface_recycled(&self) -> bool {
        self.surface_recycled
    }

    pub(crate) fn set_surface_recycled(&mut self, recycled: bool) {
        self.surface_recycled = recycled;
    }
}
