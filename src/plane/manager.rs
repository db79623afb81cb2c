use std::fmt;

use drm_fourcc::{DrmFourcc, DrmModifier};
use indexmap::IndexMap;
use tracing::{debug, instrument, trace, warn};

use crate::buffer::BufferUsage;
use crate::layer::{Composition, OverlayLayer};
use crate::surface::{ClearType, NativeSurface, SurfaceAllocator, SurfaceId};
use crate::utils::{analyse_overlap, Overlap, Transform};

use super::state::{
    DisplayPlaneState, DisplayPlaneStateList, PlaneSource, ReValidation, RotationType,
};
use super::{DisplayPlane, DisplayPlaneHandler, Error, PlaneCommit};

/// Outcome of [`DisplayPlaneManager::validate_layers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationResult {
    /// Whether any plane requires GPU (or VPP) rendering this frame
    pub render_layers: bool,
    /// Whether at least one test commit ran; `false` asks the host to retry
    /// with a full validation
    pub commit_checked: bool,
    /// Whether any plane still has pending re-validation checks
    pub re_validation_needed: bool,
}

/// Outcome of [`DisplayPlaneManager::re_validate_planes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReValidationResult {
    /// Whether any plane requires GPU (or VPP) rendering
    pub render_layers: bool,
    /// Whether the plan is stale and the host must run a full validation
    pub request_full_validation: bool,
}

/// One entry of the candidate commit under construction. Resolved into
/// [`PlaneCommit`] views only when the driver is actually asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CommitEntry {
    plane: usize,
    source: PlaneSource,
}

fn commit_entry(state: &DisplayPlaneState) -> CommitEntry {
    CommitEntry {
        plane: state.plane(),
        source: state.overlay(),
    }
}

/// Decides whether a candidate addition must keep a plane of its own.
///
/// Without a target layer this asks whether the existing entry itself is
/// untouchable (video or cursor). With a target it checks whether the target
/// and the entry's layers nest cleanly: if the union of their display frames
/// is larger than the largest participant, merging would composite
/// non-overlapping content and a separate plane is preferred.
fn force_separate_plane(
    layers: &[OverlayLayer],
    last_plane: &DisplayPlaneState,
    target_layer: Option<&OverlayLayer>,
) -> bool {
    let Some(target_layer) = target_layer else {
        return last_plane.is_video_plane() || last_plane.is_cursor_plane();
    };

    let mut total_width = target_layer.display_frame_width();
    let mut total_height = target_layer.display_frame_height();
    let mut target_display_frame = *target_layer.display_frame();
    target_display_frame.union_with(last_plane.display_frame());

    for &index in last_plane.source_layers() {
        let layer = &layers[index];
        total_width = total_width.max(layer.display_frame_width());
        total_height = total_height.max(layer.display_frame_height());
    }

    total_width != target_display_frame.width() || total_height != target_display_frame.height()
}

/// The plane-composition planner for one display.
///
/// Owns the hardware plane list and the pool of off-screen targets; produces
/// and re-validates composition plans. One instance per display, driven from
/// a single thread.
pub struct DisplayPlaneManager<H, A>
where
    H: DisplayPlaneHandler,
    A: SurfaceAllocator,
{
    handler: H,
    allocator: A,
    overlay_planes: Vec<Box<dyn DisplayPlane>>,
    cursor_plane: Option<usize>,
    total_overlays: usize,
    width: u32,
    height: u32,
    display_transform: Transform,
    surfaces: IndexMap<SurfaceId, A::Surface>,
    next_surface_id: u64,
    release_surfaces: bool,
}

impl<H, A> fmt::Debug for DisplayPlaneManager<H, A>
where
    H: DisplayPlaneHandler,
    A: SurfaceAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayPlaneManager")
            .field("overlay_planes", &self.overlay_planes)
            .field("cursor_plane", &self.cursor_plane)
            .field("total_overlays", &self.total_overlays)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("display_transform", &self.display_transform)
            .field("surfaces", &self.surfaces.len())
            .finish_non_exhaustive()
    }
}

impl<H, A> DisplayPlaneManager<H, A>
where
    H: DisplayPlaneHandler,
    A: SurfaceAllocator,
{
    /// Creates a manager without planes; call
    /// [`initialize`](DisplayPlaneManager::initialize) before planning.
    pub fn new(handler: H, allocator: A) -> Self {
        DisplayPlaneManager {
            handler,
            allocator,
            overlay_planes: Vec::new(),
            cursor_plane: None,
            total_overlays: 0,
            width: 0,
            height: 0,
            display_transform: Transform::empty(),
            surfaces: IndexMap::new(),
            next_surface_id: 0,
            release_surfaces: false,
        }
    }

    /// Discovers the hardware planes and reserves a dedicated cursor plane if
    /// the trailing plane is not universal
    pub fn initialize(&mut self, width: u32, height: u32) -> Result<(), Error> {
        self.width = width;
        self.height = height;
        self.overlay_planes = self
            .handler
            .populate_planes()
            .map_err(Error::PopulatePlanes)?;
        if self.overlay_planes.is_empty() {
            return Err(Error::NoPlanes);
        }
        self.resize_overlays();
        debug!(
            planes = self.overlay_planes.len(),
            cursor_reserved = self.cursor_plane.is_some(),
            "plane manager initialized"
        );
        Ok(())
    }

    fn resize_overlays(&mut self) {
        if self.overlay_planes.is_empty() {
            return;
        }
        self.total_overlays = self.overlay_planes.len();
        self.cursor_plane = None;
        if self.total_overlays > 1 {
            let last = self.overlay_planes.len() - 1;
            // A universal trailing plane is not restricted to cursor usage.
            if !self.overlay_planes[last].is_universal() {
                self.cursor_plane = Some(last);
                self.total_overlays -= 1;
            }
        }
    }

    /// Number of planes available for general content (the cursor reserve
    /// excluded)
    pub fn total_overlays(&self) -> usize {
        self.total_overlays
    }

    /// Whether the primary plane supports `format`
    pub fn check_plane_format(&self, format: DrmFourcc) -> bool {
        self.overlay_planes[0].is_supported_format(format)
    }

    /// Stages a disable for every plane the current plan does not claim
    pub fn reset_planes(&mut self) {
        for plane in self.overlay_planes.iter_mut() {
            if !plane.in_use() {
                plane.disable();
            }
        }
    }

    /// Drops every plane whose index is not listed in `reserved_planes` and
    /// re-derives the cursor reserve
    pub fn release_unreserved_planes(&mut self, reserved_planes: &[usize]) {
        let mut plane_index = 0;
        self.overlay_planes.retain(|_| {
            let keep = reserved_planes.contains(&plane_index);
            plane_index += 1;
            keep
        });
        self.resize_overlays();
    }

    /// Sets the global display rotation folded into every plan
    pub fn set_display_transform(&mut self, transform: Transform) {
        self.display_transform = transform;
    }

    /// Hints that surfaces were aged out and the next free scan is worthwhile
    pub fn released_surfaces(&mut self) {
        self.release_surfaces = true;
    }

    /// Drops every pooled surface, on-screen or not
    pub fn release_all_off_screen_targets(&mut self) {
        self.surfaces.clear();
    }

    /// Drops pooled surfaces the driver no longer scans out.
    ///
    /// Runs only when a release was hinted or `forced`; the driver still owns
    /// the on-screen ones.
    pub fn release_free_off_screen_targets(&mut self, forced: bool) {
        if !self.release_surfaces && !forced {
            return;
        }
        self.surfaces.retain(|_, surface| surface.is_on_screen());
        self.release_surfaces = false;
    }

    /// Builds the composition plan for this frame.
    ///
    /// `layers` is the full stack in z-order; every layer's
    /// [`z_order`](OverlayLayer::z_order) must match its position in the
    /// slice. `add_index == 0` runs a full validation, draining both the
    /// current and the previous plan into `mark_later`; a positive index
    /// appends the tail `layers[add_index..]` to the existing `composition`.
    /// With `disable_overlay` everything lands on a single GPU (or VPP)
    /// plane.
    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "trace", skip_all, fields(layers = layers.len(), add_index))]
    pub fn validate_layers(
        &mut self,
        layers: &mut [OverlayLayer],
        add_index: usize,
        disable_overlay: bool,
        composition: &mut DisplayPlaneStateList,
        previous_composition: &mut DisplayPlaneStateList,
        mark_later: &mut Vec<SurfaceId>,
    ) -> ValidationResult {
        if add_index == 0 {
            for plane in previous_composition.iter_mut() {
                self.mark_surfaces_for_recycling(plane, mark_later, true, true);
            }
            for plane in composition.iter_mut() {
                self.mark_surfaces_for_recycling(plane, mark_later, true, true);
            }
            composition.clear();
            debug!("performing full validation");
        }

        let mut commit_planes: Vec<CommitEntry> = composition.iter().map(commit_entry).collect();

        let video_layers = layers[add_index..]
            .iter()
            .filter(|layer| layer.is_video_layer())
            .count();

        // Forcing GPU composition for all layers on a single plane.
        if disable_overlay {
            if video_layers == 0 {
                trace!("forcing GPU for all layers");
                self.force_gpu_for_all_layers(
                    &mut commit_planes,
                    composition,
                    layers,
                    mark_later,
                    false,
                );
            } else {
                trace!("forcing VPP for all layers");
                self.force_vpp_for_all_layers(
                    &mut commit_planes,
                    composition,
                    layers,
                    add_index,
                    mark_later,
                    false,
                );
            }

            return ValidationResult {
                render_layers: true,
                commit_checked: true,
                re_validation_needed: false,
            };
        }

        // Mark the planes the plan does not already claim as free.
        for plane in self.overlay_planes.iter_mut().skip(composition.len()) {
            plane.set_in_use(false);
        }

        let mut avail_planes = self.overlay_planes.len().saturating_sub(composition.len());
        if !self.overlay_planes[self.overlay_planes.len() - 1].is_universal() {
            avail_planes = avail_planes.saturating_sub(1);
        }
        // Video cannot be split across more planes than we have left; the VPP
        // takes the whole frame instead. Cursor layers never go to the VPP.
        if video_layers >= avail_planes && video_layers > 0 {
            self.force_vpp_for_all_layers(
                &mut commit_planes,
                composition,
                layers,
                add_index,
                mark_later,
                false,
            );
            return ValidationResult {
                render_layers: true,
                commit_checked: true,
                re_validation_needed: false,
            };
        }

        let mut cursor_layers: Vec<usize> = Vec::new();
        let mut validate_final_layers = false;
        let mut test_commit_done = false;
        let mut previous_layer: Option<usize> = None;
        let mut layer_idx = add_index;
        let layer_end = layers.len();

        if layer_idx != layer_end {
            let plane_end = if self.cursor_plane.is_some() {
                self.overlay_planes.len() - 1
            } else {
                self.overlay_planes.len()
            };
            let mut plane_idx = composition.len();

            while plane_idx < plane_end {
                let plane = plane_idx;
                plane_idx += 1;

                if previous_layer.is_some() {
                    if let Some(last) = composition.last_mut() {
                        if last.needs_off_screen_composition() {
                            self.validate_for_display_scaling(last, &mut commit_planes, layers);
                        }
                    }
                }

                // All layers mapped already.
                if layer_idx == layer_end {
                    break;
                }

                while layer_idx < layer_end {
                    let idx = layer_idx;
                    layer_idx += 1;

                    // Cursor layers are handled separately at the end.
                    if layers[idx].is_cursor_layer() {
                        cursor_layers.push(idx);
                        continue;
                    }

                    let mut prefer_separate_plane = layers[idx].prefer_separate_plane();
                    if !prefer_separate_plane {
                        if let Some(previous) = previous_layer {
                            prefer_separate_plane = layers[previous].prefer_separate_plane();
                        }
                    }

                    previous_layer = Some(idx);

                    commit_planes.push(CommitEntry {
                        plane,
                        source: PlaneSource::Layer(idx),
                    });
                    let fall_back =
                        self.fallback_to_gpu(plane, PlaneSource::Layer(idx), &commit_planes, layers);
                    test_commit_done = true;
                    let mut force_separate = false;
                    if fall_back && !prefer_separate_plane && !composition.is_empty() {
                        if let Some(last) = composition.last() {
                            force_separate = force_separate_plane(layers, last, Some(&layers[idx]));
                        }
                    }

                    if !fall_back || prefer_separate_plane || force_separate {
                        if validate_final_layers {
                            validate_final_layers = fall_back;
                        }

                        let mut state =
                            DisplayPlaneState::new(plane, &layers[idx], self.display_transform);
                        trace!(
                            layer = layers[idx].z_order(),
                            plane,
                            fall_back,
                            force_separate,
                            "added layer for direct scanout"
                        );
                        self.overlay_planes[plane].set_in_use(true);
                        if layers[idx].is_video_layer() {
                            state.set_video_plane(true);
                        }
                        if fall_back {
                            if !validate_final_layers {
                                validate_final_layers = state.off_screen_target().is_none();
                            }
                            if let Some(entry) = commit_planes.last_mut() {
                                self.reset_plane_target(&mut state, entry);
                            }
                        }
                        composition.push(state);

                        break;
                    } else if composition.is_empty() {
                        let mut state =
                            DisplayPlaneState::new(plane, &layers[idx], self.display_transform);
                        trace!(
                            layer = layers[idx].z_order(),
                            plane,
                            "added first layer for off-screen composition"
                        );
                        self.overlay_planes[plane].set_in_use(true);
                        if let Some(entry) = commit_planes.last_mut() {
                            self.reset_plane_target(&mut state, entry);
                        }
                        validate_final_layers = true;
                        if !self.display_transform.is_empty()
                            && state.rotation_type() == RotationType::Display
                        {
                            // If the display transform is not supported,
                            // check whether GPU rotation for this plane is.
                            state.set_rotation_type(RotationType::Gpu);
                            if let Some(target) = state.off_screen_target() {
                                if self.fallback_to_gpu(
                                    plane,
                                    PlaneSource::Surface(target),
                                    &commit_planes,
                                    layers,
                                ) {
                                    self.refresh_surfaces(&mut state, ClearType::FullClear);
                                } else {
                                    validate_final_layers = false;
                                }
                            }
                        }
                        composition.push(state);

                        break;
                    } else {
                        commit_planes.pop();
                        trace!(
                            layer = layers[idx].z_order(),
                            planes = composition.len(),
                            "merging layer into last plane"
                        );
                        // The layer merged, so this plane was not consumed.
                        plane_idx -= 1;
                        if let Some(last) = composition.last_mut() {
                            last.add_layer(&layers[idx]);
                        }
                        while self.squash_planes_as_needed(
                            layers,
                            composition,
                            &mut commit_planes,
                            mark_later,
                            &mut validate_final_layers,
                        ) {
                            plane_idx -= 1;
                        }

                        if let Some(last) = composition.last_mut() {
                            if !validate_final_layers {
                                validate_final_layers = last.off_screen_target().is_none();
                            }
                            if let Some(entry) = commit_planes.last_mut() {
                                self.reset_plane_target(last, entry);
                            }
                        }
                        break;
                    }
                }

                // Out of general planes. If a video plane would have to host
                // foreign layers (or video layers are still unassigned),
                // collapse the non-video planes so video keeps its own plane.
                if plane_idx == plane_end && !composition.is_empty() {
                    let mut needsquash = composition[composition.len() - 1].is_video_plane()
                        && layer_idx != layer_end;
                    if !needsquash {
                        needsquash = layers[layer_idx..]
                            .iter()
                            .any(|layer| layer.is_video_layer());
                    }
                    if needsquash {
                        trace!("squashing non-video planes");
                        let squashed_planes = self.squash_non_video_planes(
                            layers,
                            composition,
                            &mut commit_planes,
                            mark_later,
                            &mut validate_final_layers,
                        );
                        plane_idx = plane_idx.saturating_sub(squashed_planes);
                    }
                }
            }

            if layer_idx != layer_end && !composition.is_empty() {
                let is_video = composition[composition.len() - 1].is_video_plane();
                previous_layer = None;
                // No planes left; pre-composite the remaining layers into the
                // last plane.
                for idx in layer_idx..layer_end {
                    if layers[idx].is_cursor_layer() {
                        cursor_layers.push(idx);
                        previous_layer = None;
                        continue;
                    }
                    previous_layer = Some(idx);
                    trace!(layer = layers[idx].z_order(), "appending layer to last plane");
                    if let Some(last) = composition.last_mut() {
                        last.add_layer(&layers[idx]);
                    }
                }

                let needs_off_screen = composition
                    .last()
                    .map(|last| last.needs_off_screen_composition())
                    .unwrap_or(false);
                if needs_off_screen {
                    while self.squash_planes_as_needed(
                        layers,
                        composition,
                        &mut commit_planes,
                        mark_later,
                        &mut validate_final_layers,
                    ) {}

                    // The media backend cannot composite multiple layers yet;
                    // drop the video target and force a fresh allocation so
                    // the plane goes through the GPU.
                    let mut force_buffer = false;
                    if let Some(squashed) = composition.last_mut() {
                        if is_video
                            && squashed.source_layers().len() > 1
                            && squashed.off_screen_target().is_some()
                        {
                            self.mark_surfaces_for_recycling(squashed, mark_later, true, true);
                            force_buffer = true;
                        }
                    }

                    if let Some(squashed) = composition.last_mut() {
                        if force_buffer || squashed.needs_surface_allocation() {
                            if let Some(entry) = commit_planes.last_mut() {
                                self.reset_plane_target(squashed, entry);
                            }
                            validate_final_layers = true;
                        }

                        if previous_layer.is_some() {
                            squashed.use_plane_scalar(false);
                        }

                        if let Some(entry) = commit_planes.last_mut() {
                            entry.source = squashed.overlay();
                        }
                    }
                }
            }
        }

        if !cursor_layers.is_empty() {
            self.validate_cursor_layer(
                layers,
                &mut commit_planes,
                &cursor_layers,
                mark_later,
                composition,
                &mut validate_final_layers,
                &mut test_commit_done,
                false,
            );

            if validate_final_layers
                && add_index > 0
                && composition.len() == self.overlay_planes.len() - 1
            {
                // A failing commit during incremental validation here can mean
                // other layer/plane combinations are stale as well. Make the
                // host check the final combination and request a full
                // validation if needed.
                return ValidationResult {
                    render_layers: true,
                    commit_checked: false,
                    re_validation_needed: false,
                };
            }
        }

        if composition.is_empty() {
            return ValidationResult {
                render_layers: true,
                commit_checked: true,
                re_validation_needed: false,
            };
        }

        if validate_final_layers {
            self.validate_final_layers(
                &mut commit_planes,
                composition,
                layers,
                mark_later,
                false,
                add_index,
            );
            test_commit_done = true;
        }

        let (render_layers, re_validation_needed) =
            self.finalize_validation(composition, &mut commit_planes, layers);
        ValidationResult {
            render_layers,
            commit_checked: test_commit_done,
            re_validation_needed,
        }
    }

    /// Index of the last plan entry that is not the reserved cursor plane
    fn last_used_overlay(&self, composition: &DisplayPlaneStateList) -> Option<usize> {
        for index in (0..composition.len()).rev() {
            if self.cursor_plane == Some(composition[index].plane()) {
                continue;
            }
            return Some(index);
        }
        None
    }

    fn prepare_plane_for_cursor(
        &mut self,
        plane: &mut DisplayPlaneState,
        mark_later: &mut Vec<SurfaceId>,
        validate_final_layers: &mut bool,
        reset_buffer: bool,
        recycle_resources: bool,
    ) {
        let mut surface = None;
        if reset_buffer {
            self.mark_surfaces_for_recycling(plane, mark_later, recycle_resources, true);
        } else {
            surface = plane.off_screen_target();
        }

        if surface.is_none() {
            self.set_off_screen_plane_target(plane);
            *validate_final_layers = true;
        }
    }

    /// Assigns cursor layers, preferring the reserved cursor plane, falling
    /// back to general planes and finally to GPU composition on the last used
    /// plane.
    #[allow(clippy::too_many_arguments)]
    fn validate_cursor_layer(
        &mut self,
        layers: &mut [OverlayLayer],
        commit_planes: &mut Vec<CommitEntry>,
        cursor_layers: &[usize],
        mark_later: &mut Vec<SurfaceId>,
        composition: &mut DisplayPlaneStateList,
        validate_final_layers: &mut bool,
        test_commit_done: &mut bool,
        recycle_resources: bool,
    ) {
        if cursor_layers.is_empty() {
            return;
        }

        let mut last_plane = self.last_used_overlay(composition);
        let mut is_video = last_plane
            .map(|index| composition[index].is_video_plane())
            .unwrap_or(false);

        let total_size = cursor_layers.len();
        let mut cursor_index = 0;
        let plane_count = self.overlay_planes.len();
        let plane_begin = if total_size > 1 || self.cursor_plane.is_none() {
            composition.len()
        } else {
            plane_count - 1
        };

        for plane in plane_begin..plane_count {
            if cursor_index == total_size {
                break;
            }

            if self.overlay_planes[plane].in_use() {
                warn!(plane, "plane for cursor is already in use");
            }

            let cursor = cursor_layers[cursor_index];
            commit_planes.push(CommitEntry {
                plane,
                source: PlaneSource::Layer(cursor),
            });
            let fall_back =
                self.fallback_to_gpu(plane, PlaneSource::Layer(cursor), commit_planes, layers);
            *test_commit_done = true;

            // The cursor cannot be scanned out directly; composite it into
            // the last used plane instead.
            if fall_back && !is_video && last_plane.is_some() {
                commit_planes.pop();
                layers[cursor].set_layer_composition(Composition::Gpu);
                trace!(layer = layers[cursor].z_order(), "merging cursor into last plane");
                if let Some(index) = last_plane {
                    composition[index].add_layer(&layers[cursor]);
                }
                while self.squash_planes_as_needed(
                    layers,
                    composition,
                    commit_planes,
                    mark_later,
                    validate_final_layers,
                ) {}

                last_plane = self.last_used_overlay(composition);
                let Some(index) = last_plane else {
                    break;
                };
                let reset_overlay = composition[index].off_screen_target().is_none();
                let reset_buffer = composition[index].is_video_plane();
                self.prepare_plane_for_cursor(
                    &mut composition[index],
                    mark_later,
                    validate_final_layers,
                    reset_buffer,
                    recycle_resources,
                );

                if reset_overlay {
                    // The plane's scan-out layer changed, rebuild the
                    // candidate commit.
                    *commit_planes = composition.iter().map(commit_entry).collect();
                }

                composition[index].use_plane_scalar(false);
            } else {
                let mut state =
                    DisplayPlaneState::new(plane, &layers[cursor], self.display_transform);
                trace!(
                    layer = layers[cursor].z_order(),
                    plane,
                    fall_back,
                    "assigned cursor layer to its own plane"
                );
                self.overlay_planes[plane].set_in_use(true);
                if fall_back {
                    self.set_off_screen_plane_target(&mut state);
                    layers[cursor].set_layer_composition(Composition::Gpu);
                    *validate_final_layers = true;
                } else {
                    layers[cursor].set_layer_composition(Composition::Display);
                    *validate_final_layers = false;
                }
                composition.push(state);

                last_plane = self.last_used_overlay(composition);
                if let Some(index) = last_plane {
                    is_video = composition[index].is_video_plane();
                }
            }

            cursor_index += 1;
        }

        // No planes left; pre-composite the remaining cursor layers into the
        // last used plane.
        let mut last_layer: Option<usize> = None;
        if last_plane.is_none() && cursor_index < total_size {
            last_plane = self.last_used_overlay(composition);
        }

        let mut index = cursor_index;
        while let Some(plane_index) = last_plane {
            if index == total_size {
                break;
            }
            let cursor = cursor_layers[index];
            index += 1;
            trace!(layer = layers[cursor].z_order(), "appending cursor to last plane");
            composition[plane_index].add_layer(&layers[cursor]);
            layers[cursor].set_layer_composition(Composition::Gpu);
            last_layer = Some(cursor);
            while self.squash_planes_as_needed(
                layers,
                composition,
                commit_planes,
                mark_later,
                validate_final_layers,
            ) {}

            last_plane = self.last_used_overlay(composition);
        }

        if last_layer.is_some() {
            if let Some(plane_index) = last_plane {
                let reset_buffer = composition[plane_index].is_video_plane();
                self.prepare_plane_for_cursor(
                    &mut composition[plane_index],
                    mark_later,
                    validate_final_layers,
                    reset_buffer,
                    recycle_resources,
                );
                composition[plane_index].use_plane_scalar(false);
            }
        }
    }

    /// Re-checks the rotation split of an off-screen plane after the display
    /// transform applied
    fn validate_for_display_transform(
        &mut self,
        plane_state: &mut DisplayPlaneState,
        commit_planes: &[CommitEntry],
        layers: &mut [OverlayLayer],
    ) {
        if self.display_transform.is_empty() {
            return;
        }
        // Nothing to check while the rotation rides along the composition
        // pass.
        let original_rotation = plane_state.rotation_type();
        if plane_state.revalidation().contains(ReValidation::ROTATION) {
            plane_state.set_rotation_type(RotationType::Display);
            if let Some(target) = plane_state.off_screen_target() {
                if self.fallback_to_gpu(
                    plane_state.plane(),
                    PlaneSource::Surface(target),
                    commit_planes,
                    layers,
                ) {
                    plane_state.set_rotation_type(RotationType::Gpu);
                }
            }

            plane_state.revalidation_done(ReValidation::ROTATION);
        }

        if original_rotation != plane_state.rotation_type() {
            self.refresh_surfaces(plane_state, ClearType::FullClear);
        }
    }

    /// Probes display down-scaling with a factor of four, reverting when the
    /// driver rejects it
    fn validate_for_down_scaling(
        &mut self,
        plane_state: &mut DisplayPlaneState,
        commit_planes: &[CommitEntry],
        layers: &mut [OverlayLayer],
    ) {
        let original_factor = plane_state.down_scaling_factor();
        if plane_state
            .revalidation()
            .contains(ReValidation::DOWN_SCALING)
        {
            plane_state.set_down_scaling_factor(1);
            if !plane_state.uses_plane_scalar() && plane_state.can_use_gpu_down_scaling(layers) {
                plane_state.set_down_scaling_factor(4);
                if !self.run_test_commit(commit_planes, layers) {
                    plane_state.set_down_scaling_factor(1);
                }
            }

            plane_state.revalidation_done(ReValidation::DOWN_SCALING);
        }

        if original_factor != plane_state.down_scaling_factor() {
            self.refresh_surfaces(plane_state, ClearType::FullClear);
        }
    }

    /// Toggles the plane scaler for an off-screen plane and verifies the
    /// result against the driver
    fn validate_for_display_scaling(
        &mut self,
        plane_state: &mut DisplayPlaneState,
        commit_planes: &mut Vec<CommitEntry>,
        layers: &mut [OverlayLayer],
    ) {
        plane_state.validate_revalidation(!self.display_transform.is_empty());
        if !plane_state.revalidation().contains(ReValidation::UP_SCALAR) {
            return;
        }

        plane_state.revalidation_done(ReValidation::UP_SCALAR);

        let old_state = plane_state.uses_plane_scalar();
        if old_state {
            plane_state.use_plane_scalar(false);
        }

        if !plane_state.can_use_display_up_scaling(layers) {
            // If we used the plane scaler before, the surfaces are stale.
            if old_state {
                self.refresh_surfaces(plane_state, ClearType::FullClear);
            }

            return;
        }

        // TODO: scalers are limited in hardware; determine the scaling ratio
        // at which the plane scaler actually beats the GPU.

        // Display frame and source rect differ, try to take advantage of the
        // scaler attached to this plane.
        if plane_state.is_video_plane() {
            plane_state.use_plane_scalar(false);
        } else {
            plane_state.use_plane_scalar(true);
        }

        if let Some(entry) = commit_planes.last_mut() {
            entry.source = plane_state.overlay();
        }

        let fall_back = match plane_state.off_screen_target() {
            Some(target) => self.fallback_to_gpu(
                plane_state.plane(),
                PlaneSource::Surface(target),
                commit_planes,
                layers,
            ),
            None => true,
        };
        if fall_back {
            plane_state.use_plane_scalar(false);
        }

        if old_state != plane_state.uses_plane_scalar() {
            self.refresh_surfaces(plane_state, ClearType::FullClear);
        }
    }

    /// Ensures the plane has an off-screen target and points its commit entry
    /// at the current scan-out source
    fn reset_plane_target(&mut self, plane_state: &mut DisplayPlaneState, entry: &mut CommitEntry) {
        if plane_state.needs_surface_allocation() {
            self.set_off_screen_plane_target(plane_state);
        }

        entry.source = plane_state.overlay();
    }

    fn set_off_screen_plane_target(&mut self, plane_state: &mut DisplayPlaneState) {
        if plane_state.needs_surface_allocation() {
            self.ensure_off_screen_target(plane_state);
        }

        // Also covers the case of a single layer composited by the GPU.
        plane_state.force_gpu_rendering();
    }

    /// Binds an off-screen target to the plane, recycling an aged-out pool
    /// surface when format and modifier match
    #[profiling::function]
    fn ensure_off_screen_target(&mut self, plane_state: &mut DisplayPlaneState) {
        let dest_x = plane_state.display_frame().left;
        let dest_w = plane_state.display_frame().right - dest_x;

        // Media formats only apply when the VPP composites exactly one layer.
        let video_separate =
            plane_state.is_video_plane() && plane_state.source_layers().len() == 1;
        let mut usage = BufferUsage::empty();
        let preferred_format = if video_separate && dest_w % 2 == 0 && dest_x % 2 == 0 {
            self.overlay_planes[plane_state.plane()].preferred_video_format()
        } else {
            self.overlay_planes[plane_state.plane()].preferred_format()
        };

        let mut preferred_modifier =
            self.overlay_planes[plane_state.plane()].preferred_format_modifier();
        if plane_state.is_video_plane() {
            preferred_modifier = DrmModifier::Linear;
        }

        let mut surface_id = None;
        for (id, surface) in self.surfaces.iter() {
            if surface.age() != -1 {
                continue;
            }
            let Some(buffer) = surface.layer().buffer() else {
                continue;
            };
            if buffer.format() == preferred_format && surface.modifier() == preferred_modifier {
                surface_id = Some(*id);
                break;
            }
        }

        let id = match surface_id {
            Some(id) => {
                trace!(?id, "recycled off-screen target");
                plane_state.set_surface_recycled(true);
                id
            }
            None => {
                let mut surface = if video_separate {
                    usage = BufferUsage::VIDEO;
                    self.allocator.create_video_surface(self.width, self.height)
                } else {
                    self.allocator.create_3d_surface(self.width, self.height)
                };

                let modifier_succeeded = surface.init(preferred_format, usage, preferred_modifier);
                if video_separate {
                    surface.layer_mut().set_video_layer(true);
                }

                if modifier_succeeded {
                    self.overlay_planes[plane_state.plane()].preferred_format_modifier_validated();
                } else {
                    self.overlay_planes[plane_state.plane()].black_list_preferred_format_modifier();
                }

                let id = SurfaceId(self.next_surface_id);
                self.next_surface_id += 1;
                trace!(?id, format = ?preferred_format, "allocated off-screen target");
                self.surfaces.insert(id, surface);
                id
            }
        };

        let frame = *plane_state.display_frame();
        self.surfaces[&id].set_plane_target(frame);
        plane_state.set_off_screen_target(id);
    }

    /// Makes sure every off-screen entry has a target and asks the driver
    /// about the final combination; on rejection the whole frame falls back
    /// to a single GPU (or VPP) plane
    fn validate_final_layers(
        &mut self,
        commit_planes: &mut Vec<CommitEntry>,
        composition: &mut DisplayPlaneStateList,
        layers: &mut [OverlayLayer],
        mark_later: &mut Vec<SurfaceId>,
        recycle_resources: bool,
        add_index: usize,
    ) {
        let mut has_video = false;
        for plane in composition.iter_mut() {
            if plane.needs_off_screen_composition() && plane.off_screen_target().is_none() {
                self.ensure_off_screen_target(plane);
            }
            if plane.is_video_plane() {
                has_video = true;
            }
        }

        if !self.run_test_commit(commit_planes, layers) {
            trace!("final test commit failed, falling back to single plane");
            if !has_video {
                self.force_gpu_for_all_layers(
                    commit_planes,
                    composition,
                    layers,
                    mark_later,
                    recycle_resources,
                );
            } else {
                self.force_vpp_for_all_layers(
                    commit_planes,
                    composition,
                    layers,
                    add_index,
                    mark_later,
                    false,
                );
            }
        }
    }

    /// Decides whether `layer` must be composited instead of scanned out on
    /// `plane`. The order matters: the cheap local checks run before the
    /// test-commit round-trip to the kernel.
    #[profiling::function]
    fn fallback_to_gpu(
        &mut self,
        plane: usize,
        source: PlaneSource,
        commit_planes: &[CommitEntry],
        layers: &mut [OverlayLayer],
    ) -> bool {
        let (solid, video) = {
            let layer = self.resolve_source(source, layers);
            (layer.is_solid_color(), layer.is_video_layer())
        };
        // Solid colours have no buffer to scan out.
        if solid {
            return true;
        }

        // For video we always want display composition to stay an option.
        let supported = if video {
            Composition::All
        } else {
            Composition::Gpu
        };
        self.source_layer_mut(source, layers)
            .set_supported_composition(supported);

        let valid = {
            let layer = self.resolve_source(source, layers);
            self.overlay_planes[plane].validate_layer(layer)
        };
        if !valid {
            return true;
        }

        let has_fb = {
            let layer = self.resolve_source(source, layers);
            layer.buffer().map(|buffer| buffer.fb() != 0).unwrap_or(false)
        };
        if !has_fb {
            return true;
        }

        if !self.run_test_commit(commit_planes, layers) {
            return true;
        }

        self.source_layer_mut(source, layers)
            .set_supported_composition(Composition::All);
        false
    }

    /// Collapses every pair of adjacent non-video planes, walking from the
    /// top. Returns how many planes were freed.
    fn squash_non_video_planes(
        &mut self,
        layers: &[OverlayLayer],
        composition: &mut DisplayPlaneStateList,
        commit_planes: &mut Vec<CommitEntry>,
        mark_later: &mut Vec<SurfaceId>,
        validate_final_layers: &mut bool,
    ) -> usize {
        if composition.is_empty() {
            return 0;
        }

        let mut composition_index = composition.len() - 1;
        let mut squashed_count = 0;

        while composition_index > 0 {
            let upper_video = composition[composition_index].is_video_plane();
            let lower_video = composition[composition_index - 1].is_video_plane();

            if !upper_video && !lower_video {
                trace!(index = composition_index, "squashing non-video planes");
                {
                    let (head, tail) = composition.split_at_mut(composition_index);
                    let scanout_plane = &mut head[composition_index - 1];
                    for &index in tail[0].source_layers() {
                        scanout_plane.add_layer(&layers[index]);
                    }
                }
                self.refresh_surfaces(&mut composition[composition_index - 1], ClearType::FullClear);
                let freed_plane = composition[composition_index].plane();
                self.overlay_planes[freed_plane].set_in_use(false);
                self.mark_surfaces_for_recycling(
                    &mut composition[composition_index],
                    mark_later,
                    true,
                    true,
                );
                // Shift the planes above down one slot so the plane order
                // stays contiguous.
                for top in ((composition_index + 1)..composition.len()).rev() {
                    let plane = composition[top - 1].plane();
                    composition[top].set_plane(plane);
                }
                composition.remove(composition_index);
                squashed_count += 1;
                if composition[composition_index - 1].needs_surface_allocation() {
                    let (head, _) = composition.split_at_mut(composition_index);
                    self.set_off_screen_plane_target(&mut head[composition_index - 1]);
                    *validate_final_layers = true;
                }
            }
            composition_index -= 1;
        }

        if !commit_planes.is_empty() && squashed_count > 0 {
            // The planes' scan-out layers changed, rebuild the candidate
            // commit.
            *commit_planes = composition.iter().map(commit_entry).collect();
        }

        squashed_count
    }

    /// Merges the trailing plan entry into its predecessor when their frames
    /// overlap and nothing forces them apart. Returns whether a squash
    /// happened; every squash frees one plane, so callers loop.
    fn squash_planes_as_needed(
        &mut self,
        layers: &[OverlayLayer],
        composition: &mut DisplayPlaneStateList,
        commit_planes: &mut Vec<CommitEntry>,
        mark_later: &mut Vec<SurfaceId>,
        validate_final_layers: &mut bool,
    ) -> bool {
        if composition.len() < 2 {
            return false;
        }

        let scanout_index = composition.len() - 2;
        let mergeable = {
            let scanout_plane = &composition[scanout_index];
            let last_plane = &composition[composition.len() - 1];
            !scanout_plane.is_cursor_plane()
                && !scanout_plane.is_video_plane()
                && analyse_overlap(scanout_plane.display_frame(), last_plane.display_frame())
                    != Overlap::Outside
                && !force_separate_plane(layers, last_plane, None)
        };
        if !mergeable {
            return false;
        }

        trace!("squashing trailing planes");
        let mut last_plane = match composition.pop() {
            Some(plane) => plane,
            None => return false,
        };
        {
            let scanout_plane = &mut composition[scanout_index];
            for &index in last_plane.source_layers() {
                scanout_plane.add_layer(&layers[index]);
            }
        }
        self.refresh_surfaces(&mut composition[scanout_index], ClearType::FullClear);
        self.overlay_planes[last_plane.plane()].set_in_use(false);
        self.mark_surfaces_for_recycling(&mut last_plane, mark_later, true, true);

        if composition[scanout_index].needs_surface_allocation() {
            self.set_off_screen_plane_target(&mut composition[scanout_index]);
            *validate_final_layers = true;
        }

        if !commit_planes.is_empty() {
            // The squashed plane's scan-out layer changed, rebuild the
            // candidate commit.
            *commit_planes = composition.iter().map(commit_entry).collect();
        }

        true
    }

    /// Single-plane VPP fallback: everything from `add_index` on lands on one
    /// video plane
    fn force_vpp_for_all_layers(
        &mut self,
        commit_planes: &mut Vec<CommitEntry>,
        composition: &mut DisplayPlaneStateList,
        layers: &mut [OverlayLayer],
        add_index: usize,
        mark_later: &mut Vec<SurfaceId>,
        recycle_resources: bool,
    ) {
        let mut layer_begin = add_index;
        // All planes are assigned already; reset them into one VPP plane.
        if composition.len() >= self.overlay_planes.len() {
            layer_begin = 0;
            for plane in composition.iter_mut() {
                self.mark_surfaces_for_recycling(plane, mark_later, recycle_resources, true);
            }
            composition.clear();
            commit_planes.clear();
            for plane in self.overlay_planes.iter_mut() {
                plane.set_in_use(false);
            }
        }

        let plane_index = composition.len();
        let mut state =
            DisplayPlaneState::new(plane_index, &layers[layer_begin], self.display_transform);
        state.force_gpu_rendering();
        trace!(layer = layers[layer_begin].z_order(), "added layer for VPP");

        for idx in (layer_begin + 1)..layers.len() {
            trace!(layer = layers[idx].z_order(), "added layer for VPP");
            state.add_layer(&layers[idx]);
            layers[idx].set_layer_composition(Composition::Gpu);
        }
        state.set_video_plane(true);
        self.ensure_off_screen_target(&mut state);
        self.overlay_planes[plane_index].set_in_use(true);

        commit_planes.push(commit_entry(&state));
        // Any display transform to apply?
        self.validate_for_display_transform(&mut state, commit_planes, layers);
        // Any change to scaler usage?
        self.validate_for_display_scaling(&mut state, commit_planes, layers);
        // Down-scaling?
        self.validate_for_down_scaling(&mut state, commit_planes, layers);
        // The scan-out question is settled for this frame.
        state.revalidation_done(ReValidation::SCANOUT);
        composition.push(state);
    }

    /// Single-plane GPU fallback: the whole stack is composited onto the
    /// primary plane
    fn force_gpu_for_all_layers(
        &mut self,
        commit_planes: &mut Vec<CommitEntry>,
        composition: &mut DisplayPlaneStateList,
        layers: &mut [OverlayLayer],
        mark_later: &mut Vec<SurfaceId>,
        recycle_resources: bool,
    ) {
        for plane in self.overlay_planes.iter_mut() {
            plane.set_in_use(false);
        }

        for plane in composition.iter_mut() {
            self.mark_surfaces_for_recycling(plane, mark_later, recycle_resources, true);
        }

        composition.clear();
        commit_planes.clear();

        let mut state = DisplayPlaneState::new(0, &layers[0], self.display_transform);
        state.force_gpu_rendering();
        trace!(layer = layers[0].z_order(), "added layer for GPU composition");

        for (idx, layer) in layers.iter_mut().enumerate().skip(1) {
            trace!(layer = idx, "added layer for GPU composition");
            state.add_layer(layer);
            layer.set_layer_composition(Composition::Gpu);
        }

        self.ensure_off_screen_target(&mut state);
        self.overlay_planes[0].set_in_use(true);
        commit_planes.push(commit_entry(&state));
        // Any display transform to apply?
        self.validate_for_display_transform(&mut state, commit_planes, layers);
        // Any change to scaler usage?
        self.validate_for_display_scaling(&mut state, commit_planes, layers);
        // Down-scaling?
        self.validate_for_down_scaling(&mut state, commit_planes, layers);
        // The scan-out question is settled for this frame.
        state.revalidation_done(ReValidation::SCANOUT);
        composition.push(state);
    }

    /// Ages out a plane's surfaces, deferring the ones the driver still scans
    /// out into `mark_later` when `recycle_resources` is set
    pub fn mark_surfaces_for_recycling(
        &mut self,
        plane: &mut DisplayPlaneState,
        mark_later: &mut Vec<SurfaceId>,
        recycle_resources: bool,
        reset_plane_surfaces: bool,
    ) {
        if plane.surfaces().is_empty() {
            return;
        }

        self.release_surfaces = true;
        for index in 0..plane.surfaces().len() {
            let id = plane.surfaces()[index];
            let Some(surface) = self.surfaces.get_mut(&id) else {
                continue;
            };
            // Never age the on-screen surface or one in flight; the host
            // re-ages everything in `mark_later` after presentation.
            if recycle_resources && surface.age() >= 0 && surface.is_on_screen() {
                mark_later.push(id);
            } else {
                surface.set_age(-1);
            }
        }

        if reset_plane_surfaces {
            plane.release_surfaces();
        }
    }

    /// Cheaply re-checks an existing plan.
    ///
    /// With `re_validate_commit` the current combination is first submitted
    /// as a test commit; failure asks the host for a full validation. With
    /// `needs_revalidation_checks` each off-screen plane's pending
    /// re-validation bits are processed: scan-out demotion, scaler usage,
    /// rotation split and down-scaling.
    #[instrument(level = "trace", skip_all, fields(needs_revalidation_checks, re_validate_commit))]
    pub fn re_validate_planes(
        &mut self,
        composition: &mut DisplayPlaneStateList,
        layers: &mut [OverlayLayer],
        mark_later: &mut Vec<SurfaceId>,
        needs_revalidation_checks: bool,
        re_validate_commit: bool,
    ) -> ReValidationResult {
        let mut render = false;
        let mut commit_planes: Vec<CommitEntry> = Vec::with_capacity(composition.len());
        for state in composition.iter() {
            commit_planes.push(commit_entry(state));
            if !state.scanout() {
                render = true;
            }
        }

        if re_validate_commit && !self.run_test_commit(&commit_planes, layers) {
            trace!("re-validation test commit failed, requesting full validation");
            return ReValidationResult {
                render_layers: render,
                request_full_validation: true,
            };
        }

        if !needs_revalidation_checks {
            return ReValidationResult {
                render_layers: render,
                request_full_validation: false,
            };
        }

        let mut reset_composition_region = false;
        let mut index = 0;

        'planes: for ci in 0..composition.len() {
            let state = &mut composition[ci];
            if !state.needs_off_screen_composition() {
                index += 1;
                reset_composition_region = false;
                continue;
            }

            if reset_composition_region {
                self.refresh_surfaces(state, ClearType::FullClear);
            }

            reset_composition_region = false;
            let revalidation_type = state.revalidation();

            if revalidation_type.is_empty() {
                render = true;
                index += 1;
                continue;
            }

            let mut validation_done = ReValidation::SCANOUT;
            if revalidation_type.contains(ReValidation::SCANOUT) {
                let source_layer = state.source_layers()[0];
                let uses_scalar = state.uses_plane_scalar();
                // Remember the current source so a failing commit can restore
                // it.
                let current_overlay = state.overlay();
                state.set_overlay(PlaneSource::Layer(source_layer));
                state.disable_gpu_rendering();
                if uses_scalar {
                    state.use_plane_scalar(false);
                }

                layers[source_layer].set_layer_composition(Composition::Display);
                commit_planes[index].source = state.overlay();

                let plane_index = state.plane();
                if self.fallback_to_gpu(
                    plane_index,
                    PlaneSource::Layer(source_layer),
                    &commit_planes,
                    layers,
                ) {
                    // Demotion failed, back to the old state.
                    state.force_gpu_rendering();
                    layers[source_layer].set_layer_composition(Composition::Gpu);
                    state.set_overlay(current_overlay);
                    commit_planes[index].source = current_overlay;
                    if uses_scalar {
                        state.use_plane_scalar(true);
                    }
                } else {
                    trace!("re-validation: demoting plane to direct scan-out");
                    self.mark_surfaces_for_recycling(state, mark_later, true, true);
                    state.set_overlay(PlaneSource::Layer(source_layer));
                    reset_composition_region = true;
                }
            }

            render = true;
            index += 1;

            if revalidation_type.contains(ReValidation::UP_SCALAR) {
                self.validate_for_display_scaling(state, &mut commit_planes, layers);
                validation_done |= ReValidation::UP_SCALAR;
            }

            if revalidation_type.contains(ReValidation::ROTATION) {
                validation_done |= ReValidation::ROTATION;
                let old_type = state.rotation_type();
                if old_type == RotationType::Gpu {
                    state.set_rotation_type(RotationType::Display);
                } else if re_validate_commit {
                    // The full commit check above already covered the
                    // unchanged state; skip another test commit.
                    state.revalidation_done(validation_done);
                    continue 'planes;
                }

                // Can the display plane rotate this?
                self.ensure_off_screen_target(state);
                let fall_back = match state.off_screen_target() {
                    Some(target) => self.fallback_to_gpu(
                        state.plane(),
                        PlaneSource::Surface(target),
                        &commit_planes,
                        layers,
                    ),
                    None => true,
                };
                let new_type = if fall_back {
                    RotationType::Gpu
                } else {
                    RotationType::Display
                };
                state.set_rotation_type(new_type);
                if old_type != new_type {
                    // The rotation split changed, stale surfaces.
                    self.refresh_surfaces(state, ClearType::FullClear);
                }
            }

            if revalidation_type.contains(ReValidation::DOWN_SCALING) {
                validation_done |= ReValidation::DOWN_SCALING;
                // Make sure we are not also handling up-scaling.
                if state.uses_plane_scalar() {
                    warn!("up-scaling active while validating down-scaling");
                    if state.down_scaling_factor() > 1 {
                        state.set_down_scaling_factor(1);
                        self.refresh_surfaces(state, ClearType::FullClear);
                    }
                } else {
                    self.validate_for_down_scaling(state, &commit_planes, layers);
                }
            }

            state.revalidation_done(validation_done);
        }

        ReValidationResult {
            render_layers: render,
            request_full_validation: false,
        }
    }

    /// Tail of the full validation: refresh surfaces, settle transform and
    /// down-scaling, and report what is still owed
    fn finalize_validation(
        &mut self,
        composition: &mut DisplayPlaneStateList,
        commit_planes: &mut Vec<CommitEntry>,
        layers: &mut [OverlayLayer],
    ) -> (bool, bool) {
        let mut re_validation = false;
        let mut needs_gpu = false;
        for plane in composition.iter_mut() {
            if plane.needs_off_screen_composition() {
                self.refresh_surfaces(plane, ClearType::FullClear);
                plane.validate_revalidation(!self.display_transform.is_empty());
                // Any display transform to apply?
                self.validate_for_display_transform(plane, commit_planes, layers);
                // Down-scaling?
                self.validate_for_down_scaling(plane, commit_planes, layers);

                if !needs_gpu {
                    needs_gpu = !plane.surface_recycled();
                }

                if !plane.revalidation().is_empty() {
                    re_validation = true;
                }
            }
        }

        (needs_gpu, re_validation)
    }

    /// Marks a plane's surfaces for repaint
    fn refresh_surfaces(&mut self, plane: &mut DisplayPlaneState, clear: ClearType) {
        let frame = *plane.display_frame();
        for index in 0..plane.surfaces().len() {
            let id = plane.surfaces()[index];
            if let Some(surface) = self.surfaces.get_mut(&id) {
                surface.set_clear_surface(clear);
                surface.set_plane_target(frame);
            }
        }
        if clear == ClearType::FullClear {
            plane.set_surface_recycled(false);
        }
    }

    fn resolve_source<'a>(
        &'a self,
        source: PlaneSource,
        layers: &'a [OverlayLayer],
    ) -> &'a OverlayLayer {
        match source {
            PlaneSource::Layer(index) => &layers[index],
            PlaneSource::Surface(id) => self.surfaces[&id].layer(),
        }
    }

    fn source_layer_mut<'a>(
        &'a mut self,
        source: PlaneSource,
        layers: &'a mut [OverlayLayer],
    ) -> &'a mut OverlayLayer {
        match source {
            PlaneSource::Layer(index) => &mut layers[index],
            PlaneSource::Surface(id) => self.surfaces[&id].layer_mut(),
        }
    }

    fn run_test_commit(&self, commit_planes: &[CommitEntry], layers: &[OverlayLayer]) -> bool {
        let commit: Vec<PlaneCommit<'_>> = commit_planes
            .iter()
            .map(|entry| PlaneCommit {
                plane: &*self.overlay_planes[entry.plane],
                layer: self.resolve_source(entry.source, layers),
            })
            .collect();
        self.handler.test_commit(&commit)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::ffi::c_void;
    use std::io;
    use std::rc::Rc;

    use drm_fourcc::{DrmFourcc, DrmModifier};

    use super::super::{DisplayPlane, DisplayPlaneHandler, PlaneCommit};
    use super::{DisplayPlaneManager, DisplayPlaneState, PlaneSource};
    use crate::buffer::{BufferUsage, NativeBufferHandler, NativeHandle, OverlayBuffer};
    use crate::layer::{Composition, HwcLayer, OverlayLayer};
    use crate::surface::{ClearType, NativeSurface, SurfaceAllocator, SurfaceId};
    use crate::utils::{DisplayRotation, Rect, Transform};

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

    /// Handle bits: 0x1 video, 0x2 cursor, 0x4 missing framebuffer.
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

    #[derive(Debug, Default)]
    struct PlaneFlags {
        in_use: Cell<bool>,
        validated: Cell<bool>,
        blacklisted: Cell<bool>,
    }

    #[derive(Debug)]
    struct TestPlane {
        universal: bool,
        flags: Rc<PlaneFlags>,
    }

    impl DisplayPlane for TestPlane {
        fn is_universal(&self) -> bool {
            self.universal
        }
        fn is_supported_format(&self, _format: DrmFourcc) -> bool {
            true
        }
        fn validate_layer(&self, _layer: &OverlayLayer) -> bool {
            true
        }
        fn preferred_format(&self) -> DrmFourcc {
            DrmFourcc::Argb8888
        }
        fn preferred_video_format(&self) -> DrmFourcc {
            DrmFourcc::Nv12
        }
        fn preferred_format_modifier(&self) -> DrmModifier {
            if self.flags.blacklisted.get() {
                DrmModifier::Linear
            } else {
                DrmModifier::I915_x_tiled
            }
        }
        fn preferred_format_modifier_validated(&mut self) {
            self.flags.validated.set(true);
        }
        fn black_list_preferred_format_modifier(&mut self) {
            self.flags.blacklisted.set(true);
        }
        fn disable(&mut self) {}
        fn set_in_use(&mut self, in_use: bool) {
            self.flags.in_use.set(in_use);
        }
        fn in_use(&self) -> bool {
            self.flags.in_use.get()
        }
    }

    struct DriverState {
        universals: Vec<bool>,
        max_commit_planes: Cell<usize>,
        fail_all: Cell<bool>,
        fail_until: Cell<usize>,
        commits: Cell<usize>,
        planes: RefCell<Vec<Rc<PlaneFlags>>>,
    }

    impl DriverState {
        fn new(universals: &[bool]) -> Rc<Self> {
            Rc::new(DriverState {
                universals: universals.to_vec(),
                max_commit_planes: Cell::new(usize::MAX),
                fail_all: Cell::new(false),
                fail_until: Cell::new(0),
                commits: Cell::new(0),
                planes: RefCell::new(Vec::new()),
            })
        }
    }

    struct TestHandler(Rc<DriverState>);

    impl DisplayPlaneHandler for TestHandler {
        fn populate_planes(&mut self) -> io::Result<Vec<Box<dyn DisplayPlane>>> {
            let mut planes: Vec<Box<dyn DisplayPlane>> = Vec::new();
            self.0.planes.borrow_mut().clear();
            for &universal in &self.0.universals {
                let flags = Rc::new(PlaneFlags::default());
                self.0.planes.borrow_mut().push(flags.clone());
                planes.push(Box::new(TestPlane { universal, flags }));
            }
            Ok(planes)
        }

        fn test_commit(&self, commit: &[PlaneCommit<'_>]) -> bool {
            let count = self.0.commits.get() + 1;
            self.0.commits.set(count);
            if self.0.fail_all.get() {
                return false;
            }
            if count <= self.0.fail_until.get() {
                return false;
            }
            commit.len() <= self.0.max_commit_planes.get()
        }
    }

    #[derive(Debug, Default)]
    struct SurfaceProbe {
        age: Cell<i32>,
        on_screen: Cell<bool>,
        clear: Cell<bool>,
    }

    #[derive(Debug)]
    struct TestSurface {
        layer: OverlayLayer,
        modifier: DrmModifier,
        honor_modifier: bool,
        probe: Rc<SurfaceProbe>,
    }

    impl NativeSurface for TestSurface {
        fn init(&mut self, format: DrmFourcc, usage: BufferUsage, modifier: DrmModifier) -> bool {
            self.modifier = if self.honor_modifier {
                modifier
            } else {
                DrmModifier::Linear
            };
            self.layer.set_buffer_object(
                Box::new(FakeBuffer {
                    format,
                    usage,
                    video: usage.contains(BufferUsage::VIDEO),
                    fb: 1,
                }),
                None,
            );
            self.honor_modifier
        }

        fn age(&self) -> i32 {
            self.probe.age.get()
        }

        fn set_age(&mut self, age: i32) {
            self.probe.age.set(age);
        }

        fn is_on_screen(&self) -> bool {
            self.probe.on_screen.get()
        }

        fn modifier(&self) -> DrmModifier {
            self.modifier
        }

        fn layer(&self) -> &OverlayLayer {
            &self.layer
        }

        fn layer_mut(&mut self) -> &mut OverlayLayer {
            &mut self.layer
        }

        fn set_plane_target(&mut self, display_frame: Rect<i32>) {
            self.layer.set_display_frame(display_frame);
        }

        fn set_clear_surface(&mut self, clear: ClearType) {
            self.probe.clear.set(clear == ClearType::FullClear);
        }
    }

    struct TestAllocator {
        honor_modifier: bool,
        probes: Rc<RefCell<Vec<Rc<SurfaceProbe>>>>,
    }

    impl SurfaceAllocator for TestAllocator {
        type Surface = TestSurface;

        fn create_3d_surface(&mut self, _width: u32, _height: u32) -> TestSurface {
            let probe = Rc::new(SurfaceProbe::default());
            self.probes.borrow_mut().push(probe.clone());
            TestSurface {
                layer: OverlayLayer::default(),
                modifier: DrmModifier::Linear,
                honor_modifier: self.honor_modifier,
                probe,
            }
        }

        fn create_video_surface(&mut self, width: u32, height: u32) -> TestSurface {
            self.create_3d_surface(width, height)
        }
    }

    type TestManager = DisplayPlaneManager<TestHandler, TestAllocator>;

    fn build_manager(
        universals: &[bool],
    ) -> (TestManager, Rc<DriverState>, Rc<RefCell<Vec<Rc<SurfaceProbe>>>>) {
        build_manager_with_modifier(universals, true)
    }

    fn build_manager_with_modifier(
        universals: &[bool],
        honor_modifier: bool,
    ) -> (TestManager, Rc<DriverState>, Rc<RefCell<Vec<Rc<SurfaceProbe>>>>) {
        let driver = DriverState::new(universals);
        let probes = Rc::new(RefCell::new(Vec::new()));
        let allocator = TestAllocator {
            honor_modifier,
            probes: probes.clone(),
        };
        let mut manager = DisplayPlaneManager::new(TestHandler(driver.clone()), allocator);
        manager.initialize(1920, 1080).unwrap();
        (manager, driver, probes)
    }

    fn overlay_layer(z_order: usize, frame: Rect<i32>, handle_bits: u64) -> OverlayLayer {
        let mut hwc = HwcLayer::new();
        hwc.set_display_frame(frame);
        hwc.set_source_crop(Rect::new(0.0, 0.0, frame.width() as f32, frame.height() as f32));
        hwc.set_native_handle(NativeHandle(handle_bits));
        OverlayLayer::from_hwc_layer(
            &mut hwc,
            &FakeBufferHandler,
            None,
            z_order,
            z_order,
            2160,
            DisplayRotation::None,
            false,
        )
    }

    fn full_frame_layers(count: usize) -> Vec<OverlayLayer> {
        (0..count)
            .map(|z| overlay_layer(z, Rect::new(0, 0, 1920, 1080), 0))
            .collect()
    }

    fn assert_plan_invariants(composition: &[DisplayPlaneState]) {
        for (i, state) in composition.iter().enumerate() {
            for other in composition.iter().skip(i + 1) {
                assert_ne!(state.plane(), other.plane(), "duplicate plane in plan");
            }
            if state.source_layers().len() > 1 {
                assert!(
                    state.off_screen_target().is_some(),
                    "multi-layer entry without off-screen target"
                );
                assert!(state.needs_off_screen_composition());
            }
        }
        for pair in composition.windows(2) {
            assert!(
                pair[0].source_layers()[0] <= pair[1].source_layers()[0],
                "plan not in z-order"
            );
        }
    }

    fn plan_shape(composition: &[DisplayPlaneState]) -> Vec<(usize, Vec<usize>, bool, bool)> {
        composition
            .iter()
            .map(|state| {
                (
                    state.plane(),
                    state.source_layers().to_vec(),
                    state.scanout(),
                    state.is_video_plane(),
                )
            })
            .collect()
    }

    #[test]
    fn single_opaque_layer_scans_out_directly() {
        let (mut manager, _driver, _probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(1);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later: Vec<SurfaceId> = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(!result.render_layers);
        assert!(result.commit_checked);
        assert!(!result.re_validation_needed);
        assert_eq!(composition.len(), 1);
        assert!(composition[0].scanout());
        assert!(composition[0].off_screen_target().is_none());
        assert_eq!(composition[0].overlay(), PlaneSource::Layer(0));
        assert_plan_invariants(&composition);
    }

    #[test]
    fn two_layers_share_single_plane_through_gpu() {
        let (mut manager, _driver, _probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert_eq!(composition.len(), 1);
        assert_eq!(composition[0].source_layers(), &[0, 1]);
        assert!(composition[0].off_screen_target().is_some());
        assert!(composition[0].needs_off_screen_composition());
        assert_plan_invariants(&composition);
    }

    #[test]
    fn cursor_lands_on_dedicated_plane() {
        let (mut manager, _driver, _probes) = build_manager(&[true, true, false]);
        let mut layers = full_frame_layers(2);
        layers.push(overlay_layer(2, Rect::new(100, 100, 164, 164), 0x2));
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(!result.render_layers);
        assert_eq!(composition.len(), 3);
        assert_eq!(composition[2].plane(), 2);
        assert!(composition[2].is_cursor_plane());
        assert!(composition[2].scanout());
        assert_eq!(layers[2].composition(), Composition::Display);
        // cursor isolation: nothing but the cursor sits on the reserved plane
        for state in &composition {
            if state.plane() == 2 {
                for &index in state.source_layers() {
                    assert!(layers[index].is_cursor_layer());
                }
            }
        }
        assert_plan_invariants(&composition);
    }

    #[test]
    fn video_keeps_its_own_plane_when_commit_fails() {
        let (mut manager, driver, _probes) = build_manager(&[true, true, true]);
        driver.max_commit_planes.set(2);
        let mut layers = vec![
            overlay_layer(0, Rect::new(0, 0, 1920, 1080), 0x1),
            overlay_layer(1, Rect::new(0, 0, 1920, 1080), 0),
            overlay_layer(2, Rect::new(0, 0, 1920, 1080), 0),
        ];
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert_eq!(composition.len(), 2);
        assert!(composition[0].is_video_plane());
        assert_eq!(composition[0].source_layers(), &[0]);
        assert_eq!(composition[1].source_layers(), &[1, 2]);
        assert!(composition[1].off_screen_target().is_some());
        assert_plan_invariants(&composition);
    }

    #[test]
    fn trailing_video_squashes_non_video_planes() {
        let (mut manager, _driver, _probes) = build_manager(&[true, true]);
        let mut layers = vec![
            overlay_layer(0, Rect::new(0, 0, 1920, 1080), 0),
            overlay_layer(1, Rect::new(0, 0, 1920, 1080), 0),
            overlay_layer(2, Rect::new(0, 0, 1920, 1080), 0x1),
        ];
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert_eq!(composition.len(), 2);
        // the two graphics layers collapsed into the first plane so the
        // video kept a plane of its own
        assert_eq!(composition[0].source_layers(), &[0, 1]);
        assert!(composition[0].off_screen_target().is_some());
        assert!(composition[1].is_video_plane());
        assert_eq!(composition[1].source_layers(), &[2]);
        assert_plan_invariants(&composition);
    }

    #[test]
    fn disable_overlay_forces_single_gpu_plane() {
        let (mut manager, _driver, _probes) = build_manager(&[true, true, true]);
        let mut layers = full_frame_layers(4);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            true,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert!(result.commit_checked);
        assert!(!result.re_validation_needed);
        assert_eq!(composition.len(), 1);
        assert_eq!(composition[0].plane(), 0);
        assert_eq!(composition[0].source_layers(), &[0, 1, 2, 3]);
        assert!(!composition[0].scanout());
        assert!(composition[0].off_screen_target().is_some());
        for layer in layers.iter().skip(1) {
            assert_eq!(layer.composition(), Composition::Gpu);
        }
        assert_plan_invariants(&composition);
    }

    #[test]
    fn disable_overlay_with_video_routes_to_vpp() {
        let (mut manager, _driver, _probes) = build_manager(&[true, true]);
        let mut layers = vec![
            overlay_layer(0, Rect::new(0, 0, 1920, 1080), 0x1),
            overlay_layer(1, Rect::new(0, 0, 1920, 1080), 0),
        ];
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            true,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert_eq!(composition.len(), 1);
        assert!(composition[0].is_video_plane());
        assert_eq!(composition[0].source_layers(), &[0, 1]);
        assert!(composition[0].off_screen_target().is_some());
    }

    #[test]
    fn rotated_display_plans_rotated_scanout() {
        let (mut manager, _driver, _probes) = build_manager(&[true]);
        manager.set_display_transform(Transform::ROTATE_90);

        let mut hwc = HwcLayer::new();
        hwc.set_display_frame(Rect::new(0, 0, 1920, 1080));
        hwc.set_source_crop(Rect::new(0.0, 0.0, 1920.0, 1080.0));
        hwc.set_native_handle(NativeHandle(0));
        let mut layers = vec![OverlayLayer::from_hwc_layer(
            &mut hwc,
            &FakeBufferHandler,
            None,
            0,
            0,
            2160,
            DisplayRotation::Rotate90,
            false,
        )];
        assert_eq!(layers[0].plane_transform(), Transform::ROTATE_90);
        assert_eq!(*layers[0].surface_damage(), Rect::new(0, 0, 1920, 1080));

        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();
        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(!result.render_layers);
        assert_eq!(composition.len(), 1);
        assert!(composition[0].scanout());
    }

    #[test]
    fn cursor_merges_into_last_plane_without_free_planes() {
        let (mut manager, _driver, _probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(1);
        layers.push(overlay_layer(1, Rect::new(0, 0, 64, 64), 0x2));
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert_eq!(composition.len(), 1);
        assert_eq!(composition[0].source_layers(), &[0, 1]);
        assert!(composition[0].off_screen_target().is_some());
        assert_eq!(layers[1].composition(), Composition::Gpu);
        assert_plan_invariants(&composition);
    }

    #[test]
    fn incremental_cursor_failure_requests_full_validation() {
        let (mut manager, driver, _probes) = build_manager(&[true, true, false]);
        // two disjoint content layers so the merge below cannot squash them
        let mut layers = vec![
            overlay_layer(0, Rect::new(0, 0, 960, 540), 0),
            overlay_layer(1, Rect::new(960, 540, 1920, 1080), 0),
        ];
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert!(result.commit_checked);
        assert_eq!(composition.len(), 2);

        // the incremental cursor cannot be committed; the planner asks the
        // host to redo a full validation
        layers.push(overlay_layer(2, Rect::new(1000, 600, 1064, 664), 0x2));
        driver.max_commit_planes.set(2);
        let result = manager.validate_layers(
            &mut layers,
            2,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert!(!result.commit_checked);
        assert!(result.render_layers);
    }

    #[test]
    fn failed_final_commit_falls_back_to_gpu_plane() {
        let (mut manager, driver, _probes) = build_manager(&[true, true]);
        driver.fail_all.set(true);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert_eq!(composition.len(), 1);
        assert_eq!(composition[0].plane(), 0);
        assert_eq!(composition[0].source_layers(), &[0, 1]);
        assert!(!composition[0].scanout());
        assert_plan_invariants(&composition);
    }

    #[test]
    fn validation_is_idempotent() {
        let (mut manager, _driver, _probes) = build_manager(&[true, true, true]);
        let frames = [
            Rect::new(0, 0, 1920, 1080),
            Rect::new(100, 100, 800, 700),
            Rect::new(50, 50, 400, 300),
        ];
        let build_layers = || {
            frames
                .iter()
                .enumerate()
                .map(|(z, frame)| overlay_layer(z, *frame, 0))
                .collect::<Vec<_>>()
        };

        let mut layers = build_layers();
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();
        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        let first_shape = plan_shape(&composition);
        assert_plan_invariants(&composition);

        let mut layers = build_layers();
        let mut second = Vec::new();
        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut second,
            &mut composition,
            &mut mark_later,
        );
        assert_eq!(first_shape, plan_shape(&second));
    }

    #[test]
    fn recycling_ages_surfaces_and_defers_on_screen_ones() {
        let (mut manager, _driver, probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert_eq!(probes.borrow().len(), 1);

        // off-screen surface ages straight to -1
        let mut plane = composition.pop().unwrap();
        manager.mark_surfaces_for_recycling(&mut plane, &mut mark_later, false, true);
        assert!(mark_later.is_empty());
        assert_eq!(probes.borrow()[0].age.get(), -1);
        assert!(plane.surfaces().is_empty());

        // an on-screen surface with non-negative age is deferred instead
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        let mut plane = composition.pop().unwrap();
        let probe = probes.borrow().last().unwrap().clone();
        probe.age.set(1);
        probe.on_screen.set(true);
        manager.mark_surfaces_for_recycling(&mut plane, &mut mark_later, true, true);
        assert_eq!(mark_later.len(), 1);
        assert_eq!(probe.age.get(), 1);
    }

    #[test]
    fn released_surfaces_leave_the_pool() {
        let (mut manager, _driver, probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert_eq!(probes.borrow().len(), 1);

        let mut plane = composition.pop().unwrap();
        manager.mark_surfaces_for_recycling(&mut plane, &mut mark_later, false, true);
        manager.release_free_off_screen_targets(false);

        // the pool is empty, the next plan needs a fresh allocation
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert_eq!(probes.borrow().len(), 2);
    }

    #[test]
    fn recycled_surface_is_reused_without_release() {
        let (mut manager, _driver, probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert_eq!(probes.borrow().len(), 1);

        // a full re-validation recycles the pooled surface instead of
        // allocating a second one
        let mut layers = full_frame_layers(2);
        let mut second = Vec::new();
        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut second,
            &mut composition,
            &mut mark_later,
        );
        assert_eq!(probes.borrow().len(), 1);
        assert!(second[0].off_screen_target().is_some());
    }

    #[test]
    fn rejected_modifier_is_blacklisted() {
        let (mut manager, driver, _probes) = build_manager_with_modifier(&[true], false);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert!(driver.planes.borrow()[0].blacklisted.get());
        assert!(!driver.planes.borrow()[0].validated.get());
    }

    #[test]
    fn honored_modifier_is_validated() {
        let (mut manager, driver, _probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert!(driver.planes.borrow()[0].validated.get());
        assert!(!driver.planes.borrow()[0].blacklisted.get());
    }

    #[test]
    fn re_validation_commit_failure_requests_full_pass() {
        let (mut manager, driver, _probes) = build_manager(&[true]);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        driver.fail_all.set(true);
        let result = manager.re_validate_planes(
            &mut composition,
            &mut layers,
            &mut mark_later,
            false,
            true,
        );
        assert!(result.request_full_validation);
        assert!(result.render_layers);
    }

    #[test]
    fn re_validation_demotes_single_layer_plane_to_scanout() {
        let (mut manager, driver, _probes) = build_manager(&[true]);
        driver.fail_all.set(true);
        let mut layers = full_frame_layers(1);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert!(result.render_layers);
        assert!(result.re_validation_needed);
        assert!(!composition[0].scanout());

        // the driver recovered, the plane goes back to direct scan-out
        driver.fail_all.set(false);
        let result = manager.re_validate_planes(
            &mut composition,
            &mut layers,
            &mut mark_later,
            true,
            false,
        );
        assert!(!result.request_full_validation);
        assert!(composition[0].scanout());
        assert_eq!(composition[0].overlay(), PlaneSource::Layer(0));
        assert_eq!(layers[0].composition(), Composition::Display);
    }

    #[test]
    fn re_validation_rolls_back_failed_demotion() {
        let (mut manager, driver, _probes) = build_manager(&[true]);
        driver.fail_all.set(true);
        let mut layers = full_frame_layers(1);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        let target = composition[0].off_screen_target();
        assert!(target.is_some());

        // still failing: the plane keeps its off-screen state
        let result = manager.re_validate_planes(
            &mut composition,
            &mut layers,
            &mut mark_later,
            true,
            false,
        );
        assert!(!result.request_full_validation);
        assert!(!composition[0].scanout());
        assert_eq!(composition[0].off_screen_target(), target);
        assert_eq!(layers[0].composition(), Composition::Gpu);
    }

    #[test]
    fn down_scaling_probes_factor_four() {
        let (mut manager, driver, _probes) = build_manager(&[true]);
        driver.fail_until.set(2);

        let mut hwc = HwcLayer::new();
        hwc.set_display_frame(Rect::new(0, 0, 480, 270));
        hwc.set_source_crop(Rect::new(0.0, 0.0, 1920.0, 1080.0));
        hwc.set_native_handle(NativeHandle(0));
        let mut layers = vec![OverlayLayer::from_hwc_layer(
            &mut hwc,
            &FakeBufferHandler,
            None,
            0,
            0,
            2160,
            DisplayRotation::None,
            false,
        )];
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        let result = manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );

        assert!(result.render_layers);
        assert_eq!(composition[0].down_scaling_factor(), 4);
    }

    #[test]
    fn planes_stay_in_use_only_while_assigned() {
        let (mut manager, driver, _probes) = build_manager(&[true, true]);
        let mut layers = full_frame_layers(2);
        let mut composition = Vec::new();
        let mut previous = Vec::new();
        let mut mark_later = Vec::new();

        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut composition,
            &mut previous,
            &mut mark_later,
        );
        assert_eq!(composition.len(), 2);
        assert!(driver.planes.borrow()[0].in_use.get());
        assert!(driver.planes.borrow()[1].in_use.get());

        // a single layer frees the second plane again
        let mut layers = full_frame_layers(1);
        let mut second = Vec::new();
        manager.validate_layers(
            &mut layers,
            0,
            false,
            &mut second,
            &mut composition,
            &mut mark_later,
        );
        assert!(driver.planes.borrow()[0].in_use.get());
        assert!(!driver.planes.borrow()[1].in_use.get());
    }
}
