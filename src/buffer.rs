//! Buffer import and ownership
//!
//! The planner never touches pixels; it only needs a handful of facts about
//! each layer's buffer (format, usage, whether the driver has a framebuffer
//! for it) and has to keep the buffer's acquire fence alive for exactly as
//! long as the layer exists. The platform allocator behind these traits is an
//! external collaborator, typically wrapping gralloc or a DMA-BUF heap.

use std::ffi::c_void;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use drm_fourcc::DrmFourcc;

bitflags::bitflags! {
    /// Usage hints attached to a buffer at allocation time.
    ///
    /// An empty set describes an ordinary colour buffer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        /// The buffer backs a cursor image
        const CURSOR = 1 << 0;
        /// The buffer carries decoded video frames
        const VIDEO = 1 << 1;
    }
}

/// Opaque handle to a platform buffer as passed in by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Capabilities of an imported pixel buffer.
///
/// Implemented by the buffer objects a [`NativeBufferHandler`] produces. The
/// planner reads these to classify layers and to decide whether direct
/// scan-out is possible at all.
pub trait OverlayBuffer: fmt::Debug {
    /// Pixel format of the buffer
    fn format(&self) -> DrmFourcc;

    /// Usage hints recorded at allocation time
    fn usage(&self) -> BufferUsage;

    /// Whether the buffer holds video content (decoder output)
    fn is_video_buffer(&self) -> bool;

    /// DRM framebuffer id, or `0` if the buffer has none and therefore cannot
    /// be scanned out directly
    fn fb(&self) -> u32;
}

/// Buffer allocation and import as provided by the platform.
///
/// Implementations wrap a gralloc module or a DMA-BUF allocator. Only
/// [`import_buffer`](NativeBufferHandler::import_buffer) is exercised by the
/// planner itself; the remaining operations are part of the host-facing
/// contract so a single handler instance can serve the whole compositor.
pub trait NativeBufferHandler {
    /// Allocates a new buffer and returns its handle
    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        usage: BufferUsage,
    ) -> io::Result<NativeHandle>;

    /// Imports a handle received from the client side
    fn import_buffer(&self, handle: NativeHandle) -> io::Result<Box<dyn OverlayBuffer>>;

    /// Releases an imported buffer
    fn release_buffer(&self, handle: NativeHandle) -> io::Result<()>;

    /// Destroys a handle previously copied with
    /// [`copy_handle`](NativeBufferHandler::copy_handle)
    fn destroy_handle(&self, handle: NativeHandle) -> io::Result<()>;

    /// Duplicates a handle without duplicating the underlying storage
    fn copy_handle(&self, source: NativeHandle) -> io::Result<NativeHandle>;

    /// Maps one plane of the buffer into the caller's address space
    #[allow(clippy::too_many_arguments)]
    fn map(
        &self,
        handle: NativeHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        plane: usize,
    ) -> io::Result<*mut c_void>;

    /// Unmaps a mapping established with [`map`](NativeBufferHandler::map)
    fn unmap(&self, handle: NativeHandle, map_data: *mut c_void) -> io::Result<()>;

    /// Number of hardware planes a buffer of `format` occupies
    fn total_planes(&self, format: DrmFourcc) -> usize;
}

/// An imported buffer together with its acquire fence.
///
/// The fence is a scarce kernel resource; it lives in an [`OwnedFd`] so it is
/// closed exactly once, either when ownership is handed out through
/// [`release_acquire_fence`](ImportedBuffer::release_acquire_fence) or when
/// the buffer is dropped.
#[derive(Debug)]
pub struct ImportedBuffer {
    buffer: Box<dyn OverlayBuffer>,
    acquire_fence: Option<OwnedFd>,
}

impl ImportedBuffer {
    /// Wraps an imported buffer and takes ownership of its acquire fence
    pub fn new(buffer: Box<dyn OverlayBuffer>, acquire_fence: Option<OwnedFd>) -> Self {
        ImportedBuffer {
            buffer,
            acquire_fence,
        }
    }

    /// The imported buffer object
    pub fn buffer(&self) -> &dyn OverlayBuffer {
        &*self.buffer
    }

    /// Replaces the acquire fence, closing any fence currently held
    pub fn set_acquire_fence(&mut self, acquire_fence: Option<OwnedFd>) {
        self.acquire_fence = acquire_fence;
    }

    /// Borrows the current acquire fence, if any
    pub fn acquire_fence(&self) -> Option<BorrowedFd<'_>> {
        self.acquire_fence.as_ref().map(|fence| fence.as_fd())
    }

    /// Hands ownership of the acquire fence to the caller.
    ///
    /// Subsequent calls return `None` and dropping the buffer afterwards
    /// closes nothing further.
    pub fn release_acquire_fence(&mut self) -> Option<OwnedFd> {
        self.acquire_fence.take()
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferUsage, ImportedBuffer, OverlayBuffer};
    use drm_fourcc::DrmFourcc;
    use std::fs::File;
    use std::os::fd::OwnedFd;

    #[derive(Debug)]
    struct DummyBuffer;

    impl OverlayBuffer for DummyBuffer {
        fn format(&self) -> DrmFourcc {
            DrmFourcc::Argb8888
        }
        fn usage(&self) -> BufferUsage {
            BufferUsage::empty()
        }
        fn is_video_buffer(&self) -> bool {
            false
        }
        fn fb(&self) -> u32 {
            1
        }
    }

    fn fence() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn release_yields_fence_once() {
        let mut imported = ImportedBuffer::new(Box::new(DummyBuffer), Some(fence()));
        assert!(imported.acquire_fence().is_some());
        assert!(imported.release_acquire_fence().is_some());
        assert!(imported.acquire_fence().is_none());
        assert!(imported.release_acquire_fence().is_none());
    }

    #[test]
    fn replacing_fence_drops_old() {
        let mut imported = ImportedBuffer::new(Box::new(DummyBuffer), Some(fence()));
        imported.set_acquire_fence(Some(fence()));
        // only the new fence is held
        assert!(imported.release_acquire_fence().is_some());
        assert!(imported.release_acquire_fence().is_none());
    }
}
