//! The graphics bundle: everything the compositor core needs from a GPU
//! back-end, behind one object-safe trait.
//!
//! The core never talks to a graphics API directly. It allocates image
//! collections, builds views and samplers, exports native handles for the
//! IPC boundary, and orders work with timeline semaphores; which API provides
//! those is a deployment decision. Two back-ends ship in-tree: the Vulkan one
//! and a CPU-side headless one backed by memfds.

use std::os::fd::OwnedFd;

use thiserror::Error;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

handle_type!(
    /// An image owned by the bundle.
    ImageHandle
);
handle_type!(ViewHandle);
handle_type!(SamplerHandle);
handle_type!(
    /// A timeline semaphore owned by the bundle.
    SemaphoreHandle
);
handle_type!(FenceHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Rgba8Srgb,
    Rgba8Unorm,
    Bgra8Srgb,
    Bgra8Unorm,
    Rgba16Float,
    D32Float,
    D24UnormS8,
}

impl ImageFormat {
    pub fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Rgba8Srgb,
            1 => Self::Rgba8Unorm,
            2 => Self::Bgra8Srgb,
            3 => Self::Bgra8Unorm,
            4 => Self::Rgba16Float,
            5 => Self::D32Float,
            6 => Self::D24UnormS8,
            _ => return None,
        })
    }

    pub fn bytes_per_texel(self) -> u64 {
        match self {
            Self::Rgba8Srgb | Self::Rgba8Unorm | Self::Bgra8Srgb | Self::Bgra8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::D32Float | Self::D24UnormS8 => 4,
        }
    }
}

/// Component swizzle applied by an image view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swizzle {
    Identity,
    /// Forces the alpha channel to read as one.
    OpaqueAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy)]
pub struct SubresourceRange {
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub base_mip: u32,
    pub mip_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageCreateInfo {
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub mip_count: u32,
    pub face_count: u32,
    pub format: ImageFormat,
    pub protected: bool,
    /// Whether the allocation must be exportable across processes.
    pub exportable: bool,
}

/// One allocated (or imported) image slot.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedImage {
    pub handle: ImageHandle,
    pub size: u64,
    pub uses_dedicated_allocation: bool,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("image format is not supported by this back-end")]
    FormatUnsupported,
    #[error("requested creation flag is not supported by this back-end")]
    FlagUnsupported,
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("wait timed out")]
    Timeout,
    #[error("GPU error: {0}")]
    Gpu(String),
}

pub type BundleResult<T> = Result<T, BundleError>;

/// The back-end seam consumed by the swapchain engine, the compositor base
/// and the sync objects.
pub trait GraphicsBundle: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_format(&self, format: ImageFormat) -> bool;
    fn supports_protected_content(&self) -> bool;

    /// Allocates `count` images described by `info`.
    fn allocate_images(&self, info: &ImageCreateInfo, count: u32)
        -> BundleResult<Vec<AllocatedImage>>;

    /// Wraps caller-provided native buffers in bundle images.
    fn import_images(
        &self,
        info: &ImageCreateInfo,
        handles: Vec<OwnedFd>,
    ) -> BundleResult<Vec<AllocatedImage>>;

    /// Exports an image's native buffer handle for the IPC boundary.
    fn export_image(&self, image: ImageHandle) -> BundleResult<OwnedFd>;

    fn create_view(
        &self,
        image: ImageHandle,
        range: SubresourceRange,
        swizzle: Swizzle,
    ) -> BundleResult<ViewHandle>;

    fn create_sampler(&self, address_mode: AddressMode) -> BundleResult<SamplerHandle>;

    /// Transitions freshly created images to the shader-read-only layout in
    /// one command-buffer submit.
    fn transition_to_shader_read(&self, images: &[ImageHandle]) -> BundleResult<()>;

    /// Creates an exportable timeline semaphore. The returned fd is the
    /// native sync handle handed across the IPC boundary.
    fn create_semaphore(&self) -> BundleResult<(SemaphoreHandle, OwnedFd)>;

    fn signal_semaphore(&self, semaphore: SemaphoreHandle, value: u64) -> BundleResult<()>;

    /// Waits until the timeline reaches `value`; `BundleError::Timeout` when
    /// the deadline passes first.
    fn wait_semaphore(
        &self,
        semaphore: SemaphoreHandle,
        value: u64,
        timeout_ns: u64,
    ) -> BundleResult<()>;

    fn import_fence(&self, handle: OwnedFd) -> BundleResult<FenceHandle>;

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> BundleResult<()>;

    fn destroy_image(&self, image: ImageHandle);
    fn destroy_view(&self, view: ViewHandle);
    fn destroy_sampler(&self, sampler: SamplerHandle);
    /// Implementations wait for the device to go idle first if the primitive
    /// could still be referenced by in-flight work.
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);
    fn destroy_fence(&self, fence: FenceHandle);

    fn wait_idle(&self);
}
