//! The swapchain engine.
//!
//! A swapchain is a small fixed ring of GPU images exported across the IPC
//! boundary. The application acquires the oldest released image, renders into
//! it and releases it back; the compositor samples whichever images the
//! committed layers reference. Index ownership is a strict partition: at any
//! moment every index is either in the acquire FIFO, held by the application,
//! or kept alive by in-flight compositor work (tracked by the per-image use
//! count).

use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use setsuna_ipc::protocol::{self, swapchain_create_flags};

use crate::{
    bundle::{
        AddressMode, BundleError, GraphicsBundle, ImageCreateInfo, ImageFormat, ImageHandle,
        SamplerHandle, SubresourceRange, Swizzle, ViewHandle,
    },
    garbage::{PendingImage, PendingSwapchain, SharedResources},
};

/// Engine-level creation description, decoded from the wire info.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainCreateInfo {
    pub create_flags: u32,
    pub usage_flags: u32,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub array_layer_count: u32,
    pub face_count: u32,
    pub mip_count: u32,
}

impl SwapchainCreateInfo {
    pub fn from_wire(wire: &protocol::SwapchainCreateInfo) -> Result<Self, SwapchainError> {
        let format =
            ImageFormat::from_wire(wire.format).ok_or(SwapchainError::FormatUnsupported)?;
        Ok(Self {
            create_flags: wire.create_flags,
            usage_flags: wire.usage_flags,
            format,
            width: wire.width.max(1),
            height: wire.height.max(1),
            array_layer_count: wire.array_layer_count.max(1),
            face_count: wire.face_count.max(1),
            mip_count: wire.mip_count.max(1),
        })
    }

    pub fn is_static(&self) -> bool {
        self.create_flags & swapchain_create_flags::STATIC_IMAGE != 0
    }

    pub fn is_protected(&self) -> bool {
        self.create_flags & swapchain_create_flags::PROTECTED_CONTENT != 0
    }
}

#[derive(Debug, Error)]
pub enum SwapchainError {
    #[error("no image available to acquire")]
    NoImageAvailable,
    #[error("image index out of range")]
    InvalidIndex,
    #[error("release would overflow the acquire queue")]
    FifoOverflow,
    #[error("wait for image timed out")]
    Timeout,
    #[error("creation flag not supported")]
    FlagUnsupported,
    #[error("image format not supported")]
    FormatUnsupported,
    #[error(transparent)]
    Gpu(#[from] BundleError),
}

struct ImageUse {
    use_count: Mutex<u32>,
    cond: Condvar,
}

/// One image slot with its derived views and samplers.
pub struct SwapchainImage {
    pub handle: ImageHandle,
    pub size: u64,
    pub uses_dedicated_allocation: bool,
    /// Per array layer, alpha preserved.
    views_color: Vec<ViewHandle>,
    /// Per array layer, alpha forced to one.
    views_opaque: Vec<ViewHandle>,
    sampler_repeat: SamplerHandle,
    sampler_clamp: SamplerHandle,
    usage: ImageUse,
}

impl SwapchainImage {
    pub fn view(&self, layer: u32, opaque: bool) -> Option<ViewHandle> {
        let views = if opaque {
            &self.views_opaque
        } else {
            &self.views_color
        };
        views.get(layer as usize).copied()
    }

    pub fn samplers(&self) -> (SamplerHandle, SamplerHandle) {
        (self.sampler_repeat, self.sampler_clamp)
    }
}

pub struct Swapchain {
    images: Vec<SwapchainImage>,
    fifo: Mutex<VecDeque<u32>>,
    /// Index most recently released by the application; the one the
    /// compositor samples when a committed layer references this swapchain.
    latest_released: Mutex<Option<u32>>,
    info: SwapchainCreateInfo,
    bundle: Arc<dyn GraphicsBundle>,
    shared: Arc<SharedResources>,
}

impl Swapchain {
    /// Allocates `image_count` images and primes the acquire FIFO with every
    /// index in order.
    pub fn create(
        bundle: Arc<dyn GraphicsBundle>,
        shared: Arc<SharedResources>,
        info: SwapchainCreateInfo,
        image_count: u32,
    ) -> Result<Arc<Self>, SwapchainError> {
        Self::check_support(&bundle, &info)?;

        let create_info = Self::image_create_info(&info, true);
        let allocated = bundle.allocate_images(&create_info, image_count)?;
        Self::finish(bundle, shared, info, allocated)
    }

    /// Wraps caller-provided native images; same view/sampler/FIFO setup as
    /// [`Swapchain::create`].
    pub fn import(
        bundle: Arc<dyn GraphicsBundle>,
        shared: Arc<SharedResources>,
        info: SwapchainCreateInfo,
        native_images: Vec<std::os::fd::OwnedFd>,
    ) -> Result<Arc<Self>, SwapchainError> {
        Self::check_support(&bundle, &info)?;

        let create_info = Self::image_create_info(&info, false);
        let allocated = bundle.import_images(&create_info, native_images)?;
        Self::finish(bundle, shared, info, allocated)
    }

    fn check_support(
        bundle: &Arc<dyn GraphicsBundle>,
        info: &SwapchainCreateInfo,
    ) -> Result<(), SwapchainError> {
        if info.is_protected() && !bundle.supports_protected_content() {
            return Err(SwapchainError::FlagUnsupported);
        }
        if !bundle.supports_format(info.format) {
            return Err(SwapchainError::FormatUnsupported);
        }
        Ok(())
    }

    fn image_create_info(info: &SwapchainCreateInfo, exportable: bool) -> ImageCreateInfo {
        ImageCreateInfo {
            width: info.width,
            height: info.height,
            array_layers: info.array_layer_count,
            mip_count: info.mip_count,
            face_count: info.face_count,
            format: info.format,
            protected: info.is_protected(),
            exportable,
        }
    }

    fn finish(
        bundle: Arc<dyn GraphicsBundle>,
        shared: Arc<SharedResources>,
        info: SwapchainCreateInfo,
        allocated: Vec<crate::bundle::AllocatedImage>,
    ) -> Result<Arc<Self>, SwapchainError> {
        let layer_count = info.array_layer_count * info.face_count;
        let mut images = Vec::with_capacity(allocated.len());
        for slot in &allocated {
            let mut views_color = Vec::with_capacity(layer_count as usize);
            let mut views_opaque = Vec::with_capacity(layer_count as usize);
            for layer in 0..layer_count {
                let range = SubresourceRange {
                    base_array_layer: layer,
                    layer_count: 1,
                    base_mip: 0,
                    mip_count: info.mip_count,
                };
                views_color.push(bundle.create_view(slot.handle, range, Swizzle::Identity)?);
                views_opaque.push(bundle.create_view(slot.handle, range, Swizzle::OpaqueAlpha)?);
            }
            images.push(SwapchainImage {
                handle: slot.handle,
                size: slot.size,
                uses_dedicated_allocation: slot.uses_dedicated_allocation,
                views_color,
                views_opaque,
                sampler_repeat: bundle.create_sampler(AddressMode::Repeat)?,
                sampler_clamp: bundle.create_sampler(AddressMode::ClampToEdge)?,
                usage: ImageUse {
                    use_count: Mutex::new(0),
                    cond: Condvar::new(),
                },
            });
        }

        let handles: Vec<ImageHandle> = images.iter().map(|image| image.handle).collect();
        bundle.transition_to_shader_read(&handles)?;

        let fifo = (0..images.len() as u32).collect();
        Ok(Arc::new(Self {
            images,
            fifo: Mutex::new(fifo),
            latest_released: Mutex::new(None),
            info,
            bundle,
            shared,
        }))
    }

    pub fn info(&self) -> &SwapchainCreateInfo {
        &self.info
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn image(&self, index: u32) -> Option<&SwapchainImage> {
        self.images.get(index as usize)
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    /// Exports the native buffer handles, one per image, for the IPC reply.
    pub fn export_native_handles(&self) -> Result<Vec<std::os::fd::OwnedFd>, SwapchainError> {
        self.images
            .iter()
            .map(|image| Ok(self.bundle.export_image(image.handle)?))
            .collect()
    }

    /// Pops the oldest released index.
    pub fn acquire(&self) -> Result<u32, SwapchainError> {
        self.fifo
            .lock()
            .pop_front()
            .ok_or(SwapchainError::NoImageAvailable)
    }

    /// Blocks until the application may write to `index`, i.e. until the
    /// compositor's use count drops to zero.
    pub fn wait_image(&self, index: u32, timeout_ns: i64) -> Result<(), SwapchainError> {
        let image = self
            .images
            .get(index as usize)
            .ok_or(SwapchainError::InvalidIndex)?;
        let timeout = std::time::Duration::from_nanos(timeout_ns.max(0) as u64);

        let mut count = image.usage.use_count.lock();
        while *count > 0 {
            if image
                .usage
                .cond
                .wait_for(&mut count, timeout)
                .timed_out()
            {
                return Err(SwapchainError::Timeout);
            }
        }
        Ok(())
    }

    /// Pushes `index` to the FIFO tail. Duplicate or overflowing releases are
    /// protocol errors on the caller's side.
    pub fn release(&self, index: u32) -> Result<(), SwapchainError> {
        if index as usize >= self.images.len() {
            return Err(SwapchainError::InvalidIndex);
        }
        let mut fifo = self.fifo.lock();
        if fifo.len() >= self.images.len() || fifo.contains(&index) {
            return Err(SwapchainError::FifoOverflow);
        }
        fifo.push_back(index);
        *self.latest_released.lock() = Some(index);
        Ok(())
    }

    /// The image index the compositor should sample, if any release happened
    /// yet.
    pub fn latest_released(&self) -> Option<u32> {
        *self.latest_released.lock()
    }

    /// Marks one image as referenced by in-flight compositor work.
    pub fn mark_in_use(&self, index: u32) {
        if let Some(image) = self.images.get(index as usize) {
            *image.usage.use_count.lock() += 1;
        }
    }

    /// Drops one in-flight reference and wakes any `wait_image` caller.
    pub fn retire(&self, index: u32) {
        if let Some(image) = self.images.get(index as usize) {
            let mut count = image.usage.use_count.lock();
            if *count > 0 {
                *count -= 1;
                if *count == 0 {
                    image.usage.cond.notify_all();
                }
            }
        }
    }

    #[cfg(test)]
    fn fifo_snapshot(&self) -> Vec<u32> {
        self.fifo.lock().iter().copied().collect()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // The last reference is gone; hand every GPU object to the deferred
        // destruction stack. Actual destruction happens on the render thread
        // at the next garbage-collect pass.
        let images = self
            .images
            .drain(..)
            .map(|image| PendingImage {
                handle: image.handle,
                views: image
                    .views_color
                    .into_iter()
                    .chain(image.views_opaque)
                    .collect(),
                samplers: vec![image.sampler_repeat, image.sampler_clamp],
            })
            .collect();
        self.shared.schedule(PendingSwapchain { images });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBundle;

    fn test_info() -> SwapchainCreateInfo {
        SwapchainCreateInfo {
            create_flags: 0,
            usage_flags: 0,
            format: ImageFormat::Rgba8Srgb,
            width: 16,
            height: 16,
            array_layer_count: 2,
            face_count: 1,
            mip_count: 1,
        }
    }

    fn new_chain(image_count: u32) -> (Arc<HeadlessBundle>, Arc<SharedResources>, Arc<Swapchain>) {
        let bundle = Arc::new(HeadlessBundle::new());
        let shared = Arc::new(SharedResources::new());
        let chain = Swapchain::create(
            bundle.clone(),
            shared.clone(),
            test_info(),
            image_count,
        )
        .unwrap();
        (bundle, shared, chain)
    }

    #[test]
    fn acquire_release_is_first_released_first_acquired() {
        let (_bundle, _shared, chain) = new_chain(3);

        assert_eq!(chain.acquire().unwrap(), 0);
        assert_eq!(chain.acquire().unwrap(), 1);
        assert_eq!(chain.acquire().unwrap(), 2);
        assert!(matches!(
            chain.acquire(),
            Err(SwapchainError::NoImageAvailable)
        ));

        chain.release(1).unwrap();
        assert_eq!(chain.acquire().unwrap(), 1);

        chain.release(2).unwrap();
        chain.release(0).unwrap();
        chain.release(1).unwrap();
        // Oldest released wins.
        assert_eq!(chain.acquire().unwrap(), 2);
    }

    #[test]
    fn duplicate_release_is_rejected() {
        let (_bundle, _shared, chain) = new_chain(2);
        let index = chain.acquire().unwrap();
        chain.release(index).unwrap();
        assert!(matches!(
            chain.release(index),
            Err(SwapchainError::FifoOverflow)
        ));
        assert!(matches!(
            chain.release(7),
            Err(SwapchainError::InvalidIndex)
        ));
    }

    #[test]
    fn acquire_release_identity_on_single_image() {
        let (_bundle, _shared, chain) = new_chain(1);
        let before = chain.fifo_snapshot();
        let index = chain.acquire().unwrap();
        chain.release(index).unwrap();
        assert_eq!(chain.fifo_snapshot(), before);
    }

    #[test]
    fn wait_image_blocks_on_use_count() {
        let (_bundle, _shared, chain) = new_chain(2);
        chain.mark_in_use(0);

        assert!(matches!(
            chain.wait_image(0, 5_000_000),
            Err(SwapchainError::Timeout)
        ));

        let waiter = {
            let chain = chain.clone();
            std::thread::spawn(move || chain.wait_image(0, 2_000_000_000))
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        chain.retire(0);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn views_cover_every_layer_in_both_swizzles() {
        let bundle = Arc::new(HeadlessBundle::new());
        let shared = Arc::new(SharedResources::new());
        let chain =
            Swapchain::create(bundle.clone(), shared, test_info(), 2).unwrap();

        let image = chain.image(0).unwrap();
        let color = image.view(1, false).unwrap();
        let opaque = image.view(1, true).unwrap();
        assert!(!bundle.view_record(color).unwrap().opaque_alpha);
        assert!(bundle.view_record(opaque).unwrap().opaque_alpha);
        assert_eq!(bundle.view_record(opaque).unwrap().base_array_layer, 1);
        assert!(image.view(2, false).is_none());
    }

    #[test]
    fn protected_content_is_flag_unsupported() {
        let bundle = Arc::new(HeadlessBundle::new());
        let shared = Arc::new(SharedResources::new());
        let mut info = test_info();
        info.create_flags = swapchain_create_flags::PROTECTED_CONTENT;
        assert!(matches!(
            Swapchain::create(bundle, shared, info, 3),
            Err(SwapchainError::FlagUnsupported)
        ));
    }
}
