//! CPU-side graphics bundle.
//!
//! Images are plain memfd-backed byte ranges, so the exported native handles
//! are real and survive the trip across the IPC boundary. Timeline semaphores
//! are mutex/condvar pairs. The null compositor and the test suite run
//! entirely on this back-end.

use std::{
    collections::HashMap,
    fs::File,
    os::fd::{AsFd, OwnedFd},
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use parking_lot::{Condvar, Mutex};

use crate::bundle::{
    AddressMode, AllocatedImage, BundleError, BundleResult, FenceHandle, GraphicsBundle,
    ImageCreateInfo, ImageFormat, ImageHandle, SamplerHandle, SemaphoreHandle, SubresourceRange,
    Swizzle, ViewHandle,
};

struct HeadlessImage {
    file: File,
    size: u64,
}

/// Record of a created view, kept so tests can assert the view setup the
/// engine performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewRecord {
    pub image: ImageHandle,
    pub base_array_layer: u32,
    pub opaque_alpha: bool,
}

struct Timeline {
    value: Mutex<u64>,
    cond: Condvar,
}

impl Timeline {
    fn new() -> Self {
        Self {
            value: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
            self.cond.notify_all();
        }
    }

    fn wait(&self, value: u64, timeout: Duration) -> BundleResult<()> {
        let mut current = self.value.lock();
        while *current < value {
            if self.cond.wait_for(&mut current, timeout).timed_out() {
                return Err(BundleError::Timeout);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    images: HashMap<u64, HeadlessImage>,
    views: HashMap<u64, ViewRecord>,
    samplers: HashMap<u64, AddressMode>,
    semaphores: HashMap<u64, Arc<Timeline>>,
    fences: HashMap<u64, OwnedFd>,
}

/// The headless bundle. Cheap to create; holds every live object in one
/// registry map.
pub struct HeadlessBundle {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl HeadlessBundle {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn image_size(info: &ImageCreateInfo) -> u64 {
        u64::from(info.width)
            * u64::from(info.height)
            * u64::from(info.array_layers.max(1))
            * u64::from(info.face_count.max(1))
            * info.format.bytes_per_texel()
    }

    fn backing(&self, name: &str, size: u64) -> BundleResult<File> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|err| BundleError::Allocation(err.to_string()))?;
        let fd = memfd_create(c_name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|errno| BundleError::Allocation(errno.to_string()))?;
        let file = File::from(fd);
        file.set_len(size)
            .map_err(|err| BundleError::Allocation(err.to_string()))?;
        Ok(file)
    }

    /// Number of live objects of each kind, for leak assertions in tests.
    pub fn live_counts(&self) -> (usize, usize, usize) {
        let registry = self.registry.lock();
        (
            registry.images.len(),
            registry.views.len(),
            registry.samplers.len(),
        )
    }

    /// The recorded view setup for one view handle, for tests.
    pub fn view_record(&self, view: ViewHandle) -> Option<ViewRecord> {
        self.registry.lock().views.get(&view.0).copied()
    }

    /// The current value of a timeline semaphore, for tests.
    pub fn semaphore_value(&self, semaphore: SemaphoreHandle) -> Option<u64> {
        let timeline = self.registry.lock().semaphores.get(&semaphore.0).cloned()?;
        let value = *timeline.value.lock();
        Some(value)
    }
}

impl Default for HeadlessBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBundle for HeadlessBundle {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn supports_format(&self, format: ImageFormat) -> bool {
        // Depth formats are accepted too; everything is bytes here.
        let _ = format;
        true
    }

    fn supports_protected_content(&self) -> bool {
        false
    }

    fn allocate_images(
        &self,
        info: &ImageCreateInfo,
        count: u32,
    ) -> BundleResult<Vec<AllocatedImage>> {
        let size = Self::image_size(info);
        let mut out = Vec::with_capacity(count as usize);
        let mut registry = self.registry.lock();
        for _ in 0..count {
            let file = self.backing("setsuna-headless-image", size)?;
            let id = self.next_id();
            registry.images.insert(id, HeadlessImage { file, size });
            out.push(AllocatedImage {
                handle: ImageHandle(id),
                size,
                uses_dedicated_allocation: false,
            });
        }
        Ok(out)
    }

    fn import_images(
        &self,
        info: &ImageCreateInfo,
        handles: Vec<OwnedFd>,
    ) -> BundleResult<Vec<AllocatedImage>> {
        let size = Self::image_size(info);
        let mut out = Vec::with_capacity(handles.len());
        let mut registry = self.registry.lock();
        for fd in handles {
            let id = self.next_id();
            registry.images.insert(
                id,
                HeadlessImage {
                    file: File::from(fd),
                    size,
                },
            );
            out.push(AllocatedImage {
                handle: ImageHandle(id),
                size,
                uses_dedicated_allocation: false,
            });
        }
        Ok(out)
    }

    fn export_image(&self, image: ImageHandle) -> BundleResult<OwnedFd> {
        let registry = self.registry.lock();
        let entry = registry
            .images
            .get(&image.0)
            .ok_or_else(|| BundleError::Gpu(format!("unknown image {image:?}")))?;
        entry
            .file
            .as_fd()
            .try_clone_to_owned()
            .map_err(|err| BundleError::Gpu(err.to_string()))
    }

    fn create_view(
        &self,
        image: ImageHandle,
        range: SubresourceRange,
        swizzle: Swizzle,
    ) -> BundleResult<ViewHandle> {
        let mut registry = self.registry.lock();
        if !registry.images.contains_key(&image.0) {
            return Err(BundleError::Gpu(format!("unknown image {image:?}")));
        }
        let id = self.next_id();
        registry.views.insert(
            id,
            ViewRecord {
                image,
                base_array_layer: range.base_array_layer,
                opaque_alpha: swizzle == Swizzle::OpaqueAlpha,
            },
        );
        Ok(ViewHandle(id))
    }

    fn create_sampler(&self, address_mode: AddressMode) -> BundleResult<SamplerHandle> {
        let id = self.next_id();
        self.registry.lock().samplers.insert(id, address_mode);
        Ok(SamplerHandle(id))
    }

    fn transition_to_shader_read(&self, _images: &[ImageHandle]) -> BundleResult<()> {
        Ok(())
    }

    fn create_semaphore(&self) -> BundleResult<(SemaphoreHandle, OwnedFd)> {
        let id = self.next_id();
        let timeline = Arc::new(Timeline::new());
        // The exported handle is a placeholder token; headless timelines are
        // only shared in-process.
        let token = self.backing("setsuna-headless-sync", 8)?;
        self.registry.lock().semaphores.insert(id, timeline);
        Ok((
            SemaphoreHandle(id),
            token
                .into(),
        ))
    }

    fn signal_semaphore(&self, semaphore: SemaphoreHandle, value: u64) -> BundleResult<()> {
        let timeline = self
            .registry
            .lock()
            .semaphores
            .get(&semaphore.0)
            .cloned()
            .ok_or_else(|| BundleError::Gpu(format!("unknown semaphore {semaphore:?}")))?;
        timeline.signal(value);
        Ok(())
    }

    fn wait_semaphore(
        &self,
        semaphore: SemaphoreHandle,
        value: u64,
        timeout_ns: u64,
    ) -> BundleResult<()> {
        let timeline = self
            .registry
            .lock()
            .semaphores
            .get(&semaphore.0)
            .cloned()
            .ok_or_else(|| BundleError::Gpu(format!("unknown semaphore {semaphore:?}")))?;
        timeline.wait(value, Duration::from_nanos(timeout_ns))
    }

    fn import_fence(&self, handle: OwnedFd) -> BundleResult<FenceHandle> {
        let id = self.next_id();
        self.registry.lock().fences.insert(id, handle);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout_ns: u64) -> BundleResult<()> {
        // Headless submissions complete synchronously, so an imported fence
        // is always already signaled.
        if self.registry.lock().fences.contains_key(&fence.0) {
            Ok(())
        } else {
            Err(BundleError::Gpu(format!("unknown fence {fence:?}")))
        }
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.registry.lock().images.remove(&image.0);
    }

    fn destroy_view(&self, view: ViewHandle) {
        self.registry.lock().views.remove(&view.0);
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.registry.lock().samplers.remove(&sampler.0);
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.registry.lock().semaphores.remove(&semaphore.0);
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.registry.lock().fences.remove(&fence.0);
    }

    fn wait_idle(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_images_export_real_fds() {
        let bundle = HeadlessBundle::new();
        let info = ImageCreateInfo {
            width: 8,
            height: 8,
            array_layers: 1,
            mip_count: 1,
            face_count: 1,
            format: ImageFormat::Rgba8Unorm,
            protected: false,
            exportable: true,
        };
        let images = bundle.allocate_images(&info, 2).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].size, 8 * 8 * 4);

        let fd = bundle.export_image(images[0].handle).unwrap();
        let file = File::from(fd);
        assert_eq!(file.metadata().unwrap().len(), 8 * 8 * 4);
    }

    #[test]
    fn timeline_wait_times_out_then_succeeds() {
        let bundle = HeadlessBundle::new();
        let (sem, _token) = bundle.create_semaphore().unwrap();

        match bundle.wait_semaphore(sem, 5, 5_000_000) {
            Err(BundleError::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }

        bundle.signal_semaphore(sem, 5).unwrap();
        bundle.wait_semaphore(sem, 5, 1_000_000).unwrap();
        assert_eq!(bundle.semaphore_value(sem), Some(5));
    }

    #[test]
    fn destroy_removes_registry_entries() {
        let bundle = HeadlessBundle::new();
        let info = ImageCreateInfo {
            width: 4,
            height: 4,
            array_layers: 2,
            mip_count: 1,
            face_count: 1,
            format: ImageFormat::Rgba8Srgb,
            protected: false,
            exportable: false,
        };
        let images = bundle.allocate_images(&info, 1).unwrap();
        let view = bundle
            .create_view(
                images[0].handle,
                SubresourceRange {
                    base_array_layer: 1,
                    layer_count: 1,
                    base_mip: 0,
                    mip_count: 1,
                },
                Swizzle::OpaqueAlpha,
            )
            .unwrap();
        assert_eq!(
            bundle.view_record(view).unwrap(),
            ViewRecord {
                image: images[0].handle,
                base_array_layer: 1,
                opaque_alpha: true,
            }
        );

        bundle.destroy_view(view);
        bundle.destroy_image(images[0].handle);
        assert_eq!(bundle.live_counts(), (0, 0, 0));
    }
}
