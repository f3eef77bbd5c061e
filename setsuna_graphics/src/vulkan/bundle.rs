//! `GraphicsBundle` implementation on top of the Vulkan device.

use std::{
    collections::HashMap,
    os::fd::{FromRawFd, IntoRawFd, OwnedFd},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use parking_lot::Mutex;

use crate::bundle::{
    AddressMode, AllocatedImage, BundleError, BundleResult, FenceHandle, GraphicsBundle,
    ImageCreateInfo, ImageFormat, ImageHandle, SamplerHandle, SemaphoreHandle, SubresourceRange,
    Swizzle, ViewHandle,
};

use super::DeviceShared;

fn to_vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        ImageFormat::D32Float => vk::Format::D32_SFLOAT,
        ImageFormat::D24UnormS8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

fn format_has_depth(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::D32Float | ImageFormat::D24UnormS8)
}

fn gpu_err(result: vk::Result) -> BundleError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            BundleError::Allocation(result.to_string())
        }
        other => BundleError::Gpu(other.to_string()),
    }
}

enum ImageMemory {
    /// Exportable images need a dedicated allocation the allocator cannot
    /// provide.
    Dedicated(vk::DeviceMemory),
    Managed(Option<Allocation>),
}

struct VulkanImage {
    raw: vk::Image,
    memory: ImageMemory,
    format: ImageFormat,
    size: u64,
}

#[derive(Default)]
struct Registry {
    images: HashMap<u64, VulkanImage>,
    views: HashMap<u64, vk::ImageView>,
    samplers: HashMap<u64, vk::Sampler>,
    semaphores: HashMap<u64, vk::Semaphore>,
    fences: HashMap<u64, vk::Fence>,
}

pub struct VulkanBundle {
    registry: Mutex<Registry>,
    command_pool: Mutex<vk::CommandPool>,
    next_id: AtomicU64,
    shared: Arc<DeviceShared>,
}

impl VulkanBundle {
    pub fn new() -> anyhow::Result<Self> {
        let shared = DeviceShared::new()?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(shared.graphics_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { shared.raw.create_command_pool(&pool_info, None)? };

        Ok(Self {
            registry: Mutex::new(Registry::default()),
            command_pool: Mutex::new(command_pool),
            next_id: AtomicU64::new(1),
            shared,
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn image_usage(format: ImageFormat) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        if format_has_depth(format) {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        usage
    }

    fn create_raw_image(&self, info: &ImageCreateInfo) -> BundleResult<vk::Image> {
        let layer_count = info.array_layers.max(1) * info.face_count.max(1);
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);

        let mut create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(to_vk_format(info.format))
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(info.mip_count.max(1))
            .array_layers(layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(Self::image_usage(info.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if info.exportable {
            create_info = create_info.push_next(&mut external_info);
        }

        unsafe { self.shared.raw.create_image(&create_info, None) }.map_err(gpu_err)
    }

    /// Dedicated, exportable device memory bound to `image`.
    fn allocate_dedicated(
        &self,
        image: vk::Image,
        requirements: &vk::MemoryRequirements,
        import_fd: Option<OwnedFd>,
    ) -> BundleResult<vk::DeviceMemory> {
        let memory_type_index = self
            .shared
            .device_local_memory_type(requirements)
            .map_err(|err| BundleError::Allocation(err.to_string()))?;

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let mut export_info = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);

        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut dedicated_info);
        allocate_info = match import_fd {
            Some(fd) => {
                // The driver takes ownership of the fd on success.
                import_info = import_info.fd(fd.into_raw_fd());
                allocate_info.push_next(&mut import_info)
            }
            None => allocate_info.push_next(&mut export_info),
        };

        unsafe { self.shared.raw.allocate_memory(&allocate_info, None) }.map_err(gpu_err)
    }

    fn bind_and_register(
        &self,
        raw: vk::Image,
        memory: ImageMemory,
        info: &ImageCreateInfo,
        size: u64,
        dedicated: bool,
    ) -> BundleResult<AllocatedImage> {
        let id = self.next_id();
        self.registry.lock().images.insert(
            id,
            VulkanImage {
                raw,
                memory,
                format: info.format,
                size,
            },
        );
        Ok(AllocatedImage {
            handle: ImageHandle(id),
            size,
            uses_dedicated_allocation: dedicated,
        })
    }

    fn one_shot_submit(
        &self,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> BundleResult<()> {
        let pool = self.command_pool.lock();
        let device = &self.shared.raw;

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer =
            unsafe { device.allocate_command_buffers(&allocate_info) }.map_err(gpu_err)?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(gpu_err)?;
        }
        record(command_buffer);
        unsafe {
            device.end_command_buffer(command_buffer).map_err(gpu_err)?;

            let buffer_info =
                vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer);
            let submit_info = vk::SubmitInfo2::default()
                .command_buffer_infos(std::slice::from_ref(&buffer_info));
            device
                .queue_submit2(
                    self.shared.queue,
                    std::slice::from_ref(&submit_info),
                    vk::Fence::null(),
                )
                .map_err(gpu_err)?;
            device.queue_wait_idle(self.shared.queue).map_err(gpu_err)?;
            device.free_command_buffers(*pool, std::slice::from_ref(&command_buffer));
        }
        Ok(())
    }
}

impl GraphicsBundle for VulkanBundle {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn supports_format(&self, format: ImageFormat) -> bool {
        let properties = unsafe {
            self.shared
                .instance_raw()
                .get_physical_device_format_properties(self.shared.physical, to_vk_format(format))
        };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
    }

    fn supports_protected_content(&self) -> bool {
        false
    }

    fn allocate_images(
        &self,
        info: &ImageCreateInfo,
        count: u32,
    ) -> BundleResult<Vec<AllocatedImage>> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = self.create_raw_image(info)?;
            let requirements = unsafe { self.shared.raw.get_image_memory_requirements(raw) };

            let (memory, dedicated) = if info.exportable {
                let memory = self.allocate_dedicated(raw, &requirements, None)?;
                unsafe { self.shared.raw.bind_image_memory(raw, memory, 0) }
                    .map_err(gpu_err)?;
                (ImageMemory::Dedicated(memory), true)
            } else {
                let allocation = self
                    .shared
                    .allocator
                    .lock()
                    .allocate(&AllocationCreateDesc {
                        name: "swapchain image",
                        requirements,
                        location: MemoryLocation::GpuOnly,
                        linear: false,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|err| BundleError::Allocation(err.to_string()))?;
                unsafe {
                    self.shared
                        .raw
                        .bind_image_memory(raw, allocation.memory(), allocation.offset())
                }
                .map_err(gpu_err)?;
                (ImageMemory::Managed(Some(allocation)), false)
            };

            out.push(self.bind_and_register(raw, memory, info, requirements.size, dedicated)?);
        }
        Ok(out)
    }

    fn import_images(
        &self,
        info: &ImageCreateInfo,
        handles: Vec<OwnedFd>,
    ) -> BundleResult<Vec<AllocatedImage>> {
        let mut out = Vec::with_capacity(handles.len());
        for fd in handles {
            let raw = self.create_raw_image(info)?;
            let requirements = unsafe { self.shared.raw.get_image_memory_requirements(raw) };
            let memory = self.allocate_dedicated(raw, &requirements, Some(fd))?;
            unsafe { self.shared.raw.bind_image_memory(raw, memory, 0) }.map_err(gpu_err)?;
            out.push(self.bind_and_register(
                raw,
                ImageMemory::Dedicated(memory),
                info,
                requirements.size,
                true,
            )?);
        }
        Ok(out)
    }

    fn export_image(&self, image: ImageHandle) -> BundleResult<OwnedFd> {
        let registry = self.registry.lock();
        let entry = registry
            .images
            .get(&image.0)
            .ok_or_else(|| BundleError::Gpu(format!("unknown image {image:?}")))?;
        let memory = match &entry.memory {
            ImageMemory::Dedicated(memory) => *memory,
            ImageMemory::Managed(_) => {
                return Err(BundleError::Gpu(
                    "image was not allocated exportable".into(),
                ))
            }
        };

        let get_info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let raw_fd = unsafe { self.shared.external_memory_fd.get_memory_fd(&get_info) }
            .map_err(gpu_err)?;
        // SAFETY: the driver hands us a fresh fd we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(raw_fd) })
    }

    fn create_view(
        &self,
        image: ImageHandle,
        range: SubresourceRange,
        swizzle: Swizzle,
    ) -> BundleResult<ViewHandle> {
        let mut registry = self.registry.lock();
        let entry = registry
            .images
            .get(&image.0)
            .ok_or_else(|| BundleError::Gpu(format!("unknown image {image:?}")))?;

        let aspect_mask = if format_has_depth(entry.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let components = match swizzle {
            Swizzle::Identity => vk::ComponentMapping::default(),
            Swizzle::OpaqueAlpha => vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::ONE,
            },
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(entry.raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(to_vk_format(entry.format))
            .components(components)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(range.base_mip)
                    .level_count(range.mip_count)
                    .base_array_layer(range.base_array_layer)
                    .layer_count(range.layer_count),
            );
        let raw = unsafe { self.shared.raw.create_image_view(&view_info, None) }
            .map_err(gpu_err)?;

        let id = self.next_id();
        registry.views.insert(id, raw);
        Ok(ViewHandle(id))
    }

    fn create_sampler(&self, address_mode: AddressMode) -> BundleResult<SamplerHandle> {
        let mode = match address_mode {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        };
        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(vk::Filter::LINEAR)
            .mag_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(mode)
            .address_mode_v(mode)
            .address_mode_w(mode)
            .max_lod(vk::LOD_CLAMP_NONE);
        let raw = unsafe { self.shared.raw.create_sampler(&create_info, None) }
            .map_err(gpu_err)?;

        let id = self.next_id();
        self.registry.lock().samplers.insert(id, raw);
        Ok(SamplerHandle(id))
    }

    fn transition_to_shader_read(&self, images: &[ImageHandle]) -> BundleResult<()> {
        let barriers: Vec<vk::ImageMemoryBarrier2> = {
            let registry = self.registry.lock();
            images
                .iter()
                .map(|handle| {
                    let entry = registry
                        .images
                        .get(&handle.0)
                        .ok_or_else(|| BundleError::Gpu(format!("unknown image {handle:?}")))?;
                    let aspect_mask = if format_has_depth(entry.format) {
                        vk::ImageAspectFlags::DEPTH
                    } else {
                        vk::ImageAspectFlags::COLOR
                    };
                    Ok(vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::NONE)
                        .src_access_mask(vk::AccessFlags2::NONE)
                        .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                        .dst_access_mask(vk::AccessFlags2::SHADER_READ)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .image(entry.raw)
                        .subresource_range(
                            vk::ImageSubresourceRange::default()
                                .aspect_mask(aspect_mask)
                                .base_mip_level(0)
                                .level_count(vk::REMAINING_MIP_LEVELS)
                                .base_array_layer(0)
                                .layer_count(vk::REMAINING_ARRAY_LAYERS),
                        ))
                })
                .collect::<BundleResult<_>>()?
        };

        self.one_shot_submit(|command_buffer| {
            let dependency_info =
                vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe {
                self.shared
                    .raw
                    .cmd_pipeline_barrier2(command_buffer, &dependency_info);
            }
        })
    }

    fn create_semaphore(&self) -> BundleResult<(SemaphoreHandle, OwnedFd)> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let mut export_info = vk::ExportSemaphoreCreateInfo::default()
            .handle_types(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
        let create_info = vk::SemaphoreCreateInfo::default()
            .push_next(&mut type_info)
            .push_next(&mut export_info);
        let raw = unsafe { self.shared.raw.create_semaphore(&create_info, None) }
            .map_err(gpu_err)?;

        let get_info = vk::SemaphoreGetFdInfoKHR::default()
            .semaphore(raw)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
        let raw_fd = unsafe {
            self.shared
                .external_semaphore_fd
                .get_semaphore_fd(&get_info)
        }
        .map_err(gpu_err)?;

        let id = self.next_id();
        self.registry.lock().semaphores.insert(id, raw);
        // SAFETY: freshly exported fd, owned by us.
        Ok((SemaphoreHandle(id), unsafe { OwnedFd::from_raw_fd(raw_fd) }))
    }

    fn signal_semaphore(&self, semaphore: SemaphoreHandle, value: u64) -> BundleResult<()> {
        let raw = self
            .registry
            .lock()
            .semaphores
            .get(&semaphore.0)
            .copied()
            .ok_or_else(|| BundleError::Gpu(format!("unknown semaphore {semaphore:?}")))?;
        let signal_info = vk::SemaphoreSignalInfo::default().semaphore(raw).value(value);
        unsafe { self.shared.raw.signal_semaphore(&signal_info) }.map_err(gpu_err)
    }

    fn wait_semaphore(
        &self,
        semaphore: SemaphoreHandle,
        value: u64,
        timeout_ns: u64,
    ) -> BundleResult<()> {
        let raw = self
            .registry
            .lock()
            .semaphores
            .get(&semaphore.0)
            .copied()
            .ok_or_else(|| BundleError::Gpu(format!("unknown semaphore {semaphore:?}")))?;

        let semaphores = [raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.shared.raw.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(BundleError::Timeout),
            Err(other) => Err(gpu_err(other)),
        }
    }

    fn import_fence(&self, handle: OwnedFd) -> BundleResult<FenceHandle> {
        let create_info = vk::FenceCreateInfo::default();
        let raw = unsafe { self.shared.raw.create_fence(&create_info, None) }
            .map_err(gpu_err)?;

        let import_info = vk::ImportFenceFdInfoKHR::default()
            .fence(raw)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .flags(vk::FenceImportFlags::TEMPORARY)
            // The driver takes ownership of the fd on success.
            .fd(handle.into_raw_fd());
        if let Err(result) = unsafe { self.shared.external_fence_fd.import_fence_fd(&import_info) }
        {
            unsafe { self.shared.raw.destroy_fence(raw, None) };
            return Err(gpu_err(result));
        }

        let id = self.next_id();
        self.registry.lock().fences.insert(id, raw);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> BundleResult<()> {
        let raw = self
            .registry
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| BundleError::Gpu(format!("unknown fence {fence:?}")))?;
        match unsafe {
            self.shared
                .raw
                .wait_for_fences(std::slice::from_ref(&raw), true, timeout_ns)
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(BundleError::Timeout),
            Err(other) => Err(gpu_err(other)),
        }
    }

    fn destroy_image(&self, image: ImageHandle) {
        if let Some(mut entry) = self.registry.lock().images.remove(&image.0) {
            unsafe { self.shared.raw.destroy_image(entry.raw, None) };
            match &mut entry.memory {
                ImageMemory::Dedicated(memory) => unsafe {
                    self.shared.raw.free_memory(*memory, None);
                },
                ImageMemory::Managed(allocation) => {
                    if let Some(allocation) = allocation.take() {
                        if let Err(err) = self.shared.allocator.lock().free(allocation) {
                            log::warn!("failed to free image allocation: {err}");
                        }
                    }
                }
            }
            log::trace!("destroyed image of {} bytes", entry.size);
        }
    }

    fn destroy_view(&self, view: ViewHandle) {
        if let Some(raw) = self.registry.lock().views.remove(&view.0) {
            unsafe { self.shared.raw.destroy_image_view(raw, None) };
        }
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        if let Some(raw) = self.registry.lock().samplers.remove(&sampler.0) {
            unsafe { self.shared.raw.destroy_sampler(raw, None) };
        }
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(raw) = self.registry.lock().semaphores.remove(&semaphore.0) {
            // The peer may still have submissions waiting on the exported
            // handle.
            self.wait_idle();
            unsafe { self.shared.raw.destroy_semaphore(raw, None) };
        }
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if let Some(raw) = self.registry.lock().fences.remove(&fence.0) {
            unsafe { self.shared.raw.destroy_fence(raw, None) };
        }
    }

    fn wait_idle(&self) {
        if let Err(result) = unsafe { self.shared.raw.device_wait_idle() } {
            log::warn!("device_wait_idle failed: {result}");
        }
    }
}

impl Drop for VulkanBundle {
    fn drop(&mut self) {
        self.wait_idle();

        let mut registry = self.registry.lock();
        let views: Vec<u64> = registry.views.keys().copied().collect();
        let samplers: Vec<u64> = registry.samplers.keys().copied().collect();
        let images: Vec<u64> = registry.images.keys().copied().collect();
        let semaphores: Vec<u64> = registry.semaphores.keys().copied().collect();
        let fences: Vec<u64> = registry.fences.keys().copied().collect();
        drop(registry);

        for id in views {
            self.destroy_view(ViewHandle(id));
        }
        for id in samplers {
            self.destroy_sampler(SamplerHandle(id));
        }
        for id in images {
            self.destroy_image(ImageHandle(id));
        }
        for id in semaphores {
            self.destroy_semaphore(SemaphoreHandle(id));
        }
        for id in fences {
            self.destroy_fence(FenceHandle(id));
        }

        unsafe {
            self.shared
                .raw
                .destroy_command_pool(*self.command_pool.lock(), None);
        }
    }
}
