//! Vulkan back-end for the graphics bundle.
//!
//! Headless: the runtime owns no window or surface; images live in
//! exportable device memory and cross the IPC boundary as opaque fds. The
//! instance/device split follows the usual shape: a cheap `Instance`, a
//! refcounted `DeviceShared` holding the raw device plus the allocator, and
//! the [`bundle::VulkanBundle`] front-end implementing the trait.

use std::{
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
    sync::Arc,
};

use anyhow::Result;
use ash::{ext::debug_utils, khr};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;

pub mod bundle;

pub use ash::vk;
pub use bundle::VulkanBundle;

pub(crate) struct Instance {
    /// Keeps the loader alive for the lifetime of the instance.
    _entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    debug_utils: debug_utils::Instance,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    fn new() -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new("setsuna").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_3);

        let extension_names = [debug_utils::NAME.as_ptr()];
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback));

        let debug_utils = debug_utils::Instance::new(&entry, &raw);
        let debug_utils_messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_utils_info, None)? };

        Ok(Self {
            _entry: entry,
            raw,
            debug_utils,
            debug_utils_messenger,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Vulkan instance dropped");
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vk] {message:?}");
    } else {
        log::debug!("[vk] {message:?}");
    }
    vk::FALSE
}

struct PhysicalDevice {
    raw: vk::PhysicalDevice,
    name: String,
    device_type: vk::PhysicalDeviceType,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    graphics_family_index: u32,
}

impl PhysicalDevice {
    fn enumerate(instance: &Instance) -> Result<Vec<Self>> {
        let raw_devices = unsafe { instance.raw.enumerate_physical_devices()? };
        raw_devices
            .into_iter()
            .filter_map(|raw| {
                let properties = unsafe { instance.raw.get_physical_device_properties(raw) };
                let name = unsafe {
                    CStr::from_ptr(properties.device_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                };
                let memory_properties =
                    unsafe { instance.raw.get_physical_device_memory_properties(raw) };

                let families = unsafe {
                    instance
                        .raw
                        .get_physical_device_queue_family_properties(raw)
                };
                let graphics_family_index = families.iter().position(|family| {
                    family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                })? as u32;

                Some(Ok(Self {
                    raw,
                    name,
                    device_type: properties.device_type,
                    memory_properties,
                    graphics_family_index,
                }))
            })
            .collect()
    }
}

/// Prefers a discrete GPU, falls back to whatever the host has.
fn select_physical_device(devices: Vec<PhysicalDevice>) -> Result<PhysicalDevice> {
    let mut devices = devices;
    if let Some(index) = devices
        .iter()
        .position(|device| device.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
    {
        return Ok(devices.swap_remove(index));
    }
    devices
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no Vulkan physical device found"))
}

pub(crate) struct DeviceShared {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,
    pub(crate) external_memory_fd: khr::external_memory_fd::Device,
    pub(crate) external_semaphore_fd: khr::external_semaphore_fd::Device,
    pub(crate) external_fence_fd: khr::external_fence_fd::Device,
    pub(crate) queue: vk::Queue,
    pub(crate) graphics_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) physical: vk::PhysicalDevice,
    instance: Instance,
}

impl DeviceShared {
    pub(crate) fn new() -> Result<Arc<Self>> {
        let instance = Instance::new()?;
        let physical = select_physical_device(PhysicalDevice::enumerate(&instance)?)?;
        log::info!("Vulkan device: {}", physical.name);

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical.graphics_family_index)
            .queue_priorities(&queue_priorities)];

        let extension_names = [
            khr::external_memory_fd::NAME.as_ptr(),
            khr::external_semaphore_fd::NAME.as_ptr(),
            khr::external_fence_fd::NAME.as_ptr(),
        ];

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true);
        let mut vulkan13_features =
            vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut vulkan12_features)
            .push_next(&mut vulkan13_features);

        let raw = unsafe {
            instance
                .raw
                .create_device(physical.raw, &device_create_info, None)?
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })?;

        let queue = unsafe { raw.get_device_queue(physical.graphics_family_index, 0) };
        let external_memory_fd = khr::external_memory_fd::Device::new(&instance.raw, &raw);
        let external_semaphore_fd = khr::external_semaphore_fd::Device::new(&instance.raw, &raw);
        let external_fence_fd = khr::external_fence_fd::Device::new(&instance.raw, &raw);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            raw,
            external_memory_fd,
            external_semaphore_fd,
            external_fence_fd,
            queue,
            graphics_family_index: physical.graphics_family_index,
            memory_properties: physical.memory_properties,
            physical: physical.raw,
            instance,
        }))
    }

    /// First device-local memory type matching the requirement bits.
    pub(crate) fn device_local_memory_type(
        &self,
        requirements: &vk::MemoryRequirements,
    ) -> Result<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .position(|(index, memory_type)| {
                requirements.memory_type_bits & (1 << index) != 0
                    && memory_type
                        .property_flags
                        .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .map(|index| index as u32)
            .ok_or_else(|| anyhow::anyhow!("no device-local memory type matches"))
    }

    pub(crate) fn instance_raw(&self) -> &ash::Instance {
        &self.instance.raw
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        log::trace!("Vulkan logical device dropped");
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}
