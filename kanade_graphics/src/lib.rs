use std::{
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
};

use anyhow::Result;
use ash::ext::debug_utils;
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

pub mod command;
pub mod descriptor;
pub mod device;
pub mod encoder;
pub mod finalizer;
pub mod graph;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod resource;
pub mod shader;
pub mod submission;
pub mod swapchain;
pub mod sync;

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use raw_window_handle;

pub use command::{CommandBuffer, CommandBufferDescriptor};
pub use descriptor::{ResourceSet, ResourceSetWritability};
pub use device::{Device, DeviceDescriptor};
pub use encoder::{ComputeEncoder, RenderEncoder, TransferEncoder};
pub use graph::{RenderGraph, RenderGraphDescriptor, RenderGraphUsage};
pub use pipeline::{
    ComputePipeline, ComputePipelineDescriptor, GraphicsPipeline, GraphicsPipelineDescriptor,
};
pub use queue::Workload;
pub use render_pass::{
    AttachmentInitialization, ColorAttachmentDescriptor, DepthAttachmentDescriptor, Framebuffer,
    FramebufferAttachment, FramebufferDescriptor, RenderPass, RenderPassDescriptor,
};
pub use resource::{Buffer, BufferDescriptor, Texture, TextureDescriptor};
pub use shader::{ReflectionElement, ResourceKind, ShaderModule, ShaderModuleDescriptor, ShaderStage};
pub use swapchain::{RenderContext, RenderContextDescriptor};

/// Upper bound on concurrently in-flight frames. The actual count is
/// configured per device through [`DeviceDescriptor::frame_buffer_count`].
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

pub(crate) struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    pub(crate) surface_functions: ash::khr::surface::Instance,
    debug_utils: debug_utils::Instance,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    fn new(
        display_handle: RawDisplayHandle,
        application_name: &str,
        application_version: u32,
    ) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(application_name)?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .application_version(application_version)
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        extension_names.push(debug_utils::NAME.as_ptr());

        let layer_strings = vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()];
        let layer_names: Vec<*const i8> =
            layer_strings.iter().map(|c_str| c_str.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .flags(vk::DebugUtilsMessengerCreateFlagsEXT::empty())
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
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

        let surface_functions = ash::khr::surface::Instance::new(&entry, &raw);

        Ok(Self {
            entry,
            raw,
            surface_functions,
            debug_utils,
            debug_utils_messenger,
        })
    }

    fn get_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|phys_device| PhysicalDevice::new_from_vulkan_handle(&self.raw, phys_device))
            .collect::<Result<_>>()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => "[Verbose]",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "[Warning]",
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "[Error]",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "[Info]",
        _ => "[Unknown]",
    };
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::debug!("[VK Debug]{}{}{:?}", severity, types, message);

    vk::FALSE
}

#[derive(Debug, Clone)]
pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    name: String,
    device_type: vk::PhysicalDeviceType,
    pub(crate) queue_families: Vec<QueueFamily>,
}

impl PhysicalDevice {
    fn new_from_vulkan_handle(instance: &ash::Instance, raw: vk::PhysicalDevice) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("unknown")
                .to_owned()
        };
        let device_type = properties.device_type;

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, properties)| QueueFamily {
                index: index as u32,
                properties,
            })
            .collect();

        Ok(Self {
            raw,
            name,
            device_type,
            queue_families,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamily {
    pub(crate) index: u32,
    properties: vk::QueueFamilyProperties,
}

impl QueueFamily {
    fn supports_graphics(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)
    }

    fn supports_compute(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::COMPUTE)
    }

    fn supports_transfer(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::TRANSFER)
    }
}

/// Queue families selected for the three workload classes. Falls back to
/// sharing the graphics family when no dedicated family exists.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamilySelection {
    pub(crate) graphics: QueueFamily,
    pub(crate) compute: QueueFamily,
    pub(crate) transfer: QueueFamily,
}

impl QueueFamilySelection {
    pub(crate) fn unique_indices(&self) -> Vec<u32> {
        let mut indices = vec![
            self.graphics.index,
            self.compute.index,
            self.transfer.index,
        ];
        indices.sort();
        indices.dedup();
        indices
    }
}

/// Prefers dedicated compute and transfer families. A transfer-only family
/// (no compute bit) is favored for transfer work since those map to DMA
/// engines on discrete hardware.
fn select_queue_families(device: &PhysicalDevice) -> Result<QueueFamilySelection> {
    let mut graphics = None;
    let mut compute = None;
    let mut transfer = None;

    for family in device
        .queue_families
        .iter()
        .filter(|family| family.properties.queue_count > 0)
    {
        if family.supports_graphics() && graphics.is_none() {
            graphics = Some(*family);
        } else if family.supports_compute() && compute.is_none() {
            compute = Some(*family);
        } else if family.supports_transfer() && !family.supports_compute() && transfer.is_none() {
            transfer = Some(*family);
        }
    }

    let graphics =
        graphics.ok_or_else(|| anyhow::anyhow!("No graphics queue family available"))?;

    Ok(QueueFamilySelection {
        graphics,
        compute: compute.unwrap_or(graphics),
        transfer: transfer.or(compute).unwrap_or(graphics),
    })
}

fn select_discrete_gpu(devices: &[PhysicalDevice]) -> Result<PhysicalDevice> {
    let device = devices
        .iter()
        .find(|device| device.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| devices.first())
        .ok_or_else(|| anyhow::anyhow!("No Vulkan physical device found"))?;

    Ok(device.clone())
}

/// Raw logical device state shared by every object the library hands out.
/// Destruction order is field order: the allocator must be dropped before
/// the device, and the device before the instance.
pub(crate) struct DeviceShared {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,
    pub(crate) queue_families: QueueFamilySelection,
    pub(crate) physical_device: PhysicalDevice,
    pub(crate) instance: Instance,
}

impl DeviceShared {
    pub(crate) fn new(
        display_handle: RawDisplayHandle,
        application_name: &str,
        application_version: u32,
    ) -> Result<Self> {
        let instance = Instance::new(display_handle, application_name, application_version)?;

        let physical_devices = instance.get_physical_devices()?;
        let physical_device = select_discrete_gpu(&physical_devices)?;
        let queue_families = select_queue_families(&physical_device)?;

        log::info!("Physical device name: {}", physical_device.name);

        let raw = Self::new_ash_device(&instance, &physical_device, &queue_families)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })?;
        let allocator = Mutex::new(allocator);

        Ok(Self {
            allocator: ManuallyDrop::new(allocator),
            raw,
            queue_families,
            physical_device,
            instance,
        })
    }

    fn new_ash_device(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        queue_families: &QueueFamilySelection,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0f32];

        let queue_create_infos = queue_families
            .unique_indices()
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>();

        let device_extension_strs = ["VK_KHR_swapchain"];
        let device_extension_strs = device_extension_strs
            .iter()
            .map(|str| CString::new(*str))
            .collect::<Result<Vec<_>, _>>()?;
        let device_extension_strs = device_extension_strs
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<_>>();

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .runtime_descriptor_array(true);
        let mut vulkan13_features =
            vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let mut device_features2 = vk::PhysicalDeviceFeatures2::default();
        unsafe {
            instance
                .raw
                .get_physical_device_features2(physical_device.raw, &mut device_features2);
        }
        device_features2 = device_features2
            .push_next(&mut vulkan12_features)
            .push_next(&mut vulkan13_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extension_strs)
            .push_next(&mut device_features2);

        let device = unsafe {
            instance
                .raw
                .create_device(physical_device.raw, &device_create_info, None)?
        };

        Ok(device)
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            log::trace!("Logical device dropped");
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}
