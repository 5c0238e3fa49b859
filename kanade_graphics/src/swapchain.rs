use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use ash::{khr, vk};
use parking_lot::Mutex;

use crate::{
    command::{CommandBuffer, CommandBufferDescriptor, CommandBufferSync, RecordingState},
    device::Device,
    encoder::RenderEncoder,
    render_pass::{
        AttachmentInitialization, ColorAttachmentDescriptor, Framebuffer, FramebufferAttachment,
        FramebufferDescriptor, RenderPass, RenderPassDescriptor,
    },
    resource::next_resource_id,
};

pub(crate) struct Swapchain {
    raw_ash: khr::swapchain::Device,
    raw_vulkan: vk::SwapchainKHR,
    images_raw: Vec<vk::Image>,
    image_views_raw: Vec<vk::ImageView>,
    pub(crate) image_index: u32,
    pub(crate) surface_format: vk::SurfaceFormatKHR,
    pub(crate) extent: vk::Extent2D,
    surface: vk::SurfaceKHR,
    device: Arc<Device>,
}

impl Swapchain {
    fn new(
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        requested_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let shared = &device.shared;
        let surface_functions = &shared.instance.surface_functions;
        let physical_device = shared.physical_device.raw;

        let surface_format = {
            let formats = unsafe {
                surface_functions.get_physical_device_surface_formats(physical_device, surface)?
            };

            *formats
                .iter()
                .find(|format| {
                    format.format == vk::Format::B8G8R8A8_UNORM
                        && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .unwrap_or(
                    formats
                        .first()
                        .ok_or_else(|| anyhow::anyhow!("Surface reports no formats"))?,
                )
        };

        let present_mode = {
            let present_modes = unsafe {
                surface_functions
                    .get_physical_device_surface_present_modes(physical_device, surface)?
            };

            if present_modes.contains(&requested_present_mode) {
                requested_present_mode
            } else {
                vk::PresentModeKHR::FIFO
            }
        };

        let capabilities = unsafe {
            surface_functions
                .get_physical_device_surface_capabilities(physical_device, surface)?
        };

        let extent = {
            if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                capabilities.max_image_extent
            }
        };

        let image_count = capabilities
            .max_image_count
            .min(capabilities.min_image_count + 1);

        log::debug!("Swapchain extent: {} X {}", extent.width, extent.height);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .present_mode(present_mode);

        let raw_ash = khr::swapchain::Device::new(&shared.instance.raw, &shared.raw);
        let raw_vulkan = unsafe { raw_ash.create_swapchain(&create_info, None)? };

        let images_raw = unsafe { raw_ash.get_swapchain_images(raw_vulkan)? };
        let image_views_raw = images_raw
            .iter()
            .map(|image| {
                let image_view_info = vk::ImageViewCreateInfo::default()
                    .image(*image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );

                Ok(unsafe { shared.raw.create_image_view(&image_view_info, None)? })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw_ash,
            raw_vulkan,
            images_raw,
            image_views_raw,
            image_index: 0,
            surface_format,
            extent,
            surface,
            device,
        })
    }

    fn acquire_next_image(&mut self, signal_semaphore: vk::Semaphore) -> Result<(u32, bool)> {
        let (image_index, is_suboptimal) = unsafe {
            self.raw_ash.acquire_next_image(
                self.raw_vulkan,
                u64::MAX - 1,
                signal_semaphore,
                vk::Fence::null(),
            )?
        };
        self.image_index = image_index;
        Ok((image_index, is_suboptimal))
    }

    /// Returns whether the swapchain is suboptimal for the surface.
    fn queue_present(&self, queue: vk::Queue, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        let swapchains = [self.raw_vulkan];
        let image_indices = [self.image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.raw_ash
                .queue_present(queue, &present_info)
                .with_context(|| "Failed swapchain queue present!")?
        };

        Ok(result)
    }

    fn image_count(&self) -> usize {
        self.images_raw.len()
    }

    fn image_view(&self, index: usize) -> vk::ImageView {
        self.image_views_raw[index]
    }

    fn recreate(&mut self) -> Result<()> {
        self.destroy();
        log::debug!("Recreating swapchain...");
        let new_swapchain = Self::new(self.device.clone(), self.surface, vk::PresentModeKHR::FIFO)?;
        *self = new_swapchain;
        log::debug!("Done recreating swapchain.");
        Ok(())
    }

    // Destroys the raw swapchain objects but leaves the structure usable
    // for recreation.
    fn destroy(&mut self) {
        if !self.image_views_raw.is_empty() {
            unsafe {
                for image_view in self.image_views_raw.drain(..) {
                    self.device.shared.raw.destroy_image_view(image_view, None);
                }

                self.raw_ash.destroy_swapchain(self.raw_vulkan, None);
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub struct RenderContextDescriptor {
    pub window_handle: raw_window_handle::RawWindowHandle,
    pub display_handle: raw_window_handle::RawDisplayHandle,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
}

/// What the graph planner needs from a presenting context.
pub(crate) struct ContextGraphSource {
    pub(crate) id: u64,
    pub(crate) recording: Arc<Mutex<RecordingState>>,
    pub(crate) sync: Arc<CommandBufferSync>,
    pub(crate) swapchain_resource_id: u64,
    pub(crate) image_available: Vec<vk::Semaphore>,
    pub(crate) render_complete: Vec<vk::Semaphore>,
}

/// A windowed presentation target: surface, swapchain, the per-frame
/// image-available / render-complete binary semaphore pairs, one
/// framebuffer per swapchain image, and the command buffer that renders
/// into them.
pub struct RenderContext {
    device: Arc<Device>,
    surface: vk::SurfaceKHR,
    swapchain: Mutex<Swapchain>,
    render_pass: Arc<RenderPass>,
    framebuffers: Vec<Arc<Framebuffer>>,
    command_buffer: CommandBuffer,
    image_available: Vec<vk::Semaphore>,
    render_complete: Vec<vk::Semaphore>,
    swapchain_resource_id: u64,
    clear_color: [f32; 4],
    last_acquire_frame: u64,
    pub(crate) last_encoding_frame: AtomicU64,
    pub(crate) last_present_frame: AtomicU64,
}

impl RenderContext {
    pub fn new(device: &Arc<Device>, descriptor: RenderContextDescriptor) -> Result<Self> {
        let surface = unsafe {
            ash_window::create_surface(
                &device.shared.instance.entry,
                &device.shared.instance.raw,
                descriptor.display_handle,
                descriptor.window_handle,
                None,
            )?
        };

        let graphics_family = device.shared.queue_families.graphics.index;
        let supports_present = unsafe {
            device
                .shared
                .instance
                .surface_functions
                .get_physical_device_surface_support(
                    device.shared.physical_device.raw,
                    graphics_family,
                    surface,
                )?
        };
        if !supports_present {
            return Err(anyhow::anyhow!(
                "Graphics queue family does not support presentation to this surface"
            ));
        }

        let swapchain = Swapchain::new(device.clone(), surface, descriptor.present_mode)?;
        let swapchain_resource_id = next_resource_id();

        let render_pass = Arc::new(device.create_render_pass(RenderPassDescriptor {
            color_attachments: vec![ColorAttachmentDescriptor {
                format: swapchain.surface_format.format,
                initialization: AttachmentInitialization::Clear,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            }],
            depth_attachment: None,
        })?);

        let framebuffers = Self::create_framebuffers(
            device,
            &swapchain,
            &render_pass,
            swapchain_resource_id,
            descriptor.clear_color,
        )?;

        let frame_slot_count = device.frame_buffer_count();
        let image_available = (0..frame_slot_count)
            .map(|_| crate::sync::create_binary_semaphore(&device.shared.raw))
            .collect::<Result<Vec<_>>>()?;
        let render_complete = (0..frame_slot_count)
            .map(|_| crate::sync::create_binary_semaphore(&device.shared.raw))
            .collect::<Result<Vec<_>>>()?;

        let command_buffer = CommandBuffer::new(
            device,
            CommandBufferDescriptor {
                frame_restricted: true,
                debug_name: String::from("render context"),
            },
        )?;

        Ok(Self {
            device: device.clone(),
            surface,
            swapchain: Mutex::new(swapchain),
            render_pass,
            framebuffers,
            command_buffer,
            image_available,
            render_complete,
            swapchain_resource_id,
            clear_color: descriptor.clear_color,
            last_acquire_frame: 0,
            last_encoding_frame: AtomicU64::new(0),
            last_present_frame: AtomicU64::new(0),
        })
    }

    fn create_framebuffers(
        device: &Arc<Device>,
        swapchain: &Swapchain,
        render_pass: &Arc<RenderPass>,
        swapchain_resource_id: u64,
        clear_color: [f32; 4],
    ) -> Result<Vec<Arc<Framebuffer>>> {
        (0..swapchain.image_count())
            .map(|index| {
                let attachment = FramebufferAttachment::from_raw_view(
                    swapchain.image_view(index),
                    swapchain_resource_id,
                    vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color,
                        },
                    },
                );
                Ok(Arc::new(device.create_framebuffer(FramebufferDescriptor {
                    render_pass: render_pass.clone(),
                    attachments: vec![attachment],
                    width: swapchain.extent.width,
                    height: swapchain.extent.height,
                })?))
            })
            .collect()
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.lock().extent
    }

    pub fn color_format(&self) -> vk::Format {
        self.swapchain.lock().surface_format.format
    }

    /// Begins the context's render encoder for this frame, acquiring the
    /// next swapchain image on first use. Recreates the swapchain when the
    /// acquire reports it out of date.
    pub fn encode_render_commands(&mut self) -> Result<RenderEncoder<'_>> {
        let frame_count = self.device.frame_count();
        let frame_index = self.device.frame_index();

        if self.last_acquire_frame != frame_count {
            let signal = self.image_available[frame_index];
            let recreated = {
                let mut swapchain = self.swapchain.lock();
                match swapchain.acquire_next_image(signal) {
                    Ok((_, false)) => false,
                    Ok((_, true)) | Err(_) => {
                        log::debug!("Failed swapchain acquire next image!");
                        swapchain.recreate()?;
                        swapchain
                            .acquire_next_image(signal)
                            .with_context(|| "Failed acquire after swapchain recreation")?;
                        true
                    }
                }
            };
            if recreated {
                let swapchain = self.swapchain.lock();
                self.framebuffers = Self::create_framebuffers(
                    &self.device,
                    &swapchain,
                    &self.render_pass,
                    self.swapchain_resource_id,
                    self.clear_color,
                )?;
            }
            self.last_acquire_frame = frame_count;
        }

        self.last_encoding_frame.store(frame_count, Ordering::Release);

        let image_index = self.swapchain.lock().image_index as usize;
        let framebuffer = self.framebuffers[image_index].clone();
        self.command_buffer.encode_render_commands(&framebuffer)
    }

    /// Forces a swapchain rebuild, e.g. after a window resize event.
    pub fn update_dimensions(&mut self) -> Result<()> {
        {
            let mut swapchain = self.swapchain.lock();
            swapchain.recreate()?;
        }
        let swapchain = self.swapchain.lock();
        self.framebuffers = Self::create_framebuffers(
            &self.device,
            &swapchain,
            &self.render_pass,
            self.swapchain_resource_id,
            self.clear_color,
        )?;
        Ok(())
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    pub(crate) fn graph_source(&self) -> ContextGraphSource {
        ContextGraphSource {
            id: self.command_buffer.id(),
            recording: self.command_buffer.recording.clone(),
            sync: self.command_buffer.sync.clone(),
            swapchain_resource_id: self.swapchain_resource_id,
            image_available: self.image_available.clone(),
            render_complete: self.render_complete.clone(),
        }
    }

    /// Presents the acquired image, waiting on this frame's render-complete
    /// semaphore. On failure the device is drained and the next acquire
    /// rebuilds the swapchain.
    pub(crate) fn queue_present(&self) -> Result<()> {
        let frame_index = self.device.frame_index();
        let swapchain = self.swapchain.lock();

        let queue = self.device.queues.raw_queue(crate::queue::Workload::Graphics);
        if swapchain
            .queue_present(queue, &[self.render_complete[frame_index]])
            .is_err()
        {
            unsafe {
                self.device.shared.raw.device_wait_idle()?;
            }
        }

        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        // The swapchain itself is destroyed by its own drop before the
        // deferred surface/semaphore destruction runs.
        let surface = self.surface;
        let image_available = std::mem::take(&mut self.image_available);
        let render_complete = std::mem::take(&mut self.render_complete);
        let shared = self.device.shared.clone();
        self.device.finalizer.push(
            move || unsafe {
                for semaphore in image_available.into_iter().chain(render_complete) {
                    shared.raw.destroy_semaphore(semaphore, None);
                }
                shared
                    .instance
                    .surface_functions
                    .destroy_surface(surface, None);
            },
            "RenderContext free",
        );
    }
}
