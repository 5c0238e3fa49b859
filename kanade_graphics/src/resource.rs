use std::{
    mem::{align_of, size_of, size_of_val},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use crate::{command::create_upload_buffer, device::Device, queue::Workload};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity used as the key in graph read/write sets. Stable
/// for the lifetime of the resource carrying it.
pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct BufferDescriptor {
    pub usage_flags: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
    /// Size in bytes of one element; binding offsets and counts are in
    /// elements, not bytes.
    pub stride: u32,
    pub element_count: u32,
}

impl BufferDescriptor {
    pub fn new(
        usage_flags: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        stride: u32,
        element_count: u32,
    ) -> Self {
        Self {
            usage_flags,
            memory_location,
            stride,
            element_count,
        }
    }

    fn size(&self) -> u64 {
        self.stride as u64 * self.element_count as u64
    }
}

pub struct Buffer {
    id: u64,
    pub(crate) raw: vk::Buffer,
    pub(crate) size: u64,
    stride: u32,
    element_count: u32,
    pub(crate) usage_flags: vk::BufferUsageFlags,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl Buffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Writes to a CPU-visible buffer. Returns an error for GPU-only
    /// memory; use the device upload path for those.
    pub fn write_data<T: Copy>(&self, data: &[T]) -> Result<()> {
        let allocation = self.allocation.as_ref().unwrap();
        let data_ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| anyhow::anyhow!("Buffer memory is not CPU mappable"))?
            .as_ptr();

        unsafe {
            let mut align =
                ash::util::Align::new(data_ptr, align_of::<T>() as _, size_of_val(data) as _);
            align.copy_from_slice(data);
        };

        Ok(())
    }

    pub fn write_data_with_element_offset<T: Copy>(
        &self,
        data: &[T],
        element_offset: u64,
    ) -> Result<()> {
        let allocation = self.allocation.as_ref().unwrap();
        let data_ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| anyhow::anyhow!("Buffer memory is not CPU mappable"))?
            .as_ptr();

        unsafe {
            let data_ptr = data_ptr.add(element_offset as usize * size_of::<T>());
            let mut align =
                ash::util::Align::new(data_ptr, align_of::<T>() as _, size_of_val(data) as _);
            align.copy_from_slice(data);
        };

        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let raw = self.raw;
        let allocation = self.allocation.take().unwrap();
        let shared = self.device.shared.clone();
        self.device.finalizer.push(
            move || unsafe {
                shared.raw.destroy_buffer(raw, None);
                let _ = shared.allocator.lock().free(allocation);
            },
            "Buffer free",
        );
    }
}

pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,

    pub array_layer_count: u32,
    pub mip_level_count: u32,

    pub format: vk::Format,
    pub image_type: vk::ImageType,
    pub usage_flags: vk::ImageUsageFlags,

    pub memory_location: MemoryLocation,
}

impl TextureDescriptor {
    pub fn new_2d_single_layer_level(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            depth: 1,
            array_layer_count: 1,
            mip_level_count: 1,
            format,
            image_type: vk::ImageType::TYPE_2D,
            usage_flags: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            memory_location: MemoryLocation::GpuOnly,
        }
    }
}

pub struct Texture {
    id: u64,
    pub(crate) raw: vk::Image,
    pub(crate) raw_view: vk::ImageView,
    pub(crate) raw_sampler: vk::Sampler,
    allocation: Option<Allocation>,

    pub(crate) extent: vk::Extent3D,
    array_layer_count: u32,
    mip_level_count: u32,
    pub format: vk::Format,
    pub(crate) usage_flags: vk::ImageUsageFlags,

    ready: Arc<AtomicBool>,
    device: Arc<Device>,
}

impl Texture {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn array_layer_count(&self) -> u32 {
        self.array_layer_count
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    /// Whether an asynchronous upload has completed. Binding a not-ready
    /// texture is allowed; rendering with it must gate on this.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(self.mip_level_count)
            .base_array_layer(0)
            .layer_count(self.array_layer_count)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let raw = self.raw;
        let raw_view = self.raw_view;
        let raw_sampler = self.raw_sampler;
        let allocation = self.allocation.take().unwrap();
        let shared = self.device.shared.clone();
        self.device.finalizer.push(
            move || unsafe {
                shared.raw.destroy_sampler(raw_sampler, None);
                shared.raw.destroy_image_view(raw_view, None);
                shared.raw.destroy_image(raw, None);
                let _ = shared.allocator.lock().free(allocation);
            },
            "Texture free",
        );
    }
}

/// Fills mip levels `1..N` by blitting each level from the one above it.
/// Expects the whole image in transfer-dst layout with the base level
/// populated; leaves each blitted-from level in transfer-src layout and the
/// last level in transfer-dst.
fn record_mip_generation(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    extent: vk::Extent3D,
    mip_level_count: u32,
    layer_count: u32,
) {
    let mut src_width = extent.width as i32;
    let mut src_height = extent.height as i32;
    let mut src_depth = extent.depth as i32;

    for level in 1..mip_level_count {
        let source_to_read = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::BLIT)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(level - 1)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(layer_count),
            )
            .image(image);
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&source_to_read));
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };

        let dst_width = (src_width / 2).max(1);
        let dst_height = (src_height / 2).max(1);
        let dst_depth = (src_depth / 2).max(1);

        let blit = vk::ImageBlit2::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(level - 1)
                    .base_array_layer(0)
                    .layer_count(layer_count),
            )
            .src_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src_width,
                    y: src_height,
                    z: src_depth,
                },
            ])
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(level)
                    .base_array_layer(0)
                    .layer_count(layer_count),
            )
            .dst_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst_width,
                    y: dst_height,
                    z: dst_depth,
                },
            ]);
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(image)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(image)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(std::slice::from_ref(&blit))
            .filter(vk::Filter::LINEAR);
        unsafe { device.cmd_blit_image2(cmd, &blit_info) };

        src_width = dst_width;
        src_height = dst_height;
        src_depth = dst_depth;
    }
}

fn vulkan_image_type_to_view_type(image_type: vk::ImageType) -> vk::ImageViewType {
    match image_type {
        vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
        vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
        _ => vk::ImageViewType::TYPE_2D,
    }
}

fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D16_UNORM
    )
}

impl Device {
    pub fn create_buffer(self: &Arc<Self>, desc: BufferDescriptor) -> Result<Buffer> {
        let size = desc.size();
        let create_info = vk::BufferCreateInfo::default().size(size).usage(
            desc.usage_flags
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        );

        let raw;
        let requirements;
        unsafe {
            raw = self.shared.raw.create_buffer(&create_info, None)?;
            requirements = self.shared.raw.get_buffer_memory_requirements(raw);
        }

        let allocation = self
            .shared
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements,
                location: desc.memory_location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;

        unsafe {
            self.shared
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }

        Ok(Buffer {
            id: next_resource_id(),
            raw,
            size,
            stride: desc.stride,
            element_count: desc.element_count,
            usage_flags: desc.usage_flags,
            allocation: Some(allocation),
            device: self.clone(),
        })
    }

    pub fn create_texture(self: &Arc<Self>, desc: TextureDescriptor) -> Result<Texture> {
        let usage_flags = desc.usage_flags
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        };

        let create_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(extent)
            .mip_levels(desc.mip_level_count)
            .array_layers(desc.array_layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { self.shared.raw.create_image(&create_info, None)? };
        let requirements = unsafe { self.shared.raw.get_image_memory_requirements(raw) };

        let allocation = self
            .shared
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "texture",
                requirements,
                location: desc.memory_location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;
        unsafe {
            self.shared
                .raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
        };

        let mut aspect_flags = vk::ImageAspectFlags::empty();
        if format_has_depth(desc.format) {
            aspect_flags |= vk::ImageAspectFlags::DEPTH;
        } else {
            aspect_flags |= vk::ImageAspectFlags::COLOR;
        }
        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_flags)
            .base_mip_level(0)
            .level_count(desc.mip_level_count)
            .base_array_layer(0)
            .layer_count(desc.array_layer_count);
        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(vulkan_image_type_to_view_type(desc.image_type))
            .format(desc.format)
            .subresource_range(subresource_range);
        let raw_view = unsafe { self.shared.raw.create_image_view(&view_create_info, None)? };

        let sampler_info = vk::SamplerCreateInfo::default()
            .min_filter(vk::Filter::LINEAR)
            .mag_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .min_lod(0.0)
            .max_lod(desc.mip_level_count as f32);
        let raw_sampler = unsafe { self.shared.raw.create_sampler(&sampler_info, None)? };

        Ok(Texture {
            id: next_resource_id(),
            raw,
            raw_view,
            raw_sampler,
            allocation: Some(allocation),
            extent,
            array_layer_count: desc.array_layer_count,
            mip_level_count: desc.mip_level_count,
            format: desc.format,
            usage_flags,
            ready: Arc::new(AtomicBool::new(true)),
            device: self.clone(),
        })
    }

    /// Copies `data` into a GPU-only buffer through a staging buffer,
    /// blocking until the transfer completes.
    pub fn upload_data_to_buffer<T: Copy>(
        self: &Arc<Self>,
        buffer: &Buffer,
        data: &[T],
    ) -> Result<()> {
        let staging = self.create_staging_buffer(data)?;

        let family_index = self.queues.family_index(Workload::Transfer);
        let (pool, command_buffer) = create_upload_buffer(&self.shared, family_index)?;

        self.record_upload(command_buffer, |device, cmd| {
            let region = vk::BufferCopy2::default().size(staging.size);
            let info = vk::CopyBufferInfo2::default()
                .src_buffer(staging.raw)
                .dst_buffer(buffer.raw)
                .regions(std::slice::from_ref(&region));
            unsafe { device.cmd_copy_buffer2(cmd, &info) };
        })?;

        self.queues
            .execute_command(&self.shared, Workload::Transfer, command_buffer)?;

        unsafe { self.shared.raw.destroy_command_pool(pool, None) };
        Ok(())
    }

    /// Copies `data` into the texture through a staging buffer, blocking
    /// until the upload and layout transitions complete.
    pub fn upload_data_to_texture<T: Copy>(
        self: &Arc<Self>,
        texture: &Texture,
        data: &[T],
    ) -> Result<()> {
        let staging = self.create_staging_buffer(data)?;

        let family_index = self.queues.family_index(Workload::Graphics);
        let (pool, command_buffer) = create_upload_buffer(&self.shared, family_index)?;
        self.record_texture_upload(command_buffer, texture, staging.raw)?;

        self.queues
            .execute_command(&self.shared, Workload::Graphics, command_buffer)?;

        unsafe { self.shared.raw.destroy_command_pool(pool, None) };
        Ok(())
    }

    /// Asynchronous variant of [`Device::upload_data_to_texture`]. The
    /// texture reads as not-ready until the GPU finishes; `callback` fires
    /// from the frame driver after completion.
    pub fn upload_data_to_texture_async<T: Copy>(
        self: &Arc<Self>,
        texture: &Texture,
        data: &[T],
        callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        texture.ready.store(false, Ordering::Release);

        let staging = self.create_staging_buffer(data)?;

        let family_index = self.queues.family_index(Workload::Graphics);
        let (pool, command_buffer) = create_upload_buffer(&self.shared, family_index)?;
        self.record_texture_upload(command_buffer, texture, staging.raw)?;

        let ready = texture.ready.clone();
        let shared = self.shared.clone();
        let completion: Box<dyn FnOnce() + Send + 'static> = Box::new(move || {
            // Staging buffer and transient pool live until the GPU is done.
            drop(staging);
            unsafe { shared.raw.destroy_command_pool(pool, None) };
            ready.store(true, Ordering::Release);
            if let Some(callback) = callback {
                callback();
            }
        });

        self.queues.push_command(
            &self.shared,
            Workload::Graphics,
            command_buffer,
            Some(completion),
        )?;

        Ok(())
    }

    fn create_staging_buffer<T: Copy>(self: &Arc<Self>, data: &[T]) -> Result<Buffer> {
        let staging = self.create_buffer(BufferDescriptor {
            usage_flags: vk::BufferUsageFlags::TRANSFER_SRC,
            memory_location: MemoryLocation::CpuToGpu,
            stride: size_of::<T>() as u32,
            element_count: data.len() as u32,
        })?;
        staging.write_data(data)?;
        Ok(staging)
    }

    fn record_upload(
        &self,
        command_buffer: vk::CommandBuffer,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.shared
                .raw
                .begin_command_buffer(command_buffer, &begin_info)?;
        }

        record(&self.shared.raw, command_buffer);

        unsafe { self.shared.raw.end_command_buffer(command_buffer)? };
        Ok(())
    }

    /// Records the staging copy into the base mip level, the blit cascade
    /// that fills the remaining levels, and the final transition of the
    /// whole chain to shader-read layout. Uploads run on the graphics
    /// queue, which the blits require.
    fn record_texture_upload(
        &self,
        command_buffer: vk::CommandBuffer,
        texture: &Texture,
        staging: vk::Buffer,
    ) -> Result<()> {
        let subresource_range = texture.subresource_range();
        let extent = texture.extent;
        let raw_image = texture.raw;
        let layer_count = texture.array_layer_count;
        let mip_level_count = texture.mip_level_count;

        self.record_upload(command_buffer, |device, cmd| {
            let to_transfer = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::NONE)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .subresource_range(subresource_range)
                .image(raw_image);
            let dependency_info = vk::DependencyInfo::default()
                .image_memory_barriers(std::slice::from_ref(&to_transfer));
            unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };

            let region = vk::BufferImageCopy2::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(layer_count),
                )
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(extent);
            let copy_info = vk::CopyBufferToImageInfo2::default()
                .src_buffer(staging)
                .dst_image(raw_image)
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .regions(std::slice::from_ref(&region));
            unsafe { device.cmd_copy_buffer_to_image2(cmd, &copy_info) };

            if mip_level_count > 1 {
                record_mip_generation(device, cmd, raw_image, extent, mip_level_count, layer_count);

                // After the cascade, levels 0..N-1 sit in transfer-src
                // layout and the last level in transfer-dst.
                let blitted_levels = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                    .src_access_mask(
                        vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE,
                    )
                    .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                    .dst_access_mask(vk::AccessFlags2::SHADER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(mip_level_count - 1)
                            .base_array_layer(0)
                            .layer_count(layer_count),
                    )
                    .image(raw_image);
                let last_level = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                    .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                    .dst_access_mask(vk::AccessFlags2::SHADER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(mip_level_count - 1)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(layer_count),
                    )
                    .image(raw_image);
                let barriers = [blitted_levels, last_level];
                let dependency_info =
                    vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
            } else {
                let to_shader_read = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                    .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                    .dst_access_mask(vk::AccessFlags2::SHADER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .subresource_range(subresource_range)
                    .image(raw_image);
                let dependency_info = vk::DependencyInfo::default()
                    .image_memory_barriers(std::slice::from_ref(&to_shader_read));
                unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
            }
        })
    }
}
