use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    command::CommandBuffer,
    descriptor::{DescriptorBinder, ResourceSet},
    device::Device,
    pipeline::{ComputePipeline, GraphicsPipeline},
    queue::Workload,
    render_pass::Framebuffer,
    resource::{Buffer, Texture},
};

/// Recording state shared by the typed encoders: the raw buffer for the
/// current frame slot, the descriptor binder, and the pipeline layout the
/// next flush binds against.
struct EncoderState {
    device: Arc<Device>,
    raw: vk::CommandBuffer,
    frame_buffers: Vec<vk::CommandBuffer>,
    binder: DescriptorBinder,
    bound_layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    ended: bool,
}

impl EncoderState {
    fn begin(
        parent: &CommandBuffer,
        frame_buffers: Vec<vk::CommandBuffer>,
        bind_point: vk::PipelineBindPoint,
    ) -> Result<Self> {
        let device = parent.device.clone();
        let raw = frame_buffers[device.frame_index()];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.shared.raw.begin_command_buffer(raw, &begin_info)?;
        }

        Ok(Self {
            device,
            raw,
            frame_buffers,
            binder: DescriptorBinder::new(),
            bound_layout: vk::PipelineLayout::null(),
            bind_point,
            ended: false,
        })
    }

    fn bind_resource_set(&mut self, set: &ResourceSet, set_index: u32) {
        self.binder.bind_resource_set(set, set_index);
    }

    fn update_dynamic_offset(&mut self, set_index: u32, binding_index: u32, offset: u32) {
        self.binder
            .update_dynamic_offset(set_index, binding_index, offset);
    }

    fn flush_resource_set(&mut self, set_index: u32) {
        if self.bound_layout == vk::PipelineLayout::null() {
            log::error!("Cannot flush a resource set before binding a pipeline");
            return;
        }

        if let Some((set, offsets)) = self.binder.take_flush(set_index) {
            unsafe {
                self.device.shared.raw.cmd_bind_descriptor_sets(
                    self.raw,
                    self.bind_point,
                    self.bound_layout,
                    set_index,
                    &[set],
                    offsets,
                );
            }
        }
    }

    /// Draws and dispatches are rejected while any bound set has not been
    /// flushed since the last pipeline bind.
    fn check_flushed(&self, what: &str) -> bool {
        if self.binder.has_dirty_bindings() {
            log::error!("{} with unflushed resource set bindings", what);
            return false;
        }
        true
    }

    fn end(&mut self, parent: &CommandBuffer, workload: Workload) -> Result<()> {
        unsafe {
            self.device.shared.raw.end_command_buffer(self.raw)?;
        }
        self.ended = true;
        parent.push_submission(workload, std::mem::take(&mut self.frame_buffers));
        Ok(())
    }
}

/// Records one graphics submission inside a render pass. Obtained from
/// [`CommandBuffer::encode_render_commands`]; the mutable borrow keeps at
/// most one encoder open per buffer.
pub struct RenderEncoder<'a> {
    parent: &'a mut CommandBuffer,
    state: EncoderState,
}

impl<'a> RenderEncoder<'a> {
    pub(crate) fn begin(
        parent: &'a mut CommandBuffer,
        frame_buffers: Vec<vk::CommandBuffer>,
        framebuffer: Arc<Framebuffer>,
    ) -> Result<Self> {
        let state = EncoderState::begin(parent, frame_buffers, vk::PipelineBindPoint::GRAPHICS)?;

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: framebuffer.width,
                height: framebuffer.height,
            },
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(framebuffer.render_pass.raw)
            .framebuffer(framebuffer.raw)
            .render_area(render_area)
            .clear_values(&framebuffer.clear_values);
        unsafe {
            state.device.shared.raw.cmd_begin_render_pass(
                state.raw,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }

        let mut encoder = Self { parent, state };
        encoder.set_viewport(0, 0, framebuffer.width, framebuffer.height);
        encoder.set_scissor(0, 0, framebuffer.width, framebuffer.height);
        Ok(encoder)
    }

    pub fn bind_pipeline(&mut self, pipeline: &GraphicsPipeline) {
        self.state
            .binder
            .bind_pipeline_data(pipeline.binding_data.clone());
        self.state.bound_layout = pipeline.raw_layout;
        unsafe {
            self.state.device.shared.raw.cmd_bind_pipeline(
                self.state.raw,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw,
            );
        }
    }

    pub fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let viewport = vk::Viewport::default()
            .x(x as f32)
            .y(y as f32)
            .width(width as f32)
            .height(height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        unsafe {
            self.state
                .device
                .shared
                .raw
                .cmd_set_viewport(self.state.raw, 0, &[viewport]);
        }
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, width: u32, height: u32) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.state
                .device
                .shared
                .raw
                .cmd_set_scissor(self.state.raw, 0, &[scissor]);
        }
    }

    pub fn bind_resource_set(&mut self, set: &ResourceSet, set_index: u32) {
        self.state.bind_resource_set(set, set_index);
    }

    pub fn update_dynamic_offset(&mut self, set_index: u32, binding_index: u32, offset: u32) {
        self.state
            .update_dynamic_offset(set_index, binding_index, offset);
    }

    pub fn flush_resource_set(&mut self, set_index: u32) {
        self.state.flush_resource_set(set_index);
    }

    pub fn bind_vertex_buffer(&mut self, buffer: &Buffer) {
        unsafe {
            self.state.device.shared.raw.cmd_bind_vertex_buffers(
                self.state.raw,
                0,
                &[buffer.raw],
                &[0],
            );
        }
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer) {
        unsafe {
            self.state.device.shared.raw.cmd_bind_index_buffer(
                self.state.raw,
                buffer.raw,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    pub fn draw(&mut self, vertex_count: u32, vertex_offset: u32, instance_count: u32) {
        if !self.state.check_flushed("Draw") {
            return;
        }
        unsafe {
            self.state.device.shared.raw.cmd_draw(
                self.state.raw,
                vertex_count,
                instance_count,
                vertex_offset,
                0,
            );
        }
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        index_offset: u32,
        vertex_offset: i32,
        instance_count: u32,
    ) {
        if !self.state.check_flushed("DrawIndexed") {
            return;
        }
        unsafe {
            self.state.device.shared.raw.cmd_draw_indexed(
                self.state.raw,
                index_count,
                instance_count,
                index_offset,
                vertex_offset,
                0,
            );
        }
    }

    pub fn draw_indexed_indirect(
        &mut self,
        indirect_buffer: &Buffer,
        command_offset: u32,
        draw_count: u32,
    ) {
        if !self.state.check_flushed("DrawIndexedIndirect") {
            return;
        }
        let stride = indirect_buffer.stride();
        unsafe {
            self.state.device.shared.raw.cmd_draw_indexed_indirect(
                self.state.raw,
                indirect_buffer.raw,
                u64::from(command_offset) * u64::from(stride),
                draw_count,
                stride,
            );
        }
    }

    pub fn end_encoding(mut self) -> Result<()> {
        unsafe {
            self.state
                .device
                .shared
                .raw
                .cmd_end_render_pass(self.state.raw);
        }
        self.state.end(self.parent, Workload::Graphics)
    }
}

impl Drop for RenderEncoder<'_> {
    fn drop(&mut self) {
        if !self.state.ended {
            log::error!("Render encoder dropped without end_encoding; submission discarded");
        }
    }
}

/// Records one compute submission.
pub struct ComputeEncoder<'a> {
    parent: &'a mut CommandBuffer,
    state: EncoderState,
}

impl<'a> ComputeEncoder<'a> {
    pub(crate) fn begin(
        parent: &'a mut CommandBuffer,
        frame_buffers: Vec<vk::CommandBuffer>,
    ) -> Result<Self> {
        let state = EncoderState::begin(parent, frame_buffers, vk::PipelineBindPoint::COMPUTE)?;
        Ok(Self { parent, state })
    }

    pub fn bind_pipeline(&mut self, pipeline: &ComputePipeline) {
        self.state
            .binder
            .bind_pipeline_data(pipeline.binding_data.clone());
        self.state.bound_layout = pipeline.raw_layout;
        unsafe {
            self.state.device.shared.raw.cmd_bind_pipeline(
                self.state.raw,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.raw,
            );
        }
    }

    pub fn bind_resource_set(&mut self, set: &ResourceSet, set_index: u32) {
        self.state.bind_resource_set(set, set_index);
    }

    pub fn update_dynamic_offset(&mut self, set_index: u32, binding_index: u32, offset: u32) {
        self.state
            .update_dynamic_offset(set_index, binding_index, offset);
    }

    pub fn flush_resource_set(&mut self, set_index: u32) {
        self.state.flush_resource_set(set_index);
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        if !self.state.check_flushed("Dispatch") {
            return;
        }
        unsafe {
            self.state.device.shared.raw.cmd_dispatch(
                self.state.raw,
                group_count_x,
                group_count_y,
                group_count_z,
            );
        }
    }

    pub fn dispatch_indirect(&mut self, indirect_buffer: &Buffer, command_offset: u32) {
        if !self.state.check_flushed("DispatchIndirect") {
            return;
        }
        unsafe {
            self.state.device.shared.raw.cmd_dispatch_indirect(
                self.state.raw,
                indirect_buffer.raw,
                u64::from(command_offset) * u64::from(indirect_buffer.stride()),
            );
        }
    }

    pub fn end_encoding(mut self) -> Result<()> {
        self.state.end(self.parent, Workload::Compute)
    }
}

impl Drop for ComputeEncoder<'_> {
    fn drop(&mut self) {
        if !self.state.ended {
            log::error!("Compute encoder dropped without end_encoding; submission discarded");
        }
    }
}

/// Records one transfer submission.
pub struct TransferEncoder<'a> {
    parent: &'a mut CommandBuffer,
    state: EncoderState,
}

impl<'a> TransferEncoder<'a> {
    pub(crate) fn begin(
        parent: &'a mut CommandBuffer,
        frame_buffers: Vec<vk::CommandBuffer>,
    ) -> Result<Self> {
        let state = EncoderState::begin(parent, frame_buffers, vk::PipelineBindPoint::GRAPHICS)?;
        Ok(Self { parent, state })
    }

    pub fn copy_buffer_to_buffer(&mut self, source: &Buffer, destination: &Buffer, size: u64) {
        let region = vk::BufferCopy2::default().size(size);
        let info = vk::CopyBufferInfo2::default()
            .src_buffer(source.raw)
            .dst_buffer(destination.raw)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.state
                .device
                .shared
                .raw
                .cmd_copy_buffer2(self.state.raw, &info);
        }
    }

    pub fn copy_buffer_to_texture(&mut self, source: &Buffer, destination: &Texture) {
        let region = vk::BufferImageCopy2::default()
            .buffer_offset(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(destination.array_layer_count()),
            )
            .image_extent(destination.extent);
        let info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(source.raw)
            .dst_image(destination.raw)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.state
                .device
                .shared
                .raw
                .cmd_copy_buffer_to_image2(self.state.raw, &info);
        }
    }

    pub fn copy_texture_to_buffer(&mut self, source: &Texture, destination: &Buffer) {
        let region = vk::BufferImageCopy2::default()
            .buffer_offset(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(source.array_layer_count()),
            )
            .image_extent(source.extent);
        let info = vk::CopyImageToBufferInfo2::default()
            .src_image(source.raw)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_buffer(destination.raw)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.state
                .device
                .shared
                .raw
                .cmd_copy_image_to_buffer2(self.state.raw, &info);
        }
    }

    pub fn end_encoding(mut self) -> Result<()> {
        self.state.end(self.parent, Workload::Transfer)
    }
}

impl Drop for TransferEncoder<'_> {
    fn drop(&mut self) {
        if !self.state.ended {
            log::error!("Transfer encoder dropped without end_encoding; submission discarded");
        }
    }
}
