use std::{ffi::CString, sync::Arc};

use anyhow::Result;
use ash::vk;

use crate::{
    descriptor::{
        DescriptorPool, PipelineBindingData, ResourceSet, ResourceSetWritability, SetBindingData,
    },
    device::Device,
    render_pass::RenderPass,
    shader::{merge_reflection, ShaderModule},
};

#[derive(Debug, Clone, Copy)]
pub struct PipelineDepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
}

impl Default for PipelineDepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

impl PipelineDepthStencilState {
    fn to_vulkan_state(self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test_enable)
            .depth_write_enable(self.depth_write_enable)
            .depth_compare_op(self.depth_compare_op)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineRasterizationState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
}

impl Default for PipelineRasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

impl PipelineRasterizationState {
    fn to_vulkan_state(self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(self.polygon_mode)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .line_width(1.0)
    }
}

pub struct GraphicsPipelineDescriptor {
    pub shaders: Vec<Arc<ShaderModule>>,
    pub vertex_input_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub vertex_input_bindings: Vec<vk::VertexInputBindingDescription>,
    pub primitive_topology: vk::PrimitiveTopology,
    /// One entry per color attachment of the target render pass.
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub depth_stencil_state: PipelineDepthStencilState,
    pub rasterization_state: PipelineRasterizationState,
    pub render_pass: Arc<RenderPass>,
}

pub struct GraphicsPipeline {
    pub(crate) raw: vk::Pipeline,
    pub(crate) raw_layout: vk::PipelineLayout,
    pub(crate) binding_data: Arc<PipelineBindingData>,
    device: Arc<Device>,
}

impl GraphicsPipeline {
    pub fn create_resource_set(
        &self,
        set_index: u32,
        writability: ResourceSetWritability,
    ) -> Result<ResourceSet> {
        create_resource_set(&self.device, &self.binding_data, set_index, writability)
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        destroy_pipeline(&self.device, self.raw, self.raw_layout);
    }
}

pub struct ComputePipelineDescriptor {
    pub shader: Arc<ShaderModule>,
}

pub struct ComputePipeline {
    pub(crate) raw: vk::Pipeline,
    pub(crate) raw_layout: vk::PipelineLayout,
    pub(crate) binding_data: Arc<PipelineBindingData>,
    device: Arc<Device>,
}

impl ComputePipeline {
    pub fn create_resource_set(
        &self,
        set_index: u32,
        writability: ResourceSetWritability,
    ) -> Result<ResourceSet> {
        create_resource_set(&self.device, &self.binding_data, set_index, writability)
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        destroy_pipeline(&self.device, self.raw, self.raw_layout);
    }
}

fn create_resource_set(
    device: &Arc<Device>,
    binding_data: &Arc<PipelineBindingData>,
    set_index: u32,
    writability: ResourceSetWritability,
) -> Result<ResourceSet> {
    let index = set_index as usize;
    let set_data = binding_data
        .sets
        .get(index)
        .filter(|set_data| set_data.exists)
        .ok_or_else(|| anyhow::anyhow!("Set index {} does not exist in the pipeline", set_index))?;

    Ok(ResourceSet::new(
        device,
        set_data.pool.as_ref().unwrap().clone(),
        writability,
    ))
}

fn destroy_pipeline(device: &Arc<Device>, raw: vk::Pipeline, layout: vk::PipelineLayout) {
    let shared = device.shared.clone();
    device.finalizer.push(
        move || unsafe {
            shared.raw.destroy_pipeline(raw, None);
            shared.raw.destroy_pipeline_layout(layout, None);
        },
        "Pipeline free",
    );
}

/// Builds the per-set descriptor pools and dynamic-offset windows from the
/// merged reflection of the pipeline's shaders, then assembles the
/// `vkPipelineLayout`. Set-index holes get the device's shared empty layout.
fn build_binding_data(
    device: &Arc<Device>,
    shaders: &[&ShaderModule],
) -> Result<(Arc<PipelineBindingData>, vk::PipelineLayout)> {
    let reflections = shaders
        .iter()
        .map(|shader| shader.reflection.as_slice())
        .collect::<Vec<_>>();
    let merged = merge_reflection(&reflections)?;

    let set_count = merged
        .iter()
        .map(|(index, _)| *index + 1)
        .max()
        .unwrap_or(0) as usize;

    let mut sets = Vec::with_capacity(set_count);
    let mut total_dynamic_offsets = 0u32;
    for index in 0..set_count as u32 {
        match merged.iter().find(|(set_index, _)| *set_index == index) {
            Some((_, bindings)) => {
                let pool = DescriptorPool::new(device, bindings)?;
                let dynamic_offset_count = pool.table.buffer_count;
                sets.push(SetBindingData {
                    exists: true,
                    dynamic_offset_index: total_dynamic_offsets,
                    dynamic_offset_count,
                    pool: Some(pool),
                });
                total_dynamic_offsets += dynamic_offset_count;
            }
            None => sets.push(SetBindingData {
                exists: false,
                pool: None,
                dynamic_offset_index: total_dynamic_offsets,
                dynamic_offset_count: 0,
            }),
        }
    }

    let set_layouts = sets
        .iter()
        .map(|set_data| match &set_data.pool {
            Some(pool) if pool.has_descriptors() => pool.layout(),
            _ => device.empty_descriptor_set_layout,
        })
        .collect::<Vec<_>>();

    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    let raw_layout = unsafe {
        device
            .shared
            .raw
            .create_pipeline_layout(&layout_info, None)?
    };

    Ok((
        Arc::new(PipelineBindingData {
            sets,
            total_dynamic_offsets,
        }),
        raw_layout,
    ))
}

impl Device {
    pub fn create_graphics_pipeline(
        self: &Arc<Self>,
        desc: GraphicsPipelineDescriptor,
    ) -> Result<GraphicsPipeline> {
        let shaders = desc.shaders.iter().map(Arc::as_ref).collect::<Vec<_>>();
        let (binding_data, raw_layout) = build_binding_data(self, &shaders)?;

        let shader_entry_point_name = CString::new("main").unwrap();
        let shader_stages = desc
            .shaders
            .iter()
            .map(|shader_module| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader_module.stage.to_vulkan_shader_stage_flag())
                    .module(shader_module.raw)
                    .name(&shader_entry_point_name)
            })
            .collect::<Vec<_>>();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_attribute_descriptions(&desc.vertex_input_attributes)
            .vertex_binding_descriptions(&desc.vertex_input_bindings);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.primitive_topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&desc.color_blend_attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false)
            .min_sample_shading(1.0);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let vulkan_depth_stencil_state = desc.depth_stencil_state.to_vulkan_state();
        let vulkan_rasterization_state = desc.rasterization_state.to_vulkan_state();

        let pipeline_create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .color_blend_state(&color_blend_state)
            .depth_stencil_state(&vulkan_depth_stencil_state)
            .multisample_state(&multisample_state)
            .rasterization_state(&vulkan_rasterization_state)
            .dynamic_state(&dynamic_state)
            .layout(raw_layout)
            .render_pass(desc.render_pass.raw)
            .subpass(0);

        let raw = unsafe {
            self.shared
                .raw
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_create_info),
                    None,
                )
                .map_err(|e| e.1)?[0]
        };

        Ok(GraphicsPipeline {
            raw,
            raw_layout,
            binding_data,
            device: self.clone(),
        })
    }

    pub fn create_compute_pipeline(
        self: &Arc<Self>,
        desc: ComputePipelineDescriptor,
    ) -> Result<ComputePipeline> {
        let shaders = [desc.shader.as_ref()];
        let (binding_data, raw_layout) = build_binding_data(self, &shaders)?;

        let shader_entry_point_name = CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(desc.shader.stage.to_vulkan_shader_stage_flag())
            .module(desc.shader.raw)
            .name(&shader_entry_point_name);

        let pipeline_create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(raw_layout);

        let raw = unsafe {
            self.shared
                .raw
                .create_compute_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_create_info),
                    None,
                )
                .map_err(|e| e.1)?[0]
        };

        Ok(ComputePipeline {
            raw,
            raw_layout,
            binding_data,
            device: self.clone(),
        })
    }
}
