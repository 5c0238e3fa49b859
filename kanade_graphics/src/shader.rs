use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, DeviceShared};

/// Kind of a shader resource binding, as reported by reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    UniformBuffer,
    StorageBuffer,
    SampledTexture,
    StorageTexture,
    SubpassInput,
    AccelerationStructure,
}

impl ResourceKind {
    /// Buffer bindings are exposed with dynamic offsets so one bound set
    /// can window into a larger buffer per draw.
    pub(crate) fn to_descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            Self::SampledTexture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
            Self::SubpassInput => vk::DescriptorType::INPUT_ATTACHMENT,
            Self::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }

    pub(crate) fn is_buffer(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::StorageBuffer)
    }
}

/// One reflected binding. Shader reflection itself is an external
/// collaborator; this is the schema the library consumes. Elements must be
/// sorted by `(set_index, binding_index)`.
#[derive(Debug, Clone, Copy)]
pub struct ReflectionElement {
    pub set_index: u32,
    pub binding_index: u32,
    pub kind: ResourceKind,
    pub stages: vk::ShaderStageFlags,
    /// Zero means a variable-count array; requires the descriptor indexing
    /// feature to be usable.
    pub array_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub(crate) fn to_vulkan_shader_stage_flag(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

pub struct ShaderModuleDescriptor<'a> {
    /// Compiled SPIR-V words.
    pub code: &'a [u32],
    pub stage: ShaderStage,
    /// Reflection output for this module, sorted by set then binding.
    pub reflection: Vec<ReflectionElement>,
}

pub struct ShaderModule {
    pub(crate) raw: vk::ShaderModule,
    pub stage: ShaderStage,
    pub(crate) reflection: Vec<ReflectionElement>,
    device: Arc<DeviceShared>,
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_shader_module(self.raw, None);
        }
    }
}

impl Device {
    pub fn create_shader_module(&self, desc: ShaderModuleDescriptor) -> Result<ShaderModule> {
        let sorted = desc.reflection.windows(2).all(|window| {
            (window[0].set_index, window[0].binding_index)
                < (window[1].set_index, window[1].binding_index)
        });
        if !sorted {
            return Err(anyhow::anyhow!(
                "Shader reflection elements must be sorted by set and binding index"
            ));
        }

        let create_info = vk::ShaderModuleCreateInfo::default().code(desc.code);
        let raw = unsafe { self.shared.raw.create_shader_module(&create_info, None)? };

        Ok(ShaderModule {
            raw,
            stage: desc.stage,
            reflection: desc.reflection,
            device: self.shared.clone(),
        })
    }
}

/// Merges the reflection of one pipeline's shader stages into per-set
/// binding lists. Bindings shared between stages must agree on kind and
/// array count; their stage masks are combined.
pub(crate) fn merge_reflection(
    reflections: &[&[ReflectionElement]],
) -> Result<Vec<(u32, Vec<ReflectionElement>)>> {
    let mut sets: Vec<(u32, Vec<ReflectionElement>)> = Vec::new();

    for reflection in reflections {
        for element in *reflection {
            let set = match sets
                .iter_mut()
                .find(|(index, _)| *index == element.set_index)
            {
                Some((_, bindings)) => bindings,
                None => {
                    sets.push((element.set_index, Vec::new()));
                    &mut sets.last_mut().unwrap().1
                }
            };

            match set
                .iter_mut()
                .find(|existing| existing.binding_index == element.binding_index)
            {
                Some(existing) => {
                    if existing.kind != element.kind || existing.array_count != element.array_count
                    {
                        return Err(anyhow::anyhow!(
                            "Shader stages disagree on binding {} of set {}",
                            element.binding_index,
                            element.set_index
                        ));
                    }
                    existing.stages |= element.stages;
                }
                None => set.push(*element),
            }
        }
    }

    for (_, bindings) in &mut sets {
        bindings.sort_by_key(|element| element.binding_index);
    }
    sets.sort_by_key(|(index, _)| *index);

    Ok(sets)
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::{merge_reflection, ReflectionElement, ResourceKind};

    fn element(
        set: u32,
        binding: u32,
        kind: ResourceKind,
        stages: vk::ShaderStageFlags,
    ) -> ReflectionElement {
        ReflectionElement {
            set_index: set,
            binding_index: binding,
            kind,
            stages,
            array_count: 1,
        }
    }

    #[test]
    fn stages_sharing_a_binding_combine_masks() {
        let vertex = [element(
            0,
            0,
            ResourceKind::UniformBuffer,
            vk::ShaderStageFlags::VERTEX,
        )];
        let fragment = [element(
            0,
            0,
            ResourceKind::UniformBuffer,
            vk::ShaderStageFlags::FRAGMENT,
        )];

        let merged = merge_reflection(&[&vertex, &fragment]).unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1.len(), 1);
        assert_eq!(
            merged[0].1[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn kind_mismatch_between_stages_is_rejected() {
        let vertex = [element(
            0,
            0,
            ResourceKind::UniformBuffer,
            vk::ShaderStageFlags::VERTEX,
        )];
        let fragment = [element(
            0,
            0,
            ResourceKind::StorageBuffer,
            vk::ShaderStageFlags::FRAGMENT,
        )];

        assert!(merge_reflection(&[&vertex, &fragment]).is_err());
    }

    #[test]
    fn sets_and_bindings_come_back_sorted() {
        let reflection = [
            element(1, 2, ResourceKind::SampledTexture, vk::ShaderStageFlags::FRAGMENT),
            element(1, 0, ResourceKind::UniformBuffer, vk::ShaderStageFlags::FRAGMENT),
            element(0, 1, ResourceKind::StorageBuffer, vk::ShaderStageFlags::FRAGMENT),
        ];
        // Out-of-order input is tolerated by the merge even though module
        // creation rejects it; ordering of the result is what matters here.
        let merged = merge_reflection(&[&reflection]).unwrap();

        assert_eq!(merged[0].0, 0);
        assert_eq!(merged[1].0, 1);
        assert_eq!(merged[1].1[0].binding_index, 0);
        assert_eq!(merged[1].1[1].binding_index, 2);
    }
}
