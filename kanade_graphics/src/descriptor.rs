use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use crate::{
    device::Device,
    render_pass::Framebuffer,
    resource::{Buffer, Texture},
    shader::{ReflectionElement, ResourceKind},
};

/// Sets allocated from one backing `vkDescriptorPool` chunk.
pub(crate) const SETS_PER_POOL: u32 = 20;

/// Descriptor count used for variable-count (`array_count == 0`) bindings.
const VARIABLE_ARRAY_FALLBACK: u32 = 1024;

/// One slot in a set's binding table. Holes in the reflected binding
/// sequence are kept as `exists == false` entries so the table can be
/// indexed directly by binding index.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BindingData {
    pub(crate) exists: bool,
    pub(crate) kind: ResourceKind,
    pub(crate) descriptor_type: vk::DescriptorType,
    pub(crate) array_count: u32,
    pub(crate) stages: vk::ShaderStageFlags,
    pub(crate) buffer_array_index: u32,
    pub(crate) image_array_index: u32,
    pub(crate) accel_array_index: u32,
}

impl BindingData {
    fn missing() -> Self {
        Self {
            exists: false,
            kind: ResourceKind::UniformBuffer,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            array_count: 0,
            stages: vk::ShaderStageFlags::empty(),
            buffer_array_index: 0,
            image_array_index: 0,
            accel_array_index: 0,
        }
    }
}

/// Device-independent description of one descriptor set layout, derived
/// from sorted reflection data. Carries everything needed for binding
/// validation and the pool compatibility predicate.
pub(crate) struct BindingTable {
    pub(crate) bindings: Vec<BindingData>,
    pub(crate) buffer_count: u32,
    pub(crate) image_array_elements: u32,
    pub(crate) accel_count: u32,
    pub(crate) pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl BindingTable {
    pub(crate) fn from_reflection(elements: &[ReflectionElement]) -> Result<Self> {
        let mut bindings: Vec<BindingData> = Vec::new();
        let mut buffer_count = 0;
        let mut image_array_elements = 0;
        let mut accel_count = 0;
        let mut descriptor_counts: Vec<(vk::DescriptorType, u32)> = Vec::new();

        for element in elements {
            if (element.binding_index as usize) < bindings.len() {
                return Err(anyhow::anyhow!(
                    "Duplicate or unsorted binding index {} in reflection data",
                    element.binding_index
                ));
            }

            while bindings.len() < element.binding_index as usize {
                bindings.push(BindingData::missing());
            }

            let descriptor_type = element.kind.to_descriptor_type();
            let array_count = if element.array_count == 0 {
                VARIABLE_ARRAY_FALLBACK
            } else {
                element.array_count
            };

            let mut data = BindingData {
                exists: true,
                kind: element.kind,
                descriptor_type,
                array_count,
                stages: element.stages,
                buffer_array_index: 0,
                image_array_index: 0,
                accel_array_index: 0,
            };

            match element.kind {
                ResourceKind::UniformBuffer | ResourceKind::StorageBuffer => {
                    data.buffer_array_index = buffer_count;
                    buffer_count += 1;
                }
                ResourceKind::SampledTexture
                | ResourceKind::StorageTexture
                | ResourceKind::SubpassInput => {
                    data.image_array_index = image_array_elements;
                    image_array_elements += array_count;
                }
                ResourceKind::AccelerationStructure => {
                    data.accel_array_index = accel_count;
                    accel_count += 1;
                }
            }

            match descriptor_counts
                .iter_mut()
                .find(|(ty, _)| *ty == descriptor_type)
            {
                Some((_, count)) => *count += array_count * SETS_PER_POOL,
                None => descriptor_counts.push((descriptor_type, array_count * SETS_PER_POOL)),
            }

            bindings.push(data);
        }

        let pool_sizes = descriptor_counts
            .into_iter()
            .map(|(ty, descriptor_count)| {
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(descriptor_count)
            })
            .collect();

        Ok(Self {
            bindings,
            buffer_count,
            image_array_elements,
            accel_count,
            pool_sizes,
        })
    }

    pub(crate) fn has_descriptors(&self) -> bool {
        !self.pool_sizes.is_empty()
    }

    pub(crate) fn binding_exists(&self, binding_index: u32) -> bool {
        (binding_index as usize) < self.bindings.len()
            && self.bindings[binding_index as usize].exists
    }

    /// Two tables are compatible iff they have the same binding vector
    /// length and agree on existence, kind, and array count at every index.
    /// Tables built from reflection-equivalent shaders compare equal.
    pub(crate) fn check_compatibility(&self, other: &BindingTable) -> bool {
        if self.bindings.len() != other.bindings.len() {
            return false;
        }

        self.bindings.iter().zip(&other.bindings).all(|(l, r)| {
            if l.exists != r.exists {
                return false;
            }
            !l.exists || (l.descriptor_type == r.descriptor_type && l.array_count == r.array_count)
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DescriptorSetAllocation {
    pub(crate) set: vk::DescriptorSet,
    pub(crate) pool_index: usize,
}

struct PoolChunk {
    raw: vk::DescriptorPool,
    allocated_count: u32,
}

struct PoolChunks {
    chunks: Vec<PoolChunk>,
    available: Vec<usize>,
    free_sets: Vec<DescriptorSetAllocation>,
}

/// Per-layout allocator of descriptor sets. Backing pools grow in
/// fixed-size chunks; freed sets land on a free list and are handed out
/// again before any new pool allocation happens. All pool state is guarded
/// by one mutex; allocation and free are O(1) outside chunk growth.
pub struct DescriptorPool {
    pub(crate) table: BindingTable,
    layout: vk::DescriptorSetLayout,
    state: Mutex<PoolChunks>,
    device: Arc<Device>,
}

impl DescriptorPool {
    pub(crate) fn new(device: &Arc<Device>, elements: &[ReflectionElement]) -> Result<Arc<Self>> {
        let table = BindingTable::from_reflection(elements)?;

        let mut layout = vk::DescriptorSetLayout::null();
        if table.has_descriptors() {
            let vk_bindings = table
                .bindings
                .iter()
                .enumerate()
                .filter(|(_, data)| data.exists)
                .map(|(index, data)| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(index as u32)
                        .descriptor_type(data.descriptor_type)
                        .descriptor_count(data.array_count)
                        .stage_flags(data.stages)
                })
                .collect::<Vec<_>>();

            let binding_flags =
                vec![vk::DescriptorBindingFlags::PARTIALLY_BOUND; vk_bindings.len()];
            let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
                .binding_flags(&binding_flags);

            let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
                .bindings(&vk_bindings)
                .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                .push_next(&mut binding_flags_info);

            layout = unsafe {
                device
                    .shared
                    .raw
                    .create_descriptor_set_layout(&layout_info, None)?
            };
        }

        Ok(Arc::new(Self {
            table,
            layout,
            state: Mutex::new(PoolChunks {
                chunks: Vec::new(),
                available: Vec::new(),
                free_sets: Vec::new(),
            }),
            device: device.clone(),
        }))
    }

    pub(crate) fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub(crate) fn has_descriptors(&self) -> bool {
        self.table.has_descriptors()
    }

    pub(crate) fn allocate_set(&self) -> Result<DescriptorSetAllocation> {
        debug_assert!(self.has_descriptors());

        let mut state = self.state.lock();

        if let Some(allocation) = state.free_sets.pop() {
            return Ok(allocation);
        }

        if state.available.is_empty() {
            self.create_pool_chunk(&mut state)?;
        }

        let pool_index = *state.available.last().unwrap();
        let chunk = &mut state.chunks[pool_index];

        let layouts = [self.layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(chunk.raw)
            .set_layouts(&layouts);
        let set = unsafe { self.device.shared.raw.allocate_descriptor_sets(&allocate_info)? }[0];

        chunk.allocated_count += 1;
        if chunk.allocated_count == SETS_PER_POOL {
            state.available.pop();
        }

        Ok(DescriptorSetAllocation { set, pool_index })
    }

    pub(crate) fn free_set(&self, allocation: DescriptorSetAllocation) {
        self.state.lock().free_sets.push(allocation);
    }

    fn create_pool_chunk(&self, state: &mut PoolChunks) -> Result<()> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&self.table.pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);

        let raw = unsafe {
            self.device
                .shared
                .raw
                .create_descriptor_pool(&pool_info, None)?
        };

        state.available.push(state.chunks.len());
        state.chunks.push(PoolChunk {
            raw,
            allocated_count: 0,
        });
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if !self.table.has_descriptors() {
            return;
        }

        let layout = self.layout;
        let chunks = std::mem::take(&mut self.state.lock().chunks);
        let shared = self.device.shared.clone();
        self.device.finalizer.push(
            move || unsafe {
                for chunk in chunks {
                    shared.raw.destroy_descriptor_pool(chunk.raw, None);
                }
                shared.raw.destroy_descriptor_set_layout(layout, None);
            },
            "DescriptorPool free",
        );
    }
}

/// How often the application intends to rewrite a set. Informational for
/// validation; the rotation machinery itself is identical for all modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSetWritability {
    OnceStaticData,
    OnceDynamicData,
    PerFrame,
    MultiPerFrame,
}

struct AllocatedSet {
    allocation: DescriptorSetAllocation,
    write_frame: u64,
}

enum StagedInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

struct StagedWrite {
    binding_index: u32,
    descriptor_type: vk::DescriptorType,
    array_element: u32,
    info: StagedInfo,
}

/// Picks the oldest allocation that no in-flight frame can still reference,
/// or `None` if a new one must be allocated. This is the write-skew
/// guarantee: a set written in frame `f` is not rewritten until
/// `frames_in_flight` frames later.
fn select_rotation_slot(
    allocations: &[AllocatedSet],
    frame_count: u64,
    frames_in_flight: u64,
) -> Option<usize> {
    allocations
        .iter()
        .position(|allocated| frame_count - allocated.write_frame >= frames_in_flight)
}

/// Application-facing descriptor set with deferred writes and multi-frame
/// allocation rotation. Bind calls stage descriptor writes; `flush_bindings`
/// replays them onto an allocation that is safely out of flight.
pub struct ResourceSet {
    pool: Arc<DescriptorPool>,
    writability: ResourceSetWritability,
    allocations: Vec<AllocatedSet>,
    staged: Vec<StagedWrite>,
    current_set: vk::DescriptorSet,
    last_flush_frame: u64,
    device: Arc<Device>,
}

impl ResourceSet {
    pub(crate) fn new(
        device: &Arc<Device>,
        pool: Arc<DescriptorPool>,
        writability: ResourceSetWritability,
    ) -> Self {
        Self {
            pool,
            writability,
            allocations: Vec::new(),
            staged: Vec::new(),
            current_set: vk::DescriptorSet::null(),
            last_flush_frame: u64::MAX,
            device: device.clone(),
        }
    }

    pub(crate) fn pool(&self) -> &Arc<DescriptorPool> {
        &self.pool
    }

    /// Most recently flushed descriptor set handle.
    pub(crate) fn handle(&self) -> vk::DescriptorSet {
        self.current_set
    }

    /// Offsets and counts are in buffer elements, not bytes.
    pub fn bind_buffer(
        &mut self,
        binding_index: u32,
        buffer: &Buffer,
        element_offset: u32,
        element_count: u32,
    ) {
        let kind = if buffer
            .usage_flags
            .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        {
            ResourceKind::UniformBuffer
        } else {
            ResourceKind::StorageBuffer
        };

        if !buffer.usage_flags.intersects(
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        ) {
            log::error!("Buffer bind must have either uniform or storage usage");
            return;
        }
        if (u64::from(element_offset) + u64::from(element_count)) * u64::from(buffer.stride())
            > buffer.size()
        {
            log::error!(
                "Buffer bind range {}+{} exceeds buffer element count",
                element_offset,
                element_count
            );
            return;
        }
        if !self.validate_binding(binding_index, kind, 0) {
            return;
        }

        let stride = buffer.stride();
        self.staged.push(StagedWrite {
            binding_index,
            descriptor_type: self.pool.table.bindings[binding_index as usize].descriptor_type,
            array_element: 0,
            info: StagedInfo::Buffer(
                vk::DescriptorBufferInfo::default()
                    .buffer(buffer.raw)
                    .offset(u64::from(stride) * u64::from(element_offset))
                    .range(u64::from(stride) * u64::from(element_count)),
            ),
        });
    }

    pub fn bind_texture(&mut self, binding_index: u32, texture: &Texture, array_index: u32) {
        let kind = if texture
            .usage_flags
            .contains(vk::ImageUsageFlags::STORAGE)
        {
            ResourceKind::StorageTexture
        } else {
            ResourceKind::SampledTexture
        };

        if !self.validate_binding(binding_index, kind, array_index) {
            return;
        }

        let binding = &self.pool.table.bindings[binding_index as usize];
        if binding.kind == ResourceKind::StorageTexture && kind != ResourceKind::StorageTexture {
            log::error!(
                "Binding a texture without storage usage to storage image binding {}",
                binding_index
            );
            return;
        }

        let (descriptor_type, layout) = match binding.kind {
            ResourceKind::StorageTexture => {
                (vk::DescriptorType::STORAGE_IMAGE, vk::ImageLayout::GENERAL)
            }
            _ => (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        };

        self.staged.push(StagedWrite {
            binding_index,
            descriptor_type,
            array_element: array_index,
            info: StagedInfo::Image(
                vk::DescriptorImageInfo::default()
                    .image_view(texture.raw_view)
                    .sampler(texture.raw_sampler)
                    .image_layout(layout),
            ),
        });
    }

    /// Binds a framebuffer attachment as a subpass input.
    pub fn bind_subpass_input(
        &mut self,
        binding_index: u32,
        framebuffer: &Framebuffer,
        attachment_index: usize,
    ) {
        if !self.validate_binding(binding_index, ResourceKind::SubpassInput, 0) {
            return;
        }

        let Some(view) = framebuffer.attachment_view(attachment_index) else {
            log::error!(
                "Framebuffer has no attachment at index {} for subpass input bind",
                attachment_index
            );
            return;
        };

        self.staged.push(StagedWrite {
            binding_index,
            descriptor_type: vk::DescriptorType::INPUT_ATTACHMENT,
            array_element: 0,
            info: StagedInfo::Image(
                vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ),
        });
    }

    /// Replays the staged writes onto an out-of-flight allocation and makes
    /// it the set's current handle.
    pub fn flush_bindings(&mut self) -> Result<()> {
        let frame_count = self.device.frame_count();
        let frames_in_flight = self.device.frame_buffer_count() as u64;

        if self.last_flush_frame == frame_count
            && self.writability != ResourceSetWritability::MultiPerFrame
        {
            log::warn!("Flushing a resource set twice in one frame without MultiPerFrame writability");
        }

        let slot = match select_rotation_slot(&self.allocations, frame_count, frames_in_flight) {
            Some(slot) => {
                self.allocations[slot].write_frame = frame_count;
                slot
            }
            None => {
                self.allocations.push(AllocatedSet {
                    allocation: self.pool.allocate_set()?,
                    write_frame: frame_count,
                });
                self.allocations.len() - 1
            }
        };

        let destination = self.allocations[slot].allocation.set;

        let writes = self
            .staged
            .iter()
            .map(|staged| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(destination)
                    .dst_binding(staged.binding_index)
                    .dst_array_element(staged.array_element)
                    .descriptor_type(staged.descriptor_type);
                match &staged.info {
                    StagedInfo::Buffer(info) => write.buffer_info(std::slice::from_ref(info)),
                    StagedInfo::Image(info) => write.image_info(std::slice::from_ref(info)),
                }
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device.shared.raw.update_descriptor_sets(&writes, &[]);
        }
        drop(writes);

        self.staged.clear();
        self.current_set = destination;
        self.last_flush_frame = frame_count;
        Ok(())
    }

    /// Checks a bind call against the set's layout. Violations log and
    /// leave the staging vector untouched.
    fn validate_binding(&self, binding_index: u32, kind: ResourceKind, array_index: u32) -> bool {
        if !self.pool.table.binding_exists(binding_index) {
            log::error!(
                "Attempting to update resource binding {} that does not exist in the set",
                binding_index
            );
            return false;
        }

        let binding = &self.pool.table.bindings[binding_index as usize];

        // Sampled-texture bindings tolerate storage-capable textures; the
        // reverse is rejected by the caller-specific checks.
        let correct_type = binding.kind == kind
            || (binding.kind == ResourceKind::SampledTexture
                && kind == ResourceKind::StorageTexture);
        if !correct_type {
            log::error!(
                "Attempting to bind a resource to {} that does not match the binding type",
                binding_index
            );
            return false;
        }

        if array_index >= binding.array_count {
            log::error!(
                "Attempting to bind a resource to {} with out of range array index {}",
                binding_index,
                array_index
            );
            return false;
        }

        true
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let allocations = self
            .allocations
            .drain(..)
            .map(|allocated| allocated.allocation)
            .collect::<Vec<_>>();
        self.device.finalizer.push(
            move || {
                for allocation in allocations {
                    pool.free_set(allocation);
                }
            },
            "ResourceSet free",
        );
    }
}

/// Per-pipeline descriptor layout: which set indices exist, the pool each
/// one allocates from, and the window each set occupies in the pipeline's
/// contiguous dynamic-offset array.
pub(crate) struct PipelineBindingData {
    pub(crate) sets: Vec<SetBindingData>,
    pub(crate) total_dynamic_offsets: u32,
}

pub(crate) struct SetBindingData {
    pub(crate) exists: bool,
    pub(crate) pool: Option<Arc<DescriptorPool>>,
    pub(crate) dynamic_offset_index: u32,
    pub(crate) dynamic_offset_count: u32,
}

/// Encoder-side binding state for the currently bound pipeline: bound set
/// handles, dirtiness, and the dynamic-offset buffer.
pub(crate) struct DescriptorBinder {
    data: Option<Arc<PipelineBindingData>>,
    bound_sets: Vec<vk::DescriptorSet>,
    dirty: Vec<bool>,
    dynamic_offsets: Vec<u32>,
}

impl DescriptorBinder {
    pub(crate) fn new() -> Self {
        Self {
            data: None,
            bound_sets: Vec::new(),
            dirty: Vec::new(),
            dynamic_offsets: Vec::new(),
        }
    }

    pub(crate) fn bind_pipeline_data(&mut self, data: Arc<PipelineBindingData>) {
        self.bound_sets.clear();
        self.bound_sets
            .resize(data.sets.len(), vk::DescriptorSet::null());
        self.dirty.clear();
        self.dirty.resize(data.sets.len(), false);
        self.dynamic_offsets.clear();
        self.dynamic_offsets
            .resize(data.total_dynamic_offsets as usize, 0);
        self.data = Some(data);
    }

    pub(crate) fn bind_resource_set(&mut self, set: &ResourceSet, set_index: u32) -> bool {
        let Some(data) = &self.data else {
            log::error!("Cannot bind a resource set before binding a pipeline");
            return false;
        };

        let index = set_index as usize;
        if index >= data.sets.len() || !data.sets[index].exists {
            log::error!("Set index {} does not exist in the bound pipeline", set_index);
            return false;
        }

        let pipeline_pool = data.sets[index].pool.as_ref().unwrap();
        if !pipeline_pool.table.check_compatibility(&set.pool().table) {
            log::error!(
                "Trying to bind an incompatible resource set at index {}",
                set_index
            );
            return false;
        }

        if set.handle() == vk::DescriptorSet::null() {
            log::error!(
                "Resource set bound at index {} has never been flushed",
                set_index
            );
            return false;
        }

        self.bound_sets[index] = set.handle();
        self.dirty[index] = true;
        true
    }

    pub(crate) fn update_dynamic_offset(
        &mut self,
        set_index: u32,
        binding_index: u32,
        offset: u32,
    ) -> bool {
        let Some(data) = &self.data else {
            log::error!("Cannot update a dynamic offset before binding a pipeline");
            return false;
        };

        let index = set_index as usize;
        if index >= data.sets.len() || !data.sets[index].exists {
            log::error!("Set index {} does not exist in the bound pipeline", set_index);
            return false;
        }

        let set_data = &data.sets[index];
        let pool = set_data.pool.as_ref().unwrap();
        if !pool.table.binding_exists(binding_index) {
            log::error!(
                "Updating dynamic offset for binding {} that does not exist in set {}",
                binding_index,
                set_index
            );
            return false;
        }

        let slot = set_data.dynamic_offset_index
            + pool.table.bindings[binding_index as usize].buffer_array_index;
        self.dynamic_offsets[slot as usize] = offset;
        true
    }

    /// Returns the bound handle and its dynamic-offset window, clearing the
    /// set's dirty flag. `None` when nothing valid is bound at the index.
    pub(crate) fn take_flush(&mut self, set_index: u32) -> Option<(vk::DescriptorSet, &[u32])> {
        let data = self.data.as_ref()?;
        let index = set_index as usize;
        if index >= data.sets.len() || !data.sets[index].exists {
            log::error!("Set index {} does not exist in the bound pipeline", set_index);
            return None;
        }
        if self.bound_sets[index] == vk::DescriptorSet::null() {
            log::error!("Flushing set index {} with no bound resource set", set_index);
            return None;
        }

        self.dirty[index] = false;
        let set_data = &data.sets[index];
        let start = set_data.dynamic_offset_index as usize;
        let end = start + set_data.dynamic_offset_count as usize;
        Some((self.bound_sets[index], &self.dynamic_offsets[start..end]))
    }

    /// True while any bound set has not been flushed since the last bind.
    pub(crate) fn has_dirty_bindings(&self) -> bool {
        self.dirty.iter().any(|dirty| *dirty)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::{select_rotation_slot, AllocatedSet, BindingTable, DescriptorSetAllocation};
    use crate::shader::{ReflectionElement, ResourceKind};

    fn element(binding: u32, kind: ResourceKind, array_count: u32) -> ReflectionElement {
        ReflectionElement {
            set_index: 0,
            binding_index: binding,
            kind,
            stages: vk::ShaderStageFlags::ALL,
            array_count,
        }
    }

    #[test]
    fn holes_are_filled_with_missing_entries() {
        let table = BindingTable::from_reflection(&[
            element(0, ResourceKind::UniformBuffer, 1),
            element(3, ResourceKind::SampledTexture, 4),
        ])
        .unwrap();

        assert_eq!(table.bindings.len(), 4);
        assert!(table.binding_exists(0));
        assert!(!table.binding_exists(1));
        assert!(!table.binding_exists(2));
        assert!(table.binding_exists(3));
        assert_eq!(table.bindings[3].array_count, 4);
        assert_eq!(table.buffer_count, 1);
        assert_eq!(table.image_array_elements, 4);
    }

    #[test]
    fn cache_indices_count_per_resource_class() {
        let table = BindingTable::from_reflection(&[
            element(0, ResourceKind::UniformBuffer, 1),
            element(1, ResourceKind::SampledTexture, 2),
            element(2, ResourceKind::StorageBuffer, 1),
            element(3, ResourceKind::StorageTexture, 1),
            element(4, ResourceKind::AccelerationStructure, 1),
        ])
        .unwrap();

        assert_eq!(table.bindings[0].buffer_array_index, 0);
        assert_eq!(table.bindings[2].buffer_array_index, 1);
        assert_eq!(table.buffer_count, 2);

        // Image slots are sized by array count: the storage image starts
        // after the sampled texture's two elements.
        assert_eq!(table.bindings[1].image_array_index, 0);
        assert_eq!(table.bindings[3].image_array_index, 2);
        assert_eq!(table.image_array_elements, 3);

        assert_eq!(table.bindings[4].accel_array_index, 0);
        assert_eq!(table.accel_count, 1);
    }

    #[test]
    fn reflection_equivalent_tables_are_compatible() {
        let reflection = [
            element(0, ResourceKind::UniformBuffer, 1),
            element(2, ResourceKind::SampledTexture, 2),
        ];
        let left = BindingTable::from_reflection(&reflection).unwrap();
        let right = BindingTable::from_reflection(&reflection).unwrap();

        assert!(left.check_compatibility(&right));
        assert!(right.check_compatibility(&left));
    }

    #[test]
    fn compatibility_rejects_shape_differences() {
        let base = BindingTable::from_reflection(&[
            element(0, ResourceKind::UniformBuffer, 1),
            element(1, ResourceKind::SampledTexture, 2),
        ])
        .unwrap();

        let different_kind = BindingTable::from_reflection(&[
            element(0, ResourceKind::StorageBuffer, 1),
            element(1, ResourceKind::SampledTexture, 2),
        ])
        .unwrap();
        assert!(!base.check_compatibility(&different_kind));

        let different_count = BindingTable::from_reflection(&[
            element(0, ResourceKind::UniformBuffer, 1),
            element(1, ResourceKind::SampledTexture, 3),
        ])
        .unwrap();
        assert!(!base.check_compatibility(&different_count));

        let different_holes = BindingTable::from_reflection(&[
            element(0, ResourceKind::UniformBuffer, 1),
            element(2, ResourceKind::SampledTexture, 2),
        ])
        .unwrap();
        assert!(!base.check_compatibility(&different_holes));
    }

    #[test]
    fn unsorted_reflection_is_rejected() {
        let result = BindingTable::from_reflection(&[
            element(2, ResourceKind::UniformBuffer, 1),
            element(0, ResourceKind::SampledTexture, 1),
        ]);
        assert!(result.is_err());
    }

    fn allocated(write_frame: u64) -> AllocatedSet {
        AllocatedSet {
            allocation: DescriptorSetAllocation {
                set: vk::DescriptorSet::null(),
                pool_index: 0,
            },
            write_frame,
        }
    }

    #[test]
    fn rotation_grows_until_a_slot_retires() {
        // Frames 1..=3 with two frames in flight: the frame-1 slot becomes
        // reusable at frame 3, so the allocation count stays at two.
        let frames_in_flight = 2;
        let mut allocations: Vec<AllocatedSet> = Vec::new();

        for frame in 1..=3u64 {
            match select_rotation_slot(&allocations, frame, frames_in_flight) {
                Some(slot) => allocations[slot].write_frame = frame,
                None => allocations.push(allocated(frame)),
            }
        }

        assert_eq!(allocations.len(), 2);
        // The first slot was rewritten in frame 3, the second still holds
        // frame 2's write.
        assert_eq!(allocations[0].write_frame, 3);
        assert_eq!(allocations[1].write_frame, 2);
    }

    #[test]
    fn rotation_never_returns_an_in_flight_slot() {
        let allocations = vec![allocated(5), allocated(6)];
        assert_eq!(select_rotation_slot(&allocations, 6, 2), None);
        assert_eq!(select_rotation_slot(&allocations, 7, 2), Some(0));
    }
}
