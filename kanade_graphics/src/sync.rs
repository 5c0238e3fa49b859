use anyhow::Result;
use ash::vk;

use crate::{queue::Workload, DeviceShared};

pub(crate) fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> Result<vk::Semaphore> {
    let mut semaphore_type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut semaphore_type_info);

    let raw = unsafe { device.create_semaphore(&semaphore_info, None)? };
    Ok(raw)
}

pub(crate) fn create_binary_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    let raw = unsafe { device.create_semaphore(&semaphore_info, None)? };
    Ok(raw)
}

pub(crate) fn create_event(device: &ash::Device) -> Result<vk::Event> {
    let event_info = vk::EventCreateInfo::default().flags(vk::EventCreateFlags::DEVICE_ONLY);
    let raw = unsafe { device.create_event(&event_info, None)? };
    Ok(raw)
}

/// Blocks the calling thread until `semaphore` reaches `value`.
pub(crate) fn wait_semaphore_value(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
) -> Result<()> {
    let semaphores = [semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);

    unsafe { device.wait_semaphores(&wait_info, u64::MAX)? };
    Ok(())
}

/// Memory barrier covering the write->read hazard of one workload class,
/// used for the graph's intra-queue event dependencies.
pub(crate) fn workload_memory_barrier(workload: Workload) -> vk::MemoryBarrier2<'static> {
    match workload {
        Workload::Graphics => vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_GRAPHICS)
            .src_access_mask(
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_GRAPHICS)
            .dst_access_mask(
                vk::AccessFlags2::SHADER_READ
                    | vk::AccessFlags2::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
        Workload::Compute => vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
            .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ),
        Workload::Transfer => vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ),
    }
}

/// Destination stage a cross-queue wait resolves against, keyed by the
/// reading submission's workload.
pub(crate) fn workload_wait_stage(workload: Workload) -> vk::PipelineStageFlags2 {
    match workload {
        Workload::Graphics => vk::PipelineStageFlags2::ALL_GRAPHICS,
        Workload::Compute => vk::PipelineStageFlags2::COMPUTE_SHADER,
        Workload::Transfer => vk::PipelineStageFlags2::ALL_TRANSFER,
    }
}

/// Reuse pool for timeline semaphores handed out by the queue manager.
/// A recycled semaphore keeps counting upward from its last value, so the
/// pool tracks the value alongside the handle.
pub(crate) struct SemaphorePool {
    free: Vec<PooledSemaphore>,
}

#[derive(Clone, Copy)]
pub(crate) struct PooledSemaphore {
    pub(crate) raw: vk::Semaphore,
    pub(crate) last_value: u64,
}

impl SemaphorePool {
    pub(crate) fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub(crate) fn retrieve(&mut self, device: &ash::Device) -> Result<PooledSemaphore> {
        if let Some(semaphore) = self.free.pop() {
            return Ok(semaphore);
        }

        Ok(PooledSemaphore {
            raw: create_timeline_semaphore(device, 0)?,
            last_value: 0,
        })
    }

    pub(crate) fn recycle(&mut self, semaphore: PooledSemaphore) {
        self.free.push(semaphore);
    }

    pub(crate) fn destroy(&mut self, shared: &DeviceShared) {
        for semaphore in self.free.drain(..) {
            unsafe {
                shared.raw.destroy_semaphore(semaphore.raw, None);
            }
        }
    }
}
