use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use parking_lot::{Mutex, RwLock};
use raw_window_handle::RawDisplayHandle;

use crate::{
    command::{create_upload_buffer, Commands},
    finalizer::FinalizerQueue,
    queue::{Queues, Workload},
    DeviceShared, MAX_FRAMES_IN_FLIGHT,
};

pub struct DeviceDescriptor {
    pub application_name: String,
    pub application_version: u32,
    /// Number of frames the CPU may run ahead of the GPU, clamped to
    /// `1..=MAX_FRAMES_IN_FLIGHT`.
    pub frame_buffer_count: u32,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            application_name: String::from("kanade"),
            application_version: vk::make_api_version(0, 1, 0, 0),
            frame_buffer_count: 2,
        }
    }
}

struct FrameCounters {
    frame_count: u64,
    frame_index: usize,
}

/// The process-level rendering device: logical device state, queue
/// manager, command pools, finalizer queue, and the frame lifecycle
/// counters everything else keys off. Created once; passed around as
/// `Arc<Device>` with interior mutability where subsystems need it.
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) queues: Queues,
    pub(crate) commands: Commands,
    pub(crate) finalizer: FinalizerQueue,
    /// Placeholder layout for set-index holes in pipeline layouts.
    pub(crate) empty_descriptor_set_layout: vk::DescriptorSetLayout,
    frame_buffer_count: usize,
    frame_counters: RwLock<FrameCounters>,
    /// Per frame slot: semaphore values the slot's previous use signaled.
    frame_wait_ring: Mutex<Vec<Vec<(vk::Semaphore, u64)>>>,
}

impl Device {
    pub fn new(
        descriptor: DeviceDescriptor,
        display_handle: RawDisplayHandle,
    ) -> Result<Arc<Self>> {
        let frame_buffer_count = descriptor.frame_buffer_count.clamp(1, MAX_FRAMES_IN_FLIGHT as u32);
        if frame_buffer_count != descriptor.frame_buffer_count {
            log::warn!(
                "Frame buffer count {} clamped to {}",
                descriptor.frame_buffer_count,
                frame_buffer_count
            );
        }
        let frame_buffer_count = frame_buffer_count as usize;

        let shared = Arc::new(DeviceShared::new(
            display_handle,
            &descriptor.application_name,
            descriptor.application_version,
        )?);

        let queues = Queues::new(&shared);
        let commands = Commands::new(frame_buffer_count);
        let finalizer = FinalizerQueue::new(frame_buffer_count as u32);

        let empty_layout_info = vk::DescriptorSetLayoutCreateInfo::default();
        let empty_descriptor_set_layout = unsafe {
            shared
                .raw
                .create_descriptor_set_layout(&empty_layout_info, None)?
        };

        log::debug!("Device ready with {} frames in flight", frame_buffer_count);

        Ok(Arc::new(Self {
            shared,
            queues,
            commands,
            finalizer,
            empty_descriptor_set_layout,
            frame_buffer_count,
            frame_counters: RwLock::new(FrameCounters {
                frame_count: 0,
                frame_index: 0,
            }),
            frame_wait_ring: Mutex::new(vec![Vec::new(); frame_buffer_count]),
        }))
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counters.read().frame_count
    }

    pub fn frame_index(&self) -> usize {
        self.frame_counters.read().frame_index
    }

    pub fn frame_buffer_count(&self) -> usize {
        self.frame_buffer_count
    }

    /// Advances the frame counters and blocks until the new slot's previous
    /// GPU work has drained, bounding the number of frames in flight. Then
    /// recycles the slot's command pools.
    pub fn begin_frame(&self) -> Result<()> {
        let frame_index = {
            let mut counters = self.frame_counters.write();
            counters.frame_count += 1;
            counters.frame_index = (counters.frame_count % self.frame_buffer_count as u64) as usize;
            counters.frame_index
        };

        let waits = std::mem::take(&mut self.frame_wait_ring.lock()[frame_index]);
        if !waits.is_empty() {
            let semaphores = waits.iter().map(|(semaphore, _)| *semaphore).collect::<Vec<_>>();
            let values = waits.iter().map(|(_, value)| *value).collect::<Vec<_>>();
            let wait_info = vk::SemaphoreWaitInfo::default()
                .semaphores(&semaphores)
                .values(&values);
            unsafe {
                self.shared.raw.wait_semaphores(&wait_info, u64::MAX)?;
            }
        }

        self.commands.reset_frame_pools(&self.shared, frame_index)?;
        Ok(())
    }

    /// Drives deferred queue submissions (firing completion callbacks) and
    /// one finalizer pass.
    pub fn end_frame(&self) -> Result<()> {
        self.queues.iterate_commands(&self.shared)?;
        self.finalizer.iterate(&self.shared.raw, false);
        Ok(())
    }

    pub(crate) fn record_frame_waits(&self, entries: Vec<(vk::Semaphore, u64)>) {
        let frame_index = self.frame_index();
        self.frame_wait_ring.lock()[frame_index].extend(entries);
    }

    /// Records and synchronously executes one command buffer on the given
    /// workload's queue, blocking until the GPU completes it.
    pub fn execute_command(
        self: &Arc<Self>,
        workload: Workload,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<()> {
        let family_index = self.queues.family_index(workload);
        let (pool, command_buffer) = create_upload_buffer(&self.shared, family_index)?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.shared
                .raw
                .begin_command_buffer(command_buffer, &begin_info)?;
        }
        record(&self.shared.raw, command_buffer);
        unsafe {
            self.shared.raw.end_command_buffer(command_buffer)?;
        }

        self.queues
            .execute_command(&self.shared, workload, command_buffer)?;

        unsafe { self.shared.raw.destroy_command_pool(pool, None) };
        Ok(())
    }

    /// Blocks until every queue is idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.shared.raw.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::trace!("Device shutdown begin");

        if let Err(error) = unsafe { self.shared.raw.device_wait_idle() } {
            log::error!("device_wait_idle failed during shutdown: {}", error);
        }

        // Two forced passes: destructors running in the first pass may
        // enqueue further entries.
        self.queues.clear_commands();
        self.finalizer.iterate(&self.shared.raw, true);
        self.finalizer.iterate(&self.shared.raw, true);

        self.queues.destroy(&self.shared);
        self.commands.destroy(&self.shared);
        unsafe {
            self.shared
                .raw
                .destroy_descriptor_set_layout(self.empty_descriptor_set_layout, None);
        }

        log::trace!("Device shutdown complete");
    }
}
