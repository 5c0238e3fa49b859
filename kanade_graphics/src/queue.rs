use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use crate::{
    sync::{PooledSemaphore, SemaphorePool},
    DeviceShared,
};

/// Workload class of an encoder submission. Selects the queue family the
/// recorded commands are submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workload {
    Graphics,
    Compute,
    Transfer,
}

pub(crate) struct QueueSubmitSemaphore {
    pub(crate) semaphore: vk::Semaphore,
    pub(crate) stage_mask: vk::PipelineStageFlags2,
    /// `None` for binary semaphores.
    pub(crate) value: Option<u64>,
}

struct QueueEntry {
    raw: vk::Queue,
    family_index: u32,
    submit_lock: Mutex<()>,
}

struct PendingCommand {
    buffer: vk::CommandBuffer,
    callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    semaphore: PooledSemaphore,
    signal_value: u64,
    submitted: bool,
}

/// Completion handle returned by [`Queues::push_command`].
pub(crate) struct PushCommandResult {
    pub(crate) signal_semaphore: vk::Semaphore,
    pub(crate) signal_value: u64,
}

/// Owns the per-workload queue handles. Submission is serialized per
/// underlying queue; workloads mapped to the same family share one entry
/// and therefore one lock.
pub(crate) struct Queues {
    entries: Vec<QueueEntry>,
    graphics_entry: usize,
    compute_entry: usize,
    transfer_entry: usize,
    semaphore_pool: Mutex<SemaphorePool>,
    pending_commands: [Mutex<Vec<PendingCommand>>; 3],
}

impl Queues {
    pub(crate) fn new(shared: &DeviceShared) -> Self {
        let families = &shared.queue_families;

        let mut entries: Vec<QueueEntry> = Vec::new();
        let mut entry_for_family = |family_index: u32| -> usize {
            if let Some(position) = entries
                .iter()
                .position(|entry| entry.family_index == family_index)
            {
                return position;
            }

            let raw = unsafe { shared.raw.get_device_queue(family_index, 0) };
            entries.push(QueueEntry {
                raw,
                family_index,
                submit_lock: Mutex::new(()),
            });
            entries.len() - 1
        };

        let graphics_entry = entry_for_family(families.graphics.index);
        let compute_entry = entry_for_family(families.compute.index);
        let transfer_entry = entry_for_family(families.transfer.index);

        Self {
            entries,
            graphics_entry,
            compute_entry,
            transfer_entry,
            semaphore_pool: Mutex::new(SemaphorePool::new()),
            pending_commands: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    fn entry(&self, workload: Workload) -> &QueueEntry {
        let index = match workload {
            Workload::Graphics => self.graphics_entry,
            Workload::Compute => self.compute_entry,
            Workload::Transfer => self.transfer_entry,
        };
        &self.entries[index]
    }

    pub(crate) fn family_index(&self, workload: Workload) -> u32 {
        self.entry(workload).family_index
    }

    pub(crate) fn raw_queue(&self, workload: Workload) -> vk::Queue {
        self.entry(workload).raw
    }

    /// Submits pre-built submission batches to the workload's queue.
    pub(crate) fn submit(
        &self,
        shared: &DeviceShared,
        workload: Workload,
        submit_infos: &[vk::SubmitInfo2],
    ) -> Result<()> {
        let entry = self.entry(workload);
        let _guard = entry.submit_lock.lock();
        unsafe {
            shared
                .raw
                .queue_submit2(entry.raw, submit_infos, vk::Fence::null())?
        };
        Ok(())
    }

    /// Builds a single submission from command buffers and semaphore
    /// descriptors and submits it.
    pub(crate) fn submit_command_buffers(
        &self,
        shared: &DeviceShared,
        workload: Workload,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[QueueSubmitSemaphore],
        signal_semaphores: &[QueueSubmitSemaphore],
    ) -> Result<()> {
        let wait_semaphores_info = wait_semaphores
            .iter()
            .map(|submit_info| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(submit_info.semaphore)
                    .stage_mask(submit_info.stage_mask)
                    .value(submit_info.value.unwrap_or(0))
            })
            .collect::<Vec<_>>();

        let signal_semaphores_info = signal_semaphores
            .iter()
            .map(|submit_info| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(submit_info.semaphore)
                    .stage_mask(submit_info.stage_mask)
                    .value(submit_info.value.unwrap_or(0))
            })
            .collect::<Vec<_>>();

        let command_buffer_submit_infos = command_buffers
            .iter()
            .map(|command_buffer| {
                vk::CommandBufferSubmitInfo::default().command_buffer(*command_buffer)
            })
            .collect::<Vec<_>>();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_semaphores_info)
            .signal_semaphore_infos(&signal_semaphores_info)
            .command_buffer_infos(&command_buffer_submit_infos);

        self.submit(shared, workload, std::slice::from_ref(&submit_info))
    }

    /// Queues a recorded command buffer for deferred submission. The buffer
    /// is submitted during the next [`Queues::iterate_commands`] pass and
    /// `callback` fires once the GPU has finished with it. Returns the
    /// timeline semaphore pair other work can gate on.
    pub(crate) fn push_command(
        &self,
        shared: &DeviceShared,
        workload: Workload,
        buffer: vk::CommandBuffer,
        callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<PushCommandResult> {
        let semaphore = self.semaphore_pool.lock().retrieve(&shared.raw)?;
        let signal_value = semaphore.last_value + 1;

        self.pending_commands[workload_slot(workload)]
            .lock()
            .push(PendingCommand {
                buffer,
                callback,
                semaphore,
                signal_value,
                submitted: false,
            });

        Ok(PushCommandResult {
            signal_semaphore: semaphore.raw,
            signal_value,
        })
    }

    /// Submits deferred commands and fires callbacks of completed ones.
    /// Driven once per frame from the frame driver thread.
    pub(crate) fn iterate_commands(&self, shared: &DeviceShared) -> Result<()> {
        for workload in [Workload::Graphics, Workload::Compute, Workload::Transfer] {
            self.iterate_workload_commands(shared, workload)?;
        }
        Ok(())
    }

    fn iterate_workload_commands(&self, shared: &DeviceShared, workload: Workload) -> Result<()> {
        let mut completed = Vec::new();
        let mut to_submit = Vec::new();

        {
            let mut pending = self.pending_commands[workload_slot(workload)].lock();
            if pending.is_empty() {
                return Ok(());
            }

            let mut index = 0;
            while index < pending.len() {
                let entry = &mut pending[index];
                if entry.submitted {
                    let value = unsafe {
                        shared
                            .raw
                            .get_semaphore_counter_value(entry.semaphore.raw)
                            .unwrap_or(0)
                    };
                    if value >= entry.signal_value {
                        completed.push(pending.remove(index));
                        continue;
                    }
                } else {
                    to_submit.push((entry.buffer, entry.semaphore.raw, entry.signal_value));
                    entry.submitted = true;
                }
                index += 1;
            }
        }

        for entry in &mut completed {
            if let Some(callback) = entry.callback.take() {
                callback();
            }
            let mut recycled = entry.semaphore;
            recycled.last_value = entry.signal_value;
            self.semaphore_pool.lock().recycle(recycled);
        }

        for (buffer, semaphore, signal_value) in to_submit {
            let signal = QueueSubmitSemaphore {
                semaphore,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                value: Some(signal_value),
            };
            self.submit_command_buffers(shared, workload, &[buffer], &[], &[signal])?;
        }

        Ok(())
    }

    /// Runs every remaining callback without touching the GPU. Only valid
    /// after the device has been waited idle.
    pub(crate) fn clear_commands(&self) {
        for slot in &self.pending_commands {
            for mut entry in slot.lock().drain(..) {
                if let Some(callback) = entry.callback.take() {
                    callback();
                }
                let mut recycled = entry.semaphore;
                recycled.last_value = entry.signal_value;
                self.semaphore_pool.lock().recycle(recycled);
            }
        }
    }

    /// Synchronously executes one recorded command buffer and blocks until
    /// the GPU signals completion. Utility path for one-off uploads.
    pub(crate) fn execute_command(
        &self,
        shared: &DeviceShared,
        workload: Workload,
        buffer: vk::CommandBuffer,
    ) -> Result<()> {
        let semaphore = self.semaphore_pool.lock().retrieve(&shared.raw)?;
        let signal_value = semaphore.last_value + 1;

        let signal = QueueSubmitSemaphore {
            semaphore: semaphore.raw,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            value: Some(signal_value),
        };
        self.submit_command_buffers(shared, workload, &[buffer], &[], &[signal])?;

        crate::sync::wait_semaphore_value(&shared.raw, semaphore.raw, signal_value)?;

        let mut recycled = semaphore;
        recycled.last_value = signal_value;
        self.semaphore_pool.lock().recycle(recycled);

        Ok(())
    }

    pub(crate) fn destroy(&self, shared: &DeviceShared) {
        self.clear_commands();
        self.semaphore_pool.lock().destroy(shared);
    }
}

fn workload_slot(workload: Workload) -> usize {
    match workload {
        Workload::Graphics => 0,
        Workload::Compute => 1,
        Workload::Transfer => 2,
    }
}
