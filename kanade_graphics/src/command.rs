use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use crate::{
    device::Device,
    encoder::{ComputeEncoder, RenderEncoder, TransferEncoder},
    queue::Workload,
    render_pass::Framebuffer,
    resource::next_resource_id,
    DeviceShared,
};

/// Command pools are not externally synchronized, so each recording thread
/// gets its own set: one pool per frame slot per queue family. Pools for a
/// slot are reset together when the frame ring recycles that slot.
pub(crate) struct Commands {
    pools: Mutex<HashMap<ThreadId, ThreadPools>>,
    frame_slot_count: usize,
}

struct ThreadPools {
    families: HashMap<u32, Vec<vk::CommandPool>>,
}

impl Commands {
    pub(crate) fn new(frame_slot_count: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            frame_slot_count,
        }
    }

    fn thread_slot_pools<'a>(
        &self,
        pools: &'a mut HashMap<ThreadId, ThreadPools>,
        shared: &DeviceShared,
        family_index: u32,
    ) -> Result<&'a Vec<vk::CommandPool>> {
        let thread_id = thread::current().id();
        let thread_pools = pools.entry(thread_id).or_insert_with(|| ThreadPools {
            families: HashMap::new(),
        });

        if !thread_pools.families.contains_key(&family_index) {
            let slot_pools = (0..self.frame_slot_count)
                .map(|_| {
                    let pool_info =
                        vk::CommandPoolCreateInfo::default().queue_family_index(family_index);
                    Ok(unsafe { shared.raw.create_command_pool(&pool_info, None)? })
                })
                .collect::<Result<Vec<_>>>()?;
            thread_pools.families.insert(family_index, slot_pools);
        }

        Ok(&thread_pools.families[&family_index])
    }

    fn allocate_from_pool(
        shared: &DeviceShared,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { shared.raw.allocate_command_buffers(&allocate_info)? };
        Ok(buffers[0])
    }

    /// Allocates one primary command buffer per frame slot for the calling
    /// thread. The returned handles stay valid across pool resets.
    pub(crate) fn allocate_frame_buffers(
        &self,
        shared: &DeviceShared,
        family_index: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut pools = self.pools.lock();
        let slot_pools = self.thread_slot_pools(&mut pools, shared, family_index)?;
        slot_pools
            .iter()
            .map(|pool| Self::allocate_from_pool(shared, *pool))
            .collect()
    }

    /// Allocates one primary buffer from the calling thread's pool for a
    /// specific frame slot. Used for the transient event-sync buffers the
    /// submission pipeline records around plan submissions.
    pub(crate) fn allocate_single(
        &self,
        shared: &DeviceShared,
        family_index: u32,
        slot: usize,
    ) -> Result<vk::CommandBuffer> {
        let mut pools = self.pools.lock();
        let slot_pools = self.thread_slot_pools(&mut pools, shared, family_index)?;
        Self::allocate_from_pool(shared, slot_pools[slot])
    }

    /// Resets every thread's pool for one frame slot. Only safe once the
    /// frame ring guarantees the slot's prior GPU work has drained.
    pub(crate) fn reset_frame_pools(&self, shared: &DeviceShared, slot: usize) -> Result<()> {
        let pools = self.pools.lock();
        for thread_pools in pools.values() {
            for slot_pools in thread_pools.families.values() {
                unsafe {
                    shared
                        .raw
                        .reset_command_pool(slot_pools[slot], vk::CommandPoolResetFlags::empty())?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn destroy(&self, shared: &DeviceShared) {
        let mut pools = self.pools.lock();
        for (_, thread_pools) in pools.drain() {
            for (_, slot_pools) in thread_pools.families {
                for pool in slot_pools {
                    unsafe {
                        shared.raw.destroy_command_pool(pool, None);
                    }
                }
            }
        }
    }
}

/// Standalone pool + buffer pair for one-off uploads that outlive the frame
/// ring. Destroyed explicitly once the submission completes.
pub(crate) fn create_upload_buffer(
    shared: &DeviceShared,
    family_index: u32,
) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(family_index)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let pool = unsafe { shared.raw.create_command_pool(&pool_info, None)? };

    let allocate_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffer = unsafe { shared.raw.allocate_command_buffers(&allocate_info)? }[0];

    Ok((pool, buffer))
}

/// Completion tracking for one command buffer: a dedicated timeline
/// semaphore plus the value bookkeeping behind the `base + n + 1` contract.
pub(crate) struct CommandBufferSync {
    pub(crate) semaphore: vk::Semaphore,
    pub(crate) base_value: AtomicU64,
    pub(crate) last_issued_value: AtomicU64,
}

impl CommandBufferSync {
    /// Timeline value that marks completion of `submission_count` recorded
    /// submissions on top of the current base.
    pub(crate) fn completion_value(&self, submission_count: usize) -> u64 {
        self.base_value.load(Ordering::Acquire) + submission_count as u64 + 1
    }

    pub(crate) fn mark_issued(&self, value: u64) {
        self.last_issued_value.store(value, Ordering::Release);
    }

    /// Advances the base past everything issued so far. Called when a
    /// frame-restricted buffer starts re-encoding in a new frame.
    pub(crate) fn rebase(&self) {
        self.base_value
            .store(self.last_issued_value.load(Ordering::Acquire), Ordering::Release);
    }
}

#[derive(Clone)]
pub(crate) struct RecordedSubmission {
    pub(crate) workload: Workload,
    /// One raw buffer per frame slot; the plan indexes by frame.
    pub(crate) buffers: Vec<vk::CommandBuffer>,
}

pub(crate) struct RecordingState {
    pub(crate) submissions: Vec<RecordedSubmission>,
    pub(crate) last_encoding_frame: u64,
}

struct CachedEncoderBuffers {
    workload: Workload,
    buffers: Vec<vk::CommandBuffer>,
}

/// An ordered container of encoder submissions. Recording is single
/// threaded per buffer: encoders mutably borrow it, so at most one encoder
/// is open at a time. The buffer owns a timeline semaphore that downstream
/// code (finalizer, sync uploads) gates on.
pub struct CommandBuffer {
    pub(crate) device: Arc<Device>,
    id: u64,
    frame_restricted: bool,
    debug_name: String,
    pub(crate) recording: Arc<Mutex<RecordingState>>,
    pub(crate) sync: Arc<CommandBufferSync>,
    encoder_cache: Vec<CachedEncoderBuffers>,
    cache_cursors: [usize; 3],
    allocated_thread: ThreadId,
}

pub struct CommandBufferDescriptor {
    /// Frame-restricted buffers are re-encoded each frame; encoding in a
    /// new frame discards the previous frame's submissions.
    pub frame_restricted: bool,
    pub debug_name: String,
}

impl Default for CommandBufferDescriptor {
    fn default() -> Self {
        Self {
            frame_restricted: true,
            debug_name: String::new(),
        }
    }
}

impl CommandBuffer {
    pub fn new(device: &Arc<Device>, descriptor: CommandBufferDescriptor) -> Result<Self> {
        let semaphore = crate::sync::create_timeline_semaphore(&device.shared.raw, 0)?;

        Ok(Self {
            device: device.clone(),
            id: next_resource_id(),
            frame_restricted: descriptor.frame_restricted,
            debug_name: descriptor.debug_name,
            recording: Arc::new(Mutex::new(RecordingState {
                submissions: Vec::new(),
                last_encoding_frame: 0,
            })),
            sync: Arc::new(CommandBufferSync {
                semaphore,
                base_value: AtomicU64::new(0),
                last_issued_value: AtomicU64::new(0),
            }),
            encoder_cache: Vec::new(),
            cache_cursors: [0; 3],
            allocated_thread: thread::current().id(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn submission_count(&self) -> usize {
        self.recording.lock().submissions.len()
    }

    /// Timeline value the buffer's semaphore reaches once all submissions
    /// recorded so far have executed.
    pub fn completion_value(&self) -> u64 {
        let count = self.recording.lock().submissions.len();
        self.sync.completion_value(count)
    }

    pub fn encode_render_commands(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
    ) -> Result<RenderEncoder<'_>> {
        self.check_frame_update();
        let buffers = self.next_encoder_buffers(Workload::Graphics)?;
        RenderEncoder::begin(self, buffers, framebuffer.clone())
    }

    pub fn encode_compute_commands(&mut self) -> Result<ComputeEncoder<'_>> {
        self.check_frame_update();
        let buffers = self.next_encoder_buffers(Workload::Compute)?;
        ComputeEncoder::begin(self, buffers)
    }

    pub fn encode_transfer_commands(&mut self) -> Result<TransferEncoder<'_>> {
        self.check_frame_update();
        let buffers = self.next_encoder_buffers(Workload::Transfer)?;
        TransferEncoder::begin(self, buffers)
    }

    /// Frame-restricted buffers reset on the first encode of a new frame:
    /// submissions clear and the semaphore base moves past everything
    /// already issued, keeping completion values monotonic.
    fn check_frame_update(&mut self) {
        if !self.frame_restricted {
            return;
        }

        let frame_count = self.device.frame_count();
        let mut recording = self.recording.lock();
        if recording.last_encoding_frame != frame_count {
            recording.last_encoding_frame = frame_count;
            recording.submissions.clear();
            self.sync.rebase();
            self.cache_cursors = [0; 3];
        }
    }

    fn next_encoder_buffers(&mut self, workload: Workload) -> Result<Vec<vk::CommandBuffer>> {
        let cursor_slot = match workload {
            Workload::Graphics => 0,
            Workload::Compute => 1,
            Workload::Transfer => 2,
        };
        let occurrence = self.cache_cursors[cursor_slot];
        self.cache_cursors[cursor_slot] += 1;

        let existing = self
            .encoder_cache
            .iter()
            .filter(|cached| cached.workload == workload)
            .nth(occurrence)
            .map(|cached| cached.buffers.clone());
        if let Some(buffers) = existing {
            return Ok(buffers);
        }

        let family_index = self.device.queues.family_index(workload);
        let buffers = self
            .device
            .commands
            .allocate_frame_buffers(&self.device.shared, family_index)?;
        self.encoder_cache.push(CachedEncoderBuffers {
            workload,
            buffers: buffers.clone(),
        });
        Ok(buffers)
    }

    pub(crate) fn push_submission(&self, workload: Workload, buffers: Vec<vk::CommandBuffer>) {
        self.recording
            .lock()
            .submissions
            .push(RecordedSubmission { workload, buffers });
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.allocated_thread != thread::current().id() {
            log::error!(
                "Command buffer '{}' destroyed from a thread different than the one that \
                 created it",
                self.debug_name
            );
            debug_assert!(false, "Command buffer destroyed on wrong thread");
        }

        let semaphore = self.sync.semaphore;
        let last_issued = self.sync.last_issued_value.load(Ordering::Acquire);
        let shared = self.device.shared.clone();
        let destroy = move || unsafe {
            shared.raw.destroy_semaphore(semaphore, None);
        };

        if last_issued > 0 {
            self.device.finalizer.push_async(
                destroy,
                vec![(semaphore, last_issued)],
                "CommandBuffer free",
            );
        } else {
            self.device.finalizer.push(destroy, "CommandBuffer free");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use ash::vk::{self, Handle};

    use super::CommandBufferSync;

    #[test]
    fn completion_value_counts_past_base() {
        let sync = CommandBufferSync {
            semaphore: vk::Semaphore::from_raw(1),
            base_value: AtomicU64::new(0),
            last_issued_value: AtomicU64::new(0),
        };

        assert_eq!(sync.completion_value(0), 1);
        assert_eq!(sync.completion_value(3), 4);
    }

    #[test]
    fn rebase_keeps_values_monotonic() {
        let sync = CommandBufferSync {
            semaphore: vk::Semaphore::from_raw(1),
            base_value: AtomicU64::new(0),
            last_issued_value: AtomicU64::new(0),
        };

        let first = sync.completion_value(2);
        sync.mark_issued(first);
        sync.rebase();

        let second = sync.completion_value(2);
        assert!(second > first);
        assert_eq!(second, first + 3);
    }
}
