use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    command::CommandBuffer,
    device::Device,
    graph::{RenderGraph, RenderGraphDescriptor, RenderGraphUsage},
    queue::QueueSubmitSemaphore,
    swapchain::RenderContext,
    sync::workload_memory_barrier,
};

impl Device {
    /// Submits a built graph's execution plan for the current frame: every
    /// run becomes one queue submission carrying its event waits/sets, its
    /// inter-queue semaphore waits at the graph's new timeline value, and
    /// its completion signals. Run semaphores are recorded in the frame
    /// ring so `begin_frame` bounds frames in flight.
    pub fn submit(self: &Arc<Self>, graph: &RenderGraph) -> Result<()> {
        let frame_index = self.frame_index();

        let mut state = graph.state.lock();
        if graph.usage() == RenderGraphUsage::Once && state.consumed {
            log::error!("Submitting a consumed Once graph; clear and rebuild it first");
            return Err(anyhow::anyhow!("Once graph already consumed"));
        }

        if state.built.is_none() {
            return Err(anyhow::anyhow!("Cannot submit a graph that has not been built"));
        }

        state.current_value += 1;
        let signal_value = state.current_value;
        let plan = state.built.as_ref().unwrap();

        let slot = if plan.sync_slot_count > 1 { frame_index } else { 0 };
        let mut ring_entries: Vec<(vk::Semaphore, u64)> = Vec::new();

        for run in &plan.runs {
            let mut command_buffers = Vec::new();

            for &submission_index in &run.submission_indices {
                let submission = &plan.submissions[submission_index];

                if !submission.wait_events.is_empty() {
                    let events = submission
                        .wait_events
                        .iter()
                        .map(|&event| plan.events[event].slots[slot])
                        .collect::<Vec<_>>();
                    let barriers = submission
                        .wait_events
                        .iter()
                        .map(|&event| workload_memory_barrier(plan.events[event].workload))
                        .collect::<Vec<_>>();

                    let aux = self.allocate_sync_commands(run.queue_family)?;
                    let dependency_infos = barriers
                        .iter()
                        .map(|barrier| {
                            vk::DependencyInfo::default()
                                .memory_barriers(std::slice::from_ref(barrier))
                        })
                        .collect::<Vec<_>>();
                    unsafe {
                        self.shared
                            .raw
                            .cmd_wait_events2(aux, &events, &dependency_infos);
                        self.shared.raw.end_command_buffer(aux)?;
                    }
                    command_buffers.push(aux);
                }

                let buffer_slot = frame_index.min(submission.buffers.len() - 1);
                command_buffers.push(submission.buffers[buffer_slot]);

                if !submission.write_events.is_empty() {
                    let aux = self.allocate_sync_commands(run.queue_family)?;
                    for &event in &submission.write_events {
                        let barrier = workload_memory_barrier(plan.events[event].workload);
                        let dependency_info = vk::DependencyInfo::default()
                            .memory_barriers(std::slice::from_ref(&barrier));
                        unsafe {
                            self.shared.raw.cmd_set_event2(
                                aux,
                                plan.events[event].slots[slot],
                                &dependency_info,
                            );
                        }
                    }
                    unsafe {
                        self.shared.raw.end_command_buffer(aux)?;
                    }
                    command_buffers.push(aux);
                }
            }

            let mut wait_semaphores = run
                .waits
                .iter()
                .map(|wait| QueueSubmitSemaphore {
                    semaphore: plan.runs[wait.run].signal_semaphores[slot],
                    stage_mask: wait.stage,
                    value: Some(signal_value),
                })
                .collect::<Vec<_>>();
            for present in &run.presents {
                wait_semaphores.push(QueueSubmitSemaphore {
                    semaphore: present.image_available[frame_index],
                    stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    value: None,
                });
            }

            let mut signal_semaphores = vec![QueueSubmitSemaphore {
                semaphore: run.signal_semaphores[slot],
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                value: Some(signal_value),
            }];
            ring_entries.push((run.signal_semaphores[slot], signal_value));

            for present in &run.presents {
                signal_semaphores.push(QueueSubmitSemaphore {
                    semaphore: present.render_complete[frame_index],
                    stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    value: None,
                });
            }

            for completion in &run.buffer_signals {
                let value = completion.sync.completion_value(completion.submission_count);
                completion.sync.mark_issued(value);
                signal_semaphores.push(QueueSubmitSemaphore {
                    semaphore: completion.sync.semaphore,
                    stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                    value: Some(value),
                });
                ring_entries.push((completion.sync.semaphore, value));
            }

            self.queues.submit_command_buffers(
                &self.shared,
                run.workload,
                &command_buffers,
                &wait_semaphores,
                &signal_semaphores,
            )?;
        }

        self.record_frame_waits(ring_entries);
        graph.post_submit(&mut state);
        Ok(())
    }

    /// Submits the dependency buffers together with the context's own
    /// command buffer and presents the acquired swapchain image. The
    /// presenting run waits on image-available and signals render-complete;
    /// the present itself waits only on render-complete.
    pub fn present(
        self: &Arc<Self>,
        context: &RenderContext,
        dependency_buffers: &[&CommandBuffer],
    ) -> Result<()> {
        let frame_count = self.frame_count();

        if context
            .last_encoding_frame
            .load(std::sync::atomic::Ordering::Acquire)
            != frame_count
        {
            log::error!("Cannot present a render context that has not been encoded this frame");
            return Err(anyhow::anyhow!("Present before encode"));
        }
        if context
            .last_present_frame
            .load(std::sync::atomic::Ordering::Acquire)
            == frame_count
        {
            log::error!("Cannot present a render context multiple times per frame");
            return Err(anyhow::anyhow!("Double present"));
        }
        context
            .last_present_frame
            .store(frame_count, std::sync::atomic::Ordering::Release);

        let graph = RenderGraph::new(
            self,
            RenderGraphDescriptor {
                usage: RenderGraphUsage::Once,
            },
        );

        for buffer in dependency_buffers {
            graph.add_buffer_node_auto(buffer)?;
        }

        let mut context_node = graph.construct_new_context_node(context);
        for buffer in dependency_buffers {
            context_node = context_node.add_execution_dependency(buffer);
        }
        context_node.add_to_graph()?;

        graph.build()?;
        self.submit(&graph)?;

        context.queue_present()
    }

    /// Transient command buffer used to record event waits/sets around a
    /// plan submission. Lives in the current frame slot's pool.
    fn allocate_sync_commands(&self, family_index: u32) -> Result<vk::CommandBuffer> {
        let aux =
            self.commands
                .allocate_single(&self.shared, family_index, self.frame_index())?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.shared.raw.begin_command_buffer(aux, &begin_info)?;
        }
        Ok(aux)
    }
}

impl RenderGraph {
    /// Adds a bare dependency node whose encoder usages are derived from
    /// the buffer's recorded submissions. Used by the present path, where
    /// dependency buffers carry no explicit resource declarations.
    pub(crate) fn add_buffer_node_auto(&self, buffer: &CommandBuffer) -> Result<()> {
        let workloads = buffer
            .recording
            .lock()
            .submissions
            .iter()
            .map(|submission| submission.workload)
            .collect::<Vec<_>>();

        let mut builder = self.construct_new_node(buffer);
        for workload in workloads {
            builder = builder.add_encoder_node(workload);
        }
        builder.add_to_graph()
    }
}
