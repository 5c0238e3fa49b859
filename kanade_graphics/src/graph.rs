use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use crate::{
    command::{CommandBuffer, CommandBufferSync, RecordingState},
    device::Device,
    queue::Workload,
    render_pass::Framebuffer,
    resource::{Buffer, Texture},
    swapchain::RenderContext,
    sync::workload_wait_stage,
};

/// Lifetime policy of a graph's built plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderGraphUsage {
    /// Build once, submit once. Resubmission requires `clear` + rebuild.
    Once,
    /// Build once, submit every frame. Sync objects are allocated per
    /// frame slot so overlapping frames do not alias.
    PerFrame,
    /// Cleared automatically after each submit; the caller rebuilds.
    BuildPerFrame,
}

pub struct RenderGraphDescriptor {
    pub usage: RenderGraphUsage,
}

/// Read-only view of a built plan's shape.
#[derive(Debug, Clone)]
pub struct GraphExecutionInfo {
    pub submission_count: usize,
    pub runs: Vec<GraphRunInfo>,
    pub event_count: usize,
    pub completion_semaphore_count: usize,
}

#[derive(Debug, Clone)]
pub struct GraphRunInfo {
    pub workload: Workload,
    pub submission_count: usize,
    pub wait_count: usize,
    pub presents: usize,
}

/// Source of GPU sync objects for plan construction. Implemented by
/// [`Device`]; stubbed in tests so plans build without a live device.
pub(crate) trait SyncObjectSource {
    fn create_timeline_semaphore(&self) -> Result<vk::Semaphore>;
    fn create_event(&self) -> Result<vk::Event>;
    fn queue_family_index(&self, workload: Workload) -> u32;
}

impl SyncObjectSource for Device {
    fn create_timeline_semaphore(&self) -> Result<vk::Semaphore> {
        crate::sync::create_timeline_semaphore(&self.shared.raw, 0)
    }

    fn create_event(&self) -> Result<vk::Event> {
        crate::sync::create_event(&self.shared.raw)
    }

    fn queue_family_index(&self, workload: Workload) -> u32 {
        self.queues.family_index(workload)
    }
}

/// Declared resource usage of one encoder submission.
#[derive(Debug, Clone)]
pub(crate) struct EncoderUsage {
    pub(crate) workload: Workload,
    pub(crate) reads: Vec<u64>,
    pub(crate) writes: Vec<u64>,
}

/// Swapchain semaphores a presenting node contributes to its run.
#[derive(Clone)]
pub(crate) struct PlanPresent {
    pub(crate) image_available: Vec<vk::Semaphore>,
    pub(crate) render_complete: Vec<vk::Semaphore>,
}

/// Completion signal for one command buffer, attached to the run holding
/// its last submission.
#[derive(Clone)]
pub(crate) struct PlanCompletion {
    pub(crate) sync: Arc<CommandBufferSync>,
    pub(crate) submission_count: usize,
}

/// Planner input for one graph node, snapshotted at build time.
pub(crate) struct PlanNode {
    pub(crate) id: u64,
    pub(crate) exec_deps: Vec<u64>,
    pub(crate) submissions: Vec<PlanSubmission>,
    pub(crate) present: Option<PlanPresent>,
    pub(crate) completion: Option<PlanCompletion>,
}

pub(crate) struct PlanSubmission {
    pub(crate) workload: Workload,
    /// One raw command buffer per frame slot.
    pub(crate) buffers: Vec<vk::CommandBuffer>,
    pub(crate) reads: Vec<u64>,
    pub(crate) writes: Vec<u64>,
}

/// Intra-queue event pair: set after the writing submission, waited before
/// each reading submission, with a barrier shaped by the reader's workload.
pub(crate) struct PlanEvent {
    pub(crate) slots: Vec<vk::Event>,
    pub(crate) workload: Workload,
}

pub(crate) struct RunWait {
    pub(crate) run: usize,
    pub(crate) stage: vk::PipelineStageFlags2,
}

/// One maximal contiguous sequence of same-queue submissions, submitted as
/// a single `vkQueueSubmit` batch. Wait edges reference producer runs by
/// index so later additions never invalidate earlier entries.
pub(crate) struct SubmitRun {
    pub(crate) workload: Workload,
    pub(crate) queue_family: u32,
    /// One timeline semaphore per sync slot, signaled at the graph's
    /// current value on submit.
    pub(crate) signal_semaphores: Vec<vk::Semaphore>,
    pub(crate) waits: Vec<RunWait>,
    pub(crate) submission_indices: Vec<usize>,
    pub(crate) presents: Vec<PlanPresent>,
    pub(crate) buffer_signals: Vec<PlanCompletion>,
    pub(crate) has_waiters: bool,
}

pub(crate) struct PlannedSubmission {
    pub(crate) node_id: u64,
    pub(crate) workload: Workload,
    pub(crate) run: usize,
    pub(crate) buffers: Vec<vk::CommandBuffer>,
    pub(crate) wait_events: Vec<usize>,
    pub(crate) write_events: Vec<usize>,
}

/// The built execution plan.
pub(crate) struct ExecuteData {
    pub(crate) submission_order: Vec<u64>,
    pub(crate) submissions: Vec<PlannedSubmission>,
    pub(crate) events: Vec<PlanEvent>,
    pub(crate) runs: Vec<SubmitRun>,
    /// Runs nothing waits on; their signal semaphores mark graph drain.
    pub(crate) completion_runs: Vec<usize>,
    pub(crate) sync_slot_count: usize,
}

impl ExecuteData {
    fn collect_sync_objects(&self) -> (Vec<vk::Semaphore>, Vec<vk::Event>) {
        let semaphores = self
            .runs
            .iter()
            .flat_map(|run| run.signal_semaphores.iter().copied())
            .collect();
        let events = self
            .events
            .iter()
            .flat_map(|event| event.slots.iter().copied())
            .collect();
        (semaphores, events)
    }
}

struct ResourceRecord {
    /// Dense submission index of the most recent writer; consumed by the
    /// first same-queue reader that pairs an event with it.
    last_writer: Option<usize>,
    writer_run: usize,
    writer_family: u32,
    /// Event shared by every same-queue reader of the current write.
    event: Option<usize>,
}

#[derive(Clone, Copy, PartialEq)]
enum VisitMark {
    Unvisited,
    Open,
    Done,
}

/// Builds the execution plan: topological submission order, queue-run
/// grouping, and event/semaphore placement for every declared hazard.
pub(crate) fn build_execution_plan(
    nodes: &[PlanNode],
    leaves: &[u64],
    sync_slot_count: usize,
    source: &dyn SyncObjectSource,
) -> Result<ExecuteData> {
    let index_by_id: HashMap<u64, usize> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| (node.id, index))
        .collect();

    // Post-order DFS from the leaf set over execution dependencies yields
    // an order where every node follows all of its dependencies. An
    // open-marked node reached again is a cycle.
    let mut marks = vec![VisitMark::Unvisited; nodes.len()];
    let mut order: Vec<usize> = Vec::new();
    for &leaf in leaves {
        let leaf_index = *index_by_id
            .get(&leaf)
            .ok_or_else(|| anyhow::anyhow!("Graph leaf {} is not a known node", leaf))?;
        if marks[leaf_index] != VisitMark::Unvisited {
            continue;
        }

        let mut stack: Vec<(usize, usize)> = vec![(leaf_index, 0)];
        marks[leaf_index] = VisitMark::Open;
        while let Some(&(node_index, next_dep)) = stack.last() {
            let deps = &nodes[node_index].exec_deps;
            if next_dep < deps.len() {
                stack.last_mut().unwrap().1 += 1;

                let dep_id = deps[next_dep];
                let dep_index = *index_by_id.get(&dep_id).ok_or_else(|| {
                    anyhow::anyhow!("Execution dependency {} is not a known node", dep_id)
                })?;
                match marks[dep_index] {
                    VisitMark::Unvisited => {
                        marks[dep_index] = VisitMark::Open;
                        stack.push((dep_index, 0));
                    }
                    VisitMark::Open => {
                        return Err(anyhow::anyhow!(
                            "Cycle detected in render graph execution dependencies"
                        ));
                    }
                    VisitMark::Done => {}
                }
            } else {
                marks[node_index] = VisitMark::Done;
                order.push(node_index);
                stack.pop();
            }
        }
    }

    if order.len() != nodes.len() {
        // Nodes unreachable from the leaf set only happen when every path
        // to them loops.
        return Err(anyhow::anyhow!(
            "Cycle detected in render graph execution dependencies"
        ));
    }

    let mut submissions: Vec<PlannedSubmission> = Vec::new();
    let mut events: Vec<PlanEvent> = Vec::new();
    let mut runs: Vec<SubmitRun> = Vec::new();
    let mut resources: HashMap<u64, ResourceRecord> = HashMap::new();
    let mut submission_order = Vec::with_capacity(order.len());

    for &node_index in &order {
        let node = &nodes[node_index];
        submission_order.push(node.id);

        let mut node_last_run: Option<usize> = None;
        for submission in &node.submissions {
            let family = source.queue_family_index(submission.workload);

            let open_new_run = match runs.last() {
                Some(run) => run.queue_family != family,
                None => true,
            };
            if open_new_run {
                let signal_semaphores = (0..sync_slot_count)
                    .map(|_| source.create_timeline_semaphore())
                    .collect::<Result<Vec<_>>>()?;
                runs.push(SubmitRun {
                    workload: submission.workload,
                    queue_family: family,
                    signal_semaphores,
                    waits: Vec::new(),
                    submission_indices: Vec::new(),
                    presents: Vec::new(),
                    buffer_signals: Vec::new(),
                    has_waiters: false,
                });
            }
            let run_index = runs.len() - 1;
            let submission_index = submissions.len();

            let mut wait_events = Vec::new();
            for read in &submission.reads {
                let Some(record) = resources.get_mut(read) else {
                    // Never written inside the graph; assumed externally
                    // initialized.
                    continue;
                };

                if record.writer_family == family {
                    if let Some(writer) = record.last_writer {
                        let event_index = events.len();
                        let slots = (0..sync_slot_count)
                            .map(|_| source.create_event())
                            .collect::<Result<Vec<_>>>()?;
                        events.push(PlanEvent {
                            slots,
                            workload: submission.workload,
                        });

                        submissions[writer].write_events.push(event_index);
                        wait_events.push(event_index);

                        // The hazard is now anchored to the event; later
                        // same-queue readers re-register against it.
                        record.event = Some(event_index);
                        record.last_writer = None;
                    } else if let Some(event_index) = record.event {
                        wait_events.push(event_index);
                    }
                } else {
                    add_run_wait(&mut runs, run_index, record.writer_run, submission.workload);
                }
            }

            for write in &submission.writes {
                if let Some(record) = resources.get(write) {
                    // Write-after-write across queues still needs the
                    // producer's semaphore; same-queue needs nothing.
                    if record.writer_family != family {
                        add_run_wait(&mut runs, run_index, record.writer_run, submission.workload);
                    }
                }

                resources.insert(
                    *write,
                    ResourceRecord {
                        last_writer: Some(submission_index),
                        writer_run: run_index,
                        writer_family: family,
                        event: None,
                    },
                );
            }

            submissions.push(PlannedSubmission {
                node_id: node.id,
                workload: submission.workload,
                run: run_index,
                buffers: submission.buffers.clone(),
                wait_events,
                write_events: Vec::new(),
            });
            runs[run_index].submission_indices.push(submission_index);
            node_last_run = Some(run_index);
        }

        // Presentation and completion signals belong to the run holding
        // this node's own last submission, never to whatever run another
        // node left open.
        match node_last_run {
            Some(run_index) => {
                let run = &mut runs[run_index];
                if let Some(present) = &node.present {
                    run.presents.push(present.clone());
                }
                if let Some(completion) = &node.completion {
                    run.buffer_signals.push(completion.clone());
                }
            }
            None => {
                if node.present.is_some() {
                    return Err(anyhow::anyhow!(
                        "Presenting graph node {} has no recorded submissions",
                        node.id
                    ));
                }
                // A buffer that recorded nothing issues no completion
                // signal.
            }
        }
    }

    let completion_runs = runs
        .iter()
        .enumerate()
        .filter(|(_, run)| !run.has_waiters)
        .map(|(index, _)| index)
        .collect();

    Ok(ExecuteData {
        submission_order,
        submissions,
        events,
        runs,
        completion_runs,
        sync_slot_count,
    })
}

fn add_run_wait(runs: &mut [SubmitRun], consumer: usize, producer: usize, workload: Workload) {
    if consumer == producer {
        return;
    }
    if runs[consumer].waits.iter().any(|wait| wait.run == producer) {
        return;
    }
    runs[consumer].waits.push(RunWait {
        run: producer,
        stage: workload_wait_stage(workload),
    });
    runs[producer].has_waiters = true;
}

enum NodePayload {
    Buffer {
        recording: Arc<Mutex<RecordingState>>,
        sync: Arc<CommandBufferSync>,
    },
    Context {
        recording: Arc<Mutex<RecordingState>>,
        sync: Arc<CommandBufferSync>,
        present: PlanPresent,
    },
}

pub(crate) struct GraphNode {
    id: u64,
    exec_deps: Vec<u64>,
    encoders: Vec<EncoderUsage>,
    payload: NodePayload,
}

pub(crate) struct GraphState {
    pub(crate) nodes: Vec<GraphNode>,
    leaves: Vec<u64>,
    pub(crate) built: Option<ExecuteData>,
    /// Monotonic per-graph timeline value; every run signals it on submit.
    pub(crate) current_value: u64,
    /// Set once a `Once` graph has been submitted.
    pub(crate) consumed: bool,
}

impl GraphState {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            leaves: Vec::new(),
            built: None,
            current_value: 0,
            consumed: false,
        }
    }

    fn add_node(&mut self, node: GraphNode) -> Result<()> {
        if self.nodes.iter().any(|existing| existing.id == node.id) {
            return Err(anyhow::anyhow!(
                "Adding a node to the render graph that was already added"
            ));
        }
        for dep in &node.exec_deps {
            if !self.nodes.iter().any(|existing| existing.id == *dep) {
                return Err(anyhow::anyhow!(
                    "Execution dependency {} is not in the graph",
                    dep
                ));
            }
        }

        for dep in &node.exec_deps {
            self.leaves.retain(|leaf| leaf != dep);
        }
        self.leaves.push(node.id);
        self.nodes.push(node);
        Ok(())
    }

    fn add_execution_dependency(&mut self, id: u64, depends_on: u64) -> Result<()> {
        if !self.nodes.iter().any(|node| node.id == depends_on) {
            return Err(anyhow::anyhow!("Dependency target is not in the graph"));
        }
        let node = self
            .nodes
            .iter_mut()
            .find(|node| node.id == id)
            .ok_or_else(|| anyhow::anyhow!("Dependent buffer is not in the graph"))?;

        if !node.exec_deps.contains(&depends_on) {
            node.exec_deps.push(depends_on);
        }
        self.leaves.retain(|leaf| *leaf != depends_on);
        Ok(())
    }

    fn clear_nodes(&mut self) {
        self.nodes.clear();
        self.leaves.clear();
        self.consumed = false;
    }

    /// Snapshots every node's recorded submissions and zips them with the
    /// declared encoder usages.
    fn plan_inputs(&self) -> Result<Vec<PlanNode>> {
        self.nodes
            .iter()
            .map(|node| {
                let (recording, sync, present) = match &node.payload {
                    NodePayload::Buffer { recording, sync } => (recording, sync, None),
                    NodePayload::Context {
                        recording,
                        sync,
                        present,
                    } => (recording, sync, Some(present.clone())),
                };

                let recording = recording.lock();
                if recording.submissions.len() != node.encoders.len() {
                    return Err(anyhow::anyhow!(
                        "Node {}: {} encoder declarations but {} recorded submissions",
                        node.id,
                        node.encoders.len(),
                        recording.submissions.len()
                    ));
                }

                let submissions = node
                    .encoders
                    .iter()
                    .zip(&recording.submissions)
                    .map(|(usage, recorded)| {
                        if usage.workload != recorded.workload {
                            return Err(anyhow::anyhow!(
                                "Node {}: declared workload does not match recorded submission",
                                node.id
                            ));
                        }
                        Ok(PlanSubmission {
                            workload: usage.workload,
                            buffers: recorded.buffers.clone(),
                            reads: usage.reads.clone(),
                            writes: usage.writes.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                // A node with no recorded submissions has nothing to
                // signal completion of.
                let completion = if recording.submissions.is_empty() {
                    None
                } else {
                    Some(PlanCompletion {
                        sync: sync.clone(),
                        submission_count: recording.submissions.len(),
                    })
                };

                Ok(PlanNode {
                    id: node.id,
                    exec_deps: node.exec_deps.clone(),
                    submissions,
                    present,
                    completion,
                })
            })
            .collect()
    }
}

/// A DAG of command buffers (and presenting contexts) with explicit
/// execution dependencies and per-encoder resource declarations. `add` is
/// the only cross-thread serialization point; building and submitting
/// happen on the frame driver thread.
pub struct RenderGraph {
    device: Arc<Device>,
    usage: RenderGraphUsage,
    pub(crate) state: Mutex<GraphState>,
}

impl RenderGraph {
    pub fn new(device: &Arc<Device>, descriptor: RenderGraphDescriptor) -> Self {
        Self {
            device: device.clone(),
            usage: descriptor.usage,
            state: Mutex::new(GraphState::new()),
        }
    }

    pub fn usage(&self) -> RenderGraphUsage {
        self.usage
    }

    pub fn construct_new_node<'a>(&'a self, buffer: &CommandBuffer) -> RenderGraphNodeBuilder<'a> {
        RenderGraphNodeBuilder {
            graph: self,
            id: buffer.id(),
            exec_deps: Vec::new(),
            encoders: Vec::new(),
            payload: NodePayload::Buffer {
                recording: buffer.recording.clone(),
                sync: buffer.sync.clone(),
            },
        }
    }

    /// Node for a presenting render context. The context's command buffer
    /// writes the swapchain image; its submission run picks up the
    /// swapchain's binary semaphores.
    pub fn construct_new_context_node<'a>(
        &'a self,
        context: &RenderContext,
    ) -> RenderGraphNodeBuilder<'a> {
        let source = context.graph_source();
        RenderGraphNodeBuilder {
            graph: self,
            id: source.id,
            exec_deps: Vec::new(),
            encoders: vec![EncoderUsage {
                workload: Workload::Graphics,
                reads: Vec::new(),
                writes: vec![source.swapchain_resource_id],
            }],
            payload: NodePayload::Context {
                recording: source.recording,
                sync: source.sync,
                present: PlanPresent {
                    image_available: source.image_available,
                    render_complete: source.render_complete,
                },
            },
        }
    }

    pub fn add_execution_dependency(
        &self,
        buffer: &CommandBuffer,
        depends_on: &CommandBuffer,
    ) -> Result<()> {
        let result = self
            .state
            .lock()
            .add_execution_dependency(buffer.id(), depends_on.id());
        if let Err(error) = &result {
            log::warn!("add_execution_dependency: {}", error);
        }
        result
    }

    /// Drops all nodes and the built plan.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.clear_nodes();
        if let Some(plan) = state.built.take() {
            self.dispose_plan(plan);
        }
    }

    /// Produces the execution plan. Idempotent until the graph is mutated
    /// via `clear`; a failed build leaves no partial plan behind.
    pub fn build(&self) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(plan) = state.built.take() {
            self.dispose_plan(plan);
        }

        if state.nodes.is_empty() {
            return Ok(());
        }

        let sync_slot_count = match self.usage {
            RenderGraphUsage::PerFrame => self.device.frame_buffer_count(),
            _ => 1,
        };

        let inputs = state.plan_inputs()?;
        let leaves = state.leaves.clone();
        let plan = build_execution_plan(&inputs, &leaves, sync_slot_count, self.device.as_ref())?;

        state.built = Some(plan);
        state.consumed = false;
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.state.lock().built.is_some()
    }

    /// Node ids in execution order; empty until built.
    pub fn submission_order(&self) -> Vec<u64> {
        self.state
            .lock()
            .built
            .as_ref()
            .map(|plan| plan.submission_order.clone())
            .unwrap_or_default()
    }

    /// Read-only shape of the built plan, if any.
    pub fn execution_data(&self) -> Option<GraphExecutionInfo> {
        let state = self.state.lock();
        state.built.as_ref().map(|plan| GraphExecutionInfo {
            submission_count: plan.submissions.len(),
            runs: plan
                .runs
                .iter()
                .map(|run| GraphRunInfo {
                    workload: run.workload,
                    submission_count: run.submission_indices.len(),
                    wait_count: run.waits.len(),
                    presents: run.presents.len(),
                })
                .collect(),
            event_count: plan.events.len(),
            completion_semaphore_count: plan.completion_runs.len(),
        })
    }

    pub(crate) fn post_submit(&self, state: &mut GraphState) {
        match self.usage {
            RenderGraphUsage::Once => state.consumed = true,
            RenderGraphUsage::BuildPerFrame => {
                state.clear_nodes();
                if let Some(plan) = state.built.take() {
                    self.dispose_plan(plan);
                }
            }
            RenderGraphUsage::PerFrame => {}
        }
    }

    fn dispose_plan(&self, plan: ExecuteData) {
        let (semaphores, events) = plan.collect_sync_objects();
        let shared = self.device.shared.clone();
        self.device.finalizer.push(
            move || unsafe {
                for semaphore in semaphores {
                    shared.raw.destroy_semaphore(semaphore, None);
                }
                for event in events {
                    shared.raw.destroy_event(event, None);
                }
            },
            "RenderGraph plan free",
        );
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(plan) = state.built.take() {
            self.dispose_plan(plan);
        }
    }
}

/// Builder for one graph node: its encoder resource declarations and
/// execution dependencies. Mirrors the recording order of the command
/// buffer it describes.
pub struct RenderGraphNodeBuilder<'a> {
    graph: &'a RenderGraph,
    id: u64,
    exec_deps: Vec<u64>,
    encoders: Vec<EncoderUsage>,
    payload: NodePayload,
}

impl RenderGraphNodeBuilder<'_> {
    pub fn add_encoder_node(mut self, workload: Workload) -> Self {
        self.encoders.push(EncoderUsage {
            workload,
            reads: Vec::new(),
            writes: Vec::new(),
        });
        self
    }

    fn current_encoder(&mut self) -> Option<&mut EncoderUsage> {
        if self.encoders.is_empty() {
            log::warn!("Encoder resource declared before add_encoder_node; ignored");
        }
        self.encoders.last_mut()
    }

    pub fn encoder_add_buffer_read(mut self, buffer: &Buffer) -> Self {
        let id = buffer.id();
        if let Some(encoder) = self.current_encoder() {
            encoder.reads.push(id);
        }
        self
    }

    pub fn encoder_add_buffer_write(mut self, buffer: &Buffer) -> Self {
        let id = buffer.id();
        if let Some(encoder) = self.current_encoder() {
            encoder.writes.push(id);
        }
        self
    }

    pub fn encoder_add_texture_read(mut self, texture: &Texture) -> Self {
        let id = texture.id();
        if let Some(encoder) = self.current_encoder() {
            encoder.reads.push(id);
        }
        self
    }

    pub fn encoder_add_texture_write(mut self, texture: &Texture) -> Self {
        let id = texture.id();
        if let Some(encoder) = self.current_encoder() {
            encoder.writes.push(id);
        }
        self
    }

    /// Declares the attachment usages of a framebuffer: preserved
    /// attachments read, every attachment written.
    pub fn encoder_add_framebuffer(mut self, framebuffer: &Framebuffer) -> Self {
        let (reads, writes) = framebuffer.attachment_usages();
        if let Some(encoder) = self.current_encoder() {
            encoder.reads.extend(reads);
            encoder.writes.extend(writes);
        }
        self
    }

    pub fn add_execution_dependency(mut self, depends_on: &CommandBuffer) -> Self {
        let id = depends_on.id();
        if !self.exec_deps.contains(&id) {
            self.exec_deps.push(id);
        }
        self
    }

    pub fn add_to_graph(self) -> Result<()> {
        let result = self.graph.state.lock().add_node(GraphNode {
            id: self.id,
            exec_deps: self.exec_deps,
            encoders: self.encoders,
            payload: self.payload,
        });
        if let Err(error) = &result {
            log::warn!("add_to_graph: {}", error);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use ash::vk::{self, Handle};

    use super::{
        build_execution_plan, PlanCompletion, PlanNode, PlanPresent, PlanSubmission,
        SyncObjectSource,
    };
    use crate::{command::CommandBufferSync, queue::Workload};

    /// Hands out fake handles and maps workloads to configurable families.
    struct StubSource {
        counter: AtomicU64,
        graphics_family: u32,
        compute_family: u32,
        transfer_family: u32,
    }

    impl StubSource {
        fn shared_families() -> Self {
            Self {
                counter: AtomicU64::new(1),
                graphics_family: 0,
                compute_family: 0,
                transfer_family: 0,
            }
        }

        fn dedicated_families() -> Self {
            Self {
                counter: AtomicU64::new(1),
                graphics_family: 0,
                compute_family: 1,
                transfer_family: 2,
            }
        }
    }

    impl SyncObjectSource for StubSource {
        fn create_timeline_semaphore(&self) -> anyhow::Result<vk::Semaphore> {
            Ok(vk::Semaphore::from_raw(
                self.counter.fetch_add(1, Ordering::Relaxed),
            ))
        }

        fn create_event(&self) -> anyhow::Result<vk::Event> {
            Ok(vk::Event::from_raw(
                self.counter.fetch_add(1, Ordering::Relaxed),
            ))
        }

        fn queue_family_index(&self, workload: Workload) -> u32 {
            match workload {
                Workload::Graphics => self.graphics_family,
                Workload::Compute => self.compute_family,
                Workload::Transfer => self.transfer_family,
            }
        }
    }

    fn submission(workload: Workload, reads: &[u64], writes: &[u64]) -> PlanSubmission {
        PlanSubmission {
            workload,
            buffers: vec![vk::CommandBuffer::null()],
            reads: reads.to_vec(),
            writes: writes.to_vec(),
        }
    }

    fn node(id: u64, deps: &[u64], submissions: Vec<PlanSubmission>) -> PlanNode {
        PlanNode {
            id,
            exec_deps: deps.to_vec(),
            submissions,
            present: None,
            completion: None,
        }
    }

    #[test]
    fn compute_then_render_on_shared_queue_uses_one_run_and_an_event() {
        // Node A writes b0 on compute work, node B reads b0 on graphics
        // work; both workloads map to the same family.
        let source = StubSource::shared_families();
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Compute, &[], &[100])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[100], &[200])]),
        ];

        let plan = build_execution_plan(&nodes, &[2], 1, &source).unwrap();

        assert_eq!(plan.submission_order, vec![1, 2]);
        assert_eq!(plan.runs.len(), 1);
        assert_eq!(plan.events.len(), 1);
        assert_eq!(plan.submissions[0].write_events, vec![0]);
        assert_eq!(plan.submissions[1].wait_events, vec![0]);
        assert!(plan.runs[0].waits.is_empty());
        assert_eq!(plan.completion_runs, vec![0]);
    }

    #[test]
    fn compute_queue_feeding_graphics_uses_a_semaphore_edge() {
        let source = StubSource::dedicated_families();
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Compute, &[], &[100])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[100], &[200])]),
        ];

        let plan = build_execution_plan(&nodes, &[2], 1, &source).unwrap();

        assert_eq!(plan.runs.len(), 2);
        assert!(plan.events.is_empty());

        let graphics_run = &plan.runs[1];
        assert_eq!(graphics_run.waits.len(), 1);
        assert_eq!(graphics_run.waits[0].run, 0);
        // Destination stage keyed by the reading submission's workload.
        assert_eq!(
            graphics_run.waits[0].stage,
            vk::PipelineStageFlags2::ALL_GRAPHICS
        );

        // Only the graphics run has no waiters.
        assert_eq!(plan.completion_runs, vec![1]);
    }

    #[test]
    fn several_readers_share_one_event() {
        // W writes t; R1, R2, R3 read t on the same queue. One event, one
        // write record on W, three wait records; W's last-writer index is
        // consumed by the first reader and later readers re-register.
        let source = StubSource::shared_families();
        let texture = 77;
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Graphics, &[], &[texture])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[texture], &[201])]),
            node(3, &[1], vec![submission(Workload::Graphics, &[texture], &[202])]),
            node(4, &[1], vec![submission(Workload::Graphics, &[texture], &[203])]),
        ];

        let plan = build_execution_plan(&nodes, &[2, 3, 4], 1, &source).unwrap();

        assert_eq!(plan.events.len(), 1);
        assert_eq!(plan.submissions[0].write_events, vec![0]);
        for reader in 1..4 {
            assert_eq!(plan.submissions[reader].wait_events, vec![0]);
        }
    }

    #[test]
    fn cross_queue_reader_after_event_reader_still_waits() {
        // Same-queue reader consumes the last-writer index; a later
        // compute-queue reader must still pick up the semaphore edge.
        let source = StubSource::dedicated_families();
        let buffer = 55;
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Graphics, &[], &[buffer])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[buffer], &[])]),
            node(3, &[2], vec![submission(Workload::Compute, &[buffer], &[])]),
        ];

        let plan = build_execution_plan(&nodes, &[3], 1, &source).unwrap();

        assert_eq!(plan.runs.len(), 2);
        let compute_run = &plan.runs[1];
        assert_eq!(compute_run.waits.len(), 1);
        assert_eq!(compute_run.waits[0].run, 0);
        assert_eq!(
            compute_run.waits[0].stage,
            vk::PipelineStageFlags2::COMPUTE_SHADER
        );
    }

    #[test]
    fn cross_queue_write_after_write_needs_a_semaphore() {
        let source = StubSource::dedicated_families();
        let buffer = 60;
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Compute, &[], &[buffer])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[], &[buffer])]),
        ];

        let plan = build_execution_plan(&nodes, &[2], 1, &source).unwrap();

        assert_eq!(plan.runs.len(), 2);
        assert_eq!(plan.runs[1].waits.len(), 1);
        assert_eq!(plan.runs[1].waits[0].run, 0);
        assert!(plan.events.is_empty());
    }

    #[test]
    fn same_queue_write_after_write_needs_nothing() {
        let source = StubSource::shared_families();
        let buffer = 61;
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Graphics, &[], &[buffer])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[], &[buffer])]),
        ];

        let plan = build_execution_plan(&nodes, &[2], 1, &source).unwrap();

        assert_eq!(plan.runs.len(), 1);
        assert!(plan.events.is_empty());
        assert!(plan.runs[0].waits.is_empty());
    }

    #[test]
    fn read_with_no_prior_write_is_a_no_op() {
        let source = StubSource::shared_families();
        let nodes = vec![node(
            1,
            &[],
            vec![submission(Workload::Graphics, &[999], &[])],
        )];

        let plan = build_execution_plan(&nodes, &[1], 1, &source).unwrap();

        assert!(plan.events.is_empty());
        assert!(plan.runs[0].waits.is_empty());
    }

    #[test]
    fn submission_order_respects_execution_dependencies() {
        let source = StubSource::shared_families();
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Graphics, &[], &[])]),
            node(2, &[], vec![submission(Workload::Graphics, &[], &[])]),
            node(3, &[1, 2], vec![submission(Workload::Graphics, &[], &[])]),
            node(4, &[3], vec![submission(Workload::Graphics, &[], &[])]),
        ];

        let plan = build_execution_plan(&nodes, &[4], 1, &source).unwrap();

        let position = |id: u64| {
            plan.submission_order
                .iter()
                .position(|node| *node == id)
                .unwrap()
        };
        assert!(position(1) < position(3));
        assert!(position(2) < position(3));
        assert!(position(3) < position(4));
    }

    #[test]
    fn cycle_is_reported_and_no_plan_is_left() {
        let source = StubSource::shared_families();
        // A and B depend on each other; the leaf set is empty.
        let nodes = vec![
            node(1, &[2], vec![submission(Workload::Graphics, &[], &[])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[], &[])]),
        ];

        let result = build_execution_plan(&nodes, &[], 1, &source);
        assert!(result.is_err());
    }

    #[test]
    fn presenting_node_attaches_to_its_run() {
        let source = StubSource::shared_families();
        let image_available = vk::Semaphore::from_raw(900);
        let render_complete = vk::Semaphore::from_raw(901);
        let mut present_node = node(
            2,
            &[1],
            vec![submission(Workload::Graphics, &[100], &[500])],
        );
        present_node.present = Some(PlanPresent {
            image_available: vec![image_available],
            render_complete: vec![render_complete],
        });

        let nodes = vec![
            node(1, &[], vec![submission(Workload::Compute, &[], &[100])]),
            present_node,
        ];

        let plan = build_execution_plan(&nodes, &[2], 1, &source).unwrap();

        let presenting_run = plan.runs.last().unwrap();
        assert_eq!(presenting_run.presents.len(), 1);
        assert_eq!(
            presenting_run.presents[0].render_complete[0],
            render_complete
        );
    }

    #[test]
    fn completion_signal_lands_on_the_buffers_last_run() {
        let source = StubSource::dedicated_families();
        let sync = std::sync::Arc::new(CommandBufferSync {
            semaphore: vk::Semaphore::from_raw(800),
            base_value: AtomicU64::new(0),
            last_issued_value: AtomicU64::new(0),
        });

        let mut buffer_node = node(
            1,
            &[],
            vec![
                submission(Workload::Compute, &[], &[]),
                submission(Workload::Graphics, &[], &[]),
            ],
        );
        buffer_node.completion = Some(PlanCompletion {
            sync: sync.clone(),
            submission_count: 2,
        });

        let plan = build_execution_plan(&[buffer_node], &[1], 1, &source).unwrap();

        assert_eq!(plan.runs.len(), 2);
        assert!(plan.runs[0].buffer_signals.is_empty());
        assert_eq!(plan.runs[1].buffer_signals.len(), 1);
    }

    fn state_node(id: u64, deps: &[u64]) -> super::GraphNode {
        super::GraphNode {
            id,
            exec_deps: deps.to_vec(),
            encoders: Vec::new(),
            payload: super::NodePayload::Buffer {
                recording: std::sync::Arc::new(parking_lot::Mutex::new(
                    crate::command::RecordingState {
                        submissions: Vec::new(),
                        last_encoding_frame: 0,
                    },
                )),
                sync: std::sync::Arc::new(CommandBufferSync {
                    semaphore: vk::Semaphore::from_raw(id),
                    base_value: AtomicU64::new(0),
                    last_issued_value: AtomicU64::new(0),
                }),
            },
        }
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let mut state = super::GraphState::new();
        state.add_node(state_node(1, &[])).unwrap();
        assert!(state.add_node(state_node(1, &[])).is_err());
        assert_eq!(state.nodes.len(), 1);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut state = super::GraphState::new();
        assert!(state.add_node(state_node(1, &[42])).is_err());
        assert!(state.nodes.is_empty());
    }

    #[test]
    fn adding_a_dependent_removes_the_dependency_from_the_leaves() {
        let mut state = super::GraphState::new();
        state.add_node(state_node(1, &[])).unwrap();
        state.add_node(state_node(2, &[1])).unwrap();
        assert_eq!(state.leaves, vec![2]);

        state.add_node(state_node(3, &[])).unwrap();
        assert_eq!(state.leaves, vec![2, 3]);

        state.add_execution_dependency(3, 2).unwrap();
        assert_eq!(state.leaves, vec![3]);
    }

    #[test]
    fn execution_dependency_requires_both_nodes() {
        let mut state = super::GraphState::new();
        state.add_node(state_node(1, &[])).unwrap();
        assert!(state.add_execution_dependency(1, 42).is_err());
        assert!(state.add_execution_dependency(42, 1).is_err());
    }

    #[test]
    fn clear_drops_all_nodes() {
        let mut state = super::GraphState::new();
        state.add_node(state_node(1, &[])).unwrap();
        state.add_node(state_node(2, &[1])).unwrap();
        state.clear_nodes();
        assert!(state.nodes.is_empty());
        assert!(state.leaves.is_empty());
    }

    #[test]
    fn empty_node_does_not_attach_its_completion_to_another_run() {
        let source = StubSource::shared_families();
        let sync = std::sync::Arc::new(CommandBufferSync {
            semaphore: vk::Semaphore::from_raw(810),
            base_value: AtomicU64::new(0),
            last_issued_value: AtomicU64::new(0),
        });

        // Node 2 recorded nothing; its completion must not land on node
        // 1's run just because that run is the last one open.
        let mut empty_node = node(2, &[1], vec![]);
        empty_node.completion = Some(PlanCompletion {
            sync,
            submission_count: 0,
        });
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Graphics, &[], &[])]),
            empty_node,
        ];

        let plan = build_execution_plan(&nodes, &[2], 1, &source).unwrap();

        assert_eq!(plan.runs.len(), 1);
        assert!(plan.runs[0].buffer_signals.is_empty());
    }

    #[test]
    fn presenting_node_without_submissions_is_an_error() {
        let source = StubSource::shared_families();
        let mut present_node = node(2, &[1], vec![]);
        present_node.present = Some(PlanPresent {
            image_available: vec![vk::Semaphore::from_raw(910)],
            render_complete: vec![vk::Semaphore::from_raw(911)],
        });
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Graphics, &[], &[])]),
            present_node,
        ];

        assert!(build_execution_plan(&nodes, &[2], 1, &source).is_err());
    }

    #[test]
    fn rebuilding_produces_an_equivalent_plan() {
        let build = || {
            let source = StubSource::dedicated_families();
            let nodes = vec![
                node(1, &[], vec![submission(Workload::Compute, &[], &[100])]),
                node(2, &[1], vec![submission(Workload::Graphics, &[100], &[])]),
            ];
            build_execution_plan(&nodes, &[2], 1, &source).unwrap()
        };

        let first = build();
        let second = build();

        assert_eq!(first.submission_order, second.submission_order);
        assert_eq!(first.runs.len(), second.runs.len());
        assert_eq!(first.events.len(), second.events.len());
        assert_eq!(first.completion_runs, second.completion_runs);
        for (left, right) in first.runs.iter().zip(&second.runs) {
            assert_eq!(left.queue_family, right.queue_family);
            assert_eq!(left.submission_indices, right.submission_indices);
            assert_eq!(left.waits.len(), right.waits.len());
        }
    }

    #[test]
    fn per_frame_plans_allocate_sync_objects_per_slot() {
        let source = StubSource::shared_families();
        let nodes = vec![
            node(1, &[], vec![submission(Workload::Graphics, &[], &[100])]),
            node(2, &[1], vec![submission(Workload::Graphics, &[100], &[])]),
        ];

        let plan = build_execution_plan(&nodes, &[2], 3, &source).unwrap();

        assert_eq!(plan.runs[0].signal_semaphores.len(), 3);
        assert_eq!(plan.events[0].slots.len(), 3);
    }
}
