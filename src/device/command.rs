//! Command recording.
//!
//! Work is recorded into a [`CommandList`] and executed when submitted to a
//! queue. Within a queue, ordering between dependent operations is expressed
//! only through [`Command::Transition`] and [`Command::UavBarrier`]; across
//! queues through [`Command::Wait`].

use bytemuck::Pod;

use super::{
    BufferId, HeapId, PipelineId, ProgramIdentifier, ResourceId, ResourceState, TextureId,
    TriangleGeometryDesc,
};

/// Hardware queue class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
}

/// Monotonic per-queue submission counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionId {
    pub queue: QueueKind,
    pub value: u64,
}

/// Global resources shared by every record of a ray dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalBindings {
    /// Hit-shading constants (sun, ambient, shadow parameters, flags).
    pub hit_constants: BufferId,
    /// Per-frame camera constants.
    pub frame_constants: BufferId,
    /// Per-object vertex/index ranges.
    pub geometry_info: BufferId,
    /// Per-material shading parameters.
    pub materials: BufferId,
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub top_level: BufferId,
    pub output: TextureId,
    pub depth: TextureId,
    pub normal: TextureId,
    pub shadow_map: TextureId,
}

/// Location and stride of a bound record table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTableView {
    pub buffer: BufferId,
    pub stride: u64,
    pub size: u64,
}

impl RecordTableView {
    /// Number of records covered by the view.
    pub fn count(&self) -> u64 {
        if self.stride == 0 {
            0
        } else {
            self.size / self.stride
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    pub ray_generation: ProgramIdentifier,
    pub miss: ProgramIdentifier,
    pub hit_groups: RecordTableView,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A recorded GPU operation.
#[derive(Debug, Clone)]
pub enum Command {
    WriteBuffer {
        buffer: BufferId,
        offset: u64,
        data: Vec<u8>,
    },
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Memory-visibility fence. `None` covers every resource.
    UavBarrier { resource: Option<ResourceId> },
    BuildBottomLevel {
        geometries: Vec<TriangleGeometryDesc>,
        dest: BufferId,
        scratch: BufferId,
    },
    BuildTopLevel {
        instances: BufferId,
        instance_count: u32,
        dest: BufferId,
        scratch: BufferId,
    },
    SetDescriptorHeap(HeapId),
    SetPipeline(PipelineId),
    SetGlobalBindings(GlobalBindings),
    DispatchRays(DispatchRaysDesc),
    ClearTexture {
        texture: TextureId,
        value: [f32; 4],
    },
    /// `output = dst = current * weight + src * (1 - weight)`
    TemporalBlend {
        current: TextureId,
        history_src: TextureId,
        history_dst: TextureId,
        output: TextureId,
        weight: f32,
    },
    /// Block this queue until another queue's submission has retired.
    Wait(SubmissionId),
}

/// Ordered list of commands for one queue.
#[derive(Debug)]
pub struct CommandList {
    queue: QueueKind,
    label: String,
    commands: Vec<Command>,
    raster_bindings_valid: bool,
}

impl CommandList {
    pub fn new(queue: QueueKind, label: impl Into<String>) -> Self {
        Self {
            queue,
            label: label.into(),
            commands: Vec::new(),
            raster_bindings_valid: false,
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Whether descriptor state must be re-established before rasterized draws.
    ///
    /// Becomes true after a ray dispatch, cleared by [`Self::set_descriptor_heap`].
    pub fn needs_rebind(&self) -> bool {
        !self.raster_bindings_valid
    }

    pub fn push(&mut self, command: Command) {
        if matches!(command, Command::DispatchRays(_)) {
            self.raster_bindings_valid = false;
        }
        if matches!(command, Command::SetDescriptorHeap(_)) {
            self.raster_bindings_valid = true;
        }
        self.commands.push(command);
    }

    pub fn write_bytes(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        self.push(Command::WriteBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    pub fn write_buffer<T: Pod>(&mut self, buffer: BufferId, offset: u64, value: &T) {
        self.write_bytes(buffer, offset, bytemuck::bytes_of(value));
    }

    pub fn transition(
        &mut self,
        resource: impl Into<ResourceId>,
        before: ResourceState,
        after: ResourceState,
    ) {
        if before != after {
            self.push(Command::Transition {
                resource: resource.into(),
                before,
                after,
            });
        }
    }

    pub fn uav_barrier(&mut self, resource: Option<ResourceId>) {
        self.push(Command::UavBarrier { resource });
    }

    pub fn set_descriptor_heap(&mut self, heap: HeapId) {
        self.push(Command::SetDescriptorHeap(heap));
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineId) {
        self.push(Command::SetPipeline(pipeline));
    }

    pub fn set_global_bindings(&mut self, bindings: GlobalBindings) {
        self.push(Command::SetGlobalBindings(bindings));
    }

    pub fn dispatch_rays(&mut self, desc: DispatchRaysDesc) {
        self.push(Command::DispatchRays(desc));
    }

    pub fn clear_texture(&mut self, texture: TextureId, value: [f32; 4]) {
        self.push(Command::ClearTexture { texture, value });
    }

    pub fn wait(&mut self, submission: SubmissionId) {
        self.push(Command::Wait(submission));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_dispatch() -> DispatchRaysDesc {
        let id = ProgramIdentifier([0; 32]);
        DispatchRaysDesc {
            ray_generation: id,
            miss: id,
            hit_groups: RecordTableView {
                buffer: BufferId(0),
                stride: 64,
                size: 128,
            },
            width: 1,
            height: 1,
            depth: 1,
        }
    }

    #[test]
    fn test_dispatch_invalidates_raster_bindings() {
        let mut list = CommandList::new(QueueKind::Graphics, "frame");
        list.set_descriptor_heap(HeapId(0));
        assert!(!list.needs_rebind());
        list.dispatch_rays(dummy_dispatch());
        assert!(list.needs_rebind());
        list.set_descriptor_heap(HeapId(0));
        assert!(!list.needs_rebind());
    }

    #[test]
    fn test_noop_transition_skipped() {
        let mut list = CommandList::new(QueueKind::Graphics, "frame");
        list.transition(BufferId(1), ResourceState::Common, ResourceState::Common);
        assert!(list.is_empty());
        list.transition(BufferId(1), ResourceState::Common, ResourceState::CopyDest);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_view_count() {
        assert_eq!(dummy_dispatch().hit_groups.count(), 2);
    }
}
