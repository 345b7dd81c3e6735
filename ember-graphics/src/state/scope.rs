//! Auto-barrier recording scope.

use super::{GlobalStateManager, ResourceStateTracker};
use crate::queue::TransferContext;
use crate::resource::{Buffer, Texture};
use crate::{ResourceId, ResourceState, ALL_SUBRESOURCES};

/// Binds a state tracker to a recording context for the lifetime of a
/// recording pass.
///
/// Operations declare intent (`use_as_*`); each intent maps to exactly one
/// required state and feeds [`ResourceStateTracker::require_state`]. Only
/// transitions that differ from the local model are emitted. When a global
/// manager is attached, a resource's first sight seeds the local model from
/// the global state, so the cross-context hand-off transition lands in this
/// scope's pending list.
pub struct AutoBarrierScope<'a> {
    context: &'a mut dyn TransferContext,
    global: Option<&'a GlobalStateManager>,
    tracker: ResourceStateTracker,
    finalized: bool,
}

impl<'a> AutoBarrierScope<'a> {
    pub fn new(context: &'a mut dyn TransferContext, global: Option<&'a GlobalStateManager>) -> Self {
        Self {
            context,
            global,
            tracker: ResourceStateTracker::new(),
            finalized: false,
        }
    }

    //=====================================================================
    // Texture intents
    //=====================================================================

    pub fn use_as_shader_resource(&mut self, texture: &Texture, subresource: u32) {
        self.require_texture(texture, ResourceState::SHADER_RESOURCE, subresource);
    }

    pub fn use_as_render_target(&mut self, texture: &Texture, subresource: u32) {
        self.require_texture(texture, ResourceState::RENDER_TARGET, subresource);
    }

    pub fn use_as_depth_stencil(&mut self, texture: &Texture, write: bool) {
        let state = if write {
            ResourceState::DEPTH_WRITE
        } else {
            ResourceState::DEPTH_READ
        };
        self.require_texture(texture, state, ALL_SUBRESOURCES);
    }

    pub fn use_as_uav(&mut self, texture: &Texture, subresource: u32) {
        self.require_texture(texture, ResourceState::UNORDERED_ACCESS, subresource);
    }

    pub fn use_as_copy_dest(&mut self, texture: &Texture) {
        self.require_texture(texture, ResourceState::COPY_DEST, ALL_SUBRESOURCES);
    }

    pub fn use_as_copy_source(&mut self, texture: &Texture) {
        self.require_texture(texture, ResourceState::COPY_SOURCE, ALL_SUBRESOURCES);
    }

    pub fn use_as_present_source(&mut self, texture: &Texture) {
        self.require_texture(texture, ResourceState::PRESENT, ALL_SUBRESOURCES);
    }

    //=====================================================================
    // Buffer intents
    //=====================================================================

    pub fn use_as_vertex_buffer(&mut self, buffer: &Buffer) {
        self.require_buffer(buffer, ResourceState::VERTEX_BUFFER);
    }

    pub fn use_as_index_buffer(&mut self, buffer: &Buffer) {
        self.require_buffer(buffer, ResourceState::INDEX_BUFFER);
    }

    pub fn use_as_constant_buffer(&mut self, buffer: &Buffer) {
        self.require_buffer(buffer, ResourceState::CONSTANT_BUFFER);
    }

    pub fn use_as_indirect_argument(&mut self, buffer: &Buffer) {
        self.require_buffer(buffer, ResourceState::INDIRECT_ARGUMENT);
    }

    pub fn use_as_uav_buffer(&mut self, buffer: &Buffer) {
        self.require_buffer(buffer, ResourceState::UNORDERED_ACCESS);
    }

    pub fn use_as_copy_dest_buffer(&mut self, buffer: &Buffer) {
        self.require_buffer(buffer, ResourceState::COPY_DEST);
    }

    pub fn use_as_copy_source_buffer(&mut self, buffer: &Buffer) {
        self.require_buffer(buffer, ResourceState::COPY_SOURCE);
    }

    //=====================================================================
    // Barriers
    //=====================================================================

    /// Immediate UAV barrier (write-write hazard on the same resource).
    pub fn uav_barrier(&mut self, resource: Option<ResourceId>) {
        self.context.uav_barrier(resource);
        self.context.flush_barriers();
    }

    /// Drain pending transitions into the context, in insertion order.
    pub fn flush_barriers(&mut self) {
        let pending = self.tracker.take_pending_barriers();
        if pending.is_empty() {
            return;
        }
        for barrier in &pending {
            self.context.transition_barrier(barrier);
        }
        self.context.flush_barriers();
    }

    /// Flush once more and publish final states to the global manager.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.flush_barriers();
        if let Some(global) = self.global {
            global.commit_local_states(&self.tracker);
        }
        self.finalized = true;
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.pending_barriers().len()
    }

    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    fn require_texture(&mut self, texture: &Texture, state: ResourceState, subresource: u32) {
        self.require(texture.id(), texture.subresource_count(), state, subresource);
    }

    fn require_buffer(&mut self, buffer: &Buffer, state: ResourceState) {
        self.require(buffer.id(), 1, state, ALL_SUBRESOURCES);
    }

    fn require(
        &mut self,
        resource: ResourceId,
        subresource_count: u32,
        state: ResourceState,
        subresource: u32,
    ) {
        // First sight of a resource adopts the global model's full
        // per-subresource view of it, so the transition out of the previous
        // context's final state is the one recorded here.
        if !self.tracker.is_tracked(resource) {
            if let Some(global_states) = self.global.and_then(|g| g.snapshot(resource)) {
                self.tracker.track_resource_states(resource, global_states);
            }
        }
        self.tracker
            .require_state(resource, subresource_count, state, subresource);
    }
}

impl Drop for AutoBarrierScope<'_> {
    fn drop(&mut self) {
        self.finalize();
    }
}
