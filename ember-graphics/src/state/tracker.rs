//! Context-local resource state tracking and pending barrier accumulation.

use super::{SubresourceStateMap, TransitionBarrier};
use crate::{ResourceId, ResourceState, ALL_SUBRESOURCES};

const DEFAULT_MAX_TRACKED: usize = 256;
const MIN_PENDING_CAPACITY: usize = 64;

/// One resource as the local tracker sees it.
#[derive(Clone, Debug)]
pub struct TrackedResourceState {
    pub resource: ResourceId,
    /// Per-subresource states this tracker assumed when it first saw the
    /// resource. The global manager reconciles against these at resolve
    /// time.
    pub initial_states: SubresourceStateMap,
    pub states: SubresourceStateMap,
}

/// Local to one recording context; single-threaded by construction
/// (`&mut self` everywhere).
pub struct ResourceStateTracker {
    tracked: Vec<TrackedResourceState>,
    max_tracked: usize,
    pending: Vec<TransitionBarrier>,
    max_pending: usize,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TRACKED)
    }

    pub fn with_capacity(max_tracked: usize) -> Self {
        let max_pending = (max_tracked / 2).max(MIN_PENDING_CAPACITY);
        Self {
            tracked: Vec::new(),
            max_tracked: max_tracked.max(1),
            pending: Vec::new(),
            max_pending,
        }
    }

    pub fn reset(&mut self) {
        self.tracked.clear();
        self.pending.clear();
    }

    /// Install (or overwrite) a resource at a uniform known state.
    pub fn track_resource(
        &mut self,
        resource: ResourceId,
        subresource_count: u32,
        state: ResourceState,
    ) {
        self.track_resource_states(resource, SubresourceStateMap::new(subresource_count, state));
    }

    /// Install (or overwrite) a resource with full per-subresource states,
    /// e.g. a snapshot of the global model.
    pub fn track_resource_states(&mut self, resource: ResourceId, states: SubresourceStateMap) {
        if let Some(entry) = self.find_mut(resource) {
            entry.states = states;
            return;
        }
        if self.tracked.len() >= self.max_tracked {
            log::error!(
                "state tracker full ({} resources); #{resource} not tracked",
                self.max_tracked
            );
            debug_assert!(false, "state tracker capacity exceeded");
            return;
        }
        self.tracked.push(TrackedResourceState {
            resource,
            initial_states: states.clone(),
            states,
        });
    }

    pub fn untrack_resource(&mut self, resource: ResourceId) {
        if let Some(index) = self.tracked.iter().position(|t| t.resource == resource) {
            self.tracked.swap_remove(index);
        }
    }

    pub fn is_tracked(&self, resource: ResourceId) -> bool {
        self.find(resource).is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn tracked_resources(&self) -> &[TrackedResourceState] {
        &self.tracked
    }

    /// Representative state; `COMMON` for resources this tracker has not
    /// seen.
    pub fn current_state(&self, resource: ResourceId) -> ResourceState {
        self.find(resource)
            .map_or(ResourceState::COMMON, |t| t.states.uniform_state())
    }

    pub fn subresource_state(&self, resource: ResourceId, subresource: u32) -> ResourceState {
        match self.find(resource) {
            Some(tracked) => {
                if subresource == ALL_SUBRESOURCES || tracked.states.is_uniform() {
                    tracked.states.uniform_state()
                } else {
                    tracked.states.get(subresource)
                }
            }
            None => ResourceState::COMMON,
        }
    }

    /// Demand that `resource` be in `required` before the next operation.
    ///
    /// A transition from the current state is appended to the pending list
    /// unless the resource is already there. Resources never seen before are
    /// implicitly tracked, assuming `COMMON` as their prior state.
    pub fn require_state(
        &mut self,
        resource: ResourceId,
        subresource_count: u32,
        required: ResourceState,
        subresource: u32,
    ) {
        if subresource != ALL_SUBRESOURCES && subresource >= subresource_count.max(1) {
            log::error!(
                "require_state: subresource {subresource} out of range for #{resource} ({subresource_count} subresources)"
            );
            debug_assert!(false, "subresource out of range");
            return;
        }

        let current = self.subresource_state(resource, subresource);
        if current == required {
            return;
        }

        if self.pending.len() < self.max_pending {
            self.pending
                .push(TransitionBarrier::new(resource, current, required, subresource));
        } else {
            log::error!(
                "pending barrier list full ({}); transition of #{resource} dropped",
                self.max_pending
            );
            debug_assert!(false, "pending barrier overflow");
        }

        if let Some(tracked) = self.find_mut(resource) {
            if subresource == ALL_SUBRESOURCES {
                tracked.states.set_all(required);
            } else {
                tracked.states.set(subresource, required);
            }
        } else {
            log::debug!("implicitly tracking #{resource} at first require_state");
            self.track_resource(resource, subresource_count, required);
            if let Some(tracked) = self.find_mut(resource) {
                tracked.initial_states.set_all(current);
            }
        }
    }

    pub fn pending_barriers(&self) -> &[TransitionBarrier] {
        &self.pending
    }

    pub fn take_pending_barriers(&mut self) -> Vec<TransitionBarrier> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    fn find(&self, resource: ResourceId) -> Option<&TrackedResourceState> {
        self.tracked.iter().find(|t| t.resource == resource)
    }

    fn find_mut(&mut self, resource: ResourceId) -> Option<&mut TrackedResourceState> {
        self.tracked.iter_mut().find(|t| t.resource == resource)
    }
}

impl Default for ResourceStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

//=============================================================================
// Test support
//=============================================================================
