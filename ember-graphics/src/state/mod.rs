//! Per-subresource state, barrier batching and cross-context reconciliation.

mod barrier;
mod global;
mod scope;
mod tracker;
mod validate;

pub use barrier::{
    AliasingBarrier, BarrierBatch, BarrierFlags, SplitBarrier, SplitBarrierBatch,
    TransitionBarrier, UavBarrier, MAX_BARRIERS_PER_BATCH, MAX_SPLIT_BARRIERS,
};
pub use global::GlobalStateManager;
pub use scope::AutoBarrierScope;
pub use tracker::{ResourceStateTracker, TrackedResourceState};
pub use validate::{
    StateValidator, ValidationStats, MESSAGE_ACCESS_MISMATCH, MESSAGE_REDUNDANT_TRANSITION,
};

#[cfg(test)]
pub(crate) use tracker::test_support;

use crate::{ResourceState, ALL_SUBRESOURCES};

//=============================================================================
// SubresourceStateMap
//=============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Repr {
    /// One state covers all subresources.
    Uniform(ResourceState),
    /// Dense per-subresource states.
    PerSubresource(Vec<ResourceState>),
}

/// State of every subresource of one resource, compressed to a single value
/// while they agree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubresourceStateMap {
    count: u32,
    repr: Repr,
}

impl SubresourceStateMap {
    pub fn new(subresource_count: u32, initial: ResourceState) -> Self {
        Self {
            count: subresource_count.max(1),
            repr: Repr::Uniform(initial),
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.count
    }

    pub fn is_uniform(&self) -> bool {
        matches!(self.repr, Repr::Uniform(_))
    }

    /// Uniform state when `is_uniform()`, otherwise a representative element
    /// (callers must check).
    pub fn uniform_state(&self) -> ResourceState {
        match &self.repr {
            Repr::Uniform(state) => *state,
            Repr::PerSubresource(states) => states[0],
        }
    }

    /// Always collapses back to uniform storage.
    pub fn set_all(&mut self, state: ResourceState) {
        self.repr = Repr::Uniform(state);
    }

    /// Returns false if `index` is out of range (including
    /// [`ALL_SUBRESOURCES`], which routes through [`Self::set_all`]).
    pub fn set(&mut self, index: u32, state: ResourceState) -> bool {
        if index == ALL_SUBRESOURCES {
            self.set_all(state);
            return true;
        }
        if index >= self.count {
            return false;
        }
        match &mut self.repr {
            Repr::Uniform(current) => {
                if *current == state {
                    return true;
                }
                let mut states = vec![*current; self.count as usize];
                states[index as usize] = state;
                self.repr = Repr::PerSubresource(states);
            }
            Repr::PerSubresource(states) => {
                states[index as usize] = state;
                if states.iter().all(|s| *s == state) {
                    self.repr = Repr::Uniform(state);
                }
            }
        }
        true
    }

    /// O(1) in either representation. Out-of-range indices (and
    /// [`ALL_SUBRESOURCES`]) report the representative state.
    pub fn get(&self, index: u32) -> ResourceState {
        match &self.repr {
            Repr::Uniform(state) => *state,
            Repr::PerSubresource(states) => {
                if index == ALL_SUBRESOURCES || index >= self.count {
                    states[0]
                } else {
                    states[index as usize]
                }
            }
        }
    }
}
