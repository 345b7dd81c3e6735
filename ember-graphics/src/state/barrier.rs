//! Barrier descriptions, batching and split barriers.

use crate::error::CapacityError;
use crate::queue::TransferContext;
use crate::{ResourceId, ResourceState, ALL_SUBRESOURCES};

/// Stack capacity of a detached batch; attached batches auto-submit at this
/// mark and are effectively unbounded.
pub const MAX_BARRIERS_PER_BATCH: usize = 64;

/// Concurrent split barriers per batch.
pub const MAX_SPLIT_BARRIERS: usize = 16;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BarrierFlags: u32 {
        /// Start of a split transition.
        const BEGIN_ONLY = 1 << 0;
        /// End of a split transition; pairs with a prior BEGIN_ONLY of the
        /// same resource/subresource/before/after tuple.
        const END_ONLY   = 1 << 1;
    }
}

//=============================================================================
// Barrier descriptions
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub resource: ResourceId,
    pub subresource: u32,
    pub state_before: ResourceState,
    pub state_after: ResourceState,
    pub flags: BarrierFlags,
}

impl TransitionBarrier {
    pub fn new(
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
        subresource: u32,
    ) -> Self {
        Self {
            resource,
            subresource,
            state_before: before,
            state_after: after,
            flags: BarrierFlags::empty(),
        }
    }

    pub fn whole_resource(resource: ResourceId, before: ResourceState, after: ResourceState) -> Self {
        Self::new(resource, before, after, ALL_SUBRESOURCES)
    }

    pub fn with_flags(mut self, flags: BarrierFlags) -> Self {
        self.flags = flags;
        self
    }

    /// A transition to the state it is already in does nothing.
    pub fn is_redundant(&self) -> bool {
        self.state_before == self.state_after
    }
}

/// Synchronizes successive writes through the same UAV. `None` covers every
/// UAV-visible resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct UavBarrier {
    pub resource: Option<ResourceId>,
}

impl UavBarrier {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_resource(resource: ResourceId) -> Self {
        Self {
            resource: Some(resource),
        }
    }
}

/// Hand-over between two resources aliasing the same memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AliasingBarrier {
    pub before: Option<ResourceId>,
    pub after: Option<ResourceId>,
}

//=============================================================================
// BarrierBatch
//=============================================================================

/// Staging buffer for transition/UAV/aliasing barriers, flushed in one call.
///
/// With a context attached the batch auto-submits when full; detached, it is
/// bounded and overflow drops the barrier (fatal in debug builds).
pub struct BarrierBatch<'a> {
    context: Option<&'a mut dyn TransferContext>,
    transitions: Vec<TransitionBarrier>,
    uavs: Vec<UavBarrier>,
    aliasings: Vec<AliasingBarrier>,
}

impl<'a> BarrierBatch<'a> {
    pub fn new() -> Self {
        Self {
            context: None,
            transitions: Vec::new(),
            uavs: Vec::new(),
            aliasings: Vec::new(),
        }
    }

    pub fn with_context(context: &'a mut dyn TransferContext) -> Self {
        Self {
            context: Some(context),
            ..Self::new()
        }
    }

    pub fn add_transition(&mut self, barrier: TransitionBarrier) -> &mut Self {
        if barrier.is_redundant() {
            return self;
        }
        if self.transitions.len() >= MAX_BARRIERS_PER_BATCH && !self.try_auto_submit() {
            return self;
        }
        self.transitions.push(barrier);
        self
    }

    pub fn add_uav(&mut self, barrier: UavBarrier) -> &mut Self {
        if self.uavs.len() >= MAX_BARRIERS_PER_BATCH && !self.try_auto_submit() {
            return self;
        }
        self.uavs.push(barrier);
        self
    }

    pub fn add_aliasing(&mut self, barrier: AliasingBarrier) -> &mut Self {
        if self.aliasings.len() >= MAX_BARRIERS_PER_BATCH && !self.try_auto_submit() {
            return self;
        }
        self.aliasings.push(barrier);
        self
    }

    /// Emit everything through `context` and clear.
    pub fn submit(&mut self, context: &mut dyn TransferContext) {
        if self.is_empty() {
            return;
        }
        Self::emit(context, &self.transitions, &self.uavs, &self.aliasings);
        self.clear();
    }

    /// Emit through the attached context, if any.
    pub fn flush(&mut self) {
        if self.is_empty() {
            return;
        }
        if let Some(context) = self.context.as_deref_mut() {
            Self::emit(context, &self.transitions, &self.uavs, &self.aliasings);
            self.transitions.clear();
            self.uavs.clear();
            self.aliasings.clear();
        }
    }

    fn try_auto_submit(&mut self) -> bool {
        if self.context.is_some() {
            self.flush();
            true
        } else {
            log::error!(
                "barrier batch overflow ({MAX_BARRIERS_PER_BATCH}) with no context attached; barrier dropped"
            );
            debug_assert!(false, "barrier batch overflow");
            false
        }
    }

    fn emit(
        context: &mut dyn TransferContext,
        transitions: &[TransitionBarrier],
        uavs: &[UavBarrier],
        aliasings: &[AliasingBarrier],
    ) {
        for barrier in transitions {
            context.transition_barrier(barrier);
        }
        for barrier in uavs {
            context.uav_barrier(barrier.resource);
        }
        for barrier in aliasings {
            context.aliasing_barrier(barrier.before, barrier.after);
        }
        context.flush_barriers();
    }

    pub fn clear(&mut self) {
        self.transitions.clear();
        self.uavs.clear();
        self.aliasings.clear();
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn uav_count(&self) -> usize {
        self.uavs.len()
    }

    pub fn aliasing_count(&self) -> usize {
        self.aliasings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.uavs.is_empty() && self.aliasings.is_empty()
    }
}

impl Default for BarrierBatch<'_> {
    fn default() -> Self {
        Self::new()
    }
}

//=============================================================================
// Split barriers
//=============================================================================

/// A transition decomposed into begin/end halves so the hardware can overlap
/// the transition with unrelated work.
#[derive(Default)]
pub struct SplitBarrier {
    active: Option<TransitionBarrier>,
}

impl SplitBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(
        &mut self,
        context: &mut dyn TransferContext,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
        subresource: u32,
    ) {
        if self.active.is_some() {
            log::warn!("split barrier begun while already active; previous begin has no matching end");
            debug_assert!(false, "unpaired split barrier begin");
        }
        let barrier =
            TransitionBarrier::new(resource, before, after, subresource).with_flags(BarrierFlags::BEGIN_ONLY);
        context.transition_barrier(&barrier);
        context.flush_barriers();
        self.active = Some(barrier);
    }

    /// Replays the begin parameters with the END flag. No-op when inactive.
    pub fn end(&mut self, context: &mut dyn TransferContext) {
        let Some(begun) = self.active.take() else {
            log::warn!("split barrier end without a matching begin");
            return;
        };
        let barrier = begun.with_flags(BarrierFlags::END_ONLY);
        context.transition_barrier(&barrier);
        context.flush_barriers();
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

/// Up to [`MAX_SPLIT_BARRIERS`] concurrent splits. Overflow is a
/// configuration error reported to the caller; the begin is not recorded.
#[derive(Default)]
pub struct SplitBarrierBatch {
    barriers: Vec<SplitBarrier>,
}

impl SplitBarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_barrier(
        &mut self,
        context: &mut dyn TransferContext,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
        subresource: u32,
    ) -> Result<(), CapacityError> {
        if self.barriers.len() >= MAX_SPLIT_BARRIERS {
            let err = CapacityError {
                what: "split barrier batch",
                capacity: MAX_SPLIT_BARRIERS,
            };
            log::error!("{err}; begin dropped");
            return Err(err);
        }
        let mut barrier = SplitBarrier::new();
        barrier.begin(context, resource, before, after, subresource);
        self.barriers.push(barrier);
        Ok(())
    }

    pub fn end_all(&mut self, context: &mut dyn TransferContext) {
        for barrier in &mut self.barriers {
            barrier.end(context);
        }
        self.barriers.clear();
    }

    pub fn active_count(&self) -> usize {
        self.barriers.len()
    }
}
