//! Last-known resource states across all recording contexts.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{ResourceStateTracker, SubresourceStateMap, TransitionBarrier};
use crate::{ResourceId, ResourceState, ALL_SUBRESOURCES};

/// One mutex covers the whole table: updates land only at context finalize,
/// so contention is negligible.
pub struct GlobalStateManager {
    entries: Mutex<HashMap<ResourceId, SubresourceStateMap>>,
}

impl GlobalStateManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, resource: ResourceId, initial: ResourceState, subresource_count: u32) {
        self.entries
            .lock()
            .unwrap()
            .insert(resource, SubresourceStateMap::new(subresource_count, initial));
    }

    pub fn unregister(&self, resource: ResourceId) {
        self.entries.lock().unwrap().remove(&resource);
    }

    pub fn is_registered(&self, resource: ResourceId) -> bool {
        self.entries.lock().unwrap().contains_key(&resource)
    }

    /// Representative global state; `None` for unregistered resources.
    pub fn global_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.entries
            .lock()
            .unwrap()
            .get(&resource)
            .map(SubresourceStateMap::uniform_state)
    }

    pub fn subresource_global_state(
        &self,
        resource: ResourceId,
        subresource: u32,
    ) -> Option<ResourceState> {
        self.entries
            .lock()
            .unwrap()
            .get(&resource)
            .map(|map| map.get(subresource))
    }

    /// Copy of the full per-subresource global map, for seeding a local
    /// tracker at first sight of a resource.
    pub fn snapshot(&self, resource: ResourceId) -> Option<SubresourceStateMap> {
        self.entries.lock().unwrap().get(&resource).cloned()
    }

    /// Prelude barriers reconciling the global model with what `tracker`
    /// assumed on first sight of each resource: global → local-initial, per
    /// subresource. Returns how many barriers were written; truncated (and
    /// logged) at `max_barriers`.
    pub fn resolve_barriers(
        &self,
        tracker: &ResourceStateTracker,
        out_barriers: &mut Vec<TransitionBarrier>,
        max_barriers: usize,
    ) -> usize {
        let entries = self.entries.lock().unwrap();
        let mut emitted = 0;
        for tracked in tracker.tracked_resources() {
            let Some(global) = entries.get(&tracked.resource) else {
                continue;
            };
            let assumed = &tracked.initial_states;
            if global.is_uniform() && assumed.is_uniform() {
                if global.uniform_state() != assumed.uniform_state() {
                    if emitted >= max_barriers {
                        log::warn!("resolve_barriers truncated at {max_barriers}");
                        break;
                    }
                    out_barriers.push(TransitionBarrier::whole_resource(
                        tracked.resource,
                        global.uniform_state(),
                        assumed.uniform_state(),
                    ));
                    emitted += 1;
                }
            } else {
                for subresource in 0..global.subresource_count() {
                    let before = global.get(subresource);
                    let after = assumed.get(subresource);
                    if before == after {
                        continue;
                    }
                    if emitted >= max_barriers {
                        log::warn!("resolve_barriers truncated at {max_barriers}");
                        return emitted;
                    }
                    out_barriers.push(TransitionBarrier::new(
                        tracked.resource,
                        before,
                        after,
                        subresource,
                    ));
                    emitted += 1;
                }
            }
        }
        emitted
    }

    /// Overwrite the global model with `tracker`'s final states. Resources
    /// the global manager has never seen are registered on the spot.
    pub fn commit_local_states(&self, tracker: &ResourceStateTracker) {
        let mut entries = self.entries.lock().unwrap();
        for tracked in tracker.tracked_resources() {
            match entries.get_mut(&tracked.resource) {
                Some(global) => {
                    if tracked.states.is_uniform() {
                        global.set_all(tracked.states.uniform_state());
                    } else {
                        for subresource in 0..tracked.states.subresource_count() {
                            global.set(subresource, tracked.states.get(subresource));
                        }
                    }
                }
                None => {
                    log::debug!(
                        "commit of untracked resource #{}; registering",
                        tracked.resource
                    );
                    entries.insert(tracked.resource, tracked.states.clone());
                }
            }
        }
    }

    pub fn registered_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for GlobalStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_query() {
        let global = GlobalStateManager::new();
        global.register(1, ResourceState::RENDER_TARGET, 4);
        assert_eq!(global.global_state(1), Some(ResourceState::RENDER_TARGET));
        assert_eq!(global.global_state(2), None);
        global.unregister(1);
        assert!(!global.is_registered(1));
    }

    #[test]
    fn commit_then_resolve_round_trip() {
        let global = GlobalStateManager::new();
        global.register(1, ResourceState::COMMON, 1);

        let mut tracker = ResourceStateTracker::new();
        tracker.require_state(1, 1, ResourceState::RENDER_TARGET, ALL_SUBRESOURCES);
        global.commit_local_states(&tracker);
        assert_eq!(global.global_state(1), Some(ResourceState::RENDER_TARGET));

        // A second tracker assumes COMMON; resolve emits RT -> COMMON.
        let mut second = ResourceStateTracker::new();
        second.require_state(1, 1, ResourceState::SHADER_RESOURCE, ALL_SUBRESOURCES);
        let mut preludes = Vec::new();
        let count = global.resolve_barriers(&second, &mut preludes, 16);
        assert_eq!(count, 1);
        assert_eq!(preludes[0].state_before, ResourceState::RENDER_TARGET);
        assert_eq!(preludes[0].state_after, ResourceState::COMMON);
    }

    #[test]
    fn resolve_skips_matching_assumptions() {
        let global = GlobalStateManager::new();
        global.register(1, ResourceState::SHADER_RESOURCE, 1);

        let mut tracker = ResourceStateTracker::new();
        tracker.track_resource(1, 1, ResourceState::SHADER_RESOURCE);
        let mut preludes = Vec::new();
        assert_eq!(global.resolve_barriers(&tracker, &mut preludes, 16), 0);
    }

    #[test]
    fn resolve_diffs_per_subresource() {
        let global = GlobalStateManager::new();
        global.register(1, ResourceState::COMMON, 3);
        {
            let mut seed = ResourceStateTracker::new();
            seed.track_resource(1, 3, ResourceState::COMMON);
            seed.require_state(1, 3, ResourceState::RENDER_TARGET, 1);
            global.commit_local_states(&seed);
        }

        let mut tracker = ResourceStateTracker::new();
        tracker.track_resource(1, 3, ResourceState::COMMON);
        let mut preludes = Vec::new();
        let count = global.resolve_barriers(&tracker, &mut preludes, 16);
        assert_eq!(count, 1);
        assert_eq!(preludes[0].subresource, 1);
        assert_eq!(preludes[0].state_before, ResourceState::RENDER_TARGET);
    }

    #[test]
    fn resolve_diffs_non_uniform_assumptions() {
        let global = GlobalStateManager::new();
        global.register(1, ResourceState::COMMON, 3);

        // A tracker seeded from a snapshot agrees per subresource even when
        // the global map is non-uniform: nothing to reconcile.
        {
            let mut seed = ResourceStateTracker::new();
            seed.track_resource(1, 3, ResourceState::COMMON);
            seed.require_state(1, 3, ResourceState::UNORDERED_ACCESS, 1);
            global.commit_local_states(&seed);
        }
        let mut tracker = ResourceStateTracker::new();
        tracker.track_resource_states(1, global.snapshot(1).unwrap());
        let mut preludes = Vec::new();
        assert_eq!(global.resolve_barriers(&tracker, &mut preludes, 16), 0);
    }

    #[test]
    fn snapshot_copies_per_subresource_states() {
        let global = GlobalStateManager::new();
        global.register(1, ResourceState::SHADER_RESOURCE, 4);
        {
            let mut seed = ResourceStateTracker::new();
            seed.track_resource(1, 4, ResourceState::SHADER_RESOURCE);
            seed.require_state(1, 4, ResourceState::COPY_DEST, 3);
            global.commit_local_states(&seed);
        }
        let snapshot = global.snapshot(1).unwrap();
        assert!(!snapshot.is_uniform());
        assert_eq!(snapshot.get(3), ResourceState::COPY_DEST);
        assert_eq!(snapshot.get(0), ResourceState::SHADER_RESOURCE);
        assert!(global.snapshot(2).is_none());
    }

    #[test]
    fn commit_registers_unknown_resources() {
        let global = GlobalStateManager::new();
        let mut tracker = ResourceStateTracker::new();
        tracker.require_state(42, 2, ResourceState::COPY_DEST, ALL_SUBRESOURCES);
        global.commit_local_states(&tracker);
        assert_eq!(global.global_state(42), Some(ResourceState::COPY_DEST));
    }
}
