//! VRAM budget tracking, LRU eviction and texture streaming control.

use std::sync::Arc;

use crate::device::Device;
use crate::ResourceId;

//=============================================================================
// ResidencyManager
//=============================================================================

#[derive(Clone, Copy, Debug)]
pub struct ResidencyConfig {
    pub max_vram_bytes: u64,
    /// Usage ratio above which eviction runs at frame end.
    pub eviction_threshold: f64,
    /// Usage ratio eviction drives down to.
    pub eviction_target: f64,
    /// Frames a resource must sit unused before it is evictable.
    pub unused_frames_before_evict: u64,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            max_vram_bytes: 0,
            eviction_threshold: 0.9,
            eviction_target: 0.7,
            unused_frames_before_evict: 60,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidencyStatus {
    Resident,
    Evicted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResidencyPriority {
    Low,
    Normal,
    High,
    /// Never selected for eviction.
    Maximum,
}

#[derive(Clone, Copy, Debug)]
struct ResidencyEntry {
    resource: ResourceId,
    size: u64,
    priority: ResidencyPriority,
    last_used_frame: u64,
    last_used_fence_value: u64,
    status: ResidencyStatus,
}

/// Tracks every registered resource's residency and keeps the resident set
/// inside the VRAM budget. Single-threaded per frame boundary; callers
/// synchronize.
pub struct ResidencyManager {
    device: Arc<dyn Device>,
    config: ResidencyConfig,
    entries: Vec<ResidencyEntry>,
    current_frame: u64,
    current_usage: u64,
    resident_count: u32,
    evicted_count: u32,
}

/// Eviction examines at most this many candidates per pass.
const MAX_EVICTION_CANDIDATES: usize = 64;

impl ResidencyManager {
    pub fn new(device: Arc<dyn Device>, config: ResidencyConfig) -> Self {
        Self {
            device,
            config,
            entries: Vec::new(),
            current_frame: 0,
            current_usage: 0,
            resident_count: 0,
            evicted_count: 0,
        }
    }

    pub fn begin_frame(&mut self, frame_number: u64) {
        self.current_frame = frame_number;
    }

    /// Run eviction when usage has crossed the threshold.
    pub fn end_frame(&mut self) {
        if self.usage_ratio() > self.config.eviction_threshold {
            self.perform_eviction();
        }
    }

    pub fn register(&mut self, resource: ResourceId, size: u64, priority: ResidencyPriority) {
        self.entries.push(ResidencyEntry {
            resource,
            size,
            priority,
            last_used_frame: self.current_frame,
            last_used_fence_value: 0,
            status: ResidencyStatus::Resident,
        });
        self.current_usage += size;
        self.resident_count += 1;
    }

    pub fn unregister(&mut self, resource: ResourceId) {
        if let Some(index) = self.entries.iter().position(|e| e.resource == resource) {
            let entry = self.entries.swap_remove(index);
            match entry.status {
                ResidencyStatus::Resident => {
                    self.current_usage -= entry.size;
                    self.resident_count -= 1;
                }
                ResidencyStatus::Evicted => self.evicted_count -= 1,
            }
        }
    }

    pub fn set_priority(&mut self, resource: ResourceId, priority: ResidencyPriority) {
        if let Some(entry) = self.find_mut(resource) {
            entry.priority = priority;
        }
    }

    pub fn mark_used(&mut self, resource: ResourceId, fence_value: u64) {
        let frame = self.current_frame;
        if let Some(entry) = self.find_mut(resource) {
            entry.last_used_frame = frame;
            entry.last_used_fence_value = fence_value;
        }
    }

    pub fn mark_used_many(&mut self, resources: &[ResourceId], fence_value: u64) {
        for &resource in resources {
            self.mark_used(resource, fence_value);
        }
    }

    /// Bring evicted resources back before use; the backend performs the
    /// actual paging.
    pub fn ensure_resident(&mut self, resources: &[ResourceId]) -> bool {
        let mut all_ok = true;
        for &resource in resources {
            let Some(entry) = self.find_mut(resource) else {
                continue;
            };
            if entry.status != ResidencyStatus::Evicted {
                continue;
            }
            entry.status = ResidencyStatus::Resident;
            let size = entry.size;
            if self.device.make_resident(resource) {
                self.current_usage += size;
                self.resident_count += 1;
                self.evicted_count -= 1;
            } else {
                all_ok = false;
                if let Some(entry) = self.find_mut(resource) {
                    entry.status = ResidencyStatus::Evicted;
                }
            }
        }
        all_ok
    }

    /// Asynchronous make-resident: the backend signals `fence` at `value`
    /// once paging completes.
    pub fn enqueue_make_resident(
        &mut self,
        resources: &[ResourceId],
        fence: &crate::Handle<crate::Fence>,
        value: u64,
    ) -> bool {
        let ok = self.ensure_resident(resources);
        fence.note_signal_enqueued(value);
        ok
    }

    /// Evict least-recently-used, sub-Maximum-priority resources until usage
    /// falls to `budget × eviction_target`.
    pub fn perform_eviction(&mut self) {
        let budget = self.config.max_vram_bytes;
        if budget == 0 || self.usage_ratio() <= self.config.eviction_target {
            return;
        }
        let target_usage = (budget as f64 * self.config.eviction_target) as u64;
        let target_reduction = self.current_usage - target_usage;

        let mut candidates: Vec<usize> = (0..self.entries.len())
            .filter(|&index| {
                let entry = &self.entries[index];
                entry.status == ResidencyStatus::Resident
                    && entry.priority < ResidencyPriority::Maximum
                    && self.current_frame - entry.last_used_frame
                        >= self.config.unused_frames_before_evict
            })
            .collect();
        candidates.sort_by_key(|&index| self.entries[index].last_used_frame);
        candidates.truncate(MAX_EVICTION_CANDIDATES);

        let mut reclaimed = 0u64;
        for index in candidates {
            if reclaimed >= target_reduction {
                break;
            }
            let entry = &mut self.entries[index];
            entry.status = ResidencyStatus::Evicted;
            reclaimed += entry.size;
            self.current_usage -= entry.size;
            self.resident_count -= 1;
            self.evicted_count += 1;
            let resource = entry.resource;
            log::debug!(
                "evicting #{resource} ({} bytes, last used frame {})",
                self.entries[index].size,
                self.entries[index].last_used_frame
            );
            self.device.evict(resource);
        }
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.config.max_vram_bytes == 0 {
            0.0
        } else {
            self.current_usage as f64 / self.config.max_vram_bytes as f64
        }
    }

    pub fn current_usage(&self) -> u64 {
        self.current_usage
    }

    pub fn budget(&self) -> u64 {
        self.config.max_vram_bytes
    }

    pub fn resident_count(&self) -> u32 {
        self.resident_count
    }

    pub fn evicted_count(&self) -> u32 {
        self.evicted_count
    }

    pub fn is_resident(&self, resource: ResourceId) -> bool {
        self.entries
            .iter()
            .find(|e| e.resource == resource)
            .is_some_and(|e| e.status == ResidencyStatus::Resident)
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    fn find_mut(&mut self, resource: ResourceId) -> Option<&mut ResidencyEntry> {
        self.entries.iter_mut().find(|e| e.resource == resource)
    }
}

//=============================================================================
// TextureStreamingManager
//=============================================================================

#[derive(Clone, Copy, Debug)]
struct StreamingEntry {
    resource: ResourceId,
    distance: f32,
    priority: f32,
    current_level: u32,
    requested_level: u32,
    complete: bool,
}

/// Advisory mip streaming: distance-driven priorities, requests re-issued
/// until the backend reports completion. Never blocks rendering.
pub struct TextureStreamingManager {
    device: Arc<dyn Device>,
    entries: Vec<StreamingEntry>,
    budget: u64,
}

impl TextureStreamingManager {
    pub fn new(device: Arc<dyn Device>, streaming_budget: u64) -> Self {
        Self {
            device,
            entries: Vec::new(),
            budget: streaming_budget,
        }
    }

    pub fn register(&mut self, resource: ResourceId, current_level: u32) {
        self.entries.push(StreamingEntry {
            resource,
            distance: 0.0,
            priority: 0.0,
            current_level,
            requested_level: current_level,
            complete: true,
        });
    }

    pub fn unregister(&mut self, resource: ResourceId) {
        if let Some(index) = self.entries.iter().position(|e| e.resource == resource) {
            self.entries.swap_remove(index);
        }
    }

    /// Closer resources stream first: priority is 1/distance, infinite at
    /// zero distance.
    pub fn update_resource_distance(&mut self, resource: ResourceId, distance: f32) {
        if let Some(entry) = self.find_mut(resource) {
            entry.distance = distance;
            entry.priority = if distance > 0.0 {
                1.0 / distance
            } else {
                f32::INFINITY
            };
        }
    }

    pub fn request_level(&mut self, resource: ResourceId, level: u32) {
        if let Some(entry) = self.find_mut(resource) {
            if entry.requested_level != level {
                entry.requested_level = level;
                entry.complete = false;
            }
        }
    }

    /// Immediate full-detail request, bypassing distance priorities.
    pub fn force_load(&mut self, resource: ResourceId, level: u32) {
        if let Some(entry) = self.find_mut(resource) {
            entry.requested_level = level;
            entry.complete = false;
        }
    }

    /// Backend notification: a streaming operation landed.
    pub fn notify_level_loaded(&mut self, resource: ResourceId, level: u32) {
        if let Some(entry) = self.find_mut(resource) {
            entry.current_level = level;
            entry.complete = entry.current_level == entry.requested_level;
        }
    }

    pub fn set_streaming_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    pub fn streaming_budget(&self) -> u64 {
        self.budget
    }

    pub fn begin_frame(&mut self) {}

    pub fn end_frame(&mut self) {
        self.process_streaming();
    }

    /// Re-issue backend requests for every entry not at its requested level,
    /// highest priority first.
    pub fn process_streaming(&mut self) {
        let mut order: Vec<usize> = (0..self.entries.len())
            .filter(|&index| {
                let entry = &self.entries[index];
                entry.current_level != entry.requested_level && !entry.complete
            })
            .collect();
        order.sort_by(|&a, &b| {
            self.entries[b]
                .priority
                .partial_cmp(&self.entries[a].priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for index in order {
            let entry = &self.entries[index];
            self.device
                .request_stream_level(entry.resource, entry.requested_level);
        }
    }

    pub fn priority(&self, resource: ResourceId) -> Option<f32> {
        self.entries
            .iter()
            .find(|e| e.resource == resource)
            .map(|e| e.priority)
    }

    pub fn is_streaming_complete(&self, resource: ResourceId) -> bool {
        self.entries
            .iter()
            .find(|e| e.resource == resource)
            .is_none_or(|e| e.complete)
    }

    pub fn current_level(&self, resource: ResourceId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.resource == resource)
            .map(|e| e.current_level)
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    fn find_mut(&mut self, resource: ResourceId) -> Option<&mut StreamingEntry> {
        self.entries.iter_mut().find(|e| e.resource == resource)
    }
}
