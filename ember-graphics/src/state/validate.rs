//! Debug-time access and transition validation.
//!
//! The runtime tracker enforces plain state equality; this validator layers
//! the read-only combining rule on top for debug checks, since read states
//! are bit-distinct and may be held together by hardware.

use std::collections::HashSet;

use crate::{ResourceId, ResourceState};

pub const MESSAGE_ACCESS_MISMATCH: u32 = 1;
pub const MESSAGE_REDUNDANT_TRANSITION: u32 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub errors: u64,
    pub warnings: u64,
    pub suppressed: u64,
}

pub struct StateValidator {
    enabled: bool,
    last_error: Option<String>,
    stats: ValidationStats,
    suppressed: HashSet<u32>,
}

impl StateValidator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_error: None,
            stats: ValidationStats::default(),
            suppressed: HashSet::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stop reporting a message id; occurrences still count as suppressed.
    pub fn suppress(&mut self, message_id: u32) {
        self.suppressed.insert(message_id);
    }

    /// A required read-only state is satisfied when the actual state
    /// bitwise-contains it; write states require exact match.
    pub fn validate_access(
        &mut self,
        resource: ResourceId,
        required: ResourceState,
        actual: ResourceState,
        subresource: u32,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        if required.is_read_only() && actual.contains(required) {
            return true;
        }
        if actual != required {
            self.report(
                MESSAGE_ACCESS_MISMATCH,
                format!(
                    "resource #{resource} subresource {subresource}: required state {required:?} but actual {actual:?}"
                ),
            );
            return false;
        }
        true
    }

    /// A transition with equal endpoints is malformed.
    pub fn validate_transition(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
        subresource: u32,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        if before == after {
            self.report(
                MESSAGE_REDUNDANT_TRANSITION,
                format!(
                    "resource #{resource} subresource {subresource}: redundant transition {before:?} -> {after:?}"
                ),
            );
            return false;
        }
        true
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn stats(&self) -> ValidationStats {
        self.stats
    }

    fn report(&mut self, message_id: u32, message: String) {
        if self.suppressed.contains(&message_id) {
            self.stats.suppressed += 1;
            return;
        }
        self.stats.errors += 1;
        log::warn!("state validation: {message}");
        self.last_error = Some(message);
    }
}

impl Default for StateValidator {
    fn default() -> Self {
        Self::new(cfg!(debug_assertions))
    }
}
