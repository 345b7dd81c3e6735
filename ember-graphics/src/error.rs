//! Error types for the few operations that cannot report failure through an
//! invalid handle or a `bool`.

use std::fmt;

/// A requested capability is not available on this device or backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotSupportedError {
    pub feature: &'static str,
    /// Capability to check before retrying, if any.
    pub capability_hint: &'static str,
}

impl fmt::Display for NotSupportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not supported", self.feature)?;
        if !self.capability_hint.is_empty() {
            write!(f, " (check capability `{}`)", self.capability_hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for NotSupportedError {}

/// A fixed internal capacity was exceeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapacityError {
    pub what: &'static str,
    pub capacity: usize,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} capacity ({}) exceeded", self.what, self.capacity)
    }
}

impl std::error::Error for CapacityError {}
