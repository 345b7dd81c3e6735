//! Platform abstraction boundary.
//!
//! The core depends on these traits without naming an OS; hosts supply the
//! implementations. The output device bridges into the `log` crate so the
//! whole stack shares one sink.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::Duration;

//=============================================================================
// Virtual memory
//=============================================================================

/// Page-granularity virtual memory.
pub trait PlatformMemory: Send + Sync {
    fn page_size(&self) -> usize;

    /// Reserve address space without committing pages.
    fn reserve(&self, size: usize) -> Option<NonNull<u8>>;

    /// Commit pages inside a reservation.
    fn commit(&self, base: NonNull<u8>, size: usize) -> bool;

    fn decommit(&self, base: NonNull<u8>, size: usize);

    /// Release the reservation.
    fn free(&self, base: NonNull<u8>, size: usize);
}

//=============================================================================
// Filesystem
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

pub trait FileHandle: Send {
    fn tell(&mut self) -> u64;
    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> bool;
    fn read(&mut self, out: &mut [u8]) -> usize;
    fn write(&mut self, data: &[u8]) -> usize;
    fn flush(&mut self) -> bool;
    fn size(&self) -> u64;
}

pub trait PlatformFile: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn file_size(&self, path: &str) -> Option<u64>;
    fn delete(&self, path: &str) -> bool;
    fn rename(&self, from: &str, to: &str) -> bool;
    fn copy(&self, from: &str, to: &str) -> bool;
    fn open_read(&self, path: &str) -> Option<Box<dyn FileHandle>>;
    fn open_write(&self, path: &str, append: bool) -> Option<Box<dyn FileHandle>>;
}

//=============================================================================
// Time, TLS, affinity
//=============================================================================

pub trait PlatformTime: Send + Sync {
    /// Raw cycle counter.
    fn cycles64(&self) -> u64;
    /// Seconds on a monotonic clock.
    fn seconds(&self) -> f64;
}

pub trait PlatformTls: Send + Sync {
    /// Returns an opaque slot index.
    fn alloc_slot(&self) -> u32;
    fn free_slot(&self, slot: u32);
    fn set(&self, slot: u32, value: *mut u8);
    fn get(&self, slot: u32) -> *mut u8;
}

/// CPU topology and scheduling.
pub trait PlatformAffinity: Send + Sync {
    fn physical_core_count(&self) -> u32;
    fn logical_core_count(&self) -> u32;
    /// Performance-core mask on hybrid parts; equal to the full mask
    /// elsewhere.
    fn performance_core_mask(&self) -> u64;
    fn efficiency_core_mask(&self) -> u64;
    fn sleep(&self, duration: Duration);
    fn yield_now(&self);
}

//=============================================================================
// Output device
//=============================================================================

/// Message severity, most severe first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Fatal,
    Error,
    Warning,
    Display,
    Log,
    Verbose,
    VeryVerbose,
}

pub trait OutputDevice: Send + Sync {
    fn write(&self, verbosity: Verbosity, category: &str, message: &str);

    /// Most verbose level this device accepts.
    fn max_verbosity(&self) -> Verbosity {
        Verbosity::Log
    }

    fn is_enabled(&self, verbosity: Verbosity) -> bool {
        verbosity <= self.max_verbosity()
    }
}

/// Routes HAL output into the `log` crate.
pub struct LogOutputDevice;

impl OutputDevice for LogOutputDevice {
    fn write(&self, verbosity: Verbosity, category: &str, message: &str) {
        match verbosity {
            Verbosity::Fatal | Verbosity::Error => log::error!(target: "hal", "[{category}] {message}"),
            Verbosity::Warning => log::warn!(target: "hal", "[{category}] {message}"),
            Verbosity::Display | Verbosity::Log => log::info!(target: "hal", "[{category}] {message}"),
            Verbosity::Verbose => log::debug!(target: "hal", "[{category}] {message}"),
            Verbosity::VeryVerbose => log::trace!(target: "hal", "[{category}] {message}"),
        }
    }

    fn max_verbosity(&self) -> Verbosity {
        Verbosity::VeryVerbose
    }
}

//=============================================================================
// Console variables
//=============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl ConsoleValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

/// Who set a variable. Later writers win only at equal or higher priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SetBy {
    Constructor,
    Scalability,
    Game,
    Project,
    CommandLine,
    Console,
    Code,
}

struct ConsoleVar {
    value: ConsoleValue,
    set_by: SetBy,
    help: &'static str,
}

/// Name → typed setting registry with the priority-ordered set-by chain.
/// Owned by the engine root and passed down; not a process singleton.
/// Runtime changes take effect at the next frame boundary, when components
/// re-read their knobs.
pub struct ConsoleRegistry {
    vars: Mutex<HashMap<String, ConsoleVar>>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
        }
    }

    /// Install a variable at constructor priority. Re-registration keeps the
    /// existing value.
    pub fn register(&self, name: &str, default: ConsoleValue, help: &'static str) {
        let mut vars = self.vars.lock().unwrap();
        vars.entry(name.to_string()).or_insert(ConsoleVar {
            value: default,
            set_by: SetBy::Constructor,
            help,
        });
    }

    /// Returns false when the variable is unknown or a higher-priority
    /// setter already owns it.
    pub fn set(&self, name: &str, value: ConsoleValue, set_by: SetBy) -> bool {
        let mut vars = self.vars.lock().unwrap();
        let Some(var) = vars.get_mut(name) else {
            log::warn!("set of unregistered console variable `{name}`");
            return false;
        };
        if set_by < var.set_by {
            log::debug!(
                "console variable `{name}` set by {:?} ignored; currently owned by {:?}",
                set_by,
                var.set_by
            );
            return false;
        }
        var.value = value;
        var.set_by = set_by;
        true
    }

    pub fn get(&self, name: &str) -> Option<ConsoleValue> {
        self.vars.lock().unwrap().get(name).map(|v| v.value.clone())
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_int())
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_float())
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| v.as_bool())
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_by(&self, name: &str) -> Option<SetBy> {
        self.vars.lock().unwrap().get(name).map(|v| v.set_by)
    }

    pub fn help(&self, name: &str) -> Option<&'static str> {
        self.vars.lock().unwrap().get(name).map(|v| v.help)
    }

    pub fn len(&self) -> usize {
        self.vars.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.lock().unwrap().is_empty()
    }
}

impl Default for ConsoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard tuning knobs the core registers on startup.
pub fn register_core_variables(registry: &ConsoleRegistry) {
    registry.register(
        "r.Ember.ResidencyBudgetMB",
        ConsoleValue::Int(0),
        "VRAM budget in MiB; 0 uses the adapter-reported budget",
    );
    registry.register(
        "r.Ember.FrameLatency",
        ConsoleValue::Int(3),
        "Frames in flight (1-4)",
    );
    registry.register(
        "r.Ember.FrameWaitTimeoutMs",
        ConsoleValue::Int(30_000),
        "Frame fence deadline before the device is declared lost",
    );
    registry.register(
        "r.Ember.ValidationLevel",
        ConsoleValue::Int(if cfg!(debug_assertions) { 1 } else { 0 }),
        "0 off, 1 state validation",
    );
    registry.register(
        "r.Ember.UploadHeapSizeMB",
        ConsoleValue::Int(64),
        "Async upload staging ring size in MiB",
    );
}
