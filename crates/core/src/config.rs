//! Platform configuration: the segment layout and timing parameters a
//! platform hands to the core at construction time.

use serde::{Deserialize, Serialize};

/// What backs a region of the 64KB address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// General-purpose memory; writes notify the compiled-block cache.
    Ram,
    /// Read-only memory; writes follow the platform's [`WritePolicy`].
    Rom,
    /// Memory-mapped device; reads and writes delegate to a peripheral.
    Peripheral,
    /// Unmapped; reads return 0xFF, writes are swallowed.
    Unused,
}

/// Access capability of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
}

impl AccessKind {
    pub fn readable(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::ReadWrite)
    }
}

/// One entry of a platform's ordered segment list.
///
/// `length` is a `u32` because a single segment may cover the entire
/// 0x10000-byte space. `Peripheral` entries are placeholders: the actual
/// segment comes from the peripheral manager's memory-mapped segments, and
/// construction fails with an address gap if no device fills the hole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub kind: SegmentKind,
    pub base: u16,
    pub length: u32,
    pub access: AccessKind,
    /// Initial byte contents, loaded at construction. Must not exceed `length`.
    pub initial: Option<Vec<u8>>,
}

impl SegmentSpec {
    pub fn ram(base: u16, length: u32) -> Self {
        Self {
            kind: SegmentKind::Ram,
            base,
            length,
            access: AccessKind::ReadWrite,
            initial: None,
        }
    }

    pub fn rom(base: u16, contents: Vec<u8>) -> Self {
        Self {
            kind: SegmentKind::Rom,
            base,
            length: contents.len() as u32,
            access: AccessKind::Read,
            initial: Some(contents),
        }
    }

    pub fn unused(base: u16, length: u32) -> Self {
        Self {
            kind: SegmentKind::Unused,
            base,
            length,
            access: AccessKind::ReadWrite,
            initial: None,
        }
    }

    pub fn with_initial(mut self, contents: Vec<u8>) -> Self {
        self.initial = Some(contents);
        self
    }
}

/// Whether the core throttles to real hardware speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    /// Run as fast as the host allows.
    Unthrottled,
    /// Pace execution so `hz` machine cycles elapse per second.
    Throttled { hz: u32 },
}

/// What to do when a write is routed to a segment without write capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WritePolicy {
    /// Drop the write silently (real ROM behavior on most boards).
    #[default]
    Ignore,
    /// Surface the write as a [`CoreError::WriteFault`](crate::error::CoreError).
    Fault,
}

/// Everything the core needs to know about the host platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Ordered segment list; together with peripheral-provided segments it
    /// must tile [0x0000, 0xFFFF] exactly.
    pub segments: Vec<SegmentSpec>,
    pub clock: ClockMode,
    pub write_policy: WritePolicy,
}

impl PlatformConfig {
    /// A 64KB flat-RAM configuration, unthrottled. Useful for tests and
    /// simple platforms.
    pub fn flat_ram() -> Self {
        Self {
            segments: vec![SegmentSpec::ram(0x0000, 0x10000)],
            clock: ClockMode::Unthrottled,
            write_policy: WritePolicy::Ignore,
        }
    }
}
