//! Error types for the execution core.
//!
//! Construction problems (a segment list that does not tile the 64KB space)
//! are reported once, at `AddressSpace` construction, and are fatal: no
//! partial instance is produced. Everything else that can fail at runtime
//! funnels through [`CoreError`].

use thiserror::Error;

/// Fatal configuration problems detected while building an address space.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The segment list leaves addresses uncovered.
    #[error("address gap between {from:#06X} and {to:#06X}")]
    AddressGap { from: u16, to: u16 },

    /// A segment starts before the previous one ends.
    #[error("segment at {base:#06X} overlaps coverage up to {last:#06X}")]
    AddressOverlap { base: u16, last: u16 },

    /// Segments must cover at least one byte.
    #[error("segment at {base:#06X} has zero length")]
    InvalidSegmentLength { base: u16 },

    /// Initial contents longer than the segment they load into.
    #[error("initial contents for segment at {base:#06X} are {actual} bytes, segment holds {expected}")]
    InitialStateTooLong {
        base: u16,
        expected: u32,
        actual: u32,
    },
}

/// Errors surfaced by the execution core and its collaborators.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A write was routed to a segment without write capability and the
    /// platform's write policy is [`WritePolicy::Fault`](crate::config::WritePolicy).
    #[error("write to read-only address {address:#06X}")]
    WriteFault { address: u16 },

    /// The decoder could not produce a block; no safe block can be
    /// synthesized, so the run loop stops.
    #[error("unsupported instruction at {address:#06X}")]
    UnsupportedInstruction { address: u16 },

    /// A shutdown drain (DMA queue, interrupt queue) exceeded its deadline.
    #[error("{component} did not drain before the shutdown deadline")]
    ShutdownTimeout { component: &'static str },
}
