//! Machine-cycle execution core for 8-bit platforms (8080, Z80, LR35902).
//!
//! The crate splits the machine into a register file, a bit-exact ALU, a
//! segmented 64KB address space with DMA, a compiled-block cache, and an
//! interrupt controller; `ExecutionCore` ties them into the fetch-execute
//! loop. Instruction decoding and peripheral behavior live behind the
//! [`InstructionDecoder`] and [`PeripheralManager`] traits so one core
//! serves several platforms.

pub mod alu;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod registers;

pub use alu::Alu;
pub use cache::{BlockFn, CompiledBlock, CompiledBlockCache};
pub use config::{AccessKind, ClockMode, PlatformConfig, SegmentKind, SegmentSpec, WritePolicy};
pub use error::{ConfigurationError, CoreError};
pub use executor::ExecutionCore;
pub use interrupts::{InterruptController, InterruptRequest};
pub use memory::{
    AddressRange, AddressSegment, AddressSpace, DmaController, DmaOperation, DmaPump,
    MemoryMappedPeripheral, WriteObserver,
};
pub use registers::{FlagsRegister, InterruptMode, RegisterFile};

/// Everything a compiled block may touch while executing: the register
/// file (exclusively owned by the execution thread), memory, the ALU and
/// the port-mapped peripherals.
pub struct CoreBus<'a> {
    pub registers: &'a mut RegisterFile,
    pub memory: &'a AddressSpace,
    pub alu: &'a Alu,
    pub peripherals: &'a dyn PeripheralManager,
}

/// Turns the bytes at an address into an executable block.
///
/// The returned block's execute fn must leave `pc` pointing at the next
/// instruction to run (the fall-through address for straight-line code, the
/// target for taken branches). Decoders are called from the execution
/// thread with the shared address space for operand fetches.
pub trait InstructionDecoder: Send {
    fn decode(&self, address: u16, memory: &AddressSpace) -> Result<CompiledBlock, CoreError>;
}

/// Host-side device model: port I/O, halt/resume signals, and any
/// memory-mapped device segments the platform needs.
///
/// Every method has a do-nothing default so simple platforms only
/// implement what they use.
pub trait PeripheralManager: Send + Sync {
    /// IN: read from a port. Unmapped ports float high.
    fn read_port(&self, port: u8) -> u8 {
        let _ = port;
        0xFF
    }

    /// OUT: write to a port.
    fn write_port(&self, port: u8, value: u8) {
        let _ = (port, value);
    }

    /// The CPU entered a peripheral-stopping halt (e.g. STOP).
    fn signal_halt(&self) {}

    /// The CPU resumed after a peripheral-stopping halt.
    fn signal_resume(&self) {}

    /// Device segments to mount over the configuration's peripheral
    /// placeholders.
    fn mmap_segments(&self) -> Vec<AddressSegment> {
        Vec::new()
    }
}

/// A peripheral manager with nothing attached.
pub struct NullPeripherals;

impl PeripheralManager for NullPeripherals {}
