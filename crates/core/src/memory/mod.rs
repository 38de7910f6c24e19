//! Segmented memory subsystem: address ranges, typed segments, the flat
//! 64KB address space and the background DMA pump.

pub mod dma;
pub mod range;
pub mod segment;
pub mod space;

pub use dma::{DmaController, DmaOperation, DmaPump};
pub use range::AddressRange;
pub use segment::{AddressSegment, MemoryMappedPeripheral};
pub use space::{AddressSpace, WriteObserver};
