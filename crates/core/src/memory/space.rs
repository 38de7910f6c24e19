//! The flat 64KB address space composed from sorted segments.
//!
//! Construction validates that the segment list tiles [0x0000, 0xFFFF]
//! exactly; no partial instance escapes a bad configuration. Every access
//! binary-searches the sorted base-address array and delegates to the floor
//! segment with a translated offset. Multi-byte operations split across
//! consecutive segments, wrapping modulo the segment count, which also
//! covers 16-bit address wraparound past 0xFFFF. 16-bit values are
//! little-endian.
//!
//! Writes to RAM-kind segments emit `(address, length)` notifications to a
//! registered observer (the compiled-block cache); ROM, peripheral and
//! unused segments never notify, which keeps self-modifying-code tracking
//! off the paths that cannot hold code.

use std::sync::{Arc, OnceLock};

use crate::config::{PlatformConfig, SegmentKind, WritePolicy};
use crate::error::{ConfigurationError, CoreError};
use crate::logging::{log, LogCategory, LogLevel};
use crate::memory::segment::AddressSegment;
use crate::PeripheralManager;

/// Receives `(address, length)` after every RAM write.
pub trait WriteObserver: Send + Sync {
    fn memory_written(&self, address: u16, length: u32);
}

pub struct AddressSpace {
    /// Sorted by base address; tiles the full space.
    segments: Vec<AddressSegment>,
    /// Base of each segment, parallel to `segments`, for binary search.
    bases: Vec<u16>,
    write_policy: WritePolicy,
    observer: OnceLock<Arc<dyn WriteObserver>>,
}

impl AddressSpace {
    /// Build from an explicit segment list.
    pub fn new(
        mut segments: Vec<AddressSegment>,
        write_policy: WritePolicy,
    ) -> Result<Self, ConfigurationError> {
        segments.sort_by_key(|s| s.base());

        // Accumulate the expected next address over the sorted list; any
        // deviation is a gap or an overlap.
        let mut expected: u32 = 0;
        for segment in &segments {
            if segment.length() < 1 {
                return Err(ConfigurationError::InvalidSegmentLength {
                    base: segment.base(),
                });
            }
            let base = segment.base() as u32;
            if base > expected {
                return Err(ConfigurationError::AddressGap {
                    from: expected as u16,
                    to: segment.base(),
                });
            }
            if base < expected {
                // coverage can already exceed the space when an earlier
                // segment overshoots 0xFFFF; clamp before narrowing
                return Err(ConfigurationError::AddressOverlap {
                    base: segment.base(),
                    last: (expected.min(0x10000) - 1) as u16,
                });
            }
            expected += segment.length();
        }
        if expected < 0x10000 {
            return Err(ConfigurationError::AddressGap {
                from: expected as u16,
                to: 0xFFFF,
            });
        }
        if expected > 0x10000 {
            let last = segments.last().map(|s| s.base()).unwrap_or(0);
            return Err(ConfigurationError::AddressOverlap {
                base: last,
                last: 0xFFFF,
            });
        }

        let bases = segments.iter().map(|s| s.base()).collect();
        Ok(Self {
            segments,
            bases,
            write_policy,
            observer: OnceLock::new(),
        })
    }

    /// Build from a platform configuration plus the peripheral manager's
    /// memory-mapped segments.
    ///
    /// `Peripheral` entries in the config are placeholders; the device
    /// segments come from the manager, and a hole left unfilled fails
    /// validation as an address gap.
    pub fn from_config(
        config: &PlatformConfig,
        peripherals: &dyn PeripheralManager,
    ) -> Result<Self, ConfigurationError> {
        let mut segments = Vec::with_capacity(config.segments.len());
        for spec in &config.segments {
            let segment = match spec.kind {
                SegmentKind::Ram => {
                    let segment =
                        AddressSegment::ram(spec.base, spec.length).with_access(spec.access);
                    if let Some(initial) = &spec.initial {
                        segment.load_initial(initial).map_err(|expected| {
                            ConfigurationError::InitialStateTooLong {
                                base: spec.base,
                                expected,
                                actual: initial.len() as u32,
                            }
                        })?;
                    }
                    segment
                }
                SegmentKind::Rom => {
                    let initial = spec.initial.clone().unwrap_or_default();
                    if initial.len() as u32 > spec.length {
                        return Err(ConfigurationError::InitialStateTooLong {
                            base: spec.base,
                            expected: spec.length,
                            actual: initial.len() as u32,
                        });
                    }
                    let mut contents = vec![0xFF; spec.length as usize];
                    contents[..initial.len()].copy_from_slice(&initial);
                    AddressSegment::rom(spec.base, contents)
                }
                SegmentKind::Unused => AddressSegment::unused(spec.base, spec.length),
                SegmentKind::Peripheral => continue,
            };
            segments.push(segment);
        }
        segments.extend(peripherals.mmap_segments());
        Self::new(segments, config.write_policy)
    }

    /// Register the write observer. Only the first registration takes
    /// effect.
    pub fn set_write_observer(&self, observer: Arc<dyn WriteObserver>) {
        let _ = self.observer.set(observer);
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Floor segment for an address: binary search returns the insertion
    /// point, adjusted down to the segment that starts at or before it.
    fn locate(&self, address: u16) -> (&AddressSegment, u32) {
        let index = match self.bases.binary_search(&address) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let segment = &self.segments[index];
        (segment, (address - segment.base()) as u32)
    }

    fn notify(&self, address: u16, length: u32) {
        if let Some(observer) = self.observer.get() {
            observer.memory_written(address, length);
        }
    }

    pub fn read_byte(&self, address: u16) -> u8 {
        let (segment, offset) = self.locate(address);
        if !segment.access().readable() {
            return 0xFF;
        }
        segment.read(offset)
    }

    pub fn write_byte(&self, address: u16, value: u8) -> Result<(), CoreError> {
        let (segment, offset) = self.locate(address);
        if !segment.access().writable() {
            return self.write_fault(address);
        }
        segment.write(offset, value);
        if segment.kind() == SegmentKind::Ram {
            self.notify(address, 1);
        }
        Ok(())
    }

    /// Little-endian 16-bit read; wraps past 0xFFFF.
    pub fn read_word(&self, address: u16) -> u16 {
        let lo = self.read_byte(address) as u16;
        let hi = self.read_byte(address.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    /// Little-endian 16-bit write; wraps past 0xFFFF.
    pub fn write_word(&self, address: u16, value: u16) -> Result<(), CoreError> {
        self.write_byte(address, value as u8)?;
        self.write_byte(address.wrapping_add(1), (value >> 8) as u8)
    }

    /// Read `length` bytes starting at `address`, splitting across
    /// segments and wrapping past 0xFFFF.
    pub fn read_bytes(&self, address: u16, length: u32) -> Vec<u8> {
        let mut buf = vec![0u8; length as usize];
        let mut cursor = address;
        let mut filled: usize = 0;
        while (filled as u32) < length {
            let (segment, offset) = self.locate(cursor);
            let chunk = ((length - filled as u32).min(segment.length() - offset)) as usize;
            if segment.access().readable() {
                segment.read_slice(offset, &mut buf[filled..filled + chunk]);
            } else {
                buf[filled..filled + chunk].fill(0xFF);
            }
            filled += chunk;
            cursor = cursor.wrapping_add(chunk as u16);
        }
        buf
    }

    /// Write bytes starting at `address`, splitting across segments and
    /// wrapping past 0xFFFF. Each RAM chunk notifies the observer once.
    pub fn write_bytes(&self, address: u16, data: &[u8]) -> Result<(), CoreError> {
        let mut cursor = address;
        let mut written: usize = 0;
        while written < data.len() {
            let (segment, offset) = self.locate(cursor);
            let chunk =
                ((data.len() - written) as u32).min(segment.length() - offset) as usize;
            if segment.access().writable() {
                segment.write_slice(offset, &data[written..written + chunk]);
                if segment.kind() == SegmentKind::Ram {
                    self.notify(cursor, chunk as u32);
                }
            } else {
                self.write_fault(cursor)?;
            }
            written += chunk;
            cursor = cursor.wrapping_add(chunk as u16);
        }
        Ok(())
    }

    /// Read-then-write of a single byte, used by block-transfer opcodes.
    pub fn transfer_byte(&self, source: u16, destination: u16) -> Result<(), CoreError> {
        let value = self.read_byte(source);
        self.write_byte(destination, value)
    }

    /// Read-then-write of a span, used by block-transfer opcodes and DMA.
    pub fn transfer_bytes(
        &self,
        source: u16,
        destination: u16,
        length: u32,
    ) -> Result<(), CoreError> {
        let data = self.read_bytes(source, length);
        self.write_bytes(destination, &data)
    }

    fn write_fault(&self, address: u16) -> Result<(), CoreError> {
        match self.write_policy {
            WritePolicy::Ignore => {
                log(LogCategory::Memory, LogLevel::Debug, || {
                    format!("ignored write to read-only address {:#06X}", address)
                });
                Ok(())
            }
            WritePolicy::Fault => Err(CoreError::WriteFault { address }),
        }
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("segments", &self.segments)
            .field("write_policy", &self.write_policy)
            .finish()
    }
}
