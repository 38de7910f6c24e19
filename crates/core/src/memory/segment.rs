//! Typed, fixed-size segments of the 64KB address space.

use std::sync::{Arc, Mutex};

use crate::config::{AccessKind, SegmentKind};

/// A memory-mapped device exposed through a [`Peripheral`](SegmentKind::Peripheral)
/// segment. Implementors use interior mutability; both the CPU thread and
/// the DMA pump may call in.
pub trait MemoryMappedPeripheral: Send + Sync {
    fn read(&self, offset: u32) -> u8;
    fn write(&self, offset: u32, value: u8);
}

enum Backing {
    Ram(Mutex<Vec<u8>>),
    Rom(Vec<u8>),
    Peripheral(Arc<dyn MemoryMappedPeripheral>),
    Unused,
}

/// A contiguous range of the address space backed by one provider.
///
/// RAM contents sit behind a mutex because the DMA pump thread writes
/// through the same segments as the CPU thread. ROM contents are immutable
/// after construction and need no lock.
pub struct AddressSegment {
    kind: SegmentKind,
    access: AccessKind,
    base: u16,
    length: u32,
    backing: Backing,
}

impl AddressSegment {
    pub fn ram(base: u16, length: u32) -> Self {
        Self {
            kind: SegmentKind::Ram,
            access: AccessKind::ReadWrite,
            base,
            length,
            backing: Backing::Ram(Mutex::new(vec![0; length as usize])),
        }
    }

    pub fn rom(base: u16, contents: Vec<u8>) -> Self {
        let length = contents.len() as u32;
        Self {
            kind: SegmentKind::Rom,
            access: AccessKind::Read,
            base,
            length,
            backing: Backing::Rom(contents),
        }
    }

    pub fn unused(base: u16, length: u32) -> Self {
        Self {
            kind: SegmentKind::Unused,
            access: AccessKind::ReadWrite,
            base,
            length,
            backing: Backing::Unused,
        }
    }

    pub fn peripheral(
        base: u16,
        length: u32,
        device: Arc<dyn MemoryMappedPeripheral>,
    ) -> Self {
        Self {
            kind: SegmentKind::Peripheral,
            access: AccessKind::ReadWrite,
            base,
            length,
            backing: Backing::Peripheral(device),
        }
    }

    pub fn with_access(mut self, access: AccessKind) -> Self {
        self.access = access;
        self
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn access(&self) -> AccessKind {
        self.access
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Load initial contents starting at offset 0. Returns the number of
    /// bytes the segment can hold if the contents do not fit.
    pub fn load_initial(&self, contents: &[u8]) -> Result<(), u32> {
        if contents.len() as u32 > self.length {
            return Err(self.length);
        }
        match &self.backing {
            Backing::Ram(bytes) => {
                let mut bytes = bytes.lock().unwrap();
                bytes[..contents.len()].copy_from_slice(contents);
                Ok(())
            }
            // ROM contents arrive via the constructor; anything else has no
            // bytes to load into
            _ => Ok(()),
        }
    }

    pub fn read(&self, offset: u32) -> u8 {
        debug_assert!(offset < self.length);
        match &self.backing {
            Backing::Ram(bytes) => bytes.lock().unwrap()[offset as usize],
            Backing::Rom(bytes) => bytes[offset as usize],
            Backing::Peripheral(device) => device.read(offset),
            Backing::Unused => 0xFF,
        }
    }

    pub fn write(&self, offset: u32, value: u8) {
        debug_assert!(offset < self.length);
        match &self.backing {
            Backing::Ram(bytes) => bytes.lock().unwrap()[offset as usize] = value,
            Backing::Peripheral(device) => device.write(offset, value),
            Backing::Rom(_) | Backing::Unused => {}
        }
    }

    /// Bulk read into a buffer; `offset + buf.len()` must stay within the
    /// segment (the address space splits larger operations).
    pub fn read_slice(&self, offset: u32, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() as u32 <= self.length);
        match &self.backing {
            Backing::Ram(bytes) => {
                let bytes = bytes.lock().unwrap();
                buf.copy_from_slice(&bytes[offset as usize..offset as usize + buf.len()]);
            }
            Backing::Rom(bytes) => {
                buf.copy_from_slice(&bytes[offset as usize..offset as usize + buf.len()]);
            }
            Backing::Peripheral(device) => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = device.read(offset + i as u32);
                }
            }
            Backing::Unused => buf.fill(0xFF),
        }
    }

    /// Bulk write from a buffer; bounds as for [`read_slice`](Self::read_slice).
    pub fn write_slice(&self, offset: u32, buf: &[u8]) {
        debug_assert!(offset + buf.len() as u32 <= self.length);
        match &self.backing {
            Backing::Ram(bytes) => {
                let mut bytes = bytes.lock().unwrap();
                bytes[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
            }
            Backing::Peripheral(device) => {
                for (i, b) in buf.iter().enumerate() {
                    device.write(offset + i as u32, *b);
                }
            }
            Backing::Rom(_) | Backing::Unused => {}
        }
    }
}

impl std::fmt::Debug for AddressSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSegment")
            .field("kind", &self.kind)
            .field("access", &self.access)
            .field("base", &self.base)
            .field("length", &self.length)
            .finish()
    }
}
