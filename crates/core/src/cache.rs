//! Compiled instruction block cache.
//!
//! Blocks are compiled once per start address and cached until a write
//! lands inside their covering ranges. The cache hangs off the address
//! space as its write observer, so self-modifying code and DMA writes both
//! invalidate through the same path.
//!
//! Concurrency: `get_or_compile` and `invalidate` may race between the CPU
//! thread and whichever thread performs writes. Compilation happens outside
//! the map lock, so two threads racing on the same address may compile the
//! block twice; the last insert wins, which is benign (both blocks decode
//! the same bytes) and keeps misses from serializing the two threads. An
//! invalidation arriving while a block compiles bumps a generation counter;
//! the miss path re-checks it before inserting and discards the possibly
//! stale block, so invalidations are never lost to in-flight compiles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CoreError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::memory::range::AddressRange;
use crate::memory::space::WriteObserver;
use crate::CoreBus;

/// The executable translation of the bytes at one address.
pub struct CompiledBlock {
    pub address: u16,
    /// Source bytes consumed, used to derive the covering ranges.
    pub length: u16,
    /// Cycles known at decode time; the execute fn returns any extra.
    pub static_cycles: u32,
    /// Block ends in a HALT-class instruction.
    pub halts_cpu: bool,
    /// Block also stops the peripherals (e.g. the Game Boy STOP).
    pub halts_peripherals: bool,
    run: BlockFn,
}

pub type BlockFn = Box<dyn Fn(&mut CoreBus<'_>) -> Result<u32, CoreError> + Send + Sync>;

impl CompiledBlock {
    pub fn new(address: u16, length: u16, static_cycles: u32, run: BlockFn) -> Self {
        Self {
            address,
            length,
            static_cycles,
            halts_cpu: false,
            halts_peripherals: false,
            run,
        }
    }

    pub fn halting(mut self) -> Self {
        self.halts_cpu = true;
        self
    }

    pub fn halting_peripherals(mut self) -> Self {
        self.halts_cpu = true;
        self.halts_peripherals = true;
        self
    }

    /// Run the block; returns cycles used beyond `static_cycles`.
    pub fn execute(&self, bus: &mut CoreBus<'_>) -> Result<u32, CoreError> {
        (self.run)(bus)
    }
}

impl std::fmt::Debug for CompiledBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledBlock")
            .field("address", &self.address)
            .field("length", &self.length)
            .field("static_cycles", &self.static_cycles)
            .field("halts_cpu", &self.halts_cpu)
            .field("halts_peripherals", &self.halts_peripherals)
            .finish()
    }
}

struct CacheEntry {
    block: Arc<CompiledBlock>,
    /// 1–2 ranges derived from (address, length), split on wraparound.
    first: AddressRange,
    second: Option<AddressRange>,
    access_count: u64,
    accesses_at_sweep: u64,
}

impl CacheEntry {
    fn intersects(&self, range: &AddressRange) -> bool {
        self.first.intersects(range)
            || self.second.as_ref().is_some_and(|r| r.intersects(range))
    }
}

/// Address → compiled block map with range-based invalidation.
#[derive(Default)]
pub struct CompiledBlockCache {
    entries: Mutex<HashMap<u16, CacheEntry>>,
    /// Bumped by every invalidation. A miss snapshots it before compiling
    /// and re-checks it before inserting, so an invalidation landing while
    /// the block compiles is never lost.
    generation: AtomicU64,
}

impl CompiledBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached block for `address`, compiling it on a miss.
    ///
    /// At most one entry exists per start address. Under a concurrent miss
    /// on the same address the block may be compiled twice and the last
    /// insert wins.
    pub fn get_or_compile<F>(
        &self,
        address: u16,
        compile: F,
    ) -> Result<Arc<CompiledBlock>, CoreError>
    where
        F: FnOnce(u16) -> Result<CompiledBlock, CoreError>,
    {
        let generation = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&address) {
                entry.access_count += 1;
                return Ok(Arc::clone(&entry.block));
            }
            self.generation.load(Ordering::Relaxed)
        };

        // Miss: compile outside the lock
        let block = Arc::new(compile(address)?);
        let (first, second) =
            AddressRange::covering(block.address, block.length.max(1) as u32);

        log(LogCategory::Cache, LogLevel::Debug, || {
            format!(
                "compiled block at {:#06X} len {}",
                block.address, block.length
            )
        });

        let mut entries = self.entries.lock().unwrap();
        if self.generation.load(Ordering::Relaxed) != generation {
            // A write landed while the block was compiling; its bytes may
            // be stale. Serve it uncached and let the next fetch recompile.
            log(LogCategory::Cache, LogLevel::Debug, || {
                format!(
                    "discarding block at {:#06X}: invalidated while compiling",
                    block.address
                )
            });
            return Ok(block);
        }
        entries.insert(
            address,
            CacheEntry {
                block: Arc::clone(&block),
                first,
                second,
                access_count: 1,
                accesses_at_sweep: 0,
            },
        );
        Ok(block)
    }

    /// Drop every cached block whose covering ranges intersect the written
    /// span.
    pub fn invalidate(&self, address: u16, length: u32) {
        if length == 0 {
            return;
        }
        // Bump before taking the lock: an in-flight compile that this
        // retain cannot see (its entry is not inserted yet) still observes
        // the generation change and discards its block.
        self.generation.fetch_add(1, Ordering::Relaxed);
        let (first, second) = AddressRange::covering(address, length);
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            let hit = entry.intersects(&first)
                || second.as_ref().is_some_and(|r| entry.intersects(r));
            !hit
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            log(LogCategory::Cache, LogLevel::Debug, || {
                format!(
                    "write {:#06X}+{} invalidated {} block(s)",
                    address, length, evicted
                )
            });
        }
    }

    /// Evict entries not accessed since the previous sweep. Approximate,
    /// non-blocking memory bound; never required for correctness.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.access_count > entry.accesses_at_sweep);
        for entry in entries.values_mut() {
            entry.accesses_at_sweep = entry.access_count;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl WriteObserver for CompiledBlockCache {
    fn memory_written(&self, address: u16, length: u32) {
        self.invalidate(address, length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn block(address: u16, length: u16) -> CompiledBlock {
        CompiledBlock::new(address, length, 4, Box::new(|_| Ok(0)))
    }

    #[test]
    fn second_lookup_hits_without_recompiling() {
        let cache = CompiledBlockCache::new();
        let compiles = AtomicU32::new(0);

        for _ in 0..2 {
            let got = cache
                .get_or_compile(0x0100, |addr| {
                    compiles.fetch_add(1, Ordering::Relaxed);
                    Ok(block(addr, 3))
                })
                .unwrap();
            assert_eq!(got.address, 0x0100);
        }
        assert_eq!(compiles.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidation_inside_coverage_forces_recompilation() {
        let cache = CompiledBlockCache::new();
        let compiles = AtomicU32::new(0);
        let mut compile = |addr: u16| {
            compiles.fetch_add(1, Ordering::Relaxed);
            Ok(block(addr, 4))
        };

        cache.get_or_compile(0x0200, &mut compile).unwrap();
        cache.invalidate(0x0202, 1); // inside [0x0200, 0x0203]
        cache.get_or_compile(0x0200, &mut compile).unwrap();
        assert_eq!(compiles.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn invalidation_during_compilation_discards_the_block() {
        let cache = CompiledBlockCache::new();

        // a write lands while the block is being compiled
        let got = cache
            .get_or_compile(0x0100, |addr| {
                cache.invalidate(0x0100, 1);
                Ok(block(addr, 2))
            })
            .unwrap();
        assert_eq!(got.address, 0x0100);
        assert!(cache.is_empty());

        // the next fetch recompiles from the fresh bytes and caches it
        let compiles = AtomicU32::new(0);
        cache
            .get_or_compile(0x0100, |a| {
                compiles.fetch_add(1, Ordering::Relaxed);
                Ok(block(a, 2))
            })
            .unwrap();
        assert_eq!(compiles.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidation_outside_coverage_is_ignored() {
        let cache = CompiledBlockCache::new();
        cache.get_or_compile(0x0200, |a| Ok(block(a, 4))).unwrap();
        cache.invalidate(0x0204, 16);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn wraparound_block_is_invalidated_from_either_side() {
        let cache = CompiledBlockCache::new();
        // 32-byte block at 0xFFF0 covers [0xFFF0,0xFFFF] and [0x0000,0x000F]
        cache.get_or_compile(0xFFF0, |a| Ok(block(a, 32))).unwrap();

        cache.invalidate(0x0005, 1);
        assert!(cache.is_empty());

        cache.get_or_compile(0xFFF0, |a| Ok(block(a, 32))).unwrap();
        cache.invalidate(0xFFF8, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn wraparound_write_invalidates_low_blocks() {
        let cache = CompiledBlockCache::new();
        cache.get_or_compile(0x0002, |a| Ok(block(a, 2))).unwrap();
        // write spanning 0xFFFE..0x0003 wraps and touches the block
        cache.invalidate(0xFFFE, 6);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_evicts_only_idle_entries() {
        let cache = CompiledBlockCache::new();
        cache.get_or_compile(0x0100, |a| Ok(block(a, 1))).unwrap();
        cache.get_or_compile(0x0200, |a| Ok(block(a, 1))).unwrap();

        // first sweep records the baseline; both were accessed since zero
        cache.sweep();
        assert_eq!(cache.len(), 2);

        // only 0x0100 is touched before the next sweep
        cache.get_or_compile(0x0100, |a| Ok(block(a, 1))).unwrap();
        cache.sweep();
        assert_eq!(cache.len(), 1);
        let compiles = AtomicU32::new(0);
        cache
            .get_or_compile(0x0100, |a| {
                compiles.fetch_add(1, Ordering::Relaxed);
                Ok(block(a, 1))
            })
            .unwrap();
        assert_eq!(compiles.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn compile_errors_propagate_and_cache_nothing() {
        let cache = CompiledBlockCache::new();
        let err = cache
            .get_or_compile(0x0300, |address| {
                Err(CoreError::UnsupportedInstruction { address })
            })
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnsupportedInstruction { address: 0x0300 }
        ));
        assert!(cache.is_empty());
    }
}
