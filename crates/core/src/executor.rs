//! The fetch-execute loop tying registers, memory, ALU, cache, interrupts
//! and peripherals together.
//!
//! The loop is the single-threaded owner of register state. It suspends in
//! two places: awaiting the interrupt controller's halt acknowledgement
//! handshake and awaiting the next vector; both waits are timed and
//! re-check the cancellation flag. Cancellation is cooperative, checked
//! once per iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::alu::Alu;
use crate::cache::CompiledBlockCache;
use crate::config::{ClockMode, PlatformConfig};
use crate::error::CoreError;
use crate::interrupts::InterruptController;
use crate::logging::{log, LogCategory, LogLevel};
use crate::memory::dma::{DmaController, DmaPump};
use crate::memory::space::AddressSpace;
use crate::registers::RegisterFile;
use crate::{CoreBus, InstructionDecoder, PeripheralManager};

/// How long shutdown waits for the DMA and interrupt queues to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Cancellation poll interval while parked in a DI halt.
const PARK_POLL: Duration = Duration::from_millis(5);

/// Paces execution to real hardware speed by converting machine cycles to
/// wall-clock time. Sub-millisecond debts accumulate until they are worth
/// sleeping for.
struct Clock {
    mode: ClockMode,
    debt_nanos: u64,
}

impl Clock {
    fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            debt_nanos: 0,
        }
    }

    fn throttle(&mut self, cycles: u32) {
        let ClockMode::Throttled { hz } = self.mode else {
            return;
        };
        self.debt_nanos += cycles as u64 * 1_000_000_000 / hz.max(1) as u64;
        if self.debt_nanos >= 1_000_000 {
            thread::sleep(Duration::from_nanos(self.debt_nanos));
            self.debt_nanos = 0;
        }
    }
}

/// The execution engine: owns the register file and runs compiled blocks
/// until cancelled.
pub struct ExecutionCore {
    registers: RegisterFile,
    alu: Alu,
    space: Arc<AddressSpace>,
    cache: Arc<CompiledBlockCache>,
    interrupts: Arc<InterruptController>,
    peripherals: Arc<dyn PeripheralManager>,
    decoder: Box<dyn InstructionDecoder>,
    dma: Arc<DmaController>,
    pump: DmaPump,
    clock: Clock,
}

impl ExecutionCore {
    /// Wire up a core from the platform configuration. The address space,
    /// cache, interrupt controller and DMA pump are built here and owned
    /// by the core; nothing is process-global.
    pub fn new(
        config: &PlatformConfig,
        decoder: Box<dyn InstructionDecoder>,
        peripherals: Arc<dyn PeripheralManager>,
    ) -> Result<Self, CoreError> {
        let space = Arc::new(AddressSpace::from_config(config, peripherals.as_ref())?);
        let cache = Arc::new(CompiledBlockCache::new());
        space.set_write_observer(cache.clone());

        let dma = Arc::new(DmaController::new());
        let pump = DmaPump::start(Arc::clone(&space), Arc::clone(&dma), config.clock);

        Ok(Self {
            registers: RegisterFile::new(),
            alu: Alu::new(),
            space,
            cache,
            interrupts: Arc::new(InterruptController::new()),
            peripherals,
            decoder,
            dma,
            pump,
            clock: Clock::new(config.clock),
        })
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn cache(&self) -> &Arc<CompiledBlockCache> {
        &self.cache
    }

    pub fn interrupt_controller(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    pub fn dma_controller(&self) -> &Arc<DmaController> {
        &self.dma
    }

    /// Run the fetch-execute loop until `cancel` is raised.
    ///
    /// Decoder failures are fatal: no safe block can be synthesized for an
    /// unsupported instruction, so the error propagates out of the loop.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<(), CoreError> {
        let mut pending_vector: Option<u16> = None;

        while !cancel.load(Ordering::Relaxed) {
            // Mirror IFF1 into the acceptance gate at iteration start; an
            // EI therefore takes effect one instruction late, as on the
            // real part.
            self.interrupts.set_interrupts_enabled(self.registers.iff1);

            let address = pending_vector.take().unwrap_or(self.registers.pc);
            let block = self
                .cache
                .get_or_compile(address, |a| self.decoder.decode(a, &self.space))?;

            log(LogCategory::Cpu, LogLevel::Trace, || {
                format!("executing block at {:#06X}", address)
            });

            let mut bus = CoreBus {
                registers: &mut self.registers,
                memory: &self.space,
                alu: &self.alu,
                peripherals: self.peripherals.as_ref(),
            };
            let dynamic_cycles = block.execute(&mut bus)?;
            let cycles = block.static_cycles + dynamic_cycles;

            if block.halts_cpu {
                self.interrupts.halt();
                if block.halts_peripherals {
                    self.peripherals.signal_halt();
                    let peripherals = Arc::clone(&self.peripherals);
                    self.interrupts
                        .add_resume_task(move || peripherals.signal_resume());
                }
            }

            if self.interrupts.is_halted() {
                // Acknowledge first so a signaling thread never blocks on
                // the handshake, whichever branch we take below.
                self.interrupts.notify_halt();
                if self.registers.iff1 || self.interrupts.is_interrupting() {
                    if let Some(vector) = self.interrupts.await_vector(cancel) {
                        // Acceptance: push the resume address, jump to the
                        // vector, and drop IFF1 until the handler re-enables
                        self.registers.iff1 = false;
                        self.registers.sp = self.registers.sp.wrapping_sub(2);
                        self.space.write_word(self.registers.sp, self.registers.pc)?;
                        pending_vector = Some(vector);
                        log(LogCategory::Cpu, LogLevel::Debug, || {
                            format!("resuming at vector {:#06X}", vector)
                        });
                    }
                } else {
                    // Halted with interrupts disabled: nothing can ever
                    // wake the core, so park until cancelled instead of
                    // running off past the halt.
                    while !cancel.load(Ordering::Relaxed) {
                        thread::sleep(PARK_POLL);
                    }
                }
            }

            self.interrupts.notify_resume();
            self.clock.throttle(cycles);
        }
        Ok(())
    }

    /// Tear down the DMA pump and interrupt coordinator, draining both
    /// queues with bounded waits.
    pub fn shutdown(&mut self) -> Result<(), CoreError> {
        self.dma.shutdown(DRAIN_TIMEOUT)?;
        self.pump.stop();
        self.interrupts.shutdown(DRAIN_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompiledBlock;
    use crate::NullPeripherals;
    use std::sync::atomic::AtomicU32;

    /// Decodes a one-byte machine: 0x00 advances PC, 0x76 halts, anything
    /// else is unsupported.
    struct TestDecoder {
        decodes: Arc<AtomicU32>,
        executions: Arc<AtomicU32>,
        cancel: Arc<AtomicBool>,
        cancel_after: u32,
    }

    impl InstructionDecoder for TestDecoder {
        fn decode(
            &self,
            address: u16,
            memory: &AddressSpace,
        ) -> Result<CompiledBlock, CoreError> {
            self.decodes.fetch_add(1, Ordering::Relaxed);
            let executions = Arc::clone(&self.executions);
            let cancel = Arc::clone(&self.cancel);
            let cancel_after = self.cancel_after;
            match memory.read_byte(address) {
                0x00 => Ok(CompiledBlock::new(
                    address,
                    1,
                    4,
                    Box::new(move |bus| {
                        bus.registers.pc = address.wrapping_add(1);
                        if executions.fetch_add(1, Ordering::Relaxed) + 1 >= cancel_after {
                            cancel.store(true, Ordering::Relaxed);
                        }
                        Ok(0)
                    }),
                )),
                0x76 => Ok(CompiledBlock::new(
                    address,
                    1,
                    4,
                    Box::new(move |bus| {
                        bus.registers.pc = address.wrapping_add(1);
                        if executions.fetch_add(1, Ordering::Relaxed) + 1 >= cancel_after {
                            cancel.store(true, Ordering::Relaxed);
                        }
                        Ok(0)
                    }),
                )
                .halting()),
                _ => Err(CoreError::UnsupportedInstruction { address }),
            }
        }
    }

    fn build_core(cancel: &Arc<AtomicBool>, cancel_after: u32) -> (ExecutionCore, Arc<AtomicU32>) {
        let decodes = Arc::new(AtomicU32::new(0));
        let decoder = TestDecoder {
            decodes: Arc::clone(&decodes),
            executions: Arc::new(AtomicU32::new(0)),
            cancel: Arc::clone(cancel),
            cancel_after,
        };
        let core = ExecutionCore::new(
            &PlatformConfig::flat_ram(),
            Box::new(decoder),
            Arc::new(NullPeripherals),
        )
        .unwrap();
        (core, decodes)
    }

    #[test]
    fn run_executes_blocks_until_cancelled() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut core, _) = build_core(&cancel, 16);
        core.run(&cancel).unwrap();
        assert_eq!(core.registers().pc, 16);
        core.shutdown().unwrap();
    }

    #[test]
    fn straight_line_code_compiles_each_address_once() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut core, decodes) = build_core(&cancel, 8);
        core.run(&cancel).unwrap();
        // eight distinct addresses, one decode each
        assert_eq!(decodes.load(Ordering::Relaxed), 8);
        assert_eq!(core.cache().len(), 8);
        core.shutdown().unwrap();
    }

    #[test]
    fn unsupported_instruction_is_fatal_to_the_loop() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut core, _) = build_core(&cancel, u32::MAX);
        core.memory().write_byte(0x0000, 0xED).unwrap();
        let err = core.run(&cancel).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnsupportedInstruction { address: 0x0000 }
        ));
        core.shutdown().unwrap();
    }

    #[test]
    fn halt_with_interrupts_disabled_parks_until_cancelled() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut core, _) = build_core(&cancel, u32::MAX);
        core.memory().write_byte(0x0000, 0x76).unwrap();
        core.registers_mut().iff1 = false;

        let stopper = Arc::clone(&cancel);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.store(true, Ordering::Relaxed);
        });
        core.run(&cancel).unwrap();
        t.join().unwrap();
        core.shutdown().unwrap();
    }

    #[test]
    fn dma_write_invalidates_cached_blocks() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (core, _) = build_core(&cancel, u32::MAX);

        // prime the cache with a block at 0x0000
        core.cache()
            .get_or_compile(0x0000, |a| {
                Ok(CompiledBlock::new(a, 4, 4, Box::new(|_| Ok(0))))
            })
            .unwrap();
        assert_eq!(core.cache().len(), 1);

        core.memory().write_byte(0x2000, 0x42).unwrap();
        core.dma_controller().enqueue(crate::memory::DmaOperation {
            source: 0x2000,
            destination: 0x0002,
            length: 1,
            cycle_cost: 4,
            locked_ranges: vec![],
        });

        // the pump runs on its own thread; give it time to execute
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while core.cache().len() != 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(core.cache().len(), 0);
        assert_eq!(core.memory().read_byte(0x0002), 0x42);
    }

    #[test]
    fn clock_debt_accumulates_only_when_throttled() {
        let mut clock = Clock::new(ClockMode::Unthrottled);
        clock.throttle(1_000_000);
        assert_eq!(clock.debt_nanos, 0);

        let mut clock = Clock::new(ClockMode::Throttled { hz: 4_000_000 });
        clock.throttle(4); // 1µs, below the sleep threshold
        assert_eq!(clock.debt_nanos, 1000);
    }
}
