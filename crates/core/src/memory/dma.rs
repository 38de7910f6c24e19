//! DMA: a producer/consumer queue of pending copy descriptors and the
//! background pump that executes them.
//!
//! The pump runs on its own thread and moves bytes through the normal
//! address-space read/write path, so cache invalidation notifications fire
//! for DMA writes exactly as they do for CPU writes. Each operation's
//! locked ranges are published for its duration but are advisory only; the
//! read/write path does not consult them, so CPU and DMA accesses may
//! interleave byte-wise during a copy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ClockMode;
use crate::error::CoreError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::memory::range::AddressRange;
use crate::memory::space::AddressSpace;

/// A pending copy descriptor.
#[derive(Debug, Clone)]
pub struct DmaOperation {
    pub source: u16,
    pub destination: u16,
    pub length: u16,
    /// Machine cycles the copy occupies the bus for; the pump blocks this
    /// long (scaled by the clock) before accepting the next operation.
    pub cycle_cost: u32,
    /// Ranges the copy claims while it runs. Advisory, see module docs.
    pub locked_ranges: Vec<AddressRange>,
}

struct Queue {
    operations: VecDeque<DmaOperation>,
    closed: bool,
}

/// Thread-safe unbounded queue of DMA operations.
///
/// `enqueue` never blocks; `try_dequeue` is the sole consumer entry point
/// and is only called by the pump.
pub struct DmaController {
    queue: Mutex<Queue>,
    available: Condvar,
    /// Locked ranges of the in-flight operation, empty when idle.
    locked: Mutex<Vec<AddressRange>>,
}

impl Default for DmaController {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaController {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                operations: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            locked: Mutex::new(Vec::new()),
        }
    }

    /// Queue an operation. Never blocks; operations arriving after the
    /// queue closed are dropped.
    pub fn enqueue(&self, op: DmaOperation) {
        let mut queue = self.queue.lock().unwrap();
        if queue.closed {
            log(LogCategory::Dma, LogLevel::Warn, || {
                format!(
                    "dropping DMA {:#06X}->{:#06X} len {}: queue closed",
                    op.source, op.destination, op.length
                )
            });
            return;
        }
        queue.operations.push_back(op);
        self.available.notify_one();
    }

    /// Take the next operation, waiting up to `timeout` for one to arrive.
    pub fn try_dequeue(&self, timeout: Duration) -> Option<DmaOperation> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(op) = queue.operations.pop_front() {
                return Some(op);
            }
            let now = Instant::now();
            if now >= deadline || queue.closed {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = guard;
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().operations.len()
    }

    /// Ranges claimed by the in-flight operation.
    pub fn locked_ranges(&self) -> Vec<AddressRange> {
        self.locked.lock().unwrap().clone()
    }

    fn set_locked_ranges(&self, ranges: Vec<AddressRange>) {
        *self.locked.lock().unwrap() = ranges;
    }

    /// Close the queue and wait for the pump to drain it.
    ///
    /// Escalates to a fatal error if the queue has not emptied when the
    /// timeout expires; a silent hang here would mask a stuck pump.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), CoreError> {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.closed = true;
            self.available.notify_all();
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.lock().unwrap().operations.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::ShutdownTimeout { component: "DMA queue" });
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// How long the pump waits on an empty queue before re-checking its stop
/// flag.
const PUMP_POLL: Duration = Duration::from_millis(5);

/// Background thread that drains the DMA queue through an address space.
pub struct DmaPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DmaPump {
    /// Spawn the pump. It polls the controller with a bounded timeout,
    /// executes each operation through `space` (so write notifications
    /// fire), and paces itself by each operation's cycle cost.
    pub fn start(
        space: Arc<AddressSpace>,
        controller: Arc<DmaController>,
        clock: ClockMode,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("dma-pump".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    let Some(op) = controller.try_dequeue(PUMP_POLL) else {
                        continue;
                    };

                    log(LogCategory::Dma, LogLevel::Debug, || {
                        format!(
                            "DMA {:#06X}->{:#06X} len {} cost {}",
                            op.source, op.destination, op.length, op.cycle_cost
                        )
                    });

                    controller.set_locked_ranges(op.locked_ranges.clone());
                    if let Err(err) =
                        space.transfer_bytes(op.source, op.destination, op.length as u32)
                    {
                        log(LogCategory::Dma, LogLevel::Error, || {
                            format!("DMA transfer failed: {}", err)
                        });
                    }

                    if let ClockMode::Throttled { hz } = clock {
                        let nanos = op.cycle_cost as u64 * 1_000_000_000 / hz.max(1) as u64;
                        thread::sleep(Duration::from_nanos(nanos));
                    }
                    controller.set_locked_ranges(Vec::new());
                }
            })
            .expect("spawn dma-pump thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the pump and join its thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DmaPump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(source: u16, destination: u16, length: u16) -> DmaOperation {
        DmaOperation {
            source,
            destination,
            length,
            cycle_cost: 4,
            locked_ranges: vec![],
        }
    }

    #[test]
    fn enqueue_then_dequeue_is_fifo() {
        let controller = DmaController::new();
        controller.enqueue(op(0, 0x100, 4));
        controller.enqueue(op(0x200, 0x300, 8));

        let first = controller.try_dequeue(Duration::from_millis(10)).unwrap();
        assert_eq!(first.destination, 0x100);
        let second = controller.try_dequeue(Duration::from_millis(10)).unwrap();
        assert_eq!(second.destination, 0x300);
    }

    #[test]
    fn dequeue_times_out_on_empty_queue() {
        let controller = DmaController::new();
        let start = Instant::now();
        assert!(controller.try_dequeue(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn dequeue_wakes_on_cross_thread_enqueue() {
        let controller = Arc::new(DmaController::new());
        let producer = Arc::clone(&controller);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.enqueue(op(0, 0x10, 1));
        });
        let got = controller.try_dequeue(Duration::from_secs(1));
        t.join().unwrap();
        assert!(got.is_some());
    }

    #[test]
    fn shutdown_of_empty_queue_is_immediate() {
        let controller = DmaController::new();
        assert!(controller.shutdown(Duration::from_millis(10)).is_ok());
        // enqueue after close is dropped
        controller.enqueue(op(0, 0, 1));
        assert_eq!(controller.pending(), 0);
    }

    #[test]
    fn shutdown_with_stuck_operation_escalates() {
        let controller = DmaController::new();
        controller.enqueue(op(0, 0, 1));
        // no pump running, so the queue can never drain
        let err = controller.shutdown(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, CoreError::ShutdownTimeout { .. }));
    }
}
