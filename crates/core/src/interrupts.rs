//! Interrupt-driven halt/resume coordination.
//!
//! A dedicated coordination thread dequeues interrupt requests one at a
//! time, which makes the vector handoff single-slot: at most one interrupt
//! is in flight. Requests arriving while interrupts are disabled are
//! discarded at dequeue time. The handshake with the execution core is an
//! explicit state machine over a mutex/condvar pair; every wait is timed,
//! so shutdown and cancellation never hang silently.
//!
//! Acceptance sequence: set Interrupting, force the enable gate false, halt
//! the core if it is not already halted, wait for the core's halt
//! acknowledgement, place the vector in the handoff slot, clear
//! Interrupting. The core picks the vector up from the slot, pushes PC and
//! resumes at the vector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::logging::{log, LogCategory, LogLevel};

/// A pending interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRequest {
    pub vector: u16,
}

/// How long blocked participants wait before re-checking stop/cancel flags.
const POLL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct Coord {
    halted: bool,
    /// Core has observed the halt; stays set until the core resumes.
    halt_acked: bool,
    /// Single-slot vector handoff.
    vector: Option<u16>,
    /// A handoff completed since the last resume; gates resume tasks.
    handoff_done: bool,
}

struct Shared {
    coord: Mutex<Coord>,
    cond: Condvar,
    /// Mirror of IFF1, maintained by the execution core and forced false
    /// at acceptance.
    enabled: AtomicBool,
    interrupting: AtomicBool,
    stop: AtomicBool,
    resume_tasks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// Async halt/resume/interrupt-acceptance state machine.
pub struct InterruptController {
    shared: Arc<Shared>,
    requests: Sender<InterruptRequest>,
    done: Mutex<Receiver<()>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl InterruptController {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            coord: Mutex::new(Coord::default()),
            cond: Condvar::new(),
            enabled: AtomicBool::new(false),
            interrupting: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            resume_tasks: Mutex::new(Vec::new()),
        });

        let (requests, request_rx) = channel::<InterruptRequest>();
        let (done_tx, done_rx) = channel::<()>();
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("interrupt-coordinator".to_string())
            .spawn(move || {
                Self::coordinate(&thread_shared, request_rx);
                let _ = done_tx.send(());
            })
            .expect("spawn interrupt-coordinator thread");

        Self {
            shared,
            requests,
            done: Mutex::new(done_rx),
            handle: Mutex::new(Some(handle)),
        }
    }

    fn coordinate(shared: &Shared, requests: Receiver<InterruptRequest>) {
        loop {
            if shared.stop.load(Ordering::Relaxed) {
                // Drain whatever is still queued; nothing can be delivered
                // to a stopping core.
                while requests.try_recv().is_ok() {}
                return;
            }

            let request = match requests.recv_timeout(POLL) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            };

            // IFF1 gates acceptance at dequeue time
            if !shared.enabled.load(Ordering::Relaxed) {
                log(LogCategory::Interrupts, LogLevel::Debug, || {
                    format!("discarding vector {:#06X}: interrupts disabled", request.vector)
                });
                continue;
            }

            shared.interrupting.store(true, Ordering::Relaxed);
            shared.enabled.store(false, Ordering::Relaxed);

            let mut coord = shared.coord.lock().unwrap();
            if !coord.halted {
                coord.halted = true;
            }
            shared.cond.notify_all();

            // Await the core's halt acknowledgement
            let mut abandoned = false;
            while !coord.halt_acked {
                if shared.stop.load(Ordering::Relaxed) {
                    abandoned = true;
                    break;
                }
                let (guard, _) = shared.cond.wait_timeout(coord, POLL).unwrap();
                coord = guard;
            }

            if !abandoned {
                log(LogCategory::Interrupts, LogLevel::Debug, || {
                    format!("handing off vector {:#06X}", request.vector)
                });
                coord.vector = Some(request.vector);
                shared.cond.notify_all();
            }
            shared.interrupting.store(false, Ordering::Relaxed);
        }
    }

    /// Queue an interrupt request. Returns immediately; acceptance is
    /// decided by the coordination thread.
    pub fn interrupt(&self, vector: u16) {
        let _ = self.requests.send(InterruptRequest { vector });
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Refresh the IFF1 mirror. Ignored while an acceptance is in flight,
    /// where the gate is owned by the coordination thread.
    pub fn set_interrupts_enabled(&self, enabled: bool) {
        if !self.shared.interrupting.load(Ordering::Relaxed) {
            self.shared.enabled.store(enabled, Ordering::Relaxed);
        }
    }

    /// Running → Halted. Triggered by a HALT-class block or an accepted
    /// interrupt.
    pub fn halt(&self) {
        let mut coord = self.shared.coord.lock().unwrap();
        coord.halted = true;
        self.shared.cond.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.shared.coord.lock().unwrap().halted
    }

    pub fn is_interrupting(&self) -> bool {
        self.shared.interrupting.load(Ordering::Relaxed)
    }

    /// The execution core has observed the halt.
    pub fn notify_halt(&self) {
        let mut coord = self.shared.coord.lock().unwrap();
        coord.halt_acked = true;
        self.shared.cond.notify_all();
    }

    /// Block until a vector is handed off, or `cancel` is raised.
    pub fn await_vector(&self, cancel: &AtomicBool) -> Option<u16> {
        let mut coord = self.shared.coord.lock().unwrap();
        loop {
            if let Some(vector) = coord.vector.take() {
                coord.handoff_done = true;
                return Some(vector);
            }
            if cancel.load(Ordering::Relaxed) || self.shared.stop.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _) = self.shared.cond.wait_timeout(coord, POLL).unwrap();
            coord = guard;
        }
    }

    /// The execution core is running again. Fires pending resume tasks
    /// exactly once per completed handoff.
    ///
    /// Only an acknowledged halt is cleared. The coordinator may raise
    /// `halted` at any point while the core is mid-iteration; a resume from
    /// before the core observed that halt must leave it pending for the
    /// next iteration.
    pub fn notify_resume(&self) {
        let fired = {
            let mut coord = self.shared.coord.lock().unwrap();
            if coord.halt_acked {
                coord.halted = false;
                coord.halt_acked = false;
            }
            std::mem::take(&mut coord.handoff_done)
        };
        if fired {
            let tasks: Vec<_> = std::mem::take(&mut *self.shared.resume_tasks.lock().unwrap());
            for task in tasks {
                task();
            }
        }
    }

    /// Chain a one-shot action to run when the next interrupt handoff
    /// completes (used to resume halted peripherals).
    pub fn add_resume_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.resume_tasks.lock().unwrap().push(Box::new(task));
    }

    /// Stop accepting interrupts, drain the queue and join the
    /// coordination thread. Escalates to a fatal error on timeout.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), CoreError> {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.cond.notify_all();

        let deadline = Instant::now() + timeout;
        let done = self.done.lock().unwrap();
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            Ok(()) => {
                if let Some(handle) = self.handle.lock().unwrap().take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            Err(_) => {
                // Second shutdown after a successful one: thread already
                // joined, receiver is disconnected with no pending signal.
                if self.handle.lock().unwrap().is_none() {
                    Ok(())
                } else {
                    Err(CoreError::ShutdownTimeout {
                        component: "interrupt queue",
                    })
                }
            }
        }
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptController {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_while_disabled_is_discarded() {
        let controller = InterruptController::new();
        controller.set_interrupts_enabled(false);
        controller.interrupt(0x0038);

        thread::sleep(Duration::from_millis(50));
        assert!(!controller.is_halted());
        assert!(!controller.is_interrupting());

        let cancel = AtomicBool::new(true);
        assert_eq!(controller.await_vector(&cancel), None);
        controller.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn accepted_interrupt_halts_then_hands_off_the_vector() {
        let controller = Arc::new(InterruptController::new());
        controller.set_interrupts_enabled(true);

        // fake execution core: ack the halt once it appears, then collect
        // the vector
        let core = Arc::clone(&controller);
        let t = thread::spawn(move || {
            while !core.is_halted() {
                thread::sleep(Duration::from_millis(1));
            }
            core.notify_halt();
            let cancel = AtomicBool::new(false);
            let vector = core.await_vector(&cancel);
            core.notify_resume();
            vector
        });

        controller.interrupt(0x0038);
        let vector = t.join().unwrap();
        assert_eq!(vector, Some(0x0038));
        // acceptance forced the enable gate off
        assert!(!controller.interrupts_enabled());
        assert!(!controller.is_halted());
        controller.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn halted_core_receives_interrupt_without_a_second_halt() {
        let controller = Arc::new(InterruptController::new());
        controller.set_interrupts_enabled(true);

        // core executed HALT before any interrupt existed
        controller.halt();
        controller.notify_halt();

        let core = Arc::clone(&controller);
        let t = thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            core.await_vector(&cancel)
        });

        controller.interrupt(0x0066);
        assert_eq!(t.join().unwrap(), Some(0x0066));
        controller.notify_resume();
        controller.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn resume_tasks_fire_once_per_handoff() {
        let controller = Arc::new(InterruptController::new());
        controller.set_interrupts_enabled(true);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        controller.add_resume_task(move || flag.store(true, Ordering::Relaxed));

        // resume without a handoff: task must not fire
        controller.notify_resume();
        assert!(!fired.load(Ordering::Relaxed));

        controller.halt();
        controller.notify_halt();
        controller.interrupt(0x0010);
        let cancel = AtomicBool::new(false);
        assert_eq!(controller.await_vector(&cancel), Some(0x0010));
        controller.notify_resume();
        assert!(fired.load(Ordering::Relaxed));
        controller.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn resume_before_the_core_observes_the_halt_keeps_it_pending() {
        let controller = Arc::new(InterruptController::new());
        controller.set_interrupts_enabled(true);
        controller.interrupt(0x0038);

        // the coordinator halts a running core
        while !controller.is_halted() {
            thread::sleep(Duration::from_millis(1));
        }

        // a resume issued before the core acknowledged the halt must not
        // wipe it; the acceptance is still in flight
        controller.notify_resume();
        assert!(controller.is_halted());
        assert!(controller.is_interrupting());

        // the core observes the halt on its next iteration and the vector
        // still arrives
        controller.notify_halt();
        let cancel = AtomicBool::new(false);
        assert_eq!(controller.await_vector(&cancel), Some(0x0038));
        controller.notify_resume();
        assert!(!controller.is_halted());
        controller.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn shutdown_is_idempotent_and_fast_when_idle() {
        let controller = InterruptController::new();
        controller.shutdown(Duration::from_secs(1)).unwrap();
        controller.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn await_vector_respects_cancellation() {
        let controller = InterruptController::new();
        let cancel = AtomicBool::new(false);
        let start = Instant::now();
        let c = &controller;
        thread::scope(|s| {
            let waiter = s.spawn(|| c.await_vector(&cancel));
            thread::sleep(Duration::from_millis(20));
            cancel.store(true, Ordering::Relaxed);
            assert_eq!(waiter.join().unwrap(), None);
        });
        assert!(start.elapsed() < Duration::from_secs(1));
        controller.shutdown(Duration::from_secs(1)).unwrap();
    }
}
