// Per-CPU state and interrupt nesting for EMOS Microkernel
use core::cell::UnsafeCell;

use crate::kernel::Kernel;
use crate::platform::{Arch, ContextOf, Platform};
use crate::process::pcb::Slot;

/// State owned by one CPU
pub struct Cpu<P: Platform> {
    /// Process running on this CPU, if any
    pub proc: Option<Slot>,
    /// swtch() here to enter the dispatch loop
    pub scheduler: ContextOf<P>,
    /// Depth of interrupt-disabling sections
    pub ncli: u32,
    /// Were interrupts enabled before the outermost push_off?
    pub intena: bool,
    /// Slot most recently dispatched here; round-robin resumes after it
    pub last_dispatched: Option<Slot>,
}

impl<P: Platform> Cpu<P> {
    pub fn new() -> Self {
        Self {
            proc: None,
            scheduler: Default::default(),
            ncli: 0,
            intena: false,
            last_dispatched: None,
        }
    }
}

impl<P: Platform> Default for Cpu<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cell only ever touched by its own CPU with interrupts disabled.
pub(crate) struct PerCpu<T>(UnsafeCell<T>);

impl<T> PerCpu<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub(crate) fn get(&self) -> *mut T {
        self.0.get()
    }
}

unsafe impl<T: Send> Sync for PerCpu<T> {}

impl<P: Platform> Kernel<P> {
    /// Index of the executing CPU.
    ///
    /// Must be called with interrupts disabled, otherwise the caller could
    /// migrate between reading the id and using it.
    pub fn cpu_id(&self) -> usize {
        let arch = self.platform().arch();
        if arch.interrupts_enabled() {
            panic!("cpu_id called with interrupts enabled");
        }
        arch.cpu_id()
    }

    /// This CPU's state. Interrupts must be disabled for as long as the
    /// pointer is used.
    pub(crate) fn this_cpu(&self) -> *mut Cpu<P> {
        let id = self.cpu_id();
        match self.cpus().get(id) {
            Some(cell) => cell.get(),
            None => panic!("unknown cpu {}", id),
        }
    }

    /// Disable interrupts, counting nesting so that matched `pop_off` calls
    /// restore the original state.
    pub(crate) fn push_off(&self) {
        let arch = self.platform().arch();
        let old = arch.interrupts_enabled();
        arch.disable_interrupts();
        // SAFETY: interrupts are off, only this CPU touches its state.
        let cpu = unsafe { &mut *self.this_cpu() };
        if cpu.ncli == 0 {
            cpu.intena = old;
        }
        cpu.ncli += 1;
    }

    pub(crate) fn pop_off(&self) {
        let arch = self.platform().arch();
        if arch.interrupts_enabled() {
            panic!("pop_off - interruptible");
        }
        // SAFETY: interrupts are off, only this CPU touches its state.
        let cpu = unsafe { &mut *self.this_cpu() };
        if cpu.ncli < 1 {
            panic!("pop_off");
        }
        cpu.ncli -= 1;
        if cpu.ncli == 0 && cpu.intena {
            arch.enable_interrupts();
        }
    }

    /// Table slot of the process running on this CPU.
    pub(crate) fn current_slot(&self) -> Option<Slot> {
        self.push_off();
        // SAFETY: interrupts are off.
        let slot = unsafe { (*self.this_cpu()).proc };
        self.pop_off();
        slot
    }
}
