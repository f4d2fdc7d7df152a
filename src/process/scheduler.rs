// Process Scheduler for EMOS Microkernel
use core::fmt;
use core::sync::atomic::Ordering;

use log::{info, trace, warn};

use crate::kernel::{Kernel, TableGuard};
use crate::param::{DEFAULT_POLICY, QUANTUM};
use crate::platform::{Arch, Platform};
use crate::process::pcb::{ProcessError, ProcessState};

/// Scheduling policies, numbered as user space selects them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedPolicy {
    RoundRobin = 0,
    /// Round-robin where a yield only gives up the CPU every `QUANTUM` running ticks
    Quantum = 1,
    /// Lowest `changeable_priority` first, aged on every pick
    Priority = 2,
}

impl SchedPolicy {
    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            0 => Some(SchedPolicy::RoundRobin),
            1 => Some(SchedPolicy::Quantum),
            2 => Some(SchedPolicy::Priority),
            _ => None,
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedPolicy::RoundRobin => write!(f, "round-robin"),
            SchedPolicy::Quantum => write!(f, "quantum"),
            SchedPolicy::Priority => write!(f, "priority"),
        }
    }
}

impl<P: Platform> Kernel<P> {
    /// Active scheduling policy.
    pub fn policy(&self) -> SchedPolicy {
        SchedPolicy::from_id(self.policy.load(Ordering::Relaxed) as u64).unwrap_or(DEFAULT_POLICY)
    }

    /// Select the scheduling policy by id. Unknown ids leave the current
    /// policy in place.
    pub fn set_policy(&self, id: u64) -> Result<(), ProcessError> {
        match SchedPolicy::from_id(id) {
            Some(policy) => {
                self.policy.store(policy as u8, Ordering::Relaxed);
                info!("scheduler policy set to {}", policy);
                Ok(())
            }
            None => {
                warn!("rejected scheduler policy id {}", id);
                Err(ProcessError::InvalidArgument)
            }
        }
    }

    /// Per-CPU process scheduler. Each CPU calls this after setting itself up.
    /// Never returns; it loops doing:
    ///  - choose a process to run
    ///  - switch to start running that process
    ///  - eventually that process transfers control back via `sched`
    pub fn scheduler(&self) -> ! {
        loop {
            if !self.schedule_once() {
                self.platform().arch().idle();
            }
        }
    }

    /// One pass of the dispatch loop. Returns whether a process ran.
    pub fn schedule_once(&self) -> bool {
        let arch = self.platform().arch();
        // Let devices interrupt an otherwise idle CPU.
        arch.enable_interrupts();

        let mut table = self.lock_table();
        let cpu = self.this_cpu();
        let policy = self.policy();
        // SAFETY: interrupts are off while the table lock is held.
        let previous = unsafe { (*cpu).last_dispatched };

        let picked = match policy {
            SchedPolicy::RoundRobin | SchedPolicy::Quantum => table.next_runnable_after(previous),
            SchedPolicy::Priority => table.highest_priority_runnable(),
        };
        let Some(slot) = picked else {
            return false;
        };

        let p = &mut table[slot];
        if policy == SchedPolicy::Priority {
            p.changeable_priority = p.changeable_priority.saturating_add(p.priority);
        }
        p.set_state(ProcessState::Running);
        p.first_cpu_acquired = true;
        p.time_slot += 1;
        trace!("cpu {}: dispatch pid {} ({})", arch.cpu_id(), p.pid, policy);

        // SAFETY: interrupts are off.
        unsafe {
            (*cpu).proc = Some(slot);
            (*cpu).last_dispatched = Some(slot);
        }
        if let (Some(space), Some(stack)) = (&p.space, &p.kstack) {
            self.platform().activate_user(space, stack);
        }

        // The process releases the table lock and re-acquires it before
        // switching back here.
        let next = &p.context as *const _;
        // SAFETY: the scheduler context is this CPU's own; `next` lives in the
        // table and the record cannot be reaped while it is Running.
        unsafe { arch.switch(&mut (*cpu).scheduler, next) };
        self.platform().activate_kernel();

        // SAFETY: still on this CPU with interrupts off.
        unsafe { (*cpu).proc = None };
        drop(table);
        true
    }

    /// Enter the scheduler from the current process.
    ///
    /// The caller holds only the table lock and has already moved the
    /// process out of Running. Returns the table lock when the process is
    /// dispatched again, possibly on another CPU.
    pub fn sched<'a>(&'a self, mut table: TableGuard<'a, P>) -> TableGuard<'a, P> {
        let arch = self.platform().arch();
        // Read before holding_table, which leaves interrupts off.
        let interruptible = arch.interrupts_enabled();
        if !self.holding_table() {
            panic!("sched table lock");
        }
        let cpu = self.this_cpu();
        // SAFETY: the table lock keeps interrupts off.
        let (ncli, intena, current) = unsafe { ((*cpu).ncli, (*cpu).intena, (*cpu).proc) };
        if ncli != 1 {
            panic!("sched locks");
        }
        let Some(slot) = current else {
            panic!("sched without a process");
        };
        if table[slot].state() == ProcessState::Running {
            panic!("sched running");
        }
        if interruptible {
            arch.disable_interrupts();
            panic!("sched interruptible");
        }

        let old = &mut table[slot].context as *mut _;
        // SAFETY: `old` belongs to the current process, which stays off every
        // run queue until this switch has saved it.
        unsafe { arch.switch(old, &(*cpu).scheduler) };

        let cpu = self.this_cpu();
        // SAFETY: the lock is held again, interrupts are off.
        unsafe { (*cpu).intena = intena };
        table
    }

    /// Give up the CPU for one scheduling round.
    ///
    /// Under the quantum policy the CPU is only given up once the process has
    /// run for a multiple of `QUANTUM` ticks.
    pub fn yield_cpu(&self) {
        let mut table = self.lock_table();
        let Some(slot) = self.current_slot() else {
            return;
        };
        if self.policy() == SchedPolicy::Quantum
            && table[slot].times.running_time % QUANTUM != 0
        {
            return;
        }
        table[slot].set_state(ProcessState::Runnable);
        drop(self.sched(table));
    }

    /// First code a new process runs once the scheduler switches to it.
    ///
    /// Platforms call this from the entry point installed by
    /// [`Platform::init_context`] before returning to user space.
    pub fn fork_return(&self) {
        // SAFETY: schedule_once switched here holding the table lock and its
        // guard stays on the scheduler's stack.
        unsafe { self.force_release_table() };
    }
}
