// Kernel instance of the EMOS process subsystem
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::mutex::{SpinMutex, SpinMutexGuard};

use crate::param::{DEFAULT_POLICY, NCPU};
use crate::platform::Platform;
use crate::process::context::{Cpu, PerCpu};
use crate::process::pcb::ProcessId;
use crate::process::scheduler::SchedPolicy;
use crate::process::table::ProcessTable;

const NO_OWNER: usize = usize::MAX;

/// The process subsystem: process table, per-CPU state and scheduler
/// configuration, bound to the platform that provides memory, files and
/// context switching.
///
/// One instance exists per machine. Every CPU runs [`Kernel::scheduler`] on it.
pub struct Kernel<P: Platform> {
    platform: P,
    table: SpinMutex<ProcessTable<P>>,
    /// CPU holding `table`, or `NO_OWNER`
    table_owner: AtomicUsize,
    cpus: [PerCpu<Cpu<P>>; NCPU],
    /// Selected policy. Read without the table lock; a stale read only
    /// delays the switch to the new policy by one dispatch.
    pub(crate) policy: AtomicU8,
    ticks: AtomicU64,
    pub(crate) init_pid: AtomicU64,
}

impl<P: Platform> Kernel<P> {
    pub fn new(platform: P) -> Self {
        Self::with_policy(platform, DEFAULT_POLICY)
    }

    pub fn with_policy(platform: P, policy: SchedPolicy) -> Self {
        Self {
            platform,
            table: SpinMutex::new(ProcessTable::new()),
            table_owner: AtomicUsize::new(NO_OWNER),
            cpus: core::array::from_fn(|_| PerCpu::new(Cpu::new())),
            policy: AtomicU8::new(policy as u8),
            ticks: AtomicU64::new(0),
            init_pid: AtomicU64::new(0),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub(crate) fn cpus(&self) -> &[PerCpu<Cpu<P>>; NCPU] {
        &self.cpus
    }

    /// Acquire the process table lock.
    ///
    /// Interrupts stay disabled on this CPU until the guard is dropped.
    /// Re-acquiring on the same CPU is a deadlock and panics instead.
    pub fn lock_table(&self) -> TableGuard<'_, P> {
        self.push_off();
        if self.holding_table() {
            panic!("acquire: process table already held");
        }
        let guard = self.table.lock();
        self.table_owner.store(self.cpu_id(), Ordering::Relaxed);
        TableGuard {
            kernel: self,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Acquire the table lock only if it is free.
    pub fn try_lock_table(&self) -> Option<TableGuard<'_, P>> {
        self.push_off();
        match self.table.try_lock() {
            Some(guard) => {
                self.table_owner.store(self.cpu_id(), Ordering::Relaxed);
                Some(TableGuard {
                    kernel: self,
                    guard: ManuallyDrop::new(guard),
                })
            }
            None => {
                self.pop_off();
                None
            }
        }
    }

    /// Whether this CPU holds the table lock.
    pub fn holding_table(&self) -> bool {
        self.push_off();
        let held = self.table.is_locked()
            && self.table_owner.load(Ordering::Relaxed) == self.cpu_id();
        self.pop_off();
        held
    }

    /// Release a table lock this CPU holds without owning a guard for it:
    /// the one a brand-new process inherits from the dispatch loop.
    ///
    /// # Safety
    /// This CPU must hold the table lock and no live guard may refer to it on
    /// the current kernel thread.
    pub(crate) unsafe fn force_release_table(&self) {
        if !self.holding_table() {
            panic!("release: process table not held");
        }
        self.table_owner.store(NO_OWNER, Ordering::Relaxed);
        unsafe { self.table.force_unlock() };
        self.pop_off();
    }

    /// Raw pointer to the table for lock-free debugging reads.
    pub(crate) fn table_ptr(&self) -> *const ProcessTable<P> {
        self.table.as_mut_ptr()
    }

    /// Ticks since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub(crate) fn advance_ticks(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Pid of the first process, once it exists.
    pub fn init_pid(&self) -> Option<ProcessId> {
        match self.init_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Holder of the process table lock.
///
/// Dropping it releases the lock and undoes the interrupt disabling done on
/// acquisition. A guard may be carried through a context switch: the
/// scheduler side and the process side each own one, and whichever runs next
/// on the CPU releases the lock.
pub struct TableGuard<'a, P: Platform> {
    kernel: &'a Kernel<P>,
    guard: ManuallyDrop<SpinMutexGuard<'a, ProcessTable<P>>>,
}

impl<P: Platform> Deref for TableGuard<'_, P> {
    type Target = ProcessTable<P>;

    fn deref(&self) -> &ProcessTable<P> {
        &self.guard
    }
}

impl<P: Platform> DerefMut for TableGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut ProcessTable<P> {
        &mut self.guard
    }
}

impl<P: Platform> Drop for TableGuard<'_, P> {
    fn drop(&mut self) {
        self.kernel.table_owner.store(NO_OWNER, Ordering::Relaxed);
        // SAFETY: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.kernel.pop_off();
    }
}
