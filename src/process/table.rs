// Process Table for EMOS Microkernel
use core::ops::{Index, IndexMut};

use crate::param::{NPROC, PRIORITY_FALLBACK, PRIORITY_INIT, PRIORITY_MAX};
use crate::platform::Platform;
use crate::process::pcb::{Proc, ProcessId, ProcessState, Slot};
use crate::process::stats::TimeStats;

/// Fixed-capacity registry of every process.
///
/// Lives behind the kernel's table lock; holding `&mut ProcessTable` is the
/// proof that the lock is held.
pub struct ProcessTable<P: Platform> {
    procs: [Proc<P>; NPROC],
    next_pid: ProcessId,
}

impl<P: Platform> ProcessTable<P> {
    pub fn new() -> Self {
        Self {
            procs: core::array::from_fn(|_| Proc::new()),
            next_pid: 1,
        }
    }

    /// Claim an unused slot as an `Embryo` created at tick `now`.
    ///
    /// Returns `None` when every slot is in use.
    pub fn allocate(&mut self, now: u64) -> Option<Slot> {
        let changeable = match self.minimum_active_priority() {
            PRIORITY_MAX => PRIORITY_FALLBACK,
            min => min,
        };
        let slot = self
            .procs
            .iter()
            .position(|p| p.state() == ProcessState::Unused)
            .map(Slot)?;

        let pid = self.next_pid;
        self.next_pid += 1;

        let p = &mut self.procs[slot.0];
        p.set_state(ProcessState::Embryo);
        p.pid = pid;
        p.parent = None;
        p.killed = false;
        p.channel = None;
        p.time_slot = 0;
        p.priority = PRIORITY_INIT;
        p.changeable_priority = changeable;
        p.first_cpu_acquired = false;
        p.times = TimeStats {
            creation_time: now,
            ..TimeStats::default()
        };
        p.syscall_counts.fill(0);
        Some(slot)
    }

    /// Return an `Embryo` whose construction failed to the free pool.
    ///
    /// Resources must already have been taken out of the record.
    pub fn release(&mut self, slot: Slot) {
        self.procs[slot.0].clear();
    }

    pub fn find_by_pid(&self, pid: ProcessId) -> Option<Slot> {
        if pid == 0 {
            return None;
        }
        self.procs
            .iter()
            .position(|p| p.is_live() && p.pid == pid)
            .map(Slot)
    }

    /// Every slot in table order, live or not.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &Proc<P>)> {
        self.procs.iter().enumerate().map(|(i, p)| (Slot(i), p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Slot, &mut Proc<P>)> {
        self.procs.iter_mut().enumerate().map(|(i, p)| (Slot(i), p))
    }

    /// Run `f` on every record matching `predicate`, in table order.
    pub fn for_each(
        &self,
        mut predicate: impl FnMut(&Proc<P>) -> bool,
        mut f: impl FnMut(Slot, &Proc<P>),
    ) {
        for (slot, p) in self.iter() {
            if predicate(p) {
                f(slot, p);
            }
        }
    }

    /// Smallest `changeable_priority` among runnable records, or the
    /// `PRIORITY_MAX` sentinel when nothing is runnable.
    pub fn minimum_active_priority(&self) -> u32 {
        self.procs
            .iter()
            .filter(|p| p.state() == ProcessState::Runnable)
            .map(|p| p.changeable_priority)
            .min()
            .unwrap_or(PRIORITY_MAX)
    }

    /// First runnable slot strictly after `previous`, wrapping around.
    pub fn next_runnable_after(&self, previous: Option<Slot>) -> Option<Slot> {
        let start = previous.map_or(0, |s| s.0 + 1);
        (0..NPROC)
            .map(|i| (start + i) % NPROC)
            .find(|&i| self.procs[i].state() == ProcessState::Runnable)
            .map(Slot)
    }

    /// Runnable slot with the smallest `changeable_priority`; the first one in
    /// table order wins ties.
    pub fn highest_priority_runnable(&self) -> Option<Slot> {
        let mut best: Option<Slot> = None;
        for (slot, p) in self.iter() {
            if p.state() != ProcessState::Runnable {
                continue;
            }
            match best {
                Some(b) if self.procs[b.0].changeable_priority <= p.changeable_priority => {}
                _ => best = Some(slot),
            }
        }
        best
    }

    /// Mutable access to two distinct records at once.
    pub fn pair_mut(&mut self, a: Slot, b: Slot) -> (&mut Proc<P>, &mut Proc<P>) {
        assert_ne!(a, b, "pair_mut on one slot");
        if a.0 < b.0 {
            let (lo, hi) = self.procs.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.procs.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }
}

impl<P: Platform> Default for ProcessTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Index<Slot> for ProcessTable<P> {
    type Output = Proc<P>;

    fn index(&self, slot: Slot) -> &Proc<P> {
        &self.procs[slot.0]
    }
}

impl<P: Platform> IndexMut<Slot> for ProcessTable<P> {
    fn index_mut(&mut self, slot: Slot) -> &mut Proc<P> {
        &mut self.procs[slot.0]
    }
}
