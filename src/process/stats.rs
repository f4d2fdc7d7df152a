// Process statistics and introspection for EMOS Microkernel
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::kernel::Kernel;
use crate::param::NBACKTRACE;
use crate::platform::{Arch, Platform};
use crate::process::pcb::{ProcessId, ProcessState};
use crate::process::table::ProcessTable;

/// Tick counters of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TimeStats {
    pub creation_time: u64,
    pub termination_time: u64,
    pub sleeping_time: u64,
    pub ready_time: u64,
    pub running_time: u64,
}

impl TimeStats {
    /// Size of the record copied to user space.
    pub const SIZE: usize = 5 * 8;

    pub fn turnaround_time(&self) -> u64 {
        self.termination_time.saturating_sub(self.creation_time)
    }

    /// Ticks spent waiting, either for the CPU or for an event
    pub fn waiting_time(&self) -> u64 {
        self.sleeping_time + self.ready_time
    }

    /// CPU burst time
    pub fn burst_time(&self) -> u64 {
        self.running_time
    }

    /// Little-endian image in field order, as user space reads it.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields = [
            self.creation_time,
            self.termination_time,
            self.sleeping_time,
            self.ready_time,
            self.running_time,
        ];
        for (chunk, value) in out.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let field = |i: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(raw)
        };
        Self {
            creation_time: field(0),
            termination_time: field(1),
            sleeping_time: field(2),
            ready_time: field(3),
            running_time: field(4),
        }
    }
}

/// Averages over a batch of reaped children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AverageTimes {
    pub turnaround_time: u64,
    pub burst_time: u64,
    pub waiting_time: u64,
}

impl AverageTimes {
    /// Integer averages; zero for an empty batch.
    pub fn of<'a>(stats: impl IntoIterator<Item = &'a TimeStats>) -> Self {
        let mut sum = AverageTimes::default();
        let mut count = 0u64;
        for s in stats {
            sum.turnaround_time += s.turnaround_time();
            sum.burst_time += s.burst_time();
            sum.waiting_time += s.waiting_time();
            count += 1;
        }
        if count == 0 {
            return sum;
        }
        AverageTimes {
            turnaround_time: sum.turnaround_time / count,
            burst_time: sum.burst_time / count,
            waiting_time: sum.waiting_time / count,
        }
    }
}

/// Snapshot of one live process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub name: String,
    pub state: ProcessState,
    pub priority: u32,
    pub changeable_priority: u32,
    pub time_slot: u64,
    pub times: TimeStats,
    pub killed: bool,
}

impl<P: Platform> Kernel<P> {
    /// Snapshot of the process with `pid`, if it is live.
    pub fn process_info(&self, pid: ProcessId) -> Option<ProcessInfo> {
        let table = self.lock_table();
        let slot = table.find_by_pid(pid)?;
        let p = &table[slot];
        Some(ProcessInfo {
            pid: p.pid,
            parent: p.parent,
            name: p.name.clone(),
            state: p.state(),
            priority: p.priority,
            changeable_priority: p.changeable_priority,
            time_slot: p.time_slot,
            times: p.times,
            killed: p.killed,
        })
    }

    /// Pids of the children of `pid`, in table order.
    pub fn list_children(&self, pid: ProcessId) -> Vec<ProcessId> {
        let table = self.lock_table();
        table
            .iter()
            .filter(|(_, p)| p.is_live() && p.parent == Some(pid))
            .map(|(_, p)| p.pid)
            .collect()
    }

    /// Number of records currently in the Running state.
    pub fn running_count(&self) -> usize {
        let table = self.lock_table();
        table
            .iter()
            .filter(|(_, p)| p.state() == ProcessState::Running)
            .count()
    }

    /// Print a process listing for debugging.
    ///
    /// Takes the table lock if it is free. If it is held the table is read
    /// without it, so a wedged machine can still be inspected; that listing
    /// may be torn and must never be used for decisions.
    pub fn procdump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match self.try_lock_table() {
            Some(table) => self.dump_table(&table, out),
            None => {
                // SAFETY: read without the lock; the listing may be torn.
                let table = unsafe { &*self.table_ptr() };
                self.dump_table(table, out)
            }
        }
    }

    fn dump_table(
        &self,
        table: &ProcessTable<P>,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        for (_, p) in table.iter().filter(|(_, p)| p.is_live()) {
            write!(out, "{} {} {}", p.pid, p.state().label(), p.name)?;
            if p.state() == ProcessState::Sleeping {
                let mut pcs = [0usize; NBACKTRACE];
                let n = self.platform().arch().backtrace(&p.context, &mut pcs);
                for pc in &pcs[..n] {
                    write!(out, " {:#x}", pc)?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::null_kernel;

    fn stats(creation: u64, termination: u64, sleeping: u64, ready: u64, running: u64) -> TimeStats {
        TimeStats {
            creation_time: creation,
            termination_time: termination,
            sleeping_time: sleeping,
            ready_time: ready,
            running_time: running,
        }
    }

    #[test]
    fn derived_times() {
        let s = stats(10, 50, 5, 7, 20);
        assert_eq!(s.turnaround_time(), 40);
        assert_eq!(s.waiting_time(), 12);
        assert_eq!(s.burst_time(), 20);
    }

    #[test]
    fn byte_image_is_little_endian_in_field_order() {
        let s = stats(1, 2, 3, 4, 0x0102);
        let bytes = s.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[16], 3);
        assert_eq!(bytes[24], 4);
        assert_eq!(&bytes[32..34], &[0x02, 0x01]);
        assert_eq!(TimeStats::from_bytes(&bytes), s);
    }

    #[test]
    fn procdump_reads_the_table_while_it_is_held() {
        let k = null_kernel();
        let pid = k.user_init();
        let mut unlocked = String::new();
        k.procdump(&mut unlocked).unwrap();

        let table = k.lock_table();
        let mut held = String::new();
        k.procdump(&mut held).unwrap();
        assert!(k.holding_table());
        drop(table);

        assert_eq!(held, format!("{} runble initcode\n", pid));
        assert_eq!(held, unlocked);
    }

    #[test]
    fn averages_use_integer_division() {
        let batch = [stats(0, 10, 1, 1, 5), stats(0, 11, 2, 2, 6)];
        let avg = AverageTimes::of(&batch);
        assert_eq!(avg.turnaround_time, 10);
        assert_eq!(avg.burst_time, 5);
        assert_eq!(avg.waiting_time, 3);
        assert_eq!(AverageTimes::of(&[] as &[TimeStats]), AverageTimes::default());
    }
}
