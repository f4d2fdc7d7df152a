// Sleep and wakeup for EMOS Microkernel
use spin::{Mutex, MutexGuard};

use crate::kernel::{Kernel, TableGuard};
use crate::platform::Platform;
use crate::process::pcb::{Channel, ProcessState};
use crate::process::table::ProcessTable;

impl<P: Platform> Kernel<P> {
    /// Atomically release `lock` and sleep on `channel`. Reacquires `lock`
    /// when awakened.
    ///
    /// Wakeups are broadcast, so callers re-check their condition in a loop.
    pub fn sleep<'l, T>(
        &self,
        channel: Channel,
        lock: &'l Mutex<T>,
        guard: MutexGuard<'l, T>,
    ) -> MutexGuard<'l, T> {
        // Once the table lock is held no wakeup can be missed: wakeup runs
        // with the table locked, so it is safe to release `lock`.
        let table = self.lock_table();
        drop(guard);

        let table = self.sleep_locked(channel, table);

        drop(table);
        lock.lock()
    }

    /// Sleep on `channel` when the condition is protected by the table lock
    /// itself.
    pub fn sleep_locked<'a>(
        &'a self,
        channel: Channel,
        mut table: TableGuard<'a, P>,
    ) -> TableGuard<'a, P> {
        let Some(slot) = self.current_slot() else {
            panic!("sleep without a process");
        };
        let p = &mut table[slot];
        p.channel = Some(channel);
        p.set_state(ProcessState::Sleeping);

        let mut table = self.sched(table);

        // Tidy up.
        table[slot].channel = None;
        table
    }

    /// Wake up all processes sleeping on `channel`.
    pub fn wakeup(&self, channel: Channel) {
        let mut table = self.lock_table();
        self.wakeup_locked(&mut table, channel);
    }

    /// [`wakeup`](Self::wakeup) for callers already holding the table lock.
    pub fn wakeup_locked(&self, table: &mut ProcessTable<P>, channel: Channel) {
        for (_, p) in table.iter_mut() {
            if p.state() == ProcessState::Sleeping && p.channel == Some(channel) {
                p.set_state(ProcessState::Runnable);
            }
        }
    }
}
