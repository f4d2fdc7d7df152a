// Process lifecycle for EMOS Microkernel: creation, fork, exit, wait, kill
use alloc::string::String;
use core::sync::atomic::Ordering;

use log::{debug, info, trace, warn};

use crate::kernel::Kernel;
use crate::param::{PRIORITY_INIT, PRIORITY_MAX, PRIORITY_MIN};
use crate::platform::{Platform, TrapFrame};
use crate::process::pcb::{Channel, Proc, ProcessError, ProcessId, ProcessState, Slot};
use crate::process::stats::TimeStats;
use crate::process::table::ProcessTable;

impl<P: Platform> ProcessTable<P> {
    /// Charge one tick to every live record according to its state.
    pub(crate) fn update_times(&mut self) {
        for (_, p) in self.iter_mut() {
            match p.state() {
                ProcessState::Running => p.times.running_time += 1,
                ProcessState::Sleeping => p.times.sleeping_time += 1,
                ProcessState::Runnable if p.first_cpu_acquired => p.times.ready_time += 1,
                ProcessState::Embryo => p.times.creation_time += 1,
                _ => {}
            }
        }
    }
}

fn exhausted(what: &str) -> ProcessError {
    warn!("fork: out of {}", what);
    ProcessError::ResourceExhausted
}

impl<P: Platform> Kernel<P> {
    /// Set up the first user process.
    ///
    /// Boot cannot continue without it, so any failure here panics.
    pub fn user_init(&self) -> ProcessId {
        let platform = self.platform();
        let mut table = self.lock_table();
        let Some(slot) = table.allocate(self.ticks()) else {
            panic!("userinit: no free process slot");
        };
        let Some(stack) = platform.alloc_kernel_stack() else {
            panic!("userinit: out of kernel stacks");
        };
        let Some((space, size)) = platform.init_address_space() else {
            panic!("userinit: out of memory");
        };

        let p = &mut table[slot];
        platform.init_context(&mut p.context, &stack);
        p.kstack = Some(stack);
        p.space = Some(space);
        p.size = size;
        platform.init_trap_frame(&mut p.trap_frame);
        p.name = String::from("initcode");
        p.cwd = Some(platform.root_dir());
        let pid = p.pid;
        self.init_pid.store(pid, Ordering::Release);
        p.set_state(ProcessState::Runnable);

        info!("init process created with pid {}", pid);
        pid
    }

    /// Create a new process copying the current one, with the default base
    /// priority.
    ///
    /// The child's system call returns 0; the parent gets the child's pid.
    pub fn fork(&self) -> Result<ProcessId, ProcessError> {
        self.fork_with_priority(PRIORITY_INIT)
    }

    /// [`fork`](Self::fork) with an explicit base priority.
    pub fn fork_with_priority(&self, priority: u32) -> Result<ProcessId, ProcessError> {
        if !(PRIORITY_MIN..PRIORITY_MAX).contains(&priority) {
            return Err(ProcessError::InvalidArgument);
        }
        let parent = self.current_slot().ok_or(ProcessError::NoCurrentProcess)?;
        let platform = self.platform();

        let mut table = self.lock_table();
        let child = table
            .allocate(self.ticks())
            .ok_or_else(|| exhausted("process slots"))?;
        let Some(stack) = platform.alloc_kernel_stack() else {
            table.release(child);
            return Err(exhausted("kernel stacks"));
        };

        let (p, c) = table.pair_mut(parent, child);
        let space = p
            .space
            .as_ref()
            .and_then(|space| platform.copy_address_space(space, p.size));
        let Some(space) = space else {
            platform.free_kernel_stack(stack);
            table.release(child);
            return Err(exhausted("memory"));
        };

        platform.init_context(&mut c.context, &stack);
        c.kstack = Some(stack);
        c.space = Some(space);
        c.size = p.size;
        c.priority = priority;
        c.trap_frame = p.trap_frame.clone();
        // Fork returns 0 in the child.
        c.trap_frame.set_return(0);
        for (to, from) in c.files.iter_mut().zip(p.files.iter()) {
            *to = from.as_ref().map(|f| platform.dup_file(f));
        }
        c.cwd = p.cwd.as_ref().map(|d| platform.dup_dir(d));
        c.name = p.name.clone();
        c.parent = Some(p.pid);
        c.set_state(ProcessState::Runnable);

        debug!("fork: pid {} -> pid {} (priority {})", p.pid, c.pid, priority);
        Ok(c.pid)
    }

    /// Exit the current process. Does not return.
    ///
    /// The process stays a Zombie until its parent calls `wait`.
    pub fn exit(&self) -> ! {
        let platform = self.platform();
        let Some(slot) = self.current_slot() else {
            panic!("exit without a process");
        };

        let (files, cwd) = {
            let mut table = self.lock_table();
            let p = &mut table[slot];
            if Some(p.pid) == self.init_pid() {
                panic!("init exiting");
            }
            p.syscall_counts.fill(0);
            (
                core::mem::replace(&mut p.files, core::array::from_fn(|_| None)),
                p.cwd.take(),
            )
        };
        // Closing may sleep, so it happens with the table unlocked.
        for file in files.into_iter().flatten() {
            platform.close_file(file);
        }
        if let Some(dir) = cwd {
            platform.release_dir(dir);
        }

        let mut table = self.lock_table();
        let me = table[slot].pid;

        // Parent might be sleeping in wait().
        if let Some(parent) = table[slot].parent {
            self.wakeup_locked(&mut table, Channel::Process(parent));
        }

        // Pass abandoned children to init.
        let init = self.init_pid();
        let mut zombie_orphan = false;
        for (_, p) in table.iter_mut() {
            if p.is_live() && p.parent == Some(me) {
                p.parent = init;
                zombie_orphan |= p.state() == ProcessState::Zombie;
            }
        }
        if let (true, Some(init)) = (zombie_orphan, init) {
            self.wakeup_locked(&mut table, Channel::Process(init));
        }

        let p = &mut table[slot];
        p.times.termination_time = self.ticks();
        p.set_state(ProcessState::Zombie);
        debug!("exit: pid {}", me);

        let _table = self.sched(table);
        panic!("zombie exit");
    }

    /// Wait for a child process to exit and return its pid.
    pub fn wait(&self) -> Result<ProcessId, ProcessError> {
        self.wait_with_stats().map(|(pid, _)| pid)
    }

    /// Wait for a child process to exit. Returns its pid together with the
    /// timing counters it accumulated.
    pub fn wait_with_stats(&self) -> Result<(ProcessId, TimeStats), ProcessError> {
        let slot = self.current_slot().ok_or(ProcessError::NoCurrentProcess)?;
        let mut table = self.lock_table();
        let me = table[slot].pid;
        loop {
            // Scan through table looking for exited children.
            let mut have_kids = false;
            let mut zombie = None;
            for (s, p) in table.iter() {
                if !p.is_live() || p.parent != Some(me) {
                    continue;
                }
                have_kids = true;
                if p.state() == ProcessState::Zombie {
                    zombie = Some(s);
                    break;
                }
            }
            if let Some(child) = zombie {
                return Ok(self.reap(&mut table, child));
            }

            if !have_kids {
                return Err(ProcessError::NoChildren);
            }
            if table[slot].killed {
                return Err(ProcessError::Killed);
            }

            // Wait for children to exit. (See wakeup in exit.)
            table = self.sleep_locked(Channel::Process(me), table);
        }
    }

    fn reap(&self, table: &mut ProcessTable<P>, child: Slot) -> (ProcessId, TimeStats) {
        let platform = self.platform();
        let c = &mut table[child];
        let pid = c.pid;
        let times = c.times;
        if let Some(stack) = c.kstack.take() {
            platform.free_kernel_stack(stack);
        }
        if let Some(space) = c.space.take() {
            platform.free_address_space(space, c.size);
        }
        c.clear();
        debug!("reaped pid {}", pid);
        (pid, times)
    }

    /// Kill the process with the given pid.
    ///
    /// The victim won't exit until it next checks `killed`, typically on its
    /// way back to user space. A sleeping victim is made runnable for that.
    pub fn kill(&self, pid: ProcessId) -> Result<(), ProcessError> {
        let mut table = self.lock_table();
        let slot = table.find_by_pid(pid).ok_or(ProcessError::ProcessNotFound)?;
        let p = &mut table[slot];
        p.killed = true;
        if p.state() == ProcessState::Sleeping {
            p.set_state(ProcessState::Runnable);
        }
        debug!("kill: pid {}", pid);
        Ok(())
    }

    /// Timer interrupt: advance the clock, charge the tick, wake tick sleepers.
    pub fn clock_tick(&self) {
        let mut table = self.lock_table();
        self.advance_ticks();
        table.update_times();
        self.wakeup_locked(&mut table, Channel::Ticks);
    }

    /// Sleep the current process for `n` ticks.
    pub fn sleep_ticks(&self, n: u64) -> Result<(), ProcessError> {
        let slot = self.current_slot().ok_or(ProcessError::NoCurrentProcess)?;
        let mut table = self.lock_table();
        let start = self.ticks();
        while self.ticks() - start < n {
            if table[slot].killed {
                return Err(ProcessError::Killed);
            }
            table = self.sleep_locked(Channel::Ticks, table);
        }
        Ok(())
    }

    /// Ticks since boot.
    pub fn uptime(&self) -> u64 {
        self.ticks()
    }

    /// Grow or shrink the current process's memory by `n` bytes.
    /// Returns the previous size.
    pub fn grow_memory(&self, n: isize) -> Result<usize, ProcessError> {
        let platform = self.platform();
        let slot = self.current_slot().ok_or(ProcessError::NoCurrentProcess)?;
        let mut table = self.lock_table();
        let p = &mut table[slot];
        let old = p.size;
        let space = p.space.as_mut().ok_or(ProcessError::NoCurrentProcess)?;

        let size = if n > 0 {
            let target = old
                .checked_add(n.unsigned_abs())
                .ok_or(ProcessError::InvalidArgument)?;
            platform
                .grow_address_space(space, old, target)
                .ok_or(ProcessError::ResourceExhausted)?
        } else if n < 0 {
            let target = old
                .checked_sub(n.unsigned_abs())
                .ok_or(ProcessError::InvalidArgument)?;
            platform
                .shrink_address_space(space, old, target)
                .ok_or(ProcessError::ResourceExhausted)?
        } else {
            old
        };
        p.size = size;

        if let (Some(space), Some(stack)) = (&p.space, &p.kstack) {
            platform.activate_user(space, stack);
        }
        Ok(old)
    }

    /// Run `f` on the current process's record with the table locked.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Proc<P>) -> R) -> Result<R, ProcessError> {
        let slot = self.current_slot().ok_or(ProcessError::NoCurrentProcess)?;
        let mut table = self.lock_table();
        Ok(f(&mut table[slot]))
    }

    /// Pid of the process running on this CPU.
    pub fn current_pid(&self) -> Option<ProcessId> {
        self.with_current(|p| p.pid).ok()
    }

    /// Whether the current process has a pending kill.
    pub fn killed(&self) -> bool {
        self.with_current(|p| p.killed).unwrap_or(false)
    }

    /// Count one invocation of system call `num` by the current process.
    pub fn count_syscall(&self, num: usize) {
        let counted = self.with_current(|p| {
            if let Some(count) = p.syscall_counts.get_mut(num) {
                *count += 1;
            }
        });
        if let Err(err) = counted {
            trace!("syscall {} not counted: {}", num, err);
        }
    }

    /// Invocations of system call `num` by the current process since it
    /// started.
    pub fn syscall_count(&self, num: usize) -> Result<u32, ProcessError> {
        self.with_current(|p| p.syscall_counts.get(num).copied())?
            .ok_or(ProcessError::InvalidArgument)
    }
}
