// Process Control Block (PCB) for EMOS Microkernel
use alloc::string::String;
use core::fmt;

use crate::param::{NOFILE, NSYSCALL, PRIORITY_INIT};
use crate::platform::{ContextOf, Platform};
use crate::process::stats::TimeStats;

/// Process ID type. Zero is never handed out.
pub type ProcessId = u64;

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    Unused,   // Free slot
    Embryo,   // Being constructed
    Runnable, // Ready to run, waiting for CPU
    Running,  // Currently executing on some CPU
    Sleeping, // Waiting on a channel
    Zombie,   // Exited, waiting to be reaped
}

impl ProcessState {
    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_become(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Unused, Embryo)
                | (Embryo, Runnable)
                | (Embryo, Unused)
                | (Runnable, Running)
                | (Running, Runnable)
                | (Running, Sleeping)
                | (Running, Zombie)
                | (Sleeping, Runnable)
                | (Zombie, Unused)
        )
    }

    /// Fixed-width label used by the process dump.
    pub fn label(self) -> &'static str {
        match self {
            ProcessState::Unused => "unused",
            ProcessState::Embryo => "embryo",
            ProcessState::Runnable => "runble",
            ProcessState::Running => "run   ",
            ProcessState::Sleeping => "sleep ",
            ProcessState::Zombie => "zombie",
        }
    }
}

/// Rendezvous key between a sleeper and its waker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Wait on a process; parents sleep here for their children.
    Process(ProcessId),
    /// The timer tick counter.
    Ticks,
    /// Any kernel object, keyed by address.
    Address(usize),
}

impl Channel {
    /// Channel keyed by the address of `object`.
    pub fn of<T>(object: &T) -> Self {
        Channel::Address(object as *const T as usize)
    }
}

/// Index of a record in the process table.
///
/// Only meaningful while the table lock is held; never kept across a reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot(pub(crate) usize);

/// Process Control Block - one per table slot
pub struct Proc<P: Platform> {
    pub pid: ProcessId,
    state: ProcessState,
    pub parent: Option<ProcessId>,
    pub name: String,
    /// Base priority, fixed at creation
    pub priority: u32,
    /// Priority the priority policy selects on; grows by `priority` per pick
    pub changeable_priority: u32,
    /// Number of times this process has been dispatched
    pub time_slot: u64,
    pub times: TimeStats,
    /// Set on first dispatch; ready time only accrues after it
    pub first_cpu_acquired: bool,
    pub channel: Option<Channel>,
    pub killed: bool,
    pub context: ContextOf<P>,
    pub trap_frame: P::TrapFrame,
    pub kstack: Option<P::KernelStack>,
    pub space: Option<P::AddressSpace>,
    /// Size of the user address space in bytes
    pub size: usize,
    pub files: [Option<P::File>; NOFILE],
    pub cwd: Option<P::Dir>,
    pub syscall_counts: [u32; NSYSCALL],
}

impl<P: Platform> Proc<P> {
    pub fn new() -> Self {
        Self {
            pid: 0,
            state: ProcessState::Unused,
            parent: None,
            name: String::new(),
            priority: PRIORITY_INIT,
            changeable_priority: 0,
            time_slot: 0,
            times: TimeStats::default(),
            first_cpu_acquired: false,
            channel: None,
            killed: false,
            context: Default::default(),
            trap_frame: Default::default(),
            kstack: None,
            space: None,
            size: 0,
            files: core::array::from_fn(|_| None),
            cwd: None,
            syscall_counts: [0; NSYSCALL],
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Move along a state machine edge. An illegal edge is a kernel bug.
    pub(crate) fn set_state(&mut self, next: ProcessState) {
        if !self.state.can_become(next) {
            panic!(
                "pid {}: illegal transition {:?} -> {:?}",
                self.pid, self.state, next
            );
        }
        self.state = next;
    }

    /// Clear identity and bookkeeping of a record going back to `Unused`.
    ///
    /// Owned resources must already have been taken out.
    pub(crate) fn clear(&mut self) {
        self.set_state(ProcessState::Unused);
        self.pid = 0;
        self.parent = None;
        self.name.clear();
        self.killed = false;
        self.channel = None;
        self.size = 0;
    }

    pub fn is_live(&self) -> bool {
        self.state != ProcessState::Unused
    }
}

impl<P: Platform> Default for Proc<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// No free slot, kernel stack or memory
    ResourceExhausted,
    /// Unknown policy id, priority or size
    InvalidArgument,
    ProcessNotFound,
    /// The caller has nothing to wait for
    NoChildren,
    /// The caller was killed while blocked
    Killed,
    NoCurrentProcess,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::ResourceExhausted => write!(f, "Resource exhausted"),
            ProcessError::InvalidArgument => write!(f, "Invalid argument"),
            ProcessError::ProcessNotFound => write!(f, "Process not found"),
            ProcessError::NoChildren => write!(f, "No children"),
            ProcessError::Killed => write!(f, "Process killed"),
            ProcessError::NoCurrentProcess => write!(f, "No current process"),
        }
    }
}
