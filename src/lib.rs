//! Process table, lifecycle and CPU scheduler of the EMOS kernel.
//!
//! The embedding kernel supplies memory, file and CPU services through
//! [`Platform`] and runs [`Kernel::scheduler`] on every CPU.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod kernel;
pub mod param;
pub mod platform;
pub mod process;
pub mod syscalls;

pub use kernel::{Kernel, TableGuard};
pub use platform::{Arch, ContextOf, Platform, TrapFrame};
pub use process::{
    AverageTimes, Channel, ProcessError, ProcessId, ProcessInfo, ProcessState, SchedPolicy,
    TimeStats,
};
