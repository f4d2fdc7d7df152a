// Kernel parameters for the EMOS process subsystem
use crate::process::scheduler::SchedPolicy;

/// Maximum number of processes
pub const NPROC: usize = 64;

/// Maximum number of CPUs
pub const NCPU: usize = 8;

/// Open files per process
pub const NOFILE: usize = 16;

/// Number of syscall counters kept per process
pub const NSYSCALL: usize = 32;

/// Running ticks after which the quantum policy gives up the CPU on yield
pub const QUANTUM: u64 = 10;

/// Base priority given to every new process
pub const PRIORITY_INIT: u32 = 10;

/// Smallest base priority a process may be created with
pub const PRIORITY_MIN: u32 = 1;

/// Sentinel returned when no process is runnable; never a valid base priority
pub const PRIORITY_MAX: u32 = u32::MAX;

/// Scheduling priority of a new process when nothing is runnable
pub const PRIORITY_FALLBACK: u32 = PRIORITY_INIT;

/// Policy selected at boot
pub const DEFAULT_POLICY: SchedPolicy = SchedPolicy::RoundRobin;

/// Return-address slots collected per sleeping process in the debug dump
pub const NBACKTRACE: usize = 10;
