// src/syscalls.rs
use core::fmt;

use log::debug;

use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::process::pcb::{ProcessError, ProcessId};
use crate::process::stats::TimeStats;

/// System call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    GetPid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    ChangePolicy = 22,
    WaitForChild = 23,
    GetChildren = 24,
    GetCount = 25,
}

impl SyscallNumber {
    pub fn from_u64(num: u64) -> Option<Self> {
        Some(match num {
            1 => SyscallNumber::Fork,
            2 => SyscallNumber::Exit,
            3 => SyscallNumber::Wait,
            6 => SyscallNumber::Kill,
            11 => SyscallNumber::GetPid,
            12 => SyscallNumber::Sbrk,
            13 => SyscallNumber::Sleep,
            14 => SyscallNumber::Uptime,
            22 => SyscallNumber::ChangePolicy,
            23 => SyscallNumber::WaitForChild,
            24 => SyscallNumber::GetChildren,
            25 => SyscallNumber::GetCount,
            _ => return None,
        })
    }
}

/// System call arguments (up to 6 arguments in x86_64)
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub arg0: u64,  // rdi
    pub arg1: u64,  // rsi
    pub arg2: u64,  // rdx
    pub arg3: u64,  // r10
    pub arg4: u64,  // r8
    pub arg5: u64,  // r9
}

/// System call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Success(u64),
    Error(SyscallError),
}

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall,
    InvalidArgument,
    OutOfMemory,
    ProcessNotFound,
    NoChildren,
    Interrupted,
    BadAddress,
    NoCurrentProcess,
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallError::InvalidSyscall => write!(f, "Invalid syscall number"),
            SyscallError::InvalidArgument => write!(f, "Invalid argument"),
            SyscallError::OutOfMemory => write!(f, "Out of memory"),
            SyscallError::ProcessNotFound => write!(f, "Process not found"),
            SyscallError::NoChildren => write!(f, "No child processes"),
            SyscallError::Interrupted => write!(f, "Interrupted by kill"),
            SyscallError::BadAddress => write!(f, "Bad user address"),
            SyscallError::NoCurrentProcess => write!(f, "No current process"),
        }
    }
}

impl From<ProcessError> for SyscallError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::ResourceExhausted => SyscallError::OutOfMemory,
            ProcessError::InvalidArgument => SyscallError::InvalidArgument,
            ProcessError::ProcessNotFound => SyscallError::ProcessNotFound,
            ProcessError::NoChildren => SyscallError::NoChildren,
            ProcessError::Killed => SyscallError::Interrupted,
            ProcessError::NoCurrentProcess => SyscallError::NoCurrentProcess,
        }
    }
}

impl From<Result<u64, SyscallError>> for SyscallResult {
    fn from(result: Result<u64, SyscallError>) -> Self {
        match result {
            Ok(value) => SyscallResult::Success(value),
            Err(err) => SyscallResult::Error(err),
        }
    }
}

/// Convert syscall result to u64 for return value
impl From<SyscallResult> for u64 {
    fn from(result: SyscallResult) -> u64 {
        match result {
            SyscallResult::Success(value) => value,
            SyscallResult::Error(err) => {
                // Use high bit to indicate error
                0x8000_0000_0000_0000 | (err as u64)
            }
        }
    }
}

/// Handle a system call made by the current process
pub fn handle_syscall<P: Platform>(kernel: &Kernel<P>, syscall_num: u64, args: SyscallArgs) -> SyscallResult {
    let Some(num) = SyscallNumber::from_u64(syscall_num) else {
        debug!("unknown syscall {}", syscall_num);
        return SyscallResult::Error(SyscallError::InvalidSyscall);
    };
    kernel.count_syscall(num as usize);

    let result = match num {
        SyscallNumber::Fork => sys_fork(kernel),
        SyscallNumber::Exit => kernel.exit(),
        SyscallNumber::Wait => sys_wait(kernel),
        SyscallNumber::Kill => sys_kill(kernel, args),
        SyscallNumber::GetPid => sys_getpid(kernel),
        SyscallNumber::Sbrk => sys_sbrk(kernel, args),
        SyscallNumber::Sleep => sys_sleep(kernel, args),
        SyscallNumber::Uptime => Ok(kernel.uptime()),
        SyscallNumber::ChangePolicy => sys_change_policy(kernel, args),
        SyscallNumber::WaitForChild => sys_wait_for_child(kernel, args),
        SyscallNumber::GetChildren => sys_get_children(kernel, args),
        SyscallNumber::GetCount => sys_get_count(kernel, args),
    };
    result.into()
}

fn copy_to_user<P: Platform>(kernel: &Kernel<P>, addr: u64, bytes: &[u8]) -> Result<(), SyscallError> {
    let platform = kernel.platform();
    let copied = kernel.with_current(|p| match &p.space {
        Some(space) => platform.copy_out(space, addr as usize, bytes),
        None => false,
    })?;
    if copied {
        Ok(())
    } else {
        Err(SyscallError::BadAddress)
    }
}

fn sys_fork<P: Platform>(kernel: &Kernel<P>) -> Result<u64, SyscallError> {
    Ok(kernel.fork()?)
}

fn sys_wait<P: Platform>(kernel: &Kernel<P>) -> Result<u64, SyscallError> {
    Ok(kernel.wait()?)
}

fn sys_kill<P: Platform>(kernel: &Kernel<P>, args: SyscallArgs) -> Result<u64, SyscallError> {
    kernel.kill(args.arg0 as ProcessId)?;
    Ok(0)
}

fn sys_getpid<P: Platform>(kernel: &Kernel<P>) -> Result<u64, SyscallError> {
    kernel.current_pid().ok_or(SyscallError::NoCurrentProcess)
}

fn sys_sbrk<P: Platform>(kernel: &Kernel<P>, args: SyscallArgs) -> Result<u64, SyscallError> {
    let old = kernel.grow_memory(args.arg0 as i64 as isize)?;
    Ok(old as u64)
}

fn sys_sleep<P: Platform>(kernel: &Kernel<P>, args: SyscallArgs) -> Result<u64, SyscallError> {
    kernel.sleep_ticks(args.arg0)?;
    Ok(0)
}

fn sys_change_policy<P: Platform>(kernel: &Kernel<P>, args: SyscallArgs) -> Result<u64, SyscallError> {
    kernel.set_policy(args.arg0)?;
    Ok(0)
}

/// arg0: address of a `TimeStats` record, zeroed when there is nothing to reap.
fn sys_wait_for_child<P: Platform>(kernel: &Kernel<P>, args: SyscallArgs) -> Result<u64, SyscallError> {
    match kernel.wait_with_stats() {
        Ok((pid, times)) => {
            copy_to_user(kernel, args.arg0, &times.to_bytes())?;
            Ok(pid)
        }
        Err(err) => {
            copy_to_user(kernel, args.arg0, &TimeStats::default().to_bytes())?;
            Err(err.into())
        }
    }
}

/// arg0: address of a `u64` array, arg1: its capacity. Returns the number of
/// children, which may exceed the capacity.
fn sys_get_children<P: Platform>(kernel: &Kernel<P>, args: SyscallArgs) -> Result<u64, SyscallError> {
    let me = kernel.current_pid().ok_or(SyscallError::NoCurrentProcess)?;
    let children = kernel.list_children(me);
    let mut addr = args.arg0;
    for pid in children.iter().take(args.arg1 as usize) {
        copy_to_user(kernel, addr, &pid.to_le_bytes())?;
        addr += 8;
    }
    Ok(children.len() as u64)
}

fn sys_get_count<P: Platform>(kernel: &Kernel<P>, args: SyscallArgs) -> Result<u64, SyscallError> {
    let count = kernel.syscall_count(args.arg0 as usize)?;
    Ok(count as u64)
}
