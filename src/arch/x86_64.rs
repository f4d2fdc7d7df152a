// x86_64 backend: context switch and CPU identification
use core::arch::x86_64::__cpuid;
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use ::x86_64::instructions::{self, interrupts};
use ::x86_64::VirtAddr;

use crate::param::NCPU;
use crate::platform::Arch;

const UNREGISTERED: u32 = u32::MAX;

lazy_static! {
    /// Local APIC id of every registered CPU, indexed by CPU number
    static ref APIC_IDS: [AtomicU32; NCPU] = core::array::from_fn(|_| AtomicU32::new(UNREGISTERED));
}

/// Saved callee registers of a suspended kernel thread.
///
/// The return address of the thread sits on top of its stack at `rsp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
}

impl Context {
    /// Context that starts executing `entry` on the stack ending at
    /// `stack_top`.
    ///
    /// `entry` must never return.
    ///
    /// # Safety
    /// `stack_top` must be the end of a writable stack of at least 16 bytes.
    pub unsafe fn prepare(stack_top: *mut u8, entry: usize) -> Self {
        let top = (stack_top as usize) & !0xf;
        // swtch's `ret` pops the entry address, leaving rsp 8 below a 16-byte
        // boundary as the call ABI expects.
        let rsp = top - 16;
        unsafe { (rsp as *mut u64).write(entry as u64) };
        Context {
            rsp: rsp as u64,
            ..Context::default()
        }
    }
}

/// Save the current callee registers into `old` and load them from `new`.
#[unsafe(naked)]
unsafe extern "C" fn swtch(old: *mut Context, new: *const Context) {
    core::arch::naked_asm!(
        // rdi = old, rsi = new
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], r15",
        "mov [rdi + 0x10], r14",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], rbx",
        "mov [rdi + 0x30], rbp",
        "mov rsp, [rsi + 0x00]",
        "mov r15, [rsi + 0x08]",
        "mov r14, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov rbx, [rsi + 0x28]",
        "mov rbp, [rsi + 0x30]",
        "ret",
    );
}

/// Local APIC id of the executing CPU
#[allow(unused_unsafe)]
fn apic_id() -> u32 {
    let info = unsafe { __cpuid(1) };
    info.ebx >> 24
}

/// Walk saved frame pointers starting at `rbp`.
///
/// # Safety
/// Every frame reached must be readable; frames are assumed laid out as
/// `[saved rbp, return address]`.
pub unsafe fn walk_frames(mut rbp: u64, pcs: &mut [usize]) -> usize {
    let mut n = 0;
    while n < pcs.len() {
        if rbp == 0 || rbp % 8 != 0 || VirtAddr::try_new(rbp).is_err() {
            break;
        }
        let frame = rbp as *const u64;
        let pc = unsafe { frame.add(1).read() };
        if pc == 0 {
            break;
        }
        pcs[n] = pc as usize;
        n += 1;
        rbp = unsafe { frame.read() };
    }
    n
}

/// The x86_64 CPU.
#[derive(Debug, Default)]
pub struct X86_64;

impl X86_64 {
    /// Record the executing CPU as number `index`. Called once per CPU
    /// during bring-up, before its first `cpu_id`.
    pub fn register_cpu(&self, index: usize) {
        match APIC_IDS.get(index) {
            Some(slot) => slot.store(apic_id(), Ordering::Release),
            None => panic!("cpu index {} out of range", index),
        }
    }
}

impl Arch for X86_64 {
    type Context = Context;

    fn cpu_id(&self) -> usize {
        let apic = apic_id();
        // APIC ids are not guaranteed to be contiguous, so translate.
        match APIC_IDS.iter().position(|id| id.load(Ordering::Acquire) == apic) {
            Some(index) => index,
            None => panic!("unknown apicid {}", apic),
        }
    }

    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    unsafe fn switch(&self, old: *mut Context, new: *const Context) {
        unsafe { swtch(old, new) };
    }

    fn backtrace(&self, context: &Context, pcs: &mut [usize]) -> usize {
        // SAFETY: a suspended kernel thread's frame chain lives on its own
        // kernel stack, which stays mapped while the context exists.
        unsafe { walk_frames(context.rbp, pcs) }
    }

    fn idle(&self) {
        instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn prepared_context_returns_into_entry() {
        let mut stack = vec![0u64; 64];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) } as *mut u8;
        let ctx = unsafe { Context::prepare(top, 0xdead_beef) };
        assert_eq!(ctx.rsp % 16, 0);
        assert_eq!(ctx.rsp, (top as u64 & !0xf) - 16);
        assert_eq!(unsafe { (ctx.rsp as *const u64).read() }, 0xdead_beef);
        assert_eq!(ctx.rbp, 0);
    }

    #[test]
    fn frame_walk_follows_saved_rbp_chain() {
        // Three frames: [saved rbp, return address] pairs.
        let mut frames = vec![0u64; 6];
        let base = frames.as_mut_ptr() as u64;
        frames[0] = base + 16;
        frames[1] = 0x1000;
        frames[2] = base + 32;
        frames[3] = 0x2000;
        frames[4] = 0;
        frames[5] = 0x3000;

        let mut pcs = [0usize; 8];
        let n = unsafe { walk_frames(base, &mut pcs) };
        assert_eq!(&pcs[..n], &[0x1000, 0x2000, 0x3000]);

        let mut short = [0usize; 2];
        assert_eq!(unsafe { walk_frames(base, &mut short) }, 2);
    }

    #[test]
    fn frame_walk_stops_on_null_or_misaligned_frames() {
        let mut pcs = [0usize; 4];
        assert_eq!(unsafe { walk_frames(0, &mut pcs) }, 0);
        assert_eq!(unsafe { walk_frames(0x1003, &mut pcs) }, 0);
        assert_eq!(X86_64.backtrace(&Context::default(), &mut pcs), 0);
    }
}
