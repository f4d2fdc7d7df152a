// Collaborator interfaces for the EMOS process subsystem
//
// Everything the process subsystem needs from the rest of the kernel goes
// through these two traits: the CPU side (`Arch`) and the memory/file side
// (`Platform`). Implementations must never call back into the process table
// from inside these methods.

/// CPU-level primitives.
pub trait Arch: Sync {
    /// Saved callee registers of a kernel thread.
    type Context: Default + Send;

    /// Index of the executing CPU in `0..NCPU`.
    ///
    /// Only meaningful with interrupts disabled.
    fn cpu_id(&self) -> usize;

    fn interrupts_enabled(&self) -> bool;
    fn enable_interrupts(&self);
    fn disable_interrupts(&self);

    /// Save the running kernel thread into `old` and resume `new`.
    ///
    /// Returns when some other thread switches back into `old`.
    ///
    /// # Safety
    /// Both pointers must be valid for the duration of the switch and `new`
    /// must hold a context produced by a previous switch or by
    /// [`Platform::init_context`]. Must not be re-entered on the same CPU.
    unsafe fn switch(&self, old: *mut Self::Context, new: *const Self::Context);

    /// Collect return addresses of a suspended context into `pcs`.
    /// Returns how many were written.
    fn backtrace(&self, _context: &Self::Context, _pcs: &mut [usize]) -> usize {
        0
    }

    /// Called by an idle dispatch loop that found nothing to run.
    fn idle(&self) {
        core::hint::spin_loop();
    }
}

/// Saved user registers of a process.
pub trait TrapFrame: Clone + Default + Send {
    /// Set the value a system call returns to user mode.
    fn set_return(&mut self, value: usize);
}

/// Memory, file and user-copy services consumed by the process subsystem.
///
/// Methods that may be called with the process table locked must not block:
/// kernel stack and address-space operations, `dup_file`, `dup_dir`,
/// `root_dir` and `copy_out`. `close_file` and `release_dir` are always called
/// with the table unlocked and may sleep.
pub trait Platform: Sync {
    type Arch: Arch;
    type TrapFrame: TrapFrame;
    type KernelStack: Send;
    type AddressSpace: Send;
    type File: Send;
    type Dir: Send;

    fn arch(&self) -> &Self::Arch;

    fn alloc_kernel_stack(&self) -> Option<Self::KernelStack>;
    fn free_kernel_stack(&self, stack: Self::KernelStack);

    /// Prepare `context` so that the first switch into it runs
    /// [`Kernel::fork_return`](crate::Kernel::fork_return) on `stack` and then
    /// returns to user mode with the process's trap frame.
    fn init_context(
        &self,
        context: &mut <Self::Arch as Arch>::Context,
        stack: &Self::KernelStack,
    );

    /// Build the address space of the first process. Returns it with its size.
    fn init_address_space(&self) -> Option<(Self::AddressSpace, usize)>;

    /// Initial user registers of the first process.
    fn init_trap_frame(&self, frame: &mut Self::TrapFrame);

    fn copy_address_space(
        &self,
        parent: &Self::AddressSpace,
        size: usize,
    ) -> Option<Self::AddressSpace>;

    /// Grow `space` from `old_size` to `new_size`. Returns the new size.
    fn grow_address_space(
        &self,
        space: &mut Self::AddressSpace,
        old_size: usize,
        new_size: usize,
    ) -> Option<usize>;

    /// Shrink `space` from `old_size` to `new_size`. Returns the new size.
    fn shrink_address_space(
        &self,
        space: &mut Self::AddressSpace,
        old_size: usize,
        new_size: usize,
    ) -> Option<usize>;

    fn free_address_space(&self, space: Self::AddressSpace, size: usize);

    /// Load `space` and the task's kernel stack before entering a process.
    fn activate_user(&self, space: &Self::AddressSpace, stack: &Self::KernelStack);

    /// Load the kernel-only address space.
    fn activate_kernel(&self);

    fn dup_file(&self, file: &Self::File) -> Self::File;
    fn close_file(&self, file: Self::File);

    fn root_dir(&self) -> Self::Dir;
    fn dup_dir(&self, dir: &Self::Dir) -> Self::Dir;
    fn release_dir(&self, dir: Self::Dir);

    /// Copy `bytes` into `space` at user address `addr`.
    fn copy_out(&self, space: &Self::AddressSpace, addr: usize, bytes: &[u8]) -> bool;
}

/// Saved kernel registers type of a platform.
pub type ContextOf<P> = <<P as Platform>::Arch as Arch>::Context;
