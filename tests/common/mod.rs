//! Simulated machine for integration tests.
//!
//! Every kernel context (a CPU's dispatch loop or a process) is a host thread.
//! A context switch hands a baton carrying the CPU number to the target
//! thread and parks the current one until it is handed the baton again, so
//! exactly one thread runs per simulated CPU and the real kernel code,
//! including the table lock hand-off across switches, is exercised.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use emos_proc::param::NCPU;
use emos_proc::{
    Arch, Channel, Kernel, Platform, ProcessId, ProcessState, SchedPolicy, TrapFrame,
};

/// How long a dispatch loop waits for a process to give its CPU back.
const STALL: Duration = Duration::from_secs(30);
const MAX_PASSES: usize = 1_000_000;

pub type K = &'static Kernel<Sim>;
pub type Program = Arc<dyn Fn(K, &SimFrame) + Send + Sync>;

#[derive(Default)]
struct Baton {
    cpu: Mutex<Option<usize>>,
    cv: Condvar,
}

impl Baton {
    fn give(&self, cpu: usize) {
        *self.cpu.lock().unwrap() = Some(cpu);
        self.cv.notify_one();
    }

    fn wait(&self, driver: bool) -> usize {
        let mut held = self.cpu.lock().unwrap();
        loop {
            if let Some(cpu) = held.take() {
                return cpu;
            }
            if driver {
                let (next, timeout) = self.cv.wait_timeout(held, STALL).unwrap();
                if timeout.timed_out() && next.is_none() {
                    panic!("simulation stalled");
                }
                held = next;
            } else {
                held = self.cv.wait(held).unwrap();
            }
        }
    }
}

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(usize::MAX) };
    static DRIVER: Cell<bool> = const { Cell::new(false) };
    static BATON: RefCell<Option<Arc<Baton>>> = const { RefCell::new(None) };
}

fn my_baton() -> Arc<Baton> {
    BATON.with(|b| {
        b.borrow_mut()
            .get_or_insert_with(|| Arc::new(Baton::default()))
            .clone()
    })
}

fn on_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
    DRIVER.with(|d| d.set(true));
}

#[derive(Default)]
pub struct SimContext {
    baton: Option<Arc<Baton>>,
}

pub struct SimArch {
    interrupts: [AtomicBool; NCPU],
}

impl Arch for SimArch {
    type Context = SimContext;

    fn cpu_id(&self) -> usize {
        let cpu = CPU.with(Cell::get);
        assert!(cpu < NCPU, "thread is not running on a cpu");
        cpu
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts[self.cpu_id()].load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.interrupts[self.cpu_id()].store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&self) {
        self.interrupts[self.cpu_id()].store(false, Ordering::SeqCst);
    }

    unsafe fn switch(&self, old: *mut SimContext, new: *const SimContext) {
        let cpu = self.cpu_id();
        let me = my_baton();
        let next = unsafe { (*new).baton.clone() }.expect("switch into an empty context");
        unsafe { (*old).baton = Some(me.clone()) };
        next.give(cpu);
        let cpu = me.wait(DRIVER.with(Cell::get));
        CPU.with(|c| c.set(cpu));
    }
}

/// User registers: which registered program to run, and the syscall return.
#[derive(Debug, Clone, Default)]
pub struct SimFrame {
    pub rip: usize,
    pub ret: usize,
}

impl TrapFrame for SimFrame {
    fn set_return(&mut self, value: usize) {
        self.ret = value;
    }
}

#[derive(Debug)]
pub struct SimStack(u64);

#[derive(Debug)]
pub struct SimSpace {
    pub id: u64,
}

#[derive(Debug)]
pub struct SimFile(u64);

#[derive(Debug)]
pub struct SimDir(u64);

pub struct Sim {
    arch: SimArch,
    kernel: OnceLock<K>,
    programs: Mutex<Vec<Program>>,
    memory: Mutex<HashMap<(u64, usize), u8>>,
    next_id: AtomicU64,
    pub stacks: AtomicUsize,
    pub spaces: AtomicUsize,
    pub files: AtomicUsize,
    pub dirs: AtomicUsize,
    pub fail_stack: AtomicBool,
    pub fail_copy: AtomicBool,
    pub done: AtomicBool,
}

impl Sim {
    fn new() -> Self {
        Sim {
            arch: SimArch {
                interrupts: std::array::from_fn(|_| AtomicBool::new(false)),
            },
            kernel: OnceLock::new(),
            programs: Mutex::new(Vec::new()),
            memory: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stacks: AtomicUsize::new(0),
            spaces: AtomicUsize::new(0),
            files: AtomicUsize::new(0),
            dirs: AtomicUsize::new(0),
            fail_stack: AtomicBool::new(false),
            fail_copy: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Build a kernel whose init process runs `init`. The calling thread
    /// becomes CPU 0.
    pub fn boot(policy: SchedPolicy, init: impl Fn(K, &SimFrame) + Send + Sync + 'static) -> K {
        let _ = env_logger::builder().is_test(true).try_init();
        let sim = Sim::new();
        sim.programs.lock().unwrap().push(Arc::new(init));
        let k: K = Box::leak(Box::new(Kernel::with_policy(sim, policy)));
        let _ = k.platform().kernel.set(k);
        on_cpu(0);
        k.user_init();
        k
    }

    /// Register a program for forked children. Returns its entry point.
    pub fn program(&self, f: impl Fn(K, &SimFrame) + Send + Sync + 'static) -> usize {
        let mut programs = self.programs.lock().unwrap();
        programs.push(Arc::new(f));
        programs.len() - 1
    }

    /// Bytes of user memory of `space` written through `copy_out`.
    pub fn peek(&self, space: u64, addr: usize, len: usize) -> Vec<u8> {
        let memory = self.memory.lock().unwrap();
        (addr..addr + len)
            .map(|a| memory.get(&(space, a)).copied().unwrap_or(0xAA))
            .collect()
    }

    /// Open a new file handle, as the file layer would for `open`.
    pub fn open_file(&self) -> SimFile {
        self.files.fetch_add(1, Ordering::SeqCst);
        SimFile(self.id())
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn process_main(sim: &'static Sim, baton: Arc<Baton>) {
    let cpu = baton.wait(false);
    CPU.with(|c| c.set(cpu));
    BATON.with(|b| *b.borrow_mut() = Some(baton));
    let k = *sim.kernel.get().expect("kernel not booted");

    k.fork_return();
    let frame = k
        .with_current(|p| p.trap_frame.clone())
        .expect("process thread without a process");
    let program = sim.programs.lock().unwrap()[frame.rip].clone();
    program(k, &frame);
    k.exit();
}

impl Platform for Sim {
    type Arch = SimArch;
    type TrapFrame = SimFrame;
    type KernelStack = SimStack;
    type AddressSpace = SimSpace;
    type File = SimFile;
    type Dir = SimDir;

    fn arch(&self) -> &SimArch {
        &self.arch
    }

    fn alloc_kernel_stack(&self) -> Option<SimStack> {
        if self.fail_stack.load(Ordering::SeqCst) {
            return None;
        }
        self.stacks.fetch_add(1, Ordering::SeqCst);
        Some(SimStack(self.id()))
    }

    fn free_kernel_stack(&self, _stack: SimStack) {
        self.stacks.fetch_sub(1, Ordering::SeqCst);
    }

    fn init_context(&self, context: &mut SimContext, _stack: &SimStack) {
        let baton = Arc::new(Baton::default());
        context.baton = Some(baton.clone());
        // SAFETY: the kernel owning this platform is leaked in `boot`.
        let sim: &'static Sim = unsafe { &*(self as *const Sim) };
        thread::Builder::new()
            .stack_size(512 * 1024)
            .spawn(move || process_main(sim, baton))
            .expect("spawn process thread");
    }

    fn init_address_space(&self) -> Option<(SimSpace, usize)> {
        self.spaces.fetch_add(1, Ordering::SeqCst);
        Some((SimSpace { id: self.id() }, 4096))
    }

    fn init_trap_frame(&self, frame: &mut SimFrame) {
        frame.rip = 0;
    }

    fn copy_address_space(&self, _parent: &SimSpace, _size: usize) -> Option<SimSpace> {
        if self.fail_copy.load(Ordering::SeqCst) {
            return None;
        }
        self.spaces.fetch_add(1, Ordering::SeqCst);
        Some(SimSpace { id: self.id() })
    }

    fn grow_address_space(&self, _space: &mut SimSpace, _old: usize, new: usize) -> Option<usize> {
        Some(new)
    }

    fn shrink_address_space(&self, _space: &mut SimSpace, _old: usize, new: usize) -> Option<usize> {
        Some(new)
    }

    fn free_address_space(&self, _space: SimSpace, _size: usize) {
        self.spaces.fetch_sub(1, Ordering::SeqCst);
    }

    fn activate_user(&self, _space: &SimSpace, _stack: &SimStack) {}

    fn activate_kernel(&self) {}

    fn dup_file(&self, file: &SimFile) -> SimFile {
        self.files.fetch_add(1, Ordering::SeqCst);
        SimFile(file.0)
    }

    fn close_file(&self, _file: SimFile) {
        self.files.fetch_sub(1, Ordering::SeqCst);
    }

    fn root_dir(&self) -> SimDir {
        self.dirs.fetch_add(1, Ordering::SeqCst);
        SimDir(0)
    }

    fn dup_dir(&self, dir: &SimDir) -> SimDir {
        self.dirs.fetch_add(1, Ordering::SeqCst);
        SimDir(dir.0)
    }

    fn release_dir(&self, _dir: SimDir) {
        self.dirs.fetch_sub(1, Ordering::SeqCst);
    }

    fn copy_out(&self, space: &SimSpace, addr: usize, bytes: &[u8]) -> bool {
        if addr == 0 {
            return false;
        }
        let mut memory = self.memory.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            memory.insert((space.id, addr + i), *b);
        }
        true
    }
}

/// Run the dispatch loop on `ncpu` CPUs until init calls [`finish`].
pub fn run(k: K, ncpu: usize) {
    let others: Vec<_> = (1..ncpu)
        .map(|cpu| thread::spawn(move || drive(k, cpu)))
        .collect();
    drive(k, 0);
    for t in others {
        t.join().expect("dispatch loop panicked");
    }
}

fn drive(k: K, cpu: usize) {
    on_cpu(cpu);
    for _ in 0..MAX_PASSES {
        if k.platform().done.load(Ordering::SeqCst) {
            return;
        }
        if !k.schedule_once() {
            // Idle: CPU 0 owns the timer.
            if cpu == 0 {
                k.clock_tick();
            } else {
                thread::yield_now();
            }
        }
    }
    panic!("cpu {} still busy after {} passes", cpu, MAX_PASSES);
}

/// Fork a child of the current process that runs `program`.
pub fn spawn(k: K, program: usize) -> ProcessId {
    k.with_current(|p| p.trap_frame.rip = program).unwrap();
    k.fork().expect("fork")
}

pub fn spawn_with_priority(k: K, program: usize, priority: u32) -> ProcessId {
    k.with_current(|p| p.trap_frame.rip = program).unwrap();
    k.fork_with_priority(priority).expect("fork")
}

/// A timer interrupt arriving while the current process runs.
pub fn timer(k: K) {
    k.clock_tick();
    k.yield_cpu();
}

/// Stop the machine. Called by init once the test scenario is over; init
/// may not exit, so it sleeps forever instead.
pub fn finish(k: K) -> ! {
    k.platform().done.store(true, Ordering::SeqCst);
    loop {
        let table = k.lock_table();
        drop(k.sleep_locked(Channel::Address(usize::MAX), table));
    }
}

/// Id of the current process's address space.
pub fn my_space(k: K) -> u64 {
    k.with_current(|p| p.space.as_ref().map(|s| s.id))
        .unwrap()
        .expect("process without address space")
}

/// Give up the CPU until `pid` reaches a state accepted by `until`.
///
/// Only makes progress under policies where a yield always switches.
pub fn yield_until(k: K, pid: ProcessId, until: impl Fn(ProcessState) -> bool) {
    while !k.process_info(pid).map_or(false, |info| until(info.state)) {
        k.yield_cpu();
    }
}
