// Process Management Module for EMOS Microkernel
pub mod context;
pub mod lifecycle;
pub mod pcb;
pub mod scheduler;
pub mod stats;
pub mod sync;
pub mod table;

pub use context::Cpu;
pub use pcb::{Channel, Proc, ProcessError, ProcessId, ProcessState, Slot};
pub use scheduler::SchedPolicy;
pub use stats::{AverageTimes, ProcessInfo, TimeStats};
pub use table::ProcessTable;
