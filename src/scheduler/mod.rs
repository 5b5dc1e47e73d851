//! The VM-operation thread, VM operations and the freeze/thaw (safepoint)
//! protocol that coordinates mutators with the collector.

pub mod freeze;
pub mod operation;
pub mod safepoint;
mod vm_thread;

pub use freeze::{
    FrameAnchor, FreezeConfig, MutatorContext, MutatorId, MutatorRegistry, MutatorState,
};
pub use operation::{Mode, VmOperation};
pub use safepoint::{
    block_at_safepoint, dispatch_trap, poll, triggered_locals_page, ImplicitExceptionKind,
    TrapOutcome,
};
pub use vm_thread::VmOperationThread;
