//! Safepoints and trap dispatch.
//!
//! Every mutator polls its safepoint latch on the managed side of the
//! runtime: compiled code loads through the latch, interpreters call
//! [`poll`]. While no freeze is in progress the latch points at the
//! thread's enabled locals and polling is free. Freezing repoints the latch
//! at the process-wide *triggered-locals page*, a page kept read-protected,
//! so a compiled poll faults and an explicit poll compares equal; both
//! funnel into [`block_at_safepoint`], which runs the operation's hooks
//! around a blocking acquire of the thread-map lock.
//!
//! Embedders that take real memory-protection faults route them into
//! [`dispatch_trap`], the one place that inspects trap state. The outcome
//! is a sum type: the dispatcher never unwinds on its own.

use lazy_static::lazy_static;

use crate::scheduler::freeze::{FreezeConfig, MutatorContext, MutatorRegistry};
use crate::util::constants::BYTES_IN_PAGE;
use crate::util::memory;
use crate::util::Address;

lazy_static! {
    /// The triggered-locals page: committed once, then read-protected for
    /// the lifetime of the process. Read-only global state derived at
    /// initialization; its only use is to be an address that faults.
    static ref TRIGGERED_LOCALS_PAGE: Address = {
        let page = memory::reserve_address_space(BYTES_IN_PAGE)
            .expect("cannot reserve the triggered-locals page");
        memory::commit(page, BYTES_IN_PAGE)
            .expect("cannot commit the triggered-locals page");
        memory::protect(page, BYTES_IN_PAGE)
            .expect("cannot protect the triggered-locals page");
        page
    };
}

/// The address of the triggered-locals page.
pub fn triggered_locals_page() -> Address {
    *TRIGGERED_LOCALS_PAGE
}

/// What a memory-protection trap means, decided by [`dispatch_trap`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The fault was a safepoint poll against the triggered-locals page.
    /// The dispatcher has already blocked the thread for the duration of
    /// the VM operation; execution may resume at the faulting instruction.
    HandledSafepoint,
    /// The fault hit the thread's yellow stack-guard zone: the runtime
    /// should raise the implicit exception. The guard zone has been
    /// unprotected so the handler can run; re-protect it with
    /// [`reset_guard_zone`] once the exception is in flight.
    RaiseImplicit(ImplicitExceptionKind),
    /// A fault in native code that the runtime cannot recover from.
    FatalInNative,
    /// A fault in memory owned by no known region, stub or guard. Fatal.
    UnexpectedTrapOrigin,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImplicitExceptionKind {
    StackOverflow,
}

/// Explicit safepoint poll, for interpreter-style embedders and tests.
/// Returns true when the poll blocked for a VM operation.
pub fn poll(mutator: &MutatorContext, registry: &MutatorRegistry, config: &FreezeConfig) -> bool {
    if mutator.latch() != triggered_locals_page() {
        return false;
    }
    block_at_safepoint(mutator, registry, config);
    true
}

/// Classify a memory-protection trap and, for safepoint polls, block the
/// thread until the VM operation completes. `fault_addr` is the faulting
/// data address; `in_native` tells whether the thread was outside managed
/// code (a latch fault cannot happen there, and a guard fault there is not
/// recoverable).
pub fn dispatch_trap(
    mutator: &MutatorContext,
    registry: &MutatorRegistry,
    config: &FreezeConfig,
    fault_addr: Address,
    in_native: bool,
) -> TrapOutcome {
    let page = triggered_locals_page();
    if fault_addr >= page && fault_addr < page + BYTES_IN_PAGE {
        if mutator.latch() != page || in_native {
            return TrapOutcome::UnexpectedTrapOrigin;
        }
        block_at_safepoint(mutator, registry, config);
        return TrapOutcome::HandledSafepoint;
    }
    if let Some((guard, bytes)) = mutator.guard_zone() {
        if fault_addr >= guard && fault_addr < guard + bytes {
            if in_native {
                return TrapOutcome::FatalInNative;
            }
            // Open the guard so the exception path can run on this stack.
            memory::unprotect(guard, bytes, memory::MmapProtection::ReadWrite)
                .expect("cannot unprotect the stack guard zone");
            return TrapOutcome::RaiseImplicit(ImplicitExceptionKind::StackOverflow);
        }
    }
    if in_native {
        TrapOutcome::FatalInNative
    } else {
        TrapOutcome::UnexpectedTrapOrigin
    }
}

/// Re-protect a thread's yellow guard zone after an implicit stack-overflow
/// exception has been raised.
pub fn reset_guard_zone(mutator: &MutatorContext) {
    if let Some((guard, bytes)) = mutator.guard_zone() {
        memory::protect(guard, bytes).expect("cannot re-protect the stack guard zone");
    }
}

/// Block the calling mutator at its safepoint: run the operation's
/// before-blocking hook, account the thread frozen, block on the thread-map
/// lock (held by the VM-operation thread until thaw), then run the
/// after-blocking hook and re-enter managed code through the native-call
/// epilogue, so a freeze submitted right behind this one is lost to
/// fairly rather than escaped.
///
/// The frame anchor published at the last native-call boundary or trap is
/// left in place for the whole window, so the thread's stack is walkable.
pub fn block_at_safepoint(
    mutator: &MutatorContext,
    registry: &MutatorRegistry,
    config: &FreezeConfig,
) {
    let operation = mutator.operation();
    if let Some(op) = &operation {
        op.do_at_safepoint_before_blocking(mutator);
    }
    trace!("mutator {:?} blocking at safepoint", mutator.id());
    // From here the VM-operation thread counts this thread as frozen.
    mutator.freeze_self_at_trap();
    {
        let _map = registry.lock();
        // The operation has completed and thawed us.
    }
    if let Some(op) = &operation {
        op.do_at_safepoint_after_blocking(mutator);
    }
    // Thaw left us accounted in native; racing against any newer freeze is
    // exactly the epilogue protocol.
    mutator.exit_native(config);
    trace!("mutator {:?} resumed from safepoint", mutator.id());
}
