//! VM operations.
//!
//! A VM operation is a unit of work executed on the VM-operation thread,
//! optionally with some or all mutator threads frozen at a safepoint for its
//! duration. Submitters hand a boxed operation to the
//! [`crate::scheduler::VmOperationThread`] and get it back (shared) once it
//! has run, so results can be carried in the operation itself and recovered
//! by downcasting.

use downcast_rs::{impl_downcast, DowncastSync};

use crate::scheduler::freeze::{MutatorContext, MutatorId};
use crate::util::Address;

/// How an operation interacts with mutator threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Freeze the target mutators for the duration of `do_it`.
    Safepoint,
    /// Run on the VM-operation thread without freezing anyone.
    NoSafepoint,
    /// Run concurrently with mutators.
    Concurrent,
    /// Freeze the targets, but the submitter does not wait for completion.
    AsyncSafepoint,
}

impl Mode {
    pub fn requires_freeze(self) -> bool {
        matches!(self, Mode::Safepoint | Mode::AsyncSafepoint)
    }

    /// Does the submitter block until the operation has run?
    pub fn is_blocking(self) -> bool {
        !matches!(self, Mode::AsyncSafepoint)
    }
}

/// A unit of work for the VM-operation thread.
///
/// `do_it` takes `&self`: operations that produce results carry them in
/// interior-mutable fields and the submitter downcasts the operation handed
/// back by `submit`. An operation is never canceled once `do_it` has
/// started; a submitter that wants to cancel must do so by returning
/// `false` from [`Self::do_it_prologue`].
pub trait VmOperation: DowncastSync {
    fn name(&self) -> &'static str;

    fn mode(&self) -> Mode {
        Mode::Safepoint
    }

    /// The single mutator this operation targets, or `None` for all.
    fn target(&self) -> Option<MutatorId> {
        None
    }

    /// May operations be submitted from within this operation's `do_it`?
    /// Nested operations must target a subset of this operation's frozen
    /// threads.
    fn allows_nested(&self) -> bool {
        false
    }

    /// Runs on the submitting thread before the operation is queued.
    /// Returning `false` cancels the submission.
    fn do_it_prologue(&self) -> bool {
        true
    }

    /// The operation body. Runs on the VM-operation thread, with the
    /// operation's targets frozen when the mode requires it.
    fn do_it(&self);

    /// Invoked once per frozen target after every target has been frozen.
    fn do_after_frozen(&self, mutator: &MutatorContext) {
        let _ = mutator;
    }

    /// Visits each frozen target with its published frame anchor.
    fn do_thread(&self, mutator: &MutatorContext, ip: Address, sp: Address, fp: Address) {
        let _ = (mutator, ip, sp, fp);
    }

    /// Invoked per target just before it is thawed.
    fn do_before_thawing_thread(&self, mutator: &MutatorContext) {
        let _ = mutator;
    }

    /// Runs on a mutator that reached its safepoint trap, before it blocks
    /// on the thread-map lock.
    fn do_at_safepoint_before_blocking(&self, mutator: &MutatorContext) {
        let _ = mutator;
    }

    /// Runs on the same mutator after the VM operation completed and the
    /// thread-map lock was released.
    fn do_at_safepoint_after_blocking(&self, mutator: &MutatorContext) {
        let _ = mutator;
    }
}
impl_downcast!(sync VmOperation);
