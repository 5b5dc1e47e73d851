//! Mutator thread state and the freeze/thaw protocol.
//!
//! Each mutator carries a state word with three values: `InJava` (executing
//! managed code), `InNative` (outside managed code, heap untouched) and
//! `Frozen` (held at a safepoint by a VM operation). Two mechanisms arbitrate
//! the native-call boundary against the VM-operation thread:
//!
//! - **CAS**: the native-call epilogue compare-and-swaps `InNative ->
//!   InJava`; the VM-operation thread freezes a native thread by
//!   compare-and-swapping `InNative -> Frozen`. Whichever CAS wins settles
//!   the race; an epilogue that observes `Frozen` spins until thaw restores
//!   `InNative`.
//! - **Fence**: a separate `frozen` flag with Dekker-style store-fence-load
//!   sequences on both sides; an epilogue that observes the flag rolls its
//!   state back to `InNative` and waits for the flag to clear.
//!
//! Threads executing managed code are driven to a safepoint by the latch:
//! freezing points it at the read-protected triggered-locals page, so the
//! next safepoint poll faults (or, for explicit polls, compares equal) and
//! the thread blocks on the thread-map lock, which the VM-operation thread
//! holds for the duration of the operation.
//!
//! All mutator-side state stores are releases and all VM-thread-side reads
//! are acquires, so heap writes performed before a native transition are
//! visible to the VM-operation thread once it observes the transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use atomic::Atomic;

use crate::scheduler::safepoint;
use crate::util::options::{FreezeMechanism, Options};
use crate::util::Address;

/// Identifies a registered mutator thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MutatorId(pub usize);

/// The mutator state word.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::NoUninit)]
pub enum MutatorState {
    /// Executing managed code; will reach a safepoint poll.
    InJava,
    /// Outside managed code; cannot touch the heap.
    InNative,
    /// Held at a safepoint by a VM operation.
    Frozen,
}

/// The last managed frame of a mutator, published at native-call boundaries
/// and safepoint traps so the tracer can walk the thread's stack.
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameAnchor {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
}

impl FrameAnchor {
    pub fn is_empty(&self) -> bool {
        self.sp == 0
    }
}

/// Freeze-protocol parameters, copied out of [`Options`] at initialization.
#[derive(Copy, Clone, Debug)]
pub struct FreezeConfig {
    pub mechanism: FreezeMechanism,
    pub spin_before_yield: usize,
    pub debug_iterations: usize,
}

impl FreezeConfig {
    pub fn from_options(options: &Options) -> FreezeConfig {
        FreezeConfig {
            mechanism: *options.freeze_mechanism,
            spin_before_yield: *options.safepoint_spin_before_yield,
            debug_iterations: *options.freeze_debug_iterations,
        }
    }
}

/// Per-thread mutator state.
pub struct MutatorContext {
    id: MutatorId,
    name: String,
    state: Atomic<MutatorState>,
    /// The fence mechanism's frozen flag.
    frozen: AtomicBool,
    /// The safepoint latch: the thread's enabled locals normally, the
    /// triggered-locals page while a freeze is in progress.
    latch: Atomic<Address>,
    enabled_locals: Address,
    /// The operation currently freezing this thread, if any. Held shared so
    /// a mutator still inside its safepoint hooks keeps the operation alive
    /// past thaw.
    operation: Mutex<Option<Arc<dyn crate::scheduler::VmOperation>>>,
    anchor: Mutex<FrameAnchor>,
    /// Optional yellow stack-guard zone registered by the embedder, for
    /// classifying stack-overflow traps.
    guard_zone: Mutex<Option<(Address, usize)>>,
}

impl MutatorContext {
    fn new(id: MutatorId, name: String, enabled_locals: Address) -> MutatorContext {
        MutatorContext {
            id,
            name,
            state: Atomic::new(MutatorState::InJava),
            frozen: AtomicBool::new(false),
            latch: Atomic::new(enabled_locals),
            enabled_locals,
            operation: Mutex::new(None),
            anchor: Mutex::new(FrameAnchor::default()),
            guard_zone: Mutex::new(None),
        }
    }

    pub fn id(&self) -> MutatorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MutatorState {
        self.state.load(Ordering::Acquire)
    }

    /// Is the thread held by a VM operation? Under the CAS mechanism a
    /// frozen thread carries the `Frozen` state; under the fence mechanism a
    /// thread frozen in native keeps `InNative` with the frozen flag set.
    pub fn is_frozen(&self) -> bool {
        match self.state() {
            MutatorState::Frozen => true,
            MutatorState::InNative => self.frozen.load(Ordering::Acquire),
            MutatorState::InJava => false,
        }
    }

    /// The current latch value: the enabled locals, or the triggered page
    /// while a freeze is in progress.
    pub fn latch(&self) -> Address {
        self.latch.load(Ordering::Acquire)
    }

    pub fn enabled_locals(&self) -> Address {
        self.enabled_locals
    }

    pub fn anchor(&self) -> FrameAnchor {
        *self.anchor.lock().unwrap()
    }

    /// Publish the last managed frame. Called by the embedder at native-call
    /// prologues and by the trap path.
    pub fn record_anchor(&self, ip: usize, sp: usize, fp: usize) {
        *self.anchor.lock().unwrap() = FrameAnchor { ip, sp, fp };
    }

    /// Register the yellow stack-guard zone for this thread.
    pub fn set_guard_zone(&self, start: Address, bytes: usize) {
        *self.guard_zone.lock().unwrap() = Some((start, bytes));
    }

    pub fn guard_zone(&self) -> Option<(Address, usize)> {
        *self.guard_zone.lock().unwrap()
    }

    pub(crate) fn set_operation(&self, op: &Arc<dyn crate::scheduler::VmOperation>) {
        *self.operation.lock().unwrap() = Some(op.clone());
    }

    pub(crate) fn clear_operation(&self) {
        *self.operation.lock().unwrap() = None;
    }

    /// The operation currently freezing this thread, if any.
    pub fn operation(&self) -> Option<Arc<dyn crate::scheduler::VmOperation>> {
        self.operation.lock().unwrap().clone()
    }

    // ---- mutator-side transitions -----------------------------------------

    /// The native-call prologue: publish the frame anchor and leave managed
    /// code. The VM-operation thread may freeze this thread from here on
    /// without its cooperation.
    pub fn enter_native(&self, ip: usize, sp: usize, fp: usize) {
        debug_assert!(self.state() == MutatorState::InJava);
        self.record_anchor(ip, sp, fp);
        self.state.store(MutatorState::InNative, Ordering::Release);
    }

    /// The native-call epilogue: re-enter managed code, losing any race
    /// against an in-progress freeze.
    pub fn exit_native(&self, config: &FreezeConfig) {
        match config.mechanism {
            FreezeMechanism::Cas => loop {
                match self.state.compare_exchange(
                    MutatorState::InNative,
                    MutatorState::InJava,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(MutatorState::Frozen) => {
                        // A VM operation won the race; wait for ThawThread to
                        // restore InNative.
                        let mut waits = 0usize;
                        while self.state.load(Ordering::Acquire) == MutatorState::Frozen {
                            back_off(config, &mut waits, self);
                        }
                    }
                    Err(_) => {
                        unreachable!("native epilogue raced with an InJava state")
                    }
                }
            },
            FreezeMechanism::Fence => loop {
                self.state.store(MutatorState::InJava, Ordering::Release);
                std::sync::atomic::fence(Ordering::SeqCst);
                if !self.frozen.load(Ordering::Acquire) {
                    break;
                }
                // Roll back and wait out the freeze.
                self.state.store(MutatorState::InNative, Ordering::Release);
                let mut waits = 0usize;
                while self.frozen.load(Ordering::Acquire) {
                    back_off(config, &mut waits, self);
                }
            },
        }
    }

    /// Account this thread frozen at a safepoint trap. Runs on the mutator
    /// itself, before it blocks on the thread-map lock.
    pub(crate) fn freeze_self_at_trap(&self) {
        self.state.store(MutatorState::Frozen, Ordering::Release);
    }

    // ---- VM-operation-thread-side transitions -----------------------------

    /// Arm the latch so the thread's next safepoint poll traps.
    pub(crate) fn arm_latch(&self) {
        self.latch
            .store(safepoint::triggered_locals_page(), Ordering::Release);
    }

    /// Restore the latch to the enabled locals.
    pub(crate) fn disarm_latch(&self) {
        self.latch.store(self.enabled_locals, Ordering::Release);
    }

    /// Wait until this thread is frozen. Runs on the VM-operation thread
    /// with the thread-map lock held; the latch must already be armed.
    pub(crate) fn wait_until_frozen(&self, config: &FreezeConfig) {
        let mut waits = 0usize;
        match config.mechanism {
            FreezeMechanism::Cas => loop {
                match self.state.compare_exchange(
                    MutatorState::InNative,
                    MutatorState::Frozen,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(MutatorState::Frozen) => break, // froze itself at a trap
                    Err(_) => back_off(config, &mut waits, self),
                }
            },
            FreezeMechanism::Fence => {
                self.frozen.store(true, Ordering::SeqCst);
                std::sync::atomic::fence(Ordering::SeqCst);
                loop {
                    match self.state.load(Ordering::Acquire) {
                        MutatorState::InNative | MutatorState::Frozen => break,
                        MutatorState::InJava => back_off(config, &mut waits, self),
                    }
                }
            }
        }
    }

    /// Release the thread after the operation has run.
    pub(crate) fn thaw(&self, config: &FreezeConfig) {
        self.disarm_latch();
        self.clear_operation();
        match config.mechanism {
            FreezeMechanism::Cas => {
                // A thread frozen from native resumes its epilogue spin; a
                // thread blocked at a trap re-enters managed code through
                // the epilogue protocol once it reacquires the thread-map
                // lock.
                self.state.store(MutatorState::InNative, Ordering::Release);
            }
            FreezeMechanism::Fence => {
                self.frozen.store(false, Ordering::Release);
            }
        }
    }
}

/// Graduated back-off: spin, then yield, then sleep 1-10 ms. The optional
/// debug report names a thread that is not reaching its safepoint.
fn back_off(config: &FreezeConfig, waits: &mut usize, mutator: &MutatorContext) {
    *waits += 1;
    if config.debug_iterations != 0 && *waits == config.debug_iterations {
        warn!(
            "thread {:?} ({}) has not reached a safepoint after {} waits: state {:?}, anchor {:?}",
            mutator.id(),
            mutator.name(),
            waits,
            mutator.state(),
            mutator.anchor()
        );
    }
    if *waits < config.spin_before_yield {
        std::hint::spin_loop();
    } else if *waits < config.spin_before_yield + 16 {
        std::thread::yield_now();
    } else {
        let ms = 1 + ((*waits - config.spin_before_yield) % 10) as u64;
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

/// The thread map: every registered mutator, guarded by the global
/// thread-map lock. The VM-operation thread holds the lock across
/// freeze/run/thaw; a mutator trapped at a safepoint blocks acquiring it.
pub struct MutatorRegistry {
    sync: Mutex<Vec<Arc<MutatorContext>>>,
    next_id: std::sync::atomic::AtomicUsize,
}

impl MutatorRegistry {
    pub fn new() -> MutatorRegistry {
        MutatorRegistry {
            sync: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Register the calling thread as a mutator. `enabled_locals` is the
    /// address of the thread's locals block, the normal latch target.
    pub fn register(&self, name: &str, enabled_locals: Address) -> Arc<MutatorContext> {
        let id = MutatorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mutator = Arc::new(MutatorContext::new(id, name.to_string(), enabled_locals));
        self.sync.lock().unwrap().push(mutator.clone());
        debug!("registered mutator {:?} ({})", id, name);
        mutator
    }

    /// Remove a mutator from the map. The thread must not be frozen.
    pub fn unregister(&self, id: MutatorId) {
        let mut threads = self.sync.lock().unwrap();
        if let Some(index) = threads.iter().position(|m| m.id() == id) {
            let mutator = threads.swap_remove(index);
            assert!(
                !mutator.is_frozen(),
                "unregistering frozen mutator {id:?}"
            );
        }
    }

    /// Acquire the global thread-map lock.
    pub fn lock(&self) -> MutexGuard<'_, Vec<Arc<MutatorContext>>> {
        self.sync.lock().unwrap()
    }

    pub fn find(&self, id: MutatorId) -> Option<Arc<MutatorContext>> {
        self.sync
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mechanism: FreezeMechanism) -> FreezeConfig {
        FreezeConfig {
            mechanism,
            spin_before_yield: 100,
            debug_iterations: 0,
        }
    }

    fn locals() -> Address {
        // A stand-in locals block; only its address matters.
        static LOCALS: [u64; 4] = [0; 4];
        Address::from_ptr(LOCALS.as_ptr())
    }

    #[test]
    fn freeze_thaw_thread_in_native() {
        for mechanism in [FreezeMechanism::Cas, FreezeMechanism::Fence] {
            let registry = MutatorRegistry::new();
            let mutator = registry.register("t0", locals());
            let cfg = config(mechanism);
            mutator.enter_native(1, 2, 3);
            mutator.arm_latch();
            mutator.wait_until_frozen(&cfg);
            match mechanism {
                FreezeMechanism::Cas => assert_eq!(mutator.state(), MutatorState::Frozen),
                FreezeMechanism::Fence => assert!(matches!(
                    mutator.state(),
                    MutatorState::InNative | MutatorState::Frozen
                )),
            }
            mutator.thaw(&cfg);
            mutator.exit_native(&cfg);
            assert_eq!(mutator.state(), MutatorState::InJava);
            assert_eq!(mutator.latch(), mutator.enabled_locals());
        }
    }

    #[test]
    fn epilogue_loses_race_against_freeze() {
        // Freeze a native thread, then run its epilogue from another thread:
        // it must spin until thaw and only then re-enter managed code.
        let registry = MutatorRegistry::new();
        let mutator = registry.register("t0", locals());
        let cfg = config(FreezeMechanism::Cas);
        mutator.enter_native(1, 2, 3);
        mutator.arm_latch();
        mutator.wait_until_frozen(&cfg);

        let m = mutator.clone();
        let epilogue = std::thread::spawn(move || {
            m.exit_native(&config(FreezeMechanism::Cas));
            m.state()
        });
        // Give the epilogue a moment to observe Frozen.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(mutator.state(), MutatorState::Frozen);
        mutator.thaw(&cfg);
        assert_eq!(epilogue.join().unwrap(), MutatorState::InJava);
    }

    #[test]
    fn anchor_round_trip() {
        let registry = MutatorRegistry::new();
        let mutator = registry.register("t0", locals());
        assert!(mutator.anchor().is_empty());
        mutator.enter_native(0x10, 0x20, 0x30);
        let anchor = mutator.anchor();
        assert_eq!((anchor.ip, anchor.sp, anchor.fp), (0x10, 0x20, 0x30));
        assert!(!anchor.is_empty());
    }
}
