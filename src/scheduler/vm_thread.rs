//! The VM-operation thread.
//!
//! All VM operations are queued by their submitters and consumed by this
//! single thread. For safepoint operations it takes the global thread-map
//! lock, freezes the targets, runs the operation's hooks and body, thaws
//! everyone and releases the lock. Panics out of `do_it` are captured so
//! frozen mutators are never abandoned, and rethrown to the submitter after
//! thaw completes.
//!
//! An operation may submit further operations from inside `do_it` only when
//! it declares `allows_nested`; the nested operation runs inline on the
//! VM-operation thread and must target a subset of the already-frozen
//! threads, for which freeze and thaw are no-ops.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::scheduler::freeze::{FreezeConfig, MutatorContext, MutatorRegistry};
use crate::scheduler::operation::VmOperation;

type PanicPayload = Box<dyn std::any::Any + Send>;

struct Request {
    op: Arc<dyn VmOperation>,
    done: Option<Sender<Option<PanicPayload>>>,
}

enum Message {
    Run(Request),
    Shutdown,
}

/// Handle to the VM-operation thread.
pub struct VmOperationThread {
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
    registry: Arc<MutatorRegistry>,
    config: FreezeConfig,
    /// The OS thread id of the operation thread, for nested detection.
    worker_thread: AtomicU64,
    /// Set while an operation that allows nesting is running.
    nested_allowed: Arc<AtomicBool>,
}

impl VmOperationThread {
    pub fn spawn(registry: Arc<MutatorRegistry>, config: FreezeConfig) -> VmOperationThread {
        let (sender, receiver) = unbounded::<Message>();
        let worker_registry = registry.clone();
        let nested_allowed = Arc::new(AtomicBool::new(false));
        let worker_nested = nested_allowed.clone();
        let (id_tx, id_rx) = unbounded::<u64>();
        let handle = std::thread::Builder::new()
            .name("vm-operation".into())
            .spawn(move || {
                id_tx.send(current_thread_id()).unwrap();
                worker_loop(receiver, worker_registry, config, worker_nested);
            })
            .expect("cannot spawn the VM-operation thread");
        let worker_thread = id_rx.recv().expect("VM-operation thread died at birth");
        VmOperationThread {
            sender,
            handle: Some(handle),
            registry,
            config,
            worker_thread: AtomicU64::new(worker_thread),
            nested_allowed,
        }
    }

    pub fn registry(&self) -> &Arc<MutatorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &FreezeConfig {
        &self.config
    }

    /// Is the calling thread the VM-operation thread?
    pub fn on_vm_operation_thread(&self) -> bool {
        current_thread_id() == self.worker_thread.load(Ordering::Relaxed)
    }

    /// Submit an operation, wait for it to complete (unless its mode is
    /// async), and hand it back so the submitter can read results out of
    /// it. A panic from `do_it` is rethrown here, after all frozen threads
    /// have been thawed.
    ///
    /// Submitting from the VM-operation thread itself runs the operation
    /// inline as a nested operation; the enclosing operation must allow
    /// that.
    pub fn submit(&self, op: Box<dyn VmOperation>) -> Arc<dyn VmOperation> {
        let op: Arc<dyn VmOperation> = Arc::from(op);
        if !op.do_it_prologue() {
            debug!("operation {} canceled in its prologue", op.name());
            return op;
        }
        if self.on_vm_operation_thread() {
            self.run_nested(&op);
            return op;
        }
        if op.mode().is_blocking() {
            let (done_tx, done_rx) = unbounded();
            self.sender
                .send(Message::Run(Request {
                    op: op.clone(),
                    done: Some(done_tx),
                }))
                .expect("the VM-operation thread is gone");
            let panic = done_rx.recv().expect("the VM-operation thread is gone");
            if let Some(payload) = panic {
                std::panic::resume_unwind(payload);
            }
        } else {
            // Fire and forget; panics abort the operation thread's batch.
            self.sender
                .send(Message::Run(Request {
                    op: op.clone(),
                    done: None,
                }))
                .expect("the VM-operation thread is gone");
            trace!("async operation {} queued", op.name());
        }
        op
    }

    /// Run a nested operation inline. All its targets must already be
    /// frozen by the enclosing operation; their freeze/thaw is a no-op.
    fn run_nested(&self, op: &Arc<dyn VmOperation>) {
        assert!(
            self.nested_allowed.load(Ordering::Relaxed),
            "operation {} submitted from the VM-operation thread, \
             but the enclosing operation does not allow nesting",
            op.name()
        );
        if op.mode().requires_freeze() {
            let frozen_subset = match op.target() {
                Some(id) => self
                    .registry
                    .find(id)
                    .map(|m| m.is_frozen())
                    .unwrap_or(false),
                None => true, // the enclosing operation froze everyone it targets
            };
            assert!(
                frozen_subset,
                "nested operation {} targets a thread the enclosing operation did not freeze",
                op.name()
            );
        }
        debug!("running nested operation {}", op.name());
        op.do_it();
    }
}

impl Drop for VmOperationThread {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn current_thread_id() -> u64 {
    // ThreadId::as_u64 is unstable; hash the id instead.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

fn worker_loop(
    receiver: Receiver<Message>,
    registry: Arc<MutatorRegistry>,
    config: FreezeConfig,
    nested_allowed: Arc<AtomicBool>,
) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Shutdown => break,
            Message::Run(request) => {
                let Request { op, done } = request;
                debug!("executing operation {} ({:?})", op.name(), op.mode());
                nested_allowed.store(op.allows_nested(), Ordering::Relaxed);
                let panic = execute(&op, &registry, &config);
                nested_allowed.store(false, Ordering::Relaxed);
                match done {
                    Some(done) => {
                        let _ = done.send(panic);
                    }
                    None => {
                        if let Some(payload) = panic {
                            std::panic::resume_unwind(payload);
                        }
                    }
                }
            }
        }
    }
}

/// Execute one operation, freezing and thawing its targets as its mode
/// requires. Returns the panic payload of `do_it`, if any.
fn execute(
    op: &Arc<dyn VmOperation>,
    registry: &MutatorRegistry,
    config: &FreezeConfig,
) -> Option<PanicPayload> {
    if !op.mode().requires_freeze() {
        return catch_unwind(AssertUnwindSafe(|| op.do_it())).err();
    }

    // The thread-map lock is held from before the first freeze until after
    // the last thaw; trapped mutators block on it.
    let map = registry.lock();
    let targets: Vec<Arc<MutatorContext>> = match op.target() {
        Some(id) => map.iter().filter(|m| m.id() == id).cloned().collect(),
        None => map.iter().cloned().collect(),
    };

    let mut frozen_by_us: Vec<Arc<MutatorContext>> = Vec::with_capacity(targets.len());
    for mutator in &targets {
        if mutator.is_frozen() {
            // Already frozen: freezing again is a no-op, and thawing is the
            // freezer's job.
            continue;
        }
        mutator.set_operation(op);
        mutator.arm_latch();
        mutator.wait_until_frozen(config);
        trace!("froze mutator {:?}", mutator.id());
        frozen_by_us.push(mutator.clone());
    }
    for mutator in &targets {
        op.do_after_frozen(mutator);
        let anchor = mutator.anchor();
        op.do_thread(
            mutator,
            unsafe { crate::util::Address::from_usize(anchor.ip) },
            unsafe { crate::util::Address::from_usize(anchor.sp) },
            unsafe { crate::util::Address::from_usize(anchor.fp) },
        );
    }

    let panic = catch_unwind(AssertUnwindSafe(|| op.do_it())).err();

    for mutator in &frozen_by_us {
        op.do_before_thawing_thread(mutator);
        mutator.thaw(config);
        trace!("thawed mutator {:?}", mutator.id());
    }
    drop(map);
    panic
}
