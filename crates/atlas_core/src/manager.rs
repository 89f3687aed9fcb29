//! Resource manager - the operation graph
//!
//! Owns the arena of live operation slots and advances them with a
//! cooperative single-pass `update()`. Slots are generation-counted:
//! reclaiming a slot bumps its generation, so a recycled slot can never be
//! confused with the operation that previously lived there and no stale
//! state survives reuse.
//!
//! Callbacks, error reports, chain continuations, and releases triggered
//! by a poll pass are queued as deferred actions and run after the arena
//! lock is dropped, so they are free to re-enter the manager.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{AtlasError, OperationError};
use crate::handle::{OpHandle, WaitResult};
use crate::operation::{OpPoll, Operation, OperationStatus, ResourceValue};

/// Identity of an operation slot: arena index plus the generation the
/// slot was handed out under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpId {
    index: u32,
    generation: u32,
}

/// Callback fired through the deferred queue when an operation completes.
pub type CompletionCallback = Box<dyn FnOnce(&OpHandle) + Send>;

/// Continuation run when a chain's dependency succeeds; produces the next
/// handle the chain waits on.
pub type ChainContinuation = Box<dyn FnOnce(ResourceValue) -> OpHandle + Send>;

/// Handler invoked for every captured operation error. Injected per
/// manager instance; the default logs through `log::error!`.
pub type ExceptionHook = Box<dyn Fn(&OpHandle, &AtlasError) + Send + Sync>;

/// Cell a chain continuation fills in with the follow-up operation id.
pub(crate) type ChainLink = Arc<Mutex<Option<OpId>>>;

struct OpEntry {
    name: String,
    op: Option<Box<dyn Operation>>,
    status: OperationStatus,
    progress: f32,
    result: Option<ResourceValue>,
    error: Option<Arc<AtlasError>>,
    ref_count: u32,
    auto_release: bool,
    callbacks: Vec<CompletionCallback>,
}

struct Slot {
    generation: u32,
    entry: Option<OpEntry>,
}

pub(crate) enum DeferredAction {
    Fire { id: OpId, cb: CompletionCallback },
    Report { id: OpId, error: Arc<AtlasError> },
    Release(OpId),
    Continue {
        link: ChainLink,
        run: ChainContinuation,
        value: ResourceValue,
    },
}

pub(crate) struct ManagerCore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    active: Vec<OpId>,
    pending: Vec<DeferredAction>,
}

impl ManagerCore {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            active: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn slot(&self, id: OpId) -> Option<&OpEntry> {
        self.slots.get(id.index as usize).and_then(|s| {
            if s.generation == id.generation {
                s.entry.as_ref()
            } else {
                None
            }
        })
    }

    fn slot_mut(&mut self, id: OpId) -> Option<&mut OpEntry> {
        self.slots.get_mut(id.index as usize).and_then(|s| {
            if s.generation == id.generation {
                s.entry.as_mut()
            } else {
                None
            }
        })
    }

    fn register(&mut self, entry: OpEntry, activate: bool) -> OpId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        let id = OpId {
            index,
            generation: slot.generation,
        };
        if activate {
            self.active.push(id);
        }
        id
    }

    fn complete(
        &mut self,
        id: OpId,
        outcome: Result<ResourceValue, Arc<AtlasError>>,
        actions: &mut Vec<DeferredAction>,
    ) {
        let mut destroy_now = false;
        let mut fired = Vec::new();
        match self.slot_mut(id) {
            None => return,
            Some(entry) => {
                match outcome {
                    Ok(v) => {
                        entry.status = OperationStatus::Succeeded;
                        entry.result = Some(v);
                    }
                    Err(e) => {
                        entry.status = OperationStatus::Failed;
                        entry.error = Some(e.clone());
                        actions.push(DeferredAction::Report { id, error: e });
                    }
                }
                entry.progress = 1.0;
                if entry.ref_count == 0 {
                    // Released while still in flight: tear down now so no
                    // caller can observe a succeeded-and-usable state.
                    destroy_now = true;
                } else {
                    fired = std::mem::take(&mut entry.callbacks);
                    if entry.auto_release {
                        entry.auto_release = false;
                        actions.push(DeferredAction::Release(id));
                    }
                }
            }
        }
        for cb in fired {
            actions.push(DeferredAction::Fire { id, cb });
        }
        if destroy_now {
            log::debug!("operation completed after release; tearing down immediately");
            self.destroy(id, actions);
        }
    }

    fn destroy(&mut self, id: OpId, actions: &mut Vec<DeferredAction>) {
        let mut entry = {
            let Some(slot) = self.slots.get_mut(id.index as usize) else {
                return;
            };
            if slot.generation != id.generation {
                return;
            }
            let Some(entry) = slot.entry.take() else {
                return;
            };
            slot.generation = slot.generation.wrapping_add(1);
            entry
        };
        self.free.push(id.index);
        log::debug!("operation '{}' destroyed", entry.name);
        if let Some(mut op) = entry.op.take() {
            let mut ctx = OpContext {
                core: self,
                actions,
                current: id,
            };
            op.on_destroy(&mut ctx);
        }
    }

    fn release_internal(&mut self, id: OpId, actions: &mut Vec<DeferredAction>) {
        enum Outcome {
            Invalid,
            Underflow(String),
            Destroy,
            Keep,
        }
        let outcome = match self.slot_mut(id) {
            None => Outcome::Invalid,
            Some(entry) => {
                if entry.ref_count == 0 {
                    Outcome::Underflow(entry.name.clone())
                } else {
                    entry.ref_count -= 1;
                    if entry.ref_count == 0 && entry.status.is_terminal() {
                        Outcome::Destroy
                    } else {
                        Outcome::Keep
                    }
                }
            }
        };
        match outcome {
            Outcome::Invalid => actions.push(DeferredAction::Report {
                id,
                error: Arc::new(AtlasError::Operation(OperationError::InvalidRelease(
                    "<destroyed>".to_string(),
                ))),
            }),
            Outcome::Underflow(name) => actions.push(DeferredAction::Report {
                id,
                error: Arc::new(AtlasError::Operation(OperationError::RefCountUnderflow(name))),
            }),
            Outcome::Destroy => self.destroy(id, actions),
            Outcome::Keep => {}
        }
    }
}

/// State shared between a manager and every handle it has issued.
pub(crate) struct ManagerShared {
    core: Mutex<ManagerCore>,
    hook: RwLock<ExceptionHook>,
}

impl ManagerShared {
    pub(crate) fn is_valid(&self, id: OpId) -> bool {
        self.core.lock().slot(id).is_some()
    }

    pub(crate) fn status_of(&self, id: OpId) -> OperationStatus {
        self.core
            .lock()
            .slot(id)
            .map(|e| e.status)
            .unwrap_or(OperationStatus::None)
    }

    pub(crate) fn progress_of(&self, id: OpId) -> f32 {
        self.core.lock().slot(id).map(|e| e.progress).unwrap_or(0.0)
    }

    pub(crate) fn name_of(&self, id: OpId) -> Option<String> {
        self.core.lock().slot(id).map(|e| e.name.clone())
    }

    pub(crate) fn ref_count_of(&self, id: OpId) -> u32 {
        self.core.lock().slot(id).map(|e| e.ref_count).unwrap_or(0)
    }

    pub(crate) fn result_of(&self, id: OpId) -> Option<ResourceValue> {
        self.core.lock().slot(id).and_then(|e| e.result.clone())
    }

    pub(crate) fn error_of(&self, id: OpId) -> Option<Arc<AtlasError>> {
        self.core.lock().slot(id).and_then(|e| e.error.clone())
    }

    pub(crate) fn acquire(&self, id: OpId) -> Result<(), OperationError> {
        let mut core = self.core.lock();
        match core.slot_mut(id) {
            Some(entry) => {
                entry.ref_count += 1;
                Ok(())
            }
            None => Err(OperationError::InvalidHandle),
        }
    }

    pub(crate) fn release(shared: &Arc<Self>, id: OpId) {
        let mut actions = Vec::new();
        shared.core.lock().release_internal(id, &mut actions);
        run_actions(shared, actions);
    }

    pub(crate) fn on_complete(shared: &Arc<Self>, id: OpId, cb: CompletionCallback) {
        let mut core = shared.core.lock();
        let cb = match core.slot_mut(id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.callbacks.push(cb);
                return;
            }
            _ => cb,
        };
        // Already terminal (or invalid): deliver through the deferred
        // queue on the next update, never synchronously.
        core.pending.push(DeferredAction::Fire { id, cb });
    }

    pub(crate) fn mark_auto_release(shared: &Arc<Self>, id: OpId) {
        let mut core = shared.core.lock();
        let already_terminal = match core.slot_mut(id) {
            Some(entry) => {
                if entry.status.is_terminal() {
                    true
                } else {
                    entry.auto_release = true;
                    false
                }
            }
            None => return,
        };
        if already_terminal {
            core.pending.push(DeferredAction::Release(id));
        }
    }

    pub(crate) fn update(shared: &Arc<Self>) {
        let mut actions = Vec::new();
        {
            let mut core = shared.core.lock();
            actions.append(&mut core.pending);
            let ids: Vec<OpId> = core.active.clone();
            for id in ids {
                let op_opt = match core.slot_mut(id) {
                    Some(entry) if entry.status == OperationStatus::InProgress => entry.op.take(),
                    _ => None,
                };
                let Some(mut op) = op_opt else { continue };
                let poll = {
                    let mut ctx = OpContext {
                        core: &mut *core,
                        actions: &mut actions,
                        current: id,
                    };
                    op.poll(&mut ctx)
                };
                if let Some(entry) = core.slot_mut(id) {
                    entry.op = Some(op);
                }
                match poll {
                    OpPoll::Pending(p) => {
                        if let Some(entry) = core.slot_mut(id) {
                            if p > entry.progress {
                                entry.progress = p.min(1.0);
                            }
                        }
                    }
                    OpPoll::Ready(v) => core.complete(id, Ok(v), &mut actions),
                    OpPoll::Fault(e) => core.complete(id, Err(e), &mut actions),
                }
            }
            let ManagerCore { active, slots, .. } = &mut *core;
            active.retain(|id| {
                slots
                    .get(id.index as usize)
                    .map(|s| {
                        s.generation == id.generation
                            && s.entry
                                .as_ref()
                                .map(|e| e.status == OperationStatus::InProgress)
                                .unwrap_or(false)
                    })
                    .unwrap_or(false)
            });
        }
        run_actions(shared, actions);
    }

    pub(crate) fn wait_for_completion(shared: &Arc<Self>, id: OpId) -> WaitResult {
        loop {
            {
                let core = shared.core.lock();
                match core.slot(id) {
                    None => {
                        return WaitResult::Faulted(Arc::new(AtlasError::Operation(
                            OperationError::InvalidHandle,
                        )))
                    }
                    Some(entry) => match entry.status {
                        OperationStatus::Succeeded => {
                            let v = entry
                                .result
                                .clone()
                                .unwrap_or_else(|| Arc::new(()) as ResourceValue);
                            return WaitResult::Completed(v);
                        }
                        OperationStatus::Failed => {
                            let e = entry.error.clone().unwrap_or_else(|| {
                                Arc::new(AtlasError::Operation(OperationError::InvalidHandle))
                            });
                            return WaitResult::Faulted(e);
                        }
                        _ => {
                            if let Some(cp) =
                                entry.op.as_ref().and_then(|op| op.wait_checkpoint())
                            {
                                if entry.progress >= cp - f32::EPSILON {
                                    return WaitResult::Checkpoint(entry.progress);
                                }
                            }
                        }
                    },
                }
            }
            Self::update(shared);
        }
    }
}

fn run_actions(shared: &Arc<ManagerShared>, actions: Vec<DeferredAction>) {
    for action in actions {
        match action {
            DeferredAction::Fire { id, cb } => {
                let handle = OpHandle::new(shared.clone(), id);
                cb(&handle);
            }
            DeferredAction::Report { id, error } => {
                let handle = OpHandle::new(shared.clone(), id);
                let hook = shared.hook.read();
                (&**hook)(&handle, &error);
            }
            DeferredAction::Release(id) => ManagerShared::release(shared, id),
            DeferredAction::Continue { link, run, value } => {
                let next = run(value);
                *link.lock() = Some(next.id());
            }
        }
    }
}

/// Mutable view handed to an operation during a poll.
pub struct OpContext<'a> {
    pub(crate) core: &'a mut ManagerCore,
    pub(crate) actions: &'a mut Vec<DeferredAction>,
    pub(crate) current: OpId,
}

impl OpContext<'_> {
    /// Id of the operation being polled
    pub fn current(&self) -> OpId {
        self.current
    }

    pub fn status(&self, id: OpId) -> OperationStatus {
        self.core
            .slot(id)
            .map(|e| e.status)
            .unwrap_or(OperationStatus::None)
    }

    pub fn progress(&self, id: OpId) -> f32 {
        self.core.slot(id).map(|e| e.progress).unwrap_or(1.0)
    }

    pub fn result(&self, id: OpId) -> Option<ResourceValue> {
        self.core.slot(id).and_then(|e| e.result.clone())
    }

    pub fn error(&self, id: OpId) -> Option<Arc<AtlasError>> {
        self.core.slot(id).and_then(|e| e.error.clone())
    }

    pub fn name(&self, id: OpId) -> String {
        self.core
            .slot(id)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| "<destroyed>".to_string())
    }

    /// Release a dependency reference once the arena lock is dropped.
    pub fn release_deferred(&mut self, id: OpId) {
        self.actions.push(DeferredAction::Release(id));
    }

    pub(crate) fn defer_continuation(
        &mut self,
        link: ChainLink,
        run: ChainContinuation,
        value: ResourceValue,
    ) {
        self.actions.push(DeferredAction::Continue { link, run, value });
    }
}

/// Schedules, polls, and completes operations; issues handles.
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::with_exception_hook(Box::new(default_exception_hook))
    }

    /// Construct with an injected exception hook. The hook is invoked for
    /// every captured operation error; there is no global handler.
    pub fn with_exception_hook(hook: ExceptionHook) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                core: Mutex::new(ManagerCore::new()),
                hook: RwLock::new(hook),
            }),
        }
    }

    /// Replace the exception hook
    pub fn set_exception_hook(&self, hook: ExceptionHook) {
        *self.shared.hook.write() = hook;
    }

    /// One cooperative pass over every in-progress operation, then the
    /// deferred callback queue.
    pub fn update(&self) {
        ManagerShared::update(&self.shared);
    }

    /// Register a custom operation. The returned handle holds one
    /// reference.
    pub fn register(&self, op: Box<dyn Operation>, name: impl Into<String>) -> OpHandle {
        let name = name.into();
        log::debug!("operation '{}' registered", name);
        let id = self.shared.core.lock().register(
            OpEntry {
                name,
                op: Some(op),
                status: OperationStatus::InProgress,
                progress: 0.0,
                result: None,
                error: None,
                ref_count: 1,
                auto_release: false,
                callbacks: Vec::new(),
            },
            true,
        );
        OpHandle::new(self.shared.clone(), id)
    }

    /// Handle that is already succeeded with `value`.
    pub fn create_completed(&self, value: ResourceValue, name: impl Into<String>) -> OpHandle {
        let id = self.shared.core.lock().register(
            OpEntry {
                name: name.into(),
                op: None,
                status: OperationStatus::Succeeded,
                progress: 1.0,
                result: Some(value),
                error: None,
                ref_count: 1,
                auto_release: false,
                callbacks: Vec::new(),
            },
            false,
        );
        OpHandle::new(self.shared.clone(), id)
    }

    /// Handle that is already failed with `error`. The error is routed
    /// through the exception hook like any captured failure.
    pub fn create_failed(&self, error: AtlasError, name: impl Into<String>) -> OpHandle {
        let error = Arc::new(error);
        let id = self.shared.core.lock().register(
            OpEntry {
                name: name.into(),
                op: None,
                status: OperationStatus::Failed,
                progress: 1.0,
                result: None,
                error: Some(error.clone()),
                ref_count: 1,
                auto_release: false,
                callbacks: Vec::new(),
            },
            false,
        );
        run_actions(&self.shared, vec![DeferredAction::Report { id, error }]);
        OpHandle::new(self.shared.clone(), id)
    }

    /// Chain: wait on `dep`, then run `continuation` to produce the next
    /// handle and wait on that. Percent complete is the average of the
    /// dependency's and the continuation's percent complete.
    pub fn create_chain(
        &self,
        dep: &OpHandle,
        name: impl Into<String>,
        continuation: ChainContinuation,
    ) -> Result<OpHandle, OperationError> {
        let dep = dep.acquire()?;
        let op = crate::chain::ChainOperation::new(dep.id(), continuation);
        Ok(self.register(Box::new(op), name))
    }

    /// Group: completes when every member completes. Percent complete is
    /// the arithmetic mean of member progress, nested groups contributing
    /// their own mean.
    pub fn create_group(
        &self,
        members: &[OpHandle],
        name: impl Into<String>,
    ) -> Result<OpHandle, OperationError> {
        let mut acquired: Vec<&OpHandle> = Vec::new();
        for m in members {
            match m.acquire() {
                Ok(_) => acquired.push(m),
                Err(e) => {
                    for a in acquired {
                        a.release();
                    }
                    return Err(e);
                }
            }
        }
        let op = crate::group::GroupOperation::new(members.iter().map(|m| m.id()).collect());
        Ok(self.register(Box::new(op), name))
    }

    /// Number of live (registered) operations; for diagnostics and tests.
    pub fn live_operation_count(&self) -> usize {
        let core = self.shared.core.lock();
        core.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn default_exception_hook(handle: &OpHandle, error: &AtlasError) {
    log::error!(
        "operation '{}' failed: {}",
        handle.name().unwrap_or_else(|| "<destroyed>".to_string()),
        error
    );
}
