//! Operation handles - caller-facing views with explicit reference counts
//!
//! A handle is a view onto a shared operation slot. Cloning a handle is a
//! cheap view copy and does not touch the reference count; ownership is
//! explicit through `acquire` and `release`, and the operation is torn
//! down when the count reaches zero. Releasing an invalid handle is
//! reported through the manager's exception hook, not silently ignored.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{AtlasError, OperationError};
use crate::manager::{ManagerShared, OpId};
use crate::operation::{OperationStatus, ResourceValue};

/// Outcome of a synchronous wait.
pub enum WaitResult {
    /// The operation succeeded; the artifact is returned directly
    Completed(ResourceValue),
    /// The operation failed; the captured error is surfaced via the handle
    Faulted(Arc<AtlasError>),
    /// The operation reached a documented partial-progress checkpoint that
    /// requires a host-driven step (scene activation); waiting further
    /// would never terminate
    Checkpoint(f32),
}

impl WaitResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Untyped handle to an operation.
#[derive(Clone)]
pub struct OpHandle {
    pub(crate) shared: Arc<ManagerShared>,
    pub(crate) id: OpId,
}

impl OpHandle {
    pub(crate) fn new(shared: Arc<ManagerShared>, id: OpId) -> Self {
        Self { shared, id }
    }

    /// Slot identity of the viewed operation
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Whether the operation is still registered with its manager
    pub fn is_valid(&self) -> bool {
        self.shared.is_valid(self.id)
    }

    pub fn status(&self) -> OperationStatus {
        self.shared.status_of(self.id)
    }

    /// Progress in `[0, 1]`, monotonically non-decreasing while in progress
    pub fn progress(&self) -> f32 {
        self.shared.progress_of(self.id)
    }

    /// Debug name given at registration
    pub fn name(&self) -> Option<String> {
        self.shared.name_of(self.id)
    }

    /// Outstanding acquisitions of the underlying operation
    pub fn reference_count(&self) -> u32 {
        self.shared.ref_count_of(self.id)
    }

    /// Type-erased result, present once the operation has succeeded
    pub fn result_any(&self) -> Option<ResourceValue> {
        self.shared.result_of(self.id)
    }

    /// Captured error, present once the operation has failed
    pub fn error(&self) -> Option<Arc<AtlasError>> {
        self.shared.error_of(self.id)
    }

    /// Increment the reference count and return the same logical handle.
    pub fn acquire(&self) -> Result<OpHandle, OperationError> {
        self.shared.acquire(self.id)?;
        Ok(self.clone())
    }

    /// Decrement the reference count. At zero the operation is destroyed
    /// (immediately if terminal, on completion otherwise) and every handle
    /// viewing it becomes invalid.
    pub fn release(&self) {
        ManagerShared::release(&self.shared, self.id);
    }

    /// Register a completion callback, fired through the manager's
    /// deferred queue. Fires on the next `update` if already terminal.
    pub fn on_complete(&self, cb: impl FnOnce(&OpHandle) + Send + 'static) {
        ManagerShared::on_complete(&self.shared, self.id, Box::new(cb));
    }

    /// Arrange for the operation to release itself exactly once on
    /// completion, regardless of caller-held count.
    pub fn mark_auto_release(&self) {
        ManagerShared::mark_auto_release(&self.shared, self.id);
    }

    /// Pump the manager until this operation is terminal, then return its
    /// result. Stops at the operation's wait checkpoint when it documents
    /// one, so waits never deadlock on host-driven completion steps.
    pub fn wait_for_completion(&self) -> WaitResult {
        ManagerShared::wait_for_completion(&self.shared, self.id)
    }

    /// View this handle as producing a `T`
    pub fn typed<T: Send + Sync + 'static>(self) -> Handle<T> {
        Handle {
            inner: self,
            _marker: PhantomData,
        }
    }
}

impl core::fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("refs", &self.reference_count())
            .finish()
    }
}

/// Typed handle to an operation producing a `T`.
#[derive(Clone)]
pub struct Handle<T> {
    inner: OpHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Handle<T> {
    pub fn untyped(&self) -> &OpHandle {
        &self.inner
    }

    pub fn into_untyped(self) -> OpHandle {
        self.inner
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn status(&self) -> OperationStatus {
        self.inner.status()
    }

    pub fn progress(&self) -> f32 {
        self.inner.progress()
    }

    pub fn error(&self) -> Option<Arc<AtlasError>> {
        self.inner.error()
    }

    /// Typed result; `None` until succeeded or if the artifact is not a `T`
    pub fn result(&self) -> Option<Arc<T>> {
        self.inner
            .result_any()
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub fn acquire(&self) -> Result<Handle<T>, OperationError> {
        let inner = self.inner.acquire()?;
        Ok(Handle {
            inner,
            _marker: PhantomData,
        })
    }

    pub fn release(&self) {
        self.inner.release();
    }

    pub fn wait_for_completion(&self) -> WaitResult {
        self.inner.wait_for_completion()
    }
}

impl<T> core::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.inner, f)
    }
}
