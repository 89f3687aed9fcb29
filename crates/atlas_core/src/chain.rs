//! Chain operation
//!
//! Waits on a dependency handle, then runs a continuation that produces
//! the next handle to wait on. Percent complete is the average of the
//! dependency's and the continuation's percent complete. A failed
//! dependency (or continuation) fails the chain with the dependency's
//! error propagated unchanged.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{AtlasError, OperationError};
use crate::manager::{ChainContinuation, ChainLink, OpContext, OpId};
use crate::operation::{OpPoll, Operation, OperationStatus};

pub(crate) struct ChainOperation {
    dep: OpId,
    continuation: Option<ChainContinuation>,
    /// Filled in by the deferred continuation once it has produced the
    /// follow-up operation.
    link: ChainLink,
    next: Option<OpId>,
}

impl ChainOperation {
    pub(crate) fn new(dep: OpId, continuation: ChainContinuation) -> Self {
        Self {
            dep,
            continuation: Some(continuation),
            link: Arc::new(Mutex::new(None)),
            next: None,
        }
    }

    fn promote_link(&mut self) {
        if self.next.is_none() {
            self.next = *self.link.lock();
        }
    }
}

impl Operation for ChainOperation {
    fn poll(&mut self, ctx: &mut OpContext<'_>) -> OpPoll {
        self.promote_link();

        if let Some(next) = self.next {
            return match ctx.status(next) {
                OperationStatus::Succeeded => match ctx.result(next) {
                    Some(v) => OpPoll::Ready(v),
                    None => OpPoll::Ready(Arc::new(())),
                },
                OperationStatus::Failed => OpPoll::Fault(dep_error(ctx, next)),
                _ => OpPoll::Pending(0.5 + 0.5 * ctx.progress(next)),
            };
        }

        match ctx.status(self.dep) {
            OperationStatus::Succeeded => {
                if let Some(run) = self.continuation.take() {
                    let value = ctx
                        .result(self.dep)
                        .unwrap_or_else(|| Arc::new(()) as crate::operation::ResourceValue);
                    ctx.defer_continuation(self.link.clone(), run, value);
                }
                OpPoll::Pending(0.5)
            }
            OperationStatus::Failed => OpPoll::Fault(dep_error(ctx, self.dep)),
            _ => OpPoll::Pending(0.5 * ctx.progress(self.dep)),
        }
    }

    fn on_destroy(&mut self, ctx: &mut OpContext<'_>) {
        self.promote_link();
        ctx.release_deferred(self.dep);
        if let Some(next) = self.next {
            ctx.release_deferred(next);
        }
    }
}

fn dep_error(ctx: &OpContext<'_>, id: OpId) -> Arc<AtlasError> {
    ctx.error(id)
        .unwrap_or_else(|| Arc::new(AtlasError::Operation(OperationError::InvalidHandle)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::WaitResult;
    use crate::manager::ResourceManager;

    /// Completes with `value` after `ticks` polls.
    struct Ticking {
        ticks: u32,
        value: i32,
    }

    impl Operation for Ticking {
        fn poll(&mut self, _ctx: &mut OpContext<'_>) -> OpPoll {
            if self.ticks == 0 {
                OpPoll::Ready(Arc::new(self.value))
            } else {
                self.ticks -= 1;
                OpPoll::Pending(0.2)
            }
        }
    }

    struct AlwaysFails;

    impl Operation for AlwaysFails {
        fn poll(&mut self, _ctx: &mut OpContext<'_>) -> OpPoll {
            OpPoll::Fault(Arc::new(AtlasError::Operation(OperationError::InvalidHandle)))
        }
    }

    #[test]
    fn test_chain_runs_continuation_after_dependency() {
        let mgr = Arc::new(ResourceManager::new());
        let dep = mgr.register(Box::new(Ticking { ticks: 2, value: 10 }), "dep");

        let mgr2 = mgr.clone();
        let chain = mgr
            .create_chain(
                &dep,
                "chain",
                Box::new(move |value| {
                    let doubled = *value.downcast::<i32>().unwrap() * 2;
                    mgr2.create_completed(Arc::new(doubled), "doubled")
                }),
            )
            .unwrap();

        match chain.wait_for_completion() {
            WaitResult::Completed(v) => assert_eq!(*v.downcast::<i32>().unwrap(), 20),
            _ => panic!("chain should complete"),
        }
        dep.release();
        chain.release();
        mgr.update();
        assert_eq!(mgr.live_operation_count(), 0);
    }

    #[test]
    fn test_chain_progress_is_average_of_halves() {
        let mgr = Arc::new(ResourceManager::new());
        let dep = mgr.register(Box::new(Ticking { ticks: 3, value: 0 }), "dep");
        let mgr2 = mgr.clone();
        let chain = mgr
            .create_chain(
                &dep,
                "chain",
                Box::new(move |_| mgr2.create_completed(Arc::new(0i32), "next")),
            )
            .unwrap();

        mgr.update();
        // dependency still pending: chain progress stays in the first half
        assert!(chain.progress() <= 0.5);
        chain.wait_for_completion();
        assert!((chain.progress() - 1.0).abs() < f32::EPSILON);
        dep.release();
        chain.release();
    }

    #[test]
    fn test_chain_propagates_dependency_error_unchanged() {
        let mgr = Arc::new(ResourceManager::new());
        let dep = mgr.register(Box::new(AlwaysFails), "dep");
        let mgr2 = mgr.clone();
        let chain = mgr
            .create_chain(
                &dep,
                "chain",
                Box::new(move |_| mgr2.create_completed(Arc::new(0i32), "unreached")),
            )
            .unwrap();

        mgr.update();
        mgr.update();
        assert_eq!(chain.status(), OperationStatus::Failed);
        // the very same captured error object, not a wrapper
        assert!(Arc::ptr_eq(&chain.error().unwrap(), &dep.error().unwrap()));
    }
}
