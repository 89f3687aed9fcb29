//! Group operation
//!
//! Completes when all member handles complete. Percent complete is the
//! arithmetic mean of member progress; a nested group contributes its own
//! mean, not a flattened average. Failure waits for every member to
//! finish, then fails naming the first failing dependency.

use std::sync::Arc;

use crate::error::{AtlasError, OperationError};
use crate::manager::{OpContext, OpId};
use crate::operation::{OpPoll, Operation, OperationStatus, ResourceValue};

/// Results of a completed group, in member order. Members that produced
/// no artifact contribute a unit value.
pub type GroupResults = Vec<ResourceValue>;

pub(crate) struct GroupOperation {
    members: Vec<OpId>,
}

impl GroupOperation {
    pub(crate) fn new(members: Vec<OpId>) -> Self {
        Self { members }
    }
}

impl Operation for GroupOperation {
    fn poll(&mut self, ctx: &mut OpContext<'_>) -> OpPoll {
        if self.members.is_empty() {
            return OpPoll::Ready(Arc::new(GroupResults::new()));
        }

        let mut sum = 0.0f32;
        let mut all_done = true;
        let mut failed: Option<(String, Arc<AtlasError>)> = None;

        for &m in &self.members {
            sum += ctx.progress(m);
            match ctx.status(m) {
                OperationStatus::Succeeded => {}
                OperationStatus::Failed => {
                    if failed.is_none() {
                        let error = ctx.error(m).unwrap_or_else(|| {
                            Arc::new(AtlasError::Operation(OperationError::InvalidHandle))
                        });
                        failed = Some((ctx.name(m), error));
                    }
                }
                _ => all_done = false,
            }
        }

        if !all_done {
            return OpPoll::Pending(sum / self.members.len() as f32);
        }

        if let Some((member, source)) = failed {
            return OpPoll::Fault(Arc::new(AtlasError::Operation(
                OperationError::GroupMemberFailed { member, source },
            )));
        }

        let results: GroupResults = self
            .members
            .iter()
            .map(|&m| ctx.result(m).unwrap_or_else(|| Arc::new(()) as ResourceValue))
            .collect();
        OpPoll::Ready(Arc::new(results))
    }

    fn on_destroy(&mut self, ctx: &mut OpContext<'_>) {
        for &m in &self.members {
            ctx.release_deferred(m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ResourceManager;

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
                OpPoll::Pending(0.0)
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
    fn test_group_waits_for_all_members() {
        let mgr = ResourceManager::new();
        let a = mgr.register(Box::new(Ticking { ticks: 1, value: 1 }), "a");
        let b = mgr.register(Box::new(Ticking { ticks: 3, value: 2 }), "b");
        let group = mgr.create_group(&[a.clone(), b.clone()], "group").unwrap();

        mgr.update();
        mgr.update();
        assert_eq!(a.status(), OperationStatus::Succeeded);
        assert_eq!(group.status(), OperationStatus::InProgress);

        group.wait_for_completion();
        let results = group.result_any().unwrap().downcast::<GroupResults>().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(*results[0].clone().downcast::<i32>().unwrap(), 1);
        assert_eq!(*results[1].clone().downcast::<i32>().unwrap(), 2);

        a.release();
        b.release();
        group.release();
        mgr.update();
        assert_eq!(mgr.live_operation_count(), 0);
    }

    #[test]
    fn test_group_progress_is_mean_of_members() {
        let mgr = ResourceManager::new();
        let done = mgr.create_completed(Arc::new(0i32), "done");
        let slow = mgr.register(Box::new(Ticking { ticks: 100, value: 0 }), "slow");
        let group = mgr.create_group(&[done.clone(), slow.clone()], "group").unwrap();

        mgr.update();
        // one member at 1.0, one at ~0.0
        assert!((group.progress() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_nested_group_contributes_its_own_mean() {
        let mgr = ResourceManager::new();
        let done_a = mgr.create_completed(Arc::new(0i32), "a");
        let slow = mgr.register(Box::new(Ticking { ticks: 100, value: 0 }), "slow");
        let inner = mgr.create_group(&[done_a.clone(), slow.clone()], "inner").unwrap();
        let done_b = mgr.create_completed(Arc::new(0i32), "b");
        let outer = mgr.create_group(&[inner.clone(), done_b.clone()], "outer").unwrap();

        mgr.update();
        mgr.update();
        // inner mean = 0.5, outer mean = (0.5 + 1.0) / 2 = 0.75;
        // a flattened average over {1.0, 0.0, 1.0} would be ~0.67
        assert!((outer.progress() - 0.75).abs() < 0.02);
    }

    #[test]
    fn test_group_failure_names_failing_member() {
        let mgr = ResourceManager::new();
        let good = mgr.create_completed(Arc::new(0i32), "good-op");
        let bad = mgr.register(Box::new(AlwaysFails), "bad-op");
        let group = mgr.create_group(&[good.clone(), bad.clone()], "group").unwrap();

        mgr.update();
        mgr.update();
        assert_eq!(group.status(), OperationStatus::Failed);
        let msg = group.error().unwrap().to_string();
        assert!(msg.contains("bad-op"), "diagnostic must name the member: {msg}");
    }

    #[test]
    fn test_empty_group_completes_immediately() {
        let mgr = ResourceManager::new();
        let group = mgr.create_group(&[], "empty").unwrap();
        mgr.update();
        assert_eq!(group.status(), OperationStatus::Succeeded);
    }
}
