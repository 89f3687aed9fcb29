//! Provider abstraction
//!
//! A provider turns one resource location into a loaded artifact, given
//! that the location's dependencies have already been provided. Providers
//! are registered into a typed table keyed by `ProviderId`; dispatch never
//! goes through runtime type names.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AtlasError, OperationError, ProviderError};
use crate::handle::OpHandle;
use crate::location::{ProviderId, ResourceLocation};
use crate::manager::{OpContext, OpId, ResourceManager};
use crate::operation::{OpPoll, Operation, OperationStatus, ResourceValue};

/// Result of polling an in-flight provide job.
pub enum JobPoll {
    Pending(f32),
    Ready(ResourceValue),
    Failed(ProviderError),
}

/// An in-flight load started by a provider. Dropped jobs must release any
/// transport or queue resources they hold.
pub trait ProvideJob: Send {
    fn poll(&mut self) -> JobPoll;
}

/// Pluggable strategy converting a resource location into an artifact.
/// The artifact's type is declared by the location, not the provider.
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    /// Start loading `location`. `deps` holds the artifacts of the
    /// location's dependencies, in dependency order.
    fn begin(
        &self,
        location: &Arc<ResourceLocation>,
        deps: &[ResourceValue],
    ) -> Result<Box<dyn ProvideJob>, ProviderError>;
}

/// Typed provider table, resolved at registration time.
#[derive(Default)]
pub struct ProviderRegistry {
    table: HashMap<ProviderId, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Register a provider under its id; a later registration replaces an
    /// earlier one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.table.insert(provider.provider_id(), provider);
    }

    pub fn get(&self, id: ProviderId) -> Result<Arc<dyn Provider>, ProviderError> {
        self.table
            .get(&id)
            .cloned()
            .ok_or(ProviderError::UnknownProvider(id))
    }

    pub fn contains(&self, id: ProviderId) -> bool {
        self.table.contains_key(&id)
    }
}

/// Operation that drives one provider over one location: waits for its
/// dependency operations, then polls the provider's job.
pub(crate) struct ProviderOperation {
    location: Arc<ResourceLocation>,
    provider: Arc<dyn Provider>,
    deps: Vec<OpId>,
    job: Option<Box<dyn ProvideJob>>,
}

impl Operation for ProviderOperation {
    fn poll(&mut self, ctx: &mut OpContext<'_>) -> OpPoll {
        if self.job.is_none() {
            let mut sum = 0.0f32;
            let mut all_done = true;
            for &d in &self.deps {
                sum += ctx.progress(d);
                match ctx.status(d) {
                    OperationStatus::Succeeded => {}
                    OperationStatus::Failed => {
                        // a simple dependency failure propagates unchanged
                        let error = ctx.error(d).unwrap_or_else(|| {
                            Arc::new(AtlasError::Operation(OperationError::InvalidHandle))
                        });
                        return OpPoll::Fault(error);
                    }
                    _ => all_done = false,
                }
            }
            if !all_done {
                return OpPoll::Pending(0.5 * sum / self.deps.len() as f32);
            }
            let dep_values: Vec<ResourceValue> = self
                .deps
                .iter()
                .map(|&d| ctx.result(d).unwrap_or_else(|| Arc::new(()) as ResourceValue))
                .collect();
            match self.provider.begin(&self.location, &dep_values) {
                Ok(job) => self.job = Some(job),
                Err(e) => return OpPoll::Fault(Arc::new(AtlasError::Provider(e))),
            }
        }

        if let Some(job) = self.job.as_mut() {
            return match job.poll() {
                JobPoll::Pending(p) => {
                    if self.deps.is_empty() {
                        OpPoll::Pending(p)
                    } else {
                        OpPoll::Pending(0.5 + 0.5 * p)
                    }
                }
                JobPoll::Ready(v) => OpPoll::Ready(v),
                JobPoll::Failed(e) => OpPoll::Fault(Arc::new(AtlasError::Provider(e))),
            };
        }
        OpPoll::Pending(0.0)
    }

    fn on_destroy(&mut self, ctx: &mut OpContext<'_>) {
        // dropping the job releases its transport/queue resources
        self.job = None;
        for &d in &self.deps {
            ctx.release_deferred(d);
        }
    }
}

impl ResourceManager {
    /// Register a provide-operation for `location`, depending on the given
    /// handles (one per dependency location, already scheduled).
    pub fn create_provider_op(
        &self,
        provider: Arc<dyn Provider>,
        location: Arc<ResourceLocation>,
        deps: &[OpHandle],
        name: impl Into<String>,
    ) -> Result<OpHandle, OperationError> {
        let mut acquired: Vec<&OpHandle> = Vec::new();
        for d in deps {
            match d.acquire() {
                Ok(_) => acquired.push(d),
                Err(e) => {
                    for a in acquired {
                        a.release();
                    }
                    return Err(e);
                }
            }
        }
        let op = ProviderOperation {
            location,
            provider,
            deps: deps.iter().map(|d| d.id()).collect(),
            job: None,
        };
        Ok(self.register(Box::new(op), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{LocationData, ResourceType};

    /// Provider whose jobs finish after a fixed number of polls with the
    /// location's primary key as a string artifact.
    struct SlowEcho {
        ticks: u32,
    }

    struct EchoJob {
        remaining: u32,
        value: String,
    }

    impl ProvideJob for EchoJob {
        fn poll(&mut self) -> JobPoll {
            if self.remaining == 0 {
                JobPoll::Ready(Arc::new(self.value.clone()))
            } else {
                self.remaining -= 1;
                JobPoll::Pending(0.3)
            }
        }
    }

    impl Provider for SlowEcho {
        fn provider_id(&self) -> ProviderId {
            ProviderId::Text
        }

        fn begin(
            &self,
            location: &Arc<ResourceLocation>,
            _deps: &[ResourceValue],
        ) -> Result<Box<dyn ProvideJob>, ProviderError> {
            Ok(Box::new(EchoJob {
                remaining: self.ticks,
                value: location.primary_key.clone(),
            }))
        }
    }

    fn text_loc(key: &str) -> Arc<ResourceLocation> {
        Arc::new(ResourceLocation::new(
            key,
            format!("remote/{key}"),
            ProviderId::Text,
            ResourceType::Text,
        ))
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(SlowEcho { ticks: 0 }));
        assert!(registry.get(ProviderId::Text).is_ok());
        assert!(matches!(
            registry.get(ProviderId::Bundle),
            Err(ProviderError::UnknownProvider(ProviderId::Bundle))
        ));
    }

    #[test]
    fn test_provider_op_completes() {
        let mgr = ResourceManager::new();
        let provider: Arc<dyn Provider> = Arc::new(SlowEcho { ticks: 2 });
        let h = mgr
            .create_provider_op(provider, text_loc("hello"), &[], "provide hello")
            .unwrap();
        h.wait_for_completion();
        assert_eq!(
            *h.clone().typed::<String>().result().unwrap(),
            "hello".to_string()
        );
    }

    #[test]
    fn test_provider_op_waits_for_dependencies() {
        let mgr = ResourceManager::new();
        let provider: Arc<dyn Provider> = Arc::new(SlowEcho { ticks: 0 });
        let dep = mgr
            .create_provider_op(
                Arc::new(SlowEcho { ticks: 3 }),
                text_loc("dep"),
                &[],
                "provide dep",
            )
            .unwrap();
        let main = mgr
            .create_provider_op(
                provider,
                Arc::new(
                    ResourceLocation::new("main", "remote/main", ProviderId::Text, ResourceType::Text)
                        .with_data(LocationData::bundle("b", "h", 1)),
                ),
                &[dep.clone()],
                "provide main",
            )
            .unwrap();

        mgr.update();
        assert_eq!(main.status(), OperationStatus::InProgress);
        main.wait_for_completion();
        // topological order: the dependency finished first
        assert_eq!(dep.status(), OperationStatus::Succeeded);
        assert_eq!(main.status(), OperationStatus::Succeeded);
    }

    #[test]
    fn test_provider_op_propagates_dep_failure_unchanged() {
        let mgr = ResourceManager::new();
        let dep = mgr.create_failed(
            AtlasError::Provider(ProviderError::UnknownProvider(ProviderId::Bundle)),
            "failed dep",
        );
        let main = mgr
            .create_provider_op(
                Arc::new(SlowEcho { ticks: 0 }),
                text_loc("main"),
                &[dep.clone()],
                "provide main",
            )
            .unwrap();
        mgr.update();
        assert_eq!(main.status(), OperationStatus::Failed);
        assert!(Arc::ptr_eq(&main.error().unwrap(), &dep.error().unwrap()));
    }
}
