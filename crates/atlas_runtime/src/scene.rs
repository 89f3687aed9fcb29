//! Scene and instance lifecycle
//!
//! The host's scene graph is out of scope; the runtime tracks lifecycle
//! records only. Scene loads hold at a progress checkpoint until the host
//! activates them, unloads are always asynchronous and chain behind an
//! in-flight load, and instance operations live in the pooled arena whose
//! generation counter guarantees a recycled slot starts from clean state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use atlas_core::{
    AtlasError, OpContext, OpHandle, OpId, OpPoll, Operation, OperationError, OperationStatus,
    ProviderError, ProviderId, ResourceKey, ResourceType, ResourceValue,
};
use atlas_provider::LoadedAsset;

use crate::atlas::Atlas;
use crate::resolve;

/// Progress at which a synchronous wait on a pending-activation scene
/// load stops; completing past it requires the host to activate.
pub const SCENE_ACTIVATION_CHECKPOINT: f32 = 0.9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadSceneMode {
    /// Replace the current scene content
    #[default]
    Single,
    /// Load alongside already-loaded scenes
    Additive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnloadSceneOptions {
    #[default]
    None,
    /// Also tear down objects embedded in the scene
    UnloadAllEmbeddedSceneObjects,
}

struct SceneState {
    activated: bool,
    unloaded: bool,
}

/// Lifecycle record of a loaded scene.
pub struct SceneInstance {
    pub scene_key: String,
    pub mode: LoadSceneMode,
    state: Mutex<SceneState>,
}

impl SceneInstance {
    fn new(scene_key: String, mode: LoadSceneMode) -> Self {
        Self {
            scene_key,
            mode,
            state: Mutex::new(SceneState {
                activated: false,
                unloaded: false,
            }),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.state.lock().activated
    }

    pub fn is_unloaded(&self) -> bool {
        self.state.lock().unloaded
    }

    fn mark_activated(&self) {
        self.state.lock().activated = true;
    }

    fn mark_unloaded(&self) {
        self.state.lock().unloaded = true;
    }
}

/// Lifecycle record of an instantiated object.
pub struct InstanceData {
    pub instance_id: u64,
    pub asset: Arc<LoadedAsset>,
    /// Scene the instance currently belongs to
    scene: Mutex<Option<String>>,
}

impl InstanceData {
    pub fn scene(&self) -> Option<String> {
        self.scene.lock().clone()
    }

    pub fn set_scene(&self, scene: Option<String>) {
        *self.scene.lock() = scene;
    }
}

/// Load the dependency, then instantiate it. Instances are pooled through
/// the operation arena: a freed slot's generation bump means a recycled
/// instance can never surface stale scene membership.
struct InstanceOperation {
    dep: OpId,
    instance_id: u64,
}

impl Operation for InstanceOperation {
    fn poll(&mut self, ctx: &mut OpContext<'_>) -> OpPoll {
        match ctx.status(self.dep) {
            OperationStatus::Succeeded => {
                let Some(asset) = ctx.result(self.dep).and_then(|v| v.downcast::<LoadedAsset>().ok())
                else {
                    return OpPoll::Fault(Arc::new(AtlasError::Provider(
                        ProviderError::BadDependency {
                            provider: ProviderId::BundledAsset,
                            key: format!("instance #{}", self.instance_id),
                            expected: ResourceType::Prefab,
                        },
                    )));
                };
                OpPoll::Ready(Arc::new(InstanceData {
                    instance_id: self.instance_id,
                    asset,
                    scene: Mutex::new(None),
                }))
            }
            OperationStatus::Failed => OpPoll::Fault(dep_error(ctx, self.dep)),
            _ => OpPoll::Pending(0.9 * ctx.progress(self.dep)),
        }
    }

    fn on_destroy(&mut self, ctx: &mut OpContext<'_>) {
        ctx.release_deferred(self.dep);
    }
}

/// Wait for the scene's bundle dependencies, then hold at the activation
/// checkpoint until the host activates (or complete straight through with
/// `activate_on_load`).
struct SceneLoadOperation {
    dep: OpId,
    scene_key: String,
    mode: LoadSceneMode,
    activate_on_load: bool,
    activation: Arc<AtomicBool>,
    instance: Option<Arc<SceneInstance>>,
}

impl Operation for SceneLoadOperation {
    fn poll(&mut self, ctx: &mut OpContext<'_>) -> OpPoll {
        match ctx.status(self.dep) {
            OperationStatus::Failed => return OpPoll::Fault(dep_error(ctx, self.dep)),
            OperationStatus::Succeeded => {}
            _ => return OpPoll::Pending(SCENE_ACTIVATION_CHECKPOINT * ctx.progress(self.dep)),
        }
        let instance = self
            .instance
            .get_or_insert_with(|| {
                Arc::new(SceneInstance::new(self.scene_key.clone(), self.mode))
            })
            .clone();
        if self.activate_on_load || self.activation.load(Ordering::SeqCst) {
            instance.mark_activated();
            OpPoll::Ready(instance)
        } else {
            OpPoll::Pending(SCENE_ACTIVATION_CHECKPOINT)
        }
    }

    fn wait_checkpoint(&self) -> Option<f32> {
        // once activation is granted the operation can finish on its own
        if self.activate_on_load || self.activation.load(Ordering::SeqCst) {
            None
        } else {
            Some(SCENE_ACTIVATION_CHECKPOINT)
        }
    }

    fn on_destroy(&mut self, ctx: &mut OpContext<'_>) {
        ctx.release_deferred(self.dep);
    }
}

/// Marks the scene unloaded once the load it chains behind is terminal.
/// Unloading is always asynchronous: a synchronous wait stops at the
/// zero checkpoint instead of completing the unload.
struct SceneUnloadOperation {
    load: OpId,
    options: UnloadSceneOptions,
}

impl Operation for SceneUnloadOperation {
    fn poll(&mut self, ctx: &mut OpContext<'_>) -> OpPoll {
        match ctx.status(self.load) {
            // load already gone: nothing to unload
            OperationStatus::None => OpPoll::Ready(Arc::new(()) as ResourceValue),
            OperationStatus::Failed => OpPoll::Ready(Arc::new(()) as ResourceValue),
            OperationStatus::Succeeded => {
                if let Some(instance) =
                    ctx.result(self.load).and_then(|v| v.downcast::<SceneInstance>().ok())
                {
                    if self.options == UnloadSceneOptions::UnloadAllEmbeddedSceneObjects {
                        log::debug!(
                            "unloading scene '{}' including embedded objects",
                            instance.scene_key
                        );
                    }
                    instance.mark_unloaded();
                }
                OpPoll::Ready(Arc::new(()) as ResourceValue)
            }
            // chained: the unload never interleaves with the load
            _ => OpPoll::Pending(0.5 * ctx.progress(self.load)),
        }
    }

    fn wait_checkpoint(&self) -> Option<f32> {
        Some(0.0)
    }

    fn on_destroy(&mut self, ctx: &mut OpContext<'_>) {
        ctx.release_deferred(self.load);
    }
}

fn dep_error(ctx: &OpContext<'_>, id: OpId) -> Arc<AtlasError> {
    ctx.error(id)
        .unwrap_or_else(|| Arc::new(AtlasError::Operation(OperationError::InvalidHandle)))
}

impl Atlas {
    /// Load a key's asset and instantiate it. The handle's result is an
    /// [`InstanceData`].
    pub fn instantiate(&self, key: &ResourceKey) -> OpHandle {
        let dep = self.load_asset(key, None);
        let instance_id = self.instance_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if dep.acquire().is_err() {
            return self.manager().create_failed(
                AtlasError::Operation(OperationError::InvalidHandle),
                format!("instantiate {key}"),
            );
        }
        let handle = self.manager().register(
            Box::new(InstanceOperation {
                dep: dep.id(),
                instance_id,
            }),
            format!("instantiate {key}"),
        );
        dep.release();
        handle
    }

    /// Tear down an instance: releases the handle, which releases the
    /// underlying asset dependency at zero.
    pub fn release_instance(&self, handle: &OpHandle) {
        handle.release();
    }

    /// Load a scene's bundle dependencies, then wait for activation.
    /// The handle's result is a [`SceneInstance`].
    pub fn load_scene(
        self: &Arc<Self>,
        key: &ResourceKey,
        mode: LoadSceneMode,
        activate_on_load: bool,
    ) -> OpHandle {
        let name = format!("load scene {key}");
        let locators = self.locator_snapshot();
        let location = match resolve::resolve_key(&locators, key, Some(ResourceType::SceneRef)) {
            Ok(locations) => locations[0].clone(),
            Err(e) => return self.manager().create_failed(AtlasError::InvalidKey(e), name),
        };

        let dep_handles: Vec<OpHandle> = location
            .dependencies
            .iter()
            .map(|dep| self.provide_location(dep))
            .collect();
        let deps = match self
            .manager()
            .create_group(&dep_handles, format!("scene deps {key}"))
        {
            Ok(g) => g,
            Err(e) => {
                for dep in &dep_handles {
                    dep.release();
                }
                return self.manager().create_failed(AtlasError::Operation(e), name);
            }
        };
        for dep in &dep_handles {
            dep.release();
        }

        let activation = Arc::new(AtomicBool::new(false));
        if deps.acquire().is_err() {
            return self
                .manager()
                .create_failed(AtlasError::Operation(OperationError::InvalidHandle), name);
        }
        let handle = self.manager().register(
            Box::new(SceneLoadOperation {
                dep: deps.id(),
                scene_key: key.to_string(),
                mode,
                activate_on_load,
                activation: activation.clone(),
                instance: None,
            }),
            name,
        );
        deps.release();

        self.scene_activations
            .lock()
            .insert(handle.id(), (handle.clone(), activation));
        let this = self.clone();
        handle.on_complete(move |h| {
            this.scene_activations.lock().remove(&h.id());
        });
        handle
    }

    /// Allow a pending scene load past the activation checkpoint.
    /// Returns false when the handle is not a pending scene load.
    pub fn activate_scene(&self, handle: &OpHandle) -> bool {
        match self.scene_activations.lock().get(&handle.id()) {
            Some((_, flag)) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Unload a scene. Requested while the load is still in flight, the
    /// unload chains behind it and never interleaves. Unloading an
    /// already-released handle is an idempotent no-op, not an error.
    pub fn unload_scene(
        &self,
        scene_handle: &OpHandle,
        options: UnloadSceneOptions,
        auto_release: bool,
    ) -> OpHandle {
        if scene_handle.acquire().is_err() {
            let handle = self
                .manager()
                .create_completed(Arc::new(()) as ResourceValue, "unload scene (already released)");
            if auto_release {
                handle.mark_auto_release();
            }
            return handle;
        }
        let handle = self.manager().register(
            Box::new(SceneUnloadOperation {
                load: scene_handle.id(),
                options,
            }),
            "unload scene",
        );
        if auto_release {
            handle.mark_auto_release();
        }
        handle
    }
}
