//! Bundled asset provider
//!
//! Serves an asset out of an already-provided bundle dependency. The
//! host's object model is out of scope here: the artifact is a lifecycle
//! record naming the asset and its source bundle, which instance and
//! scene tracking attach to.

use std::sync::Arc;

use atlas_core::{
    JobPoll, ProvideJob, Provider, ProviderError, ProviderId, ResourceLocation, ResourceType,
    ResourceValue,
};

use crate::bundle::BundleData;

/// Artifact produced for an asset served from a bundle.
#[derive(Debug)]
pub struct LoadedAsset {
    pub primary_key: String,
    pub resource_type: ResourceType,
    /// Name of the bundle the asset was served from
    pub from_bundle: String,
}

/// Provides assets out of loaded bundle dependencies.
pub struct BundledAssetProvider;

impl Provider for BundledAssetProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::BundledAsset
    }

    fn begin(
        &self,
        location: &Arc<ResourceLocation>,
        deps: &[ResourceValue],
    ) -> Result<Box<dyn ProvideJob>, ProviderError> {
        let wanted = location.data.as_ref().map(|d| d.bundle_name.as_str());
        let bundle = deps
            .iter()
            .filter_map(|d| d.clone().downcast::<BundleData>().ok())
            .find(|b| wanted.map(|w| b.bundle_name == w).unwrap_or(true))
            .ok_or_else(|| ProviderError::BadDependency {
                provider: ProviderId::BundledAsset,
                key: location.primary_key.clone(),
                expected: ResourceType::Bundle,
            })?;

        let asset = LoadedAsset {
            primary_key: location.primary_key.clone(),
            resource_type: location.resource_type,
            from_bundle: bundle.bundle_name.clone(),
        };
        Ok(Box::new(AssetJob {
            value: Some(Arc::new(asset)),
        }))
    }
}

struct AssetJob {
    value: Option<Arc<LoadedAsset>>,
}

impl ProvideJob for AssetJob {
    fn poll(&mut self) -> JobPoll {
        match self.value.take() {
            Some(value) => JobPoll::Ready(value),
            None => JobPoll::Failed(ProviderError::BadDependency {
                provider: ProviderId::BundledAsset,
                key: String::new(),
                expected: ResourceType::Bundle,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::LocationData;

    fn asset_loc(key: &str, bundle: &str) -> Arc<ResourceLocation> {
        Arc::new(
            ResourceLocation::new(key, format!("{key}.asset"), ProviderId::BundledAsset, ResourceType::Prefab)
                .with_data(LocationData::bundle(bundle, "h1", 10)),
        )
    }

    fn bundle_value(name: &str) -> ResourceValue {
        Arc::new(BundleData {
            bundle_name: name.to_string(),
            bytes: vec![0; 10],
            from_cache: false,
        })
    }

    #[test]
    fn test_serves_asset_from_matching_bundle() {
        let provider = BundledAssetProvider;
        let loc = asset_loc("hero", "bundle_x");
        let deps = [bundle_value("other"), bundle_value("bundle_x")];

        let mut job = provider.begin(&loc, &deps).unwrap();
        match job.poll() {
            JobPoll::Ready(v) => {
                let asset = v.downcast::<LoadedAsset>().unwrap();
                assert_eq!(asset.primary_key, "hero");
                assert_eq!(asset.from_bundle, "bundle_x");
                assert_eq!(asset.resource_type, ResourceType::Prefab);
            }
            _ => panic!("expected asset"),
        }
    }

    #[test]
    fn test_missing_bundle_dependency() {
        let provider = BundledAssetProvider;
        let loc = asset_loc("hero", "bundle_x");
        let err = provider.begin(&loc, &[]).err().unwrap();
        assert!(matches!(err, ProviderError::BadDependency { .. }));
    }
}
