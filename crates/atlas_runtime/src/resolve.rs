//! Key resolution and merge-mode set algebra
//!
//! Locators are consulted in registration order. Multi-key requests merge
//! per-key result sets under a caller-chosen mode; every failure path
//! composes a diagnostic naming which keys had no locations, which
//! resolved to an incompatible type, and which partial results exist
//! under a different type.

use std::collections::HashSet;
use std::sync::Arc;

use atlas_core::{
    InvalidKeyError, LocationIdentity, Locator, MergeMode, ResourceKey, ResourceLocation,
    ResourceType,
};

enum KeyResolution {
    Found(Vec<Arc<ResourceLocation>>),
    Missing,
    WrongType { found: ResourceType },
}

fn resolve_one(
    locators: &[Arc<dyn Locator>],
    key: &ResourceKey,
    requested: Option<ResourceType>,
) -> KeyResolution {
    for locator in locators {
        let found = locator.locate(key, requested);
        if !found.is_empty() {
            return KeyResolution::Found(found);
        }
    }
    if requested.is_some() {
        for locator in locators {
            let untyped = locator.locate(key, None);
            if let Some(first) = untyped.first() {
                return KeyResolution::WrongType {
                    found: first.resource_type,
                };
            }
        }
    }
    KeyResolution::Missing
}

/// Resolve a single key.
pub fn resolve_key(
    locators: &[Arc<dyn Locator>],
    key: &ResourceKey,
    requested: Option<ResourceType>,
) -> Result<Vec<Arc<ResourceLocation>>, InvalidKeyError> {
    match (resolve_one(locators, key, requested), requested) {
        (KeyResolution::Found(locations), _) => Ok(locations),
        (KeyResolution::WrongType { found }, Some(ty)) => Err(InvalidKeyError::TypeMismatch {
            key: key.to_string(),
            requested: ty,
            found,
        }),
        _ => Err(InvalidKeyError::NoLocation {
            key: key.to_string(),
            requested,
        }),
    }
}

/// Resolve one or more keys under an optional merge mode.
///
/// Multiple keys without a mode is its own error, distinct from
/// "resolved and empty".
pub fn resolve_keys(
    locators: &[Arc<dyn Locator>],
    keys: &[ResourceKey],
    mode: Option<MergeMode>,
    requested: Option<ResourceType>,
) -> Result<Vec<Arc<ResourceLocation>>, InvalidKeyError> {
    match keys {
        [] => Err(InvalidKeyError::NoLocation {
            key: "<no keys>".to_string(),
            requested,
        }),
        [single] => resolve_key(locators, single, requested),
        _ => {
            let Some(mode) = mode else {
                return Err(InvalidKeyError::MissingMergeMode {
                    key_count: keys.len(),
                });
            };
            let resolutions: Vec<(&ResourceKey, KeyResolution)> = keys
                .iter()
                .map(|k| (k, resolve_one(locators, k, requested)))
                .collect();
            match mode {
                MergeMode::UseFirst => merge_use_first(requested, &resolutions),
                MergeMode::Union => merge_union(requested, &resolutions),
                MergeMode::Intersection => {
                    merge_intersection(locators, keys, requested, &resolutions)
                }
            }
        }
    }
}

fn describe(key: &ResourceKey, resolution: &KeyResolution) -> String {
    match resolution {
        KeyResolution::Found(locations) => {
            format!("key '{key}' resolved to {} location(s)", locations.len())
        }
        KeyResolution::Missing => format!("key '{key}' has no locations"),
        KeyResolution::WrongType { found } => {
            format!("key '{key}' resolved to incompatible type {found:?}")
        }
    }
}

fn merge_use_first(
    requested: Option<ResourceType>,
    resolutions: &[(&ResourceKey, KeyResolution)],
) -> Result<Vec<Arc<ResourceLocation>>, InvalidKeyError> {
    for (_, resolution) in resolutions {
        if let KeyResolution::Found(locations) = resolution {
            return Ok(locations.clone());
        }
    }
    Err(InvalidKeyError::Merge {
        mode: MergeMode::UseFirst,
        requested,
        details: resolutions.iter().map(|(k, r)| describe(k, r)).collect(),
    })
}

fn merge_union(
    requested: Option<ResourceType>,
    resolutions: &[(&ResourceKey, KeyResolution)],
) -> Result<Vec<Arc<ResourceLocation>>, InvalidKeyError> {
    let mut out: Vec<Arc<ResourceLocation>> = Vec::new();
    let mut seen: HashSet<LocationIdentity> = HashSet::new();
    let mut any_mismatch = false;

    for (_, resolution) in resolutions {
        match resolution {
            KeyResolution::Found(locations) => {
                for location in locations {
                    if seen.insert(location.identity()) {
                        out.push(location.clone());
                    }
                }
            }
            KeyResolution::Missing => {}
            KeyResolution::WrongType { .. } => any_mismatch = true,
        }
    }

    // a key with no locations does not prevent union success, but an
    // incompatible-typed key does, and the diagnostic names every key
    if any_mismatch || out.is_empty() {
        return Err(InvalidKeyError::Merge {
            mode: MergeMode::Union,
            requested,
            details: resolutions.iter().map(|(k, r)| describe(k, r)).collect(),
        });
    }
    Ok(out)
}

fn merge_intersection(
    locators: &[Arc<dyn Locator>],
    keys: &[ResourceKey],
    requested: Option<ResourceType>,
    resolutions: &[(&ResourceKey, KeyResolution)],
) -> Result<Vec<Arc<ResourceLocation>>, InvalidKeyError> {
    let mut sets: Vec<&Vec<Arc<ResourceLocation>>> = Vec::new();
    let mut broken: Vec<String> = Vec::new();
    for (key, resolution) in resolutions {
        match resolution {
            KeyResolution::Found(locations) => sets.push(locations),
            other => broken.push(describe(key, other)),
        }
    }

    let mut details = if broken.is_empty() {
        let identity_sets: Vec<HashSet<LocationIdentity>> = sets
            .iter()
            .skip(1)
            .map(|s| s.iter().map(|l| l.identity()).collect())
            .collect();
        let out: Vec<Arc<ResourceLocation>> = sets[0]
            .iter()
            .filter(|l| {
                let id = l.identity();
                identity_sets.iter().all(|s| s.contains(&id))
            })
            .cloned()
            .collect();
        if !out.is_empty() {
            return Ok(out);
        }
        vec!["the intersection of the requested keys is empty".to_string()]
    } else {
        broken
    };

    if let Some(ty) = alternate_intersection_type(locators, keys, requested) {
        details.push(format!("an Intersection exists for type {ty:?}"));
    }
    Err(InvalidKeyError::Merge {
        mode: MergeMode::Intersection,
        requested,
        details,
    })
}

/// Whether a non-empty intersection exists under some other type.
fn alternate_intersection_type(
    locators: &[Arc<dyn Locator>],
    keys: &[ResourceKey],
    requested: Option<ResourceType>,
) -> Option<ResourceType> {
    let per_key: Vec<Vec<Arc<ResourceLocation>>> = keys
        .iter()
        .map(|k| match resolve_one(locators, k, None) {
            KeyResolution::Found(locations) => locations,
            _ => Vec::new(),
        })
        .collect();

    let candidate_types: HashSet<ResourceType> = per_key
        .iter()
        .flatten()
        .map(|l| l.resource_type)
        .collect();

    for ty in candidate_types {
        if Some(ty) == requested {
            continue;
        }
        let typed_sets: Vec<HashSet<LocationIdentity>> = per_key
            .iter()
            .map(|locations| {
                locations
                    .iter()
                    .filter(|l| l.resource_type == ty)
                    .map(|l| l.identity())
                    .collect()
            })
            .collect();
        if typed_sets.is_empty() || typed_sets.iter().any(|s: &HashSet<_>| s.is_empty()) {
            continue;
        }
        let first = &typed_sets[0];
        if first
            .iter()
            .any(|id| typed_sets.iter().all(|s| s.contains(id)))
        {
            return Some(ty);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{LocationMap, ProviderId};

    fn loc(key: &str, ty: ResourceType) -> Arc<ResourceLocation> {
        Arc::new(ResourceLocation::new(
            key,
            format!("remote/{key}"),
            ProviderId::Text,
            ty,
        ))
    }

    /// Locator with: "a" (Text), "b" (Text), label "ab" covering both,
    /// "p" (Prefab), and label "bp" covering b and p.
    fn fixture() -> Vec<Arc<dyn Locator>> {
        let mut map = LocationMap::new("fixture");
        let a = loc("a", ResourceType::Text);
        let b = loc("b", ResourceType::Text);
        let p = loc("p", ResourceType::Prefab);
        map.insert(ResourceKey::address("a"), a.clone());
        map.insert(ResourceKey::address("b"), b.clone());
        map.insert(ResourceKey::label("ab"), a.clone());
        map.insert(ResourceKey::label("ab"), b.clone());
        map.insert(ResourceKey::address("p"), p.clone());
        map.insert(ResourceKey::label("bp"), b.clone());
        map.insert(ResourceKey::label("bp"), p.clone());
        vec![Arc::new(map)]
    }

    #[test]
    fn test_single_key_resolution() {
        let locators = fixture();
        let found = resolve_key(&locators, &ResourceKey::address("a"), Some(ResourceType::Text))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].primary_key, "a");
    }

    #[test]
    fn test_single_key_type_mismatch_diagnostic() {
        let locators = fixture();
        let err = resolve_key(&locators, &ResourceKey::address("p"), Some(ResourceType::Text))
            .unwrap_err();
        match &err {
            InvalidKeyError::TypeMismatch { found, .. } => {
                assert_eq!(*found, ResourceType::Prefab);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_merge_mode_is_distinct_error() {
        let locators = fixture();
        let keys = [ResourceKey::address("a"), ResourceKey::address("b")];
        let err = resolve_keys(&locators, &keys, None, None).unwrap_err();
        assert!(matches!(err, InvalidKeyError::MissingMergeMode { key_count: 2 }));
    }

    #[test]
    fn test_use_first_returns_first_nonempty() {
        let locators = fixture();
        let keys = [ResourceKey::address("missing"), ResourceKey::address("a")];
        let found =
            resolve_keys(&locators, &keys, Some(MergeMode::UseFirst), Some(ResourceType::Text))
                .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].primary_key, "a");
    }

    #[test]
    fn test_union_is_superset_of_contributors() {
        let locators = fixture();
        let keys = [ResourceKey::address("a"), ResourceKey::label("ab")];
        let union =
            resolve_keys(&locators, &keys, Some(MergeMode::Union), Some(ResourceType::Text))
                .unwrap();
        // a ∪ {a, b} = {a, b}, deduped by identity
        assert_eq!(union.len(), 2);
        let a = resolve_key(&locators, &ResourceKey::address("a"), Some(ResourceType::Text))
            .unwrap();
        for location in &a {
            assert!(union.iter().any(|u| u.identity() == location.identity()));
        }
    }

    #[test]
    fn test_union_tolerates_missing_key() {
        let locators = fixture();
        let keys = [ResourceKey::address("a"), ResourceKey::address("missing")];
        let union =
            resolve_keys(&locators, &keys, Some(MergeMode::Union), Some(ResourceType::Text))
                .unwrap();
        assert_eq!(union.len(), 1);
    }

    #[test]
    fn test_union_type_mismatch_names_both_keys() {
        let locators = fixture();
        // "p" is a Prefab, "b" is a Text; requesting Text must fail and
        // the diagnostic must name the incompatible key and the good one
        let keys = [ResourceKey::address("p"), ResourceKey::address("b")];
        let err =
            resolve_keys(&locators, &keys, Some(MergeMode::Union), Some(ResourceType::Text))
                .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'p'"), "must name the mismatching key: {msg}");
        assert!(msg.contains("Prefab"), "must name the found type: {msg}");
        assert!(msg.contains("'b'"), "must mention the other key: {msg}");
    }

    #[test]
    fn test_intersection_subset_property() {
        let locators = fixture();
        let keys = [ResourceKey::label("ab"), ResourceKey::label("bp")];
        let intersection = resolve_keys(&locators, &keys, Some(MergeMode::Intersection), None)
            .unwrap();
        // {a, b} ∩ {b, p} = {b}
        assert_eq!(intersection.len(), 1);
        assert_eq!(intersection[0].primary_key, "b");
    }

    #[test]
    fn test_intersection_names_breaking_key() {
        let locators = fixture();
        let keys = [ResourceKey::address("a"), ResourceKey::address("missing")];
        let err = resolve_keys(&locators, &keys, Some(MergeMode::Intersection), None)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'missing'"), "must name the breaking key: {msg}");
    }

    #[test]
    fn test_intersection_reports_alternate_type() {
        let locators = fixture();
        // both labels share "b", but only under Text; requesting Prefab
        // fails and the diagnostic points at the type that would work
        let keys = [ResourceKey::label("ab"), ResourceKey::label("bp")];
        let err =
            resolve_keys(&locators, &keys, Some(MergeMode::Intersection), Some(ResourceType::Prefab))
                .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Intersection exists for type Text"), "{msg}");
    }

    #[test]
    fn test_empty_key_list() {
        let locators = fixture();
        assert!(resolve_keys(&locators, &[], None, None).is_err());
    }
}
