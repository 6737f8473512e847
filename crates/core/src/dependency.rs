//! Dependency map - which upstream inputs a run generation is waiting on.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Proof that an upstream dependency is ready to consume.
///
/// The token is opaque to the merge logic. Upstream producers typically send
/// `{"runId": "...", "s3Path": "..."}` or a bare run identifier. JSON `null` is
/// reserved for "not yet satisfied" and can never be a fulfillment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Fulfillment(serde_json::Value);

impl Fulfillment {
    /// Wrap a JSON token. Returns `None` for `null`.
    pub fn new(value: serde_json::Value) -> Option<Self> {
        if value.is_null() {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Fulfillment for an upstream run, optionally with its data location.
    pub fn upstream_run(run_id: impl Into<String>, location: Option<String>) -> Self {
        let mut token = serde_json::Map::new();
        token.insert("runId".to_string(), serde_json::Value::String(run_id.into()));
        if let Some(location) = location {
            token.insert("s3Path".to_string(), serde_json::Value::String(location));
        }
        Self(serde_json::Value::Object(token))
    }

    /// The raw token.
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<&str> for Fulfillment {
    fn from(run_id: &str) -> Self {
        Self(serde_json::Value::String(run_id.to_string()))
    }
}

impl From<String> for Fulfillment {
    fn from(run_id: String) -> Self {
        Self(serde_json::Value::String(run_id))
    }
}

impl<'de> Deserialize<'de> for Fulfillment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Fulfillment::new(value)
            .ok_or_else(|| serde::de::Error::custom("fulfillment token must not be null"))
    }
}

/// Ordered mapping from dependency name to its fulfillment.
///
/// `None` is the explicit "unfulfilled" slot; a dependency is never implied by
/// a missing key. Serialized as a JSON object with `null` for open slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyMap(BTreeMap<String, Option<Fulfillment>>);

impl DependencyMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map with every named dependency unfulfilled.
    pub fn pending<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(|name| (name.into(), None)).collect())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: Option<Fulfillment>) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Insert or replace a slot.
    pub fn insert(&mut self, name: impl Into<String>, value: Option<Fulfillment>) {
        self.0.insert(name.into(), value);
    }

    /// Look up a slot. Outer `None` means the key is not tracked.
    pub fn get(&self, name: &str) -> Option<&Option<Fulfillment>> {
        self.0.get(name)
    }

    /// Whether `name` is a tracked dependency.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of tracked dependencies.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no dependency is tracked.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every tracked dependency is fulfilled.
    pub fn is_complete(&self) -> bool {
        self.0.values().all(Option::is_some)
    }

    /// Names of dependencies still unfulfilled.
    pub fn unfulfilled(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Iterate slots in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Fulfillment>)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    /// Fill open slots from `incoming`.
    ///
    /// Only keys already tracked are considered and fulfilled slots are never
    /// overwritten. Returns whether anything changed.
    pub fn fill_open_slots(&mut self, incoming: &DependencyMap) -> bool {
        let mut changed = false;
        for (name, slot) in self.0.iter_mut() {
            if slot.is_some() {
                continue;
            }
            if let Some(Some(value)) = incoming.0.get(name) {
                *slot = Some(value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Seed for a new generation: this map with every fulfilled value of
    /// `incoming` overlaid.
    ///
    /// Unfulfilled incoming entries leave the map untouched, so a key only
    /// becomes an open slot of the new generation if this map tracks it.
    pub fn overlaid_with(&self, incoming: &DependencyMap) -> DependencyMap {
        let mut seeded = self.clone();
        for (name, value) in &incoming.0 {
            if let Some(value) = value {
                seeded.0.insert(name.clone(), Some(value.clone()));
            }
        }
        seeded
    }
}

impl FromIterator<(String, Option<Fulfillment>)> for DependencyMap {
    fn from_iter<T: IntoIterator<Item = (String, Option<Fulfillment>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for DependencyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DependencyMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        Ok(Self(
            raw.into_iter()
                .map(|(name, value)| (name, Fulfillment::new(value)))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> DependencyMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_null_is_open_slot() {
        let deps = map(json!({"dep1": null, "dep2": "run1"}));
        assert_eq!(deps.len(), 2);
        assert_eq!(deps.get("dep1"), Some(&None));
        assert_eq!(deps.unfulfilled(), vec!["dep1"]);
        assert!(!deps.is_complete());
        assert_eq!(serde_json::to_value(&deps).unwrap(), json!({"dep1": null, "dep2": "run1"}));
    }

    #[test]
    fn test_empty_map_is_complete() {
        assert!(DependencyMap::new().is_complete());
    }

    #[test]
    fn test_fill_never_overwrites() {
        let mut deps = map(json!({"dep1": "run123", "dep2": null}));
        let changed = deps.fill_open_slots(&map(json!({"dep1": "run999", "dep2": "run5"})));
        assert!(changed);
        assert_eq!(deps, map(json!({"dep1": "run123", "dep2": "run5"})));
    }

    #[test]
    fn test_fill_ignores_untracked_keys() {
        let mut deps = map(json!({"dep1": null}));
        let changed = deps.fill_open_slots(&map(json!({"other": "run1"})));
        assert!(!changed);
        assert!(!deps.contains("other"));
    }

    #[test]
    fn test_fill_is_idempotent() {
        let incoming = map(json!({"dep1": "a"}));
        let mut once = map(json!({"dep1": null, "dep2": null}));
        once.fill_open_slots(&incoming);
        let mut twice = once.clone();
        assert!(!twice.fill_open_slots(&incoming));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_overlay_for_rollover() {
        let prior = map(json!({"dep1": "run123", "dep2": "run7"}));
        let seeded = prior.overlaid_with(&map(json!({"dep1": "run999", "dep2": null})));
        assert_eq!(seeded, map(json!({"dep1": "run999", "dep2": "run7"})));
    }

    #[test]
    fn test_overlay_skips_untracked_open_slots() {
        let prior = map(json!({"dep1": "run123"}));
        let seeded = prior.overlaid_with(&map(json!({"dep1": "run999", "dep2": null})));
        assert_eq!(seeded, map(json!({"dep1": "run999"})));
        assert!(seeded.is_complete());

        let seeded = DependencyMap::new().overlaid_with(&map(json!({"dep1": null, "dep2": "x"})));
        assert_eq!(seeded, map(json!({"dep2": "x"})));
    }

    #[test]
    fn test_upstream_run_token() {
        let token = Fulfillment::upstream_run("123", Some("s3://path".to_string()));
        assert_eq!(token.value(), &json!({"runId": "123", "s3Path": "s3://path"}));
        assert!(serde_json::from_value::<Fulfillment>(json!(null)).is_err());
    }
}
