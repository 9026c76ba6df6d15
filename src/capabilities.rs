//! Capability sets and stereotype matching.
//!
//! A capability set is an immutable ordered mapping from string keys to
//! JSON-valued leaves. Equality is structural and merge is right-biased per
//! key. A slot advertises a fixed *stereotype*; a client request matches the
//! stereotype iff every non-null requested capability equals the stereotype's
//! value for that key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability keys with the vendor extension separator are never matched
/// against a stereotype; they carry request metadata, not browser demands.
const EXTENSION_SEPARATOR: char = ':';

/// An ordered, JSON-valued capability mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeMap<String, Value>);

impl Capabilities {
    /// Create an empty capability set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Get the value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Convenience accessor for the `browserName` capability.
    pub fn browser_name(&self) -> Option<&str> {
        self.get("browserName").and_then(Value::as_str)
    }

    /// Check whether the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Right-biased merge: on key conflict, `other` wins.
    pub fn merge(&self, other: &Capabilities) -> Capabilities {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            merged.insert(key.clone(), value.clone());
        }
        Capabilities(merged)
    }

    /// Check whether this request matches a slot's stereotype.
    ///
    /// Every non-null, non-extension key requested must be present in the
    /// stereotype with a structurally equal value. Keys the request leaves
    /// unset are free for the stereotype to fill in.
    pub fn matches_stereotype(&self, stereotype: &Capabilities) -> bool {
        self.0.iter().all(|(key, requested)| {
            if requested.is_null() || key.contains(EXTENSION_SEPARATOR) {
                return true;
            }
            stereotype.get(key) == Some(requested)
        })
    }
}

impl FromIterator<(String, Value)> for Capabilities {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<serde_json::Map<String, Value>> for Capabilities {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        map.into_iter().collect()
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "<capabilities>"),
        }
    }
}

/// Build a capability set from key/value literals, mostly for tests.
#[macro_export]
macro_rules! caps {
    ($($key:expr => $value:tt),* $(,)?) => {{
        [$(($key.to_string(), ::serde_json::json!($value))),*]
            .into_iter()
            .collect::<$crate::capabilities::Capabilities>()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_against_stereotype() {
        let stereotype = caps! { "browserName" => "cheese" };
        let request = caps! { "browserName" => "cheese" };
        assert!(request.matches_stereotype(&stereotype));
    }

    #[test]
    fn mismatched_value_does_not_match() {
        let stereotype = caps! { "browserName" => "cheese" };
        let request = caps! { "browserName" => "peas" };
        assert!(!request.matches_stereotype(&stereotype));
    }

    #[test]
    fn null_requested_value_is_ignored() {
        let stereotype = caps! { "browserName" => "cheese" };
        let request = caps! { "browserName" => "cheese", "platformName" => null };
        assert!(request.matches_stereotype(&stereotype));
    }

    #[test]
    fn extension_keys_are_ignored() {
        let stereotype = caps! { "browserName" => "cheese" };
        let request = caps! { "browserName" => "cheese", "se:downloadsEnabled" => true };
        assert!(request.matches_stereotype(&stereotype));
    }

    #[test]
    fn empty_request_matches_anything() {
        let stereotype = caps! { "browserName" => "cheese", "platformName" => "linux" };
        assert!(Capabilities::new().matches_stereotype(&stereotype));
    }

    #[test]
    fn key_absent_from_stereotype_does_not_match() {
        let stereotype = caps! { "browserName" => "cheese" };
        let request = caps! { "browserName" => "cheese", "browserVersion" => "99" };
        assert!(!request.matches_stereotype(&stereotype));
    }

    #[test]
    fn merge_is_right_biased() {
        let left = caps! { "browserName" => "cheese", "platformName" => "linux" };
        let right = caps! { "platformName" => "mac" };
        let merged = left.merge(&right);
        assert_eq!(merged.get("platformName"), Some(&serde_json::json!("mac")));
        assert_eq!(merged.get("browserName"), Some(&serde_json::json!("cheese")));
    }

    #[test]
    fn equality_is_structural() {
        let a = caps! { "browserName" => "cheese", "count" => 3 };
        let b = caps! { "count" => 3, "browserName" => "cheese" };
        assert_eq!(a, b);
    }

    #[test]
    fn serde_round_trip() {
        let caps = caps! { "browserName" => "cheese", "nested" => { "a": [1, 2] } };
        let json = serde_json::to_string(&caps).unwrap();
        let back: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(caps, back);
    }
}
