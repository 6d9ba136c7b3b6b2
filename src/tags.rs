//! Tag attachment for measurement targets.
//!
//! A [`TagSet`] maps a destination IP (as a string) to the free-form tags
//! applied to its summaries at read time, e.g.
//! `tags["1.2.3.4"]["dst_cluster"] = "mycluster"`. The probe pipeline never
//! mutates tags; it only reads them next to the summary cache.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Free-form attribute map attached to a single destination.
pub type Tags = HashMap<String, String>;

/// Destination IP string → tags for that destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(HashMap<String, Tags>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags for one destination IP, if any are configured.
    pub fn get(&self, dst_ip: &str) -> Option<&Tags> {
        self.0.get(dst_ip)
    }

    /// Insert or replace the tags for one destination.
    pub fn insert(&mut self, dst_ip: impl Into<String>, tags: Tags) {
        self.0.insert(dst_ip.into(), tags);
    }

    /// Merge `newer` into this set. Additive: existing destinations are
    /// kept unless `newer` carries a replacement, so summaries for hosts
    /// that left the config keep their tags until restart.
    pub fn merge(&mut self, newer: TagSet) {
        self.0.extend(newer.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Tags)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, Tags)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_keeps_existing_and_adds_new() {
        let mut ts = TagSet::new();
        ts.insert("example", tags(&[("mytag", "myvalue")]));

        let mut newer = TagSet::new();
        newer.insert("1.2.3.4", tags(&[("a", "b")]));
        ts.merge(newer);

        assert_eq!(ts.len(), 2);
        assert_eq!(ts.get("example").unwrap()["mytag"], "myvalue");
        assert_eq!(ts.get("1.2.3.4").unwrap()["a"], "b");
    }

    #[test]
    fn merge_replaces_conflicting_destination() {
        let mut ts = TagSet::new();
        ts.insert("10.0.0.1", tags(&[("dst_cluster", "old")]));

        let mut newer = TagSet::new();
        newer.insert("10.0.0.1", tags(&[("dst_cluster", "new")]));
        ts.merge(newer);

        assert_eq!(ts.len(), 1);
        assert_eq!(ts.get("10.0.0.1").unwrap()["dst_cluster"], "new");
    }

    #[test]
    fn merge_never_deletes_keys() {
        let mut ts = TagSet::new();
        ts.insert("a", tags(&[("k", "v")]));
        ts.merge(TagSet::new());
        assert_eq!(ts.len(), 1);
    }
}
