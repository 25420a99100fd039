//! The artifact manifest: the versioned mapping from logical path to content
//! digest that is uploaded alongside an artifact's files and used by the
//! server to address them.

use crate::hash::ContentDigest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One row of a [`Manifest`], addressed by its logical path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    #[serde(skip)]
    pub path: String,
    pub digest: String,
    pub size: u64,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>, digest: ContentDigest, size: u64) -> Self {
        Self {
            path: path.into(),
            digest: digest.to_string(),
            size,
            reference: None,
            local_path: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_local_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// The sorted tuple this entry contributes to the manifest digest:
    /// `(path, digest, size, ref, extras-as-sorted-json)`.
    fn digest_tuple(&self) -> (String, String, u64, String, String) {
        let reference = self.reference.clone().unwrap_or_default();
        let extras = serde_json::to_string(&self.extra).unwrap_or_default();
        (self.path.clone(), self.digest.clone(), self.size, reference, extras)
    }
}

/// Storage policy metadata carried alongside the manifest contents.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoragePolicy {
    pub name: String,
    pub config: Value,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            name: "wandb-storage-policy-v1".to_string(),
            config: serde_json::json!({ "storageLayout": "V2" }),
        }
    }
}

/// One version of an artifact's file listing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Manifest {
    pub version: u32,
    #[serde(rename = "storagePolicy")]
    pub storage_policy: String,
    #[serde(rename = "storagePolicyConfig")]
    pub storage_policy_config: Value,
    pub contents: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(storage_policy: StoragePolicy) -> Self {
        Self {
            version: 1,
            storage_policy: storage_policy.name,
            storage_policy_config: storage_policy.config,
            contents: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: ManifestEntry) {
        self.contents.insert(entry.path.clone(), entry);
    }

    /// Entries with a local path, in path order: the set the checksum stage
    /// fans out one upload per.
    pub fn local_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.contents.values().filter(|e| e.local_path.is_some())
    }

    /// Deterministic content digest over the sorted (path, digest, size,
    /// ref, extras) tuples. Two manifests with identical logical content
    /// hash identically regardless of insertion order, since `contents` is a
    /// `BTreeMap` keyed by path.
    pub fn digest(&self) -> ContentDigest {
        let mut buf = Vec::new();
        for entry in self.contents.values() {
            let tuple = entry.digest_tuple();
            buf.extend_from_slice(tuple.0.as_bytes());
            buf.push(0);
            buf.extend_from_slice(tuple.1.as_bytes());
            buf.push(0);
            buf.extend_from_slice(&tuple.2.to_le_bytes());
            buf.extend_from_slice(tuple.3.as_bytes());
            buf.push(0);
            buf.extend_from_slice(tuple.4.as_bytes());
            buf.push(0);
        }
        ContentDigest::new(&buf)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Wire<'a> {
            version: u32,
            #[serde(rename = "storagePolicy")]
            storage_policy: &'a str,
            #[serde(rename = "storagePolicyConfig")]
            storage_policy_config: &'a Value,
            contents: BTreeMap<&'a str, &'a ManifestEntry>,
        }
        let wire = Wire {
            version: self.version,
            storage_policy: &self.storage_policy,
            storage_policy_config: &self.storage_policy_config,
            contents: self.contents.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        };
        serde_json::to_string_pretty(&wire)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        #[derive(Deserialize)]
        struct Wire {
            version: u32,
            #[serde(rename = "storagePolicy")]
            storage_policy: String,
            #[serde(rename = "storagePolicyConfig")]
            storage_policy_config: Value,
            contents: BTreeMap<String, ManifestEntry>,
        }
        let wire: Wire = serde_json::from_str(data)?;
        let mut contents = BTreeMap::new();
        for (path, mut entry) in wire.contents {
            entry.path = path.clone();
            contents.insert(path, entry);
        }
        Ok(Self {
            version: wire.version,
            storage_policy: wire.storage_policy,
            storage_policy_config: wire.storage_policy_config,
            contents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_order_independent() {
        let mut a = Manifest::new(StoragePolicy::default());
        a.insert(ManifestEntry::new("b.txt", ContentDigest::new(b"b"), 1));
        a.insert(ManifestEntry::new("a.txt", ContentDigest::new(b"a"), 1));

        let mut b = Manifest::new(StoragePolicy::default());
        b.insert(ManifestEntry::new("a.txt", ContentDigest::new(b"a"), 1));
        b.insert(ManifestEntry::new("b.txt", ContentDigest::new(b"b"), 1));

        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn digest_changes_with_content() {
        let mut a = Manifest::new(StoragePolicy::default());
        a.insert(ManifestEntry::new("a.txt", ContentDigest::new(b"a"), 1));

        let mut b = Manifest::new(StoragePolicy::default());
        b.insert(ManifestEntry::new("a.txt", ContentDigest::new(b"different"), 9));

        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn json_round_trips() {
        let mut m = Manifest::new(StoragePolicy::default());
        m.insert(
            ManifestEntry::new("dir/file.bin", ContentDigest::new(b"payload"), 7)
                .with_local_path(PathBuf::from("/tmp/file.bin")),
        );
        let json = m.to_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(parsed.digest(), m.digest());
        assert_eq!(parsed.contents["dir/file.bin"].path, "dir/file.bin");
    }

    #[test]
    fn local_entries_filters_reference_only_rows() {
        let mut m = Manifest::new(StoragePolicy::default());
        m.insert(ManifestEntry::new("local.bin", ContentDigest::new(b"x"), 1).with_local_path(PathBuf::from("/tmp/x")));
        m.insert(ManifestEntry::new("remote.bin", ContentDigest::new(b"y"), 1).with_reference("s3://bucket/y"));
        assert_eq!(m.local_entries().count(), 1);
    }
}
