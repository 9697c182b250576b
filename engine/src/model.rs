//! Core data model shared across the engine.
//!
//! This module defines:
//! - Fingerprint: the 32-byte content digest
//! - EntryKind, Mode, Policy: enums controlling behavior
//! - TreeEntry: a detached snapshot of a subtree
//! - NodeState, TaskState: copy/move state machines

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::magic::ContentType;

/// 32-byte content fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFingerprintError;

impl fmt::Display for ParseFingerprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fingerprint must be 64 hex characters")
    }
}

impl std::error::Error for ParseFingerprintError {}

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(ParseFingerprintError);
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ParseFingerprintError)?;
        }
        Ok(Fingerprint(out))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of a tracked filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::File => write!(f, "file"),
        }
    }
}

/// The operation mode for a copy/move task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Copy entries; source remains unchanged
    Copy,
    /// Move entries; source is renamed into place
    Move,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Copy => write!(f, "copy"),
            Mode::Move => write!(f, "move"),
        }
    }
}

impl Mode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "copy" => Some(Self::Copy),
            "move" => Some(Self::Move),
            _ => None,
        }
    }
}

/// Resolution for a source entry whose name is taken at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Leave the destination; directories merge their children
    Keep,
    /// Do not transfer this entry
    Skip,
    /// Remove the destination entry, then transfer
    Replace,
    /// Transfer under a fresh, unused name
    Rename,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Keep => write!(f, "keep"),
            Policy::Skip => write!(f, "skip"),
            Policy::Replace => write!(f, "replace"),
            Policy::Rename => write!(f, "rename"),
        }
    }
}

impl Policy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "keep" => Some(Self::Keep),
            "skip" => Some(Self::Skip),
            "replace" => Some(Self::Replace),
            "rename" => Some(Self::Rename),
            _ => None,
        }
    }
}

/// Detached snapshot of a tracked entry and (for directories) its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub uuid: Uuid,
    pub name: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeEntry>,
}

impl TreeEntry {
    pub fn directory(uuid: Uuid, name: impl Into<String>, children: Vec<TreeEntry>) -> Self {
        TreeEntry {
            uuid,
            name: name.into(),
            kind: EntryKind::Directory,
            size: None,
            mtime: None,
            hash: None,
            magic: None,
            children,
        }
    }

    pub fn file(uuid: Uuid, name: impl Into<String>, size: u64) -> Self {
        TreeEntry {
            uuid,
            name: name.into(),
            kind: EntryKind::File,
            size: Some(size),
            mtime: None,
            hash: None,
            magic: None,
            children: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn child(&self, name: &str) -> Option<&TreeEntry> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Number of entries in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TreeEntry::count).sum::<usize>()
    }
}

/// How a finished task node was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Copied or moved into place (possibly under a new name or over a replaced entry)
    Transferred,
    /// Directory merged into an existing destination directory
    Merged,
    /// Destination kept as-is
    Kept,
    /// Entry not transferred
    Skipped,
}

/// Why a node is waiting on a policy decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ConflictReason {
    /// The destination name is occupied
    NameTaken {
        dest_kind: EntryKind,
        dest_uuid: Option<Uuid>,
    },
    /// The source is no longer the entry that was planned
    IdentityChanged {
        expected: Uuid,
        actual: Option<Uuid>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(flatten)]
    pub reason: ConflictReason,
    /// Policies the caller may choose from
    pub policies: Vec<Policy>,
}

/// The state of an individual node within a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum NodeState {
    /// Not yet processed
    Pending,
    /// Filesystem operation in progress
    Working,
    Done { outcome: Outcome },
    /// Waiting for an explicit policy
    Conflict(Conflict),
    Failed { code: String, message: String },
}

impl NodeState {
    /// Returns true if no further change happens without caller action.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            NodeState::Done { .. } | NodeState::Conflict(_) | NodeState::Failed { .. }
        )
    }
}

/// The state of a whole copy/move task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskState {
    /// Created, not yet started
    Pending,
    /// Currently executing
    Running,
    /// Only conflicts remain
    Blocked,
    /// Every node is done or failed
    Finished,
    /// A structural error stopped the task
    Failed { code: String, message: String },
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_hex_round_trip() {
        let fp = Fingerprint([0xab; 32]);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), fp);
        assert!("xyz".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(Policy::from_str("keep"), Some(Policy::Keep));
        assert_eq!(Policy::from_str("SKIP"), Some(Policy::Skip));
        assert_eq!(Policy::from_str("replace"), Some(Policy::Replace));
        assert_eq!(Policy::from_str("rename"), Some(Policy::Rename));
        assert_eq!(Policy::from_str("overwrite"), None);
    }

    #[test]
    fn test_node_state_serializes_with_tag() {
        let state = NodeState::Done {
            outcome: Outcome::Merged,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"done","outcome":"merged"}"#);
    }

    #[test]
    fn test_tree_entry_count() {
        let tree = TreeEntry::directory(
            Uuid::new_v4(),
            "foo",
            vec![
                TreeEntry::file(Uuid::new_v4(), "a", 1),
                TreeEntry::directory(Uuid::new_v4(), "b", vec![TreeEntry::file(Uuid::new_v4(), "c", 2)]),
            ],
        );
        assert_eq!(tree.count(), 4);
        assert!(tree.child("b").unwrap().is_dir());
    }
}
