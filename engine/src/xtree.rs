//! Policy expansion for name collisions.
//!
//! For every source entry headed into a destination directory, `expand`
//! works out whether the name is free and, if not, which policies are legal
//! and what the destination would look like under each. Expansion is pure:
//! it works on detached `TreeEntry` snapshots and touches nothing on disk.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Serialize;
use tracing::trace;

use crate::error::{EngineError, EngineResult};
use crate::fs_ops;
use crate::model::{EntryKind, Policy, TreeEntry};
use crate::xstat::IdentityStore;

/// Policies that may resolve a collision between a source of kind `src`
/// and an existing destination of kind `dst`.
pub fn legal_policies(src: EntryKind, dst: EntryKind) -> Vec<Policy> {
    if src == dst {
        vec![Policy::Keep, Policy::Skip, Policy::Replace, Policy::Rename]
    } else {
        vec![Policy::Skip, Policy::Replace, Policy::Rename]
    }
}

/// First of `name (2).ext`, `name (3).ext`, ... for which `taken` is false.
///
/// The extension is whatever follows the last dot, unless that dot starts
/// the name.
pub fn auto_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], Some(&name[i + 1..])),
        _ => (name, None),
    };
    let mut counter = 2u64;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext),
            None => format!("{} ({})", stem, counter),
        };
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// The destination under one policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// Entries occupying the affected names afterwards
    pub result: Vec<TreeEntry>,
    /// Collisions one level down (`keep` on directories)
    pub children: Vec<PolicyNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyNode {
    pub name: String,
    pub source: TreeEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<TreeEntry>,
    /// Post-image when the name is free
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<TreeEntry>,
    /// Legal policies and their outcome; empty when the name is free
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resolutions: BTreeMap<Policy, Resolution>,
}

impl PolicyNode {
    pub fn is_conflict(&self) -> bool {
        self.dest.is_some()
    }

    pub fn policies(&self) -> Vec<Policy> {
        self.resolutions.keys().copied().collect()
    }

    pub fn resolve(&self, policy: Policy) -> Option<&Resolution> {
        self.resolutions.get(&policy)
    }

    /// Number of conflicts in this node and, following `keep`, below it.
    pub fn conflict_count(&self) -> usize {
        if !self.is_conflict() {
            return 0;
        }
        let nested = self
            .resolve(Policy::Keep)
            .map_or(0, |r| r.children.iter().map(PolicyNode::conflict_count).sum());
        1 + nested
    }
}

/// Expand a single source entry against the destination's children.
pub fn expand(source: &TreeEntry, dest_siblings: &[TreeEntry]) -> PolicyNode {
    let mut taken: HashSet<String> = dest_siblings.iter().map(|d| d.name.clone()).collect();
    taken.insert(source.name.clone());
    expand_with(source, dest_siblings, &mut taken)
}

/// Expand a batch headed into one directory. Synthesized names are unique
/// across the batch as well as among the destination's children.
pub fn expand_all(sources: &[TreeEntry], dest_siblings: &[TreeEntry]) -> Vec<PolicyNode> {
    let mut taken: HashSet<String> = dest_siblings
        .iter()
        .chain(sources)
        .map(|e| e.name.clone())
        .collect();
    sources
        .iter()
        .map(|source| expand_with(source, dest_siblings, &mut taken))
        .collect()
}

fn expand_with(source: &TreeEntry, dest_siblings: &[TreeEntry], taken: &mut HashSet<String>) -> PolicyNode {
    let Some(dest) = dest_siblings.iter().find(|d| d.name == source.name) else {
        return PolicyNode {
            name: source.name.clone(),
            source: source.clone(),
            dest: None,
            post: Some(source.clone()),
            resolutions: BTreeMap::new(),
        };
    };

    trace!("{} collides with an existing {:?}", source.name, dest.kind);
    let mut resolutions = BTreeMap::new();
    for policy in legal_policies(source.kind, dest.kind) {
        let resolution = match policy {
            Policy::Keep => Resolution {
                result: vec![dest.clone()],
                children: if source.is_dir() {
                    expand_all(&source.children, &dest.children)
                } else {
                    Vec::new()
                },
            },
            Policy::Skip => Resolution {
                result: vec![dest.clone()],
                children: Vec::new(),
            },
            Policy::Replace => Resolution {
                result: vec![source.clone()],
                children: Vec::new(),
            },
            Policy::Rename => {
                let name = auto_name(&source.name, |n| taken.contains(n));
                taken.insert(name.clone());
                let mut renamed = source.clone();
                renamed.name = name;
                Resolution {
                    result: vec![dest.clone(), renamed],
                    children: Vec::new(),
                }
            }
        };
        resolutions.insert(policy, resolution);
    }

    PolicyNode {
        name: source.name.clone(),
        source: source.clone(),
        dest: Some(dest.clone()),
        post: None,
        resolutions,
    }
}

/// Snapshot a directory straight from disk, reading (or assigning)
/// identities on the way.
pub fn read_tree(store: &IdentityStore, path: &Path) -> EngineResult<TreeEntry> {
    let xstat = store.read(path)?;
    match xstat.kind {
        EntryKind::File => {
            let mut entry = TreeEntry::file(xstat.uuid, xstat.name, xstat.size);
            entry.mtime = Some(xstat.mtime);
            entry.hash = xstat.hash;
            entry.magic = xstat.magic;
            Ok(entry)
        }
        EntryKind::Directory => {
            let mut entry = TreeEntry::directory(xstat.uuid, xstat.name, read_children(store, path)?);
            entry.mtime = Some(xstat.mtime);
            Ok(entry)
        }
    }
}

/// Snapshots of every supported entry in a directory, sorted by name.
pub fn read_children(store: &IdentityStore, dir: &Path) -> EngineResult<Vec<TreeEntry>> {
    let mut children = Vec::new();
    for name in fs_ops::list_dir(dir)? {
        match read_tree(store, &dir.join(&name)) {
            Ok(entry) => children.push(entry),
            Err(EngineError::Unsupported { .. }) | Err(EngineError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use uuid::Uuid;

    use crate::xstat::SidecarStore;

    fn file(name: &str) -> TreeEntry {
        TreeEntry::file(Uuid::new_v4(), name, 1)
    }

    fn dir(name: &str, children: Vec<TreeEntry>) -> TreeEntry {
        TreeEntry::directory(Uuid::new_v4(), name, children)
    }

    #[test]
    fn test_free_name_has_no_conflict() {
        let node = expand(&file("new.txt"), &[file("other.txt")]);
        assert!(!node.is_conflict());
        assert!(node.resolutions.is_empty());
        assert_eq!(node.post.as_ref().unwrap().name, "new.txt");
        assert_eq!(node.conflict_count(), 0);
    }

    #[test]
    fn test_conflict_policies_are_complete() {
        let same = expand(&file("a"), &[file("a")]);
        assert_eq!(
            same.policies(),
            vec![Policy::Keep, Policy::Skip, Policy::Replace, Policy::Rename]
        );

        let file_over_dir = expand(&file("a"), &[dir("a", vec![])]);
        assert_eq!(file_over_dir.policies(), vec![Policy::Skip, Policy::Replace, Policy::Rename]);

        let dir_over_file = expand(&dir("a", vec![]), &[file("a")]);
        assert_eq!(dir_over_file.policies(), vec![Policy::Skip, Policy::Replace, Policy::Rename]);
        assert!(dir_over_file.resolve(Policy::Keep).is_none());
    }

    #[test]
    fn test_post_images() {
        let source = file("a.txt");
        let dest = file("a.txt");
        let node = expand(&source, &[dest.clone()]);

        assert_eq!(node.resolve(Policy::Keep).unwrap().result, vec![dest.clone()]);
        assert!(node.resolve(Policy::Keep).unwrap().children.is_empty());
        assert_eq!(node.resolve(Policy::Skip).unwrap().result, vec![dest.clone()]);
        assert_eq!(node.resolve(Policy::Replace).unwrap().result, vec![source.clone()]);

        let renamed = &node.resolve(Policy::Rename).unwrap().result;
        assert_eq!(renamed[0], dest);
        assert_eq!(renamed[1].name, "a (2).txt");
        assert_eq!(renamed[1].uuid, source.uuid);
    }

    #[test]
    fn test_keep_recurses_into_directories() {
        let source = dir("foo", vec![file("a.txt"), file("b.txt"), dir("sub", vec![file("x")])]);
        let dest = dir("foo", vec![file("a.txt"), dir("sub", vec![file("x")])]);
        let node = expand(&source, &[dest]);

        let keep = node.resolve(Policy::Keep).expect("keep is legal for foo/foo");
        let names: Vec<&str> = keep.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert!(keep.children[0].is_conflict());
        assert!(!keep.children[1].is_conflict());

        let sub = keep.children[2].resolve(Policy::Keep).unwrap();
        assert!(sub.children[0].is_conflict());
        // foo, a.txt, sub, sub/x
        assert_eq!(node.conflict_count(), 4);
    }

    #[test]
    fn test_rename_avoids_batch_and_destination_names() {
        let dest = vec![file("x.txt"), file("x (3).txt")];
        let nodes = expand_all(&[file("x.txt"), file("x (2).txt")], &dest);

        let renamed = &nodes[0].resolve(Policy::Rename).unwrap().result[1];
        assert_eq!(renamed.name, "x (4).txt");
        assert!(!nodes[1].is_conflict());
    }

    #[test]
    fn test_auto_name() {
        let none = |_: &str| false;
        assert_eq!(auto_name("photo.jpg", none), "photo (2).jpg");
        assert_eq!(auto_name("archive.tar.gz", none), "archive.tar (2).gz");
        assert_eq!(auto_name(".bashrc", none), ".bashrc (2)");
        assert_eq!(auto_name("README", none), "README (2)");
        assert_eq!(
            auto_name("a.txt", |n| n == "a (2).txt" || n == "a (3).txt"),
            "a (4).txt"
        );
    }

    #[test]
    fn test_read_tree_from_disk() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = IdentityStore::new(Box::new(SidecarStore::in_memory()));
        let root = temp_dir.path().join("foo");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"abc").unwrap();
        fs::write(root.join("sub").join("b"), b"b").unwrap();
        std::os::unix::fs::symlink(root.join("a.txt"), root.join("link")).unwrap();

        let tree = read_tree(&store, &root).expect("Failed to read tree");
        assert_eq!(tree.name, "foo");
        assert_eq!(tree.count(), 4);
        assert_eq!(tree.child("a.txt").unwrap().size, Some(3));
        assert!(tree.child("link").is_none());

        // identities are stable between reads
        let again = read_tree(&store, &root).unwrap();
        assert_eq!(again.child("sub").unwrap().uuid, tree.child("sub").unwrap().uuid);
    }
}
