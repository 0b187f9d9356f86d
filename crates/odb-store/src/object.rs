use std::cmp::Ordering;

use odb_types::{ObjectId, ObjectKind, OBJECT_ID_LENGTH};

use crate::error::{StoreError, StoreResult};

/// A stored object: kind tag + canonical bytes + cached size.
///
/// `RawObject` is what every store hands back. Its id is always recomputable
/// from `kind` and `data`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawObject {
    /// The type of this object.
    pub kind: ObjectKind,
    /// The canonical bytes of the object.
    pub data: Vec<u8>,
    /// The size of `data` in bytes.
    pub size: u64,
}

impl RawObject {
    /// Create a new object from kind and data.
    pub fn new(kind: ObjectKind, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self { kind, data, size }
    }

    /// Compute the content-addressed id for this object.
    pub fn compute_id(&self) -> ObjectId {
        ObjectId::hash_object(self.kind, &self.data)
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// File mode for a tree entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// Normal file (0o100644).
    Regular,
    /// Executable file (0o100755).
    Executable,
    /// Symbolic link (0o120000).
    Symlink,
    /// Subtree / directory (0o040000).
    Directory,
    /// Commit in another repository (0o160000). Never walked.
    Gitlink,
}

impl EntryMode {
    /// Octal mode value.
    pub fn mode_bits(&self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::Directory => 0o040000,
            Self::Gitlink => 0o160000,
        }
    }

    /// Parse from an octal mode value.
    pub fn from_mode_bits(bits: u32) -> Option<Self> {
        match bits {
            0o100644 | 0o100664 => Some(Self::Regular),
            0o100755 => Some(Self::Executable),
            0o120000 => Some(Self::Symlink),
            0o040000 => Some(Self::Directory),
            0o160000 => Some(Self::Gitlink),
            _ => None,
        }
    }

    /// Kind of the object an entry with this mode points at.
    pub fn object_kind(&self) -> Option<ObjectKind> {
        match self {
            Self::Regular | Self::Executable | Self::Symlink => Some(ObjectKind::Blob),
            Self::Directory => Some(ObjectKind::Tree),
            Self::Gitlink => None,
        }
    }
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:o}", self.mode_bits())
    }
}

/// A single entry in a tree object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// File mode (regular, executable, symlink, directory, gitlink).
    pub mode: EntryMode,
    /// Entry name (filename or directory name).
    pub name: String,
    /// Id of the referenced object.
    pub object_id: ObjectId,
}

impl TreeEntry {
    /// Create a new tree entry.
    pub fn new(mode: EntryMode, name: impl Into<String>, object_id: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            object_id,
        }
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    // Directories sort as if their name ended in '/'.
    fn cmp(&self, other: &Self) -> Ordering {
        let suffix = |e: &TreeEntry| -> &'static [u8] {
            if e.mode == EntryMode::Directory {
                &b"/"[..]
            } else {
                &b""[..]
            }
        };
        let a = self.name.as_bytes().iter().chain(suffix(self));
        let b = other.name.as_bytes().iter().chain(suffix(other));
        a.cmp(b)
    }
}

/// Directory listing object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    /// Sorted entries in this directory.
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Create a new tree with the given entries, sorted canonically.
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort();
        Self { entries }
    }

    /// Encode into the canonical binary tree format.
    pub fn to_raw_object(&self) -> RawObject {
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend_from_slice(entry.mode.to_string().as_bytes());
            data.push(b' ');
            data.extend_from_slice(entry.name.as_bytes());
            data.push(0);
            data.extend_from_slice(entry.object_id.as_bytes());
        }
        RawObject::new(ObjectKind::Tree, data)
    }

    /// Decode from a tree object.
    pub fn from_raw_object(obj: &RawObject) -> StoreResult<Self> {
        let corrupt = |reason: &str| StoreError::CorruptObject {
            id: obj.compute_id(),
            reason: reason.to_string(),
        };
        if obj.kind != ObjectKind::Tree {
            return Err(corrupt(&format!("expected tree, got {}", obj.kind)));
        }

        let mut entries = Vec::new();
        let mut rest = obj.data.as_slice();
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| corrupt("missing mode terminator"))?;
            let mode_str =
                std::str::from_utf8(&rest[..space]).map_err(|_| corrupt("mode is not ascii"))?;
            let bits = u32::from_str_radix(mode_str, 8).map_err(|_| corrupt("bad mode"))?;
            let mode = EntryMode::from_mode_bits(bits)
                .ok_or_else(|| corrupt(&format!("unknown mode {mode_str}")))?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| corrupt("missing name terminator"))?;
            let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
            rest = &rest[nul + 1..];

            if rest.len() < OBJECT_ID_LENGTH {
                return Err(corrupt("truncated entry id"));
            }
            let object_id = ObjectId::from_raw(&rest[..OBJECT_ID_LENGTH])
                .map_err(|_| corrupt("bad entry id"))?;
            rest = &rest[OBJECT_ID_LENGTH..];

            entries.push(TreeEntry {
                mode,
                name,
                object_id,
            });
        }
        Ok(Self { entries })
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// A commit: root tree, parents, identities, and message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: String,
    pub committer: String,
    pub message: String,
}

impl Commit {
    /// Encode into the canonical commit format.
    pub fn to_raw_object(&self) -> RawObject {
        let mut text = format!("tree {}\n", self.tree);
        for parent in &self.parents {
            text.push_str(&format!("parent {parent}\n"));
        }
        text.push_str(&format!("author {}\n", self.author));
        text.push_str(&format!("committer {}\n", self.committer));
        text.push('\n');
        text.push_str(&self.message);
        RawObject::new(ObjectKind::Commit, text.into_bytes())
    }

    /// Decode from a commit object.
    pub fn from_raw_object(obj: &RawObject) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::CorruptObject {
            id: obj.compute_id(),
            reason,
        };
        if obj.kind != ObjectKind::Commit {
            return Err(corrupt(format!("expected commit, got {}", obj.kind)));
        }
        let (headers, message) = split_headers(&obj.data);
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = String::new();
        let mut committer = String::new();
        for (key, value) in headers {
            match key {
                "tree" => tree = Some(parse_hex_id(value).map_err(&corrupt)?),
                "parent" => parents.push(parse_hex_id(value).map_err(&corrupt)?),
                "author" => author = value.to_string(),
                "committer" => committer = value.to_string(),
                _ => {}
            }
        }
        Ok(Self {
            tree: tree.ok_or_else(|| corrupt("missing tree header".into()))?,
            parents,
            author,
            committer,
            message,
        })
    }
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// An annotated tag pointing at another object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub object: ObjectId,
    pub target_kind: ObjectKind,
    pub name: String,
    pub tagger: String,
    pub message: String,
}

impl Tag {
    /// Encode into the canonical tag format.
    pub fn to_raw_object(&self) -> RawObject {
        let text = format!(
            "object {}\ntype {}\ntag {}\ntagger {}\n\n{}",
            self.object, self.target_kind, self.name, self.tagger, self.message
        );
        RawObject::new(ObjectKind::Tag, text.into_bytes())
    }

    /// Decode from a tag object.
    pub fn from_raw_object(obj: &RawObject) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::CorruptObject {
            id: obj.compute_id(),
            reason,
        };
        if obj.kind != ObjectKind::Tag {
            return Err(corrupt(format!("expected tag, got {}", obj.kind)));
        }
        let (headers, message) = split_headers(&obj.data);
        let mut object = None;
        let mut target_kind = None;
        let mut name = String::new();
        let mut tagger = String::new();
        for (key, value) in headers {
            match key {
                "object" => object = Some(parse_hex_id(value).map_err(&corrupt)?),
                "type" => {
                    target_kind = Some(
                        value
                            .parse::<ObjectKind>()
                            .map_err(|e| corrupt(e.to_string()))?,
                    )
                }
                "tag" => name = value.to_string(),
                "tagger" => tagger = value.to_string(),
                _ => {}
            }
        }
        Ok(Self {
            object: object.ok_or_else(|| corrupt("missing object header".into()))?,
            target_kind: target_kind.ok_or_else(|| corrupt("missing type header".into()))?,
            name,
            tagger,
            message,
        })
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// An outgoing edge from one object to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// The referenced object.
    pub id: ObjectId,
    /// Kind the referencing object declares for the target.
    pub kind: ObjectKind,
    /// Tree entry name, for references out of a tree.
    pub name: Option<String>,
}

/// List the objects `obj` directly references.
///
/// Blobs reference nothing; gitlink entries in trees are skipped because
/// they name commits in another repository.
pub fn references(obj: &RawObject) -> StoreResult<Vec<ObjectRef>> {
    match obj.kind {
        ObjectKind::Blob => Ok(Vec::new()),
        ObjectKind::Tree => {
            let tree = Tree::from_raw_object(obj)?;
            Ok(tree
                .entries
                .into_iter()
                .filter_map(|entry| {
                    entry.mode.object_kind().map(|kind| ObjectRef {
                        id: entry.object_id,
                        kind,
                        name: Some(entry.name),
                    })
                })
                .collect())
        }
        ObjectKind::Commit => {
            let commit = Commit::from_raw_object(obj)?;
            let mut refs = vec![ObjectRef {
                id: commit.tree,
                kind: ObjectKind::Tree,
                name: None,
            }];
            refs.extend(commit.parents.into_iter().map(|id| ObjectRef {
                id,
                kind: ObjectKind::Commit,
                name: None,
            }));
            Ok(refs)
        }
        ObjectKind::Tag => {
            let tag = Tag::from_raw_object(obj)?;
            Ok(vec![ObjectRef {
                id: tag.object,
                kind: tag.target_kind,
                name: None,
            }])
        }
    }
}

fn split_headers(data: &[u8]) -> (Vec<(&str, &str)>, String) {
    let text_end = data
        .windows(2)
        .position(|w| w == b"\n\n")
        .unwrap_or(data.len());
    let header_text = std::str::from_utf8(&data[..text_end]).unwrap_or("");
    let headers = header_text
        .lines()
        .filter_map(|line| line.split_once(' '))
        .collect();
    let message_start = (text_end + 2).min(data.len());
    let message = String::from_utf8_lossy(&data[message_start..]).into_owned();
    (headers, message)
}

fn parse_hex_id(value: &str) -> Result<ObjectId, String> {
    ObjectId::from_hex(value.trim()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_id(content: &[u8]) -> ObjectId {
        ObjectId::hash_object(ObjectKind::Blob, content)
    }

    #[test]
    fn tree_entries_sorted_with_directory_suffix() {
        let tree = Tree::new(vec![
            TreeEntry::new(EntryMode::Regular, "foo.c", blob_id(b"1")),
            TreeEntry::new(EntryMode::Directory, "foo", blob_id(b"2")),
            TreeEntry::new(EntryMode::Regular, "alpha", blob_id(b"3")),
        ]);
        // "foo/" sorts after "foo.c" because '.' < '/'.
        let names: Vec<_> = tree.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "foo.c", "foo"]);
    }

    #[test]
    fn tree_roundtrip() {
        let tree = Tree::new(vec![
            TreeEntry::new(EntryMode::Regular, "file.txt", blob_id(b"content")),
            TreeEntry::new(EntryMode::Executable, "run.sh", blob_id(b"#!/bin/sh")),
            TreeEntry::new(EntryMode::Directory, "subdir", blob_id(b"tree")),
        ]);
        let raw = tree.to_raw_object();
        let decoded = Tree::from_raw_object(&raw).unwrap();
        assert_eq!(tree, decoded);
    }

    #[test]
    fn empty_tree_has_well_known_name() {
        let raw = Tree::default().to_raw_object();
        assert_eq!(
            raw.compute_id().to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn truncated_tree_is_corrupt() {
        let mut raw = Tree::new(vec![TreeEntry::new(
            EntryMode::Regular,
            "a",
            blob_id(b"a"),
        )])
        .to_raw_object();
        raw.data.truncate(raw.data.len() - 3);
        let err = Tree::from_raw_object(&raw).unwrap_err();
        assert!(matches!(err, StoreError::CorruptObject { .. }));
    }

    #[test]
    fn commit_roundtrip() {
        let commit = Commit {
            tree: blob_id(b"tree"),
            parents: vec![blob_id(b"p1"), blob_id(b"p2")],
            author: "A U Thor <author@example.com> 1700000000 +0000".into(),
            committer: "C O Mitter <committer@example.com> 1700000000 +0000".into(),
            message: "initial\n".into(),
        };
        let decoded = Commit::from_raw_object(&commit.to_raw_object()).unwrap();
        assert_eq!(commit, decoded);
    }

    #[test]
    fn tag_roundtrip() {
        let tag = Tag {
            object: blob_id(b"target"),
            target_kind: ObjectKind::Commit,
            name: "v1.0".into(),
            tagger: "T Agger <t@example.com> 1700000000 +0000".into(),
            message: "release\n".into(),
        };
        let decoded = Tag::from_raw_object(&tag.to_raw_object()).unwrap();
        assert_eq!(tag, decoded);
    }

    #[test]
    fn commit_references_tree_then_parents() {
        let commit = Commit {
            tree: blob_id(b"tree"),
            parents: vec![blob_id(b"parent")],
            author: "a".into(),
            committer: "c".into(),
            message: String::new(),
        };
        let refs = references(&commit.to_raw_object()).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].kind, ObjectKind::Tree);
        assert_eq!(refs[1].kind, ObjectKind::Commit);
        assert_eq!(refs[1].id, blob_id(b"parent"));
    }

    #[test]
    fn tree_references_skip_gitlinks() {
        let tree = Tree::new(vec![
            TreeEntry::new(EntryMode::Regular, "a", blob_id(b"a")),
            TreeEntry::new(EntryMode::Gitlink, "sub", blob_id(b"module")),
        ]);
        let refs = references(&tree.to_raw_object()).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name.as_deref(), Some("a"));
    }

    #[test]
    fn blob_references_nothing() {
        let raw = RawObject::new(ObjectKind::Blob, b"data".to_vec());
        assert!(references(&raw).unwrap().is_empty());
    }

    #[test]
    fn entry_mode_bits_roundtrip() {
        for mode in [
            EntryMode::Regular,
            EntryMode::Executable,
            EntryMode::Symlink,
            EntryMode::Directory,
            EntryMode::Gitlink,
        ] {
            assert_eq!(EntryMode::from_mode_bits(mode.mode_bits()), Some(mode));
        }
        assert!(EntryMode::from_mode_bits(0o777).is_none());
    }
}
