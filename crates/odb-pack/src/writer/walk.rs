//! Object enumeration for pack writing.
//!
//! Everything reachable from the uninteresting roots is excluded first;
//! then the interesting roots are walked breadth first, skipping excluded
//! objects. Tree and blob objects hanging directly off an uninteresting
//! root become "edges": candidates for thin-pack delta bases.

use std::collections::{HashSet, VecDeque};

use odb_store::references;
use odb_types::{ObjectId, ObjectKind};
use tracing::debug;

use crate::database::PackDatabase;
use crate::error::{PackError, PackResult};
use crate::progress::{check_cancelled, ProgressMonitor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WalkedObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub path_hash: u32,
}

#[derive(Debug, Default)]
pub(crate) struct WalkResult {
    /// Objects to send, in discovery order.
    pub objects: Vec<WalkedObject>,
    /// Objects the receiver is assumed to have.
    pub edges: Vec<WalkedObject>,
}

/// Hash of a tree entry name that keeps files of the same name close when
/// sorted. Later characters weigh more; whitespace is ignored.
pub(crate) fn path_hash(name: &str) -> u32 {
    name.bytes()
        .filter(|c| !c.is_ascii_whitespace())
        .fold(0u32, |hash, c| (hash >> 2).wrapping_add(u32::from(c) << 24))
}

struct Pending {
    id: ObjectId,
    kind: Option<ObjectKind>,
    path_hash: u32,
    /// Reached from an uninteresting root without crossing a parent link.
    edge: bool,
}

impl Pending {
    fn root(id: ObjectId) -> Self {
        Self {
            id,
            kind: None,
            path_hash: 0,
            edge: true,
        }
    }
}

pub(crate) struct ObjectWalk<'a> {
    db: &'a PackDatabase,
    progress: &'a dyn ProgressMonitor,
    ignore_missing_uninteresting: bool,
    keep_edges: bool,
}

impl<'a> ObjectWalk<'a> {
    pub(crate) fn new(
        db: &'a PackDatabase,
        progress: &'a dyn ProgressMonitor,
        ignore_missing_uninteresting: bool,
        keep_edges: bool,
    ) -> Self {
        Self {
            db,
            progress,
            ignore_missing_uninteresting,
            keep_edges,
        }
    }

    pub(crate) fn run(&self, interesting: &[ObjectId], uninteresting: &[ObjectId]) -> PackResult<WalkResult> {
        let (excluded, edges) = self.mark_uninteresting(uninteresting)?;
        let objects = self.collect(interesting, &excluded)?;
        debug!(
            objects = objects.len(),
            excluded = excluded.len(),
            edges = edges.len(),
            "counted objects"
        );
        Ok(WalkResult { objects, edges })
    }

    fn mark_uninteresting(&self, roots: &[ObjectId]) -> PackResult<(HashSet<ObjectId>, Vec<WalkedObject>)> {
        let mut excluded = HashSet::new();
        let mut edges = Vec::new();
        let mut queue: VecDeque<Pending> = roots.iter().copied().map(Pending::root).collect();

        while let Some(item) = queue.pop_front() {
            check_cancelled(self.progress)?;
            if !excluded.insert(item.id) {
                continue;
            }
            let keep = self.keep_edges && item.edge;
            if item.kind == Some(ObjectKind::Blob) {
                if keep {
                    edges.push(WalkedObject {
                        id: item.id,
                        kind: ObjectKind::Blob,
                        path_hash: item.path_hash,
                    });
                }
                continue;
            }
            let object = match self.db.read(&item.id) {
                Ok(object) => object,
                Err(PackError::MissingObject(id)) if self.ignore_missing_uninteresting => {
                    debug!(%id, "uninteresting object missing, skipped");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if keep && object.kind == ObjectKind::Tree {
                edges.push(WalkedObject {
                    id: item.id,
                    kind: ObjectKind::Tree,
                    path_hash: item.path_hash,
                });
            }
            for reference in references(&object)? {
                let edge = item.edge && reference.kind != ObjectKind::Commit;
                queue.push_back(Pending {
                    id: reference.id,
                    kind: Some(reference.kind),
                    path_hash: reference.name.as_deref().map_or(0, path_hash),
                    edge,
                });
            }
        }
        Ok((excluded, edges))
    }

    fn collect(&self, roots: &[ObjectId], excluded: &HashSet<ObjectId>) -> PackResult<Vec<WalkedObject>> {
        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        let mut queue: VecDeque<Pending> = roots.iter().copied().map(Pending::root).collect();
        self.progress.begin_task("Counting objects", None);

        while let Some(item) = queue.pop_front() {
            check_cancelled(self.progress)?;
            if excluded.contains(&item.id) || !seen.insert(item.id) {
                continue;
            }
            if item.kind == Some(ObjectKind::Blob) {
                if !self.db.has(&item.id)? {
                    return Err(PackError::MissingObject(item.id));
                }
                objects.push(WalkedObject {
                    id: item.id,
                    kind: ObjectKind::Blob,
                    path_hash: item.path_hash,
                });
                self.progress.update(objects.len() as u64);
                continue;
            }

            let object = self.db.read(&item.id)?;
            if let Some(expected) = item.kind {
                if expected != object.kind {
                    return Err(PackError::IncorrectType {
                        id: item.id,
                        expected,
                        actual: object.kind,
                    });
                }
            }
            objects.push(WalkedObject {
                id: item.id,
                kind: object.kind,
                path_hash: item.path_hash,
            });
            self.progress.update(objects.len() as u64);
            for reference in references(&object)? {
                queue.push_back(Pending {
                    id: reference.id,
                    kind: Some(reference.kind),
                    path_hash: reference.name.as_deref().map_or(0, path_hash),
                    edge: false,
                });
            }
        }
        self.progress.end_task();
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hash_ignores_whitespace_and_favors_suffix() {
        assert_eq!(path_hash("a b"), path_hash("ab"));
        assert_eq!(path_hash(""), 0);
        assert_eq!(path_hash("c"), u32::from(b'c') << 24);
        assert_eq!(path_hash("xc"), (u32::from(b'x') << 22) + (u32::from(b'c') << 24));
        assert_ne!(path_hash("main.c"), path_hash("main.h"));
    }
}
