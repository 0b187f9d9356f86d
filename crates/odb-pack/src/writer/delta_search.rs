//! Sliding-window delta search.
//!
//! Candidates are sorted so objects of the same kind and similar path sit
//! next to each other, larger first. Each target is tried against the
//! previous `window` candidates of its kind and keeps the smallest delta
//! that is meaningfully smaller than the object itself.

use std::collections::VecDeque;
use std::sync::Arc;

use odb_types::{ObjectId, ObjectKind};

use crate::database::PackDatabase;
use crate::delta::compute_delta_limited;
use crate::error::PackResult;
use crate::progress::{check_cancelled, ProgressMonitor};

/// Which role a candidate plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Selected object at this position of the writer's list; may become
    /// a delta and may serve as a base.
    Target(usize),
    /// Object the receiver already has; only ever a base.
    Edge,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub slot: Slot,
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub path_hash: u32,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Base {
    Target(usize),
    Edge(ObjectId),
}

#[derive(Debug)]
pub(crate) struct DeltaChoice {
    pub target: usize,
    pub base: Base,
    pub delta: Vec<u8>,
}

struct WindowEntry {
    candidate: Candidate,
    data: Arc<[u8]>,
    depth: usize,
}

pub(crate) fn search(
    db: &PackDatabase,
    mut candidates: Vec<Candidate>,
    window: usize,
    max_depth: usize,
    progress: &dyn ProgressMonitor,
) -> PackResult<Vec<DeltaChoice>> {
    if window == 0 || max_depth == 0 {
        return Ok(Vec::new());
    }
    candidates.sort_by(|a, b| {
        a.kind
            .type_code()
            .cmp(&b.kind.type_code())
            .then(a.path_hash.cmp(&b.path_hash))
            .then(b.size.cmp(&a.size))
            .then(a.id.cmp(&b.id))
    });

    progress.begin_task("Compressing objects", Some(candidates.len() as u64));
    let mut choices = Vec::new();
    let mut recent: VecDeque<WindowEntry> = VecDeque::with_capacity(window + 1);
    for (done, candidate) in candidates.into_iter().enumerate() {
        check_cancelled(progress)?;
        progress.update(done as u64 + 1);

        let loader = db.open_object(&candidate.id, Some(candidate.kind))?;
        let Some(data) = loader.cached_arc().filter(|_| !loader.is_large()) else {
            continue;
        };

        let mut depth = 0;
        if let Slot::Target(target) = candidate.slot {
            if let Some((entry, delta)) = best_delta(&recent, &candidate, &data, max_depth) {
                let base = match entry.candidate.slot {
                    Slot::Target(index) => Base::Target(index),
                    Slot::Edge => Base::Edge(entry.candidate.id),
                };
                depth = entry.depth + 1;
                choices.push(DeltaChoice { target, base, delta });
            }
        }

        recent.push_back(WindowEntry {
            candidate,
            data,
            depth,
        });
        if recent.len() > window {
            recent.pop_front();
        }
    }
    progress.end_task();
    Ok(choices)
}

fn best_delta<'w>(
    recent: &'w VecDeque<WindowEntry>,
    target: &Candidate,
    data: &[u8],
    max_depth: usize,
) -> Option<(&'w WindowEntry, Vec<u8>)> {
    let mut best: Option<(&WindowEntry, Vec<u8>)> = None;
    for entry in recent.iter().rev() {
        if entry.candidate.kind != target.kind || entry.depth + 1 > max_depth {
            continue;
        }
        let limit = match &best {
            Some((_, delta)) => delta.len().saturating_sub(1),
            None => (data.len() / 2).saturating_sub(20),
        };
        if limit == 0 {
            break;
        }
        if let Some(delta) = compute_delta_limited(&entry.data, data, limit) {
            best = Some((entry, delta));
        }
    }
    best
}
