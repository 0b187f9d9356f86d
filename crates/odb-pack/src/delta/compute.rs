//! Delta generation.
//!
//! The base is cut into fixed-size blocks and indexed by content. The target
//! is scanned byte by byte; whenever the next block of target bytes matches
//! an indexed block, the match is extended forwards and backwards and
//! emitted as a copy. Everything else becomes literal inserts.

use std::collections::HashMap;

use super::DeltaEncoder;

const BLOCK_SIZE: usize = 16;

/// Compute a delta that rebuilds `target` from `base`.
pub fn compute_delta(base: &[u8], target: &[u8]) -> Vec<u8> {
    encode(base, target, usize::MAX)
        .map(DeltaEncoder::finish)
        .unwrap_or_default()
}

/// Like [`compute_delta`], but gives up as soon as the encoded delta would
/// exceed `limit` bytes.
pub fn compute_delta_limited(base: &[u8], target: &[u8], limit: usize) -> Option<Vec<u8>> {
    encode(base, target, limit).map(DeltaEncoder::finish)
}

fn encode(base: &[u8], target: &[u8], limit: usize) -> Option<DeltaEncoder> {
    let mut encoder = DeltaEncoder::new(base.len() as u64, target.len() as u64);
    let index = block_index(base);
    let mut pending: Vec<u8> = Vec::new();
    let mut tpos = 0;

    while tpos < target.len() {
        let matched = target
            .get(tpos..tpos + BLOCK_SIZE)
            .and_then(|block| index.get(block).copied());

        let Some(src) = matched else {
            pending.push(target[tpos]);
            tpos += 1;
            if pending.len() > limit {
                return None;
            }
            continue;
        };

        let forward = extend_forward(base, src, target, tpos);
        let mut start = src;
        while start > 0 && pending.last() == Some(&base[start - 1]) {
            pending.pop();
            start -= 1;
        }

        encoder.insert(&pending);
        pending.clear();
        encoder.copy(start as u64, (src - start + forward) as u64);
        if encoder.len() > limit {
            return None;
        }
        tpos += forward;
    }

    encoder.insert(&pending);
    (encoder.len() <= limit).then_some(encoder)
}

fn block_index(base: &[u8]) -> HashMap<&[u8], usize> {
    let mut index = HashMap::new();
    if base.len() < BLOCK_SIZE {
        return index;
    }
    for offset in (0..=base.len() - BLOCK_SIZE).step_by(BLOCK_SIZE) {
        index.entry(&base[offset..offset + BLOCK_SIZE]).or_insert(offset);
    }
    index
}

fn extend_forward(base: &[u8], src: usize, target: &[u8], tpos: usize) -> usize {
    let max = (base.len() - src).min(target.len() - tpos);
    let mut len = BLOCK_SIZE;
    while len < max && base[src + len] == target[tpos + len] {
        len += 1;
    }
    len
}
