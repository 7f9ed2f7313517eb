use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Workers occupied by any entry overlapping `span`. `exclude` skips one entry,
/// typically the one being moved.
pub fn busy_workers<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
    span: &Span,
    exclude: Option<Ulid>,
) -> HashSet<Ulid> {
    entries
        .into_iter()
        .filter(|e| Some(e.id) != exclude && e.span.overlaps(span))
        .flat_map(|e| e.busy_workers())
        .collect()
}

/// Round-robin pick: walk the roster from `cursor` and return the first free worker
/// together with the cursor for the next call.
pub fn pick_worker<'a>(
    roster: &'a [Worker],
    busy: &HashSet<Ulid>,
    cursor: usize,
) -> Result<(&'a Worker, usize), EngineError> {
    let len = roster.len();
    if len == 0 {
        return Err(EngineError::NoWorkerFree);
    }
    for step in 0..len {
        let index = (cursor + step) % len;
        let worker = &roster[index];
        if !busy.contains(&worker.id) {
            return Ok((worker, (index + 1) % len));
        }
    }
    Err(EngineError::NoWorkerFree)
}

/// First free worker in roster order, skipping `skip`.
pub fn first_free<'a>(
    roster: &'a [Worker],
    busy: &HashSet<Ulid>,
    skip: Ulid,
) -> Option<&'a Worker> {
    roster
        .iter()
        .find(|w| w.id != skip && !busy.contains(&w.id))
}
