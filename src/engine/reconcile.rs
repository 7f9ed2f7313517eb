use std::collections::BTreeMap;

use ulid::Ulid;

use crate::model::*;

use super::cluster::cluster_members;

/// One holder's movement between two ranges. `old == None` is a creation,
/// `new == None` is a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolderChange {
    pub holder_id: Ulid,
    pub old: Option<Span>,
    pub new: Option<Span>,
    pub new_units: u32,
}

impl HolderChange {
    pub fn create(holder_id: Ulid, span: Span, units: u32) -> Self {
        Self {
            holder_id,
            old: None,
            new: Some(span),
            new_units: units,
        }
    }

    pub fn remove(holder_id: Ulid, span: Span) -> Self {
        Self {
            holder_id,
            old: Some(span),
            new: None,
            new_units: 0,
        }
    }

    pub fn moved(holder_id: Ulid, old: Span, new: Span, units: u32) -> Self {
        Self {
            holder_id,
            old: Some(old),
            new: Some(new),
            new_units: units,
        }
    }
}

/// Window mutations and their journal events, computed against one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub mutations: Vec<SlotMutation>,
    pub events: Vec<Event>,
    /// Windows whose reservations exceed the roster after this plan.
    pub clamped: Vec<Ulid>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn extend(&mut self, other: ReconcilePlan) {
        self.mutations.extend(other.mutations);
        self.events.extend(other.events);
        self.clamped.extend(other.clamped);
    }
}

fn touches(range: Option<Span>, window: &Span) -> bool {
    range.is_some_and(|r| r.overlaps(window))
}

/// Plan the capacity mutations for `change` against `snapshot`, the full working set of
/// the affected days as read under lock. `total` is the current roster size.
pub fn plan(snapshot: &[&Entry], change: &HolderChange, total: u32) -> ReconcilePlan {
    let incoming = Ulid::new();
    let mut records: Vec<(Ulid, Span)> = snapshot
        .iter()
        .filter(|e| e.id != change.holder_id)
        .map(|e| (e.id, e.span))
        .collect();
    let mut seeds = Vec::with_capacity(2);
    if let Some(old) = change.old {
        records.push((change.holder_id, old));
        seeds.push(change.holder_id);
    }
    if let Some(new) = change.new {
        records.push((incoming, new));
        seeds.push(incoming);
    }
    let eligible = cluster_members(&records, &seeds);

    let mut out = ReconcilePlan::default();
    for window in snapshot.iter().filter(|e| eligible.contains(&e.id)) {
        let Some(reserved) = window.reserved() else {
            continue;
        };
        let held = reserved.get(&change.holder_id).copied();
        let in_new = touches(change.new, &window.span);

        let (action, event) = match (held, in_new) {
            (Some(_), false) => (
                SlotAction::Restore,
                Event::WindowReleased {
                    window_id: window.id,
                    holder_id: change.holder_id,
                },
            ),
            (None, true) => (
                SlotAction::Reduce,
                Event::WindowReserved {
                    window_id: window.id,
                    holder_id: change.holder_id,
                    units: change.new_units,
                },
            ),
            (Some(units), true) if units != change.new_units => (
                SlotAction::Resize,
                Event::WindowReserved {
                    window_id: window.id,
                    holder_id: change.holder_id,
                    units: change.new_units,
                },
            ),
            _ => continue,
        };

        let mut after = reserved.clone();
        if in_new {
            after.insert(change.holder_id, change.new_units);
        } else {
            after.remove(&change.holder_id);
        }
        let (remaining, clamped) = remaining_capacity(&after, total);
        if clamped {
            out.clamped.push(window.id);
        }
        out.mutations.push(SlotMutation {
            window_id: window.id,
            span: window.span,
            action,
            remaining,
        });
        out.events.push(event);
    }

    if let Some(old) = change.old {
        for bucket in old.hour_buckets() {
            if touches(change.new, &bucket) {
                continue;
            }
            let covered = snapshot
                .iter()
                .any(|e| e.is_window() && e.span.overlaps(&bucket));
            if covered {
                continue;
            }
            let reserved = holders_over(snapshot, &bucket, change.holder_id);
            let (remaining, clamped) = remaining_capacity(&reserved, total);
            let id = Ulid::new();
            if clamped {
                out.clamped.push(id);
            }
            out.mutations.push(SlotMutation {
                window_id: id,
                span: bucket,
                action: SlotAction::Recreate,
                remaining,
            });
            out.events.push(Event::WindowOpened {
                id,
                span: bucket,
                reserved: reserved.into_iter().collect(),
            });
        }
    }

    out
}

/// First window overlapping `span` that has no capacity left for `holder`. Windows the
/// holder already reserves never count as full for it.
pub fn full_window(snapshot: &[&Entry], span: &Span, holder: Ulid, total: u32) -> Option<Ulid> {
    snapshot
        .iter()
        .filter(|e| e.span.overlaps(span))
        .find(|e| {
            e.reserved().is_some_and(|r| {
                !r.contains_key(&holder) && remaining_capacity(r, total).0 == 0
            })
        })
        .map(|e| e.id)
}

/// Every hour `span` touches has a window, and none of them is full.
pub fn fits_open_windows(snapshot: &[&Entry], span: &Span, holder: Ulid, total: u32) -> bool {
    let covered = span.hour_buckets().iter().all(|bucket| {
        snapshot
            .iter()
            .any(|e| e.is_window() && e.span.overlaps(bucket))
    });
    covered && full_window(snapshot, span, holder, total).is_none()
}

/// Holders other than `skip` that overlap `span`, with their units.
pub fn holders_over(snapshot: &[&Entry], span: &Span, skip: Ulid) -> BTreeMap<Ulid, u32> {
    snapshot
        .iter()
        .filter(|e| e.id != skip && e.span.overlaps(span))
        .filter_map(|e| e.holder_units().map(|u| (e.id, u)))
        .collect()
}
