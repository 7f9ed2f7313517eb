use ulid::Ulid;

use crate::model::*;
use crate::time;

use super::{Engine, EngineError};

/// Outward view of an entry against a roster of `total` workers.
pub fn view(entry: &Entry, total: u32) -> SlotView {
    let (title, kind, visibility) = match &entry.kind {
        EntryKind::Window { reserved } => {
            let (remaining, _) = remaining_capacity(reserved, total);
            let kind = if remaining == 0 {
                SlotKind::FullyBooked
            } else {
                SlotKind::Available { remaining }
            };
            (window_title(remaining, total), kind, Visibility::Public)
        }
        EntryKind::Appointment(b) => (
            booking_title(b),
            SlotKind::Booked {
                owner_id: b.owner_id,
                client_id: b.client_id,
                client_name: b.client_name.clone(),
            },
            Visibility::Public,
        ),
        EntryKind::Internal(m) => (
            m.title.clone(),
            SlotKind::Internal {
                owner_id: m.owner_id,
                shared_with: m.shared_with.clone(),
            },
            Visibility::Internal,
        ),
    };
    SlotView {
        id: entry.id,
        title,
        start: entry.span.start_label(),
        end: entry.span.end_label(),
        kind,
        visibility,
    }
}

impl Engine {
    pub async fn get_entry(&self, id: Ulid) -> Option<Entry> {
        let day = self.day_for_entity(&id)?;
        let ds = self.get_day(&day)?;
        let guard = ds.read().await;
        guard.get(id).cloned()
    }

    pub async fn get_slot(&self, id: Ulid) -> Result<SlotView, EngineError> {
        self.get_matching(id, |_| true).await
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<SlotView, EngineError> {
        self.get_matching(id, |e| e.as_booking().is_some()).await
    }

    pub async fn get_internal_event(&self, id: Ulid) -> Result<SlotView, EngineError> {
        self.get_matching(id, |e| matches!(e.kind, EntryKind::Internal(_)))
            .await
    }

    async fn get_matching(
        &self,
        id: Ulid,
        keep: impl Fn(&Entry) -> bool,
    ) -> Result<SlotView, EngineError> {
        let total = self.workers().await?.len() as u32;
        let entry = self
            .get_entry(id)
            .await
            .filter(|e| keep(e))
            .ok_or(EngineError::NotFound(id))?;
        Ok(view(&entry, total))
    }

    /// Every entry lying entirely inside `[start, end]`, in chronological order.
    /// Window capacity is evaluated against the roster as it is now.
    pub async fn list_slots(&self, start: &str, end: &str) -> Result<Vec<SlotView>, EngineError> {
        let from = time::parse_stamp(start)
            .ok_or_else(|| EngineError::Validation(format!("unparseable start: {start:?}")))?;
        let to = time::parse_stamp(end)
            .ok_or_else(|| EngineError::Validation(format!("unparseable end: {end:?}")))?;
        if from > to {
            return Err(EngineError::Validation("start must not be after end".into()));
        }
        let total = self.workers().await?.len() as u32;
        let first = time::day_of(from);
        let last = time::day_of(to);

        let mut days: Vec<_> = self
            .days
            .iter()
            .filter(|e| *e.key() >= first && *e.key() <= last)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(day, _)| *day);

        let mut out = Vec::new();
        for (_, ds) in days {
            let guard = ds.read().await;
            out.extend(
                guard
                    .entries
                    .iter()
                    .filter(|e| e.span.start >= from && e.span.end <= to)
                    .map(|e| view(e, total)),
            );
        }
        Ok(out)
    }

    /// Appointments in chronological order, optionally only one worker's.
    pub async fn list_appointments(&self, owner: Option<Ulid>) -> Vec<Entry> {
        self.collect_entries(|e| match e.as_booking() {
            Some(b) => owner.is_none_or(|o| o == b.owner_id),
            None => false,
        })
        .await
    }

    /// Internal events in chronological order, optionally only those a worker
    /// owns or takes part in.
    pub async fn list_internal_events(&self, worker: Option<Ulid>) -> Vec<Entry> {
        self.collect_entries(|e| match &e.kind {
            EntryKind::Internal(m) => {
                worker.is_none_or(|w| m.owner_id == w || m.shared_with.contains(&w))
            }
            _ => false,
        })
        .await
    }

    async fn collect_entries(&self, keep: impl Fn(&Entry) -> bool) -> Vec<Entry> {
        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(day, _)| *day);

        let mut out = Vec::new();
        for (_, ds) in days {
            let guard = ds.read().await;
            out.extend(guard.entries.iter().filter(|e| keep(e)).cloned());
        }
        out
    }
}
