use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::generate::generate_windows;
use super::guard::{find_double_booking, resolve_client, ClientIdentity};
use super::queries::view;
use super::reconcile::{self, HolderChange};
use super::rotation::{busy_workers, pick_worker};
use super::{parse_span, snapshot, Engine, EngineError};

fn reject(reason: &'static str) {
    metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => reason)
        .increment(1);
}

fn check_text(value: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn roster_size(roster: &[Worker]) -> u32 {
    roster.len() as u32
}

impl Engine {
    /// Open the availability windows for a month (or a whole year). Buckets that already
    /// have a window with the same range are skipped, so repeated calls are no-ops.
    /// New windows start out reserved by whatever already overlaps them.
    pub async fn generate_slots(
        &self,
        year: i32,
        month: Option<u32>,
    ) -> Result<Vec<SlotView>, EngineError> {
        let spans = generate_windows(year, month)?;
        let total = roster_size(&self.workers().await?);
        let mut guards = self.lock_days(spans.iter().map(Span::day)).await;

        let mut events = Vec::new();
        let mut opened = Vec::new();
        {
            let entries = snapshot(&guards);
            for span in &spans {
                let exists = entries
                    .iter()
                    .any(|e| e.is_window() && e.span == *span);
                if exists {
                    continue;
                }
                let id = Ulid::new();
                let reserved = reconcile::holders_over(&entries, span, id);
                events.push(Event::WindowOpened {
                    id,
                    span: *span,
                    reserved: reserved.iter().map(|(k, v)| (*k, *v)).collect(),
                });
                opened.push(Entry {
                    id,
                    span: *span,
                    kind: EntryKind::Window { reserved },
                });
            }
        }

        self.persist_and_apply(&mut guards, events).await?;
        tracing::info!(
            "generated {} windows for {year}{}",
            opened.len(),
            month.map(|m| format!("-{m:02}")).unwrap_or_default()
        );
        Ok(opened.iter().map(|e| view(e, total)).collect())
    }

    /// Book a client with the next free worker in rotation order, starting at `cursor`.
    /// Double-booking is checked first and consumes nothing. A full window anywhere in
    /// the range refuses the booking even when a worker is idle.
    pub async fn book_appointment(
        &self,
        request: BookingRequest,
        cursor: usize,
    ) -> Result<BookingOutcome, EngineError> {
        let span = parse_span(&request.start, &request.end)?;
        let client = resolve_client(&request.client)?;
        check_text(&request.description, MAX_DESCRIPTION_LEN, "description too long")?;
        let roster = self.workers().await?;
        let total = roster_size(&roster);

        let mut guards = self.lock_days([span.day()]).await;
        let id = Ulid::new();

        let (booking, next_cursor, plan) = {
            let entries = snapshot(&guards);
            if let Some(existing) = find_double_booking(entries.iter().copied(), &span, &client, None) {
                reject("already_booked");
                return Err(EngineError::AlreadyBooked(existing));
            }
            if reconcile::full_window(&entries, &span, id, total).is_some() {
                reject("no_capacity");
                return Err(EngineError::NoWorkerFree);
            }
            let busy = busy_workers(entries.iter().copied(), &span, None);
            let (worker, next_cursor) = pick_worker(&roster, &busy, cursor).inspect_err(|_| {
                reject("no_worker_free");
            })?;
            let booking = Booking {
                owner_id: worker.id,
                owner_name: worker.display_name(),
                client_id: client.id,
                client_name: client.name.clone(),
                description: request.description.clone(),
            };
            let plan = reconcile::plan(&entries, &HolderChange::create(id, span, 1), total);
            (booking, next_cursor, plan)
        };

        let head = vec![Event::AppointmentBooked {
            id,
            span,
            booking: booking.clone(),
        }];
        let mutations = self.commit_plan(&mut guards, head, plan).await?;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        tracing::debug!(
            "booked {id} at {} for {} with {}",
            span.start_label(),
            client.id,
            booking.owner_name
        );

        let entry = Entry {
            id,
            span,
            kind: EntryKind::Appointment(booking),
        };
        Ok(BookingOutcome {
            appointment: view(&entry, total),
            next_cursor,
            mutations,
        })
    }

    /// Move an appointment. Its identity persists; the owner changes only when the
    /// current owner is busy (or gone from the roster) over the new range.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        start: &str,
        end: &str,
    ) -> Result<RescheduleOutcome, EngineError> {
        let span = parse_span(start, end)?;
        let roster = self.workers().await?;
        let total = roster_size(&roster);
        let old_day = self.day_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let mut guards = self.lock_days([old_day, span.day()]).await;

        let (moved, plan) = {
            let entries = snapshot(&guards);
            let current = entries
                .iter()
                .find(|e| e.id == id)
                .ok_or(EngineError::NotFound(id))?;
            let booking = current.as_booking().ok_or(EngineError::NotFound(id))?;
            let client = ClientIdentity {
                id: booking.client_id,
                name: booking.client_name.clone(),
            };
            if let Some(existing) = find_double_booking(entries.iter().copied(), &span, &client, Some(id)) {
                reject("already_booked");
                return Err(EngineError::AlreadyBooked(existing));
            }

            if reconcile::full_window(&entries, &span, id, total).is_some() {
                reject("no_capacity");
                return Err(EngineError::NoWorkerFree);
            }
            let busy = busy_workers(entries.iter().copied(), &span, Some(id));
            let owner_index = roster.iter().position(|w| w.id == booking.owner_id);
            let owner = match owner_index {
                Some(i) if !busy.contains(&booking.owner_id) => &roster[i],
                Some(i) => pick_worker(&roster, &busy, i + 1)?.0,
                None => pick_worker(&roster, &busy, 0)?.0,
            };

            let mut moved = (*current).clone();
            moved.span = span;
            if let EntryKind::Appointment(b) = &mut moved.kind {
                b.owner_id = owner.id;
                b.owner_name = owner.display_name();
            }
            let plan = reconcile::plan(
                &entries,
                &HolderChange::moved(id, current.span, span, 1),
                total,
            );
            (moved, plan)
        };

        let Some(booking) = moved.as_booking() else {
            return Err(EngineError::NotFound(id));
        };
        let head = vec![Event::AppointmentMoved {
            id,
            span,
            owner_id: booking.owner_id,
            owner_name: booking.owner_name.clone(),
        }];
        let mutations = self.commit_plan(&mut guards, head, plan).await?;
        tracing::debug!("rescheduled {id} to {}", span.start_label());
        Ok(RescheduleOutcome {
            entry: view(&moved, total),
            mutations,
        })
    }

    /// Cancel an appointment and return its capacity to every window it held.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Vec<SlotMutation>, EngineError> {
        let total = roster_size(&self.workers().await?);
        let day = self.day_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let mut guards = self.lock_days([day]).await;

        let plan = {
            let entries = snapshot(&guards);
            let current = entries
                .iter()
                .find(|e| e.id == id && e.as_booking().is_some())
                .ok_or(EngineError::NotFound(id))?;
            reconcile::plan(&entries, &HolderChange::remove(id, current.span), total)
        };

        let mutations = self
            .commit_plan(&mut guards, vec![Event::AppointmentCancelled { id }], plan)
            .await?;
        tracing::debug!("cancelled {id}");
        Ok(mutations)
    }

    /// Move either kind of movable entry; `shared_with` only applies to internal events.
    pub async fn reschedule_entry(
        &self,
        id: Ulid,
        start: &str,
        end: &str,
        shared_with: Option<Vec<Ulid>>,
    ) -> Result<RescheduleOutcome, EngineError> {
        let is_internal = match self.get_entry(id).await {
            Some(entry) => matches!(entry.kind, EntryKind::Internal(_)),
            None => return Err(EngineError::NotFound(id)),
        };
        if is_internal {
            self.update_internal_event(id, start, end, shared_with).await
        } else if shared_with.is_some() {
            Err(EngineError::Validation(
                "participants can only be changed on internal events".into(),
            ))
        } else {
            self.reschedule_appointment(id, start, end).await
        }
    }

    // ── Internal events ─────────────────────────────────────

    fn check_participants(
        roster: &[Worker],
        owner_id: Ulid,
        shared_with: Vec<Ulid>,
    ) -> Result<Vec<Ulid>, EngineError> {
        if !roster.iter().any(|w| w.id == owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(shared_with.len());
        for id in shared_with {
            if id == owner_id || !seen.insert(id) {
                continue;
            }
            if !roster.iter().any(|w| w.id == id) {
                return Err(EngineError::NotFound(id));
            }
            out.push(id);
        }
        if out.len() > MAX_SHARED_WITH {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        Ok(out)
    }

    /// Create a worker-only event. It takes one unit per participant from every
    /// window it covers and marks the participants busy.
    pub async fn create_internal_event(
        &self,
        request: InternalEventRequest,
    ) -> Result<RescheduleOutcome, EngineError> {
        let span = parse_span(&request.start, &request.end)?;
        if request.title.trim().is_empty() {
            return Err(EngineError::Validation("title is required".into()));
        }
        if request.title.len() > MAX_TITLE_LEN {
            return Err(EngineError::LimitExceeded("title too long"));
        }
        check_text(&request.description, MAX_DESCRIPTION_LEN, "description too long")?;
        let roster = self.workers().await?;
        let total = roster_size(&roster);
        let shared_with = Self::check_participants(&roster, request.owner_id, request.shared_with)?;

        let meeting = InternalMeeting {
            owner_id: request.owner_id,
            shared_with,
            title: request.title,
            description: request.description,
        };
        let entry = Entry {
            id: Ulid::new(),
            span,
            kind: EntryKind::Internal(meeting.clone()),
        };
        let units = entry.holder_units().unwrap_or(1);

        let mut guards = self.lock_days([span.day()]).await;
        let plan = {
            let entries = snapshot(&guards);
            reconcile::plan(&entries, &HolderChange::create(entry.id, span, units), total)
        };
        let head = vec![Event::InternalEventCreated {
            id: entry.id,
            span,
            meeting,
        }];
        let mutations = self.commit_plan(&mut guards, head, plan).await?;
        Ok(RescheduleOutcome {
            entry: view(&entry, total),
            mutations,
        })
    }

    /// Move an internal event and optionally replace its participants. A changed
    /// participant count resizes the reservation in windows it keeps covering.
    pub async fn update_internal_event(
        &self,
        id: Ulid,
        start: &str,
        end: &str,
        shared_with: Option<Vec<Ulid>>,
    ) -> Result<RescheduleOutcome, EngineError> {
        let span = parse_span(start, end)?;
        let roster = self.workers().await?;
        let total = roster_size(&roster);
        let old_day = self.day_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let mut guards = self.lock_days([old_day, span.day()]).await;

        let (updated, plan) = {
            let entries = snapshot(&guards);
            let current = entries
                .iter()
                .find(|e| e.id == id)
                .ok_or(EngineError::NotFound(id))?;
            let EntryKind::Internal(meeting) = &current.kind else {
                return Err(EngineError::NotFound(id));
            };
            let mut meeting = meeting.clone();
            if let Some(list) = shared_with {
                meeting.shared_with = Self::check_participants(&roster, meeting.owner_id, list)?;
            }
            let updated = Entry {
                id,
                span,
                kind: EntryKind::Internal(meeting),
            };
            let units = updated.holder_units().unwrap_or(1);
            let plan = reconcile::plan(
                &entries,
                &HolderChange::moved(id, current.span, span, units),
                total,
            );
            (updated, plan)
        };

        let EntryKind::Internal(meeting) = &updated.kind else {
            return Err(EngineError::NotFound(id));
        };
        let head = vec![Event::InternalEventUpdated {
            id,
            span,
            shared_with: meeting.shared_with.clone(),
        }];
        let mutations = self.commit_plan(&mut guards, head, plan).await?;
        Ok(RescheduleOutcome {
            entry: view(&updated, total),
            mutations,
        })
    }

    pub async fn delete_internal_event(&self, id: Ulid) -> Result<Vec<SlotMutation>, EngineError> {
        let total = roster_size(&self.workers().await?);
        let day = self.day_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let mut guards = self.lock_days([day]).await;

        let plan = {
            let entries = snapshot(&guards);
            let current = entries
                .iter()
                .find(|e| e.id == id && matches!(e.kind, EntryKind::Internal(_)))
                .ok_or(EngineError::NotFound(id))?;
            reconcile::plan(&entries, &HolderChange::remove(id, current.span), total)
        };
        self.commit_plan(&mut guards, vec![Event::InternalEventDeleted { id }], plan)
            .await
    }

    // ── Compaction ──────────────────────────────────────────

    /// Rewrite the journal with the minimal events that recreate the current state.
    /// The commit gate is held exclusively until the swap, so no operation creates a
    /// day or commits between the snapshot and the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let gate = self.commit_gate.write().await;
        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(day, _)| *day);

        let mut guards = Vec::with_capacity(days.len());
        for (_, ds) in days {
            guards.push(ds.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            for entry in &guard.entries {
                events.push(match &entry.kind {
                    EntryKind::Window { reserved } => Event::WindowOpened {
                        id: entry.id,
                        span: entry.span,
                        reserved: reserved.iter().map(|(k, v)| (*k, *v)).collect(),
                    },
                    EntryKind::Appointment(booking) => Event::AppointmentBooked {
                        id: entry.id,
                        span: entry.span,
                        booking: booking.clone(),
                    },
                    EntryKind::Internal(meeting) => Event::InternalEventCreated {
                        id: entry.id,
                        span: entry.span,
                        meeting: meeting.clone(),
                    },
                });
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        drop(gate);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

