use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::time::{self, DAY};

use super::guard::{find_double_booking, ClientIdentity};
use super::reconcile::{self, HolderChange};
use super::rotation::{busy_workers, first_free};
use super::{snapshot, Engine, EngineError, LockedDays, Scratch};

fn outcome(label: &'static str) {
    metrics::counter!(crate::observability::REASSIGNMENTS_TOTAL, "outcome" => label).increment(1);
}

/// Still the unavailable worker's appointment at the same place?
fn still_assigned(guards: &LockedDays, id: Ulid, worker_id: Ulid) -> Option<Entry> {
    guards
        .values()
        .flat_map(|g| g.entries.iter())
        .find(|e| e.id == id && e.as_booking().is_some_and(|b| b.owner_id == worker_id))
        .cloned()
}

impl Engine {
    /// Hand every appointment of an unavailable worker to someone else.
    ///
    /// Each appointment, in chronological order, is first offered to the other workers
    /// in roster order at its own time. Failing that, it is relocated to the earliest
    /// window at or after its start where a same-length range lies wholly inside open
    /// windows with capacity left, the client is not double-booked and some other
    /// worker is free: the original is cancelled and a new appointment booked.
    /// Anything else is reported as unresolved. One failure never stops the rest.
    pub async fn reassign_worker(&self, worker_id: Ulid) -> Result<ReassignReport, EngineError> {
        let roster = self.workers().await?;
        if !roster.iter().any(|w| w.id == worker_id) {
            return Err(EngineError::NotFound(worker_id));
        }
        let total = roster.len() as u32;

        let mut report = ReassignReport::default();
        let mut pending: Vec<(Ulid, Span)> = self
            .list_appointments(Some(worker_id))
            .await
            .into_iter()
            .map(|e| (e.id, e.span))
            .collect();
        pending.sort_by_key(|(id, span)| (span.start, *id));

        for (id, span) in pending {
            if let Some(done) = self.reassign_direct(id, span, worker_id, &roster).await? {
                outcome("direct");
                report.reassigned.push(done);
                continue;
            }
            match self.relocate(id, span, worker_id, &roster, total).await? {
                Some(done) => {
                    outcome("relocated");
                    report.reassigned.push(done);
                }
                None => {
                    outcome("unresolved");
                    report.unresolved.push(UnresolvedReassignment {
                        appointment_id: id,
                        span,
                        reason: "no other worker is free at this time or at any later slot".into(),
                    });
                }
            }
        }

        tracing::info!(
            "reassigned {} appointments of worker {worker_id}, {} unresolved",
            report.reassigned.len(),
            report.unresolved.len()
        );
        Ok(report)
    }

    async fn reassign_direct(
        &self,
        id: Ulid,
        span: Span,
        worker_id: Ulid,
        roster: &[Worker],
    ) -> Result<Option<Reassignment>, EngineError> {
        let mut guards = self.lock_days([span.day()]).await;
        let Some(current) = still_assigned(&guards, id, worker_id) else {
            return Ok(None);
        };
        let replacement = {
            let entries = snapshot(&guards);
            let busy = busy_workers(entries.iter().copied(), &current.span, Some(id));
            first_free(roster, &busy, worker_id).cloned()
        };
        let Some(worker) = replacement else {
            return Ok(None);
        };

        let event = Event::AppointmentMoved {
            id,
            span: current.span,
            owner_id: worker.id,
            owner_name: worker.display_name(),
        };
        self.persist_and_apply(&mut guards, vec![event]).await?;
        tracing::debug!("appointment {id} handed to {}", worker.display_name());
        Ok(Some(Reassignment::Direct {
            appointment_id: id,
            span: current.span,
            worker_id: worker.id,
        }))
    }

    /// Days from `from` onwards that hold at least one window, in date order.
    async fn window_days_from(&self, from: NaiveDate) -> Vec<NaiveDate> {
        let mut days: Vec<_> = self
            .days
            .iter()
            .filter(|e| *e.key() >= from)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(day, _)| *day);

        let mut out = Vec::new();
        for (day, ds) in days {
            if ds.read().await.windows().next().is_some() {
                out.push(day);
            }
        }
        out
    }

    async fn relocate(
        &self,
        id: Ulid,
        span: Span,
        worker_id: Ulid,
        roster: &[Worker],
        total: u32,
    ) -> Result<Option<Reassignment>, EngineError> {
        let duration = span.duration_ms();
        let origin_day = span.day();

        for candidate_day in self.window_days_from(origin_day).await {
            let mut guards = self.lock_days([origin_day, candidate_day]).await;
            let Some(current) = still_assigned(&guards, id, worker_id) else {
                return Ok(None);
            };
            let Some(booking) = current.as_booking().cloned() else {
                return Ok(None);
            };
            let client = ClientIdentity {
                id: booking.client_id,
                name: booking.client_name.clone(),
            };

            let cancel = reconcile::plan(
                &snapshot(&guards),
                &HolderChange::remove(id, current.span),
                total,
            );
            let mut after_cancel = Scratch::from_locked(&guards);
            after_cancel.apply(&[Event::AppointmentCancelled { id }]);
            after_cancel.apply(&cancel.events);

            let day_end = time::day_start(candidate_day) + DAY;
            let starts: Vec<Ms> = guards
                .get(&candidate_day)
                .map(|g| {
                    g.windows()
                        .map(|w| w.span.start)
                        .filter(|s| *s >= current.span.start && *s + duration <= day_end)
                        .collect()
                })
                .unwrap_or_default();

            let mut chosen = None;
            for start in starts {
                let target = Span::new(start, start + duration);
                let entries = after_cancel.snapshot();

                if !reconcile::fits_open_windows(&entries, &target, id, total) {
                    continue;
                }
                if find_double_booking(entries.iter().copied(), &target, &client, None).is_some() {
                    continue;
                }
                let busy = busy_workers(entries.iter().copied(), &target, None);
                let Some(worker) = first_free(roster, &busy, worker_id) else {
                    continue;
                };
                chosen = Some((target, worker.clone()));
                break;
            }

            let Some((target, worker)) = chosen else {
                continue;
            };

            let new_id = Ulid::new();
            let new_booking = Booking {
                owner_id: worker.id,
                owner_name: worker.display_name(),
                ..booking
            };
            let book = reconcile::plan(
                &after_cancel.snapshot(),
                &HolderChange::create(new_id, target, 1),
                total,
            );

            let mut plan = cancel;
            plan.extend(book);
            let head = vec![
                Event::AppointmentCancelled { id },
                Event::AppointmentBooked {
                    id: new_id,
                    span: target,
                    booking: new_booking,
                },
            ];
            self.commit_plan(&mut guards, head, plan).await?;
            tracing::debug!(
                "appointment {id} relocated to {} as {new_id} with {}",
                target.start_label(),
                worker.display_name()
            );
            return Ok(Some(Reassignment::Relocated {
                old_id: id,
                new_id,
                span: target,
                worker_id: worker.id,
            }));
        }

        Ok(None)
    }
}
