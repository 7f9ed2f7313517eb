mod cluster;
mod error;
pub mod generate;
pub mod guard;
mod mutations;
mod queries;
mod reassign;
pub mod reconcile;
pub mod roster;
pub mod rotation;

pub use cluster::group_overlapping;
pub use error::EngineError;
pub use queries::view;
pub use roster::{JsonFileRoster, StaticRoster, WorkerRoster};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::MAX_ENTRIES_PER_DAY;
use crate::model::*;
use crate::time::{self, DAY};
use crate::wal::Wal;

use reconcile::ReconcilePlan;

pub type SharedDayState = Arc<RwLock<DayState>>;

/// Write guards for every day an operation touches, keyed (and acquired) in date order.
/// Also holds the commit gate shared until dropped, so compaction waits for the
/// operation to finish.
pub(super) struct LockedDays {
    days: BTreeMap<NaiveDate, OwnedRwLockWriteGuard<DayState>>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for LockedDays {
    type Target = BTreeMap<NaiveDate, OwnedRwLockWriteGuard<DayState>>;

    fn deref(&self) -> &Self::Target {
        &self.days
    }
}

impl DerefMut for LockedDays {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.days
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches commits.
/// Blocks for the first append, drains whatever else is queued, then syncs once
/// for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingCommit>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("journal flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingCommit]) -> io::Result<()> {
    let mut append_err = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so no partial frame lingers in the buffer.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Event application ────────────────────────────────────

/// Mutable access to the day partitions an event touches.
pub(super) trait DayAccess {
    fn day_mut(&mut self, day: NaiveDate) -> Option<&mut DayState>;
}

impl DayAccess for LockedDays {
    fn day_mut(&mut self, day: NaiveDate) -> Option<&mut DayState> {
        self.get_mut(&day).map(|guard| &mut **guard)
    }
}

impl DayAccess for BTreeMap<NaiveDate, DayState> {
    fn day_mut(&mut self, day: NaiveDate) -> Option<&mut DayState> {
        Some(self.entry(day).or_insert_with(|| DayState::new(day)))
    }
}

fn insert_entry<D: DayAccess>(days: &mut D, entry: Entry, index: &DashMap<Ulid, NaiveDate>) {
    let day = entry.span.day();
    match days.day_mut(day) {
        Some(ds) => {
            index.insert(entry.id, day);
            ds.insert(entry);
        }
        None => tracing::warn!("apply: day {day} not locked for entry {}", entry.id),
    }
}

fn take_entry<D: DayAccess>(days: &mut D, id: Ulid, index: &DashMap<Ulid, NaiveDate>) -> Option<Entry> {
    let (_, day) = index.remove(&id)?;
    days.day_mut(day)?.remove(id)
}

fn window_reservations<'a, D: DayAccess>(
    days: &'a mut D,
    window_id: Ulid,
    index: &DashMap<Ulid, NaiveDate>,
) -> Option<&'a mut BTreeMap<Ulid, u32>> {
    let day = *index.get(&window_id)?.value();
    match &mut days.day_mut(day)?.get_mut(window_id)?.kind {
        EntryKind::Window { reserved } => Some(reserved),
        _ => None,
    }
}

/// Apply one journal event. The caller holds every day the event touches.
pub(super) fn apply_event<D: DayAccess>(days: &mut D, event: &Event, index: &DashMap<Ulid, NaiveDate>) {
    match event {
        Event::WindowOpened { id, span, reserved } => insert_entry(
            days,
            Entry {
                id: *id,
                span: *span,
                kind: EntryKind::Window {
                    reserved: reserved.iter().copied().collect(),
                },
            },
            index,
        ),
        Event::WindowReserved {
            window_id,
            holder_id,
            units,
        } => {
            if let Some(reserved) = window_reservations(days, *window_id, index) {
                reserved.insert(*holder_id, *units);
            }
        }
        Event::WindowReleased {
            window_id,
            holder_id,
        } => {
            if let Some(reserved) = window_reservations(days, *window_id, index) {
                reserved.remove(holder_id);
            }
        }
        Event::AppointmentBooked { id, span, booking } => insert_entry(
            days,
            Entry {
                id: *id,
                span: *span,
                kind: EntryKind::Appointment(booking.clone()),
            },
            index,
        ),
        Event::AppointmentMoved {
            id,
            span,
            owner_id,
            owner_name,
        } => {
            if let Some(mut entry) = take_entry(days, *id, index) {
                entry.span = *span;
                if let EntryKind::Appointment(b) = &mut entry.kind {
                    b.owner_id = *owner_id;
                    b.owner_name = owner_name.clone();
                }
                insert_entry(days, entry, index);
            }
        }
        Event::InternalEventCreated { id, span, meeting } => insert_entry(
            days,
            Entry {
                id: *id,
                span: *span,
                kind: EntryKind::Internal(meeting.clone()),
            },
            index,
        ),
        Event::InternalEventUpdated {
            id,
            span,
            shared_with,
        } => {
            if let Some(mut entry) = take_entry(days, *id, index) {
                entry.span = *span;
                if let EntryKind::Internal(m) = &mut entry.kind {
                    m.shared_with = shared_with.clone();
                }
                insert_entry(days, entry, index);
            }
        }
        Event::AppointmentCancelled { id } | Event::InternalEventDeleted { id } => {
            take_entry(days, *id, index);
        }
    }
}

/// Throwaway copy of locked days, used to plan a second step against the state
/// a first step would leave behind.
pub(super) struct Scratch {
    days: BTreeMap<NaiveDate, DayState>,
    index: DashMap<Ulid, NaiveDate>,
}

impl Scratch {
    pub(super) fn from_locked(guards: &LockedDays) -> Self {
        let index = DashMap::new();
        let days: BTreeMap<NaiveDate, DayState> = guards
            .iter()
            .map(|(day, guard)| {
                for e in &guard.entries {
                    index.insert(e.id, *day);
                }
                (*day, (**guard).clone())
            })
            .collect();
        Self { days, index }
    }

    pub(super) fn apply(&mut self, events: &[Event]) {
        for event in events {
            apply_event(&mut self.days, event, &self.index);
        }
    }

    pub(super) fn snapshot(&self) -> Vec<&Entry> {
        self.days.values().flat_map(|ds| ds.entries.iter()).collect()
    }
}

pub(super) fn snapshot(guards: &LockedDays) -> Vec<&Entry> {
    guards.values().flat_map(|g| g.entries.iter()).collect()
}

/// Parse and check a caller-supplied range. Entries may not cross midnight.
pub(super) fn parse_span(start: &str, end: &str) -> Result<Span, EngineError> {
    let s = time::parse_stamp(start)
        .ok_or_else(|| EngineError::Validation(format!("unparseable start: {start:?}")))?;
    let e = time::parse_stamp(end)
        .ok_or_else(|| EngineError::Validation(format!("unparseable end: {end:?}")))?;
    if s >= e {
        return Err(EngineError::Validation(format!(
            "start must be before end: {} >= {}",
            time::format_stamp(s),
            time::format_stamp(e)
        )));
    }
    if e > time::day_start(time::day_of(s)) + DAY {
        return Err(EngineError::Validation(
            "entries may not cross midnight".into(),
        ));
    }
    Ok(Span::new(s, e))
}

pub struct Engine {
    pub days: DashMap<NaiveDate, SharedDayState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) roster: Arc<dyn WorkerRoster>,
    /// Reverse lookup: entry id → day partition.
    pub(super) entity_to_day: DashMap<Ulid, NaiveDate>,
    /// Shared by every mutation from locking through commit; compaction takes it exclusively.
    pub(super) commit_gate: Arc<RwLock<()>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, roster: Arc<dyn WorkerRoster>) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_day = DashMap::new();
        let mut replayed: BTreeMap<NaiveDate, DayState> = BTreeMap::new();
        for event in commits.iter().flatten() {
            apply_event(&mut replayed, event, &entity_to_day);
        }
        let days = replayed
            .into_iter()
            .map(|(day, ds)| (day, Arc::new(RwLock::new(ds))))
            .collect();

        tracing::debug!(
            "replayed {} commits from {}",
            commits.len(),
            wal_path.display()
        );
        Ok(Self {
            days,
            wal_tx,
            roster,
            entity_to_day,
            commit_gate: Arc::new(RwLock::new(())),
        })
    }

    /// Append one commit via the group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn workers(&self) -> Result<Vec<Worker>, EngineError> {
        self.roster.workers().await
    }

    pub fn day_for_entity(&self, id: &Ulid) -> Option<NaiveDate> {
        self.entity_to_day.get(id).map(|e| *e.value())
    }

    pub fn get_day(&self, day: &NaiveDate) -> Option<SharedDayState> {
        self.days.get(day).map(|e| e.value().clone())
    }

    fn day_or_create(&self, day: NaiveDate) -> SharedDayState {
        self.days
            .entry(day)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(day))))
            .value()
            .clone()
    }

    /// Acquire write locks on `days` in date order.
    pub(super) async fn lock_days(&self, days: impl IntoIterator<Item = NaiveDate>) -> LockedDays {
        let ordered: BTreeSet<NaiveDate> = days.into_iter().collect();
        let gate = self.commit_gate.clone().read_owned().await;
        let mut guards = BTreeMap::new();
        for day in ordered {
            let ds = self.day_or_create(day);
            guards.insert(day, ds.write_owned().await);
        }
        LockedDays {
            days: guards,
            _gate: gate,
        }
    }

    /// Journal the commit, then apply it to the locked days.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut LockedDays,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut added: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for day in events.iter().filter_map(event_target_day) {
            *added.entry(day).or_default() += 1;
        }
        for (day, count) in added {
            if let Some(ds) = guards.get(&day)
                && ds.entries.len() + count > MAX_ENTRIES_PER_DAY
            {
                return Err(EngineError::LimitExceeded("too many entries on day"));
            }
        }
        self.wal_append(events.clone()).await?;
        for event in &events {
            apply_event(guards, event, &self.entity_to_day);
        }
        Ok(())
    }

    /// Persist a holder event together with its reconciliation plan.
    pub(super) async fn commit_plan(
        &self,
        guards: &mut LockedDays,
        head: Vec<Event>,
        plan: ReconcilePlan,
    ) -> Result<Vec<SlotMutation>, EngineError> {
        let mut events = head;
        events.extend(plan.events);
        self.persist_and_apply(guards, events).await?;
        record_plan(&plan.mutations, &plan.clamped);
        Ok(plan.mutations)
    }
}

/// Day an event adds an entry to, if any.
fn event_target_day(event: &Event) -> Option<NaiveDate> {
    match event {
        Event::WindowOpened { span, .. }
        | Event::AppointmentBooked { span, .. }
        | Event::InternalEventCreated { span, .. } => Some(span.day()),
        _ => None,
    }
}

fn record_plan(mutations: &[SlotMutation], clamped: &[Ulid]) {
    for m in mutations {
        metrics::counter!(crate::observability::SLOT_MUTATIONS_TOTAL, "action" => m.action.label())
            .increment(1);
    }
    for id in clamped {
        metrics::counter!(crate::observability::CAPACITY_CLAMPED_TOTAL).increment(1);
        tracing::warn!("capacity invariant: window {id} reserved beyond roster size, clamped to 0");
    }
}
