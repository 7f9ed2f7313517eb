use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::{self, HOUR};

/// Milliseconds on the naive local clock (minute precision in practice).
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Calendar day the span is filed under.
    pub fn day(&self) -> NaiveDate {
        time::day_of(self.start)
    }

    /// Hour-aligned 60-minute buckets touched by this span.
    pub fn hour_buckets(&self) -> Vec<Span> {
        let mut buckets = Vec::new();
        let mut cursor = self.start.div_euclid(HOUR) * HOUR;
        while cursor < self.end {
            buckets.push(Span::new(cursor, cursor + HOUR));
            cursor += HOUR;
        }
        buckets
    }

    pub fn start_label(&self) -> String {
        time::format_stamp(self.start)
    }

    pub fn end_label(&self) -> String {
        time::format_stamp(self.end)
    }
}

/// A member of the roster. Deserialized straight from the roster file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: String,
}

impl Worker {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub owner_id: Ulid,
    pub owner_name: String,
    pub client_id: Ulid,
    pub client_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalMeeting {
    pub owner_id: Ulid,
    pub shared_with: Vec<Ulid>,
    pub title: String,
    pub description: Option<String>,
}

impl InternalMeeting {
    pub fn participants(&self) -> impl Iterator<Item = Ulid> + '_ {
        std::iter::once(self.owner_id).chain(self.shared_with.iter().copied())
    }
}

/// What a calendar entry represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Availability window. `reserved` maps each holder to the units it consumes.
    Window { reserved: BTreeMap<Ulid, u32> },
    Appointment(Booking),
    Internal(InternalMeeting),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Ulid,
    pub span: Span,
    pub kind: EntryKind,
}

impl Entry {
    pub fn is_window(&self) -> bool {
        matches!(self.kind, EntryKind::Window { .. })
    }

    pub fn as_booking(&self) -> Option<&Booking> {
        match &self.kind {
            EntryKind::Appointment(b) => Some(b),
            _ => None,
        }
    }

    pub fn reserved(&self) -> Option<&BTreeMap<Ulid, u32>> {
        match &self.kind {
            EntryKind::Window { reserved } => Some(reserved),
            _ => None,
        }
    }

    /// Capacity units this entry takes from every window it overlaps.
    /// `None` for windows.
    pub fn holder_units(&self) -> Option<u32> {
        match &self.kind {
            EntryKind::Window { .. } => None,
            EntryKind::Appointment(_) => Some(1),
            EntryKind::Internal(m) => Some(1 + m.shared_with.len() as u32),
        }
    }

    /// Workers this entry keeps busy.
    pub fn busy_workers(&self) -> Vec<Ulid> {
        match &self.kind {
            EntryKind::Window { .. } => Vec::new(),
            EntryKind::Appointment(b) => vec![b.owner_id],
            EntryKind::Internal(m) => m.participants().collect(),
        }
    }
}

/// Sum of reserved units, and the remaining count clamped to `[0, total]`.
/// The flag is true when the reservations exceeded `total`.
pub fn remaining_capacity(reserved: &BTreeMap<Ulid, u32>, total: u32) -> (u32, bool) {
    let used: u64 = reserved.values().map(|u| *u as u64).sum();
    if used > total as u64 {
        (0, true)
    } else {
        (total - used as u32, false)
    }
}

pub fn window_title(remaining: u32, total: u32) -> String {
    if remaining == 0 {
        "Fully Booked Slot".to_string()
    } else if remaining >= total {
        "Available Slot".to_string()
    } else {
        format!("Available Slot ({remaining} left)")
    }
}

pub fn booking_title(booking: &Booking) -> String {
    format!("Booked Appointment with {}", booking.owner_name)
}

/// All entries filed under one calendar day, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DayState {
    pub day: NaiveDate,
    pub entries: Vec<Entry>,
}

impl DayState {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            entries: Vec::new(),
        }
    }

    /// Insert entry maintaining sort order by span.start.
    pub fn insert(&mut self, entry: Entry) {
        let pos = self
            .entries
            .partition_point(|e| e.span.start <= entry.span.start);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Entries whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Entry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    pub fn windows(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_window())
    }
}

/// Journal record. One commit carries every event of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WindowOpened {
        id: Ulid,
        span: Span,
        reserved: Vec<(Ulid, u32)>,
    },
    WindowReserved {
        window_id: Ulid,
        holder_id: Ulid,
        units: u32,
    },
    WindowReleased {
        window_id: Ulid,
        holder_id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        span: Span,
        booking: Booking,
    },
    AppointmentMoved {
        id: Ulid,
        span: Span,
        owner_id: Ulid,
        owner_name: String,
    },
    AppointmentCancelled {
        id: Ulid,
    },
    InternalEventCreated {
        id: Ulid,
        span: Span,
        meeting: InternalMeeting,
    },
    InternalEventUpdated {
        id: Ulid,
        span: Span,
        shared_with: Vec<Ulid>,
    },
    InternalEventDeleted {
        id: Ulid,
    },
}

// ── Request and result types ─────────────────────────────────────

/// Client identity as supplied by the caller. Validated before any matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRef {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub start: String,
    pub end: String,
    pub client: ClientRef,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEventRequest {
    pub start: String,
    pub end: String,
    pub owner_id: Ulid,
    pub shared_with: Vec<Ulid>,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Available {
        remaining: u32,
    },
    FullyBooked,
    Booked {
        owner_id: Ulid,
        client_id: Ulid,
        client_name: Option<String>,
    },
    Internal {
        owner_id: Ulid,
        shared_with: Vec<Ulid>,
    },
}

/// Outward view of any entry, with canonical timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub id: Ulid,
    pub title: String,
    pub start: String,
    pub end: String,
    pub kind: SlotKind,
    pub visibility: Visibility,
}

impl SlotView {
    pub fn remaining(&self) -> Option<u32> {
        match self.kind {
            SlotKind::Available { remaining } => Some(remaining),
            SlotKind::FullyBooked => Some(0),
            _ => None,
        }
    }

    pub fn owner_id(&self) -> Option<Ulid> {
        match &self.kind {
            SlotKind::Booked { owner_id, .. } | SlotKind::Internal { owner_id, .. } => {
                Some(*owner_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    /// Holder left the window; capacity returned.
    Restore,
    /// Holder entered the window; capacity taken.
    Reduce,
    /// Holder stayed but its unit count changed.
    Resize,
    /// Window synthesized for a bucket the holder vacated.
    Recreate,
}

impl SlotAction {
    pub fn label(&self) -> &'static str {
        match self {
            SlotAction::Restore => "restore",
            SlotAction::Reduce => "reduce",
            SlotAction::Resize => "resize",
            SlotAction::Recreate => "recreate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMutation {
    pub window_id: Ulid,
    pub span: Span,
    pub action: SlotAction,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub appointment: SlotView,
    pub next_cursor: usize,
    pub mutations: Vec<SlotMutation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleOutcome {
    pub entry: SlotView,
    pub mutations: Vec<SlotMutation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassignment {
    /// Same appointment, new owner.
    Direct {
        appointment_id: Ulid,
        span: Span,
        worker_id: Ulid,
    },
    /// Original cancelled, replacement booked at another window.
    Relocated {
        old_id: Ulid,
        new_id: Ulid,
        span: Span,
        worker_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReassignment {
    pub appointment_id: Ulid,
    pub span: Span,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassignReport {
    pub reassigned: Vec<Reassignment>,
    pub unresolved: Vec<UnresolvedReassignment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_stamp;

    fn span(start: &str, end: &str) -> Span {
        Span::new(parse_stamp(start).unwrap(), parse_stamp(end).unwrap())
    }

    fn window(s: Span) -> Entry {
        Entry {
            id: Ulid::new(),
            span: s,
            kind: EntryKind::Window {
                reserved: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = span("2025-03-10 09:00", "2025-03-10 10:00");
        let b = span("2025-03-10 09:30", "2025-03-10 10:30");
        let c = span("2025-03-10 10:00", "2025-03-10 11:00");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn hour_buckets_cover_partial_hours() {
        let s = span("2025-03-10 09:30", "2025-03-10 11:15");
        let buckets = s.hour_buckets();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].start_label(), "2025-03-10 09:00");
        assert_eq!(buckets[2].end_label(), "2025-03-10 12:00");
    }

    #[test]
    fn hour_buckets_exact_hour() {
        let s = span("2025-03-10 09:00", "2025-03-10 10:00");
        assert_eq!(s.hour_buckets(), vec![s]);
    }

    #[test]
    fn titles_follow_capacity() {
        assert_eq!(window_title(3, 3), "Available Slot");
        assert_eq!(window_title(2, 3), "Available Slot (2 left)");
        assert_eq!(window_title(0, 3), "Fully Booked Slot");
        assert_eq!(window_title(0, 0), "Fully Booked Slot");
    }

    #[test]
    fn remaining_clamps_over_reservation() {
        let mut reserved = BTreeMap::new();
        reserved.insert(Ulid::new(), 1);
        reserved.insert(Ulid::new(), 2);
        assert_eq!(remaining_capacity(&reserved, 5), (2, false));
        assert_eq!(remaining_capacity(&reserved, 3), (0, false));
        assert_eq!(remaining_capacity(&reserved, 2), (0, true));
    }

    #[test]
    fn day_state_keeps_order_and_finds_overlaps() {
        let mut ds = DayState::new(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        let late = window(span("2025-03-10 15:00", "2025-03-10 16:00"));
        let early = window(span("2025-03-10 08:00", "2025-03-10 09:00"));
        let mid = window(span("2025-03-10 09:00", "2025-03-10 10:00"));
        let mid_id = mid.id;
        ds.insert(late);
        ds.insert(early);
        ds.insert(mid);
        assert_eq!(ds.entries[0].span.start_label(), "2025-03-10 08:00");
        assert_eq!(ds.entries[2].span.start_label(), "2025-03-10 15:00");

        let hits: Vec<_> = ds
            .overlapping(&span("2025-03-10 09:30", "2025-03-10 09:45"))
            .map(|e| e.id)
            .collect();
        assert_eq!(hits, vec![mid_id]);

        assert!(ds.remove(mid_id).is_some());
        assert!(ds.remove(mid_id).is_none());
        assert_eq!(ds.entries.len(), 2);
    }

    #[test]
    fn internal_meeting_units_and_busy_workers() {
        let owner = Ulid::new();
        let guest = Ulid::new();
        let entry = Entry {
            id: Ulid::new(),
            span: span("2025-03-10 09:00", "2025-03-10 10:00"),
            kind: EntryKind::Internal(InternalMeeting {
                owner_id: owner,
                shared_with: vec![guest],
                title: "Planning".into(),
                description: None,
            }),
        };
        assert_eq!(entry.holder_units(), Some(2));
        assert_eq!(entry.busy_workers(), vec![owner, guest]);
        assert_eq!(window(entry.span).holder_units(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            id: Ulid::new(),
            span: span("2025-03-10 09:00", "2025-03-10 10:00"),
            booking: Booking {
                owner_id: Ulid::new(),
                owner_name: "Ada Lovelace".into(),
                client_id: Ulid::new(),
                client_name: Some("Grace".into()),
                description: None,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
