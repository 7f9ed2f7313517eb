use ulid::Ulid;

use crate::limits::MAX_CLIENT_NAME_LEN;
use crate::model::*;

use super::EngineError;

/// Validated client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: Ulid,
    pub name: Option<String>,
}

/// Resolve the caller-supplied client reference. A missing or malformed id is rejected
/// before any matching happens.
pub fn resolve_client(client: &ClientRef) -> Result<ClientIdentity, EngineError> {
    let raw = client
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::Validation("client id is required".into()))?;
    let id = Ulid::from_string(raw)
        .map_err(|e| EngineError::Validation(format!("bad client id {raw:?}: {e}")))?;
    let name = client
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if let Some(ref n) = name
        && n.len() > MAX_CLIENT_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("client name too long"));
    }
    Ok(ClientIdentity { id, name })
}

/// First appointment of this client overlapping `span`, matched by id, or by display
/// name when one was given. `exclude` skips the appointment being moved.
pub fn find_double_booking<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
    span: &Span,
    client: &ClientIdentity,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    entries.into_iter().find_map(|entry| {
        if Some(entry.id) == exclude || !entry.span.overlaps(span) {
            return None;
        }
        let booking = entry.as_booking()?;
        let same_id = booking.client_id == client.id;
        let same_name = match (&client.name, &booking.client_name) {
            (Some(wanted), Some(have)) => wanted == have,
            _ => false,
        };
        (same_id || same_name).then_some(entry.id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_stamp;

    fn span(start: &str, end: &str) -> Span {
        Span::new(parse_stamp(start).unwrap(), parse_stamp(end).unwrap())
    }

    fn appointment(s: Span, client_id: Ulid, client_name: Option<&str>) -> Entry {
        Entry {
            id: Ulid::new(),
            span: s,
            kind: EntryKind::Appointment(Booking {
                owner_id: Ulid::new(),
                owner_name: "Ann Doe".into(),
                client_id,
                client_name: client_name.map(str::to_string),
                description: None,
            }),
        }
    }

    #[test]
    fn resolve_requires_valid_id() {
        assert!(matches!(
            resolve_client(&ClientRef::default()),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            resolve_client(&ClientRef {
                id: Some("not-a-ulid".into()),
                name: None
            }),
            Err(EngineError::Validation(_))
        ));
        let id = Ulid::new();
        let resolved = resolve_client(&ClientRef {
            id: Some(id.to_string()),
            name: Some("  ".into()),
        })
        .unwrap();
        assert_eq!(resolved.id, id);
        assert_eq!(resolved.name, None);
    }

    #[test]
    fn matches_by_id_on_overlap() {
        let client = ClientIdentity {
            id: Ulid::new(),
            name: None,
        };
        let existing = vec![appointment(
            span("2025-03-10 09:00", "2025-03-10 10:00"),
            client.id,
            None,
        )];
        let overlapping = span("2025-03-10 09:30", "2025-03-10 10:30");
        let adjacent = span("2025-03-10 10:00", "2025-03-10 11:00");
        assert_eq!(
            find_double_booking(&existing, &overlapping, &client, None),
            Some(existing[0].id)
        );
        assert_eq!(find_double_booking(&existing, &adjacent, &client, None), None);
    }

    #[test]
    fn matches_by_name_only_when_given() {
        let existing = vec![appointment(
            span("2025-03-10 09:00", "2025-03-10 10:00"),
            Ulid::new(),
            Some("Grace Hopper"),
        )];
        let named = ClientIdentity {
            id: Ulid::new(),
            name: Some("Grace Hopper".into()),
        };
        let anonymous = ClientIdentity {
            id: named.id,
            name: None,
        };
        let s = span("2025-03-10 09:00", "2025-03-10 10:00");
        assert!(find_double_booking(&existing, &s, &named, None).is_some());
        assert!(find_double_booking(&existing, &s, &anonymous, None).is_none());
    }

    #[test]
    fn unrelated_bookings_do_not_match() {
        let client = ClientIdentity {
            id: Ulid::new(),
            name: Some("Grace".into()),
        };
        let s = span("2025-03-10 09:00", "2025-03-10 10:00");
        let existing = vec![
            appointment(s, Ulid::new(), Some("Ada")),
            appointment(s, Ulid::new(), None),
        ];
        assert!(find_double_booking(&existing, &s, &client, None).is_none());
    }

    #[test]
    fn exclude_skips_self() {
        let client = ClientIdentity {
            id: Ulid::new(),
            name: None,
        };
        let s = span("2025-03-10 09:00", "2025-03-10 10:00");
        let existing = vec![appointment(s, client.id, None)];
        let own = existing[0].id;
        assert_eq!(find_double_booking(&existing, &s, &client, Some(own)), None);
        assert_eq!(find_double_booking(&existing, &s, &client, None), Some(own));
    }
}
