use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::time;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    GenerateSlots {
        year: i32,
        month: Option<u32>,
    },
    SelectSlots {
        start: String,
        end: String,
    },
    SelectSlot {
        id: Ulid,
    },
    SelectAppointments {
        owner_id: Option<Ulid>,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectInternalEvents {
        owner_id: Option<Ulid>,
    },
    SelectInternalEvent {
        id: Ulid,
    },
    InsertAppointment {
        start: String,
        end: String,
        client_id: Option<String>,
        client_name: Option<String>,
        description: Option<String>,
        cursor: usize,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertReschedule {
        id: Ulid,
        start: String,
        end: String,
        shared_with: Option<Vec<Ulid>>,
    },
    InsertInternalEvent {
        start: String,
        end: String,
        owner_id: Ulid,
        shared_with: Vec<Ulid>,
        title: String,
        description: Option<String>,
    },
    DeleteInternalEvent {
        id: Ulid,
    },
    InsertAbsence {
        worker_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "slots" => &["year", "month"],
        "appointments" => &["start", "end", "client_id", "client_name", "description", "cursor"],
        "reschedules" => &["id", "start", "end", "shared_with"],
        "internal_events" => &["start", "end", "owner_id", "shared_with", "title", "description"],
        "absences" => &["worker_id"],
        _ => return None,
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let row = named_values(insert, defaults)?;

    match table.as_str() {
        "slots" => Ok(Command::GenerateSlots {
            year: parse_i32(row.required("year")?)?,
            month: row
                .optional("month")
                .map(parse_u32_or_null)
                .transpose()?
                .flatten(),
        }),
        "appointments" => Ok(Command::InsertAppointment {
            start: parse_stamp_text(row.required("start")?)?,
            end: parse_stamp_text(row.required("end")?)?,
            client_id: row.string_or_null("client_id")?,
            client_name: row.string_or_null("client_name")?,
            description: row.string_or_null("description")?,
            cursor: match row.optional("cursor") {
                Some(expr) => parse_u32_or_null(expr)?.unwrap_or(0) as usize,
                None => 0,
            },
        }),
        "reschedules" => Ok(Command::InsertReschedule {
            id: parse_ulid(row.required("id")?)?,
            start: parse_stamp_text(row.required("start")?)?,
            end: parse_stamp_text(row.required("end")?)?,
            shared_with: match row.optional("shared_with") {
                Some(expr) => parse_ulid_list_or_null(expr)?,
                None => None,
            },
        }),
        "internal_events" => Ok(Command::InsertInternalEvent {
            start: parse_stamp_text(row.required("start")?)?,
            end: parse_stamp_text(row.required("end")?)?,
            owner_id: parse_ulid(row.required("owner_id")?)?,
            shared_with: match row.optional("shared_with") {
                Some(expr) => parse_ulid_list_or_null(expr)?.unwrap_or_default(),
                None => Vec::new(),
            },
            title: parse_string(row.required("title")?)?,
            description: row.string_or_null("description")?,
        }),
        "absences" => Ok(Command::InsertAbsence {
            worker_id: parse_ulid(row.required("worker_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "appointments" => Ok(Command::DeleteAppointment { id }),
        "internal_events" => Ok(Command::DeleteInternalEvent { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match (table.as_str(), filters.id) {
        ("slots", Some(id)) => Ok(Command::SelectSlot { id }),
        ("slots", None) => Ok(Command::SelectSlots {
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        ("appointments", Some(id)) => Ok(Command::SelectAppointment { id }),
        ("appointments", None) => Ok(Command::SelectAppointments {
            owner_id: filters.owner_id,
        }),
        ("internal_events", Some(id)) => Ok(Command::SelectInternalEvent { id }),
        ("internal_events", None) => Ok(Command::SelectInternalEvents {
            owner_id: filters.owner_id,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    start: Option<String>,
    end: Option<String>,
    owner_id: Option<Ulid>,
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid(right)?),
                Some("owner_id") => filters.owner_id = Some(parse_ulid(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_stamp_text(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_stamp_text(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

/// First VALUES row keyed by column name.
struct Row(HashMap<String, Expr>);

impl Row {
    fn optional(&self, column: &str) -> Option<&Expr> {
        self.0.get(column)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.0.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn string_or_null(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.optional(column)
            .map(parse_string_or_null)
            .transpose()
            .map(Option::flatten)
    }
}

fn named_values(insert: &ast::Insert, defaults: &[&str]) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity("VALUES", columns.len(), values.len()));
    }
    Ok(Row(columns.into_iter().zip(values).collect()))
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref().ok_or(SqlError::MissingFilter("id"))? {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

/// Timestamp literal in canonical form. Unparseable text is passed through for the
/// engine to reject.
fn parse_stamp_text(expr: &Expr) -> Result<String, SqlError> {
    parse_string(expr).map(|s| time::normalize(&s))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// Comma-separated ULIDs. NULL means "not given"; an empty string is an empty list.
fn parse_ulid_list_or_null(expr: &Expr) -> Result<Option<Vec<Ulid>>, SqlError> {
    let Some(raw) = parse_string_or_null(expr)? else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64_expr(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if matches!(extract_value(expr), Some(Value::Null)) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_generate_slots() {
        let cmd = parse_sql("INSERT INTO slots (year, month) VALUES (2025, 3)").unwrap();
        assert_eq!(cmd, Command::GenerateSlots { year: 2025, month: Some(3) });

        let cmd = parse_sql("INSERT INTO slots (year, month) VALUES (2025, NULL)").unwrap();
        assert_eq!(cmd, Command::GenerateSlots { year: 2025, month: None });

        let cmd = parse_sql("INSERT INTO slots (year) VALUES (2026)").unwrap();
        assert_eq!(cmd, Command::GenerateSlots { year: 2026, month: None });
    }

    #[test]
    fn parse_select_slots() {
        let sql = r#"SELECT * FROM slots WHERE start >= '2025-03-10 00:00' AND "end" <= '2025-03-11 00:00'"#;
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::SelectSlots {
                start: "2025-03-10 00:00".into(),
                end: "2025-03-11 00:00".into(),
            }
        );
    }

    #[test]
    fn parse_select_slots_requires_range() {
        let sql = "SELECT * FROM slots WHERE start >= '2025-03-10 00:00'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_appointments() {
        assert_eq!(
            parse_sql("SELECT * FROM appointments").unwrap(),
            Command::SelectAppointments { owner_id: None }
        );
        let sql = format!("SELECT * FROM appointments WHERE owner_id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAppointments {
                owner_id: Some(Ulid::from_string(ID).unwrap())
            }
        );
    }

    #[test]
    fn parse_select_by_id() {
        let id = Ulid::from_string(ID).unwrap();
        assert_eq!(
            parse_sql(&format!("SELECT * FROM slots WHERE id = '{ID}'")).unwrap(),
            Command::SelectSlot { id }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM appointments WHERE id = '{ID}'")).unwrap(),
            Command::SelectAppointment { id }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM internal_events WHERE id = '{ID}'")).unwrap(),
            Command::SelectInternalEvent { id }
        );
    }

    #[test]
    fn parse_select_internal_events() {
        assert_eq!(
            parse_sql("SELECT * FROM internal_events").unwrap(),
            Command::SelectInternalEvents { owner_id: None }
        );
        let sql = format!("SELECT * FROM internal_events WHERE owner_id = '{OTHER}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectInternalEvents {
                owner_id: Some(Ulid::from_string(OTHER).unwrap())
            }
        );
    }

    #[test]
    fn range_filters_are_canonicalized() {
        let sql = r#"SELECT * FROM slots WHERE start >= '2025-03-10T00:00:00+01:00' AND "end" <= '2025-03-11'"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectSlots {
                start: "2025-03-10 00:00".into(),
                end: "2025-03-11 00:00".into(),
            }
        );
    }

    #[test]
    fn parse_insert_appointment() {
        let sql = format!(
            r#"INSERT INTO appointments (start, "end", client_id, client_name, cursor) VALUES ('2025-03-10T08:00:00', '2025-03-10T09:00:00', '{ID}', 'Grace Hopper', 4)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment {
                start,
                end,
                client_id,
                client_name,
                description,
                cursor,
            } => {
                assert_eq!(start, "2025-03-10 08:00");
                assert_eq!(end, "2025-03-10 09:00");
                assert_eq!(client_id.as_deref(), Some(ID));
                assert_eq!(client_name.as_deref(), Some("Grace Hopper"));
                assert_eq!(description, None);
                assert_eq!(cursor, 4);
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_positional() {
        let sql = format!(
            "INSERT INTO appointments VALUES ('2025-03-10 08:00', '2025-03-10 09:00', '{ID}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { client_id, cursor, .. } => {
                assert_eq!(client_id.as_deref(), Some(ID));
                assert_eq!(cursor, 0);
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_delete_appointment() {
        let sql = format!("DELETE FROM appointments WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::DeleteAppointment { .. }
        ));
    }

    #[test]
    fn parse_reschedule_with_and_without_participants() {
        let sql = format!(
            r#"INSERT INTO reschedules (id, start, "end") VALUES ('{ID}', '2025-03-10 10:00', '2025-03-10 11:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReschedule { shared_with, .. } => assert_eq!(shared_with, None),
            cmd => panic!("expected InsertReschedule, got {cmd:?}"),
        }

        let sql = format!(
            r#"INSERT INTO reschedules (id, start, "end", shared_with) VALUES ('{ID}', '2025-03-10 10:00', '2025-03-10 11:00', '{ID}, {OTHER}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReschedule { shared_with, .. } => {
                assert_eq!(shared_with.map(|v| v.len()), Some(2));
            }
            cmd => panic!("expected InsertReschedule, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_internal_event() {
        let sql = format!(
            r#"INSERT INTO internal_events (start, "end", owner_id, shared_with, title) VALUES ('2025-03-10 10:00', '2025-03-10 11:00', '{ID}', '', 'Standup')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertInternalEvent {
                shared_with, title, ..
            } => {
                assert!(shared_with.is_empty());
                assert_eq!(title, "Standup");
            }
            cmd => panic!("expected InsertInternalEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_absence() {
        let sql = format!("INSERT INTO absences (worker_id) VALUES ('{ID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAbsence {
                worker_id: Ulid::from_string(ID).unwrap()
            }
        );
    }

    #[test]
    fn parse_bad_ulid_list_errors() {
        let sql = format!(
            r#"INSERT INTO internal_events (start, "end", owner_id, shared_with, title) VALUES ('2025-03-10 10:00', '2025-03-10 11:00', '{ID}', 'nope', 'x')"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_missing_column_errors() {
        let sql = "INSERT INTO absences (note) VALUES ('x')";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::MissingColumn("worker_id"))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_multi_row_rejected() {
        let sql = "INSERT INTO slots (year, month) VALUES (2025, 3), (2025, 4)";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
