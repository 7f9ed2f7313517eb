use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotkeeperAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotkeeperHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::GenerateSlots { year, month } => {
                let slots = engine.generate_slots(year, month).await.map_err(engine_err)?;
                slot_rows(&slots)
            }
            Command::SelectSlots { start, end } => {
                let slots = engine.list_slots(&start, &end).await.map_err(engine_err)?;
                slot_rows(&slots)
            }
            Command::SelectSlot { id } => {
                let slot = engine.get_slot(id).await.map_err(engine_err)?;
                slot_rows(std::slice::from_ref(&slot))
            }
            Command::SelectAppointments { owner_id } => {
                let entries = engine.list_appointments(owner_id).await;
                entry_rows(engine, &entries).await
            }
            Command::SelectAppointment { id } => {
                let slot = engine.get_appointment(id).await.map_err(engine_err)?;
                slot_rows(std::slice::from_ref(&slot))
            }
            Command::SelectInternalEvents { owner_id } => {
                let entries = engine.list_internal_events(owner_id).await;
                entry_rows(engine, &entries).await
            }
            Command::SelectInternalEvent { id } => {
                let slot = engine.get_internal_event(id).await.map_err(engine_err)?;
                slot_rows(std::slice::from_ref(&slot))
            }
            Command::InsertAppointment {
                start,
                end,
                client_id,
                client_name,
                description,
                cursor,
            } => {
                let request = BookingRequest {
                    start,
                    end,
                    client: ClientRef {
                        id: client_id,
                        name: client_name,
                    },
                    description,
                };
                let outcome = engine
                    .book_appointment(request, cursor)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(appointment_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encode_slot(&mut encoder, &outcome.appointment)?;
                encoder.encode_field(&(outcome.next_cursor as i64))?;
                encoder.encode_field(&mutations_json(&outcome.mutations))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::DeleteAppointment { id } => {
                let mutations = engine.cancel_appointment(id).await.map_err(engine_err)?;
                mutation_rows(&mutations)
            }
            Command::InsertReschedule {
                id,
                start,
                end,
                shared_with,
            } => {
                let outcome = engine
                    .reschedule_entry(id, &start, &end, shared_with)
                    .await
                    .map_err(engine_err)?;
                outcome_rows(&outcome)
            }
            Command::InsertInternalEvent {
                start,
                end,
                owner_id,
                shared_with,
                title,
                description,
            } => {
                let request = InternalEventRequest {
                    start,
                    end,
                    owner_id,
                    shared_with,
                    title,
                    description,
                };
                let outcome = engine
                    .create_internal_event(request)
                    .await
                    .map_err(engine_err)?;
                outcome_rows(&outcome)
            }
            Command::DeleteInternalEvent { id } => {
                let mutations = engine.delete_internal_event(id).await.map_err(engine_err)?;
                mutation_rows(&mutations)
            }
            Command::InsertAbsence { worker_id } => {
                let report = engine.reassign_worker(worker_id).await.map_err(engine_err)?;
                reassignment_rows(&report)
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("title"),
        text_field("start"),
        text_field("end"),
        text_field("kind"),
        int_field("remaining"),
        text_field("owner_id"),
        text_field("client_id"),
        text_field("client_name"),
        text_field("shared_with"),
        text_field("visibility"),
    ]
}

/// An entry just written, plus the window mutations it caused as a JSON array.
fn outcome_schema() -> Vec<FieldInfo> {
    let mut fields = slot_schema();
    fields.push(text_field("mutations"));
    fields
}

fn appointment_schema() -> Vec<FieldInfo> {
    let mut fields = slot_schema();
    fields.push(int_field("cursor"));
    fields.push(text_field("mutations"));
    fields
}

fn mutation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("window_id"),
        text_field("start"),
        text_field("end"),
        text_field("action"),
        int_field("remaining"),
    ]
}

fn reassignment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("appointment_id"),
        text_field("outcome"),
        text_field("new_id"),
        text_field("start"),
        text_field("end"),
        text_field("worker_id"),
        text_field("reason"),
    ]
}

fn kind_label(kind: &SlotKind) -> &'static str {
    match kind {
        SlotKind::Available { .. } => "available",
        SlotKind::FullyBooked => "fully_booked",
        SlotKind::Booked { .. } => "booked",
        SlotKind::Internal { .. } => "internal",
    }
}

fn join_ids(ids: &[ulid::Ulid]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &SlotView) -> PgWireResult<()> {
    let (client_id, client_name, shared_with) = match &slot.kind {
        SlotKind::Booked {
            client_id,
            client_name,
            ..
        } => (Some(client_id.to_string()), client_name.clone(), None),
        SlotKind::Internal { shared_with, .. } => (None, None, Some(join_ids(shared_with))),
        _ => (None, None, None),
    };
    let visibility = match slot.visibility {
        Visibility::Public => "public",
        Visibility::Internal => "internal",
    };

    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.title)?;
    encoder.encode_field(&slot.start)?;
    encoder.encode_field(&slot.end)?;
    encoder.encode_field(&kind_label(&slot.kind).to_string())?;
    encoder.encode_field(&slot.remaining().map(i64::from))?;
    encoder.encode_field(&slot.owner_id().map(|id| id.to_string()))?;
    encoder.encode_field(&client_id)?;
    encoder.encode_field(&client_name)?;
    encoder.encode_field(&shared_with)?;
    encoder.encode_field(&visibility.to_string())?;
    Ok(())
}

fn slot_rows(slots: &[SlotView]) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<DataRow>> = slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_slot(&mut encoder, slot)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    ))])
}

async fn entry_rows(engine: &Engine, entries: &[Entry]) -> PgWireResult<Vec<Response>> {
    let total = engine.workers().await.map_err(engine_err)?.len() as u32;
    let views: Vec<SlotView> = entries
        .iter()
        .map(|e| crate::engine::view(e, total))
        .collect();
    slot_rows(&views)
}

fn mutations_json(mutations: &[SlotMutation]) -> String {
    let items: Vec<serde_json::Value> = mutations
        .iter()
        .map(|m| {
            serde_json::json!({
                "window_id": m.window_id.to_string(),
                "start": m.span.start_label(),
                "end": m.span.end_label(),
                "action": m.action.label(),
                "remaining": m.remaining,
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

fn outcome_rows(outcome: &RescheduleOutcome) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(outcome_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_slot(&mut encoder, &outcome.entry)?;
    encoder.encode_field(&mutations_json(&outcome.mutations))?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    ))])
}

fn mutation_rows(mutations: &[SlotMutation]) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(mutation_schema());
    let rows: Vec<PgWireResult<DataRow>> = mutations
        .iter()
        .map(|m| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&m.window_id.to_string())?;
            encoder.encode_field(&m.span.start_label())?;
            encoder.encode_field(&m.span.end_label())?;
            encoder.encode_field(&m.action.label().to_string())?;
            encoder.encode_field(&i64::from(m.remaining))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    ))])
}

fn reassignment_rows(report: &ReassignReport) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(reassignment_schema());
    let mut rows: Vec<PgWireResult<DataRow>> = Vec::new();

    for done in &report.reassigned {
        let (appointment_id, outcome, new_id, span, worker_id) = match done {
            Reassignment::Direct {
                appointment_id,
                span,
                worker_id,
            } => (appointment_id, "direct", None, span, worker_id),
            Reassignment::Relocated {
                old_id,
                new_id,
                span,
                worker_id,
            } => (old_id, "relocated", Some(new_id.to_string()), span, worker_id),
        };
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&appointment_id.to_string())?;
        encoder.encode_field(&outcome.to_string())?;
        encoder.encode_field(&new_id)?;
        encoder.encode_field(&span.start_label())?;
        encoder.encode_field(&span.end_label())?;
        encoder.encode_field(&Some(worker_id.to_string()))?;
        encoder.encode_field(&None::<String>)?;
        rows.push(Ok(encoder.take_row()));
    }
    for missed in &report.unresolved {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&missed.appointment_id.to_string())?;
        encoder.encode_field(&"unresolved".to_string())?;
        encoder.encode_field(&None::<String>)?;
        encoder.encode_field(&missed.span.start_label())?;
        encoder.encode_field(&missed.span.end_label())?;
        encoder.encode_field(&None::<String>)?;
        encoder.encode_field(&Some(missed.reason.clone()))?;
        rows.push(Ok(encoder.take_row()));
    }

    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    ))])
}

/// Result columns a statement will produce, picked from its leading verb and table.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let insert = upper.trim_start().starts_with("INSERT");
    if upper.trim_start().starts_with("DELETE") {
        mutation_schema()
    } else if upper.contains("ABSENCES") {
        reassignment_schema()
    } else if insert && upper.contains("APPOINTMENTS") {
        appointment_schema()
    } else if insert && (upper.contains("RESCHEDULES") || upper.contains("INTERNAL_EVENTS")) {
        outcome_schema()
    } else if ["SLOTS", "APPOINTMENTS", "INTERNAL_EVENTS"]
        .iter()
        .any(|t| upper.contains(t))
    {
        slot_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let responses = self.execute_command(&engine, cmd).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("command produced no response".into()))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let digits_from = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[digits_from..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so `$1` never
/// clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotkeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotkeeperFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(e: &EngineError) -> &'static str {
    if e.is_conflict() {
        return "23P01";
    }
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
