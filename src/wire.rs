use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::busy::InMemoryBusyCalendar;
use crate::engine::{Engine, EngineError, OpenInterval, Resolution};
use crate::meeting::location_display;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every login.
#[derive(Debug)]
pub struct SlotdAuthSource {
    password: String,
}

impl SlotdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct SlotdHandler {
    engine: Arc<Engine>,
    busy: Arc<InMemoryBusyCalendar>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(engine: Arc<Engine>, busy: Arc<InMemoryBusyCalendar>) -> Self {
        Self {
            engine,
            busy,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    /// Parse, execute and record one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            tracing::debug!(command = label, error = %e, "query failed");
        }
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertHost {
                id,
                username,
                name,
                timezone,
            } => {
                engine
                    .create_host(id, username, name, timezone)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertEventType { event_type } => {
                engine
                    .create_event_type(event_type)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeactivateEventType { id } => {
                engine.deactivate_event_type(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectEventType { username, slug } => {
                let (host, event_type) = engine
                    .lookup_event_type(&username, &slug)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(event_type_schema());
                let rows = vec![event_type_row(&schema, &host, &event_type)];
                Ok(query_response(schema, rows))
            }
            Command::InsertRule {
                id,
                host_id,
                day_of_week,
                start,
                end,
                timezone,
            } => {
                let timezone = match timezone {
                    Some(tz) => tz,
                    None => engine.host_info(host_id).await.map_err(engine_err)?.timezone,
                };
                engine
                    .add_weekly_rule(WeeklyRule {
                        id,
                        host_id,
                        day_of_week,
                        start,
                        end,
                        timezone,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteRule { id } => {
                engine.remove_weekly_rule(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectRules { host_id } => {
                let rules = engine.get_rules(host_id).await.map_err(engine_err)?;
                let schema = Arc::new(rule_schema());
                let rows = rules.iter().map(|r| rule_row(&schema, r)).collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertOverride { date_override } => {
                engine
                    .set_date_override(date_override)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteOverride { id } => {
                engine.remove_date_override(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectOverrides { host_id } => {
                let overrides = engine.get_overrides(host_id).await.map_err(engine_err)?;
                let schema = Arc::new(override_schema());
                let rows = overrides.iter().map(|o| override_row(&schema, o)).collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertBusy { host_id, span } => {
                engine.host_info(host_id).await.map_err(engine_err)?;
                self.busy.push(host_id, span).map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ClearBusy { host_id } => {
                let removed = self.busy.clear(&host_id);
                Ok(deleted(removed))
            }
            Command::SelectAvailability { host_id, date } => {
                let resolution = engine
                    .resolve_availability(host_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let rows = match resolution {
                    Resolution::Closed => Vec::new(),
                    Resolution::Open(ref intervals) => intervals
                        .iter()
                        .map(|i| availability_row(&schema, i))
                        .collect(),
                };
                Ok(query_response(schema, rows))
            }
            Command::SelectSlots {
                event_type_id,
                date,
                timezone,
            } => {
                let slots = engine
                    .list_slots(event_type_id, date)
                    .await
                    .map_err(engine_err)?;
                let display = timezone.unwrap_or(Tz::UTC);
                let schema = Arc::new(slot_schema());
                let rows = slots
                    .iter()
                    .map(|s| slot_row(&schema, *s, display))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertBooking { request } => {
                let booking = engine.claim(request).await.map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let rows = vec![booking_row(&schema, &booking)];
                Ok(query_response(schema, rows))
            }
            Command::CancelBooking { id, reason } => {
                engine.cancel_booking(id, reason).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let rows = vec![booking_row(&schema, &booking)];
                Ok(query_response(schema, rows))
            }
            Command::SelectBookings { host_id, status } => {
                let bookings = engine
                    .list_bookings(host_id, status)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let rows = bookings.iter().map(|b| booking_row(&schema, b)).collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn event_type_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        text_field("username"),
        text_field("host_name"),
        text_field("host_timezone"),
        text_field("slug"),
        text_field("name"),
        typed_field("duration", Type::INT4),
        typed_field("active", Type::BOOL),
        text_field("location_type"),
        text_field("location_url"),
        text_field("location_display"),
    ]
}

fn rule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        typed_field("day_of_week", Type::INT4),
        text_field("start_time"),
        text_field("end_time"),
        text_field("timezone"),
    ]
}

fn override_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        text_field("date"),
        typed_field("is_available", Type::BOOL),
        text_field("start_time"),
        text_field("end_time"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start_time"),
        text_field("end_time"),
        text_field("timezone"),
        text_field("source"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![text_field("start"), text_field("local_start")]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("event_type_id"),
        text_field("host_id"),
        text_field("attendee_name"),
        text_field("attendee_email"),
        text_field("attendee_notes"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("status"),
        text_field("timezone"),
        text_field("meeting_url"),
        text_field("cancellation_reason"),
    ]
}

/// Row shape for a statement, looked up by its target table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let verb = lower.split_whitespace().next().unwrap_or_default();
    match (verb, target_table(&lower)) {
        ("select", Some("event_types")) => event_type_schema(),
        ("select", Some("weekly_rules")) => rule_schema(),
        ("select", Some("date_overrides")) => override_schema(),
        ("select", Some("availability")) => availability_schema(),
        ("select", Some("slots")) => slot_schema(),
        ("select", Some("bookings")) | ("insert", Some("bookings")) => booking_schema(),
        _ => vec![],
    }
}

/// First identifier after `from` or `into`.
fn target_table(lower: &str) -> Option<&str> {
    let mut words = lower.split_whitespace();
    while let Some(word) = words.next() {
        if word == "from" || word == "into" {
            return words
                .next()
                .map(|t| t.trim_matches(|c: char| c == '"' || c == ';' || c == '('));
        }
    }
    None
}

// ── Row encoding ─────────────────────────────────────────────────

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn event_type_row(
    schema: &Arc<Vec<FieldInfo>>,
    host: &HostInfo,
    event_type: &EventType,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&event_type.id.to_string())?;
    encoder.encode_field(&host.id.to_string())?;
    encoder.encode_field(&host.username)?;
    encoder.encode_field(&host.name)?;
    encoder.encode_field(&host.timezone.name().to_string())?;
    encoder.encode_field(&event_type.slug)?;
    encoder.encode_field(&event_type.name)?;
    encoder.encode_field(&(event_type.duration_minutes as i32))?;
    encoder.encode_field(&event_type.is_active)?;
    encoder.encode_field(&event_type.location_type.as_str().to_string())?;
    encoder.encode_field(&event_type.location_url)?;
    encoder.encode_field(&location_display(event_type.location_type).to_string())?;
    Ok(encoder.take_row())
}

fn rule_row(schema: &Arc<Vec<FieldInfo>>, rule: &WeeklyRule) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&rule.id.to_string())?;
    encoder.encode_field(&rule.host_id.to_string())?;
    encoder.encode_field(&(rule.day_of_week as i32))?;
    encoder.encode_field(&rule.start.to_string())?;
    encoder.encode_field(&rule.end.to_string())?;
    encoder.encode_field(&rule.timezone.name().to_string())?;
    Ok(encoder.take_row())
}

fn override_row(schema: &Arc<Vec<FieldInfo>>, ov: &DateOverride) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&ov.id.to_string())?;
    encoder.encode_field(&ov.host_id.to_string())?;
    encoder.encode_field(&ov.date.format("%Y-%m-%d").to_string())?;
    encoder.encode_field(&ov.is_available)?;
    encoder.encode_field(&ov.start.map(|t| t.to_string()))?;
    encoder.encode_field(&ov.end.map(|t| t.to_string()))?;
    Ok(encoder.take_row())
}

fn availability_row(
    schema: &Arc<Vec<FieldInfo>>,
    interval: &OpenInterval,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&interval.start.to_string())?;
    encoder.encode_field(&interval.end.to_string())?;
    encoder.encode_field(&interval.timezone.name().to_string())?;
    encoder.encode_field(&interval.source.as_str().to_string())?;
    Ok(encoder.take_row())
}

fn slot_row(schema: &Arc<Vec<FieldInfo>>, start: DateTime<Utc>, display: Tz) -> PgWireResult<DataRow> {
    let local = display
        .from_utc_datetime(&start.naive_utc())
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&rfc3339(start))?;
    encoder.encode_field(&local)?;
    Ok(encoder.take_row())
}

fn booking_row(schema: &Arc<Vec<FieldInfo>>, booking: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.event_type_id.to_string())?;
    encoder.encode_field(&booking.host_id.to_string())?;
    encoder.encode_field(&booking.attendee_name)?;
    encoder.encode_field(&booking.attendee_email)?;
    encoder.encode_field(&booking.attendee_notes)?;
    encoder.encode_field(&rfc3339(booking.start_time()))?;
    encoder.encode_field(&rfc3339(booking.end_time()))?;
    encoder.encode_field(&booking.status.as_str().to_string())?;
    encoder.encode_field(&booking.timezone.name().to_string())?;
    encoder.encode_field(&booking.meeting_url)?;
    encoder.encode_field(&booking.cancellation_reason)?;
    Ok(encoder.take_row())
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(&substitute_params(portal)).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
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
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass over `sql`: each `$N` outside a string literal
/// is replaced once, so parameter text is never rescanned. Placeholders with
/// no bound value are left as written.
fn inline_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let digits = i + 1;
                let mut end = digits;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let bound = sql[digits..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                if let Some(param) = bound {
                    out.push_str(&sql[copied..i]);
                    match param {
                        Some(value) => {
                            let text = String::from_utf8_lossy(value.as_ref());
                            out.push('\'');
                            out.push_str(&text.replace('\'', "''"));
                            out.push('\'');
                        }
                        None => out.push_str("NULL"),
                    }
                    copied = end;
                }
                i = end.max(i + 1);
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(engine: Arc<Engine>, busy: Arc<InMemoryBusyCalendar>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotdHandler::new(engine, busy)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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
    engine: Arc<Engine>,
    busy: Arc<InMemoryBusyCalendar>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotdFactory::new(engine, busy, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidState(_) => "55000",
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) | EngineError::Upstream(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue { .. } => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
