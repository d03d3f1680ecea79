use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::auth::{Credentials, LarderAuthSource};
use crate::engine::{
    BookingRequest, Engine, EngineError, ErrorKind, Replacement, Resolution, SeriesRequest, SlotEdit,
};
use crate::model::*;
use crate::notify::{channel_name, parse_channel};
use crate::observability;
use crate::sql::{self, Command, SqlError};

/// Query handler for one client connection. Owns that connection's LISTEN
/// subscriptions, which are drained before each response is sent.
pub struct LarderHandler {
    engine: Arc<Engine>,
    credentials: Arc<Credentials>,
    query_parser: Arc<LarderQueryParser>,
    listening: Mutex<HashMap<Ulid, broadcast::Receiver<Event>>>,
}

impl LarderHandler {
    pub fn new(engine: Arc<Engine>, credentials: Arc<Credentials>) -> Self {
        Self {
            engine,
            credentials,
            query_parser: Arc::new(LarderQueryParser),
            listening: Mutex::new(HashMap::new()),
        }
    }

    /// The user name was checked against its password at startup.
    fn is_staff<C: ClientInfo>(&self, client: &C) -> bool {
        let user = client.metadata().get(METADATA_USER).map(String::as_str);
        self.credentials.is_staff(user)
    }

    async fn run(&self, cmd: Command, staff: bool) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = if cmd.requires_staff() && !staff {
            warn!(command = label, "privileged command refused for non-staff login");
            Err(permission_denied(label))
        } else {
            self.execute_command(cmd).await
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRole {
                id,
                name,
                audience,
                weekends,
            } => {
                engine
                    .create_role(Role {
                        id,
                        name,
                        audience,
                        weekends,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertSlot {
                id,
                role_id,
                start_time,
                end_time,
                max_capacity,
                weekday,
            } => {
                engine
                    .create_slot(Slot {
                        id,
                        role_id,
                        window: TimeWindow {
                            start: start_time,
                            end: end_time,
                        },
                        max_capacity,
                        is_active: true,
                        weekday,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::EditSlot {
                slot_id,
                start_time,
                end_time,
                max_capacity,
                is_active,
                weekday,
            } => {
                engine
                    .edit_slot(SlotEdit {
                        slot_id,
                        start_time,
                        end_time,
                        max_capacity,
                        is_active,
                        weekday,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::GrantTraining { volunteer_id, role_id } => {
                engine
                    .grant_training(volunteer_id, role_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RevokeTraining { volunteer_id, role_id } => {
                engine
                    .revoke_training(volunteer_id, role_id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertHoliday { date, reason } => {
                engine.add_holiday(&date, reason).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteHoliday { date } => {
                engine.remove_holiday(&date).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertBooking {
                id,
                requester,
                slot_id,
                date,
                note,
                origin,
            } => {
                engine
                    .book(BookingRequest {
                        id,
                        requester,
                        slot_id,
                        date,
                        note,
                        origin,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertSeries {
                id,
                requester,
                slot_id,
                start_date,
                end_date,
                pattern,
            } => {
                let outcome = engine
                    .create_series(SeriesRequest {
                        id,
                        requester,
                        slot_id,
                        start_date,
                        end_date,
                        pattern,
                        origin: Origin::SelfService,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(series_outcome_response(&outcome))
            }
            Command::DeleteSeries { id, from } => {
                let cancelled = engine
                    .cancel_series(id, from.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(deleted(cancelled))
            }
            Command::ResolveConflict {
                existing_id,
                keep,
                booking_id,
                slot_id,
                date,
            } => {
                let replacement = match (booking_id, slot_id, date) {
                    (Some(id), Some(slot_id), Some(date)) => Some(Replacement {
                        id,
                        slot_id,
                        date,
                        note: None,
                    }),
                    _ => None,
                };
                let resolution = engine
                    .resolve_conflict(existing_id, keep, replacement)
                    .await
                    .map_err(engine_err)?;
                Ok(resolution_response(&resolution))
            }
            Command::DecideBooking {
                booking_id,
                decision,
                reason,
            } => {
                engine
                    .decide(booking_id, decision, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::CancelByToken { token } => {
                engine.cancel_by_token(&token).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::Reschedule {
                token,
                booking_id,
                slot_id,
                date,
            } => {
                engine
                    .reschedule_by_token(&token, booking_id, slot_id, &date)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SelectBooking { id } => {
                let rows: Vec<Booking> = engine.get_booking(id).await.into_iter().collect();
                Ok(rows_response(booking_schema(), &rows, encode_booking))
            }
            Command::SelectRequesterBookings { requester_id } => {
                let rows = engine.bookings_for_requester(requester_id).await;
                Ok(rows_response(booking_schema(), &rows, encode_booking))
            }
            Command::SelectSlotBookings { slot_id, date } => {
                let rows = engine
                    .bookings_for_slot(slot_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(booking_schema(), &rows, encode_booking))
            }
            Command::SelectCapacity { slot_id, date } => {
                let state = engine
                    .get_slot_state(&slot_id)
                    .ok_or_else(|| engine_err(EngineError::not_found("slot", slot_id)))?;
                let row = {
                    let guard = state.read().await;
                    (guard.slot.max_capacity, guard.counted(date), guard.available(date))
                };
                Ok(rows_response(capacity_schema(), &[row], |encoder, (max, counted, available)| {
                    encoder.encode_field(&slot_id.to_string())?;
                    encoder.encode_field(&date.to_string())?;
                    encoder.encode_field(&i64::from(*max))?;
                    encoder.encode_field(&i64::from(*counted))?;
                    encoder.encode_field(&i64::from(*available))
                }))
            }
            Command::SelectAvailability { date, role_id } => {
                let rows = engine.slot_availability(date, role_id).await;
                Ok(rows_response(availability_schema(), &rows, encode_availability))
            }
            Command::SelectRoles => {
                let rows = engine.list_roles();
                Ok(rows_response(role_schema(), &rows, |encoder, role| {
                    encoder.encode_field(&role.id.to_string())?;
                    encoder.encode_field(&role.name)?;
                    encoder.encode_field(&role.audience.as_str().to_string())?;
                    encoder.encode_field(&role.weekends)
                }))
            }
            Command::SelectSlots => {
                let rows = engine.list_slots().await;
                Ok(rows_response(slot_schema(), &rows, encode_slot))
            }
            Command::SelectHolidays => {
                let rows = engine.list_holidays();
                Ok(rows_response(holiday_schema(), &rows, |encoder, holiday| {
                    encoder.encode_field(&holiday.date.to_string())?;
                    encoder.encode_field(&holiday.reason)
                }))
            }
            Command::SelectSeries { id } => {
                let rows = engine.series_bookings(id).await.map_err(engine_err)?;
                Ok(rows_response(booking_schema(), &rows, encode_booking))
            }
            Command::Listen { channel } => {
                let slot_id = parse_channel(&channel).ok_or_else(|| invalid_channel(&channel))?;
                let mut listening = self.listening.lock().await;
                listening
                    .entry(slot_id)
                    .or_insert_with(|| engine.notify.subscribe(slot_id));
                debug!(%slot_id, "listening");
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let slot_id = parse_channel(&channel).ok_or_else(|| invalid_channel(&channel))?;
                self.listening.lock().await.remove(&slot_id);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listening.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Collect every committed event queued on this connection's channels.
    async fn pending_notifications(&self) -> Vec<(String, String)> {
        let mut listening = self.listening.lock().await;
        let mut out = Vec::new();
        for (slot_id, rx) in listening.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(payload) => out.push((channel_name(*slot_id), payload)),
                        Err(e) => error!("failed to encode notification: {e}"),
                    },
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(%slot_id, skipped, "listener lagged, notifications dropped");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        out
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pid = std::process::id() as i32;
        for (channel, payload) in self.pending_notifications().await {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SimpleQueryHandler for LarderHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let response = self.run(cmd, self.is_staff(client)).await;
        self.flush_notifications(client).await?;
        Ok(vec![response?])
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("requester_kind"),
        text_field("requester_id"),
        text_field("slot_id"),
        text_field("date"),
        text_field("status"),
        text_field("note"),
        text_field("recurring_id"),
        text_field("reschedule_token"),
        text_field("reason"),
        text_field("created_on"),
    ]
}

fn resolution_schema() -> Vec<FieldInfo> {
    let mut schema = booking_schema();
    schema.push(text_field("kept"));
    schema.push(text_field("cancelled_id"));
    schema
}

fn series_outcome_schema() -> Vec<FieldInfo> {
    vec![
        text_field("recurring_id"),
        text_field("date"),
        bool_field("booked"),
        text_field("reason"),
    ]
}

fn capacity_schema() -> Vec<FieldInfo> {
    vec![
        text_field("slot_id"),
        text_field("date"),
        int_field("max_capacity"),
        int_field("counted"),
        int_field("available"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("slot_id"),
        text_field("role_id"),
        text_field("role_name"),
        text_field("start_time"),
        text_field("end_time"),
        int_field("max_capacity"),
        int_field("counted"),
        int_field("available"),
        bool_field("closed"),
    ]
}

fn role_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("audience"),
        bool_field("weekends"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("role_id"),
        text_field("start_time"),
        text_field("end_time"),
        int_field("max_capacity"),
        bool_field("is_active"),
        text_field("weekday"),
    ]
}

fn holiday_schema() -> Vec<FieldInfo> {
    vec![text_field("date"), text_field("reason")]
}

/// Result schema a statement will produce, judged from its text so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let lower = stmt.to_ascii_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .windows(2)
            .find(|pair| pair[0] == keyword)
            .map(|pair| pair[1].trim_matches('"'))
    };
    match words.first().copied() {
        Some("select") => match table_after("from") {
            Some("bookings" | "recurring_bookings") => booking_schema(),
            Some("capacity") => capacity_schema(),
            Some("availability") => availability_schema(),
            Some("roles") => role_schema(),
            Some("slots") => slot_schema(),
            Some("holidays") => holiday_schema(),
            _ => vec![],
        },
        Some("insert") => match table_after("into") {
            Some("recurring_bookings") => series_outcome_schema(),
            Some("conflict_resolutions") => resolution_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn hhmm(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn encode_booking(encoder: &mut DataRowEncoder, booking: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.requester.kind.as_str().to_string())?;
    encoder.encode_field(&booking.requester.id.to_string())?;
    encoder.encode_field(&booking.slot_id.to_string())?;
    encoder.encode_field(&booking.date.to_string())?;
    encoder.encode_field(&booking.status.as_str().to_string())?;
    encoder.encode_field(&booking.note)?;
    encoder.encode_field(&booking.recurring_id.map(|id| id.to_string()))?;
    encoder.encode_field(&booking.reschedule_token)?;
    encoder.encode_field(&booking.reason)?;
    encoder.encode_field(&booking.created_on.to_string())
}

fn encode_availability(encoder: &mut DataRowEncoder, row: &SlotAvailability) -> PgWireResult<()> {
    encoder.encode_field(&row.slot.id.to_string())?;
    encoder.encode_field(&row.slot.role_id.to_string())?;
    encoder.encode_field(&row.role_name)?;
    encoder.encode_field(&hhmm(row.slot.window.start))?;
    encoder.encode_field(&hhmm(row.slot.window.end))?;
    encoder.encode_field(&i64::from(row.slot.max_capacity))?;
    encoder.encode_field(&i64::from(row.counted))?;
    encoder.encode_field(&i64::from(row.available))?;
    encoder.encode_field(&row.closed)
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &Slot) -> PgWireResult<()> {
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.role_id.to_string())?;
    encoder.encode_field(&hhmm(slot.window.start))?;
    encoder.encode_field(&hhmm(slot.window.end))?;
    encoder.encode_field(&i64::from(slot.max_capacity))?;
    encoder.encode_field(&slot.is_active)?;
    encoder.encode_field(&slot.weekday.map(|d| crate::calendar::weekday_name(d).to_string()))
}

fn series_outcome_response(outcome: &SeriesOutcome) -> Response {
    let mut rows: Vec<(chrono::NaiveDate, Option<String>)> = outcome
        .successes
        .iter()
        .map(|d| (*d, None))
        .chain(outcome.skipped.iter().map(|s| (s.date, Some(s.reason.clone()))))
        .collect();
    rows.sort_by_key(|(date, _)| *date);
    let recurring_id = outcome.recurring_id.to_string();
    rows_response(series_outcome_schema(), &rows, |encoder, (date, reason)| {
        encoder.encode_field(&recurring_id)?;
        encoder.encode_field(&date.to_string())?;
        encoder.encode_field(&reason.is_none())?;
        encoder.encode_field(reason)
    })
}

fn resolution_response(resolution: &Resolution) -> Response {
    let cancelled = match resolution {
        Resolution::KeptExisting(_) => None,
        Resolution::KeptNew { cancelled, .. } => Some(cancelled.to_string()),
    };
    let kept = resolution.keep().as_str().to_string();
    rows_response(resolution_schema(), std::slice::from_ref(resolution.booking()), |encoder, booking| {
        encode_booking(encoder, booking)?;
        encoder.encode_field(&kept)?;
        encoder.encode_field(&cancelled)
    })
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LarderQueryParser;

#[async_trait]
impl QueryParser for LarderQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LarderHandler {
    type Statement = String;
    type QueryParser = LarderQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let response = self.run(cmd, self.is_staff(client)).await;
        self.flush_notifications(client).await?;
        response
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LarderFactory {
    handler: Arc<LarderHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<LarderAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LarderFactory {
    pub fn new(engine: Arc<Engine>, credentials: Arc<Credentials>) -> Self {
        let auth_source = LarderAuthSource::new(credentials.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LarderHandler::new(engine, credentials)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LarderFactory {
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

/// Serve one client connection until it closes. Each connection gets its own
/// handler so LISTEN subscriptions die with the socket.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    credentials: Arc<Credentials>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = LarderFactory::new(engine, credentials);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// Wire form of an engine error: SQLSTATE by kind, message `KIND: text`.
/// Conflicts carry the `{attempted, existing}` summaries as JSON instead of text.
fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    if kind == ErrorKind::Internal {
        error!("internal error: {e}");
    }
    let text = match &e {
        EngineError::Conflict(detail) => serde_json::to_string(detail.as_ref()).unwrap_or_else(|_| e.to_string()),
        _ => e.to_string(),
    };
    user_error(kind.sqlstate(), format!("{}: {text}", kind.as_str()))
}

fn sql_err(e: SqlError) -> PgWireError {
    match e {
        SqlError::InvalidDate(_) => user_error(
            ErrorKind::InvalidDate.sqlstate(),
            format!("{}: {e}", ErrorKind::InvalidDate.as_str()),
        ),
        _ => user_error("42601", e.to_string()),
    }
}

fn permission_denied(command: &str) -> PgWireError {
    user_error("42501", format!("permission denied: {command} requires the staff login"))
}

fn invalid_channel(channel: &str) -> PgWireError {
    user_error("42000", format!("invalid channel: {channel} (expected slot_{{id}})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM roles"), 0);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($1, $2, $3, $4, $5)"), 5);
        assert_eq!(count_params("SELECT * FROM capacity WHERE slot_id = $2 AND date = $10"), 10);
    }

    #[test]
    fn describes_result_schema_from_statement_text() {
        let names = |schema: Vec<FieldInfo>| schema.iter().map(|f| f.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(result_schema("SELECT * FROM holidays")), ["date", "reason"]);
        assert_eq!(
            names(result_schema("select * from capacity where slot_id = $1 and date = $2")),
            ["slot_id", "date", "max_capacity", "counted", "available"]
        );
        assert_eq!(result_schema("INSERT INTO recurring_bookings VALUES ($1)").len(), 4);
        assert!(result_schema("INSERT INTO bookings VALUES ($1)").is_empty());
        assert!(result_schema("LISTEN slot_x").is_empty());
    }

    #[test]
    fn error_messages_lead_with_kind() {
        let PgWireError::UserError(info) = engine_err(EngineError::PastDate(
            chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        )) else {
            panic!("expected user error");
        };
        assert_eq!(info.code, "22008");
        assert_eq!(info.message, "PAST_DATE: date 2026-01-01 is in the past");
    }

    #[test]
    fn permission_denied_names_the_command() {
        let PgWireError::UserError(info) = permission_denied("insert_staff_booking") else {
            panic!("expected user error");
        };
        assert_eq!(info.code, "42501");
        assert_eq!(info.message, "permission denied: insert_staff_booking requires the staff login");
    }

    #[test]
    fn sql_date_errors_map_to_invalid_date() {
        let PgWireError::UserError(info) = sql_err(SqlError::InvalidDate("2026-02-30".into())) else {
            panic!("expected user error");
        };
        assert_eq!(info.code, "22007");
        assert!(info.message.starts_with("INVALID_DATE: "));
    }
}
