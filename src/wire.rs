use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::auth::LabdeskAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, RowSet, SqlError};

pub struct LabdeskHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LabdeskQueryParser>,
}

impl LabdeskHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LabdeskQueryParser),
        }
    }

    async fn run(&self, session: Option<Uuid>, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(session, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        session: Option<Uuid>,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom {
                id,
                name,
                capacity,
                status,
            } => {
                let room = engine
                    .create_room(id, &name, capacity, status)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(RowSet::Rooms, &[room], room_row))
            }
            Command::UpdateRoom { id, patch } => {
                let room = engine.update_room(id, patch).await.map_err(engine_err)?;
                Ok(rows(RowSet::Rooms, &[room], room_row))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::UpsertUser { user } => {
                engine.upsert_user(user).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking { user_id, booking } => {
                let owner = require_actor(user_id.or(session), "user_id")?;
                let booking = engine
                    .create_booking(owner, booking)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(RowSet::Bookings, &[booking], booking_row))
            }
            Command::UpdateBookingStatus {
                id,
                actor_id,
                change,
            } => {
                let booking = engine
                    .update_booking_status(id, audit_actor(actor_id, session), change)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(RowSet::Bookings, &[booking], booking_row))
            }
            Command::DeleteBooking { id, actor_id } => {
                engine
                    .delete_booking(id, audit_actor(actor_id, session))
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertEvent { admin_id, event } => {
                let admin = require_actor(admin_id.or(session), "created_by")?;
                let event = engine.create_event(admin, event).await.map_err(engine_err)?;
                Ok(rows(RowSet::Events, &[event], event_row))
            }
            Command::UpdateEvent {
                id,
                admin_id,
                patch,
            } => {
                let event = engine
                    .update_event(id, audit_actor(admin_id, session), patch)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(RowSet::Events, &[event], event_row))
            }
            Command::DeleteEvent {
                id,
                admin_id,
                confirm,
            } => {
                engine
                    .delete_event(id, audit_actor(admin_id, session), confirm)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertNotification {
                admin_id,
                notification,
            } => {
                let admin = require_actor(admin_id.or(session), "created_by")?;
                let notification = engine
                    .create_notification(admin, notification)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(RowSet::Notifications, &[notification], notification_row))
            }
            Command::UpdateNotification { id, patch } => {
                let notification = engine
                    .update_notification(id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(RowSet::Notifications, &[notification], notification_row))
            }
            Command::DeleteNotification { id } => {
                engine.delete_notification(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::MarkRead {
                notification_id,
                user_id,
            } => {
                let user = require_actor(user_id.or(session), "user_id")?;
                let changed = engine
                    .mark_as_read(notification_id, user)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(usize::from(changed))))
            }
            Command::MarkAllRead { user_id } => {
                let user = require_actor(user_id.or(session), "user_id")?;
                let count = engine.mark_all_as_read(user).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::ExpireNotifications => {
                let expired = engine
                    .expire_notifications(crate::engine::now_ms())
                    .await
                    .map_err(engine_err)?;
                tracing::debug!(expired, "expire_notifications called");
                Ok(Response::Execution(Tag::new("CALL")))
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms().await;
                Ok(rows(RowSet::Rooms, &rooms, room_row))
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.list_bookings(&filter).await;
                Ok(rows(RowSet::Bookings, &bookings, booking_row))
            }
            Command::SelectEvents { filter } => {
                let events = engine.list_events(&filter).await;
                Ok(rows(RowSet::Events, &events, event_row))
            }
            Command::SelectNotifications { user_id: None } => {
                let all = engine.list_notifications().await;
                Ok(rows(RowSet::Notifications, &all, notification_row))
            }
            Command::SelectNotifications {
                user_id: Some(user_id),
            } => {
                let inbox = engine
                    .list_user_notifications(user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(RowSet::UserNotifications, &inbox, user_notification_row))
            }
            Command::SelectUnreadCount { user_id } => {
                let user = require_actor(user_id.or(session), "user_id")?;
                let unread = engine.unread_count(user).await.map_err(engine_err)?;
                Ok(rows(RowSet::UnreadCount, &[(user, unread)], |enc, (user, unread)| {
                    enc.encode_field(&user.to_string())?;
                    enc.encode_field(&(*unread as i64))
                }))
            }
            Command::SelectAvailableRooms {
                room_id,
                start,
                end,
            } => {
                let window = TimeInterval::try_new(start, end).ok_or_else(|| {
                    engine_err(EngineError::Validation(
                        "end time must be after start time".into(),
                    ))
                })?;
                let rooms = match room_id {
                    None => engine.available_rooms(window).await,
                    Some(id) if engine.is_room_available(id, window).await => {
                        engine.find_room(id).await.into_iter().collect()
                    }
                    Some(_) => Vec::new(),
                };
                Ok(rows(RowSet::Rooms, &rooms, room_row))
            }
            Command::SelectConflicts {
                room_id,
                start,
                end,
                exclude,
            } => {
                let interval = TimeInterval::try_new(start, end).ok_or_else(|| {
                    engine_err(EngineError::Validation(
                        "end time must be after start time".into(),
                    ))
                })?;
                let conflict = engine.has_conflict(room_id, interval, exclude).await;
                Ok(rows(RowSet::Conflicts, &[(room_id, conflict)], |enc, (room, hit)| {
                    enc.encode_field(&room.to_string())?;
                    enc.encode_field(hit)
                }))
            }
        }
    }
}

/// The login user, when it is a user id.
fn session_user<C: ClientInfo>(client: &C) -> Option<Uuid> {
    client
        .metadata()
        .get("user")
        .and_then(|u| Uuid::parse_str(u).ok())
}

fn require_actor(actor: Option<Uuid>, column: &str) -> PgWireResult<Uuid> {
    actor.ok_or_else(|| {
        user_error(
            "22023",
            format!("{column} is required unless logged in with a user id"),
        )
    })
}

/// Audit-only actors fall back to the nil id, which the audit log renders as unknown.
fn audit_actor(explicit: Option<Uuid>, session: Option<Uuid>) -> Uuid {
    explicit.or(session).unwrap_or(Uuid::nil())
}

// ── Row encoding ─────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn notification_fields() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("title"),
        text("content"),
        text("target_group"),
        text("start_date"),
        text("end_date"),
        text("status"),
        text("created_by"),
        text("created_at"),
    ]
}

pub fn schema(set: RowSet) -> Vec<FieldInfo> {
    match set {
        RowSet::Rooms => vec![
            text("id"),
            text("name"),
            typed("capacity", Type::INT8),
            text("status"),
        ],
        RowSet::Bookings => vec![
            text("id"),
            text("room_id"),
            text("user_id"),
            text("event_id"),
            text("start_time"),
            text("end_time"),
            text("status"),
            text("purpose"),
            text("notes"),
            text("created_at"),
            text("last_updated_at"),
        ],
        RowSet::Events => vec![
            text("id"),
            text("title"),
            text("description"),
            text("start_date"),
            text("end_date"),
            text("location"),
            text("status"),
            typed("visibility", Type::BOOL),
            text("audience"),
            text("recurrence_rule"),
            text("created_by"),
            text("last_updated_at"),
        ],
        RowSet::Notifications => notification_fields(),
        RowSet::UserNotifications => {
            let mut fields = notification_fields();
            fields.push(typed("is_read", Type::BOOL));
            fields
        }
        RowSet::UnreadCount => vec![text("user_id"), typed("unread", Type::INT8)],
        RowSet::Conflicts => vec![text("room_id"), typed("has_conflict", Type::BOOL)],
    }
}

fn rows<T>(
    set: RowSet,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(set));
    let data: Vec<PgWireResult<DataRow>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

fn opt_id(id: Option<Uuid>) -> Option<String> {
    id.map(|u| u.to_string())
}

fn room_row(enc: &mut DataRowEncoder, room: &Room) -> PgWireResult<()> {
    enc.encode_field(&room.id.to_string())?;
    enc.encode_field(&room.name)?;
    enc.encode_field(&i64::from(room.capacity))?;
    enc.encode_field(&room.status.as_str())
}

fn booking_row(enc: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.room_id.to_string())?;
    enc.encode_field(&b.user_id.to_string())?;
    enc.encode_field(&opt_id(b.event_id))?;
    enc.encode_field(&format_ms(b.interval.start))?;
    enc.encode_field(&format_ms(b.interval.end))?;
    enc.encode_field(&b.status.as_str())?;
    enc.encode_field(&b.purpose)?;
    enc.encode_field(&b.notes)?;
    enc.encode_field(&format_ms(b.created_at))?;
    enc.encode_field(&format_ms(b.last_updated_at))
}

fn event_row(enc: &mut DataRowEncoder, e: &Event) -> PgWireResult<()> {
    enc.encode_field(&e.id.to_string())?;
    enc.encode_field(&e.title)?;
    enc.encode_field(&e.description)?;
    enc.encode_field(&format_ms(e.start_date))?;
    enc.encode_field(&format_ms(e.end_date))?;
    enc.encode_field(&e.location)?;
    enc.encode_field(&e.status.as_str())?;
    enc.encode_field(&e.visibility)?;
    enc.encode_field(&e.audience.as_str())?;
    enc.encode_field(&e.recurrence_rule)?;
    enc.encode_field(&e.created_by.to_string())?;
    enc.encode_field(&format_ms(e.last_updated_at))
}

fn notification_row(enc: &mut DataRowEncoder, n: &Notification) -> PgWireResult<()> {
    enc.encode_field(&n.id.to_string())?;
    enc.encode_field(&n.title)?;
    enc.encode_field(&n.content)?;
    enc.encode_field(&n.target_group.as_str())?;
    enc.encode_field(&format_ms(n.start_date))?;
    enc.encode_field(&format_ms(n.end_date))?;
    enc.encode_field(&n.status.as_str())?;
    enc.encode_field(&n.created_by.to_string())?;
    enc.encode_field(&format_ms(n.created_at))
}

fn user_notification_row(enc: &mut DataRowEncoder, un: &UserNotification) -> PgWireResult<()> {
    notification_row(enc, &un.notification)?;
    enc.encode_field(&un.is_read)
}

#[async_trait]
impl SimpleQueryHandler for LabdeskHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(session_user(client), query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LabdeskQueryParser;

#[async_trait]
impl QueryParser for LabdeskQueryParser {
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
        Ok(describe_fields(stmt))
    }
}

fn describe_fields(sql_text: &str) -> Vec<FieldInfo> {
    sql::describe(sql_text).map(schema).unwrap_or_default()
}

#[async_trait]
impl ExtendedQueryHandler for LabdeskHandler {
    type Statement = String;
    type QueryParser = LabdeskQueryParser;

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
        let sql_text = substitute_params(portal);
        self.run(session_user(client), &sql_text).await
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
            describe_fields(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_fields(
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

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Inline bound text parameters as quoted literals in one left-to-right pass.
/// Emitted values are never rescanned, and `$N` inside a quoted literal of the
/// statement is left alone.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_quote = !in_quote;
                i += 1;
            }
            b'$' if !in_quote => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>()
                    && let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx))
                {
                    out.push_str(&sql[copied..i]);
                    out.push_str(&param_literal(param.as_ref().map(AsRef::as_ref)));
                    copied = end;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

fn param_literal(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LabdeskFactory {
    handler: Arc<LabdeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<LabdeskAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl LabdeskFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(LabdeskHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                LabdeskAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LabdeskFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = LabdeskFactory::new(engine, password);
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
        EngineError::NotFound(..) => "P0002",
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidState(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
