//! SQL surface: maps a small PostgreSQL dialect onto engine operations.
//!
//! Tables are virtual. INSERT and UPDATE name their columns; WHERE clauses are
//! conjunctions of `column <op> literal`. The projection of a SELECT is ignored,
//! every row set has a fixed schema (see `wire`).

use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use uuid::Uuid;

use crate::model::*;

/// Parsed command from SQL input. `Option<Uuid>` actors default to the session user.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Option<Uuid>,
        name: String,
        capacity: u32,
        status: RoomStatus,
    },
    UpdateRoom {
        id: Uuid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Uuid,
    },
    UpsertUser {
        user: User,
    },
    InsertBooking {
        user_id: Option<Uuid>,
        booking: NewBooking,
    },
    UpdateBookingStatus {
        id: Uuid,
        actor_id: Option<Uuid>,
        change: BookingStatusChange,
    },
    DeleteBooking {
        id: Uuid,
        actor_id: Option<Uuid>,
    },
    InsertEvent {
        admin_id: Option<Uuid>,
        event: NewEvent,
    },
    UpdateEvent {
        id: Uuid,
        admin_id: Option<Uuid>,
        patch: EventPatch,
    },
    DeleteEvent {
        id: Uuid,
        admin_id: Option<Uuid>,
        confirm: bool,
    },
    InsertNotification {
        admin_id: Option<Uuid>,
        notification: NewNotification,
    },
    UpdateNotification {
        id: Uuid,
        patch: NotificationPatch,
    },
    DeleteNotification {
        id: Uuid,
    },
    MarkRead {
        notification_id: Uuid,
        user_id: Option<Uuid>,
    },
    MarkAllRead {
        user_id: Option<Uuid>,
    },
    ExpireNotifications,
    SelectRooms,
    SelectBookings {
        filter: BookingFilter,
    },
    SelectEvents {
        filter: EventFilter,
    },
    /// `None` lists every notification; `Some` is that user's inbox.
    SelectNotifications {
        user_id: Option<Uuid>,
    },
    SelectUnreadCount {
        user_id: Option<Uuid>,
    },
    /// Available rooms free over `[start, end)`; `room_id` narrows to one room.
    SelectAvailableRooms {
        room_id: Option<Uuid>,
        start: Ms,
        end: Ms,
    },
    SelectConflicts {
        room_id: Uuid,
        start: Ms,
        end: Ms,
        exclude: Option<Uuid>,
    },
}

/// Shape of the rows a statement returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSet {
    Rooms,
    Bookings,
    Events,
    Notifications,
    UserNotifications,
    UnreadCount,
    Conflicts,
}

impl Command {
    pub fn row_set(&self) -> Option<RowSet> {
        match self {
            Command::InsertRoom { .. }
            | Command::UpdateRoom { .. }
            | Command::SelectRooms
            | Command::SelectAvailableRooms { .. } => Some(RowSet::Rooms),
            Command::InsertBooking { .. }
            | Command::UpdateBookingStatus { .. }
            | Command::SelectBookings { .. } => Some(RowSet::Bookings),
            Command::InsertEvent { .. } | Command::UpdateEvent { .. } | Command::SelectEvents { .. } => {
                Some(RowSet::Events)
            }
            Command::InsertNotification { .. } | Command::UpdateNotification { .. } => {
                Some(RowSet::Notifications)
            }
            Command::SelectNotifications { user_id } => Some(if user_id.is_some() {
                RowSet::UserNotifications
            } else {
                RowSet::Notifications
            }),
            Command::SelectUnreadCount { .. } => Some(RowSet::UnreadCount),
            Command::SelectConflicts { .. } => Some(RowSet::Conflicts),
            _ => None,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if let Some(procedure) = call_target(sql) {
        return match procedure.as_str() {
            "expire_notifications" => Ok(Command::ExpireNotifications),
            _ => Err(SqlError::Unsupported(format!("procedure {procedure}"))),
        };
    }

    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row set a statement will produce, without binding its parameters.
/// Used to describe prepared statements that still carry `$n` placeholders.
pub fn describe(sql: &str) -> Option<RowSet> {
    if call_target(sql).is_some() {
        return None;
    }
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => {
            let table = insert_table_name(insert).ok()?;
            mutation_row_set(&table)
        }
        Statement::Update { table, .. } => {
            let table = table_factor_name(&table.relation).ok()?;
            mutation_row_set(&table)
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            let filters = Filters::parse(select.selection.as_ref()).ok()?;
            match table.as_str() {
                "rooms" | "available_rooms" => Some(RowSet::Rooms),
                "bookings" => Some(RowSet::Bookings),
                "events" => Some(RowSet::Events),
                "notifications" if filters.get("user_id").is_some() => {
                    Some(RowSet::UserNotifications)
                }
                "notifications" => Some(RowSet::Notifications),
                "unread_count" => Some(RowSet::UnreadCount),
                "conflicts" => Some(RowSet::Conflicts),
                _ => None,
            }
        }
        _ => None,
    }
}

fn mutation_row_set(table: &str) -> Option<RowSet> {
    match table {
        "rooms" => Some(RowSet::Rooms),
        "bookings" => Some(RowSet::Bookings),
        "events" => Some(RowSet::Events),
        "notifications" => Some(RowSet::Notifications),
        _ => None,
    }
}

/// `CALL name()` → lowercase `name`.
fn call_target(sql: &str) -> Option<String> {
    let sql = sql.trim().trim_end_matches(';').trim_end();
    let head = sql.get(..5)?;
    if !head.eq_ignore_ascii_case("call ") {
        return None;
    }
    let name = sql[5..].trim();
    let name = name.strip_suffix(')').and_then(|n| n.trim_end().strip_suffix('(')).unwrap_or(name);
    Some(name.trim().to_lowercase())
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_fields(insert)?;

    match table.as_str() {
        "rooms" => {
            row.reject_unknown(&table, &["id", "name", "capacity", "status"])?;
            Ok(Command::InsertRoom {
                id: row.optional("id", parse_uuid)?,
                name: parse_string(row.required("name")?)?,
                capacity: row.optional("capacity", parse_u32)?.unwrap_or(1),
                status: row
                    .optional("status", parse_enum::<RoomStatus>)?
                    .unwrap_or(RoomStatus::Available),
            })
        }
        "users" => {
            row.reject_unknown(&table, &["id", "full_name", "roles", "status"])?;
            Ok(Command::UpsertUser {
                user: User {
                    id: parse_uuid(row.required("id")?)?,
                    full_name: parse_string(row.required("full_name")?)?,
                    roles: row.optional("roles", parse_roles)?.unwrap_or_default(),
                    status: row
                        .optional("status", parse_enum::<UserStatus>)?
                        .unwrap_or(UserStatus::Active),
                },
            })
        }
        "bookings" => {
            row.reject_unknown(
                &table,
                &["room_id", "user_id", "event_id", "start_time", "end_time", "purpose", "notes"],
            )?;
            Ok(Command::InsertBooking {
                user_id: row.optional("user_id", parse_uuid)?,
                booking: NewBooking {
                    room_id: parse_uuid(row.required("room_id")?)?,
                    start: parse_timestamp_expr(row.required("start_time")?)?,
                    end: parse_timestamp_expr(row.required("end_time")?)?,
                    purpose: row.optional("purpose", parse_string)?.unwrap_or_default(),
                    event_id: row.optional("event_id", parse_uuid)?,
                    notes: row.optional("notes", parse_string)?,
                },
            })
        }
        "events" => {
            row.reject_unknown(
                &table,
                &[
                    "title",
                    "description",
                    "start_date",
                    "end_date",
                    "location",
                    "status",
                    "visibility",
                    "audience",
                    "recurrence_rule",
                    "created_by",
                ],
            )?;
            Ok(Command::InsertEvent {
                admin_id: row.optional("created_by", parse_uuid)?,
                event: NewEvent {
                    title: row.optional("title", parse_string)?.unwrap_or_default(),
                    description: row.optional("description", parse_string)?,
                    start_date: row.optional("start_date", parse_timestamp_expr)?,
                    end_date: row.optional("end_date", parse_timestamp_expr)?,
                    location: row.optional("location", parse_string)?,
                    status: row.optional("status", parse_enum::<EventStatus>)?,
                    visibility: row.optional("visibility", parse_bool)?,
                    audience: row.optional("audience", parse_enum::<TargetGroup>)?,
                    recurrence_rule: row.optional("recurrence_rule", parse_string)?,
                },
            })
        }
        "notifications" => {
            row.reject_unknown(
                &table,
                &["title", "content", "target_group", "start_date", "end_date", "created_by"],
            )?;
            Ok(Command::InsertNotification {
                admin_id: row.optional("created_by", parse_uuid)?,
                notification: NewNotification {
                    title: row.optional("title", parse_string)?.unwrap_or_default(),
                    content: row.optional("content", parse_string)?.unwrap_or_default(),
                    target_group: row
                        .optional("target_group", parse_enum::<TargetGroup>)?
                        .unwrap_or(TargetGroup::All),
                    start_date: parse_timestamp_expr(row.required("start_date")?)?,
                    end_date: parse_timestamp_expr(row.required("end_date")?)?,
                },
            })
        }
        "notification_reads" => {
            row.reject_unknown(&table, &["notification_id", "user_id"])?;
            let user_id = row.optional("user_id", parse_uuid)?;
            Ok(match row.optional("notification_id", parse_uuid)? {
                Some(notification_id) => Command::MarkRead {
                    notification_id,
                    user_id,
                },
                None => Command::MarkAllRead { user_id },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let set = assignment_fields(assignments)?;
    let filters = Filters::parse(selection)?;
    filters.reject_unknown(&table, &["id"])?;
    let id = parse_uuid(filters.required("id")?)?;

    match table.as_str() {
        "rooms" => {
            set.reject_unknown(&table, &["name", "capacity", "status"])?;
            Ok(Command::UpdateRoom {
                id,
                patch: RoomPatch {
                    name: set.optional("name", parse_string)?,
                    capacity: set.optional("capacity", parse_u32)?,
                    status: set.optional("status", parse_enum::<RoomStatus>)?,
                },
            })
        }
        "bookings" => {
            set.reject_unknown(&table, &["status", "notes", "force", "updated_by"])?;
            Ok(Command::UpdateBookingStatus {
                id,
                actor_id: set.optional("updated_by", parse_uuid)?,
                change: BookingStatusChange {
                    status: parse_enum::<BookingStatus>(set.required("status")?)?,
                    notes: set.optional("notes", parse_string)?,
                    force: set.optional("force", parse_bool)?.unwrap_or(false),
                },
            })
        }
        "events" => {
            set.reject_unknown(
                &table,
                &[
                    "title",
                    "description",
                    "start_date",
                    "end_date",
                    "location",
                    "status",
                    "visibility",
                    "audience",
                    "recurrence_rule",
                    "updated_by",
                ],
            )?;
            Ok(Command::UpdateEvent {
                id,
                admin_id: set.optional("updated_by", parse_uuid)?,
                patch: EventPatch {
                    title: set.optional("title", parse_string)?,
                    description: set.optional("description", parse_string)?,
                    start_date: set.optional("start_date", parse_timestamp_expr)?,
                    end_date: set.optional("end_date", parse_timestamp_expr)?,
                    location: set.optional("location", parse_string)?,
                    status: set.optional("status", parse_enum::<EventStatus>)?,
                    visibility: set.optional("visibility", parse_bool)?,
                    audience: set.optional("audience", parse_enum::<TargetGroup>)?,
                    recurrence_rule: set.optional("recurrence_rule", parse_string)?,
                },
            })
        }
        "notifications" => {
            set.reject_unknown(
                &table,
                &["title", "content", "target_group", "start_date", "end_date", "status"],
            )?;
            Ok(Command::UpdateNotification {
                id,
                patch: NotificationPatch {
                    title: set.optional("title", parse_string)?,
                    content: set.optional("content", parse_string)?,
                    target_group: set.optional("target_group", parse_enum::<TargetGroup>)?,
                    start_date: set.optional("start_date", parse_timestamp_expr)?,
                    end_date: set.optional("end_date", parse_timestamp_expr)?,
                    status: set.optional("status", parse_enum::<NotificationStatus>)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::parse(delete.selection.as_ref())?;
    let id = parse_uuid(filters.required("id")?)?;

    match table.as_str() {
        "rooms" => {
            filters.reject_unknown(&table, &["id"])?;
            Ok(Command::DeleteRoom { id })
        }
        "bookings" => {
            filters.reject_unknown(&table, &["id", "deleted_by"])?;
            Ok(Command::DeleteBooking {
                id,
                actor_id: filters.optional("deleted_by", parse_uuid)?,
            })
        }
        "events" => {
            filters.reject_unknown(&table, &["id", "confirm", "deleted_by"])?;
            Ok(Command::DeleteEvent {
                id,
                admin_id: filters.optional("deleted_by", parse_uuid)?,
                confirm: filters.optional("confirm", parse_bool)?.unwrap_or(false),
            })
        }
        "notifications" => {
            filters.reject_unknown(&table, &["id"])?;
            Ok(Command::DeleteNotification { id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::parse(select.selection.as_ref())?;

    match table.as_str() {
        "rooms" => {
            filters.reject_unknown(&table, &[])?;
            Ok(Command::SelectRooms)
        }
        "bookings" => {
            filters.reject_unknown(
                &table,
                &["room_id", "user_id", "event_id", "status", "start_time", "end_time"],
            )?;
            Ok(Command::SelectBookings {
                filter: BookingFilter {
                    room_id: filters.optional("room_id", parse_uuid)?,
                    user_id: filters.optional("user_id", parse_uuid)?,
                    event_id: filters.optional("event_id", parse_uuid)?,
                    status: filters.optional("status", parse_enum::<BookingStatus>)?,
                    from: filters.lower_bound("end_time", parse_timestamp_expr)?,
                    to: filters.upper_bound("start_time", parse_timestamp_expr)?,
                },
            })
        }
        "events" => {
            filters.reject_unknown(&table, &["status", "upcoming", "start_date", "end_date"])?;
            Ok(Command::SelectEvents {
                filter: EventFilter {
                    status: filters.optional("status", parse_enum::<EventStatus>)?,
                    upcoming_only: filters.optional("upcoming", parse_bool)?.unwrap_or(false),
                    from: filters.lower_bound("end_date", parse_timestamp_expr)?,
                    to: filters.upper_bound("start_date", parse_timestamp_expr)?,
                },
            })
        }
        "notifications" => {
            filters.reject_unknown(&table, &["user_id"])?;
            Ok(Command::SelectNotifications {
                user_id: filters.optional("user_id", parse_uuid)?,
            })
        }
        "unread_count" => {
            filters.reject_unknown(&table, &["user_id"])?;
            Ok(Command::SelectUnreadCount {
                user_id: filters.optional("user_id", parse_uuid)?,
            })
        }
        "available_rooms" => {
            filters.reject_unknown(&table, &["room_id", "start_time", "end_time"])?;
            Ok(Command::SelectAvailableRooms {
                room_id: filters.optional("room_id", parse_uuid)?,
                start: filters
                    .lower_bound("start_time", parse_timestamp_expr)?
                    .ok_or(SqlError::MissingFilter("start_time"))?,
                end: filters
                    .upper_bound("end_time", parse_timestamp_expr)?
                    .ok_or(SqlError::MissingFilter("end_time"))?,
            })
        }
        "conflicts" => {
            filters.reject_unknown(&table, &["room_id", "start_time", "end_time", "exclude_id"])?;
            Ok(Command::SelectConflicts {
                room_id: parse_uuid(filters.required("room_id")?)?,
                start: filters
                    .lower_bound("start_time", parse_timestamp_expr)?
                    .ok_or(SqlError::MissingFilter("start_time"))?,
                end: filters
                    .upper_bound("end_time", parse_timestamp_expr)?
                    .ok_or(SqlError::MissingFilter("end_time"))?,
                exclude: filters.optional("exclude_id", parse_uuid)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column/value maps ─────────────────────────────────────────

/// Column → value pairs from an INSERT row or UPDATE SET list.
struct Fields<'a>(Vec<(String, &'a Expr)>);

impl<'a> Fields<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col)
            .filter(|e| !is_null(e))
            .ok_or(SqlError::MissingColumn(col))
    }

    /// Absent and NULL both read as `None`.
    fn optional<T>(
        &self,
        col: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(col) {
            Some(e) if !is_null(e) => parse(e).map(Some),
            _ => Ok(None),
        }
    }

    fn reject_unknown(&self, table: &str, known: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !known.contains(&c.as_str())) {
            Some((col, _)) => Err(SqlError::UnknownColumn(table.to_string(), col.clone())),
            None => Ok(()),
        }
    }
}

fn insert_fields(insert: &ast::Insert) -> Result<Fields<'_>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT must name its columns".into()));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = body.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    let row = match values.rows.as_slice() {
        [row] => row,
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };
    if row.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
    }
    Ok(Fields(
        insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(row.iter())
            .collect(),
    ))
}

fn assignment_fields(assignments: &[ast::Assignment]) -> Result<Fields<'_>, SqlError> {
    let mut fields = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        fields.push((col, &a.value));
    }
    Ok(Fields(fields))
}

/// One `column <op> value` term of a WHERE conjunction.
struct Predicate<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

struct Filters<'a>(Vec<Predicate<'a>>);

impl<'a> Filters<'a> {
    fn parse(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut out)?;
        }
        Ok(Filters(out))
    }

    fn find(&self, col: &str, ops: &[BinaryOperator]) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|p| p.column == col && ops.contains(&p.op))
            .map(|p| p.value)
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.find(col, &[BinaryOperator::Eq])
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn optional<T>(
        &self,
        col: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.get(col).map(parse).transpose()
    }

    /// `col >= v`, `col > v` or `col = v`.
    fn lower_bound<T>(
        &self,
        col: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.find(col, &[BinaryOperator::GtEq, BinaryOperator::Gt, BinaryOperator::Eq])
            .map(parse)
            .transpose()
    }

    /// `col <= v`, `col < v` or `col = v`.
    fn upper_bound<T>(
        &self,
        col: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.find(col, &[BinaryOperator::LtEq, BinaryOperator::Lt, BinaryOperator::Eq])
            .map(parse)
            .transpose()
    }

    fn reject_unknown(&self, table: &str, known: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|p| !known.contains(&p.column.as_str())) {
            Some(p) => Err(SqlError::UnknownColumn(table.to_string(), p.column.clone())),
            None => Ok(()),
        }
    }
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            match op {
                BinaryOperator::Eq
                | BinaryOperator::GtEq
                | BinaryOperator::Gt
                | BinaryOperator::LtEq
                | BinaryOperator::Lt => {
                    out.push(Predicate {
                        column,
                        op: op.clone(),
                        value: right,
                    });
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("operator {op}"))),
            }
        }
        _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::EscapedStringLiteral(s)) => Ok(s.clone()),
        Some(Value::DollarQuotedString(d)) => Ok(d.value.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_uuid(expr: &Expr) -> Result<Uuid, SqlError> {
    let s = parse_string(expr)?;
    Uuid::parse_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad UUID '{s}': {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Integer milliseconds, or a date/time string.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse::<Ms>()
            .ok()
            .or_else(|| parse_timestamp(s))
            .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}"))),
        _ => parse_i64(expr),
    }
}

fn parse_enum<T: FromStr<Err = String>>(expr: &Expr) -> Result<T, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

/// `'Lecturer,Student'` → roles. Empty string means no roles.
fn parse_roles(expr: &Expr) -> Result<Vec<Role>, SqlError> {
    let s = parse_string(expr)?;
    s.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|r| r.parse().map_err(SqlError::Parse))
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String, String),
    WrongArity(usize, usize),
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
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} for {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
