use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{parse_date, parse_time, parse_weekday};
use crate::model::*;

/// Parsed command from SQL input.
///
/// Dates on mutating commands stay raw strings: rejecting a malformed date is
/// the engine's first admission step and must report `INVALID_DATE`.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRole {
        id: Ulid,
        name: String,
        audience: RequesterKind,
        weekends: bool,
    },
    InsertSlot {
        id: Ulid,
        role_id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        max_capacity: u32,
        weekday: Option<Weekday>,
    },
    /// `None` fields are unchanged; `weekday: Some(None)` clears the restriction.
    EditSlot {
        slot_id: Ulid,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
        max_capacity: Option<u32>,
        is_active: Option<bool>,
        weekday: Option<Option<Weekday>>,
    },
    GrantTraining {
        volunteer_id: Ulid,
        role_id: Ulid,
    },
    RevokeTraining {
        volunteer_id: Ulid,
        role_id: Ulid,
    },
    InsertHoliday {
        date: String,
        reason: Option<String>,
    },
    DeleteHoliday {
        date: String,
    },
    InsertBooking {
        id: Ulid,
        requester: Requester,
        slot_id: Ulid,
        date: String,
        note: Option<String>,
        origin: Origin,
    },
    InsertSeries {
        id: Ulid,
        requester: Requester,
        slot_id: Ulid,
        start_date: String,
        end_date: String,
        pattern: Pattern,
    },
    DeleteSeries {
        id: Ulid,
        from: Option<String>,
    },
    ResolveConflict {
        existing_id: Ulid,
        keep: Keep,
        booking_id: Option<Ulid>,
        slot_id: Option<Ulid>,
        date: Option<String>,
    },
    DecideBooking {
        booking_id: Ulid,
        decision: Decision,
        reason: Option<String>,
    },
    CancelBooking {
        id: Ulid,
    },
    CancelByToken {
        token: String,
    },
    Reschedule {
        token: String,
        booking_id: Ulid,
        slot_id: Ulid,
        date: String,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectRequesterBookings {
        requester_id: Ulid,
    },
    SelectSlotBookings {
        slot_id: Ulid,
        date: NaiveDate,
    },
    SelectCapacity {
        slot_id: Ulid,
        date: NaiveDate,
    },
    SelectAvailability {
        date: NaiveDate,
        role_id: Option<Ulid>,
    },
    SelectRoles,
    SelectSlots,
    SelectHolidays,
    SelectSeries {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

impl Command {
    /// Catalog changes, staff bookings and booking decisions are reserved
    /// for the staff login.
    pub fn requires_staff(&self) -> bool {
        match self {
            Command::InsertRole { .. }
            | Command::InsertSlot { .. }
            | Command::EditSlot { .. }
            | Command::GrantTraining { .. }
            | Command::RevokeTraining { .. }
            | Command::InsertHoliday { .. }
            | Command::DeleteHoliday { .. }
            | Command::DecideBooking { .. } => true,
            Command::InsertBooking { origin, .. } => matches!(origin, Origin::Staff { .. }),
            _ => false,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(channel) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel.to_string(),
        });
    }
    if let Some(channel) = strip_keyword(trimmed, "UNLISTEN") {
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: channel.to_string(),
        });
    }

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

/// The rest of `sql` if it starts with `keyword` followed by whitespace.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace)).then(|| rest.trim())
}

fn arity(table: &'static str, values: &[Expr], expected: usize) -> Result<(), SqlError> {
    if values.len() < expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let optional = |i: usize| values.get(i);

    match table.as_str() {
        "roles" => {
            arity("roles", &values, 3)?;
            Ok(Command::InsertRole {
                id: parse_ulid(&values[0])?,
                name: parse_text(&values[1])?,
                audience: parse_enum(&values[2])?,
                weekends: optional(3).map(parse_bool_or_null).transpose()?.flatten().unwrap_or(false),
            })
        }
        "slots" => {
            arity("slots", &values, 5)?;
            Ok(Command::InsertSlot {
                id: parse_ulid(&values[0])?,
                role_id: parse_ulid(&values[1])?,
                start_time: parse_time_expr(&values[2])?,
                end_time: parse_time_expr(&values[3])?,
                max_capacity: parse_u32(&values[4])?,
                weekday: match optional(5) {
                    Some(expr) => parse_weekday_or_null(expr)?,
                    None => None,
                },
            })
        }
        "slot_edits" => {
            arity("slot_edits", &values, 2)?;
            let weekday = match optional(5) {
                None => None,
                Some(expr) => match parse_text_or_null(expr)? {
                    None => None,
                    Some(day) if day.eq_ignore_ascii_case("any") => Some(None),
                    Some(day) => Some(Some(
                        parse_weekday(&day).ok_or_else(|| SqlError::Parse(format!("bad weekday: {day}")))?,
                    )),
                },
            };
            Ok(Command::EditSlot {
                slot_id: parse_ulid(&values[0])?,
                start_time: parse_time_or_null(&values[1])?,
                end_time: optional(2).map(parse_time_or_null).transpose()?.flatten(),
                max_capacity: optional(3).map(parse_u32_or_null).transpose()?.flatten(),
                is_active: optional(4).map(parse_bool_or_null).transpose()?.flatten(),
                weekday,
            })
        }
        "trainings" => {
            arity("trainings", &values, 2)?;
            Ok(Command::GrantTraining {
                volunteer_id: parse_ulid(&values[0])?,
                role_id: parse_ulid(&values[1])?,
            })
        }
        "holidays" => {
            arity("holidays", &values, 1)?;
            Ok(Command::InsertHoliday {
                date: parse_text(&values[0])?,
                reason: optional(1).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "bookings" | "staff_bookings" => {
            arity("bookings", &values, 5)?;
            let origin = if table == "staff_bookings" {
                Origin::Staff {
                    force: optional(6).map(parse_bool_or_null).transpose()?.flatten().unwrap_or(false),
                    allow_past: optional(7).map(parse_bool_or_null).transpose()?.flatten().unwrap_or(false),
                }
            } else {
                Origin::SelfService
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                requester: parse_requester(&values[1], &values[2])?,
                slot_id: parse_ulid(&values[3])?,
                date: parse_text(&values[4])?,
                note: optional(5).map(parse_text_or_null).transpose()?.flatten(),
                origin,
            })
        }
        "recurring_bookings" => {
            arity("recurring_bookings", &values, 7)?;
            Ok(Command::InsertSeries {
                id: parse_ulid(&values[0])?,
                requester: parse_requester(&values[1], &values[2])?,
                slot_id: parse_ulid(&values[3])?,
                start_date: parse_text(&values[4])?,
                end_date: parse_text(&values[5])?,
                pattern: parse_pattern(&values[6], optional(7))?,
            })
        }
        "conflict_resolutions" => {
            arity("conflict_resolutions", &values, 2)?;
            Ok(Command::ResolveConflict {
                existing_id: parse_ulid(&values[0])?,
                keep: parse_enum(&values[1])?,
                booking_id: optional(2).map(parse_ulid_or_null).transpose()?.flatten(),
                slot_id: optional(3).map(parse_ulid_or_null).transpose()?.flatten(),
                date: optional(4).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "booking_decisions" => {
            arity("booking_decisions", &values, 2)?;
            Ok(Command::DecideBooking {
                booking_id: parse_ulid(&values[0])?,
                decision: parse_enum(&values[1])?,
                reason: optional(2).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "reschedules" => {
            arity("reschedules", &values, 4)?;
            Ok(Command::Reschedule {
                token: parse_text(&values[0])?,
                booking_id: parse_ulid(&values[1])?,
                slot_id: parse_ulid(&values[2])?,
                date: parse_text(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "bookings" => {
            if let Some(id) = find("id") {
                Ok(Command::CancelBooking { id: parse_ulid(id)? })
            } else if let Some(token) = find("reschedule_token") {
                Ok(Command::CancelByToken { token: parse_text(token)? })
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        "recurring_bookings" => Ok(Command::DeleteSeries {
            id: parse_ulid(find("id").ok_or(SqlError::MissingFilter("id"))?)?,
            from: find("from_date").map(parse_text).transpose()?,
        }),
        "trainings" => Ok(Command::RevokeTraining {
            volunteer_id: parse_ulid(find("volunteer_id").ok_or(SqlError::MissingFilter("volunteer_id"))?)?,
            role_id: parse_ulid(find("role_id").ok_or(SqlError::MissingFilter("role_id"))?)?,
        }),
        "holidays" => Ok(Command::DeleteHoliday {
            date: parse_text(find("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
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
    let filters = where_filters(select.selection.as_ref())?;
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);
    let require = |col: &'static str| find(col).ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "bookings" => {
            if let Some(id) = find("id") {
                Ok(Command::SelectBooking { id: parse_ulid(id)? })
            } else if let Some(requester) = find("requester_id") {
                Ok(Command::SelectRequesterBookings {
                    requester_id: parse_ulid(requester)?,
                })
            } else if let Some(slot) = find("slot_id") {
                Ok(Command::SelectSlotBookings {
                    slot_id: parse_ulid(slot)?,
                    date: parse_date_expr(require("date")?)?,
                })
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        "capacity" => Ok(Command::SelectCapacity {
            slot_id: parse_ulid(require("slot_id")?)?,
            date: parse_date_expr(require("date")?)?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            date: parse_date_expr(require("date")?)?,
            role_id: find("role_id").map(parse_ulid).transpose()?,
        }),
        "roles" => Ok(Command::SelectRoles),
        "slots" => Ok(Command::SelectSlots),
        "holidays" => Ok(Command::SelectHolidays),
        "recurring_bookings" => Ok(Command::SelectSeries {
            id: parse_ulid(require("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` pairs from a WHERE clause of AND-ed equalities.
fn where_filters(selection: Option<&Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool_or_null(expr: &Expr) -> Result<Option<bool>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_bool(expr).map(Some)
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    parse_time(&s).ok_or_else(|| SqlError::Parse(format!("bad time: {s}")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_time_expr(expr).map(Some)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    parse_date(&s).ok_or(SqlError::InvalidDate(s))
}

fn parse_weekday_or_null(expr: &Expr) -> Result<Option<Weekday>, SqlError> {
    match parse_text_or_null(expr)? {
        None => Ok(None),
        Some(day) => parse_weekday(&day)
            .map(Some)
            .ok_or_else(|| SqlError::Parse(format!("bad weekday: {day}"))),
    }
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = UnknownValue>,
{
    parse_text(expr)?
        .parse()
        .map_err(|e: UnknownValue| SqlError::Parse(e.to_string()))
}

fn parse_requester(kind: &Expr, id: &Expr) -> Result<Requester, SqlError> {
    Ok(Requester {
        kind: parse_enum(kind)?,
        id: parse_ulid(id)?,
    })
}

/// `'daily'`, or `'weekly'` with a comma-separated day list such as `'mon,thu'`.
fn parse_pattern(pattern: &Expr, days: Option<&Expr>) -> Result<Pattern, SqlError> {
    let name = parse_text(pattern)?;
    match name.to_ascii_lowercase().as_str() {
        "daily" => Ok(Pattern::Daily),
        "weekly" => {
            let list = days.map(parse_text_or_null).transpose()?.flatten().unwrap_or_default();
            let days = list
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(|d| parse_weekday(d).ok_or_else(|| SqlError::Parse(format!("bad weekday: {d}"))))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Pattern::Weekly { days })
        }
        _ => Err(SqlError::Parse(format!("unknown pattern: {name}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid date: {0}")]
    InvalidDate(String),
}
