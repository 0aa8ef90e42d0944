use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::ClaimRequest;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertHost {
        id: Ulid,
        username: String,
        name: Option<String>,
        timezone: Tz,
    },
    InsertEventType {
        event_type: EventType,
    },
    DeactivateEventType {
        id: Ulid,
    },
    SelectEventType {
        username: String,
        slug: String,
    },
    InsertRule {
        id: Ulid,
        host_id: Ulid,
        day_of_week: u8,
        start: WallTime,
        end: WallTime,
        /// `None` means the host's own zone.
        timezone: Option<Tz>,
    },
    DeleteRule {
        id: Ulid,
    },
    SelectRules {
        host_id: Ulid,
    },
    InsertOverride {
        date_override: DateOverride,
    },
    DeleteOverride {
        id: Ulid,
    },
    SelectOverrides {
        host_id: Ulid,
    },
    InsertBusy {
        host_id: Ulid,
        span: Span,
    },
    ClearBusy {
        host_id: Ulid,
    },
    SelectAvailability {
        host_id: Ulid,
        date: NaiveDate,
    },
    SelectSlots {
        event_type_id: Ulid,
        date: NaiveDate,
        timezone: Option<Tz>,
    },
    InsertBooking {
        request: ClaimRequest,
    },
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        host_id: Ulid,
        status: Option<BookingStatus>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.trim().trim_end_matches(';').trim().is_empty() {
        return Err(SqlError::Empty);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = Fields::from_insert(insert)?;

    match table.as_str() {
        "hosts" => Ok(Command::InsertHost {
            id: row.ulid("id")?,
            username: row.text("username")?,
            name: row.opt_text("name")?,
            timezone: row.opt_tz("timezone")?.unwrap_or(Tz::UTC),
        }),
        "event_types" => {
            let location_type = match row.opt_text("location_type")? {
                Some(s) => s
                    .parse()
                    .map_err(|e: String| SqlError::invalid("location_type", e))?,
                None => LocationType::GoogleMeet,
            };
            Ok(Command::InsertEventType {
                event_type: EventType {
                    id: row.ulid("id")?,
                    host_id: row.ulid("host_id")?,
                    slug: row.text("slug")?,
                    name: row.text("name")?,
                    duration_minutes: row.u32("duration")?,
                    is_active: row.opt_bool("active")?.unwrap_or(true),
                    location_type,
                    location_url: row.opt_text("location_url")?.filter(|u| !u.is_empty()),
                },
            })
        }
        "weekly_rules" => {
            let day = row.u32("day_of_week")?;
            Ok(Command::InsertRule {
                id: row.ulid("id")?,
                host_id: row.ulid("host_id")?,
                day_of_week: u8::try_from(day)
                    .map_err(|_| SqlError::invalid("day_of_week", format!("{day} out of range")))?,
                start: row.wall_time("start_time")?,
                end: row.wall_time("end_time")?,
                timezone: row.opt_tz("timezone")?,
            })
        }
        "date_overrides" => Ok(Command::InsertOverride {
            date_override: DateOverride {
                id: row.ulid("id")?,
                host_id: row.ulid("host_id")?,
                date: row.date("date")?,
                is_available: row.bool("is_available")?,
                start: row.opt_wall_time("start_time")?,
                end: row.opt_wall_time("end_time")?,
            },
        }),
        "busy_intervals" => {
            let start = to_ms(row.instant("start_time")?);
            let end = to_ms(row.instant("end_time")?);
            if start >= end {
                return Err(SqlError::invalid("end_time", "must be after start_time"));
            }
            Ok(Command::InsertBusy {
                host_id: row.ulid("host_id")?,
                span: Span::new(start, end),
            })
        }
        "bookings" => Ok(Command::InsertBooking {
            request: ClaimRequest {
                id: row.opt_ulid("id")?,
                event_type_id: row.ulid("event_type_id")?,
                start: row.instant("start_time")?,
                attendee_name: row.text("attendee_name")?,
                attendee_email: row.text("attendee_email")?,
                attendee_notes: row.opt_text("attendee_notes")?,
                timezone: row.opt_tz("timezone")?.unwrap_or(Tz::UTC),
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Fields::from_where(delete.selection.as_ref())?;

    match table.as_str() {
        "event_types" => Ok(Command::DeactivateEventType {
            id: filters.ulid("id")?,
        }),
        "weekly_rules" => Ok(Command::DeleteRule {
            id: filters.ulid("id")?,
        }),
        "date_overrides" => Ok(Command::DeleteOverride {
            id: filters.ulid("id")?,
        }),
        "busy_intervals" => Ok(Command::ClearBusy {
            host_id: filters.ulid("host_id")?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: filters.ulid("id")?,
            reason: filters.opt_text("reason")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Fields::from_where(select.selection.as_ref())?;

    match table.as_str() {
        "event_types" => Ok(Command::SelectEventType {
            username: filters.text("username")?,
            slug: filters.text("slug")?,
        }),
        "weekly_rules" => Ok(Command::SelectRules {
            host_id: filters.ulid("host_id")?,
        }),
        "date_overrides" => Ok(Command::SelectOverrides {
            host_id: filters.ulid("host_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            host_id: filters.ulid("host_id")?,
            date: filters.date("date")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            event_type_id: filters.ulid("event_type_id")?,
            date: filters.date("date")?,
            timezone: filters.opt_tz("timezone")?,
        }),
        "bookings" => match filters.opt_ulid("id")? {
            Some(id) => Ok(Command::SelectBooking { id }),
            None => Ok(Command::SelectBookings {
                host_id: filters.ulid("host_id")?,
                status: filters
                    .opt_text("status")?
                    .map(|s| s.parse().map_err(|e: String| SqlError::invalid("status", e)))
                    .transpose()?,
            }),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column/value access ───────────────────────────────────────

/// Column name → value expression, from an INSERT row or an AND-chain of
/// equality filters. `where_clause` picks the error for a missing column.
struct Fields<'a> {
    values: HashMap<String, &'a Expr>,
    where_clause: bool,
}

impl<'a> Fields<'a> {
    fn from_insert(insert: &'a ast::Insert) -> Result<Self, SqlError> {
        if insert.columns.is_empty() {
            return Err(SqlError::Parse("INSERT must name its columns".into()));
        }
        let rows = insert_rows(insert)?;
        let row = match rows {
            [row] => row,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        };
        if row.len() != insert.columns.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
        }
        let values = insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(row.iter())
            .collect();
        Ok(Self {
            values,
            where_clause: false,
        })
    }

    fn from_where(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut values = HashMap::new();
        if let Some(expr) = selection {
            collect_equalities(expr, &mut values)?;
        }
        Ok(Self {
            values,
            where_clause: true,
        })
    }

    fn missing(&self, column: &'static str) -> SqlError {
        if self.where_clause {
            SqlError::MissingFilter(column)
        } else {
            SqlError::MissingColumn(column)
        }
    }

    /// The column's literal, with NULL treated as absent.
    fn value(&self, column: &'static str) -> Result<Option<&'a Value>, SqlError> {
        let Some(&expr) = self.values.get(column) else {
            return Ok(None);
        };
        match extract_value(expr) {
            Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(v)),
            None => Err(SqlError::invalid(column, format!("expected a literal, got {expr}"))),
        }
    }

    fn opt_text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        match self.value(column)? {
            None => Ok(None),
            Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n, _)) => Ok(Some(n.clone())),
            Some(other) => Err(SqlError::invalid(column, format!("expected string, got {other}"))),
        }
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        self.opt_text(column)?.ok_or_else(|| self.missing(column))
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.opt_text(column)?
            .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::invalid(column, format!("bad ULID: {e}"))))
            .transpose()
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(column)?.ok_or_else(|| self.missing(column))
    }

    fn opt_tz(&self, column: &'static str) -> Result<Option<Tz>, SqlError> {
        self.opt_text(column)?
            .map(|s| {
                s.parse::<Tz>()
                    .map_err(|_| SqlError::invalid(column, format!("unknown timezone {s:?}")))
            })
            .transpose()
    }

    fn opt_wall_time(&self, column: &'static str) -> Result<Option<WallTime>, SqlError> {
        self.opt_text(column)?
            .map(|s| s.parse::<WallTime>().map_err(|e| SqlError::invalid(column, e.to_string())))
            .transpose()
    }

    fn wall_time(&self, column: &'static str) -> Result<WallTime, SqlError> {
        self.opt_wall_time(column)?.ok_or_else(|| self.missing(column))
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        let s = self.text(column)?;
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|_| SqlError::invalid(column, format!("expected YYYY-MM-DD, got {s:?}")))
    }

    /// RFC 3339 with an explicit offset.
    fn instant(&self, column: &'static str) -> Result<DateTime<Utc>, SqlError> {
        let s = self.text(column)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SqlError::invalid(column, format!("bad RFC 3339 instant {s:?}: {e}")))
    }

    fn opt_bool(&self, column: &'static str) -> Result<Option<bool>, SqlError> {
        match self.value(column)? {
            None => Ok(None),
            Some(Value::Boolean(b)) => Ok(Some(*b)),
            Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Some(true)),
                "false" | "f" | "0" => Ok(Some(false)),
                _ => Err(SqlError::invalid(column, format!("bad bool: {s}"))),
            },
            Some(Value::Number(n, _)) => Ok(Some(n != "0")),
            Some(other) => Err(SqlError::invalid(column, format!("expected bool, got {other}"))),
        }
    }

    fn bool(&self, column: &'static str) -> Result<bool, SqlError> {
        self.opt_bool(column)?.ok_or_else(|| self.missing(column))
    }

    fn u32(&self, column: &'static str) -> Result<u32, SqlError> {
        let s = self.text(column)?;
        s.parse()
            .map_err(|_| SqlError::invalid(column, format!("expected a non-negative integer, got {s:?}")))
    }
}

fn collect_equalities<'a>(
    expr: &'a Expr,
    out: &mut HashMap<String, &'a Expr>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, right.as_ref());
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
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
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value for {column}: {reason}")]
    InvalidValue { column: &'static str, reason: String },
}

impl SqlError {
    fn invalid(column: &'static str, reason: impl Into<String>) -> Self {
        SqlError::InvalidValue {
            column,
            reason: reason.into(),
        }
    }
}
