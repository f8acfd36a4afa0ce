use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        username: String,
        role: Role,
        superuser: bool,
    },
    /// `None` fields are left as they are.
    UpdateProfile {
        trainer_id: Ulid,
        specialties: Option<String>,
        bio: Option<String>,
        experience_years: Option<u32>,
    },
    InsertWindow {
        id: Ulid,
        trainer_id: Ulid,
        spec: WindowSpec,
    },
    DeleteWindow {
        id: Ulid,
    },
    /// Full replace of a trainer's weekly schedule; empty clears it.
    ReplaceSchedule {
        trainer_id: Ulid,
        windows: Vec<WindowSpec>,
    },
    InsertCommitment {
        draft: CommitmentDraft,
    },
    RescheduleCommitment {
        id: Ulid,
        start: Stamp,
        end: Stamp,
    },
    SetCommitmentStatus {
        id: Ulid,
        status: Option<CommitmentStatus>,
        feedback: Option<String>,
    },
    DeleteCommitment {
        id: Ulid,
    },
    /// The client is the session user.
    InsertBooking {
        id: Ulid,
        trainer_id: Ulid,
        start: Stamp,
        end: Stamp,
        notes: Option<String>,
    },
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    TransitionBooking {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectAvailableTrainers {
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    },
    SelectSlotCheck {
        trainer_id: Ulid,
        start: Stamp,
        end: Stamp,
        exclude: Option<Ulid>,
    },
    SelectOpenSlots {
        trainer_id: Ulid,
        date: NaiveDate,
    },
    SelectWindows {
        trainer_id: Ulid,
    },
    SelectCommitments {
        trainer_id: Ulid,
        from: Option<Stamp>,
        to: Option<Stamp>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectTrainers {
        filter: TrainerFilter,
    },
    /// `None` asks for the session user's own next session.
    SelectNextSession {
        trainer_id: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
    /// `None` is `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

/// Case-insensitive ASCII prefix match. `prefix` must be ASCII.
fn strip_keyword<'a>(sql: &'a str, prefix: &str) -> Option<&'a str> {
    let head = sql.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &sql[prefix.len()..])
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN ") {
        let channel = rest.trim().to_string();
        return Ok(Command::Listen { channel });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN ") {
        let channel = rest.trim();
        let channel = (channel != "*").then(|| channel.to_string());
        return Ok(Command::Unlisten { channel });
    }
    if strip_keyword(trimmed, "UPDATE ").is_some() {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(parse_err)?;
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

fn parse_err(e: ParserError) -> SqlError {
    SqlError::Parse(e.to_string())
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    if table == "weekly_schedule" {
        return parse_schedule_rows(&rows);
    }
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let values = &rows[0];

    match table.as_str() {
        "users" => {
            arity("users", values, 3)?;
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                username: parse_string(&values[1])?,
                role: parse_string(&values[2])?.parse().map_err(SqlError::Parse)?,
                superuser: values.get(3).map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        "availability" => {
            arity("availability", values, 5)?;
            Ok(Command::InsertWindow {
                id: parse_ulid(&values[0])?,
                trainer_id: parse_ulid(&values[1])?,
                spec: parse_window(&values[2], &values[3], &values[4])?,
            })
        }
        "commitments" => {
            arity("commitments", values, 5)?;
            Ok(Command::InsertCommitment {
                draft: CommitmentDraft {
                    id: parse_ulid(&values[0])?,
                    trainer_id: parse_ulid(&values[1])?,
                    start: parse_stamp(&values[2])?,
                    end: parse_stamp(&values[3])?,
                    label: parse_string(&values[4])?,
                    location: optional_column(values, 5)?,
                    notes: optional_column(values, 6)?,
                },
            })
        }
        "bookings" => {
            arity("bookings", values, 4)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                trainer_id: parse_ulid(&values[1])?,
                start: parse_stamp(&values[2])?,
                end: parse_stamp(&values[3])?,
                notes: optional_column(values, 4)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(trainer_id, day_of_week, start_time, end_time)` rows, all for one trainer.
fn parse_schedule_rows(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut trainer_id = None;
    let mut windows = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        arity("weekly_schedule row", row, 4)?;
        let tid = parse_ulid(&row[0]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
        if *trainer_id.get_or_insert(tid) != tid {
            return Err(SqlError::Unsupported(
                "weekly_schedule rows for more than one trainer".into(),
            ));
        }
        windows.push(
            parse_window(&row[1], &row[2], &row[3])
                .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
        );
    }
    let trainer_id = trainer_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::ReplaceSchedule { trainer_id, windows })
}

fn parse_window(day: &Expr, start: &Expr, end: &Expr) -> Result<WindowSpec, SqlError> {
    Ok(WindowSpec {
        day: parse_day(day)?,
        start: parse_time(start)?,
        end: parse_time(end)?,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::DeleteWindow { id: filters.ulid("id")? }),
        "weekly_schedule" => Ok(Command::ReplaceSchedule {
            trainer_id: filters.ulid("trainer_id")?,
            windows: Vec::new(),
        }),
        "commitments" => Ok(Command::DeleteCommitment { id: filters.ulid("id")? }),
        "bookings" => Ok(Command::DeleteBooking { id: filters.ulid("id")? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

/// `UPDATE <table> SET col = value, ... WHERE id = ...`, read straight off
/// the parser so only plain assignments are accepted.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parse_err)?;
    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(SqlError::Parse("expected UPDATE".into()));
    }
    let name = parser.parse_object_name(false).map_err(parse_err)?;
    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if !parser.parse_keyword(Keyword::SET) {
        return Err(SqlError::Parse("expected SET".into()));
    }
    let assignments = parser.parse_comma_separated(Parser::parse_expr).map_err(parse_err)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(parse_err)?)
    } else {
        None
    };

    let mut set = Filters::default();
    for assignment in &assignments {
        set.collect(assignment)
            .map_err(|_| SqlError::Parse(format!("expected column = value, got {assignment}")))?;
    }
    let id = Filters::from_selection(selection.as_ref())?.ulid("id")?;

    match table.as_str() {
        "trainers" => Ok(Command::UpdateProfile {
            trainer_id: id,
            specialties: set.get("specialties").map(parse_opt_string).transpose()?.flatten(),
            bio: set.get("bio").map(parse_opt_string).transpose()?.flatten(),
            experience_years: set.get("experience_years").map(parse_u32).transpose()?,
        }),
        "commitments" => {
            let start = set.get("start_time").map(parse_stamp).transpose()?;
            let end = set.get("end_time").map(parse_stamp).transpose()?;
            let status = set
                .get("status")
                .map(|e| parse_string(e)?.parse().map_err(SqlError::Parse))
                .transpose()?;
            let feedback = set.get("feedback").map(parse_opt_string).transpose()?.flatten();
            match (start, end) {
                (None, None) => Ok(Command::SetCommitmentStatus { id, status, feedback }),
                _ if status.is_some() || feedback.is_some() => Err(SqlError::Unsupported(
                    "change times separately from status/feedback".into(),
                )),
                (Some(start), Some(end)) => Ok(Command::RescheduleCommitment { id, start, end }),
                (None, _) => Err(SqlError::MissingColumn("start_time")),
                (_, None) => Err(SqlError::MissingColumn("end_time")),
            }
        }
        "bookings" => {
            let patch = BookingPatch {
                trainer_id: set.get("trainer_id").map(parse_ulid).transpose()?,
                start: set.get("start_time").map(parse_stamp).transpose()?,
                end: set.get("end_time").map(parse_stamp).transpose()?,
                notes: set.get("notes").map(parse_opt_string).transpose()?.flatten(),
            };
            match set.get("status") {
                Some(expr) if patch == BookingPatch::default() => Ok(Command::TransitionBooking {
                    id,
                    status: parse_string(expr)?.parse().map_err(SqlError::Parse)?,
                }),
                Some(_) => Err(SqlError::Unsupported("change status on its own".into())),
                None => Ok(Command::UpdateBooking { id, patch }),
            }
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
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "available_trainers" => Ok(Command::SelectAvailableTrainers {
            date: parse_date(filters.require("date")?)?,
            start: parse_time(filters.require("start_time")?)?,
            end: parse_time(filters.require("end_time")?)?,
        }),
        "slot_check" => Ok(Command::SelectSlotCheck {
            trainer_id: filters.ulid("trainer_id")?,
            start: parse_stamp(filters.require("start_time")?)?,
            end: parse_stamp(filters.require("end_time")?)?,
            exclude: filters.get("exclude_id").map(parse_ulid).transpose()?,
        }),
        "open_slots" => Ok(Command::SelectOpenSlots {
            trainer_id: filters.ulid("trainer_id")?,
            date: parse_date(filters.require("date")?)?,
        }),
        "availability" | "weekly_schedule" => Ok(Command::SelectWindows {
            trainer_id: filters.ulid("trainer_id")?,
        }),
        "commitments" => Ok(Command::SelectCommitments {
            trainer_id: filters.ulid("trainer_id")?,
            from: filters.get("from_time").map(parse_stamp).transpose()?,
            to: filters.get("to_time").map(parse_stamp).transpose()?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            filter: BookingFilter {
                trainer_id: filters.get("trainer_id").map(parse_ulid).transpose()?,
                client_id: filters.get("client_id").map(parse_ulid).transpose()?,
                status: filters
                    .get("status")
                    .map(|e| parse_string(e)?.parse().map_err(SqlError::Parse))
                    .transpose()?,
                from_date: filters.get("from_date").map(parse_date).transpose()?,
                to_date: filters.get("to_date").map(parse_date).transpose()?,
            },
        }),
        "trainers" => Ok(Command::SelectTrainers {
            filter: TrainerFilter {
                specialty: filters.get("specialties").map(parse_string).transpose()?,
                username: filters.get("username").map(parse_string).transpose()?,
                experience_years: filters.get("experience_years").map(parse_u32).transpose()?,
            },
        }),
        "next_session" => Ok(Command::SelectNextSession {
            trainer_id: filters.get("trainer_id").map(parse_ulid).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs from a WHERE clause of ANDed equalities (or a SET list).
#[derive(Debug, Default)]
struct Filters {
    pairs: Vec<(String, Expr)>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                self.pairs.push((col, (**right).clone()));
                Ok(())
            }
            Expr::Nested(inner) => self.collect(inner),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.pairs.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require(col)?)
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn optional_column(values: &[Expr], idx: usize) -> Result<Option<String>, SqlError> {
    Ok(values.get(idx).map(parse_opt_string).transpose()?.flatten())
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_opt_string(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad count {s:?}: {e}"))),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

fn parse_day(expr: &Expr) -> Result<Weekday, SqlError> {
    parse_weekday(&parse_string(expr)?).map_err(SqlError::Parse)
}

const STAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

fn parse_stamp(expr: &Expr) -> Result<Stamp, SqlError> {
    let s = parse_string(expr)?;
    STAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s.trim(), f).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}, want YYYY-MM-DD HH:MM:SS")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(s.trim(), f).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, want HH:MM:SS")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?}, want YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing assignment: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
