use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources,
    InsertTemplate {
        id: Ulid,
        resource_id: Ulid,
        day_of_week: u8,
        open: TimeOfDay,
        close: TimeOfDay,
        slot_duration_minutes: u16,
        max_capacity: u32,
    },
    /// `INSERT INTO template_changes`: only the named columns change.
    UpdateTemplate {
        id: Ulid,
        patch: TemplatePatch,
    },
    DeleteTemplate {
        id: Ulid,
    },
    SelectTemplates {
        resource_id: Ulid,
    },
    GenerateSlots {
        resource_id: Ulid,
        date_from: NaiveDate,
        date_to: NaiveDate,
    },
    SelectSlots {
        resource_id: Ulid,
        date: NaiveDate,
    },
    SelectSlotDetail {
        resource_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
    },
    InsertCapacityChange {
        slot_id: Ulid,
        delta: i32,
    },
    InsertReservation {
        slot_id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        party_size: u32,
    },
    InsertRelease {
        slot_id: Ulid,
        party_size: u32,
    },
    InsertCapacityEvent {
        id: Ulid,
        slot_id: Ulid,
        delta: i32,
    },
    SelectDeadLetters,
    DeleteDeadLetter {
        id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, if `sql` is one. Works on unbound `$n`
/// placeholders, so it can describe prepared statements.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = parse_statements(sql).ok()?;
    match &stmts[0] {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the values are
/// taken positionally in the table's canonical order.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn from_insert(
        insert: &ast::Insert,
        table: &'static str,
        columns: &[&'static str],
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            if values.len() != columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns.iter().map(|c| c.to_string()).collect()
        } else {
            if values.len() != insert.columns.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if let Some(unknown) = names.iter().find(|n| !columns.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self {
            table,
            cells: names.into_iter().zip(values).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name"];
const TEMPLATE_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "day_of_week",
    "open_time",
    "close_time",
    "slot_duration",
    "max_capacity",
];
const GENERATION_COLUMNS: &[&str] = &["resource_id", "date_from", "date_to"];
const CAPACITY_CHANGE_COLUMNS: &[&str] = &["slot_id", "delta"];
const RESERVATION_COLUMNS: &[&str] = &["slot_id", "resource_id", "date", "party_size"];
const RELEASE_COLUMNS: &[&str] = &["slot_id", "party_size"];
const CAPACITY_EVENT_COLUMNS: &[&str] = &["id", "slot_id", "delta"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let row = Row::from_insert(insert, "resources", RESOURCE_COLUMNS)?;
            Ok(Command::InsertResource {
                id: parse_ulid(row.require("id")?)?,
                name: match row.get("name") {
                    Some(e) => parse_string_or_null(e)?,
                    None => None,
                },
            })
        }
        "templates" => {
            let row = Row::from_insert(insert, "templates", TEMPLATE_COLUMNS)?;
            Ok(Command::InsertTemplate {
                id: parse_ulid(row.require("id")?)?,
                resource_id: parse_ulid(row.require("resource_id")?)?,
                day_of_week: parse_u8(row.require("day_of_week")?)?,
                open: parse_time(row.require("open_time")?)?,
                close: parse_time(row.require("close_time")?)?,
                slot_duration_minutes: parse_u16(row.require("slot_duration")?)?,
                max_capacity: parse_u32(row.require("max_capacity")?)?,
            })
        }
        "template_changes" => {
            if insert.columns.is_empty() {
                return Err(SqlError::Parse(
                    "template_changes needs an explicit column list".into(),
                ));
            }
            let row = Row::from_insert(insert, "template_changes", TEMPLATE_COLUMNS)?;
            let patch = TemplatePatch {
                resource_id: row.get("resource_id").map(parse_ulid).transpose()?,
                day_of_week: row.get("day_of_week").map(parse_u8).transpose()?,
                open: row.get("open_time").map(parse_time).transpose()?,
                close: row.get("close_time").map(parse_time).transpose()?,
                slot_duration_minutes: row.get("slot_duration").map(parse_u16).transpose()?,
                max_capacity: row.get("max_capacity").map(parse_u32).transpose()?,
            };
            Ok(Command::UpdateTemplate {
                id: parse_ulid(row.require("id")?)?,
                patch,
            })
        }
        "slot_generations" => {
            let row = Row::from_insert(insert, "slot_generations", GENERATION_COLUMNS)?;
            Ok(Command::GenerateSlots {
                resource_id: parse_ulid(row.require("resource_id")?)?,
                date_from: parse_date_expr(row.require("date_from")?)?,
                date_to: parse_date_expr(row.require("date_to")?)?,
            })
        }
        "capacity_changes" => {
            let row = Row::from_insert(insert, "capacity_changes", CAPACITY_CHANGE_COLUMNS)?;
            Ok(Command::InsertCapacityChange {
                slot_id: parse_ulid(row.require("slot_id")?)?,
                delta: parse_i32(row.require("delta")?)?,
            })
        }
        "reservations" => {
            let row = Row::from_insert(insert, "reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                slot_id: parse_ulid(row.require("slot_id")?)?,
                resource_id: parse_ulid(row.require("resource_id")?)?,
                date: parse_date_expr(row.require("date")?)?,
                party_size: parse_u32(row.require("party_size")?)?,
            })
        }
        "releases" => {
            let row = Row::from_insert(insert, "releases", RELEASE_COLUMNS)?;
            Ok(Command::InsertRelease {
                slot_id: parse_ulid(row.require("slot_id")?)?,
                party_size: parse_u32(row.require("party_size")?)?,
            })
        }
        "capacity_events" => {
            let row = Row::from_insert(insert, "capacity_events", CAPACITY_EVENT_COLUMNS)?;
            Ok(Command::InsertCapacityEvent {
                id: parse_ulid(row.require("id")?)?,
                slot_id: parse_ulid(row.require("slot_id")?)?,
                delta: parse_i32(row.require("delta")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "templates" => Ok(Command::DeleteTemplate { id }),
        "dead_letters" => Ok(Command::DeleteDeadLetter { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |column: &'static str| {
        filters
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| e)
            .ok_or(SqlError::MissingFilter(column))
    };

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "templates" => Ok(Command::SelectTemplates {
            resource_id: parse_ulid(filter("resource_id")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            resource_id: parse_ulid(filter("resource_id")?)?,
            date: parse_date_expr(filter("date")?)?,
        }),
        "slot_details" => Ok(Command::SelectSlotDetail {
            resource_id: parse_ulid(filter("resource_id")?)?,
            slot_id: parse_ulid(filter("id")?)?,
            date: parse_date_expr(filter("date")?)?,
        }),
        "dead_letters" => Ok(Command::SelectDeadLetters),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Gather `column = value` terms joined by AND.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Invalid(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(|s| Some(s.to_string())),
    }
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_string(expr)?;
    TimeOfDay::parse(s).ok_or_else(|| SqlError::Invalid(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date(s).ok_or_else(|| SqlError::Invalid(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Invalid(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Invalid("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of u8 range")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of u16 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of u32 range")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of i32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    /// Well-formed statement carrying a value that cannot be used.
    Invalid(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Invalid(s) => write!(f, "invalid value: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const RID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn parse_insert_resource() {
        let sql = format!("INSERT INTO resources (id, name) VALUES ('{ID}', 'North course')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource {
                id: ulid(ID),
                name: Some("North course".into()),
            }
        );
    }

    #[test]
    fn parse_insert_resource_without_name() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{ID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource { id: ulid(ID), name: None }
        );
        let sql = format!("INSERT INTO resources VALUES ('{ID}', NULL)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource { id: ulid(ID), name: None }
        );
    }

    #[test]
    fn parse_delete_resource() {
        let sql = format!("DELETE FROM resources WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteResource { id: ulid(ID) });
    }

    #[test]
    fn parse_insert_template() {
        let sql = format!(
            "INSERT INTO templates (id, resource_id, day_of_week, open_time, close_time, slot_duration, max_capacity) \
             VALUES ('{ID}', '{RID}', 1, '09:00', '11:00', 30, 4)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertTemplate {
                id: ulid(ID),
                resource_id: ulid(RID),
                day_of_week: 1,
                open: TimeOfDay::parse("09:00").unwrap(),
                close: TimeOfDay::parse("11:00").unwrap(),
                slot_duration_minutes: 30,
                max_capacity: 4,
            }
        );
    }

    #[test]
    fn parse_insert_template_columns_in_any_order() {
        let sql = format!(
            "INSERT INTO templates (max_capacity, slot_duration, close_time, open_time, day_of_week, resource_id, id) \
             VALUES (4, 30, '11:00', '09:00', 1, '{RID}', '{ID}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertTemplate { id, max_capacity, open, .. } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(max_capacity, 4);
                assert_eq!(open.to_string(), "09:00");
            }
            cmd => panic!("expected InsertTemplate, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_template_bad_time_rejected() {
        let sql = format!(
            "INSERT INTO templates VALUES ('{ID}', '{RID}', 1, '9:00', '11:00', 30, 4)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Invalid(_))));

        let sql = format!(
            "INSERT INTO templates VALUES ('{ID}', '{RID}', 1, '09:00', '24:00', 30, 4)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Invalid(_))));
    }

    #[test]
    fn parse_template_negative_duration_rejected() {
        let sql = format!(
            "INSERT INTO templates VALUES ('{ID}', '{RID}', 1, '09:00', '11:00', -30, 4)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Invalid(_))));
    }

    #[test]
    fn parse_negated_minimum_integer_is_error() {
        let sql = format!(
            "INSERT INTO capacity_events (id, slot_id, delta) VALUES ('{ID}', '{RID}', - '-9223372036854775808')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Invalid(_))));
    }

    #[test]
    fn parse_template_missing_column() {
        let sql = format!(
            "INSERT INTO templates (id, resource_id, day_of_week, open_time, close_time, slot_duration) \
             VALUES ('{ID}', '{RID}', 1, '09:00', '11:00', 30)"
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("templates", "max_capacity"))
        ));
    }

    #[test]
    fn parse_template_change_only_named_columns() {
        let sql = format!(
            "INSERT INTO template_changes (id, close_time, max_capacity) VALUES ('{ID}', '12:00', 6)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateTemplate {
                id: ulid(ID),
                patch: TemplatePatch {
                    close: TimeOfDay::parse("12:00"),
                    max_capacity: Some(6),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn parse_template_change_requires_columns() {
        let sql = format!("INSERT INTO template_changes VALUES ('{ID}', '{RID}', 1, '09:00', '11:00', 30, 4)");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_unknown_column_rejected() {
        let sql = format!("INSERT INTO template_changes (id, colour) VALUES ('{ID}', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_, _))));
    }

    #[test]
    fn parse_slot_generation() {
        let sql = format!(
            "INSERT INTO slot_generations (resource_id, date_from, date_to) VALUES ('{RID}', '2025-01-06', '2025-01-12')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::GenerateSlots {
                resource_id: ulid(RID),
                date_from: day("2025-01-06"),
                date_to: day("2025-01-12"),
            }
        );
    }

    #[test]
    fn parse_bad_date_rejected() {
        let sql = format!(
            "INSERT INTO slot_generations (resource_id, date_from, date_to) VALUES ('{RID}', '2025-13-01', '2025-01-12')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Invalid(_))));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!("SELECT * FROM slots WHERE resource_id = '{RID}' AND \"date\" = '2025-01-06'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots {
                resource_id: ulid(RID),
                date: day("2025-01-06"),
            }
        );
    }

    #[test]
    fn parse_select_slots_missing_date() {
        let sql = format!("SELECT * FROM slots WHERE resource_id = '{RID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_select_slot_detail() {
        let sql = format!(
            "SELECT * FROM slot_details WHERE resource_id = '{RID}' AND id = '{ID}' AND \"date\" = '2025-01-06'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlotDetail {
                resource_id: ulid(RID),
                slot_id: ulid(ID),
                date: day("2025-01-06"),
            }
        );
    }

    #[test]
    fn parse_capacity_change_negative_delta() {
        let sql = format!("INSERT INTO capacity_changes (slot_id, delta) VALUES ('{ID}', -2)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCapacityChange {
                slot_id: ulid(ID),
                delta: -2,
            }
        );
        // Bound parameters arrive as quoted text.
        let sql = format!("INSERT INTO capacity_changes (slot_id, delta) VALUES ('{ID}', '-2')");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertCapacityChange { delta: -2, .. }
        ));
    }

    #[test]
    fn parse_reservation_and_release() {
        let sql = format!(
            "INSERT INTO reservations (slot_id, resource_id, \"date\", party_size) VALUES ('{ID}', '{RID}', '2025-01-06', 3)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertReservation {
                slot_id: ulid(ID),
                resource_id: ulid(RID),
                date: day("2025-01-06"),
                party_size: 3,
            }
        );
        let sql = format!("INSERT INTO releases (slot_id, party_size) VALUES ('{ID}', 2)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertRelease {
                slot_id: ulid(ID),
                party_size: 2,
            }
        );
    }

    #[test]
    fn parse_capacity_event() {
        let sql = format!("INSERT INTO capacity_events (id, slot_id, delta) VALUES ('{RID}', '{ID}', 1)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCapacityEvent {
                id: ulid(RID),
                slot_id: ulid(ID),
                delta: 1,
            }
        );
    }

    #[test]
    fn parse_dead_letter_commands() {
        assert_eq!(
            parse_sql("SELECT * FROM dead_letters").unwrap(),
            Command::SelectDeadLetters
        );
        let sql = format!("DELETE FROM dead_letters WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteDeadLetter { id: ulid(ID) });
    }

    #[test]
    fn parse_select_templates_requires_resource() {
        assert!(matches!(
            parse_sql("SELECT * FROM templates"),
            Err(SqlError::MissingFilter("resource_id"))
        ));
        let sql = format!("SELECT * FROM templates WHERE resource_id = '{RID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectTemplates { resource_id: ulid(RID) }
        );
    }

    #[test]
    fn parse_multi_row_values_rejected() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{ID}'), ('{RID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn select_table_reads_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM slots WHERE resource_id = $1 AND \"date\" = $2").as_deref(),
            Some("slots")
        );
        assert_eq!(select_table("INSERT INTO releases (slot_id, party_size) VALUES ($1, $2)"), None);
    }
}
