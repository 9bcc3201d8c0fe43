use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::ResourceId;
use crate::service::BookingRequest;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RequestBooking(BookingRequest),
    ListBookings { resource_id: ResourceId },
    ListResources,
    CancelBooking { id: Ulid },
}

/// Column order of a positional `INSERT INTO bookings VALUES (...)`.
pub const BOOKING_COLUMNS: [&str; 7] = [
    "resource_id",
    "start",
    "end",
    "requester_name",
    "requester_contact",
    "requester_role",
    "reason",
];

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("column given twice: {0}")]
    DuplicateColumn(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [Statement::Insert(insert)] => parse_insert(insert),
        [Statement::Delete(delete)] => parse_delete(delete),
        [Statement::Query(query)] => parse_select(query),
        [other] => Err(SqlError::Unsupported(format!("{other}"))),
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;

    let columns: Vec<&'static str> = if insert.columns.is_empty() {
        if values.len() > BOOKING_COLUMNS.len() {
            return Err(SqlError::WrongArity("bookings", BOOKING_COLUMNS.len(), values.len()));
        }
        BOOKING_COLUMNS[..values.len()].to_vec()
    } else {
        let named = insert
            .columns
            .iter()
            .map(|c| canonical_column(&c.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        if named.len() != values.len() {
            return Err(SqlError::WrongArity("bookings", named.len(), values.len()));
        }
        named
    };

    let mut request = BookingRequest::default();
    for (column, expr) in columns.into_iter().zip(&values) {
        let slot = match column {
            "resource_id" => &mut request.resource_id,
            "start" => &mut request.start,
            "end" => &mut request.end,
            "requester_name" => &mut request.requester_name,
            "requester_contact" => &mut request.requester_contact,
            "requester_role" => &mut request.requester_role,
            _ => &mut request.reason,
        };
        if slot.is_some() {
            return Err(SqlError::DuplicateColumn(column));
        }
        *slot = value_text(expr)?;
    }
    Ok(Command::RequestBooking(request))
}

/// Map a column name, including the web form's field names, to its
/// canonical booking column.
fn canonical_column(raw: &str) -> Result<&'static str, SqlError> {
    let last = raw.rsplit('.').next().unwrap_or(raw);
    let name = last.trim_matches('"').to_lowercase();
    let canonical = match name.as_str() {
        "resource_id" | "resource" => "resource_id",
        "start" | "start_time" => "start",
        "end" | "end_time" => "end",
        "requester_name" | "user_name" | "name" => "requester_name",
        "requester_contact" | "email" | "contact" => "requester_contact",
        "requester_role" | "user_role" | "role" => "requester_role",
        "reason" => "reason",
        _ => return Err(SqlError::UnknownColumn(name)),
    };
    Ok(canonical)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let raw = where_eq(delete.selection.as_ref(), "id")?;
    let id = Ulid::from_string(&raw).map_err(|e| SqlError::Parse(format!("bad booking id: {e}")))?;
    Ok(Command::CancelBooking { id })
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

    match table.as_str() {
        "resources" => Ok(Command::ListResources),
        "bookings" => {
            let resource_id = where_eq(select.selection.as_ref(), "resource_id")?;
            Ok(Command::ListBookings {
                resource_id: ResourceId::new(resource_id),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
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

/// The single VALUES row. One INSERT is one booking request.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Value of `column = '...'` in a WHERE clause, also found under AND.
fn where_eq(selection: Option<&Expr>, column: &'static str) -> Result<String, SqlError> {
    selection
        .and_then(|expr| find_eq(expr, column))
        .ok_or(SqlError::MissingFilter(column))?
        .and_then(|value| value.ok_or(SqlError::MissingFilter(column)))
}

fn find_eq(expr: &Expr, column: &str) -> Option<Result<Option<String>, SqlError>> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => find_eq(left, column).or_else(|| find_eq(right, column)),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Some(value_text(right)),
        Expr::Nested(inner) => find_eq(inner, column),
        _ => None,
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

/// A literal as text. `NULL` is `None`.
fn value_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })
            | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            _ => Err(SqlError::Parse(format!("expected literal, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(value_text(expr)?.map(|v| format!("-{v}")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}
