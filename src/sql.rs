use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

pub use crate::model::EventChanges;

/// Parsed command from SQL input.
///
/// Dates stay as text here; the engine owns their validation so a malformed
/// date surfaces as a validation error rather than a syntax error.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent {
        title: String,
        description: String,
        start_date: Option<String>,
        end_date: Option<String>,
    },
    UpdateEvent {
        id: Ulid,
        changes: EventChanges,
    },
    DeleteEvent {
        id: Ulid,
    },
    InsertResource {
        name: String,
        kind: String,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertAllocation {
        event_id: Ulid,
        resource_id: Ulid,
    },
    DeleteAllocation {
        id: Ulid,
    },
    SelectEvents {
        id: Option<Ulid>,
    },
    SelectResources {
        id: Option<Ulid>,
    },
    SelectAllocations {
        id: Option<Ulid>,
        resource_id: Option<Ulid>,
    },
    SelectUtilization {
        start_date: String,
        end_date: String,
        today: Option<String>,
    },
    SelectConflict {
        resource_id: Ulid,
        starts_at: String,
        ends_at: String,
    },
}

/// Shape of the rows a command returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSet {
    Events,
    Resources,
    Allocations,
    Utilization,
    Conflict,
}

impl Command {
    pub fn row_set(&self) -> Option<RowSet> {
        match self {
            Command::InsertEvent { .. } | Command::UpdateEvent { .. } | Command::SelectEvents { .. } => {
                Some(RowSet::Events)
            }
            Command::InsertResource { .. } | Command::SelectResources { .. } => Some(RowSet::Resources),
            Command::InsertAllocation { .. } | Command::SelectAllocations { .. } => {
                Some(RowSet::Allocations)
            }
            Command::SelectUtilization { .. } => Some(RowSet::Utilization),
            Command::SelectConflict { .. } => Some(RowSet::Conflict),
            Command::DeleteEvent { .. } | Command::DeleteResource { .. } | Command::DeleteAllocation { .. } => {
                None
            }
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table, &assignments, &selection),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape of a statement without binding its values, so prepared
/// statements with `$n` placeholders can be described before execution.
pub fn describe(sql: &str) -> Option<RowSet> {
    let table = match parse_statement(sql).ok()? {
        Statement::Insert(insert) => insert_table_name(&insert).ok()?,
        Statement::Update { .. } => return Some(RowSet::Events),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        _ => return None,
    };
    match table.as_str() {
        "events" => Some(RowSet::Events),
        "resources" => Some(RowSet::Resources),
        "allocations" => Some(RowSet::Allocations),
        "utilization" => Some(RowSet::Utilization),
        "conflicts" => Some(RowSet::Conflict),
        _ => None,
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    stmts.into_iter().next().ok_or(SqlError::Empty)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "events" => {
            let fields = bind_columns(
                "events",
                &columns,
                &values,
                &["title", "description", "start_date", "end_date"],
                4,
            )?;
            Ok(Command::InsertEvent {
                title: parse_text_or_empty(fields[0])?,
                description: parse_text_or_empty(fields[1])?,
                start_date: parse_text_opt(fields[2])?,
                end_date: parse_text_opt(fields[3])?,
            })
        }
        "resources" => {
            let fields = bind_columns("resources", &columns, &values, &["name", "type"], 1)?;
            Ok(Command::InsertResource {
                name: parse_text_or_empty(fields[0])?,
                kind: parse_text_or_empty(fields[1])?,
            })
        }
        "allocations" => {
            let fields = bind_columns(
                "allocations",
                &columns,
                &values,
                &["event_id", "resource_id"],
                2,
            )?;
            Ok(Command::InsertAllocation {
                event_id: required_ulid(fields[0], "event_id")?,
                resource_id: required_ulid(fields[1], "resource_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Line up VALUES with `expected` columns, by name when a column list is
/// given and by position otherwise. Missing trailing values are `None`.
fn bind_columns<'a>(
    table: &'static str,
    columns: &[String],
    values: &'a [Expr],
    expected: &[&str],
    min_positional: usize,
) -> Result<Vec<Option<&'a Expr>>, SqlError> {
    if columns.is_empty() {
        if values.len() < min_positional || values.len() > expected.len() {
            return Err(SqlError::WrongArity(table, expected.len(), values.len()));
        }
        return Ok((0..expected.len()).map(|i| values.get(i)).collect());
    }

    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !expected.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }
    Ok(expected
        .iter()
        .map(|name| columns.iter().position(|c| c == name).map(|i| &values[i]))
        .collect())
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "events" {
        return Err(SqlError::Unsupported(format!("UPDATE on {table}")));
    }
    let id = extract_where_id(selection)?;

    let mut changes = EventChanges::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = Some(parse_text_or_empty(Some(&assignment.value))?);
        match column.as_str() {
            "title" => changes.title = value,
            "description" => changes.description = value,
            "start_date" => changes.start_date = value,
            "end_date" => changes.end_date = value,
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    Ok(Command::UpdateEvent { id, changes })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "events" => Ok(Command::DeleteEvent { id }),
        "resources" => Ok(Command::DeleteResource { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    let command = match table.as_str() {
        "events" => Command::SelectEvents {
            id: filters.ulid("id")?,
        },
        "resources" => Command::SelectResources {
            id: filters.ulid("id")?,
        },
        "allocations" => Command::SelectAllocations {
            id: filters.ulid("id")?,
            resource_id: filters.ulid("resource_id")?,
        },
        "utilization" => Command::SelectUtilization {
            start_date: filters.text("start_date")?.ok_or(SqlError::MissingFilter("start_date"))?,
            end_date: filters.text("end_date")?.ok_or(SqlError::MissingFilter("end_date"))?,
            today: filters.text("today")?,
        },
        "conflicts" => Command::SelectConflict {
            resource_id: filters
                .ulid("resource_id")?
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            starts_at: filters.text("starts_at")?.ok_or(SqlError::MissingFilter("starts_at"))?,
            ends_at: filters.text("ends_at")?.ok_or(SqlError::MissingFilter("ends_at"))?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(command)
}

/// `column = value` pairs from a WHERE clause joined by AND.
#[derive(Default)]
struct Filters<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn take(&mut self, column: &str) -> Option<&'a Expr> {
        let pos = self.pairs.iter().position(|(c, _)| c == column)?;
        Some(self.pairs.remove(pos).1)
    }

    fn ulid(&mut self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.take(column).map(parse_ulid_expr).transpose()
    }

    fn text(&mut self, column: &str) -> Result<Option<String>, SqlError> {
        match self.take(column) {
            Some(expr) => parse_text_opt(Some(expr)),
            None => Ok(None),
        }
    }

    /// Reject filters on columns the table doesn't support.
    fn finish(self) -> Result<(), SqlError> {
        match self.pairs.into_iter().next() {
            Some((column, _)) => Err(SqlError::UnknownColumn(column)),
            None => Ok(()),
        }
    }
}

fn collect_filters<'a>(expr: &'a Expr, filters: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                filters.pairs.push((column, right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_filters(inner, filters),
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
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn required_ulid(expr: Option<&Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr.ok_or(SqlError::MissingFilter(column))?)
}

/// A text literal, `None` for NULL or a missing value.
fn parse_text_opt(expr: Option<&Expr>) -> Result<Option<String>, SqlError> {
    let Some(expr) = expr else { return Ok(None) };
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(Some(s.clone()))
        }
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// NULL and missing values become the empty string, which the engine then
/// rejects where a value is required.
fn parse_text_or_empty(expr: Option<&Expr>) -> Result<String, SqlError> {
    Ok(parse_text_opt(expr)?.unwrap_or_default())
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing value for {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
