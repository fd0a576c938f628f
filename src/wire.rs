use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::calendar;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowSet};

pub struct AllocdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<AllocdQueryParser>,
}

impl AllocdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(AllocdQueryParser),
        }
    }

    /// Parse and execute one statement, recording query metrics.
    async fn run_query(&self, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();

        let result = self.execute_command(cmd, format).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertEvent {
                title,
                description,
                start_date,
                end_date,
            } => {
                let event = engine
                    .create_event(&title, &description, start_date.as_deref(), end_date.as_deref())
                    .await
                    .map_err(engine_err)?;
                event_rows(vec![event], format)
            }
            Command::UpdateEvent { id, changes } => {
                let event = engine.patch_event(id, &changes).await.map_err(engine_err)?;
                event_rows(vec![event], format)
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertResource { name, kind } => {
                let resource = engine.create_resource(&name, &kind).await.map_err(engine_err)?;
                resource_rows(vec![resource], format)
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAllocation {
                event_id,
                resource_id,
            } => {
                let view = engine.allocate_view(event_id, resource_id).await.map_err(engine_err)?;
                allocation_rows(vec![view], format)
            }
            Command::DeleteAllocation { id } => {
                engine.delete_allocation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectEvents { id } => {
                let events = match id {
                    Some(id) => found(engine.get_event(id).await)?.into_iter().collect(),
                    None => engine.list_events().await,
                };
                event_rows(events, format)
            }
            Command::SelectResources { id } => {
                let resources = match id {
                    Some(id) => found(engine.get_resource(id).await)?.into_iter().collect(),
                    None => engine.list_resources().await,
                };
                resource_rows(resources, format)
            }
            Command::SelectAllocations { id, resource_id } => {
                let views = match (id, resource_id) {
                    (Some(id), _) => found(engine.get_allocation_view(id).await)?
                        .into_iter()
                        .filter(|v| resource_id.is_none_or(|rid| v.resource.id == rid))
                        .collect(),
                    (None, Some(rid)) => {
                        let allocs = found(engine.allocations_for_resource(rid).await)?.unwrap_or_default();
                        let mut views = Vec::with_capacity(allocs.len());
                        for alloc in allocs {
                            if let Some(view) = found(engine.get_allocation_view(alloc.id).await)? {
                                views.push(view);
                            }
                        }
                        views
                    }
                    (None, None) => engine.list_allocations().await,
                };
                allocation_rows(views, format)
            }
            Command::SelectUtilization {
                start_date,
                end_date,
                today,
            } => {
                let start = calendar::parse_date("start_date", Some(&start_date)).map_err(engine_err)?;
                let end = calendar::parse_date("end_date", Some(&end_date)).map_err(engine_err)?;
                let today = match today {
                    Some(today) => calendar::parse_date("today", Some(&today)).map_err(engine_err)?,
                    None => calendar::today(),
                };
                let rows = engine
                    .utilization_report_as_of(start, end, today)
                    .await
                    .map_err(engine_err)?;
                utilization_rows(rows, format)
            }
            Command::SelectConflict {
                resource_id,
                starts_at,
                ends_at,
            } => {
                let start = calendar::parse_datetime("starts_at", &starts_at).map_err(engine_err)?;
                let end = calendar::parse_datetime("ends_at", &ends_at).map_err(engine_err)?;
                let conflict = engine
                    .has_conflict(resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                encode_rows(RowSet::Conflict, format, vec![conflict], |enc, c| enc.encode_field(c))
            }
        }
    }
}

/// NotFound on a lookup by id is an empty result, not an error.
fn found<T>(result: Result<T, EngineError>) -> PgWireResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(EngineError::NotFound(_)) => Ok(None),
        Err(e) => Err(engine_err(e)),
    }
}

// ── Row sets ─────────────────────────────────────────────────────

fn columns(row_set: RowSet) -> &'static [(&'static str, Type)] {
    match row_set {
        RowSet::Events => &[
            ("id", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("starts_at", Type::VARCHAR),
            ("ends_at", Type::VARCHAR),
        ],
        RowSet::Resources => &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("type", Type::VARCHAR),
        ],
        RowSet::Allocations => &[
            ("id", Type::VARCHAR),
            ("event_id", Type::VARCHAR),
            ("event_title", Type::VARCHAR),
            ("starts_at", Type::VARCHAR),
            ("ends_at", Type::VARCHAR),
            ("resource_id", Type::VARCHAR),
            ("resource_name", Type::VARCHAR),
            ("resource_type", Type::VARCHAR),
        ],
        RowSet::Utilization => &[
            ("resource_id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("type", Type::VARCHAR),
            ("hours", Type::FLOAT8),
            ("bookings", Type::INT8),
            ("upcoming", Type::INT8),
        ],
        RowSet::Conflict => &[("conflict", Type::BOOL)],
    }
}

/// Field descriptions for a row set in the client's requested format.
fn schema(row_set: RowSet, format: &Format) -> Vec<FieldInfo> {
    columns(row_set)
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

fn encode_rows<T>(
    row_set: RowSet,
    format: &Format,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema(row_set, format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_event(enc: &mut DataRowEncoder, event: &EventInfo) -> PgWireResult<()> {
    enc.encode_field(&event.id.to_string())?;
    enc.encode_field(&event.title)?;
    enc.encode_field(&event.description)?;
    enc.encode_field(&calendar::format_datetime(event.start))?;
    enc.encode_field(&calendar::format_datetime(event.end))
}

fn event_rows(events: Vec<EventInfo>, format: &Format) -> PgWireResult<Response> {
    encode_rows(RowSet::Events, format, events, encode_event)
}

fn resource_rows(resources: Vec<ResourceInfo>, format: &Format) -> PgWireResult<Response> {
    encode_rows(RowSet::Resources, format, resources, |enc, r| {
        enc.encode_field(&r.id.to_string())?;
        enc.encode_field(&r.name)?;
        enc.encode_field(&r.kind)
    })
}

fn allocation_rows(views: Vec<AllocationView>, format: &Format) -> PgWireResult<Response> {
    encode_rows(RowSet::Allocations, format, views, |enc, v| {
        enc.encode_field(&v.id.to_string())?;
        enc.encode_field(&v.event.id.to_string())?;
        enc.encode_field(&v.event.title)?;
        enc.encode_field(&calendar::format_datetime(v.event.start))?;
        enc.encode_field(&calendar::format_datetime(v.event.end))?;
        enc.encode_field(&v.resource.id.to_string())?;
        enc.encode_field(&v.resource.name)?;
        enc.encode_field(&v.resource.kind)
    })
}

fn utilization_rows(rows: Vec<ResourceUtilization>, format: &Format) -> PgWireResult<Response> {
    encode_rows(RowSet::Utilization, format, rows, |enc, u| {
        enc.encode_field(&u.resource_id.to_string())?;
        enc.encode_field(&u.name)?;
        enc.encode_field(&u.kind)?;
        enc.encode_field(&u.hours)?;
        enc.encode_field(&i64::from(u.bookings))?;
        enc.encode_field(&i64::from(u.upcoming))
    })
}

fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::describe(sql)
        .map(|row_set| schema(row_set, format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for AllocdHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run_query(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllocdQueryParser;

#[async_trait]
impl QueryParser for AllocdQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AllocdHandler {
    type Statement = String;
    type QueryParser = AllocdQueryParser;

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
        let sql = substitute_params(portal);
        self.run_query(&sql, &portal.result_column_format).await
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
            describe_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
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
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|param| param.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &values)
}

/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute(sql: &str, values: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, value) in values.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let literal = match value {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &literal);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllocdFactory {
    handler: Arc<AllocdHandler>,
    noop: Arc<NoopHandler>,
}

impl AllocdFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(AllocdHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllocdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, None, AllocdFactory::new(engine)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "02000",
        EngineError::Conflict { .. } => "23P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM events"), 0);
        assert_eq!(count_params("INSERT INTO allocations VALUES ($1, $2)"), 2);
        assert_eq!(count_params("SELECT $10, $2"), 10);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let sql = "INSERT INTO events VALUES ($1, $2, $3, $4)";
        let values = [
            Some("Bob's party".to_string()),
            None,
            Some("2024-01-15".to_string()),
            Some("2024-01-15".to_string()),
        ];
        assert_eq!(
            substitute(sql, &values),
            "INSERT INTO events VALUES ('Bob''s party', NULL, '2024-01-15', '2024-01-15')"
        );
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_params() {
        let values: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(substitute("$1 $10", &values), "'1' '10'");
    }

    #[test]
    fn sqlstates() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "02000");
        assert_eq!(
            sqlstate(&EngineError::Conflict { event_id: id, allocation_id: id }),
            "23P01"
        );
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(sqlstate(&EngineError::WalError("x".into())), "58030");
    }

    #[test]
    fn schemas_follow_requested_format() {
        let text = schema(RowSet::Utilization, &Format::UnifiedText);
        assert_eq!(text.len(), 6);
        assert_eq!(text[3].name(), "hours");
        assert_eq!(*text[3].datatype(), Type::FLOAT8);

        assert!(describe_schema("DELETE FROM events WHERE id = $1", &Format::UnifiedText).is_empty());
        assert_eq!(
            describe_schema("SELECT * FROM allocations", &Format::UnifiedText).len(),
            8
        );
    }
}
