use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordAuth;
use crate::model::*;
use crate::notify::NotificationQueue;
use crate::observability;
use crate::service::{BookingError, BookingService};
use crate::sql::{self, Command, SqlError};
use crate::store::StoreError;
use crate::timestamp::format_instant;

pub struct InterlockHandler {
    service: Arc<BookingService>,
    notifications: Arc<NotificationQueue>,
    query_parser: Arc<InterlockQueryParser>,
}

impl InterlockHandler {
    pub fn new(service: Arc<BookingService>, notifications: Arc<NotificationQueue>) -> Self {
        Self {
            service,
            notifications,
            query_parser: Arc::new(InterlockQueryParser),
        }
    }

    async fn execute(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::RequestBooking(request) => {
                let booking = self
                    .service
                    .request_booking(request)
                    .await
                    .map_err(booking_err)?;
                match self.service.store().catalog().resource(&booking.resource_id) {
                    Some(resource) => self.notifications.enqueue(booking.clone(), resource),
                    None => tracing::warn!(
                        "booked {} on {} but the catalog no longer lists it",
                        booking.id,
                        booking.resource_id
                    ),
                }
                booking_rows(vec![booking])
            }
            Command::ListBookings { resource_id } => {
                let bookings = self
                    .service
                    .store()
                    .list_for_resource(&resource_id)
                    .await
                    .map_err(store_err)?;
                booking_rows(bookings)
            }
            Command::ListResources => {
                resource_rows(self.service.store().catalog().resources())
            }
            Command::CancelBooking { id } => {
                self.service
                    .store()
                    .cancel_booking(id)
                    .await
                    .map_err(store_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

fn booking_schema() -> Vec<FieldInfo> {
    let text = |name: &str| FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text);
    vec![
        text("id"),
        text("resource_id"),
        text("start"),
        text("end"),
        text("requester_name"),
        text("requester_contact"),
        text("requester_role"),
        text("reason"),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("category".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("capacity".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("requirements".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.resource_id.to_string())?;
            encoder.encode_field(&format_instant(b.span.start))?;
            encoder.encode_field(&format_instant(b.span.end))?;
            encoder.encode_field(&b.requester.name)?;
            encoder.encode_field(&b.requester.contact)?;
            encoder.encode_field(&b.requester.role.to_string())?;
            encoder.encode_field(&b.reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn resource_rows(resources: Vec<Resource>) -> PgWireResult<Response> {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.category.to_string())?;
            encoder.encode_field(&r.capacity.map(i64::from))?;
            encoder.encode_field(&r.requirements.join(", "))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Columns a statement returns, judged from its text so it works before
/// parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("RESOURCES") && upper.contains("SELECT") {
        resource_schema()
    } else if upper.contains("BOOKINGS") && (upper.contains("SELECT") || upper.contains("INSERT")) {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for InterlockHandler {
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
        Ok(vec![self.execute(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InterlockQueryParser;

#[async_trait]
impl QueryParser for InterlockQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InterlockHandler {
    type Statement = String;
    type QueryParser = InterlockQueryParser;

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
        self.execute(&sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    for_each_placeholder(sql, |_, n| max = max.max(n));
    max
}

/// Calls `f(byte_range, n)` for every `$n` outside a quoted literal.
fn for_each_placeholder(sql: &str, mut f: impl FnMut(std::ops::Range<usize>, usize)) {
    let bytes = sql.as_bytes();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    f(start..i, n);
                }
            }
            _ => i += 1,
        }
    }
}

/// Replace `$1`, `$2`, ... with the bound values as quoted literals (text
/// format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

/// One pass over `sql`: each placeholder is replaced once and bound text is
/// never rescanned.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for_each_placeholder(sql, |range, n| {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            return;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    });
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct InterlockFactory {
    handler: Arc<InterlockHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl InterlockFactory {
    pub fn new(
        service: Arc<BookingService>,
        notifications: Arc<NotificationQueue>,
        password: String,
    ) -> Self {
        let auth_source = SharedPasswordAuth::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InterlockHandler::new(service, notifications)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InterlockFactory {
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

/// Serve one client connection until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: InterlockFactory,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(|e| io::Error::other(e.to_string()))
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each booking outcome.
pub fn booking_sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::SlotOccupied { .. } => "23P01",
        BookingError::ResourceNotFound(_) => "23503",
        BookingError::InvalidInterval(_) => "22007",
        BookingError::Validation(_) => "23502",
        BookingError::LimitExceeded(_) => "54000",
        BookingError::Busy(_) => "55P03",
        BookingError::StoreUnavailable(_) => "58030",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    user_error(booking_sqlstate(&e), e.to_string())
}

fn store_err(e: StoreError) -> PgWireError {
    match e {
        StoreError::BookingNotFound(_) => user_error("P0002", e.to_string()),
        other => booking_err(BookingError::from(other)),
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
