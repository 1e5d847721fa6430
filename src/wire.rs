use std::fmt::Debug;
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

use crate::auth::TeeSheetAuthSource;
use crate::consumer::CapacityEvent;
use crate::engine::{EngineError, ErrorKind};
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::{Tenant, TenantManager};

pub struct TeeSheetHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TeeSheetQueryParser>,
}

impl TeeSheetHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TeeSheetQueryParser),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    async fn execute_command(&self, tenant: &Tenant, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(tenant, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, tenant: &Tenant, cmd: Command) -> PgWireResult<Response> {
        let engine = &tenant.engine;
        match cmd {
            Command::InsertResource { id, name } => {
                engine.create_resource(id, name).await.map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(delete_tag(1))
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                Ok(rows(resources_schema(), &resources, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.name)
                }))
            }
            Command::InsertTemplate {
                id,
                resource_id,
                day_of_week,
                open,
                close,
                slot_duration_minutes,
                max_capacity,
            } => {
                engine
                    .create_template(
                        id,
                        resource_id,
                        day_of_week,
                        open,
                        close,
                        slot_duration_minutes,
                        max_capacity,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::UpdateTemplate { id, patch } => {
                engine.update_template(id, patch).await.map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::DeleteTemplate { id } => {
                engine.remove_template(id).await.map_err(engine_err)?;
                Ok(delete_tag(1))
            }
            Command::SelectTemplates { resource_id } => {
                let templates = engine.list_templates(resource_id).await.map_err(engine_err)?;
                Ok(rows(templates_schema(), &templates, |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.resource_id.to_string())?;
                    enc.encode_field(&i16::from(t.day_of_week))?;
                    enc.encode_field(&t.open.to_string())?;
                    enc.encode_field(&t.close.to_string())?;
                    enc.encode_field(&i32::from(t.slot_duration_minutes))?;
                    enc.encode_field(&i64::from(t.max_capacity))
                }))
            }
            Command::GenerateSlots {
                resource_id,
                date_from,
                date_to,
            } => {
                let created = engine
                    .generate_slots(resource_id, date_from, date_to)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag(created))
            }
            Command::SelectSlots { resource_id, date } => {
                let slots = engine.list_available(resource_id, date).map_err(engine_err)?;
                Ok(rows(slots_schema(), &slots, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.resource_id.to_string())?;
                    enc.encode_field(&s.date.format("%Y-%m-%d").to_string())?;
                    enc.encode_field(&s.start.to_string())?;
                    enc.encode_field(&s.end.to_string())?;
                    enc.encode_field(&i64::from(s.max_capacity))?;
                    enc.encode_field(&i64::from(s.booked_count))?;
                    enc.encode_field(&s.is_available())
                }))
            }
            Command::SelectSlotDetail {
                resource_id,
                slot_id,
                date,
            } => {
                let detail = engine
                    .resolve(resource_id, slot_id, date)
                    .map_err(engine_err)?;
                Ok(rows(slot_details_schema(), &[detail], |enc, d| {
                    enc.encode_field(&d.id.to_string())?;
                    enc.encode_field(&d.resource_id.to_string())?;
                    enc.encode_field(&d.date)?;
                    enc.encode_field(&d.start_time)?;
                    enc.encode_field(&d.end_time)?;
                    enc.encode_field(&i64::from(d.max_capacity))?;
                    enc.encode_field(&d.is_available)
                }))
            }
            Command::InsertCapacityChange { slot_id, delta } => {
                let applied = engine
                    .apply_capacity_change(slot_id, delta)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag(usize::from(applied.is_some())))
            }
            Command::InsertReservation {
                slot_id,
                resource_id,
                date,
                party_size,
            } => {
                engine
                    .reserve(resource_id, slot_id, date, party_size)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::InsertRelease { slot_id, party_size } => {
                let released = engine
                    .release(slot_id, party_size)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag(usize::from(released.is_some())))
            }
            Command::InsertCapacityEvent { id, slot_id, delta } => {
                tenant
                    .events
                    .submit(CapacityEvent { id, slot_id, delta })
                    .map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::SelectDeadLetters => {
                let letters = engine.list_dead_letters();
                Ok(rows(dead_letters_schema(), &letters, |enc, l| {
                    enc.encode_field(&l.event_id.to_string())?;
                    enc.encode_field(&l.slot_id.to_string())?;
                    enc.encode_field(&l.delta)?;
                    enc.encode_field(&l.reason)?;
                    enc.encode_field(&l.rejected_at)
                }))
            }
            Command::DeleteDeadLetter { id } => {
                engine.acknowledge_dead_letter(id).await.map_err(engine_err)?;
                Ok(delete_tag(1))
            }
        }
    }
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn delete_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

/// Encode `items` as a result set with one row per item.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR), field("name", Type::VARCHAR)]
}

fn templates_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("day_of_week", Type::INT2),
        field("open_time", Type::VARCHAR),
        field("close_time", Type::VARCHAR),
        field("slot_duration", Type::INT4),
        field("max_capacity", Type::INT8),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("max_capacity", Type::INT8),
        field("booked_count", Type::INT8),
        field("is_available", Type::BOOL),
    ]
}

fn slot_details_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("max_capacity", Type::INT8),
        field("is_available", Type::BOOL),
    ]
}

fn dead_letters_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("slot_id", Type::VARCHAR),
        field("delta", Type::INT4),
        field("reason", Type::VARCHAR),
        field("rejected_at", Type::INT8),
    ]
}

/// Columns a statement returns; empty for anything but a known SELECT.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("resources") => resources_schema(),
        Some("templates") => templates_schema(),
        Some("slots") => slots_schema(),
        Some("slot_details") => slot_details_schema(),
        Some("dead_letters") => dead_letters_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for TeeSheetHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(&tenant, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TeeSheetQueryParser;

#[async_trait]
impl QueryParser for TeeSheetQueryParser {
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
impl ExtendedQueryHandler for TeeSheetHandler {
    type Statement = String;
    type QueryParser = TeeSheetQueryParser;

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
        let tenant = self.resolve_tenant(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(&tenant, cmd).await
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
    let values: Vec<String> = portal
        .parameters
        .iter()
        .map(|param| match param {
            Some(bytes) => quote_literal(&String::from_utf8_lossy(bytes)),
            None => "NULL".to_string(),
        })
        .collect();
    bind_placeholders(&portal.statement.statement, &values)
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// One left-to-right pass over the statement text, so bound values are never
/// scanned for placeholders themselves. Unbound `$N` is left as written.
fn bind_placeholders(sql: &str, values: &[String]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let bound = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| values.get(idx));
        if let Some(value) = bound {
            out.push_str(&sql[copied..i]);
            out.push_str(value);
            copied = end;
        }
        i = end.max(i + 1);
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TeeSheetFactory {
    handler: Arc<TeeSheetHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TeeSheetAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TeeSheetFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = TeeSheetAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TeeSheetHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TeeSheetFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(TeeSheetFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "23505",
        ErrorKind::Validation => "22023",
        ErrorKind::CapacityViolation => "23514",
        ErrorKind::Busy => "55P03",
        ErrorKind::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Invalid(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM resources"), 0);
        assert_eq!(count_params("INSERT INTO releases (slot_id, party_size) VALUES ($1, $2)"), 2);
        assert_eq!(count_params("VALUES ($2, $10, $1)"), 10);
        assert_eq!(count_params("costs $ 5"), 0);
    }

    #[test]
    fn binds_double_digit_placeholders() {
        let values: Vec<String> = (1..=10).map(|i| quote_literal(&i.to_string())).collect();
        assert_eq!(bind_placeholders("$1 $10", &values), "'1' '10'");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let values = vec![quote_literal("01ARZ3NDEKTSV4RRFFQ69G5FAV"), quote_literal("x$1y")];
        assert_eq!(
            bind_placeholders("VALUES ($1, $2)", &values),
            "VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'x$1y')"
        );
    }

    #[test]
    fn unbound_placeholders_left_alone() {
        let values = vec![quote_literal("a")];
        assert_eq!(bind_placeholders("$1 $2 $0 $", &values), "'a' $2 $0 $");
    }

    #[test]
    fn value_errors_map_to_invalid_parameter() {
        let code = |e: SqlError| match sql_err(e) {
            PgWireError::UserError(info) => info.code.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(code(SqlError::Invalid("bad time".into())), "22023");
        assert_eq!(code(SqlError::Parse("oops".into())), "42601");
    }

    #[test]
    fn quotes_embedded_apostrophes() {
        assert_eq!(quote_literal("O'Hara"), "'O''Hara'");
    }

    #[test]
    fn error_kinds_map_to_sqlstate() {
        let id = Ulid::new();
        let code = |e: EngineError| sqlstate(e.kind());
        assert_eq!(code(EngineError::NotFound(id)), "P0002");
        assert_eq!(code(EngineError::IdentityChange(id)), "23505");
        assert_eq!(code(EngineError::Validation("x".into())), "22023");
        assert_eq!(
            code(EngineError::CapacityViolation {
                slot_id: id,
                booked: 1,
                delta: 1,
                max_capacity: 1,
            }),
            "23514"
        );
        assert_eq!(code(EngineError::Busy(id)), "55P03");
        assert_eq!(code(EngineError::WalError("disk".into())), "58030");
    }

    #[test]
    fn schema_follows_select_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM slot_details WHERE resource_id = $1 AND id = $2 AND \"date\" = $3"),
            ["id", "resource_id", "date", "start_time", "end_time", "max_capacity", "is_available"]
        );
        assert!(names("INSERT INTO capacity_events (id, slot_id, delta) VALUES ($1, $2, $3)").is_empty());
    }
}
