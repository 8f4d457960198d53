use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use arrow::compute::{cast, concat_batches};
use arrow::ipc::writer::IpcWriteOptions;
use arrow_array::RecordBatch;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::sql::server::{FlightSqlService, PeekableFlightDataStream};
use arrow_flight::sql::{
    action_cancel_query_result::CancelStatus, ActionBeginSavepointRequest,
    ActionBeginSavepointResult, ActionBeginTransactionRequest, ActionBeginTransactionResult,
    ActionCancelQueryRequest, ActionCancelQueryResult, ActionClosePreparedStatementRequest,
    ActionCreatePreparedStatementRequest, ActionCreatePreparedStatementResult,
    ActionCreatePreparedSubstraitPlanRequest, ActionEndSavepointRequest,
    ActionEndTransactionRequest, Any, CommandGetCatalogs, CommandGetCrossReference,
    CommandGetDbSchemas, CommandGetExportedKeys, CommandGetImportedKeys, CommandGetPrimaryKeys,
    CommandGetSqlInfo, CommandGetTableTypes, CommandGetTables, CommandGetXdbcTypeInfo,
    CommandPreparedStatementQuery, CommandPreparedStatementUpdate, CommandStatementIngest,
    CommandStatementQuery, CommandStatementSubstraitPlan, CommandStatementUpdate,
    DoPutPreparedStatementResult, ProstMessageExt, SqlInfo, TicketStatementQuery,
};
use arrow_flight::{
    decode::FlightRecordBatchStream, flight_service_server::FlightService, Action,
    FlightDescriptor, FlightEndpoint, FlightInfo, HandshakeRequest, HandshakeResponse, IpcMessage,
    SchemaAsIpc, Ticket,
};
use arrow_schema::{Schema, SchemaRef};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures::{Stream, StreamExt, TryStreamExt};
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mallard::auth::token::{verify_password, TokenAuthority};
use mallard::auth::Authorizer;
use mallard::conf::{ServerConfigSettings, DEFAULT_SPLIT_SIZE};
use mallard::error::{Result as ServerResult, ServerError};
use mallard::execute::ast_utils::{first_statement, parse_sql};
use mallard::execute::engine::{cancellation_aware, probe_schema_on, EnginePool};
use mallard::execute::ingest::IngestSink;
use mallard::execute::registry::{HandleRegistry, PreparedStatementHandle, RunningQueryHandle};
use mallard::execute::split::plan_splits;
use mallard::model::identity::Identity;
use mallard::model::ticket::TicketPayload;

type DoGetStream = <FlightSqlServer as FlightService>::DoGetStream;
type HandshakeStream = Pin<Box<dyn Stream<Item = Result<HandshakeResponse, Status>> + Send>>;

const ENGINE_POOL_SIZE: u32 = 16;
const STREAM_CHANNEL_CAPACITY: usize = 8;

/// The flight sql request dispatcher. Ties headers to an identity, runs the
/// authorizer and split planner, executes on the engine pool and streams
/// record batches back, owning the handle registry throughout.
pub struct FlightSqlServer {
    engine: EnginePool,
    authorizer: Arc<Authorizer>,
    registry: Arc<HandleRegistry>,
    tokens: Arc<TokenAuthority>,
    /// username -> hex sha256 password digest
    users: HashMap<String, String>,
    ingest: Arc<IngestSink>,
    default_fetch_size: usize,
    default_database: String,
    default_schema: String,
}

/// What a do_get stream executes on: a fresh pooled connection, or the
/// pinned connection of a prepared statement.
enum ExecSource {
    Pool(String),
    Prepared(Arc<PreparedStatementHandle>),
}

impl FlightSqlServer {
    pub fn try_new(conf: &ServerConfigSettings) -> ServerResult<Self> {
        use mallard::auth::policy::{RemotePolicyStore, StaticPolicyStore};

        let engine = EnginePool::open_in_memory(ENGINE_POOL_SIZE)?;
        let static_store =
            StaticPolicyStore::new(conf.access_rules.clone(), conf.user_groups.clone());
        let remote_store = conf.resolve_url().map(RemotePolicyStore::new);
        let authorizer = Arc::new(Authorizer::new(
            conf.access_mode,
            static_store,
            remote_store,
        ));
        let users = conf
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();
        Ok(Self {
            engine,
            authorizer,
            registry: Arc::new(HandleRegistry::new()),
            tokens: Arc::new(TokenAuthority::new(&conf.jwt_secret_or_generated())),
            users,
            ingest: Arc::new(IngestSink::new(conf.warehouse_path.clone())),
            default_fetch_size: conf.default_fetch_size,
            default_database: conf.default_database.clone(),
            default_schema: conf.default_schema.clone(),
        })
    }

    fn authenticate(&self, metadata: &MetadataMap) -> Result<Identity, Status> {
        let header = metadata
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("authorization header is not valid ascii"))?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| Status::unauthenticated("expected a bearer token"))?;
        let claims = self.tokens.verify(token).map_err(Status::from)?;
        let mut identity = Identity::new(&claims.sub)
            .with_groups(self.authorizer.groups_for(&claims.sub))
            .with_claim("token", token);
        if let Some(token_type) = claims.token_type {
            identity = identity.with_claim("token_type", token_type);
        }
        Ok(identity)
    }

    fn default_database(&self, metadata: &MetadataMap) -> Result<String, Status> {
        Ok(string_header(metadata, "database")?.unwrap_or_else(|| self.default_database.clone()))
    }

    fn default_schema(&self, metadata: &MetadataMap) -> Result<String, Status> {
        Ok(string_header(metadata, "schema")?.unwrap_or_else(|| self.default_schema.clone()))
    }

    async fn authorize_sql(
        &self,
        identity: &Identity,
        metadata: &MetadataMap,
        sql: &str,
    ) -> Result<sqlparser::ast::Statement, Status> {
        let db = self.default_database(metadata)?;
        let schema = self.default_schema(metadata)?;
        let statement = first_statement(parse_sql(sql).map_err(Status::from)?)
            .map_err(Status::from)?;
        self.authorizer
            .authorize(identity, &db, &schema, statement)
            .await
            .map_err(Status::from)
    }

    async fn probe_schema(&self, sql: String) -> Result<SchemaRef, Status> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.probe_schema_or_empty(&sql))
            .await
            .map_err(|e| Status::internal(format!("schema probe task failed: {e}")))
    }

    fn flight_info(
        &self,
        schema: &Schema,
        descriptor: FlightDescriptor,
        payloads: Vec<TicketPayload>,
    ) -> Result<FlightInfo, Status> {
        let mut info = FlightInfo::new()
            .try_with_schema(schema)
            .map_err(|e| Status::internal(format!("failed to encode schema: {e}")))?
            .with_descriptor(descriptor);
        for payload in payloads {
            info = info.with_endpoint(FlightEndpoint::new().with_ticket(make_ticket(&payload)?));
        }
        Ok(info)
    }

    /// Shared path for statement-shaped requests: authorize, optionally
    /// split, probe the schema and answer with one endpoint per shard.
    async fn statement_flight_info(
        &self,
        sql: &str,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let identity = self.authenticate(request.metadata())?;
        info!("get_flight_info statement for user {}", identity.user);

        let authorized = self
            .authorize_sql(&identity, request.metadata(), sql)
            .await?;

        let parallelize = string_header(request.metadata(), "parallelize")?
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let split_size = positive_header(request.metadata(), "split-size")?
            .unwrap_or(DEFAULT_SPLIT_SIZE);
        let fetch_size = positive_header(request.metadata(), "fetch-size")?;

        let query_id = Uuid::new_v4();
        let payloads = if parallelize {
            match plan_splits(&authorized, split_size)
                .await
                .map_err(Status::from)?
            {
                Some(shards) => {
                    debug!("split planning produced {} shards", shards.len());
                    shards
                        .iter()
                        .map(|shard| TicketPayload::SplitShard {
                            query_id,
                            sql: shard.to_string(),
                            fetch_size,
                        })
                        .collect()
                }
                None => vec![TicketPayload::Statement {
                    query_id,
                    sql: authorized.to_string(),
                    fetch_size,
                }],
            }
        } else {
            vec![TicketPayload::Statement {
                query_id,
                sql: authorized.to_string(),
                fetch_size,
            }]
        };

        let schema = self.probe_schema(authorized.to_string()).await?;
        let info = self.flight_info(&schema, request.into_inner(), payloads)?;
        Ok(Response::new(info))
    }

    /// Runs a query on a blocking worker and bridges its batches into the
    /// flight stream. The registry entry is released on every exit path.
    async fn stream_query(
        &self,
        source: ExecSource,
        fetch_size: usize,
        target_schema: Option<SchemaRef>,
        handle: Arc<RunningQueryHandle>,
    ) -> Result<Response<DoGetStream>, Status> {
        let (schema_tx, schema_rx) = oneshot::channel::<SchemaRef>();
        let (tx, rx) = mpsc::channel::<ServerResult<RecordBatch>>(STREAM_CHANNEL_CAPACITY);

        let engine = self.engine.clone();
        let registry = Arc::clone(&self.registry);
        let worker_handle = Arc::clone(&handle);
        tokio::task::spawn_blocking(move || {
            let outcome = run_query_blocking(
                &engine,
                source,
                fetch_size,
                target_schema.as_ref(),
                &worker_handle,
                schema_tx,
                &tx,
            );
            if let Err(e) = outcome {
                let e = if worker_handle.is_cancelled() {
                    ServerError::Cancelled
                } else {
                    e
                };
                let _ = tx.blocking_send(Err(e));
            }
            registry.finish_stream(&worker_handle);
        });

        let schema = match schema_rx.await {
            Ok(schema) => schema,
            Err(_) => Arc::new(Schema::empty()),
        };
        let batches = ReceiverStream::new(rx)
            .map(|result| result.map_err(|e| FlightError::Tonic(Status::from(e))));
        let stream = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .build(batches)
            .map_err(flight_error_to_status);
        Ok(Response::new(Box::pin(stream) as DoGetStream))
    }

    /// Executes a server generated metadata query and streams the result.
    async fn metadata_stream(
        &self,
        sql: String,
        metadata: &MetadataMap,
    ) -> Result<Response<DoGetStream>, Status> {
        let identity = self.authenticate(metadata)?;
        let fetch_size =
            positive_header(metadata, "fetch-size")?.unwrap_or(self.default_fetch_size);
        let handle = self
            .registry
            .begin_stream(Uuid::new_v4(), &identity)
            .map_err(Status::from)?;
        self.stream_query(ExecSource::Pool(sql), fetch_size, None, handle)
            .await
    }

    async fn metadata_flight_info(
        &self,
        sql: String,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        self.authenticate(request.metadata())?;
        let fetch_size = positive_header(request.metadata(), "fetch-size")?;
        let schema = self.probe_schema(sql.clone()).await?;
        let payload = TicketPayload::Statement {
            query_id: Uuid::new_v4(),
            sql,
            fetch_size,
        };
        let info = self.flight_info(&schema, request.into_inner(), vec![payload])?;
        Ok(Response::new(info))
    }

    fn parse_prepared_handle(bytes: &[u8]) -> Result<Uuid, Status> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Status::invalid_argument("invalid prepared statement handle"))
    }
}

fn run_query_blocking(
    engine: &EnginePool,
    source: ExecSource,
    fetch_size: usize,
    target_schema: Option<&SchemaRef>,
    handle: &RunningQueryHandle,
    schema_tx: oneshot::Sender<SchemaRef>,
    tx: &mpsc::Sender<ServerResult<RecordBatch>>,
) -> ServerResult<()> {
    match source {
        ExecSource::Pool(sql) => {
            let conn = engine.get()?;
            handle.attach_interrupt(conn.interrupt_handle())?;
            pump_batches(&conn, &sql, fetch_size, target_schema, handle, schema_tx, tx)
        }
        ExecSource::Prepared(prepared) => {
            let conn = prepared
                .conn
                .lock()
                .expect("prepared connection lock poisoned");
            handle.attach_interrupt(conn.interrupt_handle())?;
            pump_batches(
                &conn,
                &prepared.sql,
                fetch_size,
                target_schema,
                handle,
                schema_tx,
                tx,
            )
        }
    }
}

fn pump_batches(
    conn: &duckdb::Connection,
    sql: &str,
    fetch_size: usize,
    target_schema: Option<&SchemaRef>,
    handle: &RunningQueryHandle,
    schema_tx: oneshot::Sender<SchemaRef>,
    tx: &mpsc::Sender<ServerResult<RecordBatch>>,
) -> ServerResult<()> {
    let schema = probe_schema_on(conn, sql)?;
    let reported = target_schema
        .filter(|t| coercible(t, &schema))
        .cloned()
        .unwrap_or_else(|| schema.clone());
    let _ = schema_tx.send(reported);

    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .stream_arrow([], schema.clone())
        .map_err(|e| cancellation_aware(e, handle.is_cancelled()))?;
    let mut chunker = BatchChunker::new(schema, fetch_size);
    for batch in rows {
        if handle.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        for chunk in chunker.push(batch)? {
            let chunk = apply_target_schema(chunk, target_schema)?;
            if tx.blocking_send(Ok(chunk)).is_err() {
                // receiver dropped, the client went away
                return Ok(());
            }
        }
    }
    if handle.is_cancelled() {
        return Err(ServerError::Cancelled);
    }
    if let Some(chunk) = chunker.finish()? {
        let chunk = apply_target_schema(chunk, target_schema)?;
        let _ = tx.blocking_send(Ok(chunk));
    }
    Ok(())
}

/// Re-slices the engine's batches into chunks of exactly `fetch_size` rows.
/// Engine vector sizes are unrelated to the fetch size, so leftover rows are
/// carried over to the next engine batch; only the final chunk of a stream
/// may be short.
struct BatchChunker {
    schema: SchemaRef,
    fetch_size: usize,
    pending: VecDeque<RecordBatch>,
    pending_rows: usize,
}

impl BatchChunker {
    fn new(schema: SchemaRef, fetch_size: usize) -> Self {
        Self {
            schema,
            fetch_size: fetch_size.max(1),
            pending: VecDeque::new(),
            pending_rows: 0,
        }
    }

    /// Buffers `batch` and returns every full chunk now available.
    fn push(&mut self, batch: RecordBatch) -> ServerResult<Vec<RecordBatch>> {
        if batch.num_rows() == 0 {
            return Ok(vec![]);
        }
        self.pending_rows += batch.num_rows();
        self.pending.push_back(batch);
        let mut chunks = vec![];
        while self.pending_rows >= self.fetch_size {
            chunks.push(self.take(self.fetch_size)?);
        }
        Ok(chunks)
    }

    /// Drains the remainder at stream end, short by construction.
    fn finish(&mut self) -> ServerResult<Option<RecordBatch>> {
        if self.pending_rows == 0 {
            return Ok(None);
        }
        let rows = self.pending_rows;
        Ok(Some(self.take(rows)?))
    }

    fn take(&mut self, rows: usize) -> ServerResult<RecordBatch> {
        let mut parts = vec![];
        let mut needed = rows;
        while needed > 0 {
            let batch = self
                .pending
                .pop_front()
                .expect("pending_rows tracks buffered rows");
            if batch.num_rows() <= needed {
                needed -= batch.num_rows();
                parts.push(batch);
            } else {
                parts.push(batch.slice(0, needed));
                self.pending
                    .push_front(batch.slice(needed, batch.num_rows() - needed));
                needed = 0;
            }
        }
        self.pending_rows -= rows;
        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(concat_batches(&self.schema, &parts)?)
        }
    }
}

fn coercible(target: &Schema, actual: &Schema) -> bool {
    target.fields().len() == 1 && actual.fields().len() == 1
}

/// Casts single column batches to the client requested `data-schema`, used
/// for simple type coercion of scalar results.
fn apply_target_schema(
    batch: RecordBatch,
    target: Option<&SchemaRef>,
) -> ServerResult<RecordBatch> {
    let Some(target) = target else {
        return Ok(batch);
    };
    if !coercible(target, &batch.schema()) {
        return Ok(batch);
    }
    let column = cast(batch.column(0), target.field(0).data_type())?;
    Ok(RecordBatch::try_new(Arc::clone(target), vec![column])?)
}

fn string_header(metadata: &MetadataMap, name: &str) -> Result<Option<String>, Status> {
    match metadata.get(name) {
        Some(value) => value
            .to_str()
            .map(|s| Some(s.to_string()))
            .map_err(|_| Status::invalid_argument(format!("header {name} is not valid ascii"))),
        None => Ok(None),
    }
}

fn positive_header(metadata: &MetadataMap, name: &str) -> Result<Option<usize>, Status> {
    match string_header(metadata, name)? {
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(Status::invalid_argument(format!(
                "header {name} must be a positive integer, got {raw}"
            ))),
        },
        None => Ok(None),
    }
}

/// The urlencoded `data-schema` header, deserialized as a json arrow schema.
fn data_schema_header(metadata: &MetadataMap) -> Result<Option<SchemaRef>, Status> {
    let Some(raw) = string_header(metadata, "data-schema")? else {
        return Ok(None);
    };
    let decoded = urlencoding::decode(&raw)
        .map_err(|e| Status::invalid_argument(format!("data-schema is not valid urlencoding: {e}")))?;
    let schema: Schema = serde_json::from_str(&decoded)
        .map_err(|e| Status::invalid_argument(format!("data-schema is not a valid schema: {e}")))?;
    Ok(Some(Arc::new(schema)))
}

fn make_ticket(payload: &TicketPayload) -> Result<Ticket, Status> {
    let bytes = payload.encode().map_err(Status::from)?;
    let statement_ticket = TicketStatementQuery {
        statement_handle: bytes.into(),
    };
    Ok(Ticket {
        ticket: statement_ticket.as_any().encode_to_vec().into(),
    })
}

fn flight_error_to_status(e: FlightError) -> Status {
    match e {
        FlightError::Tonic(status) => status,
        other => Status::internal(other.to_string()),
    }
}

fn ipc_schema_bytes(schema: &Schema) -> Result<bytes::Bytes, Status> {
    let message: IpcMessage = SchemaAsIpc::new(schema, &IpcWriteOptions::default())
        .try_into()
        .map_err(|e| Status::internal(format!("failed to encode schema: {e}")))?;
    let IpcMessage(bytes) = message;
    Ok(bytes)
}

fn sql_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn catalogs_sql() -> String {
    "SELECT DISTINCT database_name AS catalog_name FROM duckdb_databases() ORDER BY catalog_name"
        .to_string()
}

fn schemas_sql(query: &CommandGetDbSchemas) -> String {
    let mut sql = "SELECT database_name AS catalog_name, schema_name AS db_schema_name \
                   FROM duckdb_schemas()"
        .to_string();
    let mut predicates = vec![];
    if let Some(catalog) = &query.catalog {
        predicates.push(format!("database_name = {}", sql_string_literal(catalog)));
    }
    if let Some(pattern) = &query.db_schema_filter_pattern {
        predicates.push(format!("schema_name LIKE {}", sql_string_literal(pattern)));
    }
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql.push_str(" ORDER BY catalog_name, db_schema_name");
    sql
}

fn tables_sql(query: &CommandGetTables) -> String {
    let mut sql = "SELECT database_name AS catalog_name, schema_name AS db_schema_name, \
                   table_name, 'BASE TABLE' AS table_type FROM duckdb_tables()"
        .to_string();
    let mut predicates = vec![];
    if let Some(catalog) = &query.catalog {
        predicates.push(format!("database_name = {}", sql_string_literal(catalog)));
    }
    if let Some(pattern) = &query.db_schema_filter_pattern {
        predicates.push(format!("schema_name LIKE {}", sql_string_literal(pattern)));
    }
    if let Some(pattern) = &query.table_name_filter_pattern {
        predicates.push(format!("table_name LIKE {}", sql_string_literal(pattern)));
    }
    if !query.table_types.is_empty() && !query.table_types.iter().any(|t| t == "BASE TABLE") {
        // only base tables exist in the embedded engine
        predicates.push("1 = 0".to_string());
    }
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql.push_str(" ORDER BY catalog_name, db_schema_name, table_name");
    sql
}

#[tonic::async_trait]
impl FlightSqlService for FlightSqlServer {
    type FlightService = FlightSqlServer;

    /// Exchanges basic credentials for a bearer token minted by the server.
    async fn do_handshake(
        &self,
        request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<HandshakeStream>, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("authorization header is not valid ascii"))?;
        let encoded = header
            .strip_prefix("Basic ")
            .ok_or_else(|| Status::unauthenticated("expected basic credentials"))?;
        let decoded = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| Status::unauthenticated("invalid base64 credentials"))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| Status::unauthenticated("credentials are not valid utf-8"))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| Status::unauthenticated("expected user:password credentials"))?;

        let stored = self
            .users
            .get(user)
            .ok_or_else(|| Status::unauthenticated("unknown user or bad password"))?;
        if !verify_password(password, stored) {
            return Err(Status::unauthenticated("unknown user or bad password"));
        }

        let token = self.tokens.mint(user).map_err(Status::from)?;
        info!("issued bearer token to {user}");

        let response = HandshakeResponse {
            protocol_version: 0,
            payload: token.clone().into_bytes().into(),
        };
        let stream = futures::stream::iter(vec![Ok::<HandshakeResponse, Status>(response)]);
        let mut response = Response::new(Box::pin(stream) as HandshakeStream);
        let header_value = format!("Bearer {token}")
            .parse()
            .map_err(|_| Status::internal("failed to build authorization header"))?;
        response.metadata_mut().insert("authorization", header_value);
        Ok(response)
    }

    async fn get_flight_info_statement(
        &self,
        query: CommandStatementQuery,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        self.statement_flight_info(&query.query, request).await
    }

    async fn get_flight_info_substrait_plan(
        &self,
        _query: CommandStatementSubstraitPlan,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("substrait plans are not supported"))
    }

    async fn get_flight_info_prepared_statement(
        &self,
        cmd: CommandPreparedStatementQuery,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let identity = self.authenticate(request.metadata())?;
        let handle_id = Self::parse_prepared_handle(&cmd.prepared_statement_handle)?;
        let prepared = self
            .registry
            .get_prepared(handle_id, &identity)
            .map_err(Status::from)?;
        let fetch_size = positive_header(request.metadata(), "fetch-size")?;
        let payload = TicketPayload::Prepared {
            query_id: Uuid::new_v4(),
            handle: handle_id,
            fetch_size,
        };
        let info = self.flight_info(&prepared.schema, request.into_inner(), vec![payload])?;
        Ok(Response::new(info))
    }

    async fn get_flight_info_catalogs(
        &self,
        _query: CommandGetCatalogs,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        self.metadata_flight_info(catalogs_sql(), request).await
    }

    async fn get_flight_info_schemas(
        &self,
        query: CommandGetDbSchemas,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        self.metadata_flight_info(schemas_sql(&query), request).await
    }

    async fn get_flight_info_tables(
        &self,
        query: CommandGetTables,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        self.metadata_flight_info(tables_sql(&query), request).await
    }

    async fn get_flight_info_table_types(
        &self,
        _query: CommandGetTableTypes,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("table types are not supported"))
    }

    async fn get_flight_info_sql_info(
        &self,
        _query: CommandGetSqlInfo,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("sql info is not supported"))
    }

    async fn get_flight_info_primary_keys(
        &self,
        _query: CommandGetPrimaryKeys,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("primary keys are not supported"))
    }

    async fn get_flight_info_exported_keys(
        &self,
        _query: CommandGetExportedKeys,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("exported keys are not supported"))
    }

    async fn get_flight_info_imported_keys(
        &self,
        _query: CommandGetImportedKeys,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("imported keys are not supported"))
    }

    async fn get_flight_info_cross_reference(
        &self,
        _query: CommandGetCrossReference,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("cross references are not supported"))
    }

    async fn get_flight_info_xdbc_type_info(
        &self,
        _query: CommandGetXdbcTypeInfo,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("xdbc type info is not supported"))
    }

    /// Executes the sql carried by a ticket. All tickets issued by this
    /// server decode to a [TicketPayload]; prepared tickets are routed to
    /// their pinned engine connection.
    async fn do_get_statement(
        &self,
        ticket: TicketStatementQuery,
        request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        let identity = self.authenticate(request.metadata())?;
        let payload =
            TicketPayload::decode(&ticket.statement_handle).map_err(Status::from)?;
        let fetch_size = positive_header(request.metadata(), "fetch-size")?
            .or(payload.fetch_size())
            .unwrap_or(self.default_fetch_size);
        let target_schema = data_schema_header(request.metadata())?;

        let handle = self
            .registry
            .begin_stream(payload.query_id(), &identity)
            .map_err(Status::from)?;

        let source = match &payload {
            TicketPayload::Statement { sql, .. } | TicketPayload::SplitShard { sql, .. } => {
                debug!("do_get executing: {sql}");
                ExecSource::Pool(sql.clone())
            }
            TicketPayload::Prepared { handle: id, .. } => {
                let prepared = match self.registry.get_prepared(*id, &identity) {
                    Ok(prepared) => prepared,
                    Err(e) => {
                        self.registry.finish_stream(&handle);
                        return Err(e.into());
                    }
                };
                debug!("do_get executing prepared statement {id}");
                ExecSource::Prepared(prepared)
            }
        };
        self.stream_query(source, fetch_size, target_schema, handle)
            .await
    }

    async fn do_get_prepared_statement(
        &self,
        query: CommandPreparedStatementQuery,
        request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        let identity = self.authenticate(request.metadata())?;
        let handle_id = Self::parse_prepared_handle(&query.prepared_statement_handle)?;
        let prepared = self
            .registry
            .get_prepared(handle_id, &identity)
            .map_err(Status::from)?;
        let fetch_size =
            positive_header(request.metadata(), "fetch-size")?.unwrap_or(self.default_fetch_size);
        let handle = self
            .registry
            .begin_stream(Uuid::new_v4(), &identity)
            .map_err(Status::from)?;
        self.stream_query(ExecSource::Prepared(prepared), fetch_size, None, handle)
            .await
    }

    async fn do_get_catalogs(
        &self,
        _query: CommandGetCatalogs,
        request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        self.metadata_stream(catalogs_sql(), request.metadata()).await
    }

    async fn do_get_schemas(
        &self,
        query: CommandGetDbSchemas,
        request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        self.metadata_stream(schemas_sql(&query), request.metadata())
            .await
    }

    async fn do_get_tables(
        &self,
        query: CommandGetTables,
        request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        self.metadata_stream(tables_sql(&query), request.metadata())
            .await
    }

    async fn do_get_table_types(
        &self,
        _query: CommandGetTableTypes,
        _request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        Err(Status::unimplemented("table types are not supported"))
    }

    async fn do_get_sql_info(
        &self,
        _query: CommandGetSqlInfo,
        _request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        Err(Status::unimplemented("sql info is not supported"))
    }

    async fn do_get_primary_keys(
        &self,
        _query: CommandGetPrimaryKeys,
        _request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        Err(Status::unimplemented("primary keys are not supported"))
    }

    async fn do_get_exported_keys(
        &self,
        _query: CommandGetExportedKeys,
        _request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        Err(Status::unimplemented("exported keys are not supported"))
    }

    async fn do_get_imported_keys(
        &self,
        _query: CommandGetImportedKeys,
        _request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        Err(Status::unimplemented("imported keys are not supported"))
    }

    async fn do_get_cross_reference(
        &self,
        _query: CommandGetCrossReference,
        _request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        Err(Status::unimplemented("cross references are not supported"))
    }

    async fn do_get_xdbc_type_info(
        &self,
        _query: CommandGetXdbcTypeInfo,
        _request: Request<Ticket>,
    ) -> Result<Response<DoGetStream>, Status> {
        Err(Status::unimplemented("xdbc type info is not supported"))
    }

    async fn do_put_statement_update(
        &self,
        _ticket: CommandStatementUpdate,
        _request: Request<PeekableFlightDataStream>,
    ) -> Result<i64, Status> {
        Err(Status::unimplemented(
            "statement updates are not supported, use ingest",
        ))
    }

    /// Writes the incoming record batch stream as a parquet file under the
    /// warehouse root. A path that was already written to fails with an
    /// already-exists status and the prior file is left intact.
    async fn do_put_statement_ingest(
        &self,
        ticket: CommandStatementIngest,
        request: Request<PeekableFlightDataStream>,
    ) -> Result<i64, Status> {
        let identity = self.authenticate(request.metadata())?;
        let path = ticket
            .options
            .get("path")
            .cloned()
            .unwrap_or_else(|| ticket.table.clone());
        if path.is_empty() {
            return Err(Status::invalid_argument("ingest requires a target path"));
        }
        info!("ingest from {} into {path}", identity.user);

        let flight_stream = request.into_inner().map_err(FlightError::from);
        let batches = FlightRecordBatchStream::new_from_flight_data(flight_stream)
            .map(|result| result.map_err(|e| ServerError::Internal(e.to_string())));
        let rows = self
            .ingest
            .write_stream(&path, batches)
            .await
            .map_err(Status::from)?;
        Ok(rows)
    }

    async fn do_put_substrait_plan(
        &self,
        _ticket: CommandStatementSubstraitPlan,
        _request: Request<PeekableFlightDataStream>,
    ) -> Result<i64, Status> {
        Err(Status::unimplemented("substrait plans are not supported"))
    }

    async fn do_put_prepared_statement_query(
        &self,
        _query: CommandPreparedStatementQuery,
        _request: Request<PeekableFlightDataStream>,
    ) -> Result<DoPutPreparedStatementResult, Status> {
        Err(Status::unimplemented(
            "prepared statement parameters are not supported",
        ))
    }

    async fn do_put_prepared_statement_update(
        &self,
        _query: CommandPreparedStatementUpdate,
        _request: Request<PeekableFlightDataStream>,
    ) -> Result<i64, Status> {
        Err(Status::unimplemented(
            "prepared statement updates are not supported",
        ))
    }

    /// Authorizes the statement once, pins an engine connection and stores
    /// the rewritten sql under a fresh handle.
    async fn do_action_create_prepared_statement(
        &self,
        query: ActionCreatePreparedStatementRequest,
        request: Request<Action>,
    ) -> Result<ActionCreatePreparedStatementResult, Status> {
        let identity = self.authenticate(request.metadata())?;
        let authorized = self
            .authorize_sql(&identity, request.metadata(), &query.query)
            .await?;
        let sql = authorized.to_string();

        let engine = self.engine.clone();
        let probe_sql = sql.clone();
        let (conn, schema) = tokio::task::spawn_blocking(move || -> ServerResult<_> {
            let conn = engine.get()?;
            let schema = match probe_schema_on(&conn, &probe_sql) {
                Ok(schema) => schema,
                Err(e) => {
                    warn!("deferring binding failure to fetch time: {e}");
                    Arc::new(Schema::empty())
                }
            };
            Ok((conn, schema))
        })
        .await
        .map_err(|e| Status::internal(format!("prepare task failed: {e}")))?
        .map_err(Status::from)?;

        let id = self
            .registry
            .insert_prepared(sql, &identity, schema.clone(), conn);
        info!("created prepared statement {id} for {}", identity.user);

        Ok(ActionCreatePreparedStatementResult {
            prepared_statement_handle: id.to_string().into_bytes().into(),
            dataset_schema: ipc_schema_bytes(&schema)?,
            ..Default::default()
        })
    }

    async fn do_action_close_prepared_statement(
        &self,
        query: ActionClosePreparedStatementRequest,
        request: Request<Action>,
    ) -> Result<(), Status> {
        let identity = self.authenticate(request.metadata())?;
        let handle_id = Self::parse_prepared_handle(&query.prepared_statement_handle)?;
        // ownership check before disposal
        self.registry
            .get_prepared(handle_id, &identity)
            .map_err(Status::from)?;
        self.registry.remove(handle_id);
        Ok(())
    }

    async fn do_action_create_prepared_substrait_plan(
        &self,
        _query: ActionCreatePreparedSubstraitPlanRequest,
        _request: Request<Action>,
    ) -> Result<ActionCreatePreparedStatementResult, Status> {
        Err(Status::unimplemented("substrait plans are not supported"))
    }

    async fn do_action_begin_transaction(
        &self,
        _query: ActionBeginTransactionRequest,
        _request: Request<Action>,
    ) -> Result<ActionBeginTransactionResult, Status> {
        Err(Status::unimplemented("transactions are not supported"))
    }

    async fn do_action_end_transaction(
        &self,
        _query: ActionEndTransactionRequest,
        _request: Request<Action>,
    ) -> Result<(), Status> {
        Err(Status::unimplemented("transactions are not supported"))
    }

    async fn do_action_begin_savepoint(
        &self,
        _query: ActionBeginSavepointRequest,
        _request: Request<Action>,
    ) -> Result<ActionBeginSavepointResult, Status> {
        Err(Status::unimplemented("savepoints are not supported"))
    }

    async fn do_action_end_savepoint(
        &self,
        _query: ActionEndSavepointRequest,
        _request: Request<Action>,
    ) -> Result<(), Status> {
        Err(Status::unimplemented("savepoints are not supported"))
    }

    /// Cancels the running query referenced by the tickets of a FlightInfo.
    /// Non-blocking: the engine statement is signalled and streams observe
    /// the cancellation within one batch boundary.
    async fn do_action_cancel_query(
        &self,
        query: ActionCancelQueryRequest,
        request: Request<Action>,
    ) -> Result<ActionCancelQueryResult, Status> {
        let identity = self.authenticate(request.metadata())?;
        let info = FlightInfo::decode(query.info)
            .map_err(|e| Status::invalid_argument(format!("invalid flight info: {e}")))?;

        let mut cancelled_any = false;
        for endpoint in &info.endpoint {
            let Some(ticket) = &endpoint.ticket else {
                continue;
            };
            let Ok(any) = Any::decode(&*ticket.ticket) else {
                continue;
            };
            let Ok(Some(statement_ticket)) = any.unpack::<TicketStatementQuery>() else {
                continue;
            };
            let Ok(payload) = TicketPayload::decode(&statement_ticket.statement_handle) else {
                continue;
            };
            self.registry
                .cancel(payload.query_id(), &identity)
                .map_err(Status::from)?;
            cancelled_any = true;
        }

        let status = if cancelled_any {
            info!("cancelled query for {}", identity.user);
            CancelStatus::Cancelled
        } else {
            CancelStatus::NotCancellable
        };
        Ok(ActionCancelQueryResult {
            status: status.into(),
        })
    }

    async fn register_sql_info(&self, _id: i32, _result: &SqlInfo) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Int64Array;
    use arrow_schema::{DataType, Field};

    fn batch(n: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let values: Vec<i64> = (0..n as i64).collect();
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn chunker_obeys_fetch_size() {
        let mut chunker = BatchChunker::new(batch(0).schema(), 10);
        let chunks = chunker.push(batch(101)).unwrap();
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.num_rows() == 10));
        let tail = chunker.finish().unwrap().expect("remainder");
        assert_eq!(tail.num_rows(), 1);
        assert!(chunker.finish().unwrap().is_none());
    }

    #[test]
    fn chunker_carries_remainders_across_engine_batches() {
        // engine vector sizes are unrelated to the fetch size; no short
        // chunk may appear before stream end
        let mut chunker = BatchChunker::new(batch(0).schema(), 10);
        let mut chunks = vec![];
        for _ in 0..3 {
            chunks.extend(chunker.push(batch(7)).unwrap());
        }
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.num_rows() == 10));
        let tail = chunker.finish().unwrap().expect("remainder");
        assert_eq!(tail.num_rows(), 1);

        let total: usize = chunks.iter().map(RecordBatch::num_rows).sum::<usize>()
            + tail.num_rows();
        assert_eq!(total, 21);
    }

    #[test]
    fn chunker_flushes_nothing_when_aligned() {
        let mut chunker = BatchChunker::new(batch(0).schema(), 10);
        let mut chunks = chunker.push(batch(15)).unwrap();
        chunks.extend(chunker.push(batch(5)).unwrap());
        chunks.extend(chunker.push(batch(0)).unwrap());
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.num_rows() == 10));
        assert!(chunker.finish().unwrap().is_none());
    }

    #[test]
    fn target_schema_casts_single_column() {
        let target = Arc::new(Schema::new(vec![Field::new("v", DataType::Utf8, true)]));
        let out = apply_target_schema(batch(3), Some(&target)).unwrap();
        assert_eq!(out.schema(), target);
        assert_eq!(out.num_rows(), 3);
    }

    #[test]
    fn metadata_sql_filters_are_escaped() {
        let cmd = CommandGetTables {
            catalog: Some("mem'ory".to_string()),
            db_schema_filter_pattern: Some("ma%".to_string()),
            table_name_filter_pattern: None,
            table_types: vec![],
            include_schema: false,
        };
        let sql = tables_sql(&cmd);
        assert!(sql.contains("'mem''ory'"));
        assert!(sql.contains("schema_name LIKE 'ma%'"));

        let cmd = CommandGetDbSchemas {
            catalog: None,
            db_schema_filter_pattern: None,
        };
        assert!(!schemas_sql(&cmd).contains("WHERE"));
    }

    #[test]
    fn ticket_roundtrip_through_prost_any() {
        let payload = TicketPayload::Statement {
            query_id: Uuid::new_v4(),
            sql: "SELECT 1".to_string(),
            fetch_size: Some(10),
        };
        let ticket = make_ticket(&payload).unwrap();
        let any = Any::decode(&*ticket.ticket).unwrap();
        let statement_ticket = any.unpack::<TicketStatementQuery>().unwrap().unwrap();
        let decoded = TicketPayload::decode(&statement_ticket.statement_handle).unwrap();
        assert_eq!(decoded, payload);
    }
}
