//! PostgreSQL connection implementation.
//!
//! This module provides the main connection type that handles:
//! - TCP connection establishment
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Simple and extended query protocols with a lazy row stream
//! - Prepared statement caching
//! - Recovery of a clean protocol state after an abandoned operation
//!
//! Every request ends with a Sync or simple Query, each answered by exactly one
//! ReadyForQuery. The connection counts the outstanding ones; it is idle again
//! when that count drops to zero. Reads are cancel-safe, so a dropped operation
//! only leaves unread responses behind, which the next operation drains.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::cancel::CancelKey;
use super::error::PgError;
use super::listener::Notification;
use super::protocol::*;
use super::scram::{self, ScramClient};
use super::statement::{PreparedStatement, SharedColumns, StatementCache};
use super::types::{Oid, PgValue};
use crate::error::{Error, Result};
use crate::scan::{Row, RowValues};

// ============================================================================
// Connection Configuration
// ============================================================================

/// URL parameters consumed by the pool rather than the connection.
pub(crate) const POOL_URL_PARAMS: &[&str] = &[
    "min_connections",
    "max_connections",
    "idle_timeout",
    "max_lifetime",
    "acquire_timeout",
    "statement_timeout",
];

/// PostgreSQL connection configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
    /// Bound on TCP connect plus the startup handshake
    pub connect_timeout: Duration,
    /// Prepared statements kept per connection; 0 disables the cache
    pub statement_cache_capacity: usize,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: None,
            application_name: Some("pgkit".to_string()),
            connect_timeout: Duration::from_secs(10),
            statement_cache_capacity: 100,
        }
    }
}

impl PgConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    /// Parse a connection URL.
    ///
    /// Format: `postgres[ql]://user:password@host:port/database?key=value`.
    /// Pool parameters are accepted and ignored here.
    pub fn from_url(url: &str) -> Result<Self> {
        let (config, params) = parse_url(url)?;
        if let Some((key, _)) = params
            .iter()
            .find(|(k, _)| !POOL_URL_PARAMS.contains(&k.as_str()))
        {
            return Err(Error::Config(format!("Unknown URL parameter: {}", key)));
        }
        Ok(config)
    }

    pub fn addr(&self) -> String {
        host_port(&self.host, self.port)
    }
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parse a URL into a connection config plus the parameters it did not use.
pub(crate) fn parse_url(url: &str) -> Result<(PgConfig, Vec<(String, String)>)> {
    let rest = url
        .strip_prefix("postgresql://")
        .or_else(|| url.strip_prefix("postgres://"))
        .ok_or_else(|| Error::Config("Invalid URL scheme".to_string()))?;

    let (main, query) = match rest.split_once('?') {
        Some((m, q)) => (m, Some(q)),
        None => (rest, None),
    };

    let (credentials, host_part) = match main.rfind('@') {
        Some(at) => (&main[..at], &main[at + 1..]),
        None => ("", main),
    };

    let mut config = PgConfig::default();

    if !credentials.is_empty() {
        match credentials.split_once(':') {
            Some((user, password)) => {
                config.user = percent_decode(user)?;
                config.password = Some(percent_decode(password)?);
            }
            None => config.user = percent_decode(credentials)?,
        }
    }

    let (host_port, database) = match host_part.split_once('/') {
        Some((hp, db)) => (hp, db),
        None => (host_part, ""),
    };
    if !database.is_empty() {
        config.database = percent_decode(database)?;
    }

    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        // IPv6 literal
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("Invalid host: {}", host_port)))?;
        (host, after.strip_prefix(':'))
    } else {
        match host_port.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (host_port, None),
        }
    };
    if !host.is_empty() {
        config.host = host.to_string();
    }
    if let Some(port) = port {
        config.port = port
            .parse()
            .map_err(|_| Error::Config(format!("Invalid port: {}", port)))?;
    }

    let mut leftover = Vec::new();
    for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value)?;
        match key {
            "application_name" => config.application_name = Some(value),
            "connect_timeout" => config.connect_timeout = parse_duration(&value)?,
            "statement_cache_capacity" => {
                config.statement_cache_capacity = value.parse().map_err(|_| {
                    Error::Config(format!("Invalid statement_cache_capacity: {}", value))
                })?
            }
            _ => leftover.push((key.to_string(), value)),
        }
    }

    Ok((config, leftover))
}

/// Parse `500ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| Error::Config(format!("Invalid duration: {:?}", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(Error::Config(format!("Invalid duration unit: {:?}", s))),
    }
}

fn percent_decode(s: &str) -> Result<String> {
    if !s.contains('%') {
        return Ok(s.to_string());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::Config(format!("Invalid percent-encoding in {:?}", s)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::Config(format!("Invalid UTF-8 in {:?}", s)))
}

// ============================================================================
// Query Result
// ============================================================================

/// A fully collected result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    fn new() -> Self {
        Self {
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    pub fn rows_affected(&self) -> i64 {
        rows_affected(&self.command_tag)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Row count from a command tag, or -1 when the command reports none
/// (DDL, `BEGIN`, `LISTEN`, ...).
pub fn rows_affected(tag: &str) -> i64 {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MOVE", n]
        | ["FETCH", n]
        | ["COPY", n]
        | ["MERGE", n] => n.parse().unwrap_or(-1),
        _ => -1,
    }
}

// ============================================================================
// Row Stream
// ============================================================================

/// Rows of one in-flight query, read from the socket as they are consumed.
///
/// Single pass: once exhausted (or after an error) `next` keeps returning
/// `None`. Dropping the stream early leaves the remaining responses on the
/// wire; the connection drains them before its next operation.
pub struct RowStream<'c> {
    conn: &'c mut PgConnection,
    columns: SharedColumns,
    command_tag: Option<String>,
    rows_returned: u64,
    done: bool,
}

impl<'c> RowStream<'c> {
    fn new(conn: &'c mut PgConnection, columns: SharedColumns) -> Self {
        Self {
            conn,
            columns,
            command_tag: None,
            rows_returned: 0,
            done: false,
        }
    }

    /// Columns of the most recent row description.
    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    /// Tag of the last completed command, once seen.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    pub fn rows_affected(&self) -> i64 {
        self.command_tag.as_deref().map_or(-1, rows_affected)
    }

    pub fn rows_returned(&self) -> u64 {
        self.rows_returned
    }

    pub async fn next(&mut self) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        match self.advance().await {
            Ok(Some(row)) => {
                self.rows_returned += 1;
                Ok(Some(row))
            }
            other => {
                self.done = true;
                other
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Row>> {
        loop {
            match self.conn.receive_message().await? {
                BackendMessage::DataRow { values } => {
                    return decode_row(&self.columns, values).map(Some);
                }
                BackendMessage::RowDescription { fields } => self.columns = Arc::new(fields),
                BackendMessage::CommandComplete { tag } => self.command_tag = Some(tag),
                BackendMessage::EmptyQueryResponse
                | BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData
                | BackendMessage::PortalSuspended => {}
                BackendMessage::ReadyForQuery { .. } => {
                    if self.conn.pending_ready == 0 {
                        return Ok(None);
                    }
                }
                BackendMessage::ErrorResponse { error } => {
                    return Err(self.conn.recover(error).await);
                }
                BackendMessage::CopyInResponse { .. } | BackendMessage::CopyOutResponse { .. } => {
                    self.conn.settle().await?;
                    return Err(Error::Copy(
                        "COPY statements must run through copy_from / copy_to".to_string(),
                    ));
                }
                other => return Err(self.conn.unexpected(&other)),
            }
        }
    }

    /// Consume the remaining rows and return the final command tag.
    pub async fn finish(mut self) -> Result<Option<String>> {
        while self.next().await?.is_some() {}
        Ok(self.command_tag)
    }

    /// Buffer every remaining row.
    pub async fn collect(mut self) -> Result<QueryResult> {
        let mut result = QueryResult::new();
        while let Some(row) = self.next().await? {
            result.rows.push(row);
        }
        result.columns = self.columns;
        result.command_tag = self.command_tag.unwrap_or_default();
        Ok(result)
    }
}

fn decode_row(columns: &SharedColumns, values: Vec<Option<Bytes>>) -> Result<Row> {
    if values.len() != columns.len() {
        return Err(Error::Protocol(format!(
            "DataRow has {} values for {} columns",
            values.len(),
            columns.len()
        )));
    }
    let mut row = RowValues::with_capacity(values.len());
    for (column, value) in columns.iter().zip(values) {
        row.push(match value {
            None => PgValue::Null,
            Some(data) => match column.format {
                Format::Binary => PgValue::decode_binary(column.type_oid, &data)?,
                Format::Text => PgValue::decode_text(column.type_oid, &data)?,
            },
        });
    }
    Ok(Row::new(Arc::clone(columns), row))
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No request outstanding
    Idle,
    /// Responses still owed by the server
    Busy,
    /// Socket gone or protocol desynchronised
    Closed,
}

/// A PostgreSQL connection.
///
/// One operation at a time: methods take `&mut self`, so concurrent use of a
/// single connection is ruled out by the borrow checker.
pub struct PgConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    /// Encoded but not yet written messages; non-empty between operations
    /// only if a write was interrupted
    write_buf: BytesMut,
    config: PgConfig,
    statement_cache: StatementCache,
    state: ConnectionState,
    /// ReadyForQuery messages still owed by the server
    pending_ready: usize,
    /// Server is waiting for CopyData from us
    in_copy_in: bool,
    transaction_status: TransactionStatus,
    backend_pid: i32,
    backend_secret_key: i32,
    parameters: HashMap<String, String>,
    /// Notifications that arrived while another operation was reading
    notifications: VecDeque<Notification>,
    created_at: Instant,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("backend_pid", &self.backend_pid)
            .finish_non_exhaustive()
    }
}

impl PgConnection {
    /// Connect to a PostgreSQL server.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(PgConfig::from_url(url)?).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with_config(config: PgConfig) -> Result<Self> {
        let addr = config.addr();
        let timeout = config.connect_timeout;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Connection(format!("{}: {}", addr, e))),
            Err(_) => return Err(Error::Connection(format!("{}: connect timed out", addr))),
        };
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let mut conn = Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::with_capacity(8 * 1024),
            statement_cache: StatementCache::new(config.statement_cache_capacity),
            config,
            state: ConnectionState::Busy,
            pending_ready: 1,
            in_copy_in: false,
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            backend_secret_key: 0,
            parameters: HashMap::new(),
            notifications: VecDeque::new(),
            created_at: Instant::now(),
        };

        match tokio::time::timeout(timeout, conn.startup()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Connection(format!(
                    "{}: startup handshake timed out",
                    addr
                )))
            }
        }

        tracing::debug!(addr = %addr, pid = conn.backend_pid, "Connected to PostgreSQL");
        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self) -> Result<()> {
        let mut options = vec![("client_encoding".to_string(), "UTF8".to_string())];
        if let Some(ref name) = self.config.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
        self.push(&StartupMessage {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            options,
        });
        self.flush().await?;

        let mut scram: Option<ScramClient> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.password()?.to_string();
                    self.push(&PasswordMessage { password });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password = md5_password(&self.config.user, self.password()?, &salt);
                    self.push(&PasswordMessage { password });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(Error::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let client = ScramClient::new(self.password()?);
                    self.push(&SaslInitialResponseMessage {
                        mechanism: scram::MECHANISM.to_string(),
                        data: client.client_first_message(),
                    });
                    self.flush().await?;
                    scram = Some(client);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| Error::Protocol("SASL continue before SASL start".into()))?;
                    let data = client.process_server_first(&data)?;
                    self.push(&SaslResponseMessage { data });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    scram
                        .as_mut()
                        .ok_or_else(|| Error::Protocol("SASL final before SASL start".into()))?
                        .verify_server_final(&data)?;
                }
                BackendMessage::BackendKeyData { .. } => {}
                BackendMessage::ReadyForQuery { .. } => return Ok(()),
                BackendMessage::ErrorResponse { error } => return Err(Error::Query(error)),
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    fn password(&self) -> Result<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required".to_string()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Start a query and return its rows as a lazy stream.
    ///
    /// Without parameters the simple-query protocol is used (several
    /// statements allowed, text results). With parameters the statement is
    /// prepared once per connection and executed with Bind/Execute.
    pub async fn query_stream(&mut self, sql: &str, params: &[PgValue]) -> Result<RowStream<'_>> {
        self.ensure_ready().await?;

        if params.is_empty() {
            return self.simple_stream(sql).await;
        }
        check_param_count(params.len())?;

        let mut retried = false;
        loop {
            let stmt = self.prepare_cached(sql, params).await?;
            match self.bind_execute(&stmt, params).await {
                Ok(()) => return Ok(RowStream::new(self, stmt.bound_columns())),
                Err(Error::Query(e)) if e.stale_statement() && !stmt.name.is_empty() => {
                    self.statement_cache.invalidate(sql);
                    if retried || self.transaction_status != TransactionStatus::Idle {
                        return Err(Error::Query(e));
                    }
                    tracing::debug!(statement = %stmt.name, code = e.code(), "Re-preparing stale statement");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a query and collect all rows.
    pub async fn query(&mut self, sql: &str, params: &[PgValue]) -> Result<QueryResult> {
        self.query_stream(sql, params).await?.collect().await
    }

    /// Run a statement and return the number of rows it affected (-1 if none).
    pub async fn execute(&mut self, sql: &str, params: &[PgValue]) -> Result<i64> {
        let tag = self.query_stream(sql, params).await?.finish().await?;
        Ok(tag.as_deref().map_or(-1, rows_affected))
    }

    /// Execute a script of one or more statements, one result per statement.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.ensure_ready().await?;
        let mut stream = self.simple_stream(sql).await?;

        let mut results = Vec::new();
        let mut current = QueryResult::new();
        loop {
            match stream.conn.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    current.columns = Arc::new(fields);
                }
                BackendMessage::DataRow { values } => {
                    current.rows.push(decode_row(&current.columns, values)?);
                }
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = tag;
                    results.push(std::mem::replace(&mut current, QueryResult::new()));
                }
                BackendMessage::EmptyQueryResponse | BackendMessage::CloseComplete => {}
                BackendMessage::ReadyForQuery { .. } => {
                    if stream.conn.pending_ready == 0 {
                        return Ok(results);
                    }
                }
                BackendMessage::ErrorResponse { error } => {
                    return Err(stream.conn.recover(error).await);
                }
                BackendMessage::CopyInResponse { .. } | BackendMessage::CopyOutResponse { .. } => {
                    stream.conn.settle().await?;
                    return Err(Error::Copy(
                        "COPY statements must run through copy_from / copy_to".to_string(),
                    ));
                }
                other => return Err(stream.conn.unexpected(&other)),
            }
        }
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN", &[]).await.map(drop)
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[]).await.map(drop)
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK", &[]).await.map(drop)
    }

    /// Prepare a named statement outside the cache. It stays valid until
    /// [`close_statement`](Self::close_statement) or the connection closes.
    pub async fn prepare(&mut self, sql: &str) -> Result<Arc<PreparedStatement>> {
        self.ensure_ready().await?;
        let name = self.statement_cache.next_statement_name();
        Ok(Arc::new(self.parse_describe(name, sql, &[]).await?))
    }

    /// Execute a statement from [`prepare`](Self::prepare).
    pub async fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        params: &[PgValue],
    ) -> Result<RowStream<'_>> {
        self.ensure_ready().await?;
        self.bind_execute(stmt, params).await?;
        Ok(RowStream::new(self, stmt.bound_columns()))
    }

    /// Release a statement on the server.
    pub async fn close_statement(&mut self, name: &str) -> Result<()> {
        self.ensure_ready().await?;
        self.push(&CloseMessage { kind: b'S', name });
        self.push_sync();
        self.flush().await?;
        self.drain_until_ready().await
    }

    /// Close a statement from [`prepare`](Self::prepare) lazily, with the
    /// next request. Usable where awaiting is not possible.
    pub fn forget_statement(&mut self, name: &str) {
        if !name.is_empty() && !self.is_closed() {
            self.statement_cache.queue_close(name.to_string());
        }
    }

    async fn simple_stream(&mut self, sql: &str) -> Result<RowStream<'_>> {
        if self.statement_cache.has_pending_close() {
            self.push_pending_closes();
            self.push_sync();
        }
        self.push(&QueryMessage { query: sql });
        self.expect_ready();
        self.flush().await?;
        Ok(RowStream::new(self, Arc::new(Vec::new())))
    }

    async fn prepare_cached(
        &mut self,
        sql: &str,
        params: &[PgValue],
    ) -> Result<Arc<PreparedStatement>> {
        if let Some(stmt) = self.statement_cache.get(sql) {
            return Ok(stmt);
        }

        let name = if self.statement_cache.is_enabled() {
            self.statement_cache.next_statement_name()
        } else {
            String::new()
        };
        let hints: Vec<Oid> = params.iter().map(parse_type_hint).collect();
        let stmt = Arc::new(self.parse_describe(name, sql, &hints).await?);
        self.statement_cache.insert(Arc::clone(&stmt));
        Ok(stmt)
    }

    /// Parse + Describe(S) + Sync, one round trip.
    async fn parse_describe(
        &mut self,
        name: String,
        sql: &str,
        param_types: &[Oid],
    ) -> Result<PreparedStatement> {
        self.push_pending_closes();
        self.push(&ParseMessage {
            name: &name,
            query: sql,
            param_types,
        });
        self.push(&DescribeMessage {
            kind: b'S',
            name: &name,
        });
        self.push_sync();
        self.flush().await?;

        let mut described_params = Vec::new();
        let mut columns = Vec::new();
        loop {
            match self.receive_message().await? {
                BackendMessage::ParseComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData => {}
                BackendMessage::ParameterDescription { type_oids } => described_params = type_oids,
                BackendMessage::RowDescription { fields } => columns = fields,
                BackendMessage::ReadyForQuery { .. } => {
                    if self.pending_ready == 0 {
                        break;
                    }
                }
                BackendMessage::ErrorResponse { error } => return Err(self.recover(error).await),
                other => return Err(self.unexpected(&other)),
            }
        }

        tracing::debug!(statement = %name, "Prepared statement");
        Ok(PreparedStatement::new(
            name,
            sql.to_string(),
            described_params,
            columns,
        ))
    }

    /// Bind + Execute + Sync, then wait for BindComplete so statement-level
    /// errors surface before any row is read.
    async fn bind_execute(&mut self, stmt: &PreparedStatement, params: &[PgValue]) -> Result<()> {
        check_param_count(params.len())?;
        if params.len() != stmt.param_types.len() {
            return Err(Error::Argument(format!(
                "statement expects {} parameter(s), got {}",
                stmt.param_types.len(),
                params.len()
            )));
        }

        self.push_pending_closes();
        self.push(&BindMessage {
            portal: "",
            statement: &stmt.name,
            params,
            param_types: &stmt.param_types,
            result_formats: &stmt.result_formats,
        });
        self.push(&ExecuteMessage {
            portal: "",
            max_rows: 0,
        });
        self.push_sync();
        self.flush().await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::BindComplete => return Ok(()),
                BackendMessage::CloseComplete => {}
                BackendMessage::ErrorResponse { error } => return Err(self.recover(error).await),
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Wait for the next asynchronous notification.
    ///
    /// Cancel-safe: a notification is either returned or stays queued.
    pub async fn next_notification(&mut self) -> Result<Notification> {
        loop {
            if let Some(n) = self.notifications.pop_front() {
                return Ok(n);
            }
            self.ensure_ready().await?;
            match self.read_message().await? {
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => return Ok(Notification::new(process_id, channel, payload)),
                BackendMessage::NoticeResponse { notice } => log_notice(&notice),
                BackendMessage::ParameterStatus { .. } => {}
                BackendMessage::ErrorResponse { error } => return Err(Error::Query(error)),
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    pub fn take_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn cancel_key(&self) -> CancelKey {
        CancelKey {
            host: self.config.host.clone(),
            port: self.config.port,
            process_id: self.backend_pid,
            secret_key: self.backend_secret_key,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Idle protocol state outside any transaction block.
    pub fn is_clean(&self) -> bool {
        self.state == ConnectionState::Idle
            && self.transaction_status == TransactionStatus::Idle
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// A server parameter reported via ParameterStatus (e.g. `server_version`).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.statement_cache
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Bring the connection back to a clean state, rolling back any open
    /// transaction. Used before returning it to the pool.
    pub async fn reset(&mut self) -> Result<()> {
        self.ensure_ready().await?;
        if self.transaction_status != TransactionStatus::Idle {
            self.rollback().await?;
        }
        Ok(())
    }

    /// Close the connection.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.write_buf.clear();
        self.push(&TerminateMessage);
        let res = self.flush().await;
        self.state = ConnectionState::Closed;
        self.statement_cache.clear();
        res
    }

    // ========================================================================
    // Message plumbing
    // ========================================================================

    pub(super) fn push<M: FrontendMessage>(&mut self, msg: &M) {
        msg.encode(&mut self.write_buf);
    }

    /// Account for one more ReadyForQuery owed by the server.
    pub(super) fn expect_ready(&mut self) {
        self.pending_ready += 1;
        self.state = ConnectionState::Busy;
    }

    pub(super) fn pending_ready(&self) -> usize {
        self.pending_ready
    }

    pub(super) fn push_sync(&mut self) {
        self.push(&SyncMessage);
        self.expect_ready();
    }

    fn push_pending_closes(&mut self) {
        for name in self.statement_cache.take_pending_close() {
            self.push(&CloseMessage {
                kind: b'S',
                name: &name,
            });
        }
    }

    /// Write out everything pushed so far.
    pub(super) async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.writer.write_all(&self.write_buf).await {
            self.state = ConnectionState::Closed;
            return Err(e.into());
        }
        self.write_buf.clear();
        Ok(())
    }

    /// Read and decode one message, updating connection bookkeeping.
    async fn read_message(&mut self) -> Result<BackendMessage> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        loop {
            let frame = match frame_len(&self.read_buf) {
                Ok(Some(len)) if self.read_buf.len() >= len => Some(len),
                Ok(_) => None,
                Err(e) => return Err(self.fail(e)),
            };
            if let Some(len) = frame {
                let mut frame = self.read_buf.split_to(len).freeze();
                let msg = BackendMessage::decode(&mut frame).map_err(|e| self.fail(e))?;
                self.observe(&msg);
                return Ok(msg);
            }

            self.read_buf.reserve(8 * 1024);
            match self.reader.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    self.state = ConnectionState::Closed;
                    return Err(Error::ConnectionClosed);
                }
                Ok(_) => {}
                Err(e) => return Err(self.fail(e.into())),
            }
        }
    }

    fn observe(&mut self, msg: &BackendMessage) {
        match msg {
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = *status;
                self.pending_ready = self.pending_ready.saturating_sub(1);
                self.in_copy_in = false;
                if self.pending_ready == 0 && self.state == ConnectionState::Busy {
                    self.state = ConnectionState::Idle;
                }
            }
            BackendMessage::CopyInResponse { .. } => self.in_copy_in = true,
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name.clone(), value.clone());
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_pid = *process_id;
                self.backend_secret_key = *secret_key;
            }
            BackendMessage::ErrorResponse { error } if error.is_fatal() => {
                tracing::warn!(pid = self.backend_pid, error = %error, "Server terminated session");
                self.state = ConnectionState::Closed;
            }
            _ => {}
        }
    }

    /// Next message relevant to the current operation. Notices are logged and
    /// notifications queued for the listener.
    pub(super) async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            match self.read_message().await? {
                BackendMessage::NoticeResponse { notice } => log_notice(&notice),
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => self
                    .notifications
                    .push_back(Notification::new(process_id, channel, payload)),
                BackendMessage::ParameterStatus { .. } => {}
                msg => return Ok(msg),
            }
        }
    }

    /// Start an operation from a clean protocol state: finish whatever an
    /// abandoned operation left behind.
    pub(super) async fn ensure_ready(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Idle => return Ok(()),
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            ConnectionState::Busy => {}
        }
        if !self.write_buf.is_empty() {
            self.state = ConnectionState::Closed;
            return Err(Error::Protocol(
                "request was interrupted mid-write; connection desynchronised".to_string(),
            ));
        }
        tracing::debug!(
            pid = self.backend_pid,
            pending = self.pending_ready,
            "Draining abandoned response"
        );
        self.settle().await?;
        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Abort a pending copy-in and read until every ReadyForQuery arrived.
    pub(super) async fn settle(&mut self) -> Result<()> {
        if self.in_copy_in {
            self.abort_copy_in("operation abandoned").await?;
        }
        self.drain_until_ready().await
    }

    pub(super) async fn abort_copy_in(&mut self, reason: &str) -> Result<()> {
        self.push(&CopyFailMessage { reason });
        self.in_copy_in = false;
        self.flush().await
    }

    async fn drain_until_ready(&mut self) -> Result<()> {
        while self.pending_ready > 0 {
            if let BackendMessage::CopyInResponse { .. } = self.receive_message().await? {
                self.abort_copy_in("unexpected COPY FROM STDIN").await?;
            }
        }
        Ok(())
    }

    /// Turn a server error into the operation's result after resynchronising.
    pub(super) async fn recover(&mut self, error: PgError) -> Error {
        if self.state != ConnectionState::Closed {
            if let Err(e) = self.settle().await {
                tracing::warn!(error = %e, "Failed to resynchronise after server error");
            }
        }
        Error::Query(error)
    }

    /// The server sent something the current operation cannot interpret.
    pub(super) fn unexpected(&mut self, msg: &BackendMessage) -> Error {
        self.state = ConnectionState::Closed;
        Error::Protocol(format!("Unexpected {} message", msg.name()))
    }

    fn fail(&mut self, e: Error) -> Error {
        if e.is_fatal() {
            self.state = ConnectionState::Closed;
        }
        e
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Parameter type announced in Parse. Text-like values are left for the
/// server to infer so they coerce into whatever the query needs.
fn parse_type_hint(value: &PgValue) -> Oid {
    match value {
        PgValue::Null | PgValue::Text(_) | PgValue::Json(_) => Oid::UNSPECIFIED,
        other => other.type_oid(),
    }
}

fn log_notice(notice: &PgError) {
    tracing::debug!(
        severity = notice.severity(),
        code = notice.code(),
        "{}",
        notice.message()
    );
}

/// Compute MD5 password hash: "md5" + md5(md5(password + user) + salt)
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}
