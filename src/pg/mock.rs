//! In-process stand-in for a PostgreSQL server.
//!
//! Speaks enough of protocol 3.0 to drive the pool, transactions, listener,
//! COPY, cancellation and error paths without a real database. The "SQL
//! engine" recognises a handful of fixed statements; everything else is a
//! syntax error.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};

use super::connection::PgConfig;
use super::protocol::CANCEL_REQUEST_CODE;
use super::types::{Oid, PgValue};

#[derive(Debug, Clone)]
pub(crate) enum MockAuth {
    Trust,
    Cleartext(String),
    Md5(String),
}

struct SessionHandle {
    channels: HashSet<String>,
    inject: mpsc::UnboundedSender<Vec<u8>>,
    cancel: Arc<Notify>,
}

struct Shared {
    auth: MockAuth,
    next_pid: AtomicI32,
    log: Mutex<Vec<String>>,
    sessions: Mutex<HashMap<i32, SessionHandle>>,
    users: Mutex<HashSet<String>>,
    table: Mutex<Vec<u8>>,
    counter: AtomicI64,
    fail_updates: AtomicUsize,
    statement_generation: AtomicU64,
    kill: watch::Sender<u64>,
}

impl Shared {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        Self::start_with(MockAuth::Trust).await
    }

    pub(crate) async fn start_with(auth: MockAuth) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            auth,
            next_pid: AtomicI32::new(1000),
            log: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            users: Mutex::new(HashSet::new()),
            table: Mutex::new(Vec::new()),
            counter: AtomicI64::new(0),
            fail_updates: AtomicUsize::new(0),
            statement_generation: AtomicU64::new(0),
            kill,
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_shared)));
            }
        });

        Self { addr, shared }
    }

    pub(crate) fn config(&self) -> PgConfig {
        let config = PgConfig::default()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("tester")
            .database("mock");
        match &self.shared.auth {
            MockAuth::Trust => config,
            MockAuth::Cleartext(p) | MockAuth::Md5(p) => config.password(p.clone()),
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("postgres://tester@127.0.0.1:{}/mock", self.addr.port())
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.shared.log.lock().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|e| e.starts_with(entry))
            .count()
    }

    /// Poll the log until `pred` holds or two seconds pass.
    pub(crate) async fn wait_for(&self, pred: impl Fn(&[String]) -> bool) -> bool {
        for _ in 0..200 {
            let done = pred(&self.shared.log.lock());
            if done {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Make every session forget its prepared statements.
    pub(crate) fn forget_statements(&self) {
        self.shared.statement_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// The next `n` counter updates fail with a serialization error.
    pub(crate) fn fail_next_updates(&self, n: usize) {
        self.shared.fail_updates.store(n, Ordering::SeqCst);
    }

    pub(crate) fn counter(&self) -> i64 {
        self.shared.counter.load(Ordering::SeqCst)
    }

    pub(crate) fn copied(&self) -> Vec<u8> {
        self.shared.table.lock().clone()
    }

    /// Drop every open session.
    pub(crate) fn disconnect_all(&self) {
        self.shared.kill.send_modify(|g| *g += 1);
    }

    /// Sessions currently listening on `channel`.
    pub(crate) fn listening(&self, channel: &str) -> usize {
        self.shared
            .sessions
            .lock()
            .values()
            .filter(|s| s.channels.contains(channel))
            .count()
    }

    pub(crate) fn sessions(&self) -> usize {
        self.shared.sessions.lock().len()
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn error_frame(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        body.push(field);
        cstr(&mut body, value);
    }
    if code == "23505" {
        body.push(b'n');
        cstr(&mut body, "users_pkey");
    }
    body.push(0);
    frame(b'E', &body)
}

fn notification_frame(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    cstr(&mut body, channel);
    cstr(&mut body, payload);
    frame(b'A', &body)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn i16(&mut self) -> i16 {
        let v = i16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn i32(&mut self) -> i32 {
        let v = i32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn cstr(&mut self) -> String {
        let end = self.pos + self.buf[self.pos..].iter().position(|&b| b == 0).unwrap();
        let s = String::from_utf8(self.buf[self.pos..end].to_vec()).unwrap();
        self.pos = end + 1;
        s
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let b = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        b
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

// ============================================================================
// Session
// ============================================================================

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let (mut rd, mut wr) = stream.into_split();

    let Ok(len) = rd.read_i32().await else { return };
    let mut body = vec![0u8; len as usize - 4];
    if rd.read_exact(&mut body).await.is_err() {
        return;
    }
    let mut cur = Cursor::new(&body);
    if cur.i32() == CANCEL_REQUEST_CODE {
        let pid = cur.i32();
        shared.record(format!("CANCEL:{}", pid));
        if let Some(session) = shared.sessions.lock().get(&pid) {
            session.cancel.notify_one();
        }
        return;
    }

    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    tokio::spawn(read_frames(rd, frames_tx));

    let pid = shared.next_pid.fetch_add(1, Ordering::SeqCst);
    if !authenticate(&shared, &mut wr, &mut frames).await {
        return;
    }

    let (inject_tx, inject) = mpsc::unbounded_channel();
    let cancel = Arc::new(Notify::new());
    shared.sessions.lock().insert(
        pid,
        SessionHandle {
            channels: HashSet::new(),
            inject: inject_tx,
            cancel: Arc::clone(&cancel),
        },
    );

    let mut hello = Vec::new();
    let mut status = Vec::new();
    cstr(&mut status, "server_version");
    cstr(&mut status, "16.0");
    hello.extend(frame(b'S', &status));
    let mut key = pid.to_be_bytes().to_vec();
    key.extend_from_slice(&42i32.to_be_bytes());
    hello.extend(frame(b'K', &key));
    hello.extend(frame(b'Z', b"I"));
    if wr.write_all(&hello).await.is_err() {
        shared.sessions.lock().remove(&pid);
        return;
    }

    let mut session = Session {
        generation: shared.statement_generation.load(Ordering::SeqCst),
        shared: Arc::clone(&shared),
        pid,
        wr,
        out: Vec::new(),
        statements: HashMap::new(),
        portal: None,
        skip_until_sync: false,
        in_tx: false,
        tx_failed: false,
        copy_in: None,
        cancel,
    };
    session.run(frames, inject).await;
    shared.sessions.lock().remove(&pid);
}

async fn read_frames(mut rd: OwnedReadHalf, tx: mpsc::UnboundedSender<(u8, Vec<u8>)>) {
    loop {
        let Ok(tag) = rd.read_u8().await else { return };
        let Ok(len) = rd.read_i32().await else { return };
        let mut body = vec![0u8; len as usize - 4];
        if rd.read_exact(&mut body).await.is_err() || tx.send((tag, body)).is_err() {
            return;
        }
    }
}

async fn authenticate(
    shared: &Shared,
    wr: &mut OwnedWriteHalf,
    frames: &mut mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
) -> bool {
    let expected = match &shared.auth {
        MockAuth::Trust => None,
        MockAuth::Cleartext(password) => {
            let _ = wr.write_all(&frame(b'R', &3i32.to_be_bytes())).await;
            Some(password.clone())
        }
        MockAuth::Md5(password) => {
            let salt = [7u8, 1, 2, 9];
            let mut body = 5i32.to_be_bytes().to_vec();
            body.extend_from_slice(&salt);
            let _ = wr.write_all(&frame(b'R', &body)).await;
            let inner = format!("{:x}", md5::compute(format!("{}tester", password)));
            let mut outer = inner.into_bytes();
            outer.extend_from_slice(&salt);
            Some(format!("md5{:x}", md5::compute(&outer)))
        }
    };

    if let Some(expected) = expected {
        let Some((b'p', body)) = frames.recv().await else {
            return false;
        };
        let got = Cursor::new(&body).cstr();
        if got != expected {
            let _ = wr
                .write_all(&error_frame(
                    "FATAL",
                    "28P01",
                    "password authentication failed for user \"tester\"",
                ))
                .await;
            return false;
        }
    }
    wr.write_all(&frame(b'R', &0i32.to_be_bytes())).await.is_ok()
}

struct Statement {
    sql: String,
    param_types: Vec<Oid>,
}

struct Portal {
    sql: String,
    params: Vec<Option<String>>,
    param_types: Vec<Oid>,
    result_formats: Vec<i16>,
}

enum Outcome {
    Rows(Vec<(String, Oid)>, Vec<Vec<Option<String>>>),
    Done(String),
    Empty,
    Error(&'static str, String),
    Fatal,
    Sleep(Duration),
    CopyIn,
    CopyOut,
}

struct Session {
    shared: Arc<Shared>,
    pid: i32,
    wr: OwnedWriteHalf,
    out: Vec<u8>,
    generation: u64,
    statements: HashMap<String, Statement>,
    portal: Option<Portal>,
    skip_until_sync: bool,
    in_tx: bool,
    tx_failed: bool,
    copy_in: Option<Vec<u8>>,
    cancel: Arc<Notify>,
}

impl Session {
    async fn run(
        &mut self,
        mut frames: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
        mut inject: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let mut kill = self.shared.kill.subscribe();
        kill.borrow_and_update();
        loop {
            tokio::select! {
                _ = kill.changed() => return,
                Some(frame) = inject.recv() => {
                    if self.wr.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                msg = frames.recv() => {
                    let Some((tag, body)) = msg else { return };
                    let keep_going = self.on_message(tag, &body).await;
                    let out = std::mem::take(&mut self.out);
                    if self.wr.write_all(&out).await.is_err() || !keep_going {
                        return;
                    }
                }
            }
        }
    }

    fn ready(&mut self) {
        let status = match (self.in_tx, self.tx_failed) {
            (false, _) => b'I',
            (true, false) => b'T',
            (true, true) => b'E',
        };
        self.out.extend(frame(b'Z', &[status]));
    }

    fn error(&mut self, code: &str, message: &str) {
        if self.in_tx {
            self.tx_failed = true;
        }
        self.out.extend(error_frame("ERROR", code, message));
    }

    async fn on_message(&mut self, tag: u8, body: &[u8]) -> bool {
        if self.skip_until_sync && tag != b'S' {
            return true;
        }
        let mut cur = Cursor::new(body);
        match tag {
            b'Q' => {
                let sql = cur.cstr();
                return self.simple_query(&sql).await;
            }
            b'P' => {
                let name = cur.cstr();
                let sql = cur.cstr();
                let hints: Vec<Oid> = (0..cur.i16()).map(|_| Oid::from_i32(cur.i32())).collect();
                self.shared.record(format!("PARSE:{}", sql));
                let param_types = (0..count_params(&sql))
                    .map(|i| match hints.get(i) {
                        Some(&oid) if oid != Oid::UNSPECIFIED => oid,
                        _ => Oid::TEXT,
                    })
                    .collect();
                self.statements.insert(name, Statement { sql, param_types });
                self.out.extend(frame(b'1', &[]));
            }
            b'D' => {
                let _kind = cur.bytes(1);
                let name = cur.cstr();
                let Some(stmt) = self.statements.get(&name) else {
                    self.error("26000", &format!("prepared statement \"{}\" does not exist", name));
                    self.skip_until_sync = true;
                    return true;
                };
                let mut params = (stmt.param_types.len() as i16).to_be_bytes().to_vec();
                for oid in &stmt.param_types {
                    params.extend_from_slice(&oid.as_i32().to_be_bytes());
                }
                let columns = describe(&stmt.sql, &stmt.param_types);
                self.out.extend(frame(b't', &params));
                match columns {
                    Some(columns) => self.out.extend(row_description(&columns, &[])),
                    None => self.out.extend(frame(b'n', &[])),
                }
            }
            b'B' => {
                let generation = self.shared.statement_generation.load(Ordering::SeqCst);
                if generation != self.generation {
                    self.statements.clear();
                    self.generation = generation;
                }
                let _portal = cur.cstr();
                let name = cur.cstr();
                let formats: Vec<i16> = (0..cur.i16()).map(|_| cur.i16()).collect();
                let count = cur.i16() as usize;
                let Some(stmt) = self.statements.get(&name) else {
                    self.error("26000", &format!("prepared statement \"{}\" does not exist", name));
                    self.skip_until_sync = true;
                    return true;
                };
                let mut params = Vec::with_capacity(count);
                for i in 0..count {
                    let len = cur.i32();
                    if len < 0 {
                        params.push(None);
                        continue;
                    }
                    let data = cur.bytes(len as usize);
                    let format = match formats.len() {
                        0 => 0,
                        1 => formats[0],
                        _ => formats[i],
                    };
                    let text = if format == 1 {
                        PgValue::decode_binary(stmt.param_types[i], data)
                            .unwrap()
                            .encode_text()
                    } else {
                        String::from_utf8(data.to_vec()).unwrap()
                    };
                    params.push(Some(text));
                }
                let result_formats = (0..cur.i16()).map(|_| cur.i16()).collect();
                self.portal = Some(Portal {
                    sql: stmt.sql.clone(),
                    params,
                    param_types: stmt.param_types.clone(),
                    result_formats,
                });
                self.out.extend(frame(b'2', &[]));
            }
            b'E' => {
                let Some(portal) = self.portal.take() else {
                    self.error("34000", "portal \"\" does not exist");
                    self.skip_until_sync = true;
                    return true;
                };
                let outcome = self.execute(&portal.sql, &portal.params, &portal.param_types);
                return self.emit(outcome, Some(&portal.result_formats)).await;
            }
            b'C' => {
                let _kind = cur.bytes(1);
                let name = cur.cstr();
                self.shared.record(format!("CLOSE:{}", name));
                self.statements.remove(&name);
                self.out.extend(frame(b'3', &[]));
            }
            b'S' => {
                self.skip_until_sync = false;
                self.ready();
            }
            b'H' => {}
            b'd' => {
                if let Some(buf) = self.copy_in.as_mut() {
                    buf.extend_from_slice(cur.rest());
                }
            }
            b'c' => {
                if let Some(data) = self.copy_in.take() {
                    let rows = data.iter().filter(|&&b| b == b'\n').count();
                    *self.shared.table.lock() = data;
                    self.out.extend(command_complete(&format!("COPY {}", rows)));
                    self.ready();
                }
            }
            b'f' => {
                if self.copy_in.take().is_some() {
                    let reason = cur.cstr();
                    self.shared.record(format!("COPYFAIL:{}", reason));
                    self.error("57014", &format!("COPY from stdin failed: {}", reason));
                    self.ready();
                }
            }
            b'X' => {
                self.shared.record("TERMINATE");
                return false;
            }
            _ => {
                self.error("08P01", &format!("unexpected message {:?}", tag as char));
                return false;
            }
        }
        true
    }

    async fn simple_query(&mut self, sql: &str) -> bool {
        let statements: Vec<&str> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if statements.is_empty() {
            self.out.extend(frame(b'I', &[]));
        }
        for statement in statements {
            let outcome = self.execute(statement, &[], &[]);
            let failed = matches!(outcome, Outcome::Error(..));
            let copy_in = matches!(outcome, Outcome::CopyIn);
            if !self.emit(outcome, None).await {
                return false;
            }
            if copy_in {
                // ReadyForQuery follows CopyDone / CopyFail
                return true;
            }
            if failed {
                break;
            }
        }
        self.ready();
        true
    }

    /// Write the response to one statement. `formats` is `None` for the
    /// simple protocol (RowDescription included, text results).
    async fn emit(&mut self, outcome: Outcome, formats: Option<&[i16]>) -> bool {
        match outcome {
            Outcome::Rows(columns, rows) => {
                let formats: Vec<i16> = match formats {
                    None => {
                        self.out.extend(row_description(&columns, &[]));
                        vec![0; columns.len()]
                    }
                    Some([]) => vec![0; columns.len()],
                    Some([f]) => vec![*f; columns.len()],
                    Some(f) => f.to_vec(),
                };
                let n = rows.len();
                for row in rows {
                    let mut body = (row.len() as i16).to_be_bytes().to_vec();
                    for ((value, (_, oid)), format) in row.iter().zip(&columns).zip(&formats) {
                        match value {
                            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
                            Some(text) => {
                                let data = if *format == 1 {
                                    PgValue::decode_text(*oid, text.as_bytes())
                                        .unwrap()
                                        .encode_binary()
                                } else {
                                    text.clone().into_bytes()
                                };
                                body.extend_from_slice(&(data.len() as i32).to_be_bytes());
                                body.extend_from_slice(&data);
                            }
                        }
                    }
                    self.out.extend(frame(b'D', &body));
                }
                self.out.extend(command_complete(&format!("SELECT {}", n)));
            }
            Outcome::Done(tag) => self.out.extend(command_complete(&tag)),
            Outcome::Empty => self.out.extend(frame(b'I', &[])),
            Outcome::Error(code, message) => {
                self.error(code, &message);
                if formats.is_some() {
                    self.skip_until_sync = true;
                }
            }
            Outcome::Fatal => {
                self.out.extend(error_frame(
                    "FATAL",
                    "57P01",
                    "terminating connection due to administrator command",
                ));
                return false;
            }
            Outcome::Sleep(duration) => {
                // Flush what we have so the client sees a busy backend.
                let out = std::mem::take(&mut self.out);
                let _ = self.wr.write_all(&out).await;
                tokio::select! {
                    _ = self.cancel.notified() => {
                        self.error("57014", "canceling statement due to user request");
                        if formats.is_some() {
                            self.skip_until_sync = true;
                        }
                    }
                    _ = tokio::time::sleep(duration) => {
                        if formats.is_none() {
                            let columns = vec![("pg_sleep".to_string(), Oid::TEXT)];
                            self.out.extend(row_description(&columns, &[]));
                        }
                        let mut row = 1i16.to_be_bytes().to_vec();
                        row.extend_from_slice(&0i32.to_be_bytes());
                        self.out.extend(frame(b'D', &row));
                        self.out.extend(command_complete("SELECT 1"));
                    }
                }
            }
            Outcome::CopyIn => {
                self.copy_in = Some(Vec::new());
                self.out.extend(frame(b'G', &[0, 0, 0]));
            }
            Outcome::CopyOut => {
                self.out.extend(frame(b'H', &[0, 0, 0]));
                let data = self.shared.table.lock().clone();
                let mut rows = 0;
                for line in data.split_inclusive(|&b| b == b'\n') {
                    self.out.extend(frame(b'd', line));
                    rows += 1;
                }
                self.out.extend(frame(b'c', &[]));
                self.out.extend(command_complete(&format!("COPY {}", rows)));
            }
        }
        true
    }

    fn execute(&mut self, sql: &str, params: &[Option<String>], param_types: &[Oid]) -> Outcome {
        let sql = sql.trim().trim_end_matches(';').trim();
        let upper = sql.to_ascii_uppercase();
        self.shared.record(sql);

        if sql.is_empty() {
            return Outcome::Empty;
        }
        if upper == "BEGIN" || upper.starts_with("BEGIN ") {
            self.in_tx = true;
            self.tx_failed = false;
            return Outcome::Done("BEGIN".to_string());
        }
        if upper == "COMMIT" {
            let tag = if self.tx_failed { "ROLLBACK" } else { "COMMIT" };
            self.in_tx = false;
            self.tx_failed = false;
            return Outcome::Done(tag.to_string());
        }
        if upper.starts_with("ROLLBACK TO SAVEPOINT") {
            self.tx_failed = false;
            return Outcome::Done("ROLLBACK".to_string());
        }
        if upper == "ROLLBACK" {
            self.in_tx = false;
            self.tx_failed = false;
            return Outcome::Done("ROLLBACK".to_string());
        }
        if self.tx_failed {
            return Outcome::Error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block"
                    .to_string(),
            );
        }
        if upper.starts_with("SAVEPOINT ") {
            return Outcome::Done("SAVEPOINT".to_string());
        }
        if upper.starts_with("RELEASE SAVEPOINT ") {
            return Outcome::Done("RELEASE".to_string());
        }
        if let Some(rest) = upper.strip_prefix("SELECT PG_SLEEP(") {
            let secs: f64 = rest.trim_end_matches(')').parse().unwrap_or(0.0);
            return Outcome::Sleep(Duration::from_secs_f64(secs));
        }
        if let Some(rest) = upper.strip_prefix("SELECT GENERATE_SERIES(1, ") {
            let n: i32 = rest.trim_end_matches(')').parse().unwrap_or(0);
            let rows = (1..=n).map(|i| vec![Some(i.to_string())]).collect();
            return Outcome::Rows(vec![("generate_series".to_string(), Oid::INT4)], rows);
        }
        if upper.starts_with("SELECT PG_NOTIFY(") {
            let channel = params.first().cloned().flatten().unwrap_or_default();
            let payload = params.get(1).cloned().flatten().unwrap_or_default();
            let frame = notification_frame(self.pid, &channel, &payload);
            for session in self.shared.sessions.lock().values() {
                if session.channels.contains(&channel) {
                    let _ = session.inject.send(frame.clone());
                }
            }
            return Outcome::Rows(
                vec![("pg_notify".to_string(), Oid::TEXT)],
                vec![vec![Some(String::new())]],
            );
        }
        if upper.starts_with("SELECT $1") {
            let columns = describe(sql, param_types).unwrap_or_default();
            return Outcome::Rows(columns, vec![vec![params.first().cloned().flatten()]]);
        }
        if upper == "SELECT FATAL()" {
            return Outcome::Fatal;
        }
        if upper == "SELECT N FROM COUNTER" {
            let n = self.shared.counter.load(Ordering::SeqCst);
            return Outcome::Rows(vec![("n".to_string(), Oid::INT8)], vec![vec![Some(n.to_string())]]);
        }
        if upper == "UPDATE COUNTER SET N = N + 1" {
            let failing = self
                .shared
                .fail_updates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Outcome::Error(
                    "40001",
                    "could not serialize access due to concurrent update".to_string(),
                );
            }
            self.shared.counter.fetch_add(1, Ordering::SeqCst);
            return Outcome::Done("UPDATE 1".to_string());
        }
        if upper == "INSERT INTO USERS VALUES ($1)" {
            let name = params.first().cloned().flatten().unwrap_or_default();
            if !self.shared.users.lock().insert(name.clone()) {
                return Outcome::Error(
                    "23505",
                    "duplicate key value violates unique constraint \"users_pkey\"".to_string(),
                );
            }
            return Outcome::Done("INSERT 0 1".to_string());
        }
        if upper.starts_with("LISTEN ") {
            let channel = unquote(&sql["LISTEN ".len()..]);
            if let Some(s) = self.shared.sessions.lock().get_mut(&self.pid) {
                s.channels.insert(channel);
            }
            return Outcome::Done("LISTEN".to_string());
        }
        if upper.starts_with("UNLISTEN ") {
            let channel = unquote(&sql["UNLISTEN ".len()..]);
            if let Some(s) = self.shared.sessions.lock().get_mut(&self.pid) {
                s.channels.remove(&channel);
            }
            return Outcome::Done("UNLISTEN".to_string());
        }
        if upper.starts_with("COPY ") && upper.ends_with("FROM STDIN") {
            return Outcome::CopyIn;
        }
        if upper.starts_with("COPY ") && upper.ends_with("TO STDOUT") {
            return Outcome::CopyOut;
        }
        if upper.starts_with("CREATE TABLE") {
            return Outcome::Done("CREATE TABLE".to_string());
        }
        if let Ok(n) = upper.trim_start_matches("SELECT ").parse::<i32>() {
            return Outcome::Rows(vec![("?column?".to_string(), Oid::INT4)], vec![vec![Some(n.to_string())]]);
        }
        Outcome::Error("42601", format!("syntax error at or near \"{}\"", sql))
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => s.to_string(),
    }
}

fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if let Ok(n) = sql[start..end].parse::<usize>() {
                max = max.max(n);
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    max
}

fn describe(sql: &str, param_types: &[Oid]) -> Option<Vec<(String, Oid)>> {
    let upper = sql.trim().to_ascii_uppercase();
    if upper.starts_with("SELECT $1") {
        let oid = param_types.first().copied().unwrap_or(Oid::TEXT);
        return Some(vec![("v".to_string(), oid)]);
    }
    if upper.starts_with("SELECT PG_NOTIFY(") {
        return Some(vec![("pg_notify".to_string(), Oid::TEXT)]);
    }
    if upper == "SELECT N FROM COUNTER" {
        return Some(vec![("n".to_string(), Oid::INT8)]);
    }
    None
}

fn row_description(columns: &[(String, Oid)], formats: &[i16]) -> Vec<u8> {
    let mut body = (columns.len() as i16).to_be_bytes().to_vec();
    for (i, (name, oid)) in columns.iter().enumerate() {
        cstr(&mut body, name);
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&oid.as_i32().to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&formats.get(i).copied().unwrap_or(0).to_be_bytes());
    }
    frame(b'T', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = Vec::new();
    cstr(&mut body, tag);
    frame(b'C', &body)
}
