//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::PgError;
use super::types::{Oid, PgValue};
use crate::error::{Error, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic code sent in place of a protocol version to cancel a running query.
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Upper bound on a single backend frame; anything larger is a desync.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Parse and Bind carry parameter counts as 16-bit unsigned integers.
pub const MAX_PARAMS: usize = u16::MAX as usize;

/// Reject parameter lists the extended protocol cannot express.
pub fn check_param_count(count: usize) -> Result<()> {
    if count > MAX_PARAMS {
        return Err(Error::Argument(format!(
            "{} parameters given; the protocol allows at most {}",
            count, MAX_PARAMS
        )));
    }
    Ok(())
}

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::Protocol(format!(
                "Unknown transaction status: {:?}",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages into an outgoing buffer.
///
/// Messages append to `buf`, so several can be pipelined into one write.
pub trait FrontendMessage {
    fn encode(&self, buf: &mut BytesMut);

    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }
}

/// Write a tagged frame: tag byte, length (including itself), body.
fn frame(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

/// Write an untagged frame (startup and cancel requests).
fn untagged_frame(buf: &mut BytesMut, body: impl FnOnce(&mut BytesMut)) {
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self, buf: &mut BytesMut) {
        untagged_frame(buf, |b| {
            b.put_i32(PROTOCOL_VERSION);
            put_cstr(b, "user");
            put_cstr(b, &self.user);
            if let Some(ref db) = self.database {
                put_cstr(b, "database");
                put_cstr(b, db);
            }
            for (key, value) in &self.options {
                put_cstr(b, key);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }
}

/// Out-of-band request asking the server to cancel whatever the backend
/// identified by `process_id` is running. Sent on a fresh socket.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self, buf: &mut BytesMut) {
        untagged_frame(buf, |b| {
            b.put_i32(CANCEL_REQUEST_CODE);
            b.put_i32(self.process_id);
            b.put_i32(self.secret_key);
        });
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'p', |b| put_cstr(b, &self.password));
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'p', |b| {
            put_cstr(b, &self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(&self.data);
        });
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'p', |b| b.put_slice(&self.data));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'Q', |b| put_cstr(b, self.query));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_u16(self.param_types.len() as u16);
            for oid in self.param_types {
                b.put_i32(oid.as_i32());
            }
        });
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement.
///
/// Each parameter is sent in binary when its value type matches the
/// statement's parameter type, and in text otherwise so the server can coerce.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [PgValue],
    pub param_types: &'a [Oid],
    pub result_formats: &'a [Format],
}

impl BindMessage<'_> {
    fn param_format(&self, i: usize) -> Format {
        let value = &self.params[i];
        match self.param_types.get(i) {
            Some(oid) if *oid == value.type_oid() && value.has_binary_encoding() => Format::Binary,
            None if value.has_binary_encoding() => Format::Binary,
            _ => Format::Text,
        }
    }
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'B', |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);

            let formats: Vec<Format> = (0..self.params.len()).map(|i| self.param_format(i)).collect();
            b.put_u16(formats.len() as u16);
            for fmt in &formats {
                b.put_i16(*fmt as i16);
            }

            b.put_u16(self.params.len() as u16);
            for (param, fmt) in self.params.iter().zip(&formats) {
                if param.is_null() {
                    b.put_i32(-1);
                    continue;
                }
                let encoded = match fmt {
                    Format::Binary => param.encode_binary(),
                    Format::Text => param.encode_text().into_bytes(),
                };
                b.put_i32(encoded.len() as i32);
                b.put_slice(&encoded);
            }

            b.put_i16(self.result_formats.len() as i16);
            for fmt in self.result_formats {
                b.put_i16(*fmt as i16);
            }
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Close message ('C') - Release a prepared statement or portal on the server
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'C', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// CopyData message ('d') - one chunk of a COPY FROM STDIN stream
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(5 + self.data.len());
        frame(buf, b'd', |b| b.put_slice(self.data));
    }
}

/// CopyFail message ('f') - abort a COPY FROM STDIN with a reason
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub reason: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        frame(buf, b'f', |b| put_cstr(b, self.reason));
    }
}

macro_rules! empty_message {
    ($(#[$doc:meta])* $name:ident, $tag:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl FrontendMessage for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_u8($tag);
                buf.put_i32(4);
            }
        }
    };
}

empty_message!(
    /// Sync message ('S') - Marks end of an extended query
    SyncMessage,
    b'S'
);
empty_message!(
    /// Flush message ('H') - Request server to flush output buffer
    FlushMessage,
    b'H'
);
empty_message!(
    /// Terminate message ('X') - Close the connection
    TerminateMessage,
    b'X'
);
empty_message!(
    /// CopyDone message ('c') - End of a COPY FROM STDIN stream
    CopyDoneMessage,
    b'c'
);

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // Copy sub-protocol
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyBothResponse,
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        error: PgError,
    },
    NoticeResponse {
        notice: PgError,
    },

    // Asynchronous
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

/// Total size (tag + length + body) of the frame at the start of `buf`,
/// or `None` if the header is not complete yet.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "Invalid frame length {} for message {:?}",
            len, buf[0] as char
        )));
    }
    Ok(Some(1 + len as usize))
}

impl BackendMessage {
    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte and contain
    /// at least one complete frame.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let total = frame_len(buf)?
            .ok_or_else(|| Error::Protocol("Incomplete message header".to_string()))?;
        if buf.remaining() < total {
            return Err(Error::Protocol("Incomplete message body".to_string()));
        }

        let msg_type = buf.get_u8();
        buf.advance(4);
        let body = buf.split_to(total - 5);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: read_cstring(&mut body.clone())?,
            }),
            b'Z' => {
                let mut body = body;
                let status = TransactionStatus::try_from(get_u8(&mut body)?)?;
                Ok(BackendMessage::ReadyForQuery { status })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                error: PgError::new(read_error_fields(body)?),
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                notice: PgError::new(read_error_fields(body)?),
            }),
            b'S' => {
                let mut body = body;
                let name = read_cstring(&mut body)?;
                let value = read_cstring(&mut body)?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            b'K' => {
                let mut body = body;
                Ok(BackendMessage::BackendKeyData {
                    process_id: get_i32(&mut body)?,
                    secret_key: get_i32(&mut body)?,
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'G' => {
                let (format, column_formats) = decode_copy_response(body)?;
                Ok(BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                })
            }
            b'H' => {
                let (format, column_formats) = decode_copy_response(body)?;
                Ok(BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                })
            }
            b'W' => Ok(BackendMessage::CopyBothResponse),
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            b'A' => {
                let mut body = body;
                let process_id = get_i32(&mut body)?;
                let channel = read_cstring(&mut body)?;
                let payload = read_cstring(&mut body)?;
                Ok(BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                })
            }
            _ => Err(Error::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        let auth_type = get_i32(&mut body)?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                if body.remaining() < 4 {
                    return Err(Error::Protocol("Truncated MD5 salt".to_string()));
                }
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(Error::Auth(format!(
                "Unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        let num_fields = get_i16(&mut body)?.max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            let table_oid = get_i32(&mut body)?;
            let column_attr = get_i16(&mut body)?;
            let type_oid = Oid::from_i32(get_i32(&mut body)?);
            let type_size = get_i16(&mut body)?;
            let type_modifier = get_i32(&mut body)?;
            let format = format_from(get_i16(&mut body)?);

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        let num_cols = get_i16(&mut body)?.max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = get_i32(&mut body)?;
            if len < 0 {
                values.push(None);
            } else {
                let len = len as usize;
                if body.remaining() < len {
                    return Err(Error::Protocol("Truncated DataRow column".to_string()));
                }
                values.push(Some(body.split_to(len)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        let num_params = get_i16(&mut body)?.max(0) as usize;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(get_i32(&mut body)?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    /// Short name used in protocol error messages.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMD5Password { .. }
            | BackendMessage::AuthenticationSASL { .. }
            | BackendMessage::AuthenticationSASLContinue { .. }
            | BackendMessage::AuthenticationSASLFinal { .. } => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::CopyInResponse { .. } => "CopyInResponse",
            BackendMessage::CopyOutResponse { .. } => "CopyOutResponse",
            BackendMessage::CopyBothResponse => "CopyBothResponse",
            BackendMessage::CopyData { .. } => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn format_from(code: i16) -> Format {
    if code == 0 {
        Format::Text
    } else {
        Format::Binary
    }
}

fn decode_copy_response(mut body: Bytes) -> Result<(Format, Vec<Format>)> {
    let format = format_from(get_u8(&mut body)? as i16);
    let n = get_i16(&mut body)?.max(0) as usize;
    let mut column_formats = Vec::with_capacity(n);
    for _ in 0..n {
        column_formats.push(format_from(get_i16(&mut body)?));
    }
    Ok((format, column_formats))
}

fn truncated() -> Error {
    Error::Protocol("Truncated message body".to_string())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_i16(buf: &mut Bytes) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("Missing null terminator in string".to_string()))?;

    // Try direct UTF-8 first; fall back to lossy only if the server sent garbage.
    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
