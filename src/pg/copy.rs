//! COPY FROM STDIN / COPY TO STDOUT streaming.
//!
//! Both directions run over the simple-query protocol and move raw bytes in
//! whatever format the COPY statement asks for; nothing here parses rows.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::connection::{rows_affected, PgConnection};
use super::protocol::{BackendMessage, CopyDataMessage, CopyDoneMessage, QueryMessage};
use crate::error::{Error, Result};

/// Bytes read from the source per CopyData message.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

impl PgConnection {
    /// Run `COPY ... FROM STDIN`, streaming `reader` to the server.
    ///
    /// Returns the row count reported by the server. If `reader` fails, the
    /// copy is aborted with CopyFail and the connection stays usable.
    pub async fn copy_from<R>(&mut self, sql: &str, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.copy_from_chunked(sql, reader, DEFAULT_CHUNK_SIZE).await
    }

    pub async fn copy_from_chunked<R>(&mut self, sql: &str, mut reader: R, chunk_size: usize) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.start_copy(sql, true).await?;

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut sent = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let reason = format!("client source failed: {}", e);
                    self.abort_copy_in(&reason).await?;
                    self.settle().await?;
                    return Err(Error::Copy(reason));
                }
            };
            self.push(&CopyDataMessage { data: &buf[..n] });
            // write_all waits on the socket, which is our backpressure
            self.flush().await?;
            sent += n as u64;
        }

        self.push(&CopyDoneMessage);
        self.flush().await?;
        tracing::debug!(bytes = sent, "COPY FROM STDIN sent");
        self.finish_copy().await
    }

    /// Run `COPY ... TO STDOUT`, streaming the server's output into `writer`.
    ///
    /// Returns the row count reported by the server. If `writer` fails, the
    /// running COPY is cancelled, the rest of its output discarded, and the
    /// connection stays usable.
    pub async fn copy_to<W>(&mut self, sql: &str, mut writer: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        self.start_copy(sql, false).await?;

        let mut tag = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::CopyData { data } => {
                    if let Err(e) = writer.write_all(&data).await {
                        return Err(self.cancel_copy_out(e).await);
                    }
                }
                BackendMessage::CopyDone => {}
                BackendMessage::CommandComplete { tag: t } => tag = Some(t),
                BackendMessage::ReadyForQuery { .. } if self.pending_ready() == 0 => break,
                BackendMessage::ReadyForQuery { .. } => {}
                BackendMessage::ErrorResponse { error } => return Err(self.recover(error).await),
                other => return Err(self.unexpected(&other)),
            }
        }
        writer.flush().await?;
        Ok(copy_count(tag.as_deref()))
    }

    /// Send the COPY statement and wait for the matching Copy*Response.
    async fn start_copy(&mut self, sql: &str, copy_in: bool) -> Result<()> {
        self.ensure_ready().await?;
        self.push(&QueryMessage { query: sql });
        self.expect_ready();
        self.flush().await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::CopyInResponse { .. } if copy_in => return Ok(()),
                BackendMessage::CopyOutResponse { .. } if !copy_in => return Ok(()),
                BackendMessage::ErrorResponse { error } => return Err(self.recover(error).await),
                BackendMessage::CopyInResponse { .. }
                | BackendMessage::CopyOutResponse { .. }
                | BackendMessage::RowDescription { .. }
                | BackendMessage::CommandComplete { .. }
                | BackendMessage::EmptyQueryResponse => {
                    self.settle().await?;
                    return Err(Error::Copy(format!(
                        "statement is not a COPY {}",
                        if copy_in { "FROM STDIN" } else { "TO STDOUT" }
                    )));
                }
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    async fn finish_copy(&mut self) -> Result<u64> {
        let mut tag = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::CommandComplete { tag: t } => tag = Some(t),
                BackendMessage::ReadyForQuery { .. } if self.pending_ready() == 0 => {
                    return Ok(copy_count(tag.as_deref()));
                }
                BackendMessage::ReadyForQuery { .. } => {}
                BackendMessage::ErrorResponse { error } => return Err(self.recover(error).await),
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    async fn cancel_copy_out(&mut self, cause: std::io::Error) -> Error {
        if let Err(e) = self.cancel_key().cancel().await {
            tracing::warn!(error = %e, "Failed to cancel COPY TO STDOUT");
        }
        if let Err(e) = self.settle().await {
            return e;
        }
        Error::Copy(format!("client sink failed: {}", cause))
    }
}

fn copy_count(tag: Option<&str>) -> u64 {
    tag.map_or(0, |t| rows_affected(t).max(0) as u64)
}
