//! Query cancellation.
//!
//! A running query is interrupted by opening a second socket to the server
//! and sending a CancelRequest with the backend's process id and secret key.
//! The original connection keeps its socket: the query fails with SQLSTATE
//! `57014` and the session is usable afterwards.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::connection::host_port;
use super::protocol::{CancelRequestMessage, FrontendMessage};
use crate::error::{Error, Result};

/// How long to wait for an interrupted query to report back after the
/// CancelRequest has been delivered.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to cancel whatever a backend is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelKey {
    pub host: String,
    pub port: u16,
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelKey {
    pub fn addr(&self) -> String {
        host_port(&self.host, self.port)
    }

    /// Send a CancelRequest on a fresh connection.
    ///
    /// Waits for the server to close the socket, which it does once the
    /// interrupt has been signalled to the backend.
    pub async fn cancel(&self) -> Result<()> {
        let addr = self.addr();
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", addr, e)))?;

        let msg = CancelRequestMessage {
            process_id: self.process_id,
            secret_key: self.secret_key,
        };
        stream.write_all(&msg.to_bytes()).await?;
        stream.flush().await?;

        let mut buf = [0u8; 1];
        let _ = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf)).await;
        tracing::debug!(pid = self.process_id, "Sent cancel request");
        Ok(())
    }
}

/// Deadline and cancellation signal applied to every statement of a handle.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    pub timeout: Option<Duration>,
    pub token: Option<CancellationToken>,
}

impl CancelScope {
    pub fn is_unbounded(&self) -> bool {
        self.timeout.is_none() && self.token.is_none()
    }

    /// The same scope with the time spent since `started` taken off the
    /// deadline, so one operation's phases share a single budget.
    pub fn after(&self, started: Instant) -> CancelScope {
        CancelScope {
            timeout: self.timeout.map(|t| t.saturating_sub(started.elapsed())),
            token: self.token.clone(),
        }
    }

    pub async fn run<F, T>(&self, key: Option<CancelKey>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        run_cancellable(key, self.timeout, self.token.as_ref(), fut).await
    }
}

/// Run `fut` under an optional deadline and cancellation token.
///
/// When either fires first, the server-side query is cancelled through `key`
/// and `fut` is still driven to completion so the connection ends in a clean
/// state. The query's own result wins if it completed before the cancel took
/// effect; a `57014` failure is reported as [`Error::Timeout`] or
/// [`Error::Cancelled`].
pub async fn run_cancellable<F, T>(
    key: Option<CancelKey>,
    deadline: Option<Duration>,
    token: Option<&CancellationToken>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if deadline.is_none() && token.is_none() {
        return fut.await;
    }

    tokio::pin!(fut);
    let expired = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match token {
            Some(t) => t.cancelled().await,
            None => std::future::pending().await,
        }
    };

    let reason = tokio::select! {
        biased;
        res = &mut fut => return res,
        _ = cancelled => Error::Cancelled,
        _ = expired => Error::Timeout,
    };

    let Some(key) = key else {
        // Nothing to interrupt (still waiting for a connection); dropping
        // the future is enough.
        return Err(reason);
    };

    if let Err(e) = key.cancel().await {
        tracing::warn!(pid = key.process_id, error = %e, "Cancel request failed");
    }

    match tokio::time::timeout(CANCEL_GRACE, &mut fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(Error::Query(e))) if e.query_canceled() => Err(reason),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::warn!(
                pid = key.process_id,
                "Query did not stop after cancel request; abandoning connection state"
            );
            Err(reason)
        }
    }
}
