//! LISTEN/NOTIFY support.
//!
//! A `PgListener` owns one dedicated connection, outside any pool, driven by
//! a background task. The task reads notifications off the socket and pushes
//! them into a bounded queue in arrival order. When the queue is full the
//! task stops reading, so backpressure reaches the server instead of growing
//! memory; LISTEN and UNLISTEN are still served meanwhile. If the connection drops, the task reconnects with backoff and
//! re-issues LISTEN for every channel; notifications sent during the outage
//! are lost (at-most-once delivery).

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{PgConfig, PgConnection};
use super::retry::RetryPolicy;
use crate::error::{Error, Result};

/// Capacity of the delivery queue between the reader task and the consumer.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 100;

/// An asynchronous notification from `NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Backend that sent the notification
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
    /// Arrival order within one listener, starting at 1
    pub sequence: u64,
}

impl Notification {
    pub(crate) fn new(process_id: i32, channel: String, payload: String) -> Self {
        Self {
            process_id,
            channel,
            payload,
            sequence: 0,
        }
    }
}

enum Command {
    Listen(String, oneshot::Sender<Result<()>>),
    Unlisten(String, oneshot::Sender<Result<()>>),
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Receives notifications on a dedicated connection.
pub struct PgListener {
    commands: mpsc::Sender<Command>,
    notifications: mpsc::Receiver<Notification>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PgListener {
    /// Open the dedicated connection and start the reader task.
    pub async fn connect(config: PgConfig, retry: RetryPolicy) -> Result<Self> {
        let conn = super::pool::connect_with_retry(&config, &retry).await?;
        let (command_tx, command_rx) = mpsc::channel(16);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        let worker = Worker {
            conn: Some(conn),
            config,
            retry,
            channels: BTreeSet::new(),
            commands: command_rx,
            deliveries: notify_tx,
            shutdown: shutdown.clone(),
            sequence: 0,
            parked: None,
        };
        let task = tokio::spawn(worker.run());

        Ok(Self {
            commands: command_tx,
            notifications: notify_rx,
            shutdown,
            task: Some(task),
        })
    }

    /// Start listening on `channel`. Returns once the server confirmed it.
    pub async fn listen(&self, channel: &str) -> Result<()> {
        self.command(|ack| Command::Listen(channel.to_string(), ack))
            .await
    }

    /// Stop listening on `channel`.
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        self.command(|ack| Command::Unlisten(channel.to_string(), ack))
            .await
    }

    async fn command(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(make(ack_tx))
            .await
            .map_err(|_| Error::ListenerClosed)?;
        ack_rx.await.map_err(|_| Error::ListenerClosed)?
    }

    /// Wait for the next notification.
    pub async fn receive(&mut self) -> Result<Notification> {
        self.notifications.recv().await.ok_or(Error::ListenerClosed)
    }

    /// Wait at most `timeout` for the next notification.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Notification> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Wait for the next notification unless `token` fires first. Nothing is
    /// lost on cancellation: an undelivered notification stays queued.
    pub async fn receive_with_cancel(&mut self, token: &CancellationToken) -> Result<Notification> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            n = self.receive() => n,
        }
    }

    /// A queued notification, if any, without waiting.
    pub fn try_receive(&mut self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    /// Stop the reader task and close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Connection(format!("listener task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for PgListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Reader task
// ============================================================================

struct Worker {
    conn: Option<PgConnection>,
    config: PgConfig,
    retry: RetryPolicy,
    channels: BTreeSet<String>,
    commands: mpsc::Receiver<Command>,
    deliveries: mpsc::Sender<Notification>,
    shutdown: CancellationToken,
    sequence: u64,
    /// Notification waiting for room in the delivery queue
    parked: Option<Notification>,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            if self.conn.is_none() {
                attempt += 1;
                let delay = self.retry.backoff(attempt);
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.reconnect().await {
                    Ok(conn) => {
                        tracing::info!(channels = self.channels.len(), "Listener reconnected");
                        self.conn = Some(conn);
                        attempt = 0;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Listener reconnect failed");
                    }
                }
                continue;
            }

            // Queue full: hold the socket still but keep answering commands.
            if let Some(n) = self.parked.take() {
                let deliveries = self.deliveries.clone();
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    cmd = self.commands.recv() => {
                        self.parked = Some(n);
                        let Some(cmd) = cmd else { break };
                        self.apply(cmd).await;
                    }
                    permit = deliveries.reserve() => match permit {
                        Ok(permit) => permit.send(n),
                        Err(_) => break,
                    },
                }
                continue;
            }

            let Some(conn) = self.conn.as_mut() else {
                continue;
            };
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.apply(cmd).await;
                }
                n = conn.next_notification() => match n {
                    Ok(n) => {
                        if !self.deliver(n) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Listener connection lost");
                        self.conn = None;
                    }
                },
            }
        }

        if let Some(mut conn) = self.conn.take() {
            let _ = conn.close().await;
        }
        tracing::debug!("Listener stopped");
    }

    async fn apply(&mut self, cmd: Command) {
        let (sql, ack) = match cmd {
            Command::Listen(channel, ack) => {
                let sql = format!("LISTEN {}", quote_identifier(&channel));
                self.channels.insert(channel);
                (sql, ack)
            }
            Command::Unlisten(channel, ack) => {
                let sql = format!("UNLISTEN {}", quote_identifier(&channel));
                self.channels.remove(&channel);
                (sql, ack)
            }
        };

        let res = match self.conn.as_mut() {
            Some(conn) => conn.execute(&sql, &[]).await.map(drop),
            None => Err(Error::ConnectionClosed),
        };
        if let Err(ref e) = res {
            if e.is_fatal() {
                tracing::warn!(error = %e, "Listener connection lost");
                self.conn = None;
            }
        }
        let _ = ack.send(res);
    }

    /// Queue a notification, parking it if the queue is full; false once the
    /// consumer is gone.
    fn deliver(&mut self, mut n: Notification) -> bool {
        self.sequence += 1;
        n.sequence = self.sequence;
        match self.deliveries.try_send(n) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!(
                    capacity = NOTIFICATION_QUEUE_CAPACITY,
                    "Notification queue full; pausing reads until the consumer catches up"
                );
                self.parked = Some(n);
                true
            }
        }
    }

    async fn reconnect(&mut self) -> Result<PgConnection> {
        let mut conn = PgConnection::connect_with_config(self.config.clone()).await?;
        for channel in &self.channels {
            conn.execute(&format!("LISTEN {}", quote_identifier(channel)), &[])
                .await?;
        }
        Ok(conn)
    }
}
