//! Transactions bound to one pooled connection.
//!
//! A [`Tx`] owns its [`PooledConnection`] for its whole life, so no other
//! caller can interleave statements. `commit` and `rollback` consume the
//! transaction and hand the connection back to the pool whatever the
//! outcome. A `Tx` dropped while still active (early return, `?`, panic,
//! a cancelled future) goes back to the pool dirty and the pool rolls it
//! back before reuse.

use std::collections::HashMap;

use futures::future::BoxFuture;

use super::cancel::CancelScope;
use super::connection::{QueryResult, RowStream};
use super::error::PgError;
use super::format::{format_query, ToArgs};
use super::pool::{PgPool, PooledConnection};
use super::protocol::TransactionStatus;
use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::scan::{self, FromRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// An open transaction.
pub struct Tx {
    conn: PooledConnection,
    state: TxState,
    savepoints: Vec<String>,
    next_savepoint: u32,
    scope: CancelScope,
}

impl Tx {
    /// Issue `BEGIN` on `conn`.
    pub async fn begin(conn: PooledConnection, scope: CancelScope) -> Result<Self> {
        Self::begin_with(conn, "BEGIN", scope).await
    }

    /// Issue a custom begin statement, e.g.
    /// `BEGIN ISOLATION LEVEL SERIALIZABLE`.
    pub async fn begin_with(mut conn: PooledConnection, begin: &str, scope: CancelScope) -> Result<Self> {
        let c = conn.connection()?;
        let key = c.cancel_key();
        scope.run(Some(key), c.execute(begin, &[])).await?;
        Ok(Self {
            conn,
            state: TxState::Active,
            savepoints: Vec::new(),
            next_savepoint: 0,
            scope,
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of open savepoints.
    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Run a query and collect all rows.
    pub async fn query<A: ToArgs + ?Sized>(&mut self, sql: &str, args: &A) -> Result<QueryResult> {
        let conn = self.conn.connection()?;
        let key = conn.cancel_key();
        self.scope
            .run(Some(key), conn.query_with(sql, &args.to_args()))
            .await
    }

    pub async fn query_as<T: FromRow, A: ToArgs + ?Sized>(&mut self, sql: &str, args: &A) -> Result<Vec<T>> {
        let result = self.query(sql, args).await?;
        scan::rows_as(&result.rows)
    }

    /// Exactly one row, else `NoRows` / `TooManyRows`.
    pub async fn query_one<T: FromRow, A: ToArgs + ?Sized>(&mut self, sql: &str, args: &A) -> Result<T> {
        let result = self.query(sql, args).await?;
        scan::exactly_one(&result.rows)
    }

    pub async fn query_opt<T: FromRow, A: ToArgs + ?Sized>(&mut self, sql: &str, args: &A) -> Result<Option<T>> {
        let result = self.query(sql, args).await?;
        scan::at_most_one(&result.rows)
    }

    /// Run a statement; returns the rows it affected (-1 if not applicable).
    pub async fn exec<A: ToArgs + ?Sized>(&mut self, sql: &str, args: &A) -> Result<i64> {
        let conn = self.conn.connection()?;
        let key = conn.cancel_key();
        self.scope
            .run(Some(key), conn.execute_with(sql, &args.to_args()))
            .await
    }

    /// Stream rows without buffering the result. Not subject to the handle's
    /// timeout; drop the stream to abandon the rest.
    pub async fn query_stream<A: ToArgs + ?Sized>(&mut self, sql: &str, args: &A) -> Result<RowStream<'_>> {
        let q = format_query(sql, &args.to_args())?;
        self.conn.connection()?.query_stream(&q.sql, &q.params).await
    }

    // ========================================================================
    // Savepoints
    // ========================================================================

    /// Open a savepoint and return its name.
    pub async fn savepoint(&mut self) -> Result<String> {
        self.next_savepoint += 1;
        let name = format!("pgkit_sp_{}", self.next_savepoint);
        self.exec(&format!("SAVEPOINT {}", name), &()).await?;
        self.savepoints.push(name.clone());
        Ok(name)
    }

    /// Release the innermost savepoint, keeping its changes.
    pub async fn release_savepoint(&mut self) -> Result<()> {
        let name = self.innermost_savepoint()?;
        self.exec(&format!("RELEASE SAVEPOINT {}", name), &()).await?;
        self.savepoints.pop();
        Ok(())
    }

    /// Undo everything since the innermost savepoint and close it.
    pub async fn rollback_to_savepoint(&mut self) -> Result<()> {
        let name = self.innermost_savepoint()?;
        self.exec(&format!("ROLLBACK TO SAVEPOINT {}", name), &())
            .await?;
        self.exec(&format!("RELEASE SAVEPOINT {}", name), &()).await?;
        self.savepoints.pop();
        Ok(())
    }

    fn innermost_savepoint(&self) -> Result<String> {
        self.savepoints
            .last()
            .cloned()
            .ok_or_else(|| Error::Argument("no open savepoint".to_string()))
    }

    /// Run `f` inside a savepoint: released on success, rolled back to on
    /// error. The outer transaction stays usable either way.
    pub async fn nested<T, F>(&mut self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T>>,
    {
        self.savepoint().await?;
        let depth = self.savepoints.len();
        match f(self).await {
            Ok(value) => {
                self.unwind_to(depth);
                self.release_savepoint().await?;
                Ok(value)
            }
            Err(e) => {
                self.unwind_to(depth);
                if let Err(re) = self.rollback_to_savepoint().await {
                    tracing::warn!(error = %re, "Failed to roll back to savepoint");
                }
                Err(e)
            }
        }
    }

    /// Forget savepoints the nested body opened and left dangling; releasing
    /// or rolling back to an outer savepoint destroys them on the server.
    fn unwind_to(&mut self, depth: usize) {
        self.savepoints.truncate(depth);
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Commit and release the connection.
    ///
    /// Committing a transaction that already failed rolls it back and
    /// returns SQLSTATE `25P02`.
    pub async fn commit(mut self) -> Result<()> {
        let failed = self
            .conn
            .connection()
            .map(|c| c.transaction_status() == TransactionStatus::Failed)
            .unwrap_or(false);
        let res = self.exec("COMMIT", &()).await;
        self.state = if res.is_ok() && !failed {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        res?;
        if failed {
            return Err(Error::Query(aborted_transaction()));
        }
        Ok(())
    }

    /// Roll back and release the connection.
    pub async fn rollback(mut self) -> Result<()> {
        let res = self.exec("ROLLBACK", &()).await;
        self.state = TxState::RolledBack;
        res.map(drop)
    }

    /// Access the underlying connection.
    pub fn connection(&mut self) -> &mut PooledConnection {
        &mut self.conn
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            tracing::debug!("Transaction dropped while active; connection will be rolled back");
        }
    }
}

fn aborted_transaction() -> PgError {
    let mut fields = HashMap::new();
    fields.insert(b'S', "ERROR".to_string());
    fields.insert(b'C', "25P02".to_string());
    fields.insert(
        b'M',
        "current transaction is aborted, commit rolled back".to_string(),
    );
    PgError::new(fields)
}

/// Run `f` in a transaction on a connection from `pool`.
///
/// Commits when `f` succeeds. On error the transaction is rolled back once;
/// if the error is a serialization failure or deadlock (SQLSTATE class 40)
/// the whole unit of work is retried per `policy`. Anything else is returned
/// immediately.
pub async fn run_in_transaction<T, F>(
    pool: &PgPool,
    scope: &CancelScope,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T>
where
    F: for<'t> FnMut(&'t mut Tx) -> BoxFuture<'t, Result<T>>,
{
    let mut attempt = 1;
    loop {
        let conn = pool.acquire().await?;
        let mut tx = Tx::begin(conn, scope.clone()).await?;

        let res = match f(&mut tx).await {
            Ok(value) => tx.commit().await.map(|()| value),
            Err(e) => {
                if let Err(re) = tx.rollback().await {
                    tracing::warn!(error = %re, "Rollback failed");
                }
                Err(e)
            }
        };

        match res {
            Err(e) if e.is_retryable_transaction() && policy.should_retry(attempt) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    attempt,
                    delay = ?delay,
                    code = e.sqlstate().unwrap_or_default(),
                    "Transaction conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
