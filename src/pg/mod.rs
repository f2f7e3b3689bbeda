//! PostgreSQL wire protocol client.
//!
//! Speaks protocol 3.0 directly over TCP:
//! - Binary parameters and results where the type allows it
//! - Prepared statements cached per connection
//! - Cancellation through CancelRequest on a side connection
//!
//! Architecture:
//! - `protocol`: Message framing, encoding and decoding
//! - `types`: Value encoding and decoding
//! - `format`: `?` / `?name` placeholder rewriting
//! - `connection`: Connection state machine, queries, row streams
//! - `statement`: Prepared statement cache
//! - `cancel`: Deadlines and server-side cancellation
//! - `pool`: Bounded connection pool
//! - `transaction`: Transactions, savepoints, retry loop
//! - `listener`: LISTEN / NOTIFY on a dedicated connection
//! - `copy`: COPY FROM STDIN / TO STDOUT

pub mod cancel;
pub mod connection;
pub mod copy;
pub mod error;
pub mod format;
pub mod listener;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod scram;
pub mod statement;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod mock;

pub use cancel::{CancelKey, CancelScope};
pub use connection::{ConnectionState, PgConfig, PgConnection, QueryResult, RowStream};
pub use error::PgError;
pub use format::{Named, NamedArgs, ToArgs};
pub use listener::{Notification, PgListener};
pub use pool::{PgPool, PgPoolConfig, PoolStats, PooledConnection};
pub use protocol::{FieldDescription, TransactionStatus};
pub use retry::RetryPolicy;
pub use statement::{PreparedStatement, SharedColumns};
pub use transaction::{Tx, TxState};
pub use types::{Oid, PgValue};
