//! gausswire: the wire-protocol core of an ADO-style driver for
//! openGauss/PostgreSQL. It covers the frontend/backend protocol engine,
//! the connector state machine with its authentication flows, a bounded
//! connection pool with multi-host selection, and an optional multiplexing
//! scheduler that shares connectors between logical command streams.

pub mod auth;
pub mod buffer;
pub mod cancellation;
pub mod config;
pub mod connector;
pub mod constants;
pub mod errors;
pub mod hosts;
pub mod interval;
pub mod lsn;
pub mod messages;
pub mod multiplexing;
pub mod pool;
pub mod replication;
pub mod stats;
pub mod tls;

pub use cancellation::CancelToken;
pub use config::{ConnectionString, SslMode, TargetSessionAttributes};
pub use connector::{Connector, ConnectorState, QueryResult, ResultStream, Row};
pub use errors::Error;
pub use interval::Interval;
pub use lsn::Lsn;
pub use messages::{Param, ServerError};
pub use multiplexing::PendingCommand;
pub use pool::{get_or_create_pool, ConnectionPool, PooledConnector};
pub use replication::{ReplicationMessage, ReplicationStream};

/// Render a chrono duration as `1d 02:03:04` for session logs.
pub fn format_duration(duration: &chrono::Duration) -> String {
    let seconds = duration.num_seconds();
    let days = seconds / 86_400;
    let hours = seconds / 3_600 % 24;
    let minutes = seconds / 60 % 60;
    let seconds = seconds % 60;
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod mock_backend;

#[cfg(test)]
mod multiplexing_test;
#[cfg(test)]
mod pool_test;
