//! The multiplexing scheduler. When enabled, commands are decoupled from
//! connectors: submitters push handles onto a bounded per-pool queue, a
//! single writer task coalesces pending commands onto whichever connector
//! it rents (up to the byte threshold), and a reader task per written
//! batch completes the handles in FIFO order, one per ReadyForQuery.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cancellation::CancelToken;
use crate::connector::{Connector, ConnectorState, QueryResult, Row};
use crate::errors::Error;
use crate::messages::backend::{BackendMessage, FieldDescription};
use crate::messages::extended::Param;
use crate::messages::ServerError;
use crate::pool::{ConnectionPool, PooledConnector};
use crate::stats::COUNTERS;

/// Submissions waiting for the writer, across all submitters of one pool.
const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// One submitted command, owned by the scheduler until completed.
pub struct CommandHandle {
    sql: String,
    params: Vec<Param>,
    cancel: CancelToken,
    tx: oneshot::Sender<Result<QueryResult, Error>>,
}

/// The caller's side of a submitted command.
#[derive(Debug)]
pub struct PendingCommand {
    rx: oneshot::Receiver<Result<QueryResult, Error>>,
    cancel: CancelToken,
}

impl PendingCommand {
    /// Cancel the command. Unwritten commands are simply removed from the
    /// queue; written ones go through the connector's cancel path.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the command to complete.
    pub async fn wait(self) -> Result<QueryResult, Error> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Broken(
                "the multiplexing scheduler dropped the command".to_string(),
            )),
        }
    }
}

impl ConnectionPool {
    /// Submit a command to the multiplexed scheduler. Awaits queue
    /// capacity when the channel is full.
    pub async fn submit(&self, sql: &str, params: Vec<Param>) -> Result<PendingCommand, Error> {
        let tx = match self.inner.mux_tx.lock().clone() {
            Some(tx) => tx,
            None => {
                return Err(Error::ConfigurationInvalid(
                    "Multiplexing is not enabled for this pool".to_string(),
                ))
            }
        };

        let cancel = CancelToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let handle = CommandHandle {
            sql: sql.to_string(),
            params,
            cancel: cancel.clone(),
            tx: done_tx,
        };

        COUNTERS.command_started();
        if tx.send(handle).await.is_err() {
            COUNTERS.command_completed();
            COUNTERS.command_failed();
            return Err(Error::Broken(
                "the multiplexing writer has stopped".to_string(),
            ));
        }
        Ok(PendingCommand { rx: done_rx, cancel })
    }
}

/// Install the command queue on the pool and spawn the writer task. Called
/// once from pool creation, inside the runtime.
pub(crate) fn start(pool: ConnectionPool) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    *pool.inner.mux_tx.lock() = Some(tx);
    tokio::spawn(writer_loop(pool, rx));
}

fn complete(handle: CommandHandle, result: Result<QueryResult, Error>) {
    COUNTERS.command_completed();
    if result.is_err() {
        COUNTERS.command_failed();
    }
    let _ = handle.tx.send(result);
}

/// The single writer: rent a connector, drain the queue into it up to the
/// coalescing threshold, flush once, and hand the batch to a reader task.
async fn writer_loop(pool: ConnectionPool, mut rx: mpsc::Receiver<CommandHandle>) {
    let threshold = pool.settings().write_coalescing_buffer_threshold_bytes;
    let none = CancelToken::none();

    while let Some(first) = rx.recv().await {
        if first.cancel.is_canceled() {
            complete(first, Err(Error::Canceled));
            continue;
        }

        let mut connector = match pool.rent(&none).await {
            Ok(connector) => connector,
            Err(err) => {
                complete(first, Err(err));
                continue;
            }
        };

        let mut batch = Vec::new();
        queue_into(&mut connector, first, &mut batch);

        while connector.write_buffer.len() < threshold {
            match rx.try_recv() {
                Ok(handle) => {
                    if handle.cancel.is_canceled() {
                        complete(handle, Err(Error::Canceled));
                        continue;
                    }
                    queue_into(&mut connector, handle, &mut batch);
                }
                Err(_) => break,
            }
        }

        if batch.is_empty() {
            continue;
        }

        let write_started = std::time::Instant::now();
        match connector.flush().await {
            Ok(()) => {
                COUNTERS.multiplexing_batch_sent(
                    batch.len() as u64,
                    write_started.elapsed().as_micros() as u64,
                );
                debug!("Multiplexed batch of {} commands written", batch.len());
                tokio::spawn(reader_task(connector, batch));
            }
            Err(err) => {
                warn!("Multiplexed batch write failed: {err}");
                for handle in batch {
                    complete(handle, Err(err.clone()));
                }
            }
        }
    }
}

fn queue_into(connector: &mut PooledConnector, handle: CommandHandle, batch: &mut Vec<CommandHandle>) {
    match connector.queue_command(&handle.sql, &handle.params) {
        Ok(()) => batch.push(handle),
        Err(err) => complete(handle, Err(err)),
    }
}

/// The reader owns the connector until every handle of its batch has been
/// completed, then returns it to the pool. A Sync-terminated batch
/// guarantees one ReadyForQuery per command.
async fn reader_task(mut connector: PooledConnector, batch: Vec<CommandHandle>) {
    let mut batch_failure: Option<Error> = None;
    for handle in batch {
        if let Some(err) = &batch_failure {
            complete(handle, Err(err.clone()));
            continue;
        }
        let result = read_one_result(&mut *connector, &handle).await;
        if result.is_err() && connector.is_broken() {
            batch_failure = Some(Error::Broken(
                "connection failed mid-batch".to_string(),
            ));
        }
        complete(handle, result);
    }
    connector.checkin().await;
}

async fn read_one_result(
    connector: &mut Connector,
    handle: &CommandHandle,
) -> Result<QueryResult, Error> {
    let deadline = Instant::now() + connector.settings().command_timeout;
    let mut fields: Option<Arc<Vec<FieldDescription>>> = None;
    let mut rows = Vec::new();
    let mut command_tag = String::new();
    let mut pending_error: Option<ServerError> = None;

    loop {
        let message = match connector.recv_within(deadline, &handle.cancel).await {
            Ok(message) => message,
            Err(Error::Canceled) => {
                return Err(connector.interrupt(Error::Canceled).await);
            }
            Err(Error::Timeout(_)) => {
                let cause = Error::Timeout("command execution".to_string());
                return Err(connector.interrupt(cause).await);
            }
            Err(err) => return Err(err),
        };

        match message {
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::ParameterDescription(_) => {}
            BackendMessage::RowDescription(f) => {
                connector.state = ConnectorState::Fetching;
                fields = Some(Arc::new(f));
            }
            BackendMessage::DataRow(values) => {
                let fields = match &fields {
                    Some(fields) => fields.clone(),
                    None => {
                        let message = "DataRow arrived before RowDescription".to_string();
                        connector.mark_broken(&message);
                        return Err(Error::ProtocolViolation(message));
                    }
                };
                rows.push(Row::new(fields, values));
            }
            BackendMessage::CommandComplete(tag) => command_tag = tag,
            BackendMessage::ErrorResponse(err) => {
                pending_error = Some(connector.redact(err));
            }
            BackendMessage::ReadyForQuery(status) => {
                connector.command_done(status);
                return match pending_error {
                    Some(err) => Err(Error::Server(err)),
                    None => Ok(QueryResult {
                        fields: fields.unwrap_or_default(),
                        rows,
                        command_tag,
                    }),
                };
            }
            other => {
                let message = format!("unexpected {} in multiplexed results", other.name());
                connector.mark_broken(&message);
                return Err(Error::ProtocolViolation(message));
            }
        }
    }
}
