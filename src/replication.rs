//! Physical/logical replication sub-protocol: START_REPLICATION moves the
//! connector into copy-both mode, after which the server streams XLogData
//! and keepalives wrapped in CopyData, and the client answers with standby
//! status updates.

use bytes::BytesMut;
use tokio::time::Instant;

use crate::cancellation::CancelToken;
use crate::connector::{Connector, ConnectorState};
use crate::errors::Error;
use crate::lsn::Lsn;
use crate::messages::backend::BackendMessage;
use crate::messages::frontend;
use crate::messages::types::SafeBuf;

/// One decoded unit of the replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    /// A WAL segment: starting position, current end of WAL, the server's
    /// clock (microseconds since the PostgreSQL epoch), and the payload.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_clock: i64,
        data: BytesMut,
    },
    /// A heartbeat; `reply_requested` asks for an immediate status update.
    PrimaryKeepAlive {
        wal_end: Lsn,
        server_clock: i64,
        reply_requested: bool,
    },
}

fn decode_replication(mut data: BytesMut) -> Result<ReplicationMessage, Error> {
    let kind = data.try_get_u8()?;
    match kind {
        b'w' => Ok(ReplicationMessage::XLogData {
            wal_start: Lsn(data.try_get_i64()? as u64),
            wal_end: Lsn(data.try_get_i64()? as u64),
            server_clock: data.try_get_i64()?,
            data,
        }),
        b'k' => {
            let wal_end = Lsn(data.try_get_i64()? as u64);
            let server_clock = data.try_get_i64()?;
            let reply_requested = data.try_get_u8()? != 0;
            Ok(ReplicationMessage::PrimaryKeepAlive {
                wal_end,
                server_clock,
                reply_requested,
            })
        }
        other => Err(Error::ProtocolViolation(format!(
            "unknown replication message kind: {:?}",
            other as char
        ))),
    }
}

impl Connector {
    /// Issue START_REPLICATION and return the stream once the server enters
    /// copy-both mode. `command` is the full START_REPLICATION statement,
    /// slot and options included.
    pub async fn start_replication<'a>(
        &'a mut self,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<ReplicationStream<'a>, Error> {
        if self.state != ConnectorState::Ready {
            return Err(self.state_error("start_replication"));
        }
        self.state = ConnectorState::Executing;
        frontend::simple_query(&mut self.write_buffer, command);
        self.flush().await?;

        let deadline = Instant::now() + self.settings().command_timeout;
        loop {
            match self.recv_within(deadline, cancel).await? {
                BackendMessage::CopyBothResponse { .. } => {
                    self.state = ConnectorState::Replication;
                    return Ok(ReplicationStream {
                        connector: self,
                        cancel: cancel.clone(),
                        done: false,
                    });
                }
                BackendMessage::ErrorResponse(err) => {
                    let err = self.redact(err);
                    self.drain_to_ready().await?;
                    return Err(Error::Server(err));
                }
                other => {
                    return Err(self.replication_protocol_error(format!(
                        "expected CopyBothResponse, got {}",
                        other.name()
                    )));
                }
            }
        }
    }

    fn state_error(&self, operation: &str) -> Error {
        match self.state {
            ConnectorState::Broken => {
                Error::Broken(format!("{operation} on a broken connection"))
            }
            state => Error::OperationInProgress(format!("{state}")),
        }
    }

    fn replication_protocol_error(&mut self, message: String) -> Error {
        self.mark_broken(&message);
        Error::ProtocolViolation(message)
    }
}

/// The copy-both stream. The connector stays in `Replication` until the
/// stream is stopped or the server ends the copy.
pub struct ReplicationStream<'a> {
    connector: &'a mut Connector,
    cancel: CancelToken,
    done: bool,
}

impl ReplicationStream<'_> {
    /// The next WAL message or keepalive. `None` once the server finished
    /// the stream and the connector returned to `Ready`.
    pub async fn next_message(&mut self) -> Result<Option<ReplicationMessage>, Error> {
        if self.done {
            return Ok(None);
        }
        let deadline = Instant::now() + self.connector.settings().command_timeout;
        loop {
            match self.connector.recv_within(deadline, &self.cancel).await? {
                BackendMessage::CopyData(data) => {
                    return decode_replication(data).map(Some);
                }
                BackendMessage::CopyDone | BackendMessage::CommandComplete(_) => continue,
                BackendMessage::ErrorResponse(err) => {
                    let err = self.connector.redact(err);
                    self.done = true;
                    self.connector.drain_to_ready().await?;
                    return Err(Error::Server(err));
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.done = true;
                    self.connector.command_done(status);
                    return Ok(None);
                }
                other => {
                    self.done = true;
                    return Err(self.connector.replication_protocol_error(format!(
                        "unexpected {} in replication stream",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Report replay progress; sent spontaneously or when a keepalive set
    /// `reply_requested`.
    pub async fn standby_status_update(
        &mut self,
        written: Lsn,
        flushed: Lsn,
        applied: Lsn,
        server_clock: i64,
        reply_requested: bool,
    ) -> Result<(), Error> {
        frontend::standby_status_update(
            &mut self.connector.write_buffer,
            written.0,
            flushed.0,
            applied.0,
            server_clock,
            reply_requested,
        );
        self.connector.flush().await
    }

    /// End the stream from the client side: CopyDone, then drain until the
    /// server hands back ReadyForQuery.
    pub async fn stop(self) -> Result<(), Error> {
        let connector = self.connector;
        frontend::copy_done(&mut connector.write_buffer);
        connector.flush().await?;
        match tokio::time::timeout(
            connector.settings().internal_command_timeout(),
            connector.drain_to_ready(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                connector.mark_broken("no response to CopyDone ending replication");
                Err(Error::Timeout("replication shutdown".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn decodes_xlog_data() {
        let mut data = BytesMut::new();
        data.put_u8(b'w');
        data.put_i64(0x16_B374D848);
        data.put_i64(0x16_B374D900);
        data.put_i64(123_456);
        data.put_slice(b"wal bytes");
        match decode_replication(data).unwrap() {
            ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                server_clock,
                data,
            } => {
                assert_eq!(wal_start.to_string(), "16/B374D848");
                assert_eq!(wal_end.to_string(), "16/B374D900");
                assert_eq!(server_clock, 123_456);
                assert_eq!(&data[..], b"wal bytes");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decodes_primary_keepalive() {
        let mut data = BytesMut::new();
        data.put_u8(b'k');
        data.put_i64(42);
        data.put_i64(7);
        data.put_u8(1);
        assert_eq!(
            decode_replication(data).unwrap(),
            ReplicationMessage::PrimaryKeepAlive {
                wal_end: Lsn(42),
                server_clock: 7,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn rejects_unknown_kinds() {
        let mut data = BytesMut::new();
        data.put_u8(b'x');
        assert!(matches!(
            decode_replication(data),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
