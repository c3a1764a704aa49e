// Socket configuration and one-off write helpers for transient sockets.

use std::time::Duration;

use log::error;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};

use crate::config::ConnectionString;
use crate::errors::Error;

/// Apply TCP-level options from the connection string: NODELAY, OS
/// keepalive and send/receive buffer overrides.
pub fn configure_tcp_socket(stream: &TcpStream, settings: &ConnectionString) {
    let sock_ref = SockRef::from(stream);

    match sock_ref.set_nodelay(true) {
        Ok(_) => {}
        Err(err) => error!("Could not configure nodelay for socket: {err}"),
    }

    if settings.tcp_keepalive {
        let mut keepalive = TcpKeepalive::new();
        if let Some(time) = settings.tcp_keepalive_time {
            keepalive = keepalive.with_time(Duration::from_secs(time));
        }
        if let Some(interval) = settings.tcp_keepalive_interval {
            keepalive = keepalive.with_interval(Duration::from_secs(interval));
        }
        match sock_ref.set_keepalive(true) {
            Ok(_) => match sock_ref.set_tcp_keepalive(&keepalive) {
                Ok(_) => (),
                Err(err) => error!("Could not configure tcp_keepalive for socket: {err}"),
            },
            Err(err) => error!("Could not configure socket keepalive: {err}"),
        }
    }

    configure_buffers(&sock_ref, settings);
}

/// Unix sockets only take the buffer overrides.
pub fn configure_unix_socket(stream: &UnixStream, settings: &ConnectionString) {
    configure_buffers(&SockRef::from(stream), settings);
}

fn configure_buffers(sock_ref: &SockRef, settings: &ConnectionString) {
    if let Some(size) = settings.socket_receive_buffer_size {
        match sock_ref.set_recv_buffer_size(size) {
            Ok(_) => {}
            Err(err) => error!("Could not configure receive buffer size for socket: {err}"),
        }
    }
    if let Some(size) = settings.socket_send_buffer_size {
        match sock_ref.set_send_buffer_size(size) {
            Ok(_) => {}
            Err(err) => error!("Could not configure send buffer size for socket: {err}"),
        }
    }
}

/// Write a complete buffer to a transient socket and flush it.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::Broken(format!("error flushing socket: {err}"))),
        },
        Err(err) => Err(Error::Broken(format!("error writing to socket: {err}"))),
    }
}
