// A loopback backend speaking the server half of the protocol, for
// connector/pool/multiplexing tests. It understands just enough: startup
// with trust/MD5/SHA-256 auth, the simple and extended query protocols, a
// fixed query vocabulary, COPY both ways, and CancelRequest sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::auth::{gauss_sha256_proof, md5_hash_password};
use crate::constants::{CANCEL_REQUEST_CODE, SSL_REQUEST_CODE};
use crate::messages::types::SafeBuf;

static NEXT_PID: AtomicI32 = AtomicI32::new(4000);
static CANCEL_WAITERS: Lazy<Mutex<HashMap<i32, Arc<Notify>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockAuth {
    #[default]
    Trust,
    Md5,
    GaussSha256,
}

#[derive(Debug)]
pub struct MockConfig {
    pub auth: MockAuth,
    pub username: String,
    pub password: String,
    pub in_recovery: bool,
    pub accept_tls: bool,
    pub connections_opened: AtomicUsize,
    /// Names the client closed with Close('S'), in arrival order.
    pub closed_statements: Mutex<Vec<String>>,
}

impl Default for MockConfig {
    fn default() -> MockConfig {
        MockConfig {
            auth: MockAuth::Trust,
            username: "u".to_string(),
            password: "p".to_string(),
            in_recovery: false,
            accept_tls: false,
            connections_opened: AtomicUsize::new(0),
            closed_statements: Mutex::new(Vec::new()),
        }
    }
}

pub struct MockServer {
    pub port: u16,
    pub config: Arc<MockConfig>,
}

impl MockServer {
    pub async fn spawn(config: MockConfig) -> MockServer {
        let config = Arc::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_config = config.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let config = accept_config.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, config).await;
                });
            }
        });
        MockServer { port, config }
    }

    /// A connection string against this server with extra options appended.
    pub fn connection_string(&self, extra: &str) -> String {
        format!(
            "Host=127.0.0.1;Port={};Username={};Password={};Database=d;{extra}",
            self.port, self.config.username, self.config.password
        )
    }

    pub fn connections_opened(&self) -> usize {
        self.config.connections_opened.load(Ordering::SeqCst)
    }
}

// ---- encoding helpers (the server side of the wire) ----

fn msg(tag: u8, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(tag);
    out.put_i32(body.len() as i32 + 4);
    out.put_slice(body);
    out
}

fn auth_ok() -> BytesMut {
    msg(b'R', &0i32.to_be_bytes())
}

fn parameter_status(key: &str, value: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_slice(key.as_bytes());
    body.put_u8(0);
    body.put_slice(value.as_bytes());
    body.put_u8(0);
    msg(b'S', &body)
}

fn backend_key_data(pid: i32, secret: i32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(pid);
    body.put_i32(secret);
    msg(b'K', &body)
}

fn ready_for_query(status: u8) -> BytesMut {
    msg(b'Z', &[status])
}

fn row_description_text(names: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(names.len() as i16);
    for name in names {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_i32(0);
        body.put_i16(0);
        body.put_i32(25); // text
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);
    }
    msg(b'T', &body)
}

fn data_row(values: &[&[u8]]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        body.put_i32(value.len() as i32);
        body.put_slice(value);
    }
    msg(b'D', &body)
}

fn command_complete(tag: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_slice(tag.as_bytes());
    body.put_u8(0);
    msg(b'C', &body)
}

fn error_response(code: &str, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    for (tag, content) in [
        (b'S', "ERROR"),
        (b'V', "ERROR"),
        (b'C', code),
        (b'M', message),
        (b'D', "mock detail"),
        (b'H', "mock hint"),
    ] {
        body.put_u8(tag);
        body.put_slice(content.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    msg(b'E', &body)
}

async fn read_framed(stream: &mut BufStream<TcpStream>) -> std::io::Result<(u8, BytesMut)> {
    let tag = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    stream.read_exact(&mut body).await?;
    Ok((tag, BytesMut::from(&body[..])))
}

async fn send(stream: &mut BufStream<TcpStream>, bytes: BytesMut) -> std::io::Result<()> {
    stream.write_all(&bytes).await?;
    stream.flush().await
}

// ---- per-connection protocol loop ----

struct Session {
    stream: BufStream<TcpStream>,
    config: Arc<MockConfig>,
    pid: i32,
    // statement name -> SQL, portal SQL, and the last bound parameters
    statements: HashMap<String, String>,
    portal_sql: String,
    bind_params: Vec<Option<Vec<u8>>>,
    skip_to_sync: bool,
}

async fn handle_connection(stream: TcpStream, config: Arc<MockConfig>) -> std::io::Result<()> {
    let mut stream = BufStream::new(stream);

    // Startup packets have no tag byte; loop past SSLRequests.
    let params = loop {
        let len = stream.read_i32().await?;
        let mut payload = vec![0u8; len as usize - 4];
        stream.read_exact(&mut payload).await?;
        let mut payload = BytesMut::from(&payload[..]);
        let code = payload.try_get_i32().unwrap_or(0);
        if code == SSL_REQUEST_CODE {
            let verdict = if config.accept_tls { b"S" } else { b"N" };
            stream.write_all(verdict).await?;
            stream.flush().await?;
            continue;
        }
        if code == CANCEL_REQUEST_CODE {
            let pid = payload.try_get_i32().unwrap_or(0);
            let _secret = payload.try_get_i32().unwrap_or(0);
            let waiter = CANCEL_WAITERS.lock().get(&pid).cloned();
            if let Some(waiter) = waiter {
                // notify_one stores a permit, so a cancel that lands before
                // the query parks is not lost.
                waiter.notify_one();
            }
            return Ok(());
        }
        // protocol version 196608 followed by key\0value\0 pairs
        let mut params = HashMap::new();
        while let Ok(key) = payload.read_cstring() {
            if key.is_empty() {
                break;
            }
            let value = payload.read_cstring().unwrap_or_default();
            params.insert(key, value);
        }
        break params;
    };

    let user = params.get("user").cloned().unwrap_or_default();

    // Authentication.
    match config.auth {
        MockAuth::Trust => send(&mut stream, auth_ok()).await?,
        MockAuth::Md5 => {
            let salt = [1u8, 2, 3, 4];
            let mut body = BytesMut::new();
            body.put_i32(5);
            body.put_slice(&salt);
            send(&mut stream, msg(b'R', &body)).await?;

            let (tag, payload) = read_framed(&mut stream).await?;
            let expected = md5_hash_password(&user, &config.password, &salt);
            if tag != b'p' || payload[..] != expected[..] {
                send(
                    &mut stream,
                    error_response("28P01", "password authentication failed"),
                )
                .await?;
                return Ok(());
            }
            send(&mut stream, auth_ok()).await?;
        }
        MockAuth::GaussSha256 => {
            let salt_hex = "6d".repeat(32);
            let token = "12345678";
            let mut body = BytesMut::new();
            body.put_i32(10);
            body.put_i32(2); // sha256 stored method
            body.put_slice(salt_hex.as_bytes());
            body.put_slice(token.as_bytes());
            body.put_i32(2048);
            send(&mut stream, msg(b'R', &body)).await?;

            let (tag, payload) = read_framed(&mut stream).await?;
            let expected =
                gauss_sha256_proof(&config.password, &salt_hex, token, 2048).unwrap();
            if tag != b'p' || payload[..] != expected[..] {
                send(
                    &mut stream,
                    error_response("28P01", "password authentication failed"),
                )
                .await?;
                return Ok(());
            }
            send(&mut stream, auth_ok()).await?;
        }
    }

    config.connections_opened.fetch_add(1, Ordering::SeqCst);

    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    CANCEL_WAITERS.lock().insert(pid, Arc::new(Notify::new()));

    send(&mut stream, parameter_status("server_version", "14.5")).await?;
    send(&mut stream, parameter_status("client_encoding", "UTF8")).await?;
    send(&mut stream, parameter_status("integer_datetimes", "on")).await?;
    send(&mut stream, backend_key_data(pid, pid ^ 0x5a5a)).await?;
    send(&mut stream, ready_for_query(b'I')).await?;

    let mut session = Session {
        stream,
        config,
        pid,
        statements: HashMap::new(),
        portal_sql: String::new(),
        bind_params: Vec::new(),
        skip_to_sync: false,
    };
    let result = session.run().await;
    CANCEL_WAITERS.lock().remove(&pid);
    result
}

impl Session {
    async fn run(&mut self) -> std::io::Result<()> {
        loop {
            let (tag, mut body) = match read_framed(&mut self.stream).await {
                Ok(frame) => frame,
                Err(_) => return Ok(()),
            };

            if self.skip_to_sync && tag != b'S' && tag != b'X' {
                continue;
            }

            match tag {
                b'X' => return Ok(()),
                b'Q' => {
                    let sql = body.read_cstring().unwrap_or_default();
                    self.simple_query(&sql).await?;
                }
                b'P' => {
                    let name = body.read_cstring().unwrap_or_default();
                    let sql = body.read_cstring().unwrap_or_default();
                    self.statements.insert(name, sql);
                    send(&mut self.stream, msg(b'1', &[])).await?;
                }
                b'B' => {
                    let _portal = body.read_cstring().unwrap_or_default();
                    let statement = body.read_cstring().unwrap_or_default();
                    let nfmt = body.try_get_i16().unwrap_or(0);
                    for _ in 0..nfmt {
                        let _ = body.try_get_i16();
                    }
                    let nparams = body.try_get_i16().unwrap_or(0);
                    self.bind_params.clear();
                    for _ in 0..nparams {
                        let len = body.try_get_i32().unwrap_or(-1);
                        if len < 0 {
                            self.bind_params.push(None);
                        } else {
                            let bytes = body.try_split_to(len as usize).unwrap_or_default();
                            self.bind_params.push(Some(bytes.to_vec()));
                        }
                    }
                    self.portal_sql = self.statements.get(&statement).cloned().unwrap_or_default();
                    send(&mut self.stream, msg(b'2', &[])).await?;
                }
                b'D' => {
                    // Describe portal: emit the row description for SELECTs.
                    if self.portal_sql.to_ascii_lowercase().starts_with("select") {
                        send(&mut self.stream, row_description_text(&["?column?"])).await?;
                    } else {
                        send(&mut self.stream, msg(b'n', &[])).await?;
                    }
                }
                b'E' => {
                    let sql = self.portal_sql.clone();
                    self.execute_portal(&sql).await?;
                }
                b'C' => {
                    // Close statement
                    let _kind = body.try_get_u8();
                    let name = body.read_cstring().unwrap_or_default();
                    self.statements.remove(&name);
                    self.config.closed_statements.lock().push(name);
                    send(&mut self.stream, msg(b'3', &[])).await?;
                }
                b'S' => {
                    self.skip_to_sync = false;
                    send(&mut self.stream, ready_for_query(b'I')).await?;
                }
                b'H' => {
                    self.stream.flush().await?;
                }
                _ => {
                    // CopyData and friends outside a COPY: ignore.
                }
            }
        }
    }

    /// Responses for the fixed vocabulary the tests use.
    async fn execute_portal(&mut self, sql: &str) -> std::io::Result<()> {
        let lowered = sql.to_ascii_lowercase();
        if lowered.starts_with("error") {
            send(&mut self.stream, error_response("42601", "syntax error")).await?;
            self.skip_to_sync = true;
            return Ok(());
        }
        if lowered.starts_with("select $1") {
            let value = self
                .bind_params
                .first()
                .cloned()
                .flatten()
                .unwrap_or_default();
            send(&mut self.stream, data_row(&[&value])).await?;
            send(&mut self.stream, command_complete("SELECT 1")).await?;
            return Ok(());
        }
        if let Some(rest) = lowered.strip_prefix("select ") {
            if rest.trim().parse::<i64>().is_ok() {
                send(&mut self.stream, data_row(&[rest.trim().as_bytes()])).await?;
                send(&mut self.stream, command_complete("SELECT 1")).await?;
                return Ok(());
            }
        }
        if lowered.contains("blocking_marker") {
            self.wait_for_cancel().await?;
            self.skip_to_sync = true;
            return Ok(());
        }
        send(&mut self.stream, command_complete("SELECT 0")).await?;
        Ok(())
    }

    async fn simple_query(&mut self, sql: &str) -> std::io::Result<()> {
        let lowered = sql.to_ascii_lowercase();

        if lowered.contains("blocking_marker") {
            self.wait_for_cancel().await?;
            send(&mut self.stream, ready_for_query(b'I')).await?;
            return Ok(());
        }

        if lowered.starts_with("error") {
            send(&mut self.stream, error_response("42601", "syntax error")).await?;
            send(&mut self.stream, ready_for_query(b'I')).await?;
            return Ok(());
        }

        if lowered.starts_with("copy") && lowered.contains("from stdin") {
            return self.copy_in().await;
        }
        if lowered.starts_with("copy") && lowered.contains("to stdout") {
            return self.copy_out().await;
        }

        let one_row = |value: &str| -> Vec<BytesMut> {
            vec![
                row_description_text(&["?column?"]),
                data_row(&[value.as_bytes()]),
                command_complete("SELECT 1"),
            ]
        };

        let responses: Vec<BytesMut> = if lowered.contains("pg_is_in_recovery") {
            one_row(if self.config.in_recovery { "t" } else { "f" })
        } else if lowered.contains("transaction_read_only") {
            one_row(if self.config.in_recovery { "on" } else { "off" })
        } else if lowered.contains("pg_sleep") {
            one_row("")
        } else if lowered.starts_with("discard all") {
            self.statements.clear();
            vec![command_complete("DISCARD ALL")]
        } else if lowered.starts_with("rollback") {
            vec![command_complete("ROLLBACK")]
        } else if let Some(rest) = lowered.strip_prefix("select ") {
            if rest.trim().parse::<i64>().is_ok() {
                one_row(rest.trim())
            } else {
                vec![command_complete("SELECT 0")]
            }
        } else {
            vec![command_complete("OK")]
        };

        for response in responses {
            send(&mut self.stream, response).await?;
        }
        send(&mut self.stream, ready_for_query(b'I')).await?;
        Ok(())
    }

    /// Park until a CancelRequest for this backend arrives, then report the
    /// canceled statement.
    async fn wait_for_cancel(&mut self) -> std::io::Result<()> {
        let waiter = CANCEL_WAITERS.lock().get(&self.pid).cloned();
        if let Some(waiter) = waiter {
            waiter.notified().await;
        }
        send(
            &mut self.stream,
            error_response("57014", "canceling statement due to user request"),
        )
        .await
    }

    async fn copy_in(&mut self) -> std::io::Result<()> {
        // CopyInResponse: text format, one column.
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_i16(1);
        body.put_i16(0);
        send(&mut self.stream, msg(b'G', &body)).await?;

        let mut chunks = 0u64;
        loop {
            let (tag, _body) = read_framed(&mut self.stream).await?;
            match tag {
                b'd' => chunks += 1,
                b'c' => {
                    send(&mut self.stream, command_complete(&format!("COPY {chunks}"))).await?;
                    send(&mut self.stream, ready_for_query(b'I')).await?;
                    return Ok(());
                }
                b'f' => {
                    send(&mut self.stream, error_response("57014", "COPY failed")).await?;
                    send(&mut self.stream, ready_for_query(b'I')).await?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn copy_out(&mut self) -> std::io::Result<()> {
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_i16(1);
        body.put_i16(0);
        send(&mut self.stream, msg(b'H', &body)).await?;
        for chunk in [b"alpha\n".as_ref(), b"beta\n".as_ref()] {
            send(&mut self.stream, msg(b'd', chunk)).await?;
        }
        send(&mut self.stream, msg(b'c', &[])).await?;
        send(&mut self.stream, command_complete("COPY 2")).await?;
        send(&mut self.stream, ready_for_query(b'I')).await?;
        Ok(())
    }
}
