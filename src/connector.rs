//! The connector: one physical socket, its buffers, and the protocol state
//! machine that turns command execution into correctly framed message
//! exchanges. Here we are the PostgreSQL/openGauss client.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use bytes::BytesMut;
use log::{debug, info, warn};
use lru::LruCache;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::Instant;

use crate::auth::{
    cleartext_password, gauss_sha256_proof, md5_hash_password, GssTokenProvider, ScramClient,
};
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::cancellation::CancelToken;
use crate::config::{ConnectionString, HostSpec, ServerCompatibilityMode};
use crate::constants::*;
use crate::errors::Error;
use crate::messages::backend::{
    Authentication, BackendMessage, FieldDescription, Notification, TransactionStatus,
};
use crate::messages::extended::{fingerprint, Bind, Close, Describe, Execute, Format, Param, Parse};
use crate::messages::{configure_tcp_socket, configure_unix_socket, frontend, write_all_flush};
use crate::messages::ServerError;
use crate::stats::COUNTERS;
use crate::tls;

pin_project! {
    #[project = StreamInnerProj]
    #[derive(Debug)]
    pub enum StreamInner {
        Tcp {
            #[pin]
            stream: TcpStream,
        },
        Unix {
            #[pin]
            stream: UnixStream,
        },
        Tls {
            #[pin]
            stream: tokio_native_tls::TlsStream<TcpStream>,
        },
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_flush(cx),
            StreamInnerProj::Unix { stream } => stream.poll_flush(cx),
            StreamInnerProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Unix { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl StreamInner {
    /// Best-effort synchronous write used only by Drop. TLS streams cannot
    /// write without a handshake-aware poll, so they skip the goodbye.
    fn try_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamInner::Tcp { stream } => stream.try_write(buf),
            StreamInner::Unix { stream } => stream.try_write(buf),
            StreamInner::Tls { .. } => Ok(0),
        }
    }
}

/// The connector's lifecycle. `Broken` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Closed,
    Connecting,
    Ready,
    Executing,
    Fetching,
    CopyIn,
    CopyOut,
    Broken,
    Replication,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectorState::Closed => "Closed",
            ConnectorState::Connecting => "Connecting",
            ConnectorState::Ready => "Ready",
            ConnectorState::Executing => "Executing",
            ConnectorState::Fetching => "Fetching",
            ConnectorState::CopyIn => "CopyIn",
            ConnectorState::CopyOut => "CopyOut",
            ConnectorState::Broken => "Broken",
            ConnectorState::Replication => "Replication",
        };
        write!(f, "{name}")
    }
}

static TRACKED_PARAMETERS: &[&str] = &[
    "server_version",
    "client_encoding",
    "TimeZone",
    "integer_datetimes",
    "standard_conforming_strings",
    "DateStyle",
];

/// Session parameters the server reported, kept current as ParameterStatus
/// messages arrive.
#[derive(Debug, Clone, Default)]
pub struct ServerParameters {
    parameters: HashMap<String, String>,
}

impl ServerParameters {
    /// Startup reports everything; afterwards only tracked parameters are
    /// kept current.
    pub fn set_param(&mut self, mut key: String, value: String, startup: bool) {
        // The startup packet sends uncapitalized keys but parameter status
        // packets send capitalized ones.
        if key == "timezone" {
            key = "TimeZone".to_string();
        } else if key == "datestyle" {
            key = "DateStyle".to_string();
        }
        if startup || TRACKED_PARAMETERS.contains(&key.as_str()) {
            self.parameters.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.get("server_version")
    }
}

/// A cacheable server-side prepared statement.
#[derive(Debug, Clone)]
struct PreparedStatement {
    name: String,
    #[allow(dead_code)]
    param_oids: Vec<i32>,
}

pub type NoticeHook = Arc<dyn Fn(&ServerError) + Send + Sync>;
pub type NotificationHook = Arc<dyn Fn(&Notification) + Send + Sync>;

/// One owning handle over a single physical transport.
pub struct Connector {
    settings: Arc<ConnectionString>,
    host: HostSpec,
    pub(crate) state: ConnectorState,
    pub(crate) stream: StreamInner,
    pub(crate) read_buffer: ReadBuffer,
    pub(crate) write_buffer: WriteBuffer,
    server_parameters: ServerParameters,
    process_id: i32,
    secret_key: i32,
    saw_backend_key: bool,
    transaction_status: TransactionStatus,
    statements: Option<LruCache<u64, PreparedStatement>>,
    statement_usages: HashMap<u64, u32>,
    statement_counter: u64,
    scram: Option<ScramClient>,
    gss: Option<Arc<dyn GssTokenProvider>>,
    notice_hook: Option<NoticeHook>,
    notification_hook: Option<NotificationHook>,
    command_in_flight: bool,
    pub(crate) opened_at: StdInstant,
    pub(crate) last_used: StdInstant,
    connected_at: chrono::NaiveDateTime,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("settings", &self.settings.to_string())
            .field("host", &self.host)
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .field("transaction_status", &self.transaction_status)
            .finish()
    }
}

impl std::fmt::Display for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[{}]-{}@{}:{}/{}",
            self.process_id,
            self.settings.username.as_deref().unwrap_or(""),
            self.host.host,
            self.host.port,
            self.settings.startup_database().unwrap_or(""),
        )
    }
}

impl Connector {
    /// Connect, upgrade to TLS when negotiated, run the startup and
    /// authentication sub-protocol, and return a connector in `Ready`.
    pub async fn open(
        settings: Arc<ConnectionString>,
        host: HostSpec,
        gss: Option<Arc<dyn GssTokenProvider>>,
        cancel: &CancelToken,
    ) -> Result<Connector, Error> {
        let deadline = Instant::now() + settings.timeout;
        tokio::select! {
            biased;
            _ = cancel.canceled() => Err(Error::Canceled),
            result = tokio::time::timeout_at(deadline, Self::open_inner(settings, host, gss)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout("connection open".to_string())),
                }
            }
        }
    }

    async fn open_inner(
        settings: Arc<ConnectionString>,
        host: HostSpec,
        gss: Option<Arc<dyn GssTokenProvider>>,
    ) -> Result<Connector, Error> {
        let stream = Self::connect_stream(&settings, &host).await?;

        let mut connector = Connector {
            read_buffer: ReadBuffer::new(settings.read_buffer_size),
            write_buffer: WriteBuffer::new(settings.write_buffer_size),
            settings,
            host,
            state: ConnectorState::Connecting,
            stream,
            server_parameters: ServerParameters::default(),
            process_id: 0,
            secret_key: 0,
            saw_backend_key: false,
            transaction_status: TransactionStatus::Idle,
            statements: None,
            statement_usages: HashMap::new(),
            statement_counter: 0,
            scram: None,
            gss,
            notice_hook: None,
            notification_hook: None,
            command_in_flight: false,
            opened_at: StdInstant::now(),
            last_used: StdInstant::now(),
            connected_at: chrono::offset::Utc::now().naive_utc(),
        };
        connector.statements = match connector.settings.max_auto_prepare {
            0 => None,
            size => Some(LruCache::new(NonZeroUsize::new(size).unwrap())),
        };

        connector.startup().await?;
        Ok(connector)
    }

    async fn connect_stream(
        settings: &ConnectionString,
        host: &HostSpec,
    ) -> Result<StreamInner, Error> {
        if host.is_unix() {
            let path = host.unix_socket_path();
            let stream = match UnixStream::connect(&path).await {
                Ok(stream) => stream,
                Err(err) => {
                    return Err(Error::ConnectionFailed(format!(
                        "could not connect to {path:?}: {err}"
                    )))
                }
            };
            configure_unix_socket(&stream, settings);
            return Ok(StreamInner::Unix { stream });
        }

        let endpoint = format!("{}:{}", host.host, host.port);
        let mut stream = match TcpStream::connect(&endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                return Err(Error::ConnectionFailed(format!(
                    "could not connect to {endpoint}: {err}"
                )))
            }
        };
        configure_tcp_socket(&stream, settings);

        if !settings.ssl_mode.negotiates() {
            return Ok(StreamInner::Tcp { stream });
        }

        // SSLRequest, then a single-byte verdict.
        write_all_flush(&mut stream, &frontend::ssl_request()).await?;
        let verdict = match stream.read_u8().await {
            Ok(verdict) => verdict as char,
            Err(err) => {
                return Err(Error::ConnectionFailed(format!(
                    "no response to SSLRequest: {err}"
                )))
            }
        };

        match verdict {
            'S' => {
                let connector = tls::build_connector(settings)?;
                match connector.connect(&host.host, stream).await {
                    Ok(stream) => Ok(StreamInner::Tls { stream }),
                    Err(err) => Err(Error::ConnectionFailed(format!(
                        "TLS handshake with {endpoint} failed: {err}"
                    ))),
                }
            }
            'N' => {
                if settings.ssl_mode.required() {
                    Err(Error::ConnectionFailed(format!(
                        "server {endpoint} refused TLS but SslMode={} requires it",
                        settings.ssl_mode
                    )))
                } else {
                    Ok(StreamInner::Tcp { stream })
                }
            }
            other => Err(Error::ConnectionFailed(format!(
                "unexpected response to SSLRequest: {other:?}"
            ))),
        }
    }

    /// The startup exchange: StartupMessage, authentication, parameter
    /// reports, BackendKeyData, trailing ReadyForQuery.
    async fn startup(&mut self) -> Result<(), Error> {
        let username = match self.settings.username.clone() {
            Some(username) => username,
            None => {
                return Err(Error::ConfigurationInvalid(
                    "Username is required to open a connection".to_string(),
                ))
            }
        };
        let database = self.settings.startup_database().unwrap_or("").to_string();

        let mut parameters: Vec<(&str, &str)> = vec![("user", &username), ("database", &database)];
        let encoding = self.settings.client_encoding.as_deref().unwrap_or("UTF8");
        parameters.push(("client_encoding", encoding));
        if let Some(name) = self.settings.application_name.as_deref() {
            parameters.push(("application_name", name));
        }
        if let Some(path) = self.settings.search_path.as_deref() {
            parameters.push(("search_path", path));
        }
        if let Some(tz) = self.settings.timezone.as_deref() {
            parameters.push(("TimeZone", tz));
        }
        if let Some(options) = self.settings.options.as_deref() {
            parameters.push(("options", options));
        }

        frontend::startup(&mut self.write_buffer, &parameters);
        self.flush().await?;

        loop {
            match self.recv().await? {
                BackendMessage::Authentication(auth) => {
                    self.authenticate(auth, &username).await?;
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                    self.saw_backend_key = true;
                }
                BackendMessage::ReadyForQuery(status) => {
                    // The cancellation key must arrive before the first
                    // ReadyForQuery or out-of-band cancel can never work.
                    if !self.saw_backend_key {
                        return Err(self.broken_protocol(
                            "ReadyForQuery arrived before BackendKeyData".to_string(),
                        ));
                    }
                    self.transaction_status = status;
                    self.scram = None;
                    self.state = ConnectorState::Ready;
                    info!("Connected {self}");
                    self.verify_server_compatibility()?;
                    return Ok(());
                }
                BackendMessage::ErrorResponse(err) => {
                    return Err(Self::map_startup_error(err));
                }
                other => {
                    return Err(self.broken_protocol(format!(
                        "unexpected {} during startup",
                        other.name()
                    )));
                }
            }
        }
    }

    fn map_startup_error(err: ServerError) -> Error {
        // Class 28 is invalid_authorization_specification.
        if err.code.starts_with("28") {
            Error::AuthenticationFailed(err.message)
        } else {
            Error::ConnectionFailed(format!("{err}"))
        }
    }

    /// Binary datetime framing depends on `integer_datetimes=on`; servers
    /// that never report it (Redshift, catalog-less deployments) opt out
    /// through ServerCompatibilityMode.
    fn verify_server_compatibility(&mut self) -> Result<(), Error> {
        match self.settings.server_compatibility_mode {
            ServerCompatibilityMode::None => {
                if let Some(value) = self.server_parameters.get("integer_datetimes") {
                    if value != "on" {
                        return Err(Error::ConnectionFailed(format!(
                            "server reports integer_datetimes={value}; only binary integer \
                             datetimes are supported"
                        )));
                    }
                }
                Ok(())
            }
            ServerCompatibilityMode::Redshift | ServerCompatibilityMode::NoTypeLoading => Ok(()),
        }
    }

    async fn authenticate(&mut self, auth: Authentication, username: &str) -> Result<(), Error> {
        match auth {
            Authentication::Ok => {
                self.scram = None;
                Ok(())
            }
            Authentication::CleartextPassword => {
                let password = self.require_password()?;
                frontend::password_message(&mut self.write_buffer, &cleartext_password(&password));
                self.flush().await
            }
            Authentication::Md5Password { salt } => {
                let password = self.require_password()?;
                let payload = md5_hash_password(username, &password, &salt);
                frontend::password_message(&mut self.write_buffer, &payload);
                self.flush().await
            }
            Authentication::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(Error::AuthenticationFailed(format!(
                        "server offered no supported SASL mechanism: {mechanisms:?}"
                    )));
                }
                let password = self.require_password()?;
                let scram = ScramClient::new(&password);
                let initial = scram.client_first();
                self.scram = Some(scram);
                frontend::sasl_initial_response(&mut self.write_buffer, SCRAM_SHA_256, &initial);
                self.flush().await
            }
            Authentication::SaslContinue { data } => {
                let scram = self.scram.as_mut().ok_or_else(|| {
                    Error::ProtocolViolation(
                        "SASL continuation outside an exchange".to_string(),
                    )
                })?;
                let response = scram.client_final(&data)?;
                frontend::sasl_response(&mut self.write_buffer, &response);
                self.flush().await
            }
            Authentication::SaslFinal { data } => {
                let scram = self.scram.as_ref().ok_or_else(|| {
                    Error::ProtocolViolation("SASL final outside an exchange".to_string())
                })?;
                scram.verify_server_final(&data)
            }
            Authentication::GaussSha256 {
                method,
                salt,
                token,
                iteration,
            } => {
                let password = self.require_password()?;
                match method {
                    GAUSS_METHOD_SHA256 => {
                        let proof = gauss_sha256_proof(&password, &salt, &token, iteration)?;
                        frontend::password_message(&mut self.write_buffer, &proof);
                        self.flush().await
                    }
                    GAUSS_METHOD_PLAIN => {
                        frontend::password_message(
                            &mut self.write_buffer,
                            &cleartext_password(&password),
                        );
                        self.flush().await
                    }
                    _ => Err(Error::AuthenticationFailed(format!(
                        "unsupported openGauss password stored method: {method}"
                    ))),
                }
            }
            Authentication::Gss | Authentication::Sspi => {
                let provider = self.gss.clone().ok_or_else(|| {
                    Error::AuthenticationFailed(
                        "server wants GSS authentication but no token provider is configured"
                            .to_string(),
                    )
                })?;
                let token = provider.initial_token(&format!("POSTGRES/{}", self.host.host))?;
                frontend::password_message(&mut self.write_buffer, &token);
                self.flush().await
            }
            Authentication::GssContinue { data } => {
                let provider = self.gss.clone().ok_or_else(|| {
                    Error::ProtocolViolation("GSS continuation outside an exchange".to_string())
                })?;
                if let Some(token) = provider.continue_token(&data)? {
                    frontend::password_message(&mut self.write_buffer, &token);
                    self.flush().await?;
                }
                Ok(())
            }
        }
    }

    fn require_password(&self) -> Result<String, Error> {
        self.settings.resolve_password(&self.host).ok_or_else(|| {
            Error::AuthenticationFailed("no password configured".to_string())
        })
    }

    /// Read one framed message off the wire.
    async fn read_message(&mut self) -> Result<BackendMessage, Error> {
        if let Err(err) = self.read_buffer.ensure(&mut self.stream, 5).await {
            self.mark_broken(&err.to_string());
            return Err(err);
        }
        let tag = self.read_buffer.read_byte()?;
        let len = self.read_buffer.read_i32()?;
        if len < 4 || len > MAX_MESSAGE_SIZE {
            return Err(self.broken_protocol(format!(
                "message {:?} declared an invalid length: {len}",
                tag as char
            )));
        }
        let body_len = (len - 4) as usize;
        if let Err(err) = self.read_buffer.ensure(&mut self.stream, body_len).await {
            self.mark_broken(&err.to_string());
            return Err(err);
        }
        let body = BytesMut::from(self.read_buffer.read_bytes(body_len)?);
        COUNTERS.bytes_received_add(5 + body_len as u64);

        match BackendMessage::decode(tag, body) {
            Ok(message) => {
                self.last_used = StdInstant::now();
                Ok(message)
            }
            Err(err) => {
                self.mark_broken(&err.to_string());
                Err(err)
            }
        }
    }

    /// Read the next message that is not an asynchronous report.
    /// ParameterStatus updates connector state and notices/notifications go
    /// to their subscribers before anything else is surfaced.
    pub(crate) async fn recv(&mut self) -> Result<BackendMessage, Error> {
        loop {
            match self.read_message().await? {
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_parameters.set_param(name, value, false);
                }
                BackendMessage::NoticeResponse(notice) => {
                    if let Some(hook) = &self.notice_hook {
                        hook(&notice);
                    } else {
                        debug!("Notice from {self}: {notice}");
                    }
                }
                BackendMessage::NotificationResponse(notification) => {
                    if let Some(hook) = &self.notification_hook {
                        hook(&notification);
                    }
                }
                other => return Ok(other),
            }
        }
    }

    pub(crate) async fn recv_within(
        &mut self,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<BackendMessage, Error> {
        tokio::select! {
            biased;
            _ = cancel.canceled() => Err(Error::Canceled),
            result = tokio::time::timeout_at(deadline, self.recv()) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("command completion".to_string())),
            },
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        let queued = self.write_buffer.len() as u64;
        match self.write_buffer.flush(&mut self.stream).await {
            Ok(()) => {
                COUNTERS.bytes_sent_add(queued);
                self.last_used = StdInstant::now();
                Ok(())
            }
            Err(err) => {
                self.mark_broken(&err.to_string());
                Err(err)
            }
        }
    }

    /// Queue the messages for one command without flushing. Chooses between
    /// the simple and extended protocol and maintains the auto-prepare LRU;
    /// an evicted statement is closed on the wire in the same batch.
    pub(crate) fn queue_command(&mut self, sql: &str, params: &[Param]) -> Result<(), Error> {
        if params.is_empty() && self.settings.max_auto_prepare == 0 {
            frontend::simple_query(&mut self.write_buffer, sql);
            return Ok(());
        }

        let oids: Vec<i32> = params.iter().map(|p| p.oid).collect();
        let key = fingerprint(sql, params);

        let mut statement_name = String::new();
        let mut needs_parse = true;
        let mut close_victim = None;

        if let Some(statements) = &mut self.statements {
            if let Some(prepared) = statements.get(&key) {
                statement_name = prepared.name.clone();
                needs_parse = false;
                COUNTERS.command_was_prepared();
            } else {
                let usages = self.statement_usages.entry(key).or_insert(0);
                *usages += 1;
                if *usages >= self.settings.auto_prepare_min_usages {
                    self.statement_usages.remove(&key);
                    self.statement_counter += 1;
                    let name = format!("{AUTO_PREPARED_PREFIX}{}", self.statement_counter);
                    if let Some((evicted_key, evicted)) = statements.push(
                        key,
                        PreparedStatement {
                            name: name.clone(),
                            param_oids: oids.clone(),
                        },
                    ) {
                        if evicted_key != key {
                            close_victim = Some(evicted.name);
                        }
                    }
                    statement_name = name;
                }
            }
        }

        if needs_parse {
            Parse {
                name: &statement_name,
                query: sql,
                param_oids: &oids,
            }
            .encode(&mut self.write_buffer);
        }
        Bind {
            portal: "",
            statement: &statement_name,
            params,
            result_format: Format::Text,
        }
        .encode(&mut self.write_buffer);
        Describe::portal("").encode(&mut self.write_buffer);
        Execute {
            portal: "",
            max_rows: 0,
        }
        .encode(&mut self.write_buffer);
        if let Some(victim) = close_victim {
            debug!("Closing evicted prepared statement {victim} on {self}");
            Close { name: &victim }.encode(&mut self.write_buffer);
        }
        // A command-level error makes the server swallow everything up to
        // the next Sync, so every batch ends with one.
        frontend::sync(&mut self.write_buffer);
        Ok(())
    }

    fn check_ready(&self, operation: &str) -> Result<(), Error> {
        match self.state {
            ConnectorState::Ready => Ok(()),
            ConnectorState::Broken => {
                Err(Error::Broken(format!("{operation} on a broken connection")))
            }
            state => Err(Error::OperationInProgress(format!("{state}"))),
        }
    }

    /// Execute a command and surface its results as a forward-only cursor.
    pub async fn execute<'a>(
        &'a mut self,
        sql: &str,
        params: &[Param],
        cancel: &CancelToken,
    ) -> Result<ResultStream<'a>, Error> {
        self.check_ready("execute")?;
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        if self.settings.log_parameters && !params.is_empty() {
            debug!("Executing on {self}: {sql} with {params:?}");
        } else {
            debug!("Executing on {self}: {sql}");
        }

        COUNTERS.command_started();
        self.command_in_flight = true;
        self.state = ConnectorState::Executing;
        self.queue_command(sql, params)?;

        let deadline = Instant::now() + self.settings.command_timeout;
        if let Err(err) = self.flush().await {
            self.fail_command();
            return Err(err);
        }

        Ok(ResultStream {
            connector: self,
            deadline,
            cancel: cancel.clone(),
            fields: None,
            command_tag: None,
            pending_error: None,
            finished: false,
        })
    }

    /// Simple-protocol query under the internal timeout, returning the
    /// first column of the first row. Used for reset, keepalive probes and
    /// host-role checks; never touches the statement cache or counters.
    pub(crate) async fn internal_query(&mut self, sql: &str) -> Result<Option<BytesMut>, Error> {
        self.check_ready("internal query")?;
        self.state = ConnectorState::Executing;
        frontend::simple_query(&mut self.write_buffer, sql);
        self.flush().await?;

        let deadline = Instant::now() + self.settings.internal_command_timeout();
        let none = CancelToken::none();
        let mut first: Option<BytesMut> = None;
        let mut pending_error: Option<ServerError> = None;
        loop {
            match self.recv_within(deadline, &none).await {
                Ok(BackendMessage::RowDescription(_)) => {
                    self.state = ConnectorState::Fetching;
                }
                Ok(BackendMessage::DataRow(values)) => {
                    if first.is_none() {
                        first = values.into_iter().next().flatten();
                    }
                }
                Ok(BackendMessage::CommandComplete(_))
                | Ok(BackendMessage::EmptyQueryResponse) => {}
                Ok(BackendMessage::ErrorResponse(err)) => {
                    pending_error = Some(err);
                }
                Ok(BackendMessage::ReadyForQuery(status)) => {
                    self.transaction_status = status;
                    self.state = ConnectorState::Ready;
                    return match pending_error {
                        Some(err) => Err(Error::Server(self.redact(err))),
                        None => Ok(first),
                    };
                }
                Ok(other) => {
                    return Err(self.broken_protocol(format!(
                        "unexpected {} in internal query",
                        other.name()
                    )));
                }
                Err(Error::Timeout(_)) => {
                    self.mark_broken("internal query timed out");
                    return Err(Error::Timeout("internal query".to_string()));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Application-level ping after `KeepAlive` seconds of idleness: a bare
    /// Sync costs one ReadyForQuery round trip.
    pub async fn keepalive(&mut self) -> Result<(), Error> {
        self.check_ready("keepalive")?;
        self.state = ConnectorState::Executing;
        frontend::sync(&mut self.write_buffer);
        self.flush().await?;

        let deadline = Instant::now() + self.settings.internal_command_timeout();
        let none = CancelToken::none();
        loop {
            match self.recv_within(deadline, &none).await {
                Ok(BackendMessage::ReadyForQuery(status)) => {
                    self.transaction_status = status;
                    self.state = ConnectorState::Ready;
                    return Ok(());
                }
                Ok(other) => {
                    return Err(self.broken_protocol(format!(
                        "unexpected {} in keepalive",
                        other.name()
                    )));
                }
                Err(err) => {
                    self.mark_broken(&err.to_string());
                    return Err(err);
                }
            }
        }
    }

    /// Clear session state before the connector goes back to the pool.
    pub async fn reset(&mut self) -> Result<(), Error> {
        if self.settings.no_reset_on_close {
            return Ok(());
        }
        if self.transaction_status != TransactionStatus::Idle {
            self.internal_query("ROLLBACK").await?;
        }
        self.internal_query("DISCARD ALL").await?;
        // DISCARD ALL deallocated every named statement server-side.
        if let Some(statements) = &mut self.statements {
            statements.clear();
        }
        self.statement_usages.clear();
        Ok(())
    }

    /// Send Terminate and close the socket.
    pub async fn terminate(mut self) {
        if matches!(self.state, ConnectorState::Broken | ConnectorState::Closed) {
            return;
        }
        frontend::terminate(&mut self.write_buffer);
        let _ = self.flush().await;
        self.state = ConnectorState::Closed;
    }

    /// The (PID, secret) pair for out-of-band cancellation.
    pub fn backend_key(&self) -> (i32, i32) {
        (self.process_id, self.secret_key)
    }

    /// Open a transient socket to the same host and fire a CancelRequest.
    /// Best effort: the server may have finished the command already.
    pub async fn send_cancel_request(&self) -> Result<(), Error> {
        Self::cancel_request_to(&self.host, self.process_id, self.secret_key, &self.settings)
            .await
    }

    pub(crate) async fn cancel_request_to(
        host: &HostSpec,
        process_id: i32,
        secret_key: i32,
        settings: &ConnectionString,
    ) -> Result<(), Error> {
        warn!(
            "Sending CancelRequest to [{}] {}:{}",
            process_id, host.host, host.port
        );
        let bytes = frontend::cancel_request(process_id, secret_key);
        let connect_and_send = async {
            if host.is_unix() {
                let mut stream = UnixStream::connect(&host.unix_socket_path())
                    .await
                    .map_err(|err| {
                        Error::ConnectionFailed(format!("cancel socket: {err}"))
                    })?;
                write_all_flush(&mut stream, &bytes).await
            } else {
                let mut stream = TcpStream::connect((host.host.as_str(), host.port))
                    .await
                    .map_err(|err| {
                        Error::ConnectionFailed(format!("cancel socket: {err}"))
                    })?;
                write_all_flush(&mut stream, &bytes).await
            }
        };
        match tokio::time::timeout(settings.timeout, connect_and_send).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("cancel request".to_string())),
        }
    }

    /// Caller-initiated interruption of the in-flight command: fire the
    /// out-of-band cancel, then wait up to `CancellationTimeout` for the
    /// server to terminate the command. `-1` skips the wait and breaks the
    /// connector immediately; `0` waits forever.
    pub(crate) async fn interrupt(&mut self, cause: Error) -> Error {
        if let Err(err) = self.send_cancel_request().await {
            warn!("CancelRequest for {self} failed: {err}");
        }
        match self.settings.cancellation_timeout_ms {
            -1 => {
                self.mark_broken("canceled without awaiting server acknowledgment");
                cause
            }
            0 => {
                if let Err(err) = self.drain_to_ready().await {
                    warn!("Draining {self} after cancel failed: {err}");
                }
                cause
            }
            ms => {
                let wait = std::time::Duration::from_millis(ms as u64);
                match tokio::time::timeout(wait, self.drain_to_ready()).await {
                    Ok(Ok(())) => cause,
                    Ok(Err(_)) => cause,
                    Err(_) => {
                        self.mark_broken(
                            "no server response to CancelRequest within CancellationTimeout",
                        );
                        cause
                    }
                }
            }
        }
    }

    /// Consume messages until ReadyForQuery so the connector is usable
    /// again. Required even after errors and cancellations.
    pub(crate) async fn drain_to_ready(&mut self) -> Result<(), Error> {
        loop {
            match self.recv().await? {
                BackendMessage::ReadyForQuery(status) => {
                    self.command_done(status);
                    return Ok(());
                }
                _ => continue,
            }
        }
    }

    pub(crate) fn command_done(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        self.state = ConnectorState::Ready;
        self.last_used = StdInstant::now();
        if self.command_in_flight {
            self.command_in_flight = false;
            COUNTERS.command_completed();
        }
    }

    pub(crate) fn fail_command(&mut self) {
        if self.command_in_flight {
            self.command_in_flight = false;
            COUNTERS.command_completed();
            COUNTERS.command_failed();
        }
    }

    pub fn mark_broken(&mut self, reason: &str) {
        if self.state != ConnectorState::Broken {
            log::error!("Connection {self} marked broken, reason: {reason}");
            self.state = ConnectorState::Broken;
        }
    }

    fn broken_protocol(&mut self, message: String) -> Error {
        self.mark_broken(&message);
        Error::ProtocolViolation(message)
    }

    pub(crate) fn redact(&self, err: ServerError) -> ServerError {
        if self.settings.include_error_detail {
            err
        } else {
            err.without_detail()
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectorState::Broken
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectorState::Ready
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn server_parameters(&self) -> &ServerParameters {
        &self.server_parameters
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub(crate) fn settings(&self) -> &Arc<ConnectionString> {
        &self.settings
    }

    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    /// Subscribe to NoticeResponse deliveries.
    pub fn set_notice_hook(&mut self, hook: NoticeHook) {
        self.notice_hook = Some(hook);
    }

    /// Subscribe to NotificationResponse deliveries.
    pub fn set_notification_hook(&mut self, hook: NotificationHook) {
        self.notification_hook = Some(hook);
    }

    /// Start a COPY ... FROM STDIN and hand back the sink.
    pub async fn copy_in<'a>(
        &'a mut self,
        sql: &str,
        cancel: &CancelToken,
    ) -> Result<CopyInSink<'a>, Error> {
        self.check_ready("copy_in")?;
        self.state = ConnectorState::Executing;
        frontend::simple_query(&mut self.write_buffer, sql);
        self.flush().await?;

        let deadline = Instant::now() + self.settings.command_timeout;
        loop {
            match self.recv_within(deadline, cancel).await? {
                BackendMessage::CopyInResponse { .. } => {
                    self.state = ConnectorState::CopyIn;
                    return Ok(CopyInSink { connector: self });
                }
                BackendMessage::ErrorResponse(err) => {
                    let err = self.redact(err);
                    self.drain_to_ready().await?;
                    return Err(Error::Server(err));
                }
                other => {
                    return Err(self.broken_protocol(format!(
                        "expected CopyInResponse, got {}",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Start a COPY ... TO STDOUT and stream the data chunks.
    pub async fn copy_out<'a>(
        &'a mut self,
        sql: &str,
        cancel: &CancelToken,
    ) -> Result<CopyOutStream<'a>, Error> {
        self.check_ready("copy_out")?;
        self.state = ConnectorState::Executing;
        frontend::simple_query(&mut self.write_buffer, sql);
        self.flush().await?;

        let deadline = Instant::now() + self.settings.command_timeout;
        loop {
            match self.recv_within(deadline, cancel).await? {
                BackendMessage::CopyOutResponse { .. } => {
                    self.state = ConnectorState::CopyOut;
                    return Ok(CopyOutStream {
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
                    return Err(self.broken_protocol(format!(
                        "expected CopyOutResponse, got {}",
                        other.name()
                    )));
                }
            }
        }
    }
}

impl Drop for Connector {
    /// Best-effort clean shutdown; the socket is non-blocking so the write
    /// may not land.
    fn drop(&mut self) {
        if !matches!(self.state, ConnectorState::Broken | ConnectorState::Closed) {
            match self.stream.try_write(&frontend::terminate_bytes()) {
                Ok(5) => (),
                Err(err) => warn!("Dirty shutdown of {self}: {err}"),
                _ => warn!("Dirty shutdown of {self}"),
            }
        }

        let duration = chrono::offset::Utc::now().naive_utc() - self.connected_at;
        let message = if self.state == ConnectorState::Broken {
            "Connection terminated"
        } else {
            "Connection closed"
        };
        info!(
            "{} {}, session duration: {}",
            message,
            self,
            crate::format_duration(&duration)
        );
    }
}

/// One result row. Values stay as the opaque bytes the server sent; type
/// decoding belongs to the caller's type handlers.
#[derive(Debug, Clone)]
pub struct Row {
    fields: Arc<Vec<FieldDescription>>,
    values: Vec<Option<BytesMut>>,
}

impl Row {
    pub(crate) fn new(fields: Arc<Vec<FieldDescription>>, values: Vec<Option<BytesMut>>) -> Row {
        Row { fields, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    pub fn field(&self, index: usize) -> Option<&FieldDescription> {
        self.fields.get(index)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Convenience accessor for text-format results.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

/// A fully drained result, used by the multiplexing path where rows cannot
/// be surfaced lazily.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub fields: Arc<Vec<FieldDescription>>,
    pub rows: Vec<Row>,
    pub command_tag: String,
}

/// Forward-only cursor over one command's results. Rows are surfaced
/// lazily; the stream always drains to ReadyForQuery before the connector
/// becomes available again, even on error or cancellation.
pub struct ResultStream<'a> {
    connector: &'a mut Connector,
    deadline: Instant,
    cancel: CancelToken,
    fields: Option<Arc<Vec<FieldDescription>>>,
    command_tag: Option<String>,
    pending_error: Option<ServerError>,
    finished: bool,
}

impl ResultStream<'_> {
    /// The row descriptor, available after the first row (or completion for
    /// row-less commands).
    pub fn fields(&self) -> Option<&Arc<Vec<FieldDescription>>> {
        self.fields.as_ref()
    }

    /// The CommandComplete tag, available once the stream finished.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// The next row, or `None` once the command completed.
    pub async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let message = match self
                .connector
                .recv_within(self.deadline, &self.cancel)
                .await
            {
                Ok(message) => message,
                Err(Error::Canceled) => {
                    self.finished = true;
                    self.connector.fail_command();
                    return Err(self.connector.interrupt(Error::Canceled).await);
                }
                Err(Error::Timeout(_)) => {
                    self.finished = true;
                    self.connector.fail_command();
                    let cause = Error::Timeout("command execution".to_string());
                    return Err(self.connector.interrupt(cause).await);
                }
                Err(err) => {
                    self.finished = true;
                    self.connector.fail_command();
                    return Err(err);
                }
            };

            match message {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData
                | BackendMessage::PortalSuspended
                | BackendMessage::EmptyQueryResponse
                | BackendMessage::ParameterDescription(_) => continue,
                BackendMessage::RowDescription(fields) => {
                    self.connector.state = ConnectorState::Fetching;
                    self.fields = Some(Arc::new(fields));
                }
                BackendMessage::DataRow(values) => {
                    self.connector.state = ConnectorState::Fetching;
                    let fields = match &self.fields {
                        Some(fields) => fields.clone(),
                        None => {
                            return Err(self.connector.broken_protocol(
                                "DataRow arrived before RowDescription".to_string(),
                            ));
                        }
                    };
                    return Ok(Some(Row { fields, values }));
                }
                BackendMessage::CommandComplete(tag) => {
                    self.command_tag = Some(tag);
                }
                BackendMessage::ErrorResponse(err) => {
                    // Results after an error are swallowed until Sync; keep
                    // consuming to the batch boundary.
                    self.pending_error = Some(self.connector.redact(err));
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.finished = true;
                    self.connector.command_done(status);
                    match self.pending_error.take() {
                        Some(err) => {
                            COUNTERS.command_failed();
                            return Err(Error::Server(err));
                        }
                        None => return Ok(None),
                    }
                }
                other => {
                    self.finished = true;
                    self.connector.fail_command();
                    return Err(self.connector.broken_protocol(format!(
                        "unexpected {} in command results",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Drain the remaining rows and return the completed result.
    pub async fn collect(mut self) -> Result<QueryResult, Error> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(QueryResult {
            fields: self.fields.unwrap_or_default(),
            rows,
            command_tag: self.command_tag.unwrap_or_default(),
        })
    }

    /// Drain without keeping rows; returns the command tag.
    pub async fn finish(mut self) -> Result<Option<String>, Error> {
        while self.next_row().await?.is_some() {}
        Ok(self.command_tag.take())
    }
}

/// Writer half of a COPY ... FROM STDIN exchange.
pub struct CopyInSink<'a> {
    connector: &'a mut Connector,
}

impl CopyInSink<'_> {
    /// Send one CopyData chunk. Chunks larger than the write buffer take
    /// the direct path to the socket.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let connector = &mut *self.connector;
        if connector.write_buffer.bypasses_buffer(data.len()) {
            connector.write_buffer.write_byte(b'd');
            connector.write_buffer.write_i32(data.len() as i32 + 4);
            let queued = connector.write_buffer.len() as u64;
            let result = connector
                .write_buffer
                .write_direct(&mut connector.stream, data)
                .await;
            match result {
                Ok(()) => {
                    COUNTERS.bytes_sent_add(queued + data.len() as u64);
                    Ok(())
                }
                Err(err) => {
                    connector.mark_broken(&err.to_string());
                    Err(err)
                }
            }
        } else {
            frontend::copy_data(&mut connector.write_buffer, data);
            if connector.write_buffer.len() >= connector.settings.write_buffer_size {
                connector.flush().await?;
            }
            Ok(())
        }
    }

    /// CopyDone, then drain CommandComplete and ReadyForQuery.
    pub async fn finish(self) -> Result<String, Error> {
        let connector = self.connector;
        frontend::copy_done(&mut connector.write_buffer);
        connector.flush().await?;

        let deadline = Instant::now() + connector.settings.command_timeout;
        let none = CancelToken::none();
        let mut tag = String::new();
        let mut pending_error = None;
        loop {
            match connector.recv_within(deadline, &none).await? {
                BackendMessage::CommandComplete(t) => tag = t,
                BackendMessage::ErrorResponse(err) => {
                    pending_error = Some(connector.redact(err))
                }
                BackendMessage::ReadyForQuery(status) => {
                    connector.command_done(status);
                    return match pending_error {
                        Some(err) => Err(Error::Server(err)),
                        None => Ok(tag),
                    };
                }
                other => {
                    return Err(connector.broken_protocol(format!(
                        "unexpected {} completing COPY IN",
                        other.name()
                    )));
                }
            }
        }
    }

    /// CopyFail: abort the copy; the server answers with an ErrorResponse
    /// that is drained here.
    pub async fn fail(self, message: &str) -> Result<(), Error> {
        let connector = self.connector;
        frontend::copy_fail(&mut connector.write_buffer, message);
        connector.flush().await?;
        match tokio::time::timeout(
            connector.settings.internal_command_timeout(),
            connector.drain_to_ready(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                connector.mark_broken("no response to CopyFail");
                Err(Error::Timeout("copy abort".to_string()))
            }
        }
    }
}

/// Reader half of a COPY ... TO STDOUT exchange.
pub struct CopyOutStream<'a> {
    connector: &'a mut Connector,
    cancel: CancelToken,
    done: bool,
}

impl CopyOutStream<'_> {
    /// The next data chunk, or `None` when the copy completed.
    pub async fn next_chunk(&mut self) -> Result<Option<BytesMut>, Error> {
        if self.done {
            return Ok(None);
        }
        let deadline = Instant::now() + self.connector.settings.command_timeout;
        loop {
            match self.connector.recv_within(deadline, &self.cancel).await? {
                BackendMessage::CopyData(data) => return Ok(Some(data)),
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
                    return Err(self.connector.broken_protocol(format!(
                        "unexpected {} in COPY OUT",
                        other.name()
                    )));
                }
            }
        }
    }
}
