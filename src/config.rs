//! Connection string parsing and validation.
//!
//! The connection string is a case-insensitive, synonym-tolerant list of
//! `Key=Value` pairs separated by semicolons. Keys are folded to a canonical
//! form (lowercased, spaces stripped) and applied through one explicit
//! `match`, producing typed fields with the documented defaults. Once built
//! the value is frozen; the canonical rendering doubles as the pool key.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use crate::errors::Error;

/// TLS negotiation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// Whether a refused SSLRequest is fatal.
    pub fn required(&self) -> bool {
        matches!(self, SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// Whether we send an SSLRequest at all.
    pub fn negotiates(&self) -> bool {
        !matches!(self, SslMode::Disable | SslMode::Allow)
    }
}

impl std::str::FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match fold_key(s).as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verifyca" | "verify-ca" => Ok(SslMode::VerifyCa),
            "verifyfull" | "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(Error::ConfigurationInvalid(format!(
                "invalid SslMode value: {other}"
            ))),
        }
    }
}

impl Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SslMode::Disable => "Disable",
            SslMode::Allow => "Allow",
            SslMode::Prefer => "Prefer",
            SslMode::Require => "Require",
            SslMode::VerifyCa => "VerifyCA",
            SslMode::VerifyFull => "VerifyFull",
        };
        write!(f, "{s}")
    }
}

/// Host-role selector used when more than one host is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetSessionAttributes {
    #[default]
    Any,
    Primary,
    Standby,
    PreferPrimary,
    PreferStandby,
    ReadWrite,
    ReadOnly,
}

impl std::str::FromStr for TargetSessionAttributes {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match fold_key(s).replace('-', "").as_str() {
            "any" => Ok(TargetSessionAttributes::Any),
            "primary" => Ok(TargetSessionAttributes::Primary),
            "standby" | "secondary" => Ok(TargetSessionAttributes::Standby),
            "preferprimary" => Ok(TargetSessionAttributes::PreferPrimary),
            "preferstandby" | "prefersecondary" => Ok(TargetSessionAttributes::PreferStandby),
            "readwrite" => Ok(TargetSessionAttributes::ReadWrite),
            "readonly" => Ok(TargetSessionAttributes::ReadOnly),
            other => Err(Error::ConfigurationInvalid(format!(
                "invalid TargetSessionAttributes value: {other}"
            ))),
        }
    }
}

/// Quirk switches for servers that speak the protocol but not the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerCompatibilityMode {
    #[default]
    None,
    Redshift,
    NoTypeLoading,
}

impl std::str::FromStr for ServerCompatibilityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match fold_key(s).as_str() {
            "none" => Ok(ServerCompatibilityMode::None),
            "redshift" => Ok(ServerCompatibilityMode::Redshift),
            "notypeloading" => Ok(ServerCompatibilityMode::NoTypeLoading),
            other => Err(Error::ConfigurationInvalid(format!(
                "invalid ServerCompatibilityMode value: {other}"
            ))),
        }
    }
}

/// One `host[:port]` entry from the `Host` list. A path-rooted or
/// `@`-prefixed host is a unix-domain socket directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    pub fn is_unix(&self) -> bool {
        self.host.starts_with('/') || self.host.starts_with('@')
    }

    /// Socket filename inside the configured directory. A leading `@` maps
    /// to the abstract namespace (NUL-prefixed path).
    pub fn unix_socket_path(&self) -> String {
        let dir = if let Some(rest) = self.host.strip_prefix('@') {
            format!("\0{rest}")
        } else {
            self.host.clone()
        };
        format!("{}/.s.PGSQL.{}", dir, self.port)
    }
}

impl Display for HostSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Typed, frozen view of a connection string. Built once with
/// [`ConnectionString::parse`], cloned into the pool key.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    pub hosts: Vec<HostSpec>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub passfile: Option<String>,
    pub application_name: Option<String>,
    pub client_encoding: Option<String>,
    pub search_path: Option<String>,
    pub timezone: Option<String>,
    pub options: Option<String>,

    pub ssl_mode: SslMode,
    pub trust_server_certificate: bool,
    pub ssl_certificate: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_password: Option<String>,
    pub root_certificate: Option<String>,
    pub check_certificate_revocation: bool,

    pub timeout: Duration,
    pub command_timeout: Duration,
    pub cancellation_timeout_ms: i64,
    pub keepalive_seconds: u64,
    pub tcp_keepalive: bool,
    pub tcp_keepalive_time: Option<u64>,
    pub tcp_keepalive_interval: Option<u64>,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub socket_receive_buffer_size: Option<usize>,
    pub socket_send_buffer_size: Option<usize>,

    pub pooling: bool,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub connection_idle_lifetime: u64,
    pub connection_pruning_interval: u64,
    pub connection_lifetime: u64,

    pub max_auto_prepare: usize,
    pub auto_prepare_min_usages: u32,
    pub no_reset_on_close: bool,

    pub multiplexing: bool,
    pub write_coalescing_buffer_threshold_bytes: usize,

    pub load_balance_hosts: bool,
    pub host_recheck_seconds: u64,
    pub target_session_attributes: TargetSessionAttributes,

    pub server_compatibility_mode: ServerCompatibilityMode,
    pub include_error_detail: bool,
    pub log_parameters: bool,

    // Canonical-cased key -> raw value, in stable order. Doubles as the
    // pool key material.
    raw: BTreeMap<String, String>,
}

impl Default for ConnectionString {
    fn default() -> ConnectionString {
        ConnectionString {
            hosts: Vec::new(),
            database: None,
            username: None,
            password: None,
            passfile: None,
            application_name: None,
            client_encoding: None,
            search_path: None,
            timezone: None,
            options: None,
            ssl_mode: SslMode::default(),
            trust_server_certificate: false,
            ssl_certificate: None,
            ssl_key: None,
            ssl_password: None,
            root_certificate: None,
            check_certificate_revocation: false,
            timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            cancellation_timeout_ms: 2000,
            keepalive_seconds: 0,
            tcp_keepalive: false,
            tcp_keepalive_time: None,
            tcp_keepalive_interval: None,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            socket_receive_buffer_size: None,
            socket_send_buffer_size: None,
            pooling: true,
            min_pool_size: 0,
            max_pool_size: 100,
            connection_idle_lifetime: 300,
            connection_pruning_interval: 10,
            connection_lifetime: 0,
            max_auto_prepare: 0,
            auto_prepare_min_usages: 5,
            no_reset_on_close: false,
            multiplexing: false,
            write_coalescing_buffer_threshold_bytes: 1000,
            load_balance_hosts: false,
            host_recheck_seconds: 10,
            target_session_attributes: TargetSessionAttributes::default(),
            server_compatibility_mode: ServerCompatibilityMode::default(),
            include_error_detail: false,
            log_parameters: false,
            raw: BTreeMap::new(),
        }
    }
}

/// Lowercase and strip spaces so `User Id`, `user_id` and `USERID` meet.
fn fold_key(key: &str) -> String {
    key.trim()
        .chars()
        .filter(|c| *c != ' ' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match fold_key(value).as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(Error::ConfigurationInvalid(format!(
            "{key} expects a boolean, got {value:?}"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value.trim().parse::<T>().map_err(|_| {
        Error::ConfigurationInvalid(format!("{key} expects a number, got {value:?}"))
    })
}

impl ConnectionString {
    /// Parse, apply defaults and validate. The result is immutable.
    pub fn parse(connection_string: &str) -> Result<ConnectionString, Error> {
        let mut settings = ConnectionString::default();
        let mut host_value: Option<String> = None;
        let mut port_value: u16 = 5432;

        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::ConfigurationInvalid(format!("expected Key=Value, got {pair:?}"))
            })?;
            let value = value.trim();
            match settings.apply(&fold_key(key), key.trim(), value)? {
                Applied::Host => host_value = Some(value.to_string()),
                Applied::Port => port_value = parse_num(key, value)?,
                Applied::Other => {}
            }
        }

        let host_value = host_value.ok_or_else(|| {
            Error::ConfigurationInvalid("Host is required".to_string())
        })?;
        settings.hosts = parse_host_list(&host_value, port_value)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply one pair. Returns which structural key was hit so host/port
    /// resolution can run after every pair is seen.
    fn apply(&mut self, folded: &str, key: &str, value: &str) -> Result<Applied, Error> {
        let canonical = match folded {
            "host" | "server" => {
                self.record("Host", value);
                return Ok(Applied::Host);
            }
            "port" => {
                self.record("Port", value);
                return Ok(Applied::Port);
            }
            "database" | "db" => {
                self.database = Some(value.to_string());
                "Database"
            }
            "username" | "user" | "userid" | "uid" => {
                self.username = Some(value.to_string());
                "Username"
            }
            "password" | "pwd" => {
                self.password = Some(value.to_string());
                "Password"
            }
            "passfile" => {
                self.passfile = Some(value.to_string());
                "Passfile"
            }
            "applicationname" => {
                self.application_name = Some(value.to_string());
                "ApplicationName"
            }
            "clientencoding" => {
                self.client_encoding = Some(value.to_string());
                "ClientEncoding"
            }
            "searchpath" => {
                self.search_path = Some(value.to_string());
                "SearchPath"
            }
            "timezone" => {
                self.timezone = Some(value.to_string());
                "Timezone"
            }
            "options" => {
                self.options = Some(value.to_string());
                "Options"
            }
            "sslmode" => {
                self.ssl_mode = value.parse()?;
                "SslMode"
            }
            "trustservercertificate" => {
                self.trust_server_certificate = parse_bool(key, value)?;
                "TrustServerCertificate"
            }
            "sslcertificate" => {
                self.ssl_certificate = Some(value.to_string());
                "SslCertificate"
            }
            "sslkey" => {
                self.ssl_key = Some(value.to_string());
                "SslKey"
            }
            "sslpassword" => {
                self.ssl_password = Some(value.to_string());
                "SslPassword"
            }
            "rootcertificate" => {
                self.root_certificate = Some(value.to_string());
                "RootCertificate"
            }
            "checkcertificaterevocation" => {
                self.check_certificate_revocation = parse_bool(key, value)?;
                "CheckCertificateRevocation"
            }
            "timeout" => {
                self.timeout = Duration::from_secs(parse_num(key, value)?);
                "Timeout"
            }
            "commandtimeout" => {
                self.command_timeout = Duration::from_secs(parse_num(key, value)?);
                "CommandTimeout"
            }
            "cancellationtimeout" => {
                let ms: i64 = parse_num(key, value)?;
                if ms < -1 {
                    return Err(Error::ConfigurationInvalid(format!(
                        "CancellationTimeout must be -1, 0 or positive, got {ms}"
                    )));
                }
                self.cancellation_timeout_ms = ms;
                "CancellationTimeout"
            }
            "keepalive" => {
                self.keepalive_seconds = parse_num(key, value)?;
                "KeepAlive"
            }
            "tcpkeepalive" => {
                self.tcp_keepalive = parse_bool(key, value)?;
                "TcpKeepAlive"
            }
            "tcpkeepalivetime" => {
                self.tcp_keepalive_time = Some(parse_num(key, value)?);
                "TcpKeepAliveTime"
            }
            "tcpkeepaliveinterval" => {
                self.tcp_keepalive_interval = Some(parse_num(key, value)?);
                "TcpKeepAliveInterval"
            }
            "readbuffersize" => {
                self.read_buffer_size = parse_num(key, value)?;
                "ReadBufferSize"
            }
            "writebuffersize" => {
                self.write_buffer_size = parse_num(key, value)?;
                "WriteBufferSize"
            }
            "socketreceivebuffersize" => {
                self.socket_receive_buffer_size = Some(parse_num(key, value)?);
                "SocketReceiveBufferSize"
            }
            "socketsendbuffersize" => {
                self.socket_send_buffer_size = Some(parse_num(key, value)?);
                "SocketSendBufferSize"
            }
            "pooling" => {
                self.pooling = parse_bool(key, value)?;
                "Pooling"
            }
            "minpoolsize" => {
                self.min_pool_size = parse_num(key, value)?;
                "MinPoolSize"
            }
            "maxpoolsize" => {
                self.max_pool_size = parse_num(key, value)?;
                "MaxPoolSize"
            }
            "connectionidlelifetime" => {
                self.connection_idle_lifetime = parse_num(key, value)?;
                "ConnectionIdleLifetime"
            }
            "connectionpruninginterval" => {
                self.connection_pruning_interval = parse_num(key, value)?;
                "ConnectionPruningInterval"
            }
            "connectionlifetime" | "loadbalancetimeout" => {
                self.connection_lifetime = parse_num(key, value)?;
                "ConnectionLifetime"
            }
            "maxautoprepare" => {
                self.max_auto_prepare = parse_num(key, value)?;
                "MaxAutoPrepare"
            }
            "autoprepareminusages" => {
                self.auto_prepare_min_usages = parse_num(key, value)?;
                "AutoPrepareMinUsages"
            }
            "noresetonclose" => {
                self.no_reset_on_close = parse_bool(key, value)?;
                "NoResetOnClose"
            }
            "multiplexing" => {
                self.multiplexing = parse_bool(key, value)?;
                "Multiplexing"
            }
            "writecoalescingbufferthresholdbytes" => {
                self.write_coalescing_buffer_threshold_bytes = parse_num(key, value)?;
                "WriteCoalescingBufferThresholdBytes"
            }
            "loadbalancehosts" => {
                self.load_balance_hosts = parse_bool(key, value)?;
                "LoadBalanceHosts"
            }
            "hostrecheckseconds" => {
                self.host_recheck_seconds = parse_num(key, value)?;
                "HostRecheckSeconds"
            }
            "targetsessionattributes" => {
                self.target_session_attributes = value.parse()?;
                "TargetSessionAttributes"
            }
            "servercompatibilitymode" => {
                self.server_compatibility_mode = value.parse()?;
                "ServerCompatibilityMode"
            }
            "includeerrordetail" => {
                self.include_error_detail = parse_bool(key, value)?;
                "IncludeErrorDetail"
            }
            "logparameters" => {
                self.log_parameters = parse_bool(key, value)?;
                "LogParameters"
            }
            _ => {
                return Err(Error::ConfigurationInvalid(format!(
                    "unknown connection string key: {key}"
                )))
            }
        };
        self.record(canonical, value);
        Ok(Applied::Other)
    }

    fn record(&mut self, canonical: &str, value: &str) {
        self.raw.insert(canonical.to_string(), value.to_string());
    }

    fn validate(&self) -> Result<(), Error> {
        if self.hosts.is_empty() {
            return Err(Error::ConfigurationInvalid("Host is required".to_string()));
        }
        if self.multiplexing && !self.pooling {
            return Err(Error::ConfigurationInvalid(
                "Multiplexing requires Pooling".to_string(),
            ));
        }
        if self.ssl_mode == SslMode::Require && !self.trust_server_certificate {
            return Err(Error::ConfigurationInvalid(
                "SslMode=Require without certificate validation requires \
                 TrustServerCertificate=true; use VerifyCA or VerifyFull to validate"
                    .to_string(),
            ));
        }
        if self.trust_server_certificate
            && matches!(
                self.ssl_mode,
                SslMode::Allow | SslMode::VerifyCa | SslMode::VerifyFull
            )
        {
            return Err(Error::ConfigurationInvalid(format!(
                "TrustServerCertificate=true is incompatible with SslMode={}",
                self.ssl_mode
            )));
        }
        if self.max_pool_size == 0 {
            return Err(Error::ConfigurationInvalid(
                "MaxPoolSize must be at least 1".to_string(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(Error::ConfigurationInvalid(format!(
                "MinPoolSize of {} cannot be larger than MaxPoolSize of {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.auto_prepare_min_usages == 0 {
            return Err(Error::ConfigurationInvalid(
                "AutoPrepareMinUsages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Database sent in the startup packet; defaults to the username.
    pub fn startup_database(&self) -> Option<&str> {
        self.database.as_deref().or(self.username.as_deref())
    }

    /// Timeout for reset, keepalive and role-probe queries.
    pub fn internal_command_timeout(&self) -> Duration {
        self.command_timeout.max(Duration::from_secs(3))
    }

    /// Password resolution: explicit `Password` wins, then the passfile
    /// (`host:port:database:user:password` lines, `*` wildcards).
    pub fn resolve_password(&self, host: &HostSpec) -> Option<String> {
        if self.password.is_some() {
            return self.password.clone();
        }
        let path = self.passfile.as_deref()?;
        let contents = std::fs::read_to_string(path).ok()?;
        let user = self.username.as_deref().unwrap_or("");
        let database = self.startup_database().unwrap_or("");
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.splitn(5, ':').collect();
            if fields.len() != 5 {
                continue;
            }
            let matches = |pattern: &str, value: &str| pattern == "*" || pattern == value;
            if matches(fields[0], &host.host)
                && matches(fields[1], &host.port.to_string())
                && matches(fields[2], database)
                && matches(fields[3], user)
            {
                return Some(fields[4].to_string());
            }
        }
        None
    }

    /// Stable rendering used as the pool key. Includes credentials, so it
    /// must never be logged; use `Display` for that.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.raw {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push(';');
        }
        out
    }
}

enum Applied {
    Host,
    Port,
    Other,
}

fn parse_host_list(value: &str, default_port: u16) -> Result<Vec<HostSpec>, Error> {
    let mut hosts = Vec::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        // Unix-socket directories never carry an inline port.
        if entry.starts_with('/') || entry.starts_with('@') {
            hosts.push(HostSpec {
                host: entry.to_string(),
                port: default_port,
            });
            continue;
        }
        match entry.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                hosts.push(HostSpec {
                    host: host.to_string(),
                    port: port.parse().map_err(|_| {
                        Error::ConfigurationInvalid(format!("invalid port in host entry {entry:?}"))
                    })?,
                })
            }
            _ => hosts.push(HostSpec {
                host: entry.to_string(),
                port: default_port,
            }),
        }
    }
    if hosts.is_empty() {
        return Err(Error::ConfigurationInvalid("Host is required".to_string()));
    }
    Ok(hosts)
}

impl Display for ConnectionString {
    /// Canonical rendering with the password redacted.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        for (key, value) in &self.raw {
            if !first {
                write!(f, ";")?;
            }
            first = false;
            if key == "Password" {
                write!(f, "{key}=*****")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_and_synonyms() {
        let settings =
            ConnectionString::parse("Server=db1,db2:5433;User Id=alice;DB=app;Load Balance Timeout=60")
                .unwrap();
        assert_eq!(
            settings.hosts,
            vec![
                HostSpec { host: "db1".into(), port: 5432 },
                HostSpec { host: "db2".into(), port: 5433 },
            ]
        );
        assert_eq!(settings.username.as_deref(), Some("alice"));
        assert_eq!(settings.database.as_deref(), Some("app"));
        assert_eq!(settings.connection_lifetime, 60);
        assert_eq!(settings.timeout, Duration::from_secs(15));
        assert_eq!(settings.command_timeout, Duration::from_secs(30));
        assert_eq!(settings.max_pool_size, 100);
        assert!(settings.pooling);
    }

    #[test]
    fn port_key_applies_to_bare_hosts() {
        let settings = ConnectionString::parse("Host=db1;Port=6000").unwrap();
        assert_eq!(settings.hosts[0].port, 6000);
    }

    #[test]
    fn host_is_required() {
        let err = ConnectionString::parse("Username=u").unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn multiplexing_requires_pooling() {
        let err =
            ConnectionString::parse("Host=h;Multiplexing=true;Pooling=false").unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn require_without_trust_is_rejected() {
        let err = ConnectionString::parse("Host=h;SslMode=Require").unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
        assert!(ConnectionString::parse(
            "Host=h;SslMode=Require;TrustServerCertificate=true"
        )
        .is_ok());
    }

    #[test]
    fn trust_is_incompatible_with_verifying_modes() {
        for mode in ["Allow", "VerifyCA", "VerifyFull"] {
            let err = ConnectionString::parse(&format!(
                "Host=h;SslMode={mode};TrustServerCertificate=true"
            ))
            .unwrap_err();
            assert!(matches!(err, Error::ConfigurationInvalid(_)), "{mode}");
        }
    }

    #[test]
    fn unix_socket_paths() {
        let settings = ConnectionString::parse("Host=/var/run/postgresql;Port=5433").unwrap();
        let host = &settings.hosts[0];
        assert!(host.is_unix());
        assert_eq!(host.unix_socket_path(), "/var/run/postgresql/.s.PGSQL.5433");

        let settings = ConnectionString::parse("Host=@gauss;Port=5432").unwrap();
        assert_eq!(settings.hosts[0].unix_socket_path(), "\0gauss/.s.PGSQL.5432");
    }

    #[test]
    fn display_redacts_password() {
        let settings =
            ConnectionString::parse("Host=h;Username=u;Password=hunter2").unwrap();
        let rendered = settings.to_string();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Password=*****"));
        assert!(settings.canonical_string().contains("hunter2"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ConnectionString::parse("Host=h;Bogus=1").unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn target_session_attributes_values() {
        let settings = ConnectionString::parse(
            "Host=h;TargetSessionAttributes=prefer-standby",
        )
        .unwrap();
        assert_eq!(
            settings.target_session_attributes,
            TargetSessionAttributes::PreferStandby
        );
    }

    #[test]
    fn internal_command_timeout_has_a_floor() {
        let settings = ConnectionString::parse("Host=h;CommandTimeout=1").unwrap();
        assert_eq!(settings.internal_command_timeout(), Duration::from_secs(3));
        let settings = ConnectionString::parse("Host=h;CommandTimeout=45").unwrap();
        assert_eq!(settings.internal_command_timeout(), Duration::from_secs(45));
    }
}
