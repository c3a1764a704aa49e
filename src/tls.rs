// TLS upgrade support. The connector asks for a connector built from the
// settings and wraps the stream after the server accepts the SSLRequest.

use std::io::Read;

use native_tls::{Certificate, Identity, TlsConnector};
use tokio_native_tls::native_tls;

use crate::config::{ConnectionString, SslMode};
use crate::errors::Error;

/// Load a client identity from PKCS#8 certificate and key files.
pub fn load_identity(cert: &str, key: &str, password: Option<&str>) -> Result<Identity, Error> {
    let read = |path: &str| -> std::io::Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut fd = std::fs::File::open(path)?;
        fd.read_to_end(&mut body)?;
        Ok(body)
    };

    let cert_body = read(cert)
        .map_err(|err| Error::ConfigurationInvalid(format!("cannot read SslCertificate: {err}")))?;
    let key_body = read(key)
        .map_err(|err| Error::ConfigurationInvalid(format!("cannot read SslKey: {err}")))?;

    // PKCS#12 bundles carry their own passphrase; bare PKCS#8 pairs don't.
    if let Some(password) = password {
        match Identity::from_pkcs12(&cert_body, password) {
            Ok(identity) => return Ok(identity),
            Err(_) => {}
        }
    }
    match Identity::from_pkcs8(&cert_body, &key_body) {
        Ok(identity) => Ok(identity),
        Err(err) => Err(Error::ConfigurationInvalid(format!(
            "cannot load client identity: {err}"
        ))),
    }
}

/// Build the TLS connector the settings describe. Validation depth follows
/// SslMode: Require trusts blindly (the connection string validator already
/// forced TrustServerCertificate=true), VerifyCA checks the chain but not
/// the hostname, VerifyFull checks both.
pub fn build_connector(settings: &ConnectionString) -> Result<tokio_native_tls::TlsConnector, Error> {
    let mut builder = TlsConnector::builder();

    match settings.ssl_mode {
        SslMode::Require | SslMode::Prefer => {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::VerifyFull => {}
        // Disable/Allow never negotiate TLS; the connector does not ask.
        SslMode::Disable | SslMode::Allow => {
            return Err(Error::ConfigurationInvalid(
                "TLS connector requested with SslMode=Disable/Allow".to_string(),
            ))
        }
    }

    if let Some(root) = &settings.root_certificate {
        let mut body = Vec::new();
        std::fs::File::open(root)
            .and_then(|mut fd| fd.read_to_end(&mut body))
            .map_err(|err| {
                Error::ConfigurationInvalid(format!("cannot read RootCertificate: {err}"))
            })?;
        let cert = Certificate::from_pem(&body)
            .or_else(|_| Certificate::from_der(&body))
            .map_err(|err| {
                Error::ConfigurationInvalid(format!("cannot parse RootCertificate: {err}"))
            })?;
        builder.add_root_certificate(cert);
    }

    if let (Some(cert), Some(key)) = (&settings.ssl_certificate, &settings.ssl_key) {
        builder.identity(load_identity(cert, key, settings.ssl_password.as_deref())?);
    }

    match builder.build() {
        Ok(connector) => Ok(tokio_native_tls::TlsConnector::from(connector)),
        Err(err) => Err(Error::ConnectionFailed(format!(
            "TLS connector setup failed: {err}"
        ))),
    }
}
