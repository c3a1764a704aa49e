// Protocol-level constants shared across the crate.

// Used in the StartupMessage to indicate a regular handshake.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

// SSLRequest: used to indicate we want a TLS connection.
pub const SSL_REQUEST_CODE: i32 = 80877103;

// CancelRequest: the cancel request code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// Authentication sub-codes carried inside an 'R' message.
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const AUTHENTICATION_MD5_PASSWORD: i32 = 5;
pub const AUTHENTICATION_GSS: i32 = 7;
pub const AUTHENTICATION_GSS_CONTINUE: i32 = 8;
pub const AUTHENTICATION_SSPI: i32 = 9;
pub const AUTHENTICATION_SASL: i32 = 10;
pub const AUTHENTICATION_SASL_CONTINUE: i32 = 11;
pub const AUTHENTICATION_SASL_FINAL: i32 = 12;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const NONCE_LENGTH: usize = 24;

// openGauss reuses authentication code 10 for its SHA-256 flow; the body is
// a fixed 80 bytes (method + 64-char salt + 8-char token + iteration).
pub const GAUSS_SHA256_BODY_LEN: usize = 80;
pub const GAUSS_SALT_LENGTH: usize = 64;
pub const GAUSS_TOKEN_LENGTH: usize = 8;

// Password stored methods inside the openGauss SHA-256 challenge.
pub const GAUSS_METHOD_PLAIN: i32 = 0;
pub const GAUSS_METHOD_MD5: i32 = 1;
pub const GAUSS_METHOD_SHA256: i32 = 2;

// ErrorResponse: a zero field code terminates the field list.
pub const MESSAGE_TERMINATOR: u8 = 0;

// Server-side names issued to auto-prepared statements.
pub const AUTO_PREPARED_PREFIX: &str = "_p";

// Upper bound on any single backend message we are willing to buffer.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

// 100 ns units, the resolution of the interval type.
pub const TICKS_PER_SECOND: i64 = 10_000_000;
pub const TICKS_PER_DAY: i64 = 86_400 * TICKS_PER_SECOND;
pub const DAYS_PER_MONTH: i64 = 30;
