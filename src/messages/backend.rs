// Backend message decoding. Every message the server can send is one
// variant of a single tagged enum; dispatch is a `match` on the tag, and
// each decoder consumes exactly the declared body.

use bytes::BytesMut;

use crate::constants::*;
use crate::errors::Error;
use crate::messages::error::ServerError;
use crate::messages::types::SafeBuf;

/// The authentication sub-message carried inside an 'R' frame,
/// distinguished by a 4-byte authentication-type code.
#[derive(Debug, Clone, PartialEq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password {
        salt: [u8; 4],
    },
    Sasl {
        mechanisms: Vec<String>,
    },
    SaslContinue {
        data: BytesMut,
    },
    SaslFinal {
        data: BytesMut,
    },
    Gss,
    Sspi,
    GssContinue {
        data: BytesMut,
    },
    /// openGauss SHA-256 challenge: a nested password-method code plus
    /// salt, token and iteration count.
    GaussSha256 {
        method: i32,
        salt: String,
        token: String,
        iteration: i32,
    },
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// An asynchronous NOTIFY delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Transaction status published by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    fn parse(code: u8) -> Result<TransactionStatus, Error> {
        match code {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::ProtocolViolation(format!(
                "unknown transaction status: {:?}",
                other as char
            ))),
        }
    }
}

/// Every backend message this core consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(Authentication),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    RowDescription(Vec<FieldDescription>),
    ParameterDescription(Vec<i32>),
    DataRow(Vec<Option<BytesMut>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ReadyForQuery(TransactionStatus),
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    CopyInResponse { overall_format: u8, column_formats: Vec<i16> },
    CopyOutResponse { overall_format: u8, column_formats: Vec<i16> },
    CopyBothResponse { overall_format: u8, column_formats: Vec<i16> },
    CopyData(BytesMut),
    CopyDone,
    NotificationResponse(Notification),
}

impl BackendMessage {
    /// Decode one message body. The caller has already framed it, so the
    /// body length is exactly the declared length minus the length field.
    pub fn decode(tag: u8, mut body: BytesMut) -> Result<BackendMessage, Error> {
        let message = match tag {
            b'R' => BackendMessage::Authentication(decode_authentication(&mut body)?),
            b'S' => {
                let name = body.read_cstring()?;
                let value = body.read_cstring()?;
                BackendMessage::ParameterStatus { name, value }
            }
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.try_get_i32()?,
                secret_key: body.try_get_i32()?,
            },
            b'T' => {
                let count = body.try_get_i16()?;
                let mut fields = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    fields.push(FieldDescription {
                        name: body.read_cstring()?,
                        table_oid: body.try_get_i32()?,
                        column_attr: body.try_get_i16()?,
                        type_oid: body.try_get_i32()?,
                        type_size: body.try_get_i16()?,
                        type_modifier: body.try_get_i32()?,
                        format: body.try_get_i16()?,
                    });
                }
                BackendMessage::RowDescription(fields)
            }
            b't' => {
                let count = body.try_get_i16()?;
                let mut oids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    oids.push(body.try_get_i32()?);
                }
                BackendMessage::ParameterDescription(oids)
            }
            b'D' => {
                let count = body.try_get_i16()?;
                let mut values = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let len = body.try_get_i32()?;
                    if len < 0 {
                        values.push(None);
                    } else {
                        values.push(Some(body.try_split_to(len as usize)?));
                    }
                }
                BackendMessage::DataRow(values)
            }
            b'C' => BackendMessage::CommandComplete(body.read_cstring()?),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'Z' => BackendMessage::ReadyForQuery(TransactionStatus::parse(body.try_get_u8()?)?),
            b'E' => BackendMessage::ErrorResponse(ServerError::parse(&body)?),
            b'N' => BackendMessage::NoticeResponse(ServerError::parse(&body)?),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b'G' | b'H' | b'W' => {
                let overall_format = body.try_get_u8()?;
                let count = body.try_get_i16()?;
                let mut column_formats = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    column_formats.push(body.try_get_i16()?);
                }
                match tag {
                    b'G' => BackendMessage::CopyInResponse { overall_format, column_formats },
                    b'H' => BackendMessage::CopyOutResponse { overall_format, column_formats },
                    _ => BackendMessage::CopyBothResponse { overall_format, column_formats },
                }
            }
            b'd' => {
                let data = body.split();
                BackendMessage::CopyData(data)
            }
            b'c' => BackendMessage::CopyDone,
            b'A' => BackendMessage::NotificationResponse(Notification {
                process_id: body.try_get_i32()?,
                channel: body.read_cstring()?,
                payload: body.read_cstring()?,
            }),
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown backend message tag: {:?}",
                    other as char
                )))
            }
        };

        // Error/notice field walks stop at the terminator by design; every
        // other decoder must consume the whole declared body.
        if bytes::Buf::has_remaining(&body)
            && !matches!(
                message,
                BackendMessage::ErrorResponse(_) | BackendMessage::NoticeResponse(_)
            )
        {
            return Err(Error::ProtocolViolation(format!(
                "message {:?} left {} undecoded bytes",
                tag as char,
                bytes::Buf::remaining(&body)
            )));
        }

        Ok(message)
    }

    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::Authentication(_) => "Authentication",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::RowDescription(_) => "RowDescription",
            BackendMessage::ParameterDescription(_) => "ParameterDescription",
            BackendMessage::DataRow(_) => "DataRow",
            BackendMessage::CommandComplete(_) => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::CopyInResponse { .. } => "CopyInResponse",
            BackendMessage::CopyOutResponse { .. } => "CopyOutResponse",
            BackendMessage::CopyBothResponse { .. } => "CopyBothResponse",
            BackendMessage::CopyData(_) => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::NotificationResponse(_) => "NotificationResponse",
        }
    }
}

fn decode_authentication(body: &mut BytesMut) -> Result<Authentication, Error> {
    let code = body.try_get_i32()?;
    let auth = match code {
        AUTHENTICATION_SUCCESSFUL => Authentication::Ok,
        AUTHENTICATION_CLEAR_PASSWORD => Authentication::CleartextPassword,
        AUTHENTICATION_MD5_PASSWORD => {
            let salt = body.try_split_to(4)?;
            Authentication::Md5Password {
                salt: [salt[0], salt[1], salt[2], salt[3]],
            }
        }
        AUTHENTICATION_GSS => Authentication::Gss,
        AUTHENTICATION_SSPI => Authentication::Sspi,
        AUTHENTICATION_GSS_CONTINUE => Authentication::GssContinue { data: body.split() },
        // openGauss reuses code 10 for its SHA-256 flow; the fixed 80-byte
        // body tells it apart from a SASL mechanism list.
        AUTHENTICATION_SASL if bytes::Buf::remaining(&body) == GAUSS_SHA256_BODY_LEN => {
            let method = body.try_get_i32()?;
            let salt = body.try_split_to(GAUSS_SALT_LENGTH)?;
            let token = body.try_split_to(GAUSS_TOKEN_LENGTH)?;
            let iteration = body.try_get_i32()?;
            Authentication::GaussSha256 {
                method,
                salt: String::from_utf8_lossy(&salt).into_owned(),
                token: String::from_utf8_lossy(&token).into_owned(),
                iteration,
            }
        }
        AUTHENTICATION_SASL => {
            let mut mechanisms = Vec::new();
            while bytes::Buf::has_remaining(&body) && body[0] != 0 {
                mechanisms.push(body.read_cstring()?);
            }
            if bytes::Buf::has_remaining(&body) {
                bytes::Buf::advance(body, 1);
            }
            Authentication::Sasl { mechanisms }
        }
        AUTHENTICATION_SASL_CONTINUE => Authentication::SaslContinue { data: body.split() },
        AUTHENTICATION_SASL_FINAL => Authentication::SaslFinal { data: body.split() },
        other => {
            return Err(Error::ProtocolViolation(format!(
                "unsupported authentication request code: {other}"
            )))
        }
    };
    Ok(auth)
}
