// ErrorResponse / NoticeResponse field bag.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::constants::MESSAGE_TERMINATOR;
use crate::errors::Error;

/// A server error or notice, parsed from its tagged fields.
/// See: <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Default, PartialEq, Clone)]
pub struct ServerError {
    pub severity_localized: String,      // S
    pub severity: String,                // V
    pub code: String,                    // C, the sqlstate
    pub message: String,                 // M
    pub detail: Option<String>,          // D
    pub hint: Option<String>,            // H
    pub position: Option<u32>,           // P
    pub where_context: Option<String>,   // W
    pub schema_name: Option<String>,     // s
    pub table_name: Option<String>,      // t
    pub column_name: Option<String>,     // c
    pub constraint_name: Option<String>, // n
    pub file_name: Option<String>,       // F
    pub line: Option<u32>,               // L
    pub routine: Option<String>,         // R
}

impl ServerError {
    /// Parse the field list of an ErrorResponse or NoticeResponse body.
    pub fn parse(body: &[u8]) -> Result<ServerError, Error> {
        let mut out = ServerError::default();

        let mut i = 0;
        while i < body.len() {
            let field_type = body[i];
            if field_type == MESSAGE_TERMINATOR {
                break;
            }
            i += 1;

            let start = i;
            while i < body.len() && body[i] != 0 {
                i += 1;
            }
            let content = String::from_utf8_lossy(&body[start..i]).into_owned();
            i += 1;

            match field_type {
                b'S' => out.severity_localized = content,
                b'V' => out.severity = content,
                b'C' => out.code = content,
                b'M' => out.message = content,
                b'D' => out.detail = Some(content),
                b'H' => out.hint = Some(content),
                b'P' => out.position = Some(u32::from_str(&content).unwrap_or(0)),
                b'W' => out.where_context = Some(content),
                b's' => out.schema_name = Some(content),
                b't' => out.table_name = Some(content),
                b'c' => out.column_name = Some(content),
                b'n' => out.constraint_name = Some(content),
                b'F' => out.file_name = Some(content),
                b'L' => out.line = Some(u32::from_str(&content).unwrap_or(0)),
                b'R' => out.routine = Some(content),
                _ => {}
            }
        }

        Ok(out)
    }

    /// Strip the server-side `Detail`/`Hint` fields, which may carry data
    /// values. Applied unless `IncludeErrorDetail=true`.
    pub fn without_detail(mut self) -> ServerError {
        if self.detail.is_some() {
            self.detail = Some("Detail redacted; enable IncludeErrorDetail to see it".to_string());
        }
        self.hint = None;
        self
    }

    /// Fatal severities terminate the session regardless of sqlstate.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} [{}]", self.severity, self.message, self.code)?;
        if let Some(val) = &self.detail {
            write!(f, " [detail: {val}]")?;
        }
        if let Some(val) = &self.hint {
            write!(f, " [hint: {val}]")?;
        }
        if let Some(val) = &self.where_context {
            write!(f, " [where: {val}]")?;
        }
        if let Some(val) = &self.constraint_name {
            write!(f, " [constraint: {val}]")?;
        }
        Ok(())
    }
}
