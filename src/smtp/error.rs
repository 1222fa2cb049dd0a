//! Error types for the SMTP front end

use thiserror::Error;

use super::response::SmtpResponse;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Syntax error, command unrecognized")]
    InvalidCommand,

    #[error("Bad sequence of commands: {0}")]
    InvalidState(&'static str),

    #[error("Syntax error: {0}")]
    InvalidSyntax(String),

    #[error("Line too long (max {max} octets)")]
    LineTooLong { max: usize },

    #[error("Too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("Message size exceeds fixed maximum message size ({max} bytes)")]
    MessageTooLarge { max: usize },
}

/// Session limits from RFC 5321 section 4.5.3.
pub struct SmtpLimits;

impl SmtpLimits {
    /// Command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    pub const MAX_RECIPIENTS: usize = 100;
}

impl SmtpError {
    pub fn to_response(&self) -> SmtpResponse {
        let (code, enhanced) = match self {
            SmtpError::Io(_) => (421, "4.3.0"),
            SmtpError::InvalidCommand => (500, "5.5.2"),
            SmtpError::InvalidState(_) => (503, "5.5.1"),
            SmtpError::InvalidSyntax(_) => (501, "5.5.4"),
            SmtpError::LineTooLong { .. } => (500, "5.5.2"),
            SmtpError::TooManyRecipients { .. } => (452, "4.5.3"),
            SmtpError::MessageTooLarge { .. } => (552, "5.3.4"),
        };
        SmtpResponse::new(code, format!("{enhanced} {self}"))
    }
}
