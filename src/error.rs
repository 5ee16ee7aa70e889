//! Error taxonomy for FTP sessions
//!
//! Every fallible operation in this crate returns [`FtpResult`]. Errors are
//! never retried internally; the caller (usually the batch runner) decides
//! whether to abort or record the failure and continue.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::ftp::codec::Reply;

/// Result alias used throughout the crate
pub type FtpResult<T> = Result<T, FtpError>;

#[derive(Debug, Error)]
pub enum FtpError {
    /// TCP/TLS connect or handshake failure, or a broken control socket
    #[error("connection error: {0}")]
    Connection(String),
    /// Malformed or unparsable control-channel reply
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Server answered a command with a 4xx/5xx reply
    #[error("{command} failed: {code} {text}")]
    Command {
        command: String,
        code: u16,
        text: String,
    },
    /// Passive/active data connection could not be set up
    #[error("data channel error: {0}")]
    DataChannel(String),
    /// Data moved but the server did not confirm the transfer
    #[error("transfer incomplete after {bytes} bytes: {}", incomplete_reason(.code, .text))]
    TransferIncomplete {
        bytes: u64,
        code: Option<u16>,
        text: String,
    },
    #[error("the operation \"{0}\" is not supported")]
    UnsupportedOperation(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Local file could not be opened, created or written
    #[error("local file {}: {source}", .path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid session state: {0}")]
    InvalidState(String),
    #[error("operation cancelled")]
    Cancelled,
}

fn incomplete_reason(code: &Option<u16>, text: &str) -> String {
    match code {
        Some(code) => format!("{} {}", code, text),
        None => text.to_string(),
    }
}

impl FtpError {
    /// Builds a `Command` error from a negative reply
    pub fn from_reply(command: &str, reply: &Reply) -> Self {
        FtpError::Command {
            command: command.to_string(),
            code: reply.code,
            text: reply.text.clone(),
        }
    }

    /// Reply code carried by the error, if any
    pub fn code(&self) -> Option<u16> {
        match self {
            FtpError::Command { code, .. } => Some(*code),
            FtpError::TransferIncomplete { code, .. } => *code,
            _ => None,
        }
    }
}

/// True for the error kinds a socket returns when its timeout expires
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::codec::parse_reply;

    #[test]
    fn test_command_error_from_reply() {
        let reply = parse_reply(&["550 No such file"]).unwrap();
        let err = FtpError::from_reply("RETR", &reply);
        assert_eq!(err.code(), Some(550));
        assert_eq!(err.to_string(), "RETR failed: 550 No such file");
    }

    #[test]
    fn test_transfer_incomplete_message() {
        let err = FtpError::TransferIncomplete {
            bytes: 10,
            code: Some(451),
            text: "Local error".to_string(),
        };
        assert_eq!(err.to_string(), "transfer incomplete after 10 bytes: 451 Local error");

        let err = FtpError::TransferIncomplete {
            bytes: 0,
            code: None,
            text: "no completion reply".to_string(),
        };
        assert_eq!(err.code(), None);
        assert!(err.to_string().ends_with("no completion reply"));
    }

    #[test]
    fn test_unsupported_operation_names_operation() {
        let err = FtpError::UnsupportedOperation("rename".to_string());
        assert_eq!(err.to_string(), "the operation \"rename\" is not supported");
    }
}
