//! FTP/FTPS session engine
//!
//! This library contains a blocking FTP client ([`ftp::Session`]) together
//! with the pieces of the `ftpsession` batch tool: jobs-file parsing,
//! the batch runner, logging, command-line handling and shutdown signaling.

pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod ftp;
pub mod logging;
pub mod shutdown;

// Re-export key items for easy use by the binary (main.rs)
pub use batch::{run_job, ItemResult, JobReport};
pub use cli::{parse_args, Args};
pub use config::{normalize_pem, parse_jobs, ConnectionConfig, Invocation, Job};
pub use error::{FtpError, FtpResult};
pub use ftp::{Operation, Session, SessionState};
pub use logging::{log, log_with_thread, set_log_file};
pub use shutdown::{is_shutdown_requested, request_shutdown};

/// Name of the program, used in usage and version output
pub const PROGRAM_NAME: &str = "ftpsession";

/// Current version of the program (from Cargo.toml)
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
