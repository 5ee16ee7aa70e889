use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Error, ErrorKind};
use std::time::Duration;

use crate::error::FtpError;

/// Port used when the configuration leaves it unset or zero
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Timeout applied to every stage unless configured otherwise (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

static PEM_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(-----BEGIN [A-Z ]+-----)(.*?)(-----END [A-Z ]+-----)").expect("static regex")
});

static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" +").expect("static regex"));

/// How the control connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecureMode {
    /// Plain FTP
    #[default]
    None,
    /// TLS from the first byte (usually port 990)
    Implicit,
    /// Plain connect, then `AUTH TLS`
    Explicit,
}

/// How data connections are established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    /// PASV, client connects out (falls back to EPSV on IPv6)
    #[default]
    Passive,
    /// EPSV, client connects out to the control peer
    ExtendedPassive,
    /// PORT, server connects in
    Active,
    /// EPRT, server connects in
    ExtendedActive,
}

/// Per-stage timeout budgets in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// TCP connect of the control and passive data connections
    pub connect: u64,
    /// TLS handshake on either channel
    pub tls: u64,
    /// Waiting for a control-channel reply
    pub control: u64,
    /// Data-channel idle read/write, and accepting active connections
    pub data: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: DEFAULT_TIMEOUT_SECS,
            tls: DEFAULT_TIMEOUT_SECS,
            control: DEFAULT_TIMEOUT_SECS,
            data: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        secs(self.connect)
    }

    pub fn tls(&self) -> Duration {
        secs(self.tls)
    }

    pub fn control(&self) -> Duration {
        secs(self.control)
    }

    pub fn data(&self) -> Duration {
        secs(self.data)
    }
}

// a zero timeout would mean "block forever" to set_read_timeout callers
fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

/// TLS settings as they arrive from the credential store
#[derive(Debug, Deserialize)]
pub struct TlsOptions {
    /// Verify the server certificate chain and host name (JSON field: reject_unauthorized)
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
    /// Client certificate, PEM (JSON field: certificate)
    #[serde(default)]
    pub certificate: Option<String>,
    /// Client private key, PEM (JSON field: private_key)
    #[serde(default)]
    pub private_key: Option<SecretString>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            reject_unauthorized: true,
            certificate: None,
            private_key: None,
        }
    }
}

/// Normalised TLS options handed to the TLS layer
///
/// The certificate and the key are each present only when the configured
/// value was present and non-empty.
#[derive(Debug)]
pub struct SecureOptions {
    pub reject_unauthorized: bool,
    pub cert: Option<String>,
    pub key: Option<SecretString>,
}

impl TlsOptions {
    /// Builds the secure options, normalising both PEM inputs
    pub fn secure_options(&self) -> SecureOptions {
        let cert = self
            .certificate
            .as_deref()
            .map(normalize_pem)
            .filter(|pem| !pem.trim().is_empty());
        let key = self
            .private_key
            .as_ref()
            .map(|k| normalize_pem(k.expose_secret()))
            .filter(|pem| !pem.trim().is_empty())
            .map(SecretString::new);
        SecureOptions {
            reject_unauthorized: self.reject_unauthorized,
            cert,
            key,
        }
    }
}

/// FTP connection parameters, resolved by the caller
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Server hostname or IP address (JSON field: host)
    pub host: String,
    /// Server port, 0 or absent means 21 (JSON field: port)
    #[serde(default)]
    pub port: Option<u16>,
    /// Login name (JSON field: user)
    #[serde(alias = "username")]
    pub user: String,
    /// Login password (JSON field: password)
    #[serde(default = "empty_secret")]
    pub password: SecretString,
    /// Account for servers that answer PASS with 332 (JSON field: account)
    #[serde(default)]
    pub account: Option<String>,
    /// none, implicit or explicit (JSON field: secure)
    #[serde(default)]
    pub secure: SecureMode,
    #[serde(flatten)]
    pub tls: TlsOptions,
    /// Log every control-channel line (JSON field: verbose)
    #[serde(default, alias = "verbose_logging")]
    pub verbose: bool,
    /// passive, extended_passive, active or extended_active (JSON field: data_mode)
    #[serde(default)]
    pub data_mode: DataMode,
    /// Replace private PASV addresses with the control peer address (JSON field: passive_nat_workaround)
    #[serde(default = "default_true")]
    pub passive_nat_workaround: bool,
    /// Use MLSD for listings when the server advertises MLST (JSON field: prefer_mlsd)
    #[serde(default)]
    pub prefer_mlsd: bool,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_true() -> bool {
    true
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

impl ConnectionConfig {
    /// Plain-FTP configuration with default settings
    pub fn new(host: &str, user: &str, password: &str) -> Self {
        ConnectionConfig {
            host: host.to_string(),
            port: None,
            user: user.to_string(),
            password: SecretString::new(password.to_string()),
            account: None,
            secure: SecureMode::None,
            tls: TlsOptions::default(),
            verbose: false,
            data_mode: DataMode::Passive,
            passive_nat_workaround: true,
            prefer_mlsd: false,
            timeouts: Timeouts::default(),
        }
    }

    /// Port to connect to: the configured one, or 21 when unset or zero
    pub fn resolved_port(&self) -> u16 {
        match self.port {
            Some(port) if port != 0 => port,
            _ => DEFAULT_FTP_PORT,
        }
    }

    pub fn validate(&self) -> Result<(), FtpError> {
        if self.host.trim().is_empty() {
            return Err(FtpError::Config("host must not be empty".to_string()));
        }
        if self.user.is_empty() {
            return Err(FtpError::Config("user must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Restores newlines in PEM text whose line breaks were collapsed to spaces
///
/// Inside every `-----BEGIN X-----` .. `-----END X-----` block each run of
/// spaces becomes a single newline. The marker lines are left as they are,
/// and running the function twice gives the same result as running it once.
pub fn normalize_pem(pem: &str) -> String {
    PEM_BLOCK_RE
        .replace_all(pem, |caps: &Captures| {
            format!(
                "{}{}{}",
                &caps[1],
                SPACE_RUN_RE.replace_all(&caps[2], "\n"),
                &caps[3]
            )
        })
        .into_owned()
}

/// One operation request of a job
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Invocation {
    /// list, download, upload, delete, mkdir or rmdir (JSON field: operation)
    pub operation: String,
    #[serde(default)]
    pub remote_path: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub remote_folder_path: Option<String>,
}

/// One line of the jobs file: a connection and the items to run on it
#[derive(Debug, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Record failed items and keep going (JSON field: continue_on_fail)
    #[serde(default)]
    pub continue_on_fail: Option<bool>,
    pub items: Vec<Invocation>,
}

/// Parses a jobs file into a vector of Job structs
///
/// # Arguments
/// * `filename` - Path to the jobs file
///
/// # Errors
/// - File not found or unreadable
/// - Invalid JSON format or missing required fields
/// - Empty host or user
///
/// # File Format
/// JSONL format - one JSON object per line. Lines starting with `#` and
/// blank lines are skipped.
///
/// # Example
/// ```text
/// {"host":"ftp.example.com","user":"bob","password":"pw","secure":"explicit","items":[{"operation":"list","remote_folder_path":"/pub"}]}
/// ```
pub fn parse_jobs(filename: &str) -> Result<Vec<Job>, Error> {
    let file = File::open(filename)?;
    let reader = BufReader::new(file);

    let mut jobs = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let job: Job = serde_json::from_str(line).map_err(|e| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("invalid JSON on line {}: {}", line_num + 1, e),
            )
        })?;

        job.connection.validate().map_err(|e| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("line {}: {}", line_num + 1, e),
            )
        })?;

        jobs.push(job);
    }

    Ok(jobs)
}
