//! File and directory operations over an authenticated connection

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::config::{ConnectionConfig, DataMode, Invocation, SecureMode};
use crate::error::{FtpError, FtpResult};
use crate::ftp::control::ControlChannel;
use crate::ftp::data::{self, DataChannel};
use crate::ftp::listing::{parse_listing, DirEntry};
use crate::ftp::tls::TlsContext;
use crate::ftp::transfer::{pump, CancelToken, Direction, TransferDescriptor, TransferStatus};
use crate::logging::log_with_session;

/// A request against the remote file system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// List a directory; `None` lists the current one
    List { path: Option<String> },
    Download { remote: String, local: PathBuf },
    Upload { local: PathBuf, remote: String },
    Delete { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
}

impl Operation {
    /// Builds an operation from its name and per-item parameters
    pub fn from_invocation(item: &Invocation) -> FtpResult<Self> {
        let name = item.operation.trim();
        match name {
            "list" => Ok(Operation::List {
                path: item.remote_folder_path.clone().filter(|p| !p.is_empty()),
            }),
            "download" => Ok(Operation::Download {
                remote: required(&item.remote_path, name, "remote_path")?,
                local: PathBuf::from(required(&item.local_path, name, "local_path")?),
            }),
            "upload" => Ok(Operation::Upload {
                local: PathBuf::from(required(&item.local_path, name, "local_path")?),
                remote: required(&item.remote_path, name, "remote_path")?,
            }),
            "delete" => Ok(Operation::Delete {
                path: required(&item.remote_path, name, "remote_path")?,
            }),
            "mkdir" => Ok(Operation::Mkdir {
                path: required(&item.remote_folder_path, name, "remote_folder_path")?,
            }),
            "rmdir" => Ok(Operation::Rmdir {
                path: required(&item.remote_folder_path, name, "remote_folder_path")?,
            }),
            other => Err(FtpError::UnsupportedOperation(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::List { .. } => "list",
            Operation::Download { .. } => "download",
            Operation::Upload { .. } => "upload",
            Operation::Delete { .. } => "delete",
            Operation::Mkdir { .. } => "mkdir",
            Operation::Rmdir { .. } => "rmdir",
        }
    }
}

fn required(value: &Option<String>, operation: &str, field: &str) -> FtpResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(FtpError::Config(format!("{} requires {}", operation, field))),
    }
}

/// What an operation produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Entries(Vec<DirEntry>),
    Transfer(TransferDescriptor),
    Done,
}

/// An authenticated control channel plus everything needed for data transfers
pub(crate) struct Connection {
    pub(crate) control: ControlChannel,
    tls: Option<TlsContext>,
    settings: DataSettings,
    tag: String,
    open_channels: Arc<AtomicUsize>,
    cancel: CancelToken,
}

struct DataSettings {
    mode: DataMode,
    nat_workaround: bool,
    prefer_mlsd: bool,
}

impl Connection {
    /// Connect, secure, log in and apply the session defaults
    pub(crate) fn establish(
        config: &ConnectionConfig,
        tag: &str,
        open_channels: &Arc<AtomicUsize>,
        cancel: &CancelToken,
    ) -> FtpResult<Self> {
        let tls = match config.secure {
            SecureMode::None => None,
            SecureMode::Implicit | SecureMode::Explicit => Some(TlsContext::new(
                &config.host,
                &config.tls.secure_options(),
                tag,
            )?),
        };
        let implicit = match config.secure {
            SecureMode::Implicit => tls.as_ref(),
            _ => None,
        };

        let (mut control, greeting) = ControlChannel::connect(
            &config.host,
            config.resolved_port(),
            config.timeouts,
            implicit,
            tag,
            config.verbose,
        )?;
        let _ = log_with_session(
            tag,
            format!(
                "Connected to {}:{} ({})",
                config.host,
                config.resolved_port(),
                greeting.text.lines().next().unwrap_or("")
            ),
        );

        if config.secure == SecureMode::Explicit {
            if let Some(ctx) = tls.as_ref() {
                control.upgrade_tls(ctx)?;
            }
        }

        control.login(&config.user, &config.password, config.account.as_deref())?;
        let _ = log_with_session(tag, format!("Logged in as {}", config.user));

        control.load_features()?;
        if control.has_feature("UTF8") {
            // not every server that advertises UTF8 accepts the OPTS form
            if let Err(e) = control.send_command("OPTS", "UTF8 ON") {
                if !matches!(e, FtpError::Command { .. }) {
                    return Err(e);
                }
            }
        }
        control.expect_completion("TYPE", "I")?;
        if tls.is_some() {
            control.expect_completion("PBSZ", "0")?;
            control.expect_completion("PROT", "P")?;
        }

        Ok(Connection {
            control,
            tls,
            settings: DataSettings {
                mode: config.data_mode,
                nat_workaround: config.passive_nat_workaround,
                prefer_mlsd: config.prefer_mlsd,
            },
            tag: tag.to_string(),
            open_channels: Arc::clone(open_channels),
            cancel: cancel.clone(),
        })
    }

    pub(crate) fn execute(&mut self, op: &Operation) -> FtpResult<OperationOutput> {
        match op {
            Operation::List { path } => self.list(path.as_deref()).map(OperationOutput::Entries),
            Operation::Download { remote, local } => {
                self.download(remote, local).map(OperationOutput::Transfer)
            }
            Operation::Upload { local, remote } => {
                self.upload(local, remote).map(OperationOutput::Transfer)
            }
            Operation::Delete { path } => self.delete(path).map(|_| OperationOutput::Done),
            Operation::Mkdir { path } => self.mkdir(path).map(|_| OperationOutput::Done),
            Operation::Rmdir { path } => self.rmdir(path).map(|_| OperationOutput::Done),
        }
    }

    pub(crate) fn list(&mut self, path: Option<&str>) -> FtpResult<Vec<DirEntry>> {
        if let Some(path) = path {
            self.control.expect_completion("CWD", path)?;
        }
        let verb = if self.settings.prefer_mlsd && self.control.has_feature("MLST") {
            "MLSD"
        } else {
            "LIST"
        };
        let mut raw = Vec::new();
        let listing_path = PathBuf::from(format!("<{} listing>", verb));
        self.with_data_channel(verb, "", |channel, cancel, moved| {
            pump(channel, &mut raw, Direction::Download, &listing_path, cancel, moved)
        })?;
        Ok(parse_listing(&String::from_utf8_lossy(&raw)))
    }

    pub(crate) fn download(&mut self, remote: &str, local: &Path) -> FtpResult<TransferDescriptor> {
        let mut desc = TransferDescriptor::new(local, remote, Direction::Download);
        // the local file is only touched once the server has accepted RETR
        let mut created = false;
        let result = self.with_data_channel("RETR", remote, |channel, cancel, moved| {
            let mut file = File::create(local).map_err(|e| FtpError::Local {
                path: local.to_path_buf(),
                source: e,
            })?;
            created = true;
            pump(channel, &mut file, Direction::Download, local, cancel, moved)
        });
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                if created {
                    let _ = fs::remove_file(local);
                }
                return Err(e);
            }
        };

        desc.bytes = bytes;
        desc.status = TransferStatus::Completed;
        let _ = log_with_session(
            &self.tag,
            format!("Downloaded {} to {} ({} bytes)", remote, local.display(), bytes),
        );
        Ok(desc)
    }

    pub(crate) fn upload(&mut self, local: &Path, remote: &str) -> FtpResult<TransferDescriptor> {
        let mut desc = TransferDescriptor::new(local, remote, Direction::Upload);
        let mut file = File::open(local).map_err(|e| FtpError::Local {
            path: local.to_path_buf(),
            source: e,
        })?;

        let bytes = self.with_data_channel("STOR", remote, |channel, cancel, moved| {
            pump(&mut file, channel, Direction::Upload, local, cancel, moved)
        })?;
        desc.bytes = bytes;
        desc.status = TransferStatus::Completed;
        let _ = log_with_session(
            &self.tag,
            format!("Uploaded {} to {} ({} bytes)", local.display(), remote, bytes),
        );
        Ok(desc)
    }

    pub(crate) fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.control.expect_completion("DELE", path).map(|_| ())
    }

    pub(crate) fn mkdir(&mut self, path: &str) -> FtpResult<()> {
        self.control.expect_completion("MKD", path).map(|_| ())
    }

    pub(crate) fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        self.control.expect_completion("RMD", path).map(|_| ())
    }

    /// Runs one data-bearing command with a scoped data channel
    ///
    /// The channel is closed before the completion reply is read. A failed
    /// `transfer` resets the data connection instead of closing it, so the
    /// server answers 426 rather than committing a short file. Returns the
    /// number of bytes moved.
    fn with_data_channel<F>(&mut self, verb: &str, arg: &str, transfer: F) -> FtpResult<u64>
    where
        F: FnOnce(&mut DataChannel, &CancelToken, &mut u64) -> FtpResult<()>,
    {
        if self.cancel.is_cancelled() {
            self.control.abort();
            return Err(FtpError::Cancelled);
        }

        let prepared = data::prepare(&mut self.control, self.settings.mode, self.settings.nat_workaround)?;

        self.control.write_command(verb, arg)?;
        let reply = self.control.read_reply()?;
        if reply.is_negative() {
            return Err(FtpError::from_reply(verb, &reply));
        }
        if !reply.is_preliminary() {
            return Err(FtpError::Protocol(format!(
                "unexpected reply to {}: {}",
                verb, reply
            )));
        }

        let timeouts = *self.control.timeouts();
        let mut channel =
            match DataChannel::establish(prepared, self.tls.as_ref(), &timeouts, &self.open_channels) {
                Ok(channel) => channel,
                Err(e) => {
                    self.resync(verb);
                    return Err(e);
                }
            };

        let mut moved = 0;
        let result = transfer(&mut channel, &self.cancel, &mut moved);
        match result {
            Ok(()) => channel.close(),
            Err(_) => channel.abort(),
        }

        match result {
            Ok(()) => {}
            Err(FtpError::Cancelled) => {
                let _ = log_with_session(
                    &self.tag,
                    format!("{} cancelled after {} bytes", verb, channel.transferred()),
                );
                self.control.abort();
                return Err(FtpError::Cancelled);
            }
            Err(e) => {
                self.resync(verb);
                return Err(e);
            }
        }

        match self.control.read_reply() {
            Ok(reply) if reply.is_completion() => Ok(moved),
            Ok(reply) => Err(FtpError::TransferIncomplete {
                bytes: moved,
                code: Some(reply.code),
                text: reply.text,
            }),
            Err(e) => Err(FtpError::TransferIncomplete {
                bytes: moved,
                code: None,
                text: e.to_string(),
            }),
        }
    }

    // The server still owes the completion (usually 426/451) of the aborted command
    fn resync(&mut self, verb: &str) {
        if let Err(e) = self.control.read_reply() {
            let _ = log_with_session(
                &self.tag,
                format!("Lost control channel after failed {}: {}", verb, e),
            );
        }
    }

    pub(crate) fn close(&mut self) {
        self.control.close();
    }
}
