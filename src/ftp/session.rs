//! Session façade: connection state plus the public operation API
//!
//! A session owns one control channel and at most one data channel at a
//! time. After every operation the control channel is either in sync and the
//! session is `Authenticated`, or it has been closed and the session is
//! `Disconnected`. Nothing is left half-open.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::{FtpError, FtpResult};
use crate::ftp::listing::DirEntry;
use crate::ftp::ops::{Connection, Operation, OperationOutput};
use crate::ftp::transfer::{CancelToken, TransferDescriptor};
use crate::logging::log_with_session;

static SESSION_SEQ: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Busy,
    Closed,
}

pub struct Session {
    config: ConnectionConfig,
    state: SessionState,
    conn: Option<Connection>,
    tag: String,
    open_channels: Arc<AtomicUsize>,
    cancel: CancelToken,
}

impl Session {
    /// Creates a disconnected session for `config`
    pub fn new(config: ConnectionConfig) -> Self {
        let id = SESSION_SEQ.fetch_add(1, Ordering::SeqCst);
        Session {
            config,
            state: SessionState::Disconnected,
            conn: None,
            tag: format!("S{}", id),
            open_channels: Arc::new(AtomicUsize::new(0)),
            cancel: CancelToken::new(),
        }
    }

    /// Creates a session and connects it
    pub fn open(config: ConnectionConfig) -> FtpResult<Self> {
        let mut session = Session::new(config);
        session.connect()?;
        Ok(session)
    }

    /// Connects, secures and authenticates the control channel
    ///
    /// Allowed from `Disconnected`, including after a failed operation closed
    /// the channel. A no-op when already authenticated.
    pub fn connect(&mut self) -> FtpResult<()> {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Authenticated => return Ok(()),
            SessionState::Closed => {
                return Err(FtpError::InvalidState("session is closed".to_string()))
            }
            SessionState::Connecting | SessionState::Busy => {
                return Err(FtpError::InvalidState(
                    "another operation is in progress".to_string(),
                ))
            }
        }

        self.config.validate()?;
        self.state = SessionState::Connecting;
        self.cancel.reset();
        match Connection::establish(&self.config, &self.tag, &self.open_channels, &self.cancel) {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                let _ = log_with_session(
                    &self.tag,
                    format!("Connection to {} failed: {}", self.config.host, e),
                );
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    pub fn list(&mut self, path: Option<&str>) -> FtpResult<Vec<DirEntry>> {
        self.run(|conn| conn.list(path))
    }

    pub fn download(&mut self, remote: &str, local: &Path) -> FtpResult<TransferDescriptor> {
        self.run(|conn| conn.download(remote, local))
    }

    pub fn upload(&mut self, local: &Path, remote: &str) -> FtpResult<TransferDescriptor> {
        self.run(|conn| conn.upload(local, remote))
    }

    pub fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.run(|conn| conn.delete(path))
    }

    pub fn mkdir(&mut self, path: &str) -> FtpResult<()> {
        self.run(|conn| conn.mkdir(path))
    }

    pub fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        self.run(|conn| conn.rmdir(path))
    }

    /// Runs any operation, as parsed from an invocation
    pub fn execute(&mut self, op: &Operation) -> FtpResult<OperationOutput> {
        self.run(|conn| conn.execute(op))
    }

    /// Keep-alive
    pub fn noop(&mut self) -> FtpResult<()> {
        self.run(|conn| conn.control.noop())
    }

    pub fn pwd(&mut self) -> FtpResult<String> {
        self.run(|conn| conn.control.pwd())
    }

    /// Sends QUIT if possible and releases both channels; idempotent
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            let _ = log_with_session(&self.tag, format!("Closed connection to {}", self.config.host));
        }
        self.state = SessionState::Closed;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True while a data connection of this session is open
    pub fn is_data_channel_open(&self) -> bool {
        self.open_channels.load(Ordering::SeqCst) > 0
    }

    /// Handle for cancelling the running transfer from another thread
    ///
    /// Cancelling closes both channels; the session can reconnect afterwards.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Log tag of this session (`S<n>`)
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn run<T, F>(&mut self, op: F) -> FtpResult<T>
    where
        F: FnOnce(&mut Connection) -> FtpResult<T>,
    {
        match self.state {
            SessionState::Authenticated => {}
            SessionState::Busy | SessionState::Connecting => {
                return Err(FtpError::InvalidState(
                    "another operation is in progress".to_string(),
                ))
            }
            SessionState::Closed => {
                return Err(FtpError::InvalidState("session is closed".to_string()))
            }
            SessionState::Disconnected => {
                return Err(FtpError::InvalidState("session is not connected".to_string()))
            }
        }
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => {
                self.state = SessionState::Disconnected;
                return Err(FtpError::InvalidState("session is not connected".to_string()));
            }
        };

        self.state = SessionState::Busy;
        let result = op(conn);

        if conn.control.is_synchronized() {
            self.state = SessionState::Authenticated;
        } else {
            conn.close();
            self.conn = None;
            self.state = SessionState::Disconnected;
            let _ = log_with_session(&self.tag, "Control channel out of sync, connection closed");
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataMode;
    use crate::ftp::listing::EntryKind;
    use crate::ftp::mock::{MockServer, TlsMode};
    use rustls::HandshakeKind;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    fn open(server: &MockServer) -> Session {
        Session::open(server.config()).unwrap()
    }

    #[test]
    #[serial]
    fn test_list_pub() {
        let server = MockServer::start();
        let mut session = open(&server);
        assert_eq!(session.state(), SessionState::Authenticated);

        let entries = session.list(Some("/pub")).unwrap();
        assert_eq!(entries.len(), 2);
        let dir = entries.iter().find(|e| e.name == "dir1").unwrap();
        assert_eq!(dir.kind, EntryKind::Directory);
        let file = entries.iter().find(|e| e.name == "file.txt").unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, 1234);

        assert!(!session.is_data_channel_open());
        assert_eq!(session.state(), SessionState::Authenticated);
        session.close();
        assert_eq!(server.max_data_connections(), 1);
    }

    #[test]
    #[serial]
    fn test_upload_then_download_round_trip() {
        let server = MockServer::start();
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let target = dir.path().join("target.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(&source, &content).unwrap();

        let mut session = open(&server);
        let up = session.upload(&source, "/pub/upload.bin").unwrap();
        assert!(up.is_success());
        assert_eq!(up.bytes, content.len() as u64);
        assert!(!session.is_data_channel_open());
        assert_eq!(server.file("/pub/upload.bin").unwrap(), content);

        let down = session.download("/pub/upload.bin", &target).unwrap();
        assert_eq!(down.bytes, content.len() as u64);
        assert!(!session.is_data_channel_open());
        assert_eq!(fs::read(&target).unwrap(), content);
        assert_eq!(server.max_data_connections(), 1);
    }

    #[test]
    #[serial]
    fn test_stor_rejected_after_data_close() {
        let server = MockServer::start();
        server.set_stor_reply("550 Quota exceeded");
        let dir = tempdir().unwrap();
        let source = dir.path().join("big.bin");
        fs::write(&source, vec![1u8; 4096]).unwrap();

        let mut session = open(&server);
        let err = session.upload(&source, "/pub/big.bin").unwrap_err();
        match err {
            FtpError::TransferIncomplete { bytes, code, .. } => {
                assert_eq!(bytes, 4096);
                assert_eq!(code, Some(550));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // the completion reply was read, so the session stays usable
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(!session.is_data_channel_open());
        session.noop().unwrap();
    }

    #[test]
    #[serial]
    fn test_download_missing_file() {
        let server = MockServer::start();
        let dir = tempdir().unwrap();
        let target = dir.path().join("missing.txt");

        let mut session = open(&server);
        let err = session.download("/pub/missing.txt", &target).unwrap_err();
        assert!(matches!(err, FtpError::Command { code: 550, .. }), "{:?}", err);
        assert!(!target.exists(), "partial file left behind");
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(!session.is_data_channel_open());
    }

    #[test]
    #[serial]
    fn test_directory_operations() {
        let server = MockServer::start();
        let mut session = open(&server);

        session.mkdir("/pub/new").unwrap();
        assert!(server.has_dir("/pub/new"));
        session.rmdir("/pub/new").unwrap();
        assert!(!server.has_dir("/pub/new"));

        session.delete("/pub/file.txt").unwrap();
        assert!(server.file("/pub/file.txt").is_none());

        let err = session.delete("/pub/file.txt").unwrap_err();
        assert_eq!(err.code(), Some(550));
        assert_eq!(session.pwd().unwrap(), "/");
    }

    #[test]
    #[serial]
    fn test_active_and_extended_modes() {
        for mode in [DataMode::Active, DataMode::ExtendedActive, DataMode::ExtendedPassive] {
            let server = MockServer::start();
            let mut config = server.config();
            config.data_mode = mode;
            let mut session = Session::open(config).unwrap();

            let entries = session.list(Some("/pub")).unwrap();
            assert_eq!(entries.len(), 2, "mode {:?}", mode);

            let dir = tempdir().unwrap();
            let target = dir.path().join("file.txt");
            let desc = session.download("/pub/file.txt", &target).unwrap();
            assert_eq!(desc.bytes, 1234, "mode {:?}", mode);
            assert!(!session.is_data_channel_open());
        }
    }

    #[test]
    #[serial]
    fn test_execute_invocation() {
        let server = MockServer::start();
        let mut session = open(&server);
        let op = Operation::List {
            path: Some("/pub/dir1".to_string()),
        };
        match session.execute(&op).unwrap() {
            OperationOutput::Entries(entries) => assert!(entries.is_empty()),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_close_is_idempotent() {
        let server = MockServer::start();
        let mut session = open(&server);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.list(None).unwrap_err();
        assert!(matches!(err, FtpError::InvalidState(_)));
        assert!(session.connect().is_err());
    }

    #[test]
    #[serial]
    fn test_operations_require_connection() {
        let server = MockServer::start();
        let mut session = Session::new(server.config());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(session.noop(), Err(FtpError::InvalidState(_))));
        session.connect().unwrap();
        session.noop().unwrap();
    }

    #[test]
    #[serial]
    fn test_wrong_password() {
        let server = MockServer::start();
        let mut config = server.config();
        config.password = secrecy::SecretString::new("wrong".to_string());
        let err = Session::open(config).err().unwrap();
        assert!(matches!(err, FtpError::Command { code: 530, .. }), "{:?}", err);
    }

    #[test]
    #[serial]
    fn test_cancelled_session_reconnects() {
        let server = MockServer::start();
        let mut session = open(&server);
        session.cancel_handle().cancel();

        let err = session.list(Some("/pub")).unwrap_err();
        assert!(matches!(err, FtpError::Cancelled));
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect().unwrap();
        assert_eq!(session.list(Some("/pub")).unwrap().len(), 2);
    }

    #[test]
    #[serial]
    fn test_download_keeps_existing_file_when_retr_refused() {
        let server = MockServer::start();
        let dir = tempdir().unwrap();
        let target = dir.path().join("keep.txt");
        fs::write(&target, b"local copy").unwrap();

        let mut session = open(&server);
        let err = session.download("/pub/missing.txt", &target).unwrap_err();
        assert_eq!(err.code(), Some(550));
        assert_eq!(fs::read(&target).unwrap(), b"local copy");
    }

    #[test]
    #[serial]
    fn test_upload_read_failure_does_not_commit_file() {
        let server = MockServer::start();
        let dir = tempdir().unwrap();

        let mut session = open(&server);
        // a directory opens fine but fails on the first read
        let err = session.upload(dir.path(), "/pub/broken.bin").unwrap_err();
        assert!(matches!(err, FtpError::Local { .. }), "{:?}", err);
        assert!(server.file("/pub/broken.bin").is_none());
        assert!(!session.is_data_channel_open());
    }

    #[test]
    #[serial]
    fn test_explicit_tls_reuses_session_on_data_channels() {
        let server = MockServer::start_tls(TlsMode::Explicit);
        let mut session = open(&server);
        assert!(server.protected_data());

        for _ in 0..3 {
            assert_eq!(session.list(Some("/pub")).unwrap().len(), 2);
        }
        assert_eq!(
            server.data_handshakes(),
            vec![Some(HandshakeKind::Resumed); 3]
        );
        session.close();
    }

    #[test]
    #[serial]
    fn test_implicit_tls_round_trip() {
        let server = MockServer::start_tls(TlsMode::Implicit);
        let dir = tempdir().unwrap();
        let source = dir.path().join("secure.bin");
        let target = dir.path().join("secure.out");
        let content: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &content).unwrap();

        let mut session = open(&server);
        assert!(server.protected_data());
        let up = session.upload(&source, "/pub/secure.bin").unwrap();
        assert_eq!(up.bytes, content.len() as u64);
        assert_eq!(server.file("/pub/secure.bin").unwrap(), content);

        session.download("/pub/secure.bin", &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), content);
        assert_eq!(
            server.data_handshakes(),
            vec![Some(HandshakeKind::Resumed); 2]
        );
        assert_eq!(session.state(), SessionState::Authenticated);
    }
}
