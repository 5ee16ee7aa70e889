//! Byte pump between a local resource and a data channel

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::error::{is_timeout, FtpError, FtpResult};
use crate::shutdown::is_shutdown_requested;

/// Bytes moved per read/write round
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Cancels the running transfer of one session from another thread
///
/// The pump checks it between chunks, together with the process-wide
/// shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || is_shutdown_requested()
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

/// One file transfer and how it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub direction: Direction,
    pub bytes: u64,
    pub status: TransferStatus,
}

impl TransferDescriptor {
    pub fn new(local_path: &Path, remote_path: &str, direction: Direction) -> Self {
        TransferDescriptor {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            direction,
            bytes: 0,
            status: TransferStatus::Pending,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Completed
    }
}

// Serialised as the transfer summary of a job result
impl Serialize for TransferDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("TransferDescriptor", 6)?;
        s.serialize_field("success", &self.is_success())?;
        s.serialize_field("direction", &self.direction)?;
        s.serialize_field("bytes", &self.bytes)?;
        s.serialize_field("local_path", &self.local_path.to_string_lossy())?;
        s.serialize_field("remote_path", &self.remote_path)?;
        s.serialize_field("status", &self.status)?;
        s.end()
    }
}

/// Copies `src` into `dst` in chunks until EOF
///
/// `direction` tells which side is local: for a download the reader is the
/// data channel and write errors are local, for an upload it is the other way
/// round. `moved` is kept current so the caller knows the count on failure.
pub fn pump<R: Read + ?Sized, W: Write + ?Sized>(
    src: &mut R,
    dst: &mut W,
    direction: Direction,
    local_path: &Path,
    cancel: &CancelToken,
    moved: &mut u64,
) -> FtpResult<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(FtpError::Cancelled);
        }
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(side_error(direction, true, local_path, e)),
        };
        dst.write_all(&buf[..n])
            .map_err(|e| side_error(direction, false, local_path, e))?;
        *moved += n as u64;
    }
    dst.flush()
        .map_err(|e| side_error(direction, false, local_path, e))
}

fn side_error(direction: Direction, reading: bool, local_path: &Path, e: io::Error) -> FtpError {
    let local = match direction {
        Direction::Download => !reading,
        Direction::Upload => reading,
    };
    if local {
        FtpError::Local {
            path: local_path.to_path_buf(),
            source: e,
        }
    } else if is_timeout(&e) {
        FtpError::DataChannel("data connection timed out".to_string())
    } else {
        FtpError::DataChannel(format!("data connection failed: {}", e))
    }
}
