//! FTP/FTPS client session engine
//!
//! Layers, leaves first: [`codec`] (reply and command wire format),
//! [`stream`] and [`tls`] (plain or rustls sockets), [`control`] (the
//! command channel), [`data`] and [`transfer`] (per-transfer connections and
//! the byte pump), [`listing`], [`ops`] and finally [`session`], the façade
//! callers use.

pub mod codec;
pub mod control;
pub mod data;
pub mod listing;
pub mod ops;
pub mod session;
pub mod stream;
pub mod tls;
pub mod transfer;

#[cfg(test)]
pub(crate) mod mock;

pub use listing::{DirEntry, EntryKind};
pub use ops::{Operation, OperationOutput};
pub use session::{Session, SessionState};
pub use transfer::{CancelToken, Direction, TransferDescriptor, TransferStatus};
