//! Plain or TLS byte stream shared by the control and data channels

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use rustls::{ClientConnection, StreamOwned};

/// Upper bound for reading the peer's leftovers on a TLS close
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub enum NetStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl NetStream {
    /// The underlying TCP socket
    pub fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain(tcp) => tcp,
            NetStream::Tls(tls) => &tls.sock,
        }
    }

    pub fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        let tcp = self.tcp();
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Sends close_notify when TLS is active, then shuts the socket down
    ///
    /// On TLS the write side is closed first and whatever the server still
    /// sends (session tickets, its own close_notify) is drained. Closing a
    /// socket with unread input sends a reset, which can make the server
    /// drop the tail of an upload. Errors are ignored: the peer may already
    /// be gone.
    pub fn shutdown(&mut self) {
        if let NetStream::Tls(tls) = self {
            let StreamOwned { conn, sock } = &mut **tls;
            conn.send_close_notify();
            while conn.wants_write() {
                if conn.write_tls(sock).is_err() {
                    break;
                }
            }
            if sock.shutdown(Shutdown::Write).is_ok() {
                drain(sock);
            }
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

fn drain(sock: &mut TcpStream) {
    let mut scratch = [0u8; 4096];
    if sock.set_read_timeout(Some(DRAIN_TIMEOUT)).is_err() {
        return;
    }
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while Instant::now() < deadline {
        match sock.read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(tcp) => tcp.read(buf),
            // many FTP servers close the data connection without close_notify;
            // the completion reply on the control channel is what counts
            NetStream::Tls(tls) => match tls.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
                other => other,
            },
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(tcp) => tcp.write(buf),
            NetStream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Plain(tcp) => tcp.flush(),
            NetStream::Tls(tls) => tls.flush(),
        }
    }
}
