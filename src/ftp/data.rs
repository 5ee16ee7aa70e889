//! Per-transfer data connections
//!
//! [`prepare`] runs the mode negotiation on the control channel before the
//! transfer command is sent. [`DataChannel::establish`] completes the
//! connection after the 1xx reply: it accepts the inbound socket in active
//! mode and runs the TLS handshake on secure sessions.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use socket2::SockRef;

use crate::config::{DataMode, Timeouts};
use crate::error::{FtpError, FtpResult};
use crate::ftp::codec::{encode_eprt_arg, encode_port_arg, parse_epsv_reply, parse_pasv_reply};
use crate::ftp::control::ControlChannel;
use crate::ftp::stream::NetStream;
use crate::ftp::tls::TlsContext;

/// Poll interval while waiting for the server to connect in active mode
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// A data connection negotiated but not yet usable
#[derive(Debug)]
pub enum PreparedData {
    /// Passive modes: already connected to the server
    Connected(TcpStream),
    /// Active modes: waiting for the server to connect
    Listening(TcpListener),
}

/// Negotiates the data connection for the next transfer command
///
/// Negative or unparsable PASV/EPSV/PORT/EPRT replies and failed connects
/// all surface as `DataChannel`.
pub fn prepare(
    control: &mut ControlChannel,
    mode: DataMode,
    nat_workaround: bool,
) -> FtpResult<PreparedData> {
    let peer = control.peer_addr()?;
    let timeouts = *control.timeouts();
    match mode {
        DataMode::Passive if peer.is_ipv4() => passive(control, peer, nat_workaround, &timeouts),
        DataMode::Passive | DataMode::ExtendedPassive => extended_passive(control, peer, &timeouts),
        DataMode::Active | DataMode::ExtendedActive => active(control, mode),
    }
}

fn passive(
    control: &mut ControlChannel,
    peer: SocketAddr,
    nat_workaround: bool,
    timeouts: &Timeouts,
) -> FtpResult<PreparedData> {
    let reply = control.send_command("PASV", "").map_err(negotiation_error)?;
    if reply.code != 227 {
        return Err(FtpError::DataChannel(format!("unexpected PASV reply: {}", reply)));
    }
    let announced = parse_pasv_reply(&reply.text).map_err(negotiation_error)?;
    let addr = if nat_workaround {
        passive_target(*announced.ip(), announced.port(), peer.ip())
    } else {
        SocketAddr::from(announced)
    };
    connect(addr, timeouts)
}

fn extended_passive(
    control: &mut ControlChannel,
    peer: SocketAddr,
    timeouts: &Timeouts,
) -> FtpResult<PreparedData> {
    let reply = control.send_command("EPSV", "").map_err(negotiation_error)?;
    if reply.code != 229 {
        return Err(FtpError::DataChannel(format!("unexpected EPSV reply: {}", reply)));
    }
    let port = parse_epsv_reply(&reply.text).map_err(negotiation_error)?;
    connect(SocketAddr::new(peer.ip(), port), timeouts)
}

fn active(control: &mut ControlChannel, mode: DataMode) -> FtpResult<PreparedData> {
    let local_ip = control.local_addr()?.ip();
    let listener = TcpListener::bind(SocketAddr::new(local_ip, 0))
        .map_err(|e| FtpError::DataChannel(format!("cannot listen on {}: {}", local_ip, e)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| FtpError::DataChannel(format!("cannot listen on {}: {}", local_ip, e)))?;

    match (mode, addr) {
        (DataMode::Active, SocketAddr::V4(v4)) => {
            control
                .expect_completion("PORT", &encode_port_arg(v4))
                .map_err(negotiation_error)?;
        }
        _ => {
            control
                .expect_completion("EPRT", &encode_eprt_arg(addr))
                .map_err(negotiation_error)?;
        }
    }
    Ok(PreparedData::Listening(listener))
}

/// Address to dial for a PASV reply
///
/// Servers behind NAT often announce an internal or unspecified address. In
/// that case the control peer's address is used with the announced port.
pub fn passive_target(announced: Ipv4Addr, port: u16, control_peer: IpAddr) -> SocketAddr {
    let unusable = announced.is_unspecified()
        || (is_private(announced) && !control_peer_is_private(control_peer));
    if unusable {
        SocketAddr::new(control_peer, port)
    } else {
        SocketAddr::new(IpAddr::V4(announced), port)
    }
}

fn is_private(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn control_peer_is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private(v4),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn connect(addr: SocketAddr, timeouts: &Timeouts) -> FtpResult<PreparedData> {
    TcpStream::connect_timeout(&addr, timeouts.connect())
        .map(PreparedData::Connected)
        .map_err(|e| FtpError::DataChannel(format!("cannot connect to {}: {}", addr, e)))
}

// Control-channel failures stay what they are, reply problems become DataChannel
fn negotiation_error(e: FtpError) -> FtpError {
    match e {
        FtpError::Command { command, code, text } => {
            FtpError::DataChannel(format!("{} refused: {} {}", command, code, text))
        }
        FtpError::Protocol(msg) => FtpError::DataChannel(msg),
        other => other,
    }
}

/// An open data connection
///
/// Closes itself on drop. While open it is counted in the session's
/// data-channel counter.
pub struct DataChannel {
    stream: Option<NetStream>,
    open_channels: Arc<AtomicUsize>,
    bytes: u64,
}

impl DataChannel {
    /// Completes a prepared connection: accept (active), then TLS if secure
    pub fn establish(
        prepared: PreparedData,
        tls: Option<&TlsContext>,
        timeouts: &Timeouts,
        open_channels: &Arc<AtomicUsize>,
    ) -> FtpResult<Self> {
        let tcp = match prepared {
            PreparedData::Connected(tcp) => tcp,
            PreparedData::Listening(listener) => accept(&listener, timeouts.data())?,
        };

        let stream = match tls {
            Some(ctx) => NetStream::Tls(Box::new(ctx.handshake(tcp, timeouts.tls()).map_err(
                |e| FtpError::DataChannel(format!("data connection TLS handshake: {}", e)),
            )?)),
            None => NetStream::Plain(tcp),
        };
        stream
            .set_timeouts(timeouts.data())
            .map_err(|e| FtpError::DataChannel(format!("cannot set socket timeouts: {}", e)))?;

        open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(DataChannel {
            stream: Some(stream),
            open_channels: Arc::clone(open_channels),
            bytes: 0,
        })
    }

    /// Bytes read or written so far
    pub fn transferred(&self) -> u64 {
        self.bytes
    }

    /// Sends close_notify (TLS) and shuts the socket down; idempotent
    ///
    /// For uploads this is what tells the server the file is complete.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
            stream.shutdown();
            self.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Resets the connection instead of closing it cleanly
    ///
    /// Used after a failed transfer. The peer sees a reset rather than EOF,
    /// so a server never mistakes a truncated upload for a complete one.
    pub fn abort(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = SockRef::from(stream.tcp()).set_linger(Some(Duration::ZERO));
            drop(stream);
            self.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut NetStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "data channel is closed"))
    }
}

impl Read for DataChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream_mut()?.read(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }
}

impl Write for DataChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream_mut()?.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream_mut()?.flush()
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept(listener: &TcpListener, timeout: Duration) -> FtpResult<TcpStream> {
    let fail = |e: io::Error| FtpError::DataChannel(format!("cannot accept data connection: {}", e));
    listener.set_nonblocking(true).map_err(fail)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((tcp, _)) => {
                tcp.set_nonblocking(false).map_err(fail)?;
                return Ok(tcp);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(FtpError::DataChannel(
                        "timed out waiting for the server to connect".to_string(),
                    ));
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(fail(e)),
        }
    }
}
