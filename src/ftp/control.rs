//! The command/reply connection of a session
//!
//! Exchanges are single-flight: a command may be written only when no reply
//! is outstanding. A 1xx reply leaves the channel pending until the
//! completion reply has been read.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::Timeouts;
use crate::error::{is_timeout, FtpError, FtpResult};
use crate::ftp::codec::{encode_command, parse_quoted_path, Reply, ReplyAccumulator};
use crate::ftp::stream::NetStream;
use crate::ftp::tls::TlsContext;
use crate::logging::{log_protocol_line, log_with_session};

/// Socket timeout used for the farewell QUIT
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest reply line accepted before the server is considered broken
const MAX_LINE_LEN: usize = 8192;

pub struct ControlChannel {
    reader: Option<BufReader<NetStream>>,
    tag: String,
    verbose: bool,
    timeouts: Timeouts,
    /// A 1xx reply was read and its completion is still outstanding
    pending: bool,
    /// Cleared when a read or write failed half-way through an exchange
    in_sync: bool,
    features: HashSet<String>,
}

impl ControlChannel {
    /// Connects to the first reachable address of `host:port` and reads the greeting
    ///
    /// With `implicit_tls` the socket is wrapped before anything is read.
    pub fn connect(
        host: &str,
        port: u16,
        timeouts: Timeouts,
        implicit_tls: Option<&TlsContext>,
        tag: &str,
        verbose: bool,
    ) -> FtpResult<(Self, Reply)> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| FtpError::Connection(format!("cannot resolve {}: {}", host, e)))?
            .collect();

        if addrs.is_empty() {
            return Err(FtpError::Connection(format!("no addresses found for {}", host)));
        }

        // Try each address until one succeeds
        let mut last_error = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeouts.connect()) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(format!("{}: {}", addr, e)),
            }
        }
        let tcp = match tcp {
            Some(tcp) => tcp,
            None => {
                return Err(FtpError::Connection(format!(
                    "cannot connect to {}:{}: {}",
                    host,
                    port,
                    last_error.unwrap_or_else(|| "no address reachable".to_string())
                )))
            }
        };

        let stream = match implicit_tls {
            Some(ctx) => NetStream::Tls(Box::new(ctx.handshake(tcp, timeouts.tls())?)),
            None => NetStream::Plain(tcp),
        };
        stream
            .set_timeouts(timeouts.control())
            .map_err(|e| FtpError::Connection(format!("cannot set socket timeouts: {}", e)))?;

        let mut channel = ControlChannel {
            reader: Some(BufReader::new(stream)),
            tag: tag.to_string(),
            verbose,
            timeouts,
            pending: false,
            in_sync: true,
            features: HashSet::new(),
        };

        let mut greeting = channel.read_reply()?;
        if greeting.code == 120 {
            // service ready in a few minutes
            greeting = channel.read_reply()?;
        }
        if greeting.code != 220 {
            channel.close();
            return Err(FtpError::from_reply("connect", &greeting));
        }

        Ok((channel, greeting))
    }

    /// Explicit FTPS: `AUTH TLS`, then a handshake over the same socket
    pub fn upgrade_tls(&mut self, ctx: &TlsContext) -> FtpResult<()> {
        let reply = self.send_command("AUTH", "TLS")?;
        if reply.code != 234 {
            return Err(FtpError::from_reply("AUTH TLS", &reply));
        }

        let reader = self
            .reader
            .take()
            .ok_or_else(|| FtpError::InvalidState("control channel is closed".to_string()))?;
        if !reader.buffer().is_empty() {
            // bytes after 234 would be read in plaintext
            self.in_sync = false;
            return Err(FtpError::Protocol(
                "unexpected data received before the TLS handshake".to_string(),
            ));
        }
        let tcp = match reader.into_inner() {
            NetStream::Plain(tcp) => tcp,
            NetStream::Tls(_) => {
                self.in_sync = false;
                return Err(FtpError::InvalidState(
                    "control channel is already secured".to_string(),
                ));
            }
        };

        let tls = ctx.handshake(tcp, self.timeouts.tls())?;
        let stream = NetStream::Tls(Box::new(tls));
        stream
            .set_timeouts(self.timeouts.control())
            .map_err(|e| FtpError::Connection(format!("cannot set socket timeouts: {}", e)))?;
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    /// USER / PASS, answering a 332 with ACCT
    pub fn login(
        &mut self,
        user: &str,
        password: &SecretString,
        account: Option<&str>,
    ) -> FtpResult<()> {
        let mut reply = self.send_command("USER", user)?;
        if reply.code == 331 {
            reply = self.send_command("PASS", password.expose_secret())?;
        }
        if reply.code == 332 {
            reply = self.send_command("ACCT", account.unwrap_or(""))?;
        }
        match reply.code {
            230 | 202 => Ok(()),
            _ => Err(FtpError::from_reply("login", &reply)),
        }
    }

    /// Queries FEAT and remembers the advertised keywords
    ///
    /// Servers without FEAT leave the feature set empty.
    pub fn load_features(&mut self) -> FtpResult<()> {
        self.features.clear();
        let reply = match self.send_command("FEAT", "") {
            Ok(reply) => reply,
            Err(FtpError::Command { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        // first and last lines are the 211 header and footer
        for line in reply.lines().skip(1) {
            if !line.starts_with(' ') {
                continue;
            }
            if let Some(keyword) = line.split_whitespace().next() {
                self.features.insert(keyword.to_ascii_uppercase());
            }
        }
        Ok(())
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains(&name.to_ascii_uppercase())
    }

    /// Writes one command line; fails if a reply is still outstanding
    pub fn write_command(&mut self, verb: &str, args: &str) -> FtpResult<()> {
        if self.pending {
            return Err(FtpError::InvalidState(format!(
                "cannot send {} while a reply is outstanding",
                verb
            )));
        }
        let line = encode_command(verb, args)?;
        if self.verbose {
            let _ = log_protocol_line(&self.tag, true, &line);
        }
        let stream = self.stream_mut()?;
        let written = stream.write_all(line.as_bytes()).and_then(|_| stream.flush());
        if let Err(e) = written {
            self.in_sync = false;
            return Err(FtpError::Connection(format!("cannot send {}: {}", verb, e)));
        }
        Ok(())
    }

    /// Reads one complete reply, multi-line replies included
    ///
    /// A 1xx reply leaves the channel pending; any other reply clears it.
    pub fn read_reply(&mut self) -> FtpResult<Reply> {
        let mut acc = ReplyAccumulator::new();
        loop {
            let line = match self.read_line() {
                Ok(line) => line,
                Err(e) => {
                    self.in_sync = false;
                    return Err(e);
                }
            };
            if self.verbose {
                let _ = log_protocol_line(&self.tag, false, &line);
            }
            match acc.push_line(&line) {
                Ok(Some(reply)) => {
                    self.pending = reply.is_preliminary();
                    return Ok(reply);
                }
                Ok(None) => {}
                Err(e) => {
                    self.in_sync = false;
                    return Err(e);
                }
            }
        }
    }

    /// Sends a command and waits for its final reply
    ///
    /// 4xx/5xx replies become `Command` errors. Preliminary replies are
    /// skipped, so the result is a 2xx or 3xx reply.
    pub fn send_command(&mut self, verb: &str, args: &str) -> FtpResult<Reply> {
        self.write_command(verb, args)?;
        let mut reply = self.read_reply()?;
        while reply.is_preliminary() {
            reply = self.read_reply()?;
        }
        if reply.is_negative() {
            return Err(FtpError::from_reply(verb, &reply));
        }
        Ok(reply)
    }

    /// Sends a command that must complete with a 2xx reply
    pub fn expect_completion(&mut self, verb: &str, args: &str) -> FtpResult<Reply> {
        let reply = self.send_command(verb, args)?;
        if !reply.is_completion() {
            return Err(FtpError::from_reply(verb, &reply));
        }
        Ok(reply)
    }

    /// Keep-alive
    pub fn noop(&mut self) -> FtpResult<()> {
        self.expect_completion("NOOP", "").map(|_| ())
    }

    /// Current working directory as reported by the server
    pub fn pwd(&mut self) -> FtpResult<String> {
        let reply = self.expect_completion("PWD", "")?;
        parse_quoted_path(&reply.text)
            .ok_or_else(|| FtpError::Protocol(format!("cannot parse PWD reply: '{}'", reply)))
    }

    /// True when the next command can be sent and its reply trusted
    pub fn is_synchronized(&self) -> bool {
        self.reader.is_some() && self.in_sync && !self.pending
    }

    pub fn peer_addr(&self) -> FtpResult<SocketAddr> {
        self.stream()?
            .peer_addr()
            .map_err(|e| FtpError::Connection(format!("control socket: {}", e)))
    }

    pub fn local_addr(&self) -> FtpResult<SocketAddr> {
        self.stream()?
            .local_addr()
            .map_err(|e| FtpError::Connection(format!("control socket: {}", e)))
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Sends QUIT when the channel is in sync, then shuts the socket down
    ///
    /// Safe to call more than once and on a half-connected channel.
    pub fn close(&mut self) {
        if self.reader.is_none() {
            return;
        }
        if self.is_synchronized() {
            if let Err(e) = self.quit() {
                let _ = log_with_session(&self.tag, format!("QUIT failed: {}", e));
            }
        }
        self.abort();
    }

    fn quit(&mut self) -> FtpResult<()> {
        self.stream_mut()?
            .set_timeouts(QUIT_TIMEOUT)
            .map_err(|e| FtpError::Connection(e.to_string()))?;
        self.write_command("QUIT", "")?;
        self.read_reply().map(|_| ())
    }

    /// Shuts the socket down without saying goodbye
    pub fn abort(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.get_mut().shutdown();
        }
        self.pending = false;
        self.in_sync = false;
    }

    fn stream(&self) -> FtpResult<&NetStream> {
        self.reader
            .as_ref()
            .map(BufReader::get_ref)
            .ok_or_else(|| FtpError::InvalidState("control channel is closed".to_string()))
    }

    fn stream_mut(&mut self) -> FtpResult<&mut NetStream> {
        self.reader
            .as_mut()
            .map(BufReader::get_mut)
            .ok_or_else(|| FtpError::InvalidState("control channel is closed".to_string()))
    }

    fn read_line(&mut self) -> FtpResult<String> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| FtpError::InvalidState("control channel is closed".to_string()))?;
        let mut buf = Vec::new();
        let n = reader
            .by_ref()
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut buf)
            .map_err(|e| {
                if is_timeout(&e) {
                    FtpError::Connection("timed out waiting for a reply".to_string())
                } else {
                    FtpError::Connection(format!("control connection failed: {}", e))
                }
            })?;
        if n == 0 {
            return Err(FtpError::Connection(
                "control connection closed by server".to_string(),
            ));
        }
        if !buf.ends_with(b"\n") && n == MAX_LINE_LEN {
            return Err(FtpError::Protocol("reply line too long".to_string()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.abort();
    }
}
