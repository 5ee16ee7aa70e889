//! Scripted in-process FTP server for tests
//!
//! Plain TCP, explicit FTPS (`AUTH TLS`) or implicit FTPS with a
//! self-signed certificate. Serves an in-memory tree seeded with `/pub`,
//! `/pub/dir1` and a 1234-byte `/pub/file.txt`. Login is any user with
//! password `secret`.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{HandshakeKind, ServerConfig, ServerConnection, StreamOwned};

use crate::config::{ConnectionConfig, SecureMode, Timeouts};

pub const PASSWORD: &str = "secret";

#[derive(Default)]
struct MockState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    stor_reply: Option<String>,
    open_data: usize,
    max_data: usize,
    /// Command line after which the server drops the control connection
    /// and stops serving new ones
    hang_up_on: Option<String>,
    refusing: bool,
    protected_data: bool,
    data_handshakes: Vec<Option<HandshakeKind>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Explicit,
    Implicit,
}

#[derive(Clone)]
struct ServerTls {
    mode: TlsMode,
    config: Arc<ServerConfig>,
}

#[derive(Clone)]
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    tls: Option<TlsMode>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::start_with(None)
    }

    /// FTPS server with a fresh self-signed certificate for `localhost`
    pub fn start_tls(mode: TlsMode) -> Self {
        Self::start_with(Some(ServerTls {
            mode,
            config: server_tls_config(),
        }))
    }

    fn start_with(tls: Option<ServerTls>) -> Self {
        let mut state = MockState::default();
        for dir in ["/", "/pub", "/pub/dir1"] {
            state.dirs.insert(dir.to_string());
        }
        let content: Vec<u8> = (0..1234u32).map(|i| b'a' + (i % 26) as u8).collect();
        state.files.insert("/pub/file.txt".to_string(), content);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));

        let mode = tls.as_ref().map(|t| t.mode);
        let shared = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                if shared.lock().unwrap().refusing {
                    continue;
                }
                let state = Arc::clone(&shared);
                let tls = tls.clone();
                thread::spawn(move || {
                    if let Ok(handler) = Handler::new(stream, state, tls) {
                        let _ = handler.run();
                    }
                });
            }
        });

        MockServer {
            addr,
            state,
            tls: mode,
        }
    }

    /// Connection settings pointing at this server
    pub fn config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new("127.0.0.1", "tester", PASSWORD);
        config.port = Some(self.addr.port());
        config.timeouts = Timeouts {
            connect: 5,
            tls: 5,
            control: 5,
            data: 5,
        };
        match self.tls {
            Some(TlsMode::Explicit) => config.secure = SecureMode::Explicit,
            Some(TlsMode::Implicit) => config.secure = SecureMode::Implicit,
            None => {}
        }
        if self.tls.is_some() {
            // self-signed
            config.tls.reject_unauthorized = false;
        }
        config
    }

    /// Drop the control connection when `line` arrives, then refuse new sessions
    pub fn hang_up_on(&self, line: &str) {
        self.state.lock().unwrap().hang_up_on = Some(line.to_string());
    }

    /// True once the client has sent `PROT P`
    pub fn protected_data(&self) -> bool {
        self.state.lock().unwrap().protected_data
    }

    /// Handshake kind of every TLS data connection, in order
    pub fn data_handshakes(&self) -> Vec<Option<HandshakeKind>> {
        self.state.lock().unwrap().data_handshakes.clone()
    }

    /// Final reply sent after a STOR upload, instead of 226
    pub fn set_stor_reply(&self, reply: &str) {
        self.state.lock().unwrap().stor_reply = Some(reply.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    /// Highest number of data connections open at the same time
    pub fn max_data_connections(&self) -> usize {
        self.state.lock().unwrap().max_data
    }
}

fn server_tls_config() -> Arc<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    Arc::new(config)
}

/// Server side of a control or data connection
enum MockStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl MockStream {
    fn tls(tcp: TcpStream, config: &Arc<ServerConfig>) -> io::Result<Self> {
        let conn = ServerConnection::new(Arc::clone(config))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(MockStream::Tls(Box::new(StreamOwned::new(conn, tcp))))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            MockStream::Plain(tcp) => tcp,
            MockStream::Tls(tls) => &tls.sock,
        }
    }

    fn handshake_kind(&self) -> Option<HandshakeKind> {
        match self {
            MockStream::Plain(_) => None,
            MockStream::Tls(tls) => tls.conn.handshake_kind(),
        }
    }

    fn shutdown(mut self) {
        if let MockStream::Tls(tls) = &mut self {
            tls.conn.send_close_notify();
            let _ = tls.flush();
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MockStream::Plain(tcp) => tcp.read(buf),
            MockStream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MockStream::Plain(tcp) => tcp.write(buf),
            MockStream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            MockStream::Plain(tcp) => tcp.flush(),
            MockStream::Tls(tls) => tls.flush(),
        }
    }
}

enum DataTarget {
    None,
    Passive(TcpListener),
    Active(SocketAddr),
}

struct Handler {
    control: BufReader<MockStream>,
    state: Arc<Mutex<MockState>>,
    tls: Option<ServerTls>,
    cwd: String,
    logged_in: bool,
    data: DataTarget,
}

impl Handler {
    fn new(stream: TcpStream, state: Arc<Mutex<MockState>>, tls: Option<ServerTls>) -> io::Result<Self> {
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let control = match &tls {
            Some(ServerTls {
                mode: TlsMode::Implicit,
                config,
            }) => MockStream::tls(stream, config)?,
            _ => MockStream::Plain(stream),
        };
        Ok(Handler {
            control: BufReader::new(control),
            state,
            tls,
            cwd: "/".to_string(),
            logged_in: false,
            data: DataTarget::None,
        })
    }

    fn reply(&mut self, line: &str) -> io::Result<()> {
        let stream = self.control.get_mut();
        stream.write_all(format!("{}\r\n", line).as_bytes())?;
        stream.flush()
    }

    // The client sends nothing after AUTH TLS until it gets 234, so the
    // read buffer is empty and the socket can be rewrapped in place
    fn upgrade(&mut self, config: &Arc<ServerConfig>) -> io::Result<()> {
        let tcp = self.control.get_ref().tcp().try_clone()?;
        self.control = BufReader::new(MockStream::tls(tcp, config)?);
        Ok(())
    }

    fn resolve(&self, path: &str) -> String {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else if self.cwd == "/" {
            format!("/{}", path)
        } else {
            format!("{}/{}", self.cwd, path)
        };
        if joined.len() > 1 {
            joined.trim_end_matches('/').to_string()
        } else {
            joined
        }
    }

    fn run(mut self) -> std::io::Result<()> {
        self.reply("220 Mock FTP ready")?;
        loop {
            let mut line = String::new();
            if self.control.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            {
                let mut state = self.state.lock().unwrap();
                if state.hang_up_on.as_deref() == Some(line) {
                    state.refusing = true;
                    return Ok(());
                }
            }
            let (verb, arg) = match line.split_once(' ') {
                Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.to_string()),
                None => (line.to_ascii_uppercase(), String::new()),
            };

            match verb.as_str() {
                "AUTH" => match self.tls.clone() {
                    Some(ServerTls {
                        mode: TlsMode::Explicit,
                        config,
                    }) if arg.eq_ignore_ascii_case("TLS") => {
                        self.reply("234 AUTH TLS successful")?;
                        self.upgrade(&config)?;
                    }
                    _ => self.reply("504 AUTH not supported")?,
                },
                "USER" => self.reply("331 Password required")?,
                "PASS" => {
                    if arg == PASSWORD {
                        self.logged_in = true;
                        self.reply("230 Logged in")?;
                    } else {
                        self.reply("530 Login incorrect")?;
                    }
                }
                "QUIT" => {
                    self.reply("221 Goodbye")?;
                    return Ok(());
                }
                _ if !self.logged_in => self.reply("530 Please login with USER and PASS")?,
                "FEAT" => {
                    self.reply("211-Features:")?;
                    self.reply(" UTF8")?;
                    self.reply(" EPSV")?;
                    self.reply(" MLST type*;size*;modify*;")?;
                    self.reply("211 End")?;
                }
                "OPTS" => self.reply("200 UTF8 mode enabled")?,
                "PBSZ" => self.reply("200 PBSZ=0")?,
                "PROT" => {
                    let private = arg.eq_ignore_ascii_case("P");
                    self.state.lock().unwrap().protected_data = private;
                    self.reply("200 Protection level set")?;
                }
                "TYPE" => self.reply("200 Type set")?,
                "NOOP" => self.reply("200 OK")?,
                "PWD" => {
                    let cwd = self.cwd.clone();
                    self.reply(&format!("257 \"{}\" is the current directory", cwd))?
                }
                "CWD" => {
                    let target = self.resolve(&arg);
                    if self.state.lock().unwrap().dirs.contains(&target) {
                        self.cwd = target;
                        self.reply("250 Directory changed")?;
                    } else {
                        self.reply("550 No such directory")?;
                    }
                }
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0")?;
                    let port = listener.local_addr()?.port();
                    self.data = DataTarget::Passive(listener);
                    self.reply(&format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        port >> 8,
                        port & 0xff
                    ))?;
                }
                "EPSV" => {
                    let listener = TcpListener::bind("127.0.0.1:0")?;
                    let port = listener.local_addr()?.port();
                    self.data = DataTarget::Passive(listener);
                    self.reply(&format!("229 Entering Extended Passive Mode (|||{}|)", port))?;
                }
                "PORT" => match parse_port(&arg) {
                    Some(addr) => {
                        self.data = DataTarget::Active(addr);
                        self.reply("200 PORT command successful")?;
                    }
                    None => self.reply("501 Bad PORT argument")?,
                },
                "EPRT" => match parse_eprt(&arg) {
                    Some(addr) => {
                        self.data = DataTarget::Active(addr);
                        self.reply("200 EPRT command successful")?;
                    }
                    None => self.reply("501 Bad EPRT argument")?,
                },
                "LIST" => {
                    let listing = self.listing();
                    self.send_data(&listing.into_bytes())?;
                }
                "RETR" => {
                    let path = self.resolve(&arg);
                    let content = self.state.lock().unwrap().files.get(&path).cloned();
                    match content {
                        Some(content) => self.send_data(&content)?,
                        None => {
                            self.data = DataTarget::None;
                            self.reply("550 No such file")?;
                        }
                    }
                }
                "STOR" => {
                    let path = self.resolve(&arg);
                    self.receive_data(&path)?;
                }
                "DELE" => {
                    let path = self.resolve(&arg);
                    if self.state.lock().unwrap().files.remove(&path).is_some() {
                        self.reply("250 File deleted")?;
                    } else {
                        self.reply("550 No such file")?;
                    }
                }
                "MKD" => {
                    let path = self.resolve(&arg);
                    if self.state.lock().unwrap().dirs.insert(path.clone()) {
                        self.reply(&format!("257 \"{}\" created", path))?;
                    } else {
                        self.reply("550 Directory exists")?;
                    }
                }
                "RMD" => {
                    let path = self.resolve(&arg);
                    if self.state.lock().unwrap().dirs.remove(&path) {
                        self.reply("250 Directory removed")?;
                    } else {
                        self.reply("550 No such directory")?;
                    }
                }
                _ => self.reply("502 Command not implemented")?,
            }
        }
    }

    fn listing(&self) -> String {
        let state = self.state.lock().unwrap();
        let prefix = if self.cwd == "/" {
            "/".to_string()
        } else {
            format!("{}/", self.cwd)
        };
        let is_child = |path: &str| {
            path.len() > prefix.len()
                && path.starts_with(&prefix)
                && !path[prefix.len()..].contains('/')
        };

        let mut out = String::from("total 2\r\n");
        for dir in state.dirs.iter().filter(|d| is_child(d)) {
            out.push_str(&format!(
                "drwxr-xr-x   2 ftp      ftp          4096 Jan 15  2020 {}\r\n",
                &dir[prefix.len()..]
            ));
        }
        for (file, content) in state.files.iter().filter(|(f, _)| is_child(f)) {
            out.push_str(&format!(
                "-rw-r--r--   1 ftp      ftp      {:>8} Jan 15  2020 {}\r\n",
                content.len(),
                &file[prefix.len()..]
            ));
        }
        out
    }

    fn open_data(&mut self) -> io::Result<Option<MockStream>> {
        let tcp = match std::mem::replace(&mut self.data, DataTarget::None) {
            DataTarget::None => return Ok(None),
            DataTarget::Passive(listener) => listener.accept()?.0,
            DataTarget::Active(addr) => TcpStream::connect(addr)?,
        };
        tcp.set_read_timeout(Some(Duration::from_secs(10)))?;
        let protected = self.state.lock().unwrap().protected_data;
        let stream = match &self.tls {
            Some(tls) if protected => MockStream::tls(tcp, &tls.config)?,
            _ => MockStream::Plain(tcp),
        };

        let mut state = self.state.lock().unwrap();
        state.open_data += 1;
        state.max_data = state.max_data.max(state.open_data);
        Ok(Some(stream))
    }

    fn close_data(&mut self, stream: MockStream) {
        {
            let mut state = self.state.lock().unwrap();
            if let MockStream::Tls(_) = stream {
                state.data_handshakes.push(stream.handshake_kind());
            }
            state.open_data -= 1;
        }
        stream.shutdown();
    }

    fn send_data(&mut self, content: &[u8]) -> io::Result<()> {
        self.reply("150 Opening data connection")?;
        let Some(mut stream) = self.open_data()? else {
            return self.reply("425 Use PORT or PASV first");
        };
        let written = stream.write_all(content).and_then(|_| stream.flush());
        self.close_data(stream);
        match written {
            Ok(()) => self.reply("226 Transfer complete"),
            Err(_) => self.reply("426 Connection closed; transfer aborted"),
        }
    }

    fn receive_data(&mut self, path: &str) -> io::Result<()> {
        self.reply("150 Ready to receive")?;
        let Some(mut stream) = self.open_data()? else {
            return self.reply("425 Use PORT or PASV first");
        };
        let mut content = Vec::new();
        let read = stream.read_to_end(&mut content);
        self.close_data(stream);
        if read.is_err() {
            return self.reply("426 Connection closed; transfer aborted");
        }

        let stor_reply = self.state.lock().unwrap().stor_reply.clone();
        match stor_reply {
            Some(reply) => self.reply(&reply),
            None => {
                self.state
                    .lock()
                    .unwrap()
                    .files
                    .insert(path.to_string(), content);
                self.reply("226 Transfer complete")
            }
        }
    }
}

fn parse_port(arg: &str) -> Option<SocketAddr> {
    let nums: Vec<u8> = arg
        .split(',')
        .map(|n| n.trim().parse().ok())
        .collect::<Option<Vec<u8>>>()?;
    if nums.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) << 8 | u16::from(nums[5]);
    Some(SocketAddr::from((ip, port)))
}

fn parse_eprt(arg: &str) -> Option<SocketAddr> {
    let delim = arg.chars().next()?;
    let parts: Vec<&str> = arg.split(delim).collect();
    // "|1|127.0.0.1|5000|" splits into ["", "1", "127.0.0.1", "5000", ""]
    if parts.len() != 5 {
        return None;
    }
    let ip = parts[2].parse().ok()?;
    let port = parts[3].parse().ok()?;
    Some(SocketAddr::new(ip, port))
}
