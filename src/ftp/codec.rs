//! Control-channel wire codec
//!
//! Parses server replies (RFC 959 §4.2) and serialises client commands.
//! Also encodes and decodes the host/port tuples carried by PASV, EPSV,
//! PORT and EPRT.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{FtpError, FtpResult};

static PASV_TUPLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3}),\s*(\d{1,3})")
        .expect("static regex")
});

static EPSV_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([!-~])([!-~])([!-~])(\d+)([!-~])\)").expect("static regex"));

/// Reply class, derived from the first digit of the reply code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 1xx: action started, expect another reply
    PositivePreliminary,
    /// 2xx: action completed
    PositiveCompletion,
    /// 3xx: more input needed
    PositiveIntermediate,
    /// 4xx: try again later
    TransientNegative,
    /// 5xx: failed
    PermanentNegative,
}

impl ReplyClass {
    fn from_code(code: u16) -> Option<Self> {
        match code / 100 {
            1 => Some(ReplyClass::PositivePreliminary),
            2 => Some(ReplyClass::PositiveCompletion),
            3 => Some(ReplyClass::PositiveIntermediate),
            4 => Some(ReplyClass::TransientNegative),
            5 => Some(ReplyClass::PermanentNegative),
            _ => None,
        }
    }
}

/// A complete server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub class: ReplyClass,
    /// Reply text without the code; lines of a multi-line reply joined by `\n`
    pub text: String,
}

impl Reply {
    pub fn is_preliminary(&self) -> bool {
        self.class == ReplyClass::PositivePreliminary
    }

    pub fn is_completion(&self) -> bool {
        self.class == ReplyClass::PositiveCompletion
    }

    pub fn is_intermediate(&self) -> bool {
        self.class == ReplyClass::PositiveIntermediate
    }

    pub fn is_negative(&self) -> bool {
        matches!(
            self.class,
            ReplyClass::TransientNegative | ReplyClass::PermanentNegative
        )
    }

    /// Text lines of the reply
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Reads the three-digit code and the separator of a reply line
fn split_reply_line(line: &str) -> FtpResult<(u16, Option<char>, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(FtpError::Protocol(format!("invalid reply line: '{}'", line)));
    }
    let code = u16::from(bytes[0] - b'0') * 100
        + u16::from(bytes[1] - b'0') * 10
        + u16::from(bytes[2] - b'0');
    if ReplyClass::from_code(code).is_none() {
        return Err(FtpError::Protocol(format!("invalid reply code {}", code)));
    }
    match bytes.get(3) {
        None => Ok((code, None, "")),
        Some(b' ') => Ok((code, Some(' '), &line[4..])),
        Some(b'-') => Ok((code, Some('-'), &line[4..])),
        Some(_) => Err(FtpError::Protocol(format!(
            "missing separator after reply code: '{}'",
            line
        ))),
    }
}

/// Incremental reply parser fed one line at a time
///
/// The control channel reads a line, feeds it here and keeps reading until a
/// complete [`Reply`] comes out.
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    code: Option<u16>,
    text: Vec<String>,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-line reply has been started but not terminated
    pub fn in_progress(&self) -> bool {
        self.code.is_some()
    }

    /// Feeds one line (CRLF optional); returns the reply once it is complete
    pub fn push_line(&mut self, raw: &str) -> FtpResult<Option<Reply>> {
        let line = raw.trim_end_matches(['\r', '\n']);

        let code = match self.code {
            None => {
                let (code, sep, text) = split_reply_line(line)?;
                if sep == Some('-') {
                    self.code = Some(code);
                    self.text.push(text.to_string());
                    return Ok(None);
                }
                return Ok(Some(finish(code, vec![text.to_string()])));
            }
            Some(code) => code,
        };

        if is_terminator(line, code) {
            let text = line.get(4..).unwrap_or("");
            self.text.push(text.to_string());
            self.code = None;
            return Ok(Some(finish(code, std::mem::take(&mut self.text))));
        }

        self.text.push(line.to_string());
        Ok(None)
    }
}

fn is_terminator(line: &str, code: u16) -> bool {
    let prefix = code.to_string();
    match line.strip_prefix(prefix.as_str()) {
        Some(rest) => rest.is_empty() || rest.starts_with(' '),
        None => false,
    }
}

fn finish(code: u16, lines: Vec<String>) -> Reply {
    Reply {
        code,
        // codes were validated by split_reply_line
        class: ReplyClass::from_code(code).unwrap_or(ReplyClass::PermanentNegative),
        text: lines.join("\n"),
    }
}

/// Parses a complete reply from its raw lines
///
/// Fails with `Protocol` on a malformed first line, on trailing lines after
/// the terminator, or when a multi-line reply is never terminated.
pub fn parse_reply<S: AsRef<str>>(raw_lines: &[S]) -> FtpResult<Reply> {
    let mut acc = ReplyAccumulator::new();
    let mut lines = raw_lines.iter();
    while let Some(line) = lines.next() {
        if let Some(reply) = acc.push_line(line.as_ref())? {
            if lines.next().is_some() {
                return Err(FtpError::Protocol(format!(
                    "unexpected lines after reply {}",
                    reply.code
                )));
            }
            return Ok(reply);
        }
    }
    if acc.in_progress() {
        Err(FtpError::Protocol("unterminated multi-line reply".to_string()))
    } else {
        Err(FtpError::Protocol("empty reply".to_string()))
    }
}

/// Serialises a command line, CRLF terminated
///
/// Arguments may not contain CR or LF, which would smuggle a second command
/// onto the control channel.
pub fn encode_command(verb: &str, args: &str) -> FtpResult<String> {
    if verb.is_empty() || !verb.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(FtpError::Protocol(format!("invalid command verb '{}'", verb)));
    }
    if args.contains(['\r', '\n']) {
        return Err(FtpError::Protocol(format!(
            "{} argument contains a line break",
            verb
        )));
    }
    if args.is_empty() {
        Ok(format!("{}\r\n", verb))
    } else {
        Ok(format!("{} {}\r\n", verb, args))
    }
}

/// Extracts the data address from a 227 reply: `(h1,h2,h3,h4,p1,p2)`
pub fn parse_pasv_reply(text: &str) -> FtpResult<SocketAddrV4> {
    let caps = PASV_TUPLE_RE
        .captures(text)
        .ok_or_else(|| FtpError::Protocol(format!("cannot parse PASV reply: '{}'", text)))?;
    let mut nums = [0u8; 6];
    for (i, n) in nums.iter_mut().enumerate() {
        *n = caps[i + 1].parse::<u8>().map_err(|_| {
            FtpError::Protocol(format!("PASV number out of range: '{}'", &caps[i + 1]))
        })?;
    }
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Extracts the data port from a 229 reply: `(|||port|)`
pub fn parse_epsv_reply(text: &str) -> FtpResult<u16> {
    let caps = EPSV_PORT_RE
        .captures(text)
        .ok_or_else(|| FtpError::Protocol(format!("cannot parse EPSV reply: '{}'", text)))?;
    let delim = &caps[1];
    if &caps[2] != delim || &caps[3] != delim || &caps[5] != delim {
        return Err(FtpError::Protocol(format!(
            "inconsistent EPSV delimiters: '{}'",
            text
        )));
    }
    match caps[4].parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(FtpError::Protocol(format!("EPSV port out of range: '{}'", text))),
    }
}

/// Argument of a PORT command: `h1,h2,h3,h4,p1,p2`
pub fn encode_port_arg(addr: SocketAddrV4) -> String {
    let [a, b, c, d] = addr.ip().octets();
    format!("{},{},{},{},{},{}", a, b, c, d, addr.port() >> 8, addr.port() & 0xff)
}

/// Argument of an EPRT command: `|af|ip|port|`
pub fn encode_eprt_arg(addr: SocketAddr) -> String {
    let af = match addr.ip() {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    format!("|{}|{}|{}|", af, addr.ip(), addr.port())
}

/// Extracts the quoted path of a 257 reply (PWD, MKD)
pub fn parse_quoted_path(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let mut path = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            // a doubled quote is an escaped quote
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
            } else {
                return Some(path);
            }
        } else {
            path.push(c);
        }
    }
    None
}
