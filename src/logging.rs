use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// Global log file path protected by Mutex
///
/// Thread-safe storage for optional log file path.
/// When None, logs go to stdout.
pub static LOG_FILE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Logs a message with timestamp to configured output
///
/// # Arguments
/// * `message` - The message to log
///
/// # Returns
/// * `io::Result<()>` - Ok on success, Err if writing fails
///
/// # Example
/// ```text
/// // log("Starting batch").unwrap();
/// ```
pub fn log<S: AsRef<str>>(message: S) -> io::Result<()> {
    write_line(None, message.as_ref())
}

/// Logs a message with timestamp and optional worker ID
///
/// Used when jobs run in parallel to tell the workers apart
///
/// # Arguments
/// * `message` - The message to log
/// * `thread_id` - Optional worker identifier
///
/// # Example
/// ```text
/// // log_with_thread("Job started", Some(1)).unwrap();
/// ```
pub fn log_with_thread<S: AsRef<str>>(message: S, thread_id: Option<usize>) -> io::Result<()> {
    match thread_id {
        Some(tid) => write_line(Some(&format!("T{}", tid)), message.as_ref()),
        None => write_line(None, message.as_ref()),
    }
}

/// Logs a message tagged with the session that produced it
///
/// # Example
/// ```text
/// // log_with_session("S3", "connected to ftp.example.com:21").unwrap();
/// ```
pub fn log_with_session<S: AsRef<str>>(session: &str, message: S) -> io::Result<()> {
    write_line(Some(session), message.as_ref())
}

/// Logs one control-channel line in verbose mode
///
/// `outgoing` selects the arrow: `>` for commands sent, `<` for replies.
/// The argument of `PASS` is masked.
pub fn log_protocol_line(session: &str, outgoing: bool, line: &str) -> io::Result<()> {
    let line = line.trim_end_matches(['\r', '\n']);
    if outgoing {
        write_line(Some(session), &format!("> {}", mask_password(line)))
    } else {
        write_line(Some(session), &format!("< {}", line))
    }
}

fn mask_password(line: &str) -> String {
    match line.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("PASS ") => "PASS ****".to_string(),
        _ => line.to_string(),
    }
}

fn write_line(tag: Option<&str>, message: &str) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let log_message = match tag {
        Some(tag) => format!("{} [{}] {}\n", timestamp, tag, message),
        None => format!("{} {}\n", timestamp, message),
    };

    // a panic while holding the lock leaves the path intact
    let guard = LOG_FILE.lock().unwrap_or_else(|e| e.into_inner());
    match &*guard {
        Some(log_file) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            file.write_all(log_message.as_bytes())?;
        }
        None => {
            // stdout carries the JSON results when no output file is given
            let stderr = io::stderr();
            let mut handle = stderr.lock();
            handle.write_all(log_message.as_bytes())?;
        }
    }

    Ok(())
}

/// Sets the path for the log file
///
/// Subsequent calls to the log functions append to this file.
///
/// # Arguments
///
/// * `path` - A path-like object representing the location of the log file
pub fn set_log_file<P: AsRef<Path>>(path: P) {
    let path_str = path.as_ref().to_string_lossy().into_owned();
    *LOG_FILE.lock().unwrap_or_else(|e| e.into_inner()) = Some(path_str);
}
