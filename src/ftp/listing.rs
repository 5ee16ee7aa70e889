//! LIST / MLSD output parser
//!
//! Three formats are recognised, per line:
//! - MLSD facts (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//! - Unix `ls -l`: `-rw-r--r--   1 owner group  1234 Jan  1 12:00 file.txt`
//! - DOS/IIS: `01-01-26  12:00AM       1234 file.txt`
//!
//! Anything else becomes an `unknown` entry named after the raw line.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};

static UNIX_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStTl-]{9})[.+@]?\s+   # permissions
        (\d+)\s+                              # link count
        (\S+)\s+                              # owner
        (?:(\S+)\s+)?                         # group
        (\d+)\s+                              # size
        ([A-Za-z]{3})\s+(\d{1,2})\s+          # month day
        (\d{1,2}:\d{2}|\d{4})\s               # time or year
        (.+)$                                 # name, maybe with -> target
        ",
    )
    .expect("static regex")
});

static DOS_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{2})-(\d{2})-(\d{2}|\d{4})\s+(\d{1,2}):(\d{2})\s*([AaPp][Mm])\s+(<DIR>|\d+)\s+(.+)$",
    )
    .expect("static regex")
});

static TOTAL_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^total\s+\d+$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One line of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    #[serde(serialize_with = "serialize_modified")]
    pub modified: Option<NaiveDateTime>,
    pub permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

fn serialize_modified<S: Serializer>(
    value: &Option<NaiveDateTime>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(dt) => serializer.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => serializer.serialize_none(),
    }
}

impl DirEntry {
    fn unknown(line: &str) -> Self {
        DirEntry {
            name: line.to_string(),
            kind: EntryKind::Unknown,
            size: 0,
            modified: None,
            permissions: None,
            link_target: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Parses a complete LIST or MLSD body
///
/// `total N` headers and the `.`/`..` entries are dropped.
pub fn parse_listing(raw: &str) -> Vec<DirEntry> {
    raw.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !TOTAL_LINE_RE.is_match(line.trim()))
        .filter_map(parse_line)
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

fn parse_line(line: &str) -> Option<DirEntry> {
    if line.contains('=') && line.contains(';') {
        if let Some(entry) = parse_mlsd(line) {
            return entry;
        }
    }
    if let Some(entry) = parse_unix(line) {
        return Some(entry);
    }
    if let Some(entry) = parse_dos(line) {
        return Some(entry);
    }
    Some(DirEntry::unknown(line.trim()))
}

/// `Some(None)` marks a recognised fact line that is not a listing entry
fn parse_mlsd(line: &str) -> Option<Option<DirEntry>> {
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() || !facts.ends_with(';') {
        return None;
    }

    let mut kind = EntryKind::Unknown;
    let mut size = 0;
    let mut modified = None;
    let mut permissions = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = fact.split_once('=')?;
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                kind = match value.to_ascii_lowercase().as_str() {
                    "file" => EntryKind::File,
                    "dir" => EntryKind::Directory,
                    "cdir" | "pdir" => return Some(None),
                    "os.unix=symlink" | "os.unix=slink" => EntryKind::Symlink,
                    _ => EntryKind::Unknown,
                }
            }
            "size" | "sizd" => size = value.parse().unwrap_or(0),
            "modify" => modified = parse_mlsd_time(value),
            "unix.mode" | "perm" if permissions.is_none() || key.eq_ignore_ascii_case("unix.mode") => {
                permissions = Some(value.to_string())
            }
            _ => {}
        }
    }

    Some(Some(DirEntry {
        name: name.to_string(),
        kind,
        size,
        modified,
        permissions,
        link_target: None,
    }))
}

// YYYYMMDDHHMMSS[.sss]
fn parse_mlsd_time(value: &str) -> Option<NaiveDateTime> {
    let base = value.get(..14)?;
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S").ok()
}

fn parse_unix(line: &str) -> Option<DirEntry> {
    let caps = UNIX_LINE_RE.captures(line)?;

    let perms = &caps[1];
    let size = caps[5].parse::<u64>().unwrap_or(0);
    let modified = parse_unix_date(&caps[6], &caps[7], &caps[8]);
    let name_raw = &caps[9];

    let kind = match perms.as_bytes()[0] {
        b'd' => EntryKind::Directory,
        b'l' => EntryKind::Symlink,
        b'-' => EntryKind::File,
        _ => EntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.split_once(" -> ")) {
        (EntryKind::Symlink, Some((name, target))) => (name.to_string(), Some(target.to_string())),
        _ => (name_raw.to_string(), None),
    };

    Some(DirEntry {
        name,
        kind,
        size,
        modified,
        permissions: Some(perms.to_string()),
        link_target,
    })
}

/// `Jan  1 12:00` (within the last year) or `Jan  1  2025`
fn parse_unix_date(month: &str, day: &str, time_or_year: &str) -> Option<NaiveDateTime> {
    let month = month_number(month)?;
    let day: u32 = day.parse().ok()?;

    if let Some((h, m)) = time_or_year.split_once(':') {
        let time = NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)?;
        let now = Local::now().naive_local();
        let this_year = NaiveDate::from_ymd_opt(now.year(), month, day)?.and_time(time);
        // ls shows the time for recent files only, so a future date is last year's
        if this_year > now + chrono::Duration::days(1) {
            return Some(NaiveDate::from_ymd_opt(now.year() - 1, month, day)?.and_time(time));
        }
        return Some(this_year);
    }

    let year: i32 = time_or_year.parse().ok()?;
    Some(NaiveDate::from_ymd_opt(year, month, day)?.and_time(NaiveTime::from_hms_opt(0, 0, 0)?))
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}

fn parse_dos(line: &str) -> Option<DirEntry> {
    let caps = DOS_LINE_RE.captures(line)?;

    let month: u32 = caps[1].parse().ok()?;
    let day: u32 = caps[2].parse().ok()?;
    let mut year: i32 = caps[3].parse().ok()?;
    if caps[3].len() == 2 {
        // two-digit years pivot at 70
        year += if year < 70 { 2000 } else { 1900 };
    }
    let mut hour: u32 = caps[4].parse().ok()?;
    let minute: u32 = caps[5].parse().ok()?;
    let pm = caps[6].eq_ignore_ascii_case("pm");
    if hour == 12 {
        hour = 0;
    }
    if pm {
        hour += 12;
    }
    let modified = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0));

    let (kind, size) = if &caps[7] == "<DIR>" {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, caps[7].parse().unwrap_or(0))
    };

    Some(DirEntry {
        name: caps[8].to_string(),
        kind,
        size,
        modified,
        permissions: None,
        link_target: None,
    })
}
