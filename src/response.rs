//! Decoding and parsing of clamd responses.
//!
//! Scan responses are made of lines following the grammar
//!
//! ```text
//! <path>: [<virus-name> ]<FOUND|OK|ERROR>
//! ```
//!
//! The path is matched greedily, so paths that themselves contain `": "` are
//! split at the last separator that still leaves a well-formed tail.

use std::collections::{hash_map, HashMap};
use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::error::{ClamdError, Result};

/// Response sent when an INSTREAM upload exceeds the daemon's `StreamMaxLength`.
pub const SIZE_LIMIT_EXCEEDED: &str = "INSTREAM size limit exceeded. ERROR";

const ERROR_TOKEN: &str = "ERROR";
const SEPARATOR: &str = ": ";

/// Status token at the end of a scan response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// A signature matched.
    Found,
    /// Nothing matched.
    Ok,
    /// The daemon could not scan the path.
    Error,
}

impl Status {
    /// Wire token for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Found => "FOUND",
            Self::Ok => "OK",
            Self::Error => ERROR_TOKEN,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ClamdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FOUND" => Ok(Self::Found),
            "OK" => Ok(Self::Ok),
            ERROR_TOKEN => Ok(Self::Error),
            other => Err(ClamdError::Response(format!("unknown status {other:?}"))),
        }
    }
}

/// One parsed scan response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// Path as reported by the daemon (`stream` for INSTREAM uploads).
    pub path: String,
    /// Signature name, present exactly when `status` is [`Status::Found`].
    pub virus: Option<String>,
    /// Scan status.
    pub status: Status,
}

/// Outcome for a single path in a [`ScanResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Scan status.
    pub status: Status,
    /// Signature name for [`Status::Found`].
    pub virus: Option<String>,
}

impl Verdict {
    /// `true` when nothing was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Mapping from scanned path to its [`Verdict`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    entries: HashMap<String, Verdict>,
}

impl ScanResult {
    /// Verdict for `path`, if the daemon reported it.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Verdict> {
        self.entries.get(path)
    }

    /// Number of reported paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no path was reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(path, verdict)` pairs in arbitrary order.
    pub fn iter(&self) -> hash_map::Iter<'_, String, Verdict> {
        self.entries.iter()
    }

    /// `true` if every reported path is [`Status::Ok`].
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entries.values().all(Verdict::is_clean)
    }

    /// Paths with a signature match, paired with the signature name.
    pub fn infected(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(path, verdict)| {
            verdict
                .virus
                .as_deref()
                .map(|virus| (path.as_str(), virus))
        })
    }

    fn insert(&mut self, entry: ScanEntry) {
        let ScanEntry {
            path,
            virus,
            status,
        } = entry;
        self.entries.insert(path, Verdict { status, virus });
    }
}

impl IntoIterator for ScanResult {
    type Item = (String, Verdict);
    type IntoIter = hash_map::IntoIter<String, Verdict>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ScanResult {
    type Item = (&'a String, &'a Verdict);
    type IntoIter = hash_map::Iter<'a, String, Verdict>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Text preceding the last `ERROR` token, or `None` if there is none.
fn before_last_error(text: &str) -> Option<&str> {
    text.rfind(ERROR_TOKEN).map(|idx| &text[..idx])
}

fn rejected(line: &str) -> ClamdError {
    ClamdError::Response(before_last_error(line).unwrap_or(line).to_owned())
}

/// Parses one scan response line.
///
/// `ERROR` lines and lines that break the grammar (including a signature name
/// on a non-`FOUND` line, or `FOUND` without one) fail with
/// [`ClamdError::Response`] carrying the text before the last `ERROR`.
pub fn parse_response_line(line: &str) -> Result<ScanEntry> {
    let entry = match_line(line).ok_or_else(|| rejected(line))?;
    match (entry.status, &entry.virus) {
        (Status::Found, Some(_)) | (Status::Ok, None) => Ok(entry),
        _ => Err(rejected(line)),
    }
}

fn match_line(line: &str) -> Option<ScanEntry> {
    if line.contains('\n') {
        return None;
    }
    let status = [Status::Found, Status::Ok, Status::Error]
        .into_iter()
        .find(|status| line.ends_with(status.as_str()))?;
    let head = &line[..line.len() - status.as_str().len()];

    // Greedy path: try separators from the right, keep the first that leaves
    // either nothing or "<virus> " before the status token.
    let mut end = head.len();
    while let Some(idx) = head[..end].rfind(SEPARATOR) {
        let tail = &head[idx + SEPARATOR.len()..];
        if tail.is_empty() {
            return Some(ScanEntry {
                path: head[..idx].to_owned(),
                virus: None,
                status,
            });
        }
        if let Some(virus) = tail.strip_suffix(' ').filter(|v| !v.is_empty()) {
            return Some(ScanEntry {
                path: head[..idx].to_owned(),
                virus: Some(virus.to_owned()),
                status,
            });
        }
        end = idx;
    }
    None
}

/// Decodes raw response bytes into trimmed text.
pub(crate) fn decode(raw: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ClamdError::Response(format!("response is not valid UTF-8: {e}")))?;
    Ok(text.trim().to_owned())
}

/// Interprets the reply to PING, VERSION, RELOAD or SHUTDOWN.
///
/// A reply containing `ERROR` fails with the text preceding its last
/// occurrence; anything else is returned as is.
pub(crate) fn basic_reply(response: String) -> Result<String> {
    match before_last_error(&response) {
        Some(message) => Err(ClamdError::Response(message.to_owned())),
        None => Ok(response),
    }
}

/// Interprets the reply to SCAN, CONTSCAN or MULTISCAN.
pub(crate) fn scan_reply(response: &str) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    for line in response.split('\n').filter(|line| !line.is_empty()) {
        result.insert(parse_response_line(line)?);
    }
    trace!(entries = result.len(), "parsed scan reply");
    Ok(result)
}

/// Interprets the reply to INSTREAM. An empty reply yields `None`.
pub(crate) fn instream_reply(response: &str) -> Result<Option<ScanResult>> {
    if response.is_empty() {
        return Ok(None);
    }
    if response == SIZE_LIMIT_EXCEEDED {
        return Err(ClamdError::BufferTooLong(response.to_owned()));
    }
    let mut result = ScanResult::default();
    result.insert(parse_response_line(response)?);
    Ok(Some(result))
}
