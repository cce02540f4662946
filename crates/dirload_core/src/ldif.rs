//! Plain LDIF entry source.
//!
//! Supports the content-record subset of LDIF: a `dn:` line followed by
//! `attribute: value` lines, continuation lines starting with one space,
//! `#` comments, and blank lines between records. Base64 (`::`) and URL
//! (`:<`) values and change records are rejected record by record.

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{CoreError, CoreResult};
use crate::source::{EntrySource, Rejection, SourceCounters};
use parking_lot::Mutex;
use std::io::BufRead;

/// An [`EntrySource`] over LDIF text.
pub struct LdifReader<R> {
    state: Mutex<ReaderState<R>>,
    counters: SourceCounters,
}

struct ReaderState<R> {
    input: R,
    line: u64,
    done: bool,
}

/// A record's raw logical lines and the line it started on.
struct RawRecord {
    start: u64,
    lines: Vec<String>,
}

impl<R: BufRead + Send> LdifReader<R> {
    /// Creates a reader over `input`.
    pub fn new(input: R) -> Self {
        Self {
            state: Mutex::new(ReaderState {
                input,
                line: 0,
                done: false,
            }),
            counters: SourceCounters::default(),
        }
    }

    /// Returns every rejection so far.
    #[must_use]
    pub fn rejections(&self) -> Vec<Rejection> {
        self.counters.rejections()
    }

    fn next_record(state: &mut ReaderState<R>) -> CoreResult<Option<RawRecord>> {
        let mut record: Option<RawRecord> = None;
        let mut buf = String::new();
        while !state.done {
            buf.clear();
            if state.input.read_line(&mut buf)? == 0 {
                state.done = true;
                break;
            }
            state.line += 1;
            let line = buf.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if record.is_some() {
                    break;
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix(' ') {
                match record.as_mut().and_then(|r| r.lines.last_mut()) {
                    Some(last) => last.push_str(rest),
                    None => return Err(CoreError::ldif(state.line, "continuation line without a record")),
                }
                continue;
            }
            if record.is_none() && line.starts_with("version:") {
                continue;
            }
            record
                .get_or_insert_with(|| RawRecord {
                    start: state.line,
                    lines: Vec::new(),
                })
                .lines
                .push(line.to_string());
        }
        Ok(record)
    }
}

fn parse_record(record: &RawRecord) -> Result<Entry, (String, String)> {
    let position = format!("line {}", record.start);
    let mut lines = record.lines.iter();
    let first = lines.next().ok_or_else(|| (position.clone(), "empty record".to_string()))?;

    let (name, value) = split_line(first).map_err(|reason| (position.clone(), reason))?;
    if !name.eq_ignore_ascii_case("dn") {
        return Err((position, "record does not start with a dn line".into()));
    }
    let dn_text = value;
    let dn = Dn::parse(&dn_text).map_err(|e| (dn_text.clone(), e.to_string()))?;
    let mut entry = Entry::new(dn);

    for line in lines {
        let (name, value) = split_line(line).map_err(|reason| (dn_text.clone(), reason))?;
        if name.eq_ignore_ascii_case("changetype") {
            return Err((dn_text, "change records are not supported".into()));
        }
        let attribute = name.split(';').next().unwrap_or(&name);
        entry.add_value(attribute, value);
    }
    Ok(entry)
}

fn split_line(line: &str) -> Result<(String, String), String> {
    let colon = line
        .find(':')
        .ok_or_else(|| format!("missing ':' in {line:?}"))?;
    let name = line[..colon].trim().to_string();
    let rest = &line[colon + 1..];
    if rest.starts_with(':') {
        return Err(format!("base64 value of {name} is not supported"));
    }
    if rest.starts_with('<') {
        return Err(format!("URL value of {name} is not supported"));
    }
    if name.is_empty() {
        return Err("empty attribute name".into());
    }
    Ok((name, rest.trim_start().to_string()))
}

impl<R: BufRead + Send> EntrySource for LdifReader<R> {
    fn next_entry(&self) -> CoreResult<Option<Entry>> {
        loop {
            let record = {
                let mut state = self.state.lock();
                Self::next_record(&mut state)?
            };
            let Some(record) = record else {
                return Ok(None);
            };
            self.counters.record_read();
            match parse_record(&record) {
                Ok(entry) => return Ok(Some(entry)),
                Err((dn, reason)) => self.counters.record_rejection(dn, &reason),
            }
        }
    }

    fn entries_read(&self) -> u64 {
        self.counters.read()
    }

    fn entries_rejected(&self) -> u64 {
        self.counters.rejected()
    }

    fn entries_ignored(&self) -> u64 {
        self.counters.ignored()
    }

    fn reject(&self, entry: &Entry, reason: &str) {
        self.counters.record_rejection(entry.dn().to_string(), reason);
    }

    fn ignore(&self, entry: &Entry) {
        self.counters.record_ignored(entry.dn().to_string());
    }
}
