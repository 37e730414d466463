use super::AdapterError;
use crate::domain::{
    Loaded, Message, PartialResult, Role, Session, ToolUse, copy_messages, session_name, short_id,
    sort_messages, sort_sessions,
};
use crate::infra::{Cache, FileStamp};
use regex::bytes::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::warn;

const MESSAGE_CACHE_CAPACITY: usize = 64;
const MESSAGE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

type StampKey = (PathBuf, SystemTime, u64);

#[derive(Clone)]
struct ParsedFile {
    messages: Arc<Vec<Message>>,
    partial: Option<(usize, String)>,
}

/// Parsed messages keyed on `(path, mtime, size)`, so any change to the file is a miss.
pub(crate) struct MessageCache {
    inner: Mutex<Cache<StampKey, ParsedFile>>,
}

impl MessageCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Cache::new(MESSAGE_CACHE_CAPACITY, Some(MESSAGE_CACHE_TTL))),
        }
    }

    /// Shared, read-only view. Hand callers [`copy_messages`] of it, never the Arc itself.
    pub(crate) fn load_shared(
        &self,
        path: &Path,
        stamp: FileStamp,
        parse: impl FnOnce(&Path) -> Result<Loaded<Vec<Message>>, AdapterError>,
    ) -> Result<Loaded<Arc<Vec<Message>>>, AdapterError> {
        let key = (path.to_path_buf(), stamp.modified, stamp.size);
        let cached = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key);
        if let Some(parsed) = cached {
            return Ok(Loaded {
                data: parsed.messages,
                partial: parsed
                    .partial
                    .map(|(count, reason)| PartialResult::new(count, reason)),
            });
        }

        let loaded = parse(path)?;
        let messages = Arc::new(loaded.data);
        let parsed = ParsedFile {
            messages: messages.clone(),
            partial: loaded
                .partial
                .as_ref()
                .map(|partial| (partial.parsed_count, partial.reason.clone())),
        };
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, parsed);
        Ok(Loaded {
            data: messages,
            partial: loaded.partial,
        })
    }

    pub(crate) fn load(
        &self,
        path: &Path,
        parse: impl FnOnce(&Path) -> Result<Loaded<Vec<Message>>, AdapterError>,
    ) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let stamp = FileStamp::of(path).map_err(|error| AdapterError::io(path, error))?;
        self.load_stamped(path, stamp, parse)
    }

    /// For sources whose version is not the path's own metadata.
    pub(crate) fn load_stamped(
        &self,
        path: &Path,
        stamp: FileStamp,
        parse: impl FnOnce(&Path) -> Result<Loaded<Vec<Message>>, AdapterError>,
    ) -> Result<Loaded<Vec<Message>>, AdapterError> {
        Ok(self
            .load_shared(path, stamp, parse)?
            .map(|shared| copy_messages(&shared)))
    }
}

/// Maps session IDs to the file that holds them.
#[derive(Default)]
pub(crate) struct SessionIndex {
    paths: Mutex<HashMap<String, PathBuf>>,
}

impl SessionIndex {
    pub(crate) fn remember(&self, id: &str, path: &Path) {
        self.paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), path.to_path_buf());
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<PathBuf> {
        self.paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

pub(crate) struct JsonLines {
    pub records: Vec<Value>,
    /// 1-based line of the first undecodable record; reading stops there.
    pub failure: Option<(usize, serde_json::Error)>,
}

pub(crate) fn read_json_lines(path: &Path) -> Result<JsonLines, AdapterError> {
    let bytes = fs::read(path).map_err(|error| AdapterError::io(path, error))?;
    let mut records = Vec::new();
    for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => records.push(value),
            Err(error) => {
                return Ok(JsonLines {
                    records,
                    failure: Some((idx + 1, error)),
                });
            }
        }
    }
    Ok(JsonLines {
        records,
        failure: None,
    })
}

/// Attaches a partial marker when decoding stopped early. A failure with nothing recovered is an error.
pub(crate) fn finish_messages(
    path: &Path,
    adapter_id: &str,
    mut messages: Vec<Message>,
    failure: Option<(String, serde_json::Error)>,
) -> Result<Loaded<Vec<Message>>, AdapterError> {
    sort_messages(&mut messages);
    let Some((reason, error)) = failure else {
        return Ok(Loaded::complete(messages));
    };
    if messages.is_empty() {
        return Err(AdapterError::json(path, error));
    }
    warn!(
        adapter = adapter_id,
        path = %path.display(),
        recovered = messages.len(),
        %reason,
        "partial session read"
    );
    let partial = PartialResult::new(messages.len(), reason).with_source(error);
    Ok(Loaded::partial(messages, partial))
}

/// Element-by-element recovery of `"key": [ ... ]` from a document that fails to parse as a whole.
pub(crate) fn recover_array_prefix(bytes: &[u8], key: &str) -> Vec<Value> {
    let Ok(opener) = Regex::new(&format!(r#""{}"\s*:\s*\["#, regex::escape(key))) else {
        return Vec::new();
    };
    let Some(found) = opener.find(bytes) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    let mut pos = found.end();
    loop {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] == b']' {
            break;
        }
        let mut stream = serde_json::Deserializer::from_slice(&bytes[pos..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                pos += stream.byte_offset();
                items.push(value);
            }
            _ => break,
        }
    }
    items
}

/// A top-level string field from a document that fails to parse as a whole.
pub(crate) fn recover_string_field(bytes: &[u8], key: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r#""{}"\s*:\s*("(?:[^"\\]|\\.)*")"#, regex::escape(key))).ok()?;
    let captures = pattern.captures(bytes)?;
    serde_json::from_slice::<String>(captures.get(1)?.as_bytes()).ok()
}

/// Fills the `output` of the matching earlier tool use; returns false when there is none.
pub(crate) fn link_tool_result(messages: &mut [Message], tool_use_id: &str, output: &str) -> bool {
    if tool_use_id.is_empty() {
        return false;
    }
    for message in messages.iter_mut().rev() {
        if let Some(tool) = message
            .tool_uses
            .iter_mut()
            .rev()
            .find(|tool| tool.id == tool_use_id)
        {
            tool.output = output.to_string();
            return true;
        }
    }
    false
}

pub(crate) fn tool_use(id: &str, name: &str, input: &Value) -> ToolUse {
    ToolUse {
        id: id.to_string(),
        name: if name.is_empty() { "tool" } else { name }.to_string(),
        input: if input.is_null() {
            "{}".to_string()
        } else {
            input.to_string()
        },
        output: String::new(),
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

pub(crate) fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Per-million-token prices for models whose name contains `needle`.
pub(crate) struct Rate {
    pub needle: &'static str,
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

pub(crate) fn cost_from_rates(rates: &[Rate], fallback: &Rate, messages: &[Message]) -> f64 {
    messages
        .iter()
        .filter(|message| !message.tokens.is_empty())
        .map(|message| {
            let model = message.model.to_ascii_lowercase();
            let rate = rates
                .iter()
                .find(|rate| model.contains(rate.needle))
                .unwrap_or(fallback);
            let t = &message.tokens;
            (t.input_tokens as f64 * rate.input
                + t.output_tokens as f64 * rate.output
                + t.cache_read as f64 * rate.cache_read
                + t.cache_write as f64 * rate.cache_write)
                / 1_000_000.0
        })
        .sum()
}

pub(crate) struct SessionParts<'a> {
    pub id: &'a str,
    pub title: Option<&'a str>,
    pub path: &'a Path,
    pub stamp: FileStamp,
    pub messages: &'a [Message],
    pub est_cost: f64,
    pub is_sub_agent: bool,
}

pub(crate) fn build_session(adapter: &dyn super::Adapter, parts: SessionParts<'_>) -> Session {
    let first_user = parts
        .messages
        .iter()
        .filter(|message| message.role == Role::User)
        .map(|message| message.content.as_str())
        .find(|text| crate::domain::derive_title_from_user_text(text).is_some());
    let name = match parts.title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(title) => crate::domain::truncate_title(title, crate::domain::MAX_TITLE_CHARS),
        None => session_name(first_user, parts.id),
    };
    let modified = parts.stamp.modified_at();
    let created_at = parts
        .messages
        .first()
        .map(|message| message.timestamp)
        .unwrap_or(modified);
    let updated_at = parts
        .messages
        .last()
        .map(|message| message.timestamp)
        .map(|last| last.max(created_at))
        .unwrap_or(modified);
    let duration = (updated_at - created_at).try_into().unwrap_or(Duration::ZERO);
    let total_tokens = parts.messages.iter().map(|m| m.tokens.total()).sum();

    Session {
        id: parts.id.to_string(),
        name,
        slug: short_id(parts.id),
        adapter_id: adapter.id(),
        adapter_name: adapter.name(),
        adapter_icon: adapter.icon(),
        created_at,
        updated_at,
        duration,
        total_tokens,
        est_cost: parts.est_cost,
        message_count: parts.messages.len(),
        is_sub_agent: parts.is_sub_agent,
        source_path: parts.path.to_path_buf(),
        source_size_bytes: parts.stamp.size,
    }
}

/// Sorts newest first. Sources that could not be read at all mark the listing partial.
pub(crate) fn finish_sessions(
    adapter_id: &str,
    mut sessions: Vec<Session>,
    skipped: usize,
) -> Loaded<Vec<Session>> {
    sort_sessions(&mut sessions);
    if skipped == 0 {
        return Loaded::complete(sessions);
    }
    warn!(adapter = adapter_id, skipped, "some sessions could not be read");
    let partial = PartialResult::new(
        sessions.len(),
        format!("{skipped} session source(s) unreadable"),
    );
    Loaded::partial(sessions, partial)
}

pub(crate) fn open_db_readonly(path: &Path) -> Result<Connection, AdapterError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|error| AdapterError::sqlite(path, error))?;
    conn.busy_timeout(Duration::from_millis(250))
        .map_err(|error| AdapterError::sqlite(path, error))?;
    Ok(conn)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .is_ok()
}

/// A TEXT or BLOB column as raw bytes.
pub(crate) fn column_bytes(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Vec<u8>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => bytes.to_vec(),
        ValueRef::Integer(n) => n.to_string().into_bytes(),
        ValueRef::Real(f) => f.to_string().into_bytes(),
        ValueRef::Null => Vec::new(),
    })
}

/// Stamp for a database plus its write-ahead log, whose writes do not touch the main file.
pub(crate) fn sqlite_stamp(db_path: &Path) -> Result<FileStamp, AdapterError> {
    let mut stamp = FileStamp::of(db_path).map_err(|error| AdapterError::io(db_path, error))?;
    let mut wal_name = db_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    wal_name.push("-wal");
    if let Ok(wal) = FileStamp::of(&db_path.with_file_name(wal_name)) {
        stamp.modified = stamp.modified.max(wal.modified);
        stamp.size = stamp.size.saturating_add(wal.size);
    }
    Ok(stamp)
}
