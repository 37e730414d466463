use super::common::{
    MessageCache, SessionIndex, SessionParts, build_session, column_bytes, finish_messages,
    finish_sessions, link_tool_result, open_db_readonly, sqlite_stamp, str_field, table_exists,
    to_hex, tool_use,
};
use super::{Adapter, AdapterError};
use crate::domain::{
    ContentBlock, Loaded, Message, Role, Session, ThinkingBlock, parse_timestamp_value,
    value_to_text,
};
use crate::infra::{FsWatcher, PathFilter, paths, watch_paths};
use md5::{Digest, Md5};
use notify::RecursiveMode;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::warn;

const STORE_DB: &str = "store.db";

pub fn resolve_cursor_chats_dir() -> Result<PathBuf, AdapterError> {
    if let Some(dir) = std::env::var_os("CURSOR_CHATS_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home.join(".cursor").join("chats"))
}

/// The CLI keys chats on the hex MD5 of the absolute workspace path.
pub fn workspace_hash(project_root: &Path) -> String {
    to_hex(&Md5::digest(project_root.to_string_lossy().as_bytes()))
}

#[derive(Clone, Debug, Default)]
struct ChatMeta {
    name: Option<String>,
    created_at: Option<OffsetDateTime>,
    model: Option<String>,
}

fn from_hex(text: &[u8]) -> Option<Vec<u8>> {
    let text = text.trim_ascii();
    if text.len() % 2 != 0 {
        return None;
    }
    text.chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

// Older stores keep the meta value as plain JSON, newer ones hex-encode it.
fn decode_meta(raw: &[u8]) -> Option<ChatMeta> {
    let json = if raw.trim_ascii_start().starts_with(b"{") {
        raw.to_vec()
    } else {
        from_hex(raw)?
    };
    let value: Value = serde_json::from_slice(&json).ok()?;
    Some(ChatMeta {
        name: str_field(&value, "name").map(str::to_string),
        created_at: value.get("createdAt").and_then(parse_timestamp_value),
        model: str_field(&value, "lastUsedModel").map(str::to_string),
    })
}

fn read_meta(conn: &rusqlite::Connection) -> Option<ChatMeta> {
    if !table_exists(conn, "meta") {
        return None;
    }
    let raw = conn
        .query_row("SELECT value FROM meta WHERE key = '0'", [], |row| {
            column_bytes(row, 0)
        })
        .ok()?;
    decode_meta(&raw)
}

fn strip_user_query(text: &str) -> String {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("<user_query>")
        .and_then(|rest| rest.strip_suffix("</user_query>"))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn convert_blob(id: &str, raw: &Value, timestamp: OffsetDateTime, model: &str) -> Message {
    let role = Role::normalize(str_field(raw, "role").unwrap_or("assistant"));
    let mut message = Message::new(id, role, timestamp);
    if role == Role::Assistant {
        message.model = model.to_string();
    }
    let mut texts = Vec::new();
    match raw.get("content") {
        Some(Value::String(text)) => texts.push(text.clone()),
        Some(Value::Array(parts)) => {
            for part in parts {
                let kind = str_field(part, "type").unwrap_or("");
                match kind {
                    "text" => texts.extend(str_field(part, "text").map(str::to_string)),
                    "reasoning" => {
                        if let Some(text) = str_field(part, "text").filter(|t| !t.is_empty()) {
                            message.thinking_blocks.push(ThinkingBlock {
                                content: text.to_string(),
                                token_count: 0,
                            });
                        }
                    }
                    "tool-call" => message.tool_uses.push(tool_use(
                        str_field(part, "toolCallId").unwrap_or(""),
                        str_field(part, "toolName").unwrap_or(""),
                        part.get("args").unwrap_or(&Value::Null),
                    )),
                    "tool-result" => message.content_blocks.push(ContentBlock {
                        block_type: kind.to_string(),
                        text: value_to_text(part.get("result").unwrap_or(&Value::Null)),
                    }),
                    other => message.content_blocks.push(ContentBlock {
                        block_type: other.to_string(),
                        text: str_field(part, "text").unwrap_or("").to_string(),
                    }),
                }
            }
        }
        _ => {}
    }
    let text = texts.join("\n");
    message.content = if role == Role::User {
        strip_user_query(&text)
    } else {
        text
    };
    message
}

fn parse_store(db_path: &Path) -> Result<Loaded<Vec<Message>>, AdapterError> {
    let conn = open_db_readonly(db_path)?;
    let meta = read_meta(&conn).unwrap_or_default();
    let stamp = sqlite_stamp(db_path)?;
    let timestamp = meta.created_at.unwrap_or_else(|| stamp.modified_at());
    let model = meta.model.unwrap_or_default();

    if !table_exists(&conn, "blobs") {
        return Ok(Loaded::complete(Vec::new()));
    }
    let mut stmt = conn
        .prepare("SELECT id, data FROM blobs ORDER BY rowid")
        .map_err(|error| AdapterError::sqlite(db_path, error))?;
    let rows = stmt
        .query_map([], |row| Ok((column_bytes(row, 0)?, column_bytes(row, 1)?)))
        .map_err(|error| AdapterError::sqlite(db_path, error))?;

    let mut messages: Vec<Message> = Vec::new();
    let mut failure = None;
    for row in rows {
        let (id, data) = row.map_err(|error| AdapterError::sqlite(db_path, error))?;
        // Blobs also hold content-addressed binary chunks; only JSON objects are messages.
        if !data.trim_ascii_start().starts_with(b"{") {
            continue;
        }
        let raw: Value = match serde_json::from_slice(&data) {
            Ok(raw) => raw,
            Err(error) => {
                failure = Some((format!("malformed blob {}", String::from_utf8_lossy(&id)), error));
                break;
            }
        };
        if raw.get("role").is_none() {
            continue;
        }
        let id = String::from_utf8_lossy(&id).into_owned();
        let mut message = convert_blob(&id, &raw, timestamp, &model);
        if message.role == Role::Tool {
            // Results belong to calls made by an earlier assistant turn.
            let results = raw.get("content").and_then(Value::as_array);
            for part in results.into_iter().flatten() {
                if str_field(part, "type") != Some("tool-result") {
                    continue;
                }
                let output = value_to_text(part.get("result").unwrap_or(&Value::Null));
                if link_tool_result(&mut messages, str_field(part, "toolCallId").unwrap_or(""), &output) {
                    message.content_blocks.retain(|block| block.text != output);
                }
            }
        }
        if !message.is_empty() {
            messages.push(message);
        }
    }
    finish_messages(db_path, "cursor-cli", messages, failure)
}

pub struct CursorAdapter {
    chats_dir: Option<PathBuf>,
    cache: MessageCache,
    index: SessionIndex,
}

impl CursorAdapter {
    pub fn from_env() -> Self {
        let chats_dir = resolve_cursor_chats_dir()
            .inspect_err(|error| warn!(%error, "cursor adapter disabled"))
            .ok();
        Self {
            chats_dir,
            cache: MessageCache::new(),
            index: SessionIndex::default(),
        }
    }

    pub fn new(chats_dir: impl Into<PathBuf>) -> Self {
        Self {
            chats_dir: Some(chats_dir.into()),
            cache: MessageCache::new(),
            index: SessionIndex::default(),
        }
    }

    fn workspace_dir(&self, project_root: &Path) -> Option<PathBuf> {
        let root = paths::resolve(project_root)?;
        Some(self.chats_dir.as_ref()?.join(workspace_hash(&root)))
    }

    fn stores(dir: &Path) -> Vec<(String, PathBuf)> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let db = entry.path().join(STORE_DB);
                let id = entry.file_name().to_str()?.to_string();
                db.is_file().then_some((id, db))
            })
            .collect()
    }

    fn locate(&self, session_id: &str) -> Result<PathBuf, AdapterError> {
        if let Some(path) = self.index.lookup(session_id) {
            return Ok(path);
        }
        let chats = self
            .chats_dir
            .as_ref()
            .ok_or(AdapterError::HomeDirNotFound)?;
        let workspaces = fs::read_dir(chats).map_err(|error| AdapterError::io(chats, error))?;
        for workspace in workspaces.filter_map(Result::ok) {
            let db = workspace.path().join(session_id).join(STORE_DB);
            if db.is_file() {
                self.index.remember(session_id, &db);
                return Ok(db);
            }
        }
        Err(AdapterError::UnknownSession(session_id.to_string()))
    }

    fn load(&self, db_path: &Path) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let stamp = sqlite_stamp(db_path)?;
        self.cache.load_stamped(db_path, stamp, parse_store)
    }
}

impl Adapter for CursorAdapter {
    fn id(&self) -> &'static str {
        "cursor-cli"
    }

    fn name(&self) -> &'static str {
        "Cursor CLI"
    }

    fn icon(&self) -> &'static str {
        "▸"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        Ok(self
            .workspace_dir(project_root)
            .is_some_and(|dir| !Self::stores(&dir).is_empty()))
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let Some(dir) = self.workspace_dir(project_root) else {
            return Ok(Loaded::complete(Vec::new()));
        };
        let mut sessions = Vec::new();
        let mut skipped = 0;
        for (id, db_path) in Self::stores(&dir) {
            let (loaded, stamp, meta) = match self.load(&db_path).and_then(|loaded| {
                let stamp = sqlite_stamp(&db_path)?;
                let meta = open_db_readonly(&db_path)
                    .ok()
                    .and_then(|conn| read_meta(&conn))
                    .unwrap_or_default();
                Ok((loaded, stamp, meta))
            }) {
                Ok(found) => found,
                Err(error) => {
                    warn!(adapter = self.id(), path = %db_path.display(), %error, "skipping chat");
                    skipped += 1;
                    continue;
                }
            };
            if loaded.data.is_empty() {
                continue;
            }
            self.index.remember(&id, &db_path);
            let messages = Arc::new(loaded.data);
            let mut session = build_session(
                self,
                SessionParts {
                    id: &id,
                    title: meta.name.as_deref().filter(|name| *name != "New Agent"),
                    path: &db_path,
                    stamp,
                    messages: &messages,
                    est_cost: 0.0,
                    is_sub_agent: false,
                },
            );
            // Blobs carry no timestamps; the database's last write is the best activity signal.
            session.updated_at = session.updated_at.max(stamp.modified_at());
            session.duration = (session.updated_at - session.created_at)
                .try_into()
                .unwrap_or_default();
            sessions.push(session);
        }
        Ok(finish_sessions(self.id(), sessions, skipped))
    }

    fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let db_path = self.locate(session_id)?;
        self.load(&db_path)
    }

    fn watch(&self, project_root: &Path) -> Result<FsWatcher, AdapterError> {
        let dir = self
            .workspace_dir(project_root)
            .ok_or(AdapterError::HomeDirNotFound)?;
        let filter: PathFilter = Arc::new(|path: &Path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(STORE_DB))
        });
        Ok(watch_paths(&[(dir, RecursiveMode::Recursive)], filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::{Connection, params};
    use serde_json::json;
    use tempfile::tempdir;

    fn hex(bytes: &[u8]) -> String {
        to_hex(bytes)
    }

    fn create_store(path: &Path, blobs: &[Vec<u8>]) {
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        let conn = Connection::open(path).expect("open");
        conn.execute_batch(
            "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE blobs (id TEXT PRIMARY KEY, data BLOB);",
        )
        .expect("schema");
        let meta = json!({
            "agentId": "chat-1",
            "name": "Fix flaky test",
            "createdAt": 1771488000000_i64,
            "lastUsedModel": "gpt-5"
        });
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('0', ?1)",
            params![hex(meta.to_string().as_bytes())],
        )
        .expect("meta");
        for (idx, blob) in blobs.iter().enumerate() {
            conn.execute(
                "INSERT INTO blobs (id, data) VALUES (?1, ?2)",
                params![format!("b{idx}"), blob],
            )
            .expect("blob");
        }
    }

    fn conversation() -> Vec<Vec<u8>> {
        vec![
            json!({ "role": "system", "content": "You are an agent." }).to_string().into_bytes(),
            vec![0x0a, 0x20, 0xff, 0x00],
            json!({ "role": "user", "content": [{ "type": "text", "text": "<user_query>\nfix the flaky test\n</user_query>" }] })
                .to_string()
                .into_bytes(),
            json!({ "role": "assistant", "content": [
                { "type": "reasoning", "text": "check timing" },
                { "type": "tool-call", "toolCallId": "tc1", "toolName": "run", "args": { "cmd": "cargo test" } }
            ] })
            .to_string()
            .into_bytes(),
            json!({ "role": "tool", "content": [{ "type": "tool-result", "toolCallId": "tc1", "result": "1 failed" }] })
                .to_string()
                .into_bytes(),
            json!({ "role": "assistant", "content": [{ "type": "text", "text": "Added a retry." }] })
                .to_string()
                .into_bytes(),
        ]
    }

    #[test]
    fn hashes_workspaces_with_md5() {
        assert_eq!(workspace_hash(Path::new("abc")), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn reads_chat_store_for_the_workspace() {
        let home = tempdir().expect("tempdir");
        let project = home.path().join("proj");
        fs::create_dir_all(&project).expect("project");
        let chats = home.path().join("chats");
        let workspace = chats.join(workspace_hash(&paths::resolve(&project).expect("resolve")));
        create_store(&workspace.join("chat-1").join(STORE_DB), &conversation());

        let adapter = CursorAdapter::new(&chats);
        assert!(adapter.detect(&project).expect("detect"));
        let sessions = adapter.sessions(&project).expect("sessions").data;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "Fix flaky test");

        let messages = adapter.messages("chat-1").expect("messages").data;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "fix the flaky test");
        assert_eq!(messages[2].tool_uses[0].output, "1 failed");
        assert_eq!(messages[2].thinking_blocks[0].content, "check timing");
        assert_eq!(messages[2].model, "gpt-5");
        assert_eq!(messages[3].content, "Added a retry.");
    }

    #[test]
    fn malformed_json_blob_yields_partial_prefix() {
        let home = tempdir().expect("tempdir");
        let db = home.path().join("w/chat-2").join(STORE_DB);
        let mut blobs = conversation();
        blobs.insert(3, b"{\"role\":\"assistant\",".to_vec());
        create_store(&db, &blobs);

        let adapter = CursorAdapter::new(home.path());
        let loaded = adapter.messages("chat-2").expect("recovered");
        assert_eq!(loaded.data.len(), 2);
        assert_eq!(loaded.partial.map(|p| p.parsed_count), Some(2));
    }

    #[test]
    fn plain_json_meta_is_accepted() {
        let meta = decode_meta(br#"{"name":"x","createdAt":1771488000000}"#).expect("meta");
        assert_eq!(meta.name.as_deref(), Some("x"));
        assert!(decode_meta(b"zz").is_none());
    }
}
