use super::common::{
    MessageCache, SessionParts, build_session, finish_sessions, link_tool_result,
    open_db_readonly, sqlite_stamp, str_field, table_exists, tool_use,
};
use super::{Adapter, AdapterError};
use crate::domain::{
    Loaded, Message, Role, Session, parse_timestamp_value, unix_ms_to_datetime, value_to_text,
};
use crate::infra::{FileStamp, FsWatcher, paths, sqlite_family_filter, watch_paths};
use notify::RecursiveMode;
use rusqlite::Connection;
use serde_json::Value;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::warn;

pub fn resolve_kiro_db_path() -> Result<PathBuf, AdapterError> {
    if let Some(path) = std::env::var_os("KIRO_DB_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home.join(".kiro").join("data").join("kiro.sqlite3"))
}

struct ConversationRow {
    directory: String,
    conversation_id: String,
    value: String,
    created_at: Option<OffsetDateTime>,
    updated_at: Option<OffsetDateTime>,
}

const SELECT_ROWS: &str = "SELECT key, conversation_id, value, created_at, updated_at \
                           FROM conversations_v2";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        directory: row.get(0)?,
        conversation_id: row.get(1)?,
        value: row.get(2)?,
        created_at: row.get::<_, Option<i64>>(3)?.and_then(unix_ms_to_datetime),
        updated_at: row.get::<_, Option<i64>>(4)?.and_then(unix_ms_to_datetime),
    })
}

/// Walks the turn history, keeping timestamps monotonic since most entries carry none.
struct History {
    messages: Vec<Message>,
    clock: OffsetDateTime,
    model: String,
}

impl History {
    fn at(&mut self, candidate: Option<OffsetDateTime>) -> OffsetDateTime {
        if let Some(candidate) = candidate {
            self.clock = self.clock.max(candidate);
        }
        self.clock
    }

    fn user(&mut self, id: String, user: &Value) {
        let timestamp = self.at(user.get("timestamp").and_then(parse_timestamp_value));
        let Some(content) = user.get("content") else {
            return;
        };
        if let Some(prompt) = content.get("Prompt") {
            let mut message = Message::new(id, Role::User, timestamp);
            message.content = str_field(prompt, "prompt").unwrap_or("").to_string();
            if !message.is_empty() {
                self.messages.push(message);
            }
            return;
        }
        let results = content
            .get("ToolUseResults")
            .and_then(|results| results.get("tool_use_results"))
            .and_then(Value::as_array);
        for result in results.into_iter().flatten() {
            let output = result
                .get("content")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .map(|part| match (part.get("Text"), part.get("Json")) {
                            (Some(text), _) => value_to_text(text),
                            (None, Some(json)) => json.to_string(),
                            (None, None) => value_to_text(part),
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            let call_id = str_field(result, "tool_use_id").unwrap_or("");
            if !link_tool_result(&mut self.messages, call_id, &output) {
                let mut message = Message::new(format!("{id}-{call_id}"), Role::Tool, timestamp);
                message.content = output;
                self.messages.push(message);
            }
        }
    }

    fn assistant(&mut self, fallback_id: String, assistant: &Value, metadata: Option<&Value>) {
        let started = metadata
            .and_then(|meta| meta.get("request_start_timestamp_ms"))
            .and_then(parse_timestamp_value);
        let timestamp = self.at(started);
        if let Some(model) = metadata.and_then(|meta| str_field(meta, "model_id")) {
            self.model = model.to_string();
        }
        let (body, calls) = match (assistant.get("Response"), assistant.get("ToolUse")) {
            (Some(body), _) => (body, None),
            (None, Some(body)) => (body, body.get("tool_uses").and_then(Value::as_array)),
            (None, None) => return,
        };
        let id = str_field(body, "message_id").map_or(fallback_id, str::to_string);
        let mut message = Message::new(id, Role::Assistant, timestamp);
        message.model = self.model.clone();
        message.content = str_field(body, "content").unwrap_or("").to_string();
        for call in calls.into_iter().flatten() {
            message.tool_uses.push(tool_use(
                str_field(call, "id").unwrap_or(""),
                str_field(call, "name").unwrap_or(""),
                call.get("args").unwrap_or(&Value::Null),
            ));
        }
        if !message.is_empty() {
            self.messages.push(message);
        }
    }
}

fn parse_conversation(
    db_path: &Path,
    row: &ConversationRow,
    fallback: OffsetDateTime,
) -> Result<Vec<Message>, AdapterError> {
    let document: Value =
        serde_json::from_str(&row.value).map_err(|error| AdapterError::json(db_path, error))?;
    let mut history = History {
        messages: Vec::new(),
        clock: row.created_at.unwrap_or(fallback),
        model: document
            .get("model_info")
            .and_then(|info| str_field(info, "model_id"))
            .unwrap_or("")
            .to_string(),
    };
    let entries = document.get("history").and_then(Value::as_array);
    for (idx, entry) in entries.into_iter().flatten().enumerate() {
        let base = format!("{}-{idx}", row.conversation_id);
        // Older builds store each turn as a `[user, assistant]` pair.
        let (user, assistant, metadata) = match entry {
            Value::Array(pair) => (pair.first(), pair.get(1), None),
            other => (
                other.get("user"),
                other.get("assistant"),
                other.get("request_metadata"),
            ),
        };
        if let Some(user) = user {
            history.user(format!("{base}-u"), user);
        }
        if let Some(assistant) = assistant {
            history.assistant(format!("{base}-a"), assistant, metadata);
        }
    }
    Ok(history.messages)
}

pub struct KiroAdapter {
    db_path: Option<PathBuf>,
    cache: MessageCache,
}

impl KiroAdapter {
    pub fn from_env() -> Self {
        let db_path = resolve_kiro_db_path()
            .inspect_err(|error| warn!(%error, "kiro adapter disabled"))
            .ok();
        Self {
            db_path,
            cache: MessageCache::new(),
        }
    }

    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(db_path.into()),
            cache: MessageCache::new(),
        }
    }

    fn open(&self) -> Result<Option<(PathBuf, Connection)>, AdapterError> {
        let Some(db_path) = self.db_path.as_ref().filter(|path| path.is_file()) else {
            return Ok(None);
        };
        let conn = open_db_readonly(db_path)?;
        if !table_exists(&conn, "conversations_v2") {
            return Ok(None);
        }
        Ok(Some((db_path.clone(), conn)))
    }

    fn project_rows(
        db_path: &Path,
        conn: &Connection,
        project_root: &Path,
    ) -> Result<Vec<ConversationRow>, AdapterError> {
        let Some(root) = paths::resolve(project_root) else {
            return Ok(Vec::new());
        };
        let mut stmt = conn
            .prepare(SELECT_ROWS)
            .map_err(|error| AdapterError::sqlite(db_path, error))?;
        let rows = stmt
            .query_map([], read_row)
            .map_err(|error| AdapterError::sqlite(db_path, error))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|error| AdapterError::sqlite(db_path, error))?;
        Ok(rows
            .into_iter()
            .filter(|row| paths::is_under(&root, Path::new(&row.directory)))
            .collect())
    }

    /// Every conversation shares one database, so cache entries are keyed on a per-conversation path.
    fn load(
        &self,
        db_path: &Path,
        stamp: FileStamp,
        row: &ConversationRow,
    ) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let key = db_path.join(&row.conversation_id);
        self.cache.load_stamped(&key, stamp, |_| {
            let messages = parse_conversation(db_path, row, stamp.modified_at())?;
            Ok(Loaded::complete(messages))
        })
    }
}

impl Adapter for KiroAdapter {
    fn id(&self) -> &'static str {
        "kiro"
    }

    fn name(&self) -> &'static str {
        "Kiro"
    }

    fn icon(&self) -> &'static str {
        "◈"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        let Some((db_path, conn)) = self.open()? else {
            return Ok(false);
        };
        Ok(!Self::project_rows(&db_path, &conn, project_root)?.is_empty())
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let Some((db_path, conn)) = self.open()? else {
            return Ok(Loaded::complete(Vec::new()));
        };
        let stamp = sqlite_stamp(&db_path)?;
        let mut sessions = Vec::new();
        let mut skipped = 0;
        for row in Self::project_rows(&db_path, &conn, project_root)? {
            let loaded = match self.load(&db_path, stamp, &row) {
                Ok(loaded) => loaded,
                Err(error) => {
                    warn!(adapter = self.id(), id = %row.conversation_id, %error, "skipping conversation");
                    skipped += 1;
                    continue;
                }
            };
            if loaded.data.is_empty() {
                continue;
            }
            let mut session = build_session(
                self,
                SessionParts {
                    id: &row.conversation_id,
                    title: None,
                    path: &db_path,
                    stamp,
                    messages: &loaded.data,
                    est_cost: 0.0,
                    is_sub_agent: false,
                },
            );
            if let Some(created) = row.created_at {
                session.created_at = session.created_at.min(created);
            }
            if let Some(updated) = row.updated_at {
                session.updated_at = session.updated_at.max(updated);
            }
            session.duration = (session.updated_at - session.created_at)
                .try_into()
                .unwrap_or_default();
            sessions.push(session);
        }
        Ok(finish_sessions(self.id(), sessions, skipped))
    }

    fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let Some((db_path, conn)) = self.open()? else {
            return Err(AdapterError::UnknownSession(session_id.to_string()));
        };
        let row = conn
            .query_row(
                &format!("{SELECT_ROWS} WHERE conversation_id = ?1"),
                [session_id],
                read_row,
            )
            .map_err(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => {
                    AdapterError::UnknownSession(session_id.to_string())
                }
                other => AdapterError::sqlite(&db_path, other),
            })?;
        let stamp = sqlite_stamp(&db_path)?;
        self.load(&db_path, stamp, &row)
    }

    fn watch(&self, _project_root: &Path) -> Result<FsWatcher, AdapterError> {
        let db_path = self.db_path.as_ref().ok_or(AdapterError::HomeDirNotFound)?;
        let dir = db_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(AdapterError::HomeDirNotFound)?;
        Ok(watch_paths(
            &[(dir, RecursiveMode::NonRecursive)],
            sqlite_family_filter(db_path),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn create_db(path: &Path, rows: &[(&Path, &str, String)]) {
        let conn = Connection::open(path).expect("open");
        conn.execute_batch(
            "CREATE TABLE conversations_v2 (
                key TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (key, conversation_id)
            );",
        )
        .expect("schema");
        for (dir, id, value) in rows {
            conn.execute(
                "INSERT INTO conversations_v2 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![dir.to_string_lossy(), id, value, 1771488000000_i64, 1771488060000_i64],
            )
            .expect("row");
        }
    }

    fn conversation() -> String {
        json!({
            "conversation_id": "conv-1",
            "model_info": { "model_id": "claude-sonnet-4" },
            "history": [
                {
                    "user": { "content": { "Prompt": { "prompt": "list the tests" } } },
                    "assistant": { "ToolUse": {
                        "message_id": "m1",
                        "content": "Looking.",
                        "tool_uses": [{ "id": "t1", "name": "execute_bash", "args": { "command": "ls tests" } }]
                    } },
                    "request_metadata": { "request_start_timestamp_ms": 1771488001000_i64 }
                },
                {
                    "user": { "content": { "ToolUseResults": { "tool_use_results": [
                        { "tool_use_id": "t1", "content": [{ "Text": "a.rs\nb.rs" }], "status": "Success" }
                    ] } } },
                    "assistant": { "Response": { "message_id": "m2", "content": "Two test files." } },
                    "request_metadata": { "request_start_timestamp_ms": 1771488002000_i64 }
                },
                [
                    { "content": { "Prompt": { "prompt": "thanks" } } },
                    { "Response": { "message_id": "m3", "content": "Anytime." } }
                ]
            ]
        })
        .to_string()
    }

    #[test]
    fn reads_conversations_for_the_project() {
        let dir = tempdir().expect("tempdir");
        let project = dir.path().join("proj");
        fs::create_dir_all(project.join("sub")).expect("project");
        let root = paths::resolve(&project).expect("resolve");
        let db = dir.path().join("kiro.sqlite3");
        create_db(
            &db,
            &[
                (root.join("sub").as_path(), "conv-1", conversation()),
                (Path::new("/elsewhere"), "conv-2", conversation()),
            ],
        );

        let adapter = KiroAdapter::new(&db);
        assert!(adapter.detect(&project).expect("detect"));
        let sessions = adapter.sessions(&project).expect("sessions").data;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "conv-1");
        assert_eq!(sessions[0].name, "list the tests");
        assert_eq!(sessions[0].message_count, 5);

        let messages = adapter.messages("conv-1").expect("messages").data;
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [Role::User, Role::Assistant, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(messages[1].tool_uses[0].output, "a.rs\nb.rs");
        assert_eq!(messages[1].model, "claude-sonnet-4");
        assert_eq!(messages[2].content, "Two test files.");
    }

    #[test]
    fn missing_database_is_not_detected() {
        let dir = tempdir().expect("tempdir");
        let adapter = KiroAdapter::new(dir.path().join("absent.sqlite3"));
        assert!(!adapter.detect(dir.path()).expect("detect"));
        assert!(matches!(
            adapter.messages("conv-1"),
            Err(AdapterError::UnknownSession(_))
        ));
    }

    #[test]
    fn malformed_conversation_is_skipped_from_listing() {
        let dir = tempdir().expect("tempdir");
        let root = paths::resolve(dir.path()).expect("resolve");
        let db = dir.path().join("kiro.sqlite3");
        create_db(
            &db,
            &[
                (root.as_path(), "good", conversation()),
                (root.as_path(), "bad", "{\"history\": [".to_string()),
            ],
        );

        let adapter = KiroAdapter::new(&db);
        let listed = adapter.sessions(&root).expect("sessions");
        assert_eq!(listed.data.len(), 1);
        assert!(listed.is_partial());
        assert!(matches!(adapter.messages("bad"), Err(AdapterError::Json { .. })));
    }
}
