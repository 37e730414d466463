use super::common::{
    MessageCache, SessionParts, build_session, column_bytes, finish_sessions, open_db_readonly,
    sqlite_stamp, str_field, table_exists, tool_use,
};
use super::{Adapter, AdapterError};
use crate::domain::{Loaded, Message, Role, Session, parse_sqlite_datetime};
use crate::infra::{FileStamp, FsWatcher, paths, sqlite_family_filter, watch_paths};
use notify::RecursiveMode;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use time::OffsetDateTime;
use tracing::{debug, warn};

static ANSI_ESCAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").ok());

pub fn resolve_warp_db_path() -> Result<PathBuf, AdapterError> {
    if let Some(path) = std::env::var_os("WARP_DB_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home.join(".warp").join("data").join("warp.sqlite"))
}

fn strip_ansi(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match ANSI_ESCAPE.as_ref() {
        Some(pattern) => pattern.replace_all(&text, "").trim_end().to_string(),
        None => text.trim_end().to_string(),
    }
}

fn text_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(String::from_utf8_lossy(&column_bytes(row, idx)?).into_owned())
}

fn datetime_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    Ok(parse_sqlite_datetime(&text_column(row, idx)?))
}

/// Query input is a list of `{"Query": {"text": ..}}` items; older rows hold plain text.
fn query_text(input: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(input) else {
        return input.trim().to_string();
    };
    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::String(text) => return text.trim().to_string(),
        other => std::slice::from_ref(other),
    };
    items
        .iter()
        .filter_map(|item| item.get("Query").and_then(|query| str_field(query, "text")))
        .collect::<Vec<_>>()
        .join("\n")
}

struct ConversationSummary {
    id: String,
    directory: String,
}

fn parse_conversation(
    db_path: &Path,
    conn: &Connection,
    conversation_id: &str,
    fallback: OffsetDateTime,
) -> Result<Vec<Message>, AdapterError> {
    let sqlite = |error| AdapterError::sqlite(db_path, error);
    let mut messages = Vec::new();
    let mut model = String::new();

    let mut stmt = conn
        .prepare(
            "SELECT id, start_ts, input, model_id FROM ai_queries \
             WHERE conversation_id = ?1 ORDER BY start_ts, id",
        )
        .map_err(sqlite)?;
    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                datetime_column(row, 1)?,
                text_column(row, 2)?,
                text_column(row, 3)?,
            ))
        })
        .map_err(sqlite)?;
    for row in rows {
        let (id, started, input, model_id) = row.map_err(sqlite)?;
        if !model_id.is_empty() {
            model = model_id;
        }
        let mut message = Message::new(format!("q-{id}"), Role::User, started.unwrap_or(fallback));
        message.content = query_text(&input);
        if !message.is_empty() {
            messages.push(message);
        }
    }

    if table_exists(conn, "blocks") {
        messages.extend(command_blocks(db_path, conn, conversation_id, &model, fallback)?);
    }
    crate::domain::sort_messages(&mut messages);
    Ok(messages)
}

/// Shell commands the agent ran, as single-tool assistant messages.
fn command_blocks(
    db_path: &Path,
    conn: &Connection,
    conversation_id: &str,
    model: &str,
    fallback: OffsetDateTime,
) -> Result<Vec<Message>, AdapterError> {
    let sqlite = |error| AdapterError::sqlite(db_path, error);
    let mut stmt = conn
        .prepare(
            "SELECT id, stylized_command, stylized_output, exit_code, start_ts, ai_metadata \
             FROM blocks WHERE ai_metadata IS NOT NULL ORDER BY id",
        )
        .map_err(sqlite)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                column_bytes(row, 1)?,
                column_bytes(row, 2)?,
                row.get::<_, Option<i64>>(3)?,
                datetime_column(row, 4)?,
                text_column(row, 5)?,
            ))
        })
        .map_err(sqlite)?;

    let mut messages = Vec::new();
    for row in rows {
        let (id, command, output, exit_code, started, metadata) = row.map_err(sqlite)?;
        let owner = serde_json::from_str::<Value>(&metadata)
            .ok()
            .and_then(|meta| str_field(&meta, "conversation_id").map(str::to_string));
        if owner.as_deref() != Some(conversation_id) {
            continue;
        }
        let mut message = Message::new(format!("block-{id}"), Role::Assistant, started.unwrap_or(fallback));
        message.model = model.to_string();
        let mut tool = tool_use(
            &format!("block-{id}"),
            "shell",
            &json!({ "command": strip_ansi(&command), "exit_code": exit_code }),
        );
        tool.output = strip_ansi(&output);
        message.tool_uses.push(tool);
        messages.push(message);
    }
    Ok(messages)
}

pub struct WarpAdapter {
    db_path: Option<PathBuf>,
    cache: MessageCache,
}

impl WarpAdapter {
    pub fn from_env() -> Self {
        let db_path = resolve_warp_db_path()
            .inspect_err(|error| warn!(%error, "warp adapter disabled"))
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
        if !table_exists(&conn, "ai_queries") {
            return Ok(None);
        }
        Ok(Some((db_path.clone(), conn)))
    }

    fn project_conversations(
        db_path: &Path,
        conn: &Connection,
        project_root: &Path,
    ) -> Result<Vec<ConversationSummary>, AdapterError> {
        let Some(root) = paths::resolve(project_root) else {
            return Ok(Vec::new());
        };
        let sqlite = |error| AdapterError::sqlite(db_path, error);
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, MIN(working_directory) FROM ai_queries \
                 WHERE conversation_id IS NOT NULL GROUP BY conversation_id",
            )
            .map_err(sqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConversationSummary {
                    id: text_column(row, 0)?,
                    directory: text_column(row, 1)?,
                })
            })
            .map_err(sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite)?;
        Ok(rows
            .into_iter()
            .filter(|summary| {
                !summary.directory.is_empty() && paths::is_under(&root, Path::new(&summary.directory))
            })
            .collect())
    }

    fn last_modified(conn: &Connection, conversation_id: &str) -> Option<OffsetDateTime> {
        if !table_exists(conn, "agent_conversations") {
            return None;
        }
        conn.query_row(
            "SELECT last_modified_at FROM agent_conversations WHERE conversation_id = ?1",
            [conversation_id],
            |row| datetime_column(row, 0),
        )
        .optional()
        .inspect_err(|error| debug!(%error, "agent_conversations lookup failed"))
        .ok()
        .flatten()
        .flatten()
    }

    // All conversations share one database, so cache keys get a per-conversation path.
    fn load(
        &self,
        db_path: &Path,
        conn: &Connection,
        stamp: FileStamp,
        conversation_id: &str,
    ) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let key = db_path.join(conversation_id);
        self.cache.load_stamped(&key, stamp, |_| {
            let messages = parse_conversation(db_path, conn, conversation_id, stamp.modified_at())?;
            Ok(Loaded::complete(messages))
        })
    }
}

impl Adapter for WarpAdapter {
    fn id(&self) -> &'static str {
        "warp"
    }

    fn name(&self) -> &'static str {
        "Warp"
    }

    fn icon(&self) -> &'static str {
        "≋"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        let Some((db_path, conn)) = self.open()? else {
            return Ok(false);
        };
        Ok(!Self::project_conversations(&db_path, &conn, project_root)?.is_empty())
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let Some((db_path, conn)) = self.open()? else {
            return Ok(Loaded::complete(Vec::new()));
        };
        let stamp = sqlite_stamp(&db_path)?;
        let mut sessions = Vec::new();
        let mut skipped = 0;
        for summary in Self::project_conversations(&db_path, &conn, project_root)? {
            let loaded = match self.load(&db_path, &conn, stamp, &summary.id) {
                Ok(loaded) => loaded,
                Err(error) => {
                    warn!(adapter = self.id(), id = %summary.id, %error, "skipping conversation");
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
                    id: &summary.id,
                    title: None,
                    path: &db_path,
                    stamp,
                    messages: &loaded.data,
                    est_cost: 0.0,
                    is_sub_agent: false,
                },
            );
            if let Some(modified) = Self::last_modified(&conn, &summary.id) {
                session.updated_at = session.updated_at.max(modified);
                session.duration = (session.updated_at - session.created_at)
                    .try_into()
                    .unwrap_or_default();
            }
            sessions.push(session);
        }
        Ok(finish_sessions(self.id(), sessions, skipped))
    }

    fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let unknown = || AdapterError::UnknownSession(session_id.to_string());
        let Some((db_path, conn)) = self.open()? else {
            return Err(unknown());
        };
        let known = conn
            .query_row(
                "SELECT 1 FROM ai_queries WHERE conversation_id = ?1 LIMIT 1",
                [session_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(|error| AdapterError::sqlite(&db_path, error))?;
        if known.is_none() {
            return Err(unknown());
        }
        let stamp = sqlite_stamp(&db_path)?;
        self.load(&db_path, &conn, stamp, session_id)
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
    use tempfile::tempdir;

    fn create_db(path: &Path, project: &Path) {
        let conn = Connection::open(path).expect("open");
        conn.execute_batch(
            "CREATE TABLE ai_queries (
                id INTEGER PRIMARY KEY,
                exchange_id TEXT,
                conversation_id TEXT,
                start_ts DATETIME,
                input TEXT,
                working_directory TEXT,
                output_status TEXT,
                model_id TEXT
            );
            CREATE TABLE blocks (
                id INTEGER PRIMARY KEY,
                stylized_command BLOB,
                stylized_output BLOB,
                pwd TEXT,
                exit_code INTEGER,
                start_ts DATETIME,
                completed_ts DATETIME,
                ai_metadata TEXT
            );
            CREATE TABLE agent_conversations (
                id INTEGER PRIMARY KEY,
                conversation_id TEXT,
                conversation_data TEXT,
                last_modified_at DATETIME
            );",
        )
        .expect("schema");
        let dir = project.to_string_lossy();
        conn.execute(
            "INSERT INTO ai_queries (exchange_id, conversation_id, start_ts, input, working_directory, output_status, model_id)
             VALUES ('e1', 'conv-a', '2026-02-19 10:00:00.000000', ?1, ?2, 'Completed', 'claude-4-sonnet')",
            params![r#"[{"Query":{"text":"why is the build red","context":[]}}]"#, dir],
        )
        .expect("query");
        conn.execute(
            "INSERT INTO ai_queries (exchange_id, conversation_id, start_ts, input, working_directory, output_status, model_id)
             VALUES ('e2', 'conv-b', '2026-02-19 09:00:00', 'plain question', '/elsewhere', 'Completed', '')",
            [],
        )
        .expect("query");
        conn.execute(
            "INSERT INTO blocks (stylized_command, stylized_output, pwd, exit_code, start_ts, completed_ts, ai_metadata)
             VALUES (?1, ?2, ?3, 1, '2026-02-19 10:00:05', '2026-02-19 10:00:07', ?4)",
            params![
                b"\x1b[1mcargo build\x1b[0m".to_vec(),
                b"\x1b[31merror[E0308]\x1b[0m: mismatched types\n".to_vec(),
                dir,
                r#"{"conversation_id":"conv-a","action_id":"x"}"#
            ],
        )
        .expect("block");
        conn.execute(
            "INSERT INTO blocks (stylized_command, stylized_output, pwd, exit_code, start_ts, ai_metadata)
             VALUES (X'6c73', X'', ?1, 0, '2026-02-19 10:00:06', 'not json')",
            params![dir],
        )
        .expect("block");
        conn.execute(
            "INSERT INTO agent_conversations (conversation_id, conversation_data, last_modified_at)
             VALUES ('conv-a', '{}', '2026-02-19 10:05:00')",
            [],
        )
        .expect("conversation");
    }

    #[test]
    fn query_input_accepts_structured_and_plain_text() {
        assert_eq!(query_text(r#"[{"Query":{"text":"hi"}}]"#), "hi");
        assert_eq!(query_text("just text"), "just text");
        assert_eq!(strip_ansi(b"\x1b[32mok\x1b[0m\n"), "ok");
    }

    #[test]
    fn reads_queries_and_agent_commands() {
        let dir = tempdir().expect("tempdir");
        let root = paths::resolve(dir.path()).expect("resolve");
        let db = dir.path().join("warp.sqlite");
        create_db(&db, &root);

        let adapter = WarpAdapter::new(&db);
        assert!(adapter.detect(&root).expect("detect"));
        let sessions = adapter.sessions(&root).expect("sessions").data;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "conv-a");
        assert_eq!(sessions[0].name, "why is the build red");
        assert_eq!(sessions[0].updated_at, time::macros::datetime!(2026-02-19 10:05 UTC));

        let messages = adapter.messages("conv-a").expect("messages").data;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        let tool = &messages[1].tool_uses[0];
        assert_eq!(tool.name, "shell");
        assert!(tool.input.contains("\"cargo build\""));
        assert_eq!(tool.output, "error[E0308]: mismatched types");
        assert_eq!(messages[1].model, "claude-4-sonnet");
    }

    #[test]
    fn unknown_conversation_is_reported() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("warp.sqlite");
        create_db(&db, dir.path());
        let adapter = WarpAdapter::new(&db);
        assert!(matches!(
            adapter.messages("nope"),
            Err(AdapterError::UnknownSession(_))
        ));
    }
}
