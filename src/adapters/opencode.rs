use super::common::{
    MessageCache, Rate, SessionParts, build_session, cost_from_rates, finish_messages,
    finish_sessions, str_field, tool_use, u64_field,
};
use super::search::search_messages_in;
use super::{Adapter, AdapterError, MessageMatch, MessageSearcher, SearchOptions};
use crate::domain::{
    ContentBlock, Loaded, Message, Role, Session, ThinkingBlock, TokenUsage,
    parse_timestamp_value,
};
use crate::infra::{FileStamp, FsWatcher, extension_filter, paths, watch_paths};
use notify::RecursiveMode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

const RATES: [Rate; 3] = [
    Rate { needle: "opus", input: 15.0, output: 75.0, cache_read: 1.5, cache_write: 18.75 },
    Rate { needle: "sonnet", input: 3.0, output: 15.0, cache_read: 0.3, cache_write: 3.75 },
    Rate { needle: "gpt-5", input: 1.25, output: 10.0, cache_read: 0.125, cache_write: 0.0 },
];
const FALLBACK_RATE: &Rate = &RATES[1];

pub fn resolve_opencode_storage_dir() -> Result<PathBuf, AdapterError> {
    if let Some(dir) = std::env::var_os("OPENCODE_STORAGE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home
        .join(".local")
        .join("share")
        .join("opencode")
        .join("storage"))
}

#[derive(Debug, Deserialize)]
struct ProjectRecord {
    id: String,
    #[serde(default)]
    worktree: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SessionTime {
    created: Option<i64>,
    updated: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    id: String,
    #[serde(default)]
    directory: String,
    #[serde(default, rename = "parentID")]
    parent_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    time: SessionTime,
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    // IDs are time-ordered, so name order is creation order.
    files.sort();
    files
}

fn file_id(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

pub struct OpenCodeAdapter {
    storage_dir: Option<PathBuf>,
    cache: MessageCache,
}

impl OpenCodeAdapter {
    pub fn from_env() -> Self {
        let storage_dir = resolve_opencode_storage_dir()
            .inspect_err(|error| warn!(%error, "opencode adapter disabled"))
            .ok();
        Self {
            storage_dir,
            cache: MessageCache::new(),
        }
    }

    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: Some(storage_dir.into()),
            cache: MessageCache::new(),
        }
    }

    fn storage(&self) -> Result<&Path, AdapterError> {
        self.storage_dir
            .as_deref()
            .ok_or(AdapterError::HomeDirNotFound)
    }

    // Sessions of every project whose worktree overlaps the root, recorded in a directory under it.
    fn project_sessions(&self, project_root: &Path) -> Vec<(PathBuf, SessionRecord)> {
        let (Ok(storage), Some(root)) = (self.storage(), paths::resolve(project_root)) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for project_file in json_files(&storage.join("project")) {
            let Some(project) = read_record::<ProjectRecord>(&project_file) else {
                continue;
            };
            let worktree = Path::new(&project.worktree);
            if !paths::is_under(&root, worktree) && !paths::is_under(worktree, &root) {
                continue;
            }
            for session_file in json_files(&storage.join("session").join(&project.id)) {
                let Some(session) = read_record::<SessionRecord>(&session_file) else {
                    continue;
                };
                if !session.directory.is_empty()
                    && paths::is_under(&root, Path::new(&session.directory))
                {
                    found.push((session_file, session));
                }
            }
        }
        found
    }

    /// Combined stamp over a session's message and part files; any write to one of them changes it.
    fn tree_stamp(&self, session_id: &str) -> Result<FileStamp, AdapterError> {
        let storage = self.storage()?;
        let message_dir = storage.join("message").join(session_id);
        let mut stamp = FileStamp::of(&message_dir)
            .map_err(|_| AdapterError::UnknownSession(session_id.to_string()))?;
        let mut fold = |path: &Path| {
            if let Ok(file) = FileStamp::of(path) {
                stamp.modified = stamp.modified.max(file.modified);
                stamp.size = stamp.size.wrapping_add(file.size).wrapping_add(1);
            }
        };
        for message_file in json_files(&message_dir) {
            fold(&message_file);
            if let Some(message_id) = file_id(&message_file) {
                let part_dir = storage.join("part").join(&message_id);
                fold(&part_dir);
                for part_file in json_files(&part_dir) {
                    fold(&part_file);
                }
            }
        }
        Ok(stamp)
    }

    fn load_messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let storage = self.storage()?.to_path_buf();
        let stamp = self.tree_stamp(session_id)?;
        let message_dir = storage.join("message").join(session_id);
        self.cache
            .load_stamped(&message_dir, stamp, |dir| parse_session_tree(&storage, dir, stamp))
    }
}

fn token_usage(tokens: &Value) -> TokenUsage {
    let cache = tokens.get("cache").unwrap_or(&Value::Null);
    TokenUsage {
        input_tokens: u64_field(tokens, "input"),
        output_tokens: u64_field(tokens, "output") + u64_field(tokens, "reasoning"),
        cache_read: u64_field(cache, "read"),
        cache_write: u64_field(cache, "write"),
    }
}

fn apply_part(message: &mut Message, part: &Value, texts: &mut Vec<String>) {
    let kind = str_field(part, "type").unwrap_or("");
    match kind {
        "text" => {
            if let Some(text) = str_field(part, "text").filter(|t| !t.trim().is_empty()) {
                texts.push(text.to_string());
            }
        }
        "reasoning" => {
            if let Some(text) = str_field(part, "text").filter(|t| !t.trim().is_empty()) {
                message.thinking_blocks.push(ThinkingBlock {
                    content: text.to_string(),
                    token_count: 0,
                });
            }
        }
        "tool" => {
            let state = part.get("state").unwrap_or(&Value::Null);
            let mut tool = tool_use(
                str_field(part, "callID").unwrap_or(""),
                str_field(part, "tool").unwrap_or(""),
                state.get("input").unwrap_or(&Value::Null),
            );
            tool.output = match str_field(state, "status") {
                Some("completed") => str_field(state, "output").unwrap_or("").to_string(),
                Some("error") => format!("error: {}", str_field(state, "error").unwrap_or("")),
                _ => String::new(),
            };
            message.tool_uses.push(tool);
        }
        "step-start" | "step-finish" | "snapshot" | "patch" | "" => {}
        other => message.content_blocks.push(ContentBlock {
            block_type: other.to_string(),
            text: str_field(part, "text").unwrap_or("").to_string(),
        }),
    }
}

fn parse_session_tree(
    storage: &Path,
    message_dir: &Path,
    stamp: FileStamp,
) -> Result<Loaded<Vec<Message>>, AdapterError> {
    let mut messages = Vec::new();
    let mut failure = None;
    let mut skipped_parts = 0usize;

    for message_file in json_files(message_dir) {
        let bytes = fs::read(&message_file).map_err(|error| AdapterError::io(&message_file, error))?;
        let raw: Value = match serde_json::from_slice(&bytes) {
            Ok(raw) => raw,
            Err(error) => {
                let name = message_file.file_name().unwrap_or_default().to_string_lossy().into_owned();
                failure = Some((format!("malformed message {name}"), error));
                break;
            }
        };
        let Some(id) = str_field(&raw, "id").map(str::to_string).or_else(|| file_id(&message_file))
        else {
            continue;
        };
        let timestamp = raw
            .get("time")
            .and_then(|time| time.get("created"))
            .and_then(parse_timestamp_value)
            .unwrap_or_else(|| stamp.modified_at());
        let role = Role::normalize(str_field(&raw, "role").unwrap_or("assistant"));
        let mut message = Message::new(id.clone(), role, timestamp);
        message.model = str_field(&raw, "modelID").unwrap_or("").to_string();
        if let Some(tokens) = raw.get("tokens") {
            message.tokens = token_usage(tokens);
        }

        let mut texts = Vec::new();
        for part_file in json_files(&storage.join("part").join(&id)) {
            match fs::read(&part_file)
                .ok()
                .map(|bytes| serde_json::from_slice::<Value>(&bytes))
            {
                Some(Ok(part)) => apply_part(&mut message, &part, &mut texts),
                Some(Err(error)) => {
                    skipped_parts += 1;
                    if failure.is_none() {
                        failure = Some((String::new(), error));
                    }
                }
                None => skipped_parts += 1,
            }
        }
        message.content = texts.join("\n");
        if !message.is_empty() {
            messages.push(message);
        }
    }

    let failure = failure.map(|(reason, error)| {
        if reason.is_empty() {
            (format!("{skipped_parts} malformed part(s)"), error)
        } else {
            (reason, error)
        }
    });
    finish_messages(message_dir, "opencode", messages, failure)
}

impl Adapter for OpenCodeAdapter {
    fn id(&self) -> &'static str {
        "opencode"
    }

    fn name(&self) -> &'static str {
        "OpenCode"
    }

    fn icon(&self) -> &'static str {
        "◇"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        Ok(!self.project_sessions(project_root).is_empty())
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let mut sessions = Vec::new();
        let mut skipped = 0;
        for (session_file, record) in self.project_sessions(project_root) {
            let loaded = match self.load_messages(&record.id) {
                Ok(loaded) => loaded,
                Err(AdapterError::UnknownSession(_)) => continue,
                Err(error) => {
                    warn!(adapter = self.id(), session = %record.id, %error, "skipping session");
                    skipped += 1;
                    continue;
                }
            };
            if loaded.data.is_empty() {
                continue;
            }
            let stamp = FileStamp::of(&session_file).unwrap_or(FileStamp {
                modified: SystemTime::UNIX_EPOCH,
                size: 0,
            });
            let mut session = build_session(
                self,
                SessionParts {
                    id: &record.id,
                    title: record.title.as_deref(),
                    path: &session_file,
                    stamp,
                    messages: &loaded.data,
                    est_cost: cost_from_rates(&RATES, FALLBACK_RATE, &loaded.data),
                    is_sub_agent: record.parent_id.is_some(),
                },
            );
            if let Some(updated) = record.time.updated.and_then(crate::domain::unix_ms_to_datetime) {
                session.updated_at = session.updated_at.max(updated);
            }
            if let Some(created) = record.time.created.and_then(crate::domain::unix_ms_to_datetime) {
                session.created_at = session.created_at.min(created);
            }
            sessions.push(session);
        }
        Ok(finish_sessions(self.id(), sessions, skipped))
    }

    fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
        self.load_messages(session_id)
    }

    fn watch(&self, _project_root: &Path) -> Result<FsWatcher, AdapterError> {
        let storage = self.storage()?;
        Ok(watch_paths(
            &[
                (storage.join("session"), RecursiveMode::Recursive),
                (storage.join("message"), RecursiveMode::Recursive),
                (storage.join("part"), RecursiveMode::Recursive),
            ],
            extension_filter(&["json"]),
        )?)
    }

    fn as_searcher(&self) -> Option<&dyn MessageSearcher> {
        Some(self)
    }
}

impl MessageSearcher for OpenCodeAdapter {
    fn search_messages(
        &self,
        session_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<MessageMatch>, AdapterError> {
        let loaded = self.messages(session_id)?;
        search_messages_in(&loaded.data, query, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn put(path: PathBuf, value: Value) {
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        fs::write(path, value.to_string()).expect("write");
    }

    struct Fixture {
        _home: TempDir,
        storage: PathBuf,
        project: PathBuf,
    }

    fn fixture() -> Fixture {
        let home = tempdir().expect("tempdir");
        let project = home.path().join("repo");
        fs::create_dir_all(&project).expect("project");
        let project = paths::resolve(&project).expect("resolve");
        let storage = home.path().join("storage");
        let worktree = project.to_string_lossy().to_string();

        put(storage.join("project/p1.json"), json!({ "id": "p1", "worktree": worktree }));
        put(
            storage.join("session/p1/ses_1.json"),
            json!({ "id": "ses_1", "projectID": "p1", "directory": worktree, "title": "Add retries",
                    "time": { "created": 1771488000000_i64, "updated": 1771488100000_i64 } }),
        );
        put(
            storage.join("session/p1/ses_2.json"),
            json!({ "id": "ses_2", "projectID": "p1", "directory": worktree, "parentID": "ses_1",
                    "title": "Subtask", "time": { "created": 1771488010000_i64, "updated": 1771488020000_i64 } }),
        );
        put(
            storage.join("message/ses_1/msg_001.json"),
            json!({ "id": "msg_001", "sessionID": "ses_1", "role": "user", "time": { "created": 1771488000000_i64 } }),
        );
        put(
            storage.join("part/msg_001/prt_001.json"),
            json!({ "id": "prt_001", "type": "text", "text": "add retries to the client" }),
        );
        put(
            storage.join("message/ses_1/msg_002.json"),
            json!({ "id": "msg_002", "sessionID": "ses_1", "role": "assistant", "modelID": "claude-sonnet-4",
                    "time": { "created": 1771488005000_i64 },
                    "tokens": { "input": 200, "output": 30, "reasoning": 10, "cache": { "read": 50, "write": 0 } } }),
        );
        put(
            storage.join("part/msg_002/prt_001.json"),
            json!({ "id": "prt_001", "type": "reasoning", "text": "wrap send()" }),
        );
        put(
            storage.join("part/msg_002/prt_002.json"),
            json!({ "id": "prt_002", "type": "tool", "tool": "edit", "callID": "call_9",
                    "state": { "status": "completed", "input": { "file": "client.rs" }, "output": "patched" } }),
        );
        put(
            storage.join("part/msg_002/prt_003.json"),
            json!({ "id": "prt_003", "type": "text", "text": "Retries added." }),
        );
        put(
            storage.join("message/ses_2/msg_101.json"),
            json!({ "id": "msg_101", "role": "user", "time": { "created": 1771488010000_i64 } }),
        );
        put(
            storage.join("part/msg_101/prt_001.json"),
            json!({ "id": "prt_001", "type": "text", "text": "look at timeouts" }),
        );

        Fixture {
            _home: home,
            storage,
            project,
        }
    }

    #[test]
    fn assembles_messages_from_parts() {
        let fx = fixture();
        let adapter = OpenCodeAdapter::new(&fx.storage);
        let messages = adapter.messages("ses_1").expect("messages").data;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "add retries to the client");
        let reply = &messages[1];
        assert_eq!(reply.content, "Retries added.");
        assert_eq!(reply.thinking_blocks[0].content, "wrap send()");
        assert_eq!(reply.tool_uses[0].name, "edit");
        assert_eq!(reply.tool_uses[0].output, "patched");
        assert_eq!(reply.tokens.output_tokens, 40);
        assert_eq!(reply.tokens.cache_read, 50);
    }

    #[test]
    fn lists_project_sessions_and_flags_children() {
        let fx = fixture();
        let adapter = OpenCodeAdapter::new(&fx.storage);
        assert!(adapter.detect(&fx.project).expect("detect"));

        let sessions = adapter.sessions(&fx.project).expect("sessions").data;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "ses_1");
        assert_eq!(sessions[0].name, "Add retries");
        assert!(!sessions[0].is_sub_agent);
        assert!(sessions[1].is_sub_agent);

        assert!(!adapter.detect(Path::new("/somewhere/else")).expect("detect"));
    }

    #[test]
    fn malformed_message_file_stops_with_partial_result() {
        let fx = fixture();
        fs::write(fx.storage.join("message/ses_1/msg_003.json"), "{\"id\":").expect("write");
        let adapter = OpenCodeAdapter::new(&fx.storage);
        let loaded = adapter.messages("ses_1").expect("recovered");
        assert_eq!(loaded.data.len(), 2);
        assert_eq!(loaded.partial.map(|p| p.parsed_count), Some(2));
    }

    #[test]
    fn cache_sees_new_parts() {
        let fx = fixture();
        let adapter = OpenCodeAdapter::new(&fx.storage);
        assert_eq!(adapter.messages("ses_2").expect("first").data[0].content, "look at timeouts");
        put(
            fx.storage.join("part/msg_101/prt_002.json"),
            json!({ "id": "prt_002", "type": "text", "text": "and retries" }),
        );
        assert_eq!(
            adapter.messages("ses_2").expect("second").data[0].content,
            "look at timeouts\nand retries"
        );
    }
}
