use super::common::{
    MessageCache, Rate, SessionIndex, SessionParts, build_session, cost_from_rates,
    finish_messages, finish_sessions, recover_array_prefix, recover_string_field, str_field,
    to_hex, tool_use, u64_field,
};
use super::search::search_messages_in;
use super::{Adapter, AdapterError, MessageMatch, MessageSearcher, SearchOptions};
use crate::domain::{
    Loaded, Message, Role, Session, ThinkingBlock, TokenUsage, parse_timestamp_value,
    value_to_text,
};
use crate::infra::{FileStamp, FsWatcher, extension_filter, paths, watch_paths};
use notify::RecursiveMode;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

const RATES: [Rate; 2] = [
    Rate { needle: "flash", input: 0.3, output: 2.5, cache_read: 0.075, cache_write: 0.0 },
    Rate { needle: "pro", input: 1.25, output: 10.0, cache_read: 0.31, cache_write: 0.0 },
];
const FALLBACK_RATE: &Rate = &RATES[1];

/// `sessionId` is written first, so a short prefix of the file is enough to find it.
const ID_PREFIX_BYTES: u64 = 4096;

pub fn resolve_gemini_root_dir() -> Result<PathBuf, AdapterError> {
    if let Some(dir) = std::env::var_os("GEMINI_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home.join(".gemini"))
}

/// Gemini keys per-project storage on the hex SHA-256 of the absolute project path.
pub fn project_hash(project_root: &Path) -> String {
    to_hex(&Sha256::digest(project_root.to_string_lossy().as_bytes()))
}

pub struct GeminiAdapter {
    root_dir: Option<PathBuf>,
    cache: MessageCache,
    index: SessionIndex,
}

impl GeminiAdapter {
    pub fn from_env() -> Self {
        let root_dir = resolve_gemini_root_dir()
            .inspect_err(|error| warn!(%error, "gemini adapter disabled"))
            .ok();
        Self {
            root_dir,
            cache: MessageCache::new(),
            index: SessionIndex::default(),
        }
    }

    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: Some(root_dir.into()),
            cache: MessageCache::new(),
            index: SessionIndex::default(),
        }
    }

    fn chats_dir(&self, project_root: &Path) -> Option<PathBuf> {
        let root = paths::resolve(project_root)?;
        Some(
            self.root_dir
                .as_ref()?
                .join("tmp")
                .join(project_hash(&root))
                .join("chats"),
        )
    }

    fn locate(&self, session_id: &str) -> Result<PathBuf, AdapterError> {
        if let Some(path) = self.index.lookup(session_id) {
            return Ok(path);
        }
        let tmp = self
            .root_dir
            .as_ref()
            .ok_or(AdapterError::HomeDirNotFound)?
            .join("tmp");
        let projects = fs::read_dir(&tmp).map_err(|error| AdapterError::io(&tmp, error))?;
        for project in projects.filter_map(Result::ok) {
            for path in chat_files(&project.path().join("chats")) {
                if read_session_id(&path).as_deref() == Some(session_id) {
                    self.index.remember(session_id, &path);
                    return Ok(path);
                }
            }
        }
        Err(AdapterError::UnknownSession(session_id.to_string()))
    }
}

fn chat_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("session-"))
        })
        .collect()
}

fn read_session_id(path: &Path) -> Option<String> {
    let mut head = Vec::new();
    File::open(path)
        .ok()?
        .take(ID_PREFIX_BYTES)
        .read_to_end(&mut head)
        .ok()?;
    recover_string_field(&head, "sessionId")
        .or_else(|| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
}

fn token_usage(tokens: &Value) -> TokenUsage {
    let input = u64_field(tokens, "input");
    let cached = u64_field(tokens, "cached");
    TokenUsage {
        input_tokens: input.saturating_sub(cached),
        output_tokens: u64_field(tokens, "output") + u64_field(tokens, "thoughts"),
        cache_read: cached,
        cache_write: 0,
    }
}

fn thinking_blocks(thoughts: &Value) -> Vec<ThinkingBlock> {
    let as_block = |content: String| ThinkingBlock {
        content,
        token_count: 0,
    };
    match thoughts {
        Value::String(text) if !text.trim().is_empty() => vec![as_block(text.clone())],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let subject = str_field(item, "subject").unwrap_or("");
                let description = str_field(item, "description").unwrap_or("");
                let text = match (subject.is_empty(), description.is_empty()) {
                    (true, true) => return None,
                    (false, true) => subject.to_string(),
                    (true, false) => description.to_string(),
                    (false, false) => format!("{subject}\n{description}"),
                };
                Some(as_block(text))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn convert_message(idx: usize, raw: &Value) -> Option<Message> {
    let role = match str_field(raw, "type").unwrap_or("") {
        "user" => Role::User,
        "gemini" | "model" | "assistant" => Role::Assistant,
        "" => return None,
        other => Role::normalize(other),
    };
    let timestamp = raw.get("timestamp").and_then(parse_timestamp_value)?;
    let id = str_field(raw, "id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("m{idx}"));

    let mut message = Message::new(id, role, timestamp);
    message.content = match raw.get("content") {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| str_field(part, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => value_to_text(other),
        None => String::new(),
    };
    message.model = str_field(raw, "model").unwrap_or("").to_string();
    if let Some(tokens) = raw.get("tokens").filter(|t| !t.is_null()) {
        message.tokens = token_usage(tokens);
    }
    message.thinking_blocks = thinking_blocks(raw.get("thoughts").unwrap_or(&Value::Null));
    for call in raw
        .get("toolCalls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let mut tool = tool_use(
            str_field(call, "id").unwrap_or(""),
            str_field(call, "name").unwrap_or(""),
            call.get("args").unwrap_or(&Value::Null),
        );
        if let Some(result) = call.get("result").filter(|r| !r.is_null()) {
            tool.output = value_to_text(result);
        }
        message.tool_uses.push(tool);
    }
    Some(message)
}

fn parse_chat_file(path: &Path) -> Result<Loaded<Vec<Message>>, AdapterError> {
    let bytes = fs::read(path).map_err(|error| AdapterError::io(path, error))?;
    let (raw_messages, failure) = match serde_json::from_slice::<Value>(&bytes) {
        Ok(document) => (
            document
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            None,
        ),
        Err(error) => (
            recover_array_prefix(&bytes, "messages"),
            Some(("truncated session document".to_string(), error)),
        ),
    };

    let messages = raw_messages
        .iter()
        .enumerate()
        .filter_map(|(idx, raw)| convert_message(idx, raw))
        .filter(|message| !message.is_empty())
        .collect();
    finish_messages(path, "gemini-cli", messages, failure)
}

impl Adapter for GeminiAdapter {
    fn id(&self) -> &'static str {
        "gemini-cli"
    }

    fn name(&self) -> &'static str {
        "Gemini CLI"
    }

    fn icon(&self) -> &'static str {
        "✦"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        Ok(self
            .chats_dir(project_root)
            .is_some_and(|dir| !chat_files(&dir).is_empty()))
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let Some(dir) = self.chats_dir(project_root) else {
            return Ok(Loaded::complete(Vec::new()));
        };
        let mut sessions = Vec::new();
        let mut skipped = 0;
        for path in chat_files(&dir) {
            let Some(id) = read_session_id(&path) else {
                continue;
            };
            let Ok(stamp) = FileStamp::of(&path) else {
                skipped += 1;
                continue;
            };
            let loaded = match self.cache.load_shared(&path, stamp, parse_chat_file) {
                Ok(loaded) => loaded,
                Err(error) => {
                    warn!(adapter = self.id(), path = %path.display(), %error, "skipping session");
                    skipped += 1;
                    continue;
                }
            };
            if loaded.data.is_empty() {
                continue;
            }
            self.index.remember(&id, &path);
            sessions.push(build_session(
                self,
                SessionParts {
                    id: &id,
                    title: None,
                    path: &path,
                    stamp,
                    messages: &loaded.data,
                    est_cost: cost_from_rates(&RATES, FALLBACK_RATE, &loaded.data),
                    is_sub_agent: false,
                },
            ));
        }
        Ok(finish_sessions(self.id(), sessions, skipped))
    }

    fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let path = self.locate(session_id)?;
        self.cache.load(&path, parse_chat_file)
    }

    fn watch(&self, project_root: &Path) -> Result<FsWatcher, AdapterError> {
        let dir = self
            .chats_dir(project_root)
            .ok_or(AdapterError::HomeDirNotFound)?;
        Ok(watch_paths(
            &[(dir, RecursiveMode::NonRecursive)],
            extension_filter(&["json"]),
        )?)
    }

    fn as_searcher(&self) -> Option<&dyn MessageSearcher> {
        Some(self)
    }
}

impl MessageSearcher for GeminiAdapter {
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
    use crate::domain::is_partial;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn document() -> Value {
        json!({
            "sessionId": "gem-1",
            "projectHash": "ignored",
            "startTime": "2026-02-19T08:00:00Z",
            "messages": [
                { "id": "1", "timestamp": "2026-02-19T08:00:00Z", "type": "user", "content": "explain the build" },
                { "id": "2", "timestamp": "2026-02-19T08:00:04Z", "type": "gemini", "content": "It uses cargo.",
                  "model": "gemini-2.5-pro",
                  "thoughts": [{ "subject": "Reading", "description": "Cargo.toml" }],
                  "tokens": { "input": 900, "output": 40, "cached": 100, "thoughts": 10, "total": 950 },
                  "toolCalls": [{ "id": "c1", "name": "read_file", "args": { "path": "Cargo.toml" }, "result": [{ "text": "[package]" }] }] },
                { "id": "3", "timestamp": "2026-02-19T08:01:00Z", "type": "user", "content": "thanks" }
            ]
        })
    }

    fn setup() -> (TempDir, PathBuf, PathBuf, GeminiAdapter) {
        let home = tempdir().expect("tempdir");
        let project = home.path().join("proj");
        fs::create_dir_all(&project).expect("project");
        let chats = home
            .path()
            .join("gemini/tmp")
            .join(project_hash(&paths::resolve(&project).expect("resolve")))
            .join("chats");
        fs::create_dir_all(&chats).expect("chats");
        let adapter = GeminiAdapter::new(home.path().join("gemini"));
        (home, project, chats, adapter)
    }

    #[test]
    fn hashes_projects_with_sha256() {
        assert_eq!(
            project_hash(Path::new("abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(project_hash(Path::new("/tmp/x")), project_hash(Path::new("/tmp/y")));
    }

    #[test]
    fn reads_messages_thoughts_tools_and_tokens() {
        let (_home, project, chats, adapter) = setup();
        fs::write(chats.join("session-2026-02-19-gem1.json"), document().to_string()).expect("write");
        assert!(adapter.detect(&project).expect("detect"));

        let sessions = adapter.sessions(&project).expect("sessions").data;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "gem-1");
        assert_eq!(sessions[0].name, "explain the build");

        let messages = adapter.messages("gem-1").expect("messages").data;
        assert_eq!(messages.len(), 3);
        let reply = &messages[1];
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.thinking_blocks[0].content, "Reading\nCargo.toml");
        assert_eq!(reply.tool_uses[0].name, "read_file");
        assert_eq!(reply.tool_uses[0].output, r#"[{"text":"[package]"}]"#);
        assert_eq!(reply.tokens.input_tokens, 800);
        assert_eq!(reply.tokens.output_tokens, 50);
        assert_eq!(reply.tokens.cache_read, 100);
    }

    #[test]
    fn truncated_document_recovers_complete_messages() {
        let (_home, _project, chats, adapter) = setup();
        let full = serde_json::to_string_pretty(&document()).expect("encode");
        let cut = full.find("\"thanks\"").expect("third message");
        fs::write(chats.join("session-cut.json"), &full[..cut]).expect("write");

        let loaded = adapter.messages("gem-1").expect("recovered");
        assert_eq!(loaded.data.len(), 2);
        assert_eq!(loaded.data[1].content, "It uses cargo.");
        let partial = loaded.partial.expect("partial");
        assert_eq!(partial.parsed_count, 2);
        assert!(is_partial(&partial));
    }

    #[test]
    fn unrecoverable_document_is_an_error() {
        let (_home, _project, chats, adapter) = setup();
        fs::write(chats.join("session-bad.json"), r#"{"sessionId":"bad","messages":[{"id"#).expect("write");
        assert!(matches!(adapter.messages("bad"), Err(AdapterError::Json { .. })));
    }

    #[test]
    fn other_projects_are_not_detected() {
        let (home, _project, _chats, adapter) = setup();
        let other = home.path().join("other");
        fs::create_dir_all(&other).expect("other");
        assert!(!adapter.detect(&other).expect("detect"));
        assert!(adapter.sessions(&other).expect("sessions").data.is_empty());
    }
}
