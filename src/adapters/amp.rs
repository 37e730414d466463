use super::common::{
    MessageCache, Rate, SessionIndex, SessionParts, build_session, cost_from_rates,
    finish_messages, finish_sessions, link_tool_result, recover_array_prefix, str_field,
    tool_use, u64_field,
};
use super::search::search_messages_in;
use super::{Adapter, AdapterError, MessageMatch, MessageSearcher, SearchOptions};
use crate::domain::{
    ContentBlock, Loaded, Message, Role, Session, ThinkingBlock, TokenUsage,
    parse_timestamp_value, value_to_text,
};
use crate::infra::{FileStamp, FsWatcher, extension_filter, paths, watch_paths};
use notify::RecursiveMode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

const RATES: [Rate; 2] = [
    Rate { needle: "opus", input: 15.0, output: 75.0, cache_read: 1.5, cache_write: 18.75 },
    Rate { needle: "sonnet", input: 3.0, output: 15.0, cache_read: 0.3, cache_write: 3.75 },
];
const FALLBACK_RATE: &Rate = &RATES[1];

/// `AMP_HOME`, then `$XDG_DATA_HOME/amp`, then `~/.local/share/amp`.
pub fn resolve_amp_threads_dir() -> Result<PathBuf, AdapterError> {
    if let Some(home) = std::env::var_os("AMP_HOME") {
        return Ok(PathBuf::from(home).join("threads"));
    }
    if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(data).join("amp").join("threads"));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home.join(".local").join("share").join("amp").join("threads"))
}

/// Everything but `messages`, which serde skips without building values.
#[derive(Clone, Debug, Default, Deserialize)]
struct ThreadHeader {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    env: Option<Value>,
}

impl ThreadHeader {
    fn workspace(&self) -> Option<PathBuf> {
        let initial = self.env.as_ref()?.get("initial")?;
        if let Some(cwd) = str_field(initial, "cwd") {
            return Some(PathBuf::from(cwd));
        }
        initial
            .get("trees")?
            .as_array()?
            .iter()
            .find_map(|tree| match tree.get("uri")? {
                Value::String(uri) => Some(file_uri_to_path(uri)),
                uri @ Value::Object(_) => str_field(uri, "fsPath")
                    .or_else(|| str_field(uri, "path"))
                    .map(PathBuf::from),
                _ => None,
            })
    }
}

fn file_uri_to_path(uri: &str) -> PathBuf {
    let Some(rest) = uri.strip_prefix("file://") else {
        return PathBuf::from(uri);
    };
    let bytes = rest.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'%')
            .then(|| bytes.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(byte) => {
                decoded.push(byte);
                i += 3;
            }
            None => {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
    }
    PathBuf::from(String::from_utf8_lossy(&decoded).into_owned())
}

pub struct AmpAdapter {
    threads_dir: Option<PathBuf>,
    cache: MessageCache,
    index: SessionIndex,
    headers: Mutex<HashMap<PathBuf, (FileStamp, ThreadHeader)>>,
}

impl AmpAdapter {
    pub fn from_env() -> Self {
        let threads_dir = resolve_amp_threads_dir()
            .inspect_err(|error| warn!(%error, "amp adapter disabled"))
            .ok();
        Self::with_dir(threads_dir)
    }

    pub fn new(threads_dir: impl Into<PathBuf>) -> Self {
        Self::with_dir(Some(threads_dir.into()))
    }

    fn with_dir(threads_dir: Option<PathBuf>) -> Self {
        Self {
            threads_dir,
            cache: MessageCache::new(),
            index: SessionIndex::default(),
            headers: Mutex::new(HashMap::new()),
        }
    }

    fn thread_files(&self) -> Vec<PathBuf> {
        let Some(dir) = &self.threads_dir else {
            return Vec::new();
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect()
    }

    fn header(&self, path: &Path, stamp: FileStamp) -> Option<ThreadHeader> {
        if let Some((seen, header)) = self
            .headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
        {
            if *seen == stamp {
                return Some(header.clone());
            }
        }
        let bytes = fs::read(path).ok()?;
        let header = serde_json::from_slice::<ThreadHeader>(&bytes).ok()?;
        self.headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), (stamp, header.clone()));
        Some(header)
    }

    fn project_threads(&self, project_root: &Path) -> Vec<(PathBuf, FileStamp, ThreadHeader)> {
        let Some(root) = paths::resolve(project_root) else {
            return Vec::new();
        };
        self.thread_files()
            .into_iter()
            .filter_map(|path| {
                let stamp = FileStamp::of(&path).ok()?;
                let header = self.header(&path, stamp)?;
                let workspace = header.workspace()?;
                paths::is_under(&root, &workspace).then_some((path, stamp, header))
            })
            .collect()
    }

    fn locate(&self, session_id: &str) -> Result<PathBuf, AdapterError> {
        if let Some(path) = self.index.lookup(session_id) {
            return Ok(path);
        }
        let dir = self
            .threads_dir
            .as_ref()
            .ok_or(AdapterError::HomeDirNotFound)?;
        let path = dir.join(format!("{session_id}.json"));
        if path.is_file() {
            self.index.remember(session_id, &path);
            return Ok(path);
        }
        Err(AdapterError::UnknownSession(session_id.to_string()))
    }
}

fn token_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: u64_field(usage, "inputTokens"),
        output_tokens: u64_field(usage, "outputTokens"),
        cache_read: u64_field(usage, "cacheReadInputTokens"),
        cache_write: u64_field(usage, "cacheCreationInputTokens"),
    }
}

fn tool_result_output(block: &Value) -> String {
    let run = block.get("run").unwrap_or(&Value::Null);
    if let Some(result) = run.get("result").filter(|r| !r.is_null()) {
        return value_to_text(result);
    }
    if let Some(progress) = run.get("progress").filter(|p| !p.is_null()) {
        return value_to_text(progress);
    }
    str_field(run, "status")
        .map(|status| format!("[{status}]"))
        .unwrap_or_default()
}

fn convert_thread(raw_messages: &[Value], fallback_ts: time::OffsetDateTime) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    for (idx, raw) in raw_messages.iter().enumerate() {
        let role = Role::normalize(str_field(raw, "role").unwrap_or("assistant"));
        let timestamp = raw
            .get("meta")
            .and_then(|meta| meta.get("sentAt"))
            .and_then(parse_timestamp_value)
            .or_else(|| messages.last().map(|m| m.timestamp))
            .unwrap_or(fallback_ts);
        let id = raw
            .get("messageId")
            .map(value_to_text)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{idx}"));
        let mut message = Message::new(id, role, timestamp);
        if let Some(usage) = raw.get("usage") {
            message.tokens = token_usage(usage);
            message.model = str_field(usage, "model").unwrap_or("").to_string();
        }

        let mut texts = Vec::new();
        for block in raw
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let block_type = str_field(block, "type").unwrap_or("");
            match block_type {
                "text" => texts.extend(str_field(block, "text").map(str::to_string)),
                "thinking" => {
                    if let Some(thinking) = str_field(block, "thinking").filter(|t| !t.is_empty()) {
                        message.thinking_blocks.push(ThinkingBlock {
                            content: thinking.to_string(),
                            token_count: 0,
                        });
                    }
                }
                "tool_use" => message.tool_uses.push(tool_use(
                    str_field(block, "id").unwrap_or(""),
                    str_field(block, "name").unwrap_or(""),
                    block.get("input").unwrap_or(&Value::Null),
                )),
                "tool_result" => {
                    let id = str_field(block, "toolUseID")
                        .or_else(|| str_field(block, "tool_use_id"))
                        .unwrap_or("");
                    let output = tool_result_output(block);
                    if !link_tool_result(&mut messages, id, &output) {
                        message.content_blocks.push(ContentBlock {
                            block_type: block_type.to_string(),
                            text: output,
                        });
                    }
                }
                other => message.content_blocks.push(ContentBlock {
                    block_type: other.to_string(),
                    text: str_field(block, "text").unwrap_or("").to_string(),
                }),
            }
        }
        message.content = texts.join("\n");
        if !message.is_empty() {
            messages.push(message);
        }
    }
    messages
}

fn parse_thread_file(path: &Path) -> Result<Loaded<Vec<Message>>, AdapterError> {
    let stamp = FileStamp::of(path).map_err(|error| AdapterError::io(path, error))?;
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
            Some(("truncated thread document".to_string(), error)),
        ),
    };
    let messages = convert_thread(&raw_messages, stamp.modified_at());
    finish_messages(path, "amp", messages, failure)
}

impl Adapter for AmpAdapter {
    fn id(&self) -> &'static str {
        "amp"
    }

    fn name(&self) -> &'static str {
        "Amp"
    }

    fn icon(&self) -> &'static str {
        "⚡"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        Ok(!self.project_threads(project_root).is_empty())
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let mut sessions = Vec::new();
        let mut skipped = 0;
        for (path, stamp, header) in self.project_threads(project_root) {
            let Some(id) = header
                .id
                .clone()
                .or_else(|| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            else {
                continue;
            };
            let loaded = match self.cache.load_shared(&path, stamp, parse_thread_file) {
                Ok(loaded) => loaded,
                Err(error) => {
                    warn!(adapter = self.id(), path = %path.display(), %error, "skipping thread");
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
                    title: header.title.as_deref(),
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
        self.cache.load(&path, parse_thread_file)
    }

    fn watch(&self, _project_root: &Path) -> Result<FsWatcher, AdapterError> {
        let dir = self
            .threads_dir
            .clone()
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

impl MessageSearcher for AmpAdapter {
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
    use tempfile::tempdir;

    fn thread(id: &str, workspace: &str) -> Value {
        json!({
            "v": 3,
            "id": id,
            "created": 1771488000000_i64,
            "title": "Refactor the cache",
            "messages": [
                { "role": "user", "messageId": 0, "meta": { "sentAt": 1771488000000_i64 },
                  "content": [{ "type": "text", "text": "refactor the cache" }] },
                { "role": "assistant", "messageId": 1,
                  "usage": { "model": "claude-sonnet-4", "inputTokens": 10, "outputTokens": 5 },
                  "content": [
                    { "type": "thinking", "thinking": "start with get()" },
                    { "type": "tool_use", "id": "tu1", "name": "edit_file", "input": { "path": "cache.rs" } }
                  ] },
                { "role": "user", "messageId": 2, "meta": { "sentAt": 1771488060000_i64 },
                  "content": [{ "type": "tool_result", "toolUseID": "tu1", "run": { "status": "done", "result": "ok" } }] }
            ],
            "env": { "initial": { "trees": [{ "uri": workspace }] } }
        })
    }

    #[test]
    fn decodes_file_uris() {
        assert_eq!(
            file_uri_to_path("file:///home/me/my%20app"),
            PathBuf::from("/home/me/my app")
        );
        assert_eq!(file_uri_to_path("/plain/path"), PathBuf::from("/plain/path"));
    }

    #[test]
    fn lists_threads_for_the_project_workspace() {
        let home = tempdir().expect("tempdir");
        let project = home.path().join("app");
        fs::create_dir_all(&project).expect("project");
        let threads = home.path().join("threads");
        fs::create_dir_all(&threads).expect("threads");
        let resolved = paths::resolve(&project).expect("resolve");
        let uri = format!("file://{}", resolved.display());
        fs::write(threads.join("T-1.json"), thread("T-1", &uri).to_string()).expect("write");
        fs::write(threads.join("T-2.json"), thread("T-2", "file:///elsewhere").to_string())
            .expect("write");

        let adapter = AmpAdapter::new(&threads);
        assert!(adapter.detect(&project).expect("detect"));
        let sessions = adapter.sessions(&project).expect("sessions").data;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "T-1");
        assert_eq!(sessions[0].name, "Refactor the cache");
        assert_eq!(sessions[0].message_count, 2);
        assert_eq!(sessions[0].total_tokens, 15);

        let messages = adapter.messages("T-1").expect("messages").data;
        assert_eq!(messages[1].thinking_blocks[0].content, "start with get()");
        assert_eq!(messages[1].tool_uses[0].output, "ok");
        assert_eq!(messages[1].model, "claude-sonnet-4");
    }

    #[test]
    fn truncated_thread_keeps_complete_messages() {
        let home = tempdir().expect("tempdir");
        let full = thread("T-3", "file:///x").to_string();
        let cut = full.find(r#""messageId":2"#).expect("third message");
        fs::write(home.path().join("T-3.json"), &full[..cut]).expect("write");

        let adapter = AmpAdapter::new(home.path());
        let loaded = adapter.messages("T-3").expect("recovered");
        assert_eq!(loaded.data.len(), 2);
        assert_eq!(loaded.partial.as_ref().map(|p| p.parsed_count), Some(2));
        assert_eq!(loaded.data[0].content, "refactor the cache");
    }
}
