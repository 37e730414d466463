use super::common::{
    MessageCache, Rate, SessionIndex, SessionParts, build_session, cost_from_rates,
    finish_messages, finish_sessions, link_tool_result, read_json_lines, str_field, tool_use,
    u64_field,
};
use super::search::search_messages_in;
use super::{Adapter, AdapterError, MessageMatch, MessageSearcher, SearchOptions};
use crate::domain::{
    ContentBlock, Loaded, Message, Role, Session, ThinkingBlock, TokenUsage,
    parse_timestamp_value, value_to_text,
};
use crate::infra::{FileStamp, FsWatcher, extension_filter, paths, watch_paths};
use notify::RecursiveMode;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

const RATES: [Rate; 3] = [
    Rate { needle: "opus", input: 15.0, output: 75.0, cache_read: 1.5, cache_write: 18.75 },
    Rate { needle: "haiku", input: 0.8, output: 4.0, cache_read: 0.08, cache_write: 1.0 },
    Rate { needle: "sonnet", input: 3.0, output: 15.0, cache_read: 0.3, cache_write: 3.75 },
];
const FALLBACK_RATE: &Rate = &RATES[2];

pub fn resolve_claude_projects_dir() -> Result<PathBuf, AdapterError> {
    if let Some(config_dir) = std::env::var_os("CLAUDE_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir).join("projects"));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home.join(".claude").join("projects"))
}

/// Claude stores each project under its path with every non-alphanumeric character turned into `-`.
pub fn encode_project_dir_name(project_root: &Path) -> String {
    project_root
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

pub struct ClaudeAdapter {
    projects_dir: Option<PathBuf>,
    cache: MessageCache,
    index: SessionIndex,
}

impl ClaudeAdapter {
    pub fn from_env() -> Self {
        match resolve_claude_projects_dir() {
            Ok(dir) => Self::new(dir),
            Err(error) => {
                warn!(%error, "claude adapter disabled");
                Self {
                    projects_dir: None,
                    cache: MessageCache::new(),
                    index: SessionIndex::default(),
                }
            }
        }
    }

    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: Some(projects_dir.into()),
            cache: MessageCache::new(),
            index: SessionIndex::default(),
        }
    }

    fn project_dir(&self, project_root: &Path) -> Option<PathBuf> {
        let root = paths::resolve(project_root)?;
        Some(
            self.projects_dir
                .as_ref()?
                .join(encode_project_dir_name(&root)),
        )
    }

    fn session_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(dir)
            .max_depth(3)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
    }

    fn locate(&self, session_id: &str) -> Result<PathBuf, AdapterError> {
        if let Some(path) = self.index.lookup(session_id) {
            return Ok(path);
        }
        let dir = self
            .projects_dir
            .as_ref()
            .ok_or(AdapterError::HomeDirNotFound)?;
        let file_name = format!("{session_id}.jsonl");
        let path = WalkDir::new(dir)
            .max_depth(4)
            .into_iter()
            .filter_map(Result::ok)
            .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name.as_str())
            .map(|entry| entry.into_path())
            .ok_or_else(|| AdapterError::UnknownSession(session_id.to_string()))?;
        self.index.remember(session_id, &path);
        Ok(path)
    }
}

fn is_sub_agent_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("agent-"))
        || path.components().any(|c| c.as_os_str() == "subagents")
}

fn token_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: u64_field(usage, "input_tokens"),
        output_tokens: u64_field(usage, "output_tokens"),
        cache_read: u64_field(usage, "cache_read_input_tokens"),
        cache_write: u64_field(usage, "cache_creation_input_tokens"),
    }
}

// Tool results that match an earlier tool use are folded into it rather than kept as blocks.
fn apply_content(messages: &mut [Message], message: &mut Message, content: &Value) {
    let mut texts = Vec::new();
    match content {
        Value::String(text) => texts.push(text.clone()),
        Value::Array(blocks) => {
            for block in blocks {
                let block_type = str_field(block, "type").unwrap_or("");
                match block_type {
                    "text" => {
                        if let Some(text) = str_field(block, "text") {
                            texts.push(text.to_string());
                        }
                    }
                    "thinking" | "redacted_thinking" => {
                        let thinking = str_field(block, "thinking")
                            .or_else(|| str_field(block, "text"))
                            .unwrap_or("");
                        if !thinking.is_empty() {
                            message.thinking_blocks.push(ThinkingBlock {
                                content: thinking.to_string(),
                                token_count: 0,
                            });
                        }
                    }
                    "tool_use" => {
                        message.tool_uses.push(tool_use(
                            str_field(block, "id").unwrap_or(""),
                            str_field(block, "name").unwrap_or(""),
                            block.get("input").unwrap_or(&Value::Null),
                        ));
                    }
                    "tool_result" => {
                        let id = str_field(block, "tool_use_id").unwrap_or("");
                        let output = value_to_text(block.get("content").unwrap_or(&Value::Null));
                        if !link_tool_result(messages, id, &output)
                            && !link_tool_result(std::slice::from_mut(message), id, &output)
                        {
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
        }
        _ => {}
    }

    let joined = texts.join("\n");
    if !joined.is_empty() {
        if message.content.is_empty() {
            message.content = joined;
        } else {
            message.content.push('\n');
            message.content.push_str(&joined);
        }
    }
}

fn parse_session_file(path: &Path) -> Result<Loaded<Vec<Message>>, AdapterError> {
    let fallback_ts = FileStamp::of(path)
        .map_err(|error| AdapterError::io(path, error))?
        .modified_at();
    let lines = read_json_lines(path)?;

    let mut messages: Vec<Message> = Vec::new();
    // Streaming writes split one API message across records that share `message.id`.
    let mut last_api_id: Option<String> = None;

    for (idx, record) in lines.records.iter().enumerate() {
        let kind = str_field(record, "type").unwrap_or("");
        if kind != "user" && kind != "assistant" {
            continue;
        }
        let body = record.get("message").unwrap_or(&Value::Null);
        let role = Role::normalize(str_field(body, "role").unwrap_or(kind));
        let timestamp = record
            .get("timestamp")
            .and_then(parse_timestamp_value)
            .or_else(|| messages.last().map(|m| m.timestamp))
            .unwrap_or(fallback_ts);
        let api_id = str_field(body, "id").map(str::to_string);
        let content = body.get("content").unwrap_or(&Value::Null);

        if role == Role::Assistant && api_id.is_some() && api_id == last_api_id {
            let same_turn = messages.last().is_some_and(|last| last.role == Role::Assistant);
            if let (true, Some((current, earlier))) = (same_turn, messages.split_last_mut()) {
                apply_content(earlier, current, content);
                if let Some(usage) = body.get("usage") {
                    current.tokens = token_usage(usage);
                }
                continue;
            }
        }

        let id = str_field(record, "uuid")
            .map(str::to_string)
            .or_else(|| api_id.clone())
            .unwrap_or_else(|| format!("line-{}", idx + 1));
        let mut message = Message::new(id, role, timestamp);
        message.model = str_field(body, "model").unwrap_or("").to_string();
        if let Some(usage) = body.get("usage") {
            message.tokens = token_usage(usage);
        }
        apply_content(&mut messages, &mut message, content);

        // A chunk that produced nothing (a bare thinking signature) is not a merge target.
        if message.is_empty() {
            last_api_id = None;
        } else {
            last_api_id = if role == Role::Assistant { api_id } else { None };
            messages.push(message);
        }
    }

    let failure = lines
        .failure
        .map(|(line, error)| (format!("malformed record at line {line}"), error));
    finish_messages(path, "claude-code", messages, failure)
}

impl Adapter for ClaudeAdapter {
    fn id(&self) -> &'static str {
        "claude-code"
    }

    fn name(&self) -> &'static str {
        "Claude Code"
    }

    fn icon(&self) -> &'static str {
        "◆"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        let Some(dir) = self.project_dir(project_root) else {
            return Ok(false);
        };
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(false);
        };
        Ok(entries
            .filter_map(Result::ok)
            .any(|entry| entry.path().extension().is_some_and(|ext| ext == "jsonl")))
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let Some(dir) = self.project_dir(project_root) else {
            return Ok(Loaded::complete(Vec::new()));
        };
        if !dir.is_dir() {
            return Ok(Loaded::complete(Vec::new()));
        }

        let mut sessions = Vec::new();
        let mut skipped = 0;
        for path in Self::session_files(&dir) {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let stamp = match FileStamp::of(&path) {
                Ok(stamp) => stamp,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            let loaded = match self.cache.load_shared(&path, stamp, parse_session_file) {
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
                    is_sub_agent: is_sub_agent_file(&path),
                },
            ));
        }
        Ok(finish_sessions(self.id(), sessions, skipped))
    }

    fn messages(&self, session_id: &str) -> Result<Loaded<Vec<Message>>, AdapterError> {
        let path = self.locate(session_id)?;
        self.cache.load(&path, parse_session_file)
    }

    fn watch(&self, project_root: &Path) -> Result<FsWatcher, AdapterError> {
        let dir = self
            .project_dir(project_root)
            .ok_or(AdapterError::HomeDirNotFound)?;
        Ok(watch_paths(
            &[(dir, RecursiveMode::Recursive)],
            extension_filter(&["jsonl"]),
        )?)
    }

    fn as_searcher(&self) -> Option<&dyn MessageSearcher> {
        Some(self)
    }
}

impl MessageSearcher for ClaudeAdapter {
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
