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
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

const RATES: [Rate; 3] = [
    Rate { needle: "gpt-5", input: 1.25, output: 10.0, cache_read: 0.125, cache_write: 0.0 },
    Rate { needle: "o3", input: 2.0, output: 8.0, cache_read: 0.5, cache_write: 0.0 },
    Rate { needle: "gpt-4.1", input: 2.0, output: 8.0, cache_read: 0.5, cache_write: 0.0 },
];
const FALLBACK_RATE: &Rate = &RATES[0];

/// Only this many leading lines are read when looking for `session_meta`.
const META_SCAN_LINES: usize = 5;

pub fn resolve_codex_sessions_dir() -> Result<PathBuf, AdapterError> {
    if let Some(home) = std::env::var_os("CODEX_HOME") {
        return Ok(PathBuf::from(home).join("sessions"));
    }
    let home = dirs::home_dir().ok_or(AdapterError::HomeDirNotFound)?;
    Ok(home.join(".codex").join("sessions"))
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct SessionMeta {
    id: Option<String>,
    cwd: Option<PathBuf>,
}

fn read_session_meta(path: &Path) -> Option<SessionMeta> {
    let reader = BufReader::new(File::open(path).ok()?);
    for line in reader.lines().take(META_SCAN_LINES) {
        let Ok(line) = line else {
            break;
        };
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if str_field(&value, "type") != Some("session_meta") {
            continue;
        }
        let payload = value.get("payload").unwrap_or(&Value::Null);
        return Some(SessionMeta {
            id: str_field(payload, "id").map(str::to_string),
            cwd: str_field(payload, "cwd").map(PathBuf::from),
        });
    }
    None
}

fn session_id_for(path: &Path, meta: &SessionMeta) -> Option<String> {
    meta.id
        .clone()
        .or_else(|| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
}

pub struct CodexAdapter {
    sessions_dir: Option<PathBuf>,
    cache: MessageCache,
    index: SessionIndex,
}

impl CodexAdapter {
    pub fn from_env() -> Self {
        let sessions_dir = resolve_codex_sessions_dir()
            .inspect_err(|error| warn!(%error, "codex adapter disabled"))
            .ok();
        Self {
            sessions_dir,
            cache: MessageCache::new(),
            index: SessionIndex::default(),
        }
    }

    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: Some(sessions_dir.into()),
            cache: MessageCache::new(),
            index: SessionIndex::default(),
        }
    }

    fn rollout_files(&self) -> Vec<PathBuf> {
        let Some(dir) = self.sessions_dir.as_ref().filter(|dir| dir.is_dir()) else {
            return Vec::new();
        };
        WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect()
    }

    // Rollouts recorded in `project_root` or any directory beneath it.
    fn project_rollouts(&self, project_root: &Path) -> Vec<(PathBuf, SessionMeta)> {
        let Some(root) = paths::resolve(project_root) else {
            return Vec::new();
        };
        self.rollout_files()
            .into_iter()
            .filter_map(|path| {
                let meta = read_session_meta(&path)?;
                let cwd = meta.cwd.as_deref()?;
                paths::is_under(&root, cwd).then_some((path, meta))
            })
            .collect()
    }

    fn locate(&self, session_id: &str) -> Result<PathBuf, AdapterError> {
        if let Some(path) = self.index.lookup(session_id) {
            return Ok(path);
        }
        let found = self.rollout_files().into_iter().find(|path| {
            let by_name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem == session_id || stem.ends_with(&format!("-{session_id}")));
            by_name
                || read_session_meta(path).is_some_and(|meta| meta.id.as_deref() == Some(session_id))
        });
        let path = found.ok_or_else(|| AdapterError::UnknownSession(session_id.to_string()))?;
        self.index.remember(session_id, &path);
        Ok(path)
    }
}

fn token_usage(info: &Value) -> Option<TokenUsage> {
    let last = info.get("last_token_usage")?;
    let input = u64_field(last, "input_tokens");
    let cached = u64_field(last, "cached_input_tokens");
    Some(TokenUsage {
        input_tokens: input.saturating_sub(cached),
        output_tokens: u64_field(last, "output_tokens"),
        cache_read: cached,
        cache_write: 0,
    })
}

fn content_text(message: &mut Message, content: &Value) {
    let mut texts = Vec::new();
    match content {
        Value::String(text) => texts.push(text.clone()),
        Value::Array(blocks) => {
            for block in blocks {
                match str_field(block, "type").unwrap_or("") {
                    "input_text" | "output_text" | "text" => {
                        if let Some(text) = str_field(block, "text") {
                            texts.push(text.to_string());
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
    message.content = texts.join("\n");
}

#[derive(Default)]
struct RolloutState {
    messages: Vec<Message>,
    model: String,
    pending_thinking: Vec<ThinkingBlock>,
}

impl RolloutState {
    fn push(&mut self, mut message: Message) {
        if message.role == Role::Assistant {
            message.model = self.model.clone();
            message.thinking_blocks.append(&mut self.pending_thinking);
        }
        self.messages.push(message);
    }

    // Tool calls attach to the assistant turn that issued them.
    fn assistant_for_tool(&mut self, id: String, timestamp: time::OffsetDateTime) -> &mut Message {
        let reuse = self
            .messages
            .last()
            .is_some_and(|last| last.role == Role::Assistant && self.pending_thinking.is_empty());
        if !reuse {
            self.push(Message::new(id, Role::Assistant, timestamp));
        }
        let last = self.messages.len() - 1;
        &mut self.messages[last]
    }
}

fn parse_rollout(path: &Path) -> Result<Loaded<Vec<Message>>, AdapterError> {
    let fallback_ts = FileStamp::of(path)
        .map_err(|error| AdapterError::io(path, error))?
        .modified_at();
    let lines = read_json_lines(path)?;
    let mut state = RolloutState::default();

    for (idx, record) in lines.records.iter().enumerate() {
        let id = format!("L{}", idx + 1);
        let timestamp = record
            .get("timestamp")
            .and_then(parse_timestamp_value)
            .or_else(|| state.messages.last().map(|m| m.timestamp))
            .unwrap_or(fallback_ts);
        let (kind, payload) = match record.get("payload") {
            Some(payload) => (str_field(record, "type").unwrap_or(""), payload),
            // Older rollouts wrote response items unwrapped.
            None => ("response_item", record),
        };

        match kind {
            "turn_context" => {
                if let Some(model) = str_field(payload, "model") {
                    state.model = model.to_string();
                }
            }
            "event_msg" if str_field(payload, "type") == Some("token_count") => {
                let usage = payload.get("info").and_then(token_usage);
                let target = state
                    .messages
                    .iter_mut()
                    .rev()
                    .find(|message| message.role == Role::Assistant);
                if let (Some(usage), Some(target)) = (usage, target) {
                    target.tokens.add(&usage);
                }
            }
            "response_item" => match str_field(payload, "type").unwrap_or("") {
                "message" => {
                    let role = Role::normalize(str_field(payload, "role").unwrap_or("assistant"));
                    let mut message = Message::new(id, role, timestamp);
                    content_text(&mut message, payload.get("content").unwrap_or(&Value::Null));
                    if !message.is_empty() {
                        state.push(message);
                    }
                }
                "reasoning" => {
                    let text = payload
                        .get("summary")
                        .and_then(Value::as_array)
                        .map(|parts| {
                            parts
                                .iter()
                                .filter_map(|part| str_field(part, "text"))
                                .collect::<Vec<_>>()
                                .join("\n")
                        })
                        .unwrap_or_default();
                    if !text.is_empty() {
                        state.pending_thinking.push(ThinkingBlock {
                            content: text,
                            token_count: 0,
                        });
                    }
                }
                "function_call" | "custom_tool_call" => {
                    let input = payload
                        .get("arguments")
                        .or_else(|| payload.get("input"))
                        .unwrap_or(&Value::Null);
                    // Arguments arrive as JSON text; keep structured input when it parses.
                    let input = match input {
                        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| input.clone()),
                        other => other.clone(),
                    };
                    let tool = tool_use(
                        str_field(payload, "call_id").unwrap_or(""),
                        str_field(payload, "name").unwrap_or(""),
                        &input,
                    );
                    state.assistant_for_tool(id, timestamp).tool_uses.push(tool);
                }
                "function_call_output" | "custom_tool_call_output" => {
                    let call_id = str_field(payload, "call_id").unwrap_or("");
                    let output = value_to_text(payload.get("output").unwrap_or(&Value::Null));
                    if !link_tool_result(&mut state.messages, call_id, &output) {
                        let mut message = Message::new(id, Role::Tool, timestamp);
                        message.content = output;
                        state.push(message);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    if !state.pending_thinking.is_empty() {
        let timestamp = state
            .messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(fallback_ts);
        state.push(Message::new("thinking", Role::Assistant, timestamp));
    }

    let failure = lines
        .failure
        .map(|(line, error)| (format!("malformed record at line {line}"), error));
    finish_messages(path, "codex", state.messages, failure)
}

impl Adapter for CodexAdapter {
    fn id(&self) -> &'static str {
        "codex"
    }

    fn name(&self) -> &'static str {
        "Codex"
    }

    fn icon(&self) -> &'static str {
        "▲"
    }

    fn detect(&self, project_root: &Path) -> Result<bool, AdapterError> {
        let Some(root) = paths::resolve(project_root) else {
            return Ok(false);
        };
        Ok(self.rollout_files().iter().any(|path| {
            read_session_meta(path)
                .and_then(|meta| meta.cwd)
                .is_some_and(|cwd| paths::is_under(&root, &cwd))
        }))
    }

    fn sessions(&self, project_root: &Path) -> Result<Loaded<Vec<Session>>, AdapterError> {
        let mut sessions = Vec::new();
        let mut skipped = 0;
        for (path, meta) in self.project_rollouts(project_root) {
            let Some(id) = session_id_for(&path, &meta) else {
                continue;
            };
            let Ok(stamp) = FileStamp::of(&path) else {
                skipped += 1;
                continue;
            };
            let loaded = match self.cache.load_shared(&path, stamp, parse_rollout) {
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
        self.cache.load(&path, parse_rollout)
    }

    fn watch(&self, _project_root: &Path) -> Result<FsWatcher, AdapterError> {
        let dir = self
            .sessions_dir
            .clone()
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

impl MessageSearcher for CodexAdapter {
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
    use std::fs;
    use std::io::Write;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        home: TempDir,
        project: PathBuf,
        adapter: CodexAdapter,
    }

    fn fixture() -> Fixture {
        let home = tempdir().expect("tempdir");
        let project = home.path().join("repo");
        fs::create_dir_all(project.join("crates")).expect("project");
        fs::create_dir_all(home.path().join("sessions/2026/02/19")).expect("sessions");
        Fixture {
            adapter: CodexAdapter::new(home.path().join("sessions")),
            project,
            home,
        }
    }

    fn rollout(fx: &Fixture, name: &str, id: &str, cwd: &Path, body: &[&str]) -> PathBuf {
        let path = fx.home.path().join("sessions/2026/02/19").join(name);
        let mut file = fs::File::create(&path).expect("create");
        let meta = serde_json::json!({
            "timestamp": "2026-02-19T09:00:00Z",
            "type": "session_meta",
            "payload": { "id": id, "cwd": cwd.to_string_lossy() },
        });
        writeln!(file, "{meta}").expect("meta");
        for line in body {
            writeln!(file, "{line}").expect("line");
        }
        path
    }

    const BODY: &[&str] = &[
        r#"{"timestamp":"2026-02-19T09:00:01Z","type":"turn_context","payload":{"cwd":"/x","model":"gpt-5-codex"}}"#,
        r#"{"timestamp":"2026-02-19T09:00:02Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"run the tests"}]}}"#,
        r#"{"timestamp":"2026-02-19T09:00:03Z","type":"response_item","payload":{"type":"reasoning","summary":[{"type":"summary_text","text":"use cargo"}]}}"#,
        r#"{"timestamp":"2026-02-19T09:00:04Z","type":"response_item","payload":{"type":"function_call","name":"shell","arguments":"{\"command\":[\"cargo\",\"test\"]}","call_id":"call_1"}}"#,
        r#"{"timestamp":"2026-02-19T09:00:05Z","type":"response_item","payload":{"type":"function_call_output","call_id":"call_1","output":"test result: ok"}}"#,
        r#"{"timestamp":"2026-02-19T09:00:06Z","type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"All tests pass."}]}}"#,
        r#"{"timestamp":"2026-02-19T09:00:07Z","type":"event_msg","payload":{"type":"token_count","info":{"last_token_usage":{"input_tokens":1000,"cached_input_tokens":400,"output_tokens":50}}}}"#,
    ];

    #[test]
    fn matches_rollouts_recorded_under_the_project() {
        let fx = fixture();
        assert!(!fx.adapter.detect(&fx.project).expect("detect"));
        rollout(&fx, "rollout-a-s1.jsonl", "s1", &fx.project.join("crates"), BODY);
        rollout(&fx, "rollout-b-s2.jsonl", "s2", Path::new("/elsewhere"), BODY);
        assert!(fx.adapter.detect(&fx.project).expect("detect"));

        let sessions = fx.adapter.sessions(&fx.project).expect("sessions").data;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
        assert_eq!(sessions[0].name, "run the tests");
        assert_eq!(sessions[0].message_count, 3);
    }

    #[test]
    fn normalizes_tool_calls_reasoning_and_tokens() {
        let fx = fixture();
        rollout(&fx, "rollout-a-s1.jsonl", "s1", &fx.project, BODY);
        let messages = fx.adapter.messages("s1").expect("messages").data;

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::User);
        let call = &messages[1];
        assert_eq!(call.role, Role::Assistant);
        assert_eq!(call.thinking_blocks[0].content, "use cargo");
        assert_eq!(call.tool_uses[0].input, r#"{"command":["cargo","test"]}"#);
        assert_eq!(call.tool_uses[0].output, "test result: ok");
        assert_eq!(call.model, "gpt-5-codex");

        let reply = &messages[2];
        assert_eq!(reply.content, "All tests pass.");
        assert_eq!(reply.tokens.input_tokens, 600);
        assert_eq!(reply.tokens.cache_read, 400);
        assert_eq!(reply.tokens.output_tokens, 50);
    }

    #[test]
    fn three_records_and_a_truncated_tail_yield_three_messages() {
        let fx = fixture();
        let path = fx.home.path().join("sessions/2026/02/19/rollout-c-s3.jsonl");
        fs::write(
            &path,
            concat!(
                r#"{"type":"response_item","timestamp":"2026-02-19T09:00:01Z","payload":{"type":"message","role":"user","content":"one"}}"#, "\n",
                r#"{"type":"response_item","timestamp":"2026-02-19T09:00:02Z","payload":{"type":"message","role":"assistant","content":"two"}}"#, "\n",
                r#"{"type":"response_item","timestamp":"2026-02-19T09:00:03Z","payload":{"type":"message","role":"user","content":"three"}}"#, "\n",
                r#"{"type":"response_item","timestamp":"2026-02-19T09:00:04Z","payload":{"type":"mess"#,
            ),
        )
        .expect("write");

        let loaded = fx.adapter.messages("s3").expect("recovered");
        let contents: Vec<_> = loaded.data.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        let partial = loaded.partial.expect("partial");
        assert_eq!(partial.parsed_count, 3);
        assert!(crate::domain::is_partial(&partial));
    }

    #[test]
    fn cache_notices_appended_records() {
        let fx = fixture();
        let path = rollout(&fx, "rollout-a-s1.jsonl", "s1", &fx.project, &BODY[..2]);
        assert_eq!(fx.adapter.messages("s1").expect("first").data.len(), 1);

        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        writeln!(file, "{}", BODY[5]).expect("append");
        drop(file);
        assert_eq!(fx.adapter.messages("s1").expect("second").data.len(), 2);
    }
}
