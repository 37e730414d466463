use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

/// Sessions updated within this window are shown as live.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    /// Maps the role and record-type names used by the supported tools onto the canonical set.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "human" | "prompt" | "input" => Self::User,
            "system" | "developer" | "info" | "error" | "warning" => Self::System,
            "tool" | "tool_result" | "function" | "function_call_output" => Self::Tool,
            _ => Self::Assistant,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read == 0
            && self.cache_write == 0
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_write = self.cache_write.saturating_add(other.cache_write);
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    /// Tool input serialized as JSON text.
    pub input: String,
    /// Tool output serialized as JSON text; empty until a result is linked.
    pub output: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ThinkingBlock {
    pub content: String,
    pub token_count: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContentBlock {
    pub block_type: String,
    pub text: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: OffsetDateTime,
    pub model: String,
    pub tokens: TokenUsage,
    pub tool_uses: Vec<ToolUse>,
    pub thinking_blocks: Vec<ThinkingBlock>,
    pub content_blocks: Vec<ContentBlock>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, timestamp: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            role,
            content: String::new(),
            timestamp,
            model: String::new(),
            tokens: TokenUsage::default(),
            tool_uses: Vec::new(),
            thinking_blocks: Vec::new(),
            content_blocks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
            && self.tool_uses.is_empty()
            && self.thinking_blocks.is_empty()
            && self.content_blocks.is_empty()
    }

    /// All searchable text: content, tool payloads, and thinking, one block per line group.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !self.content.is_empty() {
            parts.push(&self.content);
        }
        for block in &self.content_blocks {
            if !block.text.is_empty() && block.text != self.content {
                parts.push(&block.text);
            }
        }
        for tool in &self.tool_uses {
            parts.push(&tool.input);
            if !tool.output.is_empty() {
                parts.push(&tool.output);
            }
        }
        for thinking in &self.thinking_blocks {
            parts.push(&thinking.content);
        }
        parts.join("\n")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub adapter_id: &'static str,
    pub adapter_name: &'static str,
    pub adapter_icon: &'static str,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub duration: Duration,
    pub total_tokens: u64,
    pub est_cost: f64,
    pub message_count: usize,
    pub is_sub_agent: bool,
    pub source_path: PathBuf,
    pub source_size_bytes: u64,
}

impl Session {
    /// Derived from the clock on every call; never cached.
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        now - self.updated_at < ACTIVE_WINDOW
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(OffsetDateTime::now_utc())
    }

    /// Globally unique key across adapters.
    pub fn key(&self) -> (String, String) {
        (self.adapter_id.to_string(), self.id.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelUsage {
    pub tokens: TokenUsage,
    pub message_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageStats {
    pub totals: TokenUsage,
    pub total_tokens: u64,
    pub message_count: usize,
    pub by_model: BTreeMap<String, ModelUsage>,
}

pub fn usage_from_messages(messages: &[Message]) -> UsageStats {
    let mut stats = UsageStats {
        message_count: messages.len(),
        ..UsageStats::default()
    };
    for message in messages {
        stats.totals.add(&message.tokens);
        if message.tokens.is_empty() {
            continue;
        }
        let model = if message.model.is_empty() {
            "unknown".to_string()
        } else {
            message.model.clone()
        };
        let entry = stats.by_model.entry(model).or_default();
        entry.tokens.add(&message.tokens);
        entry.message_count += 1;
    }
    stats.total_tokens = stats.totals.total();
    stats
}

/// Deep copy handed out to callers so cached originals stay untouched.
pub fn copy_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|message| Message {
            id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp,
            model: message.model.clone(),
            tokens: message.tokens,
            tool_uses: message.tool_uses.to_vec(),
            thinking_blocks: message.thinking_blocks.to_vec(),
            content_blocks: message.content_blocks.to_vec(),
        })
        .collect()
}

/// Stable sort by timestamp; ties keep source append order.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by_key(|message| message.timestamp);
}

pub fn sort_sessions(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample_message() -> Message {
        let mut message = Message::new("m1", Role::Assistant, datetime!(2026-02-19 00:00 UTC));
        message.content = "hello".to_string();
        message.tool_uses.push(ToolUse {
            id: "t1".to_string(),
            name: "Bash".to_string(),
            input: r#"{"cmd":"ls"}"#.to_string(),
            output: "ok".to_string(),
        });
        message.thinking_blocks.push(ThinkingBlock {
            content: "hmm".to_string(),
            token_count: 3,
        });
        message.content_blocks.push(ContentBlock {
            block_type: "text".to_string(),
            text: "hello".to_string(),
        });
        message
    }

    #[test]
    fn copied_messages_are_independent_of_originals() {
        let original = vec![sample_message()];
        let snapshot = original.clone();

        let mut copy = copy_messages(&original);
        copy[0].tool_uses[0].output.push_str(" mutated");
        copy[0].thinking_blocks[0].content.clear();
        copy[0].content_blocks.push(ContentBlock::default());
        copy[0].tool_uses.clear();

        assert_eq!(original, snapshot);
    }

    #[test]
    fn normalizes_roles_across_tools() {
        assert_eq!(Role::normalize("human"), Role::User);
        assert_eq!(Role::normalize("gemini"), Role::Assistant);
        assert_eq!(Role::normalize("info"), Role::System);
        assert_eq!(Role::normalize("tool_result"), Role::Tool);
        assert_eq!(Role::normalize("USER"), Role::User);
    }

    #[test]
    fn active_window_is_five_minutes() {
        let now = datetime!(2026-02-19 12:00 UTC);
        let mut session = Session {
            id: "s".to_string(),
            name: "s".to_string(),
            slug: "s".to_string(),
            adapter_id: "fake",
            adapter_name: "Fake",
            adapter_icon: "F",
            created_at: now,
            updated_at: datetime!(2026-02-19 11:56 UTC),
            duration: Duration::ZERO,
            total_tokens: 0,
            est_cost: 0.0,
            message_count: 0,
            is_sub_agent: false,
            source_path: PathBuf::new(),
            source_size_bytes: 0,
        };
        assert!(session.is_active_at(now));
        session.updated_at = datetime!(2026-02-19 11:55 UTC);
        assert!(!session.is_active_at(now));
    }

    #[test]
    fn usage_splits_tokens_per_model() {
        let mut a = Message::new("a", Role::Assistant, datetime!(2026-02-19 00:00 UTC));
        a.model = "claude-sonnet".to_string();
        a.tokens = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read: 1,
            cache_write: 0,
        };
        let mut b = a.clone();
        b.model = "claude-opus".to_string();
        let user = Message::new("u", Role::User, datetime!(2026-02-19 00:00 UTC));

        let stats = usage_from_messages(&[user, a, b]);
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.total_tokens, 30);
        assert_eq!(stats.by_model.len(), 2);
        assert_eq!(stats.by_model["claude-opus"].tokens.output_tokens, 5);
    }

    #[test]
    fn sort_is_stable_for_equal_timestamps() {
        let ts = datetime!(2026-02-19 00:00 UTC);
        let mut messages = vec![
            Message::new("b", Role::User, ts),
            Message::new("a", Role::User, ts),
            Message::new("z", Role::User, datetime!(2026-02-18 00:00 UTC)),
        ];
        sort_messages(&mut messages);
        let ids = messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["z", "b", "a"]);
    }
}
