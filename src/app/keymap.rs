use crate::domain::FocusContext;
use crate::infra::KeymapConfig;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum KeymapError {
    #[error("override key must look like `key@context`: {0}")]
    MissingContext(String),

    #[error("invalid key `{key}`: {message}")]
    InvalidKey { key: String, message: String },
}

/// A command as shown in the palette.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub id: String,
    pub name: String,
    pub description: String,
    pub context: FocusContext,
    /// Higher sorts first in the palette.
    pub priority: u8,
}

impl Command {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        context: FocusContext,
        priority: u8,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            context,
            priority,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Binding {
    pub key: String,
    pub command: String,
    pub context: FocusContext,
}

/// Canonical key text: `ctrl+c`, `alt+x`, `G`, `?`, `enter`, `shift+tab`.
///
/// Shift is folded into the character for printable keys, so `G` and `?` carry no `shift+`.
pub fn key_string(event: &KeyEvent) -> Option<String> {
    let mut prefix = String::new();
    if event.modifiers.contains(KeyModifiers::CONTROL) {
        prefix.push_str("ctrl+");
    }
    if event.modifiers.contains(KeyModifiers::ALT) {
        prefix.push_str("alt+");
    }
    let shift = event.modifiers.contains(KeyModifiers::SHIFT);
    let key = match event.code {
        KeyCode::Char(' ') => "space".to_string(),
        KeyCode::Char(ch) => {
            if prefix.is_empty() {
                ch.to_string()
            } else {
                ch.to_ascii_lowercase().to_string()
            }
        }
        KeyCode::Enter => "enter".to_string(),
        KeyCode::Esc => "esc".to_string(),
        KeyCode::Tab if shift => return Some(format!("{prefix}shift+tab")),
        KeyCode::Tab => "tab".to_string(),
        KeyCode::BackTab => return Some(format!("{prefix}shift+tab")),
        KeyCode::Backspace => "backspace".to_string(),
        KeyCode::Delete => "delete".to_string(),
        KeyCode::Up => "up".to_string(),
        KeyCode::Down => "down".to_string(),
        KeyCode::Left => "left".to_string(),
        KeyCode::Right => "right".to_string(),
        KeyCode::Home => "home".to_string(),
        KeyCode::End => "end".to_string(),
        KeyCode::PageUp => "pgup".to_string(),
        KeyCode::PageDown => "pgdown".to_string(),
        KeyCode::F(n) => format!("f{n}"),
        _ => return None,
    };
    Some(format!("{prefix}{key}"))
}

const NAMED_KEYS: &[&str] = &[
    "space", "enter", "esc", "tab", "shift+tab", "backspace", "delete", "up", "down", "left",
    "right", "home", "end", "pgup", "pgdown",
];

/// Normalizes user-written key text to the form produced by [`key_string`].
pub fn normalize_key(raw: &str) -> Result<String, KeymapError> {
    let trimmed = raw.trim();
    let invalid = |message: &str| KeymapError::InvalidKey {
        key: raw.to_string(),
        message: message.to_string(),
    };
    if trimmed.is_empty() {
        return Err(invalid("key is empty"));
    }
    if trimmed == "+" {
        return Ok(trimmed.to_string());
    }
    let lower = trimmed.to_ascii_lowercase();
    if NAMED_KEYS.contains(&lower.as_str()) || lower == "escape" || lower == "return" {
        return Ok(match lower.as_str() {
            "escape" => "esc".to_string(),
            "return" => "enter".to_string(),
            _ => lower,
        });
    }

    let mut parts: Vec<&str> = trimmed.split('+').collect();
    let Some(last) = parts.pop() else {
        return Err(invalid("key is empty"));
    };
    let mut modifiers = String::new();
    for modifier in ["ctrl", "alt"] {
        if parts.iter().any(|part| part.eq_ignore_ascii_case(modifier)) {
            modifiers.push_str(modifier);
            modifiers.push('+');
        }
    }
    if let Some(unknown) = parts.iter().find(|part| {
        !["ctrl", "control", "alt"].contains(&part.to_ascii_lowercase().as_str())
    }) {
        return Err(invalid(&format!("unknown modifier `{unknown}`")));
    }
    if parts.iter().any(|part| part.eq_ignore_ascii_case("control")) && !modifiers.contains("ctrl") {
        modifiers.insert_str(0, "ctrl+");
    }

    let last_lower = last.to_ascii_lowercase();
    if NAMED_KEYS.contains(&last_lower.as_str())
        || (last_lower.starts_with('f') && last_lower[1..].parse::<u8>().is_ok())
    {
        return Ok(format!("{modifiers}{last_lower}"));
    }
    let mut chars = last.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) if modifiers.is_empty() => Ok(ch.to_string()),
        (Some(ch), None) => Ok(format!("{modifiers}{}", ch.to_ascii_lowercase())),
        _ => Err(invalid("keys are single characters or named keys")),
    }
}

/// Context-scoped key bindings with user overrides layered over the defaults.
#[derive(Debug, Default)]
pub struct Keymap {
    defaults: HashMap<FocusContext, HashMap<String, String>>,
    overrides: HashMap<FocusContext, HashMap<String, String>>,
    commands: Vec<Command>,
}

impl Keymap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command(&mut self, command: Command) {
        match self
            .commands
            .iter_mut()
            .find(|existing| existing.id == command.id && existing.context == command.context)
        {
            Some(existing) => *existing = command,
            None => self.commands.push(command),
        }
    }

    pub fn bind(&mut self, key: &str, command: &str, context: FocusContext) {
        let key = normalize_key(key).unwrap_or_else(|_| key.to_string());
        self.defaults
            .entry(context)
            .or_default()
            .insert(key, command.to_string());
    }

    /// Context bindings first, then `global`. Overrides shadow defaults within each scope.
    pub fn lookup(&self, key: &str, context: &FocusContext) -> Option<&str> {
        self.lookup_in(key, context)
            .or_else(|| self.lookup_in(key, &FocusContext::Global))
    }

    fn lookup_in(&self, key: &str, context: &FocusContext) -> Option<&str> {
        self.overrides
            .get(context)
            .and_then(|keys| keys.get(key))
            .or_else(|| self.defaults.get(context).and_then(|keys| keys.get(key)))
            .map(String::as_str)
    }

    pub fn set_user_override(
        &mut self,
        key: &str,
        command: &str,
        context: FocusContext,
    ) -> Result<(), KeymapError> {
        let key = normalize_key(key)?;
        self.overrides
            .entry(context)
            .or_default()
            .insert(key, command.to_string());
        Ok(())
    }

    pub fn clear_user_overrides(&mut self) {
        self.overrides.clear();
    }

    /// Replaces all overrides with the `"key@context"` entries from config. Bad entries are skipped.
    pub fn apply_config(&mut self, config: &KeymapConfig) -> Vec<KeymapError> {
        self.clear_user_overrides();
        let mut errors = Vec::new();
        for (spec, command) in &config.overrides {
            let result = parse_override_spec(spec)
                .and_then(|(key, context)| self.set_user_override(&key, command, context));
            if let Err(error) = result {
                warn!(%error, "ignoring keymap override");
                errors.push(error);
            }
        }
        errors
    }

    /// Palette source: commands for `context` plus global ones, highest priority first.
    pub fn commands(&self, context: &FocusContext) -> Vec<&Command> {
        let mut commands: Vec<&Command> = self
            .commands
            .iter()
            .filter(|command| {
                command.context == *context || command.context == FocusContext::Global
            })
            .collect();
        commands.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| (a.context == FocusContext::Global).cmp(&(b.context == FocusContext::Global)))
                .then_with(|| a.name.cmp(&b.name))
        });
        commands
    }

    pub fn all_commands(&self) -> &[Command] {
        &self.commands
    }

    /// Effective bindings in one scope, sorted by key.
    pub fn bindings(&self, context: &FocusContext) -> Vec<Binding> {
        let mut merged: HashMap<&str, &str> = HashMap::new();
        for layer in [&self.defaults, &self.overrides] {
            if let Some(keys) = layer.get(context) {
                for (key, command) in keys {
                    merged.insert(key, command);
                }
            }
        }
        let mut bindings: Vec<Binding> = merged
            .into_iter()
            .map(|(key, command)| Binding {
                key: key.to_string(),
                command: command.to_string(),
                context: context.clone(),
            })
            .collect();
        bindings.sort_by(|a, b| a.key.cmp(&b.key));
        bindings
    }

    /// First key bound to `command` as seen from `context`, for footer hints.
    pub fn key_for(&self, command: &str, context: &FocusContext) -> Option<String> {
        [context, &FocusContext::Global]
            .into_iter()
            .flat_map(|scope| self.bindings(scope))
            .find(|binding| binding.command == command)
            .map(|binding| binding.key)
    }
}

/// Splits `"key@context"` at the last `@`, so `@@global` binds the `@` key.
pub fn parse_override_spec(spec: &str) -> Result<(String, FocusContext), KeymapError> {
    let Some((key, context)) = spec.rsplit_once('@') else {
        return Err(KeymapError::MissingContext(spec.to_string()));
    };
    if key.is_empty() || context.trim().is_empty() {
        return Err(KeymapError::MissingContext(spec.to_string()));
    }
    let context = context.parse().unwrap_or(FocusContext::Global);
    Ok((normalize_key(key)?, context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn key_strings_fold_shift_into_characters() {
        assert_eq!(
            key_string(&key(KeyCode::Char('G'), KeyModifiers::SHIFT)).as_deref(),
            Some("G")
        );
        assert_eq!(
            key_string(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)).as_deref(),
            Some("ctrl+c")
        );
        assert_eq!(
            key_string(&key(KeyCode::BackTab, KeyModifiers::SHIFT)).as_deref(),
            Some("shift+tab")
        );
        assert_eq!(normalize_key("Ctrl+E").as_deref(), Ok("ctrl+e"));
        assert_eq!(normalize_key("Escape").as_deref(), Ok("esc"));
        assert!(normalize_key("hyper+x").is_err());
    }

    #[test]
    fn lookup_falls_back_to_global() {
        let mut keymap = Keymap::new();
        keymap.bind("r", "refresh", FocusContext::Global);
        keymap.bind("j", "cursor-down", FocusContext::ConversationsSidebar);

        assert_eq!(keymap.lookup("j", &FocusContext::ConversationsSidebar), Some("cursor-down"));
        assert_eq!(keymap.lookup("r", &FocusContext::ConversationsSidebar), Some("refresh"));
        assert_eq!(keymap.lookup("j", &FocusContext::GitStatus), None);
    }

    #[test]
    fn overrides_shadow_defaults_until_cleared() {
        let mut keymap = Keymap::new();
        keymap.bind("j", "cursor-down", FocusContext::ConversationsSidebar);
        let mut config = KeymapConfig::default();
        config
            .overrides
            .insert("j@conversations-sidebar".to_string(), "open-session".to_string());
        config.overrides.insert("nonsense".to_string(), "x".to_string());

        let errors = keymap.apply_config(&config);
        assert_eq!(errors, vec![KeymapError::MissingContext("nonsense".to_string())]);
        assert_eq!(keymap.lookup("j", &FocusContext::ConversationsSidebar), Some("open-session"));

        keymap.clear_user_overrides();
        assert_eq!(keymap.lookup("j", &FocusContext::ConversationsSidebar), Some("cursor-down"));
    }

    #[test]
    fn override_spec_accepts_the_at_key() {
        assert_eq!(
            parse_override_spec("@@global"),
            Ok(("@".to_string(), FocusContext::Global))
        );
        let (_, custom) = parse_override_spec("x@my-plugin").expect("spec");
        assert_eq!(custom, FocusContext::Custom("my-plugin".to_string()));
    }

    #[test]
    fn palette_lists_context_commands_before_globals() {
        let mut keymap = Keymap::new();
        keymap.register_command(Command::new("quit", "Quit", FocusContext::Global, 1));
        keymap.register_command(Command::new("open", "Open session", FocusContext::ConversationsSidebar, 1));
        keymap.register_command(Command::new("stage", "Stage", FocusContext::GitStatus, 9));

        let ids: Vec<&str> = keymap
            .commands(&FocusContext::ConversationsSidebar)
            .into_iter()
            .map(|command| command.id.as_str())
            .collect();
        assert_eq!(ids, ["open", "quit"]);
    }
}
