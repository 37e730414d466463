use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use unicode_width::UnicodeWidthStr;

/// Single-line text input used by filters, the search box and the issue id prompt.
/// `cursor` counts chars, not bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineEditor {
    pub text: String,
    pub cursor: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EditOutcome {
    Changed,
    Moved,
    Ignored,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: &str) -> Self {
        let mut editor = Self::new();
        editor.insert_str(text);
        editor
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.cursor = 0;
    }

    pub fn insert_char(&mut self, ch: char) {
        let mut buffer = [0u8; 4];
        self.insert_str(ch.encode_utf8(&mut buffer));
    }

    /// Pasted newlines and tabs collapse into single spaces.
    pub fn insert_str(&mut self, text: &str) {
        let flat = flatten_whitespace(text);
        if flat.is_empty() {
            return;
        }
        let at = self.byte_at(self.cursor);
        self.text.insert_str(at, &flat);
        self.cursor += flat.chars().count();
    }

    pub fn backspace(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        let at = self.byte_at(self.cursor);
        self.text.remove(at);
        true
    }

    pub fn delete(&mut self) -> bool {
        if self.cursor >= self.len() {
            return false;
        }
        let at = self.byte_at(self.cursor);
        self.text.remove(at);
        true
    }

    /// Removes the word before the cursor along with any spaces after it.
    pub fn delete_word(&mut self) -> bool {
        let chars = self.text.chars().collect::<Vec<_>>();
        let mut start = self.cursor.min(chars.len());
        while start > 0 && chars[start - 1] == ' ' {
            start -= 1;
        }
        while start > 0 && chars[start - 1] != ' ' {
            start -= 1;
        }
        if start == self.cursor {
            return false;
        }
        let (from, to) = (self.byte_at(start), self.byte_at(self.cursor));
        self.text.replace_range(from..to, "");
        self.cursor = start;
        true
    }

    pub fn move_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn move_right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.len());
    }

    pub fn move_home(&mut self) {
        self.cursor = 0;
    }

    pub fn move_end(&mut self) {
        self.cursor = self.len();
    }

    /// Editing keys only; `enter`, `esc` and navigation stay with the caller.
    pub fn handle_key(&mut self, key: &KeyEvent) -> EditOutcome {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        let changed = |yes: bool| {
            if yes {
                EditOutcome::Changed
            } else {
                EditOutcome::Ignored
            }
        };
        match key.code {
            KeyCode::Char('u') if ctrl => {
                let had_text = !self.is_empty();
                self.clear();
                changed(had_text)
            }
            KeyCode::Char('w') if ctrl => changed(self.delete_word()),
            KeyCode::Char('a') if ctrl => {
                self.move_home();
                EditOutcome::Moved
            }
            KeyCode::Char('e') if ctrl => {
                self.move_end();
                EditOutcome::Moved
            }
            KeyCode::Char(ch)
                if !ctrl && !key.modifiers.contains(KeyModifiers::ALT) =>
            {
                self.insert_char(ch);
                EditOutcome::Changed
            }
            KeyCode::Backspace => changed(self.backspace()),
            KeyCode::Delete => changed(self.delete()),
            KeyCode::Left => {
                self.move_left();
                EditOutcome::Moved
            }
            KeyCode::Right => {
                self.move_right();
                EditOutcome::Moved
            }
            KeyCode::Home => {
                self.move_home();
                EditOutcome::Moved
            }
            KeyCode::End => {
                self.move_end();
                EditOutcome::Moved
            }
            _ => EditOutcome::Ignored,
        }
    }

    /// Terminal columns between the start of the text and the cursor.
    pub fn cursor_width(&self) -> u16 {
        let prefix = &self.text[..self.byte_at(self.cursor)];
        u16::try_from(prefix.width()).unwrap_or(u16::MAX)
    }

    fn len(&self) -> usize {
        self.text.chars().count()
    }

    fn byte_at(&self, cursor: usize) -> usize {
        self.text
            .char_indices()
            .nth(cursor)
            .map_or(self.text.len(), |(idx, _)| idx)
    }
}

fn flatten_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        let ch = if matches!(ch, '\n' | '\r' | '\t') { ' ' } else { ch };
        if ch == ' ' && out.ends_with(' ') {
            continue;
        }
        out.push(ch);
    }
    out
}
