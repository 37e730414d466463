use super::theme::Styles;
use super::{pad_left, truncate_end};
use crate::app::{ConversationsPlugin, OpenSession, Pane, SearchOutcome, SessionSearchResult};
use crate::domain::{Message, Role, Session};
use humansize::{DECIMAL, format_size};
use ratatui::prelude::*;
use ratatui::widgets::*;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;
use unicode_width::UnicodeWidthStr;

const SIDEBAR_MIN_WIDTH: u16 = 60;
const TOOL_PREVIEW_CHARS: usize = 120;

pub fn render(frame: &mut Frame, area: Rect, plugin: &ConversationsPlugin, styles: &Styles) {
    if area.width == 0 || area.height == 0 {
        return;
    }
    if area.width < SIDEBAR_MIN_WIDTH {
        match plugin.pane {
            Pane::Main if plugin.open.is_some() => render_main(frame, area, plugin, styles),
            _ => render_sidebar(frame, area, plugin, styles),
        }
        return;
    }
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(area);
    render_sidebar(frame, chunks[0], plugin, styles);
    render_main(frame, chunks[1], plugin, styles);
}

fn pane_block<'a>(title: String, focused: bool, styles: &Styles) -> Block<'a> {
    Block::default()
        .borders(Borders::ALL)
        .padding(Padding::horizontal(1))
        .border_style(if focused {
            styles.border_focused
        } else {
            styles.border
        })
        .title(Span::styled(title, styles.title))
}

fn render_sidebar(frame: &mut Frame, area: Rect, plugin: &ConversationsPlugin, styles: &Styles) {
    let focused = plugin.focused && plugin.pane == Pane::Sidebar;
    if let Some(search) = &plugin.search {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(0)])
            .split(area);

        let status = search_status(search.running, search.outcome.as_ref());
        let input = Paragraph::new(Line::from(vec![
            Span::styled("/ ", styles.key_hint),
            Span::styled(search.input.text.as_str(), styles.text),
        ]))
        .block(pane_block(format!("Search · {status}"), focused, styles));
        frame.render_widget(input, chunks[0]);
        if search.editing && plugin.focused {
            frame.set_cursor_position((
                chunks[0].x + 4 + search.input.cursor_width(),
                chunks[0].y + 1,
            ));
        }

        let results = search
            .outcome
            .as_ref()
            .map_or(&[][..], |outcome| outcome.results.as_slice());
        let width = chunks[1].width.saturating_sub(4) as usize;
        let items: Vec<ListItem> = results
            .iter()
            .map(|result| search_result_item(result, width, styles))
            .collect();
        let mut state = ListState::default();
        if !results.is_empty() {
            state.select(Some(search.selected.min(results.len() - 1)));
        }
        let list = List::new(items)
            .block(pane_block("Results".to_string(), focused, styles))
            .highlight_style(styles.selected);
        frame.render_stateful_widget(list, chunks[1], &mut state);
        return;
    }

    let title = if plugin.loading {
        format!("Sessions ({}) · loading…", plugin.sessions.len())
    } else {
        format!("Sessions ({})", plugin.sessions.len())
    };
    let block = pane_block(title, focused, styles);
    if plugin.sessions.is_empty() {
        let message = if plugin.loading {
            "Loading sessions…".to_string()
        } else if plugin.adapter_count() == 0 {
            "No coding-agent history found for this project.".to_string()
        } else {
            "No sessions yet.".to_string()
        };
        frame.render_widget(
            Paragraph::new(message)
                .style(styles.dim)
                .wrap(Wrap { trim: false })
                .block(block),
            area,
        );
        return;
    }

    let now = OffsetDateTime::now_utc();
    let width = area.width.saturating_sub(6) as usize;
    let items: Vec<ListItem> = plugin
        .sessions
        .iter()
        .map(|session| session_item(session, now, width, styles))
        .collect();
    let mut state = ListState::default();
    state.select(Some(plugin.selected.min(plugin.sessions.len() - 1)));
    let list = List::new(items)
        .block(block)
        .highlight_style(styles.selected)
        .highlight_symbol("▸ ");
    frame.render_stateful_widget(list, area, &mut state);
}

fn search_status(running: bool, outcome: Option<&SearchOutcome>) -> String {
    if running {
        return "searching…".to_string();
    }
    let Some(outcome) = outcome else {
        return "type to search".to_string();
    };
    let mut status = format!(
        "{} matches in {} sessions",
        outcome.total_matches,
        outcome.results.len()
    );
    if outcome.truncated {
        status.push_str(" (limit reached)");
    }
    if outcome.timed_out {
        status.push_str(" (timed out)");
    }
    if outcome.skipped > 0 {
        status.push_str(&format!(", {} not searchable", outcome.skipped));
    }
    status
}

fn search_result_item(result: &SessionSearchResult, width: usize, styles: &Styles) -> ListItem<'static> {
    let arrow = if result.collapsed { "▸ " } else { "▾ " };
    let count = format!(" {}", result.match_count());
    let name_width = width.saturating_sub(UnicodeWidthStr::width(count.as_str()) + 2);
    let mut lines = vec![Line::from(vec![
        Span::styled(arrow, styles.muted),
        Span::styled(truncate_end(&result.session.name, name_width), styles.text),
        Span::styled(count, styles.key_hint),
    ])];
    if !result.collapsed {
        for message in &result.messages {
            for hit in &message.matches {
                lines.push(match_line(
                    message.role,
                    hit.line_no,
                    &hit.line_text,
                    hit.col_start..hit.col_end,
                    width,
                    styles,
                ));
            }
        }
    }
    ListItem::new(lines)
}

fn match_line(
    role: Role,
    line_no: usize,
    text: &str,
    span: std::ops::Range<usize>,
    width: usize,
    styles: &Styles,
) -> Line<'static> {
    let prefix = format!("  {} {line_no}: ", role_marker(role));
    let room = width.saturating_sub(UnicodeWidthStr::width(prefix.as_str()));
    let mut spans = vec![Span::styled(prefix, styles.dim)];
    match (text.get(..span.start), text.get(span.clone()), text.get(span.end..)) {
        (Some(before), Some(hit), Some(after)) => {
            // Keep the hit visible when the line is long.
            let before = if UnicodeWidthStr::width(before) > room / 2 {
                let tail = super::take_suffix_width(before, room / 2);
                format!("…{tail}")
            } else {
                before.to_string()
            };
            let used = UnicodeWidthStr::width(before.as_str()) + UnicodeWidthStr::width(hit);
            spans.push(Span::styled(before, styles.muted));
            spans.push(Span::styled(hit.to_string(), styles.highlight));
            spans.push(Span::styled(
                truncate_end(after, room.saturating_sub(used)),
                styles.muted,
            ));
        }
        _ => spans.push(Span::styled(truncate_end(text, room), styles.muted)),
    }
    Line::from(spans)
}

fn role_marker(role: Role) -> &'static str {
    match role {
        Role::User => "›",
        Role::Assistant => "‹",
        Role::System => "!",
        Role::Tool => "⚙",
    }
}

fn session_item(
    session: &Session,
    now: OffsetDateTime,
    width: usize,
    styles: &Styles,
) -> ListItem<'static> {
    let dot = if session.is_active_at(now) {
        Span::styled("● ", styles.success)
    } else {
        Span::raw("  ")
    };
    let indent = if session.is_sub_agent { "↳ " } else { "" };
    let right = format!(
        "{}  {}",
        pad_left(&relative_time(now, session.updated_at), 7),
        pad_left(&format_size(session.source_size_bytes, DECIMAL), 8)
    );
    let left_prefix = format!("{} {indent}", session.adapter_icon);
    let used = 2 + UnicodeWidthStr::width(left_prefix.as_str()) + UnicodeWidthStr::width(right.as_str()) + 1;
    let name = truncate_end(&session.name, width.saturating_sub(used));
    let padding = width.saturating_sub(used + UnicodeWidthStr::width(name.as_str()));
    ListItem::new(Line::from(vec![
        dot,
        Span::styled(left_prefix, styles.muted),
        Span::styled(name, styles.text),
        Span::raw(" ".repeat(padding + 1)),
        Span::styled(right, styles.dim),
    ]))
}

fn render_main(frame: &mut Frame, area: Rect, plugin: &ConversationsPlugin, styles: &Styles) {
    let focused = plugin.focused && plugin.pane == Pane::Main;
    let Some(open) = &plugin.open else {
        frame.render_widget(
            Paragraph::new("Select a session and press enter.")
                .style(styles.dim)
                .block(pane_block("Messages".to_string(), focused, styles)),
            area,
        );
        return;
    };

    let block = pane_block(open.session.name.clone(), focused, styles);
    let inner = block.inner(area);
    frame.render_widget(block, area);
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(2), Constraint::Min(0)])
        .split(inner);

    frame.render_widget(Paragraph::new(session_summary(open, styles)), chunks[0]);

    if open.loading {
        frame.render_widget(Paragraph::new("Loading messages…").style(styles.dim), chunks[1]);
        return;
    }
    if let Some(error) = &open.error {
        frame.render_widget(
            Paragraph::new(format!("Could not load messages: {error}"))
                .style(styles.error)
                .wrap(Wrap { trim: false }),
            chunks[1],
        );
        return;
    }

    let lines: Vec<Line> = open
        .messages
        .iter()
        .flat_map(|message| message_rows(message, plugin.show_thinking))
        .map(|(row, text)| style_row(row, text, styles))
        .collect();
    let max_scroll = lines.len().saturating_sub(chunks[1].height as usize);
    let scroll = u16::try_from(open.scroll.min(max_scroll)).unwrap_or(u16::MAX);
    frame.render_widget(Paragraph::new(lines).scroll((scroll, 0)), chunks[1]);
}

fn session_summary(open: &OpenSession, styles: &Styles) -> Vec<Line<'static>> {
    let session = &open.session;
    let mut first = vec![
        Span::styled(
            format!("{} {}", session.adapter_icon, session.adapter_name),
            styles.key_hint,
        ),
        Span::styled(format!("  {} messages", session.message_count), styles.muted),
    ];
    if session.total_tokens > 0 {
        first.push(Span::styled(
            format!("  {} tokens", session.total_tokens),
            styles.muted,
        ));
    }
    if session.est_cost > 0.0 {
        first.push(Span::styled(format!("  ${:.2}", session.est_cost), styles.muted));
    }
    if !session.duration.is_zero() {
        first.push(Span::styled(
            format!("  {}", format_duration(session.duration)),
            styles.muted,
        ));
    }
    let second = match &open.partial {
        Some(partial) => Line::styled(format!("partial: {partial}"), styles.toast_warning),
        None => Line::styled(crate::domain::short_id(&session.id), styles.dim),
    };
    vec![Line::from(first), second]
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Row {
    Header(Role),
    Text,
    Thinking,
    Tool,
    Blank,
}

fn message_rows(message: &Message, show_thinking: bool) -> Vec<(Row, String)> {
    let mut rows = Vec::new();
    let mut header = format!("{} · {}", message.role.label(), clock_time(message.timestamp));
    if !message.model.is_empty() {
        header.push_str(&format!(" · {}", message.model));
    }
    let tokens = message.tokens.total();
    if tokens > 0 {
        header.push_str(&format!(" · {tokens} tok"));
    }
    rows.push((Row::Header(message.role), header));

    if !message.thinking_blocks.is_empty() {
        if show_thinking {
            for block in &message.thinking_blocks {
                rows.push((Row::Thinking, format!("thinking ({} tokens)", block.token_count)));
                rows.extend(
                    block
                        .content
                        .lines()
                        .map(|line| (Row::Thinking, format!("  {line}"))),
                );
            }
        } else {
            rows.push((
                Row::Thinking,
                format!("{} thinking block(s) hidden", message.thinking_blocks.len()),
            ));
        }
    }

    rows.extend(
        message
            .content
            .lines()
            .map(|line| (Row::Text, line.to_string())),
    );

    for tool in &message.tool_uses {
        rows.push((
            Row::Tool,
            format!("⚙ {} {}", tool.name, preview(&tool.input)),
        ));
        if !tool.output.is_empty() {
            rows.push((Row::Tool, format!("  → {}", preview(&tool.output))));
        }
    }
    rows.push((Row::Blank, String::new()));
    rows
}

fn style_row(row: Row, text: String, styles: &Styles) -> Line<'static> {
    let style = match row {
        Row::Header(Role::User) => styles.user,
        Row::Header(Role::Tool) => styles.tool,
        Row::Header(_) => styles.assistant.add_modifier(Modifier::BOLD),
        Row::Text => styles.text,
        Row::Thinking => styles.thinking,
        Row::Tool => styles.tool,
        Row::Blank => styles.base,
    };
    Line::styled(text, style)
}

fn preview(text: &str) -> String {
    crate::domain::truncate_title(text, TOOL_PREVIEW_CHARS)
}

/// First row of message `target` as laid out by the main pane.
pub fn message_offset(messages: &[Message], target: usize, show_thinking: bool) -> usize {
    messages
        .iter()
        .take(target)
        .map(|message| message_rows(message, show_thinking).len())
        .sum()
}

fn clock_time(timestamp: OffsetDateTime) -> String {
    timestamp
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

fn relative_time(now: OffsetDateTime, then: OffsetDateTime) -> String {
    let seconds = (now - then).whole_seconds().max(0) as u64;
    if seconds < 60 {
        return "now".to_string();
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h");
    }
    format!("{}d", hours / 24)
}

fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m {}s", seconds % 60);
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}
