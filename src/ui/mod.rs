pub mod conversations;
pub mod theme;

use crate::app::{
    AppModel, FOOTER_HEIGHT, HEADER_HEIGHT, INTRO_FRAMES, IssueInputModal, IssuePreviewModal,
    Modal, ModalKind, NoticeLevel, PaletteModal, PluginInfo, ProjectSwitcherModal, ThemeScope,
    ThemeSwitcherModal, UpdateModal, VERSION, WorktreeSwitcherModal,
};
use crate::infra::paths::display_path;
use ratatui::prelude::*;
use ratatui::widgets::*;
use theme::Styles;
use time::macros::format_description;
use unicode_width::UnicodeWidthStr;

pub const APP_TITLE: &str = " sidecar ";

pub fn tab_label(info: &PluginInfo) -> String {
    format!(" {} {} ", info.icon, info.name)
}

pub fn render(frame: &mut Frame, model: &AppModel) {
    let full_area = frame.area();
    if full_area.width == 0 || full_area.height == 0 {
        return;
    }
    let styles = model.styles.as_ref();
    frame.render_widget(Block::default().style(styles.base), full_area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(HEADER_HEIGHT),
            Constraint::Min(0),
            Constraint::Length(FOOTER_HEIGHT),
        ])
        .split(full_area);

    render_header(frame, chunks[0], model);
    if model.plugins.focused().is_some() {
        model.plugins.view_focused(frame, chunks[1], styles);
    } else {
        let message = if model.plugins.info().is_empty() {
            "No plugins registered."
        } else {
            "Loading project…"
        };
        let paragraph = Paragraph::new(message)
            .style(styles.muted)
            .alignment(Alignment::Center);
        frame.render_widget(paragraph, chunks[1]);
    }
    render_footer(frame, chunks[2], model);

    for modal in model.modals.paint_order() {
        let focused = model.modals.top_kind() == Some(modal.kind());
        match modal {
            Modal::Palette(palette) => render_palette(frame, full_area, model, palette),
            Modal::Help { scroll } => render_help(frame, full_area, model, *scroll),
            Modal::Update(update) => render_update(frame, full_area, styles, update),
            Modal::Diagnostics { scroll } => render_diagnostics(frame, full_area, model, *scroll),
            Modal::QuitConfirm => render_quit_confirm(frame, full_area, styles),
            Modal::ProjectSwitcher(switcher) => {
                render_project_switcher(frame, full_area, model, switcher, focused)
            }
            Modal::WorktreeSwitcher(switcher) => {
                render_worktree_switcher(frame, full_area, model, switcher)
            }
            Modal::ThemeSwitcher(switcher) => render_theme_switcher(frame, full_area, styles, switcher),
            Modal::IssueInput(input) => render_issue_input(frame, full_area, styles, input, focused),
            Modal::IssuePreview(preview) => render_issue_preview(frame, full_area, styles, preview),
        }
    }
}

fn render_header(frame: &mut Frame, area: Rect, model: &AppModel) {
    let styles = model.styles.as_ref();
    frame.render_widget(Block::default().style(styles.bar), area);

    // The title lights up one letter per intro frame; its width never changes.
    let letters = APP_TITLE.chars().count();
    let lit = letters * usize::from(model.intro_frame) / usize::from(INTRO_FRAMES);
    let mut spans: Vec<Span> = APP_TITLE
        .chars()
        .enumerate()
        .map(|(idx, ch)| {
            let style = if idx < lit {
                styles.key_hint.add_modifier(Modifier::BOLD)
            } else {
                styles.dim
            };
            Span::styled(ch.to_string(), style)
        })
        .collect();

    if !model.intro_running() {
        for info in model.plugins.visible() {
            let style = if info.focused {
                styles.tab_active
            } else {
                styles.tab_inactive
            };
            spans.push(Span::styled(tab_label(&info), style));
            spans.push(Span::raw(" "));
        }
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);

    let mut right = display_path(&model.workdir);
    if model.config.ui.show_clock {
        if let Ok(clock) = model.now.format(format_description!("[hour]:[minute]")) {
            right = format!("{right}  {clock}");
        }
    }
    let right = format!("{right} ");
    let width = UnicodeWidthStr::width(right.as_str()) as u16;
    if width < area.width / 2 {
        let rect = Rect {
            x: area.x + area.width - width,
            width,
            ..area
        };
        frame.render_widget(Paragraph::new(right).style(styles.bar), rect);
    }
}

fn render_footer(frame: &mut Frame, area: Rect, model: &AppModel) {
    let styles = model.styles.as_ref();
    if let Some(toast) = &model.toast {
        let style = match toast.level {
            NoticeLevel::Info => styles.toast_info,
            NoticeLevel::Warning => styles.toast_warning,
            NoticeLevel::Error => styles.toast_error,
        };
        let text = truncate_end(&format!(" {}", toast.text), area.width as usize);
        frame.render_widget(Paragraph::new(text).style(style), area);
        return;
    }

    let context = model.focus_context();
    let mut spans = vec![Span::styled(format!(" {context} "), styles.tab_inactive)];
    let mut used = UnicodeWidthStr::width(spans[0].content.as_ref());
    for command in model.keymap.commands(&context) {
        let Some(key) = model.keymap.key_for(&command.id, &context) else {
            continue;
        };
        let hint = format!(" {key} {}", command.name);
        let width = UnicodeWidthStr::width(hint.as_str());
        if used + width > area.width as usize {
            break;
        }
        used += width;
        spans.push(Span::styled(format!(" {key}"), styles.key_hint));
        spans.push(Span::styled(format!(" {}", command.name), styles.muted));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)).style(styles.bar), area);
}

fn modal_block<'a>(title: &'a str, styles: &Styles) -> Block<'a> {
    Block::default()
        .borders(Borders::ALL)
        .padding(Padding::horizontal(1))
        .border_style(styles.border_focused)
        .title(Span::styled(title, styles.title))
        .style(styles.base)
}

fn filter_line<'a>(text: &'a str, styles: &Styles) -> Line<'a> {
    Line::from(vec![
        Span::styled("> ", styles.key_hint),
        Span::styled(text, styles.text),
    ])
}

fn render_palette(frame: &mut Frame, area: Rect, model: &AppModel, palette: &PaletteModal) {
    let styles = model.styles.as_ref();
    let popup = centered_rect(60, 60, area);
    frame.render_widget(Clear, popup);
    let title = format!("{} · {}", ModalKind::Palette.title(), palette.context);
    let block = modal_block(&title, styles);
    let inner = block.inner(popup);
    frame.render_widget(block, popup);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(2), Constraint::Min(0)])
        .split(inner);
    frame.render_widget(
        Paragraph::new(filter_line(&palette.list.filter.text, styles)),
        chunks[0],
    );
    frame.set_cursor_position((
        chunks[0].x + 2 + palette.list.filter.cursor_width(),
        chunks[0].y,
    ));

    let entries = model.palette_entries();
    let items: Vec<ListItem> = entries
        .iter()
        .map(|command| {
            let key = model
                .keymap
                .key_for(&command.id, &palette.context)
                .unwrap_or_default();
            let mut spans = vec![
                Span::styled(pad_right(&key, 8), styles.key_hint),
                Span::styled(command.name.clone(), styles.text),
            ];
            if !command.description.is_empty() {
                spans.push(Span::styled(format!("  {}", command.description), styles.dim));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let list = List::new(items)
        .highlight_style(styles.selected)
        .highlight_symbol("▸ ");
    let mut state = ListState::default();
    if !entries.is_empty() {
        state.select(Some(palette.list.selected.min(entries.len() - 1)));
    }
    frame.render_stateful_widget(list, chunks[1], &mut state);
}

fn render_help(frame: &mut Frame, area: Rect, model: &AppModel, scroll: u16) {
    let styles = model.styles.as_ref();
    let popup = centered_rect(70, 70, area);
    frame.render_widget(Clear, popup);

    let context = model.plugins.focused_context();
    let mut lines = Vec::new();
    for scope in [context.clone(), crate::domain::FocusContext::Global] {
        let bindings = model.keymap.bindings(&scope);
        if bindings.is_empty() {
            continue;
        }
        lines.push(Line::styled(scope.to_string(), styles.title));
        for binding in bindings {
            let name = model
                .keymap
                .all_commands()
                .iter()
                .find(|command| command.id == binding.command)
                .map_or(binding.command.as_str(), |command| command.name.as_str());
            lines.push(Line::from(vec![
                Span::styled(format!("  {}", pad_right(&binding.key, 10)), styles.key_hint),
                Span::styled(name.to_string(), styles.text),
            ]));
        }
        lines.push(Line::from(""));
    }
    lines.push(Line::styled(
        "1-9 focus a plugin · ctrl+c quit · esc close",
        styles.dim,
    ));

    let paragraph = Paragraph::new(lines)
        .scroll((scroll, 0))
        .block(modal_block(ModalKind::Help.title(), styles));
    frame.render_widget(paragraph, popup);
}

fn render_update(frame: &mut Frame, area: Rect, styles: &Styles, update: &UpdateModal) {
    let popup = centered_rect(50, 30, area);
    frame.render_widget(Clear, popup);
    let mut lines = vec![Line::styled(
        format!("sidecar {}", update.version),
        styles.title,
    )];
    if let Some(previous) = &update.previous {
        lines.push(Line::styled(format!("updated from {previous}"), styles.muted));
    }
    lines.push(Line::from(""));
    lines.push(Line::styled("enter to continue", styles.dim));
    let paragraph = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(modal_block(ModalKind::Update.title(), styles));
    frame.render_widget(paragraph, popup);
}

fn render_diagnostics(frame: &mut Frame, area: Rect, model: &AppModel, scroll: u16) {
    let styles = model.styles.as_ref();
    let popup = centered_rect(76, 76, area);
    frame.render_widget(Clear, popup);

    let section = |title: &str| Line::styled(title.to_string(), styles.title);
    let row = |label: &str, value: String| {
        Line::from(vec![
            Span::styled(format!("  {}", pad_right(label, 14)), styles.muted),
            Span::styled(value, styles.text),
        ])
    };

    let mut lines = vec![
        section("sidecar"),
        row("version", VERSION.to_string()),
        row("config", display_path(&model.config_path)),
        row("theme", model.styles.name.clone()),
        row("diff mode", format!("{:?}", model.state.diff_mode()).to_lowercase()),
    ];
    if let Some(error) = &model.config_error {
        lines.push(Line::styled(format!("  config error: {error}"), styles.error));
    }
    for error in &model.keymap_errors {
        lines.push(Line::styled(format!("  keymap: {error}"), styles.error));
    }

    lines.push(Line::from(""));
    lines.push(section("Project"));
    lines.push(row("workdir", display_path(&model.workdir)));
    lines.push(row("repository", display_path(&model.project_root)));

    lines.push(Line::from(""));
    lines.push(section("Adapters"));
    if model.adapters.is_empty() {
        lines.push(Line::styled("  none detected for this project", styles.dim));
    }
    for adapter in model.adapters.values() {
        lines.push(row(
            adapter.id(),
            format!("{} {}", adapter.icon(), adapter.name()),
        ));
    }

    lines.push(Line::from(""));
    lines.push(section("Plugins"));
    for info in model.plugins.info() {
        let style = match info.status {
            crate::app::PluginStatus::Failed(_) => styles.error,
            _ => styles.text,
        };
        lines.push(Line::from(vec![
            Span::styled(format!("  {}", pad_right(info.id, 14)), styles.muted),
            Span::styled(info.status.label().to_string(), style),
        ]));
    }

    let stats = model.bus.stats();
    lines.push(Line::from(""));
    lines.push(section("Event bus"));
    lines.push(row("published", stats.published.to_string()));
    lines.push(row("dropped", stats.dropped.to_string()));
    lines.push(row("subscribers", stats.subscribers.to_string()));

    let paragraph = Paragraph::new(lines)
        .scroll((scroll, 0))
        .block(modal_block(ModalKind::Diagnostics.title(), styles));
    frame.render_widget(paragraph, popup);
}

fn render_quit_confirm(frame: &mut Frame, area: Rect, styles: &Styles) {
    let popup = centered_rect(36, 20, area);
    frame.render_widget(Clear, popup);
    let lines = vec![
        Line::styled("Quit sidecar?", styles.title),
        Line::from(""),
        Line::from(vec![
            Span::styled("y", styles.key_hint),
            Span::styled(" quit   ", styles.muted),
            Span::styled("n", styles.key_hint),
            Span::styled(" stay", styles.muted),
        ]),
    ];
    let paragraph = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .block(modal_block(ModalKind::QuitConfirm.title(), styles));
    frame.render_widget(paragraph, popup);
}

fn render_project_switcher(
    frame: &mut Frame,
    area: Rect,
    model: &AppModel,
    switcher: &ProjectSwitcherModal,
    focused: bool,
) {
    let styles = model.styles.as_ref();
    let popup = centered_rect(60, 50, area);
    frame.render_widget(Clear, popup);
    let block = modal_block(ModalKind::ProjectSwitcher.title(), styles);
    let inner = block.inner(popup);
    frame.render_widget(block, popup);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(inner);
    frame.render_widget(
        Paragraph::new(filter_line(&switcher.list.filter.text, styles)),
        chunks[0],
    );
    if focused {
        frame.set_cursor_position((
            chunks[0].x + 2 + switcher.list.filter.cursor_width(),
            chunks[0].y,
        ));
    }

    if model.config.projects.list.is_empty() {
        frame.render_widget(
            Paragraph::new("No projects configured. Add them under projects.list in config.json.")
                .style(styles.dim)
                .wrap(Wrap { trim: false }),
            chunks[1],
        );
    } else {
        let entries = model.project_entries();
        let width = chunks[1].width as usize;
        let items: Vec<ListItem> = entries
            .iter()
            .map(|project| {
                let path = project.resolved_path();
                let current = path == model.project_root;
                let marker = if current { "● " } else { "  " };
                let name = pad_right(&project.name, 18);
                let room = width.saturating_sub(UnicodeWidthStr::width(name.as_str()) + 4);
                ListItem::new(Line::from(vec![
                    Span::styled(marker, styles.success),
                    Span::styled(name, styles.text),
                    Span::styled(truncate_middle(&display_path(&path), room), styles.dim),
                ]))
            })
            .collect();
        let mut state = ListState::default();
        if !entries.is_empty() {
            state.select(Some(switcher.list.selected.min(entries.len() - 1)));
        }
        frame.render_stateful_widget(
            List::new(items).highlight_style(styles.selected),
            chunks[1],
            &mut state,
        );
    }

    if let Some(error) = &switcher.error {
        frame.render_widget(Paragraph::new(error.as_str()).style(styles.error), chunks[2]);
    }
}

fn render_worktree_switcher(
    frame: &mut Frame,
    area: Rect,
    model: &AppModel,
    switcher: &WorktreeSwitcherModal,
) {
    let styles = model.styles.as_ref();
    let popup = centered_rect(60, 50, area);
    frame.render_widget(Clear, popup);
    let block = modal_block(ModalKind::WorktreeSwitcher.title(), styles);
    let inner = block.inner(popup);
    frame.render_widget(block, popup);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(inner);

    if switcher.loading {
        frame.render_widget(Paragraph::new("Loading worktrees…").style(styles.dim), chunks[0]);
    } else {
        let items: Vec<ListItem> = switcher
            .worktrees
            .iter()
            .map(|worktree| {
                let marker = if worktree.path == model.workdir {
                    "● "
                } else {
                    "  "
                };
                let mut spans = vec![
                    Span::styled(marker, styles.success),
                    Span::styled(worktree.label(), styles.text),
                ];
                if worktree.is_main {
                    spans.push(Span::styled("  main", styles.dim));
                }
                ListItem::new(Line::from(spans))
            })
            .collect();
        let mut state = ListState::default();
        if !switcher.worktrees.is_empty() {
            state.select(Some(switcher.selected.min(switcher.worktrees.len() - 1)));
        }
        frame.render_stateful_widget(
            List::new(items).highlight_style(styles.selected),
            chunks[0],
            &mut state,
        );
    }

    if let Some(error) = &switcher.error {
        frame.render_widget(Paragraph::new(error.as_str()).style(styles.error), chunks[1]);
    }
}

fn render_theme_switcher(
    frame: &mut Frame,
    area: Rect,
    styles: &Styles,
    switcher: &ThemeSwitcherModal,
) {
    let popup = centered_rect(40, 50, area);
    frame.render_widget(Clear, popup);
    let block = modal_block(ModalKind::ThemeSwitcher.title(), styles);
    let inner = block.inner(popup);
    frame.render_widget(block, popup);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(inner);

    let original = switcher.original.display_name();
    let items: Vec<ListItem> = switcher
        .names
        .iter()
        .map(|name| {
            let mut spans = vec![Span::styled(name.clone(), styles.text)];
            if theme::is_community(name) {
                spans.push(Span::styled("  community", styles.dim));
            }
            if name == original {
                spans.push(Span::styled("  current", styles.success));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let mut state = ListState::default();
    state.select(Some(switcher.selected));
    frame.render_stateful_widget(
        List::new(items)
            .highlight_style(styles.selected)
            .highlight_symbol("▸ "),
        chunks[0],
        &mut state,
    );

    let scope = match switcher.scope {
        ThemeScope::Global => "global",
        ThemeScope::Project => "this project",
    };
    frame.render_widget(
        Paragraph::new(Line::from(vec![
            Span::styled("save to ", styles.muted),
            Span::styled(scope, styles.text),
            Span::styled("  (tab)", styles.dim),
        ])),
        chunks[1],
    );
    if let Some(error) = &switcher.error {
        frame.render_widget(Paragraph::new(error.as_str()).style(styles.error), chunks[2]);
    }
}

fn render_issue_input(
    frame: &mut Frame,
    area: Rect,
    styles: &Styles,
    input: &IssueInputModal,
    focused: bool,
) {
    let popup = centered_rect(44, 24, area);
    frame.render_widget(Clear, popup);
    let block = modal_block(ModalKind::IssueInput.title(), styles);
    let inner = block.inner(popup);
    frame.render_widget(block, popup);

    let mut lines = vec![filter_line(&input.input.text, styles), Line::from("")];
    if input.pending {
        lines.push(Line::styled("looking up…", styles.dim));
    } else if let Some(error) = &input.error {
        lines.push(Line::styled(error.as_str(), styles.error));
    } else {
        lines.push(Line::styled("enter to open · esc to cancel", styles.dim));
    }
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
    if focused {
        frame.set_cursor_position((inner.x + 2 + input.input.cursor_width(), inner.y));
    }
}

fn render_issue_preview(
    frame: &mut Frame,
    area: Rect,
    styles: &Styles,
    preview: &IssuePreviewModal,
) {
    let popup = centered_rect(70, 70, area);
    frame.render_widget(Clear, popup);
    let issue = &preview.issue;

    let mut meta = vec![Span::styled(issue.id.clone(), styles.key_hint)];
    for value in [&issue.status, &issue.priority, &issue.issue_type] {
        if !value.is_empty() {
            meta.push(Span::styled(format!("  {value}"), styles.muted));
        }
    }
    let mut lines = vec![
        Line::styled(issue.title.clone(), styles.title),
        Line::from(meta),
    ];
    if !issue.labels.is_empty() {
        lines.push(Line::styled(issue.labels.join(", "), styles.dim));
    }
    lines.push(Line::from(""));
    for line in issue.description.lines() {
        lines.push(Line::styled(line.to_string(), styles.text));
    }

    let paragraph = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((preview.scroll, 0))
        .block(modal_block(ModalKind::IssuePreview.title(), styles));
    frame.render_widget(paragraph, popup);
}

pub(crate) fn pad_right(text: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(text);
    if current >= width {
        return text.to_string();
    }
    format!("{text}{}", " ".repeat(width - current))
}

pub(crate) fn pad_left(text: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(text);
    if current >= width {
        return text.to_string();
    }
    format!("{}{text}", " ".repeat(width - current))
}

pub(crate) fn truncate_end(text: &str, max_width: usize) -> String {
    if max_width == 0 {
        return String::new();
    }
    if UnicodeWidthStr::width(text) <= max_width {
        return text.to_string();
    }
    let ellipsis = "…";
    let available = max_width.saturating_sub(UnicodeWidthStr::width(ellipsis));
    let mut out = take_prefix_width(text, available);
    out.push_str(ellipsis);
    out
}

fn truncate_middle(text: &str, max_width: usize) -> String {
    if max_width == 0 {
        return String::new();
    }
    if UnicodeWidthStr::width(text) <= max_width {
        return text.to_string();
    }

    let ellipsis = "…";
    let available = max_width.saturating_sub(UnicodeWidthStr::width(ellipsis));
    if available <= 4 {
        return truncate_end(text, max_width);
    }

    let left_width = available / 2;
    let right_width = available - left_width;

    let left = take_prefix_width(text, left_width);
    let right = take_suffix_width(text, right_width);

    format!("{left}{ellipsis}{right}")
}

fn take_prefix_width(text: &str, width: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let ch_width = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + ch_width > width {
            break;
        }
        used += ch_width;
        out.push(ch);
    }
    out
}

fn take_suffix_width(text: &str, width: usize) -> String {
    let mut out = Vec::new();
    let mut used = 0;
    for ch in text.chars().rev() {
        let ch_width = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + ch_width > width {
            break;
        }
        used += ch_width;
        out.push(ch);
    }
    out.into_iter().rev().collect()
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_display_width() {
        assert_eq!(truncate_end("sidecar", 10), "sidecar");
        assert_eq!(truncate_end("conversations", 6), "conve…");
        assert_eq!(truncate_end("日本語テキスト", 5), "日本…");
        assert_eq!(truncate_middle("/home/me/src/project", 11), "/home…oject");
    }

    #[test]
    fn padding_fills_to_width() {
        assert_eq!(pad_right("q", 3), "q  ");
        assert_eq!(pad_left("3m", 4), "  3m");
        assert_eq!(pad_right("toolong", 3), "toolong");
    }
}
