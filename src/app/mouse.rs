use super::{AppCommand, AppModel, HEADER_HEIGHT, Modal, PluginMsg};
use crate::ui::{APP_TITLE, tab_label};
use crossterm::event::{MouseButton, MouseEvent, MouseEventKind};
use unicode_width::UnicodeWidthStr;

const SCROLL_STEP: u16 = 3;

pub(super) fn update_on_mouse(model: AppModel, mouse: MouseEvent) -> (AppModel, AppCommand) {
    let mut model = model;
    if model.size.0 == 0 || model.size.1 == 0 {
        return (model, AppCommand::None);
    }

    if let Some(modal) = model.modals.top_mut() {
        let scroll = match modal {
            Modal::Help { scroll } | Modal::Diagnostics { scroll } => Some(scroll),
            Modal::IssuePreview(preview) => Some(&mut preview.scroll),
            _ => None,
        };
        if let Some(scroll) = scroll {
            match mouse.kind {
                MouseEventKind::ScrollUp => *scroll = scroll.saturating_sub(SCROLL_STEP),
                MouseEventKind::ScrollDown => *scroll = scroll.saturating_add(SCROLL_STEP),
                _ => {}
            }
        }
        return (model, AppCommand::None);
    }

    if mouse.row < HEADER_HEIGHT {
        if mouse.kind == MouseEventKind::Down(MouseButton::Left) {
            if let Some(idx) = hit_test_tabs(&model, mouse.column) {
                model.plugins.focus_nth(idx);
            }
        }
        return (model, AppCommand::None);
    }

    // Plugins see rows relative to their own area.
    let local = MouseEvent {
        row: mouse.row - HEADER_HEIGHT,
        ..mouse
    };
    let tasks = model.plugins.send_focused(PluginMsg::Mouse(local));
    let command = model.after_plugin(tasks);
    (model, command)
}

fn hit_test_tabs(model: &AppModel, col: u16) -> Option<usize> {
    let col = col as usize;
    let mut x_offset = UnicodeWidthStr::width(APP_TITLE);
    for (idx, info) in model.plugins.visible().iter().enumerate() {
        let label = tab_label(info);
        let width = UnicodeWidthStr::width(label.as_str());
        if col >= x_offset && col < x_offset.saturating_add(width) {
            return Some(idx);
        }
        x_offset = x_offset.saturating_add(width).saturating_add(1);
    }
    None
}
