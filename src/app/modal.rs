use crate::app::LineEditor;
use crate::domain::{FocusContext, Issue, Worktree};
use crate::infra::ThemeConfig;
use std::path::PathBuf;

/// Declaration order is priority order: the first variant wins input.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ModalKind {
    Palette,
    Help,
    Update,
    Diagnostics,
    QuitConfirm,
    ProjectSwitcher,
    WorktreeSwitcher,
    ThemeSwitcher,
    IssueInput,
    IssuePreview,
}

pub const ALL_MODAL_KINDS: [ModalKind; 10] = [
    ModalKind::Palette,
    ModalKind::Help,
    ModalKind::Update,
    ModalKind::Diagnostics,
    ModalKind::QuitConfirm,
    ModalKind::ProjectSwitcher,
    ModalKind::WorktreeSwitcher,
    ModalKind::ThemeSwitcher,
    ModalKind::IssueInput,
    ModalKind::IssuePreview,
];

impl ModalKind {
    pub fn focus_context(self) -> FocusContext {
        match self {
            Self::Palette => FocusContext::Palette,
            Self::Help | Self::Update => FocusContext::Help,
            Self::Diagnostics => FocusContext::Diagnostics,
            Self::QuitConfirm => FocusContext::QuitConfirm,
            Self::ProjectSwitcher => FocusContext::ProjectSwitcher,
            Self::WorktreeSwitcher => FocusContext::WorktreeSwitcher,
            Self::ThemeSwitcher => FocusContext::ThemeSwitcher,
            Self::IssueInput => FocusContext::IssueInput,
            Self::IssuePreview => FocusContext::IssuePreview,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Palette => "Commands",
            Self::Help => "Help",
            Self::Update => "What's new",
            Self::Diagnostics => "Diagnostics",
            Self::QuitConfirm => "Quit",
            Self::ProjectSwitcher => "Projects",
            Self::WorktreeSwitcher => "Worktrees",
            Self::ThemeSwitcher => "Themes",
            Self::IssueInput => "Open issue",
            Self::IssuePreview => "Issue",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FilteredList {
    pub filter: LineEditor,
    pub selected: usize,
}

impl FilteredList {
    /// Indices of `items` whose label contains the filter, case-insensitively.
    pub fn visible<'a, T>(&self, items: &'a [T], label: impl Fn(&T) -> &str) -> Vec<(usize, &'a T)> {
        let needle = self.filter.text.to_lowercase();
        items
            .iter()
            .enumerate()
            .filter(|(_, item)| needle.is_empty() || label(item).to_lowercase().contains(&needle))
            .collect()
    }

    pub fn move_by(&mut self, delta: isize, len: usize) {
        self.selected = step(self.selected, delta, len);
    }

    pub fn clamp(&mut self, len: usize) {
        self.selected = self.selected.min(len.saturating_sub(1));
    }
}

/// Moves a list cursor by `delta`, saturating at both ends.
pub fn step(selected: usize, delta: isize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    selected.saturating_add_signed(delta).min(len - 1)
}

#[derive(Clone, Debug)]
pub struct PaletteModal {
    pub list: FilteredList,
    /// The scope the palette was opened from.
    pub context: FocusContext,
}

#[derive(Clone, Debug)]
pub struct UpdateModal {
    pub version: String,
    pub previous: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ProjectSwitcherModal {
    pub list: FilteredList,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct WorktreeSwitcherModal {
    pub worktrees: Vec<Worktree>,
    pub selected: usize,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThemeScope {
    Global,
    Project,
}

#[derive(Clone, Debug)]
pub struct ThemeSwitcherModal {
    pub names: Vec<String>,
    pub selected: usize,
    /// Restored on cancel.
    pub original: ThemeConfig,
    pub scope: ThemeScope,
    pub project_root: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct IssueInputModal {
    pub input: LineEditor,
    pub pending: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IssuePreviewModal {
    pub issue: Issue,
    pub scroll: u16,
}

#[derive(Clone, Debug)]
pub enum Modal {
    Palette(PaletteModal),
    Help { scroll: u16 },
    Update(UpdateModal),
    Diagnostics { scroll: u16 },
    QuitConfirm,
    ProjectSwitcher(ProjectSwitcherModal),
    WorktreeSwitcher(WorktreeSwitcherModal),
    ThemeSwitcher(ThemeSwitcherModal),
    IssueInput(IssueInputModal),
    IssuePreview(IssuePreviewModal),
}

impl Modal {
    pub fn kind(&self) -> ModalKind {
        match self {
            Self::Palette(_) => ModalKind::Palette,
            Self::Help { .. } => ModalKind::Help,
            Self::Update(_) => ModalKind::Update,
            Self::Diagnostics { .. } => ModalKind::Diagnostics,
            Self::QuitConfirm => ModalKind::QuitConfirm,
            Self::ProjectSwitcher(_) => ModalKind::ProjectSwitcher,
            Self::WorktreeSwitcher(_) => ModalKind::WorktreeSwitcher,
            Self::ThemeSwitcher(_) => ModalKind::ThemeSwitcher,
            Self::IssueInput(_) => ModalKind::IssueInput,
            Self::IssuePreview(_) => ModalKind::IssuePreview,
        }
    }

    /// Modals with a filter clear it on the first `esc` instead of closing.
    pub fn clear_filter(&mut self) -> bool {
        let filter = match self {
            Self::Palette(palette) => &mut palette.list,
            Self::ProjectSwitcher(switcher) => &mut switcher.list,
            _ => return false,
        };
        if filter.filter.text.is_empty() {
            return false;
        }
        filter.filter = LineEditor::new();
        filter.selected = 0;
        true
    }
}

/// Open modals, at most one per kind, kept in priority order.
#[derive(Clone, Debug, Default)]
pub struct ModalStack {
    open: Vec<Modal>,
}

impl ModalStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an open modal of the same kind.
    pub fn open(&mut self, modal: Modal) {
        let kind = modal.kind();
        match self.open.binary_search_by_key(&kind, Modal::kind) {
            Ok(idx) => self.open[idx] = modal,
            Err(idx) => self.open.insert(idx, modal),
        }
    }

    pub fn close(&mut self, kind: ModalKind) -> Option<Modal> {
        let idx = self.open.iter().position(|modal| modal.kind() == kind)?;
        Some(self.open.remove(idx))
    }

    pub fn close_top(&mut self) -> Option<Modal> {
        (!self.open.is_empty()).then(|| self.open.remove(0))
    }

    pub fn toggle(&mut self, modal: Modal) {
        if self.close(modal.kind()).is_none() {
            self.open(modal);
        }
    }

    /// The modal that receives input.
    pub fn top(&self) -> Option<&Modal> {
        self.open.first()
    }

    pub fn top_mut(&mut self) -> Option<&mut Modal> {
        self.open.first_mut()
    }

    pub fn top_kind(&self) -> Option<ModalKind> {
        self.top().map(Modal::kind)
    }

    pub fn get(&self, kind: ModalKind) -> Option<&Modal> {
        self.open.iter().find(|modal| modal.kind() == kind)
    }

    pub fn get_mut(&mut self, kind: ModalKind) -> Option<&mut Modal> {
        self.open.iter_mut().find(|modal| modal.kind() == kind)
    }

    pub fn is_open(&self, kind: ModalKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Lowest priority first, the order they are painted in.
    pub fn paint_order(&self) -> impl Iterator<Item = &Modal> {
        self.open.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: ModalKind) -> Modal {
        match kind {
            ModalKind::Palette => Modal::Palette(PaletteModal {
                list: FilteredList::default(),
                context: FocusContext::Global,
            }),
            ModalKind::Help => Modal::Help { scroll: 0 },
            ModalKind::Update => Modal::Update(UpdateModal {
                version: "0.1.0".to_string(),
                previous: None,
            }),
            ModalKind::Diagnostics => Modal::Diagnostics { scroll: 0 },
            ModalKind::QuitConfirm => Modal::QuitConfirm,
            ModalKind::ProjectSwitcher => Modal::ProjectSwitcher(ProjectSwitcherModal::default()),
            ModalKind::WorktreeSwitcher => {
                Modal::WorktreeSwitcher(WorktreeSwitcherModal::default())
            }
            ModalKind::ThemeSwitcher => Modal::ThemeSwitcher(ThemeSwitcherModal {
                names: Vec::new(),
                selected: 0,
                original: ThemeConfig::default(),
                scope: ThemeScope::Global,
                project_root: None,
                error: None,
            }),
            ModalKind::IssueInput => Modal::IssueInput(IssueInputModal::default()),
            ModalKind::IssuePreview => Modal::IssuePreview(IssuePreviewModal {
                issue: Issue::default(),
                scroll: 0,
            }),
        }
    }

    #[test]
    fn higher_priority_modal_is_always_on_top() {
        for (i, a) in ALL_MODAL_KINDS.iter().enumerate() {
            for b in &ALL_MODAL_KINDS[i + 1..] {
                for order in [[*a, *b], [*b, *a]] {
                    let mut stack = ModalStack::new();
                    for kind in order {
                        stack.open(sample(kind));
                    }
                    assert_eq!(stack.top_kind(), Some(*a), "{a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn reopening_replaces_and_closing_reveals_next() {
        let mut stack = ModalStack::new();
        stack.open(sample(ModalKind::IssueInput));
        stack.open(sample(ModalKind::Help));
        stack.open(Modal::Help { scroll: 4 });
        assert!(matches!(stack.top(), Some(Modal::Help { scroll: 4 })));

        stack.close_top();
        assert_eq!(stack.top_kind(), Some(ModalKind::IssueInput));
        stack.toggle(sample(ModalKind::IssueInput));
        assert!(stack.is_empty());
    }

    #[test]
    fn esc_clears_filter_before_closing() {
        let mut modal = sample(ModalKind::ProjectSwitcher);
        if let Modal::ProjectSwitcher(switcher) = &mut modal {
            switcher.list.filter.insert_str("api");
        }
        assert!(modal.clear_filter());
        assert!(!modal.clear_filter());
    }

    #[test]
    fn list_cursor_saturates() {
        assert_eq!(step(0, -1, 3), 0);
        assert_eq!(step(1, 5, 3), 2);
        assert_eq!(step(4, 0, 0), 0);
    }
}
