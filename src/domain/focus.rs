use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FocusContext {
    Global,
    Palette,
    Help,
    Diagnostics,
    QuitConfirm,
    ProjectSwitcher,
    WorktreeSwitcher,
    ThemeSwitcher,
    IssueInput,
    IssuePreview,
    GitStatus,
    GitCommit,
    FileBrowser,
    FileBrowserSearch,
    ConversationsSidebar,
    ConversationsMain,
    ConversationsSearch,
    WorkspaceList,
    WorkspaceInteractive,
    TdList,
    TdSearch,
    Notes,
    NotesEdit,
    /// Scopes introduced by plugins that the shell does not know about.
    Custom(String),
}

const NAMED: &[(FocusContext, &str)] = &[
    (FocusContext::Global, "global"),
    (FocusContext::Palette, "palette"),
    (FocusContext::Help, "help"),
    (FocusContext::Diagnostics, "diagnostics"),
    (FocusContext::QuitConfirm, "quit-confirm"),
    (FocusContext::ProjectSwitcher, "project-switcher"),
    (FocusContext::WorktreeSwitcher, "worktree-switcher"),
    (FocusContext::ThemeSwitcher, "theme-switcher"),
    (FocusContext::IssueInput, "issue-input"),
    (FocusContext::IssuePreview, "issue-preview"),
    (FocusContext::GitStatus, "git-status"),
    (FocusContext::GitCommit, "git-commit"),
    (FocusContext::FileBrowser, "file-browser"),
    (FocusContext::FileBrowserSearch, "file-browser-search"),
    (FocusContext::ConversationsSidebar, "conversations-sidebar"),
    (FocusContext::ConversationsMain, "conversations-main"),
    (FocusContext::ConversationsSearch, "conversations-search"),
    (FocusContext::WorkspaceList, "workspace-list"),
    (FocusContext::WorkspaceInteractive, "workspace-interactive"),
    (FocusContext::TdList, "td-list"),
    (FocusContext::TdSearch, "td-search"),
    (FocusContext::Notes, "notes"),
    (FocusContext::NotesEdit, "notes-edit"),
];

impl FocusContext {
    pub fn as_str(&self) -> &str {
        if let Self::Custom(name) = self {
            return name;
        }
        NAMED
            .iter()
            .find(|(context, _)| context == self)
            .map(|(_, name)| *name)
            .unwrap_or("global")
    }

    /// Whether `q` quits from this scope.
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            Self::Global
                | Self::GitStatus
                | Self::FileBrowser
                | Self::ConversationsSidebar
                | Self::ConversationsMain
                | Self::WorkspaceList
                | Self::TdList
                | Self::Notes
        )
    }

    /// Printable keys go straight to the focused plugin.
    pub fn is_text_input(&self) -> bool {
        match self {
            Self::GitCommit
            | Self::FileBrowserSearch
            | Self::ConversationsSearch
            | Self::WorkspaceInteractive
            | Self::TdSearch
            | Self::NotesEdit
            | Self::IssueInput => true,
            Self::Custom(name) => {
                name.ends_with("-search") || name.ends_with("-input") || name.ends_with("-edit")
            }
            _ => false,
        }
    }
}

impl FromStr for FocusContext {
    type Err = Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        Ok(NAMED
            .iter()
            .find(|(_, name)| *name == raw)
            .map(|(context, _)| context.clone())
            .unwrap_or_else(|| Self::Custom(raw.to_string())))
    }
}

impl fmt::Display for FocusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_and_unknown_contexts() {
        let known: FocusContext = "git-status".parse().expect("infallible");
        assert_eq!(known, FocusContext::GitStatus);
        assert!(known.is_root());

        let custom: FocusContext = "kanban-board".parse().expect("infallible");
        assert_eq!(custom, FocusContext::Custom("kanban-board".to_string()));
        assert_eq!(custom.to_string(), "kanban-board");
        assert!(!custom.is_text_input());
    }

    #[test]
    fn every_named_context_round_trips() {
        for (context, name) in NAMED {
            assert_eq!(context.as_str(), *name);
            assert_eq!(name.parse::<FocusContext>().ok().as_ref(), Some(context));
        }
    }

    #[test]
    fn text_input_scopes_are_not_roots() {
        for (context, _) in NAMED {
            assert!(!(context.is_text_input() && context.is_root()), "{context}");
        }
        assert!(FocusContext::ConversationsSearch.is_text_input());
        assert!(FocusContext::WorkspaceInteractive.is_text_input());
        assert!("board-search".parse::<FocusContext>().is_ok_and(|c| c.is_text_input()));
    }
}
