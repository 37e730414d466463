use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
    pub is_main: bool,
    pub bare: bool,
    pub detached: bool,
}

impl Worktree {
    pub fn label(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string());
        match (&self.branch, self.detached) {
            (Some(branch), _) => format!("{name} [{branch}]"),
            (None, true) => format!("{name} [detached]"),
            (None, false) => name,
        }
    }
}

/// Parses `git worktree list --porcelain`. Records are blank-line separated; the first one is the main worktree.
pub fn parse_worktree_porcelain(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut current: Option<Worktree> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(done) = current.take() {
                worktrees.push(done);
            }
            continue;
        }

        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        if key == "worktree" {
            if let Some(done) = current.take() {
                worktrees.push(done);
            }
            current = Some(Worktree {
                path: PathBuf::from(value),
                branch: None,
                head: None,
                is_main: worktrees.is_empty(),
                bare: false,
                detached: false,
            });
            continue;
        }

        let Some(worktree) = current.as_mut() else {
            continue;
        };
        match key {
            "HEAD" => worktree.head = Some(value.to_string()),
            "branch" => {
                let name = value.strip_prefix("refs/heads/").unwrap_or(value);
                worktree.branch = Some(name.to_string());
            }
            "bare" => worktree.bare = true,
            "detached" => worktree.detached = true,
            _ => {}
        }
    }

    if let Some(done) = current.take() {
        worktrees.push(done);
    }
    worktrees
}

pub fn main_worktree(worktrees: &[Worktree]) -> Option<&Worktree> {
    worktrees.iter().find(|worktree| worktree.is_main)
}

pub fn find_worktree<'a>(worktrees: &'a [Worktree], path: &Path) -> Option<&'a Worktree> {
    worktrees.iter().find(|worktree| worktree.path == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORCELAIN: &str = "worktree /repo\nHEAD 1111111111111111111111111111111111111111\nbranch refs/heads/main\n\nworktree /repo-feature\nHEAD 2222222222222222222222222222222222222222\nbranch refs/heads/feature/x\n\nworktree /repo-detached\nHEAD 3333333333333333333333333333333333333333\ndetached\n";

    #[test]
    fn parses_porcelain_records() {
        let worktrees = parse_worktree_porcelain(PORCELAIN);
        assert_eq!(worktrees.len(), 3);

        assert!(worktrees[0].is_main);
        assert_eq!(worktrees[0].path, PathBuf::from("/repo"));
        assert_eq!(worktrees[0].branch.as_deref(), Some("main"));

        assert!(!worktrees[1].is_main);
        assert_eq!(worktrees[1].branch.as_deref(), Some("feature/x"));

        assert!(worktrees[2].detached);
        assert_eq!(worktrees[2].branch, None);
        assert_eq!(worktrees[2].label(), "repo-detached [detached]");
    }

    #[test]
    fn handles_bare_main_and_missing_trailing_blank_line() {
        let worktrees = parse_worktree_porcelain("worktree /srv/repo.git\nbare\n\nworktree /work\nHEAD abc\nbranch refs/heads/dev");
        assert_eq!(worktrees.len(), 2);
        assert!(worktrees[0].bare);
        assert_eq!(main_worktree(&worktrees).map(|w| w.path.clone()), Some(PathBuf::from("/srv/repo.git")));
        assert!(find_worktree(&worktrees, Path::new("/work")).is_some());
    }
}
