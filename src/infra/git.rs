use crate::domain::{Worktree, main_worktree, parse_worktree_porcelain};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git is not installed")]
    NotInstalled,

    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },

    #[error("failed to run git: {0}")]
    Io(#[from] io::Error),
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => GitError::NotInstalled,
            _ => GitError::Io(error),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not a git repository") {
            return Err(GitError::NotARepo(cwd.to_path_buf()));
        }
        return Err(GitError::Failed {
            args: args.join(" "),
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn list_worktrees(repo_dir: &Path) -> Result<Vec<Worktree>, GitError> {
    if !repo_dir.is_dir() {
        return Err(GitError::NotARepo(repo_dir.to_path_buf()));
    }
    let output = run_git(repo_dir, &["worktree", "list", "--porcelain"])?;
    Ok(parse_worktree_porcelain(&output))
}

/// Path of the main worktree, which keys per-repo state.
pub fn main_worktree_path(repo_dir: &Path) -> Result<PathBuf, GitError> {
    let worktrees = list_worktrees(repo_dir)?;
    main_worktree(&worktrees)
        .map(|worktree| worktree.path.clone())
        .ok_or_else(|| GitError::NotARepo(repo_dir.to_path_buf()))
}

pub fn worktree_exists(path: &Path) -> bool {
    path.join(".git").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    #[test]
    fn non_repo_directory_is_reported() {
        if !git_available() {
            return;
        }
        let dir = tempdir().expect("tempdir");
        let err = list_worktrees(dir.path()).expect_err("not a repo");
        assert!(matches!(err, GitError::NotARepo(_) | GitError::Failed { .. }));
    }

    #[test]
    fn lists_the_main_worktree_of_a_fresh_repo() {
        if !git_available() {
            return;
        }
        let dir = tempdir().expect("tempdir");
        run_git(dir.path(), &["init", "-q"]).expect("init");
        let worktrees = list_worktrees(dir.path()).expect("list");
        assert_eq!(worktrees.len(), 1);
        assert!(worktrees[0].is_main);
        assert!(worktree_exists(dir.path()));
        assert!(!worktree_exists(&dir.path().join("gone")));
    }
}
