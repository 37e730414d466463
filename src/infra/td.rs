use crate::domain::{Issue, parse_issue_json};
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("td is not installed")]
    NotInstalled,

    #[error("issue id is empty")]
    EmptyId,

    #[error("td show {id} failed: {message}")]
    Failed { id: String, message: String },

    #[error("td returned unreadable json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to run td: {0}")]
    Io(#[source] io::Error),
}

/// `td show <id> -f json`, run in the project directory.
pub fn show_issue(workdir: &Path, id: &str) -> Result<Issue, IssueError> {
    show_issue_with(Path::new("td"), workdir, id)
}

pub fn show_issue_with(program: &Path, workdir: &Path, id: &str) -> Result<Issue, IssueError> {
    if id.trim().is_empty() {
        return Err(IssueError::EmptyId);
    }
    let output = Command::new(program)
        .args(["show", id, "-f", "json"])
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => IssueError::NotInstalled,
            _ => IssueError::Io(error),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exit status {}", output.status)
        } else {
            stderr
        };
        return Err(IssueError::Failed {
            id: id.to_string(),
            message,
        });
    }
    Ok(parse_issue_json(&String::from_utf8_lossy(&output.stdout))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_binary_is_not_installed() {
        let dir = tempdir().expect("tempdir");
        let err = show_issue_with(&dir.path().join("no-such-td"), dir.path(), "td-1")
            .expect_err("missing");
        assert!(matches!(err, IssueError::NotInstalled));
    }

    #[test]
    fn empty_id_is_rejected_before_spawning() {
        let dir = tempdir().expect("tempdir");
        assert!(matches!(
            show_issue(dir.path(), "  "),
            Err(IssueError::EmptyId)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn parses_output_of_a_stub_td() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().expect("tempdir");
        let script = dir.path().join("td");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"id\":\"'\"$2\"'\",\"title\":\"Stub\",\"status\":\"open\"}'\n",
        )
        .expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let issue = show_issue_with(&script, dir.path(), "td-9").expect("issue");
        assert_eq!(issue.id, "td-9");
        assert_eq!(issue.title, "Stub");
    }
}
