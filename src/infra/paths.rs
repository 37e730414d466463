use std::env;
use std::path::{Component, Path, PathBuf};

/// Absolute, symlink-resolved, cleaned form of `path`. Falls back to the lexical absolute path when
/// canonicalization fails. `None` for empty input.
pub fn resolve(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    let expanded = expand_home(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        env::current_dir().ok()?.join(expanded)
    };
    let cleaned = clean(&absolute);
    if let Ok(canonical) = std::fs::canonicalize(&cleaned) {
        return Some(canonical);
    }
    Some(canonicalize_existing_prefix(&cleaned))
}

// Canonicalizes the deepest existing ancestor and re-appends the rest lexically.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut tail = Vec::new();
    let mut current = path.to_path_buf();
    while let Some(name) = current.file_name().map(|n| n.to_os_string()) {
        tail.push(name);
        if !current.pop() {
            break;
        }
        if let Ok(mut base) = std::fs::canonicalize(&current) {
            for part in tail.iter().rev() {
                base.push(part);
            }
            return base;
        }
    }
    path.to_path_buf()
}

/// True when `candidate` is `root` or lies beneath it.
pub fn is_under(root: &Path, candidate: &Path) -> bool {
    let (Some(root), Some(candidate)) = (resolve(root), resolve(candidate)) else {
        return false;
    };
    if root == candidate {
        return true;
    }
    match relative_to(&root, &candidate) {
        Some(rel) => !matches!(rel.components().next(), Some(Component::ParentDir)),
        None => false,
    }
}

pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Lexical cleanup: drops `.` and folds `..` into its parent.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn relative_to(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let root_parts = root.components().collect::<Vec<_>>();
    let candidate_parts = candidate.components().collect::<Vec<_>>();
    if root_parts.first() != candidate_parts.first() {
        return None;
    }
    let common = root_parts
        .iter()
        .zip(candidate_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut rel = PathBuf::new();
    for _ in common..root_parts.len() {
        rel.push("..");
    }
    for part in &candidate_parts[common..] {
        rel.push(part.as_os_str());
    }
    Some(rel)
}

pub fn display_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(rest) = path.strip_prefix(&home) {
            if rest.as_os_str().is_empty() {
                return "~".to_string();
            }
            return format!("~/{}", rest.display());
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn path_is_under_itself_and_its_descendants() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("src")).expect("mkdir");

        assert!(is_under(&root, &root));
        assert!(is_under(&root, &root.join("src")));
        assert!(is_under(&root, &root.join("src").join("not-created-yet")));
        assert!(!is_under(&root, &root.join("..")));
        assert!(!is_under(&root, &dir.path().join("project-sibling")));
    }

    #[test]
    fn empty_inputs_are_never_under() {
        assert!(!is_under(Path::new(""), Path::new("/tmp")));
        assert!(!is_under(Path::new("/tmp"), Path::new("")));
        assert_eq!(resolve(Path::new("")), None);
    }

    #[cfg(unix)]
    #[test]
    fn resolves_symlinks_and_tolerates_broken_ones() {
        let dir = tempdir().expect("tempdir");
        let real = dir.path().join("real");
        std::fs::create_dir_all(&real).expect("mkdir");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let resolved_real = resolve(&real).expect("resolve");
        assert_eq!(resolve(&link), Some(resolved_real.clone()));
        assert!(is_under(&link, &real.join("x")));

        let broken = dir.path().join("broken");
        std::os::unix::fs::symlink(dir.path().join("gone"), &broken).expect("symlink");
        let lexical = resolve(&broken).expect("lexical fallback");
        assert!(lexical.ends_with("broken"));
    }

    #[test]
    fn cleans_dot_segments() {
        assert_eq!(clean(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(clean(Path::new("a/../..")), PathBuf::from(".."));
    }
}
