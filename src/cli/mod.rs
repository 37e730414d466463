use std::path::PathBuf;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Tui { project_dir: Option<PathBuf> },
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

/// `args[0]` is the program name and is skipped.
pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if args.iter().skip(1).any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if args.iter().skip(1).any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut project_dir: Option<PathBuf> = None;
    let mut positional_only = false;
    for arg in args.iter().skip(1) {
        if !positional_only && arg == "--" {
            positional_only = true;
            continue;
        }
        if !positional_only && arg.starts_with('-') && arg != "-" {
            return Err(CliParseError::UnknownFlag(arg.clone()));
        }
        if project_dir.is_some() {
            return Err(CliParseError::UnexpectedArgument(arg.clone()));
        }
        project_dir = Some(PathBuf::from(arg));
    }

    Ok(CliInvocation::Tui { project_dir })
}

pub fn help_text() -> String {
    format!(
        "{name} {version} - a terminal dashboard for coding-agent sessions\n\n\
USAGE:\n  {name} [PROJECT_DIR]    Open the dashboard for PROJECT_DIR (default: current directory)\n  {name} --help | --version\n\n\
ENV:\n  SIDECAR_CONFIG_DIR    Override the config directory (default: ~/.config/sidecar)\n  SIDECAR_LOG           Log filter, e.g. \"sidecar=debug\" (logs go to sidecar.log in the config directory)\n  EDITOR                Editor used to open the config file (default: vi)\n",
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn parse_defaults_to_tui_in_current_directory() {
        let parsed = parse_invocation(&args(&["sidecar"])).expect("parse");
        assert_eq!(parsed, CliInvocation::Tui { project_dir: None });
    }

    #[test]
    fn parse_takes_project_dir_positionally() {
        let parsed = parse_invocation(&args(&["sidecar", "../repo"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Tui {
                project_dir: Some(PathBuf::from("../repo"))
            }
        );
    }

    #[test]
    fn parse_help_flag_wins() {
        let parsed = parse_invocation(&args(&["sidecar", "repo", "--version", "-h"])).expect("parse");
        assert_eq!(parsed, CliInvocation::PrintHelp);
    }

    #[test]
    fn parse_version_flag() {
        let parsed = parse_invocation(&args(&["sidecar", "-V"])).expect("parse");
        assert_eq!(parsed, CliInvocation::PrintVersion);
    }

    #[test]
    fn parse_rejects_unknown_flags() {
        let err = parse_invocation(&args(&["sidecar", "--engine"])).expect_err("flag");
        assert!(matches!(err, CliParseError::UnknownFlag(flag) if flag == "--engine"));
    }

    #[test]
    fn parse_rejects_a_second_directory() {
        let err = parse_invocation(&args(&["sidecar", "a", "b"])).expect_err("extra");
        assert!(matches!(err, CliParseError::UnexpectedArgument(arg) if arg == "b"));
    }

    #[test]
    fn double_dash_allows_dash_prefixed_paths() {
        let parsed = parse_invocation(&args(&["sidecar", "--", "-odd"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Tui {
                project_dir: Some(PathBuf::from("-odd"))
            }
        );
    }

    #[test]
    fn help_mentions_config_override() {
        assert!(help_text().contains("SIDECAR_CONFIG_DIR"));
    }
}
