use super::AdapterError;
use crate::domain::{Message, Role};
use regex::{Regex, RegexBuilder};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SearchOptions {
    pub case_sensitive: bool,
    pub use_regex: bool,
    /// Zero means unlimited.
    pub max_matches_per_message: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineMatch {
    /// 1-based.
    pub line_no: usize,
    pub line_text: String,
    /// Byte offsets into `line_text`.
    pub col_start: usize,
    pub col_end: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageMatch {
    pub message_id: String,
    pub message_idx: usize,
    pub role: Role,
    pub timestamp: OffsetDateTime,
    pub matches: Vec<LineMatch>,
}

pub(crate) fn compile_query(query: &str, options: &SearchOptions) -> Result<Regex, AdapterError> {
    let pattern = if options.use_regex {
        query.to_string()
    } else {
        regex::escape(query)
    };
    Ok(RegexBuilder::new(&pattern)
        .case_insensitive(!options.case_sensitive)
        .build()?)
}

/// Line-by-line search over each message's searchable text.
pub fn search_messages_in(
    messages: &[Message],
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<MessageMatch>, AdapterError> {
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let pattern = compile_query(query, options)?;
    let limit = match options.max_matches_per_message {
        0 => usize::MAX,
        n => n,
    };

    let mut found = Vec::new();
    for (idx, message) in messages.iter().enumerate() {
        let text = message.searchable_text();
        let mut matches = Vec::new();
        'lines: for (line_idx, line) in text.lines().enumerate() {
            for hit in pattern.find_iter(line) {
                if hit.start() == hit.end() {
                    continue;
                }
                matches.push(LineMatch {
                    line_no: line_idx + 1,
                    line_text: line.to_string(),
                    col_start: hit.start(),
                    col_end: hit.end(),
                });
                if matches.len() >= limit {
                    break 'lines;
                }
            }
        }
        if !matches.is_empty() {
            found.push(MessageMatch {
                message_id: message.id.clone(),
                message_idx: idx,
                role: message.role,
                timestamp: message.timestamp,
                matches,
            });
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ToolUse;
    use time::macros::datetime;

    fn messages() -> Vec<Message> {
        let ts = datetime!(2026-02-19 00:00 UTC);
        let mut first = Message::new("m1", Role::User, ts);
        first.content = "Fix the Parser\nthen run parser tests".to_string();
        let mut second = Message::new("m2", Role::Assistant, ts);
        second.content = "done".to_string();
        second.tool_uses.push(ToolUse {
            id: "t".to_string(),
            name: "Bash".to_string(),
            input: r#"{"cmd":"cargo test parser"}"#.to_string(),
            output: String::new(),
        });
        vec![first, second]
    }

    #[test]
    fn literal_search_is_case_insensitive_by_default() {
        let found = search_messages_in(&messages(), "parser", &SearchOptions::default()).expect("search");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].matches.len(), 2);
        assert_eq!(found[0].matches[0].line_no, 1);
        assert_eq!(found[0].matches[0].col_start, 8);
        assert_eq!(found[0].matches[0].col_end, 14);
        assert_eq!(found[1].message_idx, 1);
    }

    #[test]
    fn honors_case_regex_and_per_message_cap() {
        let case = SearchOptions {
            case_sensitive: true,
            ..SearchOptions::default()
        };
        let found = search_messages_in(&messages(), "Parser", &case).expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].matches.len(), 1);

        let regex = SearchOptions {
            use_regex: true,
            max_matches_per_message: 1,
            ..SearchOptions::default()
        };
        let found = search_messages_in(&messages(), r"pars\w+", &regex).expect("search");
        assert!(found.iter().all(|m| m.matches.len() == 1));

        let literal = search_messages_in(&messages(), "(", &SearchOptions::default()).expect("escaped");
        assert!(literal.is_empty());
        assert!(matches!(
            search_messages_in(&messages(), "(", &SearchOptions { use_regex: true, ..SearchOptions::default() }),
            Err(AdapterError::InvalidQuery(_))
        ));
    }
}
