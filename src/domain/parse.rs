use serde_json::Value;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use time::format_description::well_known::Rfc3339;

pub const MAX_TITLE_CHARS: usize = 50;

/// First 8 characters of an ID.
pub fn short_id(value: &str) -> String {
    value.chars().take(8).collect()
}

pub fn truncate_title(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    if max_chars <= 3 {
        return collapsed.chars().take(max_chars).collect();
    }
    let mut out: String = collapsed.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

/// Injected harness prompts that should never become a session title.
pub fn is_metadata_prompt(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("# AGENTS.md instructions")
        || trimmed.starts_with("<environment_context>")
        || trimmed.starts_with("<INSTRUCTIONS>")
        || trimmed.starts_with("<command-name>")
        || trimmed.starts_with("<local-command-stdout>")
        || trimmed.starts_with("Caveat: The messages below")
        || (trimmed.starts_with("<skill>") && trimmed.contains("</skill>"))
}

pub fn derive_title_from_user_text(text: &str) -> Option<String> {
    if is_metadata_prompt(text) {
        return None;
    }
    let first_line = text
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())?;
    Some(truncate_title(first_line, MAX_TITLE_CHARS))
}

/// Session name from the first user text, falling back to the short ID.
pub fn session_name(first_user_text: Option<&str>, id: &str) -> String {
    first_user_text
        .and_then(derive_title_from_user_text)
        .unwrap_or_else(|| short_id(id))
}

pub fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339).ok()
}

pub fn unix_ms_to_datetime(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

/// SQLite `datetime()` text such as `2026-02-19 10:00:00.123456`, read as UTC.
pub fn parse_sqlite_datetime(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if let Some(parsed) = parse_rfc3339(value) {
        return Some(parsed);
    }
    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (value, None),
    };
    let whole = whole.replacen('T', " ", 1);
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let mut parsed = PrimitiveDateTime::parse(&whole, &format).ok()?.assume_utc();
    if let Some(fraction) = fraction {
        let digits: String = fraction.chars().take_while(char::is_ascii_digit).take(9).collect();
        if !digits.is_empty() {
            let nanos = format!("{digits:0<9}").parse::<i64>().ok()?;
            parsed += time::Duration::nanoseconds(nanos);
        }
    }
    Some(parsed)
}

/// Accepts RFC 3339 strings as well as unix seconds or milliseconds.
pub fn parse_timestamp_value(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(text) => parse_rfc3339(text).or_else(|| {
            text.trim()
                .parse::<i64>()
                .ok()
                .and_then(unix_number_to_datetime)
        }),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .and_then(unix_number_to_datetime),
        _ => None,
    }
}

fn unix_number_to_datetime(raw: i64) -> Option<OffsetDateTime> {
    // Anything past year 2286 in seconds is treated as milliseconds.
    if raw.abs() >= 10_000_000_000 {
        unix_ms_to_datetime(raw)
    } else {
        OffsetDateTime::from_unix_timestamp(raw).ok()
    }
}

/// Serializes a JSON value as opaque text; strings are kept verbatim.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn first_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn parses_sqlite_datetime_text() {
        assert_eq!(
            parse_sqlite_datetime("2026-02-19 10:00:00"),
            Some(datetime!(2026-02-19 10:00:00 UTC))
        );
        assert_eq!(
            parse_sqlite_datetime("2026-02-19 10:00:00.250"),
            Some(datetime!(2026-02-19 10:00:00.25 UTC))
        );
        assert_eq!(
            parse_sqlite_datetime("2026-02-19T10:00:00Z"),
            Some(datetime!(2026-02-19 10:00:00 UTC))
        );
        assert_eq!(parse_sqlite_datetime("yesterday"), None);
    }

    #[test]
    fn skips_metadata_prompts_when_titling() {
        assert_eq!(
            derive_title_from_user_text("<environment_context>\ncwd\n</environment_context>"),
            None
        );
        assert_eq!(
            derive_title_from_user_text("\n\n  fix the flaky test \nmore"),
            Some("fix the flaky test".to_string())
        );
    }

    #[test]
    fn session_name_falls_back_to_short_id() {
        assert_eq!(session_name(None, "0123456789abcdef"), "01234567");
        assert_eq!(session_name(Some("   "), "abc"), "abc");
    }

    #[test]
    fn truncates_long_titles_with_ellipsis() {
        let long = "word ".repeat(30);
        let title = truncate_title(&long, 20);
        assert_eq!(title.chars().count(), 20);
        assert!(title.ends_with("..."));
        assert_eq!(truncate_title("short   title", 20), "short title");
    }

    #[test]
    fn parses_mixed_timestamp_encodings() {
        let expected = datetime!(2026-02-19 10:00 UTC);
        assert_eq!(
            parse_timestamp_value(&json!("2026-02-19T10:00:00Z")),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp_value(&json!(expected.unix_timestamp())),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp_value(&json!(expected.unix_timestamp() * 1000)),
            Some(expected)
        );
        assert_eq!(parse_timestamp_value(&json!(null)), None);
    }
}
