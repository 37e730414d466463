use serde::Deserialize;
use serde_json::Value;

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default, rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Parses `td show <id> -f json`, which prints either an object or a one-element array.
pub fn parse_issue_json(raw: &str) -> Result<Issue, serde_json::Error> {
    let value: Value = serde_json::from_str(raw.trim())?;
    let value = match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    serde_json::from_value(value)
}

pub fn normalize_issue_id(raw: &str) -> Option<String> {
    let id = raw.trim().trim_start_matches('#');
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return None;
    }
    Some(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_and_array_forms() {
        let issue = parse_issue_json(r#"{"id":"td-12","title":"Fix it","status":"open","type":"bug","labels":["ui"],"extra":1}"#)
            .expect("object");
        assert_eq!(issue.id, "td-12");
        assert_eq!(issue.issue_type, "bug");
        assert_eq!(issue.labels, vec!["ui".to_string()]);

        let issue = parse_issue_json(r#"[{"id":"td-3"}]"#).expect("array");
        assert_eq!(issue.id, "td-3");
        assert_eq!(issue.title, "");

        assert!(parse_issue_json("not json").is_err());
    }

    #[test]
    fn normalizes_ids() {
        assert_eq!(normalize_issue_id(" #td-4 "), Some("td-4".to_string()));
        assert_eq!(normalize_issue_id("  "), None);
        assert_eq!(normalize_issue_id("td 4"), None);
    }
}
