use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Topic {
    GitChange,
    AdapterWatch,
    ConfigChange,
    ProjectSwitch,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::GitChange,
        Topic::AdapterWatch,
        Topic::ConfigChange,
        Topic::ProjectSwitch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitChange => "git.change",
            Self::AdapterWatch => "adapter.watch",
            Self::ConfigChange => "config.change",
            Self::ProjectSwitch => "project.switch",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.as_str() == raw)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventData {
    None,
    Sequence(u64),
    Text(String),
    AdapterChanged {
        adapter_id: String,
        session_id: Option<String>,
    },
    ConfigReloaded {
        path: PathBuf,
    },
    ProjectSwitched {
        from: Option<PathBuf>,
        to: PathBuf,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub kind: String,
    pub topic: Topic,
    pub timestamp: OffsetDateTime,
    pub data: EventData,
}

impl Event {
    pub fn new(topic: Topic, kind: impl Into<String>, data: EventData) -> Self {
        Self {
            kind: kind.into(),
            topic,
            timestamp: OffsetDateTime::now_utc(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_strings_are_stable() {
        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::AdapterWatch.to_string(), "adapter.watch");
        assert_eq!(Topic::parse("nope"), None);
    }
}
