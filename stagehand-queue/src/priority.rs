//! Job priorities and their broker encoding.

use serde::{Deserialize, Serialize};

/// Named job priority.
///
/// The broker orders lower numbers first; see [`Priority::broker_priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    #[default]
    Default,
    NotUrgent,
    Last,
}

impl Priority {
    /// Numeric priority sent to the broker (1 = runs first).
    pub fn broker_priority(self) -> u8 {
        match self {
            Priority::Urgent => 1,
            Priority::Default => 2,
            Priority::NotUrgent => 3,
            Priority::Last => 4,
        }
    }

    /// Parse a priority name. Unknown names fall back to [`Priority::Default`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "urgent" => Priority::Urgent,
            "default" => Priority::Default,
            "not_urgent" => Priority::NotUrgent,
            "last" => Priority::Last,
            _ => Priority::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::Default => "default",
            Priority::NotUrgent => "not_urgent",
            Priority::Last => "last",
        }
    }
}

/// Broker priority for an optional priority name.
pub fn broker_priority_for(name: Option<&str>) -> u8 {
    name.map(Priority::from_name).unwrap_or_default().broker_priority()
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
