use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(WorkflowID);
opaque_id!(TaskID);
opaque_id!(DeviceID);

/// A monotonic-per-workflow event identifier: the `sequence` is the
/// authoritative ordering key, the `id` is an opaque handle used by
/// clients (e.g. the `since` query parameter on reconnect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventID {
    pub id: String,
    pub sequence: u64,
}

impl EventID {
    pub fn new(sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sequence,
        }
    }
}

/// Human-readable slug, resolvable via config lookup at replay time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileID(pub String);

impl fmt::Display for ProfileID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProfileID {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ProfileID {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Major,
    Critical,
}

impl Severity {
    /// §4.5 plan_validator_node: one structural issue is `major`, two or
    /// more is `critical`.
    pub fn from_issue_count(count: usize) -> Self {
        match count {
            0 => Severity::None,
            1 => Severity::Major,
            _ => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_escalates_with_issue_count() {
        assert_eq!(Severity::from_issue_count(0), Severity::None);
        assert_eq!(Severity::from_issue_count(1), Severity::Major);
        assert_eq!(Severity::from_issue_count(2), Severity::Critical);
        assert_eq!(Severity::from_issue_count(5), Severity::Critical);
    }

    #[test]
    fn ids_round_trip_through_json() {
        let id = WorkflowID::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: WorkflowID = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
