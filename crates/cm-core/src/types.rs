//! Identifiers and run states shared across the master

use serde::{Deserialize, Serialize};
use std::fmt;

/// Database id of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub i64);

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ExperimentId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from any string-like value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the id as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of one resource allocation (a task's claim on agent slots)
    AllocationId
);

string_id!(
    /// Identifier of a task within an experiment
    TaskId
);

string_id!(
    /// Identifier of a compute agent
    AgentId
);

/// Lifecycle state of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Active,
    Paused,
    StoppingCanceled,
    StoppingCompleted,
    StoppingError,
    Completed,
    Canceled,
    Error,
    Deleting,
    DeleteFailed,
}

impl RunState {
    /// Whether the experiment has reached a final state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Error | Self::DeleteFailed
        )
    }

    /// Whether a restarted master must bring this experiment back under supervision
    ///
    /// Deleting experiments are not restored; they are failed out instead.
    pub fn needs_restore(self) -> bool {
        !self.is_terminal() && self != Self::Deleting
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::StoppingCanceled => "STOPPING_CANCELED",
            Self::StoppingCompleted => "STOPPING_COMPLETED",
            Self::StoppingError => "STOPPING_ERROR",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
            Self::Error => "ERROR",
            Self::Deleting => "DELETING",
            Self::DeleteFailed => "DELETE_FAILED",
        };
        write!(f, "{}", s)
    }
}
