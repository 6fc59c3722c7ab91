//! UUID-backed identifiers for runtime entities.
//!
//! Groups, workspaces, feedback loops, orchestrations and escalations are all
//! created by conductor itself, so they share the same newtype shape: a v4
//! UUID with a short 8-character form for branch names and log lines.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new unique identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Return first 8 characters of the UUID for display.
            pub fn short(&self) -> String {
                self.0.to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a [`TaskGroup`](crate::core::grouper::TaskGroup) and its schedule entry.
    GroupId
);
uuid_id!(
    /// Identifier of an isolated workspace.
    WorkspaceId
);
uuid_id!(
    /// Identifier of a feedback loop.
    LoopId
);
uuid_id!(
    /// Identifier of a submitted work item.
    WorkItemId
);
uuid_id!(
    /// Identifier of an emitted escalation.
    EscalationId
);
