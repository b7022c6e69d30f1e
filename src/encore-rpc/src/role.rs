use serde::{Deserialize, Serialize};
use std::fmt;

/// Which relationship a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// No real peer; every call fails immediately.
    Placeholder,
    /// One per extension process, carries global endpoints.
    HostMain,
    /// One per scene hosted by an extension, carries scene-scoped endpoints.
    HostView,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Placeholder => "placeholder",
            Role::HostMain => "host-main",
            Role::HostView => "host-view",
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Role::Placeholder)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde() {
        for role in [Role::Placeholder, Role::HostMain, Role::HostView] {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
        }
        assert!(Role::Placeholder.is_placeholder());
        assert!(!Role::HostView.is_placeholder());
    }
}
