// ! Per-request capabilities
// !
// ! Authentication happens outside the host; callers arrive with a capability
// ! set that mutating operations check before doing anything else.

use crate::core::error::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Resource name guarding plugin lifecycle operations
pub const PLUGINS_RESOURCE: &str = "plugins";

/// Access level on a resource, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Admin,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Read => write!(f, "read"),
            Scope::Write => write!(f, "write"),
            Scope::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Scope {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Scope::Read),
            "write" => Ok(Scope::Write),
            "admin" => Ok(Scope::Admin),
            other => Err(PluginError::permission(format!("unknown scope '{other}'"))),
        }
    }
}

/// Capability set supplied by the authorization collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub permissions: HashMap<String, Scope>,
}

impl Capabilities {
    /// Caller with no permissions
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Caller allowed to do anything
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            permissions: HashMap::new(),
        }
    }

    /// Grant `scope` on `resource`
    pub fn with_permission(mut self, resource: impl Into<String>, scope: Scope) -> Self {
        self.permissions.insert(resource.into(), scope);
        self
    }

    /// Whether the caller holds at least `scope` on `resource`
    pub fn allows(&self, resource: &str, scope: Scope) -> bool {
        self.is_admin
            || self
                .permissions
                .get(resource)
                .is_some_and(|granted| *granted >= scope)
    }

    /// Fail with a permission error unless `allows` holds
    pub fn require(&self, resource: &str, scope: Scope) -> PluginResult<()> {
        if self.allows(resource, scope) {
            Ok(())
        } else {
            Err(PluginError::permission(format!(
                "{scope} access to '{resource}' required"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_ordering() {
        assert!(Scope::Admin > Scope::Write);
        assert!(Scope::Write > Scope::Read);
    }

    #[test]
    fn test_write_implies_read() {
        let caps = Capabilities::anonymous().with_permission(PLUGINS_RESOURCE, Scope::Write);
        assert!(caps.allows(PLUGINS_RESOURCE, Scope::Read));
        assert!(caps.allows(PLUGINS_RESOURCE, Scope::Write));
        assert!(!caps.allows(PLUGINS_RESOURCE, Scope::Admin));
        assert!(!caps.allows("clusters", Scope::Read));
    }

    #[test]
    fn test_admin_allows_everything() {
        let caps = Capabilities::admin();
        assert!(caps.require("anything", Scope::Admin).is_ok());
    }

    #[test]
    fn test_anonymous_denied() {
        let err = Capabilities::anonymous()
            .require(PLUGINS_RESOURCE, Scope::Write)
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("WRITE".parse::<Scope>().unwrap(), Scope::Write);
        assert!("owner".parse::<Scope>().is_err());
    }
}
