use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Privileges a caller may hold over scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Create, edit, upload and delete scripts
    ConfigureScripts,
    /// Execute scripts on cluster nodes
    RunScripts,
    /// Review script bodies for remote execution
    ApproveScripts,
}

/// Answers whether the current caller holds a capability.
pub trait PrivilegeCheck: Send + Sync {
    fn has_capability(&self, capability: Capability) -> bool;

    /// Name recorded on approval decisions
    fn caller_name(&self) -> &str {
        "anonymous"
    }
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub capabilities: HashSet<Capability>,
}

impl CallerContext {
    /// A caller without any capability
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            capabilities: HashSet::new(),
        }
    }

    /// May run scripts, nothing else
    pub fn operator(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            capabilities: [Capability::RunScripts].into_iter().collect(),
        }
    }

    /// Manages and runs scripts but cannot approve them
    pub fn maintainer(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            capabilities: [Capability::ConfigureScripts, Capability::RunScripts]
                .into_iter()
                .collect(),
        }
    }

    /// Admins can do everything
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            capabilities: [
                Capability::ConfigureScripts,
                Capability::RunScripts,
                Capability::ApproveScripts,
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn with_capabilities(
        user_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            user_id: Some(user_id.into()),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    pub fn require_capability(&self, capability: Capability) -> crate::error::AppResult<()> {
        require(self, capability)
    }
}

impl PrivilegeCheck for CallerContext {
    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn caller_name(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

/// Fail with `AuthorizationFailed` unless `caller` holds `capability`.
pub fn require(caller: &dyn PrivilegeCheck, capability: Capability) -> crate::error::AppResult<()> {
    if caller.has_capability(capability) {
        Ok(())
    } else {
        Err(crate::error::AppError::unauthorized(format!(
            "{} lacks the {:?} capability",
            caller.caller_name(),
            capability
        )))
    }
}
