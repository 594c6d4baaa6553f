use crate::error::{NormalizationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity forwarded by the external identity provider. Either field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            org_id: Some(org_id.into()),
        }
    }

    /// Both a user and an organization are required to touch org-scoped tables.
    pub fn require_org_user(&self) -> Result<OrgScope> {
        let user = self
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        if user.is_none() {
            return Err(NormalizationError::Unauthorized(
                "a user context is required".to_string(),
            ));
        }
        self.org_scope()
    }

    pub fn org_scope(&self) -> Result<OrgScope> {
        match self.org_id.as_deref() {
            Some(org) => OrgScope::new(org).map_err(|_| {
                NormalizationError::Unauthorized("an organization context is required".to_string())
            }),
            None => Err(NormalizationError::Unauthorized(
                "an organization context is required".to_string(),
            )),
        }
    }
}

/// Tenant boundary used to namespace physical tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgScope(String);

impl OrgScope {
    pub fn new(org_id: &str) -> Result<Self> {
        let trimmed = org_id.trim();
        if trimmed.is_empty() {
            return Err(NormalizationError::ValidationError(
                "organization id cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier-safe form of the org id, used as the physical table prefix.
    pub fn slug(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for OrgScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
