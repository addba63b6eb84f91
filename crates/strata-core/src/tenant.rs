//! Tenant identity.
//!
//! A tenant owns everything under `tenant={id}/`: tables, state documents and
//! lease records. [`ScopedStorage`](crate::ScopedStorage) applies the prefix.
//!
//! ```rust
//! use strata_core::tenant::TenantId;
//!
//! let tenant = TenantId::new("acme-corp").unwrap();
//! assert_eq!(tenant.storage_prefix(), "tenant=acme-corp/");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 63;

/// Validated tenant id: 3-63 chars of `[a-z0-9-]`, no leading or trailing
/// hyphen. The same rules as bucket names, so an id is always path-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validates `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the broken rule.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if let Some(problem) = Self::problem(&id) {
            return Err(Error::InvalidInput(format!("tenant id '{id}' {problem}")));
        }
        Ok(Self(id))
    }

    /// Tenant used when `STRATA_TENANT_ID` is unset.
    #[must_use]
    pub fn default_tenant() -> Self {
        Self("default".to_string())
    }

    /// `tenant={id}/`.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("tenant={self}/")
    }

    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn problem(id: &str) -> Option<&'static str> {
        if !(MIN_LEN..=MAX_LEN).contains(&id.len()) {
            Some("must be 3 to 63 characters")
        } else if id.bytes().any(|b| !matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-')) {
            Some("may only contain lowercase letters, digits, and hyphens")
        } else if id.starts_with('-') || id.ends_with('-') {
            Some("cannot start or end with a hyphen")
        } else {
            None
        }
    }
}

impl TryFrom<String> for TenantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(tenant: TenantId) -> Self {
        tenant.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bucket_style_ids() {
        for id in ["acme-corp", "t01", "default", "a-b-c"] {
            assert_eq!(TenantId::new(id).unwrap().as_str(), id);
        }
    }

    #[test]
    fn rejects_ids_that_could_escape_the_prefix() {
        for id in ["", "ab", "Acme", "-acme", "acme-", "acme/corp", "acme=corp", "../x"] {
            assert!(TenantId::new(id).is_err(), "{id}");
        }
        assert!(TenantId::new("x".repeat(64)).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.storage_prefix(), "tenant=acme/");
        assert!(serde_json::from_str::<TenantId>("\"NOPE\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"acme\"");
    }
}
