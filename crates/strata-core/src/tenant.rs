//! Tenant context and isolation policy
//!
//! Every store operation takes an `Option<&TenantContext>`. `None` and a
//! context in [`IsolationMode::Disabled`] both resolve to the global scope,
//! which keeps single-tenant callers working unchanged.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum tenant id length (255 chars)
pub const MAX_TENANT_ID_LEN: usize = 255;

/// Prefix of deterministic per-tenant partition names
pub const PARTITION_PREFIX: &str = "tenant_";

/// Strategy used to keep tenants apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// No partitioning; one global namespace
    #[default]
    Disabled,
    /// Shared physical storage, every statement filtered by tenant
    SharedSchema,
    /// A separate physical partition (graph, file, schema) per tenant
    SeparateSchema,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SharedSchema => "shared_schema",
            Self::SeparateSchema => "separate_schema",
        }
    }
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The active tenant for an operation.
///
/// Immutable once built. The tenant id is validated and normalized at
/// construction, never at use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantContext {
    tenant_id: String,
    isolation_mode: IsolationMode,
}

impl TenantContext {
    /// Create a context for `tenant_id` under the given isolation mode.
    ///
    /// `tenant_id` must be 1-255 ASCII alphanumerics, `-` or `_`. It is stored
    /// lower-cased.
    pub fn new(tenant_id: impl AsRef<str>, isolation_mode: IsolationMode) -> Result<Self> {
        let raw = tenant_id.as_ref();
        validate(raw)?;
        Ok(Self {
            tenant_id: raw.to_ascii_lowercase(),
            isolation_mode,
        })
    }

    /// Shorthand for a [`IsolationMode::SharedSchema`] context
    pub fn shared(tenant_id: impl AsRef<str>) -> Result<Self> {
        Self::new(tenant_id, IsolationMode::SharedSchema)
    }

    /// Shorthand for a [`IsolationMode::SeparateSchema`] context
    pub fn separate(tenant_id: impl AsRef<str>) -> Result<Self> {
        Self::new(tenant_id, IsolationMode::SeparateSchema)
    }

    /// The global, un-partitioned context
    pub fn disabled() -> Self {
        Self {
            tenant_id: String::new(),
            isolation_mode: IsolationMode::Disabled,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn isolation_mode(&self) -> IsolationMode {
        self.isolation_mode
    }

    /// Tenant scope this context resolves to; `None` is the global scope
    pub fn scope(&self) -> Option<&str> {
        match self.isolation_mode {
            IsolationMode::Disabled => None,
            _ if self.tenant_id.is_empty() => None,
            _ => Some(&self.tenant_id),
        }
    }

    /// Deterministic physical partition name (`tenant_{id}`)
    pub fn partition_name(&self) -> Option<String> {
        self.scope().map(partition_name)
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scope() {
            Some(tenant) => write!(f, "{}[{}]", tenant, self.isolation_mode),
            None => f.write_str("<global>"),
        }
    }
}

/// Resolve the tenant scope of an optional context
pub fn scope_of(ctx: Option<&TenantContext>) -> Option<&str> {
    ctx.and_then(TenantContext::scope)
}

/// Validate a raw tenant id: 1-255 chars of `[A-Za-z0-9_-]`
pub fn validate(tenant_id: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidTenantId {
        tenant_id: tenant_id.chars().take(64).collect(),
        reason,
    };

    if tenant_id.is_empty() {
        return Err(invalid("tenant id cannot be empty".to_string()));
    }
    if tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(invalid(format!(
            "tenant id too long: {} chars (max {})",
            tenant_id.len(),
            MAX_TENANT_ID_LEN
        )));
    }
    if let Some(bad) = tenant_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(invalid(format!("character {:?} is not allowed", bad)));
    }
    Ok(())
}

/// Normalize untrusted input before building a context: trim and lower-case
pub fn normalize(tenant_id: &str) -> String {
    tenant_id.trim().to_ascii_lowercase()
}

/// Partition name for a validated tenant id
pub fn partition_name(tenant_id: &str) -> String {
    format!("{}{}", PARTITION_PREFIX, tenant_id)
}

/// Treat `Some("")` the same as `None`
pub(crate) fn non_empty(tenant_id: Option<&str>) -> Option<&str> {
    tenant_id.filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tenant_ids() {
        for id in ["acme", "ACME-corp", "tenant_42", "a", &"x".repeat(255)] {
            assert!(TenantContext::shared(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_invalid_tenant_ids() {
        let too_long = "x".repeat(256);
        for id in ["", "a b", "user@acme", "acme.corp", " acme", "ümlaut", too_long.as_str()] {
            let err = TenantContext::shared(id).unwrap_err();
            assert!(matches!(err, Error::InvalidTenantId { .. }), "{id:?} should be rejected");
        }
    }

    #[test]
    fn test_context_is_lower_cased() {
        let ctx = TenantContext::separate("Acme").unwrap();
        assert_eq!(ctx.tenant_id(), "acme");
        assert_eq!(ctx.partition_name().as_deref(), Some("tenant_acme"));
    }

    #[test]
    fn test_normalize_then_build() {
        let ctx = TenantContext::shared(normalize("  Acme ")).unwrap();
        assert_eq!(ctx.tenant_id(), "acme");
    }

    #[test]
    fn test_disabled_scope_is_global() {
        assert_eq!(TenantContext::disabled().scope(), None);
        let ctx = TenantContext::new("acme", IsolationMode::Disabled).unwrap();
        assert_eq!(ctx.scope(), None);
        assert_eq!(ctx.partition_name(), None);
        assert_eq!(scope_of(None), None);
        assert_eq!(scope_of(Some(&TenantContext::shared("t1").unwrap())), Some("t1"));
    }

    #[test]
    fn test_isolation_mode_serde() {
        let mode: IsolationMode = serde_json::from_str("\"separate_schema\"").unwrap();
        assert_eq!(mode, IsolationMode::SeparateSchema);
        assert_eq!(IsolationMode::default(), IsolationMode::Disabled);
    }
}
