//! Tenant identity.

use crate::model::validation::ValidationError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{Display, Formatter};

const MAX_TENANT_ID_LEN: usize = 64;

/// Normalized tenant identifier.
///
/// Lowercase ASCII letters, digits, `_`, `-` and `.`; 1..=64 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Trims and validates a tenant id.
    pub fn new(value: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = value.as_ref().trim();
        if !is_valid_tenant_id(trimmed) {
            return Err(ValidationError::InvalidTenantId(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

fn is_valid_tenant_id(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_TENANT_ID_LEN {
        return false;
    }
    value.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == '.'
    })
}

#[cfg(test)]
mod tests {
    use super::TenantId;
    use crate::model::validation::ValidationError;

    #[test]
    fn accepts_trimmed_lowercase_ids() {
        let tenant = TenantId::new("  acme-prod_1 ").expect("valid tenant");
        assert_eq!(tenant.as_str(), "acme-prod_1");
    }

    #[test]
    fn rejects_blank_and_uppercase_ids() {
        assert!(matches!(
            TenantId::new("   "),
            Err(ValidationError::InvalidTenantId(_))
        ));
        assert!(matches!(
            TenantId::new("Acme"),
            Err(ValidationError::InvalidTenantId(_))
        ));
        assert!(TenantId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn deserialize_runs_validation() {
        let ok: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<TenantId>("\"Not Valid\"").is_err());
    }
}
