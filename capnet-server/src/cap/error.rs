//! Error taxonomy for the trust core.
//!
//! Three disjoint categories:
//! - [`DenyReason`] — business-level outcomes of the enforcement
//!   pipeline. A denial is a normal result, never an error.
//! - Structural errors (caller fault) — `INVALID_INPUT`,
//!   `AMOUNT_OVERFLOW`, `CAP_NOT_FOUND`, `ALREADY_REVOKED`.
//! - Core faults (server fault) — `CAPDOC_SCHEMA_FAILURE`,
//!   `SIGNING_FAILURE`, `STORE_ERROR`. Logged; surfaced as opaque codes.

use std::fmt;

/// Closed vocabulary of denial reasons returned by the enforcement
/// pipeline. The wire form is the SCREAMING_SNAKE code, with the
/// offending category appended for the two blocked variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    NoCapability,
    Revoked,
    CapExpired,
    CapNotYetValid,
    BadSignature,
    BadCapabilityTime,
    ExecutorMismatch,
    ActionNotAllowed,
    VendorNotAllowed,
    CategoryBlocked(String),
    AmountExceedsMax,
    ToolNotAllowed,
    ToolCategoryBlocked(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoCapability => f.write_str("NO_CAPABILITY"),
            DenyReason::Revoked => f.write_str("REVOKED"),
            DenyReason::CapExpired => f.write_str("CAP_EXPIRED"),
            DenyReason::CapNotYetValid => f.write_str("CAP_NOT_YET_VALID"),
            DenyReason::BadSignature => f.write_str("BAD_SIGNATURE"),
            DenyReason::BadCapabilityTime => f.write_str("BAD_CAPABILITY_TIME"),
            DenyReason::ExecutorMismatch => f.write_str("EXECUTOR_MISMATCH"),
            DenyReason::ActionNotAllowed => f.write_str("ACTION_NOT_ALLOWED"),
            DenyReason::VendorNotAllowed => f.write_str("VENDOR_NOT_ALLOWED"),
            DenyReason::CategoryBlocked(cat) => write!(f, "CATEGORY_BLOCKED:{cat}"),
            DenyReason::AmountExceedsMax => f.write_str("AMOUNT_EXCEEDS_MAX"),
            DenyReason::ToolNotAllowed => f.write_str("TOOL_NOT_ALLOWED"),
            DenyReason::ToolCategoryBlocked(cat) => write!(f, "TOOL_CATEGORY_BLOCKED:{cat}"),
        }
    }
}

/// Structural errors and core faults. Decision reasons never travel
/// through this type; they ride inside a [`crate::cap::types::Decision`].
#[derive(Debug, thiserror::Error)]
pub enum CapError {
    /// Schema rejection, with a dotted field path (e.g. `cart[2].qty`).
    #[error("INVALID_INPUT: {field}: {message}")]
    InvalidInput { field: String, message: String },
    /// Cart total outside the safe-integer range. A malformed request,
    /// not a policy denial.
    #[error("AMOUNT_OVERFLOW")]
    AmountOverflow,
    #[error("CAP_NOT_FOUND")]
    CapNotFound,
    #[error("ALREADY_REVOKED")]
    AlreadyRevoked,
    /// Internal construction produced a document its own schema rejects.
    #[error("CAPDOC_SCHEMA_FAILURE: {0}")]
    CapdocSchemaFailure(String),
    /// A freshly produced signature failed self-verification, or
    /// signing-side canonicalization failed.
    #[error("SIGNING_FAILURE: {0}")]
    SigningFailure(String),
    #[error("STORE_ERROR: {0}")]
    StoreError(String),
}

impl CapError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        CapError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The machine-readable code, without detail.
    pub fn code(&self) -> &'static str {
        match self {
            CapError::InvalidInput { .. } => "INVALID_INPUT",
            CapError::AmountOverflow => "AMOUNT_OVERFLOW",
            CapError::CapNotFound => "CAP_NOT_FOUND",
            CapError::AlreadyRevoked => "ALREADY_REVOKED",
            CapError::CapdocSchemaFailure(_) => "CAPDOC_SCHEMA_FAILURE",
            CapError::SigningFailure(_) => "SIGNING_FAILURE",
            CapError::StoreError(_) => "STORE_ERROR",
        }
    }

    /// Server faults get a 5xx-equivalent indicator and opaque bodies;
    /// everything else is the caller's fault.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            CapError::CapdocSchemaFailure(_)
                | CapError::SigningFailure(_)
                | CapError::StoreError(_)
        )
    }
}

impl From<std::io::Error> for CapError {
    fn from(e: std::io::Error) -> Self {
        CapError::StoreError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(DenyReason::NoCapability.to_string(), "NO_CAPABILITY");
        assert_eq!(
            DenyReason::CategoryBlocked("alcohol".into()).to_string(),
            "CATEGORY_BLOCKED:alcohol"
        );
        assert_eq!(
            DenyReason::ToolCategoryBlocked("shell".into()).to_string(),
            "TOOL_CATEGORY_BLOCKED:shell"
        );
    }

    #[test]
    fn test_fault_split() {
        assert!(!CapError::invalid("cart", "empty").is_fault());
        assert!(!CapError::AmountOverflow.is_fault());
        assert!(CapError::SigningFailure("x".into()).is_fault());
        assert!(CapError::StoreError("disk".into()).is_fault());
    }

    #[test]
    fn test_invalid_input_carries_field_path() {
        let e = CapError::invalid("cart[2].price_cents", "must be at least 1");
        assert_eq!(e.code(), "INVALID_INPUT");
        assert!(e.to_string().contains("cart[2].price_cents"));
    }
}
