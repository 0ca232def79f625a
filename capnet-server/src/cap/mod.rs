//! CapNET trust core
//!
//! Signed, scoped, time-bounded, revocable permission artifacts for
//! autonomous agents, evaluated at a single enforcement boundary.
//!
//! # Architecture
//!
//! - `types` — Capability documents, action requests, decisions, receipts
//! - `canonical` — Domain-prefixed deterministic JSON serialization
//! - `keys` — Ed25519 signing/verification and the issuer keypair
//! - `schema` — Strict input validation and string normalization
//! - `store` — File-backed capability index, revocation set, audit log
//! - `issuer` — Capability construction, signing, and self-checks
//! - `engine` — The enforcement pipeline and revocation oracle
//! - `error` — Decision reasons, structural errors, core faults

pub mod canonical;
pub mod engine;
pub mod error;
pub mod issuer;
pub mod keys;
pub mod schema;
pub mod store;
pub mod types;

pub use engine::CapEngine;
pub use error::{CapError, DenyReason};
pub use keys::IssuerIdentity;
pub use store::CapStore;
// Re-export key types
pub use types::{Capability, Decision, IssueRequest, Receipt, SpendRequest, ToolCallRequest, Verdict};
