//! CapNET: a permission core for autonomous agents.
//!
//! Replaces raw-credential delegation with signed, scoped,
//! time-bounded, revocable capabilities, evaluated at a single
//! enforcement boundary before any side-effecting action runs on an
//! agent's behalf. The HTTP surface in [`web`] is a thin shim; all
//! policy lives in [`cap`].

pub mod cap;
pub mod config;
pub mod web;

pub use cap::{CapEngine, CapError, CapStore, IssuerIdentity};
