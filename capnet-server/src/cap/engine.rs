//! The enforcement boundary: the single point at which a capability is
//! evaluated against an action request.
//!
//! The verification order is a fixed contract because it determines
//! which denial reason is surfaced when multiple defects are present:
//!
//! 1. emit `ACTION_ATTEMPT` (before any capability lookup)
//! 2. amount safety (spend only; overflow is a structural error)
//! 3. capability lookup → `NO_CAPABILITY`
//! 4. signature over the proof-less body → `BAD_SIGNATURE`
//! 5. executor binding → `EXECUTOR_MISMATCH`
//! 6. revocation → `REVOKED`
//! 7. time window → `BAD_CAPABILITY_TIME` / `CAP_EXPIRED` / `CAP_NOT_YET_VALID`
//! 8. action applicability → `ACTION_NOT_ALLOWED`
//! 9. action-specific constraints (vendor/category/amount, or tool/category)
//! 10. allow
//!
//! Signature verification precedes every check that reads capability
//! fields, so no field of an untrusted artifact can influence policy.
//! Revocation is checked ahead of the time window: a revoked capability
//! surfaces `REVOKED` (the principal's most recent intent) even after
//! it has also expired.
//!
//! Boundary semantics: a capability is expired at the instant
//! `now == expires_at`, and valid at the instant `now == not_before`.

use chrono::Utc;

use super::canonical::{Domain, MAX_SAFE_INT};
use super::error::{CapError, DenyReason};
use super::keys::{self, IssuerIdentity};
use super::schema;
use super::store::CapStore;
use super::types::*;

/// The trust engine. Owns the store and the process signing identity;
/// issuance (in `issuer`), enforcement, and revocation all run through
/// this type, serialized with respect to the store's mutable state.
pub struct CapEngine {
    pub(crate) store: CapStore,
    pub(crate) identity: IssuerIdentity,
}

/// Request-scoped fields copied onto every receipt of one evaluation.
struct AuditCtx<'a> {
    request_id: &'a str,
    agent_id: &'a str,
    vendor: Option<&'a str>,
    amount_cents: Option<u64>,
    item_count: Option<u64>,
    tool_name: Option<&'a str>,
    tool_category: Option<&'a str>,
}

impl CapEngine {
    pub fn new(store: CapStore, identity: IssuerIdentity) -> Self {
        CapEngine { store, identity }
    }

    pub fn store(&self) -> &CapStore {
        &self.store
    }

    pub fn issuer_id(&self) -> &str {
        &self.identity.issuer_id
    }

    pub fn issuer_pubkey(&self) -> String {
        self.identity.pubkey_b64()
    }

    /// Sign a receipt with the `receipt` domain and append it to the
    /// audit log before returning it.
    pub(crate) fn emit(&self, mut receipt: Receipt) -> Result<Receipt, CapError> {
        let sig = keys::sign(&receipt, &self.identity.signing_key, Domain::Receipt)
            .map_err(|e| CapError::SigningFailure(format!("receipt: {e}")))?;
        receipt.proof = Some(Proof::ed25519(sig));
        self.store.append_receipt(&receipt)?;
        Ok(receipt)
    }

    // ─── Enforcement: spend ──────────────────────────────────────────────

    pub fn enforce_spend(&self, mut req: SpendRequest) -> Result<Decision, CapError> {
        schema::validate_spend_request(&mut req)?;

        let total = cart_total(&req.cart);
        let item_count: u64 = req.cart.iter().map(|item| item.qty).sum();
        let amount = total.filter(|t| *t <= MAX_SAFE_INT);

        let audit = AuditCtx {
            request_id: &req.request_id,
            agent_id: &req.agent_id,
            vendor: Some(&req.vendor),
            amount_cents: amount,
            item_count: Some(item_count),
            tool_name: None,
            tool_category: None,
        };

        // Attempts are observable even against unbound agents.
        self.emit(attempt_receipt(&audit))?;

        let Some(amount) = amount else {
            return Err(CapError::AmountOverflow);
        };

        let found = self.store.find_cap_for_agent(&req.agent_id, &req.agent_pubkey);
        self.evaluate_spend(&req, amount, item_count, found)
    }

    fn evaluate_spend(
        &self,
        req: &SpendRequest,
        amount: u64,
        item_count: u64,
        found: Option<(Capability, bool)>,
    ) -> Result<Decision, CapError> {
        let audit = AuditCtx {
            request_id: &req.request_id,
            agent_id: &req.agent_id,
            vendor: Some(&req.vendor),
            amount_cents: Some(amount),
            item_count: Some(item_count),
            tool_name: None,
            tool_category: None,
        };

        let Some((cap, revoked)) = found else {
            return self.deny(&audit, None, DenyReason::NoCapability);
        };
        if let Some(reason) = self.verify_cap(&req.agent_id, &req.agent_pubkey, &cap, revoked) {
            return self.deny(&audit, Some(&cap.cap_id), reason);
        }

        // Action applicability: narrow the constraints before reading them.
        if !cap.actions.contains(&ActionKind::Spend) {
            return self.deny(&audit, Some(&cap.cap_id), DenyReason::ActionNotAllowed);
        }
        let Constraints::Spend(constraints) = &cap.constraints else {
            return self.deny(&audit, Some(&cap.cap_id), DenyReason::ActionNotAllowed);
        };

        if !constraints.allowed_vendors.contains(&req.vendor) {
            return self.deny(&audit, Some(&cap.cap_id), DenyReason::VendorNotAllowed);
        }

        // First offending cart line, in iteration order.
        for item in &req.cart {
            if constraints.blocked_categories.contains(&item.category) {
                return self.deny(
                    &audit,
                    Some(&cap.cap_id),
                    DenyReason::CategoryBlocked(item.category.clone()),
                );
            }
        }

        if amount > constraints.max_amount_cents {
            return self.deny(&audit, Some(&cap.cap_id), DenyReason::AmountExceedsMax);
        }

        self.allow(&audit, &cap.cap_id)
    }

    // ─── Enforcement: tool call ──────────────────────────────────────────

    pub fn enforce_tool_call(&self, mut req: ToolCallRequest) -> Result<Decision, CapError> {
        schema::validate_tool_request(&mut req)?;

        let audit = AuditCtx {
            request_id: &req.request_id,
            agent_id: &req.agent_id,
            vendor: None,
            amount_cents: None,
            item_count: None,
            tool_name: Some(&req.tool_name),
            tool_category: Some(&req.tool_category),
        };
        self.emit(attempt_receipt(&audit))?;

        let found = self.store.find_cap_for_agent(&req.agent_id, &req.agent_pubkey);
        self.evaluate_tool_call(&req, found)
    }

    fn evaluate_tool_call(
        &self,
        req: &ToolCallRequest,
        found: Option<(Capability, bool)>,
    ) -> Result<Decision, CapError> {
        let audit = AuditCtx {
            request_id: &req.request_id,
            agent_id: &req.agent_id,
            vendor: None,
            amount_cents: None,
            item_count: None,
            tool_name: Some(&req.tool_name),
            tool_category: Some(&req.tool_category),
        };

        let Some((cap, revoked)) = found else {
            return self.deny(&audit, None, DenyReason::NoCapability);
        };
        if let Some(reason) = self.verify_cap(&req.agent_id, &req.agent_pubkey, &cap, revoked) {
            return self.deny(&audit, Some(&cap.cap_id), reason);
        }

        if !cap.actions.contains(&ActionKind::ToolCall) {
            return self.deny(&audit, Some(&cap.cap_id), DenyReason::ActionNotAllowed);
        }
        let Constraints::ToolCall(constraints) = &cap.constraints else {
            return self.deny(&audit, Some(&cap.cap_id), DenyReason::ActionNotAllowed);
        };

        if !constraints.allowed_tools.contains(&req.tool_name) {
            return self.deny(&audit, Some(&cap.cap_id), DenyReason::ToolNotAllowed);
        }
        if constraints
            .blocked_tool_categories
            .contains(&req.tool_category)
        {
            return self.deny(
                &audit,
                Some(&cap.cap_id),
                DenyReason::ToolCategoryBlocked(req.tool_category.clone()),
            );
        }

        self.allow(&audit, &cap.cap_id)
    }

    // ─── Shared capability verification (steps 4-7) ──────────────────────

    /// Signature, executor binding, revocation, time window. Returns
    /// the first failure in contract order, or `None` if the
    /// capability is trusted and live.
    fn verify_cap(
        &self,
        agent_id: &str,
        agent_pubkey: &str,
        cap: &Capability,
        revoked: bool,
    ) -> Option<DenyReason> {
        // Signature first: no field of an untrusted artifact is read
        // before this point. A malformed proof is tampering, not an
        // engine fault.
        let Some(proof) = &cap.proof else {
            return Some(DenyReason::BadSignature);
        };
        match keys::verify(&cap.proofless(), &proof.sig, &cap.issuer.pubkey, Domain::CapDoc) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Some(DenyReason::BadSignature),
        }

        // Executor binding. The lookup already filters on both fields;
        // this re-check covers evaluation paths fed a capability directly.
        if cap.executor.agent_id != agent_id || cap.executor.agent_pubkey != agent_pubkey {
            return Some(DenyReason::ExecutorMismatch);
        }

        // Revocation ahead of the time window, so a revoked capability
        // keeps answering REVOKED after it expires.
        if revoked {
            return Some(DenyReason::Revoked);
        }

        let now = Utc::now();
        match schema::parse_ts(&cap.expires_at) {
            None => return Some(DenyReason::BadCapabilityTime),
            Some(expires) => {
                if now >= expires {
                    return Some(DenyReason::CapExpired);
                }
            }
        }
        if let Some(not_before) = &cap.not_before {
            match schema::parse_ts(not_before) {
                None => return Some(DenyReason::BadCapabilityTime),
                Some(nb) => {
                    if now < nb {
                        return Some(DenyReason::CapNotYetValid);
                    }
                }
            }
        }
        None
    }

    // ─── Revocation oracle ───────────────────────────────────────────────

    /// Revoke a capability. Irrevocable; survives restarts.
    pub fn revoke(&self, cap_id: &str) -> Result<Receipt, CapError> {
        let Some(cap) = self.store.capability(cap_id) else {
            return Err(CapError::CapNotFound);
        };
        if !self.store.add_revocation(cap_id)? {
            return Err(CapError::AlreadyRevoked);
        }

        let mut receipt = Receipt::new(ReceiptEvent::CapRevoked);
        receipt.cap_id = Some(cap.cap_id.clone());
        receipt.agent_id = Some(cap.executor.agent_id.clone());
        let receipt = self.emit(receipt)?;
        tracing::info!(cap = %cap_id, agent = %cap.executor.agent_id, "capability revoked");
        Ok(receipt)
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn list_capabilities(&self) -> Vec<(Capability, bool)> {
        self.store.list_capabilities()
    }

    pub fn list_receipts(&self, limit: usize, since: Option<&str>) -> Result<Vec<Receipt>, CapError> {
        self.store.read_receipts(limit, since)
    }

    // ─── Receipt emission ────────────────────────────────────────────────

    fn allow(&self, audit: &AuditCtx<'_>, cap_id: &str) -> Result<Decision, CapError> {
        let mut receipt = receipt_for(ReceiptEvent::ActionAllowed, audit);
        receipt.cap_id = Some(cap_id.to_string());
        let receipt = self.emit(receipt)?;
        tracing::debug!(request = %audit.request_id, cap = %cap_id, "action allowed");
        Ok(Decision {
            request_id: audit.request_id.to_string(),
            decision: Verdict::Allow,
            reason: "ALLOWED".to_string(),
            receipt_id: receipt.receipt_id,
        })
    }

    fn deny(
        &self,
        audit: &AuditCtx<'_>,
        cap_id: Option<&str>,
        reason: DenyReason,
    ) -> Result<Decision, CapError> {
        let reason_code = reason.to_string();
        let mut receipt = receipt_for(ReceiptEvent::ActionDenied, audit);
        receipt.cap_id = cap_id.map(String::from);
        receipt.summary.denied_reason = Some(reason_code.clone());
        let receipt = self.emit(receipt)?;
        tracing::info!(request = %audit.request_id, reason = %reason_code, "action denied");
        Ok(Decision {
            request_id: audit.request_id.to_string(),
            decision: Verdict::Deny,
            reason: reason_code,
            receipt_id: receipt.receipt_id,
        })
    }
}

fn attempt_receipt(audit: &AuditCtx<'_>) -> Receipt {
    receipt_for(ReceiptEvent::ActionAttempt, audit)
}

fn receipt_for(event: ReceiptEvent, audit: &AuditCtx<'_>) -> Receipt {
    let mut receipt = Receipt::new(event);
    receipt.request_id = Some(audit.request_id.to_string());
    receipt.agent_id = Some(audit.agent_id.to_string());
    receipt.vendor = audit.vendor.map(String::from);
    receipt.summary.amount_cents = audit.amount_cents;
    receipt.summary.item_count = audit.item_count;
    if let Some(tool_name) = audit.tool_name {
        receipt
            .meta
            .insert("tool_name".into(), serde_json::Value::String(tool_name.into()));
    }
    if let Some(tool_category) = audit.tool_category {
        receipt.meta.insert(
            "tool_category".into(),
            serde_json::Value::String(tool_category.into()),
        );
    }
    receipt
}

/// Cumulative cart total with overflow detection. `None` means the sum
/// left the u64 range entirely; values above the safe-integer ceiling
/// are rejected by the caller.
fn cart_total(cart: &[CartItem]) -> Option<u64> {
    cart.iter().try_fold(0u64, |acc, item| {
        acc.checked_add(item.price_cents.checked_mul(item.qty)?)
    })
}
