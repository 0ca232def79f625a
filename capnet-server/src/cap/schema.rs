//! Strict schema boundary for all external inputs.
//!
//! Everything that reaches business logic passes through here first:
//! closed field sets (serde `deny_unknown_fields` on the types), bounded
//! lengths, ranges and cardinalities, base64 well-formedness with exact
//! decoded lengths, cross-field constraints, and normalization
//! (trim + lowercase) of vendor, category, and tool strings.
//!
//! Normalization happens here exactly once; comparisons inside the
//! engine are raw equality.

use chrono::{DateTime, Utc};

use super::canonical::MAX_SAFE_INT;
use super::error::CapError;
use super::keys;
use super::types::*;

pub const MIN_CAP_ID_LEN: usize = 8;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
/// Vendor, category, and tool-name strings.
pub const MAX_TOKEN_LEN: usize = 64;
pub const MAX_LIST_LEN: usize = 64;
pub const MAX_CART_LINES: usize = 1000;
pub const MAX_PRICE_CENTS: u64 = 5_000_000;
pub const MAX_QTY: u64 = 1000;

/// Trim and lowercase. Applied at this boundary, never at comparison
/// sites.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ─── Field helpers ───────────────────────────────────────────────────────────

fn require_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), CapError> {
    let n = value.chars().count();
    if n < min || n > max {
        return Err(CapError::invalid(
            field,
            format!("length must be between {min} and {max} characters, got {n}"),
        ));
    }
    Ok(())
}

fn require_pubkey(field: &str, value: &str) -> Result<(), CapError> {
    match keys::b64_decode(value) {
        Ok(bytes) if bytes.len() == keys::PUBKEY_LEN => Ok(()),
        Ok(bytes) => Err(CapError::invalid(
            field,
            format!("must decode to {} bytes, got {}", keys::PUBKEY_LEN, bytes.len()),
        )),
        Err(e) => Err(CapError::invalid(field, format!("invalid base64: {e}"))),
    }
}

fn require_ts(field: &str, value: &str) -> Result<DateTime<Utc>, CapError> {
    parse_ts(value).ok_or_else(|| CapError::invalid(field, "must be an RFC 3339 timestamp"))
}

/// Normalize a string list in place and bound its entries.
fn normalize_list(field: &str, list: &mut [String]) -> Result<(), CapError> {
    if list.len() > MAX_LIST_LEN {
        return Err(CapError::invalid(
            field,
            format!("at most {MAX_LIST_LEN} entries"),
        ));
    }
    for (i, entry) in list.iter_mut().enumerate() {
        *entry = normalize(entry);
        require_len(&format!("{field}[{i}]"), entry, 1, MAX_TOKEN_LEN)?;
    }
    Ok(())
}

/// Insist a stored string list is already normalized (signed documents
/// cannot be rewritten without breaking their proof).
fn require_normalized_list(field: &str, list: &[String]) -> Result<(), CapError> {
    if list.len() > MAX_LIST_LEN {
        return Err(CapError::invalid(
            field,
            format!("at most {MAX_LIST_LEN} entries"),
        ));
    }
    for (i, entry) in list.iter().enumerate() {
        let path = format!("{field}[{i}]");
        require_len(&path, entry, 1, MAX_TOKEN_LEN)?;
        if normalize(entry) != *entry {
            return Err(CapError::invalid(path, "must be normalized (trimmed, lowercase)"));
        }
    }
    Ok(())
}

// ─── Issuance input ──────────────────────────────────────────────────────────

/// Validate and normalize an issuance request for the given template
/// kind. The constraint variant must agree with the endpoint.
pub fn validate_issue(req: &mut IssueRequest, expect: ActionKind) -> Result<(), CapError> {
    let expected_tag = match expect {
        ActionKind::Spend => "spend",
        ActionKind::ToolCall => "tool_call",
    };
    if req.template_tag != expected_tag {
        return Err(CapError::invalid(
            "template_tag",
            format!("this endpoint only mints \"{expected_tag}\" capabilities"),
        ));
    }
    require_len("agent_id", &req.agent_id, 1, MAX_ID_LEN)?;
    require_pubkey("agent_pubkey", &req.agent_pubkey)?;
    if let Some(subject_id) = &req.subject_id {
        require_len("subject_id", subject_id, 1, MAX_ID_LEN)?;
    }

    match (&mut req.constraints, expect) {
        (Constraints::Spend(c), ActionKind::Spend) => validate_spend_constraints_mut(c),
        (Constraints::ToolCall(c), ActionKind::ToolCall) => validate_tool_constraints_mut(c),
        _ => Err(CapError::invalid(
            "constraints",
            format!("must be \"{expected_tag}\" constraints"),
        )),
    }
}

fn validate_spend_constraints_mut(c: &mut SpendConstraints) -> Result<(), CapError> {
    if c.currency != "USD" {
        return Err(CapError::invalid("constraints.currency", "must be \"USD\""));
    }
    if c.max_amount_cents == 0 || c.max_amount_cents > MAX_SAFE_INT {
        return Err(CapError::invalid(
            "constraints.max_amount_cents",
            "must be a positive safe integer",
        ));
    }
    if c.allowed_vendors.is_empty() {
        return Err(CapError::invalid(
            "constraints.allowed_vendors",
            "must not be empty",
        ));
    }
    normalize_list("constraints.allowed_vendors", &mut c.allowed_vendors)?;
    normalize_list("constraints.blocked_categories", &mut c.blocked_categories)?;
    Ok(())
}

fn validate_tool_constraints_mut(c: &mut ToolCallConstraints) -> Result<(), CapError> {
    if c.allowed_tools.is_empty() {
        return Err(CapError::invalid(
            "constraints.allowed_tools",
            "must not be empty",
        ));
    }
    normalize_list("constraints.allowed_tools", &mut c.allowed_tools)?;
    normalize_list(
        "constraints.blocked_tool_categories",
        &mut c.blocked_tool_categories,
    )?;
    if let Some(max_calls) = c.max_calls {
        if max_calls == 0 || max_calls > u64::from(u32::MAX) {
            return Err(CapError::invalid(
                "constraints.max_calls",
                "must be between 1 and 2^32",
            ));
        }
    }
    Ok(())
}

// ─── Capability documents ────────────────────────────────────────────────────

/// Validate a complete capability document. Used both on issuance
/// output (defense against drift between construction and validator)
/// and on documents loaded from outside the trust boundary.
pub fn validate_capability(cap: &Capability) -> Result<(), CapError> {
    if cap.version != CAPDOC_VERSION {
        return Err(CapError::invalid(
            "version",
            format!("must be \"{CAPDOC_VERSION}\""),
        ));
    }
    require_len("cap_id", &cap.cap_id, MIN_CAP_ID_LEN, MAX_ID_LEN)?;

    let issued = require_ts("issued_at", &cap.issued_at)?;
    let expires = require_ts("expires_at", &cap.expires_at)?;
    if expires <= issued {
        return Err(CapError::invalid(
            "expires_at",
            "must be strictly after issued_at",
        ));
    }
    if let Some(not_before) = &cap.not_before {
        let nb = require_ts("not_before", not_before)?;
        if nb > expires {
            return Err(CapError::invalid(
                "not_before",
                "must be at or before expires_at",
            ));
        }
    }

    require_len("issuer.id", &cap.issuer.id, 1, MAX_ID_LEN)?;
    require_pubkey("issuer.pubkey", &cap.issuer.pubkey)?;
    require_len("subject.id", &cap.subject.id, 1, MAX_ID_LEN)?;
    require_len("executor.agent_id", &cap.executor.agent_id, 1, MAX_ID_LEN)?;
    require_pubkey("executor.agent_pubkey", &cap.executor.agent_pubkey)?;

    require_len("resource.vendor", &cap.resource.vendor, 1, MAX_TOKEN_LEN)?;
    if normalize(&cap.resource.vendor) != cap.resource.vendor {
        return Err(CapError::invalid(
            "resource.vendor",
            "must be normalized (trimmed, lowercase)",
        ));
    }

    if cap.actions.is_empty() {
        return Err(CapError::invalid("actions", "must not be empty"));
    }
    for (i, action) in cap.actions.iter().enumerate() {
        if cap.actions[..i].contains(action) {
            return Err(CapError::invalid("actions", "must not contain duplicates"));
        }
    }

    match &cap.constraints {
        Constraints::Spend(c) => {
            if cap.actions != [ActionKind::Spend] {
                return Err(CapError::invalid(
                    "actions",
                    "spend constraints require actions = [\"spend\"]",
                ));
            }
            if c.currency != "USD" {
                return Err(CapError::invalid("constraints.currency", "must be \"USD\""));
            }
            if c.max_amount_cents == 0 || c.max_amount_cents > MAX_SAFE_INT {
                return Err(CapError::invalid(
                    "constraints.max_amount_cents",
                    "must be a positive safe integer",
                ));
            }
            if c.allowed_vendors.is_empty() {
                return Err(CapError::invalid(
                    "constraints.allowed_vendors",
                    "must not be empty",
                ));
            }
            require_normalized_list("constraints.allowed_vendors", &c.allowed_vendors)?;
            require_normalized_list("constraints.blocked_categories", &c.blocked_categories)?;
            if !c.allowed_vendors.contains(&cap.resource.vendor) {
                return Err(CapError::invalid(
                    "resource.vendor",
                    "must be a member of constraints.allowed_vendors",
                ));
            }
        }
        Constraints::ToolCall(c) => {
            if cap.actions != [ActionKind::ToolCall] {
                return Err(CapError::invalid(
                    "actions",
                    "tool_call constraints require actions = [\"tool_call\"]",
                ));
            }
            if c.allowed_tools.is_empty() {
                return Err(CapError::invalid(
                    "constraints.allowed_tools",
                    "must not be empty",
                ));
            }
            require_normalized_list("constraints.allowed_tools", &c.allowed_tools)?;
            require_normalized_list(
                "constraints.blocked_tool_categories",
                &c.blocked_tool_categories,
            )?;
            if let Some(max_calls) = c.max_calls {
                if max_calls == 0 || max_calls > u64::from(u32::MAX) {
                    return Err(CapError::invalid(
                        "constraints.max_calls",
                        "must be between 1 and 2^32",
                    ));
                }
            }
        }
    }

    require_len("revocation.oracle", &cap.revocation.oracle, 1, MAX_ID_LEN)?;

    if let Some(proof) = &cap.proof {
        if proof.alg != PROOF_ALG {
            return Err(CapError::invalid(
                "proof.alg",
                format!("must be \"{PROOF_ALG}\""),
            ));
        }
        match keys::b64_decode(&proof.sig) {
            Ok(bytes) if bytes.len() == keys::SIG_LEN => {}
            Ok(bytes) => {
                return Err(CapError::invalid(
                    "proof.sig",
                    format!("must decode to {} bytes, got {}", keys::SIG_LEN, bytes.len()),
                ));
            }
            Err(e) => {
                return Err(CapError::invalid("proof.sig", format!("invalid base64: {e}")));
            }
        }
    }
    Ok(())
}

// ─── Action requests ─────────────────────────────────────────────────────────

/// Validate and normalize a spend request.
///
/// The cumulative cart total is deliberately not bounded here; that
/// check belongs to the enforcement pipeline, after the attempt receipt.
pub fn validate_spend_request(req: &mut SpendRequest) -> Result<(), CapError> {
    require_len("request_id", &req.request_id, 1, MAX_ID_LEN)?;
    require_ts("ts", &req.ts)?;
    require_len("agent_id", &req.agent_id, 1, MAX_ID_LEN)?;
    require_pubkey("agent_pubkey", &req.agent_pubkey)?;
    if req.action != ActionKind::Spend {
        return Err(CapError::invalid("action", "must be \"spend\""));
    }
    req.vendor = normalize(&req.vendor);
    require_len("vendor", &req.vendor, 1, MAX_TOKEN_LEN)?;
    if req.currency != "USD" {
        return Err(CapError::invalid("currency", "must be \"USD\""));
    }
    if req.cart.is_empty() {
        return Err(CapError::invalid("cart", "must not be empty"));
    }
    if req.cart.len() > MAX_CART_LINES {
        return Err(CapError::invalid(
            "cart",
            format!("at most {MAX_CART_LINES} lines"),
        ));
    }
    for (i, item) in req.cart.iter_mut().enumerate() {
        if let Some(sku) = &item.sku {
            require_len(&format!("cart[{i}].sku"), sku, 1, MAX_ID_LEN)?;
        }
        require_len(&format!("cart[{i}].name"), &item.name, 1, MAX_NAME_LEN)?;
        item.category = normalize(&item.category);
        require_len(&format!("cart[{i}].category"), &item.category, 1, MAX_TOKEN_LEN)?;
        if item.price_cents == 0 || item.price_cents > MAX_PRICE_CENTS {
            return Err(CapError::invalid(
                format!("cart[{i}].price_cents"),
                format!("must be between 1 and {MAX_PRICE_CENTS}"),
            ));
        }
        if item.qty == 0 || item.qty > MAX_QTY {
            return Err(CapError::invalid(
                format!("cart[{i}].qty"),
                format!("must be between 1 and {MAX_QTY}"),
            ));
        }
    }
    Ok(())
}

/// Validate and normalize a tool-call request.
pub fn validate_tool_request(req: &mut ToolCallRequest) -> Result<(), CapError> {
    require_len("request_id", &req.request_id, 1, MAX_ID_LEN)?;
    require_ts("ts", &req.ts)?;
    require_len("agent_id", &req.agent_id, 1, MAX_ID_LEN)?;
    require_pubkey("agent_pubkey", &req.agent_pubkey)?;
    if req.action != ActionKind::ToolCall {
        return Err(CapError::invalid("action", "must be \"tool_call\""));
    }
    req.tool_name = normalize(&req.tool_name);
    require_len("tool_name", &req.tool_name, 1, MAX_TOKEN_LEN)?;
    req.tool_category = normalize(&req.tool_category);
    require_len("tool_category", &req.tool_category, 1, MAX_TOKEN_LEN)?;
    if req.tool_input.is_null() {
        req.tool_input = serde_json::Value::Object(serde_json::Map::new());
    }
    if !req.tool_input.is_object() {
        return Err(CapError::invalid("tool_input", "must be a JSON object"));
    }
    Ok(())
}
