//! Core types for capability documents, action requests, decisions,
//! and audit receipts.
//!
//! All objects are designed to be:
//! - Serializable via serde_json
//! - Canonicalized for signing (with `proof` stripped)
//! - Immutable once created

use serde::{Deserialize, Serialize};

/// Fixed document version literal.
pub const CAPDOC_VERSION: &str = "capdoc/0.1";

/// Signature algorithm literal carried in [`Proof`].
pub const PROOF_ALG: &str = "ed25519";

// ─── Capability Document ─────────────────────────────────────────────────────

/// An immutable signed artifact authorizing a bounded class of actions.
///
/// The signed body is the document with `proof` removed; verification
/// always uses that proof-less body against `issuer.pubkey`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Capability {
    /// Always `"capdoc/0.1"`.
    pub version: String,
    /// Opaque unique identifier, 8-128 characters.
    pub cap_id: String,
    /// RFC 3339 timestamp.
    pub issued_at: String,
    /// RFC 3339 timestamp; strictly after `issued_at`.
    pub expires_at: String,
    /// Optional RFC 3339 timestamp; at most `expires_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    /// The minting authority.
    pub issuer: IssuerRef,
    /// The human principal on whose behalf authority is delegated.
    pub subject: SubjectRef,
    /// The unique agent bound to this capability.
    pub executor: ExecutorRef,
    pub resource: Resource,
    /// Non-empty ordered set of action verbs.
    pub actions: Vec<ActionKind>,
    pub constraints: Constraints,
    pub revocation: RevocationPolicy,
    /// Detached Ed25519 signature over the canonicalized proof-less body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl Capability {
    /// The signed body: this document with `proof` removed.
    pub fn proofless(&self) -> Capability {
        let mut body = self.clone();
        body.proof = None;
        body
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IssuerRef {
    pub id: String,
    /// Base64 of the 32-byte Ed25519 public key.
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubjectRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorRef {
    pub agent_id: String,
    /// Base64 of the 32-byte Ed25519 public key.
    pub agent_pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    /// Normalized vendor string. For spend capabilities this must be a
    /// member of `allowed_vendors`.
    pub vendor: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Spend,
    ToolCall,
    /// Admitted by the schema for externally minted documents; the
    /// issuance API refuses to mint these.
    SandboxMerchant,
    Generic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Spend,
    ToolCall,
}

/// Tagged polymorphic constraints. Spend and tool-call constraints
/// share no fields; the engine narrows explicitly before reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Constraints {
    Spend(SpendConstraints),
    ToolCall(ToolCallConstraints),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpendConstraints {
    /// Always `"USD"` in this phase.
    pub currency: String,
    pub max_amount_cents: u64,
    /// Non-empty, normalized (trim + lowercase) vendor strings.
    pub allowed_vendors: Vec<String>,
    /// Normalized category strings.
    #[serde(default)]
    pub blocked_categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolCallConstraints {
    /// Non-empty, normalized tool names.
    pub allowed_tools: Vec<String>,
    /// Normalized category tags.
    #[serde(default)]
    pub blocked_tool_categories: Vec<String>,
    /// Accepted and persisted; call counting is not enforced in this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_calls: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RevocationPolicy {
    pub mode: RevocationMode,
    /// Name of the revocation authority endpoint.
    pub oracle: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RevocationMode {
    Strict,
    Lease,
    OneTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Proof {
    /// Always `"ed25519"`.
    pub alg: String,
    /// Base64 of the 64-byte detached signature.
    pub sig: String,
}

impl Proof {
    pub fn ed25519(sig: String) -> Self {
        Proof {
            alg: PROOF_ALG.to_string(),
            sig,
        }
    }
}

// ─── Issuance Input ──────────────────────────────────────────────────────────

/// Input to the issuance endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueRequest {
    /// `"spend"` or `"tool_call"`; must agree with the endpoint and
    /// with the constraint variant.
    pub template_tag: String,
    pub agent_id: String,
    pub agent_pubkey: String,
    /// Principal the capability is delegated on behalf of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub constraints: Constraints,
}

// ─── Action Requests ─────────────────────────────────────────────────────────

/// A spend attempt submitted by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpendRequest {
    pub request_id: String,
    /// RFC 3339 timestamp supplied by the caller.
    pub ts: String,
    pub agent_id: String,
    pub agent_pubkey: String,
    /// Must be `spend`.
    pub action: ActionKind,
    pub vendor: String,
    /// Must be `"USD"`.
    pub currency: String,
    /// Non-empty.
    pub cart: Vec<CartItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CartItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub name: String,
    pub category: String,
    /// 1 to 5,000,000.
    pub price_cents: u64,
    /// 1 to 1,000.
    pub qty: u64,
}

/// A tool invocation attempt submitted by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCallRequest {
    pub request_id: String,
    pub ts: String,
    pub agent_id: String,
    pub agent_pubkey: String,
    /// Must be `tool_call`.
    pub action: ActionKind,
    pub tool_name: String,
    pub tool_category: String,
    /// Free-form JSON object; bounded only by the transport body cap.
    #[serde(default)]
    pub tool_input: serde_json::Value,
}

// ─── Decision ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

/// Outcome of one enforcement evaluation. `receipt_id` names the
/// `ACTION_ALLOWED` / `ACTION_DENIED` audit record for this decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: String,
    pub decision: Verdict,
    /// `"ALLOWED"` or a denial reason from the closed vocabulary.
    pub reason: String,
    pub receipt_id: String,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.decision == Verdict::Allow
    }
}

// ─── Receipts ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptEvent {
    CapIssued,
    CapRevoked,
    ActionAttempt,
    ActionAllowed,
    ActionDenied,
}

/// Immutable audit record. Appended to the log before the triggering
/// operation returns; never mutated or deleted by core logic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub receipt_id: String,
    pub ts: String,
    pub event: ReceiptEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default)]
    pub summary: ReceiptSummary,
    /// JSON-safe side data (template tags, tool names, budget ceilings).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Ed25519 signature over the proof-less receipt (`receipt` domain).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReceiptSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_reason: Option<String>,
}

impl Receipt {
    /// A fresh receipt with a unique id and the current timestamp.
    /// Optional fields start empty; the emitting site fills them in.
    pub fn new(event: ReceiptEvent) -> Self {
        Receipt {
            receipt_id: new_receipt_id(),
            ts: now_rfc3339(),
            event,
            cap_id: None,
            request_id: None,
            agent_id: None,
            vendor: None,
            summary: ReceiptSummary::default(),
            meta: serde_json::Map::new(),
            proof: None,
        }
    }

    /// The signed body: this receipt with `proof` removed.
    pub fn proofless(&self) -> Receipt {
        let mut body = self.clone();
        body.proof = None;
        body
    }
}

// ─── Id and time helpers ─────────────────────────────────────────────────────

pub fn new_cap_id() -> String {
    let bytes: [u8; 16] = rand::random();
    format!("cap_{}", hex::encode(bytes))
}

pub fn new_receipt_id() -> String {
    let bytes: [u8; 16] = rand::random();
    format!("rcpt_{}", hex::encode(bytes))
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A structurally valid spend capability for unit tests. Pubkeys and
/// proof are left empty; callers fill in what they exercise.
#[cfg(test)]
pub(crate) fn sample_capability() -> Capability {
    Capability {
        version: CAPDOC_VERSION.into(),
        cap_id: "cap_0123456789abcdef".into(),
        issued_at: "2026-08-01T00:00:00.000Z".into(),
        expires_at: "2026-08-02T00:00:00.000Z".into(),
        not_before: None,
        issuer: IssuerRef {
            id: "issuer:test".into(),
            pubkey: String::new(),
        },
        subject: SubjectRef {
            id: "user:local".into(),
        },
        executor: ExecutorRef {
            agent_id: "agent:demo".into(),
            agent_pubkey: String::new(),
        },
        resource: Resource {
            kind: ResourceType::Spend,
            vendor: "sandboxmart".into(),
        },
        actions: vec![ActionKind::Spend],
        constraints: Constraints::Spend(SpendConstraints {
            currency: "USD".into(),
            max_amount_cents: 5000,
            allowed_vendors: vec!["sandboxmart".into()],
            blocked_categories: vec!["alcohol".into()],
        }),
        revocation: RevocationPolicy {
            mode: RevocationMode::Strict,
            oracle: "local".into(),
        },
        proof: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proofless_strips_only_proof() {
        let mut cap = sample_cap();
        cap.proof = Some(Proof::ed25519("c2ln".into()));
        let body = cap.proofless();
        assert!(body.proof.is_none());
        assert_eq!(body.cap_id, cap.cap_id);
        assert_eq!(body.constraints, cap.constraints);
    }

    #[test]
    fn test_capability_rejects_unknown_fields() {
        let mut v = serde_json::to_value(sample_cap()).unwrap();
        v.as_object_mut()
            .unwrap()
            .insert("extra".into(), serde_json::json!(1));
        assert!(serde_json::from_value::<Capability>(v).is_err());
    }

    #[test]
    fn test_constraint_tag_round_trip() {
        let c = Constraints::Spend(SpendConstraints {
            currency: "USD".into(),
            max_amount_cents: 5000,
            allowed_vendors: vec!["sandboxmart".into()],
            blocked_categories: vec![],
        });
        let v = serde_json::to_value(&c).unwrap();
        assert!(v.get("spend").is_some());
        let back: Constraints = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_receipt_event_wire_form() {
        let v = serde_json::to_value(ReceiptEvent::ActionAttempt).unwrap();
        assert_eq!(v, serde_json::json!("ACTION_ATTEMPT"));
    }

    #[test]
    fn test_ids_are_unique_and_prefixed() {
        let a = new_cap_id();
        let b = new_cap_id();
        assert_ne!(a, b);
        assert!(a.starts_with("cap_"));
        assert!(new_receipt_id().starts_with("rcpt_"));
    }

    fn sample_cap() -> Capability {
        sample_capability()
    }
}
