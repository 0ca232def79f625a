//! Capability issuance.
//!
//! Issuance constructs the unsigned document, signs the proof-less body
//! under the `capdoc` domain, then runs two self-checks before anything
//! is persisted: the complete signed record is re-validated against the
//! capability schema, and the fresh signature is verified against the
//! issuer's own public key. Only then is the capability stored and a
//! `CAP_ISSUED` receipt appended.

use chrono::{Duration, SecondsFormat, Utc};

use super::canonical::Domain;
use super::engine::CapEngine;
use super::error::CapError;
use super::keys;
use super::schema;
use super::types::*;

/// Capability lifetime granted at issuance.
const CAP_TTL_HOURS: i64 = 24;

/// Subject recorded when the issuance input names none.
const DEFAULT_SUBJECT: &str = "user:local";

impl CapEngine {
    /// Mint a spend capability bound to the given agent identity.
    pub fn issue_spend_capability(&self, req: IssueRequest) -> Result<Capability, CapError> {
        self.issue(req, ActionKind::Spend)
    }

    /// Mint a tool-call capability bound to the given agent identity.
    pub fn issue_tool_call_capability(&self, req: IssueRequest) -> Result<Capability, CapError> {
        self.issue(req, ActionKind::ToolCall)
    }

    fn issue(&self, mut req: IssueRequest, kind: ActionKind) -> Result<Capability, CapError> {
        schema::validate_issue(&mut req, kind)?;

        // The issuance API only mints spend and tool_call resources;
        // sandbox_merchant and generic are admitted by the document
        // schema for verification but are refused here. validate_issue
        // already pinned the constraint variant to `kind`.
        let resource = match &req.constraints {
            Constraints::Spend(c) => Resource {
                kind: ResourceType::Spend,
                // First allowed vendor; validated non-empty above.
                vendor: c.allowed_vendors[0].clone(),
            },
            Constraints::ToolCall(_) => Resource {
                kind: ResourceType::ToolCall,
                vendor: "local".to_string(),
            },
        };

        let now = Utc::now();
        let mut cap = Capability {
            version: CAPDOC_VERSION.to_string(),
            cap_id: new_cap_id(),
            issued_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            expires_at: (now + Duration::hours(CAP_TTL_HOURS))
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            not_before: None,
            issuer: IssuerRef {
                id: self.identity.issuer_id.clone(),
                pubkey: self.identity.pubkey_b64(),
            },
            subject: SubjectRef {
                id: req.subject_id.unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            },
            executor: ExecutorRef {
                agent_id: req.agent_id.clone(),
                agent_pubkey: req.agent_pubkey.clone(),
            },
            resource,
            actions: vec![kind],
            constraints: req.constraints,
            revocation: RevocationPolicy {
                mode: RevocationMode::Strict,
                oracle: self.identity.issuer_id.clone(),
            },
            proof: None,
        };

        let sig = keys::sign(&cap, &self.identity.signing_key, Domain::CapDoc)
            .map_err(|e| CapError::SigningFailure(e.to_string()))?;
        cap.proof = Some(Proof::ed25519(sig.clone()));

        // Defense against drift between construction and validator.
        schema::validate_capability(&cap)
            .map_err(|e| CapError::CapdocSchemaFailure(e.to_string()))?;

        // Defense against signing-path regressions.
        match keys::verify(&cap.proofless(), &sig, &cap.issuer.pubkey, Domain::CapDoc) {
            Ok(true) => {}
            Ok(false) => {
                return Err(CapError::SigningFailure(
                    "freshly produced signature failed self-verification".into(),
                ));
            }
            Err(e) => return Err(CapError::SigningFailure(e.to_string())),
        }

        self.store.insert_capability(&cap)?;

        let mut receipt = Receipt::new(ReceiptEvent::CapIssued);
        receipt.cap_id = Some(cap.cap_id.clone());
        receipt.agent_id = Some(cap.executor.agent_id.clone());
        receipt.meta.insert(
            "template_tag".into(),
            serde_json::Value::String(req.template_tag.clone()),
        );
        match &cap.constraints {
            Constraints::Spend(c) => {
                receipt.vendor = Some(cap.resource.vendor.clone());
                receipt.summary.amount_cents = Some(c.max_amount_cents);
            }
            Constraints::ToolCall(c) => {
                receipt.meta.insert(
                    "allowed_tools".into(),
                    serde_json::Value::from(c.allowed_tools.len()),
                );
            }
        }
        self.emit(receipt)?;

        tracing::info!(
            cap = %cap.cap_id,
            agent = %cap.executor.agent_id,
            template = %req.template_tag,
            "capability issued"
        );
        Ok(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::keys::IssuerIdentity;
    use crate::cap::store::CapStore;

    fn test_engine() -> (tempfile::TempDir, CapEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = CapStore::open(dir.path()).unwrap();
        let identity = IssuerIdentity::load_or_generate(dir.path()).unwrap();
        (dir, CapEngine::new(store, identity))
    }

    fn agent_pubkey() -> String {
        let key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        keys::b64_encode(key.verifying_key().as_bytes())
    }

    fn spend_input(pubkey: &str) -> IssueRequest {
        IssueRequest {
            template_tag: "spend".into(),
            agent_id: "agent:demo".into(),
            agent_pubkey: pubkey.to_string(),
            subject_id: None,
            constraints: Constraints::Spend(SpendConstraints {
                currency: "USD".into(),
                max_amount_cents: 5000,
                allowed_vendors: vec!["SandboxMart".into(), "cornerstore".into()],
                blocked_categories: vec!["alcohol".into(), "tobacco".into(), "gift_cards".into()],
            }),
        }
    }

    #[test]
    fn test_issue_spend_signs_and_persists() {
        let (_dir, engine) = test_engine();
        let pubkey = agent_pubkey();
        let cap = engine.issue_spend_capability(spend_input(&pubkey)).unwrap();

        assert_eq!(cap.version, CAPDOC_VERSION);
        assert_eq!(cap.actions, vec![ActionKind::Spend]);
        assert_eq!(cap.executor.agent_pubkey, pubkey);
        assert_eq!(cap.subject.id, "user:local");
        // Vendor pinned to the first allowed vendor, post-normalization.
        assert_eq!(cap.resource.vendor, "sandboxmart");

        // Signature verifies against the issuer key on the proof-less body.
        let proof = cap.proof.clone().unwrap();
        assert_eq!(proof.alg, PROOF_ALG);
        assert!(keys::verify(
            &cap.proofless(),
            &proof.sig,
            &cap.issuer.pubkey,
            Domain::CapDoc
        )
        .unwrap());

        // Persisted.
        assert_eq!(engine.store().capability(&cap.cap_id).unwrap(), cap);
    }

    #[test]
    fn test_issue_emits_cap_issued_receipt() {
        let (_dir, engine) = test_engine();
        let cap = engine
            .issue_spend_capability(spend_input(&agent_pubkey()))
            .unwrap();

        let receipts = engine.list_receipts(10, None).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].event, ReceiptEvent::CapIssued);
        assert_eq!(receipts[0].cap_id.as_deref(), Some(cap.cap_id.as_str()));
        assert_eq!(receipts[0].agent_id.as_deref(), Some("agent:demo"));
        // Budget ceiling recorded in the summary.
        assert_eq!(receipts[0].summary.amount_cents, Some(5000));
    }

    #[test]
    fn test_issue_grants_24h_window() {
        let (_dir, engine) = test_engine();
        let cap = engine
            .issue_spend_capability(spend_input(&agent_pubkey()))
            .unwrap();

        let issued = schema::parse_ts(&cap.issued_at).unwrap();
        let expires = schema::parse_ts(&cap.expires_at).unwrap();
        assert_eq!(expires - issued, Duration::hours(24));
        assert!(cap.not_before.is_none());
    }

    #[test]
    fn test_issue_tool_call_capability() {
        let (_dir, engine) = test_engine();
        let cap = engine
            .issue_tool_call_capability(IssueRequest {
                template_tag: "tool_call".into(),
                agent_id: "agent:demo".into(),
                agent_pubkey: agent_pubkey(),
                subject_id: Some("user:kai".into()),
                constraints: Constraints::ToolCall(ToolCallConstraints {
                    allowed_tools: vec!["WebSearch".into()],
                    blocked_tool_categories: vec!["Shell".into()],
                    max_calls: Some(100),
                }),
            })
            .unwrap();

        assert_eq!(cap.actions, vec![ActionKind::ToolCall]);
        assert_eq!(cap.resource.kind, ResourceType::ToolCall);
        assert_eq!(cap.resource.vendor, "local");
        assert_eq!(cap.subject.id, "user:kai");
        let Constraints::ToolCall(c) = &cap.constraints else {
            unreachable!()
        };
        assert_eq!(c.allowed_tools, vec!["websearch"]);
        assert_eq!(c.blocked_tool_categories, vec!["shell"]);
    }

    #[test]
    fn test_issue_rejects_wrong_template_on_endpoint() {
        let (_dir, engine) = test_engine();
        let mut input = spend_input(&agent_pubkey());
        input.template_tag = "generic".into();
        let err = engine.issue_spend_capability(input).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        // A spend template on the tool endpoint is refused too.
        let err = engine
            .issue_tool_call_capability(spend_input(&agent_pubkey()))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_issue_rejects_invalid_input_without_side_effects() {
        let (_dir, engine) = test_engine();
        let mut input = spend_input(&agent_pubkey());
        if let Constraints::Spend(c) = &mut input.constraints {
            c.max_amount_cents = 0;
        }
        assert!(engine.issue_spend_capability(input).is_err());
        assert!(engine.list_capabilities().is_empty());
        assert!(engine.list_receipts(10, None).unwrap().is_empty());
    }

    #[test]
    fn test_issued_caps_are_distinct() {
        let (_dir, engine) = test_engine();
        let pubkey = agent_pubkey();
        let a = engine.issue_spend_capability(spend_input(&pubkey)).unwrap();
        let b = engine.issue_spend_capability(spend_input(&pubkey)).unwrap();
        assert_ne!(a.cap_id, b.cap_id);
        assert_eq!(engine.list_capabilities().len(), 2);
    }
}
