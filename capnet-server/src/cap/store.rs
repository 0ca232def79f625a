//! File-backed persistence for capabilities, revocations, and the audit
//! log.
//!
//! Layout inside the data directory:
//! - `capabilities.json` — object mapping `cap_id` to capability,
//!   atomically swapped on each write
//! - `revocations.json` — array of revoked `cap_id`s, atomically swapped
//! - `issuer_keys.json` — written once at generation (see `keys`)
//! - `audit.log` — newline-delimited JSON receipts, append-only
//!
//! Replace-whole artifacts are written to a temp file and renamed, so a
//! crash mid-write yields either the old snapshot or the new one.
//! Readers tolerate malformed trailing audit records and skip them; a
//! corrupt capability index degrades to an empty index with a warning
//! so the system can still issue new capabilities. A corrupt revocation
//! set is a hard error: silently dropping revocations would un-revoke.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::error::CapError;
use super::schema;
use super::types::{Capability, Receipt};

const CAPS_FILE: &str = "capabilities.json";
const REVOCATIONS_FILE: &str = "revocations.json";
const AUDIT_FILE: &str = "audit.log";

/// Write `bytes` to `path` via temp-file-plus-rename. In-place writes
/// are forbidden for replace-whole artifacts.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    let tmp = path.with_file_name(name);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

struct StoreState {
    caps: BTreeMap<String, Capability>,
    revoked: BTreeSet<String>,
}

/// The only I/O-bearing component of the core. All mutation of
/// process-wide state funnels through this store; consumers hold read
/// snapshots for the duration of one evaluation.
pub struct CapStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl CapStore {
    /// Open (or initialize) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CapError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let caps = match fs::read_to_string(dir.join(CAPS_FILE)) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, Capability>>(&raw) {
                Ok(caps) => caps,
                Err(e) => {
                    tracing::warn!(error = %e, "capability index unreadable, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let revoked = match fs::read_to_string(dir.join(REVOCATIONS_FILE)) {
            Ok(raw) => serde_json::from_str::<Vec<String>>(&raw)
                .map_err(|e| CapError::StoreError(format!("revocation set unreadable: {e}")))?
                .into_iter()
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            caps = caps.len(),
            revoked = revoked.len(),
            dir = %dir.display(),
            "store opened"
        );
        Ok(CapStore {
            dir,
            state: Mutex::new(StoreState { caps, revoked }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ─── Capability index ────────────────────────────────────────────────

    /// Insert (or replace) a capability and atomically persist the index.
    pub fn insert_capability(&self, cap: &Capability) -> Result<(), CapError> {
        let mut state = self.state.lock();
        state.caps.insert(cap.cap_id.clone(), cap.clone());
        self.persist_caps(&state)
    }

    pub fn capability(&self, cap_id: &str) -> Option<Capability> {
        self.state.lock().caps.get(cap_id).cloned()
    }

    /// Snapshot of every capability with its revocation flag.
    pub fn list_capabilities(&self) -> Vec<(Capability, bool)> {
        let state = self.state.lock();
        state
            .caps
            .values()
            .map(|cap| (cap.clone(), state.revoked.contains(&cap.cap_id)))
            .collect()
    }

    /// Find the capability bound to `(agent_id, agent_pubkey)`.
    ///
    /// Matches both executor fields exactly, then orders by revocation
    /// flag ascending (unrevoked first), `issued_at` descending (newest
    /// first), `expires_at` ascending, and `cap_id` as a final tiebreak
    /// so the order is total and stable. Revoked capabilities are kept
    /// in the result so enforcement can surface `REVOKED` instead of
    /// the less informative `NO_CAPABILITY`.
    pub fn find_cap_for_agent(
        &self,
        agent_id: &str,
        agent_pubkey: &str,
    ) -> Option<(Capability, bool)> {
        let state = self.state.lock();
        let mut matches: Vec<(Capability, bool)> = state
            .caps
            .values()
            .filter(|cap| {
                cap.executor.agent_id == agent_id && cap.executor.agent_pubkey == agent_pubkey
            })
            .map(|cap| (cap.clone(), state.revoked.contains(&cap.cap_id)))
            .collect();
        drop(state);

        matches.sort_by(|(a, a_revoked), (b, b_revoked)| {
            a_revoked
                .cmp(b_revoked)
                .then_with(|| cmp_ts_desc(&a.issued_at, &b.issued_at))
                .then_with(|| cmp_ts_asc(&a.expires_at, &b.expires_at))
                .then_with(|| a.cap_id.cmp(&b.cap_id))
        });
        matches.into_iter().next()
    }

    // ─── Revocation set ──────────────────────────────────────────────────

    pub fn is_revoked(&self, cap_id: &str) -> bool {
        self.state.lock().revoked.contains(cap_id)
    }

    /// Add a cap_id to the revocation set and atomically persist it.
    /// The set is monotone: entries are never removed. Returns whether
    /// the entry was newly inserted.
    pub fn add_revocation(&self, cap_id: &str) -> Result<bool, CapError> {
        let mut state = self.state.lock();
        if !state.revoked.insert(cap_id.to_string()) {
            return Ok(false);
        }
        self.persist_revocations(&state)?;
        Ok(true)
    }

    // ─── Audit log ───────────────────────────────────────────────────────

    /// Append one receipt to the audit log and flush it to disk before
    /// returning. Receipts are never mutated or deleted.
    pub fn append_receipt(&self, receipt: &Receipt) -> Result<(), CapError> {
        // Serialize first so a bad record can never half-land in the log.
        let mut line = serde_json::to_string(receipt)
            .map_err(|e| CapError::StoreError(format!("receipt serialization: {e}")))?;
        line.push('\n');

        let _guard = self.state.lock();
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(AUDIT_FILE))?;
        f.write_all(line.as_bytes())?;
        f.flush()?;
        Ok(())
    }

    /// Read receipts from the audit log in on-disk (emission) order.
    ///
    /// Malformed lines are skipped, not fatal: a crash can truncate the
    /// final record. With `since`, only entries strictly after the
    /// receipt with that id are returned (first `limit` of them);
    /// without it, the most recent `limit` entries.
    pub fn read_receipts(&self, limit: usize, since: Option<&str>) -> Result<Vec<Receipt>, CapError> {
        let file = match fs::File::open(self.dir.join(AUDIT_FILE)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut all = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Receipt>(&line) {
                Ok(receipt) => all.push(receipt),
                Err(e) => {
                    tracing::warn!(line = lineno + 1, error = %e, "skipping malformed audit record");
                }
            }
        }

        let out: Vec<Receipt> = match since {
            Some(id) => all
                .iter()
                .position(|r| r.receipt_id == id)
                .map(|pos| all.into_iter().skip(pos + 1).take(limit).collect())
                .unwrap_or_default(),
            None => {
                let skip = all.len().saturating_sub(limit);
                all.into_iter().skip(skip).collect()
            }
        };
        Ok(out)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn persist_caps(&self, state: &StoreState) -> Result<(), CapError> {
        let json = serde_json::to_vec_pretty(&state.caps)
            .map_err(|e| CapError::StoreError(e.to_string()))?;
        write_atomic(&self.dir.join(CAPS_FILE), &json)?;
        Ok(())
    }

    fn persist_revocations(&self, state: &StoreState) -> Result<(), CapError> {
        let list: Vec<&String> = state.revoked.iter().collect();
        let json =
            serde_json::to_vec_pretty(&list).map_err(|e| CapError::StoreError(e.to_string()))?;
        write_atomic(&self.dir.join(REVOCATIONS_FILE), &json)?;
        Ok(())
    }
}

fn cmp_ts_asc(a: &str, b: &str) -> Ordering {
    match (schema::parse_ts(a), schema::parse_ts(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        // Parseable timestamps sort ahead of garbage in either direction.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn cmp_ts_desc(a: &str, b: &str) -> Ordering {
    match (schema::parse_ts(a), schema::parse_ts(b)) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::types::{sample_capability, ReceiptEvent};

    fn store() -> (tempfile::TempDir, CapStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CapStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn cap_with(cap_id: &str, issued_at: &str, expires_at: &str) -> Capability {
        let mut cap = sample_capability();
        cap.cap_id = cap_id.to_string();
        cap.issued_at = issued_at.to_string();
        cap.expires_at = expires_at.to_string();
        cap
    }

    #[test]
    fn test_insert_and_reload() {
        let (dir, store) = store();
        let cap = sample_capability();
        store.insert_capability(&cap).unwrap();

        let reopened = CapStore::open(dir.path()).unwrap();
        assert_eq!(reopened.capability(&cap.cap_id).unwrap(), cap);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let (dir, store) = store();
        store.insert_capability(&sample_capability()).unwrap();
        assert!(dir.path().join(CAPS_FILE).exists());
        assert!(!dir.path().join("capabilities.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_index_degrades_to_empty() {
        let (dir, store) = store();
        store.insert_capability(&sample_capability()).unwrap();
        drop(store);

        fs::write(dir.path().join(CAPS_FILE), b"{ not json").unwrap();
        let reopened = CapStore::open(dir.path()).unwrap();
        assert!(reopened.list_capabilities().is_empty());

        // Still able to persist fresh capabilities after corruption.
        reopened.insert_capability(&sample_capability()).unwrap();
        assert_eq!(reopened.list_capabilities().len(), 1);
    }

    #[test]
    fn test_corrupt_revocation_set_is_fatal() {
        let (dir, store) = store();
        store.add_revocation("cap_dead0000").unwrap();
        drop(store);

        fs::write(dir.path().join(REVOCATIONS_FILE), b"[ oops").unwrap();
        assert!(CapStore::open(dir.path()).is_err());
    }

    #[test]
    fn test_revocation_is_monotone_across_reopen() {
        let (dir, store) = store();
        store.add_revocation("cap_12345678").unwrap();
        drop(store);

        let reopened = CapStore::open(dir.path()).unwrap();
        assert!(reopened.is_revoked("cap_12345678"));
        assert!(!reopened.is_revoked("cap_87654321"));
    }

    #[test]
    fn test_audit_log_appends_in_order() {
        let (_dir, store) = store();
        for i in 0..5 {
            let mut r = Receipt::new(ReceiptEvent::ActionAttempt);
            r.request_id = Some(format!("req-{i}"));
            store.append_receipt(&r).unwrap();
        }
        let receipts = store.read_receipts(100, None).unwrap();
        assert_eq!(receipts.len(), 5);
        let ids: Vec<_> = receipts
            .iter()
            .map(|r| r.request_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["req-0", "req-1", "req-2", "req-3", "req-4"]);
    }

    #[test]
    fn test_audit_log_skips_malformed_trailing_record() {
        let (dir, store) = store();
        let r = Receipt::new(ReceiptEvent::CapIssued);
        store.append_receipt(&r).unwrap();

        // Simulate a crash mid-append.
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(AUDIT_FILE))
            .unwrap();
        f.write_all(b"{\"receipt_id\":\"rcpt_trunc").unwrap();
        drop(f);

        let receipts = store.read_receipts(100, None).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].receipt_id, r.receipt_id);
    }

    #[test]
    fn test_read_receipts_limit_and_since() {
        let (_dir, store) = store();
        let mut ids = Vec::new();
        for _ in 0..6 {
            let r = Receipt::new(ReceiptEvent::ActionAttempt);
            ids.push(r.receipt_id.clone());
            store.append_receipt(&r).unwrap();
        }

        // Without since: most recent `limit`.
        let tail = store.read_receipts(2, None).unwrap();
        assert_eq!(tail[0].receipt_id, ids[4]);
        assert_eq!(tail[1].receipt_id, ids[5]);

        // With since: strictly after the named receipt.
        let after = store.read_receipts(10, Some(&ids[2])).unwrap();
        let got: Vec<_> = after.iter().map(|r| r.receipt_id.clone()).collect();
        assert_eq!(got, ids[3..].to_vec());

        // Unknown since id yields nothing.
        assert!(store.read_receipts(10, Some("rcpt_missing")).unwrap().is_empty());
    }

    #[test]
    fn test_find_cap_exact_executor_match_only() {
        let (_dir, store) = store();
        let mut cap = sample_capability();
        cap.executor.agent_pubkey = "AAAA".into();
        store.insert_capability(&cap).unwrap();

        assert!(store.find_cap_for_agent("agent:demo", "AAAA").is_some());
        assert!(store.find_cap_for_agent("agent:demo", "BBBB").is_none());
        assert!(store.find_cap_for_agent("agent:other", "AAAA").is_none());
    }

    #[test]
    fn test_find_cap_prefers_unrevoked_then_newest() {
        let (_dir, store) = store();
        let old = cap_with("cap_old00000", "2026-08-01T00:00:00Z", "2026-08-02T00:00:00Z");
        let new = cap_with("cap_new00000", "2026-08-01T06:00:00Z", "2026-08-02T00:00:00Z");
        store.insert_capability(&old).unwrap();
        store.insert_capability(&new).unwrap();

        // Newest issued_at wins.
        let (found, revoked) = store
            .find_cap_for_agent("agent:demo", "")
            .unwrap();
        assert_eq!(found.cap_id, "cap_new00000");
        assert!(!revoked);

        // Revoking the newest moves the older, unrevoked one to the head.
        store.add_revocation("cap_new00000").unwrap();
        let (found, revoked) = store.find_cap_for_agent("agent:demo", "").unwrap();
        assert_eq!(found.cap_id, "cap_old00000");
        assert!(!revoked);

        // With everything revoked, a revoked cap is still returned.
        store.add_revocation("cap_old00000").unwrap();
        let (found, revoked) = store.find_cap_for_agent("agent:demo", "").unwrap();
        assert_eq!(found.cap_id, "cap_new00000");
        assert!(revoked);
    }

    #[test]
    fn test_find_cap_tie_breaks_on_earlier_expiry() {
        let (_dir, store) = store();
        let a = cap_with("cap_aaaa0000", "2026-08-01T00:00:00Z", "2026-08-03T00:00:00Z");
        let b = cap_with("cap_bbbb0000", "2026-08-01T00:00:00Z", "2026-08-02T00:00:00Z");
        store.insert_capability(&a).unwrap();
        store.insert_capability(&b).unwrap();

        let (found, _) = store.find_cap_for_agent("agent:demo", "").unwrap();
        assert_eq!(found.cap_id, "cap_bbbb0000");
    }
}
