//! Approval of script bodies for remote execution.
//!
//! Running a script on a node is remote code execution, so nothing whose exact text has not
//! been approved may be dispatched. State is keyed by the SHA-256 of the body: identical
//! bodies share approval regardless of script id, and any edit produces a new, pending hash.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::capabilities::{Capability, PrivilegeCheck, require};
use crate::error::{AppError, AppResult};
use crate::repository::{read_json, write_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub state: ApprovalState,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
}

impl ApprovalRecord {
    fn pending() -> Self {
        Self {
            state: ApprovalState::Pending,
            registered_at: Utc::now(),
            decided_at: None,
            decided_by: None,
        }
    }

    fn decide(&mut self, state: ApprovalState, by: &str) {
        self.state = state;
        self.decided_at = Some(Utc::now());
        self.decided_by = Some(by.to_string());
    }
}

pub type ApprovalTable = BTreeMap<String, ApprovalRecord>;

/// Persistence for the approval table.
pub trait ApprovalStore: Send + Sync {
    fn load(&self) -> AppResult<ApprovalTable>;
    fn save(&self, table: &ApprovalTable) -> AppResult<()>;
}

/// Approval table persisted as a JSON object keyed by body hash.
#[derive(Debug, Clone)]
pub struct JsonApprovalStore {
    path: PathBuf,
}

impl JsonApprovalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ApprovalStore for JsonApprovalStore {
    fn load(&self) -> AppResult<ApprovalTable> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, table: &ApprovalTable) -> AppResult<()> {
        write_json(&self.path, table)
    }
}

#[derive(Debug, Default)]
pub struct MemoryApprovalStore {
    table: Mutex<ApprovalTable>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for MemoryApprovalStore {
    fn load(&self) -> AppResult<ApprovalTable> {
        Ok(self.table.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, table: &ApprovalTable) -> AppResult<()> {
        *self.table.lock().unwrap_or_else(|e| e.into_inner()) = table.clone();
        Ok(())
    }
}

/// Stable content hash used as the approval key
pub fn hash_body(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ApprovalGate {
    table: Mutex<ApprovalTable>,
    store: Arc<dyn ApprovalStore>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.table.lock().map(|t| t.len()).unwrap_or_default();
        f.debug_struct("ApprovalGate").field("entries", &len).finish()
    }
}

impl ApprovalGate {
    pub fn load(store: Arc<dyn ApprovalStore>) -> AppResult<Self> {
        let table = store.load()?;
        debug!("Loaded {} approval entr(ies)", table.len());
        Ok(Self {
            table: Mutex::new(table),
            store,
        })
    }

    /// Apply `change` to a copy of the table, persist, then publish. Returns the closure's
    /// result; nothing is saved when the closure reports no change.
    fn mutate<R>(&self, change: impl FnOnce(&mut ApprovalTable) -> (bool, R)) -> AppResult<R> {
        let mut guard = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        let (changed, result) = change(&mut next);
        if changed {
            self.store.save(&next)?;
            *guard = next;
        }
        Ok(result)
    }

    /// Record `body` as pending if it has never been seen. Idempotent.
    pub fn register_if_unknown(&self, body: &str) -> AppResult<()> {
        let hash = hash_body(body);
        self.mutate(|table| {
            if table.contains_key(&hash) {
                (false, ())
            } else {
                info!(hash = %hash, "Script body queued for approval");
                table.insert(hash.clone(), ApprovalRecord::pending());
                (true, ())
            }
        })
    }

    /// Whether `body` may be executed.
    ///
    /// A body that is not approved yet is approved on the spot when
    /// `auto_approve_if_privileged` is set and the caller may approve scripts; otherwise it
    /// is queued as pending. Rejected bodies are never auto-approved.
    pub fn is_approved(
        &self,
        body: &str,
        auto_approve_if_privileged: bool,
        caller: &dyn PrivilegeCheck,
    ) -> AppResult<bool> {
        let hash = hash_body(body);
        let may_approve =
            auto_approve_if_privileged && caller.has_capability(Capability::ApproveScripts);
        let caller_name = caller.caller_name().to_string();

        self.mutate(|table| {
            let entry = table.get(&hash).map(|r| r.state);
            match entry {
                Some(ApprovalState::Approved) => (false, true),
                Some(ApprovalState::Rejected) => (false, false),
                Some(ApprovalState::Pending) | None if may_approve => {
                    info!(hash = %hash, approver = %caller_name, "Script body auto-approved");
                    let record = table.entry(hash.clone()).or_insert_with(ApprovalRecord::pending);
                    record.decide(ApprovalState::Approved, &caller_name);
                    (true, true)
                }
                Some(ApprovalState::Pending) => (false, false),
                None => {
                    table.insert(hash.clone(), ApprovalRecord::pending());
                    (true, false)
                }
            }
        })
    }

    /// Current state for a body, `None` if it was never registered.
    pub fn state_of(&self, body: &str) -> Option<ApprovalState> {
        self.state_of_hash(&hash_body(body))
    }

    pub fn state_of_hash(&self, hash: &str) -> Option<ApprovalState> {
        let guard = self.table.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(hash).map(|r| r.state)
    }

    pub fn record(&self, hash: &str) -> Option<ApprovalRecord> {
        let guard = self.table.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(hash).cloned()
    }

    /// Hashes waiting for a decision, oldest first.
    pub fn pending(&self) -> Vec<(String, ApprovalRecord)> {
        let guard = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<_> = guard
            .iter()
            .filter(|(_, r)| r.state == ApprovalState::Pending)
            .map(|(h, r)| (h.clone(), r.clone()))
            .collect();
        pending.sort_by_key(|(_, r)| r.registered_at);
        pending
    }

    pub fn approve(&self, hash: &str, caller: &dyn PrivilegeCheck) -> AppResult<()> {
        self.decide(hash, ApprovalState::Approved, caller)
    }

    pub fn reject(&self, hash: &str, caller: &dyn PrivilegeCheck) -> AppResult<()> {
        self.decide(hash, ApprovalState::Rejected, caller)
    }

    fn decide(
        &self,
        hash: &str,
        state: ApprovalState,
        caller: &dyn PrivilegeCheck,
    ) -> AppResult<()> {
        require(caller, Capability::ApproveScripts)?;
        let by = caller.caller_name().to_string();
        let found = self.mutate(|table| match table.get_mut(hash) {
            Some(record) => {
                record.decide(state, &by);
                (true, true)
            }
            None => (false, false),
        })?;

        if !found {
            warn!("Approval decision for unknown script hash {}", hash);
            return Err(AppError::not_found(format!("script hash {}", hash)));
        }
        info!(hash = %hash, decided_by = %by, state = ?state, "Script approval decided");
        Ok(())
    }
}
