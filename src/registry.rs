//! The script registry: the catalog of script metadata, ordered by id.
//!
//! Mutations run under a single writer lock. Each one is applied to a copy of the current
//! snapshot, persisted through the [`MetadataStore`], and only then published, so readers
//! never observe a half-applied change and a failed save leaves memory and disk in step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, info};

use crate::error::AppResult;
use crate::repository::{ContentStore, MetadataStore};
use crate::script::{LOADED_FROM_DIRECTORY, ScriptMeta, ScriptRecord};

type Snapshot = Arc<BTreeMap<String, ScriptRecord>>;

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Files that had no record and got a synthesised one
    pub added: Vec<String>,
    /// Records whose file is missing, now marked unavailable
    pub marked_unavailable: Vec<String>,
    /// Unavailable records whose file is back
    pub restored: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.marked_unavailable.is_empty() && self.restored.is_empty()
    }
}

pub struct ScriptRegistry {
    snapshot: RwLock<Snapshot>,
    writer: Mutex<()>,
    metadata: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.current().len())
            .finish()
    }
}

impl ScriptRegistry {
    /// Build a registry from the persisted snapshot. Records are re-sorted by id; if the
    /// snapshot holds duplicates the later entry wins.
    pub fn load(
        metadata: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
    ) -> AppResult<Self> {
        let records = metadata.load_snapshot()?;
        let map: BTreeMap<String, ScriptRecord> = records
            .into_iter()
            .map(|mut r| {
                r.body = None;
                (r.id.clone(), r)
            })
            .collect();
        info!("Loaded {} script record(s)", map.len());

        Ok(Self {
            snapshot: RwLock::new(Arc::new(map)),
            writer: Mutex::new(()),
            metadata,
            content,
        })
    }

    fn current(&self) -> Snapshot {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Persist `next` and publish it. Must be called with the writer lock held.
    fn commit(&self, next: BTreeMap<String, ScriptRecord>) -> AppResult<()> {
        let records: Vec<ScriptRecord> = next.values().cloned().collect();
        if let Err(e) = self.metadata.save_snapshot(&records) {
            error!("Failed to persist script registry: {}", e);
            return Err(e);
        }
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(next);
        Ok(())
    }

    /// Exact lookup by id. The returned record has no body.
    pub fn get_by_id(&self, id: &str) -> Option<ScriptRecord> {
        self.current().get(id).cloned()
    }

    /// Lookup by id with the body loaded from the content store. `body` stays `None` when
    /// the store has no entry or cannot be read.
    pub fn get_with_body(&self, id: &str) -> Option<ScriptRecord> {
        let mut record = self.get_by_id(id)?;
        record.body = match self.content.read_body(id) {
            Ok(body) => body,
            Err(e) => {
                error!("Script source for {} could not be read: {}", id, e);
                None
            }
        };
        Some(record)
    }

    /// All records ordered by id
    pub fn list(&self) -> Vec<ScriptRecord> {
        self.current().values().cloned().collect()
    }

    /// Records that callers without the configure capability may select
    pub fn list_unrestricted(&self) -> Vec<ScriptRecord> {
        self.current()
            .values()
            .filter(|r| !r.restricted_to_privileged_users)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// Insert a record, or merge it over the stored one with the same id.
    pub fn add_or_replace(&self, record: ScriptRecord) -> AppResult<ScriptRecord> {
        record.validate()?;

        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.current()).clone();
        let stored = match next.get(&record.id) {
            Some(existing) => {
                debug!("Merging update into script {}", record.id);
                existing.merged_with(&record)
            }
            None => {
                debug!("Adding script {}", record.id);
                ScriptRecord {
                    body: None,
                    ..record
                }
            }
        };
        next.insert(stored.id.clone(), stored.clone());
        self.commit(next)?;
        Ok(stored)
    }

    /// Remove a record. Returns whether it existed. The script body is left to the caller.
    pub fn remove(&self, id: &str) -> AppResult<bool> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.current()).clone();
        if next.remove(id).is_none() {
            return Ok(false);
        }
        self.commit(next)?;
        info!("Removed script {}", id);
        Ok(true)
    }

    /// Align the registry with the set of script files present in storage.
    pub fn reconcile(&self, known_files: &BTreeSet<String>) -> AppResult<ReconcileReport> {
        self.reconcile_with(known_files, |_| None)
    }

    /// Reconcile against the content store's listing, using meta headers of newly found
    /// scripts to describe them.
    pub fn reconcile_with_store(&self) -> AppResult<ReconcileReport> {
        let known = self.content.list()?;
        let content = Arc::clone(&self.content);
        self.reconcile_with(&known, move |id| {
            content
                .read_body(id)
                .ok()
                .flatten()
                .and_then(|body| ScriptMeta::extract(&body))
        })
    }

    fn reconcile_with<F>(&self, known_files: &BTreeSet<String>, meta: F) -> AppResult<ReconcileReport>
    where
        F: Fn(&str) -> Option<ScriptMeta>,
    {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current();
        let mut next = (*current).clone();
        let mut report = ReconcileReport::default();

        for file in known_files {
            if next.contains_key(file) {
                continue;
            }
            let record = match meta(file) {
                Some(header) => header.into_record(file),
                None => ScriptRecord::new(file.as_str()).with_comment(LOADED_FROM_DIRECTORY),
            };
            debug!("Found unregistered script file {}", file);
            next.insert(file.clone(), record);
            report.added.push(file.clone());
        }

        for (id, record) in current.iter() {
            let present = known_files.contains(id);
            if !present && record.available {
                info!("Script {} is not available", id);
                next.insert(id.clone(), record.as_unavailable());
                report.marked_unavailable.push(id.clone());
            } else if present && !record.available {
                info!("Script {} is available again", id);
                next.insert(
                    id.clone(),
                    ScriptRecord {
                        available: true,
                        ..record.clone()
                    },
                );
                report.restored.push(id.clone());
            } else if !present && (record.restricted_to_privileged_users || record.only_controller_node) {
                next.insert(id.clone(), record.as_unavailable());
                report.marked_unavailable.push(id.clone());
            }
        }

        if !report.is_empty() {
            self.commit(next)?;
        }
        Ok(report)
    }
}
