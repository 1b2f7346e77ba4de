//! Management operations: storing, uploading, removing and reviewing scripts.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::registry::{ReconcileReport, ScriptRegistry};
use crate::repository::ContentStore;
use crate::script::{Origin, Parameter, ScriptRecord, sanitize_script_id};
use crate::security::{ApprovalGate, ApprovalRecord, Capability, PrivilegeCheck, require};

/// A script as submitted from an editor or an import
#[derive(Debug, Clone, Default)]
pub struct ScriptDraft {
    pub id: String,
    pub display_name: String,
    pub comment: String,
    pub body: String,
    pub parameters: Vec<Parameter>,
    pub restricted_to_privileged_users: bool,
    pub only_controller_node: bool,
    /// Set for scripts imported from a catalog
    pub origin: Option<Origin>,
}

impl ScriptDraft {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            ..Self::default()
        }
    }
}

pub struct ScriptManager {
    registry: Arc<ScriptRegistry>,
    content: Arc<dyn ContentStore>,
    gate: Arc<ApprovalGate>,
    extension: String,
}

impl std::fmt::Debug for ScriptManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptManager")
            .field("registry", &self.registry)
            .field("extension", &self.extension)
            .finish()
    }
}

impl ScriptManager {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        content: Arc<dyn ContentStore>,
        gate: Arc<ApprovalGate>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            content,
            gate,
            extension: extension.into(),
        }
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    /// Scripts the caller may see: everything for maintainers, unrestricted ones otherwise.
    pub fn visible_scripts(&self, caller: &dyn PrivilegeCheck) -> Vec<ScriptRecord> {
        if caller.has_capability(Capability::ConfigureScripts) {
            self.registry.list()
        } else {
            self.registry.list_unrestricted()
        }
    }

    /// Store a script body and its metadata. Returns the final id.
    pub fn save_script(&self, caller: &dyn PrivilegeCheck, draft: ScriptDraft) -> AppResult<String> {
        require(caller, Capability::ConfigureScripts)?;

        let catalog = draft.origin.as_ref().map(|o| o.catalog.as_str());
        let id = sanitize_script_id(&draft.id, catalog, &self.extension)?;

        let mut record = ScriptRecord::new(&id)
            .with_display_name(if draft.display_name.trim().is_empty() {
                id.clone()
            } else {
                draft.display_name
            })
            .with_comment(draft.comment)
            .with_parameters(draft.parameters)
            .restricted(draft.restricted_to_privileged_users)
            .controller_only(draft.only_controller_node);
        if let Some(origin) = draft.origin {
            record = record.with_origin(Origin {
                imported_at: Some(Utc::now()),
                ..origin
            });
        }
        record.validate()?;

        self.store(record, &draft.body)?;
        info!(script = %id, "Script saved");
        Ok(id)
    }

    /// Store an uploaded file. An existing record keeps its metadata apart from the
    /// restriction flag; a new one is named after the file.
    pub fn upload_script(
        &self,
        caller: &dyn PrivilegeCheck,
        file_name: &str,
        body: &str,
        restricted: bool,
    ) -> AppResult<String> {
        require(caller, Capability::ConfigureScripts)?;
        let id = sanitize_script_id(file_name, None, &self.extension)?;

        let record = match self.registry.get_by_id(&id) {
            Some(existing) => {
                debug!("Upload replaces the body of {}", id);
                ScriptRecord {
                    restricted_to_privileged_users: restricted,
                    available: true,
                    ..existing
                }
            }
            None => ScriptRecord::new(&id).restricted(restricted),
        };
        self.store(record, body)?;
        info!(script = %id, "Script uploaded");
        Ok(id)
    }

    /// Write the body, then the record. A failed record save puts the previous body back.
    fn store(&self, record: ScriptRecord, body: &str) -> AppResult<ScriptRecord> {
        let id = record.id.clone();
        let previous = self.content.read_body(&id);
        self.content.write_body(&id, body)?;

        let stored = match self.registry.add_or_replace(record) {
            Ok(stored) => stored,
            Err(e) => {
                let restored = match previous {
                    Ok(Some(old)) => self.content.write_body(&id, &old),
                    Ok(None) => self.content.delete(&id).map(|_| ()),
                    Err(read_err) => Err(read_err),
                };
                if let Err(restore_err) = restored {
                    warn!("Cannot restore the body of {}: {}", id, restore_err);
                }
                return Err(e);
            }
        };
        self.gate.register_if_unknown(body)?;
        Ok(stored)
    }

    /// Delete the body, then the record.
    pub fn remove_script(&self, caller: &dyn PrivilegeCheck, id: &str) -> AppResult<()> {
        require(caller, Capability::ConfigureScripts)?;
        if self.registry.get_by_id(id).is_none() {
            return Err(AppError::script_not_found(id));
        }
        self.content.delete(id)?;
        self.registry.remove(id)?;
        info!(script = %id, "Script removed");
        Ok(())
    }

    pub fn approve(&self, caller: &dyn PrivilegeCheck, hash: &str) -> AppResult<()> {
        self.gate.approve(hash, caller)
    }

    pub fn reject(&self, caller: &dyn PrivilegeCheck, hash: &str) -> AppResult<()> {
        self.gate.reject(hash, caller)
    }

    pub fn pending_approvals(&self) -> Vec<(String, ApprovalRecord)> {
        self.gate.pending()
    }

    /// Bring the registry in line with the content store and queue every stored body for
    /// review. Run once at startup.
    pub fn synchronize(&self) -> AppResult<ReconcileReport> {
        let report = self.registry.reconcile_with_store()?;
        if !report.is_empty() {
            info!(
                added = report.added.len(),
                unavailable = report.marked_unavailable.len(),
                restored = report.restored.len(),
                "Registry reconciled with script directory"
            );
        }

        for id in self.content.list()? {
            match self.content.read_body(&id) {
                Ok(Some(body)) => self.gate.register_if_unknown(&body)?,
                Ok(None) => {}
                Err(e) => warn!("Skipping approval of {}: {}", id, e),
            }
        }
        Ok(report)
    }
}
