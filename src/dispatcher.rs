//! Execution of scripts across cluster nodes.
//!
//! A request names a stored script and/or carries an inline body. The dispatcher resolves
//! the body and its parameters, checks approval, expands the target into nodes and fans
//! the body out to every node, collecting one entry per node in resolution order. A node
//! failure never aborts the others.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::evaluator::{Evaluation, NodeFault, RemoteEvaluator};
use crate::nodes::{BUILT_IN, NodeDirectory, NodeResolver};
use crate::registry::ScriptRegistry;
use crate::script::{Parameter, ScriptRecord};
use crate::security::{ApprovalGate, Capability, PrivilegeCheck, require};

/// Separator line framing each node's section of a rendered report
pub const SEPARATOR: &str = "___________________________________________";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Started by a person from the management surface
    #[default]
    Interactive,
    /// Started by automation such as a build step
    Unattended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub script_id: Option<String>,
    /// Inline body replacing the stored one
    pub body: Option<String>,
    pub target: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl ExecutionRequest {
    /// Run a stored script on the controller
    pub fn for_script(id: impl Into<String>) -> Self {
        Self {
            script_id: Some(id.into()),
            body: None,
            target: BUILT_IN.to_string(),
            parameters: Vec::new(),
            mode: ExecutionMode::Interactive,
        }
    }

    /// Run a body that is not stored
    pub fn ad_hoc(body: impl Into<String>) -> Self {
        Self {
            script_id: None,
            body: Some(body.into()),
            target: BUILT_IN.to_string(),
            parameters: Vec::new(),
            mode: ExecutionMode::Interactive,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn unattended(mut self) -> Self {
        self.mode = ExecutionMode::Unattended;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportStatus {
    Completed,
    /// The body awaits approval; nothing ran
    NotApproved,
    /// The script is known but its body is missing; nothing ran
    Unavailable,
}

/// What one node produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutput {
    pub node: String,
    pub output: String,
    pub terminal_value: serde_json::Value,
    pub error: Option<String>,
}

impl NodeOutput {
    fn from_result(node: String, result: Result<Evaluation, NodeFault>) -> Self {
        match result {
            Ok(eval) => Self {
                node,
                output: eval.output,
                terminal_value: eval.terminal_value,
                error: None,
            },
            Err(fault) => Self {
                node,
                output: String::new(),
                terminal_value: serde_json::Value::Null,
                error: Some(fault.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub script_id: Option<String>,
    pub target: String,
    pub status: ReportStatus,
    pub message: Option<String>,
    pub nodes: Vec<NodeOutput>,
}

impl ExecutionReport {
    fn empty(
        script_id: Option<String>,
        target: String,
        status: ReportStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            script_id,
            target,
            status,
            message: Some(message.into()),
            nodes: Vec::new(),
        }
    }

    /// Completed, no node failed and no node returned `false`.
    pub fn succeeded(&self) -> bool {
        self.status == ReportStatus::Completed
            && self
                .nodes
                .iter()
                .all(|n| n.error.is_none() && n.terminal_value != serde_json::Value::Bool(false))
    }

    /// Plain-text rendering with one banner per node.
    pub fn render_text(&self) -> String {
        let mut text = String::new();
        if let Some(message) = &self.message {
            text.push_str(message);
            text.push('\n');
        }
        if self.status != ReportStatus::Completed {
            return text;
        }
        for node in &self.nodes {
            text.push_str(SEPARATOR);
            text.push('\n');
            text.push_str(&format!("[{}]:\n", node.node));
            text.push_str(&node.output);
            if !node.output.is_empty() && !node.output.ends_with('\n') {
                text.push('\n');
            }
            if let Some(error) = &node.error {
                text.push_str(error);
                text.push('\n');
            } else if !node.terminal_value.is_null() {
                let value = match &node.terminal_value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                text.push_str(&format!("Result: {}\n", value));
            }
        }
        text.push_str(SEPARATOR);
        text.push('\n');
        text
    }
}

/// Runs scripts on the nodes a request targets.
pub struct ExecutionDispatcher {
    registry: Arc<ScriptRegistry>,
    gate: Arc<ApprovalGate>,
    directory: Arc<dyn NodeDirectory>,
    evaluator: Arc<dyn RemoteEvaluator>,
    max_parallel: usize,
    node_timeout: Option<Duration>,
}

impl std::fmt::Debug for ExecutionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionDispatcher")
            .field("max_parallel", &self.max_parallel)
            .field("node_timeout", &self.node_timeout)
            .finish()
    }
}

impl ExecutionDispatcher {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        gate: Arc<ApprovalGate>,
        directory: Arc<dyn NodeDirectory>,
        evaluator: Arc<dyn RemoteEvaluator>,
    ) -> Self {
        Self {
            registry,
            gate,
            directory,
            evaluator,
            max_parallel: 16,
            node_timeout: None,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    /// Execute `request` on behalf of `caller`.
    ///
    /// Authorization, lookup and storage problems are errors. An unapproved body or an
    /// unavailable script yields a report without node entries; per-node failures land in
    /// the matching entry's `error`.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        caller: &dyn PrivilegeCheck,
    ) -> AppResult<ExecutionReport> {
        require(caller, Capability::RunScripts)?;

        let ExecutionRequest {
            script_id,
            body: inline_body,
            target,
            parameters: overrides,
            mode,
        } = request;

        let record = match &script_id {
            Some(id) => Some(
                self.registry
                    .get_by_id(id)
                    .ok_or_else(|| AppError::script_not_found(id.clone()))?,
            ),
            None => None,
        };

        if let Some(record) = &record {
            if mode == ExecutionMode::Unattended && record.restricted_to_privileged_users {
                require(caller, Capability::ConfigureScripts)?;
            }
        }

        let body = match (inline_body, &record) {
            (Some(body), _) => body,
            (None, Some(record)) => match self.stored_body(record) {
                Some(body) => body,
                None => {
                    warn!("Script {} is not available", record.id);
                    return Ok(ExecutionReport::empty(
                        script_id,
                        target,
                        ReportStatus::Unavailable,
                        format!("Script {} is not available: its source is missing", record.id),
                    ));
                }
            },
            (None, None) => {
                return Err(AppError::invalid(
                    "request",
                    "either a script id or a body is required",
                ));
            }
        };

        let parameters = match &record {
            Some(record) => merge_parameters(&record.parameters, &overrides),
            None => overrides,
        };

        self.gate.register_if_unknown(&body)?;
        if !self.gate.is_approved(&body, true, caller)? {
            warn!(
                script = script_id.as_deref().unwrap_or("(ad hoc)"),
                "Script body is not approved, nothing was executed"
            );
            return Ok(ExecutionReport::empty(
                script_id,
                target,
                ReportStatus::NotApproved,
                "Script is not approved yet; an administrator must approve it before it can run",
            ));
        }

        let target = match &record {
            Some(record) if record.only_controller_node => BUILT_IN.to_string(),
            _ => target,
        };
        let nodes = NodeResolver::resolve(&target, &self.directory.list_known_nodes());
        info!(
            script = script_id.as_deref().unwrap_or("(ad hoc)"),
            target = %target,
            nodes = nodes.len(),
            "Dispatching script"
        );

        let body = body.as_str();
        let parameters = parameters.as_slice();
        let outputs: Vec<NodeOutput> = stream::iter(nodes)
            .map(|node| async move {
                let result = self.evaluate_on(&node, body, parameters).await;
                if let Err(fault) = &result {
                    warn!("Script failed on {}: {}", node, fault);
                } else {
                    debug!("Script finished on {}", node);
                }
                NodeOutput::from_result(node, result)
            })
            .buffered(self.max_parallel)
            .collect()
            .await;

        Ok(ExecutionReport {
            script_id,
            target,
            status: ReportStatus::Completed,
            message: None,
            nodes: outputs,
        })
    }

    fn stored_body(&self, record: &ScriptRecord) -> Option<String> {
        if !record.available {
            return None;
        }
        self.registry.get_with_body(&record.id).and_then(|r| r.body)
    }

    async fn evaluate_on(
        &self,
        node: &str,
        body: &str,
        parameters: &[Parameter],
    ) -> Result<Evaluation, NodeFault> {
        let call = self.evaluator.evaluate(node, body, parameters);
        match self.node_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(NodeFault::Timeout {
                    millis: limit.as_millis() as u64,
                }),
            },
            None => call.await,
        }
    }
}

/// Declared parameters in declared order, values overridden by name from the request.
/// Names the record does not declare are dropped.
pub fn merge_parameters(declared: &[Parameter], overrides: &[Parameter]) -> Vec<Parameter> {
    declared
        .iter()
        .map(|p| {
            let value = overrides
                .iter()
                .rev()
                .find(|o| o.name == p.name)
                .map(|o| o.value.clone())
                .unwrap_or_else(|| p.value.clone());
            Parameter::new(p.name.clone(), value)
        })
        .collect()
}
