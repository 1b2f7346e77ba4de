//! Evaluation of script bodies on cluster nodes.
//!
//! The controller evaluates in-process; agents are reached over HTTP. Both sit behind
//! [`RemoteEvaluator`] so the dispatcher does not care where a node lives.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, NodeEndpoint};
use crate::error::{AppError, AppResult};
use crate::js_engine::{self, EvalLimits};
use crate::nodes::{BUILT_IN, NodeDirectory, normalize_node_name};
use crate::script::Parameter;

pub use crate::js_engine::Evaluation;

/// Failure confined to a single node of a dispatch
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeFault {
    #[error("Unknown node: {node}")]
    UnknownNode { node: String },

    #[error("Node {node} is offline: {reason}")]
    Offline { node: String, reason: String },

    #[error("{message}")]
    Evaluation { message: String },

    #[error("Timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Transport error: {message}")]
    Transport { message: String },
}

/// Evaluates a body with its parameters on a named node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        node: &str,
        body: &str,
        parameters: &[Parameter],
    ) -> Result<Evaluation, NodeFault>;
}

/// Body of `POST /evaluate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub body: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// Reply of `POST /evaluate`; `error` is set when the script threw.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub terminal_value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<Evaluation, NodeFault>> for EvaluateResponse {
    fn from(result: Result<Evaluation, NodeFault>) -> Self {
        match result {
            Ok(eval) => Self {
                output: eval.output,
                terminal_value: eval.terminal_value,
                error: None,
            },
            Err(fault) => Self {
                output: String::new(),
                terminal_value: serde_json::Value::Null,
                error: Some(fault.to_string()),
            },
        }
    }
}

/// In-process QuickJS evaluation, off the async runtime.
#[derive(Debug, Clone, Default)]
pub struct LocalEvaluator {
    limits: EvalLimits,
}

impl LocalEvaluator {
    pub fn new(limits: EvalLimits) -> Self {
        Self { limits }
    }

    pub async fn run(&self, body: &str, parameters: &[Parameter]) -> Result<Evaluation, NodeFault> {
        let body = body.to_string();
        let parameters = parameters.to_vec();
        let limits = self.limits.clone();

        let joined = tokio::task::spawn_blocking(move || {
            js_engine::evaluate_with_limits(&body, &parameters, &limits)
        })
        .await;

        match joined {
            Ok(Ok(evaluation)) => Ok(evaluation),
            Ok(Err(message)) => Err(NodeFault::Evaluation { message }),
            Err(e) => Err(NodeFault::Evaluation {
                message: format!("Task execution error: {}", e),
            }),
        }
    }
}

#[async_trait]
impl RemoteEvaluator for LocalEvaluator {
    async fn evaluate(
        &self,
        _node: &str,
        body: &str,
        parameters: &[Parameter],
    ) -> Result<Evaluation, NodeFault> {
        self.run(body, parameters).await
    }
}

/// Reaches agents through their `/evaluate` endpoint.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(endpoints: &[NodeEndpoint], timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout,
            endpoints: endpoints
                .iter()
                .map(|e| (e.name.clone(), e.url.trim_end_matches('/').to_string()))
                .collect(),
        })
    }

    fn classify(&self, node: &str, err: reqwest::Error) -> NodeFault {
        if err.is_connect() {
            NodeFault::Offline {
                node: node.to_string(),
                reason: err.to_string(),
            }
        } else if err.is_timeout() {
            NodeFault::Timeout {
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            NodeFault::Transport {
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl RemoteEvaluator for HttpAgentClient {
    async fn evaluate(
        &self,
        node: &str,
        body: &str,
        parameters: &[Parameter],
    ) -> Result<Evaluation, NodeFault> {
        let base = self.endpoints.get(node).ok_or_else(|| NodeFault::UnknownNode {
            node: node.to_string(),
        })?;
        let url = format!("{}/evaluate", base);
        debug!("Sending script to {} at {}", node, url);

        let request = EvaluateRequest {
            body: body.to_string(),
            parameters: parameters.to_vec(),
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(node, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Agent {} answered {}", node, status);
            return Err(NodeFault::Transport {
                message: format!("agent {} answered {}", node, status),
            });
        }

        let reply: EvaluateResponse = response
            .json()
            .await
            .map_err(|e| self.classify(node, e))?;
        match reply.error {
            Some(error) if reply.output.is_empty() => Err(NodeFault::Evaluation { message: error }),
            Some(error) => Err(NodeFault::Evaluation {
                message: format!("{}\n{}", error, reply.output),
            }),
            None => Ok(Evaluation {
                output: reply.output,
                terminal_value: reply.terminal_value,
            }),
        }
    }
}

/// Routes the controller token to local evaluation and everything else to agents.
#[derive(Debug, Clone)]
pub struct ClusterEvaluator {
    local: LocalEvaluator,
    agents: HttpAgentClient,
}

impl ClusterEvaluator {
    pub fn new(local: LocalEvaluator, agents: HttpAgentClient) -> Self {
        Self { local, agents }
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        Ok(Self::new(
            LocalEvaluator::default(),
            HttpAgentClient::new(&config.nodes, config.node_timeout())?,
        ))
    }
}

#[async_trait]
impl RemoteEvaluator for ClusterEvaluator {
    async fn evaluate(
        &self,
        node: &str,
        body: &str,
        parameters: &[Parameter],
    ) -> Result<Evaluation, NodeFault> {
        if normalize_node_name(node) == BUILT_IN {
            self.local.run(body, parameters).await
        } else {
            self.agents.evaluate(node, body, parameters).await
        }
    }
}

/// Node directory backed by the configured agent endpoints.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredNodes {
    names: Vec<String>,
}

impl ConfiguredNodes {
    pub fn from_config(config: &Config) -> Self {
        Self {
            names: config.nodes.iter().map(|n| n.name.clone()).collect(),
        }
    }
}

impl NodeDirectory for ConfiguredNodes {
    fn list_known_nodes(&self) -> Vec<String> {
        self.names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, url: &str) -> NodeEndpoint {
        NodeEndpoint {
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_evaluator() {
        let local = LocalEvaluator::default();
        let eval = local.evaluate(BUILT_IN, "return 40 + 2", &[]).await.unwrap();
        assert_eq!(eval.terminal_value, serde_json::json!(42));

        let fault = local.evaluate(BUILT_IN, "throw 'nope'", &[]).await.unwrap_err();
        assert!(matches!(fault, NodeFault::Evaluation { .. }));
    }

    #[tokio::test]
    async fn test_cluster_routes_controller_locally() {
        let cluster = ClusterEvaluator::new(
            LocalEvaluator::default(),
            HttpAgentClient::new(&[], Duration::from_secs(1)).unwrap(),
        );
        let eval = cluster.evaluate("(master)", "return 'here'", &[]).await.unwrap();
        assert_eq!(eval.terminal_value, serde_json::json!("here"));

        let fault = cluster.evaluate("ghost", "return 1", &[]).await.unwrap_err();
        assert_eq!(
            fault,
            NodeFault::UnknownNode {
                node: "ghost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_offline() {
        // nothing listens on the discard port
        let client =
            HttpAgentClient::new(&[endpoint("n1", "http://127.0.0.1:9/")], Duration::from_secs(2))
                .unwrap();
        let fault = client.evaluate("n1", "return 1", &[]).await.unwrap_err();
        assert!(matches!(fault, NodeFault::Offline { .. }), "got {:?}", fault);
    }

    #[test]
    fn test_configured_nodes() {
        let mut config = Config::default();
        config.nodes = vec![endpoint("n1", "http://a"), endpoint("n2", "http://b")];
        assert_eq!(
            ConfiguredNodes::from_config(&config).list_known_nodes(),
            vec!["n1", "n2"]
        );
    }

    #[test]
    fn test_response_from_fault() {
        let response = EvaluateResponse::from(Err(NodeFault::Evaluation {
            message: "Error: boom".to_string(),
        }));
        assert_eq!(response.error.as_deref(), Some("Error: boom"));
    }
}
