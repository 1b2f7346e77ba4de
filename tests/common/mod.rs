#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetscript::config::{Config, NodeEndpoint};
use fleetscript::evaluator::LocalEvaluator;
use fleetscript::nodes::{BUILT_IN, StaticNodeDirectory};
use fleetscript::{
    CallerContext, Evaluation, Fleet, NodeFault, Parameter, RemoteEvaluator, ScriptDraft,
    start_agent_with_config,
};
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Evaluates locally on behalf of a fixed set of nodes and counts calls per node.
pub struct CountingEvaluator {
    nodes: Vec<String>,
    local: LocalEvaluator,
    calls: Mutex<BTreeMap<String, usize>>,
}

impl CountingEvaluator {
    pub fn new(nodes: &[&str]) -> Self {
        Self {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            local: LocalEvaluator::default(),
            calls: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn calls_for(&self, node: &str) -> usize {
        self.calls.lock().unwrap().get(node).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteEvaluator for CountingEvaluator {
    async fn evaluate(
        &self,
        node: &str,
        body: &str,
        parameters: &[Parameter],
    ) -> Result<Evaluation, NodeFault> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default() += 1;
        if node != BUILT_IN && !self.nodes.iter().any(|n| n == node) {
            return Err(NodeFault::UnknownNode {
                node: node.to_string(),
            });
        }
        self.local.run(body, parameters).await
    }
}

/// A controller rooted in a temporary directory.
pub struct TestFleet {
    pub dir: TempDir,
    pub config: Config,
    pub fleet: Fleet,
    pub evaluator: Arc<CountingEvaluator>,
}

impl TestFleet {
    /// `directory` is what the node directory reports; `reachable` is what the evaluator
    /// can actually run on.
    pub fn new(directory: &[&str], reachable: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::test_config(dir.path());
        let evaluator = Arc::new(CountingEvaluator::new(reachable));
        let fleet = Fleet::open_with(
            &config,
            Arc::new(StaticNodeDirectory::new(directory.iter().copied())),
            evaluator.clone(),
        )
        .expect("open fleet");
        Self {
            dir,
            config,
            fleet,
            evaluator,
        }
    }

    /// Reopen the stores from disk, as a restart would.
    pub fn reopen(&self) -> Fleet {
        Fleet::open_with(
            &self.config,
            Arc::new(StaticNodeDirectory::default()),
            self.evaluator.clone(),
        )
        .expect("reopen fleet")
    }

    /// Save and approve a script in one go.
    pub fn install(&self, id: &str, body: &str) -> String {
        let admin = CallerContext::admin("root");
        let id = self
            .fleet
            .manager
            .save_script(&admin, ScriptDraft::new(id, body))
            .expect("save script");
        let hash = fleetscript::security::hash_body(body);
        self.fleet.manager.approve(&admin, &hash).expect("approve");
        id
    }
}

/// Agent endpoint on an ephemeral port, stopped on drop.
pub struct TestAgent {
    port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestAgent {
    pub async fn start() -> anyhow::Result<Self> {
        let config = Config::test_config(std::env::temp_dir());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let port = start_agent_with_config(config, shutdown_rx).await?;
        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn endpoint(&self, name: &str) -> NodeEndpoint {
        NodeEndpoint {
            name: name.to_string(),
            url: self.url(),
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
