use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod js_engine;
pub mod manager;
pub mod nodes;
pub mod registry;
pub mod repository;
pub mod script;
pub mod security;

pub use agent::{serve_agent, start_agent_with_config};
pub use config::Config;
pub use dispatcher::{
    ExecutionDispatcher, ExecutionMode, ExecutionReport, ExecutionRequest, NodeOutput,
    ReportStatus,
};
pub use error::{AppError, AppResult};
pub use evaluator::{Evaluation, NodeFault, RemoteEvaluator};
pub use manager::{ScriptDraft, ScriptManager};
pub use nodes::{NodeDirectory, NodeResolver};
pub use registry::{ReconcileReport, ScriptRegistry};
pub use script::{Parameter, ScriptRecord};
pub use security::{ApprovalGate, CallerContext, Capability, PrivilegeCheck};

/// Install the global subscriber. `RUST_LOG` wins over the `info` default.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
    };
}

/// The controller's components, wired from one configuration.
#[derive(Debug)]
pub struct Fleet {
    pub registry: Arc<ScriptRegistry>,
    pub gate: Arc<ApprovalGate>,
    pub manager: ScriptManager,
    pub dispatcher: ExecutionDispatcher,
    /// What the startup reconciliation changed
    pub startup: ReconcileReport,
}

impl Fleet {
    /// Open the stores under `config.home_dir`, reconcile the registry with the script
    /// directory and dispatch through `evaluator`.
    pub fn open_with(
        config: &Config,
        directory: Arc<dyn NodeDirectory>,
        evaluator: Arc<dyn RemoteEvaluator>,
    ) -> AppResult<Self> {
        let content: Arc<dyn repository::ContentStore> = Arc::new(
            repository::FsContentStore::open(config.scripts_dir(), &config.script_extension)?,
        );
        let metadata = Arc::new(repository::JsonMetadataStore::new(config.registry_path()));
        let approvals = Arc::new(security::JsonApprovalStore::new(config.approvals_path()));

        let registry = Arc::new(ScriptRegistry::load(metadata, content.clone())?);
        let gate = Arc::new(ApprovalGate::load(approvals)?);
        let manager = ScriptManager::new(
            registry.clone(),
            content,
            gate.clone(),
            &config.script_extension,
        );
        let dispatcher =
            ExecutionDispatcher::new(registry.clone(), gate.clone(), directory, evaluator)
                .with_max_parallel(config.max_parallel_dispatch)
                .with_node_timeout(config.node_timeout());
        let startup = manager.synchronize()?;

        info!(
            home = %config.home_dir.display(),
            scripts = registry.len(),
            nodes = config.nodes.len(),
            "Controller ready"
        );
        Ok(Self {
            registry,
            gate,
            manager,
            dispatcher,
            startup,
        })
    }

    /// Open with the configured agents and local evaluation for the controller.
    pub fn open(config: &Config) -> AppResult<Self> {
        Self::open_with(
            config,
            Arc::new(evaluator::ConfiguredNodes::from_config(config)),
            Arc::new(evaluator::ClusterEvaluator::from_config(config)?),
        )
    }
}
