//! HTTP endpoint through which an agent node evaluates scripts for the controller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use axum_server::Handle;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::evaluator::{EvaluateRequest, EvaluateResponse, LocalEvaluator, NodeFault};

#[derive(Debug, Clone)]
struct AgentState {
    evaluator: LocalEvaluator,
    timeout: Duration,
}

/// Routes served by an agent
pub fn router(evaluator: LocalEvaluator, timeout: Duration) -> Router {
    Router::new()
        .route("/evaluate", post(evaluate))
        .route("/health", get(health))
        .with_state(Arc::new(AgentState { evaluator, timeout }))
}

async fn evaluate(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<EvaluateRequest>,
) -> Json<EvaluateResponse> {
    debug!(
        "Evaluating script of {} byte(s) with {} parameter(s)",
        request.body.len(),
        request.parameters.len()
    );
    let result = match tokio::time::timeout(
        state.timeout,
        state.evaluator.run(&request.body, &request.parameters),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!("Script evaluation timed out after {:?}", state.timeout);
            Err(NodeFault::Timeout {
                millis: state.timeout.as_millis() as u64,
            })
        }
    };
    Json(EvaluateResponse::from(result))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serve the agent endpoint until `shutdown_rx` fires.
pub async fn serve_agent(
    config: Config,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .agent_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid agent address: {}", e))?;

    let app = router(LocalEvaluator::default(), config.node_timeout());
    info!("agent listening on {}", addr);
    let server = axum_server::bind(addr).serve(app.into_make_service());

    tokio::select! {
        res = server => { res? },
        _ = &mut shutdown_rx => { info!("agent shutting down") }
    }
    Ok(())
}

/// Start the agent in the background and return the port it bound, which matters when the
/// configured port is 0.
pub async fn start_agent_with_config(
    config: Config,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<u16> {
    let addr: SocketAddr = config
        .agent_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid agent address: {}", e))?;

    let app = router(LocalEvaluator::default(), config.node_timeout());
    let handle: Handle<SocketAddr> = Handle::new();
    let server_handle = handle.clone();

    tokio::spawn(async move {
        let server = axum_server::bind(addr)
            .handle(server_handle)
            .serve(app.into_make_service());
        if let Err(e) = server.await {
            warn!("agent server stopped: {}", e);
        }
    });

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown_rx.await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(1)));
    });

    let bound = handle
        .listening()
        .await
        .ok_or_else(|| anyhow::anyhow!("agent failed to bind {}", addr))?;
    info!("agent listening on {}", bound);
    Ok(bound.port())
}
