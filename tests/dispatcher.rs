//! End-to-end dispatch through real stores and the QuickJS evaluator.

mod common;

use common::TestFleet;
use fleetscript::dispatcher::SEPARATOR;
use fleetscript::nodes::BUILT_IN;
use fleetscript::{CallerContext, ExecutionRequest, ReportStatus};
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn test_hello_runs_on_all_agents() {
    let env = TestFleet::new(&["n1", "n2"], &["n1", "n2"]);
    env.install("hello", "return 1+1");

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("hello.js").on("(all agents)"),
            &CallerContext::operator("op"),
        )
        .await
        .expect("dispatch");

    assert_eq!(report.status, ReportStatus::Completed);
    let nodes: Vec<_> = report.nodes.iter().map(|n| n.node.as_str()).collect();
    assert_eq!(nodes, vec!["n1", "n2"]);
    for node in &report.nodes {
        assert_eq!(node.terminal_value, json!(2));
        assert!(node.error.is_none());
    }
    assert!(report.succeeded());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_all_includes_controller_first() {
    let env = TestFleet::new(&["n1"], &["n1"]);
    env.install("who.js", "out.println('running'); return true");

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("who.js").on("(all)"),
            &CallerContext::operator("op"),
        )
        .await
        .unwrap();

    let nodes: Vec<_> = report.nodes.iter().map(|n| n.node.as_str()).collect();
    assert_eq!(nodes, vec![BUILT_IN, "n1"]);
    assert!(report.nodes.iter().all(|n| n.output == "running\n"));

    let text = report.render_text();
    assert!(text.starts_with(SEPARATOR));
    assert!(text.contains("[(built-in)]:\nrunning\nResult: true\n"));
    assert!(text.trim_end().ends_with(SEPARATOR));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unapproved_script_never_reaches_a_node() {
    let env = TestFleet::new(&["n1", "n2"], &["n1", "n2"]);
    let maintainer = CallerContext::maintainer("dev");
    env.fleet
        .manager
        .save_script(
            &maintainer,
            fleetscript::ScriptDraft::new("fresh.js", "return 'unreviewed'"),
        )
        .unwrap();

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("fresh.js").on("(all)"),
            &maintainer,
        )
        .await
        .unwrap();

    assert_eq!(report.status, ReportStatus::NotApproved);
    assert!(report.nodes.is_empty());
    assert_eq!(env.evaluator.total_calls(), 0);
    assert_eq!(env.fleet.manager.pending_approvals().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_edited_body_needs_new_approval() {
    let env = TestFleet::new(&[], &[]);
    env.install("edit.js", "return 1");
    let operator = CallerContext::operator("op");

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("edit.js").with_body("return 2"),
            &operator,
        )
        .await
        .unwrap();
    assert_eq!(report.status, ReportStatus::NotApproved);

    let report = env
        .fleet
        .dispatcher
        .run(ExecutionRequest::for_script("edit.js"), &operator)
        .await
        .unwrap();
    assert_eq!(report.status, ReportStatus::Completed);
    assert_eq!(report.nodes[0].terminal_value, json!(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_missing_from_cluster_gets_error() {
    // the directory still lists n3 but it is gone
    let env = TestFleet::new(&["n1", "n3", "n2"], &["n1", "n2"]);
    env.install("ping.js", "return 'pong'");

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("ping.js").on("(all agents)"),
            &CallerContext::operator("op"),
        )
        .await
        .unwrap();

    assert_eq!(report.nodes.len(), 3);
    assert_eq!(report.nodes[0].terminal_value, json!("pong"));
    assert!(!report.nodes[1].error.clone().unwrap_or_default().is_empty());
    assert_eq!(report.nodes[2].terminal_value, json!("pong"));
    assert_eq!(env.evaluator.calls_for("n3"), 1);
    assert!(!report.succeeded());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parameters_reach_the_script() {
    let env = TestFleet::new(&[], &[]);
    let admin = CallerContext::admin("root");
    let mut draft = fleetscript::ScriptDraft::new("greet.js", "return greeting + ', ' + who");
    draft.parameters = vec![
        fleetscript::Parameter::new("greeting", "hello"),
        fleetscript::Parameter::new("who", "world"),
    ];
    env.fleet.manager.save_script(&admin, draft).unwrap();

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("greet.js").with_parameter("who", "fleet"),
            &admin,
        )
        .await
        .unwrap();

    // an approver's own run approves the body on the spot
    assert_eq!(report.status, ReportStatus::Completed);
    assert_eq!(report.nodes[0].terminal_value, json!("hello, fleet"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_throwing_is_reported_per_node() {
    let env = TestFleet::new(&["n1"], &["n1"]);
    env.install("boom.js", "out.println('start'); throw new Error('kaboom')");

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("boom.js").on("n1"),
            &CallerContext::operator("op"),
        )
        .await
        .unwrap();

    assert_eq!(report.nodes.len(), 1);
    let error = report.nodes[0].error.clone().unwrap();
    assert!(error.contains("kaboom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_source_is_unavailable() {
    let env = TestFleet::new(&[], &[]);
    env.install("vanish.js", "return 1");
    std::fs::remove_file(env.config.scripts_dir().join("vanish.js")).unwrap();

    let report = env
        .fleet
        .manager
        .synchronize()
        .expect("synchronize");
    assert_eq!(report.marked_unavailable, vec!["vanish.js"]);

    let report = env
        .fleet
        .dispatcher
        .run(
            ExecutionRequest::for_script("vanish.js"),
            &CallerContext::operator("op"),
        )
        .await
        .unwrap();
    assert_eq!(report.status, ReportStatus::Unavailable);
    assert_eq!(env.evaluator.total_calls(), 0);
}
