//! Registry and approval state on the filesystem stores.

mod common;

use std::fs;

use common::TestFleet;
use fleetscript::security::{ApprovalState, hash_body};
use fleetscript::{CallerContext, ScriptDraft, ScriptRecord};

#[test]
fn test_registry_survives_restart() {
    let env = TestFleet::new(&[], &[]);
    let admin = CallerContext::admin("root");
    let mut draft = ScriptDraft::new("backup", "return 'ok'");
    draft.comment = "nightly backup".to_string();
    draft.only_controller_node = true;
    env.fleet.manager.save_script(&admin, draft).unwrap();

    let reopened = env.reopen();
    let record = reopened.registry.get_by_id("backup.js").expect("persisted");
    assert_eq!(record.comment, "nightly backup");
    assert!(record.only_controller_node);
    assert!(record.body.is_none());

    let with_body = reopened.registry.get_with_body("backup.js").unwrap();
    assert_eq!(with_body.body.as_deref(), Some("return 'ok'"));
}

#[test]
fn test_dropped_in_files_are_discovered_with_meta() {
    let env = TestFleet::new(&[], &[]);
    let scripts = env.config.scripts_dir();
    fs::write(
        scripts.join("disk.js"),
        "/*\nBEGIN META\n{\"name\": \"Disk report\", \"comment\": \"df per node\", \"parameters\": [\"mount\"]}\nEND META\n*/\nreturn mount;",
    )
    .unwrap();
    fs::write(scripts.join("plain.js"), "return 0").unwrap();
    fs::write(scripts.join("README.txt"), "not a script").unwrap();

    let report = env.fleet.manager.synchronize().unwrap();
    assert_eq!(report.added, vec!["disk.js", "plain.js"]);

    let disk = env.fleet.registry.get_by_id("disk.js").unwrap();
    assert_eq!(disk.display_name, "Disk report");
    assert_eq!(disk.comment, "df per node");
    assert_eq!(disk.parameters[0].name, "mount");

    let plain = env.fleet.registry.get_by_id("plain.js").unwrap();
    assert_eq!(plain.comment, "script loaded from directory");
    assert!(env.fleet.registry.get_by_id("README.txt").is_none());

    // both bodies now wait for review
    assert_eq!(env.fleet.gate.state_of("return 0"), Some(ApprovalState::Pending));

    // nothing changes on a second pass
    assert!(env.fleet.manager.synchronize().unwrap().is_empty());
}

#[test]
fn test_returning_file_is_restored() {
    let env = TestFleet::new(&[], &[]);
    env.install("flaky.js", "return 1");
    let path = env.config.scripts_dir().join("flaky.js");

    fs::remove_file(&path).unwrap();
    env.fleet.manager.synchronize().unwrap();
    assert!(!env.fleet.registry.get_by_id("flaky.js").unwrap().available);

    fs::write(&path, "return 1").unwrap();
    let report = env.fleet.manager.synchronize().unwrap();
    assert_eq!(report.restored, vec!["flaky.js"]);
    assert!(env.fleet.registry.get_by_id("flaky.js").unwrap().available);
}

#[test]
fn test_approval_decisions_survive_restart() {
    let env = TestFleet::new(&[], &[]);
    let admin = CallerContext::admin("root");
    env.fleet
        .manager
        .save_script(&admin, ScriptDraft::new("a.js", "return 'a'"))
        .unwrap();
    env.fleet
        .manager
        .save_script(&admin, ScriptDraft::new("b.js", "return 'b'"))
        .unwrap();
    env.fleet
        .manager
        .approve(&admin, &hash_body("return 'a'"))
        .unwrap();
    env.fleet
        .manager
        .reject(&admin, &hash_body("return 'b'"))
        .unwrap();

    let reopened = env.reopen();
    assert_eq!(reopened.gate.state_of("return 'a'"), Some(ApprovalState::Approved));
    assert_eq!(reopened.gate.state_of("return 'b'"), Some(ApprovalState::Rejected));
    assert!(reopened.manager.pending_approvals().is_empty());
}

#[test]
fn test_same_body_shares_approval_across_ids() {
    let env = TestFleet::new(&[], &[]);
    env.install("one.js", "return 'same'");
    let admin = CallerContext::admin("root");
    env.fleet
        .manager
        .save_script(&admin, ScriptDraft::new("two.js", "return 'same'"))
        .unwrap();
    assert!(env.fleet.manager.pending_approvals().is_empty());
}

#[test]
fn test_merge_keeps_stored_text_for_blank_fields() {
    let env = TestFleet::new(&[], &[]);
    env.fleet
        .registry
        .add_or_replace(
            ScriptRecord::new("m.js")
                .with_display_name("Maintenance")
                .with_comment("weekly")
                .restricted(true),
        )
        .unwrap();

    let merged = env
        .fleet
        .registry
        .add_or_replace(ScriptRecord::new("m.js").with_display_name("").with_comment(""))
        .unwrap();
    assert_eq!(merged.display_name, "Maintenance");
    assert_eq!(merged.comment, "weekly");
    assert!(!merged.restricted_to_privileged_users);
}

#[test]
fn test_restart_reconciles_with_script_directory() {
    let env = TestFleet::new(&[], &[]);
    env.install("kept.js", "return 'kept'");
    let scripts = env.config.scripts_dir();
    fs::write(scripts.join("dropped.js"), "return 'dropped'").unwrap();
    fs::remove_file(scripts.join("kept.js")).unwrap();

    let reopened = env.reopen();
    assert_eq!(reopened.startup.added, vec!["dropped.js"]);
    assert_eq!(reopened.startup.marked_unavailable, vec!["kept.js"]);

    let dropped = reopened.registry.get_by_id("dropped.js").expect("discovered on open");
    assert!(dropped.available);
    assert!(!reopened.registry.get_by_id("kept.js").unwrap().available);
    assert_eq!(
        reopened.gate.state_of("return 'dropped'"),
        Some(ApprovalState::Pending)
    );
}
