//! Integration coverage driving the real `Orchestrator` phase-loop against
//! a scripted stand-in for an agent subprocess, the same config-override
//! mechanism `agent::session`'s own unit tests already rely on (pointing
//! `agent_binary.command` at `cat`, `sleep`, or a missing binary) — here
//! pointed at a tiny shell script that drains stdin and always answers
//! with a fixed, protocol-valid completion payload.

use autonoma::model::Phase;
use autonoma::orchestrator::{CycleOutcome, ExitCode, Orchestrator};
use autonoma::state::StateStore;

/// Drains whatever prompt it was given and answers every turn with the
/// same milestone + batch payload, regardless of which phase asked.
const FAKE_TURN_SCRIPT: &str = r#"cat > /dev/null
printf '%s\n' '=== TASK COMPLETE ===' '```json' '{"milestones":[{"id":"m1","title":"Build feature","description":"Ship the feature."}],"batches":[{"batch_id":"b1","parallel":false,"max_parallel_tasks":null,"description":"Initial batch","tasks":[{"id":"t1","title":"Implement core","description":"Write the core logic.","target_files":null,"complexity":"simple","hint":"Keep it simple."}]}]}' '```'
"#;

fn write_fake_agent_config(working_dir: &std::path::Path) {
    let toml = format!(
        "[agent_binary]\ncommand = \"/bin/sh\"\nargs = [\"-c\", {:?}]\n",
        FAKE_TURN_SCRIPT
    );
    std::fs::write(working_dir.join("autonoma.toml"), toml).unwrap();
}

#[tokio::test]
async fn run_initial_phases_drives_planning_and_task_breakdown_via_a_scripted_agent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("REQUIREMENTS.md"), "Build a thing.").unwrap();
    write_fake_agent_config(dir.path());

    let exit = Orchestrator::run_initial_phases(dir.path().to_path_buf(), "REQUIREMENTS.md".to_string())
        .await
        .unwrap();

    assert_eq!(exit, ExitCode::Complete);

    let store = StateStore::new(dir.path());
    let state = store.load().unwrap();
    assert!(state.has_completed(Phase::Planning));
    assert!(state.has_completed(Phase::TaskBreakdown));
    assert_eq!(state.plan.milestones[0].id, "m1");
    assert_eq!(state.batches[0].tasks[0].id, "t1");
    assert_eq!(state.phase, Phase::Development);
}

#[tokio::test]
async fn run_one_cycle_advances_exactly_one_phase_step_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("REQUIREMENTS.md"), "Build a thing.").unwrap();
    write_fake_agent_config(dir.path());

    // First call only dispatches Idle, which advances to Planning without
    // ever touching the scripted agent.
    let outcome = Orchestrator::run_one_cycle(dir.path().to_path_buf(), "REQUIREMENTS.md".to_string())
        .await
        .unwrap();
    assert_eq!(outcome, CycleOutcome::InProgress);

    let store = StateStore::new(dir.path());
    let state = store.load().unwrap();
    assert_eq!(state.phase, Phase::Planning);
    assert!(!state.has_completed(Phase::Planning));

    // Second call actually runs the CEO turn through the scripted agent.
    let outcome = Orchestrator::run_one_cycle(dir.path().to_path_buf(), "REQUIREMENTS.md".to_string())
        .await
        .unwrap();
    assert_eq!(outcome, CycleOutcome::InProgress);

    let state = store.load().unwrap();
    assert!(state.has_completed(Phase::Planning));
    assert_eq!(state.phase, Phase::TaskBreakdown);
}

#[tokio::test]
async fn a_missing_requirements_document_still_completes_planning_via_the_fallback_milestone() {
    let dir = tempfile::tempdir().unwrap();
    // No REQUIREMENTS.md on disk at all; planning falls back to reading an
    // empty string rather than failing the phase.
    write_fake_agent_config(dir.path());

    let exit = Orchestrator::run_initial_phases(dir.path().to_path_buf(), "REQUIREMENTS.md".to_string())
        .await
        .unwrap();

    assert_eq!(exit, ExitCode::Complete);
}
