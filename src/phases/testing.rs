//! Testing: runs the project's configured build/test/lint/type-check
//! commands via [`Verifier`] and records the aggregate result.

use crate::errors::PhaseError;
use crate::model::Phase;
use crate::verifier::{all_required_passed, default_commands, Verifier};

use super::{PhaseContext, PhaseOutcome};

const PHASE_NAME: &str = "testing";

pub async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, PhaseError> {
    let verifier = Verifier::new(ctx.config, ctx.working_dir.clone());
    let results = verifier.run_all(&default_commands()).await;

    let summary = results
        .iter()
        .map(|r| format!("{:?}: {}", r.criterion, if r.passed { "pass" } else { "fail" }))
        .collect::<Vec<_>>()
        .join("\n");
    ctx.state.last_test_output = Some(summary.clone());

    let _ = ctx.db.record_event(
        "testing_result",
        &serde_json::json!({ "passed": all_required_passed(&results) }),
    );

    if all_required_passed(&results) {
        ctx.state.complete_phase(Phase::Testing);
        Ok(PhaseOutcome::Advance)
    } else {
        let failing_task_id = ctx.state.current_tasks_in_progress.first().cloned();
        if let Some(task_id) = failing_task_id {
            ctx.retry_contexts.record_failure(&task_id, "verification failed", results);
        }
        Ok(PhaseOutcome::Continue)
    }
}
