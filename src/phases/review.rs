//! Review: a QA agent inspects the completed batches for correctness and
//! quality, running up to two rounds before the phase gives up and escalates
//! to a human once review/retry exhaustion is reached.

use serde::Deserialize;

use crate::errors::{PhaseError, ProtocolError};
use crate::model::{Phase, Role, WorkStatus};
use crate::protocol::ProtocolParser;

use super::{run_turn_with_handoff, PhaseContext, PhaseOutcome};

const PHASE_NAME: &str = "review";
const MAX_REVIEW_ROUNDS: u32 = 2;

/// Unstructured QA output (no `overallStatus` discriminator found) is
/// treated as a pass — an agent that just narrates its
/// findings in prose rather than emitting the structured block shouldn't
/// block the pipeline on a parse failure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum OverallStatus {
    Pass,
    Fail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReviewVerdict {
    overall_status: OverallStatus,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    failed_tasks: Vec<FailedTask>,
}

#[derive(Debug, Deserialize)]
struct FailedTask {
    id: String,
    #[serde(default)]
    reason: String,
}

pub async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, PhaseError> {
    let round = ctx.state.review_rounds;

    let completed_summary = ctx
        .state
        .batches
        .iter()
        .flat_map(|b| &b.tasks)
        .filter(|t| t.status == WorkStatus::Complete)
        .map(|t| format!("- {}: {}", t.id, t.title))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "You are the QA reviewer. Examine the working directory's current state against the \
         following completed tasks, run a typecheck, and judge whether the implementation is \
         correct and complete. Respond with '=== TASK COMPLETE ===' followed by a fenced JSON \
         block of the shape {{\"overallStatus\": \"PASS\"|\"FAIL\", \"summary\": str, \
         \"failedTasks\": [{{\"id\": str, \"reason\": str}}]}}.\n\n\
         Completed tasks:\n{completed_summary}"
    );

    let (raw_output, _next_qa_id) =
        run_turn_with_handoff(ctx, PHASE_NAME, Role::Qa, "QA", prompt).await?;

    let verdict = match ProtocolParser::extract_json::<RawReviewVerdict>(&raw_output, None) {
        Ok(v) => v,
        Err(ProtocolError::NoJsonFound) => {
            ctx.state.last_qa_output = Some("unstructured QA output treated as pass".to_string());
            ctx.state.review_rounds = 0;
            ctx.state.complete_phase(Phase::Review);
            return Ok(PhaseOutcome::Advance);
        }
        Err(source) => {
            return Err(PhaseError::Protocol {
                phase: PHASE_NAME.to_string(),
                source,
            })
        }
    };

    ctx.state.last_qa_output = Some(verdict.summary.clone());

    if matches!(verdict.overall_status, OverallStatus::Pass) {
        ctx.state.review_rounds = 0;
        ctx.state.complete_phase(Phase::Review);
        return Ok(PhaseOutcome::Advance);
    }

    ctx.state.review_rounds += 1;

    // Selective retry: only requeue the tasks QA actually flagged, and only
    // those still within their own per-task retry budget.
    let mut any_requeued = false;
    for batch in &mut ctx.state.batches {
        for task in &mut batch.tasks {
            let Some(failed) = verdict.failed_tasks.iter().find(|f| f.id == task.id) else {
                continue;
            };
            if task.status != WorkStatus::Complete {
                continue;
            }
            if task.can_retry() {
                task.retry_count += 1;
                task.status = WorkStatus::Pending;
                task.last_failure_reason = Some(failed.reason.clone());
                any_requeued = true;
            } else {
                task.status = WorkStatus::Failed;
                task.last_failure_reason = Some(failed.reason.clone());
            }
        }
    }

    let rounds_exhausted = ctx.state.review_rounds >= MAX_REVIEW_ROUNDS;
    if rounds_exhausted || !any_requeued {
        let question = format!(
            "QA review failed after {} round(s): {}. Failing tasks: {}",
            ctx.state.review_rounds,
            verdict.summary,
            verdict
                .failed_tasks
                .iter()
                .map(|f| f.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let _ = ctx.db.enqueue_human_question(PHASE_NAME, None, &question);
        return Err(PhaseError::Blocked {
            phase: PHASE_NAME.to_string(),
            reason: question,
        });
    }

    for batch in &mut ctx.state.batches {
        batch.recompute_status();
    }
    ctx.state.current_batch_index = 0;
    Ok(PhaseOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_verdict_parses_pass_with_empty_failed_tasks() {
        let verdict: RawReviewVerdict =
            serde_json::from_str(r#"{"overallStatus": "PASS"}"#).unwrap();
        assert!(matches!(verdict.overall_status, OverallStatus::Pass));
        assert!(verdict.failed_tasks.is_empty());
    }

    #[test]
    fn raw_verdict_parses_fail_with_failed_task_list() {
        let verdict: RawReviewVerdict = serde_json::from_str(
            r#"{"overallStatus": "FAIL", "summary": "bugs", "failedTasks": [{"id": "t1", "reason": "off by one"}]}"#,
        )
        .unwrap();
        assert!(matches!(verdict.overall_status, OverallStatus::Fail));
        assert_eq!(verdict.failed_tasks.len(), 1);
        assert_eq!(verdict.failed_tasks[0].id, "t1");
    }

    #[test]
    fn protocol_error_not_found_is_distinct_from_missing_field() {
        let err = ProtocolError::NoJsonFound;
        assert!(matches!(err, ProtocolError::NoJsonFound));
    }
}
